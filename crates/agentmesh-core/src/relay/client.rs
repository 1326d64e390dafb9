//! Signed relay API client
//!
//! Every authenticated request carries `Authorization: Signature
//! <agent>:<base64-sig>` and `X-Timestamp`, with the signature computed over
//!
//! ```text
//! {METHOD} {PATH}\n{timestamp}\n{sha256hex(body)}
//! ```
//!
//! where `PATH` excludes any query string and the body hash is over the raw
//! request bytes (the hash of the empty string for bodyless requests).
//!
//! Failures are classified by HTTP status so the community manager can feed
//! its failover accounting: status `0` marks a network-level failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::MeshError;
use crate::identity::AgentKeypair;

use super::types::*;

/// Error from a relay API call, carrying the HTTP status for failover
/// accounting. Status `0` means the request never produced a response.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    /// Seconds until a tripped rate limit resets, from `X-RateLimit-Reset`
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    fn network(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Network errors and 5xx responses feed retry and failover accounting.
    pub fn is_transient(&self) -> bool {
        self.status == 0 || self.status >= 500
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relay call failed (status {}): {}", self.status, self.message)
    }
}

impl From<ApiError> for MeshError {
    fn from(err: ApiError) -> Self {
        match err.status {
            0 => MeshError::Transport(err.message),
            s if s >= 500 => MeshError::Transport(err.message),
            401 | 403 => MeshError::Auth(err.message),
            404 => MeshError::NotFound(err.message),
            409 => MeshError::Conflict(err.message),
            429 => MeshError::RateLimited {
                retry_after_secs: err.retry_after_secs.unwrap_or(60),
            },
            _ => MeshError::Validation(err.message),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// HTTP client bound to one relay base URL and one signing identity.
#[derive(Clone)]
pub struct RelayClient {
    base_url: String,
    username: String,
    keypair: Arc<AgentKeypair>,
    http: Client,
}

impl RelayClient {
    /// Build a client for the given relay.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the underlying HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        keypair: Arc<AgentKeypair>,
        timeout: Duration,
    ) -> Result<Self, MeshError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MeshError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            keypair,
            http,
        })
    }

    /// The relay base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn sign_request(&self, method: &Method, path: &str, timestamp: &str, body: &[u8]) -> String {
        let body_hash = hex::encode(Sha256::digest(body));
        let signing_string = format!("{method} {path}\n{timestamp}\n{body_hash}");
        self.keypair.sign_base64(signing_string.as_bytes())
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, &str)]>,
        body: Option<&B>,
    ) -> ApiResult<T> {
        let body_bytes = match body {
            Some(b) => serde_json::to_vec(b)
                .map_err(|e| ApiError::network(format!("request serialization failed: {e}")))?,
            None => Vec::new(),
        };

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let signature = self.sign_request(&method, path, &timestamp, &body_bytes);

        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method.clone(), &url)
            .header(
                "Authorization",
                format!("Signature {}:{}", self.username, signature),
            )
            .header("X-Timestamp", &timestamp);
        if let Some(query) = query {
            builder = builder.query(query);
        }
        if body.is_some() {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body_bytes);
        }

        debug!(%method, path, "relay request");

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ApiError::network(format!("response decoding failed: {e}")));
        }

        let retry_after_secs = if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers()
                .get("X-RateLimit-Reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        } else {
            None
        };

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => format!("relay returned {status}"),
        };

        Err(ApiError {
            status: status.as_u16(),
            message,
            retry_after_secs,
        })
    }

    // -- Registry ----------------------------------------------------------

    pub async fn register(&self, request: &RegisterRequest) -> ApiResult<AgentInfo> {
        self.request(Method::POST, "/registry/agents", None, Some(request))
            .await
    }

    pub async fn get_agent(&self, name: &str) -> ApiResult<AgentInfo> {
        self.request::<(), _>(Method::GET, &format!("/registry/agents/{name}"), None, None)
            .await
    }

    // -- Contacts ----------------------------------------------------------

    pub async fn request_contact(&self, body: &ContactRequestBody) -> ApiResult<OkResponse> {
        self.request(Method::POST, "/contacts/request", None, Some(body))
            .await
    }

    pub async fn pending_contacts(&self) -> ApiResult<Vec<PendingContactInfo>> {
        self.request::<(), _>(Method::GET, "/contacts/pending", None, None)
            .await
    }

    pub async fn accept_contact(&self, agent: &str) -> ApiResult<OkResponse> {
        self.request::<(), _>(Method::POST, &format!("/contacts/{agent}/accept"), None, None)
            .await
    }

    pub async fn deny_contact(&self, agent: &str) -> ApiResult<OkResponse> {
        self.request::<(), _>(Method::POST, &format!("/contacts/{agent}/deny"), None, None)
            .await
    }

    pub async fn remove_contact(&self, agent: &str) -> ApiResult<OkResponse> {
        self.request::<(), _>(Method::DELETE, &format!("/contacts/{agent}"), None, None)
            .await
    }

    pub async fn list_contacts(&self) -> ApiResult<Vec<ContactInfo>> {
        self.request::<(), _>(Method::GET, "/contacts", None, None)
            .await
    }

    // -- Presence ----------------------------------------------------------

    pub async fn heartbeat(&self, endpoint: &str) -> ApiResult<OkResponse> {
        let body = HeartbeatRequest {
            endpoint: endpoint.to_string(),
        };
        self.request(Method::PUT, "/presence", None, Some(&body)).await
    }

    pub async fn get_presence(&self, agent: &str) -> ApiResult<PresenceInfo> {
        self.request::<(), _>(Method::GET, &format!("/presence/{agent}"), None, None)
            .await
    }

    pub async fn get_presence_batch(&self, agents: &[String]) -> ApiResult<Vec<PresenceInfo>> {
        let joined = agents.join(",");
        self.request::<(), _>(
            Method::GET,
            "/presence/batch",
            Some(&[("agents", joined.as_str())]),
            None,
        )
        .await
    }

    // -- Email verification ------------------------------------------------

    pub async fn verify_send(&self, body: &VerifySendRequest) -> ApiResult<OkResponse> {
        self.request(Method::POST, "/verify/send", None, Some(body))
            .await
    }

    pub async fn verify_confirm(&self, body: &VerifyConfirmRequest) -> ApiResult<OkResponse> {
        self.request(Method::POST, "/verify/confirm", None, Some(body))
            .await
    }

    // -- Admin -------------------------------------------------------------

    pub async fn admin_keys(&self) -> ApiResult<Vec<AdminKeyInfo>> {
        self.request::<(), _>(Method::GET, "/admin/keys", None, None)
            .await
    }

    pub async fn broadcasts(&self) -> ApiResult<Vec<BroadcastRecord>> {
        self.request::<(), _>(Method::GET, "/admin/broadcasts", None, None)
            .await
    }

    /// Approve a pending agent. The caller signs with an admin keypair.
    pub async fn approve_agent(&self, name: &str) -> ApiResult<OkResponse> {
        self.request::<(), _>(
            Method::POST,
            &format!("/registry/agents/{name}/approve"),
            None,
            None,
        )
        .await
    }

    /// Revoke an agent. `body.signature` covers the canonical revocation
    /// payload; the request itself is signed with the admin keypair.
    pub async fn revoke_agent(&self, name: &str, body: &RevokeRequest) -> ApiResult<OkResponse> {
        self.request(
            Method::POST,
            &format!("/registry/agents/{name}/revoke"),
            None,
            Some(body),
        )
        .await
    }

    /// Store a broadcast. Admin only.
    pub async fn create_broadcast(
        &self,
        body: &BroadcastCreateRequest,
    ) -> ApiResult<BroadcastRecord> {
        self.request(Method::POST, "/admin/broadcast", None, Some(body))
            .await
    }

    /// Agents awaiting approval. Admin only.
    pub async fn pending_agents(&self) -> ApiResult<Vec<AgentInfo>> {
        self.request::<(), _>(Method::GET, "/admin/pending", None, None)
            .await
    }

    // -- Keys --------------------------------------------------------------

    pub async fn rotate_key(&self, new_public_key: &str) -> ApiResult<OkResponse> {
        let body = RotateKeyRequest {
            new_public_key: new_public_key.to_string(),
        };
        self.request(Method::POST, "/keys/rotate", None, Some(&body))
            .await
    }

    pub async fn recover_key(&self, body: &RecoverKeyRequest) -> ApiResult<OkResponse> {
        self.request(Method::POST, "/keys/recover", None, Some(body))
            .await
    }

    pub async fn recover_confirm(&self, body: &RecoverConfirmRequest) -> ApiResult<RecoveryStatus> {
        self.request(Method::POST, "/keys/recover/confirm", None, Some(body))
            .await
    }

    // -- Groups ------------------------------------------------------------

    pub async fn get_group(&self, group_id: &str) -> ApiResult<GroupInfo> {
        self.request::<(), _>(Method::GET, &format!("/groups/{group_id}"), None, None)
            .await
    }

    pub async fn group_members(&self, group_id: &str) -> ApiResult<Vec<GroupMemberInfo>> {
        self.request::<(), _>(Method::GET, &format!("/groups/{group_id}/members"), None, None)
            .await
    }

    pub async fn create_group(&self, body: &CreateGroupRequest) -> ApiResult<GroupInfo> {
        self.request(Method::POST, "/groups", None, Some(body)).await
    }

    pub async fn invite_to_group(
        &self,
        group_id: &str,
        body: &GroupInviteRequest,
    ) -> ApiResult<OkResponse> {
        self.request(Method::POST, &format!("/groups/{group_id}/invite"), None, Some(body))
            .await
    }

    pub async fn accept_group_invitation(&self, group_id: &str) -> ApiResult<OkResponse> {
        self.request::<(), _>(Method::POST, &format!("/groups/{group_id}/accept"), None, None)
            .await
    }

    pub async fn group_changes(&self, group_id: &str, since: &str) -> ApiResult<Vec<GroupChange>> {
        self.request::<(), _>(
            Method::GET,
            &format!("/groups/{group_id}/changes"),
            Some(&[("since", since)]),
            None,
        )
        .await
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
