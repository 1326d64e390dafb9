//! Full-stack messaging scenarios: two client engines, a real relay, and
//! real HTTPS-shaped inboxes (plain HTTP on loopback). Exercises the whole
//! path: onboarding → contact handshake → presence → encrypt → direct
//! delivery → receive pipeline → event emit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tempfile::TempDir;

use agentmesh_core::community::RelayRole;
use agentmesh_core::relay::{RegisterRequest, VerifyConfirmRequest, VerifySendRequest};
use agentmesh_core::{
    CommunityConfig, Envelope, MeshConfig, MeshEngine, MeshEvent, SendStatus,
};
use agentmesh_core::identity::AgentKeypair;
use agentmesh_relay::db::admins;
use agentmesh_relay::email::{CapturingCodeSender, CodeSender};
use agentmesh_relay::{router, AppState, RelayConfig};

struct TestRelay {
    base_url: String,
    state: AppState,
    mailer: Arc<CapturingCodeSender>,
}

async fn spawn_relay() -> TestRelay {
    let mailer = Arc::new(CapturingCodeSender::new());
    let state = AppState::new(RelayConfig::for_tests(), mailer.clone() as Arc<dyn CodeSender>)
        .unwrap();
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    TestRelay {
        base_url: format!("http://{addr}"),
        state,
        mailer,
    }
}

async fn inbox_handler(
    State(engine): State<Arc<MeshEngine>>,
    Json(envelope): Json<Envelope>,
) -> StatusCode {
    match engine.receive_envelope(envelope).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

/// Register an agent, approve it, and stand up its engine plus inbox.
async fn spawn_agent(
    relay: &TestRelay,
    admin: &AgentKeypair,
    name: &str,
    dir: &TempDir,
) -> Arc<MeshEngine> {
    let keypair = AgentKeypair::generate();
    let email = format!("{name}@example.org");

    // Onboarding through the real API
    let api = agentmesh_core::relay::RelayClient::new(
        &relay.base_url,
        name,
        Arc::new(keypair.clone()),
        Duration::from_secs(5),
    )
    .unwrap();
    api.verify_send(&VerifySendRequest {
        username: name.to_string(),
        email: email.clone(),
    })
    .await
    .unwrap();
    let code = relay.mailer.last_code_for(&email).unwrap();
    api.verify_confirm(&VerifyConfirmRequest {
        username: name.to_string(),
        code,
    })
    .await
    .unwrap();
    api.register(&RegisterRequest {
        name: name.to_string(),
        public_key: keypair.public_key().to_spki_base64(),
        owner_email: email,
        endpoint: "https://placeholder.invalid/inbox".to_string(),
    })
    .await
    .unwrap();
    let admin_api = agentmesh_core::relay::RelayClient::new(
        &relay.base_url,
        "admin",
        Arc::new(admin.clone()),
        Duration::from_secs(5),
    )
    .unwrap();
    admin_api.approve_agent(name).await.unwrap();

    // Bind the inbox first so the engine can advertise its real URL
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let inbox_url = format!("http://{}/inbox", listener.local_addr().unwrap());

    let config = MeshConfig {
        username: name.to_string(),
        private_key: keypair.to_pkcs8_base64(),
        endpoint: inbox_url,
        data_dir: dir.path().join(name),
        communities: vec![CommunityConfig {
            name: "home".to_string(),
            api: relay.base_url.clone(),
            failover_api: None,
            private_key: None,
        }],
        heartbeat_interval_secs: 300,
        failover_threshold: 3,
        startup_failover_threshold: 3,
        retry_queue_max: 100,
        delivery_timeout_secs: 5,
        relay_timeout_secs: 5,
        cache_stale_secs: 0,
    };
    let engine = Arc::new(MeshEngine::new(config).unwrap());

    let app = Router::new()
        .route("/inbox", post(inbox_handler))
        .with_state(engine.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    engine
}

/// Wait until the relay reports `agent` online (its engine heartbeated).
async fn wait_online(observer: &MeshEngine, agent: &str) {
    let community = observer.manager().default_community();
    for _ in 0..50 {
        if let Ok(presence) = observer.manager().check_presence(&community, agent).await {
            if presence.online {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{agent} never came online");
}

#[tokio::test]
async fn s3_direct_send_online() {
    let relay = spawn_relay().await;
    let admin = AgentKeypair::generate();
    admins::add(
        &relay.state.conn(),
        "admin",
        &admin.public_key().to_spki_base64(),
    )
    .unwrap();
    let dir = TempDir::new().unwrap();

    let alice = spawn_agent(&relay, &admin, "alice", &dir).await;
    let bob = spawn_agent(&relay, &admin, "bob", &dir).await;

    // Contact handshake through the engines
    alice.request_contact("bob", Some("Hi Bob!")).await.unwrap();
    let pending = bob.pending_contacts("home").await.unwrap();
    assert_eq!(pending[0].from, "alice");
    bob.accept_contact("home", "alice").await.unwrap();

    // Both runtimes up: heartbeats advertise the loopback inboxes
    let mut bob_events = bob.subscribe();
    alice.start();
    bob.start();
    wait_online(&alice, "bob").await;

    let outcome = alice
        .send_message("bob", &serde_json::json!({"text": "hi"}))
        .await;
    assert_eq!(outcome.status, SendStatus::Delivered, "{:?}", outcome.error);
    let message_id = outcome.message_id.clone().unwrap();

    // Bob's pipeline verified, decrypted, and emitted the message
    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(MeshEvent::Message {
                sender,
                payload,
                verified,
                message_id,
                ..
            }) = bob_events.recv().await
            {
                return (sender, payload, verified, message_id);
            }
        }
    })
    .await
    .expect("no message event");
    assert_eq!(event.0, "alice");
    assert_eq!(event.1, serde_json::json!({"text": "hi"}));
    assert!(event.2);
    assert_eq!(event.3, message_id);

    // The delivery report shows a single successful attempt
    let reports = alice.delivery_reports(&message_id);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].attempts.len(), 1);
    assert_eq!(reports[0].attempts[0].http_status, Some(200));
    assert_eq!(reports[0].final_status.as_deref(), Some("delivered"));

    // Message content never reached the relay's store
    let conn = relay.state.conn();
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table'").unwrap();
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    for table in tables {
        let sql = format!("SELECT COUNT(*) FROM \"{table}\"");
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0)).unwrap_or(0);
        if count == 0 {
            continue;
        }
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM \"{table}\""))
            .unwrap();
        let column_count = stmt.column_count();
        let mut rows = stmt.query([]).unwrap();
        while let Some(row) = rows.next().unwrap() {
            for i in 0..column_count {
                if let Ok(value) = row.get::<_, String>(i) {
                    assert!(
                        !value.contains("\"text\":\"hi\""),
                        "plaintext leaked into relay table {table}"
                    );
                }
            }
        }
    }

    alice.stop();
    bob.stop();
}

#[tokio::test]
async fn s4_offline_recipient_queues() {
    let relay = spawn_relay().await;
    let admin = AgentKeypair::generate();
    admins::add(
        &relay.state.conn(),
        "admin",
        &admin.public_key().to_spki_base64(),
    )
    .unwrap();
    let dir = TempDir::new().unwrap();

    let alice = spawn_agent(&relay, &admin, "alice", &dir).await;
    let carol = spawn_agent(&relay, &admin, "carol", &dir).await;

    alice.request_contact("carol", None).await.unwrap();
    carol.accept_contact("home", "alice").await.unwrap();

    // Carol's engine never starts: no heartbeat, offline on the relay
    let outcome = alice
        .send_message("carol", &serde_json::json!({"n": 1}))
        .await;
    assert_eq!(outcome.status, SendStatus::Queued);
    assert_eq!(alice.queued_count(), 1);
}

#[tokio::test]
async fn s7_group_fanout() {
    let relay = spawn_relay().await;
    let admin = AgentKeypair::generate();
    admins::add(
        &relay.state.conn(),
        "admin",
        &admin.public_key().to_spki_base64(),
    )
    .unwrap();
    let dir = TempDir::new().unwrap();

    let alice = spawn_agent(&relay, &admin, "alice", &dir).await;
    let bob = spawn_agent(&relay, &admin, "bob", &dir).await;
    let carol = spawn_agent(&relay, &admin, "carol", &dir).await;

    let group = alice.create_group("home", "team", None).await.unwrap();
    alice
        .invite_to_group("home", &group.group_id, "bob", None)
        .await
        .unwrap();
    alice
        .invite_to_group("home", &group.group_id, "carol", None)
        .await
        .unwrap();
    bob.accept_group_invitation("home", &group.group_id)
        .await
        .unwrap();
    carol
        .accept_group_invitation("home", &group.group_id)
        .await
        .unwrap();

    // Bob is online; carol never heartbeats
    let mut bob_events = bob.subscribe();
    bob.start();
    wait_online(&alice, "bob").await;

    let report = alice
        .send_to_group(&group.group_id, &serde_json::json!({"x": 1}))
        .await
        .unwrap();
    assert_eq!(report.delivered, vec!["bob".to_string()]);
    assert_eq!(report.queued, vec!["carol".to_string()]);
    assert!(report.failed.is_empty());

    // Bob sees the plaintext exactly once, on the group channel
    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(MeshEvent::GroupMessage {
                sender,
                group_id,
                payload,
                message_id,
                ..
            }) = bob_events.recv().await
            {
                return (sender, group_id, payload, message_id);
            }
        }
    })
    .await
    .expect("no group message event");
    assert_eq!(event.0, "alice");
    assert_eq!(event.1, group.group_id);
    assert_eq!(event.2, serde_json::json!({"x": 1}));
    assert_eq!(event.3, report.message_id);

    bob.stop();
}

#[tokio::test]
async fn s6_sticky_failover() {
    let relay = spawn_relay().await;
    let admin = AgentKeypair::generate();
    admins::add(
        &relay.state.conn(),
        "admin",
        &admin.public_key().to_spki_base64(),
    )
    .unwrap();
    let dir = TempDir::new().unwrap();

    // Onboard frank on the relay that will serve as the failover
    let keypair = {
        let keypair = AgentKeypair::generate();
        let email = "frank@example.org".to_string();
        let api = agentmesh_core::relay::RelayClient::new(
            &relay.base_url,
            "frank",
            Arc::new(keypair.clone()),
            Duration::from_secs(5),
        )
        .unwrap();
        api.verify_send(&VerifySendRequest {
            username: "frank".to_string(),
            email: email.clone(),
        })
        .await
        .unwrap();
        let code = relay.mailer.last_code_for(&email).unwrap();
        api.verify_confirm(&VerifyConfirmRequest {
            username: "frank".to_string(),
            code,
        })
        .await
        .unwrap();
        api.register(&RegisterRequest {
            name: "frank".to_string(),
            public_key: keypair.public_key().to_spki_base64(),
            owner_email: email,
            endpoint: "https://frank.example.org/inbox".to_string(),
        })
        .await
        .unwrap();
        agentmesh_core::relay::RelayClient::new(
            &relay.base_url,
            "admin",
            Arc::new(admin.clone()),
            Duration::from_secs(5),
        )
        .unwrap()
        .approve_agent("frank")
        .await
        .unwrap();
        keypair
    };

    let config = MeshConfig {
        username: "frank".to_string(),
        private_key: keypair.to_pkcs8_base64(),
        endpoint: "https://frank.example.org/inbox".to_string(),
        data_dir: dir.path().join("frank"),
        communities: vec![CommunityConfig {
            name: "home".to_string(),
            api: "http://127.0.0.1:1".to_string(),
            failover_api: Some(relay.base_url.clone()),
            private_key: None,
        }],
        heartbeat_interval_secs: 300,
        failover_threshold: 3,
        startup_failover_threshold: 1,
        retry_queue_max: 100,
        delivery_timeout_secs: 2,
        relay_timeout_secs: 2,
        cache_stale_secs: 0,
    };
    let frank = MeshEngine::new(config).unwrap();
    let mut events = frank.subscribe();

    // First call fails against the dead primary and flips
    assert!(frank.list_contacts("home").await.is_err());
    let community = frank.manager().default_community();
    assert_eq!(community.active_relay(), RelayRole::Failover);
    assert!(matches!(
        events.try_recv(),
        Ok(MeshEvent::CommunityFailover { community }) if community == "home"
    ));

    // Subsequent calls are served by the failover relay
    let contacts = frank.list_contacts("home").await.unwrap();
    assert!(contacts.is_empty());

    // Sticky: success on the failover emits no further status event
    assert!(events.try_recv().is_err());
}
