//! Per-community contact cache
//!
//! The only shared mutable state on the send hot path. Each community owns
//! one cache, persisted as `<dataDir>/<community>.json`. Refreshes replace
//! the whole contact map atomically; a cache file that fails to parse is
//! ignored and repopulated from the relay.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::relay::ContactInfo;

/// One cached peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedContact {
    pub username: String,
    /// Base64 SPKI Ed25519 key, as published by the relay
    pub public_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub added_at: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub key_updated_at: Option<String>,
    #[serde(default)]
    pub recovery_in_progress: bool,
    pub community: String,
}

impl CachedContact {
    /// Build a cache entry from the relay's contact listing.
    pub fn from_contact_info(info: ContactInfo, community: &str) -> Self {
        Self {
            username: info.agent,
            public_key: info.public_key,
            endpoint: info.endpoint,
            added_at: info.since,
            online: info.online,
            last_seen: info.last_seen,
            key_updated_at: info.key_updated_at,
            recovery_in_progress: false,
            community: community.to_string(),
        }
    }
}

/// A peer whose published key changed between two refreshes.
#[derive(Debug, Clone)]
pub struct KeyChange {
    pub username: String,
    pub previous_key: String,
    pub new_key: String,
}

/// On-disk representation of a cache file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    contacts: Vec<CachedContact>,
}

/// Contact cache for one community.
pub struct ContactCache {
    community: String,
    path: PathBuf,
    entries: HashMap<String, CachedContact>,
    last_refreshed: Option<Instant>,
}

impl ContactCache {
    /// Load the cache for `community` from `data_dir`, tolerating a missing
    /// or corrupt file by starting empty.
    pub fn load(data_dir: &Path, community: &str) -> Self {
        let path = data_dir.join(format!("{community}.json"));
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheFile>(&bytes) {
                Ok(file) => {
                    debug!(community, count = file.contacts.len(), "Loaded contact cache");
                    file.contacts
                        .into_iter()
                        .map(|c| (c.username.clone(), c))
                        .collect()
                }
                Err(e) => {
                    warn!(community, error = %e, "Contact cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(community, error = %e, "Contact cache unreadable, starting empty");
                HashMap::new()
            }
        };

        Self {
            community: community.to_string(),
            path,
            entries,
            last_refreshed: None,
        }
    }

    /// Persist the cache. Writes to a temporary file first so a crash
    /// mid-write cannot corrupt the previous cache.
    pub fn save(&self) -> MeshResult<()> {
        let file = CacheFile {
            contacts: {
                let mut contacts: Vec<_> = self.entries.values().cloned().collect();
                contacts.sort_by(|a, b| a.username.cmp(&b.username));
                contacts
            },
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| MeshError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Replace the entire contact map with a fresh relay listing, returning
    /// the set of peers whose published key changed.
    pub fn replace_all(&mut self, contacts: Vec<CachedContact>) -> Vec<KeyChange> {
        let mut changes = Vec::new();
        for contact in &contacts {
            if let Some(previous) = self.entries.get(&contact.username) {
                if previous.public_key != contact.public_key {
                    changes.push(KeyChange {
                        username: contact.username.clone(),
                        previous_key: previous.public_key.clone(),
                        new_key: contact.public_key.clone(),
                    });
                }
            }
        }
        self.entries = contacts
            .into_iter()
            .map(|c| (c.username.clone(), c))
            .collect();
        self.last_refreshed = Some(Instant::now());
        changes
    }

    pub fn get(&self, username: &str) -> Option<&CachedContact> {
        self.entries.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn community(&self) -> &str {
        &self.community
    }

    /// Whether the cache has gone longer than `threshold` without a refresh.
    /// A never-refreshed cache is always stale.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        match self.last_refreshed {
            Some(at) => at.elapsed() > threshold,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn contact(name: &str, key: &str) -> CachedContact {
        CachedContact {
            username: name.to_string(),
            public_key: key.to_string(),
            endpoint: Some(format!("https://{name}.example.org/inbox")),
            added_at: "2026-01-01T00:00:00Z".to_string(),
            online: true,
            last_seen: None,
            key_updated_at: None,
            recovery_in_progress: false,
            community: "home".to_string(),
        }
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let cache = ContactCache::load(dir.path(), "home");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContactCache::load(dir.path(), "home");
        cache.replace_all(vec![contact("bob", "key-b"), contact("carol", "key-c")]);
        cache.save().unwrap();

        let reloaded = ContactCache::load(dir.path(), "home");
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("bob"));
        assert_eq!(reloaded.get("carol").unwrap().public_key, "key-c");
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("home.json"), b"{not json at all").unwrap();
        let cache = ContactCache::load(dir.path(), "home");
        assert!(cache.is_empty());

        // And a save afterwards repairs the file
        let mut cache = cache;
        cache.replace_all(vec![contact("bob", "key-b")]);
        cache.save().unwrap();
        assert_eq!(ContactCache::load(dir.path(), "home").len(), 1);
    }

    #[test]
    fn test_replace_all_reports_key_changes() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContactCache::load(dir.path(), "home");
        cache.replace_all(vec![contact("bob", "key-old"), contact("carol", "key-c")]);

        let changes = cache.replace_all(vec![contact("bob", "key-new"), contact("carol", "key-c")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].username, "bob");
        assert_eq!(changes[0].previous_key, "key-old");
        assert_eq!(changes[0].new_key, "key-new");
    }

    #[test]
    fn test_replace_all_drops_removed_contacts() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContactCache::load(dir.path(), "home");
        cache.replace_all(vec![contact("bob", "k"), contact("carol", "k")]);
        cache.replace_all(vec![contact("bob", "k")]);
        assert!(!cache.contains("carol"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_staleness() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContactCache::load(dir.path(), "home");
        assert!(cache.is_stale(Duration::from_secs(300)), "never refreshed");

        cache.replace_all(vec![contact("bob", "k")]);
        assert!(!cache.is_stale(Duration::from_secs(300)));
        assert!(cache.is_stale(Duration::ZERO));
    }
}
