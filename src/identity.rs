//! Worker identity verification
//!
//! Workers authenticate their `hello` with a `(node_id, secret)` pair. The
//! durable store only retains a keyed one-way hash of the secret; the
//! plaintext is handed out exactly once at identity creation. Comparison is
//! constant-time so the check leaks no timing signal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, KeyInit, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Worker type label, distinguishing user workers from system workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// Regular tenant-owned worker
    #[default]
    Normal,
    /// Platform-operated system worker
    Sys,
}

impl WorkerType {
    /// Parse from a label value; unknown values fall back to `Normal`
    #[must_use]
    pub fn from_label(value: &str) -> Self {
        if value.eq_ignore_ascii_case("sys") {
            Self::Sys
        } else {
            Self::Normal
        }
    }

    /// Stable label string
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Sys => "sys",
        }
    }
}

/// One durable worker identity row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Stable worker node id
    pub node_id: String,
    /// Account the worker belongs to
    pub owner_id: String,
    /// Worker type
    pub worker_type: WorkerType,
    /// Hex-encoded HMAC-SHA256 of the worker secret
    pub secret_hash: String,
}

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Account the worker belongs to
    pub owner_id: String,
    /// Worker type
    pub worker_type: WorkerType,
}

/// Durable persistence for worker identities.
///
/// The dispatcher consumes this as an opaque collaborator; rows survive a
/// control-plane restart even though sessions and tasks do not.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Fetch an identity row by node id
    async fn get(&self, node_id: &str) -> Result<Option<WorkerIdentity>>;

    /// Insert or replace an identity row
    async fn put(&self, identity: WorkerIdentity) -> Result<()>;

    /// Remove an identity row; returns whether it existed
    async fn remove(&self, node_id: &str) -> Result<bool>;

    /// List all identity rows
    async fn list(&self) -> Result<Vec<WorkerIdentity>>;
}

/// In-memory identity store (tests, ephemeral deployments)
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    rows: Mutex<HashMap<String, WorkerIdentity>>,
}

impl MemoryIdentityStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, node_id: &str) -> Result<Option<WorkerIdentity>> {
        Ok(self.rows.lock().get(node_id).cloned())
    }

    async fn put(&self, identity: WorkerIdentity) -> Result<()> {
        self.rows.lock().insert(identity.node_id.clone(), identity);
        Ok(())
    }

    async fn remove(&self, node_id: &str) -> Result<bool> {
        Ok(self.rows.lock().remove(node_id).is_some())
    }

    async fn list(&self) -> Result<Vec<WorkerIdentity>> {
        Ok(self.rows.lock().values().cloned().collect())
    }
}

/// JSON-file-backed identity store.
///
/// The whole map is rewritten on every mutation; identity churn is rare
/// enough that this stays well within bounds.
pub struct FileIdentityStore {
    path: PathBuf,
    rows: Mutex<HashMap<String, WorkerIdentity>>,
}

impl FileIdentityStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let list: Vec<WorkerIdentity> = serde_json::from_str(&raw)?;
            list.into_iter().map(|i| (i.node_id.clone(), i)).collect()
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), identities = rows.len(), "Opened identity store");
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    fn persist(&self, rows: &HashMap<String, WorkerIdentity>) -> Result<()> {
        let mut list: Vec<&WorkerIdentity> = rows.values().collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let raw = serde_json::to_string_pretty(&list)?;
        // Write-then-rename keeps the store readable if we crash mid-write.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn get(&self, node_id: &str) -> Result<Option<WorkerIdentity>> {
        Ok(self.rows.lock().get(node_id).cloned())
    }

    async fn put(&self, identity: WorkerIdentity) -> Result<()> {
        let mut rows = self.rows.lock();
        rows.insert(identity.node_id.clone(), identity);
        self.persist(&rows)
    }

    async fn remove(&self, node_id: &str) -> Result<bool> {
        let mut rows = self.rows.lock();
        let existed = rows.remove(node_id).is_some();
        if existed {
            self.persist(&rows)?;
        }
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<WorkerIdentity>> {
        Ok(self.rows.lock().values().cloned().collect())
    }
}

/// Verifies `(node_id, secret)` pairs against the durable store
pub struct IdentityVerifier {
    store: Arc<dyn IdentityStore>,
    hmac_key: Vec<u8>,
}

impl IdentityVerifier {
    /// Create a verifier over `store` with the given HMAC key
    pub fn new(store: Arc<dyn IdentityStore>, hmac_key: Vec<u8>) -> Self {
        Self { store, hmac_key }
    }

    /// Keyed hash of a worker secret, hex-encoded
    fn hash_secret(&self, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key)
            .expect("HMAC accepts keys of any length");
        mac.update(secret.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a presented secret for `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthenticated`] for unknown node ids and for
    /// mismatched secrets; the two cases are indistinguishable to the caller.
    pub async fn verify(&self, node_id: &str, presented_secret: &str) -> Result<VerifiedIdentity> {
        let Some(identity) = self.store.get(node_id).await? else {
            return Err(Error::Unauthenticated);
        };

        let presented = self.hash_secret(presented_secret);
        let matches: bool = presented
            .as_bytes()
            .ct_eq(identity.secret_hash.as_bytes())
            .into();
        if !matches {
            return Err(Error::Unauthenticated);
        }

        Ok(VerifiedIdentity {
            owner_id: identity.owner_id,
            worker_type: identity.worker_type,
        })
    }

    /// Create a new worker identity and return the plaintext secret.
    ///
    /// The plaintext is returned exactly once; only the hash is stored.
    pub async fn create(
        &self,
        node_id: &str,
        owner_id: &str,
        worker_type: WorkerType,
    ) -> Result<String> {
        use rand::RngExt;
        let random_bytes: [u8; 32] = rand::rng().random();
        let secret = format!(
            "swk_{}",
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
        );

        self.store
            .put(WorkerIdentity {
                node_id: node_id.to_string(),
                owner_id: owner_id.to_string(),
                worker_type,
                secret_hash: self.hash_secret(&secret),
            })
            .await?;

        info!(node_id, owner_id, worker_type = worker_type.as_str(), "Created worker identity");
        Ok(secret)
    }

    /// Remove a worker identity; returns whether it existed
    pub async fn remove(&self, node_id: &str) -> Result<bool> {
        self.store.remove(node_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> IdentityVerifier {
        IdentityVerifier::new(Arc::new(MemoryIdentityStore::new()), b"test-key".to_vec())
    }

    #[tokio::test]
    async fn create_then_verify_round_trip() {
        let v = verifier();
        let secret = v.create("node-1", "acct-1", WorkerType::Normal).await.unwrap();

        let verified = v.verify("node-1", &secret).await.unwrap();
        assert_eq!(verified.owner_id, "acct-1");
        assert_eq!(verified.worker_type, WorkerType::Normal);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let v = verifier();
        let _ = v.create("node-1", "acct-1", WorkerType::Normal).await.unwrap();

        let err = v.verify("node-1", "swk_not-the-secret").await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated));
    }

    #[tokio::test]
    async fn unknown_node_is_rejected() {
        let v = verifier();
        let err = v.verify("ghost", "anything").await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated));
    }

    #[tokio::test]
    async fn store_only_holds_the_hash() {
        let store = Arc::new(MemoryIdentityStore::new());
        let v = IdentityVerifier::new(Arc::clone(&store) as Arc<dyn IdentityStore>, b"k".to_vec());
        let secret = v.create("node-1", "acct-1", WorkerType::Sys).await.unwrap();

        let row = store.get("node-1").await.unwrap().unwrap();
        assert_ne!(row.secret_hash, secret);
        assert!(!row.secret_hash.contains(&secret));
        assert_eq!(row.worker_type, WorkerType::Sys);
    }

    #[tokio::test]
    async fn different_hmac_keys_reject_each_other() {
        let store = Arc::new(MemoryIdentityStore::new());
        let a = IdentityVerifier::new(Arc::clone(&store) as Arc<dyn IdentityStore>, b"key-a".to_vec());
        let b = IdentityVerifier::new(store as Arc<dyn IdentityStore>, b"key-b".to_vec());

        let secret = a.create("node-1", "acct-1", WorkerType::Normal).await.unwrap();
        assert!(b.verify("node-1", &secret).await.is_err());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");

        {
            let store = FileIdentityStore::open(&path).unwrap();
            store
                .put(WorkerIdentity {
                    node_id: "node-1".into(),
                    owner_id: "acct-1".into(),
                    worker_type: WorkerType::Normal,
                    secret_hash: "abc123".into(),
                })
                .await
                .unwrap();
        }

        let reopened = FileIdentityStore::open(&path).unwrap();
        let row = reopened.get("node-1").await.unwrap().unwrap();
        assert_eq!(row.owner_id, "acct-1");

        assert!(reopened.remove("node-1").await.unwrap());
        assert!(!reopened.remove("node-1").await.unwrap());
    }

    #[test]
    fn worker_type_label_parsing() {
        assert_eq!(WorkerType::from_label("sys"), WorkerType::Sys);
        assert_eq!(WorkerType::from_label("SYS"), WorkerType::Sys);
        assert_eq!(WorkerType::from_label("normal"), WorkerType::Normal);
        assert_eq!(WorkerType::from_label("weird"), WorkerType::Normal);
    }
}
