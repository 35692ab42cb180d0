//! Session state and the stores that hold it between executions.

use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::{path::Path as ObjPath, ObjectStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

/// Session key used when a caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// Shell state carried from one execution to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub background: BTreeMap<u32, BackgroundProcess>,
}

/// A process started with a trailing `&`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundProcess {
    pub command: String,
    pub log_path: String,
    pub session: String,
    #[serde(default)]
    pub registered_at: u64,
}

impl Session {
    pub fn new(cwd: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            env: BTreeMap::new(),
            background: BTreeMap::new(),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Session keys double as object store path segments and log fields, so
/// they are restricted to a conservative character set.
pub fn validate_session_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidSessionKey(key.to_string()))
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Directory a fresh session starts in.
    fn workspace_root(&self) -> &str;

    async fn try_load(&self, key: &str) -> Result<Option<Session>>;

    async fn save(&self, key: &str, session: &Session) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Load a session, degrading to a fresh one if the stored copy is
    /// missing, corrupt or unreachable.
    async fn load(&self, key: &str) -> Session {
        match self.try_load(key).await {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(self.workspace_root()),
            Err(e) => {
                warn!(session = %key, error = %e, "Failed to load session state, using defaults");
                Session::new(self.workspace_root())
            }
        }
    }
}

/// Thread-safe in-process session map.
pub type Sessions = Arc<RwLock<HashMap<String, Session>>>;

/// Store for backends whose environment outlives a single command.
#[derive(Clone)]
pub struct MemoryStore {
    sessions: Sessions,
    workspace_root: String,
}

impl MemoryStore {
    pub fn new(workspace_root: impl Into<String>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            workspace_root: workspace_root.into(),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn workspace_root(&self) -> &str {
        &self.workspace_root
    }

    async fn try_load(&self, key: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(key.to_string(), session.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.sessions.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Durable store: one JSON object per session at `sessions/{key}/state.json`.
#[derive(Clone)]
pub struct ObjectSessionStore {
    store: Arc<dyn ObjectStore>,
    prefix: ObjPath,
    workspace_root: String,
}

impl ObjectSessionStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: ObjPath, workspace_root: impl Into<String>) -> Self {
        Self {
            store,
            prefix,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn prefix(&self) -> &ObjPath {
        &self.prefix
    }

    fn sessions_root(&self) -> ObjPath {
        self.prefix.child("sessions")
    }

    fn state_path(&self, key: &str) -> ObjPath {
        self.sessions_root().child(key).child("state.json")
    }

    /// Proves the backing store answers a listing request.
    pub async fn probe(&self) -> Result<()> {
        self.store.list_with_delimiter(Some(&self.prefix)).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for ObjectSessionStore {
    fn workspace_root(&self) -> &str {
        &self.workspace_root
    }

    async fn try_load(&self, key: &str) -> Result<Option<Session>> {
        validate_session_key(key)?;
        let path = self.state_path(key);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, key: &str, session: &Session) -> Result<()> {
        validate_session_key(key)?;
        let path = self.state_path(key);
        let data = serde_json::to_vec_pretty(session)?;
        self.store.put(&path, Bytes::from(data).into()).await?;
        debug!(session = %key, path = %path, "Saved session state");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_session_key(key)?;
        match self.store.delete(&self.state_path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let listing = self
            .store
            .list_with_delimiter(Some(&self.sessions_root()))
            .await?;
        let mut keys: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.parts().last().map(|part| part.as_ref().to_string()))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Per-session async locks guarding registry bookkeeping.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn forget(&self, key: &str) {
        self.inner.lock().await.remove(key);
    }
}
