//! Single-flight locking keyed by task name.
//!
//! A [`DistributedLock`] owns a random owner token. Acquisition is a
//! conditional set with a TTL; release deletes the key only when it still
//! holds that token, so an expired holder can never release a lock that a
//! later owner acquired.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const TASK_LOCK_PREFIX: &str = "metric:task:lock:";

pub fn task_lock_key(task_name: &str) -> String {
    format!("{TASK_LOCK_PREFIX}{task_name}")
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {key} is held by another owner")]
    Unauthorized { key: String },
    #[error("lock {key} is not held")]
    NotHeld { key: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Storage primitives a lock backend must provide atomically.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Stores `token` under `key` only if the key is absent (or expired).
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deletes `key` only if it currently holds `token`.
    async fn delete_if_eq(&self, key: &str, token: &str) -> Result<bool>;
}

pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    token: String,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `Ok(false)` means someone else holds the key.
    pub async fn lock(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let acquired = self.store.set_if_absent(key, &self.token, ttl).await?;
        debug!(key, acquired, "lock attempt");
        Ok(acquired)
    }

    pub async fn unlock(&self, key: &str) -> Result<(), LockError> {
        match self.store.get(key).await? {
            None => Err(LockError::NotHeld { key: key.to_string() }),
            Some(holder) if holder != self.token => Err(LockError::Unauthorized {
                key: key.to_string(),
            }),
            Some(_) => {
                if self.store.delete_if_eq(key, &self.token).await? {
                    Ok(())
                } else {
                    Err(LockError::Unauthorized {
                        key: key.to_string(),
                    })
                }
            }
        }
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Process-local lock store; expired entries are replaced lazily.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory lock store poisoned"))
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries()?;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(token, _)| token.clone()))
    }

    async fn delete_if_eq(&self, key: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some((held, expires)) if held == token && *expires > Instant::now() => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// File backend
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    token: String,
    expires_at_ms: i64,
}

/// One file per key, shared by processes on the same host.
///
/// Every check-and-modify runs under an exclusive advisory lock on a sibling
/// `.guard` file, so expiry takeover and release are atomic across processes.
/// The OS drops the advisory lock when its holder exits.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context("creating lock directory")?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    /// Runs `f` on the key's lock path while holding its guard file.
    fn guarded<T>(&self, key: &str, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        let path = self.path_for(key);
        let guard = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.with_extension("guard"))
            .context("opening lock guard file")?;
        guard.lock_exclusive().context("acquiring lock guard")?;
        let result = f(&path);
        if let Err(err) = FileExt::unlock(&guard) {
            debug!(error = %err, "releasing lock guard failed");
        }
        result
    }

    fn read(path: &Path) -> Result<Option<LockFile>> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("reading lock file"),
        };
        // An unparseable lock file counts as expired.
        Ok(serde_json::from_slice(&data).ok().or(Some(LockFile {
            token: String::new(),
            expires_at_ms: 0,
        })))
    }

    fn live(path: &Path) -> Result<Option<LockFile>> {
        Ok(Self::read(path)?.filter(|f| f.expires_at_ms > Utc::now().timestamp_millis()))
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.guarded(key, |path| {
            if Self::live(path)?.is_some() {
                return Ok(false);
            }
            // Rename a fully written temp file so unguarded readers never see a partial lock.
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            let body = LockFile {
                token: token.to_string(),
                expires_at_ms: Utc::now().timestamp_millis().saturating_add(ttl_ms),
            };
            let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
            fs::write(&tmp, serde_json::to_vec(&body).context("serializing lock file")?)
                .context("writing lock temp file")?;
            if let Err(err) = fs::rename(&tmp, path) {
                if let Err(cleanup) = fs::remove_file(&tmp) {
                    debug!(error = %cleanup, "removing lock temp file failed");
                }
                return Err(err).context("installing lock file");
            }
            Ok(true)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(Self::live(&self.path_for(key))?.map(|f| f.token))
    }

    async fn delete_if_eq(&self, key: &str, token: &str) -> Result<bool> {
        self.guarded(key, |path| match Self::live(path)? {
            Some(f) if f.token == token => {
                fs::remove_file(path).context("removing lock file")?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }
}
