use std::sync::Arc;
use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::executor::{ExecutorSettings, CANCEL_GRACE};
use crate::pipeline::PipelineSettings;
use crate::plugin::elasticsearch::EsOutputConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub task_store_path: PathBuf,
    pub lock_dir: PathBuf,
    pub worker_count: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub channel_capacity: usize,
    pub execution_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    pub pass_floor_secs: u64,
    pub idle_pause_ms: u64,
    pub es_url: Option<Arc<str>>,
    pub es_user: Arc<str>,
    pub es_pass: Arc<str>,
    pub index_prefix: Arc<str>,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    task_store_path: Option<PathBuf>,
    lock_dir: Option<PathBuf>,
    worker_count: usize,
    retry_attempts: u32,
    retry_delay_ms: u64,
    channel_capacity: usize,
    execution_timeout_secs: u64,
    lock_ttl_secs: u64,
    pass_floor_secs: u64,
    idle_pause_ms: u64,
    es_url: Option<String>,
    es_user: String,
    es_pass: String,
    index_prefix: String,
    http_timeout_secs: u64,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            task_store_path: None,
            lock_dir: None,
            worker_count: 10,
            retry_attempts: 3,
            retry_delay_ms: 100,
            channel_capacity: 100,
            execution_timeout_secs: 600,
            lock_ttl_secs: 720,
            pass_floor_secs: 30,
            idle_pause_ms: 1000,
            es_url: None,
            es_user: "elastic".into(),
            es_pass: "changeme".into(),
            index_prefix: "cyclemetric".into(),
            http_timeout_secs: 30,
        }
    }
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        let dir = default_state_dir();
        Self {
            task_store_path: raw
                .task_store_path
                .unwrap_or_else(|| dir.join("tasks.json")),
            lock_dir: raw.lock_dir.unwrap_or_else(|| dir.join("locks")),
            worker_count: raw.worker_count,
            retry_attempts: raw.retry_attempts,
            retry_delay_ms: raw.retry_delay_ms,
            channel_capacity: raw.channel_capacity,
            execution_timeout_secs: raw.execution_timeout_secs,
            lock_ttl_secs: raw.lock_ttl_secs,
            pass_floor_secs: raw.pass_floor_secs,
            idle_pause_ms: raw.idle_pause_ms,
            es_url: raw.es_url.filter(|u| !u.trim().is_empty()).map(Arc::from),
            es_user: raw.es_user.into(),
            es_pass: raw.es_pass.into(),
            index_prefix: raw.index_prefix.into(),
            http_timeout_secs: raw.http_timeout_secs,
        }
    }
}

impl Config {
    /// File (explicit path, else the default location if present), then env overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let raw = match path {
            Some(path) => Some(
                fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
            ),
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Some(fs::read_to_string(&default_path).context("reading default config")?)
                } else {
                    None
                }
            }
        };
        let mut cfg = match raw {
            Some(raw) => Config::from(toml::from_str::<RawConfig>(&raw).context("parsing config")?),
            None => Config::from(RawConfig::default()),
        };

        if let Ok(p) = env::var("TASK_STORE_PATH") {
            cfg.task_store_path = PathBuf::from(p);
        }
        if let Ok(p) = env::var("LOCK_DIR") {
            cfg.lock_dir = PathBuf::from(p);
        }
        maybe_env_usize(&mut cfg.worker_count, "WORKER_COUNT");
        maybe_env_u32(&mut cfg.retry_attempts, "RETRY_ATTEMPTS");
        maybe_env_u64(&mut cfg.retry_delay_ms, "RETRY_DELAY_MS");
        maybe_env_usize(&mut cfg.channel_capacity, "CHANNEL_CAPACITY");
        maybe_env_u64(&mut cfg.execution_timeout_secs, "EXECUTION_TIMEOUT_SECS");
        maybe_env_u64(&mut cfg.lock_ttl_secs, "LOCK_TTL_SECS");
        maybe_env_u64(&mut cfg.pass_floor_secs, "PASS_FLOOR_SECS");
        maybe_env_u64(&mut cfg.idle_pause_ms, "IDLE_PAUSE_MS");
        maybe_env_u64(&mut cfg.http_timeout_secs, "HTTP_TIMEOUT_SECS");
        if let Ok(v) = env::var("ES_HOST") {
            cfg.es_url = Some(v).filter(|u| !u.trim().is_empty()).map(Arc::from);
        }
        if let Ok(v) = env::var("ES_USER") {
            cfg.es_user = v.into();
        }
        if let Ok(v) = env::var("ES_PASS") {
            cfg.es_pass = v.into();
        }
        if let Ok(v) = env::var("INDEX_PREFIX") {
            cfg.index_prefix = v.into();
        }
        validate(&cfg)?;
        Ok(cfg)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            execution_timeout: Duration::from_secs(self.execution_timeout_secs),
            pipeline: PipelineSettings {
                workers: self.worker_count,
                channel_capacity: self.channel_capacity,
                retry: RetryPolicy::new(
                    self.retry_attempts,
                    Duration::from_millis(self.retry_delay_ms),
                ),
            },
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            pass_floor: Duration::from_secs(self.pass_floor_secs),
            idle_pause: Duration::from_millis(self.idle_pause_ms),
        }
    }

    /// Elasticsearch output settings, when a host is configured.
    pub fn es_output(&self) -> Option<EsOutputConfig> {
        self.es_url.as_ref().map(|url| EsOutputConfig {
            url: url.clone(),
            user: self.es_user.clone(),
            pass: self.es_pass.clone(),
            index_prefix: self.index_prefix.clone(),
            timeout: self.http_timeout(),
        })
    }
}

fn default_config_path() -> PathBuf {
    default_state_dir().join("config.toml")
}

fn default_state_dir() -> PathBuf {
    ProjectDirs::from("com", "cyclemetric", "cyclemetric")
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".cyclemetric"))
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.worker_count == 0 {
        anyhow::bail!("WORKER_COUNT must be at least 1");
    }
    if cfg.channel_capacity == 0 {
        anyhow::bail!("CHANNEL_CAPACITY must be at least 1");
    }
    if cfg.retry_attempts == 0 {
        anyhow::bail!("RETRY_ATTEMPTS must be at least 1");
    }
    // A timed-out run keeps the lock through its cancellation grace period.
    let lock_floor = cfg
        .execution_timeout_secs
        .saturating_add(CANCEL_GRACE.as_secs());
    if cfg.lock_ttl_secs <= lock_floor {
        anyhow::bail!(
            "LOCK_TTL_SECS ({}) must exceed EXECUTION_TIMEOUT_SECS ({}) plus the {}s cancel grace",
            cfg.lock_ttl_secs,
            cfg.execution_timeout_secs,
            CANCEL_GRACE.as_secs()
        );
    }
    if cfg.index_prefix.trim().is_empty() {
        anyhow::bail!("INDEX_PREFIX must not be empty");
    }
    Ok(())
}

fn maybe_env_usize(val: &mut usize, key: &str) {
    if let Ok(v) = env::var(key) {
        if let Ok(n) = v.parse::<usize>() {
            *val = n;
        }
    }
}

fn maybe_env_u32(val: &mut u32, key: &str) {
    if let Ok(v) = env::var(key) {
        if let Ok(n) = v.parse::<u32>() {
            *val = n;
        }
    }
}

fn maybe_env_u64(val: &mut u64, key: &str) {
    if let Ok(v) = env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *val = n;
        }
    }
}
