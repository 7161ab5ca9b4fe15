use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use cyclemetric::config::Config;
use cyclemetric::executor::TaskExecutor;
use cyclemetric::lock::FileLockStore;
use cyclemetric::plugin::elasticsearch::{self, EsOutput};
use cyclemetric::plugin::Registry;
use cyclemetric::scheduler::Scheduler;
use cyclemetric::signal::spawn_signal_handler;
use cyclemetric::store::JsonTaskStore;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let cfg_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = Config::load(cfg_path)?;
    let store = Arc::new(JsonTaskStore::open(cfg.task_store_path.clone())?);
    let locks = Arc::new(FileLockStore::new(cfg.lock_dir.clone())?);
    info!(
        task_store = %store.path().display(),
        lock_dir = %locks.dir().display(),
        workers = cfg.worker_count,
        es_enabled = cfg.es_url.is_some(),
        "starting cyclemetric"
    );
    let registry = Arc::new(build_registry(&cfg)?);
    for (stage, name, description) in registry.catalog() {
        info!(stage, name = %name, description = %description, "plugin registered");
    }

    let executor = TaskExecutor::new(
        store.clone(),
        locks,
        registry,
        cfg.executor_settings(),
    );
    let scheduler = Scheduler::new(store, executor, cfg.scheduler_settings());

    let shutdown = CancellationToken::new();
    let signals = spawn_signal_handler(shutdown.clone());
    scheduler.run(shutdown).await;
    signals.abort();

    info!("shutdown complete");
    Ok(())
}

fn build_registry(cfg: &Config) -> Result<Registry> {
    let mut registry = Registry::with_builtins();
    if let Some(es_cfg) = cfg.es_output() {
        let output = EsOutput::connect(&es_cfg)?;
        info!(url = %es_cfg.url, index_prefix = %es_cfg.index_prefix, "elasticsearch output enabled");
        registry.register_output(elasticsearch::NAME, move || Box::new(output.clone()));
    }
    Ok(registry)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();
}
