//! One cycle window through collect -> filter -> aggregate -> output.
//!
//! A spawned driver lists the keys and wires, per key, a collector call (in
//! the worker pool, with retry), a filter task and an aggregate task. Every
//! aggregate task holds a clone of the output sender; the output stage runs
//! inline and ends when the last clone is dropped or the run is cancelled.
//! Each stage only closes the channel it produces.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::guard::{catch_panic, KeyGuard, RunGuard};
use crate::plugin::{Aggregator, Collector, Filter, Output, RecordSender, Registry};
use crate::retry::{self, RetryPolicy};
use crate::task::{CycleWindow, PluginConfig};
use crate::types::{MetricOutput, Record};
use crate::worker::WorkerPool;

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub workers: usize,
    pub channel_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}

/// Plugins resolved once per task run and shared by its windows.
#[derive(Clone)]
pub struct RunPlugins {
    pub collector: Arc<dyn Collector>,
    pub filters: Arc<Vec<Box<dyn Filter>>>,
    /// Validated configs; every key gets fresh instances.
    pub aggregators: Arc<Vec<PluginConfig>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    /// Keys whose collection was started.
    pub keys: usize,
    /// Keys the output already had.
    pub skipped: usize,
    pub written: usize,
}

#[derive(Clone)]
struct WindowCtx {
    registry: Arc<Registry>,
    plugins: RunPlugins,
    output: Arc<dyn Output>,
    window: CycleWindow,
    guard: Arc<RunGuard>,
    settings: PipelineSettings,
}

/// Runs one window to completion. Failures are recorded on `guard`.
pub async fn run_window(
    registry: Arc<Registry>,
    plugins: RunPlugins,
    output: Arc<dyn Output>,
    window: CycleWindow,
    guard: Arc<RunGuard>,
    settings: PipelineSettings,
) -> WindowStats {
    let ctx = WindowCtx {
        registry,
        plugins,
        output,
        window,
        guard,
        settings,
    };
    let (out_tx, out_rx) = mpsc::channel(ctx.settings.channel_capacity.max(1));
    let driver = tokio::spawn(drive_keys(ctx.clone(), out_tx));

    let written = match catch_panic(drain_output(ctx.output.as_ref(), &ctx.guard, out_rx)).await {
        Ok(n) => n,
        Err(panic) => {
            ctx.guard.fail(format!("output stage panicked: {panic}"));
            0
        }
    };

    let mut stats = match driver.await {
        Ok(stats) => stats,
        Err(err) => {
            ctx.guard.fail(format!("collect driver aborted: {err}"));
            WindowStats::default()
        }
    };
    stats.written = written;
    info!(
        metric = %ctx.window.metric_name,
        begin = ctx.window.begin,
        end = ctx.window.end,
        keys = stats.keys,
        skipped = stats.skipped,
        written = stats.written,
        "window finished"
    );
    stats
}

// ============================================================================
// Collect driver
// ============================================================================

async fn drive_keys(ctx: WindowCtx, out_tx: mpsc::Sender<MetricOutput>) -> WindowStats {
    let mut stats = WindowStats::default();
    let listed = tokio::select! {
        biased;
        _ = ctx.guard.token().cancelled() => return stats,
        res = ctx.plugins.collector.keys() => res,
    };
    let keys = match listed {
        Ok(keys) => keys,
        Err(err) => {
            ctx.guard.fail(format!("listing keys: {err:#}"));
            return stats;
        }
    };
    debug!(metric = %ctx.window.metric_name, keys = keys.len(), "keys listed");

    let pool = WorkerPool::wait_all(ctx.settings.workers);
    let capacity = ctx.settings.channel_capacity.max(1);
    let mut stages = JoinSet::new();

    for key in keys {
        if ctx.guard.is_cancelled() {
            break;
        }
        match ctx.output.exists(&key).await {
            Ok(true) => {
                debug!(key = %key, "result already stored, skipping key");
                stats.skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(err) => warn!(key = %key, error = %err, "existence check failed, recomputing key"),
        }

        let key_guard = ctx.guard.key(&key);
        let aggregators =
            match build_aggregators(&ctx.registry, &ctx.plugins.aggregators, &ctx.window) {
                Ok(aggs) => aggs,
                Err(err) => {
                    key_guard.fail(format!("{err:#}"));
                    continue;
                }
            };

        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        let (kept_tx, kept_rx) = mpsc::channel(capacity);
        stages.spawn(filter_stage(
            key_guard.clone(),
            Arc::clone(&ctx.plugins.filters),
            raw_rx,
            kept_tx,
        ));
        stages.spawn(aggregate_stage(
            key_guard.clone(),
            aggregators,
            kept_rx,
            out_tx.clone(),
        ));

        let work = collect_key(
            Arc::clone(&ctx.plugins.collector),
            ctx.window.clone(),
            RecordSender::new(raw_tx, key_guard.token().clone()),
            key_guard,
            ctx.settings.retry,
        );
        let submitted = tokio::select! {
            biased;
            _ = ctx.guard.token().cancelled() => false,
            ok = pool.submit(work) => ok,
        };
        if !submitted {
            break;
        }
        stats.keys += 1;
    }
    drop(out_tx);

    if let Err(err) = pool.wait().await {
        debug!(error = %err, "collect pool finished with failures");
    }
    while let Some(joined) = stages.join_next().await {
        if let Err(err) = joined {
            ctx.guard.fail(format!("key stage aborted: {err}"));
        }
    }
    stats
}

fn build_aggregators(
    registry: &Registry,
    configs: &[PluginConfig],
    window: &CycleWindow,
) -> Result<Vec<Box<dyn Aggregator>>> {
    configs
        .iter()
        .map(|cfg| {
            let mut agg = registry.aggregator(cfg)?;
            agg.set_window(window)
                .with_context(|| format!("binding aggregator {} to window", cfg.name))?;
            Ok(agg)
        })
        .collect()
}

/// The record stream closes when this returns; failures are recorded first.
async fn collect_key(
    collector: Arc<dyn Collector>,
    window: CycleWindow,
    sender: RecordSender,
    guard: KeyGuard,
    policy: RetryPolicy,
) -> Result<()> {
    let key = guard.key().to_string();
    let attempt = retry::retry(&policy, guard.token(), |n| {
        if n > 0 {
            debug!(key = %key, attempt = n + 1, "collector retry");
        }
        collector.run(&key, &window, &sender)
    });
    let result = match catch_panic(attempt).await {
        Ok(res) => res,
        Err(panic) => Err(anyhow::anyhow!("collector panicked: {panic}")),
    };
    if let Err(err) = &result {
        guard.fail(format!("collector: {err:#}"));
    }
    drop(sender);
    result.with_context(|| format!("collecting key {key}"))
}

// ============================================================================
// Filter stage
// ============================================================================

async fn filter_stage(
    guard: KeyGuard,
    filters: Arc<Vec<Box<dyn Filter>>>,
    mut rx: mpsc::Receiver<Record>,
    tx: mpsc::Sender<Record>,
) {
    match catch_panic(filter_loop(&guard, &filters, &mut rx, &tx)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => guard.fail(format!("{err:#}")),
        Err(panic) => guard.fail(format!("filter panicked: {panic}")),
    }
}

async fn filter_loop(
    guard: &KeyGuard,
    filters: &[Box<dyn Filter>],
    rx: &mut mpsc::Receiver<Record>,
    tx: &mpsc::Sender<Record>,
) -> Result<()> {
    let key = guard.key();
    let mut seen = HashSet::new();
    loop {
        let mut record = tokio::select! {
            biased;
            _ = guard.token().cancelled() => return Ok(()),
            next = rx.recv() => match next {
                Some(record) => record,
                None => return Ok(()),
            },
        };
        if !seen.insert(record.fingerprint().to_string()) {
            debug!(key, fingerprint = record.fingerprint(), "duplicate record dropped");
            continue;
        }
        for filter in filters {
            filter
                .run(key, &mut record)
                .await
                .with_context(|| format!("filter {}", filter.name()))?;
        }
        tokio::select! {
            biased;
            _ = guard.token().cancelled() => return Ok(()),
            sent = tx.send(record) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

// ============================================================================
// Aggregate stage
// ============================================================================

async fn aggregate_stage(
    guard: KeyGuard,
    mut aggregators: Vec<Box<dyn Aggregator>>,
    mut rx: mpsc::Receiver<Record>,
    out: mpsc::Sender<MetricOutput>,
) {
    match catch_panic(aggregate_loop(&guard, &mut aggregators, &mut rx, &out)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => guard.fail(format!("{err:#}")),
        Err(panic) => guard.fail(format!("aggregator panicked: {panic}")),
    }
}

async fn aggregate_loop(
    guard: &KeyGuard,
    aggregators: &mut [Box<dyn Aggregator>],
    rx: &mut mpsc::Receiver<Record>,
    out: &mpsc::Sender<MetricOutput>,
) -> Result<()> {
    let key = guard.key();
    loop {
        let record = tokio::select! {
            biased;
            _ = guard.token().cancelled() => return Ok(()),
            next = rx.recv() => match next {
                Some(record) => record,
                None => break,
            },
        };
        for agg in aggregators.iter_mut() {
            agg.run(key, &record)
                .await
                .with_context(|| format!("aggregator {}", agg.name()))?;
        }
    }
    if guard.is_cancelled() {
        return Ok(());
    }

    let mut metric = MetricOutput::new(key);
    for agg in aggregators.iter() {
        let (name, value) = agg.metric();
        metric.values.insert(name, value);
        if let Some((name, extra)) = agg.metric_extra() {
            metric.extra.insert(name, extra);
        }
    }
    tokio::select! {
        biased;
        _ = guard.token().cancelled() => {}
        sent = out.send(metric) => {
            if sent.is_err() {
                debug!(key, "output stage closed before result was sent");
            }
        }
    }
    Ok(())
}

// ============================================================================
// Output stage
// ============================================================================

async fn drain_output(
    output: &dyn Output,
    guard: &RunGuard,
    mut rx: mpsc::Receiver<MetricOutput>,
) -> usize {
    let mut written = 0;
    loop {
        let metric = tokio::select! {
            biased;
            _ = guard.token().cancelled() => break,
            next = rx.recv() => match next {
                Some(metric) => metric,
                None => break,
            },
        };
        if let Err(err) = output.write(&metric).await {
            guard.fail(format!("writing key {}: {err:#}", metric.key));
            break;
        }
        written += 1;
    }
    written
}
