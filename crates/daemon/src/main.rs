#![forbid(unsafe_code)]

//! cardscan daemon: serves id-card recognition over HTTP through a bounded
//! worker pool.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cardscan_daemon::config::DaemonConfig;
use cardscan_daemon::demo::DemoModelLoader;
use cardscan_daemon::http::{router, AppState};
use cardscan_daemon::preprocess::ImagePreprocessor;
use cardscan_daemon::service::RecognitionService;
use cardscan_dispatch::Dispatcher;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cardscan-daemon", version, about = "Id-card recognition service")]
struct Args {
    /// TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8000
    #[arg(long)]
    listen: Option<String>,

    /// Number of recognition workers.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Maximum tasks waiting for a worker.
    #[arg(long)]
    max_queue_depth: Option<usize>,

    /// Maximum queued plus executing tasks.
    #[arg(long)]
    admission_ceiling: Option<usize>,

    /// Per-task deadline in milliseconds.
    #[arg(long)]
    task_timeout_ms: Option<u64>,

    /// Reclaim model memory after every task. Only the sizing advice changes;
    /// the pool keeps its configured size.
    #[arg(long)]
    memory_optimization: bool,

    /// Accepted X-API-KEY value; repeat for several.
    #[arg(long = "api-key")]
    api_keys: Vec<String>,

    /// Simulated latency of the demo model in milliseconds.
    #[arg(long)]
    demo_latency_ms: Option<u64>,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(DaemonConfig, String)> {
        let mut cfg = match &self.config {
            Some(path) => DaemonConfig::load_from(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(listen) = self.listen {
            cfg.listen = listen;
        }
        if let Some(n) = self.pool_size {
            cfg.dispatch.pool_size = n;
        }
        if let Some(n) = self.max_queue_depth {
            cfg.dispatch.max_queue_depth = n;
        }
        if let Some(n) = self.admission_ceiling {
            cfg.dispatch.admission_ceiling = n;
        }
        if let Some(ms) = self.task_timeout_ms {
            cfg.dispatch.task_timeout_ms = ms;
        }
        if self.memory_optimization {
            cfg.dispatch.memory_optimization = true;
        }
        if !self.api_keys.is_empty() {
            cfg.api_keys = self.api_keys;
        }
        if let Some(ms) = self.demo_latency_ms {
            cfg.demo_latency_ms = ms;
        }
        Ok((cfg, self.log))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (cfg, log) = Args::parse().into_config()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    report_sizing(&cfg);

    let dispatcher = Dispatcher::start(
        cfg.dispatch.clone(),
        Arc::new(DemoModelLoader::new(Duration::from_millis(cfg.demo_latency_ms))),
        Arc::new(ImagePreprocessor),
    )
    .await
    .context("start recognition workers")?;

    if cfg.auth_required() {
        info!(keys = cfg.api_keys.len(), "API key check enabled");
    }
    let addr: SocketAddr = cfg
        .listen
        .parse()
        .with_context(|| format!("parse listen address {}", cfg.listen))?;
    let app = router(AppState::new(RecognitionService::new(dispatcher.clone()), cfg));

    info!(listen = %addr, "daemon starting");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown().await;
    Ok(())
}

/// Logs a pool-size recommendation for this host next to the configured size.
fn report_sizing(cfg: &DaemonConfig) {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    let Some(memory_mb) = total_memory_mb() else {
        warn!("could not read host memory; skipping pool sizing advice");
        return;
    };
    let rec = cfg.dispatch.recommend(cpus, memory_mb);
    info!(
        cpus,
        memory_mb,
        configured_pool = cfg.dispatch.pool_size,
        configured_memory_mb = cfg.dispatch.estimated_memory_mb(),
        recommended_pool = rec.pool_size,
        recommended_memory_mb = rec.estimated_memory_mb,
        "pool sizing"
    );
    if cfg.dispatch.estimated_memory_mb() > memory_mb {
        warn!("configured pool may not fit in host memory");
    }
    if let Some(hint) = rec.hint {
        info!("{hint}");
    }
}

fn total_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
}
