//! The ePoxy boot server is the first point of contact for managed machines
//! as they boot.
//!
//! Managed machines progress through three boot stages: stage1 (local boot
//! media such as an iPXE ROM), stage2 (a minimal network boot environment),
//! and stage3 (the final system image). Machines are treated as stateless;
//! this server is the external state manager that mediates each transition.
//! A machine positively acknowledges every stage using session IDs minted on
//! its first request and known only to this server and the machine, so a
//! successful final report proves the same machine walked the whole
//! sequence.
//!
//! TLS termination and certificate management live in front of this
//! process; when deployed behind such a front-end, enable
//! `--allow-forwarded-requests` so the source-IP gate reads the forwarded
//! client address.

mod error;
mod handlers;
mod metrics;
mod proxy;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use epoxy_core::extension::ExtensionRegistry;
use epoxy_core::store::{HostStore, MemoryStore, SqliteStore};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::handlers::Env;
use crate::metrics::Metrics;

/// ePoxy boot server.
#[derive(Parser, Debug)]
#[command(name = "epoxy-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Public hostname of this service, used to emit absolute URLs.
    #[arg(long)]
    public_address: String,

    /// Project id substituted into extension URL templates.
    #[arg(long, default_value = "")]
    project: String,

    /// Address to serve the boot API on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Address to serve Prometheus metrics on.
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_listen: SocketAddr,

    /// Path to the SQLite host database. Uses a transient in-memory store
    /// when omitted.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Trust the X-Forwarded-For header for the source-IP gate. Enable only
    /// behind a trusted load balancer.
    #[arg(long)]
    allow_forwarded_requests: bool,

    /// Extension registration as NAME=URL. The URL may contain {{PROJECT}},
    /// replaced with --project. Repeatable.
    #[arg(long = "extension", value_name = "NAME=URL")]
    extensions: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_registry(args: &Args) -> Result<ExtensionRegistry> {
    let mut registry = ExtensionRegistry::new();
    for entry in &args.extensions {
        let (name, url) = entry
            .split_once('=')
            .with_context(|| format!("extension registration {entry:?} is not NAME=URL"))?;
        registry.register(name, url, &args.project);
    }
    Ok(registry)
}

fn open_store(args: &Args) -> Result<Arc<dyn HostStore>> {
    match &args.db {
        Some(path) => {
            let store = SqliteStore::open(path)
                .with_context(|| format!("failed to open host database {}", path.display()))?;
            info!(db = %path.display(), "using SQLite host store");
            Ok(Arc::new(store))
        },
        None => {
            warn!("no --db given; host records will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        },
    }
}

async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term.recv() => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let registry = build_registry(&args)?;
    for operation in registry.operations() {
        info!(operation, "registered extension");
    }

    let env = Arc::new(Env {
        store: open_store(&args)?,
        server_name: args.public_address.clone(),
        allow_forwarded: args.allow_forwarded_requests,
        extensions: registry,
        metrics: Arc::clone(&metrics),
        http: reqwest::Client::new(),
    });

    // Metrics are scraped from a dedicated port so the scrape path cannot
    // interfere with booting machines.
    let metrics_listener = tokio::net::TcpListener::bind(args.metrics_listen)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", args.metrics_listen))?;
    let metrics_router = Metrics::router(&metrics);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(metrics_listener, metrics_router).await {
            warn!(%err, "metrics listener exited");
        }
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, public = %args.public_address, "boot server ready");

    axum::serve(
        listener,
        handlers::router(env).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("boot server exited")?;

    Ok(())
}
