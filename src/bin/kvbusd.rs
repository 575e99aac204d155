//! The pub/sub server daemon.
//!
//! Wires configuration, logging, metrics and the PID file around the
//! library: one listener for the API, one for status/metrics, both shut down
//! on ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation as FileRotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use kvbus::config::{Config, LoggerConfig, Rotation};
use kvbus::metrics::{self, LogMetricsLayer};
use kvbus::server;
use kvbus::service::Service;
use kvbus::store::MemoryStore;

/// Target prefix the store backend logs under; routed to the KV logger
/// block.
const STORE_TARGET: &str = "kvbus::store";

#[derive(Debug, Parser)]
#[command(name = "kvbusd", version, about = "Durable pub/sub on a transactional KV store")]
struct Args {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the API listen address from the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    // Metrics before logging: the log layer counts into the registry.
    metrics::init();
    let _guards = init_logging(&config)?;

    if !config.server.pd_addrs.is_empty() {
        info!(
            pd_addrs = ?config.server.pd_addrs,
            "embedded memory store in use, pd-addrs ignored",
        );
    }

    #[cfg(feature = "transport-tls")]
    let tls: server::TlsConfig = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => Some(server::load_server_config(cert, key)?),
        _ => None,
    };

    #[cfg(not(feature = "transport-tls"))]
    let tls = {
        if config.tls_enabled() {
            tracing::warn!("TLS configured but the transport-tls feature is disabled");
        }
        server::TlsConfig::default()
    };

    std::fs::write(&config.pid_filename, format!("{}\n", std::process::id()))?;

    let service = Arc::new(Service::new(MemoryStore::new()));

    let api_listener = TcpListener::bind(&config.server.listen).await?;
    let status_listener = TcpListener::bind(&config.status.listen).await?;
    info!(
        api = %config.server.listen,
        status = %config.status.listen,
        "listening",
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        let _ = shutdown_tx.send(());
    });

    let mut status_shutdown = shutdown_rx.clone();
    let status_task = tokio::spawn(server::serve(
        status_listener,
        server::status_router(),
        Default::default(),
        async move {
            let _ = status_shutdown.changed().await;
        },
    ));

    let mut api_shutdown = shutdown_rx;
    server::serve(api_listener, server::router(service), tls, async move {
        let _ = api_shutdown.changed().await;
    })
    .await?;

    let _ = status_task.await;
    let _ = std::fs::remove_file(&config.pid_filename);

    Ok(())
}

/// Install the subscriber stack: the service logger, a separate sink for the
/// store backend, and the log-entry counter layer. Returned guards keep the
/// non-blocking writers flushing until exit.
fn init_logging(config: &Config) -> Result<Vec<WorkerGuard>, Box<dyn std::error::Error>> {
    let mut guards = Vec::new();

    if config.logger.compress || config.kv_logger.compress {
        // Recognised for config compatibility only.
        eprintln!("log compression is not applied to rotated files");
    }

    // Store events go to the KV logger's sink only.
    let service_filter = EnvFilter::try_new(&config.logger.level)?
        .add_directive(format!("{STORE_TARGET}=off").parse()?);
    let service_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer_for(&config.logger, &mut guards))
        .with_ansi(config.logger.path.is_none())
        .with_filter(service_filter);

    let kv_level: tracing::Level = config.kv_logger.level.parse()?;
    let kv_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer_for(&config.kv_logger, &mut guards))
        .with_ansi(config.kv_logger.path.is_none())
        .with_filter(Targets::new().with_target(STORE_TARGET, kv_level));

    tracing_subscriber::registry()
        .with(LogMetricsLayer::new(config.logger.name.clone()))
        .with(service_layer)
        .with(kv_layer)
        .init();

    Ok(guards)
}

fn writer_for(logger: &LoggerConfig, guards: &mut Vec<WorkerGuard>) -> NonBlocking {
    let (writer, guard) = match &logger.path {
        Some(path) => {
            let appender = RollingFileAppender::new(
                rotation(logger.rotation),
                path,
                format!("{}.log", logger.name),
            );
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    guards.push(guard);
    writer
}

fn rotation(rotation: Rotation) -> FileRotation {
    match rotation {
        Rotation::Minutely => FileRotation::MINUTELY,
        Rotation::Hourly => FileRotation::HOURLY,
        Rotation::Daily => FileRotation::DAILY,
        Rotation::Never => FileRotation::NEVER,
    }
}
