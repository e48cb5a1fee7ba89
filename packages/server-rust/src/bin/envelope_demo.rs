//! Demo server: the full envelope in front of a simulated backend.
//!
//! ```text
//! envelope-demo --bind 127.0.0.1:8080
//! curl 'localhost:8080/ops/payments?latency_ms=20'
//! curl 'localhost:8080/ops/reports?fail=transient'
//! curl localhost:8080/breakers
//! curl localhost:8080/metrics
//! ```

use std::sync::Arc;

use clap::Parser;
use envelope_server::config::EnvelopeConfig;
use envelope_server::observability::{init_tracing, install_prometheus_recorder, RecorderSink};
use envelope_server::service::Envelope;
use envelope_server::transport::{build_router, AppState};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "envelope-demo", about = "Service quality envelope demo server", long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(short, long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind: String,

    #[command(flatten)]
    envelope: EnvelopeConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.envelope.log_level, cli.envelope.log_format)?;

    let metrics = install_prometheus_recorder()?;
    let envelope = Envelope::from_config(&cli.envelope, Arc::new(RecorderSink))?;
    info!(
        max_concurrent = envelope.shedder().limit(),
        default_timeout_ms = u64::try_from(envelope.default_timeout().as_millis()).unwrap_or(u64::MAX),
        max_attempts = envelope.retry().policy().max_attempts,
        "envelope configured"
    );

    let router = build_router(AppState {
        envelope,
        metrics: Some(metrics),
    });

    let listener = TcpListener::bind(&cli.bind).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
