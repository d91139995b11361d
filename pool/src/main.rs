// Stratum pool server
//
// Upstream Beam node -> job manager -> miners (classic or login dialect)

use anyhow::{bail, Context, Result};
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get};
use std::sync::Arc;
use stratum_pool::algorithm::{Algorithm, NoopVerifier};
use stratum_pool::config::Config;
use stratum_pool::events::StratumEvent;
use stratum_pool::metrics::prometheus as metrics;
use stratum_pool::stratum::Stratum;
use stratum_pool::upstream::BeamNodeClient;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Operator console: one line per interesting event.
async fn log_events(mut events: broadcast::Receiver<StratumEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event log lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            StratumEvent::ClientConnect { client } => {
                tracing::info!("Client connected: {}", client.remote_address);
            }
            StratumEvent::ClientDisconnect { client, reason } => {
                tracing::info!("Client disconnected: {} {}", client.remote_address, reason);
            }
            StratumEvent::ClientAuthorize { client, worker_name } => {
                tracing::info!("Worker authorized: {} ({})", worker_name, client.remote_address);
            }
            StratumEvent::ShareSubmitted { client, share } => {
                let worker = client.worker_name.as_deref().unwrap_or("-");
                if share.is_valid_block {
                    tracing::info!("Valid block submitted by {} (block {:?})", worker, share.block_id);
                } else if share.is_valid_share == Some(true) {
                    tracing::info!("Valid share submitted by {}", worker);
                } else {
                    let reason = share.error.as_ref().map(|e| e.message().to_string()).unwrap_or_default();
                    tracing::info!("Invalid share submitted by {}: {}", worker, reason);
                }
            }
            StratumEvent::NewBlock { job } => {
                tracing::info!("New block at height {} (job {})", job.height(), job.id());
            }
            other => tracing::debug!("{}", other.name()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = Config::load().context("Failed to load configuration")?;
    cfg.validate().context("Invalid configuration")?;

    if !cfg.pow.trust_solutions {
        bail!("No proof-of-work verifier is linked into this binary; set pow.trust_solutions = true to run without verification");
    }
    tracing::warn!("pow.trust_solutions is enabled: solutions are NOT verified");
    let algorithm = Algorithm::beam_hash_iii(Arc::new(NoopVerifier));

    let upstream = Arc::new(BeamNodeClient::new(
        &cfg.upstream.host,
        cfg.upstream.port,
        cfg.upstream.api_key.clone(),
        cfg.upstream_timeout(),
    ));

    let metrics_listen = cfg.metrics_listen.clone();
    let stratum = Arc::new(Stratum::new(cfg, algorithm, upstream));
    tokio::spawn(log_events(stratum.subscribe_events()));

    stratum.start().await?;

    if let Some(addr) = metrics_listen {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind metrics listener {}", addr))?;
        let app = axum::Router::new().route("/metrics", get(api_metrics));
        tracing::info!("Metrics on http://{}/metrics", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to register Ctrl+C handler")?;
    tracing::info!("SIGINT - shutting down");
    stratum.stop().await;
    Ok(())
}
