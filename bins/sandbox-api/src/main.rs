mod error;
mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use futures_util::StreamExt;
use sandbox_common::redis::COMPLETIONS_CHANNEL;
use sandbox_common::{CompletionEvent, Config, JobQueue, RedisQueue, RequestLimits};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub limits: RequestLimits,
    pub max_attempts: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Sandbox API booting...");
    let config = Config::from_env();

    // Initialize metrics
    metrics::init_metrics();
    info!("Metrics registry initialized");

    let queue = RedisQueue::from_config(&config)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis: {}", config.redis_url);

    let state = Arc::new(AppState {
        queue: Arc::new(queue),
        limits: config.request_limits(),
        max_attempts: config.max_attempts,
    });

    // Start background metrics subscriber
    let client = redis::Client::open(config.redis_url.as_str())
        .context("Invalid REDIS_URL")?;
    tokio::spawn(metrics_subscriber(client));

    let app = routes::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("API shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

/// Background task: job completion events from workers feed the metrics
async fn metrics_subscriber(client: redis::Client) {
    loop {
        match listen_for_completions(&client).await {
            Ok(()) => warn!("Completion channel closed, resubscribing"),
            Err(e) => error!(error = %e, "Metrics subscriber failed, resubscribing"),
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn listen_for_completions(client: &redis::Client) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(COMPLETIONS_CHANNEL).await?;
    info!("Metrics subscriber started - listening for job completions");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };
        match serde_json::from_str::<CompletionEvent>(&payload) {
            Ok(event) => {
                metrics::record_job_completed(&event);
                debug!(
                    job_id = %event.job_id,
                    language = %event.language,
                    status = %event.status,
                    "Recorded job completion metrics"
                );
            }
            Err(e) => warn!(error = %e, "Ignoring malformed completion event"),
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
