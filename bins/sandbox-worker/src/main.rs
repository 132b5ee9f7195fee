mod deadline;
mod health;
mod launcher;
mod output;
mod runner;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sandbox_common::{Config, JobQueue, RedisQueue};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::health::HealthState;
use crate::launcher::DockerLauncher;
use crate::runner::LanguageRunner;
use crate::worker::Worker;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Sandbox worker booting...");
    let config = Config::from_env();

    let launcher = Arc::new(
        DockerLauncher::connect(
            config.sandbox_image.clone(),
            config.resource_limits(),
            Duration::from_millis(config.launch_timeout_ms),
        )
        .context("Failed to connect to Docker")?,
    );
    if let Err(e) = launcher.ensure_image().await {
        warn!(image = %config.sandbox_image, error = %e, "Sandbox image not available yet");
    }
    let runner = Arc::new(LanguageRunner::new(
        launcher.clone(),
        config.scratch_root.clone(),
        Duration::from_millis(config.compile_timeout_ms),
    ));

    let workers = config.worker_concurrency.max(1);
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // Each worker blocks on its own connection
    for id in 0..workers {
        let queue: Arc<dyn JobQueue> = Arc::new(
            RedisQueue::from_config(&config)
                .await
                .context("Failed to connect to Redis")?,
        );
        let worker = Worker::new(id, queue, runner.clone())
            .with_poll_interval(config.poll_interval())
            .with_lease_renewal(config.lease_renewal_interval());
        tasks.spawn(worker.run(shutdown.clone()));
    }
    info!(
        workers,
        redis = %config.redis_url,
        image = %config.sandbox_image,
        lease_secs = config.lease_duration().as_secs(),
        "Worker pool started"
    );

    let maintenance_queue: Arc<dyn JobQueue> = Arc::new(
        RedisQueue::from_config(&config)
            .await
            .context("Failed to connect to Redis")?,
    );
    tasks.spawn(maintenance(maintenance_queue, shutdown.clone()));

    let health = health::routes(Arc::new(HealthState {
        workers,
        launcher,
        start_time: std::time::Instant::now(),
    }));
    let addr = format!("0.0.0.0:{}", config.worker_health_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;
    info!("Health endpoint listening on {}", addr);
    let health_shutdown = shutdown.clone();
    tasks.spawn(async move {
        if let Err(e) = axum::serve(listener, health)
            .with_graceful_shutdown(health_shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "Health server error");
        }
    });

    signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, finishing in-flight jobs...");
    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task ended abnormally");
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Promote due retries and hand orphaned deliveries back to the retry path
async fn maintenance(queue: Arc<dyn JobQueue>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match queue.promote_due().await {
            Ok(0) => {}
            Ok(promoted) => debug!(promoted, "Promoted delayed retries"),
            Err(e) => warn!(error = %e, "Retry promotion failed"),
        }
        match queue.reap().await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "Recovered orphaned jobs"),
            Err(e) => warn!(error = %e, "Reaper sweep failed"),
        }
    }
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
