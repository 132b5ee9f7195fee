// Worker health endpoint

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::launcher::ContainerLauncher;

pub struct HealthState {
    pub workers: usize,
    pub launcher: Arc<dyn ContainerLauncher>,
    pub start_time: std::time::Instant,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    workers: usize,
    docker: bool,
    uptime_seconds: u64,
}

pub fn routes(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
}

/// GET /health - 200 when Docker answers, 503 otherwise
async fn health_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let docker = state.launcher.ping().await;
    let body = HealthResponse {
        status: if docker { "healthy" } else { "degraded" },
        workers: state.workers,
        docker,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    };
    let code = if docker {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LaunchError, LaunchOutput, LaunchSpec};
    use crate::runner::tests::ScriptedLauncher;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct DownLauncher;

    #[async_trait]
    impl ContainerLauncher for DownLauncher {
        async fn launch(&self, _spec: LaunchSpec) -> Result<LaunchOutput, LaunchError> {
            Err(LaunchError::Unavailable("down".into()))
        }

        async fn ping(&self) -> bool {
            false
        }
    }

    async fn get_health(launcher: Arc<dyn ContainerLauncher>) -> (StatusCode, serde_json::Value) {
        let state = Arc::new(HealthState {
            workers: 2,
            launcher,
            start_time: std::time::Instant::now(),
        });
        let response = routes(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_healthy_when_docker_answers() {
        let (status, body) = get_health(Arc::new(ScriptedLauncher::default())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["workers"], 2);
        assert_eq!(body["docker"], true);
    }

    #[tokio::test]
    async fn test_degraded_without_docker() {
        let (status, body) = get_health(Arc::new(DownLauncher)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["docker"], false);
    }
}
