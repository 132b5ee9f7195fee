// HTTP route handlers for the sandbox API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use sandbox_common::validator::supported_languages;
use sandbox_common::{validate, ExecutionResult, JobState, QueueStats, SubmitRequest};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub status: &'static str,
    pub job_id: Uuid,
    pub message: &'static str,
}

/// Either a pending job or its terminal payload
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum JobStatusResponse {
    Pending {
        status: JobState,
        #[serde(rename = "jobId")]
        job_id: Uuid,
        message: &'static str,
    },
    Finished(ExecutionResult),
}

#[derive(Debug, Serialize)]
pub struct LanguagesResponse {
    pub supported: Vec<&'static str>,
    pub count: usize,
}

/// POST /execute - Validate and queue a job
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        metrics::record_job_rejected("malformed_body");
        ApiError::MalformedBody(rejection.body_text())
    })?;

    let validated = validate(request, &state.limits).map_err(|e| {
        metrics::record_job_rejected(e.reason());
        e
    })?;

    let job = validated.into_job(state.max_attempts);
    state.queue.enqueue(&job).await?;

    metrics::record_job_submitted(job.language.as_str());
    info!(
        job_id = %job.id,
        language = %job.language,
        timeout_ms = job.timeout_ms,
        code_chars = job.source_code.chars().count(),
        "Job queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            status: "queued",
            job_id: job.id,
            message: "Job queued for execution",
        }),
    ))
}

/// GET /job/:id - Poll a job. Never mutates the stored result.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound)?;
    let snapshot = state
        .queue
        .status(job_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let response = match (snapshot.state, snapshot.result) {
        (state, Some(result)) if state.is_terminal() => JobStatusResponse::Finished(result),
        (JobState::Failed, None) => {
            JobStatusResponse::Finished(ExecutionResult::infrastructure_failure())
        }
        (state, _) => JobStatusResponse::Pending {
            status: state,
            job_id,
            message: "Job is still processing",
        },
    };
    Ok(Json(response))
}

/// GET /languages
pub async fn list_languages() -> Json<LanguagesResponse> {
    let supported = supported_languages();
    Json(LanguagesResponse {
        count: supported.len(),
        supported,
    })
}

/// GET /queue/stats
pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Result<Json<QueueStats>, ApiError> {
    let stats = state.queue.stats().await?;
    metrics::update_queue_depth(&stats);
    Ok(Json(stats))
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Ok(stats) = state.queue.stats().await {
        metrics::update_queue_depth(&stats);
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use crate::routes::router;
    use crate::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use sandbox_common::{
        ExecutionResult, ExecutionStatus, JobQueue, MemoryQueue, RequestLimits,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> (Router, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::default());
        let state = Arc::new(AppState {
            queue: queue.clone(),
            limits: RequestLimits::default(),
            max_attempts: 3,
        });
        (router(state), queue)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_execute(body: Value) -> Request<Body> {
        Request::post("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_queues_job() {
        let (app, queue) = app();

        let (status, body) = send(
            &app,
            post_execute(json!({"language": "javascript", "code": "console.log(1+2)"})),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["message"], "Job queued for execution");
        let job_id = Uuid::parse_str(body["jobId"].as_str().unwrap()).unwrap();

        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.job.id, job_id);
        assert_eq!(delivery.job.timeout_ms, 2000);
        assert_eq!(delivery.job.stdin, "");
    }

    #[tokio::test]
    async fn test_submit_accepts_aliases_and_input() {
        let (app, queue) = app();

        let (status, _) = send(
            &app,
            post_execute(json!({
                "language": "python3",
                "code": "print(int(input())*5)",
                "input": "1",
                "timeout": 500
            })),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.job.stdin, "1");
        assert_eq!(delivery.job.timeout_ms, 500);
    }

    #[tokio::test]
    async fn test_validation_failure_never_enqueues() {
        let (app, queue) = app();

        let cases = [
            json!({"code": "print(1)"}),
            json!({"language": "ruby", "code": "puts 1"}),
            json!({"language": "python", "code": ""}),
            json!({"language": "python", "code": "x".repeat(10_001)}),
            json!({"language": "python", "code": "print(1)", "input": "y".repeat(1001)}),
            json!({"language": "python", "code": "print(1)", "timeout": 99}),
            json!({"language": "python", "code": "print(1)", "timeout": 5001}),
        ];
        for case in cases {
            let (status, body) = send(&app, post_execute(case)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["status"], "error");
            assert!(body["message"].as_str().is_some());
        }

        assert_eq!(queue.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (app, _) = app();
        let request = Request::post("/execute")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_poll_pending_then_terminal() {
        let (app, queue) = app();
        let (_, body) = send(
            &app,
            post_execute(json!({"language": "python", "code": "print(1)"})),
        )
        .await;
        let job_id = body["jobId"].as_str().unwrap().to_string();
        let uri = format!("/job/{}", job_id);

        let (status, body) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["jobId"], job_id);
        assert_eq!(body["message"], "Job is still processing");

        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let (_, body) = send(&app, get(&uri)).await;
        assert_eq!(body["status"], "active");

        let result = ExecutionResult {
            status: ExecutionStatus::Success,
            stdout: "1\n".into(),
            stderr: String::new(),
            runtime_ms: 35,
            memory_kb: 9000,
            killed: false,
            truncated: false,
        };
        queue.complete(delivery.job.id, &result).await.unwrap();

        let (status, first) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "success");
        assert_eq!(first["stdout"], "1\n");
        assert_eq!(first["runtime"], 35);
        assert_eq!(first["memory"], 9000);
        assert_eq!(first["killed"], false);

        let (_, second) = send(&app, get(&uri)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (app, _) = app();

        for uri in [format!("/job/{}", Uuid::new_v4()), "/job/not-a-uuid".to_string()] {
            let (status, body) = send(&app, get(&uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["status"], "error");
            assert_eq!(body["message"], "Job not found");
        }
    }

    #[tokio::test]
    async fn test_languages() {
        let (app, _) = app();

        let (status, body) = send(&app, get("/languages")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 5);
        let supported: Vec<&str> = body["supported"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(supported, vec!["javascript", "python", "java", "go", "cpp"]);
    }

    #[tokio::test]
    async fn test_queue_stats_total_is_waiting_plus_active() {
        let (app, queue) = app();
        for _ in 0..3 {
            send(
                &app,
                post_execute(json!({"language": "go", "code": "package main"})),
            )
            .await;
        }
        queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let (status, body) = send(&app, get("/queue/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["waiting"], 2);
        assert_eq!(body["active"], 1);
        assert_eq!(body["completed"], 0);
        assert_eq!(body["failed"], 0);
        assert_eq!(body["total"], 3);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (app, _) = app();

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
