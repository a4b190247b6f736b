//! Job intake and review endpoints.

use autopost_core::{Job, JobId, JobStatus, NewJob};
use autopost_db::JobFilter;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::AppState;
use crate::error::ApiError;

/// Upper bound for a single listing.
const MAX_LIST_LIMIT: u32 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/{id}", get(get_job))
        .route("/{id}/approve", post(approve_job))
        .route("/{id}/cancel", post(cancel_job))
        .route("/{id}/reauthorize", post(reauthorize_job))
}

#[derive(Debug, Serialize)]
struct JobResponse {
    #[serde(flatten)]
    job: Job,
    /// User title if given, else the generated one.
    title: Option<String>,
    /// User and generated hashtags combined.
    hashtags: BTreeSet<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            title: job.effective_title().map(str::to_string),
            hashtags: job.effective_hashtags(),
            job,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    owner: Option<String>,
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let filter = JobFilter {
        owner: query.owner,
        status,
        limit: Some(query.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT)),
    };

    let jobs = state.pipeline.list(&filter).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<NewJob>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = state.pipeline.submit(req).await?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.pipeline.get(&JobId::from(id)).await?;
    Ok(Json(job.into()))
}

#[derive(Debug, Default, Deserialize)]
struct ApproveRequest {
    scheduled_time: Option<DateTime<Utc>>,
}

/// The body is optional; without one the job keeps its suggested time.
async fn approve_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<JobResponse>, ApiError> {
    let req: ApproveRequest = if body.is_empty() {
        ApproveRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid approve request: {}", e)))?
    };

    let job = state
        .pipeline
        .approve(&JobId::from(id), req.scheduled_time)
        .await?;
    Ok(Json(job.into()))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.pipeline.cancel(&JobId::from(id)).await?;
    Ok(Json(job.into()))
}

async fn reauthorize_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.pipeline.reauthorize(&JobId::from(id)).await?;
    Ok(Json(job.into()))
}

#[cfg(test)]
mod tests {
    use crate::{AppState, routes};
    use autopost_core::{ManualClock, RetryPolicy};
    use autopost_db::MemoryJobStore;
    use autopost_scheduler::{ClaimManager, Pipeline};
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        claims: ClaimManager,
        pipeline: Arc<Pipeline>,
    }

    fn app() -> TestApp {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        let pipeline = Arc::new(
            Pipeline::new(store.clone(), clock.clone()).with_retry_policy(RetryPolicy::immediate()),
        );
        TestApp {
            router: routes::router(AppState::new(pipeline.clone())),
            claims: ClaimManager::new(store, clock),
            pipeline,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn new_job() -> Value {
        json!({
            "owner": "user-1",
            "group": "brand",
            "platform": "tiktok",
            "media": { "location": "/uploads/a.mp4", "storage": "local" },
            "title": "Launch",
            "hashtags": ["#launch", "launch", " "],
        })
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let app = app();
        let (status, created) = send(&app.router, "POST", "/api/v1/jobs", Some(new_job())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "queued");
        assert_eq!(created["title"], "Launch");
        assert_eq!(created["hashtags"], json!(["launch"]));

        let id = created["id"].as_str().unwrap();
        let (status, fetched) = send(&app.router, "GET", &format!("/api/v1/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], id);
        assert_eq!(fetched["retry_count"], 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_owner() {
        let app = app();
        let mut body = new_job();
        body["owner"] = json!("");
        let (status, error) = send(&app.router, "POST", "/api/v1/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error["error"].as_str().unwrap().contains("owner"));
    }

    #[tokio::test]
    async fn test_submit_rejects_oversized_max_retries() {
        let app = app();
        let mut body = new_job();
        body["max_retries"] = json!(4_000_000_000u64);
        let (status, error) = send(&app.router, "POST", "/api/v1/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error["error"].as_str().unwrap().contains("max_retries"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let app = app();
        let (status, error) = send(&app.router, "GET", "/api/v1/jobs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(error["error"].is_string());
    }

    #[tokio::test]
    async fn test_list_filters_and_rejects_bad_status() {
        let app = app();
        send(&app.router, "POST", "/api/v1/jobs", Some(new_job())).await;
        let mut other = new_job();
        other["owner"] = json!("user-2");
        send(&app.router, "POST", "/api/v1/jobs", Some(other)).await;

        let (status, jobs) = send(
            &app.router,
            "GET",
            "/api/v1/jobs?owner=user-2&status=queued",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jobs.as_array().unwrap().len(), 1);
        assert_eq!(jobs[0]["owner"], "user-2");

        let (status, _) = send(&app.router, "GET", "/api/v1/jobs?status=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_approve_flow() {
        let app = app();
        let (_, created) = send(&app.router, "POST", "/api/v1/jobs", Some(new_job())).await;
        let id = created["id"].as_str().unwrap().to_string();

        // Not reviewable yet.
        let (status, _) = send(&app.router, "POST", &format!("/api/v1/jobs/{}/approve", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let job = app.claims.claim_next_queued("w1").await.unwrap().unwrap();
        app.pipeline
            .complete_generation(
                &job.id,
                "w1",
                Ok(autopost_core::GeneratedContent {
                    title: "AI title".to_string(),
                    hook: "hook".to_string(),
                    hashtags: vec!["ai".to_string()],
                    post_time: None,
                }),
            )
            .await
            .unwrap();

        let (status, approved) = send(
            &app.router,
            "POST",
            &format!("/api/v1/jobs/{}/approve", id),
            Some(json!({ "scheduled_time": "2030-01-01T09:00:00Z" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["status"], "scheduled");
        assert_eq!(approved["scheduled_time"], "2030-01-01T09:00:00Z");
        assert_eq!(approved["title"], "Launch");
        assert_eq!(approved["hashtags"], json!(["ai", "launch"]));
    }

    #[tokio::test]
    async fn test_cancel_twice_conflicts() {
        let app = app();
        let (_, created) = send(&app.router, "POST", "/api/v1/jobs", Some(new_job())).await;
        let uri = format!("/api/v1/jobs/{}/cancel", created["id"].as_str().unwrap());

        let (status, canceled) = send(&app.router, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(canceled["status"], "canceled");

        let (status, _) = send(&app.router, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_reauthorize_requires_needs_reauth() {
        let app = app();
        let (_, created) = send(&app.router, "POST", "/api/v1/jobs", Some(new_job())).await;
        let uri = format!("/api/v1/jobs/{}/reauthorize", created["id"].as_str().unwrap());
        let (status, _) = send(&app.router, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let app = app();
        let (status, body) = send(&app.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app.router, "GET", "/health/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }
}
