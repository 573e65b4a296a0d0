use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    artifact_store::StorageArea,
    auth::{authenticate, verify_bearer},
    credits::calculate_credits,
    error::{QueueError, QueueResult},
    models::{GenerationParams, GenerationRecord, ImageInput, LedgerKind, RecordStatus},
    rate_limit::RateLimitDecision,
    AppState,
};

const RECENT_TRANSACTIONS: usize = 20;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/generations", post(create_generation))
        .route(
            "/v1/generations/{uuid}",
            get(get_generation).delete(delete_generation),
        )
        .route("/v1/credits", get(get_credits))
        .route("/v1/credits/recharge", post(recharge_credits))
        .route("/v1/queue", get(queue_stats))
        .route(
            "/api/storage/3d-models/{user}/{record}/{file}",
            get(serve_model_file),
        )
        .route(
            "/api/storage/3d-multiview/{user}/{record}/{file}",
            get(serve_multiview_file),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message.into()
            }
        })),
    )
        .into_response()
}

fn not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "RECORD_NOT_FOUND",
        "Generation not found.",
    )
}

fn queue_error_response(err: &QueueError) -> Response {
    let status = match err {
        QueueError::RecordNotFound(_) | QueueError::QueueEntryNotFound(_) => StatusCode::NOT_FOUND,
        QueueError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        QueueError::InvalidParams(_) | QueueError::InvalidPathComponent(_) => {
            StatusCode::BAD_REQUEST
        }
        QueueError::AlreadyQueued(_) => StatusCode::CONFLICT,
        QueueError::Provider { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match err {
        QueueError::InsufficientCredits { .. }
        | QueueError::RecordNotFound(_)
        | QueueError::QueueEntryNotFound(_)
        | QueueError::AlreadyQueued(_)
        | QueueError::InvalidPathComponent(_) => err.to_string(),
        _ => err.user_message(),
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {err}");
    }
    error_response(status, err.code(), message)
}

fn rate_limited(decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after.as_secs_f64().ceil().max(1.0) as u64;
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "RATE_LIMITED",
        "Too many generation requests, please slow down.",
    );
    let headers = response.headers_mut();
    for (name, value) in [
        ("retry-after", retry_after.to_string()),
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
    ] {
        if let Ok(value) = value.parse() {
            headers.insert(name, value);
        }
    }
    response
}

pub async fn create_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<GenerationParams>,
) -> impl IntoResponse {
    let user = match authenticate(&headers, &state.config.api_key) {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    let decision = state.submit_limiter.check(&user).await;
    if !decision.allowed {
        return rate_limited(&decision);
    }

    match submit_generation(&state, &user, params).await {
        Ok(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
        Err(err) => queue_error_response(&err),
    }
}

async fn submit_generation(
    state: &AppState,
    user: &str,
    params: GenerationParams,
) -> QueueResult<Value> {
    let mut record = GenerationRecord::new(user, params, 0);
    let balance = match admit(state, &mut record).await {
        Ok(balance) => balance,
        Err(err) => {
            if let Err(cleanup) = state.artifacts.delete_all(user, record.uuid).await {
                warn!(record_uuid = %record.uuid, "Failed to discard uploaded views: {cleanup}");
            }
            return Err(err);
        }
    };

    let tier = record.params.tier();
    if let Err(err) = state.scheduler.enqueue(record.uuid, tier).await {
        error!(record_uuid = %record.uuid, "Failed to queue charged generation: {err}");
        if let Err(mark) = state
            .store
            .mark_record_failed(record.uuid, &err.user_message(), Utc::now())
            .await
        {
            error!(record_uuid = %record.uuid, "Failed to mark record failed: {mark}");
        }
        if record.credits_used > 0 {
            if let Err(refund) = state
                .store
                .refund(user, record.credits_used, record.uuid)
                .await
            {
                error!(
                    alert = "refund_failed",
                    record_uuid = %record.uuid,
                    amount = record.credits_used,
                    "Refund after queueing failure did not go through: {refund}"
                );
            }
        }
        return Err(err);
    }

    let queue = state.scheduler.get_status(record.uuid).await.ok();
    Ok(json!({
        "uuid": record.uuid,
        "tier": tier,
        "kind": record.kind,
        "creditsUsed": record.credits_used,
        "balance": balance,
        "queue": queue,
    }))
}

/// Turns inline view images into served URLs, validates, prices and stores
/// the record with its charge. Returns the balance after the debit.
async fn admit(state: &AppState, record: &mut GenerationRecord) -> QueueResult<i64> {
    if let GenerationParams::Pro(pro) = &mut record.params {
        for view in &mut pro.multi_view_images {
            let ImageInput::Base64(data) = &view.image else {
                continue;
            };
            let url = state
                .artifacts
                .save_multiview_image(&record.user_uuid, record.uuid, view.view_type, data)
                .await?;
            view.image = ImageInput::Url(url);
        }
    }

    record.params.validate()?;
    record.credits_used = calculate_credits(&record.params, &state.config.credit_pricing());
    state.store.insert_record_charged(record).await
}

async fn owned_record(
    state: &AppState,
    user: &str,
    raw_uuid: &str,
) -> Result<GenerationRecord, Response> {
    let Ok(uuid) = Uuid::parse_str(raw_uuid) else {
        return Err(not_found());
    };
    match state.store.get_record(uuid).await {
        Ok(Some(record)) if record.user_uuid == user => Ok(record),
        Ok(_) => Err(not_found()),
        Err(err) => Err(queue_error_response(&err)),
    }
}

pub async fn get_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let user = match authenticate(&headers, &state.config.api_key) {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let record = match owned_record(&state, &user, &uuid).await {
        Ok(record) => record,
        Err(response) => return response,
    };

    let queue = if matches!(
        record.status,
        RecordStatus::Pending | RecordStatus::Processing
    ) {
        state.scheduler.get_status(record.uuid).await.ok()
    } else {
        None
    };

    (StatusCode::OK, Json(json!({ "record": record, "queue": queue }))).into_response()
}

pub async fn delete_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let user = match authenticate(&headers, &state.config.api_key) {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let record = match owned_record(&state, &user, &uuid).await {
        Ok(record) => record,
        Err(response) => return response,
    };

    if matches!(
        record.status,
        RecordStatus::Pending | RecordStatus::Processing
    ) {
        return error_response(
            StatusCode::CONFLICT,
            "GENERATION_IN_PROGRESS",
            "Generation is still in progress.",
        );
    }

    if let Err(err) = state.artifacts.delete_all(&user, record.uuid).await {
        return queue_error_response(&err);
    }
    if let Err(err) = state.store.delete_record(record.uuid).await {
        return queue_error_response(&err);
    }

    (
        StatusCode::OK,
        Json(json!({ "uuid": record.uuid, "deleted": true })),
    )
        .into_response()
}

fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "glb" => "model/gltf-binary",
        "obj" => "model/obj",
        "stl" => "model/stl",
        "usdz" => "model/vnd.usdz+zip",
        "mp4" => "video/mp4",
        "gif" => "image/gif",
        "png" => "image/png",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

async fn read_stored_file(
    state: &AppState,
    area: StorageArea,
    user: &str,
    record_uuid: Uuid,
    file_name: &str,
) -> Response {
    let path = match state
        .artifacts
        .resolve_file(area, user, record_uuid, file_name)
    {
        Ok(path) => path,
        Err(_) => return not_found_file(),
    };

    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return not_found_file(),
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "FILE_READ_FAILED",
                format!("Failed to read file: {err}"),
            )
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(file_name))
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{file_name}\""),
        )
        .body(Body::from(bytes))
        .unwrap_or_else(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "RESPONSE_BUILD_FAILED",
                "Failed to build file response.",
            )
        })
}

fn not_found_file() -> Response {
    error_response(StatusCode::NOT_FOUND, "FILE_NOT_FOUND", "File not found.")
}

/// Owner-only access to generated files; gone once the record has expired.
pub async fn serve_model_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner, record, file)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let user = match authenticate(&headers, &state.config.api_key) {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    if user != owner {
        return error_response(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "You do not have access to this file.",
        );
    }
    let record = match owned_record(&state, &user, &record).await {
        Ok(record) => record,
        Err(_) => return not_found_file(),
    };

    let expired = record.status == RecordStatus::Expired
        || record.expires_at.is_some_and(|at| at <= Utc::now());
    if expired {
        return error_response(
            StatusCode::GONE,
            "FILE_EXPIRED",
            "This generation has expired and its files were removed.",
        );
    }

    read_stored_file(&state, StorageArea::Models, &user, record.uuid, &file).await
}

/// Uploaded view images, fetched by the provider without credentials.
pub async fn serve_multiview_file(
    State(state): State<AppState>,
    Path((owner, record, file)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let Ok(record_uuid) = Uuid::parse_str(&record) else {
        return not_found_file();
    };
    read_stored_file(&state, StorageArea::MultiView, &owner, record_uuid, &file).await
}

pub async fn get_credits(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let user = match authenticate(&headers, &state.config.api_key) {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    let result = async {
        let balance = state.store.balance(&user).await?;
        let transactions = state.store.transactions(&user, RECENT_TRANSACTIONS).await?;
        Ok::<_, QueueError>(json!({ "balance": balance, "transactions": transactions }))
    }
    .await;

    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => queue_error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct RechargeRequest {
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn recharge_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RechargeRequest>,
) -> impl IntoResponse {
    let user = match authenticate(&headers, &state.config.api_key) {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    if payload.amount <= 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_AMOUNT",
            "Recharge amount must be positive.",
        );
    }

    let reason = payload.reason.as_deref().unwrap_or("recharge");
    match state
        .store
        .credit(&user, payload.amount, LedgerKind::Recharge, reason, None)
        .await
    {
        Ok(balance) => (StatusCode::OK, Json(json!({ "balance": balance }))).into_response(),
        Err(err) => queue_error_response(&err),
    }
}

pub async fn queue_stats(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let result = async {
        let scheduler = state.scheduler.stats().await?;
        let storage = state.artifacts.storage_stats().await?;
        Ok::<_, QueueError>(json!({ "scheduler": scheduler, "storage": storage }))
    }
    .await;

    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => queue_error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Duration;
    use reqwest::StatusCode as HttpStatus;

    use super::*;
    use crate::{
        artifact_store::{testing::spawn_file_server, ArtifactStore},
        clock::ManualClock,
        config::Config,
        models::{OutputArtifact, RemoteJobState, RemoteJobStatus, SubmitOutcome, Tier},
        provider::ModelProvider,
        rate_limit::RateLimiter,
        scheduler::{Scheduler, SchedulerSettings},
        store::Store,
    };

    struct IdleProvider;

    #[async_trait]
    impl ModelProvider for IdleProvider {
        async fn submit(&self, _params: &GenerationParams) -> QueueResult<SubmitOutcome> {
            Ok(SubmitOutcome {
                job_id: "job-1".to_string(),
                request_id: "req-1".to_string(),
            })
        }

        async fn query_status(&self, _job_id: &str, _tier: Tier) -> QueueResult<RemoteJobStatus> {
            Ok(RemoteJobStatus {
                state: RemoteJobState::Run,
                error_code: None,
                error_message: None,
                result_files: Vec::new(),
            })
        }
    }

    struct TestApp {
        base: String,
        state: AppState,
        http: reqwest::Client,
        _root: tempfile::TempDir,
    }

    impl TestApp {
        async fn start() -> Self {
            let root = tempfile::tempdir().expect("tempdir");
            let config = Config::for_tests(root.path());
            let store = Arc::new(Store::open_in_memory().expect("store"));
            let artifacts =
                ArtifactStore::new(root.path(), &config.public_base_url, reqwest::Client::new());
            let scheduler = Scheduler::new(
                store.clone(),
                Arc::new(IdleProvider),
                artifacts.clone(),
                Arc::new(ManualClock::at_hour(3)),
                SchedulerSettings::default(),
            );
            let state = AppState {
                config,
                store,
                scheduler,
                artifacts,
                submit_limiter: Arc::new(RateLimiter::new(600, 100)),
            };
            let base = spawn_file_server(router(state.clone())).await;
            Self {
                base,
                state,
                http: reqwest::Client::new(),
                _root: root,
            }
        }

        fn request(&self, method: reqwest::Method, path: &str, user: &str) -> reqwest::RequestBuilder {
            self.http
                .request(method, format!("{}{path}", self.base))
                .bearer_auth(&self.state.config.api_key)
                .header("X-User-Id", user)
        }
    }

    fn rapid_body() -> Value {
        json!({ "version": "rapid", "prompt": "a glass chess piece", "enablePBR": true })
    }

    #[tokio::test]
    async fn requests_without_api_key_are_rejected() {
        let app = TestApp::start().await;
        let response = app
            .http
            .post(format!("{}/v1/generations", app.base))
            .json(&rapid_body())
            .send()
            .await
            .expect("send");
        assert_eq!(response.status(), HttpStatus::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn insufficient_credits_is_payment_required() {
        let app = TestApp::start().await;
        let response = app
            .request(reqwest::Method::POST, "/v1/generations", "user-1")
            .json(&rapid_body())
            .send()
            .await
            .expect("send");
        assert_eq!(response.status(), HttpStatus::PAYMENT_REQUIRED);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["error"]["code"], "INSUFFICIENT_CREDITS");
    }

    #[tokio::test]
    async fn accepted_generation_is_charged_and_visible_to_owner_only() {
        let app = TestApp::start().await;
        let recharge = app
            .request(reqwest::Method::POST, "/v1/credits/recharge", "user-1")
            .json(&json!({ "amount": 50 }))
            .send()
            .await
            .expect("send");
        assert_eq!(recharge.status(), HttpStatus::OK);

        let response = app
            .request(reqwest::Method::POST, "/v1/generations", "user-1")
            .json(&rapid_body())
            .send()
            .await
            .expect("send");
        assert_eq!(response.status(), HttpStatus::ACCEPTED);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["creditsUsed"], 15);
        assert_eq!(body["balance"], 35);
        let uuid = body["uuid"].as_str().expect("uuid").to_string();

        let own = app
            .request(reqwest::Method::GET, &format!("/v1/generations/{uuid}"), "user-1")
            .send()
            .await
            .expect("send");
        assert_eq!(own.status(), HttpStatus::OK);

        let other = app
            .request(reqwest::Method::GET, &format!("/v1/generations/{uuid}"), "user-2")
            .send()
            .await
            .expect("send");
        assert_eq!(other.status(), HttpStatus::NOT_FOUND);

        let delete = app
            .request(reqwest::Method::DELETE, &format!("/v1/generations/{uuid}"), "user-1")
            .send()
            .await
            .expect("send");
        assert_eq!(delete.status(), HttpStatus::CONFLICT);

        let credits: Value = app
            .request(reqwest::Method::GET, "/v1/credits", "user-1")
            .send()
            .await
            .expect("send")
            .json()
            .await
            .expect("json");
        assert_eq!(credits["balance"], 35);
        assert_eq!(credits["transactions"].as_array().expect("list").len(), 2);
    }

    #[tokio::test]
    async fn invalid_params_are_bad_request() {
        let app = TestApp::start().await;
        let response = app
            .request(reqwest::Method::POST, "/v1/generations", "user-1")
            .json(&json!({ "version": "pro", "prompt": "x", "faceCount": 10 }))
            .send()
            .await
            .expect("send");
        assert_eq!(response.status(), HttpStatus::BAD_REQUEST);
    }

    async fn completed_record(app: &TestApp, expires_in: Duration) -> Uuid {
        let record = GenerationRecord::new(
            "user-1",
            GenerationParams::Rapid(Default::default()),
            0,
        );
        app.state.store.insert_record(&record).await.expect("insert");
        let path = app
            .state
            .artifacts
            .resolve_file(StorageArea::Models, "user-1", record.uuid, "model.glb")
            .expect("path");
        fs::create_dir_all(path.parent().expect("parent"))
            .await
            .expect("mkdir");
        fs::write(&path, b"glTF").await.expect("write");
        let artifact = OutputArtifact {
            file_type: "GLB".to_string(),
            url: String::new(),
            file_name: "model.glb".to_string(),
            preview_image_url: None,
            size_bytes: 4,
        };
        let now = Utc::now();
        app.state
            .store
            .mark_record_completed(record.uuid, &[artifact], now, now + expires_in)
            .await
            .expect("complete");
        record.uuid
    }

    #[tokio::test]
    async fn stored_files_are_served_to_owner_until_expiry() {
        let app = TestApp::start().await;
        let live = completed_record(&app, Duration::days(7)).await;
        let stale = completed_record(&app, Duration::days(-1)).await;

        let ok = app
            .request(
                reqwest::Method::GET,
                &format!("/api/storage/3d-models/user-1/{live}/model.glb"),
                "user-1",
            )
            .send()
            .await
            .expect("send");
        assert_eq!(ok.status(), HttpStatus::OK);
        assert_eq!(
            ok.headers()[header::CONTENT_TYPE.as_str()],
            "model/gltf-binary"
        );
        assert_eq!(ok.bytes().await.expect("bytes").as_ref(), b"glTF");

        let missing = app
            .request(
                reqwest::Method::GET,
                &format!("/api/storage/3d-models/user-1/{live}/model.obj"),
                "user-1",
            )
            .send()
            .await
            .expect("send");
        assert_eq!(missing.status(), HttpStatus::NOT_FOUND);

        let gone = app
            .request(
                reqwest::Method::GET,
                &format!("/api/storage/3d-models/user-1/{stale}/model.glb"),
                "user-1",
            )
            .send()
            .await
            .expect("send");
        assert_eq!(gone.status(), HttpStatus::GONE);

        let foreign = app
            .request(
                reqwest::Method::GET,
                &format!("/api/storage/3d-models/user-1/{live}/model.glb"),
                "user-2",
            )
            .send()
            .await
            .expect("send");
        assert_eq!(foreign.status(), HttpStatus::FORBIDDEN);

        let delete = app
            .request(reqwest::Method::DELETE, &format!("/v1/generations/{live}"), "user-1")
            .send()
            .await
            .expect("send");
        assert_eq!(delete.status(), HttpStatus::OK);
        assert!(app.state.store.get_record(live).await.expect("get").is_none());
    }
}
