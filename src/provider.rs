//! Client for the remote 3D generation service.
//!
//! Each tier maps to its own submit/query action pair on the provider. Calls
//! are signed with TC3-HMAC-SHA256 and wrapped in the provider's
//! `{"Response": {...}}` envelope; provider error codes are translated into a
//! fixed set of user-facing messages before they leave this module.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{
    error::{QueueError, QueueResult},
    models::{
        GenerationParams, ImageInput, RemoteJobState, RemoteJobStatus, ResultFile, SubmitOutcome,
        Tier,
    },
    rate_limit::RateLimiter,
};

const API_VERSION: &str = "2025-05-13";
const SERVICE: &str = "ai3d";
const SIGNED_HEADERS: &str = "content-type;host;x-tc-action";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";

pub const FALLBACK_MESSAGE: &str =
    "The service is temporarily unavailable, we are working on it, please try again later";

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn submit(&self, params: &GenerationParams) -> QueueResult<SubmitOutcome>;

    async fn query_status(&self, job_id: &str, tier: Tier) -> QueueResult<RemoteJobStatus>;
}

pub fn submit_action(tier: Tier) -> &'static str {
    match tier {
        Tier::Rapid => "SubmitHunyuanTo3DRapidJob",
        Tier::Basic => "SubmitHunyuanTo3DJob",
        Tier::Pro => "SubmitHunyuanTo3DProJob",
    }
}

pub fn query_action(tier: Tier) -> &'static str {
    match tier {
        Tier::Rapid => "QueryHunyuanTo3DRapidJob",
        Tier::Basic => "QueryHunyuanTo3DJob",
        Tier::Pro => "QueryHunyuanTo3DProJob",
    }
}

/// User-facing text for a provider error code. Unknown codes get the generic
/// fallback so raw codes never reach users.
pub fn friendly_error(code: &str) -> &'static str {
    match code {
        "AuthFailure.SignatureFailure" => "Service connection error, please try again later",
        "InvalidParameter" => "Some parameters are invalid, please check your input",
        "InvalidParameterValue" => "The input does not meet the requirements, please check it",
        "LimitExceeded" => "The service is busy, please try again later",
        "RequestLimitExceeded" => "Too many requests, please try again later",
        "ResourceNotFound" => "The requested resource does not exist",
        "InternalError" => "The service is temporarily unavailable, we are fixing it",
        "MissingParameter" => "Required information is missing, please complete it",
        "UnsupportedOperation" => "This operation is not supported",
        "ResourceUnavailable" => "The service is temporarily unavailable, please try again later",
        "UnknownParameter" => "Parameter configuration error, please check the version settings",
        _ => FALLBACK_MESSAGE,
    }
}

fn provider_error(code: impl Into<String>) -> QueueError {
    let code = code.into();
    QueueError::Provider {
        message: friendly_error(&code).to_string(),
        code,
    }
}

/// Provider request body for `params`. Format hints are only sent to the
/// families that accept them, style and face count only to pro.
pub fn build_submit_body(params: &GenerationParams) -> Value {
    let mut body = Map::new();
    if let Some(prompt) = params.prompt() {
        body.insert("Prompt".to_string(), json!(prompt));
    }
    match params.image() {
        Some(ImageInput::Url(url)) => {
            body.insert("ImageUrl".to_string(), json!(url));
        }
        Some(ImageInput::Base64(data)) => {
            body.insert("ImageBase64".to_string(), json!(data));
        }
        None => {}
    }
    body.insert("EnablePBR".to_string(), json!(params.enable_pbr()));

    match params {
        GenerationParams::Rapid(standard) | GenerationParams::Basic(standard) => {
            if let Some(format) = standard.result_format {
                body.insert("ResultFormat".to_string(), json!(format.as_str()));
            }
        }
        GenerationParams::Pro(pro) => {
            let views: Vec<Value> = pro
                .multi_view_images
                .iter()
                .filter_map(|view| match &view.image {
                    ImageInput::Url(url) => Some(json!({
                        "ViewType": view.view_type.as_str(),
                        "ViewImageUrl": url,
                    })),
                    // Inline images are turned into URLs before submission.
                    ImageInput::Base64(_) => None,
                })
                .collect();
            if !views.is_empty() {
                body.insert("MultiViewImages".to_string(), Value::Array(views));
            }
            body.insert(
                "GenerateType".to_string(),
                json!(pro.generate_type.as_str()),
            );
            if let Some(face_count) = pro.face_count {
                body.insert("FaceCount".to_string(), json!(face_count));
            }
        }
    }

    Value::Object(body)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// `Authorization` header value for one TC3-HMAC-SHA256 signed POST.
pub fn sign_tc3(
    secret_id: &str,
    secret_key: &str,
    host: &str,
    action: &str,
    payload: &str,
    now: DateTime<Utc>,
) -> String {
    let date = now.format("%Y-%m-%d").to_string();
    let canonical_request = format!(
        "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{host}\nx-tc-action:{}\n\n{SIGNED_HEADERS}\n{}",
        action.to_ascii_lowercase(),
        sha256_hex(payload.as_bytes())
    );
    let scope = format!("{date}/{SERVICE}/tc3_request");
    let string_to_sign = format!(
        "TC3-HMAC-SHA256\n{}\n{scope}\n{}",
        now.timestamp(),
        sha256_hex(canonical_request.as_bytes())
    );

    let secret_date = hmac_sha256(format!("TC3{secret_key}").as_bytes(), date.as_bytes());
    let secret_service = hmac_sha256(&secret_date, SERVICE.as_bytes());
    let secret_signing = hmac_sha256(&secret_service, b"tc3_request");
    let signature = hex::encode(hmac_sha256(&secret_signing, string_to_sign.as_bytes()));

    format!(
        "TC3-HMAC-SHA256 Credential={secret_id}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}"
    )
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub secret_id: String,
    pub secret_key: String,
    pub region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<T> {
    response: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubmitResponse {
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoteFile {
    #[serde(rename = "Type")]
    file_type: String,
    url: String,
    #[serde(default)]
    preview_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryResponse {
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default, rename = "ResultFile3Ds")]
    result_files: Option<Vec<RemoteFile>>,
}

fn parse_query_response(raw: QueryResponse) -> QueueResult<RemoteJobStatus> {
    if let Some(err) = raw.error {
        warn!(code = %err.code, message = %err.message, "Provider rejected status query");
        return Err(QueueError::StatusQueryFailed);
    }
    let status = raw.status.unwrap_or_default();
    let state = RemoteJobState::parse(&status).ok_or_else(|| {
        warn!(status = %status, "Provider returned unknown job status");
        QueueError::StatusQueryFailed
    })?;
    let has_error = raw.error_code.is_some() || raw.error_message.is_some();
    let error_message = has_error
        .then(|| friendly_error(raw.error_code.as_deref().unwrap_or_default()).to_string());

    Ok(RemoteJobStatus {
        state,
        error_code: raw.error_code,
        error_message,
        result_files: raw
            .result_files
            .unwrap_or_default()
            .into_iter()
            .map(|f| ResultFile {
                file_type: f.file_type,
                url: f.url,
                preview_image_url: f.preview_image_url.filter(|u| !u.is_empty()),
            })
            .collect(),
    })
}

pub struct CloudProviderClient {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    config: ProviderConfig,
}

impl CloudProviderClient {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        Self {
            http,
            endpoint,
            host,
            config,
        }
    }

    async fn call(&self, action: &str, body: &Value) -> Result<Value, reqwest::Error> {
        let payload = body.to_string();
        let now = Utc::now();
        let authorization = sign_tc3(
            &self.config.secret_id,
            &self.config.secret_key,
            &self.host,
            action,
            &payload,
            now,
        );

        self.http
            .post(&self.endpoint)
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("Host", &self.host)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", now.timestamp().to_string())
            .header("X-TC-Version", API_VERSION)
            .header("X-TC-Region", &self.config.region)
            .body(payload)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    }
}

#[async_trait]
impl ModelProvider for CloudProviderClient {
    async fn submit(&self, params: &GenerationParams) -> QueueResult<SubmitOutcome> {
        let tier = params.tier();
        let action = submit_action(tier);
        let body = build_submit_body(params);

        let raw = self.call(action, &body).await.map_err(|err| {
            warn!(action, "Provider submit transport error: {err}");
            provider_error("Transport")
        })?;
        let envelope: Envelope<SubmitResponse> = serde_json::from_value(raw).map_err(|err| {
            warn!(action, "Provider submit response undecodable: {err}");
            provider_error("InvalidResponse")
        })?;
        let response = envelope.response;

        if let Some(err) = response.error {
            warn!(action, code = %err.code, message = %err.message, "Provider rejected submit");
            return Err(provider_error(err.code));
        }
        let job_id = response.job_id.ok_or_else(|| provider_error("InvalidResponse"))?;
        let request_id = response.request_id.unwrap_or_default();
        info!(action, job_id = %job_id, request_id = %request_id, "Provider accepted job");

        Ok(SubmitOutcome { job_id, request_id })
    }

    async fn query_status(&self, job_id: &str, tier: Tier) -> QueueResult<RemoteJobStatus> {
        let action = query_action(tier);
        let raw = self
            .call(action, &json!({ "JobId": job_id }))
            .await
            .map_err(|err| {
                warn!(action, job_id, "Provider status transport error: {err}");
                QueueError::StatusQueryFailed
            })?;
        let envelope: Envelope<QueryResponse> = serde_json::from_value(raw).map_err(|err| {
            warn!(action, job_id, "Provider status response undecodable: {err}");
            QueueError::StatusQueryFailed
        })?;
        parse_query_response(envelope.response)
    }
}

/// Paces every outbound call through a shared token bucket, waiting for a
/// token instead of failing.
pub struct ThrottledProvider<P> {
    inner: P,
    limiter: Arc<RateLimiter>,
}

impl<P> ThrottledProvider<P> {
    pub fn new(inner: P, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<P: ModelProvider> ModelProvider for ThrottledProvider<P> {
    async fn submit(&self, params: &GenerationParams) -> QueueResult<SubmitOutcome> {
        self.limiter.acquire("provider").await;
        self.inner.submit(params).await
    }

    async fn query_status(&self, job_id: &str, tier: Tier) -> QueueResult<RemoteJobStatus> {
        self.limiter.acquire("provider").await;
        self.inner.query_status(job_id, tier).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;

    use super::*;
    use crate::models::{
        GenerateType, MultiViewImage, ProParams, ResultFormat, StandardParams, ViewType,
    };

    #[test]
    fn known_codes_map_to_fixed_messages_and_unknown_falls_back() {
        assert_eq!(
            friendly_error("RequestLimitExceeded"),
            "Too many requests, please try again later"
        );
        assert_eq!(friendly_error("FailedOperation.Mystery"), FALLBACK_MESSAGE);
        assert_eq!(friendly_error(""), FALLBACK_MESSAGE);
    }

    #[test]
    fn actions_are_routed_per_tier() {
        assert_eq!(submit_action(Tier::Rapid), "SubmitHunyuanTo3DRapidJob");
        assert_eq!(submit_action(Tier::Basic), "SubmitHunyuanTo3DJob");
        assert_eq!(query_action(Tier::Pro), "QueryHunyuanTo3DProJob");
    }

    #[test]
    fn result_format_is_not_sent_to_pro() {
        let rapid = GenerationParams::Rapid(StandardParams {
            prompt: Some("a fox".to_string()),
            result_format: Some(ResultFormat::Glb),
            ..StandardParams::default()
        });
        let body = build_submit_body(&rapid);
        assert_eq!(body["ResultFormat"], "GLB");
        assert!(body.get("GenerateType").is_none());

        let pro = rapid.with_tier(Tier::Pro);
        let body = build_submit_body(&pro);
        assert!(body.get("ResultFormat").is_none());
        assert_eq!(body["GenerateType"], "Normal");
    }

    #[test]
    fn pro_body_carries_views_style_and_face_count() {
        let pro = GenerationParams::Pro(ProParams {
            image: Some(ImageInput::Base64("aGVsbG8=".to_string())),
            multi_view_images: vec![MultiViewImage {
                view_type: ViewType::Back,
                image: ImageInput::Url("https://cdn.example/back.png".to_string()),
            }],
            enable_pbr: true,
            generate_type: GenerateType::Sketch,
            face_count: Some(300_000),
            ..ProParams::default()
        });
        let body = build_submit_body(&pro);
        assert_eq!(body["ImageBase64"], "aGVsbG8=");
        assert_eq!(body["MultiViewImages"][0]["ViewType"], "back");
        assert_eq!(
            body["MultiViewImages"][0]["ViewImageUrl"],
            "https://cdn.example/back.png"
        );
        assert_eq!(body["GenerateType"], "Sketch");
        assert_eq!(body["FaceCount"], 300_000);
        assert_eq!(body["EnablePBR"], true);
        assert!(body.get("Prompt").is_none());
    }

    #[test]
    fn signature_is_deterministic_and_payload_bound() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let a = sign_tc3("AKID", "secret", "ai3d.example.com", "SubmitHunyuanTo3DJob", "{}", now);
        let b = sign_tc3("AKID", "secret", "ai3d.example.com", "SubmitHunyuanTo3DJob", "{}", now);
        let c = sign_tc3("AKID", "secret", "ai3d.example.com", "SubmitHunyuanTo3DJob", "{\"a\":1}", now);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(
            "TC3-HMAC-SHA256 Credential=AKID/2025-06-01/ai3d/tc3_request, SignedHeaders=content-type;host;x-tc-action, Signature="
        ));
        let signature = a.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn query_response_maps_error_code_to_friendly_message() {
        let raw: Envelope<QueryResponse> = serde_json::from_value(json!({
            "Response": {
                "Status": "FAIL",
                "ErrorCode": "InvalidParameterValue",
                "ErrorMessage": "image too small",
                "RequestId": "req-1"
            }
        }))
        .unwrap();
        let status = parse_query_response(raw.response).unwrap();
        assert_eq!(status.state, RemoteJobState::Fail);
        assert_eq!(status.error_code.as_deref(), Some("InvalidParameterValue"));
        assert_eq!(
            status.error_message.as_deref(),
            Some("The input does not meet the requirements, please check it")
        );
    }

    #[test]
    fn done_response_lists_result_files() {
        let raw: Envelope<QueryResponse> = serde_json::from_value(json!({
            "Response": {
                "Status": "DONE",
                "ResultFile3Ds": [
                    { "Type": "GLB", "Url": "https://provider/f.glb", "PreviewImageUrl": "https://provider/f.png" },
                    { "Type": "OBJ", "Url": "https://provider/f.obj", "PreviewImageUrl": "" }
                ],
                "RequestId": "req-2"
            }
        }))
        .unwrap();
        let status = parse_query_response(raw.response).unwrap();
        assert_eq!(status.state, RemoteJobState::Done);
        assert_eq!(status.result_files.len(), 2);
        assert_eq!(
            status.result_files[0].preview_image_url.as_deref(),
            Some("https://provider/f.png")
        );
        assert_eq!(status.result_files[1].preview_image_url, None);
        assert!(status.error_message.is_none());
    }

    #[test]
    fn api_error_on_query_is_a_status_query_failure() {
        let raw: Envelope<QueryResponse> = serde_json::from_value(json!({
            "Response": { "Error": { "Code": "InternalError", "Message": "oops" }, "RequestId": "r" }
        }))
        .unwrap();
        assert!(matches!(
            parse_query_response(raw.response),
            Err(QueueError::StatusQueryFailed)
        ));
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelProvider for CountingProvider {
        async fn submit(&self, _params: &GenerationParams) -> QueueResult<SubmitOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SubmitOutcome {
                job_id: "job".to_string(),
                request_id: "req".to_string(),
            })
        }

        async fn query_status(&self, _job_id: &str, _tier: Tier) -> QueueResult<RemoteJobStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::StatusQueryFailed)
        }
    }

    #[tokio::test]
    async fn throttled_provider_delegates_after_pacing() {
        let provider = ThrottledProvider::new(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            Arc::new(RateLimiter::new(6000, 5)),
        );
        let params = GenerationParams::Rapid(StandardParams {
            prompt: Some("cube".to_string()),
            ..StandardParams::default()
        });
        assert_eq!(provider.submit(&params).await.unwrap().job_id, "job");
        assert!(provider.query_status("job", Tier::Rapid).await.is_err());
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 2);
    }
}
