use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

pub const MAX_PROMPT_CHARS: usize = 1024;
pub const MIN_FACE_COUNT: u32 = 40_000;
pub const MAX_FACE_COUNT: u32 = 1_500_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Rapid,
    Basic,
    Pro,
}

impl Tier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rapid" => Some(Self::Rapid),
            "basic" => Some(Self::Basic),
            "pro" => Some(Self::Pro),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rapid => "rapid",
            Self::Basic => "basic",
            Self::Pro => "pro",
        }
    }

    pub fn base_seconds(&self) -> u64 {
        match self {
            Self::Rapid => 60,
            Self::Basic => 120,
            Self::Pro => 180,
        }
    }

    /// Expected run time of one job, stretched by half during the peak window.
    pub fn estimated_seconds(&self, peak: bool) -> u64 {
        let base = self.base_seconds();
        if peak {
            base * 3 / 2
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResultFormat {
    #[serde(rename = "OBJ")]
    Obj,
    #[serde(rename = "GLB")]
    Glb,
    #[serde(rename = "STL")]
    Stl,
    #[serde(rename = "USDZ")]
    Usdz,
    #[serde(rename = "FBX")]
    Fbx,
    #[serde(rename = "MP4")]
    Mp4,
}

impl ResultFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Obj => "OBJ",
            Self::Glb => "GLB",
            Self::Stl => "STL",
            Self::Usdz => "USDZ",
            Self::Fbx => "FBX",
            Self::Mp4 => "MP4",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum GenerateType {
    #[default]
    Normal,
    LowPoly,
    Geometry,
    Sketch,
}

impl GenerateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::LowPoly => "LowPoly",
            Self::Geometry => "Geometry",
            Self::Sketch => "Sketch",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ViewType {
    Left,
    Right,
    Back,
}

impl ViewType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Back => "back",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ImageInput {
    Url(String),
    Base64(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultiViewImage {
    pub view_type: ViewType,
    pub image: ImageInput,
}

/// Parameters shared by the rapid and basic families.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StandardParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInput>,
    #[serde(default, rename = "enablePBR")]
    pub enable_pbr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_format: Option<ResultFormat>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multi_view_images: Vec<MultiViewImage>,
    #[serde(default, rename = "enablePBR")]
    pub enable_pbr: bool,
    #[serde(default)]
    pub generate_type: GenerateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "version", rename_all = "lowercase")]
pub enum GenerationParams {
    Rapid(StandardParams),
    Basic(StandardParams),
    Pro(ProParams),
}

impl GenerationParams {
    pub fn tier(&self) -> Tier {
        match self {
            Self::Rapid(_) => Tier::Rapid,
            Self::Basic(_) => Tier::Basic,
            Self::Pro(_) => Tier::Pro,
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::Rapid(p) | Self::Basic(p) => p.prompt.as_deref(),
            Self::Pro(p) => p.prompt.as_deref(),
        }
    }

    pub fn image(&self) -> Option<&ImageInput> {
        match self {
            Self::Rapid(p) | Self::Basic(p) => p.image.as_ref(),
            Self::Pro(p) => p.image.as_ref(),
        }
    }

    pub fn enable_pbr(&self) -> bool {
        match self {
            Self::Rapid(p) | Self::Basic(p) => p.enable_pbr,
            Self::Pro(p) => p.enable_pbr,
        }
    }

    pub fn kind(&self) -> GenerationKind {
        if self.image().is_some() {
            GenerationKind::ImageTo3d
        } else {
            GenerationKind::TextTo3d
        }
    }

    /// Re-targets the parameters at `tier`. Fields the target family does not
    /// understand are dropped; pro-only fields fall back to their defaults.
    pub fn with_tier(self, tier: Tier) -> Self {
        if self.tier() == tier {
            return self;
        }
        let (prompt, image, enable_pbr, result_format) = match self {
            Self::Rapid(p) | Self::Basic(p) => (p.prompt, p.image, p.enable_pbr, p.result_format),
            Self::Pro(p) => (p.prompt, p.image, p.enable_pbr, None),
        };
        match tier {
            Tier::Rapid | Tier::Basic => {
                let standard = StandardParams {
                    prompt,
                    image,
                    enable_pbr,
                    result_format,
                };
                if tier == Tier::Rapid {
                    Self::Rapid(standard)
                } else {
                    Self::Basic(standard)
                }
            }
            Tier::Pro => Self::Pro(ProParams {
                prompt,
                image,
                enable_pbr,
                ..ProParams::default()
            }),
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        let prompt = self.prompt().map(str::trim).filter(|p| !p.is_empty());
        match (prompt, self.image()) {
            (None, None) => {
                return Err(QueueError::InvalidParams(
                    "either a prompt or an input image is required".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(QueueError::InvalidParams(
                    "prompt and input image are mutually exclusive".to_string(),
                ))
            }
            _ => {}
        }

        if let Some(prompt) = prompt {
            if prompt.chars().count() > MAX_PROMPT_CHARS {
                return Err(QueueError::InvalidParams(format!(
                    "prompt exceeds {MAX_PROMPT_CHARS} characters"
                )));
            }
        }

        if let Self::Pro(pro) = self {
            if let Some(face_count) = pro.face_count {
                if !(MIN_FACE_COUNT..=MAX_FACE_COUNT).contains(&face_count) {
                    return Err(QueueError::InvalidParams(format!(
                        "faceCount must be between {MIN_FACE_COUNT} and {MAX_FACE_COUNT}"
                    )));
                }
            }

            let mut seen = HashSet::new();
            for view in &pro.multi_view_images {
                if !seen.insert(view.view_type) {
                    return Err(QueueError::InvalidParams(format!(
                        "duplicate {} view image",
                        view.view_type.as_str()
                    )));
                }
                if !matches!(view.image, ImageInput::Url(_)) {
                    return Err(QueueError::InvalidParams(format!(
                        "{} view image must be uploaded and referenced by URL",
                        view.view_type.as_str()
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GenerationKind {
    #[serde(rename = "text-to-3d")]
    TextTo3d,
    #[serde(rename = "image-to-3d")]
    ImageTo3d,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextTo3d => "text-to-3d",
            Self::ImageTo3d => "image-to-3d",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text-to-3d" => Some(Self::TextTo3d),
            "image-to-3d" => Some(Self::ImageTo3d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Waiting,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputArtifact {
    pub file_type: String,
    pub url: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_image_url: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    pub uuid: Uuid,
    pub user_uuid: String,
    pub kind: GenerationKind,
    pub prompt: Option<String>,
    pub params: GenerationParams,
    pub credits_used: i64,
    pub status: RecordStatus,
    pub cloud_job_id: Option<String>,
    pub output_urls: Vec<OutputArtifact>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl GenerationRecord {
    pub fn new(user_uuid: impl Into<String>, params: GenerationParams, credits_used: i64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            user_uuid: user_uuid.into(),
            kind: params.kind(),
            prompt: params.prompt().map(str::to_string),
            params,
            credits_used,
            status: RecordStatus::Pending,
            cloud_job_id: None,
            output_urls: Vec::new(),
            error_message: None,
            created_at: Utc::now(),
            processing_started_at: None,
            completed_at: None,
            expires_at: None,
        }
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.output_urls.iter().map(|a| a.size_bytes).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: i64,
    pub record_uuid: Uuid,
    pub user_uuid: String,
    pub tier: Tier,
    pub status: QueueStatus,
    pub peak_period: bool,
    pub estimated_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoteJobState {
    Wait,
    Run,
    Fail,
    Done,
}

impl RemoteJobState {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "WAIT" => Some(Self::Wait),
            "RUN" => Some(Self::Run),
            "FAIL" => Some(Self::Fail),
            "DONE" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResultFile {
    pub file_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_image_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteJobStatus {
    pub state: RemoteJobState,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub result_files: Vec<ResultFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub job_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub position: u64,
    pub total_in_queue: u64,
    pub estimated_wait_seconds: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    pub file_type: String,
    pub file_name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub record_uuid: Uuid,
    pub user_uuid: String,
    pub tier: Tier,
    pub prompt: Option<String>,
    pub files: Vec<ManifestFile>,
    pub total_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Consume,
    Refund,
    Recharge,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Refund => "refund",
            Self::Recharge => "recharge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "consume" => Some(Self::Consume),
            "refund" => Some(Self::Refund),
            "recharge" => Some(Self::Recharge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub uuid: Uuid,
    pub user_uuid: String,
    pub kind: LedgerKind,
    /// Signed: debits are negative.
    pub amount: i64,
    pub reason: String,
    pub related_uuid: Option<Uuid>,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}
