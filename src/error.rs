use thiserror::Error;
use uuid::Uuid;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("generation record {0} not found")]
    RecordNotFound(Uuid),

    #[error("queue entry for record {0} not found")]
    QueueEntryNotFound(Uuid),

    #[error("record {0} is already queued")]
    AlreadyQueued(Uuid),

    /// `message` is already the user-facing text; `code` is kept for logs only.
    #[error("{message}")]
    Provider { code: String, message: String },

    #[error("status query failed")]
    StatusQueryFailed,

    #[error("job did not finish within {attempts} status checks")]
    PollTimeout { attempts: u32 },

    #[error("download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("refund of {amount} credits for record {record_uuid} failed: {reason}")]
    RefundFailed {
        record_uuid: Uuid,
        amount: i64,
        reason: String,
    },

    #[error("invalid generation parameters: {0}")]
    InvalidParams(String),

    #[error("invalid storage path component `{0}`")]
    InvalidPathComponent(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RecordNotFound(_) => "RECORD_NOT_FOUND",
            Self::QueueEntryNotFound(_) => "QUEUE_ENTRY_NOT_FOUND",
            Self::AlreadyQueued(_) => "ALREADY_QUEUED",
            Self::Provider { .. } => "PROVIDER_ERROR",
            Self::StatusQueryFailed => "STATUS_QUERY_FAILED",
            Self::PollTimeout { .. } => "POLL_TIMEOUT",
            Self::DownloadFailed { .. } => "DOWNLOAD_FAILED",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::RefundFailed { .. } => "REFUND_FAILED",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::InvalidPathComponent(_) => "INVALID_PATH",
            Self::Database(_) | Self::Serialization(_) | Self::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// Text safe to store on a failed record and show to its owner.
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider { message, .. } => message.clone(),
            Self::StatusQueryFailed => "Status query failed, please try again".to_string(),
            Self::PollTimeout { .. } => "Generation timed out, please try again".to_string(),
            Self::DownloadFailed { .. } => {
                "Generated files could not be saved, please try again".to_string()
            }
            Self::InvalidParams(reason) => format!("Invalid parameters: {reason}"),
            _ => "Generation failed, please try again".to_string(),
        }
    }
}
