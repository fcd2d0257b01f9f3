use thiserror::Error;

use crate::engine::EngineFailure;
use crate::models::ImageFormat;

/// Rejections raised while normalizing an incoming request. These never reach the
/// cache or the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`prompt` is required")]
    EmptyPrompts,

    #[error("Batch size {size} exceeds MAX_BATCH={max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Unsupported image_format '{value}', expected one of: JPEG, PNG, WEBP")]
    UnsupportedImageFormat { value: String },

    #[error("Unsupported response_format '{value}', expected one of: json, binary")]
    UnsupportedResponseFormat { value: String },

    #[error("response_format=binary requires exactly one prompt, got {size}")]
    BinaryRequiresSingle { size: usize },
}

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to load model '{model_id}': {source}")]
    EngineLoad {
        model_id: String,
        #[source]
        source: EngineFailure,
    },

    #[error("Batch generation failed (size={batch_size}): {source}")]
    EngineGeneration {
        batch_size: usize,
        #[source]
        source: EngineFailure,
    },

    #[error("Warmup failed: {source}")]
    Warmup {
        #[source]
        source: EngineFailure,
    },

    #[error("Failed to encode {format} image: {reason}")]
    Encoding { format: ImageFormat, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServeError {
    /// Whether the same request may succeed if issued again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServeError::EngineLoad { .. } | ServeError::EngineGeneration { .. }
        )
    }

    /// HTTP-ish status the transport layer can map this error to.
    pub fn status_hint(&self) -> u16 {
        match self {
            ServeError::Validation(_) => 400,
            ServeError::EngineLoad { .. } => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServeError>;
