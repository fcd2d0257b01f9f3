use crate::error::ValidationError;
use crate::models::{GenerationRequest, ImageFormat, RawGenerationRequest, ResponseFormat};

pub const MIN_STEPS: i64 = 1;
pub const MAX_STEPS: i64 = 150;
pub const MIN_DIMENSION: i64 = 64;
pub const MAX_DIMENSION: i64 = 2048;

/// Turns a transport payload into a canonical `GenerationRequest`.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    max_batch: usize,
}

impl RequestValidator {
    pub fn new(max_batch: usize) -> Self {
        Self { max_batch }
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    pub fn validate(
        &self,
        raw: RawGenerationRequest,
    ) -> Result<GenerationRequest, ValidationError> {
        let prompts = raw.prompt.into_prompts();
        if prompts.is_empty() {
            return Err(ValidationError::EmptyPrompts);
        }
        if prompts.len() > self.max_batch {
            return Err(ValidationError::BatchTooLarge {
                size: prompts.len(),
                max: self.max_batch,
            });
        }

        let image_format = parse_image_format(&raw.image_format)?;
        let response_format = match raw.response_format.as_deref() {
            Some(value) => parse_response_format(value)?,
            None => ResponseFormat::Json,
        };
        if response_format == ResponseFormat::Binary && prompts.len() > 1 {
            return Err(ValidationError::BinaryRequiresSingle {
                size: prompts.len(),
            });
        }

        Ok(GenerationRequest {
            prompts,
            steps: raw.steps.clamp(MIN_STEPS, MAX_STEPS) as u32,
            width: raw.width.clamp(MIN_DIMENSION, MAX_DIMENSION) as u32,
            height: raw.height.clamp(MIN_DIMENSION, MAX_DIMENSION) as u32,
            image_format,
            response_format,
        })
    }
}

/// Case-insensitive; `JPG` is accepted as `JPEG`.
pub fn parse_image_format(value: &str) -> Result<ImageFormat, ValidationError> {
    match value.trim().to_ascii_uppercase().as_str() {
        "JPEG" | "JPG" => Ok(ImageFormat::Jpeg),
        "PNG" => Ok(ImageFormat::Png),
        "WEBP" => Ok(ImageFormat::Webp),
        _ => Err(ValidationError::UnsupportedImageFormat {
            value: value.to_string(),
        }),
    }
}

pub fn parse_response_format(value: &str) -> Result<ResponseFormat, ValidationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(ResponseFormat::Json),
        "binary" => Ok(ResponseFormat::Binary),
        _ => Err(ValidationError::UnsupportedResponseFormat {
            value: value.to_string(),
        }),
    }
}
