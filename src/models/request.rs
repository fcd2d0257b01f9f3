use serde::Deserialize;

use super::{ImageFormat, ResponseFormat};

pub const DEFAULT_STEPS: i64 = 8;
pub const DEFAULT_DIMENSION: i64 = 1024;

/// A prompt field that may arrive as a single string or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Single(String),
    Batch(Vec<String>),
}

impl PromptInput {
    pub fn into_prompts(self) -> Vec<String> {
        match self {
            PromptInput::Single(prompt) => vec![prompt],
            PromptInput::Batch(prompts) => prompts,
        }
    }
}

impl From<&str> for PromptInput {
    fn from(prompt: &str) -> Self {
        PromptInput::Single(prompt.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(prompt: String) -> Self {
        PromptInput::Single(prompt)
    }
}

impl From<Vec<String>> for PromptInput {
    fn from(prompts: Vec<String>) -> Self {
        PromptInput::Batch(prompts)
    }
}

impl From<Vec<&str>> for PromptInput {
    fn from(prompts: Vec<&str>) -> Self {
        PromptInput::Batch(prompts.into_iter().map(String::from).collect())
    }
}

/// Request payload as handed over by the transport layer, before validation.
///
/// Numeric fields are signed so that out-of-range input can be clamped rather than
/// failing deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGenerationRequest {
    pub prompt: PromptInput,
    #[serde(default = "default_steps", alias = "num_inference_steps")]
    pub steps: i64,
    #[serde(default = "default_dimension")]
    pub width: i64,
    #[serde(default = "default_dimension")]
    pub height: i64,
    #[serde(default = "default_image_format", alias = "format")]
    pub image_format: String,
    #[serde(default)]
    pub response_format: Option<String>,
}

fn default_steps() -> i64 {
    DEFAULT_STEPS
}

fn default_dimension() -> i64 {
    DEFAULT_DIMENSION
}

fn default_image_format() -> String {
    ImageFormat::Jpeg.as_str().to_string()
}

impl RawGenerationRequest {
    pub fn new(prompt: impl Into<PromptInput>) -> Self {
        Self {
            prompt: prompt.into(),
            steps: DEFAULT_STEPS,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            image_format: default_image_format(),
            response_format: None,
        }
    }

    pub fn with_steps(mut self, steps: i64) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_size(mut self, width: i64, height: i64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_image_format(mut self, format: impl Into<String>) -> Self {
        self.image_format = format.into();
        self
    }

    pub fn with_response_format(mut self, format: impl Into<String>) -> Self {
        self.response_format = Some(format.into());
        self
    }
}

/// A request that passed validation: non-empty, within the batch limit, clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompts: Vec<String>,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub image_format: ImageFormat,
    pub response_format: ResponseFormat,
}

impl GenerationRequest {
    pub fn batch_size(&self) -> usize {
        self.prompts.len()
    }
}
