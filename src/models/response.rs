use serde::Serialize;

use super::ImageBytes;

/// Base64 payload; a single image stays a bare string, batches become a list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ImagesPayload {
    Single(String),
    Batch(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonResponse {
    pub images: ImagesPayload,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct BinaryResponse {
    pub bytes: ImageBytes,
    pub content_type: &'static str,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub enum EncodedResponse {
    Binary(BinaryResponse),
    Json(JsonResponse),
}

impl EncodedResponse {
    pub fn as_json(&self) -> Option<&JsonResponse> {
        match self {
            EncodedResponse::Json(json) => Some(json),
            EncodedResponse::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&BinaryResponse> {
        match self {
            EncodedResponse::Binary(binary) => Some(binary),
            EncodedResponse::Json(_) => None,
        }
    }
}
