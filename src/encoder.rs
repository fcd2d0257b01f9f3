use base64::{engine::general_purpose, Engine};
use std::time::Duration;

use crate::error::{Result, ServeError};
use crate::models::{
    BinaryResponse, EncodedResponse, GenerationRequest, GenerationResult, ImagesPayload,
    JsonResponse, ResponseFormat,
};

pub const FILENAME_STEM: &str = "output";

/// Shapes a finished generation into the negotiated response format.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseEncoder;

impl ResponseEncoder {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(
        &self,
        request: &GenerationRequest,
        result: GenerationResult,
        elapsed: Duration,
    ) -> Result<EncodedResponse> {
        let response = match request.response_format {
            ResponseFormat::Binary => {
                let format = request.image_format;
                let count = result.images.len();
                let bytes = match <[_; 1]>::try_from(result.images) {
                    Ok([bytes]) => bytes,
                    Err(_) => {
                        return Err(ServeError::Encoding {
                            format,
                            reason: format!(
                                "binary response needs exactly one image, got {}",
                                count
                            ),
                        })
                    }
                };
                EncodedResponse::Binary(BinaryResponse {
                    bytes,
                    content_type: format.content_type(),
                    filename: format!("{}.{}", FILENAME_STEM, format.extension()),
                })
            }
            ResponseFormat::Json => {
                let mut encoded: Vec<String> = result
                    .images
                    .iter()
                    .map(|bytes| general_purpose::STANDARD.encode(bytes))
                    .collect();
                // A lone image is returned as a bare string, not a one-element list.
                let images = if encoded.len() == 1 {
                    ImagesPayload::Single(encoded.remove(0))
                } else {
                    ImagesPayload::Batch(encoded)
                };
                EncodedResponse::Json(JsonResponse {
                    images,
                    elapsed_seconds: elapsed.as_secs_f64(),
                })
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageBytes, ImageFormat};

    fn request(count: usize, response_format: ResponseFormat) -> GenerationRequest {
        GenerationRequest {
            prompts: (0..count).map(|i| format!("p{}", i)).collect(),
            steps: 8,
            width: 512,
            height: 512,
            image_format: ImageFormat::Webp,
            response_format,
        }
    }

    fn result(images: &[&[u8]]) -> GenerationResult {
        GenerationResult {
            images: images.iter().map(|b| ImageBytes::from(*b)).collect(),
            cache_hits: 0,
        }
    }

    #[test]
    fn test_binary_response() {
        let response = ResponseEncoder::new().encode(
            &request(1, ResponseFormat::Binary),
            result(&[&b"RIFF"[..]]),
            Duration::from_millis(5),
        )
        .unwrap();
        let binary = response.as_binary().unwrap();
        assert_eq!(&*binary.bytes, b"RIFF");
        assert_eq!(binary.content_type, "image/webp");
        assert_eq!(binary.filename, "output.webp");
    }

    #[test]
    fn test_single_json_is_scalar() {
        let response = ResponseEncoder::new().encode(
            &request(1, ResponseFormat::Json),
            result(&[&b"abc"[..]]),
            Duration::from_millis(1500),
        )
        .unwrap();
        let json = response.as_json().unwrap();
        assert_eq!(json.images, ImagesPayload::Single("YWJj".into()));
        assert!((json.elapsed_seconds - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_batch_json_is_ordered_list() {
        let response = ResponseEncoder::new().encode(
            &request(2, ResponseFormat::Json),
            result(&[&b"a"[..], &b"b"[..]]),
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(
            response.as_json().unwrap().images,
            ImagesPayload::Batch(vec!["YQ==".into(), "Yg==".into()])
        );
    }

    #[test]
    fn test_binary_without_image_is_an_error() {
        let encoder = ResponseEncoder::new();
        for images in [&[][..], &[&b"a"[..], &b"b"[..]][..]] {
            let err = encoder
                .encode(&request(1, ResponseFormat::Binary), result(images), Duration::ZERO)
                .unwrap_err();
            assert!(matches!(err, ServeError::Encoding { format: ImageFormat::Webp, .. }));
            assert_eq!(err.status_hint(), 500);
        }
    }
}
