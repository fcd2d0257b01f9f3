use std::sync::Arc;

use crate::cache::{truncate_for_log, CacheKey, ResultCache};
use crate::codec;
use crate::engine::{ModelLifecycleManager, RawImage};
use crate::error::{Result, ServeError};
use crate::models::{GenerationRequest, GenerationResult, ImageBytes, ImageFormat};

/// Serves a validated request from the cache where possible and generates the rest
/// with a single engine call.
pub struct BatchOrchestrator {
    lifecycle: Arc<ModelLifecycleManager>,
    cache: Arc<ResultCache>,
}

impl BatchOrchestrator {
    pub fn new(lifecycle: Arc<ModelLifecycleManager>, cache: Arc<ResultCache>) -> Self {
        Self { lifecycle, cache }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycleManager> {
        &self.lifecycle
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let keys: Vec<CacheKey> = request
            .prompts
            .iter()
            .map(|prompt| {
                CacheKey::derive(
                    prompt,
                    request.steps,
                    request.width,
                    request.height,
                    request.image_format,
                )
            })
            .collect();

        let mut slots: Vec<Option<ImageBytes>> = Vec::with_capacity(keys.len());
        let mut misses: Vec<usize> = Vec::new();
        for (idx, key) in keys.iter().enumerate() {
            match self.cache.get(key) {
                Some(bytes) => {
                    log::debug!("Cache hit for key (prefix): {}", truncate_for_log(key.as_str()));
                    slots.push(Some(bytes));
                }
                None => {
                    slots.push(None);
                    misses.push(idx);
                }
            }
        }
        let cache_hits = keys.len() - misses.len();
        log::info!(
            "Batch of {}: {} cache hit(s), {} to generate",
            keys.len(),
            cache_hits,
            misses.len()
        );

        if !misses.is_empty() {
            let miss_prompts: Vec<String> = misses
                .iter()
                .map(|&idx| request.prompts[idx].clone())
                .collect();
            let generated = self.generate_misses(request, miss_prompts).await?;

            // Nothing is written until every image of the batch has been encoded.
            for (&idx, bytes) in misses.iter().zip(generated) {
                self.cache.put(keys[idx].clone(), bytes.clone());
                slots[idx] = Some(bytes);
            }
        }

        let images = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.ok_or_else(|| ServeError::EngineGeneration {
                    batch_size: misses.len(),
                    source: format!("no image produced for prompt #{}", idx).into(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(GenerationResult { images, cache_hits })
    }

    async fn generate_misses(
        &self,
        request: &GenerationRequest,
        prompts: Vec<String>,
    ) -> Result<Vec<ImageBytes>> {
        let batch_size = prompts.len();
        let engine = self.lifecycle.acquire().await?;
        log::info!(
            "Batch generation (size={}) steps={} {}x{}",
            batch_size,
            request.steps,
            request.width,
            request.height
        );

        let raw_images = engine
            .batch_generate(prompts, request.steps, request.width, request.height)
            .await
            .map_err(|source| {
                log::error!("Batch generation failed: {}", source);
                ServeError::EngineGeneration { batch_size, source }
            })?;

        if raw_images.len() != batch_size {
            return Err(ServeError::EngineGeneration {
                batch_size,
                source: format!(
                    "engine returned {} image(s) for {} prompt(s)",
                    raw_images.len(),
                    batch_size
                )
                .into(),
            });
        }

        encode_all(raw_images, request.image_format).await
    }
}

async fn encode_all(raw_images: Vec<RawImage>, format: ImageFormat) -> Result<Vec<ImageBytes>> {
    let encoded = tokio::task::spawn_blocking(move || {
        raw_images
            .iter()
            .map(|raw| codec::encode(raw, format).map(ImageBytes::from))
            .collect::<Result<Vec<_>>>()
    })
    .await;

    match encoded {
        Ok(result) => result,
        Err(join_error) => Err(ServeError::Encoding {
            format,
            reason: join_error.to_string(),
        }),
    }
}
