//! End-to-end predict flow: validate, orchestrate, encode.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::{CacheStats, ResultCache};
use crate::config::ServingConfig;
use crate::encoder::ResponseEncoder;
use crate::engine::{EngineLoader, ModelLifecycleManager};
use crate::error::Result;
use crate::logger::Timer;
use crate::models::{EncodedResponse, RawGenerationRequest};
use crate::orchestrator::BatchOrchestrator;
use crate::validator::RequestValidator;

/// Request counters and accumulated latency since the service started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ServiceStats {
    pub requests: u64,
    pub failures: u64,
    pub total_latency_seconds: f64,
}

impl ServiceStats {
    pub fn mean_latency_seconds(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_seconds / self.requests as f64
        }
    }
}

#[derive(Debug, Default)]
struct RequestMetrics {
    requests: AtomicU64,
    failures: AtomicU64,
    latency_micros: AtomicU64,
}

impl RequestMetrics {
    fn record(&self, elapsed: Duration, failed: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_latency_seconds: self.latency_micros.load(Ordering::Relaxed) as f64 / 1e6,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub engine_loaded: bool,
    pub requests: ServiceStats,
    pub cache: CacheStats,
}

pub struct InferenceService {
    validator: RequestValidator,
    orchestrator: BatchOrchestrator,
    encoder: ResponseEncoder,
    metrics: RequestMetrics,
}

impl InferenceService {
    pub fn new(config: &ServingConfig, loader: Arc<dyn EngineLoader>) -> Result<Self> {
        config.validate()?;

        let lifecycle = Arc::new(ModelLifecycleManager::new(loader, config.engine.clone()));
        let cache = Arc::new(ResultCache::new(config.cache.ttl, config.cache.capacity));

        Ok(Self::from_parts(
            RequestValidator::new(config.max_batch),
            lifecycle,
            cache,
        ))
    }

    /// Builds a service around an already shared engine manager and cache.
    pub fn from_parts(
        validator: RequestValidator,
        lifecycle: Arc<ModelLifecycleManager>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            validator,
            orchestrator: BatchOrchestrator::new(lifecycle, cache),
            encoder: ResponseEncoder::new(),
            metrics: RequestMetrics::default(),
        }
    }

    /// Loads and warms up the engine ahead of the first request.
    pub async fn startup(&self) -> Result<()> {
        self.orchestrator.lifecycle().acquire().await?;
        log::info!("Model loaded on startup");
        Ok(())
    }

    /// Runs one request end to end. Every call, successful or not, is counted in
    /// [`InferenceService::stats`].
    pub async fn predict(&self, raw: RawGenerationRequest) -> Result<EncodedResponse> {
        let request_id = Uuid::new_v4();
        let timer = Timer::new(&format!("predict {}", request_id));

        let outcome = self.handle(request_id, raw, &timer).await;
        self.metrics.record(timer.elapsed(), outcome.is_err());
        match outcome {
            Ok(response) => Ok(response),
            Err(err) => {
                timer.fail();
                Err(err)
            }
        }
    }

    async fn handle(
        &self,
        request_id: Uuid,
        raw: RawGenerationRequest,
        timer: &Timer,
    ) -> Result<EncodedResponse> {
        let request = self.validator.validate(raw).map_err(|e| {
            log::debug!("Rejected request {}: {}", request_id, e);
            e
        })?;
        log::info!(
            "Request {}: {} prompt(s), steps={}, {}x{}, {} as {}",
            request_id,
            request.batch_size(),
            request.steps,
            request.width,
            request.height,
            request.image_format,
            request.response_format
        );

        let result = self.orchestrator.generate(&request).await.map_err(|e| {
            log::error!("Request {} failed: {}", request_id, e);
            e
        })?;

        self.encoder.encode(&request, result, timer.elapsed())
    }

    pub fn stats(&self) -> ServiceStats {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "ok",
            engine_loaded: self.orchestrator.lifecycle().is_loaded(),
            requests: self.stats(),
            cache: self.orchestrator.cache().stats(),
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        self.orchestrator.cache()
    }
}
