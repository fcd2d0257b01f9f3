//! imgserve
//!
//! Serving core for a generative image model: one lazily loaded engine shared by all
//! requests, a fingerprint cache that deduplicates repeated generations, batched
//! engine calls for cache misses, and inline (base64 JSON) or raw binary responses.

pub mod cache;
pub mod codec;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod service;
pub mod validator;

pub use cache::{CacheKey, CacheStats, ResultCache};
pub use config::{CacheConfig, EngineConfig, ServingConfig};
pub use encoder::ResponseEncoder;
pub use engine::{
    Dtype, EngineHandle, EngineLoader, EngineSpec, ImageEngine, ModelLifecycleManager,
    Optimization, PreviewLoader, RawImage,
};
pub use error::{Result, ServeError, ValidationError};
pub use models::*;
pub use orchestrator::BatchOrchestrator;
pub use service::{HealthStatus, InferenceService, ServiceStats};
pub use validator::RequestValidator;
