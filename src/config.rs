use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{Dtype, EngineSpec, Optimization};
use crate::error::{Result, ServeError};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_id: String,
    pub device: String,
    pub dtype: Dtype,
    pub warmup_prompt: String,
    pub warmup_steps: u32,
    pub use_autocast: bool,
    pub enable_xformers: bool,
    pub enable_cpu_offload: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ServingConfig {
    pub max_batch: usize,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            model_id: "stabilityai/sdxl-turbo".to_string(),
            device: "cuda".to_string(),
            dtype: Dtype::Float16,
            warmup_prompt: "warmup".to_string(),
            warmup_steps: 1,
            use_autocast: false,
            enable_xformers: false,
            enable_cpu_offload: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        EngineConfig {
            model_id: env::var("HF_MODEL_ID").unwrap_or(defaults.model_id),
            device: env::var("MODEL_DEVICE").unwrap_or(defaults.device),
            dtype: env::var("MODEL_TORCH_DTYPE")
                .map(|val| Dtype::from_name(&val))
                .unwrap_or(defaults.dtype),
            warmup_prompt: env::var("WARMUP_PROMPT").unwrap_or(defaults.warmup_prompt),
            warmup_steps: parse_env("WARMUP_STEPS", defaults.warmup_steps).max(1),
            use_autocast: flag_env("USE_AUTOCAST"),
            enable_xformers: flag_env("ENABLE_XFORMERS"),
            enable_cpu_offload: flag_env("ENABLE_CPU_OFFLOAD"),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<String>, dtype: Dtype) -> Self {
        self.device = device.into();
        self.dtype = dtype;
        self
    }

    pub fn with_warmup(mut self, prompt: impl Into<String>, steps: u32) -> Self {
        self.warmup_prompt = prompt.into();
        self.warmup_steps = steps.max(1);
        self
    }

    /// Flags requested at load time. Slicing and tiling are always asked for; the
    /// rest follow their toggles.
    pub fn optimizations(&self) -> Vec<Optimization> {
        let mut flags = vec![Optimization::AttentionSlicing, Optimization::VaeTiling];
        if self.enable_xformers {
            flags.push(Optimization::MemoryEfficientAttention);
        }
        if self.enable_cpu_offload {
            flags.push(Optimization::CpuOffload);
        }
        if self.use_autocast {
            flags.push(Optimization::Autocast);
        }
        flags
    }

    pub fn spec(&self) -> EngineSpec {
        EngineSpec {
            model_id: self.model_id.clone(),
            device: self.device.clone(),
            dtype: self.dtype,
            optimizations: self.optimizations(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl: Duration::from_secs(3600),
            capacity: 512,
        }
    }
}

impl CacheConfig {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        CacheConfig { ttl, capacity }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        CacheConfig {
            ttl: Duration::from_secs(parse_env("CACHE_TTL_SECONDS", defaults.ttl.as_secs())),
            capacity: parse_env("CACHE_MAXSIZE", defaults.capacity),
        }
    }
}

impl Default for ServingConfig {
    fn default() -> Self {
        ServingConfig {
            max_batch: 4,
            engine: EngineConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl ServingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        ServingConfig {
            max_batch: parse_env("MAX_BATCH", 4),
            engine: EngineConfig::from_env(),
            cache: CacheConfig::from_env(),
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch == 0 {
            return Err(ServeError::Config("MAX_BATCH must be at least 1".into()));
        }
        if self.cache.capacity == 0 {
            return Err(ServeError::Config("CACHE_MAXSIZE must be at least 1".into()));
        }
        if self.cache.ttl.is_zero() {
            return Err(ServeError::Config(
                "CACHE_TTL_SECONDS must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {}='{}', using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

fn flag_env(key: &str) -> bool {
    env::var(key).map_or(false, |val| val.trim() == "1")
}
