pub mod lifecycle;
pub mod preview;
#[cfg(test)]
pub mod testing;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use lifecycle::ModelLifecycleManager;
pub use preview::{PreviewEngine, PreviewLoader};

/// Failure reported by an engine implementation; kept as the source of the
/// surfaced `ServeError`.
pub type EngineFailure = Box<dyn std::error::Error + Send + Sync>;

/// Side length used by the default warmup pass.
pub const WARMUP_DIMENSION: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float16,
    Float32,
}

impl Dtype {
    /// `float16` selects half precision; anything else falls back to `float32`.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("float16") {
            Dtype::Float16
        } else {
            Dtype::Float32
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Float16 => "float16",
            Dtype::Float32 => "float32",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimization {
    AttentionSlicing,
    VaeTiling,
    MemoryEfficientAttention,
    CpuOffload,
    Autocast,
}

impl Optimization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Optimization::AttentionSlicing => "attention_slicing",
            Optimization::VaeTiling => "vae_tiling",
            Optimization::MemoryEfficientAttention => "memory_efficient_attention",
            Optimization::CpuOffload => "cpu_offload",
            Optimization::Autocast => "autocast",
        }
    }
}

impl fmt::Display for Optimization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a loader needs to bring up the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    pub model_id: String,
    pub device: String,
    pub dtype: Dtype,
    pub optimizations: Vec<Optimization>,
}

/// Decoded RGB8 pixel buffer as returned by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RawImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// A loaded generative model. Calls are synchronous and may take seconds; the
/// handle guarantees only one call runs at a time.
pub trait ImageEngine: Send {
    /// Best-effort optimization toggle. An error means the flag is unsupported.
    fn enable(&mut self, optimization: Optimization) -> Result<(), EngineFailure>;

    fn warmup(&mut self, prompt: &str, steps: u32) -> Result<(), EngineFailure> {
        self.batch_generate(
            &[prompt.to_string()],
            steps.max(1),
            WARMUP_DIMENSION,
            WARMUP_DIMENSION,
        )
        .map(|_| ())
    }

    /// One forward pass over `prompts`, returning one image per prompt in order.
    fn batch_generate(
        &mut self,
        prompts: &[String],
        steps: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<RawImage>, EngineFailure>;
}

pub trait EngineLoader: Send + Sync {
    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn ImageEngine>, EngineFailure>;
}

/// Shared handle to the single loaded engine.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Mutex<Box<dyn ImageEngine>>>,
    spec: Arc<EngineSpec>,
    optimizations: Arc<[Optimization]>,
}

impl EngineHandle {
    pub(crate) fn new(
        engine: Box<dyn ImageEngine>,
        spec: EngineSpec,
        optimizations: Vec<Optimization>,
    ) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            spec: Arc::new(spec),
            optimizations: optimizations.into(),
        }
    }

    pub fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    /// Optimizations the engine accepted at load time.
    pub fn optimizations(&self) -> &[Optimization] {
        &self.optimizations
    }

    pub async fn warmup(&self, prompt: &str, steps: u32) -> Result<(), EngineFailure> {
        let prompt = prompt.to_string();
        self.with_engine(move |engine| engine.warmup(&prompt, steps))
            .await
    }

    pub async fn batch_generate(
        &self,
        prompts: Vec<String>,
        steps: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<RawImage>, EngineFailure> {
        self.with_engine(move |engine| engine.batch_generate(&prompts, steps, width, height))
            .await
    }

    /// Waits for exclusive access, then runs `f` on the blocking pool while the
    /// guard is held.
    async fn with_engine<T, F>(&self, f: F) -> Result<T, EngineFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn ImageEngine) -> Result<T, EngineFailure> + Send + 'static,
    {
        let mut guard = Arc::clone(&self.engine).lock_owned().await;
        run_blocking(move || f(&mut **guard)).await
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("spec", &self.spec)
            .field("optimizations", &self.optimizations)
            .finish()
    }
}

pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, EngineFailure>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineFailure> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join_error) => Err(EngineFailure::from(join_error)),
    }
}
