//! Deterministic stand-in engine that paints a prompt-seeded gradient.
//!
//! Lets the serving path run end to end on machines without model weights or an
//! accelerator. Output depends only on prompt, steps and dimensions.

use super::{EngineFailure, EngineLoader, EngineSpec, ImageEngine, Optimization, RawImage};

#[derive(Debug, Default, Clone)]
pub struct PreviewLoader;

impl PreviewLoader {
    pub fn new() -> Self {
        Self
    }
}

impl EngineLoader for PreviewLoader {
    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn ImageEngine>, EngineFailure> {
        Ok(Box::new(PreviewEngine::new(spec)?))
    }
}

#[derive(Debug, Clone)]
pub struct PreviewEngine {
    model_id: String,
    enabled: Vec<Optimization>,
}

impl PreviewEngine {
    pub fn new(spec: &EngineSpec) -> Result<Self, EngineFailure> {
        if spec.model_id.trim().is_empty() {
            return Err("model id is empty".into());
        }
        log::debug!(
            "Preview engine standing in for {} on {}",
            spec.model_id,
            spec.device
        );
        Ok(Self {
            model_id: spec.model_id.clone(),
            enabled: Vec::new(),
        })
    }

    pub fn enabled(&self) -> &[Optimization] {
        &self.enabled
    }

    pub fn render(prompt: &str, steps: u32, width: u32, height: u32) -> RawImage {
        let seed = fnv1a(prompt.as_bytes()) ^ u64::from(steps).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let [r0, g0, b0, ..] = seed.to_le_bytes();

        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            for x in 0..width {
                let fx = (x * 255 / width.max(1)) as u8;
                let fy = (y * 255 / height.max(1)) as u8;
                pixels.push(r0.wrapping_add(fx));
                pixels.push(g0.wrapping_add(fy));
                pixels.push(b0.wrapping_add(fx / 2).wrapping_add(fy / 2));
            }
        }
        RawImage::new(width, height, pixels)
    }
}

impl ImageEngine for PreviewEngine {
    fn enable(&mut self, optimization: Optimization) -> Result<(), EngineFailure> {
        match optimization {
            Optimization::MemoryEfficientAttention | Optimization::CpuOffload => Err(format!(
                "{} has no effect without an accelerator",
                optimization
            )
            .into()),
            _ => {
                self.enabled.push(optimization);
                Ok(())
            }
        }
    }

    fn batch_generate(
        &mut self,
        prompts: &[String],
        steps: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<RawImage>, EngineFailure> {
        log::debug!(
            "{} rendering {} preview image(s) at {}x{}",
            self.model_id,
            prompts.len(),
            width,
            height
        );
        Ok(prompts
            .iter()
            .map(|prompt| Self::render(prompt, steps, width, height))
            .collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}
