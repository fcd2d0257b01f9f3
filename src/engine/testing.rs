//! Instrumented engine used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    EngineFailure, EngineLoader, EngineSpec, ImageEngine, Optimization, PreviewEngine, RawImage,
};

/// Shared counters and failure switches observed by the tests.
#[derive(Debug, Default)]
pub struct Recorder {
    pub loads: AtomicUsize,
    pub warmups: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub failed_loads_remaining: AtomicUsize,
    pub fail_warmup: AtomicBool,
    pub fail_generation: AtomicBool,
    pub short_batches: AtomicBool,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub batches: Mutex<Vec<Vec<String>>>,
    load_delay: Duration,
    batch_delay: Duration,
}

impl Recorder {
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_failed_loads(self, count: usize) -> Self {
        self.failed_loads_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

pub struct RecordingLoader {
    recorder: Arc<Recorder>,
    unsupported: Vec<Optimization>,
}

impl RecordingLoader {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            unsupported: Vec::new(),
        }
    }

    pub fn with_unsupported(mut self, unsupported: Vec<Optimization>) -> Self {
        self.unsupported = unsupported;
        self
    }
}

impl EngineLoader for RecordingLoader {
    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn ImageEngine>, EngineFailure> {
        self.recorder.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.recorder.load_delay);

        let remaining = &self.recorder.failed_loads_remaining;
        if remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("weights not found".into());
        }

        Ok(Box::new(RecordingEngine {
            inner: PreviewEngine::new(spec)?,
            recorder: Arc::clone(&self.recorder),
            unsupported: self.unsupported.clone(),
        }))
    }
}

pub struct RecordingEngine {
    inner: PreviewEngine,
    recorder: Arc<Recorder>,
    unsupported: Vec<Optimization>,
}

impl ImageEngine for RecordingEngine {
    fn enable(&mut self, optimization: Optimization) -> Result<(), EngineFailure> {
        if self.unsupported.contains(&optimization) {
            return Err(format!("{} unsupported", optimization).into());
        }
        Ok(())
    }

    fn warmup(&mut self, _prompt: &str, _steps: u32) -> Result<(), EngineFailure> {
        self.recorder.warmups.fetch_add(1, Ordering::SeqCst);
        if self.recorder.fail_warmup.load(Ordering::SeqCst) {
            return Err("warmup kernel crashed".into());
        }
        Ok(())
    }

    fn batch_generate(
        &mut self,
        prompts: &[String],
        steps: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<RawImage>, EngineFailure> {
        let recorder = &self.recorder;
        let active = recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        recorder.max_active.fetch_max(active, Ordering::SeqCst);
        recorder.batch_calls.fetch_add(1, Ordering::SeqCst);
        recorder.batches.lock().unwrap().push(prompts.to_vec());
        std::thread::sleep(recorder.batch_delay);

        let result = if recorder.fail_generation.load(Ordering::SeqCst) {
            Err("CUDA out of memory".into())
        } else {
            let mut images = self.inner.batch_generate(prompts, steps, width, height)?;
            if recorder.short_batches.load(Ordering::SeqCst) {
                images.pop();
            }
            Ok(images)
        };

        recorder.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
