//! Lazy, single-flight ownership of the one engine instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use super::{run_blocking, EngineHandle, EngineLoader, ImageEngine, Optimization};
use crate::config::EngineConfig;
use crate::error::{Result, ServeError};
use crate::logger::Timer;

pub struct ModelLifecycleManager {
    loader: Arc<dyn EngineLoader>,
    config: EngineConfig,
    handle: OnceCell<EngineHandle>,
    // Held for the whole load; remembers the message of the latest failed load.
    init: Mutex<Option<String>>,
    failed_loads: AtomicU64,
}

impl ModelLifecycleManager {
    pub fn new(loader: Arc<dyn EngineLoader>, config: EngineConfig) -> Self {
        Self {
            loader,
            config,
            handle: OnceCell::new(),
            init: Mutex::new(None),
            failed_loads: AtomicU64::new(0),
        }
    }

    /// Returns the ready engine, loading and warming it up on first use.
    ///
    /// Concurrent first callers all wait on the same initialization. If that load
    /// fails, the callers that were already waiting get the same failure instead of
    /// each reloading in turn. The manager stays unloaded, so a later call tries again.
    pub async fn acquire(&self) -> Result<EngineHandle> {
        if let Some(handle) = self.handle.get() {
            return Ok(handle.clone());
        }

        let seen_failures = self.failed_loads.load(Ordering::SeqCst);
        let mut last_failure = self.init.lock().await;
        if let Some(handle) = self.handle.get() {
            return Ok(handle.clone());
        }
        if self.failed_loads.load(Ordering::SeqCst) != seen_failures {
            if let Some(message) = last_failure.as_ref() {
                return Err(ServeError::EngineLoad {
                    model_id: self.config.model_id.clone(),
                    source: message.clone().into(),
                });
            }
        }

        match self.initialize().await {
            Ok(handle) => {
                *last_failure = None;
                Ok(self.handle.get_or_init(|| async { handle }).await.clone())
            }
            Err(err) => {
                *last_failure = Some(match &err {
                    ServeError::EngineLoad { source, .. } => source.to_string(),
                    other => other.to_string(),
                });
                self.failed_loads.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.initialized()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn initialize(&self) -> Result<EngineHandle> {
        let spec = self.config.spec();
        log::info!(
            "Loading model: {} (device={}, dtype={})",
            spec.model_id,
            spec.device,
            spec.dtype.as_str()
        );
        let mut timer = Timer::new("model load");

        let loader = Arc::clone(&self.loader);
        let load_spec = spec.clone();
        let loaded = run_blocking(move || {
            let mut engine = loader.load(&load_spec)?;
            let applied = apply_optimizations(engine.as_mut(), &load_spec.optimizations);
            Ok((engine, applied))
        })
        .await;

        let (engine, applied) = match loaded {
            Ok(loaded) => {
                timer.stop();
                loaded
            }
            Err(source) => {
                timer.fail();
                log::error!("Model load failed for {}: {}", spec.model_id, source);
                return Err(ServeError::EngineLoad {
                    model_id: spec.model_id.clone(),
                    source,
                });
            }
        };

        let handle = EngineHandle::new(engine, spec, applied);
        self.warmup(&handle).await;
        Ok(handle)
    }

    async fn warmup(&self, handle: &EngineHandle) {
        let prompt = &self.config.warmup_prompt;
        let steps = self.config.warmup_steps.max(1);
        log::info!("Warming up model with prompt={} steps={}", prompt, steps);

        match handle.warmup(prompt, steps).await {
            Ok(()) => log::info!("Warmup complete"),
            Err(source) => {
                let err = ServeError::Warmup { source };
                log::warn!("{}; continuing with a cold engine", err);
            }
        }
    }
}

fn apply_optimizations(engine: &mut dyn ImageEngine, flags: &[Optimization]) -> Vec<Optimization> {
    let mut applied = Vec::with_capacity(flags.len());
    for &flag in flags {
        match engine.enable(flag) {
            Ok(()) => {
                log::info!("Enabled {}", flag);
                applied.push(flag);
            }
            Err(e) => log::warn!("{} not available: {}", flag, e),
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{RecordingLoader, Recorder};
    use futures::future::join_all;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn manager(loader: RecordingLoader) -> ModelLifecycleManager {
        ModelLifecycleManager::new(
            Arc::new(loader),
            EngineConfig::new().with_model("test/model").with_warmup("warmup", 1),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_loads_once() {
        let recorder = Arc::new(Recorder::default().with_load_delay(Duration::from_millis(50)));
        let manager = Arc::new(manager(RecordingLoader::new(Arc::clone(&recorder))));

        let calls = (0..8).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire().await.map(|_| ()) })
        });
        for joined in join_all(calls).await {
            assert!(joined.unwrap().is_ok());
        }

        assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.warmups.load(Ordering::SeqCst), 1);
        assert!(manager.is_loaded());
    }

    #[tokio::test]
    async fn test_load_failure_allows_retry() {
        let recorder = Arc::new(Recorder::default().with_failed_loads(1));
        let manager = manager(RecordingLoader::new(Arc::clone(&recorder)));

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, ServeError::EngineLoad { ref model_id, .. } if model_id == "test/model"));
        assert!(!manager.is_loaded());
        assert_eq!(recorder.warmups.load(Ordering::SeqCst), 0);

        assert!(manager.acquire().await.is_ok());
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.warmups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiting_callers_share_a_failed_load() {
        let recorder = Arc::new(
            Recorder::default()
                .with_load_delay(Duration::from_millis(100))
                .with_failed_loads(usize::MAX),
        );
        let manager = Arc::new(manager(RecordingLoader::new(Arc::clone(&recorder))));

        let calls = (0..8).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire().await.map(|_| ()) })
        });
        for joined in join_all(calls).await {
            let err = joined.unwrap().unwrap_err();
            assert!(matches!(err, ServeError::EngineLoad { .. }));
            assert!(std::error::Error::source(&err)
                .is_some_and(|source| source.to_string() == "weights not found"));
        }
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);

        assert!(manager.acquire().await.is_err());
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 2);
        assert!(!manager.is_loaded());
    }

    #[tokio::test]
    async fn test_warmup_failure_is_not_fatal() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_warmup.store(true, Ordering::SeqCst);
        let manager = manager(RecordingLoader::new(Arc::clone(&recorder)));

        let handle = manager.acquire().await.unwrap();
        assert!(manager.is_loaded());

        let images = handle
            .batch_generate(vec!["still works".into()], 2, 64, 64)
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_optimizations_degrade() {
        let recorder = Arc::new(Recorder::default());
        let loader = RecordingLoader::new(Arc::clone(&recorder))
            .with_unsupported(vec![Optimization::CpuOffload]);
        let mut config = EngineConfig::new();
        config.enable_cpu_offload = true;
        let manager = ModelLifecycleManager::new(Arc::new(loader), config);

        let handle = manager.acquire().await.unwrap();
        assert!(handle.optimizations().contains(&Optimization::AttentionSlicing));
        assert!(!handle.optimizations().contains(&Optimization::CpuOffload));
        assert!(handle.spec().optimizations.contains(&Optimization::CpuOffload));
    }

    #[tokio::test]
    async fn test_handle_is_reused() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager(RecordingLoader::new(Arc::clone(&recorder)));

        manager.acquire().await.unwrap();
        manager.acquire().await.unwrap();
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);
    }
}
