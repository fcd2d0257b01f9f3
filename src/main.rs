use imgserve::logger::{self, LoggerConfig};
use imgserve::{EncodedResponse, InferenceService, PreviewLoader, RawGenerationRequest, ServingConfig};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv_loaded = dotenv::dotenv().is_ok();

    logger::init_with_config(LoggerConfig::from_env())?;
    logger::log_startup_info(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    if !dotenv_loaded {
        log::warn!("No .env file found, using system environment variables");
    }

    let config = ServingConfig::from_env();
    logger::log_config_info(&config);

    let prompt = env::args()
        .nth(1)
        .or_else(|| env::var("PROMPT").ok())
        .ok_or("usage: imgserve <prompt> (or set PROMPT)")?;
    let output_path = env::var("OUTPUT_PATH").unwrap_or_else(|_| "output.jpg".to_string());
    let steps = env::var("STEPS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8);

    let service = InferenceService::new(&config, Arc::new(PreviewLoader::new()))?;
    service.startup().await?;

    let format = Path::new(&output_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("jpg")
        .to_string();
    let request = RawGenerationRequest::new(prompt.as_str())
        .with_steps(steps)
        .with_image_format(format)
        .with_response_format("binary");

    log::info!("Generating image for prompt='{}' steps={}", prompt, steps);
    let image = match service.predict(request.clone()).await? {
        EncodedResponse::Binary(binary) => binary,
        EncodedResponse::Json(_) => return Err("expected a binary response".into()),
    };

    let out = Path::new(&output_path);
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(out, &image.bytes)?;
    log::info!(
        "Saved {} ({} bytes, {}) to {}",
        image.filename,
        image.bytes.len(),
        image.content_type,
        output_path
    );

    // Same request again is served from the cache.
    service.predict(request).await?;
    let health = service.health();
    log::info!(
        "Cache: {} entries, hit rate {:.0}%",
        health.cache.entries,
        health.cache.hit_rate() * 100.0
    );
    log::info!(
        "Requests: {} served, {} failed, mean latency {:.3}s",
        health.requests.requests,
        health.requests.failures,
        health.requests.mean_latency_seconds()
    );

    Ok(())
}
