//! Built-in tasks.
//!
//! These are placeholders for the real TTS, media and knowledge services:
//! they validate their payload and return the shape downstream consumers
//! expect. A missing or malformed payload field is a fatal error since no
//! retry can fix it.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::job::{JobError, TaskContext};
use super::registry::TaskRegistryBuilder;
use crate::error::Result;

/// Seconds of audio per input character.
const SPEECH_SECONDS_PER_CHAR: f64 = 0.05;

pub const TTS_GENERATE: &str = "tts.generate";
pub const TTS_CLEANUP_EXPIRED_CACHE: &str = "tts.cleanup_expired_cache";
pub const MEDIA_PROCESS_UPLOAD: &str = "media.process_upload";
pub const MEDIA_EXTRACT_METADATA: &str = "media.extract_metadata";
pub const KNOWLEDGE_UPDATE_STATISTICS: &str = "knowledge.update_statistics";
pub const SYSTEM_HEALTH_CHECK: &str = "system.health_check";

type TaskResult = std::result::Result<serde_json::Value, JobError>;

/// Register every built-in task with the builder's default policy.
pub fn register_builtin_tasks(builder: &mut TaskRegistryBuilder) -> Result<()> {
    builder
        .register_default(TTS_GENERATE, generate_tts)?
        .register_default(TTS_CLEANUP_EXPIRED_CACHE, cleanup_expired_cache)?
        .register_default(MEDIA_PROCESS_UPLOAD, process_upload)?
        .register_default(MEDIA_EXTRACT_METADATA, extract_metadata)?
        .register_default(KNOWLEDGE_UPDATE_STATISTICS, update_statistics)?
        .register_default(SYSTEM_HEALTH_CHECK, health_check)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct GenerateTts {
    text: String,
    #[serde(default)]
    voice_settings: Option<serde_json::Value>,
}

async fn generate_tts(ctx: TaskContext, payload: serde_json::Value) -> TaskResult {
    let request: GenerateTts = serde_json::from_value(payload)?;
    if request.text.trim().is_empty() {
        return Err(JobError::fatal("text must not be empty").with_code("INVALID_PAYLOAD"));
    }
    ctx.log_info(&format!(
        "Generating speech for {} characters (custom voice: {})",
        request.text.chars().count(),
        request.voice_settings.is_some()
    ));

    Ok(serde_json::json!({
        "status": "completed",
        "audio_url": format!("/api/tts/audio/{}", ctx.job_id()),
        "duration": request.text.chars().count() as f64 * SPEECH_SECONDS_PER_CHAR,
        "cache_key": cache_key(&request.text),
    }))
}

fn cache_key(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("tts:{}", hex::encode(&digest[..8]))
}

async fn cleanup_expired_cache(ctx: TaskContext, _payload: serde_json::Value) -> TaskResult {
    ctx.log_info("Cleaning up expired speech cache entries");
    Ok(serde_json::json!({"cleaned": 0, "status": "completed"}))
}

#[derive(Debug, Deserialize)]
struct ProcessUpload {
    file_id: String,
    file_metadata: serde_json::Value,
}

async fn process_upload(ctx: TaskContext, payload: serde_json::Value) -> TaskResult {
    let upload: ProcessUpload = serde_json::from_value(payload)?;
    ctx.log_info(&format!("Processing upload {}", upload.file_id));

    Ok(serde_json::json!({
        "status": "completed",
        "thumbnail_url": format!("/api/media/thumbnail/{}", upload.file_id),
        "file_id": upload.file_id,
        "processed_metadata": upload.file_metadata,
        "ready_for_processing": true,
    }))
}

#[derive(Debug, Deserialize)]
struct ExtractMetadata {
    file_path: String,
}

async fn extract_metadata(ctx: TaskContext, payload: serde_json::Value) -> TaskResult {
    let request: ExtractMetadata = serde_json::from_value(payload)?;
    ctx.log_info(&format!("Extracting metadata from {}", request.file_path));

    Ok(serde_json::json!({
        "file_type": "pdf",
        "page_count": 10,
        "file_size": 1_024_000,
        "text_extractable": true,
    }))
}

async fn update_statistics(ctx: TaskContext, _payload: serde_json::Value) -> TaskResult {
    ctx.log_info("Updating knowledge statistics");
    Ok(serde_json::json!({
        "status": "completed",
        "updated_at": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn health_check(_ctx: TaskContext, _payload: serde_json::Value) -> TaskResult {
    Ok(serde_json::json!({"status": "healthy", "worker": "visionary"}))
}
