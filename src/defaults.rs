//! Default configuration constants for dubflow.
//!
//! Shared by the configuration types, the orchestrator and the backends so
//! the same values are used wherever a setting is left unspecified.

use std::time::Duration;

/// Object key namespace for uploaded source audio.
///
/// Sweeps are scoped to this prefix, so nothing else in the bucket is touched.
pub const AUDIO_PREFIX: &str = "audio/";

/// Maximum number of jobs processed concurrently.
pub const MAX_CONCURRENT_JOBS: usize = 2;

/// Timeout applied to each network-bound operation (handshake, frame I/O,
/// upload, delete, HTTP call).
pub const OPERATION_TIMEOUT_SECS: u64 = 30;

/// Retry attempts per stage, including the first one.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// First backoff delay in milliseconds.
pub const RETRY_INITIAL_DELAY_MS: u64 = 500;

/// Upper bound for any single backoff delay in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Exponential growth factor between attempts.
pub const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Extra factor applied to delays after a quota/rate-limit error.
pub const RETRY_QUOTA_MULTIPLIER: f64 = 4.0;

/// Default age threshold for batch sweeps (24 hours).
pub const SWEEP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum pooled connections per streaming backend.
pub const POOL_MAX_CONNECTIONS: usize = 4;

/// Audio bytes per streamed chunk (100ms of 16kHz 16-bit mono).
pub const AUDIO_CHUNK_BYTES: usize = 3200;

/// Pause between streamed audio chunks in milliseconds.
pub const AUDIO_CHUNK_INTERVAL_MS: u64 = 20;

/// Largest accepted source file (1 GiB).
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Target languages accepted at submission.
pub const SUPPORTED_LANGUAGES: &[&str] = &["en", "zh", "es", "fr", "de", "ja", "ko"];

/// Audio container extensions accepted as-is.
pub const SUPPORTED_AUDIO_FORMATS: &[&str] = &["mp3", "wav", "aac", "flac", "m4a"];

/// Video container extensions; audio is extracted before upload.
pub const SUPPORTED_VIDEO_FORMATS: &[&str] = &["mp4", "avi", "mov", "mkv"];

/// Slowest tempo applied to dubbed audio when fitting it to a video.
pub const TEMPO_MIN_SPEED: f64 = 0.8;

/// Fastest tempo applied to dubbed audio when fitting it to a video.
pub const TEMPO_MAX_SPEED: f64 = 1.2;

/// Tempo changes smaller than this are skipped.
pub const TEMPO_TOLERANCE: f64 = 0.01;

/// Streaming ASR endpoint.
pub const VOLCENGINE_ASR_URL: &str = "wss://openspeech.bytedance.com/api/v1/asr/ws_binary";

/// Streaming TTS endpoint.
pub const VOLCENGINE_TTS_URL: &str = "wss://openspeech.bytedance.com/api/v1/tts/ws_binary";

/// ASR cluster name sent in the session parameters.
pub const VOLCENGINE_ASR_CLUSTER: &str = "volcano_asr";

/// TTS cluster name sent in the session parameters.
pub const VOLCENGINE_TTS_CLUSTER: &str = "volcano_tts";

/// OpenAI-compatible API base.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Doubao (Ark) OpenAI-compatible API base.
pub const DOUBAO_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";

pub const OPENAI_TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const OPENAI_SPEECH_MODEL: &str = "tts-1";
pub const OPENAI_TRANSLATION_MODEL: &str = "gpt-4o-mini";
pub const OPENAI_VOICE: &str = "alloy";

/// Transcript substituted in degraded mode when speech-to-text is unavailable.
pub const PLACEHOLDER_TRANSCRIPT: &str = "[transcription unavailable]";

/// Default voice for a target language on the streaming TTS backend.
pub fn volcengine_voice(language: &str) -> &'static str {
    match language {
        "en" => "en_female_amanda_mars",
        "ja" => "ja_female_nanami_mars",
        "ko" => "ko_female_yeonhee_mars",
        _ => "zh_female_cancan_mars_bigtts",
    }
}
