use crate::defaults;
use crate::error::{DubError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub speech: SpeechConfig,
    pub openai: OpenAiConfig,
    pub doubao: DoubaoConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

/// Backend chosen for each capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub stt: String,
    pub tts: String,
    pub translate: String,
}

/// Streaming speech service (ASR and TTS).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub app_id: Option<String>,
    #[serde(serialize_with = "redact")]
    pub access_key: Option<SecretString>,
    #[serde(serialize_with = "redact")]
    pub secret_key: Option<SecretString>,
    pub asr_url: String,
    pub tts_url: String,
    pub asr_cluster: String,
    pub tts_cluster: String,
    /// Connections kept per endpoint.
    pub pool_size: usize,
    pub chunk_bytes: usize,
    pub chunk_interval_ms: u64,
    /// Gzip request payloads.
    pub gzip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    #[serde(serialize_with = "redact")]
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub transcription_model: String,
    pub speech_model: String,
    pub translation_model: String,
    pub voice: String,
}

/// Doubao chat model behind an OpenAI-compatible API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubaoConfig {
    #[serde(serialize_with = "redact")]
    pub api_key: Option<SecretString>,
    pub base_url: String,
    /// Endpoint id of the deployed model (`ep-...`).
    pub model: Option<String>,
}

/// S3-compatible bucket for uploaded source media.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    #[serde(serialize_with = "redact")]
    pub access_key: Option<SecretString>,
    #[serde(serialize_with = "redact")]
    pub secret_key: Option<SecretString>,
    pub prefix: String,
}

/// Storage settings with every required field present.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: SecretString,
    pub secret_key: SecretString,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_jobs: usize,
    pub operation_timeout_secs: u64,
    /// Default per-job deadline; unset means no deadline.
    pub job_deadline_secs: Option<u64>,
    pub output_dir: PathBuf,
    /// Substitute a placeholder transcript when speech-to-text keeps failing.
    pub degraded_transcription: bool,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub quota_multiplier: f64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct JobsConfig {
    /// JSON file for job records; unset keeps jobs in memory only.
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub filter: String,
    pub json: bool,
}

fn redact<S: Serializer>(
    value: &Option<SecretString>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("[REDACTED]"),
        None => serializer.serialize_none(),
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            stt: "volcengine".to_string(),
            tts: "volcengine".to_string(),
            translate: "openai".to_string(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            access_key: None,
            secret_key: None,
            asr_url: defaults::VOLCENGINE_ASR_URL.to_string(),
            tts_url: defaults::VOLCENGINE_TTS_URL.to_string(),
            asr_cluster: defaults::VOLCENGINE_ASR_CLUSTER.to_string(),
            tts_cluster: defaults::VOLCENGINE_TTS_CLUSTER.to_string(),
            pool_size: defaults::POOL_MAX_CONNECTIONS,
            chunk_bytes: defaults::AUDIO_CHUNK_BYTES,
            chunk_interval_ms: defaults::AUDIO_CHUNK_INTERVAL_MS,
            gzip: false,
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: defaults::OPENAI_BASE_URL.to_string(),
            transcription_model: defaults::OPENAI_TRANSCRIPTION_MODEL.to_string(),
            speech_model: defaults::OPENAI_SPEECH_MODEL.to_string(),
            translation_model: defaults::OPENAI_TRANSLATION_MODEL.to_string(),
            voice: defaults::OPENAI_VOICE.to_string(),
        }
    }
}

impl Default for DoubaoConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: defaults::DOUBAO_BASE_URL.to_string(),
            model: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: None,
            bucket: None,
            access_key: None,
            secret_key: None,
            prefix: defaults::AUDIO_PREFIX.to_string(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: defaults::MAX_CONCURRENT_JOBS,
            operation_timeout_secs: defaults::OPERATION_TIMEOUT_SECS,
            job_deadline_secs: None,
            output_dir: PathBuf::from("output"),
            degraded_transcription: false,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            initial_delay_ms: defaults::RETRY_INITIAL_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            backoff_multiplier: defaults::RETRY_BACKOFF_MULTIPLIER,
            quota_multiplier: defaults::RETRY_QUOTA_MULTIPLIER,
            jitter: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,dubflow=debug".to_string(),
            json: false,
        }
    }
}

impl StorageConfig {
    /// Check that every required field is set, naming all that are not.
    pub fn validate(&self) -> Result<StorageSettings> {
        fn present(value: &Option<String>) -> Option<String> {
            value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
        }
        fn present_secret(value: &Option<SecretString>) -> Option<SecretString> {
            value
                .as_ref()
                .filter(|v| !v.expose_secret().trim().is_empty())
                .cloned()
        }

        let endpoint = present(&self.endpoint);
        let region = present(&self.region);
        let bucket = present(&self.bucket);
        let access_key = present_secret(&self.access_key);
        let secret_key = present_secret(&self.secret_key);

        let mut missing = Vec::new();
        if endpoint.is_none() {
            missing.push("storage.endpoint".to_string());
        }
        if region.is_none() {
            missing.push("storage.region".to_string());
        }
        if bucket.is_none() {
            missing.push("storage.bucket".to_string());
        }
        if access_key.is_none() {
            missing.push("storage.access_key".to_string());
        }
        if secret_key.is_none() {
            missing.push("storage.secret_key".to_string());
        }

        match (endpoint, region, bucket, access_key, secret_key) {
            (Some(endpoint), Some(region), Some(bucket), Some(access_key), Some(secret_key)) => {
                Ok(StorageSettings {
                    endpoint,
                    region,
                    bucket,
                    access_key,
                    secret_key,
                })
            }
            _ => Err(DubError::ConfigMissing { fields: missing }),
        }
    }
}

impl StorageSettings {
    fn host(&self) -> &str {
        let endpoint = self.endpoint.trim_end_matches('/');
        endpoint
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(endpoint)
    }

    /// Base URL objects are served under: `https://<bucket>.<endpoint host>`.
    pub fn public_base(&self) -> String {
        format!("https://{}.{}", self.bucket, self.host())
    }

    /// Request endpoint for virtual-hosted-style access.
    pub fn endpoint_url(&self) -> String {
        self.public_base()
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults only when the file is missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - STT_PROVIDER, TTS_PROVIDER, TRANSLATION_PROVIDER → providers.*
    /// - VOLCENGINE_ASR_APP_ID, VOLCENGINE_ASR_ACCESS_TOKEN, VOLCENGINE_ASR_SECRET_KEY → speech.*
    /// - VOLCENGINE_ACCESS_KEY, VOLCENGINE_SECRET_KEY → storage credentials
    /// - TOS_ENDPOINT, TOS_REGION, TOS_BUCKET → storage.*
    /// - OPENAI_API_KEY, OPENAI_BASE_URL → openai.*
    /// - DOUBAO_API_KEY, DOUBAO_BASE_URL, DOUBAO_MODEL → doubao.*
    /// - DUBFLOW_OUTPUT_DIR, DUBFLOW_JOB_STORE, DUBFLOW_MAX_CONCURRENT_JOBS, DUBFLOW_LOG
    pub fn with_env_overrides(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let secret = |name: &str| var(name).map(SecretString::from);

        if let Some(v) = var("STT_PROVIDER") {
            self.providers.stt = v;
        }
        if let Some(v) = var("TTS_PROVIDER") {
            self.providers.tts = v;
        }
        if let Some(v) = var("TRANSLATION_PROVIDER") {
            self.providers.translate = v;
        }

        if let Some(v) = var("VOLCENGINE_ASR_APP_ID") {
            self.speech.app_id = Some(v);
        }
        if let Some(v) = secret("VOLCENGINE_ASR_ACCESS_TOKEN") {
            self.speech.access_key = Some(v);
        }
        if let Some(v) = secret("VOLCENGINE_ASR_SECRET_KEY") {
            self.speech.secret_key = Some(v);
        }

        if let Some(v) = secret("VOLCENGINE_ACCESS_KEY") {
            self.storage.access_key = Some(v);
        }
        if let Some(v) = secret("VOLCENGINE_SECRET_KEY") {
            self.storage.secret_key = Some(v);
        }
        if let Some(v) = var("TOS_ENDPOINT") {
            self.storage.endpoint = Some(v);
        }
        if let Some(v) = var("TOS_REGION") {
            self.storage.region = Some(v);
        }
        if let Some(v) = var("TOS_BUCKET") {
            self.storage.bucket = Some(v);
        }

        if let Some(v) = secret("OPENAI_API_KEY") {
            self.openai.api_key = Some(v);
        }
        if let Some(v) = var("OPENAI_BASE_URL") {
            self.openai.base_url = v;
        }
        if let Some(v) = secret("DOUBAO_API_KEY") {
            self.doubao.api_key = Some(v);
        }
        if let Some(v) = var("DOUBAO_BASE_URL") {
            self.doubao.base_url = v;
        }
        if let Some(v) = var("DOUBAO_MODEL") {
            self.doubao.model = Some(v);
        }

        if let Some(v) = var("DUBFLOW_OUTPUT_DIR") {
            self.orchestrator.output_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DUBFLOW_JOB_STORE") {
            self.jobs.store_path = Some(PathBuf::from(v));
        }
        if let Some(n) = var("DUBFLOW_MAX_CONCURRENT_JOBS").and_then(|v| v.parse().ok()) {
            self.orchestrator.max_concurrent_jobs = n;
        }
        if let Some(v) = var("DUBFLOW_LOG") {
            self.logging.filter = v;
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/dubflow/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dubflow").join("config.toml"))
    }

    /// Default location of the job store when none is configured.
    #[cfg(feature = "cli")]
    pub fn default_job_store_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("dubflow").join("jobs.json"))
    }
}

/// Starter file written by `dubflow config init`.
pub const CONFIG_TEMPLATE: &str = r#"# dubflow configuration

[providers]
stt = "volcengine"        # volcengine | openai
tts = "volcengine"        # volcengine | openai
translate = "openai"      # openai | doubao

[speech]
# app_id = ""
# access_key = ""
# secret_key = ""

[openai]
# api_key = ""

[doubao]
# api_key = ""
# model = "ep-..."

[storage]
# endpoint = "tos-s3-cn-beijing.volces.com"
# region = "cn-beijing"
# bucket = ""
# access_key = ""
# secret_key = ""
prefix = "audio/"

[orchestrator]
max_concurrent_jobs = 2
operation_timeout_secs = 30
output_dir = "output"
degraded_transcription = false

[orchestrator.retry]
max_attempts = 3
initial_delay_ms = 500
max_delay_ms = 30000

[logging]
filter = "info,dubflow=debug"
json = false
"#;
