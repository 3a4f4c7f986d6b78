//! Capability → backend bindings, resolved once per process.

use crate::config::Config;
use crate::error::{DubError, Result};
use crate::protocol::{ConnectionPool, Connector, Credentials, StreamingClient, WsConnector};
use crate::providers::openai::{ChatTranslator, OpenAiSpeech, OpenAiTranscriber};
use crate::providers::volcengine::{StreamSettings, VolcengineAsr, VolcengineTts};
use crate::providers::{Capability, SpeechToText, TextToSpeech, Translator};
use once_cell::sync::OnceCell;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Backend ids known for each capability.
const STT_BACKENDS: &[&str] = &["volcengine", "openai"];
const TRANSLATE_BACKENDS: &[&str] = &["openai", "doubao"];
const TTS_BACKENDS: &[&str] = &["volcengine", "openai"];

/// Which backend serves a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderBinding {
    pub capability: Capability,
    pub backend: String,
}

/// A resolved backend.
#[derive(Clone)]
pub enum Backend {
    Stt(Arc<dyn SpeechToText>),
    Translate(Arc<dyn Translator>),
    Tts(Arc<dyn TextToSpeech>),
}

impl Backend {
    pub fn name(&self) -> &str {
        match self {
            Backend::Stt(b) => b.name(),
            Backend::Translate(b) => b.name(),
            Backend::Tts(b) => b.name(),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let capability = match self {
            Backend::Stt(_) => Capability::Stt,
            Backend::Translate(_) => Capability::Translate,
            Backend::Tts(_) => Capability::Tts,
        };
        write!(f, "Backend({}={})", capability, self.name())
    }
}

/// A missing or invalid setting found by [`ProviderRegistry::validate_configuration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    pub capability: Option<Capability>,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.capability {
            Some(capability) => write!(f, "[{}] {}: {}", capability, self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// Hands out one backend per capability.
///
/// Bindings are fixed at construction. Each backend is built on first use
/// and cached for the life of the registry.
pub struct ProviderRegistry {
    config: Config,
    connector: Arc<dyn Connector>,
    stt: OnceCell<Arc<dyn SpeechToText>>,
    translate: OnceCell<Arc<dyn Translator>>,
    tts: OnceCell<Arc<dyn TextToSpeech>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("bindings", &self.bindings())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new(config: &Config) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Use `connector` for the streaming backends instead of WebSockets.
    pub fn with_connector(config: &Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: config.clone(),
            connector,
            stt: OnceCell::new(),
            translate: OnceCell::new(),
            tts: OnceCell::new(),
        }
    }

    /// A registry whose bindings are the given backends.
    pub fn with_backends(
        stt: Arc<dyn SpeechToText>,
        translate: Arc<dyn Translator>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        let mut config = Config::default();
        config.providers.stt = stt.name().to_string();
        config.providers.translate = translate.name().to_string();
        config.providers.tts = tts.name().to_string();
        Self {
            config,
            connector: Arc::new(WsConnector),
            stt: OnceCell::with_value(stt),
            translate: OnceCell::with_value(translate),
            tts: OnceCell::with_value(tts),
        }
    }

    pub fn binding(&self, capability: Capability) -> ProviderBinding {
        let backend = match capability {
            Capability::Stt => &self.config.providers.stt,
            Capability::Translate => &self.config.providers.translate,
            Capability::Tts => &self.config.providers.tts,
        };
        ProviderBinding {
            capability,
            backend: backend.clone(),
        }
    }

    pub fn bindings(&self) -> Vec<ProviderBinding> {
        Capability::ALL.iter().map(|c| self.binding(*c)).collect()
    }

    /// Backend ids that can serve each capability.
    pub fn available() -> BTreeMap<Capability, Vec<&'static str>> {
        BTreeMap::from([
            (Capability::Stt, STT_BACKENDS.to_vec()),
            (Capability::Translate, TRANSLATE_BACKENDS.to_vec()),
            (Capability::Tts, TTS_BACKENDS.to_vec()),
        ])
    }

    pub fn resolve(&self, capability: Capability) -> Result<Backend> {
        Ok(match capability {
            Capability::Stt => Backend::Stt(self.speech_to_text()?),
            Capability::Translate => Backend::Translate(self.translator()?),
            Capability::Tts => Backend::Tts(self.text_to_speech()?),
        })
    }

    pub fn speech_to_text(&self) -> Result<Arc<dyn SpeechToText>> {
        self.stt
            .get_or_try_init(|| {
                let backend: Arc<dyn SpeechToText> = match self.config.providers.stt.as_str() {
                    "volcengine" => Arc::new(VolcengineAsr::new(
                        self.streaming_client(&self.config.speech.asr_url)?,
                        StreamSettings::asr(&self.config.speech),
                    )),
                    "openai" => Arc::new(OpenAiTranscriber::from_config(
                        &self.config.openai,
                        self.op_timeout(),
                    )?),
                    other => return Err(unknown_backend(Capability::Stt, other)),
                };
                tracing::info!(capability = "stt", backend = backend.name(), "backend resolved");
                Ok(backend)
            })
            .cloned()
    }

    pub fn translator(&self) -> Result<Arc<dyn Translator>> {
        self.translate
            .get_or_try_init(|| {
                let backend: Arc<dyn Translator> = match self.config.providers.translate.as_str() {
                    "openai" => Arc::new(ChatTranslator::openai(
                        &self.config.openai,
                        self.op_timeout(),
                    )?),
                    "doubao" => Arc::new(ChatTranslator::doubao(
                        &self.config.doubao,
                        self.op_timeout(),
                    )?),
                    other => return Err(unknown_backend(Capability::Translate, other)),
                };
                tracing::info!(
                    capability = "translate",
                    backend = backend.name(),
                    "backend resolved"
                );
                Ok(backend)
            })
            .cloned()
    }

    pub fn text_to_speech(&self) -> Result<Arc<dyn TextToSpeech>> {
        self.tts
            .get_or_try_init(|| {
                let backend: Arc<dyn TextToSpeech> = match self.config.providers.tts.as_str() {
                    "volcengine" => Arc::new(VolcengineTts::new(
                        self.streaming_client(&self.config.speech.tts_url)?,
                        StreamSettings::tts(&self.config.speech),
                    )),
                    "openai" => Arc::new(OpenAiSpeech::from_config(
                        &self.config.openai,
                        self.op_timeout(),
                    )?),
                    other => return Err(unknown_backend(Capability::Tts, other)),
                };
                tracing::info!(capability = "tts", backend = backend.name(), "backend resolved");
                Ok(backend)
            })
            .cloned()
    }

    /// Every missing or invalid setting for the bound backends and storage.
    pub fn validate_configuration(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let available = Self::available();

        for binding in self.bindings() {
            let known = available
                .get(&binding.capability)
                .is_some_and(|ids| ids.contains(&binding.backend.as_str()));
            // Injected backends are already resolved and need no settings.
            let injected = match binding.capability {
                Capability::Stt => self.stt.get().is_some(),
                Capability::Translate => self.translate.get().is_some(),
                Capability::Tts => self.tts.get().is_some(),
            };
            if injected {
                continue;
            }
            if !known {
                issues.push(ConfigIssue {
                    capability: Some(binding.capability),
                    field: format!("providers.{}", binding.capability),
                    message: format!("unknown backend '{}'", binding.backend),
                });
                continue;
            }
            for field in self.required_fields(&binding) {
                issues.push(ConfigIssue {
                    capability: Some(binding.capability),
                    field: field.to_string(),
                    message: "not set".to_string(),
                });
            }
        }

        if let Err(DubError::ConfigMissing { fields }) = self.config.storage.validate() {
            issues.extend(fields.into_iter().map(|field| ConfigIssue {
                capability: None,
                field,
                message: "not set".to_string(),
            }));
        }

        if self.config.orchestrator.max_concurrent_jobs == 0 {
            issues.push(ConfigIssue {
                capability: None,
                field: "orchestrator.max_concurrent_jobs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        issues
    }

    fn required_fields(&self, binding: &ProviderBinding) -> Vec<&'static str> {
        let speech = &self.config.speech;
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        let set_secret = |v: &Option<secrecy::SecretString>| {
            v.as_ref().is_some_and(|s| !s.expose_secret().trim().is_empty())
        };

        let mut missing = Vec::new();
        match binding.backend.as_str() {
            "volcengine" => {
                if !set(&speech.app_id) {
                    missing.push("speech.app_id");
                }
                if !set_secret(&speech.access_key) {
                    missing.push("speech.access_key");
                }
                if !set_secret(&speech.secret_key) {
                    missing.push("speech.secret_key");
                }
            }
            "openai" => {
                if !set_secret(&self.config.openai.api_key) {
                    missing.push("openai.api_key");
                }
            }
            "doubao" => {
                if !set_secret(&self.config.doubao.api_key) {
                    missing.push("doubao.api_key");
                }
                if !set(&self.config.doubao.model) {
                    missing.push("doubao.model");
                }
            }
            _ => {}
        }
        missing
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.config.orchestrator.operation_timeout_secs)
    }

    fn streaming_client(&self, url: &str) -> Result<StreamingClient> {
        let speech = &self.config.speech;
        let mut missing = Vec::new();
        if speech.app_id.is_none() {
            missing.push("speech.app_id".to_string());
        }
        if speech.access_key.is_none() {
            missing.push("speech.access_key".to_string());
        }
        if speech.secret_key.is_none() {
            missing.push("speech.secret_key".to_string());
        }
        let credentials = match (&speech.app_id, &speech.access_key, &speech.secret_key) {
            (Some(app_id), Some(access_key), Some(secret_key)) => Credentials {
                app_id: app_id.clone(),
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
            },
            _ => return Err(DubError::ConfigMissing { fields: missing }),
        };

        let pool = ConnectionPool::new(
            url,
            Arc::clone(&self.connector),
            Some(credentials),
            speech.pool_size,
            self.op_timeout(),
        );
        Ok(StreamingClient::new(pool, self.op_timeout()))
    }
}

fn unknown_backend(capability: Capability, backend: &str) -> DubError {
    DubError::ConfigInvalidValue {
        key: format!("providers.{}", capability),
        message: format!(
            "unknown backend '{}' (available: {})",
            backend,
            ProviderRegistry::available()
                .get(&capability)
                .map(|ids| ids.join(", "))
                .unwrap_or_default()
        ),
    }
}
