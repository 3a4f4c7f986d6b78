//! OpenAI-compatible HTTP backends: Whisper transcription, speech synthesis
//! and chat-completion translation (OpenAI itself or Doubao).

use crate::config::{DoubaoConfig, OpenAiConfig};
use crate::error::{DubError, Result};
use crate::providers::http::ApiClient;
use crate::providers::{
    AudioInput, SpeechRequest, SpeechToText, SynthesizedAudio, TextToSpeech, Translator,
    language_name,
};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn require_key(key: &Option<SecretString>, field: &str) -> Result<SecretString> {
    key.clone().ok_or_else(|| DubError::ConfigMissing {
        fields: vec![field.to_string()],
    })
}

fn mime_for(format: &str) -> &'static str {
    match format {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// `POST /audio/transcriptions`
#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    api: ApiClient,
    model: String,
}

impl OpenAiTranscriber {
    pub fn new(api: ApiClient, model: impl Into<String>) -> Self {
        Self {
            api,
            model: model.into(),
        }
    }

    pub fn from_config(config: &OpenAiConfig, op_timeout: Duration) -> Result<Self> {
        let key = require_key(&config.api_key, "openai.api_key")?;
        Ok(Self::new(
            ApiClient::new(&config.base_url, key, op_timeout),
            &config.transcription_model,
        ))
    }
}

#[async_trait]
impl SpeechToText for OpenAiTranscriber {
    fn name(&self) -> &str {
        "openai"
    }

    async fn transcribe(&self, audio: &AudioInput, cancel: &CancellationToken) -> Result<String> {
        let bytes = tokio::fs::read(&audio.path).await?;
        let file_name = audio
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("audio.{}", audio.format));
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(&audio.format))
            .map_err(|e| DubError::validation(format!("bad audio mime type: {}", e)))?;

        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");
        if let Some(language) = &audio.language {
            form = form.text("language", language.clone());
        }

        let request = self.api.post("audio/transcriptions").multipart(form);
        let body = self.api.execute_json("transcription", request, cancel).await?;
        body.get("text")
            .and_then(Value::as_str)
            .map(|t| t.trim().to_string())
            .ok_or_else(|| DubError::protocol("transcription response has no text"))
    }
}

/// `POST /audio/speech`
#[derive(Debug, Clone)]
pub struct OpenAiSpeech {
    api: ApiClient,
    model: String,
    voice: String,
}

impl OpenAiSpeech {
    pub fn new(api: ApiClient, model: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            api,
            model: model.into(),
            voice: voice.into(),
        }
    }

    pub fn from_config(config: &OpenAiConfig, op_timeout: Duration) -> Result<Self> {
        let key = require_key(&config.api_key, "openai.api_key")?;
        Ok(Self::new(
            ApiClient::new(&config.base_url, key, op_timeout),
            &config.speech_model,
            &config.voice,
        ))
    }
}

#[async_trait]
impl TextToSpeech for OpenAiSpeech {
    fn name(&self) -> &str {
        "openai"
    }

    async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedAudio> {
        let body = json!({
            "model": self.model,
            "input": request.text,
            "voice": request.voice.as_deref().unwrap_or(&self.voice),
            "response_format": "mp3",
        });
        let http = self.api.post("audio/speech").json(&body);
        let bytes = self.api.execute_bytes("speech synthesis", http, cancel).await?;
        if bytes.is_empty() {
            return Err(DubError::protocol("speech synthesis returned no audio"));
        }
        Ok(SynthesizedAudio {
            bytes,
            format: "mp3".to_string(),
        })
    }
}

/// Translation through `POST /chat/completions`.
#[derive(Debug, Clone)]
pub struct ChatTranslator {
    name: &'static str,
    api: ApiClient,
    model: String,
}

impl ChatTranslator {
    pub fn new(name: &'static str, api: ApiClient, model: impl Into<String>) -> Self {
        Self {
            name,
            api,
            model: model.into(),
        }
    }

    pub fn openai(config: &OpenAiConfig, op_timeout: Duration) -> Result<Self> {
        let key = require_key(&config.api_key, "openai.api_key")?;
        Ok(Self::new(
            "openai",
            ApiClient::new(&config.base_url, key, op_timeout),
            &config.translation_model,
        ))
    }

    /// Doubao serves the same API shape under its own base URL; the model is
    /// the deployed endpoint id.
    pub fn doubao(config: &DoubaoConfig, op_timeout: Duration) -> Result<Self> {
        let mut missing = Vec::new();
        if config.api_key.is_none() {
            missing.push("doubao.api_key".to_string());
        }
        if config.model.as_deref().is_none_or(str::is_empty) {
            missing.push("doubao.model".to_string());
        }
        match (&config.api_key, &config.model) {
            (Some(key), Some(model)) if missing.is_empty() => Ok(Self::new(
                "doubao",
                ApiClient::new(&config.base_url, key.clone(), op_timeout),
                model,
            )),
            _ => Err(DubError::ConfigMissing { fields: missing }),
        }
    }

    fn request_body(&self, text: &str, target_language: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": 0.3,
            "messages": [
                {
                    "role": "system",
                    "content": format!(
                        "You are a professional translator. Translate the user's text into {}. \
                         Keep the meaning and tone. Reply with the translation only.",
                        language_name(target_language)
                    ),
                },
                { "role": "user", "content": text },
            ],
        })
    }
}

/// Pull `choices[0].message.content` out of a chat completion.
pub fn completion_text(body: &Value) -> Result<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| DubError::protocol("chat completion has no content"))
}

#[async_trait]
impl Translator for ChatTranslator {
    fn name(&self) -> &str {
        self.name
    }

    async fn translate(
        &self,
        text: &str,
        target_language: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let http = self
            .api
            .post("chat/completions")
            .json(&self.request_body(text, target_language));
        let body = self.api.execute_json("translation", http, cancel).await?;
        completion_text(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_completion_text_extracts_first_choice() {
        let body = json!({
            "choices": [{ "message": { "role": "assistant", "content": "  Hello world \n" } }]
        });
        assert_eq!(completion_text(&body).unwrap(), "Hello world");
    }

    #[test]
    fn test_completion_text_rejects_empty_content() {
        let body = json!({ "choices": [{ "message": { "content": "" } }] });
        assert_eq!(completion_text(&body).unwrap_err().kind(), ErrorKind::Protocol);
        assert!(completion_text(&json!({})).is_err());
    }

    #[test]
    fn test_openai_backends_require_api_key() {
        let config = OpenAiConfig::default();
        let err = ChatTranslator::openai(&config, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.to_string(), "Missing configuration: openai.api_key");
        assert!(OpenAiSpeech::from_config(&config, Duration::from_secs(1)).is_err());
        assert!(OpenAiTranscriber::from_config(&config, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_doubao_names_every_missing_field() {
        let err = ChatTranslator::doubao(&DoubaoConfig::default(), Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing configuration: doubao.api_key, doubao.model"
        );

        let config = DoubaoConfig {
            api_key: Some(SecretString::from("k".to_string())),
            model: Some("ep-123".to_string()),
            ..DoubaoConfig::default()
        };
        let translator = ChatTranslator::doubao(&config, Duration::from_secs(1)).unwrap();
        assert_eq!(translator.name(), "doubao");
    }

    #[test]
    fn test_prompt_names_target_language() {
        let mut config = OpenAiConfig::default();
        config.api_key = Some(SecretString::from("k".to_string()));
        let translator = ChatTranslator::openai(&config, Duration::from_secs(1)).unwrap();
        let body = translator.request_body("你好", "fr");
        let system = body.pointer("/messages/0/content").and_then(Value::as_str).unwrap();
        assert!(system.contains("French"));
        assert_eq!(body.pointer("/messages/1/content").unwrap(), "你好");
    }
}
