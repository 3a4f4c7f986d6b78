//! Capability traits and the backends that implement them.
//!
//! The orchestrator only ever sees [`SpeechToText`], [`Translator`] and
//! [`TextToSpeech`] trait objects handed out by the [`ProviderRegistry`].

pub mod http;
pub mod mock;
pub mod openai;
pub mod registry;
pub mod volcengine;

use crate::error::{DubError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use mock::{MockSpeechToText, MockTextToSpeech, MockTranslator};
pub use registry::{Backend, ConfigIssue, ProviderBinding, ProviderRegistry};

/// An abstract operation served by interchangeable backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Stt,
    Translate,
    Tts,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Stt, Capability::Translate, Capability::Tts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Stt => "stt",
            Capability::Translate => "translate",
            Capability::Tts => "tts",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = DubError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stt" => Ok(Capability::Stt),
            "translate" => Ok(Capability::Translate),
            "tts" => Ok(Capability::Tts),
            other => Err(DubError::validation(format!("unknown capability '{}'", other))),
        }
    }
}

/// Audio handed to a speech-to-text backend.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInput {
    /// Local copy of the audio.
    pub path: PathBuf,
    /// Public URL of the uploaded copy, when there is one.
    pub url: Option<String>,
    /// Container format, e.g. `wav` or `mp3`.
    pub format: String,
    /// Source language hint; `None` lets the backend detect it.
    pub language: Option<String>,
}

impl AudioInput {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "wav".to_string());
        Self {
            path,
            url: None,
            format,
            language: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// What to say and how.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub language: String,
    /// Backend-specific voice; `None` picks the default for `language`.
    pub voice: Option<String>,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

/// Synthesized speech and its container format.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    /// File extension matching `bytes`, e.g. `mp3`.
    pub format: String,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(&self, audio: &AudioInput, cancel: &CancellationToken) -> Result<String>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    async fn translate(
        &self,
        text: &str,
        target_language: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedAudio>;
}

#[async_trait]
impl<T: SpeechToText + ?Sized> SpeechToText for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn transcribe(&self, audio: &AudioInput, cancel: &CancellationToken) -> Result<String> {
        (**self).transcribe(audio, cancel).await
    }
}

#[async_trait]
impl<T: Translator + ?Sized> Translator for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn translate(
        &self,
        text: &str,
        target_language: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        (**self).translate(text, target_language, cancel).await
    }
}

#[async_trait]
impl<T: TextToSpeech + ?Sized> TextToSpeech for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedAudio> {
        (**self).synthesize(request, cancel).await
    }
}

/// Human-readable language name used in translation prompts.
pub fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "zh" => "Chinese",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "ja" => "Japanese",
        "ko" => "Korean",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_round_trips_through_str() {
        for capability in Capability::ALL {
            assert_eq!(capability.as_str().parse::<Capability>().unwrap(), capability);
        }
        assert!("asr".parse::<Capability>().is_err());
    }

    #[test]
    fn test_audio_input_infers_format_from_extension() {
        let input = AudioInput::from_path("/tmp/Clip.MP3").with_url("https://b/audio/x.mp3");
        assert_eq!(input.format, "mp3");
        assert_eq!(input.url.as_deref(), Some("https://b/audio/x.mp3"));

        let bare = AudioInput::from_path("/tmp/clip");
        assert_eq!(bare.format, "wav");
    }

    #[test]
    fn test_language_name_falls_back_to_code() {
        assert_eq!(language_name("ja"), "Japanese");
        assert_eq!(language_name("pt"), "pt");
    }

    #[tokio::test]
    async fn test_traits_are_object_safe_behind_arc() {
        let stt: Arc<dyn SpeechToText> = Arc::new(MockSpeechToText::new().with_response("hola"));
        let text = stt
            .transcribe(&AudioInput::from_path("a.wav"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "hola");
        assert_eq!(stt.name(), "mock");
    }
}
