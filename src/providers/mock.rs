//! Scripted backends for tests and dry runs.
//!
//! Each mock returns its queued failures first, one per call, then its
//! configured response. Clones share the script and the call counter.

use crate::error::{DubError, ErrorKind, Result};
use crate::providers::{
    AudioInput, SpeechRequest, SpeechToText, SynthesizedAudio, TextToSpeech, Translator,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A representative error of `kind`, as a real backend would raise it.
pub fn mock_error(kind: ErrorKind) -> DubError {
    match kind {
        ErrorKind::Auth => DubError::Auth {
            message: "mock credentials rejected".to_string(),
        },
        ErrorKind::Network => DubError::Network {
            message: "mock connection reset".to_string(),
        },
        ErrorKind::Timeout => DubError::timeout("mock call", Duration::from_millis(10)),
        ErrorKind::Quota => DubError::Quota {
            message: "mock rate limit".to_string(),
        },
        ErrorKind::Validation => DubError::validation("mock rejected input"),
        _ => DubError::protocol("mock protocol failure"),
    }
}

#[derive(Debug, Default)]
struct Script {
    failures: Mutex<VecDeque<ErrorKind>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl Script {
    fn push(&self, kind: ErrorKind) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(kind);
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = Some(delay);
    }

    /// Count the call, honour the delay and cancellation, then pop the next failure.
    async fn next(&self, cancel: &CancellationToken) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DubError::cancelled("mock call cancelled")),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(DubError::cancelled("mock call cancelled"));
        }
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match failure {
            Some(kind) => Err(mock_error(kind)),
            None => Ok(()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Mock speech-to-text.
#[derive(Debug, Clone)]
pub struct MockSpeechToText {
    response: String,
    script: Arc<Script>,
}

impl Default for MockSpeechToText {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSpeechToText {
    pub fn new() -> Self {
        Self {
            response: "mock transcription".to_string(),
            script: Arc::default(),
        }
    }

    /// Configure the mock to return a specific transcript
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Fail the next call with an error of `kind`. Stackable.
    pub fn with_failure(self, kind: ErrorKind) -> Self {
        self.script.push(kind);
        self
    }

    /// Wait `delay` (or until cancelled) on every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.set_delay(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }
}

#[async_trait]
impl SpeechToText for MockSpeechToText {
    fn name(&self) -> &str {
        "mock"
    }

    async fn transcribe(&self, _audio: &AudioInput, cancel: &CancellationToken) -> Result<String> {
        self.script.next(cancel).await?;
        Ok(self.response.clone())
    }
}

/// Mock translator. Without a fixed response it tags the input with the
/// target language, e.g. `[en] hola`.
#[derive(Debug, Clone, Default)]
pub struct MockTranslator {
    response: Option<String>,
    script: Arc<Script>,
}

impl MockTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, response: &str) -> Self {
        self.response = Some(response.to_string());
        self
    }

    pub fn with_failure(self, kind: ErrorKind) -> Self {
        self.script.push(kind);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.set_delay(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }
}

#[async_trait]
impl Translator for MockTranslator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn translate(
        &self,
        text: &str,
        target_language: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.script.next(cancel).await?;
        Ok(self
            .response
            .clone()
            .unwrap_or_else(|| format!("[{}] {}", target_language, text)))
    }
}

/// Mock text-to-speech producing a short silent WAV clip.
#[derive(Debug, Clone)]
pub struct MockTextToSpeech {
    audio: Vec<u8>,
    script: Arc<Script>,
}

impl Default for MockTextToSpeech {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTextToSpeech {
    pub fn new() -> Self {
        Self {
            audio: silent_wav(1600),
            script: Arc::default(),
        }
    }

    pub fn with_audio(mut self, audio: Vec<u8>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_failure(self, kind: ErrorKind) -> Self {
        self.script.push(kind);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.set_delay(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }
}

#[async_trait]
impl TextToSpeech for MockTextToSpeech {
    fn name(&self) -> &str {
        "mock"
    }

    async fn synthesize(
        &self,
        _request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedAudio> {
        self.script.next(cancel).await?;
        Ok(SynthesizedAudio {
            bytes: self.audio.clone(),
            format: "wav".to_string(),
        })
    }
}

/// 16 kHz mono 16-bit WAV of `samples` zero samples.
fn silent_wav(samples: u32) -> Vec<u8> {
    let data_len = samples * 2;
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&16_000u32.to_le_bytes());
    wav.extend_from_slice(&32_000u32.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.resize(44 + data_len as usize, 0);
    wav
}
