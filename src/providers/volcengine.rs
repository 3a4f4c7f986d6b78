//! Volcengine streaming ASR and TTS over the binary protocol.

use crate::config::SpeechConfig;
use crate::defaults;
use crate::error::{DubError, Result};
use crate::protocol::{Compression, ServerEvent, SessionConfig, SessionHandle, StreamingClient};
use crate::providers::{AudioInput, SpeechRequest, SpeechToText, SynthesizedAudio, TextToSpeech};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Settings shared by both streaming backends.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub app_id: String,
    pub cluster: String,
    pub chunk_bytes: usize,
    pub chunk_interval: Duration,
    pub compression: Compression,
}

impl StreamSettings {
    fn from_config(config: &SpeechConfig, cluster: &str) -> Self {
        Self {
            app_id: config.app_id.clone().unwrap_or_default(),
            cluster: cluster.to_string(),
            chunk_bytes: config.chunk_bytes.max(1),
            chunk_interval: Duration::from_millis(config.chunk_interval_ms),
            compression: if config.gzip {
                Compression::Gzip
            } else {
                Compression::None
            },
        }
    }

    pub fn asr(config: &SpeechConfig) -> Self {
        Self::from_config(config, &config.asr_cluster)
    }

    pub fn tts(config: &SpeechConfig) -> Self {
        Self::from_config(config, &config.tts_cluster)
    }
}

/// Close the session however it ended and hand back the outcome.
async fn finish<T>(handle: SessionHandle, what: &str, outcome: Result<T>) -> Result<T> {
    if let Err(e) = &outcome {
        tracing::debug!(
            session_id = %handle.session().id(),
            error = %e,
            "{} session aborted",
            what
        );
    }
    handle.close().await;
    outcome
}

/// Wait for the server's final result, surfacing error frames.
async fn await_final(handle: &mut SessionHandle) -> Result<()> {
    loop {
        match handle.receive().await? {
            ServerEvent::FinalResult(_) => return Ok(()),
            ServerEvent::Error { code, message } => {
                return Err(crate::protocol::error_for_code(code, &message));
            }
            ServerEvent::PartialResult(_) | ServerEvent::Ack { .. } => {}
        }
    }
}

/// Streaming speech recognition: the audio file is sent in fixed-size
/// chunks, the last one with a negative sequence number.
#[derive(Debug, Clone)]
pub struct VolcengineAsr {
    client: StreamingClient,
    settings: StreamSettings,
}

impl VolcengineAsr {
    pub fn new(client: StreamingClient, settings: StreamSettings) -> Self {
        Self { client, settings }
    }

    fn session_params(&self, audio: &AudioInput) -> Value {
        json!({
            "app": {
                "appid": self.settings.app_id,
                "cluster": self.settings.cluster,
            },
            "user": { "uid": Uuid::new_v4().to_string() },
            "request": {
                "reqid": Uuid::new_v4().to_string(),
                "language": audio.language.as_deref().unwrap_or("zh-CN"),
                "show_utterances": true,
                "nbest": 1,
                "result_type": "single",
                "enable_itn": true,
                "enable_punc": true,
            },
            "audio": {
                "format": audio.format,
                "bits": 16,
                "channel": 1,
                "rate": 16000,
            },
        })
    }
}

#[async_trait]
impl SpeechToText for VolcengineAsr {
    fn name(&self) -> &str {
        "volcengine"
    }

    async fn transcribe(&self, audio: &AudioInput, cancel: &CancellationToken) -> Result<String> {
        let bytes = tokio::fs::read(&audio.path).await?;
        if bytes.is_empty() {
            return Err(DubError::validation(format!(
                "{} contains no audio",
                audio.path.display()
            )));
        }

        let config = SessionConfig::new(self.session_params(audio))
            .with_compression(self.settings.compression);
        let mut handle = open_session(&self.client, &config, cancel, "transcription").await?;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DubError::cancelled("transcription cancelled")),
            result = stream_audio(&mut handle, &bytes, &self.settings) => result,
        };
        finish(handle, "transcription", outcome).await
    }
}

/// Open a session, giving up as soon as `cancel` fires. A connection that
/// was already checked out is discarded with the abandoned future.
async fn open_session(
    client: &StreamingClient,
    config: &SessionConfig,
    cancel: &CancellationToken,
    operation: &str,
) -> Result<SessionHandle> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DubError::cancelled(format!("{} cancelled", operation))),
        handle = client.open(config) => handle,
    }
}

/// Send `bytes` as audio chunks and wait for the recognized text.
async fn stream_audio(
    handle: &mut SessionHandle,
    bytes: &[u8],
    settings: &StreamSettings,
) -> Result<String> {
    let chunks: Vec<&[u8]> = bytes.chunks(settings.chunk_bytes).collect();
    let total = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let is_last = i + 1 == total;
        handle.send_audio_chunk(chunk, is_last).await?;
        // Results may arrive while audio is still streaming.
        while let Some(event) = handle.try_receive()? {
            match event {
                ServerEvent::Error { code, message } => {
                    return Err(crate::protocol::error_for_code(code, &message));
                }
                ServerEvent::FinalResult(_) => {
                    return Ok(handle.session().transcript().trim().to_string());
                }
                ServerEvent::PartialResult(_) | ServerEvent::Ack { .. } => {}
            }
        }
        if !is_last && !settings.chunk_interval.is_zero() {
            tokio::time::sleep(settings.chunk_interval).await;
        }
    }
    tracing::debug!(chunks = total, "audio stream sent");
    await_final(handle).await?;
    Ok(handle.session().transcript().trim().to_string())
}

/// Streaming speech synthesis: one full request, audio frames back until
/// the final frame.
#[derive(Debug, Clone)]
pub struct VolcengineTts {
    client: StreamingClient,
    settings: StreamSettings,
}

impl VolcengineTts {
    pub fn new(client: StreamingClient, settings: StreamSettings) -> Self {
        Self { client, settings }
    }

    fn session_params(&self, request: &SpeechRequest) -> Value {
        let voice = request
            .voice
            .clone()
            .unwrap_or_else(|| defaults::volcengine_voice(&request.language).to_string());
        json!({
            "app": {
                "appid": self.settings.app_id,
                "cluster": self.settings.cluster,
            },
            "user": { "uid": "dubflow" },
            "audio": {
                "voice_type": voice,
                "encoding": "wav",
                "rate": 24000,
                "speed_ratio": 1.0,
                "volume_ratio": 1.0,
                "pitch_ratio": 1.0,
            },
            "request": {
                "reqid": Uuid::new_v4().to_string(),
                "text": request.text,
                "text_type": "plain",
                "operation": "submit",
            },
        })
    }
}

#[async_trait]
impl TextToSpeech for VolcengineTts {
    fn name(&self) -> &str {
        "volcengine"
    }

    async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedAudio> {
        if request.text.trim().is_empty() {
            return Err(DubError::validation("nothing to synthesize"));
        }
        let config = SessionConfig::new(self.session_params(request))
            .with_compression(self.settings.compression);
        let mut handle = open_session(&self.client, &config, cancel, "synthesis").await?;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DubError::cancelled("synthesis cancelled")),
            result = collect_audio(&mut handle) => result,
        };
        finish(handle, "synthesis", outcome).await
    }
}

async fn collect_audio(handle: &mut SessionHandle) -> Result<SynthesizedAudio> {
    await_final(handle).await?;
    let bytes = handle.take_audio();
    if bytes.is_empty() {
        return Err(DubError::protocol("synthesis finished without audio"));
    }
    Ok(SynthesizedAudio {
        bytes,
        format: "wav".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::{ChannelConnector, ConnectionPool, Flags, Frame, MessageType, ServerEnd};
    use std::sync::Arc;

    fn client(connector: ChannelConnector) -> StreamingClient {
        let pool = ConnectionPool::new(
            "wss://speech.test",
            Arc::new(connector),
            None,
            2,
            Duration::from_secs(1),
        );
        StreamingClient::new(pool, Duration::from_secs(2))
    }

    fn settings(chunk_bytes: usize) -> StreamSettings {
        StreamSettings {
            app_id: "app".to_string(),
            cluster: "volcano_asr".to_string(),
            chunk_bytes,
            chunk_interval: Duration::ZERO,
            compression: Compression::None,
        }
    }

    fn json_response(body: Value, flags: Flags, seq: Option<i32>) -> Vec<u8> {
        let mut frame = Frame::new(
            MessageType::FullServerResponse,
            flags,
            serde_json::to_vec(&body).unwrap(),
        )
        .with_serialization(crate::protocol::frame::Serialization::Json);
        if let Some(seq) = seq {
            frame = frame.with_sequence(seq);
        }
        frame.encode().unwrap()
    }

    async fn read_frame(server: &mut ServerEnd) -> Frame {
        let bytes = server.from_client.recv().await.expect("client frame");
        Frame::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_asr_streams_chunks_and_returns_final_text() {
        let (connector, mut accept) = ChannelConnector::new();
        let asr = VolcengineAsr::new(client(connector), settings(4));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, b"0123456789").unwrap();

        let server = tokio::spawn(async move {
            let mut end = accept.recv().await.unwrap();
            let request = read_frame(&mut end).await;
            assert_eq!(request.message_type, MessageType::FullClientRequest);
            let params: Value = request.json().unwrap();
            assert_eq!(params["audio"]["format"], "wav");

            let mut sequences = Vec::new();
            loop {
                let frame = read_frame(&mut end).await;
                sequences.push(frame.sequence.unwrap());
                if frame.sequence.unwrap() < 0 {
                    break;
                }
            }
            end.to_client
                .send(json_response(
                    json!({"code": 1000, "result": [{"text": "hello there"}]}),
                    Flags::NEGATIVE_SEQUENCE,
                    Some(-4),
                ))
                .unwrap();
            (sequences, end)
        });

        let text = asr
            .transcribe(&AudioInput::from_path(&path), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "hello there");
        let (sequences, _end) = server.await.unwrap();
        assert_eq!(sequences, vec![2, 3, -4]);
    }

    #[tokio::test]
    async fn test_asr_surfaces_server_auth_error() {
        let (connector, mut accept) = ChannelConnector::new();
        let asr = VolcengineAsr::new(client(connector), settings(3200));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, vec![1u8; 100]).unwrap();

        tokio::spawn(async move {
            let mut end = accept.recv().await.unwrap();
            let _request = read_frame(&mut end).await;
            let _audio = read_frame(&mut end).await;
            end.to_client
                .send(json_response(
                    json!({"code": 1001, "message": "invalid token"}),
                    Flags::NO_SEQUENCE,
                    None,
                ))
                .unwrap();
            // Keep the connection open until the client hangs up.
            while end.from_client.recv().await.is_some() {}
        });

        let err = asr
            .transcribe(&AudioInput::from_path(&path), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_asr_rejects_empty_audio_without_connecting() {
        let (connector, _accept) = ChannelConnector::new();
        let probe = connector.clone();
        let asr = VolcengineAsr::new(client(connector), settings(3200));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        std::fs::write(&path, b"").unwrap();

        let err = asr
            .transcribe(&AudioInput::from_path(&path), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(probe.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_tts_collects_audio_frames_until_final() {
        let (connector, mut accept) = ChannelConnector::new();
        let tts = VolcengineTts::new(client(connector), settings(3200));

        tokio::spawn(async move {
            let mut end = accept.recv().await.unwrap();
            let request = read_frame(&mut end).await;
            let params: Value = request.json().unwrap();
            assert_eq!(params["audio"]["voice_type"], "en_female_amanda_mars");
            assert_eq!(params["request"]["text"], "Good morning");

            let partial = Frame::new(
                MessageType::AudioOnlyServer,
                Flags::POSITIVE_SEQUENCE,
                b"RIFF".to_vec(),
            )
            .with_sequence(1);
            let last = Frame::new(
                MessageType::AudioOnlyServer,
                Flags::NEGATIVE_SEQUENCE,
                b"DATA".to_vec(),
            )
            .with_sequence(-2);
            end.to_client.send(partial.encode().unwrap()).unwrap();
            end.to_client.send(last.encode().unwrap()).unwrap();
            while end.from_client.recv().await.is_some() {}
        });

        let audio = tts
            .synthesize(&SpeechRequest::new("Good morning", "en"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(audio.bytes, b"RIFFDATA");
        assert_eq!(audio.format, "wav");
    }

    #[tokio::test]
    async fn test_tts_cancellation_closes_the_connection() {
        let (connector, mut accept) = ChannelConnector::new();
        let tts = VolcengineTts::new(client(connector), settings(3200));
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut end = accept.recv().await.unwrap();
            let _request = read_frame(&mut end).await;
            // Never answer; report when the client disconnects.
            end.from_client.recv().await.is_none()
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tts
            .synthesize(&SpeechRequest::new("hello", "en"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(server.await.unwrap(), "server should observe the disconnect");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait_for_pool_slot() {
        let (connector, _accept) = ChannelConnector::new();
        let pool = ConnectionPool::new(
            "wss://speech.test",
            Arc::new(connector),
            None,
            1,
            Duration::from_secs(30),
        );
        let client = StreamingClient::new(pool, Duration::from_secs(30));
        let _busy = client.pool().acquire().await.unwrap();
        let tts = VolcengineTts::new(client, settings(3200));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            tts.synthesize(&SpeechRequest::new("hello", "en"), &cancel),
        )
        .await
        .expect("cancellation should not wait for the pool")
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
