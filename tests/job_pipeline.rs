//! End-to-end job runs against mock backends and in-memory storage.

use dubflow::{DubError, ErrorKind};
use dubflow::job::{FileJobStore, Job, JobStore, MemoryJobStore, Stage, StageOutcome, Status};
use dubflow::media::PassthroughToolkit;
use dubflow::orchestrator::{JobRequest, Orchestrator, OrchestratorSettings, RetryPolicy};
use dubflow::protocol::frame::Serialization;
use dubflow::protocol::{ChannelConnector, Compression, ConnectionPool, Frame, StreamingClient};
use dubflow::providers::volcengine::{StreamSettings, VolcengineTts};
use dubflow::providers::{
    MockSpeechToText, MockTextToSpeech, MockTranslator, ProviderRegistry, SpeechToText,
    TextToSpeech, Translator,
};
use dubflow::storage::ResourceManager;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMultipartOptions, PutOptions, PutPayload, PutResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const UPLOAD_PREFIX: &str = "audio/";
const BUCKET_URL: &str = "https://dub-bucket.tos.example.com";

/// In-memory bucket whose first `stalls` puts hang well past any timeout.
#[derive(Debug)]
struct StallingStore {
    inner: InMemory,
    stalls: AtomicUsize,
    puts: AtomicUsize,
}

impl StallingStore {
    fn new(stalls: usize) -> Self {
        Self {
            inner: InMemory::new(),
            stalls: AtomicUsize::new(stalls),
            puts: AtomicUsize::new(0),
        }
    }
}

impl std::fmt::Display for StallingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StallingStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for StallingStore {
    async fn put_opts(
        &self,
        location: &StorePath,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let stall = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stall {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &StorePath,
        opts: PutMultipartOptions,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &StorePath,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &StorePath) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(
        &self,
        prefix: Option<&StorePath>,
    ) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&StorePath>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &StorePath, to: &StorePath) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(
        &self,
        from: &StorePath,
        to: &StorePath,
    ) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

fn write_wav(path: &Path, seconds: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..(16_000 * seconds) {
        let sample = ((i as f32 * 0.05).sin() * 8_000.0) as i16;
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
}

struct Pipeline {
    orchestrator: Orchestrator,
    storage: Arc<ResourceManager>,
    store: Arc<dyn JobStore>,
    output_dir: PathBuf,
    dir: tempfile::TempDir,
}

impl Pipeline {
    fn new(
        stt: Arc<dyn SpeechToText>,
        translator: Arc<dyn Translator>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self::with_store(stt, translator, tts, Arc::new(MemoryJobStore::new()))
    }

    fn with_store(
        stt: Arc<dyn SpeechToText>,
        translator: Arc<dyn Translator>,
        tts: Arc<dyn TextToSpeech>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let storage = ResourceManager::new(Arc::new(InMemory::new()), BUCKET_URL);
        Self::with_parts(stt, translator, tts, store, storage)
    }

    fn with_parts(
        stt: Arc<dyn SpeechToText>,
        translator: Arc<dyn Translator>,
        tts: Arc<dyn TextToSpeech>,
        store: Arc<dyn JobStore>,
        storage: ResourceManager,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("output");
        let storage = Arc::new(storage);
        let settings = OrchestratorSettings {
            retry: RetryPolicy::immediate(3),
            output_dir: output_dir.clone(),
            ..OrchestratorSettings::default()
        };
        let orchestrator = Orchestrator::new(
            store.clone(),
            storage.clone(),
            Arc::new(ProviderRegistry::with_backends(stt, translator, tts)),
            Arc::new(PassthroughToolkit),
            settings,
        );
        Self {
            orchestrator,
            storage,
            store,
            output_dir,
            dir,
        }
    }

    fn clip(&self, name: &str, seconds: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        write_wav(&path, seconds);
        path
    }

    async fn run(&self, source: &Path, target: &str) -> Job {
        let id = self
            .orchestrator
            .submit(JobRequest::new(source, target))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.orchestrator.wait(id))
            .await
            .expect("job should finish")
            .unwrap()
    }

    async fn residual_objects(&self) -> usize {
        self.storage.count(UPLOAD_PREFIX).await.unwrap()
    }

    fn output_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[tokio::test]
async fn three_second_clip_is_dubbed_and_storage_left_empty() {
    let stt = MockSpeechToText::new().with_response("hola a todos");
    let translator = MockTranslator::new().with_response("hello everyone");
    let tts = MockTextToSpeech::new();
    let pipeline = Pipeline::new(
        Arc::new(stt.clone()),
        Arc::new(translator.clone()),
        Arc::new(tts.clone()),
    );
    let source = pipeline.clip("greeting.wav", 3);

    let job = pipeline.run(&source, "en").await;

    assert_eq!(job.status, Status::Succeeded, "error: {:?}", job.error);
    assert_eq!(job.stage, Stage::Delivering);
    assert!(job.error.is_none());
    assert!(!job.degraded);
    assert_eq!(job.total_retries(), 0);
    let duration = job.source_duration_secs.unwrap();
    assert!((duration - 3.0).abs() < 0.01, "duration {}", duration);

    let outputs = pipeline.output_files();
    assert_eq!(outputs.len(), 1, "exactly one artifact: {:?}", outputs);
    assert_eq!(job.output_path.as_ref(), Some(&outputs[0]));
    let name = outputs[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("greeting_en_"), "{}", name);
    assert!(name.ends_with(".wav"), "{}", name);

    assert_eq!(pipeline.residual_objects().await, 0);
    assert_eq!(job.resources.len(), 1);
    assert!(job.resources.iter().all(|r| r.released));
    assert_eq!((stt.calls(), translator.calls(), tts.calls()), (1, 1, 1));
}

#[tokio::test]
async fn transcription_timing_out_twice_then_succeeding_records_two_retries() {
    let stt = MockSpeechToText::new()
        .with_failure(ErrorKind::Timeout)
        .with_failure(ErrorKind::Timeout)
        .with_response("buenos días");
    let pipeline = Pipeline::new(
        Arc::new(stt.clone()),
        Arc::new(MockTranslator::new()),
        Arc::new(MockTextToSpeech::new()),
    );
    let source = pipeline.clip("morning.wav", 1);

    let job = pipeline.run(&source, "en").await;

    assert_eq!(job.status, Status::Succeeded, "error: {:?}", job.error);
    assert_eq!(job.stage_record(Stage::Transcribing).unwrap().retries, 2);
    assert_eq!(job.total_retries(), 2);
    assert_eq!(stt.calls(), 3);
    assert_eq!(pipeline.residual_objects().await, 0);
}

#[tokio::test]
async fn stalled_upload_times_out_and_is_retried() {
    let bucket = Arc::new(StallingStore::new(1));
    let storage = ResourceManager::new(bucket.clone(), BUCKET_URL)
        .with_operation_timeout(Duration::from_millis(50));
    let stt = MockSpeechToText::new();
    let pipeline = Pipeline::with_parts(
        Arc::new(stt.clone()),
        Arc::new(MockTranslator::new()),
        Arc::new(MockTextToSpeech::new()),
        Arc::new(MemoryJobStore::new()),
        storage,
    );
    let source = pipeline.clip("slow.wav", 1);

    let job = pipeline.run(&source, "en").await;

    assert_eq!(job.status, Status::Succeeded, "error: {:?}", job.error);
    assert_eq!(job.stage_record(Stage::Uploading).unwrap().retries, 1);
    assert_eq!(bucket.puts.load(Ordering::SeqCst), 2);
    assert_eq!(stt.calls(), 1);
    assert_eq!(pipeline.residual_objects().await, 0);
}

#[tokio::test]
async fn auth_error_in_translation_fails_without_retry_and_deletes_upload() {
    let translator = MockTranslator::new().with_failure(ErrorKind::Auth);
    let tts = MockTextToSpeech::new();
    let pipeline = Pipeline::new(
        Arc::new(MockSpeechToText::new()),
        Arc::new(translator.clone()),
        Arc::new(tts.clone()),
    );
    let source = pipeline.clip("speech.wav", 1);

    let job = pipeline.run(&source, "fr").await;

    assert_eq!(job.status, Status::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Auth);
    assert_eq!(error.stage, Stage::Translating);
    let record = job.stage_record(Stage::Translating).unwrap();
    assert_eq!(record.retries, 0);
    assert_eq!(record.outcome, Some(StageOutcome::Failed));
    assert_eq!(translator.calls(), 1);
    assert_eq!(tts.calls(), 0);

    assert_eq!(pipeline.residual_objects().await, 0);
    assert_eq!(job.unreleased_resources().count(), 0);
    assert!(pipeline.output_files().is_empty());
}

#[tokio::test]
async fn transient_errors_exhausting_retries_fail_with_last_error() {
    let tts = MockTextToSpeech::new()
        .with_failure(ErrorKind::Network)
        .with_failure(ErrorKind::Quota)
        .with_failure(ErrorKind::Network);
    let pipeline = Pipeline::new(
        Arc::new(MockSpeechToText::new()),
        Arc::new(MockTranslator::new()),
        Arc::new(tts.clone()),
    );
    let source = pipeline.clip("speech.wav", 1);

    let job = pipeline.run(&source, "de").await;

    assert_eq!(job.status, Status::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Network);
    assert_eq!(error.stage, Stage::Synthesizing);
    assert_eq!(job.stage_record(Stage::Synthesizing).unwrap().retries, 2);
    assert_eq!(tts.calls(), 3);
    assert_eq!(pipeline.residual_objects().await, 0);
    assert!(pipeline.output_files().is_empty());
}

#[tokio::test]
async fn cancellation_during_synthesis_closes_session_and_deletes_upload() {
    let (connector, mut accept) = ChannelConnector::new();
    let pool = ConnectionPool::new(
        "wss://speech.test/api/v1/tts/ws_binary",
        Arc::new(connector),
        None,
        2,
        Duration::from_secs(1),
    );
    let tts = VolcengineTts::new(
        StreamingClient::new(pool, Duration::from_secs(30)),
        StreamSettings {
            app_id: "app".to_string(),
            cluster: "volcano_tts".to_string(),
            chunk_bytes: 3200,
            chunk_interval: Duration::ZERO,
            compression: Compression::None,
        },
    );
    let pipeline = Pipeline::new(
        Arc::new(MockSpeechToText::new().with_response("hola")),
        Arc::new(MockTranslator::new().with_response("hello")),
        Arc::new(tts),
    );
    let source = pipeline.clip("speech.wav", 1);

    let (opened_tx, opened_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        let mut end = accept.recv().await.unwrap();
        let request = Frame::from_bytes(&end.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(request.serialization, Serialization::Json);
        let params: serde_json::Value = request.json().unwrap();
        assert_eq!(params["request"]["text"], "hello");
        opened_tx.send(()).unwrap();
        // Never answer; the client must hang up on cancel.
        end.from_client.recv().await.is_none()
    });

    let id = pipeline
        .orchestrator
        .submit(JobRequest::new(&source, "en"))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), opened_rx)
        .await
        .expect("synthesis session should open")
        .unwrap();
    assert!(pipeline.orchestrator.cancel(id));

    let job = tokio::time::timeout(Duration::from_secs(5), pipeline.orchestrator.wait(id))
        .await
        .expect("cancelled job should finish")
        .unwrap();

    assert_eq!(job.status, Status::Cancelled);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert_eq!(error.stage, Stage::Synthesizing);
    assert!(
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap(),
        "protocol session should be closed"
    );
    assert_eq!(pipeline.residual_objects().await, 0);
    assert!(pipeline.output_files().is_empty());
}

#[tokio::test]
async fn cancellation_while_waiting_for_a_speech_connection() {
    let (connector, _accept) = ChannelConnector::new();
    let pool = ConnectionPool::new(
        "wss://speech.test/api/v1/tts/ws_binary",
        Arc::new(connector),
        None,
        1,
        Duration::from_secs(60),
    );
    let client = StreamingClient::new(pool, Duration::from_secs(60));
    // Another session holds the only connection.
    let busy = client.pool().acquire().await.unwrap();
    let tts = VolcengineTts::new(
        client,
        StreamSettings {
            app_id: "app".to_string(),
            cluster: "volcano_tts".to_string(),
            chunk_bytes: 3200,
            chunk_interval: Duration::ZERO,
            compression: Compression::None,
        },
    );
    let pipeline = Pipeline::new(
        Arc::new(MockSpeechToText::new().with_response("hola")),
        Arc::new(MockTranslator::new().with_response("hello")),
        Arc::new(tts),
    );
    let source = pipeline.clip("speech.wav", 1);
    let id = pipeline
        .orchestrator
        .submit(JobRequest::new(&source, "en"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.store.get(id).await.unwrap().stage != Stage::Synthesizing {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job should reach synthesis");
    assert!(pipeline.orchestrator.cancel(id));

    let job = tokio::time::timeout(Duration::from_secs(5), pipeline.orchestrator.wait(id))
        .await
        .expect("cancellation should not wait for a free connection")
        .unwrap();
    assert_eq!(job.status, Status::Cancelled);
    assert_eq!(job.error.as_ref().unwrap().stage, Stage::Synthesizing);
    assert_eq!(pipeline.residual_objects().await, 0);
    drop(busy);
}

#[tokio::test]
async fn terminal_status_is_recorded_once() {
    let pipeline = Pipeline::new(
        Arc::new(MockSpeechToText::new()),
        Arc::new(MockTranslator::new()),
        Arc::new(MockTextToSpeech::new()),
    );
    let source = pipeline.clip("speech.wav", 1);
    let job = pipeline.run(&source, "ja").await;
    assert_eq!(job.status, Status::Succeeded);

    // Late cancellation is a no-op and the store refuses further changes.
    assert!(!pipeline.orchestrator.cancel(job.id));
    let err = pipeline
        .store
        .update(
            job.id,
            Box::new(|job: &mut Job| {
                job.degraded = true;
                Ok(())
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(pipeline.store.get(job.id).await.unwrap().status, Status::Succeeded);
}

#[tokio::test]
async fn jobs_survive_in_file_store_and_interrupted_ones_are_recovered() {
    let state = tempfile::tempdir().unwrap();
    let store_path = state.path().join("jobs.json");
    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&store_path).await.unwrap());
    let pipeline = Pipeline::with_store(
        Arc::new(MockSpeechToText::new()),
        Arc::new(MockTranslator::new()),
        Arc::new(MockTextToSpeech::new()),
        store.clone(),
    );

    let finished = pipeline.run(&pipeline.clip("done.wav", 1), "ko").await;
    assert_eq!(finished.status, Status::Succeeded);

    // Simulate a crash mid-transcription: the upload was recorded, never released.
    let source = pipeline.clip("crashed.wav", 1);
    let mut crashed = Job::new(&source, "zh");
    crashed.enter_stage(Stage::Uploading).unwrap();
    crashed.enter_stage(Stage::Transcribing).unwrap();
    let handle = pipeline
        .storage
        .upload(&source, UPLOAD_PREFIX, crashed.id)
        .await
        .unwrap();
    crashed.record_resource(handle.key(), handle.url());
    store.create(&crashed).await.unwrap();
    assert_eq!(pipeline.residual_objects().await, 1);

    let reopened = FileJobStore::open_read_only(&store_path).await.unwrap();
    assert_eq!(reopened.list().await.unwrap().len(), 2);

    // Another process can neither take the store nor treat its live jobs as abandoned.
    assert!(matches!(
        FileJobStore::open(&store_path).await,
        Err(DubError::StoreLocked { .. })
    ));
    let observer = Pipeline::with_store(
        Arc::new(MockSpeechToText::new()),
        Arc::new(MockTranslator::new()),
        Arc::new(MockTextToSpeech::new()),
        Arc::new(reopened),
    );
    assert!(observer.orchestrator.recover().await.is_err());
    assert_eq!(pipeline.residual_objects().await, 1);

    let report = pipeline.orchestrator.recover().await.unwrap();
    assert_eq!(report.jobs, 1);
    assert_eq!(report.released, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(pipeline.residual_objects().await, 0);

    let reopened = FileJobStore::open_read_only(&store_path).await.unwrap();
    let recovered = reopened.get(crashed.id).await.unwrap();
    assert_eq!(recovered.status, Status::Failed);
    assert_eq!(recovered.error.as_ref().unwrap().stage, Stage::Transcribing);
    assert_eq!(recovered.unreleased_resources().count(), 0);
    assert_eq!(
        reopened.get(finished.id).await.unwrap().status,
        Status::Succeeded
    );

    // Nothing left to do on a second pass.
    assert_eq!(pipeline.orchestrator.recover().await.unwrap().jobs, 0);
}
