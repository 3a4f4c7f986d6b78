//! The job state machine.
//!
//! Each submitted job runs on its own task, gated by a semaphore of
//! `max_concurrent_jobs`. Within a job the stages run strictly in order:
//! upload, transcribe, translate, synthesize, deliver. Whatever a job
//! created is released before its terminal state is recorded.

pub mod resources;
pub mod retry;

pub use resources::{JobResources, ReleaseReport};
pub use retry::{Retried, RetryExecutor, RetryFailure, RetryPolicy};

use crate::config::OrchestratorConfig;
use crate::defaults;
use crate::error::{DubError, ErrorKind, Result};
use crate::job::{Job, JobId, JobStore, Stage};
use crate::media::{MediaKind, MediaToolkit, media_kind, probe_wav_duration};
use crate::providers::{AudioInput, ProviderRegistry, SpeechRequest, SynthesizedAudio};
use crate::storage::{ResourceHandle, ResourceManager};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Runtime knobs, usually built from [`OrchestratorConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_jobs: usize,
    pub retry: RetryPolicy,
    pub output_dir: PathBuf,
    /// Used for jobs submitted without their own deadline.
    pub default_deadline: Option<Duration>,
    pub degraded_transcription: bool,
    pub max_file_size: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for OrchestratorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            retry: RetryPolicy::from(&config.retry),
            output_dir: config.output_dir.clone(),
            default_deadline: config.job_deadline_secs.map(Duration::from_secs),
            degraded_transcription: config.degraded_transcription,
            max_file_size: defaults::MAX_FILE_SIZE,
        }
    }
}

/// A request to dub one file.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub source: PathBuf,
    pub target_language: String,
    pub deadline: Option<Duration>,
}

impl JobRequest {
    pub fn new(source: impl Into<PathBuf>, target_language: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target_language: target_language.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Outcome of [`Orchestrator::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Interrupted jobs marked failed.
    pub jobs: usize,
    pub released: usize,
    pub failed: usize,
}

struct RunningJob {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    storage: Arc<ResourceManager>,
    providers: Arc<ProviderRegistry>,
    media: Arc<dyn MediaToolkit>,
    settings: OrchestratorSettings,
    retry: RetryExecutor,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<JobId, RunningJob>>,
}

/// Drives jobs through their stages.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.inner.settings)
            .field("running", &self.running_jobs().len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        storage: Arc<ResourceManager>,
        providers: Arc<ProviderRegistry>,
        media: Arc<dyn MediaToolkit>,
        settings: OrchestratorSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        let retry = RetryExecutor::new(settings.retry.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                storage,
                providers,
                media,
                settings,
                retry,
                permits,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn storage(&self) -> &Arc<ResourceManager> {
        &self.inner.storage
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Record a new job and start it in the background.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let mut job = Job::new(request.source, request.target_language);
        if let Some(deadline) = request.deadline.or(self.inner.settings.default_deadline) {
            let deadline = chrono::Duration::from_std(deadline)
                .map_err(|e| DubError::validation(format!("deadline out of range: {}", e)))?;
            let at = job.created_at + deadline;
            job = job.with_deadline(at);
        }
        self.inner.store.create(&job).await?;
        let id = job.id;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.running().insert(
            id,
            RunningJob {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let deadline = request.deadline.or(self.inner.settings.default_deadline);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_job(id, cancel, deadline).await;
            done_tx.send_replace(true);
            inner.running_lock().remove(&id);
        });

        tracing::info!(
            job_id = %id,
            source = %job.source.display(),
            target = %job.target_language,
            "job submitted"
        );
        Ok(id)
    }

    /// Ask a running job to stop. Returns `false` if it is not running.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.running().get(&id) {
            Some(job) => {
                tracing::info!(job_id = %id, "cancellation requested");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running job.
    pub fn cancel_all(&self) {
        for job in self.running().values() {
            job.cancel.cancel();
        }
    }

    /// Wait for a job to reach a terminal state and return it.
    pub async fn wait(&self, id: JobId) -> Result<Job> {
        let done = self.running().get(&id).map(|job| job.done.clone());
        if let Some(mut done) = done
            && done.wait_for(|finished| *finished).await.is_err()
        {
            tracing::debug!(job_id = %id, "job task ended without signalling");
        }
        self.inner.store.get(id).await
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.running().keys().copied().collect()
    }

    /// Finish cleanup for jobs a previous process left unfinished: delete
    /// their recorded objects and mark them failed.
    ///
    /// Requires a store this process owns exclusively; otherwise another
    /// live process's jobs would look abandoned.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        if !self.inner.store.is_exclusive() {
            return Err(DubError::validation(
                "recovery needs exclusive access to the job store",
            ));
        }
        let running = self.running_jobs();
        let mut report = RecoveryReport::default();

        for job in self.inner.store.list().await? {
            if job.is_terminal() || running.contains(&job.id) {
                continue;
            }
            let span = tracing::info_span!("recover", job_id = %job.id);
            async {
                for record in job.unreleased_resources() {
                    let mut handle =
                        ResourceHandle::recovered(record.key.clone(), record.url.clone(), job.id);
                    match self.inner.storage.delete_by_handle(&mut handle).await {
                        Ok(_) => {
                            report.released += 1;
                            let key = record.key.clone();
                            let marked = self
                                .inner
                                .store
                                .update(
                                    job.id,
                                    Box::new(move |job: &mut Job| {
                                        job.mark_resource_released(&key);
                                        Ok(())
                                    }),
                                )
                                .await;
                            if let Err(e) = marked {
                                tracing::debug!(
                                    key = %record.key,
                                    error = %e,
                                    "could not record release"
                                );
                            }
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::warn!(
                                key = %record.key,
                                error = %e,
                                "orphaned resource not deleted"
                            );
                        }
                    }
                }

                let interrupted = DubError::Other("interrupted before completion".to_string());
                let marked = self
                    .inner
                    .store
                    .update(
                        job.id,
                        Box::new(move |job: &mut Job| {
                            job.fail(&interrupted);
                            Ok(())
                        }),
                    )
                    .await;
                match marked {
                    Ok(_) => {
                        report.jobs += 1;
                        tracing::info!(stage = %job.stage, "interrupted job marked failed");
                    }
                    Err(e) => tracing::warn!(error = %e, "could not mark interrupted job"),
                }
            }
            .instrument(span)
            .await;
        }
        Ok(report)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<JobId, RunningJob>> {
        self.inner.running_lock()
    }
}

/// Scratch state threaded through the stages of one job.
struct JobContext {
    id: JobId,
    source: PathBuf,
    target_language: String,
    cancel: CancellationToken,
}

impl Inner {
    fn running_lock(&self) -> MutexGuard<'_, HashMap<JobId, RunningJob>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_job(
        self: &Arc<Self>,
        id: JobId,
        cancel: CancellationToken,
        deadline: Option<Duration>,
    ) {
        let span = tracing::info_span!("job", job_id = %id);
        async {
            let deadline_hit = Arc::new(AtomicBool::new(false));
            if let Some(deadline) = deadline {
                let token = cancel.clone();
                let hit = Arc::clone(&deadline_hit);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(deadline) => {
                            hit.store(true, Ordering::SeqCst);
                            tracing::warn!(job_id = %id, "deadline exceeded, cancelling");
                            token.cancel();
                        }
                    }
                });
            }

            let mut resources =
                JobResources::new(id, Arc::clone(&self.storage), Arc::clone(&self.store));
            let outcome = self.run_pipeline(id, &cancel, &mut resources).await;

            let report = resources.release().await;
            if report.failed > 0 {
                tracing::warn!(failed = report.failed, "some resources could not be released");
            }

            let outcome = match outcome {
                Err(e) if deadline_hit.load(Ordering::SeqCst) => {
                    tracing::debug!(error = %e, "stage stopped by deadline");
                    Err(DubError::cancelled("deadline exceeded"))
                }
                Err(e) if cancel.is_cancelled() && !e.is_cancelled() => {
                    tracing::debug!(error = %e, "stage stopped by cancellation");
                    Err(DubError::cancelled("cancelled by request"))
                }
                other => other,
            };
            self.finalize(id, outcome).await;
            // Stops the deadline timer.
            cancel.cancel();
        }
        .instrument(span)
        .await
    }

    async fn run_pipeline(
        &self,
        id: JobId,
        cancel: &CancellationToken,
        resources: &mut JobResources,
    ) -> Result<PathBuf> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DubError::cancelled("cancelled while queued")),
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map_err(|_| DubError::Other("orchestrator shut down".to_string()))?,
        };

        let job = self.store.get(id).await?;
        let ctx = JobContext {
            id,
            source: job.source,
            target_language: job.target_language,
            cancel: cancel.clone(),
        };

        let (audio_path, audio_url) = self.upload_stage(&ctx, resources).await?;
        let transcript = self.transcribe_stage(&ctx, &audio_path, &audio_url).await?;
        let translated = self.translate_stage(&ctx, &transcript).await?;
        let synthesized = self.synthesize_stage(&ctx, &translated).await?;
        self.deliver_stage(&ctx, synthesized).await
    }

    /// Record entry into `stage` after checking for cancellation.
    async fn enter(&self, ctx: &JobContext, stage: Stage) -> Result<()> {
        if ctx.cancel.is_cancelled() {
            return Err(DubError::cancelled(format!("cancelled before {}", stage)));
        }
        self.store
            .update(ctx.id, Box::new(move |job: &mut Job| job.enter_stage(stage)))
            .await?;
        tracing::info!(%stage, "stage started");
        Ok(())
    }

    /// Run `operation` under the retry policy and record the retry count.
    async fn retried<T, F, Fut>(&self, ctx: &JobContext, stage: Stage, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = self
            .retry
            .execute(stage.as_str(), &ctx.cancel, operation)
            .instrument(tracing::debug_span!("stage", %stage))
            .await;
        let (retries, result) = match result {
            Ok(retried) => (retried.retries, Ok(retried.value)),
            Err(failure) => (failure.retries, Err(failure.error)),
        };
        if retries > 0 {
            self.store
                .update(
                    ctx.id,
                    Box::new(move |job: &mut Job| {
                        job.set_retries(retries);
                        Ok(())
                    }),
                )
                .await?;
        }
        result
    }

    async fn upload_stage(
        &self,
        ctx: &JobContext,
        resources: &mut JobResources,
    ) -> Result<(PathBuf, String)> {
        self.enter(ctx, Stage::Uploading).await?;
        let kind = self.validate_source(ctx).await?;

        if let Some(duration) = probe_wav_duration(&ctx.source) {
            self.store
                .update(
                    ctx.id,
                    Box::new(move |job: &mut Job| {
                        job.source_duration_secs = Some(duration);
                        Ok(())
                    }),
                )
                .await?;
        }

        let audio_path = match kind {
            MediaKind::Audio => ctx.source.clone(),
            MediaKind::Video => {
                let work_dir = self.settings.output_dir.join(".work").join(ctx.id.to_string());
                resources.add_scratch(&work_dir);
                self.media.extract_audio(&ctx.source, &work_dir).await?
            }
        };

        let prefix = self.storage.prefix().to_string();
        let handle = self
            .retried(ctx, Stage::Uploading, |_| {
                let storage = Arc::clone(&self.storage);
                let path = audio_path.clone();
                let prefix = prefix.clone();
                let owner = ctx.id;
                async move { storage.upload(&path, &prefix, owner).await }
            })
            .await?;
        let url = resources.track(handle).await?.url().to_string();

        if ctx.cancel.is_cancelled() {
            return Err(DubError::cancelled("cancelled during upload"));
        }
        Ok((audio_path, url))
    }

    async fn validate_source(&self, ctx: &JobContext) -> Result<MediaKind> {
        if !defaults::SUPPORTED_LANGUAGES.contains(&ctx.target_language.as_str()) {
            return Err(DubError::validation(format!(
                "unsupported target language '{}' (supported: {})",
                ctx.target_language,
                defaults::SUPPORTED_LANGUAGES.join(", ")
            )));
        }
        let meta = match tokio::fs::metadata(&ctx.source).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DubError::validation(format!(
                    "{} does not exist",
                    ctx.source.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err(DubError::validation(format!(
                "{} is not a file",
                ctx.source.display()
            )));
        }
        if meta.len() == 0 {
            return Err(DubError::validation(format!("{} is empty", ctx.source.display())));
        }
        if meta.len() > self.settings.max_file_size {
            return Err(DubError::validation(format!(
                "{} is {} bytes, above the {} byte limit",
                ctx.source.display(),
                meta.len(),
                self.settings.max_file_size
            )));
        }
        media_kind(&ctx.source).ok_or_else(|| {
            DubError::validation(format!(
                "unsupported format {} (audio: {}; video: {})",
                ctx.source.display(),
                defaults::SUPPORTED_AUDIO_FORMATS.join(", "),
                defaults::SUPPORTED_VIDEO_FORMATS.join(", ")
            ))
        })
    }

    async fn transcribe_stage(&self, ctx: &JobContext, audio: &Path, url: &str) -> Result<String> {
        self.enter(ctx, Stage::Transcribing).await?;
        let stt = self.providers.speech_to_text()?;
        let input = AudioInput::from_path(audio).with_url(url);

        let result = self
            .retried(ctx, Stage::Transcribing, |_| {
                let stt = Arc::clone(&stt);
                let input = input.clone();
                let cancel = ctx.cancel.clone();
                async move { stt.transcribe(&input, &cancel).await }
            })
            .await;

        let transcript = match result {
            Ok(text) => text,
            Err(e) if self.settings.degraded_transcription && e.is_retryable() => {
                tracing::warn!(
                    error = %e,
                    placeholder = defaults::PLACEHOLDER_TRANSCRIPT,
                    "transcription unavailable, continuing in degraded mode"
                );
                self.store
                    .update(
                        ctx.id,
                        Box::new(|job: &mut Job| {
                            job.degraded = true;
                            Ok(())
                        }),
                    )
                    .await?;
                defaults::PLACEHOLDER_TRANSCRIPT.to_string()
            }
            Err(e) => return Err(e),
        };

        if transcript.trim().is_empty() {
            return Err(DubError::validation("no speech recognized in source"));
        }
        tracing::debug!(chars = transcript.chars().count(), "transcribed");
        Ok(transcript)
    }

    async fn translate_stage(&self, ctx: &JobContext, text: &str) -> Result<String> {
        self.enter(ctx, Stage::Translating).await?;
        let translator = self.providers.translator()?;
        let translated = self
            .retried(ctx, Stage::Translating, |_| {
                let translator = Arc::clone(&translator);
                let text = text.to_string();
                let target = ctx.target_language.clone();
                let cancel = ctx.cancel.clone();
                async move { translator.translate(&text, &target, &cancel).await }
            })
            .await?;
        if translated.trim().is_empty() {
            return Err(DubError::validation("translation came back empty"));
        }
        Ok(translated)
    }

    async fn synthesize_stage(
        &self,
        ctx: &JobContext,
        text: &str,
    ) -> Result<SynthesizedAudio> {
        self.enter(ctx, Stage::Synthesizing).await?;
        let tts = self.providers.text_to_speech()?;
        let request = SpeechRequest::new(text, ctx.target_language.clone());
        let audio = self
            .retried(ctx, Stage::Synthesizing, |_| {
                let tts = Arc::clone(&tts);
                let request = request.clone();
                let cancel = ctx.cancel.clone();
                async move { tts.synthesize(&request, &cancel).await }
            })
            .await?;
        if audio.bytes.is_empty() {
            return Err(DubError::validation("synthesis produced no audio"));
        }
        Ok(audio)
    }

    async fn deliver_stage(
        &self,
        ctx: &JobContext,
        audio: SynthesizedAudio,
    ) -> Result<PathBuf> {
        self.enter(ctx, Stage::Delivering).await?;
        let output_dir = &self.settings.output_dir;
        tokio::fs::create_dir_all(output_dir).await?;

        let stem = ctx
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let short_id: String = ctx.id.to_string().chars().take(8).collect();
        let extension = match media_kind(&ctx.source) {
            Some(MediaKind::Video) => ctx
                .source
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_else(|| "mp4".to_string()),
            _ => audio.format.clone(),
        };
        let output = output_dir.join(format!(
            "{}_{}_{}.{}",
            stem, ctx.target_language, short_id, extension
        ));
        let dubbed = output_dir.join(format!(".{}.dubbed.{}", ctx.id, audio.format));

        let result = self.write_and_deliver(ctx, &audio, &dubbed, &output).await;

        if let Err(e) = tokio::fs::remove_file(&dubbed).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                path = %dubbed.display(),
                error = %e,
                "failed to remove intermediate audio"
            );
        }
        match result {
            Ok(path) => {
                tracing::info!(
                    output = %path.display(),
                    bytes = audio.bytes.len(),
                    "output delivered"
                );
                Ok(path)
            }
            Err(e) => {
                remove_partial(&output).await;
                Err(e)
            }
        }
    }

    async fn write_and_deliver(
        &self,
        ctx: &JobContext,
        audio: &SynthesizedAudio,
        dubbed: &Path,
        output: &Path,
    ) -> Result<PathBuf> {
        tokio::fs::write(dubbed, &audio.bytes).await?;
        if ctx.cancel.is_cancelled() {
            return Err(DubError::cancelled("cancelled during delivery"));
        }
        self.media.deliver(&ctx.source, dubbed, output).await
    }

    async fn finalize(&self, id: JobId, outcome: Result<PathBuf>) {
        match outcome {
            Ok(output) => {
                let path = output.clone();
                let recorded = self
                    .store
                    .update(id, Box::new(move |job: &mut Job| job.succeed(Some(path))))
                    .await;
                match recorded {
                    Ok(job) => tracing::info!(
                        output = %output.display(),
                        retries = job.total_retries(),
                        degraded = job.degraded,
                        "job succeeded"
                    ),
                    Err(e) => {
                        tracing::error!(error = %e, "could not record success, discarding output");
                        remove_partial(&output).await;
                        self.record_failure(id, e).await;
                    }
                }
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!(reason = %e, "job cancelled");
                let result = self
                    .store
                    .update(
                        id,
                        Box::new(move |job: &mut Job| {
                            job.cancel(&e);
                            Ok(())
                        }),
                    )
                    .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "could not record cancellation");
                }
            }
            Err(e) => self.record_failure(id, e).await,
        }
    }

    async fn record_failure(&self, id: JobId, error: DubError) {
        if matches!(error.kind(), ErrorKind::Validation | ErrorKind::Config) {
            tracing::warn!(error = %error, "job failed");
        } else {
            tracing::error!(error = %error, kind = %error.kind(), "job failed");
        }
        let result = self
            .store
            .update(
                id,
                Box::new(move |job: &mut Job| {
                    job.fail(&error);
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "could not record failure");
        }
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output")
        }
    }
}
