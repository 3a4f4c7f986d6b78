//! Scoped ownership of everything a job creates.

use crate::error::Result;
use crate::job::{Job, JobId, JobStore};
use crate::storage::{ResourceHandle, ResourceManager};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// What a release pass managed to clean up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

/// Holds a job's remote handles and local scratch paths.
///
/// Call [`release`](Self::release) on every exit path. If the guard is
/// dropped unreleased (a panic or an aborted task) it logs and schedules
/// the deletions on the runtime instead.
pub struct JobResources {
    job_id: JobId,
    storage: Arc<ResourceManager>,
    store: Arc<dyn JobStore>,
    handles: Vec<ResourceHandle>,
    scratch: Vec<PathBuf>,
    released: bool,
}

impl std::fmt::Debug for JobResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobResources")
            .field("job_id", &self.job_id)
            .field("handles", &self.handles.len())
            .field("scratch", &self.scratch)
            .field("released", &self.released)
            .finish()
    }
}

impl JobResources {
    pub fn new(job_id: JobId, storage: Arc<ResourceManager>, store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id,
            storage,
            store,
            handles: Vec::new(),
            scratch: Vec::new(),
            released: false,
        }
    }

    /// Take ownership of `handle` and record it on the job so a restart can
    /// still clean it up. The handle is tracked even if recording fails.
    pub async fn track(&mut self, handle: ResourceHandle) -> Result<&ResourceHandle> {
        let key = handle.key().to_string();
        let url = handle.url().to_string();
        self.released = false;
        self.handles.push(handle);
        self.store
            .update(
                self.job_id,
                Box::new(move |job: &mut Job| {
                    job.record_resource(key, url);
                    Ok(())
                }),
            )
            .await?;
        let index = self.handles.len() - 1;
        Ok(&self.handles[index])
    }

    /// A local file or directory removed on release.
    pub fn add_scratch(&mut self, path: impl Into<PathBuf>) {
        self.released = false;
        self.scratch.push(path.into());
    }

    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    pub fn unreleased(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_released()).count()
    }

    /// Delete every remote object and scratch path. Failures are logged and
    /// counted, never returned. Safe to call more than once.
    pub async fn release(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for handle in self.handles.iter_mut().filter(|h| !h.is_released()) {
            match self.storage.delete_by_handle(handle).await {
                Ok(_) => {
                    report.released += 1;
                    let key = handle.key().to_string();
                    let marked = self
                        .store
                        .update(
                            self.job_id,
                            Box::new(move |job: &mut Job| {
                                job.mark_resource_released(&key);
                                Ok(())
                            }),
                        )
                        .await;
                    if let Err(e) = marked {
                        tracing::debug!(key = handle.key(), error = %e, "could not record release");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        job_id = %self.job_id,
                        key = handle.key(),
                        error = %e,
                        "failed to release resource"
                    );
                }
            }
        }

        for path in self.scratch.drain(..) {
            remove_path(&path).await;
        }

        self.released = report.failed == 0;
        if report.released > 0 || report.failed > 0 {
            tracing::debug!(
                job_id = %self.job_id,
                released = report.released,
                failed = report.failed,
                "job resources released"
            );
        }
        report
    }
}

async fn remove_path(path: &std::path::Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch path");
    }
}

impl Drop for JobResources {
    fn drop(&mut self) {
        let handles: Vec<ResourceHandle> = std::mem::take(&mut self.handles)
            .into_iter()
            .filter(|h| !h.is_released())
            .collect();
        let scratch = std::mem::take(&mut self.scratch);
        if handles.is_empty() && scratch.is_empty() {
            return;
        }

        tracing::warn!(
            job_id = %self.job_id,
            handles = handles.len(),
            "job resources dropped without release, scheduling cleanup"
        );
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                job_id = %self.job_id,
                "no runtime to release resources, leaving them for the next sweep"
            );
            return;
        };
        let storage = Arc::clone(&self.storage);
        let job_id = self.job_id;
        runtime.spawn(async move {
            for mut handle in handles {
                if let Err(e) = storage.delete_by_handle(&mut handle).await {
                    tracing::warn!(
                        %job_id,
                        key = handle.key(),
                        error = %e,
                        "deferred release failed"
                    );
                }
            }
            for path in scratch {
                remove_path(&path).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::MemoryJobStore;
    use object_store::memory::InMemory;
    use std::time::Duration;

    async fn setup() -> (Arc<ResourceManager>, Arc<dyn JobStore>, Job, tempfile::TempDir) {
        let storage = Arc::new(ResourceManager::new(
            Arc::new(InMemory::new()),
            "https://bucket.example.com",
        ));
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = Job::new("clip.wav", "en");
        store.create(&job).await.unwrap();
        (storage, store, job, tempfile::tempdir().unwrap())
    }

    #[tokio::test]
    async fn test_release_deletes_objects_and_records_it() {
        let (storage, store, job, dir) = setup().await;
        let file = dir.path().join("clip.wav");
        std::fs::write(&file, b"audio").unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();

        let mut resources = JobResources::new(job.id, storage.clone(), store.clone());
        let handle = storage.upload(&file, "audio/", job.id).await.unwrap();
        resources.track(handle).await.unwrap();
        resources.add_scratch(&scratch);
        assert_eq!(store.get(job.id).await.unwrap().resources.len(), 1);

        let report = resources.release().await;
        assert_eq!(report, ReleaseReport { released: 1, failed: 0 });
        assert_eq!(storage.count("audio/").await.unwrap(), 0);
        assert!(!scratch.exists());
        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.unreleased_resources().count(), 0);

        // A second pass has nothing left to do.
        assert_eq!(resources.release().await, ReleaseReport::default());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_drop_without_release_schedules_cleanup() {
        let (storage, store, job, dir) = setup().await;
        let file = dir.path().join("clip.wav");
        std::fs::write(&file, b"audio").unwrap();

        {
            let mut resources = JobResources::new(job.id, storage.clone(), store.clone());
            let handle = storage.upload(&file, "audio/", job.id).await.unwrap();
            resources.track(handle).await.unwrap();
        }
        assert!(logs_contain("dropped without release"));

        for _ in 0..50 {
            if storage.count("audio/").await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deferred release never ran");
    }
}
