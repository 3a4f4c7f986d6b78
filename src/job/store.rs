//! Durable job records.

use crate::error::{DubError, Result};
use crate::job::model::{Job, JobId};
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// A change applied to a stored job. Returning an error leaves the job untouched.
pub type JobMutation = Box<dyn FnOnce(&mut Job) -> Result<()> + Send>;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Job>;

    /// All jobs, oldest first.
    async fn list(&self) -> Result<Vec<Job>>;

    /// Apply `mutation` and return the updated job. Terminal jobs are read-only.
    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<Job>;

    /// Remove a finished job.
    async fn delete(&self, id: JobId) -> Result<()>;

    /// True when no other process can be running jobs from this store, so
    /// unfinished jobs in it were abandoned by a previous run.
    fn is_exclusive(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
}

impl JobTable {
    fn create(&mut self, job: &Job) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(DubError::validation(format!("job {} already exists", job.id)));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Job> {
        self.jobs.get(&id).cloned().ok_or_else(|| not_found(id))
    }

    fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    fn update(&mut self, id: JobId, mutation: JobMutation) -> Result<Job> {
        let current = self.jobs.get(&id).ok_or_else(|| not_found(id))?;
        if current.is_terminal() {
            return Err(DubError::validation(format!(
                "job {} is {} and can no longer change",
                id, current.status
            )));
        }
        let mut updated = current.clone();
        mutation(&mut updated)?;
        updated.id = id;
        updated.updated_at = Utc::now();
        self.jobs.insert(id, updated.clone());
        Ok(updated)
    }

    fn delete(&mut self, id: JobId) -> Result<()> {
        let job = self.jobs.get(&id).ok_or_else(|| not_found(id))?;
        if !job.is_terminal() {
            return Err(DubError::validation(format!(
                "job {} is still {}; cancel it first",
                id, job.status
            )));
        }
        self.jobs.remove(&id);
        Ok(())
    }
}

fn not_found(id: JobId) -> DubError {
    DubError::NotFound {
        what: format!("job {}", id),
    }
}

/// Jobs held in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: RwLock<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        self.table.write().await.create(job)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.table.read().await.get(id)
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.table.read().await.list())
    }

    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<Job> {
        self.table.write().await.update(id, mutation)
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.table.write().await.delete(id)
    }
}

/// Jobs persisted as one JSON document, rewritten atomically on every change.
///
/// A writable store holds an exclusive lock on `<path>.lock` for its whole
/// life, so only one process runs jobs from a given file. The OS drops the
/// lock if that process dies.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    table: Mutex<JobTable>,
    lock: Option<std::fs::File>,
}

impl FileJobStore {
    /// Lock and load `path`, starting empty if it does not exist yet.
    ///
    /// Fails with [`DubError::StoreLocked`] while another process holds it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock_path = lock_path(&path);
        let lock = tokio::task::spawn_blocking(move || lock_store(&lock_path))
            .await
            .map_err(|e| DubError::Other(format!("job store lock task failed: {}", e)))??;
        let table = load_table(&path).await?;
        tracing::debug!(path = %path.display(), jobs = table.jobs.len(), "job store opened");
        Ok(Self {
            path,
            table: Mutex::new(table),
            lock: Some(lock),
        })
    }

    /// Load a snapshot of `path` without taking the lock. Every write fails.
    pub async fn open_read_only(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = load_table(&path).await?;
        Ok(Self {
            path,
            table: Mutex::new(table),
            lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writable(&self) -> Result<()> {
        match self.lock {
            Some(_) => Ok(()),
            None => Err(DubError::validation(format!(
                "job store {} is open read-only",
                self.path.display()
            ))),
        }
    }

    async fn persist(&self, table: &JobTable) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&table.list())?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        self.writable()?;
        let mut table = self.table.lock().await;
        table.create(job)?;
        if let Err(e) = self.persist(&table).await {
            table.jobs.remove(&job.id);
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.table.lock().await.get(id)
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.table.lock().await.list())
    }

    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<Job> {
        self.writable()?;
        let mut table = self.table.lock().await;
        let previous = table.get(id)?;
        let updated = table.update(id, mutation)?;
        if let Err(e) = self.persist(&table).await {
            table.jobs.insert(id, previous);
            return Err(e);
        }
        Ok(updated)
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.writable()?;
        let mut table = self.table.lock().await;
        let previous = table.get(id)?;
        table.delete(id)?;
        if let Err(e) = self.persist(&table).await {
            table.jobs.insert(id, previous);
            return Err(e);
        }
        Ok(())
    }

    fn is_exclusive(&self) -> bool {
        self.lock.is_some()
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Take the store lock and stamp it with our pid.
fn lock_store(lock_path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = lock_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)?;

    if let Err(e) = file.try_lock_exclusive() {
        if e.raw_os_error() != fs2::lock_contended_error().raw_os_error() {
            return Err(e.into());
        }
        let mut holder = String::new();
        file.read_to_string(&mut holder)?;
        let holder = match holder.trim() {
            "" => "unknown process".to_string(),
            pid => format!("pid {}", pid),
        };
        return Err(DubError::StoreLocked {
            path: lock_path.display().to_string(),
            holder,
        });
    }

    file.set_len(0)?;
    write!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(file)
}

async fn load_table(path: &Path) -> Result<JobTable> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(JobTable::default()),
        Ok(bytes) => {
            let jobs: Vec<Job> = serde_json::from_slice(&bytes)?;
            Ok(JobTable {
                jobs: jobs.into_iter().map(|job| (job.id, job)).collect(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobTable::default()),
        Err(e) => Err(e.into()),
    }
}
