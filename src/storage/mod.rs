//! Ephemeral uploads to object storage.
//!
//! Every upload yields a [`ResourceHandle`]; the owner deletes it when the
//! job ends, and [`ResourceManager::sweep`] removes anything that leaked.

mod handle;

pub use handle::ResourceHandle;

use crate::config::StorageConfig;
use crate::defaults;
use crate::error::{DubError, Result, with_timeout};
use crate::job::JobId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as StorePath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

/// Part size for multipart uploads; smaller files go up in one request.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Outcome of a batch sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Objects under the prefix older than the threshold.
    pub found: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Uploads, deletes and sweeps objects in one bucket.
pub struct ResourceManager {
    store: Arc<dyn ObjectStore>,
    public_base: String,
    prefix: String,
    op_timeout: Duration,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("store", &self.store.to_string())
            .field("public_base", &self.public_base)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ResourceManager {
    /// Wrap an existing store. `public_base` is the URL objects are served
    /// under, without a trailing slash.
    pub fn new(store: Arc<dyn ObjectStore>, public_base: impl Into<String>) -> Self {
        Self {
            store,
            public_base: public_base.into().trim_end_matches('/').to_string(),
            prefix: defaults::AUDIO_PREFIX.to_string(),
            op_timeout: Duration::from_secs(defaults::OPERATION_TIMEOUT_SECS),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_operation_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Connect to an S3-compatible bucket. Fails fast, naming every missing setting.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let settings = config.validate()?;
        let store = AmazonS3Builder::new()
            .with_endpoint(settings.endpoint_url())
            .with_region(&settings.region)
            .with_bucket_name(&settings.bucket)
            .with_access_key_id(settings.access_key.expose_secret())
            .with_secret_access_key(settings.secret_key.expose_secret())
            .with_virtual_hosted_style_request(true)
            .build()
            .map_err(|e| DubError::ConfigInvalidValue {
                key: "storage".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self::new(Arc::new(store), settings.public_base())
            .with_prefix(config.prefix.clone()))
    }

    /// Default key namespace for uploads and sweeps.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }

    /// Upload a local file under `<key_prefix><uuid-hex><ext>`.
    ///
    /// On failure nothing is left behind and no handle exists.
    pub async fn upload(
        &self,
        local_path: &Path,
        key_prefix: &str,
        owner: JobId,
    ) -> Result<ResourceHandle> {
        let ext = local_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        let key = format!("{}{}{}", key_prefix, Uuid::new_v4().simple(), ext);
        let location = StorePath::from(key.as_str());

        let upload_error = |message: String| DubError::Upload {
            path: local_path.display().to_string(),
            message,
        };

        let mut file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| upload_error(e.to_string()))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| upload_error(e.to_string()))?
            .len();

        let result = with_timeout("upload", self.op_timeout, async {
            if size as usize <= PART_SIZE {
                let mut data = Vec::with_capacity(size as usize);
                file.read_to_end(&mut data).await?;
                self.store
                    .put(&location, PutPayload::from(Bytes::from(data)))
                    .await
                    .map_err(store_error)?;
                Ok(())
            } else {
                self.put_multipart(&location, &mut file).await
            }
        })
        .await;

        if let Err(e) = result {
            // A timed-out put may still have landed.
            if let Err(cleanup) = self.store.delete(&location).await {
                tracing::warn!(%key, error = %cleanup, "failed to remove partial upload");
            }
            // Transient causes keep their kind so the caller can retry.
            if e.is_retryable() {
                return Err(e);
            }
            return Err(upload_error(e.to_string()));
        }

        tracing::info!(%key, owner = %owner, bytes = size, "uploaded source media");
        Ok(ResourceHandle::new(key.clone(), self.url_for(&key), owner))
    }

    async fn put_multipart(&self, location: &StorePath, file: &mut tokio::fs::File) -> Result<()> {
        let mut upload = self
            .store
            .put_multipart(location)
            .await
            .map_err(store_error)?;

        loop {
            let mut part = Vec::with_capacity(PART_SIZE);
            let read = (&mut *file)
                .take(PART_SIZE as u64)
                .read_to_end(&mut part)
                .await;
            let read = match read {
                Ok(n) => n,
                Err(e) => {
                    if let Err(abort) = upload.abort().await {
                        tracing::debug!(error = %abort, "multipart abort failed");
                    }
                    return Err(e.into());
                }
            };
            if read == 0 {
                break;
            }
            if let Err(e) = upload.put_part(PutPayload::from(Bytes::from(part))).await {
                if let Err(abort) = upload.abort().await {
                    tracing::debug!(error = %abort, "multipart abort failed");
                }
                return Err(store_error(e));
            }
        }

        upload.complete().await.map_err(store_error)?;
        Ok(())
    }

    /// Delete the object behind `handle` and mark it released.
    ///
    /// Returns `false` if the handle was already released. Deleting an
    /// object that no longer exists succeeds.
    pub async fn delete_by_handle(&self, handle: &mut ResourceHandle) -> Result<bool> {
        if handle.is_released() {
            return Ok(false);
        }
        self.delete_key(handle.key()).await?;
        handle.mark_released();
        tracing::debug!(key = handle.key(), owner = %handle.owner(), "released resource");
        Ok(true)
    }

    /// Delete the object a public URL points at.
    ///
    /// Returns `false` if the URL does not belong to this bucket.
    pub async fn delete_by_url(&self, url: &str) -> Result<bool> {
        let Some(key) = self.key_from_url(url) else {
            tracing::warn!(url, "URL does not belong to this bucket, not deleting");
            return Ok(false);
        };
        self.delete_key(&key).await?;
        Ok(true)
    }

    /// Object key for one of our public URLs.
    pub fn key_from_url(&self, url: &str) -> Option<String> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let base = reqwest::Url::parse(&self.public_base).ok()?;
        if parsed.host_str() != base.host_str() || parsed.scheme() != base.scheme() {
            return None;
        }
        let base_path = base.path().trim_end_matches('/');
        let key = parsed.path().strip_prefix(base_path)?.trim_start_matches('/');
        if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let location = StorePath::from(key);
        let cleanup_error = |message: String| DubError::ResourceCleanup {
            key: key.to_string(),
            message,
        };
        let deleted = with_timeout("delete", self.op_timeout, async {
            match self.store.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(store_error(e)),
            }
        })
        .await;
        deleted.map_err(|e| cleanup_error(e.to_string()))
    }

    /// Delete every object under `prefix` older than `max_age`.
    pub async fn sweep(&self, prefix: &str, max_age: Duration) -> Result<SweepReport> {
        self.sweep_at(prefix, max_age, Utc::now()).await
    }

    /// [`sweep`](Self::sweep) with an explicit notion of "now".
    pub async fn sweep_at(
        &self,
        prefix: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let max_age = chrono::Duration::from_std(max_age).map_err(|e| {
            DubError::validation(format!("sweep age out of range: {}", e))
        })?;
        let mut listing = self.list_under(prefix);

        let mut stale = Vec::new();
        while let Some(entry) = listing.next().await {
            let meta = entry.map_err(|e| DubError::Network {
                message: format!("listing {} failed: {}", prefix, e),
            })?;
            let key = meta.location.to_string();
            if !key.starts_with(prefix) {
                continue;
            }
            if now.signed_duration_since(meta.last_modified) > max_age {
                stale.push(key);
            }
        }

        let mut report = SweepReport {
            found: stale.len(),
            ..SweepReport::default()
        };
        for key in stale {
            match self.delete_key(&key).await {
                Ok(()) => {
                    report.deleted += 1;
                    tracing::debug!(%key, "swept stale object");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(%key, error = %e, "sweep failed to delete object");
                }
            }
        }

        tracing::info!(
            prefix,
            found = report.found,
            deleted = report.deleted,
            failed = report.failed,
            "sweep finished"
        );
        Ok(report)
    }

    /// Number of objects currently stored under `prefix`.
    pub async fn count(&self, prefix: &str) -> Result<usize> {
        let mut listing = self.list_under(prefix);
        let mut count = 0;
        while let Some(entry) = listing.next().await {
            let meta = entry.map_err(|e| DubError::Network {
                message: e.to_string(),
            })?;
            if meta.location.as_ref().starts_with(prefix) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Listing that covers every key starting with `prefix`.
    ///
    /// Store listings match whole path segments, so a prefix that ends
    /// mid-segment ("audio/ab") lists its parent and callers filter by key.
    fn list_under(&self, prefix: &str) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        let parent = prefix.rfind('/').map(|end| StorePath::from(&prefix[..end]));
        self.store.list(parent.as_ref())
    }
}

/// Classify a store failure. Anything unrecognized is treated as transport trouble.
fn store_error(e: object_store::Error) -> DubError {
    use object_store::Error as StoreError;
    match e {
        StoreError::PermissionDenied { .. } | StoreError::Unauthenticated { .. } => DubError::Auth {
            message: e.to_string(),
        },
        StoreError::NotFound { path, .. } => DubError::NotFound { what: path },
        StoreError::InvalidPath { .. }
        | StoreError::NotSupported { .. }
        | StoreError::NotImplemented => DubError::Other(e.to_string()),
        _ => DubError::Network {
            message: e.to_string(),
        },
    }
}
