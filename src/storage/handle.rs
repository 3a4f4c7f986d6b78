use crate::job::JobId;

/// A tracked remote object created by one job.
///
/// Not `Clone`: exactly one handle exists per uploaded object, and whoever
/// holds it is responsible for releasing it.
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceHandle {
    key: String,
    url: String,
    owner: JobId,
    released: bool,
}

impl ResourceHandle {
    pub(crate) fn new(key: String, url: String, owner: JobId) -> Self {
        Self {
            key,
            url,
            owner,
            released: false,
        }
    }

    /// Rebuild a handle for an object recorded before a restart.
    pub fn recovered(key: impl Into<String>, url: impl Into<String>, owner: JobId) -> Self {
        Self::new(key.into(), url.into(), owner)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn owner(&self) -> JobId {
        self.owner
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }
}
