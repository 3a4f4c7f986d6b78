//! Job records and their persistence.

pub mod model;
pub mod store;

pub use model::{ErrorDetail, Job, JobId, ResourceRecord, Stage, StageOutcome, StageRecord, Status};
pub use store::{FileJobStore, JobMutation, JobStore, MemoryJobStore};
