//! Sync job: model, checkpoint persistence and the controller driving it

pub mod controller;
pub mod model;
pub mod store;

pub use controller::{JobController, JobSettings};
pub use model::{BatchTally, JobOptions, JobStatus, SyncJob, SyncMode, MAX_JOB_ITEMS};
