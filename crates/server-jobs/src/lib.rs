// crates/server-jobs/src/lib.rs
//! Job registry for batch hashing work.
//!
//! Provides:
//! - `JobStore` - table of jobs, their mutators and the retention sweeper,
//!   which also deletes the output directories of the jobs it expires
//! - `Subscription` - per-job push channel of `Job` snapshots
//! - `JobRecord` - the status record handed to pollers and stream clients

pub mod store;
pub mod types;

pub use store::{remove_output_dir, JobStore, JobStoreConfig, Subscription};
pub use types::{FileResult, FileStatus, Job, JobRecord, JobStatus};
