//! `qcretry-core`: domain building blocks for the failed-image retry queue.
//!
//! This crate contains **pure domain** types and rules (no storage, threads or IO):
//! identifiers, the QC status state machine, image records, processing settings,
//! and the per-step failure policy.

pub mod error;
pub mod id;
pub mod image;
pub mod policy;
pub mod qc_status;
pub mod settings;

pub use error::{DomainError, DomainResult};
pub use id::{ExecutionId, ImageId, RetryJobId};
pub use image::{ImageMetadata, ImageRecord};
pub use policy::{FailurePhase, FailurePolicy, FailureVerdict, Step};
pub use qc_status::QcStatus;
pub use settings::{OutputFormat, ProcessingSettings};
