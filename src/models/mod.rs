//! Data models for the pipeline scheduler.

mod executor;
mod fingerprint;
mod pipeline_file;
mod stage;

pub use executor::{ExecutorId, ExecutorRecord, ExecutorState};
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use pipeline_file::{PipelineFile, PipelineFileError};
pub use stage::{
    FailureCause, Stage, StageAction, StageId, StageStatus, StageTemplate, MAX_RETRIES,
};
