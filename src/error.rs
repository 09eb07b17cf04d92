//! Error types for the core pipeline.
//!
//! Fatal conditions (see spec §7) are returned as `Err` and propagated with
//! `?`; there is no per-function recovery. Warnings are logged through
//! `tracing::warn!` instead of being modeled as errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("parse error on line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("duplicate write to non-general register in bundle at line {line}")]
    NonGeneralDuplicateWrite { line: usize },

    #[error("could not schedule basic block starting at line {first_line}")]
    UnschedulableBlock { first_line: usize },

    #[error(
        "schedule length blew up past node count while scheduling block at line {first_line} \
         ({placed} of {total} placed)"
    )]
    ScheduleBlowup {
        first_line: usize,
        placed: usize,
        total: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
