//! Typed failure kinds for the dedup passes.
//!
//! Pipeline functions return `anyhow::Result`; these kinds are raised into it and
//! can be recovered with `err.downcast_ref::<DedupError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DedupError {
    /// A value (or a whole column type) could not be coerced to its target type.
    #[error("cannot cast field `{field}` from {from} to {to} in {chunk}: {reason}")]
    SchemaCast {
        field: String,
        from: String,
        to: String,
        chunk: String,
        reason: String,
    },

    /// A composite-key field is not declared in the target schema.
    #[error("key field `{field}` is not part of the target schema")]
    MissingKeyField { field: String },

    /// Creating, reading or writing a shard file failed.
    #[error("shard {bucket:04} ({}): {op} failed: {reason}", .path.display())]
    ShardIo {
        bucket: usize,
        path: PathBuf,
        op: &'static str,
        reason: String,
    },

    /// The reassembled output violated a post-condition.
    #[error("consistency check failed: {}", failures.join("; "))]
    ConsistencyCheckFailure { failures: Vec<String> },
}

impl DedupError {
    pub(crate) fn shard_io(bucket: usize, path: impl Into<PathBuf>, op: &'static str, e: impl std::fmt::Display) -> Self {
        DedupError::ShardIo { bucket, path: path.into(), op, reason: e.to_string() }
    }
}
