//! Pass 1: one sequential read of the input, fanned out into bucket shards.

use crate::bucketing::{partition_indices, take_rows, BucketHasher};
use crate::config::KeySpec;
use crate::error::DedupError;
use crate::input::SourceChunk;
use crate::progress::ProgressScope;
use crate::schema::{normalize, TargetSchema};
use crate::shard::ShardWriters;
use anyhow::{Context, Result};
use arrow::array::{ArrayRef, UInt64Array};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Counters for a finished routing pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub chunks: u64,
    pub rows_in: u64,
}

/// Routes normalized chunks into shard writers, stamping each row with a
/// run-global ingestion sequence number (0-based, input order).
pub struct Router<'a> {
    target: &'a TargetSchema,
    key: KeySpec,
    partition_idx: usize,
    hasher: BucketHasher,
    next_seq: u64,
    stats: RouteStats,
}

impl<'a> Router<'a> {
    pub fn new(target: &'a TargetSchema, key: &KeySpec, buckets: usize) -> Result<Self> {
        let partition_idx = target
            .index_of(&key.partition_field)
            .ok_or_else(|| DedupError::MissingKeyField { field: key.partition_field.clone() })?;
        let partition_type = target.fields()[partition_idx].ty.data_type();
        Ok(Self {
            target,
            key: key.clone(),
            partition_idx,
            hasher: BucketHasher::new(&partition_type, buckets)?,
            next_seq: 0,
            stats: RouteStats::default(),
        })
    }

    pub fn stats(&self) -> RouteStats {
        self.stats
    }

    /// Normalize one chunk and append its rows to their shards.
    pub fn route_chunk(&mut self, chunk: &SourceChunk, writers: &mut ShardWriters) -> Result<u64> {
        let batch = normalize(&chunk.batch, self.target, &self.key, &chunk.origin)?;
        self.stats.chunks += 1;
        let n = batch.num_rows();
        if n == 0 {
            return Ok(0);
        }

        let first = self.next_seq;
        self.next_seq += n as u64;
        let seq: ArrayRef = Arc::new(UInt64Array::from_iter_values(first..self.next_seq));
        let mut columns = batch.columns().to_vec();
        columns.push(seq);
        let stamped = RecordBatch::try_new(writers.schema(), columns)
            .with_context(|| format!("attach sequence numbers to {}", chunk.origin))?;

        let ids = self.hasher.bucket_ids(batch.column(self.partition_idx))?;
        let groups = partition_indices(&ids, writers.buckets());
        if let [(bucket, _)] = groups.as_slice() {
            writers.append(*bucket, &stamped)?;
        } else {
            for (bucket, idx) in &groups {
                let sub = take_rows(&stamped, idx)?;
                writers.append(*bucket, &sub)?;
            }
        }

        self.stats.rows_in += n as u64;
        Ok(n as u64)
    }
}

/// Run the whole routing pass. The writers are handed in and handed back so
/// the caller decides when shards are closed; on error they are dropped and
/// the partially written shards stay on disk for inspection.
pub fn route<I>(
    chunks: I,
    target: &TargetSchema,
    key: &KeySpec,
    mut writers: ShardWriters,
    progress: &ProgressScope,
) -> Result<(ShardWriters, RouteStats)>
where
    I: IntoIterator<Item = Result<SourceChunk>>,
{
    let mut router = Router::new(target, key, writers.buckets())?;
    for chunk in chunks {
        let chunk = chunk?;
        let rows = router
            .route_chunk(&chunk, &mut writers)
            .with_context(|| format!("routing {}", chunk.origin))?;
        progress.inc(rows);
        tracing::trace!(origin = %chunk.origin, rows, open_shards = writers.open_count(), "routed chunk");
    }
    Ok((writers, router.stats()))
}
