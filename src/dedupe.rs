//! Pass 2: per-shard exact dedup on the composite key, first-wins by sequence.

use crate::bucketing::take_rows;
use crate::config::DedupOptions;
use crate::error::DedupError;
use crate::input::ChunkOrigin;
use crate::mem::{available_memory_bytes, maybe_throttle_low_memory};
use crate::parquet_io::{estimate_uncompressed_bytes, read_table, TableWriter};
use crate::progress::ProgressScope;
use crate::schema::{normalize, SEQ_COLUMN};
use crate::shard::{dedup_shard_path, existing_shards, shard_path};
use anyhow::{anyhow, Context, Result};
use arrow::array::{ArrayRef, BooleanArray};
use arrow::compute::{filter_record_batch, lexsort_to_indices, SortColumn, SortOptions};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of deduplicating one shard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShardDedupStats {
    pub bucket: usize,
    pub rows_in: u64,
    pub rows_out: u64,
}

impl ShardDedupStats {
    pub fn removed(&self) -> u64 {
        self.rows_in - self.rows_out
    }
}

fn column_by_name(batch: &RecordBatch, name: &str) -> Result<ArrayRef> {
    batch
        .column_by_name(name)
        .cloned()
        .ok_or_else(|| anyhow!("shard is missing column `{name}`"))
}

/// Sort by `(partition, time, sequence)` and keep the first row of every key.
/// The returned batch still carries the sequence column.
pub fn first_per_key(table: &RecordBatch, partition_field: &str, time_field: &str) -> Result<RecordBatch> {
    let asc = Some(SortOptions { descending: false, nulls_first: true });
    let partition = column_by_name(table, partition_field)?;
    let time = column_by_name(table, time_field)?;
    let seq = column_by_name(table, SEQ_COLUMN)?;

    let order = lexsort_to_indices(
        &[
            SortColumn { values: partition, options: asc },
            SortColumn { values: time, options: asc },
            SortColumn { values: seq, options: asc },
        ],
        None,
    )
    .context("sort shard by key and sequence")?;
    let sorted = take_rows(table, &order)?;

    let key_cols = [column_by_name(&sorted, partition_field)?, column_by_name(&sorted, time_field)?];
    let converter = RowConverter::new(vec![
        SortField::new(key_cols[0].data_type().clone()),
        SortField::new(key_cols[1].data_type().clone()),
    ])
    .context("key row encoding")?;
    let keys = converter.convert_columns(&key_cols).context("encode key columns")?;

    // Rows are key-sorted, so a key's first occurrence is where it differs from its predecessor.
    let keep: BooleanArray = (0..keys.num_rows())
        .map(|i| Some(i == 0 || keys.row(i) != keys.row(i - 1)))
        .collect();
    filter_record_batch(&sorted, &keep).context("drop duplicate keys")
}

fn warn_if_oversized(bucket: usize, input: &Path, opts: &DedupOptions) {
    let estimate = match estimate_uncompressed_bytes(input) {
        Ok(b) => b,
        Err(_) => return,
    };
    let available = available_memory_bytes();
    if available > 0 && estimate as f64 > opts.shard_memory_fraction * available as f64 {
        tracing::warn!(
            bucket,
            shard_mb = estimate / (1024 * 1024),
            available_mb = available / (1024 * 1024),
            "shard may not fit in memory; consider a larger bucket_count"
        );
    }
}

/// Deduplicate one shard file into `output`. A missing or empty shard is a
/// no-op and produces no output file.
pub fn dedup_shard(bucket: usize, input: &Path, output: &Path, opts: &DedupOptions) -> Result<ShardDedupStats> {
    let mut stats = ShardDedupStats { bucket, ..Default::default() };
    if !input.is_file() {
        return Ok(stats);
    }

    warn_if_oversized(bucket, input, opts);
    maybe_throttle_low_memory(opts.hard_low_frac, Duration::from_millis(opts.backoff_ms));

    let table = read_table(input, opts.read_batch_rows)
        .map_err(|e| DedupError::shard_io(bucket, input, "read", format!("{e:#}")))?;
    let table = match table {
        Some(t) => t,
        None => return Ok(stats),
    };
    stats.rows_in = table.num_rows() as u64;

    let kept = first_per_key(&table, &opts.key.partition_field, &opts.key.time_field)
        .with_context(|| format!("dedup shard {bucket:04}"))?;
    // Re-conform to the target (drops the sequence column, strips any metadata).
    let out = normalize(&kept, &opts.target_schema, &opts.key, &ChunkOrigin::new(input, 0))?;
    stats.rows_out = out.num_rows() as u64;

    let mut w = TableWriter::create_atomic(output, opts.target_schema.arrow_schema(), opts.compression)
        .map_err(|e| DedupError::shard_io(bucket, output, "create", format!("{e:#}")))?;
    if let Err(e) = w.write(&out) {
        w.abandon();
        return Err(DedupError::shard_io(bucket, output, "write", format!("{e:#}")).into());
    }
    w.finish()
        .map_err(|e| DedupError::shard_io(bucket, output, "close", format!("{e:#}")))?;

    tracing::info!(
        bucket,
        rows_in = stats.rows_in,
        rows_out = stats.rows_out,
        removed = stats.removed(),
        "deduplicated shard"
    );
    Ok(stats)
}

/// Deduplicate every existing shard under `dir` on a worker pool. All jobs
/// run to completion; the pass fails if any shard failed.
pub fn dedup_all(dir: &Path, opts: &DedupOptions, progress: &ProgressScope) -> Result<Vec<ShardDedupStats>> {
    let shards: Vec<(usize, PathBuf)> = existing_shards(opts.bucket_count, |b| shard_path(dir, b));

    let job = |(bucket, path): &(usize, PathBuf)| -> Result<ShardDedupStats> {
        let res = dedup_shard(*bucket, path, &dedup_shard_path(dir, *bucket), opts);
        progress.inc(1);
        res
    };

    let results: Vec<Result<ShardDedupStats>> = match opts.parallelism {
        Some(n) => rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .context("build dedup worker pool")?
            .install(|| shards.par_iter().map(job).collect()),
        None => shards.par_iter().map(job).collect(),
    };

    let mut stats = Vec::with_capacity(results.len());
    let mut first_err = None;
    for r in results {
        match r {
            Ok(s) => stats.push(s),
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "shard dedup failed");
                first_err.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    stats.sort_by_key(|s| s.bucket);
    Ok(stats)
}
