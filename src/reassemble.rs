//! Pass 3: concatenate deduplicated shards in ascending bucket order and
//! verify the result.

use crate::config::{DedupOptions, KeySpec};
use crate::error::DedupError;
use crate::input::ChunkOrigin;
use crate::parquet_io::{read_batches, TableWriter};
use crate::progress::ProgressScope;
use crate::schema::{normalize, TargetSchema};
use crate::shard::{dedup_shard_path, existing_shards};
use crate::util::remove_with_backoff;
use ahash::{AHashMap, AHashSet};
use anyhow::{anyhow, Context, Result};
use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use serde::Serialize;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Outcome of the post-merge consistency check. Failures flag the output as
/// suspect; they do not remove it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub shards_checked: usize,
    pub rows_read: u64,
    pub rows_written: u64,
    pub distinct_keys: u64,
    pub failures: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn a failed check into `DedupError::ConsistencyCheckFailure` for
    /// callers that want a hard gate.
    pub fn into_result(self) -> Result<Self, DedupError> {
        if self.is_consistent() {
            Ok(self)
        } else {
            Err(DedupError::ConsistencyCheckFailure { failures: self.failures })
        }
    }
}

/// Result of the merge pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub output: PathBuf,
    pub rows_out: u64,
    pub shards_merged: usize,
    pub distinct_keys: u64,
    pub consistency: ConsistencyReport,
}

impl MergeReport {
    pub fn suspect(&self) -> bool {
        !self.consistency.is_consistent()
    }
}

/// `<output>.suspect.json`
pub fn suspect_report_path(output: &Path) -> PathBuf {
    let mut s = output.as_os_str().to_owned();
    s.push(".suspect.json");
    PathBuf::from(s)
}

/// Tracks keys per shard and partition values across shards while shards are
/// streamed into the output.
pub struct ConsistencyChecker {
    partition_idx: usize,
    time_idx: usize,
    keys: RowConverter,
    partitions: RowConverter,
    seen_keys: AHashSet<Box<[u8]>>,
    partition_home: AHashMap<Box<[u8]>, usize>,
    current: Option<(usize, u64)>,
    report: ConsistencyReport,
}

impl ConsistencyChecker {
    pub fn new(target: &TargetSchema, key: &KeySpec) -> Result<Self> {
        let idx = |name: &str| {
            target
                .index_of(name)
                .ok_or_else(|| DedupError::MissingKeyField { field: name.to_string() })
        };
        let partition_idx = idx(&key.partition_field)?;
        let time_idx = idx(&key.time_field)?;
        let pt = target.fields()[partition_idx].ty.data_type();
        let tt = target.fields()[time_idx].ty.data_type();
        Ok(Self {
            partition_idx,
            time_idx,
            keys: RowConverter::new(vec![SortField::new(pt.clone()), SortField::new(tt)])
                .context("key row encoding")?,
            partitions: RowConverter::new(vec![SortField::new(pt)]).context("partition row encoding")?,
            seen_keys: AHashSet::new(),
            partition_home: AHashMap::new(),
            current: None,
            report: ConsistencyReport::default(),
        })
    }

    /// Start a new shard. Key sets are per shard; shards are assumed to fit in memory.
    pub fn begin_shard(&mut self, bucket: usize) {
        self.end_shard();
        self.current = Some((bucket, 0));
        self.report.shards_checked += 1;
    }

    pub fn observe(&mut self, batch: &RecordBatch) -> Result<()> {
        let (bucket, rows) = self
            .current
            .as_mut()
            .ok_or_else(|| anyhow!("observe called before begin_shard"))?;
        let bucket = *bucket;
        *rows += batch.num_rows() as u64;
        self.report.rows_read += batch.num_rows() as u64;

        let key_cols: [ArrayRef; 2] = [batch.column(self.partition_idx).clone(), batch.column(self.time_idx).clone()];
        let keys = self.keys.convert_columns(&key_cols).context("encode keys")?;
        for row in keys.iter() {
            self.seen_keys.insert(row.as_ref().into());
        }

        let parts = self
            .partitions
            .convert_columns(std::slice::from_ref(&key_cols[0]))
            .context("encode partition values")?;
        for row in parts.iter() {
            let home = *self.partition_home.entry(row.as_ref().into()).or_insert(bucket);
            if home != bucket {
                self.report.failures.push(format!(
                    "partition value present in shards {home:04} and {bucket:04}"
                ));
                // one message per (value, shard) pair is enough
                self.partition_home.insert(row.as_ref().into(), bucket);
            }
        }
        Ok(())
    }

    fn end_shard(&mut self) {
        if let Some((bucket, rows)) = self.current.take() {
            let distinct = self.seen_keys.len() as u64;
            if distinct != rows {
                self.report.failures.push(format!(
                    "shard {bucket:04} holds {rows} rows but {distinct} distinct keys"
                ));
            }
            self.report.distinct_keys += distinct;
            self.seen_keys.clear();
        }
    }

    pub fn finish(mut self, rows_written: u64) -> ConsistencyReport {
        self.end_shard();
        self.report.rows_written = rows_written;
        if rows_written != self.report.distinct_keys {
            self.report.failures.push(format!(
                "output holds {rows_written} rows but shards hold {} distinct keys",
                self.report.distinct_keys
            ));
        }
        self.report
    }
}

fn copy_shards(
    shards: &[(usize, PathBuf)],
    opts: &DedupOptions,
    writer: &mut TableWriter,
    check: &mut ConsistencyChecker,
    progress: &ProgressScope,
) -> Result<()> {
    for (bucket, path) in shards {
        check.begin_shard(*bucket);
        let batches = read_batches(path, opts.read_batch_rows)
            .map_err(|e| DedupError::shard_io(*bucket, path, "read", format!("{e:#}")))?;
        for (i, batch) in batches.enumerate() {
            let batch = batch.map_err(|e| DedupError::shard_io(*bucket, path, "read", format!("{e:#}")))?;
            let batch = normalize(&batch, &opts.target_schema, &opts.key, &ChunkOrigin::new(path, i))?;
            check.observe(&batch)?;
            writer.write(&batch)?;
        }
        progress.inc(1);
    }
    Ok(())
}

fn write_suspect_report(path: &Path, report: &ConsistencyReport) -> Result<()> {
    let f = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(f), report)
        .with_context(|| format!("write {}", path.display()))
}

/// Stream every deduplicated shard under `dir` into `output`.
///
/// The output is written through a temp file and only appears at `output`
/// once every shard was copied. A failed consistency check still produces the
/// output; it is logged and a `<output>.suspect.json` sidecar is written.
pub fn merge(dir: &Path, output: &Path, opts: &DedupOptions, progress: &ProgressScope) -> Result<MergeReport> {
    let shards = existing_shards(opts.bucket_count, |b| dedup_shard_path(dir, b));
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    tracing::info!(shards = shards.len(), output = %output.display(), "merging deduplicated shards");

    let mut check = ConsistencyChecker::new(&opts.target_schema, &opts.key)?;
    let mut writer = TableWriter::create_atomic(output, opts.target_schema.arrow_schema(), opts.compression)?;
    if let Err(e) = copy_shards(&shards, opts, &mut writer, &mut check, progress) {
        writer.abandon();
        return Err(e.context(format!("merge into {}", output.display())));
    }
    let rows_out = writer.finish()?;
    let consistency = check.finish(rows_out);

    let sidecar = suspect_report_path(output);
    if consistency.is_consistent() {
        if sidecar.exists() {
            remove_with_backoff(&sidecar)?;
        }
    } else {
        tracing::warn!(
            failures = consistency.failures.len(),
            first = %consistency.failures[0],
            report = %sidecar.display(),
            "consistency check failed; output flagged as suspect"
        );
        write_suspect_report(&sidecar, &consistency)?;
    }

    tracing::info!(rows_out, shards = shards.len(), distinct_keys = consistency.distinct_keys, "merge complete");
    Ok(MergeReport {
        output: output.to_path_buf(),
        rows_out,
        shards_merged: shards.len(),
        distinct_keys: consistency.distinct_keys,
        consistency,
    })
}
