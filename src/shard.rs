use crate::config::Compression;
use crate::error::DedupError;
use crate::parquet_io::TableWriter;
use crate::util::remove_with_backoff;
use anyhow::{Context, Result};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// `<dir>/bucket_XXXX.parquet`: routed rows plus sequence column.
pub fn shard_path(dir: &Path, bucket: usize) -> PathBuf {
    dir.join(format!("bucket_{:04}.parquet", bucket))
}

/// `<dir>/dedup_bucket_XXXX.parquet`: target-schema rows, one per key.
pub fn dedup_shard_path(dir: &Path, bucket: usize) -> PathBuf {
    dir.join(format!("dedup_bucket_{:04}.parquet", bucket))
}

/// An on-disk shard and how many rows it holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShardFile {
    pub bucket: usize,
    pub path: PathBuf,
    pub rows: u64,
}

/// Existing shard files among buckets `0..buckets`, ascending. Absent buckets
/// simply had no rows.
pub fn existing_shards(buckets: usize, path_for: impl Fn(usize) -> PathBuf) -> Vec<(usize, PathBuf)> {
    (0..buckets)
        .map(|b| (b, path_for(b)))
        .filter(|(_, p)| p.is_file())
        .collect()
}

/// Remove shard artifacts left by a previous run so runs never mix.
/// Returns how many files were removed.
pub fn clean_intermediate(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let re = Regex::new(r"^(dedup_)?bucket_\d+\.parquet(\.inprogress)?$").context("shard name pattern")?;
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().map(|n| re.is_match(n)).unwrap_or(false) {
            remove_with_backoff(&entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// The set of open shard writers for one routing pass.
///
/// Owned by the caller and handed to the router; a writer (and its file) exists
/// only for buckets that received at least one row.
pub struct ShardWriters {
    dir: PathBuf,
    schema: SchemaRef,
    compression: Compression,
    buckets: usize,
    writers: BTreeMap<usize, TableWriter>,
}

impl ShardWriters {
    pub fn create(dir: &Path, schema: SchemaRef, compression: Compression, buckets: usize) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            schema,
            compression,
            buckets: buckets.max(1),
            writers: BTreeMap::new(),
        })
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn open_count(&self) -> usize {
        self.writers.len()
    }

    /// Append a sub-chunk to `bucket`'s shard, opening the shard on first touch.
    pub fn append(&mut self, bucket: usize, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        if !self.writers.contains_key(&bucket) {
            let path = shard_path(&self.dir, bucket);
            let w = TableWriter::create(&path, self.schema.clone(), self.compression)
                .map_err(|e| DedupError::shard_io(bucket, &path, "create", format!("{e:#}")))?;
            tracing::debug!(bucket, path = %path.display(), "opened shard");
            self.writers.insert(bucket, w);
        }
        if let Some(w) = self.writers.get_mut(&bucket) {
            w.write(batch)
                .map_err(|e| DedupError::shard_io(bucket, w.path(), "write", format!("{e:#}")))?;
        }
        Ok(())
    }

    /// Close every writer and return the shards in ascending bucket order.
    pub fn finish(self) -> Result<Vec<ShardFile>> {
        let mut out = Vec::with_capacity(self.writers.len());
        for (bucket, w) in self.writers {
            let path = w.path().to_path_buf();
            let rows = w
                .finish()
                .map_err(|e| DedupError::shard_io(bucket, &path, "close", format!("{e:#}")))?;
            out.push(ShardFile { bucket, path, rows });
        }
        Ok(out)
    }
}
