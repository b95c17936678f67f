use crate::error::DedupError;
use crate::schema::TargetSchema;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Composite key. `partition_field` doubles as the bucket field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    pub partition_field: String,
    pub time_field: String,
}

impl KeySpec {
    pub fn new(partition_field: impl Into<String>, time_field: impl Into<String>) -> Self {
        Self { partition_field: partition_field.into(), time_field: time_field.into() }
    }
}

impl Default for KeySpec {
    fn default() -> Self {
        Self::new("station_id", "time_hour")
    }
}

/// Parquet codec for shard, deduplicated-shard and output files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Uncompressed,
    #[default]
    Snappy,
    Zstd,
}

/// Run options with defaults and builder chaining.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupOptions {
    pub target_schema: TargetSchema,
    pub key: KeySpec,
    pub bucket_count: usize,            // more buckets => smaller shards, more files
    pub intermediate_dir: PathBuf,      // shard + dedup-shard files live here
    pub parallelism: Option<usize>,     // dedup workers; None = rayon default
    pub compression: Compression,
    pub read_batch_rows: usize,         // rows per input chunk
    pub progress: bool,
    pub keep_intermediate: bool,        // keep shards after success for audit

    // memory guard for the dedup pass
    pub shard_memory_fraction: f64,     // warn when a shard's estimate exceeds this share of free RAM
    pub hard_low_frac: f64,             // yield while available/total is below this
    pub backoff_ms: u64,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            target_schema: TargetSchema::station_hourly(),
            key: KeySpec::default(),
            bucket_count: 64,
            intermediate_dir: PathBuf::from("./dedup_work"),
            parallelism: None,
            compression: Compression::Snappy,
            read_batch_rows: 64 * 1024,
            progress: true,
            keep_intermediate: false,
            shard_memory_fraction: 0.5,
            hard_low_frac: 0.10,
            backoff_ms: 25,
        }
    }
}

impl DedupOptions {
    pub fn with_target_schema(mut self, schema: TargetSchema) -> Self {
        self.target_schema = schema;
        self
    }
    pub fn with_key(mut self, partition_field: impl Into<String>, time_field: impl Into<String>) -> Self {
        self.key = KeySpec::new(partition_field, time_field);
        self
    }
    pub fn with_bucket_count(mut self, n: usize) -> Self {
        self.bucket_count = n;
        self
    }
    pub fn with_intermediate_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.intermediate_dir = dir.as_ref().to_path_buf();
        self
    }
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = Some(threads.max(1));
        self
    }
    pub fn with_compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }
    pub fn with_read_batch_rows(mut self, rows: usize) -> Self {
        self.read_batch_rows = rows.max(1);
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_keep_intermediate(mut self, yes: bool) -> Self {
        self.keep_intermediate = yes;
        self
    }
    pub fn with_shard_memory_fraction(mut self, frac: f64) -> Self {
        self.shard_memory_fraction = frac;
        self
    }

    /// Startup validation, run before any input is read.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            bail!("bucket_count must be > 0");
        }
        if self.read_batch_rows == 0 {
            bail!("read_batch_rows must be > 0");
        }
        if !(self.shard_memory_fraction > 0.0 && self.shard_memory_fraction <= 1.0) {
            bail!("shard_memory_fraction must be in (0, 1], got {}", self.shard_memory_fraction);
        }
        self.target_schema.validate()?;
        for field in [&self.key.partition_field, &self.key.time_field] {
            if self.target_schema.index_of(field).is_none() {
                return Err(DedupError::MissingKeyField { field: field.clone() }.into());
            }
        }
        if self.key.partition_field == self.key.time_field {
            bail!("partition_field and time_field must differ (both `{}`)", self.key.time_field);
        }
        Ok(())
    }
}

/// A complete run description as loaded by the binary from JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    #[serde(default = "default_input_pattern")]
    pub input_pattern: String,
    pub output: PathBuf,
    /// Target schema kept in its own JSON file; replaces `target_schema` when
    /// set. Relative paths resolve against the run file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_schema_file: Option<PathBuf>,
    #[serde(flatten)]
    pub options: DedupOptions,
}

pub fn default_input_pattern() -> String {
    r"^.*\.parquet$".to_string()
}

impl RunConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open run config {}", path.display()))?;
        let mut cfg: RunConfig = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("parse run config {}", path.display()))?;
        if let Some(schema_file) = &cfg.target_schema_file {
            let schema_path = match path.parent() {
                Some(dir) if schema_file.is_relative() => dir.join(schema_file),
                _ => schema_file.clone(),
            };
            cfg.options.target_schema = TargetSchema::from_json_file(&schema_path)?;
        }
        Ok(cfg)
    }
}
