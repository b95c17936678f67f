use crate::config::{Compression, DedupOptions, RunConfig};
use crate::dedupe::{dedup_all, ShardDedupStats};
use crate::input::{count_input_rows, discover_inputs, ChunkReader};
use crate::progress::ProgressScope;
use crate::reassemble::{merge, suspect_report_path, MergeReport};
use crate::router::route;
use crate::schema::TargetSchema;
use crate::shard::{clean_intermediate, dedup_shard_path, existing_shards, shard_path, ShardFile, ShardWriters};
use crate::util::{init_tracing_once, remove_with_backoff};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of the routing pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub chunks: u64,
    pub rows_in: u64,
    pub shards: Vec<ShardFile>,
}

/// What a full run did, end to end.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub rows_in: u64,
    pub rows_out: u64,
    pub removed: u64,
    pub buckets_used: usize,
    pub suspect: bool,
    pub output: PathBuf,
}

/// Three-pass bucketed dedup: route into shards, dedup each shard, merge.
#[derive(Clone, Debug, Default)]
pub struct BucketDedup {
    pub(crate) opts: DedupOptions,
}

impl BucketDedup {
    pub fn new() -> Self {
        Self { opts: DedupOptions::default() }
    }

    pub fn from_options(opts: DedupOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &DedupOptions {
        &self.opts
    }

    // -------- Builder methods --------
    pub fn target_schema(mut self, schema: TargetSchema) -> Self { self.opts = self.opts.with_target_schema(schema); self }
    pub fn key(mut self, partition_field: impl Into<String>, time_field: impl Into<String>) -> Self { self.opts = self.opts.with_key(partition_field, time_field); self }
    pub fn bucket_count(mut self, n: usize) -> Self { self.opts = self.opts.with_bucket_count(n); self }
    pub fn intermediate_dir(mut self, dir: impl AsRef<Path>) -> Self { self.opts = self.opts.with_intermediate_dir(dir); self }
    pub fn parallelism(mut self, threads: usize) -> Self { self.opts = self.opts.with_parallelism(threads); self }
    pub fn compression(mut self, c: Compression) -> Self { self.opts = self.opts.with_compression(c); self }
    pub fn read_batch_rows(mut self, rows: usize) -> Self { self.opts = self.opts.with_read_batch_rows(rows); self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }
    pub fn keep_intermediate(mut self, yes: bool) -> Self { self.opts = self.opts.with_keep_intermediate(yes); self }
    pub fn shard_memory_fraction(mut self, frac: f64) -> Self { self.opts = self.opts.with_shard_memory_fraction(frac); self }

    // -------- Passes --------

    /// Pass 1. Clears leftovers of earlier runs, then routes every chunk of
    /// `files` (in order) into bucket shards.
    pub fn route_files(&self, files: &[PathBuf]) -> Result<RouteSummary> {
        self.opts.validate()?;
        let dir = &self.opts.intermediate_dir;
        let stale = clean_intermediate(dir)?;
        if stale > 0 {
            tracing::info!(removed = stale, dir = %dir.display(), "removed shard files from a previous run");
        }

        let total_rows = count_input_rows(files)?;
        tracing::info!(files = files.len(), rows = total_rows, buckets = self.opts.bucket_count, "routing input into shards");
        let progress = ProgressScope::rows("Routing", total_rows, self.opts.progress);

        let writers = ShardWriters::create(
            dir,
            self.opts.target_schema.with_sequence(),
            self.opts.compression,
            self.opts.bucket_count,
        )?;
        let chunks = ChunkReader::new(files, &self.opts.target_schema, self.opts.read_batch_rows);
        let (writers, stats) = route(chunks, &self.opts.target_schema, &self.opts.key, writers, &progress)?;
        let shards = writers.finish()?;
        progress.finish("Routing done");

        tracing::info!(chunks = stats.chunks, rows_in = stats.rows_in, shards = shards.len(), "routing complete");
        Ok(RouteSummary { chunks: stats.chunks, rows_in: stats.rows_in, shards })
    }

    /// Pass 2. Deduplicates every routed shard.
    pub fn dedup_shards(&self) -> Result<Vec<ShardDedupStats>> {
        self.opts.validate()?;
        let dir = &self.opts.intermediate_dir;
        let pending = existing_shards(self.opts.bucket_count, |b| shard_path(dir, b)).len();
        tracing::info!(shards = pending, "deduplicating shards");
        let progress = ProgressScope::count("Dedup shards", pending as u64, self.opts.progress);
        let stats = dedup_all(dir, &self.opts, &progress)?;
        progress.finish("Dedup done");

        let rows_in: u64 = stats.iter().map(|s| s.rows_in).sum();
        let rows_out: u64 = stats.iter().map(|s| s.rows_out).sum();
        tracing::info!(shards = stats.len(), rows_in, rows_out, removed = rows_in - rows_out, "dedup complete");
        Ok(stats)
    }

    /// Pass 3. Merges deduplicated shards into `output`.
    pub fn merge_into(&self, output: &Path) -> Result<MergeReport> {
        self.opts.validate()?;
        let dir = &self.opts.intermediate_dir;
        let pending = existing_shards(self.opts.bucket_count, |b| dedup_shard_path(dir, b)).len();
        let progress = ProgressScope::count("Merge shards", pending as u64, self.opts.progress);
        let report = merge(dir, output, &self.opts, &progress)?;
        progress.finish("Merge done");
        Ok(report)
    }

    // -------- Whole runs --------

    /// Run all three passes over `files` into `output`.
    ///
    /// A failed run leaves no file at `output` and keeps the shards for
    /// inspection. A successful run deletes the shards unless
    /// `keep_intermediate` is set.
    pub fn run_files(&self, files: &[PathBuf], output: &Path) -> Result<RunSummary> {
        init_tracing_once();
        self.opts.validate()?;
        fs::create_dir_all(&self.opts.intermediate_dir)
            .with_context(|| format!("create {}", self.opts.intermediate_dir.display()))?;
        for stale in [output.to_path_buf(), suspect_report_path(output)] {
            if stale.exists() {
                tracing::debug!(path = %stale.display(), "removing previous output");
                remove_with_backoff(&stale)?;
            }
        }

        let routed = self.route_files(files).context("routing pass")?;
        self.dedup_shards().context("dedup pass")?;
        let merged = self.merge_into(output).context("merge pass")?;

        if !self.opts.keep_intermediate {
            clean_intermediate(&self.opts.intermediate_dir)?;
        }

        let summary = RunSummary {
            rows_in: routed.rows_in,
            rows_out: merged.rows_out,
            removed: routed.rows_in.saturating_sub(merged.rows_out),
            buckets_used: routed.shards.len(),
            suspect: merged.suspect(),
            output: output.to_path_buf(),
        };
        tracing::info!(
            rows_in = summary.rows_in,
            rows_out = summary.rows_out,
            removed = summary.removed,
            buckets_used = summary.buckets_used,
            suspect = summary.suspect,
            "run complete"
        );
        Ok(summary)
    }

    /// Discover `pattern`-matching parts under `input_dir`, then `run_files`.
    pub fn run_dir(&self, input_dir: &Path, pattern: &str, output: &Path) -> Result<RunSummary> {
        let files = discover_inputs(input_dir, pattern)?;
        tracing::info!(parts = files.len(), dir = %input_dir.display(), "discovered input parts");
        self.run_files(&files, output)
    }
}

/// Run a loaded run file.
pub fn run_config(cfg: &RunConfig) -> Result<RunSummary> {
    BucketDedup::from_options(cfg.options.clone()).run_dir(&cfg.input_dir, &cfg.input_pattern, &cfg.output)
}
