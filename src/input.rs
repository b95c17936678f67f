//! Input discovery and chunked Parquet reading.

use crate::schema::TargetSchema;
use crate::util::open_with_backoff;
use anyhow::{bail, Context, Result};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ProjectionMask;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Where a chunk came from; used in error messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkOrigin {
    pub path: PathBuf,
    pub chunk_index: usize,
}

impl ChunkOrigin {
    pub fn new(path: impl Into<PathBuf>, chunk_index: usize) -> Self {
        Self { path: path.into(), chunk_index }
    }
}

impl fmt::Display for ChunkOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} chunk #{}", self.path.display(), self.chunk_index)
    }
}

/// A raw (not yet normalized) input chunk.
pub struct SourceChunk {
    pub origin: ChunkOrigin,
    pub batch: RecordBatch,
}

/// List files directly under `dir` whose names match `pattern`, sorted by name
/// (monthly parts named `..._YYYYMM` therefore come out in time order).
pub fn discover_inputs(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let re = Regex::new(pattern).with_context(|| format!("invalid input pattern {pattern:?}"))?;
    if !dir.is_dir() {
        bail!("input directory does not exist: {}", dir.display());
    }
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().map(|n| re.is_match(n)).unwrap_or(false))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("no input parts matching {pattern:?} in {}", dir.display());
    }
    Ok(files)
}

/// Sum of row counts from the Parquet footers (no data pages are read).
pub fn count_input_rows(paths: &[PathBuf]) -> Result<u64> {
    let mut total = 0u64;
    for p in paths {
        let f = open_with_backoff(p).with_context(|| format!("open {}", p.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(f)
            .with_context(|| format!("read parquet footer {}", p.display()))?;
        total += builder.metadata().file_metadata().num_rows().max(0) as u64;
    }
    Ok(total)
}

/// Open one file, projecting only the target columns it actually has.
fn open_projected(path: &Path, target: &TargetSchema, batch_rows: usize) -> Result<ParquetRecordBatchReader> {
    let f = open_with_backoff(path).with_context(|| format!("open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(f)
        .with_context(|| format!("read parquet footer {}", path.display()))?;

    let file_schema = builder.schema().clone();
    let roots: Vec<usize> = file_schema
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| target.index_of(f.name()).is_some())
        .map(|(i, _)| i)
        .collect();
    if roots.len() < target.len() {
        let missing: Vec<&str> = target.names().filter(|n| file_schema.index_of(n).is_err()).collect();
        tracing::debug!(path = %path.display(), ?missing, "target fields absent from input; they will be null");
    }

    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    builder
        .with_projection(mask)
        .with_batch_size(batch_rows)
        .build()
        .with_context(|| format!("build reader {}", path.display()))
}

/// Sequential chunk stream over several Parquet files, one chunk live at a time.
pub struct ChunkReader {
    pending: VecDeque<PathBuf>,
    current: Option<(PathBuf, ParquetRecordBatchReader)>,
    chunk_index: usize,
    target: TargetSchema,
    batch_rows: usize,
}

impl ChunkReader {
    pub fn new(files: &[PathBuf], target: &TargetSchema, batch_rows: usize) -> Self {
        Self {
            pending: files.iter().cloned().collect(),
            current: None,
            chunk_index: 0,
            target: target.clone(),
            batch_rows: batch_rows.max(1),
        }
    }
}

impl Iterator for ChunkReader {
    type Item = Result<SourceChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let path = self.pending.pop_front()?;
                match open_projected(&path, &self.target, self.batch_rows) {
                    Ok(r) => {
                        self.current = Some((path, r));
                        self.chunk_index = 0;
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            let (path, reader) = self.current.as_mut()?;
            match reader.next() {
                Some(Ok(batch)) => {
                    let origin = ChunkOrigin::new(path.clone(), self.chunk_index);
                    self.chunk_index += 1;
                    return Some(Ok(SourceChunk { origin, batch }));
                }
                Some(Err(e)) => {
                    let ctx = format!("decode {} chunk #{}", path.display(), self.chunk_index);
                    self.current = None;
                    return Some(Err(anyhow::Error::new(e).context(ctx)));
                }
                None => self.current = None,
            }
        }
    }
}
