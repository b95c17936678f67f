//! Parquet read/write helpers shared by the three passes.

use crate::config::Compression;
use crate::util::{create_with_backoff, open_with_backoff, remove_with_backoff, replace_file_atomic_backoff};
use anyhow::{Context, Result};
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCodec, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::{Path, PathBuf};

pub fn writer_properties(compression: Compression) -> WriterProperties {
    let codec = match compression {
        Compression::Uncompressed => ParquetCodec::UNCOMPRESSED,
        Compression::Snappy => ParquetCodec::SNAPPY,
        Compression::Zstd => ParquetCodec::ZSTD(ZstdLevel::default()),
    };
    WriterProperties::builder().set_compression(codec).build()
}

/// Single-file Parquet writer. `create_atomic` writes to `<path>.inprogress`
/// and only `finish` makes the file visible at `path`.
pub struct TableWriter {
    path: PathBuf,
    tmp: Option<PathBuf>,
    inner: ArrowWriter<File>,
    rows: u64,
}

impl TableWriter {
    pub fn create(path: &Path, schema: SchemaRef, compression: Compression) -> Result<Self> {
        let f = create_with_backoff(path).with_context(|| format!("create {}", path.display()))?;
        let inner = ArrowWriter::try_new(f, schema, Some(writer_properties(compression)))
            .with_context(|| format!("init parquet writer {}", path.display()))?;
        Ok(Self { path: path.to_path_buf(), tmp: None, inner, rows: 0 })
    }

    pub fn create_atomic(path: &Path, schema: SchemaRef, compression: Compression) -> Result<Self> {
        let tmp = inprogress_path(path);
        let mut w = Self::create(&tmp, schema, compression)?;
        w.path = path.to_path_buf();
        w.tmp = Some(tmp);
        Ok(w)
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.inner
            .write(batch)
            .with_context(|| format!("write {}", self.path.display()))?;
        self.rows += batch.num_rows() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the footer and, for atomic writers, promote the temp file.
    pub fn finish(self) -> Result<u64> {
        self.inner
            .close()
            .with_context(|| format!("close {}", self.path.display()))?;
        if let Some(tmp) = &self.tmp {
            replace_file_atomic_backoff(tmp, &self.path)?;
        }
        Ok(self.rows)
    }

    /// Drop the writer without publishing; removes the temp file of atomic writers.
    pub fn abandon(self) {
        let tmp = self.tmp.clone();
        drop(self.inner);
        if let Some(tmp) = tmp {
            if let Err(e) = remove_with_backoff(&tmp) {
                tracing::warn!(path = %tmp.display(), error = %e, "failed to remove abandoned temp file");
            }
        }
    }
}

pub fn inprogress_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".inprogress");
    PathBuf::from(s)
}

/// Load a whole Parquet file as one batch. `None` when the file has no rows.
pub fn read_table(path: &Path, batch_rows: usize) -> Result<Option<RecordBatch>> {
    let f = open_with_backoff(path).with_context(|| format!("open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(f)
        .with_context(|| format!("read parquet footer {}", path.display()))?
        .with_batch_size(batch_rows.max(1))
        .build()
        .with_context(|| format!("build reader {}", path.display()))?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("decode {}", path.display()))?;
    if batches.iter().all(|b| b.num_rows() == 0) {
        return Ok(None);
    }
    let table = concat_batches(&schema, &batches).with_context(|| format!("concat {}", path.display()))?;
    Ok(Some(table))
}

/// Streaming reader over a Parquet file, batch by batch.
pub fn read_batches(path: &Path, batch_rows: usize) -> Result<impl Iterator<Item = Result<RecordBatch>>> {
    let f = open_with_backoff(path).with_context(|| format!("open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(f)
        .with_context(|| format!("read parquet footer {}", path.display()))?
        .with_batch_size(batch_rows.max(1))
        .build()
        .with_context(|| format!("build reader {}", path.display()))?;
    let display = path.display().to_string();
    Ok(reader.map(move |b| b.with_context(|| format!("decode {display}"))))
}

/// Uncompressed size of all row groups, from the footer. Used as the
/// in-memory size estimate of a shard before it is loaded.
pub fn estimate_uncompressed_bytes(path: &Path) -> Result<u64> {
    let f = open_with_backoff(path).with_context(|| format!("open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(f)
        .with_context(|| format!("read parquet footer {}", path.display()))?;
    Ok(builder
        .metadata()
        .row_groups()
        .iter()
        .map(|rg| rg.total_byte_size().max(0) as u64)
        .sum())
}
