#![allow(dead_code)]

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, TimestampMillisecondArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit, TimestampMillisecondType, Int64Type, Float64Type};
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use bucket_dedup::{BucketDedup, DedupError, FieldType, KeySpec, TargetField, TargetSchema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

pub const HOUR_MS: i64 = 3_600_000;

/// Small station table: the key pair, one measured value and one column
/// that the fixtures never provide (`temperature`).
pub fn small_schema() -> TargetSchema {
    TargetSchema::new(vec![
        TargetField::new("station_id", FieldType::Int64),
        TargetField::new("time_hour", FieldType::TimestampMillisecond),
        TargetField::new("bikes", FieldType::Float64),
        TargetField::new("temperature", FieldType::Float64),
    ])
}

/// The composite key used throughout the fixtures.
pub fn key() -> KeySpec {
    KeySpec::new("station_id", "time_hour")
}

/// Engine over `small_schema` with progress bars off.
pub fn engine(work: &Path, buckets: usize) -> BucketDedup {
    BucketDedup::new()
        .target_schema(small_schema())
        .key("station_id", "time_hour")
        .bucket_count(buckets)
        .intermediate_dir(work)
        .parallelism(2)
        .progress(false)
}

/// An input chunk as upstream writes it: `station_id`, `time_hour` (in hours),
/// `bikes`. No `temperature` column.
pub fn station_batch(rows: &[(i64, i64, f64)]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("station_id", DataType::Int64, true),
        Field::new("time_hour", DataType::Timestamp(TimeUnit::Millisecond, None), true),
        Field::new("bikes", DataType::Float64, true),
    ]));
    let ids: ArrayRef = Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0)));
    let hours: ArrayRef = Arc::new(TimestampMillisecondArray::from_iter_values(rows.iter().map(|r| r.1 * HOUR_MS)));
    let bikes: ArrayRef = Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.2)));
    RecordBatch::try_new(schema, vec![ids, hours, bikes]).unwrap()
}

/// Write `batches` (sharing one schema) as a Parquet file, one row group per batch.
pub fn write_parquet(path: &Path, batches: &[RecordBatch]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let f = File::create(path).unwrap();
    let mut w = ArrowWriter::try_new(f, batches[0].schema(), None).unwrap();
    for b in batches {
        w.write(b).unwrap();
        w.flush().unwrap();
    }
    w.close().unwrap();
}

/// Read a whole Parquet file back as a single batch.
pub fn read_parquet(path: &Path) -> RecordBatch {
    let f = File::open(path).unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(f).unwrap().build().unwrap();
    let schema = reader.schema();
    let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
    concat_batches(&schema, &batches).unwrap()
}

/// `(station_id, hour, bikes)` triples in file order.
pub fn station_rows(batch: &RecordBatch) -> Vec<(i64, i64, Option<f64>)> {
    let ids = batch.column_by_name("station_id").unwrap().as_primitive::<Int64Type>().clone();
    let hours = batch.column_by_name("time_hour").unwrap().as_primitive::<TimestampMillisecondType>().clone();
    let bikes = batch.column_by_name("bikes").unwrap().as_primitive::<Float64Type>().clone();
    (0..batch.num_rows())
        .map(|i| {
            let b = if bikes.is_null(i) { None } else { Some(bikes.value(i)) };
            (ids.value(i), hours.value(i) / HOUR_MS, b)
        })
        .collect()
}

/// The first `DedupError` anywhere in an error's chain.
pub fn dedup_error(err: &anyhow::Error) -> Option<&DedupError> {
    err.chain().find_map(|e| e.downcast_ref::<DedupError>())
}

/// Deterministic input with overlap: `stations` x `hours` readings, every
/// third reading repeated later with a different value (the repeat must lose).
pub fn overlapping_parts(dir: &Path, stations: i64, hours: i64) -> Vec<std::path::PathBuf> {
    let mut first = Vec::new();
    let mut second = Vec::new();
    for s in 0..stations {
        for h in 0..hours {
            first.push((s, h, (s * 100 + h) as f64));
            if (s + h) % 3 == 0 {
                second.push((s, h, -1.0));
            }
        }
    }
    // second month also brings fresh hours
    for s in 0..stations {
        second.push((s, hours, (s * 100 + hours) as f64));
    }
    let a = dir.join("part_202401.parquet");
    let b = dir.join("part_202402.parquet");
    let mid = first.len() / 2;
    write_parquet(&a, &[station_batch(&first[..mid]), station_batch(&first[mid..])]);
    write_parquet(&b, &[station_batch(&second)]);
    vec![a, b]
}
