#[path = "common/mod.rs"]
mod common;

use bucket_dedup::{
    dedup_shard_path, merge, normalize, suspect_report_path, ChunkOrigin, ConsistencyChecker, ConsistencyReport,
    DedupError, KeySpec, ProgressScope,
};
use common::*;
use std::fs;

fn quiet() -> ProgressScope {
    ProgressScope::count("", 0, false)
}

/// Clean shards merge in ascending bucket order with no failures, and a stale
/// suspect report from an earlier run is removed.
#[test]
fn clean_merge_is_consistent() {
    let work = tempfile::tempdir().unwrap();
    write_parquet(&dedup_shard_path(work.path(), 3), &[station_batch(&[(30, 0, 1.0), (30, 1, 1.0)])]);
    write_parquet(&dedup_shard_path(work.path(), 0), &[station_batch(&[(10, 0, 2.0)])]);
    let out = work.path().join("gold.parquet");
    fs::write(suspect_report_path(&out), b"{}").unwrap();

    let opts = engine(work.path(), 4).options().clone();
    let report = merge(work.path(), &out, &opts, &quiet()).unwrap();

    assert!(!report.suspect());
    assert_eq!((report.rows_out, report.shards_merged, report.distinct_keys), (3, 2, 3));
    assert!(!suspect_report_path(&out).exists());
    let rows = station_rows(&read_parquet(&out));
    assert_eq!(rows.iter().map(|r| r.0).collect::<Vec<_>>(), vec![10, 30, 30]);
}

/// A station split across two shards flags the output as suspect: the output
/// is still written, a sidecar report explains why, and the hard gate errors.
#[test]
fn partition_in_two_shards_is_reported() {
    let work = tempfile::tempdir().unwrap();
    write_parquet(&dedup_shard_path(work.path(), 0), &[station_batch(&[(1, 0, 1.0), (1, 1, 1.0)])]);
    write_parquet(&dedup_shard_path(work.path(), 2), &[station_batch(&[(1, 5, 1.0)])]);
    let out = work.path().join("gold.parquet");

    let opts = engine(work.path(), 4).options().clone();
    let report = merge(work.path(), &out, &opts, &quiet()).unwrap();

    assert!(report.suspect());
    assert!(out.exists());
    assert_eq!(report.rows_out, 3);
    assert!(report.consistency.failures.iter().any(|f| f.contains("0000") && f.contains("0002")));

    let sidecar: serde_json::Value = serde_json::from_slice(&fs::read(suspect_report_path(&out)).unwrap()).unwrap();
    assert_eq!(sidecar["failures"].as_array().unwrap().len(), report.consistency.failures.len());

    match report.consistency.into_result() {
        Err(DedupError::ConsistencyCheckFailure { failures }) => assert!(!failures.is_empty()),
        other => panic!("expected ConsistencyCheckFailure, got {other:?}"),
    }
}

/// A shard that still holds a duplicate key is caught.
#[test]
fn duplicate_inside_shard_is_reported() {
    let work = tempfile::tempdir().unwrap();
    write_parquet(&dedup_shard_path(work.path(), 1), &[station_batch(&[(3, 0, 1.0), (3, 0, 2.0)])]);
    let out = work.path().join("gold.parquet");

    let opts = engine(work.path(), 2).options().clone();
    let report = merge(work.path(), &out, &opts, &quiet()).unwrap();

    assert!(report.suspect());
    assert_eq!(report.distinct_keys, 1);
    assert!(report.consistency.failures.iter().any(|f| f.contains("shard 0001 holds 2 rows but 1 distinct keys")));
}

/// With no deduplicated shards at all the output is an empty, valid table.
#[test]
fn merge_of_nothing_writes_empty_output() {
    let work = tempfile::tempdir().unwrap();
    let out = work.path().join("nested").join("gold.parquet");

    let opts = engine(work.path(), 8).options().clone();
    let report = merge(work.path(), &out, &opts, &quiet()).unwrap();

    assert_eq!(report.rows_out, 0);
    assert_eq!(report.shards_merged, 0);
    assert!(!report.suspect());
    assert_eq!(read_parquet(&out).num_rows(), 0);
}

/// The checker can be driven directly, shard by shard.
#[test]
fn checker_counts_distinct_keys_per_shard() {
    let schema = small_schema();
    let key = KeySpec::new("station_id", "time_hour");
    let mut check = ConsistencyChecker::new(&schema, &key).unwrap();
    let origin = ChunkOrigin::new("mem", 0);

    check.begin_shard(0);
    check.observe(&normalize(&station_batch(&[(1, 0, 1.0), (1, 1, 1.0)]), &schema, &key, &origin).unwrap()).unwrap();
    check.observe(&normalize(&station_batch(&[(2, 0, 1.0)]), &schema, &key, &origin).unwrap()).unwrap();
    check.begin_shard(5);
    check.observe(&normalize(&station_batch(&[(9, 9, 1.0)]), &schema, &key, &origin).unwrap()).unwrap();
    let report: ConsistencyReport = check.finish(4);

    assert!(report.is_consistent(), "{:?}", report.failures);
    assert_eq!((report.shards_checked, report.rows_read, report.distinct_keys), (2, 4, 4));

    let mut check = ConsistencyChecker::new(&schema, &key).unwrap();
    check.begin_shard(0);
    check.observe(&normalize(&station_batch(&[(1, 0, 1.0)]), &schema, &key, &origin).unwrap()).unwrap();
    let report = check.finish(2);
    assert!(report.failures.iter().any(|f| f.contains("output holds 2 rows")));
}
