#[path = "common/mod.rs"]
mod common;

use arrow::array::{Array, ArrayRef, AsArray, Int32Array, Int64Array, ListArray, StringArray};
use arrow::datatypes::{DataType, Field, Float64Type, Int32Type, Schema, TimestampMillisecondType};
use arrow::record_batch::RecordBatch;
use bucket_dedup::{normalize, ChunkOrigin, DedupError, FieldType, TargetField, TargetSchema};
use common::*;
use std::collections::HashMap;
use std::sync::Arc;

fn origin() -> ChunkOrigin {
    ChunkOrigin::new("part_202401.parquet", 3)
}

fn batch(fields: Vec<(&str, ArrayRef)>) -> RecordBatch {
    let schema = Arc::new(Schema::new(
        fields.iter().map(|(n, a)| Field::new(*n, a.data_type().clone(), true)).collect::<Vec<_>>(),
    ));
    RecordBatch::try_new(schema, fields.into_iter().map(|(_, a)| a).collect()).unwrap()
}

/// Columns come out in target order with target types; an int column
/// destined for a float field is widened; a missing field is all-null; an
/// extra input column is dropped.
#[test]
fn conforms_columns_types_and_order() {
    let input = batch(vec![
        ("extra", Arc::new(StringArray::from(vec!["x", "y"])) as ArrayRef),
        ("bikes", Arc::new(Int32Array::from(vec![3, 4]))),
        ("station_id", Arc::new(Int64Array::from(vec![7, 8]))),
        ("time_hour", Arc::new(StringArray::from(vec!["2024-01-01T10:00:00", "2024-01-01T11:00:00"]))),
    ]);

    let out = normalize(&input, &small_schema(), &key(), &origin()).unwrap();

    assert_eq!(out.schema(), small_schema().arrow_schema());
    assert_eq!(out.num_rows(), 2);
    assert!(out.column_by_name("extra").is_none());

    let bikes = out.column_by_name("bikes").unwrap().as_primitive::<Float64Type>();
    assert_eq!(bikes.values().to_vec(), vec![3.0, 4.0]);

    let hours = out.column_by_name("time_hour").unwrap().as_primitive::<TimestampMillisecondType>();
    assert_eq!(hours.value(0), 1_704_103_200_000);
    assert_eq!(hours.value(1) - hours.value(0), HOUR_MS);

    let temp = out.column_by_name("temperature").unwrap();
    assert_eq!(temp.data_type(), &DataType::Float64);
    assert_eq!(temp.null_count(), 2);
}

/// Schema-level and field-level metadata on the input never reaches the output.
#[test]
fn strips_metadata() {
    let field = Field::new("station_id", DataType::Int64, true)
        .with_metadata(HashMap::from([("origin".to_string(), "api".to_string())]));
    let schema = Schema::new(vec![field])
        .with_metadata(HashMap::from([("pandas".to_string(), "{}".to_string())]));
    let input = RecordBatch::try_new(Arc::new(schema), vec![Arc::new(Int64Array::from(vec![1]))]).unwrap();

    let out = normalize(&input, &small_schema(), &key(), &origin()).unwrap();

    assert!(out.schema().metadata().is_empty());
    assert!(out.schema().fields().iter().all(|f| f.metadata().is_empty()));
}

/// A chunk with none of the target columns still yields a full-width,
/// correctly sized, all-null chunk.
#[test]
fn synthesizes_every_absent_field() {
    let input = batch(vec![("unrelated", Arc::new(Int32Array::from(vec![1, 2, 3])) as ArrayRef)]);
    let out = normalize(&input, &small_schema(), &key(), &origin()).unwrap();
    assert_eq!(out.num_columns(), 4);
    assert_eq!(out.num_rows(), 3);
    assert!(out.columns().iter().all(|c| c.null_count() == 3));
}

/// Text that is not a number is rejected with a SchemaCast naming the field
/// and the chunk; blank text is treated as missing.
#[test]
fn rejects_unparsable_text_but_accepts_blanks() {
    let bad = batch(vec![("bikes", Arc::new(StringArray::from(vec!["1.5", "n/a"])) as ArrayRef)]);
    let err = normalize(&bad, &small_schema(), &key(), &origin()).unwrap_err();
    match dedup_error(&err) {
        Some(DedupError::SchemaCast { field, chunk, .. }) => {
            assert_eq!(field, "bikes");
            assert!(chunk.contains("part_202401.parquet"), "chunk was {chunk}");
            assert!(chunk.contains("#3"));
        }
        other => panic!("expected SchemaCast, got {other:?}"),
    }

    let blanks = batch(vec![("bikes", Arc::new(StringArray::from(vec![Some("2.5"), Some(""), Some("  "), None])) as ArrayRef)]);
    let out = normalize(&blanks, &small_schema(), &key(), &origin()).unwrap();
    let bikes = out.column_by_name("bikes").unwrap().as_primitive::<Float64Type>();
    assert_eq!(bikes.value(0), 2.5);
    assert_eq!(bikes.null_count(), 3);
}

/// Narrowing is allowed; values out of range for the target become null.
#[test]
fn lossy_narrowing_nulls_out_of_range() {
    let target = TargetSchema::new(vec![TargetField::new("count", FieldType::Int32)]);
    let input = batch(vec![("count", Arc::new(Int64Array::from(vec![12, 3_000_000_000])) as ArrayRef)]);
    let out = normalize(&input, &target, &key(), &origin()).unwrap();
    let count = out.column(0).as_primitive::<Int32Type>();
    assert_eq!(count.value(0), 12);
    assert!(count.is_null(1));
}

/// Out-of-range values may not become null in a key column: distinct
/// stations would collapse into one null key.
#[test]
fn out_of_range_key_value_is_an_error() {
    let target = TargetSchema::new(vec![
        TargetField::new("station_id", FieldType::Int32),
        TargetField::new("time_hour", FieldType::TimestampMillisecond),
    ]);
    let input = batch(vec![("station_id", Arc::new(Int64Array::from(vec![3_000_000_000, 4_000_000_000, 5])) as ArrayRef)]);
    let err = normalize(&input, &target, &key(), &origin()).unwrap_err();
    assert!(matches!(dedup_error(&err), Some(DedupError::SchemaCast { field, .. }) if field == "station_id"));

    let in_range = batch(vec![("station_id", Arc::new(Int64Array::from(vec![7, 5])) as ArrayRef)]);
    let out = normalize(&in_range, &target, &key(), &origin()).unwrap();
    assert_eq!(out.column(0).as_primitive::<Int32Type>().values().to_vec(), vec![7, 5]);
}

/// A source type with no conversion to the target type is a SchemaCast error.
#[test]
fn no_cast_path_is_an_error() {
    let list = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![Some(vec![Some(1), Some(2)])]);
    let input = batch(vec![("station_id", Arc::new(list) as ArrayRef)]);
    let err = normalize(&input, &small_schema(), &key(), &origin()).unwrap_err();
    assert!(matches!(dedup_error(&err), Some(DedupError::SchemaCast { field, .. }) if field == "station_id"));
}

/// Target schemas load from the JSON list form used by run files.
#[test]
fn target_schema_from_json() {
    let json = r#"[
        {"name": "station_id", "type": "int64"},
        {"name": "time_hour", "type": "timestamp[ms]"},
        {"name": "bikes", "type": "float64"},
        {"name": "temperature", "type": "float64"}
    ]"#;
    let parsed: TargetSchema = serde_json::from_str(json).unwrap();
    assert_eq!(parsed, small_schema());
    assert_eq!(parsed.arrow_schema(), small_schema().arrow_schema());

    let preset = TargetSchema::station_hourly();
    assert_eq!(preset.index_of("station_id"), Some(0));
    assert_eq!(preset.index_of("time_hour"), Some(1));
    preset.validate().unwrap();
}
