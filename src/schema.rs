//! Target schema contract and the chunk normalizer.
//!
//! Every chunk leaving `normalize` has exactly the target columns, in target
//! order, typed as declared, with no schema or field metadata.

use crate::config::KeySpec;
use crate::error::DedupError;
use crate::input::ChunkOrigin;
use anyhow::{bail, Context, Result};
use arrow::array::{new_null_array, Array, ArrayRef, AsArray};
use arrow::compute::kernels::cast::{can_cast_types, cast_with_options, CastOptions};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Reserved column carrying the run-global ingestion sequence inside shard files.
pub const SEQ_COLUMN: &str = "__ingest_seq";

/// Closed set of column types a target schema may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "bool")]
    Boolean,
    #[serde(rename = "int8")]
    Int8,
    #[serde(rename = "int16")]
    Int16,
    #[serde(rename = "int32")]
    Int32,
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "uint32")]
    UInt32,
    #[serde(rename = "uint64")]
    UInt64,
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "float64")]
    Float64,
    #[serde(rename = "utf8")]
    Utf8,
    #[serde(rename = "date32")]
    Date32,
    #[serde(rename = "timestamp[s]")]
    TimestampSecond,
    #[serde(rename = "timestamp[ms]")]
    TimestampMillisecond,
    #[serde(rename = "timestamp[us]")]
    TimestampMicrosecond,
    #[serde(rename = "timestamp[ns]")]
    TimestampNanosecond,
}

impl FieldType {
    pub fn data_type(self) -> DataType {
        match self {
            FieldType::Boolean => DataType::Boolean,
            FieldType::Int8 => DataType::Int8,
            FieldType::Int16 => DataType::Int16,
            FieldType::Int32 => DataType::Int32,
            FieldType::Int64 => DataType::Int64,
            FieldType::UInt32 => DataType::UInt32,
            FieldType::UInt64 => DataType::UInt64,
            FieldType::Float32 => DataType::Float32,
            FieldType::Float64 => DataType::Float64,
            FieldType::Utf8 => DataType::Utf8,
            FieldType::Date32 => DataType::Date32,
            FieldType::TimestampSecond => DataType::Timestamp(TimeUnit::Second, None),
            FieldType::TimestampMillisecond => DataType::Timestamp(TimeUnit::Millisecond, None),
            FieldType::TimestampMicrosecond => DataType::Timestamp(TimeUnit::Microsecond, None),
            FieldType::TimestampNanosecond => DataType::Timestamp(TimeUnit::Nanosecond, None),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
}

impl TargetField {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self { name: name.into(), ty }
    }
}

/// Ordered, typed column contract. Serializes as a plain JSON list of
/// `{"name": .., "type": ..}` objects.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Vec<TargetField>", into = "Vec<TargetField>")]
pub struct TargetSchema {
    fields: Vec<TargetField>,
    arrow: SchemaRef,
}

impl From<Vec<TargetField>> for TargetSchema {
    fn from(fields: Vec<TargetField>) -> Self {
        Self::new(fields)
    }
}

impl From<TargetSchema> for Vec<TargetField> {
    fn from(s: TargetSchema) -> Self {
        s.fields
    }
}

impl PartialEq for TargetSchema {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl TargetSchema {
    pub fn new(fields: Vec<TargetField>) -> Self {
        // All columns are nullable: absent fields are synthesized as nulls.
        let arrow_fields: Vec<Field> = fields
            .iter()
            .map(|f| Field::new(f.name.clone(), f.ty.data_type(), true))
            .collect();
        let arrow = Arc::new(Schema::new(arrow_fields));
        Self { fields, arrow }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open schema {}", path.display()))?;
        let schema: TargetSchema = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("parse schema {}", path.display()))?;
        Ok(schema)
    }

    /// Hourly station table produced by the upstream gold build.
    pub fn station_hourly() -> Self {
        use FieldType::*;
        let f = TargetField::new;
        Self::new(vec![
            f("station_id", Int64),
            f("time_hour", TimestampMillisecond),
            f("bikes_available_mean", Float64),
            f("docks_available_mean", Float64),
            f("mechanical_mean", Float64),
            f("ebike_mean", Float64),
            f("obs_count", Int64),
            f("hour", Int32),
            f("dayofweek", Int32),
            f("month", Int32),
            f("date", Date32),
            f("is_weekend", Int8),
            f("is_holiday", Int8),
            f("temperature_2m", Float64),
            f("relative_humidity_2m", Float64),
            f("precipitation", Float64),
            f("wind_speed_10m", Float64),
            f("pressure_msl", Float64),
            f("lag_1h_bikes", Float64),
            f("lag_24h_bikes", Float64),
            f("roll3h_bikes_mean", Float64),
        ])
    }

    pub fn fields(&self) -> &[TargetField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Arrow view of the contract (metadata-free).
    pub fn arrow_schema(&self) -> SchemaRef {
        self.arrow.clone()
    }

    /// Shard-file layout: the target columns followed by the sequence column.
    pub fn with_sequence(&self) -> SchemaRef {
        let mut fields: Vec<Field> = self.arrow.fields().iter().map(|f| f.as_ref().clone()).collect();
        fields.push(Field::new(SEQ_COLUMN, DataType::UInt64, false));
        Arc::new(Schema::new(fields))
    }

    /// Structural checks that do not depend on the key.
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            bail!("target schema must declare at least one field");
        }
        let mut seen = HashSet::with_capacity(self.fields.len());
        for f in &self.fields {
            if f.name.is_empty() {
                bail!("target schema contains an empty field name");
            }
            if f.name == SEQ_COLUMN {
                bail!("field name `{SEQ_COLUMN}` is reserved");
            }
            if !seen.insert(f.name.as_str()) {
                bail!("duplicate field `{}` in target schema", f.name);
            }
        }
        Ok(())
    }
}

/// Conform `chunk` to `target`: cast present columns, synthesize absent ones as
/// nulls, drop extras, strip metadata. Key columns never lose values to a cast.
pub fn normalize(chunk: &RecordBatch, target: &TargetSchema, key: &KeySpec, origin: &ChunkOrigin) -> Result<RecordBatch> {
    let rows = chunk.num_rows();
    let input = chunk.schema();

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(target.len());
    for field in target.fields() {
        let to = field.ty.data_type();
        let col = match input.index_of(&field.name) {
            Ok(idx) => {
                let is_key = field.name == key.partition_field || field.name == key.time_field;
                cast_column(chunk.column(idx), &field.name, &to, is_key, origin)?
            }
            Err(_) => new_null_array(&to, rows),
        };
        columns.push(col);
    }

    let opts = RecordBatchOptions::new().with_row_count(Some(rows));
    RecordBatch::try_new_with_options(target.arrow_schema(), columns, &opts)
        .with_context(|| format!("assemble normalized chunk for {origin}"))
}

/// Non-strict cast: widening and lossy narrowing pass (out-of-range numbers
/// become null), but text that does not parse as the target type is rejected.
/// In a key column an out-of-range value is rejected too: a nulled key would
/// merge distinct keys during dedup.
fn cast_column(col: &ArrayRef, name: &str, to: &DataType, is_key: bool, origin: &ChunkOrigin) -> Result<ArrayRef> {
    let from = col.data_type();
    if from == to {
        return Ok(col.clone());
    }
    let cast_err = |reason: String| DedupError::SchemaCast {
        field: name.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        chunk: origin.to_string(),
        reason,
    };

    if !can_cast_types(from, to) {
        return Err(cast_err("no cast path between these types".into()).into());
    }
    let opts = CastOptions { safe: true, ..Default::default() };
    let out = cast_with_options(col.as_ref(), to, &opts).map_err(|e| cast_err(e.to_string()))?;

    if out.null_count() > col.null_count() {
        if let Some(bad) = first_unparsable_text(col, &out) {
            return Err(cast_err(format!("value {bad:?} is not a valid {to}")).into());
        }
        let lost = out.null_count() - col.null_count();
        if is_key && !is_text(from) {
            return Err(cast_err(format!("{lost} key value(s) out of range for {to}")).into());
        }
        tracing::warn!(field = name, chunk = %origin, lost, to = %to, "lossy cast nulled out-of-range values");
    }
    Ok(out)
}

fn is_text(t: &DataType) -> bool {
    matches!(t, DataType::Utf8 | DataType::LargeUtf8)
}

/// For text sources, the first non-blank value the cast turned into null.
fn first_unparsable_text(src: &ArrayRef, out: &ArrayRef) -> Option<String> {
    let nulled = (0..src.len()).filter(|&i| src.is_valid(i) && out.is_null(i));
    match src.data_type() {
        DataType::Utf8 => {
            let s = src.as_string::<i32>();
            nulled.map(|i| s.value(i)).find(|v| !v.trim().is_empty()).map(str::to_string)
        }
        DataType::LargeUtf8 => {
            let s = src.as_string::<i64>();
            nulled.map(|i| s.value(i)).find(|v| !v.trim().is_empty()).map(str::to_string)
        }
        _ => None,
    }
}
