use ahash::RandomState;
use anyhow::{Context, Result};
use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::DataType;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::row::{RowConverter, SortField};
use std::hash::{BuildHasher, Hash, Hasher};

/// Deterministic `hash(partition value) mod N`.
///
/// Values are first encoded with Arrow's row format, so the bucket depends only
/// on the value (and its declared type), never on which chunk or file it came
/// from. Nulls all land in one fixed bucket.
pub struct BucketHasher {
    state: RandomState,
    converter: RowConverter,
    buckets: usize,
}

impl BucketHasher {
    pub fn new(partition_type: &DataType, buckets: usize) -> Result<Self> {
        let converter = RowConverter::new(vec![SortField::new(partition_type.clone())])
            .with_context(|| format!("row encoding unsupported for partition type {partition_type}"))?;
        // Fixed seeds: the same value maps to the same bucket in every run.
        let state = RandomState::with_seeds(
            0x5eed_b0c4_e700_0001,
            0x0dd5_1dec_a5ca_de02,
            0xb1c7_e5a1_7ed0_9903,
            0x7a11_0c8a_11ab_1e04,
        );
        Ok(Self { state, converter, buckets: buckets.max(1) })
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// Bucket index for every row of `partition`, computed over the whole column.
    pub fn bucket_ids(&mut self, partition: &ArrayRef) -> Result<Vec<usize>> {
        if self.buckets == 1 {
            return Ok(vec![0; partition.len()]);
        }
        let rows = self
            .converter
            .convert_columns(std::slice::from_ref(partition))
            .context("encode partition column")?;
        let n = self.buckets as u64;
        Ok(rows
            .iter()
            .map(|row| {
                let mut h = self.state.build_hasher();
                row.as_ref().hash(&mut h);
                (h.finish() % n) as usize
            })
            .collect())
    }
}

/// Stable partition of row positions by bucket id: one index array per
/// non-empty bucket, ascending by bucket, rows in their original order.
pub fn partition_indices(bucket_ids: &[usize], buckets: usize) -> Vec<(usize, UInt32Array)> {
    let mut per_bucket: Vec<Vec<u32>> = vec![Vec::new(); buckets.max(1)];
    for (row, &b) in bucket_ids.iter().enumerate() {
        per_bucket[b].push(row as u32);
    }
    per_bucket
        .into_iter()
        .enumerate()
        .filter(|(_, rows)| !rows.is_empty())
        .map(|(b, rows)| (b, UInt32Array::from(rows)))
        .collect()
}

/// Gather `indices` from every column of `batch`, keeping its schema.
pub fn take_rows(batch: &RecordBatch, indices: &UInt32Array) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), indices, None))
        .collect::<Result<_, _>>()
        .context("gather rows")?;
    let opts = RecordBatchOptions::new().with_row_count(Some(indices.len()));
    RecordBatch::try_new_with_options(batch.schema(), columns, &opts).context("rebuild batch")
}
