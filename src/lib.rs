mod config;
mod error;
mod input;
mod mem;
mod parquet_io;
mod progress;
mod schema;
mod util;

mod bucketing;
mod shard;
mod router;
mod dedupe;
mod reassemble;
mod pipeline;

pub use crate::config::{default_input_pattern, Compression, DedupOptions, KeySpec, RunConfig};
pub use crate::error::DedupError;
pub use crate::pipeline::{run_config, BucketDedup, RouteSummary, RunSummary};

// Schema normalizer and the run's fixed target schema.
pub use crate::schema::{normalize, FieldType, TargetField, TargetSchema, SEQ_COLUMN};

// Input discovery and chunked reading.
pub use crate::input::{count_input_rows, discover_inputs, ChunkOrigin, ChunkReader, SourceChunk};

// The individual passes, for callers that drive them separately.
pub use crate::bucketing::BucketHasher;
pub use crate::shard::{clean_intermediate, dedup_shard_path, shard_path, ShardFile, ShardWriters};
pub use crate::router::{route, RouteStats, Router};
pub use crate::dedupe::{dedup_all, dedup_shard, first_per_key, ShardDedupStats};
pub use crate::reassemble::{merge, suspect_report_path, ConsistencyChecker, ConsistencyReport, MergeReport};

// Expose multiprogress and progress helpers.
pub use crate::progress::{set_global_multiprogress, ProgressScope};

// Expose memory helpers for adaptive throttling from the binary.
pub use crate::mem::{available_memory_bytes, available_memory_fraction, is_low_memory};

//export robust file ops from util so binaries can import from crate root.
pub use crate::util::{init_tracing_once, open_with_backoff, create_with_backoff, remove_with_backoff, replace_file_atomic_backoff};
