use anyhow::{Context, Result};
use bucket_dedup::{default_input_pattern, init_tracing_once, run_config, set_global_multiprogress, DedupOptions, RunConfig};
use indicatif::MultiProgress;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

const DATA_ROOT: &str = "./data/parts";
const OUTPUT: &str = "./data/gold.parquet";
const WORK_ROOT: &str = "./dedup_work";

/// Without a run file, fall back to `DEDUP_*` variables and the station-hourly preset.
fn config_from_env() -> Result<RunConfig> {
    let var = |k: &str, default: &str| env::var(k).unwrap_or_else(|_| default.to_string());
    let buckets: usize = var("DEDUP_BUCKETS", "64")
        .parse()
        .context("DEDUP_BUCKETS must be a positive integer")?;
    let hw = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(8);

    Ok(RunConfig {
        input_dir: PathBuf::from(var("DEDUP_INPUT_DIR", DATA_ROOT)),
        input_pattern: default_input_pattern(),
        output: PathBuf::from(var("DEDUP_OUTPUT", OUTPUT)),
        target_schema_file: None,
        options: DedupOptions::default()
            .with_bucket_count(buckets)
            .with_intermediate_dir(var("DEDUP_WORK_DIR", WORK_ROOT))
            .with_parallelism(hw),
    })
}

fn main() -> Result<()> {
    init_tracing_once();
    set_global_multiprogress(Arc::new(MultiProgress::new()));

    let cfg = match env::args_os().nth(1) {
        Some(path) => RunConfig::from_json_file(&PathBuf::from(path))?,
        None => config_from_env()?,
    };

    let summary = run_config(&cfg)?;
    println!(
        "{} rows in, {} rows out ({} duplicates removed) across {} buckets -> {}",
        summary.rows_in,
        summary.rows_out,
        summary.removed,
        summary.buckets_used,
        summary.output.display()
    );
    if summary.suspect {
        eprintln!("warning: consistency check failed; see {}.suspect.json", summary.output.display());
    }
    Ok(())
}
