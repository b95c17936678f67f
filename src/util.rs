use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

static INIT_ONCE: std::sync::Once = std::sync::Once::new();

/// Install an env-filtered fmt subscriber (`RUST_LOG`, default `info`). Idempotent.
pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

// -------- file ops with backoff (AV scanners, sharing violations, flaky NAS) --------

const TRIES: usize = 16;
const DELAY_MS: u64 = 50;

/// Transient OS errors worth retrying. The codes are the Windows ones seen
/// with filter drivers and network volumes; elsewhere only `Interrupted`.
fn is_retriable_io_error(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::Interrupted {
        return true;
    }
    // 5 access denied, 21 not ready, 32 sharing, 33 lock, 225 AV block,
    // 433 no device, 1006 volume altered, 1117 device I/O, 1224 mapped section
    matches!(e.raw_os_error(), Some(5 | 21 | 32 | 33 | 225 | 433 | 1006 | 1117 | 1224))
}

/// Run `op` until it succeeds, fails with a non-retriable error, or `tries` is spent.
/// Delay grows linearly with the attempt number.
fn with_backoff<T>(tries: usize, delay_ms: u64, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let tries = tries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < tries && is_retriable_io_error(&e) => {
                sleep(Duration::from_millis(delay_ms.saturating_mul(attempt as u64)));
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn open_with_backoff(path: &Path) -> io::Result<File> {
    with_backoff(TRIES, DELAY_MS, || File::open(path))
}

pub fn create_with_backoff(path: &Path) -> io::Result<File> {
    with_backoff(TRIES, DELAY_MS, || File::create(path))
}

/// Remove a file; a missing file counts as success.
pub fn remove_with_backoff(path: &Path) -> Result<()> {
    with_backoff(TRIES, DELAY_MS, || match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
    .with_context(|| format!("remove {}", path.display()))
}

/// Promote `tmp` to `dest`, replacing any existing file. Falls back to
/// copy+remove when rename is refused (cross-device, sharing).
pub fn replace_file_atomic_backoff(tmp: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        remove_with_backoff(dest)?;
    }
    if with_backoff(20, DELAY_MS, || fs::rename(tmp, dest)).is_ok() {
        return Ok(());
    }
    with_backoff(20, DELAY_MS, || fs::copy(tmp, dest))
        .with_context(|| format!("copy {} -> {}", tmp.display(), dest.display()))?;
    remove_with_backoff(tmp)
}
