use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};

/// Cached memory watcher; refreshes at most every `REFRESH_EVERY`.
struct MemState {
    sys: System,
    last_check: Instant,
    total: u64,
    available: u64,
}

static STATE: OnceLock<Mutex<MemState>> = OnceLock::new();
const REFRESH_EVERY: Duration = Duration::from_millis(500);

/// Returns `(available_bytes, total_bytes)` from a recent sample.
fn snapshot() -> (u64, u64) {
    let m = STATE.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        let (total, available) = (sys.total_memory(), sys.available_memory());
        Mutex::new(MemState { sys, last_check: Instant::now(), total, available })
    });
    let mut st = m.lock();
    if st.last_check.elapsed() >= REFRESH_EVERY {
        st.sys.refresh_memory();
        st.total = st.sys.total_memory();
        st.available = st.sys.available_memory();
        st.last_check = Instant::now();
    }
    (st.available, st.total)
}

/// Bytes of RAM currently available to the process (0 if unknown).
pub fn available_memory_bytes() -> u64 {
    snapshot().0
}

/// Recent estimate of available / total memory (0.0..=1.0; 1.0 when unknown).
pub fn available_memory_fraction() -> f64 {
    let (avail, total) = snapshot();
    if total == 0 {
        return 1.0;
    }
    (avail as f64 / total as f64).clamp(0.0, 1.0)
}

pub fn is_low_memory(threshold: f64) -> bool {
    available_memory_fraction() < threshold
}

/// Cooperative backoff: yields briefly while under `threshold`.
pub fn maybe_throttle_low_memory(threshold: f64, backoff: Duration) {
    if is_low_memory(threshold) {
        std::thread::sleep(backoff);
    }
}
