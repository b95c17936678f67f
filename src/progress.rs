//! Progress reporting: thin wrapper over `indicatif` bars that can be switched off.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Optional global MultiProgress so concurrent bars render together.
static GLOBAL_MP: OnceLock<Arc<MultiProgress>> = OnceLock::new();

/// Install a global MultiProgress used by subsequently created bars. First call wins.
pub fn set_global_multiprogress(mp: Arc<MultiProgress>) {
    let _ = GLOBAL_MP.set(mp);
}

fn new_bar(total: u64) -> ProgressBar {
    if let Some(mp) = GLOBAL_MP.get() {
        mp.add(ProgressBar::new(total))
    } else {
        ProgressBar::new(total)
    }
}

fn styled(pb: &ProgressBar, template: &str) {
    let style = ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
}

/// Either a live bar or a no-op when progress is disabled.
/// - `rows(..)` counts rows (routing pass)
/// - `count(..)` counts items (shards)
pub struct ProgressScope {
    pb: ProgressBar,
}

impl ProgressScope {
    pub fn rows<T: Into<String>>(label: T, total_rows: u64, enabled: bool) -> Self {
        Self::build(
            label,
            total_rows,
            enabled,
            "{spinner:.green} {msg} {human_pos:>12}/{human_len:<12} [{bar:.cyan/blue}] {percent:>3}%  \
             rows/s: {per_sec}  elapsed: {elapsed_precise}  eta: {eta_precise}",
        )
    }

    pub fn count<T: Into<String>>(label: T, total: u64, enabled: bool) -> Self {
        Self::build(
            label,
            total,
            enabled,
            "{spinner:.green} {msg} {pos}/{len} [{bar:.cyan/blue}] {percent:>3}%  \
             elapsed: {elapsed_precise}  eta: {eta_precise}",
        )
    }

    fn build<T: Into<String>>(label: T, total: u64, enabled: bool, template: &str) -> Self {
        if !enabled {
            return Self { pb: ProgressBar::hidden() };
        }
        let pb = new_bar(total);
        styled(&pb, template);
        let label = label.into();
        if !label.is_empty() {
            pb.set_message(label);
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    #[inline]
    pub fn inc(&self, delta: u64) {
        self.pb.inc(delta);
    }

    pub fn finish<T: Into<String>>(&self, msg: T) {
        self.pb.finish_with_message(msg.into());
    }
}
