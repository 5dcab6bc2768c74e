use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Local};
use tracing::{debug, warn};

/// Output file for a session started at `started`
pub fn session_output_path(dir: &Path, started: DateTime<Local>, extension: &str) -> PathBuf {
    dir.join(format!(
        "video_{}.{}",
        started.format("%Y-%m-%d_%H-%M-%S"),
        extension
    ))
}

static NEXT_CORE: AtomicUsize = AtomicUsize::new(0);

/// Pin the calling stage thread to the next core, round-robin
pub fn pin_current_thread(stage: &str) {
    let Some(cores) = core_affinity::get_core_ids().filter(|ids| !ids.is_empty()) else {
        warn!("Could not query CPU cores, {} thread left unpinned", stage);
        return;
    };

    let core = cores[NEXT_CORE.fetch_add(1, Ordering::Relaxed) % cores.len()];
    if core_affinity::set_for_current(core) {
        debug!("Pinned {} thread to core {}", stage, core.id);
    } else {
        warn!("Failed to pin {} thread to core {}", stage, core.id);
    }
}
