//! Per-session pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use serde::Serialize;

/// Counters shared by every stage of a session.
///
/// Each stage writes its own counters, so padding keeps them off each other's
/// cache lines.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub(crate) frames_captured: CachePadded<AtomicU64>,
    pub(crate) capture_dropped: CachePadded<AtomicU64>,
    pub(crate) capture_rejected: CachePadded<AtomicU64>,
    pub(crate) frames_resized: CachePadded<AtomicU64>,
    pub(crate) readbacks_requested: CachePadded<AtomicU64>,
    pub(crate) render_frames: CachePadded<AtomicU64>,
    pub(crate) render_dropped: CachePadded<AtomicU64>,
    pub(crate) frames_composed: CachePadded<AtomicU64>,
    pub(crate) passthrough_stale: CachePadded<AtomicU64>,
    pub(crate) frames_encoded: CachePadded<AtomicU64>,
    pub(crate) encode_rejected: CachePadded<AtomicU64>,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub capture_dropped: u64,
    /// Camera frames whose geometry does not match the passthrough buffers
    pub capture_rejected: u64,
    pub frames_resized: u64,
    pub readbacks_requested: u64,
    pub render_frames: u64,
    pub render_dropped: u64,
    pub frames_composed: u64,
    pub passthrough_stale: u64,
    pub frames_encoded: u64,
    pub encode_rejected: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &CachePadded<AtomicU64>| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: load(&self.frames_captured),
            capture_dropped: load(&self.capture_dropped),
            capture_rejected: load(&self.capture_rejected),
            frames_resized: load(&self.frames_resized),
            readbacks_requested: load(&self.readbacks_requested),
            render_frames: load(&self.render_frames),
            render_dropped: load(&self.render_dropped),
            frames_composed: load(&self.frames_composed),
            passthrough_stale: load(&self.passthrough_stale),
            frames_encoded: load(&self.frames_encoded),
            encode_rejected: load(&self.encode_rejected),
        }
    }
}
