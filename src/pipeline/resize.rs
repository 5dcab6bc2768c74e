//! Passthrough downsampling stage

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::pool::BufferPool;
use crate::pipeline::session::Session;
use crate::pipeline::stats::bump;

/// Image resize kernel
pub trait Resizer: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn resize(
        &self,
        src: &[u8],
        src_width: u32,
        src_height: u32,
        channels: u32,
        dst_width: u32,
        dst_height: u32,
        dst: &mut [u8],
    ) -> Result<()>;
}

/// Nearest-neighbour sampling, no filtering
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestResizer;

impl Resizer for NearestResizer {
    fn resize(
        &self,
        src: &[u8],
        src_width: u32,
        src_height: u32,
        channels: u32,
        dst_width: u32,
        dst_height: u32,
        dst: &mut [u8],
    ) -> Result<()> {
        let ch = channels as usize;
        let (sw, sh) = (src_width as usize, src_height as usize);
        let (dw, dh) = (dst_width as usize, dst_height as usize);

        if src.len() < sw * sh * ch {
            return Err(PipelineError::FrameSize {
                pool: "passthrough_rgba",
                expected: sw * sh * ch,
                actual: src.len(),
            });
        }
        if dst.len() < dw * dh * ch {
            return Err(PipelineError::FrameSize {
                pool: "passthrough_resized",
                expected: dw * dh * ch,
                actual: dst.len(),
            });
        }

        for dy in 0..dh {
            let sy = dy * sh / dh;
            let src_row = &src[sy * sw * ch..(sy + 1) * sw * ch];
            let dst_row = &mut dst[dy * dw * ch..(dy + 1) * dw * ch];
            for (dx, px) in dst_row.chunks_exact_mut(ch).enumerate() {
                let sx = dx * sw / dw;
                px.copy_from_slice(&src_row[sx * ch..(sx + 1) * ch]);
            }
        }
        Ok(())
    }
}

/// Dimensions of one resize pass
#[derive(Debug, Clone, Copy)]
pub struct ResizeGeometry {
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub channels: u32,
}

/// Moves frames from the raw passthrough pool into the resized pool
pub struct ResizeStage {
    session: Arc<Session>,
    raw: Arc<BufferPool>,
    resized: Arc<BufferPool>,
    resizer: Arc<dyn Resizer>,
    geometry: ResizeGeometry,
}

impl ResizeStage {
    pub fn new(
        session: Arc<Session>,
        raw: Arc<BufferPool>,
        resized: Arc<BufferPool>,
        resizer: Arc<dyn Resizer>,
        geometry: ResizeGeometry,
    ) -> Self {
        Self {
            session,
            raw,
            resized,
            resizer,
            geometry,
        }
    }

    pub fn run(self) {
        info!(
            "Resize stage started: {}x{} -> {}x{}",
            self.geometry.src_width,
            self.geometry.src_height,
            self.geometry.dst_width,
            self.geometry.dst_height
        );
        while self.step() {}
        info!("Resize stage stopped");
    }

    /// One resize iteration. Returns false once the session is cancelled.
    pub fn step(&self) -> bool {
        let Some(raw) = self.raw.lease_ready(&self.session) else {
            return false;
        };
        let Some(mut out) = self.resized.lease_free(&self.session) else {
            return false;
        };

        let g = self.geometry;
        if let Err(e) = self.resizer.resize(
            raw.data(),
            g.src_width,
            g.src_height,
            g.channels,
            g.dst_width,
            g.dst_height,
            out.data_mut(),
        ) {
            warn!("Failed to resize passthrough frame: {}", e);
            return true;
        }
        out.timestamp = raw.timestamp;

        if let Err(e) = self.resized.publish_ready(out.into_frame()) {
            warn!("Failed to publish resized frame: {}", e);
        } else {
            bump(&self.session.stats().frames_resized);
        }
        drop(raw);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::session::ManualClock;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_nearest_downsample() {
        // 4x4 single channel, value = y * 4 + x
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 4];
        NearestResizer.resize(&src, 4, 4, 1, 2, 2, &mut dst).unwrap();
        assert_eq!(dst, vec![0, 2, 8, 10]);
    }

    #[test]
    fn test_nearest_keeps_channels_together() {
        let src = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = vec![0u8; 4];
        NearestResizer.resize(&src, 2, 1, 4, 1, 1, &mut dst).unwrap();
        assert_eq!(dst, vec![1, 2, 3, 4]);
    }

    fn stage() -> (ResizeStage, Arc<BufferPool>, Arc<BufferPool>, Arc<Session>) {
        let session = Arc::new(Session::new(
            Arc::new(ManualClock::new(0.0)),
            30,
            Duration::from_millis(1),
        ));
        let raw = Arc::new(BufferPool::new("raw", 4 * 4 * 4, 3));
        let resized = Arc::new(BufferPool::new("resized", 2 * 2 * 4, 3));
        let stage = ResizeStage::new(
            Arc::clone(&session),
            Arc::clone(&raw),
            Arc::clone(&resized),
            Arc::new(NearestResizer),
            ResizeGeometry {
                src_width: 4,
                src_height: 4,
                dst_width: 2,
                dst_height: 2,
                channels: 4,
            },
        );
        (stage, raw, resized, session)
    }

    #[test]
    fn test_step_propagates_timestamp_and_recycles_raw() {
        let (stage, raw, resized, _session) = stage();
        let mut frame = raw.try_acquire_free().unwrap();
        frame.timestamp = 1.25;
        frame.data_mut().fill(42);
        raw.publish_ready(frame).unwrap();

        assert!(stage.step());

        let out = resized.try_acquire_ready().unwrap();
        assert_eq!(out.timestamp, 1.25);
        assert!(out.data().iter().all(|&b| b == 42));
        assert_eq!(raw.free_len(), 3);
    }

    #[test]
    fn test_run_exits_when_starved() {
        let (stage, raw, resized, session) = stage();
        let handle = thread::spawn(move || stage.run());

        thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        session.cancel();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(raw.snapshot().is_whole());
        assert!(resized.snapshot().is_whole());
    }

    #[test]
    fn test_cancel_while_output_exhausted_returns_raw() {
        let (stage, raw, resized, session) = stage();
        let held: Vec<_> = (0..3).map(|_| resized.try_acquire_free().unwrap()).collect();
        let frame = raw.try_acquire_free().unwrap();
        raw.publish_ready(frame).unwrap();

        let handle = thread::spawn(move || stage.step());
        thread::sleep(Duration::from_millis(10));
        session.cancel();
        assert!(!handle.join().unwrap());
        assert!(raw.snapshot().is_whole());
        assert_eq!(raw.free_len(), 3);
        drop(held);
    }
}
