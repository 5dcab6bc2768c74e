//! Composition stage: pairs render and passthrough frames by timestamp
//!
//! The render stream sets the output cadence. In composite mode each render
//! frame is matched with the first passthrough frame that is no more than
//! the sync tolerance older than it; staler passthrough frames are recycled.
//! Every mode hands buffers between pools instead of copying pixels:
//!
//! ```text
//! output.free ──▶ render.free (or resized.free)
//! render.ready ──▶ output.ready
//! resized.ready ──▶ resized.free (after blending)
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, trace, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::pool::{BufferPool, Lease};
use crate::pipeline::session::Session;
use crate::pipeline::stats::bump;

/// Blends an overlay image onto a base image in place
pub trait Compositor: Send + Sync {
    fn compose(&self, overlay: &[u8], width: u32, height: u32, base: &mut [u8]) -> Result<()>;
}

/// Keeps opaque render pixels and shows the overlay through transparent
/// ones, weighting by the render alpha. Output is fully opaque.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlphaCompositor;

impl Compositor for AlphaCompositor {
    fn compose(&self, overlay: &[u8], width: u32, height: u32, base: &mut [u8]) -> Result<()> {
        let len = width as usize * height as usize * 4;
        if overlay.len() < len || base.len() < len {
            return Err(PipelineError::FrameSize {
                pool: "output",
                expected: len,
                actual: overlay.len().min(base.len()),
            });
        }

        for (dst, src) in base[..len]
            .chunks_exact_mut(4)
            .zip(overlay[..len].chunks_exact(4))
        {
            let a = dst[3] as u32;
            for c in 0..3 {
                dst[c] = ((dst[c] as u32 * a + src[c] as u32 * (255 - a) + 127) / 255) as u8;
            }
            dst[3] = 255;
        }
        Ok(())
    }
}

/// Decides whether a passthrough frame is too old to pair with a render frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPolicy {
    /// Seconds a passthrough frame may lag the render frame
    pub tolerance: f64,
}

impl SyncPolicy {
    /// Tolerance expressed in frame intervals at `fps`
    pub fn from_frames(frames: f64, fps: u32) -> Self {
        Self {
            tolerance: frames / fps as f64,
        }
    }

    pub fn is_stale(&self, render_time: f64, passthrough_time: f64) -> bool {
        render_time > passthrough_time + self.tolerance
    }
}

/// Where output frames come from
pub enum ComposeInputs {
    /// Render frames only
    Render { render: Arc<BufferPool> },
    /// Resized passthrough frames only
    Passthrough { resized: Arc<BufferPool> },
    /// Passthrough blended under render frames
    Composite {
        render: Arc<BufferPool>,
        resized: Arc<BufferPool>,
        compositor: Arc<dyn Compositor>,
        policy: SyncPolicy,
        width: u32,
        height: u32,
    },
}

pub struct ComposeStage {
    session: Arc<Session>,
    inputs: ComposeInputs,
    output: Arc<BufferPool>,
}

impl ComposeStage {
    pub fn new(session: Arc<Session>, inputs: ComposeInputs, output: Arc<BufferPool>) -> Self {
        Self {
            session,
            inputs,
            output,
        }
    }

    pub fn run(self) {
        info!("Compose stage started");
        while self.step() {}
        info!("Compose stage stopped");
    }

    /// Produce one output frame. Returns false once the session is cancelled.
    pub fn step(&self) -> bool {
        let Some(slot) = self.output.lease_free(&self.session) else {
            return false;
        };

        match &self.inputs {
            ComposeInputs::Render { render } => {
                let Some(frame) = render.lease_ready(&self.session) else {
                    return false;
                };
                self.swap(slot, frame);
            }
            ComposeInputs::Passthrough { resized } => {
                let Some(frame) = resized.lease_ready(&self.session) else {
                    return false;
                };
                self.swap(slot, frame);
            }
            ComposeInputs::Composite {
                render,
                resized,
                compositor,
                policy,
                width,
                height,
            } => {
                let Some(mut base) = render.lease_ready(&self.session) else {
                    return false;
                };
                let Some(partner) = self.find_partner(resized, policy, base.timestamp) else {
                    return false;
                };

                let start = Instant::now();
                if let Err(e) = compositor.compose(partner.data(), *width, *height, base.data_mut())
                {
                    warn!("Failed to compose frame: {}", e);
                    return true;
                }
                metrics::histogram!("compose_time_us").record(start.elapsed().as_micros() as f64);
                trace!(
                    render = base.timestamp,
                    passthrough = partner.timestamp,
                    "Composed frame"
                );

                drop(partner);
                self.swap(slot, base);
            }
        }
        true
    }

    /// Wait for the first passthrough frame recent enough for `render_time`,
    /// recycling the stale ones on the way
    fn find_partner(
        &self,
        resized: &Arc<BufferPool>,
        policy: &SyncPolicy,
        render_time: f64,
    ) -> Option<Lease> {
        loop {
            let candidate = resized.lease_ready(&self.session)?;
            if !policy.is_stale(render_time, candidate.timestamp) {
                return Some(candidate);
            }
            trace!(
                render = render_time,
                passthrough = candidate.timestamp,
                "Discarding stale passthrough frame"
            );
            bump(&self.session.stats().passthrough_stale);
            metrics::counter!("passthrough_frames_stale").increment(1);
        }
    }

    /// Publish `frame` as output and give the unused output slot to the
    /// pool `frame` came from
    fn swap(&self, slot: Lease, frame: Lease) {
        let source = Arc::clone(frame.home());
        let frame = frame.into_frame();

        let published = self.output.publish_ready(frame);
        // The slot moves even when publishing failed, the output pool kept the frame
        if let Err(e) = source.release_free(slot.into_frame()) {
            warn!("Failed to hand output slot to '{}': {}", source.name(), e);
            return;
        }
        if let Err(e) = published {
            warn!("Failed to publish output frame: {}", e);
            return;
        }

        bump(&self.session.stats().frames_composed);
        metrics::counter!("frames_composed").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Frame;
    use crate::pipeline::session::ManualClock;
    use std::thread;
    use std::time::{Duration, Instant};

    const W: u32 = 2;
    const H: u32 = 2;
    const LEN: usize = (W * H * 4) as usize;
    const FPS: u32 = 30;

    fn session() -> Arc<Session> {
        Arc::new(Session::new(
            Arc::new(ManualClock::new(0.0)),
            FPS,
            Duration::from_millis(1),
        ))
    }

    fn publish(pool: &BufferPool, timestamp: f64, fill: [u8; 4]) {
        let mut frame = pool.try_acquire_free().unwrap();
        frame.timestamp = timestamp;
        for px in frame.data_mut().chunks_exact_mut(4) {
            px.copy_from_slice(&fill);
        }
        pool.publish_ready(frame).unwrap();
    }

    struct Pools {
        render: Arc<BufferPool>,
        resized: Arc<BufferPool>,
        output: Arc<BufferPool>,
    }

    fn composite() -> (ComposeStage, Pools, Arc<Session>) {
        let session = session();
        let pools = Pools {
            render: Arc::new(BufferPool::new("render", LEN, 6)),
            resized: Arc::new(BufferPool::new("resized", LEN, 3)),
            output: Arc::new(BufferPool::new("output", LEN, 4)),
        };
        let stage = ComposeStage::new(
            Arc::clone(&session),
            ComposeInputs::Composite {
                render: Arc::clone(&pools.render),
                resized: Arc::clone(&pools.resized),
                compositor: Arc::new(AlphaCompositor),
                policy: SyncPolicy::from_frames(0.5, FPS),
                width: W,
                height: H,
            },
            Arc::clone(&pools.output),
        );
        (stage, pools, session)
    }

    #[test]
    fn test_alpha_compositor() {
        let overlay = [10, 20, 30, 255, 10, 20, 30, 255];
        let mut base = [200, 100, 50, 255, 200, 100, 50, 0];
        AlphaCompositor.compose(&overlay, 2, 1, &mut base).unwrap();
        assert_eq!(base, [200, 100, 50, 255, 10, 20, 30, 255]);
    }

    #[test]
    fn test_sync_policy() {
        let policy = SyncPolicy::from_frames(0.5, 10);
        assert!(policy.is_stale(1.0, 0.9));
        assert!(!policy.is_stale(1.0, 0.96));
        assert!(!policy.is_stale(1.0, 1.2));
    }

    #[test]
    fn test_most_recent_acceptable_partner() {
        let (stage, pools, _session) = composite();
        let t_r = 1.0;
        let interval = 1.0 / FPS as f64;

        publish(&pools.render, t_r, [0, 0, 0, 0]);
        publish(&pools.resized, t_r - interval, [1, 1, 1, 255]);
        publish(&pools.resized, t_r - 0.3 * interval, [2, 2, 2, 255]);
        publish(&pools.resized, t_r, [3, 3, 3, 255]);

        assert!(stage.step());

        // The transparent render frame shows its partner through
        let out = pools.output.try_acquire_ready().unwrap();
        assert_eq!(out.timestamp, t_r);
        assert!(out.data().chunks(4).all(|px| px == [2, 2, 2, 255]));

        // The stale frame was recycled, the newest one is still waiting
        let rest = pools.resized.try_acquire_ready().unwrap();
        assert_eq!(rest.timestamp, t_r);
        assert_eq!(pools.resized.free_len(), 2);
        assert_eq!(stage.session.stats().snapshot().passthrough_stale, 1);
    }

    #[test]
    fn test_composite_swap_keeps_pool_counts() {
        let (stage, pools, _session) = composite();
        publish(&pools.render, 0.5, [9, 9, 9, 255]);
        publish(&pools.resized, 0.5, [1, 1, 1, 255]);

        assert!(stage.step());

        let out = pools.output.try_acquire_ready().unwrap();
        assert!(out.data().chunks(4).all(|px| px == [9, 9, 9, 255]));
        // One output slot went to the render pool and one render frame came back
        assert_eq!(pools.output.free_len(), 3);
        assert_eq!(pools.render.free_len(), 6);
        assert_eq!(pools.resized.free_len(), 3);
        pools.output.release_free(out).unwrap();

        for pool in [&pools.render, &pools.resized, &pools.output] {
            assert!(pool.snapshot().is_whole());
        }
    }

    #[test]
    fn test_render_only_swap() {
        let session = session();
        let render = Arc::new(BufferPool::new("render", LEN, 2));
        let output = Arc::new(BufferPool::new("output", LEN, 2));
        let stage = ComposeStage::new(
            session,
            ComposeInputs::Render {
                render: Arc::clone(&render),
            },
            Arc::clone(&output),
        );

        publish(&render, 3.0, [7, 7, 7, 7]);
        assert!(stage.step());

        let out = output.try_acquire_ready().unwrap();
        assert_eq!(out.timestamp, 3.0);
        assert!(out.data().iter().all(|&b| b == 7));
        assert_eq!(render.free_len(), 2);
        assert_eq!(output.free_len(), 1);
    }

    #[test]
    fn test_failed_publish_keeps_source_pool_whole() {
        let session = session();
        let render = Arc::new(BufferPool::new("render", LEN, 1));
        let output = Arc::new(BufferPool::new("output", LEN, 1));
        // A stray frame fills the output ready group
        output.publish_ready(Frame::new(9, LEN)).unwrap();
        let stage = ComposeStage::new(
            Arc::clone(&session),
            ComposeInputs::Render {
                render: Arc::clone(&render),
            },
            Arc::clone(&output),
        );

        publish(&render, 1.0, [3, 3, 3, 3]);
        assert!(stage.step());

        assert!(render.snapshot().is_whole());
        assert_eq!(render.free_len(), 1);
        assert_eq!(output.free_len(), 1);
        assert_eq!(session.stats().snapshot().frames_composed, 0);
    }

    #[test]
    fn test_passthrough_only_swap() {
        let session = session();
        let resized = Arc::new(BufferPool::new("resized", LEN, 3));
        let output = Arc::new(BufferPool::new("output", LEN, 4));
        let stage = ComposeStage::new(
            session,
            ComposeInputs::Passthrough {
                resized: Arc::clone(&resized),
            },
            Arc::clone(&output),
        );

        publish(&resized, 0.1, [4, 4, 4, 255]);
        publish(&resized, 0.2, [5, 5, 5, 255]);
        assert!(stage.step());
        assert!(stage.step());

        assert_eq!(output.try_acquire_ready().unwrap().timestamp, 0.1);
        assert_eq!(output.try_acquire_ready().unwrap().timestamp, 0.2);
        assert_eq!(resized.free_len(), 3);
    }

    #[test]
    fn test_cancel_while_waiting_for_partner() {
        let (stage, pools, session) = composite();
        publish(&pools.render, 1.0, [0, 0, 0, 0]);
        publish(&pools.resized, 0.0, [1, 1, 1, 255]);

        let handle = thread::spawn(move || stage.step());
        thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        session.cancel();
        assert!(!handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_millis(500));

        // Render frame and output slot went home, stale frame was recycled
        assert_eq!(pools.render.free_len(), 6);
        assert_eq!(pools.output.free_len(), 4);
        assert_eq!(pools.resized.free_len(), 3);
    }
}
