//! Passthrough camera entry point

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capture::convert::PixelConverter;
use crate::capture::frame::{PixelFormat, RawFrame};
use crate::error::Result;
use crate::pipeline::pool::{BufferPool, Lease};
use crate::pipeline::session::Session;
use crate::pipeline::stats::bump;
use crate::CaptureBackpressure;

/// Camera sensors a source can stream from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Rgb,
    Tracking,
}

/// Callback a camera source pushes every raw frame into
pub type CameraSink = Arc<dyn Fn(RawFrame) + Send + Sync>;

/// Camera subsystem delivering frames at its own cadence
pub trait CameraSource: Send {
    /// Start streaming into `sink` until [`CameraSource::stop`]
    fn start(&mut self, sensor: SensorKind, fps: u32, sink: CameraSink) -> Result<()>;

    fn stop(&mut self);
}

/// Converts camera frames into the raw passthrough pool.
///
/// Runs on the camera's thread. With [`CaptureBackpressure::Wait`] the
/// callback holds the camera until a free buffer shows up or the session
/// ends; with [`CaptureBackpressure::Drop`] it gives up immediately.
pub struct CaptureStage {
    session: Arc<Session>,
    pool: Arc<BufferPool>,
    converter: Arc<dyn PixelConverter>,
    backpressure: CaptureBackpressure,
}

impl CaptureStage {
    pub fn new(
        session: Arc<Session>,
        pool: Arc<BufferPool>,
        converter: Arc<dyn PixelConverter>,
        backpressure: CaptureBackpressure,
    ) -> Self {
        Self {
            session,
            pool,
            converter,
            backpressure,
        }
    }

    /// Handle one camera event. Returns whether the frame entered the pipeline.
    pub fn on_frame(&self, raw: &RawFrame) -> bool {
        let frame_len = PixelFormat::Rgba32.frame_len(raw.width, raw.height);
        if frame_len != self.pool.buffer_size() {
            warn!(
                "Camera frame {}x{} does not match the passthrough buffer of {} bytes, dropping",
                raw.width,
                raw.height,
                self.pool.buffer_size()
            );
            bump(&self.session.stats().capture_rejected);
            metrics::counter!("capture_frames_rejected").increment(1);
            return false;
        }

        let lease = match self.backpressure {
            CaptureBackpressure::Wait => self.pool.lease_free(&self.session),
            CaptureBackpressure::Drop if self.session.is_active() => self
                .pool
                .try_acquire_free()
                .map(|frame| Lease::new(frame, &self.pool)),
            CaptureBackpressure::Drop => None,
        };

        let Some(mut lease) = lease else {
            if self.session.is_active() {
                bump(&self.session.stats().capture_dropped);
                metrics::counter!("capture_frames_dropped").increment(1);
                debug!("No free passthrough buffer, dropping camera frame");
            }
            return false;
        };

        if let Err(e) = self.converter.convert(
            raw.format,
            &raw.data,
            raw.width,
            raw.height,
            lease.data_mut(),
        ) {
            warn!("Failed to convert camera frame: {}", e);
            return false;
        }
        lease.timestamp = self.session.now();

        if let Err(e) = self.pool.publish_ready(lease.into_frame()) {
            warn!("Failed to publish camera frame: {}", e);
            return false;
        }

        bump(&self.session.stats().frames_captured);
        metrics::counter!("frames_captured").increment(1);
        true
    }
}

/// Routes camera callbacks to the capture stage of the current session.
///
/// The camera outlives recording sessions; between sessions frames are
/// ignored.
pub struct CaptureRouter {
    stage: ArcSwapOption<CaptureStage>,
}

impl CaptureRouter {
    pub fn new() -> Self {
        Self {
            stage: ArcSwapOption::empty(),
        }
    }

    pub fn sink(self: &Arc<Self>) -> CameraSink {
        let router = Arc::clone(self);
        Arc::new(move |raw| {
            router.dispatch(&raw);
        })
    }

    pub fn attach(&self, stage: Arc<CaptureStage>) {
        self.stage.store(Some(stage));
    }

    pub fn detach(&self) {
        self.stage.store(None);
    }

    pub fn dispatch(&self, raw: &RawFrame) -> bool {
        match self.stage.load_full() {
            Some(stage) => stage.on_frame(raw),
            None => false,
        }
    }
}

impl Default for CaptureRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::convert::SoftwareConverter;
    use crate::pipeline::session::ManualClock;
    use bytes::Bytes;
    use std::thread;
    use std::time::Duration;

    fn rgba(width: u32, height: u32, value: u8) -> RawFrame {
        RawFrame {
            data: Bytes::from(vec![value; (width * height * 4) as usize]),
            width,
            height,
            format: PixelFormat::Rgba32,
        }
    }

    fn stage(count: usize, backpressure: CaptureBackpressure) -> (CaptureStage, Arc<BufferPool>, Arc<ManualClock>, Arc<Session>) {
        let clock = Arc::new(ManualClock::new(2.5));
        let session = Arc::new(Session::new(clock.clone(), 30, Duration::from_millis(1)));
        let pool = Arc::new(BufferPool::new("raw", 16, count));
        let stage = CaptureStage::new(
            Arc::clone(&session),
            Arc::clone(&pool),
            Arc::new(SoftwareConverter),
            backpressure,
        );
        (stage, pool, clock, session)
    }

    #[test]
    fn test_frame_is_converted_and_stamped() {
        let (stage, pool, clock, _session) = stage(2, CaptureBackpressure::Wait);
        assert!(stage.on_frame(&rgba(2, 2, 9)));
        clock.advance(0.5);
        assert!(stage.on_frame(&rgba(2, 2, 10)));

        let first = pool.try_acquire_ready().unwrap();
        assert_eq!(first.timestamp, 2.5);
        assert!(first.data().iter().all(|&b| b == 9));
        let second = pool.try_acquire_ready().unwrap();
        assert_eq!(second.timestamp, 3.0);
    }

    #[test]
    fn test_drop_policy_counts_drops() {
        let (stage, pool, _clock, session) = stage(1, CaptureBackpressure::Drop);
        assert!(stage.on_frame(&rgba(2, 2, 1)));
        assert!(!stage.on_frame(&rgba(2, 2, 2)));
        assert_eq!(session.stats().snapshot().capture_dropped, 1);
        assert_eq!(pool.ready_len(), 1);
    }

    #[test]
    fn test_wait_policy_abandons_on_cancel() {
        let (stage, pool, _clock, session) = stage(1, CaptureBackpressure::Wait);
        assert!(stage.on_frame(&rgba(2, 2, 1)));

        let canceller = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                session.cancel();
            })
        };
        assert!(!stage.on_frame(&rgba(2, 2, 2)));
        canceller.join().unwrap();
        assert!(pool.snapshot().is_whole());
        assert_eq!(session.stats().snapshot().capture_dropped, 0);
    }

    #[test]
    fn test_bad_frame_returns_buffer() {
        let (stage, pool, _clock, _session) = stage(1, CaptureBackpressure::Wait);
        let mut raw = rgba(2, 2, 1);
        raw.data = Bytes::from_static(&[0u8; 3]);
        assert!(!stage.on_frame(&raw));
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn test_frame_of_other_geometry_is_rejected() {
        let (stage, pool, _clock, session) = stage(1, CaptureBackpressure::Wait);
        assert!(stage.on_frame(&rgba(2, 2, 7)));
        let frame = pool.try_acquire_ready().unwrap();
        pool.release_free(frame).unwrap();

        // 1x2 fits the first half of the 2x2 buffer only
        assert!(!stage.on_frame(&rgba(1, 2, 3)));
        assert!(!stage.on_frame(&rgba(4, 4, 3)));
        assert!(pool.is_ready_empty());
        assert_eq!(pool.free_len(), 1);

        let stats = session.stats().snapshot();
        assert_eq!(stats.capture_rejected, 2);
        assert_eq!(stats.frames_captured, 1);
    }

    #[test]
    fn test_router_ignores_frames_when_detached() {
        let (stage, pool, _clock, _session) = stage(2, CaptureBackpressure::Wait);
        let router = Arc::new(CaptureRouter::new());
        let sink = router.sink();

        sink(rgba(2, 2, 1));
        assert_eq!(pool.ready_len(), 0);

        router.attach(Arc::new(stage));
        sink(rgba(2, 2, 1));
        assert_eq!(pool.ready_len(), 1);

        router.detach();
        sink(rgba(2, 2, 1));
        assert_eq!(pool.ready_len(), 1);
    }
}
