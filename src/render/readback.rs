//! Rate-limited render readback stage

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::capture::frame::PixelFormat;
use crate::pipeline::pool::BufferPool;
use crate::pipeline::session::Session;
use crate::pipeline::stats::bump;

/// One asynchronous image readback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadbackRequest {
    pub camera: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Invoked once with the read-back pixels, on whatever thread the renderer
/// completes on
pub type ReadbackCallback = Box<dyn FnOnce(&[u8]) + Send>;

/// Renderer able to read rendered images back asynchronously
pub trait Renderer: Send + Sync {
    /// Queried once per session before the render stage is created
    fn supports_async_readback(&self) -> bool;

    fn request_readback(&self, request: ReadbackRequest, on_complete: ReadbackCallback);
}

/// Requests one readback per accepted host tick and publishes the results
/// into the render pool.
///
/// At most one readback per render buffer is outstanding. Ticks beyond that
/// are dropped, so a stalled consumer never grows the renderer's queue.
pub struct RenderCaptureStage {
    session: Arc<Session>,
    pool: Arc<BufferPool>,
    renderer: Arc<dyn Renderer>,
    request: ReadbackRequest,
    last_tick: f64,
    pending: Arc<AtomicUsize>,
}

/// Counts one outstanding readback until its callback runs or is dropped
struct PendingReadback(Arc<AtomicUsize>);

impl Drop for PendingReadback {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RenderCaptureStage {
    pub fn new(
        session: Arc<Session>,
        pool: Arc<BufferPool>,
        renderer: Arc<dyn Renderer>,
        request: ReadbackRequest,
    ) -> Self {
        // Accept the very first tick
        let last_tick = session.now() - 2.0 * session.frame_interval();
        Self {
            session,
            pool,
            renderer,
            request,
            last_tick,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Readbacks requested but not yet completed
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Called once per host render tick. Returns whether a readback was
    /// requested; ticks closer than one frame interval are skipped.
    #[instrument(level = "trace", skip(self))]
    pub fn tick(&mut self) -> bool {
        if !self.session.is_active() {
            return false;
        }
        let now = self.session.now();
        if now - self.last_tick < self.session.frame_interval() {
            return false;
        }
        self.last_tick = now;

        if self.pending() >= self.pool.count() {
            debug!("{} readbacks outstanding, dropping render tick", self.pending());
            bump(&self.session.stats().render_dropped);
            metrics::counter!("render_ticks_dropped").increment(1);
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingReadback(Arc::clone(&self.pending));

        bump(&self.session.stats().readbacks_requested);
        let session = Arc::clone(&self.session);
        let pool = Arc::clone(&self.pool);
        self.renderer.request_readback(
            self.request.clone(),
            Box::new(move |pixels| {
                complete_readback(&session, &pool, pixels, now);
                drop(guard);
            }),
        );
        true
    }
}

/// Copy a finished readback into the render pool, stamped with the tick time
fn complete_readback(session: &Session, pool: &Arc<BufferPool>, pixels: &[u8], timestamp: f64) {
    let Some(mut lease) = pool.lease_free(session) else {
        debug!("Session ended before a render buffer was free, dropping readback");
        bump(&session.stats().render_dropped);
        return;
    };

    if pixels.len() != lease.len() {
        warn!(
            "Readback of {} bytes does not match render buffer of {} bytes",
            pixels.len(),
            lease.len()
        );
        bump(&session.stats().render_dropped);
        return;
    }

    lease.data_mut().copy_from_slice(pixels);
    lease.timestamp = timestamp;

    match pool.publish_ready(lease.into_frame()) {
        Ok(()) => bump(&session.stats().render_frames),
        Err(e) => warn!("Failed to publish render frame: {}", e),
    }
}
