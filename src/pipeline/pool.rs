//! Fixed-capacity frame exchange pool

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::error;

use crate::capture::frame::Frame;
use crate::error::{PipelineError, Result};
use crate::pipeline::session::Session;

/// Pool of `count` frames of `buffer_size` bytes, split into a free group and
/// a ready group.
///
/// All frames are allocated up front. Both groups are bounded queues of
/// capacity `count`, so a frame can always be returned to either group
/// without allocating. Acquires never block; [`BufferPool::acquire_free`] and
/// [`BufferPool::acquire_ready`] wrap them in a wait that gives up once the
/// session is cancelled.
pub struct BufferPool {
    name: &'static str,
    buffer_size: usize,
    count: usize,

    free_tx: Sender<Frame>,
    free_rx: Receiver<Frame>,
    ready_tx: Sender<Frame>,
    ready_rx: Receiver<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    published: AtomicUsize,
    recycled: AtomicUsize,
}

/// Occupancy of a pool at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub name: &'static str,
    pub count: usize,
    pub free: usize,
    pub ready: usize,
    pub published: usize,
    pub recycled: usize,
}

impl PoolSnapshot {
    /// Frames currently held by a thread outside both groups
    pub fn in_flight(&self) -> usize {
        self.count.saturating_sub(self.free + self.ready)
    }

    pub fn is_whole(&self) -> bool {
        self.free + self.ready == self.count
    }
}

impl BufferPool {
    pub fn new(name: &'static str, buffer_size: usize, count: usize) -> Self {
        let (free_tx, free_rx) = flume::bounded(count);
        let (ready_tx, ready_rx) = flume::bounded(count);

        for slot in 0..count {
            // Capacity is exactly `count`, the send cannot fail
            let _ = free_tx.try_send(Frame::new(slot as u32, buffer_size));
        }

        Self {
            name,
            buffer_size,
            count,
            free_tx,
            free_rx,
            ready_tx,
            ready_rx,
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Take a free frame if one is available
    pub fn try_acquire_free(&self) -> Option<Frame> {
        self.free_rx.try_recv().ok()
    }

    /// Take the oldest ready frame if one is available
    pub fn try_acquire_ready(&self) -> Option<Frame> {
        self.ready_rx.try_recv().ok()
    }

    /// Append a frame to the ready group.
    ///
    /// On overflow the frame is kept in the free group when there is room.
    pub fn publish_ready(&self, frame: Frame) -> Result<()> {
        self.check_size(&frame)?;
        if let Err(e) = self.ready_tx.try_send(frame) {
            if let Err(e) = self.free_tx.try_send(e.into_inner()) {
                self.lose(e.into_inner());
            }
            return Err(PipelineError::PoolOverflow(self.name));
        }
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Return a frame to the free group
    pub fn release_free(&self, frame: Frame) -> Result<()> {
        self.check_size(&frame)?;
        if let Err(e) = self.free_tx.try_send(frame) {
            // Both groups hold `count` frames only if one too many exists
            self.lose(e.into_inner());
            return Err(PipelineError::PoolOverflow(self.name));
        }
        self.stats.recycled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_ready_empty(&self) -> bool {
        self.ready_rx.is_empty()
    }

    pub fn free_len(&self) -> usize {
        self.free_rx.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready_rx.len()
    }

    /// Wait for a free frame until one arrives or the session is cancelled
    pub fn acquire_free(&self, session: &Session) -> Option<Frame> {
        wait_for(&self.free_rx, session)
    }

    /// Wait for a ready frame until one arrives or the session is cancelled
    pub fn acquire_ready(&self, session: &Session) -> Option<Frame> {
        wait_for(&self.ready_rx, session)
    }

    /// Like [`BufferPool::acquire_free`], returning a lease that goes back to
    /// this pool's free group unless it is handed off
    pub fn lease_free(self: &Arc<Self>, session: &Session) -> Option<Lease> {
        self.acquire_free(session).map(|frame| Lease::new(frame, self))
    }

    /// Like [`BufferPool::acquire_ready`], returning a lease that goes back to
    /// this pool's free group unless it is handed off
    pub fn lease_ready(self: &Arc<Self>, session: &Session) -> Option<Lease> {
        self.acquire_ready(session).map(|frame| Lease::new(frame, self))
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            name: self.name,
            count: self.count,
            free: self.free_len(),
            ready: self.ready_len(),
            published: self.stats.published.load(Ordering::Relaxed),
            recycled: self.stats.recycled.load(Ordering::Relaxed),
        }
    }

    fn check_size(&self, frame: &Frame) -> Result<()> {
        if frame.len() != self.buffer_size {
            return Err(PipelineError::FrameSize {
                pool: self.name,
                expected: self.buffer_size,
                actual: frame.len(),
            });
        }
        Ok(())
    }

    fn lose(&self, frame: Frame) {
        error!(
            "Pool '{}' is over capacity, releasing slot {} ({} bytes)",
            self.name,
            frame.slot,
            frame.len()
        );
    }
}

fn wait_for(rx: &Receiver<Frame>, session: &Session) -> Option<Frame> {
    loop {
        if !session.is_active() {
            return None;
        }
        match rx.recv_timeout(session.poll_interval()) {
            Ok(frame) => return Some(frame),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Frame held out of a pool by one thread.
///
/// Dropping the lease returns the frame to its home pool's free group, so a
/// stage that unwinds mid-iteration never loses a buffer. Use
/// [`Lease::into_frame`] to hand the frame to another group or pool.
pub struct Lease {
    frame: Option<Frame>,
    home: Arc<BufferPool>,
}

impl Lease {
    pub(crate) fn new(frame: Frame, home: &Arc<BufferPool>) -> Self {
        Self {
            frame: Some(frame),
            home: Arc::clone(home),
        }
    }

    pub fn into_frame(mut self) -> Frame {
        match self.frame.take() {
            Some(frame) => frame,
            // The frame is only taken here or in drop
            None => unreachable!("lease already released"),
        }
    }

    pub fn home(&self) -> &Arc<BufferPool> {
        &self.home
    }
}

impl Deref for Lease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("lease already released"),
        }
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Frame {
        match &mut self.frame {
            Some(frame) => frame,
            None => unreachable!("lease already released"),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            if let Err(e) = self.home.release_free(frame) {
                error!("Failed to return frame to pool: {}", e);
            }
        }
    }
}
