//! Test-pattern renderer with a background readback worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use flume::{Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::render::readback::{ReadbackCallback, ReadbackRequest, Renderer};

/// Readbacks queued behind the one being drawn
const QUEUE_DEPTH: usize = 4;

struct Job {
    request: ReadbackRequest,
    on_complete: ReadbackCallback,
    sequence: u64,
}

/// Renders a moving opaque square on a transparent background.
///
/// Readbacks complete on a dedicated worker thread, the same way a GPU
/// driver completes them off the render thread.
pub struct SyntheticRenderer {
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    sequence: AtomicU64,
}

impl SyntheticRenderer {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded::<Job>(QUEUE_DEPTH);

        let worker = thread::Builder::new()
            .name("readback".into())
            .spawn(move || {
                let mut pixels = Vec::new();
                while let Ok(job) = rx.recv() {
                    draw_pattern(&job.request, job.sequence, &mut pixels);
                    (job.on_complete)(&pixels);
                }
                debug!("Readback worker exiting");
            })
            .ok();

        if worker.is_none() {
            info!("Readback worker could not be spawned, async readback disabled");
        }

        Self {
            jobs: worker.as_ref().map(|_| tx),
            worker,
            sequence: AtomicU64::new(0),
        }
    }
}

impl Default for SyntheticRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for SyntheticRenderer {
    fn supports_async_readback(&self) -> bool {
        self.jobs.is_some()
    }

    fn request_readback(&self, request: ReadbackRequest, on_complete: ReadbackCallback) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        match jobs.try_send(Job {
            request,
            on_complete,
            sequence,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Readback queue full, dropping request {}", sequence);
            }
            Err(TrySendError::Disconnected(_)) => debug!("Readback worker gone"),
        }
    }
}

impl Drop for SyntheticRenderer {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn draw_pattern(request: &ReadbackRequest, sequence: u64, pixels: &mut Vec<u8>) {
    let (w, h) = (request.width as usize, request.height as usize);
    pixels.clear();
    pixels.resize(w * h * 4, 0);

    let side = (w.min(h) / 4).max(1);
    let x0 = (sequence as usize * 8) % w.max(1);
    let y0 = h.saturating_sub(side) / 2;

    for y in y0..(y0 + side).min(h) {
        for x in x0..(x0 + side).min(w) {
            let i = (y * w + x) * 4;
            pixels[i..i + 4].copy_from_slice(&[255, (sequence % 256) as u8, 64, 255]);
        }
    }
}
