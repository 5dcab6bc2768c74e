//! Synthetic camera that streams a moving NV12 gradient

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{info, instrument};

use crate::capture::camera::{CameraSink, CameraSource, SensorKind};
use crate::capture::frame::{PixelFormat, RawFrame};
use crate::error::{PipelineError, Result};

/// Camera source backed by a generator thread
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl CameraSource for SyntheticCamera {
    #[instrument(skip(self, sink))]
    fn start(&mut self, sensor: SensorKind, fps: u32, sink: CameraSink) -> Result<()> {
        if self.thread.is_some() {
            return Err(PipelineError::Camera("camera already started".into()));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(PipelineError::Camera(format!(
                "NV12 needs even dimensions, got {}x{}",
                self.width, self.height
            )));
        }

        self.stop_flag.store(false, Ordering::Release);
        let stop_flag = Arc::clone(&self.stop_flag);
        let (width, height) = (self.width, self.height);
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);

        let thread = thread::Builder::new()
            .name("camera".into())
            .spawn(move || {
                let mut sequence = 0u64;
                let mut next = Instant::now();
                while !stop_flag.load(Ordering::Acquire) {
                    sink(RawFrame {
                        data: gradient(width, height, sequence),
                        width,
                        height,
                        format: PixelFormat::Nv12,
                    });
                    sequence += 1;

                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        // Fell behind, keep the cadence from here
                        next = now;
                    }
                }
            })
            .map_err(|e| PipelineError::Camera(e.to_string()))?;

        info!("Synthetic camera started: {}x{} @ {} fps", width, height, fps);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("Synthetic camera stopped");
        }
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Horizontal luma ramp scrolling one column per frame, neutral chroma
fn gradient(width: u32, height: u32, sequence: u64) -> Bytes {
    let (w, h) = (width as usize, height as usize);
    let mut buf = Vec::with_capacity(PixelFormat::Nv12.frame_len(width, height));
    for _ in 0..h {
        buf.extend((0..w).map(|x| (16 + (x + sequence as usize) * 219 / w.max(1) % 220) as u8));
    }
    buf.resize(w * h + w * h / 2, 128);
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pushes_frames_until_stopped() {
        let (tx, rx) = flume::unbounded();
        let mut camera = SyntheticCamera::new(8, 4);
        camera
            .start(
                SensorKind::Rgb,
                200,
                Arc::new(move |raw: RawFrame| {
                    let _ = tx.send(raw);
                }),
            )
            .unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.format, PixelFormat::Nv12);
        assert_eq!(frame.data.len(), 8 * 4 * 3 / 2);

        camera.stop();
        let drained = rx.drain().count();
        thread::sleep(Duration::from_millis(20));
        assert!(rx.is_empty(), "frames after stop (drained {})", drained);
    }

    #[test]
    fn test_odd_dimensions_fail_to_start() {
        let mut camera = SyntheticCamera::new(3, 4);
        let result = camera.start(SensorKind::Rgb, 30, Arc::new(|_: RawFrame| {}));
        assert!(matches!(result, Err(PipelineError::Camera(_))));
    }
}
