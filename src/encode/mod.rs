//! Encoder stage and encoder backends

#[cfg(feature = "gstreamer-encoder")]
pub mod gst;
pub mod raw;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::pool::BufferPool;
use crate::pipeline::session::Session;
use crate::pipeline::stats::bump;

#[cfg(feature = "gstreamer-encoder")]
pub use gst::GstEncoder;
pub use raw::RawFileEncoder;

/// Video encoder fed one RGBA frame at a time.
///
/// Called as `init`, `prepare`, any number of `write_frame`/`drain`, then
/// `finalize`, once per session and always from one thread at a time.
pub trait VideoEncoder: Send {
    fn init(&mut self, path: &Path, fps: u32, height: u32, width: u32) -> Result<()>;

    fn prepare(&mut self) -> Result<()>;

    /// Encode one frame. `data` stays valid and unmodified for the call.
    fn write_frame(&mut self, height: u32, width: u32, data: &[u8]) -> bool;

    /// Move pending encoder output to the file
    fn drain(&mut self, end_of_stream: bool);

    /// Drain to end of stream and release the output file
    fn finalize(&mut self) -> Result<()>;

    /// File extension of the produced media
    fn extension(&self) -> &'static str {
        "mp4"
    }
}

/// Hands every composed frame to the encoder exactly once
pub struct EncodeStage {
    session: Arc<Session>,
    output: Arc<BufferPool>,
    encoder: Box<dyn VideoEncoder>,
    width: u32,
    height: u32,
}

impl EncodeStage {
    pub fn new(
        session: Arc<Session>,
        output: Arc<BufferPool>,
        encoder: Box<dyn VideoEncoder>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            session,
            output,
            encoder,
            width,
            height,
        }
    }

    /// Encode until the session ends, then give the encoder back so the
    /// controller can finalize it
    pub fn run(mut self) -> Box<dyn VideoEncoder> {
        info!("Encode stage started");
        while self.step() {}
        info!("Encode stage stopped");
        self.encoder
    }

    /// Encode one frame. Returns false once the session is cancelled.
    pub fn step(&mut self) -> bool {
        let Some(frame) = self.output.lease_ready(&self.session) else {
            return false;
        };

        let start = Instant::now();
        // The lease gives this thread the only reference to the payload
        let accepted = self
            .encoder
            .write_frame(self.height, self.width, frame.data());
        metrics::histogram!("encode_time_us").record(start.elapsed().as_micros() as f64);

        if accepted {
            bump(&self.session.stats().frames_encoded);
            metrics::counter!("frames_encoded").increment(1);
            self.encoder.drain(false);
        } else {
            bump(&self.session.stats().encode_rejected);
            metrics::counter!("encoder_writes_rejected").increment(1);
            warn!("Encoder rejected frame at {:.3}s", frame.timestamp);
        }

        drop(frame);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::session::ManualClock;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        frames: Vec<(u32, u32, Vec<u8>)>,
        drains: usize,
    }

    struct MemoryEncoder {
        log: Arc<Mutex<Recorded>>,
        accept: bool,
    }

    impl VideoEncoder for MemoryEncoder {
        fn init(&mut self, _path: &Path, _fps: u32, _height: u32, _width: u32) -> Result<()> {
            Ok(())
        }

        fn prepare(&mut self) -> Result<()> {
            Ok(())
        }

        fn write_frame(&mut self, height: u32, width: u32, data: &[u8]) -> bool {
            self.log
                .lock()
                .unwrap()
                .frames
                .push((height, width, data.to_vec()));
            self.accept
        }

        fn drain(&mut self, _end_of_stream: bool) {
            self.log.lock().unwrap().drains += 1;
        }

        fn finalize(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn setup(accept: bool) -> (EncodeStage, Arc<BufferPool>, Arc<Session>, Arc<Mutex<Recorded>>) {
        let session = Arc::new(Session::new(
            Arc::new(ManualClock::new(0.0)),
            30,
            Duration::from_millis(1),
        ));
        let output = Arc::new(BufferPool::new("output", 8, 2));
        let log = Arc::new(Mutex::new(Recorded::default()));
        let stage = EncodeStage::new(
            Arc::clone(&session),
            Arc::clone(&output),
            Box::new(MemoryEncoder {
                log: Arc::clone(&log),
                accept,
            }),
            2,
            1,
        );
        (stage, output, session, log)
    }

    #[test]
    fn test_each_frame_written_once() {
        let (mut stage, output, _session, log) = setup(true);
        for fill in [1u8, 2] {
            let mut frame = output.try_acquire_free().unwrap();
            frame.data_mut().fill(fill);
            output.publish_ready(frame).unwrap();
        }

        assert!(stage.step());
        assert!(stage.step());

        let log = log.lock().unwrap();
        assert_eq!(log.frames.len(), 2);
        assert_eq!(log.frames[0], (1, 2, vec![1u8; 8]));
        assert_eq!(log.frames[1].2, vec![2u8; 8]);
        assert_eq!(log.drains, 2);
        assert_eq!(output.free_len(), 2);
    }

    #[test]
    fn test_rejected_write_still_recycles() {
        let (mut stage, output, session, log) = setup(false);
        let frame = output.try_acquire_free().unwrap();
        output.publish_ready(frame).unwrap();

        assert!(stage.step());
        assert_eq!(session.stats().snapshot().encode_rejected, 1);
        assert_eq!(log.lock().unwrap().drains, 0);
        assert_eq!(output.free_len(), 2);
    }

    #[test]
    fn test_run_returns_encoder_on_cancel() {
        let (stage, output, session, _log) = setup(true);
        let handle = thread::spawn(move || stage.run());
        thread::sleep(Duration::from_millis(10));
        session.cancel();
        let mut encoder = handle.join().unwrap();
        assert!(encoder.finalize().is_ok());
        assert!(output.snapshot().is_whole());
    }
}
