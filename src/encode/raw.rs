//! Uncompressed RGBA dump, one frame after another

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::encode::VideoEncoder;
use crate::error::{PipelineError, Result};

/// Writes frames verbatim. Play back with
/// `ffplay -f rawvideo -pixel_format rgba -video_size WxH -framerate FPS file`.
#[derive(Default)]
pub struct RawFileEncoder {
    path: PathBuf,
    fps: u32,
    width: u32,
    height: u32,
    writer: Option<BufWriter<File>>,
    frames: u64,
}

impl RawFileEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl VideoEncoder for RawFileEncoder {
    fn init(&mut self, path: &Path, fps: u32, height: u32, width: u32) -> Result<()> {
        self.path = path.to_path_buf();
        self.fps = fps;
        self.width = width;
        self.height = height;
        self.frames = 0;
        info!("Encoder initialized: {}x{} @ {} fps", width, height, fps);
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = File::create(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        info!("Writing video to file: {}", self.path.display());
        Ok(())
    }

    fn write_frame(&mut self, height: u32, width: u32, data: &[u8]) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            warn!("Encoder not prepared, dropping frame");
            return false;
        };
        if height != self.height || width != self.width {
            warn!(
                "Frame {}x{} does not match encoder {}x{}",
                width, height, self.width, self.height
            );
            return false;
        }
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            warn!("Frame of {} bytes, expected {}", data.len(), expected);
            return false;
        }

        match writer.write_all(data) {
            Ok(()) => {
                self.frames += 1;
                true
            }
            Err(e) => {
                warn!("Failed to write frame: {}", e);
                false
            }
        }
    }

    fn drain(&mut self, end_of_stream: bool) {
        if !end_of_stream {
            return;
        }
        debug!("Draining encoder to end of stream");
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush video file: {}", e);
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.drain(true);
        let writer = self
            .writer
            .take()
            .ok_or_else(|| PipelineError::Encoder("finalize called before prepare".into()))?;
        writer
            .into_inner()
            .map_err(|e| PipelineError::Encoder(e.to_string()))?
            .sync_all()?;
        info!(
            "Recording finalized: {} frames in {}",
            self.frames,
            self.path.display()
        );
        Ok(())
    }

    fn extension(&self) -> &'static str {
        "rgba"
    }
}
