//! GStreamer-based H.264/MP4 encoder with hardware acceleration when available

use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::encode::VideoEncoder;
use crate::error::{PipelineError, Result};

/// Feeds RGBA frames through `appsrc` into an MP4 file
#[derive(Default)]
pub struct GstEncoder {
    path: PathBuf,
    fps: u32,
    width: u32,
    height: u32,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    frames: u64,
}

impl GstEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect best available H.264 encoder (hardware > software)
    fn detect_h264_encoder() -> &'static str {
        let encoders = [
            "v4l2h264enc", // V4L2 M2M hardware encoder
            "vaapih264enc", // Intel/AMD VAAPI hardware encoder
            "nvh264enc",   // NVIDIA hardware encoder
            "x264enc",     // Software encoder (fallback)
        ];

        for encoder in &encoders {
            if gst::ElementFactory::find(encoder).is_some() {
                debug!("Found encoder: {}", encoder);
                return encoder;
            }
        }

        warn!("No hardware H.264 encoder found, using software encoder");
        "x264enc"
    }

    fn build_pipeline_string(&self) -> String {
        let encoder = Self::detect_h264_encoder();
        info!("Using H.264 encoder: {}", encoder);

        let tuning = if encoder == "x264enc" {
            " tune=zerolatency speed-preset=ultrafast"
        } else {
            ""
        };

        format!(
            "appsrc name=src is-live=true format=time ! \
             queue max-size-buffers=4 ! \
             videoconvert ! \
             video/x-raw,format=I420 ! \
             {}{} ! \
             h264parse ! \
             mp4mux ! \
             filesink location=\"{}\"",
            encoder,
            tuning,
            self.path.display()
        )
    }

    fn encoder_err(context: &str, e: impl std::fmt::Display) -> PipelineError {
        PipelineError::Encoder(format!("{}: {}", context, e))
    }
}

impl VideoEncoder for GstEncoder {
    fn init(&mut self, path: &Path, fps: u32, height: u32, width: u32) -> Result<()> {
        gst::init().map_err(|e| Self::encoder_err("Failed to initialize GStreamer", e))?;
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
                std::fs::create_dir_all(dir)?;
            }
        }

        let pipeline_str = self.build_pipeline_string();
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| Self::encoder_err("Failed to create pipeline", e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::Encoder("Failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| PipelineError::Encoder("Failed to find appsrc element".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| PipelineError::Encoder("Failed to cast to AppSrc".into()))?;

        let info = gst_video::VideoInfo::builder(
            gst_video::VideoFormat::Rgba,
            self.width,
            self.height,
        )
        .fps(gst::Fraction::new(self.fps as i32, 1))
        .build()
        .map_err(|e| Self::encoder_err("Invalid video info", e))?;
        let caps = info
            .to_caps()
            .map_err(|e| Self::encoder_err("Invalid caps", e))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Self::encoder_err("Failed to start pipeline", e))?;

        info!("Writing video to file: {}", self.path.display());
        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        Ok(())
    }

    fn write_frame(&mut self, height: u32, width: u32, data: &[u8]) -> bool {
        let Some(appsrc) = self.appsrc.as_ref() else {
            warn!("Encoder not prepared, dropping frame");
            return false;
        };
        if height != self.height || width != self.width {
            return false;
        }

        // Copied into a GStreamer-owned buffer, the pooled frame is free after this call
        let mut buffer = gst::Buffer::from_mut_slice(data.to_vec());
        if let Some(buffer) = buffer.get_mut() {
            let frame_ns = 1_000_000_000u64 / self.fps.max(1) as u64;
            buffer.set_pts(gst::ClockTime::from_nseconds(self.frames * frame_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(frame_ns));
        }

        match appsrc.push_buffer(buffer) {
            Ok(_) => {
                self.frames += 1;
                true
            }
            Err(e) => {
                warn!("Something went wrong while pushing frame to encoder: {:?}", e);
                false
            }
        }
    }

    fn drain(&mut self, end_of_stream: bool) {
        // The pipeline drains itself on its streaming threads
        if !end_of_stream {
            return;
        }
        let (Some(appsrc), Some(pipeline)) = (self.appsrc.as_ref(), self.pipeline.as_ref()) else {
            return;
        };

        debug!("Draining encoder to EOS");
        if let Err(e) = appsrc.end_of_stream() {
            warn!("Failed to send EOS: {:?}", e);
            return;
        }

        let Some(bus) = pipeline.bus() else {
            return;
        };
        let msg = bus.timed_pop_filtered(
            gst::ClockTime::from_seconds(5),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        );
        match msg.as_ref().map(|m| m.view()) {
            Some(gst::MessageView::Eos(..)) => debug!("End of stream reached"),
            Some(gst::MessageView::Error(err)) => warn!(
                "Pipeline error while draining: {} ({:?})",
                err.error(),
                err.debug()
            ),
            _ => warn!("Timed out waiting for end of stream"),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        info!("End of recording called");
        self.drain(true);

        let pipeline = self
            .pipeline
            .take()
            .ok_or_else(|| PipelineError::Encoder("finalize called before prepare".into()))?;
        self.appsrc = None;
        pipeline
            .set_state(gst::State::Null)
            .map_err(|e| Self::encoder_err("Failed to stop pipeline", e))?;

        info!(
            "Recording finalized: {} frames in {}",
            self.frames,
            self.path.display()
        );
        Ok(())
    }
}
