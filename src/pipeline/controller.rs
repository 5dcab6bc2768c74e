//! Recording lifecycle: pool setup, stage threads and shutdown ordering

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Local;
use tracing::{error, info, instrument, warn};

use crate::capture::camera::{CameraSource, CaptureRouter, CaptureStage};
use crate::capture::convert::PixelConverter;
use crate::capture::frame::PixelFormat;
use crate::encode::{EncodeStage, VideoEncoder};
use crate::error::{PipelineError, Result};
use crate::pipeline::compose::{ComposeInputs, ComposeStage, Compositor, SyncPolicy};
use crate::pipeline::pool::{BufferPool, PoolSnapshot};
use crate::pipeline::resize::{ResizeGeometry, ResizeStage, Resizer};
use crate::pipeline::session::{Clock, Session};
use crate::pipeline::stats::StatsSnapshot;
use crate::render::readback::{ReadbackRequest, RenderCaptureStage, Renderer};
use crate::utils;
use crate::{CaptureType, Config};

/// External systems the pipeline drives
pub struct Collaborators {
    pub camera: Box<dyn CameraSource>,
    pub converter: Arc<dyn PixelConverter>,
    pub resizer: Arc<dyn Resizer>,
    pub compositor: Arc<dyn Compositor>,
    pub renderer: Arc<dyn Renderer>,
    pub encoder: Box<dyn VideoEncoder>,
    pub clock: Arc<dyn Clock>,
}

/// Host application lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `true` when the application goes to the background
    Pause(bool),
    /// `false` when the application loses focus
    Focus(bool),
    Quit,
}

/// Outcome of one recording session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub capture_type: CaptureType,
    pub output_path: PathBuf,
    pub duration_secs: f64,
    pub stats: StatsSnapshot,
    pub pools: Vec<PoolSnapshot>,
}

impl SessionReport {
    /// Every buffer of every pool is back in its free or ready group
    pub fn pools_whole(&self) -> bool {
        self.pools.iter().all(PoolSnapshot::is_whole)
    }
}

struct ActiveSession {
    session: Arc<Session>,
    capture_type: CaptureType,
    output_path: PathBuf,
    started_at: f64,
    pools: Vec<Arc<BufferPool>>,
    render: Option<RenderCaptureStage>,
    resize_thread: Option<JoinHandle<()>>,
    compose_thread: JoinHandle<()>,
    encode_thread: JoinHandle<Box<dyn VideoEncoder>>,
}

/// Owns the camera, the encoder and at most one recording session
pub struct PipelineController {
    config: Config,
    camera: Box<dyn CameraSource>,
    converter: Arc<dyn PixelConverter>,
    resizer: Arc<dyn Resizer>,
    compositor: Arc<dyn Compositor>,
    renderer: Arc<dyn Renderer>,
    encoder: Option<Box<dyn VideoEncoder>>,
    clock: Arc<dyn Clock>,
    router: Arc<CaptureRouter>,
    capturing: bool,
    active: Option<ActiveSession>,
}

impl PipelineController {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            camera: collaborators.camera,
            converter: collaborators.converter,
            resizer: collaborators.resizer,
            compositor: collaborators.compositor,
            renderer: collaborators.renderer,
            encoder: Some(collaborators.encoder),
            clock: collaborators.clock,
            router: Arc::new(CaptureRouter::new()),
            capturing: false,
            active: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Capture type of the running session after capability checks
    pub fn capture_type(&self) -> Option<CaptureType> {
        self.active.as_ref().map(|a| a.capture_type)
    }

    /// Live counters of the running session
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.active.as_ref().map(|a| a.session.stats().snapshot())
    }

    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        self.active
            .as_ref()
            .map(|a| a.pools.iter().map(|p| p.snapshot()).collect())
            .unwrap_or_default()
    }

    #[instrument(skip(self))]
    pub fn start_recording(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(PipelineError::AlreadyRecording);
        }

        let config = self.config.clone();
        let rec = &config.recording;
        let pipe = &config.pipeline;
        let (out_w, out_h) = (config.output.width, config.output.height);
        let (pt_w, pt_h) = (config.passthrough.width, config.passthrough.height);

        let mut capture_type = rec.capture_type;
        if capture_type.uses_render() && !self.renderer.supports_async_readback() {
            error!("Renderer does not support async readback, recording passthrough only");
            capture_type = CaptureType::PassthroughOnly;
        }

        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| PipelineError::Encoder("encoder lost by a previous session".into()))?;
        let output_path =
            utils::session_output_path(&rec.output_dir, Local::now(), encoder.extension());
        if let Err(e) = encoder
            .init(&output_path, rec.fps, out_h, out_w)
            .and_then(|()| encoder.prepare())
        {
            self.encoder = Some(encoder);
            return Err(e);
        }

        let session = Arc::new(Session::new(
            Arc::clone(&self.clock),
            rec.fps,
            pipe.poll_interval(),
        ));
        let frame_len = PixelFormat::Rgba32.frame_len(out_w, out_h);
        let output = Arc::new(BufferPool::new("output", frame_len, pipe.output_pool_size));
        let mut pools = vec![Arc::clone(&output)];

        let mut resize = None;
        let mut resized = None;
        if capture_type.uses_passthrough() {
            if !self.capturing {
                self.start_camera();
            }

            let raw = Arc::new(BufferPool::new(
                "passthrough_rgba",
                PixelFormat::Rgba32.frame_len(pt_w, pt_h),
                pipe.raw_pool_size,
            ));
            let resized_pool = Arc::new(BufferPool::new(
                "passthrough_resized",
                frame_len,
                pipe.resized_pool_size,
            ));
            pools.push(Arc::clone(&raw));
            pools.push(Arc::clone(&resized_pool));

            self.router.attach(Arc::new(CaptureStage::new(
                Arc::clone(&session),
                Arc::clone(&raw),
                Arc::clone(&self.converter),
                pipe.capture_backpressure,
            )));
            resize = Some(ResizeStage::new(
                Arc::clone(&session),
                raw,
                Arc::clone(&resized_pool),
                Arc::clone(&self.resizer),
                ResizeGeometry {
                    src_width: pt_w,
                    src_height: pt_h,
                    dst_width: out_w,
                    dst_height: out_h,
                    channels: 4,
                },
            ));
            resized = Some(resized_pool);
        }

        let mut render = None;
        let mut render_pool = None;
        if capture_type.uses_render() {
            let pool = Arc::new(BufferPool::new("render", frame_len, pipe.render_pool_size));
            pools.push(Arc::clone(&pool));
            render = Some(RenderCaptureStage::new(
                Arc::clone(&session),
                Arc::clone(&pool),
                Arc::clone(&self.renderer),
                ReadbackRequest {
                    camera: rec.render_camera.clone(),
                    width: out_w,
                    height: out_h,
                    format: PixelFormat::Rgba32,
                },
            ));
            render_pool = Some(pool);
        }

        let inputs = match (render_pool, resized) {
            (Some(render), Some(resized)) => ComposeInputs::Composite {
                render,
                resized,
                compositor: Arc::clone(&self.compositor),
                policy: SyncPolicy::from_frames(rec.sync_tolerance, rec.fps),
                width: out_w,
                height: out_h,
            },
            (Some(render), None) => ComposeInputs::Render { render },
            (None, Some(resized)) => ComposeInputs::Passthrough { resized },
            (None, None) => unreachable!("every capture type records at least one source"),
        };
        let compose = ComposeStage::new(Arc::clone(&session), inputs, Arc::clone(&output));
        let encode = EncodeStage::new(Arc::clone(&session), output, encoder, out_w, out_h);

        let spawner = ThreadSpawner {
            pin: pipe.pin_stage_threads,
        };
        let (resize_thread, compose_thread, encode_thread) =
            match launch(&session, resize, compose, encode, &spawner) {
                Ok(threads) => threads,
                Err(LaunchFailure { error, encoder }) => {
                    session.cancel();
                    self.router.detach();
                    match encoder {
                        Some(mut encoder) => {
                            error!("Failed to start stage threads: {}", error);
                            if let Err(e) = encoder.finalize() {
                                warn!("Failed to finalize aborted recording: {}", e);
                            }
                            self.encoder = Some(encoder);
                        }
                        None => error!("Failed to start stage threads, encoder is lost: {}", error),
                    }
                    return Err(error);
                }
            };

        info!(
            "Recording started: {:?} @ {} fps -> {}",
            capture_type,
            rec.fps,
            output_path.display()
        );

        let started_at = session.now();
        self.active = Some(ActiveSession {
            session,
            capture_type,
            output_path,
            started_at,
            pools,
            render,
            resize_thread,
            compose_thread,
            encode_thread,
        });
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn stop_recording(&mut self) -> Result<SessionReport> {
        let active = self.active.take().ok_or(PipelineError::NotRecording)?;

        active.session.cancel();
        self.router.detach();
        drop(active.render);

        if let Some(handle) = active.resize_thread {
            if handle.join().is_err() {
                error!("Resize stage panicked");
            }
        }
        if active.compose_thread.join().is_err() {
            error!("Compose stage panicked");
        }
        match active.encode_thread.join() {
            Ok(mut encoder) => {
                if let Err(e) = encoder.finalize() {
                    error!("Failed to finalize recording: {}", e);
                }
                self.encoder = Some(encoder);
            }
            Err(_) => error!("Encode stage panicked, encoder is lost"),
        }

        let report = SessionReport {
            capture_type: active.capture_type,
            output_path: active.output_path,
            duration_secs: active.session.now() - active.started_at,
            stats: active.session.stats().snapshot(),
            pools: active.pools.iter().map(|p| p.snapshot()).collect(),
        };

        info!(
            "Recording stopped: {} frames encoded in {:.1}s",
            report.stats.frames_encoded, report.duration_secs
        );
        for pool in report.pools.iter().filter(|p| !p.is_whole()) {
            warn!(
                "Pool '{}' has {} buffers in flight after stop",
                pool.name,
                pool.in_flight()
            );
        }
        Ok(report)
    }

    /// Start when idle, stop when recording
    pub fn toggle_recording(&mut self) -> Result<Option<SessionReport>> {
        if self.is_recording() {
            self.stop_recording().map(Some)
        } else {
            self.start_recording().map(|()| None)
        }
    }

    /// Host render tick; drives the render readback stage
    pub fn on_render_tick(&mut self) -> bool {
        match self.active.as_mut().and_then(|a| a.render.as_mut()) {
            Some(render) => render.tick(),
            None => false,
        }
    }

    /// Release the camera when the application goes away, stopping any
    /// recording first so no stage waits on a source that went silent
    pub fn on_lifecycle(&mut self, event: LifecycleEvent) -> Option<SessionReport> {
        let release = match event {
            LifecycleEvent::Pause(paused) => paused,
            LifecycleEvent::Focus(focused) => !focused,
            LifecycleEvent::Quit => true,
        };
        if !release {
            return None;
        }

        info!("Lifecycle event {:?}, releasing capture", event);
        let report = if self.is_recording() {
            self.stop_recording().ok()
        } else {
            None
        };
        self.stop_camera();
        report
    }

    pub fn on_pause(&mut self, paused: bool) -> Option<SessionReport> {
        self.on_lifecycle(LifecycleEvent::Pause(paused))
    }

    pub fn on_focus(&mut self, focused: bool) -> Option<SessionReport> {
        self.on_lifecycle(LifecycleEvent::Focus(focused))
    }

    pub fn on_quit(&mut self) -> Option<SessionReport> {
        self.on_lifecycle(LifecycleEvent::Quit)
    }

    fn start_camera(&mut self) {
        let sensor = self.config.passthrough.sensor;
        let fps = self.config.recording.fps;
        match self.camera.start(sensor, fps, self.router.sink()) {
            Ok(()) => {
                info!("Camera started: {:?} @ {} fps", sensor, fps);
                self.capturing = true;
            }
            Err(e) => warn!("Failed to start camera, recording without passthrough input: {}", e),
        }
    }

    fn stop_camera(&mut self) {
        if self.capturing {
            self.camera.stop();
            self.capturing = false;
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if self.is_recording() {
            let _ = self.stop_recording();
        }
        self.stop_camera();
    }
}

type StageThreads = (
    Option<JoinHandle<()>>,
    JoinHandle<()>,
    JoinHandle<Box<dyn VideoEncoder>>,
);

struct LaunchFailure {
    error: PipelineError,
    /// Recovered from the encode thread when it was already running
    encoder: Option<Box<dyn VideoEncoder>>,
}

trait StageSpawner {
    fn spawn<T, F>(&self, name: &'static str, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;
}

/// Named OS thread per stage, optionally pinned
struct ThreadSpawner {
    pin: bool,
}

impl StageSpawner for ThreadSpawner {
    fn spawn<T, F>(&self, name: &'static str, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let pin = self.pin;
        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                if pin {
                    utils::pin_current_thread(name);
                }
                f()
            })
            .map_err(|source| PipelineError::Spawn { name, source })
    }
}

/// Start the encode thread first so a later spawn failure can hand the
/// encoder back after cancelling the session
fn launch(
    session: &Session,
    resize: Option<ResizeStage>,
    compose: ComposeStage,
    encode: EncodeStage,
    spawner: &impl StageSpawner,
) -> std::result::Result<StageThreads, LaunchFailure> {
    let encode_thread = spawner
        .spawn("encode", move || encode.run())
        .map_err(|error| LaunchFailure {
            error,
            encoder: None,
        })?;

    match launch_inputs(resize, compose, spawner) {
        Ok((resize_thread, compose_thread)) => Ok((resize_thread, compose_thread, encode_thread)),
        Err(error) => {
            session.cancel();
            Err(LaunchFailure {
                error,
                encoder: encode_thread.join().ok(),
            })
        }
    }
}

fn launch_inputs(
    resize: Option<ResizeStage>,
    compose: ComposeStage,
    spawner: &impl StageSpawner,
) -> Result<(Option<JoinHandle<()>>, JoinHandle<()>)> {
    let resize_thread = match resize {
        Some(stage) => Some(spawner.spawn("passthrough-resize", move || stage.run())?),
        None => None,
    };
    let compose_thread = spawner.spawn("compose", move || compose.run())?;
    Ok((resize_thread, compose_thread))
}
