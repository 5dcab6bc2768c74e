//! MixCast demo: records synthetic camera and render sources until Ctrl-C
//!
//! Usage: `mixcast [config.toml] [seconds]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mixcast::capture::{SoftwareConverter, SyntheticCamera};
use mixcast::encode::VideoEncoder;
use mixcast::pipeline::{AlphaCompositor, MonotonicClock, NearestResizer};
use mixcast::render::SyntheticRenderer;
use mixcast::{Collaborators, Config, PipelineController, SessionReport};

/// Host render loop rate, as on a typical headset
const HOST_TICK_HZ: f64 = 90.0;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("MixCast launching...");

    let mut args = std::env::args().skip(1);
    let config_path = args.next().filter(|a| !a.is_empty()).map(PathBuf::from);
    let duration = args
        .next()
        .map(|secs| secs.parse::<f64>().map(Duration::from_secs_f64))
        .transpose()
        .map_err(|e| eyre!("Invalid recording duration: {}", e))?;
    let config = Config::load(config_path.as_deref())?;
    info!("Configuration: {:?}", config);

    let collaborators = Collaborators {
        camera: Box::new(SyntheticCamera::new(
            config.passthrough.width,
            config.passthrough.height,
        )),
        converter: Arc::new(SoftwareConverter),
        resizer: Arc::new(NearestResizer),
        compositor: Arc::new(AlphaCompositor),
        renderer: Arc::new(SyntheticRenderer::new()),
        encoder: encoder(),
        clock: Arc::new(MonotonicClock::new()),
    };

    let mut controller = PipelineController::new(config, collaborators)?;
    controller.start_recording()?;

    let mut host_tick = tokio::time::interval(Duration::from_secs_f64(1.0 / HOST_TICK_HZ));
    host_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut status = tokio::time::interval(Duration::from_secs(5));
    status.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = host_tick.tick() => {
                controller.on_render_tick();
            }
            _ = status.tick() => {
                if let Some(stats) = controller.stats() {
                    info!(
                        "Encoded {} frames ({} composed, {} stale passthrough)",
                        stats.frames_encoded, stats.frames_composed, stats.passthrough_stale
                    );
                }
            }
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = &mut deadline => {
                info!("Recording duration elapsed");
                break;
            }
        }
    }

    match controller.on_quit() {
        Some(report) => print_report(&report),
        None => warn!("No recording was running at shutdown"),
    }

    info!("MixCast shutting down");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mixcast=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[cfg(feature = "gstreamer-encoder")]
fn encoder() -> Box<dyn VideoEncoder> {
    Box::new(mixcast::encode::GstEncoder::new())
}

#[cfg(not(feature = "gstreamer-encoder"))]
fn encoder() -> Box<dyn VideoEncoder> {
    Box::new(mixcast::encode::RawFileEncoder::default())
}

fn print_report(report: &SessionReport) {
    let stats = &report.stats;
    info!(
        "Recorded {:?} session to {} ({:.1}s)",
        report.capture_type,
        report.output_path.display(),
        report.duration_secs
    );
    info!(
        "Captured {} (dropped {}, rejected {}), resized {}, render {} of {} requested (dropped {})",
        stats.frames_captured,
        stats.capture_dropped,
        stats.capture_rejected,
        stats.frames_resized,
        stats.render_frames,
        stats.readbacks_requested,
        stats.render_dropped
    );
    info!(
        "Composed {} ({} stale passthrough), encoded {} (rejected {})",
        stats.frames_composed, stats.passthrough_stale, stats.frames_encoded, stats.encode_rejected
    );
    for pool in &report.pools {
        info!(
            "Pool {}: {} buffers, {} published, {} recycled, {} in flight",
            pool.name,
            pool.count,
            pool.published,
            pool.recycled,
            pool.in_flight()
        );
    }
}
