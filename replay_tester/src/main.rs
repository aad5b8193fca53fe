mod replay;

use anyhow::Context as _;
use clap::Parser;
use crowd_pulse::{CameraConfig, Channel, CrowdConfig, Monitor, Subscriber, ZoneConfig};
use replay::{ReplayDetector, ReplaySource, load_log};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Replays a JSONL detection log through a crowd_pulse source worker and prints
/// everything published on the alerts and live-map channels.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Detection log, one JSON record per frame.
    #[arg(long)]
    detections: PathBuf,

    /// JSON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "replay-cam")]
    camera_id: String,

    /// People threshold for the camera (defaults to the config's).
    #[arg(long)]
    threshold: Option<u32>,

    /// Process every Nth frame (defaults to the config's).
    #[arg(long)]
    frame_skip: Option<u32>,

    /// Zone the camera feeds. Created with --zone-capacity if not configured.
    #[arg(long)]
    zone_id: Option<String>,

    #[arg(long, requires = "zone_id")]
    zone_capacity: Option<u32>,

    /// Frames per second the log was recorded at.
    #[arg(long, default_value_t = 10.0)]
    fps: f64,

    /// Pace the replay at --fps instead of running at full speed.
    #[arg(long)]
    realtime: bool,

    /// Image drawn under the detections in live frames.
    #[arg(long)]
    background: Option<PathBuf>,

    /// Serve the WebSocket channels on this address while replaying.
    #[cfg(feature = "web")]
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crowd_pulse=info,replay_tester=info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // --- 1. Configuration ---
    let mut config = match &args.config {
        Some(path) => CrowdConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => CrowdConfig::default(),
    };
    if let (Some(zone_id), Some(capacity)) = (&args.zone_id, args.zone_capacity) {
        if !config.zones.iter().any(|z| &z.id == zone_id) {
            config.zones.push(ZoneConfig::new(zone_id.clone(), zone_id.clone(), capacity));
        }
    }
    let interval = frame_interval(args.fps)?;

    // --- 2. Replay inputs ---
    let records = load_log(&args.detections)?;
    tracing::info!(frames = records.len(), "loaded detection log");
    let detector = Arc::new(ReplayDetector::new(&records));
    let mut source = ReplaySource::new(records, interval).realtime(args.realtime);
    if let Some(path) = &args.background {
        let image = image::open(path)
            .with_context(|| format!("cannot open background {}", path.display()))?
            .to_rgb8();
        source = source.with_background(image);
    }

    // --- 3. Monitor and subscribers ---
    let monitor = Arc::new(Monitor::new(config, detector, tokio::runtime::Handle::current())?);
    let printers = [Channel::Alerts, Channel::LiveMap].map(|channel| {
        let (subscriber, mut rx) = Subscriber::new(monitor.hub().subscriber_buffer().max(1024));
        monitor.hub().subscribe(channel, subscriber);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                println!("{payload}");
            }
        })
    });

    #[cfg(feature = "web")]
    let server = match &args.bind {
        Some(bind) => Some(
            crowd_pulse_server::start_server(
                Arc::clone(&monitor),
                crowd_pulse_server::ServerConfig { bind_addr: bind.clone() },
            )
            .await?,
        ),
        None => None,
    };

    // --- 4. Replay ---
    let mut camera = CameraConfig::new(&args.camera_id, args.detections.display().to_string(), monitor.config());
    if let Some(threshold) = args.threshold {
        camera = camera.with_threshold(threshold);
    }
    if let Some(frame_skip) = args.frame_skip {
        camera = camera.with_frame_skip(frame_skip);
    }
    if let Some(zone_id) = &args.zone_id {
        camera = camera.with_zone(zone_id.clone());
    }
    monitor.start_monitoring(camera, Box::new(source))?;

    tokio::select! {
        _ = wait_for_replay(&monitor, &args.camera_id) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    // --- 5. Summary ---
    let status = monitor.status();
    eprintln!("{}", serde_json::to_string_pretty(&status)?);

    #[cfg(feature = "web")]
    if let Some(server) = server {
        tracing::info!("replay finished; still serving on {} (ctrl-c to exit)", server.local_addr);
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        server.task.abort();
    }

    // workers join their threads, which must not stall a runtime worker
    tokio::task::block_in_place(|| monitor.shutdown());
    for printer in printers {
        printer.abort();
    }
    Ok(())
}

/// Time between recorded frames at `fps`.
fn frame_interval(fps: f64) -> anyhow::Result<Duration> {
    if !(fps.is_finite() && fps > 0.0) {
        anyhow::bail!("--fps must be a positive number");
    }
    Duration::try_from_secs_f64(1.0 / fps).with_context(|| format!("--fps {fps} is too small"))
}

async fn wait_for_replay(monitor: &Monitor, camera_id: &str) {
    while monitor.is_monitoring(camera_id) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // let the printers drain what the last frame published
    tokio::time::sleep(Duration::from_millis(100)).await;
}
