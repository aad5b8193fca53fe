use chrono::Utc;
use crowd_pulse::core_modules::density::DensityTier;
use crowd_pulse::dedup::AlertDeduplicator;
use crowd_pulse::dispatch::{AlertDispatcher, CameraView};
use crowd_pulse::zones::{DEFAULT_SUGGESTIONS, ZoneRegistry};
use crowd_pulse::{
    CameraConfig, Channel, ChannelSource, CrowdConfig, DetectError, Detector, Frame, FrameAnalyzer, Monitor, Payload,
    RawDetection, SourceKind, Subscriber, ZoneConfig,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Reports `count_for(sequence)` people laid out in a grid.
struct GridDetector {
    count_for: fn(u64) -> usize,
}

impl Detector for GridDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, DetectError> {
        Ok(grid((self.count_for)(frame.sequence)))
    }
}

fn grid(n: usize) -> Vec<RawDetection> {
    (0..n)
        .map(|i| {
            let x = (i % 20) as f32 * 30.0;
            let y = (i / 20) as f32 * 90.0;
            RawDetection::new(x, y, x + 20.0, y + 60.0, 0.9)
        })
        .collect()
}

fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        out.push(serde_json::from_str(&payload).unwrap());
    }
    out
}

fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["type"] == kind).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn breach_is_critical_high_and_throttled() {
    let config = CrowdConfig::default();
    let hub = Arc::new(crowd_pulse::BroadcastHub::new(&config.hub));
    let zones = Arc::new(ZoneRegistry::new(config.density.occupancy));
    let dedup = Arc::new(AlertDeduplicator::new(config.debounce.clone()));
    let dispatcher = AlertDispatcher::new(Arc::clone(&hub), dedup, zones, 70);
    let (sub, mut alerts) = Subscriber::new(64);
    hub.subscribe(Channel::Alerts, sub);

    let detector = GridDetector { count_for: |_| 25 };
    let mut analyzer = FrameAnalyzer::new("gate-cam", &config);
    let camera = |previous_count| CameraView {
        camera_id: "gate-cam".into(),
        zone_id: None,
        threshold: 20,
        previous_count,
    };

    let frame = Frame::blank(640, 480, 1);
    let (analysis, fault) = analyzer.analyze_with(&detector, &frame, 20, None);
    assert!(fault.is_none());
    assert_eq!(analysis.people_count, 25);
    assert_eq!(analysis.density_tier, DensityTier::Critical);
    dispatcher.dispatch(&analysis, &frame, &camera(0)).await.unwrap();

    let sent = drain(&mut alerts);
    let breaches = of_type(&sent, "THRESHOLD_BREACH");
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0]["severity"], "HIGH");
    assert_eq!(breaches[0]["density_level"], "CRITICAL");
    assert!(breaches[0]["id"].as_str().unwrap().starts_with("alert_"));
    assert!(breaches[0]["timestamp"].as_str().unwrap().ends_with('Z'));

    // an identical frame inside the breach window is suppressed
    let frame = Frame::blank(640, 480, 2);
    let (analysis, _) = analyzer.analyze_with(&detector, &frame, 20, None);
    let outcome = dispatcher.dispatch(&analysis, &frame, &camera(25)).await.unwrap();
    assert!(!outcome.threshold_breach);
    assert!(of_type(&drain(&mut alerts), "THRESHOLD_BREACH").is_empty());
}

#[test]
fn full_zone_is_rerouted_away_from_critical_zones() {
    let config = CrowdConfig::default();
    let zones = ZoneRegistry::new(config.density.occupancy);
    for (id, name, capacity) in [
        ("ghat", "Main Ghat", 100),
        ("bridge", "Pontoon Bridge", 100),
        ("market", "Market Road", 100),
        ("camp", "Camp Grounds", 200),
    ] {
        zones.create(ZoneConfig::new(id, name, capacity)).unwrap();
    }
    let now = Utc::now();
    let full = zones.record_analysis("ghat", 95, DensityTier::Critical, now).unwrap();
    assert_eq!(full.occupancy_percentage, 95.0);
    assert_eq!(full.occupancy_tier, DensityTier::Critical);
    zones.record_analysis("bridge", 92, DensityTier::Critical, now).unwrap();
    zones.record_analysis("market", 30, DensityTier::Medium, now).unwrap();
    zones.record_analysis("camp", 10, DensityTier::Low, now).unwrap();

    let suggestions = zones.suggestions_for("ghat", DEFAULT_SUGGESTIONS).unwrap();
    let targets: Vec<&str> = suggestions.iter().map(|s| s.to_zone.as_str()).collect();
    assert_eq!(targets, vec!["camp", "market"]);
    assert!(suggestions[0].reason.starts_with("Critical crowd density detected"));
}

#[tokio::test(flavor = "multi_thread")]
async fn nothing_is_published_after_stop_returns() {
    let detector = Arc::new(GridDetector {
        count_for: |seq| (seq % 7) as usize + 1,
    });
    let monitor = Monitor::new(CrowdConfig::default(), detector, tokio::runtime::Handle::current()).unwrap();
    let (sub, mut alerts) = Subscriber::new(1024);
    monitor.hub().subscribe(Channel::Alerts, sub);

    let (feed, source) = ChannelSource::pair(SourceKind::Live, 4);
    let camera = CameraConfig::new("cam-c", "rtsp://cam-c", monitor.config())
        .with_threshold(100)
        .with_frame_skip(1);
    assert!(monitor.start_monitoring(camera, Box::new(source)).unwrap());

    let feeder = std::thread::spawn(move || {
        let mut seq = 0;
        loop {
            seq += 1;
            if feed.send(Frame::blank(160, 120, seq)).is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    // wait until the pipeline is visibly publishing
    let first_update = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let payload = alerts.recv().await.unwrap();
            let v: Value = serde_json::from_str(&payload).unwrap();
            if v["type"] == "LIVE_COUNT_UPDATE" {
                break v;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(first_update["camera_id"], "cam-c");

    tokio::task::block_in_place(|| monitor.stop_monitoring("cam-c")).unwrap();
    drain(&mut alerts);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let late = drain(&mut alerts);
    assert!(late.is_empty(), "published after stop: {late:?}");
    assert!(!monitor.is_monitoring("cam-c"));

    feeder.join().unwrap();
}
