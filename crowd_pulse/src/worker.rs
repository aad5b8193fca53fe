// THEORY:
// A `SourceWorker` owns one camera's long-lived processing loop. Each worker runs
// on its own named OS thread: frame capture is blocking I/O, and keeping it off
// the async runtime means a stalled camera can never starve the hub.
//
// Key architectural principles:
// 1.  **Lifecycle**: STOPPED -> RUNNING -> STOPPED. `start` is idempotent while
//     running and spawns exactly one thread; a worker whose loop has ended can be
//     started again.
// 2.  **Cancellation is a token, not a flag**: stopping drops the sending half
//     of a channel. Every blocking wait in the loop (frame read, reconnect pause)
//     selects on that channel and wakes immediately.
// 3.  **Publish gate**: each dispatch runs under a read lock on the gate. `stop`
//     closes the gate under the write lock, which both waits out an in-flight
//     dispatch and guarantees that nothing is published once `stop` returns.
// 4.  **Faults are counted, not fatal**: detector faults, read errors and
//     dispatch errors bump a counter and emit a tracing event. Only the end of a
//     finite source or `stop` ends the loop.

use crate::config::{CameraConfig, CrowdConfig};
use crate::core_modules::detection::{Detector, Frame};
use crate::dispatch::{CameraView, DispatchOutcome};
use crate::error::{DispatchError, MonitorError, SourceError};
use crate::pipeline::{FrameAnalysis, FrameAnalyzer, FrameSummary};
use crate::zones::ZoneRegistry;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, select};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A stream that may drop and come back; read errors trigger a reconnect.
    Live,
    /// A finite recording; a read error or end of stream ends the loop.
    File,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        const LIVE_SCHEMES: [&str; 4] = ["rtsp://", "rtmp://", "http://", "https://"];
        let lower = uri.trim().to_ascii_lowercase();
        if LIVE_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            SourceKind::Live
        } else {
            SourceKind::File
        }
    }
}

pub enum FrameRead {
    Frame(Frame),
    /// Nothing arrived within the timeout, or the wait was cancelled.
    Pending,
    EndOfStream,
}

/// Where a worker's frames come from.
pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;

    /// Waits at most `timeout` for the next frame. Implementations must return
    /// promptly once `cancel` fires.
    fn next_frame(&mut self, cancel: &CancelToken, timeout: Duration) -> Result<FrameRead, SourceError>;

    fn reconnect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Stops a worker by dropping the channel its token listens on.
pub struct CancelHandle {
    tx: Option<Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        self.tx.take();
    }
}

#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps up to `timeout`; returns true if cancelled meanwhile.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected))
    }

    /// For `select!` in sources: becomes ready once cancelled.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = bounded(0);
    (CancelHandle { tx: Some(tx) }, CancelToken { rx })
}

/// A source fed frame by frame over a crossbeam channel. Dropping every sender
/// ends a file source and disconnects a live one.
pub struct ChannelSource {
    kind: SourceKind,
    frames: Receiver<Frame>,
}

impl ChannelSource {
    pub fn new(kind: SourceKind, frames: Receiver<Frame>) -> Self {
        Self { kind, frames }
    }

    pub fn pair(kind: SourceKind, capacity: usize) -> (Sender<Frame>, Self) {
        let (tx, rx) = bounded(capacity);
        (tx, Self::new(kind, rx))
    }
}

impl FrameSource for ChannelSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn next_frame(&mut self, cancel: &CancelToken, timeout: Duration) -> Result<FrameRead, SourceError> {
        select! {
            recv(self.frames) -> msg => match msg {
                Ok(frame) => Ok(FrameRead::Frame(frame)),
                Err(_) if self.kind == SourceKind::File => Ok(FrameRead::EndOfStream),
                Err(_) => Err(SourceError::Disconnected),
            },
            recv(cancel.receiver()) -> _ => Ok(FrameRead::Pending),
            default(timeout) => Ok(FrameRead::Pending),
        }
    }

    fn reconnect(&mut self) -> Result<(), SourceError> {
        Err(SourceError::Disconnected)
    }
}

/// Receives every analyzed frame while the publish gate is open.
pub trait AnalysisSink: Send + Sync {
    fn handle(&self, analysis: &FrameAnalysis, frame: &Frame, camera: &CameraView) -> Result<DispatchOutcome, DispatchError>;
}

/// Everything a worker borrows from its owner.
#[derive(Clone)]
pub struct WorkerContext {
    pub detector: Arc<dyn Detector>,
    pub sink: Arc<dyn AnalysisSink>,
    pub zones: Arc<ZoneRegistry>,
    pub config: Arc<CrowdConfig>,
}

#[derive(Debug, Default)]
struct WorkerStats {
    frames_read: AtomicU64,
    frames_skipped: AtomicU64,
    frames_analyzed: AtomicU64,
    detector_faults: AtomicU64,
    read_errors: AtomicU64,
    reconnects: AtomicU64,
    dispatch_errors: AtomicU64,
    alerts_suppressed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounters {
    pub frames_read: u64,
    pub frames_skipped: u64,
    pub frames_analyzed: u64,
    pub detector_faults: u64,
    pub read_errors: u64,
    pub reconnects: u64,
    pub dispatch_errors: u64,
    pub alerts_suppressed: u64,
}

impl WorkerStats {
    fn snapshot(&self) -> WorkerCounters {
        WorkerCounters {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_analyzed: self.frames_analyzed.load(Ordering::Relaxed),
            detector_faults: self.detector_faults.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            alerts_suppressed: self.alerts_suppressed.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared between a worker handle and its thread.
struct WorkerShared {
    camera_id: String,
    source_uri: String,
    zone_id: Option<String>,
    frame_skip: u32,
    threshold: AtomicU32,
    last_count: AtomicUsize,
    running: AtomicBool,
    max_recent: usize,
    recent: Mutex<VecDeque<FrameSummary>>,
    stats: WorkerStats,
    gate: RwLock<bool>,
}

impl WorkerShared {
    fn push_summary(&self, summary: FrameSummary) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.push_back(summary);
        while recent.len() > self.max_recent {
            recent.pop_front();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub camera_id: String,
    pub source: String,
    pub source_kind: SourceKind,
    pub zone_id: Option<String>,
    pub running: bool,
    pub threshold: u32,
    pub frame_skip: u32,
    pub last_count: usize,
    pub recent: Vec<FrameSummary>,
    pub counters: WorkerCounters,
}

pub struct SourceWorker {
    shared: Arc<WorkerShared>,
    ctx: WorkerContext,
    kind: SourceKind,
    source: Option<Box<dyn FrameSource>>,
    thread: Option<JoinHandle<Box<dyn FrameSource>>>,
    cancel: Option<CancelHandle>,
    done_rx: Option<Receiver<()>>,
}

impl SourceWorker {
    pub fn new(camera: CameraConfig, source: Box<dyn FrameSource>, ctx: WorkerContext) -> Self {
        let shared = Arc::new(WorkerShared {
            threshold: AtomicU32::new(camera.threshold),
            frame_skip: camera.frame_skip.max(1),
            camera_id: camera.camera_id,
            source_uri: camera.source,
            zone_id: camera.zone_id,
            last_count: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            max_recent: ctx.config.processing.max_result_queue,
            recent: Mutex::new(VecDeque::new()),
            stats: WorkerStats::default(),
            gate: RwLock::new(false),
        });
        Self {
            kind: source.kind(),
            shared,
            ctx,
            source: Some(source),
            thread: None,
            cancel: None,
            done_rx: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.shared.camera_id
    }

    pub fn zone_id(&self) -> Option<&str> {
        self.shared.zone_id.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> u32 {
        self.shared.threshold.load(Ordering::Relaxed)
    }

    /// Applies from the next analyzed frame.
    pub fn set_threshold(&self, threshold: u32) {
        self.shared.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn counters(&self) -> WorkerCounters {
        self.shared.stats.snapshot()
    }

    pub fn status(&self) -> WorkerStatus {
        let shared = &self.shared;
        WorkerStatus {
            camera_id: shared.camera_id.clone(),
            source: shared.source_uri.clone(),
            source_kind: self.kind,
            zone_id: shared.zone_id.clone(),
            running: self.is_running(),
            threshold: self.threshold(),
            frame_skip: shared.frame_skip,
            last_count: shared.last_count.load(Ordering::Relaxed),
            recent: shared
                .recent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect(),
            counters: shared.stats.snapshot(),
        }
    }

    /// Spawns the processing thread. Returns `false` if it was already running.
    pub fn start(&mut self) -> Result<bool, MonitorError> {
        if self.is_running() {
            return Ok(false);
        }
        self.reclaim_finished();
        let source = self
            .source
            .take()
            .ok_or_else(|| MonitorError::SourceUnavailable(self.shared.camera_id.clone()))?;

        let (cancel, token) = cancel_pair();
        let (done_tx, done_rx) = bounded(1);
        *self.shared.gate.write().unwrap_or_else(PoisonError::into_inner) = true;
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let ctx = self.ctx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("crowd-src-{}", self.shared.camera_id))
            .spawn(move || run_loop(shared, ctx, source, token, done_tx));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.cancel = Some(cancel);
                self.done_rx = Some(done_rx);
                tracing::info!(camera_id = %self.shared.camera_id, kind = ?self.kind, "source worker started");
                Ok(true)
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                *self.shared.gate.write().unwrap_or_else(PoisonError::into_inner) = false;
                Err(MonitorError::Spawn(err))
            }
        }
    }

    /// Takes the source back from a thread whose loop has already ended. The
    /// thread may still be returning, so this can block briefly.
    fn reclaim_finished(&mut self) {
        if self.thread.is_some() {
            self.join_thread();
        }
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => tracing::error!(camera_id = %self.shared.camera_id, "source thread panicked"),
            }
        }
        self.done_rx = None;
        self.cancel = None;
    }

    /// Cancels the loop, closes the publish gate and waits a bounded time for the
    /// thread. After this returns nothing more is published for this camera.
    /// Returns true if the thread was joined.
    pub fn stop(&mut self) -> bool {
        if let Some(mut cancel) = self.cancel.take() {
            cancel.cancel();
        }
        *self.shared.gate.write().unwrap_or_else(PoisonError::into_inner) = false;

        let joined = match self.done_rx.take() {
            Some(done) => match done.recv_timeout(self.ctx.config.processing.stop_timeout()) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    self.join_thread();
                    true
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        camera_id = %self.shared.camera_id,
                        "source thread did not stop in time; detached behind a closed gate"
                    );
                    self.thread = None;
                    false
                }
            },
            None => {
                self.join_thread();
                true
            }
        };
        self.shared.running.store(false, Ordering::SeqCst);
        if joined {
            tracing::info!(camera_id = %self.shared.camera_id, "source worker stopped");
        }
        joined
    }
}

impl Drop for SourceWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn run_loop(
    shared: Arc<WorkerShared>,
    ctx: WorkerContext,
    mut source: Box<dyn FrameSource>,
    cancel: CancelToken,
    done_tx: Sender<()>,
) -> Box<dyn FrameSource> {
    let camera_id = shared.camera_id.as_str();
    let processing = &ctx.config.processing;
    let mut analyzer = FrameAnalyzer::new(camera_id, &ctx.config);
    let mut seen: u64 = 0;

    while !cancel.is_cancelled() {
        let frame = match source.next_frame(&cancel, processing.capture_timeout()) {
            Ok(FrameRead::Frame(frame)) => frame,
            Ok(FrameRead::Pending) => continue,
            Ok(FrameRead::EndOfStream) => {
                tracing::info!(camera_id, "end of stream");
                break;
            }
            Err(err) => {
                bump(&shared.stats.read_errors);
                match source.kind() {
                    SourceKind::File => {
                        tracing::warn!(camera_id, error = %err, "file source failed; stopping");
                        break;
                    }
                    SourceKind::Live => {
                        tracing::warn!(camera_id, error = %err, "frame read failed; reconnecting");
                        if cancel.wait(processing.reconnect_delay()) {
                            break;
                        }
                        match source.reconnect() {
                            Ok(()) => {
                                bump(&shared.stats.reconnects);
                                tracing::info!(camera_id, "source reconnected");
                            }
                            Err(err) => tracing::warn!(camera_id, error = %err, "reconnect failed"),
                        }
                        continue;
                    }
                }
            }
        };

        seen += 1;
        bump(&shared.stats.frames_read);
        if seen % u64::from(shared.frame_skip) != 0 {
            bump(&shared.stats.frames_skipped);
            continue;
        }

        let threshold = shared.threshold.load(Ordering::Relaxed);
        let capacity = shared.zone_id.as_deref().and_then(|z| ctx.zones.capacity(z));
        let (analysis, fault) = analyzer.analyze_with(ctx.detector.as_ref(), &frame, threshold, capacity);
        if let Some(fault) = fault {
            bump(&shared.stats.detector_faults);
            tracing::warn!(camera_id, frame = analysis.frame_id.counter, %fault, "frame analyzed as empty");
        }
        shared.push_summary(analysis.summary());

        let camera = CameraView {
            camera_id: shared.camera_id.clone(),
            zone_id: shared.zone_id.clone(),
            threshold,
            previous_count: shared.last_count.load(Ordering::Relaxed),
        };
        {
            let gate = shared.gate.read().unwrap_or_else(PoisonError::into_inner);
            if !*gate {
                break;
            }
            match ctx.sink.handle(&analysis, &frame, &camera) {
                Ok(outcome) => {
                    shared
                        .stats
                        .alerts_suppressed
                        .fetch_add(outcome.suppressed as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    bump(&shared.stats.dispatch_errors);
                    tracing::warn!(camera_id, frame = analysis.frame_id.counter, error = %err, "dispatch failed");
                }
            }
        }
        shared.last_count.store(analysis.people_count, Ordering::Relaxed);
        bump(&shared.stats.frames_analyzed);
        tracing::trace!(
            camera_id,
            frame = analysis.frame_id.counter,
            people = analysis.people_count,
            tier = %analysis.density_tier,
            "frame analyzed"
        );
    }

    shared.running.store(false, Ordering::SeqCst);
    let _ = done_tx.send(());
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection::RawDetection;
    use crate::core_modules::density::OccupancyTierPolicy;
    use crate::error::DetectError;
    use std::time::Instant;

    struct CountingDetector(usize);

    impl Detector for CountingDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<RawDetection>, DetectError> {
            Ok((0..self.0)
                .map(|i| {
                    let x = i as f32 * 30.0;
                    RawDetection::new(x, 0.0, x + 20.0, 60.0, 0.9)
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(u64, usize, usize)>>,
    }

    impl AnalysisSink for RecordingSink {
        fn handle(&self, analysis: &FrameAnalysis, frame: &Frame, camera: &CameraView) -> Result<DispatchOutcome, DispatchError> {
            self.seen
                .lock()
                .unwrap()
                .push((frame.sequence, analysis.people_count, camera.previous_count));
            Ok(DispatchOutcome::default())
        }
    }

    fn context(sink: Arc<RecordingSink>, people: usize) -> WorkerContext {
        WorkerContext {
            detector: Arc::new(CountingDetector(people)),
            sink,
            zones: Arc::new(ZoneRegistry::new(OccupancyTierPolicy::default())),
            config: Arc::new(CrowdConfig::default()),
        }
    }

    fn camera(skip: u32) -> CameraConfig {
        CameraConfig::new("cam-1", "memory", &CrowdConfig::default()).with_frame_skip(skip)
    }

    fn wait_until_stopped(worker: &SourceWorker) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn live_schemes_are_recognised() {
        assert_eq!(SourceKind::from_uri("rtsp://10.0.0.2/stream"), SourceKind::Live);
        assert_eq!(SourceKind::from_uri("HTTPS://cam.example/feed"), SourceKind::Live);
        assert_eq!(SourceKind::from_uri("rtmp://x"), SourceKind::Live);
        assert_eq!(SourceKind::from_uri("/videos/ghat.mp4"), SourceKind::File);
        assert_eq!(SourceKind::from_uri("file://ghat.mp4"), SourceKind::File);
    }

    #[test]
    fn cancel_token_wakes_waiters() {
        let (mut handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        assert!(!token.wait(Duration::from_millis(5)));
        handle.cancel();
        assert!(token.is_cancelled());
        let started = Instant::now();
        assert!(token.wait(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn file_source_processes_every_nth_frame_then_ends() {
        let sink = Arc::new(RecordingSink::default());
        let (feed, source) = ChannelSource::pair(SourceKind::File, 16);
        let mut worker = SourceWorker::new(camera(2), Box::new(source), context(Arc::clone(&sink), 3));
        for seq in 1..=6 {
            feed.send(Frame::blank(320, 240, seq)).unwrap();
        }
        drop(feed);
        assert!(worker.start().unwrap());
        wait_until_stopped(&worker);

        let seen = sink.seen.lock().unwrap().clone();
        let sequences: Vec<u64> = seen.iter().map(|s| s.0).collect();
        assert_eq!(sequences, vec![2, 4, 6]);
        // previous count is 0 before the first analyzed frame
        assert_eq!(seen[0].2, 0);
        assert_eq!(seen[1].2, 3);

        let counters = worker.counters();
        assert_eq!(counters.frames_read, 6);
        assert_eq!(counters.frames_skipped, 3);
        assert_eq!(counters.frames_analyzed, 3);
        assert_eq!(worker.status().recent.len(), 3);
        assert!(worker.stop());
    }

    #[test]
    fn stop_interrupts_an_idle_live_source_quickly() {
        let sink = Arc::new(RecordingSink::default());
        let (_feed, source) = ChannelSource::pair(SourceKind::Live, 4);
        let mut worker = SourceWorker::new(camera(1), Box::new(source), context(sink, 0));
        assert!(worker.start().unwrap());
        assert!(!worker.start().unwrap(), "second start is a no-op");
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(worker.stop());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!worker.is_running());
    }

    struct FlakySource {
        calls: usize,
    }

    impl FrameSource for FlakySource {
        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }

        fn next_frame(&mut self, _cancel: &CancelToken, _timeout: Duration) -> Result<FrameRead, SourceError> {
            self.calls += 1;
            match self.calls {
                1 => Err(SourceError::Read("connection reset".into())),
                2 => Ok(FrameRead::Frame(Frame::blank(64, 64, 1))),
                _ => Ok(FrameRead::EndOfStream),
            }
        }
    }

    #[test]
    fn live_read_error_pauses_and_reconnects() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = context(Arc::clone(&sink), 1);
        let mut config = CrowdConfig::default();
        config.processing.reconnect_delay_ms = 10;
        ctx.config = Arc::new(config);
        let mut worker = SourceWorker::new(camera(1), Box::new(FlakySource { calls: 0 }), ctx);
        worker.start().unwrap();
        wait_until_stopped(&worker);

        let counters = worker.counters();
        assert_eq!(counters.read_errors, 1);
        assert_eq!(counters.reconnects, 1);
        assert_eq!(counters.frames_analyzed, 1);
        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn finished_worker_can_be_restarted() {
        let sink = Arc::new(RecordingSink::default());
        let (feed, source) = ChannelSource::pair(SourceKind::File, 4);
        drop(feed);
        let mut worker = SourceWorker::new(camera(1), Box::new(source), context(sink, 0));
        worker.start().unwrap();
        wait_until_stopped(&worker);
        // the channel is still closed, so the restarted loop ends at once
        assert!(worker.start().unwrap());
        wait_until_stopped(&worker);
        assert!(!worker.is_running());
    }
}
