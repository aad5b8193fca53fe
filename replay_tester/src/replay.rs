//! Recorded detection logs and the source/detector pair that replays them.
//!
//! A log is JSON Lines, one record per captured frame:
//! `{"frame": 7, "width": 640, "height": 480, "detections": [{"bbox": [x1, y1, x2, y2], "confidence": 0.9}]}`
//! `frame`, `width` and `height` may be omitted; frames are then numbered in
//! file order and sized like the previous record (640x480 at the start).

use anyhow::Context as _;
use chrono::{DateTime, TimeDelta, Utc};
use crowd_pulse::worker::{CancelToken, FrameRead};
use crowd_pulse::{DetectError, Detector, Frame, FrameSource, RawDetection, SourceError, SourceKind};
use image::RgbImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize)]
struct LogLine {
    frame: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    detections: Vec<RawDetection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayRecord {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<RawDetection>,
}

pub fn parse_log(reader: impl BufRead) -> anyhow::Result<Vec<ReplayRecord>> {
    let mut records = Vec::new();
    let (mut width, mut height) = (DEFAULT_WIDTH, DEFAULT_HEIGHT);
    let mut next_sequence = 1;
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: LogLine =
            serde_json::from_str(&line).with_context(|| format!("malformed record on line {}", index + 1))?;
        width = parsed.width.unwrap_or(width);
        height = parsed.height.unwrap_or(height);
        let sequence = parsed.frame.unwrap_or(next_sequence);
        next_sequence = sequence + 1;
        records.push(ReplayRecord {
            sequence,
            width,
            height,
            detections: parsed.detections,
        });
    }
    Ok(records)
}

pub fn load_log(path: &Path) -> anyhow::Result<Vec<ReplayRecord>> {
    let file = std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    parse_log(std::io::BufReader::new(file))
}

/// Answers `detect` from the log by frame sequence.
pub struct ReplayDetector {
    by_sequence: HashMap<u64, Vec<RawDetection>>,
}

impl ReplayDetector {
    pub fn new(records: &[ReplayRecord]) -> Self {
        Self {
            by_sequence: records.iter().map(|r| (r.sequence, r.detections.clone())).collect(),
        }
    }
}

impl Detector for ReplayDetector {
    fn warm_up(&self) -> Result<(), DetectError> {
        if self.by_sequence.is_empty() {
            return Err(DetectError::Unavailable("replay log has no records".into()));
        }
        Ok(())
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, DetectError> {
        self.by_sequence
            .get(&frame.sequence)
            .cloned()
            .ok_or_else(|| DetectError::Failed(format!("no record for frame {}", frame.sequence)))
    }
}

/// Emits one frame per record, stamped `frame_interval` apart from `start`.
pub struct ReplaySource {
    records: std::vec::IntoIter<ReplayRecord>,
    background: Option<RgbImage>,
    start: DateTime<Utc>,
    frame_interval: Duration,
    realtime: bool,
    emitted: u32,
}

impl ReplaySource {
    pub fn new(records: Vec<ReplayRecord>, frame_interval: Duration) -> Self {
        Self {
            records: records.into_iter(),
            background: None,
            start: Utc::now(),
            frame_interval,
            realtime: false,
            emitted: 0,
        }
    }

    /// Use `image` for every frame instead of a black canvas.
    pub fn with_background(mut self, image: RgbImage) -> Self {
        self.background = Some(image);
        self
    }

    /// Wait `frame_interval` between frames instead of replaying at full speed.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl FrameSource for ReplaySource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn next_frame(&mut self, cancel: &CancelToken, _timeout: Duration) -> Result<FrameRead, SourceError> {
        if self.realtime && self.emitted > 0 && cancel.wait(self.frame_interval) {
            return Ok(FrameRead::Pending);
        }
        let Some(record) = self.records.next() else {
            return Ok(FrameRead::EndOfStream);
        };
        let image = match &self.background {
            Some(bg) if bg.width() == record.width && bg.height() == record.height => bg.clone(),
            _ => RgbImage::new(record.width, record.height),
        };
        let mut frame = Frame::new(image, record.sequence);
        let offset = TimeDelta::from_std(self.frame_interval * self.emitted).unwrap_or(TimeDelta::zero());
        frame.captured_at = self.start + offset;
        self.emitted += 1;
        Ok(FrameRead::Frame(frame))
    }
}
