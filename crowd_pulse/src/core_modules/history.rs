// THEORY:
// The history ring gives the analyzer a short memory of previous frames. It is
// the only temporal state the anomaly layer has: a bounded FIFO of detection sets,
// oldest first, pushed after the current frame has been analyzed.

use crate::core_modules::detection::Detection;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct DetectionHistory {
    depth: usize,
    sets: VecDeque<Vec<Detection>>,
}

impl DetectionHistory {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            sets: VecDeque::with_capacity(depth),
        }
    }

    /// Appends a set, evicting the oldest once the ring is full.
    pub fn push(&mut self, detections: Vec<Detection>) {
        self.sets.push_back(detections);
        while self.sets.len() > self.depth {
            self.sets.pop_front();
        }
    }

    /// The set `steps` frames before the most recent one (`back(0)` is the newest).
    pub fn back(&self, steps: usize) -> Option<&[Detection]> {
        let idx = self.sets.len().checked_sub(steps + 1)?;
        self.sets.get(idx).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}
