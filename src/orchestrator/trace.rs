//! Bounded rebuild-trace ring and process-wide telemetry - modeled as one
//! owned object handed to each component rather than free functions
//! mutating hidden state, with a bounded accumulate-then-summarize ring.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

const RING_CAPACITY: usize = 64;

/// Per-stage timings for one rebuild cycle.
#[derive(Debug, Clone, Default)]
pub struct RebuildTrace {
    pub reason: String,
    pub started_at: Option<DateTime<Utc>>,
    pub queue_wait_ms: u64,
    pub build_ms: u64,
    pub change_ms: u64,
    pub snapshot_ms: u64,
    pub status_ms: u64,
    pub apply_ms: u64,
    pub failed: bool,
}

impl RebuildTrace {
    pub fn total_ms(&self) -> u64 {
        self.queue_wait_ms + self.build_ms + self.change_ms + self.snapshot_ms + self.status_ms + self.apply_ms
    }
}

/// Bounded ring of the last `RING_CAPACITY` rebuild traces, with an
/// explicit `reset` for tests.
pub struct TraceRing {
    entries: Mutex<VecDeque<RebuildTrace>>,
}

impl TraceRing {
    pub fn new() -> Self {
        TraceRing { entries: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)) }
    }

    pub fn push(&self, trace: RebuildTrace) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(trace);
    }

    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Summarizes the ring: count, failure count, and average total
    /// duration, for the CPU-spike diagnostic and periodic perf counters.
    pub fn summary(&self) -> TraceSummary {
        let entries = self.entries.lock().unwrap();
        let count = entries.len();
        let failed = entries.iter().filter(|t| t.failed).count();
        let avg_ms = if count > 0 {
            entries.iter().map(|t| t.total_ms()).sum::<u64>() / count as u64
        } else {
            0
        };
        let recent: Vec<(String, u64)> = entries.iter().rev().take(8).map(|t| (t.reason.clone(), t.total_ms())).collect();
        TraceSummary { count, failed, avg_ms, recent }
    }
}

impl Default for TraceRing {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct TraceSummary {
    pub count: usize,
    pub failed: usize,
    pub avg_ms: u64,
    pub recent: Vec<(String, u64)>,
}

/// A named in-flight span, tracked for the CPU-spike diagnostic's "active
/// span names with ages" report.
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub name: String,
    pub started_at: std::time::Instant,
}

pub struct SpanTracker {
    active: Mutex<Vec<SpanRecord>>,
}

impl SpanTracker {
    pub fn new() -> Self {
        SpanTracker { active: Mutex::new(Vec::new()) }
    }

    pub fn enter(&self, name: &str) -> SpanGuard<'_> {
        let record = SpanRecord { name: name.to_string(), started_at: std::time::Instant::now() };
        self.active.lock().unwrap().push(record);
        SpanGuard { tracker: self, name: name.to_string() }
    }

    fn leave(&self, name: &str) {
        let mut active = self.active.lock().unwrap();
        if let Some(pos) = active.iter().position(|s| s.name == name) {
            active.remove(pos);
        }
    }

    /// Active span names with their current age, newest last.
    pub fn active_with_ages(&self) -> Vec<(String, Duration)> {
        let active = self.active.lock().unwrap();
        active.iter().map(|s| (s.name.clone(), s.started_at.elapsed())).collect()
    }
}

impl Default for SpanTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `SpanTracker::enter`; leaves the span on drop so
/// a panicking stage never leaves a stale entry behind.
pub struct SpanGuard<'a> {
    tracker: &'a SpanTracker,
    name: String,
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        self.tracker.leave(&self.name);
    }
}

/// Process-wide telemetry handed to each orchestrator task.
pub struct Telemetry {
    pub traces: TraceRing,
    pub spans: SpanTracker,
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry { traces: TraceRing::new(), spans: SpanTracker::new() }
    }

    pub fn reset(&self) {
        self.traces.reset();
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_to_64_entries() {
        let ring = TraceRing::new();
        for i in 0..100 {
            ring.push(RebuildTrace { reason: format!("r{}", i), ..Default::default() });
        }
        assert_eq!(ring.len(), 64);
    }

    #[test]
    fn reset_clears_the_ring() {
        let ring = TraceRing::new();
        ring.push(RebuildTrace::default());
        ring.reset();
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn span_guard_removes_itself_on_drop() {
        let tracker = SpanTracker::new();
        {
            let _guard = tracker.enter("build");
            assert_eq!(tracker.active_with_ages().len(), 1);
        }
        assert_eq!(tracker.active_with_ages().len(), 0);
    }
}
