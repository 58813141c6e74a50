//! Single-slot FIFO rebuild coordinator: at most one rebuild in progress,
//! at most one queued - further requests collapse into the queued one and
//! retain the earliest reason string.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct State {
    in_progress: bool,
    queued_reason: Option<String>,
}

/// Coordinates rebuild requests so at most one rebuild runs at a time and
/// at most one more is queued behind it.
pub struct RebuildQueue {
    state: Mutex<State>,
    cv: Condvar,
}

impl RebuildQueue {
    pub fn new() -> Self {
        RebuildQueue { state: Mutex::new(State::default()), cv: Condvar::new() }
    }

    /// Requests a rebuild for `reason`. If one is already in progress, the
    /// request is queued (or coalesced into the existing queued request,
    /// keeping whichever reason arrived first). Returns `true` if this call
    /// should proceed to run the rebuild itself, `false` if it was merged
    /// into an in-flight or already-queued request.
    pub fn request(&self, reason: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.in_progress {
            state.in_progress = true;
            true
        } else {
            if state.queued_reason.is_none() {
                state.queued_reason = Some(reason.to_string());
            }
            false
        }
    }

    /// Marks the current rebuild complete. If a reason was queued behind
    /// it, returns that reason and keeps the coordinator "in progress" for
    /// the caller to immediately run the queued rebuild; otherwise clears
    /// the in-progress flag and wakes any waiters.
    pub fn complete_and_take_queued(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        match state.queued_reason.take() {
            Some(reason) => Some(reason),
            None => {
                state.in_progress = false;
                self.cv.notify_all();
                None
            }
        }
    }

    /// Blocks until no rebuild is in progress (used by shutdown to avoid
    /// tearing down state mid-rebuild).
    pub fn wait_idle(&self) {
        let guard = self.state.lock().unwrap();
        let _unused = self.cv.wait_while(guard, |s| s.in_progress).unwrap();
    }
}

impl Default for RebuildQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_request_while_in_progress_is_queued_not_run() {
        let q = RebuildQueue::new();
        assert!(q.request("first"));
        assert!(!q.request("second"));
    }

    #[test]
    fn coalesced_requests_retain_earliest_reason() {
        let q = RebuildQueue::new();
        assert!(q.request("first"));
        assert!(!q.request("second"));
        assert!(!q.request("third"));
        assert_eq!(q.complete_and_take_queued(), Some("second".to_string()));
    }

    #[test]
    fn completing_with_no_queue_frees_the_slot() {
        let q = RebuildQueue::new();
        assert!(q.request("only"));
        assert_eq!(q.complete_and_take_queued(), None);
        assert!(q.request("next"));
    }
}
