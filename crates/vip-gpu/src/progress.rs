//! Submission sequencing and forward-progress tracking for hang detection.

use std::time::{Duration, Instant};

/// Monotonic sequence numbers stamped onto batches at submit time.
#[derive(Debug)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the gap between the last submitted and last completed sequence
/// numbers. While the gap is open the device is busy and the hang clock runs;
/// any completion restarts it, so only a core making no progress at all for a
/// full interval is declared hung.
#[derive(Debug, Default)]
pub struct GpuProgress {
    last_submitted: u64,
    last_completed: u64,
    busy_since: Option<Instant>,
}

impl GpuProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_submitted(&self) -> u64 {
        self.last_submitted
    }

    pub fn last_completed(&self) -> u64 {
        self.last_completed
    }

    pub fn submitted(&mut self, sequence: u64, now: Instant) {
        debug_assert!(sequence > self.last_submitted);
        self.last_submitted = sequence;
        if self.busy_since.is_none() {
            self.busy_since = Some(now);
        }
    }

    pub fn completed(&mut self, sequence: u64, now: Instant) {
        if sequence > self.last_completed {
            self.last_completed = sequence;
        }
        self.busy_since = if self.last_completed == self.last_submitted {
            None
        } else {
            Some(now)
        };
    }

    /// True while some submitted batch has not completed.
    pub fn outstanding(&self) -> bool {
        self.busy_since.is_some()
    }

    /// When the current busy window times out, if one is open.
    pub fn hang_deadline(&self, interval: Duration) -> Option<Instant> {
        self.busy_since.map(|since| since + interval)
    }

    /// Forget all in-flight work after a reset.
    pub fn reset(&mut self) {
        self.last_completed = self.last_submitted;
        self.busy_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_of_everything_clears_the_busy_window() {
        let mut p = GpuProgress::new();
        let t0 = Instant::now();
        p.submitted(1, t0);
        p.submitted(2, t0);
        assert!(p.outstanding());

        p.completed(1, t0);
        assert!(p.outstanding());
        p.completed(2, t0);
        assert!(!p.outstanding());
        assert_eq!(p.hang_deadline(Duration::from_millis(50)), None);
    }

    #[test]
    fn any_completion_restarts_the_hang_clock() {
        let mut p = GpuProgress::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(40);
        p.submitted(1, t0);
        p.submitted(2, t0);

        p.completed(1, t1);
        let interval = Duration::from_millis(50);
        assert_eq!(p.hang_deadline(interval), Some(t1 + interval));
    }
}
