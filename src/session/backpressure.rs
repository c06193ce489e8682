//! Watermark backpressure for the send path.
//!
//! The session consults the controller after every append to its pending
//! buffer and after every completed write. Crossing the high watermark
//! pauses receiving; dropping back below the low watermark resumes it and
//! fires the `send_buf_available` callback exactly once per pause episode.

/// Hysteresis controller over the pending send-buffer size.
///
/// Transitions are edge-triggered: `should_pause` reports `true` only on
/// the crossing into the paused region, `should_resume` only on the
/// crossing out of it.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    low_watermark: usize,
    high_watermark: usize,
    paused: bool,
}

impl BackpressureController {
    /// Create a controller with the given watermarks.
    ///
    /// Callers validate `low <= high` up front (see
    /// [`SessionConfig::validate`](crate::config::SessionConfig::validate)).
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            low_watermark,
            high_watermark,
            paused: false,
        }
    }

    /// Report whether this size crosses into the paused region.
    pub fn should_pause(&mut self, current_size: usize) -> bool {
        if !self.paused && current_size > self.high_watermark {
            self.paused = true;
            return true;
        }
        false
    }

    /// Report whether this size crosses out of the paused region.
    pub fn should_resume(&mut self, current_size: usize) -> bool {
        if self.paused && current_size < self.low_watermark {
            self.paused = false;
            return true;
        }
        false
    }

    /// Whether the controller currently holds receive paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Forget any paused state.
    pub fn reset(&mut self) {
        self.paused = false;
    }

    /// The resume threshold.
    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    /// The pause threshold.
    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }
}
