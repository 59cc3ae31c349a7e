use crate::window::RetentionWindow;

/// Width of the sub-window used for "current speed".
pub const RATE_WINDOW_MS: i64 = 1000;

/// Turns a retention window into a bytes-per-second figure, recomputed
/// from the samples on every call.
#[derive(Debug, Clone, Copy)]
pub struct RateAggregator {
    window_ms: i64,
}

impl RateAggregator {
    /// Bytes seen in `(now - window, now]`.
    pub fn current_speed(&self, window: &RetentionWindow, now_ms: i64) -> u64 {
        window.sum_since(now_ms, self.window_ms)
    }
}

impl Default for RateAggregator {
    fn default() -> Self {
        Self { window_ms: RATE_WINDOW_MS }
    }
}
