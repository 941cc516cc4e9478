//! Slow-start send window

pub const MIN_WINDOW_SIZE: i32 = 1;
pub const DEFAULT_START_WINDOW_SIZE: i32 = 10;

/// Adaptive cap on how many events one round may carry.
///
/// Starts at `start_size`, doubles after every round that filled the window
/// and was fully acknowledged, halves on failure and snaps back to
/// `start_size` when the connection is replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    size: i32,
    start_size: i32,
    max_size: i32,
}

impl Window {
    pub fn new(start_size: i32, max_size: i32) -> Self {
        let max_size = max_size.max(MIN_WINDOW_SIZE);
        let start_size = start_size.clamp(MIN_WINDOW_SIZE, max_size);
        Self {
            size: start_size,
            start_size,
            max_size,
        }
    }

    /// Current window size as a slice length.
    pub fn get(&self) -> usize {
        self.size as usize
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn start_size(&self) -> i32 {
        self.start_size
    }

    pub fn max_size(&self) -> i32 {
        self.max_size
    }

    /// Grow after `attempted` events were all acknowledged. A round shorter
    /// than the window says nothing about the link and leaves it alone.
    pub fn try_grow(&mut self, attempted: usize) {
        if attempted < self.get() {
            return;
        }
        self.size = self.size.saturating_mul(2).min(self.max_size);
    }

    pub fn shrink(&mut self) {
        self.size = (self.size / 2).max(MIN_WINDOW_SIZE);
    }

    pub fn reset(&mut self) {
        self.size = self.start_size;
    }
}
