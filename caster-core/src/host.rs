use std::time::{Duration, Instant};

use crate::types::Framerate;

/// Host-provided clock and render statistics.
///
/// The core never reads wall time directly; everything time related goes
/// through this capability so tests can drive the timeline.
pub trait HostClock: Send + Sync + 'static {
    /// Monotonic time in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Duration of one video frame in nanoseconds.
    fn video_frame_interval_ns(&self) -> u64;

    /// Frames the host compositor has drawn since startup.
    fn total_drawn_frames(&self) -> u32 {
        0
    }

    /// Frames the host compositor skipped due to rendering lag.
    fn lagged_frames(&self) -> u32 {
        0
    }
}

/// Default clock measuring from an instant captured at creation.
#[derive(Debug)]
pub struct MonotonicClock {
    sync_point: Instant,
    frame_interval: Duration,
}

impl MonotonicClock {
    pub fn new(framerate: Framerate) -> Self {
        Self {
            sync_point: Instant::now(),
            frame_interval: framerate.frame_interval(),
        }
    }
}

impl HostClock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.sync_point.elapsed().as_nanos() as u64
    }

    fn video_frame_interval_ns(&self) -> u64 {
        self.frame_interval.as_nanos() as u64
    }
}
