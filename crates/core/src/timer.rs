//! Smoothed frame-to-frame timing.

use std::time::{Duration, Instant};

/// Rate at which the smoothed frame time approaches the momentary one.
const SMOOTHING_FACTOR: f64 = 0.03;

/// Measures frame-to-frame time and derives a smoothed frame rate.
///
/// The first call to [`next_frame`](Self::next_frame) only records a
/// timestamp. The second seeds the smoothed value with the raw delta, and
/// every later call moves the smoothed value towards the new delta by
/// [`SMOOTHING_FACTOR`].
#[derive(Debug, Default)]
pub struct FrameTimer {
    previous: Option<Instant>,
    smoothed: Option<Duration>,
}

impl FrameTimer {
    /// Create a timer with no recorded frames.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a frame was drawn now.
    pub fn next_frame(&mut self) {
        self.next_frame_at(Instant::now());
    }

    /// Record that a frame was drawn at `now`.
    pub fn next_frame_at(&mut self, now: Instant) {
        let Some(previous) = self.previous.replace(now) else {
            return;
        };
        let delta = now.saturating_duration_since(previous);

        self.smoothed = Some(match self.smoothed {
            None => delta,
            Some(smoothed) => {
                let current = smoothed.as_secs_f64();
                let next = current + SMOOTHING_FACTOR * (delta.as_secs_f64() - current);
                Duration::from_secs_f64(next.max(0.0))
            }
        });
    }

    /// Smoothed frame time, or `None` until two frames have been recorded.
    pub fn smoothed_frame_time(&self) -> Option<Duration> {
        self.smoothed
    }

    /// Smoothed frames per second, or `0.0` when it cannot be determined.
    pub fn smoothed_frame_rate(&self) -> f64 {
        match self.smoothed {
            Some(time) if !time.is_zero() => 1.0 / time.as_secs_f64(),
            _ => 0.0,
        }
    }

    /// Forget all history, e.g. after the render loop was paused.
    pub fn reset(&mut self) {
        self.previous = None;
        self.smoothed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_has_no_timing() {
        let mut timer = FrameTimer::new();
        timer.next_frame_at(Instant::now());
        assert_eq!(timer.smoothed_frame_time(), None);
        assert_eq!(timer.smoothed_frame_rate(), 0.0);
    }

    #[test]
    fn test_second_frame_seeds_raw_delta() {
        let start = Instant::now();
        let mut timer = FrameTimer::new();
        timer.next_frame_at(start);
        timer.next_frame_at(start + Duration::from_millis(20));
        assert_eq!(timer.smoothed_frame_time(), Some(Duration::from_millis(20)));
        assert!((timer.smoothed_frame_rate() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_later_frames_are_smoothed() {
        let start = Instant::now();
        let mut timer = FrameTimer::new();
        timer.next_frame_at(start);
        timer.next_frame_at(start + Duration::from_millis(20));
        timer.next_frame_at(start + Duration::from_millis(60));

        // 20ms + 0.03 * (40ms - 20ms) = 20.6ms
        let smoothed = timer.smoothed_frame_time().unwrap().as_secs_f64();
        assert!((smoothed - 0.0206).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_history() {
        let start = Instant::now();
        let mut timer = FrameTimer::new();
        timer.next_frame_at(start);
        timer.next_frame_at(start + Duration::from_millis(16));
        timer.reset();
        assert_eq!(timer.smoothed_frame_time(), None);

        timer.next_frame_at(start + Duration::from_millis(100));
        assert_eq!(timer.smoothed_frame_time(), None);
    }
}
