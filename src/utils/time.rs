use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

// -------------------------------------------------------------------------------------------------

/// Sample frame position on the audio device's timeline.
pub type SampleTime = u64;

// -------------------------------------------------------------------------------------------------

/// The audio device's monotonic time reference, in seconds.
///
/// Grain start and stop times are always expressed on this clock. It usually does not run
/// in sync with the wall clock, so all timers which schedule audio events need to
/// resynchronize against it.
pub trait DeviceClock: Send + Sync {
    /// Current device time in seconds.
    fn current_time(&self) -> f64;
}

impl<C: DeviceClock + ?Sized> DeviceClock for Arc<C> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }
}

// -------------------------------------------------------------------------------------------------

/// Convert a time in seconds to sample frames with the given sample rate.
/// Negative or NaN times map to frame 0.
pub fn seconds_to_sample_time(seconds: f64, sample_rate: u32) -> SampleTime {
    debug_assert!(sample_rate > 0, "Invalid sample rate");
    let frames = (seconds * sample_rate as f64).round();
    if frames > 0.0 {
        frames as SampleTime
    } else {
        0
    }
}

/// Convert sample frames to a time in seconds with the given sample rate.
pub fn sample_time_to_seconds(sample_time: SampleTime, sample_rate: u32) -> f64 {
    debug_assert!(sample_rate > 0, "Invalid sample rate");
    sample_time as f64 / sample_rate as f64
}

// -------------------------------------------------------------------------------------------------

/// A device clock which is advanced manually. Useful for offline rendering and tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    time_bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(time: f64) -> Self {
        let clock = Self::default();
        clock.set_time(time);
        clock
    }

    /// Move the clock to the given time in seconds.
    pub fn set_time(&self, time: f64) {
        self.time_bits.store(time.to_bits(), Ordering::Release);
    }

    /// Move the clock forward by the given amount of seconds.
    pub fn advance(&self, seconds: f64) {
        self.set_time(self.current_time() + seconds);
    }
}

impl DeviceClock for ManualClock {
    fn current_time(&self) -> f64 {
        f64::from_bits(self.time_bits.load(Ordering::Acquire))
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(seconds_to_sample_time(1.0, 44100), 44100);
        assert_eq!(seconds_to_sample_time(0.5, 48000), 24000);
        assert_eq!(seconds_to_sample_time(-1.0, 48000), 0);
        assert_eq!(seconds_to_sample_time(f64::NAN, 48000), 0);
        assert_eq!(sample_time_to_seconds(22050, 44100), 0.5);
    }

    #[test]
    fn manual_clock() {
        let clock = ManualClock::new(1.5);
        let shared: Arc<dyn DeviceClock> = Arc::new(clock.clone());
        assert_eq!(shared.current_time(), 1.5);
        clock.advance(0.25);
        assert_eq!(shared.current_time(), 1.75);
    }
}
