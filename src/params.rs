//! Live, externally driven grain parameters.

use std::sync::{Arc, PoisonError, RwLock};

// -------------------------------------------------------------------------------------------------

/// Grain parameters which are continuously adjusted by a control layer while grains are
/// being scheduled.
///
/// The grain engine reads a fresh copy of these on every scheduler frame, and each grain
/// captures the values it needs by value when it gets scheduled, so changes never affect
/// grains which are already on their way to the output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainRealtimeParams {
    /// Envelope attack time in seconds.
    pub fade_in_time: f64,
    /// Envelope hold time in seconds.
    pub sustain_time: f64,
    /// Envelope release time in seconds.
    pub fade_out_time: f64,
    /// Grain emission rate in Hz. Non positive values emit no grains.
    pub grains_per_second: f64,
    /// Relative grain start position within the sample (0.0 - 1.0).
    /// Converted to seconds via the sample's duration: `offset * sample_duration`.
    pub sample_offset_time: f64,
    /// Per grain playback speed. 1.0 is unison, 2.0 one octave up.
    pub playback_rate: f64,
}

impl Default for GrainRealtimeParams {
    fn default() -> Self {
        Self {
            fade_in_time: 0.05,
            sustain_time: 0.1,
            fade_out_time: 0.05,
            grains_per_second: 10.0,
            sample_offset_time: 0.0,
            playback_rate: 1.0,
        }
    }
}

impl GrainRealtimeParams {
    pub fn fade_in_time(mut self, seconds: f64) -> Self {
        self.fade_in_time = seconds;
        self
    }
    pub fn sustain_time(mut self, seconds: f64) -> Self {
        self.sustain_time = seconds;
        self
    }
    pub fn fade_out_time(mut self, seconds: f64) -> Self {
        self.fade_out_time = seconds;
        self
    }
    pub fn grains_per_second(mut self, rate: f64) -> Self {
        self.grains_per_second = rate;
        self
    }
    pub fn sample_offset_time(mut self, offset: f64) -> Self {
        self.sample_offset_time = offset;
        self
    }
    pub fn playback_rate(mut self, rate: f64) -> Self {
        self.playback_rate = rate;
        self
    }

    /// Total length of a grain's envelope in seconds.
    pub fn grain_duration(&self) -> f64 {
        self.fade_in_time.max(0.0) + self.sustain_time.max(0.0) + self.fade_out_time.max(0.0)
    }

    /// Interval between two grain starts in seconds, or None when no grains should be
    /// emitted with the current rate.
    pub fn grain_interval(&self) -> Option<f64> {
        if self.grains_per_second > 0.0 && self.grains_per_second.is_finite() {
            let interval = 1.0 / self.grains_per_second;
            (interval > 0.0).then_some(interval)
        } else {
            None
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Cheaply clonable, thread-safe cell holding the latest [`GrainRealtimeParams`].
///
/// Writers replace or modify the whole record at once, readers always get a consistent
/// snapshot: a reader never observes a half-written parameter set.
#[derive(Debug, Clone, Default)]
pub struct SharedGrainParams {
    params: Arc<RwLock<GrainRealtimeParams>>,
}

impl SharedGrainParams {
    pub fn new(params: GrainRealtimeParams) -> Self {
        Self {
            params: Arc::new(RwLock::new(params)),
        }
    }

    /// Copy of the current parameter set.
    pub fn snapshot(&self) -> GrainRealtimeParams {
        *self.params.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace all parameters.
    pub fn set(&self, params: GrainRealtimeParams) {
        *self.params.write().unwrap_or_else(PoisonError::into_inner) = params;
    }

    /// Modify the parameters in place. Readers see either the old or the modified set.
    pub fn update<F: FnOnce(&mut GrainRealtimeParams)>(&self, func: F) {
        let mut params = self.params.write().unwrap_or_else(PoisonError::into_inner);
        func(&mut params);
    }
}

// -------------------------------------------------------------------------------------------------
