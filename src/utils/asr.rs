//! Linear attack, sustain, release envelope as used by sound grains.

// -------------------------------------------------------------------------------------------------

/// Current processing stage in a [`AsrEnvelope`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AsrStage {
    #[default]
    /// Before the envelope started (zero volume).
    Idle,
    Attack,
    Sustain,
    Release,
    /// After the release phase (zero volume).
    Finished,
}

// -------------------------------------------------------------------------------------------------

/// A piecewise-linear gain envelope: ramps 0 -> 1 over `fade_in`, holds 1 for `sustain`,
/// then ramps 1 -> 0 over `fade_out`. All times are in seconds.
///
/// The envelope is stateless: gains are calculated from the elapsed time since its start,
/// so it can be evaluated at any position without running it from the beginning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsrEnvelope {
    fade_in: f64,
    sustain: f64,
    fade_out: f64,
}

impl AsrEnvelope {
    /// Create a new envelope. Negative or NaN segment lengths are treated as zero.
    pub fn new(fade_in: f64, sustain: f64, fade_out: f64) -> Self {
        let sanitize = |value: f64| if value > 0.0 { value } else { 0.0 };
        Self {
            fade_in: sanitize(fade_in),
            sustain: sanitize(sustain),
            fade_out: sanitize(fade_out),
        }
    }

    pub fn fade_in(&self) -> f64 {
        self.fade_in
    }
    pub fn sustain(&self) -> f64 {
        self.sustain
    }
    pub fn fade_out(&self) -> f64 {
        self.fade_out
    }

    /// Total length of the envelope in seconds.
    pub fn duration(&self) -> f64 {
        self.fade_in + self.sustain + self.fade_out
    }

    /// Stage of the envelope at the given time, relative to the envelope's start.
    pub fn stage_at(&self, elapsed: f64) -> AsrStage {
        if elapsed < 0.0 {
            AsrStage::Idle
        } else if elapsed < self.fade_in {
            AsrStage::Attack
        } else if elapsed < self.fade_in + self.sustain {
            AsrStage::Sustain
        } else if elapsed < self.duration() {
            AsrStage::Release
        } else {
            AsrStage::Finished
        }
    }

    /// Gain at the given time, relative to the envelope's start.
    pub fn gain_at(&self, elapsed: f64) -> f32 {
        let gain = match self.stage_at(elapsed) {
            AsrStage::Idle | AsrStage::Finished => 0.0,
            AsrStage::Attack => elapsed / self.fade_in,
            AsrStage::Sustain => 1.0,
            AsrStage::Release => {
                1.0 - (elapsed - self.fade_in - self.sustain) / self.fade_out
            }
        };
        gain.clamp(0.0, 1.0) as f32
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn segment_boundaries() {
        let (a, b, c) = (0.1, 0.25, 0.4);
        let env = AsrEnvelope::new(a, b, c);
        assert!((env.duration() - 0.75).abs() < 1e-12);

        assert_eq!(env.gain_at(0.0), 0.0);
        assert!((env.gain_at(a) - 1.0).abs() < EPSILON);
        assert!((env.gain_at(a + b - 1e-9) - 1.0).abs() < EPSILON);
        assert!((env.gain_at(a + b) - 1.0).abs() < EPSILON);
        assert_eq!(env.gain_at(a + b + c), 0.0);
        assert_eq!(env.gain_at(-0.5), 0.0);
        assert_eq!(env.gain_at(10.0), 0.0);
    }

    #[test]
    fn monotonic_segments() {
        let env = AsrEnvelope::new(0.05, 0.1, 0.2);
        let steps = 1000;
        let mut last = env.gain_at(0.0);
        for step in 1..=steps {
            let gain = env.gain_at(0.05 * step as f64 / steps as f64);
            assert!(gain >= last, "attack must rise");
            last = gain;
        }
        let mut last = env.gain_at(0.15);
        for step in 1..=steps {
            let gain = env.gain_at(0.15 + 0.2 * step as f64 / steps as f64);
            assert!(gain <= last, "release must fall");
            last = gain;
        }
        assert!((env.gain_at(0.025) - 0.5).abs() < EPSILON);
        assert!((env.gain_at(0.25) - 0.5).abs() < EPSILON);
    }

    #[test]
    fn stages() {
        let env = AsrEnvelope::new(1.0, 1.0, 1.0);
        assert_eq!(env.stage_at(-1.0), AsrStage::Idle);
        assert_eq!(env.stage_at(0.5), AsrStage::Attack);
        assert_eq!(env.stage_at(1.5), AsrStage::Sustain);
        assert_eq!(env.stage_at(2.5), AsrStage::Release);
        assert_eq!(env.stage_at(3.0), AsrStage::Finished);
    }

    #[test]
    fn degenerated_segments() {
        // no attack: starts at full gain
        let env = AsrEnvelope::new(0.0, 0.1, 0.1);
        assert_eq!(env.gain_at(0.0), 1.0);
        // negative and NaN times are treated as zero
        let env = AsrEnvelope::new(-1.0, f64::NAN, 0.2);
        assert_eq!(env.duration(), 0.2);
        assert_eq!(env.gain_at(0.0), 1.0);
        assert_eq!(env.gain_at(0.2), 0.0);
    }
}
