//! A single, disposable granular playback unit.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    params::GrainRealtimeParams,
    source::sample::DecodedSample,
    utils::{asr::AsrEnvelope, time::seconds_to_sample_time},
};

// -------------------------------------------------------------------------------------------------

/// Shared release flag of a grain.
#[derive(Debug, Default)]
struct GrainLifecycle {
    released: AtomicBool,
}

impl GrainLifecycle {
    /// Mark as released. Returns true only for the call which actually released the grain.
    fn release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

// -------------------------------------------------------------------------------------------------

/// Allows stopping a grain which got handed over to an output bus, and querying whether
/// it has finished.
#[derive(Debug, Clone)]
pub struct GrainHandle {
    lifecycle: Arc<GrainLifecycle>,
}

impl GrainHandle {
    /// Stop the grain's output and release it. Returns false when the grain already was
    /// released, either by finishing its playback or by a previous call.
    pub fn destroy(&self) -> bool {
        self.lifecycle.release()
    }

    pub fn is_released(&self) -> bool {
        self.lifecycle.is_released()
    }
}

// -------------------------------------------------------------------------------------------------

/// Playback properties of a grain, captured by value when it gets played.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainPlayback {
    /// Absolute device time in seconds at which the grain starts.
    pub start_time: f64,
    /// Read position in the sample buffer in seconds, at the grain's start.
    pub sample_offset: f64,
    pub envelope: AsrEnvelope,
    pub playback_rate: f64,
}

impl GrainPlayback {
    /// Absolute device time in seconds at which the grain's envelope ends.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.envelope.duration()
    }
}

// -------------------------------------------------------------------------------------------------

/// A short, enveloped snippet of a sample buffer.
///
/// Grains are created by the grain engine, played exactly once and then handed over to an
/// output bus, which renders them from their start time on until their envelope finished.
/// A grain only holds a reference to its sample buffer, and never refers to the live grain
/// parameters: all properties are copied into the grain when calling [`SoundGrain::play`].
#[derive(Debug)]
pub struct SoundGrain {
    sample: Arc<DecodedSample>,
    volume: f32,
    playback: Option<GrainPlayback>,
    lifecycle: Arc<GrainLifecycle>,
}

impl SoundGrain {
    pub fn new(sample: Arc<DecodedSample>) -> Self {
        Self {
            sample,
            volume: 1.0,
            playback: None,
            lifecycle: Arc::default(),
        }
    }

    /// Set the grain's output gain, applied on top of its envelope.
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn sample(&self) -> &Arc<DecodedSample> {
        &self.sample
    }

    /// Captured playback properties, once the grain got played.
    pub fn playback(&self) -> Option<&GrainPlayback> {
        self.playback.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_some()
    }

    /// Schedule the grain to start at `schedule_time` (device time in seconds), reading from
    /// `sample_offset` seconds into its sample. The envelope and rate get copied from the
    /// given parameters.
    pub fn play(&mut self, sample_offset: f64, schedule_time: f64, params: &GrainRealtimeParams) {
        let playback_rate = if params.playback_rate > 0.0 && params.playback_rate.is_finite() {
            params.playback_rate
        } else {
            1.0
        };
        self.playback = Some(GrainPlayback {
            start_time: schedule_time,
            sample_offset: sample_offset.max(0.0),
            envelope: AsrEnvelope::new(
                params.fade_in_time,
                params.sustain_time,
                params.fade_out_time,
            ),
            playback_rate,
        });
    }

    /// Create a new handle to control the grain's lifetime.
    pub fn handle(&self) -> GrainHandle {
        GrainHandle {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    /// Release the grain: it will no longer produce any output. Safe to call multiple times:
    /// returns true for the call which actually released the grain only.
    pub fn destroy(&self) -> bool {
        self.lifecycle.release()
    }

    pub fn is_released(&self) -> bool {
        self.lifecycle.is_released()
    }

    /// Envelope gain at the given absolute device time.
    pub fn gain_at(&self, time: f64) -> f32 {
        match &self.playback {
            Some(playback) => playback.envelope.gain_at(time - playback.start_time),
            None => 0.0,
        }
    }

    /// Number of frames the grain produces output for at the given output sample rate.
    pub fn lifetime_in_frames(&self, sample_rate: u32) -> u64 {
        self.playback.as_ref().map_or(0, |playback| {
            seconds_to_sample_time(playback.envelope.duration(), sample_rate)
        })
    }

    /// Add the grain's output to the given interleaved `output` buffer, with `elapsed_frames`
    /// as the grain's playback position of the buffer's first frame.
    ///
    /// Returns true when the grain reached the end of its envelope with this call.
    pub(crate) fn render(
        &self,
        output: &mut [f32],
        channel_count: usize,
        sample_rate: u32,
        elapsed_frames: u64,
    ) -> bool {
        let Some(playback) = &self.playback else {
            return true;
        };
        let lifetime = self.lifetime_in_frames(sample_rate);
        if self.is_released() || elapsed_frames >= lifetime {
            return true;
        }

        let sample = &self.sample;
        let sample_channel_count = sample.channel_count();
        let output_rate = sample_rate as f64;
        let source_step = playback.playback_rate * sample.sample_rate() as f64 / output_rate;
        let source_start = playback.sample_offset * sample.sample_rate() as f64;

        let output_frame_count = output.len() / channel_count;
        let frames_to_render = output_frame_count.min((lifetime - elapsed_frames) as usize);

        for (index, frame) in output
            .chunks_exact_mut(channel_count)
            .take(frames_to_render)
            .enumerate()
        {
            let grain_frame = elapsed_frames + index as u64;
            let gain = playback.envelope.gain_at(grain_frame as f64 / output_rate) * self.volume;
            if gain == 0.0 {
                continue;
            }
            let position = source_start + grain_frame as f64 * source_step;
            if channel_count == 1 {
                let mut sum = 0.0;
                for sample_channel in 0..sample_channel_count {
                    sum += sample.sample_at(sample_channel, position);
                }
                frame[0] += sum / sample_channel_count as f32 * gain;
            } else {
                for (channel, value) in frame.iter_mut().enumerate() {
                    *value += sample.sample_at(channel % sample_channel_count, position) * gain;
                }
            }
        }

        elapsed_frames + output_frame_count as u64 >= lifetime
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn constant_sample(value: f32, frames: usize, sample_rate: u32) -> Arc<DecodedSample> {
        Arc::new(DecodedSample::new(vec![vec![value; frames]], sample_rate).unwrap())
    }

    #[test]
    fn destroy_is_one_shot() {
        let grain = SoundGrain::new(constant_sample(1.0, 10, 10));
        let handle = grain.handle();
        assert!(!grain.is_released());
        assert!(handle.destroy());
        assert!(!grain.destroy());
        assert!(!handle.destroy());
        assert!(grain.is_released());
        assert!(handle.is_released());
    }

    #[test]
    fn plays_with_given_params() {
        let mut grain = SoundGrain::new(constant_sample(1.0, 100, 100));
        let params = GrainRealtimeParams::default()
            .fade_in_time(0.1)
            .sustain_time(0.2)
            .fade_out_time(0.3)
            .playback_rate(2.0);
        grain.play(0.25, 1.0, &params);

        let playback = grain.playback().copied().unwrap();
        assert_eq!(playback.start_time, 1.0);
        assert_eq!(playback.sample_offset, 0.25);
        assert_eq!(playback.playback_rate, 2.0);
        assert_eq!(playback.envelope, AsrEnvelope::new(0.1, 0.2, 0.3));
        assert!((playback.end_time() - 1.6).abs() < 1e-12);
    }

    #[test]
    fn envelope_in_device_time() {
        let (a, b, c) = (0.02, 0.05, 0.03);
        let mut grain = SoundGrain::new(constant_sample(1.0, 1000, 1000));
        let params = GrainRealtimeParams::default()
            .fade_in_time(a)
            .sustain_time(b)
            .fade_out_time(c);
        let start = 3.0;
        grain.play(0.0, start, &params);
        assert_eq!(grain.gain_at(start), 0.0);
        assert!((grain.gain_at(start + a) - 1.0).abs() < 1e-6);
        assert!((grain.gain_at(start + a + b) - 1.0).abs() < 1e-6);
        assert!(grain.gain_at(start + a + b + c).abs() < 1e-6);
        assert_eq!(grain.gain_at(start + 1.0), 0.0);
    }

    #[test]
    fn render_output() -> Result<(), Error> {
        let sample_rate = 1000;
        let mut grain = SoundGrain::new(constant_sample(0.5, 1000, sample_rate));
        let params = GrainRealtimeParams::default()
            .fade_in_time(0.0)
            .sustain_time(0.01)
            .fade_out_time(0.0);
        grain.play(0.0, 0.0, &params);
        assert_eq!(grain.lifetime_in_frames(sample_rate), 10);

        // stereo output from a mono sample: both channels carry the sample
        let mut output = vec![0.0; 2 * 8];
        assert!(!grain.render(&mut output, 2, sample_rate, 0));
        assert!(output.iter().all(|v| *v == 0.5));

        // the last two frames finish the grain, the rest stays untouched
        let mut output = vec![0.0; 2 * 8];
        assert!(grain.render(&mut output, 2, sample_rate, 8));
        assert!(output[..4].iter().all(|v| *v == 0.5));
        assert!(output[4..].iter().all(|v| *v == 0.0));

        // volume scales the output
        let mut quiet_grain = SoundGrain::new(Arc::clone(grain.sample())).with_volume(0.5);
        quiet_grain.play(0.0, 0.0, &params);
        let mut output = vec![0.0; 2];
        quiet_grain.render(&mut output, 1, sample_rate, 0);
        assert_eq!(output, vec![0.25, 0.25]);

        // released grains no longer render
        grain.destroy();
        let mut output = vec![0.0; 2];
        assert!(grain.render(&mut output, 2, sample_rate, 0));
        assert_eq!(output, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn render_reads_past_end_as_silence() {
        let sample_rate = 100;
        let mut grain = SoundGrain::new(constant_sample(1.0, 10, sample_rate));
        let params = GrainRealtimeParams::default()
            .fade_in_time(0.0)
            .sustain_time(0.2)
            .fade_out_time(0.0);
        grain.play(0.0, 0.0, &params);
        let mut output = vec![0.0; 20];
        assert!(grain.render(&mut output, 1, sample_rate, 0));
        assert!(output[..9].iter().all(|v| *v == 1.0));
        assert!(output[10..].iter().all(|v| *v == 0.0));
    }
}
