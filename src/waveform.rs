//! Helper functions to generate waveform display data from decoded samples.
//!
//! Waveform data is used for display purposes only and is never calculated in the audio
//! rendering path.

use std::{ops::Range, time::Duration};

use crate::source::sample::DecodedSample;

// -------------------------------------------------------------------------------------------------

/// A single point in a waveform view plot, which represents a condensed view of the audio data at
/// the specified time as min/max values.
/// The slice width is indirectly specified via the resolution parameter when generating the points.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WaveformPoint {
    /// Start time this point refers to in the original sample buffer.
    pub time: Duration,
    /// The minimum of all values which are represented by this time slice.
    pub min: f32,
    /// The maximum of all values which are represented by this time slice.
    pub max: f32,
}

// -------------------------------------------------------------------------------------------------

/// Generates mono (mixed down) display data for waveform plots with the given resolution from the
/// given sample.
///
/// Resolution usually is the width in pixels that you want to draw the waveform into. The returned
/// points are guaranteed to be smaller or equal to the given resolution. When they are smaller,
/// there are less sample frames than the specified resolution present in the sample. The waveform
/// must then be drawn upscaled.
pub fn waveform_from_sample(sample: &DecodedSample, resolution: usize) -> Vec<WaveformPoint> {
    let frame_count = sample.frame_count();
    let channel_count = sample.channel_count();
    let sample_rate = sample.sample_rate() as f64;
    let mono_value = |frame_index: usize| {
        sample
            .channels()
            .iter()
            .fold(0.0, |accum, channel| accum + channel[frame_index] / channel_count as f32)
    };
    let time = |frame_index: usize| Duration::from_secs_f64(frame_index as f64 / sample_rate);

    // upscale
    if frame_count <= resolution {
        (0..frame_count)
            .map(|frame_index| {
                let value = mono_value(frame_index);
                WaveformPoint {
                    time: time(frame_index),
                    min: value,
                    max: value,
                }
            })
            .collect()
    }
    // downscale
    else {
        let step_size = frame_count as f64 / resolution as f64;
        (0..resolution)
            .map(|index| {
                let slice_start = (index as f64 * step_size) as usize;
                let slice_end = (((index + 1) as f64 * step_size) as usize)
                    .clamp(slice_start + 1, frame_count);
                let (min, max) = (slice_start..slice_end).map(mono_value).fold(
                    (f32::MAX, f32::MIN),
                    |(min, max), value| (min.min(value), max.max(value)),
                );
                WaveformPoint {
                    time: time(slice_start),
                    min,
                    max,
                }
            })
            .collect()
    }
}

// -------------------------------------------------------------------------------------------------

/// Frame range of a fragment of the given sample, starting at the proportional `offset`
/// (0.0 - 1.0) for `duration` seconds. The range is shorter when the sample ends earlier.
pub fn fragment_range(sample: &DecodedSample, offset: f64, duration: f64) -> Range<usize> {
    let frame_count = sample.frame_count();
    let sample_rate = sample.sample_rate() as f64;
    let start = ((offset.clamp(0.0, 1.0) * sample.duration() * sample_rate).floor() as usize)
        .min(frame_count);
    let length = (duration.max(0.0) * sample_rate).round() as usize;
    start..start.saturating_add(length).min(frame_count)
}

/// Copies the first channel of the given sample within the [`fragment_range`].
pub fn sample_fragment(sample: &DecodedSample, offset: f64, duration: f64) -> Vec<f32> {
    let channel = sample.channel(0).unwrap_or_default();
    channel[fragment_range(sample, offset, duration)].to_vec()
}

/// Condenses the given fragment to `point_count` display values.
///
/// When the fragment has less values than points, values are picked from the fragment.
/// Otherwise each point represents a slice of the fragment, using the slice's min or max
/// value, whichever has the larger magnitude. Values keep the fragment's range, so for
/// normalized audio data they are within \[-1, 1\]. Empty fragments result in zeros.
pub fn wave_shape(fragment: &[f32], point_count: usize) -> Vec<f32> {
    let mut values = vec![0.0; point_count];
    if fragment.is_empty() || point_count == 0 {
        return values;
    }
    let length = fragment.len();
    let step = length as f64 / point_count as f64;
    for (index, value) in values.iter_mut().enumerate() {
        let start = (index as f64 * step).floor() as usize;
        if start >= length {
            continue;
        }
        if step <= 1.0 {
            *value = fragment[start];
        } else {
            let end = (((index + 1) as f64 * step).floor() as usize).clamp(start + 1, length);
            *value = peak_value(&fragment[start..end]);
        }
    }
    values
}

/// Min or max value of the given slice, whichever has the larger magnitude.
fn peak_value(slice: &[f32]) -> f32 {
    let (min, max) = slice
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), value| {
            (min.min(*value), max.max(*value))
        });
    if -min > max {
        min
    } else {
        max
    }
}

// -------------------------------------------------------------------------------------------------
