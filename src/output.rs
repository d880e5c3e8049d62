#[cfg(feature = "cpal-output")]
pub mod cpal;
#[cfg(feature = "wav-output")]
pub mod wav;

use crate::{error::Error, source::Source};

// -------------------------------------------------------------------------------------------------

/// The default audio output type.
#[cfg(feature = "cpal-output")]
pub type DefaultOutputDevice = cpal::CpalOutput;

// -------------------------------------------------------------------------------------------------

/// Audio output device: pulls samples from a single [`Source`], usually an
/// [`OutputBus`](crate::OutputBus), and plays them back.
pub trait OutputDevice: Send {
    /// Actual device's output sample buffer channel count.
    fn channel_count(&self) -> usize;
    /// Actual device's output sample rate.
    fn sample_rate(&self) -> u32;
    /// Actual device's output playhead position in sample frames.
    fn sample_position(&self) -> u64;

    /// Get actual output volume.
    fn volume(&self) -> f32;
    /// Set a new output volume.
    fn set_volume(&mut self, volume: f32);

    /// True when the device is writing the source's output, false when paused or closed.
    fn is_running(&self) -> bool;

    /// Play given source as main output source. The source must match the device's
    /// channel count and sample rate.
    fn play(&mut self, source: Box<dyn Source>) -> Result<(), Error>;
    /// Drop actual source, replacing it with silence.
    fn stop(&mut self);
    /// Pause playback without dropping the output source.
    fn pause(&mut self);
    /// Resume from paused playback.
    fn resume(&mut self);

    /// Release audio device.
    fn close(&mut self);
}

/// Ensure the given source can be played on a device with the given specs.
pub(crate) fn validate_source(
    source: &dyn Source,
    channel_count: usize,
    sample_rate: u32,
) -> Result<(), Error> {
    if source.channel_count() != channel_count || source.sample_rate() != sample_rate {
        return Err(Error::ParameterError(format!(
            "source specs ({} channels, {} Hz) don't match the output device ({} channels, {} Hz)",
            source.channel_count(),
            source.sample_rate(),
            channel_count,
            sample_rate
        )));
    }
    Ok(())
}
