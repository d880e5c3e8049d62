pub mod bus;
pub mod sample;

// -------------------------------------------------------------------------------------------------

/// Types that can produce audio samples in `f32` format. `Send`able across threads.
pub trait Source: Send + 'static {
    /// Write at most of `output.len()` interleaved samples into the `output`. Returns the
    /// number of written samples. Should take care to always output a full frame, and
    /// should _never_ block or allocate.
    fn write(&mut self, output: &mut [f32]) -> usize;

    /// The source's output channel layout.
    fn channel_count(&self) -> usize;
    /// The source's output sample rate.
    fn sample_rate(&self) -> u32;

    /// Returns true when the source finished playback and will no longer produce output.
    fn is_exhausted(&self) -> bool;
}

// -------------------------------------------------------------------------------------------------

/// A source which does not produce any samples.
pub struct EmptySource;

impl Source for EmptySource {
    fn write(&mut self, _output: &mut [f32]) -> usize {
        0
    }

    fn channel_count(&self) -> usize {
        0
    }

    fn sample_rate(&self) -> u32 {
        0
    }

    fn is_exhausted(&self) -> bool {
        true
    }
}
