use std::sync::Arc;

use crate::{
    error::Error,
    params::SharedGrainParams,
    sampler::{RoundSampler, RoundSamplerOptions},
    source::{
        bus::GrainSink,
        sample::{SampleDefinition, SampleFetcher, SampleSource},
    },
    utils::time::DeviceClock,
};

// -------------------------------------------------------------------------------------------------

/// A fixed set of [`RoundSampler`] voices, which share one sink, one parameter record and
/// one sample.
///
/// Triggers get played on the first voice which is not in use. Voices are never stolen:
/// when all voices are busy, triggering fails with [`Error::VoiceInUse`].
pub struct VoicePool {
    voices: Vec<RoundSampler>,
    fetcher: Arc<dyn SampleFetcher>,
}

impl VoicePool {
    /// Create a pool with `voice_count` idle voices.
    pub fn new<C: DeviceClock + Clone + 'static>(
        voice_count: usize,
        clock: C,
        sink: Arc<dyn GrainSink>,
        params: SharedGrainParams,
        fetcher: Arc<dyn SampleFetcher>,
        options: RoundSamplerOptions,
    ) -> Result<Self, Error> {
        if voice_count == 0 {
            return Err(Error::ParameterError(
                "voice pool needs at least one voice".to_string(),
            ));
        }
        let voices = (0..voice_count)
            .map(|_| {
                RoundSampler::new(
                    clock.clone(),
                    Arc::clone(&sink),
                    params.clone(),
                    Arc::clone(&fetcher),
                    options,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("Created voice pool with {voice_count} voices");
        Ok(Self { voices, fetcher })
    }

    pub fn voices(&self) -> &[RoundSampler] {
        &self.voices
    }

    /// Number of voices which currently are in use.
    pub fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|voice| voice.is_in_use()).count()
    }

    /// Start the first free voice at `start_time` and optionally schedule its end.
    /// Returns the index of the started voice.
    pub fn trigger(&self, start_time: f64, stop_time: Option<f64>) -> Result<usize, Error> {
        for (index, voice) in self.voices.iter().enumerate() {
            if voice.is_in_use() {
                continue;
            }
            match voice.schedule_start(start_time) {
                Ok(()) => {
                    if let Some(stop_time) = stop_time {
                        voice.schedule_end(stop_time)?;
                    }
                    return Ok(index);
                }
                Err(Error::VoiceInUse) => continue,
                Err(err) => return Err(err),
            }
        }
        log::warn!("All {} voices are in use: ignoring trigger", self.voices.len());
        Err(Error::VoiceInUse)
    }

    /// Load the given sample once and use it in all voices. Blocks until the sample got
    /// loaded. On errors, all voices keep their current sample.
    pub fn set_sample(&self, definition: SampleDefinition) -> Result<Arc<SampleSource>, Error> {
        let source = Arc::new(SampleSource::new(definition));
        source.load(self.fetcher.as_ref())?;
        self.set_sample_source(Arc::clone(&source))?;
        Ok(source)
    }

    /// Use the given loaded sample source in all voices.
    pub fn set_sample_source(&self, source: Arc<SampleSource>) -> Result<(), Error> {
        for voice in &self.voices {
            voice.set_sample_source(Arc::clone(&source))?;
        }
        Ok(())
    }

    /// Stop all voices immediately. Already emitted grains play until they finished.
    pub fn stop_all(&self) -> Result<(), Error> {
        for voice in &self.voices {
            voice.stop()?;
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------
