//! The top level playback facade: one granular voice.

use std::{
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use crate::{
    engine::{GrainEngine, GrainEngineOptions},
    error::Error,
    params::SharedGrainParams,
    source::{
        bus::GrainSink,
        sample::{SampleDefinition, SampleFetcher, SampleLoadTask, SampleSource},
    },
    utils::{lock, time::DeviceClock},
    waveform::{fragment_range, wave_shape, waveform_from_sample, WaveformPoint},
};

pub mod pool;

// -------------------------------------------------------------------------------------------------

/// Options for a [`RoundSampler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundSamplerOptions {
    /// Scheduler frame length in seconds. By default 0.1.
    pub frame_length: f64,
    /// Output gain of the voice's grains. By default 0.5.
    pub volume: f32,
    /// Max number of grains playing on the voice's sink, before new grains get skipped.
    /// By default 512.
    pub max_active_grains: Option<usize>,
}

impl Default for RoundSamplerOptions {
    fn default() -> Self {
        let engine_defaults = GrainEngineOptions::default();
        Self {
            frame_length: engine_defaults.frame_length,
            volume: 0.5,
            max_active_grains: engine_defaults.max_active_grains,
        }
    }
}

impl RoundSamplerOptions {
    pub fn frame_length(mut self, frame_length: f64) -> Self {
        self.frame_length = frame_length;
        self
    }

    pub fn volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    pub fn max_active_grains(mut self, max_active_grains: Option<usize>) -> Self {
        self.max_active_grains = max_active_grains;
        self
    }

    /// Validate all parameters. Returns `Error::ParameterError` on errors.
    pub fn validate(&self) -> Result<(), Error> {
        self.engine_options().validate()
    }

    fn engine_options(&self) -> GrainEngineOptions {
        GrainEngineOptions::default()
            .frame_length(self.frame_length)
            .volume(self.volume)
            .max_active_grains(self.max_active_grains)
    }
}

// -------------------------------------------------------------------------------------------------

/// Cached extract of the current sample, used for wave shape previews.
#[derive(Debug, Default)]
struct FragmentBuffer {
    key: Option<(usize, Range<usize>)>,
    values: Vec<f32>,
}

/// Voice state shared with the scheduler's stop callback and background loaders.
#[derive(Debug, Default)]
struct VoiceShared {
    in_use: AtomicBool,
    sample_start_offset: Mutex<f64>,
    requested_generation: AtomicU64,
    applied_generation: Mutex<u64>,
    fragment: Mutex<FragmentBuffer>,
}

impl VoiceShared {
    fn next_generation(&self) -> u64 {
        self.requested_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Swap in the given loaded source, unless a newer request already got applied.
    fn apply_sample_source(&self, engine: &GrainEngine, generation: u64, source: Arc<SampleSource>) {
        let mut applied_generation = lock(&self.applied_generation);
        if generation > *applied_generation {
            log::info!("Using sample {}", source.definition());
            engine.set_sample_source(Some(source));
            *applied_generation = generation;
        } else {
            log::debug!(
                "Ignoring outdated sample {}: a newer sample got set already",
                source.definition()
            );
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// A single granular voice: plays grains from its current sample into a grain sink.
///
/// A voice can only play once at a time. Starting it while it's in use is a usage error.
/// The voice becomes available again when its scheduler stopped, which happens
/// asynchronously after [`RoundSampler::schedule_end`] or [`RoundSampler::stop`].
///
/// Samples can be swapped at any time, also while playing: grains which already got
/// emitted keep playing the sample they got created with.
pub struct RoundSampler {
    engine: Arc<GrainEngine>,
    shared: Arc<VoiceShared>,
    fetcher: Arc<dyn SampleFetcher>,
}

impl RoundSampler {
    /// Create a new idle voice without a sample.
    pub fn new<C: DeviceClock + 'static>(
        clock: C,
        sink: Arc<dyn GrainSink>,
        params: SharedGrainParams,
        fetcher: Arc<dyn SampleFetcher>,
        options: RoundSamplerOptions,
    ) -> Result<Self, Error> {
        options.validate()?;
        let shared = Arc::new(VoiceShared::default());
        let engine = Arc::new(GrainEngine::new(
            clock,
            sink,
            params,
            options.engine_options(),
            {
                let shared = Arc::clone(&shared);
                move || {
                    shared.in_use.store(false, Ordering::Release);
                }
            },
        )?);
        Ok(Self {
            engine,
            shared,
            fetcher,
        })
    }

    /// The underlying grain engine.
    pub fn engine(&self) -> &GrainEngine {
        &self.engine
    }

    /// The live grain parameters of this voice.
    pub fn params(&self) -> &SharedGrainParams {
        self.engine.params()
    }

    /// True from a successful [`Self::schedule_start`] until the voice stopped.
    pub fn is_in_use(&self) -> bool {
        self.shared.in_use.load(Ordering::Acquire)
    }

    /// The currently used, loaded sample source.
    pub fn sample_source(&self) -> Option<Arc<SampleSource>> {
        self.engine.sample_source()
    }

    /// Duration of the current sample in seconds, or 0 when no sample is loaded.
    pub fn get_duration(&self) -> f64 {
        self.sample_source().map_or(0.0, |source| source.duration())
    }

    /// Sample offset in seconds of the latest start, converted from the proportional offset
    /// parameter at the time the voice got started.
    pub fn sample_start_offset(&self) -> f64 {
        *lock(&self.shared.sample_start_offset)
    }

    /// Start playing at the given device time.
    ///
    /// Fails with [`Error::VoiceInUse`] when the voice is already playing and with
    /// [`Error::SampleNotLoaded`] when no sample is set. Both leave the voice as it is.
    pub fn schedule_start(&self, start_time: f64) -> Result<(), Error> {
        if self.is_in_use() {
            return Err(Error::VoiceInUse);
        }
        let sample = self
            .sample_source()
            .and_then(|source| source.sample())
            .ok_or(Error::SampleNotLoaded)?;
        if self
            .shared
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::VoiceInUse);
        }
        let offset = self.params().snapshot().sample_offset_time.clamp(0.0, 1.0);
        *lock(&self.shared.sample_start_offset) = offset * sample.duration();

        if let Err(err) = self.engine.schedule_start(start_time) {
            self.shared.in_use.store(false, Ordering::Release);
            return Err(err);
        }
        log::debug!("Voice started at {start_time:.3}");
        Ok(())
    }

    /// Stop playing at the given device time. The voice gets available again once the
    /// scheduler reached the stop time.
    pub fn schedule_end(&self, stop_time: f64) -> Result<(), Error> {
        self.engine.schedule_stop(stop_time)
    }

    /// Stop emitting grains right away. Already emitted grains play until they finished.
    pub fn stop(&self) -> Result<(), Error> {
        self.engine.stop()
    }

    /// Load the given sample and use it, once it successfully loaded. Blocks until the
    /// sample got loaded.
    ///
    /// On errors, the current sample stays in place.
    pub fn set_sample(&self, definition: SampleDefinition) -> Result<Arc<SampleSource>, Error> {
        let generation = self.shared.next_generation();
        let source = Arc::new(SampleSource::new(definition));
        source.load(self.fetcher.as_ref())?;
        self.shared
            .apply_sample_source(&self.engine, generation, Arc::clone(&source));
        Ok(source)
    }

    /// Load the given sample on a background thread and use it once it loaded, unless
    /// another sample got set in the meantime. Use the returned task to query the loading
    /// state or to wait for the load.
    pub fn set_sample_in_background(
        &self,
        definition: SampleDefinition,
    ) -> Result<SampleLoadTask, Error> {
        let generation = self.shared.next_generation();
        let source = Arc::new(SampleSource::new(definition));
        let engine = Arc::downgrade(&self.engine);
        let shared = Arc::clone(&self.shared);
        let fetcher = Arc::clone(&self.fetcher);
        SampleLoadTask::spawn(source, move |source| {
            source.load(fetcher.as_ref())?;
            if let Some(engine) = Weak::upgrade(&engine) {
                shared.apply_sample_source(&engine, generation, Arc::clone(source));
            }
            Ok(())
        })
    }

    /// Use an already loaded sample source. Fails with [`Error::SampleNotLoaded`] when the
    /// source isn't loaded.
    pub fn set_sample_source(&self, source: Arc<SampleSource>) -> Result<(), Error> {
        if source.sample().is_none() {
            return Err(Error::SampleNotLoaded);
        }
        let generation = self.shared.next_generation();
        self.shared
            .apply_sample_source(&self.engine, generation, source);
        Ok(())
    }

    /// Refresh the cached sample fragment, when the sample or grain parameters changed.
    ///
    /// The fragment is the first channel of the current sample, starting at the
    /// proportional sample offset, with the length of a grain. Returns true when the
    /// fragment changed.
    pub fn update_fragment_buffer(&self) -> bool {
        let params = self.params().snapshot();
        let sample = self
            .sample_source()
            .and_then(|source| source.sample().map(|sample| (source.id(), sample)));
        let mut fragment = lock(&self.shared.fragment);
        let Some((source_id, sample)) = sample else {
            let changed = fragment.key.is_some();
            *fragment = FragmentBuffer::default();
            return changed;
        };
        let range = fragment_range(
            &sample,
            params.sample_offset_time,
            params.grain_duration(),
        );
        let key = Some((source_id, range.clone()));
        if fragment.key == key {
            return false;
        }
        fragment.values = sample.channel(0).unwrap_or_default()[range].to_vec();
        fragment.key = key;
        true
    }

    /// Copy of the current sample fragment, as updated by [`Self::update_fragment_buffer`].
    pub fn fragment_buffer(&self) -> Vec<f32> {
        lock(&self.shared.fragment).values.clone()
    }

    /// Display values of the current sample fragment: `point_count` values in the sample's
    /// value range. All zero when no sample is loaded.
    pub fn get_wave_shape(&self, point_count: usize) -> Vec<f32> {
        self.update_fragment_buffer();
        wave_shape(&lock(&self.shared.fragment).values, point_count)
    }

    /// Overview of the whole current sample for waveform displays. Empty when no sample
    /// is loaded.
    pub fn get_waveform(&self, resolution: usize) -> Vec<WaveformPoint> {
        self.sample_source()
            .and_then(|source| source.sample())
            .map(|sample| waveform_from_sample(&sample, resolution))
            .unwrap_or_default()
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use crossbeam_channel::Receiver;

    use super::*;
    use crate::{
        engine::tests::RecordingSink,
        params::GrainRealtimeParams,
        scheduler::SchedulerFrame,
        source::{
            bus::OutputBus,
            sample::{
                tests::{wav_bytes, MemoryFetcher},
                DecodedSample, SampleLoadState,
            },
            Source,
        },
        utils::time::ManualClock,
    };

    pub(crate) fn loaded_source(channel: Vec<f32>, sample_rate: u32) -> Arc<SampleSource> {
        Arc::new(SampleSource::from_decoded(
            SampleDefinition::new("test", "test.wav"),
            DecodedSample::new(vec![channel], sample_rate).unwrap(),
        ))
    }

    fn new_sampler(
        sink: Arc<dyn GrainSink>,
        params: GrainRealtimeParams,
        fetcher: Arc<dyn SampleFetcher>,
    ) -> Result<RoundSampler, Error> {
        RoundSampler::new(
            ManualClock::new(0.0),
            sink,
            SharedGrainParams::new(params),
            fetcher,
            RoundSamplerOptions::default(),
        )
    }

    pub(crate) fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    #[test]
    fn start_requires_sample() -> Result<(), Error> {
        let sampler = new_sampler(
            Arc::new(RecordingSink::default()),
            GrainRealtimeParams::default(),
            Arc::new(MemoryFetcher::default()),
        )?;
        let result = sampler.schedule_start(0.0);
        assert!(matches!(result, Err(Error::SampleNotLoaded)));
        assert!(!sampler.is_in_use());
        assert!(!sampler.engine().is_running());

        // unloaded sources can't be set
        let unloaded = Arc::new(SampleSource::new(SampleDefinition::new("a", "a.wav")));
        assert!(matches!(
            sampler.set_sample_source(unloaded),
            Err(Error::SampleNotLoaded)
        ));
        Ok(())
    }

    #[test]
    fn second_start_is_usage_error() -> Result<(), Error> {
        let sink = Arc::new(RecordingSink::default());
        let params = GrainRealtimeParams::default()
            .grains_per_second(10.0)
            .sample_offset_time(0.5);
        let sampler = new_sampler(sink.clone(), params, Arc::new(MemoryFetcher::default()))?;
        sampler.set_sample_source(loaded_source(vec![0.0; 200], 100))?;

        sampler.schedule_start(0.0)?;
        assert!(sampler.is_in_use());
        assert_eq!(sampler.sample_start_offset(), 1.0);
        assert!(wait_until(|| !sink.start_times().is_empty()));

        let result = sampler.schedule_start(1.0);
        assert!(matches!(result, Err(Error::VoiceInUse)));
        assert!(result.is_err_and(|err| err.is_usage_error()));
        // the running playback is unaffected
        assert!(sampler.is_in_use());
        assert!(sampler.engine().is_running());
        assert_eq!(sink.start_times()[0], 0.0);

        // the voice is available again once the scheduler stopped
        sampler.stop()?;
        assert!(wait_until(|| !sampler.is_in_use()));
        sampler.schedule_start(1.0)?;
        assert!(sampler.is_in_use());
        sampler.stop()?;
        Ok(())
    }

    #[test]
    fn duration_follows_loads() -> Result<(), Error> {
        let fetcher = MemoryFetcher::default()
            .with_file("short.wav", wav_bytes(&[vec![0.25; 4410]], 44100))
            .with_file("long.wav", wav_bytes(&[vec![0.25; 22050]], 44100));
        let sampler = new_sampler(
            Arc::new(RecordingSink::default()),
            GrainRealtimeParams::default(),
            Arc::new(fetcher),
        )?;
        assert_eq!(sampler.get_duration(), 0.0);

        let source = sampler.set_sample(SampleDefinition::new("short", "short.wav"))?;
        assert_eq!(source.state(), SampleLoadState::Loaded);
        assert_eq!(sampler.get_duration(), 4410.0 / 44100.0);

        // failed loads keep the current sample
        let result = sampler.set_sample(SampleDefinition::new("missing", "missing.wav"));
        assert!(result.is_err_and(|err| !err.is_usage_error()));
        assert_eq!(sampler.sample_source().map(|s| s.id()), Some(source.id()));

        // background loads
        let task = sampler.set_sample_in_background(SampleDefinition::new("long", "long.wav"))?;
        let long_source = task.wait()?;
        assert_eq!(long_source.state(), SampleLoadState::Loaded);
        assert_eq!(sampler.get_duration(), 0.5);
        Ok(())
    }

    /// Blocks fetching the gated path until the gate opens.
    struct GatedFetcher {
        files: MemoryFetcher,
        gated_path: String,
        gate: Receiver<()>,
    }

    impl SampleFetcher for GatedFetcher {
        fn fetch(&self, path: &str) -> Result<Vec<u8>, Error> {
            if path == self.gated_path {
                let _ = self.gate.recv();
            }
            self.files.fetch(path)
        }
    }

    #[test]
    fn outdated_background_loads_are_ignored() -> Result<(), Error> {
        let (open_gate, gate) = crossbeam_channel::bounded(1);
        let fetcher = GatedFetcher {
            files: MemoryFetcher::default()
                .with_file("slow.wav", wav_bytes(&[vec![0.0; 100]], 100))
                .with_file("fast.wav", wav_bytes(&[vec![0.0; 300]], 100)),
            gated_path: "slow.wav".to_string(),
            gate,
        };
        let sampler = new_sampler(
            Arc::new(RecordingSink::default()),
            GrainRealtimeParams::default(),
            Arc::new(fetcher),
        )?;

        let task = sampler.set_sample_in_background(SampleDefinition::new("slow", "slow.wav"))?;
        assert_ne!(task.state(), SampleLoadState::Loaded);
        let fast = sampler.set_sample(SampleDefinition::new("fast", "fast.wav"))?;
        open_gate.send(())?;
        let slow = task.wait()?;

        assert_eq!(slow.state(), SampleLoadState::Loaded);
        assert_eq!(sampler.sample_source().map(|s| s.id()), Some(fast.id()));
        assert_eq!(sampler.get_duration(), 3.0);
        Ok(())
    }

    #[test]
    fn set_sample_keeps_playing_grains() -> Result<(), Error> {
        let sample_rate = 1000;
        let params = GrainRealtimeParams::default()
            .grains_per_second(10.0)
            .fade_in_time(0.1)
            .sustain_time(0.2)
            .fade_out_time(0.1);
        let old_sample: Vec<f32> = (0..1000).map(|i| (i as f32 / 20.0).sin()).collect();

        // two identical voices, playing into their own bus
        let mut buses = Vec::new();
        let mut samplers = Vec::new();
        for _ in 0..2 {
            let bus = OutputBus::new(1, sample_rate)?;
            let sampler = new_sampler(
                Arc::new(bus.handle()),
                params,
                Arc::new(MemoryFetcher::default()),
            )?;
            sampler.set_sample_source(loaded_source(old_sample.clone(), sample_rate))?;
            let first_frame = SchedulerFrame {
                start: 0.0,
                end: 0.1,
                is_first: true,
                is_last: false,
            };
            assert_eq!(sampler.engine().process_frame(&first_frame), 1);
            buses.push(bus);
            samplers.push(sampler);
        }

        let mut outputs = vec![vec![0.0; 400], vec![0.0; 400]];
        for (bus, output) in buses.iter_mut().zip(outputs.iter_mut()) {
            bus.write(&mut output[..100]);
        }
        // swap the sample of the first voice while its grain is playing
        samplers[0].set_sample_source(loaded_source(vec![0.9; 1000], sample_rate))?;
        for (bus, output) in buses.iter_mut().zip(outputs.iter_mut()) {
            bus.write(&mut output[100..]);
        }

        assert!(outputs[0].iter().any(|value| *value != 0.0));
        let bits = |output: &[f32]| output.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&outputs[0]), bits(&outputs[1]));
        Ok(())
    }

    #[test]
    fn wave_shapes() -> Result<(), Error> {
        let params = SharedGrainParams::new(
            GrainRealtimeParams::default()
                .sample_offset_time(0.5)
                .fade_in_time(0.0)
                .sustain_time(0.1)
                .fade_out_time(0.0),
        );
        let sampler = RoundSampler::new(
            ManualClock::new(0.0),
            Arc::new(RecordingSink::default()),
            params.clone(),
            Arc::new(MemoryFetcher::default()),
            RoundSamplerOptions::default(),
        )?;
        // no sample: all zero
        assert_eq!(sampler.get_wave_shape(4), vec![0.0; 4]);
        assert!(sampler.get_waveform(10).is_empty());

        let value = |index: usize| index as f32 / 100.0;
        sampler.set_sample_source(loaded_source((0..100).map(value).collect(), 100))?;
        assert_eq!(
            sampler.get_wave_shape(5),
            vec![value(51), value(53), value(55), value(57), value(59)]
        );
        assert_eq!(sampler.fragment_buffer().len(), 10);
        assert!(!sampler.update_fragment_buffer());

        // parameter changes refresh the fragment
        params.update(|params| params.sample_offset_time = 0.0);
        assert!(sampler.update_fragment_buffer());
        assert_eq!(sampler.get_wave_shape(10)[0], value(0));
        assert_eq!(sampler.get_waveform(10).len(), 10);
        Ok(())
    }
}
