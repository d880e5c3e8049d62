//! Grain emission: turns scheduler frames into played and connected sound grains.

use std::sync::{Arc, Mutex};

use crate::{
    error::Error,
    grain::SoundGrain,
    params::{GrainRealtimeParams, SharedGrainParams},
    scheduler::{LookaheadScheduler, SchedulerFrame, SchedulerState},
    source::{
        bus::GrainSink,
        sample::{DecodedSample, SampleSource},
    },
    utils::{lock, time::DeviceClock},
};

// -------------------------------------------------------------------------------------------------

/// Options for a [`GrainEngine`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainEngineOptions {
    /// Length of a scheduler frame in seconds. Frames get computed one frame length ahead of
    /// the device clock, so parameter changes apply with at most twice this latency.
    /// By default 0.1.
    pub frame_length: f64,
    /// Max number of grains which may play at the same time on the engine's sink. Grains
    /// which would exceed the limit get skipped. `None` disables the limit. By default 512.
    pub max_active_grains: Option<usize>,
    /// Output gain of all emitted grains. By default 1.0.
    pub volume: f32,
}

impl Default for GrainEngineOptions {
    fn default() -> Self {
        Self {
            frame_length: SchedulerState::DEFAULT_FRAME_LENGTH,
            max_active_grains: Some(GrainEmitter::DEFAULT_MAX_ACTIVE_GRAINS),
            volume: 1.0,
        }
    }
}

impl GrainEngineOptions {
    pub fn frame_length(mut self, frame_length: f64) -> Self {
        self.frame_length = frame_length;
        self
    }

    pub fn max_active_grains(mut self, max_active_grains: Option<usize>) -> Self {
        self.max_active_grains = max_active_grains;
        self
    }

    pub fn volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Validate all parameters. Returns `Error::ParameterError` on errors.
    pub fn validate(&self) -> Result<(), Error> {
        SchedulerState::validate_frame_length(self.frame_length)?;
        if self.max_active_grains == Some(0) {
            return Err(Error::ParameterError(
                "max active grains must be > 0".to_string(),
            ));
        }
        if !(self.volume >= 0.0) || !self.volume.is_finite() {
            return Err(Error::ParameterError(format!(
                "volume must be >= 0, but is {}",
                self.volume
            )));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Decides which grain start instants fall into a scheduler frame and emits one grain for
/// each of them.
///
/// Grains are spaced `1 / grains_per_second` apart, starting from the latest emitted grain's
/// start time (the watermark). Only instants strictly after the watermark and before the
/// frame's end get emitted, so frame boundaries never emit a grain twice. Instants before
/// the frame's start, e.g. after frames which could not emit grains, are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainEmitter {
    latest_grain_start_time: f64,
    max_active_grains: Option<usize>,
    volume: f32,
}

impl Default for GrainEmitter {
    fn default() -> Self {
        Self::new(Some(Self::DEFAULT_MAX_ACTIVE_GRAINS))
    }
}

impl GrainEmitter {
    pub const DEFAULT_MAX_ACTIVE_GRAINS: usize = 512;

    pub fn new(max_active_grains: Option<usize>) -> Self {
        Self {
            latest_grain_start_time: 0.0,
            max_active_grains,
            volume: 1.0,
        }
    }

    /// Output gain of emitted grains.
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Start time of the latest emitted grain.
    pub fn latest_grain_start_time(&self) -> f64 {
        self.latest_grain_start_time
    }

    /// Move the watermark: the next grain starts one interval after the given time.
    pub fn set_latest_grain_start_time(&mut self, time: f64) {
        self.latest_grain_start_time = time;
    }

    /// Emit grains for the given frame with the given parameter snapshot into the sink.
    /// Returns the number of connected grains.
    ///
    /// The first frame after a scheduler start emits a grain at the frame's start time, so a
    /// started voice sounds immediately instead of one grain interval after its start.
    /// Frames without a loaded sample or with a non positive grain rate emit nothing.
    pub fn process_frame(
        &mut self,
        frame: &SchedulerFrame,
        params: &GrainRealtimeParams,
        sample: Option<&Arc<DecodedSample>>,
        sink: &dyn GrainSink,
    ) -> usize {
        let interval = params.grain_interval();
        if frame.is_first {
            self.latest_grain_start_time = frame.start - interval.unwrap_or(0.0);
        }
        let (Some(sample), Some(interval)) = (sample, interval) else {
            return 0;
        };

        let mut time = if frame.is_first {
            frame.start
        } else {
            self.latest_grain_start_time + interval
        };
        if time < frame.start {
            let steps = ((frame.start - self.latest_grain_start_time) / interval).ceil();
            time = self.latest_grain_start_time + steps * interval;
            if time < frame.start {
                time += interval;
            }
        }

        let sample_offset = params.sample_offset_time.clamp(0.0, 1.0) * sample.duration();
        let max_active_grains = self.max_active_grains.unwrap_or(usize::MAX);
        let mut emitted = 0;
        let mut warned_ceiling = false;
        while time < frame.end {
            if time <= self.latest_grain_start_time {
                // interval too small to advance the time
                break;
            }
            self.latest_grain_start_time = time;

            if sink.active_grain_count() >= max_active_grains {
                if !warned_ceiling {
                    log::warn!(
                        "Reached the max active grain limit of {max_active_grains}: skipping grains"
                    );
                    warned_ceiling = true;
                }
            } else {
                let mut grain = SoundGrain::new(Arc::clone(sample)).with_volume(self.volume);
                grain.play(sample_offset, time, params);
                match sink.connect(grain) {
                    Ok(_) => emitted += 1,
                    Err(err) => log::warn!("Failed to connect grain: {err}"),
                }
            }
            time += interval;
        }
        emitted
    }
}

// -------------------------------------------------------------------------------------------------

struct EngineShared {
    params: SharedGrainParams,
    sample_source: Mutex<Option<Arc<SampleSource>>>,
    emitter: Mutex<GrainEmitter>,
    sink: Arc<dyn GrainSink>,
}

impl EngineShared {
    fn process_frame(&self, frame: &SchedulerFrame) -> usize {
        let params = self.params.snapshot();
        let sample = lock(&self.sample_source)
            .as_ref()
            .and_then(|source| source.sample());
        lock(&self.emitter).process_frame(frame, &params, sample.as_ref(), self.sink.as_ref())
    }
}

// -------------------------------------------------------------------------------------------------

/// Schedules grains from the current sample source into a grain sink.
///
/// The engine owns a [`LookaheadScheduler`]. On each scheduler frame it reads a fresh
/// snapshot of the shared grain parameters and emits grains with the [`GrainEmitter`].
/// Changing the sample source never affects grains which already got emitted.
pub struct GrainEngine {
    shared: Arc<EngineShared>,
    scheduler: LookaheadScheduler,
}

impl GrainEngine {
    /// Create a new idle engine. `on_stop` is called from the scheduler thread whenever a
    /// running engine stopped.
    pub fn new<C, S>(
        clock: C,
        sink: Arc<dyn GrainSink>,
        params: SharedGrainParams,
        options: GrainEngineOptions,
        on_stop: S,
    ) -> Result<Self, Error>
    where
        C: DeviceClock + 'static,
        S: FnMut() + Send + 'static,
    {
        options.validate()?;
        let shared = Arc::new(EngineShared {
            params,
            sample_source: Mutex::new(None),
            emitter: Mutex::new(
                GrainEmitter::new(options.max_active_grains).with_volume(options.volume),
            ),
            sink,
        });
        let scheduler = LookaheadScheduler::new(
            clock,
            options.frame_length,
            {
                let shared = Arc::clone(&shared);
                move |frame| {
                    shared.process_frame(frame);
                }
            },
            on_stop,
        )?;
        Ok(Self { shared, scheduler })
    }

    pub fn params(&self) -> &SharedGrainParams {
        &self.shared.params
    }

    pub fn sink(&self) -> &Arc<dyn GrainSink> {
        &self.shared.sink
    }

    /// The source grains currently get emitted from.
    pub fn sample_source(&self) -> Option<Arc<SampleSource>> {
        lock(&self.shared.sample_source).clone()
    }

    /// Replace the source grains get emitted from, starting with the next frame.
    pub fn set_sample_source(&self, source: Option<Arc<SampleSource>>) {
        *lock(&self.shared.sample_source) = source;
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Start emitting grains from the given device time on. The first grain starts at
    /// `start_time`.
    pub fn schedule_start(&self, start_time: f64) -> Result<(), Error> {
        self.scheduler.schedule_start(start_time)
    }

    /// Stop emitting grains at the given device time.
    pub fn schedule_stop(&self, stop_time: f64) -> Result<(), Error> {
        self.scheduler.schedule_stop(stop_time)
    }

    /// Stop emitting grains immediately. Emitted grains keep playing.
    pub fn stop(&self) -> Result<(), Error> {
        self.scheduler.stop()
    }

    pub fn set_frame_length(&self, frame_length: f64) -> Result<(), Error> {
        self.scheduler.set_frame_length(frame_length)
    }

    /// Emit grains for the given frame right away, bypassing the scheduler. Useful for
    /// offline rendering. Returns the number of emitted grains.
    pub fn process_frame(&self, frame: &SchedulerFrame) -> usize {
        self.shared.process_frame(frame)
    }
}

// -------------------------------------------------------------------------------------------------
