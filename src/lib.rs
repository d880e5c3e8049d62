#![doc = include_str!("../README.md")]

// private mods (will be partly re-exported)
mod engine;
mod error;
mod grain;
mod output;
mod params;
mod sampler;
mod scheduler;
mod source;
mod waveform;

// public, flat re-exports
pub use error::Error;

pub use params::{GrainRealtimeParams, SharedGrainParams};

pub use grain::{GrainHandle, GrainPlayback, SoundGrain};

pub use scheduler::{LookaheadScheduler, SchedulerFrame, SchedulerState, SchedulerStatus};

pub use engine::{GrainEmitter, GrainEngine, GrainEngineOptions};

pub use sampler::{pool::VoicePool, RoundSampler, RoundSamplerOptions};

pub use source::{
    bus::{BusClock, GrainSink, OutputBus, OutputBusHandle},
    sample::{
        DecodedSample, FileFetcher, SampleDefinition, SampleFetcher, SampleLoadState,
        SampleLoadTask, SampleSource,
    },
    EmptySource, Source,
};

pub use output::OutputDevice;
#[cfg(feature = "cpal-output")]
pub use output::DefaultOutputDevice;

pub use waveform::{
    fragment_range, sample_fragment, wave_shape, waveform_from_sample, WaveformPoint,
};

// public mods
pub mod utils;

pub mod outputs {
    //! Available audio output device implementations.

    #[cfg(feature = "cpal-output")]
    pub use super::output::cpal::{AudioHostId, CpalOutput};
    #[cfg(feature = "wav-output")]
    pub use super::output::wav::WavOutput;
}
