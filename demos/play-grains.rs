//! Plays a granular cloud from a sample, while sweeping the grains' sample offset.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::Rng;

use grainflow::{
    utils::time::DeviceClock, DecodedSample, Error, FileFetcher, GrainRealtimeParams, GrainSink,
    OutputBus, RoundSamplerOptions, SampleDefinition, SampleSource, SharedGrainParams, VoicePool,
};

// -------------------------------------------------------------------------------------------------

// Common demo code
#[path = "./common/arguments.rs"]
mod arguments;

// -------------------------------------------------------------------------------------------------

#[cfg(all(debug_assertions, feature = "assert-allocs"))]
#[global_allocator]
static A: assert_no_alloc::AllocDisabler = assert_no_alloc::AllocDisabler;

// -------------------------------------------------------------------------------------------------

// Grain parameter consts (tweak as needed!)

const GRAINS_PER_SECOND: f64 = 30.0;
const FADE_IN_TIME: f64 = 0.04;
const SUSTAIN_TIME: f64 = 0.06;
const FADE_OUT_TIME: f64 = 0.08;
const PLAYBACK_RATE: f64 = 1.0;

/// Seconds it takes to sweep the sample offset from the sample's start to its end.
const SWEEP_DURATION: f64 = 8.0;
/// Random sample offset variation.
const OFFSET_SPRAY: f64 = 0.02;

/// Number of voices and seconds a voice plays.
const VOICE_COUNT: usize = 2;
const PLAY_DURATION: f64 = 8.0;

// -------------------------------------------------------------------------------------------------

fn main() -> Result<(), Error> {
    // Parse optional arguments
    let args = arguments::parse();

    // Open the output device and feed it with a grain bus
    let mut output = arguments::open_output(&args)?;
    let bus = OutputBus::new(output.channel_count(), output.sample_rate())?;
    let bus_handle = bus.handle();
    let clock = bus_handle.clock();

    // Create voices, sharing one parameter set
    let params = SharedGrainParams::new(
        GrainRealtimeParams::default()
            .grains_per_second(GRAINS_PER_SECOND)
            .fade_in_time(FADE_IN_TIME)
            .sustain_time(SUSTAIN_TIME)
            .fade_out_time(FADE_OUT_TIME)
            .playback_rate(PLAYBACK_RATE),
    );
    let pool = VoicePool::new(
        VOICE_COUNT,
        clock.clone(),
        Arc::new(bus_handle.clone()),
        params.clone(),
        Arc::new(FileFetcher::new()),
        RoundSamplerOptions::default(),
    )?;

    // Load the sample
    if let Some(sample_path) = &args.sample_path {
        let path = sample_path.to_string_lossy();
        pool.set_sample(SampleDefinition::new("sample", path))?;
    } else {
        pool.set_sample_source(Arc::new(SampleSource::from_decoded(
            SampleDefinition::new("chord", "<synthesized>"),
            synthesized_chord(output.sample_rate())?,
        )))?;
    }

    // Print a preview of the first grain's waveform
    let shape = pool.voices()[0].get_wave_shape(48);
    println!("Grain shape: {}", shape_to_string(&shape));

    // Start playing
    output.play(Box::new(bus))?;

    let now = clock.current_time();
    for index in 0..VOICE_COUNT {
        let start_time = now + 0.2 + index as f64 * PLAY_DURATION / 2.0;
        let voice = pool.trigger(start_time, Some(start_time + PLAY_DURATION))?;
        println!("Triggered voice {voice} at +{:.1}s", start_time - now);
    }

    // Sweep the sample offset until all voices stopped
    let mut rng = rand::rng();
    let sweep_start = Instant::now();
    while pool.active_voice_count() > 0 {
        let sweep = (sweep_start.elapsed().as_secs_f64() / SWEEP_DURATION).fract();
        let spray = rng.random_range(-OFFSET_SPRAY..=OFFSET_SPRAY);
        params.update(|params| params.sample_offset_time = (sweep + spray).clamp(0.0, 1.0));
        std::thread::sleep(Duration::from_millis(20));
    }

    // Let playing grains fade out
    while bus_handle.active_grain_count() > 0 {
        std::thread::sleep(Duration::from_millis(20));
    }
    output.close();
    println!("Playback finished");

    Ok(())
}

// -------------------------------------------------------------------------------------------------

fn synthesized_chord(sample_rate: u32) -> Result<DecodedSample, Error> {
    const DURATION: f64 = 4.0;
    const FREQUENCIES: [f64; 3] = [220.0, 277.18, 329.63];
    let frame_count = (DURATION * sample_rate as f64) as usize;
    let channel = (0..frame_count)
        .map(|frame| {
            let time = frame as f64 / sample_rate as f64;
            let fade = 1.0 - time / DURATION;
            let value = FREQUENCIES
                .iter()
                .enumerate()
                .map(|(index, frequency)| {
                    (time * frequency * std::f64::consts::TAU * (1.0 + index as f64 * fade)).sin()
                })
                .sum::<f64>();
            (value / FREQUENCIES.len() as f64 * 0.5) as f32
        })
        .collect();
    DecodedSample::new(vec![channel], sample_rate)
}

fn shape_to_string(shape: &[f32]) -> String {
    const CHARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    shape
        .iter()
        .map(|value| {
            let index = (value.abs().min(1.0) * (CHARS.len() - 1) as f32).round() as usize;
            CHARS[index]
        })
        .collect()
}
