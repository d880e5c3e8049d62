use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use basedrop::{Collector, Handle, Owned};
use crossbeam_channel::bounded;
use crossbeam_queue::ArrayQueue;

use crate::{
    error::Error,
    grain::{GrainHandle, SoundGrain},
    source::Source,
    utils::{
        buffer::{clear_buffer, scale_buffer},
        time::{sample_time_to_seconds, seconds_to_sample_time, DeviceClock, SampleTime},
    },
};

// -------------------------------------------------------------------------------------------------

/// Receives grains from the grain engine.
///
/// Connected grains play from their scheduled start time on and release themselves when
/// their envelope finished, so sinks never need to be told to remove a grain.
pub trait GrainSink: Send + Sync {
    /// Hand over a played grain to the sink.
    fn connect(&self, grain: SoundGrain) -> Result<GrainHandle, Error>;

    /// Number of grains which got connected and have not yet finished playing.
    fn active_grain_count(&self) -> usize;
}

// -------------------------------------------------------------------------------------------------

/// Messages send from the [`OutputBusHandle`] to the [`OutputBus`].
pub(crate) enum BusMessage {
    AddGrain(Owned<SoundGrain>),
    RemoveAllGrains,
}

/// Bus internal struct to keep track of connected grains.
struct PlayingGrain {
    grain: Owned<SoundGrain>,
    start_frame: SampleTime,
}

/// Bus state which is shared with its handles.
struct BusShared {
    message_queue: ArrayQueue<BusMessage>,
    position: AtomicU64,
    active_grains: AtomicUsize,
    volume_bits: AtomicU32,
    channel_count: usize,
    sample_rate: u32,
}

// -------------------------------------------------------------------------------------------------

/// A [`Source`] which mixes connected grains sample accurately into its output.
///
/// The bus is the audio graph node the grain engine connects its grains to. It also acts as
/// the device clock: the number of rendered frames is the bus' time, which can be read from
/// any thread via [`OutputBusHandle::clock`].
///
/// Grains get handed over via a lock-free queue and are wrapped into [`basedrop::Owned`]
/// values, so neither allocations nor deallocations happen in [`OutputBus::write`]. Finished
/// grains are freed by a collector thread, which runs for as long as the bus or one of its
/// handles is alive.
pub struct OutputBus {
    shared: Arc<BusShared>,
    playing_grains: Vec<PlayingGrain>,
    grain_capacity: usize,
    collector_handle: Handle,
    position: SampleTime,
}

impl OutputBus {
    /// Default number of grains the bus can play at the same time.
    pub const DEFAULT_GRAIN_CAPACITY: usize = 1024;

    /// Create a new bus with the given signal specs and the default grain capacity.
    pub fn new(channel_count: usize, sample_rate: u32) -> Result<Self, Error> {
        Self::with_capacity(channel_count, sample_rate, Self::DEFAULT_GRAIN_CAPACITY)
    }

    /// Create a new bus which can play up to `grain_capacity` grains at the same time.
    /// Grains which arrive while the bus is full get dropped.
    pub fn with_capacity(
        channel_count: usize,
        sample_rate: u32,
        grain_capacity: usize,
    ) -> Result<Self, Error> {
        if channel_count == 0 {
            return Err(Error::ParameterError(
                "bus channel count must be > 0".to_string(),
            ));
        }
        if sample_rate == 0 {
            return Err(Error::ParameterError(
                "bus sample rate must be > 0".to_string(),
            ));
        }
        if grain_capacity == 0 {
            return Err(Error::ParameterError(
                "bus grain capacity must be > 0".to_string(),
            ));
        }
        let collector_handle = spawn_collector()?;

        // prealloc grain list and message queue
        const MESSAGE_QUEUE_SIZE: usize = 4096;
        let message_queue = ArrayQueue::new(MESSAGE_QUEUE_SIZE.max(grain_capacity));
        let playing_grains = Vec::with_capacity(grain_capacity);

        let shared = Arc::new(BusShared {
            message_queue,
            position: AtomicU64::new(0),
            active_grains: AtomicUsize::new(0),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            channel_count,
            sample_rate,
        });
        Ok(Self {
            shared,
            playing_grains,
            grain_capacity,
            collector_handle,
            position: 0,
        })
    }

    /// Create a new handle to feed and control the bus from other threads.
    pub fn handle(&self) -> OutputBusHandle {
        OutputBusHandle {
            shared: Arc::clone(&self.shared),
            collector_handle: self.collector_handle.clone(),
        }
    }

    /// Number of grains which are currently playing or are waiting for their start time.
    pub fn playing_grain_count(&self) -> usize {
        self.playing_grains.len()
    }

    fn process_messages(&mut self) {
        while let Some(message) = self.shared.message_queue.pop() {
            match message {
                BusMessage::AddGrain(grain) => {
                    if self.playing_grains.len() >= self.grain_capacity {
                        // never reallocate in the audio thread: drop the grain
                        grain.destroy();
                        self.shared.active_grains.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                    // late grains start right away
                    let start_time = grain.playback().map_or(0.0, |p| p.start_time);
                    let start_frame = seconds_to_sample_time(start_time, self.shared.sample_rate)
                        .max(self.position);
                    self.playing_grains.push(PlayingGrain { grain, start_frame });
                }
                BusMessage::RemoveAllGrains => {
                    for playing_grain in &self.playing_grains {
                        playing_grain.grain.destroy();
                    }
                    self.shared
                        .active_grains
                        .fetch_sub(self.playing_grains.len(), Ordering::AcqRel);
                    self.playing_grains.clear();
                }
            }
        }
    }

    fn process_grains(&mut self, output: &mut [f32]) {
        let channel_count = self.shared.channel_count;
        let sample_rate = self.shared.sample_rate;
        let output_frame_count = (output.len() / channel_count) as u64;
        let buffer_start = self.position;
        let buffer_end = buffer_start + output_frame_count;

        let mut finished_count = 0;
        self.playing_grains.retain(|playing_grain| {
            if playing_grain.start_frame >= buffer_end {
                if playing_grain.grain.is_released() {
                    finished_count += 1;
                    return false;
                }
                return true;
            }
            let offset_frames = playing_grain.start_frame.saturating_sub(buffer_start);
            let elapsed_frames = buffer_start.saturating_sub(playing_grain.start_frame);
            let grain_output = &mut output[offset_frames as usize * channel_count..];
            let finished =
                playing_grain
                    .grain
                    .render(grain_output, channel_count, sample_rate, elapsed_frames);
            if finished {
                // natural end of playback or externally destroyed
                playing_grain.grain.destroy();
                finished_count += 1;
            }
            !finished
        });
        if finished_count > 0 {
            self.shared
                .active_grains
                .fetch_sub(finished_count, Ordering::AcqRel);
        }
    }
}

impl Source for OutputBus {
    fn write(&mut self, output: &mut [f32]) -> usize {
        self.process_messages();

        clear_buffer(output);
        if !self.playing_grains.is_empty() {
            self.process_grains(output);
            let volume = f32::from_bits(self.shared.volume_bits.load(Ordering::Relaxed));
            scale_buffer(output, volume);
        }

        // the bus time advances with every written buffer, silent or not
        self.position += (output.len() / self.shared.channel_count) as u64;
        self.shared.position.store(self.position, Ordering::Release);

        output.len()
    }

    fn channel_count(&self) -> usize {
        self.shared.channel_count
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn is_exhausted(&self) -> bool {
        // new grains may get connected at any time
        false
    }
}

// -------------------------------------------------------------------------------------------------

/// Thread-safe, clonable handle to an [`OutputBus`].
#[derive(Clone)]
pub struct OutputBusHandle {
    shared: Arc<BusShared>,
    collector_handle: Handle,
}

impl OutputBusHandle {
    pub fn channel_count(&self) -> usize {
        self.shared.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// The bus' playback position in frames.
    pub fn position(&self) -> SampleTime {
        self.shared.position.load(Ordering::Acquire)
    }

    /// A device clock which reports the bus' playback position in seconds.
    pub fn clock(&self) -> BusClock {
        BusClock {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume_bits.load(Ordering::Relaxed))
    }

    /// Set the bus' master volume. Applies with the next rendered buffer.
    pub fn set_volume(&self, volume: f32) -> Result<(), Error> {
        if !(volume >= 0.0) || !volume.is_finite() {
            return Err(Error::ParameterError(format!(
                "bus volume must be >= 0, but is {volume}"
            )));
        }
        self.shared
            .volume_bits
            .store(volume.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Stop and release all connected grains.
    pub fn remove_all_grains(&self) -> Result<(), Error> {
        self.shared
            .message_queue
            .push(BusMessage::RemoveAllGrains)
            .map_err(|_| Error::SendError("bus message queue is full".to_string()))
    }
}

impl GrainSink for OutputBusHandle {
    fn connect(&self, grain: SoundGrain) -> Result<GrainHandle, Error> {
        if !grain.is_playing() {
            return Err(Error::ParameterError(
                "grains must be played before they get connected".to_string(),
            ));
        }
        let handle = grain.handle();
        self.shared.active_grains.fetch_add(1, Ordering::AcqRel);
        let message = BusMessage::AddGrain(Owned::new(&self.collector_handle, grain));
        if self.shared.message_queue.push(message).is_err() {
            self.shared.active_grains.fetch_sub(1, Ordering::AcqRel);
            handle.destroy();
            return Err(Error::SendError("bus message queue is full".to_string()));
        }
        Ok(handle)
    }

    fn active_grain_count(&self) -> usize {
        self.shared.active_grains.load(Ordering::Acquire)
    }
}

// -------------------------------------------------------------------------------------------------

/// The device clock of an [`OutputBus`]: rendered frames in seconds.
#[derive(Clone)]
pub struct BusClock {
    shared: Arc<BusShared>,
}

impl DeviceClock for BusClock {
    fn current_time(&self) -> f64 {
        sample_time_to_seconds(
            self.shared.position.load(Ordering::Acquire),
            self.shared.sample_rate,
        )
    }
}

// -------------------------------------------------------------------------------------------------

/// Spawn a thread which owns a basedrop collector and frees values which got dropped by
/// the bus. The thread exits when all handles of its collector are gone.
fn spawn_collector() -> Result<Handle, Error> {
    const COLLECT_INTERVAL: Duration = Duration::from_millis(50);
    let (handle_send, handle_recv) = bounded(1);
    thread::Builder::new()
        .name("grainflow_collector".to_string())
        .spawn(move || {
            let mut collector = Collector::new();
            if handle_send.send(collector.handle()).is_err() {
                return;
            }
            drop(handle_send);
            loop {
                collector.collect();
                match collector.try_cleanup() {
                    Ok(()) => break,
                    Err(still_used) => collector = still_used,
                }
                thread::sleep(COLLECT_INTERVAL);
            }
            log::debug!("Collector thread finished");
        })?;
    handle_recv.recv().map_err(|_| {
        Error::SendError("failed to receive the collector handle".to_string())
    })
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{params::GrainRealtimeParams, source::sample::DecodedSample};

    fn played_grain(value: f32, start_time: f64, sustain: f64) -> SoundGrain {
        let sample = DecodedSample::new(vec![vec![value; 1000]], 100).unwrap();
        let mut grain = SoundGrain::new(Arc::new(sample));
        let params = GrainRealtimeParams::default()
            .fade_in_time(0.0)
            .sustain_time(sustain)
            .fade_out_time(0.0);
        grain.play(0.0, start_time, &params);
        grain
    }

    #[test]
    fn sample_accurate_starts() -> Result<(), Error> {
        let mut bus = OutputBus::new(1, 100)?;
        let handle = bus.handle();

        // starts at frame 5, plays for 10 frames
        let grain = handle.connect(played_grain(0.5, 0.05, 0.1))?;
        assert_eq!(handle.active_grain_count(), 1);

        let mut output = vec![0.0; 8];
        assert_eq!(bus.write(&mut output), 8);
        assert_eq!(&output[..5], &[0.0; 5]);
        assert_eq!(&output[5..], &[0.5; 3]);
        assert!(!grain.is_released());

        let mut output = vec![0.0; 8];
        bus.write(&mut output);
        assert_eq!(&output[..7], &[0.5; 7]);
        assert_eq!(output[7], 0.0);

        // finished grains release themselves
        assert!(grain.is_released());
        assert_eq!(handle.active_grain_count(), 0);
        assert_eq!(bus.playing_grain_count(), 0);
        assert_eq!(handle.position(), 16);
        assert!((handle.clock().current_time() - 0.16).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn late_grains_start_immediately() -> Result<(), Error> {
        let mut bus = OutputBus::new(2, 100)?;
        let handle = bus.handle();
        let mut output = vec![0.0; 2 * 10];
        bus.write(&mut output);

        handle.connect(played_grain(0.25, 0.0, 0.05))?;
        let mut output = vec![0.0; 2 * 10];
        bus.write(&mut output);
        assert_eq!(&output[..10], &[0.25; 10]);
        assert_eq!(&output[10..], &[0.0; 10]);
        Ok(())
    }

    #[test]
    fn destroyed_grains_stop_output() -> Result<(), Error> {
        let mut bus = OutputBus::new(1, 100)?;
        let handle = bus.handle();
        let grain = handle.connect(played_grain(1.0, 0.0, 1.0))?;

        let mut output = vec![0.0; 4];
        bus.write(&mut output);
        assert_eq!(output, vec![1.0; 4]);

        assert!(grain.destroy());
        bus.write(&mut output);
        assert_eq!(output, vec![0.0; 4]);
        assert_eq!(bus.playing_grain_count(), 0);
        assert_eq!(handle.active_grain_count(), 0);
        assert!(!grain.destroy());
        Ok(())
    }

    #[test]
    fn volume_and_remove_all() -> Result<(), Error> {
        let mut bus = OutputBus::new(1, 100)?;
        let handle = bus.handle();
        handle.set_volume(0.5)?;
        assert!(handle.set_volume(-1.0).is_err());
        let first = handle.connect(played_grain(1.0, 0.0, 1.0))?;
        let second = handle.connect(played_grain(1.0, 0.0, 1.0))?;

        let mut output = vec![0.0; 4];
        bus.write(&mut output);
        assert_eq!(output, vec![1.0; 4]);

        handle.remove_all_grains()?;
        bus.write(&mut output);
        assert_eq!(output, vec![0.0; 4]);
        assert!(first.is_released() && second.is_released());
        assert_eq!(handle.active_grain_count(), 0);
        Ok(())
    }

    #[test]
    fn capacity_limit() -> Result<(), Error> {
        let mut bus = OutputBus::with_capacity(1, 100, 2)?;
        let handle = bus.handle();
        let grains = (0..3)
            .map(|_| handle.connect(played_grain(0.25, 0.0, 1.0)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut output = vec![0.0; 4];
        bus.write(&mut output);
        assert_eq!(bus.playing_grain_count(), 2);
        assert_eq!(handle.active_grain_count(), 2);
        assert!(grains[2].is_released());
        assert_eq!(output, vec![0.5; 4]);
        Ok(())
    }

    #[test]
    fn rejects_unplayed_grains() -> Result<(), Error> {
        let bus = OutputBus::new(1, 100)?;
        let sample = DecodedSample::new(vec![vec![0.0; 10]], 100)?;
        let grain = SoundGrain::new(Arc::new(sample));
        assert!(bus.handle().connect(grain).is_err());
        assert!(OutputBus::new(0, 100).is_err());
        Ok(())
    }
}
