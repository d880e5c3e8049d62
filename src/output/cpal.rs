use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::{
    error::Error,
    output::{validate_source, OutputDevice},
    source::{EmptySource, Source},
    utils::buffer::{clear_buffer, scale_buffer},
};

// -------------------------------------------------------------------------------------------------

const PREFERRED_SAMPLE_FORMAT: cpal::SampleFormat = cpal::SampleFormat::F32;
const PREFERRED_SAMPLE_RATE: cpal::SampleRate = cpal::SampleRate(44100);
const PREFERRED_CHANNELS: cpal::ChannelCount = 2;
const PREFERRED_BUFFER_SIZE: cpal::BufferSize = if cfg!(debug_assertions) {
    cpal::BufferSize::Default
} else {
    cpal::BufferSize::Fixed(1024)
};

// -------------------------------------------------------------------------------------------------

/// Available audio hosts for cpal output (platform specific)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AudioHostId {
    #[default]
    Default, // system default
    #[cfg(target_os = "windows")]
    Wasapi,
    #[cfg(target_os = "linux")]
    Alsa,
}

// -------------------------------------------------------------------------------------------------

/// Audio output device which plays back on the system's default audio device via cpal.
///
/// The cpal stream lives in its own thread, as streams can't be sent across threads on all
/// platforms. The device starts playing as soon as it got opened.
pub struct CpalOutput {
    channel_count: usize,
    sample_rate: u32,
    volume: f32,
    playback_pos: Arc<AtomicU64>,
    is_running: Arc<AtomicBool>,
    callback_send: Sender<CallbackMessage>,
    stream_send: Sender<StreamMessage>,
    stream_thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    pub fn open() -> Result<Self, Error> {
        Self::open_with_host(AudioHostId::Default)
    }

    pub fn open_with_host(host_id: AudioHostId) -> Result<Self, Error> {
        let playback_pos = Arc::new(AtomicU64::new(0));
        let is_running = Arc::new(AtomicBool::new(false));
        let (callback_send, callback_recv) = bounded::<CallbackMessage>(16);
        let (stream_send, stream_recv) = bounded::<StreamMessage>(16);
        let (opened_send, opened_recv) = bounded::<Result<(usize, u32), Error>>(1);

        let stream_thread = thread::Builder::new()
            .name("grainflow_audio_output".to_string())
            .spawn({
                let playback_pos = Arc::clone(&playback_pos);
                let is_running = Arc::clone(&is_running);
                move || {
                    let callback = StreamCallback {
                        callback_recv,
                        source: Box::new(EmptySource),
                        volume: 1.0,
                        playback_pos,
                        is_running,
                    };
                    let (stream, specs) = match open_stream(host_id, callback) {
                        Ok(opened) => opened,
                        Err(err) => {
                            let _ = opened_send.send(Err(err));
                            return;
                        }
                    };
                    if opened_send.send(Ok(specs)).is_err() {
                        return;
                    }
                    run_stream(stream, stream_recv);
                }
            })?;

        let (channel_count, sample_rate) = opened_recv.recv().map_err(|err| {
            Error::OutputDeviceError(format!("audio output thread died: {err}").into())
        })??;

        let mut output = Self {
            channel_count,
            sample_rate,
            volume: 1.0,
            playback_pos,
            is_running,
            callback_send,
            stream_send,
            stream_thread: Some(stream_thread),
        };
        output.resume();
        Ok(output)
    }

    fn send_to_callback(&self, message: CallbackMessage) {
        if self.callback_send.send(message).is_err() {
            log::error!("Audio output stream is dead");
        }
    }

    fn send_to_stream(&self, message: StreamMessage) {
        if self.stream_send.send(message).is_err() {
            log::error!("Audio output stream thread is dead");
        }
    }
}

impl OutputDevice for CpalOutput {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn sample_position(&self) -> u64 {
        self.playback_pos.load(Ordering::Relaxed)
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        self.send_to_callback(CallbackMessage::SetVolume(volume));
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    fn play(&mut self, source: Box<dyn Source>) -> Result<(), Error> {
        validate_source(source.as_ref(), self.channel_count, self.sample_rate)?;
        self.callback_send
            .send(CallbackMessage::PlaySource(source))
            .map_err(|err| Error::SendError(err.to_string()))
    }

    fn stop(&mut self) {
        self.send_to_callback(CallbackMessage::PlaySource(Box::new(EmptySource)));
    }

    fn pause(&mut self) {
        self.send_to_stream(StreamMessage::Pause);
        self.send_to_callback(CallbackMessage::Pause);
    }

    fn resume(&mut self) {
        self.send_to_stream(StreamMessage::Resume);
        self.send_to_callback(CallbackMessage::Resume);
    }

    fn close(&mut self) {
        if let Some(thread) = self.stream_thread.take() {
            self.send_to_stream(StreamMessage::Close);
            if let Err(err) = thread.join() {
                log::error!(
                    "Audio output thread panicked: {}",
                    panic_message::panic_message(&err)
                );
            }
            self.is_running.store(false, Ordering::Relaxed);
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

// -------------------------------------------------------------------------------------------------

enum StreamMessage {
    Pause,
    Resume,
    Close,
}

fn open_stream(
    host_id: AudioHostId,
    mut callback: StreamCallback,
) -> Result<(cpal::Stream, (usize, u32)), Error> {
    let host = match host_id {
        AudioHostId::Default => cpal::default_host(),
        #[cfg(target_os = "windows")]
        AudioHostId::Wasapi => cpal::host_from_id(cpal::HostId::Wasapi)
            .map_err(|err| Error::OutputDeviceError(Box::new(err)))?,
        #[cfg(target_os = "linux")]
        AudioHostId::Alsa => cpal::host_from_id(cpal::HostId::Alsa)
            .map_err(|err| Error::OutputDeviceError(Box::new(err)))?,
    };

    let device = host
        .default_output_device()
        .ok_or(cpal::DefaultStreamConfigError::DeviceNotAvailable)?;
    if let Ok(name) = device.name() {
        log::info!("Using audio device: {name}");
    }

    let supported = preferred_output_config(&device)?;
    let config = cpal::StreamConfig {
        buffer_size: PREFERRED_BUFFER_SIZE,
        ..supported.config()
    };
    log::info!("Opening output stream: {config:?}");
    let stream = device.build_output_stream(
        &config,
        move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
            callback.write_samples(output);
        },
        |err| {
            log::error!("Audio output error: {err}");
        },
        None,
    )?;
    Ok((stream, (config.channels as usize, config.sample_rate.0)))
}

fn preferred_output_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, Error> {
    for config in device.supported_output_configs()? {
        let rates = config.min_sample_rate()..=config.max_sample_rate();
        if config.channels() == PREFERRED_CHANNELS
            && config.sample_format() == PREFERRED_SAMPLE_FORMAT
            && rates.contains(&PREFERRED_SAMPLE_RATE)
        {
            return Ok(config.with_sample_rate(PREFERRED_SAMPLE_RATE));
        }
    }
    Ok(device.default_output_config()?)
}

fn run_stream(stream: cpal::Stream, stream_recv: Receiver<StreamMessage>) {
    // runs until closed or the output got dropped
    while let Ok(message) = stream_recv.recv() {
        match message {
            StreamMessage::Pause => {
                log::debug!("Pausing audio output stream");
                if let Err(err) = stream.pause() {
                    log::error!("Failed to pause stream: {err}");
                }
            }
            StreamMessage::Resume => {
                log::debug!("Resuming audio output stream");
                if let Err(err) = stream.play() {
                    log::error!("Failed to start stream: {err}");
                }
            }
            StreamMessage::Close => break,
        }
    }
    log::debug!("Closing audio output stream");
    let _ = stream.pause();
}

// -------------------------------------------------------------------------------------------------

enum CallbackMessage {
    PlaySource(Box<dyn Source>),
    SetVolume(f32),
    Pause,
    Resume,
}

struct StreamCallback {
    callback_recv: Receiver<CallbackMessage>,
    source: Box<dyn Source>,
    volume: f32,
    playback_pos: Arc<AtomicU64>,
    is_running: Arc<AtomicBool>,
}

impl StreamCallback {
    fn write_samples(&mut self, output: &mut [f32]) {
        while let Ok(message) = self.callback_recv.try_recv() {
            match message {
                CallbackMessage::PlaySource(source) => self.source = source,
                CallbackMessage::SetVolume(volume) => self.volume = volume,
                CallbackMessage::Pause => self.is_running.store(false, Ordering::Relaxed),
                CallbackMessage::Resume => self.is_running.store(true, Ordering::Relaxed),
            }
        }

        let written = if self.is_running.load(Ordering::Relaxed) {
            let written = assert_no_alloc(|| self.source.write(output));
            scale_buffer(&mut output[..written], self.volume);
            let channel_count = self.source.channel_count().max(1);
            self.playback_pos
                .fetch_add((output.len() / channel_count) as u64, Ordering::Relaxed);
            written
        } else {
            0
        };
        clear_buffer(&mut output[written..]);
    }
}

fn assert_no_alloc<T, F: FnOnce() -> T>(func: F) -> T {
    #[cfg(feature = "assert-allocs")]
    return assert_no_alloc::assert_no_alloc::<T, F>(func);

    #[cfg(not(feature = "assert-allocs"))]
    return func();
}

// -------------------------------------------------------------------------------------------------

impl From<cpal::DefaultStreamConfigError> for Error {
    fn from(err: cpal::DefaultStreamConfigError) -> Error {
        Error::OutputDeviceError(Box::new(err))
    }
}

impl From<cpal::SupportedStreamConfigsError> for Error {
    fn from(err: cpal::SupportedStreamConfigsError) -> Error {
        Error::OutputDeviceError(Box::new(err))
    }
}

impl From<cpal::BuildStreamError> for Error {
    fn from(err: cpal::BuildStreamError) -> Error {
        Error::OutputDeviceError(Box::new(err))
    }
}
