use std::{
    fs::File,
    io::BufWriter,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::{
    error::Error,
    output::{validate_source, OutputDevice},
    source::{EmptySource, Source},
    utils::{buffer::scale_buffer, lock},
};

// -------------------------------------------------------------------------------------------------

const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_CHANNEL_COUNT: usize = 2;
const DEFAULT_DURATION: Duration = Duration::from_secs(u64::MAX);

const BUFFER_SIZE_FRAMES: usize = 256;

// -------------------------------------------------------------------------------------------------

/// Audio output device, which writes audio into a wav file instead of playing it back.
///
/// The file gets written in real-time: the device never writes ahead of the wall clock, so
/// schedulers which follow the device clock behave just like with a real audio device.
///
/// NOTE: Unlike the other output devices, the wav writer device is initially paused, so it
/// must be resumed manually after everything you want to write got set up.
pub struct WavOutput {
    stream: Arc<Mutex<WavStream>>,
    is_running: Arc<AtomicBool>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl WavOutput {
    /// Open a wav output device to write at the given file using default specs and an
    /// endless duration.
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self, Error> {
        Self::open_with_specs(
            file_path,
            DEFAULT_SAMPLE_RATE,
            DEFAULT_CHANNEL_COUNT,
            DEFAULT_DURATION,
        )
    }

    /// Create a new wav output device with the given parameters.
    ///
    /// * `file_path`: Target file path. Should end with ".wav" extension.
    /// * `sample_rate`: Wav file's target sample rate.
    /// * `channel_count`: Wav file's channel layout.
    /// * `duration`: Max length of written content. After the duration elapsed, or when
    ///   the device got closed, the file gets finalized.
    ///
    /// Wav files contents are always saved as 32bit floats.
    pub fn open_with_specs<P: AsRef<Path>>(
        file_path: P,
        sample_rate: u32,
        channel_count: usize,
        duration: Duration,
    ) -> Result<Self, Error> {
        if channel_count == 0 || channel_count > u16::MAX as usize || sample_rate == 0 {
            return Err(Error::ParameterError(format!(
                "invalid wav specs: {channel_count} channels, {sample_rate} Hz"
            )));
        }
        let spec = WavSpec {
            channels: channel_count as u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(file_path.as_ref(), spec)
            .map_err(|err| Error::OutputDeviceError(Box::new(err)))?;
        log::info!("Writing audio output to '{}'", file_path.as_ref().display());

        let max_frames = (duration.as_secs_f64() * sample_rate as f64).min(u64::MAX as f64) as u64;
        let stream = Arc::new(Mutex::new(WavStream {
            writer: Some(writer),
            channel_count,
            sample_rate,
            source: Box::new(EmptySource),
            volume: 1.0,
            buffer: vec![0.0; BUFFER_SIZE_FRAMES * channel_count],
            playback_pos: 0,
            max_frames,
            resumed: None,
            finished: false,
        }));
        let is_running = Arc::new(AtomicBool::new(false));

        let writer_thread = thread::Builder::new()
            .name("grainflow_wav_output".to_string())
            .spawn({
                let stream = Arc::clone(&stream);
                let is_running = Arc::clone(&is_running);
                move || {
                    loop {
                        {
                            let mut stream = lock(&stream);
                            if let Err(err) = stream.process() {
                                log::error!("Failed to write WAV output: {err}");
                                stream.finished = true;
                            }
                            if stream.finished {
                                break;
                            }
                        }
                        // sleep for a short time to avoid busy waiting
                        thread::sleep(Duration::from_millis(1));
                    }
                    is_running.store(false, Ordering::Relaxed);
                    lock(&stream).finalize();
                }
            })?;

        Ok(Self {
            stream,
            is_running,
            writer_thread: Some(writer_thread),
        })
    }
}

impl OutputDevice for WavOutput {
    fn channel_count(&self) -> usize {
        lock(&self.stream).channel_count
    }

    fn sample_rate(&self) -> u32 {
        lock(&self.stream).sample_rate
    }

    fn sample_position(&self) -> u64 {
        lock(&self.stream).playback_pos
    }

    fn volume(&self) -> f32 {
        lock(&self.stream).volume
    }

    fn set_volume(&mut self, volume: f32) {
        lock(&self.stream).volume = volume;
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    fn play(&mut self, source: Box<dyn Source>) -> Result<(), Error> {
        let mut stream = lock(&self.stream);
        validate_source(source.as_ref(), stream.channel_count, stream.sample_rate)?;
        stream.source = source;
        Ok(())
    }

    fn stop(&mut self) {
        lock(&self.stream).source = Box::new(EmptySource);
    }

    fn pause(&mut self) {
        let mut stream = lock(&self.stream);
        stream.resumed = None;
        self.is_running.store(false, Ordering::Relaxed);
    }

    fn resume(&mut self) {
        let mut stream = lock(&self.stream);
        if !stream.finished && stream.resumed.is_none() {
            stream.resumed = Some((Instant::now(), stream.playback_pos));
            self.is_running.store(true, Ordering::Relaxed);
        }
    }

    fn close(&mut self) {
        if let Some(thread) = self.writer_thread.take() {
            lock(&self.stream).finished = true;
            if let Err(err) = thread.join() {
                log::error!(
                    "WAV output thread panicked: {}",
                    panic_message::panic_message(&err)
                );
            }
        }
    }
}

impl Drop for WavOutput {
    fn drop(&mut self) {
        self.close();
    }
}

// -------------------------------------------------------------------------------------------------

struct WavStream {
    writer: Option<WavWriter<BufWriter<File>>>,
    channel_count: usize,
    sample_rate: u32,
    source: Box<dyn Source>,
    volume: f32,
    buffer: Vec<f32>,
    /// Written frames.
    playback_pos: u64,
    max_frames: u64,
    /// Wall clock time and playback position of the latest resume, while running.
    resumed: Option<(Instant, u64)>,
    finished: bool,
}

impl WavStream {
    /// Write all buffers which are due since the latest resume.
    fn process(&mut self) -> Result<(), Error> {
        let Some((resume_instant, resume_pos)) = self.resumed else {
            return Ok(());
        };
        let due_frames = resume_pos
            + (resume_instant.elapsed().as_secs_f64() * self.sample_rate as f64) as u64;
        while !self.finished && self.playback_pos + BUFFER_SIZE_FRAMES as u64 <= due_frames {
            if self.playback_pos >= self.max_frames {
                self.finished = true;
                break;
            }
            self.buffer.fill(0.0);
            // sources which stopped playing write silence
            self.source.write(&mut self.buffer);
            scale_buffer(&mut self.buffer, self.volume);
            if let Some(writer) = self.writer.as_mut() {
                for sample in &self.buffer {
                    writer
                        .write_sample(*sample)
                        .map_err(|err| Error::OutputDeviceError(Box::new(err)))?;
                }
            }
            self.playback_pos += BUFFER_SIZE_FRAMES as u64;
        }
        Ok(())
    }

    fn finalize(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.finalize() {
                Ok(()) => log::info!("Finalized WAV output"),
                Err(err) => log::error!("Failed to finalize WAV file: {err}"),
            }
        }
    }
}

impl Drop for WavStream {
    fn drop(&mut self) {
        self.finalize();
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        grain::SoundGrain,
        params::GrainRealtimeParams,
        source::{
            bus::{GrainSink, OutputBus},
            sample::DecodedSample,
        },
    };

    #[test]
    fn writes_bus_output() -> Result<(), Error> {
        let path = std::env::temp_dir().join(format!(
            "grainflow_wav_output_{}.wav",
            std::process::id()
        ));
        let sample_rate = 8000;
        let bus = OutputBus::new(1, sample_rate)?;
        let bus_handle = bus.handle();

        let mut grain = SoundGrain::new(Arc::new(DecodedSample::new(
            vec![vec![0.5; 800]],
            sample_rate,
        )?));
        grain.play(
            0.0,
            0.0,
            &GrainRealtimeParams::default()
                .fade_in_time(0.0)
                .sustain_time(0.05)
                .fade_out_time(0.0),
        );
        bus_handle.connect(grain)?;

        let mut output =
            WavOutput::open_with_specs(&path, sample_rate, 1, Duration::from_millis(100))?;
        assert!(output.play(Box::new(OutputBus::new(2, sample_rate)?)).is_err());
        output.play(Box::new(bus))?;
        assert!(!output.is_running());
        output.resume();
        assert!(output.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while output.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!output.is_running());
        output.close();

        let mut reader =
            hound::WavReader::open(&path).map_err(|err| Error::OutputDeviceError(Box::new(err)))?;
        let samples = reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| Error::OutputDeviceError(Box::new(err)))?;
        std::fs::remove_file(&path)?;

        // the duration rounds up to full buffers
        assert_eq!(samples.len(), 1024);
        assert!(samples[..400].iter().all(|v| *v == 0.5));
        assert!(samples[400..].iter().all(|v| *v == 0.0));
        assert_eq!(bus_handle.active_grain_count(), 0);
        Ok(())
    }
}
