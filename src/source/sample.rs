use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::Instant,
};

use assume::assume;

use crate::{
    error::Error,
    utils::{buffer::interleaved_to_planar, decoder::AudioDecoder, lock, unique_usize_id},
};

// -------------------------------------------------------------------------------------------------

/// Identifies a sample: a display name plus a location the sample's bytes can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleDefinition {
    pub name: String,
    pub path: String,
}

impl SampleDefinition {
    pub fn new<N: Into<String>, P: Into<String>>(name: N, path: P) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for SampleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({})", self.name, self.path)
    }
}

// -------------------------------------------------------------------------------------------------

/// Fetches the raw, still encoded bytes of a sample by its path.
pub trait SampleFetcher: Send + Sync {
    fn fetch(&self, path: &str) -> Result<Vec<u8>, Error>;
}

/// A [`SampleFetcher`] which reads sample files from the local file system.
/// Relative paths get resolved against an optional base directory.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    base_dir: Option<PathBuf>,
}

impl FileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.base_dir {
            Some(base_dir) if Path::new(path).is_relative() => base_dir.join(path),
            _ => PathBuf::from(path),
        }
    }
}

impl SampleFetcher for FileFetcher {
    fn fetch(&self, path: &str) -> Result<Vec<u8>, Error> {
        fs::read(self.resolve(path)).map_err(|err| Error::SampleFetchError(path.into(), err.into()))
    }
}

// -------------------------------------------------------------------------------------------------

/// An immutable, decoded, planar sample buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl DecodedSample {
    /// Create a new sample buffer from planar channel data. All channels must have the same
    /// length, and there must be at least one channel.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self, Error> {
        if channels.is_empty() {
            return Err(Error::ParameterError(
                "sample buffer needs at least one channel".to_string(),
            ));
        }
        if sample_rate == 0 {
            return Err(Error::ParameterError(
                "sample buffer needs a valid sample rate".to_string(),
            ));
        }
        let frame_count = channels[0].len();
        if channels.iter().any(|channel| channel.len() != frame_count) {
            return Err(Error::ParameterError(
                "sample buffer channels must have the same length".to_string(),
            ));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Create a new sample buffer from interleaved sample data.
    pub fn from_interleaved(
        interleaved: &[f32],
        channel_count: usize,
        sample_rate: u32,
    ) -> Result<Self, Error> {
        if channel_count == 0 {
            return Err(Error::ParameterError(
                "sample buffer needs at least one channel".to_string(),
            ));
        }
        let frame_count = interleaved.len() / channel_count;
        let mut channels = vec![vec![0.0; frame_count]; channel_count];
        interleaved_to_planar(interleaved, &mut channels);
        Self::new(channels, sample_rate)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames in each channel.
    pub fn frame_count(&self) -> usize {
        self.channels[0].len()
    }

    /// Length of the buffer in seconds.
    pub fn duration(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(|c| c.as_slice())
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Read a cubic (Catmull-Rom) interpolated sample value at the given fractional frame
    /// position. Positions outside of the buffer read as silence. Neighbour samples are
    /// clamped to the buffer's edges.
    #[inline]
    pub fn sample_at(&self, channel: usize, position: f64) -> f32 {
        let buffer = &self.channels[channel];
        let len = buffer.len();
        if !(position >= 0.0) || position > (len as f64 - 1.0) || len == 0 {
            return 0.0;
        }
        let max_index = len - 1;
        let index = (position as usize).min(max_index);
        let fraction = (position - index as f64) as f32;

        let i1 = index;
        let i0 = i1.saturating_sub(1);
        let i2 = (i1 + 1).min(max_index);
        let i3 = (i1 + 2).min(max_index);

        assume!(unsafe: i0 < len);
        let y0 = buffer[i0];
        assume!(unsafe: i1 < len);
        let y1 = buffer[i1];
        assume!(unsafe: i2 < len);
        let y2 = buffer[i2];
        assume!(unsafe: i3 < len);
        let y3 = buffer[i3];

        let a = -0.5 * y0 + 1.5 * y1 - 1.5 * y2 + 0.5 * y3;
        let b = y0 - 2.5 * y1 + 2.0 * y2 - 0.5 * y3;
        let c = -0.5 * y0 + 0.5 * y2;
        let d = y1;

        a * fraction * fraction * fraction + b * fraction * fraction + c * fraction + d
    }
}

// -------------------------------------------------------------------------------------------------

/// Load state of a [`SampleSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SampleLoadState {
    Unloaded,
    Loading,
    Loaded,
    /// Fetching or decoding failed. Sources never leave this state: create a new source to
    /// retry loading.
    Failed,
}

#[derive(Debug)]
enum LoadSlot {
    Unloaded,
    Loading,
    Loaded(Arc<DecodedSample>),
    Failed(String),
}

// -------------------------------------------------------------------------------------------------

/// Owns one decoded sample buffer, which gets populated exactly once via [`SampleSource::load`].
///
/// Once loaded, the buffer is immutable and shared by reference with every grain that reads
/// from it, so replacing a source never affects grains that are already playing.
#[derive(Debug)]
pub struct SampleSource {
    id: usize,
    definition: SampleDefinition,
    slot: Mutex<LoadSlot>,
}

impl SampleSource {
    /// Create a new, not yet loaded sample source.
    pub fn new(definition: SampleDefinition) -> Self {
        Self {
            id: unique_usize_id(),
            definition,
            slot: Mutex::new(LoadSlot::Unloaded),
        }
    }

    /// Create a new source from an already decoded sample buffer.
    pub fn from_decoded(definition: SampleDefinition, sample: DecodedSample) -> Self {
        Self {
            id: unique_usize_id(),
            definition,
            slot: Mutex::new(LoadSlot::Loaded(Arc::new(sample))),
        }
    }

    /// Unique id of this source instance. Two sources loading the same definition have
    /// different ids.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn definition(&self) -> &SampleDefinition {
        &self.definition
    }

    pub fn state(&self) -> SampleLoadState {
        match &*self.lock_slot() {
            LoadSlot::Unloaded => SampleLoadState::Unloaded,
            LoadSlot::Loading => SampleLoadState::Loading,
            LoadSlot::Loaded(_) => SampleLoadState::Loaded,
            LoadSlot::Failed(_) => SampleLoadState::Failed,
        }
    }

    /// Error message of a failed load, if any.
    pub fn error_message(&self) -> Option<String> {
        match &*self.lock_slot() {
            LoadSlot::Failed(message) => Some(message.clone()),
            _ => None,
        }
    }

    /// The decoded buffer, when loaded.
    pub fn sample(&self) -> Option<Arc<DecodedSample>> {
        match &*self.lock_slot() {
            LoadSlot::Loaded(sample) => Some(Arc::clone(sample)),
            _ => None,
        }
    }

    /// Duration of the decoded buffer in seconds, or 0 when not loaded.
    pub fn duration(&self) -> f64 {
        self.sample().map_or(0.0, |sample| sample.duration())
    }

    /// Fetch and decode the sample. Blocks until the sample is decoded.
    ///
    /// May only be called once: calling it while the source is loading, or after it got
    /// loaded or failed to load, returns [`Error::RedundantLoad`].
    pub fn load(&self, fetcher: &dyn SampleFetcher) -> Result<Arc<DecodedSample>, Error> {
        {
            let mut slot = self.lock_slot();
            if !matches!(*slot, LoadSlot::Unloaded) {
                return Err(Error::RedundantLoad);
            }
            *slot = LoadSlot::Loading;
        }
        match self.fetch_and_decode(fetcher) {
            Ok(sample) => {
                *self.lock_slot() = LoadSlot::Loaded(Arc::clone(&sample));
                Ok(sample)
            }
            Err(err) => {
                log::warn!("Failed to load sample {}: {err}", self.definition);
                *self.lock_slot() = LoadSlot::Failed(err.to_string());
                Err(err)
            }
        }
    }

    fn fetch_and_decode(&self, fetcher: &dyn SampleFetcher) -> Result<Arc<DecodedSample>, Error> {
        let path = &self.definition.path;
        log::debug!("Fetching sample {}...", self.definition);

        let fetch_start = Instant::now();
        let bytes = fetcher.fetch(path)?;
        log::debug!(
            "Fetched {} bytes for sample '{}' in {} ms",
            bytes.len(),
            self.definition.name,
            fetch_start.elapsed().as_millis()
        );

        let decode_start = Instant::now();
        let extension = Path::new(path).extension().and_then(|ext| ext.to_str());
        let mut decoder = AudioDecoder::from_buffer(bytes, extension)?;
        let signal_spec = decoder.signal_spec()?;
        let interleaved = decoder.decode_all()?;
        let sample = DecodedSample::from_interleaved(
            &interleaved,
            signal_spec.channels.count(),
            signal_spec.rate,
        )?;
        log::debug!(
            "Decoded sample '{}' in {} ms: {} channels, {} Hz, {:.3} seconds",
            self.definition.name,
            decode_start.elapsed().as_millis(),
            sample.channel_count(),
            sample.sample_rate(),
            sample.duration()
        );
        Ok(Arc::new(sample))
    }

    fn lock_slot(&self) -> MutexGuard<'_, LoadSlot> {
        lock(&self.slot)
    }
}

// -------------------------------------------------------------------------------------------------

/// A sample source which is loading on a background thread.
///
/// Use [`SampleLoadTask::state`] to poll the loading progress without blocking, or
/// [`SampleLoadTask::wait`] to block until loading finished.
pub struct SampleLoadTask {
    source: Arc<SampleSource>,
    thread: JoinHandle<Result<(), Error>>,
}

impl SampleLoadTask {
    /// Run the given load function with the given source on a new thread.
    pub(crate) fn spawn<F>(source: Arc<SampleSource>, load: F) -> Result<Self, Error>
    where
        F: FnOnce(&Arc<SampleSource>) -> Result<(), Error> + Send + 'static,
    {
        let thread_source = Arc::clone(&source);
        let thread = thread::Builder::new()
            .name("grainflow_sample_loader".to_string())
            .spawn(move || load(&thread_source))?;
        Ok(Self { source, thread })
    }

    pub fn source(&self) -> &Arc<SampleSource> {
        &self.source
    }

    pub fn state(&self) -> SampleLoadState {
        self.source.state()
    }

    /// True when the background thread finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the load finished. Returns the loaded source or the load error.
    pub fn wait(self) -> Result<Arc<SampleSource>, Error> {
        match self.thread.join() {
            Ok(result) => result.map(|_| self.source),
            Err(err) => Err(Error::SampleLoadFailed(format!(
                "sample loader panicked: {}",
                panic_message::panic_message(&err)
            ))),
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, io};

    use super::*;

    /// Creates a 16 bit WAV file in memory.
    pub(crate) fn wav_bytes(channels: &[Vec<f32>], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: channels.len() as u16,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for frame in 0..channels[0].len() {
                for channel in channels {
                    let value = (channel[frame].clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    writer.write_sample(value).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// Serves in-memory files.
    #[derive(Default)]
    pub(crate) struct MemoryFetcher {
        files: HashMap<String, Vec<u8>>,
    }

    impl MemoryFetcher {
        pub(crate) fn with_file(mut self, path: &str, bytes: Vec<u8>) -> Self {
            self.files.insert(path.to_string(), bytes);
            self
        }
    }

    impl SampleFetcher for MemoryFetcher {
        fn fetch(&self, path: &str) -> Result<Vec<u8>, Error> {
            self.files.get(path).cloned().ok_or_else(|| {
                Error::SampleFetchError(
                    path.to_string(),
                    io::Error::from(io::ErrorKind::NotFound).into(),
                )
            })
        }
    }

    #[test]
    fn load_lifecycle() -> Result<(), Error> {
        let frames = 4410;
        let channel = (0..frames).map(|i| (i as f32 / 100.0).sin() * 0.5).collect();
        let fetcher = MemoryFetcher::default().with_file("a.wav", wav_bytes(&[channel], 44100));

        let source = SampleSource::new(SampleDefinition::new("a", "a.wav"));
        assert_eq!(source.state(), SampleLoadState::Unloaded);
        assert_eq!(source.duration(), 0.0);

        let sample = source.load(&fetcher)?;
        assert_eq!(source.state(), SampleLoadState::Loaded);
        assert_eq!(sample.channel_count(), 1);
        assert_eq!(sample.sample_rate(), 44100);
        assert_eq!(sample.frame_count(), frames);
        assert!((source.duration() - 0.1).abs() < 1e-9);
        assert_eq!(source.duration(), sample.duration());

        assert!(matches!(source.load(&fetcher), Err(Error::RedundantLoad)));
        Ok(())
    }

    #[test]
    fn failed_loads() {
        let fetcher = MemoryFetcher::default().with_file("garbage.wav", vec![1, 2, 3, 4]);

        let missing = SampleSource::new(SampleDefinition::new("missing", "missing.wav"));
        assert!(matches!(
            missing.load(&fetcher),
            Err(Error::SampleFetchError(_, _))
        ));
        assert_eq!(missing.state(), SampleLoadState::Failed);
        assert!(missing.error_message().is_some());
        assert!(matches!(missing.load(&fetcher), Err(Error::RedundantLoad)));

        let garbage = SampleSource::new(SampleDefinition::new("garbage", "garbage.wav"));
        assert!(garbage.load(&fetcher).is_err());
        assert_eq!(garbage.state(), SampleLoadState::Failed);
        assert_eq!(garbage.duration(), 0.0);
    }

    #[test]
    fn background_load() -> Result<(), Error> {
        let stereo = [vec![0.25; 100], vec![0.25; 100]];
        let fetcher =
            Arc::new(MemoryFetcher::default().with_file("b.wav", wav_bytes(&stereo, 48000)));
        let source = Arc::new(SampleSource::new(SampleDefinition::new("b", "b.wav")));
        let task = SampleLoadTask::spawn(source, move |source| {
            source.load(fetcher.as_ref()).map(|_| ())
        })?;
        let source = task.wait()?;
        assert_eq!(source.state(), SampleLoadState::Loaded);
        assert_eq!(source.sample().map(|s| s.channel_count()), Some(2));
        Ok(())
    }

    #[test]
    fn interpolation() -> Result<(), Error> {
        let sample = DecodedSample::new(vec![vec![0.0, 1.0, 2.0, 3.0, 4.0]], 10)?;
        assert_eq!(sample.sample_at(0, 0.0), 0.0);
        assert_eq!(sample.sample_at(0, 2.0), 2.0);
        assert!((sample.sample_at(0, 2.5) - 2.5).abs() < 1e-6);
        assert_eq!(sample.sample_at(0, 4.0), 4.0);
        assert_eq!(sample.sample_at(0, -0.5), 0.0);
        assert_eq!(sample.sample_at(0, 4.5), 0.0);
        assert_eq!(sample.sample_at(0, f64::NAN), 0.0);
        assert_eq!(sample.duration(), 0.5);
        Ok(())
    }

    #[test]
    fn invalid_buffers() {
        assert!(DecodedSample::new(vec![], 44100).is_err());
        assert!(DecodedSample::new(vec![vec![0.0; 4]], 0).is_err());
        assert!(DecodedSample::new(vec![vec![0.0; 4], vec![0.0; 3]], 44100).is_err());
        assert!(DecodedSample::from_interleaved(&[0.0; 4], 0, 44100).is_err());
    }
}
