use std::{error, fmt, io};

// -------------------------------------------------------------------------------------------------

/// Provides an enumeration of all possible errors reported by grainflow.
#[derive(Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// A voice got started while it still is in use by a previous start.
    VoiceInUse,
    /// A sample source got loaded while it is already loading or loaded.
    RedundantLoad,
    /// Playback got started before a sample was loaded.
    SampleNotLoaded,
    /// A sample load failed. Used when waiting for a load which failed elsewhere.
    SampleLoadFailed(String),
    SampleFetchError(String, Box<dyn error::Error + Send + Sync>),
    MediaFileNotFound,
    MediaFileProbeError,
    AudioDecodingError(Box<dyn error::Error + Send + Sync>),
    OutputDeviceError(Box<dyn error::Error + Send + Sync>),
    ParameterError(String),
    SendError(String),
    IoError(io::Error),
}

impl Error {
    /// True for errors which are caused by calling an API in an invalid state. Those are
    /// programming errors which should not be retried.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::VoiceInUse | Self::RedundantLoad | Self::SampleNotLoaded
        )
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VoiceInUse => write!(f, "Polyphony fail: voice already in use"),
            Self::RedundantLoad => write!(f, "Redundant load call: sample is loading or loaded"),
            Self::SampleNotLoaded => write!(f, "No sample source loaded"),
            Self::SampleLoadFailed(str) => write!(f, "Sample failed to load: {str}"),
            Self::SampleFetchError(path, err) => write!(f, "Failed to fetch '{path}': {err}"),
            Self::MediaFileNotFound => write!(f, "Audio file has no playable track"),
            Self::MediaFileProbeError => write!(f, "Audio file failed to probe"),
            Self::AudioDecodingError(err) | Self::OutputDeviceError(err) => err.fmt(f),
            Self::ParameterError(str) => write!(f, "Invalid parameter: {str}"),
            Self::SendError(str) => write!(f, "Failed to send channel message: {str}"),
            Self::IoError(err) => err.fmt(f),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        Error::SendError(err.to_string())
    }
}
