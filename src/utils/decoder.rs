use std::io;

use symphonia::core::{
    audio::{SampleBuffer, SignalSpec},
    codecs::{CodecParameters, Decoder, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::error::Error;

// -------------------------------------------------------------------------------------------------

/// Decodes encoded audio file content into interleaved f32 samples.
pub struct AudioDecoder {
    track_id: u32, // Internal track index.
    decoder: Box<dyn Decoder>,
    format: Box<dyn FormatReader>,
}

impl AudioDecoder {
    /// Create a new decoder from the given encoded file content. The optional extension
    /// (e.g. "wav") is used as a hint for the format probe.
    pub fn from_buffer(buffer: Vec<u8>, extension: Option<&str>) -> Result<Self, Error> {
        let cursor = Box::new(io::Cursor::new(buffer));
        let source_stream = MediaSourceStream::new(cursor, Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = extension {
            hint.with_extension(extension);
        }
        Self::from_source_stream(source_stream, hint)
    }

    /// Create a new decoder from the given Symphonia MediaSourceStream
    fn from_source_stream(source_stream: MediaSourceStream, hint: Hint) -> Result<Self, Error> {
        // Use the default options when reading and decoding.
        let format_opts: FormatOptions = Default::default();
        let metadata_opts: MetadataOptions = Default::default();
        let decoder_opts: DecoderOptions = Default::default();

        // Probe the media source stream for a format.
        let probed = symphonia::default::get_probe()
            .format(&hint, source_stream, &format_opts, &metadata_opts)
            .map_err(|_| Error::MediaFileProbeError)?;

        // Get the format reader yielded by the probe operation.
        let format = probed.format;

        // Get the default track.
        let track = format.default_track().ok_or(Error::MediaFileNotFound)?;
        let track_id = track.id;

        // Create a decoder for the track.
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &decoder_opts)
            .map_err(|err| Error::AudioDecodingError(Box::new(err)))?;

        Ok(Self {
            track_id,
            decoder,
            format,
        })
    }

    pub fn codec_params(&self) -> &CodecParameters {
        self.decoder.codec_params()
    }

    pub fn signal_spec(&self) -> Result<SignalSpec, Error> {
        let params = self.codec_params();
        match (params.sample_rate, params.channels) {
            (Some(rate), Some(channels)) if rate > 0 && channels.count() > 0 => {
                Ok(SignalSpec { rate, channels })
            }
            _ => Err(Error::AudioDecodingError(Box::new(
                SymphoniaError::Unsupported("missing sample rate or channel layout"),
            ))),
        }
    }

    /// Decode the entire stream into a single interleaved buffer.
    pub fn decode_all(&mut self) -> Result<Vec<f32>, Error> {
        let signal_spec = self.signal_spec()?;
        let channel_count = signal_spec.channels.count();

        // prealloc entire buffer, when the decoder gives us a frame hint
        let buffer_capacity =
            self.codec_params().n_frames.unwrap_or(0) as usize * channel_count;
        let mut buffer = Vec::with_capacity(buffer_capacity);

        // decode the entire file into our buffer in chunks of max_frames_per_packet sizes
        let decode_buffer_capacity = self
            .codec_params()
            .max_frames_per_packet
            .unwrap_or(16 * 1024);
        let mut decode_buffer = SampleBuffer::<f32>::new(decode_buffer_capacity, signal_spec);
        while self.read_packet(&mut decode_buffer)? {
            buffer.extend_from_slice(decode_buffer.samples());
        }
        if buffer.is_empty() {
            return Err(Error::AudioDecodingError(Box::new(
                SymphoniaError::DecodeError("failed to decode any samples"),
            )));
        }
        Ok(buffer)
    }

    /// Read a next packet of audio from this decoder. Returns `Ok(false)` at the end of the
    /// stream and an error on unrecoverable format errors.
    fn read_packet(&mut self, samples: &mut SampleBuffer<f32>) -> Result<bool, Error> {
        loop {
            // Demux an encoded packet from the media format.
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(false); // End of this stream.
                }
                Err(err) => {
                    log::error!("format error: {err}");
                    return Err(Error::AudioDecodingError(Box::new(err)));
                }
            };
            // If the packet does not belong to the selected track, skip over it.
            if packet.track_id() != self.track_id {
                continue;
            }
            // Decode the packet into an audio buffer.
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    // Interleave the samples into the buffer.
                    samples.copy_interleaved_ref(decoded);
                    return Ok(true);
                }
                Err(SymphoniaError::IoError(err)) => {
                    // The packet failed to decode due to an IO error, skip the packet.
                    log::warn!("io decode error: {err}");
                    continue;
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    // The packet failed to decode due to invalid data, skip the packet.
                    log::warn!("decode error: {err}");
                    continue;
                }
                Err(err) => {
                    log::error!("fatal decode error: {err}");
                    return Err(Error::AudioDecodingError(Box::new(err)));
                }
            };
        }
    }
}
