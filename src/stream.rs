//! Pairs a demuxer with its codec into a contiguous PCM stream.
//!
//! [`DemuxedStream`] binds a parsed demuxer's audio stream to the codec
//! the registry names for it and exposes decoded PCM two ways: as
//! interleaved samples ([`pull_samples`](DemuxedStream::pull_samples),
//! the worker thread's interface) and as little-endian bytes
//! ([`pull_pcm`](DemuxedStream::pull_pcm), the sink contract, where a
//! short count signals end of stream).
//!
//! One decoded frame is buffered internally; an underflow pulls the next
//! chunk, decodes it, and appends. Seeking instructs the demuxer first
//! and then resets the codec, in that order, so no stale frame survives.

use crate::{
    codec::{AudioFrame, Codec},
    config::Settings,
    demux::{Demuxer, StreamInfo},
    error::{Error, Result},
    registry::Registry,
};

/// A demuxer/codec pair yielding contiguous PCM.
pub struct DemuxedStream {
    demuxer: Box<dyn Demuxer>,
    codec: Box<dyn Codec>,
    stream_id: u32,
    info: StreamInfo,

    /// The buffered decoded frame and how many samples of it are spent.
    frame: AudioFrame,
    consumed: usize,

    /// Stream sample position of the buffered frame's first sample.
    frame_base: u64,

    eof: bool,
}

impl DemuxedStream {
    /// Binds a demuxer to the codec registered for its first audio
    /// stream.
    ///
    /// Parses the container if that has not happened yet, then
    /// initialises the codec and pre-reserves the frame buffer from its
    /// worst case.
    ///
    /// # Errors
    ///
    /// Propagates parse failures; fails when the container has no audio
    /// stream, the stream parameters are invalid, or no codec is
    /// registered for the codec name.
    pub fn open(
        mut demuxer: Box<dyn Demuxer>,
        registry: &Registry,
        settings: &Settings,
    ) -> Result<Self> {
        demuxer.parse_container()?;

        // Prefer the first stream that is actually decodable; containers
        // may list streams whose codec nobody registered.
        let info = demuxer
            .streams()
            .iter()
            .find(|s| s.is_valid())
            .or_else(|| demuxer.default_audio_stream())
            .ok_or_else(|| Error::format("container carries no audio stream"))?
            .clone();
        if !info.is_valid() {
            return Err(Error::format(format!(
                "stream parameters are not decodable: {} Hz, {} ch, {} bits",
                info.sample_rate, info.channels, info.bits_per_sample
            )));
        }

        let mut codec = registry.create_codec(&info, settings)?;
        codec.initialize()?;

        let mut frame = AudioFrame::new();
        frame
            .pcm
            .reserve(codec.max_samples_per_frame() * usize::from(info.channels));

        debug!(
            "stream bound: {} -> {} ({} Hz, {} ch)",
            info.codec_name,
            codec.codec_name(),
            info.sample_rate,
            info.channels
        );

        Ok(Self {
            stream_id: info.stream_id,
            demuxer,
            codec,
            info,
            frame,
            consumed: 0,
            frame_base: 0,
            eof: false,
        })
    }

    /// The bound stream's description.
    #[must_use]
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Output sample rate and channel count.
    ///
    /// Taken from the most recent decoded frame once one exists, since
    /// codecs refine the container's declaration.
    #[must_use]
    pub fn spec(&self) -> (u32, u8) {
        if self.frame.sample_rate > 0 && self.frame.channels > 0 {
            (self.frame.sample_rate, self.frame.channels)
        } else {
            (self.info.sample_rate, self.info.channels)
        }
    }

    /// Whether all PCM has been handed out.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Total duration in milliseconds; zero when unknown.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.demuxer.duration_ms()
    }

    /// Current position in samples from the start of the stream.
    #[must_use]
    pub fn position_samples(&self) -> u64 {
        let channels = usize::from(self.frame.channels.max(1));
        self.frame_base + (self.consumed / channels) as u64
    }

    /// Refills the internal frame. Returns false at end of stream.
    fn refill(&mut self) -> Result<bool> {
        loop {
            let chunk = self.demuxer.read_chunk(Some(self.stream_id))?;
            if chunk.end_of_stream {
                self.codec.flush(&mut self.frame)?;
                self.consumed = 0;
                if self.frame.is_empty() {
                    self.eof = true;
                    return Ok(false);
                }
                return Ok(true);
            }

            self.codec.decode(&chunk, &mut self.frame)?;
            self.consumed = 0;
            if !self.frame.is_empty() {
                self.frame_base = chunk.timestamp_samples;
                return Ok(true);
            }
            // Header-only or priming packets decode to nothing; keep
            // pulling.
        }
    }

    /// Fills `out` with interleaved samples; a short count means end of
    /// stream.
    ///
    /// # Errors
    ///
    /// Propagates demuxer and codec failures.
    pub fn pull_samples(&mut self, out: &mut [i16]) -> Result<usize> {
        let mut filled = 0;
        while filled < out.len() {
            if self.consumed >= self.frame.pcm.len() {
                if !self.eof && !self.refill()? {
                    break;
                }
                if self.eof {
                    break;
                }
            }
            let available = &self.frame.pcm[self.consumed..];
            let take = available.len().min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&available[..take]);
            self.consumed += take;
            filled += take;
        }
        Ok(filled)
    }

    /// Fills `out` with little-endian PCM bytes; a short count means end
    /// of stream.
    ///
    /// # Errors
    ///
    /// Propagates demuxer and codec failures.
    pub fn pull_pcm(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        // Whole samples only.
        let limit = out.len() - out.len() % 2;
        while filled < limit {
            if self.consumed >= self.frame.pcm.len() {
                if !self.eof && !self.refill()? {
                    break;
                }
                if self.eof {
                    break;
                }
            }
            let available = &self.frame.pcm[self.consumed..];
            let take = available.len().min((limit - filled) / 2);
            for sample in &available[..take] {
                let bytes = sample.to_le_bytes();
                out[filled] = bytes[0];
                out[filled + 1] = bytes[1];
                filled += 2;
            }
            self.consumed += take;
        }
        Ok(filled)
    }

    /// Seeks to a sample position: demuxer first, then codec reset.
    ///
    /// # Errors
    ///
    /// Propagates the demuxer's seek failure; the codec is reset either
    /// way.
    pub fn seek_to_sample(&mut self, sample: u64) -> Result<()> {
        let rate = u64::from(self.info.sample_rate.max(1));
        self.seek_to_ms(sample * 1000 / rate)
    }

    /// Seeks to a millisecond position: demuxer first, then codec reset.
    ///
    /// # Errors
    ///
    /// Propagates the demuxer's seek failure; the codec is reset either
    /// way.
    pub fn seek_to_ms(&mut self, position_ms: u64) -> Result<()> {
        let result = self.demuxer.seek_to(position_ms);
        // The codec must not carry state across the discontinuity even if
        // the seek failed partway.
        self.codec.reset();
        self.frame.clear();
        self.consumed = 0;
        self.frame_base = position_ms * u64::from(self.info.sample_rate) / 1000;
        self.eof = self.demuxer.is_eof();
        result
    }
}
