//! Opus decode driver.
//!
//! A thin layer over libopus. Opus always decodes at its internal 48 kHz
//! rate; the identification header's pre-skip samples are discarded from
//! the first decoded output and the Q7.8 dB output gain is applied inside
//! the decoder.

use crate::{
    chunk::MediaChunk,
    codec::{AudioFrame, Codec, FailureCounter},
    demux::StreamInfo,
    error::{Error, Result},
};

/// Opus' internal sample rate.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Longest Opus frame: 120 ms at 48 kHz.
const MAX_FRAME_SAMPLES: usize = 5760;

/// Nominal packet duration used for silence substitution (20 ms).
const NOMINAL_FRAME_SAMPLES: usize = 960;

/// Parsed `OpusHead` identification header.
#[derive(Clone, Copy, Debug)]
pub struct OpusHead {
    pub channels: u8,
    pub pre_skip: u16,
    pub output_gain: i16,
    pub mapping_family: u8,
}

impl OpusHead {
    /// Parses an `OpusHead` packet.
    ///
    /// # Errors
    ///
    /// Format error on a short packet, bad signature or unsupported
    /// version.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 19 {
            return Err(Error::format("OpusHead packet too short"));
        }
        if &data[0..8] != b"OpusHead" {
            return Err(Error::format("invalid OpusHead signature"));
        }
        let version = data[8];
        if version >> 4 != 0 {
            return Err(Error::format(format!("unsupported OpusHead version {version}")));
        }
        Ok(Self {
            channels: data[9],
            pre_skip: u16::from_le_bytes([data[10], data[11]]),
            output_gain: i16::from_le_bytes([data[16], data[17]]),
            mapping_family: data[18],
        })
    }
}

/// Opus decoder driving libopus packet by packet.
pub struct OpusCodec {
    codec_private: Vec<u8>,
    decoder: Option<opus::Decoder>,
    head: Option<OpusHead>,

    /// Samples per channel still to discard from decoder output.
    remaining_skip: usize,

    /// Pre-allocated output for the longest possible frame.
    scratch: Vec<i16>,

    channels: u8,
    failures: FailureCounter,
}

impl OpusCodec {
    #[must_use]
    pub fn new(info: &StreamInfo) -> Self {
        Self {
            codec_private: info.codec_private.clone(),
            decoder: None,
            head: None,
            remaining_skip: 0,
            scratch: Vec::new(),
            channels: info.channels,
            failures: FailureCounter::default(),
        }
    }
}

impl Codec for OpusCodec {
    fn initialize(&mut self) -> Result<()> {
        let head = OpusHead::parse(&self.codec_private)?;
        if head.mapping_family != 0 || !(1..=2).contains(&head.channels) {
            return Err(Error::format(format!(
                "unsupported Opus channel mapping family {} with {} channels",
                head.mapping_family, head.channels
            )));
        }

        let channels = if head.channels == 1 {
            opus::Channels::Mono
        } else {
            opus::Channels::Stereo
        };
        let mut decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, channels)
            .map_err(|e| Error::format(format!("Opus decoder creation failed: {e}")))?;
        if head.output_gain != 0 {
            decoder
                .set_gain(i32::from(head.output_gain))
                .map_err(|e| Error::format(format!("Opus gain rejected: {e}")))?;
        }

        self.scratch = vec![0i16; MAX_FRAME_SAMPLES * usize::from(head.channels)];
        self.remaining_skip = usize::from(head.pre_skip);
        self.channels = head.channels;
        self.decoder = Some(decoder);
        self.head = Some(head);
        debug!(
            "Opus codec ready: {} ch, pre-skip {}, gain {} Q7.8 dB",
            head.channels, head.pre_skip, head.output_gain
        );
        Ok(())
    }

    fn decode(&mut self, chunk: &MediaChunk, frame: &mut AudioFrame) -> Result<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(Error::exception("Opus codec driven before initialize"));
        };

        frame.pcm.clear();
        frame.sample_rate = OPUS_SAMPLE_RATE;
        frame.channels = self.channels;
        if chunk.end_of_stream {
            return Ok(());
        }

        match decoder.decode(chunk.data(), &mut self.scratch, false) {
            Ok(decoded_frames) => {
                self.failures.success();
                let channels = usize::from(self.channels);
                let drop = self.remaining_skip.min(decoded_frames);
                self.remaining_skip -= drop;
                frame
                    .pcm
                    .extend_from_slice(&self.scratch[drop * channels..decoded_frames * channels]);
                Ok(())
            }
            Err(e) => {
                warn!("Opus packet at byte {} undecodable: {e}", chunk.file_offset);
                frame.fill_silence(NOMINAL_FRAME_SAMPLES, OPUS_SAMPLE_RATE, self.channels);
                if self.failures.failure() {
                    debug!("resetting Opus decoder state after repeated failures");
                    self.reset();
                }
                Ok(())
            }
        }
    }

    fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(e) = decoder.reset_state() {
                warn!("Opus decoder state reset failed: {e}");
            }
        }
        // Pre-skip applies once, at the start of the stream; a post-seek
        // reset must not re-arm it.
        self.failures.success();
    }

    fn codec_name(&self) -> &'static str {
        "opus"
    }

    fn max_samples_per_frame(&self) -> usize {
        MAX_FRAME_SAMPLES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus_head(channels: u8, pre_skip: u16, gain: i16) -> Vec<u8> {
        let mut head = Vec::new();
        head.extend_from_slice(b"OpusHead");
        head.push(1); // version
        head.push(channels);
        head.extend_from_slice(&pre_skip.to_le_bytes());
        head.extend_from_slice(&48_000u32.to_le_bytes());
        head.extend_from_slice(&gain.to_le_bytes());
        head.push(0); // mapping family
        head
    }

    #[test]
    fn parses_opus_head() {
        let head = OpusHead::parse(&opus_head(2, 312, -256)).expect("parse");
        assert_eq!(head.channels, 2);
        assert_eq!(head.pre_skip, 312);
        assert_eq!(head.output_gain, -256);
        assert_eq!(head.mapping_family, 0);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut data = opus_head(2, 0, 0);
        data[0] = b'X';
        assert!(OpusHead::parse(&data).is_err());
    }

    #[test]
    fn rejects_future_versions() {
        let mut data = opus_head(2, 0, 0);
        data[8] = 0x20;
        assert!(OpusHead::parse(&data).is_err());
    }

    #[test]
    fn initialize_rejects_multichannel_mappings() {
        let mut info = StreamInfo::audio(0, "opus", 48_000, 6, 16);
        let mut head = opus_head(6, 0, 0);
        head[18] = 1; // mapping family 1
        info.codec_private = head;
        let mut codec = OpusCodec::new(&info);
        assert!(codec.initialize().is_err());
    }

    #[test]
    fn pre_skip_discards_leading_samples() {
        let mut info = StreamInfo::audio(0, "opus", 48_000, 2, 16);
        info.codec_private = opus_head(2, 312, 0);
        let mut codec = OpusCodec::new(&info);
        codec.initialize().expect("initialize");
        assert_eq!(codec.remaining_skip, 312);

        // A real packet decode is exercised end to end elsewhere; here the
        // skip bookkeeping must arm exactly once.
        codec.reset();
        assert_eq!(codec.remaining_skip, 312);
    }
}
