//! Vorbis decode driver.
//!
//! A thin layer over lewton's low-level packet API. The demuxer hands the
//! three Vorbis header packets over as codec-private data; each
//! [`decode`](crate::codec::Codec::decode) call then consumes exactly one
//! audio packet, with lewton's window state carried between calls.

use lewton::{
    audio::{read_audio_packet_generic, PreviousWindowRight},
    header::{read_header_comment, read_header_ident, read_header_setup, IdentHeader, SetupHeader},
    samples::InterleavedSamples,
};

use crate::{
    chunk::MediaChunk,
    codec::{AudioFrame, Codec, FailureCounter},
    demux::StreamInfo,
    error::{Error, Result},
};

/// Splits the length-prefixed codec-private blob back into packets.
///
/// The Ogg demuxer stores header packets as `u32-le length || bytes`,
/// repeated.
pub(crate) fn split_codec_private(data: &[u8]) -> Vec<&[u8]> {
    let mut packets = Vec::new();
    let mut rest = data;
    while rest.len() >= 4 {
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if len > rest.len() {
            break;
        }
        packets.push(&rest[..len]);
        rest = &rest[len..];
    }
    packets
}

/// Vorbis decoder driving lewton packet by packet.
pub struct VorbisCodec {
    codec_private: Vec<u8>,
    ident: Option<IdentHeader>,
    setup: Option<SetupHeader>,
    window: PreviousWindowRight,
    failures: FailureCounter,
    sample_rate: u32,
    channels: u8,
}

impl VorbisCodec {
    #[must_use]
    pub fn new(info: &StreamInfo) -> Self {
        Self {
            codec_private: info.codec_private.clone(),
            ident: None,
            setup: None,
            window: PreviousWindowRight::new(),
            failures: FailureCounter::default(),
            sample_rate: info.sample_rate,
            channels: info.channels,
        }
    }

    /// Nominal frames for a silence substitute: half the long window.
    fn nominal_frames(&self) -> usize {
        self.ident
            .as_ref()
            .map_or(1024, |ident| (1usize << ident.blocksize_1) / 2)
    }
}

impl Codec for VorbisCodec {
    fn initialize(&mut self) -> Result<()> {
        let packets = split_codec_private(&self.codec_private);
        let [ident_packet, comment_packet, setup_packet] = packets.as_slice() else {
            return Err(Error::format(format!(
                "expected 3 Vorbis header packets, found {}",
                packets.len()
            )));
        };

        let ident = read_header_ident(ident_packet)
            .map_err(|e| Error::format(format!("Vorbis identification header: {e:?}")))?;
        read_header_comment(comment_packet)
            .map_err(|e| Error::format(format!("Vorbis comment header: {e:?}")))?;
        let setup = read_header_setup(
            setup_packet,
            ident.audio_channels,
            (ident.blocksize_0, ident.blocksize_1),
        )
        .map_err(|e| Error::format(format!("Vorbis setup header: {e:?}")))?;

        self.sample_rate = ident.audio_sample_rate;
        self.channels = ident.audio_channels;
        self.ident = Some(ident);
        self.setup = Some(setup);
        self.window = PreviousWindowRight::new();
        Ok(())
    }

    fn decode(&mut self, chunk: &MediaChunk, frame: &mut AudioFrame) -> Result<()> {
        let (Some(ident), Some(setup)) = (self.ident.as_ref(), self.setup.as_ref()) else {
            return Err(Error::exception("Vorbis codec driven before initialize"));
        };

        frame.pcm.clear();
        frame.sample_rate = self.sample_rate;
        frame.channels = self.channels;
        if chunk.end_of_stream {
            return Ok(());
        }

        match read_audio_packet_generic::<InterleavedSamples<i16>>(
            ident,
            setup,
            chunk.data(),
            &mut self.window,
        ) {
            Ok(decoded) => {
                self.failures.success();
                // The first packet after priming legitimately yields no
                // samples; an empty frame keeps the stream glue pulling.
                frame.pcm.extend_from_slice(&decoded.samples);
                Ok(())
            }
            Err(e) => {
                warn!("Vorbis packet at byte {} undecodable: {e:?}", chunk.file_offset);
                frame.fill_silence(self.nominal_frames(), self.sample_rate, self.channels);
                if self.failures.failure() {
                    debug!("resetting Vorbis window state after repeated failures");
                    self.window = PreviousWindowRight::new();
                }
                Ok(())
            }
        }
    }

    fn reset(&mut self) {
        self.window = PreviousWindowRight::new();
        self.failures.success();
    }

    fn codec_name(&self) -> &'static str {
        "vorbis"
    }

    fn max_samples_per_frame(&self) -> usize {
        self.ident
            .as_ref()
            .map_or(8192, |ident| 1usize << ident.blocksize_1)
    }
}
