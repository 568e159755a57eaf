//! FLAC bitstream decoder.
//!
//! Reference-decoder-compliant frame decoding: bit-exact header parsing
//! with CRC-8 validation, CONSTANT / VERBATIM / FIXED / LPC subframes with
//! Rice-coded residuals, stereo decorrelation modes, and CRC-16 frame
//! validation under the configured [`CrcMode`].
//!
//! The decoder owns per-channel working buffers sized at
//! [`initialize`](crate::codec::Codec::initialize) from the STREAMINFO
//! worst case; decoding allocates nothing.

use crate::{
    chunk::MediaChunk,
    codec::{sample_to_i16, AudioFrame, Codec, FailureCounter, TriangularDither},
    config::CrcMode,
    demux::StreamInfo,
    error::{Error, Result},
};

pub mod frame;
pub mod subframe;

use frame::{crc16, BitReader, ChannelAssignment, FrameHeader, Streaminfo};
use subframe::decode_subframe;

/// CRC mismatches tolerated in `Enabled` mode before checking is switched
/// off for the stream.
const CRC_AUTO_DISABLE_THRESHOLD: u32 = 10;

/// Fallback worst-case block size when no STREAMINFO is available.
const FALLBACK_MAX_BLOCK: u16 = 8192;

/// In-crate FLAC decoder.
pub struct FlacCodec {
    /// Raw STREAMINFO bytes from the container.
    codec_private: Vec<u8>,

    /// Stream parameters as the container reported them, used when the
    /// codec-private data is absent or implausible.
    declared: StreamInfo,

    crc_mode: CrcMode,

    /// Latched when `Enabled`-mode mismatches pass the threshold.
    crc_disabled: bool,
    crc_mismatches: u32,

    streaminfo: Option<Streaminfo>,

    /// One worst-case buffer per channel, allocated at initialise.
    channel_buf: Vec<Vec<i32>>,

    failures: FailureCounter,
    dither: TriangularDither,
}

impl FlacCodec {
    #[must_use]
    pub fn new(info: &StreamInfo, crc_mode: CrcMode) -> Self {
        Self {
            codec_private: info.codec_private.clone(),
            declared: info.clone(),
            crc_mode,
            crc_disabled: false,
            crc_mismatches: 0,
            streaminfo: None,
            channel_buf: Vec::new(),
            failures: FailureCounter::default(),
            dither: TriangularDither::new(),
        }
    }

    /// Total decode failures observed, CRC rejections included.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.failures.total()
    }

    fn streaminfo(&self) -> Result<&Streaminfo> {
        self.streaminfo
            .as_ref()
            .ok_or_else(|| Error::exception("FLAC codec driven before initialize"))
    }

    /// Whether the frame CRC-16 should be verified for this chunk.
    fn crc_active(&self) -> bool {
        self.crc_mode != CrcMode::Disabled && !self.crc_disabled
    }

    /// Verifies the trailing CRC-16; returns false on mismatch.
    fn verify_crc(&mut self, data: &[u8]) -> bool {
        let Some(payload_len) = data.len().checked_sub(2) else {
            return false;
        };
        let stored = u16::from_be_bytes([data[payload_len], data[payload_len + 1]]);
        let computed = crc16(&data[..payload_len]);
        if stored == computed {
            return true;
        }

        self.crc_mismatches += 1;
        warn!(
            "FLAC frame CRC-16 mismatch ({} so far): stored {stored:#06x}, computed {computed:#06x}",
            self.crc_mismatches
        );
        if self.crc_mode == CrcMode::Enabled && self.crc_mismatches >= CRC_AUTO_DISABLE_THRESHOLD {
            warn!("disabling FLAC CRC checks for this stream after repeated mismatches");
            self.crc_disabled = true;
        }
        false
    }

    /// Decodes one frame into `out`. Fails without touching codec state so
    /// the caller can substitute silence.
    fn decode_frame(&mut self, data: &[u8], out: &mut AudioFrame) -> Result<FrameHeader> {
        let streaminfo = *self.streaminfo()?;
        let header = FrameHeader::parse(data, &streaminfo)?;

        let channels = usize::from(header.channel_assignment.channels());
        if channels != self.channel_buf.len() {
            return Err(Error::format(format!(
                "frame carries {channels} channels, stream declared {}",
                self.channel_buf.len()
            )));
        }
        let block_size = header.block_size as usize;
        if block_size > self.channel_buf[0].len() {
            return Err(Error::format(format!(
                "block size {block_size} exceeds the declared maximum {}",
                self.channel_buf[0].len()
            )));
        }

        let mut reader = BitReader::new(&data[header.header_len..]);
        for channel in 0..channels {
            let mut depth = u32::from(header.bits_per_sample);
            if header.channel_assignment.is_side_channel(channel) {
                depth += 1;
            }
            let buf = &mut self.channel_buf[channel];
            decode_subframe(&mut reader, block_size, depth, buf)?;
        }

        // Undo stereo decorrelation in place.
        match header.channel_assignment {
            ChannelAssignment::Independent(_) => {}
            ChannelAssignment::LeftSide => {
                let (left, side) = self.channel_buf.split_at_mut(1);
                for (l, s) in left[0][..block_size].iter().zip(&mut side[0][..block_size]) {
                    *s = l - *s;
                }
            }
            ChannelAssignment::RightSide => {
                let (side, right) = self.channel_buf.split_at_mut(1);
                for (s, r) in side[0][..block_size].iter_mut().zip(&right[0][..block_size]) {
                    *s += r;
                }
            }
            ChannelAssignment::MidSide => {
                let (mid, side) = self.channel_buf.split_at_mut(1);
                for (m, s) in mid[0][..block_size].iter_mut().zip(&mut side[0][..block_size]) {
                    // The side channel's low bit is the one lost when the
                    // mid channel was halved.
                    let wide = (i64::from(*m) << 1) | (i64::from(*s) & 1);
                    let side_val = i64::from(*s);
                    *m = ((wide + side_val) >> 1) as i32;
                    *s = ((wide - side_val) >> 1) as i32;
                }
            }
        }

        out.pcm.clear();
        out.sample_rate = header.sample_rate;
        out.channels = channels as u8;
        let bits = header.bits_per_sample;
        for i in 0..block_size {
            for channel_data in &self.channel_buf[..channels] {
                out.pcm.push(sample_to_i16(channel_data[i], bits, &mut self.dither));
            }
        }

        Ok(header)
    }

    /// Emits a silent frame of the stream's nominal block size so timing
    /// holds across a failed decode.
    fn silent_frame(&self, out: &mut AudioFrame) {
        let (block, rate, channels) = match self.streaminfo.as_ref() {
            Some(si) => (
                usize::from(si.max_block_size),
                si.sample_rate,
                si.channels,
            ),
            None => (
                usize::from(FALLBACK_MAX_BLOCK),
                self.declared.sample_rate,
                self.declared.channels,
            ),
        };
        out.fill_silence(block, rate, channels);
    }
}

impl Codec for FlacCodec {
    fn initialize(&mut self) -> Result<()> {
        let streaminfo = match Streaminfo::parse(&self.codec_private) {
            Ok(si) => si,
            Err(e) => {
                // No trustworthy STREAMINFO: fall back to the container's
                // description and a conservative worst case.
                warn!("using declared stream parameters, STREAMINFO unusable: {e}");
                Streaminfo {
                    min_block_size: 16,
                    max_block_size: FALLBACK_MAX_BLOCK,
                    min_frame_size: 0,
                    max_frame_size: 0,
                    sample_rate: self.declared.sample_rate,
                    channels: self.declared.channels,
                    bits_per_sample: self.declared.bits_per_sample,
                    total_samples: self.declared.duration_samples,
                    md5: [0; 16],
                }
            }
        };

        let block = usize::from(streaminfo.max_block_size.max(streaminfo.min_block_size));
        self.channel_buf = (0..streaminfo.channels)
            .map(|_| vec![0i32; block])
            .collect();
        self.streaminfo = Some(streaminfo);
        debug!(
            "FLAC codec ready: {} Hz, {} ch, {} bits, blocks up to {block}",
            streaminfo.sample_rate, streaminfo.channels, streaminfo.bits_per_sample
        );
        Ok(())
    }

    fn decode(&mut self, chunk: &MediaChunk, frame: &mut AudioFrame) -> Result<()> {
        self.streaminfo()?;
        if chunk.end_of_stream {
            frame.clear();
            return Ok(());
        }

        let data = chunk.data();
        if self.crc_active() && !self.verify_crc(data) && self.crc_mode == CrcMode::Strict {
            self.silent_frame(frame);
            if self.failures.failure() {
                debug!("resetting FLAC codec after repeated failures");
                self.reset();
            }
            return Ok(());
        }

        match self.decode_frame(data, frame) {
            Ok(_) => {
                self.failures.success();
                Ok(())
            }
            Err(e) => {
                warn!("FLAC frame at byte {} undecodable: {e}", chunk.file_offset);
                self.silent_frame(frame);
                if self.failures.failure() {
                    debug!("resetting FLAC codec after repeated failures");
                    self.reset();
                }
                Ok(())
            }
        }
    }

    fn reset(&mut self) {
        // Frames are independent; a reset only ends the failure run. The
        // pre-allocated buffers are retained.
        self.failures.success();
    }

    fn codec_name(&self) -> &'static str {
        "flac"
    }

    fn max_samples_per_frame(&self) -> usize {
        self.streaminfo
            .as_ref()
            .map_or(usize::from(FALLBACK_MAX_BLOCK), |si| {
                usize::from(si.max_block_size)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flac::frame::testing::{build_header, BitWriter};
    use crate::pool::ChunkPool;

    /// STREAMINFO bytes matching `frame::testing::test_streaminfo`, with a
    /// small maximum block size for compact test frames.
    fn streaminfo_bytes(channels: u8, bits: u8) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&16u16.to_be_bytes()); // min block
        data.extend_from_slice(&4096u16.to_be_bytes()); // max block
        data.extend_from_slice(&[0, 0, 14]);
        data.extend_from_slice(&[0, 0x3A, 0x00]);
        let packed: u64 = (44_100u64 << 44)
            | (u64::from(channels - 1) << 41)
            | (u64::from(bits - 1) << 36)
            | 1_000_000;
        data.extend_from_slice(&packed.to_be_bytes());
        data.extend_from_slice(&[0u8; 16]);
        data
    }

    fn make_codec(channels: u8, bits: u8, mode: CrcMode) -> FlacCodec {
        let mut info = StreamInfo::audio(0, "flac", 44_100, channels, bits);
        info.codec_private = streaminfo_bytes(channels, bits);
        let mut codec = FlacCodec::new(&info, mode);
        codec.initialize().expect("initialize");
        codec
    }

    fn make_chunk(data: &[u8]) -> MediaChunk {
        let pool = ChunkPool::new(1024 * 1024);
        let mut buf = pool.acquire(data.len()).expect("acquire");
        buf.copy_from(data);
        MediaChunk::new(buf, 0, 0, 0)
    }

    /// A stereo frame of 4 constant samples per channel.
    fn constant_stereo_frame(channel_code: u8, values: [(u32, i32); 2]) -> Vec<u8> {
        // Block size code 0b0110: 8-bit size minus one follows the number.
        let mut frame_bytes = build_header(6, 9, channel_code, 4, 0, &[3]);
        let mut writer = BitWriter::new();
        for &(depth, value) in &values {
            writer.push_bits(0, 1);
            writer.push_bits(0b00_0000, 6); // constant
            writer.push_bits(0, 1);
            writer.push_bits(u64::from(value as u32) & ((1u64 << depth) - 1), depth);
        }
        frame_bytes.extend_from_slice(&writer.finish());
        let crc = crc16(&frame_bytes);
        frame_bytes.extend_from_slice(&crc.to_be_bytes());
        frame_bytes
    }

    #[test]
    fn decodes_independent_stereo() {
        let mut codec = make_codec(2, 16, CrcMode::Strict);
        let frame_bytes = constant_stereo_frame(1, [(16, 1000), (16, -1000)]);
        let chunk = make_chunk(&frame_bytes);

        let mut out = AudioFrame::new();
        codec.decode(&chunk, &mut out).expect("decode");
        assert_eq!(out.sample_rate, 44_100);
        assert_eq!(out.channels, 2);
        assert_eq!(out.sample_frame_count(), 4);
        assert_eq!(&out.pcm[..4], &[1000, -1000, 1000, -1000]);
        assert_eq!(codec.error_count(), 0);
    }

    #[test]
    fn reconstructs_left_side_stereo() {
        let mut codec = make_codec(2, 16, CrcMode::Strict);
        // L = 100, S = L - R = 30, so R must come out as 70. The side
        // subframe is one bit deeper.
        let frame_bytes = constant_stereo_frame(8, [(16, 100), (17, 30)]);
        let chunk = make_chunk(&frame_bytes);

        let mut out = AudioFrame::new();
        codec.decode(&chunk, &mut out).expect("decode");
        assert_eq!(&out.pcm[..2], &[100, 70]);
    }

    #[test]
    fn reconstructs_right_side_stereo() {
        let mut codec = make_codec(2, 16, CrcMode::Strict);
        // S = L - R = 30 with R = 70, so L must come out as S + R = 100.
        // The side subframe leads and is one bit deeper.
        let frame_bytes = constant_stereo_frame(9, [(17, 30), (16, 70)]);
        let chunk = make_chunk(&frame_bytes);

        let mut out = AudioFrame::new();
        codec.decode(&chunk, &mut out).expect("decode");
        assert_eq!(&out.pcm[..2], &[100, 70]);
    }

    #[test]
    fn reconstructs_mid_side_stereo_with_odd_sum() {
        let mut codec = make_codec(2, 16, CrcMode::Strict);
        // L = 1001, R = 500: S = 501, M = (L + R) >> 1 = 750 with the odd
        // bit carried by S.
        let frame_bytes = constant_stereo_frame(10, [(16, 750), (17, 501)]);
        let chunk = make_chunk(&frame_bytes);

        let mut out = AudioFrame::new();
        codec.decode(&chunk, &mut out).expect("decode");
        assert_eq!(&out.pcm[..2], &[1001, 500]);
    }

    #[test]
    fn strict_mode_rejects_corrupt_frames_with_silence() {
        let mut codec = make_codec(2, 16, CrcMode::Strict);
        let mut frame_bytes = constant_stereo_frame(1, [(16, 1000), (16, -1000)]);
        let len = frame_bytes.len();
        frame_bytes[len - 4] ^= 0x10; // payload bit flip

        let chunk = make_chunk(&frame_bytes);
        let mut out = AudioFrame::new();
        codec.decode(&chunk, &mut out).expect("decode");

        // Silence of the nominal block size, and one counted failure.
        assert!(out.pcm.iter().all(|&s| s == 0));
        assert_eq!(out.sample_frame_count(), 4096);
        assert_eq!(codec.error_count(), 1);
    }

    #[test]
    fn recovers_after_consecutive_failures() {
        let mut codec = make_codec(2, 16, CrcMode::Strict);
        let good = constant_stereo_frame(1, [(16, 7), (16, -7)]);
        let mut bad = good.clone();
        let len = bad.len();
        bad[len - 3] ^= 0x01;

        let mut out = AudioFrame::new();
        for _ in 0..4 {
            codec.decode(&make_chunk(&bad), &mut out).expect("decode");
        }
        assert_eq!(codec.error_count(), 4);

        // The auto-reset leaves the codec decodable.
        codec.decode(&make_chunk(&good), &mut out).expect("decode");
        assert_eq!(&out.pcm[..2], &[7, -7]);
    }

    #[test]
    fn enabled_mode_accepts_crc_mismatches() {
        let mut codec = make_codec(2, 16, CrcMode::Enabled);
        let mut frame_bytes = constant_stereo_frame(1, [(16, 42), (16, 43)]);
        let len = frame_bytes.len();
        // Corrupt only the stored CRC, leaving the payload decodable.
        frame_bytes[len - 1] ^= 0xFF;

        let mut out = AudioFrame::new();
        codec.decode(&make_chunk(&frame_bytes), &mut out).expect("decode");
        assert_eq!(&out.pcm[..2], &[42, 43]);
    }

    #[test]
    fn eof_chunk_yields_empty_frame() {
        let mut codec = make_codec(2, 16, CrcMode::Enabled);
        let mut out = AudioFrame::new();
        out.fill_silence(16, 44_100, 2);
        codec
            .decode(&MediaChunk::end_of_stream(0), &mut out)
            .expect("decode");
        assert!(out.is_empty());
    }
}
