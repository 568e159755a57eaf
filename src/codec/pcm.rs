//! PCM and G.711 byte-to-sample transcoding.
//!
//! Handles the uncompressed layouts the containers produce: unsigned and
//! signed 8-bit, 16/24/32-bit in either endianness, and the μ-law and
//! A-law companded forms with their expansion tables built once at
//! initialise.

use crate::{
    chunk::MediaChunk,
    codec::{sample_to_i16, AudioFrame, Codec, TriangularDither},
    demux::StreamInfo,
    error::{Error, Result},
};

/// Codec names this module registers under.
pub const CODEC_NAMES: &[&str] = &[
    "pcm_u8",
    "pcm_s8",
    "pcm_s16le",
    "pcm_s16be",
    "pcm_s24le",
    "pcm_s24be",
    "pcm_s32le",
    "pcm_s32be",
    "pcm_mulaw",
    "pcm_alaw",
];

/// Upper bound on sample frames per chunk used for output reservation;
/// the demuxers slice uncompressed data well below this.
const MAX_FRAMES_PER_CHUNK: usize = 8192;

/// Sample storage layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Layout {
    U8,
    S8,
    S16Le,
    S16Be,
    S24Le,
    S24Be,
    S32Le,
    S32Be,
    Mulaw,
    Alaw,
}

impl Layout {
    fn from_codec_name(name: &str) -> Option<Self> {
        Some(match name {
            "pcm_u8" => Self::U8,
            "pcm_s8" => Self::S8,
            "pcm_s16le" => Self::S16Le,
            "pcm_s16be" => Self::S16Be,
            "pcm_s24le" => Self::S24Le,
            "pcm_s24be" => Self::S24Be,
            "pcm_s32le" => Self::S32Le,
            "pcm_s32be" => Self::S32Be,
            "pcm_mulaw" => Self::Mulaw,
            "pcm_alaw" => Self::Alaw,
            _ => return None,
        })
    }

    fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 | Self::S8 | Self::Mulaw | Self::Alaw => 1,
            Self::S16Le | Self::S16Be => 2,
            Self::S24Le | Self::S24Be => 3,
            Self::S32Le | Self::S32Be => 4,
        }
    }
}

/// Expands one μ-law byte (G.711).
fn mulaw_to_linear(byte: u8) -> i16 {
    const BIAS: i32 = 0x84;
    let complement = !byte;
    let exponent = (complement >> 4) & 0x07;
    let mantissa = complement & 0x0F;
    let magnitude = ((i32::from(mantissa) << 3) + BIAS) << exponent;
    if complement & 0x80 != 0 {
        (BIAS - magnitude) as i16
    } else {
        (magnitude - BIAS) as i16
    }
}

/// Expands one A-law byte (G.711).
fn alaw_to_linear(byte: u8) -> i16 {
    let toggled = byte ^ 0x55;
    let segment = (toggled >> 4) & 0x07;
    let mut magnitude = i32::from(toggled & 0x0F) << 4;
    match segment {
        0 => magnitude += 8,
        1 => magnitude += 0x108,
        _ => {
            magnitude += 0x108;
            magnitude <<= segment - 1;
        }
    }
    if toggled & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Uncompressed audio transcoder.
pub struct PcmCodec {
    codec_name: String,
    sample_rate: u32,
    channels: u8,
    layout: Option<Layout>,

    /// Expansion table for the companded layouts, built at initialise.
    table: Vec<i16>,

    dither: TriangularDither,
}

impl PcmCodec {
    #[must_use]
    pub fn new(info: &StreamInfo) -> Self {
        Self {
            codec_name: info.codec_name.clone(),
            sample_rate: info.sample_rate,
            channels: info.channels,
            layout: None,
            table: Vec::new(),
            dither: TriangularDither::new(),
        }
    }

    fn layout(&self) -> Result<Layout> {
        self.layout
            .ok_or_else(|| Error::exception("PCM codec driven before initialize"))
    }
}

impl Codec for PcmCodec {
    fn initialize(&mut self) -> Result<()> {
        let layout = Layout::from_codec_name(&self.codec_name).ok_or_else(|| {
            Error::format(format!("unsupported PCM layout {:?}", self.codec_name))
        })?;

        match layout {
            Layout::Mulaw => self.table = (0..=255u8).map(mulaw_to_linear).collect(),
            Layout::Alaw => self.table = (0..=255u8).map(alaw_to_linear).collect(),
            _ => {}
        }

        self.layout = Some(layout);
        Ok(())
    }

    fn decode(&mut self, chunk: &MediaChunk, frame: &mut AudioFrame) -> Result<()> {
        let layout = self.layout()?;
        frame.pcm.clear();
        frame.sample_rate = self.sample_rate;
        frame.channels = self.channels;
        if chunk.end_of_stream {
            return Ok(());
        }

        let data = chunk.data();
        let stride = layout.bytes_per_sample();
        let whole = data.len() - data.len() % stride;
        if whole != data.len() {
            warn!(
                "dropping {} trailing bytes of a partial sample at byte {}",
                data.len() - whole,
                chunk.file_offset
            );
        }

        for sample in data[..whole].chunks_exact(stride) {
            let value = match layout {
                Layout::U8 => {
                    frame.pcm.push(((i32::from(sample[0]) - 128) << 8) as i16);
                    continue;
                }
                Layout::S8 => {
                    frame.pcm.push(i16::from(sample[0] as i8) << 8);
                    continue;
                }
                Layout::Mulaw | Layout::Alaw => {
                    frame.pcm.push(self.table[usize::from(sample[0])]);
                    continue;
                }
                Layout::S16Le => {
                    frame.pcm.push(i16::from_le_bytes([sample[0], sample[1]]));
                    continue;
                }
                Layout::S16Be => {
                    frame.pcm.push(i16::from_be_bytes([sample[0], sample[1]]));
                    continue;
                }
                Layout::S24Le => {
                    (i32::from_le_bytes([0, sample[0], sample[1], sample[2]])) >> 8
                }
                Layout::S24Be => {
                    (i32::from_be_bytes([sample[0], sample[1], sample[2], 0])) >> 8
                }
                Layout::S32Le => i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]),
                Layout::S32Be => i32::from_be_bytes([sample[0], sample[1], sample[2], sample[3]]),
            };
            let bits = if stride == 3 { 24 } else { 32 };
            frame.pcm.push(sample_to_i16(value, bits, &mut self.dither));
        }

        Ok(())
    }

    fn reset(&mut self) {
        // Stateless between chunks.
    }

    fn codec_name(&self) -> &'static str {
        "pcm"
    }

    fn can_decode(&self, codec_name: &str) -> bool {
        CODEC_NAMES.contains(&codec_name)
    }

    fn max_samples_per_frame(&self) -> usize {
        MAX_FRAMES_PER_CHUNK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ChunkPool;

    fn make_codec(name: &str) -> PcmCodec {
        let info = StreamInfo::audio(0, name, 8_000, 1, 16);
        let mut codec = PcmCodec::new(&info);
        codec.initialize().expect("initialize");
        codec
    }

    fn decode_bytes(codec: &mut PcmCodec, bytes: &[u8]) -> Vec<i16> {
        let pool = ChunkPool::new(1024 * 1024);
        let mut buf = pool.acquire(bytes.len().max(1)).expect("acquire");
        buf.copy_from(bytes);
        let chunk = MediaChunk::new(buf, 0, 0, 0);
        let mut frame = AudioFrame::new();
        codec.decode(&chunk, &mut frame).expect("decode");
        frame.pcm
    }

    #[test]
    fn mulaw_expansion_matches_reference_points() {
        assert_eq!(mulaw_to_linear(0x00), -32_124);
        assert_eq!(mulaw_to_linear(0x80), 32_124);
        assert_eq!(mulaw_to_linear(0xFF), 0);
    }

    #[test]
    fn alaw_expansion_matches_reference_points() {
        assert_eq!(alaw_to_linear(0x55), -8);
        assert_eq!(alaw_to_linear(0xD5), 8);
        assert_eq!(alaw_to_linear(0x00), -5504);
        assert_eq!(alaw_to_linear(0x80), 5504);
    }

    #[test]
    fn g711_tables_are_symmetric() {
        let mut mulaw = make_codec("pcm_mulaw");
        for byte in 0..=127u8 {
            let negative = decode_bytes(&mut mulaw, &[byte])[0];
            let positive = decode_bytes(&mut mulaw, &[byte | 0x80])[0];
            assert_eq!(i32::from(negative), -i32::from(positive), "byte {byte:#04x}");
        }
    }

    #[test]
    fn unsigned_eight_bit_centers_on_zero() {
        let mut codec = make_codec("pcm_u8");
        assert_eq!(decode_bytes(&mut codec, &[0x80]), vec![0]);
        assert_eq!(decode_bytes(&mut codec, &[0x00]), vec![-32_768]);
        assert_eq!(decode_bytes(&mut codec, &[0xFF]), vec![127 << 8]);
    }

    #[test]
    fn sixteen_bit_little_endian_passthrough() {
        let mut codec = make_codec("pcm_s16le");
        let bytes = [0x34, 0x12, 0xCC, 0xFF];
        assert_eq!(decode_bytes(&mut codec, &bytes), vec![0x1234, -52]);
    }

    #[test]
    fn twenty_four_bit_reduces_within_one_step() {
        let mut codec = make_codec("pcm_s24le");
        // 0x123456 as little-endian bytes.
        let out = decode_bytes(&mut codec, &[0x56, 0x34, 0x12]);
        let ideal = 0x12_3456 >> 8;
        assert!((i32::from(out[0]) - ideal).abs() <= 1);
    }

    #[test]
    fn partial_trailing_sample_is_dropped() {
        let mut codec = make_codec("pcm_s16le");
        let out = decode_bytes(&mut codec, &[0x00, 0x01, 0x02]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn unknown_layout_fails_initialize() {
        let info = StreamInfo::audio(0, "pcm_f32le", 44_100, 2, 32);
        let mut codec = PcmCodec::new(&info);
        assert!(codec.initialize().is_err());
    }
}
