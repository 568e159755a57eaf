//! RIFF/WAV demuxer.
//!
//! Parses the `RIFF…WAVE` chunk list, fills [`StreamInfo`] from `fmt `,
//! reads artist/title metadata from a `LIST INFO` chunk when present, and
//! exposes the `data` chunk as fixed-size slices. Byte to sample
//! conversion is exact, which makes seeking sample-accurate.

use std::io::{Read, Seek, SeekFrom};

use crate::{
    chunk::MediaChunk,
    demux::{Demuxer, StreamInfo, Tags},
    error::{Error, Result},
    pool::ChunkPool,
    source::ByteSource,
};

/// Sample frames per emitted chunk.
const FRAMES_PER_CHUNK: u64 = 4096;

/// WAVE format tags understood by this demuxer.
const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_ALAW: u16 = 0x0006;
const WAVE_FORMAT_MULAW: u16 = 0x0007;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// RIFF/WAVE container demuxer.
pub struct WavDemuxer {
    source: Box<dyn ByteSource>,
    pool: ChunkPool,

    streams: Vec<StreamInfo>,
    parsed: bool,

    /// Absolute offset and byte length of the `data` chunk.
    data_start: u64,
    data_len: u64,

    /// Bytes per interleaved sample frame.
    block_align: u64,

    /// Read position relative to `data_start`.
    pos: u64,

    eof: bool,
    last_error: Option<Error>,
}

impl WavDemuxer {
    #[must_use]
    pub fn new(source: Box<dyn ByteSource>, pool: ChunkPool) -> Self {
        Self {
            source,
            pool,
            streams: Vec::new(),
            parsed: false,
            data_start: 0,
            data_len: 0,
            block_align: 0,
            pos: 0,
            eof: false,
            last_error: None,
        }
    }

    fn info(&self) -> Option<&StreamInfo> {
        self.streams.first()
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.source.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.source.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::io("unexpected end of file").at_offset(offset + filled as u64));
            }
            filled += n;
        }
        Ok(())
    }

    /// Parses the `fmt ` chunk body into a stream description.
    fn parse_fmt(body: &[u8]) -> Result<StreamInfo> {
        if body.len() < 16 {
            return Err(Error::format("fmt chunk too short"));
        }
        let mut format_tag = u16::from_le_bytes([body[0], body[1]]);
        let channels = u16::from_le_bytes([body[2], body[3]]);
        let sample_rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        let byte_rate = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
        let block_align = u16::from_le_bytes([body[12], body[13]]);
        let bits_per_sample = u16::from_le_bytes([body[14], body[15]]);

        if format_tag == WAVE_FORMAT_EXTENSIBLE {
            // The real format tag leads the SubFormat GUID.
            if body.len() < 40 {
                return Err(Error::format("extensible fmt chunk too short"));
            }
            format_tag = u16::from_le_bytes([body[24], body[25]]);
        }

        let codec_name = match (format_tag, bits_per_sample) {
            (WAVE_FORMAT_PCM, 8) => "pcm_u8",
            (WAVE_FORMAT_PCM, 16) => "pcm_s16le",
            (WAVE_FORMAT_PCM, 24) => "pcm_s24le",
            (WAVE_FORMAT_PCM, 32) => "pcm_s32le",
            (WAVE_FORMAT_ALAW, _) => "pcm_alaw",
            (WAVE_FORMAT_MULAW, _) => "pcm_mulaw",
            (WAVE_FORMAT_IEEE_FLOAT, _) => {
                return Err(Error::format("IEEE float WAVE data is not supported"))
            }
            _ => {
                return Err(Error::format(format!(
                    "unsupported WAVE format tag {format_tag:#06x} at {bits_per_sample} bits"
                )))
            }
        };

        let channels = u8::try_from(channels)
            .ok()
            .filter(|c| (1..=8).contains(c))
            .ok_or_else(|| Error::format(format!("implausible channel count {channels}")))?;

        let mut info = StreamInfo::audio(
            0,
            codec_name,
            sample_rate,
            channels,
            if matches!(format_tag, WAVE_FORMAT_ALAW | WAVE_FORMAT_MULAW) {
                16
            } else {
                bits_per_sample.min(32) as u8
            },
        );
        info.codec_tag = u32::from(format_tag);
        info.bitrate = byte_rate.saturating_mul(8);
        info.is_seekable = true;
        if !info.is_valid() {
            return Err(Error::format("fmt chunk carries impossible parameters"));
        }
        // Cross-check; some writers leave block_align zero.
        if block_align != 0
            && u64::from(block_align)
                != u64::from(channels) * u64::from(bits_per_sample.div_ceil(8).max(1))
        {
            debug!("fmt block alignment {block_align} disagrees with computed frame size");
        }
        Ok(info)
    }

    /// Parses a `LIST INFO` chunk body into tags.
    fn parse_list_info(body: &[u8], tags: &mut Tags) {
        if body.len() < 4 || &body[..4] != b"INFO" {
            return;
        }
        let mut rest = &body[4..];
        while rest.len() >= 8 {
            let id = &rest[..4];
            let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
            rest = &rest[8..];
            if len > rest.len() {
                break;
            }
            let text = String::from_utf8_lossy(&rest[..len])
                .trim_end_matches('\0')
                .to_string();
            match id {
                b"IART" => tags.artist = Some(text),
                b"INAM" => tags.title = Some(text),
                b"IPRD" => tags.album = Some(text),
                b"ICMT" => tags.comment = Some(text),
                _ => {}
            }
            // Chunk bodies are word-aligned.
            let advance = len + (len & 1);
            rest = rest.get(advance..).unwrap_or(&[]);
        }
    }

    fn bytes_per_frame(&self) -> u64 {
        self.block_align.max(1)
    }

    fn total_frames(&self) -> u64 {
        self.data_len / self.bytes_per_frame()
    }
}

impl Demuxer for WavDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.parsed {
            return Ok(());
        }

        let mut riff = [0u8; 12];
        self.read_exact_at(0, &mut riff)?;
        if &riff[..4] != b"RIFF" || &riff[8..] != b"WAVE" {
            return Err(Error::format("not a RIFF/WAVE stream"));
        }

        let mut info: Option<StreamInfo> = None;
        let mut tags = Tags::default();
        let mut offset: u64 = 12;
        let source_len = self.source.byte_len();

        loop {
            let mut header = [0u8; 8];
            if let Err(e) = self.read_exact_at(offset, &mut header) {
                // A clean end of the chunk list is fine once data was seen.
                if self.data_len > 0 {
                    trace!("chunk walk stopped at byte {offset}: {e}");
                    break;
                }
                return Err(e);
            }
            let id = [header[0], header[1], header[2], header[3]];
            let len = u64::from(u32::from_le_bytes([header[4], header[5], header[6], header[7]]));
            let body_start = offset + 8;

            match &id {
                b"fmt " => {
                    let mut body = vec![0u8; len.min(1024) as usize];
                    self.read_exact_at(body_start, &mut body)?;
                    info = Some(Self::parse_fmt(&body)?);
                }
                b"LIST" => {
                    let mut body = vec![0u8; len.min(64 * 1024) as usize];
                    self.read_exact_at(body_start, &mut body)?;
                    Self::parse_list_info(&body, &mut tags);
                }
                b"data" => {
                    self.data_start = body_start;
                    // Streaming writers leave the length at u32::MAX; fall
                    // back to the source size.
                    self.data_len = if len == u64::from(u32::MAX) {
                        source_len.map_or(0, |total| total.saturating_sub(body_start))
                    } else {
                        len
                    };
                }
                _ => trace!("skipping chunk {:?} of {len} bytes", String::from_utf8_lossy(&id)),
            }

            offset = body_start + len + (len & 1);
            if let Some(total) = source_len {
                if offset >= total {
                    break;
                }
            }
            if info.is_some() && self.data_len > 0 && source_len.is_none() {
                break;
            }
        }

        let mut info = info.ok_or_else(|| Error::format("missing fmt chunk"))?;
        if self.data_len == 0 {
            return Err(Error::format("missing data chunk"));
        }

        self.block_align =
            u64::from(info.channels) * u64::from(u32::from(info.bits_per_sample).div_ceil(8));
        if info.codec_tag == u32::from(WAVE_FORMAT_ALAW)
            || info.codec_tag == u32::from(WAVE_FORMAT_MULAW)
        {
            // Companded samples are one byte on the wire.
            self.block_align = u64::from(info.channels);
        }

        info.duration_samples = self.data_len / self.bytes_per_frame();
        info.tags = tags;
        info.is_seekable = self.source.is_seekable();
        self.streams = vec![info];
        self.parsed = true;

        let info = &self.streams[0];
        debug!(
            "WAVE parsed: {} Hz, {} ch, {} ({} samples)",
            info.sample_rate,
            info.channels,
            info.codec_name,
            info.duration_samples
        );
        Ok(())
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_chunk(&mut self, _stream_id: Option<u32>) -> Result<MediaChunk> {
        if !self.parsed {
            return Err(Error::format("container not parsed"));
        }
        if self.last_error.is_some() || self.eof {
            return Ok(MediaChunk::end_of_stream(0));
        }

        let bytes_per_frame = self.bytes_per_frame();
        let remaining = self.data_len.saturating_sub(self.pos);
        let len = remaining.min(FRAMES_PER_CHUNK * bytes_per_frame);
        if len == 0 {
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }

        let mut buffer = self.pool.acquire(len as usize)?;
        let offset = self.data_start + self.pos;
        match self.read_exact_at(offset, &mut buffer.as_mut_slice()[..len as usize]) {
            Ok(()) => buffer.set_len(len as usize),
            Err(e) => {
                // A short data chunk is the end of the stream, not a fault.
                warn!("WAVE data ended early: {e}");
                self.eof = true;
                return Ok(MediaChunk::end_of_stream(0));
            }
        }

        let timestamp = self.pos / bytes_per_frame;
        self.pos += len;
        if self.pos >= self.data_len {
            self.eof = true;
        }
        Ok(MediaChunk::new(buffer, 0, timestamp, offset))
    }

    fn seek_to(&mut self, position_ms: u64) -> Result<()> {
        if !self.parsed {
            return Err(Error::format("container not parsed"));
        }
        let Some(info) = self.info() else {
            return Err(Error::format("no stream"));
        };

        let target = position_ms * u64::from(info.sample_rate) / 1000;
        let total = self.total_frames();
        let clamped = target.min(total);
        self.pos = clamped * self.bytes_per_frame();
        self.eof = clamped >= total;
        trace!("WAVE seek to sample {clamped} (requested {target})");
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn duration_ms(&self) -> u64 {
        self.info().map_or(0, StreamInfo::duration_ms)
    }

    fn position_ms(&self) -> u64 {
        self.info().map_or(0, |info| {
            if info.sample_rate == 0 {
                return 0;
            }
            (self.pos / self.bytes_per_frame()) * 1000 / u64::from(info.sample_rate)
        })
    }

    fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn clear_error(&mut self) {
        self.last_error = None;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::build_wav;
    use super::*;
    use std::io::Cursor;

    fn demuxer_over(bytes: Vec<u8>) -> WavDemuxer {
        WavDemuxer::new(Box::new(Cursor::new(bytes)), ChunkPool::new(8 * 1024 * 1024))
    }

    #[test]
    fn parses_canonical_wav() {
        let samples: Vec<i16> = (0..20_000).map(|i| (i % 251) as i16).collect();
        let mut demuxer = demuxer_over(build_wav(44_100, 2, &samples));
        demuxer.parse_container().expect("parse");

        let info = &demuxer.streams()[0];
        assert_eq!(info.codec_name, "pcm_s16le");
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.duration_samples, 10_000);
        assert_eq!(demuxer.duration_ms(), 226);
    }

    #[test]
    fn chunks_cover_data_exactly() {
        let samples: Vec<i16> = (0..20_000).map(|i| i as i16).collect();
        let mut demuxer = demuxer_over(build_wav(44_100, 2, &samples));
        demuxer.parse_container().expect("parse");

        let mut total_bytes = 0u64;
        let mut last_timestamp = 0;
        let mut last_len = 0;
        loop {
            let chunk = demuxer.read_chunk(None).expect("read");
            if chunk.end_of_stream {
                break;
            }
            assert!(chunk.is_keyframe);
            assert!(chunk.timestamp_samples >= last_timestamp);
            last_timestamp = chunk.timestamp_samples;
            last_len = chunk.len() as u64 / 4;
            total_bytes += chunk.len() as u64;
        }
        assert_eq!(total_bytes, 40_000);
        assert_eq!(last_timestamp + last_len, 10_000);
        assert!(demuxer.is_eof());
    }

    #[test]
    fn seek_is_sample_accurate() {
        let samples: Vec<i16> = (0..20_000).map(|i| i as i16).collect();
        let mut demuxer = demuxer_over(build_wav(44_100, 2, &samples));
        demuxer.parse_container().expect("parse");

        // 100 ms at 44.1 kHz is sample 4410.
        demuxer.seek_to(100).expect("seek");
        let chunk = demuxer.read_chunk(None).expect("read");
        assert_eq!(chunk.timestamp_samples, 4410);
        // The payload picks up at exactly that frame.
        let first = i16::from_le_bytes([chunk.data()[0], chunk.data()[1]]);
        assert_eq!(first, (4410 * 2) as i16);
    }

    #[test]
    fn seek_past_end_goes_eof() {
        let samples: Vec<i16> = vec![0; 2000];
        let mut demuxer = demuxer_over(build_wav(8_000, 1, &samples));
        demuxer.parse_container().expect("parse");

        demuxer.seek_to(10_000).expect("seek");
        assert!(demuxer.is_eof());
        assert!(demuxer.read_chunk(None).expect("read").end_of_stream);

        // Seeking back clears the condition.
        demuxer.seek_to(0).expect("seek");
        assert!(!demuxer.is_eof());
        assert!(!demuxer.read_chunk(None).expect("read").end_of_stream);
    }

    #[test]
    fn rejects_float_wav() {
        let mut bytes = build_wav(44_100, 2, &[0; 16]);
        // Patch the format tag to IEEE float.
        bytes[20] = 0x03;
        let mut demuxer = demuxer_over(bytes);
        assert!(demuxer.parse_container().is_err());
    }

    #[test]
    fn list_info_tags_are_read() {
        let mut bytes = build_wav(8_000, 1, &[0; 4]);
        let mut list = Vec::new();
        list.extend_from_slice(b"LIST");
        let body = {
            let mut b = Vec::new();
            b.extend_from_slice(b"INFO");
            b.extend_from_slice(b"IART");
            b.extend_from_slice(&6u32.to_le_bytes());
            b.extend_from_slice(b"artist");
            b.extend_from_slice(b"INAM");
            b.extend_from_slice(&5u32.to_le_bytes());
            b.extend_from_slice(b"title");
            b.push(0); // word alignment
            b
        };
        list.extend_from_slice(&(body.len() as u32).to_le_bytes());
        list.extend_from_slice(&body);
        bytes.extend_from_slice(&list);
        // Grow the RIFF size so the walker visits the appended chunk.
        let riff_len = (bytes.len() - 8) as u32;
        bytes[4..8].copy_from_slice(&riff_len.to_le_bytes());

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");
        let tags = &demuxer.streams()[0].tags;
        assert_eq!(tags.artist.as_deref(), Some("artist"));
        assert_eq!(tags.title.as_deref(), Some("title"));
    }
}
