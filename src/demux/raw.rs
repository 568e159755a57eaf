//! Headerless PCM demuxer.
//!
//! No container to parse: the caller supplies the [`StreamInfo`] and the
//! byte source is sliced into fixed sample-count chunks. Useful for `.pcm`
//! captures and as the simplest possible pipeline input in tests.

use std::io::{Read, Seek, SeekFrom};

use crate::{
    chunk::MediaChunk,
    demux::{Demuxer, StreamInfo},
    error::{Error, Result},
    pool::ChunkPool,
    source::ByteSource,
};

/// Sample frames per emitted chunk.
const FRAMES_PER_CHUNK: u64 = 4096;

/// Demuxer for raw sample data.
pub struct RawDemuxer {
    source: Box<dyn ByteSource>,
    pool: ChunkPool,
    streams: Vec<StreamInfo>,
    parsed: bool,

    bytes_per_frame: u64,
    total_len: u64,
    pos: u64,
    eof: bool,
    last_error: Option<Error>,
}

impl RawDemuxer {
    /// Creates a raw demuxer; `info` describes the sample layout the
    /// source contains.
    #[must_use]
    pub fn new(source: Box<dyn ByteSource>, pool: ChunkPool, info: StreamInfo) -> Self {
        Self {
            source,
            pool,
            streams: vec![info],
            parsed: false,
            bytes_per_frame: 0,
            total_len: 0,
            pos: 0,
            eof: false,
            last_error: None,
        }
    }

    fn info(&self) -> &StreamInfo {
        &self.streams[0]
    }
}

impl Demuxer for RawDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.parsed {
            return Ok(());
        }
        let info = self.info();
        if !info.is_valid() {
            return Err(Error::format("supplied stream description is not decodable"));
        }

        self.bytes_per_frame =
            u64::from(info.channels) * u64::from(u32::from(info.bits_per_sample).div_ceil(8));
        self.total_len = self.source.byte_len().unwrap_or(0);

        let frames = self.total_len / self.bytes_per_frame.max(1);
        let seekable = self.source.is_seekable();
        let info = &mut self.streams[0];
        info.duration_samples = frames;
        info.is_seekable = seekable;
        self.parsed = true;
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

        let want = (FRAMES_PER_CHUNK * self.bytes_per_frame) as usize;
        let mut buffer = self.pool.acquire(want)?;
        let mut filled = 0;
        while filled < want {
            let n = self.source.read(&mut buffer.as_mut_slice()[filled..want])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }

        // Trim a trailing partial frame rather than emit it.
        let whole = filled - filled % self.bytes_per_frame.max(1) as usize;
        if whole == 0 {
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }
        buffer.set_len(whole);
        let timestamp = self.pos / self.bytes_per_frame.max(1);
        let offset = self.pos;
        self.pos += buffer.len() as u64;
        Ok(MediaChunk::new(buffer, 0, timestamp, offset))
    }

    fn seek_to(&mut self, position_ms: u64) -> Result<()> {
        if !self.parsed {
            return Err(Error::format("container not parsed"));
        }
        let rate = u64::from(self.info().sample_rate);
        let target = position_ms * rate / 1000;
        let total = self.info().duration_samples;
        let clamped = target.min(total);

        self.pos = clamped * self.bytes_per_frame;
        self.source.seek(SeekFrom::Start(self.pos))?;
        self.eof = total > 0 && clamped >= total;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn duration_ms(&self) -> u64 {
        self.info().duration_ms()
    }

    fn position_ms(&self) -> u64 {
        let rate = u64::from(self.info().sample_rate);
        if rate == 0 || self.bytes_per_frame == 0 {
            return 0;
        }
        self.pos / self.bytes_per_frame * 1000 / rate
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
    use super::*;
    use std::io::Cursor;

    #[test]
    fn slices_fixed_chunks() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(40_000).collect();
        let info = StreamInfo::audio(0, "pcm_s16le", 44_100, 2, 16);
        let mut demuxer = RawDemuxer::new(
            Box::new(Cursor::new(bytes)),
            ChunkPool::new(8 * 1024 * 1024),
            info,
        );
        demuxer.parse_container().expect("parse");
        assert_eq!(demuxer.streams()[0].duration_samples, 10_000);

        let first = demuxer.read_chunk(None).expect("read");
        assert_eq!(first.len(), 4096 * 4);
        assert_eq!(first.timestamp_samples, 0);

        let second = demuxer.read_chunk(None).expect("read");
        assert_eq!(second.timestamp_samples, 4096);

        let mut total = first.len() + second.len();
        loop {
            let chunk = demuxer.read_chunk(None).expect("read");
            if chunk.end_of_stream {
                break;
            }
            total += chunk.len();
        }
        assert_eq!(total, 40_000);
    }

    #[test]
    fn rejects_invalid_description() {
        let info = StreamInfo::audio(0, "pcm_s16le", 0, 2, 16);
        let mut demuxer = RawDemuxer::new(
            Box::new(Cursor::new(vec![0u8; 64])),
            ChunkPool::new(1024 * 1024),
            info,
        );
        assert!(demuxer.parse_container().is_err());
    }

    #[test]
    fn seek_repositions_exactly() {
        let bytes = vec![0u8; 8000];
        let info = StreamInfo::audio(0, "pcm_s16le", 1000, 1, 16);
        let mut demuxer = RawDemuxer::new(
            Box::new(Cursor::new(bytes)),
            ChunkPool::new(1024 * 1024),
            info,
        );
        demuxer.parse_container().expect("parse");

        demuxer.seek_to(1500).expect("seek");
        let chunk = demuxer.read_chunk(None).expect("read");
        assert_eq!(chunk.timestamp_samples, 1500);
        assert_eq!(demuxer.position_ms(), 4000);
    }
}
