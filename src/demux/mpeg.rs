//! MPEG audio elementary-stream demuxer.
//!
//! Bare `.mp3` files have no container: the stream is a run of MPEG-1/2/2.5
//! Layer III frames, possibly wrapped in ID3v2 (head) and ID3v1 (tail)
//! tags. The demuxer syncs on frame headers, emits one frame per chunk,
//! estimates duration from the first frame's bitrate, and seeks by byte
//! proportion re-synced to the next frame boundary.

use std::io::{Read, Seek, SeekFrom};

use crate::{
    chunk::MediaChunk,
    demux::{Demuxer, StreamInfo, Tags},
    error::{Error, Recovery, Result},
    pool::ChunkPool,
    source::ByteSource,
};

/// Bytes scanned for a frame header before giving up.
const RESYNC_WINDOW: usize = 64 * 1024;

/// Re-sync failures tolerated before the stream is declared fatal.
const MAX_RESYNC_ERRORS: u32 = 64;

/// Layer III bitrates in kbit/s, indexed by the header's bitrate field.
const BITRATES_V1: [u32; 16] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0];
const BITRATES_V2: [u32; 16] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0];

/// Sample rates in Hz, indexed by version then the header's rate field.
const SAMPLE_RATES: [[u32; 3]; 3] = [
    [44_100, 48_000, 32_000], // MPEG-1
    [22_050, 24_000, 16_000], // MPEG-2
    [11_025, 12_000, 8_000],  // MPEG-2.5
];

/// A parsed Layer III frame header.
#[derive(Clone, Copy, Debug)]
struct MpegHeader {
    sample_rate: u32,
    bitrate_kbps: u32,
    channels: u8,
    samples_per_frame: u32,
    frame_len: usize,
}

impl MpegHeader {
    /// Parses a 4-byte frame header; `None` when the bytes are not a
    /// decodable Layer III header.
    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
            return None;
        }
        let version = (bytes[1] >> 3) & 0x03;
        let layer = (bytes[1] >> 1) & 0x03;
        if version == 1 || layer != 0b01 {
            // Reserved version, or not Layer III.
            return None;
        }
        let (rate_row, bitrates, samples_per_frame) = match version {
            0b11 => (0, &BITRATES_V1, 1152),
            0b10 => (1, &BITRATES_V2, 576),
            _ => (2, &BITRATES_V2, 576),
        };

        let bitrate_index = usize::from(bytes[2] >> 4);
        let rate_index = usize::from((bytes[2] >> 2) & 0x03);
        if rate_index == 3 {
            return None;
        }
        let bitrate_kbps = bitrates[bitrate_index];
        if bitrate_kbps == 0 {
            // Free-format and invalid bitrates are not supported.
            return None;
        }
        let sample_rate = SAMPLE_RATES[rate_row][rate_index];
        let padding = usize::from((bytes[2] >> 1) & 0x01);
        let channels = if (bytes[3] >> 6) & 0x03 == 0b11 { 1 } else { 2 };

        let frame_len =
            (samples_per_frame as usize / 8) * (bitrate_kbps as usize) * 1000 / sample_rate as usize
                + padding;
        Some(Self {
            sample_rate,
            bitrate_kbps,
            channels,
            samples_per_frame,
            frame_len,
        })
    }
}

/// MPEG audio demuxer.
pub struct MpegDemuxer {
    source: Box<dyn ByteSource>,
    pool: ChunkPool,
    streams: Vec<StreamInfo>,
    parsed: bool,

    /// First byte of audio, past any ID3v2 tag.
    audio_start: u64,

    /// First byte past the audio (before an ID3v1 tail tag).
    audio_end: u64,

    pos: u64,
    next_sample: u64,
    eof: bool,
    resync_errors: u32,
    last_error: Option<Error>,
}

impl MpegDemuxer {
    #[must_use]
    pub fn new(source: Box<dyn ByteSource>, pool: ChunkPool) -> Self {
        Self {
            source,
            pool,
            streams: Vec::new(),
            parsed: false,
            audio_start: 0,
            audio_end: 0,
            pos: 0,
            next_sample: 0,
            eof: false,
            resync_errors: 0,
            last_error: None,
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.source.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.source.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Finds the next verified frame header at or after `from`.
    ///
    /// A candidate is accepted when a second header parses right after the
    /// frame it describes, or when the frame reaches the end of the
    /// stream.
    fn sync_from(&mut self, from: u64) -> Result<Option<(u64, MpegHeader)>> {
        let mut window = vec![0u8; RESYNC_WINDOW];
        let got = self.read_at(from, &mut window)?;
        window.truncate(got);

        let mut at = 0usize;
        while at + 4 <= window.len() {
            if let Some(header) = MpegHeader::parse(&window[at..]) {
                let next = at + header.frame_len;
                let confirmed = match window.get(next..next + 4) {
                    Some(peek) => MpegHeader::parse(peek).is_some(),
                    // The candidate frame runs past the window; accept it
                    // if it plausibly ends at or before the stream end.
                    None => from + next as u64 >= self.audio_end.min(from + got as u64),
                };
                if confirmed {
                    return Ok(Some((from + at as u64, header)));
                }
            }
            at += 1;
        }
        Ok(None)
    }

    /// Reads an ID3v1 tail tag into `tags`, returning its length.
    fn read_id3v1(&mut self, source_len: u64, tags: &mut Tags) -> u64 {
        if source_len < 128 || !self.source.is_seekable() {
            return 0;
        }
        let mut tail = [0u8; 128];
        match self.read_at(source_len - 128, &mut tail) {
            Ok(128) if &tail[..3] == b"TAG" => {}
            _ => return 0,
        }

        let field = |bytes: &[u8]| {
            let text = String::from_utf8_lossy(bytes)
                .trim_end_matches(['\0', ' '])
                .to_string();
            (!text.is_empty()).then_some(text)
        };
        tags.title = field(&tail[3..33]);
        tags.artist = field(&tail[33..63]);
        tags.album = field(&tail[63..93]);
        tags.comment = field(&tail[97..127]);
        128
    }

    fn sample_rate(&self) -> u64 {
        self.streams.first().map_or(44_100, |s| u64::from(s.sample_rate))
    }
}

impl Demuxer for MpegDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.parsed {
            return Ok(());
        }

        // Skip an ID3v2 tag: 10-byte header with a syncsafe length.
        let mut head = [0u8; 10];
        let got = self.read_at(0, &mut head)?;
        let mut audio_start = 0u64;
        if got == 10 && &head[..3] == b"ID3" {
            let size = head[6..10]
                .iter()
                .fold(0u64, |acc, &b| (acc << 7) | u64::from(b & 0x7F));
            let footer = if head[5] & 0x10 != 0 { 10 } else { 0 };
            audio_start = 10 + size + footer;
            trace!("skipping {audio_start} bytes of ID3v2");
        }

        let source_len = self.source.byte_len().unwrap_or(u64::MAX);
        self.audio_end = source_len;

        let Some((first_offset, header)) = self.sync_from(audio_start)? else {
            return Err(Error::format("no MPEG audio frames found"));
        };
        self.audio_start = first_offset;
        self.pos = first_offset;

        let mut tags = Tags::default();
        let id3v1 = if source_len == u64::MAX {
            0
        } else {
            self.read_id3v1(source_len, &mut tags)
        };
        self.audio_end = source_len.saturating_sub(id3v1);

        let mut info = StreamInfo::audio(0, "mp3", header.sample_rate, header.channels, 16);
        info.bitrate = header.bitrate_kbps * 1000;
        info.is_seekable = self.source.is_seekable() && source_len != u64::MAX;
        info.tags = tags;
        if self.audio_end != u64::MAX && self.audio_end > self.audio_start {
            // Constant-bitrate estimate from the first frame.
            let audio_bytes = self.audio_end - self.audio_start;
            let frames = audio_bytes / header.frame_len as u64;
            info.duration_samples = frames * u64::from(header.samples_per_frame);
        }
        debug!(
            "MPEG audio: {} Hz, {} ch, {} kbit/s, about {} samples",
            info.sample_rate, info.channels, header.bitrate_kbps, info.duration_samples
        );
        self.streams = vec![info];
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
        if self.pos + 4 > self.audio_end {
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }

        let mut header_bytes = [0u8; 4];
        let got = self.read_at(self.pos, &mut header_bytes)?;
        let header = match MpegHeader::parse(&header_bytes[..got]) {
            Some(header) => header,
            None => {
                // Lost sync: scan forward within the bounded window.
                self.resync_errors += 1;
                if self.resync_errors > MAX_RESYNC_ERRORS {
                    let err = Error::format("too many MPEG sync losses")
                        .with_recovery(Recovery::None)
                        .at_offset(self.pos);
                    self.last_error = Some(err);
                    return Ok(MediaChunk::end_of_stream(0));
                }
                warn!("MPEG sync lost at byte {}; scanning forward", self.pos);
                match self.sync_from(self.pos + 1)? {
                    Some((offset, header)) if offset < self.audio_end => {
                        self.pos = offset;
                        header
                    }
                    _ => {
                        self.eof = true;
                        return Ok(MediaChunk::end_of_stream(0));
                    }
                }
            }
        };

        let frame_len = (header.frame_len as u64).min(self.audio_end - self.pos) as usize;
        let mut buffer = self.pool.acquire(frame_len)?;
        let got = self.read_at(self.pos, &mut buffer.as_mut_slice()[..frame_len])?;
        if got == 0 {
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }
        buffer.set_len(got);

        let chunk = MediaChunk::new(buffer, 0, self.next_sample, self.pos);
        self.pos += got as u64;
        self.next_sample += u64::from(header.samples_per_frame);
        self.resync_errors = 0;
        Ok(chunk)
    }

    fn seek_to(&mut self, position_ms: u64) -> Result<()> {
        if !self.parsed {
            return Err(Error::format("container not parsed"));
        }
        let duration = self.duration_ms();
        if duration == 0 {
            return Err(Error::format("stream duration unknown, cannot seek")
                .with_recovery(Recovery::None));
        }

        let clamped_ms = position_ms.min(duration);
        let audio_bytes = self.audio_end - self.audio_start;
        let byte = self.audio_start + audio_bytes * clamped_ms / duration;

        match self.sync_from(byte)? {
            Some((offset, header)) if offset < self.audio_end => {
                self.pos = offset;
                // Timestamps restart on the frame grid nearest the target.
                let target_sample = clamped_ms * self.sample_rate() / 1000;
                let spf = u64::from(header.samples_per_frame);
                self.next_sample = target_sample / spf * spf;
                self.eof = false;
            }
            _ => {
                self.pos = self.audio_end;
                self.eof = true;
            }
        }
        if position_ms >= duration {
            self.eof = true;
        }
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn duration_ms(&self) -> u64 {
        self.streams.first().map_or(0, StreamInfo::duration_ms)
    }

    fn position_ms(&self) -> u64 {
        self.next_sample * 1000 / self.sample_rate()
    }

    fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn clear_error(&mut self) {
        self.last_error = None;
        self.resync_errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// One MPEG-1 Layer III header: 44.1 kHz, 32 kbit/s, stereo, no
    /// padding. 104 bytes per frame.
    const FRAME_HEADER: [u8; 4] = [0xFF, 0xFB, 0x10, 0x00];
    const FRAME_LEN: usize = 104;

    fn frames(count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..count {
            out.extend_from_slice(&FRAME_HEADER);
            out.extend(std::iter::repeat(i as u8).take(FRAME_LEN - 4));
        }
        out
    }

    fn demuxer_over(bytes: Vec<u8>) -> MpegDemuxer {
        MpegDemuxer::new(Box::new(Cursor::new(bytes)), ChunkPool::new(8 * 1024 * 1024))
    }

    #[test]
    fn header_table_lookups() {
        let header = MpegHeader::parse(&FRAME_HEADER).expect("parse");
        assert_eq!(header.sample_rate, 44_100);
        assert_eq!(header.bitrate_kbps, 32);
        assert_eq!(header.channels, 2);
        assert_eq!(header.samples_per_frame, 1152);
        assert_eq!(header.frame_len, FRAME_LEN);

        assert!(MpegHeader::parse(&[0xFF, 0xFB, 0xF0, 0x00]).is_none()); // bad bitrate
        assert!(MpegHeader::parse(&[0xFF, 0xFB, 0x1C, 0x00]).is_none()); // bad rate
        assert!(MpegHeader::parse(&[0xFF, 0xEB, 0x10, 0x00]).is_none()); // reserved version
        assert!(MpegHeader::parse(&[0xFE, 0xFB, 0x10, 0x00]).is_none()); // no sync
    }

    #[test]
    fn parses_and_slices_frames() {
        let mut demuxer = demuxer_over(frames(20));
        demuxer.parse_container().expect("parse");

        let info = &demuxer.streams()[0];
        assert_eq!(info.codec_name, "mp3");
        assert_eq!(info.duration_samples, 20 * 1152);

        let mut timestamps = Vec::new();
        loop {
            let chunk = demuxer.read_chunk(None).expect("read");
            if chunk.end_of_stream {
                break;
            }
            assert_eq!(chunk.len(), FRAME_LEN);
            assert_eq!(&chunk.data()[..4], &FRAME_HEADER);
            timestamps.push(chunk.timestamp_samples);
        }
        assert_eq!(timestamps.len(), 20);
        assert_eq!(timestamps[1], 1152);
        assert_eq!(timestamps[19], 19 * 1152);
    }

    #[test]
    fn id3v2_is_skipped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"ID3\x04\x00\x00");
        bytes.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]); // syncsafe 128
        bytes.extend(std::iter::repeat(0xAAu8).take(128));
        bytes.extend_from_slice(&frames(4));

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");
        let chunk = demuxer.read_chunk(None).expect("read");
        assert_eq!(chunk.file_offset, 138);
        assert_eq!(&chunk.data()[..4], &FRAME_HEADER);
    }

    #[test]
    fn id3v1_tags_are_read_and_excluded() {
        let mut bytes = frames(4);
        let mut tag = vec![0u8; 128];
        tag[..3].copy_from_slice(b"TAG");
        tag[3..8].copy_from_slice(b"title");
        tag[33..39].copy_from_slice(b"artist");
        bytes.extend_from_slice(&tag);

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");
        let info = &demuxer.streams()[0];
        assert_eq!(info.tags.title.as_deref(), Some("title"));
        assert_eq!(info.tags.artist.as_deref(), Some("artist"));
        assert_eq!(info.duration_samples, 4 * 1152);

        let mut count = 0;
        while !demuxer.read_chunk(None).expect("read").end_of_stream {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn resyncs_over_garbage() {
        let mut bytes = frames(2);
        bytes.extend(std::iter::repeat(0x00u8).take(37));
        bytes.extend_from_slice(&frames(2));

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");

        let mut count = 0;
        while !demuxer.read_chunk(None).expect("read").end_of_stream {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn seek_lands_on_frame_grid() {
        let mut demuxer = demuxer_over(frames(100));
        demuxer.parse_container().expect("parse");
        let duration = demuxer.duration_ms();
        assert!(duration > 2000);

        demuxer.seek_to(duration / 2).expect("seek");
        let chunk = demuxer.read_chunk(None).expect("read");
        assert!(!chunk.end_of_stream);
        assert_eq!(chunk.timestamp_samples % 1152, 0);
        assert_eq!(&chunk.data()[..4], &FRAME_HEADER);

        // Within one frame of the requested time.
        let target_sample = (duration / 2) * 44_100 / 1000;
        assert!(chunk.timestamp_samples.abs_diff(target_sample) <= 1152);
    }
}
