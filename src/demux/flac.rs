//! FLAC container demuxer.
//!
//! Validates the `fLaC` marker, walks the metadata blocks (STREAMINFO is
//! mandatory and authoritative, VORBIS_COMMENT fills tags, SEEKTABLE feeds
//! seeking), then slices the audio region into one frame per chunk.
//!
//! # Frame sizing
//!
//! Frames carry no length field; the next frame boundary must be found by
//! scanning. The size estimate starts from STREAMINFO's `min_frame_size`:
//! highly compressed streams produce frames as small as 10–14 bytes, and
//! any theoretical bound computed from block size, channels and bit depth
//! overshoots such streams by orders of magnitude. A candidate boundary
//! within a bounded window past the estimate is verified by parsing the
//! following header (sync, field validity, CRC-8) and checking frame
//! numbering continuity; on a miss the window advances and the miss is
//! logged.
//!
//! # Seeking
//!
//! Native SEEKTABLE points first, then the in-memory
//! [`FrameIndex`](crate::demux::frame_index::FrameIndex) built during the
//! bounded initial indexing pass and fed opportunistically during
//! playback, then a linear header walk from the best known position.

use std::io::{Read, Seek, SeekFrom};

use crate::{
    chunk::MediaChunk,
    codec::flac::frame::{find_frame_sync, FrameHeader, Streaminfo},
    config::CrcMode,
    demux::{
        frame_index::{FrameIndex, FrameIndexEntry},
        parse_vorbis_comments, Demuxer, StreamInfo, Tags,
    },
    error::{Error, Recovery, Result},
    pool::ChunkPool,
    source::ByteSource,
};

/// Metadata block types.
const BLOCK_STREAMINFO: u8 = 0;
const BLOCK_SEEKTABLE: u8 = 3;
const BLOCK_VORBIS_COMMENT: u8 = 4;

/// Bytes scanned past the frame-size estimate per attempt.
const SYNC_SCAN_WINDOW: usize = 256;

/// Upper bound on a single frame header in bytes.
const MAX_HEADER_LEN: usize = 16;

/// Hard cap on a frame when STREAMINFO gives no maximum (1 MiB).
const FALLBACK_MAX_FRAME: usize = 1024 * 1024;

/// Bounded forward scan used to regain sync after a lost frame boundary.
const RESYNC_LIMIT: usize = 64 * 1024;

/// Initial indexing stops after this many frames...
const INDEX_MAX_FRAMES: usize = 1000;

/// ...or this much audio, whichever comes first.
const INDEX_MAX_SECONDS: u64 = 300;

/// Sync losses tolerated before the stream degrades to fallback parsing.
const MAX_SYNC_ERRORS: u32 = 8;

/// One native seek table point.
#[derive(Clone, Copy, Debug)]
struct SeekPoint {
    sample: u64,
    /// Relative to the first audio frame.
    offset: u64,
}

/// FLAC container demuxer.
pub struct FlacDemuxer {
    source: Box<dyn ByteSource>,
    pool: ChunkPool,
    crc_mode: CrcMode,

    parsed: bool,
    streams: Vec<StreamInfo>,
    streaminfo: Option<Streaminfo>,

    /// Absolute offset of the first audio frame.
    audio_start: u64,
    source_len: u64,

    seektable: Vec<SeekPoint>,
    index: FrameIndex,

    /// Read position and the expected coded number of the frame there.
    pos: u64,

    /// Timestamp tracking for emitted chunks.
    current_sample: u64,

    eof: bool,
    sync_errors: u32,

    /// Set once the stream degrades to STREAMINFO-only advancement.
    fallback_mode: bool,

    last_error: Option<Error>,
}

impl FlacDemuxer {
    #[must_use]
    pub fn new(source: Box<dyn ByteSource>, pool: ChunkPool, crc_mode: CrcMode) -> Self {
        Self {
            source,
            pool,
            crc_mode,
            parsed: false,
            streams: Vec::new(),
            streaminfo: None,
            audio_start: 0,
            source_len: 0,
            seektable: Vec::new(),
            index: FrameIndex::default(),
            pos: 0,
            current_sample: 0,
            eof: false,
            sync_errors: 0,
            fallback_mode: false,
            last_error: None,
        }
    }

    /// Frames retained by the in-memory index.
    #[must_use]
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    fn streaminfo(&self) -> Result<&Streaminfo> {
        self.streaminfo
            .as_ref()
            .ok_or_else(|| Error::format("container not parsed"))
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

    /// The frame-size estimate scanning starts from.
    ///
    /// STREAMINFO's `min_frame_size` when it is known; otherwise a small
    /// constant. Never a theoretical block-size bound.
    fn frame_size_estimate(&self) -> usize {
        match self.streaminfo.as_ref() {
            Some(si) if si.min_frame_size > 0 => si.min_frame_size as usize,
            _ => MAX_HEADER_LEN,
        }
    }

    /// Largest frame the scanner will accept.
    fn frame_size_cap(&self) -> usize {
        match self.streaminfo.as_ref() {
            // Leave headroom: max_frame_size is advisory in some writers.
            Some(si) if si.max_frame_size > 0 => si.max_frame_size as usize + SYNC_SCAN_WINDOW,
            _ => FALLBACK_MAX_FRAME,
        }
    }

    /// Expected coded number of the frame following `header`.
    fn next_number(header: &FrameHeader) -> u64 {
        if header.variable_blocksize {
            header.number + u64::from(header.block_size)
        } else {
            header.number + 1
        }
    }

    /// Measures the frame starting at `offset`: parses its header and
    /// scans for the next verified frame boundary.
    ///
    /// Returns the header and the frame's byte length.
    fn measure_frame(&mut self, offset: u64) -> Result<(FrameHeader, usize)> {
        let streaminfo = *self.streaminfo()?;

        let mut head = [0u8; MAX_HEADER_LEN];
        let got = self.read_at(offset, &mut head)?;
        let header = FrameHeader::parse(&head[..got], &streaminfo)?;
        let expected_next = Self::next_number(&header);

        let remaining = (self.source_len.saturating_sub(offset)) as usize;
        let cap = self.frame_size_cap().min(remaining);
        let estimate = self.frame_size_estimate().max(header.header_len);
        if estimate >= remaining {
            // The stream ends inside the estimate: the last frame runs to
            // the end of the file.
            return Ok((header, remaining));
        }

        let mut window_start = estimate;
        let mut buf = Vec::new();
        while window_start < cap {
            let window_len = SYNC_SCAN_WINDOW.min(cap - window_start) + MAX_HEADER_LEN;
            buf.resize(window_len, 0);
            let got = self.read_at(offset + window_start as u64, &mut buf)?;
            if got == 0 {
                break;
            }
            let window = &buf[..got];

            let mut at = 0usize;
            while let Some(found) = find_frame_sync(&window[at..]) {
                let candidate = at + found;
                if candidate > SYNC_SCAN_WINDOW.min(cap - window_start) {
                    break;
                }
                if let Ok(next) = FrameHeader::parse(&window[candidate..], &streaminfo) {
                    if next.number == expected_next {
                        return Ok((header, window_start + candidate));
                    }
                    trace!(
                        "sync candidate at +{} rejected: number {} != {}",
                        window_start + candidate,
                        next.number,
                        expected_next
                    );
                }
                at = candidate + 1;
            }

            if got < window_len {
                // End of stream inside the window: last frame.
                return Ok((header, remaining));
            }
            debug!(
                "no frame boundary within {SYNC_SCAN_WINDOW} bytes past offset {}; widening",
                offset + window_start as u64
            );
            window_start += SYNC_SCAN_WINDOW;
        }

        if cap >= remaining {
            // Nothing verifiable before the end: treat as the last frame.
            return Ok((header, remaining));
        }
        Err(Error::format("frame boundary not found within the size cap")
            .with_recovery(Recovery::SkipSection)
            .at_offset(offset))
    }

    /// Scans forward from `offset` for the next parsable frame header.
    fn resync(&mut self, offset: u64) -> Result<Option<u64>> {
        let streaminfo = *self.streaminfo()?;
        let mut buf = vec![0u8; RESYNC_LIMIT];
        let got = self.read_at(offset, &mut buf)?;
        buf.truncate(got);

        let mut at = 0usize;
        while let Some(found) = find_frame_sync(&buf[at..]) {
            let candidate = at + found;
            if FrameHeader::parse(&buf[candidate..], &streaminfo).is_ok() {
                return Ok(Some(offset + candidate as u64));
            }
            at = candidate + 1;
        }
        Ok(None)
    }

    /// Builds the initial frame index: a bounded walk of frame headers
    /// from the start of the audio region.
    fn build_initial_index(&mut self) -> Result<()> {
        let Some(streaminfo) = self.streaminfo else { return Ok(()) };
        let sample_cap = INDEX_MAX_SECONDS * u64::from(streaminfo.sample_rate);

        let mut offset = self.audio_start;
        let mut frames = 0usize;
        while frames < INDEX_MAX_FRAMES && offset < self.source_len {
            let (header, size) = match self.measure_frame(offset) {
                Ok(found) => found,
                Err(e) => {
                    debug!("initial indexing stopped at byte {offset}: {e}");
                    break;
                }
            };
            let sample = header.start_sample(u32::from(streaminfo.min_block_size));
            if sample >= sample_cap {
                break;
            }
            self.index.insert(FrameIndexEntry {
                sample_offset: sample,
                file_offset: offset,
                block_size: header.block_size,
                frame_size: size as u32,
            });
            offset += size as u64;
            frames += 1;
        }
        debug!("initial index: {} entries over {frames} frames", self.index.len());
        Ok(())
    }
}

impl Demuxer for FlacDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.parsed {
            return Ok(());
        }
        self.source_len = self.source.byte_len().unwrap_or(u64::MAX);

        let mut magic = [0u8; 4];
        if self.read_at(0, &mut magic)? < 4 || &magic != b"fLaC" {
            return Err(Error::format("not a FLAC stream"));
        }

        let mut offset = 4u64;
        let mut streaminfo: Option<Streaminfo> = None;
        let mut codec_private = Vec::new();
        let mut tags = Tags::default();
        let mut has_seektable = false;

        loop {
            let mut head = [0u8; 4];
            if self.read_at(offset, &mut head)? < 4 {
                return Err(Error::format("metadata ended before the last block")
                    .at_offset(offset));
            }
            let last = head[0] & 0x80 != 0;
            let block_type = head[0] & 0x7F;
            let len = u32::from_be_bytes([0, head[1], head[2], head[3]]) as u64;
            let body_at = offset + 4;

            match block_type {
                BLOCK_STREAMINFO => {
                    let mut body = vec![0u8; len.min(1024) as usize];
                    self.read_at(body_at, &mut body)?;
                    codec_private.clone_from(&body);
                    match Streaminfo::parse(&body) {
                        Ok(si) => streaminfo = Some(si),
                        Err(e) => {
                            // Decoding can still work off the first frame
                            // header; note the degradation and carry on.
                            warn!("STREAMINFO rejected ({e}); entering fallback parsing");
                            self.fallback_mode = true;
                        }
                    }
                }
                BLOCK_VORBIS_COMMENT => {
                    let mut body = vec![0u8; len.min(1024 * 1024) as usize];
                    self.read_at(body_at, &mut body)?;
                    parse_vorbis_comments(&body, &mut tags);
                }
                BLOCK_SEEKTABLE => {
                    let mut body = vec![0u8; len.min(1024 * 1024) as usize];
                    self.read_at(body_at, &mut body)?;
                    for point in body.chunks_exact(18) {
                        let sample = u64::from_be_bytes([
                            point[0], point[1], point[2], point[3], point[4], point[5],
                            point[6], point[7],
                        ]);
                        if sample == u64::MAX {
                            // Placeholder point.
                            continue;
                        }
                        let stream_offset = u64::from_be_bytes([
                            point[8], point[9], point[10], point[11], point[12], point[13],
                            point[14], point[15],
                        ]);
                        self.seektable.push(SeekPoint {
                            sample,
                            offset: stream_offset,
                        });
                    }
                    has_seektable = !self.seektable.is_empty();
                }
                _ => {
                    trace!("skipping metadata block type {block_type} of {len} bytes");
                }
            }

            offset = body_at + len;
            if last {
                break;
            }
        }
        self.audio_start = offset;
        self.pos = offset;
        self.seektable.sort_by_key(|p| p.sample);

        // A missing or implausible STREAMINFO falls back to the first
        // frame header for the stream parameters.
        let streaminfo = match streaminfo {
            Some(si) => si,
            None => {
                let mut head = [0u8; MAX_HEADER_LEN];
                let got = self.read_at(self.audio_start, &mut head)?;
                let defaults = Streaminfo {
                    min_block_size: 16,
                    max_block_size: 16384,
                    min_frame_size: 0,
                    max_frame_size: 0,
                    sample_rate: 0,
                    channels: 2,
                    bits_per_sample: 16,
                    total_samples: 0,
                    md5: [0; 16],
                };
                let first = FrameHeader::parse(&head[..got], &defaults).map_err(|e| {
                    Error::format(format!("no STREAMINFO and no parsable first frame: {e}"))
                })?;
                self.fallback_mode = true;
                Streaminfo {
                    sample_rate: first.sample_rate,
                    channels: first.channel_assignment.channels(),
                    bits_per_sample: first.bits_per_sample,
                    ..defaults
                }
            }
        };
        self.streaminfo = Some(streaminfo);

        let mut info = StreamInfo::audio(
            0,
            "flac",
            streaminfo.sample_rate,
            streaminfo.channels,
            streaminfo.bits_per_sample,
        );
        info.duration_samples = streaminfo.total_samples;
        info.is_seekable = self.source.is_seekable();
        info.has_seektable = has_seektable;
        info.tags = tags;
        info.codec_private = codec_private;
        self.streams = vec![info];
        self.parsed = true;

        debug!(
            "FLAC parsed: {} Hz, {} ch, {} bits, {} samples, seektable {}",
            streaminfo.sample_rate,
            streaminfo.channels,
            streaminfo.bits_per_sample,
            streaminfo.total_samples,
            if has_seektable { "present" } else { "absent" },
        );

        if self.source.is_seekable() && !self.fallback_mode {
            self.build_initial_index()?;
        }
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
        if self.pos >= self.source_len {
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }

        let offset = self.pos;
        let (header, size) = match self.measure_frame(offset) {
            Ok(found) => found,
            Err(e) if e.category == crate::error::Category::Io => return Err(e),
            Err(e) => {
                self.sync_errors += 1;
                warn!("lost frame sync at byte {offset}: {e}");
                if self.sync_errors > MAX_SYNC_ERRORS {
                    self.fallback_mode = true;
                    self.last_error = Some(
                        Error::format("frame sync lost beyond recovery")
                            .with_recovery(Recovery::FallbackMode)
                            .at_offset(offset),
                    );
                    return Ok(MediaChunk::end_of_stream(0));
                }
                match self.resync(offset + 1)? {
                    Some(found) => {
                        self.pos = found;
                        return self.read_chunk(_stream_id);
                    }
                    None => {
                        self.eof = true;
                        return Ok(MediaChunk::end_of_stream(0));
                    }
                }
            }
        };
        self.sync_errors = 0;

        let nominal_block = u32::from(self.streaminfo.map_or(4096, |si| si.min_block_size));
        let sample = header.start_sample(nominal_block);

        let mut buffer = self.pool.acquire(size)?;
        let got = self.read_at(offset, &mut buffer.as_mut_slice()[..size])?;
        buffer.set_len(got);
        if got == 0 {
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }

        // Opportunistic index growth during playback.
        self.index.insert(FrameIndexEntry {
            sample_offset: sample,
            file_offset: offset,
            block_size: header.block_size,
            frame_size: got as u32,
        });

        self.pos = offset + got as u64;
        self.current_sample = sample + u64::from(header.block_size);
        if self.pos >= self.source_len {
            self.eof = true;
        }
        Ok(MediaChunk::new(buffer, 0, sample, offset))
    }

    fn seek_to(&mut self, position_ms: u64) -> Result<()> {
        if !self.parsed {
            return Err(Error::format("container not parsed"));
        }
        let streaminfo = *self.streaminfo()?;
        if !self.source.is_seekable() {
            return Err(Error::io("source is not seekable"));
        }

        let rate = u64::from(streaminfo.sample_rate.max(1));
        let target = position_ms * rate / 1000;
        let total = streaminfo.total_samples;
        if total > 0 && target >= total {
            self.pos = self.source_len;
            self.current_sample = total;
            self.eof = true;
            return Ok(());
        }

        // Best starting point: native seek table, then the frame index,
        // then the top of the audio region.
        let mut start_offset = self.audio_start;
        let mut start_sample = 0u64;

        let table_at = self.seektable.partition_point(|p| p.sample <= target);
        if let Some(point) = table_at.checked_sub(1).and_then(|i| self.seektable.get(i)) {
            start_offset = self.audio_start + point.offset;
            start_sample = point.sample;
        }
        if let Some(entry) = self.index.lookup(target) {
            if entry.sample_offset >= start_sample {
                start_offset = entry.file_offset;
                start_sample = entry.sample_offset;
            }
        }

        // Linear header walk from the starting point to the frame that
        // contains the target.
        let mut offset = start_offset;
        let mut guard = 0u32;
        loop {
            guard += 1;
            if guard > 1_000_000 {
                return Err(Error::exception("seek walk did not terminate"));
            }
            let (header, size) = match self.measure_frame(offset) {
                Ok(found) => found,
                Err(e) => {
                    warn!("seek walk stopped at byte {offset}: {e}");
                    break;
                }
            };
            let sample = header.start_sample(u32::from(streaminfo.min_block_size));
            if sample + u64::from(header.block_size) > target {
                self.pos = offset;
                self.current_sample = sample;
                self.eof = false;
                trace!(
                    "FLAC seek to sample {target}: frame at byte {offset} starting at {sample}"
                );
                return Ok(());
            }
            offset += size as u64;
            if offset >= self.source_len {
                break;
            }
        }

        self.pos = self.source_len;
        self.eof = true;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn duration_ms(&self) -> u64 {
        self.streams.first().map_or(0, StreamInfo::duration_ms)
    }

    fn position_ms(&self) -> u64 {
        let rate = self
            .streaminfo
            .map_or(44_100, |si| u64::from(si.sample_rate.max(1)));
        self.current_sample * 1000 / rate
    }

    fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn clear_error(&mut self) {
        self.last_error = None;
        self.sync_errors = 0;
    }
}
