//! ISO/MP4 demuxer.
//!
//! Walks the box tree to `moov/trak/mdia/minf/stbl`, builds the
//! sample-to-chunk and sample-size tables, and yields one coded sample per
//! [`MediaChunk`] with timestamps from the time-to-sample table. Seeking
//! is a binary search over the decoded timestamp table, which the sample
//! tables make exact.
//!
//! Codec identification maps the sample-entry fourcc to a registered codec
//! name; FLAC (`dfLa`) and Opus (`dOps`) configuration boxes are converted
//! into the codec-private forms the codec family expects.

use std::io::{Read, Seek, SeekFrom};

use crate::{
    chunk::MediaChunk,
    demux::{Demuxer, StreamInfo},
    error::{Error, Result},
    pool::ChunkPool,
    source::ByteSource,
};

/// Cap on the in-memory `moov` box (64 MiB).
const MAX_MOOV_LEN: u64 = 64 * 1024 * 1024;

/// Cap on the per-sample table length.
const MAX_SAMPLES: usize = 4_000_000;

/// One mapped sample.
#[derive(Clone, Copy, Debug)]
struct SampleEntry {
    offset: u64,
    size: u32,
    /// In output sample units (already rescaled from the track timescale).
    timestamp: u64,
}

/// Iterates the child boxes of an in-memory box body.
struct BoxIter<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> BoxIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = ([u8; 4], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.data.get(self.at..self.at + 8)?;
        let mut size = u64::from(u32::from_be_bytes([header[0], header[1], header[2], header[3]]));
        let fourcc = [header[4], header[5], header[6], header[7]];
        let mut body_at = self.at + 8;

        if size == 1 {
            let large = self.data.get(self.at + 8..self.at + 16)?;
            size = u64::from_be_bytes([
                large[0], large[1], large[2], large[3], large[4], large[5], large[6], large[7],
            ]);
            body_at = self.at + 16;
        } else if size == 0 {
            size = (self.data.len() - self.at) as u64;
        }
        if size < 8 {
            return None;
        }

        let end = self.at + size as usize;
        let body = self.data.get(body_at..end)?;
        self.at = end;
        Some((fourcc, body))
    }
}

/// Finds the first child box with the given fourcc.
fn find_box<'a>(data: &'a [u8], fourcc: &[u8; 4]) -> Option<&'a [u8]> {
    BoxIter::new(data).find(|(cc, _)| cc == fourcc).map(|(_, body)| body)
}

/// Follows a path of nested boxes.
fn find_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    path.iter().try_fold(data, |scope, cc| find_box(scope, cc))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    data.get(at..at + 8).map(|b| {
        u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

/// Converts a big-endian `dOps` box body into the little-endian
/// `OpusHead` layout the Opus codec expects.
fn dops_to_opus_head(dops: &[u8]) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(*dops.get(1).unwrap_or(&2));
    let pre_skip = u16::from(*dops.get(2).unwrap_or(&0)) << 8 | u16::from(*dops.get(3).unwrap_or(&0));
    head.extend_from_slice(&pre_skip.to_le_bytes());
    head.extend_from_slice(&read_u32(dops, 4).unwrap_or(48_000).to_le_bytes());
    let gain = u16::from(*dops.get(8).unwrap_or(&0)) << 8 | u16::from(*dops.get(9).unwrap_or(&0));
    head.extend_from_slice(&gain.to_le_bytes());
    head.push(*dops.get(10).unwrap_or(&0));
    head
}

/// ISO/MP4 demuxer.
pub struct Mp4Demuxer {
    source: Box<dyn ByteSource>,
    pool: ChunkPool,

    parsed: bool,
    streams: Vec<StreamInfo>,

    /// Sample map of the primary audio track.
    samples: Vec<SampleEntry>,
    cursor: usize,

    eof: bool,
    last_error: Option<Error>,
}

impl Mp4Demuxer {
    #[must_use]
    pub fn new(source: Box<dyn ByteSource>, pool: ChunkPool) -> Self {
        Self {
            source,
            pool,
            parsed: false,
            streams: Vec::new(),
            samples: Vec::new(),
            cursor: 0,
            eof: false,
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

    /// Locates the `moov` box in the file and returns its body.
    fn load_moov(&mut self) -> Result<Vec<u8>> {
        let mut offset = 0u64;
        let source_len = self.source.byte_len().unwrap_or(u64::MAX);

        loop {
            let mut header = [0u8; 16];
            let got = self.read_at(offset, &mut header)?;
            if got < 8 {
                return Err(Error::format("no moov box found"));
            }
            let mut size = u64::from(u32::from_be_bytes([
                header[0], header[1], header[2], header[3],
            ]));
            let fourcc = &header[4..8];
            let mut body_at = offset + 8;
            if size == 1 {
                if got < 16 {
                    return Err(Error::format("truncated box header").at_offset(offset));
                }
                size = u64::from_be_bytes([
                    header[8], header[9], header[10], header[11], header[12], header[13],
                    header[14], header[15],
                ]);
                body_at = offset + 16;
            } else if size == 0 {
                size = source_len.saturating_sub(offset);
            }
            if size < 8 {
                return Err(Error::format("impossible box size").at_offset(offset));
            }

            if fourcc == b"moov" {
                let body_len = size - (body_at - offset);
                if body_len > MAX_MOOV_LEN {
                    return Err(Error::memory("moov box exceeds the in-memory cap"));
                }
                let mut body = vec![0u8; body_len as usize];
                let got = self.read_at(body_at, &mut body)?;
                body.truncate(got);
                return Ok(body);
            }

            trace!(
                "skipping top-level box {:?} of {size} bytes",
                String::from_utf8_lossy(fourcc)
            );
            offset += size;
            if offset >= source_len {
                return Err(Error::format("no moov box found"));
            }
        }
    }

    /// Parses one audio `trak` body into a stream description and, for the
    /// primary track, the sample map.
    fn parse_trak(&mut self, trak: &[u8], stream_id: u32) -> Result<Option<StreamInfo>> {
        let mdia = find_box(trak, b"mdia").ok_or_else(|| Error::format("trak without mdia"))?;

        // Only sound handlers matter here.
        let handler = find_box(mdia, b"hdlr")
            .and_then(|h| h.get(8..12).map(|cc| [cc[0], cc[1], cc[2], cc[3]]));
        if handler != Some(*b"soun") {
            return Ok(None);
        }

        let mdhd = find_box(mdia, b"mdhd").ok_or_else(|| Error::format("mdia without mdhd"))?;
        let (timescale, media_duration) = match mdhd.first() {
            Some(1) => (
                read_u32(mdhd, 20).unwrap_or(0),
                read_u64(mdhd, 24).unwrap_or(0),
            ),
            _ => (
                read_u32(mdhd, 12).unwrap_or(0),
                u64::from(read_u32(mdhd, 16).unwrap_or(0)),
            ),
        };
        if timescale == 0 {
            return Err(Error::format("media timescale is zero"));
        }

        let stbl = find_path(mdia, &[b"minf", b"stbl"])
            .ok_or_else(|| Error::format("mdia without a sample table"))?;
        let stsd = find_box(stbl, b"stsd").ok_or_else(|| Error::format("stbl without stsd"))?;
        if read_u32(stsd, 4).unwrap_or(0) == 0 {
            return Err(Error::format("empty sample description"));
        }
        let entry = stsd
            .get(8..)
            .filter(|e| e.len() >= 36)
            .ok_or_else(|| Error::format("short sample description"))?;
        let fourcc = [entry[4], entry[5], entry[6], entry[7]];
        let entry_version = u16::from(entry[16]) << 8 | u16::from(entry[17]);
        let channels = u16::from(entry[24]) << 8 | u16::from(entry[25]);
        let sample_size = u16::from(entry[26]) << 8 | u16::from(entry[27]);
        // 16.16 fixed point.
        let sample_rate = read_u32(entry, 32).unwrap_or(0) >> 16;

        // Child boxes follow the fixed fields; version 1 entries carry
        // four extra 32-bit fields first.
        let children_at = if entry_version == 1 { 36 + 16 } else { 36 };
        let children = entry.get(children_at..).unwrap_or(&[]);

        let (codec_name, codec_private) = match &fourcc {
            b"fLaC" => {
                // dfLa: full box, then FLAC metadata blocks; the first is
                // STREAMINFO whose 34-byte body the codec wants.
                let private = find_box(children, b"dfLa")
                    .and_then(|dfla| dfla.get(4 + 4..4 + 4 + 34))
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                ("flac", private)
            }
            b"Opus" => {
                let private = find_box(children, b"dOps").map_or_else(Vec::new, dops_to_opus_head);
                ("opus", private)
            }
            b"mp4a" => ("aac", Vec::new()),
            b".mp3" => ("mp3", Vec::new()),
            b"sowt" | b"lpcm" => ("pcm_s16le", Vec::new()),
            b"twos" => ("pcm_s16be", Vec::new()),
            b"ulaw" => ("pcm_mulaw", Vec::new()),
            b"alaw" => ("pcm_alaw", Vec::new()),
            other => {
                warn!(
                    "unrecognised sample entry {:?}; the track cannot be decoded",
                    String::from_utf8_lossy(other)
                );
                ("unknown", Vec::new())
            }
        };

        let output_rate = if codec_name == "opus" { 48_000 } else { sample_rate };
        let mut info = StreamInfo::audio(
            stream_id,
            codec_name,
            output_rate,
            channels.min(8) as u8,
            if sample_size == 0 { 16 } else { sample_size.min(32) as u8 },
        );
        info.codec_tag = u32::from_be_bytes(fourcc);
        info.codec_private = codec_private;
        info.is_seekable = self.source.is_seekable();
        info.has_seektable = true;
        info.duration_samples = media_duration * u64::from(output_rate) / u64::from(timescale);

        // Sample map for the first decodable track only.
        if self.samples.is_empty() && codec_name != "unknown" {
            self.samples = Self::build_sample_map(stbl, timescale, output_rate)?;
        }

        Ok(Some(info))
    }

    /// Expands stts/stsz/stsc/stco into a flat sample map.
    fn build_sample_map(stbl: &[u8], timescale: u32, output_rate: u32) -> Result<Vec<SampleEntry>> {
        let stts = find_box(stbl, b"stts").ok_or_else(|| Error::format("missing stts"))?;
        let stsz = find_box(stbl, b"stsz").ok_or_else(|| Error::format("missing stsz"))?;
        let stsc = find_box(stbl, b"stsc").ok_or_else(|| Error::format("missing stsc"))?;
        let (offsets, wide) = match find_box(stbl, b"co64") {
            Some(co64) => (co64, true),
            None => (
                find_box(stbl, b"stco").ok_or_else(|| Error::format("missing stco"))?,
                false,
            ),
        };

        // Sample sizes.
        let uniform_size = read_u32(stsz, 4).unwrap_or(0);
        let sample_count = read_u32(stsz, 8).unwrap_or(0) as usize;
        if sample_count > MAX_SAMPLES {
            return Err(Error::memory(format!("{sample_count} samples exceed the table cap")));
        }
        let size_of = |index: usize| -> u32 {
            if uniform_size != 0 {
                uniform_size
            } else {
                read_u32(stsz, 12 + index * 4).unwrap_or(0)
            }
        };

        // Timestamps in timescale units, rescaled to output samples.
        let mut timestamps = Vec::with_capacity(sample_count);
        let stts_count = read_u32(stts, 4).unwrap_or(0) as usize;
        let mut tick = 0u64;
        for i in 0..stts_count {
            let count = read_u32(stts, 8 + i * 8).unwrap_or(0);
            let delta = u64::from(read_u32(stts, 12 + i * 8).unwrap_or(0));
            for _ in 0..count {
                if timestamps.len() >= sample_count {
                    break;
                }
                timestamps.push(tick * u64::from(output_rate) / u64::from(timescale));
                tick += delta;
            }
        }
        timestamps.resize(sample_count, tick);

        // Chunk runs.
        let chunk_count = read_u32(offsets, 4).unwrap_or(0) as usize;
        let chunk_offset = |index: usize| -> Option<u64> {
            if wide {
                read_u64(offsets, 8 + index * 8)
            } else {
                read_u32(offsets, 8 + index * 4).map(u64::from)
            }
        };
        let stsc_count = read_u32(stsc, 4).unwrap_or(0) as usize;
        let stsc_entry = |index: usize| -> Option<(u32, u32)> {
            Some((
                read_u32(stsc, 8 + index * 12)?,
                read_u32(stsc, 12 + index * 12)?,
            ))
        };

        let mut samples = Vec::with_capacity(sample_count);
        let mut sample_index = 0usize;
        let mut run = 0usize;
        for chunk in 0..chunk_count {
            // Advance to the stsc run covering this chunk (1-based).
            while run + 1 < stsc_count
                && stsc_entry(run + 1).is_some_and(|(first, _)| first <= chunk as u32 + 1)
            {
                run += 1;
            }
            let per_chunk = stsc_entry(run).map_or(0, |(_, n)| n) as usize;
            let Some(mut offset) = chunk_offset(chunk) else { break };

            for _ in 0..per_chunk {
                if sample_index >= sample_count {
                    break;
                }
                let size = size_of(sample_index);
                samples.push(SampleEntry {
                    offset,
                    size,
                    timestamp: timestamps[sample_index],
                });
                offset += u64::from(size);
                sample_index += 1;
            }
        }

        if samples.is_empty() {
            return Err(Error::format("sample tables describe no samples"));
        }
        Ok(samples)
    }

    fn primary(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.codec_name != "unknown")
    }
}

impl Demuxer for Mp4Demuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.parsed {
            return Ok(());
        }

        let moov = self.load_moov()?;
        let mut streams = Vec::new();
        let traks: Vec<Vec<u8>> = BoxIter::new(&moov)
            .filter(|(cc, _)| cc == b"trak")
            .map(|(_, body)| body.to_vec())
            .collect();
        for trak in traks {
            let stream_id = streams.len() as u32;
            match self.parse_trak(&trak, stream_id) {
                Ok(Some(info)) => streams.push(info),
                Ok(None) => {}
                Err(e) => warn!("skipping undecodable track: {e}"),
            }
        }

        if streams.is_empty() || self.samples.is_empty() {
            return Err(Error::format("no decodable audio track"));
        }
        self.streams = streams;
        self.parsed = true;

        let info = self.primary().map_or(&self.streams[0], |p| p);
        debug!(
            "MP4 parsed: {} ({} Hz, {} ch, {} samples in {} coded units)",
            info.codec_name,
            info.sample_rate,
            info.channels,
            info.duration_samples,
            self.samples.len()
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
        if self.last_error.is_some() || self.eof || self.cursor >= self.samples.len() {
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }

        let entry = self.samples[self.cursor];
        let mut buffer = self.pool.acquire(entry.size.max(1) as usize)?;
        let got = self.read_at(entry.offset, &mut buffer.as_mut_slice()[..entry.size as usize])?;
        if got < entry.size as usize {
            warn!(
                "sample {} truncated: wanted {} bytes, read {got}",
                self.cursor, entry.size
            );
            self.eof = true;
            return Ok(MediaChunk::end_of_stream(0));
        }
        buffer.set_len(got);

        let chunk = MediaChunk::new(buffer, 0, entry.timestamp, entry.offset);
        self.cursor += 1;
        if self.cursor >= self.samples.len() {
            self.eof = true;
        }
        Ok(chunk)
    }

    fn seek_to(&mut self, position_ms: u64) -> Result<()> {
        if !self.parsed {
            return Err(Error::format("container not parsed"));
        }
        let rate = self.primary().map_or(44_100, |s| s.sample_rate);
        let target = position_ms * u64::from(rate) / 1000;

        let at = self.samples.partition_point(|s| s.timestamp <= target);
        self.cursor = at.saturating_sub(1);
        self.eof = false;
        if target
            >= self
                .primary()
                .map_or(u64::MAX, |s| s.duration_samples.max(1))
        {
            self.cursor = self.samples.len();
            self.eof = true;
        }
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn duration_ms(&self) -> u64 {
        self.primary().map_or(0, StreamInfo::duration_ms)
    }

    fn position_ms(&self) -> u64 {
        let rate = self.primary().map_or(44_100, |s| s.sample_rate.max(1));
        let at = self.cursor.min(self.samples.len().saturating_sub(1));
        self.samples
            .get(at)
            .map_or(0, |s| s.timestamp * 1000 / u64::from(rate))
    }

    fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn clear_error(&mut self) {
        self.last_error = None;
    }
}
