//! Ogg container demuxer.
//!
//! Parses 27-byte page headers at the `OggS` capture pattern, verifies the
//! page CRC-32 (polynomial 0x04C11DB7, computed with the CRC field
//! zeroed), reassembles packets across page boundaries via the lacing
//! table, and multiplexes logical streams by serial number. Vorbis and
//! Opus streams are identified from their beginning-of-stream packets;
//! their header packets become codec-private data and every following
//! packet is one [`MediaChunk`].
//!
//! # Timestamps
//!
//! A page's granule position names the last sample of the last packet that
//! ends on it, in codec-specific units: PCM position for Vorbis, 48 kHz
//! samples including pre-skip for Opus. Packets completing on a page are
//! stamped with the samples finished before the page; the stamp is exact
//! at page boundaries and monotone within them.
//!
//! # Seeking
//!
//! Bisection on page granules down to a small window, then a forward page
//! scan. The landing point is a page boundary, so the residual error is
//! bounded by one packet.

use std::{
    collections::VecDeque,
    io::{Read, Seek, SeekFrom},
};

use crate::{
    chunk::MediaChunk,
    codec::opus::OpusHead,
    config::CrcMode,
    demux::{parse_vorbis_comments, Demuxer, StreamInfo, Tags},
    error::{Error, Recovery, Result},
    pool::ChunkPool,
    source::ByteSource,
};

/// Fixed part of a page header.
const PAGE_HEADER_LEN: usize = 27;

/// Largest possible page: header, full lacing table, 255 full segments.
const MAX_PAGE_LEN: usize = PAGE_HEADER_LEN + 255 + 255 * 255;

/// Bytes scanned for the capture pattern before giving up.
const SYNC_SCAN_LIMIT: usize = 64 * 1024;

/// Bytes of the stream tail scanned for the final granule position.
const TAIL_SCAN_LEN: usize = 64 * 1024;

/// Bisection stops once the byte range is this small; a forward scan
/// finishes the job.
const SEEK_LINEAR_WINDOW: u64 = 256 * 1024;

/// Pages with bad CRCs tolerated before the stream is declared fatal.
const MAX_CRC_ERRORS: u32 = 32;

/// Page header flags.
const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

/// CRC-32 table for polynomial 0x04C11DB7, non-reflected, as Ogg uses.
static CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Ogg page CRC-32 over `data`, initial value 0.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &b| {
        (crc << 8) ^ CRC32_TABLE[usize::from((crc >> 24) as u8 ^ b)]
    })
}

/// What a logical stream's packets contain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OggCodecKind {
    Vorbis,
    Opus,
    /// Carried but not decodable here; packets are skipped.
    Unknown,
}

/// Per-serial packet assembly state.
struct LogicalStream {
    stream_id: u32,
    serial: u32,
    kind: OggCodecKind,

    /// Header packets collected during parse (3 for Vorbis, 2 for Opus).
    header_packets: Vec<Vec<u8>>,
    headers_needed: usize,

    /// Bytes of a packet still spanning into the next page.
    partial: Vec<u8>,

    /// Samples finished before the current page.
    base_samples: u64,

    /// Opus pre-skip, subtracted from granules.
    pre_skip: u32,

    finished: bool,
}

impl LogicalStream {
    fn new(stream_id: u32, serial: u32) -> Self {
        Self {
            stream_id,
            serial,
            kind: OggCodecKind::Unknown,
            header_packets: Vec::new(),
            // The first packet identifies the codec and is always a header.
            headers_needed: 1,
            partial: Vec::new(),
            base_samples: 0,
            pre_skip: 0,
            finished: false,
        }
    }

    /// Converts a page granule to a sample position for this stream.
    fn granule_to_samples(&self, granule: u64) -> u64 {
        match self.kind {
            OggCodecKind::Opus => granule.saturating_sub(u64::from(self.pre_skip)),
            _ => granule,
        }
    }
}

/// One raw, CRC-checked page.
struct RawPage {
    header_type: u8,
    /// `u64::MAX` encodes "no packet ends on this page".
    granule: u64,
    serial: u32,
    segments: Vec<u8>,
    data: Vec<u8>,
    /// Absolute offset of the capture pattern.
    offset: u64,
}

/// Ogg demuxer.
pub struct OggDemuxer {
    source: Box<dyn ByteSource>,
    pool: ChunkPool,
    crc_mode: CrcMode,

    parsed: bool,
    streams: Vec<StreamInfo>,
    logical: Vec<LogicalStream>,

    /// Index into `logical` of the stream playback binds to.
    primary: Option<usize>,

    pending: VecDeque<MediaChunk>,

    /// Offset of the first page following the header packets.
    data_start: u64,

    duration_samples: u64,
    eof: bool,
    crc_errors: u32,
    last_error: Option<Error>,
}

impl OggDemuxer {
    #[must_use]
    pub fn new(source: Box<dyn ByteSource>, pool: ChunkPool, crc_mode: CrcMode) -> Self {
        Self {
            source,
            pool,
            crc_mode,
            parsed: false,
            streams: Vec::new(),
            logical: Vec::new(),
            primary: None,
            pending: VecDeque::new(),
            data_start: 0,
            duration_samples: 0,
            eof: false,
            crc_errors: 0,
            last_error: None,
        }
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<usize> {
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

    /// Reads the next page at or after the current source position.
    ///
    /// Scans a bounded window for the capture pattern, so garbage between
    /// pages is survivable. Returns `None` at end of stream.
    fn read_page(&mut self) -> Result<Option<RawPage>> {
        // Locate `OggS` within the scan limit.
        let mut scanned = 0usize;
        let mut window = [0u8; 4];
        let mut offset = self.source.stream_position()?;
        let got = self.read_exact_or_eof(&mut window)?;
        if got == 0 {
            return Ok(None);
        }
        if got < 4 {
            return Ok(None);
        }
        while &window != b"OggS" {
            scanned += 1;
            if scanned > SYNC_SCAN_LIMIT {
                return Err(Error::format("no page boundary within the scan window")
                    .with_recovery(Recovery::SkipSection)
                    .at_offset(offset));
            }
            window.rotate_left(1);
            let mut byte = [0u8; 1];
            if self.read_exact_or_eof(&mut byte)? == 0 {
                return Ok(None);
            }
            window[3] = byte[0];
            offset += 1;
        }
        if scanned > 0 {
            debug!("skipped {scanned} bytes to regain page sync at byte {offset}");
        }

        let mut header = [0u8; PAGE_HEADER_LEN];
        header[..4].copy_from_slice(b"OggS");
        if self.read_exact_or_eof(&mut header[4..])? < PAGE_HEADER_LEN - 4 {
            return Ok(None);
        }
        if header[4] != 0 {
            return Err(Error::format(format!("unsupported page version {}", header[4]))
                .at_offset(offset));
        }

        let header_type = header[5];
        let granule = u64::from_le_bytes([
            header[6], header[7], header[8], header[9], header[10], header[11], header[12],
            header[13],
        ]);
        let serial = u32::from_le_bytes([header[14], header[15], header[16], header[17]]);
        let stored_crc = u32::from_le_bytes([header[22], header[23], header[24], header[25]]);
        let segment_count = usize::from(header[26]);

        let mut segments = vec![0u8; segment_count];
        if self.read_exact_or_eof(&mut segments)? < segment_count {
            return Ok(None);
        }
        let data_len: usize = segments.iter().map(|&l| usize::from(l)).sum();
        if PAGE_HEADER_LEN + segment_count + data_len > MAX_PAGE_LEN {
            return Err(Error::format(format!(
                "page of {} bytes exceeds the maximum on-wire size",
                PAGE_HEADER_LEN + segment_count + data_len
            ))
            .at_offset(offset));
        }
        let mut data = vec![0u8; data_len];
        if self.read_exact_or_eof(&mut data)? < data_len {
            return Ok(None);
        }

        if self.crc_mode != CrcMode::Disabled {
            let mut page = Vec::with_capacity(PAGE_HEADER_LEN + segment_count + data_len);
            page.extend_from_slice(&header);
            page[22..26].fill(0);
            page.extend_from_slice(&segments);
            page.extend_from_slice(&data);
            let computed = crc32(&page);
            if computed != stored_crc {
                self.crc_errors += 1;
                if self.crc_errors > MAX_CRC_ERRORS {
                    return Err(Error::validation("too many page CRC failures")
                        .at_offset(offset));
                }
                warn!(
                    "page CRC mismatch at byte {offset}: stored {stored_crc:#010x}, computed {computed:#010x}"
                );
                if self.crc_mode == CrcMode::Strict {
                    // Drop the page and carry on from the next one.
                    return self.read_page();
                }
            }
        }

        Ok(Some(RawPage {
            header_type,
            granule,
            serial,
            segments,
            data,
            offset,
        }))
    }

    fn logical_index(&self, serial: u32) -> Option<usize> {
        self.logical.iter().position(|s| s.serial == serial)
    }

    /// Splits a page into completed packets and queues the audio ones.
    fn process_page(&mut self, page: &RawPage) -> Result<()> {
        let index = match self.logical_index(page.serial) {
            Some(index) => index,
            None if page.header_type & FLAG_BOS != 0 && !self.parsed => {
                let stream_id = self.logical.len() as u32;
                self.logical.push(LogicalStream::new(stream_id, page.serial));
                self.logical.len() - 1
            }
            None => {
                trace!("skipping page of unknown serial {:#010x}", page.serial);
                return Ok(());
            }
        };

        // Assemble packets from the lacing table.
        let mut completed: Vec<Vec<u8>> = Vec::new();
        {
            let stream = &mut self.logical[index];
            let continued = page.header_type & FLAG_CONTINUED != 0;
            if !continued && !stream.partial.is_empty() {
                debug!(
                    "dropping {} buffered bytes of an unfinished packet on stream {}",
                    stream.partial.len(),
                    stream.stream_id
                );
                stream.partial.clear();
            }
            let mut discard_first = continued && stream.partial.is_empty();

            let mut at = 0usize;
            for &lace in &page.segments {
                let take = usize::from(lace);
                stream
                    .partial
                    .extend_from_slice(page.data.get(at..at + take).unwrap_or(&[]));
                at += take;
                if lace < 255 {
                    let packet = std::mem::take(&mut stream.partial);
                    if discard_first {
                        discard_first = false;
                        trace!("discarding the tail of a packet begun before the seek point");
                    } else {
                        completed.push(packet);
                    }
                }
            }
            if page.header_type & FLAG_EOS != 0 {
                stream.finished = true;
            }
        }

        for packet in completed {
            let stream = &mut self.logical[index];
            if stream.headers_needed > 0 {
                if stream.header_packets.is_empty() {
                    // The first packet names the codec.
                    (stream.kind, stream.headers_needed) = if packet.starts_with(b"\x01vorbis") {
                        (OggCodecKind::Vorbis, 3)
                    } else if packet.starts_with(b"OpusHead") {
                        (OggCodecKind::Opus, 2)
                    } else {
                        (OggCodecKind::Unknown, 1)
                    };
                }
                stream.headers_needed -= 1;
                stream.header_packets.push(packet);
                continue;
            }
            if stream.kind == OggCodecKind::Unknown {
                continue;
            }

            let timestamp = stream.base_samples;
            let stream_id = stream.stream_id;
            let mut buffer = self.pool.acquire(packet.len().max(1))?;
            buffer.copy_from(&packet);
            self.pending
                .push_back(MediaChunk::new(buffer, stream_id, timestamp, page.offset));
        }

        if page.granule != u64::MAX {
            let stream = &mut self.logical[index];
            stream.base_samples = stream.granule_to_samples(page.granule);
        }
        Ok(())
    }

    /// Scans the stream tail for the primary stream's final granule.
    fn discover_duration(&mut self) -> Result<()> {
        let Some(primary) = self.primary else { return Ok(()) };
        let Some(total) = self.source.byte_len() else { return Ok(()) };
        if !self.source.is_seekable() {
            return Ok(());
        }
        let serial = self.logical[primary].serial;

        let origin = self.source.stream_position()?;
        let scan_len = TAIL_SCAN_LEN.min(total as usize);
        let start = total - scan_len as u64;
        let mut tail = vec![0u8; scan_len];
        self.source.seek(SeekFrom::Start(start))?;
        let got = self.read_exact_or_eof(&mut tail)?;
        tail.truncate(got);

        let mut best: Option<u64> = None;
        let mut at = 0usize;
        while let Some(found) = tail[at..].windows(4).position(|w| w == b"OggS") {
            let page_at = at + found;
            if let Some(header) = tail.get(page_at..page_at + PAGE_HEADER_LEN) {
                let granule = u64::from_le_bytes([
                    header[6], header[7], header[8], header[9], header[10], header[11],
                    header[12], header[13],
                ]);
                let page_serial =
                    u32::from_le_bytes([header[14], header[15], header[16], header[17]]);
                if page_serial == serial && granule != u64::MAX {
                    best = Some(granule);
                }
            }
            at = page_at + 4;
        }

        if let Some(granule) = best {
            let stream = &self.logical[primary];
            self.duration_samples = stream.granule_to_samples(granule);
            self.streams[primary].duration_samples = self.duration_samples;
        }
        self.source.seek(SeekFrom::Start(origin))?;
        Ok(())
    }

    /// Finds the first page at or after `from` belonging to the primary
    /// serial with a real granule. Returns its offset and granule.
    fn probe_page_granule(&mut self, from: u64, serial: u32) -> Result<Option<(u64, u64)>> {
        self.source.seek(SeekFrom::Start(from))?;
        loop {
            let Some(page) = self.read_page()? else { return Ok(None) };
            if page.serial == serial && page.granule != u64::MAX {
                return Ok(Some((page.offset, page.granule)));
            }
        }
    }
}

impl Demuxer for OggDemuxer {
    fn parse_container(&mut self) -> Result<()> {
        if self.parsed {
            return Ok(());
        }

        // Collect header packets; a handful of pages is always enough for
        // the formats handled here.
        for _ in 0..64 {
            let Some(page) = self.read_page()? else { break };
            self.process_page(&page)?;
            let headers_done =
                !self.logical.is_empty() && self.logical.iter().all(|s| s.headers_needed == 0);
            if headers_done {
                self.data_start = self.source.stream_position()?;
                break;
            }
        }
        if self.logical.is_empty() {
            return Err(Error::format("no logical streams found"));
        }

        // Describe each stream from its headers.
        let seekable = self.source.is_seekable();
        let mut streams = Vec::new();
        for stream in &mut self.logical {
            let mut info = match stream.kind {
                OggCodecKind::Vorbis => {
                    let ident = &stream.header_packets[0];
                    if ident.len() < 30 {
                        return Err(Error::format("Vorbis identification header too short"));
                    }
                    let channels = ident[11];
                    let sample_rate =
                        u32::from_le_bytes([ident[12], ident[13], ident[14], ident[15]]);
                    let mut info =
                        StreamInfo::audio(stream.stream_id, "vorbis", sample_rate, channels, 16);
                    let mut private = Vec::new();
                    for packet in &stream.header_packets {
                        private.extend_from_slice(&(packet.len() as u32).to_le_bytes());
                        private.extend_from_slice(packet);
                    }
                    info.codec_private = private;
                    if let Some(comments) = stream.header_packets.get(1) {
                        if comments.starts_with(b"\x03vorbis") {
                            let mut tags = Tags::default();
                            parse_vorbis_comments(&comments[7..], &mut tags);
                            info.tags = tags;
                        }
                    }
                    info
                }
                OggCodecKind::Opus => {
                    let head = OpusHead::parse(&stream.header_packets[0])?;
                    stream.pre_skip = u32::from(head.pre_skip);
                    let mut info = StreamInfo::audio(
                        stream.stream_id,
                        "opus",
                        crate::codec::opus::OPUS_SAMPLE_RATE,
                        head.channels,
                        16,
                    );
                    info.codec_private = stream.header_packets[0].clone();
                    if let Some(comments) = stream.header_packets.get(1) {
                        if comments.starts_with(b"OpusTags") {
                            let mut tags = Tags::default();
                            parse_vorbis_comments(&comments[8..], &mut tags);
                            info.tags = tags;
                        }
                    }
                    info
                }
                OggCodecKind::Unknown => {
                    warn!(
                        "stream {} carries an unrecognised codec; it will be skipped",
                        stream.stream_id
                    );
                    StreamInfo::audio(stream.stream_id, "unknown", 0, 0, 0)
                }
            };
            info.is_seekable = seekable;
            streams.push(info);
        }
        self.streams = streams;
        self.primary = self
            .logical
            .iter()
            .position(|s| s.kind != OggCodecKind::Unknown);
        self.parsed = true;

        self.discover_duration()?;
        if let Some(primary) = self.primary {
            let info = &self.streams[primary];
            debug!(
                "Ogg parsed: {} streams, primary {} ({}, {} Hz, {} ch, {} samples)",
                self.streams.len(),
                info.stream_id,
                info.codec_name,
                info.sample_rate,
                info.channels,
                info.duration_samples
            );
        }
        Ok(())
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_chunk(&mut self, stream_id: Option<u32>) -> Result<MediaChunk> {
        if !self.parsed {
            return Err(Error::format("container not parsed"));
        }

        loop {
            if self.last_error.is_some() || self.eof {
                return Ok(MediaChunk::end_of_stream(stream_id.unwrap_or(0)));
            }

            if let Some(chunk) = self.pending.pop_front() {
                match stream_id {
                    Some(want) if chunk.stream_id != want => continue,
                    _ => return Ok(chunk),
                }
            }

            match self.read_page() {
                Ok(Some(page)) => {
                    self.process_page(&page)?;
                    // Once the bound stream signalled end-of-stream, what
                    // is queued is all there will be.
                    if self.pending.is_empty()
                        && self.primary.is_some_and(|p| self.logical[p].finished)
                    {
                        self.eof = true;
                    }
                }
                Ok(None) => {
                    self.eof = true;
                }
                Err(e) if e.category == crate::error::Category::Io => return Err(e),
                Err(e) => {
                    // Capture the fault; subsequent reads return EOF.
                    warn!("page parsing failed: {e}");
                    self.last_error = Some(e);
                    self.eof = true;
                }
            }
        }
    }

    fn seek_to(&mut self, position_ms: u64) -> Result<()> {
        if !self.parsed {
            return Err(Error::format("container not parsed"));
        }
        let Some(primary) = self.primary else {
            return Err(Error::format("no decodable stream"));
        };
        if !self.source.is_seekable() {
            return Err(Error::io("source is not seekable"));
        }

        let serial = self.logical[primary].serial;
        let rate = u64::from(self.streams[primary].sample_rate.max(1));
        let target_samples = position_ms * rate / 1000;
        let target_granule =
            target_samples + u64::from(self.logical[primary].pre_skip);

        // Bisect on byte offsets, probing the granule of the first page
        // after each midpoint.
        let mut lo = self.data_start;
        let mut hi = self.source.byte_len().unwrap_or(self.data_start);
        while hi > lo && hi - lo > SEEK_LINEAR_WINDOW {
            let mid = lo + (hi - lo) / 2;
            match self.probe_page_granule(mid, serial)? {
                Some((_, granule)) if granule < target_granule => lo = mid,
                _ => hi = mid,
            }
        }

        // Forward scan: emit from the first page whose granule covers the
        // target.
        for stream in &mut self.logical {
            stream.partial.clear();
        }
        self.pending.clear();
        self.source.seek(SeekFrom::Start(lo))?;

        let mut base = if lo == self.data_start {
            0
        } else {
            // Unknown until the first granuled page goes by.
            u64::MAX
        };
        let mut landed = false;
        loop {
            let Some(page) = self.read_page()? else { break };
            if page.serial != serial {
                continue;
            }
            if page.granule != u64::MAX && page.granule >= target_granule {
                // This page's packets reach the target. Re-read it through
                // the normal path so its packets queue up.
                self.source.seek(SeekFrom::Start(page.offset))?;
                let stream = &mut self.logical[primary];
                stream.partial.clear();
                if base != u64::MAX {
                    stream.base_samples = stream.granule_to_samples(base);
                }
                landed = true;
                break;
            }
            base = page.granule;
        }

        self.eof = !landed
            || (self.duration_samples > 0 && target_samples >= self.duration_samples);
        trace!(
            "Ogg seek to {position_ms} ms: landed {landed}, base {:?}",
            self.logical[primary].base_samples
        );
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn duration_ms(&self) -> u64 {
        let Some(primary) = self.primary else { return 0 };
        self.streams[primary].duration_ms()
    }

    fn position_ms(&self) -> u64 {
        let Some(primary) = self.primary else { return 0 };
        let rate = u64::from(self.streams[primary].sample_rate.max(1));
        self.logical[primary].base_samples * 1000 / rate
    }

    fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn clear_error(&mut self) {
        self.last_error = None;
        self.crc_errors = 0;
        self.eof = false;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::crc32;

    /// Builds one Ogg page. `laced_packets` maps each packet to whether it
    /// continues on the next page (its final lacing value is then 255).
    pub(crate) fn build_page(
        serial: u32,
        sequence: u32,
        granule: u64,
        header_type: u8,
        packets: &[(&[u8], bool)],
    ) -> Vec<u8> {
        let mut segments = Vec::new();
        let mut data = Vec::new();
        for &(packet, continues) in packets {
            let mut remaining = packet.len();
            while remaining >= 255 {
                segments.push(255u8);
                remaining -= 255;
            }
            if continues {
                // A continuing packet must end the page on a full lacing
                // value.
                assert_eq!(remaining, 0, "continuing packet length must be a multiple of 255");
            } else {
                segments.push(remaining as u8);
            }
            data.extend_from_slice(packet);
        }

        let mut page = Vec::new();
        page.extend_from_slice(b"OggS");
        page.push(0); // version
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&serial.to_le_bytes());
        page.extend_from_slice(&sequence.to_le_bytes());
        page.extend_from_slice(&[0u8; 4]); // CRC placeholder
        page.push(segments.len() as u8);
        page.extend_from_slice(&segments);
        page.extend_from_slice(&data);

        let crc = crc32(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        page
    }

    /// A minimal Vorbis identification header packet.
    pub(crate) fn vorbis_ident(channels: u8, sample_rate: u32) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(b"\x01vorbis");
        packet.extend_from_slice(&0u32.to_le_bytes()); // version
        packet.push(channels);
        packet.extend_from_slice(&sample_rate.to_le_bytes());
        packet.extend_from_slice(&0u32.to_le_bytes()); // max bitrate
        packet.extend_from_slice(&0u32.to_le_bytes()); // nominal bitrate
        packet.extend_from_slice(&0u32.to_le_bytes()); // min bitrate
        packet.push(0xB8); // blocksizes 256/2048
        packet.push(1); // framing
        packet
    }

    /// A Vorbis comment header packet around the given block.
    pub(crate) fn vorbis_comment(block: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(b"\x03vorbis");
        packet.extend_from_slice(block);
        packet.push(1); // framing
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{build_page, vorbis_comment, vorbis_ident};
    use super::*;
    use std::io::Cursor;

    fn vorbis_headers(serial: u32) -> Vec<u8> {
        let ident = vorbis_ident(2, 44_100);
        let comment = vorbis_comment(&crate::demux::tests::vorbis_comment_block(&[
            ("ARTIST", "Band"),
            ("TITLE", "Song"),
        ]));
        let setup = {
            let mut p = b"\x05vorbis".to_vec();
            p.extend_from_slice(&[0u8; 32]);
            p
        };
        let mut out = build_page(serial, 0, 0, super::FLAG_BOS, &[(&ident, false)]);
        out.extend_from_slice(&build_page(
            serial,
            1,
            0,
            0,
            &[(&comment, false), (&setup, false)],
        ));
        out
    }

    fn demuxer_over(bytes: Vec<u8>) -> OggDemuxer {
        OggDemuxer::new(
            Box::new(Cursor::new(bytes)),
            ChunkPool::new(8 * 1024 * 1024),
            CrcMode::Enabled,
        )
    }

    #[test]
    fn crc32_matches_reference_vector() {
        // CRC-32/MPEG-2 family with init 0: check value of "123456789".
        assert_eq!(crc32(b"123456789"), 0x89A1_897F);
    }

    #[test]
    fn parses_vorbis_stream_and_tags() {
        let mut bytes = vorbis_headers(0x1234);
        bytes.extend_from_slice(&build_page(
            0x1234,
            2,
            1024,
            FLAG_EOS,
            &[(b"audio-packet", false)],
        ));

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");

        let info = &demuxer.streams()[0];
        assert_eq!(info.codec_name, "vorbis");
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.tags.artist.as_deref(), Some("Band"));
        assert_eq!(info.tags.title.as_deref(), Some("Song"));
        assert_eq!(info.duration_samples, 1024);

        // Codec private data carries the three header packets.
        let packets = crate::codec::vorbis::split_codec_private(&info.codec_private);
        assert_eq!(packets.len(), 3);
        assert!(packets[0].starts_with(b"\x01vorbis"));
        assert!(packets[2].starts_with(b"\x05vorbis"));
    }

    #[test]
    fn audio_packets_become_chunks() {
        let serial = 7;
        let mut bytes = vorbis_headers(serial);
        bytes.extend_from_slice(&build_page(
            serial,
            2,
            512,
            0,
            &[(b"packet-one", false), (b"packet-two", false)],
        ));
        bytes.extend_from_slice(&build_page(serial, 3, 1024, FLAG_EOS, &[(b"packet-three", false)]));

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");

        let one = demuxer.read_chunk(None).expect("read");
        assert_eq!(one.data(), b"packet-one");
        assert_eq!(one.timestamp_samples, 0);
        let two = demuxer.read_chunk(None).expect("read");
        assert_eq!(two.data(), b"packet-two");
        assert_eq!(two.timestamp_samples, 0);
        let three = demuxer.read_chunk(None).expect("read");
        assert_eq!(three.data(), b"packet-three");
        // The second page's granule dates the third packet.
        assert_eq!(three.timestamp_samples, 512);

        assert!(demuxer.read_chunk(None).expect("read").end_of_stream);
        assert!(demuxer.is_eof());
    }

    #[test]
    fn packets_reassemble_across_pages() {
        let serial = 9;
        let mut bytes = vorbis_headers(serial);
        // A 600-byte packet: 255 + 255 on the first page, 90 on the next.
        let big: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        bytes.extend_from_slice(&build_page(serial, 2, u64::MAX, 0, &[(&big[..510], true)]));
        bytes.extend_from_slice(&build_page(
            serial,
            3,
            2048,
            FLAG_CONTINUED | FLAG_EOS,
            &[(&big[510..], false)],
        ));

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");

        let chunk = demuxer.read_chunk(None).expect("read");
        assert_eq!(chunk.data(), &big[..]);
    }

    #[test]
    fn corrupt_page_crc_is_skipped_in_strict_mode() {
        let serial = 11;
        let mut bytes = vorbis_headers(serial);
        let mut bad = build_page(serial, 2, 512, 0, &[(b"bad-packet", false)]);
        let len = bad.len();
        bad[len - 2] ^= 0xFF;
        bytes.extend_from_slice(&bad);
        bytes.extend_from_slice(&build_page(serial, 3, 1024, FLAG_EOS, &[(b"good-packet", false)]));

        let mut demuxer = OggDemuxer::new(
            Box::new(Cursor::new(bytes)),
            ChunkPool::new(8 * 1024 * 1024),
            CrcMode::Strict,
        );
        demuxer.parse_container().expect("parse");

        let chunk = demuxer.read_chunk(None).expect("read");
        assert_eq!(chunk.data(), b"good-packet");
    }

    #[test]
    fn opus_stream_identified_with_pre_skip() {
        let serial = 13;
        let mut head = Vec::new();
        head.extend_from_slice(b"OpusHead");
        head.push(1);
        head.push(2); // channels
        head.extend_from_slice(&312u16.to_le_bytes()); // pre-skip
        head.extend_from_slice(&48_000u32.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes());
        head.push(0);

        let mut tags = b"OpusTags".to_vec();
        tags.extend_from_slice(&crate::demux::tests::vorbis_comment_block(&[(
            "TITLE", "Opus Song",
        )]));

        let mut bytes = build_page(serial, 0, 0, FLAG_BOS, &[(&head, false)]);
        bytes.extend_from_slice(&build_page(serial, 1, 0, 0, &[(&tags, false)]));
        // Granules include the pre-skip.
        bytes.extend_from_slice(&build_page(serial, 2, 312 + 960, 0, &[(b"pkt1", false)]));
        bytes.extend_from_slice(&build_page(
            serial,
            3,
            312 + 1920,
            FLAG_EOS,
            &[(b"pkt2", false)],
        ));

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");

        let info = &demuxer.streams()[0];
        assert_eq!(info.codec_name, "opus");
        assert_eq!(info.sample_rate, 48_000);
        assert_eq!(info.tags.title.as_deref(), Some("Opus Song"));
        // Duration excludes the pre-skip.
        assert_eq!(info.duration_samples, 1920);

        let first = demuxer.read_chunk(None).expect("read");
        assert_eq!(first.data(), b"pkt1");
        assert_eq!(first.timestamp_samples, 0);
        let second = demuxer.read_chunk(None).expect("read");
        assert_eq!(second.timestamp_samples, 960);
    }

    #[test]
    fn seek_lands_within_a_page() {
        let serial = 21;
        let mut bytes = vorbis_headers(serial);
        // 50 pages, one packet each, 1024 samples per packet.
        for page in 0..50u64 {
            let flag = if page == 49 { FLAG_EOS } else { 0 };
            let payload = vec![page as u8; 100];
            bytes.extend_from_slice(&build_page(
                serial,
                2 + page as u32,
                (page + 1) * 1024,
                flag,
                &[(&payload, false)],
            ));
        }

        let mut demuxer = demuxer_over(bytes);
        demuxer.parse_container().expect("parse");
        assert_eq!(demuxer.streams()[0].duration_samples, 50 * 1024);

        // 500 ms at 44.1 kHz is sample 22050, inside page 21 (samples
        // 21504..22528).
        demuxer.seek_to(500).expect("seek");
        let chunk = demuxer.read_chunk(None).expect("read");
        assert!(!chunk.end_of_stream);
        assert_eq!(chunk.data(), &vec![21u8; 100][..]);
        assert_eq!(chunk.timestamp_samples, 21 * 1024);
        assert!(chunk.timestamp_samples <= 22_050);
        assert!(22_050 - chunk.timestamp_samples <= 1024);

        // Seeking back to zero replays from the first audio packet.
        demuxer.seek_to(0).expect("seek");
        let chunk = demuxer.read_chunk(None).expect("read");
        assert_eq!(chunk.data(), &vec![0u8; 100][..]);
        assert_eq!(chunk.timestamp_samples, 0);
    }
}
