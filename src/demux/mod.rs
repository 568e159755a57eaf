//! Container demuxers: byte streams in, [`MediaChunk`]s out.
//!
//! One module per container (Ogg, FLAC, ISO/MP4, RIFF/WAV, bare MPEG
//! audio and headerless PCM), all implementing the [`Demuxer`] capability.
//! A demuxer parses headers and metadata once, then yields chunks in
//! stream order until end of stream, supporting best-effort sample-accurate
//! seeks along the way.
//!
//! # Lifecycle
//!
//! Constructed over a [`ByteSource`](crate::source::ByteSource) it owns,
//! a demuxer moves `Constructed → Parsed → Reading ⇄ Seeking` and is closed
//! by dropping it. [`Demuxer::parse_container`] is one-shot and absorbing:
//! once it has succeeded the stream list is immutable.
//!
//! # Seeking strategies
//!
//! Implementations pick the strategies that apply, in priority order:
//!
//! 1. Format-native index (FLAC seek table, MP4 sample tables)
//! 2. In-memory [`frame_index::FrameIndex`] built during parse and playback
//! 3. Bisection on byte offset where frame durations are bounded
//! 4. Linear scan from the nearest known position
//!
//! # Failure semantics
//!
//! Format errors with a `SkipSection` hint re-sync forward within a bounded
//! window and are counted; past a threshold the demuxer degrades or fails.
//! I/O errors propagate. Unexpected faults are captured into
//! [`Demuxer::last_error`], state stays valid, and subsequent chunks are
//! end-of-stream markers.

use crate::{chunk::MediaChunk, error::Error, error::Result};

pub mod flac;
pub mod frame_index;
pub mod mp4;
pub mod mpeg;
pub mod ogg;
pub mod raw;
pub mod wav;

/// Kind of content an elementary stream carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CodecType {
    /// Decodable by the [`codec`](crate::codec) family.
    Audio,
}

/// Free-text metadata attached to a stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tags {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub comment: Option<String>,
}

impl Tags {
    /// Whether no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artist.is_none() && self.title.is_none() && self.album.is_none() && self.comment.is_none()
    }
}

/// Describes one elementary stream inside a container.
///
/// Immutable after [`Demuxer::parse_container`] completes.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    /// Unique within the producing demuxer.
    pub stream_id: u32,

    pub codec_type: CodecType,

    /// Codec tag string used for registry lookup, e.g. `"flac"`,
    /// `"vorbis"`, `"pcm_s16le"`.
    pub codec_name: String,

    /// Numeric codec hint from the container (RIFF format tag, MP4
    /// fourcc), zero when the container has none.
    pub codec_tag: u32,

    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,

    /// Average bitrate in bits per second; zero when unknown.
    pub bitrate: u32,

    /// Total stream length in samples; zero when unknown.
    pub duration_samples: u64,

    pub is_seekable: bool,

    /// Whether the container carries a native seek index for this stream.
    pub has_seektable: bool,

    pub tags: Tags,

    /// Opaque codec initialisation bytes (FLAC STREAMINFO, Ogg header
    /// packets, MP4 decoder config).
    pub codec_private: Vec<u8>,
}

impl StreamInfo {
    /// Creates an audio stream description with the fields every container
    /// knows; the rest start empty.
    #[must_use]
    pub fn audio(stream_id: u32, codec_name: &str, sample_rate: u32, channels: u8, bits_per_sample: u8) -> Self {
        Self {
            stream_id,
            codec_type: CodecType::Audio,
            codec_name: codec_name.to_string(),
            codec_tag: 0,
            sample_rate,
            channels,
            bits_per_sample,
            bitrate: 0,
            duration_samples: 0,
            is_seekable: false,
            has_seektable: false,
            tags: Tags::default(),
            codec_private: Vec::new(),
        }
    }

    /// Whether the description is complete enough to decode.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0
            && (1..=8).contains(&self.channels)
            && (4..=32).contains(&self.bits_per_sample)
    }

    /// Total stream length in milliseconds; zero when unknown.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.duration_samples * 1000 / u64::from(self.sample_rate)
    }
}

/// The demuxer capability.
///
/// All methods take `&mut self`; exclusive access is enforced by ownership
/// and concurrency lives one layer up, in the player's worker thread.
pub trait Demuxer: Send {
    /// Parses the container: validates the signature, loads metadata,
    /// enumerates streams and may build a bounded seek index.
    ///
    /// One-shot; absorbing on first success.
    ///
    /// # Errors
    ///
    /// Format errors for structural violations, I/O errors from the byte
    /// source.
    fn parse_container(&mut self) -> Result<()>;

    /// The streams found by [`parse_container`](Self::parse_container).
    fn streams(&self) -> &[StreamInfo];

    /// Looks up one stream by id.
    fn stream_info(&self, stream_id: u32) -> Option<&StreamInfo> {
        self.streams().iter().find(|s| s.stream_id == stream_id)
    }

    /// The first audio stream, which playback binds to.
    fn default_audio_stream(&self) -> Option<&StreamInfo> {
        self.streams().iter().find(|s| s.codec_type == CodecType::Audio)
    }

    /// Returns the next chunk in interleaved order, or for the requested
    /// stream only. An empty chunk signals end of stream for that scope.
    ///
    /// # Errors
    ///
    /// I/O errors propagate; format errors surface once their recovery
    /// budget is exhausted.
    fn read_chunk(&mut self, stream_id: Option<u32>) -> Result<MediaChunk>;

    /// Seeks so the next chunk carries the first sample at or after the
    /// target. Clears the EOF condition unless the target is at or past
    /// the duration.
    ///
    /// # Errors
    ///
    /// Fails on unseekable sources or I/O failure; the stream position is
    /// then unspecified until the next successful seek.
    fn seek_to(&mut self, position_ms: u64) -> Result<()>;

    /// Whether the last read reached end of stream.
    fn is_eof(&self) -> bool;

    /// Container duration in milliseconds; zero when unknown.
    fn duration_ms(&self) -> u64;

    /// Current position in milliseconds.
    fn position_ms(&self) -> u64;

    /// The last captured fault, if any.
    ///
    /// Set when an unexpected error was captured during chunk production;
    /// while set, [`read_chunk`](Self::read_chunk) keeps returning
    /// end-of-stream markers.
    fn last_error(&self) -> Option<&Error>;

    /// Clears the captured fault.
    fn clear_error(&mut self);
}

/// Parses a Vorbis-comment block (as used by Ogg headers and FLAC
/// metadata) into tags.
///
/// Layout: vendor length (u32-le) and string, then a comment count and
/// `KEY=value` entries. Unknown keys are ignored; parse trouble just stops
/// the walk, since tags are best-effort.
pub(crate) fn parse_vorbis_comments(data: &[u8], tags: &mut Tags) {
    let read_u32 = |d: &[u8], at: usize| -> Option<u32> {
        d.get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };

    let Some(vendor_len) = read_u32(data, 0) else { return };
    let mut at = 4 + vendor_len as usize;
    let Some(count) = read_u32(data, at) else { return };
    at += 4;

    for _ in 0..count {
        let Some(len) = read_u32(data, at) else { return };
        at += 4;
        let Some(entry) = data.get(at..at + len as usize) else { return };
        at += len as usize;

        let Some((key, value)) = std::str::from_utf8(entry).ok().and_then(|s| s.split_once('='))
        else {
            continue;
        };
        let value = value.to_string();
        match key.to_ascii_uppercase().as_str() {
            "ARTIST" => tags.artist = Some(value),
            "TITLE" => tags.title = Some(value),
            "ALBUM" => tags.album = Some(value),
            "COMMENT" | "DESCRIPTION" => tags.comment = Some(value),
            _ => {}
        }
    }
}
