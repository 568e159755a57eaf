//! The coded unit that flows between pipeline components.
//!
//! A [`MediaChunk`] carries exactly one decodable unit of one elementary
//! stream (one FLAC frame, one Ogg packet, one MP4 sample) together with
//! its stream identity, timing and provenance. Chunks either hold a payload
//! or are the empty end-of-stream marker; nothing in between.

use crate::pool::PooledBuffer;

/// One coded unit of one elementary stream.
///
/// Owns a reference to a pooled buffer. Cloning a chunk aliases the payload
/// without copying; the buffer returns to the pool when the last clone
/// drops.
///
/// # Invariants
///
/// * A chunk is either empty (`end_of_stream` set, no payload) or contains
///   exactly one decodable unit per the codec's grammar.
/// * Per stream, `timestamp_samples` is monotone non-decreasing except
///   immediately after a seek, which starts a fresh monotone run.
#[derive(Clone, Debug)]
pub struct MediaChunk {
    /// Payload buffer; `None` only for the end-of-stream marker.
    buffer: Option<PooledBuffer>,

    /// Identifies the producing elementary stream within its demuxer.
    pub stream_id: u32,

    /// Sample count from the start of the stream at which this unit begins.
    pub timestamp_samples: u64,

    /// Byte offset in the source this unit was read from.
    pub file_offset: u64,

    /// Whether decoding may start at this unit. True for every frame of the
    /// audio codecs handled here.
    pub is_keyframe: bool,

    /// Whether this chunk marks the end of its scope.
    pub end_of_stream: bool,
}

impl MediaChunk {
    /// Creates a chunk around a filled buffer.
    #[must_use]
    pub fn new(buffer: PooledBuffer, stream_id: u32, timestamp_samples: u64, file_offset: u64) -> Self {
        Self {
            buffer: Some(buffer),
            stream_id,
            timestamp_samples,
            file_offset,
            is_keyframe: true,
            end_of_stream: false,
        }
    }

    /// Creates the empty end-of-stream marker for a stream.
    #[must_use]
    pub fn end_of_stream(stream_id: u32) -> Self {
        Self {
            buffer: None,
            stream_id,
            timestamp_samples: 0,
            file_offset: 0,
            is_keyframe: false,
            end_of_stream: true,
        }
    }

    /// The payload bytes; empty for the end-of-stream marker.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], PooledBuffer::as_slice)
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, PooledBuffer::len)
    }

    /// Whether the chunk carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ChunkPool;

    #[test]
    fn eof_marker_is_empty() {
        let eof = MediaChunk::end_of_stream(3);
        assert!(eof.end_of_stream);
        assert!(eof.is_empty());
        assert_eq!(eof.stream_id, 3);
        assert_eq!(eof.data(), &[] as &[u8]);
    }

    #[test]
    fn chunk_exposes_payload() {
        let pool = ChunkPool::new(1024 * 1024);
        let mut buf = pool.acquire(16).expect("acquire");
        buf.copy_from(b"frame");
        let chunk = MediaChunk::new(buf, 0, 4096, 42);
        assert!(!chunk.end_of_stream);
        assert!(chunk.is_keyframe);
        assert_eq!(chunk.data(), b"frame");
        assert_eq!(chunk.len(), 5);
        assert_eq!(chunk.timestamp_samples, 4096);
        assert_eq!(chunk.file_offset, 42);
    }
}
