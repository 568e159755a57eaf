//! MP3 decode driver.
//!
//! A thin layer over minimp3. MPEG Layer III frames carry a bit reservoir
//! that can reference data from earlier frames, so the decoder keeps a
//! persistent byte queue: each chunk is appended and minimp3 pulls frames
//! out of the queue at its own pace.

use std::{
    collections::VecDeque,
    io::Read,
    sync::{Arc, Mutex},
};

use minimp3::{Decoder, Frame};

use crate::{
    chunk::MediaChunk,
    codec::{AudioFrame, Codec, FailureCounter},
    demux::StreamInfo,
    error::{Error, Result},
};

/// Samples per channel in an MPEG-1 Layer III frame.
const SAMPLES_PER_FRAME: usize = 1152;

/// Shared byte queue the decoder reads from.
#[derive(Clone, Default)]
struct ByteQueue {
    bytes: Arc<Mutex<VecDeque<u8>>>,
}

impl ByteQueue {
    fn push(&self, data: &[u8]) {
        if let Ok(mut bytes) = self.bytes.lock() {
            bytes.extend(data);
        }
    }

    fn clear(&self) {
        if let Ok(mut bytes) = self.bytes.lock() {
            bytes.clear();
        }
    }
}

impl Read for ByteQueue {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Ok(mut bytes) = self.bytes.lock() else {
            return Ok(0);
        };
        let n = buf.len().min(bytes.len());
        for slot in buf.iter_mut().take(n) {
            *slot = bytes.pop_front().unwrap_or(0);
        }
        Ok(n)
    }
}

/// MP3 decoder driving minimp3 frame by frame.
pub struct Mp3Codec {
    queue: ByteQueue,
    decoder: Option<Decoder<ByteQueue>>,
    sample_rate: u32,
    channels: u8,
    failures: FailureCounter,
}

impl Mp3Codec {
    #[must_use]
    pub fn new(info: &StreamInfo) -> Self {
        Self {
            queue: ByteQueue::default(),
            decoder: None,
            sample_rate: info.sample_rate,
            channels: info.channels,
            failures: FailureCounter::default(),
        }
    }

    fn emit(&mut self, decoded: &Frame, frame: &mut AudioFrame) {
        self.sample_rate = decoded.sample_rate.max(0) as u32;
        self.channels = decoded.channels.clamp(0, 8) as u8;
        frame.sample_rate = self.sample_rate;
        frame.channels = self.channels;
        frame.pcm.extend_from_slice(&decoded.data);
    }
}

impl Codec for Mp3Codec {
    fn initialize(&mut self) -> Result<()> {
        self.queue.clear();
        self.decoder = Some(Decoder::new(self.queue.clone()));
        Ok(())
    }

    fn decode(&mut self, chunk: &MediaChunk, frame: &mut AudioFrame) -> Result<()> {
        if self.decoder.is_none() {
            return Err(Error::exception("MP3 codec driven before initialize"));
        }

        frame.pcm.clear();
        frame.sample_rate = self.sample_rate;
        frame.channels = self.channels;
        if chunk.end_of_stream {
            return Ok(());
        }

        self.queue.push(chunk.data());

        // Drain every frame the queue now completes; the reservoir can
        // hold a frame back until the next chunk arrives.
        loop {
            let Some(decoder) = self.decoder.as_mut() else { break };
            match decoder.next_frame() {
                Ok(decoded) => {
                    self.failures.success();
                    self.emit(&decoded, frame);
                }
                Err(minimp3::Error::Eof) => break,
                Err(minimp3::Error::SkippedData) => {}
                Err(e) => {
                    warn!("MPEG frame at byte {} undecodable: {e}", chunk.file_offset);
                    if frame.is_empty() {
                        frame.fill_silence(SAMPLES_PER_FRAME, self.sample_rate, self.channels);
                    }
                    if self.failures.failure() {
                        debug!("resetting MP3 decoder after repeated failures");
                        self.reset();
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    fn reset(&mut self) {
        // The queue may hold bytes from before the seek; both it and the
        // reservoir state must go.
        self.queue.clear();
        self.decoder = Some(Decoder::new(self.queue.clone()));
        self.failures.success();
    }

    fn codec_name(&self) -> &'static str {
        "mp3"
    }

    fn max_samples_per_frame(&self) -> usize {
        SAMPLES_PER_FRAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ChunkPool;

    #[test]
    fn byte_queue_reads_in_order() {
        let queue = ByteQueue::default();
        queue.push(b"abc");
        queue.push(b"def");

        let mut reader = queue.clone();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).expect("read"), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn decode_before_initialize_is_an_error() {
        let info = StreamInfo::audio(0, "mp3", 44_100, 2, 16);
        let mut codec = Mp3Codec::new(&info);
        let mut frame = AudioFrame::new();
        assert!(codec.decode(&MediaChunk::end_of_stream(0), &mut frame).is_err());
    }

    #[test]
    fn garbage_chunk_produces_no_panic() {
        let info = StreamInfo::audio(0, "mp3", 44_100, 2, 16);
        let mut codec = Mp3Codec::new(&info);
        codec.initialize().expect("initialize");

        let pool = ChunkPool::new(1024 * 1024);
        let mut buf = pool.acquire(64).expect("acquire");
        buf.copy_from(&[0x55; 64]);
        let chunk = MediaChunk::new(buf, 0, 0, 0);

        let mut frame = AudioFrame::new();
        codec.decode(&chunk, &mut frame).expect("decode");
    }
}
