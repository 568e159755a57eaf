//! Bitstream decoders: [`MediaChunk`]s in, PCM frames out.
//!
//! One module per codec, FLAC (decoded in-crate), Vorbis, Opus, MP3 and
//! PCM/G.711, all implementing the [`Codec`] capability. A codec consumes
//! exactly one chunk per [`Codec::decode`] call and produces interleaved
//! 16-bit PCM at the stream's native rate.
//!
//! # Memory discipline
//!
//! [`Codec::initialize`] sizes every buffer from the worst case the
//! [`StreamInfo`](crate::demux::StreamInfo) admits; steady-state decoding
//! performs no allocation. Output is written into a caller-owned
//! [`AudioFrame`] whose storage is reused across calls.
//!
//! # Failure recovery
//!
//! On a recoverable decode failure the codec emits a silent frame of the
//! expected duration so downstream timing holds, and counts the failure.
//! After [`MAX_CONSECUTIVE_FAILURES`] consecutive failures it resets
//! itself to the initialised state.

use crate::{chunk::MediaChunk, error::Result};

pub mod flac;
pub mod mp3;
pub mod opus;
pub mod pcm;
pub mod vorbis;

/// Consecutive decode failures a codec tolerates before resetting itself.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 4;

/// Decoded PCM ready for the sink.
///
/// Interleaved 16-bit samples. Produced exclusively by codecs; the caller
/// owns the frame and its storage is reused across decode calls.
#[derive(Clone, Debug, Default)]
pub struct AudioFrame {
    /// Interleaved samples, `sample_frame_count × channels` long.
    pub pcm: Vec<i16>,

    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioFrame {
    /// Creates an empty frame.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sample frames (samples per channel).
    #[must_use]
    pub fn sample_frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.pcm.len() / usize::from(self.channels)
    }

    /// Whether the frame holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    /// Empties the frame, keeping its allocation.
    pub fn clear(&mut self) {
        self.pcm.clear();
    }

    /// Fills the frame with `frames` sample frames of silence.
    ///
    /// Used by codecs to preserve timing across a failed decode.
    pub fn fill_silence(&mut self, frames: usize, sample_rate: u32, channels: u8) {
        self.pcm.clear();
        self.pcm.resize(frames * usize::from(channels), 0);
        self.sample_rate = sample_rate;
        self.channels = channels;
    }
}

/// The codec capability.
pub trait Codec: Send {
    /// Pre-allocates buffers from the stream's worst case.
    ///
    /// Must be called once before [`decode`](Self::decode); steady-state
    /// allocation afterwards is forbidden.
    ///
    /// # Errors
    ///
    /// Format errors when the codec-private initialisation data is
    /// malformed or unsupported.
    fn initialize(&mut self) -> Result<()>;

    /// Decodes exactly one chunk into `frame`.
    ///
    /// On recoverable failure the codec writes a silent frame that
    /// maintains timing and recovers internally; the error surfaces only
    /// through logs and the failure counter.
    ///
    /// # Errors
    ///
    /// Unrecoverable failures only: unsupported stream parameters or a
    /// codec driven before [`initialize`](Self::initialize).
    fn decode(&mut self, chunk: &MediaChunk, frame: &mut AudioFrame) -> Result<()>;

    /// Drains any samples the codec still buffers.
    ///
    /// # Errors
    ///
    /// As for [`decode`](Self::decode); the default drains nothing.
    fn flush(&mut self, frame: &mut AudioFrame) -> Result<()> {
        frame.clear();
        Ok(())
    }

    /// Returns the codec to the initialised state without reallocating.
    ///
    /// Required after a demuxer seek.
    fn reset(&mut self);

    /// The canonical name this codec registers under.
    fn codec_name(&self) -> &'static str;

    /// Whether this codec can decode streams tagged `codec_name`.
    fn can_decode(&self, codec_name: &str) -> bool {
        codec_name == self.codec_name()
    }

    /// Worst-case samples (per channel) a single decoded chunk can
    /// produce, used by callers to pre-reserve output storage.
    fn max_samples_per_frame(&self) -> usize;
}

/// Tracks consecutive decode failures for the auto-reset policy.
#[derive(Debug, Default)]
pub struct FailureCounter {
    consecutive: u32,
    total: u64,
}

impl FailureCounter {
    /// Records a failure; returns true when the auto-reset threshold is
    /// reached (and restarts the consecutive count).
    pub fn failure(&mut self) -> bool {
        self.total += 1;
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_FAILURES {
            self.consecutive = 0;
            return true;
        }
        false
    }

    /// Records a successful decode, ending any failure run.
    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Failures since construction.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Triangular-PDF dither source for bit-depth reduction.
///
/// Summing two uniform variates yields the triangular distribution that
/// converts truncation distortion into uncorrelated noise.
#[derive(Debug)]
pub struct TriangularDither {
    rng: fastrand::Rng,
}

impl Default for TriangularDither {
    fn default() -> Self {
        Self::new()
    }
}

impl TriangularDither {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    /// One triangular variate in `(-span, span)`.
    fn next(&mut self, span: i32) -> i32 {
        self.rng.i32(0..span) - self.rng.i32(0..span)
    }
}

/// Converts one sample of the given significant bit depth to i16.
///
/// * depths below 16 shift left into full scale,
/// * 16 passes through,
/// * 17–24 apply triangular dither before the down-shift and saturate,
/// * above 24 the quantisation step already dwarfs the dither amplitude,
///   so the sample is arithmetic-shifted with saturation.
#[must_use]
pub fn sample_to_i16(sample: i32, bits: u8, dither: &mut TriangularDither) -> i16 {
    match bits {
        0..=15 => (sample << (16 - bits)) as i16,
        16 => sample as i16,
        17..=24 => {
            let shift = bits - 16;
            let dithered = sample + dither.next(1 << shift);
            (dithered >> shift).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
        }
        _ => {
            let shift = bits.min(32) - 16;
            (sample >> shift).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
        }
    }
}
