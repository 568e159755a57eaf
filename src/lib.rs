//! Local audio player built around an in-crate media pipeline.
//!
//! **minim** turns a byte stream, from a local file or an HTTP URL, into
//! scheduled 16-bit PCM frames ready for a pull-model audio sink. It
//! provides:
//!
//! # Core Features
//!
//! * **Container support**: Ogg, FLAC, ISO/MP4, RIFF/WAV, bare MPEG audio
//!   and headerless PCM
//! * **Codec support**: FLAC (in-crate bitstream decoder), Vorbis, Opus,
//!   MP3 and PCM/G.711
//! * **Streaming input**: seekable HTTP sources backed by byte-range GETs
//!   with read-ahead and reconnection
//! * **Sample-accurate seeking**: native seek tables where the container
//!   has them, in-memory frame indexes where it does not
//!
//! # Architecture
//!
//! The pipeline is layered, leaves first:
//!
//! * **I/O**
//!   - [`source`]: uniform seekable byte streams (file, HTTP)
//!   - [`pool`]: pooled, reference-counted data buffers
//!   - [`chunk`]: the coded unit that flows between components
//!
//! * **Format handling**
//!   - [`probe`]: magic-signature format detection
//!   - [`registry`]: format and codec registration tables
//!   - [`demux`]: container parsers producing chunks
//!   - [`codec`]: bitstream decoders producing PCM frames
//!
//! * **Playback**
//!   - [`stream`]: pairs a demuxer with its codec into a PCM byte stream
//!   - [`ringbuf`]: bounded ring between decode and the audio callback
//!   - [`player`]: worker thread, control surface and sink glue
//!
//! * **Support**
//!   - [`config`]: runtime settings
//!   - [`mod@error`]: error types and handling
//!   - [`util`]: general helper functions
//!
//! # Example
//!
//! ```rust,no_run
//! use minim::{config::Settings, player::Player};
//!
//! fn example() -> minim::error::Result<()> {
//!     let settings = Settings::default();
//!     let mut player = Player::new(settings)?;
//!     player.enqueue("sample.flac")?;
//!     player.run()
//! }
//! ```
//!
//! # Error Handling
//!
//! Errors are handled through the types in the [`mod@error`] module, with
//! most functions returning [`Result`](error::Result). Every error carries a
//! pipeline category and a recovery hint; demuxers and codecs recover from
//! what they can (re-sync, silence insertion, fallback parsing) and surface
//! the rest.
//!
//! # Concurrency
//!
//! The pipeline runs on parallel OS threads: the audio callback pulls
//! decoded PCM from a bounded ring and never blocks on I/O; a worker thread
//! owns the demuxer and codec and may block on the byte source; control
//! threads issue play/pause/seek commands through a mailbox. See [`player`]
//! for the full model.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![doc(test(attr(ignore)))]

#[macro_use]
extern crate log;

pub mod chunk;
pub mod codec;
pub mod config;
pub mod demux;
pub mod error;
pub mod player;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod ringbuf;
pub mod source;
pub mod stream;
pub mod util;
