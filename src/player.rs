//! Playback engine and audio-callback glue.
//!
//! # Threads
//!
//! Three threads cooperate per track:
//!
//! * The **audio callback** (rodio's output thread) pulls samples from
//!   the decoded-PCM ring through [`RingSource`]. It never blocks: on
//!   contention or underflow it emits silence and the ring's underflow
//!   flag is raised.
//! * The **worker thread** owns the [`DemuxedStream`]. It decodes into
//!   the ring (blocking when the ring is full) and watches the command
//!   mailbox.
//! * The **control thread** (whoever holds [`Controls`]) issues pause,
//!   resume, seek and stop. A seek bumps a generation counter before the
//!   command is queued; the worker discards any decode result from a
//!   stale generation, which is how a pending seek preempts an
//!   in-progress read.
//!
//! # State
//!
//! The now-playing metadata lives in one [`PlaybackState`] value owned by
//! the player; observers get a clone and no pipeline code runs callbacks
//! while holding a lock.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    config::Settings,
    error::{Error, Result},
    pool::ChunkPool,
    probe::{self, Hint},
    registry::Registry,
    ringbuf::PcmRing,
    source,
    stream::DemuxedStream,
    util::format_ms,
};

/// Samples decoded per worker iteration.
const WORKER_BLOCK: usize = 4096;

/// Samples the callback pulls from the ring at a time.
const CALLBACK_BLOCK: usize = 1024;

/// Snapshot of what is playing.
///
/// The pipeline never reads mutable global state; each open hands a copy
/// of this to whoever asks.
#[derive(Clone, Debug, Default)]
pub struct PlaybackState {
    pub uri: String,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub duration_ms: u64,
    pub playing: bool,
}

/// Commands the control surface sends to the worker.
#[derive(Clone, Copy, Debug)]
enum Command {
    SeekMs(u64),
    Stop,
}

/// Control surface for a running player.
///
/// Cheap to clone; safe to use from any thread.
#[derive(Clone)]
pub struct Controls {
    commands: Sender<Command>,
    ring: PcmRing,
    generation: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
}

impl Controls {
    /// Pauses output; the callback emits silence without consuming the
    /// ring.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resumes output.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Requests a seek. Buffered audio is dropped immediately; the worker
    /// abandons any in-flight decode of the old position.
    pub fn seek_to_ms(&self, position_ms: u64) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let _ = self.commands.send(Command::SeekMs(position_ms));
        // Free the ring so a worker blocked on push wakes promptly.
        self.ring.clear();
    }

    /// Stops the current track.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        self.ring.clear();
        self.ring.close();
    }
}

/// Pull-model bridge from the ring to the audio sink.
///
/// Never blocks; serves silence on underflow or while paused.
struct RingSource {
    ring: PcmRing,
    paused: Arc<AtomicBool>,
    sample_rate: u32,
    channels: u16,
    local: Vec<i16>,
    pos: usize,
}

impl RingSource {
    fn new(ring: PcmRing, paused: Arc<AtomicBool>, sample_rate: u32, channels: u16) -> Self {
        Self {
            ring,
            paused,
            sample_rate,
            channels,
            local: Vec::with_capacity(CALLBACK_BLOCK),
            pos: 0,
        }
    }
}

impl Iterator for RingSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if self.pos < self.local.len() {
            let sample = self.local[self.pos];
            self.pos += 1;
            return Some(sample);
        }

        if self.paused.load(Ordering::Acquire) {
            // Paused: keep the device fed without consuming the ring.
            self.local.clear();
            self.local.resize(CALLBACK_BLOCK, 0);
            self.pos = 1;
            return Some(0);
        }

        self.local.clear();
        self.local.resize(CALLBACK_BLOCK, 0);
        let got = self.ring.pop_slice(&mut self.local);
        if got == 0 && self.ring.is_closed() && self.ring.is_empty() {
            return None;
        }
        // A short pop leaves the tail zeroed: silence for this buffer.
        self.pos = 1;
        Some(self.local[0])
    }
}

impl rodio::Source for RingSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.local.len().saturating_sub(self.pos).max(1))
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Local audio player over the media pipeline.
pub struct Player {
    settings: Settings,
    pool: ChunkPool,
    registry: &'static Registry,

    queue: VecDeque<String>,
    state: Arc<Mutex<PlaybackState>>,

    commands: Sender<Command>,
    /// Shared with each track's worker thread; a `Receiver` is not
    /// `Sync`, so the workers take it through a mutex.
    mailbox: Arc<Mutex<Receiver<Command>>>,
    ring: PcmRing,
    generation: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
}

impl Player {
    /// Creates a player with the given settings.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for device pre-checks.
    pub fn new(settings: Settings) -> Result<Self> {
        let (commands, mailbox) = mpsc::channel();
        let ring = PcmRing::new(settings.ring_capacity * 2);
        Ok(Self {
            pool: ChunkPool::new(settings.pool_cap_bytes),
            registry: Registry::global(),
            queue: VecDeque::new(),
            state: Arc::new(Mutex::new(PlaybackState::default())),
            commands,
            mailbox: Arc::new(Mutex::new(mailbox)),
            ring,
            generation: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(false)),
            settings,
        })
    }

    /// Adds a track to the play queue.
    ///
    /// # Errors
    ///
    /// Currently infallible; the URI is validated at open time.
    pub fn enqueue(&mut self, uri: &str) -> Result<()> {
        self.queue.push_back(uri.to_string());
        Ok(())
    }

    /// The control surface for this player.
    #[must_use]
    pub fn controls(&self) -> Controls {
        Controls {
            commands: self.commands.clone(),
            ring: self.ring.clone(),
            generation: Arc::clone(&self.generation),
            paused: Arc::clone(&self.paused),
        }
    }

    /// A copy of the now-playing state.
    #[must_use]
    pub fn now_playing(&self) -> PlaybackState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Builds the pipeline for one target: source, probe, demuxer, codec.
    ///
    /// # Errors
    ///
    /// Fails when the target cannot be opened, its format is not
    /// recognised, or no codec is registered for its stream.
    pub fn open_stream(&self, uri: &str) -> Result<DemuxedStream> {
        let mut byte_source = source::open(uri, &self.settings)?;
        let hint = Hint::from_target(uri);
        let format = probe::identify(byte_source.as_mut(), &hint, self.registry)?
            .ok_or_else(|| Error::format(format!("unrecognised format: {uri}")))?;
        info!("{uri}: detected {format}");

        let demuxer =
            self.registry
                .create_demuxer(&format, byte_source, self.pool.clone(), &self.settings)?;
        DemuxedStream::open(demuxer, self.registry, &self.settings)
    }

    /// Publishes the now-playing snapshot for a freshly opened stream.
    fn publish_state(&self, uri: &str, stream: &DemuxedStream) {
        let tags = &stream.info().tags;
        let snapshot = PlaybackState {
            uri: uri.to_string(),
            artist: tags.artist.clone(),
            title: tags.title.clone(),
            album: tags.album.clone(),
            duration_ms: stream.duration_ms(),
            playing: true,
        };
        if let Ok(mut state) = self.state.lock() {
            *state = snapshot;
        }
    }

    /// The worker loop: decode into the ring until end of stream, a stop
    /// command, or a fatal pipeline error.
    fn decode_worker(
        mut stream: DemuxedStream,
        ring: &PcmRing,
        mailbox: &Mutex<Receiver<Command>>,
        generation: &AtomicU64,
    ) {
        let mut buf = vec![0i16; WORKER_BLOCK];
        loop {
            loop {
                let command = match mailbox.lock() {
                    Ok(mailbox) => mailbox.try_recv().ok(),
                    Err(_) => None,
                };
                let Some(command) = command else { break };
                match command {
                    Command::SeekMs(position_ms) => {
                        ring.clear();
                        match stream.seek_to_ms(position_ms) {
                            Ok(()) => debug!("seeked to {}", format_ms(position_ms)),
                            Err(e) => warn!("seek to {position_ms} ms failed: {e}"),
                        }
                    }
                    Command::Stop => {
                        ring.close();
                        return;
                    }
                }
            }

            let generation_before = generation.load(Ordering::Acquire);
            match stream.pull_samples(&mut buf) {
                Ok(0) => {
                    ring.close();
                    return;
                }
                Ok(n) => {
                    if generation.load(Ordering::Acquire) != generation_before {
                        // A seek arrived while decoding; this block belongs
                        // to the old position.
                        trace!("discarding {n} samples decoded across a seek");
                        continue;
                    }
                    if !ring.push_slice(&buf[..n]) {
                        return;
                    }
                }
                Err(e) => {
                    error!("pipeline failed: {e}");
                    ring.close();
                    return;
                }
            }
        }
    }

    /// Plays the queue to completion.
    ///
    /// Returns once every queued track has played (or been skipped after
    /// an error). Opening the audio device is the only fatal failure.
    ///
    /// # Errors
    ///
    /// Fails when the audio output device cannot be opened, or when every
    /// queued track failed to open.
    pub fn run(&mut self) -> Result<()> {
        let (_output, handle) = rodio::OutputStream::try_default()
            .map_err(|e| Error::io(format!("audio device unavailable: {e}")))?;
        let sink = rodio::Sink::try_new(&handle)
            .map_err(|e| Error::io(format!("audio sink creation failed: {e}")))?;

        let mut played = 0usize;
        let total = self.queue.len();
        while let Some(uri) = self.queue.pop_front() {
            let stream = match self.open_stream(&uri) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("skipping {uri}: {e}");
                    continue;
                }
            };

            self.publish_state(&uri, &stream);
            let state = self.now_playing();
            info!(
                "playing {} ({})",
                state.title.as_deref().unwrap_or(&uri),
                format_ms(state.duration_ms)
            );

            // Prime the spec from the first decoded frame where possible.
            let (sample_rate, channels) = stream.spec();
            self.ring.reopen();
            let source = RingSource::new(
                self.ring.clone(),
                Arc::clone(&self.paused),
                sample_rate,
                u16::from(channels),
            );
            sink.append(source);
            sink.play();

            let ring = self.ring.clone();
            let generation = Arc::clone(&self.generation);
            let mailbox = Arc::clone(&self.mailbox);
            let worker = thread::spawn(move || {
                Self::decode_worker(stream, &ring, &mailbox, &generation);
            });

            sink.sleep_until_end();
            worker
                .join()
                .map_err(|_| Error::exception("decode worker panicked"))?;

            if self.ring.take_underflow() {
                debug!("underflow occurred during {uri}");
            }
            played += 1;

            if let Ok(mut state) = self.state.lock() {
                state.playing = false;
            }
        }

        if played == 0 && total > 0 {
            return Err(Error::format("no queued track could be played"));
        }
        info!("queue finished: {played}/{total} tracks played");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::wav::testing::build_wav;
    use std::io::Write;

    fn temp_wav(samples: &[i16]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".wav")
            .tempfile()
            .expect("tempfile");
        file.write_all(&build_wav(8_000, 1, samples)).expect("write");
        file
    }

    #[test]
    fn open_stream_builds_the_full_pipeline() {
        let samples: Vec<i16> = (0..4000).map(|i| i as i16).collect();
        let file = temp_wav(&samples);

        let player = Player::new(Settings::default()).expect("player");
        let mut stream = player
            .open_stream(file.path().to_str().expect("path"))
            .expect("open");

        let mut out = vec![0i16; 4000];
        assert_eq!(stream.pull_samples(&mut out).expect("pull"), 4000);
        assert_eq!(out[..100], samples[..100]);
    }

    #[test]
    fn open_stream_rejects_unknown_content() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&[0u8; 256]).expect("write");

        let player = Player::new(Settings::default()).expect("player");
        assert!(player
            .open_stream(file.path().to_str().expect("path"))
            .is_err());
    }

    #[test]
    fn worker_fills_ring_to_completion() {
        let samples: Vec<i16> = (0..4000).map(|i| i as i16).collect();
        let file = temp_wav(&samples);

        let player = Player::new(Settings::default()).expect("player");
        let stream = player
            .open_stream(file.path().to_str().expect("path"))
            .expect("open");

        let ring = PcmRing::new(512);
        let (_tx, rx) = mpsc::channel();
        let generation = AtomicU64::new(0);

        let consumer = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut out = vec![0i16; 256];
                let mut collected = Vec::new();
                loop {
                    let n = ring.pop_slice(&mut out);
                    collected.extend_from_slice(&out[..n]);
                    if n == 0 && ring.is_closed() && ring.is_empty() {
                        break;
                    }
                    thread::sleep(Duration::from_micros(200));
                }
                collected
            })
        };

        Player::decode_worker(stream, &ring, &Mutex::new(rx), &generation);
        let collected = consumer.join().expect("join");
        assert_eq!(collected.len(), 4000);
        assert_eq!(collected[..64], samples[..64]);
    }

    #[test]
    fn stop_command_terminates_the_worker() {
        let samples: Vec<i16> = vec![7; 50_000];
        let file = temp_wav(&samples);

        let player = Player::new(Settings::default()).expect("player");
        let stream = player
            .open_stream(file.path().to_str().expect("path"))
            .expect("open");

        // A tiny ring forces the worker to block; stop must still win.
        let ring = PcmRing::new(64);
        let (tx, rx) = mpsc::channel();
        let generation = Arc::new(AtomicU64::new(0));

        tx.send(Command::Stop).expect("send");
        Player::decode_worker(stream, &ring, &Mutex::new(rx), &generation);
        assert!(ring.is_closed());
    }

    #[test]
    fn seek_bumps_the_generation() {
        let player = Player::new(Settings::default()).expect("player");
        let controls = player.controls();
        let before = player.generation.load(Ordering::Acquire);
        controls.seek_to_ms(1000);
        assert_eq!(player.generation.load(Ordering::Acquire), before + 1);
    }

    #[test]
    fn playback_state_snapshot_is_cloned() {
        let player = Player::new(Settings::default()).expect("player");
        let state = player.now_playing();
        assert!(!state.playing);
        assert!(state.uri.is_empty());
    }
}
