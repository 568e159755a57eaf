//! End-to-end pipeline tests: byte source through demuxer and codec to
//! PCM output, over the crate's public surface only.

use std::{
    io::{Cursor, Read, Write},
    net::{TcpListener, TcpStream},
    thread,
};

use minim::{
    codec::flac::frame::{crc16, crc8},
    config::Settings,
    demux::{flac::FlacDemuxer, raw::RawDemuxer, Demuxer, StreamInfo},
    player::Player,
    pool::ChunkPool,
    probe::{self, Hint},
    registry::Registry,
    stream::DemuxedStream,
};

/// Builds a canonical 16-bit PCM WAVE file.
fn build_wav(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let block_align = channels * 2;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Builds a FLAC file of fixed 4096-sample stereo frames, each carrying
/// two constant subframes with the given channel values.
fn build_flac(frames: &[(i16, i16)]) -> Vec<u8> {
    let mut out = b"fLaC".to_vec();
    out.push(0x80); // STREAMINFO, last metadata block
    out.extend_from_slice(&[0, 0, 34]);
    out.extend_from_slice(&4096u16.to_be_bytes());
    out.extend_from_slice(&4096u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 14]); // min frame size
    out.extend_from_slice(&[0, 0, 32]); // max frame size
    let total = (frames.len() as u64) * 4096;
    let packed: u64 = (44_100u64 << 44) | (1u64 << 41) | (15u64 << 36) | total;
    out.extend_from_slice(&packed.to_be_bytes());
    out.extend_from_slice(&[0u8; 16]);

    for (number, &(left, right)) in frames.iter().enumerate() {
        assert!(number < 128, "single-byte coded numbers only");
        // Header: 4096 block (code 12), 44.1 kHz (code 9), stereo
        // independent, 16 bits (code 4).
        let mut frame = vec![0xFF, 0xF8, 0xC9, 0x18, number as u8];
        frame.push(crc8(&frame));
        for value in [left, right] {
            // Constant subframe: padding 0, type 000000, no wasted bits,
            // then the 16-bit value.
            frame.push(0x00);
            frame.extend_from_slice(&(value as u16).to_be_bytes());
        }
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&frame);
    }
    out
}

fn open_flac(bytes: Vec<u8>) -> DemuxedStream {
    let demuxer = FlacDemuxer::new(
        Box::new(Cursor::new(bytes)),
        ChunkPool::new(8 * 1024 * 1024),
        minim::config::CrcMode::Strict,
    );
    DemuxedStream::open(
        Box::new(demuxer),
        Registry::global(),
        &Settings::default(),
    )
    .expect("open")
}

#[test]
fn wav_end_to_end_byte_count_and_duration() {
    // 10000 stereo sample frames at 44.1 kHz.
    let samples: Vec<i16> = (0..20_000).map(|i| (i % 251) as i16).collect();
    let bytes = build_wav(44_100, 2, &samples);

    let mut file = tempfile::Builder::new()
        .suffix(".wav")
        .tempfile()
        .expect("tempfile");
    file.write_all(&bytes).expect("write");

    let player = Player::new(Settings::default()).expect("player");
    let mut stream = player
        .open_stream(file.path().to_str().expect("path"))
        .expect("open");

    assert_eq!(stream.duration_ms(), 226);
    assert_eq!(stream.spec(), (44_100, 2));

    let mut out = vec![0u8; 4096];
    let mut total = 0usize;
    loop {
        let n = stream.pull_pcm(&mut out).expect("pull");
        total += n;
        if n < out.len() {
            break;
        }
    }
    assert_eq!(total, 10_000 * 2 * 2);
    assert!(stream.is_eof());
}

#[test]
fn flac_end_to_end_decodes_constant_frames() {
    let frames: Vec<(i16, i16)> = (0..8).map(|i| (i * 100, -i * 100)).collect();
    let mut stream = open_flac(build_flac(&frames));

    assert_eq!(stream.info().codec_name, "flac");
    assert_eq!(stream.duration_ms(), 8 * 4096 * 1000 / 44_100);

    let mut out = vec![0i16; 4096 * 2];
    for &(left, right) in &frames {
        let n = stream.pull_samples(&mut out).expect("pull");
        assert_eq!(n, 4096 * 2);
        assert!(out[..n].chunks(2).all(|lr| lr == [left, right]));
    }
    let n = stream.pull_samples(&mut out).expect("pull");
    assert_eq!(n, 0);
    assert!(stream.is_eof());
}

#[test]
fn flac_seek_lands_within_one_block() {
    let frames: Vec<(i16, i16)> = (0..32).map(|i| (i, i)).collect();
    let mut stream = open_flac(build_flac(&frames));

    // 2 seconds in: sample 88200, inside frame 21 (86016..90112).
    stream.seek_to_ms(2_000).expect("seek");
    let mut out = vec![0i16; 2];
    let n = stream.pull_samples(&mut out).expect("pull");
    assert_eq!(n, 2);
    assert_eq!(out, vec![21, 21]);

    let position = stream.position_samples();
    assert!(position >= 86_016 && position <= 90_112, "{position}");
}

#[test]
fn probe_prefers_magic_over_extension() {
    let registry = Registry::global();
    let flac_bytes = build_flac(&[(0, 0)]);
    let mut source = Cursor::new(flac_bytes);

    let mut hint = Hint::new();
    hint.with_extension("wav");
    let format = probe::identify(&mut source, &hint, registry).expect("probe");
    assert_eq!(format.as_deref(), Some("flac"));
}

#[test]
fn raw_pipeline_over_cursor() {
    let payload: Vec<u8> = (0..4000u32).flat_map(|i| (i as i16).to_le_bytes()).collect();
    let demuxer = RawDemuxer::new(
        Box::new(Cursor::new(payload)),
        ChunkPool::new(1024 * 1024),
        StreamInfo::audio(0, "pcm_s16le", 8_000, 1, 16),
    );
    let mut stream = DemuxedStream::open(
        Box::new(demuxer),
        Registry::global(),
        &Settings::default(),
    )
    .expect("open");

    let mut out = vec![0i16; 8000];
    let n = stream.pull_samples(&mut out).expect("pull");
    assert_eq!(n, 4000);
    assert_eq!(out[1234], 1234);
}

#[test]
fn distinct_streams_do_not_block_each_other() {
    let flac = build_flac(&(0..16).map(|i| (i, i)).collect::<Vec<_>>());
    let wav = build_wav(44_100, 2, &vec![42i16; 40_000]);

    let flac_thread = thread::spawn(move || {
        let mut stream = open_flac(flac);
        let mut out = vec![0i16; 4096];
        let mut total = 0usize;
        loop {
            let n = stream.pull_samples(&mut out).expect("pull");
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    });
    let wav_thread = thread::spawn(move || {
        let demuxer = minim::demux::wav::WavDemuxer::new(
            Box::new(Cursor::new(wav)),
            ChunkPool::new(8 * 1024 * 1024),
        );
        let mut stream = DemuxedStream::open(
            Box::new(demuxer),
            Registry::global(),
            &Settings::default(),
        )
        .expect("open");
        let mut out = vec![0i16; 4096];
        let mut total = 0usize;
        loop {
            let n = stream.pull_samples(&mut out).expect("pull");
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    });

    assert_eq!(flac_thread.join().expect("join"), 16 * 4096 * 2);
    assert_eq!(wav_thread.join().expect("join"), 40_000);
}

#[test]
fn pool_stays_within_cap_during_playback() {
    let pool = ChunkPool::new(1024 * 1024);
    let wav = build_wav(44_100, 2, &vec![7i16; 100_000]);
    let demuxer = minim::demux::wav::WavDemuxer::new(Box::new(Cursor::new(wav)), pool.clone());
    let mut stream = DemuxedStream::open(
        Box::new(demuxer),
        Registry::global(),
        &Settings::default(),
    )
    .expect("open");

    let mut out = vec![0u8; 8192];
    loop {
        let n = stream.pull_pcm(&mut out).expect("pull");
        let stats = pool.stats().expect("stats");
        assert!(stats.live_bytes + stats.pooled_bytes <= 1024 * 1024);
        if n < out.len() {
            break;
        }
    }
    // All buffers return once the stream drops.
    drop(stream);
    let stats = pool.stats().expect("stats");
    assert_eq!(stats.live_bytes, 0);
}

/// Serves one payload over HTTP with byte-range support.
fn serve_ranges(payload: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    thread::spawn(move || {
        for stream in listener.incoming().take(32) {
            let Ok(stream) = stream else { break };
            handle_request(stream, &payload);
        }
    });
    format!("http://{addr}/track.wav")
}

fn handle_request(mut stream: TcpStream, payload: &[u8]) {
    let mut buf = [0u8; 2048];
    let mut request = Vec::new();
    loop {
        let Ok(n) = stream.read(&mut buf) else { return };
        if n == 0 {
            return;
        }
        request.extend_from_slice(&buf[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&request);
    let range = text
        .lines()
        .find_map(|line| line.strip_prefix("Range: bytes="))
        .map(|spec| {
            let (from, to) = spec.trim().split_once('-').unwrap_or((spec, ""));
            let from: u64 = from.parse().unwrap_or(0);
            let to: u64 = to
                .parse()
                .unwrap_or(payload.len() as u64 - 1)
                .min(payload.len() as u64 - 1);
            (from, to)
        });

    match range {
        Some((from, _)) if from >= payload.len() as u64 => {
            let head = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                payload.len()
            );
            let _ = stream.write_all(head.as_bytes());
        }
        Some((from, to)) => {
            let body = &payload[from as usize..=to as usize];
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {from}-{to}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                payload.len(),
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(body);
        }
        None => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                payload.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(payload);
        }
    }
}

#[test]
fn http_wav_end_to_end() {
    let samples: Vec<i16> = (0..20_000).map(|i| i as i16).collect();
    let url = serve_ranges(build_wav(44_100, 2, &samples));

    let player = Player::new(Settings::default()).expect("player");
    let mut stream = player.open_stream(&url).expect("open");
    assert_eq!(stream.duration_ms(), 226);

    // Seek over HTTP works through ranged reads.
    stream.seek_to_ms(100).expect("seek");
    let mut out = vec![0i16; 2];
    assert_eq!(stream.pull_samples(&mut out).expect("pull"), 2);
    assert_eq!(out[0], (4410 * 2) as i16);
}
