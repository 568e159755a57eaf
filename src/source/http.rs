//! HTTP byte source backed by byte-range GETs.
//!
//! The source issues a ranged GET per read-ahead window and serves reads
//! from the window, so sequential demuxing touches the network once per
//! 256 KiB while seeks cost at most one request. Transient network
//! failures retry with exponential backoff; persistent ones surface as
//! I/O errors with a `Retry` hint for the demuxer to interpret.
//!
//! Servers that do not honour `Range` fall back to a sequential body
//! reader: forward seeks discard bytes, backward seeks fail, and the
//! source reports itself unseekable.

use std::{
    io::{Read, Seek, SeekFrom},
    thread,
    time::Duration,
};

use exponential_backoff::Backoff;
use reqwest::{
    blocking::{Client, Response},
    header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    StatusCode,
};
use url::Url;

use crate::{
    config::Settings,
    error::{Error, Result},
    source::ByteSource,
};

/// Bytes fetched per ranged request.
const READAHEAD_LEN: u64 = 256 * 1024;

/// Duration to keep idle connections alive.
///
/// Prevents reconnection overhead between read-ahead windows.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Duration to wait for a connection to be established.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of retry attempts for a failed window fetch.
const BACKOFF_ATTEMPTS: u32 = 5;

/// Minimum duration to wait between retry attempts.
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum duration to wait between retry attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A seekable byte source over an HTTP resource.
pub struct HttpSource {
    client: Client,
    url: Url,

    /// Total resource size, when the server reports one.
    len: Option<u64>,

    /// Whether the server honours `Range` requests.
    accepts_ranges: bool,

    /// Logical read position.
    pos: u64,

    /// Read-ahead window and the offset of its first byte.
    window: Vec<u8>,
    window_start: u64,

    /// Open body for the sequential fallback path.
    body: Option<Response>,
}

impl HttpSource {
    /// Opens an HTTP resource and discovers its length and range support.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the initial request fails or the server
    /// responds with a failure status.
    pub fn open(url: Url, settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .tcp_keepalive(KEEPALIVE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.http_timeout)
            .user_agent(concat!("minim/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let probe = client
            .get(url.clone())
            .header(RANGE, format!("bytes=0-{}", READAHEAD_LEN - 1))
            .send()?;

        let status = probe.status();
        if !status.is_success() {
            return Err(Error::io(format!("{url}: server responded {status}")));
        }

        let accepts_ranges = status == StatusCode::PARTIAL_CONTENT
            || probe
                .headers()
                .get(ACCEPT_RANGES)
                .is_some_and(|v| v.as_bytes() == b"bytes");

        let len = if status == StatusCode::PARTIAL_CONTENT {
            total_from_content_range(&probe)
        } else {
            probe
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        };

        debug!(
            "HTTP source opened: length {len:?}, ranges {}",
            if accepts_ranges { "supported" } else { "unsupported" }
        );

        let mut source = Self {
            client,
            url,
            len,
            accepts_ranges,
            pos: 0,
            window: Vec::new(),
            window_start: 0,
            body: None,
        };

        if accepts_ranges {
            // The probe already carries the first window.
            let mut window = Vec::with_capacity(READAHEAD_LEN as usize);
            let mut response = probe;
            response.copy_to(&mut window)?;
            source.window = window;
        } else {
            source.body = Some(probe);
        }

        Ok(source)
    }

    /// Fetches the read-ahead window starting at `pos`.
    ///
    /// Retries transient failures with exponential backoff; on 416 (range
    /// not satisfiable) the window goes empty, which readers observe as
    /// end of stream.
    fn fill_window(&mut self, pos: u64) -> std::io::Result<()> {
        let end = match self.len {
            Some(len) if pos >= len => {
                self.window.clear();
                self.window_start = pos;
                return Ok(());
            }
            Some(len) => (pos + READAHEAD_LEN).min(len) - 1,
            None => pos + READAHEAD_LEN - 1,
        };

        let backoff = Backoff::new(BACKOFF_ATTEMPTS, MIN_BACKOFF, MAX_BACKOFF);
        let mut last_err = None;
        for (attempt, pause) in backoff.into_iter().enumerate() {
            let result = self
                .client
                .get(self.url.clone())
                .header(RANGE, format!("bytes={pos}-{end}"))
                .send();

            match result {
                Ok(response) if response.status() == StatusCode::RANGE_NOT_SATISFIABLE => {
                    self.window.clear();
                    self.window_start = pos;
                    return Ok(());
                }
                Ok(mut response) if response.status().is_success() => {
                    let mut window = Vec::with_capacity((end - pos + 1) as usize);
                    match response.copy_to(&mut window) {
                        Ok(_) => {
                            self.window = window;
                            self.window_start = pos;
                            return Ok(());
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                Ok(response) => {
                    return Err(std::io::Error::other(format!(
                        "range request failed: {}",
                        response.status()
                    )));
                }
                Err(e) => last_err = Some(e),
            }

            match pause {
                Some(duration) => {
                    warn!(
                        "window fetch at {pos} failed; retrying in {duration:?} ({}/{BACKOFF_ATTEMPTS})",
                        attempt + 1
                    );
                    thread::sleep(duration);
                }
                None => break,
            }
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            last_err.map_or_else(|| "window fetch failed".to_string(), |e| e.to_string()),
        ))
    }

    /// Sequential read for servers without range support.
    fn read_sequential(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(body) = self.body.as_mut() else {
            return Ok(0);
        };
        let n = body.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Read for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.accepts_ranges {
            return self.read_sequential(buf);
        }

        let in_window = self.pos >= self.window_start
            && self.pos < self.window_start + self.window.len() as u64;
        if !in_window {
            self.fill_window(self.pos)?;
            if self.window.is_empty() {
                return Ok(0);
            }
        }

        let offset = (self.pos - self.window_start) as usize;
        let n = buf.len().min(self.window.len() - offset);
        buf[..n].copy_from_slice(&self.window[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for HttpSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => match self.len {
                Some(len) => len.checked_add_signed(delta),
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "seek from end with unknown length",
                    ))
                }
            },
        };
        let Some(target) = target else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        };

        if !self.accepts_ranges {
            // Forward-only: discard bytes to emulate short forward seeks.
            if target < self.pos {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "server does not accept range requests",
                ));
            }
            let mut to_skip = target - self.pos;
            let mut scratch = [0u8; 8192];
            while to_skip > 0 {
                let n = self.read_sequential(&mut scratch[..(to_skip.min(8192)) as usize])?;
                if n == 0 {
                    break;
                }
                to_skip -= n as u64;
            }
            return Ok(self.pos);
        }

        // The window is kept; a later read inside it costs nothing.
        self.pos = target;
        Ok(self.pos)
    }
}

impl ByteSource for HttpSource {
    fn is_seekable(&self) -> bool {
        self.accepts_ranges
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }

    fn is_eof(&self) -> bool {
        self.len.is_some_and(|len| self.pos >= len)
    }
}

/// Extracts the total size from a `Content-Range: bytes a-b/total` header.
fn total_from_content_range(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.parse().ok())
}
