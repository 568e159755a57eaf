//! Format detection by magic signature.
//!
//! The probe peeks at the head of an unopened byte source, matches it
//! against the signatures registered with the [`Registry`] in descending
//! priority order, and names a format id. File-extension and MIME hints
//! form a secondary path: they are consulted only when no magic matches
//! and never override one.

use std::io::{Read, Seek, SeekFrom};

use crate::{error::Result, registry::Registry, source::ByteSource};

/// Maximum number of bytes the probe reads (64 KiB).
pub const PROBE_LEN: usize = 64 * 1024;

/// Well-known format ids registered by the built-in demuxers.
pub mod format {
    pub const FLAC: &str = "flac";
    pub const OGG: &str = "ogg";
    pub const WAV: &str = "wav";
    pub const MP4: &str = "mp4";
    pub const MPEG: &str = "mpeg";
    pub const RAW: &str = "raw";
}

/// A registered magic signature.
///
/// Each pattern byte carries a mask, so both exact bytes and partial
/// matches (the 11-bit MPEG sync) can be expressed. Evaluation is by
/// descending priority; the first match wins.
#[derive(Clone, Debug)]
pub struct Signature {
    /// Format id this signature names.
    pub format: &'static str,

    /// `(value, mask)` pairs; a source byte `b` matches when
    /// `b & mask == value & mask`.
    pub pattern: Vec<(u8, u8)>,

    /// Byte offset at which the pattern starts.
    pub offset: usize,

    /// Evaluation priority, higher first.
    pub priority: u8,
}

impl Signature {
    /// Creates a signature from a byte pattern where `?` matches any byte.
    #[must_use]
    pub fn new(format: &'static str, pattern: &[u8], offset: usize, priority: u8) -> Self {
        Self {
            format,
            pattern: pattern
                .iter()
                .map(|&b| if b == b'?' { (0, 0) } else { (b, 0xFF) })
                .collect(),
            offset,
            priority,
        }
    }

    /// Creates a signature from explicit `(value, mask)` pairs.
    #[must_use]
    pub fn masked(format: &'static str, pattern: &[(u8, u8)], offset: usize, priority: u8) -> Self {
        Self {
            format,
            pattern: pattern.to_vec(),
            offset,
            priority,
        }
    }

    /// Whether the head bytes match this signature.
    #[must_use]
    pub fn matches(&self, head: &[u8]) -> bool {
        let Some(window) = head.get(self.offset..self.offset + self.pattern.len()) else {
            return false;
        };
        window
            .iter()
            .zip(&self.pattern)
            .all(|(&b, &(value, mask))| b & mask == value & mask)
    }
}

/// Caller-provided identification hints.
///
/// Hints are secondary: the probe consults them only when no magic
/// signature matches.
#[derive(Clone, Debug, Default)]
pub struct Hint {
    extension: Option<String>,
    mime: Option<String>,
}

impl Hint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file-extension hint (without the dot).
    pub fn with_extension(&mut self, extension: &str) -> &mut Self {
        self.extension = Some(extension.to_ascii_lowercase());
        self
    }

    /// Adds a MIME-type hint.
    pub fn mime_type(&mut self, mime: &str) -> &mut Self {
        self.mime = Some(mime.to_ascii_lowercase());
        self
    }

    /// Extracts an extension hint from a path or URL.
    pub fn from_target(target: &str) -> Self {
        let mut hint = Self::new();
        // Strip a URL query before looking at the extension.
        let path = target.split(['?', '#']).next().unwrap_or(target);
        if let Some((_, ext)) = path.rsplit_once('.') {
            if !ext.is_empty() && !ext.contains('/') {
                hint.with_extension(ext);
            }
        }
        hint
    }
}

/// Identifies the format of a byte source.
///
/// Reads up to [`PROBE_LEN`] bytes from offset 0, restores the position,
/// and evaluates every registered signature in descending priority order.
/// Falls back to the extension and MIME hint tables. Returns `None` when
/// nothing matches.
///
/// # Errors
///
/// Returns an I/O error if the head cannot be read or the position not
/// restored.
pub fn identify(
    source: &mut dyn ByteSource,
    hint: &Hint,
    registry: &Registry,
) -> Result<Option<String>> {
    let origin = source.stream_position()?;
    source.seek(SeekFrom::Start(0))?;

    let mut head = vec![0u8; PROBE_LEN];
    let mut filled = 0;
    while filled < head.len() {
        let n = source.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    source.seek(SeekFrom::Start(origin))?;

    if let Some(format) = registry.match_signature(&head) {
        trace!("probe matched magic for {format:?}");
        return Ok(Some(format));
    }

    if let Some(ext) = hint.extension.as_deref() {
        if let Some(format) = registry.format_for_extension(ext) {
            debug!("probe fell back to extension hint .{ext} -> {format:?}");
            return Ok(Some(format));
        }
    }

    if let Some(mime) = hint.mime.as_deref() {
        if let Some(format) = registry.format_for_mime(mime) {
            debug!("probe fell back to MIME hint {mime} -> {format:?}");
            return Ok(Some(format));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn signatures_match_with_wildcards() {
        let riff = Signature::new(format::WAV, b"RIFF????WAVE", 0, 90);
        assert!(riff.matches(b"RIFF\x24\x08\x00\x00WAVEfmt "));
        assert!(!riff.matches(b"RIFF\x24\x08\x00\x00AVI LIST"));
        assert!(!riff.matches(b"RIFF"));
    }

    #[test]
    fn masked_signatures_match_partial_bytes() {
        let sync = Signature::masked(format::MPEG, &[(0xFF, 0xFF), (0xE0, 0xE0)], 0, 10);
        assert!(sync.matches(&[0xFF, 0xFB, 0x90, 0x00]));
        assert!(sync.matches(&[0xFF, 0xF3, 0x90, 0x00]));
        assert!(!sync.matches(&[0xFF, 0x1B, 0x90, 0x00]));
    }

    #[test]
    fn magic_wins_over_hints() {
        let registry = Registry::with_defaults();
        let mut source = Cursor::new(b"fLaC\x00\x00\x00\x22".to_vec());
        let mut hint = Hint::new();
        hint.with_extension("mp3");

        let format = identify(&mut source, &hint, &registry).expect("probe");
        assert_eq!(format.as_deref(), Some(format::FLAC));
        // Position restored.
        assert_eq!(source.position(), 0);
    }

    #[test]
    fn extension_hint_used_when_no_magic() {
        let registry = Registry::with_defaults();
        let mut source = Cursor::new(vec![0u8; 128]);
        let hint = Hint::from_target("/music/track.mp3?token=abc");

        let format = identify(&mut source, &hint, &registry).expect("probe");
        assert_eq!(format.as_deref(), Some(format::MPEG));
    }

    #[test]
    fn unknown_input_yields_none() {
        let registry = Registry::with_defaults();
        let mut source = Cursor::new(vec![0u8; 16]);
        let format = identify(&mut source, &Hint::new(), &registry).expect("probe");
        assert_eq!(format, None);
    }
}
