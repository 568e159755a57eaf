//! Uniform, seekable byte streams feeding the demuxers.
//!
//! Every demuxer reads through the [`ByteSource`] trait: a blocking,
//! byte-oriented reader with random access. Two concrete sources exist:
//! local files ([`FileSource`]) and HTTP resources ([`HttpSource`]) backed
//! by byte-range GETs. In-memory cursors also qualify, which the tests and
//! the raw demuxer rely on.
//!
//! Sources are owned by exactly one demuxer; exclusive access is enforced
//! by ownership rather than an internal operation lock, so a read can never
//! race a close.

use std::io::{Cursor, Read, Seek};

use url::Url;

use crate::{config::Settings, error::Result};

mod file;
mod http;

pub use file::FileSource;
pub use http::HttpSource;

/// A blocking, seekable byte stream.
///
/// `read` returns fewer bytes than requested only at end of stream or on
/// error. Thread-safety comes from `Send` plus exclusive ownership: the
/// owning demuxer is the only reader.
pub trait ByteSource: Read + Seek + Send {
    /// Whether seeking is supported (false for live streams).
    fn is_seekable(&self) -> bool {
        true
    }

    /// Total size in bytes, if known.
    fn byte_len(&self) -> Option<u64>;

    /// Whether the read position is at or past the end.
    fn is_eof(&self) -> bool;
}

/// In-memory sources are byte sources too; the raw demuxer and the test
/// suite feed the pipeline through cursors.
impl<T> ByteSource for Cursor<T>
where
    T: AsRef<[u8]> + Send,
{
    fn byte_len(&self) -> Option<u64> {
        Some(self.get_ref().as_ref().len() as u64)
    }

    fn is_eof(&self) -> bool {
        self.position() >= self.get_ref().as_ref().len() as u64
    }
}

/// Opens a byte source for a target, dispatching on scheme.
///
/// `http://` and `https://` targets become [`HttpSource`]; everything else
/// is treated as a local file path.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened or the initial HTTP
/// request fails.
pub fn open(target: &str, settings: &Settings) -> Result<Box<dyn ByteSource>> {
    if let Ok(url) = Url::parse(target) {
        match url.scheme() {
            "http" | "https" => {
                debug!("opening HTTP source: {url}");
                return Ok(Box::new(HttpSource::open(url, settings)?));
            }
            "file" => {
                if let Ok(path) = url.to_file_path() {
                    return Ok(Box::new(FileSource::open(path)?));
                }
            }
            _ => {}
        }
    }

    debug!("opening file source: {target}");
    Ok(Box::new(FileSource::open(target)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_a_byte_source() {
        let mut cursor = Cursor::new(vec![1u8, 2, 3, 4]);
        assert!(cursor.is_seekable());
        assert_eq!(cursor.byte_len(), Some(4));
        assert!(!cursor.is_eof());

        let mut buf = [0u8; 4];
        cursor.read_exact(&mut buf).expect("read");
        assert!(cursor.is_eof());
    }
}
