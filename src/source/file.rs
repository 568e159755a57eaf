//! Local file byte source.

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::Path,
};

use crate::{error::Result, source::ByteSource};

/// Default buffer size for file reads (32 KiB).
///
/// Matches the demuxers' read pattern, which reads sequentially in
/// increasing runs up to this size.
pub const BUFFER_LEN: usize = 32 * 1024;

/// A seekable byte source over a local file.
///
/// One-to-one with the underlying OS handle, which is released when the
/// source drops. Reads go through a fixed buffer; seeks within the buffer
/// avoid discarding it.
#[derive(Debug)]
pub struct FileSource {
    reader: BufReader<File>,
    len: u64,
    pos: u64,
}

impl FileSource {
    /// Opens a file for reading.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened or its metadata
    /// cannot be read.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::with_capacity(BUFFER_LEN, file),
            len,
            pos: 0,
        })
    }

    /// Total file size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FileSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        // Relative seeks within the buffer keep it warm.
        if let SeekFrom::Current(delta) = pos {
            self.reader.seek_relative(delta)?;
            self.pos = self.pos.checked_add_signed(delta).unwrap_or(0);
            return Ok(self.pos);
        }
        self.pos = self.reader.seek(pos)?;
        Ok(self.pos)
    }
}

impl ByteSource for FileSource {
    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_and_seeks() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(b"RIFFdataWAVE").expect("write");

        let mut source = FileSource::open(tmp.path()).expect("open");
        assert_eq!(source.byte_len(), Some(12));
        assert!(source.is_seekable());

        let mut magic = [0u8; 4];
        source.read_exact(&mut magic).expect("read");
        assert_eq!(&magic, b"RIFF");
        assert!(!source.is_eof());

        source.seek(SeekFrom::Start(8)).expect("seek");
        let mut tail = Vec::new();
        source.read_to_end(&mut tail).expect("read tail");
        assert_eq!(tail, b"WAVE");
        assert!(source.is_eof());
    }

    #[test]
    fn relative_seek_tracks_position() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0u8; 64]).expect("write");

        let mut source = FileSource::open(tmp.path()).expect("open");
        let mut buf = [0u8; 16];
        source.read_exact(&mut buf).expect("read");
        let pos = source.seek(SeekFrom::Current(-8)).expect("seek back");
        assert_eq!(pos, 8);
        let pos = source.seek(SeekFrom::Current(4)).expect("seek forward");
        assert_eq!(pos, 12);
    }
}
