//! Byte-source abstraction (spec.md §4.2, §6): either a random-access source
//! with a known length, or a forward-only stream that supports mark/reset.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// A source that can be read at an absolute byte offset. Implementations own
/// no state shared across calls — a match call has exclusive access to its
/// source for its duration (spec.md §5).
pub trait RandomAccessSource {
    /// Total length of the source in bytes, if known.
    fn len(&self) -> u64;

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read. A short read (including zero, at or
    /// past the end of the source) is not an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl RandomAccessSource for &[u8] {
    fn len(&self) -> u64 {
        (*self).len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = offset.min(self.len()) as usize;
        let available = &self[start..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

/// A [`RandomAccessSource`] backed by a seekable [`File`].
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn new(mut file: File) -> io::Result<Self> {
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(FileSource { file, len })
    }
}

impl RandomAccessSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        read_partial(&mut self.file, buf)
    }
}

/// Reads from `reader` until `buf` is full or end-of-stream, returning the
/// number of bytes actually placed into `buf`. A short underlying read is
/// not itself an error; only a genuine I/O failure propagates.
fn read_partial<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// A forward-only byte stream that supports bounded lookahead via
/// mark/reset. `reset` MUST restore the read position to the point `mark`
/// was called; the engine never reads past the marked limit.
pub trait MarkableStream {
    /// Marks the current position, allowing up to `limit` bytes to be read
    /// before `reset` is called. Returns an [`io::ErrorKind::Unsupported`]
    /// error if this stream cannot support marking.
    fn mark(&mut self, limit: usize) -> io::Result<()>;

    /// Reads up to `buf.len()` bytes, returning the number read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Restores the read position to the last `mark` call.
    fn reset(&mut self) -> io::Result<()>;
}

/// Adapts any [`Read`] into a [`MarkableStream`] by buffering bytes read
/// since the last `mark` so `reset` can replay them.
pub struct MarkReader<R> {
    inner: R,
    buffer: Vec<u8>,
    pos: usize,
    marked: bool,
    limit: usize,
}

impl<R: Read> MarkReader<R> {
    pub fn new(inner: R) -> Self {
        MarkReader {
            inner,
            buffer: Vec::new(),
            pos: 0,
            marked: false,
            limit: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> MarkableStream for MarkReader<R> {
    fn mark(&mut self, limit: usize) -> io::Result<()> {
        self.buffer.clear();
        self.pos = 0;
        self.marked = true;
        self.limit = limit;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;

        // Replay whatever the current mark has already buffered.
        if self.pos < self.buffer.len() {
            let available = &self.buffer[self.pos..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.pos += n;
            total += n;
        }

        if total == buf.len() {
            return Ok(total);
        }

        let n = read_partial(&mut self.inner, &mut buf[total..])?;
        if self.marked && self.buffer.len() < self.limit {
            let room = self.limit - self.buffer.len();
            self.buffer.extend_from_slice(&buf[total..total + n.min(room)]);
        }
        self.pos += n;
        total += n;

        Ok(total)
    }

    fn reset(&mut self) -> io::Result<()> {
        if !self.marked {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "reset() called without a prior mark()",
            ));
        }
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn slice_source_reads_at_offset() {
        let data: &[u8] = b"hello world";
        let mut src = data;
        let mut buf = [0u8; 5];
        let n = src.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn slice_source_short_read_past_end() {
        let data: &[u8] = b"hi";
        let mut src = data;
        let mut buf = [0u8; 10];
        let n = src.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 2);
        let n = src.read_at(10, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn mark_reader_replays_after_reset() {
        let mut r = MarkReader::new(Cursor::new(b"abcdefgh".to_vec()));
        r.mark(4).unwrap();
        let mut buf = [0u8; 4];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        r.reset().unwrap();
        let mut buf2 = [0u8; 4];
        r.read(&mut buf2).unwrap();
        assert_eq!(&buf2, b"abcd");
    }

    #[test]
    fn mark_reader_continues_past_mark_limit_after_reset() {
        let mut r = MarkReader::new(Cursor::new(b"abcdefgh".to_vec()));
        r.mark(4).unwrap();
        let mut buf = [0u8; 4];
        r.read(&mut buf).unwrap();
        r.reset().unwrap();
        let mut buf2 = [0u8; 8];
        let n = r.read(&mut buf2).unwrap();
        assert_eq!(&buf2[..n], b"abcdefgh");
    }

    #[test]
    fn reset_without_mark_is_usage_error() {
        let mut r = MarkReader::new(Cursor::new(b"abc".to_vec()));
        let err = r.reset().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
