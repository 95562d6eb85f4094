use bytes::{Buf, BytesMut};
use std::io;

/// A buffered FIFO byte queue. Data is appended at the tail and drained from
/// the head. The `size` passed at construction is the fill target used by
/// chunked producers; `push` itself never refuses data, so control replies
/// cannot be lost while a socket is momentarily unwritable.
pub struct Buffer {
    data: BytesMut,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(size),
            size,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining room below the fill target. Producers that stage chunked
    /// data stop when this reaches zero.
    #[inline]
    pub fn room(&self) -> usize {
        self.size.saturating_sub(self.data.len())
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes at the tail.
    #[inline]
    pub fn push(&mut self, src: &[u8]) {
        self.data.extend_from_slice(src);
    }

    /// Drop `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Write the contents of the buffer to the supplied writer, advancing the
    /// head past everything accepted. A would-block error surfaces to the
    /// caller with the already-written prefix consumed.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut sent = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.data.advance(count);
                    sent += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(sent)
    }
}
