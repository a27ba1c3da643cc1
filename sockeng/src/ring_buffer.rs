//! Chunked byte queue used for socket read and write buffers.
//!
//! Two modes:
//! - continuous (chunk size > 0): appends coalesce into the tail chunk until
//!   it reaches the chunk size, so reads see one byte stream
//! - packet (chunk size 0): every append is its own chunk, so chunk
//!   boundaries are datagram boundaries

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// Default chunk size for stream buffers.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct RingBuffer {
    chunks: VecDeque<BytesMut>,
    chunk_size: usize,
    len: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl RingBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            chunk_size,
            len: 0,
        }
    }

    /// Buffer in packet mode.
    pub fn packets() -> Self {
        Self::new(0)
    }

    pub fn is_packet_mode(&self) -> bool {
        self.chunk_size == 0
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 && self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Append bytes. In packet mode this always starts a new chunk, even for
    /// an empty datagram.
    pub fn append(&mut self, data: &[u8]) {
        self.len += data.len();
        if !self.is_packet_mode() {
            if let Some(tail) = self.chunks.back_mut() {
                if tail.len() + data.len() <= self.chunk_size {
                    tail.extend_from_slice(data);
                    return;
                }
            }
            if data.is_empty() {
                return;
            }
        }
        self.chunks.push_back(BytesMut::from(data));
    }

    /// Append an owned chunk without copying.
    pub fn append_chunk(&mut self, chunk: BytesMut) {
        if chunk.is_empty() && !self.is_packet_mode() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Size of the first chunk, i.e. the next datagram in packet mode.
    pub fn next_block_size(&self) -> usize {
        self.chunks.front().map_or(0, |c| c.len())
    }

    /// Borrow the first chunk.
    pub fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| &c[..])
    }

    /// Copy up to `buf.len()` bytes out, consuming them.
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let n = front.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&front[..n]);
            front.advance(n);
            copied += n;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.len -= copied;
        copied
    }

    /// Remove and return the whole first chunk.
    pub fn read_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.len -= chunk.len();
        Some(chunk.freeze())
    }

    /// Copy up to `buf.len()` bytes out without consuming.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == buf.len() {
                break;
            }
            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
        }
        copied
    }

    /// Drop up to `n` bytes from the front; returns how many were dropped.
    pub fn skip(&mut self, n: usize) -> usize {
        let mut skipped = 0;
        while skipped < n {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let take = front.len().min(n - skipped);
            front.advance(take);
            skipped += take;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.len -= skipped;
        skipped
    }

    /// Drop `n` bytes after a partial write. Alias of [`RingBuffer::skip`].
    pub fn free(&mut self, n: usize) -> usize {
        self.skip(n)
    }

    /// Offset of the first `byte` within the first `max_len` bytes.
    pub fn index_of(&self, byte: u8, max_len: usize) -> Option<usize> {
        let mut offset = 0;
        for chunk in &self.chunks {
            let limit = chunk.len().min(max_len.saturating_sub(offset));
            if let Some(pos) = chunk[..limit].iter().position(|&b| b == byte) {
                return Some(offset + pos);
            }
            offset += chunk.len();
            if offset >= max_len {
                break;
            }
        }
        None
    }

    pub fn can_read_line(&self) -> bool {
        self.index_of(b'\n', self.len).is_some()
    }

    /// Read through the next `\n` (inclusive) or up to `max_len` bytes.
    pub fn read_line(&mut self, max_len: usize) -> Bytes {
        let want = match self.index_of(b'\n', max_len) {
            Some(pos) => pos + 1,
            None => max_len.min(self.len),
        };
        let mut line = vec![0u8; want];
        let n = self.read_into(&mut line);
        line.truncate(n);
        Bytes::from(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuous_mode_coalesces() {
        let mut buf = RingBuffer::new(8);
        buf.append(b"abc");
        buf.append(b"def");
        assert_eq!(buf.chunk_count(), 1);
        buf.append(b"ghi");
        assert_eq!(buf.chunk_count(), 2);
        assert_eq!(buf.len(), 9);

        let mut out = [0u8; 5];
        assert_eq!(buf.read_into(&mut out), 5);
        assert_eq!(&out, b"abcde");
        let mut rest = [0u8; 16];
        assert_eq!(buf.read_into(&mut rest), 4);
        assert_eq!(&rest[..4], b"fghi");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_packet_mode_keeps_boundaries() {
        let mut buf = RingBuffer::packets();
        buf.append(b"one");
        buf.append(b"");
        buf.append(b"three");
        assert_eq!(buf.chunk_count(), 3);
        assert_eq!(buf.next_block_size(), 3);
        assert_eq!(buf.read_chunk().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(buf.read_chunk().unwrap(), Bytes::new());
        assert!(!buf.is_empty());
        assert_eq!(buf.read_chunk().unwrap(), Bytes::from_static(b"three"));
        assert!(buf.is_empty());
        assert!(buf.read_chunk().is_none());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = RingBuffer::new(4);
        buf.append(b"hello world");
        let mut out = [0u8; 7];
        assert_eq!(buf.peek(&mut out), 7);
        assert_eq!(&out, b"hello w");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_skip_across_chunks() {
        let mut buf = RingBuffer::new(4);
        buf.append(b"abcd");
        buf.append(b"efgh");
        assert_eq!(buf.skip(6), 6);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.front().unwrap(), b"gh");
        assert_eq!(buf.free(10), 2);
    }

    #[test]
    fn test_lines() {
        let mut buf = RingBuffer::new(4);
        buf.append(b"GET /\r\nHost");
        assert!(buf.can_read_line());
        assert_eq!(buf.read_line(1024), Bytes::from_static(b"GET /\r\n"));
        assert!(!buf.can_read_line());
        assert_eq!(buf.read_line(2), Bytes::from_static(b"Ho"));
        assert_eq!(buf.index_of(b't', 10), Some(1));
    }

    #[test]
    fn test_append_chunk() {
        let mut buf = RingBuffer::packets();
        buf.append_chunk(BytesMut::from(&b"xyz"[..]));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.chunk_count(), 1);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn stream_preserves_byte_order(
                chunk_size in 1usize..64,
                writes in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..100), 0..20),
                read_size in 1usize..50,
            ) {
                let mut buf = RingBuffer::new(chunk_size);
                let mut expected = Vec::new();
                for w in &writes {
                    buf.append(w);
                    expected.extend_from_slice(w);
                }
                prop_assert_eq!(buf.len(), expected.len());

                let mut out = Vec::new();
                let mut scratch = vec![0u8; read_size];
                loop {
                    let n = buf.read_into(&mut scratch);
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&scratch[..n]);
                }
                prop_assert_eq!(out, expected);
                prop_assert!(buf.is_empty());
            }
        }
    }
}
