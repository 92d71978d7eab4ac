//! Bounded byte buffer for output that has been read but not yet consumed.

use std::collections::VecDeque;

/// Default capacity: 1 MiB.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// FIFO of received chunks, evicting the oldest once `max_size` is exceeded.
#[derive(Debug)]
pub struct Backlog {
    /// Maximum size in bytes.
    max_size: usize,
    /// Current total size in bytes.
    current_size: usize,
    chunks: VecDeque<Vec<u8>>,
    /// Bytes evicted since creation.
    dropped: usize,
}

impl Backlog {
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            chunks: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Append a chunk, evicting old chunks to stay within capacity.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        // A chunk larger than the whole buffer keeps only its tail.
        let data = if data.len() > self.max_size {
            self.dropped += data.len() - self.max_size;
            &data[data.len() - self.max_size..]
        } else {
            data
        };

        while self.current_size + data.len() > self.max_size {
            let Some(old) = self.chunks.pop_front() else {
                break;
            };
            self.current_size -= old.len();
            self.dropped += old.len();
        }

        self.current_size += data.len();
        self.chunks.push_back(data.to_vec());
    }

    /// Remove and return everything buffered, oldest first.
    pub fn take(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.current_size);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.current_size = 0;
        out
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.current_size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.current_size == 0
    }

    /// Total bytes lost to eviction.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_take() {
        let mut b = Backlog::new(1024);
        b.append(b"hello ");
        b.append(b"world");
        assert_eq!(b.len(), 11);
        assert_eq!(b.take(), b"hello world");
        assert!(b.is_empty());
        assert!(b.take().is_empty());
    }

    #[test]
    fn test_eviction() {
        let mut b = Backlog::new(10);
        b.append(b"hello"); // 5 bytes
        b.append(b"world"); // 5 bytes, total 10
        b.append(b"!"); // 1 byte, should evict "hello"
        assert_eq!(b.take(), b"world!");
        assert_eq!(b.dropped(), 5);
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut b = Backlog::new(4);
        b.append(b"ab");
        b.append(b"abcdefgh");
        assert_eq!(b.take(), b"efgh");
        assert_eq!(b.dropped(), 6);
    }
}
