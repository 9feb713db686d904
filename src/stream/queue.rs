//! Chained-buffer input FIFO.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Append-only FIFO of owned byte chunks with an aggregate length.
///
/// Chunks keep their identity until read back out: [`take`] returns a
/// zero-copy slice whenever the head chunk alone satisfies the request and
/// only assembles a copy across chunk boundaries, while [`pop_up_to`]
/// never copies at all.
///
/// [`take`]: ByteQueue::take
/// [`pop_up_to`]: ByteQueue::pop_up_to
#[derive(Debug, Default)]
pub(crate) struct ByteQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ByteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, taking ownership. Empty chunks are dropped.
    pub(crate) fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Total buffered bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether at least `n` bytes are buffered.
    pub(crate) fn has(&self, n: usize) -> bool {
        self.len >= n
    }

    /// Remove and return exactly the next `n` bytes as one contiguous
    /// region.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`len`](ByteQueue::len); callers gate on
    /// [`has`](ByteQueue::has) first.
    pub(crate) fn take(&mut self, n: usize) -> Bytes {
        assert!(n <= self.len, "byte queue underflow: need {n}, have {}", self.len);
        if n == 0 {
            return Bytes::new();
        }

        let head = self.chunks.front_mut().expect("non-empty queue has a head chunk");
        if head.len() >= n {
            let out = head.split_to(n);
            if head.is_empty() {
                self.chunks.pop_front();
            }
            self.len -= n;
            return out;
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let head = self.chunks.front_mut().expect("length accounting covers the request");
            let step = remaining.min(head.len());
            out.extend_from_slice(&head.split_to(step));
            if head.is_empty() {
                self.chunks.pop_front();
            }
            remaining -= step;
        }
        self.len -= n;
        out.freeze()
    }

    /// Remove and return the head chunk, clipped to at most `n` bytes.
    ///
    /// Returns an empty chunk when the queue is empty or `n` is zero.
    pub(crate) fn pop_up_to(&mut self, n: usize) -> Bytes {
        if n == 0 {
            return Bytes::new();
        }
        let Some(head) = self.chunks.front_mut() else {
            return Bytes::new();
        };
        let out = if head.len() <= n {
            self.chunks.pop_front().expect("head chunk exists")
        } else {
            head.split_to(n)
        };
        self.len -= out.len();
        out
    }

    /// Release every buffered chunk.
    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_length() {
        let mut queue = ByteQueue::new();
        assert!(queue.is_empty());
        queue.push(Bytes::from_static(b"abc"));
        queue.push(Bytes::from_static(b""));
        queue.push(Bytes::from_static(b"defg"));
        assert_eq!(queue.len(), 7);
        assert!(queue.has(7));
        assert!(!queue.has(8));
    }

    #[test]
    fn take_within_head_is_in_order() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"hello world"));
        assert_eq!(queue.take(5), Bytes::from_static(b"hello"));
        assert_eq!(queue.take(6), Bytes::from_static(b" world"));
        assert!(queue.is_empty());
    }

    #[test]
    fn take_across_chunks_copies_in_order() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"ab"));
        queue.push(Bytes::from_static(b"cd"));
        queue.push(Bytes::from_static(b"ef"));
        assert_eq!(queue.take(5), Bytes::from_static(b"abcde"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take(1), Bytes::from_static(b"f"));
    }

    #[test]
    fn take_leaves_partial_head() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"abcd"));
        queue.push(Bytes::from_static(b"efgh"));
        assert_eq!(queue.take(6), Bytes::from_static(b"abcdef"));
        assert_eq!(queue.take(2), Bytes::from_static(b"gh"));
    }

    #[test]
    fn take_zero() {
        let mut queue = ByteQueue::new();
        assert_eq!(queue.take(0), Bytes::new());
    }

    #[test]
    #[should_panic(expected = "byte queue underflow")]
    fn take_underflow_panics() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"ab"));
        let _ = queue.take(3);
    }

    #[test]
    fn pop_up_to_clips_head() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"abcdef"));
        assert_eq!(queue.pop_up_to(4), Bytes::from_static(b"abcd"));
        assert_eq!(queue.pop_up_to(100), Bytes::from_static(b"ef"));
        assert_eq!(queue.pop_up_to(1), Bytes::new());
    }

    #[test]
    fn clear_releases_everything() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"abc"));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop_up_to(10), Bytes::new());
    }
}
