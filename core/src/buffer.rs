//! Fixed-capacity circular scrollback buffer.
//!
//! Stores the most recent `capacity` bytes of PTY output. Appending past
//! capacity silently overwrites the oldest bytes — the ring never fails,
//! it just forgets.

/// Bytes per session ring, matching the configured `buffer capacity` (§6).
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CircularBuffer {
    data: Vec<u8>,
    capacity: usize,
    head: usize,
    size: usize,
    is_full: bool,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            capacity,
            head: 0,
            size: 0,
            is_full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    /// Append `bytes` to the ring. If `bytes.len() >= capacity`, only the
    /// final `capacity` bytes are retained (tail wins over head).
    pub fn append(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let n = bytes.len();
        if n >= self.capacity {
            let tail = &bytes[n - self.capacity..];
            self.data.copy_from_slice(tail);
            self.head = 0;
            self.size = self.capacity;
            self.is_full = true;
            return;
        }

        let first_len = (self.capacity - self.head).min(n);
        self.data[self.head..self.head + first_len].copy_from_slice(&bytes[..first_len]);
        let remaining = n - first_len;
        if remaining > 0 {
            self.data[..remaining].copy_from_slice(&bytes[first_len..]);
        }

        let wrapped = remaining > 0;
        self.head = (self.head + n) % self.capacity;
        self.is_full = self.is_full || wrapped;
        self.size = if self.is_full { self.capacity } else { self.head };
    }

    /// Linearise the current contents in logical (oldest-first) order.
    pub fn snapshot(&self) -> Vec<u8> {
        if self.size == 0 {
            return Vec::new();
        }
        if !self.is_full {
            return self.data[..self.size].to_vec();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.data[self.head..]);
        out.extend_from_slice(&self.data[..self.head]);
        out
    }

    pub fn clear(&mut self) {
        self.size = 0;
        self.head = 0;
        self.is_full = false;
    }

    /// Reconstruct a linear (already-unwrapped) buffer as loaded from disk:
    /// `head = size`, `is_full = size == capacity`. Used by the persistence
    /// codec, which never stores `head`/`is_full` directly.
    pub fn from_linear(capacity: usize, mut bytes: Vec<u8>) -> Self {
        if bytes.len() > capacity {
            let start = bytes.len() - capacity;
            bytes.drain(..start);
        }
        let size = bytes.len();
        let mut data = vec![0u8; capacity];
        data[..size].copy_from_slice(&bytes);
        Self {
            data,
            capacity,
            head: size % capacity.max(1),
            size,
            is_full: size == capacity && capacity > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot() {
        let b = CircularBuffer::new(16);
        assert!(b.is_empty());
        assert_eq!(b.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn simple_append_under_capacity() {
        let mut b = CircularBuffer::new(16);
        b.append(b"hello");
        assert_eq!(b.len(), 5);
        assert!(!b.is_full());
        assert_eq!(b.snapshot(), b"hello");
    }

    #[test]
    fn append_exactly_capacity() {
        let mut b = CircularBuffer::new(5);
        b.append(b"hello");
        assert_eq!(b.len(), 5);
        assert!(b.is_full());
        assert_eq!(b.snapshot(), b"hello");
    }

    #[test]
    fn append_more_than_capacity_in_one_call_keeps_tail() {
        let mut b = CircularBuffer::new(5);
        b.append(b"helloworld"); // 10 bytes, capacity 5 -> keep "world"
        assert_eq!(b.len(), 5);
        assert!(b.is_full());
        assert_eq!(b.snapshot(), b"world");
    }

    #[test]
    fn wraps_and_keeps_newest() {
        let mut b = CircularBuffer::new(5);
        b.append(b"abcde");
        b.append(b"fg");
        assert_eq!(b.snapshot(), b"cdefg");
    }

    #[test]
    fn multiple_wraps() {
        let mut b = CircularBuffer::new(4);
        for chunk in [b"ab".as_slice(), b"cd", b"ef", b"gh"] {
            b.append(chunk);
        }
        assert_eq!(b.snapshot(), b"efgh");
    }

    #[test]
    fn ring_wrap_scenario_from_spec() {
        let mut b = CircularBuffer::new(1_048_576);
        b.append(&vec![b'a'; 1_048_576]);
        b.append(&vec![b'b'; 10]);
        let snap = b.snapshot();
        assert_eq!(snap.len(), 1_048_576);
        assert_eq!(&snap[snap.len() - 10..], b"bbbbbbbbbb");
        assert_eq!(snap[0], b'a');
    }

    #[test]
    fn clear_resets_state() {
        let mut b = CircularBuffer::new(8);
        b.append(b"abcdefgh");
        b.clear();
        assert!(b.is_empty());
        assert!(!b.is_full());
        assert_eq!(b.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn append_total_matches_last_bytes_of_stream() {
        let mut b = CircularBuffer::new(10);
        let mut all = Vec::new();
        for i in 0..25u8 {
            let chunk = vec![i; 3];
            all.extend_from_slice(&chunk);
            b.append(&chunk);
        }
        let expected_len = all.len().min(10);
        assert_eq!(b.snapshot(), &all[all.len() - expected_len..]);
    }

    #[test]
    fn from_linear_under_capacity() {
        let b = CircularBuffer::from_linear(16, b"hello".to_vec());
        assert_eq!(b.len(), 5);
        assert!(!b.is_full());
        assert_eq!(b.snapshot(), b"hello");
    }

    #[test]
    fn from_linear_trims_to_tail_when_oversized() {
        let oversized: Vec<u8> = (0..20u8).collect();
        let b = CircularBuffer::from_linear(10, oversized.clone());
        assert_eq!(b.len(), 10);
        assert!(b.is_full());
        assert_eq!(b.snapshot(), &oversized[10..]);
    }

    #[test]
    fn from_linear_exact_capacity_is_full() {
        let b = CircularBuffer::from_linear(5, b"abcde".to_vec());
        assert!(b.is_full());
        assert_eq!(b.snapshot(), b"abcde");
    }
}
