//! Re-chunking of arbitrarily fragmented input into fixed-size chunks.
//!
//! Full chunks cut from a single fragment are zero-copy `Bytes::split_to`
//! views; only chunks straddling a fragment boundary are copied into the
//! accumulator.

use bytes::{Bytes, BytesMut};

/// Converts a stream of byte fragments into chunks of exactly `chunk_size`.
///
/// With a known total length no chunk reaches past the total: the final
/// chunk (possibly shorter, possibly empty for a zero-length body) is
/// emitted as soon as the remaining total equals what is accumulated, and
/// anything fed after it is counted in [`ChunkBuffer::surplus`] instead of
/// being emitted. With an unknown total only full chunks are emitted and
/// the caller collects the tail with [`ChunkBuffer::flush`] at end of
/// stream.
///
/// Not internally synchronized: it relies on `on_next` never being
/// re-entered for the same subscriber.
#[derive(Debug)]
pub struct ChunkBuffer {
    chunk_size: usize,
    remaining: Option<u64>,
    pending: BytesMut,
    final_emitted: bool,
    surplus: u64,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize, total_length: Option<u64>) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        Self {
            chunk_size,
            remaining: total_length,
            pending: BytesMut::with_capacity(chunk_size),
            final_emitted: false,
            surplus: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes not yet handed out in a chunk, if the total is known.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    /// Whether the chunk completing a known total has been emitted.
    pub fn is_final_emitted(&self) -> bool {
        self.final_emitted
    }

    /// Bytes fed after the known total was reached. They are never emitted.
    pub fn surplus(&self) -> u64 {
        self.surplus
    }

    /// Feed one fragment, returning every chunk that became complete.
    pub fn split(&mut self, mut fragment: Bytes) -> Vec<Bytes> {
        let mut chunks = Vec::new();

        loop {
            if self.final_emitted {
                self.surplus += fragment.len() as u64;
                break;
            }
            let target = self.next_chunk_len();
            if self.pending.len() == target {
                let chunk = self.pending.split().freeze();
                chunks.push(self.account(chunk));
                continue;
            }
            if fragment.is_empty() {
                break;
            }
            if self.pending.is_empty() && fragment.len() >= target {
                let chunk = fragment.split_to(target);
                chunks.push(self.account(chunk));
                continue;
            }
            let take = (target - self.pending.len()).min(fragment.len());
            self.pending.extend_from_slice(&fragment.split_to(take));
        }

        chunks
    }

    /// Take whatever is accumulated. Called at end of stream.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        let chunk = self.pending.split().freeze();
        Some(self.account(chunk))
    }

    /// Length of the chunk being assembled: a full chunk, or whatever is
    /// left of a known total.
    fn next_chunk_len(&self) -> usize {
        match self.remaining {
            Some(remaining) => remaining.min(self.chunk_size as u64) as usize,
            None => self.chunk_size,
        }
    }

    fn account(&mut self, chunk: Bytes) -> Bytes {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(chunk.len() as u64);
            if *remaining == 0 {
                self.final_emitted = true;
            }
        }
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic fragment sizes in `1..=max`.
    fn fragment_sizes(seed: u64, total: usize, max: usize) -> Vec<usize> {
        let mut state = seed;
        let mut sizes = Vec::new();
        let mut left = total;
        while left > 0 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let size = ((state >> 33) as usize % max + 1).min(left);
            sizes.push(size);
            left -= size;
        }
        sizes
    }

    fn run(data: &[u8], sizes: &[usize], chunk_size: usize, known: bool) -> Vec<Bytes> {
        let total = known.then_some(data.len() as u64);
        let mut buffer = ChunkBuffer::new(chunk_size, total);
        let source = Bytes::copy_from_slice(data);
        let mut offset = 0;
        let mut out = Vec::new();
        for size in sizes {
            out.extend(buffer.split(source.slice(offset..offset + size)));
            offset += size;
        }
        out.extend(buffer.flush());
        out
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let mut buffer = ChunkBuffer::new(4, Some(8));
        let chunks = buffer.split(Bytes::from_static(b"abcdefgh"));
        assert_eq!(chunks, vec![Bytes::from("abcd"), Bytes::from("efgh")]);
        assert!(buffer.is_final_emitted());
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn known_length_emits_short_final_chunk() {
        let mut buffer = ChunkBuffer::new(4, Some(10));
        let mut chunks = buffer.split(Bytes::from_static(b"abcdef"));
        assert_eq!(chunks, vec![Bytes::from("abcd")]);
        chunks = buffer.split(Bytes::from_static(b"ghij"));
        assert_eq!(chunks, vec![Bytes::from("efgh"), Bytes::from("ij")]);
        assert_eq!(buffer.remaining(), Some(0));
    }

    #[test]
    fn zero_length_body_emits_one_empty_chunk() {
        let mut buffer = ChunkBuffer::new(16, Some(0));
        let chunks = buffer.split(Bytes::new());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
        assert!(buffer.split(Bytes::new()).is_empty());
    }

    #[test]
    fn known_total_caps_the_final_chunk() {
        let mut buffer = ChunkBuffer::new(16, Some(5));
        let chunks = buffer.split(Bytes::from(vec![9u8; 20]));
        assert_eq!(chunks.iter().map(Bytes::len).collect::<Vec<_>>(), vec![5]);
        assert!(buffer.is_final_emitted());
        assert_eq!(buffer.remaining(), Some(0));
        assert_eq!(buffer.surplus(), 15);

        assert!(buffer.split(Bytes::from_static(b"more")).is_empty());
        assert_eq!(buffer.surplus(), 19);
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn known_total_spanning_chunks_stops_at_total() {
        let mut buffer = ChunkBuffer::new(4, Some(6));
        let chunks = buffer.split(Bytes::from_static(b"abc"));
        assert!(chunks.is_empty());
        let chunks = buffer.split(Bytes::from_static(b"defghij"));
        assert_eq!(chunks, vec![Bytes::from("abcd"), Bytes::from("ef")]);
        assert_eq!(buffer.surplus(), 4);
    }

    #[test]
    fn zero_total_with_data_emits_only_the_empty_chunk() {
        let mut buffer = ChunkBuffer::new(16, Some(0));
        let chunks = buffer.split(Bytes::from_static(b"ignored"));
        assert_eq!(chunks, vec![Bytes::new()]);
        assert_eq!(buffer.surplus(), 7);
    }

    #[test]
    fn unknown_length_holds_tail_until_flush() {
        let mut buffer = ChunkBuffer::new(4, None);
        assert_eq!(buffer.split(Bytes::from_static(b"abcdef")), vec![Bytes::from("abcd")]);
        assert!(buffer.split(Bytes::from_static(b"g")).is_empty());
        assert_eq!(buffer.flush(), Some(Bytes::from("efg")));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn whole_chunks_are_zero_copy() {
        let source = Bytes::from(vec![7u8; 64]);
        let base = source.as_ptr();
        let mut buffer = ChunkBuffer::new(16, Some(64));
        let chunks = buffer.split(source);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].as_ptr(), base);
    }

    #[test]
    fn any_fragmentation_reassembles_exactly() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        for (seed, max_fragment) in [(1, 1), (2, 7), (3, 100), (4, 4096), (5, 20_000)] {
            for chunk_size in [1, 3, 64, 1000, 10_000, 12_000] {
                for known in [true, false] {
                    let sizes = fragment_sizes(seed, data.len(), max_fragment);
                    let chunks = run(&data, &sizes, chunk_size, known);
                    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
                    assert_eq!(joined, data, "seed {seed} chunk {chunk_size} known {known}");
                    let (last, full) = chunks.split_last().unwrap();
                    assert!(full.iter().all(|c| c.len() == chunk_size));
                    assert!(last.len() <= chunk_size && !last.is_empty());
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "chunk_size must be > 0")]
    fn zero_chunk_size_panics() {
        let _ = ChunkBuffer::new(0, None);
    }
}
