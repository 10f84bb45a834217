//! Buffer-block reordering.
//!
//! Buffer blocks carry opaque per-signal binary payloads and must be
//! delivered to the host in sequence order. The publisher may deliver
//! them out of order; a small window keyed by the distance from the next
//! expected sequence number re-establishes order. Retransmits of
//! already-emitted sequences are dropped (their confirmation is still
//! the caller's job).

use std::collections::VecDeque;

use uuid::Uuid;

/// One opaque binary blob for a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferBlock {
    /// Signal this block belongs to.
    pub signal_id: Uuid,
    /// Opaque payload.
    pub buffer: Vec<u8>,
}

/// Reorder window over buffer-block sequence numbers.
///
/// `cache[i]` holds the block for sequence `expected + i`; slot 0 is the
/// block currently awaited.
#[derive(Debug, Default)]
pub(crate) struct ReorderWindow {
    expected_sequence: u32,
    cache: VecDeque<Option<BufferBlock>>,
}

impl ReorderWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number the window will emit.
    #[cfg(test)]
    pub fn expected_sequence(&self) -> u32 {
        self.expected_sequence
    }

    /// Accept one block; returns everything now ready to emit, in order.
    ///
    /// A block behind the expected sequence is a retransmit and yields
    /// nothing.
    pub fn accept(&mut self, sequence: u32, block: BufferBlock) -> Vec<BufferBlock> {
        let offset = i64::from(sequence) - i64::from(self.expected_sequence);

        if offset < 0 {
            return Vec::new();
        }

        if offset > 0 {
            let offset = offset as usize;
            if self.cache.len() < offset + 1 {
                self.cache.resize(offset + 1, None);
            }
            self.cache[offset] = Some(block);
            return Vec::new();
        }

        // In order: emit this block, then every contiguous cached one.
        let mut ready = vec![block];
        self.expected_sequence = self.expected_sequence.wrapping_add(1);
        self.cache.pop_front();

        while matches!(self.cache.front(), Some(Some(_))) {
            if let Some(Some(next)) = self.cache.pop_front() {
                ready.push(next);
                self.expected_sequence = self.expected_sequence.wrapping_add(1);
            }
        }

        ready
    }

    /// Forget all pending blocks and restart at sequence zero.
    pub fn reset(&mut self) {
        self.expected_sequence = 0;
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: u8) -> BufferBlock {
        BufferBlock {
            signal_id: Uuid::from_u128(u128::from(n)),
            buffer: vec![n; 4],
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let mut w = ReorderWindow::new();
        for n in 0..5u8 {
            let out = w.accept(u32::from(n), block(n));
            assert_eq!(out, vec![block(n)]);
        }
        assert_eq!(w.expected_sequence(), 5);
    }

    #[test]
    fn test_reorder_2_0_1() {
        let mut w = ReorderWindow::new();

        assert!(w.accept(2, block(2)).is_empty());
        assert_eq!(w.expected_sequence(), 0);

        assert_eq!(w.accept(0, block(0)), vec![block(0)]);
        assert_eq!(w.expected_sequence(), 1);

        assert_eq!(w.accept(1, block(1)), vec![block(1), block(2)]);
        assert_eq!(w.expected_sequence(), 3);
    }

    #[test]
    fn test_retransmit_dropped() {
        let mut w = ReorderWindow::new();
        assert_eq!(w.accept(0, block(0)), vec![block(0)]);
        assert!(w.accept(0, block(0)).is_empty());
        assert_eq!(w.expected_sequence(), 1);
    }

    #[test]
    fn test_any_permutation_emits_strictly_increasing() {
        // Every permutation of a 4-block window must come out 0,1,2,3.
        let permutations = [
            [0u32, 1, 2, 3],
            [3, 2, 1, 0],
            [2, 0, 3, 1],
            [1, 3, 0, 2],
            [0, 2, 1, 3],
        ];
        for perm in permutations {
            let mut w = ReorderWindow::new();
            let mut emitted = Vec::new();
            for &seq in &perm {
                emitted.extend(w.accept(seq, block(seq as u8)));
            }
            let ids: Vec<u8> = emitted.iter().map(|b| b.buffer[0]).collect();
            assert_eq!(ids, vec![0, 1, 2, 3], "permutation {perm:?}");
        }
    }

    #[test]
    fn test_reset() {
        let mut w = ReorderWindow::new();
        w.accept(5, block(5));
        w.reset();
        assert_eq!(w.expected_sequence(), 0);
        assert_eq!(w.accept(0, block(0)), vec![block(0)]);
    }
}
