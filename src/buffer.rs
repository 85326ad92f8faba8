//! Append-only capture buffer for child output
//!
//! Output is accumulated into a chain of fixed-capacity blocks instead of a
//! single growable buffer. Blocks are never resized or freed individually,
//! so the writable region handed to an in-flight read stays valid until the
//! read commits, and flattening is a single pass over the chain.

/// Capacity of a single capture block.
pub(crate) const BLOCK_CAPACITY: usize = 16 * 1024;

struct OutputBlock {
    data: Box<[u8; BLOCK_CAPACITY]>,
    used: usize,
}

impl OutputBlock {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; BLOCK_CAPACITY]),
            used: 0,
        }
    }

    fn available(&self) -> usize {
        BLOCK_CAPACITY - self.used
    }
}

/// Ordered chain of capture blocks for one pipe.
///
/// Blocks are boxed so their storage never moves once allocated; appending a
/// new tail block leaves every previously returned region intact.
#[derive(Default)]
pub(crate) struct OutputChain {
    blocks: Vec<OutputBlock>,
}

impl OutputChain {
    pub(crate) fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Hand out the writable region at the end of the tail block, appending
    /// a fresh block first if the tail is full or the chain is empty.
    pub(crate) fn reserve(&mut self) -> &mut [u8] {
        if self.blocks.last().map_or(true, |b| b.available() == 0) {
            self.blocks.push(OutputBlock::new());
        }
        // The tail exists and has free space after the check above.
        let tail = self.blocks.len() - 1;
        let used = self.blocks[tail].used;
        &mut self.blocks[tail].data[used..]
    }

    /// Mark `nread` bytes of the most recently reserved region as filled.
    ///
    /// Reads for one pipe are never interleaved, so the region being
    /// committed is always the one handed out by the last `reserve`.
    pub(crate) fn commit(&mut self, nread: usize) {
        assert!(!self.blocks.is_empty(), "commit without a reserved region");
        let tail_idx = self.blocks.len() - 1;
        let tail = &mut self.blocks[tail_idx];
        assert!(nread <= tail.available());
        tail.used += nread;
    }

    /// Total bytes captured across the chain.
    pub(crate) fn len(&self) -> usize {
        self.blocks.iter().map(|b| b.used).sum()
    }

    /// Concatenate all block contents into `dest` in chain order.
    ///
    /// Returns the number of bytes written.
    pub(crate) fn copy_into(&self, dest: &mut [u8]) -> usize {
        let mut offset = 0;
        for block in &self.blocks {
            dest[offset..offset + block.used].copy_from_slice(&block.data[..block.used]);
            offset += block.used;
        }
        offset
    }

    /// Flatten the chain into one contiguous byte vector.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        let written = self.copy_into(&mut out);
        debug_assert_eq!(written, out.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_chain_has_no_output() {
        let chain = OutputChain::new();
        assert_eq!(chain.len(), 0);
        assert!(chain.to_bytes().is_empty());
    }

    #[test]
    fn reserve_spans_tail_free_space() {
        let mut chain = OutputChain::new();
        assert_eq!(chain.reserve().len(), BLOCK_CAPACITY);
        chain.commit(100);
        assert_eq!(chain.reserve().len(), BLOCK_CAPACITY - 100);
        assert_eq!(chain.len(), 100);
    }

    #[test]
    fn full_tail_appends_new_block() {
        let mut chain = OutputChain::new();
        let slot = chain.reserve();
        let cap = slot.len();
        chain.commit(cap);

        // Tail is now full; the next reserve must come from a fresh block.
        assert_eq!(chain.reserve().len(), BLOCK_CAPACITY);
        chain.commit(7);
        assert_eq!(chain.len(), BLOCK_CAPACITY + 7);
    }

    #[test]
    fn output_preserves_write_order_across_blocks() {
        let mut chain = OutputChain::new();
        let mut expected = Vec::new();

        for round in 0u8..5 {
            let payload = vec![round; 7000];
            let mut remaining = payload.as_slice();
            while !remaining.is_empty() {
                let slot = chain.reserve();
                let n = remaining.len().min(slot.len());
                slot[..n].copy_from_slice(&remaining[..n]);
                chain.commit(n);
                remaining = &remaining[n..];
            }
            expected.extend_from_slice(&payload);
        }

        assert_eq!(chain.to_bytes(), expected);
    }

    #[test]
    fn copy_into_reports_bytes_written() {
        let mut chain = OutputChain::new();
        let slot = chain.reserve();
        slot[..3].copy_from_slice(b"abc");
        chain.commit(3);

        let mut dest = [0u8; 8];
        assert_eq!(chain.copy_into(&mut dest), 3);
        assert_eq!(&dest[..3], b"abc");
    }

    #[test]
    #[should_panic]
    fn commit_more_than_available_panics() {
        let mut chain = OutputChain::new();
        chain.reserve();
        chain.commit(BLOCK_CAPACITY + 1);
    }

    proptest! {
        // Arbitrary chunked writes flatten back to the exact input sequence.
        #[test]
        fn prop_chunked_writes_round_trip(chunks in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 0..40_000),
            0..8,
        )) {
            let mut chain = OutputChain::new();
            let mut expected = Vec::new();

            for chunk in &chunks {
                let mut remaining = chunk.as_slice();
                while !remaining.is_empty() {
                    let slot = chain.reserve();
                    let n = remaining.len().min(slot.len());
                    slot[..n].copy_from_slice(&remaining[..n]);
                    chain.commit(n);
                    remaining = &remaining[n..];
                }
                expected.extend_from_slice(chunk);
            }

            prop_assert_eq!(chain.len(), expected.len());
            prop_assert_eq!(chain.to_bytes(), expected);
        }
    }
}
