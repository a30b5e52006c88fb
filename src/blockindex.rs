// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! The read-only view the core needs onto the block index. The
//! real implementation — consensus validation, chain selection, storage of
//! headers — is an external collaborator; the core only ever sees this trait.

use std::sync::{Arc, RwLock};

/// One entry in the chain of headers, as seen by the core.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct BlockMeta {
    pub hash: [u8; 32],
    pub height: u32,
    /// Opaque position the block's raw bytes can be loaded from via
    /// [`BlockIndex::load_block`].
    pub disk_pos: u64,
}

/// The subset of a full node's block index the core consumes:
/// resolve a block by hash or height, load its raw bytes, and walk the
/// chain. Consensus validation and chain selection happen behind this trait,
/// not in front of it.
pub trait BlockIndex: Send + Sync {
    fn get_by_hash(&self, hash: &[u8; 32]) -> Option<BlockMeta>;
    fn get_by_height(&self, height: u32) -> Option<BlockMeta>;
    fn tip(&self) -> BlockMeta;
    fn load_block(&self, disk_pos: u64) -> Option<Vec<u8>>;
    /// Appends a new header to the index. Returns whether it became the new
    /// main-chain tip.
    fn append_header(&self, meta: BlockMeta, raw_block: Vec<u8>) -> bool;
    fn ancestor(&self, from: &[u8; 32], n: u32) -> Option<BlockMeta>;
    fn prev(&self, hash: &[u8; 32]) -> Option<BlockMeta>;
    fn next(&self, hash: &[u8; 32]) -> Option<BlockMeta>;
}

#[derive(Default)]
struct Inner {
    by_hash: std::collections::HashMap<[u8; 32], BlockMeta>,
    by_height: std::collections::HashMap<u32, BlockMeta>,
    blocks: std::collections::HashMap<u64, Vec<u8>>,
    chain: Vec<[u8; 32]>,
}

/// An in-memory `BlockIndex` used by tests and by `ParserKit`/`SubscriptionServices`
/// unit tests that need a chain without a real validation engine behind it.
#[derive(Default)]
pub struct MemoryBlockIndex {
    inner: RwLock<Inner>,
}

impl MemoryBlockIndex {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }
}

impl BlockIndex for MemoryBlockIndex {
    fn get_by_hash(&self, hash: &[u8; 32]) -> Option<BlockMeta> {
        self.inner.read().unwrap().by_hash.get(hash).cloned()
    }

    fn get_by_height(&self, height: u32) -> Option<BlockMeta> {
        self.inner.read().unwrap().by_height.get(&height).cloned()
    }

    fn tip(&self) -> BlockMeta {
        let inner = self.inner.read().unwrap();
        let hash = *inner.chain.last().expect("index must contain a genesis block");
        inner.by_hash[&hash].clone()
    }

    fn load_block(&self, disk_pos: u64) -> Option<Vec<u8>> {
        self.inner.read().unwrap().blocks.get(&disk_pos).cloned()
    }

    fn append_header(&self, meta: BlockMeta, raw_block: Vec<u8>) -> bool {
        let mut inner = self.inner.write().unwrap();
        let is_tip = inner
            .chain
            .last()
            .map(|tip| inner.by_hash[tip].height + 1 == meta.height)
            .unwrap_or(true);
        inner.blocks.insert(meta.disk_pos, raw_block);
        inner.by_height.insert(meta.height, meta.clone());
        inner.by_hash.insert(meta.hash, meta.clone());
        if is_tip {
            inner.chain.push(meta.hash);
        }
        is_tip
    }

    fn ancestor(&self, from: &[u8; 32], n: u32) -> Option<BlockMeta> {
        let height = self.get_by_hash(from)?.height;
        height.checked_sub(n).and_then(|h| self.get_by_height(h))
    }

    fn prev(&self, hash: &[u8; 32]) -> Option<BlockMeta> { self.ancestor(hash, 1) }

    fn next(&self, hash: &[u8; 32]) -> Option<BlockMeta> {
        let height = self.get_by_hash(hash)?.height;
        self.get_by_height(height + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(height: u32, byte: u8) -> BlockMeta {
        BlockMeta { hash: [byte; 32], height, disk_pos: height as u64 }
    }

    #[test]
    fn tracks_tip_and_navigation() {
        let index = MemoryBlockIndex::new();
        assert!(index.append_header(meta(0, 0), vec![0]));
        assert!(index.append_header(meta(1, 1), vec![1]));
        assert_eq!(index.tip().height, 1);
        assert_eq!(index.prev(&[1u8; 32]).unwrap().height, 0);
        assert_eq!(index.next(&[0u8; 32]).unwrap().height, 1);
        assert_eq!(index.ancestor(&[1u8; 32], 1).unwrap().hash, [0u8; 32]);
    }

    #[test]
    fn appending_a_stale_header_does_not_move_the_tip() {
        let index = MemoryBlockIndex::new();
        index.append_header(meta(0, 0), vec![0]);
        index.append_header(meta(1, 1), vec![1]);
        assert!(!index.append_header(meta(1, 2), vec![2]));
        assert_eq!(index.tip().height, 1);
    }
}
