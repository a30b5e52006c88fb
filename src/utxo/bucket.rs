// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Leaves, buckets, and the lock-striped `BucketMap` that holds buckets
//! still living in memory.

use std::sync::Mutex;

/// High bit marking an in-memory index rather than an on-disk byte offset
///.
pub const MEMBIT: u32 = 0x8000_0000;

/// Either a byte offset into a `DataFile` or an index into a `BucketMap`
/// stripe, distinguished by [`MEMBIT`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LeafLocation {
    OnDisk(u32),
    InMemory(u32),
}

impl LeafLocation {
    pub fn encode(self) -> u32 {
        match self {
            LeafLocation::OnDisk(off) => off,
            LeafLocation::InMemory(idx) => MEMBIT | idx,
        }
    }

    pub fn decode(raw: u32) -> Self {
        if raw & MEMBIT != 0 {
            LeafLocation::InMemory(raw & !MEMBIT)
        } else {
            LeafLocation::OnDisk(raw)
        }
    }
}

/// The persistent payload for one unspent output.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Leaf {
    pub block_height: u32,
    pub offset_in_block: u32,
    pub out_index: u32,
    pub txid: [u8; 32],
}

impl Leaf {
    /// `offset_in_block ∈ [81,90]` ⇒ coinbase.
    pub fn is_coinbase(&self) -> bool { (81..=90).contains(&self.offset_in_block) }
}

/// `(db_index_1_based, leaf_location)` packed into 48 bits so a follow-up
/// `remove` skips the hash lookup and file scan. `db_index ==
/// 0` means "unknown; try all DataFiles tip-first".
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RmHint(u64);

impl RmHint {
    pub const UNKNOWN: RmHint = RmHint(0);

    pub fn new(db_index_1_based: u16, location: LeafLocation) -> Self {
        Self(((db_index_1_based as u64) << 32) | location.encode() as u64)
    }

    pub fn db_index(self) -> Option<u16> {
        let idx = (self.0 >> 32) as u16;
        if idx == 0 {
            None
        } else {
            Some(idx)
        }
    }

    pub fn location(self) -> LeafLocation { LeafLocation::decode(self.0 as u32) }
}

/// One entry in a bucket's collision chain.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OutputRef {
    pub cheap_hash: u64,
    pub leaf_location: LeafLocation,
}

/// An ordered (insertion-order) collision chain for one short-hash slot. A
/// bucket exists iff non-empty.
#[derive(Clone, Default, Debug)]
pub struct Bucket {
    pub entries: Vec<OutputRef>,
}

impl Bucket {
    pub fn push(&mut self, entry: OutputRef) { self.entries.push(entry); }

    pub fn remove_at(&mut self, idx: usize) -> OutputRef { self.entries.remove(idx) }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

const STRIPE_COUNT: usize = 4096;

/// Holds every bucket currently living in memory, striped across 4096 locks.
/// A plain `Mutex` per stripe: one writer per stripe at a time, brief reader
/// contention, no lock-free bookkeeping.
pub struct BucketMap {
    stripes: Vec<Mutex<std::collections::HashMap<u32, Bucket>>>,
    next_id: std::sync::atomic::AtomicU32,
}

impl Default for BucketMap {
    fn default() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(std::collections::HashMap::new())).collect(),
            next_id: std::sync::atomic::AtomicU32::new(1),
        }
    }
}

impl BucketMap {
    pub fn new() -> Self { Self::default() }

    fn stripe_of(&self, bucket_id: u32) -> &Mutex<std::collections::HashMap<u32, Bucket>> {
        &self.stripes[bucket_id as usize % STRIPE_COUNT]
    }

    /// Allocates a fresh in-memory bucket index and inserts `bucket` under
    /// it.
    pub fn insert_new(&self, bucket: Bucket) -> u32 {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.stripe_of(id).lock().unwrap().insert(id, bucket);
        id
    }

    pub fn with_bucket<R>(&self, bucket_id: u32, f: impl FnOnce(&Bucket) -> R) -> Option<R> {
        self.stripe_of(bucket_id).lock().unwrap().get(&bucket_id).map(f)
    }

    pub fn with_bucket_mut<R>(&self, bucket_id: u32, f: impl FnOnce(&mut Bucket) -> R) -> Option<R> {
        self.stripe_of(bucket_id).lock().unwrap().get_mut(&bucket_id).map(f)
    }

    pub fn set(&self, bucket_id: u32, bucket: Bucket) { self.stripe_of(bucket_id).lock().unwrap().insert(bucket_id, bucket); }

    pub fn remove(&self, bucket_id: u32) -> Option<Bucket> { self.stripe_of(bucket_id).lock().unwrap().remove(&bucket_id) }

    /// Iterates every in-memory bucket id, used by the flusher.
    pub fn ids(&self) -> Vec<u32> {
        self.stripes.iter().flat_map(|s| s.lock().unwrap().keys().copied().collect::<Vec<_>>()).collect()
    }

    pub fn clear(&self) {
        for stripe in &self.stripes {
            stripe.lock().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_location_round_trips_through_membit() {
        assert_eq!(LeafLocation::decode(LeafLocation::OnDisk(42).encode()), LeafLocation::OnDisk(42));
        assert_eq!(LeafLocation::decode(LeafLocation::InMemory(7).encode()), LeafLocation::InMemory(7));
    }

    #[test]
    fn rm_hint_round_trips_db_index_and_location() {
        let hint = RmHint::new(3, LeafLocation::InMemory(99));
        assert_eq!(hint.db_index(), Some(3));
        assert_eq!(hint.location(), LeafLocation::InMemory(99));
        assert_eq!(RmHint::UNKNOWN.db_index(), None);
    }

    #[test]
    fn bucket_map_allocates_and_looks_up_across_stripes() {
        let map = BucketMap::new();
        let mut ids = Vec::new();
        for i in 0..10u64 {
            let id = map.insert_new(Bucket {
                entries: vec![OutputRef { cheap_hash: i, leaf_location: LeafLocation::InMemory(i as u32) }],
            });
            ids.push(id);
        }
        for (i, id) in ids.iter().enumerate() {
            let entries = map.with_bucket(*id, |b| b.entries.clone()).unwrap();
            assert_eq!(entries[0].cheap_hash, i as u64);
        }
    }
}
