// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! A single append-only, memory-mapped `DataFile`: jumptable, leaf/bucket
//! records, and the sidecar info-file snapshots.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use amplify::{Display, Error, From};
use memmap2::MmapMut;
use sha2::{Digest, Sha256};

use super::bucket::{Bucket, Leaf, LeafLocation, OutputRef, RmHint, BucketMap, MEMBIT};
use super::format::{self, InfoHeader};
use super::key::{OutputKey, JUMPTABLE_SLOTS};

/// Default capacity of a tip `DataFile` before it is considered full. Kept small enough in tests via [`DataFile::create`]'s explicit
/// `capacity` argument.
pub const FILE_FULL: u64 = 1_800 * 1024 * 1024;

/// Triggers a flush of in-memory buckets/leaves to disk.
pub const FLUSH_THRESHOLD: u32 = 200_000;

/// How many info-file snapshots are retained per data file.
pub const INFO_RETENTION: u32 = 13;

/// GC (pruning) triggers once a non-tip `DataFile`'s fragmentation (bytes
/// written since the last prune) exceeds this.
pub const GC_FRAGMENTATION_BYTES: u64 = 60 * 1024 * 1024;

/// GC also triggers once this many inserts/removes have landed on a
/// `DataFile` since its last prune.
pub const GC_CHANGES_THRESHOLD: u32 = 200_000;

const JUMPTABLE_BYTES: usize = JUMPTABLE_SLOTS * 4;

#[derive(Clone, Eq, PartialEq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum UtxoError {
    /// I/O error accessing data file {0}: {1}
    Io(String, String),

    /// jumptable checksum did not match for {0}.
    ChecksumMismatch(String),

    /// data file {0} is structurally corrupt: {1}
    Corrupt(String, &'static str),

    /// no info-file snapshot at or below height {0} has a valid checksum.
    NoConsistentSnapshot(u32),
}

fn io_err(path: &Path, e: std::io::Error) -> UtxoError { UtxoError::Io(path.display().to_string(), e.to_string()) }

struct UndoEntry {
    prev_jumptable_value: u32,
    prev_bucket_snapshot: Option<Bucket>,
}

/// One DataFile in the engine's tiered sequence. Only the tip
/// is ever written to for new leaves.
pub struct DataFile {
    pub index: u32,
    path: PathBuf,
    mmap: RwLock<MmapMut>,
    write_offset: AtomicU64,
    jumptable: Vec<AtomicU32>,
    save_lock: Mutex<()>,

    first_block_height: AtomicU32,
    last_block_height: AtomicU32,
    last_block_id: Mutex<[u8; 32]>,
    changes_since_prune: AtomicU32,
    is_tip: std::sync::atomic::AtomicBool,
    failed_block_ids: Mutex<std::collections::HashSet<[u8; 32]>>,

    bucket_map: BucketMap,
    slot_of_bucket: Mutex<HashMap<u32, u32>>,
    leaf_map: Mutex<HashMap<u32, Leaf>>,
    next_leaf_id: AtomicU32,

    undo_log: Mutex<HashMap<u32, UndoEntry>>,
    pending_changes: AtomicU32,
    info_generation: AtomicU32,
}

fn data_path(base: &Path) -> PathBuf { base.with_extension("dat") }

fn info_path(base: &Path, generation: u32) -> PathBuf {
    base.with_extension(format!("{}.info", generation % INFO_RETENTION))
}

impl DataFile {
    /// Creates a brand-new, empty tip `DataFile` preallocated to `capacity`
    /// bytes (sparse on most filesystems).
    pub fn create(base: PathBuf, index: u32, capacity: u64) -> Result<Self, UtxoError> {
        Self::open_file(base, index, capacity, true)
    }

    fn open_file(base: PathBuf, index: u32, capacity: u64, truncate: bool) -> Result<Self, UtxoError> {
        let path = data_path(&base);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        let existing_len = file.metadata().map_err(|e| io_err(&path, e))?.len();
        if existing_len < capacity {
            file.set_len(capacity).map_err(|e| io_err(&path, e))?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| io_err(&path, e))?;

        Ok(Self {
            index,
            path: base,
            mmap: RwLock::new(mmap),
            write_offset: AtomicU64::new(0),
            jumptable: (0..JUMPTABLE_SLOTS).map(|_| AtomicU32::new(0)).collect(),
            save_lock: Mutex::new(()),
            first_block_height: AtomicU32::new(0),
            last_block_height: AtomicU32::new(0),
            last_block_id: Mutex::new([0u8; 32]),
            changes_since_prune: AtomicU32::new(0),
            is_tip: std::sync::atomic::AtomicBool::new(true),
            failed_block_ids: Mutex::new(Default::default()),
            bucket_map: BucketMap::new(),
            slot_of_bucket: Mutex::new(HashMap::new()),
            leaf_map: Mutex::new(HashMap::new()),
            next_leaf_id: AtomicU32::new(1),
            undo_log: Mutex::new(HashMap::new()),
            pending_changes: AtomicU32::new(0),
            info_generation: AtomicU32::new(0),
        })
    }

    /// Reopens an existing `DataFile`, loading the newest info snapshot
    /// whose jumptable checksum verifies.
    pub fn open(base: PathBuf, index: u32, capacity: u64) -> Result<Self, UtxoError> {
        let df = Self::open_file(base, index, capacity, false)?;
        df.load_latest_valid_snapshot()?;
        Ok(df)
    }

    fn load_latest_valid_snapshot(&self) -> Result<bool, UtxoError> {
        let mut best: Option<(u32, InfoHeader, Vec<u8>)> = None;
        for generation in 0..INFO_RETENTION {
            let path = info_path(&self.path, generation);
            let Ok(raw) = std::fs::read(&path) else { continue };
            if raw.len() < JUMPTABLE_BYTES {
                continue;
            }
            let split = raw.len() - JUMPTABLE_BYTES;
            let (header_bytes, jumptable_bytes) = raw.split_at(split);
            let Ok(header) = format::decode_info_header(header_bytes) else { continue };
            let digest: [u8; 32] = Sha256::digest(jumptable_bytes).into();
            if digest != header.jumptable_hash {
                continue;
            }
            if best.as_ref().map(|(_, h, _)| header.last_block_height > h.last_block_height).unwrap_or(true) {
                best = Some((generation, header, jumptable_bytes.to_vec()));
            }
        }
        let Some((generation, header, jumptable_bytes)) = best else {
            return Ok(false);
        };
        self.apply_snapshot(generation, &header, &jumptable_bytes);
        Ok(true)
    }

    fn apply_snapshot(&self, generation: u32, header: &InfoHeader, jumptable_bytes: &[u8]) {
        for (i, slot) in self.jumptable.iter().enumerate() {
            let raw = u32::from_le_bytes(jumptable_bytes[i * 4..i * 4 + 4].try_into().unwrap());
            slot.store(raw, Ordering::Relaxed);
        }
        self.first_block_height.store(header.first_block_height, Ordering::Relaxed);
        self.last_block_height.store(header.last_block_height, Ordering::Relaxed);
        *self.last_block_id.lock().unwrap() = header.last_block_id;
        self.write_offset.store(header.position_in_file, Ordering::Relaxed);
        self.changes_since_prune.store(header.changes_since_prune, Ordering::Relaxed);
        self.is_tip.store(header.is_tip, Ordering::Relaxed);
        *self.failed_block_ids.lock().unwrap() = header.invalid_block_hashes.iter().copied().collect();
        self.info_generation.store(generation + 1, Ordering::Relaxed);
        self.bucket_map.clear();
        self.leaf_map.lock().unwrap().clear();
        self.undo_log.lock().unwrap().clear();
        self.pending_changes.store(0, Ordering::Relaxed);
    }

    /// Reloads the newest snapshot with `last_block_height <= max_height`
    ///.
    pub fn load_older_state(&self, max_height: u32) -> Result<bool, UtxoError> {
        let mut best: Option<(u32, InfoHeader, Vec<u8>)> = None;
        for generation in 0..INFO_RETENTION {
            let path = info_path(&self.path, generation);
            let Ok(raw) = std::fs::read(&path) else { continue };
            if raw.len() < JUMPTABLE_BYTES {
                continue;
            }
            let split = raw.len() - JUMPTABLE_BYTES;
            let (header_bytes, jumptable_bytes) = raw.split_at(split);
            let Ok(header) = format::decode_info_header(header_bytes) else { continue };
            if header.last_block_height > max_height {
                continue;
            }
            let digest: [u8; 32] = Sha256::digest(jumptable_bytes).into();
            if digest != header.jumptable_hash {
                continue;
            }
            if best.as_ref().map(|(_, h, _)| header.last_block_height > h.last_block_height).unwrap_or(true) {
                best = Some((generation, header, jumptable_bytes.to_vec()));
            }
        }
        let Some((generation, header, jumptable_bytes)) = best else {
            return Ok(false);
        };
        self.apply_snapshot(generation, &header, &jumptable_bytes);
        Ok(true)
    }

    fn touch_undo(&self, slot: u32) {
        let mut log = self.undo_log.lock().unwrap();
        if log.contains_key(&slot) {
            return;
        }
        let prev = self.jumptable[slot as usize].load(Ordering::Acquire);
        let prev_bucket_snapshot = if prev & MEMBIT != 0 {
            self.bucket_map.with_bucket(prev & !MEMBIT, |b| b.clone())
        } else {
            None
        };
        log.insert(slot, UndoEntry { prev_jumptable_value: prev, prev_bucket_snapshot });
    }

    /// Loads (copy-on-write if needed) the in-memory bucket id backing
    /// `slot`, creating an empty one if the slot is currently unset.
    fn bucket_id_for_mutation(&self, slot: u32) -> Result<u32, UtxoError> {
        let current = self.jumptable[slot as usize].load(Ordering::Acquire);
        if current & MEMBIT != 0 {
            return Ok(current & !MEMBIT);
        }
        let bucket = if current == 0 {
            Bucket::default()
        } else {
            let (bucket, _) = format::decode_bucket(self.disk_slice(current as u64))
                .map_err(|_| UtxoError::Corrupt(self.path.display().to_string(), "bucket decode failed"))?;
            bucket
        };
        let id = self.bucket_map.insert_new(bucket);
        self.slot_of_bucket.lock().unwrap().insert(id, slot);
        self.jumptable[slot as usize].store(MEMBIT | id, Ordering::Release);
        Ok(id)
    }

    fn disk_slice(&self, offset: u64) -> &[u8] {
        let mmap = self.mmap.read().unwrap();
        // Safety: callers only read offsets below `write_offset`, and bytes
        // below `write_offset` are never mutated again once appended. The
        // mapping itself lives as long as `self`, independent of this read
        // guard, so the slice may safely outlive it.
        let ptr = mmap.as_ptr();
        let len = mmap.len();
        let full: &[u8] = unsafe { std::slice::from_raw_parts(ptr, len) };
        &full[offset as usize..]
    }

    fn resolve_leaf(&self, location: LeafLocation) -> Option<Leaf> {
        match location {
            LeafLocation::InMemory(idx) => self.leaf_map.lock().unwrap().get(&idx).cloned(),
            LeafLocation::OnDisk(offset) => format::decode_leaf(self.disk_slice(offset as u64)).ok().map(|(l, _)| l),
        }
    }

    pub fn insert(&self, key: OutputKey, leaf: Leaf) {
        let slot = key.short_hash();
        self.touch_undo(slot);
        let bucket_id = self.bucket_id_for_mutation(slot).expect("in-memory bucket creation cannot fail");
        let leaf_id = self.next_leaf_id.fetch_add(1, Ordering::Relaxed);
        self.leaf_map.lock().unwrap().insert(leaf_id, leaf);
        self.bucket_map.with_bucket_mut(bucket_id, |b| {
            b.push(OutputRef { cheap_hash: key.cheap_hash(), leaf_location: LeafLocation::InMemory(leaf_id) })
        });
        self.pending_changes.fetch_add(1, Ordering::Relaxed);
        self.changes_since_prune.fetch_add(1, Ordering::Relaxed);
    }

    pub fn find(&self, key: OutputKey) -> Option<(Leaf, RmHint)> {
        let slot = key.short_hash();
        let value = self.jumptable[slot as usize].load(Ordering::Acquire);
        if value == 0 {
            return None;
        }
        if value & MEMBIT != 0 {
            let bucket_id = value & !MEMBIT;
            let entries = self.bucket_map.with_bucket(bucket_id, |b| b.entries.clone())?;
            for entry in entries {
                if entry.cheap_hash != key.cheap_hash() {
                    continue;
                }
                if let Some(leaf) = self.resolve_leaf(entry.leaf_location) {
                    if leaf.txid == key.txid && leaf.out_index == key.out_index {
                        return Some((leaf, RmHint::new((self.index + 1) as u16, entry.leaf_location)));
                    }
                }
            }
            None
        } else {
            let (bucket, _) = format::decode_bucket(self.disk_slice(value as u64)).ok()?;
            for entry in bucket.entries {
                if entry.cheap_hash != key.cheap_hash() {
                    continue;
                }
                if let Some(leaf) = self.resolve_leaf(entry.leaf_location) {
                    if leaf.txid == key.txid && leaf.out_index == key.out_index {
                        return Some((leaf, RmHint::new((self.index + 1) as u16, entry.leaf_location)));
                    }
                }
            }
            None
        }
    }

    pub fn remove(&self, key: OutputKey) -> Option<Leaf> {
        let slot = key.short_hash();
        let value = self.jumptable[slot as usize].load(Ordering::Acquire);
        if value == 0 {
            return None;
        }
        self.touch_undo(slot);
        let bucket_id = self.bucket_id_for_mutation(slot).ok()?;
        let removed = self.bucket_map.with_bucket_mut(bucket_id, |b| {
            let idx = b.entries.iter().position(|e| e.cheap_hash == key.cheap_hash())?;
            Some(b.remove_at(idx))
        })??;
        let leaf = self.resolve_leaf(removed.leaf_location)?;
        if leaf.txid != key.txid || leaf.out_index != key.out_index {
            // Cheap-hash collision with a different output: put it back.
            self.bucket_map.with_bucket_mut(bucket_id, |b| b.push(removed));
            return None;
        }
        let now_empty = self.bucket_map.with_bucket(bucket_id, |b| b.is_empty()).unwrap_or(true);
        if now_empty {
            self.jumptable[slot as usize].store(0, Ordering::Release);
            self.bucket_map.remove(bucket_id);
            self.slot_of_bucket.lock().unwrap().remove(&bucket_id);
        }
        self.pending_changes.fetch_add(1, Ordering::Relaxed);
        self.changes_since_prune.fetch_add(1, Ordering::Relaxed);
        Some(leaf)
    }

    pub fn commit_block(&self, height: u32, block_id: [u8; 32]) {
        let _guard = self.save_lock.lock().unwrap();
        if self.first_block_height.load(Ordering::Relaxed) == 0 {
            self.first_block_height.store(height, Ordering::Relaxed);
        }
        self.last_block_height.store(height, Ordering::Relaxed);
        *self.last_block_id.lock().unwrap() = block_id;
        self.undo_log.lock().unwrap().clear();
        if self.pending_changes.load(Ordering::Relaxed) > FLUSH_THRESHOLD {
            self.flush_all_locked();
        }
    }

    pub fn rollback(&self) {
        let _guard = self.save_lock.lock().unwrap();
        let mut log = self.undo_log.lock().unwrap();
        for (slot, entry) in log.drain() {
            let current = self.jumptable[slot as usize].load(Ordering::Acquire);
            if current & MEMBIT != 0 {
                let id = current & !MEMBIT;
                self.bucket_map.remove(id);
                self.slot_of_bucket.lock().unwrap().remove(&id);
            }
            self.jumptable[slot as usize].store(entry.prev_jumptable_value, Ordering::Release);
            if entry.prev_jumptable_value & MEMBIT != 0 {
                if let Some(snapshot) = entry.prev_bucket_snapshot {
                    let id = entry.prev_jumptable_value & !MEMBIT;
                    self.bucket_map.set(id, snapshot);
                    self.slot_of_bucket.lock().unwrap().insert(id, slot);
                }
            }
        }
        self.pending_changes.store(0, Ordering::Relaxed);
    }

    /// Converts every in-memory bucket/leaf to on-disk records, clearing
    /// `MEMBIT` from their jumptable slots. Simplified from
    /// the original's attempt-threshold staging: this flush always
    /// fully commits a bucket in one pass (see DESIGN.md).
    pub fn flush_all(&self) {
        let _guard = self.save_lock.lock().unwrap();
        self.flush_all_locked();
    }

    /// Same as [`Self::flush_all`] but assumes `save_lock` is already held
    /// by the caller (used by `commit_block` and `save_snapshot`).
    fn flush_all_locked(&self) {
        for bucket_id in self.bucket_map.ids() {
            let Some(slot) = self.slot_of_bucket.lock().unwrap().get(&bucket_id).copied() else { continue };
            let Some(mut bucket) = self.bucket_map.remove(bucket_id) else { continue };
            for entry in &mut bucket.entries {
                if let LeafLocation::InMemory(leaf_id) = entry.leaf_location {
                    let leaf = self.leaf_map.lock().unwrap().remove(&leaf_id);
                    if let Some(leaf) = leaf {
                        let offset = self.append(&format::encode_leaf(&leaf));
                        entry.leaf_location = LeafLocation::OnDisk(offset as u32);
                    }
                }
            }
            let offset = self.append(&format::encode_bucket(&bucket));
            self.jumptable[slot as usize].store(offset as u32, Ordering::Release);
            self.slot_of_bucket.lock().unwrap().remove(&bucket_id);
        }
        self.pending_changes.store(0, Ordering::Relaxed);
    }

    fn append(&self, bytes: &[u8]) -> u64 {
        let offset = self.write_offset.fetch_add(bytes.len() as u64, Ordering::AcqRel);
        let mut mmap = self.mmap.write().unwrap();
        mmap[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        offset
    }

    /// Writes a new `.N.info` snapshot: the tagged header plus the raw
    /// jumptable bytes.
    pub fn save_snapshot(&self) -> Result<(), UtxoError> {
        let _guard = self.save_lock.lock().unwrap();
        self.flush_all_locked();
        let mut jumptable_bytes = vec![0u8; JUMPTABLE_BYTES];
        for (i, slot) in self.jumptable.iter().enumerate() {
            jumptable_bytes[i * 4..i * 4 + 4].copy_from_slice(&slot.load(Ordering::Relaxed).to_le_bytes());
        }
        let jumptable_hash: [u8; 32] = Sha256::digest(&jumptable_bytes).into();
        let header = InfoHeader {
            first_block_height: self.first_block_height.load(Ordering::Relaxed),
            last_block_height: self.last_block_height.load(Ordering::Relaxed),
            last_block_id: *self.last_block_id.lock().unwrap(),
            position_in_file: self.write_offset.load(Ordering::Relaxed),
            changes_since_prune: self.changes_since_prune.load(Ordering::Relaxed),
            initial_bucket_segment_size: 64,
            is_tip: self.is_tip.load(Ordering::Relaxed),
            invalid_block_hashes: self.failed_block_ids.lock().unwrap().iter().copied().collect(),
            jumptable_hash,
        };
        let generation = self.info_generation.fetch_add(1, Ordering::Relaxed);
        let path = info_path(&self.path, generation);
        let mut file = File::create(&path).map_err(|e| io_err(&path, e))?;
        file.write_all(&format::encode_info_header(&header)).map_err(|e| io_err(&path, e))?;
        file.write_all(&jumptable_bytes).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    pub fn set_failed_block_id(&self, block_id: [u8; 32]) { self.failed_block_ids.lock().unwrap().insert(block_id); }

    pub fn block_id_has_failed(&self, block_id: &[u8; 32]) -> bool {
        self.failed_block_ids.lock().unwrap().contains(block_id)
    }

    pub fn write_offset(&self) -> u64 { self.write_offset.load(Ordering::Relaxed) }

    pub fn set_tip(&self, is_tip: bool) { self.is_tip.store(is_tip, Ordering::Relaxed) }

    pub fn is_tip(&self) -> bool { self.is_tip.load(Ordering::Relaxed) }

    /// Whether fragmentation or change volume since the last prune warrants
    /// GC.
    pub fn needs_gc(&self) -> bool {
        self.write_offset() > GC_FRAGMENTATION_BYTES
            || self.changes_since_prune.load(Ordering::Relaxed) > GC_CHANGES_THRESHOLD
    }

    /// Copies every live bucket's leaves to a new file under a temporary
    /// name, rewrites the jumptable against it, and atomically renames it
    /// into place. The old mapping is dropped only once every slot has been
    /// re-pointed at the new one, so a concurrent reader mid-lookup never
    /// observes a torn jumptable.
    pub fn gc(&self) -> Result<(), UtxoError> {
        let _guard = self.save_lock.lock().unwrap();
        self.flush_all_locked();

        let mut live: Vec<(usize, Bucket)> = Vec::new();
        for (slot, atom) in self.jumptable.iter().enumerate() {
            let value = atom.load(Ordering::Acquire);
            if value == 0 {
                continue;
            }
            debug_assert!(value & MEMBIT == 0, "flush_all_locked leaves no in-memory buckets");
            let (bucket, _) = format::decode_bucket(self.disk_slice(value as u64))
                .map_err(|_| UtxoError::Corrupt(self.path.display().to_string(), "bucket decode failed during gc"))?;
            if !bucket.entries.is_empty() {
                live.push((slot, bucket));
            }
        }

        let capacity = self.mmap.read().unwrap().len() as u64;
        let final_path = data_path(&self.path);
        let tmp_path = final_path.with_extension("dat.gcnew");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| io_err(&tmp_path, e))?;
        file.set_len(capacity).map_err(|e| io_err(&tmp_path, e))?;
        let mut new_mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| io_err(&tmp_path, e))?;

        let mut cursor = 0u64;
        let mut new_jumptable = vec![0u32; JUMPTABLE_SLOTS];
        for (slot, bucket) in &live {
            let mut refs = Vec::with_capacity(bucket.entries.len());
            for entry in &bucket.entries {
                let leaf = self
                    .resolve_leaf(entry.leaf_location)
                    .ok_or_else(|| UtxoError::Corrupt(self.path.display().to_string(), "leaf missing during gc"))?;
                let bytes = format::encode_leaf(&leaf);
                let offset = cursor;
                new_mmap[offset as usize..offset as usize + bytes.len()].copy_from_slice(&bytes);
                cursor += bytes.len() as u64;
                refs.push(OutputRef { cheap_hash: entry.cheap_hash, leaf_location: LeafLocation::OnDisk(offset as u32) });
            }
            let bucket_bytes = format::encode_bucket(&Bucket { entries: refs });
            let bucket_offset = cursor;
            new_mmap[bucket_offset as usize..bucket_offset as usize + bucket_bytes.len()].copy_from_slice(&bucket_bytes);
            cursor += bucket_bytes.len() as u64;
            new_jumptable[*slot] = bucket_offset as u32;
        }
        new_mmap.flush().map_err(|e| io_err(&tmp_path, e))?;
        drop(new_mmap);
        drop(file);

        std::fs::rename(&tmp_path, &final_path).map_err(|e| io_err(&final_path, e))?;
        let reopened = OpenOptions::new().read(true).write(true).open(&final_path).map_err(|e| io_err(&final_path, e))?;
        let reopened_mmap = unsafe { MmapMut::map_mut(&reopened) }.map_err(|e| io_err(&final_path, e))?;

        *self.mmap.write().unwrap() = reopened_mmap;
        self.write_offset.store(cursor, Ordering::Release);
        for (slot, value) in new_jumptable.into_iter().enumerate() {
            self.jumptable[slot].store(value, Ordering::Release);
        }
        self.changes_since_prune.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn last_block_height(&self) -> u32 { self.last_block_height.load(Ordering::Relaxed) }

    pub fn last_block_id(&self) -> [u8; 32] { *self.last_block_id.lock().unwrap() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8, out_index: u32) -> OutputKey { OutputKey::new([byte; 32], out_index) }

    fn leaf(key: &OutputKey, height: u32) -> Leaf {
        Leaf { block_height: height, offset_in_block: 81, out_index: key.out_index, txid: key.txid }
    }

    #[test]
    fn insert_then_find_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let df = DataFile::create(dir.path().join("db1"), 0, 16 * 1024 * 1024).unwrap();
        let k = key(1, 0);
        df.insert(k, leaf(&k, 10));
        let (found, hint) = df.find(k).unwrap();
        assert_eq!(found.block_height, 10);
        let removed = df.remove(k).unwrap();
        assert_eq!(removed, found);
        assert!(df.find(k).is_none());
        let _ = hint;
    }

    #[test]
    fn rollback_undoes_mutations_since_last_commit() {
        let dir = tempfile::tempdir().unwrap();
        let df = DataFile::create(dir.path().join("db1"), 0, 16 * 1024 * 1024).unwrap();
        let k1 = key(2, 0);
        df.insert(k1, leaf(&k1, 1));
        df.commit_block(1, [1u8; 32]);

        let k2 = key(3, 0);
        df.insert(k2, leaf(&k2, 2));
        df.remove(k1);
        assert!(df.find(k1).is_none());
        assert!(df.find(k2).is_some());

        df.rollback();
        assert!(df.find(k1).is_some());
        assert!(df.find(k2).is_none());
    }

    #[test]
    fn flush_moves_leaves_and_buckets_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let df = DataFile::create(dir.path().join("db1"), 0, 16 * 1024 * 1024).unwrap();
        let k = key(4, 0);
        df.insert(k, leaf(&k, 5));
        df.commit_block(5, [5u8; 32]);
        df.flush_all();
        let (found, hint) = df.find(k).unwrap();
        assert_eq!(found.block_height, 5);
        assert!(matches!(hint.location(), LeafLocation::OnDisk(_)));
    }

    #[test]
    fn snapshot_round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("db1");
        let k = key(6, 0);
        {
            let df = DataFile::create(base.clone(), 0, 16 * 1024 * 1024).unwrap();
            df.insert(k, leaf(&k, 9));
            df.commit_block(9, [9u8; 32]);
            df.save_snapshot().unwrap();
        }
        let reopened = DataFile::open(base, 0, 16 * 1024 * 1024).unwrap();
        assert_eq!(reopened.last_block_height(), 9);
        let (found, _) = reopened.find(k).unwrap();
        assert_eq!(found.block_height, 9);
    }

    #[test]
    fn corrupted_checksum_is_rejected_on_load_older_state() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("db1");
        let df = DataFile::create(base.clone(), 0, 16 * 1024 * 1024).unwrap();
        let k = key(7, 0);
        df.insert(k, leaf(&k, 3));
        df.commit_block(3, [3u8; 32]);
        df.save_snapshot().unwrap();

        // Corrupt the retained snapshot's jumptable bytes.
        let path = info_path(&base, 0);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(!df.load_older_state(3).unwrap());
    }
}
