// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! The append-only, memory-mapped UTXO storage engine: an
//! ordered sequence of [`DataFile`]s, consulted tip-first, each holding its
//! own jumptable plus leaf/bucket records.

mod bucket;
mod datafile;
mod format;
mod key;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub use bucket::{Leaf, LeafLocation, RmHint, MEMBIT};
pub use datafile::{UtxoError, FILE_FULL, FLUSH_THRESHOLD};
pub use key::OutputKey;

use datafile::DataFile;

/// Leaf plus the hint a follow-up `remove` can use to skip hash lookup and
/// file scan.
pub type FoundLeaf = (Leaf, RmHint);

/// An ordered sequence of `DataFile`s; only the newest ("tip") is writable
///.
pub struct Engine {
    dir: PathBuf,
    files: RwLock<Vec<DataFile>>,
    tip_capacity: u64,
}

impl Engine {
    /// Opens (or creates, if empty) the engine rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, UtxoError> {
        Self::open_with_capacity(dir, FILE_FULL)
    }

    pub fn open_with_capacity(dir: impl AsRef<Path>, tip_capacity: u64) -> Result<Self, UtxoError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| UtxoError::Io(dir.display().to_string(), e.to_string()))?;
        let base = dir.join("utxo.1");
        let first = if data_file_exists(&base) {
            DataFile::open(base, 0, tip_capacity)?
        } else {
            DataFile::create(base, 0, tip_capacity)?
        };
        Ok(Self { dir, files: RwLock::new(vec![first]), tip_capacity })
    }

    pub fn insert(&self, txid: [u8; 32], out_index: u32, block_height: u32, offset_in_block: u32) {
        let key = OutputKey::new(txid, out_index);
        let leaf = Leaf { block_height, offset_in_block, out_index, txid };
        let files = self.files.read().unwrap();
        files.last().expect("engine always has a tip DataFile").insert(key, leaf);
    }

    /// Inserts every output created by a block in one pass.
    pub fn insert_all(&self, outputs: impl IntoIterator<Item = (OutputKey, Leaf)>) {
        let files = self.files.read().unwrap();
        let tip = files.last().expect("engine always has a tip DataFile");
        for (key, leaf) in outputs {
            tip.insert(key, leaf);
        }
    }

    /// Looks up a key, consulting `DataFile`s tip-first.
    pub fn find(&self, txid: &[u8; 32], out_index: u32) -> Option<FoundLeaf> {
        let key = OutputKey::new(*txid, out_index);
        let files = self.files.read().unwrap();
        for file in files.iter().rev() {
            if let Some(found) = file.find(key) {
                return Some(found);
            }
        }
        None
    }

    /// Removes a key. `hint` is used to go straight to the right `DataFile`
    /// when known.
    pub fn remove(&self, txid: &[u8; 32], out_index: u32, hint: Option<RmHint>) -> Option<Leaf> {
        let key = OutputKey::new(*txid, out_index);
        let files = self.files.read().unwrap();
        if let Some(hint) = hint {
            if let Some(db_index) = hint.db_index() {
                let idx = (db_index - 1) as usize;
                if let Some(file) = files.get(idx) {
                    if let Some(leaf) = file.remove(key) {
                        return Some(leaf);
                    }
                }
            }
        }
        for file in files.iter().rev() {
            if let Some(leaf) = file.remove(key) {
                return Some(leaf);
            }
        }
        None
    }

    /// Promotes pending mutations to committed, rolling a new tip `DataFile`
    /// if the current one is near full and running GC on any older
    /// `DataFile` whose fragmentation or change count warrants it.
    pub fn commit_block(&self, height: u32, block_id: [u8; 32]) -> Result<(), UtxoError> {
        {
            let files = self.files.read().unwrap();
            files.last().expect("engine always has a tip DataFile").commit_block(height, block_id);
        }
        self.roll_tip_if_full()?;
        self.gc_if_needed()
    }

    /// Runs GC on every non-tip `DataFile` whose fragmentation or change
    /// count has crossed the threshold.
    fn gc_if_needed(&self) -> Result<(), UtxoError> {
        let files = self.files.read().unwrap();
        for file in files.iter() {
            if !file.is_tip() && file.needs_gc() {
                file.gc()?;
            }
        }
        Ok(())
    }

    /// Forces GC on the `DataFile` at `index`, regardless of threshold.
    /// Exposed for tests and operator tooling that want pruning on demand.
    pub fn force_gc(&self, index: usize) -> Result<(), UtxoError> {
        let files = self.files.read().unwrap();
        let file = files.get(index).ok_or_else(|| UtxoError::Corrupt(self.dir.display().to_string(), "no such DataFile index"))?;
        file.gc()
    }

    fn roll_tip_if_full(&self) -> Result<(), UtxoError> {
        let mut files = self.files.write().unwrap();
        let needs_roll = {
            let tip = files.last().expect("engine always has a tip DataFile");
            tip.write_offset() > self.tip_capacity * 9 / 10
        };
        if !needs_roll {
            return Ok(());
        }
        let (height, id) = {
            let tip = files.last().unwrap();
            tip.set_tip(false);
            (tip.last_block_height(), tip.last_block_id())
        };
        let next_index = files.len() as u32;
        let base = self.dir.join(format!("utxo.{}", next_index + 1));
        let new_tip = DataFile::create(base, next_index, self.tip_capacity)?;
        new_tip.commit_block(height, id);
        files.push(new_tip);
        Ok(())
    }

    pub fn rollback(&self) {
        let files = self.files.read().unwrap();
        files.last().expect("engine always has a tip DataFile").rollback();
    }

    pub fn save_snapshot(&self) -> Result<(), UtxoError> {
        let files = self.files.read().unwrap();
        for file in files.iter() {
            file.save_snapshot()?;
        }
        Ok(())
    }

    pub fn set_failed_block_id(&self, block_id: [u8; 32]) {
        let files = self.files.read().unwrap();
        files.last().expect("engine always has a tip DataFile").set_failed_block_id(block_id);
    }

    pub fn block_id_has_failed(&self, block_id: &[u8; 32]) -> bool {
        let files = self.files.read().unwrap();
        files.last().expect("engine always has a tip DataFile").block_id_has_failed(block_id)
    }

    /// Re-opens every `DataFile` at the newest snapshot `<= max_height`
    ///. Returns `false` if any `DataFile`
    /// lacks a consistent snapshot.
    pub fn load_older_state(&self, max_height: u32) -> Result<bool, UtxoError> {
        let files = self.files.read().unwrap();
        for file in files.iter() {
            if !file.load_older_state(max_height)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn data_file_exists(base: &Path) -> bool { base.with_extension("dat").exists() }

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open_with_capacity(dir.path(), 16 * 1024 * 1024).unwrap();
        (dir, engine)
    }

    #[test]
    fn insert_find_remove_across_engine() {
        let (_dir, engine) = tmp_engine();
        let txid = [11u8; 32];
        engine.insert(txid, 0, 100, 81);
        let (leaf, hint) = engine.find(&txid, 0).unwrap();
        assert_eq!(leaf.block_height, 100);
        let removed = engine.remove(&txid, 0, Some(hint)).unwrap();
        assert_eq!(removed, leaf);
        assert!(engine.find(&txid, 0).is_none());
    }

    #[test]
    fn commit_and_rollback_are_the_engine_linearization_points() {
        let (_dir, engine) = tmp_engine();
        let txid = [22u8; 32];
        engine.insert(txid, 0, 5, 81);
        engine.commit_block(5, [5u8; 32]).unwrap();

        engine.insert([33u8; 32], 0, 6, 81);
        engine.rollback();
        assert!(engine.find(&[33u8; 32], 0).is_none());
        assert!(engine.find(&txid, 0).is_some());
    }

    #[test]
    fn double_remove_is_none_not_an_error() {
        let (_dir, engine) = tmp_engine();
        let txid = [44u8; 32];
        engine.insert(txid, 0, 1, 81);
        assert!(engine.remove(&txid, 0, None).is_some());
        assert!(engine.remove(&txid, 0, None).is_none());
    }

    #[test]
    fn gc_preserves_content_of_unremoved_keys() {
        let (_dir, engine) = tmp_engine();
        let count = 5_000u32;
        let mut txids = Vec::with_capacity(count as usize);
        for i in 0..count {
            let txid = {
                let mut t = [0u8; 32];
                t[..4].copy_from_slice(&i.to_le_bytes());
                t
            };
            engine.insert(txid, 0, 1, 81);
            txids.push(txid);
        }
        engine.commit_block(1, [1u8; 32]).unwrap();

        let mut expected = std::collections::HashMap::new();
        for (i, txid) in txids.iter().enumerate() {
            if i % 2 == 0 {
                engine.remove(txid, 0, None).unwrap();
            } else {
                let (leaf, _) = engine.find(txid, 0).unwrap();
                expected.insert(*txid, leaf);
            }
        }
        engine.commit_block(2, [2u8; 32]).unwrap();

        engine.force_gc(0).unwrap();

        for (txid, leaf) in &expected {
            let (found, _) = engine.find(txid, 0).expect("un-removed key must still be findable after gc");
            assert_eq!(&found, leaf, "leaf bytes must be bit-identical after gc");
        }
        for (i, txid) in txids.iter().enumerate() {
            if i % 2 == 0 {
                assert!(engine.find(txid, 0).is_none(), "removed key must stay removed after gc");
            }
        }
    }

    #[test]
    fn reopening_recovers_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let txid = [55u8; 32];
        {
            let engine = Engine::open_with_capacity(dir.path(), 16 * 1024 * 1024).unwrap();
            engine.insert(txid, 0, 42, 81);
            engine.commit_block(42, [42u8; 32]).unwrap();
            engine.save_snapshot().unwrap();
        }
        let engine = Engine::open_with_capacity(dir.path(), 16 * 1024 * 1024).unwrap();
        let (leaf, _) = engine.find(&txid, 0).unwrap();
        assert_eq!(leaf.block_height, 42);
    }
}
