// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! On-disk tagged-record encodings for the info file and the
//! data file's leaf/bucket records, built on the same
//! tag/type/value primitive the wire protocol uses.

use cashhub_rpc::{Field, TagReader, TagWriter, TaggedError};

use super::bucket::{Bucket, Leaf, LeafLocation, OutputRef};

pub mod info_tag {
    pub const FIRST_BLOCK_HEIGHT: u32 = 1;
    pub const LAST_BLOCK_HEIGHT: u32 = 2;
    pub const LAST_BLOCK_ID: u32 = 3;
    pub const POSITION_IN_FILE: u32 = 4;
    pub const CHANGES_SINCE_PRUNE: u32 = 5;
    pub const INITIAL_BUCKET_SEGMENT_SIZE: u32 = 6;
    pub const IS_TIP: u32 = 7;
    pub const INVALID_BLOCK_HASH: u32 = 8;
    pub const JUMPTABLE_HASH: u32 = 9;
}

pub mod leaf_tag {
    pub const TXID: u32 = 1;
    pub const OUT_INDEX: u32 = 2;
    pub const BLOCK_HEIGHT: u32 = 3;
    pub const OFFSET_IN_BLOCK: u32 = 4;
}

pub mod bucket_tag {
    pub const CHEAP_HASH: u32 = 1;
    /// A plain absolute on-disk or in-memory leaf location. The original
    /// format's space-saving variants (`LeafPosRelToBucket`,
    /// `LeafPosOn512MB`, `LeafPosFromPrevLeaf`, `LeafPosRepeat`) are bucket
    /// -size micro-optimizations, not a correctness requirement; this
    /// re-implementation always emits `LEAF_POSITION` (see DESIGN.md).
    pub const LEAF_POSITION: u32 = 2;
}

/// Snapshot of a `DataFile`'s info-file header, minus the
/// jumptable bytes themselves which are stored/loaded separately.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct InfoHeader {
    pub first_block_height: u32,
    pub last_block_height: u32,
    pub last_block_id: [u8; 32],
    pub position_in_file: u64,
    pub changes_since_prune: u32,
    pub initial_bucket_segment_size: u32,
    pub is_tip: bool,
    pub invalid_block_hashes: Vec<[u8; 32]>,
    pub jumptable_hash: [u8; 32],
}

pub fn encode_info_header(h: &InfoHeader) -> Vec<u8> {
    let mut w = TagWriter::new();
    w.positive(info_tag::FIRST_BLOCK_HEIGHT, h.first_block_height as u64);
    w.positive(info_tag::LAST_BLOCK_HEIGHT, h.last_block_height as u64);
    w.u256(info_tag::LAST_BLOCK_ID, h.last_block_id);
    w.positive(info_tag::POSITION_IN_FILE, h.position_in_file);
    w.positive(info_tag::CHANGES_SINCE_PRUNE, h.changes_since_prune as u64);
    w.positive(info_tag::INITIAL_BUCKET_SEGMENT_SIZE, h.initial_bucket_segment_size as u64);
    w.boolean(info_tag::IS_TIP, h.is_tip);
    if h.is_tip {
        for hash in &h.invalid_block_hashes {
            w.u256(info_tag::INVALID_BLOCK_HASH, *hash);
        }
    }
    w.u256(info_tag::JUMPTABLE_HASH, h.jumptable_hash);
    w.separator();
    w.into_bytes()
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum FormatError {
    Tagged(TaggedError),
    MissingField(&'static str),
}

impl From<TaggedError> for FormatError {
    fn from(e: TaggedError) -> Self { FormatError::Tagged(e) }
}

pub fn decode_info_header(data: &[u8]) -> Result<InfoHeader, FormatError> {
    let mut r = TagReader::new(data);
    let mut first_block_height = None;
    let mut last_block_height = None;
    let mut last_block_id = None;
    let mut position_in_file = None;
    let mut changes_since_prune = None;
    let mut initial_bucket_segment_size = None;
    let mut is_tip = false;
    let mut invalid_block_hashes = Vec::new();
    let mut jumptable_hash = None;
    loop {
        match r.next()? {
            Field::Separator => break,
            Field::Positive(info_tag::FIRST_BLOCK_HEIGHT, v) => first_block_height = Some(v as u32),
            Field::Positive(info_tag::LAST_BLOCK_HEIGHT, v) => last_block_height = Some(v as u32),
            Field::U256(info_tag::LAST_BLOCK_ID, v) => last_block_id = Some(v),
            Field::Positive(info_tag::POSITION_IN_FILE, v) => position_in_file = Some(v),
            Field::Positive(info_tag::CHANGES_SINCE_PRUNE, v) => changes_since_prune = Some(v as u32),
            Field::Positive(info_tag::INITIAL_BUCKET_SEGMENT_SIZE, v) => initial_bucket_segment_size = Some(v as u32),
            Field::Bool(info_tag::IS_TIP, v) => is_tip = v,
            Field::U256(info_tag::INVALID_BLOCK_HASH, v) => invalid_block_hashes.push(v),
            Field::U256(info_tag::JUMPTABLE_HASH, v) => jumptable_hash = Some(v),
            _ => {}
        }
    }
    Ok(InfoHeader {
        first_block_height: first_block_height.ok_or(FormatError::MissingField("FirstBlockHeight"))?,
        last_block_height: last_block_height.ok_or(FormatError::MissingField("LastBlockHeight"))?,
        last_block_id: last_block_id.ok_or(FormatError::MissingField("LastBlockId"))?,
        position_in_file: position_in_file.ok_or(FormatError::MissingField("PositionInFile"))?,
        changes_since_prune: changes_since_prune.ok_or(FormatError::MissingField("ChangesSincePrune"))?,
        initial_bucket_segment_size: initial_bucket_segment_size
            .ok_or(FormatError::MissingField("InitialBucketSegmentSize"))?,
        is_tip,
        invalid_block_hashes,
        jumptable_hash: jumptable_hash.ok_or(FormatError::MissingField("JumpTableHash"))?,
    })
}

pub fn encode_leaf(leaf: &Leaf) -> Vec<u8> {
    let mut w = TagWriter::new();
    w.u256(leaf_tag::TXID, leaf.txid);
    if leaf.out_index != 0 {
        w.positive(leaf_tag::OUT_INDEX, leaf.out_index as u64);
    }
    w.positive(leaf_tag::BLOCK_HEIGHT, leaf.block_height as u64);
    w.positive(leaf_tag::OFFSET_IN_BLOCK, leaf.offset_in_block as u64);
    w.separator();
    w.into_bytes()
}

/// Decodes a leaf starting at `data[0]`, returning it plus the number of
/// bytes consumed so the caller can advance its cursor.
pub fn decode_leaf(data: &[u8]) -> Result<(Leaf, usize), FormatError> {
    let mut r = TagReader::new(data);
    let mut txid = None;
    let mut out_index = 0u32;
    let mut block_height = None;
    let mut offset_in_block = None;
    loop {
        match r.next()? {
            Field::Separator => break,
            Field::U256(leaf_tag::TXID, v) => txid = Some(v),
            Field::Positive(leaf_tag::OUT_INDEX, v) => out_index = v as u32,
            Field::Positive(leaf_tag::BLOCK_HEIGHT, v) => block_height = Some(v as u32),
            Field::Positive(leaf_tag::OFFSET_IN_BLOCK, v) => offset_in_block = Some(v as u32),
            _ => {}
        }
    }
    let leaf = Leaf {
        block_height: block_height.ok_or(FormatError::MissingField("BlockHeight"))?,
        offset_in_block: offset_in_block.ok_or(FormatError::MissingField("OffsetInBlock"))?,
        out_index,
        txid: txid.ok_or(FormatError::MissingField("TXID"))?,
    };
    Ok((leaf, r.position()))
}

pub fn encode_bucket(bucket: &Bucket) -> Vec<u8> {
    let mut w = TagWriter::new();
    for entry in &bucket.entries {
        w.positive(bucket_tag::CHEAP_HASH, entry.cheap_hash);
        w.positive(bucket_tag::LEAF_POSITION, entry.leaf_location.encode() as u64);
    }
    w.separator();
    w.into_bytes()
}

pub fn decode_bucket(data: &[u8]) -> Result<(Bucket, usize), FormatError> {
    let mut r = TagReader::new(data);
    let mut entries = Vec::new();
    let mut pending_cheap_hash = None;
    loop {
        match r.next()? {
            Field::Separator => break,
            Field::Positive(bucket_tag::CHEAP_HASH, v) => pending_cheap_hash = Some(v),
            Field::Positive(bucket_tag::LEAF_POSITION, v) => {
                let cheap_hash = pending_cheap_hash.ok_or(FormatError::MissingField("CheapHash"))?;
                entries.push(OutputRef { cheap_hash, leaf_location: LeafLocation::decode(v as u32) });
            }
            _ => {}
        }
    }
    Ok((Bucket { entries }, r.position()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_header_round_trips() {
        let header = InfoHeader {
            first_block_height: 1,
            last_block_height: 100,
            last_block_id: [9u8; 32],
            position_in_file: 4096,
            changes_since_prune: 3,
            initial_bucket_segment_size: 64,
            is_tip: true,
            invalid_block_hashes: vec![[1u8; 32]],
            jumptable_hash: [2u8; 32],
        };
        let bytes = encode_info_header(&header);
        assert_eq!(decode_info_header(&bytes).unwrap(), header);
    }

    #[test]
    fn leaf_round_trips_with_default_out_index_omitted() {
        let leaf = Leaf { block_height: 5, offset_in_block: 81, out_index: 0, txid: [3u8; 32] };
        let bytes = encode_leaf(&leaf);
        let (decoded, len) = decode_leaf(&bytes).unwrap();
        assert_eq!(decoded, leaf);
        assert_eq!(len, bytes.len());
        assert!(decoded.is_coinbase());
    }

    #[test]
    fn bucket_round_trips_multiple_entries() {
        let bucket = Bucket {
            entries: vec![
                OutputRef { cheap_hash: 1, leaf_location: LeafLocation::OnDisk(10) },
                OutputRef { cheap_hash: 2, leaf_location: LeafLocation::InMemory(4) },
            ],
        };
        let bytes = encode_bucket(&bucket);
        let (decoded, len) = decode_bucket(&bytes).unwrap();
        assert_eq!(decoded.entries, bucket.entries);
        assert_eq!(len, bytes.len());
    }
}
