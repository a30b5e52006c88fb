// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! ParserKit: the `TransactionSerializationOptions` filter
//! shared by `GetBlock`, `GetTransaction`, and `SearchMempool`, built on
//! top of [`crate::codec`]'s lazy transaction cursor.

use std::collections::HashSet;

use cashhub_rpc::TagWriter;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::codec::{CodecError, Cursor, Tag};

pub mod tx_tag {
    pub const TXID: u32 = 1;
    pub const OFFSET_IN_BLOCK: u32 = 2;
    pub const RAW_BYTES: u32 = 3;
    pub const IN_TXID: u32 = 4;
    pub const IN_OUT_INDEX: u32 = 5;
    pub const IN_SCRIPT: u32 = 6;
    pub const OUT_INDEX: u32 = 7;
    pub const OUT_VALUE: u32 = 8;
    pub const OUT_SCRIPT: u32 = 9;
    pub const OUT_ADDRESS: u32 = 10;
    pub const OUT_SCRIPT_HASH: u32 = 11;
}

/// Which sub-fields of a transaction to serialize; shared by `GetBlock`,
/// `GetTransaction` and `SearchMempool`.
#[derive(Clone, Debug, Default)]
pub struct TransactionSerializationOptions {
    pub return_inputs: bool,
    pub return_outputs: bool,
    pub return_output_amounts: bool,
    pub return_output_scripts: bool,
    pub return_output_addresses: bool,
    pub return_output_script_hashes: bool,
    pub filter_outputs: HashSet<u32>,
}

impl TransactionSerializationOptions {
    fn output_included(&self, index: u32) -> bool {
        self.filter_outputs.is_empty() || self.filter_outputs.contains(&index)
    }
}

/// Rough per-field byte budget added on top of a field's actual payload
/// length, covering the tag byte plus its varint length prefix.
const TAG_OVERHEAD: usize = 8;

/// `SHA256(RIPEMD160(x))`... no — `RIPEMD160(SHA256(x))`, Bitcoin's
/// standard `HASH160`.
fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Recognizes a standard p2pkh script (`OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`).
fn solve_p2pkh(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25 && script[0] == 0x76 && script[1] == 0xa9 && script[2] == 0x14 && script[23] == 0x88 && script[24] == 0xac
    {
        Some(script[3..23].try_into().unwrap())
    } else {
        None
    }
}

/// Recognizes a standard p2pk script (compressed or uncompressed pubkey
/// push followed by `OP_CHECKSIG`), returning `HASH160` of the pubkey so
/// it can be indexed the same way a p2pkh output is.
fn solve_p2pk(script: &[u8]) -> Option<[u8; 20]> {
    let pubkey = match script.len() {
        35 if script[0] == 0x21 && script[34] == 0xac => &script[1..34],
        67 if script[0] == 0x41 && script[66] == 0xac => &script[1..66],
        _ => return None,
    };
    Some(hash160(pubkey))
}

/// Resolves a 20-byte address hash for the two standard script forms
/// (P2PKH, P2PK); any other script form yields `None`.
pub fn solve_address(script: &[u8]) -> Option<[u8; 20]> {
    solve_p2pkh(script).or_else(|| solve_p2pk(script))
}

/// `SHA256d` transaction id: Bitcoin's usual double hash.
pub fn compute_txid(tx_bytes: &[u8]) -> [u8; 32] { Sha256::digest(Sha256::digest(tx_bytes)).into() }

/// Walks one transaction's bytes with `options` applied, writing the
/// requested tagged fields. `tx_bytes` must contain exactly
/// one transaction.
pub fn serialize_transaction(
    tx_bytes: &[u8],
    options: &TransactionSerializationOptions,
    writer: &mut TagWriter,
) -> Result<(), CodecError> {
    let mut cur = Cursor::new(tx_bytes, 0);
    let mut out_idx: u32 = 0;
    let mut pending_in_txid: Option<[u8; 32]> = None;
    let mut pending_in_index: Option<u32> = None;
    loop {
        match cur.next()? {
            Tag::PrevTxHash => pending_in_txid = Some(*cur.u256_data()?),
            Tag::PrevTxIndex => pending_in_index = Some(cur.int_data()?),
            Tag::TxInScript => {
                if options.return_inputs {
                    writer.u256(tx_tag::IN_TXID, pending_in_txid.take().unwrap_or([0u8; 32]));
                    writer.positive(tx_tag::IN_OUT_INDEX, pending_in_index.take().unwrap_or(0) as u64);
                    writer.bytes(tx_tag::IN_SCRIPT, cur.byte_data()?);
                }
            }
            Tag::OutputValue => {
                if options.return_outputs && options.return_output_amounts && options.output_included(out_idx) {
                    writer.positive(tx_tag::OUT_VALUE, cur.long_data()?);
                }
            }
            Tag::OutputScript => {
                if options.return_outputs && options.output_included(out_idx) {
                    writer.positive(tx_tag::OUT_INDEX, out_idx as u64);
                    let script = cur.byte_data()?;
                    if options.return_output_scripts {
                        writer.bytes(tx_tag::OUT_SCRIPT, script);
                    }
                    if options.return_output_script_hashes {
                        writer.u256(tx_tag::OUT_SCRIPT_HASH, cur.hashed_byte_data()?);
                    }
                    if options.return_output_addresses {
                        if let Some(hash) = solve_address(script) {
                            writer.bytes(tx_tag::OUT_ADDRESS, &hash);
                        }
                    }
                }
                out_idx += 1;
            }
            Tag::End => break,
            _ => {}
        }
    }
    Ok(())
}

/// Exact byte count `serialize_transaction` will write for the same
/// `options`, used by `Direct` parsers to pre-size their reply buffer
///. Walking twice is simpler and no
/// less correct than hand-maintained per-field constants; both passes
/// are allocation-free.
pub fn calculate_needed_size(tx_bytes: &[u8], options: &TransactionSerializationOptions) -> Result<usize, CodecError> {
    let mut cur = Cursor::new(tx_bytes, 0);
    let mut out_idx: u32 = 0;
    let mut size = 0usize;
    let mut have_pending_input = false;
    loop {
        match cur.next()? {
            Tag::TxInScript => {
                if options.return_inputs {
                    have_pending_input = true;
                    size += TAG_OVERHEAD * 3 + 32 + 8 + cur.byte_data()?.len();
                }
            }
            Tag::OutputValue => {
                if options.return_outputs && options.return_output_amounts && options.output_included(out_idx) {
                    size += TAG_OVERHEAD + 8;
                }
            }
            Tag::OutputScript => {
                if options.return_outputs && options.output_included(out_idx) {
                    size += TAG_OVERHEAD; // OUT_INDEX
                    let script = cur.byte_data()?;
                    if options.return_output_scripts {
                        size += TAG_OVERHEAD + script.len();
                    }
                    if options.return_output_script_hashes {
                        size += TAG_OVERHEAD + 32;
                    }
                    if options.return_output_addresses && solve_address(script).is_some() {
                        size += TAG_OVERHEAD + 20;
                    }
                }
                out_idx += 1;
            }
            Tag::End => break,
            _ => {}
        }
    }
    let _ = have_pending_input;
    Ok(size)
}

/// Per-connection set of script hashes a `GetBlock` request wants to
/// filter on, bounded by `-api_max_addresses`.
pub struct ScriptHashFilter {
    max: usize,
    hashes: HashSet<[u8; 32]>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FilterFull;

impl ScriptHashFilter {
    pub fn new(max: usize) -> Self { Self { max, hashes: HashSet::new() } }

    pub fn register(&mut self, hash: [u8; 32]) -> Result<(), FilterFull> {
        if self.hashes.len() >= self.max && !self.hashes.contains(&hash) {
            return Err(FilterFull);
        }
        self.hashes.insert(hash);
        Ok(())
    }

    /// Empty filter matches everything.
    pub fn matches(&self, hash: &[u8; 32]) -> bool { self.hashes.is_empty() || self.hashes.contains(hash) }
}

/// Whether any output of `tx_bytes` has a script matching `filter`.
pub fn transaction_matches_filter(tx_bytes: &[u8], filter: &ScriptHashFilter) -> Result<bool, CodecError> {
    if filter.hashes.is_empty() {
        return Ok(true);
    }
    let mut cur = Cursor::new(tx_bytes, 0);
    loop {
        match cur.next()? {
            Tag::OutputScript => {
                let hash = cur.hashed_byte_data()?;
                if filter.matches(&hash) {
                    return Ok(true);
                }
            }
            Tag::End => return Ok(false),
            _ => {}
        }
    }
}

/// Walks every transaction in a block, keeping only those that pass
/// `filter`, and writing `Tx_OffsetInBlock`, `TxId`, optional raw bytes,
/// and the requested filtered subset for each kept transaction.
pub fn serialize_block(
    block_bytes: &[u8],
    filter: &ScriptHashFilter,
    options: &TransactionSerializationOptions,
    include_raw: bool,
    writer: &mut TagWriter,
) -> Result<(), CodecError> {
    let mut cur = Cursor::for_block(block_bytes)?;
    loop {
        let start_tag = cur.next()?;
        if start_tag == Tag::End && cur.at_block_end() {
            break;
        }
        // Walk the rest of this transaction to find its boundaries.
        let mut tag = start_tag;
        while tag != Tag::End {
            tag = cur.next()?;
        }
        let (offset, len) = cur.prev_tx();
        let tx_bytes = &block_bytes[offset..offset + len];
        if transaction_matches_filter(tx_bytes, filter)? {
            writer.positive(tx_tag::OFFSET_IN_BLOCK, offset as u64);
            writer.u256(tx_tag::TXID, compute_txid(tx_bytes));
            if include_raw {
                writer.bytes(tx_tag::RAW_BYTES, tx_bytes);
            }
            serialize_transaction(tx_bytes, options, writer)?;
        }
        if cur.at_block_end() {
            break;
        }
    }
    Ok(())
}

/// Exact byte-bound for [`serialize_block`]'s output, the block-level
/// counterpart of [`calculate_needed_size`]: same per-tx bound,
/// summed over every transaction the filter keeps.
pub fn calculate_block_reply_size(
    block_bytes: &[u8],
    filter: &ScriptHashFilter,
    options: &TransactionSerializationOptions,
    include_raw: bool,
) -> Result<usize, CodecError> {
    let mut cur = Cursor::for_block(block_bytes)?;
    let mut size = 0usize;
    loop {
        let start_tag = cur.next()?;
        if start_tag == Tag::End && cur.at_block_end() {
            break;
        }
        let mut tag = start_tag;
        while tag != Tag::End {
            tag = cur.next()?;
        }
        let (offset, len) = cur.prev_tx();
        let tx_bytes = &block_bytes[offset..offset + len];
        if transaction_matches_filter(tx_bytes, filter)? {
            size += TAG_OVERHEAD * 2 + 8 + 32; // OFFSET_IN_BLOCK + TXID
            if include_raw {
                size += TAG_OVERHEAD + tx_bytes.len();
            }
            size += calculate_needed_size(tx_bytes, options)?;
        }
        if cur.at_block_end() {
            break;
        }
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&1i32.to_le_bytes());
        tx.push(1);
        tx.extend_from_slice(&[7u8; 32]);
        tx.extend_from_slice(&0xffffffffu32.to_le_bytes());
        tx.push(4);
        tx.extend_from_slice(b"abcd");
        tx.extend_from_slice(&0xffffffffu32.to_le_bytes());
        tx.push(2);
        tx.extend_from_slice(&5_000_000_000u64.to_le_bytes());
        let p2pkh: [u8; 25] = {
            let mut s = [0u8; 25];
            s[0] = 0x76;
            s[1] = 0xa9;
            s[2] = 0x14;
            s[23] = 0x88;
            s[24] = 0xac;
            s
        };
        tx.push(25);
        tx.extend_from_slice(&p2pkh);
        tx.extend_from_slice(&1_000_000u64.to_le_bytes());
        tx.push(3);
        tx.extend_from_slice(b"xyz");
        tx.extend_from_slice(&0u32.to_le_bytes());
        tx
    }

    #[test]
    fn p2pkh_script_resolves_to_its_embedded_hash() {
        let mut script = [0u8; 25];
        script[0] = 0x76;
        script[1] = 0xa9;
        script[2] = 0x14;
        script[3..23].copy_from_slice(&[9u8; 20]);
        script[23] = 0x88;
        script[24] = 0xac;
        assert_eq!(solve_address(&script), Some([9u8; 20]));
    }

    #[test]
    fn non_standard_script_has_no_address() {
        assert_eq!(solve_address(b"not a script"), None);
    }

    #[test]
    fn serialize_transaction_respects_requested_fields() {
        let tx = sample_tx();
        let options = TransactionSerializationOptions {
            return_inputs: true,
            return_outputs: true,
            return_output_amounts: true,
            return_output_scripts: false,
            return_output_addresses: true,
            return_output_script_hashes: true,
            filter_outputs: HashSet::from([0]),
        };
        let mut w = TagWriter::new();
        serialize_transaction(&tx, &options, &mut w).unwrap();
        let bytes = w.into_bytes();
        assert!(!bytes.is_empty());
        // Computed size should be an exact upper bound for what was written.
        let bound = calculate_needed_size(&tx, &options).unwrap();
        assert!(bytes.len() <= bound);
    }

    #[test]
    fn filter_outputs_excludes_the_other_index() {
        let tx = sample_tx();
        let all = TransactionSerializationOptions {
            return_outputs: true,
            return_output_amounts: true,
            ..Default::default()
        };
        let only_second = TransactionSerializationOptions { filter_outputs: HashSet::from([1]), ..all.clone() };
        let mut w_all = TagWriter::new();
        serialize_transaction(&tx, &all, &mut w_all).unwrap();
        let mut w_one = TagWriter::new();
        serialize_transaction(&tx, &only_second, &mut w_one).unwrap();
        assert!(w_one.into_bytes().len() < w_all.into_bytes().len());
    }

    #[test]
    fn script_hash_filter_enforces_its_bound() {
        let mut filter = ScriptHashFilter::new(2);
        filter.register([1u8; 32]).unwrap();
        filter.register([2u8; 32]).unwrap();
        assert!(matches!(filter.register([3u8; 32]), Err(FilterFull)));
        assert!(filter.matches(&[1u8; 32]));
        assert!(!filter.matches(&[3u8; 32]));
    }

    #[test]
    fn empty_filter_matches_every_transaction() {
        let tx = sample_tx();
        let filter = ScriptHashFilter::new(10);
        assert!(transaction_matches_filter(&tx, &filter).unwrap());
    }

    #[test]
    fn serialize_block_keeps_only_matching_transactions() {
        let tx = sample_tx();
        let mut block = Vec::new();
        block.extend_from_slice(&[0u8; 80]);
        block.push(2);
        block.extend_from_slice(&tx);
        block.extend_from_slice(&tx);

        let p2pkh_hash: [u8; 32] = {
            let mut s = [0u8; 25];
            s[0] = 0x76;
            s[1] = 0xa9;
            s[2] = 0x14;
            s[23] = 0x88;
            s[24] = 0xac;
            Sha256::digest(s).into()
        };
        let mut filter = ScriptHashFilter::new(10);
        filter.register(p2pkh_hash).unwrap();

        let options = TransactionSerializationOptions::default();
        let mut w = TagWriter::new();
        serialize_block(&block, &filter, &options, false, &mut w).unwrap();
        let bytes = w.into_bytes();
        assert!(!bytes.is_empty());

        let mut w_empty = TagWriter::new();
        let empty_filter = ScriptHashFilter::new(10);
        // Registering a hash nobody has guarantees no match.
        let mut no_match = ScriptHashFilter::new(10);
        no_match.register([0xffu8; 32]).unwrap();
        serialize_block(&block, &no_match, &options, false, &mut w_empty).unwrap();
        assert!(w_empty.into_bytes().is_empty());
        let _ = empty_filter;
    }

    #[test]
    fn block_reply_bound_covers_the_actual_encoding() {
        let tx = sample_tx();
        let mut block = Vec::new();
        block.extend_from_slice(&[0u8; 80]);
        block.push(1);
        block.extend_from_slice(&tx);

        let filter = ScriptHashFilter::new(10);
        let options = TransactionSerializationOptions { return_outputs: true, return_output_amounts: true, ..Default::default() };
        let bound = calculate_block_reply_size(&block, &filter, &options, true).unwrap();
        let mut w = TagWriter::new();
        serialize_block(&block, &filter, &options, true, &mut w).unwrap();
        assert!(w.into_bytes().len() <= bound);
    }
}
