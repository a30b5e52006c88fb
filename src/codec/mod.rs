// Cash Hub core: TxCodec.
//
// SPDX-License-Identifier: MIT

//! Stream-decodes a transaction or a block byte-by-byte without building a
//! tree. The cursor never allocates per field — it borrows from
//! the underlying buffer and exposes typed accessors for the value of the
//! field it most recently produced.

use sha2::{Digest, Sha256};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Tag {
    TxVersion,
    PrevTxHash,
    PrevTxIndex,
    TxInScript,
    Sequence,
    OutputValue,
    OutputScript,
    LockTime,
    /// Terminates one transaction. Two in a row mean the block ended.
    End,
}

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum CodecError {
    /// buffer ended while reading a {0}.
    Truncated(&'static str),
    /// called the wrong typed accessor for the last-produced field.
    WrongAccessor,
    /// varint length prefix {0} exceeds the sanity limit.
    ScriptTooLarge(u64),
}

#[derive(Copy, Clone, Debug)]
enum LastValue {
    None,
    Int(u32),
    Long(u64),
    Bytes { offset: usize, len: usize },
    U256 { offset: usize },
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Phase {
    Version,
    InputHash,
    InputIndex,
    InputScript,
    InputSequence,
    OutputValue,
    OutputScript,
    LockTime,
    TxEnd,
    BlockEnd,
}

/// A lazy, allocation-free walk over raw transaction bytes.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    phase: Phase,
    remaining_txs: u64,
    num_inputs: u64,
    input_idx: u64,
    num_outputs: u64,
    output_idx: u64,
    tx_start: usize,
    last: LastValue,
    block_boundary: bool,
}

use amplify::{Display, Error};

impl<'a> Cursor<'a> {
    /// Constructs a cursor positioned at a single transaction's start.
    pub fn new(data: &'a [u8], start_offset: usize) -> Self {
        Self::for_transactions(data, start_offset, 1)
    }

    /// Constructs a cursor that will walk `tx_count` consecutive
    /// transactions starting at `start_offset` (as found after a block's
    /// 80-byte header and transaction-count varint).
    pub fn for_transactions(data: &'a [u8], start_offset: usize, tx_count: u64) -> Self {
        Cursor {
            data,
            pos: start_offset,
            phase: Phase::Version,
            remaining_txs: tx_count,
            num_inputs: 0,
            input_idx: 0,
            num_outputs: 0,
            output_idx: 0,
            tx_start: start_offset,
            last: LastValue::None,
            block_boundary: false,
        }
    }

    /// Reads the block header (80 bytes) and the transaction-count varint
    /// that follows it, returning a cursor ready to walk every transaction
    /// in the block.
    pub fn for_block(block: &'a [u8]) -> Result<Self, CodecError> {
        const HEADER_LEN: usize = 80;
        if block.len() < HEADER_LEN {
            return Err(CodecError::Truncated("block header"));
        }
        let mut pos = HEADER_LEN;
        let count = read_varint(block, &mut pos, "tx count")?;
        Ok(Self::for_transactions(block, pos, count))
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        let slice = self.data.get(self.pos..self.pos + 4).ok_or(CodecError::Truncated(what))?;
        self.pos += 4;
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    }

    fn read_u64(&mut self, what: &'static str) -> Result<u64, CodecError> {
        let slice = self.data.get(self.pos..self.pos + 8).ok_or(CodecError::Truncated(what))?;
        self.pos += 8;
        Ok(u64::from_le_bytes(slice.try_into().unwrap()))
    }

    fn read_u256(&mut self, what: &'static str) -> Result<usize, CodecError> {
        if self.pos + 32 > self.data.len() {
            return Err(CodecError::Truncated(what));
        }
        let offset = self.pos;
        self.pos += 32;
        Ok(offset)
    }

    fn read_script(&mut self) -> Result<(usize, usize), CodecError> {
        let len = read_varint(self.data, &mut self.pos, "script length")?;
        const MAX_SCRIPT_LEN: u64 = 10_000_000;
        if len > MAX_SCRIPT_LEN {
            return Err(CodecError::ScriptTooLarge(len));
        }
        let offset = self.pos;
        let len = len as usize;
        if offset + len > self.data.len() {
            return Err(CodecError::Truncated("script body"));
        }
        self.pos += len;
        Ok((offset, len))
    }

    /// Advances to the next field tag, in document order.
    pub fn next(&mut self) -> Result<Tag, CodecError> {
        match self.phase {
            Phase::Version => {
                self.tx_start = self.pos;
                let v = self.read_u32("tx version")?;
                self.last = LastValue::Int(v);
                self.num_inputs = read_varint(self.data, &mut self.pos, "input count")?;
                self.input_idx = 0;
                self.phase =
                    if self.num_inputs == 0 { Phase::OutputValue } else { Phase::InputHash };
                // input count for zero inputs still needs the output count read below;
                // handled by falling through on the next call.
                if self.num_inputs == 0 {
                    self.num_outputs = read_varint(self.data, &mut self.pos, "output count")?;
                    self.output_idx = 0;
                }
                Ok(Tag::TxVersion)
            }
            Phase::InputHash => {
                let offset = self.read_u256("prev txid")?;
                self.last = LastValue::U256 { offset };
                self.phase = Phase::InputIndex;
                Ok(Tag::PrevTxHash)
            }
            Phase::InputIndex => {
                let v = self.read_u32("prev out index")?;
                self.last = LastValue::Int(v);
                self.phase = Phase::InputScript;
                Ok(Tag::PrevTxIndex)
            }
            Phase::InputScript => {
                let (offset, len) = self.read_script()?;
                self.last = LastValue::Bytes { offset, len };
                self.phase = Phase::InputSequence;
                Ok(Tag::TxInScript)
            }
            Phase::InputSequence => {
                let v = self.read_u32("sequence")?;
                self.last = LastValue::Int(v);
                self.input_idx += 1;
                if self.input_idx < self.num_inputs {
                    self.phase = Phase::InputHash;
                } else {
                    self.num_outputs = read_varint(self.data, &mut self.pos, "output count")?;
                    self.output_idx = 0;
                    self.phase = Phase::OutputValue;
                }
                Ok(Tag::Sequence)
            }
            Phase::OutputValue => {
                let v = self.read_u64("output value")?;
                self.last = LastValue::Long(v);
                self.phase = Phase::OutputScript;
                Ok(Tag::OutputValue)
            }
            Phase::OutputScript => {
                let (offset, len) = self.read_script()?;
                self.last = LastValue::Bytes { offset, len };
                self.output_idx += 1;
                self.phase = if self.output_idx < self.num_outputs {
                    Phase::OutputValue
                } else {
                    Phase::LockTime
                };
                Ok(Tag::OutputScript)
            }
            Phase::LockTime => {
                let v = self.read_u32("lock time")?;
                self.last = LastValue::Int(v);
                self.phase = Phase::TxEnd;
                Ok(Tag::LockTime)
            }
            Phase::TxEnd => {
                self.last = LastValue::None;
                self.block_boundary = false;
                self.remaining_txs = self.remaining_txs.saturating_sub(1);
                self.phase = if self.remaining_txs > 0 { Phase::Version } else { Phase::BlockEnd };
                Ok(Tag::End)
            }
            Phase::BlockEnd => {
                self.last = LastValue::None;
                self.block_boundary = true;
                Ok(Tag::End)
            }
        }
    }

    /// Whether the last `End` produced was the second, block-boundary one.
    pub fn at_block_end(&self) -> bool { self.block_boundary }

    pub fn int_data(&self) -> Result<u32, CodecError> {
        match self.last {
            LastValue::Int(v) => Ok(v),
            _ => Err(CodecError::WrongAccessor),
        }
    }

    pub fn long_data(&self) -> Result<u64, CodecError> {
        match self.last {
            LastValue::Long(v) => Ok(v),
            _ => Err(CodecError::WrongAccessor),
        }
    }

    pub fn byte_data(&self) -> Result<&'a [u8], CodecError> {
        match self.last {
            LastValue::Bytes { offset, len } => Ok(&self.data[offset..offset + len]),
            _ => Err(CodecError::WrongAccessor),
        }
    }

    pub fn u256_data(&self) -> Result<&'a [u8; 32], CodecError> {
        match self.last {
            LastValue::U256 { offset } => Ok(self.data[offset..offset + 32].try_into().unwrap()),
            _ => Err(CodecError::WrongAccessor),
        }
    }

    /// `SHA256` of the current `OutputScript`'s bytes, used by script-hash
    /// indexing.
    pub fn hashed_byte_data(&self) -> Result<[u8; 32], CodecError> {
        let script = self.byte_data()?;
        Ok(Sha256::digest(script).into())
    }

    /// A cheap (offset, length) reference to the transaction just walked
    /// past, valid once `End` has been produced for it.
    pub fn prev_tx(&self) -> (usize, usize) { (self.tx_start, self.pos - self.tx_start) }

    pub fn position(&self) -> usize { self.pos }
}

/// Reads a Bitcoin `CompactSize` varint.
pub fn read_varint(data: &[u8], pos: &mut usize, what: &'static str) -> Result<u64, CodecError> {
    let first = *data.get(*pos).ok_or(CodecError::Truncated(what))?;
    *pos += 1;
    match first {
        0..=0xfc => Ok(first as u64),
        0xfd => {
            let slice = data.get(*pos..*pos + 2).ok_or(CodecError::Truncated(what))?;
            *pos += 2;
            Ok(u16::from_le_bytes(slice.try_into().unwrap()) as u64)
        }
        0xfe => {
            let slice = data.get(*pos..*pos + 4).ok_or(CodecError::Truncated(what))?;
            *pos += 4;
            Ok(u32::from_le_bytes(slice.try_into().unwrap()) as u64)
        }
        0xff => {
            let slice = data.get(*pos..*pos + 8).ok_or(CodecError::Truncated(what))?;
            *pos += 8;
            Ok(u64::from_le_bytes(slice.try_into().unwrap()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One coinbase-shaped transaction: version, 1 input (null prevout),
    /// one output, locktime.
    fn sample_tx() -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&1i32.to_le_bytes()); // version
        tx.push(1); // input count
        tx.extend_from_slice(&[0u8; 32]); // prev txid (null)
        tx.extend_from_slice(&0xffffffffu32.to_le_bytes()); // prev index
        tx.push(4); // script len
        tx.extend_from_slice(b"abcd"); // script
        tx.extend_from_slice(&0xffffffffu32.to_le_bytes()); // sequence
        tx.push(1); // output count
        tx.extend_from_slice(&5_000_000_000u64.to_le_bytes()); // value
        tx.push(3); // script len
        tx.extend_from_slice(b"xyz"); // script
        tx.extend_from_slice(&0u32.to_le_bytes()); // locktime
        tx
    }

    #[test]
    fn walks_every_field_in_order() {
        let tx = sample_tx();
        let mut cur = Cursor::new(&tx, 0);
        assert_eq!(cur.next().unwrap(), Tag::TxVersion);
        assert_eq!(cur.int_data().unwrap(), 1);
        assert_eq!(cur.next().unwrap(), Tag::PrevTxHash);
        assert_eq!(cur.u256_data().unwrap(), &[0u8; 32]);
        assert_eq!(cur.next().unwrap(), Tag::PrevTxIndex);
        assert_eq!(cur.int_data().unwrap(), 0xffffffff);
        assert_eq!(cur.next().unwrap(), Tag::TxInScript);
        assert_eq!(cur.byte_data().unwrap(), b"abcd");
        assert_eq!(cur.next().unwrap(), Tag::Sequence);
        assert_eq!(cur.next().unwrap(), Tag::OutputValue);
        assert_eq!(cur.long_data().unwrap(), 5_000_000_000);
        assert_eq!(cur.next().unwrap(), Tag::OutputScript);
        assert_eq!(cur.byte_data().unwrap(), b"xyz");
        assert_eq!(cur.next().unwrap(), Tag::LockTime);
        assert_eq!(cur.next().unwrap(), Tag::End);
        assert!(!cur.at_block_end());
        assert_eq!(cur.next().unwrap(), Tag::End, "second End in a row signals block boundary");
        assert!(cur.at_block_end());
        assert_eq!(cur.prev_tx(), (0, tx.len()));
    }

    #[test]
    fn hashed_byte_data_matches_sha256() {
        let tx = sample_tx();
        let mut cur = Cursor::new(&tx, 0);
        while cur.next().unwrap() != Tag::OutputScript {}
        let expected: [u8; 32] = Sha256::digest(b"xyz").into();
        assert_eq!(cur.hashed_byte_data().unwrap(), expected);
    }

    #[test]
    fn truncated_buffer_errors_not_panics() {
        let mut tx = sample_tx();
        tx.truncate(37); // version + input count + prev txid, no room for prev index
        let mut cur = Cursor::new(&tx, 0);
        assert_eq!(cur.next().unwrap(), Tag::TxVersion);
        assert_eq!(cur.next().unwrap(), Tag::PrevTxHash);
        assert!(matches!(cur.next(), Err(CodecError::Truncated(_))));
    }

    #[test]
    fn walks_two_transactions_in_a_block_slice() {
        let tx = sample_tx();
        let mut data = Vec::new();
        data.extend_from_slice(&tx);
        data.extend_from_slice(&tx);
        let mut cur = Cursor::for_transactions(&data, 0, 2);
        let mut total_ends = 0;
        loop {
            let tag = cur.next().unwrap();
            if tag == Tag::End {
                total_ends += 1;
            }
            if cur.at_block_end() {
                break;
            }
        }
        // one End per transaction, plus the extra End marking the block boundary
        assert_eq!(total_ends, 3);
    }
}
