// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Consensus validation is an external collaborator: the core submits transactions and asks about mempool contents
//! through this trait, but never interprets a script itself.

/// The outcome of submitting a transaction to the validator.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum AcceptOutcome {
    Accepted,
    /// Rejected, carrying the validator's reason verbatim.
    Rejected(String),
}

/// The subset of a full node's mempool/validation engine the core consumes:
/// submit a transaction and look up what is currently known about the
/// mempool. Script interpretation and consensus rules live behind this
/// trait, not in front of it.
pub trait Validator: Send + Sync {
    fn submit_transaction(&self, raw_tx: &[u8]) -> AcceptOutcome;
    fn mempool_contains(&self, txid: &[u8; 32]) -> bool;
    /// Searches the mempool for transactions whose raw bytes, walked via the
    /// same cursor as `TxCodec`, satisfy `matches`. Used by
    /// `ParserKit::SearchMempool`.
    fn search_mempool(&self, matches: &dyn Fn(&[u8]) -> bool) -> Vec<Vec<u8>>;
}

/// A placeholder `Validator` that accepts everything and keeps submitted
/// transactions around for `search_mempool`: no script interpreter, no
/// consensus rules, nothing chain-selection-aware. Used by unit tests and,
/// until a real validation engine is wired in, by `hubd` itself — the same
/// role `MemoryBlockIndex` plays for `BlockIndex`.
#[derive(Default)]
pub struct MemoryValidator {
    mempool: std::sync::RwLock<Vec<Vec<u8>>>,
}

impl Validator for MemoryValidator {
    fn submit_transaction(&self, raw_tx: &[u8]) -> AcceptOutcome {
        self.mempool.write().unwrap().push(raw_tx.to_vec());
        AcceptOutcome::Accepted
    }

    fn mempool_contains(&self, txid: &[u8; 32]) -> bool {
        use sha2::{Digest, Sha256};
        self.mempool.read().unwrap().iter().any(|tx| {
            let first = Sha256::digest(tx);
            let second = Sha256::digest(first);
            second.as_slice() == txid
        })
    }

    fn search_mempool(&self, matches: &dyn Fn(&[u8]) -> bool) -> Vec<Vec<u8>> {
        self.mempool.read().unwrap().iter().filter(|tx| matches(tx)).cloned().collect()
    }
}
