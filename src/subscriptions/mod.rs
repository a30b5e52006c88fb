// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! SubscriptionServices: four push-notification services that
//! listen to the validation-event bus and match against per-connection
//! filters. Matching loops are bounded to [`MAX_MATCHES_PER_SUBSCRIPTION`]
//! to cap the DoS surface of a single oversized block.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::codec::{Cursor, Tag};
use crate::parser::solve_address;
#[cfg(test)]
use crate::parser::compute_txid;

/// Caps how many matches a single subscription can emit for one block
///.
pub const MAX_MATCHES_PER_SUBSCRIPTION: usize = 2500;

pub type KeyId = [u8; 20];
pub type Txid = [u8; 32];

#[derive(Clone, Debug)]
pub enum DoubleSpendPayload {
    DuplicateTx(Vec<u8>),
    Proof(Vec<u8>),
}

#[derive(Clone, Debug)]
pub enum Event {
    TransactionFound {
        address: Option<KeyId>,
        txid: Txid,
        amount: Option<u64>,
        block_height: Option<u32>,
        offset_in_block: Option<u32>,
        confirmation_count: Option<u32>,
    },
    NewBlockOnChain {
        hash: Txid,
        height: u32,
    },
    /// Oldest first.
    BlocksRemoved(Vec<(Txid, u32)>),
    NewDoubleSpend {
        txid: Txid,
        payload: DoubleSpendPayload,
    },
}

/// Where a service delivers matched events; a connection's real transport
/// is a `WireCodec`-framed message, but that framing is the caller's
/// concern — services only produce [`Event`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, connection: u64, event: Event);
}

/// In-memory event collector, usable both in tests and as the concrete
/// sink wired in by `runtime` until a real per-connection send path
/// exists.
#[derive(Default)]
pub struct Mailbox {
    events: Mutex<HashMap<u64, Vec<Event>>>,
}

impl EventSink for Mailbox {
    fn emit(&self, connection: u64, event: Event) { self.events.lock().unwrap().entry(connection).or_default().push(event); }
}

impl Mailbox {
    pub fn new() -> Self { Self::default() }

    pub fn drain(&self, connection: u64) -> Vec<Event> { self.events.lock().unwrap().remove(&connection).unwrap_or_default() }
}

/// One output of a transaction resolved to a standard address, for
/// `AddressMonitor` matching.
struct ResolvedOutput {
    address: KeyId,
    amount: u64,
}

fn resolve_outputs(tx_bytes: &[u8]) -> Vec<ResolvedOutput> {
    let mut cur = Cursor::new(tx_bytes, 0);
    let mut outputs = Vec::new();
    let mut pending_value = None;
    loop {
        match cur.next() {
            Ok(Tag::OutputValue) => pending_value = cur.long_data().ok(),
            Ok(Tag::OutputScript) => {
                if let (Some(amount), Ok(script)) = (pending_value.take(), cur.byte_data()) {
                    if let Some(address) = solve_address(script) {
                        outputs.push(ResolvedOutput { address, amount });
                    }
                }
            }
            Ok(Tag::End) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    outputs
}

/// Per-connection p2pkh address filters, matched against every
/// transaction's outputs.
#[derive(Default)]
pub struct AddressMonitor {
    subs: Mutex<HashMap<u64, HashSet<KeyId>>>,
}

impl AddressMonitor {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&self, connection: u64, address: KeyId) { self.subs.lock().unwrap().entry(connection).or_default().insert(address); }

    pub fn unsubscribe_all(&self, connection: u64) { self.subs.lock().unwrap().remove(&connection); }

    /// Called once per confirmed block.
    pub fn on_block_connected(&self, block_height: u32, transactions: &[(Txid, u32, Vec<u8>)], sink: &dyn EventSink) {
        let subs = self.subs.lock().unwrap();
        for (&connection, addresses) in subs.iter() {
            let mut matched = 0;
            'txs: for (txid, offset_in_block, tx_bytes) in transactions {
                for output in resolve_outputs(tx_bytes) {
                    if !addresses.contains(&output.address) {
                        continue;
                    }
                    sink.emit(connection, Event::TransactionFound {
                        address: Some(output.address),
                        txid: *txid,
                        amount: Some(output.amount),
                        block_height: Some(block_height),
                        offset_in_block: Some(*offset_in_block),
                        confirmation_count: Some(1),
                    });
                    matched += 1;
                    if matched >= MAX_MATCHES_PER_SUBSCRIPTION {
                        break 'txs;
                    }
                }
            }
        }
    }

    /// Called when a transaction is accepted into the mempool.
    pub fn on_tx_entered_mempool(&self, txid: Txid, tx_bytes: &[u8], sink: &dyn EventSink) {
        let subs = self.subs.lock().unwrap();
        for (&connection, addresses) in subs.iter() {
            for output in resolve_outputs(tx_bytes) {
                if addresses.contains(&output.address) {
                    sink.emit(connection, Event::TransactionFound {
                        address: Some(output.address),
                        txid,
                        amount: Some(output.amount),
                        block_height: None,
                        offset_in_block: None,
                        confirmation_count: Some(0),
                    });
                }
            }
        }
    }
}

/// Per-connection txid watch list.
#[derive(Default)]
pub struct TransactionMonitor {
    subs: Mutex<HashMap<u64, HashSet<Txid>>>,
}

impl TransactionMonitor {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&self, connection: u64, txid: Txid) { self.subs.lock().unwrap().entry(connection).or_default().insert(txid); }

    pub fn unsubscribe_all(&self, connection: u64) { self.subs.lock().unwrap().remove(&connection); }

    /// Checks `txid` against the current mempool snapshot immediately on
    /// subscribe.
    pub fn check_against_mempool(&self, connection: u64, txid: Txid, in_mempool: bool, sink: &dyn EventSink) {
        if !in_mempool {
            return;
        }
        if self.subs.lock().unwrap().get(&connection).map(|s| s.contains(&txid)).unwrap_or(false) {
            sink.emit(connection, Event::TransactionFound {
                address: None,
                txid,
                amount: None,
                block_height: None,
                offset_in_block: None,
                confirmation_count: Some(0),
            });
        }
    }

    pub fn on_block_connected(&self, block_height: u32, transactions: &[(Txid, u32)], sink: &dyn EventSink) {
        let subs = self.subs.lock().unwrap();
        for (&connection, txids) in subs.iter() {
            let mut matched = 0;
            for (txid, offset_in_block) in transactions {
                if !txids.contains(txid) {
                    continue;
                }
                sink.emit(connection, Event::TransactionFound {
                    address: None,
                    txid: *txid,
                    amount: None,
                    block_height: Some(block_height),
                    offset_in_block: Some(*offset_in_block),
                    confirmation_count: Some(1),
                });
                matched += 1;
                if matched >= MAX_MATCHES_PER_SUBSCRIPTION {
                    break;
                }
            }
        }
    }

    /// A double-spend proof for a subscribed txid surfaces here too.
    pub fn on_double_spend_proof(&self, tx_in_pool: Txid, proof: Vec<u8>, sink: &dyn EventSink) {
        let subs = self.subs.lock().unwrap();
        for (&connection, txids) in subs.iter() {
            if txids.contains(&tx_in_pool) {
                sink.emit(connection, Event::NewDoubleSpend { txid: tx_in_pool, payload: DoubleSpendPayload::Proof(proof.clone()) });
            }
        }
    }
}

/// Per-connection boolean opt-in to chain-tip notifications.
#[derive(Default)]
pub struct BlockNotification {
    subs: Mutex<HashSet<u64>>,
}

impl BlockNotification {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&self, connection: u64) { self.subs.lock().unwrap().insert(connection); }

    pub fn unsubscribe(&self, connection: u64) { self.subs.lock().unwrap().remove(&connection); }

    pub fn on_block_connected(&self, hash: Txid, height: u32, sink: &dyn EventSink) {
        for &connection in self.subs.lock().unwrap().iter() {
            sink.emit(connection, Event::NewBlockOnChain { hash, height });
        }
    }

    /// `reverted_blocks` must already be oldest-first.
    pub fn on_chain_reorged(&self, reverted_blocks: &[(Txid, u32)], sink: &dyn EventSink) {
        for &connection in self.subs.lock().unwrap().iter() {
            sink.emit(connection, Event::BlocksRemoved(reverted_blocks.to_vec()));
        }
    }
}

/// Per-connection boolean opt-in to double-spend alerts.
#[derive(Default)]
pub struct DoubleSpend {
    subs: Mutex<HashSet<u64>>,
}

impl DoubleSpend {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&self, connection: u64) { self.subs.lock().unwrap().insert(connection); }

    pub fn unsubscribe(&self, connection: u64) { self.subs.lock().unwrap().remove(&connection); }

    pub fn on_double_spend_found(&self, txid: Txid, duplicate_tx: Vec<u8>, sink: &dyn EventSink) {
        for &connection in self.subs.lock().unwrap().iter() {
            sink.emit(connection, Event::NewDoubleSpend { txid, payload: DoubleSpendPayload::DuplicateTx(duplicate_tx.clone()) });
        }
    }

    pub fn on_double_spend_proof(&self, txid: Txid, proof: Vec<u8>, sink: &dyn EventSink) {
        for &connection in self.subs.lock().unwrap().iter() {
            sink.emit(connection, Event::NewDoubleSpend { txid, payload: DoubleSpendPayload::Proof(proof.clone()) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh_tx(address: KeyId, amount: u64) -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&1i32.to_le_bytes());
        tx.push(0); // no inputs
        tx.push(1); // one output
        tx.extend_from_slice(&amount.to_le_bytes());
        let mut script = [0u8; 25];
        script[0] = 0x76;
        script[1] = 0xa9;
        script[2] = 0x14;
        script[3..23].copy_from_slice(&address);
        script[23] = 0x88;
        script[24] = 0xac;
        tx.push(25);
        tx.extend_from_slice(&script);
        tx.extend_from_slice(&0u32.to_le_bytes());
        tx
    }

    #[test]
    fn address_monitor_matches_outputs_paying_a_watched_address() {
        let monitor = AddressMonitor::new();
        let mailbox = Mailbox::new();
        let address = [5u8; 20];
        monitor.subscribe(1, address);
        let tx = p2pkh_tx(address, 12_345);
        let txid = compute_txid(&tx);
        monitor.on_block_connected(100, &[(txid, 81, tx)], &mailbox);
        let events = mailbox.drain(1);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::TransactionFound { amount: Some(12_345), block_height: Some(100), .. }));
    }

    #[test]
    fn address_monitor_ignores_non_watched_outputs() {
        let monitor = AddressMonitor::new();
        let mailbox = Mailbox::new();
        monitor.subscribe(1, [5u8; 20]);
        let tx = p2pkh_tx([9u8; 20], 1);
        let txid = compute_txid(&tx);
        monitor.on_block_connected(1, &[(txid, 81, tx)], &mailbox);
        assert!(mailbox.drain(1).is_empty());
    }

    #[test]
    fn transaction_monitor_fires_on_mempool_entry_and_on_confirmation() {
        let monitor = TransactionMonitor::new();
        let mailbox = Mailbox::new();
        let txid = [3u8; 32];
        monitor.subscribe(1, txid);
        monitor.check_against_mempool(1, txid, true, &mailbox);
        monitor.on_block_connected(50, &[(txid, 81)], &mailbox);
        let events = mailbox.drain(1);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn block_notification_emits_tip_and_reorg_events() {
        let notif = BlockNotification::new();
        let mailbox = Mailbox::new();
        notif.subscribe(1);
        notif.on_block_connected([1u8; 32], 10, &mailbox);
        notif.on_chain_reorged(&[([2u8; 32], 8), ([3u8; 32], 9)], &mailbox);
        let events = mailbox.drain(1);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::NewBlockOnChain { height: 10, .. }));
        match &events[1] {
            Event::BlocksRemoved(blocks) => assert_eq!(blocks[0].1, 8),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn double_spend_service_only_notifies_subscribers() {
        let ds = DoubleSpend::new();
        let mailbox = Mailbox::new();
        ds.subscribe(1);
        ds.on_double_spend_found([4u8; 32], vec![1, 2, 3], &mailbox);
        assert_eq!(mailbox.drain(1).len(), 1);
        assert!(mailbox.drain(2).is_empty());
    }

    #[test]
    fn address_monitor_caps_matches_per_block() {
        let monitor = AddressMonitor::new();
        let mailbox = Mailbox::new();
        let address = [7u8; 20];
        monitor.subscribe(1, address);
        let txs: Vec<_> = (0..(MAX_MATCHES_PER_SUBSCRIPTION + 10))
            .map(|i| {
                let tx = p2pkh_tx(address, 1);
                (compute_txid(&tx), i as u32, tx)
            })
            .collect();
        monitor.on_block_connected(1, &txs, &mailbox);
        assert_eq!(mailbox.drain(1).len(), MAX_MATCHES_PER_SUBSCRIPTION);
    }
}
