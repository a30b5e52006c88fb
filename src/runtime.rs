// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Wires the UTXO engine, the API dispatcher, and the subscription services
//! into the daemon's running state: every connection is served by a plain
//! `std::net` thread rather than by an async reactor (see DESIGN.md).

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use cashhub_rpc::{message, packet_len, service, Field, Message, TagReader, TagWriter, MAX_PACKET_LEN};

use crate::blockindex::BlockMeta;
use crate::codec::{Cursor, Tag};
use crate::dispatcher::{CommandFailed, Dispatcher, Parser, ParserKind, Request, RequestId};
use crate::error::{DaemonError, LaunchError};
use crate::net::{ConnectionId, NetProtect, ProtectVerdict, INBOUND_HANDSHAKE_TIMEOUT, INBOUND_PING_TIMEOUT};
use crate::parser::{
    calculate_block_reply_size, calculate_needed_size, compute_txid, serialize_block, serialize_transaction,
    transaction_matches_filter, ScriptHashFilter, TransactionSerializationOptions,
};
use crate::subscriptions::{AddressMonitor, BlockNotification, DoubleSpend, DoubleSpendPayload, Event, EventSink, Txid, TransactionMonitor};
use crate::utxo::Engine;
use crate::wire::WireCodec;
use crate::CoreContext;

/// Application-level body tags for the endpoints `runtime` registers.
/// Distinct from the wire header tags in `cashhub_rpc::header_tag`: these
/// live inside a message's body, not its header.
mod body_tag {
    pub const BY_HASH: u32 = 1;
    pub const BY_HEIGHT: u32 = 2;
    pub const INCLUDE_RAW: u32 = 3;
    pub const RETURN_INPUTS: u32 = 4;
    pub const RETURN_OUTPUTS: u32 = 5;
    pub const RETURN_OUTPUT_AMOUNTS: u32 = 6;
    pub const RETURN_OUTPUT_SCRIPTS: u32 = 7;
    pub const RETURN_OUTPUT_ADDRESSES: u32 = 8;
    pub const RETURN_OUTPUT_SCRIPT_HASHES: u32 = 9;
    pub const FILTER_OUTPUT_INDEX: u32 = 10;
    pub const FILTER_SCRIPT_HASH: u32 = 11;
    pub const TXID: u32 = 12;
    pub const ADDRESS: u32 = 13;

    pub const OUT_TXID: u32 = 20;
    pub const OUT_AMOUNT: u32 = 21;
    pub const OUT_BLOCK_HEIGHT: u32 = 22;
    pub const OUT_OFFSET_IN_BLOCK: u32 = 23;
    pub const OUT_CONFIRMATION_COUNT: u32 = 24;
    pub const OUT_ADDRESS: u32 = 25;
    pub const OUT_HASH: u32 = 26;
    pub const OUT_HEIGHT: u32 = 27;
    pub const OUT_DUPLICATE_TX: u32 = 28;
    pub const OUT_PROOF: u32 = 29;
}

/// Delivers subscription events straight to the peer's live socket, keyed
/// by the same connection id `Dispatcher::dispatch` uses for session slots
///.
#[derive(Default)]
struct LiveSink {
    connections: Mutex<std::collections::HashMap<u64, TcpStream>>,
}

impl LiveSink {
    fn register(&self, connection: u64, stream: TcpStream) { self.connections.lock().unwrap().insert(connection, stream); }

    fn forget(&self, connection: u64) { self.connections.lock().unwrap().remove(&connection); }
}

impl EventSink for LiveSink {
    fn emit(&self, connection: u64, event: Event) {
        let msg = encode_event(event);
        let mut conns = self.connections.lock().unwrap();
        if let Some(stream) = conns.get_mut(&connection) {
            if write_message(stream, &msg).is_err() {
                conns.remove(&connection);
            }
        }
    }
}

fn encode_event(event: Event) -> Message {
    let mut w = TagWriter::new();
    let (service_id, message_id) = match &event {
        Event::TransactionFound { address, txid, amount, block_height, offset_in_block, confirmation_count } => {
            w.u256(body_tag::OUT_TXID, *txid);
            if let Some(addr) = address {
                w.bytes(body_tag::OUT_ADDRESS, addr);
            }
            if let Some(amount) = amount {
                w.positive(body_tag::OUT_AMOUNT, *amount);
            }
            if let Some(height) = block_height {
                w.positive(body_tag::OUT_BLOCK_HEIGHT, *height as u64);
            }
            if let Some(offset) = offset_in_block {
                w.positive(body_tag::OUT_OFFSET_IN_BLOCK, *offset as u64);
            }
            if let Some(count) = confirmation_count {
                w.positive(body_tag::OUT_CONFIRMATION_COUNT, *count as u64);
            }
            if address.is_some() {
                (service::ADDRESS_MONITOR, message::address_monitor::TRANSACTION_FOUND)
            } else {
                (service::TRANSACTION_MONITOR, message::transaction_monitor::TRANSACTION_FOUND)
            }
        }
        Event::NewBlockOnChain { hash, height } => {
            w.u256(body_tag::OUT_HASH, *hash);
            w.positive(body_tag::OUT_HEIGHT, *height as u64);
            (service::BLOCK_NOTIFICATION, message::block_notification::NEW_BLOCK_ON_CHAIN)
        }
        Event::BlocksRemoved(blocks) => {
            for (hash, height) in blocks {
                w.u256(body_tag::OUT_HASH, *hash);
                w.positive(body_tag::OUT_HEIGHT, *height as u64);
            }
            (service::BLOCK_NOTIFICATION, message::block_notification::BLOCKS_REMOVED)
        }
        Event::NewDoubleSpend { txid, payload } => {
            w.u256(body_tag::OUT_TXID, *txid);
            match payload {
                DoubleSpendPayload::DuplicateTx(bytes) => w.bytes(body_tag::OUT_DUPLICATE_TX, bytes),
                DoubleSpendPayload::Proof(bytes) => w.bytes(body_tag::OUT_PROOF, bytes),
            };
            (service::DOUBLE_SPEND_NOTIFICATION, message::double_spend::NEW_DOUBLE_SPEND)
        }
    };
    w.separator();
    Message::new(service_id, message_id, w.into_bytes())
}

fn encode_command_failed(failed: &CommandFailed) -> Message {
    let mut w = TagWriter::new();
    w.string(message::command_failed_tag::REASON, &failed.reason);
    w.positive(message::command_failed_tag::ORIGINAL_SERVICE_ID, failed.original_service_id as u64);
    w.positive(message::command_failed_tag::ORIGINAL_MESSAGE_ID, failed.original_message_id as u64);
    w.separator();
    Message::new(service::API, message::api::COMMAND_FAILED, w.into_bytes()).with_request_id(failed.request_id.0)
}

/// Requests and their replies carry different message ids on the wire
///; everything else (subscribe/unsubscribe acks) just echoes
/// the request's own id back.
fn reply_message_id(service_id: i32, message_id: i32) -> i32 {
    if service_id == service::BLOCKCHAIN {
        if message_id == message::blockchain::GET_BLOCK {
            return message::blockchain::GET_BLOCK_REPLY;
        }
        if message_id == message::blockchain::GET_TRANSACTION {
            return message::blockchain::GET_TRANSACTION_REPLY;
        }
        if message_id == message::blockchain::SEARCH_MEMPOOL {
            return message::blockchain::SEARCH_MEMPOOL_REPLY;
        }
    }
    message_id
}

fn apply_option_field(options: &mut TransactionSerializationOptions, field: &Field) -> bool {
    match *field {
        Field::Bool(body_tag::RETURN_INPUTS, v) => options.return_inputs = v,
        Field::Bool(body_tag::RETURN_OUTPUTS, v) => options.return_outputs = v,
        Field::Bool(body_tag::RETURN_OUTPUT_AMOUNTS, v) => options.return_output_amounts = v,
        Field::Bool(body_tag::RETURN_OUTPUT_SCRIPTS, v) => options.return_output_scripts = v,
        Field::Bool(body_tag::RETURN_OUTPUT_ADDRESSES, v) => options.return_output_addresses = v,
        Field::Bool(body_tag::RETURN_OUTPUT_SCRIPT_HASHES, v) => options.return_output_script_hashes = v,
        Field::Positive(body_tag::FILTER_OUTPUT_INDEX, v) => {
            options.filter_outputs.insert(v as u32);
        }
        _ => return false,
    }
    true
}

fn max_addresses(ctx: &CoreContext) -> usize { ctx.config.api_max_addresses.map(|n| n as usize).unwrap_or(usize::MAX) }

/// `GetBlock`: resolves a block by hash or height, loads it via
/// `BlockIndex`, and serializes the transactions that pass the script-hash
/// filter.
struct GetBlockParser {
    ctx: CoreContext,
}

impl GetBlockParser {
    fn resolve(&self, body: &[u8]) -> Result<(Vec<u8>, ScriptHashFilter, TransactionSerializationOptions, bool), String> {
        let mut reader = TagReader::new(body);
        let mut by_hash = None;
        let mut by_height = None;
        let mut include_raw = false;
        let mut options = TransactionSerializationOptions::default();
        let mut filter = ScriptHashFilter::new(max_addresses(&self.ctx));
        loop {
            let field = reader.next().map_err(|e| e.to_string())?;
            match field {
                Field::Separator => break,
                Field::U256(body_tag::BY_HASH, v) => by_hash = Some(v),
                Field::Positive(body_tag::BY_HEIGHT, v) => by_height = Some(v as u32),
                Field::Bool(body_tag::INCLUDE_RAW, v) => include_raw = v,
                Field::U256(body_tag::FILTER_SCRIPT_HASH, v) => filter.register(v).map_err(|_| "too many filter addresses".to_string())?,
                field if apply_option_field(&mut options, &field) => {}
                _ => {}
            }
        }
        let meta = match (by_hash, by_height) {
            (Some(hash), _) => self.ctx.block_index.get_by_hash(&hash),
            (None, Some(height)) => self.ctx.block_index.get_by_height(height),
            (None, None) => None,
        }
        .ok_or_else(|| "block not found".to_string())?;
        let raw_block = self.ctx.block_index.load_block(meta.disk_pos).ok_or_else(|| "block data missing".to_string())?;
        Ok((raw_block, filter, options, include_raw))
    }
}

impl Parser for GetBlockParser {
    fn kind(&self) -> ParserKind { ParserKind::Direct }

    fn calculate_message_size(&self, _connection: u64, request: &Request) -> usize {
        match self.resolve(&request.body) {
            Ok((raw_block, filter, options, include_raw)) => {
                calculate_block_reply_size(&raw_block, &filter, &options, include_raw).unwrap_or(raw_block.len())
            }
            Err(_) => 64,
        }
    }

    fn build_reply(&self, _connection: u64, request: &Request, out: &mut Vec<u8>) -> Result<(), String> {
        let (raw_block, filter, options, include_raw) = self.resolve(&request.body)?;
        let mut writer = TagWriter::new();
        serialize_block(&raw_block, &filter, &options, include_raw, &mut writer).map_err(|e| e.to_string())?;
        writer.separator();
        out.extend_from_slice(writer.as_bytes());
        Ok(())
    }
}

/// `GetTransaction`: looks a txid up in the mempool (the only
/// txid-indexed source the core's traits expose) and serializes it.
struct GetTransactionParser {
    ctx: CoreContext,
}

impl GetTransactionParser {
    fn find(&self, body: &[u8]) -> Result<(Vec<u8>, TransactionSerializationOptions), String> {
        let mut reader = TagReader::new(body);
        let mut txid = None;
        let mut options = TransactionSerializationOptions::default();
        loop {
            let field = reader.next().map_err(|e| e.to_string())?;
            match field {
                Field::Separator => break,
                Field::U256(body_tag::TXID, v) => txid = Some(v),
                field if apply_option_field(&mut options, &field) => {}
                _ => {}
            }
        }
        let txid = txid.ok_or_else(|| "missing txid".to_string())?;
        let mut matches = self.ctx.validator.search_mempool(&|tx_bytes| compute_txid(tx_bytes) == txid);
        let tx_bytes = matches.pop().ok_or_else(|| "transaction not found".to_string())?;
        Ok((tx_bytes, options))
    }
}

impl Parser for GetTransactionParser {
    fn kind(&self) -> ParserKind { ParserKind::Direct }

    fn calculate_message_size(&self, _connection: u64, request: &Request) -> usize {
        match self.find(&request.body) {
            Ok((tx, options)) => calculate_needed_size(&tx, &options).unwrap_or(tx.len()) + 48,
            Err(_) => 64,
        }
    }

    fn build_reply(&self, _connection: u64, request: &Request, out: &mut Vec<u8>) -> Result<(), String> {
        let (tx, options) = self.find(&request.body)?;
        let mut writer = TagWriter::new();
        writer.u256(body_tag::OUT_TXID, compute_txid(&tx));
        serialize_transaction(&tx, &options, &mut writer).map_err(|e| e.to_string())?;
        writer.separator();
        out.extend_from_slice(writer.as_bytes());
        Ok(())
    }
}

/// `SearchMempool`: unbounded in principle, so it runs as
/// `Async` rather than pre-sizing a reply buffer.
struct SearchMempoolParser {
    ctx: CoreContext,
}

impl Parser for SearchMempoolParser {
    fn kind(&self) -> ParserKind { ParserKind::Async }

    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }

    fn build_reply(&self, _connection: u64, request: &Request, out: &mut Vec<u8>) -> Result<(), String> {
        let mut reader = TagReader::new(&request.body);
        let mut filter = ScriptHashFilter::new(max_addresses(&self.ctx));
        let mut options = TransactionSerializationOptions::default();
        loop {
            let field = reader.next().map_err(|e| e.to_string())?;
            match field {
                Field::Separator => break,
                Field::U256(body_tag::FILTER_SCRIPT_HASH, v) => filter.register(v).map_err(|_| "too many filter addresses".to_string())?,
                field if apply_option_field(&mut options, &field) => {}
                _ => {}
            }
        }
        let matches = self.ctx.validator.search_mempool(&|tx_bytes| transaction_matches_filter(tx_bytes, &filter).unwrap_or(false));
        let mut writer = TagWriter::new();
        for tx in &matches {
            writer.u256(body_tag::OUT_TXID, compute_txid(tx));
            serialize_transaction(tx, &options, &mut writer).map_err(|e| e.to_string())?;
        }
        writer.separator();
        out.extend_from_slice(writer.as_bytes());
        Ok(())
    }
}

struct AddressMonitorSubscribe {
    monitor: Arc<AddressMonitor>,
}

impl Parser for AddressMonitorSubscribe {
    fn kind(&self) -> ParserKind { ParserKind::Direct }
    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
    fn build_reply(&self, connection: u64, request: &Request, _out: &mut Vec<u8>) -> Result<(), String> {
        let mut reader = TagReader::new(&request.body);
        loop {
            match reader.next().map_err(|e| e.to_string())? {
                Field::Separator => break,
                Field::Bytes(body_tag::ADDRESS, bytes) => {
                    let address: [u8; 20] = bytes.try_into().map_err(|_| "address must be 20 bytes".to_string())?;
                    self.monitor.subscribe(connection, address);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

struct AddressMonitorUnsubscribe {
    monitor: Arc<AddressMonitor>,
}

impl Parser for AddressMonitorUnsubscribe {
    fn kind(&self) -> ParserKind { ParserKind::Direct }
    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
    fn build_reply(&self, connection: u64, _request: &Request, _out: &mut Vec<u8>) -> Result<(), String> {
        self.monitor.unsubscribe_all(connection);
        Ok(())
    }
}

struct TransactionMonitorSubscribe {
    monitor: Arc<TransactionMonitor>,
    ctx: CoreContext,
    sink: Arc<LiveSink>,
}

impl Parser for TransactionMonitorSubscribe {
    fn kind(&self) -> ParserKind { ParserKind::Direct }
    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
    fn build_reply(&self, connection: u64, request: &Request, _out: &mut Vec<u8>) -> Result<(), String> {
        let mut reader = TagReader::new(&request.body);
        loop {
            match reader.next().map_err(|e| e.to_string())? {
                Field::Separator => break,
                Field::U256(body_tag::TXID, txid) => {
                    self.monitor.subscribe(connection, txid);
                    let in_mempool = self.ctx.validator.mempool_contains(&txid);
                    self.monitor.check_against_mempool(connection, txid, in_mempool, self.sink.as_ref());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

struct TransactionMonitorUnsubscribe {
    monitor: Arc<TransactionMonitor>,
}

impl Parser for TransactionMonitorUnsubscribe {
    fn kind(&self) -> ParserKind { ParserKind::Direct }
    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
    fn build_reply(&self, connection: u64, _request: &Request, _out: &mut Vec<u8>) -> Result<(), String> {
        self.monitor.unsubscribe_all(connection);
        Ok(())
    }
}

struct BlockNotificationSubscribe {
    service: Arc<BlockNotification>,
}

impl Parser for BlockNotificationSubscribe {
    fn kind(&self) -> ParserKind { ParserKind::Direct }
    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
    fn build_reply(&self, connection: u64, _request: &Request, _out: &mut Vec<u8>) -> Result<(), String> {
        self.service.subscribe(connection);
        Ok(())
    }
}

struct BlockNotificationUnsubscribe {
    service: Arc<BlockNotification>,
}

impl Parser for BlockNotificationUnsubscribe {
    fn kind(&self) -> ParserKind { ParserKind::Direct }
    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
    fn build_reply(&self, connection: u64, _request: &Request, _out: &mut Vec<u8>) -> Result<(), String> {
        self.service.unsubscribe(connection);
        Ok(())
    }
}

struct DoubleSpendSubscribe {
    service: Arc<DoubleSpend>,
}

impl Parser for DoubleSpendSubscribe {
    fn kind(&self) -> ParserKind { ParserKind::Direct }
    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
    fn build_reply(&self, connection: u64, _request: &Request, _out: &mut Vec<u8>) -> Result<(), String> {
        self.service.subscribe(connection);
        Ok(())
    }
}

struct DoubleSpendUnsubscribe {
    service: Arc<DoubleSpend>,
}

impl Parser for DoubleSpendUnsubscribe {
    fn kind(&self) -> ParserKind { ParserKind::Direct }
    fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
    fn build_reply(&self, connection: u64, _request: &Request, _out: &mut Vec<u8>) -> Result<(), String> {
        self.service.unsubscribe(connection);
        Ok(())
    }
}

/// Per-connection handlers shared (by `Arc`) across every connection thread.
#[derive(Clone)]
struct ConnContext {
    dispatcher: Arc<Dispatcher>,
    address_monitor: Arc<AddressMonitor>,
    transaction_monitor: Arc<TransactionMonitor>,
    block_notification: Arc<BlockNotification>,
    double_spend: Arc<DoubleSpend>,
    shutdown: Arc<AtomicBool>,
}

/// The running daemon: the UTXO engine, the subscription services, and one
/// accept thread per configured API listener.
pub struct Runtime {
    ctx: CoreContext,
    engine: Arc<Engine>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<LiveSink>,
    conn: ConnContext,
    listeners: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn start(ctx: CoreContext) -> Result<Self, LaunchError> {
        log::info!("opening UTXO engine at {}", ctx.config.data_dir.display());
        let engine = Arc::new(Engine::open(ctx.config.data_dir.join("utxo"))?);

        let address_monitor = Arc::new(AddressMonitor::new());
        let transaction_monitor = Arc::new(TransactionMonitor::new());
        let block_notification = Arc::new(BlockNotification::new());
        let double_spend = Arc::new(DoubleSpend::new());
        let sink = Arc::new(LiveSink::default());

        let mut dispatcher = Dispatcher::new(format!("cashhub:{}", env!("CARGO_PKG_VERSION")));
        dispatcher.register(
            service::BLOCKCHAIN as u16,
            message::blockchain::GET_BLOCK as u16,
            Box::new(GetBlockParser { ctx: ctx.clone() }),
        );
        dispatcher.register(
            service::BLOCKCHAIN as u16,
            message::blockchain::GET_TRANSACTION as u16,
            Box::new(GetTransactionParser { ctx: ctx.clone() }),
        );
        dispatcher.register(
            service::BLOCKCHAIN as u16,
            message::blockchain::SEARCH_MEMPOOL as u16,
            Box::new(SearchMempoolParser { ctx: ctx.clone() }),
        );
        dispatcher.register(
            service::ADDRESS_MONITOR as u16,
            message::address_monitor::SUBSCRIBE as u16,
            Box::new(AddressMonitorSubscribe { monitor: Arc::clone(&address_monitor) }),
        );
        dispatcher.register(
            service::ADDRESS_MONITOR as u16,
            message::address_monitor::UNSUBSCRIBE as u16,
            Box::new(AddressMonitorUnsubscribe { monitor: Arc::clone(&address_monitor) }),
        );
        dispatcher.register(
            service::TRANSACTION_MONITOR as u16,
            message::transaction_monitor::SUBSCRIBE as u16,
            Box::new(TransactionMonitorSubscribe {
                monitor: Arc::clone(&transaction_monitor),
                ctx: ctx.clone(),
                sink: Arc::clone(&sink),
            }),
        );
        dispatcher.register(
            service::TRANSACTION_MONITOR as u16,
            message::transaction_monitor::UNSUBSCRIBE as u16,
            Box::new(TransactionMonitorUnsubscribe { monitor: Arc::clone(&transaction_monitor) }),
        );
        dispatcher.register(
            service::BLOCK_NOTIFICATION as u16,
            message::block_notification::SUBSCRIBE as u16,
            Box::new(BlockNotificationSubscribe { service: Arc::clone(&block_notification) }),
        );
        dispatcher.register(
            service::BLOCK_NOTIFICATION as u16,
            message::block_notification::UNSUBSCRIBE as u16,
            Box::new(BlockNotificationUnsubscribe { service: Arc::clone(&block_notification) }),
        );
        dispatcher.register(
            service::DOUBLE_SPEND_NOTIFICATION as u16,
            message::double_spend::SUBSCRIBE as u16,
            Box::new(DoubleSpendSubscribe { service: Arc::clone(&double_spend) }),
        );
        dispatcher.register(
            service::DOUBLE_SPEND_NOTIFICATION as u16,
            message::double_spend::UNSUBSCRIBE as u16,
            Box::new(DoubleSpendUnsubscribe { service: Arc::clone(&double_spend) }),
        );
        let dispatcher = Arc::new(dispatcher);

        let conn = ConnContext {
            dispatcher: Arc::clone(&dispatcher),
            address_monitor,
            transaction_monitor,
            block_notification,
            double_spend,
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        let mut listeners = Vec::new();
        if ctx.config.api_enabled {
            let protect = Arc::new(NetProtect::new());
            let next_connection_id = Arc::new(AtomicU64::new(1));
            for addr in ctx.config.api_listen.clone() {
                let listener = TcpListener::bind(addr).map_err(|e| LaunchError::Bind(addr, e.to_string()))?;
                log::info!("listening for API connections on {addr}");
                let protect = Arc::clone(&protect);
                let sink = Arc::clone(&sink);
                let conn = conn.clone();
                let next_connection_id = Arc::clone(&next_connection_id);
                listeners.push(thread::spawn(move || accept_loop(addr, listener, protect, sink, conn, next_connection_id)));
            }
        } else {
            log::info!("API server disabled by configuration");
        }

        log::info!("launch completed successfully");
        Ok(Self { ctx, engine, dispatcher, sink, conn, listeners })
    }

    pub fn engine(&self) -> &Arc<Engine> { &self.engine }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> { &self.dispatcher }

    /// Applies a newly connected block to the UTXO engine and, once it
    /// becomes the new tip, fans it out to the subscription services.
    pub fn on_block_connected(&self, meta: BlockMeta, raw_block: Vec<u8>) -> Result<(), DaemonError> {
        let height = meta.height;
        let hash = meta.hash;
        let became_tip = self.ctx.block_index.append_header(meta, raw_block.clone());
        if !became_tip {
            return Ok(());
        }

        let transactions = walk_block_transactions(&raw_block).map_err(|_| DaemonError::BlockNotFound)?;
        for (txid, offset, tx_bytes) in &transactions {
            apply_transaction_to_utxo(&self.engine, *txid, height, *offset, tx_bytes);
        }
        self.engine.commit_block(height, hash)?;

        self.conn.address_monitor.on_block_connected(height, &transactions, self.sink.as_ref());
        let txid_pairs: Vec<(Txid, u32)> = transactions.iter().map(|(txid, offset, _)| (*txid, *offset)).collect();
        self.conn.transaction_monitor.on_block_connected(height, &txid_pairs, self.sink.as_ref());
        self.conn.block_notification.on_block_connected(hash, height, self.sink.as_ref());
        Ok(())
    }

    /// Signals every connection thread to wind down and waits for the
    /// listener threads to exit.
    pub fn shutdown(self) -> Result<(), DaemonError> {
        let Runtime { ctx, dispatcher, listeners, conn, .. } = self;
        conn.shutdown.store(true, Ordering::Release);
        dispatcher.shutdown();
        // Nudge each accept() loop past its blocking call.
        for addr in &ctx.config.api_listen {
            let _ = TcpStream::connect(addr);
        }
        for handle in listeners {
            handle.join().map_err(|_| DaemonError::Thread("API listener"))?;
        }
        Ok(())
    }
}

/// Walks every transaction in a connected block, extracting `(txid,
/// offset_in_block, raw_bytes)` for subscription matching and UTXO-set
/// updates in one pass.
fn walk_block_transactions(block_bytes: &[u8]) -> Result<Vec<(Txid, u32, Vec<u8>)>, crate::codec::CodecError> {
    let mut cur = Cursor::for_block(block_bytes)?;
    let mut out = Vec::new();
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
        let tx_bytes = block_bytes[offset..offset + len].to_vec();
        let txid = compute_txid(&tx_bytes);
        out.push((txid, offset as u32, tx_bytes));
        if cur.at_block_end() {
            break;
        }
    }
    Ok(out)
}

/// Removes the UTXOs a transaction's inputs spend and inserts its new
/// outputs.
/// Malformed transaction bytes are skipped rather than failing the whole
/// block, matching `resolve_outputs`'s `Err(_) => break` leniency in
/// `subscriptions`.
fn apply_transaction_to_utxo(engine: &Engine, txid: Txid, height: u32, offset: u32, tx_bytes: &[u8]) {
    let mut cur = Cursor::new(tx_bytes, 0);
    let mut out_idx = 0u32;
    let mut pending_prev_txid: Option<[u8; 32]> = None;
    loop {
        match cur.next() {
            Ok(Tag::PrevTxHash) => pending_prev_txid = cur.u256_data().ok().copied(),
            Ok(Tag::PrevTxIndex) => {
                if let (Some(prev_txid), Ok(prev_index)) = (pending_prev_txid.take(), cur.int_data()) {
                    if prev_txid != [0u8; 32] {
                        engine.remove(&prev_txid, prev_index, None);
                    }
                }
            }
            Ok(Tag::OutputScript) => {
                engine.insert(txid, out_idx, height, offset);
                out_idx += 1;
            }
            Ok(Tag::End) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

fn accept_loop(
    addr: SocketAddr,
    listener: TcpListener,
    protect: Arc<NetProtect>,
    sink: Arc<LiveSink>,
    conn: ConnContext,
    next_connection_id: Arc<AtomicU64>,
) {
    for stream in listener.incoming() {
        if conn.shutdown.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(err) => {
                log::warn!("accept() failed on {addr}: {err}");
                continue;
            }
        };
        let Ok(peer) = stream.peer_addr() else { continue };
        if protect.record_connection(peer.ip(), Instant::now()) == ProtectVerdict::Banned {
            log::debug!("rejecting banned peer {peer}");
            continue;
        }
        let id = ConnectionId(next_connection_id.fetch_add(1, Ordering::Relaxed));
        let sink = Arc::clone(&sink);
        let conn = conn.clone();
        thread::spawn(move || serve_connection(id, peer, stream, sink, conn));
    }
    log::debug!("listener on {addr} stopped");
}

enum ReadOutcome {
    Packet(Vec<u8>),
    Closed,
    Idle,
}

/// Reads one length-prefixed native frame. A timeout with no
/// bytes read yet is treated as an idle connection; a timeout
/// mid-frame is a protocol error, since a well-behaved peer never pauses
/// inside a single packet.
fn read_packet(stream: &mut TcpStream) -> io::Result<ReadOutcome> {
    let mut header = [0u8; 2];
    let mut filled = 0usize;
    loop {
        match stream.read(&mut header[filled..]) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => {
                filled += n;
                if filled == header.len() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if filled == 0 {
                    return Ok(ReadOutcome::Idle);
                }
            }
            Err(e) => return Err(e),
        }
    }
    let total_len = packet_len(header);
    if total_len < header.len() || total_len > MAX_PACKET_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame length out of range"));
    }
    let mut body = vec![0u8; total_len - header.len()];
    stream.read_exact(&mut body)?;
    let mut packet = Vec::with_capacity(total_len);
    packet.extend_from_slice(&header);
    packet.extend_from_slice(&body);
    Ok(ReadOutcome::Packet(packet))
}

fn write_message(stream: &mut TcpStream, msg: &Message) -> io::Result<()> {
    for packet in msg.encode() {
        stream.write_all(&packet)?;
    }
    Ok(())
}

fn handle_message(connection: u64, msg: Message, dispatcher: &Dispatcher, stream: &mut TcpStream) -> io::Result<()> {
    let Message { service_id, message_id, request_id, body } = msg;
    let request = Request { request_id: RequestId(request_id.unwrap_or(0)), service_id: service_id as u16, message_id: message_id as u16, body };
    let reply = match dispatcher.dispatch(connection, request) {
        Ok(body) => {
            let mut reply = Message::new(service_id, reply_message_id(service_id, message_id), body);
            if let Some(rid) = request_id {
                reply = reply.with_request_id(rid);
            }
            reply
        }
        Err(failed) => encode_command_failed(&failed),
    };
    write_message(stream, &reply)
}

/// One accepted connection's read/dispatch/reply loop. Runs on its own OS thread; the socket clone registered with
/// `LiveSink` is how subscription pushes reach this same peer from the
/// block-connected path on a different thread.
fn serve_connection(id: ConnectionId, peer: SocketAddr, mut stream: TcpStream, sink: Arc<LiveSink>, conn: ConnContext) {
    log::debug!("connection {} from {peer} accepted", id.0);
    // Until the first full packet arrives a silent new connection is held to
    // the short handshake timeout; afterwards it gets the longer ping timeout.
    stream.set_read_timeout(Some(INBOUND_HANDSHAKE_TIMEOUT)).ok();
    let mut past_handshake = false;
    if let Ok(clone) = stream.try_clone() {
        sink.register(id.0, clone);
    }

    let mut codec = WireCodec::new();
    loop {
        if conn.shutdown.load(Ordering::Acquire) {
            break;
        }
        match read_packet(&mut stream) {
            Ok(ReadOutcome::Closed) => break,
            Ok(ReadOutcome::Idle) => {
                log::debug!("connection {} idle past {}, closing", id.0, if past_handshake { "ping timeout" } else { "handshake timeout" });
                break;
            }
            Ok(ReadOutcome::Packet(packet)) => {
                if !past_handshake {
                    past_handshake = true;
                    stream.set_read_timeout(Some(INBOUND_PING_TIMEOUT)).ok();
                }
                match codec.feed(&packet) {
                    Ok(Some(msg)) => {
                        if let Err(err) = handle_message(id.0, msg, &conn.dispatcher, &mut stream) {
                            log::debug!("connection {} write error: {err}", id.0);
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        log::debug!("connection {} framing error: {err}", id.0);
                        break;
                    }
                }
            }
            Err(err) => {
                log::debug!("connection {} read error: {err}", id.0);
                break;
            }
        }
    }

    sink.forget(id.0);
    conn.address_monitor.unsubscribe_all(id.0);
    conn.transaction_monitor.unsubscribe_all(id.0);
    conn.block_notification.unsubscribe(id.0);
    conn.double_spend.unsubscribe(id.0);
    log::debug!("connection {} from {peer} closed", id.0);
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream as ClientStream;
    use std::time::Duration;

    use cashhub_rpc::Message as WireMessage;

    use super::*;
    use crate::blockindex::MemoryBlockIndex;
    use crate::validator::MemoryValidator;
    use crate::Config;

    fn test_ctx(port: u16) -> CoreContext {
        let config = Config {
            api_enabled: true,
            api_listen: vec![format!("127.0.0.1:{port}").parse().unwrap()],
            api_max_addresses: None,
            data_dir: tempfile::tempdir().unwrap().keep(),
            block_data_dir: Vec::new(),
        };
        CoreContext::new(config, MemoryBlockIndex::new(), Arc::new(MemoryValidator::default()))
    }

    fn sample_tx() -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&1i32.to_le_bytes());
        tx.push(0); // no inputs
        tx.push(1); // one output
        tx.extend_from_slice(&1_000u64.to_le_bytes());
        tx.push(3);
        tx.extend_from_slice(b"abc");
        tx.extend_from_slice(&0u32.to_le_bytes());
        tx
    }

    fn roundtrip(stream: &mut ClientStream, msg: WireMessage) -> WireMessage {
        for packet in msg.encode() {
            stream.write_all(&packet).unwrap();
        }
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).unwrap();
        let total_len = u16::from_le_bytes(header) as usize;
        let mut rest = vec![0u8; total_len - 2];
        stream.read_exact(&mut rest).unwrap();
        let mut packet = header.to_vec();
        packet.extend_from_slice(&rest);
        WireMessage::decode(&packet).unwrap()
    }

    #[test]
    fn version_request_round_trips_over_a_real_socket() {
        let ctx = test_ctx(18337);
        let runtime = Runtime::start(ctx).unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut stream = ClientStream::connect("127.0.0.1:18337").unwrap();
        let reply = roundtrip(&mut stream, WireMessage::new(service::API, message::api::VERSION, Vec::new()));
        assert!(String::from_utf8(reply.body).unwrap().starts_with("cashhub:"));

        drop(stream);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn get_block_returns_matching_transaction_over_the_wire() {
        let ctx = test_ctx(18338);
        let tx = sample_tx();
        let mut block = Vec::new();
        block.extend_from_slice(&[0u8; 80]);
        block.push(1);
        block.extend_from_slice(&tx);
        let hash = [9u8; 32];
        ctx.block_index.append_header(BlockMeta { hash, height: 1, disk_pos: 1 }, block);

        let runtime = Runtime::start(ctx).unwrap();
        thread::sleep(Duration::from_millis(50));
        let mut stream = ClientStream::connect("127.0.0.1:18338").unwrap();

        let mut body = TagWriter::new();
        body.u256(body_tag::BY_HASH, hash);
        body.boolean(body_tag::RETURN_OUTPUTS, true);
        body.separator();
        let reply = roundtrip(&mut stream, WireMessage::new(service::BLOCKCHAIN, message::blockchain::GET_BLOCK, body.into_bytes()));
        assert_eq!(reply.message_id, message::blockchain::GET_BLOCK_REPLY);
        assert!(!reply.body.is_empty());

        drop(stream);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn unknown_block_hash_reports_command_failed() {
        let ctx = test_ctx(18339);
        let runtime = Runtime::start(ctx).unwrap();
        thread::sleep(Duration::from_millis(50));
        let mut stream = ClientStream::connect("127.0.0.1:18339").unwrap();

        let mut body = TagWriter::new();
        body.u256(body_tag::BY_HASH, [0xffu8; 32]);
        body.separator();
        let reply = roundtrip(&mut stream, WireMessage::new(service::BLOCKCHAIN, message::blockchain::GET_BLOCK, body.into_bytes()));
        assert_eq!(reply.message_id, message::api::COMMAND_FAILED);

        drop(stream);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn address_subscription_fires_on_block_connected() {
        let ctx = test_ctx(18340);
        let runtime = Runtime::start(ctx.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        let mut stream = ClientStream::connect("127.0.0.1:18340").unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let address = [3u8; 20];
        let mut sub_body = TagWriter::new();
        sub_body.bytes(body_tag::ADDRESS, &address);
        sub_body.separator();
        let _ = roundtrip(&mut stream, WireMessage::new(service::ADDRESS_MONITOR, message::address_monitor::SUBSCRIBE, sub_body.into_bytes()));

        let mut tx = Vec::new();
        tx.extend_from_slice(&1i32.to_le_bytes());
        tx.push(0);
        tx.push(1);
        tx.extend_from_slice(&5_000u64.to_le_bytes());
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

        let mut block = Vec::new();
        block.extend_from_slice(&[1u8; 80]);
        block.push(1);
        block.extend_from_slice(&tx);
        runtime.on_block_connected(BlockMeta { hash: [1u8; 32], height: 1, disk_pos: 1 }, block).unwrap();

        let mut header = [0u8; 2];
        stream.read_exact(&mut header).unwrap();
        let total_len = u16::from_le_bytes(header) as usize;
        let mut rest = vec![0u8; total_len - 2];
        stream.read_exact(&mut rest).unwrap();
        let mut packet = header.to_vec();
        packet.extend_from_slice(&rest);
        let event = WireMessage::decode(&packet).unwrap();
        assert_eq!(event.service_id, service::ADDRESS_MONITOR);
        assert_eq!(event.message_id, message::address_monitor::TRANSACTION_FOUND);

        drop(stream);
        runtime.shutdown().unwrap();
    }
}
