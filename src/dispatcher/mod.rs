// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! ApiDispatcher: routes an inbound request by
//! `(service_id, message_id)` to a registered [`Parser`], keeping a
//! per-connection session slot and never blocking the network thread on
//! validation or disk work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub type ServiceId = u16;
pub type MessageId = u16;

pub const API_SERVICE: ServiceId = 0;
pub const VERSION_MESSAGE: MessageId = 0;

/// Fixed-size async worker pool per connection.
const ASYNC_SLOTS: usize = 10;
const ASYNC_RETRY_BACKOFF: Duration = Duration::from_nanos(500);

/// Identifies a request so a failure reply can echo it back.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RequestId(pub u64);

pub struct Request {
    pub request_id: RequestId,
    pub service_id: ServiceId,
    pub message_id: MessageId,
    pub body: Vec<u8>,
}

/// `(service_id << 16) | message_id`, the per-connection session slot key
///.
pub fn session_key(service_id: ServiceId, message_id: MessageId) -> u32 {
    ((service_id as u32) << 16) | message_id as u32
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CommandFailed {
    pub request_id: RequestId,
    pub original_service_id: ServiceId,
    pub original_message_id: MessageId,
    pub reason: String,
}

/// How a [`Parser`] is dispatched.
pub enum ParserKind {
    /// Computed entirely on the network thread.
    Direct,
    /// Bridged into the legacy RPC table; reply comes back as a JSON-ish
    /// value the parser then re-serializes.
    RpcBridge,
    /// Runs on a worker thread; may block.
    Async,
}

/// One endpoint's request/reply logic. `connection`
/// identifies the calling peer so a parser can read/write its session slot
/// or a subscription service's per-connection state.
pub trait Parser: Send + Sync {
    fn kind(&self) -> ParserKind;

    /// Upper bound on the encoded reply size, used to pre-size the reply
    /// buffer for `Direct` parsers.
    fn calculate_message_size(&self, connection: u64, request: &Request) -> usize;

    /// Encodes the reply into `out`, which has `calculate_message_size`
    /// bytes of spare capacity reserved. Must not write more than that.
    fn build_reply(&self, connection: u64, request: &Request, out: &mut Vec<u8>) -> Result<(), String>;
}

struct AsyncSlots {
    in_use: AtomicUsize,
    shutdown: AtomicBool,
}

impl Default for AsyncSlots {
    fn default() -> Self { Self { in_use: AtomicUsize::new(0), shutdown: AtomicBool::new(false) } }
}

impl AsyncSlots {
    /// Blocks (spin-sleeping) until a slot frees up or shutdown is
    /// signaled.
    fn acquire(&self) -> Option<AsyncSlotGuard<'_>> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let current = self.in_use.load(Ordering::Acquire);
            if current >= ASYNC_SLOTS {
                std::thread::sleep(ASYNC_RETRY_BACKOFF);
                continue;
            }
            if self
                .in_use
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(AsyncSlotGuard { slots: self });
            }
        }
    }
}

struct AsyncSlotGuard<'a> {
    slots: &'a AsyncSlots,
}

impl Drop for AsyncSlotGuard<'_> {
    fn drop(&mut self) { self.slots.in_use.fetch_sub(1, Ordering::AcqRel); }
}

/// Routes requests to registered [`Parser`]s and owns the per-connection
/// session-slot table.
#[derive(Default)]
pub struct Dispatcher {
    parsers: HashMap<(ServiceId, MessageId), Box<dyn Parser>>,
    sessions: Mutex<HashMap<(u64, u32), Vec<u8>>>,
    async_slots: AsyncSlots,
    version_string: String,
}

impl Dispatcher {
    pub fn new(version_string: impl Into<String>) -> Self {
        Self { version_string: version_string.into(), ..Self::default() }
    }

    pub fn register(&mut self, service_id: ServiceId, message_id: MessageId, parser: Box<dyn Parser>) {
        self.parsers.insert((service_id, message_id), parser);
    }

    /// Marks every in-flight and future async dispatch as cancelled,
    /// letting blocked workers observe it and return promptly.
    pub fn shutdown(&self) { self.async_slots.shutdown.store(true, Ordering::Release); }

    /// Reads (without removing) the session-slot bytes a previous request
    /// from this connection left behind.
    pub fn session_state(&self, connection: u64, service_id: ServiceId, message_id: MessageId) -> Option<Vec<u8>> {
        self.sessions.lock().unwrap().get(&(connection, session_key(service_id, message_id))).cloned()
    }

    pub fn set_session_state(
        &self,
        connection: u64,
        service_id: ServiceId,
        message_id: MessageId,
        state: Vec<u8>,
    ) {
        self.sessions.lock().unwrap().insert((connection, session_key(service_id, message_id)), state);
    }

    /// Dispatches one request for `connection`, returning the reply bytes
    /// or a [`CommandFailed`].
    pub fn dispatch(&self, connection: u64, request: Request) -> Result<Vec<u8>, CommandFailed> {
        if request.service_id == API_SERVICE && request.message_id == VERSION_MESSAGE {
            return Ok(self.version_string.clone().into_bytes());
        }

        let Some(parser) = self.parsers.get(&(request.service_id, request.message_id)) else {
            return Err(CommandFailed {
                request_id: request.request_id,
                original_service_id: request.service_id,
                original_message_id: request.message_id,
                reason: "Unsupported command".to_string(),
            });
        };

        // Touching the session slot keeps state alive across requests even
        // when this dispatch itself doesn't need it.
        self.sessions.lock().unwrap().entry((connection, session_key(request.service_id, request.message_id))).or_default();

        let fail = |reason: String| CommandFailed {
            request_id: request.request_id,
            original_service_id: request.service_id,
            original_message_id: request.message_id,
            reason,
        };

        match parser.kind() {
            ParserKind::Direct => {
                let reserved = parser.calculate_message_size(connection, &request);
                let mut out = Vec::with_capacity(reserved);
                parser.build_reply(connection, &request, &mut out).map_err(fail)?;
                assert!(out.len() <= reserved, "parser wrote past its declared reply size");
                Ok(out)
            }
            ParserKind::RpcBridge => {
                let mut out = Vec::new();
                parser.build_reply(connection, &request, &mut out).map_err(fail)?;
                Ok(out)
            }
            ParserKind::Async => {
                let Some(_guard) = self.async_slots.acquire() else {
                    return Err(fail("shutting down".to_string()));
                };
                let mut out = Vec::new();
                parser.build_reply(connection, &request, &mut out).map_err(fail)?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl Parser for Echo {
        fn kind(&self) -> ParserKind { ParserKind::Direct }
        fn calculate_message_size(&self, _connection: u64, request: &Request) -> usize { request.body.len() }
        fn build_reply(&self, _connection: u64, request: &Request, out: &mut Vec<u8>) -> Result<(), String> {
            out.extend_from_slice(&request.body);
            Ok(())
        }
    }

    struct Blower;
    impl Parser for Blower {
        fn kind(&self) -> ParserKind { ParserKind::Direct }
        fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 1 }
        fn build_reply(&self, _connection: u64, _request: &Request, out: &mut Vec<u8>) -> Result<(), String> {
            out.extend_from_slice(&[1, 2, 3]);
            Ok(())
        }
    }

    struct Slow;
    impl Parser for Slow {
        fn kind(&self) -> ParserKind { ParserKind::Async }
        fn calculate_message_size(&self, _connection: u64, _request: &Request) -> usize { 0 }
        fn build_reply(&self, _connection: u64, _request: &Request, out: &mut Vec<u8>) -> Result<(), String> {
            out.push(42);
            Ok(())
        }
    }

    fn req(service_id: ServiceId, message_id: MessageId, body: &[u8]) -> Request {
        Request { request_id: RequestId(1), service_id, message_id, body: body.to_vec() }
    }

    #[test]
    fn version_request_is_answered_synthetically_without_a_registered_parser() {
        let d = Dispatcher::new("cashhub/1.0");
        let reply = d.dispatch(1, req(API_SERVICE, VERSION_MESSAGE, b"")).unwrap();
        assert_eq!(reply, b"cashhub/1.0");
    }

    #[test]
    fn unregistered_command_fails_with_unsupported() {
        let d = Dispatcher::new("v");
        let err = d.dispatch(1, req(5, 9, b"")).unwrap_err();
        assert_eq!(err.reason, "Unsupported command");
        assert_eq!(err.original_service_id, 5);
        assert_eq!(err.original_message_id, 9);
    }

    #[test]
    fn direct_parser_echoes_and_fits_its_declared_bound() {
        let mut d = Dispatcher::new("v");
        d.register(1, 1, Box::new(Echo));
        let reply = d.dispatch(1, req(1, 1, b"hello")).unwrap();
        assert_eq!(reply, b"hello");
    }

    #[test]
    #[should_panic(expected = "parser wrote past its declared reply size")]
    fn direct_parser_exceeding_its_bound_fails_fast() {
        let mut d = Dispatcher::new("v");
        d.register(2, 2, Box::new(Blower));
        let _ = d.dispatch(1, req(2, 2, b""));
    }

    #[test]
    fn async_parser_runs_and_releases_its_slot() {
        let mut d = Dispatcher::new("v");
        d.register(3, 3, Box::new(Slow));
        for _ in 0..(ASYNC_SLOTS + 2) {
            let reply = d.dispatch(1, req(3, 3, b"")).unwrap();
            assert_eq!(reply, vec![42]);
        }
    }

    #[test]
    fn shutdown_makes_async_dispatch_fail_fast() {
        let mut d = Dispatcher::new("v");
        d.register(3, 3, Box::new(Slow));
        d.shutdown();
        let err = d.dispatch(1, req(3, 3, b"")).unwrap_err();
        assert_eq!(err.reason, "shutting down");
    }

    #[test]
    fn session_state_persists_per_connection_and_endpoint() {
        let mut d = Dispatcher::new("v");
        d.register(1, 1, Box::new(Echo));
        assert_eq!(d.session_state(1, 1, 1), None);
        d.dispatch(1, req(1, 1, b"x")).unwrap();
        assert_eq!(d.session_state(1, 1, 1), Some(Vec::new()));
        d.set_session_state(1, 1, 1, vec![9, 9]);
        assert_eq!(d.session_state(1, 1, 1), Some(vec![9, 9]));
        assert_eq!(d.session_state(2, 1, 1), None);
    }
}
