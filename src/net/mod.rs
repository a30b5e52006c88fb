// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! NetCore: per-connection state machine, bounded queues with
//! backpressure, ping/idle timeout, reconnect backoff, and flood
//! protection. Connections are served by OS threads rather than a reactor
//! (see DESIGN.md for why `io-reactor`/`netservices` were dropped in favor
//! of `std::net` plus `crossbeam-channel`).

mod protect;
mod queue;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub use protect::{NetProtect, ProtectVerdict};
pub use queue::{Queue, QueueError};

pub const MAIN_QUEUE_CAPACITY: usize = 2000;
pub const PRIORITY_QUEUE_CAPACITY: usize = 20;
pub const PING_INTERVAL: Duration = Duration::from_secs(90);
pub const INBOUND_PING_TIMEOUT: Duration = Duration::from_secs(120);
pub const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);
pub const RECONNECT_CAP: Duration = Duration::from_secs(44);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Per-connection state machine. Inbound connections never
/// leave `Connected` except straight to `Disconnected`; only outbound
/// connections visit `Resolving`/`Connecting`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connecting,
    Connected,
}

/// `step^3 / 2`, capped at 44 s.
pub fn reconnect_backoff(step: u32) -> Duration {
    let secs = (step as u64).pow(3) / 2;
    Duration::from_secs(secs).min(RECONNECT_CAP)
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ConnectionId(pub u64);

/// A single client/peer connection. Socket I/O itself lives in
/// the accept/read/write threads spawned by `runtime`; this struct is the
/// state a connection carries between those threads.
pub struct Connection {
    pub id: ConnectionId,
    pub endpoint: SocketAddr,
    pub direction: Direction,
    state: ConnectionState,
    pub main_queue: Queue<Vec<u8>>,
    pub priority_queue: Queue<Vec<u8>>,
    last_ping_sent: Option<Instant>,
    last_ping_received: Instant,
    reconnect_step: u32,
}

impl Connection {
    pub fn new(id: ConnectionId, endpoint: SocketAddr, direction: Direction) -> Self {
        let state = match direction {
            Direction::Inbound => ConnectionState::Connected,
            Direction::Outbound => ConnectionState::Disconnected,
        };
        Self {
            id,
            endpoint,
            direction,
            state,
            main_queue: Queue::new(MAIN_QUEUE_CAPACITY),
            priority_queue: Queue::new(PRIORITY_QUEUE_CAPACITY),
            last_ping_sent: None,
            last_ping_received: Instant::now(),
            reconnect_step: 0,
        }
    }

    pub fn state(&self) -> ConnectionState { self.state }

    pub fn begin_resolving(&mut self) {
        assert_eq!(self.direction, Direction::Outbound);
        self.state = ConnectionState::Resolving;
    }

    pub fn begin_connecting(&mut self) { self.state = ConnectionState::Connecting; }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.last_ping_received = Instant::now();
        self.reconnect_step = 0;
    }

    /// Transitions to `Disconnected`, returning the reconnect delay if this
    /// is an outbound connection that should retry.
    pub fn mark_disconnected(&mut self) -> Option<Duration> {
        self.state = ConnectionState::Disconnected;
        if self.direction == Direction::Outbound {
            self.reconnect_step += 1;
            Some(reconnect_backoff(self.reconnect_step))
        } else {
            None
        }
    }

    pub fn record_ping_received(&mut self) { self.last_ping_received = Instant::now(); }

    pub fn record_ping_sent(&mut self) { self.last_ping_sent = Some(Instant::now()); }

    /// Whether an inbound connection's ping timeout has expired.
    pub fn inbound_ping_expired(&self, now: Instant) -> bool {
        self.direction == Direction::Inbound && now.duration_since(self.last_ping_received) > INBOUND_PING_TIMEOUT
    }

    pub fn should_send_ping(&self, now: Instant) -> bool {
        match self.last_ping_sent {
            None => true,
            Some(sent) => now.duration_since(sent) >= PING_INTERVAL,
        }
    }

    /// Enqueues onto the priority queue, used for pings and notifications
    /// that must not wait behind a backlog.
    pub fn send_priority(&self, msg: Vec<u8>) -> Result<(), QueueError> { self.priority_queue.try_send(msg) }

    pub fn send_main(&self, msg: Vec<u8>) -> Result<(), QueueError> { self.main_queue.try_send(msg) }

    /// Receive-side throttle delay given current backlog:
    /// thresholds at half, three-quarters, and 95% of main-queue capacity.
    pub fn receive_delay(&self) -> Duration {
        let backlog = self.main_queue.len() + self.priority_queue.len();
        let capacity = MAIN_QUEUE_CAPACITY;
        if backlog > capacity * 95 / 100 {
            Duration::from_millis(30)
        } else if backlog > capacity * 3 / 4 {
            Duration::from_millis(10)
        } else if backlog > capacity / 2 {
            Duration::from_millis(2)
        } else {
            Duration::ZERO
        }
    }

    /// Whether the send loop should be kicked to drain faster.
    pub fn should_kick_send_loop(&self) -> bool {
        self.main_queue.len() + self.priority_queue.len() > MAIN_QUEUE_CAPACITY * 3 / 8
    }
}

/// Returns connection shells to a free list on outbound disconnect so a
/// reconnect to a different endpoint can reuse the allocation.
pub struct ConnectionPool {
    free: Vec<Connection>,
    next_id: u64,
}

impl Default for ConnectionPool {
    fn default() -> Self { Self { free: Vec::new(), next_id: 1 } }
}

impl ConnectionPool {
    pub fn new() -> Self { Self::default() }

    pub fn acquire(&mut self, endpoint: SocketAddr, direction: Direction) -> Connection {
        if let Some(mut conn) = self.free.pop() {
            conn.endpoint = endpoint;
            conn.direction = direction;
            conn.state = match direction {
                Direction::Inbound => ConnectionState::Connected,
                Direction::Outbound => ConnectionState::Disconnected,
            };
            conn.reconnect_step = 0;
            conn.last_ping_sent = None;
            conn.last_ping_received = Instant::now();
            conn.main_queue = Queue::new(MAIN_QUEUE_CAPACITY);
            conn.priority_queue = Queue::new(PRIORITY_QUEUE_CAPACITY);
            return conn;
        }
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        Connection::new(id, endpoint, direction)
    }

    pub fn release(&mut self, conn: Connection) { self.free.push(conn); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr { "127.0.0.1:8337".parse().unwrap() }

    #[test]
    fn inbound_connection_starts_connected() {
        let conn = Connection::new(ConnectionId(1), addr(), Direction::Inbound);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn outbound_walks_the_full_state_machine() {
        let mut conn = Connection::new(ConnectionId(1), addr(), Direction::Outbound);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.begin_resolving();
        conn.begin_connecting();
        conn.mark_connected();
        assert_eq!(conn.state(), ConnectionState::Connected);
        let backoff = conn.mark_disconnected().unwrap();
        assert_eq!(backoff, Duration::from_secs(0));
    }

    #[test]
    fn reconnect_backoff_grows_then_caps() {
        assert_eq!(reconnect_backoff(1), Duration::from_secs(0));
        assert_eq!(reconnect_backoff(4), Duration::from_secs(32));
        assert_eq!(reconnect_backoff(100), RECONNECT_CAP);
    }

    #[test]
    fn queue_full_surfaces_as_an_error() {
        let conn = Connection::new(ConnectionId(1), addr(), Direction::Inbound);
        for _ in 0..PRIORITY_QUEUE_CAPACITY {
            conn.send_priority(vec![0]).unwrap();
        }
        assert!(matches!(conn.send_priority(vec![0]), Err(QueueError::Full)));
    }

    #[test]
    fn pool_recycles_connections_for_a_new_endpoint() {
        let mut pool = ConnectionPool::new();
        let conn = pool.acquire(addr(), Direction::Outbound);
        let id = conn.id;
        pool.release(conn);
        let other: SocketAddr = "10.0.0.1:8337".parse().unwrap();
        let reused = pool.acquire(other, Direction::Outbound);
        assert_eq!(reused.id, id);
        assert_eq!(reused.endpoint, other);
    }
}
