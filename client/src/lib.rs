// Cash Hub: wire protocol crate.
//
// SPDX-License-Identifier: MIT

//! A minimal blocking client for the Cash Hub wire protocol:
//! connect, send a request, read back exactly one reply. No reactor, no
//! retry/reconnect policy — `hubd`'s own `net` module owns that side, this
//! crate is just the thin wire-level counterpart a caller embeds directly.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};

use cashhub_rpc::{packet_len, FrameError, Message, ReassemblyError, Reassembler, MAX_PACKET_LEN};

/// One connection to a Hub's API listener.
pub struct HubClient {
    stream: TcpStream,
    reassembler: Reassembler,
    next_request_id: AtomicU64,
}

#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    Frame(FrameError),
    Reassembly(ReassemblyError),
    /// The peer closed the connection before a full reply arrived.
    ConnectionClosed,
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self { ClientError::Io(err) }
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self { ClientError::Frame(err) }
}

impl From<ReassemblyError> for ClientError {
    fn from(err: ReassemblyError) -> Self { ClientError::Reassembly(err) }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "I/O error: {err}"),
            ClientError::Frame(err) => write!(f, "frame error: {err}"),
            ClientError::Reassembly(err) => write!(f, "reassembly error: {err}"),
            ClientError::ConnectionClosed => write!(f, "connection closed before a reply arrived"),
        }
    }
}

impl std::error::Error for ClientError {}

impl HubClient {
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        log::debug!("connected to {:?}", stream.peer_addr());
        Ok(Self { stream, reassembler: Reassembler::default(), next_request_id: AtomicU64::new(1) })
    }

    /// Sends `message` after stamping it with a fresh request id, then
    /// blocks for the matching reply. Does not itself check that the reply's
    /// `request_id` echoes what was sent — native framing is a single
    /// request/reply per round-trip, so the first message back is the answer.
    pub fn call(&mut self, service_id: i32, message_id: i32, body: Vec<u8>) -> Result<Message, ClientError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = Message::new(service_id, message_id, body).with_request_id(request_id);
        self.send(&request)?;
        self.recv()
    }

    pub fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        for packet in message.encode() {
            self.stream.write_all(&packet)?;
        }
        Ok(())
    }

    /// Blocks until one complete message has been reassembled from the
    /// stream, feeding it one native-framed packet at a time.
    pub fn recv(&mut self) -> Result<Message, ClientError> {
        loop {
            let mut header = [0u8; 2];
            self.stream.read_exact(&mut header).map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    io::Error::new(io::ErrorKind::UnexpectedEof, ClientError::ConnectionClosed)
                } else {
                    err
                }
            })?;
            let total_len = packet_len(header);
            if total_len < header.len() || total_len > MAX_PACKET_LEN {
                return Err(ClientError::Frame(FrameError::TooLarge(total_len, MAX_PACKET_LEN)));
            }
            let mut rest = vec![0u8; total_len - header.len()];
            self.stream.read_exact(&mut rest)?;
            let mut packet = header.to_vec();
            packet.extend_from_slice(&rest);
            if let Some(message) = self.reassembler.feed(&packet)? {
                return Ok(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use cashhub_rpc::{message, service};

    use super::*;

    #[test]
    fn call_round_trips_a_request_and_reply_over_a_loopback_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; 2];
            stream.read_exact(&mut header).unwrap();
            let len = u16::from_le_bytes(header) as usize;
            let mut rest = vec![0u8; len - 2];
            stream.read_exact(&mut rest).unwrap();
            let mut packet = header.to_vec();
            packet.extend_from_slice(&rest);
            let request = Message::decode(&packet).unwrap();
            assert_eq!(request.service_id, service::API);
            assert_eq!(request.message_id, message::api::VERSION);

            let reply = Message::new(service::API, message::api::VERSION, b"cashhub/test".to_vec())
                .with_request_id(request.request_id.unwrap());
            for packet in reply.encode() {
                stream.write_all(&packet).unwrap();
            }
        });

        let mut client = HubClient::connect(addr).unwrap();
        let reply = client.call(service::API, message::api::VERSION, Vec::new()).unwrap();
        assert_eq!(reply.body, b"cashhub/test");

        server.join().unwrap();
    }
}
