// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! WireCodec: the daemon-facing wrapper around
//! `cashhub_rpc`'s framing primitives — encode a [`Message`] to packets,
//! feed inbound bytes through a [`Reassembler`], and fall back to the
//! legacy envelope for gateway-to-legacy-peers traffic.

use amplify::{Display, Error, From};
pub use cashhub_rpc::{
    FrameError, LegacyEnvelope, LegacyError, Message, ReassemblyError, Reassembler, MAX_PACKET_LEN,
};

#[derive(Clone, Eq, PartialEq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum WireError {
    /// malformed native frame.
    ///
    /// {0}
    #[from]
    Frame(FrameError),

    /// chunk reassembly failed.
    ///
    /// {0}
    #[from]
    Reassembly(ReassemblyError),

    /// malformed legacy envelope.
    ///
    /// {0}
    #[from]
    Legacy(LegacyError),
}

/// Per-connection codec state: reassembles chunked native messages inbound,
/// encodes outbound messages to packets.
#[derive(Default)]
pub struct WireCodec {
    reassembler: Reassembler,
}

impl WireCodec {
    pub fn new() -> Self { Self::default() }

    /// Feeds one already length-delimited inbound packet. Returns the
    /// reassembled message once complete.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Option<Message>, WireError> {
        Ok(self.reassembler.feed(packet)?)
    }

    /// Encodes an outbound message, auto-chunking bodies over 8000 bytes.
    pub fn encode(&self, msg: &Message) -> Vec<Vec<u8>> { msg.encode() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feeds_a_small_message_straight_through() {
        let mut codec = WireCodec::new();
        let msg = Message::new(5, 0, b"ping".to_vec());
        let packets = codec.encode(&msg);
        assert_eq!(packets.len(), 1);
        let decoded = codec.feed(&packets[0]).unwrap().unwrap();
        assert_eq!(decoded.body, b"ping");
    }
}
