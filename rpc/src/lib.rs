// Cash Hub: wire protocol crate.
//
// SPDX-License-Identifier: MIT

//! Protocol-facing types shared between the Hub daemon and its clients:
//! the tagged-record primitive, native message
//! framing and chunking, the legacy Bitcoin p2p envelope used for the
//! gateway-to-legacy-peers role, and the service/message/header tag
//! constants. Pure encode/decode — no sockets here.

mod tagged;
mod frame;
mod ids;
mod legacy;

pub use frame::{
    packet_len, Chunker, FrameError, Message, ReassemblyError, Reassembler, FRAME_HEADER_LEN,
    MAX_CHUNK_BODY, MAX_PACKET_LEN,
};
pub use ids::{header_tag, message, service, MessageId, RequestId, ServiceId};
pub use legacy::{LegacyEnvelope, LegacyError, MAGIC_MAINNET, MAGIC_REGTEST, MAGIC_TESTNET};
pub use tagged::{Field, TagReader, TagWriter, TaggedError, ValueType, SEPARATOR_TAG};
