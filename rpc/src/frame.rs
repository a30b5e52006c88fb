// Cash Hub: wire protocol crate.
//
// SPDX-License-Identifier: MIT

//! Native message framing: a 2-byte little-endian length header
//! followed by a tagged-field body terminated by `HeaderEnd`, plus the
//! chunking scheme used to carry bodies larger than one packet.

use amplify::{Display, Error, From};

use crate::ids::{header_tag, MessageId, RequestId, ServiceId};
use crate::tagged::{Field, TagReader, TagWriter, TaggedError};

/// Maximum total packet length, including the 2-byte header.
pub const MAX_PACKET_LEN: usize = 9000;
/// Size of the length-plus-flag header.
pub const FRAME_HEADER_LEN: usize = 2;
/// Maximum body carried by a single chunk.
pub const MAX_CHUNK_BODY: usize = 8000;

#[derive(Clone, Eq, PartialEq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum FrameError {
    /// packet length {0} exceeds the {1}-byte maximum.
    TooLarge(usize, usize),
    /// packet is shorter than the 2-byte frame header.
    Truncated,
    /// declared packet length {0} does not match the {1} bytes available.
    LengthMismatch(usize, usize),
    /// malformed tagged field in message body.
    #[from]
    Tagged(TaggedError),
    /// message is missing a required `ServiceId` or `MessageId` header field.
    MissingHeader,
}

/// A fully decoded, reassembled application message.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub service_id: ServiceId,
    pub message_id: MessageId,
    pub request_id: Option<RequestId>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(service_id: ServiceId, message_id: MessageId, body: Vec<u8>) -> Self {
        Self { service_id, message_id, request_id: None, body }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Encodes this message as one or more on-wire packets, auto-chunking
    /// bodies larger than [`MAX_CHUNK_BODY`].
    pub fn encode(&self) -> Vec<Vec<u8>> {
        if self.body.len() <= MAX_CHUNK_BODY {
            return vec![encode_packet(self.service_id, self.message_id, self.request_id, None, &self.body)];
        }

        let total = self.body.len();
        let mut packets = Vec::new();
        let mut offset = 0;
        let mut first = true;
        while offset < total {
            let end = (offset + MAX_CHUNK_BODY).min(total);
            let last = end == total;
            let seq_start = if first { Some(total as u64) } else { None };
            packets.push(encode_packet(
                self.service_id,
                self.message_id,
                self.request_id,
                Some((seq_start, last)),
                &self.body[offset..end],
            ));
            offset = end;
            first = false;
        }
        packets
    }

    /// Decodes a single, already-reassembled packet body plus header into a
    /// `Message`. Used directly for packets that were never chunked.
    pub fn decode(packet: &[u8]) -> Result<Self, FrameError> {
        let (header, body_start) = decode_header(packet)?;
        Ok(Message {
            service_id: header.service_id.ok_or(FrameError::MissingHeader)?,
            message_id: header.message_id.ok_or(FrameError::MissingHeader)?,
            request_id: header.request_id,
            body: packet[body_start..].to_vec(),
        })
    }
}

fn encode_packet(
    service_id: ServiceId,
    message_id: MessageId,
    request_id: Option<RequestId>,
    chunk: Option<(Option<u64>, bool)>,
    body: &[u8],
) -> Vec<u8> {
    let mut header = TagWriter::new();
    write_signed(&mut header, header_tag::SERVICE_ID, service_id as i64);
    write_signed(&mut header, header_tag::MESSAGE_ID, message_id as i64);
    if let Some(rid) = request_id {
        header.positive(header_tag::REQUEST_ID, rid);
    }
    if let Some((seq_start, last)) = chunk {
        if let Some(total) = seq_start {
            header.positive(header_tag::SEQUENCE_START, total);
        }
        if last {
            header.boolean(header_tag::LAST_IN_SEQUENCE, true);
        }
    }
    header.separator();

    let mut packet = Vec::with_capacity(FRAME_HEADER_LEN + header.len() + body.len());
    let total_len = (FRAME_HEADER_LEN + header.len() + body.len()) as u16;
    packet.extend_from_slice(&total_len.to_le_bytes());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(body);
    packet
}

fn write_signed(w: &mut TagWriter, tag: u32, v: i64) {
    if v >= 0 {
        w.positive(tag, v as u64);
    } else {
        w.negative(tag, (-v) as u64);
    }
}

#[derive(Default)]
struct DecodedHeader {
    service_id: Option<ServiceId>,
    message_id: Option<MessageId>,
    request_id: Option<RequestId>,
    sequence_start: Option<u64>,
    last_in_sequence: bool,
}

/// Validates the 2-byte length header and parses tagged header fields,
/// returning the header and the offset at which the body begins.
fn decode_header(packet: &[u8]) -> Result<(DecodedHeader, usize), FrameError> {
    if packet.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    let declared = u16::from_le_bytes([packet[0], packet[1]]) as usize;
    if declared > MAX_PACKET_LEN {
        return Err(FrameError::TooLarge(declared, MAX_PACKET_LEN));
    }
    if declared != packet.len() {
        return Err(FrameError::LengthMismatch(declared, packet.len()));
    }

    let mut reader = TagReader::new(&packet[FRAME_HEADER_LEN..]);
    let mut header = DecodedHeader::default();
    loop {
        match reader.next()? {
            Field::Separator => break,
            Field::Positive(header_tag::SERVICE_ID, v) => header.service_id = Some(v as ServiceId),
            Field::Negative(header_tag::SERVICE_ID, v) => header.service_id = Some(-(v as i64) as ServiceId),
            Field::Positive(header_tag::MESSAGE_ID, v) => header.message_id = Some(v as MessageId),
            Field::Negative(header_tag::MESSAGE_ID, v) => header.message_id = Some(-(v as i64) as MessageId),
            Field::Positive(header_tag::REQUEST_ID, v) => header.request_id = Some(v),
            Field::Positive(header_tag::SEQUENCE_START, v) => header.sequence_start = Some(v),
            Field::Bool(header_tag::LAST_IN_SEQUENCE, v) => header.last_in_sequence = v,
            _ => {} // unrecognized application header field: ignored, not an error
        }
    }
    let body_start = FRAME_HEADER_LEN + reader.position();
    Ok((header, body_start))
}

/// Splits a full packet into its declared total length so a caller reading
/// from a stream knows how many more bytes to buffer before calling
/// [`Message::decode`] or feeding [`Reassembler`].
pub fn packet_len(first_two_bytes: [u8; 2]) -> usize { u16::from_le_bytes(first_two_bytes) as usize }

/// Produces the packet sequence for a large outbound body. Thin wrapper kept
/// separate from `Message::encode` for callers (e.g. a connection's send
/// loop) that want to push one packet at a time into a connection's queue
/// rather than materializing the whole sequence up front.
pub struct Chunker;

impl Chunker {
    pub fn chunks(msg: &Message) -> Vec<Vec<u8>> { msg.encode() }
}

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ReassemblyError {
    /// service/message id changed mid-sequence.
    IdChanged,
    /// reassembled body would exceed the declared sequence total.
    OverLength,
    /// chunk arrived for a sequence that was never started.
    NoSequenceStarted,
    #[display(inner)]
    Frame(FrameError),
}

impl From<FrameError> for ReassemblyError {
    fn from(e: FrameError) -> Self { ReassemblyError::Frame(e) }
}

struct PartialMessage {
    service_id: ServiceId,
    message_id: MessageId,
    request_id: Option<RequestId>,
    total: u64,
    body: Vec<u8>,
}

/// Reassembles chunked messages per connection.
/// One `Reassembler` is owned by each `Connection`.
#[derive(Default)]
pub struct Reassembler {
    pending: Option<PartialMessage>,
}

impl Reassembler {
    pub fn new() -> Self { Self::default() }

    /// Feeds one decoded packet. Returns `Some(Message)` once a (possibly
    /// single-packet) message is complete.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Option<Message>, ReassemblyError> {
        let (header, body_start) = decode_header(packet)?;
        let service_id = header.service_id.ok_or(FrameError::MissingHeader)?;
        let message_id = header.message_id.ok_or(FrameError::MissingHeader)?;
        let body = &packet[body_start..];

        if let Some(total) = header.sequence_start {
            if self.pending.is_some() {
                // A new SequenceStart implicitly abandons an incomplete one
                // (the original peer would have sent LastInSequence first).
                self.pending = None;
            }
            self.pending = Some(PartialMessage {
                service_id,
                message_id,
                request_id: header.request_id,
                total,
                body: body.to_vec(),
            });
            return self.maybe_finish(header.last_in_sequence);
        }

        match &mut self.pending {
            Some(partial) => {
                if partial.service_id != service_id || partial.message_id != message_id {
                    self.pending = None;
                    return Err(ReassemblyError::IdChanged);
                }
                partial.body.extend_from_slice(body);
                if partial.body.len() as u64 > partial.total {
                    self.pending = None;
                    return Err(ReassemblyError::OverLength);
                }
                self.maybe_finish(header.last_in_sequence)
            }
            None => {
                // No chunk header at all: treat as a complete single-packet message.
                Ok(Some(Message { service_id, message_id, request_id: header.request_id, body: body.to_vec() }))
            }
        }
    }

    fn maybe_finish(&mut self, last: bool) -> Result<Option<Message>, ReassemblyError> {
        if !last {
            return Ok(None);
        }
        let partial = self.pending.take().ok_or(ReassemblyError::NoSequenceStarted)?;
        Ok(Some(Message {
            service_id: partial.service_id,
            message_id: partial.message_id,
            request_id: partial.request_id,
            body: partial.body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_round_trips_small_message() {
        let msg = Message::new(5, 0, b"hello world".to_vec()).with_request_id(7);
        let packets = msg.encode();
        assert_eq!(packets.len(), 1);
        let decoded = Message::decode(&packets[0]).unwrap();
        assert_eq!(decoded.service_id, 5);
        assert_eq!(decoded.message_id, 0);
        assert_eq!(decoded.request_id, Some(7));
        assert_eq!(decoded.body, b"hello world");
        assert_eq!(u16::from_le_bytes([packets[0][0], packets[0][1]]) as usize, packets[0].len());
    }

    #[test]
    fn chunked_message_reassembles_byte_identical() {
        let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let msg = Message::new(5, 1, body.clone());
        let packets = msg.encode();
        assert!(packets.len() > 1);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for packet in &packets {
            if let Some(m) = reassembler.feed(packet).unwrap() {
                result = Some(m);
            }
        }
        let result = result.expect("message should reassemble");
        assert_eq!(result.body, body);
    }

    #[test]
    fn sequence_mismatch_is_rejected() {
        let body = vec![0u8; 20_000];
        let msg_a = Message::new(5, 1, body.clone());
        let msg_b = Message::new(6, 1, body);
        let mut packets_a = msg_a.encode();
        let packets_b = msg_b.encode();
        packets_a[1] = packets_b[1].clone();

        let mut reassembler = Reassembler::new();
        reassembler.feed(&packets_a[0]).unwrap();
        assert!(matches!(reassembler.feed(&packets_a[1]), Err(ReassemblyError::IdChanged)));
    }
}
