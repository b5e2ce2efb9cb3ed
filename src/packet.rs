use std::fmt::Debug;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::sequence::SequenceNumber;

/// Serialized size of the largest packet header: tag byte plus two 32-bit sequence fields.
pub const PACKET_HEADER_SIZE: usize = 1 + 2 * size_of::<i32>();

/// The largest payload that fits a single datagram together with its header.
pub const MAX_PAYLOAD_SIZE: usize = 65_536 - PACKET_HEADER_SIZE;

const TAG_SEQUENCED: u8 = 0;
const TAG_UNSEQUENCED: u8 = 1;
const TAG_REQUEST: u8 = 2;
const TAG_HANDSHAKE: u8 = 3;
const TAG_HANDSHAKE_ACK: u8 = 4;
const TAG_KEEP_ALIVE: u8 = 5;
const TAG_DISCONNECT: u8 = 6;

/// The seven packet kinds on the wire: a 1-byte tag, followed by the sequence fields
///  of the kind (32-bit signed, network byte order), followed by the payload for the
///  kinds that carry one. There is no length field - the datagram length is
///  authoritative.
///
/// `seq` is the sender's sequence number. `ack` is the sender's next expected receive
///  sequence, acting as a cumulative ack: "everything strictly below this was
///  delivered in order".
#[derive(Clone, Eq, PartialEq)]
pub enum Packet {
    Sequenced { seq: SequenceNumber, ack: SequenceNumber, payload: Bytes },
    Unsequenced { payload: Bytes },
    Request { seq: SequenceNumber },
    Handshake { seq: SequenceNumber },
    HandshakeAck { seq: SequenceNumber },
    KeepAlive { seq: SequenceNumber, ack: SequenceNumber },
    Disconnect { seq: SequenceNumber, ack: SequenceNumber },
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Packet::Sequenced { seq, ack, payload } => write!(f, "SEQ({}@{}:{})", seq, ack, payload.len()),
            Packet::Unsequenced { payload } => write!(f, "UNSEQ({})", payload.len()),
            Packet::Request { seq } => write!(f, "REQ({})", seq),
            Packet::Handshake { seq } => write!(f, "HS({})", seq),
            Packet::HandshakeAck { seq } => write!(f, "HSACK({})", seq),
            Packet::KeepAlive { seq, ack } => write!(f, "KA({}@{})", seq, ack),
            Packet::Disconnect { seq, ack } => write!(f, "DISC({}@{})", seq, ack),
        }
    }
}

impl Packet {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Packet::Sequenced { seq, ack, payload } => {
                buf.put_u8(TAG_SEQUENCED);
                buf.put_i32(seq.to_raw());
                buf.put_i32(ack.to_raw());
                buf.put_slice(payload);
            }
            Packet::Unsequenced { payload } => {
                buf.put_u8(TAG_UNSEQUENCED);
                buf.put_slice(payload);
            }
            Packet::Request { seq } => {
                buf.put_u8(TAG_REQUEST);
                buf.put_i32(seq.to_raw());
            }
            Packet::Handshake { seq } => {
                buf.put_u8(TAG_HANDSHAKE);
                buf.put_i32(seq.to_raw());
            }
            Packet::HandshakeAck { seq } => {
                buf.put_u8(TAG_HANDSHAKE_ACK);
                buf.put_i32(seq.to_raw());
            }
            Packet::KeepAlive { seq, ack } => {
                buf.put_u8(TAG_KEEP_ALIVE);
                buf.put_i32(seq.to_raw());
                buf.put_i32(ack.to_raw());
            }
            Packet::Disconnect { seq, ack } => {
                buf.put_u8(TAG_DISCONNECT);
                buf.put_i32(seq.to_raw());
                buf.put_i32(ack.to_raw());
            }
        }
    }

    /// Decodes one datagram. Frames shorter than the minimum for their tag, and
    ///  unknown tags, are errors - callers drop such datagrams silently.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let tag = buf.try_get_u8()?;
        let packet = match tag {
            TAG_SEQUENCED => Packet::Sequenced {
                seq: Self::get_sequence(buf)?,
                ack: Self::get_sequence(buf)?,
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            TAG_UNSEQUENCED => Packet::Unsequenced {
                payload: buf.copy_to_bytes(buf.remaining()),
            },
            TAG_REQUEST => Packet::Request {
                seq: Self::get_sequence(buf)?,
            },
            TAG_HANDSHAKE => Packet::Handshake {
                seq: Self::get_sequence(buf)?,
            },
            TAG_HANDSHAKE_ACK => Packet::HandshakeAck {
                seq: Self::get_sequence(buf)?,
            },
            TAG_KEEP_ALIVE => Packet::KeepAlive {
                seq: Self::get_sequence(buf)?,
                ack: Self::get_sequence(buf)?,
            },
            TAG_DISCONNECT => Packet::Disconnect {
                seq: Self::get_sequence(buf)?,
                ack: Self::get_sequence(buf)?,
            },
            other => bail!("unknown packet tag {}", other),
        };
        Ok(packet)
    }

    fn get_sequence(buf: &mut impl Buf) -> anyhow::Result<SequenceNumber> {
        Ok(SequenceNumber::from_raw(buf.try_get_i32()?))
    }
}
