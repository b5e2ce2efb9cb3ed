//! UDPX is a lightweight reliable-ordered messaging layer on top of UDP datagrams: a
//!  connection abstraction over a connectionless transport. Two peers perform a
//!  handshake, exchange message payloads with optional per-message reliability and
//!  ordering, keep the session alive through periodic heartbeats, detect dead peers
//!  via timeout, and tear the session down cleanly.
//!
//! ## Design goals
//!
//! * Two delivery modes over the same session:
//!   * *reliable-ordered* ([`Connection::send`]): retained and retransmitted until
//!     acknowledged, delivered exactly once in send order
//!   * *unchecked* ([`Connection::send_unchecked`]): fire-and-forget, at-most-once per
//!     arriving datagram, no ordering, duplicates possible
//! * Acknowledgement is *implicit and cumulative*: every sequenced and keep-alive
//!   packet carries the sender's next expected receive sequence, meaning "everything
//!   strictly below this was delivered in order". Retransmission happens only on an
//!   explicit per-sequence Request from the receiver - there is no selective ack and
//!   no retransmit timer on the sender
//! * A fixed sequence window of 100 bounds how far sequence numbers may run ahead of
//!   the window frontiers; anything outside is dropped as stale or forged
//! * One connection per (local socket, peer) pair; a closed connection is never
//!   reused
//!
//! Explicitly *not* goals: congestion control, flow control, fragmentation of
//!  payloads across datagrams, encryption, NAT traversal, replay protection across
//!  session restarts.
//!
//! ## Wire format
//!
//! One packet per UDP datagram, no length prefix (the datagram length is
//!  authoritative), all integers in network byte order (BE). Sequence fields are
//!  *signed* 32-bit values starting near `i32::MIN`:
//!
//! ```ascii
//! 0:  tag (u8):
//!     * 0  Sequenced      seq(i32) ack(i32) payload...
//!     * 1  Unsequenced    payload...
//!     * 2  Request        seq(i32)
//!     * 3  Handshake      seq(i32)
//!     * 4  HandshakeAck   seq(i32)
//!     * 5  KeepAlive      seq(i32) ack(i32)
//!     * 6  Disconnect     seq(i32) ack(i32)
//! ```
//!
//! `seq` is the sender's sequence number for the packet kind at hand: the payload's
//!  sequence for Sequenced, the requested sequence for Request, the announced initial
//!  sequence for Handshake/HandshakeAck, the last *used* sequence for KeepAlive, and
//!  the next unused one for Disconnect. `ack` is always the sender's next expected
//!  receive sequence.
//!
//! ## Session lifecycle
//!
//! * [`connect`] sends `Handshake(initial)` and retries up to five times at one-second
//!   intervals. The peer's `HandshakeAck(peer_initial)` establishes the connection;
//!   exhaustion reports `None`
//! * [`listen`] answers each `Handshake` from an unknown peer with a `HandshakeAck`
//!   and hands the established connection to the application. A duplicate `Handshake`
//!   on a live session gets a fresh ack, without any state reset
//! * While established, a connection emits `KeepAlive(last_used, next_expected)`
//!   whenever its keep-alive interval elapses without outbound reliable traffic, and
//!   declares the peer dead when its timeout elapses without inbound datagrams of any
//!   kind
//! * `Disconnect` - explicit, best effort - or the timeout close the session. Closing
//!   releases the socket, the retained payloads and the reorder buffer
//!
//! ## Concurrency model
//!
//! Every connection owns one driver task that processes inbound datagrams and runs
//!  the two clocks; all session state is behind one coarse lock shared with the
//!  public methods. User callbacks fire on the driver task, unordered before ordered
//!  for the same payload, and must not block; they may send, but must not expect the
//!  connection to outlive a reentrant disconnect.

mod config;
mod connect;
mod connection;
mod events;
mod listener;
mod packet;
mod receive_buffer;
mod send_buffer;
mod sequence;
mod socket;

pub use config::{ConnectionConfig, HANDSHAKE_ATTEMPT_INTERVAL, HANDSHAKE_RETRIES, TICK_INTERVAL};
pub use connect::connect;
pub use connection::Connection;
pub use events::{AcceptHandler, ConnectHandler, DisconnectHandler, OrderedHandler, ReceivedHandler};
pub use listener::{listen, Listener};
pub use packet::{Packet, MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE};
pub use sequence::{SequenceNumber, SEQUENCE_WINDOW};
pub use socket::{init_sockets, uninit_sockets, DatagramSocket};
