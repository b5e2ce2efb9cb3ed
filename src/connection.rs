use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, trace};

use crate::config::ConnectionConfig;
use crate::events::{DisconnectHandler, OrderedHandler, ReceivedHandler};
use crate::packet::{Packet, MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE};
use crate::receive_buffer::ReceiveBuffer;
use crate::send_buffer::SendBuffer;
use crate::sequence::{window_accepts, SequenceNumber};
use crate::socket::DatagramSocket;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SessionState {
    Established,
    Closed,
}

struct ConnectionInner {
    peer: SocketAddrV4,
    socket: Arc<dyn DatagramSocket>,
    state: SessionState,

    /// the randomly chosen starting sequence announced in the local handshake; kept
    ///  for answering duplicate Handshakes with a fresh HandshakeAck
    initial_sequence: SequenceNumber,

    send_buffer: SendBuffer,
    receive_buffer: ReceiveBuffer,

    keep_alive_interval: Option<Duration>,
    timeout: Option<Duration>,

    /// monotonic timestamps of the last outbound reliable / keep-alive packet and the
    ///  last inbound datagram; the driver compares clock deltas against these rather
    ///  than accumulating its sleep interval
    last_send: Instant,
    last_recv: Instant,

    received_handler: Option<Arc<dyn ReceivedHandler>>,
    ordered_handler: Option<Arc<dyn OrderedHandler>>,
    disconnect_handler: Option<Arc<dyn DisconnectHandler>>,

    /// socket pump task feeding the inbound channel (connect-initiated sessions only;
    ///  listener-accepted sessions are fed by the listener's demux loop)
    pump_handle: Option<JoinHandle<()>>,
}

impl ConnectionInner {
    /// Encodes and sends a protocol packet, logging rather than surfacing I/O errors -
    ///  internal sends are best-effort, a persistently dead link is reaped by the
    ///  timeout. Reliable and keep-alive packets reset the keep-alive clock.
    async fn send_packet(&mut self, packet: &Packet) {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + MAX_PAYLOAD_SIZE);
        packet.ser(&mut buf);
        trace!("sending {:?} to {}", packet, self.peer);

        if let Err(e) = self.socket.send_to(self.peer, &buf).await {
            error!("error sending {:?} to {}: {}", packet, self.peer, e);
            return;
        }
        if matches!(packet, Packet::Sequenced { .. } | Packet::KeepAlive { .. }) {
            self.last_send = Instant::now();
        }
    }

    fn accepts(&self, seq: SequenceNumber, ack: SequenceNumber) -> bool {
        window_accepts(
            seq,
            ack,
            self.receive_buffer.next_expected(),
            self.receive_buffer.highest_seen(),
            self.send_buffer.next_sequence(),
        )
    }
}

/// Callbacks collected during packet processing, fired after the state lock is
///  released so that handlers may call back into the connection.
#[derive(Default)]
struct PendingCallbacks {
    unordered: Option<(bool, Bytes)>,
    ordered_run: Vec<Bytes>,
    disconnected: Option<bool>,
}

/// One live session with a single peer, created by [`crate::connect`] on receipt of
///  the peer's HandshakeAck or by [`crate::listen`] on receipt of a Handshake.
///
/// All session state is owned by a driver task that processes inbound datagrams and
///  runs the keep-alive and timeout clocks; the public methods synchronize with it
///  through one coarse lock. User callbacks run on the driver task and must not block
///  it. A connection is done once it is closed - by [`Connection::disconnect`], by
///  the peer's Disconnect, or by the timeout - and is never reused.
pub struct Connection {
    peer: SocketAddrV4,
    inner: Arc<RwLock<ConnectionInner>>,
    driver_handle: Option<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.driver_handle.take() {
            handle.abort();
        }
        if let Ok(mut inner) = self.inner.try_write() {
            if let Some(pump) = inner.pump_handle.take() {
                pump.abort();
            }
        }
    }
}

impl Connection {
    /// Assembles a connection over an already-completed handshake and spawns its
    ///  driver task. `inbound` must carry the raw datagrams arriving from `peer`;
    ///  outbound traffic goes through `socket`.
    pub fn establish(
        config: &ConnectionConfig,
        peer: SocketAddrV4,
        initial_sequence: SequenceNumber,
        peer_initial_sequence: SequenceNumber,
        socket: Arc<dyn DatagramSocket>,
        inbound: UnboundedReceiver<Vec<u8>>,
    ) -> Arc<Connection> {
        debug!("establishing connection with {}: local initial sequence {}, peer initial sequence {}",
            peer, initial_sequence, peer_initial_sequence);

        let inner = Arc::new(RwLock::new(ConnectionInner {
            peer,
            socket,
            state: SessionState::Established,
            initial_sequence,
            send_buffer: SendBuffer::new(initial_sequence),
            receive_buffer: ReceiveBuffer::new(peer_initial_sequence),
            keep_alive_interval: config.keep_alive_interval,
            timeout: config.timeout,
            last_send: Instant::now(),
            last_recv: Instant::now(),
            received_handler: None,
            ordered_handler: None,
            disconnect_handler: None,
            pump_handle: None,
        }));

        let driver_handle = tokio::spawn(Self::drive(inner.clone(), inbound, config.tick_interval));

        Arc::new(Connection {
            peer,
            inner,
            driver_handle: Some(driver_handle),
        })
    }

    pub(crate) async fn attach_pump(&self, handle: JoinHandle<()>) {
        self.inner.write().await.pump_handle = Some(handle);
    }

    /// The peer this session talks to. Immutable for the life of the connection.
    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.state == SessionState::Closed
    }

    /// Sends a payload reliably: it is retained and retransmitted on request until the
    ///  peer acknowledges it, and the peer delivers it in send order.
    ///
    /// An I/O error is returned but does not tear down the session - the retained copy
    ///  still reaches the peer through its retransmit requests, and a persistently
    ///  dead link is reaped by the timeout.
    pub async fn send(&self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            bail!("payload of {} bytes exceeds the maximum of {}", payload.len(), MAX_PAYLOAD_SIZE);
        }

        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Closed {
            bail!("connection to {} is closed", inner.peer);
        }

        let seq = inner.send_buffer.store(Bytes::copy_from_slice(payload));
        let packet = Packet::Sequenced {
            seq,
            ack: inner.receive_buffer.next_expected(),
            payload: Bytes::copy_from_slice(payload),
        };

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
        packet.ser(&mut buf);
        trace!("sending {:?} to {}", packet, inner.peer);

        let peer = inner.peer;
        inner.socket.send_to(peer, &buf).await
            .with_context(|| format!("sending reliable payload #{} to {}", seq, peer))?;
        inner.last_send = Instant::now();
        Ok(())
    }

    /// Sends a payload fire-and-forget: no retention, no retransmission, no ordering,
    ///  and the peer may observe duplicates the network introduces.
    pub async fn send_unchecked(&self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            bail!("payload of {} bytes exceeds the maximum of {}", payload.len(), MAX_PAYLOAD_SIZE);
        }

        let inner = self.inner.read().await;
        if inner.state == SessionState::Closed {
            bail!("connection to {} is closed", inner.peer);
        }

        let packet = Packet::Unsequenced { payload: Bytes::copy_from_slice(payload) };
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        packet.ser(&mut buf);
        trace!("sending {:?} to {}", packet, inner.peer);

        inner.socket.send_to(inner.peer, &buf).await
            .with_context(|| format!("sending unchecked payload to {}", inner.peer))?;
        Ok(())
    }

    /// Announces the disconnect to the peer (best effort - the datagram is sent twice
    ///  and losses are ignored) and closes the session. No disconnect event is
    ///  delivered for a locally initiated disconnect.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Closed {
            return;
        }
        debug!("disconnecting from {}", inner.peer);
        inner.state = SessionState::Closed;

        let packet = Packet::Disconnect {
            seq: inner.send_buffer.next_sequence(),
            ack: inner.receive_buffer.next_expected(),
        };
        inner.send_packet(&packet).await;
        inner.send_packet(&packet).await;
    }

    pub async fn set_keep_alive(&self, interval: Option<Duration>) {
        self.inner.write().await.keep_alive_interval = interval;
    }

    pub async fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.write().await.timeout = timeout;
    }

    pub async fn set_received_handler(&self, handler: Arc<dyn ReceivedHandler>) {
        self.inner.write().await.received_handler = Some(handler);
    }

    pub async fn set_ordered_handler(&self, handler: Arc<dyn OrderedHandler>) {
        self.inner.write().await.ordered_handler = Some(handler);
    }

    pub async fn set_disconnect_handler(&self, handler: Arc<dyn DisconnectHandler>) {
        self.inner.write().await.disconnect_handler = Some(handler);
    }

    /// The driver loop: processes inbound datagrams as they arrive and checks the
    ///  keep-alive and timeout clocks every tick. Exits once the session is closed,
    ///  releasing the socket pump - nothing runs on behalf of this connection
    ///  afterwards.
    async fn drive(inner: Arc<RwLock<ConnectionInner>>, mut inbound: UnboundedReceiver<Vec<u8>>, tick_interval: Duration) {
        let mut tick = interval(tick_interval);
        let mut inbound_open = true;

        loop {
            select! {
                received = inbound.recv(), if inbound_open => {
                    match received {
                        Some(datagram) => Self::process_datagram(&inner, datagram).await,
                        // the datagram source is gone; keep the clocks running so the
                        //  timeout can reap the session
                        None => inbound_open = false,
                    }
                }
                _ = tick.tick() => {
                    Self::check_clocks(&inner).await;
                }
            }

            if inner.read().await.state == SessionState::Closed {
                break;
            }
        }

        // closing releases everything held on behalf of the session: the socket pump,
        //  the retained payloads, the reorder backlog and the handler references
        let mut inner = inner.write().await;
        if let Some(pump) = inner.pump_handle.take() {
            pump.abort();
        }
        inner.send_buffer.clear();
        inner.receive_buffer.clear();
        inner.received_handler = None;
        inner.ordered_handler = None;
        inner.disconnect_handler = None;
        trace!("driver for {} done", inner.peer);
    }

    async fn process_datagram(inner: &Arc<RwLock<ConnectionInner>>, datagram: Vec<u8>) {
        let packet = match Packet::deser(&mut &datagram[..]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("received malformed datagram ({}) - dropping", e);
                return;
            }
        };

        let mut callbacks = PendingCallbacks::default();
        let handlers;
        {
            let mut inner = inner.write().await;
            if inner.state == SessionState::Closed {
                return;
            }
            inner.last_recv = Instant::now();
            trace!("received {:?} from {}", packet, inner.peer);

            match packet {
                Packet::Handshake { .. } => {
                    // duplicate handshake: answer with a fresh ack, no state reset
                    let ack = Packet::HandshakeAck { seq: inner.initial_sequence };
                    inner.send_packet(&ack).await;
                }
                Packet::HandshakeAck { .. } => {
                    trace!("handshake ack on an established session - ignoring");
                }
                Packet::Unsequenced { payload } => {
                    callbacks.unordered = Some((false, payload));
                }
                Packet::Request { seq } => {
                    if let Some(payload) = inner.send_buffer.retained(seq) {
                        debug!("retransmitting #{} to {}", seq, inner.peer);
                        let packet = Packet::Sequenced {
                            seq,
                            ack: inner.receive_buffer.next_expected(),
                            payload,
                        };
                        inner.send_packet(&packet).await;
                    }
                    else {
                        // already cumulatively acked - the requester will catch up
                        trace!("request for #{} which is no longer retained - ignoring", seq);
                    }
                }
                Packet::Sequenced { seq, ack, payload } => {
                    if !inner.accepts(seq, ack) {
                        debug!("sequenced packet #{} (ack {}) outside the window - dropping", seq, ack);
                    }
                    else {
                        inner.send_buffer.apply_cumulative_ack(ack);

                        let keep_payload = inner.ordered_handler.is_some();
                        let accepted = inner.receive_buffer.accept(seq, payload.clone(), keep_payload);
                        if accepted.fresh {
                            callbacks.unordered = Some((true, payload));
                            callbacks.ordered_run = accepted.ordered_run;

                            for missing in inner.receive_buffer.missing_below_high() {
                                inner.send_packet(&Packet::Request { seq: missing }).await;
                            }
                        }
                        else {
                            trace!("duplicate sequenced packet #{} - dropping", seq);
                        }
                    }
                }
                Packet::KeepAlive { seq, ack } => {
                    // the keep-alive's seq is the peer's *last used* sequence, one below
                    //  its next one - shift it up for the window check, or a caught-up
                    //  receiver would reject every keep-alive
                    if !inner.accepts(seq.next(), ack) {
                        debug!("keep-alive (seq {}, ack {}) outside the window - dropping", seq, ack);
                    }
                    else {
                        inner.send_buffer.apply_cumulative_ack(ack);

                        for missing in inner.receive_buffer.missing_up_to(ack.next()) {
                            inner.send_packet(&Packet::Request { seq: missing }).await;
                        }
                    }
                }
                Packet::Disconnect { seq, ack } => {
                    if !inner.accepts(seq, ack) {
                        debug!("disconnect (seq {}, ack {}) outside the window - dropping", seq, ack);
                    }
                    else {
                        debug!("peer {} disconnected", inner.peer);
                        inner.state = SessionState::Closed;
                        callbacks.disconnected = Some(true);
                    }
                }
            }

            handlers = (
                inner.received_handler.clone(),
                inner.ordered_handler.clone(),
                inner.disconnect_handler.clone(),
            );
        }

        Self::fire_callbacks(callbacks, handlers).await;
    }

    async fn check_clocks(inner: &Arc<RwLock<ConnectionInner>>) {
        let mut callbacks = PendingCallbacks::default();
        let handlers;
        {
            let mut inner = inner.write().await;
            if inner.state == SessionState::Closed {
                return;
            }

            if let Some(keep_alive) = inner.keep_alive_interval {
                if inner.last_send.elapsed() > keep_alive {
                    let packet = Packet::KeepAlive {
                        seq: inner.send_buffer.last_used_sequence(),
                        ack: inner.receive_buffer.next_expected(),
                    };
                    inner.send_packet(&packet).await;
                }
            }

            if let Some(timeout) = inner.timeout {
                if inner.last_recv.elapsed() > timeout {
                    debug!("peer {} timed out - closing", inner.peer);
                    inner.state = SessionState::Closed;
                    callbacks.disconnected = Some(false);
                }
            }

            handlers = (
                inner.received_handler.clone(),
                inner.ordered_handler.clone(),
                inner.disconnect_handler.clone(),
            );
        }

        Self::fire_callbacks(callbacks, handlers).await;
    }

    #[allow(clippy::type_complexity)]
    async fn fire_callbacks(
        callbacks: PendingCallbacks,
        handlers: (Option<Arc<dyn ReceivedHandler>>, Option<Arc<dyn OrderedHandler>>, Option<Arc<dyn DisconnectHandler>>),
    ) {
        let (received_handler, ordered_handler, disconnect_handler) = handlers;

        if let Some((checked, payload)) = callbacks.unordered {
            if let Some(handler) = &received_handler {
                handler.on_received(checked, &payload).await;
            }
        }
        for payload in callbacks.ordered_run {
            if let Some(handler) = &ordered_handler {
                handler.on_received_ordered(&payload).await;
            }
        }
        if let Some(explicit) = callbacks.disconnected {
            if let Some(handler) = &disconnect_handler {
                handler.on_disconnected(explicit).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MockDisconnectHandler, MockOrderedHandler, MockReceivedHandler};
    use crate::socket::MockDatagramSocket;
    use mockall::Sequence;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const PEER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 7000);

    fn s(raw: i32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn encode(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        buf.to_vec()
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            tick_interval: Duration::from_millis(10),
            ..ConnectionConfig::default()
        }
    }

    /// records every datagram a connection sends, decoded
    fn recording_socket() -> (Arc<MockDatagramSocket>, Arc<Mutex<Vec<Packet>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut socket = MockDatagramSocket::new();
        let sent_clone = sent.clone();
        socket.expect_send_to()
            .returning(move |_, buf| {
                sent_clone.lock().unwrap().push(Packet::deser(&mut &buf[..]).unwrap());
                Ok(())
            });
        (Arc::new(socket), sent)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_send_retains_and_acks() {
        let (socket, sent) = recording_socket();
        let (_tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        conn.send(b"hello").await.unwrap();
        conn.send(b"world").await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], Packet::Sequenced { seq: s(1000), ack: s(5000), payload: Bytes::from_static(b"hello") });
        assert_eq!(sent[1], Packet::Sequenced { seq: s(1001), ack: s(5000), payload: Bytes::from_static(b"world") });
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_triggers_retransmit_with_current_ack() {
        let (socket, sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        conn.send(b"hello").await.unwrap();

        // the peer's first payload advances our ack before it requests a retransmit
        tx.send(encode(&Packet::Sequenced { seq: s(5000), ack: s(1000), payload: Bytes::from_static(b"hi") })).unwrap();
        tx.send(encode(&Packet::Request { seq: s(1000) })).unwrap();
        settle().await;

        let sent = sent.lock().unwrap();
        assert_eq!(*sent.last().unwrap(), Packet::Sequenced { seq: s(1000), ack: s(5001), payload: Bytes::from_static(b"hello") });
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_for_acked_payload_is_ignored() {
        let (socket, sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        conn.send(b"hello").await.unwrap();

        tx.send(encode(&Packet::KeepAlive { seq: s(4999), ack: s(1001) })).unwrap();
        settle().await;
        let sends_after_ack = sent.lock().unwrap().len();

        tx.send(encode(&Packet::Request { seq: s(1000) })).unwrap();
        settle().await;

        assert_eq!(sent.lock().unwrap().len(), sends_after_ack);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_triggers_requests_and_ordered_delivery_catches_up() {
        let (socket, sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        let ordered = Arc::new(Mutex::new(Vec::new()));
        let mut ordered_handler = MockOrderedHandler::new();
        let ordered_clone = ordered.clone();
        ordered_handler.expect_on_received_ordered()
            .returning(move |payload| { ordered_clone.lock().unwrap().push(payload.to_vec()); });
        conn.set_ordered_handler(Arc::new(ordered_handler)).await;

        tx.send(encode(&Packet::Sequenced { seq: s(5000), ack: s(1000), payload: Bytes::from_static(b"p0") })).unwrap();
        tx.send(encode(&Packet::Sequenced { seq: s(5002), ack: s(1000), payload: Bytes::from_static(b"p2") })).unwrap();
        settle().await;

        // the gap at 5001 was requested
        assert!(sent.lock().unwrap().contains(&Packet::Request { seq: s(5001) }));

        tx.send(encode(&Packet::Sequenced { seq: s(5001), ack: s(1000), payload: Bytes::from_static(b"p1") })).unwrap();
        settle().await;

        assert_eq!(*ordered.lock().unwrap(), vec![b"p0".to_vec(), b"p1".to_vec(), b"p2".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_window_sequenced_is_dropped() {
        let (socket, _sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        let mut received_handler = MockReceivedHandler::new();
        received_handler.expect_on_received().never();
        conn.set_received_handler(Arc::new(received_handler)).await;

        // seq == recv_next + SEQUENCE_WINDOW is the first rejected one
        tx.send(encode(&Packet::Sequenced { seq: s(5100), ack: s(1000), payload: Bytes::from_static(b"beyond") })).unwrap();
        // stale ack
        tx.send(encode(&Packet::Sequenced { seq: s(5000), ack: s(900), payload: Bytes::from_static(b"stale") })).unwrap();
        settle().await;
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_edge_sequenced_is_accepted() {
        let (socket, _sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        let mut received_handler = MockReceivedHandler::new();
        received_handler.expect_on_received()
            .withf(|checked, payload| *checked && payload == b"edge")
            .once()
            .returning(|_, _| ());
        conn.set_received_handler(Arc::new(received_handler)).await;

        // seq == recv_next + SEQUENCE_WINDOW - 1 is still inside the window
        tx.send(encode(&Packet::Sequenced { seq: s(5099), ack: s(1000), payload: Bytes::from_static(b"edge") })).unwrap();
        settle().await;
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_sequenced_delivers_once() {
        let (socket, _sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        let mut sequence = Sequence::new();
        let mut received_handler = MockReceivedHandler::new();
        received_handler.expect_on_received()
            .withf(|checked, payload| *checked && payload == b"p0")
            .once()
            .in_sequence(&mut sequence)
            .returning(|_, _| ());
        conn.set_received_handler(Arc::new(received_handler)).await;

        let datagram = encode(&Packet::Sequenced { seq: s(5000), ack: s(1000), payload: Bytes::from_static(b"p0") });
        tx.send(datagram.clone()).unwrap();
        tx.send(datagram).unwrap();
        settle().await;
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsequenced_is_delivered_unchecked_and_not_deduplicated() {
        let (socket, _sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        let mut received_handler = MockReceivedHandler::new();
        received_handler.expect_on_received()
            .withf(|checked, payload| !*checked && payload == b"fire")
            .times(2)
            .returning(|_, _| ());
        conn.set_received_handler(Arc::new(received_handler)).await;

        let datagram = encode(&Packet::Unsequenced { payload: Bytes::from_static(b"fire") });
        tx.send(datagram.clone()).unwrap();
        tx.send(datagram).unwrap();
        settle().await;
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_ack_evicts_and_requests_gaps() {
        let (socket, sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        conn.send(b"a").await.unwrap();
        conn.send(b"b").await.unwrap();

        // peer acked everything; its keep-alive also tells us it expects us to have
        //  received up to its ack - nothing of ours is missing here
        tx.send(encode(&Packet::KeepAlive { seq: s(4999), ack: s(1002) })).unwrap();
        tx.send(encode(&Packet::Request { seq: s(1000) })).unwrap();
        tx.send(encode(&Packet::Request { seq: s(1001) })).unwrap();
        settle().await;

        // both requests found nothing retained, so the only sends are the two payloads
        assert_eq!(sent.lock().unwrap().len(), 2);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_is_emitted_and_carries_last_used_sequence() {
        let (socket, sent) = recording_socket();
        let (_tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);
        conn.set_keep_alive(Some(Duration::from_millis(100))).await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        // no reliable payload was ever sent: the reference sequence is initial - 1
        assert_eq!(*sent.lock().unwrap().first().unwrap(), Packet::KeepAlive { seq: s(999), ack: s(5000) });
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_keep_alive_stops_emission() {
        let (socket, sent) = recording_socket();
        let (_tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        conn.set_keep_alive(Some(Duration::from_millis(100))).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let emitted = sent.lock().unwrap().len();
        assert!(emitted >= 1);

        conn.set_keep_alive(None).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sent.lock().unwrap().len(), emitted);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_disconnected_and_closes() {
        let (socket, _sent) = recording_socket();
        let (_tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        let mut disconnect_handler = MockDisconnectHandler::new();
        disconnect_handler.expect_on_disconnected()
            .withf(|explicit| !*explicit)
            .once()
            .returning(|_| ());
        conn.set_disconnect_handler(Arc::new(disconnect_handler)).await;
        conn.set_timeout(Some(Duration::from_millis(500))).await;

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(conn.is_closed().await);
        assert!(conn.send(b"too late").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_datagram_refreshes_the_timeout() {
        let (socket, _sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);
        conn.set_timeout(Some(Duration::from_millis(500))).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(300)).await;
            tx.send(encode(&Packet::KeepAlive { seq: s(4999), ack: s(1000) })).unwrap();
        }
        assert!(!conn.is_closed().await);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(conn.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_disconnect_fires_explicit_and_closes() {
        let (socket, _sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        let mut disconnect_handler = MockDisconnectHandler::new();
        disconnect_handler.expect_on_disconnected()
            .withf(|explicit| *explicit)
            .once()
            .returning(|_| ());
        conn.set_disconnect_handler(Arc::new(disconnect_handler)).await;

        tx.send(encode(&Packet::Disconnect { seq: s(5000), ack: s(1000) })).unwrap();
        settle().await;

        assert!(conn.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_disconnect_is_ignored() {
        let (socket, _sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        let mut disconnect_handler = MockDisconnectHandler::new();
        disconnect_handler.expect_on_disconnected().never();
        conn.set_disconnect_handler(Arc::new(disconnect_handler)).await;

        tx.send(encode(&Packet::Disconnect { seq: s(4000), ack: s(900) })).unwrap();
        settle().await;

        assert!(!conn.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_disconnect_announces_twice_and_closes() {
        let (socket, sent) = recording_socket();
        let (_tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        conn.disconnect().await;

        let expected = Packet::Disconnect { seq: s(1000), ack: s(5000) };
        assert_eq!(*sent.lock().unwrap(), vec![expected.clone(), expected]);
        assert!(conn.is_closed().await);
        assert!(conn.send_unchecked(b"nope").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_handshake_is_answered_with_fresh_ack() {
        let (socket, sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        tx.send(encode(&Packet::Handshake { seq: s(5000) })).unwrap();
        settle().await;

        assert_eq!(*sent.lock().unwrap(), vec![Packet::HandshakeAck { seq: s(1000) }]);
        assert!(!conn.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_datagram_is_dropped() {
        let (socket, sent) = recording_socket();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::establish(&config(), PEER, s(1000), s(5000), socket, rx);

        tx.send(vec![99, 1, 2, 3]).unwrap();
        tx.send(vec![0, 1]).unwrap();
        settle().await;

        assert!(sent.lock().unwrap().is_empty());
        assert!(!conn.is_closed().await);
    }
}
