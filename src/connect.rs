use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, error, info, trace};

use crate::config::{ConnectionConfig, HANDSHAKE_ATTEMPT_INTERVAL, HANDSHAKE_RETRIES};
use crate::connection::Connection;
use crate::events::ConnectHandler;
use crate::packet::{Packet, MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE};
use crate::sequence::SequenceNumber;
use crate::socket::DatagramSocket;

/// Initiates a session with `peer`: binds a local socket and drives the handshake in a
///  background task. The outcome - an established [`Connection`] or `None` once the
///  attempts are exhausted - is delivered through `on_connect`.
///
/// Datagrams the peer sends between its HandshakeAck and our processing of it are not
///  lost: they are queued in arrival order and replayed through the connection's
///  normal receive path after `on_connect` returns.
pub async fn connect(peer: SocketAddrV4, config: ConnectionConfig, on_connect: Arc<dyn ConnectHandler>) -> anyhow::Result<JoinHandle<()>> {
    config.validate()?;

    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await
        .context("binding connect socket")?;
    let socket: Arc<dyn DatagramSocket> = Arc::new(socket);
    info!("bound connect socket to {}, connecting to {}", socket.local_addr()?, peer);

    Ok(tokio::spawn(run_handshake(socket, peer, config, on_connect)))
}

async fn run_handshake(socket: Arc<dyn DatagramSocket>, peer: SocketAddrV4, config: ConnectionConfig, on_connect: Arc<dyn ConnectHandler>) {
    let initial_sequence = SequenceNumber::random_initial();

    let mut handshake = BytesMut::new();
    Packet::Handshake { seq: initial_sequence }.ser(&mut handshake);

    // datagrams from the target peer that are not the awaited ack - replayed through
    //  the connection once the handshake completes
    let mut pending: Vec<Vec<u8>> = Vec::new();
    let mut buf = vec![0u8; PACKET_HEADER_SIZE + MAX_PAYLOAD_SIZE];

    for attempt in 0..=HANDSHAKE_RETRIES {
        trace!("handshake attempt {} with {}", attempt + 1, peer);
        if let Err(e) = socket.send_to(peer, &handshake).await {
            error!("error sending handshake to {}: {}", peer, e);
        }

        let deadline = Instant::now() + HANDSHAKE_ATTEMPT_INTERVAL;
        while Instant::now() < deadline {
            match socket.try_recv_from(&mut buf) {
                Ok(Some((len, from))) => {
                    if from != peer {
                        trace!("datagram from unrelated {} during handshake - discarding", from);
                        continue;
                    }
                    let datagram = buf[..len].to_vec();
                    if let Ok(Packet::HandshakeAck { seq: peer_initial }) = Packet::deser(&mut &datagram[..]) {
                        debug!("handshake with {} complete on attempt {}", peer, attempt + 1);

                        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                        let connection = Connection::establish(&config, peer, initial_sequence, peer_initial, socket.clone(), inbound_rx);

                        // hand the connection to the application first so it can register
                        //  its handlers before any queued traffic is replayed
                        on_connect.on_connect(Some(connection.clone())).await;
                        for queued in pending.drain(..) {
                            let _ = inbound_tx.send(queued);
                        }

                        let pump = tokio::spawn(pump_datagrams(socket, peer, inbound_tx, config.tick_interval));
                        connection.attach_pump(pump).await;
                        return;
                    }
                    pending.push(datagram);
                }
                Ok(None) => sleep(config.tick_interval).await,
                Err(e) => {
                    error!("socket error while waiting for a handshake ack from {}: {}", peer, e);
                    sleep(config.tick_interval).await;
                }
            }
        }
    }

    debug!("handshake with {} failed after {} attempts - giving up", peer, HANDSHAKE_RETRIES + 1);
    on_connect.on_connect(None).await;
}

/// Feeds the connection's inbound channel from the socket: non-blocking receives every
///  tick, discarding datagrams that are not from the connection's peer. Ends when the
///  connection is gone.
async fn pump_datagrams(socket: Arc<dyn DatagramSocket>, peer: SocketAddrV4, inbound: UnboundedSender<Vec<u8>>, tick_interval: Duration) {
    let mut tick = interval(tick_interval);
    let mut buf = vec![0u8; PACKET_HEADER_SIZE + MAX_PAYLOAD_SIZE];

    loop {
        tick.tick().await;
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok(Some((len, from))) => {
                    if from != peer {
                        trace!("datagram from unrelated {} - discarding", from);
                        continue;
                    }
                    if inbound.send(buf[..len].to_vec()).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("socket error receiving from {}: {}", peer, e);
                    break;
                }
            }
        }
    }
}
