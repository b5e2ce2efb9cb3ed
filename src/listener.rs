use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::Context;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::events::AcceptHandler;
use crate::packet::{Packet, MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE};
use crate::sequence::SequenceNumber;
use crate::socket::DatagramSocket;

/// The accept side of the handshake: owns the listening socket and a demultiplexing
///  loop that routes inbound datagrams to the per-peer connections. Dropping the
///  listener stops accepting new sessions and stops feeding the accepted ones; their
///  timeout then reaps them.
pub struct Listener {
    local_addr: SocketAddrV4,
    accept_handle: JoinHandle<()>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
}

/// Binds `bind_addr` and accepts a session for every Handshake from a previously
///  unknown peer, invoking `on_accept` with the new [`Connection`]. The connection
///  itself answers the handshake, so handlers registered inside `on_accept` are in
///  place before the first payload can arrive.
pub async fn listen(bind_addr: SocketAddrV4, config: ConnectionConfig, on_accept: Arc<dyn AcceptHandler>) -> anyhow::Result<Listener> {
    config.validate()?;

    let socket = UdpSocket::bind(bind_addr).await
        .with_context(|| format!("binding listener to {}", bind_addr))?;
    let socket: Arc<dyn DatagramSocket> = Arc::new(socket);
    let local_addr = socket.local_addr()?;
    info!("listening on {}", local_addr);

    let accept_handle = tokio::spawn(accept_loop(socket, config, on_accept));

    Ok(Listener { local_addr, accept_handle })
}

struct PeerEntry {
    // holds the session alive while the listener still routes datagrams to it, even
    //  if the application dropped its handle
    _connection: Arc<Connection>,
    inbound: UnboundedSender<Vec<u8>>,
}

async fn accept_loop(socket: Arc<dyn DatagramSocket>, config: ConnectionConfig, on_accept: Arc<dyn AcceptHandler>) {
    let mut peers: FxHashMap<SocketAddrV4, PeerEntry> = FxHashMap::default();
    let mut tick = interval(config.tick_interval);
    let mut buf = vec![0u8; PACKET_HEADER_SIZE + MAX_PAYLOAD_SIZE];

    loop {
        tick.tick().await;

        loop {
            match socket.try_recv_from(&mut buf) {
                Ok(Some((len, from))) => {
                    let datagram = buf[..len].to_vec();

                    if let Some(entry) = peers.get(&from) {
                        if !entry.inbound.is_closed() {
                            let _ = entry.inbound.send(datagram);
                            continue;
                        }
                        debug!("session with {} has closed - releasing it", from);
                        peers.remove(&from);
                    }

                    match Packet::deser(&mut &datagram[..]) {
                        Ok(Packet::Handshake { seq: peer_initial }) => {
                            debug!("accepting session from {}", from);
                            let initial_sequence = SequenceNumber::random_initial();
                            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                            let connection = Connection::establish(&config, from, initial_sequence, peer_initial, socket.clone(), inbound_rx);

                            // the application registers its handlers here, before the
                            //  handshake (and everything following it) reaches the
                            //  connection
                            on_accept.on_accept(connection.clone()).await;
                            let _ = inbound_tx.send(datagram);

                            peers.insert(from, PeerEntry { _connection: connection, inbound: inbound_tx });
                        }
                        Ok(other) => trace!("{:?} from unknown peer {} - dropping", other, from),
                        Err(_) => debug!("malformed datagram from unknown peer {} - dropping", from),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("listener socket error: {}", e);
                    break;
                }
            }
        }
    }
}
