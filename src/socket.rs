use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction over a UDP socket for sending and receiving whole datagrams
///  against IPv4 peers, introduced to facilitate mocking the I/O part away for testing
///  and to allow in-memory loopback channels in the two-party tests.
///
/// The receive side is non-blocking: `Ok(None)` means no datagram is pending, which is
///  the normal steady-state answer and must not stall the caller's timer loop.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddrV4, buf: &[u8]) -> io::Result<()>;

    /// Non-blocking receive of one datagram into `buf`. Returns the datagram length and
    ///  the sender address, or `Ok(None)` if nothing is pending.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>>;

    fn local_addr(&self) -> io::Result<SocketAddrV4>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, to: SocketAddrV4, buf: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {}", buf.len(), to);

        let sent = UdpSocket::send_to(self, buf, SocketAddr::V4(to)).await?;
        if sent < buf.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram send"));
        }
        Ok(())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
        match UdpSocket::try_recv_from(self, buf) {
            Ok((len, SocketAddr::V4(from))) => Ok(Some((len, from))),
            // the sockets are bound to IPv4 addresses, so a V6 sender cannot occur
            Ok((_, SocketAddr::V6(from))) => {
                trace!("dropping datagram from IPv6 sender {}", from);
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddrV4> {
        match UdpSocket::local_addr(self)? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "socket is not bound to an IPv4 address")),
        }
    }
}

/// Starts up the OS networking subsystem. A no-op on this platform, provided for
///  call-site symmetry with platforms that need explicit startup. Idempotent.
pub fn init_sockets() -> bool {
    true
}

/// Counterpart of [`init_sockets`]. A no-op on this platform. Idempotent.
pub fn uninit_sockets() {}
