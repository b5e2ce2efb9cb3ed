use std::time::Duration;

use anyhow::bail;

/// How often a connection's driver wakes up to check its keep-alive and timeout
///  clocks when no datagrams are arriving.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Handshake retries after the first attempt before giving up on a peer.
pub const HANDSHAKE_RETRIES: usize = 5;

/// How long the connect initiator waits for a HandshakeAck before retrying.
pub const HANDSHAKE_ATTEMPT_INTERVAL: Duration = Duration::from_secs(1);

/// Per-connection configuration. The defaults disable both clocks, matching a
///  session that is driven entirely by application traffic; most applications
///  will want to set both.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// An outbound KeepAlive is emitted when this much time has passed since the last
    ///  outbound reliable or keep-alive packet. `None` disables keep-alives.
    pub keep_alive_interval: Option<Duration>,

    /// The session is declared dead when no inbound datagram of any kind has arrived
    ///  within this window. `None` disables the timeout - the session then lives until
    ///  an explicit disconnect.
    pub timeout: Option<Duration>,

    /// Granularity of the driver's clock checks. The timers fire up to one tick late.
    pub tick_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            keep_alive_interval: None,
            timeout: None,
            tick_interval: TICK_INTERVAL,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.keep_alive_interval.is_some_and(|d| d.is_zero()) {
            bail!("keep-alive interval must be positive - use None to disable");
        }
        if self.timeout.is_some_and(|d| d.is_zero()) {
            bail!("timeout must be positive - use None to disable");
        }
        Ok(())
    }
}
