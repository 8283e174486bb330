use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::ship::Ship;

/// What the retry task does when re-sending a pending packet fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryFailurePolicy {
    /// log the failure and keep retrying on the next tick
    Continue,
    /// terminate the retry task, returning the error from its join handle
    Stop,
}

#[derive(Debug, Clone)]
pub struct AmesConfig {
    /// Local address of the UDP socket. The default binds an arbitrary port on all IPv4
    ///  interfaces.
    pub bind_addr: SocketAddr,

    /// All packets to peers without a known direct address are sent here, typically to a
    ///  galaxy that forwards them.
    pub relay_addr: SocketAddr,

    /// The ship whose response marks the transport as connected during start-up
    pub bootstrap_ship: Ship,

    /// Pending fragments are re-sent at this fixed interval until they are acknowledged. There is
    ///  no backoff and no retry limit.
    pub retry_interval: Duration,
    pub retry_failure_policy: RetryFailurePolicy,

    /// interval for re-sending the hello message to the bootstrap ship
    pub keepalive_interval: Duration,

    /// Delay before contacting the bootstrap ship, giving the network time to process a breach.
    ///  Applies whether or not a breach was sent.
    pub bootstrap_settle_delay: Duration,
    /// how often start-up checks whether the bootstrap ship responded
    pub connect_poll_interval: Duration,
    /// Start-up fails if the bootstrap ship does not respond within this time. `None` waits
    ///  forever.
    pub connect_timeout: Option<Duration>,

    /// Announce a reset of the local ship's message state to its parent before connecting. This
    ///  avoids bone and message number conflicts with state the parent kept from a previous run.
    pub breach_parent: bool,

    /// acknowledge inbound fragments and messages
    pub ack_inbound: bool,

    /// size of the buffer for receiving a single datagram
    pub max_datagram_size: usize,
}

impl AmesConfig {
    pub fn new(relay_addr: SocketAddr) -> AmesConfig {
        AmesConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            relay_addr,
            bootstrap_ship: Ship::ZOD,
            retry_interval: Duration::from_secs(10),
            retry_failure_policy: RetryFailurePolicy::Continue,
            keepalive_interval: Duration::from_secs(25),
            bootstrap_settle_delay: Duration::from_secs(5),
            connect_poll_interval: Duration::from_secs(1),
            connect_timeout: None,
            breach_parent: true,
            ack_inbound: true,
            max_datagram_size: 4096 * 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_interval.is_zero() {
            bail!("retry interval must be positive");
        }
        if self.keepalive_interval.is_zero() {
            bail!("keepalive interval must be positive");
        }
        if self.connect_poll_interval.is_zero() {
            bail!("connect poll interval must be positive");
        }
        if self.max_datagram_size < 1500 {
            bail!("datagram buffer of {} bytes is too small", self.max_datagram_size);
        }
        Ok(())
    }
}

/// Where to look up peers' public keys
#[derive(Debug, Clone)]
pub struct KeyDirectoryConfig {
    /// HTTP URL of an Ethereum node's JSON-RPC endpoint
    pub rpc_url: String,
    /// address of the Azimuth contract
    pub contract: String,
}

impl Default for KeyDirectoryConfig {
    fn default() -> Self {
        KeyDirectoryConfig {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            contract: "0x223c067f8cf28ae173ee5cafea60ca44c335fecb".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> AmesConfig {
        AmesConfig::new(SocketAddr::from(([127, 0, 0, 1], 13337)))
    }

    #[test]
    fn test_defaults_are_valid() {
        config().validate().unwrap();
    }

    #[rstest]
    #[case::retry(AmesConfig { retry_interval: Duration::ZERO, ..config() })]
    #[case::keepalive(AmesConfig { keepalive_interval: Duration::ZERO, ..config() })]
    #[case::poll(AmesConfig { connect_poll_interval: Duration::ZERO, ..config() })]
    #[case::buffer(AmesConfig { max_datagram_size: 100, ..config() })]
    fn test_invalid(#[case] config: AmesConfig) {
        assert!(config.validate().is_err());
    }
}
