use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::error::AmesError;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        match self.send_to(packet_buf, to).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                Err(AmesError::Socket(e.to_string()).into())
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Routes encoded packets either to a peer's known direct address or to the relay
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    relay_addr: SocketAddr,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, relay_addr: SocketAddr) -> SendPipeline {
        SendPipeline { socket, relay_addr }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub async fn send_packet(&self, lane: Option<SocketAddr>, packet_buf: &[u8]) -> anyhow::Result<()> {
        let to = lane.unwrap_or(self.relay_addr);
        self.socket.do_send_packet(to, packet_buf).await
    }
}
