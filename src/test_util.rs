use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::crypto::{SymmetricKey, UrCrypto};
use crate::session::peer::PeerInfo;
use crate::session::SessionContext;
use crate::ship::{Life, Ship};
use crate::transport::{SendPipeline, SendSocket};

/// Wire bytes of a `helm-hi` poke with payload "ping", sent as message 5 on bone 1 from
///  `0x10100` (life 1) to `0x7e71_0001_0100` (life 2), encrypted with symmetric key `[31]`
pub const GOLDEN_PACKET: [u8; 69] = [
    128, 28, 112, 182, 33, 0, 1, 1, 0, 0, 1, 1, 0, 113, 126, 0, 0, 251, 177, 66, 74, 134, 147, 242,
    188, 119, 57, 37, 27, 132, 153, 69, 253, 34, 0, 174, 98, 110, 181, 25, 144, 121, 192, 44, 232,
    136, 22, 223, 146, 232, 23, 9, 200, 94, 235, 235, 169, 110, 64, 44, 233, 30, 17, 20, 94, 212, 254,
    76, 106,
];

/// encrypted content of [GOLDEN_PACKET]
pub const GOLDEN_CONTENT: &str = "70270754126257173429024868609132679736029986866333602336505787903207239222796713666732498636112461130219095130694309422215675";

pub const SELF: Ship = Ship(0x10100);
pub const SELF_LIFE: Life = 1;
pub const SELF_SEED: [u8; 32] = [42; 32];

pub const PEER: Ship = Ship(0x7e71_0001_0100);
pub const PEER_LIFE: Life = 2;
pub const PEER_SEED: [u8; 32] = [43; 32];
/// the symmetric key shared by [SELF] and [PEER] in [GOLDEN_PACKET]
pub const PEER_SYMMETRIC_KEY: [u8; 1] = [31];

pub const RELAY: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::new(127, 0, 0, 1), 13337));

pub fn test_context(socket: Arc<dyn SendSocket>) -> Arc<SessionContext> {
    Arc::new(SessionContext {
        ship: SELF,
        life: SELF_LIFE,
        crypto: Arc::new(UrCrypto),
        send_pipeline: SendPipeline::new(socket, RELAY),
    })
}

pub fn test_peer_info() -> PeerInfo {
    PeerInfo::new(PEER, PEER_LIFE, SymmetricKey::new(PEER_SYMMETRIC_KEY.to_vec()))
}

/// A [SendSocket] that records everything sent through it
#[derive(Default)]
pub struct RecordingSocket {
    pub sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSocket {
    pub fn sent_packets(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SendSocket for RecordingSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((to, packet_buf.to_vec()));
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9999))
    }
}
