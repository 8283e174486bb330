//! Per-peer session state: symmetric keys, connections identified by bones, the pool of
//!  unacknowledged fragments and inbound reassembly.

pub mod connection;
pub mod peer;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::crypto::CryptoProvider;
use crate::packet::poke::Poke;
use crate::ship::{Life, Ship};
use crate::transport::SendPipeline;
use connection::Connection;

/// What every session needs to know about the local ship and how to reach the network
pub struct SessionContext {
    pub ship: Ship,
    pub life: Life,
    pub crypto: Arc<dyn CryptoProvider>,
    pub send_pipeline: SendPipeline,
}

/// Application callback for completely received pokes. It is called on the receive task, so
///  implementations should hand off long-running work.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PokeHandler: Send + Sync + 'static {
    async fn on_poke(&self, connection: Arc<Connection>, num: u64, poke: Poke);
}
