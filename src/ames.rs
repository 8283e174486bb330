use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, timeout, Instant};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::{AmesConfig, RetryFailurePolicy};
use crate::crypto::CryptoProvider;
use crate::directory::KeyDirectory;
use crate::noun::Noun;
use crate::packet::poke::Poke;
use crate::packet::shut::{decode_shut_packet, Ack, Meat, ShutPacket};
use crate::packet::wire::{addr_from_lane, Packet};
use crate::seed::Identity;
use crate::session::connection::{Connection, Inbound};
use crate::session::peer::{Peer, PeerRegistry};
use crate::session::{PokeHandler, SessionContext};
use crate::ship::Ship;
use crate::transport::{SendPipeline, SendSocket};

/// path of the agent that handles hello and breach announcements
const HOOD_PATH: [&str; 2] = ["ge", "hood"];
const HELLO_MARK: &str = "helm-hi";
const HELLO_TEXT: &str = "urbit-rs";
const BREACH_MARK: &str = "helm-moon-breach";

/// Handles of the background tasks spawned by [Ames::spawn_loops] and [Ames::start]
pub struct AmesTasks {
    pub receive: JoinHandle<()>,
    pub retry: JoinHandle<anyhow::Result<()>>,
    pub keepalive: Option<JoinHandle<()>>,
}

/// Ames is where all other parts of the protocol come together: It listens on a UdpSocket,
///  decrypts incoming packets and dispatches them to their connections, re-sends unacknowledged
///  fragments and has an API for application code to open connections and send pokes.
pub struct Ames {
    config: Arc<AmesConfig>,
    identity: Identity,
    ctx: Arc<SessionContext>,
    registry: PeerRegistry,
    receive_socket: Arc<UdpSocket>,
    handler: Arc<dyn PokeHandler>,
    connected: AtomicBool,
    cancel_sender: broadcast::Sender<()>,
}

impl Ames {
    pub async fn new(
        config: AmesConfig,
        identity: Identity,
        directory: Arc<dyn KeyDirectory>,
        crypto: Arc<dyn CryptoProvider>,
        handler: Arc<dyn PokeHandler>,
    ) -> anyhow::Result<Arc<Ames>> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("bound socket to {:?}", receive_socket.as_ref().local_addr()?);

        let send_socket: Arc<dyn SendSocket> = Arc::new(receive_socket.clone());
        Ok(Self::with_sockets(config, identity, directory, crypto, handler, receive_socket, send_socket))
    }

    /// Assembles an instance around existing sockets, e.g. a send socket that records traffic
    pub fn with_sockets(
        config: AmesConfig,
        identity: Identity,
        directory: Arc<dyn KeyDirectory>,
        crypto: Arc<dyn CryptoProvider>,
        handler: Arc<dyn PokeHandler>,
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
    ) -> Arc<Ames> {
        let ctx = Arc::new(SessionContext {
            ship: identity.ship,
            life: identity.life,
            crypto,
            send_pipeline: SendPipeline::new(send_socket, config.relay_addr),
        });
        let registry = PeerRegistry::new(ctx.clone(), identity.encryption_seed, directory);
        let (cancel_sender, _) = broadcast::channel(1);

        Arc::new(Ames {
            config: Arc::new(config),
            identity,
            ctx,
            registry,
            receive_socket,
            handler,
            connected: AtomicBool::new(false),
            cancel_sender,
        })
    }

    /// Creates an instance, spawns its background tasks and runs the bootstrap sequence. This
    ///  returns once the bootstrap ship responded, or fails if it does not respond within the
    ///  configured timeout.
    pub async fn start(
        config: AmesConfig,
        identity: Identity,
        directory: Arc<dyn KeyDirectory>,
        crypto: Arc<dyn CryptoProvider>,
        handler: Arc<dyn PokeHandler>,
    ) -> anyhow::Result<(Arc<Ames>, AmesTasks)> {
        let ames = Ames::new(config, identity, directory, crypto, handler).await?;
        let mut tasks = ames.spawn_loops();

        match ames.bootstrap().await {
            Ok(keepalive) => tasks.keepalive = Some(keepalive),
            Err(e) => return Err(ames.abort_start(e)),
        }
        if let Err(e) = ames.wait_connected().await {
            return Err(ames.abort_start(e));
        }
        Ok((ames, tasks))
    }

    fn abort_start(&self, e: anyhow::Error) -> anyhow::Error {
        error!("bootstrap failed: {}", e);
        self.shutdown();
        e
    }

    pub fn ship(&self) -> Ship {
        self.identity.ship
    }

    pub fn self_addr(&self) -> SocketAddr {
        SendSocket::local_addr(&self.receive_socket)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn get_peer(&self, ship: Ship) -> anyhow::Result<Arc<Peer>> {
        self.registry.get_peer(ship).await
    }

    /// Opens a new connection to a ship on a freshly allocated bone
    pub async fn connect(&self, ship: Ship) -> anyhow::Result<Arc<Connection>> {
        Ok(self.get_peer(ship).await?.connect().await)
    }

    pub async fn get_connection(&self, ship: Ship, bone: u64) -> anyhow::Result<Arc<Connection>> {
        Ok(self.get_peer(ship).await?.get_connection(bone).await)
    }

    /// Stops all background tasks
    pub fn shutdown(&self) {
        if self.cancel_sender.send(()).is_err() {
            debug!("no running tasks to cancel");
        }
    }

    pub fn spawn_loops(self: &Arc<Self>) -> AmesTasks {
        AmesTasks {
            receive: tokio::spawn(self.clone().recv_loop(self.cancel_sender.subscribe())),
            retry: tokio::spawn(self.clone().retry_loop(self.cancel_sender.subscribe())),
            keepalive: None,
        }
    }

    async fn recv_loop(self: Arc<Self>, mut cancel_receiver: broadcast::Receiver<()>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let (num_read, from) = tokio::select! {
                r = self.receive_socket.recv_from(&mut buf) => match r {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                },
                _ = cancel_receiver.recv() => break,
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);

            if let Err(e) = self.handle_packet(&buf[..num_read], from).instrument(span).await {
                debug!("dropping packet from {:?}: {}", from, e);
            }
        }
        info!("receive loop stopped");
    }

    /// Processes a single received datagram. Errors affect only this packet.
    pub async fn handle_packet(&self, buf: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        trace!("received {} bytes from {:?}", buf.len(), from);

        let packet = Packet::decode(buf)?;
        if packet.rcvr != self.identity.ship {
            debug!(rcvr = %packet.rcvr, "packet is addressed to a different ship - dropping");
            return Ok(());
        }

        let peer = self.registry.get_peer(packet.sndr).await?;
        let shut = decode_shut_packet(
            &packet,
            &peer.info().symmetric_key,
            peer.info().life,
            self.identity.life,
            self.ctx.crypto.as_ref(),
        )?;
        trace!(sndr = %packet.sndr, bone = shut.bone, num = shut.num, "decrypted packet");

        match packet.origin {
            Some(origin) => trace!("packet was relayed from {:?}", addr_from_lane(origin)),
            None => {
                peer.info().set_lane(from);
            }
        }

        if packet.sndr == self.config.bootstrap_ship && !self.connected.swap(true, Ordering::AcqRel) {
            info!(bootstrap_ship = %packet.sndr, "connected");
        }

        match &shut.meat {
            Meat::Ack(ack) => {
                self.on_ack(&peer, &shut, ack).await;
                Ok(())
            }
            Meat::Fragment { .. } => self.on_data(&peer, &shut).await,
        }
    }

    async fn on_ack(&self, peer: &Peer, shut: &ShutPacket, ack: &Ack) {
        let connection = match peer.find_connection(shut.bone ^ 1).await {
            Some(c) => Some(c),
            None => peer.find_connection(shut.bone).await,
        };
        let Some(connection) = connection else {
            debug!(peer = %peer.ship(), bone = shut.bone, "ack for unknown connection - dropping");
            return;
        };

        if !connection.on_ack(shut.num, ack).await {
            trace!(peer = %peer.ship(), bone = connection.bone(), num = shut.num, "ack for nothing pending");
        }
    }

    async fn on_data(&self, peer: &Peer, shut: &ShutPacket) -> anyhow::Result<()> {
        let Some(fragment) = shut.fragment() else {
            return Ok(());
        };
        let index = fragment.index;

        let connection = peer.get_connection(shut.bone ^ 1).await;
        let ack = match connection.on_fragment(fragment).await? {
            Inbound::Partial | Inbound::Duplicate => Ack::Fragment(index),
            Inbound::AlreadyDelivered => Ack::Message { ok: true, lag: 0 },
            Inbound::Complete(poke) => {
                debug!(peer = %peer.ship(), bone = connection.bone(), num = shut.num, mark = %poke.mark, "received poke");
                self.handler.on_poke(connection.clone(), shut.num, poke).await;
                Ack::Message { ok: true, lag: 0 }
            }
            Inbound::Malformed(reason) => {
                warn!(peer = %peer.ship(), num = shut.num, "received a message that is not a poke: {}", reason);
                Ack::Message { ok: false, lag: 0 }
            }
        };

        if self.config.ack_inbound {
            connection.send_ack(shut.num, ack).await?;
        }
        Ok(())
    }

    async fn retry_loop(self: Arc<Self>, mut cancel_receiver: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!("starting retry loop");

        let period = self.config.retry_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.retry_pending().await {
                        match self.config.retry_failure_policy {
                            RetryFailurePolicy::Continue => {
                                warn!("error re-sending pending packets, retrying on next tick: {}", e);
                            }
                            RetryFailurePolicy::Stop => {
                                error!("error re-sending pending packets, stopping retries: {}", e);
                                return Err(e);
                            }
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
        info!("retry loop stopped");
        Ok(())
    }

    /// Re-sends all pending fragments of all connections. A failing connection does not keep
    ///  the others from being retried; the first error is returned after the pass.
    pub async fn retry_pending(&self) -> anyhow::Result<usize> {
        let mut num_sent = 0;
        let mut first_error = None;

        for peer in self.registry.peers().await {
            for connection in peer.connections().await {
                match connection.resend_pending().await {
                    Ok(n) => num_sent += n,
                    Err(e) => {
                        debug!(peer = %peer.ship(), bone = connection.bone(), "retry failed: {}", e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(num_sent),
        }
    }

    /// Breaches the parent if this ship is a moon, waits for the network to settle, then greets
    ///  the bootstrap ship and spawns the task that keeps greeting it. The returned handle belongs to that task.
    pub async fn bootstrap(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let ship = self.identity.ship;
        if self.config.breach_parent && (5..=8).contains(&ship.byte_len()) {
            let parent = ship.parent();
            info!(%parent, "announcing breach to parent");

            let connection = self.connect(parent).await?;
            let breach = Poke::new(&HOOD_PATH, BREACH_MARK, ship.to_noun());
            for raw in connection.create_message(&breach).await? {
                connection.send_raw(&raw).await?;
            }
        }
        sleep(self.config.bootstrap_settle_delay).await;

        let bootstrap_ship = self.config.bootstrap_ship;
        info!(%bootstrap_ship, "sending hello");
        let connection = self.connect(bootstrap_ship).await?;
        let hello = Poke::new(&HOOD_PATH, HELLO_MARK, Noun::cord(HELLO_TEXT));
        let packets = connection.create_message(&hello).await?;
        for raw in &packets {
            connection.send_raw(raw).await?;
        }

        Ok(tokio::spawn(Self::keepalive_loop(
            connection,
            packets,
            self.config.keepalive_interval,
            self.cancel_sender.subscribe(),
        )))
    }

    async fn keepalive_loop(connection: Arc<Connection>, packets: Vec<Bytes>, period: Duration, mut cancel_receiver: broadcast::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    trace!(peer = %connection.peer(), "sending keepalive");
                    for raw in &packets {
                        if let Err(e) = connection.send_raw(raw).await {
                            warn!(peer = %connection.peer(), "error sending keepalive: {}", e);
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
    }

    /// Polls until a packet from the bootstrap ship arrived
    pub async fn wait_connected(&self) -> anyhow::Result<()> {
        let poll = async {
            let mut ticker = interval(self.config.connect_poll_interval);
            while !self.is_connected() {
                ticker.tick().await;
            }
        };

        match self.config.connect_timeout {
            None => {
                poll.await;
                Ok(())
            }
            Some(max) => timeout(max, poll).await
                .map_err(|_| anyhow!("{} did not respond within {:?}", self.config.bootstrap_ship, max)),
        }
    }
}
