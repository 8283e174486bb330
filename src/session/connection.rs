use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::AmesError;
use crate::packet::fragment::{split_message, Fragment, Reassembly};
use crate::packet::poke::Poke;
use crate::packet::shut::{encode_shut_packet, Ack, ShutPacket};
use crate::session::peer::PeerInfo;
use crate::session::SessionContext;
use crate::ship::Ship;

/// Message numbers on a connection start here
pub const FIRST_MESSAGE_NUM: u64 = 1;

/// Inbound messages are buffered only this far beyond the oldest undelivered one. This bounds
///  both partial reassemblies and the record of out-of-order deliveries.
pub const MAX_MESSAGES_AHEAD: u64 = 1024;

/// A fragment that was sent but not acknowledged yet, together with the message it belongs to
#[derive(Clone, Debug)]
pub struct PendingFragment {
    /// encoded wire bytes, re-sent verbatim
    pub raw: Bytes,
    pub poke: Arc<Poke>,
}

/// What became of an inbound data fragment
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// stored, the message is not complete yet
    Partial,
    /// this fragment was received before
    Duplicate,
    /// the whole message was delivered before
    AlreadyDelivered,
    Complete(Poke),
    /// the fragments were complete but did not decode to a poke
    Malformed(String),
}

struct ConnectionInner {
    next_num: u64,
    /// message number -> fragment index -> fragment
    pending: BTreeMap<u64, BTreeMap<u32, PendingFragment>>,

    reassembly: BTreeMap<u64, Reassembly>,
    /// all message numbers below this were delivered
    delivered_below: u64,
    /// delivered message numbers above the contiguous range
    delivered_ahead: BTreeSet<u64>,
}

impl ConnectionInner {
    fn is_delivered(&self, num: u64) -> bool {
        num < self.delivered_below || self.delivered_ahead.contains(&num)
    }

    fn mark_delivered(&mut self, num: u64) {
        if num != self.delivered_below {
            self.delivered_ahead.insert(num);
            return;
        }
        self.delivered_below += 1;
        while self.delivered_ahead.remove(&self.delivered_below) {
            self.delivered_below += 1;
        }
    }
}

/// A logical message flow with a peer, identified by its bone. Sending and acknowledging are
///  serialized by a per-connection lock, so message numbers are assigned in send order.
pub struct Connection {
    bone: u64,
    peer: Arc<PeerInfo>,
    ctx: Arc<SessionContext>,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub fn new(bone: u64, peer: Arc<PeerInfo>, ctx: Arc<SessionContext>) -> Connection {
        Connection {
            bone,
            peer,
            ctx,
            inner: Mutex::new(ConnectionInner {
                next_num: FIRST_MESSAGE_NUM,
                pending: BTreeMap::default(),
                reassembly: BTreeMap::default(),
                delivered_below: FIRST_MESSAGE_NUM,
                delivered_ahead: BTreeSet::default(),
            }),
        }
    }

    pub fn bone(&self) -> u64 {
        self.bone
    }

    pub fn peer(&self) -> Ship {
        self.peer.ship
    }

    pub async fn next_num(&self) -> u64 {
        self.inner.lock().await.next_num
    }

    fn encode_message(&self, num: u64, poke: &Poke) -> anyhow::Result<Vec<(u32, Bytes)>> {
        split_message(num, &poke.to_noun())?
            .iter()
            .map(|fragment| -> anyhow::Result<(u32, Bytes)> {
                let raw = self.encode_shut(&ShutPacket::from_fragment(self.bone, fragment))?;
                Ok((fragment.index, raw))
            })
            .collect()
    }

    fn encode_shut(&self, shut: &ShutPacket) -> anyhow::Result<Bytes> {
        let packet = encode_shut_packet(
            shut,
            &self.peer.symmetric_key,
            self.ctx.ship,
            self.peer.ship,
            self.ctx.life,
            self.peer.life,
            self.ctx.crypto.as_ref(),
        )?;
        Ok(Bytes::from(packet.encode()))
    }

    /// Encodes a message with the current message number without recording it for retry and
    ///  without advancing the number. This is for fire-and-forget traffic like announcements.
    pub async fn create_message(&self, poke: &Poke) -> anyhow::Result<Vec<Bytes>> {
        let inner = self.inner.lock().await;
        Ok(self.encode_message(inner.next_num, poke)?
            .into_iter()
            .map(|(_, raw)| raw)
            .collect())
    }

    pub async fn send_raw(&self, raw: &[u8]) -> anyhow::Result<()> {
        self.ctx.send_pipeline.send_packet(self.peer.lane(), raw).await
    }

    /// Sends a poke as the next message on this connection. Every fragment is recorded in the
    ///  pending pool before it is sent, so fragments that fail to go out are picked up by
    ///  retries. Returns the message number.
    pub async fn request(&self, poke: Poke) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let num = inner.next_num;
        let fragments = self.encode_message(num, &poke)?;
        debug!(peer = %self.peer.ship, bone = self.bone, num, num_fragments = fragments.len(), "sending message");

        let poke = Arc::new(poke);
        let mut send_result = Ok(());
        for (index, raw) in fragments {
            inner.pending.entry(num)
                .or_default()
                .insert(index, PendingFragment { raw: raw.clone(), poke: poke.clone() });

            if let Err(e) = self.send_raw(&raw).await {
                if send_result.is_ok() {
                    send_result = Err(e);
                }
            }
        }
        inner.next_num += 1;

        send_result.map(|_| num)
    }

    /// Removes acknowledged fragments from the pending pool. A message ack clears the whole
    ///  message. Returns `false` if there was nothing to remove.
    pub async fn on_ack(&self, num: u64, ack: &Ack) -> bool {
        let mut inner = self.inner.lock().await;
        match ack {
            Ack::Message { ok, lag } => {
                trace!(bone = self.bone, num, ok, lag, "message ack");
                inner.pending.remove(&num).is_some()
            }
            Ack::Fragment(index) => {
                trace!(bone = self.bone, num, index, "fragment ack");
                let Some(fragments) = inner.pending.get_mut(&num) else {
                    return false;
                };
                let removed = fragments.remove(index).is_some();
                if fragments.is_empty() {
                    inner.pending.remove(&num);
                }
                removed
            }
        }
    }

    /// Wire bytes of all pending fragments, ordered by message number and fragment index
    pub async fn pending_packets(&self) -> Vec<Bytes> {
        self.inner.lock().await
            .pending
            .values()
            .flat_map(|fragments| fragments.values())
            .map(|f| f.raw.clone())
            .collect()
    }

    pub async fn pending_messages(&self) -> Vec<(u64, Arc<Poke>)> {
        self.inner.lock().await
            .pending
            .iter()
            .filter_map(|(num, fragments)| fragments.values().next().map(|f| (*num, f.poke.clone())))
            .collect()
    }

    /// Re-sends every pending fragment, stopping at the first failure. Returns the number of
    ///  packets sent.
    pub async fn resend_pending(&self) -> anyhow::Result<usize> {
        let packets = self.pending_packets().await;
        for raw in &packets {
            self.send_raw(raw).await?;
        }
        if !packets.is_empty() {
            trace!(peer = %self.peer.ship, bone = self.bone, "re-sent {} pending packets", packets.len());
        }
        Ok(packets.len())
    }

    /// Adds an inbound fragment to its message. Fragments of a message must arrive in index
    ///  order; a fragment from beyond the next expected index is an error and is not stored,
    ///  and so is a fragment of a message more than [MAX_MESSAGES_AHEAD] past the oldest
    ///  undelivered one. The sender re-sends both later.
    pub async fn on_fragment(&self, fragment: Fragment) -> anyhow::Result<Inbound> {
        let mut inner = self.inner.lock().await;
        let num = fragment.num;

        if inner.is_delivered(num) {
            return Ok(Inbound::AlreadyDelivered);
        }
        let limit = inner.delivered_below.saturating_add(MAX_MESSAGES_AHEAD);
        if num >= limit {
            return Err(AmesError::MessageTooFarAhead { num, limit }.into());
        }

        let reassembly = inner.reassembly.entry(num)
            .or_insert_with(|| Reassembly::new(fragment.count));
        if !reassembly.push(fragment)? {
            return Ok(Inbound::Duplicate);
        }
        if !reassembly.is_complete() {
            return Ok(Inbound::Partial);
        }

        let joined = reassembly.join();
        inner.reassembly.remove(&num);
        inner.mark_delivered(num);

        match joined.and_then(|noun| Poke::from_noun(&noun)) {
            Ok(poke) => Ok(Inbound::Complete(poke)),
            Err(e) => Ok(Inbound::Malformed(e.to_string())),
        }
    }

    /// Sends an ack for an inbound message on this connection's bone. Acks are not pooled.
    pub async fn send_ack(&self, num: u64, ack: Ack) -> anyhow::Result<()> {
        let raw = self.encode_shut(&ShutPacket::ack(self.bone, num, ack))?;
        self.send_raw(&raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::UrCrypto;
    use crate::noun::Noun;
    use crate::packet::shut::{decode_shut_packet, Meat};
    use crate::packet::wire::Packet;
    use crate::test_util::{test_context, test_peer_info, RecordingSocket, PEER, RELAY, SELF_LIFE};
    use num_bigint::BigUint;
    use rstest::rstest;
    use std::net::SocketAddr;

    fn connection(socket: &Arc<RecordingSocket>) -> Connection {
        Connection::new(1, Arc::new(test_peer_info()), test_context(socket.clone()))
    }

    /// decodes a sent packet the way the peer sees it
    fn decode_sent(raw: &[u8]) -> ShutPacket {
        let packet = Packet::decode(raw).unwrap();
        assert_eq!(packet.rcvr, PEER);
        let peer = test_peer_info();
        decode_shut_packet(&packet, &peer.symmetric_key, SELF_LIFE, peer.life, &UrCrypto).unwrap()
    }

    fn small_poke() -> Poke {
        Poke::new(&["ge", "hood"], "helm-hi", Noun::cord("ping"))
    }

    fn big_poke() -> Poke {
        Poke::new(&["a"], "b", Noun::Atom(BigUint::from(1u8) << 20000u32))
    }

    #[tokio::test]
    async fn test_request_sends_and_pools() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);

        assert_eq!(connection.request(small_poke()).await.unwrap(), 1);
        assert_eq!(connection.request(small_poke()).await.unwrap(), 2);
        assert_eq!(connection.next_num().await, 3);

        let sent = socket.sent_packets();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(to, _)| *to == RELAY));

        let first = decode_sent(&sent[0].1);
        assert_eq!((first.bone, first.num), (1, 1));
        let second = decode_sent(&sent[1].1);
        assert_eq!((second.bone, second.num), (1, 2));

        assert_eq!(connection.pending_packets().await, vec![Bytes::from(sent[0].1.clone()), Bytes::from(sent[1].1.clone())]);
    }

    #[tokio::test]
    async fn test_request_fragments() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);

        connection.request(big_poke()).await.unwrap();

        let shuts = socket.sent_packets().iter()
            .map(|(_, raw)| decode_sent(raw))
            .collect::<Vec<_>>();
        assert_eq!(shuts.len(), 3);
        for (i, shut) in shuts.iter().enumerate() {
            match &shut.meat {
                Meat::Fragment { count, index, .. } => {
                    assert_eq!(*count, 3);
                    assert_eq!(*index, i as u32);
                }
                other => panic!("unexpected meat {:?}", other),
            }
        }
        assert_eq!(connection.pending_messages().await.len(), 1);
        assert_eq!(connection.pending_messages().await[0].1.as_ref(), &big_poke());
    }

    #[tokio::test]
    async fn test_request_uses_known_lane() {
        let socket = Arc::new(RecordingSocket::default());
        let peer = Arc::new(test_peer_info());
        let lane = SocketAddr::from(([10, 0, 0, 7], 4000));
        peer.set_lane(lane);

        let connection = Connection::new(5, peer, test_context(socket.clone()));
        connection.request(small_poke()).await.unwrap();
        assert_eq!(socket.sent_packets()[0].0, lane);
    }

    #[tokio::test]
    async fn test_create_message_is_not_pooled() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);

        let packets = connection.create_message(&small_poke()).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(decode_sent(&packets[0]).num, 1);

        assert!(socket.sent_packets().is_empty());
        assert!(connection.pending_packets().await.is_empty());
        assert_eq!(connection.next_num().await, 1);
    }

    #[rstest]
    #[case::message_ack(Ack::Message { ok: true, lag: 0 }, 0)]
    #[case::message_nack(Ack::Message { ok: false, lag: 0 }, 0)]
    #[case::fragment_ack(Ack::Fragment(1), 2)]
    #[case::unknown_fragment(Ack::Fragment(7), 3)]
    #[tokio::test]
    async fn test_on_ack(#[case] ack: Ack, #[case] expected_pending: usize) {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);
        connection.request(big_poke()).await.unwrap();

        let removed = connection.on_ack(1, &ack).await;
        assert_eq!(removed, expected_pending < 3);
        assert_eq!(connection.pending_packets().await.len(), expected_pending);
    }

    #[tokio::test]
    async fn test_fragment_acks_clear_message() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);
        connection.request(big_poke()).await.unwrap();

        for index in 0..3 {
            assert!(connection.on_ack(1, &Ack::Fragment(index)).await);
        }
        assert!(connection.pending_messages().await.is_empty());
        assert!(!connection.on_ack(1, &Ack::Message { ok: true, lag: 0 }).await);
    }

    #[tokio::test]
    async fn test_resend_pending() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);
        connection.request(small_poke()).await.unwrap();
        connection.request(small_poke()).await.unwrap();
        connection.on_ack(1, &Ack::Message { ok: true, lag: 0 }).await;
        let original = socket.sent_packets();
        socket.clear();

        assert_eq!(connection.resend_pending().await.unwrap(), 1);
        assert_eq!(socket.sent_packets(), vec![original[1].clone()]);
    }

    #[tokio::test]
    async fn test_failed_send_stays_pending() {
        use crate::error::AmesError;
        use crate::transport::MockSendSocket;

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .returning(|_, _| Err(AmesError::Socket("network down".to_string()).into()));
        socket.expect_local_addr()
            .return_const(SocketAddr::from(([127, 0, 0, 1], 9999)));

        let connection = Connection::new(1, Arc::new(test_peer_info()), test_context(Arc::new(socket)));
        assert!(connection.request(small_poke()).await.is_err());
        assert_eq!(connection.pending_packets().await.len(), 1);
        assert_eq!(connection.next_num().await, 2);
    }

    fn fragments_of(num: u64, poke: &Poke) -> Vec<Fragment> {
        split_message(num, &poke.to_noun()).unwrap()
    }

    #[tokio::test]
    async fn test_inbound_single_fragment() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);

        let fragment = fragments_of(1, &small_poke()).remove(0);
        assert_eq!(connection.on_fragment(fragment.clone()).await.unwrap(), Inbound::Complete(small_poke()));
        assert_eq!(connection.on_fragment(fragment).await.unwrap(), Inbound::AlreadyDelivered);
    }

    #[tokio::test]
    async fn test_inbound_reassembly() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);
        let fragments = fragments_of(1, &big_poke());

        assert_eq!(connection.on_fragment(fragments[0].clone()).await.unwrap(), Inbound::Partial);
        assert_eq!(connection.on_fragment(fragments[0].clone()).await.unwrap(), Inbound::Duplicate);
        assert!(connection.on_fragment(fragments[2].clone()).await.is_err());
        assert_eq!(connection.on_fragment(fragments[1].clone()).await.unwrap(), Inbound::Partial);
        assert_eq!(connection.on_fragment(fragments[2].clone()).await.unwrap(), Inbound::Complete(big_poke()));
    }

    #[tokio::test]
    async fn test_inbound_messages_out_of_order() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);

        for num in [3, 1, 2] {
            let fragment = fragments_of(num, &small_poke()).remove(0);
            assert_eq!(connection.on_fragment(fragment).await.unwrap(), Inbound::Complete(small_poke()));
        }
        for num in [1, 2, 3] {
            let fragment = fragments_of(num, &small_poke()).remove(0);
            assert_eq!(connection.on_fragment(fragment).await.unwrap(), Inbound::AlreadyDelivered);
        }
    }

    #[tokio::test]
    async fn test_inbound_window() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);
        let limit = FIRST_MESSAGE_NUM + MAX_MESSAGES_AHEAD;

        let too_far = fragments_of(limit, &small_poke()).remove(0);
        let err = connection.on_fragment(too_far.clone()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<AmesError>(), Some(&AmesError::MessageTooFarAhead { num: limit, limit }));

        let last_in_window = fragments_of(limit - 1, &small_poke()).remove(0);
        assert_eq!(connection.on_fragment(last_in_window).await.unwrap(), Inbound::Complete(small_poke()));

        // delivering the oldest message moves the window
        let first = fragments_of(FIRST_MESSAGE_NUM, &small_poke()).remove(0);
        assert_eq!(connection.on_fragment(first).await.unwrap(), Inbound::Complete(small_poke()));
        assert_eq!(connection.on_fragment(too_far).await.unwrap(), Inbound::Complete(small_poke()));
    }

    #[tokio::test]
    async fn test_inbound_malformed() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);

        let fragment = split_message(1, &Noun::from(5u64)).unwrap().remove(0);
        assert!(matches!(connection.on_fragment(fragment).await.unwrap(), Inbound::Malformed(_)));
    }

    #[tokio::test]
    async fn test_send_ack() {
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(&socket);

        connection.send_ack(4, Ack::Message { ok: true, lag: 0 }).await.unwrap();
        let shut = decode_sent(&socket.sent_packets()[0].1);
        assert_eq!(shut, ShutPacket::ack(1, 4, Ack::Message { ok: true, lag: 0 }));
        assert!(connection.pending_packets().await.is_empty());
    }
}
