use crate::record::{Collect, Database, Member, Sid, Vote};
use crate::transport::frame::{encode_frame, FrameError, HaMessage, MessageKind};
use bytes::Bytes;
use tokio::sync::mpsc;

/// A typed message bound for a peer. Raw log bytes accompany database records
/// outside the record payload.
#[derive(Clone, Debug)]
pub(crate) enum OutboundMessage {
    Vote(Vote),
    Database(Database, Bytes),
    Collect(Collect),
}

impl OutboundMessage {
    pub(crate) fn encode(&self, from: Sid) -> Result<Bytes, FrameError> {
        let (kind, payload, raw) = match self {
            OutboundMessage::Vote(vote) => (MessageKind::Vote, vote.encode(), Bytes::new()),
            OutboundMessage::Database(database, raw) => (MessageKind::Database, database.encode(), raw.clone()),
            OutboundMessage::Collect(collect) => (MessageKind::Collect, collect.encode(), Bytes::new()),
        };
        encode_frame(&HaMessage {
            kind,
            sid: from,
            payload,
            raw,
        })
    }
}

#[derive(Debug)]
pub(crate) struct InboundVote {
    pub from: Sid,
    pub vote: Vote,
}

#[derive(Debug)]
pub(crate) struct InboundDatabase {
    pub from: Sid,
    pub database: Database,
    pub raw: Bytes,
}

#[derive(Debug)]
pub(crate) struct InboundCollect {
    pub from: Sid,
    pub collect: Collect,
}

/// One HA generation's inbound funnels. The runtime installs a fresh set after
/// every election so a new generation never consumes a dead one's traffic.
pub(crate) struct InboundQueues {
    pub votes: mpsc::UnboundedSender<InboundVote>,
    pub databases: mpsc::UnboundedSender<InboundDatabase>,
    pub collects: mpsc::UnboundedSender<InboundCollect>,
}

pub(crate) struct InboundReceivers {
    pub votes: mpsc::UnboundedReceiver<InboundVote>,
    pub databases: mpsc::UnboundedReceiver<InboundDatabase>,
    pub collects: mpsc::UnboundedReceiver<InboundCollect>,
}

impl InboundQueues {
    pub(crate) fn new() -> (InboundQueues, InboundReceivers) {
        let (votes_tx, votes_rx) = mpsc::unbounded_channel();
        let (databases_tx, databases_rx) = mpsc::unbounded_channel();
        let (collects_tx, collects_rx) = mpsc::unbounded_channel();
        let queues = InboundQueues {
            votes: votes_tx,
            databases: databases_tx,
            collects: collects_tx,
        };
        let receivers = InboundReceivers {
            votes: votes_rx,
            databases: databases_rx,
            collects: collects_rx,
        };
        (queues, receivers)
    }
}

/// The slice of the connection manager the protocol tasks lean on. Split out
/// as a trait so election, replication and gossip can be driven against a
/// recording fake in tests.
pub(crate) trait PeerTransport: Send + Sync + 'static {
    fn my_sid(&self) -> Sid;

    /// Sids of all configured members, self included.
    fn member_sids(&self) -> Vec<Sid>;

    /// Best-effort delivery. Sending to self routes straight onto the inbound
    /// queues without touching the wire.
    fn send_to(&self, to: Sid, msg: OutboundMessage);

    /// True iff a live link to the peer exists and its outbound queue is
    /// drained. A liveness tunable for retransmit decisions, never a
    /// correctness signal.
    fn delivery_idle(&self, sid: Sid) -> bool;

    fn has_live_connection(&self, sid: Sid) -> bool;

    /// Wakes the background dialer for the peer.
    fn nudge_dialer(&self, sid: Sid);

    /// Live-swaps the dial targets after a config write-back.
    fn update_members(&self, members: Vec<Member>);

    fn broadcast(&self, msg: OutboundMessage) {
        for sid in self.member_sids() {
            self.send_to(sid, msg.clone());
        }
    }
}
