use crate::record::{Collect, Database, Member, Sid, Vote};
use crate::runtime::LivenessTracker;
use crate::transport::api::{
    InboundCollect, InboundDatabase, InboundQueues, InboundVote, OutboundMessage, PeerTransport,
};
use crate::transport::connection::spawn_connection;
use crate::transport::dial;
use crate::transport::frame::{FrameDecoder, HaMessage, MessageKind};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const LINKS_POISON: &str = "ConnectionManager.links mutex guard poison";
const MEMBERS_POISON: &str = "ConnectionManager.members lock guard poison";
const DIALERS_POISON: &str = "ConnectionManager.dialers mutex guard poison";
const QUEUES_POISON: &str = "ConnectionManager.queues mutex guard poison";
const WEAK_SELF_POISON: &str = "ConnectionManager.weak_self mutex guard poison";

#[derive(Clone)]
pub(crate) struct TransportTuning {
    pub outbound_queue_capacity: usize,
    pub write_stall_cap: Duration,
    pub dial_retry_floor: Duration,
    pub dial_retry_cap: Duration,
    pub handshake_timeout: Duration,
}

/// One live peer link. `dialer_sid` is the rank the link competes with during
/// arbitration: the sid of whichever side dialed it.
struct Link {
    conn_id: u64,
    dialer_sid: Sid,
    outbound: mpsc::Sender<Bytes>,
    canceller: CancellationToken,
}

struct DialerHandle {
    nudge: Arc<Notify>,
    canceller: CancellationToken,
}

/// Owns every peer link and the per-peer dialer tasks.
///
/// At most one link per peer is live at any moment. When a second link for the
/// same peer shows up, the one whose dialer has the higher sid is kept; ties
/// (a redial of the same direction) keep the newest. Together with the accept
/// side refusing lower-sid dialers, both ends of a crossed dial converge on
/// the same surviving link.
pub(crate) struct ConnectionManager {
    logger: slog::Logger,
    my_sid: Sid,
    tuning: TransportTuning,
    shutdown: CancellationToken,
    liveness: Arc<LivenessTracker>,
    members: RwLock<Vec<Member>>,
    links: Mutex<HashMap<Sid, Link>>,
    dialers: Mutex<HashMap<Sid, DialerHandle>>,
    queues: Mutex<Option<InboundQueues>>,
    next_conn_id: AtomicU64,
    weak_self: Mutex<Weak<ConnectionManager>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        logger: slog::Logger,
        my_sid: Sid,
        members: Vec<Member>,
        liveness: Arc<LivenessTracker>,
        tuning: TransportTuning,
        shutdown: CancellationToken,
    ) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager {
            logger,
            my_sid,
            tuning,
            shutdown,
            liveness,
            members: RwLock::new(members),
            links: Mutex::new(HashMap::new()),
            dialers: Mutex::new(HashMap::new()),
            queues: Mutex::new(None),
            next_conn_id: AtomicU64::new(0),
            weak_self: Mutex::new(Weak::new()),
        });
        *manager.weak_self.lock().expect(WEAK_SELF_POISON) = Arc::downgrade(&manager);
        manager
    }

    /// Starts the accept loop on the bound listener and a dialer per peer.
    pub(crate) fn start(self: &Arc<Self>, listener: TcpListener) {
        tokio::task::spawn(dial::run_acceptor(
            self.logger.new(slog::o!("Task" => "Acceptor")),
            self.clone(),
            listener,
            self.shutdown.clone(),
        ));
        let peers: Vec<Sid> = self
            .member_sids()
            .into_iter()
            .filter(|sid| *sid != self.my_sid)
            .collect();
        for peer in peers {
            self.spawn_dialer(peer);
        }
    }

    /// Swaps in a fresh generation's inbound queues. Traffic already routed to
    /// the previous generation's queues is dropped by the closed receivers.
    pub(crate) fn install_queues(&self, queues: InboundQueues) {
        *self.queues.lock().expect(QUEUES_POISON) = Some(queues);
    }

    /// Decodes a framed message and routes it onto the inbound queues. A
    /// payload that does not decode is a protocol error and faults the
    /// connection.
    pub(crate) fn dispatch(&self, msg: HaMessage) -> Result<(), crate::record::CodecError> {
        self.liveness.poke(msg.sid);
        let queues = self.queues.lock().expect(QUEUES_POISON);
        let queues = match queues.as_ref() {
            Some(queues) => queues,
            None => {
                slog::debug!(self.logger, "No inbound queues installed yet, dropping message");
                return Ok(());
            }
        };
        match msg.kind {
            MessageKind::Identity => {}
            MessageKind::Vote => {
                let vote = Vote::decode(msg.payload)?;
                let _ = queues.votes.send(InboundVote { from: msg.sid, vote });
            }
            MessageKind::Database => {
                let database = Database::decode(msg.payload)?;
                let _ = queues.databases.send(InboundDatabase {
                    from: msg.sid,
                    database,
                    raw: msg.raw,
                });
            }
            MessageKind::Collect => {
                let collect = Collect::decode(msg.payload)?;
                let _ = queues.collects.send(InboundCollect { from: msg.sid, collect });
            }
        }
        Ok(())
    }

    /// Registers a link we dialed. Rank is our own sid.
    pub(crate) fn register_dialed(self: &Arc<Self>, peer_sid: Sid, stream: TcpStream, decoder: FrameDecoder) {
        self.register_link(peer_sid, self.my_sid, stream, decoder);
    }

    /// Registers a link a peer dialed into us. Rank is the peer's sid. The
    /// accept loop has already refused peers ranked below us.
    pub(crate) fn register_accepted(self: &Arc<Self>, peer_sid: Sid, stream: TcpStream, decoder: FrameDecoder) {
        self.register_link(peer_sid, peer_sid, stream, decoder);
    }

    fn register_link(self: &Arc<Self>, peer_sid: Sid, dialer_sid: Sid, stream: TcpStream, decoder: FrameDecoder) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.tuning.outbound_queue_capacity);
        let canceller = self.shutdown.child_token();
        {
            let mut links = self.links.lock().expect(LINKS_POISON);
            if let Some(existing) = links.get(&peer_sid) {
                if existing.dialer_sid > dialer_sid {
                    slog::info!(
                        self.logger,
                        "Dropping new link, existing one outranks it";
                        "peer" => peer_sid.into_inner(),
                        "existing_rank" => existing.dialer_sid.into_inner(),
                        "new_rank" => dialer_sid.into_inner(),
                    );
                    return;
                }
                slog::info!(
                    self.logger,
                    "Replacing link";
                    "peer" => peer_sid.into_inner(),
                    "existing_rank" => existing.dialer_sid.into_inner(),
                    "new_rank" => dialer_sid.into_inner(),
                );
                existing.canceller.cancel();
            }
            links.insert(
                peer_sid,
                Link {
                    conn_id,
                    dialer_sid,
                    outbound: outbound_tx,
                    canceller: canceller.clone(),
                },
            );
        }
        slog::info!(
            self.logger,
            "Registered link";
            "peer" => peer_sid.into_inner(),
            "rank" => dialer_sid.into_inner(),
        );
        let conn_logger = self
            .logger
            .new(slog::o!("Peer" => peer_sid.into_inner(), "ConnId" => conn_id));
        spawn_connection(
            conn_logger,
            self.clone(),
            peer_sid,
            conn_id,
            stream,
            decoder,
            outbound_rx,
            canceller,
            self.tuning.write_stall_cap,
        );
    }

    /// Removes the link, but only if it is still the registered one. A link
    /// replaced during arbitration must not evict its successor.
    pub(crate) fn deregister(&self, peer_sid: Sid, conn_id: u64) {
        let removed = {
            let mut links = self.links.lock().expect(LINKS_POISON);
            match links.get(&peer_sid) {
                Some(link) if link.conn_id == conn_id => {
                    links.remove(&peer_sid);
                    true
                }
                _ => false,
            }
        };
        if removed {
            // Wake the dialer so a replacement dial happens promptly.
            self.nudge_dialer(peer_sid);
        }
    }

    pub(crate) fn is_member(&self, sid: Sid) -> bool {
        self.members
            .read()
            .expect(MEMBERS_POISON)
            .iter()
            .any(|m| m.sid == sid)
    }

    pub(crate) fn member_addr(&self, sid: Sid) -> Option<SocketAddrV4> {
        self.members
            .read()
            .expect(MEMBERS_POISON)
            .iter()
            .find(|m| m.sid == sid)
            .map(|m| SocketAddrV4::new(m.ip, m.ha_port))
    }

    fn spawn_dialer(self: &Arc<Self>, peer_sid: Sid) {
        let nudge = Arc::new(Notify::new());
        let canceller = self.shutdown.child_token();
        let replaced = self.dialers.lock().expect(DIALERS_POISON).insert(
            peer_sid,
            DialerHandle {
                nudge: nudge.clone(),
                canceller: canceller.clone(),
            },
        );
        if let Some(old) = replaced {
            old.canceller.cancel();
        }
        tokio::task::spawn(dial::run_dialer(
            self.logger.new(slog::o!("Task" => "Dialer", "Peer" => peer_sid.into_inner())),
            self.clone(),
            peer_sid,
            nudge,
            canceller,
        ));
    }

    fn drop_peer(&self, peer_sid: Sid) {
        if let Some(link) = self.links.lock().expect(LINKS_POISON).remove(&peer_sid) {
            link.canceller.cancel();
        }
        if let Some(dialer) = self.dialers.lock().expect(DIALERS_POISON).remove(&peer_sid) {
            dialer.canceller.cancel();
        }
    }

    fn fault_link(&self, peer_sid: Sid) {
        if let Some(link) = self.links.lock().expect(LINKS_POISON).remove(&peer_sid) {
            link.canceller.cancel();
        }
        self.nudge_dialer(peer_sid);
    }

    fn loopback(&self, msg: OutboundMessage) {
        let queues = self.queues.lock().expect(QUEUES_POISON);
        let queues = match queues.as_ref() {
            Some(queues) => queues,
            None => return,
        };
        match msg {
            OutboundMessage::Vote(vote) => {
                let _ = queues.votes.send(InboundVote {
                    from: self.my_sid,
                    vote,
                });
            }
            OutboundMessage::Database(database, raw) => {
                let _ = queues.databases.send(InboundDatabase {
                    from: self.my_sid,
                    database,
                    raw,
                });
            }
            OutboundMessage::Collect(collect) => {
                let _ = queues.collects.send(InboundCollect {
                    from: self.my_sid,
                    collect,
                });
            }
        }
    }

    pub(crate) fn tuning(&self) -> &TransportTuning {
        &self.tuning
    }
}

impl PeerTransport for ConnectionManager {
    fn my_sid(&self) -> Sid {
        self.my_sid
    }

    fn member_sids(&self) -> Vec<Sid> {
        self.members
            .read()
            .expect(MEMBERS_POISON)
            .iter()
            .map(|m| m.sid)
            .collect()
    }

    fn send_to(&self, to: Sid, msg: OutboundMessage) {
        if to == self.my_sid {
            self.loopback(msg);
            return;
        }
        let encoded = match msg.encode(self.my_sid) {
            Ok(encoded) => encoded,
            Err(e) => {
                slog::error!(self.logger, "Dropping unencodable message: {:?}", e);
                return;
            }
        };
        let outbound = self
            .links
            .lock()
            .expect(LINKS_POISON)
            .get(&to)
            .map(|link| link.outbound.clone());
        match outbound {
            Some(tx) => match tx.try_send(encoded) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    slog::warn!(
                        self.logger,
                        "Outbound queue full, dropping message";
                        "to" => to.into_inner(),
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    slog::debug!(
                        self.logger,
                        "Link tearing down, dropped message";
                        "to" => to.into_inner(),
                    );
                }
            },
            None => {
                slog::debug!(self.logger, "No link, dropped message"; "to" => to.into_inner());
            }
        }
    }

    fn delivery_idle(&self, sid: Sid) -> bool {
        if sid == self.my_sid {
            return true;
        }
        self.links
            .lock()
            .expect(LINKS_POISON)
            .get(&sid)
            .map(|link| link.outbound.capacity() == link.outbound.max_capacity())
            .unwrap_or(false)
    }

    fn has_live_connection(&self, sid: Sid) -> bool {
        if sid == self.my_sid {
            return true;
        }
        self.links.lock().expect(LINKS_POISON).contains_key(&sid)
    }

    fn nudge_dialer(&self, sid: Sid) {
        if let Some(dialer) = self.dialers.lock().expect(DIALERS_POISON).get(&sid) {
            dialer.nudge.notify_one();
        }
    }

    fn update_members(&self, members: Vec<Member>) {
        let previous = {
            let mut guard = self.members.write().expect(MEMBERS_POISON);
            std::mem::replace(&mut *guard, members.clone())
        };

        for old in &previous {
            if old.sid == self.my_sid {
                continue;
            }
            match members.iter().find(|m| m.sid == old.sid) {
                None => {
                    slog::info!(self.logger, "Member removed, dropping its link"; "peer" => old.sid.into_inner());
                    self.drop_peer(old.sid);
                }
                Some(new) if new.ip != old.ip || new.ha_port != old.ha_port => {
                    slog::info!(self.logger, "Member address changed, re-dialing"; "peer" => old.sid.into_inner());
                    self.fault_link(old.sid);
                }
                Some(_) => {}
            }
        }

        let myself = match self.weak_self.lock().expect(WEAK_SELF_POISON).upgrade() {
            Some(myself) => myself,
            None => return,
        };
        for new in &members {
            if new.sid == self.my_sid {
                continue;
            }
            if !previous.iter().any(|m| m.sid == new.sid) {
                slog::info!(self.logger, "Member added, starting a dialer"; "peer" => new.sid.into_inner());
                myself.spawn_dialer(new.sid);
            }
        }
    }
}
