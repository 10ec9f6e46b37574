use crate::gossip::CollectService;
use crate::record::{Collect, CollectKind, MemberProfile, NodeAddr, NodeBlock, NodeState, Sid};
use crate::store::SharedBlockStore;
use crate::transport::{InboundCollect, OutboundMessage, PeerTransport};
use chrono::Utc;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const STORE_POISON: &str = "block store lock poison";
const MEMBERS_POISON: &str = "configured members lock poison";

/// Learner side of the gossip exchange. Requests the leader's view right
/// away and then every interval, adopts whatever comes back (solicited or
/// not), and flags the write-back task when the adopted view disagrees with
/// the local config. A request that went unanswered with no live link to the
/// leader nudges the dialer before the next try.
pub(crate) async fn run_collect_learner(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    collect: Arc<CollectService>,
    store: SharedBlockStore,
    me: MemberProfile,
    leader: Sid,
    interval: Duration,
    configured: Arc<RwLock<Vec<MemberProfile>>>,
    drift_tx: mpsc::UnboundedSender<Vec<MemberProfile>>,
    mut collects: mpsc::UnboundedReceiver<InboundCollect>,
    cancel: CancellationToken,
) {
    slog::info!(logger, "Collect requester running"; "leader" => leader.into_inner());
    let mut awaiting = false;
    let mut next_request = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = collects.recv() => match maybe {
                None => return,
                Some(inbound) => {
                    if inbound.collect.kind != CollectKind::Response {
                        slog::debug!(logger, "Ignoring a stray collect request"; "from" => inbound.from.into_inner());
                        continue;
                    }
                    if inbound.from != leader || inbound.collect.leader != leader {
                        slog::debug!(
                            logger,
                            "View from outside the regime, ignoring";
                            "from" => inbound.from.into_inner(),
                            "claimed" => inbound.collect.leader.into_inner(),
                        );
                        continue;
                    }
                    awaiting = false;
                    collect.adopt_view(&inbound.collect);
                    let local = configured.read().expect(MEMBERS_POISON).clone();
                    if let Some(corrected) = collect.config_drift(&local) {
                        slog::info!(
                            logger,
                            "Adopted view disagrees with local config, scheduling a write back";
                            "members" => corrected.len(),
                        );
                        let _ = drift_tx.send(corrected);
                    }
                }
            },
            _ = tokio::time::sleep_until(next_request) => {
                if awaiting && !transport.has_live_connection(leader) {
                    transport.nudge_dialer(leader);
                }
                transport.send_to(leader, OutboundMessage::Collect(own_report(&store, &me, leader)));
                awaiting = true;
                next_request = Instant::now() + interval;
            }
        }
    }
}

/// The learner's side of a collect exchange: its own address and weight plus
/// its current block snapshot.
fn own_report(store: &SharedBlockStore, me: &MemberProfile, leader: Sid) -> Collect {
    let headers = store.read().expect(STORE_POISON).block_header_list();
    Collect {
        kind: CollectKind::Request,
        leader,
        addrs: vec![NodeAddr {
            member: me.member.clone(),
            weight: me.weight,
            state: NodeState::Normal,
            last_update: Utc::now(),
        }],
        blocks: vec![NodeBlock {
            sid: me.member.sid,
            headers,
        }],
    }
}
