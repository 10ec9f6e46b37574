use crate::election::state::{ElectionDecision, ElectionState, LookingAction};
use crate::record::{HaState, Precondition};
use crate::transport::{InboundVote, OutboundMessage, PeerTransport};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) enum RoundOutcome {
    Decided(ElectionDecision),
    Cancelled,
}

/// Runs one Fast Leader Election round to a decision.
///
/// Polls the vote queue with a doubling timeout. On every timeout the node
/// either rebroadcasts its vote (all peers reachable and drained, so the
/// silence means lost interest, not lost packets) or wakes the dialers of the
/// peers it has no link to. Quorum never concludes the round on the spot: the
/// queue is drained for one more poll-floor beat first, and any queued vote
/// that would still beat the proposal reopens the exchange.
pub(crate) async fn look_for_leader(
    logger: &slog::Logger,
    transport: &dyn PeerTransport,
    state: &mut ElectionState,
    votes: &mut mpsc::UnboundedReceiver<InboundVote>,
    offset: i64,
    peer_epoch: i64,
    precondition: Precondition,
    poll_floor: Duration,
    poll_cap: Duration,
    cancel: &CancellationToken,
) -> RoundOutcome {
    state.begin_round(offset, peer_epoch);
    slog::info!(
        logger,
        "Entering leader election";
        "elect_epoch" => state.elect_epoch(),
        "offset" => offset,
        "peer_epoch" => peer_epoch,
    );
    transport.broadcast(OutboundMessage::Vote(state.self_vote(precondition.clone())));

    let mut poll = poll_floor;
    let mut pending: Option<InboundVote> = None;
    loop {
        let inbound = match pending.take() {
            Some(inbound) => Some(inbound),
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return RoundOutcome::Cancelled,
                    polled = tokio::time::timeout(poll, votes.recv()) => match polled {
                        Ok(Some(inbound)) => Some(inbound),
                        Ok(None) => return RoundOutcome::Cancelled,
                        Err(_) => None,
                    }
                }
            }
        };

        let InboundVote { from, vote } = match inbound {
            Some(inbound) => inbound,
            None => {
                // Poll timed out with no votes.
                let unlinked: Vec<_> = transport
                    .member_sids()
                    .into_iter()
                    .filter(|sid| !transport.has_live_connection(*sid))
                    .collect();
                if unlinked.is_empty()
                    && transport.member_sids().iter().all(|sid| transport.delivery_idle(*sid))
                {
                    slog::debug!(logger, "Vote poll idle, rebroadcasting");
                    transport.broadcast(OutboundMessage::Vote(state.self_vote(precondition.clone())));
                } else {
                    for sid in unlinked {
                        transport.nudge_dialer(sid);
                    }
                }
                poll = std::cmp::min(poll * 2, poll_cap);
                continue;
            }
        };

        if vote.precondition != precondition {
            slog::warn!(
                logger,
                "Dropping vote from a mismatched cluster shape";
                "from" => from.into_inner(),
            );
            continue;
        }

        match vote.ha_state {
            HaState::Looking => {
                match state.handle_looking(from, &vote) {
                    LookingAction::Stale => {
                        slog::debug!(
                            logger,
                            "Dropping stale-round vote";
                            "from" => from.into_inner(),
                            "their_epoch" => vote.elect_epoch,
                            "our_epoch" => state.elect_epoch(),
                        );
                        continue;
                    }
                    LookingAction::Adopted => {
                        transport.broadcast(OutboundMessage::Vote(state.self_vote(precondition.clone())));
                    }
                    LookingAction::Recorded => {}
                }

                let member_count = transport.member_sids().len();
                if !state.proposal_has_quorum(member_count) {
                    continue;
                }
                // Settle window.
                loop {
                    match tokio::time::timeout(poll_floor, votes.recv()).await {
                        Ok(Some(queued)) => {
                            if queued.vote.precondition != precondition {
                                continue;
                            }
                            if queued.vote.ha_state == HaState::Looking && state.would_supersede(&queued.vote) {
                                pending = Some(queued);
                                break;
                            }
                        }
                        Ok(None) => return RoundOutcome::Cancelled,
                        Err(_) => break,
                    }
                }
                if pending.is_none() {
                    let decision = state.finalize();
                    slog::info!(
                        logger,
                        "Election decided: leader={} state={:?} elect_epoch={}",
                        decision.leader,
                        decision.ha_state,
                        decision.elect_epoch,
                    );
                    return RoundOutcome::Decided(decision);
                }
            }
            HaState::Leading | HaState::Learning => {
                let member_count = transport.member_sids().len();
                if let Some(decision) = state.handle_established(from, &vote, member_count) {
                    slog::info!(
                        logger,
                        "Joined established regime: leader={} elect_epoch={}",
                        decision.leader,
                        decision.elect_epoch,
                    );
                    return RoundOutcome::Decided(decision);
                }
            }
        }
    }
}
