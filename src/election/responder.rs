use crate::record::{HaState, Vote};
use crate::transport::{InboundVote, OutboundMessage, PeerTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs for the lifetime of an established generation. Looking peers keep
/// broadcasting until someone answers; we answer with the vote this node
/// concluded on, which is what lets a joiner converge without disturbing the
/// running regime.
pub(crate) async fn run_vote_responder(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    mut votes: mpsc::UnboundedReceiver<InboundVote>,
    decided: Vote,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = votes.recv() => match maybe {
                Some(inbound) => inbound,
                None => return,
            }
        };
        if inbound.from == transport.my_sid() {
            continue;
        }
        if inbound.vote.precondition != decided.precondition {
            slog::warn!(
                logger,
                "Dropping vote from a mismatched cluster shape";
                "from" => inbound.from.into_inner(),
            );
            continue;
        }
        if inbound.vote.ha_state == HaState::Looking {
            slog::debug!(
                logger,
                "Answering looking peer with the decided vote";
                "to" => inbound.from.into_inner(),
            );
            transport.send_to(inbound.from, OutboundMessage::Vote(decided.clone()));
        }
    }
}
