use crate::gossip::CollectService;
use crate::record::CollectKind;
use crate::store::SharedBlockStore;
use crate::transport::{InboundCollect, OutboundMessage, PeerTransport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const STORE_POISON: &str = "block store lock poison";

/// Leader side of the gossip exchange: every learner request is folded into
/// the tables, silence and pending removals are swept, and the full view goes
/// back to the sender.
pub(crate) async fn run_collect_leader(
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    collect: Arc<CollectService>,
    store: SharedBlockStore,
    silence_threshold: Duration,
    kicked_out_grace: Duration,
    mut collects: mpsc::UnboundedReceiver<InboundCollect>,
    cancel: CancellationToken,
) {
    let my_sid = transport.my_sid();
    slog::info!(logger, "Collect responder running");
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = collects.recv() => match maybe {
                None => return,
                Some(inbound) => inbound,
            },
        };
        if inbound.collect.kind != CollectKind::Request {
            slog::debug!(logger, "Ignoring a stray collect response"; "from" => inbound.from.into_inner());
            continue;
        }
        if inbound.collect.leader != my_sid {
            // The sender follows another regime; recording the request below
            // demotes us and adopts the claimed leader.
            slog::info!(
                logger,
                "Collect request claims a different leader";
                "from" => inbound.from.into_inner(),
                "claimed" => inbound.collect.leader.into_inner(),
            );
        }

        let now = Utc::now();
        collect.record_request(&inbound.collect, now);
        for sid in collect.expire_silent(now, silence_threshold) {
            slog::warn!(logger, "Learner went silent, marking it lost"; "peer" => sid.into_inner());
        }
        for sid in collect.purge_kicked_out(now, kicked_out_grace) {
            slog::info!(logger, "Dropped a kicked out node past its grace period"; "peer" => sid.into_inner());
        }

        let headers = store.read().expect(STORE_POISON).block_header_list();
        collect.refresh_blocks(my_sid, headers);
        match collect.full_view() {
            Some(view) => transport.send_to(inbound.from, OutboundMessage::Collect(view)),
            None => slog::warn!(logger, "No view to answer with"; "from" => inbound.from.into_inner()),
        }
    }
}
