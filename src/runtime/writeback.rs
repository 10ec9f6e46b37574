use crate::api::HaMemberInfo;
use crate::record::{MemberProfile, Sid};
use crate::transport::PeerTransport;
use async_trait::async_trait;
use std::error::Error;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MEMBERS_POISON: &str = "HaContext.members lock poison";

/// Persists corrected member lists when gossip finds the local config stale.
/// Implemented by the embedder; typically rewrites whatever file or registry
/// the member list was loaded from.
#[async_trait]
pub trait ConfigWriteback: Send + Sync {
    async fn persist_members(
        &self,
        members: &[HaMemberInfo],
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Runtime-lifetime task. Wakes on drift signals from the learner gossip
/// task, persists the corrected list, swaps the live config, and reconnects
/// the dialers. Persistence failure skips the swap so config and disk never
/// disagree; gossip will flag the drift again.
pub(crate) async fn run_config_writeback(
    logger: slog::Logger,
    my_sid: Sid,
    members: Arc<RwLock<Vec<MemberProfile>>>,
    transport: Arc<dyn PeerTransport>,
    writeback: Option<Arc<dyn ConfigWriteback>>,
    mut drift_rx: mpsc::UnboundedReceiver<Vec<MemberProfile>>,
    cancel: CancellationToken,
) {
    loop {
        let mut corrected = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = drift_rx.recv() => match maybe {
                None => return,
                Some(corrected) => corrected,
            },
        };
        // Collapse a burst of drift signals into the newest one.
        while let Ok(newer) = drift_rx.try_recv() {
            corrected = newer;
        }
        if corrected.iter().all(|p| p.member.sid != my_sid) {
            slog::warn!(logger, "Corrected member list drops this node, refusing to apply it");
            continue;
        }
        if let Some(writeback) = &writeback {
            let external: Vec<HaMemberInfo> =
                corrected.iter().cloned().map(HaMemberInfo::from).collect();
            if let Err(e) = writeback.persist_members(&external).await {
                slog::warn!(
                    logger,
                    "Failed to persist the corrected member list, keeping the old one: {}",
                    e,
                );
                continue;
            }
        }
        let mut sorted = corrected;
        sorted.sort_by_key(|p| p.member.sid);
        let count = sorted.len();
        *members.write().expect(MEMBERS_POISON) = sorted.clone();
        transport.update_members(sorted.iter().map(|p| p.member.clone()).collect());
        slog::info!(logger, "Applied the corrected member list"; "members" => count);
    }
}
