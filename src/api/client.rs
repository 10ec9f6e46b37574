use crate::api::event_bus::RoleListener;
use crate::api::types::{HaClusterView, HaLeaderInfo, HaNodeInfo};
use crate::record::{Allocation, BlockHeader, Checkpoint, Sid};
use crate::runtime::{HaContext, RoleSnapshot};
use crate::store::StoreError;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

const STORE_POISON: &str = "block store lock poison";

#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    #[error("not the leader, send writes to sid {}", .0.sid)]
    LeaderRedirect(HaLeaderInfo),

    // Can be retried with backoff; an election is likely in progress.
    #[error("no leader elected yet")]
    NoLeader,

    #[error("failed to append: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum KickOutError {
    #[error("only the leader can kick a node out")]
    NotLeader,
    #[error("sid {0} is not in the routing tables")]
    UnknownNode(i32),
    #[error("a node cannot kick itself out")]
    CannotKickSelf,
}

/// Handle to one node's HA stack. Dropping the client tears the whole stack
/// down: the driver, the background tasks, and every peer connection.
pub struct HaClient {
    context: Arc<HaContext>,
    role_rx: watch::Receiver<RoleSnapshot>,
    _shutdown: DropGuard,
}

impl HaClient {
    pub(crate) fn new(
        context: Arc<HaContext>,
        role_rx: watch::Receiver<RoleSnapshot>,
        shutdown: CancellationToken,
    ) -> Self {
        HaClient {
            context,
            role_rx,
            _shutdown: shutdown.drop_guard(),
        }
    }

    /// Records that ids for `key` have been handed out up to `upto` and
    /// replicates the record. Leader-only: a learner answers with where to
    /// send the write instead, and a looking node asks the caller to retry.
    pub fn allocate(&self, key: &str, upto: i64) -> Result<Checkpoint, AllocateError> {
        match &*self.role_rx.borrow() {
            RoleSnapshot::Leading { .. } => {}
            RoleSnapshot::Learning { leader, .. } => {
                return Err(AllocateError::LeaderRedirect(HaLeaderInfo::from(leader)));
            }
            RoleSnapshot::Looking => return Err(AllocateError::NoLeader),
        }
        let allocation = Allocation {
            key: key.to_string(),
            upto,
            ts_ms: Utc::now().timestamp_millis(),
        };
        let checkpoint = {
            let mut store = self.context.store.write().expect(STORE_POISON);
            store.add_component(&allocation)?
        };
        self.context.write_ping.notify_one();
        Ok(checkpoint)
    }

    pub fn role_listener(&self) -> RoleListener {
        RoleListener::new(self.role_rx.clone())
    }

    /// The cluster as gossip currently sees it.
    pub fn cluster_view(&self) -> HaClusterView {
        let (leader, addrs) = self.context.collect.snapshot();
        HaClusterView {
            leader_sid: leader.map(|sid| sid.into_inner()),
            nodes: addrs.into_iter().map(HaNodeInfo::from).collect(),
        }
    }

    pub fn block_headers(&self) -> Vec<BlockHeader> {
        self.context.store.read().expect(STORE_POISON).block_header_list()
    }

    pub fn logic_offset(&self) -> i64 {
        self.context.store.read().expect(STORE_POISON).logic_offset()
    }

    /// Administratively removes a node from the routing tables. Leader-only.
    /// The removal propagates to learners through gossip and lands in their
    /// configs through write-back; after the grace period the entry is gone.
    pub fn kick_out(&self, sid: i32) -> Result<(), KickOutError> {
        match &*self.role_rx.borrow() {
            RoleSnapshot::Leading { .. } => {}
            _ => return Err(KickOutError::NotLeader),
        }
        let sid = Sid::new(sid);
        if sid == self.context.my_sid {
            return Err(KickOutError::CannotKickSelf);
        }
        if self.context.collect.kick_out(sid, Utc::now()) {
            Ok(())
        } else {
            Err(KickOutError::UnknownNode(sid.into_inner()))
        }
    }
}
