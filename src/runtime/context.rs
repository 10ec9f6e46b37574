use crate::api::HaOptionsValidated;
use crate::gossip::CollectService;
use crate::record::{Member, MemberProfile, Precondition, Sid};
use crate::runtime::liveness::LivenessTracker;
use crate::store::SharedBlockStore;
use crate::transport::ConnectionManager;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch, Notify};

const MEMBERS_POISON: &str = "HaContext.members lock poison";

/// Where this node stands in the current regime. Published on a watch
/// channel for the client surface.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RoleSnapshot {
    Looking,
    Leading { elect_epoch: i64 },
    Learning { leader: Member, elect_epoch: i64 },
}

/// Everything one node's HA tasks share. Constructed once at client creation
/// and handed around as an Arc; generations come and go, the context stays.
pub(crate) struct HaContext {
    pub logger: slog::Logger,
    pub my_sid: Sid,
    /// Live member config, sorted by sid. Swapped by the write-back task
    /// when gossip detects drift.
    pub members: Arc<RwLock<Vec<MemberProfile>>>,
    pub block_file_size: u32,
    pub max_sync_payload: u32,
    pub options: HaOptionsValidated,
    pub store: SharedBlockStore,
    pub transport: Arc<ConnectionManager>,
    pub collect: Arc<CollectService>,
    pub liveness: Arc<LivenessTracker>,
    pub role_tx: watch::Sender<RoleSnapshot>,
    /// Pinged on every leader-side append so the leader syncer pushes fresh
    /// data without waiting for announce traffic.
    pub write_ping: Arc<Notify>,
    pub drift_tx: mpsc::UnboundedSender<Vec<MemberProfile>>,
}

impl HaContext {
    /// The cluster-shape fingerprint votes and gossip are gated on.
    pub(crate) fn precondition(&self) -> Precondition {
        let members = self.members.read().expect(MEMBERS_POISON);
        let mut list: Vec<Member> = members.iter().map(|p| p.member.clone()).collect();
        list.sort_by_key(|m| m.sid);
        Precondition {
            members: list,
            block_file_size: self.block_file_size,
            max_sync_payload: self.max_sync_payload,
        }
    }

    pub(crate) fn member_sids(&self) -> Vec<Sid> {
        self.members
            .read()
            .expect(MEMBERS_POISON)
            .iter()
            .map(|p| p.member.sid)
            .collect()
    }

    pub(crate) fn member(&self, sid: Sid) -> Option<Member> {
        self.members
            .read()
            .expect(MEMBERS_POISON)
            .iter()
            .find(|p| p.member.sid == sid)
            .map(|p| p.member.clone())
    }

    /// Own profile from the live config. The write-back task refuses lists
    /// that drop this node, so the entry is always present.
    pub(crate) fn my_profile(&self) -> MemberProfile {
        self.members
            .read()
            .expect(MEMBERS_POISON)
            .iter()
            .find(|p| p.member.sid == self.my_sid)
            .cloned()
            .expect("own sid absent from the member list")
    }
}
