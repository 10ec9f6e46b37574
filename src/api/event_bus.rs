use crate::api::types::HaLeaderInfo;
use crate::runtime::RoleSnapshot;
use tokio::sync::watch;

/// A role transition as observed by the local node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoleEvent {
    /// An election is in progress; writes are rejected.
    Looking,
    /// This node accepts writes.
    Leading,
    /// This node replicates from the given leader.
    Learning(HaLeaderInfo),
}

/// Streams role transitions to the application. Consuming this is subtle: it
/// doesn't queue intermediate transitions. If the role flips several times
/// between polls, those are clobbered into only the most recent one.
pub struct RoleListener {
    role_rx: watch::Receiver<RoleSnapshot>,
}

impl RoleListener {
    pub(crate) fn new(role_rx: watch::Receiver<RoleSnapshot>) -> Self {
        RoleListener { role_rx }
    }

    /// Waits for the next role transition. None once the runtime has shut down.
    pub async fn next(&mut self) -> Option<RoleEvent> {
        match self.role_rx.changed().await {
            Ok(()) => Some(RoleEvent::from(&*self.role_rx.borrow())),
            Err(_) => None,
        }
    }

    /// The role right now, without waiting.
    pub fn current(&self) -> RoleEvent {
        RoleEvent::from(&*self.role_rx.borrow())
    }
}

impl From<&RoleSnapshot> for RoleEvent {
    fn from(snapshot: &RoleSnapshot) -> Self {
        match snapshot {
            RoleSnapshot::Looking => RoleEvent::Looking,
            RoleSnapshot::Leading { .. } => RoleEvent::Leading,
            RoleSnapshot::Learning { leader, .. } => RoleEvent::Learning(HaLeaderInfo::from(leader)),
        }
    }
}
