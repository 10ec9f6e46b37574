//! Membership and routing gossip (the collect exchange).

mod leader;
mod learner;
mod service;

pub(crate) use leader::run_collect_leader;
pub(crate) use learner::run_collect_learner;
pub(crate) use service::CollectService;
