//! Log replication between the elected leader and its learners.

mod leader;
mod learner;

pub(crate) use leader::LeaderSyncer;
pub(crate) use leader::SYNC_ENVELOPE_OVERHEAD;
pub(crate) use learner::LearnerSyncExit;
pub(crate) use learner::LearnerSyncer;
pub(crate) use learner::LearnerTuning;
