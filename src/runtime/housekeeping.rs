use crate::record::Sid;
use crate::runtime::liveness::LivenessTracker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a generation was torn down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RestartReason {
    /// Leader: every other configured member has been silent past the threshold.
    AllLearnersSilent,
    /// Leader: nothing at all has come off the wire for the threshold.
    TotalSilence,
    /// Learner: no frame from the leader for the threshold.
    LeaderSilent,
    /// Learner: the leader stopped answering sync traffic.
    ReplicationStalled,
}

/// Hands a restart request to the driver loop. The channel holds one slot;
/// whoever asks first wins and later requests are redundant anyway.
#[derive(Clone)]
pub(crate) struct RestartHandle {
    tx: mpsc::Sender<RestartReason>,
}

impl RestartHandle {
    pub(crate) fn new() -> (RestartHandle, mpsc::Receiver<RestartReason>) {
        let (tx, rx) = mpsc::channel(1);
        (RestartHandle { tx }, rx)
    }

    pub(crate) fn request(&self, reason: RestartReason) {
        let _ = self.tx.try_send(reason);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum StalenessVerdict {
    Healthy,
    AllLearnersSilent,
    TotalSilence,
}

/// Leader-side staleness check. A peer never heard from counts from the
/// generation baseline, so a fresh generation gets the full threshold before
/// anyone is judged. A single-member cluster has nobody to hear from and is
/// always healthy.
pub(crate) fn leader_staleness(
    my_sid: Sid,
    member_sids: &[Sid],
    liveness: &LivenessTracker,
    baseline: Instant,
    now: Instant,
    threshold: Duration,
) -> StalenessVerdict {
    let others: Vec<Sid> = member_sids.iter().copied().filter(|sid| *sid != my_sid).collect();
    if others.is_empty() {
        return StalenessVerdict::Healthy;
    }
    let silent = |heard: Instant| now.saturating_duration_since(heard) >= threshold;
    if others
        .iter()
        .all(|sid| silent(liveness.last_heard(*sid).unwrap_or(baseline)))
    {
        return StalenessVerdict::AllLearnersSilent;
    }
    if silent(liveness.last_heard_any().unwrap_or(baseline)) {
        return StalenessVerdict::TotalSilence;
    }
    StalenessVerdict::Healthy
}

/// Learner-side staleness check: true iff the leader has been silent past
/// the threshold.
pub(crate) fn learner_staleness(
    leader: Sid,
    liveness: &LivenessTracker,
    baseline: Instant,
    now: Instant,
    threshold: Duration,
) -> bool {
    let heard = liveness.last_heard(leader).unwrap_or(baseline);
    now.saturating_duration_since(heard) >= threshold
}

pub(crate) enum HousekeepingRole {
    Leader,
    Learner { leader: Sid },
}

/// Periodic failure detector for one generation. The moment staleness is
/// found it requests a restart and stops; the driver tears the generation
/// down and re-elects.
pub(crate) async fn run_housekeeping(
    logger: slog::Logger,
    role: HousekeepingRole,
    my_sid: Sid,
    member_sids: Vec<Sid>,
    liveness: Arc<LivenessTracker>,
    interval: Duration,
    threshold: Duration,
    restart: RestartHandle,
    cancel: CancellationToken,
) {
    let baseline = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let now = Instant::now();
        match &role {
            HousekeepingRole::Leader => {
                match leader_staleness(my_sid, &member_sids, &liveness, baseline, now, threshold) {
                    StalenessVerdict::Healthy => {}
                    StalenessVerdict::AllLearnersSilent => {
                        slog::error!(logger, "Every learner has gone silent, restarting the stack");
                        restart.request(RestartReason::AllLearnersSilent);
                        return;
                    }
                    StalenessVerdict::TotalSilence => {
                        slog::error!(logger, "Nothing heard from anyone, restarting the stack");
                        restart.request(RestartReason::TotalSilence);
                        return;
                    }
                }
            }
            HousekeepingRole::Learner { leader } => {
                if learner_staleness(*leader, &liveness, baseline, now, threshold) {
                    slog::error!(
                        logger,
                        "Leader has gone silent, restarting the stack";
                        "leader" => leader.into_inner(),
                    );
                    restart.request(RestartReason::LeaderSilent);
                    return;
                }
            }
        }
    }
}
