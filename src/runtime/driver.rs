use crate::election::{look_for_leader, run_vote_responder, ElectionState, RoundOutcome};
use crate::gossip::{run_collect_leader, run_collect_learner};
use crate::record::{HaState, Vote};
use crate::replication::{LeaderSyncer, LearnerSyncExit, LearnerSyncer, LearnerTuning};
use crate::runtime::context::{HaContext, RoleSnapshot};
use crate::runtime::housekeeping::{run_housekeeping, HousekeepingRole, RestartHandle, RestartReason};
use crate::transport::{InboundQueues, PeerTransport};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STORE_POISON: &str = "block store lock poison";

/// Runs the HA stack for the life of the node: elect, run the generation's
/// tasks, and start over whenever housekeeping or the learner syncer gives
/// up on the regime. Each generation gets fresh inbound queues and its own
/// cancellation token, so a torn-down generation can never consume the next
/// one's traffic.
pub(crate) async fn run_ha_driver(context: Arc<HaContext>, shutdown: CancellationToken) {
    let logger = context.logger.new(slog::o!("Task" => "HaDriver"));
    let mut state = ElectionState::new(context.my_sid);
    let mut peer_epoch = 0i64;

    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let _ = context.role_tx.send(RoleSnapshot::Looking);
        let (queues, mut receivers) = InboundQueues::new();
        context.transport.install_queues(queues);

        let offset = context.store.read().expect(STORE_POISON).logic_offset();
        let precondition = context.precondition();
        let decision = match look_for_leader(
            &logger,
            context.transport.as_ref(),
            &mut state,
            &mut receivers.votes,
            offset,
            peer_epoch,
            precondition.clone(),
            context.options.election_poll_floor,
            context.options.election_poll_cap,
            &shutdown,
        )
        .await
        {
            RoundOutcome::Decided(decision) => decision,
            RoundOutcome::Cancelled => return,
        };
        peer_epoch = decision.elect_epoch;

        let leader_member = match decision.ha_state {
            HaState::Leading => None,
            HaState::Learning => match context.member(decision.leader) {
                Some(member) => Some(member),
                None => {
                    slog::error!(
                        logger,
                        "Elected leader is not in the member list, re-electing";
                        "leader" => decision.leader.into_inner(),
                    );
                    tokio::time::sleep(context.options.election_poll_floor).await;
                    continue;
                }
            },
            HaState::Looking => {
                slog::error!(logger, "Election concluded without a role, re-electing");
                tokio::time::sleep(context.options.election_poll_floor).await;
                continue;
            }
        };
        slog::info!(
            logger,
            "Election concluded";
            "leader" => decision.leader.into_inner(),
            "elect_epoch" => decision.elect_epoch,
            "state" => format!("{:?}", decision.ha_state),
        );

        let generation = shutdown.child_token();
        let (restart, mut restart_rx) = RestartHandle::new();
        let transport = context.transport.clone() as Arc<dyn PeerTransport>;
        let options = &context.options;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Every established node answers stray election traffic with the
        // vote it concluded on.
        let decided_vote = Vote {
            leader: decision.leader,
            offset: decision.offset,
            peer_epoch: decision.elect_epoch,
            elect_epoch: decision.elect_epoch,
            ha_state: decision.ha_state,
            sid: context.my_sid,
            precondition,
        };
        tasks.push(tokio::task::spawn(run_vote_responder(
            logger.new(slog::o!("Task" => "VoteResponder")),
            transport.clone(),
            receivers.votes,
            decided_vote,
            generation.clone(),
        )));

        match leader_member {
            None => {
                let headers = context.store.read().expect(STORE_POISON).block_header_list();
                context.collect.begin_leading(&context.my_profile(), headers, Utc::now());
                let _ = context.role_tx.send(RoleSnapshot::Leading {
                    elect_epoch: decision.elect_epoch,
                });

                let syncer = LeaderSyncer::new(
                    logger.new(slog::o!("Task" => "LeaderSync")),
                    transport.clone(),
                    context.store.clone(),
                    context.max_sync_payload,
                );
                tasks.push(tokio::task::spawn(syncer.run(
                    receivers.databases,
                    context.write_ping.clone(),
                    generation.clone(),
                )));
                tasks.push(tokio::task::spawn(run_collect_leader(
                    logger.new(slog::o!("Task" => "Collect")),
                    transport.clone(),
                    context.collect.clone(),
                    context.store.clone(),
                    options.silence_threshold,
                    options.kicked_out_grace,
                    receivers.collects,
                    generation.clone(),
                )));
                tasks.push(tokio::task::spawn(run_housekeeping(
                    logger.new(slog::o!("Task" => "Housekeeping")),
                    HousekeepingRole::Leader,
                    context.my_sid,
                    context.member_sids(),
                    context.liveness.clone(),
                    options.housekeeping_interval,
                    options.silence_threshold,
                    restart.clone(),
                    generation.clone(),
                )));
            }
            Some(leader) => {
                context.collect.begin_learning(decision.leader);
                let _ = context.role_tx.send(RoleSnapshot::Learning {
                    leader: leader.clone(),
                    elect_epoch: decision.elect_epoch,
                });

                let syncer = LearnerSyncer::new(
                    logger.new(slog::o!("Task" => "LearnerSync")),
                    transport.clone(),
                    context.store.clone(),
                    decision.leader,
                    LearnerTuning {
                        bootstrap_backoff_floor: options.bootstrap_backoff_floor,
                        bootstrap_backoff_cap: options.bootstrap_backoff_cap,
                        announce_interval: options.announce_interval,
                        silence_threshold: options.silence_threshold,
                    },
                );
                let sync_restart = restart.clone();
                let sync_cancel = generation.clone();
                let sync_databases = receivers.databases;
                tasks.push(tokio::task::spawn(async move {
                    if syncer.run(sync_databases, sync_cancel).await == LearnerSyncExit::RestartWanted {
                        sync_restart.request(RestartReason::ReplicationStalled);
                    }
                }));
                tasks.push(tokio::task::spawn(run_collect_learner(
                    logger.new(slog::o!("Task" => "Collect")),
                    transport.clone(),
                    context.collect.clone(),
                    context.store.clone(),
                    context.my_profile(),
                    decision.leader,
                    options.collect_interval,
                    context.members.clone(),
                    context.drift_tx.clone(),
                    receivers.collects,
                    generation.clone(),
                )));
                tasks.push(tokio::task::spawn(run_housekeeping(
                    logger.new(slog::o!("Task" => "Housekeeping")),
                    HousekeepingRole::Learner {
                        leader: decision.leader,
                    },
                    context.my_sid,
                    context.member_sids(),
                    context.liveness.clone(),
                    options.housekeeping_interval,
                    options.silence_threshold,
                    restart.clone(),
                    generation.clone(),
                )));
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                generation.cancel();
                for task in tasks {
                    let _ = task.await;
                }
                return;
            }
            reason = restart_rx.recv() => {
                slog::warn!(logger, "Restarting the HA stack"; "reason" => format!("{:?}", reason));
                generation.cancel();
                for task in tasks {
                    let _ = task.await;
                }
            }
        }
    }
}
