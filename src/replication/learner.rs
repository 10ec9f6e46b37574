use crate::record::{decode_allocation_stream, Checkpoint, Database, DatabaseKind, Sid};
use crate::store::{SharedBlockStore, BLOCK_DATA_START};
use crate::transport::{InboundDatabase, OutboundMessage, PeerTransport};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const STORE_POISON: &str = "block store lock poison";

#[derive(Clone)]
pub(crate) struct LearnerTuning {
    pub bootstrap_backoff_floor: Duration,
    pub bootstrap_backoff_cap: Duration,
    pub announce_interval: Duration,
    pub silence_threshold: Duration,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum LearnerSyncExit {
    /// The leader stopped answering for the silence threshold. The stack must
    /// restart and re-elect.
    RestartWanted,
    Cancelled,
}

#[derive(Debug, Eq, PartialEq)]
enum ApplyOutcome {
    Applied,
    AlreadyCurrent,
    Rejected,
}

/// Learner side of log replication.
///
/// Bootstraps by sending its full header list until the leader vouches for
/// its position, then stays in lockstep: every applied chunk is announced
/// straight back (which doubles as the request for the next one), with a
/// periodic announce as the keepalive. Leader silence past the threshold is
/// fatal either way; votes still flowing from the leader do not count, only
/// sync responses do.
pub(crate) struct LearnerSyncer {
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    store: SharedBlockStore,
    leader: Sid,
    tuning: LearnerTuning,
}

impl LearnerSyncer {
    pub(crate) fn new(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        store: SharedBlockStore,
        leader: Sid,
        tuning: LearnerTuning,
    ) -> Self {
        LearnerSyncer {
            logger,
            transport,
            store,
            leader,
            tuning,
        }
    }

    pub(crate) async fn run(
        self,
        mut databases: mpsc::UnboundedReceiver<InboundDatabase>,
        cancel: CancellationToken,
    ) -> LearnerSyncExit {
        slog::info!(self.logger, "Learner syncer running"; "leader" => self.leader.into_inner());
        let mut last_response = Instant::now();

        // Bootstrap: checksum with backoff until the leader vouches for us.
        let mut backoff = self.tuning.bootstrap_backoff_floor;
        self.send_checksum();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LearnerSyncExit::Cancelled,
                maybe = databases.recv() => match maybe {
                    None => return LearnerSyncExit::Cancelled,
                    Some(inbound) => {
                        if inbound.from != self.leader {
                            continue;
                        }
                        last_response = Instant::now();
                        match self.apply(&inbound) {
                            ApplyOutcome::Applied | ApplyOutcome::AlreadyCurrent => {
                                slog::info!(self.logger, "Bootstrap complete, log position verified by the leader");
                                break;
                            }
                            ApplyOutcome::Rejected => {}
                        }
                    }
                },
                _ = tokio::time::sleep(backoff) => {
                    if last_response.elapsed() >= self.tuning.silence_threshold {
                        slog::error!(self.logger, "Leader never answered the bootstrap, giving up on this stack");
                        return LearnerSyncExit::RestartWanted;
                    }
                    if !self.transport.has_live_connection(self.leader) {
                        self.transport.nudge_dialer(self.leader);
                    }
                    backoff = std::cmp::min(backoff * 2, self.tuning.bootstrap_backoff_cap);
                    self.send_checksum();
                }
            }
        }

        // Steady state. The first announce goes out immediately.
        let mut next_announce = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LearnerSyncExit::Cancelled,
                maybe = databases.recv() => match maybe {
                    None => return LearnerSyncExit::Cancelled,
                    Some(inbound) => {
                        if inbound.from != self.leader {
                            continue;
                        }
                        last_response = Instant::now();
                        if self.apply(&inbound) == ApplyOutcome::Applied {
                            self.send_announce();
                            next_announce = Instant::now() + self.tuning.announce_interval;
                        }
                    }
                },
                _ = tokio::time::sleep_until(next_announce) => {
                    if last_response.elapsed() >= self.tuning.silence_threshold {
                        slog::error!(self.logger, "Leader stopped answering syncs, giving up on this stack");
                        return LearnerSyncExit::RestartWanted;
                    }
                    self.send_announce();
                    next_announce = Instant::now() + self.tuning.announce_interval;
                }
            }
        }
    }

    /// Applies one sync chunk. The tag must sit exactly on our open block's
    /// end, or hand us over to the next block with the leader's sealed header
    /// vouching for the one we are closing. Anything else is dropped; the
    /// periodic announce re-converges the positions.
    fn apply(&self, inbound: &InboundDatabase) -> ApplyOutcome {
        if inbound.database.kind != DatabaseKind::Append {
            slog::warn!(self.logger, "Unexpected database kind from the leader, ignoring");
            return ApplyOutcome::Rejected;
        }
        let tag = inbound.database.checkpoint;
        let mut store = self.store.write().expect(STORE_POISON);
        let mine = store.last_header();
        let at_position = tag.block_index == mine.block_index && tag.end_offset == mine.end_offset;
        if !at_position {
            let rolls_forward = tag.block_index == mine.block_index + 1
                && tag.end_offset == BLOCK_DATA_START
                && inbound
                    .database
                    .headers
                    .iter()
                    .any(|h| h.block_index == mine.block_index && h.same_content(&mine));
            if !rolls_forward {
                slog::warn!(
                    self.logger,
                    "Sync chunk tagged ({}, {}) does not line up with our ({}, {}), ignoring",
                    tag.block_index,
                    tag.end_offset,
                    mine.block_index,
                    mine.end_offset,
                );
                return ApplyOutcome::Rejected;
            }
            if let Err(e) = store.roll_forward() {
                slog::error!(self.logger, "Failed to roll to the next block: {}", e);
                return ApplyOutcome::Rejected;
            }
        } else if inbound.raw.is_empty() {
            return ApplyOutcome::AlreadyCurrent;
        }
        if inbound.raw.is_empty() {
            // Rolled forward with no data for the new block yet.
            return ApplyOutcome::Applied;
        }

        let components = match decode_allocation_stream(inbound.raw.clone()) {
            Ok(components) => components,
            Err(e) => {
                slog::warn!(self.logger, "Sync chunk does not decode, ignoring: {}", e);
                return ApplyOutcome::Rejected;
            }
        };
        for allocation in &components {
            if let Err(e) = store.add_component(allocation) {
                slog::error!(self.logger, "Failed to apply a replicated component: {}", e);
                return ApplyOutcome::Rejected;
            }
        }
        slog::debug!(
            self.logger,
            "Applied {} components, now at ({}, {})",
            components.len(),
            store.last_header().block_index,
            store.last_header().end_offset,
        );
        ApplyOutcome::Applied
    }

    fn send_checksum(&self) {
        let (checkpoint, headers) = {
            let store = self.store.read().expect(STORE_POISON);
            let open = store.last_header();
            (
                Checkpoint {
                    block_index: open.block_index,
                    end_offset: open.end_offset,
                },
                store.block_header_list(),
            )
        };
        slog::debug!(
            self.logger,
            "Requesting sync from ({}, {})",
            checkpoint.block_index,
            checkpoint.end_offset,
        );
        self.transport.send_to(
            self.leader,
            OutboundMessage::Database(
                Database {
                    kind: DatabaseKind::Checksum,
                    checkpoint,
                    headers,
                },
                Bytes::new(),
            ),
        );
    }

    fn send_announce(&self) {
        let checkpoint = {
            let store = self.store.read().expect(STORE_POISON);
            let open = store.last_header();
            Checkpoint {
                block_index: open.block_index,
                end_offset: open.end_offset,
            }
        };
        self.transport.send_to(
            self.leader,
            OutboundMessage::Database(
                Database {
                    kind: DatabaseKind::Append,
                    checkpoint,
                    headers: Vec::new(),
                },
                Bytes::new(),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Allocation, BlockHeader};
    use crate::store::{BlockStore, MemoryBlockStore};
    use crate::transport::test_utils::RecordingTransport;
    use std::sync::RwLock;

    fn component_25(upto: i64) -> Allocation {
        Allocation {
            key: "aa".to_string(),
            upto,
            ts_ms: 1_650_000_000_000,
        }
    }

    fn shared(store: MemoryBlockStore) -> SharedBlockStore {
        Arc::new(RwLock::new(Box::new(store) as Box<dyn BlockStore>))
    }

    fn tuning() -> LearnerTuning {
        LearnerTuning {
            bootstrap_backoff_floor: Duration::from_millis(20),
            bootstrap_backoff_cap: Duration::from_millis(100),
            announce_interval: Duration::from_millis(50),
            silence_threshold: Duration::from_secs(30),
        }
    }

    fn syncer(store: SharedBlockStore) -> (LearnerSyncer, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new(
            Sid::new(2),
            vec![Sid::new(1), Sid::new(2)],
        ));
        let syncer = LearnerSyncer::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            transport.clone() as Arc<dyn PeerTransport>,
            store,
            Sid::new(1),
            tuning(),
        );
        (syncer, transport)
    }

    fn chunk(tag: Checkpoint, headers: Vec<BlockHeader>, components: &[Allocation]) -> InboundDatabase {
        let mut raw = Vec::new();
        for component in components {
            raw.extend_from_slice(&component.encode().unwrap());
        }
        InboundDatabase {
            from: Sid::new(1),
            database: Database {
                kind: DatabaseKind::Append,
                checkpoint: tag,
                headers,
            },
            raw: Bytes::from(raw),
        }
    }

    #[test]
    fn applies_chunk_tagged_at_our_position() {
        let store = shared({
            let mut s = MemoryBlockStore::new(4096);
            s.add_component(&component_25(1)).unwrap();
            s
        });
        let (syncer, _) = syncer(store.clone());

        let tag = Checkpoint {
            block_index: 0,
            end_offset: BLOCK_DATA_START + 25,
        };
        let outcome = syncer.apply(&chunk(tag, Vec::new(), &[component_25(2), component_25(3)]));

        assert_eq!(outcome, ApplyOutcome::Applied);
        let store = store.read().unwrap();
        assert_eq!(store.last_header().component_count, 3);
        assert_eq!(store.last_header().end_offset, BLOCK_DATA_START + 75);
        assert_eq!(store.logic_offset(), 75);
    }

    #[test]
    fn rejects_chunk_tagged_off_position() {
        let store = shared({
            let mut s = MemoryBlockStore::new(4096);
            s.add_component(&component_25(1)).unwrap();
            s
        });
        let (syncer, _) = syncer(store.clone());

        // Tagged at the sentinel, but we already hold a component.
        let tag = Checkpoint {
            block_index: 0,
            end_offset: BLOCK_DATA_START,
        };
        let outcome = syncer.apply(&chunk(tag, Vec::new(), &[component_25(2)]));

        assert_eq!(outcome, ApplyOutcome::Rejected);
        assert_eq!(store.read().unwrap().logic_offset(), 25);
    }

    #[test]
    fn replaying_an_applied_chunk_changes_nothing() {
        let store = shared({
            let mut s = MemoryBlockStore::new(4096);
            s.add_component(&component_25(1)).unwrap();
            s
        });
        let (syncer, _) = syncer(store.clone());
        let tag = Checkpoint {
            block_index: 0,
            end_offset: BLOCK_DATA_START + 25,
        };
        let replicated = chunk(tag, Vec::new(), &[component_25(2)]);

        assert_eq!(syncer.apply(&replicated), ApplyOutcome::Applied);
        let after_first = store.read().unwrap().logic_offset();

        assert_eq!(syncer.apply(&replicated), ApplyOutcome::Rejected);
        assert_eq!(store.read().unwrap().logic_offset(), after_first);
    }

    #[test]
    fn rolls_forward_when_leader_vouches_for_our_sealed_block() {
        // Block size 70: our block 0 is full with two components.
        let store = shared({
            let mut s = MemoryBlockStore::new(70);
            s.add_component(&component_25(1)).unwrap();
            s.add_component(&component_25(2)).unwrap();
            s
        });
        let (syncer, _) = syncer(store.clone());

        let sealed = store.read().unwrap().last_header();
        let tag = Checkpoint {
            block_index: 1,
            end_offset: BLOCK_DATA_START,
        };
        let outcome = syncer.apply(&chunk(tag, vec![sealed], &[component_25(3)]));

        assert_eq!(outcome, ApplyOutcome::Applied);
        let store = store.read().unwrap();
        assert_eq!(store.max_block_index(), 1);
        assert_eq!(store.last_header().component_count, 1);
        assert_eq!(store.logic_offset(), 75);
    }

    #[test]
    fn roll_requires_the_leaders_header_to_match_ours() {
        let store = shared({
            let mut s = MemoryBlockStore::new(70);
            s.add_component(&component_25(1)).unwrap();
            s.add_component(&component_25(2)).unwrap();
            s
        });
        let (syncer, _) = syncer(store.clone());

        let mut sealed = store.read().unwrap().last_header();
        sealed.component_count = 1;
        sealed.end_offset = BLOCK_DATA_START + 25;
        let tag = Checkpoint {
            block_index: 1,
            end_offset: BLOCK_DATA_START,
        };
        let outcome = syncer.apply(&chunk(tag, vec![sealed], &[component_25(3)]));

        assert_eq!(outcome, ApplyOutcome::Rejected);
        assert_eq!(store.read().unwrap().max_block_index(), 0);
    }

    #[test]
    fn undecodable_raw_is_rejected() {
        let store = shared(MemoryBlockStore::new(4096));
        let (syncer, _) = syncer(store.clone());

        let mut garbage = chunk(
            Checkpoint {
                block_index: 0,
                end_offset: BLOCK_DATA_START,
            },
            Vec::new(),
            &[],
        );
        garbage.raw = Bytes::from_static(b"not a component stream");

        assert_eq!(syncer.apply(&garbage), ApplyOutcome::Rejected);
        assert_eq!(store.read().unwrap().logic_offset(), 0);
    }

    #[test]
    fn zero_length_chunk_at_position_is_already_current() {
        let store = shared(MemoryBlockStore::new(4096));
        let (syncer, _) = syncer(store);

        let outcome = syncer.apply(&chunk(
            Checkpoint {
                block_index: 0,
                end_offset: BLOCK_DATA_START,
            },
            Vec::new(),
            &[],
        ));

        assert_eq!(outcome, ApplyOutcome::AlreadyCurrent);
    }

    #[tokio::test]
    async fn bootstrap_then_lockstep_announces() {
        let store = shared(MemoryBlockStore::new(4096));
        let (syncer, transport) = syncer(store.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::task::spawn(syncer.run(rx, cancel.clone()));

        // The first thing out is a checksum request.
        let first = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let sent = transport.databases_sent_to(Sid::new(1));
                if !sent.is_empty() {
                    return sent[0].0.clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no checksum request");
        assert_eq!(first.kind, DatabaseKind::Checksum);
        assert_eq!(first.headers.len(), 1);

        // Leader vouches: zero-length chunk at our position ends bootstrap,
        // and the steady state announces immediately.
        tx.send(chunk(
            Checkpoint {
                block_index: 0,
                end_offset: BLOCK_DATA_START,
            },
            Vec::new(),
            &[],
        ))
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let announced = transport
                    .databases_sent_to(Sid::new(1))
                    .into_iter()
                    .any(|(d, _)| d.kind == DatabaseKind::Append);
                if announced {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no announce after bootstrap");

        // A replicated chunk is applied and announced at the new position.
        tx.send(chunk(
            Checkpoint {
                block_index: 0,
                end_offset: BLOCK_DATA_START,
            },
            Vec::new(),
            &[component_25(7)],
        ))
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let caught_up = transport.databases_sent_to(Sid::new(1)).into_iter().any(|(d, _)| {
                    d.kind == DatabaseKind::Append
                        && d.checkpoint.end_offset == BLOCK_DATA_START + 25
                });
                if caught_up {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("applied chunk was never announced");
        assert_eq!(store.read().unwrap().logic_offset(), 25);

        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("syncer did not stop")
            .unwrap();
        assert_eq!(exit, LearnerSyncExit::Cancelled);
    }

    #[tokio::test]
    async fn silent_leader_forces_a_restart() {
        let store = shared(MemoryBlockStore::new(4096));
        let (mut syncer, transport) = syncer(store);
        syncer.tuning.silence_threshold = Duration::from_millis(150);
        let (_tx, rx) = mpsc::unbounded_channel();
        let task = tokio::task::spawn(syncer.run(rx, CancellationToken::new()));

        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("syncer never gave up")
            .unwrap();
        assert_eq!(exit, LearnerSyncExit::RestartWanted);
        // It kept asking while it waited.
        assert!(transport.databases_sent_to(Sid::new(1)).len() >= 2);
    }
}
