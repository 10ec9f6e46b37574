use crate::record::{BlockHeader, Checkpoint, Database, DatabaseKind, Sid};
use crate::store::{BlockStore, SharedBlockStore, StoreError, BLOCK_DATA_START};
use crate::transport::{InboundDatabase, OutboundMessage, PeerTransport};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const STORE_POISON: &str = "block store lock poison";

/// Wire envelope budget reserved out of `max_sync_payload` for everything in
/// a sync frame that is not raw log bytes.
pub(crate) const SYNC_ENVELOPE_OVERHEAD: u32 = 128;

#[derive(Debug, PartialEq, thiserror::Error)]
pub(crate) enum ChecksumMismatch {
    #[error("learner sent no block headers")]
    NoHeaders,
    #[error("learner holds block {learner}, we only reach {leader}")]
    MoreBlocksThanLeader { learner: u32, leader: u32 },
    #[error("sealed block {block_index} differs from ours")]
    SealedBlockDiffers { block_index: u32 },
    #[error("tail offset {end_offset} of block {block_index} is not a component boundary here")]
    TailOffsetUnverified { block_index: u32, end_offset: u32 },
}

/// Bootstrap verification. Every learner block except the last must match the
/// leader's same-index block byte-for-byte in layout; the last only needs an
/// end offset the leader's sync index can vouch for (or the empty sentinel).
/// On success the learner's tail is the checkpoint replication resumes from.
pub(crate) fn verify_checksum(
    store: &dyn BlockStore,
    learner_headers: &[BlockHeader],
) -> Result<Checkpoint, ChecksumMismatch> {
    let tail = match learner_headers.last() {
        Some(tail) => tail,
        None => return Err(ChecksumMismatch::NoHeaders),
    };
    if tail.block_index > store.max_block_index() {
        return Err(ChecksumMismatch::MoreBlocksThanLeader {
            learner: tail.block_index,
            leader: store.max_block_index(),
        });
    }
    let my_headers = store.block_header_list();
    for header in &learner_headers[..learner_headers.len() - 1] {
        let matches = my_headers
            .get(header.block_index as usize)
            .map(|mine| mine.same_content(header))
            .unwrap_or(false);
        if !matches {
            return Err(ChecksumMismatch::SealedBlockDiffers {
                block_index: header.block_index,
            });
        }
    }
    if !store.verify_offset(tail.block_index, tail.end_offset) {
        return Err(ChecksumMismatch::TailOffsetUnverified {
            block_index: tail.block_index,
            end_offset: tail.end_offset,
        });
    }
    Ok(Checkpoint {
        block_index: tail.block_index,
        end_offset: tail.end_offset,
    })
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub(crate) enum ChunkError {
    #[error("learner claims offset {end_offset} of block {block_index}, past our {last_position}")]
    LearnerAhead {
        block_index: u32,
        end_offset: u32,
        last_position: u32,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One boundary-aligned slice of the log, ready to send.
#[derive(Debug, PartialEq)]
pub(crate) struct SyncChunk {
    pub response: Database,
    pub raw: Bytes,
}

impl SyncChunk {
    /// Where the learner stands once it applies this chunk.
    pub(crate) fn next_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            block_index: self.response.checkpoint.block_index,
            end_offset: self.response.checkpoint.end_offset + self.raw.len() as u32,
        }
    }
}

/// Computes the next chunk for a learner standing at `from`. A learner that
/// consumed a sealed block to its end is rolled to the next block's sentinel.
/// The returned range always starts and ends on component boundaries, so the
/// learner can decode and append it whole. Zero-length chunks are meaningful:
/// they tell a bootstrapping learner it is caught up.
pub(crate) fn compute_chunk(
    store: &dyn BlockStore,
    from: Checkpoint,
    max_sync_payload: u32,
) -> Result<SyncChunk, ChunkError> {
    let mut block_index = from.block_index;
    let mut offset = from.end_offset;
    let mut last_position = store.last_position(block_index)?;
    if offset > last_position {
        return Err(ChunkError::LearnerAhead {
            block_index,
            end_offset: offset,
            last_position,
        });
    }
    if offset == last_position && block_index < store.max_block_index() {
        block_index += 1;
        offset = BLOCK_DATA_START;
        last_position = store.last_position(block_index)?;
    }

    let allowed = max_sync_payload.saturating_sub(SYNC_ENVELOPE_OVERHEAD);
    let want = std::cmp::min(last_position - offset, allowed);
    let length = store.sync_length(block_index, offset, want)?;
    let raw = if length == 0 {
        Bytes::new()
    } else {
        store.sync_data(block_index, offset, length)?
    };

    let my_headers = store.block_header_list();
    let mut headers = Vec::with_capacity(2);
    if block_index > 0 {
        if let Some(header) = my_headers.get(block_index as usize - 1) {
            headers.push(*header);
        }
    }
    if let Some(header) = my_headers.get(block_index as usize) {
        headers.push(*header);
    }

    Ok(SyncChunk {
        response: Database {
            kind: DatabaseKind::Append,
            checkpoint: Checkpoint {
                block_index,
                end_offset: offset,
            },
            headers,
        },
        raw,
    })
}

/// Leader side of log replication. Serves bootstrap checksums, answers
/// learner announces with the next chunk, and pushes fresh writes to every
/// learner it knows the position of. Recorded positions advance optimistically
/// on push; a learner whose position drifted says so in its next announce and
/// gets corrected from there.
pub(crate) struct LeaderSyncer {
    logger: slog::Logger,
    transport: Arc<dyn PeerTransport>,
    store: SharedBlockStore,
    max_sync_payload: u32,
    checkpoints: HashMap<Sid, Checkpoint>,
}

impl LeaderSyncer {
    pub(crate) fn new(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        store: SharedBlockStore,
        max_sync_payload: u32,
    ) -> Self {
        LeaderSyncer {
            logger,
            transport,
            store,
            max_sync_payload,
            checkpoints: HashMap::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut databases: mpsc::UnboundedReceiver<InboundDatabase>,
        write_ping: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        slog::info!(self.logger, "Leader syncer running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                maybe = databases.recv() => match maybe {
                    Some(inbound) => self.handle_database(inbound),
                    None => return,
                },
                _ = write_ping.notified() => self.push_to_all(),
            }
        }
    }

    fn handle_database(&mut self, inbound: InboundDatabase) {
        match inbound.database.kind {
            DatabaseKind::Checksum => self.handle_checksum(inbound.from, &inbound.database.headers),
            DatabaseKind::Append => self.handle_announce(inbound.from, inbound.database.checkpoint),
        }
    }

    fn handle_checksum(&mut self, from: Sid, headers: &[BlockHeader]) {
        let verdict = {
            let store = self.store.read().expect(STORE_POISON);
            verify_checksum(store.as_ref(), headers)
        };
        match verdict {
            Ok(checkpoint) => {
                slog::info!(
                    self.logger,
                    "Learner checksum verified, syncing from ({}, {})",
                    checkpoint.block_index,
                    checkpoint.end_offset;
                    "learner" => from.into_inner(),
                );
                self.respond_from(from, checkpoint);
            }
            Err(mismatch) => {
                // No reply. The learner retries with backoff and gives up on
                // the stack after prolonged silence.
                slog::warn!(
                    self.logger,
                    "Learner checksum mismatch, not replying: {}",
                    mismatch;
                    "learner" => from.into_inner(),
                );
            }
        }
    }

    fn handle_announce(&mut self, from: Sid, checkpoint: Checkpoint) {
        let plausible = {
            let store = self.store.read().expect(STORE_POISON);
            store.verify_offset(checkpoint.block_index, checkpoint.end_offset)
        };
        if !plausible {
            slog::warn!(
                self.logger,
                "Learner announced a position our sync index cannot vouch for, ignoring";
                "learner" => from.into_inner(),
                "block" => checkpoint.block_index,
                "end_offset" => checkpoint.end_offset,
            );
            return;
        }
        self.respond_from(from, checkpoint);
    }

    fn respond_from(&mut self, to: Sid, from_checkpoint: Checkpoint) {
        let chunk = {
            let store = self.store.read().expect(STORE_POISON);
            compute_chunk(store.as_ref(), from_checkpoint, self.max_sync_payload)
        };
        match chunk {
            Ok(chunk) => {
                self.checkpoints.insert(to, chunk.next_checkpoint());
                if !chunk.raw.is_empty() {
                    slog::debug!(
                        self.logger,
                        "Syncing {} bytes from ({}, {})",
                        chunk.raw.len(),
                        chunk.response.checkpoint.block_index,
                        chunk.response.checkpoint.end_offset;
                        "learner" => to.into_inner(),
                    );
                }
                let raw = chunk.raw.clone();
                self.transport.send_to(to, OutboundMessage::Database(chunk.response, raw));
            }
            Err(e) => {
                slog::warn!(
                    self.logger,
                    "Cannot build sync chunk for learner {}: {}",
                    to.into_inner(),
                    e,
                );
                // Forget the learner until its next announce re-registers it.
                self.checkpoints.remove(&to);
            }
        }
    }

    fn push_to_all(&mut self) {
        let targets: Vec<(Sid, Checkpoint)> = self
            .checkpoints
            .iter()
            .map(|(sid, checkpoint)| (*sid, *checkpoint))
            .collect();
        for (sid, checkpoint) in targets {
            self.respond_from(sid, checkpoint);
        }
    }
}
