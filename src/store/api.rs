use crate::record::{Allocation, BlockHeader, Checkpoint, CodecError};
use bytes::Bytes;

/// Fixed size of the preamble at the front of every block file. Data lives in
/// `[BLOCK_DATA_START, block_file_size)`, so `end_offset == BLOCK_DATA_START`
/// is the empty-block sentinel.
pub const BLOCK_DATA_START: u32 = 16;

/// The append-only block store the HA core replicates.
///
/// Blocks are fixed-size files; components never span blocks. Only the newest
/// (open) block accepts writes. Per block, the store remembers every component
/// end boundary (the sync index), which is what makes handing out byte ranges
/// for replication safe: a range that starts and ends on recorded boundaries
/// always parses back into whole components.
pub trait BlockStore: Send + Sync {
    fn block_header_list(&self) -> Vec<BlockHeader>;

    /// Header of the open block.
    fn last_header(&self) -> BlockHeader;

    fn max_block_index(&self) -> u32;

    /// True iff `end_offset` is the sentinel or a recorded component boundary
    /// of the given block. Unknown blocks verify as false.
    fn verify_offset(&self, block_index: u32, end_offset: u32) -> bool;

    /// End offset of the given block's data.
    fn last_position(&self, block_index: u32) -> Result<u32, StoreError>;

    /// Largest boundary-aligned length `<= max_bytes` starting at `offset`.
    /// `offset` itself must be the sentinel or a recorded boundary.
    fn sync_length(&self, block_index: u32, offset: u32, max_bytes: u32) -> Result<u32, StoreError>;

    fn sync_data(&self, block_index: u32, offset: u32, length: u32) -> Result<Bytes, StoreError>;

    /// Appends the encoded component to the open block, rolling to a fresh
    /// block first if the component does not fit. Returns the new end position.
    fn add_component(&mut self, allocation: &Allocation) -> Result<Checkpoint, StoreError>;

    /// Seals the open block and opens the next one. Returns the new open header.
    fn roll_forward(&mut self) -> Result<BlockHeader, StoreError>;

    /// Cumulative appended data bytes across all blocks. This is the log
    /// recency measure votes carry.
    fn logic_offset(&self) -> i64;
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("block {0} does not exist")]
    UnknownBlock(u32),
    #[error("offset {offset} is not a component boundary of block {block_index}")]
    IncoherentOffset { block_index: u32, offset: u32 },
    #[error("range [{offset}, +{length}) escapes block {block_index}")]
    RangeOutOfBounds { block_index: u32, offset: u32, length: u32 },
    #[error("component of {0} bytes cannot fit an empty block")]
    ComponentTooLarge(usize),
    #[error("component is not encodable: {0}")]
    BadComponent(#[from] CodecError),
}
