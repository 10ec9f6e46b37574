use crate::record::{Allocation, BlockHeader, Checkpoint};
use crate::store::api::{BlockStore, StoreError, BLOCK_DATA_START};
use bytes::Bytes;
use chrono::Utc;

/// Memory-backed model of the block-file store. The replication and election
/// logic is what this crate is about; durable block files plug in behind the
/// same trait.
pub struct MemoryBlockStore {
    block_file_size: u32,
    blocks: Vec<MemoryBlock>,
    logic_offset: i64,
}

struct MemoryBlock {
    header: BlockHeader,
    /// Bytes of `[BLOCK_DATA_START, end_offset)`.
    data: Vec<u8>,
    /// Component end offsets, ascending. The sync index.
    boundaries: Vec<u32>,
}

impl MemoryBlock {
    fn fresh(block_index: u32, now_ms: i64) -> Self {
        MemoryBlock {
            header: BlockHeader {
                block_index,
                component_count: 0,
                begin_offset: BLOCK_DATA_START,
                end_offset: BLOCK_DATA_START,
                begin_ts_ms: now_ms,
                end_ts_ms: now_ms,
            },
            data: Vec::new(),
            boundaries: Vec::new(),
        }
    }

    fn is_boundary(&self, offset: u32) -> bool {
        offset == BLOCK_DATA_START || self.boundaries.binary_search(&offset).is_ok()
    }
}

impl MemoryBlockStore {
    pub fn new(block_file_size: u32) -> Self {
        MemoryBlockStore {
            block_file_size,
            blocks: vec![MemoryBlock::fresh(0, Utc::now().timestamp_millis())],
            logic_offset: 0,
        }
    }

    fn block(&self, block_index: u32) -> Result<&MemoryBlock, StoreError> {
        self.blocks
            .get(block_index as usize)
            .ok_or(StoreError::UnknownBlock(block_index))
    }

    fn open_block(&self) -> &MemoryBlock {
        // The constructor seeds block 0 and nothing ever removes blocks.
        self.blocks.last().expect("store holds at least one block")
    }

    fn open_block_mut(&mut self) -> &mut MemoryBlock {
        self.blocks.last_mut().expect("store holds at least one block")
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_header_list(&self) -> Vec<BlockHeader> {
        self.blocks.iter().map(|b| b.header).collect()
    }

    fn last_header(&self) -> BlockHeader {
        self.open_block().header
    }

    fn max_block_index(&self) -> u32 {
        (self.blocks.len() - 1) as u32
    }

    fn verify_offset(&self, block_index: u32, end_offset: u32) -> bool {
        match self.block(block_index) {
            Ok(block) => block.is_boundary(end_offset),
            Err(_) => false,
        }
    }

    fn last_position(&self, block_index: u32) -> Result<u32, StoreError> {
        Ok(self.block(block_index)?.header.end_offset)
    }

    fn sync_length(&self, block_index: u32, offset: u32, max_bytes: u32) -> Result<u32, StoreError> {
        let block = self.block(block_index)?;
        if !block.is_boundary(offset) {
            return Err(StoreError::IncoherentOffset { block_index, offset });
        }

        let limit = offset.saturating_add(max_bytes);
        let candidates = block.boundaries.partition_point(|&b| b <= limit);
        if candidates == 0 {
            return Ok(0);
        }
        let boundary = block.boundaries[candidates - 1];
        Ok(boundary.saturating_sub(offset))
    }

    fn sync_data(&self, block_index: u32, offset: u32, length: u32) -> Result<Bytes, StoreError> {
        let block = self.block(block_index)?;
        let out_of_bounds = StoreError::RangeOutOfBounds {
            block_index,
            offset,
            length,
        };
        if offset < BLOCK_DATA_START {
            return Err(out_of_bounds);
        }
        let start = (offset - BLOCK_DATA_START) as usize;
        let end = start + length as usize;
        if end > block.data.len() {
            return Err(out_of_bounds);
        }
        Ok(Bytes::copy_from_slice(&block.data[start..end]))
    }

    fn add_component(&mut self, allocation: &Allocation) -> Result<Checkpoint, StoreError> {
        let encoded = allocation.encode()?;
        let len = encoded.len() as u64;
        if BLOCK_DATA_START as u64 + len > self.block_file_size as u64 {
            return Err(StoreError::ComponentTooLarge(encoded.len()));
        }
        if self.open_block().header.end_offset as u64 + len > self.block_file_size as u64 {
            self.roll_forward()?;
        }

        let now_ms = Utc::now().timestamp_millis();
        let open = self.open_block_mut();
        open.data.extend_from_slice(&encoded);
        open.header.end_offset += encoded.len() as u32;
        open.header.component_count += 1;
        open.header.end_ts_ms = now_ms;
        open.boundaries.push(open.header.end_offset);
        self.logic_offset += encoded.len() as i64;

        let open = self.open_block();
        Ok(Checkpoint {
            block_index: open.header.block_index,
            end_offset: open.header.end_offset,
        })
    }

    fn roll_forward(&mut self) -> Result<BlockHeader, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let next_index = self.open_block().header.block_index + 1;
        self.open_block_mut().header.end_ts_ms = now_ms;
        self.blocks.push(MemoryBlock::fresh(next_index, now_ms));
        Ok(self.open_block().header)
    }

    fn logic_offset(&self) -> i64 {
        self.logic_offset
    }
}
