use chrono::{DateTime, Utc};
use std::fmt;
use std::net::Ipv4Addr;

/// Server id. Unique per cluster member, totally ordered, assigned by operator config.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sid(i32);

impl Sid {
    pub fn new(sid: i32) -> Self {
        Sid(sid)
    }

    pub fn into_inner(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a node within the HA group.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HaState {
    Looking,
    Leading,
    Learning,
}

impl HaState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            HaState::Looking => 0,
            HaState::Leading => 1,
            HaState::Learning => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HaState::Looking),
            1 => Some(HaState::Leading),
            2 => Some(HaState::Learning),
            _ => None,
        }
    }
}

/// Health of a node as tracked by the collect service.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeState {
    Normal,
    Lost,
    KickedOut,
}

impl NodeState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            NodeState::Normal => 0,
            NodeState::Lost => 1,
            NodeState::KickedOut => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(NodeState::Normal),
            1 => Some(NodeState::Lost),
            2 => Some(NodeState::KickedOut),
            _ => None,
        }
    }
}

/// Immutable identity of a cluster member.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Member {
    pub sid: Sid,
    pub ip: Ipv4Addr,
    /// Port of the peer-to-peer HA channel.
    pub ha_port: u16,
    /// Port the member serves application traffic on. Carried for routing only.
    pub listen_port: u16,
}

/// A member plus its routing weight, as kept in operator config.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemberProfile {
    pub member: Member,
    pub weight: u32,
}

/// Routing entry for one node. Mutated only by the collect service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeAddr {
    pub member: Member,
    pub weight: u32,
    pub state: NodeState,
    pub last_update: DateTime<Utc>,
}

/// One node's election opinion.
#[derive(Clone, Debug, PartialEq)]
pub struct Vote {
    /// Sid the sender wants as leader.
    pub leader: Sid,
    /// Logic offset of the proposed leader's log, as known to the sender.
    pub offset: i64,
    /// Epoch of the last leadership regime the sender accepted.
    pub peer_epoch: i64,
    /// The sender's election round counter.
    pub elect_epoch: i64,
    pub ha_state: HaState,
    /// Sid of the sender.
    pub sid: Sid,
    pub precondition: Precondition,
}

/// Cluster-shape fingerprint. Nodes only exchange votes when these match exactly.
#[derive(Clone, Debug, PartialEq)]
pub struct Precondition {
    /// Sorted by sid.
    pub members: Vec<Member>,
    pub block_file_size: u32,
    pub max_sync_payload: u32,
}

/// Header of one block file. Immutable except for the newest (open) block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub block_index: u32,
    pub component_count: u32,
    /// Fixed data start inside a block file. Doubles as the empty-block sentinel
    /// value for `end_offset`.
    pub begin_offset: u32,
    pub end_offset: u32,
    pub begin_ts_ms: i64,
    pub end_ts_ms: i64,
}

impl BlockHeader {
    /// Structural equality for replication checks. Timestamps are node-local
    /// bookkeeping and deliberately excluded.
    pub fn same_content(&self, other: &BlockHeader) -> bool {
        self.block_index == other.block_index
            && self.component_count == other.component_count
            && self.begin_offset == other.begin_offset
            && self.end_offset == other.end_offset
    }
}

/// A replication position: `end_offset` bytes of block `block_index` are present.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub block_index: u32,
    pub end_offset: u32,
}

/// One node's block-header snapshot, exchanged through gossip.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeBlock {
    pub sid: Sid,
    pub headers: Vec<BlockHeader>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CollectKind {
    Request,
    Response,
}

/// Membership/routing gossip. A request carries the sender's own addr and block
/// snapshot; a response carries the leader's full view.
#[derive(Clone, Debug, PartialEq)]
pub struct Collect {
    pub kind: CollectKind,
    pub leader: Sid,
    pub addrs: Vec<NodeAddr>,
    pub blocks: Vec<NodeBlock>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DatabaseKind {
    Checksum,
    Append,
}

/// Log replication control record. Raw log bytes never ride in here; they ride
/// in the envelope's raw section.
#[derive(Clone, Debug, PartialEq)]
pub struct Database {
    pub kind: DatabaseKind,
    pub checkpoint: Checkpoint,
    /// Checksum request: the sender's full header list. Append response: the
    /// leader's headers for the checkpoint block and its predecessor.
    pub headers: Vec<BlockHeader>,
}

/// The component record the service replicates: "ids for `key` are handed out
/// up to `upto`".
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Allocation {
    pub key: String,
    pub upto: i64,
    pub ts_ms: i64,
}
