mod codec;
mod types;

pub use codec::decode_allocation_stream;
pub use codec::CodecError;
pub use types::Allocation;
pub use types::BlockHeader;
pub use types::Checkpoint;
pub use types::Collect;
pub use types::CollectKind;
pub use types::Database;
pub use types::DatabaseKind;
pub use types::HaState;
pub use types::Member;
pub use types::MemberProfile;
pub use types::NodeAddr;
pub use types::NodeBlock;
pub use types::NodeState;
pub use types::Precondition;
pub use types::Sid;
pub use types::Vote;
