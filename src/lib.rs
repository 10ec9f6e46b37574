mod api;
mod election;
mod gossip;
mod record;
mod replication;
mod runtime;
mod store;
mod transport;

pub use api::try_create_ha_client;
pub use api::AllocateError;
pub use api::HaClient;
pub use api::HaClientConfig;
pub use api::HaClientCreationError;
pub use api::HaClusterView;
pub use api::HaLeaderInfo;
pub use api::HaMemberInfo;
pub use api::HaNodeHealth;
pub use api::HaNodeInfo;
pub use api::HaOptions;
pub use api::KickOutError;
pub use api::RoleEvent;
pub use api::RoleListener;
pub use record::BlockHeader;
pub use record::Checkpoint;
pub use runtime::ConfigWriteback;
pub use store::StoreError;

// All `mod` statements, anywhere, should not be `pub`. Only export `pub` via
// individual use statements. This keeps the crate root only responsible for
// exporting types and leaves each mod free to organize its own impl.
