//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod event_bus;
mod options;
mod types;
mod wiring;

pub use client::AllocateError;
pub use client::HaClient;
pub use client::KickOutError;
pub use event_bus::RoleEvent;
pub use event_bus::RoleListener;
pub use options::HaOptions;
pub use types::HaClusterView;
pub use types::HaLeaderInfo;
pub use types::HaMemberInfo;
pub use types::HaNodeHealth;
pub use types::HaNodeInfo;
pub use wiring::try_create_ha_client;
pub use wiring::HaClientConfig;
pub use wiring::HaClientCreationError;

// So the runtime context can carry the validated tunables.
pub(crate) use options::HaOptionsValidated;
