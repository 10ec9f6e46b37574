//! The per-node HA runtime: shared context, the generation driver, failure
//! detection, and config write-back.

mod context;
mod driver;
mod housekeeping;
mod liveness;
mod writeback;

pub(crate) use context::HaContext;
pub(crate) use context::RoleSnapshot;
pub(crate) use driver::run_ha_driver;
pub(crate) use liveness::LivenessTracker;
pub(crate) use writeback::run_config_writeback;
pub use writeback::ConfigWriteback;
