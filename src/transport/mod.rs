mod api;
mod connection;
mod dial;
mod frame;
mod manager;

#[cfg(test)]
pub(crate) mod test_utils;

pub(crate) use api::InboundCollect;
pub(crate) use api::InboundDatabase;
pub(crate) use api::InboundQueues;
pub(crate) use api::InboundVote;
pub(crate) use api::OutboundMessage;
pub(crate) use api::PeerTransport;
pub(crate) use manager::ConnectionManager;
pub(crate) use manager::TransportTuning;
