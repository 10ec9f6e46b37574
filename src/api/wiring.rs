use crate::api::client::HaClient;
use crate::api::options::{HaOptions, HaOptionsValidated};
use crate::api::types::HaMemberInfo;
use crate::gossip::CollectService;
use crate::record::{MemberProfile, Sid};
use crate::replication::SYNC_ENVELOPE_OVERHEAD;
use crate::runtime::{
    run_config_writeback, run_ha_driver, ConfigWriteback, HaContext, LivenessTracker, RoleSnapshot,
};
use crate::store::{BlockStore, MemoryBlockStore, SharedBlockStore, BLOCK_DATA_START};
use crate::transport::{ConnectionManager, PeerTransport, TransportTuning};
use std::convert::TryFrom;
use std::io;
use std::net::SocketAddrV4;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;

pub struct HaClientConfig {
    pub my_sid: i32,
    pub cluster_members: Vec<HaMemberInfo>,
    /// Size of one append-only block file, in bytes. Part of the cluster
    /// fingerprint: all members must agree on it.
    pub block_file_size: u32,
    /// Upper bound on one replication response, envelope included. Also part
    /// of the cluster fingerprint.
    pub max_sync_payload: u32,
    pub info_logger: slog::Logger,
    pub options: HaOptions,
    /// Where corrected member lists are persisted when gossip finds the
    /// config stale. None keeps corrections in memory only.
    pub config_writeback: Option<Arc<dyn ConfigWriteback>>,
}

#[derive(Debug, thiserror::Error)]
pub enum HaClientCreationError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("my sid not in cluster config")]
    MeNotInCluster,
    #[error("Failed to bind the HA listener: {0}")]
    ListenerBind(io::Error),
}

pub async fn try_create_ha_client(config: HaClientConfig) -> Result<HaClient, HaClientCreationError> {
    let root_logger = config.info_logger;

    if config.cluster_members.is_empty() {
        return Err(HaClientCreationError::InvalidClusterInfo(
            "member list is empty".to_string(),
        ));
    }
    let mut members: Vec<MemberProfile> = config
        .cluster_members
        .into_iter()
        .map(MemberProfile::from)
        .collect();
    members.sort_by_key(|p| p.member.sid);
    for pair in members.windows(2) {
        if pair[0].member.sid == pair[1].member.sid {
            return Err(HaClientCreationError::InvalidClusterInfo(format!(
                "duplicate sid {}",
                pair[0].member.sid,
            )));
        }
    }
    let my_sid = Sid::new(config.my_sid);
    let me = members
        .iter()
        .find(|p| p.member.sid == my_sid)
        .cloned()
        .ok_or(HaClientCreationError::MeNotInCluster)?;
    if config.block_file_size <= BLOCK_DATA_START {
        return Err(HaClientCreationError::InvalidClusterInfo(format!(
            "block file size {} cannot hold any data",
            config.block_file_size,
        )));
    }
    if config.max_sync_payload < SYNC_ENVELOPE_OVERHEAD * 2 {
        return Err(HaClientCreationError::InvalidClusterInfo(format!(
            "max sync payload {} leaves no room past the sync envelope",
            config.max_sync_payload,
        )));
    }

    let options = HaOptionsValidated::try_from(config.options)
        .map_err(|e| HaClientCreationError::IllegalClientOptions(e.to_string()))?;

    let shutdown = CancellationToken::new();
    let liveness = Arc::new(LivenessTracker::new());
    let transport = ConnectionManager::new(
        root_logger.new(slog::o!("Component" => "Transport")),
        my_sid,
        members.iter().map(|p| p.member.clone()).collect(),
        liveness.clone(),
        TransportTuning {
            outbound_queue_capacity: options.outbound_queue_capacity,
            write_stall_cap: options.write_stall_cap,
            dial_retry_floor: options.dial_retry_floor,
            dial_retry_cap: options.dial_retry_cap,
            handshake_timeout: options.handshake_timeout,
        },
        shutdown.clone(),
    );
    let listener = TcpListener::bind(SocketAddrV4::new(me.member.ip, me.member.ha_port))
        .await
        .map_err(HaClientCreationError::ListenerBind)?;
    transport.start(listener);

    let store: SharedBlockStore = Arc::new(RwLock::new(
        Box::new(MemoryBlockStore::new(config.block_file_size)) as Box<dyn BlockStore>,
    ));
    let collect = Arc::new(CollectService::new(
        root_logger.new(slog::o!("Component" => "Collect")),
    ));
    let (role_tx, role_rx) = watch::channel(RoleSnapshot::Looking);
    let (drift_tx, drift_rx) = mpsc::unbounded_channel();

    let context = Arc::new(HaContext {
        logger: root_logger.clone(),
        my_sid,
        members: Arc::new(RwLock::new(members)),
        block_file_size: config.block_file_size,
        max_sync_payload: config.max_sync_payload,
        options,
        store,
        transport: transport.clone(),
        collect,
        liveness,
        role_tx,
        write_ping: Arc::new(Notify::new()),
        drift_tx,
    });
    tokio::task::spawn(run_ha_driver(context.clone(), shutdown.clone()));
    tokio::task::spawn(run_config_writeback(
        root_logger.new(slog::o!("Task" => "ConfigWriteback")),
        my_sid,
        context.members.clone(),
        transport as Arc<dyn PeerTransport>,
        config.config_writeback,
        drift_rx,
        shutdown.clone(),
    ));

    Ok(HaClient::new(context, role_rx, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn member(sid: i32, ha_port: u16) -> HaMemberInfo {
        HaMemberInfo {
            sid,
            ip_addr: Ipv4Addr::LOCALHOST,
            ha_port,
            listen_port: ha_port + 1000,
            weight: 1,
        }
    }

    fn config(members: Vec<HaMemberInfo>) -> HaClientConfig {
        HaClientConfig {
            my_sid: 1,
            cluster_members: members,
            block_file_size: 4096,
            max_sync_payload: 4096,
            info_logger: slog::Logger::root(slog::Discard, slog::o!()),
            options: HaOptions::default(),
            config_writeback: None,
        }
    }

    #[tokio::test]
    async fn empty_member_list_is_rejected() {
        let result = try_create_ha_client(config(Vec::new())).await;
        assert!(matches!(result, Err(HaClientCreationError::InvalidClusterInfo(_))));
    }

    #[tokio::test]
    async fn duplicate_sids_are_rejected() {
        let result = try_create_ha_client(config(vec![member(1, 7711), member(1, 7712)])).await;
        assert!(matches!(result, Err(HaClientCreationError::InvalidClusterInfo(_))));
    }

    #[tokio::test]
    async fn my_sid_must_be_configured() {
        let result = try_create_ha_client(config(vec![member(2, 7713)])).await;
        assert!(matches!(result, Err(HaClientCreationError::MeNotInCluster)));
    }

    #[tokio::test]
    async fn undersized_block_file_is_rejected() {
        let mut config = config(vec![member(1, 7714)]);
        config.block_file_size = BLOCK_DATA_START;
        let result = try_create_ha_client(config).await;
        assert!(matches!(result, Err(HaClientCreationError::InvalidClusterInfo(_))));
    }

    #[tokio::test]
    async fn undersized_sync_payload_is_rejected() {
        let mut config = config(vec![member(1, 7715)]);
        config.max_sync_payload = SYNC_ENVELOPE_OVERHEAD;
        let result = try_create_ha_client(config).await;
        assert!(matches!(result, Err(HaClientCreationError::InvalidClusterInfo(_))));
    }

    #[tokio::test]
    async fn bad_options_are_rejected() {
        let mut config = config(vec![member(1, 7716)]);
        config.options.election_poll_floor = Some(std::time::Duration::from_secs(90));
        let result = try_create_ha_client(config).await;
        assert!(matches!(result, Err(HaClientCreationError::IllegalClientOptions(_))));
    }

    #[tokio::test]
    async fn creates_and_shuts_down_cleanly() {
        let client = try_create_ha_client(config(vec![member(1, 7717)]))
            .await
            .expect("creation failed");
        assert_eq!(client.logic_offset(), 0);
        drop(client);
    }
}
