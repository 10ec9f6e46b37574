use idwell::{try_create_ha_client, HaClientConfig, HaMemberInfo, HaOptions, RoleEvent};
use slog::Drain;
use std::net::Ipv4Addr;

/// Single-node demo: start the stack, wait for leadership, hand out some ids.
#[tokio::main]
async fn main() {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, slog::o!());

    let config = HaClientConfig {
        my_sid: 1,
        cluster_members: vec![HaMemberInfo {
            sid: 1,
            ip_addr: Ipv4Addr::LOCALHOST,
            ha_port: 7000,
            listen_port: 8000,
            weight: 1,
        }],
        block_file_size: 64 * 1024,
        max_sync_payload: 16 * 1024,
        info_logger: logger.clone(),
        options: HaOptions::default(),
        config_writeback: None,
    };
    let client = try_create_ha_client(config)
        .await
        .expect("failed to start the HA stack");

    let mut roles = client.role_listener();
    while let Some(event) = roles.next().await {
        slog::info!(logger, "Role changed"; "role" => format!("{:?}", event));
        if event == RoleEvent::Leading {
            break;
        }
    }

    for upto in [1000i64, 2000, 3000].iter().copied() {
        let checkpoint = client.allocate("demo", upto).expect("allocate failed");
        slog::info!(
            logger,
            "Allocated";
            "upto" => upto,
            "block" => checkpoint.block_index,
            "end_offset" => checkpoint.end_offset,
        );
    }
    slog::info!(logger, "Done"; "logic_offset" => client.logic_offset());
}
