use idwell::{try_create_ha_client, AllocateError, HaClientConfig, HaMemberInfo, HaOptions, RoleEvent};
use slog::Drain;
use std::collections::HashMap;
use std::error::Error;
use std::net::Ipv4Addr;
use tokio::time::{Duration, Instant};

#[tokio::test]
async fn leader_election() -> Result<(), Box<dyn Error>> {
    let num_members = 3;
    let mut clients = HashMap::with_capacity(num_members);
    for sid in 1..=num_members as i32 {
        let client = try_create_ha_client(config(sid, num_members as i32, 7300)).await?;
        clients.insert(sid, client);
    }

    let leader_sid = discover_leader_sid(&mut clients, Duration::from_secs(15)).await;

    // Every node settles on the same leader, and only that node leads.
    wait_for_roles_to_settle(&clients, leader_sid, Duration::from_secs(15)).await;

    // Writes against a learner come back with the leader's address.
    let (_, learner) = clients.iter().find(|(sid, _)| **sid != leader_sid).unwrap();
    match learner.allocate("ticket", 99_999) {
        Err(AllocateError::LeaderRedirect(info)) => assert_eq!(info.sid, leader_sid),
        other => panic!("Expected a leader redirect, got {:?}", other),
    }

    // Writes against the leader succeed.
    clients
        .get(&leader_sid)
        .expect("Leader missing!")
        .allocate("ticket", 100)
        .expect("Found incorrect leader");

    Ok(())
}

#[tokio::test]
async fn replicated_allocation() -> Result<(), Box<dyn Error>> {
    let num_members = 3;
    let mut clients = HashMap::with_capacity(num_members);
    for sid in 1..=num_members as i32 {
        let client = try_create_ha_client(config(sid, num_members as i32, 7400)).await?;
        clients.insert(sid, client);
    }

    let leader_sid = discover_leader_sid(&mut clients, Duration::from_secs(15)).await;
    let leader = clients.get(&leader_sid).expect("Leader missing!");

    leader.allocate("order", 5_000)?;
    leader.allocate("order", 10_000)?;
    leader.allocate("invoice", 250)?;
    let target = leader.logic_offset();
    assert!(target > 0);

    wait_for_offset(&clients, target, Duration::from_secs(15)).await;

    // Every learner holds the leader's block structure. Header timestamps
    // are stamped from each node's own clock, so compare structure only.
    let expected = leader.block_headers();
    for (_, client) in clients.iter() {
        let headers = client.block_headers();
        assert_eq!(headers.len(), expected.len());
        for (mine, theirs) in headers.iter().zip(expected.iter()) {
            assert!(
                mine.same_content(theirs),
                "Block {} diverged: {:?} vs {:?}",
                theirs.block_index,
                mine,
                theirs
            );
        }
    }

    Ok(())
}

#[tokio::test]
async fn single_node_cluster() -> Result<(), Box<dyn Error>> {
    let client = try_create_ha_client(config(1, 1, 7500)).await?;

    let mut listener = client.role_listener();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, listener.next())
            .await
            .expect("Timeout waiting for single-node election")
            .expect("Expected role listener to be alive");
        if event == RoleEvent::Leading {
            break;
        }
    }

    let checkpoint = client.allocate("solo", 42)?;
    assert_eq!(checkpoint.block_index, 0);
    assert!(client.logic_offset() > 0);

    let view = client.cluster_view();
    assert_eq!(view.leader_sid, Some(1));

    Ok(())
}

#[tokio::test]
async fn failover_after_leader_loss() -> Result<(), Box<dyn Error>> {
    let num_members = 3;
    let mut clients = HashMap::with_capacity(num_members);
    for sid in 1..=num_members as i32 {
        let client = try_create_ha_client(config(sid, num_members as i32, 7600)).await?;
        clients.insert(sid, client);
    }

    let first_leader = discover_leader_sid(&mut clients, Duration::from_secs(15)).await;
    wait_for_roles_to_settle(&clients, first_leader, Duration::from_secs(15)).await;

    // Kill the leader. The survivors still hold a quorum of the configured
    // three, so after the silence threshold they must re-elect among
    // themselves.
    let dead = clients.remove(&first_leader).expect("Leader missing!");
    drop(dead);

    let deadline = Instant::now() + Duration::from_secs(45);
    let second_leader = loop {
        let leading: Vec<i32> = clients
            .iter()
            .filter(|(_, c)| c.role_listener().current() == RoleEvent::Leading)
            .map(|(sid, _)| *sid)
            .collect();
        if let Some(sid) = leading.first() {
            break *sid;
        }
        assert!(Instant::now() < deadline, "No new leader after losing the old one");
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    assert_ne!(second_leader, first_leader);

    clients
        .get(&second_leader)
        .expect("Leader missing!")
        .allocate("ticket", 7)
        .expect("New leader refused a write");

    Ok(())
}

fn config(my_sid: i32, num_members: i32, port_base: u16) -> HaClientConfig {
    let mut cluster_members = Vec::with_capacity(num_members as usize);
    for sid in 1..=num_members {
        cluster_members.push(member_info(port_base, sid));
    }

    HaClientConfig {
        my_sid,
        cluster_members,
        block_file_size: 64 * 1024,
        max_sync_payload: 16 * 1024,
        info_logger: create_root_logger_for_stdout(my_sid),
        options: test_options(),
        config_writeback: None,
    }
}

// Tight timers so the whole exchange fits a test run.
fn test_options() -> HaOptions {
    HaOptions {
        election_poll_floor: Some(Duration::from_millis(50)),
        election_poll_cap: Some(Duration::from_secs(1)),
        bootstrap_backoff_floor: Some(Duration::from_millis(50)),
        bootstrap_backoff_cap: Some(Duration::from_millis(500)),
        announce_interval: Some(Duration::from_millis(200)),
        collect_interval: Some(Duration::from_millis(300)),
        housekeeping_interval: Some(Duration::from_millis(500)),
        silence_threshold: Some(Duration::from_secs(10)),
        dial_retry_floor: Some(Duration::from_millis(100)),
        dial_retry_cap: Some(Duration::from_secs(1)),
        ..HaOptions::default()
    }
}

fn member_info(port_base: u16, sid: i32) -> HaMemberInfo {
    HaMemberInfo {
        sid,
        ip_addr: Ipv4Addr::from([127, 0, 0, 1]),
        ha_port: port_base + sid as u16,
        listen_port: port_base + 100 + sid as u16,
        weight: 1,
    }
}

async fn discover_leader_sid(clients: &mut HashMap<i32, idwell::HaClient>, timeout: Duration) -> i32 {
    let deadline = Instant::now() + timeout;
    let (any_sid, any_client) = clients.iter_mut().next().unwrap();
    let mut listener = any_client.role_listener();

    loop {
        let event = tokio::time::timeout_at(deadline, listener.next())
            .await
            .expect("Timeout waiting for leader election")
            .expect("Expected role listener to be alive");

        match event {
            RoleEvent::Leading => return *any_sid,
            RoleEvent::Learning(leader) => return leader.sid,
            RoleEvent::Looking => { /* Continue */ }
        }
    }
}

/// Waits until exactly `leader_sid` reports Leading and every other node
/// reports Learning under it.
async fn wait_for_roles_to_settle(clients: &HashMap<i32, idwell::HaClient>, leader_sid: i32, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let settled = clients.iter().all(|(sid, client)| match client.role_listener().current() {
            RoleEvent::Leading => *sid == leader_sid,
            RoleEvent::Learning(leader) => *sid != leader_sid && leader.sid == leader_sid,
            RoleEvent::Looking => false,
        });
        if settled {
            return;
        }
        assert!(Instant::now() < deadline, "Cluster never settled behind sid {}", leader_sid);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_for_offset(clients: &HashMap<i32, idwell::HaClient>, target: i64, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if clients.values().all(|c| c.logic_offset() == target) {
            return;
        }
        assert!(Instant::now() < deadline, "Replication never converged on offset {}", target);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn create_root_logger_for_stdout(sid: i32) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Sid" => sid))
}
