//! Bridge outage between a hub and an extended leaf cluster.
//!
//! Three hub servers accept bridges from three leaf servers. The leaf servers join the
//! hub's metadata group, a stream is placed on the leaf cluster, and the bridges are
//! then cut and restored.

use std::time::Duration;

use streamlink_consensus::{PeerId, META_GROUP};
use streamlink_repl::StreamConfig;

use crate::harness::{extended, fast_timing, wait_for, Deployment, Extended};

const GROUP: &str = "S:ORDERS";

fn commit_indexes(leaf: &Deployment) -> Vec<u64> {
    leaf.servers
        .iter()
        .map(|s| s.applied_index(GROUP).unwrap_or(0))
        .collect()
}

/// The leader every replica agrees on, once all of them vote again.
fn stream_leader(leaf: &Deployment) -> Option<PeerId> {
    let statuses = leaf.group_statuses(GROUP);
    if statuses.len() != leaf.servers.len() || statuses.iter().any(|s| s.observer) {
        return None;
    }
    let leader = statuses.first()?.leader?;
    statuses
        .iter()
        .all(|s| s.leader == Some(leader))
        .then_some(leader)
}

#[tokio::test]
async fn test_outage_demotes_stream_groups_but_not_meta() {
    let ext = extended(None).await.unwrap();
    let Extended {
        hub, leaf, bridges, ..
    } = &ext;

    hub.server(0)
        .create_stream("$G", Some("leaf"), 3, StreamConfig::new("ORDERS", &["orders.>"]))
        .unwrap();
    assert!(
        wait_for(Duration::from_secs(3), || stream_leader(leaf).is_some())
            .await
            .is_some(),
        "stream group never elected a leader"
    );

    for i in 0..20u32 {
        leaf.server(0)
            .replicate("ORDERS", i.to_be_bytes().to_vec())
            .unwrap();
    }
    assert!(
        wait_for(Duration::from_secs(3), || commit_indexes(leaf)
            .iter()
            .all(|i| *i >= 21))
        .await
        .is_some(),
        "entries never applied on every replica"
    );
    let before = commit_indexes(leaf);

    bridges.disconnect_all().unwrap();
    let demoted = wait_for(Duration::from_secs(2), || {
        let statuses = leaf.group_statuses(GROUP);
        statuses.len() == 3 && statuses.iter().all(|s| s.observer && s.leader.is_none())
    })
    .await;
    assert!(demoted.is_some(), "stream groups did not become observers");
    for status in leaf.meta_statuses().iter().chain(hub.meta_statuses().iter()) {
        assert_eq!(status.name, META_GROUP);
        assert!(!status.observer, "metadata group must keep voting");
    }
    let hub_view = hub.server(0).peers().get(leaf.server(0).id()).unwrap();
    assert!(!hub_view.reachable);

    tokio::time::sleep(fast_timing().election_timeout_max() * 3).await;
    assert!(leaf.group_statuses(GROUP).iter().all(|s| s.observer));

    bridges.connect_all().unwrap();
    let reelected = wait_for(Duration::from_secs(2), || stream_leader(leaf).is_some()).await;
    let took = reelected.expect("no stream leader after reconnect");
    assert!(
        took < fast_timing().election_timeout_max() * 10,
        "re-election took {:?}",
        took
    );

    let after = commit_indexes(leaf);
    for (b, a) in before.iter().zip(&after) {
        assert!(a >= b, "applied index went backwards: {} -> {}", b, a);
    }
    for i in 20..25u32 {
        leaf.server(1)
            .replicate("ORDERS", i.to_be_bytes().to_vec())
            .unwrap();
    }
    let target = before.iter().copied().max().unwrap_or(0) + 5;
    assert!(
        wait_for(Duration::from_secs(3), || commit_indexes(leaf)
            .iter()
            .all(|i| *i >= target))
        .await
        .is_some(),
        "entries proposed after the outage were not applied everywhere"
    );

    ext.shutdown().await;
}

#[tokio::test]
async fn test_meta_recovers_leader_after_outage() {
    let ext = extended(None).await.unwrap();
    let Extended {
        hub, leaf, bridges, ..
    } = &ext;

    bridges.disconnect_all().unwrap();
    // neither half holds a majority of six
    let stalled = wait_for(Duration::from_secs(2), || {
        hub.meta_leader().is_none() && leaf.meta_leader().is_none()
    })
    .await;
    assert!(stalled.is_some());
    assert!(hub.meta_statuses().iter().all(|s| !s.observer));

    bridges.connect_all().unwrap();
    let recovered = wait_for(Duration::from_secs(3), || {
        hub.meta_leader().is_some() || leaf.meta_leader().is_some()
    })
    .await;
    assert!(recovered.is_some(), "metadata group never re-elected");
    assert!(
        wait_for(Duration::from_secs(2), || hub.server(2).status().meta_leader.is_some())
            .await
            .is_some()
    );
    let placed = hub
        .server(2)
        .create_stream("$G", Some("hub"), 3, StreamConfig::new("AFTER", &["after"]))
        .unwrap();
    assert_eq!(placed.peers, hub.ids());
    assert!(
        wait_for(Duration::from_secs(3), || hub.group_statuses("S:AFTER").len() == 3)
            .await
            .is_some()
    );

    ext.shutdown().await;
}

#[tokio::test]
async fn test_migration_delay_unset_keeps_members() {
    let ext = extended(None).await.unwrap();
    let Extended {
        net, hub, leaf, bridges,
    } = &ext;

    hub.server(0)
        .create_stream("$G", Some("leaf"), 3, StreamConfig::new("KEEP", &["keep"]))
        .unwrap();
    assert!(
        wait_for(Duration::from_secs(3), || leaf.group_statuses("S:KEEP").len() == 3)
            .await
            .is_some()
    );
    bridges.disconnect_all().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    for remote in leaf.servers.iter().flat_map(|s| s.links().remotes().to_vec()) {
        assert!(!remote.migration_pending());
    }
    for status in leaf.group_statuses("S:KEEP") {
        assert_eq!(status.members, leaf.ids());
    }
    assert!(net.network.is_cut(leaf.ids()[0], hub.ids()[0]));
    bridges.connect_all().unwrap();
    assert!(!net.network.is_cut(leaf.ids()[0], hub.ids()[0]));

    ext.shutdown().await;
}
