//! Discovery tests -- direct sightings, bridge gossip and expiry.

use std::time::Duration;

use lanrelay_registry::Route;

use crate::harness::{link_addr, loopback_link, TestNode};

/// Two devices on one segment see each other directly.
#[tokio::test]
async fn test_direct_discovery() {
    let a_link = loopback_link("seg1");
    let b_link = loopback_link("seg1");
    let (a_addr, b_addr) = (link_addr(&a_link), link_addr(&b_link));

    let a = TestNode::start("alpha", vec![a_link.with_targets(vec![b_addr])]).await.unwrap();
    let b = TestNode::start("bravo", vec![b_link.with_targets(vec![a_addr])]).await.unwrap();

    let seen = a
        .wait_device(b.device_id, |d| d.is_direct(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(seen.device_name, "bravo");
    assert_eq!(seen.hop_count(), 0);
    assert_eq!(seen.group_id.as_deref(), Some("Public"));

    b.wait_device(a.device_id, |d| d.is_direct(), Duration::from_secs(5))
        .await
        .unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

/// A -- B(bridge) -- C: C learns A through B's gossip at two hops.
#[tokio::test]
async fn test_bridge_gossip_reaches_far_segment() {
    let a_link = loopback_link("seg1");
    let b_seg1 = loopback_link("seg1");
    let b_seg2 = loopback_link("seg2");
    let c_link = loopback_link("seg2");

    let a_addr = link_addr(&a_link);
    let b1_addr = link_addr(&b_seg1);
    let b2_addr = link_addr(&b_seg2);
    let c_addr = link_addr(&c_link);

    let a = TestNode::start("alpha", vec![a_link.with_targets(vec![b1_addr])]).await.unwrap();
    let b = TestNode::start(
        "bridge",
        vec![
            b_seg1.with_targets(vec![a_addr]),
            b_seg2.with_targets(vec![c_addr]),
        ],
    )
    .await
    .unwrap();
    let c = TestNode::start("charlie", vec![c_link.with_targets(vec![b2_addr])]).await.unwrap();

    // The bridge hears both ends directly
    b.wait_device(a.device_id, |d| d.is_direct(), Duration::from_secs(5))
        .await
        .unwrap();
    b.wait_device(c.device_id, |d| d.is_direct(), Duration::from_secs(5))
        .await
        .unwrap();

    let far = c
        .wait_device(a.device_id, |_| true, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        far.route,
        Route::Relayed {
            via: b.device_id,
            hops: 2
        }
    );
    let bridge = c
        .wait_device(b.device_id, |d| d.is_direct(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(far.ip, bridge.ip);

    // And the other way round
    let back = a
        .wait_device(c.device_id, |_| true, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(back.relay_device_id(), Some(b.device_id));

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

/// A device that stops broadcasting is swept out after the timeout.
#[tokio::test]
async fn test_silent_device_expires() {
    let a_link = loopback_link("seg1");
    let b_link = loopback_link("seg1");
    let (a_addr, b_addr) = (link_addr(&a_link), link_addr(&b_link));

    let a = TestNode::start("alpha", vec![a_link.with_targets(vec![b_addr])]).await.unwrap();
    let b = TestNode::start("bravo", vec![b_link.with_targets(vec![a_addr])]).await.unwrap();

    a.wait_device(b.device_id, |d| d.is_direct(), Duration::from_secs(5))
        .await
        .unwrap();

    let b_id = b.device_id;
    b.shutdown().await;
    a.wait_device_gone(b_id, Duration::from_secs(5)).await.unwrap();

    a.shutdown().await;
}

/// Devices in another group are visible but not in our current group.
#[tokio::test]
async fn test_current_group_filter() {
    let a_link = loopback_link("seg1");
    let b_link = loopback_link("seg1");
    let (a_addr, b_addr) = (link_addr(&a_link), link_addr(&b_link));

    let a = TestNode::start("alpha", vec![a_link.with_targets(vec![b_addr])]).await.unwrap();
    let b = TestNode::start_with(
        "bravo",
        vec![b_link.with_targets(vec![a_addr])],
        |cfg| {
            cfg.node.group = "Lab".into();
            cfg.groups.push(lanrelay_node::config::GroupEntry {
                id: "Lab".into(),
                password: Some("pw".into()),
            });
        },
        std::sync::Arc::new(lanrelay_transfer::Fs2DiskSpace),
    )
    .await
    .unwrap();

    assert_eq!(b.node.ctx.groups.current_group().await, "Lab");
    let seen = a
        .wait_device(b.device_id, |d| d.is_direct(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(seen.group_id.as_deref(), Some("Lab"));

    let mine = lanrelay_node::tables::devices_in_current_group(&a.node.ctx.devices, &a.node.ctx.groups).await;
    assert!(mine.iter().all(|d| d.device_id != b.device_id));
    assert_eq!(a.node.ctx.devices.devices_in_group("Lab").await.len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}
