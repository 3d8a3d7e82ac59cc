// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! End-to-end scenarios against THE CORE: flow allocation, reliable
//! transport, and recursive encapsulation, run in combination rather
//! than unit by unit.

use std::sync::Arc;
use std::time::Duration;

use ari::{Application, Dif, ImpairedLink, LinkProfile, QoS};
use tokio::time::sleep;

const APP_PORT: u16 = 5000;

/// Scenario 1: a basic two-IPCP flow delivers one payload exactly once
/// and leaves the DIF's bandwidth untouched after teardown.
#[tokio::test]
async fn basic_two_ipcp_flow_delivers_and_tears_down_cleanly() {
    let d0 = Dif::new("D0", 0, 1000);
    let a = d0.create_ipcp(1, None);
    let b = d0.create_ipcp(2, None);
    a.enroll(b.id);
    b.enroll(a.id);

    let app_a = Application::new("appA", Arc::downgrade(&a), APP_PORT);
    let app_b = Application::new("appB", Arc::downgrade(&b), APP_PORT);
    app_a.clone().bind().unwrap();
    app_b.clone().bind().unwrap();

    let flow = a.allocate_flow(&b, QoS::best_effort(), APP_PORT, APP_PORT).await.unwrap();
    a.send_data(flow.id, b"hello".to_vec()).await.unwrap();
    tokio::task::yield_now().await;

    assert_eq!(app_b.received().await, vec![b"hello".to_vec()]);

    assert!(a.deallocate_flow(flow.id).await);
    assert_eq!(d0.allocated_bandwidth(), 0);
    assert!(a.get_flow(flow.id).await.is_none());
    assert!(b.get_flow(flow.id).await.is_none());
}

/// Scenario 2: bandwidth admission saturates exactly at `max_bandwidth`
/// and a released reservation frees headroom for a later allocation.
#[tokio::test]
async fn qos_bounded_allocation_saturates_and_recovers() {
    let d0 = Dif::new("D0", 0, 100);
    let a = d0.create_ipcp(1, None);
    let b = d0.create_ipcp(2, None);

    let flow1 = a.allocate_flow(&b, QoS::with_bandwidth(50), 1, 1).await.unwrap();
    let flow2 = a.allocate_flow(&b, QoS::with_bandwidth(50), 2, 2).await.unwrap();
    assert_eq!(d0.allocated_bandwidth(), 100);

    let result = a.allocate_flow(&b, QoS::with_bandwidth(1), 3, 3).await;
    assert!(result.is_err());

    assert!(a.deallocate_flow(flow1.id).await);
    let flow3 = a.allocate_flow(&b, QoS::with_bandwidth(50), 4, 4).await.unwrap();
    assert_eq!(d0.allocated_bandwidth(), 100);

    assert!(a.deallocate_flow(flow2.id).await);
    assert!(a.deallocate_flow(flow3.id).await);
    assert_eq!(d0.allocated_bandwidth(), 0);
}

/// Scenario 3: a two-layer recursive stack. Allocating at the top layer
/// transparently allocates a carrying flow at the bottom layer, and
/// sending at the top traverses the bottom layer's encapsulation.
#[tokio::test]
async fn recursive_two_layer_send_reaches_the_bound_application() {
    let d0 = Dif::new("shim", 0, 1000);
    let a0 = d0.create_ipcp(1, None);
    let b0 = d0.create_ipcp(2, None);
    a0.enroll(b0.id);
    b0.enroll(a0.id);

    let d1 = Dif::new_recursive("app-dif", 1, 1000, Arc::clone(&d0));
    let a1 = d1.create_ipcp(11, Some(Arc::clone(&a0)));
    let b1 = d1.create_ipcp(12, Some(Arc::clone(&b0)));
    a1.enroll(b1.id);
    b1.enroll(a1.id);

    let app_b1 = Application::new("appB1", Arc::downgrade(&b1), APP_PORT);
    app_b1.clone().bind().unwrap();

    let flow = a1.allocate_flow(&b1, QoS::best_effort(), APP_PORT, APP_PORT).await.unwrap();
    assert!(flow.lower_flow_id().is_some(), "top-layer flow must carry a lower_flow_id");

    a1.send_data(flow.id, b"over-shim".to_vec()).await.unwrap();
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(app_b1.received().await, vec![b"over-shim".to_vec()]);
}

/// Scenario 3b: a lower-layer allocation failure (the shim DIF has no
/// bandwidth left) rolls back the upper-layer reservation too, so the
/// top-layer `allocate_flow` fails cleanly with no partial state left
/// behind on either DIF.
#[tokio::test]
async fn recursive_allocation_rolls_back_when_lower_layer_is_saturated() {
    let d0 = Dif::new("shim", 0, 100);
    let a0 = d0.create_ipcp(1, None);
    let b0 = d0.create_ipcp(2, None);
    a0.enroll(b0.id);
    b0.enroll(a0.id);

    // Saturate the shim DIF with an unrelated flow so the recursive
    // lower-layer allocation below has no headroom left.
    let saturating_flow = a0.allocate_flow(&b0, QoS::with_bandwidth(100), 1, 1).await.unwrap();
    assert_eq!(d0.allocated_bandwidth(), 100);

    let d1 = Dif::new_recursive("app-dif", 1, 1000, Arc::clone(&d0));
    let a1 = d1.create_ipcp(11, Some(Arc::clone(&a0)));
    let b1 = d1.create_ipcp(12, Some(Arc::clone(&b0)));
    a1.enroll(b1.id);
    b1.enroll(a1.id);

    let result = a1.allocate_flow(&b1, QoS::with_bandwidth(50), APP_PORT, APP_PORT).await;
    assert!(result.is_err(), "allocation must fail when the lower layer can't admit the same reservation");

    assert_eq!(d1.allocated_bandwidth(), 0, "the upper-layer reservation must be rolled back");
    assert_eq!(d0.allocated_bandwidth(), 100, "the lower DIF must be left exactly as it was");

    assert!(a0.deallocate_flow(saturating_flow.id).await);
}

/// Scenario 4: a 50% packet-loss link still delivers every payload, in
/// order, via retransmission; bandwidth accounting is unaffected by the
/// impairment. Runs on a paused clock so the retransmission timers fire
/// deterministically fast regardless of wall-clock time; packet loss
/// itself stays genuinely random.
#[tokio::test(start_paused = true)]
async fn lossy_link_retransmits_until_all_payloads_arrive() {
    let d0 = Dif::new("D0", 0, 1000);
    let a = d0.create_ipcp(1, None);
    let b = d0.create_ipcp(2, None);

    let app_b = Application::new("appB", Arc::downgrade(&b), APP_PORT);
    app_b.clone().bind().unwrap();

    let flow = a.allocate_flow(&b, QoS::best_effort(), APP_PORT, APP_PORT).await.unwrap();
    let lossy = ImpairedLink::new(LinkProfile {
        latency_ms: 0,
        jitter_ms: 0,
        packet_loss_rate: 0.5,
        bandwidth_mbps: None,
        corruption_rate: 0.0,
        reordering_rate: 0.0,
    });
    flow.set_link(lossy).await;

    const N: usize = 100;
    for i in 0..N {
        a.send_data(flow.id, vec![i as u8]).await.unwrap();
    }

    // Give retransmission many virtual rounds to work through the loss;
    // the paused clock fast-forwards through every intervening sleep.
    sleep(Duration::from_secs(120)).await;

    let received = app_b.received().await;
    let expected: Vec<Vec<u8>> = (0..N).map(|i| vec![i as u8]).collect();
    assert_eq!(received, expected);

    let stats = flow.stats().await;
    assert!(stats.retransmitted_packets > 0);
    assert_eq!(d0.allocated_bandwidth(), 0);
}

/// Scenario 5: a link that reorders every frame still yields a gapless,
/// in-order delivery sequence at the application.
#[tokio::test(start_paused = true)]
async fn reordering_link_still_delivers_in_order() {
    let d0 = Dif::new("D0", 0, 1000);
    let a = d0.create_ipcp(1, None);
    let b = d0.create_ipcp(2, None);

    let app_b = Application::new("appB", Arc::downgrade(&b), APP_PORT);
    app_b.clone().bind().unwrap();

    let flow = a.allocate_flow(&b, QoS::best_effort(), APP_PORT, APP_PORT).await.unwrap();
    let reordering = ImpairedLink::new(LinkProfile {
        latency_ms: 20,
        jitter_ms: 0,
        packet_loss_rate: 0.0,
        bandwidth_mbps: None,
        corruption_rate: 0.0,
        reordering_rate: 1.0,
    });
    flow.set_link(reordering).await;

    const N: usize = 10;
    for i in 0..N {
        a.send_data(flow.id, vec![i as u8]).await.unwrap();
    }

    sleep(Duration::from_secs(30)).await;

    let received = app_b.received().await;
    let expected: Vec<Vec<u8>> = (0..N).map(|i| vec![i as u8]).collect();
    assert_eq!(received, expected);
}

/// Scenario 6: issuing `deallocate_flow` twice in quick succession is
/// idempotent — the flow disappears from both endpoints exactly once,
/// and bandwidth returns to zero regardless of how many times teardown
/// is requested.
#[tokio::test]
async fn deallocate_flow_is_idempotent_under_repeated_calls() {
    let d0 = Dif::new("D0", 0, 1000);
    let a = d0.create_ipcp(1, None);
    let b = d0.create_ipcp(2, None);

    let flow = a.allocate_flow(&b, QoS::with_bandwidth(10), 1, 1).await.unwrap();
    let flow_id = flow.id;

    let (first, second) = tokio::join!(a.deallocate_flow(flow_id), a.deallocate_flow(flow_id));
    assert_ne!(first, second, "exactly one concurrent deallocate call must win");
    assert!(first || second);

    assert!(a.get_flow(flow_id).await.is_none());
    assert!(b.get_flow(flow_id).await.is_none());
    assert_eq!(d0.allocated_bandwidth(), 0);
}
