// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Thin demo driver: builds the DIF/IPCP stack described by a scenario
//! (a built-in two-layer default, or a `--config` TOML file), wires the
//! bottom-layer link adapters, runs one reliable exchange between the
//! applications bound at the top layer, and prints a summary of DIF
//! bandwidth and flow statistics on exit. This binary is not part of
//! THE CORE; it exists only so the crate is runnable end to end.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio::time::{sleep, Duration};

use ari::{Application, CliArgs, Dif, ImpairedLink, Ipcp, IpcpId, LinkProfile, QoS, ScenarioConfig};

#[tokio::main]
async fn main() {
    println!("=== RINA (Recursive InterNetwork Architecture) simulation ===\n");

    let args = CliArgs::parse();
    let scenario = match ScenarioConfig::from_cli(&args) {
        Ok(scenario) => scenario,
        Err(err) => {
            eprintln!("failed to load scenario: {err}");
            std::process::exit(1);
        }
    };

    let mut difs: HashMap<String, Arc<Dif>> = HashMap::new();
    let mut ipcps: HashMap<IpcpId, Arc<Ipcp>> = HashMap::new();

    for dif_spec in &scenario.difs {
        let lower_dif = difs
            .values()
            .find(|dif| dif.layer + 1 == dif_spec.layer)
            .cloned();
        let dif = match lower_dif {
            Some(lower) => Dif::new_recursive(&dif_spec.name, dif_spec.layer, dif_spec.max_bandwidth, lower),
            None => Dif::new(&dif_spec.name, dif_spec.layer, dif_spec.max_bandwidth),
        };
        println!(
            "✓ DIF '{}' (layer {}, max_bandwidth {})",
            dif.name,
            dif.layer,
            dif.max_bandwidth()
        );

        for ipcp_spec in &dif_spec.ipcps {
            let lower_ipcp = ipcp_spec.lower_ipcp.and_then(|id| ipcps.get(&id).cloned());
            let ipcp = dif.create_ipcp(ipcp_spec.id, lower_ipcp);
            println!("  → IPCP {} joined {}", ipcp.id, dif.name);
            ipcps.insert(ipcp_spec.id, ipcp);
        }
        difs.insert(dif_spec.name.clone(), dif);
    }

    println!();
    for link_spec in &scenario.links {
        let (Some(from), Some(to)) = (ipcps.get(&link_spec.from_ipcp), ipcps.get(&link_spec.to_ipcp)) else {
            eprintln!("link references unknown IPCP, skipping");
            continue;
        };
        from.enroll(to.id);
        to.enroll(from.id);
        println!(
            "✓ enrolled IPCP {} ↔ {} over link profile {:?}",
            from.id, to.id, link_spec.profile
        );
    }

    let Some(top_dif) = scenario.difs.iter().max_by_key(|dif| dif.layer) else {
        println!("no DIFs configured, nothing to run");
        return;
    };
    let Some((src_spec, dest_spec)) = top_dif.ipcps.first().zip(top_dif.ipcps.get(1)) else {
        println!("top-layer DIF needs at least two IPCPs to run the demo exchange");
        return;
    };
    let src = Arc::clone(&ipcps[&src_spec.id]);
    let dest = Arc::clone(&ipcps[&dest_spec.id]);

    const DEMO_PORT: u16 = 5000;
    let app_src = Application::new("sender", Arc::downgrade(&src), DEMO_PORT);
    let app_dest = Application::new("receiver", Arc::downgrade(&dest), DEMO_PORT);
    app_src.clone().bind().expect("demo port free on sender IPCP");
    app_dest.clone().bind().expect("demo port free on receiver IPCP");

    println!("\n--- allocating a flow from IPCP {} to {} ---", src.id, dest.id);
    let flow = match src.allocate_flow(&dest, QoS::best_effort(), DEMO_PORT, DEMO_PORT).await {
        Ok(flow) => flow,
        Err(err) => {
            eprintln!("flow allocation failed: {err}");
            std::process::exit(1);
        }
    };

    if let Some(link_spec) = scenario.links.first() {
        if let Ok(profile) = link_spec.resolve_profile() {
            if let Some(lower_flow_id) = flow.lower_flow_id() {
                if let Some(bottom_flow) = src.lower_ipcp.as_ref().unwrap().get_flow(lower_flow_id).await {
                    bottom_flow.set_link(ImpairedLink::new(profile)).await;
                }
            } else {
                flow.set_link(ImpairedLink::new(profile)).await;
            }
        }
    }

    println!("--- sending a ping from {} to {} ---", src.id, dest.id);
    if let Err(err) = src.send_data(flow.id, b"ping".to_vec()).await {
        eprintln!("send failed: {err}");
    }

    sleep(Duration::from_millis(250)).await;

    println!("\n=== summary ===");
    for dif in difs.values() {
        println!(
            "DIF '{}': {}/{} Mbps allocated",
            dif.name,
            dif.allocated_bandwidth(),
            dif.max_bandwidth()
        );
    }
    let stats = flow.stats().await;
    println!(
        "flow {}: sent={} received={} acked={} retransmitted={}",
        flow.id, stats.sent_packets, stats.received_packets, stats.ack_packets, stats.retransmitted_packets
    );
    println!("receiver inbox: {:?}", app_dest.received().await);

    src.deallocate_flow(flow.id).await;
}
