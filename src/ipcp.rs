// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! IPC Process — the per-DIF entity that allocates flows, binds
//! applications to ports, and forwards data up and down the recursive
//! stack.
//!
//! An `Ipcp` weakly references the [`Dif`] that owns it (the DIF holds
//! the strong `Arc`), strongly references the `lower_ipcp` it rides on
//! (forming a DAG by layer), and weakly back-references its
//! `higher_ipcp` once one registers it as its transport. Flows are
//! registered under the *same* [`FlowId`] in both endpoint IPCPs' flow
//! tables, sharing one `Arc<Flow>` rather than two synchronized copies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use crate::application::Application;
use crate::dif::Dif;
use crate::error::AriError;
use crate::flow::{Flow, FlowConfig};
use crate::frame::{Frame, WireUnit};
use crate::qos::QoS;

pub type IpcpId = u64;
pub type FlowId = u64;
pub type Port = u16;

/// Timeout applied to an application's upcall delivery, mirroring the
/// simulation's 500ms bound on how long a blocked `on_data` may stall
/// the delivering IPCP.
pub const APPLICATION_UPCALL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Ipcp {
    pub id: IpcpId,
    dif: Weak<Dif>,
    pub lower_ipcp: Option<Arc<Ipcp>>,
    higher_ipcp: Mutex<Option<Weak<Ipcp>>>,
    flows: AsyncMutex<HashMap<FlowId, Arc<Flow>>>,
    port_map: Mutex<HashMap<Port, Arc<Application>>>,
    neighbors: Mutex<HashSet<IpcpId>>,
    next_flow_id: AtomicU64,
}

impl Ipcp {
    pub(crate) fn new(id: IpcpId, dif: Weak<Dif>, lower_ipcp: Option<Arc<Ipcp>>) -> Arc<Self> {
        let ipcp = Arc::new(Self {
            id,
            dif,
            lower_ipcp: lower_ipcp.clone(),
            higher_ipcp: Mutex::new(None),
            flows: AsyncMutex::new(HashMap::new()),
            port_map: Mutex::new(HashMap::new()),
            neighbors: Mutex::new(HashSet::new()),
            next_flow_id: AtomicU64::new(1),
        });
        if let Some(lower) = &lower_ipcp {
            *lower.higher_ipcp.lock().unwrap() = Some(Arc::downgrade(&ipcp));
        }
        ipcp
    }

    pub fn dif(&self) -> Option<Arc<Dif>> {
        self.dif.upgrade()
    }

    /// Registers `neighbor` as directly reachable, the pairwise
    /// equivalent of the enrollment protocol's membership step.
    pub fn enroll(&self, neighbor: IpcpId) {
        self.neighbors.lock().unwrap().insert(neighbor);
    }

    pub fn is_enrolled_with(&self, neighbor: IpcpId) -> bool {
        self.neighbors.lock().unwrap().contains(&neighbor)
    }

    /// Binds `application` to `port`, failing if the port is already in use.
    pub fn bind_application(
        &self,
        port: Port,
        application: Arc<Application>,
    ) -> Result<(), AriError> {
        let mut port_map = self.port_map.lock().unwrap();
        if port_map.contains_key(&port) {
            return Err(AriError::PortOccupied { port });
        }
        port_map.insert(port, application);
        Ok(())
    }

    pub fn application_at(&self, port: Port) -> Option<Arc<Application>> {
        self.port_map.lock().unwrap().get(&port).cloned()
    }

    fn allocate_flow_id(&self) -> FlowId {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a flow from `self` to `dest`, recursing into the lower
    /// IPCP (if any) to obtain the transport this flow will ride on, on
    /// the same ports with the same QoS so the lower-layer reservation
    /// actually contends for the same bandwidth budget. Mirrors the flow
    /// id into both endpoints' flow tables under one shared `Arc<Flow>`,
    /// rolling back admission on failure.
    ///
    /// Bandwidth is reserved in `self`'s DIF and, if `dest` lives in a
    /// distinct DIF, there too; either failing reservation rolls back
    /// whatever already succeeded. A failure at the lower layer (e.g.
    /// the lower DIF has no headroom left) rolls back this layer's
    /// reservation too, so the upper-layer allocation fails cleanly.
    pub async fn allocate_flow(
        self: &Arc<Self>,
        dest: &Arc<Ipcp>,
        qos: QoS,
        src_port: Port,
        dest_port: Port,
    ) -> Result<Arc<Flow>, AriError> {
        self.allocate_flow_inner(dest, qos, src_port, dest_port, false).await
    }

    /// Shared implementation behind [`Ipcp::allocate_flow`]. `is_transport`
    /// marks a flow created purely to carry a higher layer's encapsulated
    /// frames (the recursive lower-layer call below always sets it) as
    /// opposed to an application-facing flow (the public entry point
    /// always leaves it `false`), so delivery can tell the two apart
    /// without relying on the ports, which may legitimately collide
    /// (port `0` is a bindable application port like any other).
    async fn allocate_flow_inner(
        self: &Arc<Self>,
        dest: &Arc<Ipcp>,
        qos: QoS,
        src_port: Port,
        dest_port: Port,
        is_transport: bool,
    ) -> Result<Arc<Flow>, AriError> {
        let src_dif = self.dif().ok_or_else(|| AriError::ResourceCommitFailure {
            reason: "owning DIF no longer exists".to_string(),
        })?;
        let dest_dif = dest.dif();
        let distinct_dest_dif = match &dest_dif {
            Some(dest_dif) => !Arc::ptr_eq(&src_dif, dest_dif),
            None => false,
        };

        if !src_dif.allocate_bandwidth(qos.bandwidth) {
            return Err(AriError::AdmissionDenied {
                dif: src_dif.name.clone(),
                requested: qos.bandwidth.unwrap_or(0),
                available: src_dif.max_bandwidth() - src_dif.allocated_bandwidth(),
            });
        }
        if distinct_dest_dif {
            let dest_dif = dest_dif.as_ref().unwrap();
            if !dest_dif.allocate_bandwidth(qos.bandwidth) {
                src_dif.release_bandwidth(qos.bandwidth);
                return Err(AriError::AdmissionDenied {
                    dif: dest_dif.name.clone(),
                    requested: qos.bandwidth.unwrap_or(0),
                    available: dest_dif.max_bandwidth() - dest_dif.allocated_bandwidth(),
                });
            }
        }

        let lower_flow_id = if let (Some(lower_self), Some(lower_dest)) =
            (&self.lower_ipcp, &dest.lower_ipcp)
        {
            match Box::pin(lower_self.allocate_flow_inner(lower_dest, qos, src_port, dest_port, true)).await {
                Ok(lower_flow) => Some(lower_flow.id),
                Err(err) => {
                    src_dif.release_bandwidth(qos.bandwidth);
                    if distinct_dest_dif {
                        dest_dif.as_ref().unwrap().release_bandwidth(qos.bandwidth);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let flow_id = self.allocate_flow_id();
        let flow = Flow::new(FlowConfig {
            id: flow_id,
            src_ipcp: Arc::downgrade(self),
            dest_ipcp: Arc::downgrade(dest),
            src_port,
            dest_port,
            qos,
            lower_flow_id,
            is_transport,
        });

        self.flows.lock().await.insert(flow_id, Arc::clone(&flow));
        dest.flows.lock().await.insert(flow_id, Arc::clone(&flow));

        if let Err(err) = flow.commit_resources().await {
            self.flows.lock().await.remove(&flow_id);
            dest.flows.lock().await.remove(&flow_id);
            src_dif.release_bandwidth(qos.bandwidth);
            if distinct_dest_dif {
                dest_dif.as_ref().unwrap().release_bandwidth(qos.bandwidth);
            }
            if let Some(lower_flow_id) = lower_flow_id {
                if let Some(lower) = &self.lower_ipcp {
                    let _ = lower.deallocate_flow(lower_flow_id).await;
                }
            }
            return Err(err);
        }

        Ok(flow)
    }

    pub async fn get_flow(&self, flow_id: FlowId) -> Option<Arc<Flow>> {
        self.flows.lock().await.get(&flow_id).cloned()
    }

    /// Returns an arbitrary open flow id, used by applications that just
    /// want to send on whatever flow they already have.
    pub async fn first_flow_id(&self) -> Option<FlowId> {
        self.flows.lock().await.keys().next().copied()
    }

    /// Finds an already-open flow from this IPCP to `(dest_ipcp, dest_port)`.
    pub async fn find_flow_to(&self, dest_ipcp: IpcpId, dest_port: Port) -> Option<FlowId> {
        self.flows
            .lock()
            .await
            .values()
            .find(|flow| flow.dest_ipcp_id() == Some(dest_ipcp) && flow.dest_port == dest_port)
            .map(|flow| flow.id)
    }

    /// Tears down a flow: releases its DIF bandwidth reservation on both
    /// endpoints and removes it from both endpoints' flow tables in one
    /// pass, per the mirrored-registration invariant (testable property
    /// D: a deallocated flow is absent from both sides, bandwidth
    /// returned on both sides). Idempotent: returns `true` the first
    /// time a given flow id is torn down and `false` on every call
    /// after (unknown flow, or already removed by a concurrent call).
    pub async fn deallocate_flow(self: &Arc<Self>, flow_id: FlowId) -> bool {
        let flow = match self.flows.lock().await.remove(&flow_id) {
            Some(flow) => flow,
            None => return false,
        };

        let peer = if flow.owns_src(self) {
            flow.dest_ipcp()
        } else {
            flow.src_ipcp()
        };
        if let Some(peer) = &peer {
            if !Arc::ptr_eq(peer, self) {
                peer.flows.lock().await.remove(&flow_id);
            }
        }

        flow.deallocate().await;

        if let Some(dif) = self.dif() {
            dif.release_bandwidth(flow.qos.bandwidth);
        }
        if let Some(peer) = &peer {
            if let Some(peer_dif) = peer.dif() {
                if !self.dif().is_some_and(|self_dif| Arc::ptr_eq(&self_dif, &peer_dif)) {
                    peer_dif.release_bandwidth(flow.qos.bandwidth);
                }
            }
        }
        true
    }

    /// Sends `data` on `flow_id` reliably, handing the resulting wire
    /// unit to the lower IPCP (recursive send) or, at the bottom layer,
    /// delivering it directly to the peer IPCP's `receive_data`.
    pub async fn send_data(
        self: &Arc<Self>,
        flow_id: FlowId,
        data: Vec<u8>,
    ) -> Result<(), AriError> {
        let flow = self
            .get_flow(flow_id)
            .await
            .ok_or(AriError::UnknownFlow { flow_id })?;
        flow.send_data(self, data).await
    }

    /// Delivers a wire unit addressed to this IPCP: either hands it to a
    /// terminal flow, or, if it is encapsulated, strips one header and
    /// forwards the payload to the IPCP above.
    pub async fn receive_data(self: &Arc<Self>, unit: WireUnit) -> Result<(), AriError> {
        match unit {
            WireUnit::Bare(frame) => self.dispatch_frame_to_flow(frame).await,
            WireUnit::Encapsulated { header, payload } => {
                let higher = self.higher_ipcp.lock().unwrap().clone();
                match higher.and_then(|weak| weak.upgrade()) {
                    Some(higher) => {
                        let frame = payload.into_bare().ok_or_else(|| AriError::MalformedFrame {
                            reason: "double-encapsulated unit at terminal layer".to_string(),
                        })?;
                        higher.deliver_encapsulated(header.flow_id, frame).await
                    }
                    None => Err(AriError::MalformedFrame {
                        reason: "encapsulated unit with no higher IPCP registered".to_string(),
                    }),
                }
            }
        }
    }

    /// Entry point used when the lower IPCP has already identified which
    /// flow the decapsulated frame belongs to.
    async fn deliver_encapsulated(
        self: &Arc<Self>,
        flow_id: FlowId,
        frame: Frame,
    ) -> Result<(), AriError> {
        let flow = self
            .get_flow(flow_id)
            .await
            .ok_or(AriError::UnknownFlow { flow_id })?;
        flow.receive_frame(self, frame).await
    }

    /// At the bottom of the stack a bare frame carries no flow id of its
    /// own; it must have arrived as the direct payload of a flow's send,
    /// so every currently open flow gets a chance to recognize it.
    async fn dispatch_frame_to_flow(self: &Arc<Self>, frame: Frame) -> Result<(), AriError> {
        let flows: Vec<Arc<Flow>> = self.flows.lock().await.values().cloned().collect();
        for flow in flows {
            if flow.owns_src(self) || flow.owns_dest(self) {
                return flow.receive_frame(self, frame).await;
            }
        }
        Err(AriError::NoFlowAvailable)
    }

    /// Delivers payload bytes to the application bound at `port`,
    /// bounding the upcall so a stalled application can't block the IPCP
    /// indefinitely.
    pub async fn deliver_to_application(&self, port: Port, data: Vec<u8>) -> Result<(), AriError> {
        let application = self
            .application_at(port)
            .ok_or(AriError::ApplicationUpcallTimeout { port })?;
        timeout(APPLICATION_UPCALL_TIMEOUT, application.on_data(data))
            .await
            .map_err(|_| AriError::ApplicationUpcallTimeout { port })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_application_rejects_duplicate_port() {
        let dif = Dif::new("d0", 0, 100);
        let ipcp = dif.create_ipcp(1, None);
        let app1 = Application::new("a1", Arc::downgrade(&ipcp), 9000);
        let app2 = Application::new("a2", Arc::downgrade(&ipcp), 9000);

        ipcp.bind_application(9000, app1).unwrap();
        let result = ipcp.bind_application(9000, app2);
        assert_eq!(result, Err(AriError::PortOccupied { port: 9000 }));
    }

    #[test]
    fn enrollment_is_pairwise_and_queryable() {
        let dif = Dif::new("d0", 0, 100);
        let a = dif.create_ipcp(1, None);
        a.enroll(2);
        assert!(a.is_enrolled_with(2));
        assert!(!a.is_enrolled_with(3));
    }
}
