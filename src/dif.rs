// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Distributed IPC Facility (DIF) — bandwidth-bounded resource domain.
//!
//! A DIF admits bandwidth reservations for the flows crossing it and
//! tracks membership of the IPCPs that live at its layer. Per the design
//! notes, a DIF owns its IPCPs (strong references); an IPCP only weakly
//! references its containing DIF.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::ipcp::{Ipcp, IpcpId};

/// Named, bandwidth-bounded resource domain at one layer.
pub struct Dif {
    pub name: String,
    pub layer: u8,
    max_bandwidth: u32,
    allocated_bandwidth: Mutex<u32>,
    ipcps: Mutex<HashMap<IpcpId, Arc<Ipcp>>>,
    pub lower_dif: Option<Arc<Dif>>,
}

impl Dif {
    /// Creates a new, empty DIF with the given name and capacity.
    pub fn new(name: impl Into<String>, layer: u8, max_bandwidth: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            layer,
            max_bandwidth,
            allocated_bandwidth: Mutex::new(0),
            ipcps: Mutex::new(HashMap::new()),
            lower_dif: None,
        })
    }

    /// Creates a DIF stacked above `lower_dif` (layer > 0).
    pub fn new_recursive(
        name: impl Into<String>,
        layer: u8,
        max_bandwidth: u32,
        lower_dif: Arc<Dif>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            layer,
            max_bandwidth,
            allocated_bandwidth: Mutex::new(0),
            ipcps: Mutex::new(HashMap::new()),
            lower_dif: Some(lower_dif),
        })
    }

    /// Creates a new IPCP at this DIF, optionally using `lower_ipcp` as
    /// its underlying transport, and registers it under the DIF.
    pub fn create_ipcp(self: &Arc<Self>, id: IpcpId, lower_ipcp: Option<Arc<Ipcp>>) -> Arc<Ipcp> {
        let ipcp = Ipcp::new(id, Arc::downgrade(self), lower_ipcp);
        self.add_ipcp(Arc::clone(&ipcp));
        ipcp
    }

    pub fn add_ipcp(&self, ipcp: Arc<Ipcp>) {
        self.ipcps.lock().unwrap().insert(ipcp.id, ipcp);
    }

    pub fn remove_ipcp(&self, id: IpcpId) {
        self.ipcps.lock().unwrap().remove(&id);
    }

    pub fn get_ipcp(&self, id: IpcpId) -> Option<Arc<Ipcp>> {
        self.ipcps.lock().unwrap().get(&id).cloned()
    }

    pub fn ipcps(&self) -> Vec<Arc<Ipcp>> {
        self.ipcps.lock().unwrap().values().cloned().collect()
    }

    pub fn max_bandwidth(&self) -> u32 {
        self.max_bandwidth
    }

    pub fn allocated_bandwidth(&self) -> u32 {
        *self.allocated_bandwidth.lock().unwrap()
    }

    /// Atomically reserves `bandwidth`, succeeding only if the DIF has
    /// enough headroom. `bandwidth = None` is always a no-op success.
    pub fn allocate_bandwidth(&self, bandwidth: Option<u32>) -> bool {
        let Some(bandwidth) = bandwidth else {
            return true;
        };
        let mut allocated = self.allocated_bandwidth.lock().unwrap();
        if *allocated + bandwidth <= self.max_bandwidth {
            *allocated += bandwidth;
            true
        } else {
            false
        }
    }

    /// Releases a previously reserved amount, clamping at zero.
    pub fn release_bandwidth(&self, bandwidth: Option<u32>) {
        let Some(bandwidth) = bandwidth else {
            return;
        };
        let mut allocated = self.allocated_bandwidth.lock().unwrap();
        *allocated = allocated.saturating_sub(bandwidth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_respects_capacity() {
        let dif = Dif::new("d0", 0, 100);
        assert!(dif.allocate_bandwidth(Some(60)));
        assert!(dif.allocate_bandwidth(Some(40)));
        assert!(!dif.allocate_bandwidth(Some(1)));
        assert_eq!(dif.allocated_bandwidth(), 100);
    }

    #[test]
    fn none_bandwidth_is_always_admitted() {
        let dif = Dif::new("d0", 0, 0);
        assert!(dif.allocate_bandwidth(None));
        assert_eq!(dif.allocated_bandwidth(), 0);
    }

    #[test]
    fn release_clamps_at_zero() {
        let dif = Dif::new("d0", 0, 100);
        dif.release_bandwidth(Some(50));
        assert_eq!(dif.allocated_bandwidth(), 0);
    }

    #[test]
    fn allocate_then_release_is_net_zero() {
        let dif = Dif::new("d0", 0, 100);
        assert!(dif.allocate_bandwidth(Some(50)));
        dif.release_bandwidth(Some(50));
        assert_eq!(dif.allocated_bandwidth(), 0);
    }
}
