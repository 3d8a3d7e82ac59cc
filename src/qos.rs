// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Quality of Service descriptors carried by flows and their frames.

use serde::{Deserialize, Serialize};

/// Immutable QoS request attached to a flow.
///
/// `bandwidth = None` means the flow requests no reservation at all: it
/// MUST NOT trigger a bandwidth admission check in [`crate::dif::Dif`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QoS {
    /// Requested bandwidth in Mbps, or `None` for no reservation.
    pub bandwidth: Option<u32>,
    /// Maximum tolerable latency in milliseconds.
    pub latency_bound: Option<u32>,
    /// Desired reliability in `[0.0, 1.0]`.
    pub reliability: f64,
}

impl QoS {
    /// A QoS descriptor that reserves no bandwidth.
    pub fn best_effort() -> Self {
        Self {
            bandwidth: None,
            latency_bound: None,
            reliability: 1.0,
        }
    }

    /// A QoS descriptor requesting a specific bandwidth reservation.
    pub fn with_bandwidth(bandwidth: u32) -> Self {
        Self {
            bandwidth: Some(bandwidth),
            latency_bound: None,
            reliability: 1.0,
        }
    }
}

impl Default for QoS {
    fn default() -> Self {
        Self::best_effort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_effort_has_no_bandwidth() {
        assert_eq!(QoS::best_effort().bandwidth, None);
    }

    #[test]
    fn with_bandwidth_sets_reservation() {
        let qos = QoS::with_bandwidth(50);
        assert_eq!(qos.bandwidth, Some(50));
    }
}
