// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Frame shapes exchanged between flows and, recursively, between IPCPs.
//!
//! A [`Frame`] is either a data frame or a cumulative ACK. When a flow's
//! `lower_flow_id` is set, the frame is wrapped once more in an
//! [`Encapsulated`] envelope carrying `{flow_id, qos}` so the lower IPCP
//! can demultiplex upward without understanding the payload.

use serde::{Deserialize, Serialize};

use crate::ipcp::FlowId;
use crate::qos::QoS;

/// A data or acknowledgment frame traveling on one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Carries one sequenced payload.
    Data { seq_num: u16, data: Vec<u8> },
    /// Cumulative acknowledgment of the highest in-order sequence received.
    Ack { ack_seq_num: u16 },
}

/// Header prepended when a frame is encapsulated to travel over a
/// lower-layer flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub flow_id: FlowId,
    pub qos: Option<QoS>,
}

/// The wire unit actually handed to a lower IPCP's `send_data`, or
/// received back from it: either a bare frame (terminal layer) or a
/// frame wrapped with the header of the layer above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireUnit {
    Bare(Frame),
    Encapsulated {
        header: FrameHeader,
        payload: Box<WireUnit>,
    },
}

impl WireUnit {
    pub fn encapsulate(self, flow_id: FlowId, qos: Option<QoS>) -> Self {
        WireUnit::Encapsulated {
            header: FrameHeader { flow_id, qos },
            payload: Box::new(self),
        }
    }

    /// Strips exactly one encapsulation layer, returning the header and
    /// the inner unit. Returns `None` if this is already a bare frame.
    pub fn decapsulate(self) -> Option<(FrameHeader, WireUnit)> {
        match self {
            WireUnit::Encapsulated { header, payload } => Some((header, *payload)),
            WireUnit::Bare(_) => None,
        }
    }

    pub fn into_bare(self) -> Option<Frame> {
        match self {
            WireUnit::Bare(frame) => Some(frame),
            WireUnit::Encapsulated { .. } => None,
        }
    }
}
