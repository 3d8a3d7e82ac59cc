// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Error types for the RINA core.
//!
//! One variant per failure mode the core can produce, replacing the
//! string-based errors of the original simulation with structured,
//! matchable types.

use thiserror::Error;

use crate::ipcp::{FlowId, Port};

/// The error type for all fallible operations in this crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AriError {
    #[error("DIF {dif}: admission denied, requested {requested} but only {available} available")]
    AdmissionDenied {
        dif: String,
        requested: u32,
        available: u32,
    },

    #[error("flow allocation rejected by peer: {reason}")]
    AllocationRejected { reason: String },

    #[error("flow {flow_id} allocation timed out after {attempts} attempts")]
    AllocationTimeout { flow_id: FlowId, attempts: u32 },

    #[error("unknown flow {flow_id}")]
    UnknownFlow { flow_id: FlowId },

    #[error("flow {flow_id} invalid state: expected {expected}, got {actual}")]
    InvalidState {
        flow_id: FlowId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("application upcall on port {port} timed out")]
    ApplicationUpcallTimeout { port: Port },

    #[error("resource commit failed: {reason}")]
    ResourceCommitFailure { reason: String },

    #[error("port {port} is already bound")]
    PortOccupied { port: Port },

    #[error("no flow available to send on")]
    NoFlowAvailable,
}
