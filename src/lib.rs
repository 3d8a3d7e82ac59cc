// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! The core library for the ARI implementation.
//!
//! A Recursive InterNetwork Architecture simulation core: DIFs own
//! IPCPs, IPCPs allocate reliable sequenced flows (optionally stacked
//! recursively over a lower DIF's own flows), and applications bind to
//! ports to exchange data over those flows.

pub mod application;
pub mod config;
pub mod dif;
pub mod error;
pub mod flow;
pub mod frame;
pub mod ipcp;
pub mod link;
pub mod qos;
pub mod sequence;

pub use application::Application;
pub use config::{CliArgs, ScenarioConfig, ScenarioError};
pub use dif::Dif;
pub use error::AriError;
pub use flow::{Flow, FlowState, FrameEvent};
pub use frame::{Frame, FrameHeader, WireUnit};
pub use ipcp::{FlowId, Ipcp, IpcpId, Port};
pub use link::{ImpairedLink, LinkAdapter, LinkProfile, PerfectLink};
pub use qos::QoS;
pub use sequence::{SequenceNumber, SEQUENCE_MODULUS};
