// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Scenario configuration: command-line arguments and the TOML shape
//! describing the DIFs, IPCPs, and link profiles a run should set up.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ipcp::IpcpId;
use crate::link::LinkProfile;

/// Command-line entry point for the demo binary.
#[derive(Parser, Debug)]
#[command(name = "ari-rina")]
#[command(author = "ARI Contributors")]
#[command(version = "0.1.0")]
#[command(about = "RINA DIF/IPCP simulation runner", long_about = None)]
pub struct CliArgs {
    /// Path to a scenario TOML file; falls back to a small built-in
    /// two-layer scenario when omitted.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Named link profile to apply to every link that doesn't specify
    /// its own, overriding whatever the scenario file says.
    #[arg(long, value_name = "PROFILE")]
    pub profile_override: Option<String>,
}

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("failed to read scenario file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown link profile {0:?}")]
    UnknownProfile(String),
}

/// One IPCP within a DIF, optionally stacked over an IPCP at the layer
/// below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcpSpec {
    pub id: IpcpId,
    #[serde(default)]
    pub lower_ipcp: Option<IpcpId>,
}

/// A DIF and the IPCPs that populate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifSpec {
    pub name: String,
    #[serde(default)]
    pub layer: u8,
    pub max_bandwidth: u32,
    pub ipcps: Vec<IpcpSpec>,
}

/// Impairment applied to the physical link between two bottom-layer IPCPs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    pub from_ipcp: IpcpId,
    pub to_ipcp: IpcpId,
    pub profile: String,
}

impl LinkSpec {
    pub fn resolve_profile(&self) -> Result<LinkProfile, ScenarioError> {
        LinkProfile::by_name(&self.profile).ok_or_else(|| ScenarioError::UnknownProfile(self.profile.clone()))
    }
}

/// The full description of a scenario: the DIF stack and the link
/// impairments between its bottom-layer IPCPs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub difs: Vec<DifSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl ScenarioConfig {
    /// Loads a scenario from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let contents = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ScenarioError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves CLI arguments into a scenario: loads the configured
    /// file, or falls back to [`ScenarioConfig::two_layer_default`].
    pub fn from_cli(args: &CliArgs) -> Result<Self, ScenarioError> {
        let mut scenario = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::two_layer_default(),
        };
        if let Some(profile) = &args.profile_override {
            for link in &mut scenario.links {
                link.profile = profile.clone();
            }
        }
        Ok(scenario)
    }

    /// A small built-in scenario: one application-facing DIF stacked
    /// over one bottom DIF, two IPCPs each, connected by a LAN-grade link.
    pub fn two_layer_default() -> Self {
        Self {
            difs: vec![
                DifSpec {
                    name: "shim-dif".to_string(),
                    layer: 0,
                    max_bandwidth: 1_000,
                    ipcps: vec![IpcpSpec { id: 1, lower_ipcp: None }, IpcpSpec { id: 2, lower_ipcp: None }],
                },
                DifSpec {
                    name: "app-dif".to_string(),
                    layer: 1,
                    max_bandwidth: 1_000,
                    ipcps: vec![
                        IpcpSpec { id: 11, lower_ipcp: Some(1) },
                        IpcpSpec { id: 12, lower_ipcp: Some(2) },
                    ],
                },
            ],
            links: vec![LinkSpec {
                from_ipcp: 1,
                to_ipcp: 2,
                profile: "lan".to_string(),
            }],
        }
    }
}
