// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Link impairment — simulates a lossy, bandwidth-bounded wire between
//! two bottom-layer IPCPs.
//!
//! A [`Flow`](crate::flow::Flow) that has no lower flow to ride on hands
//! its frames to a [`LinkAdapter`] instead of calling the destination
//! IPCP directly. [`ImpairedLink`] is the one production implementation,
//! a queue-and-background-task design mirroring the original
//! `NetworkConditions`/`_process_queue` simulation: bandwidth shaping,
//! then loss, then corruption, then latency/jitter, with an optional
//! reordering fast path.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::frame::{Frame, WireUnit};
use crate::ipcp::Ipcp;

/// Delivers a frame to its destination, possibly after simulated
/// network effects. Frame drops are silent, as in the original
/// simulation: the adapter never surfaces a delivery failure to the
/// caller, since on a real wire the sender has no signal either.
pub trait LinkAdapter: Send + Sync {
    fn send_frame(
        &self,
        dst: Arc<Ipcp>,
        frame: Frame,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Perfect link: immediate, lossless, in-order delivery. Used when no
/// impairment profile is configured for a hop.
pub struct PerfectLink;

impl LinkAdapter for PerfectLink {
    fn send_frame(&self, dst: Arc<Ipcp>, frame: Frame) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let _ = dst.receive_data(WireUnit::Bare(frame)).await;
        })
    }
}

/// Named impairment presets, reproduced from the original simulation's
/// `NETWORK_PROFILES` table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkProfile {
    pub latency_ms: u64,
    pub jitter_ms: u64,
    pub packet_loss_rate: f64,
    pub bandwidth_mbps: Option<u64>,
    pub corruption_rate: f64,
    pub reordering_rate: f64,
}

impl LinkProfile {
    pub const PERFECT: LinkProfile = LinkProfile {
        latency_ms: 0,
        jitter_ms: 0,
        packet_loss_rate: 0.0,
        bandwidth_mbps: None,
        corruption_rate: 0.0,
        reordering_rate: 0.0,
    };

    pub const LAN: LinkProfile = LinkProfile {
        latency_ms: 2,
        jitter_ms: 1,
        packet_loss_rate: 0.001,
        bandwidth_mbps: Some(1000),
        corruption_rate: 0.0001,
        reordering_rate: 0.001,
    };

    pub const WIFI: LinkProfile = LinkProfile {
        latency_ms: 5,
        jitter_ms: 3,
        packet_loss_rate: 0.005,
        bandwidth_mbps: Some(100),
        corruption_rate: 0.001,
        reordering_rate: 0.002,
    };

    pub const CONGESTED: LinkProfile = LinkProfile {
        latency_ms: 100,
        jitter_ms: 40,
        packet_loss_rate: 0.05,
        bandwidth_mbps: Some(10),
        corruption_rate: 0.005,
        reordering_rate: 0.01,
    };

    /// Looks up a profile by name, as used in scenario TOML files.
    pub fn by_name(name: &str) -> Option<LinkProfile> {
        match name {
            "perfect" => Some(Self::PERFECT),
            "lan" => Some(Self::LAN),
            "wifi" => Some(Self::WIFI),
            "congested" => Some(Self::CONGESTED),
            _ => None,
        }
    }
}

/// A link adapter that queues frames and applies bandwidth shaping,
/// loss, corruption, latency, jitter, and reordering before delivery.
pub struct ImpairedLink {
    profile: LinkProfile,
    sender: mpsc::UnboundedSender<(Arc<Ipcp>, Frame)>,
    bytes_sent: Arc<AtomicU64>,
    started_at: Instant,
}

impl ImpairedLink {
    pub fn new(profile: LinkProfile) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(Arc<Ipcp>, Frame)>();
        let bytes_sent = Arc::new(AtomicU64::new(0));
        let started_at = Instant::now();

        let link = Arc::new(Self {
            profile,
            sender,
            bytes_sent: Arc::clone(&bytes_sent),
            started_at,
        });

        let worker_profile = profile;
        let worker_bytes_sent = Arc::clone(&bytes_sent);
        tokio::spawn(async move {
            while let Some((dst, frame)) = receiver.recv().await {
                Self::process_one(worker_profile, &worker_bytes_sent, started_at, dst, frame).await;
            }
        });

        link
    }

    async fn process_one(
        profile: LinkProfile,
        bytes_sent: &AtomicU64,
        started_at: Instant,
        dst: Arc<Ipcp>,
        frame: Frame,
    ) {
        let encoded = match postcard::to_allocvec(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                eprintln!("link: dropped a frame that failed to encode: {err}");
                return;
            }
        };

        if let Some(bandwidth_mbps) = profile.bandwidth_mbps {
            let packet_bits = (encoded.len() * 8) as f64;
            let total_bits_per_sec = bandwidth_mbps as f64 * 1_000_000.0;
            let sent_so_far = bytes_sent.fetch_add(encoded.len() as u64, Ordering::Relaxed) + encoded.len() as u64;
            let expected_elapsed = (sent_so_far as f64 * 8.0) / total_bits_per_sec;
            let elapsed = started_at.elapsed().as_secs_f64();
            let _ = packet_bits;
            if expected_elapsed > elapsed {
                sleep(Duration::from_secs_f64(expected_elapsed - elapsed)).await;
            }
        }

        if rand::rng().random::<f64>() < profile.packet_loss_rate {
            return;
        }

        let mut frame = frame;
        if rand::rng().random::<f64>() < profile.corruption_rate {
            frame = corrupt(frame, &encoded);
        }

        let mut latency = profile.latency_ms as f64 / 1000.0;
        if profile.jitter_ms > 0 {
            let jitter_s = profile.jitter_ms as f64 / 1000.0;
            latency += rand::rng().random_range(-jitter_s..jitter_s);
        }
        latency = latency.max(0.0);

        if rand::rng().random::<f64>() < profile.reordering_rate {
            let reorder_delay = latency * 0.5;
            tokio::spawn(async move {
                sleep(Duration::from_secs_f64(reorder_delay)).await;
                let _ = dst.receive_data(WireUnit::Bare(frame)).await;
            });
        } else {
            sleep(Duration::from_secs_f64(latency)).await;
            let _ = dst.receive_data(WireUnit::Bare(frame)).await;
        }
    }
}

/// Flips one random byte of the frame's wire encoding, decoding back
/// into a (still structurally valid) frame when possible. A corrupted
/// frame that fails to decode is dropped, mirroring a bit error
/// garbling the packet beyond recognition.
fn corrupt(original: Frame, encoded: &[u8]) -> Frame {
    if encoded.is_empty() {
        return original;
    }
    let mut corrupted = encoded.to_vec();
    let pos = rand::rng().random_range(0..corrupted.len());
    let flip = rand::rng().random_range(1u8..=255);
    corrupted[pos] ^= flip;
    postcard::from_bytes(&corrupted).unwrap_or(original)
}

impl LinkAdapter for ImpairedLink {
    fn send_frame(&self, dst: Arc<Ipcp>, frame: Frame) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let _ = self.sender.send((dst, frame));
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_by_name_matches_known_presets() {
        assert_eq!(LinkProfile::by_name("perfect"), Some(LinkProfile::PERFECT));
        assert_eq!(LinkProfile::by_name("congested"), Some(LinkProfile::CONGESTED));
        assert_eq!(LinkProfile::by_name("nonexistent"), None);
    }

    #[test]
    fn perfect_profile_has_no_impairment() {
        let profile = LinkProfile::PERFECT;
        assert_eq!(profile.packet_loss_rate, 0.0);
        assert_eq!(profile.bandwidth_mbps, None);
    }
}
