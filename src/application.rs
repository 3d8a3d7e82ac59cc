// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Applications — the user-facing endpoints bound to an IPCP's ports.
//!
//! An application weakly references its `Ipcp` (the IPCP's port map
//! holds the strong `Arc`), so a bound application never keeps its IPCP
//! alive past the IPCP's own lifetime.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::error::AriError;
use crate::ipcp::{Ipcp, Port};
use crate::qos::QoS;

/// A named endpoint bound to a single port on one IPCP.
pub struct Application {
    pub name: String,
    ipcp: Weak<Ipcp>,
    pub port: Port,
    receive_buffer: Mutex<Vec<Vec<u8>>>,
}

impl Application {
    pub fn new(name: impl Into<String>, ipcp: Weak<Ipcp>, port: Port) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ipcp,
            port,
            receive_buffer: Mutex::new(Vec::new()),
        })
    }

    fn ipcp(&self) -> Result<Arc<Ipcp>, AriError> {
        self.ipcp.upgrade().ok_or(AriError::ApplicationUpcallTimeout { port: self.port })
    }

    /// Binds this application to its port on its owning IPCP.
    pub fn bind(self: &Arc<Self>) -> Result<(), AriError> {
        self.ipcp()?.bind_application(self.port, Arc::clone(self))
    }

    /// Handles data delivered upward by the owning IPCP. Echoes `pong`
    /// for a `ping` payload, the canonical liveness-check exchange used
    /// by the worked scenarios.
    pub async fn on_data(self: &Arc<Self>, data: Vec<u8>) -> Result<(), AriError> {
        let is_ping = data == b"ping";
        self.receive_buffer.lock().await.push(data);
        if is_ping {
            self.send(b"pong".to_vec()).await?;
        }
        Ok(())
    }

    pub async fn received(&self) -> Vec<Vec<u8>> {
        self.receive_buffer.lock().await.clone()
    }

    /// Sends on whatever flow is already open from this application's
    /// IPCP, failing if none exists.
    pub async fn send(self: &Arc<Self>, data: Vec<u8>) -> Result<(), AriError> {
        let ipcp = self.ipcp()?;
        let flow_id = ipcp.first_flow_id().await.ok_or(AriError::NoFlowAvailable)?;
        ipcp.send_data(flow_id, data).await
    }

    /// Sends to `dest`, allocating a flow first if one isn't already
    /// open, retrying allocation up to `retries` times with a one-second
    /// backoff between attempts.
    pub async fn send_reliable(
        self: &Arc<Self>,
        dest: &Arc<Application>,
        data: Vec<u8>,
        qos: QoS,
        retries: u32,
    ) -> Result<(), AriError> {
        let ipcp = self.ipcp()?;
        let dest_ipcp = dest.ipcp()?;

        let mut flow_id = ipcp.find_flow_to(dest_ipcp.id, dest.port).await;

        if flow_id.is_none() {
            let mut last_err = None;
            for _ in 0..retries {
                match ipcp.allocate_flow(&dest_ipcp, qos, self.port, dest.port).await {
                    Ok(flow) => {
                        flow_id = Some(flow.id);
                        break;
                    }
                    Err(err) => {
                        last_err = Some(err);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            if flow_id.is_none() {
                return Err(last_err.unwrap_or(AriError::NoFlowAvailable));
            }
        }

        ipcp.send_data(flow_id.unwrap(), data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dif::Dif;

    #[tokio::test]
    async fn on_data_buffers_and_replies_to_ping() {
        let dif = Dif::new("d0", 0, 100);
        let ipcp = dif.create_ipcp(1, None);
        let app = Application::new("app", Arc::downgrade(&ipcp), 9000);
        app.clone().bind().unwrap();

        // no flow exists, so the ping's automatic pong reply must fail
        // without panicking or losing the original payload.
        let result = app.clone().on_data(b"ping".to_vec()).await;
        assert!(result.is_err());
        assert_eq!(app.received().await, vec![b"ping".to_vec()]);
    }

    #[tokio::test]
    async fn send_without_open_flow_fails() {
        let dif = Dif::new("d0", 0, 100);
        let ipcp = dif.create_ipcp(1, None);
        let app = Application::new("app", Arc::downgrade(&ipcp), 9000);
        let result = app.send(b"hello".to_vec()).await;
        assert_eq!(result, Err(AriError::NoFlowAvailable));
    }
}
