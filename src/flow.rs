// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Flow — a reliable, sequenced channel between two ports, and the
//! [`FlowAllocationFSM`] that governs its admission lifecycle.
//!
//! A flow is shared: the same `Arc<Flow>` is registered under the same
//! [`FlowId`] in both the source and destination IPCP's flow tables, so
//! `src_ipcp`/`dest_ipcp` must be weak to avoid an Ipcp → Flow → Ipcp
//! reference cycle. Each flow owns its `unacked_packets` and
//! `out_of_order_buffer` behind a single window guard; `ack_arrived` is
//! a `Notify` signaling that window space may have opened up.
//!
//! A flow with a `lower_flow_id` rides on a flow at the layer below it,
//! encapsulating every frame it sends through that lower flow's own
//! `send_data`; a flow with none hands frames straight to a
//! [`LinkAdapter`], the bottom of the recursive stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::error::AriError;
use crate::frame::{Frame, WireUnit};
use crate::ipcp::{FlowId, Ipcp, Port};
use crate::link::LinkAdapter;
use crate::qos::QoS;
use crate::sequence::{in_inclusive_range, in_window, SequenceNumber};

/// Default number of unacknowledged packets a flow may have in flight.
pub const DEFAULT_WINDOW_SIZE: u16 = 16;
/// Default retransmission timeout.
pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(2);
/// Interval at which the retransmission loop scans for timed-out packets.
const RETRANSMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a flow allocation request waits for confirmation before
/// the FSM treats it as timed out.
pub const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Allocation attempts (including the first) before giving up and
/// tearing the flow down.
pub const MAX_ALLOCATION_RETRIES: u32 = 3;

/// Allocation lifecycle of a [`Flow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Initialized,
    RequestSent,
    Allocated,
    Active,
    Deallocating,
    Closed,
}

impl FlowState {
    fn name(self) -> &'static str {
        match self {
            FlowState::Initialized => "INITIALIZED",
            FlowState::RequestSent => "REQUEST_SENT",
            FlowState::Allocated => "ALLOCATED",
            FlowState::Active => "ACTIVE",
            FlowState::Deallocating => "DEALLOCATING",
            FlowState::Closed => "CLOSED",
        }
    }
}

/// A frame the flow sent or received, broadcast to observers in place
/// of monkey-patching a send method at runtime.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    Sent { flow_id: FlowId, frame: Frame },
    Received { flow_id: FlowId, frame: Frame },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlowStats {
    pub sent_packets: u64,
    pub received_packets: u64,
    pub ack_packets: u64,
    pub retransmitted_packets: u64,
}

struct WindowState {
    sequence_gen: SequenceNumber,
    send_base: u16,
    recv_base: u16,
    unacked_packets: HashMap<u16, (Vec<u8>, Instant)>,
    out_of_order_buffer: HashMap<u16, Vec<u8>>,
}

impl WindowState {
    fn new() -> Self {
        Self {
            sequence_gen: SequenceNumber::new(),
            send_base: 0,
            recv_base: 0,
            unacked_packets: HashMap::new(),
            out_of_order_buffer: HashMap::new(),
        }
    }
}

/// Construction parameters for a new [`Flow`].
pub struct FlowConfig {
    pub id: FlowId,
    pub src_ipcp: Weak<Ipcp>,
    pub dest_ipcp: Weak<Ipcp>,
    pub src_port: Port,
    pub dest_port: Port,
    pub qos: QoS,
    pub lower_flow_id: Option<FlowId>,
    /// True when this flow exists purely to carry a higher layer's
    /// encapsulated frames rather than an application's own data. Set
    /// explicitly by the caller rather than inferred from the ports,
    /// since port `0` is itself a bindable application port.
    pub is_transport: bool,
}

pub struct Flow {
    pub id: FlowId,
    src_ipcp: Weak<Ipcp>,
    dest_ipcp: Weak<Ipcp>,
    pub src_port: Port,
    pub dest_port: Port,
    pub qos: QoS,
    lower_flow_id: Option<FlowId>,
    /// True when this flow exists purely to carry a higher layer's
    /// encapsulated frames rather than an application's own data.
    is_transport: bool,
    link: AsyncMutex<Option<Arc<dyn LinkAdapter>>>,

    window_size: u16,
    retransmit_timeout: Duration,
    window: AsyncMutex<WindowState>,
    ack_arrived: Notify,

    state: AsyncMutex<FlowState>,
    retry_count: AtomicU32,
    allocation_timeout_task: AsyncMutex<Option<JoinHandle<()>>>,
    retransmission_task: AsyncMutex<Option<JoinHandle<()>>>,

    stats: AsyncMutex<FlowStats>,
    events: broadcast::Sender<FrameEvent>,
}

impl Flow {
    pub fn new(config: FlowConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            id: config.id,
            src_ipcp: config.src_ipcp,
            dest_ipcp: config.dest_ipcp,
            src_port: config.src_port,
            dest_port: config.dest_port,
            qos: config.qos,
            is_transport: config.is_transport,
            lower_flow_id: config.lower_flow_id,
            link: AsyncMutex::new(None),
            window_size: DEFAULT_WINDOW_SIZE,
            retransmit_timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            window: AsyncMutex::new(WindowState::new()),
            ack_arrived: Notify::new(),
            state: AsyncMutex::new(FlowState::Initialized),
            retry_count: AtomicU32::new(0),
            allocation_timeout_task: AsyncMutex::new(None),
            retransmission_task: AsyncMutex::new(None),
            stats: AsyncMutex::new(FlowStats::default()),
            events,
        })
    }

    /// Installs the link adapter used when this flow has no lower flow
    /// to ride on. Called once by the bottom-layer IPCP wiring.
    pub async fn set_link(&self, link: Arc<dyn LinkAdapter>) {
        *self.link.lock().await = Some(link);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> FlowState {
        *self.state.lock().await
    }

    pub async fn stats(&self) -> FlowStats {
        *self.stats.lock().await
    }

    pub fn owns_src(&self, ipcp: &Arc<Ipcp>) -> bool {
        self.src_ipcp.upgrade().is_some_and(|weak| Arc::ptr_eq(&weak, ipcp))
    }

    pub fn owns_dest(&self, ipcp: &Arc<Ipcp>) -> bool {
        self.dest_ipcp.upgrade().is_some_and(|weak| Arc::ptr_eq(&weak, ipcp))
    }

    pub fn dest_ipcp_id(&self) -> Option<u64> {
        self.dest_ipcp.upgrade().map(|ipcp| ipcp.id)
    }

    pub fn src_ipcp(&self) -> Option<Arc<Ipcp>> {
        self.src_ipcp.upgrade()
    }

    pub fn dest_ipcp(&self) -> Option<Arc<Ipcp>> {
        self.dest_ipcp.upgrade()
    }

    /// The id of the lower-layer flow this one rides on, if this layer
    /// recurses over another DIF.
    pub fn lower_flow_id(&self) -> Option<FlowId> {
        self.lower_flow_id
    }

    fn other_side(&self, from: &Arc<Ipcp>) -> Result<Arc<Ipcp>, AriError> {
        if self.owns_src(from) {
            self.dest_ipcp.upgrade()
        } else {
            self.src_ipcp.upgrade()
        }
        .ok_or(AriError::UnknownFlow { flow_id: self.id })
    }

    // --- Allocation lifecycle -------------------------------------------------

    /// Runs the flow through admission: starts the allocation FSM
    /// (approved immediately, as this simulation has no peer to
    /// actually negotiate with), then starts the retransmission loop.
    pub async fn commit_resources(self: &Arc<Self>) -> Result<(), AriError> {
        self.start_allocation().await;
        self.confirm_allocation().await;
        self.spawn_retransmission_loop().await;
        Ok(())
    }

    async fn start_allocation(self: &Arc<Self>) {
        *self.state.lock().await = FlowState::RequestSent;

        let weak_self = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            sleep(ALLOCATION_TIMEOUT).await;
            if let Some(flow) = weak_self.upgrade() {
                flow.handle_allocation_timeout().await;
            }
        });
        *self.allocation_timeout_task.lock().await = Some(handle);
    }

    async fn confirm_allocation(&self) {
        if let Some(handle) = self.allocation_timeout_task.lock().await.take() {
            handle.abort();
        }
        *self.state.lock().await = FlowState::Active;
    }

    async fn handle_allocation_timeout(self: &Arc<Self>) {
        if *self.state.lock().await != FlowState::RequestSent {
            return;
        }
        if self.retry_count.fetch_add(1, Ordering::SeqCst) + 1 < MAX_ALLOCATION_RETRIES {
            // Re-arms the timeout and stays in REQUEST_SENT; only an
            // explicit `confirm_allocation` (or a further timeout)
            // moves the FSM again.
            self.start_allocation().await;
        } else {
            self.deallocate().await;
        }
    }

    /// Drives the FSM's `deallocate` event: cancels the allocation
    /// timeout, releases resources, and transitions to `CLOSED`.
    pub async fn deallocate(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if *state == FlowState::Closed || *state == FlowState::Deallocating {
                return;
            }
            *state = FlowState::Deallocating;
        }
        if let Some(handle) = self.allocation_timeout_task.lock().await.take() {
            handle.abort();
        }
        self.release_resources().await;
        *self.state.lock().await = FlowState::Closed;
    }

    /// Cancels the retransmission task and, if this flow rides on a
    /// lower flow, deallocates that lower flow too. Idempotent.
    pub async fn release_resources(&self) {
        if let Some(handle) = self.retransmission_task.lock().await.take() {
            handle.abort();
        }
        if let Some(lower_flow_id) = self.lower_flow_id {
            if let Some(src) = self.src_ipcp.upgrade() {
                if let Some(lower) = &src.lower_ipcp {
                    let _ = lower.deallocate_flow(lower_flow_id).await;
                }
            }
        }
    }

    async fn spawn_retransmission_loop(self: &Arc<Self>) {
        let weak_self = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                sleep(RETRANSMIT_POLL_INTERVAL).await;
                let Some(flow) = weak_self.upgrade() else {
                    break;
                };
                if flow.state().await != FlowState::Active {
                    continue;
                }
                flow.retransmit_timed_out_packets().await;
            }
        });
        *self.retransmission_task.lock().await = Some(handle);
    }

    async fn retransmit_timed_out_packets(self: &Arc<Self>) {
        let Some(src) = self.src_ipcp.upgrade() else {
            return;
        };
        let now = Instant::now();
        let timed_out: Vec<(u16, Vec<u8>)> = {
            let window = self.window.lock().await;
            window
                .unacked_packets
                .iter()
                .filter(|(_, (_, sent_at))| now.duration_since(*sent_at) > self.retransmit_timeout)
                .map(|(seq, (data, _))| (*seq, data.clone()))
                .collect()
        };
        for (seq_num, data) in timed_out {
            println!("flow {}: retransmitting seq {}", self.id, seq_num);
            if let Err(err) = self.transmit_data(&src, seq_num, data).await {
                eprintln!("flow {}: retransmission of seq {} failed: {err}", self.id, seq_num);
            }
            self.stats.lock().await.retransmitted_packets += 1;
        }
    }

    // --- Sending ---------------------------------------------------------------

    /// Sends `data` reliably, blocking while the send window is full.
    pub async fn send_data(self: &Arc<Self>, from: &Arc<Ipcp>, data: Vec<u8>) -> Result<(), AriError> {
        if self.state().await != FlowState::Active {
            return Err(AriError::InvalidState {
                flow_id: self.id,
                expected: "ACTIVE",
                actual: self.state().await.name(),
            });
        }

        let seq_num = loop {
            let mut window = self.window.lock().await;
            if (window.unacked_packets.len() as u16) < self.window_size {
                let seq = window.sequence_gen.next();
                window.unacked_packets.insert(seq, (data.clone(), Instant::now()));
                break seq;
            }
            drop(window);
            let _ = timeout(self.retransmit_timeout, self.ack_arrived.notified()).await;
        };

        self.transmit_data(from, seq_num, data).await
    }

    async fn transmit_data(self: &Arc<Self>, from: &Arc<Ipcp>, seq_num: u16, data: Vec<u8>) -> Result<(), AriError> {
        let frame = Frame::Data { seq_num, data };
        self.stats.lock().await.sent_packets += 1;
        self.transmit(from, frame).await
    }

    async fn send_ack(self: &Arc<Self>, from: &Arc<Ipcp>, ack_seq_num: u16) -> Result<(), AriError> {
        self.transmit(from, Frame::Ack { ack_seq_num }).await
    }

    /// Common send path for data and ack frames: encapsulate-and-forward
    /// through the lower flow if one exists, otherwise hand straight to
    /// the link adapter (or, absent one, direct IPCP delivery).
    async fn transmit(self: &Arc<Self>, from: &Arc<Ipcp>, frame: Frame) -> Result<(), AriError> {
        let _ = self.events.send(FrameEvent::Sent { flow_id: self.id, frame: frame.clone() });

        if let Some(lower_flow_id) = self.lower_flow_id {
            let lower = from
                .lower_ipcp
                .clone()
                .ok_or_else(|| AriError::MalformedFrame {
                    reason: "flow has a lower_flow_id but its IPCP has no lower_ipcp".to_string(),
                })?;
            let unit = WireUnit::Bare(frame).encapsulate(self.id, Some(self.qos));
            let bytes = postcard::to_allocvec(&unit).map_err(|err| AriError::MalformedFrame {
                reason: err.to_string(),
            })?;
            lower.send_data(lower_flow_id, bytes).await
        } else {
            let to = self.other_side(from)?;
            if let Some(link) = self.link.lock().await.clone() {
                link.send_frame(to, frame).await;
                Ok(())
            } else {
                to.receive_data(WireUnit::Bare(frame)).await
            }
        }
    }

    // --- Receiving ---------------------------------------------------------------

    /// Processes a frame that arrived at `arrived_at`, either directly
    /// (bottom of the stack) or after the owning IPCP decapsulated it.
    pub async fn receive_frame(self: &Arc<Self>, arrived_at: &Arc<Ipcp>, frame: Frame) -> Result<(), AriError> {
        let _ = self.events.send(FrameEvent::Received { flow_id: self.id, frame: frame.clone() });
        match frame {
            Frame::Ack { ack_seq_num } => self.handle_ack(ack_seq_num).await,
            Frame::Data { seq_num, data } => self.handle_data_packet(arrived_at, seq_num, data).await,
        }
    }

    async fn handle_ack(&self, ack_seq_num: u16) -> Result<(), AriError> {
        self.stats.lock().await.ack_packets += 1;

        let mut window = self.window.lock().await;
        let send_base = window.send_base;
        // A cumulative ACK covers every sequence number from send_base
        // up to and including ack_seq_num.
        window
            .unacked_packets
            .retain(|&seq, _| !in_inclusive_range(seq, send_base, ack_seq_num));

        window.send_base = if window.unacked_packets.is_empty() {
            window.sequence_gen.peek()
        } else {
            window.unacked_packets.keys().copied().min().unwrap()
        };
        drop(window);

        self.ack_arrived.notify_waiters();
        Ok(())
    }

    async fn handle_data_packet(
        self: &Arc<Self>,
        arrived_at: &Arc<Ipcp>,
        seq_num: u16,
        data: Vec<u8>,
    ) -> Result<(), AriError> {
        self.stats.lock().await.received_packets += 1;

        let mut deliveries = Vec::new();
        {
            let mut window = self.window.lock().await;
            if seq_num == window.recv_base {
                deliveries.push(data);
                window.recv_base = window.recv_base.wrapping_add(1);
                while let Some(buffered) = window.out_of_order_buffer.remove(&window.recv_base) {
                    deliveries.push(buffered);
                    window.recv_base = window.recv_base.wrapping_add(1);
                }
            } else if in_window(seq_num, window.recv_base, self.window_size) {
                window.out_of_order_buffer.insert(seq_num, data);
            }
        }

        // A stalled or unbound application must not block the ACK: the
        // original simulation swallows delivery timeouts the same way.
        for payload in deliveries {
            if let Err(err) = self.deliver(arrived_at, payload).await {
                eprintln!("flow {}: dropped a delivered payload: {err}", self.id);
            }
        }

        let ack_seq_num = self.window.lock().await.recv_base.wrapping_sub(1);
        self.send_ack(arrived_at, ack_seq_num).await
    }

    /// Delivers a fully reassembled payload: forwarded up to the next
    /// layer if this flow only exists to carry that layer's traffic,
    /// otherwise handed straight to the bound application.
    async fn deliver(&self, arrived_at: &Arc<Ipcp>, payload: Vec<u8>) -> Result<(), AriError> {
        if self.is_transport {
            let unit: WireUnit = postcard::from_bytes(&payload).map_err(|err| AriError::MalformedFrame {
                reason: err.to_string(),
            })?;
            arrived_at.receive_data(unit).await
        } else {
            arrived_at.deliver_to_application(self.dest_port, payload).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dif::Dif;

    fn make_pair() -> (Arc<Ipcp>, Arc<Ipcp>) {
        let dif = Dif::new("d0", 0, 1000);
        (dif.create_ipcp(1, None), dif.create_ipcp(2, None))
    }

    #[tokio::test]
    async fn allocate_flow_reaches_active_state() {
        let (a, b) = make_pair();
        let flow = a.allocate_flow(&b, QoS::best_effort(), 100, 200).await.unwrap();
        assert_eq!(flow.state().await, FlowState::Active);
    }

    #[tokio::test]
    async fn send_and_receive_delivers_in_order() {
        let (a, b) = make_pair();
        let app_b = crate::application::Application::new("b", Arc::downgrade(&b), 200);
        app_b.clone().bind().unwrap();

        let flow = a.allocate_flow(&b, QoS::best_effort(), 100, 200).await.unwrap();
        a.send_data(flow.id, b"hello".to_vec()).await.unwrap();

        // allow the directly-delivered frame (no link adapter) to land
        tokio::task::yield_now().await;
        assert_eq!(app_b.received().await, vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn out_of_order_packet_is_buffered_until_gap_fills() {
        let (a, b) = make_pair();
        let flow = a.allocate_flow(&b, QoS::best_effort(), 100, 200).await.unwrap();

        flow.clone().receive_frame(&b, Frame::Data { seq_num: 1, data: vec![2] }).await.unwrap();
        {
            let window = flow.window.lock().await;
            assert_eq!(window.recv_base, 0);
            assert!(window.out_of_order_buffer.contains_key(&1));
        }

        flow.clone().receive_frame(&b, Frame::Data { seq_num: 0, data: vec![1] }).await.unwrap();
        let window = flow.window.lock().await;
        assert_eq!(window.recv_base, 2);
        assert!(window.out_of_order_buffer.is_empty());
    }

    #[tokio::test]
    async fn deallocate_is_idempotent() {
        let (a, b) = make_pair();
        let flow = a.allocate_flow(&b, QoS::best_effort(), 100, 200).await.unwrap();
        flow.clone().deallocate().await;
        flow.clone().deallocate().await;
        assert_eq!(flow.state().await, FlowState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_allocation_timeouts_eventually_close_the_flow() {
        let (a, b) = make_pair();
        let flow = Flow::new(FlowConfig {
            id: 99,
            src_ipcp: Arc::downgrade(&a),
            dest_ipcp: Arc::downgrade(&b),
            src_port: 1,
            dest_port: 2,
            qos: QoS::best_effort(),
            lower_flow_id: None,
            is_transport: false,
        });

        *flow.state.lock().await = FlowState::RequestSent;
        for _ in 0..MAX_ALLOCATION_RETRIES {
            flow.clone().handle_allocation_timeout().await;
        }
        assert_eq!(flow.state().await, FlowState::Closed);
    }
}
