// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use super::stats::ControlSnapshot;
use super::{CloseReason, ConnectionState, ConnectionStats, RingBuffer, Statistics};
use crate::control::{CongestionController, RttEstimator};
use crate::protocol::{flags, window_payload, Frame, MessageType};
use crate::service::{AppError, AppResult, ConnectionConfig, EngineConfig};
use crate::utils::Clock;

pub type ConnectionId = u64;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Ids are handed out once per process and never reused.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Upper bound of a single write handed to the transport.
const FLUSH_CHUNK: usize = 64 * 1024;

/// Which side opens the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// sends SYN
    Active,
    /// waits in LISTEN for the peer's SYN
    Passive,
}

/// `a` precedes `b` in 32-bit serial number arithmetic.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Data,
    Syn,
    SynAck,
    Fin,
}

impl SegmentKind {
    fn header(self) -> (MessageType, u16) {
        match self {
            SegmentKind::Data => (MessageType::Data, 0),
            SegmentKind::Syn => (MessageType::Control, flags::SYN),
            SegmentKind::SynAck => (MessageType::Control, flags::SYN | flags::ACK),
            SegmentKind::Fin => (MessageType::Control, flags::FIN),
        }
    }
}

/// A sequence-consuming frame waiting for its acknowledgement.
#[derive(Debug)]
struct InFlight {
    sequence: u32,
    kind: SegmentKind,
    payload: Bytes,
    first_sent: Instant,
    last_sent: Instant,
    /// successful hand-offs to the send buffer, RTT samples need exactly one
    transmissions: u32,
    needs_resend: bool,
}

/// Side effects of one inbound frame that the caller has to carry out.
#[derive(Debug, Default)]
pub(crate) struct FrameOutcome {
    pub delivered: Option<Bytes>,
    pub established: bool,
    pub closed: Option<CloseReason>,
    pub flush: bool,
}

struct ConnectionInner {
    state: ConnectionState,
    send_next: u32,
    recv_next: u32,
    fin_sequence: Option<u32>,
    close_requested: bool,
    close_reason: Option<CloseReason>,
    in_flight: VecDeque<InFlight>,
    rtt: RttEstimator,
    congestion: CongestionController,
    created_at: Instant,
    last_activity: Instant,
    last_send: Instant,
    consecutive_timeouts: u32,
    time_wait_deadline: Option<Instant>,
    ack_pending: bool,
    advertised_window: u16,
}

/// One reliable connection over a byte-stream transport.
///
/// Protocol state lives behind a `parking_lot` mutex that is never held across
/// an await. Frames leave through the send ring buffer, which the owning event
/// worker drains onto the transport writer; delivered payload bytes wait in the
/// receive ring buffer until the application reads them.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    role: Role,
    max_payload: usize,
    buffer_delivery: bool,
    config: ConnectionConfig,
    clock: Clock,
    inner: Mutex<ConnectionInner>,
    inbound: Mutex<BytesMut>,
    send_buffer: RingBuffer,
    recv_buffer: RingBuffer,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    send_lock: tokio::sync::Mutex<()>,
    window_open: Notify,
    state_tx: watch::Sender<ConnectionState>,
    write_scheduled: AtomicBool,
    stats: ConnectionStats,
}

impl Connection {
    /// `buffer_delivery` is false when a consumer callback takes delivered
    /// payloads instead of the receive buffer.
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        role: Role,
        writer: BoxedWriter,
        config: &EngineConfig,
        clock: Clock,
        buffer_delivery: bool,
    ) -> Connection {
        let now = clock.now();
        let state = match role {
            Role::Active => ConnectionState::Closed,
            Role::Passive => ConnectionState::Listen,
        };
        let (state_tx, _) = watch::channel(state);
        let isn: u32 = rand::random();
        Connection {
            id,
            peer_addr,
            role,
            max_payload: config.network.max_payload_size.max(1),
            buffer_delivery,
            config: config.connection.clone(),
            clock,
            inner: Mutex::new(ConnectionInner {
                state,
                send_next: isn,
                recv_next: 0,
                fin_sequence: None,
                close_requested: false,
                close_reason: None,
                in_flight: VecDeque::new(),
                rtt: RttEstimator::new(&config.rtt),
                congestion: CongestionController::new(&config.congestion),
                created_at: now,
                last_activity: now,
                last_send: now,
                consecutive_timeouts: 0,
                time_wait_deadline: None,
                ack_pending: false,
                advertised_window: 0,
            }),
            inbound: Mutex::new(BytesMut::with_capacity(config.network.conn_read_buffer_size)),
            send_buffer: RingBuffer::new(config.connection.send_buffer_size),
            recv_buffer: RingBuffer::new(config.connection.recv_buffer_size),
            writer: tokio::sync::Mutex::new(Some(writer)),
            send_lock: tokio::sync::Mutex::new(()),
            window_open: Notify::new(),
            state_tx,
            write_scheduled: AtomicBool::new(false),
            stats: ConnectionStats::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason.clone()
    }

    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.lock();
        let control = ControlSnapshot {
            state: inner.state,
            smoothed_rtt_ms: inner
                .rtt
                .smoothed_rtt()
                .map(|rtt| rtt.as_secs_f64() * 1000.0),
            retransmission_timeout_ms: inner.rtt.retransmission_timeout().as_millis() as u64,
            congestion_window: inner.congestion.congestion_window(),
            slow_start_threshold: inner.congestion.slow_start_threshold(),
            peer_window: inner.congestion.advertised_window(),
            in_flight: inner.in_flight.len(),
        };
        drop(inner);
        self.stats.snapshot(control)
    }

    pub(crate) fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Waits until the state satisfies `predicate` and returns it.
    pub(crate) async fn wait_for_state<F>(&self, predicate: F) -> ConnectionState
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut state_rx = self.state_tx.subscribe();
        let reached = match state_rx.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    /// Current receive window in packets.
    fn receive_window(&self) -> u16 {
        let free = if self.buffer_delivery {
            self.recv_buffer.available_write()
        } else {
            self.recv_buffer.max_transfer()
        };
        (free / self.max_payload).min(u16::MAX as usize) as u16
    }

    fn set_state(&self, inner: &mut ConnectionInner, next: ConnectionState) {
        if inner.state == next {
            return;
        }
        debug!(
            connection = self.id,
            "state {} -> {}", inner.state, next
        );
        inner.state = next;
        self.state_tx.send_replace(next);
        self.window_open.notify_waiters();
    }

    /// Enters CLOSED. Readers drain what was delivered and then see
    /// `PeerClosed`; the send buffer stays open until the writer is shut down
    /// so a final RST or ACK still reaches the peer.
    fn finish(&self, inner: &mut ConnectionInner, reason: CloseReason) {
        if inner.close_reason.is_some() {
            return;
        }
        debug!(connection = self.id, %reason, "connection closed");
        inner.close_reason = Some(reason);
        inner.in_flight.clear();
        inner.time_wait_deadline = None;
        self.set_state(inner, ConnectionState::Closed);
        self.recv_buffer.close();
        self.window_open.notify_waiters();
    }

    fn enter_time_wait(&self, inner: &mut ConnectionInner) {
        inner.time_wait_deadline = Some(self.clock.now() + self.config.time_wait());
        self.set_state(inner, ConnectionState::TimeWait);
    }

    /// Encodes a frame straight into the send buffer without waiting.
    fn enqueue(
        &self,
        inner: &mut ConnectionInner,
        message_type: MessageType,
        flags: u16,
        sequence: u32,
        payload: &[u8],
    ) -> AppResult<bool> {
        let frame = Frame::encode(
            message_type,
            flags,
            sequence,
            self.clock.timestamp(),
            payload,
        )?;
        let queued = self.send_buffer.try_write_exact(&frame)?;
        if queued {
            inner.last_send = self.clock.now();
            if message_type != MessageType::Data {
                self.stats.record_control_sent();
            }
        }
        Ok(queued)
    }

    /// Cumulative ACK carrying the current receive window. When the send
    /// buffer is full the ACK is retried on the next timer tick.
    fn queue_ack(&self, inner: &mut ConnectionInner) -> AppResult<()> {
        let window = self.receive_window();
        let next = inner.recv_next;
        if self.enqueue(
            inner,
            MessageType::Ack,
            flags::ACK,
            next,
            &window_payload(window),
        )? {
            inner.ack_pending = false;
            inner.advertised_window = window;
        } else {
            inner.ack_pending = true;
        }
        Ok(())
    }

    fn queue_reset(&self, inner: &mut ConnectionInner) -> AppResult<bool> {
        let sequence = inner.send_next;
        self.enqueue(inner, MessageType::Control, flags::RST, sequence, &[])
    }

    /// Sends a sequence-consuming control frame and tracks it for
    /// retransmission.
    fn transmit_tracked(
        &self,
        inner: &mut ConnectionInner,
        kind: SegmentKind,
        sequence: u32,
        payload: Bytes,
    ) -> AppResult<()> {
        let (message_type, flags) = kind.header();
        let now = self.clock.now();
        let queued = self.enqueue(inner, message_type, flags, sequence, &payload)?;
        inner.in_flight.push_back(InFlight {
            sequence,
            kind,
            payload,
            first_sent: now,
            last_sent: now,
            transmissions: u32::from(queued),
            needs_resend: !queued,
        });
        Ok(())
    }

    /// Active open: CLOSED -> SYN_SENT.
    pub(crate) fn start_handshake(&self) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if self.role != Role::Active || inner.state != ConnectionState::Closed {
            return Err(AppError::IllegalStateError(format!(
                "connection {} cannot open from {}",
                self.id, inner.state
            )));
        }
        let isn = inner.send_next;
        inner.send_next = isn.wrapping_add(1);
        let window = self.receive_window();
        inner.advertised_window = window;
        self.transmit_tracked(
            &mut inner,
            SegmentKind::Syn,
            isn,
            Bytes::copy_from_slice(&window_payload(window)),
        )?;
        self.set_state(&mut inner, ConnectionState::SynSent);
        Ok(())
    }

    /// Queues one DATA frame, waiting while the send window is full.
    ///
    /// The caller bounds the wait; a connection leaving the sendable states
    /// wakes it with an error.
    pub(crate) async fn send_segment(&self, chunk: &[u8]) -> AppResult<()> {
        loop {
            let window_open = self.window_open.notified();
            tokio::pin!(window_open);
            window_open.as_mut().enable();

            let frame = {
                let mut inner = self.inner.lock();
                match inner.state {
                    ConnectionState::Closed => return Err(AppError::PeerClosed),
                    state if inner.close_requested || !(state.can_send() || state.is_opening()) => {
                        return Err(AppError::IllegalStateError(format!(
                            "connection {} cannot send in {}",
                            self.id, state
                        )));
                    }
                    _ => {}
                }
                if inner.state.can_send()
                    && (inner.in_flight.len() as u64) < u64::from(inner.congestion.send_window())
                {
                    let sequence = inner.send_next;
                    inner.send_next = sequence.wrapping_add(1);
                    let frame = Frame::encode(
                        MessageType::Data,
                        0,
                        sequence,
                        self.clock.timestamp(),
                        chunk,
                    )?;
                    let now = self.clock.now();
                    inner.in_flight.push_back(InFlight {
                        sequence,
                        kind: SegmentKind::Data,
                        payload: Bytes::copy_from_slice(chunk),
                        first_sent: now,
                        last_sent: now,
                        transmissions: 1,
                        needs_resend: false,
                    });
                    inner.last_send = now;
                    Some(frame)
                } else {
                    None
                }
            };

            if let Some(frame) = frame {
                self.send_buffer.write(&frame).await?;
                self.stats.record_data_sent(chunk.len());
                return Ok(());
            }
            window_open.await;
        }
    }

    /// Splits `data` into segments of at most `max_payload` bytes, keeping
    /// them contiguous against concurrent senders. Each segment may wait up to
    /// `segment_timeout` for window and buffer space; `on_segment` runs after
    /// every queued segment.
    pub(crate) async fn send<F>(
        &self,
        data: &[u8],
        segment_timeout: Duration,
        on_segment: F,
    ) -> AppResult<usize>
    where
        F: Fn(&Connection),
    {
        let _guard = self.send_lock.lock().await;
        for chunk in data.chunks(self.max_payload) {
            time::timeout(segment_timeout, self.send_segment(chunk)).await??;
            on_segment(self);
        }
        Ok(data.len())
    }

    pub(crate) async fn receive(&self, max: usize) -> AppResult<Bytes> {
        self.recv_buffer.read_some(max).await
    }

    pub(crate) async fn receive_exact(&self, len: usize) -> AppResult<Bytes> {
        let mut out = vec![0u8; len];
        self.recv_buffer.read(&mut out).await?;
        Ok(Bytes::from(out))
    }

    /// Announces a reopened receive window after the application drained the
    /// buffer. Returns true when a frame was queued.
    pub(crate) fn after_read(&self) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_data() {
            return Ok(false);
        }
        let full = (self.recv_buffer.max_transfer() / self.max_payload).max(1) as u16;
        let current = self.receive_window();
        let reopened = inner.advertised_window == 0 && current > 0;
        if reopened || (inner.advertised_window < full / 4 && current >= full / 2) {
            self.queue_ack(&mut inner)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Appends transport bytes and splits off every complete raw frame.
    pub(crate) fn split_frames(&self, bytes: &[u8]) -> AppResult<Vec<Bytes>> {
        let mut buffer = self.inbound.lock();
        buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = Frame::parse(&mut buffer, self.max_payload)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Applies one validated inbound frame.
    pub(crate) fn on_frame(&self, frame: Frame) -> AppResult<FrameOutcome> {
        let mut outcome = FrameOutcome::default();
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            trace!(connection = self.id, %frame, "frame for closed connection dropped");
            return Ok(outcome);
        }
        inner.last_activity = self.clock.now();
        trace!(connection = self.id, %frame, "inbound");

        match frame.message_type() {
            MessageType::Data => self.on_data(&mut inner, frame, &mut outcome)?,
            MessageType::Ack => {
                self.stats.record_control_received();
                self.on_ack(&mut inner, &frame, &mut outcome)?;
            }
            MessageType::Heartbeat => {
                self.stats.record_control_received();
                if inner.state.is_synchronized() {
                    self.queue_ack(&mut inner)?;
                }
            }
            MessageType::Control => {
                self.stats.record_control_received();
                self.on_control(&mut inner, &frame, &mut outcome)?;
            }
        }

        if outcome.closed.is_none() {
            self.resend_pending(&mut inner)?;
            self.try_send_fin(&mut inner)?;
        }
        outcome.flush = self.send_buffer.available_read() > 0;
        Ok(outcome)
    }

    fn on_data(
        &self,
        inner: &mut ConnectionInner,
        frame: Frame,
        outcome: &mut FrameOutcome,
    ) -> AppResult<()> {
        if !inner.state.accepts_data() {
            trace!(connection = self.id, state = %inner.state, "data outside a data state dropped");
            return Ok(());
        }
        let sequence = frame.sequence();
        if sequence == inner.recv_next {
            if self.buffer_delivery && !self.recv_buffer.try_write_exact(&frame.payload)? {
                // not acknowledged, the sender retransmits once we drained
                debug!(connection = self.id, sequence, "receive buffer full, frame dropped");
                return Ok(());
            }
            inner.recv_next = sequence.wrapping_add(1);
            self.stats.record_data_received(frame.payload.len());
            outcome.delivered = Some(frame.payload);
        } else if seq_lt(sequence, inner.recv_next) {
            self.stats.record_duplicate();
        } else {
            debug!(
                connection = self.id,
                sequence,
                expected = inner.recv_next,
                "out of order frame dropped"
            );
            self.stats.record_out_of_order();
        }
        self.queue_ack(inner)
    }

    fn on_ack(
        &self,
        inner: &mut ConnectionInner,
        frame: &Frame,
        outcome: &mut FrameOutcome,
    ) -> AppResult<()> {
        let ack_next = frame.sequence();
        if seq_lt(inner.send_next, ack_next) {
            warn!(
                connection = self.id,
                ack_next,
                send_next = inner.send_next,
                "ack for unsent sequence ignored"
            );
            return Ok(());
        }
        if let Some(window) = frame.advertised_window() {
            inner.congestion.set_advertised_window(u32::from(window));
        }
        let acked = self.acknowledge(inner, ack_next);
        self.window_open.notify_waiters();

        match inner.state {
            ConnectionState::SynReceived if acked.handshake => {
                self.set_state(inner, ConnectionState::Established);
                outcome.established = true;
            }
            ConnectionState::FinWait1 if acked.fin => {
                self.set_state(inner, ConnectionState::FinWait2);
            }
            ConnectionState::Closing if acked.fin => self.enter_time_wait(inner),
            ConnectionState::LastAck if acked.fin => {
                self.finish(inner, CloseReason::Graceful);
                outcome.closed = Some(CloseReason::Graceful);
            }
            _ => {}
        }
        Ok(())
    }

    /// Releases every in-flight frame below `ack_next`.
    fn acknowledge(&self, inner: &mut ConnectionInner, ack_next: u32) -> Acked {
        let now = self.clock.now();
        let mut acked = Acked::default();
        let mut sample = None;
        while inner
            .in_flight
            .front()
            .is_some_and(|segment| seq_lt(segment.sequence, ack_next))
        {
            let Some(segment) = inner.in_flight.pop_front() else {
                break;
            };
            match segment.kind {
                SegmentKind::Data => inner.congestion.on_ack(),
                SegmentKind::Syn | SegmentKind::SynAck => acked.handshake = true,
                SegmentKind::Fin => acked.fin = true,
            }
            if segment.transmissions == 1 {
                sample = Some(now.duration_since(segment.first_sent));
            }
            acked.count += 1;
        }
        if let Some(sample) = sample {
            inner.rtt.on_sample(sample);
        }
        if acked.count > 0 {
            inner.consecutive_timeouts = 0;
        }
        acked
    }

    fn on_control(
        &self,
        inner: &mut ConnectionInner,
        frame: &Frame,
        outcome: &mut FrameOutcome,
    ) -> AppResult<()> {
        let sequence = frame.sequence();
        if frame.has_flag(flags::RST) {
            debug!(connection = self.id, "reset by peer");
            self.finish(inner, CloseReason::PeerClosed);
            outcome.closed = Some(CloseReason::PeerClosed);
            return Ok(());
        }

        if frame.has_flag(flags::SYN | flags::ACK) {
            match inner.state {
                ConnectionState::SynSent => {
                    if let Some(window) = frame.advertised_window() {
                        inner.congestion.set_advertised_window(u32::from(window));
                    }
                    let ack_next = inner.send_next;
                    self.acknowledge(inner, ack_next);
                    inner.recv_next = sequence.wrapping_add(1);
                    self.set_state(inner, ConnectionState::Established);
                    outcome.established = true;
                    self.queue_ack(inner)?;
                }
                state if state.is_synchronized() => {
                    self.stats.record_duplicate();
                    self.queue_ack(inner)?;
                }
                _ => trace!(connection = self.id, "unexpected SYN|ACK ignored"),
            }
        } else if frame.has_flag(flags::SYN) {
            match inner.state {
                ConnectionState::Listen => {
                    if let Some(window) = frame.advertised_window() {
                        inner.congestion.set_advertised_window(u32::from(window));
                    }
                    inner.recv_next = sequence.wrapping_add(1);
                    self.set_state(inner, ConnectionState::SynReceived);
                    let isn = inner.send_next;
                    inner.send_next = isn.wrapping_add(1);
                    let window = self.receive_window();
                    inner.advertised_window = window;
                    self.transmit_tracked(
                        inner,
                        SegmentKind::SynAck,
                        isn,
                        Bytes::copy_from_slice(&window_payload(window)),
                    )?;
                }
                ConnectionState::SynReceived if sequence.wrapping_add(1) == inner.recv_next => {
                    self.stats.record_duplicate();
                    for segment in inner.in_flight.iter_mut() {
                        if segment.kind == SegmentKind::SynAck {
                            segment.needs_resend = true;
                        }
                    }
                }
                _ => trace!(connection = self.id, "unexpected SYN ignored"),
            }
        } else if frame.has_flag(flags::FIN) {
            self.on_fin(inner, sequence)?;
        } else {
            warn!(connection = self.id, flags = frame.header.flags, "control frame without flags");
            self.stats.record_malformed();
        }
        Ok(())
    }

    fn on_fin(&self, inner: &mut ConnectionInner, sequence: u32) -> AppResult<()> {
        if !inner.state.is_synchronized() {
            trace!(connection = self.id, "FIN before the handshake ignored");
            return Ok(());
        }
        if sequence == inner.recv_next {
            inner.recv_next = sequence.wrapping_add(1);
            self.recv_buffer.close();
            match inner.state {
                ConnectionState::Established => self.set_state(inner, ConnectionState::CloseWait),
                ConnectionState::FinWait1 => self.set_state(inner, ConnectionState::Closing),
                ConnectionState::FinWait2 => self.enter_time_wait(inner),
                _ => {}
            }
        } else if seq_lt(sequence, inner.recv_next) {
            self.stats.record_duplicate();
        } else {
            self.stats.record_out_of_order();
        }
        self.queue_ack(inner)
    }

    /// Sends the local FIN once nothing is left in flight.
    fn try_send_fin(&self, inner: &mut ConnectionInner) -> AppResult<()> {
        if inner.fin_sequence.is_some() || !inner.in_flight.is_empty() {
            return Ok(());
        }
        let next = match inner.state {
            ConnectionState::Established if inner.close_requested => ConnectionState::FinWait1,
            ConnectionState::CloseWait => ConnectionState::LastAck,
            _ => return Ok(()),
        };
        let sequence = inner.send_next;
        inner.send_next = sequence.wrapping_add(1);
        inner.fin_sequence = Some(sequence);
        self.transmit_tracked(inner, SegmentKind::Fin, sequence, Bytes::new())?;
        self.set_state(inner, next);
        Ok(())
    }

    /// Pushes frames flagged for resending into the send buffer, oldest first,
    /// stopping at the first one that does not fit.
    fn resend_pending(&self, inner: &mut ConnectionInner) -> AppResult<()> {
        let now = self.clock.now();
        let timestamp = self.clock.timestamp();
        let mut resent = false;
        for segment in inner.in_flight.iter_mut().filter(|s| s.needs_resend) {
            let (message_type, flags) = segment.kind.header();
            let frame = Frame::encode(
                message_type,
                flags,
                segment.sequence,
                timestamp,
                &segment.payload,
            )?;
            if !self.send_buffer.try_write_exact(&frame)? {
                break;
            }
            if segment.transmissions == 0 {
                segment.first_sent = now;
            } else {
                self.stats.record_retransmission();
            }
            if message_type != MessageType::Data {
                self.stats.record_control_sent();
            }
            segment.transmissions += 1;
            segment.last_sent = now;
            segment.needs_resend = false;
            resent = true;
        }
        if resent {
            inner.last_send = now;
        }
        Ok(())
    }

    /// Periodic work: TIME_WAIT expiry, idle and handshake timeouts,
    /// retransmission, keepalive, pending ACK and deferred FIN.
    ///
    /// Returns the close reason when the tick closed the connection.
    pub(crate) fn on_tick(&self) -> AppResult<Option<CloseReason>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Closed => return Ok(None),
            ConnectionState::TimeWait => {
                if inner.time_wait_deadline.is_some_and(|deadline| now >= deadline) {
                    self.finish(&mut inner, CloseReason::Graceful);
                    return Ok(Some(CloseReason::Graceful));
                }
            }
            _ => {}
        }

        if now.duration_since(inner.last_activity) >= self.config.idle_timeout() {
            debug!(connection = self.id, "idle timeout");
            self.finish(&mut inner, CloseReason::Timeout);
            return Ok(Some(CloseReason::Timeout));
        }
        if inner.state.is_opening()
            && now.duration_since(inner.created_at) >= self.config.handshake_timeout()
        {
            debug!(connection = self.id, state = %inner.state, "handshake timeout");
            if inner.state != ConnectionState::Listen {
                self.queue_reset(&mut inner)?;
            }
            self.finish(&mut inner, CloseReason::Timeout);
            return Ok(Some(CloseReason::Timeout));
        }

        let rto = inner.rtt.retransmission_timeout();
        let expired = inner.in_flight.front().is_some_and(|segment| {
            segment.transmissions > 0 && now.duration_since(segment.last_sent) >= rto
        });
        if expired {
            inner.consecutive_timeouts += 1;
            if inner.consecutive_timeouts > self.config.max_retransmits {
                warn!(
                    connection = self.id,
                    attempts = inner.consecutive_timeouts,
                    "retransmission limit reached"
                );
                self.queue_reset(&mut inner)?;
                self.finish(&mut inner, CloseReason::Timeout);
                return Ok(Some(CloseReason::Timeout));
            }
            debug!(connection = self.id, ?rto, "retransmission timeout");
            inner.congestion.on_loss();
            inner.rtt.back_off();
            for segment in inner.in_flight.iter_mut() {
                segment.needs_resend = true;
            }
        }
        self.resend_pending(&mut inner)?;

        if let Some(interval) = self.config.keepalive_interval() {
            if inner.state.is_synchronized() && now.duration_since(inner.last_send) >= interval {
                let sequence = inner.send_next;
                self.enqueue(&mut inner, MessageType::Heartbeat, 0, sequence, &[])?;
            }
        }
        if inner.ack_pending {
            self.queue_ack(&mut inner)?;
        }
        self.try_send_fin(&mut inner)?;
        Ok(None)
    }

    /// Local close request. Returns the close reason when the connection went
    /// straight to CLOSED.
    pub(crate) fn request_close(&self) -> AppResult<Option<CloseReason>> {
        let mut inner = self.inner.lock();
        inner.close_requested = true;
        match inner.state {
            ConnectionState::Listen => {
                self.finish(&mut inner, CloseReason::Aborted);
                Ok(Some(CloseReason::Aborted))
            }
            ConnectionState::SynSent | ConnectionState::SynReceived => {
                self.queue_reset(&mut inner)?;
                self.finish(&mut inner, CloseReason::Aborted);
                Ok(Some(CloseReason::Aborted))
            }
            ConnectionState::Closed if inner.close_reason.is_none() => {
                self.finish(&mut inner, CloseReason::Aborted);
                Ok(Some(CloseReason::Aborted))
            }
            _ => {
                self.try_send_fin(&mut inner)?;
                Ok(None)
            }
        }
    }

    /// Forced close with a best-effort RST. Returns false when the connection
    /// was already closed.
    pub(crate) fn abort(&self, reason: CloseReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.close_reason.is_some() {
            return false;
        }
        if inner.state != ConnectionState::Listen {
            if let Err(e) = self.queue_reset(&mut inner) {
                trace!(connection = self.id, error = %e, "reset not queued");
            }
        }
        self.finish(&mut inner, reason);
        true
    }

    /// The transport reached EOF or failed.
    pub(crate) fn on_hang_up(&self, error: Option<&io::Error>) -> Option<CloseReason> {
        let mut inner = self.inner.lock();
        if inner.close_reason.is_some() {
            return None;
        }
        let reason = match (error, inner.state) {
            (Some(e), _) => CloseReason::Io(e.to_string()),
            (None, ConnectionState::TimeWait) => CloseReason::Graceful,
            (None, _) => CloseReason::PeerClosed,
        };
        self.finish(&mut inner, reason.clone());
        Some(reason)
    }

    /// Claims the right to post one Writable event. False when one is
    /// already queued.
    pub(crate) fn claim_write(&self) -> bool {
        !self.write_scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_write(&self) {
        self.write_scheduled.store(false, Ordering::Release);
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        self.send_buffer.available_read() > 0
    }

    /// Drains the send buffer onto the transport. Any error is fatal for the
    /// connection, including a transport that accepts nothing for
    /// `io_timeout_ms`.
    ///
    /// Returns immediately when another flush holds the writer, that one
    /// keeps draining until the buffer is empty.
    pub(crate) async fn flush(&self) -> AppResult<usize> {
        self.release_write();
        let mut written = 0;
        loop {
            let Ok(mut writer) = self.writer.try_lock() else {
                return Ok(written);
            };
            let Some(writer) = writer.as_mut() else {
                return Ok(written);
            };
            written += self.write_out(writer).await?;
            if !self.has_pending_output() {
                return Ok(written);
            }
        }
    }

    async fn write_out(&self, writer: &mut BoxedWriter) -> AppResult<usize> {
        let io_timeout = self.config.io_timeout();
        let mut written = 0;
        loop {
            let chunk = self.send_buffer.try_read_available(FLUSH_CHUNK);
            if chunk.is_empty() {
                break;
            }
            time::timeout(io_timeout, writer.write_all(&chunk))
                .await
                .map_err(|_| {
                    AppError::Timeout(format!(
                        "transport of connection {} accepted nothing for {:?}",
                        self.id, io_timeout
                    ))
                })??;
            written += chunk.len();
        }
        if written > 0 {
            time::timeout(io_timeout, writer.flush()).await??;
        }
        Ok(written)
    }

    /// Writes out whatever is still buffered and shuts the transport writer
    /// down. Blocked senders are released with `PeerClosed`.
    pub(crate) async fn shutdown_writer(&self) {
        self.send_buffer.close();
        self.recv_buffer.close();
        let io_timeout = self.config.io_timeout();
        let Ok(mut writer) = time::timeout(io_timeout, self.writer.lock()).await else {
            trace!(connection = self.id, "writer still busy, dropped");
            return;
        };
        let Some(mut writer) = writer.take() else {
            return;
        };
        if let Err(e) = self.write_out(&mut writer).await {
            trace!(connection = self.id, error = %e, "final flush failed");
            return;
        }
        match time::timeout(io_timeout, writer.shutdown()).await {
            Ok(Err(e)) => trace!(connection = self.id, error = %e, "writer shutdown failed"),
            Err(_) => trace!(connection = self.id, "writer shutdown timed out"),
            Ok(Ok(())) => {}
        }
    }
}

#[derive(Debug, Default)]
struct Acked {
    count: usize,
    handshake: bool,
    fin: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Application-facing reference to a connection. Stays usable for reads of
/// already delivered data and statistics after the connection is gone.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<Connection>,
}

impl ConnectionHandle {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        ConnectionHandle { connection }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn role(&self) -> Role {
        self.connection.role()
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}
