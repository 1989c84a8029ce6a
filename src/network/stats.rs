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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::ConnectionState;

/// Cumulative per-connection counters. Packet and byte counts cover DATA
/// frames only, control traffic is counted separately.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    retransmissions: AtomicU64,
    out_of_order_packets: AtomicU64,
    duplicate_packets: AtomicU64,
    malformed_frames: AtomicU64,
    control_frames_sent: AtomicU64,
    control_frames_received: AtomicU64,
}

impl ConnectionStats {
    pub fn record_data_sent(&self, len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }
    pub fn record_data_received(&self, len: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }
    pub fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_out_of_order(&self) {
        self.out_of_order_packets.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_duplicate(&self) {
        self.duplicate_packets.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_control_sent(&self) {
        self.control_frames_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_control_received(&self) {
        self.control_frames_received.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point in time view of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub state: ConnectionState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub retransmissions: u64,
    pub out_of_order_packets: u64,
    pub duplicate_packets: u64,
    pub malformed_frames: u64,
    pub control_frames_sent: u64,
    pub control_frames_received: u64,
    pub smoothed_rtt_ms: Option<f64>,
    pub retransmission_timeout_ms: u64,
    pub congestion_window: u32,
    pub slow_start_threshold: u32,
    pub peer_window: u32,
    pub in_flight: usize,
}

/// Transport-level figures carried into a [`Statistics`] snapshot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ControlSnapshot {
    pub state: ConnectionState,
    pub smoothed_rtt_ms: Option<f64>,
    pub retransmission_timeout_ms: u64,
    pub congestion_window: u32,
    pub slow_start_threshold: u32,
    pub peer_window: u32,
    pub in_flight: usize,
}

impl ConnectionStats {
    pub(crate) fn snapshot(&self, control: ControlSnapshot) -> Statistics {
        Statistics {
            state: control.state,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            out_of_order_packets: self.out_of_order_packets.load(Ordering::Relaxed),
            duplicate_packets: self.duplicate_packets.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            control_frames_sent: self.control_frames_sent.load(Ordering::Relaxed),
            control_frames_received: self.control_frames_received.load(Ordering::Relaxed),
            smoothed_rtt_ms: control.smoothed_rtt_ms,
            retransmission_timeout_ms: control.retransmission_timeout_ms,
            congestion_window: control.congestion_window,
            slow_start_threshold: control.slow_start_threshold,
            peer_window: control.peer_window,
            in_flight: control.in_flight,
        }
    }
}

/// Engine wide counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_closed: AtomicU64,
    connection_timeouts: AtomicU64,
    malformed_frames: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatistics {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_closed: u64,
    pub connection_timeouts: u64,
    pub malformed_frames: u64,
    pub active_connections: usize,
}

impl EngineStats {
    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_timeout(&self) {
        self.connection_timeouts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_connections: usize) -> EngineStatistics {
        EngineStatistics {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_timeouts: self.connection_timeouts.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            active_connections,
        }
    }
}
