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

//! Connection layer
//!
//! Everything that belongs to one reliable connection lives here:
//!
//! - `Connection`: lifecycle state machine, sequence counters, in-flight
//!   tracking, RTT and congestion state, statistics
//! - `RingBuffer`: bounded byte queues between the application and the
//!   transport
//! - `ConnectionTable`: bounded registry of live connections
//!
//! A connection never touches its transport directly except to drain the send
//! buffer; inbound bytes arrive through the event loop and the packet
//! pipeline.

pub use connection::{
    next_connection_id, BoxedWriter, Connection, ConnectionHandle, ConnectionId, Role,
};
pub use connection_table::ConnectionTable;
pub use ring_buffer::RingBuffer;
pub use state::{CloseReason, ConnectionState};
pub use stats::{ConnectionStats, EngineStatistics, EngineStats, Statistics};

mod connection;
mod connection_table;
mod ring_buffer;
mod state;
mod stats;
