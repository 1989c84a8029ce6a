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

//! Reliable, ordered, congestion-controlled byte streams over connected
//! datagram-framed transports.

mod control;
mod event_loop;
mod network;
mod pipeline;
mod protocol;
mod service;
mod utils;

pub use network::{CloseReason, ConnectionHandle, ConnectionId, ConnectionState, EngineStatistics, Role, Statistics};
pub use pipeline::DataConsumer;
pub use protocol::{flags, Frame, FrameHeader, MessageType, HEADER_LEN, PROTOCOL_VERSION};
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, CongestionConfig,
    ConnectionConfig, Engine, EngineConfig, NetworkConfig, PipelineConfig, RttConfig, Shutdown,
    WorkerPoolConfig, GLOBAL_CONFIG,
};
