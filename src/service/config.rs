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

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<EngineConfig> = OnceCell::new();
pub fn global_config() -> &'static EngineConfig {
    GLOBAL_CONFIG.get_or_init(EngineConfig::default)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// upper bound of concurrently registered connections
    pub max_connection: usize,
    /// largest payload carried by one frame, also the segment size used by `send`
    pub max_payload_size: usize,
    pub conn_read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 9292,
            max_connection: 1024,
            max_payload_size: 1400,
            conn_read_buffer_size: 16 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// hard cap on the number of event workers, the actual count is
    /// `min(available parallelism, max_workers)`
    pub max_workers: usize,
    pub channel_capacity: usize,
    pub monitor_interval: u64,
    pub worker_check_timeout: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            channel_capacity: 1024,
            monitor_interval: 5,
            worker_check_timeout: 200,
        }
    }
}

impl WorkerPoolConfig {
    pub fn num_workers(&self) -> usize {
        num_cpus::get().min(self.max_workers).max(1)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
        }
    }
}

/// Per connection buffers and timers, all durations in milliseconds.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    /// connections without inbound traffic for this long are closed
    pub idle_timeout_ms: u64,
    /// idle period after which a heartbeat is sent, 0 disables keepalive
    pub keepalive_interval_ms: u64,
    pub timer_tick_ms: u64,
    pub time_wait_ms: u64,
    pub handshake_timeout_ms: u64,
    /// bound on blocking `send`/`receive`/`close` calls
    pub io_timeout_ms: u64,
    /// consecutive retransmission timeouts tolerated before the connection is dropped
    pub max_retransmits: u32,
    pub shutdown_grace_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 64 * 1024,
            recv_buffer_size: 64 * 1024,
            idle_timeout_ms: 30_000,
            keepalive_interval_ms: 5_000,
            timer_tick_ms: 50,
            time_wait_ms: 2_000,
            handshake_timeout_ms: 10_000,
            io_timeout_ms: 30_000,
            max_retransmits: 6,
            shutdown_grace_ms: 3_000,
        }
    }
}

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms.max(1))
    }
    pub fn time_wait(&self) -> Duration {
        Duration::from_millis(self.time_wait_ms)
    }
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CongestionConfig {
    /// initial congestion window, in packets
    pub initial_window: u32,
    pub initial_ssthresh: u32,
    /// window assumed for the peer until its first advertisement arrives
    pub initial_peer_window: u32,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_window: 1,
            initial_ssthresh: 64,
            initial_peer_window: 32,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RttConfig {
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            initial_rto_ms: 1_000,
            min_rto_ms: 1_000,
            max_rto_ms: 60_000,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub worker_pool: WorkerPoolConfig,
    pub pipeline: PipelineConfig,
    pub connection: ConnectionConfig,
    pub congestion: CongestionConfig,
    pub rtt: RttConfig,
}

impl EngineConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<EngineConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;

        Ok(engine_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let network = &self.network;
        if network.max_payload_size == 0 || network.max_payload_size > u16::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "max_payload_size {} must be within 1..={}",
                network.max_payload_size,
                u16::MAX
            )));
        }
        if network.max_connection == 0 {
            return Err(AppError::InvalidValue("max_connection must be > 0".into()));
        }
        let frame_len = crate::protocol::HEADER_LEN + network.max_payload_size;
        let conn = &self.connection;
        if conn.send_buffer_size <= frame_len || conn.recv_buffer_size <= network.max_payload_size
        {
            return Err(AppError::InvalidValue(format!(
                "ring buffers ({} / {}) must hold at least one full frame of {} bytes",
                conn.send_buffer_size, conn.recv_buffer_size, frame_len
            )));
        }
        if self.rtt.min_rto_ms > self.rtt.max_rto_ms {
            return Err(AppError::InvalidValue(format!(
                "min_rto_ms {} greater than max_rto_ms {}",
                self.rtt.min_rto_ms, self.rtt.max_rto_ms
            )));
        }
        if self.congestion.initial_window == 0 || self.worker_pool.channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "initial_window and channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[network]\nport = 7000\nmax_connection = 4\n\n[connection]\nidle_timeout_ms = 500\n"
        )
        .unwrap();

        let config = EngineConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.max_connection, 4);
        assert_eq!(config.network.max_payload_size, 1400);
        assert_eq!(config.connection.idle_timeout(), Duration::from_millis(500));
        assert_eq!(config.rtt.max_rto_ms, 60_000);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut config = EngineConfig::default();
        config.network.max_payload_size = 70_000;
        assert!(matches!(config.validate(), Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn keepalive_zero_disables() {
        let mut config = ConnectionConfig::default();
        config.keepalive_interval_ms = 0;
        assert!(config.keepalive_interval().is_none());
    }
}
