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

use std::fmt;

use serde::Serialize;

/// Connection lifecycle.
///
/// ```text
///  active open:   CLOSED -> SYN_SENT --syn|ack--> ESTABLISHED
///  passive open:  LISTEN --syn--> SYN_RECEIVED --ack--> ESTABLISHED
///  active close:  ESTABLISHED -> FIN_WAIT1 --ack--> FIN_WAIT2 --fin--> TIME_WAIT -> CLOSED
///                 FIN_WAIT1 --fin--> CLOSING --ack--> TIME_WAIT
///  passive close: ESTABLISHED --fin--> CLOSE_WAIT -> LAST_ACK --ack--> CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl ConnectionState {
    /// Handshake still in progress.
    pub fn is_opening(self) -> bool {
        matches!(
            self,
            ConnectionState::Listen | ConnectionState::SynSent | ConnectionState::SynReceived
        )
    }

    /// New application data may be queued.
    pub fn can_send(self) -> bool {
        matches!(
            self,
            ConnectionState::Established | ConnectionState::CloseWait
        )
    }

    /// The peer may still send DATA frames.
    pub fn accepts_data(self) -> bool {
        matches!(
            self,
            ConnectionState::Established | ConnectionState::FinWait1 | ConnectionState::FinWait2
        )
    }

    /// Both directions are synchronised, heartbeats make sense.
    pub fn is_synchronized(self) -> bool {
        !self.is_opening() && self != ConnectionState::Closed
    }

    /// The local FIN has been acknowledged or the connection is gone.
    pub fn is_fin_acknowledged(self) -> bool {
        matches!(
            self,
            ConnectionState::FinWait2 | ConnectionState::TimeWait | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RECEIVED",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait1 => "FIN_WAIT1",
            ConnectionState::FinWait2 => "FIN_WAIT2",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::TimeWait => "TIME_WAIT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

/// Why a connection reached `CLOSED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// both FINs exchanged and acknowledged
    Graceful,
    /// closed locally before the handshake completed
    Aborted,
    /// peer sent RST or hung up the transport
    PeerClosed,
    /// idle, handshake or retransmission timeout
    Timeout,
    /// transport error other than would-block
    Io(String),
    /// peer sent an unframeable byte stream
    Malformed(String),
    /// engine shutdown forced the connection down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Graceful => f.write_str("graceful"),
            CloseReason::Aborted => f.write_str("aborted"),
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Timeout => f.write_str("timeout"),
            CloseReason::Io(e) => write!(f, "io error: {e}"),
            CloseReason::Malformed(e) => write!(f, "malformed stream: {e}"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_groups() {
        assert!(ConnectionState::SynSent.is_opening());
        assert!(!ConnectionState::SynSent.is_synchronized());
        assert!(ConnectionState::CloseWait.can_send());
        assert!(!ConnectionState::CloseWait.accepts_data());
        assert!(ConnectionState::FinWait2.accepts_data());
        assert!(ConnectionState::TimeWait.is_fin_acknowledged());
        assert!(!ConnectionState::Closed.is_synchronized());
    }

    #[test]
    fn display_uses_protocol_names() {
        assert_eq!(ConnectionState::FinWait1.to_string(), "FIN_WAIT1");
        assert_eq!(ConnectionState::CloseWait.to_string(), "CLOSE_WAIT");
    }
}
