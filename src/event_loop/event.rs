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
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

use crate::network::{BoxedWriter, ConnectionHandle, ConnectionId, Role};
use crate::service::AppResult;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A new transport waiting to be admitted.
pub struct AcceptRequest {
    pub connection_id: ConnectionId,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub peer_addr: SocketAddr,
    pub role: Role,
    /// `None` for listener accepts, which are announced through `accept()`
    /// once established.
    pub reply: Option<oneshot::Sender<AppResult<ConnectionHandle>>>,
}

/// Readiness notifications, routed to workers by connection id.
pub enum Event {
    Accept(Box<AcceptRequest>),
    Readable {
        connection_id: ConnectionId,
        bytes: Bytes,
    },
    Writable {
        connection_id: ConnectionId,
    },
    TimerExpired {
        connection_id: ConnectionId,
    },
    HangUp {
        connection_id: ConnectionId,
        error: Option<io::Error>,
    },
}

impl Event {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Event::Accept(request) => request.connection_id,
            Event::Readable { connection_id, .. }
            | Event::Writable { connection_id }
            | Event::TimerExpired { connection_id }
            | Event::HangUp { connection_id, .. } => *connection_id,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Accept(request) => f
                .debug_struct("Accept")
                .field("connection_id", &request.connection_id)
                .field("peer_addr", &request.peer_addr)
                .field("role", &request.role)
                .finish(),
            Event::Readable {
                connection_id,
                bytes,
            } => f
                .debug_struct("Readable")
                .field("connection_id", connection_id)
                .field("len", &bytes.len())
                .finish(),
            Event::Writable { connection_id } => f
                .debug_struct("Writable")
                .field("connection_id", connection_id)
                .finish(),
            Event::TimerExpired { connection_id } => f
                .debug_struct("TimerExpired")
                .field("connection_id", connection_id)
                .finish(),
            Event::HangUp {
                connection_id,
                error,
            } => f
                .debug_struct("HangUp")
                .field("connection_id", connection_id)
                .field("error", error)
                .finish(),
        }
    }
}
