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

//! Packet processing pipeline
//!
//! A single task drains the global queue of raw frames, validates them and
//! applies them to their connection. Frames of one connection are queued by
//! its single owning worker, so they are applied in arrival order.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};

use crate::network::{CloseReason, ConnectionHandle, ConnectionId};
use crate::protocol::Frame;
use crate::service::{EngineContext, Shutdown};

/// Receives payloads the moment they are delivered in order. When a consumer
/// is installed delivered data bypasses the receive buffer.
pub trait DataConsumer: Send + Sync + 'static {
    fn on_data(&self, connection: ConnectionId, payload: Bytes);
}

/// Work item of the pipeline queue.
pub enum Inbound {
    Frame {
        connection_id: ConnectionId,
        raw: Bytes,
    },
    HangUp {
        connection_id: ConnectionId,
        error: Option<io::Error>,
    },
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inbound::Frame { connection_id, raw } => f
                .debug_struct("Frame")
                .field("connection_id", connection_id)
                .field("len", &raw.len())
                .finish(),
            Inbound::HangUp {
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

pub(crate) struct PacketPipeline {
    context: Arc<EngineContext>,
    receiver: async_channel::Receiver<Inbound>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl PacketPipeline {
    pub fn spawn(
        context: Arc<EngineContext>,
        receiver: async_channel::Receiver<Inbound>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> JoinHandle<()> {
        let mut pipeline = PacketPipeline {
            context,
            receiver,
            shutdown: Shutdown::new(notify_shutdown.subscribe()),
            _shutdown_complete_tx: shutdown_complete_tx,
        };
        tokio::spawn(async move { pipeline.run().await })
    }

    #[instrument(name = "packet_pipeline", skip_all)]
    async fn run(&mut self) {
        debug!("packet pipeline started");
        while !self.shutdown.is_shutdown() {
            tokio::select! {
                inbound = self.receiver.recv() => {
                    match inbound {
                        Ok(inbound) => self.process(inbound),
                        Err(_) => break,
                    }
                }
                _ = self.shutdown.recv() => break,
            }
        }
        debug!("packet pipeline stopped");
    }

    fn process(&self, inbound: Inbound) {
        match inbound {
            Inbound::Frame { connection_id, raw } => {
                process_frame(&self.context, connection_id, raw)
            }
            Inbound::HangUp {
                connection_id,
                error,
            } => {
                let Some(connection) = self.context.table.get(connection_id) else {
                    return;
                };
                if let Some(reason) = connection.on_hang_up(error.as_ref()) {
                    debug!(connection = connection_id, %reason, "transport hung up");
                    self.context.teardown(&connection, reason);
                }
            }
        }
    }
}

/// Decodes one raw frame and dispatches it to its connection.
pub(crate) fn process_frame(context: &EngineContext, connection_id: ConnectionId, raw: Bytes) {
    let Some(connection) = context.table.get(connection_id) else {
        trace!(connection = connection_id, "frame for unknown connection dropped");
        return;
    };
    let frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = connection_id, error = %e, "malformed frame dropped");
            connection.stats().record_malformed();
            context.stats.record_malformed();
            return;
        }
    };

    let outcome = match connection.on_frame(frame) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(connection = connection_id, error = %e, "frame processing failed");
            context.close_with(&connection, CloseReason::Io(e.to_string()));
            return;
        }
    };

    if let Some(payload) = outcome.delivered {
        if let Some(consumer) = &context.consumer {
            consumer.on_data(connection_id, payload);
        }
    }
    if outcome.established && context.pending_accept.remove(&connection_id).is_some() {
        if let Err(e) = context
            .accept_tx
            .try_send(ConnectionHandle::new(connection.clone()))
        {
            warn!(connection = connection_id, error = %e, "accept queue full, connection dropped");
            context.close_with(&connection, CloseReason::Aborted);
            return;
        }
    }
    if let Some(reason) = outcome.closed {
        context.teardown(&connection, reason);
        return;
    }
    if outcome.flush {
        context.schedule_flush(&connection);
    }
}
