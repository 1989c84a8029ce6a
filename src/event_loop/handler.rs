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

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use super::{AcceptRequest, Event};
use crate::network::{CloseReason, Connection, ConnectionHandle, ConnectionId, Role};
use crate::pipeline::Inbound;
use crate::service::{AppError, AppResult, EngineContext};
use crate::utils::PoolHandler;

/// Runs on the event workers. All events of one connection reach the same
/// worker, so their handling never interleaves.
#[derive(Clone)]
pub(crate) struct EventHandler {
    context: Arc<EngineContext>,
}

impl EventHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        EventHandler { context }
    }
}

impl PoolHandler<Event> for EventHandler {
    fn handle(&self, event: Event) -> impl Future<Output = ()> + Send {
        let context = self.context.clone();
        async move {
            trace!(?event, "event");
            match event {
                Event::Accept(request) => on_accept(&context, *request),
                Event::Readable {
                    connection_id,
                    bytes,
                } => on_readable(&context, connection_id, bytes).await,
                Event::Writable { connection_id } => {
                    if let Some(connection) = context.table.get(connection_id) {
                        context.flush(&connection);
                    }
                }
                Event::TimerExpired { connection_id } => on_timer(&context, connection_id),
                Event::HangUp {
                    connection_id,
                    error,
                } => {
                    // through the pipeline so frames read before the hang-up
                    // are applied first
                    let hang_up = Inbound::HangUp {
                        connection_id,
                        error,
                    };
                    if let Err(e) = context.pipeline_tx.send(hang_up).await {
                        warn!(connection = connection_id, error = %e, "pipeline closed");
                    }
                }
            }
        }
    }
}

fn on_accept(context: &Arc<EngineContext>, request: AcceptRequest) {
    let AcceptRequest {
        connection_id,
        reader,
        writer,
        peer_addr,
        role,
        reply,
    } = request;

    if context.is_shutting_down() {
        context.stats.record_rejected();
        if let Some(reply) = reply {
            let _ = reply.send(Err(AppError::IllegalStateError(
                "engine is shutting down".to_string(),
            )));
        }
        return;
    }

    let connection = Arc::new(Connection::new(
        connection_id,
        peer_addr,
        role,
        writer,
        &context.config,
        context.clock,
        context.consumer.is_none(),
    ));
    let result = admit(context, &connection, reader, reply.is_none());
    match &result {
        Ok(_) => {
            context.stats.record_accepted();
            debug!(connection = connection_id, peer = %peer_addr, ?role, "connection admitted");
        }
        Err(e) => {
            context.stats.record_rejected();
            warn!(peer = %peer_addr, error = %e, "connection rejected");
        }
    }
    if let Some(reply) = reply {
        // the caller may have given up waiting
        let _ = reply.send(result);
    }
}

fn admit(
    context: &Arc<EngineContext>,
    connection: &Arc<Connection>,
    reader: super::BoxedReader,
    announce: bool,
) -> AppResult<ConnectionHandle> {
    context.table.insert(connection.clone())?;
    if announce && connection.role() == Role::Passive {
        context.pending_accept.insert(connection.id());
    }
    context.multiplexer.register(connection.id(), reader);

    if connection.role() == Role::Active {
        if let Err(e) = connection.start_handshake() {
            context.close_with(connection, CloseReason::Aborted);
            return Err(e);
        }
        context.flush(connection);
    }
    Ok(ConnectionHandle::new(connection.clone()))
}

async fn on_readable(context: &Arc<EngineContext>, connection_id: ConnectionId, bytes: Bytes) {
    let Some(connection) = context.table.get(connection_id) else {
        trace!(connection = connection_id, "bytes for unknown connection dropped");
        return;
    };
    match connection.split_frames(&bytes) {
        Ok(frames) => {
            for raw in frames {
                let inbound = Inbound::Frame {
                    connection_id,
                    raw,
                };
                if let Err(e) = context.pipeline_tx.send(inbound).await {
                    warn!(connection = connection_id, error = %e, "pipeline closed");
                    break;
                }
            }
        }
        Err(e) => {
            // a byte stream cannot be resynchronised after a bad length
            error!(connection = connection_id, error = %e, "unframeable stream");
            connection.stats().record_malformed();
            context.stats.record_malformed();
            context.close_with(&connection, CloseReason::Malformed(e.to_string()));
        }
    }
}

fn on_timer(context: &Arc<EngineContext>, connection_id: ConnectionId) {
    let Some(connection) = context.table.get(connection_id) else {
        return;
    };
    match connection.on_tick() {
        Ok(Some(reason)) => context.teardown(&connection, reason),
        Ok(None) => {
            if connection.has_pending_output() {
                context.flush(&connection);
            }
        }
        Err(e) => {
            error!(connection = connection_id, error = %e, "timer processing failed");
            context.close_with(&connection, CloseReason::Io(e.to_string()));
        }
    }
}
