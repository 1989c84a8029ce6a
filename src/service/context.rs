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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, error, trace};

use super::{AppError, EngineConfig};
use crate::event_loop::{Event, Multiplexer};
use crate::network::{
    CloseReason, Connection, ConnectionHandle, ConnectionId, ConnectionTable, EngineStats,
};
use crate::pipeline::{DataConsumer, Inbound};
use crate::utils::{Clock, TaskRouter};

/// State shared by the workers, the packet pipeline, the acceptors and the
/// engine facade.
pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub clock: Clock,
    pub table: ConnectionTable,
    pub multiplexer: Multiplexer,
    pub pipeline_tx: async_channel::Sender<Inbound>,
    pub accept_tx: async_channel::Sender<ConnectionHandle>,
    /// listener connections still waiting for their handshake
    pub pending_accept: DashSet<ConnectionId>,
    pub consumer: Option<Arc<dyn DataConsumer>>,
    pub stats: EngineStats,
    shutting_down: AtomicBool,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        router: TaskRouter<Event>,
        pipeline_tx: async_channel::Sender<Inbound>,
        accept_tx: async_channel::Sender<ConnectionHandle>,
        consumer: Option<Arc<dyn DataConsumer>>,
    ) -> Self {
        let multiplexer = Multiplexer::new(
            router,
            config.network.conn_read_buffer_size,
            config.connection.timer_tick(),
        );
        EngineContext {
            table: ConnectionTable::new(config.network.max_connection),
            multiplexer,
            pipeline_tx,
            accept_tx,
            pending_accept: DashSet::new(),
            consumer,
            stats: EngineStats::default(),
            shutting_down: AtomicBool::new(false),
            clock: Clock::new(),
            config,
        }
    }

    pub fn router(&self) -> &TaskRouter<Event> {
        self.multiplexer.router()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Posts one `Writable` event unless one is already queued. When the
    /// worker channel is full the next timer tick flushes instead.
    pub fn schedule_flush(&self, connection: &Connection) {
        if !connection.claim_write() {
            return;
        }
        let id = connection.id();
        if let Err(e) = self
            .router()
            .try_send(Event::Writable { connection_id: id }, id)
        {
            connection.release_write();
            trace!(connection = id, error = %e, "flush deferred to the next tick");
        }
    }

    /// Drains the send buffer on its own task, so a transport that stops
    /// accepting bytes never holds up the worker. A write failure is fatal.
    pub fn flush(self: &Arc<Self>, connection: &Arc<Connection>) {
        let context = self.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.flush().await {
                error!(connection = connection.id(), error = %e, "transport write failed");
                let reason = match e {
                    AppError::Timeout(_) => CloseReason::Timeout,
                    e => CloseReason::Io(e.to_string()),
                };
                context.close_with(&connection, reason);
            }
        });
    }

    /// Forces the connection to CLOSED (best-effort RST) and tears it down.
    pub fn close_with(&self, connection: &Arc<Connection>, reason: CloseReason) {
        connection.abort(reason.clone());
        self.teardown(connection, reason);
    }

    /// Releases everything a CLOSED connection holds: table entry, event
    /// sources and the transport writer. Safe to call more than once.
    pub fn teardown(&self, connection: &Arc<Connection>, reason: CloseReason) {
        let id = connection.id();
        if self.table.remove(id).is_none() {
            return;
        }
        self.pending_accept.remove(&id);
        self.multiplexer.deregister(id);
        self.stats.record_closed();
        if reason == CloseReason::Timeout {
            self.stats.record_timeout();
        }
        debug!(
            connection = id,
            peer = %connection.peer_addr(),
            %reason,
            "connection torn down"
        );

        let connection = connection.clone();
        tokio::spawn(async move {
            connection.shutdown_writer().await;
        });
    }
}
