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

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use super::acceptor::Acceptor;
use super::{AppError, AppResult, EngineConfig, EngineContext};
use crate::event_loop::{AcceptRequest, Event, EventHandler};
use crate::network::{
    next_connection_id, CloseReason, ConnectionHandle, ConnectionState, EngineStatistics, Role,
    Statistics,
};
use crate::pipeline::{DataConsumer, PacketPipeline};
use crate::utils::{task_channels, MultipleChannelWorkerPool, PoolSettings};

/// Entry point of the transport.
///
/// Owns the worker pool, the packet pipeline, the connection table and any
/// listeners. Must be started from within a tokio runtime.
///
/// Shutdown sequence:
/// 1. new accepts and opens are refused
/// 2. every connection is asked to close through the state machine
/// 3. after `shutdown_grace_ms` the remaining ones are reset
/// 4. the shutdown broadcast stops workers, pipeline, monitor and acceptors
/// 5. `shutdown` returns once all of them dropped their `shutdown_complete_tx`
pub struct Engine {
    context: Arc<EngineContext>,
    pool: MultipleChannelWorkerPool<Event>,
    accept_rx: async_channel::Receiver<ConnectionHandle>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    pipeline: JoinHandle<()>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn start(config: EngineConfig) -> AppResult<Engine> {
        Self::build(config, None)
    }

    /// Delivered payloads go to `consumer` instead of the receive buffers.
    pub fn with_consumer(
        config: EngineConfig,
        consumer: Arc<dyn DataConsumer>,
    ) -> AppResult<Engine> {
        Self::build(config, Some(consumer))
    }

    fn build(config: EngineConfig, consumer: Option<Arc<dyn DataConsumer>>) -> AppResult<Engine> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AppError::IllegalStateError(
                "engine must be started inside a tokio runtime".to_string(),
            ));
        }

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let settings = PoolSettings::from(&config.worker_pool);
        let (router, receivers) =
            task_channels::<Event>(settings.num_channels, settings.channel_capacity);
        let (pipeline_tx, pipeline_rx) = async_channel::bounded(config.pipeline.queue_capacity);
        let (accept_tx, accept_rx) = async_channel::bounded(config.network.max_connection.max(1));

        let context = Arc::new(EngineContext::new(
            config,
            router.clone(),
            pipeline_tx,
            accept_tx,
            consumer,
        ));
        let pool = MultipleChannelWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
            EventHandler::new(context.clone()),
            router,
            receivers,
            settings,
        );
        let pipeline = PacketPipeline::spawn(
            context.clone(),
            pipeline_rx,
            &notify_shutdown,
            shutdown_complete_tx.clone(),
        );
        info!(
            workers = pool.channel_count(),
            channel_capacity = pool.get_pool_config().channel_capacity,
            "engine started"
        );

        Ok(Engine {
            context,
            pool,
            accept_rx,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
            pipeline,
            acceptors: Mutex::new(Vec::new()),
        })
    }

    fn ensure_running(&self) -> AppResult<()> {
        if self.context.is_shutting_down() {
            return Err(AppError::IllegalStateError(
                "engine is shutting down".to_string(),
            ));
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    pub fn worker_count(&self) -> usize {
        self.pool.channel_count()
    }

    /// Binds a TCP listener; established passive connections are handed out
    /// by [`Engine::accept`].
    pub async fn listen(&self, addr: &str) -> AppResult<SocketAddr> {
        self.ensure_running()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let acceptor = Acceptor::new(
            listener,
            self.context.clone(),
            &self.notify_shutdown,
            self.shutdown_complete_tx.clone(),
        );
        let handle = tokio::spawn(async move {
            if let Err(e) = acceptor.run().await {
                error!(error = %e, "acceptor failed");
            }
        });
        self.acceptors.lock().push(handle);
        info!(%local_addr, "listening");
        Ok(local_addr)
    }

    /// Next listener connection that completed its handshake.
    pub async fn accept(&self) -> AppResult<ConnectionHandle> {
        Ok(self.accept_rx.recv().await?)
    }

    /// Admits an already connected byte stream. A passive connection is
    /// returned in LISTEN, an active one in SYN_SENT; see
    /// [`Engine::wait_established`].
    pub async fn attach<T>(
        &self,
        transport: T,
        peer_addr: SocketAddr,
        role: Role,
    ) -> AppResult<ConnectionHandle>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.ensure_running()?;
        let connection_id = next_connection_id();
        let (reader, writer) = tokio::io::split(transport);
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AcceptRequest {
            connection_id,
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer_addr,
            role,
            reply: Some(reply_tx),
        };
        self.context
            .router()
            .send(Event::Accept(Box::new(request)), connection_id)
            .await?;
        reply_rx
            .await
            .map_err(|e| AppError::ChannelRecvError(e.to_string()))?
    }

    /// Connects over TCP and completes the handshake.
    pub async fn open(&self, addr: &str) -> AppResult<ConnectionHandle> {
        self.ensure_running()?;
        let handshake_timeout = self.context.config.connection.handshake_timeout();
        let socket = time::timeout(handshake_timeout, TcpStream::connect(addr)).await??;
        socket.set_nodelay(true)?;
        let peer_addr = socket.peer_addr()?;
        let handle = self.attach(socket, peer_addr, Role::Active).await?;
        self.wait_established(&handle).await?;
        Ok(handle)
    }

    /// Waits up to `handshake_timeout_ms` for the handshake to finish.
    pub async fn wait_established(&self, handle: &ConnectionHandle) -> AppResult<()> {
        let connection = handle.connection();
        let handshake_timeout = self.context.config.connection.handshake_timeout();
        match time::timeout(
            handshake_timeout,
            connection.wait_for_state(|state| !state.is_opening()),
        )
        .await
        {
            Ok(ConnectionState::Closed) => Err(AppError::PeerClosed),
            Ok(_) => Ok(()),
            Err(_) => {
                self.context.close_with(connection, CloseReason::Timeout);
                Err(AppError::Timeout(format!(
                    "handshake with {} did not complete",
                    handle.peer_addr()
                )))
            }
        }
    }

    /// Queues `data` for reliable delivery. Returns once every segment is in
    /// the send buffer, not once it is acknowledged.
    pub async fn send(&self, handle: &ConnectionHandle, data: &[u8]) -> AppResult<usize> {
        let context = &self.context;
        handle
            .connection()
            .send(
                data,
                context.config.connection.io_timeout(),
                |connection| context.schedule_flush(connection),
            )
            .await
    }

    /// Waits up to `io_timeout_ms` for delivered bytes. After the peer
    /// closed and the buffer is drained this fails with `PeerClosed`.
    pub async fn receive(&self, handle: &ConnectionHandle) -> AppResult<Bytes> {
        let connection = handle.connection();
        let max = self.context.config.connection.recv_buffer_size;
        let data = time::timeout(
            self.context.config.connection.io_timeout(),
            connection.receive(max),
        )
        .await??;
        self.window_update(handle);
        Ok(data)
    }

    /// Like [`Engine::receive`] but waits for exactly `len` bytes.
    pub async fn receive_exact(&self, handle: &ConnectionHandle, len: usize) -> AppResult<Bytes> {
        let connection = handle.connection();
        let data = time::timeout(
            self.context.config.connection.io_timeout(),
            connection.receive_exact(len),
        )
        .await??;
        self.window_update(handle);
        Ok(data)
    }

    fn window_update(&self, handle: &ConnectionHandle) {
        let connection = handle.connection();
        match connection.after_read() {
            Ok(true) => self.context.schedule_flush(connection),
            Ok(false) => {}
            Err(e) => debug!(connection = connection.id(), error = %e, "window update skipped"),
        }
    }

    /// Starts the close handshake and waits until the local FIN is
    /// acknowledged. Before the handshake completed the connection is reset
    /// instead.
    pub async fn close(&self, handle: &ConnectionHandle) -> AppResult<()> {
        let connection = handle.connection();
        match connection.request_close()? {
            Some(reason) => {
                self.context.teardown(connection, reason);
                return Ok(());
            }
            None => self.context.schedule_flush(connection),
        }
        match time::timeout(
            self.context.config.connection.io_timeout(),
            connection.wait_for_state(ConnectionState::is_fin_acknowledged),
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(connection = connection.id(), "close timed out, resetting");
                self.context.close_with(connection, CloseReason::Timeout);
                Err(AppError::Timeout(format!(
                    "close of connection {} not acknowledged",
                    connection.id()
                )))
            }
        }
    }

    pub fn stats(&self, handle: &ConnectionHandle) -> Statistics {
        handle.connection().statistics()
    }

    pub fn state(&self, handle: &ConnectionHandle) -> ConnectionState {
        handle.connection().state()
    }

    pub fn close_reason(&self, handle: &ConnectionHandle) -> Option<CloseReason> {
        handle.connection().close_reason()
    }

    /// Whether the handle is still registered in the connection table.
    pub fn is_registered(&self, handle: &ConnectionHandle) -> bool {
        self.context.table.contains(handle.id())
    }

    pub fn engine_stats(&self) -> EngineStatistics {
        self.context.stats.snapshot(self.context.table.len())
    }

    pub fn connection_count(&self) -> usize {
        self.context.table.len()
    }

    pub async fn shutdown(self) -> AppResult<()> {
        let Engine {
            context,
            pool,
            accept_rx,
            notify_shutdown,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
            pipeline,
            acceptors,
        } = self;
        info!(
            connections = context.table.len(),
            "engine shutting down"
        );
        context.begin_shutdown();

        for connection in context.table.snapshot() {
            match connection.request_close() {
                Ok(Some(reason)) => context.teardown(&connection, reason),
                Ok(None) => context.schedule_flush(&connection),
                Err(e) => {
                    debug!(connection = connection.id(), error = %e, "close failed");
                    context.close_with(&connection, CloseReason::Shutdown);
                }
            }
        }
        let deadline = Instant::now() + context.config.connection.shutdown_grace();
        while !context.table.is_empty() && Instant::now() < deadline {
            time::sleep(context.config.connection.timer_tick()).await;
        }
        for connection in context.table.snapshot() {
            context.close_with(&connection, CloseReason::Shutdown);
        }

        // no receivers left is fine here
        let _ = notify_shutdown.send(());
        for acceptor in acceptors.into_inner() {
            acceptor.abort();
        }
        context.multiplexer.deregister_all();
        context.router().close();
        accept_rx.close();
        drop(pool);
        drop(pipeline);
        drop(shutdown_complete_tx);

        let _ = shutdown_complete_rx.recv().await;
        info!("engine shutdown complete");
        Ok(())
    }
}
