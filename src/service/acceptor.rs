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

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tracing::{debug, error};

use super::{AppError, AppResult, EngineContext, Shutdown};
use crate::event_loop::{AcceptRequest, Event};
use crate::network::{next_connection_id, Role};

/// Accept loop of one TCP listener. Every accepted socket becomes a passive
/// connection, admitted by the worker that owns its id.
pub(crate) struct Acceptor {
    listener: TcpListener,
    context: Arc<EngineContext>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        context: Arc<EngineContext>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        Acceptor {
            listener,
            context,
            shutdown: Shutdown::new(notify_shutdown.subscribe()),
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    /// Runs until shutdown. Table capacity is enforced at admission, a
    /// rejected socket is simply dropped.
    #[tracing::instrument(name = "acceptor", skip_all)]
    pub async fn run(mut self) -> AppResult<()> {
        let listener = &self.listener;
        while !self.shutdown.is_shutdown() {
            let (socket, peer_addr) = tokio::select! {
                accepted = accept(listener) => accepted?,
                _ = self.shutdown.recv() => break,
            };
            if self.context.is_shutting_down() {
                break;
            }
            if let Err(e) = socket.set_nodelay(true) {
                debug!(peer = %peer_addr, error = %e, "set_nodelay failed");
            }

            let connection_id = next_connection_id();
            let (reader, writer) = tokio::io::split(socket);
            let request = AcceptRequest {
                connection_id,
                reader: Box::new(reader),
                writer: Box::new(writer),
                peer_addr,
                role: Role::Passive,
                reply: None,
            };
            debug!(connection = connection_id, peer = %peer_addr, "accepted transport");
            self.context
                .router()
                .send(Event::Accept(Box::new(request)), connection_id)
                .await?;
        }
        debug!("acceptor stopped");
        Ok(())
    }
}

async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(err) => {
                if backoff > 64 {
                    return Err(AppError::DetailedIoError(format!(
                        "accept tcp server error: {}",
                        err
                    )));
                }
                error!(error = %err, backoff, "accept failed, retrying");
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}
