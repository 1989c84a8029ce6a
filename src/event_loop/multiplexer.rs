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

use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};

use super::{BoxedReader, Event};
use crate::network::ConnectionId;
use crate::utils::TaskRouter;

/// Event sources of one connection.
#[derive(Debug)]
struct Registration {
    reader: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl Registration {
    fn cancel(self) {
        self.reader.abort();
        self.timer.abort();
    }
}

/// Turns transports and timers into events on the worker channels.
///
/// Each registered connection gets a reader task producing `Readable` and
/// `HangUp`, and a timer task producing `TimerExpired` every tick. Both post
/// to the channel chosen by the connection id, so a single worker sees all of
/// a connection's events in order.
#[derive(Debug)]
pub struct Multiplexer {
    registrations: DashMap<ConnectionId, Registration>,
    router: TaskRouter<Event>,
    read_buffer_size: usize,
    tick: Duration,
}

impl Multiplexer {
    pub fn new(router: TaskRouter<Event>, read_buffer_size: usize, tick: Duration) -> Self {
        Multiplexer {
            registrations: DashMap::new(),
            router,
            read_buffer_size: read_buffer_size.max(64),
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    pub fn router(&self) -> &TaskRouter<Event> {
        &self.router
    }

    pub fn register(&self, connection_id: ConnectionId, reader: BoxedReader) {
        let reader = tokio::spawn(read_loop(
            connection_id,
            reader,
            self.router.clone(),
            self.read_buffer_size,
        ));
        let timer = tokio::spawn(tick_loop(connection_id, self.router.clone(), self.tick));
        if let Some(previous) = self
            .registrations
            .insert(connection_id, Registration { reader, timer })
        {
            previous.cancel();
        }
        trace!(connection = connection_id, "event sources registered");
    }

    /// Cancels both event sources. Returns false when nothing was registered.
    pub fn deregister(&self, connection_id: ConnectionId) -> bool {
        match self.registrations.remove(&connection_id) {
            Some((_, registration)) => {
                registration.cancel();
                trace!(connection = connection_id, "event sources cancelled");
                true
            }
            None => false,
        }
    }

    pub fn deregister_all(&self) {
        let ids: Vec<ConnectionId> = self.registrations.iter().map(|r| *r.key()).collect();
        for id in ids {
            self.deregister(id);
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

async fn read_loop(
    connection_id: ConnectionId,
    mut reader: BoxedReader,
    router: TaskRouter<Event>,
    buffer_size: usize,
) {
    let mut buffer = BytesMut::with_capacity(buffer_size);
    loop {
        buffer.reserve(buffer_size);
        let event = match reader.read_buf(&mut buffer).await {
            Ok(0) => Event::HangUp {
                connection_id,
                error: None,
            },
            Ok(_) => Event::Readable {
                connection_id,
                bytes: buffer.split().freeze(),
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => Event::HangUp {
                connection_id,
                error: Some(e),
            },
        };
        let hang_up = matches!(event, Event::HangUp { .. });
        if router.send(event, connection_id).await.is_err() || hang_up {
            break;
        }
    }
    debug!(connection = connection_id, "reader finished");
}

async fn tick_loop(connection_id: ConnectionId, router: TaskRouter<Event>, tick: Duration) {
    let mut interval = time::interval_at(time::Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if router
            .send(Event::TimerExpired { connection_id }, connection_id)
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::utils::task_channels;

    #[tokio::test]
    async fn reader_and_timer_post_to_the_same_channel() {
        let (router, receivers) = task_channels::<Event>(3, 16);
        let multiplexer = Multiplexer::new(router, 1024, Duration::from_millis(20));
        let (local, mut remote) = tokio::io::duplex(1024);
        let (reader, _writer) = tokio::io::split(local);

        multiplexer.register(7, Box::new(reader));
        remote.write_all(b"ping").await.unwrap();

        let receiver = &receivers[7 % 3];
        let mut saw_bytes = false;
        let mut saw_timer = false;
        while !(saw_bytes && saw_timer) {
            match receiver.recv().await.unwrap() {
                Event::Readable { connection_id, bytes } => {
                    assert_eq!(connection_id, 7);
                    assert_eq!(&bytes[..], b"ping");
                    saw_bytes = true;
                }
                Event::TimerExpired { connection_id } => {
                    assert_eq!(connection_id, 7);
                    saw_timer = true;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(receivers[0].is_empty() && receivers[2].is_empty());

        drop(remote);
        loop {
            if let Event::HangUp { error, .. } = receiver.recv().await.unwrap() {
                assert!(error.is_none());
                break;
            }
        }

        assert!(multiplexer.deregister(7));
        assert!(!multiplexer.deregister(7));
        assert!(multiplexer.is_empty());
    }
}
