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

use std::any::type_name;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{SendError, TrySendError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::service::Shutdown;

/// Handler trait for processing tasks
pub trait PoolHandler<T>: Clone + Send + 'static + Sync {
    /// Handle the task
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// Worker pool parameters
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub channel_capacity: usize,
    pub num_channels: usize,
    pub monitor_interval: Duration,
    /// how long the monitor waits to collect a finished worker
    pub worker_check_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 4,
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

impl From<&crate::service::WorkerPoolConfig> for PoolSettings {
    fn from(config: &crate::service::WorkerPoolConfig) -> Self {
        Self {
            channel_capacity: config.channel_capacity.max(1),
            num_channels: config.num_workers(),
            monitor_interval: Duration::from_secs(config.monitor_interval.max(1)),
            worker_check_timeout: Duration::from_millis(config.worker_check_timeout),
        }
    }
}

/// Sending side of the pool's channels. Tasks with the same key always land on
/// the same channel, so one worker handles them in order.
///
/// The router exists before the pool so that handlers can hold a copy of it.
pub struct TaskRouter<T> {
    senders: Arc<Vec<async_channel::Sender<T>>>,
}

impl<T> Clone for TaskRouter<T> {
    fn clone(&self) -> Self {
        TaskRouter {
            senders: self.senders.clone(),
        }
    }
}

impl<T> Debug for TaskRouter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRouter")
            .field("channels", &self.senders.len())
            .finish()
    }
}

impl<T> TaskRouter<T> {
    fn sender(&self, key: u64) -> &async_channel::Sender<T> {
        let index = (key % self.senders.len() as u64) as usize;
        &self.senders[index]
    }

    /// Waits while the target channel is full.
    pub async fn send(&self, task: T, key: u64) -> Result<(), SendError<T>> {
        self.sender(key).send(task).await
    }

    pub fn try_send(&self, task: T, key: u64) -> Result<(), TrySendError<T>> {
        self.sender(key).try_send(task)
    }

    pub fn channel_count(&self) -> usize {
        self.senders.len()
    }

    /// Closes every channel; workers exit once they see the closure.
    pub fn close(&self) {
        for sender in self.senders.iter() {
            sender.close();
        }
    }
}

/// Creates `num_channels` bounded channels, returning the router and the
/// receivers to hand to [`MultipleChannelWorkerPool::new`].
pub fn task_channels<T>(
    num_channels: usize,
    capacity: usize,
) -> (TaskRouter<T>, Vec<async_channel::Receiver<T>>) {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_channels.max(1))
        .map(|_| async_channel::bounded(capacity.max(1)))
        .unzip();
    (
        TaskRouter {
            senders: Arc::new(senders),
        },
        receivers,
    )
}

/// represent a worker pool with multiple independent task channels
/// each channel has its own dedicated worker to ensure sequential processing
#[derive(Debug)]
pub struct MultipleChannelWorkerPool<T> {
    router: TaskRouter<T>,
    settings: PoolSettings,
}

/// represent a running worker
#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> MultipleChannelWorkerPool<T> {
    /// Spawns one worker per receiver plus a monitor restarting workers that
    /// panicked. Every spawned task holds a clone of `shutdown_complete_tx`.
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        router: TaskRouter<T>,
        receivers: Vec<async_channel::Receiver<T>>,
        settings: PoolSettings,
    ) -> Self {
        let workers = receivers
            .iter()
            .enumerate()
            .map(|(id, receiver)| {
                Self::spawn_worker(
                    id,
                    handler.clone(),
                    notify_shutdown.clone(),
                    shutdown_complete_tx.clone(),
                    receiver.clone(),
                )
            })
            .collect();
        Self::spawn_monitor(
            workers,
            receivers,
            notify_shutdown,
            shutdown_complete_tx,
            handler,
            settings.clone(),
        );

        Self { router, settings }
    }

    pub fn router(&self) -> &TaskRouter<T> {
        &self.router
    }

    pub fn get_pool_config(&self) -> &PoolSettings {
        &self.settings
    }

    /// Get channel count
    pub fn channel_count(&self) -> usize {
        self.router.channel_count()
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

        let handle = tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            debug!("Worker {id} started");

            loop {
                tokio::select! {
                    task = receiver.recv() => {
                        match task {
                            Ok(task) => handler.handle(task).await,
                            Err(_) => {
                                debug!("Worker {id} channel closed");
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        receivers: Vec<async_channel::Receiver<T>>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        settings: PoolSettings,
    ) {
        // subscribed before the spawn so an early broadcast is not missed
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx.clone();
            let mut interval = time::interval(settings.monitor_interval);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            if !worker.handle.is_finished() {
                                trace!("Worker {} is running", worker.id);
                                continue;
                            }
                            // a closed channel means the worker is done for good
                            if receivers[worker.id].is_closed() {
                                continue;
                            }
                            match time::timeout(settings.worker_check_timeout, &mut worker.handle).await {
                                Ok(Err(err)) if err.is_panic() => {
                                    Self::log_worker_panic(worker.id, err);
                                }
                                Ok(Err(_)) => {
                                    error!("Worker {} failed with non-panic error", worker.id);
                                }
                                // a normal exit only happens on shutdown or channel closure
                                Ok(Ok(())) | Err(_) => continue,
                            }
                            warn!("Worker {} failed, restarting...", worker.id);
                            *worker = Self::spawn_worker(
                                worker.id,
                                handler.clone(),
                                notify_shutdown.clone(),
                                shutdown_complete_tx.clone(),
                                receivers[worker.id].clone(),
                            );
                            debug!("Worker {} restarted", worker.id);
                        }
                    }
                }
            }
            debug!("Worker monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "Worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::*;

    fn settings(num_channels: usize) -> PoolSettings {
        PoolSettings {
            channel_capacity: 10,
            num_channels,
            monitor_interval: Duration::from_millis(50),
            worker_check_timeout: Duration::from_millis(20),
        }
    }

    #[derive(Clone)]
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    impl PoolHandler<(u64, u64)> for RecordingHandler {
        fn handle(&self, task: (u64, u64)) -> impl Future<Output = ()> + Send {
            let seen = self.seen.clone();
            async move {
                seen.lock().push(task);
            }
        }
    }

    #[tokio::test]
    async fn same_key_is_processed_in_order() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let handler = RecordingHandler {
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let (router, receivers) = task_channels(3, 10);
        let pool = MultipleChannelWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx,
            handler.clone(),
            router,
            receivers,
            settings(3),
        );
        assert_eq!(pool.channel_count(), 3);

        for seq in 0..20 {
            for key in [1u64, 2, 7] {
                pool.router().send((key, seq), key).await.unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = handler.seen.lock().clone();
        assert_eq!(seen.len(), 60);
        for key in [1u64, 2, 7] {
            let order: Vec<u64> = seen.iter().filter(|(k, _)| *k == key).map(|(_, s)| *s).collect();
            assert_eq!(order, (0..20).collect::<Vec<_>>());
        }

        notify_shutdown.send(()).unwrap();
        drop(pool);
        assert_eq!(shutdown_complete_rx.recv().await, None);
    }

    #[tokio::test]
    async fn panicked_worker_is_restarted() {
        #[derive(Clone)]
        struct PanicHandler {
            handled: Arc<AtomicU64>,
        }

        impl PoolHandler<bool> for PanicHandler {
            fn handle(&self, should_panic: bool) -> impl Future<Output = ()> + Send {
                let handled = self.handled.clone();
                async move {
                    if should_panic {
                        panic!("Test panic");
                    }
                    handled.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let handler = PanicHandler {
            handled: Arc::new(AtomicU64::new(0)),
        };
        let (router, receivers) = task_channels(1, 10);
        let pool = MultipleChannelWorkerPool::new(
            notify_shutdown,
            shutdown_complete_tx,
            handler.clone(),
            router,
            receivers,
            settings(1),
        );

        pool.router().send(true, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        pool.router().send(false, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closing_the_router_stops_workers() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let handler = RecordingHandler {
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let (router, receivers) = task_channels::<(u64, u64)>(2, 10);
        let pool = MultipleChannelWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx,
            handler,
            router.clone(),
            receivers,
            settings(2),
        );
        router.close();
        assert!(router.try_send((0, 0), 0).is_err());

        // the monitor only stops on the broadcast
        notify_shutdown.send(()).unwrap();
        drop(pool);
        assert_eq!(shutdown_complete_rx.recv().await, None);
    }

    #[tokio::test]
    async fn shutdown_before_first_poll_is_observed() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let handler = RecordingHandler {
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let (router, receivers) = task_channels::<(u64, u64)>(2, 10);
        let pool = MultipleChannelWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx,
            handler,
            router,
            receivers,
            settings(2),
        );

        // current-thread runtime: nothing spawned has run yet
        notify_shutdown.send(()).unwrap();
        drop(pool);
        let finished = time::timeout(Duration::from_secs(5), shutdown_complete_rx.recv()).await;
        assert!(matches!(finished, Ok(None)));
    }
}
