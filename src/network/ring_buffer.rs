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

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{AppError, AppResult};

/// Fixed capacity byte queue shared between producer and consumer tasks.
///
/// One slot is always kept free so that `head == tail` means empty, which gives
/// `available_read + available_write == capacity - 1`. Blocking `read`/`write`
/// transfer exactly the requested number of bytes or fail; closing the buffer
/// is the escape path for any task waiting on it.
pub struct RingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
    readable: Notify,
    writable: Notify,
}

struct RingState {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    closed: bool,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn available_read(&self) -> usize {
        (self.tail + self.capacity() - self.head) % self.capacity()
    }

    fn available_write(&self) -> usize {
        self.capacity() - 1 - self.available_read()
    }

    fn put(&mut self, data: &[u8]) {
        let capacity = self.capacity();
        let first = data.len().min(capacity - self.tail);
        self.buf[self.tail..self.tail + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.tail = (self.tail + data.len()) % capacity;
    }

    fn take(&mut self, out: &mut [u8]) {
        let capacity = self.capacity();
        let first = out.len().min(capacity - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        let rest = out.len() - first;
        if rest > 0 {
            out[first..].copy_from_slice(&self.buf[..rest]);
        }
        self.head = (self.head + out.len()) % capacity;
    }

    fn take_bytes(&mut self, len: usize) -> Bytes {
        let mut out = vec![0u8; len];
        self.take(&mut out);
        Bytes::from(out)
    }
}

impl RingBuffer {
    /// `capacity` includes the slot that is never filled.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        RingBuffer {
            capacity,
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest request that can ever be satisfied.
    pub fn max_transfer(&self) -> usize {
        self.capacity - 1
    }

    pub fn available_read(&self) -> usize {
        self.state.lock().available_read()
    }

    pub fn available_write(&self) -> usize {
        self.state.lock().available_write()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wakes every waiter. Writes fail from now on, reads keep draining what is
    /// left and then fail with `PeerClosed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn ensure_fits(&self, len: usize) -> AppResult<()> {
        if len > self.max_transfer() {
            return Err(AppError::InvalidValue(format!(
                "transfer of {} bytes exceeds ring buffer limit of {}",
                len,
                self.max_transfer()
            )));
        }
        Ok(())
    }

    /// Waits until `data` fits, then copies all of it.
    pub async fn write(&self, data: &[u8]) -> AppResult<usize> {
        self.ensure_fits(data.len())?;
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_write_exact(data)? {
                return Ok(data.len());
            }
            notified.await;
        }
    }

    /// Waits until `into.len()` bytes are buffered, then fills `into`.
    pub async fn read(&self, into: &mut [u8]) -> AppResult<usize> {
        self.ensure_fits(into.len())?;
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.available_read() >= into.len() {
                    state.take(into);
                    drop(state);
                    self.writable.notify_waiters();
                    return Ok(into.len());
                }
                if state.closed {
                    return Err(AppError::PeerClosed);
                }
            }
            notified.await;
        }
    }

    /// Waits for at least one byte and returns up to `max` of them.
    pub async fn read_some(&self, max: usize) -> AppResult<Bytes> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.available_read() == 0 && state.closed {
                    return Err(AppError::PeerClosed);
                }
            }
            let chunk = self.try_read_available(max);
            if !chunk.is_empty() {
                return Ok(chunk);
            }
            notified.await;
        }
    }

    /// All-or-nothing write that never waits.
    pub fn try_write_exact(&self, data: &[u8]) -> AppResult<bool> {
        self.ensure_fits(data.len())?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(AppError::PeerClosed);
        }
        if state.available_write() < data.len() {
            return Ok(false);
        }
        state.put(data);
        drop(state);
        if !data.is_empty() {
            self.readable.notify_waiters();
        }
        Ok(true)
    }

    /// Drains up to `max` buffered bytes without waiting.
    pub fn try_read_available(&self, max: usize) -> Bytes {
        let mut state = self.state.lock();
        let len = state.available_read().min(max);
        if len == 0 {
            return Bytes::new();
        }
        let chunk = state.take_bytes(len);
        drop(state);
        self.writable.notify_waiters();
        chunk
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("available_read", &state.available_read())
            .field("closed", &state.closed)
            .finish()
    }
}
