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

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Connection, ConnectionId};
use crate::service::{AppError, AppResult};

/// Bounded registry of live connections keyed by handle.
#[derive(Debug)]
pub struct ConnectionTable {
    max_connections: usize,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        ConnectionTable {
            max_connections,
            connections: RwLock::new(HashMap::with_capacity(max_connections.min(1024))),
        }
    }

    /// Fails with `ResourceExhausted` when the table is full; entries already
    /// present are untouched.
    pub fn insert(&self, connection: Arc<Connection>) -> AppResult<()> {
        let mut connections = self.connections.write();
        if connections.len() >= self.max_connections {
            return Err(AppError::ResourceExhausted(format!(
                "connection table full ({} entries)",
                self.max_connections
            )));
        }
        if connections.contains_key(&connection.id()) {
            return Err(AppError::IllegalStateError(format!(
                "connection {} already registered",
                connection.id()
            )));
        }
        connections.insert(connection.id(), connection);
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Copies the current entries so callers can iterate without the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{next_connection_id, Role};
    use crate::service::EngineConfig;
    use crate::utils::Clock;

    fn connection() -> Arc<Connection> {
        Arc::new(Connection::new(
            next_connection_id(),
            "127.0.0.1:7000".parse().unwrap(),
            Role::Passive,
            Box::new(tokio::io::sink()),
            &EngineConfig::default(),
            Clock::new(),
            true,
        ))
    }

    #[tokio::test]
    async fn full_table_rejects_new_entries() {
        let table = ConnectionTable::new(4);
        let admitted: Vec<_> = (0..4).map(|_| connection()).collect();
        for conn in &admitted {
            table.insert(conn.clone()).unwrap();
        }

        let err = table.insert(connection()).unwrap_err();
        assert!(matches!(err, AppError::ResourceExhausted(_)));
        assert_eq!(table.len(), 4);
        for conn in &admitted {
            assert!(table.contains(conn.id()));
        }

        table.remove(admitted[0].id());
        table.insert(connection()).unwrap();
        assert_eq!(table.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_id_is_refused() {
        let table = ConnectionTable::new(4);
        let conn = connection();
        table.insert(conn.clone()).unwrap();
        assert!(matches!(
            table.insert(conn.clone()),
            Err(AppError::IllegalStateError(_))
        ));
        assert_eq!(table.remove(conn.id()).map(|c| c.id()), Some(conn.id()));
        assert!(table.is_empty());
        assert!(table.get(conn.id()).is_none());
    }
}
