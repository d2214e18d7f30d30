use crate::connection::{Connection, ConnectionInfo};
use crate::error::TableError;
use gtunnel_proto::ConnectionId;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

struct TableInner {
    connections: HashMap<ConnectionId, Connection>,
    /// `None` once `ConnectionId::MAX` has been handed out
    next_id: Option<ConnectionId>,
    closed: bool,
}

/// Tunnel-scoped map of live connections
///
/// Ids handed out by [`add`](Self::add) start at 0 and strictly increase for
/// the table's lifetime; a removed id is never reused. Once
/// [`close_and_drain`](Self::close_and_drain) has run every insert fails, so a
/// connection can never slip in behind a shutdown.
pub struct ConnectionTable {
    inner: Mutex<TableInner>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                connections: HashMap::new(),
                next_id: Some(0),
                closed: false,
            }),
        }
    }

    /// Allocate the next free id, store the connection under it and return the id
    pub async fn add(&self, mut connection: Connection) -> Result<ConnectionId, TableError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(TableError::Closed);
        }

        // Ids registered by the peer may already occupy the counter's value
        let mut id = inner.next_id.ok_or(TableError::IdsExhausted)?;
        while inner.connections.contains_key(&id) {
            id = id.checked_add(1).ok_or(TableError::IdsExhausted)?;
        }
        inner.next_id = id.checked_add(1);

        connection.set_id(id);
        inner.connections.insert(id, connection);
        debug!(
            connection_id = id,
            active_connections = inner.connections.len(),
            "Connection registered"
        );
        Ok(id)
    }

    /// Store a connection under an id chosen by the peer
    ///
    /// Returns `Ok(false)` if the id is already taken; the rejected connection
    /// is dropped, which closes its socket.
    pub async fn insert_if_absent(
        &self,
        id: ConnectionId,
        mut connection: Connection,
    ) -> Result<bool, TableError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(TableError::Closed);
        }
        if inner.connections.contains_key(&id) {
            return Ok(false);
        }

        connection.set_id(id);
        inner.connections.insert(id, connection);
        debug!(
            connection_id = id,
            active_connections = inner.connections.len(),
            "Peer connection registered"
        );
        Ok(true)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner
            .lock()
            .await
            .connections
            .get(&id)
            .map(Connection::info)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().await.connections.contains_key(&id)
    }

    /// Run `f` against the stored connection while holding the table lock
    pub async fn with_connection<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        self.inner.lock().await.connections.get_mut(&id).map(f)
    }

    /// Take a connection out of the table; the caller owns closing it
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.lock().await;
        let removed = inner.connections.remove(&id);
        if removed.is_some() {
            debug!(
                connection_id = id,
                active_connections = inner.connections.len(),
                "Connection unregistered"
            );
        }
        removed
    }

    /// Info for every live connection, ordered by id
    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let inner = self.inner.lock().await;
        let mut infos: Vec<_> = inner.connections.values().map(Connection::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Refuse further inserts and hand back every live connection
    pub async fn close_and_drain(&self) -> Vec<Connection> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        let mut drained: Vec<_> = inner.connections.drain().map(|(_, c)| c).collect();
        drained.sort_by_key(Connection::id);
        drained
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
