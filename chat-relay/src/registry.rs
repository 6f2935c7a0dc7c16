//! Live-connection directory owned by the relay's event loop.
//!
//! The registry is never shared across tasks; the loop holds it by `&mut`, so
//! nothing in here locks. Failed writes never remove a connection on the spot.
//! They flag it, and [`Registry::sweep`] drops flagged connections at the end
//! of the loop iteration.

use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    task::AbortHandle,
    time::{Instant, timeout},
};
use tracing::{debug, warn};

use crate::{
    arena::{Arena, SlotId},
    codec::{MAX_FRAME_LEN, write_frame},
};

pub type ConnectionId = SlotId;

/// How long one write may wait on a peer that is not reading before the
/// connection is given up on.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of one connection.
///
/// `Pending` and `Closed` are never stored: a connection is `Pending` until
/// [`Registry::try_admit`] returns and `Closed` once it has left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Admitted,
    Registered,
    Closing,
    Closed,
}

pub struct Connection<W> {
    peer: Option<SocketAddr>,
    username: String,
    state: ConnectionState,
    registered_seq: u64,
    writer: W,
    reader: Option<AbortHandle>,
    closing_deadline: Option<Instant>,
    doomed: bool,
}

impl<W> Connection<W> {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

impl<W> Drop for Connection<W> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Admission refused because the registry is full.
///
/// Hands the writer back so the caller can still send `SV_FULL` before closing.
pub struct Rejected<W> {
    pub writer: W,
}

impl<W> std::fmt::Debug for Rejected<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rejected")
    }
}

pub struct Registry<W> {
    connections: Arena<Connection<W>>,
    max_clients: usize,
    next_seq: u64,
    write_timeout: Duration,
}

impl<W> Registry<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(max_clients: usize) -> Self {
        Self {
            connections: Arena::new(),
            max_clients,
            next_seq: 0,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn try_admit(
        &mut self,
        writer: W,
        peer: Option<SocketAddr>,
    ) -> Result<ConnectionId, Rejected<W>> {
        if self.connections.len() >= self.max_clients {
            return Err(Rejected { writer });
        }

        Ok(self.connections.insert(Connection {
            peer,
            username: String::new(),
            state: ConnectionState::Admitted,
            registered_seq: 0,
            writer,
            reader: None,
            closing_deadline: None,
            doomed: false,
        }))
    }

    /// Ties the connection's reader task to its registry entry so removal stops it.
    pub fn attach_reader(&mut self, id: ConnectionId, reader: AbortHandle) {
        match self.connections.get_mut(id) {
            Some(conn) => conn.reader = Some(reader),
            None => reader.abort(),
        }
    }

    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.connections
            .get(id)
            .map_or(ConnectionState::Closed, |conn| conn.state)
    }

    pub fn username(&self, id: ConnectionId) -> Option<&str> {
        self.connections.get(id).map(|conn| conn.username.as_str())
    }

    /// Sets or replaces the username. Returns `false` for unknown or closing connections.
    pub fn register(&mut self, id: ConnectionId, username: String) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        match conn.state {
            ConnectionState::Admitted => {
                conn.registered_seq = self.next_seq;
                self.next_seq += 1;
            }
            ConnectionState::Registered => {}
            _ => return false,
        }
        conn.username = username;
        conn.state = ConnectionState::Registered;
        true
    }

    /// Drops the connection, closing its writer and stopping its reader task.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection<W>> {
        self.connections.remove(id)
    }

    /// Registered usernames in the order they registered.
    pub fn list_usernames(&self) -> Vec<String> {
        let mut registered: Vec<_> = self
            .connections
            .iter()
            .map(|(_, conn)| conn)
            .filter(|conn| conn.state == ConnectionState::Registered)
            .collect();
        registered.sort_by_key(|conn| conn.registered_seq);
        registered
            .into_iter()
            .map(|conn| conn.username.clone())
            .collect()
    }

    /// Writes one frame to `id`. A failure or a stalled peer flags the connection
    /// for the next sweep.
    pub async fn send_to(&mut self, id: ConnectionId, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            warn!(conn = %id, len = payload.len(), "refusing to send oversized frame");
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame exceeds maximum length",
            ));
        }

        let write_timeout = self.write_timeout;
        let Some(conn) = self.connections.get_mut(id) else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection no longer registered",
            ));
        };
        let result = match timeout(write_timeout, write_frame(&mut conn.writer, payload)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer stopped reading",
            )),
        };
        if let Err(err) = result {
            debug!(conn = %id, error = ?err, "write failed; marking connection for removal");
            conn.doomed = true;
            return Err(err);
        }
        Ok(())
    }

    /// Delivers `payload` to every registered connection except `excluding`.
    ///
    /// Returns how many deliveries succeeded.
    pub async fn broadcast(&mut self, payload: &[u8], excluding: ConnectionId) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(id, conn)| {
                *id != excluding && conn.state == ConnectionState::Registered && !conn.doomed
            })
            .map(|(id, _)| id)
            .collect();

        let mut delivered = 0;
        for id in targets {
            if self.send_to(id, payload).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Moves the connection to `Closing` and shuts down its write side.
    ///
    /// The connection keeps its slot until the peer acknowledges or `deadline` passes.
    pub async fn begin_close(&mut self, id: ConnectionId, deadline: Instant) {
        let write_timeout = self.write_timeout;
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        conn.state = ConnectionState::Closing;
        conn.closing_deadline = Some(deadline);
        match timeout(write_timeout, conn.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(conn = %id, error = ?err, "shutdown of write side failed");
                conn.doomed = true;
            }
            Err(_) => {
                debug!(conn = %id, "shutdown of write side timed out");
                conn.doomed = true;
            }
        }
    }

    pub fn is_doomed(&self, id: ConnectionId) -> bool {
        self.connections.get(id).is_some_and(|conn| conn.doomed)
    }

    /// Removes flagged connections and closing connections whose deadline has passed.
    pub fn sweep(&mut self, now: Instant) -> Vec<Connection<W>> {
        let expired: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                conn.doomed || conn.closing_deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|(id, _)| id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                let conn = self.connections.remove(id)?;
                if !conn.doomed {
                    warn!(conn = %id, "no exit acknowledgment before deadline");
                }
                Some(conn)
            })
            .collect()
    }

    /// Removes every connection. Used on relay shutdown.
    pub fn close_all(&mut self) -> usize {
        let ids = self.connections.ids();
        let count = ids.len();
        for id in ids {
            self.connections.remove(id);
        }
        count
    }
}
