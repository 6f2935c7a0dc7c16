use std::{future::Future, io, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpSocket, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    time::{Instant, MissedTickBehavior, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    chat_log::ChatLog,
    codec::{read_frame, write_frame},
    discovery::{DiscoveryConfig, spawn_broadcaster},
    dispatch::{Dispatcher, EXIT_ACK_TIMEOUT, Outcome},
    error::{FrameError, StartupError},
    protocol::ServerMessage,
    registry::{ConnectionId, ConnectionState, Registry, WRITE_TIMEOUT},
};

/// Upper bound on how long the loop waits before re-checking its connection set.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: u32 = 1024;
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `host:port` to listen on; resolved at bind time.
    pub listen: String,
    pub max_clients: usize,
    pub log_path: PathBuf,
    /// `None` disables the discovery broadcaster.
    pub discovery: Option<DiscoveryConfig>,
    pub exit_ack_timeout: Duration,
    /// Longest a single write may block on one peer.
    pub write_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            max_clients: 3,
            log_path: PathBuf::from("chat_log.txt"),
            discovery: Some(DiscoveryConfig::default()),
            exit_ack_timeout: EXIT_ACK_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
}

impl Relay {
    /// Resolves, binds and listens as separate steps so each failure is reported on its own.
    pub async fn bind(config: RelayConfig) -> Result<Self, StartupError> {
        let addr = resolve(&config.listen).await?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(StartupError::Setup)?;
        socket.set_reuseaddr(true).map_err(StartupError::Setup)?;
        socket
            .bind(addr)
            .map_err(|source| StartupError::Bind { addr, source })?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|source| StartupError::Listen { addr, source })?;

        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, config } = self;
        tokio::pin!(shutdown);

        let broadcaster = match &config.discovery {
            Some(discovery) => Some(spawn_broadcaster(discovery, listener.local_addr()?.port())),
            None => None,
        };

        let dispatcher = Dispatcher::new(ChatLog::new(&config.log_path))
            .with_exit_ack_timeout(config.exit_ack_timeout);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut state = LoopState {
            registry: Registry::new(config.max_clients).with_write_timeout(config.write_timeout),
            dispatcher,
            inbound_tx,
            write_timeout: config.write_timeout,
        };

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    state.handle_accept_result(accept_result).await;
                }
                Some(inbound) = inbound_rx.recv() => {
                    state.handle_inbound(inbound).await;
                }
                _ = poll.tick() => {}
            }

            state.sweep();
        }

        handle_shutdown(&mut state.registry);
        if let Some(broadcaster) = broadcaster {
            broadcaster.abort();
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn resolve(listen: &str) -> Result<SocketAddr, StartupError> {
    let mut addrs = tokio::net::lookup_host(listen)
        .await
        .map_err(|source| StartupError::Resolve {
            addr: listen.to_string(),
            source: Some(source),
        })?;
    addrs.next().ok_or_else(|| StartupError::Resolve {
        addr: listen.to_string(),
        source: None,
    })
}

fn handle_shutdown(registry: &mut Registry<OwnedWriteHalf>) {
    let closed = registry.close_all();
    info!(closed, "relay shutting down");
}

/// Event reported by a connection's reader task.
enum Inbound {
    Frame { id: ConnectionId, payload: Vec<u8> },
    Closed { id: ConnectionId, error: FrameError },
}

struct LoopState {
    registry: Registry<OwnedWriteHalf>,
    dispatcher: Dispatcher,
    inbound_tx: mpsc::Sender<Inbound>,
    write_timeout: Duration,
}

impl LoopState {
    async fn handle_accept_result(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, peer)) => self.admit(stream, peer).await,
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }

    async fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();

        let id = match self.registry.try_admit(writer, Some(peer)) {
            Ok(id) => id,
            Err(rejected) => {
                info!(%peer, max = self.registry.max_clients(), "server full; rejecting connection");
                reject(rejected.writer, self.write_timeout).await;
                return;
            }
        };

        let task = tokio::spawn(forward_frames(id, reader, self.inbound_tx.clone()));
        self.registry.attach_reader(id, task.abort_handle());

        info!(conn = %id, %peer, "new client connected");
        // A failed handshake flags the connection; the sweep after this iteration drops it.
        let _ = self
            .registry
            .send_to(id, &ServerMessage::Success.to_payload())
            .await;
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Frame { id, payload } => match self.registry.state(id) {
                // Stale frame from a connection that already left.
                ConnectionState::Closed => {}
                ConnectionState::Closing => {
                    debug!(conn = %id, "exit acknowledged");
                    self.disconnect(id);
                }
                _ if self.registry.is_doomed(id) => {}
                _ => match self.dispatcher.dispatch(&mut self.registry, id, &payload).await {
                    Outcome::Continue => {}
                    Outcome::Closing => debug!(conn = %id, "awaiting exit acknowledgment"),
                    Outcome::Closed => debug!(conn = %id, "connection dropped by dispatcher"),
                },
            },
            Inbound::Closed { id, error } => {
                debug!(conn = %id, error = %error, "reader finished");
                self.disconnect(id);
            }
        }
    }

    fn disconnect(&mut self, id: ConnectionId) {
        if let Some(conn) = self.registry.remove(id) {
            info!(conn = %id, user = %conn.username(), peer = ?conn.peer(), "client disconnected");
        }
    }

    fn sweep(&mut self) {
        for conn in self.registry.sweep(Instant::now()) {
            info!(user = %conn.username(), peer = ?conn.peer(), "client disconnected");
        }
    }
}

async fn reject(mut writer: OwnedWriteHalf, write_timeout: Duration) {
    let payload = ServerMessage::Full.to_payload();
    let notify = write_frame(&mut writer, &payload);
    match timeout(write_timeout, notify).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = ?err, "failed to notify rejected client"),
        Err(_) => debug!("rejected client stopped reading"),
    }
    let _ = writer.shutdown().await;
}

/// Decodes frames off one connection and hands them to the event loop.
///
/// Only complete frames are forwarded; the first failure is reported once and ends the task.
async fn forward_frames(id: ConnectionId, mut reader: OwnedReadHalf, tx: mpsc::Sender<Inbound>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(payload) => {
                if tx.send(Inbound::Frame { id, payload }).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                let _ = tx.send(Inbound::Closed { id, error }).await;
                break;
            }
        }
    }
}
