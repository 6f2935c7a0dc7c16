use std::time::Duration;

use tokio::{io::AsyncWrite, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    chat_log::ChatLog,
    protocol::{Command, MAX_USERNAME_LEN, ServerMessage},
    registry::{ConnectionId, Registry},
};

/// How long a connection that sent `$exit` may take to acknowledge the farewell.
pub const EXIT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened to the originating connection after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// `$exit` was processed; the connection waits for its acknowledgment.
    Closing,
    /// The connection was removed from the registry.
    Closed,
}

pub struct Dispatcher {
    log: ChatLog,
    exit_ack_timeout: Duration,
}

impl Dispatcher {
    pub fn new(log: ChatLog) -> Self {
        Self {
            log,
            exit_ack_timeout: EXIT_ACK_TIMEOUT,
        }
    }

    pub fn with_exit_ack_timeout(mut self, timeout: Duration) -> Self {
        self.exit_ack_timeout = timeout;
        self
    }

    pub fn log(&self) -> &ChatLog {
        &self.log
    }

    /// Handles one decoded frame from `id`. Runs to completion before the next frame.
    pub async fn dispatch<W>(
        &self,
        registry: &mut Registry<W>,
        id: ConnectionId,
        payload: &[u8],
    ) -> Outcome
    where
        W: AsyncWrite + Unpin,
    {
        let text = String::from_utf8_lossy(payload);
        let username = registry.username(id).unwrap_or_default().to_string();
        debug!(conn = %id, user = %username, message = %text, "received");

        match Command::parse(&text) {
            Command::Register { username } => self.register(registry, id, username).await,
            Command::GetList => {
                let roster = ServerMessage::roster(&registry.list_usernames());
                reply(registry, id, &roster).await;
                Outcome::Continue
            }
            Command::GetLog => {
                let message = match self.log.read_all().await {
                    Ok(contents) => ServerMessage::log(&String::from_utf8_lossy(&contents)),
                    Err(err) => {
                        warn!(path = %self.log.path().display(), error = ?err, "chat log unavailable");
                        ServerMessage::Log(format!("Unable to read chat log: {err}"))
                    }
                };
                reply(registry, id, &message).await;
                Outcome::Continue
            }
            Command::Exit => {
                reply(registry, id, &ServerMessage::farewell()).await;
                info!(conn = %id, user = %username, "client requested exit");
                registry
                    .begin_close(id, Instant::now() + self.exit_ack_timeout)
                    .await;
                Outcome::Closing
            }
            Command::Chat { text } => {
                self.chat(registry, id, &username, &text).await;
                Outcome::Continue
            }
        }
    }

    async fn register<W>(
        &self,
        registry: &mut Registry<W>,
        id: ConnectionId,
        username: String,
    ) -> Outcome
    where
        W: AsyncWrite + Unpin,
    {
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            debug!(conn = %id, len = username.len(), "username refused");
            reply(registry, id, &ServerMessage::Invalid).await;
            return Outcome::Continue;
        }

        // Admission already bounds the registry, so this only trips if the limit shrank.
        if registry.len() > registry.max_clients() {
            reply(registry, id, &ServerMessage::Full).await;
            registry.remove(id);
            info!(conn = %id, "registration refused; server full");
            return Outcome::Closed;
        }

        registry.register(id, username.clone());
        info!(conn = %id, user = %username, "client registered");
        reply(registry, id, &ServerMessage::Success).await;
        Outcome::Continue
    }

    async fn chat<W>(&self, registry: &mut Registry<W>, id: ConnectionId, username: &str, text: &str)
    where
        W: AsyncWrite + Unpin,
    {
        // Blank text still goes out as `(<user>): `, same as any other line.
        let line = ServerMessage::chat(username, text).to_string();
        if let Err(err) = self.log.append(&line).await {
            warn!(path = %self.log.path().display(), error = ?err, "failed to append to chat log");
        }
        let delivered = registry.broadcast(line.as_bytes(), id).await;
        debug!(conn = %id, delivered, "chat broadcast");
    }
}

async fn reply<W>(registry: &mut Registry<W>, id: ConnectionId, message: &ServerMessage)
where
    W: AsyncWrite + Unpin,
{
    // A failed reply flags the connection; the loop's sweep takes it from there.
    let _ = registry.send_to(id, &message.to_payload()).await;
}
