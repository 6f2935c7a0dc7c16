use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, broadcast},
};
use tracing::{info, warn};

use crate::{
    chat_log::ChatLog,
    cli::ClientArgs,
    codec::{read_frame, write_frame},
    discovery,
    protocol::{EXIT_ACK, ServerMessage},
};

const PROMPT: &str = "Enter command or message: ";
const CLEAR_LINE: &str = "\x1b[2K\r";

const HELP_TEXT: &str = "Available commands:

$register username: Registers a new user with the specified username. Returns SV_SUCCESS if successful, or SV_FULL if the server is at capacity.

$getlist: Returns a list of connected users.

$getlog: Returns the chat log.

$exit: Disconnects the user from the server.

$chat message: Sends a message to all connected clients.

$quit: Leaves immediately without telling the server.

$help: Displays this help message.
";

/// A connection that has passed the relay's admission check.
pub struct ChatClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl ChatClient {
    /// Connects and waits for the admission reply.
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(server)
            .await
            .with_context(|| format!("failed to connect to {server}"))?;
        info!("connected to {server}");

        let (mut reader, writer) = stream.into_split();
        match read_reply(&mut reader).await? {
            ServerMessage::Success => Ok(Self { reader, writer }),
            ServerMessage::Full => bail!("server is full, please try again later"),
            other => bail!("unexpected admission reply: {other}"),
        }
    }

    pub async fn register(&mut self, username: &str) -> Result<()> {
        self.send(&format!("$register {username}")).await?;
        match read_reply(&mut self.reader).await? {
            ServerMessage::Success => Ok(()),
            ServerMessage::Full => bail!("server is full, please try again later"),
            ServerMessage::Invalid => bail!("username '{username}' was refused"),
            other => bail!("failed to register user: {other}"),
        }
    }

    pub async fn send(&mut self, line: &str) -> Result<()> {
        write_frame(&mut self.writer, line.as_bytes())
            .await
            .context("failed to send to server")
    }

    pub async fn recv(&mut self) -> Result<ServerMessage> {
        read_reply(&mut self.reader).await
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        (self.reader, self.writer)
    }
}

async fn read_reply(reader: &mut OwnedReadHalf) -> Result<ServerMessage> {
    let payload = read_frame(reader)
        .await
        .context("failed to receive message from server")?;
    Ok(ServerMessage::parse(&payload))
}

/// Establishes a registered session. Failures here are connection failures.
pub async fn connect(args: &ClientArgs) -> Result<ChatClient> {
    let server = match args.server {
        Some(server) => server,
        None => {
            info!(port = args.discovery_port, "waiting for relay announcement");
            discovery::discover(args.discovery_port).await?
        }
    };

    let mut client = ChatClient::connect(server).await?;
    client.register(&args.username).await?;
    Ok(client)
}

pub async fn run(client: ChatClient, log_path: PathBuf) -> Result<()> {
    let (reader, writer) = client.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let (cancel_tx, _) = broadcast::channel::<()>(1);

    let server_task = tokio::spawn(read_server_messages(
        reader,
        Arc::clone(&writer),
        ChatLog::new(log_path),
        cancel_tx.clone(),
    ));
    let input_task = tokio::spawn(read_user_input(Arc::clone(&writer), cancel_tx.clone()));

    let (server_result, input_result) = tokio::join!(server_task, input_task);
    server_result.context("server reader panicked")??;
    input_result.context("input reader panicked")??;

    shutdown_connection(&writer).await;
    Ok(())
}

/// Action for one line of local input.
#[derive(Debug, PartialEq, Eq)]
pub enum InputAction {
    Help,
    Quit,
    Send(String),
    Skip,
}

impl InputAction {
    pub fn from_line(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" => InputAction::Skip,
            "$help" => InputAction::Help,
            "$quit" => InputAction::Quit,
            _ => InputAction::Send(line.to_string()),
        }
    }
}

/// Terminal text for a server message, or `None` for messages that print nothing.
pub fn render(message: &ServerMessage) -> Option<String> {
    match message {
        ServerMessage::Chat(line) => Some(format!("{CLEAR_LINE}CHAT {line}\n{PROMPT}")),
        ServerMessage::List(body) | ServerMessage::Log(body) => {
            Some(format!("{CLEAR_LINE}{body}\n{PROMPT}"))
        }
        ServerMessage::Exit(farewell) => Some(format!("{CLEAR_LINE}{farewell}\n")),
        ServerMessage::Full => Some("Server is currently full\n".to_string()),
        ServerMessage::Success | ServerMessage::Invalid | ServerMessage::Other(_) => None,
    }
}

async fn read_server_messages(
    mut reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    client_log: ChatLog,
    cancel: broadcast::Sender<()>,
) -> Result<()> {
    let mut cancelled = cancel.subscribe();

    loop {
        let payload = select! {
            _ = cancelled.recv() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(payload) => payload,
                Err(err) => {
                    write_stderr(&format!("Connection lost: {err}")).await?;
                    break;
                }
            },
        };

        let message = ServerMessage::parse(&payload);
        if let ServerMessage::Log(body) = &message {
            if let Err(err) = client_log.append_raw(format!("{body}\n").as_bytes()).await {
                warn!(path = %client_log.path().display(), error = ?err, "failed to save fetched log");
            }
        }
        if let Some(text) = render(&message) {
            write_stdout(&text).await?;
        }

        match message {
            ServerMessage::Exit(_) => {
                let mut writer = writer.lock().await;
                if let Err(err) = write_frame(&mut *writer, EXIT_ACK.as_bytes()).await {
                    warn!(error = ?err, "failed to acknowledge exit");
                }
                break;
            }
            ServerMessage::Full => break,
            _ => {}
        }
    }

    let _ = cancel.send(());
    Ok(())
}

async fn read_user_input(
    writer: Arc<Mutex<OwnedWriteHalf>>,
    cancel: broadcast::Sender<()>,
) -> Result<()> {
    let mut cancelled = cancel.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        write_stdout(PROMPT).await?;
        let line = select! {
            _ = cancelled.recv() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        match InputAction::from_line(&line) {
            InputAction::Skip => {}
            InputAction::Help => write_stdout(HELP_TEXT).await?,
            InputAction::Quit => {
                write_stdout("You have quit the chat\n").await?;
                break;
            }
            InputAction::Send(text) => {
                let mut writer = writer.lock().await;
                if let Err(err) = write_frame(&mut *writer, text.as_bytes()).await {
                    write_stderr(&format!("Error: failed to send: {err}")).await?;
                    break;
                }
            }
        }
    }

    let _ = cancel.send(());
    Ok(())
}

async fn shutdown_connection(writer: &Mutex<OwnedWriteHalf>) {
    if let Err(error) = writer.lock().await.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(text: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
