use std::{net::SocketAddr, path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use chat_relay::{
    codec::{read_frame, write_frame},
    error::exit_status,
    protocol::ServerMessage,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const BINARY: &str = env!("CARGO_BIN_EXE_chat-relay");

#[tokio::test]
async fn server_binary_relays_chat() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("chat_log.txt");

    let (mut server, mut stdout) = spawn_server(&[
        "--listen",
        "127.0.0.1:0",
        "--max-clients",
        "2",
        "--no-discovery",
        "--log-file",
        log_path.to_str().context("utf-8 temp path")?,
    ])?;
    let addr = read_listen_addr(&mut stdout).await?;

    // Drain remaining server logs in the background so the pipe never fills.
    let drain = tokio::spawn(async move {
        let mut line = String::new();
        while matches!(stdout.read_line(&mut line).await, Ok(n) if n > 0) {
            line.clear();
        }
    });

    let mut alice = join(addr, "alice").await?;
    let mut bob = join(addr, "bob").await?;

    let mut overflow = TcpStream::connect(addr).await?;
    assert_eq!(recv(&mut overflow).await?, ServerMessage::Full);

    write_frame(&mut alice, b"$chat hello from the binary").await?;
    assert_eq!(
        recv(&mut bob).await?,
        ServerMessage::Chat("(alice): hello from the binary".into())
    );

    write_frame(&mut bob, b"$getlist").await?;
    assert_eq!(recv(&mut bob).await?, ServerMessage::List("alice,bob".into()));

    let log = tokio::fs::read_to_string(&log_path).await?;
    assert!(log.trim_end().ends_with("CHAT (alice): hello from the binary"));

    let _ = server.kill().await;
    let _ = server.wait().await;
    let _ = drain.await;
    Ok(())
}

#[tokio::test]
async fn unresolvable_listen_address_exits_with_address_status() -> Result<()> {
    let status = Command::new(BINARY)
        .args(["server", "--listen", "no port here", "--no-discovery"])
        .env("RUST_LOG", "off")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    assert_eq!(status.code(), Some(i32::from(exit_status::ADDRESS_ERROR)));
    Ok(())
}

#[tokio::test]
async fn occupied_port_exits_with_bind_status() -> Result<()> {
    let holder = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = holder.local_addr()?.to_string();

    let status = Command::new(BINARY)
        .args(["server", "--listen", &addr, "--no-discovery"])
        .env("RUST_LOG", "off")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    assert_eq!(status.code(), Some(i32::from(exit_status::BIND_ERROR)));
    drop(holder);
    Ok(())
}

fn spawn_server(args: &[&str]) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut child = Command::new(Path::new(BINARY))
        .arg("server")
        .args(args)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;
    Ok((child, BufReader::new(stdout)))
}

async fn read_listen_addr(reader: &mut BufReader<ChildStdout>) -> Result<SocketAddr> {
    loop {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for listen banner"))??;
        if bytes == 0 {
            return Err(anyhow!("server exited before announcing its address"));
        }
        if line.contains("listening on") {
            let addr = line
                .split_whitespace()
                .last()
                .context("unexpected banner format")?;
            return addr
                .parse()
                .with_context(|| format!("banner missing socket address: {line}"));
        }
    }
}

async fn join(addr: SocketAddr, username: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    assert_eq!(recv(&mut stream).await?, ServerMessage::Success);
    write_frame(&mut stream, format!("$register {username}").as_bytes()).await?;
    assert_eq!(recv(&mut stream).await?, ServerMessage::Success);
    Ok(stream)
}

async fn recv(stream: &mut TcpStream) -> Result<ServerMessage> {
    let payload = timeout(READ_TIMEOUT, read_frame(stream)).await??;
    Ok(ServerMessage::parse(&payload))
}
