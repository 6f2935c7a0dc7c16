use std::{io, net::SocketAddr, process::ExitCode};

use thiserror::Error;

/// Failure to read a complete frame off a connection.
///
/// Every variant ends the connection's lifecycle; the distinction only matters for logging.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("declared frame size {len} exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Listener setup failures. Each stage exits the process with its own status.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to resolve listen address '{addr}'")]
    Resolve {
        addr: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("failed to create server socket")]
    Setup(#[source] io::Error),
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen on {addr}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl StartupError {
    pub fn status(&self) -> u8 {
        match self {
            StartupError::Resolve { .. } => exit_status::ADDRESS_ERROR,
            StartupError::Setup(_) => exit_status::SETUP_ERROR,
            StartupError::Bind { .. } => exit_status::BIND_ERROR,
            StartupError::Listen { .. } => exit_status::LISTEN_ERROR,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.status())
    }
}

/// Process exit statuses shared by the server and client subcommands.
pub mod exit_status {
    pub const STARTUP_ERROR: u8 = 1;
    pub const ADDRESS_ERROR: u8 = 2;
    pub const SETUP_ERROR: u8 = 3;
    pub const BIND_ERROR: u8 = 4;
    pub const LISTEN_ERROR: u8 = 5;
    pub const CONNECT_ERROR: u8 = 6;
}
