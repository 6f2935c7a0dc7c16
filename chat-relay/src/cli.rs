use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};

use crate::{
    discovery::{DEFAULT_DISCOVERY_PORT, DiscoveryConfig},
    dispatch::EXIT_ACK_TIMEOUT,
    registry::WRITE_TIMEOUT,
    relay::RelayConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay and announce it on the local network.
    Server(ServerArgs),
    /// Connect to a relay and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to listen on, as host:port. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:5000")]
    pub listen: String,

    /// Maximum number of simultaneous connections.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_clients: u16,

    /// IP address placed in discovery announcements.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub advertise: IpAddr,

    /// UDP port discovery announcements are sent to.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// Destination address for discovery announcements.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::BROADCAST))]
    pub broadcast_addr: IpAddr,

    /// Do not announce the relay over UDP.
    #[arg(long)]
    pub no_discovery: bool,

    /// File the chat history is appended to.
    #[arg(long, default_value = "chat_log.txt")]
    pub log_file: PathBuf,
}

impl ServerArgs {
    pub fn into_config(self) -> RelayConfig {
        let discovery = (!self.no_discovery).then(|| DiscoveryConfig {
            advertise_ip: self.advertise,
            discovery_port: self.discovery_port,
            broadcast_ip: self.broadcast_addr,
        });

        RelayConfig {
            listen: self.listen,
            max_clients: usize::from(self.max_clients),
            log_path: self.log_file,
            discovery,
            exit_ack_timeout: EXIT_ACK_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username to register with.
    #[arg(long)]
    pub username: String,

    /// Relay address. When omitted the client waits for a discovery announcement.
    #[arg(long)]
    pub server: Option<SocketAddr>,

    /// UDP port to listen on for discovery announcements.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// File fetched chat logs are appended to.
    #[arg(long, default_value = "client_log.txt")]
    pub log_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::try_parse_from(["chat-relay", "server"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        let config = args.into_config();

        assert_eq!(config.listen, "0.0.0.0:5000");
        assert_eq!(config.max_clients, 3);
        assert_eq!(config.log_path, PathBuf::from("chat_log.txt"));
        let discovery = config.discovery.expect("discovery on by default");
        assert_eq!(discovery.target(), "255.255.255.255:5000".parse::<SocketAddr>().expect("addr"));
    }

    #[test]
    fn server_without_discovery() {
        let cli = Cli::try_parse_from([
            "chat-relay",
            "server",
            "--listen",
            "127.0.0.1:0",
            "--max-clients",
            "2",
            "--no-discovery",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        let config = args.into_config();

        assert_eq!(config.max_clients, 2);
        assert!(config.discovery.is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(Cli::try_parse_from(["chat-relay", "server", "--max-clients", "0"]).is_err());
    }

    #[test]
    fn client_requires_username() {
        assert!(Cli::try_parse_from(["chat-relay", "client"]).is_err());

        let cli = Cli::try_parse_from([
            "chat-relay",
            "client",
            "--username",
            "alice",
            "--server",
            "127.0.0.1:5000",
        ])
        .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.username, "alice");
        assert_eq!(args.server, Some("127.0.0.1:5000".parse::<SocketAddr>().expect("addr")));
    }
}
