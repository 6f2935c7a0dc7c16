//! Zero-configuration discovery over UDP broadcast.
//!
//! The relay announces `"<ip>:<port>"` once per interval; clients that were
//! not told an address wait for one such datagram and connect to it.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tokio::{net::UdpSocket, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info};

pub const DEFAULT_DISCOVERY_PORT: u16 = 5000;
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

const MAX_DATAGRAM_LEN: usize = 256;

/// Where and what the relay announces.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// IP clients should connect to; the relay appends its own listening port.
    pub advertise_ip: IpAddr,
    pub discovery_port: u16,
    pub broadcast_ip: IpAddr,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            advertise_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
        }
    }
}

impl DiscoveryConfig {
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_ip, self.discovery_port)
    }
}

pub struct Broadcaster {
    socket: UdpSocket,
    announcement: String,
    target: SocketAddr,
    interval: Duration,
}

impl Broadcaster {
    pub async fn bind(announcement: String, target: SocketAddr) -> Result<Self> {
        let bind_addr: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("failed to create discovery socket")?;
        socket
            .set_broadcast(true)
            .context("failed to enable broadcast on discovery socket")?;

        Ok(Self {
            socket,
            announcement,
            target,
            interval: ANNOUNCE_INTERVAL,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Announces forever. The first failed send ends the loop; it is not retried.
    pub async fn run(self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.socket
                .send_to(self.announcement.as_bytes(), self.target)
                .await
                .with_context(|| format!("failed to send discovery datagram to {}", self.target))?;
            debug!(dest = %self.target, announcement = %self.announcement, "announced");
        }
    }
}

/// Starts announcing `<advertise_ip>:<relay_port>` on its own task.
///
/// Failures are logged and end the task; the relay keeps serving.
pub fn spawn_broadcaster(config: &DiscoveryConfig, relay_port: u16) -> JoinHandle<()> {
    let announcement = format!("{}:{}", config.advertise_ip, relay_port);
    let dest = config.target();

    tokio::spawn(async move {
        let broadcaster = match Broadcaster::bind(announcement.clone(), dest).await {
            Ok(broadcaster) => broadcaster,
            Err(err) => {
                error!(error = ?err, "discovery broadcaster failed to start");
                return;
            }
        };
        info!(%dest, %announcement, "announcing relay address");
        if let Err(err) = broadcaster.run().await {
            error!(error = ?err, "discovery broadcaster stopped");
        }
    })
}

/// Parses a `"<ip>:<port>"` announcement.
pub fn parse_announcement(datagram: &[u8]) -> Result<SocketAddr> {
    let text = std::str::from_utf8(datagram).context("announcement is not UTF-8")?;
    let text = text.trim_end_matches(['\0', '\r', '\n']);
    let (ip, port) = text
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid announcement '{text}': missing ':' delimiter"))?;

    let ip: IpAddr = ip
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .with_context(|| format!("invalid address in announcement '{text}'"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in announcement '{text}'"))?;
    Ok(SocketAddr::new(ip, port))
}

/// Waits for one announcement on `port` and returns the advertised relay address.
pub async fn discover(port: u16) -> Result<SocketAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("failed to listen for discovery on port {port}"))?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast on discovery socket")?;
    receive_announcement(&socket).await
}

pub async fn receive_announcement(socket: &UdpSocket) -> Result<SocketAddr> {
    let mut buf = [0u8; MAX_DATAGRAM_LEN];
    let (len, from) = socket
        .recv_from(&mut buf)
        .await
        .context("failed to receive discovery datagram")?;
    let addr = parse_announcement(&buf[..len])?;
    info!(%from, relay = %addr, "discovered relay");
    Ok(addr)
}
