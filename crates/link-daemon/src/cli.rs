//! Command-line arguments and how they shape the link configuration.

use anyhow::{Context, Result, bail};
use clap::Parser;
use link_core::{AddressTable, DEFAULT_SERVICE_PORT, LinkConfig, ProcessId};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "link-daemon")]
#[command(about = "Process running the link stack and a perfect failure detector")]
pub struct Args {
    /// Our process ID
    #[arg(long)]
    pub id: ProcessId,

    /// Another process, as PID=HOST or PID=HOST:PORT (repeatable)
    #[arg(long = "peer", value_name = "PID=HOST[:PORT]")]
    pub peers: Vec<PeerSpec>,

    /// Service port shared by every process (default: 3210)
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to listen on (default: 0.0.0.0:<port>)
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Failure detector period in milliseconds
    #[arg(long)]
    pub period_ms: Option<u64>,

    /// Stubborn link retransmission interval in milliseconds
    #[arg(long)]
    pub retransmit_ms: Option<u64>,

    /// Number of demo messages to send to random peers (0 = none)
    #[arg(long, default_value_t = 0)]
    pub demo_messages: u32,

    /// Pause between demo messages in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub demo_interval_ms: u64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    pub fn service_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SERVICE_PORT)
    }

    pub fn demo_interval(&self) -> Duration {
        Duration::from_millis(self.demo_interval_ms)
    }

    /// Load the config file, if any, and overlay the flags given on the
    /// command line.
    pub fn link_config(&self) -> Result<LinkConfig> {
        let mut config = match &self.config {
            Some(path) => LinkConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => LinkConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        } else if let Some(port) = self.port {
            config.listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        }
        if let Some(period_ms) = self.period_ms {
            config.detector.period_ms = period_ms;
        }
        if let Some(retransmit_ms) = self.retransmit_ms {
            config.stubborn.retransmit_interval_ms = retransmit_ms;
        }
        Ok(config)
    }

    /// Resolve every peer into the address table. Our own ID is skipped.
    pub fn address_table(&self) -> Result<AddressTable> {
        let port = self.service_port();
        let mut table = AddressTable::new();
        for peer in &self.peers {
            if peer.id == self.id {
                continue;
            }
            if table.contains(&peer.id) {
                bail!("Peer {} given more than once", peer.id);
            }
            table = table.insert(peer.id.clone(), peer.resolve(port)?);
        }
        Ok(table)
    }
}

/// A `PID=HOST[:PORT]` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub id: ProcessId,
    pub host: String,
    pub port: Option<u16>,
}

impl PeerSpec {
    /// Turn the host into a socket address, looking names up if needed.
    pub fn resolve(&self, default_port: u16) -> Result<SocketAddr> {
        let port = self.port.unwrap_or(default_port);
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        (self.host.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve host {}", self.host))?
            .next()
            .with_context(|| format!("Host {} has no addresses", self.host))
    }
}

impl FromStr for PeerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, address) = s
            .split_once('=')
            .with_context(|| format!("Expected PID=HOST[:PORT], got {:?}", s))?;
        let id: ProcessId = id.parse()?;
        let (host, port) = split_host_port(address)?;
        if host.is_empty() {
            bail!("Missing host in {:?}", s);
        }
        Ok(Self {
            id,
            host: host.to_string(),
            port,
        })
    }
}

/// Split `host`, `host:port`, `[v6]` or `[v6]:port`. A bare IPv6 address
/// has no port.
fn split_host_port(address: &str) -> Result<(&str, Option<u16>)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("Unclosed bracket in {:?}", address))?;
        return match tail {
            "" => Ok((host, None)),
            _ => {
                let port = tail
                    .strip_prefix(':')
                    .with_context(|| format!("Unexpected text after ] in {:?}", address))?;
                Ok((host, Some(parse_port(port)?)))
            }
        };
    }

    match address.split_once(':') {
        Some((host, port)) if !port.contains(':') => Ok((host, Some(parse_port(port)?))),
        _ => Ok((address, None)),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse()
        .with_context(|| format!("Invalid port {:?}", port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProcessId {
        s.parse().unwrap()
    }

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("link-daemon").chain(args.iter().copied())).unwrap()
    }

    // ==================== PeerSpec ====================

    #[test]
    fn test_peer_without_port() {
        let peer: PeerSpec = "1=10.0.0.2".parse().unwrap();
        assert_eq!(peer.id, pid("1"));
        assert_eq!(peer.host, "10.0.0.2");
        assert_eq!(peer.port, None);
        assert_eq!(peer.resolve(3210).unwrap(), "10.0.0.2:3210".parse().unwrap());
    }

    #[test]
    fn test_peer_with_port() {
        let peer: PeerSpec = "b=127.0.0.1:4000".parse().unwrap();
        assert_eq!(peer.port, Some(4000));
        assert_eq!(peer.resolve(3210).unwrap(), "127.0.0.1:4000".parse().unwrap());
    }

    #[test]
    fn test_peer_ipv6() {
        let bare: PeerSpec = "1=::1".parse().unwrap();
        assert_eq!(bare.resolve(3210).unwrap(), "[::1]:3210".parse().unwrap());

        let bracketed: PeerSpec = "1=[::1]:5000".parse().unwrap();
        assert_eq!(bracketed.resolve(3210).unwrap(), "[::1]:5000".parse().unwrap());
    }

    #[test]
    fn test_peer_invalid() {
        assert!("10.0.0.2".parse::<PeerSpec>().is_err());
        assert!("=10.0.0.2".parse::<PeerSpec>().is_err());
        assert!("1=".parse::<PeerSpec>().is_err());
        assert!("1=host:notaport".parse::<PeerSpec>().is_err());
        assert!("1=[::1".parse::<PeerSpec>().is_err());
    }

    // ==================== Args ====================

    #[test]
    fn test_address_table_skips_self() {
        let args = parse(&[
            "--id", "0", "--peer", "0=10.0.0.1", "--peer", "1=10.0.0.2", "--peer", "2=10.0.0.3",
        ]);
        let table = args.address_table().unwrap();
        assert_eq!(table.len(), 2);
        assert!(!table.contains(&pid("0")));
        assert_eq!(table.get(&pid("2")), Some("10.0.0.3:3210".parse().unwrap()));
    }

    #[test]
    fn test_address_table_uses_service_port() {
        let args = parse(&["--id", "0", "--port", "4100", "--peer", "1=10.0.0.2"]);
        let table = args.address_table().unwrap();
        assert_eq!(table.get(&pid("1")), Some("10.0.0.2:4100".parse().unwrap()));
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let args = parse(&["--id", "0", "--peer", "1=10.0.0.2", "--peer", "1=10.0.0.3"]);
        assert!(args.address_table().is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&[
            "--id",
            "0",
            "--port",
            "4100",
            "--period-ms",
            "750",
            "--retransmit-ms",
            "200",
        ]);
        let config = args.link_config().unwrap();
        assert_eq!(config.listen, "0.0.0.0:4100".parse().unwrap());
        assert_eq!(config.detector.period_ms, 750);
        assert_eq!(config.stubborn.retransmit_interval_ms, 200);
    }

    #[test]
    fn test_listen_wins_over_port() {
        let args = parse(&["--id", "0", "--port", "4100", "--listen", "127.0.0.1:5000"]);
        let config = args.link_config().unwrap();
        assert_eq!(config.listen, "127.0.0.1:5000".parse().unwrap());
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--id", "0"]);
        assert_eq!(args.service_port(), DEFAULT_SERVICE_PORT);
        assert_eq!(args.demo_messages, 0);
        assert_eq!(args.demo_interval(), Duration::from_secs(3));
        assert_eq!(args.link_config().unwrap(), LinkConfig::default());
    }

    #[test]
    fn test_invalid_id_rejected() {
        let result = Args::try_parse_from(["link-daemon", "--id", "has space"]);
        assert!(result.is_err());
    }
}
