// Cash Hub: Bitcoin-Cash full-node Hub core.
//
// SPDX-License-Identifier: MIT

//! Final configuration resulting from a config file, environment variables,
//! and command-line options. Kept separate from `Opts`, the raw CLI struct
//! that gets resolved into this one.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

#[cfg(feature = "server")]
use crate::opts::Opts;

/// No limit on the number of addresses a connection may subscribe to or
/// filter a block request by.
pub const UNLIMITED_ADDRESSES: i64 = -1;

/// Default API port when a bind address omits one.
pub const DEFAULT_API_PORT: u16 = 8337;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Enable/disable the API server entirely. Default on.
    pub api_enabled: bool,

    /// Resolved bind addresses for the API listener.
    pub api_listen: Vec<SocketAddr>,

    /// Upper bound on script-hashes per connection's block-filter or
    /// address-subscription. `None` means unlimited.
    pub api_max_addresses: Option<u32>,

    /// Base directory; UTXO files live under it.
    pub data_dir: PathBuf,

    /// Additional read-only search paths for block files.
    pub block_data_dir: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_enabled: true,
            api_listen: default_listen(),
            api_max_addresses: None,
            data_dir: PathBuf::from("."),
            block_data_dir: Vec::new(),
        }
    }
}

fn default_listen() -> Vec<SocketAddr> {
    vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_API_PORT),
        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), DEFAULT_API_PORT),
    ]
}

/// Parses one `apilisten` entry: `localhost` expands to v4+v6
/// loopback, `0.0.0.0` expands to every local interface with the given port,
/// anything else is a plain `host[:port]`.
pub fn parse_listen_entry(entry: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    let (host, port) = match entry.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().map_err(|_| ConfigError::BadListen(entry.to_string()))?),
        None => (entry, DEFAULT_API_PORT),
    };
    match host {
        "localhost" => Ok(vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
        ]),
        "0.0.0.0" => Ok(vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ]),
        host => {
            let ip: IpAddr = host.parse().map_err(|_| ConfigError::BadListen(entry.to_string()))?;
            Ok(vec![SocketAddr::new(ip, port)])
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, amplify::Display, amplify::Error)]
#[display(doc_comments)]
pub enum ConfigError {
    /// could not parse `apilisten` entry {0}.
    BadListen(String),
}

#[cfg(feature = "server")]
impl TryFrom<Opts> for Config {
    type Error = ConfigError;

    fn try_from(opts: Opts) -> Result<Self, ConfigError> {
        let mut api_listen = Vec::new();
        if opts.api_listen.is_empty() {
            api_listen = default_listen();
        } else {
            for entry in &opts.api_listen {
                api_listen.extend(parse_listen_entry(entry)?);
            }
        }

        Ok(Config {
            api_enabled: !opts.no_api,
            api_listen,
            api_max_addresses: match opts.api_max_addresses {
                UNLIMITED_ADDRESSES => None,
                n if n >= 0 => Some(n as u32),
                n => return Err(ConfigError::BadListen(format!("api_max_addresses={n}"))),
            },
            data_dir: opts.data_dir,
            block_data_dir: opts.block_data_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_expands_to_both_families() {
        let addrs = parse_listen_entry("localhost:9001").unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().any(|a| a.is_ipv4()));
        assert!(addrs.iter().any(|a| a.is_ipv6()));
        assert!(addrs.iter().all(|a| a.port() == 9001));
    }

    #[test]
    fn wildcard_expands_to_every_interface() {
        let addrs = parse_listen_entry("0.0.0.0:9002").unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(|a| a.port() == 9002));
    }

    #[test]
    fn plain_host_defaults_to_the_api_port() {
        let addrs = parse_listen_entry("127.0.0.1").unwrap();
        assert_eq!(addrs, vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_API_PORT)]);
    }
}
