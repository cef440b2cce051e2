//! Access control for the read-only HTTP facade

use crate::error::{AgentError, Result};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Immutable set of accepted access tokens. An empty set allows everything.
#[derive(Debug, Clone, Default)]
pub struct AccessTokens {
    tokens: HashSet<String>,
}

impl AccessTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_allowed(&self, token: &str) -> bool {
        self.tokens.is_empty() || self.tokens.contains(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// One IPv4 or IPv6 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = AgentError;

    /// Parses `10.0.0.0/8`, `::1/128`, or a bare address (full-length prefix)
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || AgentError::config(format!("invalid network: {}", s));
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };

        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Networks allowed to read the facade. An empty list allows every valid address.
#[derive(Debug, Clone, Default)]
pub struct AllowedNetworks {
    networks: Vec<Cidr>,
}

impl AllowedNetworks {
    pub fn parse<S: AsRef<str>>(networks: &[S]) -> Result<Self> {
        let networks = networks
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<Cidr>>>()?;
        Ok(Self { networks })
    }

    /// `addr` may be a bare IP or `ip:port`; anything unparseable is rejected
    pub fn is_allowed(&self, addr: &str) -> bool {
        let ip = match addr.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => match addr.parse::<SocketAddr>() {
                Ok(sock) => sock.ip(),
                Err(_) => return false,
            },
        };
        self.is_ip_allowed(&ip)
    }

    pub fn is_ip_allowed(&self, ip: &IpAddr) -> bool {
        self.networks.is_empty() || self.networks.iter().any(|n| n.contains(ip))
    }
}

/// Token and network gate applied to every facade request
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    pub tokens: AccessTokens,
    pub networks: AllowedNetworks,
}

impl AccessControl {
    pub fn new(tokens: AccessTokens, networks: AllowedNetworks) -> Self {
        Self { tokens, networks }
    }

    pub fn authorize(&self, client: Option<IpAddr>, token: Option<&str>) -> Result<()> {
        match client {
            Some(ip) if self.networks.is_ip_allowed(&ip) => {}
            Some(ip) => {
                return Err(AgentError::Authorization(format!(
                    "{} is not in an allowed network",
                    ip
                )))
            }
            None if self.networks.networks.is_empty() => {}
            None => {
                return Err(AgentError::Authorization(
                    "unknown client address".to_string(),
                ))
            }
        }

        if !self.tokens.is_allowed(token.unwrap_or_default()) {
            return Err(AgentError::Authorization("invalid access token".to_string()));
        }
        Ok(())
    }
}
