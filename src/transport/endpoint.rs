use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// TCP endpoint of a producer or consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Resolve to the first socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", self))?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}", self))
    }

    /// Host and port in the form accepted by `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_loopback(&self) -> bool {
        let host = self.host.as_str();
        if host == "localhost" {
            return true;
        }
        host.parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.bind_addr())
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_endpoint(s)
    }
}

/// Parse an endpoint string.
///
/// Supports formats:
/// - `tcp://host:port`
/// - `host:port` (scheme implied)
/// - `[ipv6]:port`
/// - `*` as host binds every interface
pub fn parse_endpoint(addr: &str) -> Result<Endpoint> {
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "tcp" => {}
            other => return Err(anyhow!("unsupported endpoint scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing host in endpoint {}", addr));
    }
    let host = if host == "*" {
        "0.0.0.0".to_string()
    } else {
        host
    };
    Ok(Endpoint { host, port })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // Handle IPv6 addresses in brackets: [::1]:5010
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid endpoint address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {}", addr))?;
    Ok((host.to_string(), port))
}
