//! DNS collaborator: turning server strings into endpoints
//!
//! IP literals bypass resolution entirely. Everything here runs before any
//! STUN traffic, so malformed input fails fast as a configuration error
//! instead of surfacing as a bogus NAT verdict later.

use std::net::{IpAddr, SocketAddr};

use tokio::net::lookup_host;

use crate::error::{NatError, NatResult};

/// Resolve a hostname to a single address, preferring IPv4. Returns `None`
/// when resolution fails or yields nothing.
pub async fn resolve(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    let addrs: Vec<SocketAddr> = lookup_host((host, 0u16)).await.ok()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
}

/// Parse `host[:port]` into a server endpoint, applying `default_port`
/// when none is given. Fails fast on malformed input or a zero port.
pub async fn resolve_server(server: &str, default_port: u16) -> NatResult<SocketAddr> {
    let endpoint = if let Ok(addr) = server.parse::<SocketAddr>() {
        addr
    } else if let Ok(ip) = server.parse::<IpAddr>() {
        SocketAddr::new(ip, default_port)
    } else {
        let (host, port) = match server.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    NatError::Configuration(format!("invalid port in {server:?}"))
                })?;
                (host, port)
            }
            None => (server, default_port),
        };
        if host.is_empty() {
            return Err(NatError::Configuration(format!("empty host in {server:?}")));
        }
        let ip = resolve(host)
            .await
            .ok_or_else(|| NatError::DnsResolution(host.to_string()))?;
        SocketAddr::new(ip, port)
    };

    if endpoint.port() == 0 {
        return Err(NatError::Configuration(format!(
            "server {server:?} has port 0"
        )));
    }
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literals_bypass_resolution() {
        assert_eq!(resolve("192.0.2.7").await, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(resolve("2001:db8::1").await, Some("2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn socket_addr_literals_parse_directly() {
        let addr = resolve_server("192.0.2.7:3478", 3478).await.unwrap();
        assert_eq!(addr, "192.0.2.7:3478".parse().unwrap());
    }

    #[tokio::test]
    async fn bare_ip_gets_the_default_port() {
        let addr = resolve_server("192.0.2.7", 3478).await.unwrap();
        assert_eq!(addr.port(), 3478);
    }

    #[tokio::test]
    async fn zero_port_is_a_configuration_error() {
        assert!(matches!(
            resolve_server("192.0.2.7:0", 3478).await,
            Err(NatError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn garbage_port_is_a_configuration_error() {
        assert!(matches!(
            resolve_server("example.net:stun", 3478).await,
            Err(NatError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn localhost_resolves_via_the_system_resolver() {
        let addr = resolve_server("localhost:3478", 3478).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 3478);
    }
}
