//! Endpoint normalisation and broker resolution.

use std::net::{IpAddr, SocketAddr};

use log::{debug, info};

use crate::error::{OffloadError, Result};

const TCP_SCHEME: &str = "tcp://";

/// Strip an optional `tcp://` scheme.
pub fn normalize_endpoint(endpoint: &str) -> &str {
    endpoint.strip_prefix(TCP_SCHEME).unwrap_or(endpoint)
}

/// Split `host:port` (or `[v6]:port`) into its parts.
fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Resolve a broker endpoint to the concrete backend address.
///
/// The broker name is looked up once; every later (re)connect of the run
/// goes to the returned address. IPv4 results are preferred.
pub fn resolve_broker(endpoint: &str) -> Result<SocketAddr> {
    let discovery_error = |reason: String| OffloadError::Discovery {
        endpoint: endpoint.to_string(),
        reason,
    };

    let (host, port) = split_host_port(normalize_endpoint(endpoint))
        .ok_or_else(|| discovery_error("expected host:port".to_string()))?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    debug!("Looking up broker host {}", host);
    let addrs = dns_lookup::lookup_host(host).map_err(|e| discovery_error(e.to_string()))?;
    let ip = addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| discovery_error("no addresses returned".to_string()))?;

    let addr = SocketAddr::new(ip, port);
    info!("Broker {} resolved to backend {}", endpoint, addr);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("tcp://10.0.0.1:5554"), "10.0.0.1:5554");
        assert_eq!(normalize_endpoint("localhost:5554"), "localhost:5554");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("gpu01:5554"), Some(("gpu01", 5554)));
        assert_eq!(split_host_port("[::1]:7"), Some(("::1", 7)));
        assert_eq!(split_host_port("gpu01"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("gpu01:http"), None);
    }

    #[test]
    fn test_resolve_literal_address() {
        let addr = resolve_broker("tcp://127.0.0.1:6000").unwrap();
        assert_eq!(addr, "127.0.0.1:6000".parse().unwrap());
    }

    #[test]
    fn test_resolve_malformed_is_fatal() {
        match resolve_broker("tcp://no-port-here") {
            Err(OffloadError::Discovery { endpoint, .. }) => {
                assert_eq!(endpoint, "tcp://no-port-here")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
