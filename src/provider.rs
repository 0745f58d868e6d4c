//! Provider model and validation (C1).
//!
//! A `Provider` is a peer advertised by the pool service. Validation is
//! deliberately narrow: it checks the shape of the fields needed to act on
//! a provider (parse the endpoint, decode the key, parse the CIDRs) and
//! never judges reachability — that's the selection policy's job.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A peer advertised by the pool, or produced by the fallback provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub endpoint: String,
    pub public_key: String,
    /// Comma-separated CIDR list, as carried on the wire.
    pub allowed_ips: String,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub lease_nonce: Option<String>,
    #[serde(default)]
    pub lease_exp: Option<i64>,
    #[serde(default)]
    pub lease_sig: Option<String>,
    /// Present only on pool responses; absent (health assumed "ok") otherwise.
    #[serde(default)]
    pub health: Option<String>,
}

#[derive(Debug, Error)]
#[error("invalid provider {id}: {reason}")]
pub struct InvalidProvider {
    pub id: String,
    pub reason: String,
}

impl InvalidProvider {
    fn new(id: &str, reason: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parsed `host:port` or `[v6]:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEndpoint {
    pub host: String,
    pub port: u16,
}

/// Split an endpoint into host and port, accepting the bracketed IPv6 form.
///
/// Does not attempt to resolve the host; a hostname is returned verbatim.
pub fn parse_endpoint(endpoint: &str) -> Result<ParsedEndpoint, String> {
    if let Some(rest) = endpoint.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| "unterminated IPv6 literal".to_string())?;
        let host = &rest[..close];
        let tail = &rest[close + 1..];
        let port_text = tail
            .strip_prefix(':')
            .ok_or_else(|| "missing port after IPv6 literal".to_string())?;
        let port: u16 = port_text
            .parse()
            .map_err(|_| format!("invalid port {port_text:?}"))?;
        if host.is_empty() {
            return Err("empty host".to_string());
        }
        return Ok(ParsedEndpoint {
            host: host.to_string(),
            port,
        });
    }

    let (host, port_text) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| "endpoint missing ':port'".to_string())?;
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    let port: u16 = port_text
        .parse()
        .map_err(|_| format!("invalid port {port_text:?}"))?;
    Ok(ParsedEndpoint {
        host: host.to_string(),
        port,
    })
}

/// True if `host` is an IP literal that is loopback, link-local,
/// multicast, unspecified, or private — i.e. not publicly routable.
/// Hostnames (anything that doesn't parse as an IP literal) always
/// return `false` here; DNS is not resolved at this layer.
pub fn is_non_public_ip_literal(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    if lower == "localhost" || lower.ends_with(".local") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_private()
        }
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback() || v6.is_multicast() || v6.is_unspecified() || is_unique_local(&v6)
        }
        Err(_) => false,
    }
}

fn is_unique_local(addr: &std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// Decode a base64 WireGuard public key and confirm it is exactly 32 bytes.
pub fn validate_public_key(public_key: &str) -> bool {
    use base64::Engine;
    match base64::engine::general_purpose::STANDARD.decode(public_key) {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}

/// Parse a CIDR, tolerating host bits set (e.g. `10.0.0.5/24`).
fn parse_cidr(raw: &str) -> Result<(), String> {
    let raw = raw.trim();
    let (addr_part, prefix_part) = raw
        .split_once('/')
        .ok_or_else(|| format!("CIDR {raw:?} missing prefix length"))?;
    let addr: IpAddr = addr_part
        .parse()
        .map_err(|_| format!("CIDR {raw:?} has an invalid address"))?;
    let prefix: u32 = prefix_part
        .parse()
        .map_err(|_| format!("CIDR {raw:?} has an invalid prefix length"))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(format!("CIDR {raw:?} prefix length out of range"));
    }
    Ok(())
}

/// Full structural validation of a provider record (§4.1).
///
/// Intentionally run only at use sites (fallback provisioning, per-candidate
/// latency probing) — never front-loaded onto the pool-fetch path, per the
/// spec's resolved open question.
pub fn validate_provider(
    provider: &Provider,
    allow_private_endpoints: bool,
) -> Result<(), InvalidProvider> {
    let parsed = parse_endpoint(&provider.endpoint)
        .map_err(|reason| InvalidProvider::new(&provider.id, reason))?;
    if parsed.port < 1 {
        return Err(InvalidProvider::new(&provider.id, "port out of range"));
    }
    if !allow_private_endpoints && is_non_public_ip_literal(&parsed.host) {
        return Err(InvalidProvider::new(
            &provider.id,
            "endpoint host is not publicly routable",
        ));
    }

    if !validate_public_key(&provider.public_key) {
        return Err(InvalidProvider::new(
            &provider.id,
            "public_key does not decode to 32 bytes",
        ));
    }

    for cidr in provider.allowed_ips.split(',') {
        parse_cidr(cidr).map_err(|reason| InvalidProvider::new(&provider.id, reason))?;
    }

    if provider.id.is_empty() {
        return Err(InvalidProvider::new(&provider.id, "id is empty"));
    }

    Ok(())
}
