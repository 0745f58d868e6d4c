//! Network probe (C11 ambient): local/public IP detection, UPnP mapping,
//! and CGNAT suspicion. The spec treats the bulk of this as an opaque
//! `NetworkProbe` collaborator (external public-IP lookup, external UPnP
//! helper); only local-IP detection and the pure CGNAT classification are
//! implemented directly here, the same split the original `network.py`
//! draws between `detect_local_ip` (pure sockets) and `detect_public_ip`
//! / `map_upnp` (external HTTP / external binary).

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    pub local_ip: Option<String>,
    pub public_ip: Option<String>,
    pub upnp_mapped: bool,
    pub cgnat_suspected: bool,
}

/// External collaborator: public-IP lookup and UPnP port mapping. A
/// production deployment backs this with outbound HTTP calls and the
/// `upnpc` binary; this crate only depends on the trait boundary.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn detect_public_ip(&self) -> Option<String>;
    async fn map_upnp(&self, port: u16, local_ip: Option<&str>) -> bool;
}

/// Best-effort local IP detection via a connected UDP socket — no packets
/// actually leave the host; this only asks the kernel which local address
/// a route to a public destination would use.
pub fn detect_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// True if `public_ip` is absent, unparseable, private, or falls in the
/// shared CGNAT range `100.64.0.0/10`.
pub fn is_cgnat_suspected(public_ip: Option<&str>) -> bool {
    let Some(public_ip) = public_ip else {
        return true;
    };
    let Ok(ip) = public_ip.parse::<IpAddr>() else {
        return true;
    };
    match ip {
        IpAddr::V4(v4) => v4.is_private() || in_cgnat_range(v4),
        IpAddr::V6(_) => false,
    }
}

fn in_cgnat_range(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000
}

/// Run the full network-config probe: local IP (always), public IP and
/// UPnP mapping (via the injected collaborator, only if enabled).
pub async fn auto_network_config(
    probe: &dyn NetworkProbe,
    enable_upnp: bool,
    upnp_port: u16,
) -> NetworkInfo {
    let local_ip = detect_local_ip();
    let public_ip = probe.detect_public_ip().await;
    let upnp_mapped = if enable_upnp {
        probe.map_upnp(upnp_port, local_ip.as_deref()).await
    } else {
        false
    };
    NetworkInfo {
        cgnat_suspected: is_cgnat_suspected(public_ip.as_deref()),
        local_ip,
        public_ip,
        upnp_mapped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_public_ip_is_cgnat_suspected() {
        assert!(is_cgnat_suspected(None));
    }

    #[test]
    fn private_address_is_cgnat_suspected() {
        assert!(is_cgnat_suspected(Some("192.168.1.5")));
    }

    #[test]
    fn cgnat_range_is_suspected() {
        assert!(is_cgnat_suspected(Some("100.64.0.1")));
        assert!(is_cgnat_suspected(Some("100.127.255.254")));
    }

    #[test]
    fn public_address_is_not_suspected() {
        assert!(!is_cgnat_suspected(Some("8.8.8.8")));
    }

    #[test]
    fn unparseable_address_is_suspected() {
        assert!(is_cgnat_suspected(Some("not-an-ip")));
    }
}
