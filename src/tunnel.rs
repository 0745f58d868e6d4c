//! Tunnel config rendering and the `TunnelDriver` trait boundary (C11 +
//! §4.7.1). Invocation of the real `wg` / `wg-quick` binaries is external
//! to the core per spec — this module only renders the config text the
//! spec prescribes and defines the trait the supervisor drives.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::provider::Provider;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to write tunnel config to {path}: {source}")]
    WriteConfig {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("tunnel driver error: {0}")]
    Driver(String),
    #[error("handshake not confirmed within {0:?}")]
    HandshakeNotConfirmed(Duration),
}

/// Parameters needed to render the `[Interface]` section, independent of
/// client vs. server mode.
pub struct InterfaceParams<'a> {
    pub private_key: &'a str,
    pub address: &'a str,
    pub listen_port: u16,
    pub dns: Option<&'a str>,
}

/// Render the client config: `[Interface]` + a single `[Peer]` pointing at
/// the chosen provider. Byte-for-byte matches spec §6.
pub fn render_client_config(interface: &InterfaceParams<'_>, provider: &Provider, keepalive: u32) -> String {
    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", interface.private_key));
    out.push_str(&format!("Address = {}\n", interface.address));
    out.push_str(&format!("ListenPort = {}\n", interface.listen_port));
    if let Some(dns) = interface.dns.filter(|dns| !dns.is_empty()) {
        out.push_str(&format!("DNS = {dns}\n"));
    }
    out.push('\n');
    out.push_str("[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", provider.public_key));
    out.push_str(&format!("AllowedIPs = {}\n", provider.allowed_ips));
    out.push_str(&format!("Endpoint = {}\n", provider.endpoint));
    out.push_str(&format!("PersistentKeepalive = {keepalive}\n"));
    out
}

/// Render the server-mode config (provider-standby): `[Interface]` only,
/// no `[Peer]` — peers are installed dynamically by the claim applier.
pub fn render_server_config(interface: &InterfaceParams<'_>) -> String {
    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", interface.private_key));
    out.push_str(&format!("Address = {}\n", interface.address));
    out.push_str(&format!("ListenPort = {}\n", interface.listen_port));
    if let Some(dns) = interface.dns.filter(|dns| !dns.is_empty()) {
        out.push_str(&format!("DNS = {dns}\n"));
    }
    out
}

/// Write `contents` to `path` with mode 0600, creating the parent
/// directory if needed.
pub fn write_config_file(path: &Path, contents: &str) -> Result<(), TunnelError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| TunnelError::WriteConfig {
            path: path.display().to_string(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| TunnelError::WriteConfig {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        TunnelError::WriteConfig {
            path: path.display().to_string(),
            source,
        }
    })
}

/// A single `<pubkey> <unix-ts>` line from `wg show <iface> latest-handshakes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub public_key: String,
    pub timestamp: i64,
}

pub fn parse_handshake_lines(output: &str) -> Vec<HandshakeLine> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let public_key = parts.next()?.to_string();
            let timestamp: i64 = parts.next()?.parse().ok()?;
            Some(HandshakeLine { public_key, timestamp })
        })
        .collect()
}

/// External collaborator for `wg` / `wg-quick` invocation. The supervisor
/// drives exactly these five operations; everything about process
/// spawning, binary discovery, and privilege is external to the core.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    async fn down(&self, interface: &str);
    async fn up(&self, interface: &str, config_path: &Path) -> Result<(), TunnelError>;
    /// `wg show <interface> latest-handshakes`, raw stdout.
    async fn latest_handshakes(&self, interface: &str) -> Result<String, TunnelError>;
    /// Derive a public key from a private key (`wg pubkey`).
    async fn derive_public_key(&self, private_key: &str) -> Option<String>;
    /// Generate a fresh private key (`wg genkey`).
    async fn generate_private_key(&self) -> Option<String>;
    /// Install a peer on a running server-mode interface (`wg set ... peer ...`).
    async fn add_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ips: &str,
        keepalive: u32,
    ) -> Result<(), TunnelError>;
}

/// Poll `latest_handshakes` once per second until the chosen provider's
/// public key shows a positive timestamp, or `deadline` elapses.
pub async fn verify_handshake(
    driver: &dyn TunnelDriver,
    interface: &str,
    provider_public_key: &str,
    deadline: Duration,
) -> Result<(), TunnelError> {
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(output) = driver.latest_handshakes(interface).await {
            let confirmed = parse_handshake_lines(&output)
                .into_iter()
                .any(|line| line.public_key == provider_public_key && line.timestamp > 0);
            if confirmed {
                return Ok(());
            }
        }
        if start.elapsed() >= deadline {
            return Err(TunnelError::HandshakeNotConfirmed(deadline));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
