//! Concrete external collaborators (C11): the only place this crate
//! actually shells out to `wg`/`wg-quick`/`danted` or makes the
//! unauthenticated HTTP calls the spec keeps opaque. None of this
//! implements WireGuard cryptography or a SOCKS server itself — it only
//! drives the host binaries, same boundary the original `tunnel.py` /
//! `network.py` draw between "call the binary" and "implement the
//! protocol".

use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::warn;

use crate::fallback::FallbackProvisioner;
use crate::network::NetworkProbe;
use crate::provider::Provider;
use crate::socks::SocksDriver;
use crate::tunnel::{TunnelDriver, TunnelError};

/// Drives the real `wg` / `wg-quick` binaries. Errors from process
/// spawning or a non-zero exit status are wrapped as `TunnelError::Driver`
/// so the supervisor treats a missing binary the same as any other
/// tunnel failure — log and retry, never crash.
pub struct WgTunnelDriver;

impl WgTunnelDriver {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, TunnelError> {
        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| TunnelError::Driver(format!("{program} spawn failed: {err}")))?;
        if !output.status.success() {
            return Err(TunnelError::Driver(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl TunnelDriver for WgTunnelDriver {
    async fn down(&self, interface: &str) {
        if let Err(err) = self.run("wg-quick", &["down", interface]).await {
            warn!(error = %err, "wg-quick down failed, interface may already be down");
        }
    }

    async fn up(&self, interface: &str, config_path: &Path) -> Result<(), TunnelError> {
        let _ = interface;
        self.run("wg-quick", &["up", &config_path.display().to_string()])
            .await
            .map(|_| ())
    }

    async fn latest_handshakes(&self, interface: &str) -> Result<String, TunnelError> {
        self.run("wg", &["show", interface, "latest-handshakes"]).await
    }

    async fn derive_public_key(&self, private_key: &str) -> Option<String> {
        use std::process::Stdio as StdStdio;
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("wg")
            .arg("pubkey")
            .stdin(StdStdio::piped())
            .stdout(StdStdio::piped())
            .spawn()
            .ok()?;
        child
            .stdin
            .as_mut()?
            .write_all(private_key.as_bytes())
            .await
            .ok()?;
        let output = child.wait_with_output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn generate_private_key(&self) -> Option<String> {
        self.run("wg", &["genkey"]).await.ok().map(|s| s.trim().to_string())
    }

    async fn add_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ips: &str,
        keepalive: u32,
    ) -> Result<(), TunnelError> {
        self.run(
            "wg",
            &[
                "set",
                interface,
                "peer",
                public_key,
                "allowed-ips",
                allowed_ips,
                "persistent-keepalive",
                &keepalive.to_string(),
            ],
        )
        .await
        .map(|_| ())
    }
}

/// Drives `danted` as a long-lived child process. The config written to
/// `config_path` is rendered fresh from `template_path` on every start,
/// so `${SOCKS_PORT}` always reflects the configured port rather than
/// whatever static file happened to be sitting there.
pub struct DantedSocksDriver {
    template_path: String,
    config_path: String,
    socks_port: u16,
    child: Mutex<Option<Child>>,
}

impl DantedSocksDriver {
    pub fn new(template_path: impl Into<String>, config_path: impl Into<String>, socks_port: u16) -> Self {
        Self {
            template_path: template_path.into(),
            config_path: config_path.into(),
            socks_port,
            child: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SocksDriver for DantedSocksDriver {
    async fn start(&self) {
        {
            let guard = self.child.lock().expect("socks child poisoned");
            if guard.is_some() {
                return;
            }
        }

        let template = match std::fs::read_to_string(&self.template_path) {
            Ok(template) => template,
            Err(err) => {
                warn!(error = %err, path = %self.template_path, "failed to read danted template");
                return;
            }
        };
        let rendered = crate::socks::render_danted_config(&template, self.socks_port);
        if let Some(parent) = std::path::Path::new(&self.config_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&self.config_path, rendered) {
            warn!(error = %err, path = %self.config_path, "failed to write rendered danted config");
            return;
        }

        let mut guard = self.child.lock().expect("socks child poisoned");
        if guard.is_some() {
            return;
        }
        match Command::new("danted").arg("-f").arg(&self.config_path).spawn() {
            Ok(child) => *guard = Some(child),
            Err(err) => warn!(error = %err, "failed to spawn danted"),
        }
    }

    async fn stop(&self) {
        let child = self.child.lock().expect("socks child poisoned").take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().expect("socks child poisoned");
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Public-IP lookup over plain HTTP. UPnP mapping is left unimplemented —
/// the spec treats it as fully external and no pack example provides a
/// UPnP client to ground one on.
pub struct HttpNetworkProbe {
    http: reqwest::Client,
    public_ip_url: String,
}

impl HttpNetworkProbe {
    pub fn new(public_ip_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client config is always valid"),
            public_ip_url: public_ip_url.into(),
        }
    }
}

#[async_trait]
impl NetworkProbe for HttpNetworkProbe {
    async fn detect_public_ip(&self) -> Option<String> {
        if self.public_ip_url.is_empty() {
            return None;
        }
        let response = self.http.get(&self.public_ip_url).send().await.ok()?;
        let text = response.text().await.ok()?;
        let trimmed = text.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    async fn map_upnp(&self, _port: u16, _local_ip: Option<&str>) -> bool {
        false
    }
}

/// Asks the fallback orchestrator for a stand-in provider when the pool
/// itself is unreachable.
pub struct HttpFallbackProvisioner {
    http: reqwest::Client,
    orchestrator_url: String,
}

impl HttpFallbackProvisioner {
    pub fn new(orchestrator_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client config is always valid"),
            orchestrator_url: orchestrator_url.into(),
        }
    }
}

#[async_trait]
impl FallbackProvisioner for HttpFallbackProvisioner {
    async fn provision(&self) -> Option<Provider> {
        if self.orchestrator_url.is_empty() {
            return None;
        }
        let response = self.http.get(&self.orchestrator_url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<Provider>().await.ok()
    }
}
