//! Provider-side claim applier (C9): installs per-peer entries into the
//! local tunnel server when this node is selected by another node while
//! in provider-standby.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::pool::PoolClaim;
use crate::tunnel::TunnelDriver;

const KEEPALIVE_SECONDS: u32 = 25;

/// Tracks nonces already applied so a re-delivered claim is a no-op.
#[derive(Default)]
pub struct ClaimApplier {
    handled: Mutex<HashSet<String>>,
}

impl ClaimApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `claim` to `interface` via `driver`. Returns `true` if a peer
    /// was actually installed (first time seeing this nonce and all
    /// required fields present), `false` otherwise (ignored claim).
    pub async fn apply(
        &self,
        driver: &dyn TunnelDriver,
        interface: &str,
        claim: &PoolClaim,
    ) -> bool {
        if claim.lease_nonce.is_empty()
            || claim.client_ip.is_empty()
            || claim.client_public_key.is_empty()
        {
            warn!("ignoring claim with missing required fields");
            return false;
        }

        {
            let handled = self.handled.lock().expect("claim set poisoned");
            if handled.contains(&claim.lease_nonce) {
                info!(nonce = %claim.lease_nonce, "claim already handled, ignoring");
                return false;
            }
        }

        let allowed_ips = format!("{}/32", claim.client_ip);
        match driver
            .add_peer(
                interface,
                &claim.client_public_key,
                &allowed_ips,
                KEEPALIVE_SECONDS,
            )
            .await
        {
            Ok(()) => {
                self.handled
                    .lock()
                    .expect("claim set poisoned")
                    .insert(claim.lease_nonce.clone());
                info!(nonce = %claim.lease_nonce, client_ip = %claim.client_ip, "installed peer from claim");
                true
            }
            Err(err) => {
                warn!(nonce = %claim.lease_nonce, error = %err, "failed to apply claim");
                false
            }
        }
    }

    pub fn handled_count(&self) -> usize {
        self.handled.lock().expect("claim set poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::tunnel::TunnelError;

    struct CountingDriver {
        add_peer_calls: AtomicUsize,
    }

    #[async_trait]
    impl TunnelDriver for CountingDriver {
        async fn down(&self, _interface: &str) {}
        async fn up(&self, _interface: &str, _config_path: &Path) -> Result<(), TunnelError> {
            Ok(())
        }
        async fn latest_handshakes(&self, _interface: &str) -> Result<String, TunnelError> {
            Ok(String::new())
        }
        async fn derive_public_key(&self, _private_key: &str) -> Option<String> {
            None
        }
        async fn generate_private_key(&self) -> Option<String> {
            None
        }
        async fn add_peer(
            &self,
            _interface: &str,
            _public_key: &str,
            _allowed_ips: &str,
            _keepalive: u32,
        ) -> Result<(), TunnelError> {
            self.add_peer_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn claim(nonce: &str) -> PoolClaim {
        PoolClaim {
            lease_nonce: nonce.to_string(),
            client_ip: "10.66.0.5".to_string(),
            client_public_key: "AAAA=".to_string(),
        }
    }

    #[tokio::test]
    async fn applies_new_claim() {
        let applier = ClaimApplier::new();
        let driver = CountingDriver {
            add_peer_calls: AtomicUsize::new(0),
        };
        let applied = applier.apply(&driver, "wg0", &claim("n1")).await;
        assert!(applied);
        assert_eq!(driver.add_peer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.handled_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_nonce_is_idempotent() {
        let applier = ClaimApplier::new();
        let driver = CountingDriver {
            add_peer_calls: AtomicUsize::new(0),
        };
        applier.apply(&driver, "wg0", &claim("n1")).await;
        let applied_again = applier.apply(&driver, "wg0", &claim("n1")).await;
        assert!(!applied_again);
        assert_eq!(driver.add_peer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.handled_count(), 1);
    }

    #[tokio::test]
    async fn missing_field_is_ignored() {
        let applier = ClaimApplier::new();
        let driver = CountingDriver {
            add_peer_calls: AtomicUsize::new(0),
        };
        let mut bad_claim = claim("n1");
        bad_claim.client_ip = String::new();
        let applied = applier.apply(&driver, "wg0", &bad_claim).await;
        assert!(!applied);
        assert_eq!(driver.add_peer_calls.load(Ordering::SeqCst), 0);
    }
}
