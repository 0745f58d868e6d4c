//! Daemon entry point: wires configuration, the concrete external
//! collaborators, and the supervisor/control-surface tasks together.
//! Exits 0 on a clean `/exit` shutdown; non-zero only on unrecoverable
//! startup failure (missing required env, unable to generate a private
//! key, bind failure), per spec.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dvpn_supervisor::bandwidth::BandwidthLedger;
use dvpn_supervisor::config::Config;
use dvpn_supervisor::fallback::FallbackProvisioner;
use dvpn_supervisor::metrics::Metrics;
use dvpn_supervisor::payment::{PaymentVerifier, PlanTerms};
use dvpn_supervisor::pool::PoolClient;
use dvpn_supervisor::startup::NoopStartOnBoot;
use dvpn_supervisor::supervisor::Supervisor;
use dvpn_supervisor::system::{DantedSocksDriver, HttpFallbackProvisioner, HttpNetworkProbe, WgTunnelDriver};
use dvpn_supervisor::token_store::{FileTokenStore, TokenStore};
use dvpn_supervisor::tunnel::TunnelDriver;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Plan terms are operator-fixed today (mirrors the constants hard-coded
/// in the original `payment.py`); a future revision could load these from
/// `Config` if deployments need to vary them.
fn plan_terms() -> PlanTerms {
    PlanTerms {
        wallet: std::env::var("REQUIRED_WALLET").unwrap_or_default(),
        price_usd: std::env::var("REQUIRED_PRICE_USD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0),
        interval: std::env::var("REQUIRED_INTERVAL").unwrap_or_else(|_| "monthly".to_string()),
    }
}

async fn ensure_private_key(tunnel: &dyn TunnelDriver, path: &PathBuf) -> Option<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    let generated = tunnel.generate_private_key().await?;
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if std::fs::write(path, &generated).is_err() {
        return Some(generated);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Some(generated)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "startup configuration is invalid");
            std::process::exit(1);
        }
    };

    let tunnel: Arc<dyn TunnelDriver> = Arc::new(WgTunnelDriver);

    let local_private_key = if config.enable_wireguard {
        let key_path = PathBuf::from(format!("{}.key", config.wg_config_path));
        match ensure_private_key(tunnel.as_ref(), &key_path).await {
            Some(key) => Some(key),
            None => {
                error!("unable to generate a WireGuard private key");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let timeout = Duration::from_secs(config.connect_timeout_seconds);
    let metrics = Arc::new(Metrics::new());
    let ledger = Arc::new(BandwidthLedger::new(config.bandwidth_total_mbps, 0.5));
    let pool = Arc::new(PoolClient::new(config.pool_url.clone(), timeout));
    let payment = Arc::new(PaymentVerifier::new(config.payment_api_url.clone(), timeout, plan_terms()));
    let socks: Arc<dyn dvpn_supervisor::socks::SocksDriver> = Arc::new(DantedSocksDriver::new(
        config.danted_template_path.clone(),
        config.danted_config_path.clone(),
        config.socks_port,
    ));
    let network_probe: Arc<dyn dvpn_supervisor::network::NetworkProbe> =
        Arc::new(HttpNetworkProbe::new(String::new(), timeout));
    let token_store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(PathBuf::from(&config.token_store_path)));
    let fallback: Arc<dyn FallbackProvisioner> =
        Arc::new(HttpFallbackProvisioner::new(config.fallback_orchestrator_url.clone(), timeout));

    let control_addr = (config.control_host, config.control_port);

    let supervisor = Arc::new(Supervisor::new(
        config,
        metrics,
        ledger,
        pool,
        payment,
        tunnel,
        socks,
        network_probe,
        token_store,
        fallback,
        Arc::new(NoopStartOnBoot),
        local_private_key,
    ));

    let driver_supervisor = supervisor.clone();
    let driver_handle = tokio::spawn(async move { driver_supervisor.run_loop().await });

    let router = dvpn_supervisor::control::control_router(supervisor.clone());
    let listener = match tokio::net::TcpListener::bind(control_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "failed to bind control surface");
            std::process::exit(1);
        }
    };

    info!(addr = ?control_addr, "control surface listening");
    let shutdown_supervisor = supervisor.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown_supervisor.wait_for_exit().await })
        .await?;

    driver_handle.abort();
    Ok(())
}
