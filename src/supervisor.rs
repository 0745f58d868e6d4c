//! Supervisor state machine (C8): the driver loop that ties every other
//! component together. Structured as a single `Mutex<SupervisorState>`
//! guarding the coherent phase/flag bundle, following the same pattern as
//! the teacher's `Arc<RwLock<LearningStatus>>` in `background.rs` — one
//! lock for one coherent piece of state, not a lock per field.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bandwidth::BandwidthLedger;
use crate::claim::ClaimApplier;
use crate::config::Config;
use crate::fallback::FallbackProvisioner;
use crate::metrics::Metrics;
use crate::network::NetworkProbe;
use crate::payment::PaymentVerifier;
use crate::pool::{PoolClient, PoolError};
use crate::provider::{validate_provider, InvalidProvider, Provider};
use crate::scheduler;
use crate::selection::{fastest_of_sample, mesh_cycle, SelectionError};
use crate::socks::SocksDriver;
use crate::startup::StartOnBoot;
use crate::token_store::TokenStore;
use crate::tunnel::{
    render_client_config, render_server_config, verify_handshake, write_config_file,
    InterfaceParams, TunnelDriver, TunnelError,
};

const WG_INTERFACE: &str = "wg0";
const MAX_LOG_LINES: usize = 200;
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(20);
const STANDBY_POLL_DELAY: Duration = Duration::from_secs(3);
const GATE_POLL_DELAY: Duration = Duration::from_secs(1);
const STEADY_TICK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    PaymentBlocked,
    ControlPlane,
    ProviderStandby,
    Rotating,
    TunnelUp,
    HandshakeConfirmed,
    TrafficVerified,
    ControlPlaneOnly,
    Stopped,
    Error,
    Restarting,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("payment is not active for this scope")]
    PaymentInactive,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Validation(#[from] InvalidProvider),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("socks process exited unexpectedly")]
    SocksDied,
    #[error("no fallback provider was offered")]
    NoFallbackAvailable,
}

/// Distinguishes a rotation signal from a genuine fault, replacing the
/// `RotationRequested` control-flow exception from the original
/// implementation (see spec's redesign note).
pub enum TickOutcome {
    Steady,
    Rotate,
    Fault(SupervisorError),
}

/// The coherent phase/flag bundle, behind a single mutex.
pub struct SupervisorState {
    pub running: bool,
    pub desired_connected: bool,
    pub killswitch_enabled: bool,
    pub phase: Phase,
    pub last_provider_id: Option<String>,
    pub pool_pruned_once: bool,
    pub node_registered_once: bool,
    pub provider_server_ready: bool,
    pub provider_forwarding_applied: bool,
    pub recent_logs: VecDeque<String>,
    pub pool_event: Option<String>,
    pub connection_event: Option<String>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            running: true,
            desired_connected: true,
            killswitch_enabled: false,
            phase: Phase::Idle,
            last_provider_id: None,
            pool_pruned_once: false,
            node_registered_once: false,
            provider_server_ready: false,
            provider_forwarding_applied: false,
            recent_logs: VecDeque::with_capacity(MAX_LOG_LINES),
            pool_event: None,
            connection_event: None,
        }
    }
}

/// Everything the supervisor needs, wired once at startup. Trait objects
/// stand in for every external collaborator the spec marks opaque.
pub struct Supervisor {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub ledger: Arc<BandwidthLedger>,
    pub pool: Arc<PoolClient>,
    pub payment: Arc<PaymentVerifier>,
    pub tunnel: Arc<dyn TunnelDriver>,
    pub socks: Arc<dyn SocksDriver>,
    pub network_probe: Arc<dyn NetworkProbe>,
    pub token_store: Arc<dyn TokenStore>,
    pub fallback: Arc<dyn FallbackProvisioner>,
    pub start_on_boot: Arc<dyn StartOnBoot>,
    pub claims: ClaimApplier,
    state: Mutex<SupervisorState>,
    local_private_key: Mutex<Option<String>>,
    current_token: Mutex<Option<String>>,
    running_flag: AtomicBool,
    shutdown: tokio::sync::Notify,
}

impl Supervisor {
    pub fn new(
        config: Config,
        metrics: Arc<Metrics>,
        ledger: Arc<BandwidthLedger>,
        pool: Arc<PoolClient>,
        payment: Arc<PaymentVerifier>,
        tunnel: Arc<dyn TunnelDriver>,
        socks: Arc<dyn SocksDriver>,
        network_probe: Arc<dyn NetworkProbe>,
        token_store: Arc<dyn TokenStore>,
        fallback: Arc<dyn FallbackProvisioner>,
        start_on_boot: Arc<dyn StartOnBoot>,
        local_private_key: Option<String>,
    ) -> Self {
        let current_token = token_store.load();
        Self {
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
            start_on_boot,
            claims: ClaimApplier::new(),
            state: Mutex::new(SupervisorState::default()),
            local_private_key: Mutex::new(local_private_key),
            current_token: Mutex::new(current_token),
            running_flag: AtomicBool::new(true),
            shutdown: tokio::sync::Notify::new(),
        }
    }

    /// Resolves once `exit` has been called. Used by `main` to drive the
    /// control server's graceful shutdown alongside the driver loop.
    pub async fn wait_for_exit(&self) {
        self.shutdown.notified().await;
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        let mut state = self.state.lock().expect("supervisor state poisoned");
        if state.recent_logs.len() >= MAX_LOG_LINES {
            state.recent_logs.pop_front();
        }
        state.recent_logs.push_back(message);
    }

    fn set_phase(&self, phase: Phase) {
        self.state.lock().expect("supervisor state poisoned").phase = phase;
    }

    pub fn snapshot_logs(&self, limit: usize) -> Vec<String> {
        let state = self.state.lock().expect("supervisor state poisoned");
        state
            .recent_logs
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().expect("supervisor state poisoned").phase
    }

    pub fn desired_connected(&self) -> bool {
        self.state
            .lock()
            .expect("supervisor state poisoned")
            .desired_connected
    }

    pub fn killswitch_enabled(&self) -> bool {
        self.state
            .lock()
            .expect("supervisor state poisoned")
            .killswitch_enabled
    }

    /// `start`: re-enables reconnection. A no-op if already desired.
    pub fn start(&self) {
        let mut state = self.state.lock().expect("supervisor state poisoned");
        state.desired_connected = true;
    }

    /// `stop`: idempotent synchronous teardown, per §5 — the caller
    /// observes a quiesced daemon on return.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().expect("supervisor state poisoned");
            state.desired_connected = false;
        }
        self.teardown_connection().await;
    }

    pub async fn restart(&self) {
        self.stop().await;
        self.set_phase(Phase::Restarting);
        self.start();
    }

    pub fn set_killswitch(&self, enabled: bool) {
        let mut state = self.state.lock().expect("supervisor state poisoned");
        state.killswitch_enabled = enabled;
        if enabled {
            state.desired_connected = false;
        }
    }

    /// `exit`: drops `running`; also performs the synchronous teardown.
    pub async fn exit(&self) {
        self.running_flag.store(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock().expect("supervisor state poisoned");
            state.running = false;
            state.desired_connected = false;
        }
        self.teardown_connection().await;
        self.shutdown.notify_waiters();
    }

    pub async fn set_start_on_boot(&self, enabled: bool) {
        self.start_on_boot.set_enabled(enabled).await;
    }

    pub async fn start_on_boot_enabled(&self) -> bool {
        self.start_on_boot.is_enabled().await
    }

    pub fn pool_event(&self) -> Option<String> {
        self.state.lock().expect("supervisor state poisoned").pool_event.clone()
    }

    pub fn connection_event(&self) -> Option<String> {
        self.state
            .lock()
            .expect("supervisor state poisoned")
            .connection_event
            .clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Some(ref token) = token {
            let _ = self.token_store.save(token);
        }
        *self.current_token.lock().expect("token poisoned") = token;
    }

    fn token(&self) -> Option<String> {
        self.current_token.lock().expect("token poisoned").clone()
    }

    async fn teardown_connection(&self) {
        self.tunnel.down(WG_INTERFACE).await;
        self.socks.stop().await;
        let last_provider = {
            let mut state = self.state.lock().expect("supervisor state poisoned");
            state.last_provider_id.take()
        };
        if let Some(id) = last_provider {
            self.ledger.close(&id);
        }
    }

    /// The outer driver loop, spawned via `tokio::spawn` from `main`.
    pub async fn run_loop(&self) {
        loop {
            if !self.running_flag.load(Ordering::SeqCst) {
                break;
            }
            self.run_once().await;
        }
    }

    /// One full outer-loop iteration (§4.7 steps 1-15).
    async fn run_once(&self) {
        // Step 1.
        let (desired_connected, killswitch_enabled) = {
            let state = self.state.lock().expect("supervisor state poisoned");
            (state.desired_connected, state.killswitch_enabled)
        };
        if !desired_connected || killswitch_enabled {
            scheduler::sleep_until_or_cancelled(Instant::now() + GATE_POLL_DELAY, &self.running_flag).await;
            return;
        }

        // Step 2: payment gate.
        self.pool.set_token(self.token());
        if !self.payment.is_active(&self.token().unwrap_or_default(), "pool-access").await {
            self.log("payment inactive, holding at payment_blocked");
            self.set_phase(Phase::PaymentBlocked);
            self.metrics.inc("dvpn_payment_failure_total", 1);
            self.teardown_connection().await;
            let deadline = Instant::now() + scheduler::retry_delay(self.config.retry_seconds);
            scheduler::sleep_until_or_cancelled(deadline, &self.running_flag).await;
            return;
        }

        // Step 3.
        self.maybe_register_node().await;
        // Step 4.
        self.maybe_prune_pool_on_startup().await;
        // Step 5.
        if self.config.enable_socks && !self.socks.is_running().await {
            self.socks.start().await;
        }
        self.set_phase(Phase::ControlPlane);

        // Step 6.
        match self.choose_pool_provider().await {
            Err(PivotOrFault::Standby) => {
                self.enter_provider_standby().await;
                return;
            }
            Err(PivotOrFault::Fault(err)) => {
                self.handle_fault(err).await;
                return;
            }
            Ok((chosen, source)) => {
                if let Err(err) = self.connect_and_hold(&chosen, source).await {
                    self.handle_fault(err).await;
                }
            }
        }
    }

    async fn maybe_register_node(&self) {
        let already_done = {
            let state = self.state.lock().expect("supervisor state poisoned");
            state.node_registered_once
        };
        if already_done || !self.config.node_register_enabled {
            return;
        }

        let local_private_key = self.local_private_key.lock().expect("key poisoned").clone();
        let Some(local_private_key) = local_private_key else {
            self.log("no local private key available, skipping node registration");
            return;
        };
        let Some(public_key) = self.tunnel.derive_public_key(&local_private_key).await else {
            self.log("unable to derive public key, skipping node registration");
            return;
        };

        let network = crate::network::auto_network_config(
            self.network_probe.as_ref(),
            self.config.upnp_enabled,
            self.config.socks_port,
        )
        .await;

        let endpoint = match (&self.config.node_public_endpoint, &network.public_ip) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(public_ip)) => format!("{public_ip}:{}", self.config.node_port),
            (None, None) => {
                self.log("no public endpoint available, skipping node registration");
                return;
            }
        };

        let metadata = serde_json::json!({
            "cgnat_suspected": network.cgnat_suspected,
            "upnp_mapped": network.upnp_mapped,
        });

        match self
            .pool
            .register_node(
                &self.config.node_id,
                &endpoint,
                &public_key,
                &self.config.wg_provider_address,
                metadata,
            )
            .await
        {
            Ok(()) => {
                self.metrics.inc("dvpn_node_register_success_total", 1);
                self.state.lock().expect("supervisor state poisoned").node_registered_once = true;
                self.log("node registered with pool");
            }
            Err(err) => {
                self.metrics.inc("dvpn_node_register_failure_total", 1);
                warn!(error = %err, "node registration failed");
            }
        }
    }

    async fn maybe_prune_pool_on_startup(&self) {
        let already_done = {
            let state = self.state.lock().expect("supervisor state poisoned");
            state.pool_pruned_once
        };
        if already_done {
            return;
        }
        match self.pool.prune_dead_endpoints().await {
            Ok(outcome) => self.log(format!(
                "pruned {} dead endpoints, {} remaining",
                outcome.removed, outcome.remaining
            )),
            Err(err) => warn!(error = %err, "pool prune failed"),
        }
        self.state.lock().expect("supervisor state poisoned").pool_pruned_once = true;
    }

    async fn choose_pool_provider(&self) -> Result<(Provider, &'static str), PivotOrFault> {
        let providers = match self.pool.fetch_providers().await {
            Ok(providers) => providers,
            Err(err) => return self.fallback_or_fault(err.into()).await,
        };

        let local_ip = crate::network::detect_local_ip();
        let previous_id = {
            let state = self.state.lock().expect("supervisor state poisoned");
            state.last_provider_id.clone()
        };

        let ordered = match mesh_cycle(
            &providers,
            &self.config.node_id,
            None,
            local_ip.as_deref(),
            previous_id.as_deref(),
        ) {
            Ok(ordered) => ordered,
            Err(SelectionError::NoNonSelfProviders) => return Err(PivotOrFault::Standby),
            Err(err) => return self.fallback_or_fault(err.into()).await,
        };

        match fastest_of_sample(
            &ordered,
            self.config.mesh_sample_size,
            Duration::from_secs(self.config.connect_timeout_seconds),
            self.config.allow_private_endpoints,
        ) {
            Ok(chosen) => Ok((chosen, "pool")),
            Err(err) => self.fallback_or_fault(err.into()).await,
        }
    }

    async fn fallback_or_fault(
        &self,
        err: SupervisorError,
    ) -> Result<(Provider, &'static str), PivotOrFault> {
        self.metrics.inc("dvpn_fallback_attempt_total", 1);
        warn!(error = %err, "pool selection failed, attempting fallback");
        match self.fallback.provision().await {
            Some(provider) => {
                validate_provider(&provider, self.config.allow_private_endpoints)
                    .map_err(|e| PivotOrFault::Fault(e.into()))?;
                Ok((provider, "fallback"))
            }
            None => Err(PivotOrFault::Fault(err)),
        }
    }

    async fn enter_provider_standby(&self) {
        self.set_phase(Phase::ProviderStandby);
        {
            let mut state = self.state.lock().expect("supervisor state poisoned");
            state.provider_forwarding_applied = true;
        }

        if self.config.enable_wireguard {
            let server_ready = {
                let state = self.state.lock().expect("supervisor state poisoned");
                state.provider_server_ready
            };
            if !server_ready {
                let private_key = self.local_private_key.lock().expect("key poisoned").clone();
                if let Some(private_key) = private_key {
                    let interface = InterfaceParams {
                        private_key: &private_key,
                        address: &self.config.wg_provider_address,
                        listen_port: self.config.node_port,
                        dns: None,
                    };
                    let rendered = render_server_config(&interface);
                    if write_config_file(std::path::Path::new(&self.config.wg_config_path), &rendered).is_ok()
                        && self
                            .tunnel
                            .up(WG_INTERFACE, std::path::Path::new(&self.config.wg_config_path))
                            .await
                            .is_ok()
                    {
                        self.state.lock().expect("supervisor state poisoned").provider_server_ready = true;
                        self.log("provider-standby tunnel server is up");
                    }
                }
            }
        }

        match self.pool.fetch_next_claim(&self.config.node_id).await {
            Ok(Some(claim)) => {
                self.claims.apply(self.tunnel.as_ref(), WG_INTERFACE, &claim).await;
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "claim poll failed"),
        }

        scheduler::sleep_until_or_cancelled(Instant::now() + STANDBY_POLL_DELAY, &self.running_flag).await;
    }

    async fn connect_and_hold(
        &self,
        chosen: &Provider,
        source: &'static str,
    ) -> Result<(), SupervisorError> {
        // Step 7.
        if !self.payment.is_active(&self.token().unwrap_or_default(), &chosen.id).await {
            return Err(SupervisorError::PaymentInactive);
        }

        // Step 8.
        if source == "pool" {
            self.pool.approve(chosen, &self.token().unwrap_or_default()).await?;
        }

        // Step 9.
        if let Some(token) = self.token() {
            let _ = self.token_store.save(&token);
        }

        // Step 10.
        {
            let mut state = self.state.lock().expect("supervisor state poisoned");
            state.last_provider_id = Some(chosen.id.clone());
        }
        let granted = self.ledger.open(&chosen.id);
        self.metrics.set_gauge("dvpn_last_granted_mbps", granted);
        self.metrics.set_gauge("dvpn_active_connections", self.ledger.active_count() as f64);
        self.metrics.set_gauge("dvpn_bandwidth_total_mbps", self.ledger.total_mbps());

        // Step 11.
        if self.config.enable_wireguard {
            let private_key = self
                .local_private_key
                .lock()
                .expect("key poisoned")
                .clone()
                .unwrap_or_default();
            let address = chosen.client_ip.clone().unwrap_or_else(|| self.config.wg_address.clone());
            let interface = InterfaceParams {
                private_key: &private_key,
                address: &address,
                listen_port: self.config.node_port,
                dns: self.config.wg_dns.as_deref(),
            };
            let rendered = render_client_config(&interface, chosen, self.config.wg_persistent_keepalive);
            write_config_file(std::path::Path::new(&self.config.wg_config_path), &rendered)?;

            self.tunnel.down(WG_INTERFACE).await;
            self.tunnel
                .up(WG_INTERFACE, std::path::Path::new(&self.config.wg_config_path))
                .await?;
            self.set_phase(Phase::TunnelUp);

            verify_handshake(self.tunnel.as_ref(), WG_INTERFACE, &chosen.public_key, HANDSHAKE_DEADLINE).await?;
            self.set_phase(Phase::HandshakeConfirmed);
        }

        self.set_phase(Phase::TrafficVerified);
        self.metrics.inc("dvpn_connect_success_total", 1);
        self.log(format!("connected to provider {} via {source}", chosen.id));

        // Step 12.
        let rotate_at = scheduler::next_rotation_deadline(
            self.config.endpoint_rotate_seconds,
            self.config.endpoint_rotate_jitter_seconds,
        );

        // Step 13.
        match self.steady_loop(rotate_at).await {
            TickOutcome::Steady => Ok(()),
            TickOutcome::Rotate => {
                self.log("rotation deadline reached");
                self.set_phase(Phase::Rotating);
                self.teardown_connection().await;
                Ok(())
            }
            TickOutcome::Fault(err) => Err(err),
        }
    }

    async fn steady_loop(&self, rotate_at: Instant) -> TickOutcome {
        loop {
            let (running, desired_connected) = {
                let state = self.state.lock().expect("supervisor state poisoned");
                (state.running, state.desired_connected)
            };
            if !running || !desired_connected {
                return TickOutcome::Steady;
            }
            if self.config.enable_socks && !self.socks.is_running().await {
                return TickOutcome::Fault(SupervisorError::SocksDied);
            }
            if Instant::now() >= rotate_at {
                return TickOutcome::Rotate;
            }
            let tick_deadline = Instant::now() + STEADY_TICK;
            if !scheduler::sleep_until_or_cancelled(tick_deadline, &self.running_flag).await {
                return TickOutcome::Steady;
            }
        }
    }

    async fn handle_fault(&self, err: SupervisorError) {
        self.metrics.inc("dvpn_connect_failure_total", 1);
        error!(error = %err, "connect attempt failed");
        self.set_phase(Phase::Error);
        self.teardown_connection().await;
        let deadline = Instant::now() + scheduler::retry_delay(self.config.retry_seconds);
        scheduler::sleep_until_or_cancelled(deadline, &self.running_flag).await;
    }
}

enum PivotOrFault {
    Standby,
    Fault(SupervisorError),
}
