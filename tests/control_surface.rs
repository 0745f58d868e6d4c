//! Crate-level integration tests for the control surface (C7), driven
//! through the real `axum::Router` via `tower::ServiceExt::oneshot`
//! rather than a bound TCP listener.

use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use dvpn_supervisor::bandwidth::BandwidthLedger;
use dvpn_supervisor::config::Config;
use dvpn_supervisor::control::control_router;
use dvpn_supervisor::fallback::FallbackProvisioner;
use dvpn_supervisor::metrics::Metrics;
use dvpn_supervisor::network::NetworkProbe;
use dvpn_supervisor::payment::{PaymentVerifier, PlanTerms};
use dvpn_supervisor::pool::PoolClient;
use dvpn_supervisor::provider::Provider;
use dvpn_supervisor::socks::SocksDriver;
use dvpn_supervisor::startup::NoopStartOnBoot;
use dvpn_supervisor::supervisor::Supervisor;
use dvpn_supervisor::token_store::TokenStore;
use dvpn_supervisor::tunnel::{TunnelDriver, TunnelError};

struct FakeTunnel;
#[async_trait]
impl TunnelDriver for FakeTunnel {
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
        Ok(())
    }
}

struct FakeSocks {
    running: AtomicBool,
}
#[async_trait]
impl SocksDriver for FakeSocks {
    async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }
    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct FakeProbe;
#[async_trait]
impl NetworkProbe for FakeProbe {
    async fn detect_public_ip(&self) -> Option<String> {
        None
    }
    async fn map_upnp(&self, _port: u16, _local_ip: Option<&str>) -> bool {
        false
    }
}

struct MemoryTokenStore {
    value: Mutex<Option<String>>,
}
impl TokenStore for MemoryTokenStore {
    fn save(&self, token: &str) -> Result<(), std::io::Error> {
        *self.value.lock().unwrap() = Some(token.to_string());
        Ok(())
    }
    fn load(&self) -> Option<String> {
        self.value.lock().unwrap().clone()
    }
}

struct NoFallback;
#[async_trait]
impl FallbackProvisioner for NoFallback {
    async fn provision(&self) -> Option<Provider> {
        None
    }
}

fn test_config() -> Config {
    Config {
        enable_wireguard: false,
        enable_socks: false,
        wg_config_path: "/tmp/dvpn-it-wg0.conf".to_string(),
        danted_config_path: "/tmp/dvpn-it-danted.conf".to_string(),
        danted_template_path: "/tmp/dvpn-it-danted.template".to_string(),
        pool_url: "https://pool.example.com".to_string(),
        payment_api_url: "https://pay.example.com".to_string(),
        fallback_orchestrator_url: String::new(),
        connect_timeout_seconds: 5,
        retry_seconds: 1,
        endpoint_rotate_seconds: 300,
        endpoint_rotate_jitter_seconds: 60,
        mesh_sample_size: 5,
        bandwidth_total_mbps: 100.0,
        bandwidth_test_url: String::new(),
        bandwidth_sample_seconds: 5,
        auto_network_config: false,
        upnp_enabled: false,
        node_register_enabled: false,
        node_public_endpoint: None,
        node_port: 51820,
        node_id: "node-1".to_string(),
        user_id: String::new(),
        control_host: IpAddr::from([127, 0, 0, 1]),
        control_port: 8765,
        allow_private_endpoints: false,
        log_stdout: false,
        audit_enabled: false,
        wg_address: "10.6.0.2/32".to_string(),
        wg_dns: None,
        wg_persistent_keepalive: 25,
        wg_provider_address: "10.66.0.1/24".to_string(),
        socks_port: 1080,
        token_store_path: "/tmp/dvpn-it-token".to_string(),
    }
}

fn test_supervisor() -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        test_config(),
        Arc::new(Metrics::new()),
        Arc::new(BandwidthLedger::new(100.0, 0.5)),
        Arc::new(PoolClient::new("https://pool.example.com", Duration::from_secs(5))),
        Arc::new(PaymentVerifier::new(
            "https://pay.example.com",
            Duration::from_secs(5),
            PlanTerms {
                wallet: "wallet".to_string(),
                price_usd: 1.0,
                interval: "monthly".to_string(),
            },
        )),
        Arc::new(FakeTunnel),
        Arc::new(FakeSocks { running: AtomicBool::new(false) }),
        Arc::new(FakeProbe),
        Arc::new(MemoryTokenStore { value: Mutex::new(None) }),
        Arc::new(NoFallback),
        Arc::new(NoopStartOnBoot),
        None,
    ))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let router = control_router(test_supervisor());
    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!({ "ok": true }));
}

#[tokio::test]
async fn metrics_renders_prometheus_text() {
    let router = control_router(test_supervisor());
    let response = router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("dvpn_connect_success_total"));
}

#[tokio::test]
async fn unknown_path_is_404() {
    let router = control_router(test_supervisor());
    let response = router
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stop_then_status_reports_not_desired_connected() {
    let supervisor = test_supervisor();
    let router = control_router(supervisor.clone());

    let stop_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/stop")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stop_response.status(), StatusCode::OK);

    let status_response = router
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(status_response).await;
    assert_eq!(body["desired_connected"], serde_json::json!(false));
}

#[tokio::test]
async fn killswitch_forces_desired_connected_false() {
    let supervisor = test_supervisor();
    let router = control_router(supervisor.clone());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/killswitch")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(supervisor.killswitch_enabled());
    assert!(!supervisor.desired_connected());
}

#[tokio::test]
async fn killswitch_with_no_body_defaults_to_enabled() {
    let supervisor = test_supervisor();
    let router = control_router(supervisor.clone());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/killswitch")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(supervisor.killswitch_enabled());
    assert!(!supervisor.desired_connected());
}

#[tokio::test]
async fn logs_returns_recent_entries_after_actions() {
    let supervisor = test_supervisor();
    supervisor.stop().await;
    let router = control_router(supervisor);

    let response = router
        .oneshot(Request::builder().uri("/logs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["logs"].is_array());
}
