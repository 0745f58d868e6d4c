//! Pool client (C5): HTTPS access to the provider pool service.
//!
//! Mirrors the call shape of the teacher's LLM clients (`reqwest::Client`
//! built once, a typed method per remote operation, errors surfaced
//! through a single enum) rather than the raw `urllib.request` calls of
//! the original Python `PoolClient`.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::provider::Provider;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool operation {operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("pool operation {operation} returned status {status}")]
    Status {
        operation: &'static str,
        status: StatusCode,
    },
    #[error("pool operation {operation} returned an unparseable response: {reason}")]
    Parse {
        operation: &'static str,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct PruneOutcome {
    pub removed: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolClaim {
    pub lease_nonce: String,
    pub client_ip: String,
    pub client_public_key: String,
}

#[derive(Debug, Deserialize)]
struct ClaimNextResponse {
    ok: bool,
    #[serde(default)]
    claim: Option<PoolClaim>,
}

#[derive(Debug, Serialize)]
struct ApproveRequest<'a> {
    provider_id: &'a str,
    token: &'a str,
    approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_ip: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_nonce: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_sig: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    id: &'a str,
    endpoint: &'a str,
    public_key: &'a str,
    allowed_ips: &'a str,
    metadata: serde_json::Value,
}

pub struct PoolClient {
    base_url: String,
    http: Client,
    token: Mutex<Option<String>>,
}

impl PoolClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .expect("reqwest client config is always valid");
        Self {
            base_url: base_url.into(),
            http,
            token: Mutex::new(None),
        }
    }

    /// Set the payment token attached as `X-DVPN-Token` to every request.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock().expect("pool token poisoned") = token;
    }

    fn with_token(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self.token.lock().expect("pool token poisoned").clone();
        match token {
            Some(token) if !token.is_empty() => builder.header("X-DVPN-Token", token),
            _ => builder,
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), suffix)
    }

    /// GET the provider list; keep entries whose `health` is absent or
    /// `"ok"`. Never validates beyond that — selection does the rest.
    pub async fn fetch_providers(&self) -> Result<Vec<Provider>, PoolError> {
        let operation = "fetch_providers";
        let request = self.with_token(self.http.get(&self.base_url));
        let response = request
            .send()
            .await
            .map_err(|source| PoolError::Transport { operation, source })?;

        if !response.status().is_success() {
            return Err(PoolError::Status {
                operation,
                status: response.status(),
            });
        }

        let raw: Vec<Provider> = response
            .json()
            .await
            .map_err(|err| PoolError::Parse {
                operation,
                reason: err.to_string(),
            })?;

        Ok(raw
            .into_iter()
            .filter(|p| matches!(p.health.as_deref(), None | Some("ok")))
            .collect())
    }

    pub async fn approve(&self, provider: &Provider, token: &str) -> Result<(), PoolError> {
        let operation = "approve";
        let body = ApproveRequest {
            provider_id: &provider.id,
            token,
            approved: true,
            client_ip: provider.client_ip.as_deref(),
            lease_nonce: provider.lease_nonce.as_deref(),
            lease_exp: provider.lease_exp,
            lease_sig: provider.lease_sig.as_deref(),
        };
        self.post_ok(&self.url("approve"), &body, operation).await
    }

    pub async fn register_node(
        &self,
        id: &str,
        endpoint: &str,
        public_key: &str,
        allowed_ips: &str,
        metadata: serde_json::Value,
    ) -> Result<(), PoolError> {
        let operation = "register_node";
        let body = RegisterRequest {
            id,
            endpoint,
            public_key,
            allowed_ips,
            metadata,
        };
        self.post_ok(&self.url("register"), &body, operation).await
    }

    pub async fn prune_dead_endpoints(&self) -> Result<PruneOutcome, PoolError> {
        let operation = "prune_dead_endpoints";
        let request = self.with_token(self.http.post(self.url("prune")).json(&json!({})));
        let response = request
            .send()
            .await
            .map_err(|source| PoolError::Transport { operation, source })?;
        if !response.status().is_success() {
            return Err(PoolError::Status {
                operation,
                status: response.status(),
            });
        }
        response.json().await.map_err(|err| PoolError::Parse {
            operation,
            reason: err.to_string(),
        })
    }

    pub async fn fetch_next_claim(&self, provider_id: &str) -> Result<Option<PoolClaim>, PoolError> {
        let operation = "fetch_next_claim";
        let request = self.with_token(
            self.http
                .post(self.url("claim/next"))
                .json(&json!({ "provider_id": provider_id })),
        );
        let response = request
            .send()
            .await
            .map_err(|source| PoolError::Transport { operation, source })?;
        if !response.status().is_success() {
            return Err(PoolError::Status {
                operation,
                status: response.status(),
            });
        }
        let parsed: ClaimNextResponse = response.json().await.map_err(|err| PoolError::Parse {
            operation,
            reason: err.to_string(),
        })?;
        Ok(if parsed.ok { parsed.claim } else { None })
    }

    async fn post_ok<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        operation: &'static str,
    ) -> Result<(), PoolError> {
        let request = self.with_token(self.http.post(url).json(body));
        let response = request
            .send()
            .await
            .map_err(|source| PoolError::Transport { operation, source })?;
        if !response.status().is_success() {
            return Err(PoolError::Status {
                operation,
                status: response.status(),
            });
        }
        Ok(())
    }
}
