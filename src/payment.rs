//! Payment gate (C6): the entitlement predicate against the remote
//! verifier. Any transport or parse failure is treated as "inactive"
//! rather than propagated — the supervisor only ever sees a bool.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Plan terms the verifier's response is checked against. These mirror the
/// constants hard-coded in the original `payment.py` (`REQUIRED_BTC_WALLET`
/// and friends); here they're configuration rather than literals, so a
/// deployment can point at a different wallet/price without a rebuild.
#[derive(Debug, Clone)]
pub struct PlanTerms {
    pub wallet: String,
    pub price_usd: f64,
    pub interval: String,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    token: &'a str,
    provider_id: &'a str,
    required_wallet: &'a str,
    required_price_usd: f64,
    required_interval: &'a str,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    wallet: Option<String>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    amount_usd: Option<Value>,
}

fn evaluate_status(response: &StatusResponse, terms: &PlanTerms) -> bool {
    let amount_usd = match &response.amount_usd {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };

    response.active
        && response.wallet.as_deref() == Some(terms.wallet.as_str())
        && response.interval.as_deref() == Some(terms.interval.as_str())
        && amount_usd >= terms.price_usd
}

pub struct PaymentVerifier {
    verify_url: String,
    http: Client,
    terms: PlanTerms,
}

impl PaymentVerifier {
    pub fn new(verify_url: impl Into<String>, timeout: Duration, terms: PlanTerms) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .expect("reqwest client config is always valid");
        Self {
            verify_url: verify_url.into(),
            http,
            terms,
        }
    }

    /// True iff the verifier reports `active`, the matching wallet and
    /// interval, and an `amount_usd` that parses as a float at least the
    /// required price. Any transport or parse failure returns `false`.
    pub async fn is_active(&self, token: &str, scope_id: &str) -> bool {
        let body = StatusRequest {
            token,
            provider_id: scope_id,
            required_wallet: &self.terms.wallet,
            required_price_usd: self.terms.price_usd,
            required_interval: &self.terms.interval,
        };

        let response = match self.http.post(&self.verify_url).json(&body).send().await {
            Ok(response) => response,
            Err(_) => return false,
        };
        if !response.status().is_success() {
            return false;
        }
        let parsed: StatusResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };

        evaluate_status(&parsed, &self.terms)
    }

    /// POST the checkout-start request and return the verifier's session
    /// body verbatim, for the control surface to pass through unmodified.
    pub async fn begin_checkout(&self, user_id: &str) -> Result<Value, reqwest::Error> {
        let base = self.verify_url.trim_end_matches('/');
        let url = format!("{base}/checkout/start");
        self.http
            .post(url)
            .json(&serde_json::json!({
                "user_id": user_id,
                "required_wallet": self.terms.wallet,
                "required_price_usd": self.terms.price_usd,
                "required_interval": self.terms.interval,
            }))
            .send()
            .await?
            .json()
            .await
    }

    /// POST the checkout-status request; same body shape as `begin_checkout`.
    pub async fn poll_checkout(&self, session_id: &str) -> Result<Value, reqwest::Error> {
        let base = self.verify_url.trim_end_matches('/');
        let url = format!("{base}/checkout/status");
        self.http
            .post(url)
            .json(&serde_json::json!({
                "session_id": session_id,
                "required_wallet": self.terms.wallet,
                "required_price_usd": self.terms.price_usd,
                "required_interval": self.terms.interval,
            }))
            .send()
            .await?
            .json()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms() -> PlanTerms {
        PlanTerms {
            wallet: "1MUss4jmaRJ2sMtS9gyZqeRw8WrhWTsrxn".to_string(),
            price_usd: 9.99,
            interval: "monthly".to_string(),
        }
    }

    #[test]
    fn plan_terms_are_stored_verbatim() {
        let t = terms();
        let verifier = PaymentVerifier::new("https://pay.example.com", Duration::from_secs(5), t);
        assert_eq!(verifier.terms.price_usd, 9.99);
    }

    fn response(active: bool, wallet: &str, interval: &str, amount: Value) -> StatusResponse {
        StatusResponse {
            active,
            wallet: Some(wallet.to_string()),
            interval: Some(interval.to_string()),
            amount_usd: Some(amount),
        }
    }

    #[test]
    fn active_matching_terms_passes() {
        let t = terms();
        let resp = response(true, &t.wallet, &t.interval, Value::from(9.99));
        assert!(evaluate_status(&resp, &t));
    }

    #[test]
    fn inactive_flag_fails_even_with_matching_terms() {
        let t = terms();
        let resp = response(false, &t.wallet, &t.interval, Value::from(9.99));
        assert!(!evaluate_status(&resp, &t));
    }

    #[test]
    fn wrong_wallet_fails() {
        let t = terms();
        let resp = response(true, "someone-elses-wallet", &t.interval, Value::from(9.99));
        assert!(!evaluate_status(&resp, &t));
    }

    #[test]
    fn price_below_requirement_fails() {
        let t = terms();
        let resp = response(true, &t.wallet, &t.interval, Value::from(1.0));
        assert!(!evaluate_status(&resp, &t));
    }

    #[test]
    fn amount_as_string_is_parsed() {
        let t = terms();
        let resp = response(true, &t.wallet, &t.interval, Value::from("9.99"));
        assert!(evaluate_status(&resp, &t));
    }

    #[test]
    fn missing_amount_fails() {
        let t = terms();
        let mut resp = response(true, &t.wallet, &t.interval, Value::from(9.99));
        resp.amount_usd = None;
        assert!(!evaluate_status(&resp, &t));
    }
}
