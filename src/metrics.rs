//! Metrics registry (C4): monotonic counters and overwriting gauges, with
//! a Prometheus text-exposition renderer for the `/metrics` control route.

use std::collections::BTreeMap;
use std::sync::Mutex;

pub struct Metrics {
    counters: Mutex<BTreeMap<&'static str, u64>>,
    gauges: Mutex<BTreeMap<&'static str, f64>>,
}

const COUNTER_NAMES: &[&str] = &[
    "dvpn_connect_success_total",
    "dvpn_connect_failure_total",
    "dvpn_fallback_attempt_total",
    "dvpn_payment_failure_total",
    "dvpn_node_register_success_total",
    "dvpn_node_register_failure_total",
];

const GAUGE_NAMES: &[&str] = &[
    "dvpn_active_connections",
    "dvpn_bandwidth_total_mbps",
    "dvpn_last_granted_mbps",
];

impl Default for Metrics {
    fn default() -> Self {
        let counters = COUNTER_NAMES.iter().map(|&name| (name, 0)).collect();
        let gauges = GAUGE_NAMES.iter().map(|&name| (name, 0.0)).collect();
        Self {
            counters: Mutex::new(counters),
            gauges: Mutex::new(gauges),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a named counter. Counters never decrease; an unknown name
    /// is inserted at `value` rather than panicking, so a new metric can be
    /// added without touching every call site.
    pub fn inc(&self, name: &'static str, value: u64) {
        let mut counters = self.counters.lock().expect("metrics poisoned");
        *counters.entry(name).or_insert(0) += value;
    }

    pub fn set_gauge(&self, name: &'static str, value: f64) {
        let mut gauges = self.gauges.lock().expect("metrics poisoned");
        gauges.insert(name, value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        *self
            .counters
            .lock()
            .expect("metrics poisoned")
            .get(name)
            .unwrap_or(&0)
    }

    /// Render in Prometheus text-exposition format (`text/plain; version=0.0.4`).
    pub fn render_prometheus(&self) -> String {
        let counters = self.counters.lock().expect("metrics poisoned");
        let gauges = self.gauges.lock().expect("metrics poisoned");

        let mut out = String::new();
        for (name, value) in counters.iter() {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        for (name, value) in gauges.iter() {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        out
    }
}
