//! Bandwidth allocator (C3): a concurrent ledger with a fixed
//! fraction-per-connection policy. First-come, first-served by design —
//! there is no fairness or reclamation beyond `close`.

use std::collections::HashMap;
use std::sync::Mutex;

/// `open(id)` grants `min(fraction * cap, cap - sum_current)`, which may be
/// zero once the cap is exhausted. `close(id)` is a no-op for an unknown id.
pub struct BandwidthLedger {
    total_mbps: f64,
    fraction_per_connection: f64,
    active: Mutex<HashMap<String, f64>>,
}

impl BandwidthLedger {
    pub fn new(total_mbps: f64, fraction_per_connection: f64) -> Self {
        Self {
            total_mbps: total_mbps.max(0.1),
            fraction_per_connection: fraction_per_connection.clamp(0.01, 1.0),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(&self, connection_id: &str) -> f64 {
        let mut active = self.active.lock().expect("bandwidth ledger poisoned");
        let requested = self.total_mbps * self.fraction_per_connection;
        let sum_current: f64 = active.values().sum();
        let remaining = (self.total_mbps - sum_current).max(0.0);
        let granted = requested.min(remaining);
        active.insert(connection_id.to_string(), granted);
        granted
    }

    pub fn close(&self, connection_id: &str) {
        let mut active = self.active.lock().expect("bandwidth ledger poisoned");
        active.remove(connection_id);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("bandwidth ledger poisoned").len()
    }

    pub fn total_granted(&self) -> f64 {
        self.active
            .lock()
            .expect("bandwidth ledger poisoned")
            .values()
            .sum()
    }

    pub fn total_mbps(&self) -> f64 {
        self.total_mbps
    }
}
