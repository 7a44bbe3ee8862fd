//! Sticky health bit for discovery loops.
//!
//! Heartbeat and watch loops record every outcome. `ok` follows the latest
//! outcome; `last_error` keeps the most recent failure even after recovery.

use std::sync::Mutex;

use serde::Serialize;

/// Snapshot of discovery health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    /// False while the latest heartbeat or watch attempt failed.
    pub ok: bool,
    /// Most recent failure, if any ever happened.
    pub last_error: Option<String>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            ok: true,
            last_error: None,
        }
    }
}

/// Shared, updatable [`Health`].
#[derive(Debug, Default)]
pub struct HealthBit {
    state: Mutex<Health>,
}

impl HealthBit {
    /// Creates a healthy bit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful attempt.
    pub fn record_ok(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.ok = true;
        }
    }

    /// Records a failed attempt.
    pub fn record_error(&self, error: &dyn std::fmt::Display) {
        if let Ok(mut state) = self.state.lock() {
            state.ok = false;
            state.last_error = Some(error.to_string());
        }
    }

    /// Current state.
    pub fn snapshot(&self) -> Health {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}
