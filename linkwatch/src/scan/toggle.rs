//! Port toggling before a scan.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

/// How often an interface may be toggled off/on before sampling.
///
/// Deserializes from `"disabled"`, `"unlimited"` or `{"times": n}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TogglePolicy {
    #[default]
    Disabled,
    Unlimited,
    Times(u32),
}

impl TogglePolicy {
    /// Whether another toggle is allowed after `done` toggles.
    pub fn allows(&self, done: u32) -> bool {
        match self {
            TogglePolicy::Disabled => false,
            TogglePolicy::Unlimited => true,
            TogglePolicy::Times(limit) => done < *limit,
        }
    }
}

/// Per-interface toggle counters.
#[derive(Debug, Default)]
pub struct ToggleTracker {
    policy: TogglePolicy,
    counts: Mutex<HashMap<String, u32>>,
}

impl ToggleTracker {
    pub fn new(policy: TogglePolicy) -> Self {
        Self {
            policy,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> TogglePolicy {
        self.policy
    }

    /// Count a toggle of `interface` if the policy allows one.
    pub fn try_acquire(&self, interface: &str) -> bool {
        let Ok(mut counts) = self.counts.lock() else {
            return false;
        };
        let done = counts.entry(interface.to_string()).or_insert(0);
        if !self.policy.allows(*done) {
            return false;
        }
        *done += 1;
        true
    }

    /// Toggles performed on `interface` so far.
    pub fn count(&self, interface: &str) -> u32 {
        self.counts
            .lock()
            .ok()
            .and_then(|counts| counts.get(interface).copied())
            .unwrap_or(0)
    }
}
