//! Interface to device port mappings.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

use crate::error::ScanError;

/// Where a logical interface lives on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Name as configured, e.g. `0/1`.
    pub interface: String,
    /// Port id from the management CLI.
    pub port: String,
    /// ASIC port name from the sub-CLI, when the profile has one.
    pub asic: Option<String>,
}

impl PortMapping {
    /// Template variables for this mapping.
    pub fn vars(&self) -> Vec<(&str, &str)> {
        let mut vars = vec![
            ("interface", self.interface.as_str()),
            ("port", self.port.as_str()),
        ];
        if let Some(asic) = &self.asic {
            vars.push(("asic", asic.as_str()));
        }
        vars
    }
}

/// Mappings resolved so far, kept for the process lifetime.
#[derive(Debug, Default)]
pub struct MappingCache {
    entries: Mutex<HashMap<String, PortMapping>>,
}

impl MappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, interface: &str) -> Option<PortMapping> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(interface).cloned())
    }

    pub fn insert(&self, mapping: PortMapping) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(mapping.interface.clone(), mapping);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Substitute `{key}` placeholders in `template`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

/// Named group `group` of the first match of `pattern` in `output`.
pub(crate) fn capture(pattern: &str, output: &str, group: &str) -> Result<Option<String>, ScanError> {
    let regex = Regex::new(pattern)?;
    Ok(regex
        .captures(output)
        .and_then(|caps| caps.name(group))
        .map(|m| m.as_str().to_string()))
}
