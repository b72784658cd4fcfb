//! Linux hosts (the system under test side of a link).
//!
//! Standard `$` (user) and `#` (root) shell prompts. Interfaces are
//! identified by their PCI bus address.

use crate::profile::{DeviceProfile, PortQuery};

/// Profile name for Linux hosts.
pub const PROFILE_NAME: &str = "linux";

/// Create the Linux profile.
pub fn profile() -> DeviceProfile {
    DeviceProfile::new(PROFILE_NAME)
        .with_prompt(r"[\w.@:~/\[\]-]*[$#]\s*$")
        .with_failure_pattern("command not found")
        .with_failure_pattern("No such file or directory")
        .with_failure_pattern("No such device")
        .with_failure_pattern("Permission denied")
        .with_failure_pattern("Operation not permitted")
        .with_port_query(PortQuery {
            command: "ethtool -i {interface}".to_string(),
            pattern: r"(?m)^bus-info:\s*(?P<port>\S+)".to_string(),
        })
        .with_toggle_commands(
            ["sudo ip link set {interface} down"],
            ["sudo ip link set {interface} up"],
        )
}
