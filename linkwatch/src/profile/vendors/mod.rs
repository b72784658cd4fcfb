//! Built-in device profiles.

pub mod linux;
pub mod slx;

use super::DeviceProfile;

/// Look up a built-in profile by name.
pub fn by_name(name: &str) -> Option<DeviceProfile> {
    match name {
        linux::PROFILE_NAME => Some(linux::profile()),
        slx::PROFILE_NAME => Some(slx::profile()),
        _ => None,
    }
}
