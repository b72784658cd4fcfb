//! Log file lifecycle coordinated by link flaps.
//!
//! While links are flapping every stream rotates to a new numbered file
//! when it grows too large, so nothing recorded during the episode is
//! overwritten. In quiet periods streams are truncated in place instead.

mod flap;
mod stream;

pub use flap::{DEFAULT_LINK_PATTERNS, FlapCoordinator, LinkEventParser};
pub use stream::{
    LogStream, RotationRegistry, RotationState, SharedLogStream, StreamOptions, append_line,
};
