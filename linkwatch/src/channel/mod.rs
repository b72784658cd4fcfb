//! Interactive shell layer.
//!
//! Output from a PTY arrives as an unframed byte stream. This module
//! accumulates it in a [`PatternBuffer`] (escape sequences stripped on the
//! way in), decides when a command has finished with a tiered
//! [`PromptMatcher`], and exposes the whole protocol as [`ShellSession`].

mod buffer;
mod patterns;
mod shell;

pub use buffer::PatternBuffer;
pub use patterns::{IdlePolicy, PromptDetection, PromptMatcher, anchor_pattern};
pub use shell::{SharedShell, ShellConfig, ShellSession, clean_output};
