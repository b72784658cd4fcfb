//! Device profile: everything vendor-specific the shell and scans need.

use serde::Deserialize;

use crate::channel::ShellConfig;

/// A vendor shell nested inside the management CLI (e.g. a switch ASIC
/// diagnostic shell).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubCli {
    /// Commands that enter the sub-CLI, in order.
    pub enter: Vec<String>,
    /// Commands that return to the management CLI, in order.
    pub exit: Vec<String>,
    /// Prompt regex of the innermost shell.
    pub prompt: String,
}

/// Management-CLI query resolving an interface name to a device port id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortQuery {
    /// Command template; `{interface}` is substituted.
    pub command: String,
    /// Regex with a named group `port`.
    pub pattern: String,
}

/// Sub-CLI query resolving a port id to the ASIC's port name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AsicQuery {
    /// Command template; `{port}` is substituted.
    pub command: String,
    /// Regex with a named group `asic`; `{port}` is substituted (escaped).
    pub pattern: String,
}

/// Vendor-specific prompts, failure markers and workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Profile name (e.g. "linux", "slx").
    pub name: String,

    /// Prompt regexes of the management CLI.
    pub prompt_patterns: Vec<String>,

    /// Output substrings that mean the device rejected a command.
    pub failed_when_contains: Vec<String>,

    pub sub_cli: Option<SubCli>,
    pub port_query: Option<PortQuery>,
    pub asic_query: Option<AsicQuery>,

    /// Commands that take an interface down; `{interface}` is substituted.
    pub disable_commands: Vec<String>,

    /// Commands that bring it back up.
    pub enable_commands: Vec<String>,
}

impl DeviceProfile {
    /// Create an empty profile.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt_patterns: vec![],
            failed_when_contains: vec![],
            sub_cli: None,
            port_query: None,
            asic_query: None,
            disable_commands: vec![],
            enable_commands: vec![],
        }
    }

    /// Add a management-CLI prompt regex.
    pub fn with_prompt(mut self, pattern: impl Into<String>) -> Self {
        self.prompt_patterns.push(pattern.into());
        self
    }

    /// Add a failure pattern.
    pub fn with_failure_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.failed_when_contains.push(pattern.into());
        self
    }

    pub fn with_sub_cli(mut self, sub_cli: SubCli) -> Self {
        self.sub_cli = Some(sub_cli);
        self
    }

    pub fn with_port_query(mut self, query: PortQuery) -> Self {
        self.port_query = Some(query);
        self
    }

    pub fn with_asic_query(mut self, query: AsicQuery) -> Self {
        self.asic_query = Some(query);
        self
    }

    /// Set the port toggle command sequences.
    pub fn with_toggle_commands<S: Into<String>>(
        mut self,
        disable: impl IntoIterator<Item = S>,
        enable: impl IntoIterator<Item = S>,
    ) -> Self {
        self.disable_commands = disable.into_iter().map(Into::into).collect();
        self.enable_commands = enable.into_iter().map(Into::into).collect();
        self
    }

    /// Shell configuration recognizing both the management and sub-CLI prompts.
    pub fn shell_config(&self) -> ShellConfig {
        let config = ShellConfig::default().with_prompts(self.prompt_patterns.iter().cloned());
        match &self.sub_cli {
            Some(sub_cli) => config.with_prompt(sub_cli.prompt.clone()),
            None => config,
        }
    }

    /// First failure pattern contained in `output`.
    pub fn detect_failure(&self, output: &str) -> Option<&str> {
        self.failed_when_contains
            .iter()
            .find(|pattern| output.contains(pattern.as_str()))
            .map(String::as_str)
    }
}
