//! Extreme SLX-OS switches.
//!
//! Physical-layer diagnostics (eye scan, DSC) are only reachable from the
//! Broadcom diagnostic shell, entered through the Linux shell underneath
//! SLX-OS.
//!
//! # Prompt Examples
//!
//! ```text
//! SLX#                      # exec mode
//! SLX(config)#              # configuration mode
//! SLX(conf-if-eth-0/1)#     # interface configuration
//! [admin@SLX]#              # start-shell (prompt-like fallback)
//! BCM.0>                    # bcmsh
//! ```

use crate::profile::{AsicQuery, DeviceProfile, PortQuery, SubCli};

/// Profile name for SLX-OS.
pub const PROFILE_NAME: &str = "slx";

/// Prompt of the Broadcom diagnostic shell.
pub const BCM_PROMPT: &str = r"BCM\.\d+>\s*$";

/// Create the SLX-OS profile.
pub fn profile() -> DeviceProfile {
    DeviceProfile::new(PROFILE_NAME)
        .with_prompt(r"(?m)^[\w.-]{1,63}(?:\([\w./-]+\))?#\s*$")
        .with_failure_pattern("% Error")
        .with_failure_pattern("Invalid input")
        .with_failure_pattern("syntax error")
        .with_failure_pattern("Unknown command")
        .with_sub_cli(SubCli {
            enter: vec!["start-shell".to_string(), "bcmsh".to_string()],
            exit: vec!["exit".to_string(), "exit".to_string()],
            prompt: BCM_PROMPT.to_string(),
        })
        .with_port_query(PortQuery {
            command: "show interface ethernet {interface} | include ifIndex".to_string(),
            pattern: r"(?i)ifindex\s*(?:is|:|=)?\s*(?P<port>\d+)".to_string(),
        })
        .with_asic_query(AsicQuery {
            command: "ps".to_string(),
            pattern: r"(?m)^\s*(?P<asic>(?:xe|ce|cd|ge)\d+)\(\s*{port}\)".to_string(),
        })
        .with_toggle_commands(
            [
                "configure terminal",
                "interface ethernet {interface}",
                "shutdown",
                "end",
            ],
            [
                "configure terminal",
                "interface ethernet {interface}",
                "no shutdown",
                "end",
            ],
        )
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::*;
    use crate::channel::PromptMatcher;

    #[test]
    fn test_management_prompts() {
        let matcher = PromptMatcher::new(&profile().prompt_patterns).unwrap();
        assert!(matcher.is_prompt_line("SLX#"));
        assert!(matcher.is_prompt_line("SLX(config)# "));
        assert!(matcher.is_prompt_line("SLX(conf-if-eth-0/1)#"));
        assert!(!matcher.is_prompt_line("[admin@SLX]#"));
        assert!(!matcher.is_prompt_line("BCM.0>"));
    }

    #[test]
    fn test_shell_config_includes_sub_cli_prompt() {
        let config = profile().shell_config();
        let matcher = PromptMatcher::new(&config.prompt_patterns).unwrap();
        assert!(matcher.is_prompt_line("BCM.0>"));
        assert!(matcher.is_prompt_line("SLX#"));
    }

    #[test]
    fn test_asic_query_pattern() {
        let query = profile().asic_query.unwrap();
        let pattern = Regex::new(&query.pattern.replace("{port}", "17")).unwrap();
        let output = "       ena/    speed/ link\n  xe16( 17)  up     4  100G  FD\n  \
                      xe17( 18)  down   4  100G  FD\n";
        assert_eq!(&pattern.captures(output).unwrap()["asic"], "xe16");
    }

    #[test]
    fn test_port_query_pattern() {
        let query = profile().port_query.unwrap();
        let pattern = Regex::new(&query.pattern).unwrap();
        let output = "Hardware is Ethernet, address is 609c.9f5d.4a01\n    ifIndex is 201334784\n";
        assert_eq!(&pattern.captures(output).unwrap()["port"], "201334784");
    }
}
