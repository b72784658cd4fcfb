//! Prompt detection over an unframed byte stream.
//!
//! Real devices print banners, pagers and vendor prompts that no single
//! regex describes, so detection is tiered:
//!
//! 1. any configured prompt regex matches the buffer tail
//! 2. the last non-blank line ends in a prompt-like character (`$ # > :`)
//! 3. nothing has arrived for a while, so whatever accumulated is returned
//!
//! Tiers 2 and 3 are best effort. A caller that needs certainty must use a
//! prompt regex that actually matches the device.

use std::time::Duration;

use log::debug;
use regex::bytes::Regex;

use super::buffer::PatternBuffer;

/// Characters that end a typical shell or device prompt.
const PROMPT_ENDINGS: &[u8] = b"$#>:";

/// Which tier recognized the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDetection {
    /// A configured prompt regex matched.
    Pattern,
    /// The last line ends like a prompt.
    PromptLike,
    /// Output went quiet; the prompt was assumed.
    Inactivity,
}

/// Tunables for the inactivity fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    /// Quiet time required before assuming a prompt.
    pub threshold: Duration,
    /// Consecutive empty polls required before assuming a prompt.
    pub polls: u32,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(2),
            polls: 3,
        }
    }
}

/// Combined prompt matcher for one or more vendor prompt shapes.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    pattern: Regex,
    idle: IdlePolicy,
}

impl PromptMatcher {
    /// Combine `patterns` into one alternation.
    ///
    /// Patterns without an end anchor get `\s*$` appended so they only
    /// match at the end of output.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let combined = patterns
            .iter()
            .map(|p| format!("(?:{})", anchor_pattern(p.as_ref())))
            .collect::<Vec<_>>()
            .join("|");

        let combined = if combined.is_empty() {
            // Nothing configured: only the fallbacks apply.
            r"[^\s\S]".to_string()
        } else {
            combined
        };

        Ok(Self {
            pattern: Regex::new(&combined)?,
            idle: IdlePolicy::default(),
        })
    }

    /// Override the inactivity fallback.
    pub fn with_idle_policy(mut self, idle: IdlePolicy) -> Self {
        self.idle = idle;
        self
    }

    /// The combined regex.
    pub fn regex(&self) -> &Regex {
        &self.pattern
    }

    /// Check whether a single line is a prompt (used when cleaning output).
    pub fn is_prompt_line(&self, line: &str) -> bool {
        let line = line.trim_end();
        !line.is_empty() && self.pattern.is_match(line.as_bytes())
    }

    /// Run the detection tiers against the buffer.
    ///
    /// `idle_polls` is the number of consecutive polls that returned no
    /// data and `idle_for` how long ago data last arrived.
    pub fn detect(
        &self,
        buffer: &PatternBuffer,
        idle_polls: u32,
        idle_for: Duration,
    ) -> Option<PromptDetection> {
        if buffer.tail_contains(&self.pattern) {
            return Some(PromptDetection::Pattern);
        }

        if let Some(line) = buffer.last_line() {
            if line.last().is_some_and(|b| PROMPT_ENDINGS.contains(b)) {
                debug!(
                    "prompt regex missed, accepting prompt-like line {:?}",
                    String::from_utf8_lossy(line)
                );
                return Some(PromptDetection::PromptLike);
            }
        }

        if idle_polls > self.idle.polls && idle_for > self.idle.threshold {
            debug!(
                "no output for {:?} over {} polls, assuming prompt",
                idle_for, idle_polls
            );
            return Some(PromptDetection::Inactivity);
        }

        None
    }
}

/// Anchor a prompt pattern to the end of output if it is not already.
pub fn anchor_pattern(pattern: &str) -> String {
    if pattern.ends_with('$') {
        pattern.to_string()
    } else {
        format!("{}\\s*$", pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(text: &str) -> PatternBuffer {
        let mut buffer = PatternBuffer::default();
        buffer.extend(text.as_bytes());
        buffer
    }

    #[test]
    fn test_anchor_pattern() {
        assert_eq!(anchor_pattern(r"SLX#"), r"SLX#\s*$");
        assert_eq!(anchor_pattern(r"SLX#$"), r"SLX#$");
    }

    #[test]
    fn test_multiple_vendor_patterns() {
        let matcher = PromptMatcher::new(&[r"SLX[\w-]*#", r"BCM\.\d+>"]).unwrap();

        assert_eq!(
            matcher.detect(&buffer("output\r\nSLX-01# "), 0, Duration::ZERO),
            Some(PromptDetection::Pattern)
        );
        assert_eq!(
            matcher.detect(&buffer("output\r\nBCM.0> "), 0, Duration::ZERO),
            Some(PromptDetection::Pattern)
        );
    }

    #[test]
    fn test_prompt_like_fallback() {
        let matcher = PromptMatcher::new(&[r"SLX#"]).unwrap();
        assert_eq!(
            matcher.detect(&buffer("output\r\nroot@sut-7:~# \r\n"), 0, Duration::ZERO),
            Some(PromptDetection::PromptLike)
        );
    }

    #[test]
    fn test_no_detection_mid_output() {
        let matcher = PromptMatcher::new(&[r"SLX#"]).unwrap();
        assert_eq!(
            matcher.detect(&buffer("lane 0 eye height 12"), 3, Duration::from_secs(5)),
            None
        );
    }

    #[test]
    fn test_inactivity_fallback() {
        let matcher = PromptMatcher::new(&[r"SLX#"]).unwrap();
        let buf = buffer("lane 0 eye height 12");

        assert_eq!(matcher.detect(&buf, 4, Duration::from_secs(1)), None);
        assert_eq!(
            matcher.detect(&buf, 4, Duration::from_millis(2100)),
            Some(PromptDetection::Inactivity)
        );
    }

    #[test]
    fn test_empty_pattern_list_uses_fallbacks_only() {
        let matcher = PromptMatcher::new::<&str>(&[]).unwrap();
        assert!(!matcher.is_prompt_line("anything"));
        assert_eq!(
            matcher.detect(&buffer("host$ "), 0, Duration::ZERO),
            Some(PromptDetection::PromptLike)
        );
    }

    #[test]
    fn test_is_prompt_line() {
        let matcher = PromptMatcher::new(&[r"SLX[\w-]*#"]).unwrap();
        assert!(matcher.is_prompt_line("SLX-01# "));
        assert!(!matcher.is_prompt_line("Tx power: -2.1 dBm"));
        assert!(!matcher.is_prompt_line(""));
    }
}
