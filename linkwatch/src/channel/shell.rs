//! Interactive shell driven over a tunnel's PTY channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use super::buffer::PatternBuffer;
use super::patterns::{IdlePolicy, PromptDetection, PromptMatcher};
use crate::error::ShellError;
use crate::transport::{ShellChannel, TunnelConnection};

/// Shell shared between scan loops. The lock makes it single-consumer.
pub type SharedShell = Arc<tokio::sync::Mutex<ShellSession>>;

/// Configuration for a [`ShellSession`].
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Prompt regexes, combined into one alternation.
    pub prompt_patterns: Vec<String>,

    /// How many bytes from the end of the buffer are searched for a prompt.
    pub search_depth: usize,

    /// Upper bound for one prompt wait.
    pub timeout: Duration,

    /// How long a single read waits before counting as an empty poll.
    pub poll_interval: Duration,

    /// Inactivity fallback.
    pub idle: IdlePolicy,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            prompt_patterns: Vec::new(),
            search_depth: 1000,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            idle: IdlePolicy::default(),
        }
    }
}

impl ShellConfig {
    /// Add a prompt regex.
    pub fn with_prompt(mut self, pattern: impl Into<String>) -> Self {
        self.prompt_patterns.push(pattern.into());
        self
    }

    /// Add several prompt regexes.
    pub fn with_prompts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prompt_patterns
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Set the prompt wait timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Interactive PTY session on the target of a [`TunnelConnection`].
///
/// Output has no framing, so the end of a command is recognized by the
/// tiered [`PromptMatcher`]. Returned text is best effort: with the
/// fallback tiers a slow device can cut a reply short.
pub struct ShellSession {
    tunnel: Arc<TunnelConnection>,
    config: ShellConfig,
    matcher: PromptMatcher,
    buffer: PatternBuffer,
    channel: Option<Box<dyn ShellChannel>>,
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("target", &self.tunnel.label())
            .field("open", &self.is_open())
            .field("buffer", &self.buffer)
            .finish()
    }
}

enum ReadOutcome {
    Prompt(PromptDetection),
    Timeout,
    Closed,
}

impl ShellSession {
    /// Create a closed session; fails only on an invalid prompt pattern.
    pub fn new(tunnel: Arc<TunnelConnection>, config: ShellConfig) -> Result<Self, ShellError> {
        let matcher = PromptMatcher::new(&config.prompt_patterns)?.with_idle_policy(config.idle);
        Ok(Self {
            tunnel,
            buffer: PatternBuffer::new(config.search_depth),
            matcher,
            config,
            channel: None,
        })
    }

    /// Wrap the session for sharing between scan loops.
    pub fn shared(self) -> SharedShell {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// The tunnel this shell runs on.
    pub fn tunnel(&self) -> &Arc<TunnelConnection> {
        &self.tunnel
    }

    /// The combined prompt matcher.
    pub fn matcher(&self) -> &PromptMatcher {
        &self.matcher
    }

    /// Whether a channel is open.
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Change the prompt wait timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    /// Open the PTY and discard the banner and first prompt.
    ///
    /// Returns `false` if the tunnel is down or the channel cannot be
    /// opened. Not seeing a prompt is not a failure.
    pub async fn open(&mut self) -> bool {
        if self.is_open() {
            return true;
        }

        if !self.tunnel.is_connected() {
            warn!("Cannot open shell on {}: tunnel not connected", self.tunnel.label());
            return false;
        }

        let channel = match self.tunnel.open_shell().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open shell on {}: {}", self.tunnel.label(), e);
                return false;
            }
        };
        self.channel = Some(channel);
        self.buffer.clear();

        let timeout = self.config.timeout;
        match self.read_until_prompt(timeout).await {
            Ok(detection) => debug!("Initial prompt detected ({:?})", detection),
            Err(ShellError::Closed) => return false,
            Err(e) => debug!("No initial prompt on {}: {}", self.tunnel.label(), e),
        }
        self.buffer.clear();

        info!("Shell opened on {}", self.tunnel.label());
        true
    }

    /// Send one command and return its cleaned output.
    ///
    /// With `wait_for_prompt` the output is read until a prompt is
    /// detected; otherwise whatever arrives within one poll interval is
    /// returned.
    pub async fn send(&mut self, command: &str, wait_for_prompt: bool) -> Result<String, ShellError> {
        self.clear_buffer();
        self.write_line(command).await?;

        let detection = if wait_for_prompt {
            Some(self.read_until_prompt(self.config.timeout).await?)
        } else {
            self.read_for(self.config.poll_interval).await?;
            None
        };

        let raw = self.buffer.as_str_lossy().into_owned();
        let raw = match detection {
            // The line that ended the read is a prompt the regex missed.
            Some(PromptDetection::PromptLike) => strip_last_line(&raw),
            _ => raw.as_str(),
        };

        Ok(clean_output(raw, command, &self.matcher))
    }

    /// Discard everything accumulated so far.
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Close the channel. The tunnel stays up.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
            debug!("Shell on {} closed", self.tunnel.label());
        }
        self.buffer.clear();
    }

    async fn write_line(&mut self, command: &str) -> Result<(), ShellError> {
        let channel = self.channel.as_mut().ok_or(ShellError::NotOpen)?;
        debug!("shell send: {:?}", command);
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        channel.write(&line).await
    }

    async fn read_until_prompt(&mut self, timeout: Duration) -> Result<PromptDetection, ShellError> {
        let outcome = {
            let channel = self.channel.as_mut().ok_or(ShellError::NotOpen)?;
            let deadline = Instant::now() + timeout;
            let mut last_data = Instant::now();
            let mut idle_polls = 0u32;

            loop {
                match tokio::time::timeout(self.config.poll_interval, channel.read()).await {
                    Ok(Ok(Some(chunk))) => {
                        self.buffer.extend(&chunk);
                        last_data = Instant::now();
                        idle_polls = 0;
                    }
                    Ok(Ok(None)) => break ReadOutcome::Closed,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => idle_polls += 1,
                }

                if let Some(detection) =
                    self.matcher
                        .detect(&self.buffer, idle_polls, last_data.elapsed())
                {
                    break ReadOutcome::Prompt(detection);
                }

                if Instant::now() >= deadline {
                    break ReadOutcome::Timeout;
                }
            }
        };

        match outcome {
            ReadOutcome::Prompt(detection) => Ok(detection),
            ReadOutcome::Timeout => Err(ShellError::PromptTimeout(timeout)),
            ReadOutcome::Closed => {
                self.hang_up();
                Err(ShellError::Closed)
            }
        }
    }

    async fn read_for(&mut self, window: Duration) -> Result<(), ShellError> {
        let closed = {
            let channel = self.channel.as_mut().ok_or(ShellError::NotOpen)?;
            let until = Instant::now() + window;
            loop {
                match tokio::time::timeout_at(until, channel.read()).await {
                    Ok(Ok(Some(chunk))) => self.buffer.extend(&chunk),
                    Ok(Ok(None)) => break true,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => break false,
                }
            }
        };

        if closed {
            self.hang_up();
            return Err(ShellError::Closed);
        }
        Ok(())
    }

    fn hang_up(&mut self) {
        warn!("Shell on {} closed by remote", self.tunnel.label());
        self.channel = None;
    }
}

/// Drop the last non-blank line.
fn strip_last_line(raw: &str) -> &str {
    let trimmed = raw.trim_end();
    match trimmed.rfind('\n') {
        Some(i) => &trimmed[..i],
        None => "",
    }
}

/// Remove the echoed command and surrounding prompt and blank lines.
pub fn clean_output(raw: &str, command: &str, matcher: &PromptMatcher) -> String {
    let command = command.trim();
    let mut lines: Vec<&str> = raw
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect();

    if let Some(i) = lines.iter().position(|line| !line.trim().is_empty()) {
        let first = lines[i].trim();
        if !command.is_empty() && (first == command || first.ends_with(command)) {
            lines.remove(i);
        }
    }

    let is_noise = |line: &&str| line.trim().is_empty() || matcher.is_prompt_line(line);

    let start = lines
        .iter()
        .position(|line| !is_noise(line))
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|line| !is_noise(line))
        .map_or(start, |i| i + 1);

    lines[start..end.max(start)].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, ScriptedShell, connected_tunnel};

    fn slx_matcher() -> PromptMatcher {
        PromptMatcher::new(&[r"SLX[\w-]*#"]).unwrap()
    }

    async fn open_shell(shell: ScriptedShell, config: ShellConfig) -> ShellSession {
        let connector = Arc::new(MockConnector::new().with_shell(shell));
        let tunnel = connected_tunnel(&connector).await;
        let mut session = ShellSession::new(tunnel, config).unwrap();
        assert!(session.open().await);
        session
    }

    #[test]
    fn test_clean_output_keeps_only_data() {
        let raw = "show temp\r\nSLX-01# \r\nSLX-01# \r\nTemp: 41 C\r\n";
        assert_eq!(clean_output(raw, "show temp", &slx_matcher()), "Temp: 41 C");

        let raw = "SLX-01# show temp\r\nTemp: 41 C\r\nSLX-01# \r\nSLX-01# ";
        assert_eq!(clean_output(raw, "show temp", &slx_matcher()), "Temp: 41 C");
    }

    #[test]
    fn test_clean_output_keeps_inner_blank_lines() {
        let raw = "show int\r\nline 1\r\n\r\nline 3\r\nSLX# ";
        assert_eq!(
            clean_output(raw, "show int", &slx_matcher()),
            "line 1\n\nline 3"
        );
    }

    #[test]
    fn test_clean_output_nothing_but_noise() {
        let raw = "show int\r\nSLX# \r\n\r\n";
        assert_eq!(clean_output(raw, "show int", &slx_matcher()), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_discards_banner() {
        let shell = ScriptedShell::new()
            .banner("Welcome to SLX-OS\r\nSLX-01# ")
            .on("show temp", &["show temp\r\nTemp: 41 C\r\nSLX-01# "]);
        let config = ShellConfig::default().with_prompt(r"SLX[\w-]*#");
        let mut session = open_shell(shell, config).await;

        let output = session.send("show temp", true).await.unwrap();
        assert_eq!(output, "Temp: 41 C");
        assert!(!output.contains("Welcome"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_strips_echo_and_prompts() {
        let shell = ScriptedShell::new().on(
            "show temp",
            &["show temp\r\n", "SLX-01# \r\nSLX-01# \r\nTemp: 41 C\r\nSLX-01# "],
        );
        let config = ShellConfig::default().with_prompt(r"SLX[\w-]*#");
        let mut session = open_shell(shell, config).await;

        assert_eq!(session.send("show temp", true).await.unwrap(), "Temp: 41 C");

        session.close().await;
        assert!(!session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_like_fallback_returns() {
        let shell =
            ScriptedShell::new().on("uptime", &["uptime\r\n 10:00 up 3 days\r\nroot@sut-7:~# "]);
        let config = ShellConfig::default()
            .with_prompt(r"SLX#")
            .with_timeout(Duration::from_secs(5));
        let mut session = open_shell(shell, config).await;

        let started = Instant::now();
        let output = session.send("uptime", true).await.unwrap();
        assert_eq!(output, " 10:00 up 3 days");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_fallback_returns_accumulated() {
        let shell =
            ScriptedShell::new().on("phy diag bcm0 dsc", &["lane 0 eye 12\r\nlane 1 eye 14"]);
        let config = ShellConfig::default().with_prompt(r"BCM\.\d+>");
        let mut session = open_shell(shell, config).await;

        let started = Instant::now();
        let output = session.send("phy diag bcm0 dsc", true).await.unwrap();
        assert_eq!(output, "lane 0 eye 12\nlane 1 eye 14");
        // More than 3 empty polls of 500ms and more than 2s of silence.
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_timeout() {
        let shell = ScriptedShell::new().on("show tech", &["partial"]);
        let config = ShellConfig::default()
            .with_prompt(r"SLX#")
            .with_timeout(Duration::from_secs(1));
        let mut session = open_shell(shell, config).await;

        let err = session.send("show tech", true).await.unwrap_err();
        assert!(matches!(err, ShellError::PromptTimeout(_)));
        assert!(session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_waiting() {
        let shell = ScriptedShell::new().on("bcmsh", &["bcmsh\r\nEntering BCM shell\r\n"]);
        let mut session = open_shell(shell, ShellConfig::default().with_prompt(r"SLX#")).await;

        let output = session.send("bcmsh", false).await.unwrap();
        assert_eq!(output, "Entering BCM shell");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_hangup_closes_session() {
        let shell = ScriptedShell::new()
            .banner("SLX# ")
            .on("exit", &["exit\r\n"])
            .hang_up();
        let mut session = open_shell(shell, ShellConfig::default().with_prompt(r"SLX#")).await;

        let err = session.send("exit", true).await.unwrap_err();
        assert!(matches!(err, ShellError::Closed));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let connector = Arc::new(MockConnector::new());
        let tunnel = connected_tunnel(&connector).await;
        let mut session = ShellSession::new(tunnel, ShellConfig::default()).unwrap();

        let err = session.send("show temp", true).await.unwrap_err();
        assert!(matches!(err, ShellError::NotOpen));
    }

    #[tokio::test]
    async fn test_open_requires_connected_tunnel() {
        let connector = Arc::new(MockConnector::new().with_shell(ScriptedShell::new()));
        let tunnel = Arc::new(TunnelConnection::with_connector(
            crate::testing::chain_of(1),
            Default::default(),
            connector.clone(),
        ));
        let mut session = ShellSession::new(tunnel, ShellConfig::default()).unwrap();
        assert!(!session.open().await);
    }
}
