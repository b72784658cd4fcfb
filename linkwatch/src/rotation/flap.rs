//! Shared link-flap state and the parser that feeds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use log::{debug, info};
use regex::Regex;
use serde_json::{Value, json};

use crate::error::ParseError;
use crate::sampling::Parser;

const NO_FLAP: i64 = i64::MIN;

/// Process-wide "a link is flapping" signal.
///
/// One designated worker writes it (through a [`LinkEventParser`]); every
/// [`LogStream`](super::LogStream) reads it when deciding between rotation
/// and truncation. The flag and the last flap time live in one atomic, so
/// a flap recorded while a stream ends the cycle is never lost.
#[derive(Debug)]
pub struct FlapCoordinator {
    /// Milliseconds since the epoch of the latest flap, `NO_FLAP` outside a
    /// flap cycle.
    last_flap_ms: AtomicI64,
    timeout: Duration,
}

impl Default for FlapCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl FlapCoordinator {
    /// Create a coordinator whose flap cycle ends `timeout` after the last flap.
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_flap_ms: AtomicI64::new(NO_FLAP),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a link-down event now.
    pub fn record_flap(&self) {
        self.record_flap_at(Utc::now());
    }

    /// Record a link-down event at `at`. An older event never replaces a
    /// newer one.
    pub fn record_flap_at(&self, at: DateTime<Utc>) {
        let previous = self
            .last_flap_ms
            .fetch_max(at.timestamp_millis(), Ordering::AcqRel);
        if previous == NO_FLAP {
            info!("Link flap detected, log streams switch to rotation");
        }
    }

    pub fn flaps_detected(&self) -> bool {
        self.last_flap_ms.load(Ordering::Acquire) != NO_FLAP
    }

    pub fn last_flap_time(&self) -> Option<DateTime<Utc>> {
        match self.last_flap_ms.load(Ordering::Acquire) {
            NO_FLAP => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// In a flap cycle whose last flap is more than `timeout` before `now`.
    pub fn cycle_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired(self.last_flap_ms.load(Ordering::Acquire), now)
    }

    fn expired(&self, last_ms: i64, now: DateTime<Utc>) -> bool {
        if last_ms == NO_FLAP {
            return false;
        }
        let Some(last) = DateTime::from_timestamp_millis(last_ms) else {
            return false;
        };
        (now - last)
            .to_std()
            .is_ok_and(|elapsed| elapsed > self.timeout)
    }

    /// End the flap cycle if it has expired at `now`.
    ///
    /// Returns whether this call ended it. A flap recorded after the expiry
    /// was observed keeps the cycle open.
    pub fn end_cycle_if_expired(&self, now: DateTime<Utc>) -> bool {
        let last = self.last_flap_ms.load(Ordering::Acquire);
        self.expired(last, now)
            && self
                .last_flap_ms
                .compare_exchange(last, NO_FLAP, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Leave the flap cycle unconditionally.
    pub fn end_cycle(&self) {
        self.last_flap_ms.store(NO_FLAP, Ordering::Release);
    }
}

/// Default link event shapes: SLX RASlog and Linux kernel messages.
pub const DEFAULT_LINK_PATTERNS: &[&str] = &[
    r"(?i)\binterface\s+(?P<interface>[a-z]+\s*\d+(?:/\d+)+(?::\d+)?)\s+is\s+(?:link\s+)?(?P<state>up|down)\b",
    r"(?i)\b(?P<interface>[a-z][\w.-]*\d+):?\s+(?:nic\s+)?link\s+(?:is\s+)?(?P<state>up|down)\b",
];

const SEEN_LIMIT: usize = 4096;

/// Parser for the designated flap-detecting worker.
///
/// Finds link up/down lines in device logs and records every down event it
/// has not seen before on the [`FlapCoordinator`]. Logs are re-read on
/// every poll, so events are remembered by their full line, separately for
/// each source the parser is shared between.
pub struct LinkEventParser {
    patterns: Vec<Regex>,
    coordinator: Arc<FlapCoordinator>,
    include_history: bool,
    seen: Mutex<HashMap<String, Seen>>,
}

#[derive(Default)]
struct Seen {
    lines: IndexSet<String>,
    primed: bool,
}

impl LinkEventParser {
    /// Parser with the default patterns.
    ///
    /// The first parse for each source only learns the lines already in
    /// its log, so old events do not start a flap cycle.
    pub fn new(coordinator: Arc<FlapCoordinator>) -> Self {
        let patterns = DEFAULT_LINK_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            patterns,
            coordinator,
            include_history: false,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Parser with custom patterns; each needs `interface` and `state` groups.
    pub fn with_patterns<S: AsRef<str>>(
        coordinator: Arc<FlapCoordinator>,
        patterns: &[S],
    ) -> Result<Self, regex::Error> {
        let mut parser = Self::new(coordinator);
        parser.patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(parser)
    }

    /// Treat events already in the log on the first parse as new.
    pub fn include_history(mut self) -> Self {
        self.include_history = true;
        self
    }

    fn event(&self, line: &str) -> Option<(String, String)> {
        self.patterns.iter().find_map(|pattern| {
            let caps = pattern.captures(line)?;
            let interface = caps.name("interface")?.as_str().to_string();
            let state = caps.name("state")?.as_str().to_ascii_lowercase();
            Some((interface, state))
        })
    }
}

impl Parser for LinkEventParser {
    fn parse(&self, raw: &str) -> Result<Value, ParseError> {
        self.parse_from("", raw)
    }

    fn parse_from(&self, source_id: &str, raw: &str) -> Result<Value, ParseError> {
        let mut sources = self
            .seen
            .lock()
            .map_err(|_| ParseError::new("link event state poisoned"))?;
        let seen = sources.entry(source_id.to_string()).or_insert_with(|| Seen {
            primed: self.include_history,
            ..Seen::default()
        });
        let recording = seen.primed;

        let mut events = Vec::new();
        let mut new_downs = 0usize;

        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((interface, state)) = self.event(line) else {
                continue;
            };

            let fresh = seen.lines.insert(line.to_string());
            if seen.lines.len() > SEEN_LIMIT {
                seen.lines.shift_remove_index(0);
            }

            if fresh && recording && state == "down" {
                debug!("New link down event on {}: {}", interface, line);
                new_downs += 1;
            }

            events.push(json!({
                "interface": interface,
                "state": state,
                "new": fresh && recording,
            }));
        }
        seen.primed = true;
        drop(sources);

        if new_downs > 0 {
            self.coordinator.record_flap();
        }

        Ok(json!({
            "events": events,
            "new_down_events": new_downs,
            "flapping": self.coordinator.flaps_detected(),
        }))
    }
}
