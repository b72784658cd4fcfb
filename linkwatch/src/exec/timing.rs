//! Parsing of the `time` wrapper's report on stderr.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Matches `real 0.52` (POSIX `-p`) and `real\t1m0.520s` (bash builtin).
static REAL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^real\s+(?:(\d+)m)?(\d+(?:\.\d+)?)s?\s*$").expect("valid regex")
});

static REPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:real|user|sys)\s+(?:\d+m)?\d+(?:\.\d+)?s?\s*$").expect("valid regex")
});

/// Elapsed wall time from a `time` report, if one is present.
pub fn parse_real_time(stderr: &str) -> Option<Duration> {
    let caps = REAL_LINE.captures_iter(stderr).last()?;
    let minutes: f64 = caps
        .get(1)
        .map_or(Ok(0.0), |m| m.as_str().parse())
        .ok()?;
    let seconds: f64 = caps.get(2)?.as_str().parse().ok()?;
    Duration::try_from_secs_f64(minutes * 60.0 + seconds).ok()
}

/// Stderr without the `real/user/sys` report lines.
pub fn strip_time_report(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !REPORT_LINE.is_match(line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}
