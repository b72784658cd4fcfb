//! Size-bounded log streams with flap-aware rotation.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, error, info};

use super::flap::FlapCoordinator;
use crate::error::RotationError;

/// Log stream shared by a worker and whoever else writes to it.
pub type SharedLogStream = Arc<Mutex<LogStream>>;

/// Append `line` to a shared stream on the blocking thread pool.
pub async fn append_line(log: &SharedLogStream, line: String) -> Result<(), RotationError> {
    let log = log.clone();
    tokio::task::spawn_blocking(move || {
        log.lock()
            .unwrap_or_else(|e| e.into_inner())
            .write_line(&line)
    })
    .await
    .map_err(|e| RotationError::Writer(e.to_string()))?
}

/// Rotation bookkeeping for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationState {
    pub rotated_since_last_flap: bool,
    /// Never decreases, so a rotated file is never reused.
    pub rotation_counter: u32,
}

/// Every stream's [`RotationState`], keyed by the stream's base path.
///
/// Outlives the streams themselves: a stream re-created for the same path
/// continues from the stored counter.
#[derive(Debug, Default)]
pub struct RotationRegistry {
    streams: Mutex<HashMap<PathBuf, RotationState>>,
}

impl RotationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<PathBuf, RotationState>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state for `key` (default if never rotated).
    pub fn state(&self, key: &Path) -> RotationState {
        self.streams().get(key).copied().unwrap_or_default()
    }

    /// Bump the counter for `key` and return the new value.
    fn next_counter(&self, key: &Path) -> u32 {
        let mut streams = self.streams();
        let state = streams.entry(key.to_path_buf()).or_default();
        state.rotation_counter += 1;
        state.rotation_counter
    }

    fn mark_rotated(&self, key: &Path) {
        self.streams()
            .entry(key.to_path_buf())
            .or_default()
            .rotated_since_last_flap = true;
    }

    /// Reset every stream's `rotated_since_last_flap`. Counters are kept.
    pub fn clear_flags(&self) {
        for state in self.streams().values_mut() {
            state.rotated_since_last_flap = false;
        }
    }
}

/// Per-stream options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Size above which the rotation policy runs.
    pub max_size_kb: u64,
    /// Line written at the top of every fresh file (CSV streams).
    pub header: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_size_kb: 10 * 1024,
            header: None,
        }
    }
}

impl StreamOptions {
    pub fn with_max_size_kb(mut self, max_size_kb: u64) -> Self {
        self.max_size_kb = max_size_kb;
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }
}

/// Append-only log file for one metric.
///
/// Writes go to `{dir}/{metric}.{ext}`. Before each write the size is
/// checked; once it exceeds `max_size_kb`, the stream either rotates to
/// `{metric}_{n}.{ext}` (while links are flapping, so evidence is kept)
/// or truncates the current file in place.
///
/// The flap cycle only ends during such a check, so a stream that stays
/// small keeps its cycle open past the timeout.
#[derive(Debug)]
pub struct LogStream {
    dir: PathBuf,
    metric: String,
    ext: String,
    base_path: PathBuf,
    options: StreamOptions,
    flap: Arc<FlapCoordinator>,
    registry: Arc<RotationRegistry>,
    path: PathBuf,
    file: File,
    size: u64,
}

impl LogStream {
    /// Open (or continue) the stream for `metric`.
    ///
    /// If the stream was rotated during the current flap cycle, writing
    /// resumes in the newest numbered file.
    pub fn open(
        dir: impl AsRef<Path>,
        metric: &str,
        ext: &str,
        options: StreamOptions,
        flap: Arc<FlapCoordinator>,
        registry: Arc<RotationRegistry>,
    ) -> Result<Self, RotationError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| RotationError::FileIo {
            path: dir.clone(),
            source,
        })?;

        let base_path = dir.join(format!("{}.{}", metric, ext));
        let state = registry.state(&base_path);
        let path = if state.rotated_since_last_flap {
            numbered_path(&dir, metric, ext, state.rotation_counter)
        } else {
            base_path.clone()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| RotationError::FileIo {
                path: path.clone(),
                source,
            })?;
        let size = file
            .metadata()
            .map_err(|source| RotationError::FileIo {
                path: path.clone(),
                source,
            })?
            .len();

        let mut stream = Self {
            dir,
            metric: metric.to_string(),
            ext: ext.to_string(),
            base_path,
            options,
            flap,
            registry,
            path,
            file,
            size,
        };
        if stream.size == 0 {
            stream.write_header()?;
        }
        debug!("Log stream {} opened ({} bytes)", stream.path.display(), stream.size);
        Ok(stream)
    }

    /// Wrap the stream for sharing.
    pub fn shared(self) -> SharedLogStream {
        Arc::new(Mutex::new(self))
    }

    /// The file currently written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The unnumbered path; also the key in the [`RotationRegistry`].
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Bytes in the current file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// This stream's rotation bookkeeping.
    pub fn rotation_state(&self) -> RotationState {
        self.registry.state(&self.base_path)
    }

    /// Append one line, running the rotation policy first if needed.
    pub fn write_line(&mut self, line: &str) -> Result<(), RotationError> {
        self.write_line_at(line, Utc::now())
    }

    /// [`write_line`](Self::write_line) with an explicit clock.
    pub fn write_line_at(&mut self, line: &str, now: DateTime<Utc>) -> Result<(), RotationError> {
        if self.size > self.options.max_size_kb * 1024 {
            self.enforce_limit(now)?;
        }
        self.append(line)
    }

    fn enforce_limit(&mut self, now: DateTime<Utc>) -> Result<(), RotationError> {
        if self.flap.end_cycle_if_expired(now) {
            info!(
                "No link flaps for {:?}, ending flap cycle",
                self.flap.timeout()
            );
            self.registry.clear_flags();
        }

        if self.flap.flaps_detected() {
            self.rotate();
            Ok(())
        } else {
            self.clear_in_place()
        }
    }

    fn rotate(&mut self) {
        let counter = self.registry.next_counter(&self.base_path);
        let next = numbered_path(&self.dir, &self.metric, &self.ext, counter);

        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&next)
        {
            Ok(file) => file,
            Err(e) => {
                error!(
                    "Cannot rotate {} to {}: {}; still writing to the old file",
                    self.path.display(),
                    next.display(),
                    e
                );
                return;
            }
        };

        info!("Rotated {} -> {}", self.path.display(), next.display());
        self.file = file;
        self.path = next;
        self.size = 0;
        self.registry.mark_rotated(&self.base_path);

        if let Err(e) = self.write_header() {
            error!("{}", e);
        }
    }

    fn clear_in_place(&mut self) -> Result<(), RotationError> {
        debug!("Clearing {} in place", self.path.display());
        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .map_err(|source| RotationError::FileIo {
                path: self.path.clone(),
                source,
            })?;
        self.size = 0;
        self.write_header()
    }

    fn write_header(&mut self) -> Result<(), RotationError> {
        match self.options.header.clone() {
            Some(header) => self.append(&header),
            None => Ok(()),
        }
    }

    fn append(&mut self, line: &str) -> Result<(), RotationError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        self.file
            .write_all(&buf)
            .map_err(|source| RotationError::FileIo {
                path: self.path.clone(),
                source,
            })?;
        self.size += buf.len() as u64;
        Ok(())
    }
}

fn numbered_path(dir: &Path, metric: &str, ext: &str, counter: u32) -> PathBuf {
    dir.join(format!("{}_{}.{}", metric, counter, ext))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn kb_line() -> String {
        "x".repeat(1100)
    }

    struct Fixture {
        dir: TempDir,
        flap: Arc<FlapCoordinator>,
        registry: Arc<RotationRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                flap: Arc::new(FlapCoordinator::new(Duration::from_secs(120))),
                registry: Arc::new(RotationRegistry::new()),
            }
        }

        fn stream(&self, options: StreamOptions) -> LogStream {
            LogStream::open(
                self.dir.path(),
                "metric",
                "log",
                options.with_max_size_kb(1),
                self.flap.clone(),
                self.registry.clone(),
            )
            .unwrap()
        }

        fn file(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    #[test]
    fn test_quiet_stream_clears_in_place() {
        let fx = Fixture::new();
        let mut stream = fx.stream(StreamOptions::default());

        stream.write_line_at(&kb_line(), at(0)).unwrap();
        stream.write_line_at("after", at(1)).unwrap();

        assert_eq!(stream.path(), fx.file("metric.log"));
        assert_eq!(fs::read_to_string(fx.file("metric.log")).unwrap(), "after\n");
        assert!(!fx.file("metric_1.log").exists());
    }

    #[test]
    fn test_counter_survives_flap_cycles() {
        let fx = Fixture::new();
        let mut stream = fx.stream(StreamOptions::default());

        // Flap at t=0, size exceeded at t=10: rotate.
        fx.flap.record_flap_at(at(0));
        stream.write_line_at(&kb_line(), at(10)).unwrap();
        stream.write_line_at(&kb_line(), at(10)).unwrap();
        assert_eq!(stream.path(), fx.file("metric_1.log"));
        assert_eq!(
            stream.rotation_state(),
            RotationState {
                rotated_since_last_flap: true,
                rotation_counter: 1
            }
        );

        // t=140 with a 120s timeout: cycle ends, file cleared in place.
        stream.write_line_at(&kb_line(), at(140)).unwrap();
        assert!(!fx.flap.flaps_detected());
        assert_eq!(stream.path(), fx.file("metric_1.log"));
        assert_eq!(stream.rotation_state().rotation_counter, 1);
        assert!(!stream.rotation_state().rotated_since_last_flap);
        assert_eq!(stream.size(), 1101);

        // New flap at t=200, size exceeded at t=210: metric_2, never metric_1.
        fx.flap.record_flap_at(at(200));
        stream.write_line_at("evidence", at(210)).unwrap();
        assert_eq!(stream.path(), fx.file("metric_2.log"));
        assert_eq!(stream.rotation_state().rotation_counter, 2);
        assert_eq!(
            fs::read_to_string(fx.file("metric_2.log")).unwrap(),
            "evidence\n"
        );
        assert_eq!(fs::read_to_string(fx.file("metric.log")).unwrap().len(), 1101);
    }

    #[test]
    fn test_header_reemitted() {
        let fx = Fixture::new();
        let mut stream = fx.stream(StreamOptions::default().with_header("time,rx,tx"));
        stream.write_line_at(&kb_line(), at(0)).unwrap();

        fx.flap.record_flap_at(at(0));
        stream.write_line_at("1,2,3", at(1)).unwrap();
        assert_eq!(
            fs::read_to_string(fx.file("metric_1.log")).unwrap(),
            "time,rx,tx\n1,2,3\n"
        );

        fx.flap.end_cycle();
        stream.write_line_at(&kb_line(), at(2)).unwrap();
        stream.write_line_at("4,5,6", at(3)).unwrap();
        assert_eq!(
            fs::read_to_string(fx.file("metric_1.log")).unwrap(),
            "time,rx,tx\n4,5,6\n"
        );
    }

    #[test]
    fn test_reopen_resumes_rotated_file() {
        let fx = Fixture::new();
        let mut stream = fx.stream(StreamOptions::default());
        fx.flap.record_flap_at(at(0));
        stream.write_line_at(&kb_line(), at(1)).unwrap();
        stream.write_line_at("one", at(2)).unwrap();
        drop(stream);

        let mut stream = fx.stream(StreamOptions::default());
        assert_eq!(stream.path(), fx.file("metric_1.log"));
        stream.write_line_at("two", at(3)).unwrap();
        assert_eq!(
            fs::read_to_string(fx.file("metric_1.log")).unwrap(),
            "one\ntwo\n"
        );
    }

    #[test]
    fn test_cycle_end_clears_every_stream_flag() {
        let fx = Fixture::new();
        let mut a = fx.stream(StreamOptions::default());
        let mut b = LogStream::open(
            fx.dir.path(),
            "other",
            "csv",
            StreamOptions::default().with_max_size_kb(1),
            fx.flap.clone(),
            fx.registry.clone(),
        )
        .unwrap();

        fx.flap.record_flap_at(at(0));
        for stream in [&mut a, &mut b] {
            stream.write_line_at(&kb_line(), at(1)).unwrap();
            stream.write_line_at("x", at(1)).unwrap();
            assert!(stream.rotation_state().rotated_since_last_flap);
        }

        // Only `a` grows past the limit after the timeout.
        a.write_line_at(&kb_line(), at(150)).unwrap();
        a.write_line_at("y", at(200)).unwrap();
        assert!(!fx.flap.flaps_detected());
        assert!(!b.rotation_state().rotated_since_last_flap);
        assert_eq!(b.rotation_state().rotation_counter, 1);
    }

    #[test]
    fn test_poisoned_registry_keeps_counting() {
        let fx = Fixture::new();
        let mut stream = fx.stream(StreamOptions::default());
        fx.flap.record_flap_at(at(0));
        stream.write_line_at(&kb_line(), at(1)).unwrap();
        stream.write_line_at("first", at(2)).unwrap();
        assert_eq!(stream.path(), fx.file("metric_1.log"));

        let registry = fx.registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = registry.streams.lock().unwrap();
            panic!("poison the registry");
        })
        .join();
        assert!(fx.registry.streams.is_poisoned());

        stream.write_line_at(&kb_line(), at(3)).unwrap();
        stream.write_line_at("second", at(4)).unwrap();
        assert_eq!(stream.path(), fx.file("metric_2.log"));
        assert!(
            fs::read_to_string(fx.file("metric_1.log"))
                .unwrap()
                .starts_with("first\n")
        );
        assert_eq!(
            fs::read_to_string(fx.file("metric_2.log")).unwrap(),
            "second\n"
        );
    }

    #[tokio::test]
    async fn test_append_line_on_shared_stream() {
        let fx = Fixture::new();
        let shared = fx.stream(StreamOptions::default()).shared();

        append_line(&shared, "rx=1".to_string()).await.unwrap();
        append_line(&shared, "rx=2".to_string()).await.unwrap();

        assert_eq!(shared.lock().unwrap().size(), 10);
        assert_eq!(fs::read_to_string(fx.file("metric.log")).unwrap(), "rx=1\nrx=2\n");
    }
}
