//! Event sources over append-only JSONL logs.
//!
//! A source exposes one producer's log as a lazy, time-ordered sequence of
//! typed events. Decode failures are a per-line skip, never a stream
//! failure; unknown kinds are dropped and counted. In follow mode the
//! source keeps polling for appended lines until no new data has arrived
//! for the configured idle period, at which point it declares itself
//! caught up so a stalled producer cannot starve bar completion.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use conflux_common::Event;

/// Errors that can occur while reading a source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

/// One producer's append-only event log.
pub trait EventSource {
    /// Pull the next decodable event, or `None` once the source is
    /// exhausted (end of file, or idle timeout in follow mode).
    fn next_event(&mut self) -> Result<Option<Event>, SourceError>;

    /// Display name for logs and summaries.
    fn name(&self) -> &str;

    /// Lines that failed to decode and were skipped.
    fn lines_skipped(&self) -> u64 {
        0
    }

    /// Structurally valid lines whose kind is outside the closed set.
    fn unknown_kind_drops(&self) -> u64 {
        0
    }
}

/// Polling parameters for live-appended logs.
#[derive(Debug, Clone, Copy)]
pub struct FollowConfig {
    /// How often to re-check the file for appended data.
    pub poll_interval: Duration,
    /// After this long with no new data the source counts as caught up.
    pub idle_timeout: Duration,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Buffered reader over one JSONL log file.
pub struct JsonlSource {
    name: String,
    reader: BufReader<File>,
    follow: Option<FollowConfig>,
    /// Partially read line awaiting its terminating newline (follow mode).
    pending: String,
    exhausted: bool,
    lines_skipped: u64,
    unknown_kind_drops: u64,
}

impl JsonlSource {
    /// Open a finite log for a single batch pass.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Self::open_inner(path.as_ref(), None)
    }

    /// Open a live-appended log; reads block (by polling) until the idle
    /// timeout elapses with no new data.
    pub fn open_follow(path: impl AsRef<Path>, follow: FollowConfig) -> Result<Self, SourceError> {
        Self::open_inner(path.as_ref(), Some(follow))
    }

    fn open_inner(path: &Path, follow: Option<FollowConfig>) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            name: path.display().to_string(),
            reader: BufReader::new(file),
            follow,
            pending: String::new(),
            exhausted: false,
            lines_skipped: 0,
            unknown_kind_drops: 0,
        })
    }

    /// Read the next complete line, honoring follow mode.
    fn read_line(&mut self) -> Result<Option<String>, SourceError> {
        let deadline = self.follow.map(|f| Instant::now() + f.idle_timeout);
        loop {
            let read = self.reader.read_line(&mut self.pending)?;
            if read > 0 {
                if self.pending.ends_with('\n') {
                    let line = std::mem::take(&mut self.pending);
                    return Ok(Some(line.trim_end().to_owned()));
                }
                // Mid-line append in progress; keep accumulating.
                continue;
            }

            match (self.follow, deadline) {
                (Some(cfg), Some(deadline)) if Instant::now() < deadline => {
                    std::thread::sleep(cfg.poll_interval);
                }
                _ => {
                    if self.follow.is_some() {
                        warn!(source = %self.name, "no new data within idle timeout, treating source as caught up");
                    }
                    // Batch EOF, or idle timeout: a trailing line without a
                    // newline is complete at end of stream.
                    if self.pending.is_empty() {
                        return Ok(None);
                    }
                    let line = std::mem::take(&mut self.pending);
                    return Ok(Some(line.trim_end().to_owned()));
                }
            }
        }
    }
}

impl EventSource for JsonlSource {
    fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let Some(line) = self.read_line()? else {
                self.exhausted = true;
                return Ok(None);
            };
            if line.is_empty() {
                continue;
            }
            match Event::parse_line(&line) {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => self.unknown_kind_drops += 1,
                Err(err) => {
                    self.lines_skipped += 1;
                    debug!(source = %self.name, %err, "skipping malformed line");
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn lines_skipped(&self) -> u64 {
        self.lines_skipped
    }

    fn unknown_kind_drops(&self) -> u64 {
        self.unknown_kind_drops
    }
}

/// In-memory source for tests and synthetic replays.
pub struct VecSource {
    name: String,
    events: VecDeque<Event>,
}

impl VecSource {
    pub fn new(name: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            name: name.into(),
            events: events.into(),
        }
    }
}

impl EventSource for VecSource {
    fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        Ok(self.events.pop_front())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
