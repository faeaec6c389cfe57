//! Tool usage analytics.
//!
//! Every tool call is counted and logged into a [`UsageRecord`], which is
//! written back to a [`UsageStore`] after each call. The JSON file store
//! keeps the record in a small human-readable file:
//!
//! ```json
//! {
//!   "total_calls": 1,
//!   "tools": {
//!     "polygon_api": { "calls": 1, "last_used": "2024-03-15T10:30:00" },
//!     ...
//!   },
//!   "sessions": [
//!     { "tool": "polygon_api", "query": "AAPL", "timestamp": "2024-03-15T10:30:00" }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Display};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::error::UsageError;
use crate::tools::ToolKind;

/// Number of session log entries kept.
pub const MAX_SESSIONS: usize = 100;
/// Logged queries are cut to this many characters.
pub const MAX_QUERY_CHARS: usize = 100;

/// Counters of one tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub calls: u64,
    pub last_used: Option<NaiveDateTime>,
}

/// One entry of the session log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub tool: String,
    pub query: String,
    pub timestamp: NaiveDateTime,
}

/// The persisted analytics record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub total_calls: u64,
    pub tools: BTreeMap<String, ToolUsage>,
    pub sessions: VecDeque<UsageEvent>,
}

impl Default for UsageRecord {
    fn default() -> Self {
        let mut record = Self {
            total_calls: 0,
            tools: BTreeMap::new(),
            sessions: VecDeque::new(),
        };
        record.fill_known_tools();
        record
    }
}

impl UsageRecord {
    fn fill_known_tools(&mut self) {
        for kind in ToolKind::iter() {
            self.tools.entry(kind.usage_key().to_owned()).or_default();
        }
    }

    /// Counts one call of the tool under `key`.
    pub fn record_at(&mut self, key: &str, query: &str, timestamp: NaiveDateTime) {
        let usage = self.tools.entry(key.to_owned()).or_default();
        usage.calls += 1;
        usage.last_used = Some(timestamp);
        self.total_calls += 1;

        self.sessions.push_back(UsageEvent {
            tool: key.to_owned(),
            query: query.chars().take(MAX_QUERY_CHARS).collect(),
            timestamp,
        });
        while self.sessions.len() > MAX_SESSIONS {
            self.sessions.pop_front();
        }
    }

    /// Returns the number of calls of the tool under `key`.
    pub fn calls(&self, key: &str) -> u64 {
        self.tools.get(key).map_or(0, |usage| usage.calls)
    }

    pub fn stats(&self) -> UsageStats {
        UsageStats {
            total_calls: self.total_calls,
            per_tool: ToolKind::iter()
                .map(|kind| (kind, self.calls(kind.usage_key())))
                .collect(),
            last_session: self.sessions.back().cloned(),
        }
    }
}

/// A reporting view of a [`UsageRecord`].
///
/// The [`Display`] implementation prints a short report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageStats {
    pub total_calls: u64,
    pub per_tool: Vec<(ToolKind, u64)>,
    pub last_session: Option<UsageEvent>,
}

impl UsageStats {
    /// Returns the call count of one tool.
    pub fn calls(&self, kind: ToolKind) -> u64 {
        self.per_tool
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, calls)| *calls)
    }
}

impl Display for UsageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(50);
        writeln!(f, "{rule}")?;
        writeln!(f, "📊 TOOL USAGE ANALYTICS")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Total Tool Calls: {}", self.total_calls)?;
        for (kind, calls) in &self.per_tool {
            let label = match kind {
                ToolKind::PolygonFinancials => "🚀 Polygon API",
                ToolKind::Retriever => "🔍 Retriever",
                ToolKind::TavilySearch => "🌐 Tavily Search",
                ToolKind::BingSearch => "🔍 Bing Search",
            };
            writeln!(f, "{label}: {calls} calls")?;
        }
        if let Some(last) = &self.last_session {
            writeln!(
                f,
                "Last Used: {} at {}",
                last.tool,
                last.timestamp.format("%Y-%m-%dT%H:%M:%S")
            )?;
        }
        write!(f, "{rule}")
    }
}

/// Where the usage record is kept.
pub trait UsageStore: Send + Sync {
    /// Loads the record, `None` if nothing was stored yet.
    fn load(&self) -> Result<Option<UsageRecord>, UsageError>;

    /// Replaces the stored record.
    fn save(&self, record: &UsageRecord) -> Result<(), UsageError>;
}

/// Stores the record as pretty-printed JSON, rewritten in full on save.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UsageStore for JsonFileStore {
    fn load(&self) -> Result<Option<UsageRecord>, UsageError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no usage record at {}", self.path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(UsageError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| UsageError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&self, record: &UsageRecord) -> Result<(), UsageError> {
        let json = serde_json::to_string_pretty(record)?;
        let write_err = |source: io::Error| UsageError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        // Written next to the record and renamed over it, so the file on
        // disk is always either the old or the new record.
        let mut file = NamedTempFile::new_in(dir).map_err(write_err)?;
        file.write_all(json.as_bytes()).map_err(write_err)?;
        file.as_file().sync_all().map_err(write_err)?;
        file.persist(&self.path)
            .map_err(|err| write_err(err.error))?;
        Ok(())
    }
}

/// Keeps the last saved record in memory. Clones share the same slot.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    saved: Arc<std::sync::Mutex<Option<UsageRecord>>>,
}

impl MemoryStore {
    /// Returns the last saved record.
    pub fn saved(&self) -> Option<UsageRecord> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl UsageStore for MemoryStore {
    fn load(&self) -> Result<Option<UsageRecord>, UsageError> {
        Ok(self.saved())
    }

    fn save(&self, record: &UsageRecord) -> Result<(), UsageError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(record.clone());
        Ok(())
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStore;

impl UsageStore for NoopStore {
    fn load(&self) -> Result<Option<UsageRecord>, UsageError> {
        Ok(None)
    }

    fn save(&self, _record: &UsageRecord) -> Result<(), UsageError> {
        Ok(())
    }
}

struct TrackerState {
    record: UsageRecord,
    store: Arc<dyn UsageStore>,
}

/// A shared handle to the usage record.
///
/// Concurrent tool calls record one at a time, each call is persisted
/// before the next one is counted.
#[derive(Clone)]
pub struct UsageTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl UsageTracker {
    /// Creates a tracker, starting from the record in `store` if any.
    pub fn load<S: UsageStore + 'static>(store: S) -> Result<Self, UsageError> {
        let mut record = store.load()?.unwrap_or_default();
        record.fill_known_tools();
        Ok(Self {
            state: Arc::new(Mutex::new(TrackerState {
                record,
                store: Arc::new(store),
            })),
        })
    }

    /// Creates a tracker that persists nothing.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                record: UsageRecord::default(),
                store: Arc::new(NoopStore),
            })),
        }
    }

    /// Counts one call of `tool` and persists the record.
    pub async fn record(&self, tool: ToolKind, query: &str) {
        let mut state = self.state.lock().await;
        let now = Local::now().naive_local();
        state.record.record_at(tool.usage_key(), query, now);
        trace!("recorded a call of {}", tool.usage_key());

        // The lock stays held so saves land in the order calls were counted.
        let store = Arc::clone(&state.store);
        let record = state.record.clone();
        match tokio::task::spawn_blocking(move || store.save(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to persist tool usage: {err}"),
            Err(err) => warn!("tool usage writer did not finish: {err}"),
        }
    }

    pub async fn snapshot(&self) -> UsageRecord {
        self.state.lock().await.record.clone()
    }

    pub async fn stats(&self) -> UsageStats {
        self.state.lock().await.record.stats()
    }
}
