//! Daily usage quota for remote AI removal calls.
//!
//! The quota is a tiny durable record `{count, date}`. Every read compares the
//! stored date with today's and resets the counter on rollover, so there is no
//! background timer. Storage and the calendar are injected so embedders (and
//! tests) decide where the record lives and what "today" is.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Persisted quota record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub count: u32,
    /// Calendar day, `YYYY-MM-DD`.
    pub date: String,
}

impl QuotaState {
    pub fn fresh(date: impl Into<String>) -> Self {
        Self {
            count: 0,
            date: date.into(),
        }
    }
}

/// Error type for quota persistence
#[derive(Debug)]
pub enum QuotaError {
    Io(std::io::Error),
    Serialize(String),
}

impl fmt::Display for QuotaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaError::Io(e) => write!(f, "I/O error: {}", e),
            QuotaError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for QuotaError {}

impl From<std::io::Error> for QuotaError {
    fn from(e: std::io::Error) -> Self {
        QuotaError::Io(e)
    }
}

impl From<serde_json::Error> for QuotaError {
    fn from(e: serde_json::Error) -> Self {
        QuotaError::Serialize(e.to_string())
    }
}

// -- Storage ---------------------------------------------------------------------

pub trait QuotaStore: Send {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<QuotaState>, QuotaError>;
    fn save(&self, state: &QuotaState) -> Result<(), QuotaError>;
}

/// JSON file store. Writes go through a temp file + rename.
#[derive(Clone, Debug)]
pub struct FileQuotaStore {
    path: PathBuf,
}

impl FileQuotaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/EraseFE/ai_quota.json`
    pub fn default_location() -> Self {
        Self::new(crate::settings::config_dir().join("ai_quota.json"))
    }
}

impl QuotaStore for FileQuotaStore {
    fn load(&self) -> Result<Option<QuotaState>, QuotaError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&self, state: &QuotaState) -> Result<(), QuotaError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store; clones share the same record.
#[derive(Clone, Debug, Default)]
pub struct MemoryQuotaStore {
    state: Arc<Mutex<Option<QuotaState>>>,
}

impl MemoryQuotaStore {
    pub fn with_state(state: QuotaState) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(state))),
        }
    }

    pub fn snapshot(&self) -> Option<QuotaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn load(&self) -> Result<Option<QuotaState>, QuotaError> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &QuotaState) -> Result<(), QuotaError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }
}

// -- Calendar ----------------------------------------------------------------------

pub trait Clock: Send {
    /// Today's date as `YYYY-MM-DD`.
    fn today(&self) -> String;
}

/// UTC calendar day from the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> String {
        let d = time::OffsetDateTime::now_utc().date();
        format!("{:04}-{:02}-{:02}", d.year(), u8::from(d.month()), d.day())
    }
}

/// Manually driven calendar; clones share the date.
#[derive(Clone, Debug)]
pub struct ManualClock {
    date: Arc<Mutex<String>>,
}

impl ManualClock {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: Arc::new(Mutex::new(date.into())),
        }
    }

    pub fn set(&self, date: impl Into<String>) {
        *self.date.lock().unwrap_or_else(|e| e.into_inner()) = date.into();
    }
}

impl Clock for ManualClock {
    fn today(&self) -> String {
        self.date.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// -- Tracker -----------------------------------------------------------------------

/// Gates remote calls on a per-day allowance.
pub struct UsageQuotaTracker {
    state: QuotaState,
    daily_limit: u32,
    /// Day on which the server reported the quota as spent.
    exhausted_on: Option<String>,
    store: Box<dyn QuotaStore>,
    clock: Box<dyn Clock>,
}

impl fmt::Debug for UsageQuotaTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageQuotaTracker")
            .field("state", &self.state)
            .field("daily_limit", &self.daily_limit)
            .field("exhausted_on", &self.exhausted_on)
            .finish()
    }
}

impl UsageQuotaTracker {
    pub fn new(daily_limit: u32, store: Box<dyn QuotaStore>, clock: Box<dyn Clock>) -> Self {
        let today = clock.today();
        let state = match store.load() {
            Ok(Some(state)) => state,
            Ok(None) => QuotaState::fresh(today.clone()),
            Err(e) => {
                crate::log_warn!("Quota record unreadable, starting fresh: {}", e);
                QuotaState::fresh(today.clone())
            }
        };
        let mut tracker = Self {
            state,
            daily_limit,
            exhausted_on: None,
            store,
            clock,
        };
        tracker.roll_over();
        tracker
    }

    fn roll_over(&mut self) {
        let today = self.clock.today();
        if self.state.date != today {
            crate::log_info!(
                "Quota rollover: {} ({} used) -> {}",
                self.state.date,
                self.state.count,
                today
            );
            self.state = QuotaState::fresh(today.clone());
            self.persist();
        }
        if self.exhausted_on.as_deref().is_some_and(|d| d != today) {
            self.exhausted_on = None;
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.state) {
            crate::log_warn!("Failed to persist quota record: {}", e);
        }
    }

    pub fn state(&mut self) -> &QuotaState {
        self.roll_over();
        &self.state
    }

    /// Calls left today; 0 once the server has reported the quota spent.
    pub fn remaining(&mut self) -> u32 {
        self.roll_over();
        if self.exhausted_on.is_some() {
            return 0;
        }
        self.daily_limit.saturating_sub(self.state.count)
    }

    pub fn can_call_remote(&mut self) -> bool {
        self.remaining() > 0
    }

    /// Count a successful remote call. The server's view of `remaining`, when
    /// known, is never contradicted by a more generous local count.
    pub fn record_success(&mut self, server_remaining: Option<u32>) {
        self.roll_over();
        self.state.count = self.state.count.saturating_add(1);
        if let Some(remaining) = server_remaining {
            let implied = self.daily_limit.saturating_sub(remaining);
            self.state.count = self.state.count.max(implied);
        }
        self.persist();
    }

    /// Server said the quota is spent: skip remote calls until the date changes.
    pub fn mark_exhausted(&mut self) {
        self.roll_over();
        self.exhausted_on = Some(self.state.date.clone());
    }
}
