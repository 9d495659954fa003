//! Per-run context carried from the orchestrator into the extraction engine.

use chrono::{NaiveDateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, Span};

use crate::models::RunMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    SessionAcquired,
    PageLoaded,
    Extracted,
    Normalized,
    Persisted,
    Discarded,
    TargetGone,
    Released,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::SessionAcquired => "session-acquired",
            RunState::PageLoaded => "page-loaded",
            RunState::Extracted => "extracted",
            RunState::Normalized => "normalized",
            RunState::Persisted => "persisted",
            RunState::Discarded => "discarded",
            RunState::TargetGone => "target-gone",
            RunState::Released => "released",
        };
        f.write_str(s)
    }
}

pub struct RunContext {
    pub id: String,
    pub mode: RunMode,
    pub started_at: NaiveDateTime,
    state: RunState,
    history: Vec<RunState>,
    clock: Instant,
}

impl RunContext {
    pub fn new(mode: RunMode) -> Self {
        Self {
            id: format!("{:08x}", rand::random::<u32>()),
            mode,
            started_at: Utc::now().naive_utc(),
            state: RunState::Idle,
            history: vec![RunState::Idle],
            clock: Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state the run has passed through, starting with `Idle`.
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn advance(&mut self, next: RunState) {
        debug!("run {}: {} → {}", self.id, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Span that tags every log line of this run with its correlation id.
    pub fn span(&self) -> Span {
        info_span!("run", id = %self.id, mode = self.mode.as_str())
    }
}
