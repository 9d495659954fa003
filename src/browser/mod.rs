//! Headless browser sessions: one per extraction, always torn down.

pub mod chrome;
#[cfg(test)]
pub mod fake;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::SessionError;

pub use self::chrome::ChromeLauncher;

// ── Traits ────────────────────────────────────────────────────────────────────

/// Starts browser sessions. Acquisition is all-or-nothing: an error means no
/// process was left behind.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Session>, SessionError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    /// Navigate a fresh tab to `url` and wait for it to load.
    async fn open(&self, url: &str) -> Result<Box<dyn LoadedPage>>;

    /// Orderly shutdown of the browser process.
    async fn close(self: Box<Self>) -> Result<()>;

    /// Synchronous last-resort teardown for a session dropped without `close`.
    fn abandon(&mut self);
}

/// A rendered page the extraction engine can query.
#[async_trait]
pub trait LoadedPage: Send + Sync {
    /// Visible text of the first element matching the selector group that has any.
    async fn first_text(&self, selectors: &str) -> Result<Option<String>>;

    /// Text of the first element that looks like a rendered price, if one exists yet.
    async fn price_like_text(&self) -> Result<Option<String>>;

    /// Serialized DOM as currently rendered.
    async fn html(&self) -> Result<String>;
}

// ── Guard ─────────────────────────────────────────────────────────────────────

/// Owns a session for the length of one run.
///
/// `release` is the normal path. If the guard is dropped instead (a panic or a
/// cancelled future) the session is abandoned from `Drop` so the browser
/// process never outlives the run.
pub struct SessionGuard {
    session: Option<Box<dyn Session>>,
    label: String,
}

impl SessionGuard {
    pub async fn acquire(
        launcher: &dyn SessionLauncher,
        label: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let label = label.into();
        let session = launcher.acquire().await?;
        debug!("session acquired for {}", label);
        Ok(Self {
            session: Some(session),
            label,
        })
    }

    pub async fn open(&self, url: &str) -> Result<Box<dyn LoadedPage>> {
        let session = self.session.as_ref().context("session already released")?;
        session.open(url).await
    }

    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            match session.close().await {
                Ok(()) => debug!("session released for {}", self.label),
                Err(e) => warn!("session for {} closed uncleanly: {:#}", self.label, e),
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            warn!("session for {} dropped without release, abandoning", self.label);
            session.abandon();
        }
    }
}
