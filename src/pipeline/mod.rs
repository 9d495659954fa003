//! Scrape orchestrator: browser session → extraction → storage → schedule.
//!
//! ## Run modes
//!
//! `preview()`: scrape a URL and return what was found. Nothing is written.
//!
//! `save_and_automate()`: scrape, create the record, then reconcile its
//!   recurring check. A record saved without a schedule is reported as
//!   `SavedWithoutSchedule` rather than as a failure.
//!
//! `run_scheduled()`: refresh the prices of a stored item. An item that no
//!   longer exists has its schedule deleted (`TargetGone`).
//!
//! Every run holds one permit of a shared semaphore for as long as it holds a
//! browser session, and always releases the session before returning.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};
use url::Url;

use crate::browser::{SessionGuard, SessionLauncher};
use crate::config::AppConfig;
use crate::context::{RunContext, RunState};
use crate::error::RunError;
use crate::models::{
    ExtractionResult, Frequency, ItemFilter, ItemUpdate, MonitoredItem, NewItem, Price, RunLogEntry,
    RunMode, ScheduleEntry, StoreStats,
};
use crate::scheduler::{Reconciled, Reconciler};
use crate::scraper::Extractor;
use crate::storage::{RecordStore, ScheduleStore};

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Preview {
        result: ExtractionResult,
    },
    Saved {
        item: MonitoredItem,
        schedule: ScheduleEntry,
    },
    /// The record exists but its recurring check could not be written.
    SavedWithoutSchedule {
        item: MonitoredItem,
        error: String,
    },
    Updated {
        item: MonitoredItem,
    },
    /// Name or current price missing; nothing was persisted.
    Incomplete {
        result: ExtractionResult,
        missing: Vec<&'static str>,
    },
    TargetGone {
        item_id: i64,
        schedule_removed: bool,
    },
    Skipped {
        item_id: i64,
    },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Preview { .. } => "preview",
            RunOutcome::Saved { .. } => "saved",
            RunOutcome::SavedWithoutSchedule { .. } => "saved_without_schedule",
            RunOutcome::Updated { .. } => "updated",
            RunOutcome::Incomplete { .. } => "incomplete",
            RunOutcome::TargetGone { .. } => "target_gone",
            RunOutcome::Skipped { .. } => "skipped",
        }
    }

    pub fn item_id(&self) -> Option<i64> {
        match self {
            RunOutcome::Saved { item, .. }
            | RunOutcome::SavedWithoutSchedule { item, .. }
            | RunOutcome::Updated { item } => Some(item.id),
            RunOutcome::TargetGone { item_id, .. } | RunOutcome::Skipped { item_id } => {
                Some(*item_id)
            }
            RunOutcome::Preview { .. } | RunOutcome::Incomplete { .. } => None,
        }
    }

    fn incomplete(result: ExtractionResult) -> Self {
        let missing = result.missing_fields();
        RunOutcome::Incomplete { result, missing }
    }
}

// ── Session lease ─────────────────────────────────────────────────────────────

/// A browser session plus the concurrency permit it was started under.
struct Lease {
    guard: SessionGuard,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    async fn release(self, ctx: &mut RunContext) {
        self.guard.release().await;
        ctx.advance(RunState::Released);
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Pipeline {
    launcher: Arc<dyn SessionLauncher>,
    records: Arc<dyn RecordStore>,
    reconciler: Reconciler,
    extractor: Arc<Extractor>,
    permits: Arc<Semaphore>,
    page_load_timeout: Duration,
    run_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        launcher: Arc<dyn SessionLauncher>,
        records: Arc<dyn RecordStore>,
        schedules: Arc<dyn ScheduleStore>,
    ) -> Self {
        Self {
            launcher,
            records,
            reconciler: Reconciler::new(schedules),
            extractor: Arc::new(Extractor::new(&config.browser)),
            permits: Arc::new(Semaphore::new(config.pipeline.concurrency.max(1))),
            page_load_timeout: Duration::from_secs(config.browser.page_load_timeout_secs),
            run_timeout: Duration::from_secs(config.pipeline.run_timeout_secs),
        }
    }

    #[cfg(test)]
    pub fn with_timeouts(mut self, page_load: Duration, run: Duration) -> Self {
        self.page_load_timeout = page_load;
        self.run_timeout = run;
        self
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    // ── Triggers ──────────────────────────────────────────────────────────────

    pub async fn preview(&self, identifier: &str, url: &str) -> Result<RunOutcome, RunError> {
        let mut ctx = RunContext::new(RunMode::Preview);
        let span = ctx.span();
        async {
            info!("preview of {} for {}", url, identifier);
            let outcome = self.preview_run(&mut ctx, url).await;
            self.log_run(&ctx, None, Some(url), &outcome).await;
            outcome
        }
        .instrument(span)
        .await
    }

    pub async fn save_and_automate(
        &self,
        identifier: &str,
        url: &str,
        frequency: &str,
    ) -> Result<RunOutcome, RunError> {
        let mut ctx = RunContext::new(RunMode::SaveAndAutomate);
        let span = ctx.span();
        async {
            info!("tracking {} for {} ({})", url, identifier, frequency);
            let outcome = self.save_run(&mut ctx, identifier, url, frequency).await;
            self.log_run(&ctx, None, Some(url), &outcome).await;
            outcome
        }
        .instrument(span)
        .await
    }

    pub async fn run_scheduled(&self, item_id: i64) -> Result<RunOutcome, RunError> {
        let mut ctx = RunContext::new(RunMode::Scheduled);
        let span = ctx.span();
        async {
            info!("scheduled check of item {}", item_id);
            let outcome = self.scheduled_run(&mut ctx, item_id).await;
            self.log_run(&ctx, Some(item_id), None, &outcome).await;
            outcome
        }
        .instrument(span)
        .await
    }

    // ── Record management ─────────────────────────────────────────────────────

    /// Change how often an item is checked. The record keeps its prices.
    pub async fn update_frequency(
        &self,
        item_id: i64,
        frequency: &str,
    ) -> Result<Reconciled, RunError> {
        let frequency: Frequency = frequency.parse()?;
        if !self
            .records
            .update(item_id, &ItemUpdate::Frequency(frequency))
            .await?
        {
            return Err(RunError::ItemNotFound(item_id));
        }
        self.reconciler
            .apply(item_id, frequency)
            .await
            .map_err(RunError::Schedule)
    }

    /// Delete the record and its schedule. `false` when there was no record.
    pub async fn delete_item(&self, item_id: i64) -> Result<bool, RunError> {
        let existed = self.records.delete(item_id).await?;
        self.reconciler
            .remove(item_id)
            .await
            .map_err(RunError::Schedule)?;
        Ok(existed)
    }

    /// Inactive items keep their schedule but their checks are skipped.
    pub async fn set_active(&self, item_id: i64, active: bool) -> Result<(), RunError> {
        if !self.records.update(item_id, &ItemUpdate::Active(active)).await? {
            return Err(RunError::ItemNotFound(item_id));
        }
        info!("item {} {}", item_id, if active { "resumed" } else { "paused" });
        Ok(())
    }

    pub async fn list(&self, filter: &ItemFilter) -> Result<Vec<MonitoredItem>, RunError> {
        Ok(self.records.list(filter).await?)
    }

    pub async fn stats(&self) -> Result<StoreStats, RunError> {
        Ok(self.records.stats().await?)
    }

    // ── Run bodies ────────────────────────────────────────────────────────────

    async fn preview_run(&self, ctx: &mut RunContext, url: &str) -> Result<RunOutcome, RunError> {
        let url = validate_url(url)?;

        let lease = self.lease(ctx).await?;
        let outcome = self
            .bounded(self.load_and_extract(&lease, ctx, &url))
            .await
            .map(|result| {
                if result.is_complete() {
                    RunOutcome::Preview { result }
                } else {
                    ctx.advance(RunState::Discarded);
                    RunOutcome::incomplete(result)
                }
            });
        lease.release(ctx).await;
        outcome
    }

    async fn save_run(
        &self,
        ctx: &mut RunContext,
        identifier: &str,
        url: &str,
        frequency: &str,
    ) -> Result<RunOutcome, RunError> {
        // Both are checked before a session is started or anything is written.
        let frequency: Frequency = frequency.parse()?;
        let url = validate_url(url)?;

        let lease = self.lease(ctx).await?;
        let loaded = self.bounded(self.load_and_extract(&lease, ctx, &url)).await;
        let outcome = match loaded {
            Ok(result) => self.save_result(ctx, identifier, result, frequency).await,
            Err(e) => Err(e),
        };
        lease.release(ctx).await;
        outcome
    }

    async fn save_result(
        &self,
        ctx: &mut RunContext,
        identifier: &str,
        result: ExtractionResult,
        frequency: Frequency,
    ) -> Result<RunOutcome, RunError> {
        let Some(new_item) = NewItem::from_extraction(identifier, &result, frequency) else {
            ctx.advance(RunState::Discarded);
            return Ok(RunOutcome::incomplete(result));
        };

        let item = self.records.create(&new_item).await?;
        ctx.advance(RunState::Persisted);
        info!("saved item {} ({})", item.id, item.name);

        match self.reconciler.apply(item.id, frequency).await {
            Ok(reconciled) => Ok(RunOutcome::Saved {
                item,
                schedule: reconciled.entry().clone(),
            }),
            Err(e) => {
                warn!("item {} saved but not scheduled: {:#}", item.id, e);
                Ok(RunOutcome::SavedWithoutSchedule {
                    item,
                    error: format!("{:#}", e),
                })
            }
        }
    }

    async fn scheduled_run(
        &self,
        ctx: &mut RunContext,
        item_id: i64,
    ) -> Result<RunOutcome, RunError> {
        let Some(item) = self.records.get(item_id).await? else {
            return self.target_gone(ctx, item_id).await;
        };
        if !item.is_active {
            info!("item {} is paused, skipping", item_id);
            return Ok(RunOutcome::Skipped { item_id });
        }

        let lease = self.lease(ctx).await?;
        let loaded = self.bounded(self.load_and_extract(&lease, ctx, &item.url)).await;
        let outcome = match loaded {
            Ok(result) => self.refresh_result(ctx, &item, result).await,
            Err(e) => Err(e),
        };
        lease.release(ctx).await;
        outcome
    }

    async fn refresh_result(
        &self,
        ctx: &mut RunContext,
        item: &MonitoredItem,
        result: ExtractionResult,
    ) -> Result<RunOutcome, RunError> {
        let Some(price) = result.price.found().filter(|_| result.is_complete()) else {
            ctx.advance(RunState::Discarded);
            return Ok(RunOutcome::incomplete(result));
        };

        let update = ItemUpdate::Prices {
            current: Price::from_raw(price),
            previous: Some(item.current_price.clone()),
            discount: result.discount.found().map(str::to_string),
        };
        // The record may have been deleted while the page loaded.
        if !self.records.update(item.id, &update).await? {
            return self.target_gone(ctx, item.id).await;
        }
        ctx.advance(RunState::Persisted);

        let updated = self
            .records
            .get(item.id)
            .await?
            .ok_or(RunError::ItemNotFound(item.id))?;
        info!(
            "item {}: {} (was {})",
            updated.id,
            updated.current_price,
            item.current_price
        );
        Ok(RunOutcome::Updated { item: updated })
    }

    async fn target_gone(
        &self,
        ctx: &mut RunContext,
        item_id: i64,
    ) -> Result<RunOutcome, RunError> {
        warn!("item {} no longer exists, removing its schedule", item_id);
        let schedule_removed = self
            .reconciler
            .remove(item_id)
            .await
            .map_err(RunError::Schedule)?;
        ctx.advance(RunState::TargetGone);
        Ok(RunOutcome::TargetGone {
            item_id,
            schedule_removed,
        })
    }

    // ── Shared steps ──────────────────────────────────────────────────────────

    async fn lease(&self, ctx: &mut RunContext) -> Result<Lease, RunError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| RunError::Shutdown)?;
        let guard = SessionGuard::acquire(self.launcher.as_ref(), format!("run {}", ctx.id)).await?;
        ctx.advance(RunState::SessionAcquired);
        Ok(Lease {
            guard,
            _permit: permit,
        })
    }

    async fn load_and_extract(
        &self,
        lease: &Lease,
        ctx: &mut RunContext,
        url: &str,
    ) -> Result<ExtractionResult, RunError> {
        let page = match timeout(self.page_load_timeout, lease.guard.open(url)).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                return Err(RunError::Navigation {
                    url: url.to_string(),
                    reason: format!("{:#}", e),
                })
            }
            Err(_) => {
                return Err(RunError::Timeout {
                    stage: "page load",
                    after: self.page_load_timeout,
                })
            }
        };
        ctx.advance(RunState::PageLoaded);

        let result = self.extractor.extract(page.as_ref(), url, ctx).await;
        ctx.advance(RunState::Extracted);
        // price fields were normalized as they were accepted
        ctx.advance(RunState::Normalized);
        Ok(result)
    }

    /// Apply the run timeout to the page phase of a run. Persisting and
    /// scheduling are not bounded by it.
    async fn bounded<T>(
        &self,
        body: impl Future<Output = Result<T, RunError>>,
    ) -> Result<T, RunError> {
        match timeout(self.run_timeout, body).await {
            Ok(result) => result,
            Err(_) => Err(RunError::Timeout {
                stage: "run",
                after: self.run_timeout,
            }),
        }
    }

    async fn log_run(
        &self,
        ctx: &RunContext,
        item_id: Option<i64>,
        url: Option<&str>,
        outcome: &Result<RunOutcome, RunError>,
    ) {
        let (label, error) = match outcome {
            Ok(o) => (o.label(), None),
            Err(e) => ("error", Some(e.to_string())),
        };
        let item_id = item_id.or_else(|| outcome.as_ref().ok().and_then(RunOutcome::item_id));

        match &error {
            None => info!("{} in {:.2?}", label, ctx.elapsed()),
            Some(e) => warn!("failed in {:.2?} at {}: {}", ctx.elapsed(), ctx.state(), e),
        }
        debug!("states: {:?}", ctx.history());

        let entry = RunLogEntry {
            correlation_id: ctx.id.clone(),
            mode: ctx.mode,
            item_id,
            url: url.map(str::to_string),
            outcome: label.to_string(),
            error,
            started_at: ctx.started_at,
            finished_at: Utc::now().naive_utc(),
        };
        if let Err(e) = self.records.log_run(&entry).await {
            warn!("could not record run: {:#}", e);
        }
    }
}

fn validate_url(raw: &str) -> Result<String, RunError> {
    let raw = raw.trim();
    let invalid = |reason: String| RunError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let parsed = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(raw.to_string()),
        "http" | "https" => Err(invalid("missing host".into())),
        other => Err(invalid(format!("unsupported scheme {}", other))),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeBrowser;
    use crate::models::{CalendarSpec, IntervalUnit, Period};
    use crate::storage::Repository;
    use anyhow::{anyhow, Result as AnyResult};
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use tokio_test::{assert_err, assert_ok};

    const URL: &str = "https://shop.example/kettle";

    const KETTLE: &str = r#"<html><body>
        <h1>Cordless Kettle</h1>
        <span class="-b -ltr -tal -fs24">₦ 45,000.00</span>
    </body></html>"#;

    const KETTLE_CHEAPER: &str = r#"<html><body>
        <h1>Cordless Kettle</h1>
        <span class="-b -ltr -tal -fs24">₦ 39,500</span>
        <span class="bdg _dsct">12%</span>
    </body></html>"#;

    fn repo() -> Arc<Repository> {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        repo.run_migrations().unwrap();
        repo
    }

    fn pipeline_on(repo: &Arc<Repository>, browser: &FakeBrowser) -> Pipeline {
        Pipeline::new(
            &AppConfig::default(),
            Arc::new(browser.clone()),
            repo.clone(),
            repo.clone(),
        )
    }

    #[tokio::test]
    async fn test_end_to_end_save_and_automate() {
        let browser = FakeBrowser::new().with_page(URL, KETTLE);
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);

        let outcome = assert_ok!(pipeline.save_and_automate("user-1", URL, "daily").await);
        let RunOutcome::Saved { item, schedule } = outcome else {
            panic!("expected Saved, got {:?}", outcome);
        };
        assert_eq!(item.name, "Cordless Kettle");
        assert_eq!(item.current_price.display(), "₦ 45,000.00");
        assert_eq!(item.current_price.value(), Some(45000.0));
        assert_eq!(item.previous_price, None);
        assert_eq!(schedule.name, format!("update_item_{}", item.id));
        assert_eq!(schedule.period, Period::Interval { every: 24, unit: IntervalUnit::Hours });

        assert_eq!(browser.launched_sessions(), 1);
        assert_eq!(browser.live_sessions(), 0);
        assert_eq!(browser.abandoned_sessions(), 0);
        assert_eq!(pipeline.stats().await.unwrap().runs, 1);
    }

    #[tokio::test]
    async fn test_preview_reports_missing_fields_as_sentinel() {
        let browser = FakeBrowser::new().with_page(URL, KETTLE);
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);

        let outcome = assert_ok!(pipeline.preview("user-1", URL).await);
        let RunOutcome::Preview { result } = outcome else {
            panic!("expected Preview, got {:?}", outcome);
        };
        assert_eq!(result.price.as_str(), "₦ 45,000.00");
        assert_eq!(result.previous_price.as_str(), "N/A");
        assert_eq!(result.description.as_str(), "N/A");
        // preview never writes a record
        assert!(repo.list_items(&ItemFilter::default()).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_timeout_still_releases_session() {
        let browser = FakeBrowser::new()
            .with_page(URL, KETTLE)
            .slow_navigation(Duration::from_secs(60));
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);

        let err = assert_err!(pipeline.preview("user-1", URL).await);
        assert!(err.is_timeout(), "unexpected error: {}", err);
        assert!(matches!(err, RunError::Timeout { stage: "page load", .. }));
        assert_eq!(browser.launched_sessions(), 1);
        assert_eq!(browser.live_sessions(), 0);
        assert_eq!(browser.abandoned_sessions(), 0);
        assert_eq!(repo.stats().unwrap().failed_runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_still_releases_session() {
        let browser = FakeBrowser::new()
            .with_page(URL, KETTLE)
            .slow_navigation(Duration::from_secs(60));
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser)
            .with_timeouts(Duration::from_secs(120), Duration::from_secs(5));

        let err = assert_err!(pipeline.save_and_automate("user-1", URL, "hourly").await);
        assert!(matches!(err, RunError::Timeout { stage: "run", .. }));
        assert_eq!(browser.live_sessions(), 0);
        assert!(repo.list_items(&ItemFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_url_is_a_navigation_error() {
        let browser = FakeBrowser::new();
        let pipeline = pipeline_on(&repo(), &browser);
        let err = assert_err!(pipeline.preview("user-1", "https://shop.example/gone").await);
        assert!(matches!(err, RunError::Navigation { .. }));
        assert_eq!(browser.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_extraction_is_never_saved() {
        let browser = FakeBrowser::new()
            .with_page(URL, "<html><body><h1>Mystery box</h1><p>Soon</p></body></html>");
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);

        let outcome = assert_ok!(pipeline.save_and_automate("user-1", URL, "daily").await);
        match outcome {
            RunOutcome::Incomplete { missing, result } => {
                assert_eq!(missing, vec!["current_price"]);
                assert_eq!(result.name.as_str(), "Mystery box");
            }
            other => panic!("expected Incomplete, got {:?}", other),
        }
        assert!(repo.list_items(&ItemFilter::default()).unwrap().is_empty());
        assert!(repo.list_schedules().unwrap().is_empty());
        assert_eq!(browser.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_any_work() {
        let browser = FakeBrowser::new().with_page(URL, KETTLE);
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);

        let err = assert_err!(pipeline.save_and_automate("user-1", URL, "weekly").await);
        assert!(matches!(err, RunError::InvalidFrequency(_)));

        let err = assert_err!(pipeline.save_and_automate("user-1", "ftp://shop.example/x", "daily").await);
        assert!(matches!(err, RunError::InvalidUrl { .. }));

        let err = assert_err!(pipeline.preview("user-1", "not a url").await);
        assert!(matches!(err, RunError::InvalidUrl { .. }));

        assert_eq!(browser.launched_sessions(), 0);
        assert!(repo.list_items(&ItemFilter::default()).unwrap().is_empty());
        assert!(repo.list_schedules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acquisition_failure_is_reported() {
        let browser = FakeBrowser::new().failing_launch();
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);

        let err = assert_err!(pipeline.save_and_automate("user-1", URL, "daily").await);
        assert!(matches!(err, RunError::Acquisition(_)));
        assert!(repo.list_items(&ItemFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_run_for_deleted_item_removes_schedule() {
        let browser = FakeBrowser::new();
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);
        pipeline.reconciler().reconcile(42, "hourly").await.unwrap();

        let outcome = assert_ok!(pipeline.run_scheduled(42).await);
        assert_eq!(
            outcome,
            RunOutcome::TargetGone { item_id: 42, schedule_removed: true }
        );
        assert!(repo.find_schedule("update_item_42").unwrap().is_none());
        assert_eq!(browser.launched_sessions(), 0);
    }

    #[tokio::test]
    async fn test_scheduled_run_moves_current_to_previous() {
        let repo = repo();
        let first = FakeBrowser::new().with_page(URL, KETTLE);
        let saved = pipeline_on(&repo, &first)
            .save_and_automate("user-1", URL, "hourly")
            .await
            .unwrap();
        let id = saved.item_id().unwrap();

        let later = FakeBrowser::new().with_page(URL, KETTLE_CHEAPER);
        let outcome = assert_ok!(pipeline_on(&repo, &later).run_scheduled(id).await);
        let RunOutcome::Updated { item } = outcome else {
            panic!("expected Updated, got {:?}", outcome);
        };
        assert_eq!(item.current_price.value(), Some(39500.0));
        assert_eq!(item.previous_price.unwrap().value(), Some(45000.0));
        assert_eq!(item.discount.as_deref(), Some("-12%"));
        assert_eq!(item.frequency, Frequency::Hourly);
        assert_eq!(later.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_paused_item_is_skipped() {
        let browser = FakeBrowser::new().with_page(URL, KETTLE);
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);
        let id = pipeline
            .save_and_automate("user-1", URL, "daily")
            .await
            .unwrap()
            .item_id()
            .unwrap();

        pipeline.set_active(id, false).await.unwrap();
        let outcome = assert_ok!(pipeline.run_scheduled(id).await);
        assert_eq!(outcome, RunOutcome::Skipped { item_id: id });
        assert_eq!(browser.launched_sessions(), 1);
        assert!(repo.find_schedule(&format!("update_item_{}", id)).unwrap().is_some());

        let err = assert_err!(pipeline.set_active(id + 1, true).await);
        assert!(matches!(err, RunError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_frequency_and_delete() {
        let browser = FakeBrowser::new().with_page(URL, KETTLE);
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);
        let id = pipeline
            .save_and_automate("user-1", URL, "daily")
            .await
            .unwrap()
            .item_id()
            .unwrap();

        let reconciled = assert_ok!(pipeline.update_frequency(id, "monthly").await);
        assert!(matches!(reconciled, Reconciled::Updated(_)));
        assert_eq!(reconciled.entry().period, Period::Calendar(CalendarSpec::MONTHLY));
        assert_eq!(repo.get_item(id).unwrap().unwrap().frequency, Frequency::Monthly);

        let err = assert_err!(pipeline.update_frequency(id, "yearly").await);
        assert!(matches!(err, RunError::InvalidFrequency(_)));
        assert_eq!(repo.get_item(id).unwrap().unwrap().frequency, Frequency::Monthly);

        assert!(assert_ok!(pipeline.delete_item(id).await));
        assert!(repo.get_item(id).unwrap().is_none());
        assert!(repo.list_schedules().unwrap().is_empty());
        assert!(!assert_ok!(pipeline.delete_item(id).await));
    }

    struct BrokenSchedules;

    #[async_trait]
    impl ScheduleStore for BrokenSchedules {
        async fn find_by_name(&self, _: &str) -> AnyResult<Option<ScheduleEntry>> {
            Err(anyhow!("schedule table locked"))
        }
        async fn upsert_interval(&self, _: &str, _: &str, _: u32, _: IntervalUnit, _: &str) -> AnyResult<()> {
            Err(anyhow!("schedule table locked"))
        }
        async fn upsert_calendar(&self, _: &str, _: &str, _: CalendarSpec, _: &str) -> AnyResult<()> {
            Err(anyhow!("schedule table locked"))
        }
        async fn delete(&self, _: &str) -> AnyResult<bool> {
            Err(anyhow!("schedule table locked"))
        }
        async fn list(&self) -> AnyResult<Vec<ScheduleEntry>> {
            Ok(Vec::new())
        }
        async fn mark_run(&self, _: &str, _: NaiveDateTime) -> AnyResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_schedule_failure_is_partial_success() {
        let browser = FakeBrowser::new().with_page(URL, KETTLE);
        let repo = repo();
        let pipeline = Pipeline::new(
            &AppConfig::default(),
            Arc::new(browser.clone()),
            repo.clone(),
            Arc::new(BrokenSchedules),
        );

        let outcome = assert_ok!(pipeline.save_and_automate("user-1", URL, "daily").await);
        let RunOutcome::SavedWithoutSchedule { item, error } = outcome else {
            panic!("expected SavedWithoutSchedule, got {:?}", outcome);
        };
        assert!(error.contains("schedule table locked"));
        assert!(repo.get_item(item.id).unwrap().is_some());
        assert_eq!(browser.live_sessions(), 0);
    }

    /// Record store whose inserts take longer than a whole run may.
    struct SlowInserts(Arc<Repository>);

    #[async_trait]
    impl RecordStore for SlowInserts {
        async fn get(&self, id: i64) -> AnyResult<Option<MonitoredItem>> {
            self.0.get_item(id)
        }
        async fn create(&self, item: &NewItem) -> AnyResult<MonitoredItem> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.0.create_item(item)
        }
        async fn update(&self, id: i64, update: &ItemUpdate) -> AnyResult<bool> {
            self.0.update_item(id, update)
        }
        async fn delete(&self, id: i64) -> AnyResult<bool> {
            self.0.delete_item(id)
        }
        async fn list(&self, filter: &ItemFilter) -> AnyResult<Vec<MonitoredItem>> {
            self.0.list_items(filter)
        }
        async fn log_run(&self, entry: &RunLogEntry) -> AnyResult<()> {
            self.0.log_run(entry)
        }
        async fn stats(&self) -> AnyResult<StoreStats> {
            self.0.stats()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_persist_is_not_cut_by_run_timeout() {
        let browser = FakeBrowser::new().with_page(URL, KETTLE);
        let repo = repo();
        let pipeline = Pipeline::new(
            &AppConfig::default(),
            Arc::new(browser.clone()),
            Arc::new(SlowInserts(repo.clone())),
            repo.clone(),
        )
        .with_timeouts(Duration::from_secs(10), Duration::from_secs(5));

        let outcome = assert_ok!(pipeline.save_and_automate("user-1", URL, "daily").await);
        assert!(matches!(outcome, RunOutcome::Saved { .. }), "got {:?}", outcome);
        assert_eq!(repo.list_items(&ItemFilter::default()).unwrap().len(), 1);
        assert_eq!(repo.list_schedules().unwrap().len(), 1);
        assert_eq!(browser.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_list_by_user() {
        let browser = FakeBrowser::new().with_page(URL, KETTLE);
        let repo = repo();
        let pipeline = pipeline_on(&repo, &browser);
        pipeline.save_and_automate("user-1", URL, "daily").await.unwrap();
        pipeline.save_and_automate("user-2", URL, "daily").await.unwrap();

        assert_eq!(pipeline.list(&ItemFilter::for_user("user-1")).await.unwrap().len(), 1);
        assert_eq!(pipeline.list(&ItemFilter::default()).await.unwrap().len(), 2);
    }

    #[test]
    fn test_validate_url() {
        assert_eq!(validate_url(" https://a.example/p ").unwrap(), "https://a.example/p");
        assert!(validate_url("mailto:x@example.com").is_err());
        assert!(validate_url("/relative/path").is_err());
    }
}
