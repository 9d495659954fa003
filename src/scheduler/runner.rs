//! Fires due schedule entries as scheduled pipeline runs.

use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::PRICE_CHECK_TASK;
use crate::config::SchedulerConfig;
use crate::pipeline::Pipeline;
use crate::storage::ScheduleStore;

pub struct ScheduleRunner {
    pipeline: Pipeline,
    schedules: Arc<dyn ScheduleStore>,
    tick: Duration,
}

impl ScheduleRunner {
    pub fn new(
        pipeline: Pipeline,
        schedules: Arc<dyn ScheduleStore>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            pipeline,
            schedules,
            tick: Duration::from_secs(config.tick_secs.max(1)),
        }
    }

    /// Spawn a run for every entry due at `now`. Returns how many were started.
    ///
    /// An entry is stamped with `now` before its run is spawned, so the next
    /// tick does not fire it again while the run is still in flight.
    pub async fn dispatch_due(
        &self,
        now: NaiveDateTime,
        tasks: &mut JoinSet<()>,
    ) -> Result<usize> {
        let mut started = 0;

        for entry in self.schedules.list().await? {
            if !entry.is_due(now) {
                continue;
            }
            if entry.task != PRICE_CHECK_TASK {
                warn!("{}: unknown task {}, skipping", entry.name, entry.task);
                continue;
            }
            let Some(item_id) = entry.item_id() else {
                warn!("{}: malformed args {}, skipping", entry.name, entry.args);
                continue;
            };
            if !self.schedules.mark_run(&entry.name, now).await? {
                continue;
            }

            let pipeline = self.pipeline.clone();
            tasks.spawn(async move {
                match pipeline.run_scheduled(item_id).await {
                    Ok(outcome) => debug!("item {}: {}", item_id, outcome.label()),
                    Err(e) if e.is_timeout() => warn!("scheduled check of item {} timed out: {}", item_id, e),
                    Err(e) => warn!("scheduled check of item {} failed: {}", item_id, e),
                }
            });
            started += 1;
        }

        Ok(started)
    }

    /// Tick until `shutdown` resolves, then wait for in-flight runs.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        info!("schedule runner started (tick {:?})", self.tick);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    match self.dispatch_due(Utc::now().naive_utc(), &mut tasks).await {
                        Ok(0) => {}
                        Ok(n) => info!("dispatched {} scheduled checks", n),
                        Err(e) => error!("schedule tick failed: {:#}", e),
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("scheduled check panicked: {}", e);
                    }
                }
            }
        }

        info!("shutting down, {} checks still running", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("scheduled check panicked: {}", e);
            }
        }
        Ok(())
    }
}
