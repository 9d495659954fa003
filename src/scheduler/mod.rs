//! Keeps exactly one recurring price-check entry per monitored item.

pub mod runner;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::error::ReconcileError;
use crate::models::{CalendarSpec, Frequency, IntervalUnit, Period, ScheduleEntry};
use crate::storage::ScheduleStore;

pub use self::runner::ScheduleRunner;

/// Task every entry dispatches to.
pub const PRICE_CHECK_TASK: &str = "pricewatch.price_check";

pub fn job_name(item_id: i64) -> String {
    format!("update_item_{}", item_id)
}

pub fn period_for(frequency: Frequency) -> Period {
    match frequency {
        Frequency::Minutes => Period::Interval { every: 1, unit: IntervalUnit::Minutes },
        Frequency::Hourly => Period::Interval { every: 1, unit: IntervalUnit::Hours },
        Frequency::Daily => Period::Interval { every: 24, unit: IntervalUnit::Hours },
        Frequency::Hours(n) => Period::Interval { every: n, unit: IntervalUnit::Hours },
        Frequency::Monthly => Period::Calendar(CalendarSpec::MONTHLY),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Created(ScheduleEntry),
    Updated(ScheduleEntry),
}

impl Reconciled {
    pub fn entry(&self) -> &ScheduleEntry {
        match self {
            Reconciled::Created(e) | Reconciled::Updated(e) => e,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    schedules: Arc<dyn ScheduleStore>,
}

impl Reconciler {
    pub fn new(schedules: Arc<dyn ScheduleStore>) -> Self {
        Self { schedules }
    }

    /// Parse `frequency` and point the item's entry at it. Nothing is written
    /// when the frequency is not recognised.
    pub async fn reconcile(
        &self,
        item_id: i64,
        frequency: &str,
    ) -> Result<Reconciled, ReconcileError> {
        let frequency: Frequency = frequency.parse()?;
        Ok(self.apply(item_id, frequency).await?)
    }

    pub async fn apply(&self, item_id: i64, frequency: Frequency) -> Result<Reconciled> {
        let name = job_name(item_id);
        let args = serde_json::to_string(&[item_id])?;
        let existed = self.schedules.find_by_name(&name).await?.is_some();

        match period_for(frequency) {
            Period::Interval { every, unit } => {
                self.schedules
                    .upsert_interval(&name, PRICE_CHECK_TASK, every, unit, &args)
                    .await?
            }
            Period::Calendar(spec) => {
                self.schedules
                    .upsert_calendar(&name, PRICE_CHECK_TASK, spec, &args)
                    .await?
            }
        }

        let entry = self
            .schedules
            .find_by_name(&name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("schedule {} vanished after upsert", name))?;

        info!("{} {} ({})", if existed { "updated" } else { "created" }, name, entry.period);
        Ok(if existed {
            Reconciled::Updated(entry)
        } else {
            Reconciled::Created(entry)
        })
    }

    /// `false` when the item had no entry.
    pub async fn remove(&self, item_id: i64) -> Result<bool> {
        let name = job_name(item_id);
        let removed = self.schedules.delete(&name).await?;
        if removed {
            info!("removed {}", name);
        }
        Ok(removed)
    }
}
