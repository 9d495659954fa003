use crate::models::{
    CalendarSpec, IntervalUnit, ItemFilter, ItemUpdate, MonitoredItem, NewItem, Period, Price,
    RunLogEntry, ScheduleEntry, StoreStats,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use duckdb::{params, Connection, OptionalExt, Row, ToSql};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

// ── Store interfaces ──────────────────────────────────────────────────────────

/// Monitored item records, as seen by the pipeline.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<MonitoredItem>>;
    async fn create(&self, item: &NewItem) -> Result<MonitoredItem>;
    /// `false` when no record with `id` exists.
    async fn update(&self, id: i64, update: &ItemUpdate) -> Result<bool>;
    async fn delete(&self, id: i64) -> Result<bool>;
    async fn list(&self, filter: &ItemFilter) -> Result<Vec<MonitoredItem>>;
    async fn log_run(&self, entry: &RunLogEntry) -> Result<()>;
    async fn stats(&self) -> Result<StoreStats>;
}

/// Recurring job definitions, keyed by unique name.
///
/// Both upserts are a single statement against the name, so concurrent calls
/// for one item converge on one entry.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<ScheduleEntry>>;
    async fn upsert_interval(
        &self,
        name: &str,
        task: &str,
        every: u32,
        unit: IntervalUnit,
        args: &str,
    ) -> Result<()>;
    async fn upsert_calendar(
        &self,
        name: &str,
        task: &str,
        spec: CalendarSpec,
        args: &str,
    ) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<ScheduleEntry>>;
    async fn mark_run(&self, name: &str, at: NaiveDateTime) -> Result<bool>;
}

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS monitored_items_id_seq START 1;
CREATE SEQUENCE IF NOT EXISTS scrape_runs_id_seq START 1;

CREATE TABLE IF NOT EXISTS monitored_items (
    id               BIGINT PRIMARY KEY DEFAULT nextval('monitored_items_id_seq'),
    user_identifier  VARCHAR NOT NULL,
    url              VARCHAR NOT NULL,
    product_name     VARCHAR NOT NULL,
    -- display text as scraped; *_value is derived from it on every write
    current_price    VARCHAR NOT NULL,
    price_value      DOUBLE,
    previous_price   VARCHAR,
    previous_value   DOUBLE,
    discount         VARCHAR,
    description      VARCHAR,
    is_active        BOOLEAN NOT NULL DEFAULT TRUE,
    update_frequency VARCHAR NOT NULL,
    created_at       TIMESTAMP NOT NULL,
    last_checked_at  TIMESTAMP
);

CREATE TABLE IF NOT EXISTS schedule_entries (
    name             VARCHAR PRIMARY KEY,
    task             VARCHAR NOT NULL,
    kind             VARCHAR NOT NULL,   -- 'interval' | 'calendar'
    every            BIGINT,
    unit             VARCHAR,
    cal_minute       BIGINT,
    cal_hour         BIGINT,
    cal_day_of_month BIGINT,
    args             VARCHAR NOT NULL,
    enabled          BOOLEAN NOT NULL DEFAULT TRUE,
    last_run_at      TIMESTAMP,
    created_at       TIMESTAMP NOT NULL,
    updated_at       TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS scrape_runs (
    id              BIGINT PRIMARY KEY DEFAULT nextval('scrape_runs_id_seq'),
    correlation_id  VARCHAR NOT NULL,
    mode            VARCHAR NOT NULL,
    item_id         BIGINT,
    url             VARCHAR,
    outcome         VARCHAR NOT NULL,
    error_msg       VARCHAR,
    started_at      TIMESTAMP NOT NULL,
    finished_at     TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_items_user ON monitored_items (user_identifier);
CREATE INDEX IF NOT EXISTS idx_runs_item  ON scrape_runs (item_id);
"#;

const ITEM_COLUMNS: &str = "id, user_identifier, url, product_name, current_price, \
     previous_price, discount, description, is_active, update_frequency, created_at, \
     last_checked_at";

const SCHEDULE_COLUMNS: &str = "name, task, kind, every, unit, cal_minute, cal_hour, \
     cal_day_of_month, args, enabled, last_run_at, created_at, updated_at";

// ── Row mapping ───────────────────────────────────────────────────────────────

struct ItemRow {
    id: i64,
    user_identifier: String,
    url: String,
    name: String,
    current_price: String,
    previous_price: Option<String>,
    discount: Option<String>,
    description: Option<String>,
    is_active: bool,
    frequency: String,
    created_at: NaiveDateTime,
    last_checked_at: Option<NaiveDateTime>,
}

impl ItemRow {
    fn read(r: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            user_identifier: r.get(1)?,
            url: r.get(2)?,
            name: r.get(3)?,
            current_price: r.get(4)?,
            previous_price: r.get(5)?,
            discount: r.get(6)?,
            description: r.get(7)?,
            is_active: r.get(8)?,
            frequency: r.get(9)?,
            created_at: r.get(10)?,
            last_checked_at: r.get(11)?,
        })
    }

    fn into_item(self) -> Result<MonitoredItem> {
        let frequency = self
            .frequency
            .parse()
            .with_context(|| format!("item {} has a corrupt frequency", self.id))?;

        Ok(MonitoredItem {
            id: self.id,
            user_identifier: self.user_identifier,
            url: self.url,
            name: self.name,
            current_price: Price::from_raw(&self.current_price),
            previous_price: self.previous_price.as_deref().map(Price::from_raw),
            discount: self.discount,
            description: self.description,
            is_active: self.is_active,
            frequency,
            created_at: self.created_at,
            last_checked_at: self.last_checked_at,
        })
    }
}

struct ScheduleRow {
    name: String,
    task: String,
    kind: String,
    every: Option<i64>,
    unit: Option<String>,
    cal_minute: Option<i64>,
    cal_hour: Option<i64>,
    cal_day_of_month: Option<i64>,
    args: String,
    enabled: bool,
    last_run_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl ScheduleRow {
    fn read(r: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            name: r.get(0)?,
            task: r.get(1)?,
            kind: r.get(2)?,
            every: r.get(3)?,
            unit: r.get(4)?,
            cal_minute: r.get(5)?,
            cal_hour: r.get(6)?,
            cal_day_of_month: r.get(7)?,
            args: r.get(8)?,
            enabled: r.get(9)?,
            last_run_at: r.get(10)?,
            created_at: r.get(11)?,
            updated_at: r.get(12)?,
        })
    }

    fn into_entry(self) -> Result<ScheduleEntry> {
        let period = match self.kind.as_str() {
            "interval" => Period::Interval {
                every: to_u32(self.every, "every")?,
                unit: self
                    .unit
                    .as_deref()
                    .context("interval entry without unit")?
                    .parse()
                    .map_err(|e: String| anyhow!(e))?,
            },
            "calendar" => Period::Calendar(CalendarSpec {
                minute: to_u32(self.cal_minute, "cal_minute")?,
                hour: to_u32(self.cal_hour, "cal_hour")?,
                day_of_month: to_u32(self.cal_day_of_month, "cal_day_of_month")?,
            }),
            other => bail!("schedule {} has unknown kind {:?}", self.name, other),
        };

        Ok(ScheduleEntry {
            name: self.name,
            task: self.task,
            period,
            args: self.args,
            enabled: self.enabled,
            last_run_at: self.last_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn to_u32(v: Option<i64>, column: &str) -> Result<u32> {
    let v = v.with_context(|| format!("{} is NULL", column))?;
    u32::try_from(v).with_context(|| format!("{} out of range: {}", column, v))
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn()?;
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute_batch(INDEXES).context("Index creation failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Items ─────────────────────────────────────────────────────────────────

    pub fn create_item(&self, item: &NewItem) -> Result<MonitoredItem> {
        let conn = self.conn()?;
        let id: i64 = conn
            .query_row(
                r#"INSERT INTO monitored_items
                       (user_identifier, url, product_name, current_price, price_value,
                        previous_price, previous_value, discount, description, is_active,
                        update_frequency, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, TRUE, ?, ?)
                   RETURNING id"#,
                params![
                    item.user_identifier,
                    item.url,
                    item.name,
                    item.current_price.display(),
                    item.current_price.value(),
                    item.previous_price.as_ref().map(Price::display),
                    item.previous_price.as_ref().and_then(Price::value),
                    item.discount.as_deref(),
                    item.description.as_deref(),
                    item.frequency.to_string(),
                    Utc::now().naive_utc(),
                ],
                |r| r.get(0),
            )
            .with_context(|| format!("insert item for {}", item.url))?;

        fetch_item(&conn, id)?.with_context(|| format!("item {} missing after insert", id))
    }

    pub fn get_item(&self, id: i64) -> Result<Option<MonitoredItem>> {
        fetch_item(&*self.conn()?, id)
    }

    pub fn update_item(&self, id: i64, update: &ItemUpdate) -> Result<bool> {
        let conn = self.conn()?;
        let changed = match update {
            ItemUpdate::Prices {
                current,
                previous,
                discount,
            } => conn.execute(
                r#"UPDATE monitored_items SET
                       current_price = ?, price_value = ?,
                       previous_price = ?, previous_value = ?,
                       discount = ?, last_checked_at = ?
                   WHERE id = ?"#,
                params![
                    current.display(),
                    current.value(),
                    previous.as_ref().map(Price::display),
                    previous.as_ref().and_then(Price::value),
                    discount.as_deref(),
                    Utc::now().naive_utc(),
                    id,
                ],
            ),
            ItemUpdate::Frequency(frequency) => conn.execute(
                "UPDATE monitored_items SET update_frequency = ? WHERE id = ?",
                params![frequency.to_string(), id],
            ),
            ItemUpdate::Active(active) => conn.execute(
                "UPDATE monitored_items SET is_active = ? WHERE id = ?",
                params![*active, id],
            ),
        }
        .with_context(|| format!("update item {}", id))?;
        Ok(changed > 0)
    }

    pub fn delete_item(&self, id: i64) -> Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM monitored_items WHERE id = ?", params![id])?;
        Ok(n > 0)
    }

    pub fn list_items(&self, filter: &ItemFilter) -> Result<Vec<MonitoredItem>> {
        let mut conditions = Vec::new();
        let mut args: Vec<&dyn ToSql> = Vec::new();

        if let Some(user) = &filter.user_identifier {
            conditions.push("user_identifier = ?");
            args.push(user);
        }
        if let Some(min) = &filter.min_price {
            conditions.push("price_value >= ?");
            args.push(min);
        }
        if let Some(max) = &filter.max_price {
            conditions.push("price_value <= ?");
            args.push(max);
        }
        if let Some(from) = &filter.created_from {
            conditions.push("created_at >= ?");
            args.push(from);
        }
        if let Some(to) = &filter.created_to {
            conditions.push("created_at <= ?");
            args.push(to);
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM monitored_items {} ORDER BY id",
            ITEM_COLUMNS, where_clause
        ))?;
        let rows = stmt
            .query_map(args.as_slice(), ItemRow::read)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    // ── Schedule entries ──────────────────────────────────────────────────────

    pub fn find_schedule(&self, name: &str) -> Result<Option<ScheduleEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedule_entries WHERE name = ?",
            SCHEDULE_COLUMNS
        ))?;
        stmt.query_row(params![name], ScheduleRow::read)
            .optional()?
            .map(ScheduleRow::into_entry)
            .transpose()
    }

    /// Insert or replace the period of the entry called `name` in one statement.
    pub fn upsert_schedule(&self, name: &str, task: &str, period: &Period, args: &str) -> Result<()> {
        let (kind, every, unit, cal) = match period {
            Period::Interval { every, unit } => {
                ("interval", Some(i64::from(*every)), Some(unit.as_str()), None)
            }
            Period::Calendar(spec) => ("calendar", None, None, Some(*spec)),
        };
        let now = Utc::now().naive_utc();

        self.conn()?
            .execute(
                r#"INSERT INTO schedule_entries
                       (name, task, kind, every, unit, cal_minute, cal_hour, cal_day_of_month,
                        args, enabled, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, TRUE, ?, ?)
                   ON CONFLICT (name) DO UPDATE SET
                       task             = excluded.task,
                       kind             = excluded.kind,
                       every            = excluded.every,
                       unit             = excluded.unit,
                       cal_minute       = excluded.cal_minute,
                       cal_hour         = excluded.cal_hour,
                       cal_day_of_month = excluded.cal_day_of_month,
                       args             = excluded.args,
                       enabled          = TRUE,
                       updated_at       = excluded.updated_at"#,
                params![
                    name,
                    task,
                    kind,
                    every,
                    unit,
                    cal.map(|c| i64::from(c.minute)),
                    cal.map(|c| i64::from(c.hour)),
                    cal.map(|c| i64::from(c.day_of_month)),
                    args,
                    now,
                    now,
                ],
            )
            .with_context(|| format!("upsert schedule {}", name))?;
        Ok(())
    }

    pub fn delete_schedule(&self, name: &str) -> Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM schedule_entries WHERE name = ?", params![name])?;
        Ok(n > 0)
    }

    pub fn list_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedule_entries ORDER BY name",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], ScheduleRow::read)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        rows.into_iter().map(ScheduleRow::into_entry).collect()
    }

    pub fn mark_schedule_run(&self, name: &str, at: NaiveDateTime) -> Result<bool> {
        let n = self.conn()?.execute(
            "UPDATE schedule_entries SET last_run_at = ? WHERE name = ?",
            params![at, name],
        )?;
        Ok(n > 0)
    }

    // ── Scrape run log ────────────────────────────────────────────────────────

    pub fn log_run(&self, entry: &RunLogEntry) -> Result<()> {
        self.conn()?.execute(
            r#"INSERT INTO scrape_runs
                   (correlation_id, mode, item_id, url, outcome, error_msg, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                entry.correlation_id,
                entry.mode.as_str(),
                entry.item_id,
                entry.url,
                entry.outcome,
                entry.error,
                entry.started_at,
                entry.finished_at,
            ],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
        Ok(StoreStats {
            items: count("SELECT COUNT(*) FROM monitored_items")?,
            active_items: count("SELECT COUNT(*) FROM monitored_items WHERE is_active")?,
            schedules: count("SELECT COUNT(*) FROM schedule_entries")?,
            runs: count("SELECT COUNT(*) FROM scrape_runs")?,
            failed_runs: count("SELECT COUNT(*) FROM scrape_runs WHERE error_msg IS NOT NULL")?,
        })
    }
}

fn fetch_item(conn: &Connection, id: i64) -> Result<Option<MonitoredItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM monitored_items WHERE id = ?",
        ITEM_COLUMNS
    ))?;
    stmt.query_row(params![id], ItemRow::read)
        .optional()?
        .map(ItemRow::into_item)
        .transpose()
}

// ── Trait impls ───────────────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for Repository {
    async fn get(&self, id: i64) -> Result<Option<MonitoredItem>> {
        self.get_item(id)
    }

    async fn create(&self, item: &NewItem) -> Result<MonitoredItem> {
        self.create_item(item)
    }

    async fn update(&self, id: i64, update: &ItemUpdate) -> Result<bool> {
        self.update_item(id, update)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        self.delete_item(id)
    }

    async fn list(&self, filter: &ItemFilter) -> Result<Vec<MonitoredItem>> {
        self.list_items(filter)
    }

    async fn log_run(&self, entry: &RunLogEntry) -> Result<()> {
        Repository::log_run(self, entry)
    }

    async fn stats(&self) -> Result<StoreStats> {
        Repository::stats(self)
    }
}

#[async_trait]
impl ScheduleStore for Repository {
    async fn find_by_name(&self, name: &str) -> Result<Option<ScheduleEntry>> {
        self.find_schedule(name)
    }

    async fn upsert_interval(
        &self,
        name: &str,
        task: &str,
        every: u32,
        unit: IntervalUnit,
        args: &str,
    ) -> Result<()> {
        self.upsert_schedule(name, task, &Period::Interval { every, unit }, args)
    }

    async fn upsert_calendar(
        &self,
        name: &str,
        task: &str,
        spec: CalendarSpec,
        args: &str,
    ) -> Result<()> {
        self.upsert_schedule(name, task, &Period::Calendar(spec), args)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.delete_schedule(name)
    }

    async fn list(&self) -> Result<Vec<ScheduleEntry>> {
        self.list_schedules()
    }

    async fn mark_run(&self, name: &str, at: NaiveDateTime) -> Result<bool> {
        self.mark_schedule_run(name, at)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
