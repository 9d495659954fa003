use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::FrequencyError;
use crate::scraper::cleaner::{normalize_price, NOT_FOUND};

// ── Price ─────────────────────────────────────────────────────────────────────

/// A price as displayed on the page together with its numeric value.
///
/// Only constructible from raw text, so `value` is always the normalizer's
/// reading of `display` and can never drift from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Price {
    display: String,
    value: Option<f64>,
}

impl Price {
    pub fn from_raw(raw: &str) -> Self {
        let normalized = normalize_price(raw);
        Self {
            display: normalized.display,
            value: normalized.value,
        }
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.display)
    }
}

// ── Extraction result ─────────────────────────────────────────────────────────

/// One extracted field: either the text found on the page or the `N/A` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldValue {
    Found(String),
    #[default]
    NotFound,
}

impl FieldValue {
    pub fn as_str(&self) -> &str {
        match self {
            FieldValue::Found(s) => s,
            FieldValue::NotFound => NOT_FOUND,
        }
    }

    pub fn found(&self) -> Option<&str> {
        match self {
            FieldValue::Found(s) => Some(s),
            FieldValue::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, FieldValue::Found(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Price,
    PreviousPrice,
    Description,
    Discount,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Price => "current_price",
            Field::PreviousPrice => "previous_price",
            Field::Description => "description",
            Field::Discount => "discount",
        }
    }

    pub fn is_price(self) -> bool {
        matches!(self, Field::Price | Field::PreviousPrice)
    }
}

/// Fields pulled from one page load. Never persisted as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub url: String,
    pub name: FieldValue,
    pub price: FieldValue,
    pub previous_price: FieldValue,
    pub description: FieldValue,
    pub discount: FieldValue,
}

impl ExtractionResult {
    pub fn empty(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn get_mut(&mut self, field: Field) -> &mut FieldValue {
        match field {
            Field::Name => &mut self.name,
            Field::Price => &mut self.price,
            Field::PreviousPrice => &mut self.previous_price,
            Field::Description => &mut self.description,
            Field::Discount => &mut self.discount,
        }
    }

    /// A result is worth saving only when both name and price resolved.
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.name.is_found() {
            missing.push(Field::Name.as_str());
        }
        if !self.price.is_found() {
            missing.push(Field::Price.as_str());
        }
        missing
    }
}

// ── Frequency & schedule periods ──────────────────────────────────────────────

/// How often a monitored item is re-scraped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Minutes,
    Hourly,
    Daily,
    Monthly,
    /// Explicit hour count (alternate integer mode).
    Hours(u32),
}

impl FromStr for Frequency {
    type Err = FrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "minutes" => Ok(Frequency::Minutes),
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "monthly" => Ok(Frequency::Monthly),
            other => match other.parse::<u32>() {
                Ok(hours) if hours > 0 => Ok(Frequency::Hours(hours)),
                _ => Err(FrequencyError::Unrecognised(s)),
            },
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Minutes => f.write_str("minutes"),
            Frequency::Hourly => f.write_str("hourly"),
            Frequency::Daily => f.write_str("daily"),
            Frequency::Monthly => f.write_str("monthly"),
            Frequency::Hours(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for Frequency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Minutes,
    Hours,
}

impl IntervalUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
        }
    }

    pub fn span(self, every: u32) -> Duration {
        match self {
            IntervalUnit::Minutes => Duration::minutes(i64::from(every)),
            IntervalUnit::Hours => Duration::hours(i64::from(every)),
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minutes" => Ok(IntervalUnit::Minutes),
            "hours" => Ok(IntervalUnit::Hours),
            other => Err(format!("unknown interval unit {:?}", other)),
        }
    }
}

/// Calendar trigger: fires when minute, hour and day-of-month all match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalendarSpec {
    pub minute: u32,
    pub hour: u32,
    pub day_of_month: u32,
}

impl CalendarSpec {
    /// 00:00 on the first day of every month.
    pub const MONTHLY: CalendarSpec = CalendarSpec {
        minute: 0,
        hour: 0,
        day_of_month: 1,
    };

    /// First firing strictly after `after`. Months lacking `day_of_month` are skipped.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let (mut year, mut month) = (after.year(), after.month());
        // 49 months always contains a valid day 1..=31
        for _ in 0..49 {
            let candidate = NaiveDate::from_ymd_opt(year, month, self.day_of_month)
                .and_then(|d| d.and_hms_opt(self.hour, self.minute, 0));
            if let Some(at) = candidate {
                if at > after {
                    return Some(at);
                }
            }
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
        None
    }
}

impl fmt::Display for CalendarSpec {
    /// Cron notation, e.g. `0 0 1 * *`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} * *", self.minute, self.hour, self.day_of_month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Period {
    Interval { every: u32, unit: IntervalUnit },
    Calendar(CalendarSpec),
}

impl Period {
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Period::Interval { every, unit } => after.checked_add_signed(unit.span(*every)),
            Period::Calendar(spec) => spec.next_after(after),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Interval { every, unit } => write!(f, "every {} {}", every, unit.as_str()),
            Period::Calendar(spec) => write!(f, "cron {}", spec),
        }
    }
}

// ── Schedule entry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub task: String,
    pub period: Period,
    /// JSON array of task arguments, e.g. `[42]`.
    pub args: String,
    pub enabled: bool,
    pub last_run_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ScheduleEntry {
    /// The item id carried as the first task argument.
    pub fn item_id(&self) -> Option<i64> {
        serde_json::from_str::<Vec<i64>>(&self.args)
            .ok()?
            .first()
            .copied()
    }

    pub fn next_run(&self) -> Option<NaiveDateTime> {
        self.period
            .next_after(self.last_run_at.unwrap_or(self.created_at))
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.enabled && self.next_run().is_some_and(|at| at <= now)
    }
}

// ── Monitored item ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoredItem {
    pub id: i64,
    pub user_identifier: String,
    pub url: String,
    pub name: String,
    pub current_price: Price,
    pub previous_price: Option<Price>,
    pub discount: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub frequency: Frequency,
    pub created_at: NaiveDateTime,
    pub last_checked_at: Option<NaiveDateTime>,
}

/// Fields for a record about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub user_identifier: String,
    pub url: String,
    pub name: String,
    pub current_price: Price,
    pub previous_price: Option<Price>,
    pub discount: Option<String>,
    pub description: Option<String>,
    pub frequency: Frequency,
}

impl NewItem {
    /// `None` when the extraction lacks a name or a current price.
    pub fn from_extraction(
        user_identifier: &str,
        result: &ExtractionResult,
        frequency: Frequency,
    ) -> Option<Self> {
        let name = result.name.found()?;
        let current_price = Price::from_raw(result.price.found()?);

        Some(Self {
            user_identifier: user_identifier.to_string(),
            url: result.url.clone(),
            name: name.to_string(),
            current_price,
            previous_price: result.previous_price.found().map(Price::from_raw),
            discount: result.discount.found().map(str::to_string),
            description: result.description.found().map(str::to_string),
            frequency,
        })
    }
}

/// Narrows a record listing. Every bound is inclusive; `None` leaves that
/// side open. Price bounds apply to the numeric current price, so records
/// whose price has no value never match one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilter {
    pub user_identifier: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub created_from: Option<NaiveDateTime>,
    pub created_to: Option<NaiveDateTime>,
}

impl ItemFilter {
    pub fn for_user(user: &str) -> Self {
        Self {
            user_identifier: Some(user.to_string()),
            ..Self::default()
        }
    }
}

/// The only mutations an existing record accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemUpdate {
    Prices {
        current: Price,
        previous: Option<Price>,
        discount: Option<String>,
    },
    Frequency(Frequency),
    Active(bool),
}

// ── Run log ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Preview,
    SaveAndAutomate,
    Scheduled,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Preview => "preview",
            RunMode::SaveAndAutomate => "save_and_automate",
            RunMode::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub correlation_id: String,
    pub mode: RunMode,
    pub item_id: Option<i64>,
    pub url: Option<String>,
    pub outcome: String,
    pub error: Option<String>,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub items: i64,
    pub active_items: i64,
    pub schedules: i64,
    pub runs: i64,
    pub failed_runs: i64,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!("minutes".parse::<Frequency>().unwrap(), Frequency::Minutes);
        assert_eq!(" Daily ".parse::<Frequency>().unwrap(), Frequency::Daily);
        assert_eq!("6".parse::<Frequency>().unwrap(), Frequency::Hours(6));
        assert!("weekly".parse::<Frequency>().is_err());
        assert!("0".parse::<Frequency>().is_err());
        assert!("-3".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_frequency_display_round_trips() {
        for f in [
            Frequency::Minutes,
            Frequency::Hourly,
            Frequency::Daily,
            Frequency::Monthly,
            Frequency::Hours(12),
        ] {
            assert_eq!(f.to_string().parse::<Frequency>().unwrap(), f);
        }
    }

    #[test]
    fn test_price_value_follows_display() {
        let p = Price::from_raw("₦ 45,000.00");
        assert_eq!(p.display(), "₦ 45,000.00");
        assert_eq!(p.value(), Some(45000.0));

        let missing = Price::from_raw("call for price");
        assert_eq!(missing.display(), "N/A");
        assert_eq!(missing.value(), None);
    }

    #[test]
    fn test_monthly_calendar_next_after() {
        let spec = CalendarSpec::MONTHLY;
        assert_eq!(spec.to_string(), "0 0 1 * *");
        assert_eq!(spec.next_after(at(2026, 10, 17, 9, 30)), Some(at(2026, 11, 1, 0, 0)));
        assert_eq!(spec.next_after(at(2026, 12, 5, 0, 0)), Some(at(2027, 1, 1, 0, 0)));
        // exactly on the boundary moves to the following month
        assert_eq!(spec.next_after(at(2026, 11, 1, 0, 0)), Some(at(2026, 12, 1, 0, 0)));
    }

    #[test]
    fn test_calendar_skips_short_months() {
        let spec = CalendarSpec { minute: 0, hour: 0, day_of_month: 31 };
        assert_eq!(spec.next_after(at(2026, 4, 1, 0, 0)), Some(at(2026, 5, 31, 0, 0)));
    }

    #[test]
    fn test_schedule_entry_due() {
        let created = at(2026, 10, 17, 8, 0);
        let entry = ScheduleEntry {
            name: "update_item_7".into(),
            task: "pricewatch.price_check".into(),
            period: Period::Interval { every: 1, unit: IntervalUnit::Hours },
            args: "[7]".into(),
            enabled: true,
            last_run_at: None,
            created_at: created,
            updated_at: created,
        };
        assert_eq!(entry.item_id(), Some(7));
        assert!(!entry.is_due(at(2026, 10, 17, 8, 59)));
        assert!(entry.is_due(at(2026, 10, 17, 9, 0)));

        let disabled = ScheduleEntry { enabled: false, ..entry };
        assert!(!disabled.is_due(at(2026, 10, 18, 0, 0)));
    }

    #[test]
    fn test_new_item_requires_name_and_price() {
        let mut result = ExtractionResult::empty("https://shop.example/p/1");
        result.price = FieldValue::Found("₦ 1,000".into());
        assert!(NewItem::from_extraction("u1", &result, Frequency::Daily).is_none());
        assert_eq!(result.missing_fields(), vec!["name"]);

        result.name = FieldValue::Found("Kettle".into());
        let item = NewItem::from_extraction("u1", &result, Frequency::Daily).unwrap();
        assert_eq!(item.current_price.value(), Some(1000.0));
        assert_eq!(item.previous_price, None);
        assert_eq!(item.description, None);
    }
}
