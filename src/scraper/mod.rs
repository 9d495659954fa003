pub mod cleaner;
pub mod strategies;

use scraper::{Html, Selector};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::browser::LoadedPage;
use crate::config::BrowserConfig;
use crate::context::RunContext;
use crate::models::{ExtractionResult, Field, FieldValue};

use self::cleaner::{
    derive_discount, normalize_discount, normalize_price, parse_amount, squash_whitespace,
};
use self::strategies::{FieldPlan, Mode, Strategy, DEFAULT_PLANS};

const PRICE_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ── Engine ────────────────────────────────────────────────────────────────────

/// Walks each field's strategy chain against a loaded page.
///
/// Fields are independent: a field whose chain is exhausted becomes `N/A` and
/// the remaining fields are still resolved. Strategy failures are logged and
/// skipped, never returned.
pub struct Extractor {
    plans: &'static [FieldPlan],
    price_wait: Duration,
}

impl Extractor {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            plans: DEFAULT_PLANS,
            price_wait: Duration::from_secs(config.price_wait_timeout_secs),
        }
    }

    #[cfg(test)]
    pub fn with_plans(mut self, plans: &'static [FieldPlan]) -> Self {
        self.plans = plans;
        self
    }

    #[cfg(test)]
    pub fn with_price_wait(mut self, wait: Duration) -> Self {
        self.price_wait = wait;
        self
    }

    pub async fn extract(
        &self,
        page: &dyn LoadedPage,
        url: &str,
        ctx: &RunContext,
    ) -> ExtractionResult {
        let mut result = ExtractionResult::empty(url);
        let mut snapshot: Option<Snapshot> = None;

        for plan in self.plans {
            let value = self.resolve(plan, page, &mut snapshot, ctx).await;
            if !value.is_found() {
                debug!("run {}: {} not found", ctx.id, plan.field.as_str());
            }
            *result.get_mut(plan.field) = value;
        }

        if !result.discount.is_found() {
            let current = result.price.found().and_then(parse_amount);
            let previous = result.previous_price.found().and_then(parse_amount);
            if let (Some(current), Some(previous)) = (current, previous) {
                if let Some(discount) = derive_discount(current, previous) {
                    result.discount = FieldValue::Found(discount);
                }
            }
        }

        result
    }

    async fn resolve(
        &self,
        plan: &FieldPlan,
        page: &dyn LoadedPage,
        snapshot: &mut Option<Snapshot>,
        ctx: &RunContext,
    ) -> FieldValue {
        for (idx, strategy) in plan.strategies.iter().enumerate() {
            let candidate = match strategy {
                Strategy::Script(selectors) => match page.first_text(selectors).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("run {}: {} script failed: {:#}", ctx.id, plan.field.as_str(), e);
                        continue;
                    }
                },
                Strategy::AwaitPrice => self.await_price(page, ctx).await,
                Strategy::Select { .. } => {
                    if snapshot.is_none() {
                        *snapshot = Some(self.capture(page, ctx).await);
                    }
                    match snapshot.as_ref().and_then(|s| s.hits.get(&(plan.field, idx))) {
                        Some(Ok(text)) => text.clone(),
                        Some(Err(e)) => {
                            warn!("run {}: {} skipped: {}", ctx.id, strategy.describe(), e);
                            continue;
                        }
                        None => None,
                    }
                }
            };

            if let Some(value) = candidate.and_then(|raw| accept(plan.field, &raw)) {
                debug!(
                    "run {}: {} = {:?} via {}",
                    ctx.id,
                    plan.field.as_str(),
                    value,
                    strategy.describe()
                );
                return FieldValue::Found(value);
            }
        }
        FieldValue::NotFound
    }

    /// Poll until a price-looking element renders. Expiry only ends this strategy.
    async fn await_price(&self, page: &dyn LoadedPage, ctx: &RunContext) -> Option<String> {
        let probe = async {
            loop {
                match page.price_like_text().await {
                    Ok(Some(text)) => return Some(text),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("run {}: price probe failed: {:#}", ctx.id, e);
                        return None;
                    }
                }
                tokio::time::sleep(PRICE_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(self.price_wait, probe).await {
            Ok(found) => found,
            Err(_) => {
                debug!("run {}: no price element within {:?}", ctx.id, self.price_wait);
                None
            }
        }
    }

    async fn capture(&self, page: &dyn LoadedPage, ctx: &RunContext) -> Snapshot {
        match page.html().await {
            Ok(html) => Snapshot::capture(&html, self.plans),
            Err(e) => {
                warn!("run {}: could not read rendered html: {:#}", ctx.id, e);
                Snapshot::default()
            }
        }
    }
}

/// Turn a strategy's raw text into the field's value, or reject it.
fn accept(field: Field, raw: &str) -> Option<String> {
    match field {
        f if f.is_price() => {
            let price = normalize_price(raw);
            price.value.map(|_| price.display)
        }
        Field::Discount => normalize_discount(raw),
        _ => {
            let text = squash_whitespace(raw);
            (!text.is_empty()).then_some(text)
        }
    }
}

// ── Document snapshot ─────────────────────────────────────────────────────────

/// Results of every structured selector against one parse of the document.
///
/// `scraper::Html` is not `Send`, so the parsed tree never outlives `capture`.
#[derive(Default)]
struct Snapshot {
    hits: HashMap<(Field, usize), Result<Option<String>, String>>,
}

impl Snapshot {
    fn capture(html: &str, plans: &[FieldPlan]) -> Self {
        let doc = Html::parse_document(html);
        let mut hits = HashMap::new();

        for plan in plans {
            for (idx, strategy) in plan.strategies.iter().enumerate() {
                if let Strategy::Select { css, mode } = strategy {
                    hits.insert((plan.field, idx), select_first(&doc, css, *mode));
                }
            }
        }

        Self { hits }
    }
}

/// First non-empty value among the elements matching `css`.
fn select_first(doc: &Html, css: &str, mode: Mode) -> Result<Option<String>, String> {
    let selector = Selector::parse(css).map_err(|e| format!("invalid selector {:?}: {:?}", css, e))?;

    for el in doc.select(&selector) {
        let text = match mode {
            Mode::Text => squash_whitespace(&el.text().collect::<Vec<_>>().join(" ")),
            Mode::Attr(name) => el.value().attr(name).map(squash_whitespace).unwrap_or_default(),
        };
        if !text.is_empty() {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
