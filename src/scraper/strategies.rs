//! Extraction strategies: one ordered chain per field.
//!
//! Chains are plain data. The engine walks each chain in order and keeps the
//! first strategy that produces usable text, so adding a merchant convention
//! means adding a line here.

use crate::models::Field;

/// How a structured selector reads its match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Visible text of the element.
    Text,
    /// Value of the named attribute.
    Attr(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// OR-combined selector group evaluated inside the live page.
    Script(&'static str),
    /// Bounded wait for an element that looks like a rendered price.
    AwaitPrice,
    /// Selector evaluated against the parsed document snapshot.
    Select { css: &'static str, mode: Mode },
}

impl Strategy {
    pub fn describe(&self) -> String {
        match self {
            Strategy::Script(_) => "script".to_string(),
            Strategy::AwaitPrice => "await-price".to_string(),
            Strategy::Select { css, mode: Mode::Text } => format!("select {}", css),
            Strategy::Select { css, mode: Mode::Attr(attr) } => format!("select {} @{}", css, attr),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldPlan {
    pub field: Field,
    pub strategies: &'static [Strategy],
}

const fn text(css: &'static str) -> Strategy {
    Strategy::Select { css, mode: Mode::Text }
}

const fn attr(css: &'static str, name: &'static str) -> Strategy {
    Strategy::Select { css, mode: Mode::Attr(name) }
}

/// Price conventions seen across Amazon, Jumia, Konga and generic storefronts.
pub const PRICE_SCRIPT_SELECTORS: &str = "span.a-price-whole, span.a-offscreen, span.price, \
     p.price, div.product-price, [itemprop=\"price\"], [class*=\"price\"], .-b.-ltr.-tal.-fs24, \
     .price-box, .-b.-ltr.-tal, .price, .prc";

const PRICE: &[Strategy] = &[
    Strategy::Script(PRICE_SCRIPT_SELECTORS),
    Strategy::AwaitPrice,
    text("span.a-price-whole"),
    text("span.a-offscreen"),
    text("span.price"),
    text("p.price"),
    text("div.product-price"),
    text(".-b.-ltr.-tal.-fs24"),
    text(".prc"),
    attr("meta[itemprop='price']", "content"),
    attr("meta[property='product:price:amount']", "content"),
];

const PREVIOUS_PRICE: &[Strategy] = &[
    text("span.a-text-strike"),
    text("span.a-price.a-text-price span.a-offscreen"),
    text("div.slashed-price"),
    text(".old-price"),
    text(".-tal.-gy5.-l.-fs16"),
    text("del"),
];

const DISCOUNT: &[Strategy] = &[
    text("span.bdg._dsct"),
    text("span.savingsPercentage"),
    text("[class*='discount']"),
];

const NAME: &[Strategy] = &[
    text("span#productTitle"),
    text("h1"),
    text("h2.product-title"),
    text("h1.product_name"),
    text(".product-name"),
    text(".-fs20.-pts.-pbxs"),
    attr("meta[property='og:title']", "content"),
];

const DESCRIPTION: &[Strategy] = &[
    text("div#feature-bullets ul"),
    text("div.product-description"),
    text("p.description"),
    attr("meta[name='description']", "content"),
    attr("meta[property='og:description']", "content"),
];

/// Price fields come first so their bounded wait lets late widgets render
/// before the document snapshot is taken.
pub const DEFAULT_PLANS: &[FieldPlan] = &[
    FieldPlan { field: Field::Price, strategies: PRICE },
    FieldPlan { field: Field::PreviousPrice, strategies: PREVIOUS_PRICE },
    FieldPlan { field: Field::Discount, strategies: DISCOUNT },
    FieldPlan { field: Field::Name, strategies: NAME },
    FieldPlan { field: Field::Description, strategies: DESCRIPTION },
];
