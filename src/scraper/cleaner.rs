//! Price text normalisation.
//!
//! Pages render prices as anything from `₦ 45,000.00` to `N45,000 3 items left`.
//! `normalize_price` reduces that to one display string and a numeric value.

use regex::Regex;
use std::sync::LazyLock;

/// Placeholder for a field that could not be located on the page.
pub const NOT_FOUND: &str = "N/A";

const CURRENCY_MARKERS: [char; 5] = ['₦', '$', '€', '£', '₹'];

/// Some merchants write the naira sign as a plain `N` in front of the amount.
static NAIRA_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"N(\s?\d)").expect("naira regex"));

/// Optional currency marker, digits with `,` group separators, at most one decimal point.
static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[₦$€£₹]\s?)?\d+(?:,\d+)*(?:\.\d+)?").expect("amount regex")
});

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s?%").expect("percent regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPrice {
    pub display: String,
    pub value: Option<f64>,
}

impl NormalizedPrice {
    fn not_found() -> Self {
        Self {
            display: NOT_FOUND.to_string(),
            value: None,
        }
    }
}

// ── Normaliser ────────────────────────────────────────────────────────────────

/// Normalise raw price text.
///
/// Of all amounts in the text the shortest wins (first one on ties): longer
/// matches tend to be a price glued to an unrelated number such as a quantity.
/// "Buy 3 for ₦1,299.00" → "3" | "N 45,000.00" → "₦ 45,000.00" → 45000.0
pub fn normalize_price(raw: &str) -> NormalizedPrice {
    let text = canonicalize(raw.trim());
    if text.is_empty() {
        return NormalizedPrice::not_found();
    }

    let shortest = AMOUNT
        .find_iter(&text)
        .map(|m| m.as_str().trim())
        .enumerate()
        .min_by_key(|(i, m)| (m.chars().count(), *i))
        .map(|(_, m)| m);

    match shortest {
        Some(amount) => NormalizedPrice {
            display: amount.to_string(),
            value: parse_amount(amount),
        },
        None => NormalizedPrice::not_found(),
    }
}

/// Rewrite the letter form of the naira sign and collapse doubled markers.
fn canonicalize(s: &str) -> String {
    let mut out = NAIRA_LETTER.replace_all(s, "₦$1").into_owned();
    for marker in CURRENCY_MARKERS {
        let doubled: String = [marker, marker].iter().collect();
        while out.contains(&doubled) {
            out = out.replace(&doubled, &marker.to_string());
        }
    }
    out
}

/// Parse an amount: keep digits and the decimal point, drop everything else.
/// "₦ 1,234.56" → 1234.56 | "610" → 610.0
pub fn parse_amount(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

// ── Discounts ─────────────────────────────────────────────────────────────────

/// Badge text such as "-25%" or "Save 25 %" → "-25%".
pub fn normalize_discount(raw: &str) -> Option<String> {
    let caps = PERCENT.captures(raw)?;
    let pct: f64 = caps.get(1)?.as_str().parse().ok()?;
    if pct <= 0.0 || pct >= 100.0 {
        return None;
    }
    Some(format!("-{}%", caps.get(1)?.as_str()))
}

/// Whole-percent discount implied by a struck-through price.
pub fn derive_discount(current: f64, previous: f64) -> Option<String> {
    if previous <= 0.0 || current >= previous {
        return None;
    }
    let pct = ((previous - current) / previous * 100.0).round();
    if pct < 1.0 {
        return None;
    }
    Some(format!("-{}%", pct as i64))
}

/// Collapse runs of whitespace into single spaces.
pub fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "₦ 45,000.00",
        "N45,000",
        "₦₦ 12,500",
        "  $1,299.99 ",
        "Buy 3 for ₦1,299.00",
        "NGN 7,450.50",
        "€ 89.90 incl. VAT",
        "out of stock",
        "",
        "1.299.00",
    ];

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in SAMPLES {
            let once = normalize_price(raw);
            let twice = normalize_price(&once.display);
            assert_eq!(once, twice, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_shortest_match_wins() {
        let p = normalize_price("Buy 3 for 1,299.00");
        assert_eq!(p.display, "3");
        assert_eq!(p.value, Some(3.0));
    }

    #[test]
    fn test_first_match_wins_on_tie() {
        let p = normalize_price("was 450 now 399");
        assert_eq!(p.display, "450");
    }

    #[test]
    fn test_naira_letter_and_doubled_sign() {
        assert_eq!(normalize_price("N45,000").display, "₦45,000");
        assert_eq!(normalize_price("₦₦ 12,500").display, "₦ 12,500");
        assert_eq!(normalize_price("NGN 7,450.50").value, Some(7450.5));
    }

    #[test]
    fn test_group_separators_removed() {
        let p = normalize_price("₦ 45,000.00");
        assert_eq!(p.display, "₦ 45,000.00");
        assert_eq!(p.value, Some(45000.0));
    }

    #[test]
    fn test_no_amount_is_sentinel() {
        for raw in ["", "   ", "out of stock", "N/A", "..."] {
            let p = normalize_price(raw);
            assert_eq!(p.display, NOT_FOUND);
            assert_eq!(p.value, None);
        }
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("₦ 1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("610"), Some(610.0));
        assert_eq!(parse_amount("₦"), None);
    }

    #[test]
    fn test_discounts() {
        assert_eq!(normalize_discount("-25%"), Some("-25%".to_string()));
        assert_eq!(normalize_discount("Save 12.5 %"), Some("-12.5%".to_string()));
        assert_eq!(normalize_discount("free shipping"), None);
        assert_eq!(derive_discount(75.0, 100.0), Some("-25%".to_string()));
        assert_eq!(derive_discount(100.0, 100.0), None);
        assert_eq!(derive_discount(120.0, 100.0), None);
    }

    #[test]
    fn test_squash_whitespace() {
        assert_eq!(squash_whitespace("  Fast\n\n  kettle\t 2L "), "Fast kettle 2L");
    }
}
