//! Price recommendation from cost, margin and competitor prices.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Positioning {
    /// No competitor prices were available.
    MarginOnly,
    WithinMarket,
    /// The margin target is above every competitor.
    Premium,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub price: f64,
    pub positioning: Positioning,
    pub reason: String,
}

/// Lowest price that still earns `margin_percent` over `cost`.
pub fn min_target_price(cost: f64, margin_percent: f64) -> f64 {
    cost * (1.0 + margin_percent / 100.0)
}

fn bounds(prices: &[f64]) -> Option<(f64, f64)> {
    prices.iter().copied().fold(None, |acc, p| match acc {
        None => Some((p, p)),
        Some((lo, hi)) => Some((lo.min(p), hi.max(p))),
    })
}

/// Suggest a selling price.
///
/// The margin target is the floor. When competitors charge at least that much
/// the suggestion moves up to their midpoint but never past the highest
/// competitor; otherwise the target itself is suggested as a premium price.
pub fn recommend_price(cost: f64, margin_percent: f64, competitor_prices: &[f64]) -> Recommendation {
    let target = min_target_price(cost, margin_percent);

    let Some((lowest, highest)) = bounds(competitor_prices) else {
        return Recommendation {
            price: round2(target),
            positioning: Positioning::MarginOnly,
            reason: "No competitors, used margin only".to_string(),
        };
    };
    let midpoint = (lowest + highest) / 2.0;

    if target <= highest {
        Recommendation {
            price: round2(target.max(midpoint).min(highest)),
            positioning: Positioning::WithinMarket,
            reason: format!(
                "Within market range: target price {:.2}, competitor midpoint {:.2}",
                target, midpoint
            ),
        }
    } else {
        Recommendation {
            price: round2(target),
            positioning: Positioning::Premium,
            reason: "Above market, positioned as premium due to high cost or margin requirement"
                .to_string(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
