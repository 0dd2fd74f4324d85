//! Tiered HBAR <-> credit conversion.
//!
//! Tiers are walked in ascending order. A tier covers every credit from the
//! running cursor up to its (exclusive) upper bound, so credits that fall in
//! a gap below a tier's floor are charged at that tier's rate. Coin amounts
//! are handled in tinybars, which keeps the walk in exact integer math.

use crate::error::{GateError, Result};
use crate::network::{hbar_to_tinybars, TINYBARS_PER_HBAR};
use serde::{Deserialize, Serialize};

/// A contiguous credit range with a fixed per-credit price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTier {
    pub name: String,
    pub min_credits: u64,
    /// Exclusive upper bound. `None` only on the final tier.
    #[serde(default)]
    pub max_credits: Option<u64>,
    pub hbar_per_credit: f64,
    /// Discount relative to the base tier, for display.
    #[serde(default)]
    pub discount_percent: u8,
}

impl PricingTier {
    pub fn new(
        name: &str,
        min_credits: u64,
        max_credits: Option<u64>,
        hbar_per_credit: f64,
        discount_percent: u8,
    ) -> Self {
        Self {
            name: name.to_string(),
            min_credits,
            max_credits,
            hbar_per_credit,
            discount_percent,
        }
    }

    /// Price of one credit in tinybars.
    pub fn tinybars_per_credit(&self) -> u64 {
        (self.hbar_per_credit * TINYBARS_PER_HBAR as f64).round() as u64
    }
}

/// Starter, growth, business and enterprise volume tiers.
pub fn default_tiers() -> Vec<PricingTier> {
    vec![
        PricingTier::new("starter", 0, Some(10_000), 0.01, 0),
        PricingTier::new("growth", 10_001, Some(100_000), 0.009, 10),
        PricingTier::new("business", 100_001, Some(1_000_000), 0.008, 20),
        PricingTier::new("enterprise", 1_000_001, None, 0.007, 30),
    ]
}

/// Reject tables the walk cannot price: empty, unordered, overlapping,
/// zero-priced, or without exactly one unbounded final tier.
pub fn validate_tiers(tiers: &[PricingTier]) -> Result<()> {
    let Some(last) = tiers.last() else {
        return Err(GateError::Config("pricing needs at least one tier".into()));
    };
    if last.max_credits.is_some() {
        return Err(GateError::Config(format!(
            "final tier '{}' must have no upper bound",
            last.name
        )));
    }

    for (i, tier) in tiers.iter().enumerate() {
        if !tier.hbar_per_credit.is_finite() || tier.tinybars_per_credit() == 0 {
            return Err(GateError::Config(format!(
                "tier '{}' has an invalid rate {}",
                tier.name, tier.hbar_per_credit
            )));
        }
        if i + 1 < tiers.len() {
            let Some(max) = tier.max_credits else {
                return Err(GateError::Config(format!(
                    "only the final tier may be unbounded ('{}' is not last)",
                    tier.name
                )));
            };
            if max <= tier.min_credits {
                return Err(GateError::Config(format!("tier '{}' is empty", tier.name)));
            }
            if tiers[i + 1].min_credits < max {
                return Err(GateError::Config(format!(
                    "tiers '{}' and '{}' overlap",
                    tier.name,
                    tiers[i + 1].name
                )));
            }
        }
    }
    Ok(())
}

/// Credits bought inside one tier during a walk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSlice {
    pub tier: String,
    pub credits: u64,
    pub tinybars: u64,
    pub discount_percent: u8,
}

/// Result of pricing an HBAR amount.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub tinybars: u64,
    pub credits: u64,
    /// Tinybars spent on whole credits; the rest is below one credit's price.
    pub tinybars_used: u64,
    pub slices: Vec<TierSlice>,
}

#[derive(Debug, Clone)]
pub struct PricingEngine {
    tiers: Vec<PricingTier>,
    rates: Vec<u128>,
}

impl PricingEngine {
    pub fn new(tiers: Vec<PricingTier>) -> Result<Self> {
        validate_tiers(&tiers)?;
        let rates = tiers
            .iter()
            .map(|t| u128::from(t.tinybars_per_credit()))
            .collect();
        Ok(Self { tiers, rates })
    }

    pub fn tiers(&self) -> &[PricingTier] {
        &self.tiers
    }

    /// Whole credits `hbar` buys from an empty cursor. Zero or negative
    /// amounts buy nothing; NaN and infinities are rejected.
    pub fn credits_for_coin(&self, hbar: f64) -> Result<u64> {
        Ok(self.credits_for_tinybars(hbar_to_tinybars(hbar)?))
    }

    pub fn credits_for_tinybars(&self, tinybars: u64) -> u64 {
        self.credits_for_tinybars_from(0, tinybars)
    }

    /// Credits `tinybars` buys for an account that already holds `cursor`
    /// credits of volume.
    pub fn credits_for_tinybars_from(&self, cursor: u64, tinybars: u64) -> u64 {
        self.walk_funds(cursor, tinybars).credits
    }

    /// HBAR cost of `credits`, rounded to 4 decimal places.
    pub fn coin_for_credits(&self, credits: u64) -> f64 {
        let tinybars = self.tinybars_for_credits_from(0, credits);
        let hbar = tinybars as f64 / TINYBARS_PER_HBAR as f64;
        (hbar * 10_000.0).round() / 10_000.0
    }

    pub fn tinybars_for_credits_from(&self, cursor: u64, credits: u64) -> u64 {
        let mut remaining = u128::from(credits);
        let mut position = u128::from(cursor);
        let mut cost: u128 = 0;

        for (tier, rate) in self.tiers.iter().zip(&self.rates) {
            if remaining == 0 {
                break;
            }
            let upper = tier.max_credits.map(u128::from);
            if matches!(upper, Some(max) if position >= max) {
                continue;
            }
            let take = upper.map_or(remaining, |max| (max - position).min(remaining));
            cost += take * rate;
            position += take;
            remaining -= take;
        }

        u64::try_from(cost).unwrap_or(u64::MAX)
    }

    pub fn quote(&self, hbar: f64) -> Result<Quote> {
        Ok(self.walk_funds(0, hbar_to_tinybars(hbar)?))
    }

    fn walk_funds(&self, cursor: u64, tinybars: u64) -> Quote {
        let mut remaining = u128::from(tinybars);
        let mut position = u128::from(cursor);
        let mut slices = Vec::new();

        for (tier, rate) in self.tiers.iter().zip(&self.rates) {
            if remaining == 0 {
                break;
            }
            let upper = tier.max_credits.map(u128::from);
            if matches!(upper, Some(max) if position >= max) {
                continue;
            }

            let mut bought: u128 = 0;
            let mut exhausted = false;

            // Resuming below this tier's floor: credits owed to reach it.
            let floor = u128::from(tier.min_credits);
            if position < floor {
                let owed = floor - position;
                if remaining < owed * rate {
                    bought = remaining / rate;
                    exhausted = true;
                } else {
                    bought = owed;
                }
                remaining -= bought * rate;
                position += bought;
            }

            if !exhausted {
                let affordable = remaining / rate;
                let take = match upper {
                    Some(max) if affordable >= max - position => max - position,
                    _ => {
                        exhausted = true;
                        affordable
                    }
                };
                remaining -= take * rate;
                position += take;
                bought += take;
            }

            if bought > 0 {
                slices.push(TierSlice {
                    tier: tier.name.clone(),
                    credits: bought as u64,
                    tinybars: (bought * rate) as u64,
                    discount_percent: tier.discount_percent,
                });
            }
            // The sub-credit remainder is dropped here and nowhere earlier.
            if exhausted {
                break;
            }
        }

        let credits: u64 = slices.iter().map(|s| s.credits).sum();
        Quote {
            tinybars,
            credits,
            tinybars_used: slices.iter().map(|s| s.tinybars).sum(),
            slices,
        }
    }

    /// Tier a cumulative credit amount falls in. An amount equal to a tier's
    /// floor belongs to that tier; otherwise the lowest tier whose upper bound
    /// reaches the amount; otherwise the unbounded final tier.
    pub fn tier_for_amount(&self, credits: u64) -> &PricingTier {
        self.tier_index_for_amount(credits)
            .and_then(|i| self.tiers.get(i))
            .unwrap_or_else(|| &self.tiers[self.tiers.len() - 1])
    }

    fn tier_index_for_amount(&self, credits: u64) -> Option<usize> {
        self.tiers
            .iter()
            .position(|t| t.min_credits == credits)
            .or_else(|| {
                self.tiers
                    .iter()
                    .position(|t| t.max_credits.map_or(true, |max| max >= credits))
            })
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        let tiers = default_tiers();
        let rates = tiers
            .iter()
            .map(|t| u128::from(t.tinybars_per_credit()))
            .collect();
        Self { tiers, rates }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tier_engine() -> PricingEngine {
        PricingEngine::new(vec![
            PricingTier::new("starter", 0, Some(10_000), 0.01, 0),
            PricingTier::new("growth", 10_001, None, 0.009, 10),
        ])
        .unwrap()
    }

    #[test]
    fn default_tiers_validate() {
        assert!(validate_tiers(&default_tiers()).is_ok());
        assert_eq!(PricingEngine::default().tiers().len(), 4);
    }

    #[test]
    fn non_positive_amounts_buy_nothing() {
        let engine = PricingEngine::default();
        assert_eq!(engine.credits_for_coin(0.0).unwrap(), 0);
        assert_eq!(engine.credits_for_coin(-5.0).unwrap(), 0);
        assert_eq!(engine.coin_for_credits(0), 0.0);
    }

    #[test]
    fn non_finite_amounts_are_invalid() {
        let engine = PricingEngine::default();
        assert!(matches!(
            engine.credits_for_coin(f64::NAN),
            Err(GateError::InvalidAmount(_))
        ));
        assert!(engine.credits_for_coin(f64::INFINITY).is_err());
    }

    #[test]
    fn single_tier_purchase() {
        let engine = two_tier_engine();
        assert_eq!(engine.credits_for_coin(1.0).unwrap(), 100);
        assert_eq!(engine.credits_for_coin(0.015).unwrap(), 1);
        assert_eq!(engine.coin_for_credits(100), 1.0);
    }

    #[test]
    fn gap_credit_is_charged_at_next_tier_rate() {
        let engine = two_tier_engine();
        // 100 HBAR fills starter exactly; 0.009 more buys the credit at the floor of growth.
        assert_eq!(engine.credits_for_coin(100.0).unwrap(), 10_000);
        assert_eq!(engine.credits_for_coin(100.009).unwrap(), 10_001);
        assert_eq!(engine.coin_for_credits(10_001), 100.009);
    }

    #[test]
    fn purchase_spanning_tiers_floors_once() {
        let engine = PricingEngine::default();
        // 100 HBAR -> 10_000 starter, 0.009 -> gap credit, remaining 99.991 HBAR / 0.009
        assert_eq!(engine.credits_for_coin(200.0).unwrap(), 21_111);

        let quote = engine.quote(200.0).unwrap();
        assert_eq!(quote.credits, 21_111);
        assert_eq!(quote.slices.len(), 2);
        assert_eq!(quote.slices[0].tier, "starter");
        assert_eq!(quote.slices[1].credits, 11_111);
        assert!(quote.tinybars_used <= quote.tinybars);
    }

    #[test]
    fn amounts_beyond_finite_tiers_land_in_final_tier() {
        let engine = PricingEngine::default();
        let credits = engine.credits_for_coin(100_000.0).unwrap();
        assert!(credits > 1_000_001);
        assert_eq!(engine.tier_for_amount(credits).name, "enterprise");
    }

    #[test]
    fn split_purchase_matches_direct_purchase() {
        let engine = two_tier_engine();
        let direct = engine.credits_for_coin(100.0).unwrap();

        let first = engine.credits_for_coin(60.0).unwrap();
        let second = engine.credits_for_tinybars_from(first, hbar_to_tinybars(40.0).unwrap());
        assert_eq!(first + second, direct);
    }

    #[test]
    fn round_trip_stays_within_one_rate() {
        let engine = PricingEngine::default();
        for hbar in [
            0.0, 0.005, 0.5, 1.0, 99.99, 100.0, 100.009, 150.0, 1_234.5678, 10_000.0, 250_000.0,
        ] {
            let credits = engine.credits_for_coin(hbar).unwrap();
            let back = engine.coin_for_credits(credits);
            let tolerance = engine.tier_for_amount(credits.max(1)).hbar_per_credit.max(0.01);
            assert!(back <= hbar + 1e-4, "{hbar} HBAR bought {credits} credits costing {back}");
            assert!(
                hbar - back <= tolerance + 1e-4,
                "{hbar} HBAR bought {credits} credits costing {back}"
            );
        }
    }

    #[test]
    fn tier_lookup_is_monotonic() {
        let engine = PricingEngine::default();
        let index_of = |credits: u64| {
            let name = &engine.tier_for_amount(credits).name;
            engine.tiers().iter().position(|t| &t.name == name).unwrap()
        };

        let mut last = 0;
        let mut samples: Vec<u64> = (0..2_000_000u64).step_by(997).collect();
        samples.extend([9_999, 10_000, 10_001, 100_000, 100_001, 1_000_000, 1_000_001]);
        samples.sort_unstable();
        for credits in samples {
            let idx = index_of(credits);
            assert!(idx >= last, "tier index dropped at {credits}");
            last = idx;
        }
    }

    #[test]
    fn tier_boundaries() {
        let engine = PricingEngine::default();
        assert_eq!(engine.tier_for_amount(0).name, "starter");
        assert_eq!(engine.tier_for_amount(10_000).name, "starter");
        assert_eq!(engine.tier_for_amount(10_001).name, "growth");
        assert_eq!(engine.tier_for_amount(50_000_000).name, "enterprise");

        let contiguous = PricingEngine::new(vec![
            PricingTier::new("a", 0, Some(100), 0.02, 0),
            PricingTier::new("b", 100, None, 0.01, 50),
        ])
        .unwrap();
        assert_eq!(contiguous.tier_for_amount(99).name, "a");
        assert_eq!(contiguous.tier_for_amount(100).name, "b");
    }

    #[test]
    fn invalid_tables_are_rejected() {
        assert!(PricingEngine::new(vec![]).is_err());
        assert!(PricingEngine::new(vec![PricingTier::new("a", 0, Some(10), 0.01, 0)]).is_err());
        assert!(PricingEngine::new(vec![
            PricingTier::new("a", 0, Some(100), 0.01, 0),
            PricingTier::new("b", 50, None, 0.009, 0),
        ])
        .is_err());
        assert!(PricingEngine::new(vec![PricingTier::new("free", 0, None, 0.0, 0)]).is_err());
    }
}
