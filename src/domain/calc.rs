//! Pure functions over configuration snapshots and integers (§4.4). Never raise; callers
//! validate inputs before reaching here. No randomness — probabilistic choices live in
//! `scheduler` with an injected RNG.

use crate::model::LandQuality;
use std::collections::BTreeMap;

/// Per-quality modifiers pulled from `land.quality.<q>` config (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityModifiers {
    pub time_reduction_pct: i64,
    pub production_bonus_pct: i64,
    pub experience_bonus_pct: i64,
}

pub trait QualityTable {
    fn modifiers(&self, quality: LandQuality) -> QualityModifiers;
}

/// `GrowTime(baseMs, quality) = max(1000, floor(baseMs * (1 - timeReduction/100)))`.
pub fn grow_time(base_ms: i64, modifiers: QualityModifiers) -> i64 {
    let reduced = (base_ms as f64) * (1.0 - modifiers.time_reduction_pct as f64 / 100.0);
    (reduced.floor() as i64).max(1000)
}

/// `YieldQty(baseYield, quality, hasPests) = max(1, floor(baseYield * qualityMult * pestPenalty))`.
pub fn yield_qty(base_yield: i64, modifiers: QualityModifiers, has_pests: bool, pest_yield_reduction_pct: i64) -> i64 {
    let quality_mult = 1.0 + modifiers.production_bonus_pct as f64 / 100.0;
    let pest_penalty = if has_pests { 1.0 - pest_yield_reduction_pct as f64 / 100.0 } else { 1.0 };
    let raw = base_yield as f64 * quality_mult * pest_penalty;
    (raw.floor() as i64).max(1)
}

/// `CropExp(baseExp, quality) = max(1, floor(baseExp * (1 + expBonus/100)))`. Per-harvest, not per-unit.
pub fn crop_exp(base_exp: i64, modifiers: QualityModifiers) -> i64 {
    let raw = base_exp as f64 * (1.0 + modifiers.experience_bonus_pct as f64 / 100.0);
    (raw.floor() as i64).max(1)
}

#[derive(Debug, Clone, Copy)]
pub struct LevelEntry {
    pub level: u32,
    pub experience: u64,
}

/// `Level(exp, levelsTable)`: largest L with `levelsTable[L].experience <= exp`.
/// Progress to next level uses the next entry, or a synthesised `current+1000`.
pub struct LevelProgress {
    pub level: u32,
    pub current_floor_exp: u64,
    pub next_level_exp: u64,
}

pub fn level_for_exp(exp: u64, table: &BTreeMap<u32, LevelEntry>) -> LevelProgress {
    let mut best: Option<&LevelEntry> = None;
    for entry in table.values() {
        if entry.experience <= exp {
            if best.map(|b| entry.level > b.level).unwrap_or(true) {
                best = Some(entry);
            }
        }
    }
    let current = best.copied().unwrap_or(LevelEntry { level: 1, experience: 0 });
    let next = table
        .values()
        .filter(|e| e.level == current.level + 1)
        .next()
        .map(|e| e.experience)
        .unwrap_or(current.experience + 1000);
    LevelProgress { level: current.level, current_floor_exp: current.experience, next_level_exp: next }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShopOp {
    Buy,
    Sell,
}

/// `ShopPrice`: level discount capped 10%, bulk discount capped 5% (halved for sells). Both
/// discounts are applied as an adjustment against the base price, not multiplied into it —
/// multiplying two small fractions together would floor to zero for any realistic base price.
pub fn shop_price(base_price: i64, qty: i64, op: ShopOp, player_level: u32) -> i64 {
    let level_discount = ((player_level as f64 / 10.0).floor() * 0.01).min(0.10);
    let mut bulk_discount = ((qty as f64 / 10.0).floor() * 0.005).min(0.05);
    if op == ShopOp::Sell {
        bulk_discount /= 2.0;
    }
    let sign: f64 = match op {
        ShopOp::Buy => -1.0,
        ShopOp::Sell => 1.0,
    };
    let per_unit = (base_price as f64 * (1.0 + sign * (level_discount + bulk_discount))).floor();
    (per_unit as i64) * qty
}

/// `BaseSupply(history, minBaseSupply)`: mean of (<=H) entries, clamped to minBaseSupply.
pub fn base_supply(history: &[u64], min_base_supply: u64) -> u64 {
    if history.is_empty() {
        return min_base_supply;
    }
    let sum: u64 = history.iter().sum();
    let mean = sum / history.len() as u64;
    mean.max(min_base_supply)
}

/// `StealShare`: share clamped [0.10, 0.30]; stealer gains floor(baseYield*share), owner
/// loses floor(stealerGain*1.5).
pub struct StealOutcome {
    pub share: f64,
    pub stealer_gain: i64,
    pub owner_loss: i64,
}

pub fn steal_share(base_yield: i64, quality_production_bonus_pct: i64, stealer_level: i64, owner_level: i64) -> StealOutcome {
    let raw = 0.20 + 0.01 * (stealer_level - owner_level) as f64 + quality_production_bonus_pct as f64 / 200.0;
    let share = raw.clamp(0.10, 0.30);
    let stealer_gain = ((base_yield as f64) * share).floor() as i64;
    let owner_loss = ((stealer_gain as f64) * 1.5).floor() as i64;
    StealOutcome { share, stealer_gain, owner_loss }
}

/// `DefenseSuccessRate(bonus, attack) = clamp(5, 95, round(50 + bonus - max(0, (attack-100)/10)))`.
pub fn defense_success_rate(defense_bonus: i64, attacker_attack: i64) -> i64 {
    let penalty = ((attacker_attack - 100) as f64 / 10.0).max(0.0);
    let raw = (50.0 + defense_bonus as f64 - penalty).round() as i64;
    raw.clamp(5, 95)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal() -> QualityModifiers {
        QualityModifiers { time_reduction_pct: 0, production_bonus_pct: 0, experience_bonus_pct: 0 }
    }

    #[test]
    fn grow_time_scenario_1() {
        // spec.md §8 scenario 1: growTime=60s=60000ms, normal quality.
        assert_eq!(grow_time(60_000, normal()), 60_000);
    }

    #[test]
    fn grow_time_floor_and_min() {
        let q = QualityModifiers { time_reduction_pct: 20, production_bonus_pct: 0, experience_bonus_pct: 0 };
        assert_eq!(grow_time(1999, q), 1599);
        assert_eq!(grow_time(100, q), 1000); // floor at 1000ms
    }

    #[test]
    fn yield_and_exp_scenario_1() {
        assert_eq!(yield_qty(3, normal(), false, 20), 3);
        assert_eq!(crop_exp(10, normal()), 10);
    }

    #[test]
    fn pest_penalty_reduces_yield() {
        assert_eq!(yield_qty(10, normal(), true, 20), 8);
    }

    #[test]
    fn base_supply_scenario_5() {
        assert_eq!(base_supply(&[3, 5, 2, 4, 6, 1, 7], 0), 4);
        assert_eq!(base_supply(&[10, 3, 5, 2, 4, 6, 1], 0), 31 / 7);
    }

    #[test]
    fn base_supply_empty_returns_min() {
        assert_eq!(base_supply(&[], 50), 50);
    }

    #[test]
    fn shop_price_buy_discounts_and_sell_bonuses_move_opposite_ways() {
        let buy = shop_price(100, 1, ShopOp::Buy, 100);
        let sell = shop_price(100, 1, ShopOp::Sell, 100);
        assert!(buy < 100); // level discount lowers what the player pays
        assert!(sell > 100); // same discount raises what a sale credits
        assert!(buy < sell);
    }

    #[test]
    fn shop_price_zero_discount_returns_the_base_price() {
        assert_eq!(shop_price(100, 1, ShopOp::Buy, 0), 100);
        assert_eq!(shop_price(100, 1, ShopOp::Sell, 0), 100);
    }

    #[test]
    fn steal_share_clamps() {
        let out = steal_share(10, 0, -50, 50);
        assert_eq!(out.share, 0.10);
        let out = steal_share(10, 0, 50, -50);
        assert_eq!(out.share, 0.30);
    }

    #[test]
    fn defense_success_rate_bounds() {
        assert_eq!(defense_success_rate(1000, 0), 95);
        assert_eq!(defense_success_rate(-1000, 1000), 5);
    }
}
