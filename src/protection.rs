//! C11 ProtectionCore — timed defensive buffs and theft cooldowns, stored as fields of
//! `Player` (§4.11). `DefenseSuccessRate` itself is a pure function in `domain::calc`; this
//! module is the stateful wiring around it.

use crate::config::ConfigSnapshot;
use crate::error::{CoreError, CoreResult};
use crate::model::{Player, Time, TimedBuff};
use crate::player::store::PlayerTx;

pub use crate::domain::calc::defense_success_rate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuffStatus {
    pub active: bool,
    pub remaining_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtectionStatus {
    pub dog_food: BuffStatus,
    pub farm_protection: BuffStatus,
    pub steal_cooldown: BuffStatus,
    pub total_defense_bonus: i64,
    pub is_protected: bool,
}

fn buff_status(buff: &TimedBuff, now: Time) -> BuffStatus {
    BuffStatus { active: buff.is_active(now), remaining_ms: buff.remaining_ms(now) }
}

/// `ApplyDogFood(playerId, itemId)` (§4.11). Replaces (does not stack) the existing buff.
pub fn apply_dog_food(tx: &mut PlayerTx<'_>, config: &ConfigSnapshot, item_id: &str, now: Time) -> CoreResult<()> {
    let item_cfg = config.items.get(item_id).ok_or_else(|| CoreError::Validation(format!("unknown item {item_id}")))?;
    let duration_ms = item_cfg.effect.duration_ms.unwrap_or(0);
    let defense_bonus = item_cfg.effect.defense_bonus.unwrap_or(0);
    tx.mutate(|p| {
        p.protection.dog_food = TimedBuff { active_type: None, effect_end_time: Some(now + duration_ms), value: defense_bonus };
    });
    Ok(())
}

/// `SetFarmProtection(playerId, minutes)` (§4.11).
pub fn set_farm_protection(tx: &mut PlayerTx<'_>, minutes: i64, now: Time) {
    tx.mutate(|p| {
        p.protection.farm_protection = TimedBuff { active_type: None, effect_end_time: Some(now + minutes * 60_000), value: 0 };
    });
}

/// `SetStealCooldown(playerId, minutes)` (§4.11).
pub fn set_steal_cooldown(tx: &mut PlayerTx<'_>, minutes: i64, now: Time) {
    tx.mutate(|p| {
        p.stealing.cooldown_end_time = Some(now + minutes * 60_000);
    });
}

/// `GetStatus(playerId)` (§4.11).
pub fn get_status(player: &Player, now: Time) -> ProtectionStatus {
    let dog_food = buff_status(&player.protection.dog_food, now);
    let farm_protection = buff_status(&player.protection.farm_protection, now);
    let steal_cooldown_buff = TimedBuff { active_type: None, effect_end_time: player.stealing.cooldown_end_time, value: 0 };
    let steal_cooldown = buff_status(&steal_cooldown_buff, now);
    let total_defense_bonus = if dog_food.active { player.protection.dog_food.value } else { 0 };
    ProtectionStatus {
        dog_food,
        farm_protection,
        steal_cooldown,
        total_defense_bonus,
        is_protected: dog_food.active || farm_protection.active,
    }
}

/// `RemoveExpired(playerId)` (§4.11). Writes only if something actually changed.
pub fn remove_expired(tx: &mut PlayerTx<'_>, now: Time) {
    let player = tx.get();
    let dog_food_expired = player.protection.dog_food.effect_end_time.map(|t| t <= now).unwrap_or(false);
    let farm_expired = player.protection.farm_protection.effect_end_time.map(|t| t <= now).unwrap_or(false);
    let cooldown_expired = player.stealing.cooldown_end_time.map(|t| t <= now).unwrap_or(false);
    if !dog_food_expired && !farm_expired && !cooldown_expired {
        return;
    }
    tx.mutate(|p| {
        if dog_food_expired {
            p.protection.dog_food = TimedBuff::default();
        }
        if farm_expired {
            p.protection.farm_protection = TimedBuff::default();
        }
        if cooldown_expired {
            p.stealing.cooldown_end_time = None;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with_dog_food() -> ConfigSnapshot {
        let mut items = HashMap::new();
        items.insert(
            "dog_food".to_string(),
            crate::config::ItemConfig {
                name: "Dog Food".into(),
                price: 10,
                sell_price: None,
                max_stack: 10,
                category: "defense".into(),
                is_dynamic_price: false,
                effect: crate::config::ItemEffect { speed_bonus_pct: None, defense_bonus: Some(15), duration_ms: Some(60_000) },
            },
        );
        ConfigSnapshot { items, ..Default::default() }
    }

    #[test]
    fn apply_dog_food_sets_buff_and_replaces_not_stacks() {
        let mut player = Player::new("p1", "Alice", 0, 1, 10, 100);
        let config = config_with_dog_food();
        let mut tx = PlayerTx::for_test(&mut player);
        apply_dog_food(&mut tx, &config, "dog_food", 0).unwrap();
        apply_dog_food(&mut tx, &config, "dog_food", 1_000).unwrap();
        assert_eq!(player.protection.dog_food.effect_end_time, Some(61_000));
        assert_eq!(player.protection.dog_food.value, 15);
    }

    #[test]
    fn get_status_reports_active_and_remaining() {
        let mut player = Player::new("p1", "Alice", 0, 1, 10, 100);
        let config = config_with_dog_food();
        let mut tx = PlayerTx::for_test(&mut player);
        apply_dog_food(&mut tx, &config, "dog_food", 0).unwrap();
        let status = get_status(&player, 30_000);
        assert!(status.dog_food.active);
        assert_eq!(status.dog_food.remaining_ms, 30_000);
        assert!(status.is_protected);
        assert_eq!(status.total_defense_bonus, 15);
    }

    #[test]
    fn remove_expired_clears_only_expired_fields() {
        let mut player = Player::new("p1", "Alice", 0, 1, 10, 100);
        let config = config_with_dog_food();
        {
            let mut tx = PlayerTx::for_test(&mut player);
            apply_dog_food(&mut tx, &config, "dog_food", 0).unwrap();
            set_farm_protection(&mut tx, 10, 0);
        }
        let mut tx = PlayerTx::for_test(&mut player);
        remove_expired(&mut tx, 61_000); // dog food expired (60s), farm protection not (10min)
        assert_eq!(player.protection.dog_food.effect_end_time, None);
        assert!(player.protection.farm_protection.effect_end_time.is_some());
    }
}
