//! C7 LandCore — per-plot quality upgrades and land-count expansion (§4.7). Mutating
//! operations run inside `PlayerStore::execute_under_lock`; every write is invariant-checked
//! before it's allowed to stick.

use crate::config::ConfigSnapshot;
use crate::error::{CoreError, CoreResult};
use crate::model::{Land, LandQuality, Player, Time};
use crate::player::inventory;
use crate::player::store::PlayerTx;

pub fn get_land(player: &Player, land_id: u32) -> CoreResult<&Land> {
    player.land(land_id).ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))
}

pub fn get_all_lands(player: &Player) -> &[Land] {
    &player.lands
}

fn check_and_commit(tx: &mut PlayerTx<'_>, land_id: u32, mutator: impl FnOnce(&mut Land)) -> CoreResult<()> {
    let mut land = tx.get().land(land_id).cloned().ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?;
    mutator(&mut land);
    land.check_invariants().map_err(CoreError::Domain)?;
    tx.mutate(|p| {
        if let Some(slot) = p.land_mut(land_id) {
            *slot = land;
        }
    });
    Ok(())
}

/// `UpgradeQuality(playerId, landId, targetQuality)` (§4.7). Only strictly higher ranks;
/// charges the target quality's configured gold and material costs and requires the
/// configured player level.
pub fn upgrade_quality(
    tx: &mut PlayerTx<'_>,
    config: &ConfigSnapshot,
    land_id: u32,
    target: LandQuality,
    now: Time,
) -> CoreResult<()> {
    let player = tx.get();
    let land = get_land(player, land_id)?;
    if target.rank() <= land.quality.rank() {
        return Err(CoreError::Validation("target quality must be strictly higher".into()));
    }
    let cost = config
        .land_quality
        .get(&target)
        .map(|q| q.upgrade.clone())
        .ok_or_else(|| CoreError::ConfigMissing(format!("land.quality upgrade cost for {target:?}")))?;
    if player.level < cost.level_required {
        return Err(CoreError::InsufficientResources("level".into()));
    }
    if player.coins < cost.gold_cost {
        return Err(CoreError::InsufficientResources("coins".into()));
    }
    for (item_id, qty) in &cost.materials {
        let have = player.inventory.get(item_id).map(|s| s.quantity).unwrap_or(0);
        if have < *qty || player.inventory.get(item_id).map(|s| s.metadata.locked).unwrap_or(false) {
            return Err(CoreError::InsufficientResources(item_id.clone()));
        }
    }

    for (item_id, qty) in &cost.materials {
        inventory::remove(tx, item_id, *qty)?;
    }
    let gold_cost = cost.gold_cost;
    tx.mutate(|p| p.coins -= gold_cost);
    check_and_commit(tx, land_id, |land| {
        land.quality = target;
        land.upgrade_level += 1;
        land.last_upgrade_time = Some(now);
    })
}

/// `ExpandLandCount(playerId, steps)` (§4.7). Advances the land count one slot at a time,
/// stopping at the first step that is unaffordable, ungated, or beyond `maxLands`. Returns
/// the number of slots actually added.
pub fn expand_land_count(tx: &mut PlayerTx<'_>, config: &ConfigSnapshot, steps: u32) -> CoreResult<u32> {
    let player = tx.get();
    let current = player.lands.len() as u32;
    let max_lands = config.land_default.max_lands;

    let mut applied = 0u32;
    let mut total_gold = 0u64;
    let mut coins_available = player.coins;
    for i in 1..=steps {
        let next_count = current + i;
        if next_count > max_lands {
            break;
        }
        let Some(step_cfg) = config.land_expansion.get(&next_count) else { break };
        if player.level < step_cfg.level_required {
            break;
        }
        if coins_available < step_cfg.gold_cost {
            break;
        }
        coins_available -= step_cfg.gold_cost;
        total_gold += step_cfg.gold_cost;
        applied += 1;
    }

    if applied == 0 {
        return Err(CoreError::InsufficientResources("land expansion".into()));
    }

    tx.mutate(|p| {
        p.coins -= total_gold;
        let mut next_id = p.lands.iter().map(|l| l.id).max().unwrap_or(0);
        for _ in 0..applied {
            next_id += 1;
            p.lands.push(Land::empty(next_id, LandQuality::Normal));
        }
    });
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LandQualityConfig, UpgradeCost};
    use std::collections::HashMap;

    fn test_config() -> ConfigSnapshot {
        let mut land_quality = HashMap::new();
        land_quality.insert(
            LandQuality::Red,
            LandQualityConfig {
                time_reduction: 10,
                production_bonus: 5,
                experience_bonus: 0,
                upgrade: UpgradeCost { gold_cost: 100, level_required: 2, materials: HashMap::from([("wood".to_string(), 3)]) },
            },
        );
        let mut land_expansion = HashMap::new();
        land_expansion.insert(2, crate::config::LandExpansionStep { gold_cost: 50, level_required: 1 });
        land_expansion.insert(3, crate::config::LandExpansionStep { gold_cost: 100, level_required: 5 });
        ConfigSnapshot { land_quality, land_expansion, land_default: crate::config::LandDefaultConfig { starting_lands: 1, max_lands: 5 }, ..Default::default() }
    }

    #[test]
    fn upgrade_quality_rejects_same_or_lower_rank() {
        let mut player = Player::new("p1", "Alice", 0, 1, 10, 100);
        let config = test_config();
        let mut tx = PlayerTx::for_test(&mut player);
        let err = upgrade_quality(&mut tx, &config, 1, LandQuality::Normal, 0).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn upgrade_quality_charges_gold_and_materials() {
        let mut player = Player::new("p1", "Alice", 0, 1, 10, 100);
        player.level = 2;
        player.coins = 150;
        let config = test_config();
        {
            let mut tx = PlayerTx::for_test(&mut player);
            inventory::add(&mut tx, &config_with_wood(), "wood", 5, 0).unwrap();
        }
        let mut tx = PlayerTx::for_test(&mut player);
        upgrade_quality(&mut tx, &config, 1, LandQuality::Red, 1000).unwrap();
        assert_eq!(player.coins, 50);
        assert_eq!(player.inventory["wood"].quantity, 2);
        assert_eq!(player.land(1).unwrap().quality, LandQuality::Red);
        assert_eq!(player.land(1).unwrap().upgrade_level, 1);
    }

    fn config_with_wood() -> ConfigSnapshot {
        let mut items = HashMap::new();
        items.insert("wood".to_string(), crate::config::ItemConfig { name: "Wood".into(), price: 1, sell_price: None, max_stack: 99, category: "materials".into(), is_dynamic_price: false, effect: Default::default() });
        ConfigSnapshot { items, ..test_config() }
    }

    #[test]
    fn upgrade_quality_fails_when_materials_insufficient() {
        let mut player = Player::new("p1", "Alice", 0, 1, 10, 100);
        player.level = 2;
        player.coins = 150;
        let config = test_config();
        let mut tx = PlayerTx::for_test(&mut player);
        let err = upgrade_quality(&mut tx, &config, 1, LandQuality::Red, 0).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientResources(_)));
    }

    #[test]
    fn expand_land_count_stops_at_unaffordable_step() {
        let mut player = Player::new("p1", "Alice", 0, 1, 10, 100);
        player.level = 1;
        player.coins = 60;
        let config = test_config();
        let mut tx = PlayerTx::for_test(&mut player);
        let applied = expand_land_count(&mut tx, &config, 3).unwrap();
        assert_eq!(applied, 1); // step 2 costs 50 (affordable), step 3 needs level 5
        assert_eq!(player.lands.len(), 2);
        assert_eq!(player.coins, 10);
    }

    #[test]
    fn expand_land_count_errors_when_nothing_affordable() {
        let mut player = Player::new("p1", "Alice", 0, 1, 10, 100);
        player.coins = 0;
        let config = test_config();
        let mut tx = PlayerTx::for_test(&mut player);
        let err = expand_land_count(&mut tx, &config, 1).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientResources(_)));
    }
}
