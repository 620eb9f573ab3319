//! C9 CropLifecycle — the player-facing plant/harvest/care/steal operations (§4.9). Each is
//! single-lock and all-or-nothing; composes `player::inventory`, `player::land`, `domain::calc`,
//! and `scheduler` under a `PlayerStore::execute_under_lock` (or, for `steal`, two locks at once).

use crate::config::ConfigSnapshot;
use crate::domain::calc::{self, LevelEntry, QualityModifiers};
use crate::error::{CoreError, CoreResult};
use crate::market::{MarketEngine, TransactionKind};
use crate::model::{Land, LandQuality, LandStatus, Player, Time};
use crate::player::inventory;
use crate::player::store::{PlayerStore, PlayerTx};
use crate::protection;
use crate::scheduler::Scheduler;
use crate::store::kv::{LockBackend, SortedSet};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

fn seed_item_id(crop_type: &str) -> String {
    format!("{crop_type}_seed")
}

fn quality_modifiers(config: &ConfigSnapshot, quality: LandQuality) -> QualityModifiers {
    config
        .land_quality
        .get(&quality)
        .map(|q| QualityModifiers {
            time_reduction_pct: q.time_reduction,
            production_bonus_pct: q.production_bonus,
            experience_bonus_pct: q.experience_bonus,
        })
        .unwrap_or_default()
}

fn levels_table(config: &ConfigSnapshot) -> BTreeMap<u32, LevelEntry> {
    config.levels.iter().map(|(lvl, cfg)| (*lvl, LevelEntry { level: *lvl, experience: cfg.experience })).collect()
}

/// Picks the item to spend for a care action: an explicit hint if the player actually owns
/// it unlocked, otherwise the largest unlocked stack in the requested category.
fn resolve_item(config: &ConfigSnapshot, player: &Player, category: &str, hint: Option<&str>) -> CoreResult<String> {
    if let Some(h) = hint {
        let usable = player.inventory.get(h).map(|s| s.quantity > 0 && !s.metadata.locked).unwrap_or(false);
        return if usable { Ok(h.to_string()) } else { Err(CoreError::InsufficientResources(h.to_string())) };
    }
    player
        .inventory
        .iter()
        .filter(|(id, stack)| {
            stack.quantity > 0 && !stack.metadata.locked && config.items.get(*id).map(|c| c.category == category).unwrap_or(false)
        })
        .max_by_key(|(_, stack)| stack.quantity)
        .map(|(id, _)| id.clone())
        .ok_or_else(|| CoreError::InsufficientResources(category.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CareAction {
    Water,
    Fertilize,
    TreatPests,
}

#[derive(Debug, Clone)]
pub struct HarvestedLand {
    pub land_id: u32,
    pub item_id: String,
    pub qty: u32,
    pub exp: u64,
    pub bonus_seed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LevelUpReward {
    pub new_level: u32,
    pub coins: u64,
    pub items: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct HarvestOutcome {
    pub harvested: Vec<HarvestedLand>,
    pub skipped: Vec<u32>,
    pub total_exp: u64,
    pub level_ups: Vec<LevelUpReward>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StealOutcomeResult {
    pub success: bool,
    pub stealer_gain: u32,
    pub owner_loss: u32,
    pub bonus_coins: u64,
    pub defense_rate: i64,
    pub roll: i64,
}

pub struct CropLifecycle<S: SortedSet, B: LockBackend> {
    players: Arc<PlayerStore<B>>,
    config: Arc<crate::config::ConfigRegistry>,
    scheduler: Arc<Scheduler<S, B>>,
    market: Arc<MarketEngine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellOutcome {
    pub item_id: String,
    pub qty: u32,
    pub coins_earned: u64,
}

impl<S: SortedSet, B: LockBackend> CropLifecycle<S, B> {
    pub fn new(
        players: Arc<PlayerStore<B>>,
        config: Arc<crate::config::ConfigRegistry>,
        scheduler: Arc<Scheduler<S, B>>,
        market: Arc<MarketEngine>,
    ) -> Self {
        Self { players, config, scheduler, market }
    }

    /// `Plant(playerId, landId, cropType)` (§4.9).
    pub async fn plant(&self, player_id: &str, land_id: u32, crop_type: &str, now: Time) -> CoreResult<Time> {
        let config = self.config.snapshot();
        if !config.crops.contains_key(crop_type) {
            return Err(CoreError::Validation(format!("unknown crop {crop_type}")));
        }
        let seed_id = seed_item_id(crop_type);
        let crop_type_owned = crop_type.to_string();

        let harvest_time = self
            .players
            .execute_under_lock(player_id, "plant", |tx| {
                let player = tx.get();
                let land = player.land(land_id).ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?;
                if land.status != LandStatus::Empty {
                    return Err(CoreError::Domain("land is not empty".into()));
                }
                let crop_cfg = &config.crops[&crop_type_owned];
                if player.level < crop_cfg.required_level {
                    return Err(CoreError::InsufficientResources("level".into()));
                }
                let seed_qty = player.inventory.get(&seed_id).map(|s| s.quantity).unwrap_or(0);
                let seed_locked = player.inventory.get(&seed_id).map(|s| s.metadata.locked).unwrap_or(false);
                if seed_qty < 1 || seed_locked {
                    return Err(CoreError::InsufficientResources(seed_id.clone()));
                }
                let modifiers = quality_modifiers(&config, land.quality);
                let grow_ms = calc::grow_time(crop_cfg.grow_time * 1000, modifiers);
                let harvest_time = now + grow_ms;

                inventory::remove(tx, &seed_id, 1)?;
                let crop_for_mutate = crop_type_owned.clone();
                tx.mutate(|p| {
                    if let Some(l) = p.land_mut(land_id) {
                        l.status = LandStatus::Growing;
                        l.crop = Some(crop_for_mutate);
                        l.plant_time = Some(now);
                        l.harvest_time = Some(harvest_time);
                        l.original_harvest_time = Some(harvest_time);
                        l.needs_water = false;
                        l.has_pests = false;
                        l.stealable = false;
                        l.water_delay_applied = false;
                        l.water_delay_ms = 0;
                        l.stolen_qty = 0;
                    }
                    p.statistics.plants_count += 1;
                });
                Ok(harvest_time)
            })
            .await?;

        self.scheduler.schedule_harvest(player_id, land_id, harvest_time);
        self.scheduler.schedule_care_checkpoints(player_id, land_id, now, harvest_time);
        Ok(harvest_time)
    }

    /// `BatchPlant(playerId, plans[])` (§4.9): validates every plan up front (empty land,
    /// level gate, aggregate seed demand) before applying any of them.
    pub async fn batch_plant(&self, player_id: &str, plans: &[(u32, String)], now: Time) -> CoreResult<Vec<(u32, Time)>> {
        let config = self.config.snapshot();
        let scheduler = &self.scheduler;

        let results = self
            .players
            .execute_under_lock(player_id, "plant", |tx| {
                let mut seed_needs: HashMap<String, u32> = HashMap::new();
                {
                    let player = tx.get();
                    for (land_id, crop_type) in plans {
                        let crop_cfg =
                            config.crops.get(crop_type).ok_or_else(|| CoreError::Validation(format!("unknown crop {crop_type}")))?;
                        let land = player.land(*land_id).ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?;
                        if land.status != LandStatus::Empty {
                            return Err(CoreError::Domain(format!("land {land_id} is not empty")));
                        }
                        if player.level < crop_cfg.required_level {
                            return Err(CoreError::InsufficientResources("level".into()));
                        }
                        *seed_needs.entry(seed_item_id(crop_type)).or_insert(0) += 1;
                    }
                    for (seed_id, qty) in &seed_needs {
                        let have = player.inventory.get(seed_id).map(|s| s.quantity).unwrap_or(0);
                        let locked = player.inventory.get(seed_id).map(|s| s.metadata.locked).unwrap_or(false);
                        if have < *qty || locked {
                            return Err(CoreError::InsufficientResources(seed_id.clone()));
                        }
                    }
                }

                let mut results = Vec::with_capacity(plans.len());
                for (land_id, crop_type) in plans {
                    let crop_cfg = &config.crops[crop_type];
                    let quality = tx.get().land(*land_id).unwrap().quality;
                    let modifiers = quality_modifiers(&config, quality);
                    let grow_ms = calc::grow_time(crop_cfg.grow_time * 1000, modifiers);
                    let harvest_time = now + grow_ms;
                    inventory::remove(tx, &seed_item_id(crop_type), 1)?;

                    let land_id = *land_id;
                    let crop_owned = crop_type.clone();
                    tx.mutate(|p| {
                        if let Some(l) = p.land_mut(land_id) {
                            l.status = LandStatus::Growing;
                            l.crop = Some(crop_owned);
                            l.plant_time = Some(now);
                            l.harvest_time = Some(harvest_time);
                            l.original_harvest_time = Some(harvest_time);
                        }
                        p.statistics.plants_count += 1;
                    });
                    scheduler.schedule_harvest(player_id, land_id, harvest_time);
                    scheduler.schedule_care_checkpoints(player_id, land_id, now, harvest_time);
                    results.push((land_id, harvest_time));
                }
                Ok(results)
            })
            .await?;
        Ok(results)
    }

    /// `Harvest(playerId, landId=null)` (§4.9): gathers due candidates (given land, or every
    /// growing/mature land past `harvestTime`), then greedily accepts plots in ascending land
    /// order whose full yield fits the remaining inventory slots; overflowing plots are skipped
    /// outright, never partially collected.
    pub async fn harvest(&self, player_id: &str, land_id: Option<u32>, rng: &mut impl Rng, now: Time) -> CoreResult<HarvestOutcome> {
        let config = self.config.snapshot();
        let scheduler = &self.scheduler;

        self.players
            .execute_under_lock(player_id, "harvest", |tx| {
                let player = tx.get();
                let due = |l: &Land| {
                    matches!(l.status, LandStatus::Growing | LandStatus::Mature) && l.harvest_time.map(|h| h <= now).unwrap_or(false)
                };
                let mut candidates: Vec<u32> = match land_id {
                    Some(id) => player.land(id).filter(|l| due(l)).map(|l| vec![l.id]).unwrap_or_default(),
                    None => player.lands.iter().filter(|l| due(l)).map(|l| l.id).collect(),
                };
                candidates.sort_unstable();

                struct Prepared {
                    land_id: u32,
                    item_id: String,
                    qty: u32,
                    exp: u64,
                    bonus_seed: bool,
                }
                let mut prepared: Vec<Prepared> = Vec::new();
                let mut skipped = Vec::new();
                let mut free_slots = player.inventory_capacity.saturating_sub(player.inventory_usage());
                // Tracks room already claimed by earlier lands in this same batch, per item, so two
                // plots yielding the same crop don't both see the stack's full headroom as available.
                let mut stack_room_claimed: HashMap<String, u32> = HashMap::new();

                for cid in &candidates {
                    let land = player.land(*cid).unwrap();
                    let Some(crop_type) = land.crop.clone() else {
                        skipped.push(*cid);
                        continue;
                    };
                    let Some(crop_cfg) = config.crops.get(&crop_type) else {
                        skipped.push(*cid);
                        continue;
                    };
                    let modifiers = quality_modifiers(&config, land.quality);
                    let raw_qty = calc::yield_qty(crop_cfg.base_yield, modifiers, land.has_pests, config.care.pest_penalty_percent) as u32;
                    let qty = raw_qty.saturating_sub(land.stolen_qty).max(1);
                    let exp = calc::crop_exp(crop_cfg.experience, modifiers) as u64;
                    let bonus_seed = rng.r#gen::<f64>() < 0.10;
                    let slots = qty + if bonus_seed { 1 } else { 0 };
                    let max_stack = config.items.get(&crop_type).map(|c| c.max_stack).unwrap_or(99);
                    let claimed = *stack_room_claimed.get(&crop_type).unwrap_or(&0);
                    let room = inventory::stack_room(player, &crop_type, max_stack).saturating_sub(claimed);
                    // Both the overall free-slot budget and this crop's own stack headroom must
                    // cover the full yield, or the plot is skipped whole — a partial accept here
                    // would silently drop the remainder once the land resets to `Empty` below.
                    if slots <= free_slots && qty <= room {
                        free_slots -= slots;
                        *stack_room_claimed.entry(crop_type.clone()).or_insert(0) += qty;
                        prepared.push(Prepared { land_id: *cid, item_id: crop_type, qty, exp, bonus_seed });
                    } else {
                        skipped.push(*cid);
                    }
                }

                let mut harvested = Vec::with_capacity(prepared.len());
                let mut total_exp = 0u64;
                for p in &prepared {
                    let outcome = inventory::add(tx, &config, &p.item_id, p.qty, now)?;
                    debug_assert_eq!(outcome.remainder, 0, "prepare pass must only admit yields that fit in full");
                    if p.bonus_seed {
                        let _ = inventory::add(tx, &config, &seed_item_id(&p.item_id), 1, now);
                    }
                    total_exp += p.exp;
                    let land_id = p.land_id;
                    tx.mutate(|pl| {
                        if let Some(l) = pl.land_mut(land_id) {
                            let quality = l.quality;
                            *l = Land::empty(land_id, quality);
                        }
                        pl.statistics.harvests_count += 1;
                    });
                    scheduler.cancel_harvest(player_id, land_id);
                    scheduler.cancel_care_for_land(player_id, land_id);
                    harvested.push(HarvestedLand {
                        land_id: p.land_id,
                        item_id: p.item_id.clone(),
                        qty: p.qty,
                        exp: p.exp,
                        bonus_seed: p.bonus_seed,
                    });
                }

                let mut level_ups = Vec::new();
                if total_exp > 0 {
                    let old_level = tx.get().level;
                    tx.mutate(|pl| pl.experience += total_exp);
                    let table = levels_table(&config);
                    let new_level = calc::level_for_exp(tx.get().experience, &table).level;
                    if new_level > old_level {
                        for lvl in (old_level + 1)..=new_level {
                            let mut reward = LevelUpReward { new_level: lvl, coins: 0, items: HashMap::new() };
                            if let Some(level_cfg) = config.levels.get(&lvl) {
                                if let Some(r) = &level_cfg.rewards {
                                    reward.coins = r.coins;
                                    reward.items = r.items.clone();
                                    let coins = r.coins;
                                    tx.mutate(|pl| pl.coins += coins);
                                    for (item_id, qty) in &r.items {
                                        let _ = inventory::add(tx, &config, item_id, *qty, now);
                                    }
                                }
                            }
                            level_ups.push(reward);
                        }
                        tx.mutate(|pl| pl.level = new_level);
                    }
                }

                Ok(HarvestOutcome { harvested, skipped, total_exp, level_ups })
            })
            .await
    }

    /// `Care(playerId, landId, action, itemHint?)` (§4.9). Water is free; fertilize/treatPests
    /// each consume one unit of a category item. Land state is validated before the item is
    /// consumed, so a failing action never needs to compensate — `execute_under_lock` already
    /// discards every mutation made this call when the body returns `Err`.
    pub async fn care(&self, player_id: &str, land_id: u32, action: CareAction, item_hint: Option<&str>, now: Time) -> CoreResult<()> {
        let config = self.config.snapshot();
        let item_hint = item_hint.map(|s| s.to_string());
        let scheduler = &self.scheduler;

        self.players
            .execute_under_lock(player_id, "care", |tx| match action {
                CareAction::Water => {
                    let needs_water = tx.get().land(land_id).ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?.needs_water;
                    if !needs_water {
                        return Err(CoreError::Domain("land does not need water".into()));
                    }
                    tx.mutate(|p| {
                        if let Some(l) = p.land_mut(land_id) {
                            l.needs_water = false;
                        }
                    });
                    Ok(())
                }
                CareAction::Fertilize => {
                    let item_id = resolve_item(&config, tx.get(), "fertilizer", item_hint.as_deref())?;
                    let land = tx.get().land(land_id).cloned().ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?;
                    let speed_bonus = config.items.get(&item_id).and_then(|c| c.effect.speed_bonus_pct).unwrap_or(0);
                    let remaining = land.harvest_time.map(|h| h - now).unwrap_or(0).max(0);
                    let reduced = (remaining as f64 * (1.0 - speed_bonus as f64 / 100.0)).floor() as i64;
                    let new_harvest = now + reduced.max(0);
                    let mut updated = land.clone();
                    updated.harvest_time = Some(new_harvest);
                    updated.check_invariants().map_err(CoreError::Domain)?;

                    inventory::remove(tx, &item_id, 1)?;
                    tx.mutate(|p| {
                        if let Some(l) = p.land_mut(land_id) {
                            l.harvest_time = Some(new_harvest);
                            l.last_fertilized = Some(now);
                        }
                    });
                    scheduler.schedule_harvest(player_id, land_id, new_harvest);
                    Ok(())
                }
                CareAction::TreatPests => {
                    let has_pests = tx.get().land(land_id).ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?.has_pests;
                    if !has_pests {
                        return Err(CoreError::Domain("land has no pests".into()));
                    }
                    let item_id = resolve_item(&config, tx.get(), "pesticide", item_hint.as_deref())?;
                    inventory::remove(tx, &item_id, 1)?;
                    tx.mutate(|p| {
                        if let Some(l) = p.land_mut(land_id) {
                            l.has_pests = false;
                            l.last_treated = Some(now);
                        }
                    });
                    Ok(())
                }
            })
            .await
    }

    /// `BatchCare(playerId, actions[])` (§4.9): dedupes `(landId, actionKind)` pairs, validates
    /// every land's preconditions and the aggregate item demand up front, then applies all
    /// actions in one lock — a failure partway through discards the whole batch for free,
    /// since `execute_under_lock` never writes back on `Err`.
    pub async fn batch_care(&self, player_id: &str, actions: &[(u32, CareAction, Option<String>)], now: Time) -> CoreResult<()> {
        let config = self.config.snapshot();
        let scheduler = &self.scheduler;

        let mut seen = HashSet::new();
        let mut deduped = Vec::new();
        for (land_id, action, hint) in actions {
            if seen.insert((*land_id, action.clone())) {
                deduped.push((*land_id, action.clone(), hint.clone()));
            }
        }

        self.players
            .execute_under_lock(player_id, "care", |tx| {
                let mut resolved: Vec<(u32, CareAction, Option<String>)> = Vec::with_capacity(deduped.len());
                let mut demand: HashMap<String, u32> = HashMap::new();
                for (land_id, action, hint) in &deduped {
                    let player = tx.get();
                    let land = player.land(*land_id).ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?;
                    match action {
                        CareAction::Water => {
                            if !land.needs_water {
                                return Err(CoreError::Domain(format!("land {land_id} does not need water")));
                            }
                            resolved.push((*land_id, action.clone(), None));
                        }
                        CareAction::Fertilize => {
                            let item_id = resolve_item(&config, player, "fertilizer", hint.as_deref())?;
                            *demand.entry(item_id.clone()).or_insert(0) += 1;
                            resolved.push((*land_id, action.clone(), Some(item_id)));
                        }
                        CareAction::TreatPests => {
                            if !land.has_pests {
                                return Err(CoreError::Domain(format!("land {land_id} has no pests")));
                            }
                            let item_id = resolve_item(&config, player, "pesticide", hint.as_deref())?;
                            *demand.entry(item_id.clone()).or_insert(0) += 1;
                            resolved.push((*land_id, action.clone(), Some(item_id)));
                        }
                    }
                }
                for (item_id, qty) in &demand {
                    let player = tx.get();
                    let have = player.inventory.get(item_id).map(|s| s.quantity).unwrap_or(0);
                    let locked = player.inventory.get(item_id).map(|s| s.metadata.locked).unwrap_or(false);
                    if have < *qty || locked {
                        return Err(CoreError::InsufficientResources(item_id.clone()));
                    }
                }

                for (land_id, action, item_id) in &resolved {
                    let land_id = *land_id;
                    match action {
                        CareAction::Water => {
                            tx.mutate(|p| {
                                if let Some(l) = p.land_mut(land_id) {
                                    l.needs_water = false;
                                }
                            });
                        }
                        CareAction::Fertilize => {
                            let id = item_id.as_ref().expect("fertilize always resolves an item");
                            let speed_bonus = config.items.get(id).and_then(|c| c.effect.speed_bonus_pct).unwrap_or(0);
                            let land = tx.get().land(land_id).cloned().ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?;
                            let remaining = land.harvest_time.map(|h| h - now).unwrap_or(0).max(0);
                            let reduced = (remaining as f64 * (1.0 - speed_bonus as f64 / 100.0)).floor() as i64;
                            let new_harvest = now + reduced.max(0);
                            let mut updated = land.clone();
                            updated.harvest_time = Some(new_harvest);
                            updated.check_invariants().map_err(CoreError::Domain)?;

                            inventory::remove(tx, id, 1)?;
                            tx.mutate(|p| {
                                if let Some(l) = p.land_mut(land_id) {
                                    l.harvest_time = Some(new_harvest);
                                    l.last_fertilized = Some(now);
                                }
                            });
                            scheduler.schedule_harvest(player_id, land_id, new_harvest);
                        }
                        CareAction::TreatPests => {
                            let id = item_id.as_ref().expect("treat_pests always resolves an item");
                            inventory::remove(tx, id, 1)?;
                            tx.mutate(|p| {
                                if let Some(l) = p.land_mut(land_id) {
                                    l.has_pests = false;
                                    l.last_treated = Some(now);
                                }
                            });
                        }
                    }
                }
                Ok(())
            })
            .await
    }

    /// `Steal(stealerId, targetId, landId)` (supplemented, §3 of the expanded spec). Locks both
    /// players in ascending-id order to avoid cross-deadlock with a concurrent reverse steal,
    /// rolls `DefenseSuccessRate` against the configured base attack stat, and always sets the
    /// target's steal cooldown regardless of outcome.
    pub async fn steal(&self, stealer_id: &str, target_id: &str, land_id: u32, rng: &mut impl Rng, now: Time) -> CoreResult<StealOutcomeResult> {
        if stealer_id == target_id {
            return Err(CoreError::Validation("cannot steal from self".into()));
        }
        let config = self.config.snapshot();
        let stealer_is_a = stealer_id < target_id;
        let (id_a, id_b) = if stealer_is_a { (stealer_id, target_id) } else { (target_id, stealer_id) };
        const STEAL_COOLDOWN_MINUTES: i64 = 30; // §9 open question: no authoritative value in source.

        self.players
            .execute_under_two_locks(id_a, "steal", id_b, "steal", |tx_a, tx_b| {
                let (stealer_tx, target_tx): (&mut PlayerTx<'_>, &mut PlayerTx<'_>) =
                    if stealer_is_a { (tx_a, tx_b) } else { (tx_b, tx_a) };

                let target = target_tx.get();
                let land = target.land(land_id).ok_or_else(|| CoreError::NotFound(format!("land {land_id}")))?;
                if !land.stealable {
                    return Err(CoreError::Domain("land is not stealable".into()));
                }
                if target.stealing.cooldown_end_time.map(|t| t > now).unwrap_or(false) {
                    return Err(CoreError::Domain("target is under steal cooldown".into()));
                }
                let crop_type = land.crop.clone().ok_or_else(|| CoreError::Domain("stealable land has no crop".into()))?;
                let crop_cfg = config.crops.get(&crop_type).ok_or_else(|| CoreError::ConfigMissing(format!("crop {crop_type}")))?;
                let modifiers = quality_modifiers(&config, land.quality);
                let land_quality = land.quality;
                let status = protection::get_status(target, now);
                let stealer_level = stealer_tx.get().level as i64;
                let owner_level = target.level as i64;

                let defense_rate = protection::defense_success_rate(status.total_defense_bonus, config.steal.base_attack);
                let roll = rng.gen_range(0..100i64);
                let defended = roll < defense_rate;

                target_tx.mutate(|p| {
                    p.stealing.cooldown_end_time = Some(now + STEAL_COOLDOWN_MINUTES * 60_000);
                });

                if defended {
                    return Ok(StealOutcomeResult { success: false, stealer_gain: 0, owner_loss: 0, bonus_coins: 0, defense_rate, roll });
                }

                let outcome = calc::steal_share(crop_cfg.base_yield, modifiers.production_bonus_pct, stealer_level, owner_level);
                let stealer_gain = outcome.stealer_gain.max(0) as u32;
                let owner_loss = outcome.owner_loss.max(0) as u32;

                let quality_key = format!("{land_quality:?}").to_lowercase();
                let quality_bonus_mult = config.steal.rewards.bonus_by_quality.get(&quality_key).copied().unwrap_or(0.0);
                let bonus_coins = ((stealer_gain as f64) * (crop_cfg.base_price as f64) * quality_bonus_mult).floor().max(0.0) as u64;

                inventory::add(stealer_tx, &config, &crop_type, stealer_gain, now)?;
                if bonus_coins > 0 {
                    stealer_tx.mutate(|p| p.coins += bonus_coins);
                }
                stealer_tx.mutate(|p| p.statistics.times_stole_successfully += 1);
                target_tx.mutate(|p| {
                    if let Some(l) = p.land_mut(land_id) {
                        l.stolen_qty = l.stolen_qty.saturating_add(owner_loss);
                    }
                    p.statistics.times_stolen_from += 1;
                });

                Ok(StealOutcomeResult { success: true, stealer_gain, owner_loss, bonus_coins, defense_rate, roll })
            })
            .await
    }

    /// `Sell(playerId, itemId, qty)` (supplemented, §3 of the expanded spec — spec.md names
    /// `ShopPrice` (§4.4) and `MarketEngine.RecordTransaction` (§4.10) but never wires the
    /// player-facing operation that puts them together). Removes the items and credits
    /// `ShopPrice(..., Sell, level)` coins under the player's own `market` purpose lock, bumps
    /// `statistics.itemsSold`, then reports the sale to `MarketEngine` once the lock is released
    /// — floating-supply accounting doesn't need to be atomic with the player's own write.
    pub async fn sell(&self, player_id: &str, item_id: &str, qty: u32, now: Time) -> CoreResult<SellOutcome> {
        if qty == 0 {
            return Err(CoreError::Validation("sell quantity must be positive".into()));
        }
        let config = self.config.snapshot();
        let base_price = config
            .items
            .get(item_id)
            .map(|c| c.price)
            .or_else(|| config.crops.get(item_id).map(|c| c.base_price))
            .ok_or_else(|| CoreError::ConfigMissing(format!("item {item_id}")))?;

        let item_id_owned = item_id.to_string();
        let outcome = self
            .players
            .execute_under_lock(player_id, "market", move |tx| {
                inventory::remove(tx, &item_id_owned, qty)?;
                let level = tx.get().level;
                let proceeds = calc::shop_price(base_price as i64, qty as i64, calc::ShopOp::Sell, level).max(0) as u64;
                tx.mutate(|p| {
                    p.coins += proceeds;
                    p.statistics.items_sold += qty as u64;
                });
                Ok(SellOutcome { item_id: item_id_owned.clone(), qty, coins_earned: proceeds })
            })
            .await?;

        self.market.record_transaction(item_id, qty as i64, TransactionKind::Sell, now).await?;
        Ok(outcome)
    }
}
