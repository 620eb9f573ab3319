//! C8 Scheduler — time-ordered harvest maturity and care checkpoint dispatch across all
//! players (§4.8). Registration writes land the sorted sets; `dispatch_*` is driven by
//! `TaskLoop` once per tick and does the actual firing under per-player locks.

use crate::config::ConfigRegistry;
use crate::error::CoreResult;
use crate::model::{LandStatus, Time};
use crate::player::store::PlayerStore;
use crate::store::kv::{LockBackend, SortedSet};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const HARVEST_BATCH_LIMIT: usize = 1000;
const CARE_RETRY_DELAY_MS: i64 = 5_000;
const SEVEN_DAYS_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const SOON_DUE_WINDOW_MS: i64 = 60 * 60 * 1000;

const HARVEST_KEY: &str = "schedule:harvest";
const CARE_KEY: &str = "schedule:care";

fn harvest_member(player_id: &str, land_id: u32) -> String {
    format!("{player_id}:{land_id}")
}

fn care_member(player_id: &str, land_id: u32, care_type: &str, idx: usize) -> String {
    format!("{player_id}:{land_id}:{care_type}:{idx}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestDispatchStats {
    pub players_touched: u32,
    pub lands_matured: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CareDispatchStats {
    pub fired: u32,
    pub dropped: u32,
    pub retried: u32,
    pub abandoned: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total: usize,
    pub due: usize,
    pub soon_due: usize,
    pub pending: usize,
}

/// Upserts `schedule:harvest` and `schedule:care` entries; the firing loop itself lives in
/// `dispatch_harvest`/`dispatch_care`.
pub struct Scheduler<S: SortedSet, B: LockBackend> {
    zsets: Arc<S>,
    players: Arc<PlayerStore<B>>,
    config: Arc<ConfigRegistry>,
    care_retries: Mutex<HashMap<String, u32>>,
}

impl<S: SortedSet, B: LockBackend> Scheduler<S, B> {
    pub fn new(zsets: Arc<S>, players: Arc<PlayerStore<B>>, config: Arc<ConfigRegistry>) -> Self {
        Self { zsets, players, config, care_retries: Mutex::new(HashMap::new()) }
    }

    pub fn schedule_harvest(&self, player_id: &str, land_id: u32, at: Time) {
        self.zsets.zadd(HARVEST_KEY, at, &harvest_member(player_id, land_id));
    }

    pub fn cancel_harvest(&self, player_id: &str, land_id: u32) {
        self.zsets.zrem(HARVEST_KEY, &[harvest_member(player_id, land_id).as_str()]);
    }

    pub fn schedule_care_checkpoints(&self, player_id: &str, land_id: u32, plant_time: Time, harvest_time: Time) {
        let config = self.config.snapshot();
        let span = harvest_time - plant_time;
        for (care_type, type_cfg) in [("water", &config.care.water), ("pest", &config.care.pest)] {
            for (idx, progress) in type_cfg.checkpoints.iter().enumerate() {
                let score = plant_time + (span as f64 * progress).floor() as i64;
                self.zsets.zadd(CARE_KEY, score, &care_member(player_id, land_id, care_type, idx));
            }
        }
    }

    /// Removes every `schedule:care` member with prefix `{player_id}:{land_id}:`.
    pub fn cancel_care_for_land(&self, player_id: &str, land_id: u32) {
        let prefix = format!("{player_id}:{land_id}:");
        let all = self.zsets.zrange_by_score(CARE_KEY, i64::MIN, i64::MAX);
        let matching: Vec<String> = all.into_iter().map(|(m, _)| m).filter(|m| m.starts_with(&prefix)).collect();
        if matching.is_empty() {
            return;
        }
        let refs: Vec<&str> = matching.iter().map(|s| s.as_str()).collect();
        self.zsets.zrem(CARE_KEY, &refs);
    }

    /// Harvest dispatch (§4.8 step 1): fetch due entries bounded by `HARVEST_BATCH_LIMIT`,
    /// group by player, flip `growing` lands past `harvestTime` to `mature`/`stealable`.
    /// Fired members are removed regardless of whether the in-store land still matched.
    pub async fn dispatch_harvest(&self, now: Time) -> CoreResult<HarvestDispatchStats> {
        let mut due = self.zsets.zrange_by_score(HARVEST_KEY, i64::MIN, now);
        due.truncate(HARVEST_BATCH_LIMIT);

        let mut by_player: HashMap<String, Vec<u32>> = HashMap::new();
        for (member, _) in &due {
            if let Some((player_id, land_id_s)) = member.split_once(':') {
                if let Ok(land_id) = land_id_s.parse::<u32>() {
                    by_player.entry(player_id.to_string()).or_default().push(land_id);
                }
            }
        }

        let mut stats = HarvestDispatchStats::default();
        for (player_id, land_ids) in &by_player {
            let matured = self
                .players
                .execute_under_lock(player_id, "maturity", |tx| {
                    let mut matured_here = 0u32;
                    for &land_id in land_ids {
                        let matches = tx
                            .get()
                            .land(land_id)
                            .map(|l| l.status == LandStatus::Growing && l.harvest_time.map(|h| h <= now).unwrap_or(false))
                            .unwrap_or(false);
                        if matches {
                            tx.mutate(|p| {
                                if let Some(l) = p.land_mut(land_id) {
                                    l.status = LandStatus::Mature;
                                    l.stealable = true;
                                }
                            });
                            matured_here += 1;
                        }
                    }
                    Ok(matured_here)
                })
                .await
                .unwrap_or(0);
            stats.lands_matured += matured;
            stats.players_touched += 1;

            for &land_id in land_ids {
                self.zsets.zrem(HARVEST_KEY, &[harvest_member(player_id, land_id).as_str()]);
            }
        }
        Ok(stats)
    }

    /// Care dispatch (§4.8 step 2): pop the earliest-scored checkpoint; stop once the head is
    /// not yet due. Idempotence and lottery are evaluated under the player's `care` lock; on
    /// firing failure the member is requeued with a 5s delay up to `care.care_retry_limit`.
    pub async fn dispatch_care(&self, rng: &mut impl rand::Rng, now: Time) -> CoreResult<CareDispatchStats> {
        let mut stats = CareDispatchStats::default();
        loop {
            let Some((member, score)) = self.zsets.zpop_min(CARE_KEY) else { break };
            if score > now {
                self.zsets.zadd(CARE_KEY, score, &member);
                break;
            }

            let parts: Vec<&str> = member.splitn(4, ':').collect();
            let (player_id, land_id, care_type) = match parts.as_slice() {
                [p, l, t, _idx] => match l.parse::<u32>() {
                    Ok(land_id) => (*p, land_id, *t),
                    Err(_) => {
                        stats.dropped += 1;
                        continue;
                    }
                },
                _ => {
                    stats.dropped += 1;
                    continue;
                }
            };

            let config = self.config.snapshot();
            let probability = match care_type {
                "water" => config.care.water.probability,
                "pest" => config.care.pest.probability,
                _ => {
                    stats.dropped += 1;
                    continue;
                }
            };
            let roll: f64 = rng.r#gen();

            let outcome = self
                .players
                .execute_under_lock(player_id, "care", |tx| {
                    let land = match tx.get().land(land_id) {
                        Some(l) => l.clone(),
                        None => return Ok(CareFireOutcome::Dropped),
                    };
                    if land.status != LandStatus::Growing {
                        return Ok(CareFireOutcome::Dropped);
                    }
                    if care_type == "water" && land.needs_water {
                        return Ok(CareFireOutcome::Dropped);
                    }
                    if care_type == "pest" && land.has_pests {
                        return Ok(CareFireOutcome::Dropped);
                    }
                    if roll >= probability {
                        return Ok(CareFireOutcome::Consumed);
                    }
                    if care_type == "water" {
                        let remaining = land.harvest_time.map(|h| h - now).unwrap_or(0).max(0);
                        let mut rescheduled = None;
                        let growth_delay = config.care.water.penalty.penalty_type == "growthDelay";
                        if growth_delay && !land.water_delay_applied {
                            let delay_ms = (remaining as f64 * config.care.water.penalty.delay_percent as f64 / 100.0).floor() as i64;
                            let new_harvest_time = land.harvest_time.map(|h| h + delay_ms);
                            tx.mutate(|p| {
                                if let Some(l) = p.land_mut(land_id) {
                                    l.needs_water = true;
                                    l.harvest_time = new_harvest_time;
                                    l.water_delay_applied = true;
                                    l.water_delay_ms = delay_ms;
                                }
                            });
                            rescheduled = new_harvest_time;
                        } else {
                            tx.mutate(|p| {
                                if let Some(l) = p.land_mut(land_id) {
                                    l.needs_water = true;
                                }
                            });
                        }
                        Ok(CareFireOutcome::FiredWater { rescheduled_harvest_time: rescheduled })
                    } else {
                        tx.mutate(|p| {
                            if let Some(l) = p.land_mut(land_id) {
                                l.has_pests = true;
                            }
                        });
                        Ok(CareFireOutcome::FiredPest)
                    }
                })
                .await;

            match outcome {
                Ok(CareFireOutcome::Dropped) => stats.dropped += 1,
                Ok(CareFireOutcome::Consumed) => stats.dropped += 1,
                Ok(CareFireOutcome::FiredPest) => stats.fired += 1,
                Ok(CareFireOutcome::FiredWater { rescheduled_harvest_time: Some(new_time) }) => {
                    stats.fired += 1;
                    self.zsets.zadd(HARVEST_KEY, new_time, &harvest_member(player_id, land_id));
                }
                Ok(CareFireOutcome::FiredWater { rescheduled_harvest_time: None }) => stats.fired += 1,
                Err(e) => {
                    let retry_limit = config.care.care_retry_limit;
                    let mut retries = self.care_retries.lock().expect("care retry map poisoned");
                    let count = retries.entry(member.clone()).or_insert(0);
                    *count += 1;
                    if *count > retry_limit {
                        retries.remove(&member);
                        stats.abandoned += 1;
                        tracing::warn!(member = %member, error = %e, "care checkpoint abandoned after retry limit");
                    } else {
                        stats.retried += 1;
                        self.zsets.zadd(CARE_KEY, now + CARE_RETRY_DELAY_MS, &member);
                    }
                }
            }
        }
        Ok(stats)
    }

    /// `CleanupExpired(beforeTime)` (§4.8): drops harvest entries older than 7 days before
    /// `before_time`, which should never fire (a ticket that old implies a crashed process
    /// lost its land write before the scheduler entry).
    pub fn cleanup_expired(&self, before_time: Time) -> usize {
        let cutoff = before_time - SEVEN_DAYS_MS;
        let removed = self.zsets.zrem_range_by_score(HARVEST_KEY, i64::MIN, cutoff);
        if removed > 0 {
            tracing::info!(removed, cutoff, "cleaned up expired harvest tickets");
        }
        removed
    }

    pub fn stats(&self, now: Time) -> SchedulerStats {
        let harvest_total = self.zsets.zcard(HARVEST_KEY);
        let care_total = self.zsets.zcard(CARE_KEY);
        let harvest_due = self.zsets.zrange_by_score(HARVEST_KEY, i64::MIN, now).len();
        let care_due = self.zsets.zrange_by_score(CARE_KEY, i64::MIN, now).len();
        let harvest_soon = self.zsets.zrange_by_score(HARVEST_KEY, now + 1, now + SOON_DUE_WINDOW_MS).len();
        let care_soon = self.zsets.zrange_by_score(CARE_KEY, now + 1, now + SOON_DUE_WINDOW_MS).len();
        let total = harvest_total + care_total;
        let due = harvest_due + care_due;
        let soon_due = harvest_soon + care_soon;
        SchedulerStats { total, due, soon_due, pending: total.saturating_sub(due + soon_due) }
    }
}

enum CareFireOutcome {
    Dropped,
    Consumed,
    FiredPest,
    FiredWater { rescheduled_harvest_time: Option<Time> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::file_store::FileStore;
    use crate::store::kv::MemoryStore;
    use crate::store::lock::LockManager;
    use rand::rngs::mock::StepRng;

    fn setup() -> (Scheduler<MemoryStore, MemoryStore>, Arc<PlayerStore<MemoryStore>>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_dir = tmp.path().join("config");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("default.yaml"),
            "crops:\n  wheat:\n    name: Wheat\n    required_level: 1\n    grow_time: 60\n    base_yield: 3\n    experience: 10\n    base_price: 5\n    category: crops\nland:\n  default:\n    starting_lands: 1\n    max_lands: 10\ncare:\n  water:\n    checkpoints: [0.5]\n    probability: 1.0\n    penalty:\n      type: growthDelay\n      delay_percent: 10\n  pest:\n    checkpoints: [0.5]\n    probability: 1.0\n",
        )
        .unwrap();
        let config = Arc::new(ConfigRegistry::load(&cfg_dir).unwrap());
        let files = Arc::new(FileStore::new(tmp.path().join("data")).unwrap());
        let locks = Arc::new(LockManager::new(Arc::new(MemoryStore::new())));
        let players = Arc::new(PlayerStore::new(files, locks, config.clone()));
        let zsets = Arc::new(MemoryStore::new());
        (Scheduler::new(zsets, players.clone(), config), players, tmp)
    }

    #[test]
    fn schedule_and_cancel_harvest_round_trip() {
        let (sched, _players, _tmp) = setup();
        sched.schedule_harvest("p1", 1, 1000);
        assert_eq!(sched.stats(0).total, 1);
        sched.cancel_harvest("p1", 1);
        assert_eq!(sched.stats(0).total, 0);
    }

    #[test]
    fn cancel_care_for_land_removes_only_that_lands_prefix() {
        let (sched, _players, _tmp) = setup();
        sched.schedule_care_checkpoints("p1", 1, 0, 1000);
        sched.schedule_care_checkpoints("p1", 2, 0, 1000);
        sched.cancel_care_for_land("p1", 1);
        let remaining = sched.zsets.zrange_by_score(CARE_KEY, i64::MIN, i64::MAX);
        assert!(remaining.iter().all(|(m, _)| m.starts_with("p1:2:")));
    }

    #[tokio::test]
    async fn dispatch_harvest_matures_due_growing_lands() {
        let (sched, players, _tmp) = setup();
        players.load_or_create("p1", "Alice").unwrap();
        players
            .execute_under_lock("p1", "general", |tx| {
                tx.mutate(|p| {
                    let land = p.land_mut(1).unwrap();
                    land.status = LandStatus::Growing;
                    land.crop = Some("wheat".into());
                    land.plant_time = Some(0);
                    land.harvest_time = Some(500);
                });
                Ok(())
            })
            .await
            .unwrap();
        sched.schedule_harvest("p1", 1, 500);

        let stats = sched.dispatch_harvest(1000).await.unwrap();
        assert_eq!(stats.lands_matured, 1);
        let player = players.load("p1").unwrap();
        assert_eq!(player.land(1).unwrap().status, LandStatus::Mature);
        assert!(player.land(1).unwrap().stealable);
        assert_eq!(sched.stats(2000).total, 0);
    }

    #[tokio::test]
    async fn dispatch_care_fires_water_and_applies_growth_delay() {
        let (sched, players, _tmp) = setup();
        players.load_or_create("p1", "Alice").unwrap();
        players
            .execute_under_lock("p1", "general", |tx| {
                tx.mutate(|p| {
                    let land = p.land_mut(1).unwrap();
                    land.status = LandStatus::Growing;
                    land.plant_time = Some(0);
                    land.harvest_time = Some(1000);
                });
                Ok(())
            })
            .await
            .unwrap();
        sched.zsets.zadd(CARE_KEY, 500, &care_member("p1", 1, "water", 0));

        let mut rng = StepRng::new(0, 0); // always rolls 0.0, always below any probability > 0
        let stats = sched.dispatch_care(&mut rng, 10_000).await.unwrap();
        assert_eq!(stats.fired, 1);
        let player = players.load("p1").unwrap();
        let land = player.land(1).unwrap();
        assert!(land.needs_water);
        assert!(land.water_delay_applied);
        assert!(land.harvest_time.unwrap() > 1000);
    }

    #[tokio::test]
    async fn dispatch_care_is_idempotent_when_already_needs_water() {
        let (sched, players, _tmp) = setup();
        players.load_or_create("p1", "Alice").unwrap();
        players
            .execute_under_lock("p1", "general", |tx| {
                tx.mutate(|p| {
                    let land = p.land_mut(1).unwrap();
                    land.status = LandStatus::Growing;
                    land.plant_time = Some(0);
                    land.harvest_time = Some(1000);
                    land.needs_water = true;
                });
                Ok(())
            })
            .await
            .unwrap();
        sched.zsets.zadd(CARE_KEY, 500, &care_member("p1", 1, "water", 0));

        let mut rng = StepRng::new(0, 0);
        let stats = sched.dispatch_care(&mut rng, 10_000).await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.fired, 0);
    }
}
