//! C5 PlayerStore — per-player aggregate persistence (§4.5). One YAML file per player id;
//! mutations are coalesced to a single atomic write via `ExecuteUnderLock`.

use crate::config::{ConfigRegistry, LevelRewardConfig};
use crate::error::{CoreError, CoreResult};
use crate::model::{Player, Time};
use crate::player::inventory;
use crate::store::file_store::FileStore;
use crate::store::kv::LockBackend;
use crate::store::lock::LockManager;
use chrono::TimeZone;
use std::sync::Arc;

const DEFAULT_LEASE_MS: i64 = 10_000;
const ONE_DAY_MS: i64 = 86_400_000;

/// Outcome of `PlayerStore::record_sign_in` (§9 supplemented feature — `Player.signIn` is
/// present in the data model but spec.md never wires an operation that updates it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignInOutcome {
    pub consecutive_days: u32,
    pub total_sign_days: u32,
    pub already_signed_in_today: bool,
    pub reward: Option<LevelRewardConfig>,
}

fn date_string(now: Time) -> String {
    chrono::Utc
        .timestamp_millis_opt(now)
        .single()
        .unwrap_or_else(chrono::Utc::now)
        .format("%Y-%m-%d")
        .to_string()
}

fn player_rel_path(player_id: &str) -> String {
    format!("players/{player_id}.yaml")
}

pub struct PlayerStore<B: LockBackend> {
    files: Arc<FileStore>,
    locks: Arc<LockManager<B>>,
    config: Arc<ConfigRegistry>,
}

/// A mutable snapshot handed to the body of `ExecuteUnderLock` (§4.5). `Mutate` may be
/// called zero or more times; all mutations are coalesced into a single atomic persist.
pub struct PlayerTx<'a> {
    player: &'a mut Player,
    dirty: bool,
}

impl<'a> PlayerTx<'a> {
    pub fn get(&self) -> &Player {
        self.player
    }

    pub fn mutate(&mut self, f: impl FnOnce(&mut Player)) {
        f(self.player);
        self.dirty = true;
    }

    /// Builds a bare `PlayerTx` for unit tests of modules (e.g. `inventory`, `land`) that
    /// operate on a `PlayerTx` but don't need a real lock/file round trip.
    #[cfg(test)]
    pub(crate) fn for_test(player: &mut Player) -> PlayerTx<'_> {
        PlayerTx { player, dirty: false }
    }
}

impl<B: LockBackend> PlayerStore<B> {
    pub fn new(files: Arc<FileStore>, locks: Arc<LockManager<B>>, config: Arc<ConfigRegistry>) -> Self {
        Self { files, locks, config }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Loads the aggregate, or creates a fresh one from config defaults if absent
    /// (first sign-in, per §3 "Lifecycle").
    pub fn load_or_create(&self, player_id: &str, name: &str) -> CoreResult<Player> {
        let path = player_rel_path(player_id);
        if self.files.exists(&path) {
            return self.files.read_yaml(&path, Player::new(player_id, name, Self::now_ms(), 0, 0, 0));
        }
        let snap = self.config.snapshot();
        let now = Self::now_ms();
        let player = Player::new(
            player_id,
            name,
            now,
            snap.land_default.starting_lands.max(1),
            20,
            200,
        );
        self.files.write_yaml(&path, &player)?;
        Ok(player)
    }

    pub fn load(&self, player_id: &str) -> CoreResult<Player> {
        let path = player_rel_path(player_id);
        self.files
            .read_yaml(&path, None::<Player>)?
            .ok_or_else(|| CoreError::NotFound(format!("player {player_id}")))
    }

    fn save(&self, player: &Player) -> CoreResult<()> {
        self.files.write_yaml(&player_rel_path(&player.id), player)
    }

    /// Applies a typed field patch outside of a lock context and bumps `last_updated`.
    /// Intended for adapter-driven, single-field updates that don't need full lifecycle
    /// semantics (§4.5).
    pub fn update_fields(&self, player_id: &str, patch: impl FnOnce(&mut Player)) -> CoreResult<Player> {
        let mut player = self.load(player_id)?;
        patch(&mut player);
        player.last_updated = Self::now_ms();
        self.save(&player)?;
        Ok(player)
    }

    /// Bumps the daily sign-in streak and grants any configured milestone reward through the
    /// same coins/items path `CropLifecycle::harvest` uses for level-up rewards. A second call
    /// on the same UTC day is a no-op (no write, `already_signed_in_today: true`).
    pub async fn record_sign_in(&self, player_id: &str, now: Time) -> CoreResult<SignInOutcome> {
        let config = self.config.snapshot();
        let today = date_string(now);
        let yesterday = date_string(now - ONE_DAY_MS);

        self.execute_under_lock(player_id, "general", move |tx| {
            if tx.get().sign_in.last_sign_date.as_deref() == Some(today.as_str()) {
                let s = &tx.get().sign_in;
                return Ok(SignInOutcome {
                    consecutive_days: s.consecutive_days,
                    total_sign_days: s.total_sign_days,
                    already_signed_in_today: true,
                    reward: None,
                });
            }

            let is_consecutive = tx.get().sign_in.last_sign_date.as_deref() == Some(yesterday.as_str());
            tx.mutate(|p| {
                p.sign_in.consecutive_days = if is_consecutive { p.sign_in.consecutive_days + 1 } else { 1 };
                p.sign_in.total_sign_days += 1;
                p.sign_in.last_sign_date = Some(today.clone());
            });

            let consecutive_days = tx.get().sign_in.consecutive_days;
            let total_sign_days = tx.get().sign_in.total_sign_days;
            let reward = config.sign_in.get(&consecutive_days).cloned();
            if let Some(r) = &reward {
                let coins = r.coins;
                tx.mutate(|p| p.coins += coins);
                for (item_id, qty) in &r.items {
                    let _ = inventory::add(tx, &config, item_id, *qty, now);
                }
            }

            Ok(SignInOutcome { consecutive_days, total_sign_days, already_signed_in_today: false, reward })
        })
        .await
    }

    /// Acquires `lock:{player_id}:{purpose}`, loads the aggregate, passes a mutable
    /// snapshot to `body`. On `Ok`, writes back once if anything was mutated; on `Err`,
    /// the snapshot is dropped without writing (§4.5, §7: "Body errors must roll the
    /// snapshot back by not writing").
    pub async fn execute_under_lock<T>(
        &self,
        player_id: &str,
        purpose: &str,
        body: impl FnOnce(&mut PlayerTx<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let files = self.files.clone();
        let player_id_owned = player_id.to_string();
        self.locks
            .with_lock(player_id, purpose, DEFAULT_LEASE_MS, move || async move {
                let mut player = files
                    .read_yaml(&player_rel_path(&player_id_owned), None::<Player>)?
                    .ok_or_else(|| CoreError::NotFound(format!("player {player_id_owned}")))?;
                let mut tx = PlayerTx { player: &mut player, dirty: false };
                let value = body(&mut tx)?;
                let dirty = tx.dirty;
                if dirty {
                    player.last_updated = chrono::Utc::now().timestamp_millis();
                    files.write_yaml(&player_rel_path(&player_id_owned), &player)?;
                }
                Ok(value)
            })
            .await
    }

    /// Locks two distinct players at once, in caller-chosen order, for operations that must
    /// touch both aggregates atomically (e.g. stealing). Callers are responsible for always
    /// requesting the same (id_a, id_b) ordering for a given unordered pair so two concurrent
    /// calls can't lock in opposite order and deadlock.
    pub async fn execute_under_two_locks<T>(
        &self,
        id_a: &str,
        purpose_a: &str,
        id_b: &str,
        purpose_b: &str,
        body: impl for<'a> FnOnce(&mut PlayerTx<'a>, &mut PlayerTx<'a>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let files = self.files.clone();
        let locks_inner = self.locks.clone();
        let id_a_owned = id_a.to_string();
        let id_b_owned = id_b.to_string();
        let purpose_b_owned = purpose_b.to_string();

        self.locks
            .with_lock(id_a, purpose_a, DEFAULT_LEASE_MS, move || async move {
                let id_a_path = id_a_owned.clone();
                let id_b_path = id_b_owned.clone();
                let files_for_load = files.clone();
                locks_inner
                    .with_lock(&id_b_owned, &purpose_b_owned, DEFAULT_LEASE_MS, move || async move {
                        let mut player_a = files_for_load
                            .read_yaml(&player_rel_path(&id_a_path), None::<Player>)?
                            .ok_or_else(|| CoreError::NotFound(format!("player {id_a_path}")))?;
                        let mut player_b = files_for_load
                            .read_yaml(&player_rel_path(&id_b_path), None::<Player>)?
                            .ok_or_else(|| CoreError::NotFound(format!("player {id_b_path}")))?;
                        let mut tx_a = PlayerTx { player: &mut player_a, dirty: false };
                        let mut tx_b = PlayerTx { player: &mut player_b, dirty: false };
                        let value = body(&mut tx_a, &mut tx_b)?;
                        let dirty_a = tx_a.dirty;
                        let dirty_b = tx_b.dirty;
                        let now = chrono::Utc::now().timestamp_millis();
                        if dirty_a {
                            player_a.last_updated = now;
                            files_for_load.write_yaml(&player_rel_path(&id_a_path), &player_a)?;
                        }
                        if dirty_b {
                            player_b.last_updated = now;
                            files_for_load.write_yaml(&player_rel_path(&id_b_path), &player_b)?;
                        }
                        Ok(value)
                    })
                    .await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemoryStore;

    fn setup() -> (PlayerStore<MemoryStore>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_dir = tmp.path().join("config");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("default.yaml"),
            "crops:\n  wheat:\n    name: Wheat\n    required_level: 1\n    grow_time: 60\n    base_yield: 3\n    experience: 10\n    base_price: 5\n    category: crops\nland:\n  default:\n    starting_lands: 3\n    max_lands: 10\n",
        )
        .unwrap();
        let config = Arc::new(ConfigRegistry::load(&cfg_dir).unwrap());
        let files = Arc::new(FileStore::new(tmp.path().join("data")).unwrap());
        let locks = Arc::new(LockManager::new(Arc::new(MemoryStore::new())));
        (PlayerStore::new(files, locks, config), tmp)
    }

    #[test]
    fn load_or_create_persists_fresh_player() {
        let (store, _tmp) = setup();
        let p = store.load_or_create("p1", "Alice").unwrap();
        assert_eq!(p.lands.len(), 3);
        let reloaded = store.load("p1").unwrap();
        assert_eq!(reloaded.id, "p1");
    }

    #[tokio::test]
    async fn execute_under_lock_coalesces_writes() {
        let (store, _tmp) = setup();
        store.load_or_create("p1", "Alice").unwrap();
        store
            .execute_under_lock("p1", "general", |tx| {
                tx.mutate(|p| p.coins += 10);
                tx.mutate(|p| p.coins += 5);
                Ok(())
            })
            .await
            .unwrap();
        let reloaded = store.load("p1").unwrap();
        assert_eq!(reloaded.coins, 15);
    }

    #[tokio::test]
    async fn record_sign_in_first_call_starts_a_streak_of_one() {
        let (store, _tmp) = setup();
        store.load_or_create("p1", "Alice").unwrap();
        let outcome = store.record_sign_in("p1", 1_700_000_000_000).await.unwrap();
        assert_eq!(outcome.consecutive_days, 1);
        assert_eq!(outcome.total_sign_days, 1);
        assert!(!outcome.already_signed_in_today);
    }

    #[tokio::test]
    async fn record_sign_in_same_day_is_a_no_op() {
        let (store, _tmp) = setup();
        store.load_or_create("p1", "Alice").unwrap();
        store.record_sign_in("p1", 1_700_000_000_000).await.unwrap();
        let second = store.record_sign_in("p1", 1_700_000_000_000 + 60_000).await.unwrap();
        assert!(second.already_signed_in_today);
        assert_eq!(second.consecutive_days, 1);
    }

    #[tokio::test]
    async fn record_sign_in_next_day_extends_streak_and_a_gap_resets_it() {
        let (store, _tmp) = setup();
        store.load_or_create("p1", "Alice").unwrap();
        let day1 = 1_700_000_000_000i64;
        let day2 = day1 + ONE_DAY_MS;
        let day4 = day1 + 3 * ONE_DAY_MS; // skips day3 -> streak resets

        store.record_sign_in("p1", day1).await.unwrap();
        let second = store.record_sign_in("p1", day2).await.unwrap();
        assert_eq!(second.consecutive_days, 2);
        assert_eq!(second.total_sign_days, 2);

        let fourth = store.record_sign_in("p1", day4).await.unwrap();
        assert_eq!(fourth.consecutive_days, 1);
        assert_eq!(fourth.total_sign_days, 3);
    }

    #[tokio::test]
    async fn error_body_rolls_back_without_writing() {
        let (store, _tmp) = setup();
        store.load_or_create("p1", "Alice").unwrap();
        let result: CoreResult<()> = store
            .execute_under_lock("p1", "general", |tx| {
                tx.mutate(|p| p.coins += 1000);
                Err(CoreError::Validation("nope".into()))
            })
            .await;
        assert!(result.is_err());
        let reloaded = store.load("p1").unwrap();
        assert_eq!(reloaded.coins, 0);
    }
}
