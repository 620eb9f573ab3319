//! farmstead_core — the farm-simulation backend described across C1–C15: config, storage,
//! domain math, and the player-facing operations that compose them. Chat dispatch, rendering,
//! and any outer CLI/HTTP surface are adapters that consume this crate through `adapters`; none
//! of them live here.

pub mod adapters;
pub mod backup;
pub mod config;
pub mod crop_lifecycle;
pub mod domain;
pub mod error;
pub mod market;
pub mod model;
pub mod player;
pub mod protection;
pub mod ranking;
pub mod scheduler;
pub mod store;
pub mod task_loop;

use crate::config::ConfigRegistry;
use crate::crop_lifecycle::CropLifecycle;
use crate::error::CoreResult;
use crate::market::MarketEngine;
use crate::player::store::PlayerStore;
use crate::ranking::RankingService;
use crate::scheduler::Scheduler;
use crate::store::file_store::FileStore;
use crate::store::kv::MemoryStore;
use crate::store::lock::LockManager;
use crate::task_loop::{JobSpec, TaskLoop};
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;

/// Every C1–C15 service wired together against the production backend (§5: `MemoryStore` is the
/// designated in-process engine, not a test double). `main.rs` builds one of these and runs it;
/// tests build narrower slices of the same services directly.
pub struct Engine {
    pub config: Arc<ConfigRegistry>,
    pub files: Arc<FileStore>,
    pub players: Arc<PlayerStore<MemoryStore>>,
    pub scheduler: Arc<Scheduler<MemoryStore, MemoryStore>>,
    pub market: Arc<MarketEngine>,
    pub crop_lifecycle: Arc<CropLifecycle<MemoryStore, MemoryStore>>,
    pub backup: Arc<backup::BackupWorker>,
    pub ranking: Arc<RankingService>,
    pub tasks: Arc<TaskLoop<MemoryStore>>,
}

impl Engine {
    /// Loads config from `config_dir`, opens `data_dir` as the file store, and registers every
    /// maintenance job C14 names (§4.14) against fresh in-process backends (§5). Does not start
    /// any background work — call `start()` once the caller is ready to run forever.
    pub fn build(config_dir: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let config = Arc::new(ConfigRegistry::load(config_dir.as_ref())?);
        let files = Arc::new(FileStore::new(data_dir.as_ref())?);
        let lock_backend = Arc::new(MemoryStore::new());
        let locks = Arc::new(LockManager::new(lock_backend));
        let players = Arc::new(PlayerStore::new(files.clone(), locks.clone(), config.clone()));
        let zsets = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(Scheduler::new(zsets, players.clone(), config.clone()));
        let market = MarketEngine::new(files.clone(), config.clone())?;
        let crop_lifecycle =
            Arc::new(CropLifecycle::new(players.clone(), config.clone(), scheduler.clone(), market.clone()));
        let backup = backup::BackupWorker::new(files.clone(), config.clone());
        let ranking = Arc::new(RankingService::new(files.clone(), config.clone()));

        let mut tasks = TaskLoop::new(locks);
        {
            let scheduler = scheduler.clone();
            tasks.register(JobSpec::new("dispatchHarvest", 5_000, 10_000), move |now| {
                let scheduler = scheduler.clone();
                async move { scheduler.dispatch_harvest(now).await.map(|_| ()) }
            });
        }
        {
            let scheduler = scheduler.clone();
            tasks.register(JobSpec::new("dispatchCare", 5_000, 10_000), move |now| {
                let scheduler = scheduler.clone();
                async move {
                    let mut rng = rand::rngs::StdRng::from_entropy();
                    scheduler.dispatch_care(&mut rng, now).await.map(|_| ())
                }
            });
        }
        {
            let market = market.clone();
            tasks.register(JobSpec::new("archiveDailySupply", 86_400_000, 30_000), move |now| {
                let market = market.clone();
                async move { market.archive_all_daily_supply(now).await }
            });
        }
        {
            let market = market.clone();
            let mut spec = JobSpec::new("statsReset", 60_000, 30_000);
            spec.local_midnight_only = true;
            tasks.register(spec, move |now| {
                let market = market.clone();
                async move { market.reset_daily_stats(now).await }
            });
        }
        {
            let ranking = ranking.clone();
            tasks.register(JobSpec::new("rankingRefresh", 60_000, 30_000), move |now| {
                let ranking = ranking.clone();
                async move { ranking.refresh(now).map(|_| ()) }
            });
        }
        let tasks = Arc::new(tasks);

        Ok(Self { config, files, players, scheduler, market, crop_lifecycle, backup, ranking, tasks })
    }

    /// Starts `BackupWorker` and `TaskLoop`'s background loops. Idempotent (both workers are).
    pub fn start(&self) {
        self.backup.start();
        self.tasks.start();
    }

    pub fn stop(&self) {
        self.backup.stop();
        self.tasks.stop();
    }
}
