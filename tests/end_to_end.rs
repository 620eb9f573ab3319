//! Cross-module scenarios from the crate's testable-properties list: a full plant → dispatch →
//! harvest cycle driven by real `Scheduler`/`CropLifecycle` wiring, and lock contention across
//! two concurrent operations on the same player.

use farmstead_core::config::ConfigRegistry;
use farmstead_core::crop_lifecycle::CropLifecycle;
use farmstead_core::market::MarketEngine;
use farmstead_core::model::LandStatus;
use farmstead_core::player::store::PlayerStore;
use farmstead_core::scheduler::Scheduler;
use farmstead_core::store::file_store::FileStore;
use farmstead_core::store::kv::MemoryStore;
use farmstead_core::store::lock::LockManager;
use rand::rngs::mock::StepRng;
use std::sync::Arc;

const DEFAULT_YAML: &str = r#"
crops:
  wheat:
    name: Wheat
    required_level: 1
    grow_time: 60
    base_yield: 3
    experience: 10
    base_price: 5
    category: crops
items:
  seeds:
    wheat_seed:
      name: Wheat Seed
      price: 2
      max_stack: 50
      category: seeds
  crops:
    wheat:
      name: Wheat
      price: 5
      max_stack: 99
      category: crops
land:
  default:
    starting_lands: 2
    max_lands: 5
levels:
  "1":
    experience: 0
"#;

fn setup() -> (
    CropLifecycle<MemoryStore, MemoryStore>,
    Arc<Scheduler<MemoryStore, MemoryStore>>,
    Arc<PlayerStore<MemoryStore>>,
    tempfile::TempDir,
) {
    let tmp = tempfile::tempdir().unwrap();
    let cfg_dir = tmp.path().join("config");
    std::fs::create_dir_all(&cfg_dir).unwrap();
    std::fs::write(cfg_dir.join("default.yaml"), DEFAULT_YAML).unwrap();

    let config = Arc::new(ConfigRegistry::load(&cfg_dir).unwrap());
    let files = Arc::new(FileStore::new(tmp.path().join("data")).unwrap());
    let locks = Arc::new(LockManager::new(Arc::new(MemoryStore::new())));
    let players = Arc::new(PlayerStore::new(files.clone(), locks, config.clone()));
    let zsets = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(Scheduler::new(zsets, players.clone(), config.clone()));
    let market = MarketEngine::new(files, config.clone()).unwrap();
    let lifecycle = CropLifecycle::new(players.clone(), config, scheduler.clone(), market);
    (lifecycle, scheduler, players, tmp)
}

// Scenario 1 (§8): plant a wheat seed, let the scheduler mature the land at the grow-time
// boundary, then harvest — inventory and experience land exactly where spec.md's example says.
#[tokio::test]
async fn plant_then_harvest_at_maturity() {
    let (lifecycle, scheduler, players, _tmp) = setup();
    players.load_or_create("p1", "P1").unwrap();
    players
        .execute_under_lock("p1", "general", |tx| {
            tx.mutate(|p| {
                p.inventory.insert(
                    "wheat_seed".into(),
                    farmstead_core::model::ItemStack {
                        item_id: "wheat_seed".into(),
                        quantity: 1,
                        max_stack: 50,
                        category: farmstead_core::model::ItemCategory::Seeds,
                        metadata: Default::default(),
                    },
                );
            });
            Ok(())
        })
        .await
        .unwrap();

    lifecycle.plant("p1", 1, "wheat", 1000).await.unwrap();
    let land = players.load("p1").unwrap().land(1).unwrap().clone();
    assert_eq!(land.status, LandStatus::Growing);
    assert_eq!(land.harvest_time, Some(61_000));

    let stats = scheduler.dispatch_harvest(61_000).await.unwrap();
    assert_eq!(stats.lands_matured, 1);
    assert_eq!(players.load("p1").unwrap().land(1).unwrap().status, LandStatus::Mature);

    let outcome = lifecycle.harvest("p1", Some(1), &mut StepRng::new(0, 0), 61_000).await.unwrap();
    assert_eq!(outcome.harvested.len(), 1);

    let p1 = players.load("p1").unwrap();
    assert_eq!(p1.inventory["wheat"].quantity, 3);
    assert_eq!(p1.experience, 10);
    let land = p1.land(1).unwrap();
    assert_eq!(land.status, LandStatus::Empty);
    assert!(land.crop.is_none());
}

// Scenario 6 (§8): a lock already held by one caller forces a concurrent `Plant` to exhaust its
// retries and fail with `ErrLockTimeout`, leaving the player's state untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_contention_times_out_without_mutating_state() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg_dir = tmp.path().join("config");
    std::fs::create_dir_all(&cfg_dir).unwrap();
    std::fs::write(cfg_dir.join("default.yaml"), DEFAULT_YAML).unwrap();
    let config = Arc::new(ConfigRegistry::load(&cfg_dir).unwrap());
    let files = Arc::new(FileStore::new(tmp.path().join("data")).unwrap());
    let locks = Arc::new(LockManager::with_max_attempts(Arc::new(MemoryStore::new()), 2));
    let players = Arc::new(PlayerStore::new(files.clone(), locks, config.clone()));
    let zsets = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(Scheduler::new(zsets, players.clone(), config.clone()));
    let market = MarketEngine::new(files, config.clone()).unwrap();
    let lifecycle = Arc::new(CropLifecycle::new(players.clone(), config, scheduler, market));

    players.load_or_create("p1", "P1").unwrap();
    players
        .execute_under_lock("p1", "general", |tx| {
            tx.mutate(|p| {
                p.inventory.insert(
                    "wheat_seed".into(),
                    farmstead_core::model::ItemStack {
                        item_id: "wheat_seed".into(),
                        quantity: 1,
                        max_stack: 50,
                        category: farmstead_core::model::ItemCategory::Seeds,
                        metadata: Default::default(),
                    },
                );
            });
            Ok(())
        })
        .await
        .unwrap();

    let held = players.clone();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let holder = tokio::spawn(async move {
        held.execute_under_lock("p1", "plant", |_tx| {
            let _ = tx.send(());
            std::thread::sleep(std::time::Duration::from_millis(400));
            Ok(())
        })
        .await
        .unwrap();
    });
    rx.await.unwrap();

    let err = lifecycle.plant("p1", 1, "wheat", 1000).await.unwrap_err();
    assert!(matches!(err, farmstead_core::error::CoreError::LockTimeout { .. }));
    holder.await.unwrap();

    let p1 = players.load("p1").unwrap();
    assert_eq!(p1.land(1).unwrap().status, LandStatus::Empty);
    assert_eq!(p1.inventory["wheat_seed"].quantity, 1);
}
