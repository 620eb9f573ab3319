//! C1 ConfigRegistry — typed, read-mostly access to crop/item/level/land/market/backup/
//! steal/ranking tables, with atomic hot reload (§4.1).
//!
//! Readers never see a torn config: `ConfigRegistry::snapshot()` hands out an `Arc` to one
//! immutable generation; reload swaps the `Arc` behind a `RwLock` in one step.

use crate::error::{CoreError, CoreResult};
use crate::model::LandQuality;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CropConfig {
    pub name: String,
    pub required_level: u32,
    /// seconds, per §6; converted to ms by callers.
    pub grow_time: i64,
    pub base_yield: i64,
    pub experience: i64,
    pub base_price: u64,
    pub category: String,
    #[serde(default)]
    pub is_dynamic_price: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ItemEffect {
    #[serde(default)]
    pub speed_bonus_pct: Option<i64>,
    #[serde(default)]
    pub defense_bonus: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ItemConfig {
    pub name: String,
    pub price: u64,
    #[serde(default)]
    pub sell_price: Option<u64>,
    #[serde(default = "default_max_stack")]
    pub max_stack: u32,
    pub category: String,
    #[serde(default)]
    pub is_dynamic_price: bool,
    #[serde(default)]
    pub effect: ItemEffect,
}

fn default_max_stack() -> u32 {
    99
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpgradeCost {
    pub gold_cost: u64,
    pub level_required: u32,
    #[serde(default)]
    pub materials: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LandQualityConfig {
    pub time_reduction: i64,
    pub production_bonus: i64,
    pub experience_bonus: i64,
    #[serde(default)]
    pub upgrade: UpgradeCost,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LandDefaultConfig {
    pub starting_lands: u32,
    pub max_lands: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LandExpansionStep {
    pub gold_cost: u64,
    pub level_required: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MarketFloatingConfig {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MarketPricingConfig {
    #[serde(default = "default_history_days")]
    pub history_days: usize,
    #[serde(default)]
    pub min_base_supply: u64,
}

fn default_history_days() -> usize {
    7
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MarketConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default)]
    pub pricing: MarketPricingConfig,
    #[serde(default)]
    pub floating_items: MarketFloatingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    pub interval: i64,
    pub max_backups: usize,
    pub file_prefix: String,
    #[serde(default)]
    pub start_delay: i64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: i64,
    #[serde(default)]
    pub compress: bool,
}

fn default_retry_count() -> u32 {
    3
}
fn default_retry_interval() -> i64 {
    2000
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 3_600_000,
            max_backups: 24,
            file_prefix: "farm_backup_".into(),
            start_delay: 10_000,
            retry_count: default_retry_count(),
            retry_interval: default_retry_interval(),
            compress: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StealConfig {
    pub rewards: StealRewards,
    #[serde(default = "default_base_attack")]
    pub base_attack: i64,
}

fn default_base_attack() -> i64 {
    100
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StealRewards {
    #[serde(default)]
    pub bonus_by_quality: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankingConfig {
    pub score_weights: ScoreWeights,
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_ms: i64,
}

fn default_cache_timeout() -> i64 {
    60_000
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self { score_weights: ScoreWeights::default(), cache_timeout_ms: default_cache_timeout() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScoreWeights {
    pub land_count_weight: f64,
    pub land_quality_bonus_weight: f64,
    pub level_weight: f64,
    pub assets_log10_weight: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CarePenaltyConfig {
    #[serde(rename = "type")]
    pub penalty_type: String,
    #[serde(default)]
    pub delay_percent: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CareTypeConfig {
    pub checkpoints: Vec<f64>,
    pub probability: f64,
    #[serde(default)]
    pub penalty: CarePenaltyConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CareConfig {
    #[serde(default)]
    pub water: CareTypeConfig,
    #[serde(default)]
    pub pest: CareTypeConfig,
    #[serde(default = "default_pest_penalty_pct")]
    pub pest_penalty_percent: i64,
    #[serde(default)]
    pub care_retry_limit: u32,
}

fn default_pest_penalty_pct() -> i64 {
    20 // §9 open question: no authoritative value in source, config-overridable fallback.
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct LevelRewardConfig {
    #[serde(default)]
    pub coins: u64,
    #[serde(default)]
    pub items: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LevelConfig {
    pub experience: u64,
    #[serde(default)]
    pub rewards: Option<LevelRewardConfig>,
}

/// One immutable generation of the whole config surface (§6). Produced by `ConfigRegistry::load`.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub crops: HashMap<String, CropConfig>,
    pub items: HashMap<String, ItemConfig>,
    pub levels: HashMap<u32, LevelConfig>,
    pub land_quality: HashMap<LandQuality, LandQualityConfig>,
    pub land_default: LandDefaultConfig,
    pub land_expansion: HashMap<u32, LandExpansionStep>,
    pub market: MarketConfig,
    pub backup: BackupConfig,
    pub steal: StealConfig,
    pub ranking: RankingConfig,
    pub care: CareConfig,
    /// Milestone reward keyed by consecutive sign-in day count; same shape as a level-up
    /// reward, applied through the same coins/items grant path.
    pub sign_in: HashMap<u32, LevelRewardConfig>,
}

/// Raw on-disk shape; deserialized then reshaped into `ConfigSnapshot` (land quality keys
/// are strings on disk, accepting legacy aliases per §9).
#[derive(Debug, Clone, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    crops: HashMap<String, CropConfig>,
    #[serde(default)]
    items: HashMap<String, HashMap<String, ItemConfig>>,
    #[serde(default)]
    levels: HashMap<String, LevelConfig>,
    #[serde(default)]
    land: RawLandConfig,
    #[serde(default)]
    market: MarketConfig,
    #[serde(default)]
    backup: Option<BackupConfig>,
    #[serde(default)]
    steal: StealConfig,
    #[serde(default)]
    ranking: Option<RankingConfig>,
    #[serde(default)]
    care: CareConfig,
    #[serde(default)]
    sign_in: HashMap<String, LevelRewardConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawLandConfig {
    #[serde(default)]
    quality: HashMap<String, LandQualityConfig>,
    #[serde(default)]
    default: LandDefaultConfig,
    #[serde(default)]
    expansion: HashMap<String, LandExpansionStep>,
}

fn reshape(raw: RawConfig) -> CoreResult<ConfigSnapshot> {
    let mut items = HashMap::new();
    for (_category, table) in raw.items {
        for (id, cfg) in table {
            items.insert(id, cfg);
        }
    }

    let mut levels = HashMap::new();
    for (k, v) in raw.levels {
        let level: u32 = k.parse().map_err(|_| CoreError::ConfigMissing(format!("bad level key {k}")))?;
        levels.insert(level, v);
    }

    let mut land_quality = HashMap::new();
    for (k, v) in raw.land.quality {
        if let Some(q) = LandQuality::parse_lenient(&k) {
            land_quality.insert(q, v);
        }
    }

    let mut land_expansion = HashMap::new();
    for (k, v) in raw.land.expansion {
        let step: u32 = k.parse().map_err(|_| CoreError::ConfigMissing(format!("bad expansion key {k}")))?;
        land_expansion.insert(step, v);
    }

    if raw.crops.is_empty() {
        return Err(CoreError::ConfigMissing("crops table empty after merge".into()));
    }

    let mut sign_in = HashMap::new();
    for (k, v) in raw.sign_in {
        let day: u32 = k.parse().map_err(|_| CoreError::ConfigMissing(format!("bad sign_in key {k}")))?;
        sign_in.insert(day, v);
    }

    Ok(ConfigSnapshot {
        crops: raw.crops,
        items,
        levels,
        land_quality,
        land_default: raw.land.default,
        land_expansion,
        market: raw.market,
        backup: raw.backup.unwrap_or_default(),
        steal: raw.steal,
        ranking: raw.ranking.unwrap_or_default(),
        care: raw.care,
        sign_in,
    })
}

/// Loads `default.yaml` then overlays `local.yaml` if present (partial merges fall back to
/// defaults per §4.1: any field missing from `local.yaml` keeps the default's value, because
/// reshape only ever sees the deep-merged maps).
fn load_merged(dir: &Path) -> CoreResult<RawConfig> {
    let default_path = dir.join("default.yaml");
    let default_text = std::fs::read_to_string(&default_path)
        .map_err(|e| CoreError::ConfigMissing(format!("{}: {e}", default_path.display())))?;
    let mut merged: serde_yaml::Value = serde_yaml::from_str(&default_text)?;

    let local_path = dir.join("local.yaml");
    if let Ok(local_text) = std::fs::read_to_string(&local_path) {
        let local: serde_yaml::Value = serde_yaml::from_str(&local_text)?;
        deep_merge(&mut merged, local);
    }

    serde_yaml::from_value(merged).map_err(CoreError::from)
}

fn deep_merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Hot-reloadable config registry. Holds one `Arc<ConfigSnapshot>` behind a `RwLock`; reload
/// replaces the whole `Arc` in a single write so no reader ever observes a torn config.
#[derive(Debug)]
pub struct ConfigRegistry {
    dir: PathBuf,
    current: RwLock<Arc<ConfigSnapshot>>,
    reload_tx: broadcast::Sender<()>,
}

impl ConfigRegistry {
    pub fn load(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        let raw = load_merged(&dir)?;
        let snapshot = reshape(raw)?;
        let (reload_tx, _rx) = broadcast::channel(16);
        Ok(Self { dir, current: RwLock::new(Arc::new(snapshot)), reload_tx })
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Subscribe to reload notifications (by occurring, not by table name — callers re-read
    /// `snapshot()` and diff the tables they care about, matching §4.1's "notifies subscribers").
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.reload_tx.subscribe()
    }

    /// Re-reads `default.yaml`/`local.yaml` and atomically swaps the snapshot. On failure the
    /// previous snapshot is retained and the error is returned (never a torn/partial config).
    pub fn reload(&self) -> CoreResult<()> {
        let raw = load_merged(&self.dir)?;
        let snapshot = reshape(raw)?;
        {
            let mut guard = self.current.write().expect("config lock poisoned");
            *guard = Arc::new(snapshot);
        }
        let _ = self.reload_tx.send(());
        Ok(())
    }

    /// Spawns a `notify`-backed watcher that calls [`ConfigRegistry::reload`] whenever
    /// `default.yaml`/`local.yaml` change on disk.
    pub fn watch(self: &Arc<Self>) -> CoreResult<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};
        let registry = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                if let Err(e) = registry.reload() {
                    tracing::warn!(error = %e, "config reload failed, keeping previous snapshot");
                } else {
                    tracing::info!("config reloaded");
                }
            }
        })
        .map_err(|e| CoreError::ConfigMissing(e.to_string()))?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| CoreError::ConfigMissing(e.to_string()))?;
        Ok(watcher)
    }
}
