//! C10 MarketEngine — floating-price item tracking with debounced, single-flight persistence
//! (§4.10). State lives behind a `tokio::sync::Mutex` guarded separately from the player
//! aggregates; persistence is a single JSON file, never a per-player one.

use crate::config::{ConfigRegistry, ConfigSnapshot};
use crate::domain::calc;
use crate::error::{CoreError, CoreResult};
use crate::model::{GlobalMarketStats, MarketItem, PriceTrend, Time};
use crate::store::file_store::FileStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const MARKET_FILE: &str = "market/market.json";
const AUTO_SAVE_DELAY_MS: u64 = 5_000;
const PRICE_HISTORY_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Buy,
    Sell,
}

#[derive(Debug, Clone)]
pub struct MarketUpdate {
    pub item_id: String,
    pub current_price: Option<u64>,
    pub price_trend: Option<PriceTrend>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketRenderItem {
    pub item_id: String,
    pub current_price: u64,
    pub base_price: u64,
    pub pct_change: f64,
    pub sparkline: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct MarketFile {
    version: u32,
    last_persisted_at: Time,
    items: HashMap<String, MarketItem>,
    global_stats: GlobalMarketStats,
}

struct MarketState {
    items: HashMap<String, MarketItem>,
    global_stats: GlobalMarketStats,
    dirty: bool,
}

fn is_floating(config: &ConfigSnapshot, item_id: &str) -> bool {
    if config.market.floating_items.items.iter().any(|i| i == item_id) {
        return true;
    }
    if let Some(cfg) = config.items.get(item_id) {
        if cfg.is_dynamic_price || config.market.floating_items.categories.contains(&cfg.category) {
            return true;
        }
    }
    if let Some(cfg) = config.crops.get(item_id) {
        if cfg.is_dynamic_price || config.market.floating_items.categories.contains(&cfg.category) {
            return true;
        }
    }
    false
}

fn base_price_for(config: &ConfigSnapshot, item_id: &str) -> u64 {
    config
        .items
        .get(item_id)
        .map(|c| c.price)
        .or_else(|| config.crops.get(item_id).map(|c| c.base_price))
        .unwrap_or(1)
}

/// Catmull-Rom spline through `points`, sampled at a fixed resolution per segment. Degrades
/// gracefully for short histories: empty stays empty, a single point repeats flat, two points
/// interpolate linearly (neither has enough neighbours for a real spline).
fn catmull_rom_sparkline(points: &[f64]) -> Vec<f64> {
    const SAMPLES_PER_SEGMENT: usize = 8;
    match points.len() {
        0 => Vec::new(),
        1 => vec![points[0]; 2],
        2 => (0..=SAMPLES_PER_SEGMENT)
            .map(|step| {
                let t = step as f64 / SAMPLES_PER_SEGMENT as f64;
                points[0] + (points[1] - points[0]) * t
            })
            .collect(),
        n => {
            let mut out = Vec::with_capacity((n - 1) * SAMPLES_PER_SEGMENT + 1);
            for i in 0..n - 1 {
                let p0 = points[i.saturating_sub(1)];
                let p1 = points[i];
                let p2 = points[i + 1];
                let p3 = points[(i + 2).min(n - 1)];
                for step in 0..SAMPLES_PER_SEGMENT {
                    let t = step as f64 / SAMPLES_PER_SEGMENT as f64;
                    let t2 = t * t;
                    let t3 = t2 * t;
                    let y = 0.5
                        * (2.0 * p1
                            + (-p0 + p2) * t
                            + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
                            + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3);
                    out.push(y);
                }
            }
            out.push(points[n - 1]);
            out
        }
    }
}

/// `MarketEngine` (§4.10). Wrapped in `Arc` because `RecordTransaction` arms a debounced save
/// that outlives the call by spawning a detached task referencing `self`.
pub struct MarketEngine {
    files: Arc<FileStore>,
    config: Arc<ConfigRegistry>,
    state: Mutex<MarketState>,
    persist_lock: Mutex<()>,
    generation: AtomicU64,
}

impl MarketEngine {
    pub fn new(files: Arc<FileStore>, config: Arc<ConfigRegistry>) -> CoreResult<Arc<Self>> {
        let loaded: MarketFile = files.read_json(MARKET_FILE, MarketFile::default())?;
        Ok(Arc::new(Self {
            files,
            config,
            state: Mutex::new(MarketState { items: loaded.items, global_stats: loaded.global_stats, dirty: false }),
            persist_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }))
    }

    /// Arms (or re-arms) the debounced save. Each call bumps a generation counter and spawns a
    /// task that sleeps `AUTO_SAVE_DELAY_MS`; on wake it only flushes if no later call has bumped
    /// the generation again, so a burst of calls inside the window collapses to one write.
    fn arm_debounce(self: &Arc<Self>) {
        let target_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(AUTO_SAVE_DELAY_MS)).await;
            if this.generation.load(Ordering::SeqCst) == target_gen {
                if let Err(e) = this.flush_if_dirty().await {
                    tracing::warn!(error = %e, "debounced market save failed");
                }
            }
        });
    }

    /// Single-flight: concurrent callers serialise on `persist_lock`; whichever arrives second
    /// finds `dirty` already cleared and returns immediately without writing again.
    async fn flush_if_dirty(&self) -> CoreResult<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            MarketFile {
                version: 1,
                last_persisted_at: chrono::Utc::now().timestamp_millis(),
                items: state.items.clone(),
                global_stats: state.global_stats.clone(),
            }
        };
        self.files.write_json(MARKET_FILE, &snapshot)
    }

    /// Used by operations that must bypass the debounce window (§4.10: reset/archive persist
    /// immediately).
    async fn persist_now(&self, now: Time) -> CoreResult<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            state.dirty = false;
            MarketFile {
                version: 1,
                last_persisted_at: now,
                items: state.items.clone(),
                global_stats: state.global_stats.clone(),
            }
        };
        self.files.write_json(MARKET_FILE, &snapshot)
    }

    /// `RecordTransaction(itemId, qty, type)` (§4.10). Buys and non-floating items are silently
    /// ignored; a floating sell bumps `supply24h` and arms the debounced save.
    pub async fn record_transaction(self: &Arc<Self>, item_id: &str, qty: i64, kind: TransactionKind, now: Time) -> CoreResult<()> {
        if kind == TransactionKind::Buy {
            return Ok(());
        }
        if qty <= 0 {
            return Err(CoreError::Validation("transaction quantity must be a positive integer".into()));
        }
        let config = self.config.snapshot();
        if !is_floating(&config, item_id) {
            return Ok(());
        }
        let base_price = base_price_for(&config, item_id);
        {
            let mut state = self.state.lock().await;
            let item = state.items.entry(item_id.to_string()).or_insert_with(|| MarketItem::new(item_id, base_price, now));
            item.supply_24h += qty as u64;
            item.last_transaction = Some(now);
            state.global_stats.total_transactions += 1;
            state.dirty = true;
        }
        self.arm_debounce();
        Ok(())
    }

    /// `ArchiveAllDailySupply()` (§4.10): rotates each item's `supply24h` into `supplyHistory`,
    /// truncated to `market.pricing.history_days`, then persists immediately.
    pub async fn archive_all_daily_supply(&self, now: Time) -> CoreResult<()> {
        let history_days = self.config.snapshot().market.pricing.history_days.max(1);
        {
            let mut state = self.state.lock().await;
            for item in state.items.values_mut() {
                item.supply_history.insert(0, item.supply_24h);
                item.supply_history.truncate(history_days);
                item.supply_24h = 0;
                item.last_archive = Some(now);
            }
        }
        self.persist_now(now).await
    }

    /// `CalculateBaseSupply(itemId)` (§4.10).
    pub async fn calculate_base_supply(&self, item_id: &str) -> CoreResult<u64> {
        let min_base_supply = self.config.snapshot().market.pricing.min_base_supply;
        let state = self.state.lock().await;
        let item = state.items.get(item_id).ok_or_else(|| CoreError::NotFound(format!("market item {item_id}")))?;
        Ok(calc::base_supply(&item.supply_history, min_base_supply))
    }

    /// `ResetDailyStats()` (§4.10): zeroes every item's `supply24h` and persists immediately.
    pub async fn reset_daily_stats(&self, now: Time) -> CoreResult<()> {
        {
            let mut state = self.state.lock().await;
            for item in state.items.values_mut() {
                item.supply_24h = 0;
                item.last_reset = Some(now);
            }
        }
        self.persist_now(now).await
    }

    /// `BatchUpdateMarketData(updates[])` (§4.10): validated upsert of stats fields, persisted
    /// immediately. An explicit `price_trend` wins; otherwise it is derived from the price delta.
    pub async fn batch_update_market_data(&self, updates: &[MarketUpdate], now: Time) -> CoreResult<()> {
        for u in updates {
            if u.current_price == Some(0) {
                return Err(CoreError::Validation(format!("current_price for {} must be positive", u.item_id)));
            }
        }
        {
            let config = self.config.snapshot();
            let mut state = self.state.lock().await;
            for u in updates {
                let base_price = base_price_for(&config, &u.item_id);
                let item = state.items.entry(u.item_id.clone()).or_insert_with(|| MarketItem::new(&u.item_id, base_price, now));
                if let Some(new_price) = u.current_price {
                    let trend = u.price_trend.unwrap_or_else(|| match new_price.cmp(&item.current_price) {
                        std::cmp::Ordering::Greater => PriceTrend::Up,
                        std::cmp::Ordering::Less => PriceTrend::Down,
                        std::cmp::Ordering::Equal => PriceTrend::Stable,
                    });
                    item.current_price = new_price;
                    item.price_trend = trend;
                    item.price_history.push(new_price);
                    if item.price_history.len() > PRICE_HISTORY_LEN {
                        item.price_history.remove(0);
                    }
                } else if let Some(trend) = u.price_trend {
                    item.price_trend = trend;
                }
            }
        }
        self.persist_now(now).await
    }

    /// `GetRenderData(topN)` (§4.10): the `topN` items with the largest absolute distance from
    /// their base price, each carrying a Catmull-Rom sparkline over its recent price history.
    pub async fn get_render_data(&self, top_n: usize) -> Vec<MarketRenderItem> {
        let state = self.state.lock().await;
        let mut scored: Vec<(&String, f64)> = state
            .items
            .iter()
            .map(|(id, item)| {
                let base = (item.base_price.max(1)) as f64;
                let pct = ((item.current_price as f64 - base) / base).abs();
                (id, pct)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(top_n)
            .map(|(id, pct)| {
                let item = &state.items[id];
                let points: Vec<f64> = item.price_history.iter().map(|&p| p as f64).collect();
                MarketRenderItem {
                    item_id: id.clone(),
                    current_price: item.current_price,
                    base_price: item.base_price,
                    pct_change: pct,
                    sparkline: catmull_rom_sparkline(&points),
                }
            })
            .collect()
    }
}
