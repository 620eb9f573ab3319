//! Persisted data model (§3). `Player` is an inert record — no attached behaviour, only
//! derive(Serialize/Deserialize) and field accessors. Pure computation lives in `domain`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Time = i64; // UTC wall-clock milliseconds
pub type Money = u64;
pub type ItemId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LandQuality {
    Normal,
    Red,
    Black,
    Gold,
}

impl LandQuality {
    /// Historical aliases (§9 open question): readers accept both, writers only emit
    /// the canonical `{normal, red, black, gold}` set.
    pub fn rank(self) -> u8 {
        match self {
            LandQuality::Normal => 0,
            LandQuality::Red => 1,
            LandQuality::Black => 2,
            LandQuality::Gold => 3,
        }
    }

    /// Accepts canonical names and the legacy copper/silver aliases on read.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Some(LandQuality::Normal),
            "red" | "copper" => Some(LandQuality::Red),
            "black" | "silver" => Some(LandQuality::Black),
            "gold" => Some(LandQuality::Gold),
            _ => None,
        }
    }
}

/// Manual `Deserialize` (rather than the derive) so every reader — config, player YAML, anywhere
/// else a `LandQuality` is parsed — goes through `parse_lenient` and accepts the legacy
/// `copper`/`silver` aliases, not just `ConfigRegistry`'s own ad hoc parsing.
impl<'de> Deserialize<'de> for LandQuality {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        LandQuality::parse_lenient(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown land quality: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LandStatus {
    Empty,
    Growing,
    Mature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Land {
    pub id: u32,
    pub quality: LandQuality,
    pub status: LandStatus,
    pub crop: Option<ItemId>,
    pub plant_time: Option<Time>,
    pub harvest_time: Option<Time>,
    pub original_harvest_time: Option<Time>,
    pub needs_water: bool,
    pub has_pests: bool,
    pub stealable: bool,
    pub water_delay_applied: bool,
    pub water_delay_ms: i64,
    pub last_fertilized: Option<Time>,
    pub last_treated: Option<Time>,
    pub upgrade_level: u32,
    pub last_upgrade_time: Option<Time>,
    /// Units already claimed by a successful theft since this crop was planted; subtracted
    /// from the computed yield at harvest time and reset whenever the land goes empty again.
    pub stolen_qty: u32,
}

impl Land {
    pub fn empty(id: u32, quality: LandQuality) -> Self {
        Self {
            id,
            quality,
            status: LandStatus::Empty,
            crop: None,
            plant_time: None,
            harvest_time: None,
            original_harvest_time: None,
            needs_water: false,
            has_pests: false,
            stealable: false,
            water_delay_applied: false,
            water_delay_ms: 0,
            last_fertilized: None,
            last_treated: None,
            upgrade_level: 0,
            last_upgrade_time: None,
            stolen_qty: 0,
        }
    }

    /// Invariant 1 (§8): status=empty ⇔ crop=null ∧ plantTime=null ∧ harvestTime=null.
    pub fn check_invariants(&self) -> Result<(), String> {
        let core_empty = self.crop.is_none() && self.plant_time.is_none() && self.harvest_time.is_none();
        if (self.status == LandStatus::Empty) != core_empty {
            return Err(format!("land {} violates empty<=>null invariant", self.id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemCategory {
    Seeds,
    Crops,
    Fertilizer,
    Pesticide,
    Defense,
    Materials,
    Tools,
    Unknown,
}

impl ItemCategory {
    /// Unknown on-disk category strings fall back to `Unknown` rather than failing config load.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "seeds" => ItemCategory::Seeds,
            "crops" => ItemCategory::Crops,
            "fertilizer" => ItemCategory::Fertilizer,
            "pesticide" => ItemCategory::Pesticide,
            "defense" => ItemCategory::Defense,
            "materials" => ItemCategory::Materials,
            "tools" => ItemCategory::Tools,
            _ => ItemCategory::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackMetadata {
    pub locked: bool,
    pub locked_at: Option<Time>,
    pub last_updated: Time,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStack {
    pub item_id: ItemId,
    pub quantity: u32,
    pub max_stack: u32,
    pub category: ItemCategory,
    pub metadata: StackMetadata,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimedBuff {
    pub active_type: Option<u32>, // config-derived buff type id, opaque to the core
    pub effect_end_time: Option<Time>,
    pub value: i64,
}

impl TimedBuff {
    pub fn is_active(&self, now: Time) -> bool {
        self.effect_end_time.map(|t| t > now).unwrap_or(false)
    }

    pub fn remaining_ms(&self, now: Time) -> i64 {
        self.effect_end_time.map(|t| (t - now).max(0)).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Protection {
    pub dog_food: TimedBuff,
    pub farm_protection: TimedBuff,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stealing {
    pub cooldown_end_time: Option<Time>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignIn {
    pub last_sign_date: Option<String>,
    pub consecutive_days: u32,
    pub total_sign_days: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerStatistics {
    pub plants_count: u64,
    pub harvests_count: u64,
    pub items_sold: u64,
    pub times_stolen_from: u64,
    pub times_stole_successfully: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: String,
    pub level: u32,
    pub experience: u64,
    pub coins: Money,
    pub lands: Vec<Land>,
    pub inventory: HashMap<ItemId, ItemStack>,
    pub inventory_capacity: u32,
    pub max_inventory_capacity: u32,
    pub protection: Protection,
    pub stealing: Stealing,
    pub sign_in: SignIn,
    pub statistics: PlayerStatistics,
    pub created_at: Time,
    pub last_updated: Time,
    pub last_active_time: Time,
}

impl Player {
    pub fn new(id: impl Into<String>, name: impl Into<String>, now: Time, starting_lands: u32, starting_capacity: u32, max_capacity: u32) -> Self {
        let lands = (1..=starting_lands).map(|i| Land::empty(i, LandQuality::Normal)).collect();
        Self {
            id: id.into(),
            name: name.into(),
            level: 1,
            experience: 0,
            coins: 0,
            lands,
            inventory: HashMap::new(),
            inventory_capacity: starting_capacity,
            max_inventory_capacity: max_capacity,
            protection: Protection::default(),
            stealing: Stealing::default(),
            sign_in: SignIn::default(),
            statistics: PlayerStatistics::default(),
            created_at: now,
            last_updated: now,
            last_active_time: now,
        }
    }

    pub fn land(&self, id: u32) -> Option<&Land> {
        self.lands.iter().find(|l| l.id == id)
    }

    pub fn land_mut(&mut self, id: u32) -> Option<&mut Land> {
        self.lands.iter_mut().find(|l| l.id == id)
    }

    pub fn inventory_usage(&self) -> u32 {
        self.inventory.values().map(|s| s.quantity).sum()
    }

    /// Invariant 2 (§8): Σ inventory[i].quantity ≤ inventoryCapacity.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.inventory_usage() > self.inventory_capacity {
            return Err(format!("player {} inventory usage exceeds capacity", self.id));
        }
        for land in &self.lands {
            land.check_invariants()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------------------
// Market model (§3, §4.10)
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceTrend {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketItem {
    pub item_id: ItemId,
    pub base_price: u64,
    pub current_price: u64,
    pub supply_24h: u64,
    pub price_history: Vec<u64>,
    pub supply_history: Vec<u64>,
    pub price_trend: PriceTrend,
    pub last_transaction: Option<Time>,
    pub last_reset: Option<Time>,
    pub last_archive: Option<Time>,
}

impl MarketItem {
    pub fn new(item_id: impl Into<String>, base_price: u64, now: Time) -> Self {
        Self {
            item_id: item_id.into(),
            base_price,
            current_price: base_price.max(1),
            supply_24h: 0,
            price_history: Vec::new(),
            supply_history: Vec::new(),
            price_trend: PriceTrend::Stable,
            last_transaction: None,
            last_reset: Some(now),
            last_archive: Some(now),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalMarketStats {
    pub total_transactions: u64,
}
