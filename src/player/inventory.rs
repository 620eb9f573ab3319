//! C6 InventoryCore — stacking, capacity, and locking over a player's inventory map (§4.6).
//! Every mutating function here is meant to run inside `PlayerStore::execute_under_lock`;
//! read-only queries (`capacity`) work directly off a loaded `Player`.

use crate::config::ConfigSnapshot;
use crate::error::{CoreError, CoreResult};
use crate::model::{ItemStack, Player, StackMetadata, Time};
use crate::player::store::PlayerTx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub accepted: u32,
    pub remainder: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityInfo {
    pub usage: u32,
    pub capacity: u32,
    pub remaining: u32,
    pub full: bool,
}

pub fn capacity(player: &Player) -> CapacityInfo {
    let usage = player.inventory_usage();
    let capacity = player.inventory_capacity;
    let remaining = capacity.saturating_sub(usage);
    CapacityInfo { usage, capacity, remaining, full: remaining == 0 }
}

/// Remaining headroom in `item_id`'s stack before `max_stack`. `pub(crate)` so callers that
/// need to pre-check a batch of adds against stack caps (e.g. harvest's capacity-ordered pass)
/// can do so without duplicating the lookup `add` itself uses.
pub(crate) fn stack_room(player: &Player, item_id: &str, max_stack: u32) -> u32 {
    let current = player.inventory.get(item_id).map(|s| s.quantity).unwrap_or(0);
    max_stack.saturating_sub(current)
}

fn free_capacity(player: &Player) -> u32 {
    player.inventory_capacity.saturating_sub(player.inventory_usage())
}

fn apply_add(player: &mut Player, config: &ConfigSnapshot, item_id: &str, qty: u32, now: Time) {
    if qty == 0 {
        return;
    }
    let cfg = config.items.get(item_id);
    let max_stack = cfg.map(|c| c.max_stack).unwrap_or(99);
    let category = cfg.map(|c| crate::model::ItemCategory::parse_lenient(&c.category)).unwrap_or(crate::model::ItemCategory::Unknown);
    let entry = player.inventory.entry(item_id.to_string()).or_insert_with(|| ItemStack {
        item_id: item_id.to_string(),
        quantity: 0,
        max_stack,
        category,
        metadata: StackMetadata::default(),
    });
    entry.quantity += qty;
    entry.metadata.last_updated = now;
}

/// `Add(playerId, itemId, qty)` (§4.6). New stacks are created with config-derived `maxStack`;
/// when the stack cap or remaining player capacity is smaller than `qty`, the accepted amount
/// is capped and the unreceived remainder is reported rather than erroring.
pub fn add(tx: &mut PlayerTx<'_>, config: &ConfigSnapshot, item_id: &str, qty: u32, now: Time) -> CoreResult<AddOutcome> {
    if !config.items.contains_key(item_id) {
        return Err(CoreError::Validation(format!("unknown item {item_id}")));
    }
    let max_stack = config.items[item_id].max_stack;
    let player = tx.get();
    let room = stack_room(player, item_id, max_stack).min(free_capacity(player));
    let accepted = qty.min(room);
    let remainder = qty - accepted;
    if accepted > 0 {
        let item_id = item_id.to_string();
        tx.mutate(|p| apply_add(p, config, &item_id, accepted, now));
    }
    Ok(AddOutcome { accepted, remainder })
}

/// `AddBatch(playerId, items[])` (§4.6). Per-item stack-cap overflows are tolerated and
/// reported as remainders, but the batch is atomic against overall capacity: if the combined
/// stack-capped demand exceeds the player's free capacity, nothing is added.
pub fn add_batch(
    tx: &mut PlayerTx<'_>,
    config: &ConfigSnapshot,
    items: &[(String, u32)],
) -> CoreResult<Vec<AddOutcome>> {
    for (item_id, _) in items {
        if !config.items.contains_key(item_id) {
            return Err(CoreError::Validation(format!("unknown item {item_id}")));
        }
    }

    let player = tx.get();
    let mut room_used: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    let mut needed = Vec::with_capacity(items.len());
    for (item_id, qty) in items {
        let max_stack = config.items[item_id].max_stack;
        let already_taken = *room_used.get(item_id.as_str()).unwrap_or(&0);
        let room = stack_room(player, item_id, max_stack).saturating_sub(already_taken);
        let stack_capped = (*qty).min(room);
        *room_used.entry(item_id.as_str()).or_insert(0) += stack_capped;
        needed.push((item_id.clone(), stack_capped, qty - stack_capped));
    }

    let total_needed: u32 = needed.iter().map(|(_, capped, _)| capped).sum();
    if total_needed > free_capacity(player) {
        return Err(CoreError::InsufficientResources("inventory capacity".into()));
    }

    let now = chrono::Utc::now().timestamp_millis();
    let needed_for_mutate = needed.clone();
    tx.mutate(|p| {
        for (item_id, capped, _) in &needed_for_mutate {
            apply_add(p, config, item_id, *capped, now);
        }
    });

    Ok(needed.into_iter().map(|(_, capped, remainder)| AddOutcome { accepted: capped, remainder }).collect())
}

/// `Remove(playerId, itemId, qty)` (§4.6).
pub fn remove(tx: &mut PlayerTx<'_>, item_id: &str, qty: u32) -> CoreResult<()> {
    let player = tx.get();
    let stack = player.inventory.get(item_id).ok_or_else(|| CoreError::InsufficientResources(item_id.to_string()))?;
    if stack.metadata.locked {
        return Err(CoreError::ItemLocked(item_id.to_string()));
    }
    if stack.quantity < qty {
        return Err(CoreError::InsufficientResources(item_id.to_string()));
    }
    let item_id = item_id.to_string();
    tx.mutate(|p| {
        if let Some(s) = p.inventory.get_mut(&item_id) {
            s.quantity -= qty;
            if s.quantity == 0 {
                p.inventory.remove(&item_id);
            }
        }
    });
    Ok(())
}

fn set_locked(player: &mut Player, item_id: &str, locked: bool, now: Time) {
    if let Some(stack) = player.inventory.get_mut(item_id) {
        stack.metadata.locked = locked;
        stack.metadata.locked_at = if locked { Some(now) } else { None };
    }
}

/// `Lock(playerId, itemId)` (§4.6). Idempotent; a missing stack is a no-op, not an error.
pub fn lock(tx: &mut PlayerTx<'_>, item_id: &str, now: Time) {
    let item_id = item_id.to_string();
    tx.mutate(|p| set_locked(p, &item_id, true, now));
}

pub fn unlock(tx: &mut PlayerTx<'_>, item_id: &str, now: Time) {
    let item_id = item_id.to_string();
    tx.mutate(|p| set_locked(p, &item_id, false, now));
}

pub fn lock_batch(tx: &mut PlayerTx<'_>, item_ids: &[String], now: Time) {
    let item_ids = item_ids.to_vec();
    tx.mutate(|p| {
        for id in &item_ids {
            set_locked(p, id, true, now);
        }
    });
}

pub fn unlock_batch(tx: &mut PlayerTx<'_>, item_ids: &[String], now: Time) {
    let item_ids = item_ids.to_vec();
    tx.mutate(|p| {
        for id in &item_ids {
            set_locked(p, id, false, now);
        }
    });
}
