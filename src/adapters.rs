//! C15 Adapter interfaces — trait seams only (§6, §9). Chat-bot command dispatch, rendering,
//! and CLI/HTTP surfaces are external collaborators the core consumes through these traits;
//! none of them are implemented here.

use crate::error::CoreResult;
use crate::market::MarketRenderItem;
use crate::model::Player;

/// Notified whenever `ConfigRegistry` swaps in a new snapshot generation (§4.1). An adapter
/// typically uses this to invalidate its own derived caches (e.g. a rendered shop menu built
/// from `ItemConfig`).
pub trait ConfigReloadListener: Send + Sync {
    fn on_config_reloaded(&self);
}

/// Produces the externally-rendered view of a market tick or a player's farm (§4.10, §6). The
/// core computes the data; drawing it (a headless-browser screenshot, a text table, …) is the
/// adapter's job.
pub trait RenderHook: Send + Sync {
    fn render_market(&self, items: &[MarketRenderItem]);
    fn render_player_summary(&self, player: &Player);
}

/// Outbound event sink for state changes an adapter might want to broadcast (chat
/// notifications, a websocket feed, …). Delivery is fire-and-forget from the core's
/// perspective — a failed `publish` must not roll back the mutation that produced the event.
pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &str) -> CoreResult<()>;
}
