//! C13 RankingService — periodic full-scan aggregate scoring with a bounded TTL cache (§4.13).
//! Read-only: a scan never takes a per-player lock, since it only ever observes whatever
//! generation of each player file happens to be on disk at scan time.

use crate::config::{ConfigRegistry, ScoreWeights};
use crate::error::CoreResult;
use crate::model::{LandQuality, Player, Time};
use crate::store::file_store::FileStore;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct RankEntry {
    pub rank: usize,
    pub user_id: String,
    pub score: f64,
    pub total_assets: u64,
    pub land_count: u32,
    pub level: u32,
}

#[derive(Debug, Clone)]
pub struct RankingPage {
    pub list: Vec<RankEntry>,
    pub self_entry: Option<RankEntry>,
    pub updated_at: Time,
    pub total_players: usize,
    pub weights: ScoreWeights,
}

struct CachedRanking {
    computed_at: Time,
    entries: Vec<RankEntry>,
}

pub struct RankingService {
    files: Arc<FileStore>,
    config: Arc<ConfigRegistry>,
    cache: Mutex<Option<CachedRanking>>,
}

impl RankingService {
    pub fn new(files: Arc<FileStore>, config: Arc<ConfigRegistry>) -> Self {
        Self { files, config, cache: Mutex::new(None) }
    }

    /// Returns `offset..offset+limit` of the ranking (recomputing if the cache is older than
    /// `ranking.cache_timeout_ms`), plus `requesting_player_id`'s own entry regardless of
    /// whether it falls inside the page.
    pub fn get_page(
        &self,
        requesting_player_id: Option<&str>,
        offset: usize,
        limit: usize,
        now: Time,
    ) -> CoreResult<RankingPage> {
        let config = self.config.snapshot();
        let entries = self.entries_fresh_as_of(now, config.ranking.cache_timeout_ms)?;
        let updated_at = {
            let guard = self.cache.lock().expect("ranking cache lock poisoned");
            guard.as_ref().map(|c| c.computed_at).unwrap_or(now)
        };

        let list = entries.iter().skip(offset).take(limit).cloned().collect();
        let self_entry = requesting_player_id
            .and_then(|id| entries.iter().find(|e| e.user_id == id))
            .cloned();

        Ok(RankingPage {
            list,
            self_entry,
            updated_at,
            total_players: entries.len(),
            weights: config.ranking.score_weights.clone(),
        })
    }

    /// Forces a fresh scan regardless of cache age, for callers (e.g. a scheduled recompute
    /// job) that want to warm the cache rather than serve stale data on the next request.
    pub fn refresh(&self, now: Time) -> CoreResult<usize> {
        let entries = self.compute(now)?;
        let len = entries.len();
        *self.cache.lock().expect("ranking cache lock poisoned") =
            Some(CachedRanking { computed_at: now, entries });
        Ok(len)
    }

    fn entries_fresh_as_of(&self, now: Time, ttl_ms: i64) -> CoreResult<Vec<RankEntry>> {
        {
            let guard = self.cache.lock().expect("ranking cache lock poisoned");
            if let Some(cached) = guard.as_ref() {
                if now - cached.computed_at < ttl_ms.max(0) {
                    return Ok(cached.entries.clone());
                }
            }
        }
        self.refresh(now)?;
        Ok(self.cache.lock().expect("ranking cache lock poisoned").as_ref().unwrap().entries.clone())
    }

    fn compute(&self, _now: Time) -> CoreResult<Vec<RankEntry>> {
        let config = self.config.snapshot();
        let weights = &config.ranking.score_weights;

        let mut scored: Vec<RankEntry> = Vec::new();
        for rel in self.files.list_dir("players")? {
            let Some(_id) = rel.strip_prefix("players/").and_then(|s| s.strip_suffix(".yaml")) else {
                continue;
            };
            let Some(player) = self.files.read_yaml::<Option<Player>>(&rel, None)? else {
                continue;
            };
            scored.push(score_player(&player, &config, weights));
        }

        // Score desc, then totalAssets desc, then landCount desc, then level desc, then userId asc.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.total_assets.cmp(&a.total_assets))
                .then(b.land_count.cmp(&a.land_count))
                .then(b.level.cmp(&a.level))
                .then(a.user_id.cmp(&b.user_id))
        });

        for (idx, entry) in scored.iter_mut().enumerate() {
            entry.rank = idx + 1;
        }
        Ok(scored)
    }
}

fn score_player(
    player: &Player,
    config: &crate::config::ConfigSnapshot,
    weights: &ScoreWeights,
) -> RankEntry {
    let land_count = player.lands.len() as u32;
    let quality_bonus: f64 = player
        .lands
        .iter()
        .map(|land| config.land_quality.get(&land.quality).map(|c| c.production_bonus as f64 / 100.0).unwrap_or(0.0))
        .sum();
    let total_assets = total_assets_for(player, config);

    let score = weights.land_count_weight * land_count as f64
        + weights.land_quality_bonus_weight * quality_bonus
        + weights.level_weight * player.level as f64
        + weights.assets_log10_weight * (total_assets as f64 + 1.0).log10();

    RankEntry {
        rank: 0,
        user_id: player.id.clone(),
        score,
        total_assets,
        land_count,
        level: player.level,
    }
}

/// `coins` plus the cumulative gold cost of the quality upgrades a player's lands currently
/// hold — i.e. the gold this player has sunk into land rights, since there is no standalone
/// "land value" field on the persisted model.
fn total_assets_for(player: &Player, config: &crate::config::ConfigSnapshot) -> u64 {
    let land_rights: u64 = player
        .lands
        .iter()
        .map(|land| {
            [LandQuality::Red, LandQuality::Black, LandQuality::Gold]
                .into_iter()
                .filter(|q| q.rank() <= land.quality.rank())
                .filter_map(|q| config.land_quality.get(&q))
                .map(|c| c.upgrade.gold_cost)
                .sum::<u64>()
        })
        .sum();
    player.coins + land_rights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LandQuality;
    use std::fs;

    fn setup() -> (Arc<FileStore>, Arc<ConfigRegistry>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("default.yaml"),
            r#"
crops:
  wheat:
    name: Wheat
    required_level: 1
    grow_time: 60
    base_yield: 3
    experience: 10
    base_price: 5
    category: crops
land:
  quality:
    normal: {time_reduction: 0, production_bonus: 0, experience_bonus: 0}
    red: {time_reduction: 10, production_bonus: 20, experience_bonus: 10, upgrade: {gold_cost: 100, level_required: 2}}
  default: {starting_lands: 1, max_lands: 10}
ranking:
  score_weights: {land_count_weight: 1.0, land_quality_bonus_weight: 2.0, level_weight: 1.0, assets_log10_weight: 1.0}
  cache_timeout_ms: 60000
"#,
        )
        .unwrap();
        let files = Arc::new(FileStore::new(tmp.path().join("data")).unwrap());
        let config = Arc::new(ConfigRegistry::load(&config_dir).unwrap());
        (files, config, tmp)
    }

    fn mk_player(id: &str, level: u32, coins: u64, quality: LandQuality) -> Player {
        let mut p = Player::new(id, id, 0, 1, 20, 200);
        p.level = level;
        p.coins = coins;
        p.lands[0].quality = quality;
        p
    }

    #[test]
    fn higher_level_outranks_lower_level_at_equal_everything_else() {
        let (files, config, _tmp) = setup();
        files.write_yaml("players/a.yaml", &mk_player("a", 5, 0, LandQuality::Normal)).unwrap();
        files.write_yaml("players/b.yaml", &mk_player("b", 1, 0, LandQuality::Normal)).unwrap();

        let service = RankingService::new(files, config);
        let page = service.get_page(None, 0, 10, 0).unwrap();
        assert_eq!(page.list[0].user_id, "a");
        assert_eq!(page.list[0].rank, 1);
        assert_eq!(page.list[1].user_id, "b");
    }

    #[test]
    fn tie_break_falls_through_to_total_assets_then_land_count_then_level_then_user_id() {
        let (files, config, _tmp) = setup();
        // Same level/land_count/quality -> score ties; assets differ.
        files.write_yaml("players/rich.yaml", &mk_player("rich", 1, 1000, LandQuality::Normal)).unwrap();
        files.write_yaml("players/poor.yaml", &mk_player("poor", 1, 0, LandQuality::Normal)).unwrap();

        let service = RankingService::new(files, config);
        let page = service.get_page(None, 0, 10, 0).unwrap();
        assert_eq!(page.list[0].user_id, "rich");
        assert_eq!(page.list[1].user_id, "poor");
    }

    #[test]
    fn tie_break_final_fallback_is_lexical_user_id() {
        let (files, config, _tmp) = setup();
        files.write_yaml("players/bob.yaml", &mk_player("bob", 1, 0, LandQuality::Normal)).unwrap();
        files.write_yaml("players/amy.yaml", &mk_player("amy", 1, 0, LandQuality::Normal)).unwrap();

        let service = RankingService::new(files, config);
        let page = service.get_page(None, 0, 10, 0).unwrap();
        assert_eq!(page.list[0].user_id, "amy");
        assert_eq!(page.list[1].user_id, "bob");
    }

    #[test]
    fn self_entry_is_returned_even_when_outside_the_requested_page() {
        let (files, config, _tmp) = setup();
        for i in 0..5 {
            let id = format!("p{i}");
            files.write_yaml(&format!("players/{id}.yaml"), &mk_player(&id, i, 0, LandQuality::Normal)).unwrap();
        }
        let service = RankingService::new(files, config);
        // p0 has the lowest level, so it sorts last; ask for only the top page.
        let page = service.get_page(Some("p0"), 0, 2, 0).unwrap();
        assert!(page.list.iter().all(|e| e.user_id != "p0"));
        assert_eq!(page.self_entry.unwrap().user_id, "p0");
        assert_eq!(page.total_players, 5);
    }

    #[test]
    fn cache_is_reused_within_ttl_and_recomputed_after() {
        let (files, config, _tmp) = setup();
        files.write_yaml("players/a.yaml", &mk_player("a", 1, 0, LandQuality::Normal)).unwrap();

        let service = RankingService::new(files.clone(), config);
        let first = service.get_page(None, 0, 10, 0).unwrap();
        assert_eq!(first.total_players, 1);

        files.write_yaml("players/b.yaml", &mk_player("b", 1, 0, LandQuality::Normal)).unwrap();
        let still_cached = service.get_page(None, 0, 10, 10_000).unwrap(); // within 60s TTL
        assert_eq!(still_cached.total_players, 1);

        let recomputed = service.get_page(None, 0, 10, 120_000).unwrap(); // past TTL
        assert_eq!(recomputed.total_players, 2);
    }

    #[test]
    fn land_quality_raises_score_via_bonus_and_assets() {
        let (files, config, _tmp) = setup();
        files.write_yaml("players/gold.yaml", &mk_player("gold", 1, 0, LandQuality::Red)).unwrap();
        files.write_yaml("players/plain.yaml", &mk_player("plain", 1, 0, LandQuality::Normal)).unwrap();

        let service = RankingService::new(files, config);
        let page = service.get_page(None, 0, 10, 0).unwrap();
        assert_eq!(page.list[0].user_id, "gold");
        assert!(page.list[0].total_assets > page.list[1].total_assets);
    }
}
