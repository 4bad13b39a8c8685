//! Manager data refresh.
//!
//! Picks, transfers, gameweek history, live points paths, mini-league ranks
//! and the post-deadline seeding. The slow-loop history refresh is the
//! authoritative path (it fetches ranks upstream); the two live points paths
//! are freshness paths that only touch `gameweek_points`/`total_points` and
//! never the baseline columns.

use crate::fpl_client::FplClient;
use crate::points::{self, PickSlot, PlayerGwInput, PointsContext};
use crate::store::{SharedStore, Store};
use crate::types::api::{ApiFixture, AutomaticSub, Bootstrap, EventLive};
use crate::types::domain::{normalize_tenths, Chip, ManagerGameweekHistoryRow, ManagerPickRow,
    ManagerRow, ManagerTransferRow, Position};
use anyhow::Result;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata collected from a picks refresh, reused by the deadline batch so
/// the seed phase needs no second picks fetch.
#[derive(Debug, Clone, Default)]
pub struct PicksMeta {
    pub active_chip: Option<String>,
    pub gameweek_rank: Option<i64>,
}

/// Result of a manager points calculation.
#[derive(Debug, Clone, Default)]
pub struct CalculatedPoints {
    pub gameweek_points: i32,
    pub raw_points: i32,
    pub transfer_cost: i32,
    pub active_chip: Option<String>,
    pub auto_subs: Vec<AutomaticSub>,
}

pub struct ManagerRefresher {
    client: Arc<FplClient>,
    store: SharedStore,
    /// Confirmed-bonus rows seen per gameweek; in-memory only, a restart at
    /// worst triggers one redundant cohort refresh.
    confirmed_bonus_counts: DashMap<i32, i64>,
}

impl ManagerRefresher {
    pub fn new(client: Arc<FplClient>, store: SharedStore) -> Self {
        Self {
            client,
            store,
            confirmed_bonus_counts: DashMap::new(),
        }
    }

    /// Calculator inputs for a set of players, aggregated from store state.
    async fn points_context_for_players(
        &self,
        gameweek: i32,
        player_ids: &[i64],
    ) -> Result<PointsContext> {
        let stats = self
            .store
            .get_player_stats_for_players(gameweek, player_ids)
            .await?;
        let players = self.store.get_players_by_ids(player_ids).await?;

        let mut rows_by_player: HashMap<i64, Vec<_>> = HashMap::new();
        for row in &stats {
            rows_by_player.entry(row.player_id).or_default().push(row);
        }

        let mut ctx = PointsContext::default();
        for player_id in player_ids {
            let position = players.get(player_id).map(|p| p.position);
            let rows = rows_by_player.remove(player_id).unwrap_or_default();
            ctx.players.insert(
                *player_id,
                PlayerGwInput::from_stats_rows(&rows, position),
            );
        }
        Ok(ctx)
    }

    /// Compute a manager's gameweek points from store state. Transfer cost and
    /// chip come from the stored history row; upstream is only consulted when
    /// neither is known yet.
    pub async fn calculate_manager_points(
        &self,
        manager_id: i64,
        gameweek: i32,
    ) -> Result<CalculatedPoints> {
        let picks = self.store.get_manager_picks(manager_id, gameweek).await?;
        if picks.is_empty() {
            return Ok(CalculatedPoints::default());
        }

        let existing = self.store.get_manager_history(manager_id, gameweek).await?;
        let mut transfer_cost = existing.as_ref().map(|h| h.transfer_cost);
        let mut active_chip = existing.as_ref().and_then(|h| h.active_chip.clone());
        if transfer_cost.is_none() || active_chip.is_none() {
            match self.client.entry_picks(manager_id, gameweek).await {
                Ok(picks_data) => {
                    if transfer_cost.is_none() {
                        transfer_cost = picks_data
                            .entry_history
                            .as_ref()
                            .map(|h| h.event_transfers_cost);
                    }
                    if active_chip.is_none() {
                        active_chip = picks_data.active_chip;
                    }
                }
                Err(e) => {
                    warn!(manager_id, gameweek, error = %e,
                        "Entry picks fetch failed, using defaults for cost/chip");
                }
            }
        }
        let transfer_cost = transfer_cost.unwrap_or(0);

        let slots = pick_slots(&picks);
        let player_ids: Vec<i64> = slots.iter().map(|p| p.player_id).collect();
        let ctx = self.points_context_for_players(gameweek, &player_ids).await?;
        let chip = active_chip.as_deref().and_then(Chip::from_api);
        let computed = points::compute_gameweek_points(&slots, &[], &ctx, chip, transfer_cost);

        Ok(CalculatedPoints {
            gameweek_points: computed.gameweek_points,
            raw_points: computed.raw_points,
            transfer_cost: computed.transfer_cost,
            active_chip,
            auto_subs: computed.auto_subs,
        })
    }

    /// Fetch upstream picks and upsert the fifteen rows, normalizing the
    /// captain multiplier and filling the auto-sub flags (inferred from store
    /// state when upstream has not published `automatic_subs` yet).
    pub async fn refresh_picks(&self, manager_id: i64, gameweek: i32) -> Result<PicksMeta> {
        let picks_data = self.client.entry_picks(manager_id, gameweek).await?;

        // Keep the manager profile current while we are here. Person name is
        // preferred and never overwritten by the squad name.
        match self.client.entry(manager_id).await {
            Ok(entry) => {
                let team_name = entry
                    .name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("Manager {manager_id}"));
                let name = match entry.person_name() {
                    Some(person) => person,
                    None => match self.store.get_manager(manager_id).await? {
                        Some(existing) if !existing.name.trim().is_empty() => existing.name,
                        _ => team_name.clone(),
                    },
                };
                self.store
                    .upsert_manager(&ManagerRow {
                        id: manager_id,
                        name,
                        team_name,
                        favourite_team_id: entry.favourite_team,
                        joined_at: entry.joined_time,
                    })
                    .await?;
            }
            Err(e) => {
                warn!(manager_id, error = %e, "Manager profile fetch failed");
            }
        }

        if picks_data.picks.is_empty() {
            warn!(manager_id, gameweek, "Upstream returned no picks");
            return Ok(PicksMeta {
                active_chip: picks_data.active_chip,
                gameweek_rank: picks_data.entry_history.and_then(|h| h.rank),
            });
        }

        let active_chip = picks_data.active_chip.clone();
        let chip = active_chip.as_deref().and_then(Chip::from_api);

        let mut automatic_subs = picks_data.automatic_subs.clone();
        if automatic_subs.is_empty() {
            let slots: Vec<PickSlot> = picks_data
                .picks
                .iter()
                .map(|p| PickSlot {
                    player_id: p.element,
                    position: p.position,
                    multiplier: p.multiplier,
                    is_captain: p.is_captain,
                    is_vice_captain: p.is_vice_captain,
                })
                .collect();
            let player_ids: Vec<i64> = slots.iter().map(|s| s.player_id).collect();
            let ctx = self.points_context_for_players(gameweek, &player_ids).await?;
            automatic_subs = points::infer_automatic_subs(&slots, &ctx);
            if !automatic_subs.is_empty() {
                debug!(
                    manager_id,
                    gameweek,
                    count = automatic_subs.len(),
                    "Inferred automatic subs (upstream had none)"
                );
            }
        }

        let subbed_out: HashSet<i64> = automatic_subs.iter().map(|s| s.element_out).collect();
        let replaced_by: HashMap<i64, i64> = automatic_subs
            .iter()
            .map(|s| (s.element_in, s.element_out))
            .collect();

        let rows: Vec<ManagerPickRow> = picks_data
            .picks
            .iter()
            .map(|p| {
                let multiplier = points::normalize_multiplier(
                    &PickSlot {
                        player_id: p.element,
                        position: p.position,
                        multiplier: p.multiplier,
                        is_captain: p.is_captain,
                        is_vice_captain: p.is_vice_captain,
                    },
                    chip,
                );
                ManagerPickRow {
                    manager_id,
                    gameweek_id: gameweek,
                    position: p.position,
                    player_id: p.element,
                    is_captain: p.is_captain,
                    is_vice_captain: p.is_vice_captain,
                    multiplier,
                    was_auto_subbed_in: replaced_by.contains_key(&p.element),
                    was_auto_subbed_out: subbed_out.contains(&p.element),
                    auto_sub_replaced_player_id: replaced_by.get(&p.element).copied(),
                }
            })
            .collect();
        self.store.upsert_manager_picks(&rows).await?;

        debug!(manager_id, gameweek, picks = rows.len(), "Refreshed manager picks");
        Ok(PicksMeta {
            active_chip,
            gameweek_rank: picks_data.entry_history.and_then(|h| h.rank),
        })
    }

    /// Fetch the transfer history, keep this gameweek's entries and upsert
    /// them annotated with current prices from bootstrap.
    pub async fn refresh_transfers(
        &self,
        manager_id: i64,
        gameweek: i32,
        bootstrap: &Bootstrap,
    ) -> Result<usize> {
        let transfers = self.client.entry_transfers(manager_id).await?;
        let elements = bootstrap.elements_by_id();

        let mut count = 0usize;
        for transfer in transfers.iter().filter(|t| t.event == Some(gameweek)) {
            let price_in = elements
                .get(&transfer.element_in)
                .map(|e| e.now_cost)
                .unwrap_or(0);
            let price_out = elements
                .get(&transfer.element_out)
                .map(|e| e.now_cost)
                .unwrap_or(0);
            self.store
                .upsert_manager_transfer(&ManagerTransferRow {
                    manager_id,
                    gameweek_id: gameweek,
                    player_in_id: transfer.element_in,
                    player_out_id: transfer.element_out,
                    price_in_tenths: price_in,
                    price_out_tenths: price_out,
                    net_price_change_tenths: price_in - price_out,
                    transfer_at: transfer.time,
                    player_in_points_baseline: None,
                    player_out_points_baseline: None,
                    point_impact_baseline: None,
                })
                .await?;
            count += 1;
        }
        debug!(manager_id, gameweek, transfers = count, "Refreshed manager transfers");
        Ok(count)
    }

    /// Authoritative history refresh: calculated points plus upstream ranks,
    /// team value and bank. Baseline and `previous_*` columns are copied
    /// forward untouched.
    pub async fn refresh_manager_history(&self, manager_id: i64, gameweek: i32) -> Result<()> {
        let gw_row = self.store.get_gameweek(gameweek).await?;
        let is_finished = gw_row.as_ref().map(|g| g.finished).unwrap_or(false);
        let is_current = gw_row.as_ref().map(|g| g.is_current).unwrap_or(false);

        let history = self.client.entry_history(manager_id).await?;
        let gw_history = history.for_gameweek(gameweek);

        let existing = self.store.get_manager_history(manager_id, gameweek).await?;
        let baseline_total = existing.as_ref().and_then(|h| h.baseline_total_points);

        let calculated = self.calculate_manager_points(manager_id, gameweek).await?;
        let gameweek_points = calculated.gameweek_points;

        // Ranks: gameweek rank lives on the picks payload, overall rank on
        // the history payload. Preserve stored values when upstream has
        // nothing yet.
        let mut overall_rank = gw_history.and_then(|h| h.overall_rank);
        let mut gameweek_rank = None;
        match self.client.entry_picks(manager_id, gameweek).await {
            Ok(picks_data) => {
                gameweek_rank = picks_data.entry_history.and_then(|h| h.rank);
            }
            Err(e) => {
                debug!(manager_id, gameweek, error = %e, "Ranks fetch failed, preserving stored");
            }
        }
        if gameweek_rank.is_none() {
            gameweek_rank = existing.as_ref().and_then(|h| h.gameweek_rank);
        }
        if overall_rank.is_none() {
            overall_rank = existing.as_ref().and_then(|h| h.overall_rank);
        }

        // Total points per the baseline rules.
        let previous_total = if baseline_total.is_none() && gameweek > 1 {
            self.store
                .get_manager_history(manager_id, gameweek - 1)
                .await?
                .map(|h| h.total_points)
        } else {
            None
        };
        let total_points = match (baseline_total, previous_total) {
            (Some(baseline), _) => baseline + gameweek_points,
            (None, Some(previous)) => previous + gameweek_points,
            (None, None) => gw_history
                .map(|h| h.total_points)
                .filter(|t| *t > 0)
                .unwrap_or(gameweek_points),
        };

        // Backfill previous_overall_rank when the deadline capture was missed.
        let mut previous_overall_rank = existing.as_ref().and_then(|h| h.previous_overall_rank);
        if previous_overall_rank.is_none() && gameweek > 1 {
            previous_overall_rank = self
                .store
                .get_manager_history(manager_id, gameweek - 1)
                .await?
                .and_then(|h| h.overall_rank);
        }
        let overall_rank_change = match (previous_overall_rank, overall_rank) {
            (Some(prev), Some(curr)) => Some(prev - curr),
            _ => None,
        };

        // Team value and bank: the entry endpoint is freshest for the current
        // gameweek (it reflects price changes); history rows cover the rest.
        let mut team_value = gw_history.and_then(|h| h.value).and_then(normalize_tenths);
        let mut bank = gw_history.and_then(|h| h.bank).and_then(normalize_tenths);
        if is_current {
            match self.client.entry(manager_id).await {
                Ok(entry) => {
                    if let Some(v) = entry.last_deadline_value.and_then(normalize_tenths) {
                        team_value = Some(v);
                    }
                    if let Some(b) = entry.last_deadline_bank.and_then(normalize_tenths) {
                        bank = Some(b);
                    }
                }
                Err(e) => {
                    debug!(manager_id, error = %e, "Entry fetch for team value failed");
                }
            }
        }
        if team_value.is_none() {
            team_value = existing.as_ref().and_then(|h| h.team_value_tenths);
        }
        if bank.is_none() {
            bank = existing.as_ref().and_then(|h| h.bank_tenths);
        }

        let active_chip = calculated
            .active_chip
            .clone()
            .or_else(|| existing.as_ref().and_then(|h| h.active_chip.clone()));

        let row = ManagerGameweekHistoryRow {
            manager_id,
            gameweek_id: gameweek,
            gameweek_points,
            transfer_cost: calculated.transfer_cost,
            total_points,
            overall_rank,
            previous_overall_rank,
            overall_rank_change,
            gameweek_rank,
            mini_league_rank: existing.as_ref().and_then(|h| h.mini_league_rank),
            previous_mini_league_rank: existing
                .as_ref()
                .and_then(|h| h.previous_mini_league_rank),
            mini_league_rank_change: existing
                .as_ref()
                .and_then(|h| h.mini_league_rank_change),
            team_value_tenths: team_value,
            bank_tenths: bank,
            active_chip,
            transfers_made: gw_history
                .map(|h| h.event_transfers)
                .or_else(|| existing.as_ref().map(|h| h.transfers_made))
                .unwrap_or(0),
            baseline_total_points: baseline_total,
        };
        self.store.upsert_manager_history(&row).await?;

        if !is_finished {
            self.sync_auto_sub_flags_to_picks(manager_id, gameweek).await?;
        }

        debug!(
            manager_id,
            gameweek, gameweek_points, total_points, "Refreshed manager gameweek history"
        );
        Ok(())
    }

    /// Cohort-wide, store-only points refresh (no upstream). Returns true only
    /// when every manager updated, so callers can keep the standings aggregate
    /// atomic.
    pub async fn refresh_manager_points_live_only(
        &self,
        manager_ids: &[i64],
        gameweek: i32,
    ) -> Result<bool> {
        if manager_ids.is_empty() {
            return Ok(true);
        }

        let picks = self
            .store
            .get_picks_for_managers(gameweek, manager_ids)
            .await?;
        if picks.is_empty() {
            return Ok(true);
        }
        let picks_by_manager = group_picks(&picks);
        let player_ids: Vec<i64> = picks
            .iter()
            .map(|p| p.player_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let ctx = self.points_context_for_players(gameweek, &player_ids).await?;

        let histories = self
            .store
            .get_history_for_managers(gameweek, manager_ids)
            .await?;
        let history_by_manager: HashMap<i64, &ManagerGameweekHistoryRow> =
            histories.iter().map(|h| (h.manager_id, h)).collect();
        let prev_totals = self
            .previous_totals_for_unbaselined(gameweek, manager_ids, &history_by_manager)
            .await?;

        let mut all_ok = true;
        for manager_id in manager_ids {
            let Some(slots) = picks_by_manager.get(manager_id) else {
                continue;
            };
            let history = history_by_manager.get(manager_id);
            let transfer_cost = history.map(|h| h.transfer_cost).unwrap_or(0);
            let chip = history
                .and_then(|h| h.active_chip.as_deref())
                .and_then(Chip::from_api);
            let computed = points::compute_gameweek_points(slots, &[], &ctx, chip, transfer_cost);
            let total = points::resolve_total_points(
                history.and_then(|h| h.baseline_total_points),
                prev_totals.get(manager_id).copied(),
                computed.gameweek_points,
            );
            if let Err(e) = self
                .store
                .update_manager_history_points(
                    *manager_id,
                    gameweek,
                    computed.gameweek_points,
                    total,
                )
                .await
            {
                warn!(manager_id, gameweek, error = %e, "Live-only points update failed");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    /// Cohort-wide points refresh from an in-memory event-live payload: four
    /// batched store reads, in-memory computation, one write per manager.
    pub async fn refresh_manager_points_from_live_data(
        &self,
        manager_ids: &[i64],
        gameweek: i32,
        live: &EventLive,
        fixtures_by_id: &HashMap<i64, ApiFixture>,
        bootstrap: &Bootstrap,
    ) -> Result<bool> {
        if manager_ids.is_empty() || live.elements.is_empty() {
            return Ok(manager_ids.is_empty());
        }

        let picks = self
            .store
            .get_picks_for_managers(gameweek, manager_ids)
            .await?;
        if picks.is_empty() {
            return Ok(true);
        }
        let picks_by_manager = group_picks(&picks);
        let picked_ids: Vec<i64> = picks
            .iter()
            .map(|p| p.player_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let players = self.store.get_players_by_ids(&picked_ids).await?;

        let histories = self
            .store
            .get_history_for_managers(gameweek, manager_ids)
            .await?;
        let history_by_manager: HashMap<i64, &ManagerGameweekHistoryRow> =
            histories.iter().map(|h| (h.manager_id, h)).collect();
        let prev_totals = self
            .previous_totals_for_unbaselined(gameweek, manager_ids, &history_by_manager)
            .await?;

        let ctx = live_points_context(
            &picked_ids,
            live,
            fixtures_by_id,
            bootstrap,
            |id| players.get(&id).map(|p| (p.team_id, p.position)),
        );

        let mut all_ok = true;
        for manager_id in manager_ids {
            let Some(slots) = picks_by_manager.get(manager_id) else {
                continue;
            };
            let history = history_by_manager.get(manager_id);
            let transfer_cost = history.map(|h| h.transfer_cost).unwrap_or(0);
            let chip = history
                .and_then(|h| h.active_chip.as_deref())
                .and_then(Chip::from_api);
            let computed = points::compute_gameweek_points(slots, &[], &ctx, chip, transfer_cost);
            let total = points::resolve_total_points(
                history.and_then(|h| h.baseline_total_points),
                prev_totals.get(manager_id).copied(),
                computed.gameweek_points,
            );
            if let Err(e) = self
                .store
                .update_manager_history_points(
                    *manager_id,
                    gameweek,
                    computed.gameweek_points,
                    total,
                )
                .await
            {
                warn!(manager_id, gameweek, error = %e, "Live-data points update failed");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    async fn previous_totals_for_unbaselined(
        &self,
        gameweek: i32,
        manager_ids: &[i64],
        history_by_manager: &HashMap<i64, &ManagerGameweekHistoryRow>,
    ) -> Result<HashMap<i64, i32>> {
        let need_previous: Vec<i64> = manager_ids
            .iter()
            .filter(|m| {
                history_by_manager
                    .get(*m)
                    .and_then(|h| h.baseline_total_points)
                    .is_none()
            })
            .copied()
            .collect();
        if need_previous.is_empty() || gameweek <= 1 {
            return Ok(HashMap::new());
        }
        Ok(self
            .store
            .get_history_for_managers(gameweek - 1, &need_previous)
            .await?
            .into_iter()
            .map(|h| (h.manager_id, h.total_points))
            .collect())
    }

    /// Seed history rows for a gameweek that just became current by copying
    /// baselines from the previous gameweek. Never overwrites gameweek points
    /// a live refresh already produced.
    pub async fn seed_manager_gameweek_history_from_previous(
        &self,
        manager_ids: &[i64],
        target_gameweek: i32,
        picks_meta: &HashMap<i64, PicksMeta>,
    ) -> Result<()> {
        let previous_gw = target_gameweek - 1;
        for manager_id in manager_ids {
            let meta = picks_meta.get(manager_id).cloned().unwrap_or_default();
            let previous = if previous_gw >= 1 {
                self.store
                    .get_manager_history(*manager_id, previous_gw)
                    .await?
            } else {
                None
            };
            let Some(previous) = previous else {
                // No previous gameweek (season start): minimal row.
                self.store
                    .upsert_manager_history(&ManagerGameweekHistoryRow {
                        manager_id: *manager_id,
                        gameweek_id: target_gameweek,
                        active_chip: meta.active_chip,
                        gameweek_rank: meta.gameweek_rank,
                        ..Default::default()
                    })
                    .await?;
                continue;
            };

            let transfers_made = self
                .store
                .get_manager_transfers(*manager_id, target_gameweek)
                .await?
                .len() as i32;

            let existing = self
                .store
                .get_manager_history(*manager_id, target_gameweek)
                .await?;
            let (gameweek_points, total_points) = match existing {
                Some(ref e) if e.gameweek_points > 0 => (
                    e.gameweek_points,
                    if e.total_points > 0 {
                        e.total_points
                    } else {
                        previous.total_points
                    },
                ),
                _ => (0, previous.total_points),
            };

            self.store
                .upsert_manager_history(&ManagerGameweekHistoryRow {
                    manager_id: *manager_id,
                    gameweek_id: target_gameweek,
                    gameweek_points,
                    transfer_cost: 0,
                    total_points,
                    overall_rank: None,
                    previous_overall_rank: previous.overall_rank,
                    overall_rank_change: None,
                    gameweek_rank: meta.gameweek_rank,
                    mini_league_rank: None,
                    previous_mini_league_rank: previous.mini_league_rank,
                    mini_league_rank_change: None,
                    team_value_tenths: previous.team_value_tenths,
                    bank_tenths: previous.bank_tenths,
                    active_chip: meta.active_chip,
                    transfers_made,
                    baseline_total_points: Some(previous.total_points),
                })
                .await?;
        }
        info!(
            gameweek = target_gameweek,
            prev_gw = previous_gw,
            count = manager_ids.len(),
            "Seeded manager gameweek history from previous GW"
        );
        Ok(())
    }

    /// Recompute mini-league ranks for one league: sort by total points
    /// descending (manager id ascending within ties); tied managers share the
    /// lower rank and the next distinct rank equals position-in-sort.
    pub async fn calculate_mini_league_ranks(&self, league_id: i64, gameweek: i32) -> Result<()> {
        let member_ids = self.store.get_league_member_ids(league_id).await?;
        if member_ids.is_empty() {
            return Ok(());
        }
        let mut rows = self
            .store
            .get_history_for_managers(gameweek, &member_ids)
            .await?;
        rows.sort_by_key(|h| (-(h.total_points as i64), h.manager_id));

        // Previous mini ranks: baseline column first, previous gameweek as a
        // fallback when the capture was missed.
        let mut previous_ranks: HashMap<i64, i64> = HashMap::new();
        for row in &rows {
            if let Some(prev) = row.previous_mini_league_rank {
                previous_ranks.insert(row.manager_id, prev);
            }
        }
        let missing: Vec<i64> = rows
            .iter()
            .filter(|r| !previous_ranks.contains_key(&r.manager_id))
            .map(|r| r.manager_id)
            .collect();
        if !missing.is_empty() && gameweek > 1 {
            for prev_row in self
                .store
                .get_history_for_managers(gameweek - 1, &missing)
                .await?
            {
                if let Some(rank) = prev_row.mini_league_rank {
                    previous_ranks.insert(prev_row.manager_id, rank);
                }
            }
        }

        let mut current_rank: i64 = 1;
        let mut previous_points: Option<i32> = None;
        for (index, row) in rows.iter().enumerate() {
            if previous_points.map_or(false, |p| p != row.total_points) {
                current_rank = index as i64 + 1;
            }
            let rank_change = previous_ranks
                .get(&row.manager_id)
                .map(|prev| prev - current_rank);
            self.store
                .update_manager_history_league_rank(
                    row.manager_id,
                    gameweek,
                    current_rank,
                    rank_change,
                )
                .await?;
            previous_points = Some(row.total_points);
        }

        info!(league_id, gameweek, managers = rows.len(), "League ranks updated");
        Ok(())
    }

    /// Poll one manager and report whether upstream now shows a different
    /// (non-null) overall or gameweek rank than we have stored.
    pub async fn check_fpl_rank_change(&self, manager_id: i64, gameweek: i32) -> Result<bool> {
        let history = self.client.entry_history(manager_id).await?;
        let picks = self.client.entry_picks(manager_id, gameweek).await?;

        let api_overall = history.for_gameweek(gameweek).and_then(|h| h.overall_rank);
        let api_gw_rank = picks.entry_history.and_then(|h| h.rank);

        let stored = self.store.get_manager_history(manager_id, gameweek).await?;
        let stored_overall = stored.as_ref().and_then(|h| h.overall_rank);
        let stored_gw_rank = stored.as_ref().and_then(|h| h.gameweek_rank);

        let overall_changed =
            api_overall.is_some() && api_overall != stored_overall;
        let gw_rank_changed = api_gw_rank.is_some() && api_gw_rank != stored_gw_rank;

        if overall_changed || gw_rank_changed {
            info!(
                manager_id,
                gameweek,
                ?api_overall,
                ?stored_overall,
                ?api_gw_rank,
                ?stored_gw_rank,
                "FPL rank change detected"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// True when the count of settled-bonus players in finished fixtures grew
    /// since the last check. Upstream only updates ranks after bonuses settle,
    /// so a growing count is the cue to re-poll ranks after each matchday.
    pub async fn check_new_bonuses_confirmed(&self, gameweek: i32) -> Result<bool> {
        let current = self.store.count_confirmed_bonus(gameweek).await?;
        let mut entry = self.confirmed_bonus_counts.entry(gameweek).or_insert(0);
        let grew = current > *entry;
        if grew {
            info!(
                gameweek,
                previous = *entry,
                current,
                "New bonuses confirmed"
            );
        }
        *entry = current;
        Ok(grew)
    }

    /// Players owned by at least one league member this gameweek, persisted so
    /// front-ends can filter to "owned" players.
    pub async fn build_player_whitelist(&self, league_id: i64, gameweek: i32) -> Result<usize> {
        let member_ids = self.store.get_league_member_ids(league_id).await?;
        let picks = self
            .store
            .get_picks_for_managers(gameweek, &member_ids)
            .await?;
        let owned: Vec<i64> = picks
            .iter()
            .map(|p| p.player_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        self.store
            .upsert_player_whitelist(league_id, gameweek, &owned)
            .await?;
        info!(
            league_id,
            gameweek,
            players = owned.len(),
            managers = member_ids.len(),
            "Player whitelist built"
        );
        Ok(owned.len())
    }

    /// Re-infer auto-subs from store state and rewrite only the three flag
    /// columns on the stored picks, so the UI shows substitution indicators
    /// without waiting for the deadline batch.
    pub async fn sync_auto_sub_flags_to_picks(
        &self,
        manager_id: i64,
        gameweek: i32,
    ) -> Result<()> {
        let picks = self.store.get_manager_picks(manager_id, gameweek).await?;
        if picks.is_empty() {
            return Ok(());
        }
        let slots = pick_slots(&picks);
        let player_ids: Vec<i64> = slots.iter().map(|s| s.player_id).collect();
        let ctx = self.points_context_for_players(gameweek, &player_ids).await?;
        let subs = points::infer_automatic_subs(&slots, &ctx);

        let subbed_out: HashSet<i64> = subs.iter().map(|s| s.element_out).collect();
        let replaced_by: HashMap<i64, i64> =
            subs.iter().map(|s| (s.element_in, s.element_out)).collect();

        let mut changed = Vec::new();
        for pick in &picks {
            let was_out = subbed_out.contains(&pick.player_id);
            let was_in = replaced_by.contains_key(&pick.player_id);
            let replaced = replaced_by.get(&pick.player_id).copied();
            if pick.was_auto_subbed_out == was_out
                && pick.was_auto_subbed_in == was_in
                && pick.auto_sub_replaced_player_id == replaced
            {
                continue;
            }
            let mut updated = pick.clone();
            updated.was_auto_subbed_out = was_out;
            updated.was_auto_subbed_in = was_in;
            updated.auto_sub_replaced_player_id = replaced;
            changed.push(updated);
        }
        if !changed.is_empty() {
            self.store.upsert_manager_picks(&changed).await?;
            debug!(
                manager_id,
                gameweek,
                updated = changed.len(),
                "Synced auto-sub flags to picks"
            );
        }
        Ok(())
    }
}

fn pick_slots(picks: &[ManagerPickRow]) -> Vec<PickSlot> {
    picks
        .iter()
        .map(|p| PickSlot {
            player_id: p.player_id,
            position: p.position,
            multiplier: p.multiplier,
            is_captain: p.is_captain,
            is_vice_captain: p.is_vice_captain,
        })
        .collect()
}

fn group_picks(picks: &[ManagerPickRow]) -> HashMap<i64, Vec<PickSlot>> {
    let mut by_manager: HashMap<i64, Vec<PickSlot>> = HashMap::new();
    for pick in picks {
        by_manager
            .entry(pick.manager_id)
            .or_default()
            .push(PickSlot {
                player_id: pick.player_id,
                position: pick.position,
                multiplier: pick.multiplier,
                is_captain: pick.is_captain,
                is_vice_captain: pick.is_vice_captain,
            });
    }
    for slots in by_manager.values_mut() {
        slots.sort_by_key(|s| s.position);
    }
    by_manager
}

/// Build calculator inputs straight from an event-live payload: minutes and
/// points per picked player, fixture outcomes from the fixtures map, and
/// synthesized provisional bonus from a full-fixture BPS ranking.
fn live_points_context(
    picked_ids: &[i64],
    live: &EventLive,
    fixtures_by_id: &HashMap<i64, ApiFixture>,
    bootstrap: &Bootstrap,
    player_info: impl Fn(i64) -> Option<(i64, Position)>,
) -> PointsContext {
    let elements = bootstrap.elements_by_id();
    let live_by_id = live.elements_by_id();

    // BPS per fixture across every live element, for bonus ranking.
    let mut bps_by_fixture: HashMap<i64, Vec<i32>> = HashMap::new();
    for elem in &live.elements {
        let Some(team) = elements.get(&elem.id).map(|e| e.team) else {
            continue;
        };
        for fx in fixtures_by_id.values() {
            if fx.team_h == team || fx.team_a == team {
                bps_by_fixture.entry(fx.id).or_default().push(elem.stats.bps);
            }
        }
    }

    let mut ctx = PointsContext::default();
    for player_id in picked_ids {
        let (team_id, position) = match player_info(*player_id) {
            Some(info) => (Some(info.0), Some(info.1)),
            None => (
                elements.get(player_id).map(|e| e.team),
                elements
                    .get(player_id)
                    .and_then(|e| Position::from_element_type(e.element_type)),
            ),
        };

        let team_fixtures: Vec<&ApiFixture> = team_id
            .map(|t| {
                fixtures_by_id
                    .values()
                    .filter(|f| f.team_h == t || f.team_a == t)
                    .collect()
            })
            .unwrap_or_default();
        let fixtures = if team_fixtures.is_empty() {
            points::FixtureOutcome::default()
        } else {
            points::FixtureOutcome {
                all_finished: team_fixtures.iter().all(|f| f.finished),
                all_done: team_fixtures
                    .iter()
                    .all(|f| f.finished || f.finished_provisional),
            }
        };

        let (minutes, mut effective_points, bps, bonus) = live_by_id
            .get(player_id)
            .map(|e| (e.stats.minutes, e.stats.total_points, e.stats.bps, e.stats.bonus))
            .unwrap_or((0, 0, 0, 0));

        // Provisional bonus once the player's fixtures are done and upstream
        // has not folded bonus into the total yet.
        if fixtures.all_done && !fixtures.all_finished && bonus == 0 {
            if let Some(fixture_bps) = team_fixtures
                .first()
                .and_then(|f| bps_by_fixture.get(&f.id))
            {
                effective_points += points::provisional_bonus(bps, fixture_bps);
            }
        }

        ctx.players.insert(
            *player_id,
            PlayerGwInput {
                minutes,
                effective_points,
                fixtures,
                position,
            },
        );
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::domain::GameweekRow;

    fn history(manager_id: i64, gameweek_id: i32, total: i32) -> ManagerGameweekHistoryRow {
        ManagerGameweekHistoryRow {
            manager_id,
            gameweek_id,
            total_points: total,
            ..Default::default()
        }
    }

    async fn test_refresher() -> (ManagerRefresher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(
            FplClient::new(&crate::settings::Settings::default()).expect("client builds"),
        );
        let shared: SharedStore = store.clone();
        (ManagerRefresher::new(client, shared), store)
    }

    #[tokio::test]
    async fn mini_league_tie_ranks_share_the_lower_rank() {
        let (refresher, store) = test_refresher().await;
        store.add_league(99, "Test League", &[1, 2, 3]).await;
        store
            .upsert_gameweek(&GameweekRow {
                id: 5,
                name: "Gameweek 5".to_string(),
                deadline_at: None,
                release_at: None,
                is_current: true,
                is_previous: false,
                is_next: false,
                finished: false,
                data_checked: false,
                ranks_finalized: false,
                highest_score: None,
                average_entry_score: None,
            })
            .await
            .unwrap();
        store.upsert_manager_history(&history(1, 5, 100)).await.unwrap();
        store.upsert_manager_history(&history(2, 5, 100)).await.unwrap();
        store.upsert_manager_history(&history(3, 5, 95)).await.unwrap();

        refresher.calculate_mini_league_ranks(99, 5).await.unwrap();

        let rows = store.get_history_for_managers(5, &[1, 2, 3]).await.unwrap();
        let rank_of = |id: i64| {
            rows.iter()
                .find(|r| r.manager_id == id)
                .and_then(|r| r.mini_league_rank)
                .unwrap()
        };
        assert_eq!(rank_of(1), 1);
        assert_eq!(rank_of(2), 1);
        assert_eq!(rank_of(3), 3);
    }

    #[tokio::test]
    async fn mini_league_rank_change_uses_preserved_baseline() {
        let (refresher, store) = test_refresher().await;
        store.add_league(7, "Delta League", &[10, 20]).await;
        let mut first = history(10, 3, 80);
        first.previous_mini_league_rank = Some(2);
        let mut second = history(20, 3, 70);
        second.previous_mini_league_rank = Some(1);
        store.upsert_manager_history(&first).await.unwrap();
        store.upsert_manager_history(&second).await.unwrap();

        refresher.calculate_mini_league_ranks(7, 3).await.unwrap();

        let rows = store.get_history_for_managers(3, &[10, 20]).await.unwrap();
        let row10 = rows.iter().find(|r| r.manager_id == 10).unwrap();
        let row20 = rows.iter().find(|r| r.manager_id == 20).unwrap();
        // Manager 10 moved 2 -> 1 (+1); manager 20 moved 1 -> 2 (-1).
        assert_eq!(row10.mini_league_rank, Some(1));
        assert_eq!(row10.mini_league_rank_change, Some(1));
        assert_eq!(row20.mini_league_rank, Some(2));
        assert_eq!(row20.mini_league_rank_change, Some(-1));
    }

    #[tokio::test]
    async fn bonus_counter_reports_growth_once() {
        let (refresher, store) = test_refresher().await;
        use crate::types::domain::{BonusStatus, PlayerGameweekStatsRow};
        let mut row = PlayerGameweekStatsRow {
            player_id: 1,
            gameweek_id: 8,
            fixture_id: Some(70),
            team_id: 1,
            opponent_team_id: Some(2),
            was_home: Some(true),
            kickoff_at: None,
            minutes: 90,
            total_points: 10,
            bps: 40,
            bonus: 3,
            bonus_status: BonusStatus::Confirmed,
            provisional_bonus: 0,
            goals: 1,
            assists: 0,
            own_goals: 0,
            penalties_saved: 0,
            penalties_missed: 0,
            saves: 0,
            clean_sheets: 0,
            goals_conceded: 0,
            yellow_cards: 0,
            red_cards: 0,
            defensive_contribution: 0,
            expected_goals: 0.0,
            expected_assists: 0.0,
            expected_goal_involvements: 0.0,
            expected_goals_conceded: 0.0,
            influence: 0.0,
            creativity: 0.0,
            threat: 0.0,
            ict_index: 0.0,
            home_score: Some(2),
            away_score: Some(0),
            match_finished: true,
            match_finished_provisional: true,
        };
        assert!(!refresher.check_new_bonuses_confirmed(8).await.unwrap());
        store.upsert_player_gameweek_stats(&[row.clone()]).await.unwrap();
        assert!(refresher.check_new_bonuses_confirmed(8).await.unwrap());
        // Unchanged count: no new signal.
        assert!(!refresher.check_new_bonuses_confirmed(8).await.unwrap());
        // Another settled player raises the count again.
        row.player_id = 2;
        row.bonus = 0;
        store.upsert_player_gameweek_stats(&[row]).await.unwrap();
        assert!(refresher.check_new_bonuses_confirmed(8).await.unwrap());
    }
}
