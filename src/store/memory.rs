//! In-memory [`Store`] implementation.
//!
//! Backs the test suite and local runs without a database. Tables are plain
//! maps behind one `RwLock`; the write paths mirror the Postgres semantics,
//! including the monotonic fixture-minutes clamp and upsert keying, so the
//! refresh core behaves identically against either store.

use super::Store;
use crate::types::domain::{
    DeadlineBatchRun, FixtureRow, GameweekRow, ManagerGameweekHistoryRow, ManagerPickRow,
    ManagerRow, ManagerTransferRow, MatchdayBaselineRow, MiniLeagueRow, PlayerGameweekStatsRow,
    PlayerPriceRow, PlayerRow, RefreshPath, TeamRow,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    gameweeks: BTreeMap<i32, GameweekRow>,
    total_players: Option<i64>,
    teams: HashMap<i64, TeamRow>,
    players: HashMap<i64, PlayerRow>,
    fixtures: HashMap<i64, FixtureRow>,
    /// Key: (player_id, gameweek_id, fixture_id or 0).
    player_stats: HashMap<(i64, i32, i64), PlayerGameweekStatsRow>,
    /// Key: (player_id, recorded_date).
    player_prices: HashMap<(i64, NaiveDate), PlayerPriceRow>,
    price_predictions_cleared: u64,
    managers: HashMap<i64, ManagerRow>,
    /// Key: (manager_id, gameweek_id, position).
    picks: BTreeMap<(i64, i32, i32), ManagerPickRow>,
    /// Key: (manager_id, gameweek_id, player_in_id, player_out_id).
    transfers: HashMap<(i64, i32, i64, i64), ManagerTransferRow>,
    /// Key: (manager_id, gameweek_id).
    history: HashMap<(i64, i32), ManagerGameweekHistoryRow>,
    leagues: BTreeMap<i64, MiniLeagueRow>,
    league_members: HashMap<i64, Vec<i64>>,
    /// Key: (league_id, gameweek_id).
    whitelist: HashMap<(i64, i32), HashSet<i64>>,
    /// Key: (manager_id, gameweek_id, matchday_sequence).
    matchday_baselines: HashMap<(i64, i32, i32), MatchdayBaselineRow>,
    batch_runs: Vec<DeadlineBatchRun>,
    refresh_events: Vec<(DateTime<Utc>, RefreshPath)>,
    mv_full_refreshes: u64,
    mv_live_refreshes: u64,
}

/// In-memory store. Cheap to clone behind an `Arc`; all state is shared.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tracked league with its member managers (test setup).
    pub async fn add_league(&self, league_id: i64, name: &str, members: &[i64]) {
        let mut inner = self.inner.write().await;
        inner.leagues.insert(
            league_id,
            MiniLeagueRow {
                id: league_id,
                name: name.to_string(),
            },
        );
        inner.league_members.insert(league_id, members.to_vec());
    }

    pub async fn mv_full_refresh_count(&self) -> u64 {
        self.inner.read().await.mv_full_refreshes
    }

    pub async fn mv_live_refresh_count(&self) -> u64 {
        self.inner.read().await.mv_live_refreshes
    }

    pub async fn refresh_event_count(&self, path: RefreshPath) -> usize {
        self.inner
            .read()
            .await
            .refresh_events
            .iter()
            .filter(|(_, p)| *p == path)
            .count()
    }

    pub async fn price_predictions_cleared_count(&self) -> u64 {
        self.inner.read().await.price_predictions_cleared
    }

    pub async fn whitelist_for(&self, league_id: i64, gameweek_id: i32) -> Vec<i64> {
        let inner = self.inner.read().await;
        let mut ids: Vec<i64> = inner
            .whitelist
            .get(&(league_id, gameweek_id))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_gameweek(&self, row: &GameweekRow) -> Result<()> {
        let mut inner = self.inner.write().await;
        let ranks_finalized = inner
            .gameweeks
            .get(&row.id)
            .map(|g| g.ranks_finalized)
            .unwrap_or(false);
        let mut row = row.clone();
        row.ranks_finalized = ranks_finalized;
        inner.gameweeks.insert(row.id, row);
        Ok(())
    }

    async fn get_gameweek(&self, gameweek_id: i32) -> Result<Option<GameweekRow>> {
        Ok(self.inner.read().await.gameweeks.get(&gameweek_id).cloned())
    }

    async fn get_current_gameweek(&self) -> Result<Option<GameweekRow>> {
        Ok(self
            .inner
            .read()
            .await
            .gameweeks
            .values()
            .find(|g| g.is_current)
            .cloned())
    }

    async fn get_next_gameweek(&self) -> Result<Option<GameweekRow>> {
        Ok(self
            .inner
            .read()
            .await
            .gameweeks
            .values()
            .find(|g| g.is_next)
            .cloned())
    }

    async fn set_gameweek_ranks_finalized(&self, gameweek_id: i32, finalized: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(gw) = inner.gameweeks.get_mut(&gameweek_id) {
            gw.ranks_finalized = finalized;
        }
        Ok(())
    }

    async fn upsert_total_players(&self, total_players: i64) -> Result<()> {
        self.inner.write().await.total_players = Some(total_players);
        Ok(())
    }

    async fn upsert_team(&self, row: &TeamRow) -> Result<()> {
        self.inner.write().await.teams.insert(row.id, row.clone());
        Ok(())
    }

    async fn upsert_player(&self, row: &PlayerRow) -> Result<()> {
        self.inner.write().await.players.insert(row.id, row.clone());
        Ok(())
    }

    async fn get_players_by_ids(&self, player_ids: &[i64]) -> Result<HashMap<i64, PlayerRow>> {
        let inner = self.inner.read().await;
        Ok(player_ids
            .iter()
            .filter_map(|id| inner.players.get(id).map(|p| (*id, p.clone())))
            .collect())
    }

    async fn get_player_ids_for_teams(&self, team_ids: &[i64]) -> Result<Vec<i64>> {
        let inner = self.inner.read().await;
        let wanted: HashSet<i64> = team_ids.iter().copied().collect();
        Ok(inner
            .players
            .values()
            .filter(|p| wanted.contains(&p.team_id))
            .map(|p| p.id)
            .collect())
    }

    async fn upsert_fixture(&self, row: &FixtureRow) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut row = row.clone();
        if let Some(existing) = inner.fixtures.get(&row.id) {
            // Minutes are monotonically non-decreasing once started.
            row.minutes = row.minutes.max(existing.minutes);
        }
        inner.fixtures.insert(row.id, row);
        Ok(())
    }

    async fn get_fixtures_for_gameweek(&self, gameweek_id: i32) -> Result<Vec<FixtureRow>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<FixtureRow> = inner
            .fixtures
            .values()
            .filter(|f| f.gameweek_id == Some(gameweek_id))
            .cloned()
            .collect();
        rows.sort_by_key(|f| (f.kickoff_at, f.id));
        Ok(rows)
    }

    async fn update_fixture_scores(
        &self,
        fpl_fixture_id: i64,
        home_score: Option<i32>,
        away_score: Option<i32>,
        minutes: Option<i32>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(fx) = inner.fixtures.get_mut(&fpl_fixture_id) {
            if home_score.is_some() {
                fx.home_score = home_score;
            }
            if away_score.is_some() {
                fx.away_score = away_score;
            }
            if let Some(m) = minutes {
                fx.minutes = fx.minutes.max(m);
            }
        }
        Ok(())
    }

    async fn get_first_kickoff_for_gameweek(
        &self,
        gameweek_id: i32,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .fixtures
            .values()
            .filter(|f| f.gameweek_id == Some(gameweek_id))
            .filter_map(|f| f.kickoff_at)
            .min())
    }

    async fn get_next_kickoff_for_gameweek(
        &self,
        gameweek_id: i32,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .fixtures
            .values()
            .filter(|f| f.gameweek_id == Some(gameweek_id))
            .filter_map(|f| f.kickoff_at)
            .filter(|k| *k > after)
            .min())
    }

    async fn upsert_player_gameweek_stats(&self, rows: &[PlayerGameweekStatsRow]) -> Result<()> {
        use crate::types::domain::BonusStatus;
        let mut inner = self.inner.write().await;
        for row in rows {
            let key = (row.player_id, row.gameweek_id, row.fixture_id.unwrap_or(0));
            let mut row = row.clone();
            // Bonus status is a monotone lattice: provisional -> confirmed.
            if let Some(existing) = inner.player_stats.get(&key) {
                if existing.bonus_status == BonusStatus::Confirmed {
                    row.bonus_status = BonusStatus::Confirmed;
                }
            }
            inner.player_stats.insert(key, row);
        }
        Ok(())
    }

    async fn get_player_stats_for_gameweek(
        &self,
        gameweek_id: i32,
    ) -> Result<Vec<PlayerGameweekStatsRow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .player_stats
            .values()
            .filter(|s| s.gameweek_id == gameweek_id)
            .cloned()
            .collect())
    }

    async fn get_player_stats_for_players(
        &self,
        gameweek_id: i32,
        player_ids: &[i64],
    ) -> Result<Vec<PlayerGameweekStatsRow>> {
        let wanted: HashSet<i64> = player_ids.iter().copied().collect();
        let inner = self.inner.read().await;
        Ok(inner
            .player_stats
            .values()
            .filter(|s| s.gameweek_id == gameweek_id && wanted.contains(&s.player_id))
            .cloned()
            .collect())
    }

    async fn get_player_ids_with_stats(&self, gameweek_id: i32) -> Result<Vec<i64>> {
        let inner = self.inner.read().await;
        let ids: HashSet<i64> = inner
            .player_stats
            .values()
            .filter(|s| s.gameweek_id == gameweek_id)
            .map(|s| s.player_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn has_provisional_bonus(&self, gameweek_id: i32) -> Result<bool> {
        use crate::types::domain::BonusStatus;
        let inner = self.inner.read().await;
        Ok(inner
            .player_stats
            .values()
            .any(|s| s.gameweek_id == gameweek_id && s.bonus_status == BonusStatus::Provisional))
    }

    async fn count_confirmed_bonus(&self, gameweek_id: i32) -> Result<i64> {
        use crate::types::domain::BonusStatus;
        let inner = self.inner.read().await;
        Ok(inner
            .player_stats
            .values()
            .filter(|s| {
                s.gameweek_id == gameweek_id
                    && s.match_finished
                    && (s.bonus > 0 || s.bonus_status == BonusStatus::Confirmed)
            })
            .count() as i64)
    }

    async fn upsert_player_price(&self, row: &PlayerPriceRow) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .player_prices
            .insert((row.player_id, row.recorded_date), row.clone());
        Ok(())
    }

    async fn get_latest_player_prices(&self) -> Result<HashMap<i64, i32>> {
        let inner = self.inner.read().await;
        let mut latest: HashMap<i64, (NaiveDate, i32)> = HashMap::new();
        for row in inner.player_prices.values() {
            let entry = latest
                .entry(row.player_id)
                .or_insert((row.recorded_date, row.price_tenths));
            if row.recorded_date >= entry.0 {
                *entry = (row.recorded_date, row.price_tenths);
            }
        }
        Ok(latest.into_iter().map(|(k, (_, v))| (k, v)).collect())
    }

    async fn clear_price_change_predictions(&self) -> Result<()> {
        self.inner.write().await.price_predictions_cleared += 1;
        Ok(())
    }

    async fn upsert_manager(&self, row: &ManagerRow) -> Result<()> {
        self.inner.write().await.managers.insert(row.id, row.clone());
        Ok(())
    }

    async fn get_manager(&self, manager_id: i64) -> Result<Option<ManagerRow>> {
        Ok(self.inner.read().await.managers.get(&manager_id).cloned())
    }

    async fn upsert_manager_picks(&self, rows: &[ManagerPickRow]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for row in rows {
            inner
                .picks
                .insert((row.manager_id, row.gameweek_id, row.position), row.clone());
        }
        Ok(())
    }

    async fn get_manager_picks(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Vec<ManagerPickRow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .picks
            .range((manager_id, gameweek_id, 0)..=(manager_id, gameweek_id, i32::MAX))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn get_picks_for_managers(
        &self,
        gameweek_id: i32,
        manager_ids: &[i64],
    ) -> Result<Vec<ManagerPickRow>> {
        let wanted: HashSet<i64> = manager_ids.iter().copied().collect();
        let inner = self.inner.read().await;
        Ok(inner
            .picks
            .values()
            .filter(|p| p.gameweek_id == gameweek_id && wanted.contains(&p.manager_id))
            .cloned()
            .collect())
    }

    async fn upsert_manager_transfer(&self, row: &ManagerTransferRow) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (
            row.manager_id,
            row.gameweek_id,
            row.player_in_id,
            row.player_out_id,
        );
        // Keep captured point baselines across re-upserts.
        let mut row = row.clone();
        if let Some(existing) = inner.transfers.get(&key) {
            if row.player_in_points_baseline.is_none() {
                row.player_in_points_baseline = existing.player_in_points_baseline;
                row.player_out_points_baseline = existing.player_out_points_baseline;
                row.point_impact_baseline = existing.point_impact_baseline;
            }
        }
        inner.transfers.insert(key, row);
        Ok(())
    }

    async fn get_manager_transfers(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Vec<ManagerTransferRow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .transfers
            .values()
            .filter(|t| t.manager_id == manager_id && t.gameweek_id == gameweek_id)
            .cloned()
            .collect())
    }

    async fn set_transfer_baselines_if_unset(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        player_in_id: i64,
        player_out_id: i64,
        player_in_points: i32,
        player_out_points: i32,
        point_impact: i32,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (manager_id, gameweek_id, player_in_id, player_out_id);
        if let Some(t) = inner.transfers.get_mut(&key) {
            if t.player_in_points_baseline.is_none() {
                t.player_in_points_baseline = Some(player_in_points);
                t.player_out_points_baseline = Some(player_out_points);
                t.point_impact_baseline = Some(point_impact);
            }
        }
        Ok(())
    }

    async fn upsert_manager_history(&self, row: &ManagerGameweekHistoryRow) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .history
            .insert((row.manager_id, row.gameweek_id), row.clone());
        Ok(())
    }

    async fn get_manager_history(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Option<ManagerGameweekHistoryRow>> {
        Ok(self
            .inner
            .read()
            .await
            .history
            .get(&(manager_id, gameweek_id))
            .cloned())
    }

    async fn get_history_for_managers(
        &self,
        gameweek_id: i32,
        manager_ids: &[i64],
    ) -> Result<Vec<ManagerGameweekHistoryRow>> {
        let inner = self.inner.read().await;
        Ok(manager_ids
            .iter()
            .filter_map(|m| inner.history.get(&(*m, gameweek_id)).cloned())
            .collect())
    }

    async fn update_manager_history_points(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        gameweek_points: i32,
        total_points: i32,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.history.get_mut(&(manager_id, gameweek_id)) {
            row.gameweek_points = gameweek_points;
            row.total_points = total_points;
        }
        Ok(())
    }

    async fn update_manager_history_league_rank(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        mini_league_rank: i64,
        mini_league_rank_change: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.history.get_mut(&(manager_id, gameweek_id)) {
            row.mini_league_rank = Some(mini_league_rank);
            row.mini_league_rank_change = mini_league_rank_change;
        }
        Ok(())
    }

    async fn set_manager_history_baselines(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        baseline_total_points: Option<i32>,
        previous_overall_rank: Option<i64>,
        previous_mini_league_rank: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.history.get_mut(&(manager_id, gameweek_id)) {
            if baseline_total_points.is_some() {
                row.baseline_total_points = baseline_total_points;
            }
            if previous_overall_rank.is_some() {
                row.previous_overall_rank = previous_overall_rank;
            }
            if previous_mini_league_rank.is_some() {
                row.previous_mini_league_rank = previous_mini_league_rank;
            }
        }
        Ok(())
    }

    async fn get_league_ids(&self) -> Result<Vec<i64>> {
        Ok(self.inner.read().await.leagues.keys().copied().collect())
    }

    async fn get_league_member_ids(&self, league_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .inner
            .read()
            .await
            .league_members
            .get(&league_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_tracked_manager_ids(&self) -> Result<Vec<i64>> {
        let inner = self.inner.read().await;
        let mut ids: Vec<i64> = inner
            .league_members
            .values()
            .flatten()
            .copied()
            .collect::<HashSet<i64>>()
            .into_iter()
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn upsert_player_whitelist(
        &self,
        league_id: i64,
        gameweek_id: i32,
        player_ids: &[i64],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .whitelist
            .entry((league_id, gameweek_id))
            .or_default()
            .extend(player_ids.iter().copied());
        Ok(())
    }

    async fn upsert_matchday_baselines(&self, rows: &[MatchdayBaselineRow]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for row in rows {
            inner.matchday_baselines.insert(
                (row.manager_id, row.gameweek_id, row.matchday_sequence),
                row.clone(),
            );
        }
        Ok(())
    }

    async fn matchday_baseline_captured(
        &self,
        gameweek_id: i32,
        matchday_sequence: i32,
    ) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .matchday_baselines
            .keys()
            .any(|(_, gw, seq)| *gw == gameweek_id && *seq == matchday_sequence))
    }

    async fn insert_deadline_batch_start(&self, gameweek_id: i32) -> Result<i64> {
        let mut inner = self.inner.write().await;
        let id = inner.batch_runs.len() as i64 + 1;
        inner.batch_runs.push(DeadlineBatchRun {
            id,
            gameweek_id,
            started_at: Utc::now(),
            finished_at: None,
            success: None,
            manager_count: 0,
            league_count: 0,
            phase_breakdown: serde_json::json!({}),
        });
        Ok(id)
    }

    async fn update_deadline_batch_finish(
        &self,
        run_id: i64,
        finished_at: DateTime<Utc>,
        success: bool,
        manager_count: i32,
        league_count: i32,
        phase_breakdown: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(run) = inner.batch_runs.iter_mut().find(|r| r.id == run_id) {
            run.finished_at = Some(finished_at);
            run.success = Some(success);
            run.manager_count = manager_count;
            run.league_count = league_count;
            run.phase_breakdown = phase_breakdown;
        }
        Ok(())
    }

    async fn has_successful_deadline_batch_for_gameweek(&self, gameweek_id: i32) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .batch_runs
            .iter()
            .any(|r| r.gameweek_id == gameweek_id && r.success == Some(true)))
    }

    async fn get_deadline_batch_runs(&self, gameweek_id: i32) -> Result<Vec<DeadlineBatchRun>> {
        let inner = self.inner.read().await;
        Ok(inner
            .batch_runs
            .iter()
            .filter(|r| r.gameweek_id == gameweek_id)
            .cloned()
            .collect())
    }

    async fn insert_refresh_event(&self, path: RefreshPath) -> Result<()> {
        self.inner.write().await.refresh_events.push((Utc::now(), path));
        Ok(())
    }

    async fn refresh_all_materialized_views(&self) -> Result<()> {
        self.inner.write().await.mv_full_refreshes += 1;
        Ok(())
    }

    async fn refresh_materialized_views_for_live(&self) -> Result<()> {
        self.inner.write().await.mv_live_refreshes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(id: i64, gameweek_id: i32, minutes: i32) -> FixtureRow {
        FixtureRow {
            id,
            gameweek_id: Some(gameweek_id),
            home_team_id: 1,
            away_team_id: 2,
            kickoff_at: None,
            started: true,
            finished: false,
            finished_provisional: false,
            minutes,
            home_score: None,
            away_score: None,
        }
    }

    #[tokio::test]
    async fn fixture_minutes_never_decrease() {
        let store = MemoryStore::new();
        store.upsert_fixture(&fixture(9, 3, 55)).await.unwrap();
        store
            .update_fixture_scores(9, Some(1), Some(0), Some(40))
            .await
            .unwrap();
        let rows = store.get_fixtures_for_gameweek(3).await.unwrap();
        assert_eq!(rows[0].minutes, 55);
        assert_eq!(rows[0].home_score, Some(1));

        store
            .update_fixture_scores(9, None, None, Some(70))
            .await
            .unwrap();
        let rows = store.get_fixtures_for_gameweek(3).await.unwrap();
        assert_eq!(rows[0].minutes, 70);
        // Scores untouched when not provided.
        assert_eq!(rows[0].home_score, Some(1));

        // A full fixture upsert can't rewind the clock either.
        store.upsert_fixture(&fixture(9, 3, 10)).await.unwrap();
        let rows = store.get_fixtures_for_gameweek(3).await.unwrap();
        assert_eq!(rows[0].minutes, 70);
    }

    #[tokio::test]
    async fn transfer_baselines_written_once() {
        let store = MemoryStore::new();
        let row = ManagerTransferRow {
            manager_id: 5,
            gameweek_id: 2,
            player_in_id: 10,
            player_out_id: 20,
            price_in_tenths: 85,
            price_out_tenths: 60,
            net_price_change_tenths: 25,
            transfer_at: None,
            player_in_points_baseline: None,
            player_out_points_baseline: None,
            point_impact_baseline: None,
        };
        store.upsert_manager_transfer(&row).await.unwrap();
        store
            .set_transfer_baselines_if_unset(5, 2, 10, 20, 4, 1, 3)
            .await
            .unwrap();
        store
            .set_transfer_baselines_if_unset(5, 2, 10, 20, 9, 9, 0)
            .await
            .unwrap();
        // Re-upsert without baselines must not erase them.
        store.upsert_manager_transfer(&row).await.unwrap();
        let stored = store.get_manager_transfers(5, 2).await.unwrap();
        assert_eq!(stored[0].player_in_points_baseline, Some(4));
        assert_eq!(stored[0].point_impact_baseline, Some(3));
    }

    #[tokio::test]
    async fn bonus_status_only_moves_provisional_to_confirmed() {
        use crate::types::domain::{BonusStatus, PlayerGameweekStatsRow};
        let store = MemoryStore::new();
        let mut row = PlayerGameweekStatsRow {
            player_id: 4,
            gameweek_id: 6,
            fixture_id: Some(33),
            team_id: 1,
            opponent_team_id: Some(2),
            was_home: Some(false),
            kickoff_at: None,
            minutes: 90,
            total_points: 9,
            bps: 30,
            bonus: 2,
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
            home_score: Some(0),
            away_score: Some(2),
            match_finished: true,
            match_finished_provisional: true,
        };
        store.upsert_player_gameweek_stats(&[row.clone()]).await.unwrap();

        // A stale live write cannot demote a confirmed row.
        row.bonus = 0;
        row.bonus_status = BonusStatus::Provisional;
        store.upsert_player_gameweek_stats(&[row]).await.unwrap();
        let rows = store.get_player_stats_for_gameweek(6).await.unwrap();
        assert_eq!(rows[0].bonus_status, BonusStatus::Confirmed);
    }

    #[tokio::test]
    async fn gameweek_upsert_preserves_ranks_finalized() {
        let store = MemoryStore::new();
        let gw = GameweekRow {
            id: 7,
            name: "Gameweek 7".to_string(),
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
        };
        store.upsert_gameweek(&gw).await.unwrap();
        store.set_gameweek_ranks_finalized(7, true).await.unwrap();
        store.upsert_gameweek(&gw).await.unwrap();
        assert!(store.get_gameweek(7).await.unwrap().unwrap().ranks_finalized);
    }
}
