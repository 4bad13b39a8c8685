//! Persistence behind a trait.
//!
//! The orchestrator is the single writer for every entity here; readers (the
//! HTTP API, the UI) consume the same tables but never mutate them. All
//! writes are idempotent upserts on the entity's natural key, so a crashed
//! cycle can simply be re-run.
//!
//! `postgres` is the production implementation; `memory` is a complete
//! in-memory store so the refresh core is testable without a database.

use crate::types::domain::{
    DeadlineBatchRun, FixtureRow, GameweekRow, ManagerGameweekHistoryRow, ManagerPickRow,
    ManagerRow, ManagerTransferRow, MatchdayBaselineRow, PlayerGameweekStatsRow, PlayerPriceRow,
    PlayerRow, RefreshPath, TeamRow,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory store used by the test suite and local runs
pub mod memory;
/// Production Postgres store (sqlx)
pub mod postgres;

/// Shared handle used throughout the service.
pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    // Gameweeks and reference data

    /// Upsert a gameweek as upstream reports it. `ranks_finalized` is
    /// orchestrator-owned and is preserved, not overwritten, here.
    async fn upsert_gameweek(&self, row: &GameweekRow) -> Result<()>;
    async fn get_gameweek(&self, gameweek_id: i32) -> Result<Option<GameweekRow>>;
    async fn get_current_gameweek(&self) -> Result<Option<GameweekRow>>;
    async fn get_next_gameweek(&self) -> Result<Option<GameweekRow>>;
    async fn set_gameweek_ranks_finalized(&self, gameweek_id: i32, finalized: bool) -> Result<()>;
    /// Persist bootstrap `total_players` for rank percentile display.
    async fn upsert_total_players(&self, total_players: i64) -> Result<()>;
    async fn upsert_team(&self, row: &TeamRow) -> Result<()>;
    async fn upsert_player(&self, row: &PlayerRow) -> Result<()>;
    async fn get_players_by_ids(&self, player_ids: &[i64]) -> Result<HashMap<i64, PlayerRow>>;
    async fn get_player_ids_for_teams(&self, team_ids: &[i64]) -> Result<Vec<i64>>;

    // Fixtures

    async fn upsert_fixture(&self, row: &FixtureRow) -> Result<()>;
    async fn get_fixtures_for_gameweek(&self, gameweek_id: i32) -> Result<Vec<FixtureRow>>;
    /// Live scoreboard update. Minutes are clamped to never decrease; scores
    /// are written only when provided (both-or-neither is the caller's rule).
    async fn update_fixture_scores(
        &self,
        fpl_fixture_id: i64,
        home_score: Option<i32>,
        away_score: Option<i32>,
        minutes: Option<i32>,
    ) -> Result<()>;
    async fn get_first_kickoff_for_gameweek(
        &self,
        gameweek_id: i32,
    ) -> Result<Option<DateTime<Utc>>>;
    /// Earliest kickoff strictly after `after` in the gameweek.
    async fn get_next_kickoff_for_gameweek(
        &self,
        gameweek_id: i32,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    // Player gameweek stats

    async fn upsert_player_gameweek_stats(&self, rows: &[PlayerGameweekStatsRow]) -> Result<()>;
    async fn get_player_stats_for_gameweek(
        &self,
        gameweek_id: i32,
    ) -> Result<Vec<PlayerGameweekStatsRow>>;
    async fn get_player_stats_for_players(
        &self,
        gameweek_id: i32,
        player_ids: &[i64],
    ) -> Result<Vec<PlayerGameweekStatsRow>>;
    async fn get_player_ids_with_stats(&self, gameweek_id: i32) -> Result<Vec<i64>>;
    async fn has_provisional_bonus(&self, gameweek_id: i32) -> Result<bool>;
    /// Players in fully-finished fixtures whose bonus is settled (`bonus > 0`
    /// or status confirmed). Drives the "new bonuses confirmed" probe.
    async fn count_confirmed_bonus(&self, gameweek_id: i32) -> Result<i64>;

    // Prices

    async fn upsert_player_price(&self, row: &PlayerPriceRow) -> Result<()>;
    /// Most recent recorded price per player, across the whole series.
    async fn get_latest_player_prices(&self) -> Result<HashMap<i64, i32>>;
    async fn clear_price_change_predictions(&self) -> Result<()>;

    // Managers

    async fn upsert_manager(&self, row: &ManagerRow) -> Result<()>;
    async fn get_manager(&self, manager_id: i64) -> Result<Option<ManagerRow>>;
    async fn upsert_manager_picks(&self, rows: &[ManagerPickRow]) -> Result<()>;
    async fn get_manager_picks(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Vec<ManagerPickRow>>;
    async fn get_picks_for_managers(
        &self,
        gameweek_id: i32,
        manager_ids: &[i64],
    ) -> Result<Vec<ManagerPickRow>>;
    async fn upsert_manager_transfer(&self, row: &ManagerTransferRow) -> Result<()>;
    async fn get_manager_transfers(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Vec<ManagerTransferRow>>;
    /// Capture transfer point baselines once; rows that already have one keep it.
    async fn set_transfer_baselines_if_unset(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        player_in_id: i64,
        player_out_id: i64,
        player_in_points: i32,
        player_out_points: i32,
        point_impact: i32,
    ) -> Result<()>;

    // Manager gameweek history

    async fn upsert_manager_history(&self, row: &ManagerGameweekHistoryRow) -> Result<()>;
    async fn get_manager_history(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Option<ManagerGameweekHistoryRow>>;
    async fn get_history_for_managers(
        &self,
        gameweek_id: i32,
        manager_ids: &[i64],
    ) -> Result<Vec<ManagerGameweekHistoryRow>>;
    /// Live paths write only these two columns; baseline columns are never
    /// touched. No-op when the history row does not exist yet.
    async fn update_manager_history_points(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        gameweek_points: i32,
        total_points: i32,
    ) -> Result<()>;
    async fn update_manager_history_league_rank(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        mini_league_rank: i64,
        mini_league_rank_change: Option<i64>,
    ) -> Result<()>;
    /// Set baseline columns. Passing `None` leaves a column untouched, so a
    /// capture can never erase an existing baseline.
    async fn set_manager_history_baselines(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        baseline_total_points: Option<i32>,
        previous_overall_rank: Option<i64>,
        previous_mini_league_rank: Option<i64>,
    ) -> Result<()>;

    // Mini leagues and the tracked cohort

    async fn get_league_ids(&self) -> Result<Vec<i64>>;
    async fn get_league_member_ids(&self, league_id: i64) -> Result<Vec<i64>>;
    /// Distinct managers across every tracked league.
    async fn get_tracked_manager_ids(&self) -> Result<Vec<i64>>;
    async fn upsert_player_whitelist(
        &self,
        league_id: i64,
        gameweek_id: i32,
        player_ids: &[i64],
    ) -> Result<()>;

    // Matchday baselines

    async fn upsert_matchday_baselines(&self, rows: &[MatchdayBaselineRow]) -> Result<()>;
    async fn matchday_baseline_captured(
        &self,
        gameweek_id: i32,
        matchday_sequence: i32,
    ) -> Result<bool>;

    // Deadline batch bookkeeping

    async fn insert_deadline_batch_start(&self, gameweek_id: i32) -> Result<i64>;
    async fn update_deadline_batch_finish(
        &self,
        run_id: i64,
        finished_at: DateTime<Utc>,
        success: bool,
        manager_count: i32,
        league_count: i32,
        phase_breakdown: serde_json::Value,
    ) -> Result<()>;
    async fn has_successful_deadline_batch_for_gameweek(&self, gameweek_id: i32) -> Result<bool>;
    async fn get_deadline_batch_runs(&self, gameweek_id: i32) -> Result<Vec<DeadlineBatchRun>>;

    // Heartbeats and aggregates

    async fn insert_refresh_event(&self, path: RefreshPath) -> Result<()>;
    async fn refresh_all_materialized_views(&self) -> Result<()>;
    /// Subset of views the UI reads during live matches (skips the expensive
    /// aggregates).
    async fn refresh_materialized_views_for_live(&self) -> Result<()>;
}
