//! Postgres [`Store`] implementation.
//!
//! Raw sqlx queries with `ON CONFLICT` upserts on each entity's natural key.
//! The schema is expected to exist already (migrations are out of scope);
//! `connect` only establishes and pings the pool. Materialized-view
//! refreshes call the database-side functions of the same name.

use super::Store;
use crate::types::domain::{
    BonusStatus, DeadlineBatchRun, FixtureRow, GameweekRow, ManagerGameweekHistoryRow,
    ManagerPickRow, ManagerRow, ManagerTransferRow, MatchdayBaselineRow, PlayerGameweekStatsRow,
    PlayerPriceRow, PlayerRow, Position, RefreshPath, TeamRow,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::{info, warn};

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Connect using `DATABASE_URL`, retrying with capped exponential backoff to
/// survive DNS/startup races under process supervisors.
pub async fn connect() -> Result<DbPool> {
    let database_url =
        env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL must be set"))?;

    let max_attempts: u32 = 10;
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database_url)
            .await
        {
            Ok(pool) => {
                info!(attempt, "Connected to database");
                return Ok(pool);
            }
            Err(e) => last_err = Some(e.into()),
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200;
        warn!(attempt, max_attempts, delay_ms, "DB connect failed, retrying");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow!("unknown DB connection error")))
}

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn gameweek_from_row(row: &PgRow) -> Result<GameweekRow> {
    Ok(GameweekRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        deadline_at: row.try_get("deadline_at")?,
        release_at: row.try_get("release_at")?,
        is_current: row.try_get("is_current")?,
        is_previous: row.try_get("is_previous")?,
        is_next: row.try_get("is_next")?,
        finished: row.try_get("finished")?,
        data_checked: row.try_get("data_checked")?,
        ranks_finalized: row.try_get("ranks_finalized")?,
        highest_score: row.try_get("highest_score")?,
        average_entry_score: row.try_get("average_entry_score")?,
    })
}

fn fixture_from_row(row: &PgRow) -> Result<FixtureRow> {
    Ok(FixtureRow {
        id: row.try_get("id")?,
        gameweek_id: row.try_get("gameweek_id")?,
        home_team_id: row.try_get("home_team_id")?,
        away_team_id: row.try_get("away_team_id")?,
        kickoff_at: row.try_get("kickoff_at")?,
        started: row.try_get("started")?,
        finished: row.try_get("finished")?,
        finished_provisional: row.try_get("finished_provisional")?,
        minutes: row.try_get("minutes")?,
        home_score: row.try_get("home_score")?,
        away_score: row.try_get("away_score")?,
    })
}

fn stats_from_row(row: &PgRow) -> Result<PlayerGameweekStatsRow> {
    let fixture_id: i64 = row.try_get("fixture_id")?;
    let bonus_status: String = row.try_get("bonus_status")?;
    Ok(PlayerGameweekStatsRow {
        player_id: row.try_get("player_id")?,
        gameweek_id: row.try_get("gameweek_id")?,
        fixture_id: if fixture_id == 0 { None } else { Some(fixture_id) },
        team_id: row.try_get("team_id")?,
        opponent_team_id: row.try_get("opponent_team_id")?,
        was_home: row.try_get("was_home")?,
        kickoff_at: row.try_get("kickoff_at")?,
        minutes: row.try_get("minutes")?,
        total_points: row.try_get("total_points")?,
        bps: row.try_get("bps")?,
        bonus: row.try_get("bonus")?,
        bonus_status: BonusStatus::from_str(&bonus_status),
        provisional_bonus: row.try_get("provisional_bonus")?,
        goals: row.try_get("goals")?,
        assists: row.try_get("assists")?,
        own_goals: row.try_get("own_goals")?,
        penalties_saved: row.try_get("penalties_saved")?,
        penalties_missed: row.try_get("penalties_missed")?,
        saves: row.try_get("saves")?,
        clean_sheets: row.try_get("clean_sheets")?,
        goals_conceded: row.try_get("goals_conceded")?,
        yellow_cards: row.try_get("yellow_cards")?,
        red_cards: row.try_get("red_cards")?,
        defensive_contribution: row.try_get("defensive_contribution")?,
        expected_goals: row.try_get("expected_goals")?,
        expected_assists: row.try_get("expected_assists")?,
        expected_goal_involvements: row.try_get("expected_goal_involvements")?,
        expected_goals_conceded: row.try_get("expected_goals_conceded")?,
        influence: row.try_get("influence")?,
        creativity: row.try_get("creativity")?,
        threat: row.try_get("threat")?,
        ict_index: row.try_get("ict_index")?,
        home_score: row.try_get("home_score")?,
        away_score: row.try_get("away_score")?,
        match_finished: row.try_get("match_finished")?,
        match_finished_provisional: row.try_get("match_finished_provisional")?,
    })
}

fn pick_from_row(row: &PgRow) -> Result<ManagerPickRow> {
    Ok(ManagerPickRow {
        manager_id: row.try_get("manager_id")?,
        gameweek_id: row.try_get("gameweek_id")?,
        position: row.try_get("position")?,
        player_id: row.try_get("player_id")?,
        is_captain: row.try_get("is_captain")?,
        is_vice_captain: row.try_get("is_vice_captain")?,
        multiplier: row.try_get("multiplier")?,
        was_auto_subbed_in: row.try_get("was_auto_subbed_in")?,
        was_auto_subbed_out: row.try_get("was_auto_subbed_out")?,
        auto_sub_replaced_player_id: row.try_get("auto_sub_replaced_player_id")?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<ManagerTransferRow> {
    Ok(ManagerTransferRow {
        manager_id: row.try_get("manager_id")?,
        gameweek_id: row.try_get("gameweek_id")?,
        player_in_id: row.try_get("player_in_id")?,
        player_out_id: row.try_get("player_out_id")?,
        price_in_tenths: row.try_get("price_in_tenths")?,
        price_out_tenths: row.try_get("price_out_tenths")?,
        net_price_change_tenths: row.try_get("net_price_change_tenths")?,
        transfer_at: row.try_get("transfer_at")?,
        player_in_points_baseline: row.try_get("player_in_points_baseline")?,
        player_out_points_baseline: row.try_get("player_out_points_baseline")?,
        point_impact_baseline: row.try_get("point_impact_baseline")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<ManagerGameweekHistoryRow> {
    Ok(ManagerGameweekHistoryRow {
        manager_id: row.try_get("manager_id")?,
        gameweek_id: row.try_get("gameweek_id")?,
        gameweek_points: row.try_get("gameweek_points")?,
        transfer_cost: row.try_get("transfer_cost")?,
        total_points: row.try_get("total_points")?,
        overall_rank: row.try_get("overall_rank")?,
        previous_overall_rank: row.try_get("previous_overall_rank")?,
        overall_rank_change: row.try_get("overall_rank_change")?,
        gameweek_rank: row.try_get("gameweek_rank")?,
        mini_league_rank: row.try_get("mini_league_rank")?,
        previous_mini_league_rank: row.try_get("previous_mini_league_rank")?,
        mini_league_rank_change: row.try_get("mini_league_rank_change")?,
        team_value_tenths: row.try_get("team_value_tenths")?,
        bank_tenths: row.try_get("bank_tenths")?,
        active_chip: row.try_get("active_chip")?,
        transfers_made: row.try_get("transfers_made")?,
        baseline_total_points: row.try_get("baseline_total_points")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_gameweek(&self, row: &GameweekRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO gameweeks
                 (id, name, deadline_at, release_at, is_current, is_previous, is_next,
                  finished, data_checked, ranks_finalized, highest_score, average_entry_score,
                  updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10, $11, NOW())
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name,
                 deadline_at = EXCLUDED.deadline_at,
                 release_at = EXCLUDED.release_at,
                 is_current = EXCLUDED.is_current,
                 is_previous = EXCLUDED.is_previous,
                 is_next = EXCLUDED.is_next,
                 finished = EXCLUDED.finished,
                 data_checked = EXCLUDED.data_checked,
                 highest_score = EXCLUDED.highest_score,
                 average_entry_score = EXCLUDED.average_entry_score,
                 updated_at = NOW()",
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.deadline_at)
        .bind(row.release_at)
        .bind(row.is_current)
        .bind(row.is_previous)
        .bind(row.is_next)
        .bind(row.finished)
        .bind(row.data_checked)
        .bind(row.highest_score)
        .bind(row.average_entry_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_gameweek(&self, gameweek_id: i32) -> Result<Option<GameweekRow>> {
        let row = sqlx::query("SELECT * FROM gameweeks WHERE id = $1")
            .bind(gameweek_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(gameweek_from_row).transpose()
    }

    async fn get_current_gameweek(&self) -> Result<Option<GameweekRow>> {
        let row = sqlx::query("SELECT * FROM gameweeks WHERE is_current LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(gameweek_from_row).transpose()
    }

    async fn get_next_gameweek(&self) -> Result<Option<GameweekRow>> {
        let row = sqlx::query("SELECT * FROM gameweeks WHERE is_next LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(gameweek_from_row).transpose()
    }

    async fn set_gameweek_ranks_finalized(&self, gameweek_id: i32, finalized: bool) -> Result<()> {
        sqlx::query("UPDATE gameweeks SET ranks_finalized = $2, updated_at = NOW() WHERE id = $1")
            .bind(gameweek_id)
            .bind(finalized)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_total_players(&self, total_players: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO fpl_global (id, total_managers, updated_at)
             VALUES ('current_season', $1, NOW())
             ON CONFLICT (id) DO UPDATE SET
                 total_managers = EXCLUDED.total_managers, updated_at = NOW()",
        )
        .bind(total_players)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_team(&self, row: &TeamRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO teams
                 (id, name, short_name, strength, strength_overall_home, strength_overall_away,
                  strength_attack_home, strength_attack_away, strength_defence_home,
                  strength_defence_away, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name,
                 short_name = EXCLUDED.short_name,
                 strength = EXCLUDED.strength,
                 strength_overall_home = EXCLUDED.strength_overall_home,
                 strength_overall_away = EXCLUDED.strength_overall_away,
                 strength_attack_home = EXCLUDED.strength_attack_home,
                 strength_attack_away = EXCLUDED.strength_attack_away,
                 strength_defence_home = EXCLUDED.strength_defence_home,
                 strength_defence_away = EXCLUDED.strength_defence_away,
                 updated_at = NOW()",
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.short_name)
        .bind(row.strength)
        .bind(row.strength_overall_home)
        .bind(row.strength_overall_away)
        .bind(row.strength_attack_home)
        .bind(row.strength_attack_away)
        .bind(row.strength_defence_home)
        .bind(row.strength_defence_away)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_player(&self, row: &PlayerRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO players
                 (id, team_id, position, web_name, cost_tenths, selected_by_percent, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, NOW())
             ON CONFLICT (id) DO UPDATE SET
                 team_id = EXCLUDED.team_id,
                 position = EXCLUDED.position,
                 web_name = EXCLUDED.web_name,
                 cost_tenths = EXCLUDED.cost_tenths,
                 selected_by_percent = EXCLUDED.selected_by_percent,
                 updated_at = NOW()",
        )
        .bind(row.id)
        .bind(row.team_id)
        .bind(row.position.element_type())
        .bind(&row.web_name)
        .bind(row.cost_tenths)
        .bind(row.selected_by_percent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_players_by_ids(&self, player_ids: &[i64]) -> Result<HashMap<i64, PlayerRow>> {
        if player_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT id, team_id, position, web_name, cost_tenths, selected_by_percent
             FROM players WHERE id = ANY($1)",
        )
        .bind(player_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let position: i32 = row.try_get("position")?;
            let player = PlayerRow {
                id: row.try_get("id")?,
                team_id: row.try_get("team_id")?,
                position: Position::from_element_type(position)
                    .unwrap_or(Position::Midfielder),
                web_name: row.try_get("web_name")?,
                cost_tenths: row.try_get("cost_tenths")?,
                selected_by_percent: row.try_get("selected_by_percent")?,
            };
            out.insert(player.id, player);
        }
        Ok(out)
    }

    async fn get_player_ids_for_teams(&self, team_ids: &[i64]) -> Result<Vec<i64>> {
        if team_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT id FROM players WHERE team_id = ANY($1)")
            .bind(team_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }

    async fn upsert_fixture(&self, row: &FixtureRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO fixtures
                 (id, gameweek_id, home_team_id, away_team_id, kickoff_at, started, finished,
                  finished_provisional, minutes, home_score, away_score, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
             ON CONFLICT (id) DO UPDATE SET
                 gameweek_id = EXCLUDED.gameweek_id,
                 home_team_id = EXCLUDED.home_team_id,
                 away_team_id = EXCLUDED.away_team_id,
                 kickoff_at = EXCLUDED.kickoff_at,
                 started = EXCLUDED.started,
                 finished = EXCLUDED.finished,
                 finished_provisional = EXCLUDED.finished_provisional,
                 minutes = GREATEST(fixtures.minutes, EXCLUDED.minutes),
                 home_score = EXCLUDED.home_score,
                 away_score = EXCLUDED.away_score,
                 updated_at = NOW()",
        )
        .bind(row.id)
        .bind(row.gameweek_id)
        .bind(row.home_team_id)
        .bind(row.away_team_id)
        .bind(row.kickoff_at)
        .bind(row.started)
        .bind(row.finished)
        .bind(row.finished_provisional)
        .bind(row.minutes)
        .bind(row.home_score)
        .bind(row.away_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_fixtures_for_gameweek(&self, gameweek_id: i32) -> Result<Vec<FixtureRow>> {
        let rows = sqlx::query(
            "SELECT * FROM fixtures WHERE gameweek_id = $1 ORDER BY kickoff_at NULLS LAST, id",
        )
        .bind(gameweek_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fixture_from_row).collect()
    }

    async fn update_fixture_scores(
        &self,
        fpl_fixture_id: i64,
        home_score: Option<i32>,
        away_score: Option<i32>,
        minutes: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE fixtures SET
                 home_score = COALESCE($2, home_score),
                 away_score = COALESCE($3, away_score),
                 minutes = GREATEST(minutes, COALESCE($4, minutes)),
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(fpl_fixture_id)
        .bind(home_score)
        .bind(away_score)
        .bind(minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_first_kickoff_for_gameweek(
        &self,
        gameweek_id: i32,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(kickoff_at) AS first_kickoff FROM fixtures WHERE gameweek_id = $1",
        )
        .bind(gameweek_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("first_kickoff")?)
    }

    async fn get_next_kickoff_for_gameweek(
        &self,
        gameweek_id: i32,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(kickoff_at) AS next_kickoff
             FROM fixtures WHERE gameweek_id = $1 AND kickoff_at > $2",
        )
        .bind(gameweek_id)
        .bind(after)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("next_kickoff")?)
    }

    async fn upsert_player_gameweek_stats(&self, rows: &[PlayerGameweekStatsRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                "INSERT INTO player_gameweek_stats
                     (player_id, gameweek_id, fixture_id, team_id, opponent_team_id, was_home,
                      kickoff_at, minutes, total_points, bps, bonus, bonus_status,
                      provisional_bonus, goals, assists, own_goals, penalties_saved,
                      penalties_missed, saves, clean_sheets, goals_conceded, yellow_cards,
                      red_cards, defensive_contribution, expected_goals, expected_assists,
                      expected_goal_involvements, expected_goals_conceded, influence, creativity,
                      threat, ict_index, home_score, away_score, match_finished,
                      match_finished_provisional, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                         $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
                         $31, $32, $33, $34, $35, $36, NOW())
                 ON CONFLICT (player_id, gameweek_id, fixture_id) DO UPDATE SET
                     team_id = EXCLUDED.team_id,
                     opponent_team_id = EXCLUDED.opponent_team_id,
                     was_home = EXCLUDED.was_home,
                     kickoff_at = EXCLUDED.kickoff_at,
                     minutes = EXCLUDED.minutes,
                     total_points = EXCLUDED.total_points,
                     bps = EXCLUDED.bps,
                     bonus = EXCLUDED.bonus,
                     bonus_status = CASE
                         WHEN player_gameweek_stats.bonus_status = 'confirmed' THEN 'confirmed'
                         ELSE EXCLUDED.bonus_status
                     END,
                     provisional_bonus = EXCLUDED.provisional_bonus,
                     goals = EXCLUDED.goals,
                     assists = EXCLUDED.assists,
                     own_goals = EXCLUDED.own_goals,
                     penalties_saved = EXCLUDED.penalties_saved,
                     penalties_missed = EXCLUDED.penalties_missed,
                     saves = EXCLUDED.saves,
                     clean_sheets = EXCLUDED.clean_sheets,
                     goals_conceded = EXCLUDED.goals_conceded,
                     yellow_cards = EXCLUDED.yellow_cards,
                     red_cards = EXCLUDED.red_cards,
                     defensive_contribution = EXCLUDED.defensive_contribution,
                     expected_goals = EXCLUDED.expected_goals,
                     expected_assists = EXCLUDED.expected_assists,
                     expected_goal_involvements = EXCLUDED.expected_goal_involvements,
                     expected_goals_conceded = EXCLUDED.expected_goals_conceded,
                     influence = EXCLUDED.influence,
                     creativity = EXCLUDED.creativity,
                     threat = EXCLUDED.threat,
                     ict_index = EXCLUDED.ict_index,
                     home_score = EXCLUDED.home_score,
                     away_score = EXCLUDED.away_score,
                     match_finished = EXCLUDED.match_finished,
                     match_finished_provisional = EXCLUDED.match_finished_provisional,
                     updated_at = NOW()",
            )
            .bind(row.player_id)
            .bind(row.gameweek_id)
            .bind(row.fixture_id.unwrap_or(0))
            .bind(row.team_id)
            .bind(row.opponent_team_id)
            .bind(row.was_home)
            .bind(row.kickoff_at)
            .bind(row.minutes)
            .bind(row.total_points)
            .bind(row.bps)
            .bind(row.bonus)
            .bind(row.bonus_status.as_str())
            .bind(row.provisional_bonus)
            .bind(row.goals)
            .bind(row.assists)
            .bind(row.own_goals)
            .bind(row.penalties_saved)
            .bind(row.penalties_missed)
            .bind(row.saves)
            .bind(row.clean_sheets)
            .bind(row.goals_conceded)
            .bind(row.yellow_cards)
            .bind(row.red_cards)
            .bind(row.defensive_contribution)
            .bind(row.expected_goals)
            .bind(row.expected_assists)
            .bind(row.expected_goal_involvements)
            .bind(row.expected_goals_conceded)
            .bind(row.influence)
            .bind(row.creativity)
            .bind(row.threat)
            .bind(row.ict_index)
            .bind(row.home_score)
            .bind(row.away_score)
            .bind(row.match_finished)
            .bind(row.match_finished_provisional)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn get_player_stats_for_gameweek(
        &self,
        gameweek_id: i32,
    ) -> Result<Vec<PlayerGameweekStatsRow>> {
        let rows = sqlx::query("SELECT * FROM player_gameweek_stats WHERE gameweek_id = $1")
            .bind(gameweek_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(stats_from_row).collect()
    }

    async fn get_player_stats_for_players(
        &self,
        gameweek_id: i32,
        player_ids: &[i64],
    ) -> Result<Vec<PlayerGameweekStatsRow>> {
        if player_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM player_gameweek_stats
             WHERE gameweek_id = $1 AND player_id = ANY($2)",
        )
        .bind(gameweek_id)
        .bind(player_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(stats_from_row).collect()
    }

    async fn get_player_ids_with_stats(&self, gameweek_id: i32) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT player_id FROM player_gameweek_stats WHERE gameweek_id = $1",
        )
        .bind(gameweek_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("player_id").map_err(Into::into))
            .collect()
    }

    async fn has_provisional_bonus(&self, gameweek_id: i32) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(
                 SELECT 1 FROM player_gameweek_stats
                 WHERE gameweek_id = $1 AND bonus_status = 'provisional'
             ) AS any_provisional",
        )
        .bind(gameweek_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("any_provisional")?)
    }

    async fn count_confirmed_bonus(&self, gameweek_id: i32) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS confirmed FROM player_gameweek_stats
             WHERE gameweek_id = $1 AND match_finished
               AND (bonus > 0 OR bonus_status = 'confirmed')",
        )
        .bind(gameweek_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("confirmed")?)
    }

    async fn upsert_player_price(&self, row: &PlayerPriceRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO player_prices
                 (player_id, gameweek_id, price_tenths, price_change_tenths, recorded_at,
                  recorded_date)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (player_id, recorded_date) DO UPDATE SET
                 gameweek_id = EXCLUDED.gameweek_id,
                 price_tenths = EXCLUDED.price_tenths,
                 price_change_tenths = EXCLUDED.price_change_tenths,
                 recorded_at = EXCLUDED.recorded_at",
        )
        .bind(row.player_id)
        .bind(row.gameweek_id)
        .bind(row.price_tenths)
        .bind(row.price_change_tenths)
        .bind(row.recorded_at)
        .bind(row.recorded_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_latest_player_prices(&self) -> Result<HashMap<i64, i32>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (player_id) player_id, price_tenths
             FROM player_prices ORDER BY player_id, recorded_date DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            out.insert(
                row.try_get::<i64, _>("player_id")?,
                row.try_get::<i32, _>("price_tenths")?,
            );
        }
        Ok(out)
    }

    async fn clear_price_change_predictions(&self) -> Result<()> {
        sqlx::query("DELETE FROM price_change_predictions")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_manager(&self, row: &ManagerRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO managers (id, name, team_name, favourite_team_id, joined_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name,
                 team_name = EXCLUDED.team_name,
                 favourite_team_id = EXCLUDED.favourite_team_id,
                 joined_at = EXCLUDED.joined_at,
                 updated_at = NOW()",
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.team_name)
        .bind(row.favourite_team_id)
        .bind(row.joined_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_manager(&self, manager_id: i64) -> Result<Option<ManagerRow>> {
        let row = sqlx::query(
            "SELECT id, name, team_name, favourite_team_id, joined_at FROM managers WHERE id = $1",
        )
        .bind(manager_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(ManagerRow {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                team_name: r.try_get("team_name")?,
                favourite_team_id: r.try_get("favourite_team_id")?,
                joined_at: r.try_get("joined_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_manager_picks(&self, rows: &[ManagerPickRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                "INSERT INTO manager_picks
                     (manager_id, gameweek_id, position, player_id, is_captain, is_vice_captain,
                      multiplier, was_auto_subbed_in, was_auto_subbed_out,
                      auto_sub_replaced_player_id, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
                 ON CONFLICT (manager_id, gameweek_id, position) DO UPDATE SET
                     player_id = EXCLUDED.player_id,
                     is_captain = EXCLUDED.is_captain,
                     is_vice_captain = EXCLUDED.is_vice_captain,
                     multiplier = EXCLUDED.multiplier,
                     was_auto_subbed_in = EXCLUDED.was_auto_subbed_in,
                     was_auto_subbed_out = EXCLUDED.was_auto_subbed_out,
                     auto_sub_replaced_player_id = EXCLUDED.auto_sub_replaced_player_id,
                     updated_at = NOW()",
            )
            .bind(row.manager_id)
            .bind(row.gameweek_id)
            .bind(row.position)
            .bind(row.player_id)
            .bind(row.is_captain)
            .bind(row.is_vice_captain)
            .bind(row.multiplier)
            .bind(row.was_auto_subbed_in)
            .bind(row.was_auto_subbed_out)
            .bind(row.auto_sub_replaced_player_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn get_manager_picks(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Vec<ManagerPickRow>> {
        let rows = sqlx::query(
            "SELECT * FROM manager_picks
             WHERE manager_id = $1 AND gameweek_id = $2 ORDER BY position",
        )
        .bind(manager_id)
        .bind(gameweek_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pick_from_row).collect()
    }

    async fn get_picks_for_managers(
        &self,
        gameweek_id: i32,
        manager_ids: &[i64],
    ) -> Result<Vec<ManagerPickRow>> {
        if manager_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM manager_picks
             WHERE gameweek_id = $1 AND manager_id = ANY($2)
             ORDER BY manager_id, position",
        )
        .bind(gameweek_id)
        .bind(manager_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pick_from_row).collect()
    }

    async fn upsert_manager_transfer(&self, row: &ManagerTransferRow) -> Result<()> {
        // Point baselines are captured separately and survive re-upserts.
        sqlx::query(
            "INSERT INTO manager_transfers
                 (manager_id, gameweek_id, player_in_id, player_out_id, price_in_tenths,
                  price_out_tenths, net_price_change_tenths, transfer_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
             ON CONFLICT (manager_id, gameweek_id, player_in_id, player_out_id) DO UPDATE SET
                 price_in_tenths = EXCLUDED.price_in_tenths,
                 price_out_tenths = EXCLUDED.price_out_tenths,
                 net_price_change_tenths = EXCLUDED.net_price_change_tenths,
                 transfer_at = EXCLUDED.transfer_at,
                 updated_at = NOW()",
        )
        .bind(row.manager_id)
        .bind(row.gameweek_id)
        .bind(row.player_in_id)
        .bind(row.player_out_id)
        .bind(row.price_in_tenths)
        .bind(row.price_out_tenths)
        .bind(row.net_price_change_tenths)
        .bind(row.transfer_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_manager_transfers(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Vec<ManagerTransferRow>> {
        let rows = sqlx::query(
            "SELECT * FROM manager_transfers WHERE manager_id = $1 AND gameweek_id = $2",
        )
        .bind(manager_id)
        .bind(gameweek_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transfer_from_row).collect()
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
        sqlx::query(
            "UPDATE manager_transfers SET
                 player_in_points_baseline = $5,
                 player_out_points_baseline = $6,
                 point_impact_baseline = $7
             WHERE manager_id = $1 AND gameweek_id = $2
               AND player_in_id = $3 AND player_out_id = $4
               AND player_in_points_baseline IS NULL",
        )
        .bind(manager_id)
        .bind(gameweek_id)
        .bind(player_in_id)
        .bind(player_out_id)
        .bind(player_in_points)
        .bind(player_out_points)
        .bind(point_impact)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_manager_history(&self, row: &ManagerGameweekHistoryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO manager_gameweek_history
                 (manager_id, gameweek_id, gameweek_points, transfer_cost, total_points,
                  overall_rank, previous_overall_rank, overall_rank_change, gameweek_rank,
                  mini_league_rank, previous_mini_league_rank, mini_league_rank_change,
                  team_value_tenths, bank_tenths, active_chip, transfers_made,
                  baseline_total_points, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                     NOW())
             ON CONFLICT (manager_id, gameweek_id) DO UPDATE SET
                 gameweek_points = EXCLUDED.gameweek_points,
                 transfer_cost = EXCLUDED.transfer_cost,
                 total_points = EXCLUDED.total_points,
                 overall_rank = EXCLUDED.overall_rank,
                 previous_overall_rank = EXCLUDED.previous_overall_rank,
                 overall_rank_change = EXCLUDED.overall_rank_change,
                 gameweek_rank = EXCLUDED.gameweek_rank,
                 mini_league_rank = EXCLUDED.mini_league_rank,
                 previous_mini_league_rank = EXCLUDED.previous_mini_league_rank,
                 mini_league_rank_change = EXCLUDED.mini_league_rank_change,
                 team_value_tenths = EXCLUDED.team_value_tenths,
                 bank_tenths = EXCLUDED.bank_tenths,
                 active_chip = EXCLUDED.active_chip,
                 transfers_made = EXCLUDED.transfers_made,
                 baseline_total_points = EXCLUDED.baseline_total_points,
                 updated_at = NOW()",
        )
        .bind(row.manager_id)
        .bind(row.gameweek_id)
        .bind(row.gameweek_points)
        .bind(row.transfer_cost)
        .bind(row.total_points)
        .bind(row.overall_rank)
        .bind(row.previous_overall_rank)
        .bind(row.overall_rank_change)
        .bind(row.gameweek_rank)
        .bind(row.mini_league_rank)
        .bind(row.previous_mini_league_rank)
        .bind(row.mini_league_rank_change)
        .bind(row.team_value_tenths)
        .bind(row.bank_tenths)
        .bind(&row.active_chip)
        .bind(row.transfers_made)
        .bind(row.baseline_total_points)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_manager_history(
        &self,
        manager_id: i64,
        gameweek_id: i32,
    ) -> Result<Option<ManagerGameweekHistoryRow>> {
        let row = sqlx::query(
            "SELECT * FROM manager_gameweek_history WHERE manager_id = $1 AND gameweek_id = $2",
        )
        .bind(manager_id)
        .bind(gameweek_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(history_from_row).transpose()
    }

    async fn get_history_for_managers(
        &self,
        gameweek_id: i32,
        manager_ids: &[i64],
    ) -> Result<Vec<ManagerGameweekHistoryRow>> {
        if manager_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM manager_gameweek_history
             WHERE gameweek_id = $1 AND manager_id = ANY($2)",
        )
        .bind(gameweek_id)
        .bind(manager_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn update_manager_history_points(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        gameweek_points: i32,
        total_points: i32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE manager_gameweek_history SET
                 gameweek_points = $3, total_points = $4, updated_at = NOW()
             WHERE manager_id = $1 AND gameweek_id = $2",
        )
        .bind(manager_id)
        .bind(gameweek_id)
        .bind(gameweek_points)
        .bind(total_points)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_manager_history_league_rank(
        &self,
        manager_id: i64,
        gameweek_id: i32,
        mini_league_rank: i64,
        mini_league_rank_change: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE manager_gameweek_history SET
                 mini_league_rank = $3, mini_league_rank_change = $4, updated_at = NOW()
             WHERE manager_id = $1 AND gameweek_id = $2",
        )
        .bind(manager_id)
        .bind(gameweek_id)
        .bind(mini_league_rank)
        .bind(mini_league_rank_change)
        .execute(&self.pool)
        .await?;
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
        sqlx::query(
            "UPDATE manager_gameweek_history SET
                 baseline_total_points = COALESCE($3, baseline_total_points),
                 previous_overall_rank = COALESCE($4, previous_overall_rank),
                 previous_mini_league_rank = COALESCE($5, previous_mini_league_rank),
                 updated_at = NOW()
             WHERE manager_id = $1 AND gameweek_id = $2",
        )
        .bind(manager_id)
        .bind(gameweek_id)
        .bind(baseline_total_points)
        .bind(previous_overall_rank)
        .bind(previous_mini_league_rank)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_league_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM mini_leagues ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }

    async fn get_league_member_ids(&self, league_id: i64) -> Result<Vec<i64>> {
        let rows =
            sqlx::query("SELECT manager_id FROM mini_league_managers WHERE league_id = $1")
                .bind(league_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("manager_id").map_err(Into::into))
            .collect()
    }

    async fn get_tracked_manager_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT manager_id FROM mini_league_managers ORDER BY manager_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("manager_id").map_err(Into::into))
            .collect()
    }

    async fn upsert_player_whitelist(
        &self,
        league_id: i64,
        gameweek_id: i32,
        player_ids: &[i64],
    ) -> Result<()> {
        for player_id in player_ids {
            sqlx::query(
                "INSERT INTO player_whitelist (league_id, gameweek_id, player_id)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (league_id, gameweek_id, player_id) DO NOTHING",
            )
            .bind(league_id)
            .bind(gameweek_id)
            .bind(player_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn upsert_matchday_baselines(&self, rows: &[MatchdayBaselineRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                "INSERT INTO manager_gameweek_matchday_baselines
                     (manager_id, gameweek_id, matchday_sequence, matchday_date,
                      first_kickoff_at, overall_rank_baseline, gameweek_rank_baseline,
                      captured_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (manager_id, gameweek_id, matchday_sequence) DO NOTHING",
            )
            .bind(row.manager_id)
            .bind(row.gameweek_id)
            .bind(row.matchday_sequence)
            .bind(row.matchday_date)
            .bind(row.first_kickoff_at)
            .bind(row.overall_rank_baseline)
            .bind(row.gameweek_rank_baseline)
            .bind(row.captured_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn matchday_baseline_captured(
        &self,
        gameweek_id: i32,
        matchday_sequence: i32,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(
                 SELECT 1 FROM manager_gameweek_matchday_baselines
                 WHERE gameweek_id = $1 AND matchday_sequence = $2
             ) AS captured",
        )
        .bind(gameweek_id)
        .bind(matchday_sequence)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("captured")?)
    }

    async fn insert_deadline_batch_start(&self, gameweek_id: i32) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO deadline_batch_runs (gameweek_id, started_at) VALUES ($1, NOW())
             RETURNING id",
        )
        .bind(gameweek_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
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
        sqlx::query(
            "UPDATE deadline_batch_runs SET
                 finished_at = $2, success = $3, manager_count = $4, league_count = $5,
                 phase_breakdown = $6
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(finished_at)
        .bind(success)
        .bind(manager_count)
        .bind(league_count)
        .bind(phase_breakdown.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_successful_deadline_batch_for_gameweek(&self, gameweek_id: i32) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(
                 SELECT 1 FROM deadline_batch_runs WHERE gameweek_id = $1 AND success
             ) AS succeeded",
        )
        .bind(gameweek_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("succeeded")?)
    }

    async fn get_deadline_batch_runs(&self, gameweek_id: i32) -> Result<Vec<DeadlineBatchRun>> {
        let rows = sqlx::query(
            "SELECT id, gameweek_id, started_at, finished_at, success, manager_count,
                    league_count, phase_breakdown
             FROM deadline_batch_runs WHERE gameweek_id = $1 ORDER BY started_at",
        )
        .bind(gameweek_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let breakdown: Option<String> = r.try_get("phase_breakdown")?;
                Ok(DeadlineBatchRun {
                    id: r.try_get("id")?,
                    gameweek_id: r.try_get("gameweek_id")?,
                    started_at: r.try_get("started_at")?,
                    finished_at: r.try_get("finished_at")?,
                    success: r.try_get("success")?,
                    manager_count: r.try_get::<Option<i32>, _>("manager_count")?.unwrap_or(0),
                    league_count: r.try_get::<Option<i32>, _>("league_count")?.unwrap_or(0),
                    phase_breakdown: breakdown
                        .and_then(|b| serde_json::from_str(&b).ok())
                        .unwrap_or_else(|| serde_json::json!({})),
                })
            })
            .collect()
    }

    async fn insert_refresh_event(&self, path: RefreshPath) -> Result<()> {
        sqlx::query("INSERT INTO refresh_events (occurred_at, path) VALUES (NOW(), $1)")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn refresh_all_materialized_views(&self) -> Result<()> {
        sqlx::query("SELECT refresh_all_materialized_views()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn refresh_materialized_views_for_live(&self) -> Result<()> {
        sqlx::query("SELECT refresh_materialized_views_for_live()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
