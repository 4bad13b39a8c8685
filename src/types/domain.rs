//! Store entity rows and domain enums.
//!
//! These are the shapes the [`crate::store::Store`] trait reads and writes.
//! All writes are idempotent upserts keyed on the natural key noted per row.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Player position, from bootstrap `element_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    Goalkeeper,
    Defender,
    Midfielder,
    Forward,
}

impl Position {
    pub fn from_element_type(element_type: i32) -> Option<Self> {
        match element_type {
            1 => Some(Position::Goalkeeper),
            2 => Some(Position::Defender),
            3 => Some(Position::Midfielder),
            4 => Some(Position::Forward),
            _ => None,
        }
    }

    pub fn element_type(self) -> i32 {
        match self {
            Position::Goalkeeper => 1,
            Position::Defender => 2,
            Position::Midfielder => 3,
            Position::Forward => 4,
        }
    }

    pub fn is_goalkeeper(self) -> bool {
        matches!(self, Position::Goalkeeper)
    }
}

/// One-time gameweek modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chip {
    TripleCaptain,
    BenchBoost,
    Wildcard,
    FreeHit,
}

impl Chip {
    pub fn from_api(name: &str) -> Option<Self> {
        match name {
            "3xc" => Some(Chip::TripleCaptain),
            "bboost" => Some(Chip::BenchBoost),
            "wildcard" => Some(Chip::Wildcard),
            "freehit" => Some(Chip::FreeHit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Chip::TripleCaptain => "3xc",
            Chip::BenchBoost => "bboost",
            Chip::Wildcard => "wildcard",
            Chip::FreeHit => "freehit",
        }
    }
}

/// Monotone lattice: `Provisional -> Confirmed` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BonusStatus {
    Provisional,
    Confirmed,
}

impl BonusStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BonusStatus::Provisional => "provisional",
            BonusStatus::Confirmed => "confirmed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "confirmed" => BonusStatus::Confirmed,
            _ => BonusStatus::Provisional,
        }
    }
}

/// Which orchestrator loop produced a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPath {
    Fast,
    Slow,
}

impl RefreshPath {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshPath::Fast => "fast",
            RefreshPath::Slow => "slow",
        }
    }
}

/// Normalize an upstream monetary quantity to integer tenths.
///
/// Upstream usually reports tenths (`1005` = 100.5) but occasionally whole
/// units as a float (`100.5`). Values under 200 are taken as whole units.
pub fn normalize_tenths(value: f64) -> Option<i32> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    if value < 200.0 {
        Some((value * 10.0).round() as i32)
    } else {
        Some(value.round() as i32)
    }
}

/// Gameweek row. Key: `id`. Lifecycle is upstream-driven.
#[derive(Debug, Clone, PartialEq)]
pub struct GameweekRow {
    pub id: i32,
    pub name: String,
    pub deadline_at: Option<DateTime<Utc>>,
    pub release_at: Option<DateTime<Utc>>,
    pub is_current: bool,
    pub is_previous: bool,
    pub is_next: bool,
    pub finished: bool,
    pub data_checked: bool,
    /// Set by the orchestrator once upstream ranks are observed final.
    pub ranks_finalized: bool,
    pub highest_score: Option<i32>,
    pub average_entry_score: Option<i32>,
}

/// Team row. Key: `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamRow {
    pub id: i64,
    pub name: String,
    pub short_name: String,
    pub strength: Option<i32>,
    pub strength_overall_home: Option<i32>,
    pub strength_overall_away: Option<i32>,
    pub strength_attack_home: Option<i32>,
    pub strength_attack_away: Option<i32>,
    pub strength_defence_home: Option<i32>,
    pub strength_defence_away: Option<i32>,
}

/// Player row. Key: `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRow {
    pub id: i64,
    pub team_id: i64,
    pub position: Position,
    pub web_name: String,
    pub cost_tenths: i32,
    pub selected_by_percent: f64,
}

/// Fixture row. Key: `id` (the FPL fixture id).
///
/// Invariants: `finished => finished_provisional`; `minutes` never decreases
/// once started (enforced by `update_fixture_scores`).
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureRow {
    pub id: i64,
    pub gameweek_id: Option<i32>,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub kickoff_at: Option<DateTime<Utc>>,
    pub started: bool,
    pub finished: bool,
    pub finished_provisional: bool,
    pub minutes: i32,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
}

impl FixtureRow {
    pub fn involves_team(&self, team_id: i64) -> bool {
        self.home_team_id == team_id || self.away_team_id == team_id
    }
}

/// Per-player, per-gameweek stats. Key: `(player_id, gameweek_id, fixture_id)`
/// so double gameweeks keep one row per fixture.
///
/// Invariants: `bonus > 0 => bonus_status = Confirmed`; expected/ICT stats are
/// static after the fixture finishes and must not be zeroed by live updates.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerGameweekStatsRow {
    pub player_id: i64,
    pub gameweek_id: i32,
    pub fixture_id: Option<i64>,
    pub team_id: i64,
    pub opponent_team_id: Option<i64>,
    pub was_home: Option<bool>,
    pub kickoff_at: Option<DateTime<Utc>>,
    pub minutes: i32,
    pub total_points: i32,
    pub bps: i32,
    pub bonus: i32,
    pub bonus_status: BonusStatus,
    /// Synthesized from BPS ranking while bonus is provisional.
    pub provisional_bonus: i32,
    pub goals: i32,
    pub assists: i32,
    pub own_goals: i32,
    pub penalties_saved: i32,
    pub penalties_missed: i32,
    pub saves: i32,
    pub clean_sheets: i32,
    pub goals_conceded: i32,
    pub yellow_cards: i32,
    pub red_cards: i32,
    pub defensive_contribution: i32,
    pub expected_goals: f64,
    pub expected_assists: f64,
    pub expected_goal_involvements: f64,
    pub expected_goals_conceded: f64,
    pub influence: f64,
    pub creativity: f64,
    pub threat: f64,
    pub ict_index: f64,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub match_finished: bool,
    pub match_finished_provisional: bool,
}

impl PlayerGameweekStatsRow {
    /// Points the calculator should use: upstream total plus synthesized
    /// bonus while the fixture is done but bonus is still provisional.
    /// Confirmed totals already include bonus.
    pub fn effective_points(&self) -> i32 {
        let fixture_done = self.match_finished || self.match_finished_provisional;
        if fixture_done && self.bonus_status == BonusStatus::Provisional && self.bonus == 0 {
            self.total_points + self.provisional_bonus
        } else {
            self.total_points
        }
    }
}

/// Manager profile row. Key: `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerRow {
    pub id: i64,
    pub name: String,
    pub team_name: String,
    pub favourite_team_id: Option<i64>,
    pub joined_at: Option<DateTime<Utc>>,
}

/// Squad pick. Key: `(manager_id, gameweek_id, position)`.
///
/// Immutable after the deadline except the three auto-sub flags, which are
/// derived and may be rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerPickRow {
    pub manager_id: i64,
    pub gameweek_id: i32,
    /// 1..11 starting XI, 12..15 bench priority order.
    pub position: i32,
    pub player_id: i64,
    pub is_captain: bool,
    pub is_vice_captain: bool,
    pub multiplier: i32,
    pub was_auto_subbed_in: bool,
    pub was_auto_subbed_out: bool,
    pub auto_sub_replaced_player_id: Option<i64>,
}

/// Transfer row. Key: `(manager_id, gameweek_id, player_in_id, player_out_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerTransferRow {
    pub manager_id: i64,
    pub gameweek_id: i32,
    pub player_in_id: i64,
    pub player_out_id: i64,
    pub price_in_tenths: i32,
    pub price_out_tenths: i32,
    pub net_price_change_tenths: i32,
    pub transfer_at: Option<DateTime<Utc>>,
    /// Captured once at gameweek-baseline time; never overwritten.
    pub player_in_points_baseline: Option<i32>,
    pub player_out_points_baseline: Option<i32>,
    pub point_impact_baseline: Option<i32>,
}

/// Per-manager, per-gameweek history. Key: `(manager_id, gameweek_id)`.
///
/// Baseline invariant: `baseline_total_points`, `previous_overall_rank` and
/// `previous_mini_league_rank` are written once at deadline and never
/// overwritten during live updates; while the baseline is set,
/// `total_points = baseline_total_points + gameweek_points`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ManagerGameweekHistoryRow {
    pub manager_id: i64,
    pub gameweek_id: i32,
    pub gameweek_points: i32,
    pub transfer_cost: i32,
    pub total_points: i32,
    pub overall_rank: Option<i64>,
    pub previous_overall_rank: Option<i64>,
    pub overall_rank_change: Option<i64>,
    pub gameweek_rank: Option<i64>,
    pub mini_league_rank: Option<i64>,
    pub previous_mini_league_rank: Option<i64>,
    pub mini_league_rank_change: Option<i64>,
    pub team_value_tenths: Option<i32>,
    pub bank_tenths: Option<i32>,
    pub active_chip: Option<String>,
    pub transfers_made: i32,
    pub baseline_total_points: Option<i32>,
}

/// One point in a player's price series. Key: `(player_id, recorded_date)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerPriceRow {
    pub player_id: i64,
    pub gameweek_id: i32,
    pub price_tenths: i32,
    pub price_change_tenths: i32,
    pub recorded_at: DateTime<Utc>,
    pub recorded_date: NaiveDate,
}

/// Tracked mini league. Key: `id`. Membership defines the cohort.
#[derive(Debug, Clone, PartialEq)]
pub struct MiniLeagueRow {
    pub id: i64,
    pub name: String,
}

/// Crash-safe record of a post-deadline batch. Key: `id` (assigned by store).
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlineBatchRun {
    pub id: i64,
    pub gameweek_id: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub manager_count: i32,
    pub league_count: i32,
    /// Per-phase timings and any `failure_reason`.
    pub phase_breakdown: serde_json::Value,
}

/// Per-matchday rank snapshot. Key: `(manager_id, gameweek_id, matchday_sequence)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchdayBaselineRow {
    pub manager_id: i64,
    pub gameweek_id: i32,
    pub matchday_sequence: i32,
    pub matchday_date: NaiveDate,
    pub first_kickoff_at: DateTime<Utc>,
    pub overall_rank_baseline: i64,
    pub gameweek_rank_baseline: Option<i64>,
    pub captured_at: DateTime<Utc>,
}

/// A matchday of a gameweek: one calendar day with kickoffs.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchdayInfo {
    /// 1-based, in kickoff-date order within the gameweek.
    pub matchday_sequence: i32,
    pub matchday_date: NaiveDate,
    pub first_kickoff_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenths_normalization_handles_floats_and_ints() {
        assert_eq!(normalize_tenths(100.5), Some(1005));
        assert_eq!(normalize_tenths(1005.0), Some(1005));
        assert_eq!(normalize_tenths(19.9), Some(199));
        assert_eq!(normalize_tenths(0.0), None);
        assert_eq!(normalize_tenths(-3.0), None);
    }

    #[test]
    fn effective_points_adds_provisional_bonus_only_once() {
        let mut row = PlayerGameweekStatsRow {
            player_id: 1,
            gameweek_id: 10,
            fixture_id: Some(50),
            team_id: 3,
            opponent_team_id: Some(4),
            was_home: Some(true),
            kickoff_at: None,
            minutes: 90,
            total_points: 8,
            bps: 35,
            bonus: 0,
            bonus_status: BonusStatus::Provisional,
            provisional_bonus: 3,
            goals: 1,
            assists: 0,
            own_goals: 0,
            penalties_saved: 0,
            penalties_missed: 0,
            saves: 0,
            clean_sheets: 1,
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
            home_score: Some(1),
            away_score: Some(0),
            match_finished: false,
            match_finished_provisional: true,
        };
        assert_eq!(row.effective_points(), 11);

        // Confirmed totals already include the bonus.
        row.bonus = 3;
        row.bonus_status = BonusStatus::Confirmed;
        row.total_points = 11;
        assert_eq!(row.effective_points(), 11);

        // In-progress fixture: no synthesized bonus yet.
        row.bonus = 0;
        row.bonus_status = BonusStatus::Provisional;
        row.total_points = 8;
        row.match_finished_provisional = false;
        assert_eq!(row.effective_points(), 8);
    }
}
