//! Typed FPL API payloads.
//!
//! Each struct carries only the fields the service reads; unknown fields are
//! ignored on deserialization. Several numeric stats (expected goals, ICT)
//! arrive as JSON strings and are decoded through [`de_stat_f64`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// Decode a stat that upstream serializes either as a number or as a string
/// (e.g. `"0.05"`). Missing and malformed values decode to `0.0`.
pub fn de_stat_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
        None(Option<()>),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n,
        Raw::Text(s) => s.trim().parse().unwrap_or(0.0),
        Raw::None(_) => 0.0,
    })
}

/// `/bootstrap-static/` — the reference snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub teams: Vec<ApiTeam>,
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub total_players: Option<i64>,
}

impl Bootstrap {
    pub fn elements_by_id(&self) -> HashMap<i64, &Element> {
        self.elements.iter().map(|e| (e.id, e)).collect()
    }

    pub fn current_event(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.is_current)
    }

    pub fn next_event(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.is_next)
    }
}

/// A gameweek as upstream reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub deadline_time: Option<DateTime<Utc>>,
    /// When FPL releases the gameweek (new GW goes live); used post-deadline.
    #[serde(default)]
    pub release_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_current: bool,
    #[serde(default)]
    pub is_previous: bool,
    #[serde(default)]
    pub is_next: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub data_checked: bool,
    #[serde(default)]
    pub highest_score: Option<i32>,
    #[serde(default)]
    pub average_entry_score: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTeam {
    pub id: i64,
    pub name: String,
    pub short_name: String,
    #[serde(default)]
    pub strength: Option<i32>,
    #[serde(default)]
    pub strength_overall_home: Option<i32>,
    #[serde(default)]
    pub strength_overall_away: Option<i32>,
    #[serde(default)]
    pub strength_attack_home: Option<i32>,
    #[serde(default)]
    pub strength_attack_away: Option<i32>,
    #[serde(default)]
    pub strength_defence_home: Option<i32>,
    #[serde(default)]
    pub strength_defence_away: Option<i32>,
}

/// A player ("element") from bootstrap.
#[derive(Debug, Clone, Deserialize)]
pub struct Element {
    pub id: i64,
    pub team: i64,
    /// 1=GK, 2=DEF, 3=MID, 4=FWD.
    pub element_type: i32,
    pub web_name: String,
    /// Price in tenths of a million.
    #[serde(default)]
    pub now_cost: i32,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub selected_by_percent: f64,
}

/// `/fixtures/` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiFixture {
    pub id: i64,
    /// Gameweek id; null for unscheduled fixtures.
    #[serde(default)]
    pub event: Option<i32>,
    pub team_h: i64,
    pub team_a: i64,
    #[serde(default)]
    pub team_h_score: Option<i32>,
    #[serde(default)]
    pub team_a_score: Option<i32>,
    #[serde(default)]
    pub kickoff_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started: Option<bool>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub finished_provisional: bool,
    #[serde(default)]
    pub minutes: i32,
}

impl ApiFixture {
    /// In progress: at or past scheduled kickoff and not provisionally
    /// finished. Kickoff time is used so live is detected at the minute of
    /// kickoff even before upstream flips `started`.
    pub fn in_progress(&self, now: DateTime<Utc>) -> bool {
        if self.finished_provisional {
            return false;
        }
        if self.started.unwrap_or(false) {
            return true;
        }
        matches!(self.kickoff_time, Some(k) if now >= k)
    }
}

/// `/event/{gw}/live` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct EventLive {
    #[serde(default)]
    pub elements: Vec<LiveElement>,
}

impl EventLive {
    pub fn elements_by_id(&self) -> HashMap<i64, &LiveElement> {
        self.elements.iter().map(|e| (e.id, e)).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveElement {
    pub id: i64,
    #[serde(default)]
    pub stats: LiveStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveStats {
    #[serde(default)]
    pub minutes: i32,
    #[serde(default)]
    pub total_points: i32,
    #[serde(default)]
    pub bonus: i32,
    #[serde(default)]
    pub bps: i32,
    #[serde(default)]
    pub goals_scored: i32,
    #[serde(default)]
    pub assists: i32,
    #[serde(default)]
    pub own_goals: i32,
    #[serde(default)]
    pub penalties_saved: i32,
    #[serde(default)]
    pub penalties_missed: i32,
    #[serde(default)]
    pub saves: i32,
    #[serde(default)]
    pub clean_sheets: i32,
    #[serde(default)]
    pub goals_conceded: i32,
    #[serde(default)]
    pub yellow_cards: i32,
    #[serde(default)]
    pub red_cards: i32,
    #[serde(default)]
    pub tackles: i32,
    #[serde(default)]
    pub clearances_blocks_interceptions: i32,
    #[serde(default)]
    pub recoveries: i32,
    #[serde(default)]
    pub defensive_contribution: i32,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub expected_goals: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub expected_assists: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub expected_goal_involvements: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub expected_goals_conceded: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub influence: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub creativity: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub threat: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub ict_index: f64,
}

/// `/element-summary/{player_id}/` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementSummary {
    #[serde(default)]
    pub history: Vec<SummaryHistory>,
}

/// One per fixture the player appeared in; `round` is the gameweek.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryHistory {
    pub element: i64,
    pub round: i32,
    pub fixture: i64,
    #[serde(default)]
    pub opponent_team: Option<i64>,
    #[serde(default)]
    pub was_home: Option<bool>,
    #[serde(default)]
    pub kickoff_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub team_h_score: Option<i32>,
    #[serde(default)]
    pub team_a_score: Option<i32>,
    #[serde(default)]
    pub minutes: i32,
    #[serde(default)]
    pub total_points: i32,
    #[serde(default)]
    pub bonus: i32,
    #[serde(default)]
    pub bps: i32,
    #[serde(default)]
    pub goals_scored: i32,
    #[serde(default)]
    pub assists: i32,
    #[serde(default)]
    pub own_goals: i32,
    #[serde(default)]
    pub penalties_saved: i32,
    #[serde(default)]
    pub penalties_missed: i32,
    #[serde(default)]
    pub saves: i32,
    #[serde(default)]
    pub clean_sheets: i32,
    #[serde(default)]
    pub goals_conceded: i32,
    #[serde(default)]
    pub yellow_cards: i32,
    #[serde(default)]
    pub red_cards: i32,
    #[serde(default)]
    pub tackles: i32,
    #[serde(default)]
    pub clearances_blocks_interceptions: i32,
    #[serde(default)]
    pub recoveries: i32,
    #[serde(default)]
    pub defensive_contribution: i32,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub expected_goals: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub expected_assists: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub expected_goal_involvements: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub expected_goals_conceded: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub influence: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub creativity: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub threat: f64,
    #[serde(default, deserialize_with = "de_stat_f64")]
    pub ict_index: f64,
}

/// `/entry/{manager_id}/` — manager profile.
#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub player_first_name: Option<String>,
    #[serde(default)]
    pub player_last_name: Option<String>,
    #[serde(default)]
    pub favourite_team: Option<i64>,
    #[serde(default)]
    pub joined_time: Option<DateTime<Utc>>,
    /// Squad value at last deadline; tenths, but occasionally a float in
    /// whole millions — normalize with [`crate::types::domain::normalize_tenths`].
    #[serde(default)]
    pub last_deadline_value: Option<f64>,
    #[serde(default)]
    pub last_deadline_bank: Option<f64>,
}

impl Entry {
    /// Person name ("First Last") when upstream provides one.
    pub fn person_name(&self) -> Option<String> {
        let first = self.player_first_name.as_deref().unwrap_or("").trim();
        let last = self.player_last_name.as_deref().unwrap_or("").trim();
        let full = format!("{first} {last}");
        let full = full.trim();
        if full.is_empty() {
            None
        } else {
            Some(full.to_string())
        }
    }
}

/// `/entry/{manager_id}/history/` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryHistory {
    #[serde(default)]
    pub current: Vec<EntryHistoryEntry>,
}

impl EntryHistory {
    pub fn for_gameweek(&self, gameweek: i32) -> Option<&EntryHistoryEntry> {
        self.current.iter().find(|h| h.event == gameweek)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryHistoryEntry {
    pub event: i32,
    #[serde(default)]
    pub points: i32,
    #[serde(default)]
    pub total_points: i32,
    #[serde(default)]
    pub overall_rank: Option<i64>,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub bank: Option<f64>,
    #[serde(default)]
    pub event_transfers: i32,
    #[serde(default)]
    pub event_transfers_cost: i32,
}

/// `/entry/{manager_id}/event/{gw}/picks/` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryPicks {
    #[serde(default)]
    pub active_chip: Option<String>,
    /// Possibly empty right after matches finish; inference fills the gap.
    #[serde(default)]
    pub automatic_subs: Vec<AutomaticSub>,
    #[serde(default)]
    pub entry_history: Option<PicksEntryHistory>,
    #[serde(default)]
    pub picks: Vec<ApiPick>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPick {
    pub element: i64,
    /// 1..11 starting XI, 12..15 bench in priority order.
    pub position: i32,
    #[serde(default)]
    pub multiplier: i32,
    #[serde(default)]
    pub is_captain: bool,
    #[serde(default)]
    pub is_vice_captain: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct AutomaticSub {
    pub element_in: i64,
    pub element_out: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PicksEntryHistory {
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub event_transfers: i32,
    #[serde(default)]
    pub event_transfers_cost: i32,
    #[serde(default)]
    pub points: i32,
    #[serde(default)]
    pub total_points: i32,
}

/// `/entry/{manager_id}/transfers/` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiTransfer {
    pub element_in: i64,
    pub element_out: i64,
    #[serde(default)]
    pub event: Option<i32>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

/// `/leagues-classic/{league_id}/standings/` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct LeagueStandings {
    pub league: LeagueInfo,
    pub standings: StandingsPage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeagueInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StandingsPage {
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub page: i32,
    #[serde(default)]
    pub results: Vec<StandingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StandingEntry {
    /// Manager id.
    pub entry: i64,
    #[serde(default)]
    pub entry_name: String,
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub rank: i64,
    #[serde(default)]
    pub total: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_f64_accepts_strings_numbers_and_null() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(default, deserialize_with = "de_stat_f64")]
            x: f64,
        }
        let from_str: Probe = serde_json::from_str(r#"{"x":"0.35"}"#).unwrap();
        assert!((from_str.x - 0.35).abs() < 1e-9);
        let from_num: Probe = serde_json::from_str(r#"{"x":2.5}"#).unwrap();
        assert!((from_num.x - 2.5).abs() < 1e-9);
        let from_null: Probe = serde_json::from_str(r#"{"x":null}"#).unwrap();
        assert_eq!(from_null.x, 0.0);
        let missing: Probe = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(missing.x, 0.0);
    }

    #[test]
    fn fixture_in_progress_uses_kickoff_not_started_flag() {
        let now = Utc::now();
        let fx = ApiFixture {
            id: 1,
            event: Some(5),
            team_h: 1,
            team_a: 2,
            team_h_score: None,
            team_a_score: None,
            kickoff_time: Some(now - chrono::Duration::minutes(1)),
            started: Some(false),
            finished: false,
            finished_provisional: false,
            minutes: 0,
        };
        assert!(fx.in_progress(now));
        let done = ApiFixture {
            finished_provisional: true,
            ..fx.clone()
        };
        assert!(!done.in_progress(now));
    }

    #[test]
    fn picks_payload_parses_with_empty_automatic_subs() {
        let raw = r#"{
            "active_chip": "bboost",
            "automatic_subs": [],
            "entry_history": {"rank": 101, "event_transfers_cost": 4},
            "picks": [
                {"element": 7, "position": 1, "multiplier": 1, "is_captain": false, "is_vice_captain": false},
                {"element": 8, "position": 2, "multiplier": 2, "is_captain": true, "is_vice_captain": false}
            ]
        }"#;
        let picks: EntryPicks = serde_json::from_str(raw).unwrap();
        assert_eq!(picks.active_chip.as_deref(), Some("bboost"));
        assert!(picks.automatic_subs.is_empty());
        assert_eq!(picks.picks.len(), 2);
        assert_eq!(picks.entry_history.unwrap().event_transfers_cost, 4);
    }
}
