//! Player data refresh.
//!
//! Writes per-player gameweek stats from the event-live payload when one is
//! available (single upstream call for the whole gameweek) and falls back to
//! per-player element-summary fetches otherwise. Also keeps player ownership
//! and the daily price series in sync with bootstrap.

use crate::fpl_client::FplClient;
use crate::points;
use crate::store::{SharedStore, Store};
use crate::types::api::{ApiFixture, Bootstrap, EventLive, SummaryHistory};
use crate::types::domain::{BonusStatus, PlayerGameweekStatsRow, PlayerPriceRow, PlayerRow,
    Position};
use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ELEMENT_SUMMARY_BATCH_SIZE: usize = 10;
const ELEMENT_SUMMARY_BATCH_SLEEP: Duration = Duration::from_millis(500);

/// Knobs for [`PlayerRefresher::refresh_player_stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerRefreshOptions {
    /// Preserve expected/ICT stats for in-progress fixtures instead of
    /// overwriting them with live zeros.
    pub live_only: bool,
    /// Caller knows event-live is gone (catch-up after the gameweek); skip
    /// the fallback warning.
    pub expect_live_unavailable: bool,
}

pub struct PlayerRefresher {
    client: Arc<FplClient>,
    store: SharedStore,
}

impl PlayerRefresher {
    pub fn new(client: Arc<FplClient>, store: SharedStore) -> Self {
        Self { client, store }
    }

    /// Refresh stats rows for the requested players.
    ///
    /// With `live_data` present, every row derives from the event-live
    /// payload. Without it, each player costs one element-summary call and
    /// one row is written per fixture appearance, which is also what settles
    /// confirmed bonus once fixtures fully finish.
    pub async fn refresh_player_stats(
        &self,
        gameweek: i32,
        player_ids: &HashSet<i64>,
        live_data: Option<&EventLive>,
        fixtures_by_id: Option<&HashMap<i64, ApiFixture>>,
        bootstrap: Option<&Bootstrap>,
        options: PlayerRefreshOptions,
    ) -> Result<()> {
        if player_ids.is_empty() {
            debug!(gameweek, "No active players to refresh");
            return Ok(());
        }
        info!(
            gameweek,
            player_count = player_ids.len(),
            using_live_data = live_data.is_some(),
            "Refreshing player stats"
        );

        let fetched_bootstrap;
        let bootstrap = match bootstrap {
            Some(b) => b,
            None => {
                fetched_bootstrap = self.client.bootstrap(true).await?;
                fetched_bootstrap.as_ref()
            }
        };

        let fetched_fixtures;
        let fixtures_by_id = match fixtures_by_id {
            Some(f) => f,
            None => {
                let all = self.client.fixtures().await?;
                fetched_fixtures = all
                    .into_iter()
                    .filter(|f| f.event == Some(gameweek))
                    .map(|f| (f.id, f))
                    .collect::<HashMap<_, _>>();
                &fetched_fixtures
            }
        };

        let id_list: Vec<i64> = player_ids.iter().copied().collect();
        let existing: HashMap<i64, Vec<PlayerGameweekStatsRow>> = {
            let mut by_player: HashMap<i64, Vec<PlayerGameweekStatsRow>> = HashMap::new();
            for row in self
                .store
                .get_player_stats_for_players(gameweek, &id_list)
                .await?
            {
                by_player.entry(row.player_id).or_default().push(row);
            }
            by_player
        };

        match live_data {
            Some(live) => {
                self.write_rows_from_live(gameweek, player_ids, live, fixtures_by_id, bootstrap,
                    &existing, options)
                    .await?;
            }
            None => {
                if !options.expect_live_unavailable {
                    warn!(gameweek, "Live data not available, falling back to element-summary");
                }
                self.write_rows_from_summaries(gameweek, &id_list, fixtures_by_id, bootstrap)
                    .await?;
            }
        }

        self.recompute_provisional_bonus(gameweek).await?;
        info!(gameweek, player_count = player_ids.len(), "Player stats refresh complete");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_rows_from_live(
        &self,
        gameweek: i32,
        player_ids: &HashSet<i64>,
        live: &EventLive,
        fixtures_by_id: &HashMap<i64, ApiFixture>,
        bootstrap: &Bootstrap,
        existing: &HashMap<i64, Vec<PlayerGameweekStatsRow>>,
        options: PlayerRefreshOptions,
    ) -> Result<()> {
        let elements = bootstrap.elements_by_id();
        let live_by_id = live.elements_by_id();
        let mut rows = Vec::with_capacity(player_ids.len());

        for player_id in player_ids {
            let Some(live_elem) = live_by_id.get(player_id) else {
                continue;
            };
            let stats = &live_elem.stats;
            let info = elements.get(player_id);
            let team_id = info.map(|e| e.team).unwrap_or_default();

            // Fixture context comes from the prior row when we have one, so
            // DGW rows keep their fixture key; otherwise match by team.
            let prior = existing.get(player_id).and_then(|rows| rows.first());
            let mut fixture_id = prior.and_then(|r| r.fixture_id);
            let mut opponent_team_id = prior.and_then(|r| r.opponent_team_id);
            let mut was_home = prior.and_then(|r| r.was_home);
            let mut kickoff_at = prior.and_then(|r| r.kickoff_at);
            if fixture_id.is_none() {
                if let Some(fx) = fixtures_by_id
                    .values()
                    .find(|f| f.team_h == team_id || f.team_a == team_id)
                {
                    fixture_id = Some(fx.id);
                    let home = fx.team_h == team_id;
                    was_home = Some(home);
                    opponent_team_id = Some(if home { fx.team_a } else { fx.team_h });
                    kickoff_at = fx.kickoff_time;
                }
            }

            let fixture = fixture_id.and_then(|id| fixtures_by_id.get(&id));
            let match_finished = fixture.map(|f| f.finished).unwrap_or(false);
            let match_finished_provisional = fixture
                .map(|f| f.finished_provisional)
                .unwrap_or(false);
            let (home_score, away_score) = fixture
                .map(|f| (f.team_h_score, f.team_a_score))
                .unwrap_or((None, None));

            let bonus_status = if stats.bonus > 0 || match_finished {
                BonusStatus::Confirmed
            } else {
                BonusStatus::Provisional
            };

            // Expected/ICT stats are static per match; during live cycles keep
            // what we already have rather than overwrite with zeros.
            let preserve = options.live_only && !match_finished;
            let prior_or_default = prior.cloned().unwrap_or_else(|| {
                empty_stats_row(*player_id, gameweek, team_id)
            });

            let row = PlayerGameweekStatsRow {
                player_id: *player_id,
                gameweek_id: gameweek,
                fixture_id,
                team_id,
                opponent_team_id,
                was_home,
                kickoff_at,
                minutes: stats.minutes,
                total_points: stats.total_points,
                bps: stats.bps,
                bonus: stats.bonus,
                bonus_status,
                provisional_bonus: prior_or_default.provisional_bonus,
                goals: stats.goals_scored,
                assists: stats.assists,
                own_goals: stats.own_goals,
                penalties_saved: stats.penalties_saved,
                penalties_missed: stats.penalties_missed,
                saves: stats.saves,
                clean_sheets: stats.clean_sheets,
                goals_conceded: stats.goals_conceded,
                yellow_cards: stats.yellow_cards,
                red_cards: stats.red_cards,
                defensive_contribution: derive_defensive_contribution(
                    stats.defensive_contribution,
                    stats.clearances_blocks_interceptions,
                    stats.tackles,
                    stats.recoveries,
                    info.and_then(|e| Position::from_element_type(e.element_type)),
                ),
                expected_goals: if preserve {
                    prior_or_default.expected_goals
                } else {
                    stats.expected_goals
                },
                expected_assists: if preserve {
                    prior_or_default.expected_assists
                } else {
                    stats.expected_assists
                },
                expected_goal_involvements: if preserve {
                    prior_or_default.expected_goal_involvements
                } else {
                    stats.expected_goal_involvements
                },
                expected_goals_conceded: if preserve {
                    prior_or_default.expected_goals_conceded
                } else {
                    stats.expected_goals_conceded
                },
                influence: if preserve {
                    prior_or_default.influence
                } else {
                    stats.influence
                },
                creativity: if preserve {
                    prior_or_default.creativity
                } else {
                    stats.creativity
                },
                threat: if preserve {
                    prior_or_default.threat
                } else {
                    stats.threat
                },
                ict_index: if preserve {
                    prior_or_default.ict_index
                } else {
                    stats.ict_index
                },
                home_score,
                away_score,
                match_finished,
                match_finished_provisional,
            };
            rows.push(row);
        }

        self.store.upsert_player_gameweek_stats(&rows).await
    }

    async fn write_rows_from_summaries(
        &self,
        gameweek: i32,
        player_ids: &[i64],
        fixtures_by_id: &HashMap<i64, ApiFixture>,
        bootstrap: &Bootstrap,
    ) -> Result<()> {
        let elements = bootstrap.elements_by_id();

        for batch in player_ids.chunks(ELEMENT_SUMMARY_BATCH_SIZE) {
            let fetches = batch.iter().map(|id| {
                let client = Arc::clone(&self.client);
                let id = *id;
                async move { (id, client.element_summary(id).await) }
            });
            let mut rows = Vec::new();
            for (player_id, result) in join_all(fetches).await {
                let summary = match result {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(player_id, error = %e, "Element summary fetch failed");
                        continue;
                    }
                };
                let position = elements
                    .get(&player_id)
                    .and_then(|e| Position::from_element_type(e.element_type));
                for entry in summary.history.iter().filter(|h| h.round == gameweek) {
                    rows.push(row_from_summary(
                        player_id,
                        gameweek,
                        entry,
                        fixtures_by_id,
                        position,
                    ));
                }
            }
            self.store.upsert_player_gameweek_stats(&rows).await?;
            if batch.len() == ELEMENT_SUMMARY_BATCH_SIZE {
                tokio::time::sleep(ELEMENT_SUMMARY_BATCH_SLEEP).await;
            }
        }
        Ok(())
    }

    /// Re-rank BPS within each done-but-unconfirmed fixture and persist the
    /// synthesized 3/2/1 bonus for rows still in the provisional state.
    async fn recompute_provisional_bonus(&self, gameweek: i32) -> Result<()> {
        let all = self.store.get_player_stats_for_gameweek(gameweek).await?;
        let mut by_fixture: HashMap<i64, Vec<&PlayerGameweekStatsRow>> = HashMap::new();
        for row in &all {
            if let Some(fixture_id) = row.fixture_id {
                by_fixture.entry(fixture_id).or_default().push(row);
            }
        }

        let mut updates = Vec::new();
        for rows in by_fixture.values() {
            let fixture_done = rows
                .iter()
                .any(|r| r.match_finished || r.match_finished_provisional);
            if !fixture_done {
                continue;
            }
            let fixture_bps: Vec<i32> = rows.iter().map(|r| r.bps).collect();
            for row in rows {
                let expected = if row.bonus_status == BonusStatus::Provisional && row.bonus == 0 {
                    points::provisional_bonus(row.bps, &fixture_bps)
                } else {
                    0
                };
                if expected != row.provisional_bonus {
                    let mut updated = (*row).clone();
                    updated.provisional_bonus = expected;
                    updates.push(updated);
                }
            }
        }
        if !updates.is_empty() {
            debug!(gameweek, rows = updates.len(), "Synthesized provisional bonus");
            self.store.upsert_player_gameweek_stats(&updates).await?;
        }
        Ok(())
    }

    /// Refresh `cost_tenths` and `selected_by_percent` (and the rest of the
    /// player reference row) from bootstrap.
    pub async fn sync_players_ownership_from_bootstrap(
        &self,
        bootstrap: &Bootstrap,
    ) -> Result<()> {
        for element in &bootstrap.elements {
            let Some(position) = Position::from_element_type(element.element_type) else {
                continue;
            };
            self.store
                .upsert_player(&PlayerRow {
                    id: element.id,
                    team_id: element.team,
                    position,
                    web_name: element.web_name.clone(),
                    cost_tenths: element.now_cost,
                    selected_by_percent: element.selected_by_percent,
                })
                .await?;
        }
        debug!(players = bootstrap.elements.len(), "Synced player ownership from bootstrap");
        Ok(())
    }

    /// Append today's price point per player, with the delta against the last
    /// recorded price.
    pub async fn sync_player_prices_from_bootstrap(
        &self,
        bootstrap: &Bootstrap,
        gameweek: i32,
    ) -> Result<()> {
        let last_prices = self.store.get_latest_player_prices().await?;
        let now = Utc::now();
        let today = now.date_naive();
        let mut changes = 0usize;

        for element in &bootstrap.elements {
            let last = last_prices.get(&element.id).copied();
            let change = last.map(|p| element.now_cost - p).unwrap_or(0);
            if last.is_some() && change != 0 {
                changes += 1;
            }
            self.store
                .upsert_player_price(&PlayerPriceRow {
                    player_id: element.id,
                    gameweek_id: gameweek,
                    price_tenths: element.now_cost,
                    price_change_tenths: change,
                    recorded_at: now,
                    recorded_date: today,
                })
                .await?;
        }
        if changes > 0 {
            info!(gameweek, changes, "Detected price changes");
        }
        Ok(())
    }
}

/// DEFCON: use the official value when present, otherwise derive from raw
/// stats. Midfielders and forwards count recoveries; defenders and keepers
/// count only CBI plus tackles.
fn derive_defensive_contribution(
    official: i32,
    clearances_blocks_interceptions: i32,
    tackles: i32,
    recoveries: i32,
    position: Option<Position>,
) -> i32 {
    if official > 0 {
        return official;
    }
    let cbit = clearances_blocks_interceptions + tackles;
    match position {
        Some(Position::Midfielder) | Some(Position::Forward) => cbit + recoveries,
        _ => cbit,
    }
}

fn empty_stats_row(player_id: i64, gameweek: i32, team_id: i64) -> PlayerGameweekStatsRow {
    PlayerGameweekStatsRow {
        player_id,
        gameweek_id: gameweek,
        fixture_id: None,
        team_id,
        opponent_team_id: None,
        was_home: None,
        kickoff_at: None,
        minutes: 0,
        total_points: 0,
        bps: 0,
        bonus: 0,
        bonus_status: BonusStatus::Provisional,
        provisional_bonus: 0,
        goals: 0,
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
        home_score: None,
        away_score: None,
        match_finished: false,
        match_finished_provisional: false,
    }
}

fn row_from_summary(
    player_id: i64,
    gameweek: i32,
    entry: &SummaryHistory,
    fixtures_by_id: &HashMap<i64, ApiFixture>,
    position: Option<Position>,
) -> PlayerGameweekStatsRow {
    let fixture = fixtures_by_id.get(&entry.fixture);
    let match_finished = fixture.map(|f| f.finished).unwrap_or(false);
    let match_finished_provisional = fixture.map(|f| f.finished_provisional).unwrap_or(false);
    let team_id = fixture
        .map(|f| {
            if entry.was_home.unwrap_or(false) {
                f.team_h
            } else {
                f.team_a
            }
        })
        .unwrap_or_default();

    PlayerGameweekStatsRow {
        player_id,
        gameweek_id: gameweek,
        fixture_id: Some(entry.fixture),
        team_id,
        opponent_team_id: entry.opponent_team,
        was_home: entry.was_home,
        kickoff_at: entry.kickoff_time,
        minutes: entry.minutes,
        total_points: entry.total_points,
        bps: entry.bps,
        bonus: entry.bonus,
        bonus_status: if entry.bonus > 0 || match_finished {
            BonusStatus::Confirmed
        } else {
            BonusStatus::Provisional
        },
        provisional_bonus: 0,
        goals: entry.goals_scored,
        assists: entry.assists,
        own_goals: entry.own_goals,
        penalties_saved: entry.penalties_saved,
        penalties_missed: entry.penalties_missed,
        saves: entry.saves,
        clean_sheets: entry.clean_sheets,
        goals_conceded: entry.goals_conceded,
        yellow_cards: entry.yellow_cards,
        red_cards: entry.red_cards,
        defensive_contribution: derive_defensive_contribution(
            entry.defensive_contribution,
            entry.clearances_blocks_interceptions,
            entry.tackles,
            entry.recoveries,
            position,
        ),
        expected_goals: entry.expected_goals,
        expected_assists: entry.expected_assists,
        expected_goal_involvements: entry.expected_goal_involvements,
        expected_goals_conceded: entry.expected_goals_conceded,
        influence: entry.influence,
        creativity: entry.creativity,
        threat: entry.threat,
        ict_index: entry.ict_index,
        home_score: entry.team_h_score,
        away_score: entry.team_a_score,
        match_finished,
        match_finished_provisional,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defcon_prefers_official_value() {
        assert_eq!(
            derive_defensive_contribution(7, 99, 99, 99, Some(Position::Defender)),
            7
        );
    }

    #[test]
    fn defcon_derivation_counts_recoveries_for_attackers_only() {
        assert_eq!(
            derive_defensive_contribution(0, 3, 2, 4, Some(Position::Midfielder)),
            9
        );
        assert_eq!(
            derive_defensive_contribution(0, 3, 2, 4, Some(Position::Defender)),
            5
        );
        assert_eq!(derive_defensive_contribution(0, 3, 2, 4, None), 5);
    }
}
