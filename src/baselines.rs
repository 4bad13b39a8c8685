//! Baseline capture.
//!
//! Baselines anchor every delta the front-end shows: captured once per
//! gameweek after the deadline (total points, previous ranks) and once per
//! matchday (rank snapshots shortly before first kickoff). They are never
//! overwritten during live updates; the only writers are here and the
//! deadline batch seed.

use crate::store::{SharedStore, Store};
use crate::types::domain::{FixtureRow, MatchdayBaselineRow, MatchdayInfo};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Counts from a cohort-wide gameweek capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub managers_captured: usize,
    pub transfers_captured: usize,
    pub total_managers: usize,
}

pub struct BaselineCapture {
    store: SharedStore,
    matchday_minutes_before: i64,
    matchday_minutes_stop_before: i64,
}

impl BaselineCapture {
    pub fn new(
        store: SharedStore,
        matchday_minutes_before: i64,
        matchday_minutes_stop_before: i64,
    ) -> Self {
        Self {
            store,
            matchday_minutes_before,
            matchday_minutes_stop_before,
        }
    }

    /// Gate for the gameweek capture: after the deadline, before any fixture
    /// has started, and not yet captured. Capturing after a kickoff would
    /// anchor deltas to a mid-match reference, so that case logs and skips.
    pub async fn should_capture_baselines(
        &self,
        gameweek: i32,
        deadline_at: DateTime<Utc>,
        now: DateTime<Utc>,
        manager_ids: &[i64],
    ) -> Result<bool> {
        if now < deadline_at {
            return Ok(false);
        }
        let existing = self
            .store
            .get_history_for_managers(gameweek, manager_ids)
            .await?;
        if existing.iter().any(|h| h.baseline_total_points.is_some()) {
            return Ok(false);
        }
        let fixtures = self.store.get_fixtures_for_gameweek(gameweek).await?;
        if fixtures.iter().any(|f| f.started) {
            warn!(
                gameweek,
                "Skipping baseline capture: at least one fixture has started"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Capture one manager's gameweek baselines from the previous gameweek's
    /// stored row. Idempotent: a row whose baseline is already set is left
    /// alone. Returns whether anything was written.
    pub async fn capture_manager_baselines(
        &self,
        manager_id: i64,
        gameweek: i32,
    ) -> Result<bool> {
        let existing = self.store.get_manager_history(manager_id, gameweek).await?;
        if existing
            .as_ref()
            .and_then(|h| h.baseline_total_points)
            .is_some()
        {
            debug!(manager_id, gameweek, "Baselines already captured, skipping");
            return Ok(false);
        }
        if gameweek <= 1 {
            return Ok(false);
        }

        let Some(previous) = self
            .store
            .get_manager_history(manager_id, gameweek - 1)
            .await?
        else {
            warn!(manager_id, gameweek, "No previous gameweek row for baseline capture");
            return Ok(false);
        };

        self.store
            .set_manager_history_baselines(
                manager_id,
                gameweek,
                Some(previous.total_points),
                previous.overall_rank,
                previous.mini_league_rank,
            )
            .await?;
        info!(
            manager_id,
            gameweek,
            baseline_total = previous.total_points,
            previous_overall_rank = ?previous.overall_rank,
            previous_mini_league_rank = ?previous.mini_league_rank,
            "Captured manager baselines"
        );
        Ok(true)
    }

    /// Capture per-transfer point baselines (player points at deadline) for
    /// delta display. Written once per transfer row.
    pub async fn capture_transfer_baselines(
        &self,
        manager_id: i64,
        gameweek: i32,
    ) -> Result<usize> {
        let transfers = self
            .store
            .get_manager_transfers(manager_id, gameweek)
            .await?;
        if transfers.is_empty() {
            return Ok(0);
        }

        let mut player_ids: Vec<i64> = Vec::new();
        for transfer in &transfers {
            player_ids.push(transfer.player_in_id);
            player_ids.push(transfer.player_out_id);
        }
        player_ids.sort_unstable();
        player_ids.dedup();

        let stats = self
            .store
            .get_player_stats_for_players(gameweek, &player_ids)
            .await?;
        let mut points_by_player: std::collections::HashMap<i64, i32> =
            std::collections::HashMap::new();
        for row in &stats {
            *points_by_player.entry(row.player_id).or_insert(0) += row.total_points;
        }

        let mut captured = 0usize;
        for transfer in &transfers {
            if transfer.player_in_points_baseline.is_some() {
                continue;
            }
            let in_points = points_by_player
                .get(&transfer.player_in_id)
                .copied()
                .unwrap_or(0);
            let out_points = points_by_player
                .get(&transfer.player_out_id)
                .copied()
                .unwrap_or(0);
            self.store
                .set_transfer_baselines_if_unset(
                    manager_id,
                    gameweek,
                    transfer.player_in_id,
                    transfer.player_out_id,
                    in_points,
                    out_points,
                    in_points - out_points,
                )
                .await?;
            captured += 1;
        }
        Ok(captured)
    }

    /// Whole-cohort gameweek capture, plus the matchday-1 rank snapshot.
    pub async fn capture_all_baselines_for_gameweek(
        &self,
        gameweek: i32,
        manager_ids: &[i64],
    ) -> Result<CaptureSummary> {
        let mut summary = CaptureSummary {
            total_managers: manager_ids.len(),
            ..Default::default()
        };
        for manager_id in manager_ids {
            if self.capture_manager_baselines(*manager_id, gameweek).await? {
                summary.managers_captured += 1;
            }
            summary.transfers_captured += self
                .capture_transfer_baselines(*manager_id, gameweek)
                .await?;
        }
        info!(
            gameweek,
            managers_captured = summary.managers_captured,
            transfers_captured = summary.transfers_captured,
            total_managers = summary.total_managers,
            "Captured gameweek baselines"
        );

        self.write_matchday_one_baselines(gameweek, manager_ids).await?;
        Ok(summary)
    }

    /// Matchday 1 is the start of the gameweek: snapshot the deadline-time
    /// ranks so the first matchday's deltas have a reference.
    async fn write_matchday_one_baselines(
        &self,
        gameweek: i32,
        manager_ids: &[i64],
    ) -> Result<()> {
        let Some(first_kickoff) = self
            .store
            .get_first_kickoff_for_gameweek(gameweek)
            .await?
        else {
            return Ok(());
        };

        let history = self
            .store
            .get_history_for_managers(gameweek, manager_ids)
            .await?;
        let now = Utc::now();
        let rows: Vec<MatchdayBaselineRow> = history
            .iter()
            .filter_map(|h| {
                let overall = h.previous_overall_rank?;
                Some(MatchdayBaselineRow {
                    manager_id: h.manager_id,
                    gameweek_id: gameweek,
                    matchday_sequence: 1,
                    matchday_date: first_kickoff.date_naive(),
                    first_kickoff_at: first_kickoff,
                    overall_rank_baseline: overall,
                    gameweek_rank_baseline: h.gameweek_rank,
                    captured_at: now,
                })
            })
            .collect();
        if !rows.is_empty() {
            self.store.upsert_matchday_baselines(&rows).await?;
            info!(gameweek, managers = rows.len(), "Wrote matchday 1 baselines");
        }
        Ok(())
    }

    /// If we are inside the capture window for an upcoming matchday that has
    /// no snapshot yet, return it. The window runs from `minutes_before` to
    /// `minutes_stop_before` ahead of the matchday's first kickoff.
    pub async fn next_matchday_for_capture(
        &self,
        gameweek: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<MatchdayInfo>> {
        let fixtures = self.store.get_fixtures_for_gameweek(gameweek).await?;
        for matchday in matchdays_from_fixtures(&fixtures) {
            let window_start =
                matchday.first_kickoff_at - Duration::minutes(self.matchday_minutes_before);
            let window_end =
                matchday.first_kickoff_at - Duration::minutes(self.matchday_minutes_stop_before);
            if now < window_start || now > window_end {
                continue;
            }
            if self
                .store
                .matchday_baseline_captured(gameweek, matchday.matchday_sequence)
                .await?
            {
                continue;
            }
            return Ok(Some(matchday));
        }
        Ok(None)
    }

    /// Snapshot current ranks for the cohort into the matchday baseline table.
    pub async fn capture_matchday_baselines(
        &self,
        gameweek: i32,
        matchday: &MatchdayInfo,
        manager_ids: &[i64],
    ) -> Result<usize> {
        let history = self
            .store
            .get_history_for_managers(gameweek, manager_ids)
            .await?;
        let now = Utc::now();
        let rows: Vec<MatchdayBaselineRow> = history
            .iter()
            .filter_map(|h| {
                let overall = h.overall_rank?;
                Some(MatchdayBaselineRow {
                    manager_id: h.manager_id,
                    gameweek_id: gameweek,
                    matchday_sequence: matchday.matchday_sequence,
                    matchday_date: matchday.matchday_date,
                    first_kickoff_at: matchday.first_kickoff_at,
                    overall_rank_baseline: overall,
                    gameweek_rank_baseline: h.gameweek_rank,
                    captured_at: now,
                })
            })
            .collect();
        if !rows.is_empty() {
            self.store.upsert_matchday_baselines(&rows).await?;
            info!(
                gameweek,
                matchday_sequence = matchday.matchday_sequence,
                managers = rows.len(),
                "Captured matchday baselines"
            );
        }
        Ok(rows.len())
    }
}

/// Group a gameweek's fixtures into matchdays: one per UTC calendar day with
/// kickoffs, sequenced in date order.
pub fn matchdays_from_fixtures(fixtures: &[FixtureRow]) -> Vec<MatchdayInfo> {
    let mut first_kickoff_by_date: BTreeMap<chrono::NaiveDate, DateTime<Utc>> = BTreeMap::new();
    for fixture in fixtures {
        let Some(kickoff) = fixture.kickoff_at else {
            continue;
        };
        let date = kickoff.date_naive();
        first_kickoff_by_date
            .entry(date)
            .and_modify(|k| {
                if kickoff < *k {
                    *k = kickoff;
                }
            })
            .or_insert(kickoff);
    }
    first_kickoff_by_date
        .into_iter()
        .enumerate()
        .map(|(index, (date, kickoff))| MatchdayInfo {
            matchday_sequence: index as i32 + 1,
            matchday_date: date,
            first_kickoff_at: kickoff,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::domain::ManagerGameweekHistoryRow;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn fixture(id: i64, gameweek_id: i32, kickoff: DateTime<Utc>, started: bool) -> FixtureRow {
        FixtureRow {
            id,
            gameweek_id: Some(gameweek_id),
            home_team_id: 1,
            away_team_id: 2,
            kickoff_at: Some(kickoff),
            started,
            finished: false,
            finished_provisional: false,
            minutes: 0,
            home_score: None,
            away_score: None,
        }
    }

    fn capture(store: Arc<MemoryStore>) -> BaselineCapture {
        BaselineCapture::new(store, 90, 5)
    }

    #[test]
    fn matchdays_sequence_by_calendar_day() {
        let saturday = Utc.with_ymd_and_hms(2025, 9, 13, 11, 30, 0).unwrap();
        let saturday_late = Utc.with_ymd_and_hms(2025, 9, 13, 16, 30, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2025, 9, 14, 13, 0, 0).unwrap();
        let fixtures = vec![
            fixture(3, 4, sunday, false),
            fixture(1, 4, saturday_late, false),
            fixture(2, 4, saturday, false),
        ];
        let matchdays = matchdays_from_fixtures(&fixtures);
        assert_eq!(matchdays.len(), 2);
        assert_eq!(matchdays[0].matchday_sequence, 1);
        assert_eq!(matchdays[0].first_kickoff_at, saturday);
        assert_eq!(matchdays[1].matchday_sequence, 2);
        assert_eq!(matchdays[1].first_kickoff_at, sunday);
    }

    #[tokio::test]
    async fn started_fixture_gates_gameweek_capture() {
        let store = Arc::new(MemoryStore::new());
        let kickoff = Utc::now() + Duration::hours(4);
        store.upsert_fixture(&fixture(1, 9, kickoff, true)).await.unwrap();
        store
            .upsert_manager_history(&ManagerGameweekHistoryRow {
                manager_id: 42,
                gameweek_id: 9,
                ..Default::default()
            })
            .await
            .unwrap();
        let capture = capture(store);
        let deadline = Utc::now() - Duration::hours(2);
        let allowed = capture
            .should_capture_baselines(9, deadline, Utc::now(), &[42])
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn baselines_copied_from_previous_gameweek_once() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_manager_history(&ManagerGameweekHistoryRow {
                manager_id: 7,
                gameweek_id: 11,
                total_points: 612,
                overall_rank: Some(150_000),
                mini_league_rank: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .upsert_manager_history(&ManagerGameweekHistoryRow {
                manager_id: 7,
                gameweek_id: 12,
                ..Default::default()
            })
            .await
            .unwrap();

        let capture = capture(store.clone());
        assert!(capture.capture_manager_baselines(7, 12).await.unwrap());
        let row = store.get_manager_history(7, 12).await.unwrap().unwrap();
        assert_eq!(row.baseline_total_points, Some(612));
        assert_eq!(row.previous_overall_rank, Some(150_000));
        assert_eq!(row.previous_mini_league_rank, Some(2));

        // Second capture is a no-op even if the previous row changed.
        store
            .upsert_manager_history(&ManagerGameweekHistoryRow {
                manager_id: 7,
                gameweek_id: 11,
                total_points: 700,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!capture.capture_manager_baselines(7, 12).await.unwrap());
        let row = store.get_manager_history(7, 12).await.unwrap().unwrap();
        assert_eq!(row.baseline_total_points, Some(612));
    }

    #[tokio::test]
    async fn matchday_capture_window_and_idempotence() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let kickoff = now + Duration::minutes(30);
        store.upsert_fixture(&fixture(5, 15, kickoff, false)).await.unwrap();
        store
            .upsert_manager_history(&ManagerGameweekHistoryRow {
                manager_id: 3,
                gameweek_id: 15,
                overall_rank: Some(90_000),
                gameweek_rank: Some(1_200_000),
                ..Default::default()
            })
            .await
            .unwrap();

        let capture = capture(store.clone());
        let matchday = capture
            .next_matchday_for_capture(15, now)
            .await
            .unwrap()
            .expect("inside the capture window");
        assert_eq!(matchday.matchday_sequence, 1);

        assert_eq!(
            capture
                .capture_matchday_baselines(15, &matchday, &[3])
                .await
                .unwrap(),
            1
        );
        // Already captured: the window probe now returns nothing.
        assert!(capture
            .next_matchday_for_capture(15, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn matchday_capture_window_excludes_final_minutes() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let kickoff = now + Duration::minutes(3);
        store.upsert_fixture(&fixture(6, 16, kickoff, false)).await.unwrap();
        let capture = capture(store);
        // Inside the stop buffer (5 minutes before kickoff): no capture.
        assert!(capture
            .next_matchday_for_capture(16, now)
            .await
            .unwrap()
            .is_none());
    }
}
