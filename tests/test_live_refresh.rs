//! Integration tests for the live points paths against the in-memory store:
//! idempotency, baseline immutability and total-points conservation.

use chrono::{Duration, Utc};
use fpl_refresh::fpl_client::FplClient;
use fpl_refresh::managers::ManagerRefresher;
use fpl_refresh::settings::Settings;
use fpl_refresh::store::memory::MemoryStore;
use fpl_refresh::store::{SharedStore, Store};
use fpl_refresh::types::domain::{
    BonusStatus, FixtureRow, GameweekRow, ManagerGameweekHistoryRow, ManagerPickRow,
    PlayerGameweekStatsRow, PlayerRow, Position,
};
use std::sync::Arc;

const GW: i32 = 20;

fn stats_row(player_id: i64, fixture_id: i64, team_id: i64, points: i32, minutes: i32,
    done: bool) -> PlayerGameweekStatsRow {
    PlayerGameweekStatsRow {
        player_id,
        gameweek_id: GW,
        fixture_id: Some(fixture_id),
        team_id,
        opponent_team_id: Some(99),
        was_home: Some(true),
        kickoff_at: None,
        minutes,
        total_points: points,
        bps: points * 4,
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
        match_finished: done,
        match_finished_provisional: done,
    }
}

fn pick(manager_id: i64, position: i32, player_id: i64, multiplier: i32, captain: bool)
    -> ManagerPickRow {
    ManagerPickRow {
        manager_id,
        gameweek_id: GW,
        position,
        player_id,
        is_captain: captain,
        is_vice_captain: false,
        multiplier,
        was_auto_subbed_in: false,
        was_auto_subbed_out: false,
        auto_sub_replaced_player_id: None,
    }
}

/// A cohort of two managers sharing a 15-player pool: players 1..15 belong to
/// manager 100 as picked; manager 200 mirrors the squad with a different
/// captain. Starters score 2 each (60 starter points before multipliers);
/// player 5 blanked and subs out for player 13.
async fn seed_store(store: &Arc<MemoryStore>) {
    store.add_league(500, "Integration League", &[100, 200]).await;
    store
        .upsert_gameweek(&GameweekRow {
            id: GW,
            name: format!("Gameweek {GW}"),
            deadline_at: Some(Utc::now() - Duration::hours(30)),
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
    store
        .upsert_fixture(&FixtureRow {
            id: 900,
            gameweek_id: Some(GW),
            home_team_id: 1,
            away_team_id: 2,
            kickoff_at: Some(Utc::now() - Duration::hours(3)),
            started: true,
            finished: false,
            finished_provisional: true,
            minutes: 90,
            home_score: Some(2),
            away_score: Some(1),
        })
        .await
        .unwrap();

    for player_id in 1..=15i64 {
        let position = match player_id {
            1 | 12 => Position::Goalkeeper,
            2..=5 | 14 => Position::Defender,
            6..=8 | 13 | 15 => Position::Midfielder,
            _ => Position::Forward,
        };
        store
            .upsert_player(&PlayerRow {
                id: player_id,
                team_id: 1,
                position,
                web_name: format!("Player {player_id}"),
                cost_tenths: 55,
                selected_by_percent: 10.0,
            })
            .await
            .unwrap();
        // Player 5 blanks (0 minutes, fixture done); everyone else played.
        let (points, minutes) = if player_id == 5 { (0, 0) } else { (2, 90) };
        store
            .upsert_player_gameweek_stats(&[stats_row(player_id, 900, 1, points, minutes, true)])
            .await
            .unwrap();
    }

    for manager_id in [100i64, 200] {
        let captain = if manager_id == 100 { 9 } else { 10 };
        let mut picks = Vec::new();
        for position in 1..=15i32 {
            let player_id = position as i64;
            let multiplier = if player_id == captain {
                2
            } else if position <= 11 {
                1
            } else {
                0
            };
            picks.push(pick(
                manager_id,
                position,
                player_id,
                multiplier,
                player_id == captain,
            ));
        }
        store.upsert_manager_picks(&picks).await.unwrap();
        store
            .upsert_manager_history(&ManagerGameweekHistoryRow {
                manager_id,
                gameweek_id: GW,
                transfer_cost: if manager_id == 100 { 4 } else { 0 },
                total_points: 500,
                baseline_total_points: Some(500),
                previous_overall_rank: Some(250_000),
                previous_mini_league_rank: Some(if manager_id == 100 { 2 } else { 1 }),
                ..Default::default()
            })
            .await
            .unwrap();
    }
}

fn refresher(store: Arc<MemoryStore>) -> ManagerRefresher {
    let settings = Settings::default();
    let client = Arc::new(FplClient::new(&settings).expect("client builds"));
    let shared: SharedStore = store;
    ManagerRefresher::new(client, shared)
}

/// Expected points: 10 starters at 2 (one doubled for the captain) plus the
/// auto-subbed player 13's 2, minus transfer cost, floored at zero.
fn expected_points(transfer_cost: i32) -> i32 {
    let raw = 9 * 2 + 4 + 2;
    (raw - transfer_cost).max(0)
}

#[tokio::test]
async fn live_points_apply_auto_subs_captain_and_transfer_cost() {
    let store = Arc::new(MemoryStore::new());
    seed_store(&store).await;
    let refresher = refresher(store.clone());

    assert!(refresher
        .refresh_manager_points_live_only(&[100, 200], GW)
        .await
        .unwrap());

    let row = store.get_manager_history(100, GW).await.unwrap().unwrap();
    assert_eq!(row.gameweek_points, expected_points(4));
    assert_eq!(row.total_points, 500 + expected_points(4));

    let row = store.get_manager_history(200, GW).await.unwrap().unwrap();
    assert_eq!(row.gameweek_points, expected_points(0));
    assert_eq!(row.total_points, 500 + expected_points(0));
}

#[tokio::test]
async fn live_refresh_is_idempotent_and_preserves_baselines() {
    let store = Arc::new(MemoryStore::new());
    seed_store(&store).await;
    let refresher = refresher(store.clone());

    refresher
        .refresh_manager_points_live_only(&[100, 200], GW)
        .await
        .unwrap();
    let first = store.get_manager_history(100, GW).await.unwrap().unwrap();

    refresher
        .refresh_manager_points_live_only(&[100, 200], GW)
        .await
        .unwrap();
    let second = store.get_manager_history(100, GW).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(second.baseline_total_points, Some(500));
    assert_eq!(second.previous_overall_rank, Some(250_000));
    assert_eq!(second.previous_mini_league_rank, Some(2));
    // Conservation: while the baseline is set, total = baseline + gameweek.
    assert_eq!(
        second.total_points,
        second.baseline_total_points.unwrap() + second.gameweek_points
    );
}

#[tokio::test]
async fn league_ranks_follow_live_totals_with_stable_ties() {
    let store = Arc::new(MemoryStore::new());
    seed_store(&store).await;
    let refresher = refresher(store.clone());

    refresher
        .refresh_manager_points_live_only(&[100, 200], GW)
        .await
        .unwrap();
    refresher.calculate_mini_league_ranks(500, GW).await.unwrap();

    let rows = store.get_history_for_managers(GW, &[100, 200]).await.unwrap();
    let row100 = rows.iter().find(|r| r.manager_id == 100).unwrap().clone();
    let row200 = rows.iter().find(|r| r.manager_id == 200).unwrap().clone();
    // Manager 200 paid no transfer cost and leads.
    assert_eq!(row200.mini_league_rank, Some(1));
    assert_eq!(row100.mini_league_rank, Some(2));
    // Rank change is measured against the preserved deadline baseline.
    assert_eq!(row200.mini_league_rank_change, Some(0));
    assert_eq!(row100.mini_league_rank_change, Some(0));

    // Level the totals: tied managers share rank 1.
    store
        .update_manager_history_points(100, GW, row200.gameweek_points, row200.total_points)
        .await
        .unwrap();
    refresher.calculate_mini_league_ranks(500, GW).await.unwrap();
    let rows = store.get_history_for_managers(GW, &[100, 200]).await.unwrap();
    for row in rows {
        assert_eq!(row.mini_league_rank, Some(1));
    }
}

#[tokio::test]
async fn auto_sub_flags_sync_to_stored_picks() {
    let store = Arc::new(MemoryStore::new());
    seed_store(&store).await;
    let refresher = refresher(store.clone());

    refresher.sync_auto_sub_flags_to_picks(100, GW).await.unwrap();

    let picks = store.get_manager_picks(100, GW).await.unwrap();
    let out = picks.iter().find(|p| p.player_id == 5).unwrap();
    assert!(out.was_auto_subbed_out);
    // First compatible bench player in priority order is the position-13 mid.
    let sub_in = picks.iter().find(|p| p.player_id == 13).unwrap();
    assert!(sub_in.was_auto_subbed_in);
    assert_eq!(sub_in.auto_sub_replaced_player_id, Some(5));
    // The goalkeeper on the bench is not touched.
    let bench_gk = picks.iter().find(|p| p.player_id == 12).unwrap();
    assert!(!bench_gk.was_auto_subbed_in);
}
