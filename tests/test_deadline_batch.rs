//! Integration tests for deadline-batch guardrails: the pre-flight bootstrap
//! gate, the refuse-if-started guard, and crash-safe run bookkeeping.

use chrono::{Duration, Utc};
use fpl_refresh::fpl_client::FplClient;
use fpl_refresh::managers::{ManagerRefresher, PicksMeta};
use fpl_refresh::orchestrator::Orchestrator;
use fpl_refresh::settings::Settings;
use fpl_refresh::store::memory::MemoryStore;
use fpl_refresh::store::{SharedStore, Store};
use fpl_refresh::types::domain::{FixtureRow, GameweekRow, ManagerGameweekHistoryRow};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

const GW: i32 = 30;

/// Settings pointed at a dead endpoint so upstream calls fail fast.
fn offline_settings() -> Settings {
    let mut settings = Settings::default();
    settings.fpl_api_base_url = "http://127.0.0.1:9/api".to_string();
    settings.max_retries = 0;
    settings.request_timeout_seconds = 2;
    settings.min_request_interval = 0.0;
    settings.max_requests_per_minute = 1000;
    settings.post_deadline_settle_seconds = 0;
    settings
}

fn gameweek(id: i32, current: bool, deadline_hours_ago: i64) -> GameweekRow {
    GameweekRow {
        id,
        name: format!("Gameweek {id}"),
        deadline_at: Some(Utc::now() - Duration::hours(deadline_hours_ago)),
        release_at: None,
        is_current: current,
        is_previous: false,
        is_next: !current,
        finished: false,
        data_checked: false,
        ranks_finalized: false,
        highest_score: None,
        average_entry_score: None,
    }
}

fn fixture(id: i64, started: bool) -> FixtureRow {
    FixtureRow {
        id,
        gameweek_id: Some(GW),
        home_team_id: 1,
        away_team_id: 2,
        kickoff_at: Some(Utc::now() + Duration::hours(20)),
        started,
        finished: false,
        finished_provisional: false,
        minutes: 0,
        home_score: None,
        away_score: None,
    }
}

fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
    let settings = Arc::new(offline_settings());
    let client = Arc::new(FplClient::new(&settings).expect("client builds"));
    let (_tx, rx) = watch::channel(false);
    Orchestrator::new(settings, client, store, rx)
}

#[tokio::test(start_paused = true)]
async fn batch_aborts_when_bootstrap_check_fails() {
    let store = Arc::new(MemoryStore::new());
    store.add_league(1, "League", &[11, 22]).await;
    store.upsert_gameweek(&gameweek(GW, true, 1)).await.unwrap();
    store.upsert_fixture(&fixture(1, false)).await.unwrap();
    store
        .upsert_manager_history(&ManagerGameweekHistoryRow {
            manager_id: 11,
            gameweek_id: GW,
            gameweek_points: 55,
            total_points: 555,
            ..Default::default()
        })
        .await
        .unwrap();

    let orch = orchestrator(store.clone());
    let succeeded = orch.run_deadline_batch(GW).await.unwrap();
    assert!(!succeeded);

    // The run is recorded as a failure with its reason, and can be retried.
    let runs = store.get_deadline_batch_runs(GW).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].success, Some(false));
    assert_eq!(
        runs[0].phase_breakdown.get("failure_reason").and_then(|v| v.as_str()),
        Some("bootstrap_failed")
    );
    assert!(!store
        .has_successful_deadline_batch_for_gameweek(GW)
        .await
        .unwrap());

    // History was never touched by the aborted batch.
    let row = store.get_manager_history(11, GW).await.unwrap().unwrap();
    assert_eq!(row.gameweek_points, 55);
    assert_eq!(row.total_points, 555);
}

#[tokio::test]
async fn started_fixtures_block_the_batch_window() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_gameweek(&gameweek(GW, true, 2)).await.unwrap();
    store.upsert_fixture(&fixture(1, true)).await.unwrap();
    let orch = orchestrator(store);
    assert!(orch.fixtures_started(GW).await.unwrap());
}

/// The seed path is what the refuse-if-started guard protects: when invoked
/// legitimately (pre-kickoff), it copies baselines forward without erasing
/// points a live refresh already wrote.
#[tokio::test]
async fn seed_preserves_live_points_and_sets_baselines() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_manager_history(&ManagerGameweekHistoryRow {
            manager_id: 7,
            gameweek_id: GW - 1,
            total_points: 480,
            overall_rank: Some(300_000),
            mini_league_rank: Some(4),
            team_value_tenths: Some(1003),
            bank_tenths: Some(12),
            ..Default::default()
        })
        .await
        .unwrap();
    // A live refresh already wrote points for the target gameweek.
    store
        .upsert_manager_history(&ManagerGameweekHistoryRow {
            manager_id: 7,
            gameweek_id: GW,
            gameweek_points: 13,
            total_points: 493,
            ..Default::default()
        })
        .await
        .unwrap();

    let settings = offline_settings();
    let client = Arc::new(FplClient::new(&settings).expect("client builds"));
    let shared: SharedStore = store.clone();
    let managers = ManagerRefresher::new(client, shared);

    let mut meta = HashMap::new();
    meta.insert(
        7i64,
        PicksMeta {
            active_chip: Some("wildcard".to_string()),
            gameweek_rank: Some(1_000_000),
        },
    );
    managers
        .seed_manager_gameweek_history_from_previous(&[7], GW, &meta)
        .await
        .unwrap();

    let row = store.get_manager_history(7, GW).await.unwrap().unwrap();
    assert_eq!(row.baseline_total_points, Some(480));
    assert_eq!(row.previous_overall_rank, Some(300_000));
    assert_eq!(row.previous_mini_league_rank, Some(4));
    assert_eq!(row.team_value_tenths, Some(1003));
    assert_eq!(row.bank_tenths, Some(12));
    assert_eq!(row.active_chip.as_deref(), Some("wildcard"));
    // Live points survive the seed.
    assert_eq!(row.gameweek_points, 13);
    assert_eq!(row.total_points, 493);
}

#[tokio::test]
async fn first_season_gameweek_seeds_minimal_rows() {
    let store = Arc::new(MemoryStore::new());
    let settings = offline_settings();
    let client = Arc::new(FplClient::new(&settings).expect("client builds"));
    let shared: SharedStore = store.clone();
    let managers = ManagerRefresher::new(client, shared);

    managers
        .seed_manager_gameweek_history_from_previous(&[42], 1, &HashMap::new())
        .await
        .unwrap();
    let row = store.get_manager_history(42, 1).await.unwrap().unwrap();
    assert_eq!(row.total_points, 0);
    assert_eq!(row.baseline_total_points, None);
}
