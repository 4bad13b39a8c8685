//! Refresh orchestrator.
//!
//! Detects the refresh state from store contents and the clock, and drives
//! two cooperating loops plus an auxiliary predictions loop:
//!
//! - **Fast loop** (seconds-scale): gameweeks/teams reference refresh, state
//!   detection, fixtures + event-live ingestion during live windows, price
//!   syncing, the transfer-deadline batch.
//! - **Slow loop** (tens of seconds): authoritative cohort history refresh
//!   (rank fetches), matchday baselines, rank finalization probes.
//!
//! The loops share only the rate limiter, the bootstrap cache and the flag
//! block guarded here; everything else flows through the store.

use crate::baselines::BaselineCapture;
use crate::fpl_client::{FplApiError, FplClient};
use crate::managers::{ManagerRefresher, PicksMeta};
use crate::players::{PlayerRefreshOptions, PlayerRefresher};
use crate::settings::Settings;
use crate::store::{SharedStore, Store};
use crate::types::api::{ApiFixture, Bootstrap, EventLive};
use crate::types::domain::{FixtureRow, GameweekRow, RefreshPath, TeamRow};
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, TimeZone,
    Utc};
use futures::future::join_all;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Mutually exclusive refresh states, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    OutsideGameweek,
    PriceWindow,
    LiveMatches,
    BonusPending,
    TransferDeadline,
    Idle,
}

impl RefreshState {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshState::OutsideGameweek => "outside_gameweek",
            RefreshState::PriceWindow => "price_window",
            RefreshState::LiveMatches => "live_matches",
            RefreshState::BonusPending => "bonus_pending",
            RefreshState::TransferDeadline => "transfer_deadline",
            RefreshState::Idle => "idle",
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, RefreshState::LiveMatches | RefreshState::BonusPending)
    }
}

/// Outcome of one state detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDetection {
    pub state: RefreshState,
    /// The gameweek the loops should operate on (the next gameweek is adopted
    /// when its first fixture kicked off before upstream flipped
    /// `is_current`).
    pub gameweek: Option<i32>,
    /// Target gameweek the deadline batch is waiting for.
    pub deadline_target: Option<i32>,
}

/// In-memory flags shared by the loops; guarded by short critical sections
/// and never held across awaits.
#[derive(Debug, Default)]
struct Flags {
    current_state: Option<RefreshState>,
    current_gameweek: Option<i32>,
    deadline_target_gameweek: Option<i32>,
    deadline_refresh_completed: bool,
    last_live_standings: Option<DateTime<Utc>>,
    last_rank_check: Option<DateTime<Utc>>,
    last_rank_check_gameweek: Option<i32>,
    last_hourly_rank_refresh: Option<DateTime<Utc>>,
    catch_up_done_gameweeks: HashSet<i32>,
    post_price_window_refresh_date: Option<NaiveDate>,
    rank_monitor_window_end: Option<DateTime<Utc>>,
    rank_monitor_day_started: Option<NaiveDate>,
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    client: Arc<FplClient>,
    store: SharedStore,
    players: PlayerRefresher,
    managers: ManagerRefresher,
    baselines: BaselineCapture,
    flags: Mutex<Flags>,
    shutdown: watch::Receiver<bool>,
}

/// In progress: at or past kickoff and not provisionally finished, regardless
/// of upstream's `started` flag (detects live at the minute of kickoff).
fn fixture_in_progress(fixture: &FixtureRow, now: DateTime<Utc>) -> bool {
    if fixture.finished_provisional {
        return false;
    }
    if fixture.started {
        return true;
    }
    matches!(fixture.kickoff_at, Some(k) if now >= k)
}

/// The daily price window, evaluated on the configured fixed-offset wall
/// clock (the only local-time concept in the system).
pub fn in_price_change_window(settings: &Settings, now: DateTime<Utc>) -> bool {
    price_window_bounds(settings, now)
        .map(|(start, end)| now >= start && now <= end)
        .unwrap_or(false)
}

/// Past the window but within the cooldown that follows it.
pub fn in_price_window_cooldown(settings: &Settings, now: DateTime<Utc>) -> bool {
    price_window_bounds(settings, now)
        .map(|(_, end)| {
            let cooldown_end = end + ChronoDuration::minutes(settings.price_window_cooldown_minutes);
            now > end && now <= cooldown_end
        })
        .unwrap_or(false)
}

fn price_window_bounds(
    settings: &Settings,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (hour, minute) = settings.parse_price_change_time()?;
    let offset = FixedOffset::east_opt(settings.price_change_utc_offset_hours * 3600)?;
    let local_now = now.with_timezone(&offset);
    let start_local = offset
        .with_ymd_and_hms(
            local_now.date_naive().year(),
            local_now.date_naive().month(),
            local_now.date_naive().day(),
            hour,
            minute,
            0,
        )
        .single()?;
    let start = start_local.with_timezone(&Utc);
    let end = start + ChronoDuration::minutes(settings.price_change_window_duration);
    Some((start, end))
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        client: Arc<FplClient>,
        store: SharedStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let players = PlayerRefresher::new(Arc::clone(&client), Arc::clone(&store));
        let managers = ManagerRefresher::new(Arc::clone(&client), Arc::clone(&store));
        let baselines = BaselineCapture::new(
            Arc::clone(&store),
            settings.matchday_baseline_minutes_before,
            settings.matchday_baseline_minutes_stop_before,
        );
        Self {
            settings,
            client,
            store,
            players,
            managers,
            baselines,
            flags: Mutex::new(Flags::default()),
            shutdown,
        }
    }

    /// Run the fast, slow and predictions loops until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!("Refresh loops started (fast + slow + predictions)");
        tokio::join!(
            self.run_fast_loop(),
            self.run_slow_loop(),
            self.run_predictions_loop(),
        );
        info!("Refresh loops stopped");
        Ok(())
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep, waking early on shutdown. Returns true when shutting down.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.shutting_down(),
            _ = shutdown.changed() => true,
        }
    }

    /// The tracked cohort: every mini-league member plus the configured
    /// required managers.
    async fn cohort(&self) -> Result<Vec<i64>> {
        let mut ids = self.store.get_tracked_manager_ids().await?;
        for required in self.settings.required_manager_ids() {
            if !ids.contains(&required) {
                ids.push(required);
            }
        }
        Ok(ids)
    }

    fn current_gameweek(&self) -> Option<i32> {
        self.flags.lock().expect("flags lock").current_gameweek
    }

    fn current_state(&self) -> Option<RefreshState> {
        self.flags.lock().expect("flags lock").current_state
    }

    // ----- state detection -------------------------------------------------

    /// Detect the refresh state from store contents at `now`.
    pub async fn detect_state(&self, now: DateTime<Utc>) -> Result<StateDetection> {
        let Some(current) = self.store.get_current_gameweek().await? else {
            return Ok(StateDetection {
                state: RefreshState::OutsideGameweek,
                gameweek: None,
                deadline_target: None,
            });
        };

        // The six-minute price window is time-critical and wins over live.
        if in_price_change_window(&self.settings, now) {
            return Ok(StateDetection {
                state: RefreshState::PriceWindow,
                gameweek: Some(current.id),
                deadline_target: None,
            });
        }

        // Fixtures for the current and next gameweek, so the first kickoff of
        // the next gameweek is detected even before upstream flips
        // `is_current`.
        let next = self.store.get_next_gameweek().await?;
        let mut fixtures = self.store.get_fixtures_for_gameweek(current.id).await?;
        let fixtures_current_len = fixtures.len();
        if let Some(next_gw) = &next {
            fixtures.extend(self.store.get_fixtures_for_gameweek(next_gw.id).await?);
        }
        let (fixtures_current, fixtures_next) = fixtures.split_at(fixtures_current_len);

        if let Some(live) = fixtures
            .iter()
            .find(|f| fixture_in_progress(f, now))
        {
            let gameweek = if fixtures_next.iter().any(|f| f.id == live.id) {
                let next_id = next.as_ref().map(|g| g.id).unwrap_or(current.id);
                info!(
                    gameweek = next_id,
                    "Live match in next gameweek; adopting it as current"
                );
                next_id
            } else {
                current.id
            };
            return Ok(StateDetection {
                state: RefreshState::LiveMatches,
                gameweek: Some(gameweek),
                deadline_target: None,
            });
        }

        if !fixtures_current.is_empty()
            && fixtures_current
                .iter()
                .all(|f| f.finished_provisional && !f.finished)
        {
            return Ok(StateDetection {
                state: RefreshState::BonusPending,
                gameweek: Some(current.id),
                deadline_target: None,
            });
        }

        if let Some(target) = self
            .deadline_target(&current, next.as_ref(), now)
            .await?
        {
            return Ok(StateDetection {
                state: RefreshState::TransferDeadline,
                gameweek: Some(current.id),
                deadline_target: Some(target),
            });
        }

        Ok(StateDetection {
            state: RefreshState::Idle,
            gameweek: Some(current.id),
            deadline_target: None,
        })
    }

    /// A gameweek whose deadline passed long enough ago (past the upstream
    /// freeze) with no successful batch yet, and none of its fixtures
    /// started. The next gameweek is checked first, then the current one
    /// (crash recovery when the flip happened while we were down).
    async fn deadline_target(
        &self,
        current: &GameweekRow,
        next: Option<&GameweekRow>,
        now: DateTime<Utc>,
    ) -> Result<Option<i32>> {
        let delay = ChronoDuration::minutes(self.settings.deadline_entry_delay_minutes);
        let completed_target = {
            let flags = self.flags.lock().expect("flags lock");
            flags
                .deadline_refresh_completed
                .then_some(flags.deadline_target_gameweek)
                .flatten()
        };

        let mut candidates: Vec<&GameweekRow> = Vec::new();
        if let Some(next_gw) = next {
            candidates.push(next_gw);
        }
        candidates.push(current);

        for gw in candidates {
            let Some(deadline) = gw.deadline_at else {
                continue;
            };
            if now - deadline < delay {
                continue;
            }
            if completed_target == Some(gw.id) {
                continue;
            }
            if self
                .store
                .has_successful_deadline_batch_for_gameweek(gw.id)
                .await?
            {
                continue;
            }
            if self.fixtures_started(gw.id).await? {
                continue;
            }
            info!(
                target_gameweek = gw.id,
                "Entering TRANSFER_DEADLINE: watching for GW to become is_current"
            );
            return Ok(Some(gw.id));
        }
        Ok(None)
    }

    pub async fn fixtures_started(&self, gameweek: i32) -> Result<bool> {
        Ok(self
            .store
            .get_fixtures_for_gameweek(gameweek)
            .await?
            .iter()
            .any(|f| f.started))
    }

    /// Apply a detection result to the shared flags, logging transitions and
    /// resetting per-window tracking when a window closes.
    fn apply_state(&self, detection: &StateDetection) {
        let mut flags = self.flags.lock().expect("flags lock");
        let previous = flags.current_state;
        if previous != Some(detection.state) {
            info!(
                from = previous.map(|s| s.as_str()).unwrap_or("startup"),
                to = detection.state.as_str(),
                "State transition"
            );
            if previous.map(|s| s.is_live()).unwrap_or(false) && !detection.state.is_live() {
                flags.last_live_standings = None;
            }
            if previous == Some(RefreshState::TransferDeadline)
                && detection.state != RefreshState::TransferDeadline
            {
                debug!(
                    refresh_done = flags.deadline_refresh_completed,
                    "Exiting deadline state"
                );
                flags.deadline_refresh_completed = false;
                flags.deadline_target_gameweek = None;
            }
        }
        flags.current_state = Some(detection.state);
        if detection.gameweek.is_some() {
            flags.current_gameweek = detection.gameweek;
        }
        if let Some(target) = detection.deadline_target {
            flags.deadline_target_gameweek = Some(target);
        }
    }

    // ----- fast loop -------------------------------------------------------

    async fn run_fast_loop(&self) {
        while !self.shutting_down() {
            if let Err(e) = self.fast_cycle().await {
                error!(error = %e, "Fast cycle failed");
            }
            let state = self.current_state().unwrap_or(RefreshState::Idle);
            let sleep = match state {
                RefreshState::TransferDeadline => {
                    Duration::from_secs(self.settings.fast_loop_interval_deadline)
                }
                RefreshState::LiveMatches | RefreshState::BonusPending => {
                    Duration::from_secs(self.settings.fast_loop_interval_live)
                }
                RefreshState::PriceWindow => {
                    Duration::from_secs(self.settings.prices_refresh_interval_window)
                }
                _ => Duration::from_secs(self.idle_sleep_seconds().await),
            };
            if self.sleep_or_shutdown(sleep).await {
                break;
            }
        }
        info!("Fast loop stopped");
    }

    async fn fast_cycle(&self) -> Result<()> {
        let heartbeat = self.store.insert_refresh_event(RefreshPath::Fast).await;
        if let Err(e) = heartbeat {
            debug!(error = %e, "Fast heartbeat insert failed");
        }

        // Phase 1: reference data, then state detection.
        let bootstrap = match self.refresh_gameweeks_and_teams().await {
            Ok(b) => Some(b),
            Err(e) => {
                error!(error = %e, "Gameweeks refresh failed");
                None
            }
        };
        let detection = self.detect_state(Utc::now()).await?;
        self.apply_state(&detection);

        if let Some(bootstrap) = &bootstrap {
            if let Err(e) = self.players.sync_players_ownership_from_bootstrap(bootstrap).await {
                warn!(error = %e, "Player ownership sync failed");
            }
            if let Some(gameweek) = self.current_gameweek() {
                if let Err(e) = self
                    .players
                    .sync_player_prices_from_bootstrap(bootstrap, gameweek)
                    .await
                {
                    warn!(error = %e, "Player price sync failed");
                }
            }
        }

        // Phases 2-3: fixtures and players; live path runs scoreboard +
        // standings, non-live path runs the bonus catch-up.
        let state = self.current_state().unwrap_or(RefreshState::Idle);
        let mut fixtures_by_id: Option<HashMap<i64, ApiFixture>> = None;
        if state.is_live() {
            if let (Some(bootstrap), Some(gameweek)) = (&bootstrap, self.current_gameweek()) {
                fixtures_by_id = Some(self.live_fast_path(bootstrap, gameweek).await?);
            }
        } else {
            fixtures_by_id = match self.refresh_fixtures().await {
                Ok(f) => f,
                Err(e) => {
                    error!(error = %e, "Fixtures refresh failed");
                    None
                }
            };
            // Re-detect so the cycle that observes `started=true` enters the
            // live path immediately instead of one cycle late.
            let redetected = self.detect_state(Utc::now()).await?;
            self.apply_state(&redetected);
            if let (Some(bootstrap), Some(fixtures)) = (&bootstrap, &fixtures_by_id) {
                self.run_catch_up_player_refresh(bootstrap, fixtures).await;
            }
        }

        if let Err(e) = self.store.insert_refresh_event(RefreshPath::Fast).await {
            debug!(error = %e, "Fast heartbeat insert failed");
        }

        let state = self.current_state().unwrap_or(RefreshState::Idle);
        if state == RefreshState::PriceWindow {
            if let Err(e) = self.refresh_prices_in_window().await {
                warn!(error = %e, "Price window refresh failed");
            }
        }

        let now = Utc::now();
        self.post_price_window_cooldown(now).await;
        self.rank_monitor(&fixtures_by_id, now).await;

        let mut batch_ran = false;
        if state == RefreshState::TransferDeadline {
            batch_ran = self.maybe_run_deadline_batch().await?;
        }

        // Phase 4: aggregates for non-live states; the live path refreshed
        // its subset already and the batch refreshed everything.
        if !state.is_live() && !batch_ran {
            if let Err(e) = self.store.refresh_all_materialized_views().await {
                error!(error = %e, "Materialized views refresh failed");
            }
        }
        Ok(())
    }

    async fn refresh_gameweeks_and_teams(&self) -> Result<Arc<Bootstrap>> {
        let bootstrap = self.client.bootstrap(true).await?;
        for event in &bootstrap.events {
            self.store
                .upsert_gameweek(&GameweekRow {
                    id: event.id,
                    name: event.name.clone(),
                    deadline_at: event.deadline_time,
                    release_at: event.release_time,
                    is_current: event.is_current,
                    is_previous: event.is_previous,
                    is_next: event.is_next,
                    finished: event.finished,
                    data_checked: event.data_checked,
                    ranks_finalized: false,
                    highest_score: event.highest_score,
                    average_entry_score: event.average_entry_score,
                })
                .await?;
        }
        if let Some(total) = bootstrap.total_players {
            self.store.upsert_total_players(total).await?;
        }
        for team in &bootstrap.teams {
            self.store
                .upsert_team(&TeamRow {
                    id: team.id,
                    name: team.name.clone(),
                    short_name: team.short_name.clone(),
                    strength: team.strength,
                    strength_overall_home: team.strength_overall_home,
                    strength_overall_away: team.strength_overall_away,
                    strength_attack_home: team.strength_attack_home,
                    strength_attack_away: team.strength_attack_away,
                    strength_defence_home: team.strength_defence_home,
                    strength_defence_away: team.strength_defence_away,
                })
                .await?;
        }
        debug!(gameweeks = bootstrap.events.len(), "Refreshed gameweeks");
        Ok(bootstrap)
    }

    /// Upsert raw upstream fixtures for the given gameweeks; returns the
    /// current gameweek's fixtures keyed by FPL fixture id.
    async fn apply_fixtures(
        &self,
        fixtures: Vec<ApiFixture>,
        gameweeks: &[i32],
    ) -> Result<HashMap<i64, ApiFixture>> {
        let current = self.current_gameweek();
        let mut current_by_id = HashMap::new();
        for fixture in fixtures {
            let Some(event) = fixture.event else {
                continue;
            };
            if !gameweeks.contains(&event) {
                continue;
            }
            self.store
                .upsert_fixture(&FixtureRow {
                    id: fixture.id,
                    gameweek_id: fixture.event,
                    home_team_id: fixture.team_h,
                    away_team_id: fixture.team_a,
                    kickoff_at: fixture.kickoff_time,
                    started: fixture.started.unwrap_or(false),
                    finished: fixture.finished,
                    finished_provisional: fixture.finished_provisional,
                    minutes: fixture.minutes,
                    home_score: fixture.team_h_score,
                    away_score: fixture.team_a_score,
                })
                .await?;
            if Some(event) == current {
                current_by_id.insert(fixture.id, fixture);
            }
        }
        Ok(current_by_id)
    }

    async fn gameweeks_to_refresh(&self) -> Result<Vec<i32>> {
        let mut ids = Vec::new();
        if let Some(current) = self.current_gameweek() {
            ids.push(current);
        }
        if let Some(next) = self.store.get_next_gameweek().await? {
            if !ids.contains(&next.id) {
                ids.push(next.id);
            }
        }
        Ok(ids)
    }

    async fn refresh_fixtures(&self) -> Result<Option<HashMap<i64, ApiFixture>>> {
        let fixtures = self.client.fixtures().await?;
        let gameweeks = self.gameweeks_to_refresh().await?;
        Ok(Some(self.apply_fixtures(fixtures, &gameweeks).await?))
    }

    /// Live fast path: fixtures and event-live fetched in parallel, scoreboard
    /// written immediately, player stats refreshed from the live payload, and
    /// the throttled live-standings pass on top.
    async fn live_fast_path(
        &self,
        bootstrap: &Arc<Bootstrap>,
        gameweek: i32,
    ) -> Result<HashMap<i64, ApiFixture>> {
        let (fixtures_result, live_result) =
            tokio::join!(self.client.fixtures(), self.client.event_live(gameweek));
        let fixtures_list = match fixtures_result {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "Parallel fixtures fetch failed");
                Vec::new()
            }
        };
        let live_data = match live_result {
            Ok(l) => Some(l),
            Err(e) => {
                warn!(error = %e, "Parallel event-live fetch failed");
                None
            }
        };

        let gameweeks = self.gameweeks_to_refresh().await?;
        let fixtures_by_id = self.apply_fixtures(fixtures_list, &gameweeks).await?;

        if let Some(live) = &live_data {
            self.update_fixture_scores_from_live(live, bootstrap, &fixtures_by_id)
                .await;
            if let Err(e) = self
                .refresh_live_players(gameweek, live, &fixtures_by_id, bootstrap)
                .await
            {
                error!(error = %e, "Player refresh failed");
            }
        }

        self.live_standings_pass(gameweek, live_data.as_ref(), &fixtures_by_id, bootstrap)
            .await;
        Ok(fixtures_by_id)
    }

    /// Scoreboard from event-live: scores only when both are present
    /// (DGW-safe); minutes as the max of the upstream clock, the highest
    /// player minutes and wall-clock elapsed since kickoff (capped at 120).
    async fn update_fixture_scores_from_live(
        &self,
        live: &EventLive,
        bootstrap: &Bootstrap,
        fixtures_by_id: &HashMap<i64, ApiFixture>,
    ) {
        let now = Utc::now();
        let player_team: HashMap<i64, i64> =
            bootstrap.elements.iter().map(|e| (e.id, e.team)).collect();

        for (fixture_id, fixture) in fixtures_by_id {
            let mut max_player_minutes = 0;
            for elem in &live.elements {
                if let Some(team) = player_team.get(&elem.id) {
                    if (*team == fixture.team_h || *team == fixture.team_a)
                        && elem.stats.minutes > max_player_minutes
                    {
                        max_player_minutes = elem.stats.minutes;
                    }
                }
            }
            let elapsed = fixture
                .kickoff_time
                .filter(|k| now >= *k)
                .map(|k| ((now - k).num_minutes().min(120)) as i32)
                .unwrap_or(0);
            let minutes = fixture.minutes.max(max_player_minutes).max(elapsed);

            let (home, away) = match (fixture.team_h_score, fixture.team_a_score) {
                (Some(h), Some(a)) => (Some(h), Some(a)),
                _ => (None, None),
            };
            if let Err(e) = self
                .store
                .update_fixture_scores(
                    *fixture_id,
                    home,
                    away,
                    (minutes > 0).then_some(minutes),
                )
                .await
            {
                warn!(fixture_id, error = %e, "Fixture score update failed");
            }
        }
    }

    /// Players worth refreshing during live: minutes in the live payload, an
    /// existing stats row this gameweek, or membership in any tracked squad.
    async fn refresh_live_players(
        &self,
        gameweek: i32,
        live: &EventLive,
        fixtures_by_id: &HashMap<i64, ApiFixture>,
        bootstrap: &Bootstrap,
    ) -> Result<()> {
        let mut active: HashSet<i64> = live
            .elements
            .iter()
            .filter(|e| e.stats.minutes > 0)
            .map(|e| e.id)
            .collect();
        active.extend(self.store.get_player_ids_with_stats(gameweek).await?);
        let cohort = self.cohort().await?;
        for pick in self.store.get_picks_for_managers(gameweek, &cohort).await? {
            active.insert(pick.player_id);
        }
        if active.is_empty() {
            return Ok(());
        }
        self.players
            .refresh_player_stats(
                gameweek,
                &active,
                Some(live),
                Some(fixtures_by_id),
                Some(bootstrap),
                PlayerRefreshOptions {
                    live_only: true,
                    expect_live_unavailable: false,
                },
            )
            .await
    }

    /// Throttled live standings: cohort points, league ranks, and the live
    /// aggregate subset — the latter only when every manager updated
    /// successfully, so clients never observe a mixed cohort.
    async fn live_standings_pass(
        &self,
        gameweek: i32,
        live: Option<&EventLive>,
        fixtures_by_id: &HashMap<i64, ApiFixture>,
        bootstrap: &Bootstrap,
    ) {
        let now = Utc::now();
        let interval = self.settings.live_standings_in_fast_interval as i64;
        {
            let flags = self.flags.lock().expect("flags lock");
            if let Some(last) = flags.last_live_standings {
                if (now - last).num_seconds() < interval {
                    return;
                }
            }
        }

        let result: Result<()> = async {
            let cohort = self.cohort().await?;
            if cohort.is_empty() {
                return Ok(());
            }
            let all_updated = match live {
                Some(live) => {
                    info!(gameweek, managers = cohort.len(), "Manager points from live data");
                    self.managers
                        .refresh_manager_points_from_live_data(
                            &cohort,
                            gameweek,
                            live,
                            fixtures_by_id,
                            bootstrap,
                        )
                        .await?
                }
                None => {
                    info!(gameweek, managers = cohort.len(), "Manager points from store");
                    self.managers
                        .refresh_manager_points_live_only(&cohort, gameweek)
                        .await?
                }
            };

            if self.fixtures_started(gameweek).await? {
                for league_id in self.store.get_league_ids().await? {
                    if let Err(e) = self
                        .managers
                        .calculate_mini_league_ranks(league_id, gameweek)
                        .await
                    {
                        error!(league_id, gameweek, error = %e, "League ranks failed");
                    }
                }
            }

            if all_updated {
                self.store.refresh_materialized_views_for_live().await?;
            } else {
                warn!(gameweek, "Partial manager update; skipping standings aggregate");
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(gameweek, error = %e, "Live standings update failed");
        }

        self.flags.lock().expect("flags lock").last_live_standings = Some(now);
    }

    /// Non-live catch-up: once fixtures finish, pull confirmed bonus through
    /// element-summary until no provisional row remains for the gameweek.
    async fn run_catch_up_player_refresh(
        &self,
        bootstrap: &Arc<Bootstrap>,
        fixtures_by_id: &HashMap<i64, ApiFixture>,
    ) {
        let Some(gameweek) = self.current_gameweek() else {
            return;
        };
        {
            let flags = self.flags.lock().expect("flags lock");
            if flags.catch_up_done_gameweeks.contains(&gameweek) {
                return;
            }
        }
        if !fixtures_by_id
            .values()
            .any(|f| f.finished || f.finished_provisional)
        {
            return;
        }

        let result: Result<()> = async {
            let mut player_ids: Vec<i64> =
                self.store.get_player_ids_with_stats(gameweek).await?;
            if player_ids.is_empty() {
                // Nothing collected live (service was down): backfill every
                // player in teams with a finished fixture so BPS is complete.
                let team_ids: Vec<i64> = fixtures_by_id
                    .values()
                    .filter(|f| f.finished || f.finished_provisional)
                    .flat_map(|f| [f.team_h, f.team_a])
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                player_ids = self.store.get_player_ids_for_teams(&team_ids).await?;
                if player_ids.is_empty() {
                    return Ok(());
                }
                info!(
                    gameweek,
                    players = player_ids.len(),
                    "Catch-up backfill for all players in finished fixtures"
                );
            } else {
                info!(
                    gameweek,
                    players = player_ids.len(),
                    "Catch-up player refresh for confirmed bonus"
                );
            }

            let ids: HashSet<i64> = player_ids.into_iter().collect();
            self.players
                .refresh_player_stats(
                    gameweek,
                    &ids,
                    None,
                    Some(fixtures_by_id),
                    Some(bootstrap.as_ref()),
                    PlayerRefreshOptions {
                        live_only: true,
                        expect_live_unavailable: true,
                    },
                )
                .await?;

            if !self.store.has_provisional_bonus(gameweek).await? {
                self.flags
                    .lock()
                    .expect("flags lock")
                    .catch_up_done_gameweeks
                    .insert(gameweek);
                info!(gameweek, "Catch-up done: no player has provisional bonus");
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(gameweek, error = %e, "Catch-up player refresh failed");
        }
    }

    /// In the price window, a fresh (uncached) bootstrap is the point: the
    /// cached snapshot could hide the very changes the window exists for.
    async fn refresh_prices_in_window(&self) -> Result<()> {
        let Some(gameweek) = self.current_gameweek() else {
            return Ok(());
        };
        let fresh = self.client.bootstrap(false).await?;
        self.players.sync_players_ownership_from_bootstrap(&fresh).await?;
        self.players
            .sync_player_prices_from_bootstrap(&fresh, gameweek)
            .await
    }

    /// Once per day after the price window closes: clear the predictive table
    /// and refresh the cohort so post-change team values land.
    async fn post_price_window_cooldown(&self, now: DateTime<Utc>) {
        if !in_price_window_cooldown(&self.settings, now) {
            return;
        }
        let today = now.date_naive();
        {
            let mut flags = self.flags.lock().expect("flags lock");
            if flags.post_price_window_refresh_date == Some(today) {
                return;
            }
            flags.post_price_window_refresh_date = Some(today);
        }
        info!("Post-price-window cooldown: refreshing cohort for team values");
        if let Err(e) = self.store.clear_price_change_predictions().await {
            warn!(error = %e, "Clearing price change predictions failed");
        }
        if let Err(e) = self.refresh_manager_points(true).await {
            warn!(error = %e, "Post-price-window manager refresh failed");
        }
    }

    /// After the last fixture of the UTC day finishes, poll upstream for rank
    /// updates for a few hours (upstream publishes them at undocumented
    /// times).
    async fn rank_monitor(
        &self,
        fixtures_by_id: &Option<HashMap<i64, ApiFixture>>,
        now: DateTime<Utc>,
    ) {
        let Some(fixtures) = fixtures_by_id else {
            return;
        };
        let Some(gameweek) = self.current_gameweek() else {
            return;
        };

        if last_match_of_day_finished(fixtures.values(), now) {
            let today = now.date_naive();
            let mut flags = self.flags.lock().expect("flags lock");
            if flags.rank_monitor_day_started != Some(today) {
                flags.rank_monitor_day_started = Some(today);
                flags.rank_monitor_window_end = Some(
                    now + ChronoDuration::hours(
                        self.settings.rank_monitor_hours_after_last_matchday,
                    ),
                );
                info!(gameweek, "Rank monitor window started");
            }
        }

        let should_check = {
            let mut flags = self.flags.lock().expect("flags lock");
            match flags.rank_monitor_window_end {
                Some(end) if now >= end => {
                    flags.rank_monitor_window_end = None;
                    flags.rank_monitor_day_started = None;
                    false
                }
                Some(_) => match flags.last_rank_check {
                    Some(last) => {
                        (now - last).num_seconds()
                            >= self.settings.rank_monitor_interval_seconds as i64
                    }
                    None => true,
                },
                None => false,
            }
        };
        if should_check {
            if let Err(e) = self.check_fpl_rank_change_and_refresh(gameweek, true).await {
                warn!(gameweek, error = %e, "Rank monitor check failed");
            }
        }
    }

    // ----- deadline batch --------------------------------------------------

    /// Run the deadline batch when the target gameweek has become current and
    /// no successful batch exists for it. Returns whether a batch ran.
    async fn maybe_run_deadline_batch(&self) -> Result<bool> {
        let Some(current) = self.store.get_current_gameweek().await? else {
            warn!("No current gameweek for deadline check");
            return Ok(false);
        };
        let (target, completed) = {
            let flags = self.flags.lock().expect("flags lock");
            (
                flags.deadline_target_gameweek,
                flags.deadline_refresh_completed,
            )
        };
        let Some(target) = target else {
            return Ok(false);
        };
        if current.id != target {
            debug!(
                target_gameweek = target,
                current_gameweek = current.id,
                "Waiting for target GW to become current"
            );
            return Ok(false);
        }
        if completed {
            return Ok(false);
        }
        if self
            .store
            .has_successful_deadline_batch_for_gameweek(target)
            .await?
        {
            info!(gameweek = target, "Deadline batch already completed, skipping");
            self.flags.lock().expect("flags lock").deadline_refresh_completed = true;
            return Ok(false);
        }

        self.flags.lock().expect("flags lock").current_gameweek = Some(target);
        let succeeded = self.run_deadline_batch(target).await?;
        if succeeded {
            self.wait_for_new_gameweek_release().await;
        }
        Ok(succeeded)
    }

    /// The one-shot post-deadline batch, each phase timed and recorded.
    /// Returns true on success.
    pub async fn run_deadline_batch(&self, target_gameweek: i32) -> Result<bool> {
        let cohort = self.cohort().await?;
        let leagues = self.store.get_league_ids().await?;
        let run_id = self.store.insert_deadline_batch_start(target_gameweek).await?;
        let started = Utc::now();
        let mut phase = serde_json::Map::new();
        info!(
            gameweek = target_gameweek,
            managers = cohort.len(),
            leagues = leagues.len(),
            "Running deadline batch"
        );

        // Phase 1: bootstrap check (two attempts, 30 s apart).
        let t0 = Utc::now();
        let bootstrap_ok = self.short_bootstrap_check().await;
        phase.insert(
            "bootstrap_check_sec".into(),
            json!(seconds_since(t0)),
        );
        if !bootstrap_ok {
            return self
                .finish_batch_failure(run_id, target_gameweek, started, &cohort, &leagues, phase,
                    "bootstrap_failed")
                .await;
        }
        if cohort.is_empty() {
            warn!(gameweek = target_gameweek, "No managers for deadline batch");
            return self
                .finish_batch_failure(run_id, target_gameweek, started, &cohort, &leagues, phase,
                    "no_managers")
                .await;
        }

        // Phase 2: settle so the transfers endpoint catches up.
        let settle = Duration::from_secs(self.settings.post_deadline_settle_seconds.min(60));
        if !settle.is_zero() {
            info!(settle_seconds = settle.as_secs(), "Settling before deadline batch");
            tokio::time::sleep(settle).await;
        }
        phase.insert("settle_sec".into(), json!(settle.as_secs()));

        // Phase 3: picks + transfers per manager, in bounded batches.
        let t1 = Utc::now();
        let shared_bootstrap = match self.client.bootstrap(true).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Shared bootstrap fetch failed");
                return self
                    .finish_batch_failure(run_id, target_gameweek, started, &cohort, &leagues,
                        phase, "bootstrap_failed")
                    .await;
            }
        };
        let mut picks_meta: HashMap<i64, PicksMeta> = HashMap::new();
        let mut failed: HashSet<i64> = HashSet::new();
        let batch_size = self.settings.deadline_batch_size;
        let batch_sleep = Duration::from_secs_f64(self.settings.deadline_batch_sleep_seconds);
        for batch in cohort.chunks(batch_size) {
            let results = join_all(batch.iter().map(|manager_id| {
                let bootstrap = Arc::clone(&shared_bootstrap);
                async move {
                    let (picks, transfers) = tokio::join!(
                        self.managers.refresh_picks(*manager_id, target_gameweek),
                        self.managers
                            .refresh_transfers(*manager_id, target_gameweek, &bootstrap),
                    );
                    (*manager_id, picks, transfers)
                }
            }))
            .await;
            for (manager_id, picks, transfers) in results {
                match picks {
                    Ok(meta) => {
                        picks_meta.insert(manager_id, meta);
                    }
                    Err(e) => {
                        failed.insert(manager_id);
                        error!(manager_id, gameweek = target_gameweek, error = %e,
                            "Manager picks failed in deadline batch");
                    }
                }
                if let Err(e) = transfers {
                    failed.insert(manager_id);
                    error!(manager_id, gameweek = target_gameweek, error = %e,
                        "Manager transfers failed in deadline batch");
                }
            }
            if !batch_sleep.is_zero() && batch.len() == batch_size {
                tokio::time::sleep(batch_sleep).await;
            }
            if self.shutting_down() {
                break;
            }
        }
        let success_count = cohort.len() - failed.len();
        let success_rate = (success_count as f64 / cohort.len() as f64) * 100.0;
        phase.insert("picks_and_transfers_sec".into(), json!(seconds_since(t1)));
        if success_rate < 80.0 {
            phase.insert("success_rate".into(), json!((success_rate * 10.0).round() / 10.0));
            error!(
                gameweek = target_gameweek,
                success_rate, "Deadline batch failed (success rate below 80%)"
            );
            return self
                .finish_batch_failure(run_id, target_gameweek, started, &cohort, &leagues, phase,
                    "success_rate_below_80")
                .await;
        }

        // Phase 4: refuse when any fixture started — the seed path would zero
        // live points; the live path owns them now.
        if self.fixtures_started(target_gameweek).await? {
            error!(
                gameweek = target_gameweek,
                "Deadline batch aborted: fixtures have started"
            );
            return self
                .finish_batch_failure(run_id, target_gameweek, started, &cohort, &leagues, phase,
                    "fixtures_started")
                .await;
        }

        // Phase 5: seed history and league ranks.
        let t2 = Utc::now();
        self.managers
            .seed_manager_gameweek_history_from_previous(&cohort, target_gameweek, &picks_meta)
            .await?;
        for league_id in &leagues {
            if let Err(e) = self
                .managers
                .calculate_mini_league_ranks(*league_id, target_gameweek)
                .await
            {
                warn!(league_id, error = %e, "Mini league ranks failed");
            }
        }
        phase.insert("history_seed_sec".into(), json!(seconds_since(t2)));

        // Phase 6: gameweek baselines, cohort-wide.
        let t3 = Utc::now();
        if let Err(e) = self
            .baselines
            .capture_all_baselines_for_gameweek(target_gameweek, &cohort)
            .await
        {
            warn!(gameweek = target_gameweek, error = %e, "Baseline capture failed");
        }
        phase.insert("baselines_sec".into(), json!(seconds_since(t3)));

        // Phase 7: per-league owned-player whitelist.
        let t4 = Utc::now();
        for league_id in &leagues {
            if let Err(e) = self
                .managers
                .build_player_whitelist(*league_id, target_gameweek)
                .await
            {
                error!(league_id, error = %e, "Player whitelist failed");
            }
        }
        phase.insert("whitelist_sec".into(), json!(seconds_since(t4)));

        // Phase 8: aggregates.
        let t5 = Utc::now();
        if let Err(e) = self.store.refresh_all_materialized_views().await {
            error!(error = %e, "Materialized views refresh failed");
        }
        phase.insert("materialized_views_sec".into(), json!(seconds_since(t5)));

        let finished = Utc::now();
        self.store
            .update_deadline_batch_finish(
                run_id,
                finished,
                true,
                cohort.len() as i32,
                leagues.len() as i32,
                serde_json::Value::Object(phase.clone()),
            )
            .await?;
        self.flags.lock().expect("flags lock").deadline_refresh_completed = true;
        info!(
            gameweek = target_gameweek,
            duration_sec = seconds_since(started),
            success_count,
            "Deadline batch completed"
        );
        Ok(true)
    }

    async fn finish_batch_failure(
        &self,
        run_id: i64,
        gameweek: i32,
        started: DateTime<Utc>,
        cohort: &[i64],
        leagues: &[i64],
        mut phase: serde_json::Map<String, serde_json::Value>,
        reason: &str,
    ) -> Result<bool> {
        phase.insert("failure_reason".into(), json!(reason));
        self.store
            .update_deadline_batch_finish(
                run_id,
                Utc::now(),
                false,
                cohort.len() as i32,
                leagues.len() as i32,
                serde_json::Value::Object(phase),
            )
            .await?;
        // A sub-80% success rate still closes the window; guard failures
        // (phases 1-4) leave it open for a retry next cycle.
        if reason == "success_rate_below_80" {
            self.flags.lock().expect("flags lock").deadline_refresh_completed = true;
        }
        warn!(gameweek, reason, duration_sec = seconds_since(started), "Deadline batch failed");
        Ok(false)
    }

    /// Quick upstream responsiveness probe before the batch: two attempts,
    /// thirty seconds apart.
    async fn short_bootstrap_check(&self) -> bool {
        match self.client.bootstrap(false).await {
            Ok(_) => true,
            Err(first) => {
                info!(error = %first, "Bootstrap check failed, retrying once in 30s");
                tokio::time::sleep(Duration::from_secs(30)).await;
                match self.client.bootstrap(false).await {
                    Ok(_) => true,
                    Err(second) => {
                        warn!(error = %second, "Bootstrap check failed again, skipping batch");
                        false
                    }
                }
            }
        }
    }

    /// After a successful batch, wait for upstream to release the next
    /// gameweek: sleep until `release_at` when it is known and in the future
    /// (capped at an hour), then poll bootstrap until `is_current` flips.
    async fn wait_for_new_gameweek_release(&self) {
        let next = match self.store.get_next_gameweek().await {
            Ok(Some(next)) => next,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "No next gameweek for release wait");
                return;
            }
        };
        let now = Utc::now();
        if let Some(release) = next.release_at {
            if release > now {
                let wait = (release - now)
                    .to_std()
                    .unwrap_or(Duration::from_secs(0))
                    .min(Duration::from_secs(3600));
                info!(
                    next_gameweek = next.id,
                    wait_seconds = wait.as_secs(),
                    "Waiting for FPL gameweek release"
                );
                if self.sleep_or_shutdown(wait).await {
                    return;
                }
            }
        }

        const MAX_POLLS: u32 = 30;
        for attempt in 1..=MAX_POLLS {
            if let Err(e) = self.refresh_gameweeks_and_teams().await {
                debug!(error = %e, attempt, "Release poll refresh failed");
            }
            match self.store.get_gameweek(next.id).await {
                Ok(Some(gw)) if gw.is_current => {
                    info!(gameweek = next.id, attempt, "New gameweek is current after release");
                    return;
                }
                _ => {}
            }
            if attempt < MAX_POLLS && self.sleep_or_shutdown(Duration::from_secs(60)).await {
                return;
            }
        }
        warn!(next_gameweek = next.id, "New gameweek still not current after polling");
    }

    // ----- slow loop -------------------------------------------------------

    async fn run_slow_loop(&self) {
        while !self.shutting_down() {
            if let Err(e) = self.slow_cycle().await {
                error!(error = %e, "Slow loop iteration failed");
            }
            let live = self
                .current_state()
                .map(|s| s.is_live())
                .unwrap_or(false);
            let sleep = if live {
                Duration::from_secs(self.settings.full_refresh_interval_live)
            } else {
                Duration::from_secs(self.settings.slow_loop_interval_idle)
            };
            if self.sleep_or_shutdown(sleep).await {
                break;
            }
        }
        info!("Slow loop stopped");
    }

    async fn slow_cycle(&self) -> Result<()> {
        if let Err(e) = self.store.insert_refresh_event(RefreshPath::Slow).await {
            debug!(error = %e, "Slow heartbeat insert failed");
        }
        let state = self.current_state().unwrap_or(RefreshState::Idle);
        let gameweek = self.current_gameweek();

        if state.is_live() {
            // Authoritative pass: history (with rank fetches) then the live
            // aggregate subset.
            if let Err(e) = self.refresh_manager_points(false).await {
                error!(error = %e, "Manager points refresh failed");
            }
            if let Err(e) = self.store.refresh_materialized_views_for_live().await {
                error!(error = %e, "Materialized views refresh failed");
            }
        } else if let Some(gameweek) = gameweek {
            // Hourly cohort rank refresh: upstream updates ranks at
            // undocumented times.
            let now = Utc::now();
            let due = {
                let flags = self.flags.lock().expect("flags lock");
                flags
                    .last_hourly_rank_refresh
                    .map(|last| {
                        (now - last).num_seconds()
                            >= self.settings.hourly_rank_refresh_interval as i64
                    })
                    .unwrap_or(true)
            };
            if due {
                info!(gameweek, "Hourly rank refresh for all managers");
                match self.refresh_manager_points(true).await {
                    Ok(()) => {
                        self.flags.lock().expect("flags lock").last_hourly_rank_refresh =
                            Some(now);
                    }
                    Err(e) => warn!(gameweek, error = %e, "Hourly rank refresh failed"),
                }
            }

            // Matchday baseline capture when inside the pre-kickoff window.
            match self
                .baselines
                .next_matchday_for_capture(gameweek, Utc::now())
                .await
            {
                Ok(Some(matchday)) => {
                    let cohort = self.cohort().await?;
                    if let Err(e) = self
                        .baselines
                        .capture_matchday_baselines(gameweek, &matchday, &cohort)
                        .await
                    {
                        warn!(gameweek, error = %e, "Matchday baseline capture failed");
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(gameweek, error = %e, "Matchday window check failed"),
            }

            // Confirmed-bonus growth is the cue upstream is about to publish
            // new ranks.
            if self.managers.check_new_bonuses_confirmed(gameweek).await? {
                if let Err(e) = self.check_fpl_rank_change_and_refresh(gameweek, true).await {
                    warn!(gameweek, error = %e, "Post-bonus rank check failed");
                }
            }

            if let Err(e) = self.check_ranks_final_and_refresh(gameweek).await {
                error!(gameweek, error = %e, "Ranks final check failed");
            }

            // Keep auto-sub indicators current outside live windows.
            if state == RefreshState::Idle {
                let cohort = self.cohort().await?;
                for manager_id in cohort {
                    if let Err(e) = self
                        .managers
                        .sync_auto_sub_flags_to_picks(manager_id, gameweek)
                        .await
                    {
                        debug!(manager_id, gameweek, error = %e, "Auto-sub flag sync failed");
                    }
                }
            }
        }

        if let Err(e) = self.store.insert_refresh_event(RefreshPath::Slow).await {
            debug!(error = %e, "Slow heartbeat insert failed");
        }
        Ok(())
    }

    /// Cohort-wide authoritative history refresh in bounded batches, followed
    /// by league rank recomputation (only once any fixture has started —
    /// before that, deadline-time ordering stands).
    async fn refresh_manager_points(&self, force_all: bool) -> Result<()> {
        let Some(gameweek) = self.current_gameweek() else {
            return Ok(());
        };
        let cohort = self.cohort().await?;
        if cohort.is_empty() {
            debug!(gameweek, "No managers to refresh");
            return Ok(());
        }
        info!(
            gameweek,
            managers = cohort.len(),
            reason = if force_all { "forced" } else { "cycle" },
            "Refreshing manager points"
        );

        let batch_size = self.settings.manager_points_batch_size;
        let batch_sleep =
            Duration::from_secs_f64(self.settings.manager_points_batch_sleep_seconds);
        let mut rate_limited = 0usize;
        for (index, batch) in cohort.chunks(batch_size).enumerate() {
            let results = join_all(batch.iter().map(|manager_id| async move {
                (
                    *manager_id,
                    self.managers.refresh_manager_history(*manager_id, gameweek).await,
                )
            }))
            .await;
            for (manager_id, result) in results {
                if let Err(e) = result {
                    if e.downcast_ref::<FplApiError>()
                        .map_or(false, |fe| matches!(fe, FplApiError::RateLimited { .. }))
                    {
                        rate_limited += 1;
                    }
                    error!(manager_id, gameweek, error = %e, "Manager history refresh failed");
                }
            }
            if (index + 1) % 5 == 0 {
                let _ = self.store.insert_refresh_event(RefreshPath::Slow).await;
            }
            if self.shutting_down() {
                // Finish the in-flight batch, start no new ones.
                break;
            }
            if !batch_sleep.is_zero() && batch.len() == batch_size {
                tokio::time::sleep(batch_sleep).await;
            }
        }
        if rate_limited > 0 {
            warn!(
                gameweek,
                rate_limited,
                "Manager points refresh hit rate limits; consider a longer batch sleep"
            );
        }

        if self.fixtures_started(gameweek).await? {
            for league_id in self.store.get_league_ids().await? {
                if let Err(e) = self
                    .managers
                    .calculate_mini_league_ranks(league_id, gameweek)
                    .await
                {
                    error!(league_id, gameweek, error = %e, "League ranks failed");
                }
            }
        } else {
            debug!(gameweek, "Skipping league rank recalc (no fixture started)");
        }
        Ok(())
    }

    /// End-of-gameweek rank finalization: when every fixture is provisionally
    /// finished and ranks are not yet final, either `data_checked` settles it
    /// or a throttled sample-manager poll does.
    async fn check_ranks_final_and_refresh(&self, gameweek: i32) -> Result<()> {
        let fixtures = self.store.get_fixtures_for_gameweek(gameweek).await?;
        if fixtures.is_empty() || !fixtures.iter().all(|f| f.finished_provisional) {
            return Ok(());
        }
        let Some(gw) = self.store.get_gameweek(gameweek).await? else {
            return Ok(());
        };
        if gw.ranks_finalized {
            return Ok(());
        }
        if gw.data_checked {
            info!(gameweek, "Gameweek data checked; refreshing all managers for ranks");
            self.refresh_manager_points(true).await?;
            self.store.set_gameweek_ranks_finalized(gameweek, true).await?;
            return Ok(());
        }
        self.check_fpl_rank_change_and_refresh(gameweek, true).await
    }

    /// Throttled sample-manager poll; on a detected change mark the gameweek
    /// finalized and refresh the whole cohort.
    async fn check_fpl_rank_change_and_refresh(
        &self,
        gameweek: i32,
        force_all: bool,
    ) -> Result<()> {
        if let Some(gw) = self.store.get_gameweek(gameweek).await? {
            if gw.ranks_finalized {
                return Ok(());
            }
        }
        let now = Utc::now();
        {
            let mut flags = self.flags.lock().expect("flags lock");
            if flags.last_rank_check_gameweek == Some(gameweek) {
                if let Some(last) = flags.last_rank_check {
                    if (now - last).num_seconds()
                        < self.settings.rank_check_interval_seconds as i64
                    {
                        return Ok(());
                    }
                }
            }
            flags.last_rank_check = Some(now);
            flags.last_rank_check_gameweek = Some(gameweek);
        }

        let cohort = self.cohort().await?;
        let Some(sample) = cohort.first() else {
            return Ok(());
        };
        if self.managers.check_fpl_rank_change(*sample, gameweek).await? {
            info!(gameweek, "FPL ranks updated; refreshing all managers");
            self.store.set_gameweek_ranks_finalized(gameweek, true).await?;
            if force_all {
                self.refresh_manager_points(true).await?;
            }
        }
        Ok(())
    }

    // ----- cadence ---------------------------------------------------------

    /// IDLE sleep: short when a kickoff is near or overdue, otherwise capped
    /// so the next kickoff window is never missed.
    async fn idle_sleep_seconds(&self) -> u64 {
        let live = self.settings.fast_loop_interval_live;
        let default_sleep = self.settings.fast_loop_interval;
        let cap = self.settings.max_idle_sleep_seconds;
        let Some(gameweek) = self.current_gameweek() else {
            return default_sleep;
        };
        let now = Utc::now();
        let window = ChronoDuration::minutes(self.settings.kickoff_window_minutes);

        let next_kickoff = match self
            .store
            .get_next_kickoff_for_gameweek(gameweek, now)
            .await
        {
            Ok(k) => k,
            Err(e) => {
                debug!(error = %e, "Idle sleep kickoff lookup failed");
                return default_sleep.min(cap);
            }
        };
        let next_kickoff = match next_kickoff {
            Some(k) => Some(k),
            None => {
                // No future kickoff in the current gameweek: the next
                // gameweek's schedule decides.
                match self.store.get_next_gameweek().await {
                    Ok(Some(next_gw)) => {
                        match self.store.get_first_kickoff_for_gameweek(next_gw.id).await {
                            Ok(Some(first)) if now >= first => return live,
                            _ => self
                                .store
                                .get_next_kickoff_for_gameweek(next_gw.id, now)
                                .await
                                .ok()
                                .flatten(),
                        }
                    }
                    _ => None,
                }
            }
        };

        match next_kickoff {
            None => default_sleep.min(cap),
            Some(kickoff) => {
                let until = kickoff - now;
                if until <= window {
                    live
                } else {
                    let sleep = (until - window).num_seconds().max(live as i64) as u64;
                    sleep.min(cap)
                }
            }
        }
    }

    // ----- predictions loop ------------------------------------------------

    /// Auxiliary loop: run the configured external predictions-refresh command
    /// on a fixed period. Disabled when no command is configured.
    async fn run_predictions_loop(&self) {
        let command = self.settings.predictions_refresh_command.trim().to_string();
        if command.is_empty() {
            debug!("Predictions loop disabled (no command configured)");
            return;
        }
        let interval = Duration::from_secs(self.settings.predictions_refresh_interval);
        // First run after a minute so startup is not blocked.
        if self.sleep_or_shutdown(Duration::from_secs(60)).await {
            return;
        }
        while !self.shutting_down() {
            match tokio::time::timeout(
                Duration::from_secs(120),
                tokio::process::Command::new("sh").arg("-c").arg(&command).output(),
            )
            .await
            {
                Ok(Ok(output)) if output.status.success() => {
                    debug!("Predictions refresh completed");
                }
                Ok(Ok(output)) => {
                    warn!(
                        status = ?output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr)
                            .chars()
                            .take(500)
                            .collect::<String>(),
                        "Predictions refresh failed"
                    );
                }
                Ok(Err(e)) => warn!(error = %e, "Predictions command failed to run"),
                Err(_) => warn!("Predictions refresh timed out after 120s"),
            }
            if self.sleep_or_shutdown(interval).await {
                break;
            }
        }
        info!("Predictions loop stopped");
    }
}

/// True when the latest-kickoff fixture of today (UTC) has at least
/// provisionally finished.
fn last_match_of_day_finished<'a>(
    fixtures: impl Iterator<Item = &'a ApiFixture>,
    now: DateTime<Utc>,
) -> bool {
    let today = now.date_naive();
    fixtures
        .filter(|f| matches!(f.kickoff_time, Some(k) if k.date_naive() == today))
        .max_by_key(|f| f.kickoff_time)
        .map(|f| f.finished || f.finished_provisional)
        .unwrap_or(false)
}

fn seconds_since(t: DateTime<Utc>) -> f64 {
    let millis = (Utc::now() - t).num_milliseconds().max(0) as f64;
    (millis / 100.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::domain::GameweekRow;
    use chrono::TimeZone;

    fn gameweek(id: i32, current: bool, next: bool, deadline: DateTime<Utc>) -> GameweekRow {
        GameweekRow {
            id,
            name: format!("Gameweek {id}"),
            deadline_at: Some(deadline),
            release_at: None,
            is_current: current,
            is_previous: false,
            is_next: next,
            finished: false,
            data_checked: false,
            ranks_finalized: false,
            highest_score: None,
            average_entry_score: None,
        }
    }

    fn fixture(
        id: i64,
        gameweek_id: i32,
        kickoff: DateTime<Utc>,
        started: bool,
        finished_provisional: bool,
        finished: bool,
    ) -> FixtureRow {
        FixtureRow {
            id,
            gameweek_id: Some(gameweek_id),
            home_team_id: 1,
            away_team_id: 2,
            kickoff_at: Some(kickoff),
            started,
            finished,
            finished_provisional,
            minutes: 0,
            home_score: None,
            away_score: None,
        }
    }

    fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
        let settings = Arc::new(Settings::default());
        let client = Arc::new(FplClient::new(&settings).expect("client builds"));
        let (_tx, rx) = watch::channel(false);
        Orchestrator::new(settings, client, store, rx)
    }

    #[tokio::test]
    async fn detects_outside_gameweek_without_current_row() {
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(store);
        let detection = orch.detect_state(Utc::now()).await.unwrap();
        assert_eq!(detection.state, RefreshState::OutsideGameweek);
    }

    /// Fixed midday-UTC instant so the daily price window (01:30 UTC by
    /// default) can never interfere with detection assertions.
    fn midday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn detects_live_at_the_minute_of_kickoff() {
        let store = Arc::new(MemoryStore::new());
        let now = midday();
        store
            .upsert_gameweek(&gameweek(10, true, false, now - ChronoDuration::days(1)))
            .await
            .unwrap();
        // Upstream has not flipped `started` yet; kickoff time alone counts.
        store
            .upsert_fixture(&fixture(1, 10, now - ChronoDuration::minutes(1), false, false, false))
            .await
            .unwrap();
        let orch = orchestrator(store);
        let detection = orch.detect_state(now).await.unwrap();
        assert_eq!(detection.state, RefreshState::LiveMatches);
        assert_eq!(detection.gameweek, Some(10));
    }

    #[tokio::test]
    async fn adopts_next_gameweek_when_its_fixture_kicks_off() {
        let store = Arc::new(MemoryStore::new());
        let now = midday();
        store
            .upsert_gameweek(&gameweek(10, true, false, now - ChronoDuration::days(7)))
            .await
            .unwrap();
        store
            .upsert_gameweek(&gameweek(11, false, true, now - ChronoDuration::hours(3)))
            .await
            .unwrap();
        // Current gameweek fully done; a next-gameweek fixture kicked off.
        store
            .upsert_fixture(&fixture(1, 10, now - ChronoDuration::days(6), true, true, true))
            .await
            .unwrap();
        store
            .upsert_fixture(&fixture(2, 11, now - ChronoDuration::minutes(2), false, false, false))
            .await
            .unwrap();
        let orch = orchestrator(store);
        let detection = orch.detect_state(now).await.unwrap();
        assert_eq!(detection.state, RefreshState::LiveMatches);
        assert_eq!(detection.gameweek, Some(11));
    }

    #[tokio::test]
    async fn detects_bonus_pending_when_all_fixtures_provisional() {
        let store = Arc::new(MemoryStore::new());
        let now = midday();
        store
            .upsert_gameweek(&gameweek(12, true, false, now - ChronoDuration::days(2)))
            .await
            .unwrap();
        store
            .upsert_fixture(&fixture(1, 12, now - ChronoDuration::hours(5), true, true, false))
            .await
            .unwrap();
        store
            .upsert_fixture(&fixture(2, 12, now - ChronoDuration::hours(3), true, true, false))
            .await
            .unwrap();
        let orch = orchestrator(store);
        // Deadline is long past with no batch, but fixtures have started, so
        // the batch path is ineligible and bonus-pending wins.
        let detection = orch.detect_state(now).await.unwrap();
        assert_eq!(detection.state, RefreshState::BonusPending);
    }

    #[tokio::test]
    async fn enters_transfer_deadline_forty_minutes_after_the_deadline() {
        let store = Arc::new(MemoryStore::new());
        let now = midday();
        store
            .upsert_gameweek(&gameweek(13, true, false, now - ChronoDuration::days(7)))
            .await
            .unwrap();
        store
            .upsert_gameweek(&gameweek(14, false, true, now - ChronoDuration::minutes(50)))
            .await
            .unwrap();
        // Current gameweek done and settled; next gameweek not started.
        store
            .upsert_fixture(&fixture(1, 13, now - ChronoDuration::days(6), true, true, true))
            .await
            .unwrap();
        store
            .upsert_fixture(&fixture(2, 14, now + ChronoDuration::days(1), false, false, false))
            .await
            .unwrap();
        let orch = orchestrator(store.clone());
        let detection = orch.detect_state(now).await.unwrap();
        assert_eq!(detection.state, RefreshState::TransferDeadline);
        assert_eq!(detection.deadline_target, Some(14));

        // 30 minutes after the deadline is still inside the freeze.
        let early = now - ChronoDuration::minutes(20);
        let detection = orch.detect_state(early).await.unwrap();
        assert_ne!(detection.state, RefreshState::TransferDeadline);
    }

    #[tokio::test]
    async fn deadline_not_entered_once_batch_succeeded() {
        let store = Arc::new(MemoryStore::new());
        let now = midday();
        store
            .upsert_gameweek(&gameweek(15, true, false, now - ChronoDuration::hours(2)))
            .await
            .unwrap();
        store
            .upsert_fixture(&fixture(1, 15, now + ChronoDuration::days(1), false, false, false))
            .await
            .unwrap();
        let run_id = store.insert_deadline_batch_start(15).await.unwrap();
        store
            .update_deadline_batch_finish(run_id, now, true, 3, 1, serde_json::json!({}))
            .await
            .unwrap();
        let orch = orchestrator(store);
        let detection = orch.detect_state(now).await.unwrap();
        assert_eq!(detection.state, RefreshState::Idle);
    }

    #[test]
    fn price_window_uses_the_configured_local_wall_clock() {
        let settings = Settings::default();
        // 17:30 at UTC-8 is 01:30 UTC the following day.
        let inside = Utc.with_ymd_and_hms(2026, 1, 10, 1, 33, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2026, 1, 10, 1, 40, 0).unwrap();
        assert!(in_price_change_window(&settings, inside));
        assert!(!in_price_change_window(&settings, outside));
        // The cooldown follows the window.
        assert!(in_price_window_cooldown(&settings, outside));
        let past_cooldown = Utc.with_ymd_and_hms(2026, 1, 10, 1, 45, 0).unwrap();
        assert!(!in_price_window_cooldown(&settings, past_cooldown));
    }

    #[test]
    fn last_match_of_day_check_uses_latest_kickoff() {
        let now = Utc::now();
        let early = ApiFixture {
            id: 1,
            event: Some(3),
            team_h: 1,
            team_a: 2,
            team_h_score: Some(1),
            team_a_score: Some(0),
            kickoff_time: Some(now - chrono::Duration::hours(6)),
            started: Some(true),
            finished: true,
            finished_provisional: true,
            minutes: 90,
        };
        let late_unfinished = ApiFixture {
            id: 2,
            kickoff_time: Some(now - chrono::Duration::hours(1)),
            finished: false,
            finished_provisional: false,
            ..early.clone()
        };
        assert!(!last_match_of_day_finished([&early, &late_unfinished].into_iter(), now));
        let late_finished = ApiFixture {
            finished_provisional: true,
            ..late_unfinished
        };
        assert!(last_match_of_day_finished([&early, &late_finished].into_iter(), now));
    }
}
