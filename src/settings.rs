//! Service configuration.
//!
//! Settings are assembled from an optional `config/default.toml` file and the
//! process environment, so every option documented here can be set as an env
//! var (e.g. `MAX_REQUESTS_PER_MINUTE=20`). Defaults match the cadences the
//! FPL API tolerates in production.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// FPL API base URL.
    #[serde(default = "default_api_base_url")]
    pub fpl_api_base_url: String,

    // Rate limiting
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
    /// Minimum spacing between requests in seconds (jittered ±25%).
    #[serde(default = "default_min_request_interval")]
    pub min_request_interval: f64,

    // Retry policy
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base for exponential backoff in seconds (`base * 2^attempt`).
    #[serde(default = "default_retry_backoff_base")]
    pub retry_backoff_base: f64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: u64,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    // Fast-loop cadence
    #[serde(default = "default_fast_loop_interval")]
    pub fast_loop_interval: u64,
    #[serde(default = "default_fast_loop_interval_live")]
    pub fast_loop_interval_live: u64,
    #[serde(default = "default_fast_loop_interval_deadline")]
    pub fast_loop_interval_deadline: u64,
    /// Use the live interval when now is within this many minutes of a kickoff.
    #[serde(default = "default_kickoff_window_minutes")]
    pub kickoff_window_minutes: i64,
    /// Inside a gameweek, never sleep longer than this in IDLE.
    #[serde(default = "default_max_idle_sleep_seconds")]
    pub max_idle_sleep_seconds: u64,

    // Slow-loop cadence
    /// Slow loop period (manager points + live MVs) during live matches.
    #[serde(default = "default_full_refresh_interval_live")]
    pub full_refresh_interval_live: u64,
    /// Slow loop period outside live windows.
    #[serde(default = "default_slow_loop_interval_idle")]
    pub slow_loop_interval_idle: u64,
    /// Throttle for the live-standings path inside the fast cycle.
    #[serde(default = "default_live_standings_in_fast_interval")]
    pub live_standings_in_fast_interval: u64,
    /// Hourly cohort rank refresh period while idle.
    #[serde(default = "default_hourly_rank_refresh_interval")]
    pub hourly_rank_refresh_interval: u64,

    // Deadline batch pacing
    #[serde(default = "default_post_deadline_settle_seconds")]
    pub post_deadline_settle_seconds: u64,
    #[serde(default = "default_deadline_batch_size")]
    pub deadline_batch_size: usize,
    #[serde(default = "default_deadline_batch_sleep_seconds")]
    pub deadline_batch_sleep_seconds: f64,
    /// Minutes past a deadline before TRANSFER_DEADLINE is entered (FPL freeze).
    #[serde(default = "default_deadline_entry_delay_minutes")]
    pub deadline_entry_delay_minutes: i64,

    // Manager points fan-out
    #[serde(default = "default_manager_points_batch_size")]
    pub manager_points_batch_size: usize,
    #[serde(default = "default_manager_points_batch_sleep_seconds")]
    pub manager_points_batch_sleep_seconds: f64,

    // Daily price window (local wall clock, fixed offset)
    /// Window start as `HH:MM` in the configured local zone.
    #[serde(default = "default_price_change_time")]
    pub price_change_time: String,
    #[serde(default = "default_price_change_window_duration")]
    pub price_change_window_duration: i64,
    #[serde(default = "default_price_window_cooldown_minutes")]
    pub price_window_cooldown_minutes: i64,
    /// UTC offset in hours for the price window wall clock (PST by default).
    #[serde(default = "default_price_change_utc_offset_hours")]
    pub price_change_utc_offset_hours: i32,
    #[serde(default = "default_prices_refresh_interval_window")]
    pub prices_refresh_interval_window: u64,

    // Rank monitoring after the last matchday game
    #[serde(default = "default_rank_monitor_hours_after_last_matchday")]
    pub rank_monitor_hours_after_last_matchday: i64,
    #[serde(default = "default_rank_monitor_interval_seconds")]
    pub rank_monitor_interval_seconds: u64,
    /// Throttle for the sample-manager rank-change probe in BONUS_PENDING.
    #[serde(default = "default_rank_check_interval_seconds")]
    pub rank_check_interval_seconds: u64,

    // Matchday baseline capture window
    #[serde(default = "default_matchday_baseline_minutes_before")]
    pub matchday_baseline_minutes_before: i64,
    #[serde(default = "default_matchday_baseline_minutes_stop_before")]
    pub matchday_baseline_minutes_stop_before: i64,

    // Caching
    #[serde(default = "default_bootstrap_cache_ttl")]
    pub bootstrap_cache_ttl: u64,

    // Predictions loop
    /// External command run every `predictions_refresh_interval` seconds.
    /// Disabled when empty.
    #[serde(default)]
    pub predictions_refresh_command: String,
    #[serde(default = "default_predictions_refresh_interval")]
    pub predictions_refresh_interval: u64,

    // Cohort
    /// Comma-separated manager ids always included in cohorts.
    #[serde(default)]
    pub required_manager_ids: String,
}

fn default_api_base_url() -> String {
    "https://fantasy.premierleague.com/api".to_string()
}
fn default_max_requests_per_minute() -> u32 {
    30
}
fn default_min_request_interval() -> f64 {
    1.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_base() -> f64 {
    1.0
}
fn default_max_retry_delay() -> u64 {
    60
}
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_fast_loop_interval() -> u64 {
    15
}
fn default_fast_loop_interval_live() -> u64 {
    10
}
fn default_fast_loop_interval_deadline() -> u64 {
    15
}
fn default_kickoff_window_minutes() -> i64 {
    5
}
fn default_max_idle_sleep_seconds() -> u64 {
    60
}
fn default_full_refresh_interval_live() -> u64 {
    60
}
fn default_slow_loop_interval_idle() -> u64 {
    300
}
fn default_live_standings_in_fast_interval() -> u64 {
    90
}
fn default_hourly_rank_refresh_interval() -> u64 {
    3600
}
fn default_post_deadline_settle_seconds() -> u64 {
    60
}
fn default_deadline_batch_size() -> usize {
    15
}
fn default_deadline_batch_sleep_seconds() -> f64 {
    1.0
}
fn default_deadline_entry_delay_minutes() -> i64 {
    40
}
fn default_manager_points_batch_size() -> usize {
    10
}
fn default_manager_points_batch_sleep_seconds() -> f64 {
    0.5
}
fn default_price_change_time() -> String {
    "17:30".to_string()
}
fn default_price_change_window_duration() -> i64 {
    6
}
fn default_price_window_cooldown_minutes() -> i64 {
    5
}
fn default_price_change_utc_offset_hours() -> i32 {
    -8
}
fn default_prices_refresh_interval_window() -> u64 {
    30
}
fn default_rank_monitor_hours_after_last_matchday() -> i64 {
    5
}
fn default_rank_monitor_interval_seconds() -> u64 {
    900
}
fn default_rank_check_interval_seconds() -> u64 {
    300
}
fn default_matchday_baseline_minutes_before() -> i64 {
    90
}
fn default_matchday_baseline_minutes_stop_before() -> i64 {
    5
}
fn default_bootstrap_cache_ttl() -> u64 {
    300
}
fn default_predictions_refresh_interval() -> u64 {
    1800
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            fpl_api_base_url: default_api_base_url(),
            max_requests_per_minute: default_max_requests_per_minute(),
            min_request_interval: default_min_request_interval(),
            max_retries: default_max_retries(),
            retry_backoff_base: default_retry_backoff_base(),
            max_retry_delay: default_max_retry_delay(),
            request_timeout_seconds: default_request_timeout_seconds(),
            fast_loop_interval: default_fast_loop_interval(),
            fast_loop_interval_live: default_fast_loop_interval_live(),
            fast_loop_interval_deadline: default_fast_loop_interval_deadline(),
            kickoff_window_minutes: default_kickoff_window_minutes(),
            max_idle_sleep_seconds: default_max_idle_sleep_seconds(),
            full_refresh_interval_live: default_full_refresh_interval_live(),
            slow_loop_interval_idle: default_slow_loop_interval_idle(),
            live_standings_in_fast_interval: default_live_standings_in_fast_interval(),
            hourly_rank_refresh_interval: default_hourly_rank_refresh_interval(),
            post_deadline_settle_seconds: default_post_deadline_settle_seconds(),
            deadline_batch_size: default_deadline_batch_size(),
            deadline_batch_sleep_seconds: default_deadline_batch_sleep_seconds(),
            deadline_entry_delay_minutes: default_deadline_entry_delay_minutes(),
            manager_points_batch_size: default_manager_points_batch_size(),
            manager_points_batch_sleep_seconds: default_manager_points_batch_sleep_seconds(),
            price_change_time: default_price_change_time(),
            price_change_window_duration: default_price_change_window_duration(),
            price_window_cooldown_minutes: default_price_window_cooldown_minutes(),
            price_change_utc_offset_hours: default_price_change_utc_offset_hours(),
            prices_refresh_interval_window: default_prices_refresh_interval_window(),
            rank_monitor_hours_after_last_matchday: default_rank_monitor_hours_after_last_matchday(
            ),
            rank_monitor_interval_seconds: default_rank_monitor_interval_seconds(),
            rank_check_interval_seconds: default_rank_check_interval_seconds(),
            matchday_baseline_minutes_before: default_matchday_baseline_minutes_before(),
            matchday_baseline_minutes_stop_before: default_matchday_baseline_minutes_stop_before(),
            bootstrap_cache_ttl: default_bootstrap_cache_ttl(),
            predictions_refresh_command: String::new(),
            predictions_refresh_interval: default_predictions_refresh_interval(),
            required_manager_ids: String::new(),
        }
    }
}

impl Settings {
    /// Load settings from `config/default.toml` (optional) and the environment.
    pub fn new() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::default())
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if self.fpl_api_base_url.is_empty() {
            errors.push("FPL_API_BASE_URL must not be empty");
        }
        if self.max_requests_per_minute == 0 {
            errors.push("MAX_REQUESTS_PER_MINUTE must be > 0");
        }
        if self.deadline_batch_size == 0 || self.manager_points_batch_size == 0 {
            errors.push("batch sizes must be > 0");
        }
        if self.parse_price_change_time().is_none() {
            errors.push("PRICE_CHANGE_TIME must be HH:MM");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Message(errors.join(", ")))
        }
    }

    /// Managers that must be part of every cohort, from the comma-separated
    /// `REQUIRED_MANAGER_IDS` option. Malformed entries are ignored.
    pub fn required_manager_ids(&self) -> Vec<i64> {
        self.required_manager_ids
            .split(',')
            .filter_map(|s| s.trim().parse::<i64>().ok())
            .collect()
    }

    /// Price window start as (hour, minute) in the configured local zone.
    pub fn parse_price_change_time(&self) -> Option<(u32, u32)> {
        let mut parts = self.price_change_time.splitn(2, ':');
        let hour: u32 = parts.next()?.trim().parse().ok()?;
        let minute: u32 = parts.next()?.trim().parse().ok()?;
        if hour < 24 && minute < 60 {
            Some((hour, minute))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_cadences() {
        let s = Settings::default();
        assert_eq!(s.max_requests_per_minute, 30);
        assert_eq!(s.fast_loop_interval_live, 10);
        assert_eq!(s.fast_loop_interval_deadline, 15);
        assert_eq!(s.live_standings_in_fast_interval, 90);
        assert_eq!(s.bootstrap_cache_ttl, 300);
        assert_eq!(s.deadline_entry_delay_minutes, 40);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn required_manager_ids_parse_and_skip_garbage() {
        let mut s = Settings::default();
        s.required_manager_ids = "123, 456,,abc, 789".to_string();
        assert_eq!(s.required_manager_ids(), vec![123, 456, 789]);
    }

    #[test]
    fn price_change_time_parses() {
        let s = Settings::default();
        assert_eq!(s.parse_price_change_time(), Some((17, 30)));
        let mut bad = Settings::default();
        bad.price_change_time = "25:99".to_string();
        assert!(bad.parse_price_change_time().is_none());
        assert!(bad.validate().is_err());
    }
}
