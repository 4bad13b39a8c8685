//! Rate-limited FPL API client.
//!
//! All upstream traffic flows through one shared [`FplClient`]; the rate
//! limiter is the single contention point protecting the upstream. Requests
//! honor a sliding requests-per-minute window *and* a jittered minimum
//! spacing, retry retryable failures with capped exponential backoff, and
//! memoize the bootstrap snapshot for a short TTL.

use crate::settings::Settings;
use crate::types::api::{
    ApiFixture, ApiTransfer, Bootstrap, ElementSummary, Entry, EntryHistory, EntryPicks,
    EventLive, LeagueStandings,
};
use anyhow::Result;
use arc_swap::ArcSwapOption;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, REFERER,
    RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Upstream returns HTML during maintenance; a desktop-browser identity keeps
/// the WAF from serving it to us on normal days.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const BODY_PREVIEW_LIMIT: usize = 500;

/// Client-level error kinds. Callers decide whether to fail the cycle or
/// continue with partial data.
#[derive(Debug, thiserror::Error)]
pub enum FplApiError {
    #[error("rate limited by FPL API after {retries} retries")]
    RateLimited { retries: u32 },
    #[error("transient FPL API failure after {retries} retries: {message}")]
    Transient { retries: u32, message: String },
    #[error("FPL API error {status}: {detail}")]
    Upstream { status: u16, detail: String },
}

/// Retryable: 429 plus server-side 5xx. Other 4xx are not.
fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Apply ±25% jitter so callers do not phase-lock with upstream.
fn with_jitter(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}

struct CachedBootstrap {
    fetched_at: Instant,
    data: Arc<Bootstrap>,
}

pub struct FplClient {
    http: reqwest::Client,
    base_url: String,
    limiter: DirectRateLimiter,
    /// Held across the spacing sleep so concurrent callers serialize.
    last_request: tokio::sync::Mutex<Option<Instant>>,
    min_interval: Duration,
    max_retries: u32,
    retry_backoff_base: f64,
    max_retry_delay: Duration,
    bootstrap_cache: ArcSwapOption<CachedBootstrap>,
    bootstrap_cache_ttl: Duration,
}

impl FplClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(
            REFERER,
            HeaderValue::from_static("https://fantasy.premierleague.com/"),
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .default_headers(headers)
            .build()?;

        let per_minute = NonZeroU32::new(settings.max_requests_per_minute)
            .ok_or_else(|| anyhow::anyhow!("MAX_REQUESTS_PER_MINUTE must be > 0"))?;

        Ok(Self {
            http,
            base_url: settings.fpl_api_base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            last_request: tokio::sync::Mutex::new(None),
            min_interval: Duration::from_secs_f64(settings.min_request_interval.max(0.0)),
            max_retries: settings.max_retries,
            retry_backoff_base: settings.retry_backoff_base,
            max_retry_delay: Duration::from_secs(settings.max_retry_delay),
            bootstrap_cache: ArcSwapOption::const_empty(),
            bootstrap_cache_ttl: Duration::from_secs(settings.bootstrap_cache_ttl),
        })
    }

    /// Wait for both the sliding window and the jittered minimum spacing.
    async fn wait_for_slot(&self) {
        self.limiter.until_ready().await;
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(with_jitter(self.min_interval - elapsed)).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let raw = self.retry_backoff_base * 2f64.powi(attempt as i32);
        let capped = Duration::from_secs_f64(raw).min(self.max_retry_delay);
        with_jitter(capped)
    }

    async fn request_with_retry(&self, path: &str) -> Result<reqwest::Response, FplApiError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        for attempt in 0..=self.max_retries {
            self.wait_for_slot().await;

            let response = match self.http.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            endpoint = path,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Network error from FPL API, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FplApiError::Transient {
                        retries: self.max_retries,
                        message: e.to_string(),
                    });
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                warn!(
                    endpoint = path,
                    retry_after, attempt = attempt + 1,
                    "Rate limited by FPL API"
                );
                if attempt < self.max_retries {
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                    continue;
                }
                return Err(FplApiError::RateLimited {
                    retries: self.max_retries,
                });
            }

            if !is_retryable_status(status) {
                let detail = body_preview(response).await;
                return Err(FplApiError::Upstream {
                    status: status.as_u16(),
                    detail,
                });
            }

            if attempt < self.max_retries {
                let delay = self.backoff_delay(attempt);
                warn!(
                    endpoint = path,
                    status = status.as_u16(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable error from FPL API, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(FplApiError::Transient {
                retries: self.max_retries,
                message: format!("status {}", status.as_u16()),
            });
        }

        // The loop always returns; max_retries is finite.
        Err(FplApiError::Transient {
            retries: self.max_retries,
            message: "retry loop exhausted".to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FplApiError> {
        let response = self.request_with_retry(path).await?;
        let status = response.status().as_u16();

        // During maintenance upstream serves HTML with a 200 status.
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if content_type.contains("text/html") {
            warn!(endpoint = path, content_type, "FPL API returned HTML instead of JSON");
            return Err(FplApiError::Upstream {
                status,
                detail: format!("non-JSON response ({content_type})"),
            });
        }

        let body = response.text().await.map_err(|e| FplApiError::Transient {
            retries: 0,
            message: e.to_string(),
        })?;
        serde_json::from_str(&body).map_err(|e| FplApiError::Upstream {
            status,
            detail: format!(
                "JSON parse failed: {e}; preview: {}",
                &body[..body.len().min(BODY_PREVIEW_LIMIT)]
            ),
        })
    }

    /// `/bootstrap-static/` with in-process TTL memoization. Pass
    /// `use_cache = false` to force a fresh fetch (the snapshot still lands
    /// in the cache).
    pub async fn bootstrap(&self, use_cache: bool) -> Result<Arc<Bootstrap>, FplApiError> {
        if use_cache {
            if let Some(cached) = self.cached_bootstrap() {
                debug!(
                    age_secs = cached.fetched_at.elapsed().as_secs(),
                    "Using cached bootstrap-static"
                );
                return Ok(Arc::clone(&cached.data));
            }
        }

        let data: Bootstrap = self.get_json("bootstrap-static/").await?;
        info!(
            players = data.elements.len(),
            teams = data.teams.len(),
            gameweeks = data.events.len(),
            "Bootstrap-static fetched"
        );
        let data = Arc::new(data);
        self.bootstrap_cache.store(Some(Arc::new(CachedBootstrap {
            fetched_at: Instant::now(),
            data: Arc::clone(&data),
        })));
        Ok(data)
    }

    fn cached_bootstrap(&self) -> Option<Arc<CachedBootstrap>> {
        let cached = self.bootstrap_cache.load_full()?;
        if cached.fetched_at.elapsed() < self.bootstrap_cache_ttl {
            Some(cached)
        } else {
            None
        }
    }

    /// `/fixtures/` — never cached.
    pub async fn fixtures(&self) -> Result<Vec<ApiFixture>, FplApiError> {
        self.get_json("fixtures/").await
    }

    /// `/event/{gw}/live` — per-player live stats for the gameweek.
    pub async fn event_live(&self, gameweek: i32) -> Result<EventLive, FplApiError> {
        self.get_json(&format!("event/{gameweek}/live")).await
    }

    /// `/element-summary/{player_id}/` — per-fixture history for one player.
    pub async fn element_summary(&self, player_id: i64) -> Result<ElementSummary, FplApiError> {
        self.get_json(&format!("element-summary/{player_id}/")).await
    }

    /// `/entry/{manager_id}/` — manager profile.
    pub async fn entry(&self, manager_id: i64) -> Result<Entry, FplApiError> {
        self.get_json(&format!("entry/{manager_id}/")).await
    }

    /// `/entry/{manager_id}/history/` — per-gameweek history.
    pub async fn entry_history(&self, manager_id: i64) -> Result<EntryHistory, FplApiError> {
        self.get_json(&format!("entry/{manager_id}/history/")).await
    }

    /// `/entry/{manager_id}/event/{gw}/picks/` — squad picks for a gameweek.
    pub async fn entry_picks(
        &self,
        manager_id: i64,
        gameweek: i32,
    ) -> Result<EntryPicks, FplApiError> {
        self.get_json(&format!("entry/{manager_id}/event/{gameweek}/picks/"))
            .await
    }

    /// `/entry/{manager_id}/transfers/` — full transfer history.
    pub async fn entry_transfers(&self, manager_id: i64) -> Result<Vec<ApiTransfer>, FplApiError> {
        self.get_json(&format!("entry/{manager_id}/transfers/")).await
    }

    /// `/leagues-classic/{league_id}/standings/` — paginated standings.
    pub async fn league_standings(
        &self,
        league_id: i64,
        page: i32,
    ) -> Result<LeagueStandings, FplApiError> {
        self.get_json(&format!(
            "leagues-classic/{league_id}/standings/?page_standings={page}"
        ))
        .await
    }
}

async fn body_preview(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(body) => body[..body.len().min(BODY_PREVIEW_LIMIT)].to_string(),
        Err(_) => "<unreadable body>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_classification() {
        for code in [429u16, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400u16, 401, 403, 404, 422] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let base = Duration::from_secs(8);
        for _ in 0..200 {
            let d = with_jitter(base);
            assert!(d >= Duration::from_secs(6));
            assert!(d <= Duration::from_secs(10));
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let mut settings = Settings::default();
        settings.retry_backoff_base = 1.0;
        settings.max_retry_delay = 8;
        let client = FplClient::new(&settings).unwrap();
        // Jitter is ±25%, so compare against the widest bounds.
        assert!(client.backoff_delay(0) <= Duration::from_secs_f64(1.25));
        assert!(client.backoff_delay(2) >= Duration::from_secs_f64(3.0));
        assert!(client.backoff_delay(10) <= Duration::from_secs_f64(10.0));
    }

    #[test]
    fn bootstrap_cache_expires_after_ttl() {
        let mut settings = Settings::default();
        settings.bootstrap_cache_ttl = 300;
        let client = FplClient::new(&settings).unwrap();
        assert!(client.cached_bootstrap().is_none());

        let snapshot = Arc::new(Bootstrap {
            events: Vec::new(),
            teams: Vec::new(),
            elements: Vec::new(),
            total_players: Some(11_000_000),
        });
        client.bootstrap_cache.store(Some(Arc::new(CachedBootstrap {
            fetched_at: Instant::now(),
            data: Arc::clone(&snapshot),
        })));
        assert!(client.cached_bootstrap().is_some());

        let stale = Instant::now()
            .checked_sub(Duration::from_secs(301))
            .expect("clock supports subtraction");
        client.bootstrap_cache.store(Some(Arc::new(CachedBootstrap {
            fetched_at: stale,
            data: snapshot,
        })));
        assert!(client.cached_bootstrap().is_none());
    }
}
