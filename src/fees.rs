//! Fee Rate Oracle
//!
//! Tiered sat/vB recommendations from a mempool.space-style estimator,
//! cached for a minute. Rates never drop below the floor, and the oracle
//! never fails: a fetch error falls back to the last good rates, then to a
//! static table.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::wallet::types::FeeTier;

/// Fee estimator endpoints
pub const MAINNET_FEE_URL: &str = "https://mempool.space/api";
pub const TESTNET_FEE_URL: &str = "https://mempool.space/testnet/api";
pub const SIGNET_FEE_URL: &str = "https://mempool.space/signet/api";

/// Minimum rate applied to every tier (sat/vB)
pub const FEE_RATE_FLOOR: u64 = 2;

/// How long fetched rates are reused
pub const FEE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Used when the estimator is unreachable and nothing is cached
pub const FALLBACK_RATES: FeeRates = FeeRates {
    fastest: 20,
    half_hour: 10,
    hour: 5,
    economy: 3,
    minimum: 2,
};

/// Tiered fee rates in sat/vB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub fastest: u64,
    pub half_hour: u64,
    pub hour: u64,
    pub economy: u64,
    pub minimum: u64,
}

impl FeeRates {
    /// Raise every tier to at least `floor`
    pub fn floored(self, floor: u64) -> Self {
        Self {
            fastest: self.fastest.max(floor),
            half_hour: self.half_hour.max(floor),
            hour: self.hour.max(floor),
            economy: self.economy.max(floor),
            minimum: self.minimum.max(floor),
        }
    }

    pub fn for_tier(&self, tier: FeeTier) -> u64 {
        rate_for_tier(self, tier)
    }
}

impl std::fmt::Display for FeeRates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fastest {} | 30m {} | 1h {} | economy {} | minimum {} sat/vB",
            self.fastest, self.half_hour, self.hour, self.economy, self.minimum
        )
    }
}

/// `priority → fastest`, `economy → economy`, otherwise the half-hour rate
pub fn rate_for_tier(rates: &FeeRates, tier: FeeTier) -> u64 {
    match tier {
        FeeTier::Priority => rates.fastest,
        FeeTier::Economy => rates.economy,
        FeeTier::Normal => rates.half_hour,
    }
}

/// `/v1/fees/recommended` response. Every field is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendedFees {
    fastest_fee: u64,
    half_hour_fee: u64,
    hour_fee: u64,
    economy_fee: u64,
    minimum_fee: u64,
}

impl From<RecommendedFees> for FeeRates {
    fn from(r: RecommendedFees) -> Self {
        Self {
            fastest: r.fastest_fee,
            half_hour: r.half_hour_fee,
            hour: r.hour_fee,
            economy: r.economy_fee,
            minimum: r.minimum_fee,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRates {
    rates: FeeRates,
    fetched_at: Instant,
}

/// Cached fee-rate oracle
#[derive(Debug)]
pub struct FeeOracle {
    client: Client,
    /// `None` serves the fallback table without any network access
    base_url: Option<String>,
    floor: u64,
    cache: Mutex<Option<CachedRates>>,
}

impl FeeOracle {
    /// Oracle backed by an estimator at `base_url`
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: Some(base_url.trim_end_matches('/').to_string()),
            floor: FEE_RATE_FLOOR,
            cache: Mutex::new(None),
        }
    }

    /// Oracle that always serves the static table (regtest / offline)
    pub fn fixed() -> Self {
        Self {
            client: Client::new(),
            base_url: None,
            floor: FEE_RATE_FLOOR,
            cache: Mutex::new(None),
        }
    }

    /// Current rates. Never fails.
    pub async fn get_rates(&self) -> FeeRates {
        self.get_rates_at(Instant::now()).await
    }

    /// `get_rates` with the cache aged against `now`
    pub async fn get_rates_at(&self, now: Instant) -> FeeRates {
        let Some(base_url) = self.base_url.as_deref() else {
            return FALLBACK_RATES.floored(self.floor);
        };

        let mut cache = self.cache.lock().await;
        if let Some(cached) = *cache {
            if now.saturating_duration_since(cached.fetched_at) < FEE_CACHE_TTL {
                return cached.rates;
            }
        }

        match self.fetch(base_url).await {
            Ok(fetched) => {
                let rates = fetched.floored(self.floor);
                *cache = Some(CachedRates {
                    rates,
                    fetched_at: now,
                });
                tracing::debug!(target: "xbridge_wallet::fees", %rates, "fee rates refreshed");
                rates
            }
            Err(e) => match *cache {
                Some(cached) => {
                    tracing::warn!(target: "xbridge_wallet::fees", error = %e, "fee fetch failed, reusing stale rates");
                    cached.rates
                }
                None => {
                    tracing::warn!(target: "xbridge_wallet::fees", error = %e, "fee fetch failed, using fallback rates");
                    FALLBACK_RATES.floored(self.floor)
                }
            },
        }
    }

    /// Rate for `tier` from the current rates
    pub async fn rate_for(&self, tier: FeeTier) -> u64 {
        rate_for_tier(&self.get_rates().await, tier)
    }

    async fn fetch(&self, base_url: &str) -> Result<FeeRates, FeeFetchError> {
        let url = format!("{}/v1/fees/recommended", base_url);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(FeeFetchError::Status(resp.status().as_u16()));
        }

        let text = resp.text().await?;
        let fees: RecommendedFees =
            serde_json::from_str(&text).map_err(|e| FeeFetchError::Parse(e.to_string()))?;
        Ok(fees.into())
    }
}

/// Internal: reasons a fetch fell back. Never surfaced to callers.
#[derive(Debug, thiserror::Error)]
enum FeeFetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECOMMENDED: &str = r#"{"fastestFee":31,"halfHourFee":18,"hourFee":9,"economyFee":1,"minimumFee":1}"#;

    #[test]
    fn test_rate_for_tier() {
        let rates = FeeRates {
            fastest: 30,
            half_hour: 15,
            hour: 8,
            economy: 4,
            minimum: 2,
        };
        assert_eq!(rate_for_tier(&rates, FeeTier::Priority), 30);
        assert_eq!(rate_for_tier(&rates, FeeTier::Normal), 15);
        assert_eq!(rate_for_tier(&rates, FeeTier::Economy), 4);
    }

    #[tokio::test]
    async fn test_fetch_applies_floor_and_caches() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/fees/recommended")
            .with_status(200)
            .with_body(RECOMMENDED)
            .expect(1)
            .create_async()
            .await;

        let oracle = FeeOracle::new(&server.url());
        let rates = oracle.get_rates().await;
        assert_eq!(rates.fastest, 31);
        assert_eq!(rates.economy, FEE_RATE_FLOOR);
        assert_eq!(rates.minimum, FEE_RATE_FLOOR);

        // Served from cache
        let again = oracle.get_rates().await;
        assert_eq!(again, rates);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_cache_is_refreshed() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/v1/fees/recommended")
            .with_status(200)
            .with_body(RECOMMENDED)
            .expect(1)
            .create_async()
            .await;

        let oracle = FeeOracle::new(&server.url());
        let start = Instant::now();
        assert_eq!(oracle.get_rates_at(start).await.fastest, 31);
        first.assert_async().await;
        first.remove_async().await;

        let second = server
            .mock("GET", "/v1/fees/recommended")
            .with_status(200)
            .with_body(r#"{"fastestFee":45,"halfHourFee":25,"hourFee":12,"economyFee":6,"minimumFee":3}"#)
            .expect(1)
            .create_async()
            .await;

        // Still inside the TTL: no request
        assert_eq!(oracle.get_rates_at(start + Duration::from_secs(59)).await.fastest, 31);

        let refreshed = oracle.get_rates_at(start + FEE_CACHE_TTL).await;
        assert_eq!(refreshed.fastest, 45);
        assert_eq!(refreshed.minimum, 3);
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_last_good_rates() {
        let mut server = mockito::Server::new_async().await;
        let up = server
            .mock("GET", "/v1/fees/recommended")
            .with_status(200)
            .with_body(RECOMMENDED)
            .expect(1)
            .create_async()
            .await;

        let oracle = FeeOracle::new(&server.url());
        let start = Instant::now();
        let good = oracle.get_rates_at(start).await;
        up.assert_async().await;
        up.remove_async().await;

        let down = server
            .mock("GET", "/v1/fees/recommended")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let stale = oracle
            .get_rates_at(start + FEE_CACHE_TTL + Duration::from_secs(1))
            .await;
        down.assert_async().await;

        // Floored rates from the earlier fetch, not the static table
        assert_eq!(stale, good);
        assert_eq!(stale.economy, FEE_RATE_FLOOR);
        assert_ne!(stale, FALLBACK_RATES);
    }

    #[tokio::test]
    async fn test_missing_field_falls_back() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/fees/recommended")
            .with_status(200)
            .with_body(r#"{"fastestFee":31,"halfHourFee":18}"#)
            .create_async()
            .await;

        let oracle = FeeOracle::new(&server.url());
        assert_eq!(oracle.get_rates().await, FALLBACK_RATES);
    }

    #[tokio::test]
    async fn test_error_status_falls_back() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/fees/recommended")
            .with_status(503)
            .create_async()
            .await;

        let oracle = FeeOracle::new(&server.url());
        assert_eq!(oracle.rate_for(FeeTier::Normal).await, FALLBACK_RATES.half_hour);
    }

    #[tokio::test]
    async fn test_fixed_oracle() {
        let oracle = FeeOracle::fixed();
        assert_eq!(oracle.get_rates().await, FALLBACK_RATES);
        assert_eq!(oracle.rate_for(FeeTier::Priority).await, 20);
    }
}
