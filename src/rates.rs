use crate::config::RATE_SERVICE_URL;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Currencies converted to USD, with the rate used when the service is down.
pub const FALLBACK_USD_RATES: &[(&str, f64)] = &[("IDR", 0.000065)];

#[derive(Debug, Error)]
pub enum RateError {
    #[error("rate request failed: {0}")]
    Request(String),
    #[error("rate missing for {0}")]
    Missing(String),
}

#[async_trait]
pub trait RateSource: Send + Sync {
    async fn rate(&self, from: &str, to: &str) -> Result<f64, RateError>;
}

pub struct FrankfurterRates {
    http: Client,
    base_url: String,
}

impl FrankfurterRates {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            base_url: RATE_SERVICE_URL.clone(),
        }
    }
}

#[derive(Deserialize)]
struct LatestResponse {
    rates: HashMap<String, f64>,
}

#[async_trait]
impl RateSource for FrankfurterRates {
    async fn rate(&self, from: &str, to: &str) -> Result<f64, RateError> {
        let url = format!("{}/latest", self.base_url);
        let response = self
            .http
            .get(url)
            .query(&[("from", from), ("to", to)])
            .send()
            .await
            .map_err(|err| RateError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(RateError::Request(format!("HTTP {}", response.status())));
        }
        let payload: LatestResponse = response
            .json()
            .await
            .map_err(|err| RateError::Request(err.to_string()))?;
        payload
            .rates
            .get(to)
            .copied()
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .ok_or_else(|| RateError::Missing(to.to_string()))
    }
}

pub fn fallback_usd_rate(code: &str) -> Option<f64> {
    FALLBACK_USD_RATES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(code))
        .map(|(_, rate)| *rate)
}

/// Live rate to USD for a convertible currency, or its fallback constant.
/// `None` when the currency is not one we convert.
pub async fn usd_rate(source: &dyn RateSource, code: &str) -> Option<f64> {
    let fallback = fallback_usd_rate(code)?;
    match source.rate(&code.to_uppercase(), "USD").await {
        Ok(rate) => Some(rate),
        Err(err) => {
            warn!(target = "wayover.rates", currency = code, error = %err, "using_fallback_rate");
            Some(fallback)
        }
    }
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedRate;

    #[tokio::test]
    async fn live_rate_wins_over_fallback() {
        let source = FixedRate::new(0.00007);
        assert_eq!(usd_rate(&source, "idr").await, Some(0.00007));
    }

    #[tokio::test]
    async fn fallback_used_when_service_fails() {
        let source = FixedRate::unavailable();
        assert_eq!(usd_rate(&source, "IDR").await, Some(0.000065));
    }

    #[tokio::test]
    async fn unknown_currency_is_not_converted() {
        let source = FixedRate::new(1.1);
        assert_eq!(usd_rate(&source, "EUR").await, None);
    }

    #[test]
    fn rounds_to_cents() {
        assert_eq!(round_cents(150_000.0 * 0.000065), 9.75);
        assert_eq!(round_cents(1.005_1), 1.01);
    }
}
