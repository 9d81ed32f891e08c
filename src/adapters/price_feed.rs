//! Fiat exchange-rate feed
//!
//! Resolves the fiat price of one BTC for market-priced orders. The rate is
//! fetched at first pricing use; the resulting amount and fee are then
//! frozen on the order and never recomputed.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, Result};

#[derive(Debug, Deserialize)]
struct RateResponse {
    rate: f64,
}

/// Exchange-rate API client
#[derive(Clone)]
pub struct PriceFeed {
    client: reqwest::Client,
    base_url: String,
}

impl PriceFeed {
    pub fn new(api_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fiat price of one BTC in `fiat_code`
    pub async fn rate_per_btc(&self, fiat_code: &str) -> Result<Decimal> {
        let url = format!("{}/rate/{}/BTC", self.base_url, fiat_code);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(EngineError::RateUnavailable(fiat_code.to_string()));
        }

        let parsed: RateResponse = resp.json().await?;
        let rate = Decimal::from_f64(parsed.rate)
            .filter(|r| *r > Decimal::ZERO)
            .ok_or_else(|| EngineError::RateUnavailable(fiat_code.to_string()))?;

        debug!(fiat_code, %rate, "fetched market rate");
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_response_parsing() {
        let parsed: RateResponse = serde_json::from_str(r#"{"rate": 58123.5}"#).unwrap();
        assert!((parsed.rate - 58123.5).abs() < f64::EPSILON);
    }
}
