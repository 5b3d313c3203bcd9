//! Remote vendor REST provider
//!
//! Endpoints, relative to the configured base URL:
//! - `GET /bars?symbol=&start=&end=&frequency=` -> `[Bar]`
//! - `GET /corporate_actions?symbol=&start=&end=` -> `[CorporateAction]`
//! - `GET /trading_days?start=&end=` -> `["YYYY-MM-DD"]`
//!
//! Uses the blocking client: backtests resolve cache misses synchronously
//! before a tick proceeds.

use super::{Bar, CorporateAction, DataProvider, Frequency};
use crate::config::{Credentials, VendorConfig};
use crate::error::{EngineError, Result};
use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use std::time::Duration;

/// REST client for a remote market data vendor
pub struct HttpProvider {
    label: String,
    base_url: String,
    timeout: Duration,
    credentials: Option<Credentials>,
    // Built on first use so construction is safe inside an async context
    client: OnceLock<Client>,
}

impl HttpProvider {
    /// Create a provider for a vendor section
    pub fn new(label: &str, config: &VendorConfig, credentials: Option<Credentials>) -> Self {
        Self {
            label: label.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            credentials,
            client: OnceLock::new(),
        }
    }

    fn client(&self, subject: &str) -> Result<&Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| EngineError::data_unavailable(subject, format!("http client: {e}")))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn get<T: DeserializeOwned>(
        &self,
        subject: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        tracing::debug!(url = %url, subject, vendor = %self.label, "Fetching from vendor");

        let mut request = self.client(subject)?.get(&url).query(query);
        if let Some(creds) = &self.credentials {
            request = request.bearer_auth(creds.expose());
        }

        let response = request
            .send()
            .map_err(|e| EngineError::data_unavailable(subject, format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::data_unavailable(subject, "not covered by vendor"));
        }
        if !status.is_success() {
            return Err(EngineError::data_unavailable(
                subject,
                format!("vendor returned {status}"),
            ));
        }

        response
            .json::<T>()
            .map_err(|e| EngineError::data_unavailable(subject, format!("bad payload: {e}")))
    }
}

impl DataProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.label
    }

    fn bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        frequency: Frequency,
    ) -> Result<Vec<Bar>> {
        let mut bars: Vec<Bar> = self.get(
            symbol,
            "bars",
            &[
                ("symbol", symbol.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("frequency", frequency.to_string()),
            ],
        )?;

        bars.retain(|b| b.date() >= start && b.date() <= end);
        if bars.is_empty() {
            return Err(EngineError::data_unavailable(
                symbol,
                format!("no {frequency} bars between {start} and {end}"),
            ));
        }
        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }

    fn corporate_actions(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CorporateAction>> {
        let mut actions: Vec<CorporateAction> = self.get(
            symbol,
            "corporate_actions",
            &[
                ("symbol", symbol.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
            ],
        )?;
        actions.sort_by_key(|a| a.ex_date);
        Ok(actions)
    }

    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        let mut days: Vec<NaiveDate> = self.get(
            "calendar",
            "trading_days",
            &[("start", start.to_string()), ("end", end.to_string())],
        )?;
        days.sort();
        Ok(days)
    }
}
