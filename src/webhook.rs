//! Outbound webhook calls for remote veto, provisioning, and notification.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::config::Settings;
use crate::event::Event;

/// Verdict returned by the event-check endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventCheckResponse {
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Identity record returned by the pubkey-check endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PubkeyCheckResponse {
    pub is_admitted: bool,
    #[serde(default)]
    pub balance: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct TopUpResponse {
    success: bool,
}

/// HTTP client for the configured webhook endpoints.
///
/// Every call is a JSON POST with the API token in the query string, follows
/// at most one redirect, and times out after a few seconds.
#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    token: Option<String>,
}

impl WebhookClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()
            .context("building webhook client")?;
        Ok(Self { http, token })
    }

    fn endpoint(&self, base: Option<&str>, path: Option<&str>) -> Option<Url> {
        let mut url = Url::parse(base?).ok()?.join(path?).ok()?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Some(url)
    }

    /// Ask the remote endpoint whether to admit `event`. `Ok(None)` means the
    /// check is not configured; transport failures propagate.
    pub async fn event_check(
        &self,
        event: &Event,
        settings: &Settings,
    ) -> Result<Option<EventCheckResponse>> {
        if !settings.webhooks.event_check_enabled() {
            return Ok(None);
        }
        let endpoints = &settings.webhooks.endpoints;
        let Some(url) = self.endpoint(
            endpoints.base_url.as_deref(),
            endpoints.event_check.as_deref(),
        ) else {
            return Ok(None);
        };
        let response = self
            .http
            .post(url)
            .json(event)
            .send()
            .await
            .context("event check request")?;
        let check = response
            .json::<EventCheckResponse>()
            .await
            .context("event check response")?;
        Ok(Some(check))
    }

    /// Notify the remote endpoint of an accepted event; the response is
    /// ignored.
    pub async fn event_callback(&self, event: &Event, settings: &Settings) -> Result<()> {
        if !settings.webhooks.event_callback_enabled() {
            return Ok(());
        }
        let endpoints = &settings.webhooks.endpoints;
        let Some(url) = self.endpoint(
            endpoints.base_url.as_deref(),
            endpoints.event_callback.as_deref(),
        ) else {
            return Ok(());
        };
        self.http
            .post(url)
            .json(event)
            .send()
            .await
            .context("event callback request")?;
        Ok(())
    }

    /// Look up an unknown identity. `Ok(None)` means the endpoint gave no
    /// usable response; connect-level failures propagate.
    pub async fn pubkey_check(
        &self,
        pubkey: &str,
        amount: i64,
        settings: &Settings,
    ) -> Result<Option<PubkeyCheckResponse>> {
        let endpoints = &settings.webhooks.endpoints;
        let Some(url) = self.endpoint(
            endpoints.base_url.as_deref(),
            endpoints.pubkey_check.as_deref(),
        ) else {
            return Ok(None);
        };
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "pubkey": pubkey, "amount": amount }))
            .send()
            .await
            .context("pubkey check request")?;
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "pubkey check returned error status");
            return Ok(None);
        }
        match response.json::<PubkeyCheckResponse>().await {
            Ok(check) => Ok(Some(check)),
            Err(e) => {
                tracing::warn!(error = %e, "pubkey check response undecodable");
                Ok(None)
            }
        }
    }

    /// Request a balance top-up for `pubkey`; true iff the endpoint reported
    /// success. Connect-level failures propagate.
    pub async fn top_up(&self, pubkey: &str, amount: i64, settings: &Settings) -> Result<bool> {
        let endpoints = &settings.webhooks.endpoints;
        let Some(url) = self.endpoint(
            endpoints.base_url.as_deref(),
            endpoints.top_ups.as_deref(),
        ) else {
            return Ok(false);
        };
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "pubkey": pubkey, "amount": amount }))
            .send()
            .await
            .context("top up request")?;
        if !response.status().is_success() {
            return Ok(false);
        }
        match response.json::<TopUpResponse>().await {
            Ok(r) => Ok(r.success),
            Err(_) => Ok(false),
        }
    }
}
