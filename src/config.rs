//! Configuration: process environment plus the admission settings file.

use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// SQLite database URL, e.g. `sqlite://relay.db`.
    pub database_url: String,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Path to the JSON admission settings file.
    pub settings_file: PathBuf,
    /// API key gating the admin HTTP endpoint.
    pub relay_api_key: Option<String>,
    /// Token appended to outbound webhook calls.
    pub vida_api_key: Option<String>,
}

impl EnvConfig {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let database_url = env::var("DATABASE_URL")?;
        let bind_http = env::var("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS")?;
        let settings_file = PathBuf::from(env::var("SETTINGS_FILE")?);
        let relay_api_key = env::var("RELAY_API_KEY").ok().filter(|s| !s.is_empty());
        let vida_api_key = env::var("VIDA_API_KEY").ok().filter(|s| !s.is_empty());
        Ok(Self {
            database_url,
            bind_http,
            bind_ws,
            settings_file,
            relay_api_key,
            vida_api_key,
        })
    }
}

/// Matches an event kind either exactly or by inclusive range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum KindFilter {
    Single(u16),
    Range([u16; 2]),
}

impl KindFilter {
    /// Whether the filter covers `kind`.
    pub fn matches(&self, kind: u16) -> bool {
        match self {
            KindFilter::Single(k) => *k == kind,
            KindFilter::Range([lo, hi]) => (*lo..=*hi).contains(&kind),
        }
    }
}

/// Whether any filter in `kinds` covers `kind`; `None` covers everything.
pub fn kinds_match(kinds: &Option<Vec<KindFilter>>, kind: u16) -> bool {
    match kinds {
        Some(filters) => filters.iter().any(|f| f.matches(kind)),
        None => true,
    }
}

/// One content-length bound, optionally scoped to specific kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentLimit {
    /// Maximum content length in bytes; zero disables the bound.
    pub max_length: u64,
    pub kinds: Option<Vec<KindFilter>>,
}

/// Content bounds accept either a single record or an ordered sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ContentLimits {
    Single(ContentLimit),
    Many(Vec<ContentLimit>),
}

impl Default for ContentLimits {
    fn default() -> Self {
        ContentLimits::Many(vec![])
    }
}

impl ContentLimits {
    /// The records in declaration order.
    pub fn records(&self) -> &[ContentLimit] {
        match self {
            ContentLimits::Single(record) => std::slice::from_ref(record),
            ContentLimits::Many(records) => records,
        }
    }
}

/// Timestamp skew bounds in seconds; zero disables a bound.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CreatedAtLimits {
    pub max_positive_delta: u64,
    pub max_negative_delta: u64,
}

/// Proof-of-work bound on the event ID.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventIdLimits {
    pub min_leading_zero_bits: u32,
}

/// Identity bounds: proof-of-work, prefix lists, minimum balance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PubkeyLimits {
    pub min_leading_zero_bits: u32,
    /// Minimum balance in millisatoshis; zero disables the bound.
    pub min_balance: i64,
    /// Hex prefixes; a non-empty list admits only matching pubkeys.
    pub whitelist: Option<Vec<String>>,
    /// Hex prefixes; matching pubkeys are refused.
    pub blacklist: Option<Vec<String>>,
}

/// Kind allow/deny lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KindLimits {
    pub whitelist: Option<Vec<KindFilter>>,
    pub blacklist: Option<Vec<KindFilter>>,
}

/// One sliding-window rate limit rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    /// Window length in milliseconds.
    pub period: u64,
    /// Maximum weighted hits inside the window.
    pub rate: u64,
    /// Kinds the rule applies to; absent means all kinds.
    #[serde(default)]
    pub kinds: Option<Vec<KindFilter>>,
}

/// Identities exempt from rate limiting (exact matches, not prefixes).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Whitelists {
    pub pubkeys: Vec<String>,
    pub ip_addresses: Vec<String>,
}

/// Per-event admission bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventLimits {
    pub content: ContentLimits,
    pub created_at: CreatedAtLimits,
    pub event_id: EventIdLimits,
    pub pubkey: PubkeyLimits,
    pub kind: KindLimits,
    pub rate_limits: Vec<RateLimitRule>,
    pub whitelists: Whitelists,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    pub event: EventLimits,
}

/// Pubkeys exempted from one fee schedule (hex prefixes).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeeWhitelists {
    pub pubkeys: Vec<String>,
}

/// One fee schedule entry; only the first entry of a sequence is applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeeSchedule {
    pub enabled: bool,
    /// Fee amount in millisatoshis.
    pub amount: i64,
    pub whitelists: Option<FeeWhitelists>,
}

impl FeeSchedule {
    /// Whether `pubkey` matches one of the schedule's exemption prefixes.
    pub fn exempts(&self, pubkey: &str) -> bool {
        self.whitelists
            .as_ref()
            .map_or(false, |w| w.pubkeys.iter().any(|p| pubkey.starts_with(p.as_str())))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeeSchedules {
    pub admission: Vec<FeeSchedule>,
    pub publication: Vec<FeeSchedule>,
    pub top_up: Vec<FeeSchedule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Payments {
    pub enabled: bool,
    pub fee_schedules: FeeSchedules,
}

/// Endpoint paths joined onto `baseURL`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookEndpoints {
    #[serde(rename = "baseURL")]
    pub base_url: Option<String>,
    pub pubkey_check: Option<String>,
    pub event_check: Option<String>,
    pub event_callback: Option<String>,
    pub top_ups: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Webhooks {
    pub pubkey_checks: bool,
    pub event_checks: bool,
    pub event_callbacks: bool,
    pub top_ups: bool,
    pub endpoints: WebhookEndpoints,
}

impl Webhooks {
    pub fn pubkey_check_enabled(&self) -> bool {
        self.pubkey_checks
            && self.endpoints.base_url.is_some()
            && self.endpoints.pubkey_check.is_some()
    }

    pub fn event_check_enabled(&self) -> bool {
        self.event_checks
            && self.endpoints.base_url.is_some()
            && self.endpoints.event_check.is_some()
    }

    pub fn event_callback_enabled(&self) -> bool {
        self.event_callbacks
            && self.endpoints.base_url.is_some()
            && self.endpoints.event_callback.is_some()
    }

    pub fn top_up_enabled(&self) -> bool {
        self.top_ups && self.endpoints.base_url.is_some() && self.endpoints.top_ups.is_some()
    }
}

/// Relay identity published on the info document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayInfoSettings {
    pub name: String,
    pub description: String,
}

impl Default for RelayInfoSettings {
    fn default() -> Self {
        Self {
            name: "tollr".into(),
            description: String::new(),
        }
    }
}

/// Admission policy snapshot loaded from the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub info: RelayInfoSettings,
    pub limits: Limits,
    pub payments: Payments,
    pub webhooks: Webhooks,
}

impl Settings {
    /// Parse the JSON settings file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        let settings: Settings =
            serde_json::from_str(&data).context("parsing settings file")?;
        Ok(settings)
    }

    /// Warn when fee schedule sequences carry entries beyond the first.
    pub fn warn_on_unused_schedules(&self) {
        let schedules = &self.payments.fee_schedules;
        for (name, seq) in [
            ("admission", &schedules.admission),
            ("publication", &schedules.publication),
            ("topUp", &schedules.top_up),
        ] {
            if seq.len() > 1 {
                tracing::warn!(
                    schedule = name,
                    entries = seq.len(),
                    "only the first fee schedule entry is applied"
                );
            }
        }
    }
}

/// Shared handle to the active settings snapshot.
///
/// Admissions call [`SettingsStore::current`] once at entry and thread the
/// snapshot through every stage, so a concurrent reload never changes the
/// rules mid-admission.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<Arc<Settings>>>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// The currently-active snapshot.
    pub fn current(&self) -> Arc<Settings> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new snapshot; in-flight admissions keep the old one.
    pub fn replace(&self, settings: Settings) {
        let next = Arc::new(settings);
        match self.inner.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Poll the settings file and reload it whenever its mtime changes.
    pub fn spawn_file_watch(&self, path: PathBuf, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut last = fs::metadata(&path).and_then(|m| m.modified()).ok();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
                if modified == last {
                    continue;
                }
                last = modified;
                match Settings::from_file(&path) {
                    Ok(settings) => {
                        settings.warn_on_unused_schedules();
                        store.replace(settings);
                        tracing::info!(path = %path.display(), "settings reloaded");
                    }
                    Err(e) => tracing::warn!(error = %e, "settings reload failed"),
                }
            }
        })
    }
}
