//! The event admission pipeline.
//!
//! One submission runs the stages in a fixed order; the first failing stage
//! ends the run with a single rejection acknowledgement and no further side
//! effects. Accepted events are handed to a kind-dispatch strategy, which
//! emits the success acknowledgement itself.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;

use crate::config::{kinds_match, RateLimitRule, Settings, SettingsStore};
use crate::event::{unix_now, verify_event, Event};
use crate::protocol::{CommandResult, CommandSink, Rejection};
use crate::ratelimit::RateLimiter;
use crate::strategy::StrategyFactory;
use crate::users::UserRepository;
use crate::webhook::WebhookClient;

/// Per-connection context threaded through each admission.
pub struct ClientContext {
    /// Address the client connected from.
    pub ip: IpAddr,
    /// Outbound acknowledgement writer for this connection.
    pub sink: CommandSink,
}

/// Composes validation, policy, rate limiting, economic gating, webhooks,
/// and kind dispatch for every submitted event.
pub struct AdmissionPipeline {
    settings: SettingsStore,
    limiter: Arc<RateLimiter>,
    users: UserRepository,
    webhooks: WebhookClient,
    factory: Arc<dyn StrategyFactory>,
}

impl AdmissionPipeline {
    pub fn new(
        settings: SettingsStore,
        limiter: Arc<RateLimiter>,
        users: UserRepository,
        webhooks: WebhookClient,
        factory: Arc<dyn StrategyFactory>,
    ) -> Self {
        Self {
            settings,
            limiter,
            users,
            webhooks,
            factory,
        }
    }

    /// Run one submission through the pipeline.
    ///
    /// Emits exactly one acknowledgement per submission, except on transport
    /// faults (datastore or inline webhook), which propagate without any
    /// acknowledgement so the connection can surface them.
    pub async fn handle(&self, event: Event, ctx: &ClientContext) -> Result<()> {
        let settings = self.settings.current();
        let now = unix_now();
        match self.admit(&event, ctx, &settings, now).await? {
            None => Ok(()),
            Some(rejection) => {
                ctx.sink
                    .send(&CommandResult::rejected(&event.id, &rejection));
                Ok(())
            }
        }
    }

    /// `None` means the event was handed to a strategy which acknowledged it.
    async fn admit(
        &self,
        event: &Event,
        ctx: &ClientContext,
        settings: &Arc<Settings>,
        now: u64,
    ) -> Result<Option<Rejection>> {
        if let Err(rejection) = verify_event(event) {
            return Ok(Some(rejection));
        }

        let expires_at = match event.expires_at() {
            Some(expiry) if expiry <= now => return Ok(Some(Rejection::Expired)),
            other => other,
        };

        if self.is_rate_limited(event, ctx.ip, settings) {
            return Ok(Some(Rejection::RateLimited));
        }

        if let Err(rejection) = crate::policy::evaluate(event, settings, now) {
            return Ok(Some(rejection));
        }

        if let Some(rejection) = self.check_admission(event, settings).await? {
            return Ok(Some(rejection));
        }

        // Remote veto; a transport fault here aborts without acknowledgement.
        if let Some(check) = self.webhooks.event_check(event, settings).await? {
            if !check.success {
                return Ok(Some(Rejection::Vetoed(check.reason.unwrap_or_default())));
            }
        }

        let Some(strategy) = self.factory.resolve(event) else {
            return Ok(Some(Rejection::Unsupported));
        };

        self.charge_publication_fee(event, settings).await?;

        // The fee above stays charged even when execution fails.
        if let Err(e) = strategy.execute(event, expires_at, &ctx.sink).await {
            tracing::warn!(event = %event.id, error = %e, "event strategy failed");
            return Ok(Some(Rejection::Unprocessable));
        }

        if settings.webhooks.event_callback_enabled() {
            let webhooks = self.webhooks.clone();
            let settings = settings.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = webhooks.event_callback(&event, &settings).await {
                    tracing::warn!(event = %event.id, error = %e, "event callback failed");
                }
            });
        }

        Ok(None)
    }

    /// Hit every applicable rate limit rule; limited when any window
    /// overflows. Whitelisted identities bypass without consuming counters.
    fn is_rate_limited(&self, event: &Event, ip: IpAddr, settings: &Settings) -> bool {
        let whitelists = &settings.limits.event.whitelists;
        if whitelists.pubkeys.iter().any(|p| p == &event.pubkey) {
            return false;
        }
        let ip_str = ip.to_string();
        if whitelists.ip_addresses.iter().any(|a| a == &ip_str) {
            return false;
        }
        let mut limited = false;
        for rule in &settings.limits.event.rate_limits {
            if !kinds_match(&rule.kinds, event.kind) {
                continue;
            }
            let key = rate_limit_key(&event.pubkey, rule);
            // Every applicable window is counted, even after a limit fires.
            if self.limiter.hit(&key, 1, rule) {
                limited = true;
            }
        }
        limited
    }

    /// Paid-admission gate: admission state, publication-fee coverage with
    /// automatic top-up, and the configured minimum balance.
    async fn check_admission(
        &self,
        event: &Event,
        settings: &Settings,
    ) -> Result<Option<Rejection>> {
        if !settings.payments.enabled {
            return Ok(None);
        }
        let schedules = &settings.payments.fee_schedules;
        let applicable = schedules
            .admission
            .iter()
            .filter(|s| s.enabled && !s.exempts(&event.pubkey))
            .count();
        if applicable == 0 {
            return Ok(None);
        }

        let Some(user) = self.users.find_by_pubkey(&event.pubkey, settings).await? else {
            return Ok(Some(Rejection::NotAdmitted));
        };
        if !user.is_admitted {
            return Ok(Some(Rejection::NotAdmitted));
        }

        let mut balance = user.balance;
        if let Some(fee) = schedules.publication.first() {
            if fee.enabled && balance < fee.amount {
                let top_up_enabled = schedules
                    .top_up
                    .first()
                    .map(|s| s.enabled)
                    .unwrap_or(false);
                let topped = top_up_enabled
                    && self.users.top_up_pubkey(&event.pubkey, settings).await?;
                if !topped {
                    return Ok(Some(Rejection::InsufficientBalance));
                }
                balance = self.users.get_balance_by_pubkey(&event.pubkey).await?;
            }
        }

        let min_balance = settings.limits.event.pubkey.min_balance;
        if min_balance > 0 && balance < min_balance {
            return Ok(Some(Rejection::InsufficientBalance));
        }
        Ok(None)
    }

    /// Debit the first publication fee schedule right before execution.
    async fn charge_publication_fee(&self, event: &Event, settings: &Settings) -> Result<()> {
        if !settings.payments.enabled {
            return Ok(());
        }
        let Some(fee) = settings.payments.fee_schedules.publication.first() else {
            return Ok(());
        };
        if !fee.enabled || fee.amount <= 0 || fee.exempts(&event.pubkey) {
            return Ok(());
        }
        self.users
            .decrement_user_balance(&event.pubkey, fee.amount)
            .await
    }
}

/// Window key for one rule: scoped by period, and by the rule's kinds list
/// when present (stable JSON rendering).
fn rate_limit_key(pubkey: &str, rule: &RateLimitRule) -> String {
    match &rule.kinds {
        Some(kinds) => format!(
            "{}:events:{}:{}",
            pubkey,
            rule.period,
            serde_json::json!(kinds)
        ),
        None => format!("{}:events:{}", pubkey, rule.period),
    }
}
