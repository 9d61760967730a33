//! Pubkey identity records and balance accounting.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::config::Settings;
use crate::db::DbPool;
use crate::event::unix_now;
use crate::webhook::WebhookClient;

/// How long a failed remote lookup blocks repeat lookups for a pubkey.
const BLOCKED_TTL: Duration = Duration::from_secs(60);

/// One identity row. Balances are exact integers in millisatoshis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub pubkey: String,
    pub is_admitted: bool,
    pub balance: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub tos_accepted_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    pubkey: Vec<u8>,
    is_admitted: bool,
    balance: i64,
    created_at: i64,
    updated_at: i64,
    tos_accepted_at: Option<i64>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            pubkey: hex::encode(row.pubkey),
            is_admitted: row.is_admitted,
            balance: row.balance,
            created_at: row.created_at,
            updated_at: row.updated_at,
            tos_accepted_at: row.tos_accepted_at,
        }
    }
}

/// Balance for the admin endpoint; `None` when the pubkey is unknown.
pub async fn fetch_balance(pool: &DbPool, pubkey: &str) -> Result<Option<i64>> {
    // An undecodable pubkey cannot name a stored user.
    let Ok(key) = hex::decode(pubkey) else {
        return Ok(None);
    };
    let balance: Option<i64> =
        sqlx::query_scalar("SELECT balance FROM users WHERE pubkey = ?1")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(balance)
}

fn decode_pubkey(pubkey: &str) -> Result<Vec<u8>> {
    hex::decode(pubkey).context("decoding pubkey hex")
}

/// Mapping from pubkey identity to admission state and balance, backed by the
/// datastore, a short-lived negative cache, and an optional remote lookup.
#[derive(Clone)]
pub struct UserRepository {
    pool: DbPool,
    cache: Arc<TtlCache>,
    webhooks: WebhookClient,
}

impl UserRepository {
    pub fn new(pool: DbPool, cache: Arc<TtlCache>, webhooks: WebhookClient) -> Self {
        Self {
            pool,
            cache,
            webhooks,
        }
    }

    /// Resolve a pubkey to its user record.
    ///
    /// A cached negative entry short-circuits without touching the datastore
    /// or the webhook. Unknown pubkeys fall through to the pubkey-check
    /// webhook when configured: an admitted response is provisioned into the
    /// datastore; anything else blocks the pubkey for [`BLOCKED_TTL`].
    pub async fn find_by_pubkey(
        &self,
        pubkey: &str,
        settings: &Settings,
    ) -> Result<Option<User>> {
        let blocked_key = format!("{pubkey}:is-blocked");
        if self.cache.get(&blocked_key).is_some() {
            return Ok(None);
        }
        if let Some(user) = self.load(pubkey).await? {
            return Ok(Some(user));
        }
        if !settings.webhooks.pubkey_check_enabled() {
            return Ok(None);
        }
        let amount = settings
            .payments
            .fee_schedules
            .top_up
            .first()
            .map(|s| s.amount)
            .unwrap_or(0);
        match self.webhooks.pubkey_check(pubkey, amount, settings).await? {
            Some(check) if check.is_admitted => {
                let now = unix_now() as i64;
                let user = User {
                    pubkey: pubkey.to_string(),
                    is_admitted: true,
                    balance: check.balance,
                    created_at: now,
                    updated_at: now,
                    tos_accepted_at: Some(now),
                };
                self.upsert(&user).await?;
                Ok(Some(user))
            }
            _ => {
                self.cache.set(&blocked_key, "true", BLOCKED_TTL);
                Ok(None)
            }
        }
    }

    async fn load(&self, pubkey: &str) -> Result<Option<User>> {
        let key = decode_pubkey(pubkey)?;
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT pubkey, is_admitted, balance, created_at, updated_at, tos_accepted_at
            FROM users
            WHERE pubkey = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Insert or merge a user row. On conflict every column is merged except
    /// `pubkey`, `balance`, and `created_at`, which are insert-only.
    pub async fn upsert(&self, user: &User) -> Result<u64> {
        let key = decode_pubkey(&user.pubkey)?;
        let result = sqlx::query(
            r#"
            INSERT INTO users (pubkey, is_admitted, balance, created_at, updated_at, tos_accepted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(pubkey) DO UPDATE SET
                is_admitted = excluded.is_admitted,
                updated_at = excluded.updated_at,
                tos_accepted_at = excluded.tos_accepted_at
            "#,
        )
        .bind(key)
        .bind(user.is_admitted)
        .bind(user.balance)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.tos_accepted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Current balance, zero when the pubkey is unknown.
    pub async fn get_balance_by_pubkey(&self, pubkey: &str) -> Result<i64> {
        Ok(fetch_balance(&self.pool, pubkey).await?.unwrap_or(0))
    }

    /// Atomically add `amount` to the balance.
    pub async fn increment_user_balance(&self, pubkey: &str, amount: i64) -> Result<()> {
        sqlx::query("UPDATE users SET balance = balance + ?2 WHERE pubkey = ?1")
            .bind(decode_pubkey(pubkey)?)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically subtract `amount` from the balance.
    pub async fn decrement_user_balance(&self, pubkey: &str, amount: i64) -> Result<()> {
        sqlx::query("UPDATE users SET balance = balance - ?2 WHERE pubkey = ?1")
            .bind(decode_pubkey(pubkey)?)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Request a top-up through the webhook and credit the balance on
    /// success. Returns false when top-ups are not configured or refused.
    pub async fn top_up_pubkey(&self, pubkey: &str, settings: &Settings) -> Result<bool> {
        if !settings.webhooks.top_up_enabled() {
            return Ok(false);
        }
        let Some(schedule) = settings.payments.fee_schedules.top_up.first() else {
            return Ok(false);
        };
        if !self.webhooks.top_up(pubkey, schedule.amount, settings).await? {
            return Ok(false);
        }
        self.increment_user_balance(pubkey, schedule.amount).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeeSchedule, Settings};
    use crate::testutil::{hook_settings, mock_webhook_server, temp_db};

    fn sample_user(pubkey: &str, balance: i64) -> User {
        User {
            pubkey: pubkey.into(),
            is_admitted: true,
            balance,
            created_at: 100,
            updated_at: 100,
            tos_accepted_at: Some(100),
        }
    }

    async fn repo_without_hooks() -> (UserRepository, tempfile::TempDir) {
        let (pool, dir) = temp_db().await;
        let repo = UserRepository::new(
            pool,
            Arc::new(TtlCache::new()),
            WebhookClient::new(None).unwrap(),
        );
        (repo, dir)
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips() {
        let (repo, _dir) = repo_without_hooks().await;
        let user = sample_user("ab".repeat(32).as_str(), 500);
        assert_eq!(repo.upsert(&user).await.unwrap(), 1);
        let loaded = repo
            .find_by_pubkey(&user.pubkey, &Settings::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, user);
    }

    #[tokio::test]
    async fn upsert_conflict_keeps_balance_and_created_at() {
        let (repo, _dir) = repo_without_hooks().await;
        let pubkey = "ab".repeat(32);
        let user = sample_user(&pubkey, 500);
        repo.upsert(&user).await.unwrap();

        let mut updated = sample_user(&pubkey, 9_999);
        updated.is_admitted = false;
        updated.created_at = 777;
        updated.updated_at = 200;
        updated.tos_accepted_at = Some(200);
        repo.upsert(&updated).await.unwrap();

        let loaded = repo
            .find_by_pubkey(&pubkey, &Settings::default())
            .await
            .unwrap()
            .unwrap();
        // Merged columns move, insert-only columns stay.
        assert!(!loaded.is_admitted);
        assert_eq!(loaded.updated_at, 200);
        assert_eq!(loaded.tos_accepted_at, Some(200));
        assert_eq!(loaded.balance, 500);
        assert_eq!(loaded.created_at, 100);
    }

    #[tokio::test]
    async fn balance_arithmetic_is_exact() {
        let (repo, _dir) = repo_without_hooks().await;
        let pubkey = "cd".repeat(32);
        repo.upsert(&sample_user(&pubkey, 1_000_000_000_000))
            .await
            .unwrap();
        repo.increment_user_balance(&pubkey, 123_456_789).await.unwrap();
        repo.decrement_user_balance(&pubkey, 456_789).await.unwrap();
        assert_eq!(
            repo.get_balance_by_pubkey(&pubkey).await.unwrap(),
            1_000_123_000_000
        );
    }

    #[tokio::test]
    async fn balance_defaults_to_zero_for_unknown() {
        let (repo, _dir) = repo_without_hooks().await;
        assert_eq!(
            repo.get_balance_by_pubkey(&"ef".repeat(32)).await.unwrap(),
            0
        );
        assert_eq!(
            fetch_balance(&repo.pool, &"ef".repeat(32)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn unknown_pubkey_without_webhook_is_none() {
        let (repo, _dir) = repo_without_hooks().await;
        let found = repo
            .find_by_pubkey(&"ab".repeat(32), &Settings::default())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn admitted_lookup_provisions_user() {
        let server = mock_webhook_server(serde_json::json!({
            "pubkey": "xx",
            "isAdmitted": true,
            "balance": 7000
        }))
        .await;
        let mut settings = hook_settings(&server.base_url());
        settings.payments.fee_schedules.top_up = vec![FeeSchedule {
            enabled: true,
            amount: 500,
            whitelists: None,
        }];
        let (pool, _dir) = temp_db().await;
        let repo = UserRepository::new(
            pool,
            Arc::new(TtlCache::new()),
            WebhookClient::new(None).unwrap(),
        );
        let pubkey = "ab".repeat(32);
        let user = repo
            .find_by_pubkey(&pubkey, &settings)
            .await
            .unwrap()
            .unwrap();
        assert!(user.is_admitted);
        assert_eq!(user.balance, 7000);
        // The configured top-up amount rides along on the lookup.
        let (_, _, body) = server.last_request();
        assert_eq!(body["amount"], serde_json::json!(500));

        // The row is persisted: a second lookup is served from the datastore.
        let again = repo
            .find_by_pubkey(&pubkey, &settings)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.balance, 7000);
        assert_eq!(server.request_count(), 1);
    }

    #[tokio::test]
    async fn denied_lookup_is_cached() {
        let server = mock_webhook_server(serde_json::json!({
            "pubkey": "xx",
            "isAdmitted": false,
            "balance": 0
        }))
        .await;
        let settings = hook_settings(&server.base_url());
        let (pool, _dir) = temp_db().await;
        let repo = UserRepository::new(
            pool,
            Arc::new(TtlCache::new()),
            WebhookClient::new(None).unwrap(),
        );
        let pubkey = "ab".repeat(32);
        assert!(repo
            .find_by_pubkey(&pubkey, &settings)
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .find_by_pubkey(&pubkey, &settings)
            .await
            .unwrap()
            .is_none());
        // The second miss is answered by the negative cache.
        assert_eq!(server.request_count(), 1);
    }

    #[tokio::test]
    async fn lookup_transport_failure_propagates() {
        let settings = hook_settings("http://127.0.0.1:1");
        let (pool, _dir) = temp_db().await;
        let repo = UserRepository::new(
            pool,
            Arc::new(TtlCache::new()),
            WebhookClient::new(None).unwrap(),
        );
        assert!(repo
            .find_by_pubkey(&"ab".repeat(32), &settings)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn top_up_credits_balance_on_success() {
        let server = mock_webhook_server(serde_json::json!({"success": true})).await;
        let mut settings = hook_settings(&server.base_url());
        settings.payments.fee_schedules.top_up = vec![FeeSchedule {
            enabled: true,
            amount: 500,
            whitelists: None,
        }];
        let (pool, _dir) = temp_db().await;
        let repo = UserRepository::new(
            pool,
            Arc::new(TtlCache::new()),
            WebhookClient::new(None).unwrap(),
        );
        let pubkey = "ab".repeat(32);
        repo.upsert(&sample_user(&pubkey, 50)).await.unwrap();
        assert!(repo.top_up_pubkey(&pubkey, &settings).await.unwrap());
        assert_eq!(repo.get_balance_by_pubkey(&pubkey).await.unwrap(), 550);
    }

    #[tokio::test]
    async fn top_up_refused_or_unconfigured_is_false() {
        let server = mock_webhook_server(serde_json::json!({"success": false})).await;
        let mut settings = hook_settings(&server.base_url());
        settings.payments.fee_schedules.top_up = vec![FeeSchedule {
            enabled: true,
            amount: 500,
            whitelists: None,
        }];
        let (pool, _dir) = temp_db().await;
        let repo = UserRepository::new(
            pool,
            Arc::new(TtlCache::new()),
            WebhookClient::new(None).unwrap(),
        );
        let pubkey = "ab".repeat(32);
        repo.upsert(&sample_user(&pubkey, 50)).await.unwrap();
        assert!(!repo.top_up_pubkey(&pubkey, &settings).await.unwrap());
        assert_eq!(repo.get_balance_by_pubkey(&pubkey).await.unwrap(), 50);

        // Disabled in settings entirely.
        assert!(!repo
            .top_up_pubkey(&pubkey, &Settings::default())
            .await
            .unwrap());
    }
}
