//! Shared helpers for unit tests: signing, scratch databases, mock webhooks.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

/// Serializes tests that mutate process environment variables.
pub static ENV_MUTEX: Mutex<()> = Mutex::new(());

use axum::{http::Uri, Json, Router};
use secp256k1::{Keypair, Message, Secp256k1};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::config::Settings;
use crate::db::{self, DbPool};
use crate::event::{Event, Tag};

/// Deterministic keypair; `seed` must be a valid non-zero secret byte.
pub fn keypair(seed: u8) -> (Keypair, String) {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    (kp, pubkey)
}

/// Build a correctly-hashed, correctly-signed event.
pub fn signed_event(
    kp: &Keypair,
    kind: u16,
    created_at: u64,
    tags: Vec<Tag>,
    content: &str,
) -> Event {
    let secp = Secp256k1::new();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let hash = Sha256::digest(arr.to_string().as_bytes());
    let msg = Message::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, kp);
    Event {
        id: hex::encode(hash),
        pubkey,
        kind,
        created_at,
        tags,
        content: content.into(),
        sig: hex::encode(sig.as_ref()),
    }
}

/// Scratch SQLite database with the relay schema applied.
pub async fn temp_db() -> (DbPool, TempDir) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("relay.db").display());
    let pool = db::connect(&url).await.unwrap();
    db::init_schema(&pool).await.unwrap();
    (pool, dir)
}

/// Settings with every webhook enabled against `base`.
pub fn hook_settings(base: &str) -> Settings {
    let mut settings = Settings::default();
    settings.webhooks.pubkey_checks = true;
    settings.webhooks.event_checks = true;
    settings.webhooks.event_callbacks = true;
    settings.webhooks.top_ups = true;
    settings.webhooks.endpoints.base_url = Some(base.to_string());
    settings.webhooks.endpoints.pubkey_check = Some("/pubkey-check".into());
    settings.webhooks.endpoints.event_check = Some("/event-check".into());
    settings.webhooks.endpoints.event_callback = Some("/event-callback".into());
    settings.webhooks.endpoints.top_ups = Some("/top-up".into());
    settings
}

type Recorded = (String, Option<String>, Value);

/// In-process webhook endpoint recording every request it serves.
pub struct MockWebhookServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    handle: tokio::task::JoinHandle<()>,
}

/// Serve `response` for every path.
pub async fn mock_webhook_server(response: Value) -> MockWebhookServer {
    mock_webhook_routes(vec![("/", response)]).await
}

/// Serve per-path responses; unknown paths fall back to the first entry.
pub async fn mock_webhook_routes(routes: Vec<(&str, Value)>) -> MockWebhookServer {
    let requests: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(vec![]));
    let routes: Vec<(String, Value)> = routes
        .into_iter()
        .map(|(p, v)| (p.to_string(), v))
        .collect();
    let reqs = requests.clone();
    let app = Router::new().fallback(move |uri: Uri, body: String| {
        let reqs = reqs.clone();
        let routes = routes.clone();
        async move {
            let parsed = serde_json::from_str(&body).unwrap_or(Value::Null);
            reqs.lock().unwrap().push((
                uri.path().to_string(),
                uri.query().map(str::to_string),
                parsed,
            ));
            let response = routes
                .iter()
                .find(|(p, _)| p == uri.path())
                .or_else(|| routes.first())
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            Json(response)
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    MockWebhookServer {
        addr,
        requests,
        handle,
    }
}

impl MockWebhookServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn last_request(&self) -> Recorded {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests_for(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, _)| p == path)
            .count()
    }
}

impl Drop for MockWebhookServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
