mod admission;
mod cache;
mod config;
mod db;
mod event;
mod policy;
mod protocol;
mod ratelimit;
mod server;
mod strategy;
#[cfg(test)]
mod testutil;
mod users;
mod webhook;
mod ws;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};

use config::{EnvConfig, Settings, SettingsStore};

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "tollr", author, version, about = "Paid-admission Nostr relay")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the database schema at `DATABASE_URL`.
    Init,
    /// Validate the settings file and print its normalized form.
    CheckConfig,
    /// Launch the WebSocket and HTTP services.
    Serve,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let env_cfg = EnvConfig::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            let pool = db::connect(&env_cfg.database_url).await?;
            db::init_schema(&pool).await?;
        }
        Commands::CheckConfig => {
            let settings = Settings::from_file(&env_cfg.settings_file)?;
            settings.warn_on_unused_schedules();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Serve => {
            let settings = Settings::from_file(&env_cfg.settings_file)?;
            settings.warn_on_unused_schedules();
            let settings_store = SettingsStore::new(settings);
            let _watch = settings_store
                .spawn_file_watch(env_cfg.settings_file.clone(), Duration::from_secs(5));

            let pool = db::connect(&env_cfg.database_url).await?;
            db::init_schema(&pool).await?;

            let cache = Arc::new(cache::TtlCache::new());
            let limiter = Arc::new(ratelimit::RateLimiter::new());
            let webhooks = webhook::WebhookClient::new(env_cfg.vida_api_key.clone())?;
            let user_repo =
                users::UserRepository::new(pool.clone(), cache.clone(), webhooks.clone());
            let event_store = strategy::EventStore::new(pool.clone());
            let factory = Arc::new(strategy::KindStrategyFactory::new(event_store.clone()));
            let pipeline = Arc::new(admission::AdmissionPipeline::new(
                settings_store.clone(),
                limiter.clone(),
                user_repo,
                webhooks,
                factory,
            ));

            // Housekeeping: idle rate windows, dead cache entries, events
            // whose expiry passed.
            {
                let limiter = limiter.clone();
                let cache = cache.clone();
                let event_store = event_store.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(60));
                    loop {
                        ticker.tick().await;
                        limiter.sweep(24 * 3_600 * 1_000);
                        cache.purge();
                        if let Err(e) = event_store.delete_expired(event::unix_now()).await {
                            tracing::warn!(error = %e, "expired event sweep failed");
                        }
                    }
                });
            }

            let http_addr: SocketAddr = env_cfg.bind_http.parse()?;
            let ws_addr: SocketAddr = env_cfg.bind_ws.parse()?;
            let api_state = server::ApiState {
                pool,
                settings: settings_store,
                api_key: env_cfg.relay_api_key.clone(),
            };
            tracing::info!(%http_addr, %ws_addr, "relay listening");
            tokio::try_join!(
                server::serve_http(http_addr, api_state, std::future::pending()),
                ws::serve_ws(ws_addr, pipeline, std::future::pending())
            )?;
        }
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
    run(Cli::parse()).await
}
