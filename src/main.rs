use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use subscription_engine::config::Config;
use subscription_engine::engine::cascade::ChannelCascadeScheduler;
use subscription_engine::engine::{Engine, Repositories};
use subscription_engine::services::signature::HmacWebhookVerifier;
use subscription_engine::{routes, worker, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;

    let _sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    init_tracing();

    let pool = establish_connection(&config.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let (scheduler, jobs) = ChannelCascadeScheduler::channel();
    let verifier = Arc::new(HmacWebhookVerifier::new(
        &config.webhook_secret,
        config.webhook_tolerance,
    ));
    let engine = Engine::new(
        Repositories::postgres(pool),
        verifier,
        Arc::new(scheduler),
        &config.engine,
    );
    let state = AppState::new(engine);

    worker::start_background_workers(state.clone(), jobs, config.engine.audit_interval).await;

    let app = routes::router(state);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "subscription engine listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// `RUST_LOG` drives the filter; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,tower_http=info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(sentry_tracing::layer());
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("failed to verify database connection")?;

    info!("connected to the database");
    Ok(pool)
}
