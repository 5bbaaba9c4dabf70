use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

/// Pool knobs read from `MWSFLOW_DB_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub disable_jit: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
            disable_jit: true,
        }
    }
}

impl PoolSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_connections = env_num::<u32>("MWSFLOW_DB_MAX_CONNECTIONS")
            .unwrap_or(defaults.max_connections)
            .clamp(1, 32);
        let acquire_secs = env_num::<u64>("MWSFLOW_DB_ACQUIRE_TIMEOUT_SECS")
            .unwrap_or(defaults.acquire_timeout.as_secs())
            .clamp(1, 60);
        let disable_jit = std::env::var("MWSFLOW_DB_DISABLE_JIT")
            .ok()
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(defaults.disable_jit);

        Self {
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_secs),
            disable_jit,
        }
    }
}

fn env_num<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

pub async fn make_pool(database_url: &str) -> anyhow::Result<PgPool> {
    connect(database_url, PoolSettings::from_env()).await
}

pub async fn connect(database_url: &str, settings: PoolSettings) -> anyhow::Result<PgPool> {
    let disable_jit = settings.disable_jit;
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    tracing::debug!(
        max_connections = settings.max_connections,
        acquire_timeout_secs = settings.acquire_timeout.as_secs(),
        disable_jit,
        "database pool ready"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
