//! PostgreSQL pool and schema for the trust core.
//!
//! Every connection carries a server-side `statement_timeout` equal to the
//! configured query timeout, so a statement abandoned by a client-side
//! timeout does not keep holding the audit append lock.

use crate::config::DatabaseConfig;
use secrecy::ExposeSecret;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Name reported in `pg_stat_activity`.
const APPLICATION_NAME: &str = "trust-service";

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions, sqlx::Error> {
    let timeout_ms = Duration::from_secs(config.query_timeout_secs.max(1)).as_millis();
    Ok(PgConnectOptions::from_str(config.url.expose_secret())?
        .application_name(APPLICATION_NAME)
        .options([("statement_timeout", timeout_ms.to_string())]))
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let options = connect_options(config)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.query_timeout_secs.max(1)))
        .test_before_acquire(true)
        .connect_with(options)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        statement_timeout_secs = config.query_timeout_secs,
        "PostgreSQL pool ready"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await?;
    tracing::info!(known = MIGRATOR.iter().count(), "Trust schema is current");
    Ok(())
}
