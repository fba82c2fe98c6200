//! Read-only database access for the HTTP history endpoints. Uses the same
//! `bb8-tiberius` pool type as the writer but a distinct pool instance, per
//! spec.md §5's requirement that HTTP history reads MUST NOT share the
//! writer's connection.

use bb8::Pool;
use bb8_tiberius::ConnectionManager;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tiberius::{AuthMethod, Config as TiberiusConfig};

use crate::config::DatabaseConfig;
use crate::error::{Result, SilodError};

/// Builds a standalone connection pool against `config`. Called once for
/// the writer and once for the HTTP read path, per spec.md §5 — the two
/// never share a pool or connection.
pub async fn build_pool(config: &DatabaseConfig) -> Result<Pool<ConnectionManager>> {
    let username = std::env::var(&config.username_env)
        .map_err(|_| SilodError::Config(format!("env var {} not set", config.username_env)))?;
    let password = std::env::var(&config.password_env)
        .map_err(|_| SilodError::Config(format!("env var {} not set", config.password_env)))?;

    let mut tiberius_config = TiberiusConfig::new();
    tiberius_config.host(&config.host);
    tiberius_config.port(config.port);
    tiberius_config.database(&config.database);
    if let Some(instance) = &config.instance {
        tiberius_config.instance_name(instance);
    }
    tiberius_config.authentication(AuthMethod::sql_server(username, password));
    tiberius_config.trust_cert();

    let manager = ConnectionManager::new(tiberius_config);
    Pool::builder()
        .max_size(4)
        .build(manager)
        .await
        .map_err(|e| SilodError::Database(format!("failed to build connection pool: {e}")))
}

#[derive(Debug, Serialize)]
pub struct DbHistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub value: i32,
}

/// Returns rows from `table` for `external_code` within the last `hours`,
/// ordered oldest-first.
pub async fn query_history(
    pool: &Pool<ConnectionManager>,
    table: &str,
    external_code: &str,
    hours: i64,
) -> Result<Vec<DbHistoryPoint>> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| SilodError::Database(format!("failed to acquire read connection: {e}")))?;

    let query = format!(
        "SELECT quantity, updated_at FROM {table} WHERE external_code = @P1 \
         AND updated_at >= DATEADD(hour, @P2, GETDATE()) ORDER BY updated_at ASC"
    );
    let neg_hours = -(hours as i32);

    let rows = conn
        .query(query, &[&external_code, &neg_hours])
        .await
        .map_err(|e| SilodError::Database(e.to_string()))?
        .into_first_result()
        .await
        .map_err(|e| SilodError::Database(e.to_string()))?;

    rows.into_iter()
        .map(|row| {
            let value: i32 = row
                .get::<i32, _>("quantity")
                .ok_or_else(|| SilodError::Database("missing quantity column".to_string()))?;
            let updated_at: NaiveDateTime = row
                .get::<NaiveDateTime, _>("updated_at")
                .ok_or_else(|| SilodError::Database("missing updated_at column".to_string()))?;
            Ok(DbHistoryPoint {
                timestamp: DateTime::<Utc>::from_naive_utc_and_offset(updated_at, Utc),
                value,
            })
        })
        .collect()
}
