//! Storage endpoint parsing and pool bring-up.

use super::dialect::{Dialect, MysqlDialect, PostgresDialect, SqliteDialect};
use crate::core::config::StorageConfig;
use anyhow::{Context, Result};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::sync::Arc;

/// Storage engine selected by an endpoint string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Sqlite,
    Postgres,
    Mysql,
}

impl Engine {
    /// Dialect implementing this engine.
    pub fn dialect(self) -> Arc<dyn Dialect> {
        match self {
            Engine::Sqlite => Arc::new(SqliteDialect),
            Engine::Postgres => Arc::new(PostgresDialect),
            Engine::Mysql => Arc::new(MysqlDialect),
        }
    }
}

/// A parsed storage endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub engine: Engine,
    /// Connection URL handed to sqlx.
    pub url: String,
}

impl Endpoint {
    /// Parse `sqlite://path`, `postgres://...`, `postgresql://...`,
    /// `mysql://...`, or a bare path (embedded SQLite).
    pub fn parse(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            anyhow::bail!("storage endpoint is empty");
        }

        let (scheme, rest) = match endpoint.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => return Ok(Self::sqlite(endpoint)),
        };

        match scheme {
            "sqlite" => {
                if rest.is_empty() {
                    anyhow::bail!("sqlite endpoint has no database path");
                }
                Ok(Self::sqlite(rest))
            }
            "postgres" | "postgresql" => Ok(Self {
                engine: Engine::Postgres,
                url: endpoint.to_string(),
            }),
            "mysql" => Ok(Self {
                engine: Engine::Mysql,
                url: endpoint.to_string(),
            }),
            other => anyhow::bail!("unsupported storage scheme: {other}"),
        }
    }

    fn sqlite(path: &str) -> Self {
        // Create the database file on first use.
        let url = if path.contains('?') {
            format!("sqlite://{path}")
        } else {
            format!("sqlite://{path}?mode=rwc")
        };
        Self {
            engine: Engine::Sqlite,
            url,
        }
    }

    /// URL with any password replaced, for logs.
    pub fn redacted(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        match rest.split_once('@') {
            Some((userinfo, host)) => match userinfo.split_once(':') {
                Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
                None => self.url.clone(),
            },
            None => self.url.clone(),
        }
    }
}

/// Open a pool for `config.endpoint`, retrying until the database answers a
/// ping or the configured attempts are exhausted.
pub async fn connect(config: &StorageConfig) -> Result<(AnyPool, Arc<dyn Dialect>)> {
    sqlx::any::install_default_drivers();

    let endpoint = Endpoint::parse(&config.endpoint)?;
    let dialect = endpoint.engine.dialect();

    let max_connections = match (config.max_open_conns, endpoint.engine) {
        (0, Engine::Sqlite) => 4,
        (0, _) => 16,
        (n, _) => n,
    };
    let mut options = AnyPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(config.max_idle_conns.min(max_connections));
    if let Some(lifetime) = config.conn_max_lifetime() {
        options = options.max_lifetime(lifetime);
    }

    let attempts = config.startup_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = async {
            let pool = options.clone().connect(&endpoint.url).await?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            Ok::<_, sqlx::Error>(pool)
        }
        .await;

        match result {
            Ok(pool) => {
                tracing::info!(
                    endpoint = %endpoint.redacted(),
                    dialect = dialect.name(),
                    "connected to datastore"
                );
                return Ok((pool, dialect));
            }
            Err(err) if attempt < attempts => {
                tracing::warn!(
                    endpoint = %endpoint.redacted(),
                    error = %err,
                    attempt,
                    "datastore not ready, retrying"
                );
                tokio::time::sleep(config.startup_backoff()).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to connect to {} after {} attempts",
                        endpoint.redacted(),
                        attempts
                    )
                });
            }
        }
    }
}
