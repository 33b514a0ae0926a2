//! Application-database administration over the admin DSN.
//!
//! Database and user names are SQL identifiers and cannot be bound as
//! parameters; every name that reaches this module is derived by
//! `webfleet-core::naming` from a validated site identifier, and the guard
//! here rejects anything else outright.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};

use crate::error::{InfraError, InfraResult};
use crate::traits::AppDbOps;

static SAFE_IDENTIFIER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-z0-9_.]+$").expect("valid pattern"));

fn ensure_safe(name: &str) -> InfraResult<()> {
    if SAFE_IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(InfraError::invariant(
            "appdb",
            format!("unsafe identifier reached the database adapter: {name}"),
        ))
    }
}

/// [`AppDbOps`] against a MariaDB admin connection.
#[derive(Clone)]
pub struct MariaDbAdminOps {
    pool: MySqlPool,
}

impl MariaDbAdminOps {
    /// Connect to the application database server with admin rights.
    pub async fn new(dsn: &str) -> InfraResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await
            .map_err(|e| InfraError::adapter("appdb", format!("cannot reach DB: {e}")))?;

        Ok(Self { pool })
    }

    /// Create ops from an existing pool.
    #[must_use]
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn run(&self, statement: &str) -> InfraResult<()> {
        sqlx::query(statement)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| {
                let head: String = statement.chars().take(30).collect();
                InfraError::adapter("appdb", format!("sql({head}…): {e}"))
            })
    }
}

#[async_trait]
impl AppDbOps for MariaDbAdminOps {
    async fn create_database_and_user(
        &self,
        db: &str,
        user: &str,
        password: &str,
        from_host: &str,
    ) -> InfraResult<()> {
        ensure_safe(db)?;
        ensure_safe(user)?;
        ensure_safe(from_host)?;
        ensure_safe(password)?;

        self.run(&format!("CREATE DATABASE IF NOT EXISTS `{db}`")).await?;
        self.run(&format!(
            "CREATE USER IF NOT EXISTS '{user}'@'{from_host}' IDENTIFIED BY '{password}'"
        ))
        .await?;
        self.run(&format!(
            "GRANT ALL PRIVILEGES ON `{db}`.* TO '{user}'@'{from_host}'"
        ))
        .await?;
        self.run("FLUSH PRIVILEGES").await
    }

    async fn drop_database_and_user(
        &self,
        db: &str,
        user: &str,
        from_host: &str,
    ) -> InfraResult<()> {
        ensure_safe(db)?;
        ensure_safe(user)?;
        ensure_safe(from_host)?;

        self.run(&format!("DROP DATABASE IF EXISTS `{db}`")).await?;
        self.run(&format!("DROP USER IF EXISTS '{user}'@'{from_host}'"))
            .await
    }

    async fn update_site_urls(&self, db: &str, url: &str) -> InfraResult<()> {
        ensure_safe(db)?;

        sqlx::query(&format!(
            "UPDATE `{db}`.wp_options SET option_value = ? WHERE option_name IN ('siteurl', 'home')"
        ))
        .bind(url)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| InfraError::adapter("appdb", format!("url update: {e}")))
    }
}

impl std::fmt::Debug for MariaDbAdminOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MariaDbAdminOps").finish_non_exhaustive()
    }
}
