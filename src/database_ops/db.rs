use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use tracing::{info, instrument};

use crate::database_ops::error::{LocationError, Result};
use crate::util::env::{env_flag, env_opt};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    /// Open the pool and verify the server answers. Any failure here is a
    /// `LocationError::Connection`, which callers treat as fatal before doing work.
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).map_err(LocationError::Connection)?;

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }
        connect_options = connect_options.application_name("locsync");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .map_err(LocationError::Connection)?;
        sqlx::query("SELECT 1")
            .persistent(false)
            .execute(&pool)
            .await
            .map_err(LocationError::Connection)?;
        info!(max_connections, "connected to db");

        // Default off: this engine usually runs against schemas owned by the main app.
        if env_flag("AUTO_MIGRATE", false) {
            let dir = env_opt("MIGRATIONS_DIR").unwrap_or_else(|| "./migrations".into());
            info!(dir = %dir, "running migrations (AUTO_MIGRATE=on)");
            Self::run_migrations(&pool, Path::new(&dir)).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    /// Apply numbered `NNNN_description.sql` files not yet recorded in `_sqlx_migrations`.
    /// Files without a numeric prefix are ignored.
    async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;

        let mut applied: HashSet<i64> = HashSet::new();
        for r in sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
            .fetch_all(pool)
            .await?
        {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        let mut candidates = migration_files(dir)?;
        candidates.sort_by_key(|(v, _, _)| *v);
        for (version, desc, path) in candidates {
            if !applied.insert(version) {
                continue;
            }
            let sql = std::fs::read_to_string(&path)?;
            info!(version, file = ?path, "applying migration");
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(sql.trim()).execute(&mut *tx).await.map_err(|e| {
                LocationError::Migration(format!("{}: {e}", path.display()))
            })?;
            sqlx::query("INSERT INTO _sqlx_migrations(version, description) VALUES ($1, $2)")
                .persistent(false)
                .bind(version)
                .bind(&desc)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        info!(applied = applied.len(), "migrations up-to-date");
        Ok(())
    }
}

fn migration_files(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            out.push((version, desc, path));
        }
    }
    Ok(out)
}

/// `0001_location_hierarchy.sql` → `(1, "location_hierarchy")`.
fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let desc = stem[digits.len()..].strip_prefix('_')?;
    Some((digits.parse().ok()?, desc.to_string()))
}
