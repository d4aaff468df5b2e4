use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use location_sync::cli::match_analysis::{self, MatchAnalysisConfig};
use location_sync::database_ops::backfill::{BackfillOrchestrator, BackfillSummary, DEFAULT_BATCH_SIZE};
use location_sync::database_ops::db::Db;
use location_sync::database_ops::models::DependentTable;
use location_sync::database_ops::pg_store::PgLocationStore;
use location_sync::database_ops::sync::{HierarchySynchronizer, SyncSummary};
use location_sync::database_ops::verify::{IntegrityVerifier, VerificationCheck};
use location_sync::tracing::{default_filter, init_tracing};
use location_sync::util::env;
use tracing::info;

const DRY_RUN: &str = "[DRY RUN] ";

#[derive(Parser, Debug)]
#[command(name = "locsync", version, about = "Location hierarchy sync and backfill")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Optional override for the database URL
    #[arg(long, global = true)]
    db_url: Option<String>,
    /// Debug-level logging (RUST_LOG still wins)
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct WriteArgs {
    /// Apply changes; without it every command is a dry run
    #[arg(long, default_value_t = false)]
    execute: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum TableChoice {
    Properties,
    Developments,
    All,
}

impl TableChoice {
    fn tables(self) -> Vec<DependentTable> {
        match self {
            Self::Properties => vec![DependentTable::Properties],
            Self::Developments => vec![DependentTable::Developments],
            Self::All => DependentTable::ALL.to_vec(),
        }
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Build/refresh `locations` from the legacy provinces, cities and suburbs
    Sync {
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Populate location foreign keys on dependent rows
    Backfill {
        #[arg(long, value_enum)]
        table: TableChoice,
        #[command(flatten)]
        write: WriteArgs,
        /// Rows per batch (default: LOCSYNC_BATCH_SIZE or 100)
        #[arg(long)]
        batch_size: Option<i64>,
        /// Maximum number of rows to process per table (default: all)
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Run the hierarchy integrity checks
    Verify {
        /// Print the checks as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Report how pending rows would match, without writing
    Analyze {
        #[arg(long, value_enum, default_value = "all")]
        table: TableChoice,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// sync, backfill both tables, then verify
    RunAll {
        #[command(flatten)]
        write: WriteArgs,
        #[arg(long)]
        batch_size: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env::init_env();
    init_tracing(default_filter(cli.common.verbose))?;

    let database_url = resolve_database_url(cli.common.db_url.clone())?;
    env::preflight_check(
        "locsync",
        &[],
        &["LOCSYNC_MAX_CONNS", "LOCSYNC_BATCH_SIZE", "AUTO_MIGRATE", "USE_PREPARED"],
    )?;
    let max_connections: u32 = env::env_parse("LOCSYNC_MAX_CONNS", 2);

    match cli.command {
        Commands::Analyze { table, limit } => {
            let table = match table {
                TableChoice::All => None,
                TableChoice::Properties => Some(DependentTable::Properties),
                TableChoice::Developments => Some(DependentTable::Developments),
            };
            match_analysis::run(MatchAnalysisConfig {
                database_url: Some(database_url),
                table,
                limit,
                max_connections,
            })
            .await?;
        }
        Commands::Sync { write } => {
            let store = connect(&database_url, max_connections).await?;
            let summary = HierarchySynchronizer::new(&store, !write.execute)
                .sync_locations()
                .await?;
            print_sync(&summary);
            print_dry_run_footer(!write.execute);
        }
        Commands::Backfill {
            table,
            write,
            batch_size,
            limit,
        } => {
            let store = connect(&database_url, max_connections).await?;
            let batch_size = resolve_batch_size(batch_size);
            let orchestrator = BackfillOrchestrator::new(&store).with_limit(limit);
            for table in table.tables() {
                let summary = orchestrator
                    .backfill(table, batch_size, !write.execute)
                    .await
                    .with_context(|| format!("backfill {table} aborted"))?;
                print_backfill(&summary);
            }
            print_dry_run_footer(!write.execute);
        }
        Commands::Verify { json } => {
            let store = connect(&database_url, max_connections).await?;
            let checks = IntegrityVerifier::new(&store).verify().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&checks)?);
            } else {
                print_checks(&checks);
            }
        }
        Commands::RunAll { write, batch_size } => {
            let store = connect(&database_url, max_connections).await?;
            let dry_run = !write.execute;
            let summary = HierarchySynchronizer::new(&store, dry_run)
                .sync_locations()
                .await?;
            print_sync(&summary);

            let batch_size = resolve_batch_size(batch_size);
            let orchestrator = BackfillOrchestrator::new(&store);
            for table in DependentTable::ALL {
                let summary = orchestrator
                    .backfill(table, batch_size, dry_run)
                    .await
                    .with_context(|| format!("backfill {table} aborted"))?;
                print_backfill(&summary);
            }

            let checks = IntegrityVerifier::new(&store).verify().await?;
            print_checks(&checks);
            if dry_run {
                println!(
                    "{DRY_RUN}Backfill and verify ran against the existing locations; \
                     rows that only the sync would create are not counted, so a live \
                     run-all may update more rows."
                );
            }
            print_dry_run_footer(dry_run);
        }
    }
    Ok(())
}

/// Connection failures are fatal: nothing runs against a half-open pool.
async fn connect(database_url: &str, max_connections: u32) -> Result<PgLocationStore> {
    info!(url = %env::redact_value("DATABASE_URL", database_url), "locsync: connecting");
    let db = Db::connect(database_url, max_connections)
        .await
        .context("database unreachable")?;
    Ok(PgLocationStore::new(db))
}

fn resolve_database_url(db_url: Option<String>) -> Result<String> {
    if let Some(url) = db_url {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let env_url = env::db_url().context("resolve_database_url: missing database URL")?;
    let trimmed = env_url.trim();
    if trimmed.is_empty() {
        bail!("database URL is empty; set LOCSYNC_DATABASE_URL / DATABASE_URL or pass --db-url");
    }
    Ok(trimmed.to_string())
}

fn resolve_batch_size(flag: Option<i64>) -> i64 {
    flag.filter(|n| *n > 0)
        .unwrap_or_else(|| env::env_parse("LOCSYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE))
        .max(1)
}

fn prefix(dry_run: bool) -> &'static str {
    if dry_run {
        DRY_RUN
    } else {
        ""
    }
}

fn print_sync(s: &SyncSummary) {
    println!(
        "{}sync: provinces={} cities={} suburbs={} created={} updated={} skipped={}",
        prefix(s.dry_run),
        s.provinces_synced,
        s.cities_synced,
        s.suburbs_synced,
        s.created,
        s.updated,
        s.skipped
    );
}

fn print_backfill(s: &BackfillSummary) {
    let table = s.table.map(|t| t.table_name()).unwrap_or("-");
    println!(
        "{}backfill {table}: processed={} updated={} skipped={} errored={} batches={}",
        prefix(s.dry_run),
        s.processed,
        s.updated,
        s.skipped,
        s.errored,
        s.batches
    );
}

fn print_checks(checks: &[VerificationCheck]) {
    for check in checks {
        let status = if check.passed { "PASS" } else { "FAIL" };
        println!("{status} {}: {}", check.name, check.details);
    }
    let failed = checks.iter().filter(|c| !c.passed).count();
    println!("verify: {} passed, {failed} failed", checks.len() - failed);
}

fn print_dry_run_footer(dry_run: bool) {
    if dry_run {
        println!("{DRY_RUN}No changes were written. Re-run with --execute to apply them.");
    }
}
