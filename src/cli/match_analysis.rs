use std::collections::BTreeMap;

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, info, instrument};

use crate::database_ops::backfill::{BackfillOrchestrator, DEFAULT_BATCH_SIZE};
use crate::database_ops::db::Db;
use crate::database_ops::error::{LocationError, Result as LocationResult};
use crate::database_ops::models::{non_blank, DependentTable, LocationType, MatchedBy};
use crate::database_ops::pg_store::PgLocationStore;
use crate::database_ops::store::LocationStore;
use crate::normalization::slug::normalize;
use crate::util::env as env_util;

/// Minimum Jaro-Winkler score for a legacy city to be offered as a suggestion.
pub const MIN_CITY_SIMILARITY: f64 = 0.85;

/// Unmatched city texts listed in the report.
const TOP_UNMATCHED: usize = 25;

#[derive(Debug, Clone, Default)]
pub struct MatchAnalysisConfig {
    /// Optional override for the Postgres connection string.
    pub database_url: Option<String>,
    pub table: Option<DependentTable>,
    pub limit: Option<i64>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedCity {
    pub city: String,
    pub rows: i64,
    pub suggestion: Option<String>,
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchAnalysis {
    pub table: Option<DependentTable>,
    pub total: i64,
    pub errored: i64,
    pub by_strategy: BTreeMap<&'static str, i64>,
    pub by_confidence: BTreeMap<&'static str, i64>,
    pub unmatched_cities: Vec<UnmatchedCity>,
}

/// Dry statistics of how pending rows would resolve, using the same resolution path
/// as `backfill` (foreign-key hints, then the matcher). Nothing is written.
#[instrument(skip(store), fields(table = %table))]
pub async fn analyze(
    store: &dyn LocationStore,
    table: DependentTable,
    limit: Option<i64>,
) -> LocationResult<MatchAnalysis> {
    let resolver = BackfillOrchestrator::new(store);
    let limit_total = limit.filter(|l| *l > 0).unwrap_or(i64::MAX);
    let mut report = MatchAnalysis {
        table: Some(table),
        ..Default::default()
    };
    let mut unmatched: BTreeMap<String, i64> = BTreeMap::new();
    let mut last_id = 0i64;

    while report.total < limit_total {
        let fetch = DEFAULT_BATCH_SIZE.min(limit_total - report.total);
        let rows = store.pending_dependents(table, last_id, fetch).await?;
        if rows.is_empty() {
            break;
        }
        for row in rows {
            last_id = row.id;
            report.total += 1;
            let found = match resolver.resolve_row(&row).await {
                Ok(found) => found,
                Err(err @ LocationError::RowResolution { .. }) => {
                    debug!(row_id = row.id, error = %err, "analyze: row not resolvable");
                    report.errored += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            *report.by_strategy.entry(found.matched_by.as_str()).or_default() += 1;
            *report.by_confidence.entry(found.confidence.as_str()).or_default() += 1;
            if found.matched_by == MatchedBy::None {
                if let Some(city) = non_blank(row.city.as_deref()).map(|c| normalize(&c)) {
                    if !city.is_empty() {
                        *unmatched.entry(city).or_default() += 1;
                    }
                }
            }
        }
    }

    let legacy_cities: Vec<String> = store
        .legacy_places(LocationType::City)
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();
    report.unmatched_cities = unmatched
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .take(TOP_UNMATCHED)
        .map(|(city, rows)| {
            let best = closest_city(&city, &legacy_cities);
            UnmatchedCity {
                city,
                rows,
                suggestion: best.map(|(name, _)| name.to_string()),
                similarity: best.map(|(_, score)| score),
            }
        })
        .collect();

    info!(
        total = report.total,
        errored = report.errored,
        unmatched_cities = report.unmatched_cities.len(),
        "analyze: done"
    );
    Ok(report)
}

/// Best legacy city for an unmatched (normalized) city text, if close enough.
fn closest_city<'c>(city: &str, candidates: &'c [String]) -> Option<(&'c str, f64)> {
    candidates
        .iter()
        .map(|name| (name.as_str(), jaro_winkler(city, &normalize(name))))
        .filter(|(_, score)| *score >= MIN_CITY_SIMILARITY)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Connect, analyze the requested table(s) and print the reports as JSON.
pub async fn run(cfg: MatchAnalysisConfig) -> Result<()> {
    env_util::init_env();

    let database_url = match cfg.database_url.clone() {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    let db = Db::connect(&database_url, cfg.max_connections.max(1))
        .await
        .context("connecting for match analysis")?;
    let store = PgLocationStore::new(db);

    let tables: Vec<DependentTable> = match cfg.table {
        Some(t) => vec![t],
        None => DependentTable::ALL.to_vec(),
    };
    let mut reports = Vec::with_capacity(tables.len());
    for table in tables {
        reports.push(
            analyze(&store, table, cfg.limit)
                .await
                .with_context(|| format!("analyzing {table}"))?,
        );
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryLocationStore;
    use crate::database_ops::models::DependentRow;
    use crate::database_ops::sync::HierarchySynchronizer;

    fn row(id: i64, city: &str, suburb: Option<&str>) -> DependentRow {
        DependentRow {
            id,
            city: Some(city.to_string()),
            suburb: suburb.map(str::to_string),
            ..Default::default()
        }
    }

    async fn seeded() -> MemoryLocationStore {
        let store = MemoryLocationStore::new();
        store.add_legacy_named(LocationType::Province, 1, None, "Gauteng", Some("ChIJ_gauteng"));
        store.add_legacy_named(LocationType::City, 1, Some(1), "Johannesburg", Some("ChIJ_jhb"));
        store.add_legacy_named(LocationType::Suburb, 1, Some(1), "Sandton", Some("ChIJ_sandton"));
        HierarchySynchronizer::new(&store, false)
            .sync_locations()
            .await
            .unwrap();
        store
    }

    #[test]
    fn suggestions_need_close_spelling() {
        let cities = vec!["Johannesburg".to_string(), "Pretoria".to_string()];
        let (name, score) = closest_city("johannesberg", &cities).unwrap();
        assert_eq!(name, "Johannesburg");
        assert!(score >= MIN_CITY_SIMILARITY);
        assert!(closest_city("faketown", &cities).is_none());
    }

    #[tokio::test]
    async fn tallies_strategies_and_unmatched_cities() {
        let store = seeded().await;
        let table = DependentTable::Properties;
        store.add_dependent(table, row(1, "Johannesburg", Some("Sandton")));
        store.add_dependent(table, row(2, "Johannesburg", None));
        store.add_dependent(table, row(3, "Johannesberg", None));
        store.add_dependent(table, row(4, " johannesberg ", None));
        store.add_dependent(table, row(5, "Faketown", None));
        store.add_dependent(
            table,
            DependentRow {
                id: 6,
                latitude: Some("north".into()),
                longitude: Some("28.05".into()),
                ..Default::default()
            },
        );

        let report = analyze(&store, table, None).await.unwrap();
        assert_eq!(report.total, 6);
        assert_eq!(report.errored, 1);
        assert_eq!(report.by_strategy.get("suburb"), Some(&1));
        assert_eq!(report.by_strategy.get("city"), Some(&1));
        assert_eq!(report.by_strategy.get("none"), Some(&3));
        assert_eq!(report.by_confidence.get("high"), Some(&1));
        assert_eq!(report.by_confidence.get("medium"), Some(&1));

        assert_eq!(report.unmatched_cities.len(), 2);
        let first = &report.unmatched_cities[0];
        assert_eq!(first.city, "johannesberg");
        assert_eq!(first.rows, 2);
        assert_eq!(first.suggestion.as_deref(), Some("Johannesburg"));
        let second = &report.unmatched_cities[1];
        assert_eq!(second.city, "faketown");
        assert_eq!(second.suggestion, None);

        // read-only: rows stay pending
        assert_eq!(store.dependent(table, 1).unwrap().location_id, None);
    }

    #[tokio::test]
    async fn respects_limit() {
        let store = seeded().await;
        let table = DependentTable::Developments;
        for id in 1..=5 {
            store.add_dependent(table, row(id, "Johannesburg", None));
        }
        let report = analyze(&store, table, Some(3)).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.by_strategy.get("city"), Some(&3));
    }

    #[tokio::test]
    async fn foreign_key_hints_count_like_backfill() {
        let store = seeded().await;
        let table = DependentTable::Properties;
        // no usable text, only the legacy suburb id
        store.add_dependent(
            table,
            DependentRow {
                id: 1,
                suburb_id: Some(1),
                ..Default::default()
            },
        );

        let report = analyze(&store, table, None).await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.by_strategy.get("suburb"), Some(&1));
        assert_eq!(report.by_confidence.get("high"), Some(&1));
        assert!(report.unmatched_cities.is_empty());

        let backfilled = BackfillOrchestrator::new(&store)
            .backfill(table, 10, true)
            .await
            .unwrap();
        assert_eq!(backfilled.updated, 1);
    }
}
