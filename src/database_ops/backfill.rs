use std::cmp::min;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::database_ops::error::Result;
use crate::database_ops::matcher::LocationMatcher;
use crate::database_ops::models::{
    Confidence, DependentRow, DependentTable, ExtractedLocation, LocationAssignment,
    LocationMatch, LocationType, MatchedBy,
};
use crate::database_ops::store::LocationStore;

pub const DEFAULT_BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub table: Option<DependentTable>,
    pub processed: i64,
    pub updated: i64,
    pub skipped: i64,
    pub errored: i64,
    pub batches: i64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Assigned(MatchedBy),
    Unresolved,
}

/// Populates `location_id` (and missing legacy foreign keys) on dependent rows.
///
/// Rows are read in id order, `batch_size` at a time, and only while their
/// `location_id` is still NULL. A failure on one row is counted and the loop moves
/// on; only errors that mean the database is gone stop the run.
pub struct BackfillOrchestrator<'a> {
    store: &'a dyn LocationStore,
    matcher: LocationMatcher<'a>,
    limit: Option<i64>,
}

impl<'a> BackfillOrchestrator<'a> {
    pub fn new(store: &'a dyn LocationStore) -> Self {
        Self {
            store,
            matcher: LocationMatcher::new(store),
            limit: None,
        }
    }

    /// Stop after this many rows (across batches).
    pub fn with_limit(mut self, limit: Option<i64>) -> Self {
        self.limit = limit.filter(|l| *l > 0);
        self
    }

    #[instrument(skip(self), fields(table = %table))]
    pub async fn backfill(
        &self,
        table: DependentTable,
        batch_size: i64,
        dry_run: bool,
    ) -> Result<BackfillSummary> {
        let batch_size = batch_size.max(1);
        let limit_total = self.limit.unwrap_or(i64::MAX);
        let mut summary = BackfillSummary {
            table: Some(table),
            dry_run,
            ..Default::default()
        };
        let mut last_id = 0i64;
        info!(
            table = %table,
            batch_size,
            limit = ?self.limit,
            dry_run,
            "backfill: starting run"
        );

        loop {
            if summary.processed >= limit_total {
                info!(processed = summary.processed, "backfill: reached limit");
                break;
            }
            let fetch = min(batch_size, limit_total - summary.processed);
            let rows = self.store.pending_dependents(table, last_id, fetch).await?;
            if rows.is_empty() {
                break;
            }
            summary.batches += 1;

            for row in rows {
                last_id = row.id;
                summary.processed += 1;
                match self.process_row(table, &row, dry_run).await {
                    Ok(RowOutcome::Assigned(matched_by)) => {
                        summary.updated += 1;
                        debug!(row_id = row.id, matched_by = matched_by.as_str(), "backfill: row assigned");
                    }
                    Ok(RowOutcome::Unresolved) => {
                        summary.skipped += 1;
                        debug!(row_id = row.id, "backfill: no location resolved");
                    }
                    Err(err) if err.is_fatal() => {
                        warn!(row_id = row.id, error = %err, "backfill: fatal error; aborting run");
                        return Err(err);
                    }
                    Err(err) => {
                        summary.errored += 1;
                        warn!(row_id = row.id, error = %err, "backfill: row failed; continuing");
                    }
                }
            }

            info!(
                table = %table,
                batch = summary.batches,
                last_id,
                processed = summary.processed,
                updated = summary.updated,
                skipped = summary.skipped,
                errored = summary.errored,
                dry_run,
                "backfill: batch complete"
            );
        }

        info!(
            table = %table,
            processed = summary.processed,
            updated = summary.updated,
            skipped = summary.skipped,
            errored = summary.errored,
            dry_run,
            "backfill: finished"
        );
        Ok(summary)
    }

    /// The match `backfill` would assign to `row`, foreign-key hints included. Never writes.
    pub async fn resolve_row(&self, row: &DependentRow) -> Result<LocationMatch> {
        let extracted = ExtractedLocation::from_row(row)?;
        self.resolve(row, &extracted).await
    }

    async fn process_row(
        &self,
        table: DependentTable,
        row: &DependentRow,
        dry_run: bool,
    ) -> Result<RowOutcome> {
        let extracted = ExtractedLocation::from_row(row)?;
        let resolved = self.resolve(row, &extracted).await?;
        let Some(location_id) = resolved.location_id else {
            return Ok(RowOutcome::Unresolved);
        };
        let assignment = self.assignment_for(row, location_id).await?;
        if dry_run {
            return Ok(RowOutcome::Assigned(resolved.matched_by));
        }
        if self.store.assign_location(table, row.id, &assignment).await? {
            Ok(RowOutcome::Assigned(resolved.matched_by))
        } else {
            warn!(row_id = row.id, "backfill: row already had a location when written");
            Ok(RowOutcome::Unresolved)
        }
    }

    /// Populated suburb/city foreign keys win over text matching; a province-only
    /// foreign key is used only when the matcher finds nothing more specific.
    async fn resolve(&self, row: &DependentRow, extracted: &ExtractedLocation) -> Result<LocationMatch> {
        if let Some(hit) = self
            .from_foreign_keys(row, &[LocationType::Suburb, LocationType::City])
            .await?
        {
            return Ok(hit);
        }
        let matched = self
            .matcher
            .resolve_location(extracted, row.place_id.as_deref())
            .await?;
        if matched.location_id.is_some() {
            return Ok(matched);
        }
        Ok(self
            .from_foreign_keys(row, &[LocationType::Province])
            .await?
            .unwrap_or(matched))
    }

    async fn from_foreign_keys(
        &self,
        row: &DependentRow,
        levels: &[LocationType],
    ) -> Result<Option<LocationMatch>> {
        for &level in levels {
            let (fk, confidence) = match level {
                LocationType::Suburb => (row.suburb_id, Confidence::High),
                LocationType::City => (row.city_id, Confidence::Medium),
                LocationType::Province => (row.province_id, Confidence::Low),
            };
            let Some(legacy_id) = fk else { continue };
            let Some(place_id) = self
                .store
                .legacy_by_id(level, legacy_id)
                .await?
                .and_then(|p| p.place_id)
            else {
                continue;
            };
            if let Some(location) = self.store.location_by_place_id(&place_id).await? {
                return Ok(Some(LocationMatch::found(
                    location.id,
                    confidence,
                    MatchedBy::from(level),
                )));
            }
        }
        Ok(None)
    }

    /// `location_id` plus whichever legacy foreign keys the row lacks, derived from the
    /// matched location's ancestry.
    async fn assignment_for(&self, row: &DependentRow, location_id: i64) -> Result<LocationAssignment> {
        let mut assignment = LocationAssignment {
            location_id,
            ..Default::default()
        };
        let mut next = Some(location_id);
        // province → city → suburb is at most three hops
        for _ in 0..3 {
            let Some(id) = next else { break };
            let Some(location) = self.store.location(id).await? else {
                break;
            };
            next = location.parent_id;
            let (already_set, slot) = match location.kind {
                LocationType::Province => (row.province_id.is_some(), &mut assignment.province_id),
                LocationType::City => (row.city_id.is_some(), &mut assignment.city_id),
                LocationType::Suburb => (row.suburb_id.is_some(), &mut assignment.suburb_id),
            };
            if already_set || slot.is_some() {
                continue;
            }
            if let Some(place_id) = location.place_id.as_deref() {
                *slot = self
                    .store
                    .legacy_by_place_id(location.kind, place_id)
                    .await?
                    .map(|p| p.id);
            }
        }
        Ok(assignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryLocationStore;
    use crate::database_ops::sync::HierarchySynchronizer;

    async fn synced_store() -> MemoryLocationStore {
        let store = MemoryLocationStore::new();
        store.add_legacy_named(LocationType::Province, 1, None, "Gauteng", Some("ChIJ_gauteng"));
        store.add_legacy_named(LocationType::City, 5, Some(1), "Johannesburg", Some("ChIJ_joburg"));
        store.add_legacy_named(LocationType::Suburb, 9, Some(5), "Sandton", Some("ChIJ_sandton"));
        store.add_legacy_named(LocationType::Suburb, 10, Some(5), "Rivonia", Some("ChIJ_rivonia"));
        HierarchySynchronizer::new(&store, false)
            .sync_locations()
            .await
            .unwrap();
        store
    }

    fn property(id: i64, suburb: Option<&str>, city: Option<&str>) -> DependentRow {
        DependentRow {
            id,
            suburb: suburb.map(str::to_string),
            city: city.map(str::to_string),
            province: Some("Gauteng".into()),
            ..Default::default()
        }
    }

    fn seed_rows(store: &MemoryLocationStore) {
        let table = DependentTable::Properties;
        store.add_dependent(table, property(1, Some("Sandton"), Some("Johannesburg")));
        store.add_dependent(table, property(2, None, Some("Johannesburg")));
        store.add_dependent(
            table,
            DependentRow {
                id: 3,
                city: Some("Faketown".into()),
                ..Default::default()
            },
        );
        store.add_dependent(
            table,
            DependentRow {
                id: 4,
                suburb: Some("Sandton".into()),
                latitude: Some("-26.1x".into()),
                longitude: Some("28.05".into()),
                ..Default::default()
            },
        );
        store.add_dependent(table, property(5, Some("Rivonia"), None));
        store.add_dependent(
            table,
            DependentRow {
                id: 6,
                location_id: Some(1),
                suburb: Some("Sandton".into()),
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn dry_run_and_live_report_the_same_updates() {
        let store = synced_store().await;
        seed_rows(&store);
        let orchestrator = BackfillOrchestrator::new(&store);

        let dry = orchestrator
            .backfill(DependentTable::Properties, 2, true)
            .await
            .unwrap();
        assert!(store
            .dependent(DependentTable::Properties, 1)
            .unwrap()
            .location_id
            .is_none());

        let live = orchestrator
            .backfill(DependentTable::Properties, 2, false)
            .await
            .unwrap();
        assert_eq!(dry.updated, live.updated);
        assert_eq!(live.processed, 5);
        assert_eq!(live.updated, 3);
        assert_eq!(live.skipped, 1);
        assert_eq!(live.errored, 1);
        assert_eq!(live.batches, 3);
    }

    #[tokio::test]
    async fn assignments_fill_legacy_foreign_keys() {
        let store = synced_store().await;
        seed_rows(&store);
        BackfillOrchestrator::new(&store)
            .backfill(DependentTable::Properties, 100, false)
            .await
            .unwrap();

        let sandton = store
            .locations()
            .into_iter()
            .find(|l| l.place_id.as_deref() == Some("ChIJ_sandton"))
            .unwrap();
        let row = store.dependent(DependentTable::Properties, 1).unwrap();
        assert_eq!(row.location_id, Some(sandton.id));
        assert_eq!(
            (row.province_id, row.city_id, row.suburb_id),
            (Some(1), Some(5), Some(9))
        );

        let city_only = store.dependent(DependentTable::Properties, 2).unwrap();
        assert_eq!(
            (city_only.province_id, city_only.city_id, city_only.suburb_id),
            (Some(1), Some(5), None)
        );

        // Pre-populated rows stay untouched.
        let sticky = store.dependent(DependentTable::Properties, 6).unwrap();
        assert_eq!(sticky.location_id, Some(1));
        assert_eq!(sticky.suburb_id, None);
    }

    #[tokio::test]
    async fn rerun_only_revisits_unresolved_rows() {
        let store = synced_store().await;
        seed_rows(&store);
        let orchestrator = BackfillOrchestrator::new(&store);
        orchestrator
            .backfill(DependentTable::Properties, 100, false)
            .await
            .unwrap();
        let again = orchestrator
            .backfill(DependentTable::Properties, 100, false)
            .await
            .unwrap();
        assert_eq!(again.processed, 2);
        assert_eq!(again.updated, 0);
    }

    #[tokio::test]
    async fn write_failures_are_counted_and_the_batch_continues() {
        let store = synced_store().await;
        seed_rows(&store);
        store.fail_writes_for(DependentTable::Properties, 1);

        let summary = BackfillOrchestrator::new(&store)
            .backfill(DependentTable::Properties, 100, false)
            .await
            .unwrap();
        assert_eq!(summary.errored, 2);
        assert_eq!(summary.updated, 2);
        assert!(store
            .dependent(DependentTable::Properties, 5)
            .unwrap()
            .location_id
            .is_some());
    }

    #[tokio::test]
    async fn suburb_foreign_key_beats_text_fields() {
        let store = synced_store().await;
        store.add_dependent(
            DependentTable::Developments,
            DependentRow {
                id: 1,
                suburb_id: Some(10),
                suburb: Some("Sandton".into()),
                ..Default::default()
            },
        );
        BackfillOrchestrator::new(&store)
            .backfill(DependentTable::Developments, 10, false)
            .await
            .unwrap();
        let rivonia = store
            .locations()
            .into_iter()
            .find(|l| l.place_id.as_deref() == Some("ChIJ_rivonia"))
            .unwrap();
        let row = store.dependent(DependentTable::Developments, 1).unwrap();
        assert_eq!(row.location_id, Some(rivonia.id));
        assert_eq!(row.suburb_id, Some(10));
        assert_eq!(row.city_id, Some(5));
    }

    #[tokio::test]
    async fn limit_caps_processed_rows() {
        let store = synced_store().await;
        seed_rows(&store);
        let summary = BackfillOrchestrator::new(&store)
            .with_limit(Some(3))
            .backfill(DependentTable::Properties, 2, true)
            .await
            .unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.batches, 2);
    }

    #[tokio::test]
    async fn lost_connection_aborts_instead_of_counting_the_row() {
        let store = synced_store().await;
        let table = DependentTable::Properties;
        store.add_dependent(table, property(1, Some("Sandton"), Some("Johannesburg")));
        store.add_dependent(table, property(2, None, Some("Johannesburg")));
        store.add_dependent(table, property(3, Some("Rivonia"), None));
        store.lose_connection_on(table, 2);

        let err = BackfillOrchestrator::new(&store)
            .backfill(table, 10, false)
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(store.dependent(table, 1).unwrap().location_id.is_some());
        assert_eq!(store.dependent(table, 2).unwrap().location_id, None);
        // nothing after the failing row is touched
        assert_eq!(store.dependent(table, 3).unwrap().location_id, None);
    }
}
