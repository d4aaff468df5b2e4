//! In-process `LocationStore` over plain vectors. Backs the unit tests and lets
//! callers run the engine against a snapshot without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::database_ops::error::{LocationError, Result};
use crate::database_ops::models::{
    DependentRow, DependentTable, DuplicateSlugGroup, LegacyPlace, Location, LocationAssignment,
    LocationDraft, LocationType, Violations,
};
use crate::database_ops::store::LocationStore;
use crate::normalization::coords::BoundingBox;

#[derive(Default)]
struct Tables {
    legacy: Vec<LegacyPlace>,
    locations: BTreeMap<i64, Location>,
    next_location_id: i64,
    dependents: HashMap<DependentTable, BTreeMap<i64, DependentRow>>,
    failing_rows: HashMap<(DependentTable, i64), WriteFailure>,
    insert_conflicts: HashMap<String, InsertConflict>,
    failing_place_id_updates: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteFailure {
    Transient,
    ConnectionLost,
}

/// How the next insert carrying a given place_id collides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertConflict {
    /// Another writer inserted the same place_id between lookup and insert.
    ConcurrentRow,
    /// The insert collides, but the conflicting row is gone by the time we update.
    Vanished,
    /// The insert collides and the follow-up update by place_id fails.
    UpdateFails,
}

#[derive(Default)]
pub struct MemoryLocationStore {
    tables: Mutex<Tables>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A poisoned lock only means a test panicked mid-write; the data is still usable.
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a legacy province/city/suburb row.
    pub fn add_legacy(&self, place: LegacyPlace) {
        self.lock().legacy.push(place);
    }

    /// Convenience for `add_legacy` with the common fields.
    pub fn add_legacy_named(
        &self,
        level: LocationType,
        id: i64,
        parent_id: Option<i64>,
        name: &str,
        place_id: Option<&str>,
    ) {
        self.add_legacy(LegacyPlace {
            id,
            level,
            parent_id,
            name: name.to_string(),
            slug: None,
            place_id: place_id.map(str::to_string),
            latitude: None,
            longitude: None,
        });
    }

    pub fn add_dependent(&self, table: DependentTable, row: DependentRow) {
        self.lock()
            .dependents
            .entry(table)
            .or_default()
            .insert(row.id, row);
    }

    /// Insert a canonical row verbatim, bypassing every check. Used to stage broken data.
    pub fn add_raw_location(&self, location: Location) {
        let mut tables = self.lock();
        tables.next_location_id = tables.next_location_id.max(location.id);
        tables.locations.insert(location.id, location);
    }

    /// Make every write to this dependent row fail with a non-fatal database error.
    pub fn fail_writes_for(&self, table: DependentTable, row_id: i64) {
        self.lock()
            .failing_rows
            .insert((table, row_id), WriteFailure::Transient);
    }

    /// Make a write to this dependent row fail as if the pool had been closed.
    pub fn lose_connection_on(&self, table: DependentTable, row_id: i64) {
        self.lock()
            .failing_rows
            .insert((table, row_id), WriteFailure::ConnectionLost);
    }

    /// The next `insert_location` carrying `place_id` fails with `UpsertConflict`.
    pub fn conflict_on_insert(&self, place_id: &str, conflict: InsertConflict) {
        self.lock()
            .insert_conflicts
            .insert(place_id.to_string(), conflict);
    }

    pub fn locations(&self) -> Vec<Location> {
        self.lock().locations.values().cloned().collect()
    }

    pub fn dependent(&self, table: DependentTable, row_id: i64) -> Option<DependentRow> {
        self.lock()
            .dependents
            .get(&table)
            .and_then(|rows| rows.get(&row_id))
            .cloned()
    }
}

fn apply_draft(location: &mut Location, draft: &LocationDraft) {
    location.name = draft.name.clone();
    location.slug = draft.slug.clone();
    location.kind = draft.kind;
    location.parent_id = draft.parent_id;
    location.place_id = draft.place_id.clone();
    location.latitude = draft.latitude.clone();
    location.longitude = draft.longitude.clone();
    location.seo_title = Some(draft.seo_title.clone());
    location.seo_description = Some(draft.seo_description.clone());
    location.updated_at = Utc::now();
}

fn push_location(tables: &mut Tables, draft: &LocationDraft) -> i64 {
    tables.next_location_id += 1;
    let id = tables.next_location_id;
    let now = Utc::now();
    let mut location = Location {
        id,
        name: String::new(),
        slug: String::new(),
        kind: draft.kind,
        parent_id: None,
        place_id: None,
        latitude: None,
        longitude: None,
        seo_title: None,
        seo_description: None,
        created_at: now,
        updated_at: now,
    };
    apply_draft(&mut location, draft);
    tables.locations.insert(id, location);
    id
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn sampled<T: Clone>(items: Vec<T>, sample: i64) -> Violations<T> {
    Violations {
        count: items.len() as i64,
        sample: items.into_iter().take(sample.max(0) as usize).collect(),
    }
}

#[async_trait::async_trait]
impl LocationStore for MemoryLocationStore {
    async fn legacy_places(&self, level: LocationType) -> Result<Vec<LegacyPlace>> {
        let mut rows: Vec<LegacyPlace> = self
            .lock()
            .legacy
            .iter()
            .filter(|p| p.level == level)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.id);
        Ok(rows)
    }

    async fn legacy_by_name(&self, level: LocationType, name: &str) -> Result<Vec<LegacyPlace>> {
        let mut rows: Vec<LegacyPlace> = self
            .lock()
            .legacy
            .iter()
            .filter(|p| p.level == level && same_name(&p.name, name))
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.id);
        Ok(rows)
    }

    async fn legacy_by_id(&self, level: LocationType, id: i64) -> Result<Option<LegacyPlace>> {
        Ok(self
            .lock()
            .legacy
            .iter()
            .find(|p| p.level == level && p.id == id)
            .cloned())
    }

    async fn legacy_by_place_id(
        &self,
        level: LocationType,
        place_id: &str,
    ) -> Result<Option<LegacyPlace>> {
        let tables = self.lock();
        let mut hits: Vec<&LegacyPlace> = tables
            .legacy
            .iter()
            .filter(|p| p.level == level && p.place_id.as_deref() == Some(place_id))
            .collect();
        hits.sort_by_key(|p| p.id);
        Ok(hits.first().map(|p| (*p).clone()))
    }

    async fn legacy_missing_slugs(&self, level: LocationType) -> Result<i64> {
        Ok(self
            .lock()
            .legacy
            .iter()
            .filter(|p| p.level == level && p.slug.is_none())
            .count() as i64)
    }

    async fn location(&self, id: i64) -> Result<Option<Location>> {
        Ok(self.lock().locations.get(&id).cloned())
    }

    async fn location_by_place_id(&self, place_id: &str) -> Result<Option<Location>> {
        Ok(self
            .lock()
            .locations
            .values()
            .find(|l| l.place_id.as_deref() == Some(place_id))
            .cloned())
    }

    async fn first_location_within(&self, bbox: BoundingBox) -> Result<Option<Location>> {
        Ok(self
            .lock()
            .locations
            .values()
            .find(|l| l.coordinates().is_some_and(|c| bbox.contains(c)))
            .cloned())
    }

    async fn sibling_slugs(
        &self,
        kind: LocationType,
        parent_id: Option<i64>,
        base: &str,
        exclude_id: Option<i64>,
    ) -> Result<HashSet<String>> {
        let prefix = format!("{base}-");
        Ok(self
            .lock()
            .locations
            .values()
            .filter(|l| l.kind == kind && l.parent_id == parent_id && Some(l.id) != exclude_id)
            .filter(|l| l.slug == base || l.slug.starts_with(&prefix))
            .map(|l| l.slug.clone())
            .collect())
    }

    async fn insert_location(&self, draft: &LocationDraft) -> Result<i64> {
        let mut tables = self.lock();
        if let Some(place_id) = &draft.place_id {
            let conflict = || LocationError::UpsertConflict {
                place_id: place_id.clone(),
            };
            match tables.insert_conflicts.remove(place_id) {
                Some(InsertConflict::ConcurrentRow) => {
                    push_location(&mut tables, draft);
                    return Err(conflict());
                }
                Some(InsertConflict::Vanished) => return Err(conflict()),
                Some(InsertConflict::UpdateFails) => {
                    tables.failing_place_id_updates.insert(place_id.clone());
                    return Err(conflict());
                }
                None => {}
            }
            if tables
                .locations
                .values()
                .any(|l| l.place_id.as_ref() == Some(place_id))
            {
                return Err(conflict());
            }
        }
        Ok(push_location(&mut tables, draft))
    }

    async fn update_location(&self, id: i64, draft: &LocationDraft) -> Result<()> {
        match self.lock().locations.get_mut(&id) {
            Some(location) => {
                apply_draft(location, draft);
                Ok(())
            }
            None => Err(LocationError::Database(sqlx::Error::RowNotFound)),
        }
    }

    async fn update_location_by_place_id(
        &self,
        place_id: &str,
        draft: &LocationDraft,
    ) -> Result<Option<i64>> {
        let mut tables = self.lock();
        if tables.failing_place_id_updates.contains(place_id) {
            return Err(LocationError::Database(sqlx::Error::Protocol(format!(
                "simulated update failure for place_id {place_id}"
            ))));
        }
        let Some(location) = tables
            .locations
            .values_mut()
            .find(|l| l.place_id.as_deref() == Some(place_id))
        else {
            return Ok(None);
        };
        apply_draft(location, draft);
        Ok(Some(location.id))
    }

    async fn count_locations(&self) -> Result<i64> {
        Ok(self.lock().locations.len() as i64)
    }

    async fn pending_dependents(
        &self,
        table: DependentTable,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<DependentRow>> {
        let tables = self.lock();
        let Some(rows) = tables.dependents.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(after_id.saturating_add(1)..)
            .map(|(_, row)| row)
            .filter(|row| row.location_id.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn assign_location(
        &self,
        table: DependentTable,
        row_id: i64,
        assignment: &LocationAssignment,
    ) -> Result<bool> {
        let mut tables = self.lock();
        match tables.failing_rows.get(&(table, row_id)) {
            Some(WriteFailure::Transient) => {
                return Err(LocationError::Database(sqlx::Error::Protocol(format!(
                    "simulated write failure for {table} row {row_id}"
                ))))
            }
            Some(WriteFailure::ConnectionLost) => {
                return Err(LocationError::Database(sqlx::Error::PoolClosed))
            }
            None => {}
        }
        let Some(row) = tables
            .dependents
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(&row_id))
        else {
            return Ok(false);
        };
        if row.location_id.is_some() {
            return Ok(false);
        }
        row.location_id = Some(assignment.location_id);
        row.province_id = row.province_id.or(assignment.province_id);
        row.city_id = row.city_id.or(assignment.city_id);
        row.suburb_id = row.suburb_id.or(assignment.suburb_id);
        Ok(true)
    }

    async fn orphaned_locations(&self, sample: i64) -> Result<Violations<i64>> {
        let tables = self.lock();
        let ids = tables
            .locations
            .values()
            .filter(|l| {
                l.parent_id
                    .is_some_and(|parent| !tables.locations.contains_key(&parent))
            })
            .map(|l| l.id)
            .collect();
        Ok(sampled(ids, sample))
    }

    async fn misparented_locations(
        &self,
        kind: LocationType,
        sample: i64,
    ) -> Result<Violations<i64>> {
        let tables = self.lock();
        let ids = tables
            .locations
            .values()
            .filter(|l| l.kind == kind)
            .filter(|l| match (kind.parent_type(), l.parent_id) {
                (None, parent) => parent.is_some(),
                (Some(expected), Some(parent)) => tables
                    .locations
                    .get(&parent)
                    .is_some_and(|p| p.kind != expected),
                (Some(_), None) => true,
            })
            .map(|l| l.id)
            .collect();
        Ok(sampled(ids, sample))
    }

    async fn duplicate_slug_groups(&self, sample: i64) -> Result<Violations<DuplicateSlugGroup>> {
        let tables = self.lock();
        let mut groups: BTreeMap<(String, Option<i64>), i64> = BTreeMap::new();
        for location in tables.locations.values() {
            *groups
                .entry((location.slug.clone(), location.parent_id))
                .or_default() += 1;
        }
        let dupes = groups
            .into_iter()
            .filter(|(_, members)| *members > 1)
            .map(|((slug, parent_id), members)| DuplicateSlugGroup {
                slug,
                parent_id,
                members,
            })
            .collect();
        Ok(sampled(dupes, sample))
    }

    async fn duplicate_place_ids(&self, sample: i64) -> Result<Violations<String>> {
        let tables = self.lock();
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for place_id in tables.locations.values().filter_map(|l| l.place_id.as_deref()) {
            *counts.entry(place_id).or_default() += 1;
        }
        let dupes = counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(place_id, _)| place_id.to_string())
            .collect();
        Ok(sampled(dupes, sample))
    }
}
