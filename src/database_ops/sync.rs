use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::database_ops::error::{LocationError, Result};
use crate::database_ops::models::{LegacyPlace, Location, LocationDraft, LocationType};
use crate::database_ops::store::LocationStore;
use crate::normalization::coords::Coordinates;
use crate::normalization::seo::seo_fields;
use crate::normalization::slug::{slug_with_suffix, slugify, EMPTY_SLUG_FALLBACK};

/// Canonical node assigned to one legacy row during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedNode {
    pub location_id: i64,
    pub name: String,
    /// Ancestor names, nearest first.
    pub ancestors: Vec<String>,
}

/// Legacy id → canonical node for one hierarchy level. Returned by each stage and
/// handed to the next one.
#[derive(Debug, Clone, Default)]
pub struct LocationIdMap {
    level: Option<LocationType>,
    nodes: HashMap<i64, SyncedNode>,
}

impl LocationIdMap {
    fn for_level(level: LocationType) -> Self {
        Self {
            level: Some(level),
            nodes: HashMap::new(),
        }
    }

    pub fn level(&self) -> Option<LocationType> {
        self.level
    }

    pub fn get(&self, legacy_id: i64) -> Option<&SyncedNode> {
        self.nodes.get(&legacy_id)
    }

    pub fn location_id(&self, legacy_id: i64) -> Option<i64> {
        self.nodes.get(&legacy_id).map(|n| n.location_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl LevelCounts {
    pub fn synced(&self) -> usize {
        self.created + self.updated
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub provinces_synced: usize,
    pub cities_synced: usize,
    pub suburbs_synced: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub dry_run: bool,
}

impl SyncSummary {
    fn record(&mut self, level: LocationType, counts: LevelCounts) {
        match level {
            LocationType::Province => self.provinces_synced = counts.synced(),
            LocationType::City => self.cities_synced = counts.synced(),
            LocationType::Suburb => self.suburbs_synced = counts.synced(),
        }
        self.created += counts.created;
        self.updated += counts.updated;
        self.skipped += counts.skipped;
    }
}

/// Per-run slug reservations, so two rows planned in the same run never share a
/// slug even before either is written (dry-run has nothing in the store).
#[derive(Default)]
struct SlugClaims(HashSet<(LocationType, Option<i64>, String)>);

impl SlugClaims {
    fn is_claimed(&self, kind: LocationType, parent_id: Option<i64>, slug: &str) -> bool {
        self.0.contains(&(kind, parent_id, slug.to_string()))
    }

    fn claim(&mut self, kind: LocationType, parent_id: Option<i64>, slug: &str) {
        self.0.insert((kind, parent_id, slug.to_string()));
    }
}

enum Written {
    Created(i64),
    Updated(i64),
    Skipped,
}

/// Builds the canonical `locations` tree from the legacy per-level tables.
///
/// Levels run strictly top-down; each child level resolves its parent through the
/// map returned by the previous level.
pub struct HierarchySynchronizer<'a> {
    store: &'a dyn LocationStore,
    dry_run: bool,
}

impl<'a> HierarchySynchronizer<'a> {
    pub fn new(store: &'a dyn LocationStore, dry_run: bool) -> Self {
        Self { store, dry_run }
    }

    #[instrument(skip(self), fields(dry_run = self.dry_run))]
    pub async fn sync_locations(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary {
            dry_run: self.dry_run,
            ..Default::default()
        };
        let mut claims = SlugClaims::default();
        let mut provisional_ids = 0i64;

        let (provinces, counts) = self
            .sync_level(LocationType::Province, None, &mut claims, &mut provisional_ids)
            .await?;
        summary.record(LocationType::Province, counts);

        let (cities, counts) = self
            .sync_level(
                LocationType::City,
                Some(&provinces),
                &mut claims,
                &mut provisional_ids,
            )
            .await?;
        summary.record(LocationType::City, counts);

        let (_suburbs, counts) = self
            .sync_level(
                LocationType::Suburb,
                Some(&cities),
                &mut claims,
                &mut provisional_ids,
            )
            .await?;
        summary.record(LocationType::Suburb, counts);

        info!(
            provinces = summary.provinces_synced,
            cities = summary.cities_synced,
            suburbs = summary.suburbs_synced,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            dry_run = self.dry_run,
            "sync: finished"
        );
        Ok(summary)
    }

    /// Sync one legacy level. `parents` must be the map returned for the level above.
    async fn sync_level(
        &self,
        level: LocationType,
        parents: Option<&LocationIdMap>,
        claims: &mut SlugClaims,
        provisional_ids: &mut i64,
    ) -> Result<(LocationIdMap, LevelCounts)> {
        let rows = self.store.legacy_places(level).await?;
        info!(level = %level, rows = rows.len(), "sync: level loaded");

        let mut map = LocationIdMap::for_level(level);
        let mut counts = LevelCounts::default();

        for row in rows {
            let parent = match level.parent_type() {
                None => None,
                Some(parent_level) => {
                    match (row.parent_id, parents) {
                        (Some(pid), Some(parents)) if parents.level() == Some(parent_level) => {
                            match parents.get(pid) {
                                Some(node) => Some(node),
                                None => {
                                    warn!(level = %level, legacy_id = row.id, parent_legacy_id = pid, "sync: parent was not synced; skipping");
                                    counts.skipped += 1;
                                    continue;
                                }
                            }
                        }
                        _ => {
                            warn!(level = %level, legacy_id = row.id, "sync: row has no usable parent; skipping");
                            counts.skipped += 1;
                            continue;
                        }
                    }
                }
            };

            let existing = match row.place_id.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
                Some(place_id) => self.store.location_by_place_id(place_id).await?,
                None => None,
            };
            let parent_id = parent.map(|p| p.location_id);
            if let Some(found) = &existing {
                // place_id held by another level, or by our own parent: never rewrite it
                if found.kind != level || parent_id == Some(found.id) {
                    warn!(
                        level = %level,
                        legacy_id = row.id,
                        location_id = found.id,
                        held_by = %found.kind,
                        "sync: place_id belongs to a location of another level; skipping"
                    );
                    counts.skipped += 1;
                    continue;
                }
            }
            let base = base_slug(&row);
            let slug = self
                .unique_slug(level, parent_id, &base, existing.as_ref(), claims)
                .await?;
            claims.claim(level, parent_id, &slug);

            let ancestors: Vec<String> = match parent {
                Some(p) => std::iter::once(p.name.clone())
                    .chain(p.ancestors.iter().cloned())
                    .collect(),
                None => Vec::new(),
            };
            let draft = build_draft(&row, slug, parent_id, &ancestors);

            let written = match existing {
                Some(location) => {
                    if !self.dry_run {
                        self.store.update_location(location.id, &draft).await?;
                    }
                    Written::Updated(location.id)
                }
                None if self.dry_run => {
                    *provisional_ids -= 1;
                    Written::Created(*provisional_ids)
                }
                None => self.insert_or_update(&row, &draft).await?,
            };

            let location_id = match written {
                Written::Created(id) => {
                    counts.created += 1;
                    id
                }
                Written::Updated(id) => {
                    counts.updated += 1;
                    id
                }
                Written::Skipped => {
                    counts.skipped += 1;
                    continue;
                }
            };
            debug!(
                level = %level,
                legacy_id = row.id,
                location_id,
                slug = %draft.slug,
                "sync: row synced"
            );
            map.nodes.insert(
                row.id,
                SyncedNode {
                    location_id,
                    name: row.name.trim().to_string(),
                    ancestors,
                },
            );
        }

        info!(
            level = %level,
            created = counts.created,
            updated = counts.updated,
            skipped = counts.skipped,
            dry_run = self.dry_run,
            "sync: level complete"
        );
        Ok((map, counts))
    }

    /// Insert, falling back to update-by-place_id when the insert collides.
    async fn insert_or_update(&self, row: &LegacyPlace, draft: &LocationDraft) -> Result<Written> {
        match self.store.insert_location(draft).await {
            Ok(id) => Ok(Written::Created(id)),
            Err(LocationError::UpsertConflict { place_id }) => {
                warn!(legacy_id = row.id, %place_id, "sync: insert conflicted; updating by place_id");
                match self.store.update_location_by_place_id(&place_id, draft).await {
                    Ok(Some(id)) => Ok(Written::Updated(id)),
                    Ok(None) => {
                        warn!(legacy_id = row.id, %place_id, "sync: conflicting location vanished; skipping");
                        Ok(Written::Skipped)
                    }
                    Err(err) if err.is_fatal() => Err(err),
                    Err(err) => {
                        warn!(legacy_id = row.id, %place_id, error = %err, "sync: update by place_id failed; skipping");
                        Ok(Written::Skipped)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// First free `base`, `base-2`, `base-3`, ... among siblings. An existing row keeps
    /// its current slug when that slug is still a free variant of `base`.
    async fn unique_slug(
        &self,
        kind: LocationType,
        parent_id: Option<i64>,
        base: &str,
        existing: Option<&Location>,
        claims: &SlugClaims,
    ) -> Result<String> {
        let taken = match parent_id {
            Some(pid) if pid < 0 => HashSet::new(),
            _ => {
                self.store
                    .sibling_slugs(kind, parent_id, base, existing.map(|l| l.id))
                    .await?
            }
        };
        let free = |slug: &str| !taken.contains(slug) && !claims.is_claimed(kind, parent_id, slug);

        if let Some(current) = existing.map(|l| l.slug.as_str()) {
            if existing.is_some_and(|l| l.parent_id == parent_id)
                && is_variant_of(base, current)
                && free(current)
            {
                return Ok(current.to_string());
            }
        }
        let mut n = 1;
        loop {
            let candidate = slug_with_suffix(base, n);
            if free(&candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }
}

fn base_slug(row: &LegacyPlace) -> String {
    let from_legacy = row.slug.as_deref().map(slugify).unwrap_or_default();
    let base = if from_legacy.is_empty() {
        slugify(&row.name)
    } else {
        from_legacy
    };
    if base.is_empty() {
        EMPTY_SLUG_FALLBACK.to_string()
    } else {
        base
    }
}

fn is_variant_of(base: &str, slug: &str) -> bool {
    slug == base
        || slug
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|n| n.parse::<usize>().ok())
            .is_some_and(|n| n >= 2)
}

fn build_draft(
    row: &LegacyPlace,
    slug: String,
    parent_id: Option<i64>,
    ancestors: &[String],
) -> LocationDraft {
    let name = row.name.trim().to_string();
    let coords = match (row.latitude.as_deref(), row.longitude.as_deref()) {
        (Some(lat), Some(lng)) => Coordinates::parse(lat, lng)
            .map(|_| (lat.trim().to_string(), lng.trim().to_string())),
        _ => None,
    };
    if coords.is_none() && (row.latitude.is_some() || row.longitude.is_some()) {
        debug!(legacy_id = row.id, "sync: dropping unusable legacy coordinates");
    }
    let ancestor_refs: Vec<&str> = ancestors.iter().map(String::as_str).collect();
    let (seo_title, seo_description) = seo_fields(&name, row.level, &ancestor_refs);
    let (latitude, longitude) = match coords {
        Some((lat, lng)) => (Some(lat), Some(lng)),
        None => (None, None),
    };
    LocationDraft {
        name,
        slug,
        kind: row.level,
        parent_id,
        place_id: row
            .place_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string),
        latitude,
        longitude,
        seo_title,
        seo_description,
    }
}
