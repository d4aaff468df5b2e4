use std::collections::HashSet;

use crate::database_ops::error::Result;
use crate::database_ops::models::{
    DependentRow, DependentTable, DuplicateSlugGroup, LegacyPlace, Location, LocationAssignment,
    LocationDraft, LocationType, Violations,
};
use crate::normalization::coords::BoundingBox;

/// Every read and write the engine performs. Components take a `&dyn LocationStore`
/// in their constructor; nothing reaches for a global handle.
#[async_trait::async_trait]
pub trait LocationStore: Send + Sync {
    // -- legacy hierarchy (read-only) --

    /// All rows of one legacy level, ordered by id.
    async fn legacy_places(&self, level: LocationType) -> Result<Vec<LegacyPlace>>;

    /// Rows whose name equals `name` ignoring case and surrounding whitespace, ordered by id.
    async fn legacy_by_name(&self, level: LocationType, name: &str) -> Result<Vec<LegacyPlace>>;

    async fn legacy_by_id(&self, level: LocationType, id: i64) -> Result<Option<LegacyPlace>>;

    async fn legacy_by_place_id(
        &self,
        level: LocationType,
        place_id: &str,
    ) -> Result<Option<LegacyPlace>>;

    /// Number of legacy rows of `level` with a NULL slug.
    async fn legacy_missing_slugs(&self, level: LocationType) -> Result<i64>;

    // -- canonical locations --

    async fn location(&self, id: i64) -> Result<Option<Location>>;

    async fn location_by_place_id(&self, place_id: &str) -> Result<Option<Location>>;

    /// Lowest-id location whose coordinates fall inside `bbox`.
    async fn first_location_within(&self, bbox: BoundingBox) -> Result<Option<Location>>;

    /// Slugs of siblings under `(kind, parent_id)` equal to `base` or starting with `base-`,
    /// ignoring the row `exclude_id`.
    async fn sibling_slugs(
        &self,
        kind: LocationType,
        parent_id: Option<i64>,
        base: &str,
        exclude_id: Option<i64>,
    ) -> Result<HashSet<String>>;

    /// Insert a location and return its id. A `place_id` collision yields
    /// `LocationError::UpsertConflict`.
    async fn insert_location(&self, draft: &LocationDraft) -> Result<i64>;

    async fn update_location(&self, id: i64, draft: &LocationDraft) -> Result<()>;

    /// Update the location owning `place_id`; `None` when no row has it.
    async fn update_location_by_place_id(
        &self,
        place_id: &str,
        draft: &LocationDraft,
    ) -> Result<Option<i64>>;

    async fn count_locations(&self) -> Result<i64>;

    // -- dependent rows --

    /// Up to `limit` rows with `location_id IS NULL` and `id > after_id`, ordered by id.
    async fn pending_dependents(
        &self,
        table: DependentTable,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<DependentRow>>;

    /// Write the assignment if the row still has no `location_id`. Already-populated
    /// legacy foreign keys are kept. Returns whether the row was updated.
    async fn assign_location(
        &self,
        table: DependentTable,
        row_id: i64,
        assignment: &LocationAssignment,
    ) -> Result<bool>;

    // -- integrity queries --

    /// Locations whose `parent_id` references a missing row.
    async fn orphaned_locations(&self, sample: i64) -> Result<Violations<i64>>;

    /// Locations of `kind` whose parent breaks the hierarchy: provinces with any parent,
    /// cities/suburbs whose existing parent has the wrong type.
    async fn misparented_locations(
        &self,
        kind: LocationType,
        sample: i64,
    ) -> Result<Violations<i64>>;

    /// `(slug, parent_id)` groups with more than one member.
    async fn duplicate_slug_groups(&self, sample: i64) -> Result<Violations<DuplicateSlugGroup>>;

    /// Non-null `place_id` values held by more than one location.
    async fn duplicate_place_ids(&self, sample: i64) -> Result<Violations<String>>;
}
