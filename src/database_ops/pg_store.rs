use std::collections::HashSet;

use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::database_ops::db::Db;
use crate::database_ops::error::{LocationError, Result};
use crate::database_ops::models::{
    DependentRow, DependentTable, DuplicateSlugGroup, LegacyPlace, Location, LocationAssignment,
    LocationDraft, LocationType, Violations,
};
use crate::database_ops::store::LocationStore;
use crate::normalization::coords::BoundingBox;

const LOCATION_COLUMNS: &str = r#"id, name, slug, "type" AS kind, parent_id, place_id,
    latitude::text AS latitude, longitude::text AS longitude, seo_title, seo_description,
    created_at, updated_at"#;

const DEPENDENT_COLUMNS: &str = r#"id::BIGINT AS id, province, city, suburb, address, place_id,
    latitude::text AS latitude, longitude::text AS longitude,
    province_id::BIGINT AS province_id, city_id::BIGINT AS city_id,
    suburb_id::BIGINT AS suburb_id, location_id::BIGINT AS location_id"#;

/// `LocationStore` over the Postgres schema in `migrations/`.
#[derive(Clone)]
pub struct PgLocationStore {
    db: Db,
}

impl PgLocationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn legacy_select(level: LocationType) -> String {
    let parent = match level.legacy_parent_column() {
        Some(col) => format!("{col}::BIGINT AS parent_id"),
        None => "NULL::BIGINT AS parent_id".to_string(),
    };
    format!(
        "SELECT id::BIGINT AS id, {parent}, name, slug, place_id, \
         latitude::text AS latitude, longitude::text AS longitude FROM {}",
        level.legacy_table()
    )
}

fn legacy_from_row(level: LocationType, r: &PgRow) -> Result<LegacyPlace> {
    Ok(LegacyPlace {
        id: r.try_get("id")?,
        level,
        parent_id: r.try_get("parent_id")?,
        name: r.try_get("name")?,
        slug: r.try_get("slug")?,
        place_id: r.try_get("place_id")?,
        latitude: r.try_get("latitude")?,
        longitude: r.try_get("longitude")?,
    })
}

fn location_from_row(r: &PgRow) -> Result<Location> {
    let kind: String = r.try_get("kind")?;
    let kind = kind
        .parse::<LocationType>()
        .map_err(|e| LocationError::Database(sqlx::Error::Decode(e.into())))?;
    Ok(Location {
        id: r.try_get("id")?,
        name: r.try_get("name")?,
        slug: r.try_get("slug")?,
        kind,
        parent_id: r.try_get("parent_id")?,
        place_id: r.try_get("place_id")?,
        latitude: r.try_get("latitude")?,
        longitude: r.try_get("longitude")?,
        seo_title: r.try_get("seo_title")?,
        seo_description: r.try_get("seo_description")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn dependent_from_row(r: &PgRow) -> Result<DependentRow> {
    Ok(DependentRow {
        id: r.try_get("id")?,
        province: r.try_get("province")?,
        city: r.try_get("city")?,
        suburb: r.try_get("suburb")?,
        address: r.try_get("address")?,
        place_id: r.try_get("place_id")?,
        latitude: r.try_get("latitude")?,
        longitude: r.try_get("longitude")?,
        province_id: r.try_get("province_id")?,
        city_id: r.try_get("city_id")?,
        suburb_id: r.try_get("suburb_id")?,
        location_id: r.try_get("location_id")?,
    })
}

/// Rows of `(value, total)` from a `COUNT(*) OVER ()` query.
fn violations_from<T>(rows: Vec<PgRow>, value: impl Fn(&PgRow) -> Result<T>) -> Result<Violations<T>> {
    let count = match rows.first() {
        Some(r) => r.try_get::<i64, _>("total")?,
        None => 0,
    };
    let sample = rows.iter().map(value).collect::<Result<Vec<_>>>()?;
    Ok(Violations { count, sample })
}

/// Unique violations on the place_id index become `UpsertConflict`.
fn map_write_error(err: sqlx::Error, place_id: Option<&str>) -> LocationError {
    if let (sqlx::Error::Database(db_err), Some(place_id)) = (&err, place_id) {
        if db_err.is_unique_violation()
            && db_err.constraint().map_or(true, |c| c.contains("place_id"))
        {
            return LocationError::UpsertConflict {
                place_id: place_id.to_string(),
            };
        }
    }
    LocationError::Database(err)
}

#[async_trait::async_trait]
impl LocationStore for PgLocationStore {
    async fn legacy_places(&self, level: LocationType) -> Result<Vec<LegacyPlace>> {
        let sql = format!("{} ORDER BY id", legacy_select(level));
        let rows = sqlx::query(&sql)
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(|r| legacy_from_row(level, r)).collect()
    }

    async fn legacy_by_name(&self, level: LocationType, name: &str) -> Result<Vec<LegacyPlace>> {
        let sql = format!(
            "{} WHERE lower(btrim(name)) = lower(btrim($1)) ORDER BY id",
            legacy_select(level)
        );
        let rows = sqlx::query(&sql)
            .persistent(false)
            .bind(name)
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(|r| legacy_from_row(level, r)).collect()
    }

    async fn legacy_by_id(&self, level: LocationType, id: i64) -> Result<Option<LegacyPlace>> {
        let sql = format!("{} WHERE id = $1", legacy_select(level));
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.map(|r| legacy_from_row(level, &r)).transpose()
    }

    async fn legacy_by_place_id(
        &self,
        level: LocationType,
        place_id: &str,
    ) -> Result<Option<LegacyPlace>> {
        let sql = format!(
            "{} WHERE place_id = $1 ORDER BY id LIMIT 1",
            legacy_select(level)
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(place_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.map(|r| legacy_from_row(level, &r)).transpose()
    }

    async fn legacy_missing_slugs(&self, level: LocationType) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*)::BIGINT FROM {} WHERE slug IS NULL",
            level.legacy_table()
        );
        let n: i64 = sqlx::query_scalar(&sql)
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(n)
    }

    async fn location(&self, id: i64) -> Result<Option<Location>> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = $1");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn location_by_place_id(&self, place_id: &str) -> Result<Option<Location>> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE place_id = $1");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(place_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn first_location_within(&self, bbox: BoundingBox) -> Result<Option<Location>> {
        let sql = format!(
            "SELECT {LOCATION_COLUMNS} FROM locations
             WHERE latitude IS NOT NULL AND longitude IS NOT NULL
               AND latitude::double precision BETWEEN $1 AND $2
               AND longitude::double precision BETWEEN $3 AND $4
             ORDER BY id
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(bbox.min_lat)
            .bind(bbox.max_lat)
            .bind(bbox.min_lng)
            .bind(bbox.max_lng)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn sibling_slugs(
        &self,
        kind: LocationType,
        parent_id: Option<i64>,
        base: &str,
        exclude_id: Option<i64>,
    ) -> Result<HashSet<String>> {
        let slugs: Vec<String> = sqlx::query_scalar(
            r#"SELECT slug FROM locations
               WHERE "type" = $1
                 AND parent_id IS NOT DISTINCT FROM $2
                 AND (slug = $3 OR slug LIKE $4)
                 AND ($5::BIGINT IS NULL OR id <> $5)"#,
        )
        .persistent(false)
        .bind(kind.as_str())
        .bind(parent_id)
        .bind(base)
        .bind(format!("{base}-%"))
        .bind(exclude_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(slugs.into_iter().collect())
    }

    async fn insert_location(&self, draft: &LocationDraft) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO locations
                 (name, slug, "type", parent_id, place_id, latitude, longitude,
                  seo_title, seo_description, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6::numeric, $7::numeric, $8, $9, now(), now())
               RETURNING id"#,
        )
        .persistent(false)
        .bind(&draft.name)
        .bind(&draft.slug)
        .bind(draft.kind.as_str())
        .bind(draft.parent_id)
        .bind(&draft.place_id)
        .bind(&draft.latitude)
        .bind(&draft.longitude)
        .bind(&draft.seo_title)
        .bind(&draft.seo_description)
        .fetch_one(&self.db.pool)
        .await
        .map_err(|e| map_write_error(e, draft.place_id.as_deref()))
    }

    async fn update_location(&self, id: i64, draft: &LocationDraft) -> Result<()> {
        sqlx::query(
            r#"UPDATE locations
               SET name = $2, slug = $3, "type" = $4, parent_id = $5, place_id = $6,
                   latitude = $7::numeric, longitude = $8::numeric,
                   seo_title = $9, seo_description = $10, updated_at = now()
               WHERE id = $1"#,
        )
        .persistent(false)
        .bind(id)
        .bind(&draft.name)
        .bind(&draft.slug)
        .bind(draft.kind.as_str())
        .bind(draft.parent_id)
        .bind(&draft.place_id)
        .bind(&draft.latitude)
        .bind(&draft.longitude)
        .bind(&draft.seo_title)
        .bind(&draft.seo_description)
        .execute(&self.db.pool)
        .await
        .map_err(|e| map_write_error(e, draft.place_id.as_deref()))?;
        Ok(())
    }

    async fn update_location_by_place_id(
        &self,
        place_id: &str,
        draft: &LocationDraft,
    ) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"UPDATE locations
               SET name = $2, slug = $3, "type" = $4, parent_id = $5,
                   latitude = $6::numeric, longitude = $7::numeric,
                   seo_title = $8, seo_description = $9, updated_at = now()
               WHERE place_id = $1
               RETURNING id"#,
        )
        .persistent(false)
        .bind(place_id)
        .bind(&draft.name)
        .bind(&draft.slug)
        .bind(draft.kind.as_str())
        .bind(draft.parent_id)
        .bind(&draft.latitude)
        .bind(&draft.longitude)
        .bind(&draft.seo_title)
        .bind(&draft.seo_description)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(id)
    }

    async fn count_locations(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*)::BIGINT FROM locations")
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(n)
    }

    async fn pending_dependents(
        &self,
        table: DependentTable,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<DependentRow>> {
        let sql = format!(
            "SELECT {DEPENDENT_COLUMNS} FROM {}
             WHERE location_id IS NULL AND id > $1
             ORDER BY id
             LIMIT $2",
            table.table_name()
        );
        let rows = sqlx::query(&sql)
            .persistent(false)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(dependent_from_row).collect()
    }

    async fn assign_location(
        &self,
        table: DependentTable,
        row_id: i64,
        assignment: &LocationAssignment,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {}
             SET location_id = $2,
                 province_id = COALESCE(province_id, $3),
                 city_id = COALESCE(city_id, $4),
                 suburb_id = COALESCE(suburb_id, $5)
             WHERE id = $1 AND location_id IS NULL",
            table.table_name()
        );
        let done = sqlx::query(&sql)
            .persistent(false)
            .bind(row_id)
            .bind(assignment.location_id)
            .bind(assignment.province_id)
            .bind(assignment.city_id)
            .bind(assignment.suburb_id)
            .execute(&self.db.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn orphaned_locations(&self, sample: i64) -> Result<Violations<i64>> {
        let rows = sqlx::query(
            r#"SELECT l.id, COUNT(*) OVER () AS total
               FROM locations l
               LEFT JOIN locations p ON p.id = l.parent_id
               WHERE l.parent_id IS NOT NULL AND p.id IS NULL
               ORDER BY l.id
               LIMIT $1"#,
        )
        .persistent(false)
        .bind(sample)
        .fetch_all(&self.db.pool)
        .await?;
        violations_from(rows, |r| Ok(r.try_get("id")?))
    }

    async fn misparented_locations(
        &self,
        kind: LocationType,
        sample: i64,
    ) -> Result<Violations<i64>> {
        let rows = match kind.parent_type() {
            None => {
                sqlx::query(
                    r#"SELECT id, COUNT(*) OVER () AS total
                       FROM locations
                       WHERE "type" = $1 AND parent_id IS NOT NULL
                       ORDER BY id
                       LIMIT $2"#,
                )
                .persistent(false)
                .bind(kind.as_str())
                .bind(sample)
                .fetch_all(&self.db.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"SELECT c.id, COUNT(*) OVER () AS total
                       FROM locations c
                       LEFT JOIN locations p ON p.id = c.parent_id
                       WHERE c."type" = $1
                         AND (c.parent_id IS NULL OR p."type" <> $2)
                       ORDER BY c.id
                       LIMIT $3"#,
                )
                .persistent(false)
                .bind(kind.as_str())
                .bind(expected.as_str())
                .bind(sample)
                .fetch_all(&self.db.pool)
                .await?
            }
        };
        violations_from(rows, |r| Ok(r.try_get("id")?))
    }

    async fn duplicate_slug_groups(&self, sample: i64) -> Result<Violations<DuplicateSlugGroup>> {
        let rows = sqlx::query(
            r#"SELECT slug, parent_id, COUNT(*)::BIGINT AS members, COUNT(*) OVER () AS total
               FROM locations
               GROUP BY slug, parent_id
               HAVING COUNT(*) > 1
               ORDER BY members DESC, slug
               LIMIT $1"#,
        )
        .persistent(false)
        .bind(sample)
        .fetch_all(&self.db.pool)
        .await?;
        violations_from(rows, |r| {
            Ok(DuplicateSlugGroup {
                slug: r.try_get("slug")?,
                parent_id: r.try_get("parent_id")?,
                members: r.try_get("members")?,
            })
        })
    }

    async fn duplicate_place_ids(&self, sample: i64) -> Result<Violations<String>> {
        let rows = sqlx::query(
            r#"SELECT place_id, COUNT(*) OVER () AS total
               FROM locations
               WHERE place_id IS NOT NULL
               GROUP BY place_id
               HAVING COUNT(*) > 1
               ORDER BY place_id
               LIMIT $1"#,
        )
        .persistent(false)
        .bind(sample)
        .fetch_all(&self.db.pool)
        .await?;
        violations_from(rows, |r| Ok(r.try_get("place_id")?))
    }
}
