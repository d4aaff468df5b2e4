use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::database_ops::error::Result;
use crate::database_ops::models::{LocationType, Violations};
use crate::database_ops::store::LocationStore;

/// Offending ids listed per failing check.
pub const SAMPLE_SIZE: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationCheck {
    pub name: &'static str,
    pub passed: bool,
    pub details: String,
}

impl VerificationCheck {
    fn from_violations<T: std::fmt::Debug>(
        name: &'static str,
        what: &str,
        violations: &Violations<T>,
    ) -> Self {
        if violations.count == 0 {
            Self {
                name,
                passed: true,
                details: format!("no {what}"),
            }
        } else {
            Self {
                name,
                passed: false,
                details: format!("{} {what}; sample: {:?}", violations.count, violations.sample),
            }
        }
    }
}

/// Read-only audit of the canonical hierarchy. Violations come back as failing
/// checks; nothing is repaired.
pub struct IntegrityVerifier<'a> {
    store: &'a dyn LocationStore,
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(store: &'a dyn LocationStore) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn verify(&self) -> Result<Vec<VerificationCheck>> {
        let mut checks = Vec::with_capacity(7);

        let orphans = self.store.orphaned_locations(SAMPLE_SIZE).await?;
        checks.push(VerificationCheck::from_violations(
            "no_orphaned_parents",
            "locations with a missing parent",
            &orphans,
        ));

        let provinces = self
            .store
            .misparented_locations(LocationType::Province, SAMPLE_SIZE)
            .await?;
        checks.push(VerificationCheck::from_violations(
            "provinces_have_no_parent",
            "provinces with a parent",
            &provinces,
        ));

        let cities = self
            .store
            .misparented_locations(LocationType::City, SAMPLE_SIZE)
            .await?;
        checks.push(VerificationCheck::from_violations(
            "cities_under_provinces",
            "cities whose parent is not a province",
            &cities,
        ));

        let suburbs = self
            .store
            .misparented_locations(LocationType::Suburb, SAMPLE_SIZE)
            .await?;
        checks.push(VerificationCheck::from_violations(
            "suburbs_under_cities",
            "suburbs whose parent is not a city",
            &suburbs,
        ));

        let mut missing = Vec::new();
        for level in LocationType::ALL {
            let n = self.store.legacy_missing_slugs(level).await?;
            if n > 0 {
                missing.push(format!("{}={n}", level.legacy_table()));
            }
        }
        checks.push(VerificationCheck {
            name: "legacy_slugs_present",
            passed: missing.is_empty(),
            details: if missing.is_empty() {
                "every legacy row has a slug".to_string()
            } else {
                format!("legacy rows without slug: {}", missing.join(", "))
            },
        });

        let dupes = self.store.duplicate_slug_groups(SAMPLE_SIZE).await?;
        checks.push(VerificationCheck::from_violations(
            "unique_sibling_slugs",
            "(slug, parent_id) groups with more than one member",
            &dupes,
        ));

        let place_ids = self.store.duplicate_place_ids(SAMPLE_SIZE).await?;
        checks.push(VerificationCheck::from_violations(
            "place_ids_unique",
            "place_ids shared by several locations",
            &place_ids,
        ));

        let failed = checks.iter().filter(|c| !c.passed).count();
        if failed == 0 {
            info!(checks = checks.len(), "verify: all checks passed");
        } else {
            for check in checks.iter().filter(|c| !c.passed) {
                warn!(check = check.name, details = %check.details, "verify: check failed");
            }
        }
        Ok(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryLocationStore;
    use crate::database_ops::models::Location;
    use crate::database_ops::sync::HierarchySynchronizer;
    use chrono::Utc;

    fn raw(id: i64, kind: LocationType, parent_id: Option<i64>, slug: &str) -> Location {
        let now = Utc::now();
        Location {
            id,
            name: slug.to_string(),
            slug: slug.to_string(),
            kind,
            parent_id,
            place_id: None,
            latitude: None,
            longitude: None,
            seo_title: None,
            seo_description: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn check<'c>(checks: &'c [VerificationCheck], name: &str) -> &'c VerificationCheck {
        checks.iter().find(|c| c.name == name).unwrap()
    }

    #[tokio::test]
    async fn synced_tree_passes_every_check() {
        let store = MemoryLocationStore::new();
        store.add_legacy(crate::database_ops::models::LegacyPlace {
            id: 1,
            level: LocationType::Province,
            parent_id: None,
            name: "Gauteng".into(),
            slug: Some("gauteng".into()),
            place_id: Some("ChIJ_gauteng".into()),
            latitude: None,
            longitude: None,
        });
        HierarchySynchronizer::new(&store, false)
            .sync_locations()
            .await
            .unwrap();

        let checks = IntegrityVerifier::new(&store).verify().await.unwrap();
        assert_eq!(checks.len(), 7);
        assert!(checks.iter().all(|c| c.passed), "{checks:?}");
    }

    #[tokio::test]
    async fn reports_broken_structure_without_repairing_it() {
        let store = MemoryLocationStore::new();
        store.add_raw_location(raw(1, LocationType::Province, None, "gauteng"));
        store.add_raw_location(raw(2, LocationType::Province, Some(1), "rogue"));
        store.add_raw_location(raw(3, LocationType::City, Some(2), "joburg"));
        store.add_raw_location(raw(4, LocationType::Suburb, Some(1), "sandton"));
        store.add_raw_location(raw(5, LocationType::Suburb, Some(77), "lost"));
        store.add_raw_location(raw(6, LocationType::Suburb, Some(3), "rivonia"));
        store.add_raw_location(raw(7, LocationType::Suburb, Some(3), "rivonia"));
        store.add_legacy_named(LocationType::City, 1, Some(1), "Johannesburg", None);

        let checks = IntegrityVerifier::new(&store).verify().await.unwrap();
        assert!(!check(&checks, "no_orphaned_parents").passed);
        assert!(check(&checks, "no_orphaned_parents").details.contains("[5]"));
        assert!(!check(&checks, "provinces_have_no_parent").passed);
        assert!(check(&checks, "cities_under_provinces").passed);
        assert!(!check(&checks, "suburbs_under_cities").passed);
        assert!(check(&checks, "suburbs_under_cities").details.starts_with("1 "));
        assert!(!check(&checks, "legacy_slugs_present").passed);
        assert!(!check(&checks, "unique_sibling_slugs").passed);
        assert!(check(&checks, "place_ids_unique").passed);
        assert_eq!(store.locations().len(), 7);
    }

    #[tokio::test]
    async fn parentless_cities_and_suburbs_fail_their_level_checks() {
        let store = MemoryLocationStore::new();
        store.add_raw_location(raw(1, LocationType::City, None, "johannesburg"));
        store.add_raw_location(raw(2, LocationType::Suburb, None, "sandton"));

        let checks = IntegrityVerifier::new(&store).verify().await.unwrap();
        let cities = check(&checks, "cities_under_provinces");
        assert!(!cities.passed);
        assert!(cities.details.contains("[1]"), "{}", cities.details);
        let suburbs = check(&checks, "suburbs_under_cities");
        assert!(!suburbs.passed);
        assert!(suburbs.details.contains("[2]"), "{}", suburbs.details);
        assert!(check(&checks, "no_orphaned_parents").passed);
    }

    #[tokio::test]
    async fn cities_must_hang_from_provinces() {
        let store = MemoryLocationStore::new();
        store.add_raw_location(raw(1, LocationType::Province, None, "gauteng"));
        store.add_raw_location(raw(2, LocationType::City, Some(1), "johannesburg"));
        store.add_raw_location(raw(3, LocationType::Suburb, Some(2), "sandton"));
        store.add_raw_location(raw(4, LocationType::City, Some(3), "under-suburb"));
        store.add_raw_location(raw(5, LocationType::City, Some(2), "under-city"));

        let checks = IntegrityVerifier::new(&store).verify().await.unwrap();
        let cities = check(&checks, "cities_under_provinces");
        assert!(!cities.passed);
        assert!(cities.details.starts_with("2 "), "{}", cities.details);
        assert!(cities.details.contains("[4, 5]"), "{}", cities.details);
        assert!(check(&checks, "suburbs_under_cities").passed);
        assert!(check(&checks, "provinces_have_no_parent").passed);
    }
}
