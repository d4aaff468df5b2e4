use tracing::{debug, instrument};

use crate::database_ops::error::Result;
use crate::database_ops::models::{
    Confidence, ExtractedLocation, LegacyPlace, LocationMatch, LocationType, MatchedBy,
};
use crate::database_ops::store::LocationStore;
use crate::normalization::coords::{BoundingBox, PROXIMITY_DELTA_DEGREES};
use crate::normalization::slug::normalize;

/// Resolves free-text location fields to a canonical location.
///
/// Strategies run in a fixed order and the first hit wins:
///
/// | order | strategy    | source                              | confidence |
/// |-------|-------------|-------------------------------------|------------|
/// | 1     | place_id    | `locations.place_id`                | high       |
/// | 2     | suburb      | `suburbs.name` → place_id           | high       |
/// | 3     | city        | `cities.name` → place_id            | medium     |
/// | 4     | province    | `provinces.name` → place_id         | low        |
/// | 5     | coordinates | ±0.05° box over `locations` lat/lng | medium     |
///
/// Province names are tried before coordinates even though they score lower.
/// The matcher never writes.
pub struct LocationMatcher<'a> {
    store: &'a dyn LocationStore,
}

impl<'a> LocationMatcher<'a> {
    pub fn new(store: &'a dyn LocationStore) -> Self {
        Self { store }
    }

    #[instrument(level = "debug", skip(self, extracted))]
    pub async fn resolve_location(
        &self,
        extracted: &ExtractedLocation,
        place_id: Option<&str>,
    ) -> Result<LocationMatch> {
        if let Some(place_id) = place_id.map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(location) = self.store.location_by_place_id(place_id).await? {
                return Ok(LocationMatch::found(
                    location.id,
                    Confidence::High,
                    MatchedBy::PlaceId,
                ));
            }
            debug!(place_id, "place_id has no canonical location; trying names");
        }

        let by_name = [
            (
                LocationType::Suburb,
                extracted.suburb.as_deref(),
                extracted.city.as_deref(),
                Confidence::High,
            ),
            (
                LocationType::City,
                extracted.city.as_deref(),
                extracted.province.as_deref(),
                Confidence::Medium,
            ),
            (
                LocationType::Province,
                extracted.province.as_deref(),
                None,
                Confidence::Low,
            ),
        ];
        for (level, name, parent_name, confidence) in by_name {
            let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
                continue;
            };
            if let Some(location_id) = self.resolve_by_name(level, name, parent_name).await? {
                return Ok(LocationMatch::found(
                    location_id,
                    confidence,
                    MatchedBy::from(level),
                ));
            }
        }

        if let Some(point) = extracted.coordinates() {
            let bbox = BoundingBox::around(point, PROXIMITY_DELTA_DEGREES);
            if let Some(location) = self.store.first_location_within(bbox).await? {
                return Ok(LocationMatch::found(
                    location.id,
                    Confidence::Medium,
                    MatchedBy::Coordinates,
                ));
            }
        }

        Ok(LocationMatch::unmatched())
    }

    /// Legacy name lookup at one level, then `place_id` → canonical location.
    ///
    /// Same-named rows are tried with the one under the extracted parent first, so
    /// "Rivonia, Johannesburg" does not land on a Rivonia elsewhere.
    async fn resolve_by_name(
        &self,
        level: LocationType,
        name: &str,
        parent_name: Option<&str>,
    ) -> Result<Option<i64>> {
        let candidates = self.store.legacy_by_name(level, name).await?;
        if candidates.is_empty() {
            return Ok(None);
        }
        let ordered = self.prefer_parent(level, candidates, parent_name).await?;
        for candidate in ordered {
            let Some(place_id) = candidate.place_id.as_deref() else {
                continue;
            };
            if let Some(location) = self.store.location_by_place_id(place_id).await? {
                return Ok(Some(location.id));
            }
            debug!(
                level = %level,
                legacy_id = candidate.id,
                place_id,
                "legacy match has no canonical location"
            );
        }
        Ok(None)
    }

    async fn prefer_parent(
        &self,
        level: LocationType,
        candidates: Vec<LegacyPlace>,
        parent_name: Option<&str>,
    ) -> Result<Vec<LegacyPlace>> {
        let (Some(parent_level), Some(parent_name)) = (level.parent_type(), parent_name) else {
            return Ok(candidates);
        };
        if candidates.len() < 2 {
            return Ok(candidates);
        }
        let wanted = normalize(parent_name);
        let mut preferred = Vec::new();
        let mut rest = Vec::new();
        for candidate in candidates {
            let parent = match candidate.parent_id {
                Some(id) => self.store.legacy_by_id(parent_level, id).await?,
                None => None,
            };
            if parent.is_some_and(|p| normalize(&p.name) == wanted) {
                preferred.push(candidate);
            } else {
                rest.push(candidate);
            }
        }
        preferred.extend(rest);
        Ok(preferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryLocationStore;
    use crate::database_ops::models::{Location, LocationDraft};
    use chrono::Utc;

    async fn canonical(store: &MemoryLocationStore, name: &str, place_id: &str) -> i64 {
        store
            .insert_location(&LocationDraft {
                name: name.into(),
                slug: crate::normalization::slug::slugify(name),
                kind: LocationType::Suburb,
                parent_id: None,
                place_id: Some(place_id.into()),
                latitude: None,
                longitude: None,
                seo_title: String::new(),
                seo_description: String::new(),
            })
            .await
            .unwrap()
    }

    fn joburg_fixture() -> MemoryLocationStore {
        let store = MemoryLocationStore::new();
        store.add_legacy_named(LocationType::Province, 1, None, "Gauteng", Some("ChIJ_gauteng"));
        store.add_legacy_named(LocationType::City, 5, Some(1), "Johannesburg", Some("ChIJ_joburg"));
        store.add_legacy_named(LocationType::Suburb, 9, Some(5), "Sandton", Some("ChIJ_sandton"));
        store
    }

    #[tokio::test]
    async fn suburb_name_resolves_with_high_confidence() {
        let store = joburg_fixture();
        canonical(&store, "Gauteng", "ChIJ_gauteng").await;
        canonical(&store, "Johannesburg", "ChIJ_joburg").await;
        let sandton = canonical(&store, "Sandton", "ChIJ_sandton").await;

        let extracted = ExtractedLocation {
            suburb: Some("Sandton".into()),
            city: Some("Johannesburg".into()),
            province: Some("Gauteng".into()),
            ..Default::default()
        };
        let matched = LocationMatcher::new(&store)
            .resolve_location(&extracted, None)
            .await
            .unwrap();
        assert_eq!(
            matched,
            LocationMatch::found(sandton, Confidence::High, MatchedBy::Suburb)
        );
    }

    #[tokio::test]
    async fn place_id_wins_regardless_of_other_fields() {
        let store = joburg_fixture();
        canonical(&store, "Sandton", "ChIJ_sandton").await;
        let other = canonical(&store, "Durban North", "ChIJ_durban_north").await;

        let extracted = ExtractedLocation {
            suburb: Some("Sandton".into()),
            city: Some("Johannesburg".into()),
            latitude: Some("-26.1".into()),
            longitude: Some("28.05".into()),
            ..Default::default()
        };
        let matched = LocationMatcher::new(&store)
            .resolve_location(&extracted, Some("ChIJ_durban_north"))
            .await
            .unwrap();
        assert_eq!(matched.location_id, Some(other));
        assert_eq!(matched.confidence, Confidence::High);
        assert_eq!(matched.matched_by, MatchedBy::PlaceId);
    }

    #[tokio::test]
    async fn unknown_city_without_coordinates_is_unmatched() {
        let store = joburg_fixture();
        let extracted = ExtractedLocation {
            city: Some("Faketown".into()),
            ..Default::default()
        };
        let matched = LocationMatcher::new(&store)
            .resolve_location(&extracted, None)
            .await
            .unwrap();
        assert_eq!(matched, LocationMatch::unmatched());
        assert_eq!(matched.confidence, Confidence::Low);
        assert_eq!(matched.location_id, None);
    }

    #[tokio::test]
    async fn city_and_province_fall_back_with_lower_confidence() {
        let store = joburg_fixture();
        let gauteng = canonical(&store, "Gauteng", "ChIJ_gauteng").await;
        let joburg = canonical(&store, "Johannesburg", "ChIJ_joburg").await;
        let matcher = LocationMatcher::new(&store);

        // Sandton exists in the legacy table but has no canonical row yet.
        let extracted = ExtractedLocation {
            suburb: Some("sandton ".into()),
            city: Some("JOHANNESBURG".into()),
            ..Default::default()
        };
        let matched = matcher.resolve_location(&extracted, None).await.unwrap();
        assert_eq!(
            matched,
            LocationMatch::found(joburg, Confidence::Medium, MatchedBy::City)
        );

        let extracted = ExtractedLocation {
            city: Some("Faketown".into()),
            province: Some("Gauteng".into()),
            ..Default::default()
        };
        let matched = matcher.resolve_location(&extracted, None).await.unwrap();
        assert_eq!(
            matched,
            LocationMatch::found(gauteng, Confidence::Low, MatchedBy::Province)
        );
    }

    #[tokio::test]
    async fn coordinates_match_within_box() {
        let store = MemoryLocationStore::new();
        let now = Utc::now();
        store.add_raw_location(Location {
            id: 42,
            name: "Rosebank".into(),
            slug: "rosebank".into(),
            kind: LocationType::Suburb,
            parent_id: None,
            place_id: None,
            latitude: Some("-26.1458".into()),
            longitude: Some("28.0417".into()),
            seo_title: None,
            seo_description: None,
            created_at: now,
            updated_at: now,
        });
        let matcher = LocationMatcher::new(&store);

        let near = ExtractedLocation {
            latitude: Some("-26.1076".into()),
            longitude: Some("28.0567".into()),
            ..Default::default()
        };
        let matched = matcher.resolve_location(&near, None).await.unwrap();
        assert_eq!(
            matched,
            LocationMatch::found(42, Confidence::Medium, MatchedBy::Coordinates)
        );

        let far = ExtractedLocation {
            latitude: Some("-33.9249".into()),
            longitude: Some("18.4241".into()),
            ..Default::default()
        };
        assert_eq!(
            matcher.resolve_location(&far, None).await.unwrap(),
            LocationMatch::unmatched()
        );

        let garbage = ExtractedLocation {
            latitude: Some("not-a-number".into()),
            longitude: Some("28.0".into()),
            ..Default::default()
        };
        assert_eq!(
            matcher.resolve_location(&garbage, None).await.unwrap(),
            LocationMatch::unmatched()
        );
    }

    #[tokio::test]
    async fn same_named_suburbs_prefer_the_extracted_city() {
        let store = MemoryLocationStore::new();
        store.add_legacy_named(LocationType::City, 5, None, "Johannesburg", None);
        store.add_legacy_named(LocationType::City, 6, None, "Pretoria", None);
        store.add_legacy_named(LocationType::Suburb, 10, Some(5), "Rivonia", Some("ChIJ_riv_jhb"));
        store.add_legacy_named(LocationType::Suburb, 11, Some(6), "Rivonia", Some("ChIJ_riv_pta"));
        let jhb = canonical(&store, "Rivonia", "ChIJ_riv_jhb").await;
        let pta = canonical(&store, "Rivonia", "ChIJ_riv_pta").await;
        let matcher = LocationMatcher::new(&store);

        let in_pretoria = ExtractedLocation {
            suburb: Some("Rivonia".into()),
            city: Some("Pretoria".into()),
            ..Default::default()
        };
        let matched = matcher.resolve_location(&in_pretoria, None).await.unwrap();
        assert_eq!(matched.location_id, Some(pta));

        let no_city = ExtractedLocation {
            suburb: Some("Rivonia".into()),
            ..Default::default()
        };
        let matched = matcher.resolve_location(&no_city, None).await.unwrap();
        assert_eq!(matched.location_id, Some(jhb));
    }
}
