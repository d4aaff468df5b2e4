use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::database_ops::error::LocationError;
use crate::normalization::coords::{parse_coordinate, Coordinates};

/// Level of a node in the province → city → suburb hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    Province,
    City,
    Suburb,
}

impl LocationType {
    pub const ALL: [LocationType; 3] = [Self::Province, Self::City, Self::Suburb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Province => "province",
            Self::City => "city",
            Self::Suburb => "suburb",
        }
    }

    /// Required type of the parent row, `None` for roots.
    pub fn parent_type(&self) -> Option<LocationType> {
        match self {
            Self::Province => None,
            Self::City => Some(Self::Province),
            Self::Suburb => Some(Self::City),
        }
    }

    /// Legacy per-level source table.
    pub fn legacy_table(&self) -> &'static str {
        match self {
            Self::Province => "provinces",
            Self::City => "cities",
            Self::Suburb => "suburbs",
        }
    }

    /// Column on the legacy table pointing at the parent level.
    pub fn legacy_parent_column(&self) -> Option<&'static str> {
        match self {
            Self::Province => None,
            Self::City => Some("province_id"),
            Self::Suburb => Some("city_id"),
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "province" => Ok(Self::Province),
            "city" => Ok(Self::City),
            "suburb" => Ok(Self::Suburb),
            other => Err(format!("unknown location type '{other}'")),
        }
    }
}

/// Canonical row of the `locations` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub kind: LocationType,
    pub parent_id: Option<i64>,
    pub place_id: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Location {
    pub fn coordinates(&self) -> Option<Coordinates> {
        Coordinates::parse(self.latitude.as_deref()?, self.longitude.as_deref()?)
    }
}

/// Field values written by an insert or in-place update of a `Location`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationDraft {
    pub name: String,
    pub slug: String,
    pub kind: LocationType,
    pub parent_id: Option<i64>,
    pub place_id: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub seo_title: String,
    pub seo_description: String,
}

/// A row of one of the legacy `provinces` / `cities` / `suburbs` tables.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyPlace {
    pub id: i64,
    pub level: LocationType,
    /// `province_id` for cities, `city_id` for suburbs.
    pub parent_id: Option<i64>,
    pub name: String,
    pub slug: Option<String>,
    pub place_id: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

/// Tables whose rows carry free-text location fields to be backfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependentTable {
    Properties,
    Developments,
}

impl DependentTable {
    pub const ALL: [DependentTable; 2] = [Self::Properties, Self::Developments];

    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Properties => "properties",
            Self::Developments => "developments",
        }
    }
}

impl fmt::Display for DependentTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for DependentTable {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "property" | "properties" => Ok(Self::Properties),
            "development" | "developments" => Ok(Self::Developments),
            other => Err(LocationError::InvalidTable(other.to_string())),
        }
    }
}

/// A `properties` / `developments` row as seen by the backfill.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependentRow {
    pub id: i64,
    pub province: Option<String>,
    pub city: Option<String>,
    pub suburb: Option<String>,
    pub address: Option<String>,
    pub place_id: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub province_id: Option<i64>,
    pub city_id: Option<i64>,
    pub suburb_id: Option<i64>,
    pub location_id: Option<i64>,
}

/// Location fields pulled out of a dependent row, blanks removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedLocation {
    pub province: Option<String>,
    pub city: Option<String>,
    pub suburb: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

impl ExtractedLocation {
    /// Extract and validate the fields of a dependent row.
    ///
    /// Coordinates that are present but cannot be parsed, are out of range, or
    /// come without their counterpart fail the row.
    pub fn from_row(row: &DependentRow) -> Result<Self, LocationError> {
        let extracted = Self {
            province: non_blank(row.province.as_deref()),
            city: non_blank(row.city.as_deref()),
            suburb: non_blank(row.suburb.as_deref()),
            address: non_blank(row.address.as_deref()),
            latitude: non_blank(row.latitude.as_deref()),
            longitude: non_blank(row.longitude.as_deref()),
        };
        match (&extracted.latitude, &extracted.longitude) {
            (None, None) => {}
            (Some(lat), Some(lng)) => {
                if Coordinates::parse(lat, lng).is_none() {
                    let reason = if parse_coordinate(lat).is_none() || parse_coordinate(lng).is_none()
                    {
                        format!("unparseable coordinates ({lat}, {lng})")
                    } else {
                        format!("coordinates out of range ({lat}, {lng})")
                    };
                    return Err(LocationError::RowResolution {
                        row_id: row.id,
                        reason,
                    });
                }
            }
            _ => {
                return Err(LocationError::RowResolution {
                    row_id: row.id,
                    reason: "latitude and longitude must be supplied together".into(),
                })
            }
        }
        Ok(extracted)
    }

    /// Parsed coordinates; `None` when absent or malformed.
    pub fn coordinates(&self) -> Option<Coordinates> {
        Coordinates::parse(self.latitude.as_deref()?, self.longitude.as_deref()?)
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Strategy that produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    PlaceId,
    Suburb,
    City,
    Province,
    Coordinates,
    None,
}

impl MatchedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlaceId => "place_id",
            Self::Suburb => "suburb",
            Self::City => "city",
            Self::Province => "province",
            Self::Coordinates => "coordinates",
            Self::None => "none",
        }
    }
}

impl From<LocationType> for MatchedBy {
    fn from(level: LocationType) -> Self {
        match level {
            LocationType::Province => Self::Province,
            LocationType::City => Self::City,
            LocationType::Suburb => Self::Suburb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocationMatch {
    pub location_id: Option<i64>,
    pub confidence: Confidence,
    pub matched_by: MatchedBy,
}

impl LocationMatch {
    pub fn found(location_id: i64, confidence: Confidence, matched_by: MatchedBy) -> Self {
        Self {
            location_id: Some(location_id),
            confidence,
            matched_by,
        }
    }

    pub fn unmatched() -> Self {
        Self {
            location_id: None,
            confidence: Confidence::Low,
            matched_by: MatchedBy::None,
        }
    }
}

/// Foreign keys written to a dependent row. `None` leaves the column untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationAssignment {
    pub location_id: i64,
    pub province_id: Option<i64>,
    pub city_id: Option<i64>,
    pub suburb_id: Option<i64>,
}

/// Offending rows found by one verifier query: total and a bounded sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Violations<T> {
    pub count: i64,
    pub sample: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateSlugGroup {
    pub slug: String,
    pub parent_id: Option<i64>,
    pub members: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with_coords(lat: Option<&str>, lng: Option<&str>) -> DependentRow {
        DependentRow {
            id: 7,
            city: Some("  Johannesburg ".into()),
            suburb: Some("   ".into()),
            latitude: lat.map(str::to_string),
            longitude: lng.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn extraction_trims_and_drops_blanks() {
        let extracted = ExtractedLocation::from_row(&row_with_coords(None, None)).unwrap();
        assert_eq!(extracted.city.as_deref(), Some("Johannesburg"));
        assert_eq!(extracted.suburb, None);
        assert_eq!(extracted.coordinates(), None);
    }

    #[test]
    fn malformed_coordinates_fail_the_row() {
        let err = ExtractedLocation::from_row(&row_with_coords(Some("-26.1x"), Some("28.0")))
            .unwrap_err();
        assert!(matches!(err, LocationError::RowResolution { row_id: 7, .. }));

        let err = ExtractedLocation::from_row(&row_with_coords(Some("-26.1"), None)).unwrap_err();
        assert!(matches!(err, LocationError::RowResolution { .. }));

        let err = ExtractedLocation::from_row(&row_with_coords(Some("-126.1"), Some("28.0")))
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn parses_table_and_type_names() {
        assert_eq!(
            "Property".parse::<DependentTable>().unwrap(),
            DependentTable::Properties
        );
        assert_eq!(
            "developments".parse::<DependentTable>().unwrap(),
            DependentTable::Developments
        );
        assert!("agents".parse::<DependentTable>().is_err());
        assert_eq!("Suburb".parse::<LocationType>(), Ok(LocationType::Suburb));
        assert_eq!(LocationType::Suburb.parent_type(), Some(LocationType::City));
        assert_eq!(LocationType::Province.parent_type(), None);
    }
}
