/// Half-width of the proximity box in degrees (~5.5 km at South African latitudes).
pub const PROXIMITY_DELTA_DEGREES: f64 = 0.05;

/// Parse a decimal coordinate string. Returns `None` for blank, non-numeric or
/// non-finite input.
pub fn parse_coordinate(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Parse and range-check a latitude/longitude pair.
    pub fn parse(latitude: &str, longitude: &str) -> Option<Self> {
        let latitude = parse_coordinate(latitude)?;
        let longitude = parse_coordinate(longitude)?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }
        Some(Self {
            latitude,
            longitude,
        })
    }
}

/// Axis-aligned lat/lng box; edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn around(center: Coordinates, delta: f64) -> Self {
        Self {
            min_lat: center.latitude - delta,
            max_lat: center.latitude + delta,
            min_lng: center.longitude - delta,
            max_lng: center.longitude + delta,
        }
    }

    pub fn contains(&self, point: Coordinates) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}
