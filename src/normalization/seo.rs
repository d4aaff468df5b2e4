use crate::database_ops::models::LocationType;

/// Title and meta description for a canonical location page.
///
/// `ancestors` are ordered nearest-first (a suburb passes `[city, province]`).
pub fn seo_fields(name: &str, kind: LocationType, ancestors: &[&str]) -> (String, String) {
    let name = name.trim();
    let place = match ancestors.first() {
        Some(parent) if !parent.trim().is_empty() => format!("{name}, {}", parent.trim()),
        _ => name.to_string(),
    };
    let title = format!("{place} Property for Sale & to Rent");
    let region = ancestors
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let description = match kind {
        LocationType::Province => format!(
            "Browse houses, apartments and new developments for sale and to rent across {name}."
        ),
        LocationType::City | LocationType::Suburb if !region.is_empty() => format!(
            "Find property for sale and to rent in {name}, {region}. Compare listings, agents and new developments."
        ),
        _ => format!(
            "Find property for sale and to rent in {name}. Compare listings, agents and new developments."
        ),
    };
    (title, description)
}
