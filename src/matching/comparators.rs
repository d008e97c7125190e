// src/matching/comparators.rs
//
// Pure similarity functions applied by rule conditions. Deterministic and
// symmetric for any two well-typed values; type compatibility is enforced at
// rule activation, so a kind mismatch here scores 0.0 rather than failing.

use strsim::{jaro_winkler, levenshtein};
use unicode_normalization::UnicodeNormalization;

use crate::models::{ComparatorKind, FieldValue};

const EARTH_RADIUS_M: f64 = 6371000.0;

/// Normalize text before comparison: NFKC fold, lowercase, trim, and
/// collapse internal whitespace runs to single spaces.
pub fn normalize_text(s: &str) -> String {
    let folded: String = s.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compare two field values under the given comparator, returning a
/// similarity in [0, 1].
pub fn compare(comparator: ComparatorKind, a: &FieldValue, b: &FieldValue) -> f64 {
    match comparator {
        ComparatorKind::Eq => compare_eq(a, b),
        ComparatorKind::JaroWinkler => match (a, b) {
            (FieldValue::Text(x), FieldValue::Text(y)) => {
                jaro_winkler(&normalize_text(x), &normalize_text(y))
            }
            _ => 0.0,
        },
        ComparatorKind::Levenshtein { max_distance } => match (a, b) {
            (FieldValue::Text(x), FieldValue::Text(y)) => {
                bounded_levenshtein(&normalize_text(x), &normalize_text(y), max_distance)
            }
            _ => 0.0,
        },
        ComparatorKind::NumericTolerance { tolerance } => match (a, b) {
            (FieldValue::Number(x), FieldValue::Number(y)) => {
                if (x - y).abs() <= tolerance {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        },
        ComparatorKind::GeoProximity { max_distance_m } => match (a, b) {
            (
                FieldValue::Geo { lat: lat1, lon: lon1 },
                FieldValue::Geo { lat: lat2, lon: lon2 },
            ) => {
                let distance = haversine_distance_m(*lat1, *lon1, *lat2, *lon2);
                linear_decay(distance, max_distance_m)
            }
            _ => 0.0,
        },
    }
}

fn compare_eq(a: &FieldValue, b: &FieldValue) -> f64 {
    let equal = match (a, b) {
        (FieldValue::Text(x), FieldValue::Text(y)) => normalize_text(x) == normalize_text(y),
        (FieldValue::Date(x), FieldValue::Date(y)) => x == y,
        (FieldValue::Number(x), FieldValue::Number(y)) => x == y,
        (
            FieldValue::Geo { lat: lat1, lon: lon1 },
            FieldValue::Geo { lat: lat2, lon: lon2 },
        ) => lat1 == lat2 && lon1 == lon2,
        _ => false,
    };
    if equal {
        1.0
    } else {
        0.0
    }
}

/// 1.0 at distance <= max, decaying linearly to 0.0 at 2x max. Avoids the
/// all-or-nothing cliff on near-miss company names.
fn bounded_levenshtein(a: &str, b: &str, max_distance: u32) -> f64 {
    let d = levenshtein(a, b) as u32;
    if max_distance == 0 {
        return if d == 0 { 1.0 } else { 0.0 };
    }
    if d <= max_distance {
        1.0
    } else if d >= 2 * max_distance {
        0.0
    } else {
        (2 * max_distance - d) as f64 / max_distance as f64
    }
}

fn linear_decay(distance: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return if distance == 0.0 { 1.0 } else { 0.0 };
    }
    if distance <= max {
        1.0
    } else if distance >= 2.0 * max {
        0.0
    } else {
        (2.0 * max - distance) / max
    }
}

/// Haversine distance between two points in meters.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a =
        (dlat / 2.0).sin().powi(2) + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
