use crate::models::{value_as_f64, Modality, Params};

use super::FeatureVector;

pub const SENSOR_FEATURES: [&str; 3] = ["x", "y", "z"];

pub const TOUCH_DRAG_FEATURES: [&str; 9] = [
    "duration",
    "total_distance",
    "velocity",
    "straightness",
    "move_count",
    "dir_down",
    "dir_up",
    "dir_left",
    "dir_right",
];

pub const TOUCH_PRESSURE_FEATURES: [&str; 4] = ["touch_duration", "size", "x", "y"];

/// Closed vocabulary for the drag direction one-hot flags, in vector order
const DRAG_DIRECTIONS: [&str; 4] = ["down", "up", "left", "right"];

pub fn feature_names(modality: Modality) -> &'static [&'static str] {
    match modality {
        Modality::Sensor => &SENSOR_FEATURES,
        Modality::TouchDrag => &TOUCH_DRAG_FEATURES,
        Modality::TouchPressure => &TOUCH_PRESSURE_FEATURES,
    }
}

/// Map an event's parameters to the modality's fixed-dimension vector.
///
/// Never fails: absent or empty parameters yield the all-zero vector, missing
/// or non-numeric fields read as 0.
pub fn extract(modality: Modality, params: Option<&Params>) -> FeatureVector {
    let params = match params {
        Some(p) if !p.is_empty() => p,
        _ => return FeatureVector::zeros(modality.dimension()),
    };

    match modality {
        Modality::Sensor => FeatureVector(vec![
            number(params, "x"),
            number(params, "y"),
            number(params, "z"),
        ]),
        Modality::TouchDrag => extract_touch_drag(params),
        Modality::TouchPressure => FeatureVector(vec![
            number(params, "touch_duration"),
            number(params, "size"),
            number(params, "x"),
            number(params, "y"),
        ]),
    }
}

fn extract_touch_drag(params: &Params) -> FeatureVector {
    let duration = number(params, "duration");
    let total_distance = number(params, "total_distance");
    let straightness = number(params, "straightness");
    let move_count = number(params, "move_count");

    // Duration is reported in milliseconds
    let velocity = if duration > 0.0 {
        total_distance / (duration / 1000.0)
    } else {
        0.0
    };

    let direction = params
        .get("drag_direction")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();

    let mut values = vec![duration, total_distance, velocity, straightness, move_count];
    values.extend(
        DRAG_DIRECTIONS
            .iter()
            .map(|d| if direction == *d { 1.0 } else { 0.0 }),
    );

    FeatureVector(values)
}

fn number(params: &Params, key: &str) -> f64 {
    params.get(key).and_then(value_as_f64).unwrap_or(0.0)
}
