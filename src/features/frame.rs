use std::collections::BTreeSet;

use crate::models::{Event, Modality};

use super::FeatureVector;

const SENSOR_COLUMNS: [&str; 3] = ["x", "y", "z"];

/// Raw touch parameters copied into the frame (column name, parameter key)
const TOUCH_COLUMNS: [(&str, &str); 13] = [
    ("touch_x", "x"),
    ("touch_y", "y"),
    ("touch_size", "size"),
    ("touch_pressure", "pressure"),
    ("touch_duration", "touch_duration"),
    ("start_x", "start_x"),
    ("start_y", "start_y"),
    ("end_x", "end_x"),
    ("end_y", "end_y"),
    ("total_distance", "total_distance"),
    ("duration", "duration"),
    ("move_count", "move_count"),
    ("straightness", "straightness"),
];

/// Named numeric columns flattened from a run of raw events.
///
/// Missing values are stored as NaN and read back as 0 when selected.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl FeatureFrame {
    pub fn from_events<'a, I>(modality: Modality, events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        match modality {
            Modality::Sensor => Self::flatten_sensor(events),
            Modality::TouchDrag | Modality::TouchPressure => Self::flatten_touch(events),
        }
    }

    fn flatten_sensor<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let rows = events
            .into_iter()
            .map(|event| {
                SENSOR_COLUMNS
                    .iter()
                    .map(|key| event.param_f64(key).unwrap_or(f64::NAN))
                    .collect()
            })
            .collect();

        FeatureFrame {
            columns: SENSOR_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    fn flatten_touch<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut columns: Vec<String> = TOUCH_COLUMNS.iter().map(|(c, _)| c.to_string()).collect();
        columns.extend(["dx", "dy", "speed"].iter().map(|c| c.to_string()));

        let mut rows = Vec::new();
        let mut previous: Option<(f64, f64)> = None;

        for event in events {
            let mut row: Vec<f64> = TOUCH_COLUMNS
                .iter()
                .map(|(_, key)| event.param_f64(key).unwrap_or(f64::NAN))
                .collect();

            // Displacement from the previous touch point, 0 when either side is missing
            let (x, y) = (row[0], row[1]);
            let (dx, dy) = match previous {
                Some((px, py)) => (zero_if_nan(x - px), zero_if_nan(y - py)),
                None => (0.0, 0.0),
            };
            previous = Some((x, y));

            row.push(dx);
            row.push(dy);
            row.push((dx * dx + dy * dy).sqrt());
            rows.push(row);
        }

        FeatureFrame { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Columns carrying information: at least one value and more than one distinct value
    pub fn informative_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| {
                let distinct: BTreeSet<u64> = self
                    .rows
                    .iter()
                    .map(|row| row[*idx])
                    .filter(|v| !v.is_nan())
                    .map(|v| if v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() })
                    .collect();
                distinct.len() > 1
            })
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Reindex rows onto `columns`; unknown columns and missing values become 0
    pub fn select(&self, columns: &[String]) -> Vec<FeatureVector> {
        let indices: Vec<Option<usize>> = columns
            .iter()
            .map(|name| self.columns.iter().position(|c| c == name))
            .collect();

        self.rows
            .iter()
            .map(|row| {
                FeatureVector(
                    indices
                        .iter()
                        .map(|idx| idx.map(|i| zero_if_nan(row[i])).unwrap_or(0.0))
                        .collect(),
                )
            })
            .collect()
    }
}

fn zero_if_nan(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Params;
    use serde_json::json;

    fn event(action: &str, seq: i64, params: serde_json::Value) -> Event {
        let params: Params = params.as_object().cloned().unwrap();
        Event::new(action, seq, params)
    }

    #[test]
    fn test_sensor_frame_drops_constant_columns() {
        let events: Vec<Event> = (0..5)
            .map(|i| event("sensor_accel", i, json!({"x": i as f64, "y": 1.0, "z": "bad"})))
            .collect();
        let frame = FeatureFrame::from_events(Modality::Sensor, &events);

        assert_eq!(frame.len(), 5);
        assert_eq!(frame.informative_columns(), vec!["x".to_string()]);
    }

    #[test]
    fn test_touch_frame_derives_displacement() {
        let events = vec![
            event("touch_pressure", 1, json!({"x": 10.0, "y": 10.0})),
            event("touch_pressure", 2, json!({"x": 13.0, "y": 14.0})),
            event("touch_pressure", 3, json!({"size": 0.2})),
        ];
        let frame = FeatureFrame::from_events(Modality::TouchPressure, &events);
        let columns: Vec<String> = ["dx", "dy", "speed"].iter().map(|c| c.to_string()).collect();
        let rows = frame.select(&columns);

        assert_eq!(rows[0].0, vec![0.0, 0.0, 0.0]);
        assert_eq!(rows[1].0, vec![3.0, 4.0, 5.0]);
        assert_eq!(rows[2].0, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_select_fills_unknown_columns_with_zero() {
        let events = vec![event("sensor_gyro", 1, json!({"x": 2.0}))];
        let frame = FeatureFrame::from_events(Modality::Sensor, &events);
        let rows = frame.select(&["x".to_string(), "y".to_string(), "missing".to_string()]);

        assert_eq!(rows[0].0, vec![2.0, 0.0, 0.0]);
    }
}
