use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameter mapping attached to an event
pub type Params = Map<String, Value>;

/// Label used in verdicts for events whose action label maps to no modality
pub const UNKNOWN_MODALITY: &str = "unknown";

/// Category of behavioral signal with its own independent model pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Sensor,
    TouchDrag,
    TouchPressure,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Sensor, Modality::TouchDrag, Modality::TouchPressure];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Sensor => "sensor",
            Modality::TouchDrag => "touch_drag",
            Modality::TouchPressure => "touch_pressure",
        }
    }

    /// Fixed dimension of the density feature vector
    pub fn dimension(&self) -> usize {
        match self {
            Modality::Sensor => 3,
            Modality::TouchDrag => 9,
            Modality::TouchPressure => 4,
        }
    }

    /// Infer the modality from a device action label.
    ///
    /// Network events are handled by the geofence collaborator and map to `None`
    /// here, like every other unrecognised label.
    pub fn from_action_label(action_type: &str) -> Option<Modality> {
        let label = action_type.trim().to_lowercase();
        if label.starts_with("sensor_") {
            Some(Modality::Sensor)
        } else if label.contains("drag") {
            Some(Modality::TouchDrag)
        } else if label.contains("touch_pressure") || label.starts_with("touch_") {
            Some(Modality::TouchPressure)
        } else {
            None
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sensor" => Ok(Modality::Sensor),
            "touch_drag" => Ok(Modality::TouchDrag),
            "touch_pressure" => Ok(Modality::TouchPressure),
            other => Err(format!("Unknown modality: {}", other)),
        }
    }
}

/// Which of the two per-modality models an artifact belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Density,
    Sequence,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Density => "density",
            ModelKind::Sequence => "sequence",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle mode of a model manager for one modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Collecting,
    Inference,
}

/// A single behavioral event as delivered by the ingestion layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
    pub action_type: String,
    #[serde(default)]
    pub sequence_index: i64,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub params: Option<Params>,
    #[serde(default)]
    pub device_info: Option<Params>,
    #[serde(default)]
    pub location: Option<Params>,
}

impl Event {
    pub fn new(action_type: &str, sequence_index: i64, params: Params) -> Self {
        Event {
            user_id: String::new(),
            session_id: String::new(),
            action_type: action_type.to_string(),
            sequence_index,
            timestamp: Utc::now().to_rfc3339(),
            params: Some(params),
            device_info: None,
            location: None,
        }
    }

    pub fn modality(&self) -> Option<Modality> {
        Modality::from_action_label(&self.action_type)
    }

    /// Numeric parameter lookup; numeric strings are accepted, anything else is absent
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.as_ref().and_then(|p| p.get(key)).and_then(value_as_f64)
    }

    /// Parse the ISO-8601 timestamp, accepting offsets or naive UTC
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// Numeric view of a JSON value
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Score and flag produced by one model for one item
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Assessment {
    pub score: f64,
    pub is_anomaly: bool,
}

impl Assessment {
    pub fn neutral() -> Self {
        Assessment::default()
    }
}

/// Per-event decision of a single model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub modality: String,
    pub sequence_index: i64,
    pub timestamp: String,
    #[serde(rename = "anomaly_score")]
    pub score: f64,
    pub is_anomaly: bool,
}

impl Verdict {
    pub fn from_assessment(modality: &str, event: &Event, assessment: Assessment) -> Self {
        Verdict {
            modality: modality.to_string(),
            sequence_index: event.sequence_index,
            timestamp: event.timestamp.clone(),
            score: assessment.score,
            is_anomaly: assessment.is_anomaly,
        }
    }

    pub fn neutral(modality: &str, event: &Event) -> Self {
        Verdict::from_assessment(modality, event, Assessment::neutral())
    }

    pub fn assessment(&self) -> Assessment {
        Assessment {
            score: self.score,
            is_anomaly: self.is_anomaly,
        }
    }
}

/// Per-event decision merging the density and sequence verdicts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedVerdict {
    pub sequence_index: i64,
    pub modality: String,
    pub timestamp: String,
    pub is_anomaly_density: bool,
    pub anomaly_score_density: f64,
    pub is_anomaly_sequence: bool,
    pub anomaly_score_sequence: f64,
    pub is_anomaly_combined: bool,
    pub anomaly_score_combined: f64,
}
