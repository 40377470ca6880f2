//! Loading recorded event logs from disk for replay

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::IngestError;
use crate::models::Event;

const EVENT_EXTENSIONS: [&str; 2] = ["json", "log"];

/// Load every event from `path`, a single file or a directory walked recursively.
///
/// Files are read in file-name order, depth first. Each file is parsed as one
/// JSON document (an array of events or a single event) and falls back to
/// JSON-lines. Entries that are not valid events are skipped.
pub fn load_events(path: &Path, filename_filter: Option<&str>) -> Result<Vec<Event>, IngestError> {
    let files = collect_files(path, filename_filter)?;
    if files.is_empty() {
        return Err(IngestError::NoFiles(path.display().to_string()));
    }

    let mut events = Vec::new();
    for file in &files {
        let raw = fs::read_to_string(file).map_err(|source| IngestError::Io {
            path: file.display().to_string(),
            source,
        })?;
        let parsed = parse_events(&raw);
        if parsed.is_empty() {
            warn!("No events read from {}", file.display());
        } else {
            debug!("Read {} events from {}", parsed.len(), file.display());
        }
        events.extend(parsed);
    }

    info!("Loaded {} events from {} files", events.len(), files.len());
    Ok(events)
}

/// Parse one file's contents: a JSON document first, JSON-lines otherwise
pub fn parse_events(raw: &str) -> Vec<Event> {
    let values = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items,
        Ok(value) => vec![value],
        Err(_) => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match serde_json::from_str::<Value>(line) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Skipping malformed line: {}", e);
                    None
                }
            })
            .collect(),
    };

    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Event>(value) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Skipping invalid event: {}", e);
                None
            }
        })
        .collect()
}

fn collect_files(path: &Path, filename_filter: Option<&str>) -> Result<Vec<PathBuf>, IngestError> {
    let io_error = |source| IngestError::Io {
        path: path.display().to_string(),
        source,
    };

    let metadata = fs::metadata(path).map_err(io_error)?;
    if metadata.is_file() {
        // An explicitly named file is read whatever its extension
        return Ok(if matches_filter(path, filename_filter) {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|e| IngestError::Walk {
            path: path.display().to_string(),
            source: e,
        })?;
        let entry_path = entry.path();
        if entry.file_type().is_file()
            && has_event_extension(entry_path)
            && matches_filter(entry_path, filename_filter)
        {
            files.push(entry_path.to_path_buf());
        }
    }

    Ok(files)
}

fn has_event_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| EVENT_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn matches_filter(path: &Path, filename_filter: Option<&str>) -> bool {
    match filename_filter {
        None => true,
        Some(needle) => path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.contains(needle))
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_array_and_single_object() {
        let events = parse_events(
            r#"[{"action_type": "sensor_accel", "sequence_index": 1, "params": {"x": 1.0}},
                {"action_type": "touch_drag", "sequence_index": 2}]"#,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action_type, "touch_drag");

        let events = parse_events(r#"{"action_type": "touch_pressure", "sequence_index": 7}"#);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence_index, 7);
    }

    #[test]
    fn test_json_lines_fallback_skips_bad_lines() {
        let raw = concat!(
            "{\"action_type\": \"sensor_gyro\", \"sequence_index\": 1}\n",
            "not json at all\n",
            "\n",
            "{\"sequence_index\": 2}\n",
            "{\"action_type\": \"touch_drag\", \"sequence_index\": 3}\n",
        );
        let events = parse_events(raw);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence_index, 1);
        assert_eq!(events[1].sequence_index, 3);
    }

    #[test]
    fn test_directory_walk_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("day2");
        fs::create_dir_all(&nested).unwrap();

        fs::write(
            dir.path().join("a_touch.json"),
            r#"[{"action_type": "touch_drag", "sequence_index": 1}]"#,
        )
        .unwrap();
        fs::write(
            nested.join("b_touch.log"),
            "{\"action_type\": \"touch_pressure\", \"sequence_index\": 2}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("c_sensor.json"),
            r#"[{"action_type": "sensor_accel", "sequence_index": 3}]"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "{\"action_type\": \"x\"}").unwrap();

        let all = load_events(dir.path(), None).unwrap();
        let order: Vec<i64> = all.iter().map(|e| e.sequence_index).collect();
        assert_eq!(order, vec![1, 3, 2]);

        let touch = load_events(dir.path(), Some("touch")).unwrap();
        assert_eq!(touch.len(), 2);
        assert!(touch.iter().all(|e| e.action_type.starts_with("touch")));
    }

    #[test]
    fn test_deep_directories_and_extension_case() {
        let dir = TempDir::new().unwrap();
        let deep = dir.path().join("2024").join("05").join("01");
        fs::create_dir_all(&deep).unwrap();

        fs::write(
            deep.join("session_A.LOG"),
            "{\"action_type\": \"sensor_gyro\", \"sequence_index\": 10}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("2024").join("session_B.Json"),
            r#"[{"action_type": "touch_drag", "sequence_index": 20}]"#,
        )
        .unwrap();
        fs::write(deep.join("other.json"), r#"[{"action_type": "touch_drag", "sequence_index": 30}]"#).unwrap();

        let events = load_events(dir.path(), Some("session")).unwrap();
        let order: Vec<i64> = events.iter().map(|e| e.sequence_index).collect();
        assert_eq!(order, vec![10, 20]);
    }

    #[test]
    fn test_missing_path_and_empty_directory() {
        let dir = TempDir::new().unwrap();

        let missing = load_events(&dir.path().join("absent"), None);
        assert!(matches!(missing, Err(IngestError::Io { .. })));

        let empty = load_events(dir.path(), None);
        assert!(matches!(empty, Err(IngestError::NoFiles(_))));
    }
}
