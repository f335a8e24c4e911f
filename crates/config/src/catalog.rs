//! Catalog document loader
//!
//! A catalog document is a JSON object mapping clip ids to entries:
//!
//! ```json
//! {
//!   "intro_1": {
//!     "text": "Hola a todos.",
//!     "audio": "./audio/intro_1.mp3",
//!     "segments": [{ "text": "Hola a todos.", "start": 0 }],
//!     "pauses": [771]
//!   }
//! }
//! ```
//!
//! Every field is checked and every problem collected; a document with any
//! problem is rejected whole.

use avatar_core::{Catalog, CatalogEntry, Segment};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

use crate::CatalogConfig;

const BUILTIN_CATALOG: &str = include_str!("../assets/catalog.json");

static CATALOG_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("catalog id pattern is valid"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {message}")]
    Io { path: String, message: String },

    #[error("catalog is not valid JSON: {0}")]
    Json(String),

    #[error("catalog must be a JSON object")]
    NotAnObject,

    #[error("catalog validation failed: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

impl From<CatalogError> for avatar_core::Error {
    fn from(err: CatalogError) -> Self {
        avatar_core::Error::Catalog(err.to_string())
    }
}

pub fn is_valid_catalog_id(id: &str) -> bool {
    CATALOG_ID.is_match(id)
}

fn parse_object(json: &str) -> Result<Map<String, Value>, CatalogError> {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CatalogError::NotAnObject),
        Err(e) => Err(CatalogError::Json(e.to_string())),
    }
}

fn optional_string(
    id: &str,
    obj: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(format!("{id}.{field}: must be a string"));
            None
        }
    }
}

fn offset(value: &Value) -> Option<u64> {
    value
        .as_f64()
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n.round() as u64)
}

fn parse_segments(id: &str, value: Option<&Value>, errors: &mut Vec<String>) -> Vec<Segment> {
    let items = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            errors.push(format!("{id}.segments: must be an array"));
            return Vec::new();
        }
    };

    let mut segments = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let text = item.get("text").and_then(Value::as_str);
        let start = item.get("start").and_then(offset);

        if text.is_none() {
            errors.push(format!("{id}.segments[{i}]: missing text"));
        }
        if start.is_none() {
            errors.push(format!("{id}.segments[{i}]: missing or negative start"));
        }
        if let (Some(text), Some(start)) = (text, start) {
            if segments
                .last()
                .is_some_and(|prev: &Segment| prev.start_offset_ms > start)
            {
                errors.push(format!("{id}.segments[{i}]: start is before previous segment"));
            }
            segments.push(Segment::new(text, start));
        }
    }
    segments
}

fn parse_pauses(id: &str, value: Option<&Value>, errors: &mut Vec<String>) -> Vec<u64> {
    let items = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            errors.push(format!("{id}.pauses: must be an array"));
            return Vec::new();
        }
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let pause = offset(item);
            if pause.is_none() {
                errors.push(format!("{id}.pauses[{i}]: must be a non-negative number"));
            }
            pause
        })
        .collect()
}

fn parse_entry(id: &str, value: &Value, errors: &mut Vec<String>) -> Option<CatalogEntry> {
    let Some(obj) = value.as_object() else {
        errors.push(format!("{id}: must be an object"));
        return None;
    };

    let before = errors.len();
    let text = optional_string(id, obj, "text", errors);
    let audio = optional_string(id, obj, "audio", errors);
    if text.is_none() && !obj.contains_key("text") {
        errors.push(format!("{id}: missing field \"text\""));
    }
    if audio.is_none() && !obj.contains_key("audio") {
        errors.push(format!("{id}: missing field \"audio\""));
    }
    let segments = parse_segments(id, obj.get("segments"), errors);
    let pause_offsets = parse_pauses(id, obj.get("pauses"), errors);

    if errors.len() != before {
        return None;
    }
    match (text, audio) {
        (Some(display_text), Some(audio)) => Some(CatalogEntry {
            id: id.to_string(),
            display_text,
            audio_uri: Some(audio),
            segments,
            pause_offsets,
        }),
        (text, audio) => {
            if text.is_none() {
                errors.push(format!("{id}: \"text\" cannot be null"));
            }
            if audio.is_none() {
                errors.push(format!("{id}: \"audio\" cannot be null"));
            }
            None
        }
    }
}

/// Parse and validate a full catalog document
pub fn parse_catalog(json: &str) -> Result<Catalog, CatalogError> {
    let map = parse_object(json)?;
    let mut errors = Vec::new();
    let mut entries = Vec::with_capacity(map.len());

    for (id, value) in &map {
        if !is_valid_catalog_id(id) {
            errors.push(format!("invalid id: {id}"));
            continue;
        }
        if let Some(entry) = parse_entry(id, value, &mut errors) {
            entries.push(entry);
        }
    }

    if errors.is_empty() {
        Ok(Catalog::from_entries(entries))
    } else {
        Err(CatalogError::Invalid(errors))
    }
}

/// Apply a document of per-entry edits over `base`
///
/// Each field present in an override replaces the base value; `"audio":
/// null` removes the clip so the entry is spoken with text-to-speech. New ids
/// need at least a `text`.
pub fn parse_overrides(json: &str, base: &Catalog) -> Result<Catalog, CatalogError> {
    let map = parse_object(json)?;
    let mut errors = Vec::new();
    let mut edited = Vec::with_capacity(map.len());

    for (id, value) in &map {
        if !is_valid_catalog_id(id) {
            errors.push(format!("invalid id: {id}"));
            continue;
        }
        let Some(obj) = value.as_object() else {
            errors.push(format!("{id}: must be an object"));
            continue;
        };

        let before = errors.len();
        let text = optional_string(id, obj, "text", &mut errors);
        let audio = optional_string(id, obj, "audio", &mut errors);
        let segments = obj
            .contains_key("segments")
            .then(|| parse_segments(id, obj.get("segments"), &mut errors));
        let pauses = obj
            .contains_key("pauses")
            .then(|| parse_pauses(id, obj.get("pauses"), &mut errors));
        if errors.len() != before {
            continue;
        }

        let mut entry = match base.get(id) {
            Some(existing) => existing.clone(),
            None => match &text {
                Some(text) => CatalogEntry {
                    id: id.clone(),
                    display_text: text.clone(),
                    audio_uri: None,
                    segments: Vec::new(),
                    pause_offsets: Vec::new(),
                },
                None => {
                    errors.push(format!("{id}: new entries need \"text\""));
                    continue;
                }
            },
        };

        if let Some(text) = text {
            entry.display_text = text;
        }
        if obj.contains_key("audio") {
            entry.audio_uri = audio;
        }
        if let Some(segments) = segments {
            entry.segments = segments;
        }
        if let Some(pauses) = pauses {
            entry.pause_offsets = pauses;
        }
        edited.push(entry);
    }

    if errors.is_empty() {
        Ok(Catalog::merge([base, &Catalog::from_entries(edited)]))
    } else {
        Err(CatalogError::Invalid(errors))
    }
}

/// The catalog shipped with the crate
pub fn builtin_catalog() -> Catalog {
    match parse_catalog(BUILTIN_CATALOG) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::error!(error = %e, "Built-in catalog is invalid");
            Catalog::new()
        }
    }
}

fn read(path: &str) -> Result<String, CatalogError> {
    std::fs::read_to_string(Path::new(path)).map_err(|e| CatalogError::Io {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// Load the catalog named by configuration
///
/// Never fails: an unreadable or invalid document is logged and replaced by
/// the built-in catalog; invalid overrides are logged and skipped.
pub fn load_catalog(config: &CatalogConfig) -> Catalog {
    let base = match &config.path {
        Some(path) => match read(path).and_then(|json| parse_catalog(&json)) {
            Ok(catalog) => {
                tracing::info!(path = %path, entries = catalog.len(), "Catalog loaded");
                catalog
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Catalog rejected, using built-in catalog");
                builtin_catalog()
            }
        },
        None => builtin_catalog(),
    };

    let Some(overrides_path) = &config.overrides_path else {
        return base;
    };

    match read(overrides_path).and_then(|json| parse_overrides(&json, &base)) {
        Ok(catalog) => {
            tracing::info!(path = %overrides_path, "Catalog overrides applied");
            catalog
        }
        Err(e) => {
            tracing::warn!(path = %overrides_path, error = %e, "Catalog overrides rejected");
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = builtin_catalog();
        assert_eq!(
            catalog.ids().collect::<Vec<_>>(),
            vec!["intro_1", "que_es_1", "aprendizaje_1", "despedida_1"]
        );

        let intro = catalog.get("intro_1").unwrap();
        assert_eq!(intro.audio_uri.as_deref(), Some("./audio/intro_1.mp3"));
        assert_eq!(intro.pause_offsets, vec![771, 2240]);
        let starts: Vec<u64> = intro.segments.iter().map(|s| s.start_offset_ms).collect();
        assert_eq!(starts, vec![0, 1331, 3074]);
    }

    #[test]
    fn test_valid_document() {
        let catalog = parse_catalog(
            r#"{
                "hello": { "text": "Hello", "audio": "hello.mp3", "pauses": [100.4] },
                "bye": { "text": "Bye", "audio": "bye.mp3", "segments": [{"text": "Bye", "start": 0}] }
            }"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("hello").unwrap().pause_offsets, vec![100]);
        assert_eq!(catalog.get("bye").unwrap().segments.len(), 1);
    }

    #[test]
    fn test_one_bad_entry_rejects_document() {
        let result = parse_catalog(
            r#"{
                "good": { "text": "ok", "audio": "ok.mp3" },
                "bad": { "text": 5, "audio": "x.mp3", "pauses": ["soon"] }
            }"#,
        );

        match result {
            Err(CatalogError::Invalid(errors)) => {
                assert!(errors.iter().any(|e| e == "bad.text: must be a string"));
                assert!(errors.iter().any(|e| e.starts_with("bad.pauses[0]")));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_fields() {
        let Err(CatalogError::Invalid(errors)) = parse_catalog(r#"{ "a": { "segments": [] } }"#)
        else {
            panic!("expected validation failure");
        };
        assert!(errors.contains(&"a: missing field \"text\"".to_string()));
        assert!(errors.contains(&"a: missing field \"audio\"".to_string()));
    }

    #[test]
    fn test_invalid_id_and_shape() {
        assert!(matches!(
            parse_catalog(r#"{ "../etc": { "text": "x", "audio": "y" } }"#),
            Err(CatalogError::Invalid(_))
        ));
        assert_eq!(parse_catalog("[1, 2]"), Err(CatalogError::NotAnObject));
        assert!(matches!(parse_catalog("{"), Err(CatalogError::Json(_))));
    }

    #[test]
    fn test_segments_must_be_ordered() {
        let result = parse_catalog(
            r#"{ "a": { "text": "x", "audio": "a.mp3",
                 "segments": [{"text": "one", "start": 500}, {"text": "two", "start": 100}] } }"#,
        );
        assert!(matches!(result, Err(CatalogError::Invalid(_))));
    }

    #[test]
    fn test_overrides_edit_and_remove_audio() {
        let base = builtin_catalog();
        let catalog = parse_overrides(
            r#"{
                "intro_1": { "text": "Edited intro" },
                "que_es_1": { "audio": null },
                "custom": { "text": "Brand new line" }
            }"#,
            &base,
        )
        .unwrap();

        let intro = catalog.get("intro_1").unwrap();
        assert_eq!(intro.display_text, "Edited intro");
        assert_eq!(intro.pause_offsets, vec![771, 2240]);
        assert!(!catalog.get("que_es_1").unwrap().has_audio());
        assert!(!catalog.get("custom").unwrap().has_audio());
        assert_eq!(catalog.position("custom"), Some(4));
    }

    #[test]
    fn test_overrides_reject_new_entry_without_text() {
        let base = builtin_catalog();
        assert!(parse_overrides(r#"{ "custom": { "audio": "c.mp3" } }"#, &base).is_err());
    }

    #[test]
    fn test_load_catalog_falls_back_on_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"{ "x": { "text": "no audio" } }"#).unwrap();

        let catalog = load_catalog(&CatalogConfig {
            path: Some(path.display().to_string()),
            overrides_path: None,
        });
        assert!(catalog.contains("intro_1"));
        assert!(!catalog.contains("x"));
    }

    #[test]
    fn test_load_catalog_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let overrides = dir.path().join("overrides.json");
        std::fs::write(&path, r#"{ "a": { "text": "A", "audio": "a.mp3" } }"#).unwrap();
        std::fs::write(&overrides, r#"{ "a": { "text": "A2" } }"#).unwrap();

        let catalog = load_catalog(&CatalogConfig {
            path: Some(path.display().to_string()),
            overrides_path: Some(overrides.display().to_string()),
        });
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("a").unwrap().display_text, "A2");
    }
}
