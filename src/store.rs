//! JSON/CSV file persistence for the pipeline's intermediate and final outputs.

use crate::error::{BiblioError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, warn};

const BOM: char = '\u{feff}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    /// Non-ASCII escaped as `\uXXXX`, prefixed with a UTF-8 byte-order mark
    AsciiEscaped,
}

/// Pretty-print `value` to `path`, creating parent directories.
///
/// A failed write is retried once with the ASCII-escaped encoding. If that
/// fails too the error is returned as [`BiblioError::Persist`].
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let first = match write_encoded(path, value, Encoding::Utf8) {
        Ok(()) => {
            debug!(path = %path.display(), "Saved JSON");
            return Ok(());
        }
        Err(e) => e,
    };

    warn!(
        path = %path.display(),
        error = %first,
        "Write failed, retrying with ASCII-escaped encoding"
    );

    write_encoded(path, value, Encoding::AsciiEscaped).map_err(|second| BiblioError::Persist {
        path: path.to_path_buf(),
        message: format!("{}; fallback encoding: {}", first, second),
    })
}

fn write_encoded<T: Serialize + ?Sized>(path: &Path, value: &T, encoding: Encoding) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let content = match encoding {
        Encoding::Utf8 => json,
        Encoding::AsciiEscaped => {
            let mut out = String::with_capacity(json.len() + 3);
            out.push(BOM);
            out.push_str(&escape_non_ascii(&json));
            out
        }
    };
    std::fs::write(path, content)?;
    Ok(())
}

/// Replace every non-ASCII character with its `\uXXXX` escape(s).
///
/// Valid on serialized JSON because non-ASCII can only occur inside strings.
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, "\\u{:04x}", unit);
            }
        }
    }
    out
}

fn read_text(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .strip_prefix(BOM)
        .map(str::to_string)
        .unwrap_or(content))
}

/// Read and deserialize a JSON file written by [`write_json`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read_text(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Read a JSON array of loosely-typed objects.
///
/// `Ok(None)` when the file does not exist.
pub fn read_json_array(path: &Path) -> Result<Option<Vec<Value>>> {
    if !path.exists() {
        return Ok(None);
    }
    match read_json::<Value>(path)? {
        Value::Array(items) => Ok(Some(items)),
        other => Err(BiblioError::Parse(format!(
            "{} holds a JSON {} instead of an array",
            path.display(),
            json_kind(&other)
        ))),
    }
}

/// Read a key → abstract map. Non-string values are ignored.
///
/// `Ok(None)` when the file does not exist.
pub fn read_abstract_map(path: &Path) -> Result<Option<BTreeMap<String, String>>> {
    if !path.exists() {
        return Ok(None);
    }
    match read_json::<Value>(path)? {
        Value::Object(map) => Ok(Some(
            map.into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    _ => None,
                })
                .collect(),
        )),
        other => Err(BiblioError::Parse(format!(
            "{} holds a JSON {} instead of an object",
            path.display(),
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// CSV writer with flexible row lengths, creating parent directories.
pub fn csv_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_parent_dirs() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested/out/results.json");
        write_json(&path, &json!([{"title": "Pesquerías"}]))?;
        let back: Value = read_json(&path)?;
        assert_eq!(back[0]["title"], "Pesquerías");
        Ok(())
    }

    #[test]
    fn test_escape_non_ascii() {
        assert_eq!(escape_non_ascii("\"Pronóstico\""), "\"Pron\\u00f3stico\"");
        assert_eq!(escape_non_ascii("🐟"), "\\ud83d\\udc1f");
        assert_eq!(escape_non_ascii("plain"), "plain");
    }

    #[test]
    fn test_ascii_encoding_round_trips() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("abstracts.json");
        let value = json!({"10.1/x": "Pesquerías 🐟"});
        write_encoded(&path, &value, Encoding::AsciiEscaped)?;
        let raw = std::fs::read(&path)?;
        assert_eq!(&raw[..3], &[0xef, 0xbb, 0xbf]);
        assert!(raw[3..].is_ascii());
        let back: Value = read_json(&path)?;
        assert_eq!(back, value);
        Ok(())
    }

    #[test]
    fn test_write_failure_is_persist_error() -> Result<()> {
        let dir = TempDir::new()?;
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x")?;
        let err = write_json(&blocker.join("results.json"), &json!([]));
        assert!(matches!(err, Err(BiblioError::Persist { .. })));
        Ok(())
    }

    #[test]
    fn test_read_json_array_missing_and_wrong_shape() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(read_json_array(&dir.path().join("absent.json"))?.is_none());

        let path = dir.path().join("object.json");
        std::fs::write(&path, "{\"a\": 1}")?;
        assert!(matches!(read_json_array(&path), Err(BiblioError::Parse(_))));

        std::fs::write(&path, "not json")?;
        assert!(read_json_array(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_read_abstract_map_skips_non_strings() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("abstracts.json");
        std::fs::write(&path, r#"{"a": "text", "b": 3, "c": null}"#)?;
        let map = read_abstract_map(&path)?.unwrap_or_default();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a").map(String::as_str), Some("text"));
        Ok(())
    }
}
