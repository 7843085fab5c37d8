//! Append-only JSONL journal of supervisor records.
//!
//! One object per line, `{"ts": ..., "type": ..., ...fields}`. Writes are
//! best-effort: failures are logged, never returned.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/logs/supervisor.jsonl`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("logs").join("supervisor.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record of `kind`. Struct fields are flattened next to `ts`/`type`.
    pub fn record<T: Serialize>(&self, kind: &str, fields: &T) {
        let mut obj = Map::new();
        obj.insert("ts".into(), Value::String(Utc::now().to_rfc3339()));
        obj.insert("type".into(), Value::String(kind.to_string()));
        match serde_json::to_value(fields) {
            Ok(Value::Object(map)) => obj.extend(map),
            Ok(Value::Null) => {}
            Ok(other) => {
                obj.insert("data".into(), other);
            }
            Err(e) => {
                tracing::warn!("⚠️ Journal record {kind} not serializable: {e}");
                return;
            }
        }
        if let Err(e) = self.append(&Value::Object(obj)) {
            tracing::warn!("⚠️ Failed to append journal {}: {e}", self.path.display());
        }
    }

    fn append(&self, value: &Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Read back every parseable record.
    pub fn read_all(&self) -> Vec<Value> {
        std::fs::read_to_string(&self.path)
            .map(|txt| {
                txt.lines()
                    .filter_map(|l| serde_json::from_str(l).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}
