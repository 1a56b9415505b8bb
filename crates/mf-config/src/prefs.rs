//! Preferred outbound per profile.
//!
//! A flat `profile id -> outbound tag` map persisted as JSON. Updates are
//! single-key and last-writer-wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const PREFERENCES_FILE: &str = "preferences.json";

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("read preferences {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("write preferences {path}: {source}")]
    Write { path: String, source: io::Error },
    #[error("preferences are not a string map: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Preferences {
    selected_outbound_by_profile: BTreeMap<String, String>,
}

impl Preferences {
    /// Load from `path`; a missing file is an empty map.
    pub fn load(path: &Path) -> Result<Self, PrefsError> {
        match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(Self::default()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(PrefsError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Write through a temp file and rename so readers never see a partial map.
    pub fn save(&self, path: &Path) -> Result<(), PrefsError> {
        let text = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        let write_err = |source| PrefsError::Write {
            path: path.display().to_string(),
            source,
        };
        std::fs::write(&tmp, text).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)
    }

    pub fn get(&self, profile: &str) -> Option<&str> {
        self.selected_outbound_by_profile
            .get(profile)
            .map(String::as_str)
    }

    /// Returns the previous tag.
    pub fn set(&mut self, profile: impl Into<String>, tag: impl Into<String>) -> Option<String> {
        self.selected_outbound_by_profile
            .insert(profile.into(), tag.into())
    }

    pub fn remove(&mut self, profile: &str) -> Option<String> {
        self.selected_outbound_by_profile.remove(profile)
    }

    pub fn len(&self) -> usize {
        self.selected_outbound_by_profile.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected_outbound_by_profile.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let p = Preferences::load(&dir.path().join(PREFERENCES_FILE)).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn last_writer_wins_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        let mut p = Preferences::default();
        assert_eq!(p.set("7", "a"), None);
        assert_eq!(p.set("7", "b"), Some("a".into()));
        p.set("8", "c");
        p.save(&path).unwrap();

        let back = Preferences::load(&path).unwrap();
        assert_eq!(back.get("7"), Some("b"));
        assert_eq!(back.len(), 2);
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"7": "b", "8": "c"}));
    }

    #[test]
    fn non_map_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        std::fs::write(&path, "[1]").unwrap();
        assert!(matches!(Preferences::load(&path), Err(PrefsError::Format(_))));
    }
}
