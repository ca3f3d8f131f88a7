//! Author name → `Name <email>` mapping file (§6.4 Authors map file).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ConvertError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorProps {
    pub name: String,
    pub email: String,
}

impl std::fmt::Display for AuthorProps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAuthorEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Email")]
    email: String,
}

/// Loaded from (and saved back to) a JSON object `{ "username": {"Name": ..., "Email": ...} }`.
#[derive(Debug, Clone, Default)]
pub struct AuthorMap {
    entries: BTreeMap<String, AuthorProps>,
}

impl AuthorMap {
    pub fn load(path: &Path) -> Result<AuthorMap> {
        if !path.exists() {
            return Ok(AuthorMap::default());
        }
        let text = fs::read_to_string(path)?;
        let raw: BTreeMap<String, RawAuthorEntry> =
            serde_json::from_str(&text).map_err(|e| ConvertError::InvalidConfig(format!("author map {}: {e}", path.display())))?;
        let entries = raw.into_iter().map(|(k, v)| (k, AuthorProps { name: v.name, email: v.email })).collect();
        Ok(AuthorMap { entries })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw: BTreeMap<&str, RawAuthorEntry> = self
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), RawAuthorEntry { name: v.name.clone(), email: v.email.clone() }))
            .collect();
        let text = serde_json::to_string_pretty(&raw).map_err(|e| ConvertError::InvalidConfig(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Looks up `username`; falls back to `username <username@localhost>` when unmapped
    /// (`git commit-tree` refuses a commit with no author at all).
    pub fn map_author(&self, username: &str) -> AuthorProps {
        self.entries.get(username).cloned().unwrap_or_else(|| AuthorProps {
            name: username.to_string(),
            email: format!("{username}@localhost"),
        })
    }

    pub fn insert(&mut self, username: impl Into<String>, props: AuthorProps) {
        self.entries.insert(username.into(), props);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_author_falls_back_to_localhost() {
        let map = AuthorMap::default();
        let props = map.map_author("alex");
        assert_eq!(props.email, "alex@localhost");
    }

    #[test]
    fn test_save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authors.json");
        let mut map = AuthorMap::default();
        map.insert("alex", AuthorProps { name: "Alex Conrad".to_string(), email: "alex@example.com".to_string() });
        map.save(&path).unwrap();

        let loaded = AuthorMap::load(&path).unwrap();
        assert_eq!(loaded.map_author("alex").name, "Alex Conrad");
    }

    #[test]
    fn test_load_missing_file_is_empty_map() {
        let map = AuthorMap::load(Path::new("/nonexistent/authors.json")).unwrap();
        assert_eq!(map.map_author("x").email, "x@localhost");
    }
}
