//! Persisted blob-hash memoisation map (§4.4 Blob hash memoisation, §6.4 SHA-1 map file).
//!
//! Keyed by a composite hash over raw content SHA-1, `.gitattributes`
//! environment, and optional formatter settings/tag, so a cache hit skips
//! both the formatter pass and the `git hash-object` subprocess entirely.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::errors::Result;
use crate::hash::ObjectHash;

/// Composite key inputs for one candidate blob write (§4.4).
pub struct CacheKeyInput<'a> {
    pub raw_sha1: ObjectHash,
    pub gitattributes_sha1: ObjectHash,
    pub formatter_sha1: Option<ObjectHash>,
    pub formatter_tag: Option<&'a str>,
    pub path: &'a str,
}

pub fn cache_key(input: &CacheKeyInput) -> ObjectHash {
    let mut chunks: Vec<Vec<u8>> = vec![input.raw_sha1.to_data(), input.gitattributes_sha1.to_data()];
    if let Some(h) = input.formatter_sha1 {
        chunks.push(h.to_data());
    }
    if let Some(tag) = input.formatter_tag {
        chunks.push(tag.as_bytes().to_vec());
    }
    chunks.push(input.path.as_bytes().to_vec());
    let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
    ObjectHash::of_chunks(refs)
}

/// A text file of `<key-sha1> <git-sha1>` lines, loaded once and rewritten
/// at the end of a run. No concurrent-writer contract (§6.4) — all writes
/// come from main-thread completion handlers (§5).
#[derive(Debug, Default)]
pub struct Sha1Cache {
    map: HashMap<ObjectHash, ObjectHash>,
    dirty: bool,
}

impl Sha1Cache {
    pub fn load(path: &Path) -> Result<Sha1Cache> {
        if !path.exists() {
            return Ok(Sha1Cache::default());
        }
        let text = fs::read_to_string(path)?;
        let mut map = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once(' ') {
                if let (Ok(key), Ok(value)) = (key.parse(), value.parse()) {
                    map.insert(key, value);
                }
            }
        }
        Ok(Sha1Cache { map, dirty: false })
    }

    pub fn get(&self, key: ObjectHash) -> Option<ObjectHash> {
        self.map.get(&key).copied()
    }

    pub fn insert(&mut self, key: ObjectHash, git_sha1: ObjectHash) {
        self.map.insert(key, git_sha1);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = fs::File::create(path)?;
        let mut keys: Vec<&ObjectHash> = self.map.keys().collect();
        keys.sort();
        for key in keys {
            writeln!(file, "{key} {}", self.map[key])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_sensitive_to_path() {
        let raw = ObjectHash::of_bytes(b"x");
        let attrs = ObjectHash::of_bytes(b"");
        let k1 = cache_key(&CacheKeyInput { raw_sha1: raw, gitattributes_sha1: attrs, formatter_sha1: None, formatter_tag: None, path: "a.c" });
        let k2 = cache_key(&CacheKeyInput { raw_sha1: raw, gitattributes_sha1: attrs, formatter_sha1: None, formatter_tag: None, path: "b.c" });
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sha1cache.txt");
        let mut cache = Sha1Cache::default();
        let key = ObjectHash::of_bytes(b"k");
        let value = ObjectHash::of_bytes(b"v");
        cache.insert(key, value);
        cache.save(&path).unwrap();

        let loaded = Sha1Cache::load(&path).unwrap();
        assert_eq!(loaded.get(key), Some(value));
    }

    #[test]
    fn test_missing_cache_file_loads_empty() {
        let cache = Sha1Cache::load(Path::new("/nonexistent/sha1cache.txt")).unwrap();
        assert!(cache.get(ObjectHash::ZERO).is_none());
        assert!(!cache.is_dirty());
    }
}
