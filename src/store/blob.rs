//! Immutable byte-content objects (§3 Blob).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::hash::ObjectHash;

/// Immutable byte content plus a set of Git attribute overrides picked up
/// from the `.gitattributes` rules in force at the blob's path. `hash` is
/// the raw SHA-1 of `data` alone — structural identity, not the `git_sha1`
/// `hash-object` eventually assigns once formatting/attributes are applied.
#[derive(Debug, Clone)]
pub struct Blob {
    hash: ObjectHash,
    data: Arc<[u8]>,
    attrs: BTreeMap<String, Vec<u8>>,
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for Blob {}

impl Blob {
    /// Builds a blob from raw content; the hash is a pure function of
    /// `data`, so unlike [`crate::store::Tree`] a blob never needs a
    /// separate finalisation pass to become hash-stable.
    pub fn new(data: impl Into<Arc<[u8]>>, attrs: BTreeMap<String, Vec<u8>>) -> Blob {
        let data = data.into();
        let hash = ObjectHash::of_bytes(&data);
        Blob { hash, data, attrs }
    }

    pub fn hash(&self) -> ObjectHash {
        self.hash
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn attrs(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.attrs
    }

    pub fn with_attrs(&self, attrs: BTreeMap<String, Vec<u8>>) -> Blob {
        Blob { hash: self.hash, data: Arc::clone(&self.data), attrs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_pure_function_of_bytes() {
        let a = Blob::new(b"hello".to_vec(), BTreeMap::new());
        let b = Blob::new(b"hello".to_vec(), BTreeMap::new());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_attrs_do_not_affect_structural_hash() {
        let mut attrs = BTreeMap::new();
        attrs.insert("text".to_string(), b"auto".to_vec());
        let a = Blob::new(b"hello".to_vec(), BTreeMap::new());
        let b = Blob::new(b"hello".to_vec(), attrs);
        assert_eq!(a.hash(), b.hash());
    }
}
