//! Object hashing.
//!
//! The content model (§3) draws a hard line between a blob's raw SHA-1 of
//! its bytes (its structural identity in the object store) and the
//! `git_sha1` produced later by `hash-object`, which also depends on
//! formatting and `.gitattributes`. Only the former lives here; the latter
//! is just an `ObjectHash` returned by the `GitDriver`.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::Digest;

/// A raw 20-byte SHA-1 digest, used both as the structural hash of
/// [`crate::store`] objects and as the hex object id Git assigns blobs/trees/commits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash([u8; 20]);

impl std::fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHash({self})")
    }
}

impl Default for ObjectHash {
    fn default() -> Self {
        ObjectHash([0u8; 20])
    }
}

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(format!("invalid hash length: {}", s.len()));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut h = [0u8; 20];
        h.copy_from_slice(&bytes);
        Ok(ObjectHash(h))
    }
}

impl ObjectHash {
    pub const ZERO: ObjectHash = ObjectHash([0u8; 20]);

    /// Hash of an empty byte slice (the canonical "nothing here" sentinel used
    /// by `RefnameRemapping`/ref batches for deletes).
    pub fn zero_str() -> String {
        "0".repeat(40)
    }

    /// Raw SHA-1 of the content bytes, not the Git "type len\0data" envelope.
    pub fn of_bytes(data: &[u8]) -> ObjectHash {
        let digest = sha1::Sha1::digest(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(digest.as_ref());
        ObjectHash(bytes)
    }

    /// SHA-1 over an arbitrary sequence of byte chunks, used to build composite
    /// keys (e.g. the blob-hash memoisation key in §4.4, or the `.gitattributes`
    /// environment key in §4.4) without allocating one big buffer.
    pub fn of_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> ObjectHash {
        let mut hasher = sha1::Sha1::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(digest.as_ref());
        ObjectHash(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<ObjectHash, String> {
        if bytes.len() != 20 {
            return Err(format!("invalid byte length: {}", bytes.len()));
        }
        let mut h = [0u8; 20];
        h.copy_from_slice(bytes);
        Ok(ObjectHash(h))
    }

    pub fn from_stream(data: &mut impl io::Read) -> io::Result<ObjectHash> {
        let mut h = [0u8; 20];
        data.read_exact(&mut h)?;
        Ok(ObjectHash(h))
    }

    pub fn to_data(self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_bytes_matches_known_sha1() {
        let h = ObjectHash::of_bytes(b"Hello, world!");
        assert_eq!(h.to_string(), "943a702d06f34599aee1f8da8ef9f7296031d699");
    }

    #[test]
    fn test_roundtrip_str() {
        let h = ObjectHash::of_bytes(b"abc");
        let s = h.to_string();
        let parsed = ObjectHash::from_str(&s).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_of_chunks_equals_concatenated() {
        let a = ObjectHash::of_bytes(b"helloworld");
        let b = ObjectHash::of_chunks([b"hello".as_slice(), b"world".as_slice()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_is_default() {
        assert_eq!(ObjectHash::default(), ObjectHash::ZERO);
        assert!(ObjectHash::ZERO.is_zero());
    }
}
