//! Content-addressed object store: blob/tree arena with deduplicated
//! finalisation (§4.1 ObjectStore).
//!
//! Owned and mutated on the main scheduler thread only (§5) — a plain
//! `HashMap`, not `dashmap`, is the right tool here.

pub mod blob;
pub mod tree;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::hash::ObjectHash;
pub use blob::Blob;
pub use tree::{CompareEntry, DiffMetrics, Obj, Tree, TreeEntry, MODE_EXECUTABLE, MODE_REGULAR, MODE_SYMLINK, MODE_TREE};

/// Arena owning every blob/tree ever finalised, keyed by structural hash.
#[derive(Debug, Default)]
pub struct ObjectStore {
    blobs: HashMap<ObjectHash, Arc<Blob>>,
    trees: HashMap<ObjectHash, Arc<Tree>>,
}

impl ObjectStore {
    pub fn new() -> ObjectStore {
        ObjectStore::default()
    }

    /// Builds a non-finalised blob; since a blob's hash is a pure function
    /// of its bytes, this is equivalent to `finalize_blob` except it doesn't
    /// touch the dedup map — useful for callers that only need the hash.
    pub fn make_blob(&self, data: impl Into<Arc<[u8]>>, attrs: std::collections::BTreeMap<String, Vec<u8>>) -> Blob {
        Blob::new(data, attrs)
    }

    /// Dedups `blob` into the arena, returning the canonical shared instance.
    pub fn finalize_blob(&mut self, blob: Blob) -> Obj {
        if let Some(existing) = self.blobs.get(&blob.hash()) {
            return Obj::Blob(Arc::clone(existing));
        }
        let hash = blob.hash();
        let arc = Arc::new(blob);
        self.blobs.insert(hash, Arc::clone(&arc));
        Obj::Blob(arc)
    }

    /// Finalises `obj`, recursing into tree children first (so a tree's hash
    /// is always computed from already-canonical child hashes), then
    /// dedups. Returns the existing instance on hash collision.
    pub fn finalize(&mut self, obj: Obj) -> Obj {
        match obj {
            Obj::Blob(b) => self.finalize_blob((*b).clone()),
            Obj::Tree(t) => {
                if t.is_finalized() {
                    if let Some(existing) = self.trees.get(&t.hash()) {
                        return Obj::Tree(Arc::clone(existing));
                    }
                    self.trees.insert(t.hash(), Arc::clone(&t));
                    return Obj::Tree(t);
                }

                let mut sealed = (*t).clone();
                let finalized_entries: Vec<TreeEntry> = sealed
                    .entries()
                    .iter()
                    .map(|e| TreeEntry {
                        name: e.name.clone(),
                        object: self.finalize(e.object.clone()),
                        mode: e.mode,
                    })
                    .collect();
                sealed = replace_entries(sealed, finalized_entries).seal();

                if let Some(existing) = self.trees.get(&sealed.hash()) {
                    debug!(hash = %sealed.hash(), "tree finalise: deduplicated");
                    return Obj::Tree(Arc::clone(existing));
                }
                let hash = sealed.hash();
                let arc = Arc::new(sealed);
                debug!(%hash, "tree finalise: new instance");
                self.trees.insert(hash, Arc::clone(&arc));
                Obj::Tree(arc)
            }
        }
    }

    pub fn get_tree(&self, hash: ObjectHash) -> Option<&Arc<Tree>> {
        self.trees.get(&hash)
    }

    pub fn get_blob(&self, hash: ObjectHash) -> Option<&Arc<Blob>> {
        self.blobs.get(&hash)
    }
}

/// `Tree`'s fields are private to the module; this helper rebuilds a draft
/// with finalised children before sealing, without exposing a public setter
/// that would let callers bypass `seal`'s hash computation.
fn replace_entries(tree: Tree, entries: Vec<TreeEntry>) -> Tree {
    let attrs = tree.attrs().clone();
    let mut draft = Tree::empty().with_attrs(attrs);
    for entry in entries {
        draft = draft.set(&entry.name, entry.object, entry.mode);
    }
    draft
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_idempotent_blob_finalisation() {
        let mut store = ObjectStore::new();
        let b1 = store.finalize_blob(Blob::new(b"x".to_vec(), BTreeMap::new()));
        let b2 = store.finalize_blob(Blob::new(b"x".to_vec(), BTreeMap::new()));
        assert_eq!(b1.hash(), b2.hash());
        if let (Obj::Blob(a), Obj::Blob(b)) = (&b1, &b2) {
            assert!(Arc::ptr_eq(a, b));
        } else {
            panic!("expected blobs");
        }
    }

    #[test]
    fn test_idempotent_tree_finalisation_shares_instance() {
        let mut store = ObjectStore::new();
        let blob = store.finalize_blob(Blob::new(b"x".to_vec(), BTreeMap::new()));
        let tree = Tree::empty().set("f", blob, None);
        let first = store.finalize(Obj::Tree(Arc::new(tree.clone())));
        let second = store.finalize(Obj::Tree(Arc::new(tree)));
        if let (Obj::Tree(a), Obj::Tree(b)) = (&first, &second) {
            assert!(Arc::ptr_eq(a, b));
        } else {
            panic!("expected trees");
        }
    }

    #[test]
    fn test_distinct_content_hashes_never_collide() {
        let mut store = ObjectStore::new();
        let b1 = store.finalize_blob(Blob::new(b"x".to_vec(), BTreeMap::new()));
        let t1 = store.finalize(Obj::Tree(Arc::new(Tree::empty().set("f", b1, None))));

        let b2 = store.finalize_blob(Blob::new(b"y".to_vec(), BTreeMap::new()));
        let t2 = store.finalize(Obj::Tree(Arc::new(Tree::empty().set("f", b2, None))));

        assert_ne!(t1.hash(), t2.hash());
    }
}
