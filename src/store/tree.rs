//! Immutable, content-addressed tree objects with copy-on-write mutation and
//! ordered diffing (§3 Tree, §4.1).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{ConvertError, Result};
use crate::hash::ObjectHash;
use crate::store::blob::Blob;

/// Default regular-file mode used when a [`TreeEntry`] doesn't carry an
/// explicit `chmod` override.
pub const MODE_REGULAR: u32 = 0o100644;
pub const MODE_EXECUTABLE: u32 = 0o100755;
pub const MODE_SYMLINK: u32 = 0o120000;
pub const MODE_TREE: u32 = 0o040000;

/// Either side of a tree entry: a leaf blob or a nested directory.
#[derive(Debug, Clone)]
pub enum Obj {
    Blob(Arc<Blob>),
    Tree(Arc<Tree>),
}

impl Obj {
    pub fn hash(&self) -> ObjectHash {
        match self {
            Obj::Blob(b) => b.hash(),
            Obj::Tree(t) => t.hash(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Obj::Tree(_))
    }

    pub fn as_tree(&self) -> Option<&Arc<Tree>> {
        match self {
            Obj::Tree(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Arc<Blob>> {
        match self {
            Obj::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash() && self.is_dir() == other.is_dir()
    }
}
impl Eq for Obj {}

/// One named child of a [`Tree`].
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub name: String,
    pub object: Obj,
    pub mode: Option<u32>,
}

impl TreeEntry {
    /// The mode actually recorded in the tree hash / `update-index` line:
    /// the explicit override if any, otherwise the kind's default.
    pub fn effective_mode(&self) -> u32 {
        self.mode.unwrap_or(match &self.object {
            Obj::Blob(_) => MODE_REGULAR,
            Obj::Tree(_) => MODE_TREE,
        })
    }
}

/// A directory node. Entries are *not* guaranteed sorted until the tree has
/// been through [`crate::store::ObjectStore::finalize`] — `set`/`delete`
/// build drafts in whatever order they touch entries, and finalisation both
/// sorts and computes the structural hash, matching the "finalise children
/// first, then sort, then hash" contract.
#[derive(Debug, Clone)]
pub struct Tree {
    hash: ObjectHash,
    finalized: bool,
    entries: Vec<TreeEntry>,
    attrs: BTreeMap<String, Vec<u8>>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for Tree {}

fn split_first(path: &str) -> (&str, &str) {
    match path.split_once('/') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    }
}

impl Tree {
    pub fn empty() -> Tree {
        Tree { hash: ObjectHash::ZERO, finalized: false, entries: Vec::new(), attrs: BTreeMap::new() }
    }

    pub fn hash(&self) -> ObjectHash {
        self.hash
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn attrs(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.attrs
    }

    pub fn with_attrs(&self, attrs: BTreeMap<String, Vec<u8>>) -> Tree {
        Tree { hash: ObjectHash::ZERO, finalized: false, entries: self.entries.clone(), attrs }
    }

    fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Looks up `path`, descending through nested trees. Returns `None` when
    /// any component is missing.
    pub fn find_path(&self, path: &str) -> Option<&Obj> {
        if path.is_empty() {
            return None;
        }
        let (head, rest) = split_first(path);
        let entry = self.entry(head)?;
        if rest.is_empty() {
            Some(&entry.object)
        } else {
            entry.object.as_tree()?.find_path(rest)
        }
    }

    /// Copy-on-write insert/replace of `obj` at `path`, creating intermediate
    /// directories as needed. Unchanged sibling entries and subtrees are
    /// shared (cloned `Arc`s, not deep copies) with the original tree. If the
    /// existing leaf's hash already equals `obj`'s, `self` is returned
    /// unchanged (no new allocation, same as the original instance).
    pub fn set(&self, path: &str, obj: Obj, mode: Option<u32>) -> Tree {
        let (head, rest) = split_first(path);
        if rest.is_empty() {
            if let Some(existing) = self.entry(head) {
                if existing.object.hash() == obj.hash() && existing.object.is_dir() == obj.is_dir() {
                    return self.clone();
                }
            }
            let mut entries: Vec<TreeEntry> = self.entries.iter().filter(|e| e.name != head).cloned().collect();
            entries.push(TreeEntry { name: head.to_string(), object: obj, mode });
            return Tree { hash: ObjectHash::ZERO, finalized: false, entries, attrs: self.attrs.clone() };
        }

        let child = match self.entry(head) {
            Some(e) => match &e.object {
                Obj::Tree(t) => (**t).clone(),
                Obj::Blob(_) => Tree::empty(),
            },
            None => Tree::empty(),
        };
        let new_child = child.set(rest, obj, mode);
        let mut entries: Vec<TreeEntry> = self.entries.iter().filter(|e| e.name != head).cloned().collect();
        entries.push(TreeEntry { name: head.to_string(), object: Obj::Tree(Arc::new(new_child)), mode: None });
        Tree { hash: ObjectHash::ZERO, finalized: false, entries, attrs: self.attrs.clone() }
    }

    /// Copy-on-write removal of `path`. Returns `None` if the path didn't
    /// exist anywhere along its descent.
    pub fn delete(&self, path: &str) -> Option<Tree> {
        let (head, rest) = split_first(path);
        let existing = self.entry(head)?;
        if rest.is_empty() {
            let entries: Vec<TreeEntry> = self.entries.iter().filter(|e| e.name != head).cloned().collect();
            return Some(Tree { hash: ObjectHash::ZERO, finalized: false, entries, attrs: self.attrs.clone() });
        }
        let child = existing.object.as_tree()?;
        let new_child = child.delete(rest)?;
        let mut entries: Vec<TreeEntry> = self.entries.iter().filter(|e| e.name != head).cloned().collect();
        entries.push(TreeEntry { name: head.to_string(), object: Obj::Tree(Arc::new(new_child)), mode: None });
        Some(Tree { hash: ObjectHash::ZERO, finalized: false, entries, attrs: self.attrs.clone() })
    }

    /// Recomputes `entries` sorted by name and the structural hash over
    /// `TREE\n`, each entry's `ITEM: <name>\n` + child hash, and the sorted
    /// attribute lines. Does not recurse — callers finalise children first.
    pub(crate) fn seal(mut self) -> Tree {
        self.entries.sort_by(|a, b| a.name.cmp(&b.name));
        let mut chunks: Vec<Vec<u8>> = vec![b"TREE\n".to_vec()];
        for entry in &self.entries {
            chunks.push(format!("ITEM: {}\n", entry.name).into_bytes());
            chunks.push(entry.object.hash().to_data());
            chunks.push(entry.effective_mode().to_string().into_bytes());
        }
        for (key, value) in &self.attrs {
            chunks.push(format!("ATTR: {key}\n").into_bytes());
            chunks.push(value.clone());
        }
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        self.hash = ObjectHash::of_chunks(refs);
        self.finalized = true;
        self
    }

    /// One entry of a [`Tree::compare`] result.
    pub fn compare(&self, other: &Tree, expand_dir_contents: bool) -> Result<Vec<CompareEntry>> {
        if !self.finalized || !other.finalized {
            return Err(ConvertError::InvalidState("compare on non-finalized tree".into()));
        }
        let mut out = Vec::new();
        compare_into(&self.entries, &other.entries, "", expand_dir_contents, &mut out)?;
        Ok(out)
    }

    /// Counts identical/different/added/deleted leaves between `self` and
    /// `other`, recursing into every shared subtree regardless of
    /// `expand_dir_contents` — used for the rename/copy similarity heuristic
    /// (§4.4), not for commit diffs.
    pub fn difference_metrics(&self, other: &Tree) -> Result<DiffMetrics> {
        if !self.finalized || !other.finalized {
            return Err(ConvertError::InvalidState("difference_metrics on non-finalized tree".into()));
        }
        let mut metrics = DiffMetrics::default();
        accumulate_metrics(&self.entries, &other.entries, &mut metrics)?;
        Ok(metrics)
    }
}

#[derive(Debug, Clone)]
pub struct CompareEntry {
    pub path: String,
    pub old: Option<Obj>,
    pub new: Option<Obj>,
    pub old_mode: Option<u32>,
    pub new_mode: Option<u32>,
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn expand_leaves(obj: &Obj, mode: Option<u32>, prefix: &str, as_old: bool, out: &mut Vec<CompareEntry>) {
    match obj {
        Obj::Blob(_) => out.push(if as_old {
            CompareEntry { path: prefix.to_string(), old: Some(obj.clone()), new: None, old_mode: mode, new_mode: None }
        } else {
            CompareEntry { path: prefix.to_string(), old: None, new: Some(obj.clone()), old_mode: None, new_mode: mode }
        }),
        Obj::Tree(t) => {
            for entry in &t.entries {
                expand_leaves(&entry.object, entry.mode, &join(prefix, &entry.name), as_old, out);
            }
        }
    }
}

fn compare_into(
    a: &[TreeEntry],
    b: &[TreeEntry],
    prefix: &str,
    expand_dir_contents: bool,
    out: &mut Vec<CompareEntry>,
) -> Result<()> {
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        match a[i].name.cmp(&b[j].name) {
            std::cmp::Ordering::Less => {
                emit_removed(&a[i], prefix, expand_dir_contents, out);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                emit_added(&b[j], prefix, expand_dir_contents, out);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                let ea = &a[i];
                let eb = &b[j];
                let path = join(prefix, &ea.name);
                match (&ea.object, &eb.object) {
                    (Obj::Tree(ta), Obj::Tree(tb)) => {
                        if ta.hash() != tb.hash() {
                            compare_into(&ta.entries, &tb.entries, &path, expand_dir_contents, out)?;
                        }
                    }
                    (Obj::Blob(ba), Obj::Blob(bb)) => {
                        if ba.hash() != bb.hash() || ea.mode != eb.mode {
                            out.push(CompareEntry {
                                path,
                                old: Some(ea.object.clone()),
                                new: Some(eb.object.clone()),
                                old_mode: ea.mode,
                                new_mode: eb.mode,
                            });
                        }
                    }
                    _ => {
                        // directory/file collision on the same name: delete then add, never atomic
                        emit_removed(ea, prefix, expand_dir_contents, out);
                        emit_added(eb, prefix, expand_dir_contents, out);
                    }
                }
                i += 1;
                j += 1;
            }
        }
    }
    while i < a.len() {
        emit_removed(&a[i], prefix, expand_dir_contents, out);
        i += 1;
    }
    while j < b.len() {
        emit_added(&b[j], prefix, expand_dir_contents, out);
        j += 1;
    }
    Ok(())
}

fn emit_removed(entry: &TreeEntry, prefix: &str, expand_dir_contents: bool, out: &mut Vec<CompareEntry>) {
    let path = join(prefix, &entry.name);
    if entry.object.is_dir() && expand_dir_contents {
        expand_leaves(&entry.object, entry.mode, &path, true, out);
    } else {
        out.push(CompareEntry { path, old: Some(entry.object.clone()), new: None, old_mode: entry.mode, new_mode: None });
    }
}

fn emit_added(entry: &TreeEntry, prefix: &str, expand_dir_contents: bool, out: &mut Vec<CompareEntry>) {
    let path = join(prefix, &entry.name);
    if entry.object.is_dir() && expand_dir_contents {
        expand_leaves(&entry.object, entry.mode, &path, false, out);
    } else {
        out.push(CompareEntry { path, old: None, new: Some(entry.object.clone()), old_mode: None, new_mode: entry.mode });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffMetrics {
    pub identical: usize,
    pub different: usize,
    pub deleted: usize,
    pub added: usize,
}

impl DiffMetrics {
    /// Two trees count as "similar" when more leaves stayed the same or just
    /// changed content than were added/deleted outright — the heuristic
    /// behind copy-source-as-parent and rename detection (§4.4, §4.4 auto-log).
    pub fn is_similar(&self) -> bool {
        self.added + self.deleted < self.identical + self.different
    }
}

fn count_leaves(obj: &Obj, metrics: &mut DiffMetrics, added: bool) {
    match obj {
        Obj::Blob(_) => {
            if added {
                metrics.added += 1;
            } else {
                metrics.deleted += 1;
            }
        }
        Obj::Tree(t) => {
            for entry in &t.entries {
                count_leaves(&entry.object, metrics, added);
            }
        }
    }
}

fn accumulate_metrics(a: &[TreeEntry], b: &[TreeEntry], metrics: &mut DiffMetrics) -> Result<()> {
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        match a[i].name.cmp(&b[j].name) {
            std::cmp::Ordering::Less => {
                count_leaves(&a[i].object, metrics, false);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                count_leaves(&b[j].object, metrics, true);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                match (&a[i].object, &b[j].object) {
                    (Obj::Tree(ta), Obj::Tree(tb)) => {
                        if ta.hash() == tb.hash() {
                            let mut leaf_count = DiffMetrics::default();
                            count_leaves(&a[i].object, &mut leaf_count, true);
                            metrics.identical += leaf_count.added;
                        } else {
                            accumulate_metrics(&ta.entries, &tb.entries, metrics)?;
                        }
                    }
                    (Obj::Blob(ba), Obj::Blob(bb)) => {
                        if ba.hash() == bb.hash() {
                            metrics.identical += 1;
                        } else {
                            metrics.different += 1;
                        }
                    }
                    _ => {
                        count_leaves(&a[i].object, metrics, false);
                        count_leaves(&b[j].object, metrics, true);
                    }
                }
                i += 1;
                j += 1;
            }
        }
    }
    while i < a.len() {
        count_leaves(&a[i].object, metrics, false);
        i += 1;
    }
    while j < b.len() {
        count_leaves(&b[j].object, metrics, true);
        j += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;

    fn blob_obj(store: &mut ObjectStore, content: &[u8]) -> Obj {
        store.finalize_blob(Blob::new(content.to_vec(), BTreeMap::new()))
    }

    #[test]
    fn test_set_then_find_path() {
        let mut store = ObjectStore::new();
        let b = blob_obj(&mut store, b"x");
        let tree = Tree::empty().set("a/f", b, None);
        let found = tree.find_path("a/f").unwrap();
        assert_eq!(found.hash(), ObjectHash::of_bytes(b"x"));
    }

    #[test]
    fn test_set_same_hash_returns_self() {
        let mut store = ObjectStore::new();
        let b1 = blob_obj(&mut store, b"x");
        let b2 = blob_obj(&mut store, b"x");
        let tree = Tree::empty().set("f", b1, None);
        let tree2 = tree.set("f", b2, None);
        assert_eq!(tree.entries().len(), tree2.entries().len());
    }

    #[test]
    fn test_delete_missing_path_is_none() {
        let tree = Tree::empty();
        assert!(tree.delete("nope").is_none());
    }

    #[test]
    fn test_finalize_sorts_and_hashes() {
        let mut store = ObjectStore::new();
        let bz = blob_obj(&mut store, b"z");
        let ba = blob_obj(&mut store, b"a");
        let tree = Tree::empty().set("z", bz, None).set("a", ba, None);
        let Obj::Tree(finalized) = store.finalize(Obj::Tree(Arc::new(tree))) else { panic!() };
        let names: Vec<&str> = finalized.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "z"]);
        assert!(finalized.is_finalized());
    }

    #[test]
    fn test_compare_symmetry() {
        let mut store = ObjectStore::new();
        let a1 = blob_obj(&mut store, b"1");
        let a2 = blob_obj(&mut store, b"2");
        let left = Tree::empty().set("f", a1, None);
        let right = Tree::empty().set("f", a2, None);
        let Obj::Tree(left) = store.finalize(Obj::Tree(Arc::new(left))) else { panic!() };
        let Obj::Tree(right) = store.finalize(Obj::Tree(Arc::new(right))) else { panic!() };
        let fwd = left.compare(&right, true).unwrap();
        let bwd = right.compare(&left, true).unwrap();
        assert_eq!(fwd.len(), bwd.len());
        assert_eq!(fwd[0].old.as_ref().unwrap().hash(), bwd[0].new.as_ref().unwrap().hash());
    }

    #[test]
    fn test_dir_file_collision_is_delete_then_add() {
        let mut store = ObjectStore::new();
        let inner = blob_obj(&mut store, b"inner");
        let left = Tree::empty().set("p/inner", inner, None);
        let file = blob_obj(&mut store, b"file");
        let right = Tree::empty().set("p", file, None);
        let Obj::Tree(left) = store.finalize(Obj::Tree(Arc::new(left))) else { panic!() };
        let Obj::Tree(right) = store.finalize(Obj::Tree(Arc::new(right))) else { panic!() };
        let diff = left.compare(&right, true).unwrap();
        assert_eq!(diff.len(), 2);
        assert!(diff[0].new.is_none());
        assert!(diff[1].old.is_none());
    }

    #[test]
    fn test_compare_on_non_finalized_fails() {
        let draft = Tree::empty();
        assert!(draft.compare(&draft, true).is_err());
    }
}
