//! Applies an abstract revision stream to the [`crate::store::ObjectStore`],
//! producing one materialised root tree per revision (§4.2 HistoryReader).

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::errors::{ConvertError, Result};
use crate::logsink::LogSink;
use crate::store::{Obj, ObjectStore};

/// Which revision a `copyfrom_rev` (or any other cross-revision reference)
/// names — VSS and other sources mix sequential ordinals with opaque ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RevRef {
    Ordinal(u64),
    Id(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Dir,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Change,
    Delete,
    Replace,
    Rename,
    Hide,
    Copy,
    Merge,
    Label,
    Extract,
}

/// One entry of an incoming revision (§6.1).
#[derive(Debug, Clone)]
pub struct RevisionNode {
    pub action: Action,
    pub kind: Kind,
    pub path: String,
    pub copyfrom_path: Option<String>,
    pub copyfrom_rev: Option<RevRef>,
    pub text_content: Option<Vec<u8>>,
    pub label: Option<String>,
}

impl RevisionNode {
    fn describe_source(&self) -> String {
        match (&self.copyfrom_path, &self.copyfrom_rev) {
            (Some(path), Some(RevRef::Ordinal(n))) => format!(", copy from: {path};r{n}"),
            (Some(path), Some(RevRef::Id(id))) => format!(", copy from: {path};{id}"),
            _ => String::new(),
        }
    }
}

/// One incoming revision, as produced by the (out-of-scope) revision reader.
#[derive(Debug, Clone)]
pub struct RevisionInput {
    pub rev_ordinal: u64,
    pub rev_id: String,
    pub author: String,
    pub datetime: DateTime<Utc>,
    pub log: String,
    pub nodes: Vec<RevisionNode>,
}

/// The materialised state after applying a revision's nodes: the full
/// project tree at that revision, plus a back-link for ancestry walks.
pub struct HistoryRevision {
    pub rev_ordinal: u64,
    pub rev_id: String,
    pub author: String,
    pub datetime: DateTime<Utc>,
    pub log: String,
    pub tree: Obj,
    pub prev_rev: Option<Arc<HistoryRevision>>,
    /// Paths marked by a `hide` node, inherited from `prev_rev` and extended
    /// by this revision's own hides. Hidden entries stay addressable via
    /// `tree.find_path` but are filtered out of diffs/commits downstream.
    pub hidden_paths: BTreeSet<String>,
}

fn kind_label(kind: Kind) -> &'static str {
    match kind {
        Kind::File => "file",
        Kind::Dir => "dir",
        Kind::None => "none",
    }
}

fn action_label(action: Action) -> &'static str {
    match action {
        Action::Add => "add",
        Action::Change => "change",
        Action::Delete => "delete",
        Action::Replace => "replace",
        Action::Rename => "rename",
        Action::Hide => "hide",
        Action::Copy => "copy",
        Action::Merge => "merge",
        Action::Label => "label",
        Action::Extract => "extract",
    }
}

/// Builds per-revision tree snapshots and indexes them for copy-source
/// resolution by either ordinal or alternate revision id.
pub struct HistoryReader {
    revisions: Vec<Arc<HistoryRevision>>,
    revision_by_id: HashMap<String, Arc<HistoryRevision>>,
    revision_by_ordinal: HashMap<u64, Arc<HistoryRevision>>,
    /// Destination root for `extract` nodes (§4.2); `None` means extract
    /// requests are logged and skipped, since they have nowhere to write.
    extract_root: Option<PathBuf>,
    empty_tree: Obj,
}

impl HistoryReader {
    pub fn new(store: &mut ObjectStore, extract_root: Option<PathBuf>) -> HistoryReader {
        let empty_tree = store.finalize(Obj::Tree(Arc::new(crate::store::Tree::empty())));
        HistoryReader {
            revisions: Vec::new(),
            revision_by_id: HashMap::new(),
            revision_by_ordinal: HashMap::new(),
            extract_root,
            empty_tree,
        }
    }

    pub fn head(&self) -> Option<&Arc<HistoryRevision>> {
        self.revisions.last()
    }

    fn head_tree(&self) -> Obj {
        self.head().map(|h| h.tree.clone()).unwrap_or_else(|| self.empty_tree.clone())
    }

    pub fn get_revision(&self, reference: &RevRef) -> Result<&Arc<HistoryRevision>> {
        match reference {
            RevRef::Ordinal(n) => self
                .revision_by_ordinal
                .get(n)
                .ok_or_else(|| ConvertError::ParseError(format!("source revision {n} out of range"))),
            RevRef::Id(id) => self
                .revision_by_id
                .get(id)
                .ok_or_else(|| ConvertError::ParseError(format!("source revision id \"{id}\" not found"))),
        }
    }

    /// Registers `ordinal`/`id` as additional names for the current head
    /// revision, so a later `copyfrom_rev` referencing a revision merged away
    /// by revision combining (§4.5) still resolves to its surviving replacement.
    pub fn alias_revision(&mut self, ordinal: u64, id: String) {
        if let Some(head) = self.head().cloned() {
            self.revision_by_ordinal.insert(ordinal, Arc::clone(&head));
            self.revision_by_id.insert(id, head);
        }
    }

    /// Applies every node of `input` against the previous head tree and
    /// finalises the result, recording and returning the new revision.
    pub fn apply_revision(
        &mut self,
        store: &mut ObjectStore,
        log: &dyn LogSink,
        input: RevisionInput,
    ) -> Result<Arc<HistoryRevision>> {
        let mut hidden_paths = self.head().map(|h| h.hidden_paths.clone()).unwrap_or_default();
        let mut tree = self.head_tree();

        for node in &input.nodes {
            tree = self
                .apply_node(store, log, input.rev_ordinal, node, tree, &mut hidden_paths)
                .map_err(|e| {
                    let node_err = e.with_node(kind_label(node.kind), node.path.clone(), action_label(node.action));
                    ConvertError::ParseError(format!("{node_err}{}", node.describe_source()))
                })?;
        }

        let tree = store.finalize(tree);
        let revision = Arc::new(HistoryRevision {
            rev_ordinal: input.rev_ordinal,
            rev_id: input.rev_id.clone(),
            author: input.author,
            datetime: input.datetime,
            log: input.log,
            tree,
            prev_rev: self.head().cloned(),
            hidden_paths,
        });

        self.revisions.push(Arc::clone(&revision));
        self.revision_by_id.insert(input.rev_id, Arc::clone(&revision));
        self.revision_by_ordinal.insert(revision.rev_ordinal, Arc::clone(&revision));
        trace!(rev = revision.rev_ordinal, hash = %revision.tree.hash(), "revision applied");
        Ok(revision)
    }

    fn apply_node(
        &self,
        store: &mut ObjectStore,
        log: &dyn LogSink,
        rev_ordinal: u64,
        node: &RevisionNode,
        base_tree: Obj,
        hidden_paths: &mut BTreeSet<String>,
    ) -> Result<Obj> {
        match node.action {
            Action::Replace => {
                let deleted = self.tree_delete(&base_tree, &node.path)?;
                let add_node = RevisionNode { action: Action::Add, ..node.clone() };
                self.apply_node(store, log, rev_ordinal, &add_node, deleted, hidden_paths)
            }
            Action::Rename => {
                let copyfrom_path = node
                    .copyfrom_path
                    .clone()
                    .unwrap_or_else(|| node.path.clone());
                let add_node = RevisionNode {
                    action: Action::Add,
                    copyfrom_path: Some(copyfrom_path.clone()),
                    copyfrom_rev: node.copyfrom_rev.clone().or(Some(RevRef::Ordinal(rev_ordinal))),
                    ..node.clone()
                };
                let added = self.apply_node(store, log, rev_ordinal, &add_node, base_tree, hidden_paths)?;
                self.tree_delete(&added, &copyfrom_path)
            }
            Action::Merge | Action::Label => Ok(base_tree),
            Action::Hide => {
                hidden_paths.insert(node.path.clone());
                Ok(base_tree)
            }
            Action::Extract => {
                self.extract_node(log, rev_ordinal, node, &base_tree)?;
                Ok(base_tree)
            }
            Action::Delete => self.tree_delete(&base_tree, &node.path),
            Action::Add | Action::Change | Action::Copy => match node.kind {
                Kind::Dir => self.apply_dir_node(store, log, node, base_tree),
                Kind::File => self.apply_file_node(store, log, node, base_tree),
                Kind::None => Err(ConvertError::ParseError(format!(
                    "node with no kind only supports delete, got {:?}",
                    node.action
                ))),
            },
        }
    }

    fn tree_delete(&self, base_tree: &Obj, path: &str) -> Result<Obj> {
        let tree = base_tree.as_tree().ok_or_else(|| ConvertError::WrongKind {
            path: path.to_string(),
            expected: "dir",
            found: "file",
        })?;
        tree.delete(path)
            .map(|t| Obj::Tree(Arc::new(t)))
            .ok_or_else(|| ConvertError::PathNotFound(path.to_string()))
    }

    fn apply_dir_node(&self, store: &mut ObjectStore, _log: &dyn LogSink, node: &RevisionNode, base_tree: Obj) -> Result<Obj> {
        let tree = base_tree.as_tree().ok_or_else(|| ConvertError::WrongKind {
            path: node.path.clone(),
            expected: "dir",
            found: "file",
        })?;
        let existing = tree.find_path(&node.path);

        match node.action {
            Action::Add | Action::Copy => {
                if existing.is_some() {
                    return Err(ConvertError::PathAlreadyExists(node.path.clone()));
                }
            }
            Action::Change => {
                match existing {
                    None => return Err(ConvertError::PathNotFound(node.path.clone())),
                    Some(obj) if !obj.is_dir() => {
                        return Err(ConvertError::WrongKind { path: node.path.clone(), expected: "dir", found: "file" });
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        let subtree = if node.action == Action::Change {
            // no-op placeholder: directory "change" with no copy source leaves contents untouched
            return Ok(base_tree);
        } else if let (Some(copyfrom_path), Some(copyfrom_rev)) = (&node.copyfrom_path, &node.copyfrom_rev) {
            let source_rev = self.get_revision(copyfrom_rev)?;
            let source = source_rev.tree.as_tree().and_then(|t| t.find_path(copyfrom_path));
            match source {
                Some(obj) if obj.is_dir() => store.finalize(obj.clone()),
                Some(_) => {
                    return Err(ConvertError::WrongKind { path: copyfrom_path.clone(), expected: "dir", found: "file" });
                }
                None => return Err(ConvertError::CopySourceNotFound(copyfrom_path.clone())),
            }
        } else {
            store.finalize(Obj::Tree(Arc::new(crate::store::Tree::empty())))
        };

        Ok(Obj::Tree(Arc::new(tree.set(&node.path, subtree, None))))
    }

    fn apply_file_node(&self, store: &mut ObjectStore, log: &dyn LogSink, node: &RevisionNode, base_tree: Obj) -> Result<Obj> {
        let tree = base_tree.as_tree().ok_or_else(|| ConvertError::WrongKind {
            path: node.path.clone(),
            expected: "file",
            found: "dir",
        })?;
        let existing = tree.find_path(&node.path);

        match node.action {
            Action::Add | Action::Copy => {
                if existing.is_some() {
                    return Err(ConvertError::PathAlreadyExists(node.path.clone()));
                }
            }
            _ => match existing {
                None => return Err(ConvertError::PathNotFound(node.path.clone())),
                Some(obj) if obj.is_dir() => {
                    return Err(ConvertError::WrongKind { path: node.path.clone(), expected: "file", found: "dir" });
                }
                _ => {}
            },
        }

        let mut source_file: Option<Obj> = None;
        if let (Some(copyfrom_path), Some(copyfrom_rev)) = (&node.copyfrom_path, &node.copyfrom_rev) {
            let source_rev = self.get_revision(copyfrom_rev)?;
            match source_rev.tree.as_tree().and_then(|t| t.find_path(copyfrom_path)) {
                Some(obj) if obj.is_dir() => {
                    return Err(ConvertError::WrongKind { path: copyfrom_path.clone(), expected: "file", found: "dir" });
                }
                Some(obj) => source_file = Some(store.finalize(obj.clone())),
                None if node.text_content.is_some() => {
                    log.warn(
                        source_rev.rev_ordinal,
                        &format!("file copy source \"{copyfrom_path}\" not found in rev {}; using inline content", source_rev.rev_id),
                    );
                }
                None => return Err(ConvertError::CopySourceNotFound(copyfrom_path.clone())),
            }
        }

        let blob_obj = if let Some(data) = &node.text_content {
            store.finalize_blob(store.make_blob(data.clone(), std::collections::BTreeMap::new()))
        } else if let Some(source) = source_file {
            source
        } else {
            return Err(ConvertError::ParseError(format!("file node at \"{}\" has neither content nor copy source", node.path)));
        };

        Ok(Obj::Tree(Arc::new(tree.set(&node.path, blob_obj, None))))
    }

    /// Writes the blob currently at `node.path` out to `extract_root`,
    /// mirroring the tree path underneath it (§4.2 `extract`, no tree change).
    fn extract_node(&self, log: &dyn LogSink, rev_ordinal: u64, node: &RevisionNode, base_tree: &Obj) -> Result<()> {
        let Some(root) = &self.extract_root else {
            log.warn(rev_ordinal, &format!("extract requested for \"{}\" but no extract root is configured; skipped", node.path));
            return Ok(());
        };
        let blob = base_tree
            .as_tree()
            .and_then(|t| t.find_path(&node.path))
            .and_then(|o| o.as_blob())
            .ok_or_else(|| ConvertError::PathNotFound(node.path.clone()))?;
        let dest = root.join(&node.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, blob.data())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsink::test_support::VecLogSink;

    fn node(action: Action, kind: Kind, path: &str, content: Option<&[u8]>) -> RevisionNode {
        RevisionNode {
            action,
            kind,
            path: path.to_string(),
            copyfrom_path: None,
            copyfrom_rev: None,
            text_content: content.map(|c| c.to_vec()),
            label: None,
        }
    }

    fn input(rev_ordinal: u64, nodes: Vec<RevisionNode>) -> RevisionInput {
        RevisionInput {
            rev_ordinal,
            rev_id: rev_ordinal.to_string(),
            author: "alex".to_string(),
            datetime: Utc::now(),
            log: String::new(),
            nodes,
        }
    }

    #[test]
    fn test_add_change_delete_sequence() {
        let mut store = ObjectStore::new();
        let mut reader = HistoryReader::new(&mut store, None);
        let log = VecLogSink::default();

        let r1 = reader.apply_revision(&mut store, &log, input(0, vec![node(Action::Add, Kind::File, "a/f", Some(b"x"))])).unwrap();
        assert_eq!(r1.tree.as_tree().unwrap().find_path("a/f").unwrap().as_blob().unwrap().data(), b"x");

        let r2 = reader.apply_revision(&mut store, &log, input(1, vec![node(Action::Change, Kind::File, "a/f", Some(b"xy"))])).unwrap();
        assert_eq!(r2.tree.as_tree().unwrap().find_path("a/f").unwrap().as_blob().unwrap().data(), b"xy");

        let r3 = reader.apply_revision(&mut store, &log, input(2, vec![node(Action::Delete, Kind::File, "a/f", None)])).unwrap();
        assert!(r3.tree.as_tree().unwrap().find_path("a/f").is_none());
    }

    #[test]
    fn test_add_existing_file_fails() {
        let mut store = ObjectStore::new();
        let mut reader = HistoryReader::new(&mut store, None);
        let log = VecLogSink::default();
        reader.apply_revision(&mut store, &log, input(0, vec![node(Action::Add, Kind::File, "f", Some(b"x"))])).unwrap();
        let err = reader.apply_revision(&mut store, &log, input(1, vec![node(Action::Add, Kind::File, "f", Some(b"y"))]));
        assert!(err.is_err());
    }

    #[test]
    fn test_copy_directory_across_revisions() {
        let mut store = ObjectStore::new();
        let mut reader = HistoryReader::new(&mut store, None);
        let log = VecLogSink::default();
        reader
            .apply_revision(&mut store, &log, input(0, vec![node(Action::Add, Kind::File, "trunk/a", Some(b"x"))]))
            .unwrap();

        let mut copy_node = node(Action::Add, Kind::Dir, "branches/b", None);
        copy_node.copyfrom_path = Some("trunk".to_string());
        copy_node.copyfrom_rev = Some(RevRef::Ordinal(0));
        let r2 = reader.apply_revision(&mut store, &log, input(1, vec![copy_node])).unwrap();

        let copied = r2.tree.as_tree().unwrap().find_path("branches/b/a").unwrap();
        assert_eq!(copied.as_blob().unwrap().data(), b"x");
    }

    #[test]
    fn test_missing_copy_source_without_inline_fails() {
        let mut store = ObjectStore::new();
        let mut reader = HistoryReader::new(&mut store, None);
        let log = VecLogSink::default();
        reader.apply_revision(&mut store, &log, input(0, vec![node(Action::Add, Kind::File, "a", Some(b"x"))])).unwrap();

        let mut copy_node = node(Action::Add, Kind::File, "b", None);
        copy_node.copyfrom_path = Some("missing".to_string());
        copy_node.copyfrom_rev = Some(RevRef::Ordinal(0));
        let result = reader.apply_revision(&mut store, &log, input(1, vec![copy_node]));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_copy_source_with_inline_warns_and_falls_back() {
        let mut store = ObjectStore::new();
        let mut reader = HistoryReader::new(&mut store, None);
        let log = VecLogSink::default();
        reader.apply_revision(&mut store, &log, input(0, vec![node(Action::Add, Kind::File, "a", Some(b"x"))])).unwrap();

        let mut copy_node = node(Action::Add, Kind::File, "b", Some(b"fallback"));
        copy_node.copyfrom_path = Some("missing".to_string());
        copy_node.copyfrom_rev = Some(RevRef::Ordinal(0));
        let r2 = reader.apply_revision(&mut store, &log, input(1, vec![copy_node])).unwrap();
        assert_eq!(r2.tree.as_tree().unwrap().find_path("b").unwrap().as_blob().unwrap().data(), b"fallback");
        assert_eq!(log.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_hide_does_not_change_tree_but_is_recorded() {
        let mut store = ObjectStore::new();
        let mut reader = HistoryReader::new(&mut store, None);
        let log = VecLogSink::default();
        let r1 = reader.apply_revision(&mut store, &log, input(0, vec![node(Action::Add, Kind::File, "f", Some(b"x"))])).unwrap();
        let r2 = reader.apply_revision(&mut store, &log, input(1, vec![node(Action::Hide, Kind::File, "f", None)])).unwrap();
        assert_eq!(r1.tree.hash(), r2.tree.hash());
        assert!(r2.hidden_paths.contains("f"));
    }

    #[test]
    fn test_rename_lowers_to_add_then_delete() {
        let mut store = ObjectStore::new();
        let mut reader = HistoryReader::new(&mut store, None);
        let log = VecLogSink::default();
        reader.apply_revision(&mut store, &log, input(0, vec![node(Action::Add, Kind::File, "a/old.c", Some(b"X"))])).unwrap();

        let mut rename_node = node(Action::Rename, Kind::File, "a/new.c", None);
        rename_node.copyfrom_path = Some("a/old.c".to_string());
        rename_node.copyfrom_rev = Some(RevRef::Ordinal(0));
        let r2 = reader.apply_revision(&mut store, &log, input(1, vec![rename_node])).unwrap();

        let tree = r2.tree.as_tree().unwrap();
        assert!(tree.find_path("a/old.c").is_none());
        assert_eq!(tree.find_path("a/new.c").unwrap().as_blob().unwrap().data(), b"X");
    }
}
