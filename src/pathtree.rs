//! Generic path-keyed lookup tree (§2 PathTree).
//!
//! Ported from the original tool's `lookup_tree`/`path_tree`: a node per path
//! component, looked up by splitting on `/` and ignoring empty components, so
//! a leading `/`, a trailing `/`, or doubled `//` are all equivalent to the
//! path without them. Each node carries an optional `object` (the mapped
//! value), a tri-state `mapped` flag (branch-mapping decision: unset / in /
//! out), and a `used_by` side-table keyed by an arbitrary string (copy-source
//! tracking per branch in the project engine).

use std::collections::BTreeMap;

/// One node of a [`PathTree`]. Children are kept in a `BTreeMap` so
/// [`PathTree::items`] yields paths in a stable, sorted order (the original's
/// plain `dict` relied on Python's insertion order instead; sorted order is
/// the more useful default for deterministic tree construction here).
#[derive(Debug, Clone)]
struct PathNode<T, U> {
    children: BTreeMap<String, PathNode<T, U>>,
    object: Option<T>,
    mapped: Option<bool>,
    used_by: BTreeMap<String, U>,
}

impl<T, U> Default for PathNode<T, U> {
    fn default() -> Self {
        PathNode {
            children: BTreeMap::new(),
            object: None,
            mapped: None,
            used_by: BTreeMap::new(),
        }
    }
}

/// A path-keyed tree mapping `/`-separated paths to values of type `T`, with
/// an auxiliary per-node `used_by` side-table of type `U`.
#[derive(Debug, Clone)]
pub struct PathTree<T, U = T> {
    root: PathNode<T, U>,
}

impl<T, U> Default for PathTree<T, U> {
    fn default() -> Self {
        PathTree { root: PathNode::default() }
    }
}

fn split_first(path: &str) -> (&str, &str) {
    match path.split_once('/') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    }
}

impl<T, U> PathTree<T, U> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk to the node for `path`, optionally creating missing components.
    /// Returns `None` when the node doesn't exist and `add_if_missing` is
    /// false and `match_full_path` is true; when `match_full_path` is false,
    /// the deepest existing ancestor is returned instead (mirrors
    /// `get_node`'s "return self" partial-match behaviour).
    fn get_node(&self, path: &str, match_full_path: bool) -> Option<&PathNode<T, U>> {
        let mut node = &self.root;
        let mut rest = path;
        loop {
            if rest.is_empty() {
                return Some(node);
            }
            let (head, tail) = split_first(rest);
            if head.is_empty() {
                rest = tail;
                continue;
            }
            match node.children.get(head) {
                Some(child) => {
                    node = child;
                    rest = tail;
                }
                None => {
                    return if match_full_path { None } else { Some(node) };
                }
            }
        }
    }

    fn get_node_mut(&mut self, path: &str, add_if_missing: bool) -> Option<&mut PathNode<T, U>> {
        let mut node = &mut self.root;
        let mut rest = path;
        loop {
            if rest.is_empty() {
                return Some(node);
            }
            let (head, tail) = split_first(rest);
            if head.is_empty() {
                rest = tail;
                continue;
            }
            if !node.children.contains_key(head) {
                if add_if_missing {
                    node.children.insert(head.to_string(), PathNode::default());
                } else {
                    return None;
                }
            }
            node = node.children.get_mut(head).expect("just inserted or present");
            rest = tail;
        }
    }

    /// Returns the value stored at `path`, or `None` if there's no node there
    /// or the node holds no object. When `match_full_path` is false, a
    /// partial-match ancestor's object is returned if the exact path is
    /// absent (mirrors the original's `find_path`).
    pub fn find_path(&self, path: &str, match_full_path: bool) -> Option<&T> {
        self.get_node(path, match_full_path).and_then(|n| n.object.as_ref())
    }

    /// Stores `value` at `path`, creating intermediate nodes as needed.
    /// Returns the previous value. If `replace_ok` is false and a value is
    /// already present, the existing value is kept and returned unchanged.
    pub fn set(&mut self, path: &str, value: T, replace_ok: bool) -> Option<T> {
        let node = self
            .get_node_mut(path, true)
            .expect("add_if_missing=true never returns None");
        if node.object.is_none() || replace_ok {
            node.object.replace(value)
        } else {
            None
        }
    }

    pub fn set_used_by(&mut self, path: &str, key: &str, value: U, match_full_path: bool) {
        let node = if match_full_path {
            self.get_node_mut(path, false)
        } else {
            self.get_node_mut(path, true)
        };
        if let Some(node) = node {
            node.used_by.insert(key.to_string(), value);
        }
    }

    /// Looks up `key` in the `used_by` table at `path`. If `key` is `None`,
    /// returns the first `(key, value)` pair in the table instead (matches
    /// the original's "no key means peek the first entry" behaviour).
    pub fn get_used_by(&self, path: &str, key: Option<&str>, match_full_path: bool) -> Option<(&str, &U)> {
        let node = self.get_node(path, match_full_path)?;
        match key {
            Some(key) => node.used_by.get_key_value(key).map(|(k, v)| (k.as_str(), v)),
            None => node.used_by.iter().next().map(|(k, v)| (k.as_str(), v)),
        }
    }

    /// Tri-state branch-mapping flag: `None` means never set, `Some(true)`/
    /// `Some(false)` an explicit include/exclude decision.
    pub fn get_mapped(&self, path: &str) -> Option<bool> {
        self.get_node(path, true).and_then(|n| n.mapped)
    }

    pub fn set_mapped(&mut self, path: &str, mapped: bool) {
        let node = self
            .get_node_mut(path, true)
            .expect("add_if_missing=true never returns None");
        node.mapped = Some(mapped);
    }

    /// Depth-first `(path, &value)` pairs for every node carrying an object,
    /// in sorted child order.
    pub fn items(&self) -> Vec<(String, &T)> {
        let mut out = Vec::new();
        Self::collect_items(&self.root, String::new(), &mut out);
        out
    }

    fn collect_items<'a>(node: &'a PathNode<T, U>, prefix: String, out: &mut Vec<(String, &'a T)>) {
        if let Some(obj) = node.object.as_ref() {
            out.push((prefix.clone(), obj));
        }
        for (key, child) in &node.children {
            let child_path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}/{key}")
            };
            Self::collect_items(child, child_path, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_find_exact_path() {
        let mut t: PathTree<i32> = PathTree::new();
        t.set("a/b/c", 42, true);
        assert_eq!(t.find_path("a/b/c", true), Some(&42));
    }

    #[test]
    fn test_leading_trailing_and_doubled_slashes_are_equivalent() {
        let mut t: PathTree<i32> = PathTree::new();
        t.set("/a//b/c/", 7, true);
        assert_eq!(t.find_path("a/b/c", true), Some(&7));
        assert_eq!(t.find_path("/a/b/c/", true), Some(&7));
    }

    #[test]
    fn test_find_path_partial_match_returns_ancestor() {
        let mut t: PathTree<i32> = PathTree::new();
        t.set("a/b", 1, true);
        assert_eq!(t.find_path("a/b/c/d", false), Some(&1));
        assert_eq!(t.find_path("a/b/c/d", true), None);
    }

    #[test]
    fn test_replace_ok_false_keeps_existing() {
        let mut t: PathTree<i32> = PathTree::new();
        t.set("a", 1, true);
        let prev = t.set("a", 2, false);
        assert_eq!(prev, None);
        assert_eq!(t.find_path("a", true), Some(&1));
    }

    #[test]
    fn test_mapped_tristate() {
        let mut t: PathTree<i32> = PathTree::new();
        assert_eq!(t.get_mapped("a/b"), None);
        t.set_mapped("a/b", false);
        assert_eq!(t.get_mapped("a/b"), Some(false));
        t.set_mapped("a/b", true);
        assert_eq!(t.get_mapped("a/b"), Some(true));
    }

    #[test]
    fn test_used_by_first_entry_when_no_key() {
        let mut t: PathTree<i32, &str> = PathTree::new();
        t.set_used_by("a", "branch1", "rev5", true);
        let (k, v) = t.get_used_by("a", None, true).unwrap();
        assert_eq!(k, "branch1");
        assert_eq!(*v, "rev5");
    }

    #[test]
    fn test_items_depth_first_sorted() {
        let mut t: PathTree<i32> = PathTree::new();
        t.set("b", 2, true);
        t.set("a", 1, true);
        t.set("a/x", 10, true);
        let items = t.items();
        let paths: Vec<&str> = items.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/x", "b"]);
    }
}
