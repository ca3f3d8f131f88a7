//! Per-branch on-disk worktree materialising `.gitattributes` files so
//! `git hash-object --path=` resolves the attribute rules in force at a
//! blob's path (§4.4 `.gitattributes` worktree).

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::errors::Result;
use crate::git::GitEnv;
use crate::hash::ObjectHash;
use crate::store::Obj;

pub struct BranchWorkdir {
    dir: TempDir,
    seq: u64,
    attrs_sha1: ObjectHash,
}

impl BranchWorkdir {
    pub fn new() -> Result<BranchWorkdir> {
        Ok(BranchWorkdir { dir: tempfile::tempdir()?, seq: 0, attrs_sha1: ObjectHash::ZERO })
    }

    fn index_path(&self) -> PathBuf {
        self.dir.path().join(format!(".git.index{}", self.seq))
    }

    pub fn env(&self) -> GitEnv {
        GitEnv::for_workdir(self.dir.path(), self.index_path())
    }

    pub fn attrs_sha1(&self) -> ObjectHash {
        self.attrs_sha1
    }

    /// Recomputes the attribute-environment key (SHA-1 over sorted
    /// `path + data_sha1` pairs, §4.4) and, if it changed, bumps
    /// `workdir_seq` and re-materialises every `.gitattributes` blob into a
    /// fresh directory so in-flight hashing of older revisions keeps using
    /// the attributes that were in force for them.
    pub fn sync_gitattributes(&mut self, tree: Option<&Obj>) -> Result<()> {
        let mut entries: Vec<(String, ObjectHash)> = Vec::new();
        if let Some(tree) = tree {
            collect_gitattributes(tree, "", &mut entries);
        }
        entries.sort();

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        for (path, hash) in &entries {
            chunks.push(path.as_bytes().to_vec());
            chunks.push(hash.to_data());
        }
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        let new_sha1 = ObjectHash::of_chunks(refs);
        if new_sha1 == self.attrs_sha1 && self.seq > 0 {
            return Ok(());
        }

        self.seq += 1;
        let fresh = tempfile::tempdir()?;
        for (path, _) in &entries {
            if let Some(obj) = tree.and_then(|t| t.as_tree()).and_then(|t| t.find_path(path)) {
                if let Some(blob) = obj.as_blob() {
                    let full = fresh.path().join(path);
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(full, blob.data())?;
                }
            }
        }
        self.dir = fresh;
        self.attrs_sha1 = new_sha1;
        Ok(())
    }
}

fn collect_gitattributes(obj: &Obj, prefix: &str, out: &mut Vec<(String, ObjectHash)>) {
    if let Some(tree) = obj.as_tree() {
        for entry in tree.entries() {
            let path = if prefix.is_empty() { entry.name.clone() } else { format!("{prefix}/{}", entry.name) };
            if entry.name == ".gitattributes" {
                out.push((path.clone(), entry.object.hash()));
            }
            collect_gitattributes(&entry.object, &path, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Blob, ObjectStore, Tree};
    use std::sync::Arc;

    #[test]
    fn test_sync_gitattributes_writes_file_and_is_idempotent() {
        let mut store = ObjectStore::new();
        let blob = store.finalize_blob(Blob::new(b"* text=auto".to_vec(), Default::default()));
        let tree = Tree::empty().set(".gitattributes", blob, None);
        let tree = store.finalize(Obj::Tree(Arc::new(tree)));

        let mut wd = BranchWorkdir::new().unwrap();
        wd.sync_gitattributes(Some(&tree)).unwrap();
        let sha1_first = wd.attrs_sha1();
        let content = std::fs::read(wd.env().work_tree.unwrap().join(".gitattributes")).unwrap();
        assert_eq!(content, b"* text=auto");

        wd.sync_gitattributes(Some(&tree)).unwrap();
        assert_eq!(wd.attrs_sha1(), sha1_first);
    }
}
