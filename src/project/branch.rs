//! Per-branch revision state (§4.4 `project_branch_rev`/`project_branch`).

use std::collections::HashMap;

use crate::authors::AuthorProps;
use crate::hash::ObjectHash;
use crate::project::config::{EditMsgRule, FormatSpec, InjectFile, SkipCommitRule};
use crate::project::workdir::BranchWorkdir;
use crate::store::Obj;

pub type BranchId = usize;

/// `(branch, index_seq)` is a branch's identity across its lifetime — a
/// branch deleted and later recreated at the same path gets a new
/// `index_seq`, so old merge/parent references don't alias the new branch
/// (§4.8).
pub type BranchKey = (BranchId, u64);
/// Points at one revision within a specific branch's `revs` vector.
pub type RevRef = (BranchId, usize);

/// Commit message material for one source revision folded into a branch
/// commit (§4.4 Commit message composition).
#[derive(Debug, Clone)]
pub struct RevisionProps {
    pub rev_ordinal: u64,
    pub rev_id: String,
    pub log: Vec<String>,
    pub author: AuthorProps,
    pub date: String,
}

/// Splits a raw log message into non-empty paragraphs, preserving a
/// deliberate leading-blank-paragraph marker (ported from the original's
/// `log_to_paragraphs`).
pub fn log_to_paragraphs(log: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let normalized = log.replace("\r\n", "\n");
    if normalized.starts_with("\n\n") {
        paragraphs.push(String::new());
    }
    let trimmed = normalized.trim_matches(|c| c == '\n' || c == ' ' || c == '\t');
    for paragraph in trimmed.split("\n\n") {
        let paragraph = paragraph.trim_end_matches([' ', '\t']).trim_start_matches('\n');
        if !paragraph.is_empty() {
            paragraphs.push(paragraph.to_string());
        }
    }
    paragraphs
}

/// State for one processed revision of a branch.
pub struct BranchRev {
    pub rev_ordinal: u64,
    pub index_seq: u64,
    /// The project subtree at this revision (`revision.tree.find_path(branch.path)`).
    pub tree: Option<Obj>,
    pub staged_tree: Option<Obj>,
    pub staged_git_tree: Option<ObjectHash>,
    pub committed_git_tree: Option<ObjectHash>,
    pub committed_tree: Option<Obj>,
    pub commit: Option<ObjectHash>,
    pub any_changes_present: bool,
    pub files_staged: u32,
    pub parents: Vec<RevRef>,
    /// Keyed by `(branch, index_seq)`; value is `(merged_revision, merged_at_revision)`.
    pub merged_revisions: HashMap<BranchKey, (RevRef, RevRef)>,
    pub revisions_to_merge: Option<HashMap<BranchKey, RevRef>>,
    pub props_list: Vec<RevisionProps>,
    pub labels: Vec<String>,
    pub staging_base_rev: Option<RevRef>,
}

impl BranchRev {
    pub fn initial(index_seq: u64) -> BranchRev {
        BranchRev {
            rev_ordinal: 0,
            index_seq,
            tree: None,
            staged_tree: None,
            staged_git_tree: None,
            committed_git_tree: None,
            committed_tree: None,
            commit: None,
            any_changes_present: false,
            files_staged: 0,
            parents: Vec::new(),
            merged_revisions: HashMap::new(),
            revisions_to_merge: None,
            props_list: Vec::new(),
            labels: Vec::new(),
            staging_base_rev: None,
        }
    }

    /// Carries forward everything from `prev` that a fresh revision inherits
    /// before this revision's own processing mutates it.
    pub fn follow(prev: &BranchRev) -> BranchRev {
        BranchRev {
            rev_ordinal: prev.rev_ordinal,
            index_seq: prev.index_seq,
            tree: prev.tree.clone(),
            staged_tree: None,
            staged_git_tree: None,
            committed_git_tree: prev.committed_git_tree,
            committed_tree: prev.committed_tree.clone(),
            commit: prev.commit,
            any_changes_present: false,
            files_staged: 0,
            parents: Vec::new(),
            merged_revisions: prev.merged_revisions.clone(),
            revisions_to_merge: None,
            props_list: Vec::new(),
            labels: Vec::new(),
            staging_base_rev: None,
        }
    }
}

/// A mapped directory's full branch state: its path in the project tree,
/// target refname, policy, and revision history (§4.3/§4.8).
pub struct Branch {
    pub path: String,
    pub refname: String,
    pub index_seq: u64,
    pub revs: Vec<BranchRev>,
    pub delete_if_merged: bool,
    pub ignore_files: Vec<regex::Regex>,
    pub format_specs: Vec<FormatSpec>,
    pub edit_msg_rules: Vec<EditMsgRule>,
    pub skip_commit_rules: Vec<SkipCommitRule>,
    pub inject_files: Vec<InjectFile>,
    pub labels_ref_root: Option<String>,
    pub deleted: bool,
    /// HEAD revision indices recorded each time this path is deleted, for
    /// the `<refname>_deleted@r<rev>` salvage pass (§4.8).
    pub deleted_revs: Vec<usize>,
    /// Lazily created on first commit that needs `.gitattributes` resolution.
    pub workdir: Option<BranchWorkdir>,
    /// Tracks whether the empty-directory placeholder is currently staged,
    /// so a later non-empty revision knows to remove it (§4.4, §4.6).
    pub placeholder_present: bool,
    /// Tracks whether `inject_files` are currently staged, so returning to
    /// an empty tree knows to remove them (§4.6 `inject_files`).
    pub inject_files_present: bool,
}

impl Branch {
    pub fn new(path: String, refname: String) -> Branch {
        Branch {
            path,
            refname,
            index_seq: 0,
            revs: vec![BranchRev::initial(0)],
            delete_if_merged: false,
            ignore_files: Vec::new(),
            format_specs: Vec::new(),
            edit_msg_rules: Vec::new(),
            skip_commit_rules: Vec::new(),
            inject_files: Vec::new(),
            labels_ref_root: None,
            deleted: false,
            deleted_revs: Vec::new(),
            workdir: None,
            placeholder_present: false,
            inject_files_present: false,
        }
    }

    pub fn head_index(&self) -> usize {
        self.revs.len() - 1
    }

    pub fn head(&self) -> &BranchRev {
        self.revs.last().expect("a branch always has at least its initial rev")
    }

    pub fn head_mut(&mut self) -> &mut BranchRev {
        self.revs.last_mut().expect("a branch always has at least its initial rev")
    }

    pub fn ignore_file(&self, path: &str) -> bool {
        self.ignore_files.iter().any(|r| r.is_match(path))
    }

    /// Starts a fresh `BranchRev` following the current HEAD and returns its
    /// index (§4.4 `set_head_revision`).
    pub fn push_revision(&mut self, rev_ordinal: u64) -> usize {
        let mut next = BranchRev::follow(self.head());
        next.rev_ordinal = rev_ordinal;
        self.revs.push(next);
        self.head_index()
    }

    /// Records the current HEAD into `deleted_revs` and resets the branch's
    /// live state, bumping `index_seq` so the path can be remapped to a
    /// distinct branch identity later (§4.8).
    pub fn mark_deleted(&mut self) {
        self.deleted_revs.push(self.head_index());
        self.deleted = true;
        self.index_seq += 1;
        self.revs.push(BranchRev::initial(self.index_seq));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_to_paragraphs_splits_on_blank_lines() {
        let paragraphs = log_to_paragraphs("Title line\n\nBody paragraph one.\n\nBody paragraph two.\n");
        assert_eq!(paragraphs, vec!["Title line", "Body paragraph one.", "Body paragraph two."]);
    }

    #[test]
    fn test_log_to_paragraphs_leading_blank_marker() {
        let paragraphs = log_to_paragraphs("\n\nFirst real paragraph");
        assert_eq!(paragraphs, vec!["".to_string(), "First real paragraph".to_string()]);
    }

    #[test]
    fn test_push_revision_inherits_committed_tree() {
        let mut b = Branch::new("trunk".to_string(), "refs/heads/main".to_string());
        b.head_mut().committed_git_tree = Some(ObjectHash::of_bytes(b"x"));
        let idx = b.push_revision(5);
        assert_eq!(b.revs[idx].committed_git_tree, Some(ObjectHash::of_bytes(b"x")));
        assert!(!b.revs[idx].any_changes_present);
    }

    #[test]
    fn test_mark_deleted_bumps_index_seq() {
        let mut b = Branch::new("trunk".to_string(), "refs/heads/main".to_string());
        b.mark_deleted();
        assert_eq!(b.index_seq, 1);
        assert_eq!(b.deleted_revs, vec![0]);
        assert_eq!(b.head().index_seq, 1);
    }
}
