//! Branch discovery and per-revision commit production across the whole
//! project (§4.3-§4.10 `project_branch`/`project_history_tree`).

pub mod branch;
pub mod config;
pub mod workdir;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::authors::AuthorMap;
use crate::errors::Result;
use crate::formatter::{self, FormatConfig};
use crate::git::{GitDriver, Signature};
use crate::hash::ObjectHash;
use crate::history::{Action, HistoryReader, HistoryRevision, Kind, RevisionInput, RevisionNode};
use crate::logsink::LogSink;
use crate::pathtree::PathTree;
use crate::scheduler::{Pool, Scheduler};
use crate::sha1cache::{cache_key, CacheKeyInput, Sha1Cache};
use crate::store::{Blob, Obj, ObjectStore, MODE_REGULAR};

use self::branch::{log_to_paragraphs, Branch, BranchId, RevisionProps};
use self::config::{match_format_specs, ProjectConfig};

/// One leaf-level pending index change (§4.4 stagelist).
struct StageEntry {
    path: String,
    old: Option<Obj>,
    new: Option<Obj>,
    mode: u32,
}

/// Ties the history reader, object store, git driver, and the live set of
/// discovered branches together, and drives one commit per touched branch
/// per incoming revision.
pub struct ProjectTree {
    history: HistoryReader,
    store: ObjectStore,
    git: Arc<GitDriver>,
    config: ProjectConfig,
    authors: AuthorMap,
    sha1_cache: Sha1Cache,
    scheduler: Scheduler,
    branches: Vec<Branch>,
    /// Tri-state branch-mapping decision per directory, plus the `BranchId`
    /// once a directory has actually become a branch root.
    branch_paths: PathTree<BranchId>,
    /// Refname uniqueness tree (§4.8 `___N` suffix collision resolution).
    all_refs: PathTree<()>,
    empty_tree: Obj,
    /// Revision awaiting a possible combine with the next incoming one (§4.5).
    pending_input: Option<RevisionInput>,
    /// Ordinal/id pairs of revisions folded into `pending_input` by combining,
    /// aliased to the surviving revision once it is actually applied.
    pending_aliases: Vec<(u64, String)>,
}

impl ProjectTree {
    pub fn new(
        repo_path: impl Into<std::path::PathBuf>,
        config: ProjectConfig,
        authors: AuthorMap,
        sha1_cache: Sha1Cache,
    ) -> ProjectTree {
        let mut store = ObjectStore::new();
        let history = HistoryReader::new(&mut store, config.extract_root.clone());
        let empty_tree = store.finalize(Obj::Tree(Arc::new(crate::store::Tree::empty())));
        ProjectTree {
            history,
            store,
            git: Arc::new(GitDriver::new(repo_path)),
            config,
            authors,
            sha1_cache,
            scheduler: Scheduler::new(),
            branches: Vec::new(),
            branch_paths: PathTree::new(),
            all_refs: PathTree::new(),
            empty_tree,
            pending_input: None,
            pending_aliases: Vec::new(),
        }
    }

    pub fn sha1_cache_mut(&mut self) -> &mut Sha1Cache {
        &mut self.sha1_cache
    }

    pub fn git(&self) -> &Arc<GitDriver> {
        &self.git
    }

    /// Buffers one incoming revision against the previous one so that
    /// adjacent revisions eligible for combining (§4.5) are folded together
    /// before either is actually applied. Call `finish` to flush the last
    /// buffered revision once the stream is exhausted.
    pub fn apply_revision(&mut self, log: &dyn LogSink, input: RevisionInput) -> Result<()> {
        let Some(prev) = self.pending_input.take() else {
            self.pending_input = Some(input);
            return Ok(());
        };

        if should_combine(&prev, &input) {
            self.pending_aliases.push((input.rev_ordinal, input.rev_id.clone()));
            self.pending_input = Some(combine_inputs(prev, input));
            Ok(())
        } else {
            self.process_revision(log, prev)?;
            self.pending_input = Some(input);
            Ok(())
        }
    }

    /// Materialises the new project tree for one (possibly combined) input
    /// revision, discovers/maps any newly-appearing branch directories, and
    /// produces one commit per existing or newly-mapped branch it touched.
    fn process_revision(&mut self, log: &dyn LogSink, input: RevisionInput) -> Result<()> {
        let label_nodes: Vec<(String, String)> = input
            .nodes
            .iter()
            .filter(|n| n.action == Action::Label)
            .filter_map(|n| n.label.clone().map(|l| (n.path.clone(), l)))
            .collect();
        let merge_nodes: Vec<RevisionNode> = input.nodes.iter().filter(|n| n.action == Action::Merge).cloned().collect();
        let copy_nodes: Vec<RevisionNode> = input
            .nodes
            .iter()
            .filter(|n| matches!(n.action, Action::Add | Action::Copy) && n.kind == Kind::Dir && n.copyfrom_path.is_some())
            .cloned()
            .collect();

        let prev_tree = self.history.head().map(|h| h.tree.clone()).unwrap_or_else(|| self.empty_tree.clone());
        let revision = self.history.apply_revision(&mut self.store, log, input)?;
        for (ordinal, id) in self.pending_aliases.drain(..) {
            self.history.alias_revision(ordinal, id);
        }

        let mut touched: BTreeSet<BranchId> = BTreeSet::new();
        self.discover(Some(&prev_tree), &revision.tree, "", &mut touched)?;

        for branch_id in touched {
            self.process_branch_revision(branch_id, &revision, &merge_nodes, &copy_nodes, log)?;
        }

        for (path, label) in label_nodes {
            self.apply_label(&path, &label, &revision)?;
        }

        Ok(())
    }

    /// Walks directories that changed between `prev` and `new_obj`, classifying
    /// each against `branch_paths`/`config` and recursing into unmapped
    /// directories until either a branch root or a leaf is reached.
    fn discover(&mut self, prev: Option<&Obj>, new_obj: &Obj, path: &str, touched: &mut BTreeSet<BranchId>) -> Result<()> {
        let Some(new_tree) = new_obj.as_tree() else {
            return Ok(());
        };
        let prev_tree = prev.and_then(|p| p.as_tree());

        for entry in new_tree.entries() {
            if !entry.object.is_dir() {
                continue;
            }
            let child_path = if path.is_empty() { entry.name.clone() } else { format!("{path}/{}", entry.name) };
            let prev_child = prev_tree.and_then(|t| t.find_path(&entry.name));
            if let Some(prev_obj) = prev_child {
                if prev_obj.hash() == entry.object.hash() {
                    continue;
                }
            }

            match self.branch_paths.get_mapped(&child_path) {
                Some(true) => {
                    let id = *self.branch_paths.find_path(&child_path, true).expect("mapped implies present");
                    touched.insert(id);
                }
                Some(false) => {
                    self.discover(prev_child, &entry.object, &child_path, touched)?;
                }
                None => match self.try_map(&child_path)? {
                    Some(id) => {
                        touched.insert(id);
                    }
                    None => self.discover(prev_child, &entry.object, &child_path, touched)?,
                },
            }
        }
        Ok(())
    }

    /// Tests `path` against the ordered `MapPath` rules; on a match, creates
    /// and registers a new branch (§4.3).
    fn try_map(&mut self, path: &str) -> Result<Option<BranchId>> {
        let Some(rule) = self.config.match_path(path) else {
            self.branch_paths.set_mapped(path, false);
            return Ok(None);
        };
        let Some(refname) = rule.render_refname(path) else {
            self.branch_paths.set_mapped(path, false);
            return Ok(None);
        };
        let refname = self.unique_refname(refname);

        let mut branch = Branch::new(path.to_string(), refname.clone());
        branch.delete_if_merged = rule.delete_if_merged;
        branch.ignore_files = rule.ignore_files.clone();
        branch.edit_msg_rules = rule.edit_msg_rules.clone();
        branch.skip_commit_rules = rule.skip_commit_rules.clone();
        branch.inject_files = rule.inject_files.clone();
        branch.format_specs = rule.format_specifications.clone();
        branch.labels_ref_root = rule.labels_ref_root.clone();

        let id = self.branches.len();
        info!(path, refname = %branch.refname, "mapped new branch");
        self.branches.push(branch);
        self.branch_paths.set(path, id, true);
        self.branch_paths.set_mapped(path, true);
        self.all_refs.set(&refname, (), true);
        Ok(Some(id))
    }

    fn unique_refname(&self, refname: String) -> String {
        if self.all_refs.find_path(&refname, true).is_none() {
            return refname;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{refname}___{n}");
            if self.all_refs.find_path(&candidate, true).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    fn process_branch_revision(
        &mut self,
        branch_id: BranchId,
        revision: &Arc<HistoryRevision>,
        merge_nodes: &[RevisionNode],
        copy_nodes: &[RevisionNode],
        log: &dyn LogSink,
    ) -> Result<()> {
        let branch_path = self.branches[branch_id].path.clone();
        let subtree = revision.tree.as_tree().and_then(|t| t.find_path(&branch_path)).cloned();

        let Some(subtree) = subtree else {
            self.branches[branch_id].mark_deleted();
            log.warn(revision.rev_ordinal, &format!("branch \"{branch_path}\" deleted"));
            return Ok(());
        };

        let idx = self.branches[branch_id].push_revision(revision.rev_ordinal);
        self.branches[branch_id].revs[idx].tree = Some(subtree.clone());

        self.record_merge_parents(branch_id, idx, &branch_path, merge_nodes, copy_nodes, &subtree, log);

        self.prepare_commit(branch_id, idx, revision, log)
    }

    /// Collects pending parents for this branch's new revision from the
    /// three sources §4.4 names: copy-source detection, explicit `merge`
    /// actions, and transitive merges inherited from the previous revision
    /// (§4.4 Parent selection & merge handling).
    fn record_merge_parents(
        &mut self,
        branch_id: BranchId,
        idx: usize,
        branch_path: &str,
        merge_nodes: &[RevisionNode],
        copy_nodes: &[RevisionNode],
        subtree: &Obj,
        log: &dyn LogSink,
    ) {
        let mut parents: Vec<branch::RevRef> = Vec::new();

        for node in copy_nodes {
            if !path_under(branch_path, &node.path) {
                continue;
            }
            if let Some(parent_ref) = self.resolve_copy_parent(node, subtree) {
                if !parents.contains(&parent_ref) {
                    parents.push(parent_ref);
                }
            }
        }

        for node in merge_nodes {
            if !path_under(branch_path, &node.path) {
                continue;
            }
            let (Some(copyfrom_path), Some(copyfrom_rev)) = (&node.copyfrom_path, &node.copyfrom_rev) else {
                log.warn(self.branches[branch_id].revs[idx].rev_ordinal, &format!("merge action on \"{}\" has no copy source; ignored", node.path));
                continue;
            };
            let Some(src_branch) = self.longest_prefix_branch(copyfrom_path) else {
                continue;
            };
            let Some(src_idx) = self.revision_index_for(src_branch, copyfrom_rev) else {
                continue;
            };
            let parent_ref = (src_branch, src_idx);
            if !parents.contains(&parent_ref) {
                parents.push(parent_ref);
            }
        }

        if idx > 0 {
            let inherited: Vec<branch::RevRef> =
                self.branches[branch_id].revs[idx - 1].merged_revisions.values().map(|(merged_rev, _)| *merged_rev).collect();
            for r in inherited {
                if !parents.contains(&r) {
                    parents.push(r);
                }
            }
        }

        for &(pb, pidx) in &parents {
            let key: branch::BranchKey = (pb, self.branches[pb].index_seq);
            let at_rev: branch::RevRef = (branch_id, idx);
            self.branches[branch_id].revs[idx].merged_revisions.insert(key, ((pb, pidx), at_rev));
        }

        self.branches[branch_id].revs[idx].parents = parents;
    }

    /// A directory-add/copy whose source subtree is similar to the current
    /// tree names its source branch (found by longest-prefix match on the
    /// copy source path) as a pending parent (§4.4 rule 1).
    fn resolve_copy_parent(&self, node: &RevisionNode, subtree: &Obj) -> Option<branch::RevRef> {
        let copyfrom_path = node.copyfrom_path.as_ref()?;
        let copyfrom_rev = node.copyfrom_rev.as_ref()?;
        let src_branch = self.longest_prefix_branch(copyfrom_path)?;
        let src_idx = self.revision_index_for(src_branch, copyfrom_rev)?;
        let src_rev = &self.branches[src_branch].revs[src_idx];
        let src_tree = src_rev.committed_tree.as_ref().or(src_rev.tree.as_ref())?;
        let src_t = src_tree.as_tree()?;
        let cur_t = subtree.as_tree()?;
        let metrics = src_t.difference_metrics(cur_t).ok()?;
        if metrics.is_similar() {
            Some((src_branch, src_idx))
        } else {
            None
        }
    }

    /// The live branch whose `path` is the longest prefix of `path`.
    fn longest_prefix_branch(&self, path: &str) -> Option<BranchId> {
        self.branches
            .iter()
            .enumerate()
            .filter(|(_, b)| path_under(&b.path, path))
            .max_by_key(|(_, b)| b.path.len())
            .map(|(id, _)| id)
    }

    /// The index into `branch_id`'s `revs` representing its state as of
    /// `rev_ref` — the last revision recorded at or before that ordinal.
    fn revision_index_for(&self, branch_id: BranchId, rev_ref: &crate::history::RevRef) -> Option<usize> {
        let ordinal = match rev_ref {
            crate::history::RevRef::Ordinal(n) => *n,
            crate::history::RevRef::Id(_) => self.history.get_revision(rev_ref).ok()?.rev_ordinal,
        };
        self.branches[branch_id].revs.iter().rposition(|r| r.rev_ordinal <= ordinal)
    }

    /// One-hop approximation of "ancestor through merges": `candidate` is an
    /// ancestor of `through` if `through`'s own revision recorded `candidate`
    /// as a merged revision (§4.4 fast-forward rule).
    fn is_ancestor_via_merges(&self, candidate: branch::RevRef, through: branch::RevRef) -> bool {
        self.branches
            .get(through.0)
            .and_then(|b| b.revs.get(through.1))
            .map(|r| r.merged_revisions.values().any(|(merged, _)| *merged == candidate))
            .unwrap_or(false)
    }

    /// Looks up the format specification that applies to `path` within
    /// `branch_id`, checking the branch's own rule before the project-wide
    /// list (§4.3, §4.9).
    fn select_format_config(&self, branch_id: BranchId, path: &str) -> Option<&FormatConfig> {
        match_format_specs(&self.branches[branch_id].format_specs, path).or_else(|| self.config.match_format(path))
    }

    /// Stages this revision's changes for one branch, hashes any new blobs,
    /// writes a tree, and produces a commit (§4.4).
    fn prepare_commit(&mut self, branch_id: BranchId, idx: usize, revision: &Arc<HistoryRevision>, log: &dyn LogSink) -> Result<()> {
        let old_tree = self.branches[branch_id].revs[idx - 1]
            .staged_tree
            .clone()
            .or_else(|| self.branches[branch_id].revs[idx - 1].committed_tree.clone())
            .unwrap_or_else(|| self.empty_tree.clone());
        let new_tree = self.branches[branch_id].revs[idx].tree.clone().expect("set just above");

        let old_is_empty = old_tree.as_tree().map(|t| t.entries().is_empty()).unwrap_or(true);
        let new_is_empty = new_tree.as_tree().map(|t| t.entries().is_empty()).unwrap_or(true);

        let difflist = old_tree
            .as_tree()
            .expect("branch subtree is always a directory")
            .compare(new_tree.as_tree().expect("branch subtree is always a directory"), true)?;

        let branch_path = self.branches[branch_id].path.clone();
        let mut stage: Vec<StageEntry> = Vec::new();
        for entry in difflist {
            let abs_path = if branch_path.is_empty() { entry.path.clone() } else { format!("{branch_path}/{}", entry.path) };
            if revision.hidden_paths.contains(&abs_path) {
                continue;
            }
            if self.branches[branch_id].ignore_file(&entry.path) {
                continue;
            }
            if self.config.ignore_files.iter().any(|r| r.is_match(&abs_path)) {
                continue;
            }
            let mode = entry.new_mode.unwrap_or(MODE_REGULAR);
            stage.push(StageEntry { path: entry.path, old: entry.old, new: entry.new, mode });
        }

        // Empty-directory placeholder: injected on the empty->non-empty
        // transition, removed on the way back (§4.4, §4.6).
        if let Some(placeholder_name) = self.config.empty_placeholder_name.clone() {
            let was_present = self.branches[branch_id].placeholder_present;
            if new_is_empty && !was_present {
                let blob = self.store.finalize_blob(Blob::new(self.config.empty_placeholder_content.clone(), Default::default()));
                stage.push(StageEntry { path: placeholder_name, old: None, new: Some(blob), mode: MODE_REGULAR });
                self.branches[branch_id].placeholder_present = true;
            } else if !new_is_empty && was_present {
                let blob = self.store.finalize_blob(Blob::new(self.config.empty_placeholder_content.clone(), Default::default()));
                stage.push(StageEntry { path: placeholder_name, old: Some(blob), new: None, mode: MODE_REGULAR });
                self.branches[branch_id].placeholder_present = false;
            }
        }

        // `inject_files`: forced into the tree on the first non-empty commit,
        // removed on return to empty (§4.6).
        if !self.branches[branch_id].inject_files.is_empty() {
            let was_present = self.branches[branch_id].inject_files_present;
            if old_is_empty && !new_is_empty && !was_present {
                let injects = self.branches[branch_id].inject_files.clone();
                for inject in injects {
                    let blob = self.store.finalize_blob(Blob::new(inject.content, Default::default()));
                    stage.push(StageEntry { path: inject.path, old: None, new: Some(blob), mode: MODE_REGULAR });
                }
                self.branches[branch_id].inject_files_present = true;
            } else if new_is_empty && was_present {
                let injects = self.branches[branch_id].inject_files.clone();
                for inject in injects {
                    let blob = self.store.finalize_blob(Blob::new(inject.content, Default::default()));
                    stage.push(StageEntry { path: inject.path, old: Some(blob), new: None, mode: MODE_REGULAR });
                }
                self.branches[branch_id].inject_files_present = false;
            }
        }

        let parent_commit = self.branches[branch_id].revs[idx - 1].commit;
        let carried_git_tree = self.branches[branch_id].revs[idx - 1].staged_git_tree.or(self.branches[branch_id].revs[idx - 1].committed_git_tree);
        let forwarded_props = std::mem::take(&mut self.branches[branch_id].revs[idx - 1].props_list);
        let current_props = self.make_revision_props(revision, None);

        let skip_rule = skip_commit_match(&self.branches[branch_id].skip_commit_rules, revision.rev_ordinal, &revision.rev_id)
            .or_else(|| skip_commit_match(&self.config.skip_commit_list, revision.rev_ordinal, &revision.rev_id))
            .cloned();

        let has_merge_parents = !self.branches[branch_id].revs[idx].parents.is_empty();

        if let Some(rule) = &skip_rule {
            if !has_merge_parents {
                if stage.is_empty() {
                    // Nothing to carry forward; the deferred props have no
                    // commit to eventually attach to, so they are dropped.
                    let rev = &mut self.branches[branch_id].revs[idx];
                    rev.staged_tree = Some(old_tree);
                    rev.staged_git_tree = carried_git_tree;
                    rev.committed_git_tree = rev.staged_git_tree;
                    rev.committed_tree = rev.tree.clone();
                    rev.commit = parent_commit;
                    return Ok(());
                }

                let deferred = match &rule.replacement_message {
                    Some(msg) => self.make_revision_props(revision, Some(vec![msg.clone()])),
                    None => current_props,
                };
                let mut carried = forwarded_props;
                carried.push(deferred);

                // Tree did change but the commit is deferred: keep the
                // previous committed state as the base so the next
                // revision's diff naturally folds this one's changes in.
                let rev = &mut self.branches[branch_id].revs[idx];
                rev.staged_tree = Some(old_tree.clone());
                rev.staged_git_tree = carried_git_tree;
                rev.committed_git_tree = rev.staged_git_tree;
                rev.committed_tree = Some(old_tree);
                rev.commit = parent_commit;
                rev.props_list = carried;
                return Ok(());
            }
            log.warn(revision.rev_ordinal, &format!("skip-commit rule matched but branch \"{branch_path}\" has merge parents; committing anyway"));
        }

        let mut props_list = forwarded_props;
        props_list.push(current_props);

        if stage.is_empty() && !has_merge_parents {
            // No tree change and nothing merged in: carry the previous commit
            // forward rather than writing an empty one. Any forwarded props
            // ride along in case a later revision needs them.
            let rev = &mut self.branches[branch_id].revs[idx];
            rev.staged_tree = Some(old_tree);
            rev.staged_git_tree = carried_git_tree;
            rev.committed_git_tree = rev.staged_git_tree;
            rev.committed_tree = rev.tree.clone();
            rev.commit = parent_commit;
            rev.props_list = props_list;
            return Ok(());
        }

        if self.branches[branch_id].workdir.is_none() {
            self.branches[branch_id].workdir = Some(workdir::BranchWorkdir::new()?);
        }
        self.branches[branch_id].workdir.as_mut().expect("just set").sync_gitattributes(Some(&new_tree))?;
        let env = self.branches[branch_id].workdir.as_ref().expect("just set").env();
        let attrs_sha1 = self.branches[branch_id].workdir.as_ref().expect("just set").attrs_sha1();

        let base_git_tree = self.branches[branch_id].revs[idx - 1]
            .staged_git_tree
            .or(self.branches[branch_id].revs[idx - 1].committed_git_tree);
        let index_file = env.index_file.as_ref().expect("workdir envs always set an index file");
        if !index_file.exists() {
            if let Some(base) = base_git_tree {
                let base_str = base.to_string();
                self.git.read_tree(&[base_str.as_str()], &env)?;
            }
        }

        let mut resolved: Vec<Option<ObjectHash>> = vec![None; stage.len()];
        let mut to_hash: Vec<(usize, Vec<u8>, String, ObjectHash)> = Vec::new();
        for (i, entry) in stage.iter().enumerate() {
            if let Some(blob) = entry.new.as_ref().and_then(|o| o.as_blob()) {
                let abs_path = if branch_path.is_empty() { entry.path.clone() } else { format!("{branch_path}/{}", entry.path) };
                let format_config = self.select_format_config(branch_id, &abs_path).cloned();
                let style_tag = format_config.as_ref().map(formatter::style_tag);
                let key = cache_key(&CacheKeyInput {
                    raw_sha1: blob.hash(),
                    gitattributes_sha1: attrs_sha1,
                    formatter_sha1: format_config.as_ref().map(formatter::config_sha1),
                    formatter_tag: style_tag.as_deref(),
                    path: &entry.path,
                });
                if let Some(cached) = self.sha1_cache.get(key) {
                    resolved[i] = Some(cached);
                } else {
                    let data = match &format_config {
                        Some(cfg) => {
                            let (formatted, warnings) = formatter::format_bytes(blob.data(), cfg);
                            for w in warnings {
                                log.warn(revision.rev_ordinal, &format!("{}: {}", entry.path, w.message));
                            }
                            formatted
                        }
                        None => blob.data().to_vec(),
                    };
                    to_hash.push((i, data, entry.path.clone(), key));
                }
            }
        }

        let results: Arc<Mutex<Vec<(usize, ObjectHash)>>> = Arc::new(Mutex::new(Vec::new()));
        for (i, data, path, _) in &to_hash {
            let node = self.scheduler.add_node(Pool::Hashing);
            let git = Arc::clone(&self.git);
            let env = env.clone();
            let results = Arc::clone(&results);
            let i = *i;
            let path = path.clone();
            let data = data.clone();
            self.scheduler.set_work(node, move || {
                if let Ok(hash) = git.hash_object(&data, Some(path.as_str()), &env) {
                    results.lock().expect("hashing results mutex poisoned").push((i, hash));
                }
            });
            self.scheduler.ready(node);
        }
        self.scheduler.run_to_completion();

        for (i, hash) in results.lock().expect("hashing results mutex poisoned").iter() {
            resolved[*i] = Some(*hash);
        }
        for (i, _, _, key) in &to_hash {
            if let Some(hash) = resolved[*i] {
                self.sha1_cache.insert(*key, hash);
            }
        }

        let mut session = self.git.update_index(&env)?;
        for (i, entry) in stage.iter().enumerate() {
            match &entry.new {
                Some(obj) if obj.as_blob().is_some() => {
                    let hash = resolved[i].ok_or_else(|| {
                        crate::errors::ConvertError::GitSubprocessFailed(format!("no resolved git hash for \"{}\"", entry.path))
                    })?;
                    session.add(entry.mode, hash, &entry.path)?;
                }
                _ => session.delete(&entry.path)?,
            }
        }
        session.finish()?;
        let git_tree = self.git.write_tree(&env)?;

        let mut parent_entries: Vec<(branch::RevRef, ObjectHash)> = Vec::new();
        if let Some(p) = parent_commit {
            parent_entries.push(((branch_id, idx - 1), p));
        }
        for other_ref in self.branches[branch_id].revs[idx].parents.clone() {
            if let Some(commit) = self.branches.get(other_ref.0).and_then(|b| b.revs.get(other_ref.1)).and_then(|r| r.commit) {
                parent_entries.push((other_ref, commit));
            }
        }

        // Fast-forward rule (§4.4): for exactly two parents, drop the first
        // if the second's committed tree already matches what we just staged
        // and the first is recorded as merged through the second.
        if parent_entries.len() == 2 {
            let (first_ref, _) = parent_entries[0];
            let (second_ref, _) = parent_entries[1];
            let second_committed = self.branches.get(second_ref.0).and_then(|b| b.revs.get(second_ref.1)).and_then(|r| r.committed_git_tree);
            if second_committed == Some(git_tree) && self.is_ancestor_via_merges(first_ref, second_ref) {
                parent_entries.remove(0);
            }
        }

        let mut parents: Vec<ObjectHash> = Vec::new();
        for (_, commit) in parent_entries {
            if !parents.contains(&commit) {
                parents.push(commit);
            }
        }

        let message = self.compose_commit_message(branch_id, &props_list, &stage);
        let author = self.authors.map_author(&revision.author);
        let date = format!("{} +0000", revision.datetime.timestamp());
        let signature = Signature { name: &author.name, email: Some(&author.email), date: &date };
        let commit = self.git.commit_tree(git_tree, &parents, &message, signature, signature)?;

        let rev = &mut self.branches[branch_id].revs[idx];
        rev.staged_tree = Some(new_tree.clone());
        rev.staged_git_tree = Some(git_tree);
        rev.committed_git_tree = Some(git_tree);
        rev.committed_tree = Some(new_tree);
        rev.commit = Some(commit);
        rev.any_changes_present = true;
        rev.files_staged = stage.len() as u32;
        rev.props_list = Vec::new();
        Ok(())
    }

    /// Builds the commit-message material for one source revision, either
    /// from its own log text or from an explicit override (used when a
    /// skip-commit rule supplies a replacement message).
    fn make_revision_props(&self, revision: &Arc<HistoryRevision>, override_log: Option<Vec<String>>) -> RevisionProps {
        let author = self.authors.map_author(&revision.author);
        let date = format!("{} +0000", revision.datetime.timestamp());
        let log = override_log.unwrap_or_else(|| log_to_paragraphs(revision.log.trim()));
        RevisionProps { rev_ordinal: revision.rev_ordinal, rev_id: revision.rev_id.clone(), log, author, date }
    }

    /// Concatenates every combined/deferred revision's paragraphs, replacing
    /// a leading empty paragraph with an auto-generated change description
    /// and deduplicating immediate repeats (§4.4 Commit message composition).
    fn compose_commit_message(&self, branch_id: BranchId, props_list: &[RevisionProps], stage: &[StageEntry]) -> String {
        let mut paragraphs: Vec<String> = Vec::new();
        for (i, props) in props_list.iter().enumerate() {
            let mut these = props.log.clone();
            if i == 0 && these.first().map(|p| p.is_empty()).unwrap_or(true) {
                if these.first().map(|p| p.is_empty()).unwrap_or(false) {
                    these.remove(0);
                }
                let mut combined = summarize_change_description(&make_change_description(stage));
                combined.extend(these);
                these = combined;
            }
            for p in these {
                if paragraphs.last() != Some(&p) {
                    paragraphs.push(p);
                }
            }
        }
        if paragraphs.is_empty() {
            paragraphs.push("No message".to_string());
        }
        let mut message = paragraphs.join("\n\n");

        let branch = &self.branches[branch_id];
        for props in props_list {
            message = apply_edit_msg_rules(&branch.edit_msg_rules, props.rev_ordinal, &props.rev_id, message);
            message = apply_edit_msg_rules(&self.config.edit_msg_list, props.rev_ordinal, &props.rev_id, message);
        }
        message
    }

    /// Tags every branch exactly at `path`, or every branch nested under it;
    /// falls back to the nearest containing branch (§4.7).
    fn apply_label(&mut self, path: &str, label: &str, revision: &Arc<HistoryRevision>) -> Result<()> {
        let mut targets: Vec<BranchId> = self
            .branch_paths
            .items()
            .into_iter()
            .filter(|(p, _)| p == path || p.starts_with(&format!("{path}/")))
            .map(|(_, id)| *id)
            .collect();
        if targets.is_empty() {
            if let Some(id) = self.branch_paths.find_path(path, false) {
                targets.push(*id);
            }
        }

        let date = format!("{} +0000", revision.datetime.timestamp());
        for branch_id in targets {
            let branch = &self.branches[branch_id];
            let rev_idx = branch.head_index();
            let Some(commit) = branch.revs[rev_idx].commit else { continue };
            let tag_root = branch.labels_ref_root.clone().unwrap_or_else(|| "refs/tags".to_string());
            let tagname = format!("{tag_root}/{}", sanitize_ref_component(label));
            let tagger = Signature { name: "vss2git", email: None, date: &date };
            self.git.tag(&tagname, commit, &[format!("Label: {label}")], tagger)?;
        }
        Ok(())
    }

    /// Flushes the last buffered revision (§4.5), writes every live branch's
    /// HEAD commit to its refname, salvages deleted-but-unmerged branches
    /// under `<refname>_deleted@r<rev>`, and flushes the ref-update batch
    /// (§4.8).
    pub fn finish(&mut self, log: &dyn LogSink) -> Result<()> {
        if let Some(pending) = self.pending_input.take() {
            self.process_revision(log, pending)?;
        }

        for branch in &self.branches {
            if branch.deleted {
                if let Some(&last_idx) = branch.deleted_revs.last() {
                    if let Some(commit) = branch.revs[last_idx].commit {
                        let salvage = format!("{}_deleted@r{}", branch.refname, branch.revs[last_idx].rev_ordinal);
                        self.git.queue_update_ref(salvage, commit);
                    }
                }
                continue;
            }
            if let Some(commit) = branch.head().commit {
                self.git.queue_update_ref(branch.refname.clone(), commit);
            }
        }
        self.git.commit_refs_update()?;
        self.git.log_stats();
        if self.sha1_cache.is_dirty() {
            warn!("sha1 cache has unsaved entries; caller must persist it");
        }
        Ok(())
    }
}

/// A revision whose nodes are all `label` actions (or has no nodes at all).
fn is_labels_only(input: &RevisionInput) -> bool {
    input.nodes.iter().all(|n| n.action == Action::Label)
}

/// Whether two adjacent source revisions should be folded into one before
/// being applied (§4.5 Revision combining).
fn should_combine(prev: &RevisionInput, next: &RevisionInput) -> bool {
    if prev.author != next.author {
        return false;
    }
    let prev_log = prev.log.trim();
    let next_log = next.log.trim();
    let same_log_ok = (prev_log == next_log && !prev_log.is_empty()) || next_log.is_empty();
    if !same_log_ok {
        return false;
    }
    if (next.datetime - prev.datetime).num_seconds().unsigned_abs() > 2 {
        return false;
    }
    is_labels_only(prev) == is_labels_only(next)
}

/// Folds `next`'s nodes onto `prev`, keeping `prev`'s identity as the
/// surviving revision (copy references to `next` are aliased separately).
fn combine_inputs(mut prev: RevisionInput, next: RevisionInput) -> RevisionInput {
    prev.nodes.extend(next.nodes);
    if prev.log.trim().is_empty() {
        prev.log = next.log;
    }
    prev
}

/// True when `path` is `container` itself or nested under it.
fn path_under(container: &str, path: &str) -> bool {
    if container.is_empty() {
        return true;
    }
    path == container || path.starts_with(&format!("{container}/"))
}

/// First rule in `rules` whose revision range or explicit rev-id list
/// matches (§4.6 `skip_commit_list`).
fn skip_commit_match(rules: &[config::SkipCommitRule], rev_ordinal: u64, rev_id: &str) -> Option<&config::SkipCommitRule> {
    rules.iter().find(|r| {
        let rev_ok = r.revs.as_ref().map(|rs| rs.contains(rev_ordinal)).unwrap_or(false);
        let id_ok = r.rev_ids.iter().any(|id| id.as_str() == rev_id);
        rev_ok || id_ok
    })
}

/// Classifies a stagelist into added/deleted/changed, folding identical
/// content add+delete pairs into renames (§4.4 auto change description).
fn make_change_description(stage: &[StageEntry]) -> Vec<String> {
    let mut added: Vec<&str> = Vec::new();
    let mut deleted: Vec<&str> = Vec::new();
    let mut changed: Vec<&str> = Vec::new();
    for entry in stage {
        match (&entry.old, &entry.new) {
            (None, Some(_)) => added.push(&entry.path),
            (Some(_), None) => deleted.push(&entry.path),
            _ => changed.push(&entry.path),
        }
    }

    let mut renamed: Vec<(String, String)> = Vec::new();
    let mut added_remaining: Vec<&str> = Vec::new();
    'outer: for &a in &added {
        let a_hash = stage.iter().find(|e| e.path == a).and_then(|e| e.new.as_ref()).map(|o| o.hash());
        for &d in &deleted {
            let d_hash = stage.iter().find(|e| e.path == d).and_then(|e| e.old.as_ref()).map(|o| o.hash());
            if a_hash.is_some() && a_hash == d_hash {
                renamed.push((d.to_string(), a.to_string()));
                continue 'outer;
            }
        }
        added_remaining.push(a);
    }
    let renamed_sources: BTreeSet<&str> = renamed.iter().map(|(s, _)| s.as_str()).collect();
    let deleted_remaining: Vec<&str> = deleted.into_iter().filter(|d| !renamed_sources.contains(d)).collect();

    let mut lines = Vec::new();
    if !added_remaining.is_empty() {
        lines.push(format!("Added: {}", added_remaining.join(", ")));
    }
    if !deleted_remaining.is_empty() {
        lines.push(format!("Deleted: {}", deleted_remaining.join(", ")));
    }
    if !changed.is_empty() {
        lines.push(format!("Changed: {}", changed.join(", ")));
    }
    for (from, to) in &renamed {
        lines.push(format!("Renamed: {from} -> {to}"));
    }
    lines
}

/// One-line summary when it fits in 100 chars, else the itemized lines
/// verbatim (§4.4).
fn summarize_change_description(lines: &[String]) -> Vec<String> {
    if lines.is_empty() {
        return Vec::new();
    }
    let one_line = lines.join("; ");
    if one_line.chars().count() <= 100 {
        vec![one_line]
    } else {
        lines.to_vec()
    }
}

fn apply_edit_msg_rules(rules: &[config::EditMsgRule], rev_ordinal: u64, rev_id: &str, mut message: String) -> String {
    for rule in rules {
        if let Some(revs) = &rule.revs {
            if !revs.contains(rev_ordinal) {
                continue;
            }
        }
        if !rule.rev_ids.is_empty() && !rule.rev_ids.iter().any(|id| id.as_str() == rev_id) {
            continue;
        }
        let limit = if rule.max_sub == 0 { usize::MAX } else { rule.max_sub };
        message = rule.pattern.replacen(&message, limit, rule.replace.as_str()).into_owned();
        if rule.terminal {
            break;
        }
    }
    message
}

fn sanitize_ref_component(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_whitespace() || "~^:?*[\\".contains(c) { '-' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::Ranges;
    use chrono::TimeZone;

    fn revision_input(ordinal: u64, author: &str, log: &str, nodes: Vec<RevisionNode>) -> RevisionInput {
        RevisionInput {
            rev_ordinal: ordinal,
            rev_id: ordinal.to_string(),
            author: author.to_string(),
            datetime: chrono::Utc.timestamp_opt(1_000_000 + ordinal as i64, 0).unwrap(),
            log: log.to_string(),
            nodes,
        }
    }

    fn label_node(path: &str, label: &str) -> RevisionNode {
        RevisionNode {
            action: Action::Label,
            kind: Kind::None,
            path: path.to_string(),
            copyfrom_path: None,
            copyfrom_rev: None,
            text_content: None,
            label: Some(label.to_string()),
        }
    }

    fn change_node(path: &str) -> RevisionNode {
        RevisionNode {
            action: Action::Change,
            kind: Kind::File,
            path: path.to_string(),
            copyfrom_path: None,
            copyfrom_rev: None,
            text_content: None,
            label: None,
        }
    }

    #[test]
    fn test_should_combine_same_author_and_log_within_two_seconds() {
        let prev = revision_input(1, "alice", "Fixing the build", vec![change_node("a.c")]);
        let next = revision_input(2, "alice", "Fixing the build", vec![change_node("b.c")]);
        assert!(should_combine(&prev, &next));
    }

    #[test]
    fn test_should_combine_rejects_different_authors() {
        let prev = revision_input(1, "alice", "same", vec![change_node("a.c")]);
        let next = revision_input(2, "bob", "same", vec![change_node("b.c")]);
        assert!(!should_combine(&prev, &next));
    }

    #[test]
    fn test_should_combine_rejects_differing_nonempty_logs() {
        let prev = revision_input(1, "alice", "first message", vec![change_node("a.c")]);
        let next = revision_input(2, "alice", "second message", vec![change_node("b.c")]);
        assert!(!should_combine(&prev, &next));
    }

    #[test]
    fn test_should_combine_allows_next_with_empty_log() {
        let prev = revision_input(1, "alice", "first message", vec![change_node("a.c")]);
        let next = revision_input(2, "alice", "", vec![change_node("b.c")]);
        assert!(should_combine(&prev, &next));
    }

    #[test]
    fn test_should_combine_rejects_far_apart_timestamps() {
        let mut prev = revision_input(1, "alice", "same", vec![change_node("a.c")]);
        let mut next = revision_input(2, "alice", "same", vec![change_node("b.c")]);
        prev.datetime = chrono::Utc.timestamp_opt(1_000_000, 0).unwrap();
        next.datetime = chrono::Utc.timestamp_opt(1_000_010, 0).unwrap();
        assert!(!should_combine(&prev, &next));
    }

    #[test]
    fn test_should_combine_rejects_mixed_labels_only_with_content() {
        let prev = revision_input(1, "alice", "", vec![label_node("trunk", "v1")]);
        let next = revision_input(2, "alice", "", vec![change_node("b.c")]);
        assert!(!should_combine(&prev, &next));
    }

    #[test]
    fn test_is_labels_only_true_for_label_nodes_and_empty() {
        assert!(is_labels_only(&revision_input(1, "a", "", vec![])));
        assert!(is_labels_only(&revision_input(1, "a", "", vec![label_node("trunk", "v1")])));
        assert!(!is_labels_only(&revision_input(1, "a", "", vec![change_node("a.c")])));
    }

    #[test]
    fn test_combine_inputs_keeps_prev_identity_and_merges_nodes() {
        let prev = revision_input(1, "alice", "message", vec![change_node("a.c")]);
        let next = revision_input(2, "alice", "", vec![change_node("b.c")]);
        let combined = combine_inputs(prev, next);
        assert_eq!(combined.rev_ordinal, 1);
        assert_eq!(combined.nodes.len(), 2);
        assert_eq!(combined.log, "message");
    }

    #[test]
    fn test_combine_inputs_adopts_next_log_when_prev_empty() {
        let prev = revision_input(1, "alice", "", vec![change_node("a.c")]);
        let next = revision_input(2, "alice", "real message", vec![change_node("b.c")]);
        let combined = combine_inputs(prev, next);
        assert_eq!(combined.log, "real message");
    }

    #[test]
    fn test_path_under_matches_self_and_nested_but_not_sibling() {
        assert!(path_under("trunk", "trunk"));
        assert!(path_under("trunk", "trunk/sub"));
        assert!(!path_under("trunk", "trunk2"));
        assert!(path_under("", "anything"));
    }

    #[test]
    fn test_skip_commit_match_by_revision_range() {
        let rules = vec![config::SkipCommitRule { revs: Some(Ranges::from_sorted(vec![(5, 10)])), rev_ids: vec![], replacement_message: None }];
        assert!(skip_commit_match(&rules, 7, "r7").is_some());
        assert!(skip_commit_match(&rules, 20, "r20").is_none());
    }

    #[test]
    fn test_skip_commit_match_by_rev_id() {
        let rules = vec![config::SkipCommitRule { revs: None, rev_ids: vec!["abc123".to_string()], replacement_message: None }];
        assert!(skip_commit_match(&rules, 999, "abc123").is_some());
        assert!(skip_commit_match(&rules, 999, "other").is_none());
    }

    fn test_project_tree() -> ProjectTree {
        ProjectTree::new("/tmp/vss2git-core-test-repo", ProjectConfig::default(), AuthorMap::default(), Sha1Cache::default())
    }

    #[test]
    fn test_longest_prefix_branch_prefers_most_specific_path() {
        let mut tree = test_project_tree();
        tree.branches.push(Branch::new("trunk".to_string(), "refs/heads/trunk".to_string()));
        tree.branches.push(Branch::new("trunk/sub".to_string(), "refs/heads/sub".to_string()));
        assert_eq!(tree.longest_prefix_branch("trunk/sub/file.c"), Some(1));
        assert_eq!(tree.longest_prefix_branch("trunk/other.c"), Some(0));
        assert_eq!(tree.longest_prefix_branch("elsewhere/file.c"), None);
    }

    #[test]
    fn test_revision_index_for_finds_last_rev_at_or_before_ordinal() {
        let mut tree = test_project_tree();
        tree.branches.push(Branch::new("trunk".to_string(), "refs/heads/trunk".to_string()));
        let mut rev1 = branch::BranchRev::initial(0);
        rev1.rev_ordinal = 1;
        let mut rev3 = branch::BranchRev::initial(0);
        rev3.rev_ordinal = 3;
        let mut rev5 = branch::BranchRev::initial(0);
        rev5.rev_ordinal = 5;
        tree.branches[0].revs = vec![rev1, rev3, rev5];

        assert_eq!(tree.revision_index_for(0, &crate::history::RevRef::Ordinal(4)), Some(1));
        assert_eq!(tree.revision_index_for(0, &crate::history::RevRef::Ordinal(5)), Some(2));
        assert_eq!(tree.revision_index_for(0, &crate::history::RevRef::Ordinal(0)), None);
    }

    #[test]
    fn test_is_ancestor_via_merges_checks_recorded_merges() {
        let mut tree = test_project_tree();
        tree.branches.push(Branch::new("trunk".to_string(), "refs/heads/trunk".to_string()));
        tree.branches.push(Branch::new("branches/feature".to_string(), "refs/heads/feature".to_string()));
        tree.branches[0].revs[0].merged_revisions.insert((1, 0), ((1, 0), (0, 0)));

        assert!(tree.is_ancestor_via_merges((1, 0), (0, 0)));
        assert!(!tree.is_ancestor_via_merges((1, 1), (0, 0)));
    }

    fn blob_entry(path: &str, old: Option<&[u8]>, new: Option<&[u8]>) -> StageEntry {
        let mut store = ObjectStore::new();
        StageEntry {
            path: path.to_string(),
            old: old.map(|d| store.finalize_blob(Blob::new(d.to_vec(), Default::default()))),
            new: new.map(|d| store.finalize_blob(Blob::new(d.to_vec(), Default::default()))),
            mode: MODE_REGULAR,
        }
    }

    #[test]
    fn test_make_change_description_detects_rename_by_identical_content() {
        let stage = vec![blob_entry("old.c", Some(b"same"), None), blob_entry("new.c", None, Some(b"same"))];
        let lines = make_change_description(&stage);
        assert!(lines.iter().any(|l| l == "Renamed: old.c -> new.c"));
        assert!(!lines.iter().any(|l| l.starts_with("Added")));
        assert!(!lines.iter().any(|l| l.starts_with("Deleted")));
    }

    #[test]
    fn test_make_change_description_separates_added_deleted_changed() {
        let stage = vec![
            blob_entry("a.c", None, Some(b"x")),
            blob_entry("b.c", Some(b"y"), None),
            blob_entry("c.c", Some(b"1"), Some(b"2")),
        ];
        let lines = make_change_description(&stage);
        assert!(lines.contains(&"Added: a.c".to_string()));
        assert!(lines.contains(&"Deleted: b.c".to_string()));
        assert!(lines.contains(&"Changed: c.c".to_string()));
    }

    #[test]
    fn test_summarize_joins_short_description_on_one_line() {
        let lines = vec!["Added: a.c".to_string(), "Deleted: b.c".to_string()];
        let summary = summarize_change_description(&lines);
        assert_eq!(summary, vec!["Added: a.c; Deleted: b.c".to_string()]);
    }

    #[test]
    fn test_summarize_keeps_itemized_when_too_long() {
        let long_path = "a".repeat(90);
        let lines = vec![format!("Added: {long_path}"), "Deleted: b.c".to_string()];
        let summary = summarize_change_description(&lines);
        assert_eq!(summary, lines);
    }

    #[test]
    fn test_sanitize_ref_component_replaces_disallowed_chars() {
        assert_eq!(sanitize_ref_component("release 1.0"), "release-1.0");
        assert_eq!(sanitize_ref_component("a:b~c"), "a-b-c");
    }
}
