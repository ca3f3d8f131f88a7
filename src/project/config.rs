//! Project configuration: path-mapping rules and per-branch policy (§4.3, §6.2).

use regex::Regex;

use crate::errors::{ConvertError, Result};
use crate::formatter::FormatConfig;
use crate::ranges::Ranges;

/// Gates the reindenting formatter to paths matching `file_pattern`,
/// evaluated in declaration order — first match wins (§4.9).
#[derive(Debug, Clone)]
pub struct FormatSpec {
    pub file_pattern: glob::Pattern,
    pub config: FormatConfig,
}

/// A fixed blob forced into the tree on first non-empty commit and removed
/// on return to empty (§4.6 `inject_files`).
#[derive(Debug, Clone)]
pub struct InjectFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// One ordered regex substitution applied to a commit's log text (§4.6 `edit_msg_rules`).
#[derive(Debug, Clone)]
pub struct EditMsgRule {
    pub revs: Option<Ranges>,
    pub rev_ids: Vec<String>,
    pub pattern: Regex,
    pub replace: String,
    pub max_sub: usize,
    pub terminal: bool,
}

/// Defers a commit to the next revision unless a tree change forces it (§4.6 `skip_commit_rules`).
#[derive(Debug, Clone)]
pub struct SkipCommitRule {
    pub revs: Option<Ranges>,
    pub rev_ids: Vec<String>,
    pub replacement_message: Option<String>,
}

/// One `<MapPath>` entry: an ordered globspec deciding whether (and how) a
/// directory becomes a branch (§4.3).
#[derive(Debug, Clone)]
pub struct MapPathRule {
    pub pattern: glob::Pattern,
    /// `None`/empty means this rule blocks branch creation outright.
    pub refname_template: Option<String>,
    pub revisions: Option<Ranges>,
    pub labels_ref_root: Option<String>,
    pub delete_if_merged: bool,
    pub inject_files: Vec<InjectFile>,
    pub ignore_files: Vec<Regex>,
    pub format_specifications: Vec<FormatSpec>,
    pub edit_msg_rules: Vec<EditMsgRule>,
    pub skip_commit_rules: Vec<SkipCommitRule>,
}

impl MapPathRule {
    pub fn matches(&self, path: &str) -> bool {
        self.pattern.matches(path)
    }

    /// Renders `refname_template`, substituting `*` in the pattern for the
    /// matched path's final component — the common VSS-to-Git branch-naming
    /// idiom (`$/project/*` -> `refs/heads/*`).
    pub fn render_refname(&self, path: &str) -> Option<String> {
        let template = self.refname_template.as_ref()?;
        if template.is_empty() {
            return None;
        }
        let leaf = path.rsplit('/').next().unwrap_or(path);
        Some(template.replace('*', leaf))
    }
}

/// Whole-project policy plus the ordered list of path-mapping rules.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    pub rules: Vec<MapPathRule>,
    pub ignore_files: Vec<Regex>,
    pub format_specifications: Vec<FormatSpec>,
    pub edit_msg_list: Vec<EditMsgRule>,
    pub skip_commit_list: Vec<SkipCommitRule>,
    pub append_to_refs: Vec<glob::Pattern>,
    pub prune_refs: Vec<glob::Pattern>,
    pub decorate_revision_id: bool,
    pub change_id_tag: bool,
    pub empty_placeholder_name: Option<String>,
    pub empty_placeholder_content: Vec<u8>,
    /// Destination root for `extract` revision nodes (§4.2, §6.5).
    pub extract_root: Option<std::path::PathBuf>,
}

impl ProjectConfig {
    /// First matching rule in declaration order (§4.3: "ordered globspec rules").
    pub fn match_path(&self, path: &str) -> Option<&MapPathRule> {
        self.rules.iter().find(|r| r.matches(path))
    }

    /// First project-wide format specification matching `path`, in
    /// declaration order.
    pub fn match_format(&self, path: &str) -> Option<&FormatConfig> {
        match_format_specs(&self.format_specifications, path)
    }

    pub fn compile_regex(pattern: &str) -> Result<Regex> {
        Regex::new(pattern).map_err(|e| ConvertError::InvalidConfig(format!("invalid regex `{pattern}`: {e}")))
    }

    pub fn compile_glob(pattern: &str) -> Result<glob::Pattern> {
        glob::Pattern::new(pattern).map_err(|e| ConvertError::InvalidConfig(format!("invalid glob `{pattern}`: {e}")))
    }
}

/// First format spec in `specs` whose `file_pattern` matches `path`.
pub fn match_format_specs<'a>(specs: &'a [FormatSpec], path: &str) -> Option<&'a FormatConfig> {
    specs.iter().find(|s| s.file_pattern.matches(path)).map(|s| &s.config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, refname: &str) -> MapPathRule {
        MapPathRule {
            pattern: glob::Pattern::new(pattern).unwrap(),
            refname_template: Some(refname.to_string()),
            revisions: None,
            labels_ref_root: None,
            delete_if_merged: false,
            inject_files: Vec::new(),
            ignore_files: Vec::new(),
            format_specifications: Vec::new(),
            edit_msg_rules: Vec::new(),
            skip_commit_rules: Vec::new(),
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let config = ProjectConfig {
            rules: vec![rule("trunk", "refs/heads/main"), rule("*", "refs/heads/*")],
            ..Default::default()
        };
        assert_eq!(config.match_path("trunk").unwrap().render_refname("trunk"), Some("refs/heads/main".to_string()));
        assert_eq!(config.match_path("branches/foo").and_then(|r| r.render_refname("branches/foo")), None);
    }

    #[test]
    fn test_empty_refname_blocks_branch_creation() {
        let mut r = rule("vendor/*", "");
        r.refname_template = Some(String::new());
        assert_eq!(r.render_refname("vendor/x"), None);
    }

    #[test]
    fn test_refname_template_substitutes_leaf() {
        let r = rule("branches/*", "refs/heads/*");
        assert_eq!(r.render_refname("branches/feature-a"), Some("refs/heads/feature-a".to_string()));
    }
}
