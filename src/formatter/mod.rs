//! C-family reindentation and whitespace normalisation (§4.5 Formatter).
//!
//! Ported from the original tool's line-oriented indent engine. Leading
//! whitespace on each logical line is recomputed from brace/paren/label
//! nesting; everything else in the line — comments, string and character
//! literals, preprocessor directives — passes through byte-for-byte. A
//! "logical line" is one or more physical lines joined by a trailing `\`
//! continuation.

mod line;
mod parser;
mod preprocessor;
mod token;

pub use self::line::{LineIndent, ParsedLine};
pub use self::parser::ContinuationPolicy;

use self::parser::Parser;
use self::preprocessor::PreState;
use crate::hash::ObjectHash;

/// Bumped whenever the reindent engine's own logic changes, so a cached
/// `git_sha1` from an older build of this crate is never reused (§4.4,
/// mirroring the original's self-file SHA-1 invalidation trick).
const ENGINE_VERSION: &str = "vss2git-formatter-v1";

/// Tunables mirroring the original CLI's `--style`/`--tab-size`/
/// `--indent-size`/`--trim-whitespace`/`--fix-eols` flags (§4.5, §6.2).
#[derive(Debug, Clone)]
pub struct FormatConfig {
    pub tab_size: u32,
    pub indent_size: u32,
    /// `true` emits tabs (each worth `tab_size` columns) for whole-tab-widths
    /// of indent, falling back to spaces for the remainder; `false` emits
    /// spaces only.
    pub tabs: bool,
    pub trim_trailing_whitespace: bool,
    /// Rewrites lone `\r` line separators (not part of `\r\n`) into `\n`.
    pub fix_eol: bool,
    /// Skips reindentation entirely; trimming/EOL-fixing can still apply.
    pub skip_indent_format: bool,
    /// Which of the three continuation-indent policies (§4.9) governs a
    /// logical line that starts inside an still-open `(`/`[`/template `<`.
    pub continuation_policy: ContinuationPolicy,
    /// `smart`'s cutoff: beyond this column, align to a fixed indent step
    /// instead of the opening token's column.
    pub max_to_parenthesis: u32,
}

impl Default for FormatConfig {
    fn default() -> FormatConfig {
        FormatConfig {
            tab_size: 4,
            indent_size: 4,
            tabs: true,
            trim_trailing_whitespace: false,
            fix_eol: false,
            skip_indent_format: false,
            continuation_policy: ContinuationPolicy::None,
            max_to_parenthesis: 40,
        }
    }
}

/// A non-fatal issue surfaced while reformatting (§7): a stray CR, or a
/// preprocessor conditional whose nesting doesn't balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatWarning {
    pub line: u64,
    pub message: String,
}

/// Reformats `data` per `config`, returning the rewritten bytes and any
/// warnings raised along the way. Never fails: content the tokenizer can't
/// make sense of is passed through with its existing indentation kept.
pub fn format_bytes(data: &[u8], config: &FormatConfig) -> (Vec<u8>, Vec<FormatWarning>) {
    let mut warnings = Vec::new();
    let raw_lines = split_lines(data, config.fix_eol, &mut warnings);

    if config.skip_indent_format {
        let mut out = Vec::with_capacity(data.len());
        for raw in &raw_lines {
            if config.trim_trailing_whitespace {
                let parsed = ParsedLine::parse(raw, config.tab_size);
                out.extend_from_slice(&parsed.render(config, ParsedLine::KEEP_CURRENT_NO_RETAB));
            } else {
                out.extend_from_slice(raw);
            }
        }
        return (out, warnings);
    }

    let mut parser = Parser::new(config.indent_size, config.continuation_policy, config.max_to_parenthesis);
    let mut pre_state = PreState::new();
    let mut out = Vec::with_capacity(data.len());
    let mut line_num: u64 = 1;

    for group_raw in group_continuations(&raw_lines) {
        let mut group: Vec<ParsedLine> = group_raw.iter().map(|raw| ParsedLine::parse(raw, config.tab_size)).collect();
        pre_state.parse_group(&group, &mut parser);
        pre_state.finalize_group(&mut group, &mut parser, config, line_num, &mut warnings);

        for (i, parsed) in group.iter().enumerate() {
            let indent = if i == 0 { parsed.indent } else { ParsedLine::KEEP_CURRENT_NO_RETAB };
            out.extend_from_slice(&parsed.render(config, indent));
        }
        line_num += group.len() as u64;
    }

    (out, warnings)
}

/// Splits `data` on `\n`, keeping the terminator attached to each line, and
/// optionally folding lone `\r` separators into `\n` first (§4.5 `fix_eol`).
fn split_lines(data: &[u8], fix_eol: bool, warnings: &mut Vec<FormatWarning>) -> Vec<Vec<u8>> {
    let normalized: std::borrow::Cow<[u8]> = if fix_eol { fold_stray_cr(data, warnings) } else { std::borrow::Cow::Borrowed(data) };

    let mut lines = Vec::new();
    let mut start = 0;
    let bytes = normalized.as_ref();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            lines.push(bytes[start..=i].to_vec());
            start = i + 1;
        }
    }
    if start < bytes.len() {
        lines.push(bytes[start..].to_vec());
    }
    lines
}

fn fold_stray_cr<'a>(data: &'a [u8], warnings: &mut Vec<FormatWarning>) -> std::borrow::Cow<'a, [u8]> {
    if !data.contains(&b'\r') {
        return std::borrow::Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    let mut line_num: u64 = 1;
    while i < data.len() {
        let b = data[i];
        if b == b'\r' {
            if data.get(i + 1) == Some(&b'\n') {
                out.push(b'\r');
                out.push(b'\n');
                i += 2;
                line_num += 1;
                continue;
            }
            warnings.push(FormatWarning { line: line_num, message: "contains a stray CR character".to_string() });
            out.push(b'\n');
            i += 1;
            line_num += 1;
            continue;
        }
        if b == b'\n' {
            line_num += 1;
        }
        out.push(b);
        i += 1;
    }
    std::borrow::Cow::Owned(out)
}

/// Groups physical lines joined by a trailing unescaped `\` continuation
/// into one logical line each.
fn group_continuations(lines: &[Vec<u8>]) -> Vec<Vec<Vec<u8>>> {
    let mut groups = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    for line in lines {
        let continues = ends_with_continuation(line);
        current.push(line.clone());
        if !continues {
            groups.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn ends_with_continuation(line: &[u8]) -> bool {
    let trimmed = strip_eol(line);
    trimmed.last() == Some(&b'\\')
}

fn strip_eol(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && line[end - 1] == b'\r' {
            end -= 1;
        }
    }
    &line[..end]
}

/// Human-readable rendering of the settings that affect output bytes (ported
/// from the original's `get_style_str`); used both for cache-key diagnostics
/// and as an extra blob-hash memoisation input alongside [`config_sha1`].
pub fn style_tag(config: &FormatConfig) -> String {
    let width = if config.tabs { format!("tabs{}", config.tab_size) } else { format!("spaces{}", config.indent_size) };
    let mut tag = format!("{width}-indent{}", config.indent_size);
    if config.trim_trailing_whitespace {
        tag.push_str("-trim");
    }
    if config.fix_eol {
        tag.push_str("-fixeol");
    }
    if config.skip_indent_format {
        tag.push_str("-noindent");
    }
    tag
}

/// Hashes the engine version plus every setting that changes output bytes,
/// so a blob-hash cache entry keyed on this is invalidated whenever either
/// the engine logic or a branch's format settings change.
pub fn config_sha1(config: &FormatConfig) -> ObjectHash {
    ObjectHash::of_chunks([ENGINE_VERSION.as_bytes(), style_tag(config).as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_str(src: &str, config: &FormatConfig) -> String {
        String::from_utf8(format_bytes(src.as_bytes(), config).0).unwrap()
    }

    #[test]
    fn test_reindents_nested_braces() {
        let src = "void f() {\nif (x) {\nreturn;\n}\n}\n";
        let config = FormatConfig { tabs: false, ..Default::default() };
        let out = format_str(src, &config);
        assert_eq!(out, "void f() {\n    if (x) {\n        return;\n    }\n}\n");
    }

    #[test]
    fn test_keeps_string_literal_braces_out_of_nesting() {
        let src = "void f() {\nchar *s = \"{\";\nreturn;\n}\n";
        let config = FormatConfig { tabs: false, ..Default::default() };
        let out = format_str(src, &config);
        assert_eq!(out, "void f() {\n    char *s = \"{\";\n    return;\n}\n");
    }

    #[test]
    fn test_line_continuation_keeps_own_whitespace() {
        let src = "int x = 1 + \\\n    2;\n";
        let config = FormatConfig { tabs: false, ..Default::default() };
        let out = format_str(src, &config);
        assert_eq!(out, "int x = 1 + \\\n    2;\n");
    }

    #[test]
    fn test_mismatched_preprocessor_nesting_warns() {
        let src = "void f() {\n#if X\n}\n#endif\n";
        let config = FormatConfig::default();
        let (_, warnings) = format_bytes(src.as_bytes(), &config);
        assert!(warnings.iter().any(|w| w.message.contains("mismatched nesting")));
    }

    #[test]
    fn test_trim_trailing_whitespace_without_reindent() {
        let src = "int x;   \nint y;\t\n";
        let config = FormatConfig { skip_indent_format: true, trim_trailing_whitespace: true, ..Default::default() };
        let out = format_str(src, &config);
        assert_eq!(out, "int x;\nint y;\n");
    }

    #[test]
    fn test_fix_eol_folds_stray_cr() {
        let src = b"a\rb\n";
        let config = FormatConfig { skip_indent_format: true, fix_eol: true, ..Default::default() };
        let (out, warnings) = format_bytes(src, &config);
        assert_eq!(out, b"a\nb\n");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_case_label_dedents_one_level() {
        let src = "switch (x) {\ncase 1:\nbreak;\n}\n";
        let config = FormatConfig { tabs: false, ..Default::default() };
        let out = format_str(src, &config);
        assert_eq!(out, "switch (x) {\ncase 1:\n    break;\n}\n");
    }
}
