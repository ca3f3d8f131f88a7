//! Drives the tokenizer and pushdown parser across one logical line at a
//! time: strips comments while tracking whether a `/* */` comment is still
//! open across lines, recognises preprocessor directives and feeds them to
//! the parser's state-snapshot machinery, and otherwise tokenizes the
//! line's content and walks it through `Parser::feed` to compute this
//! line's indent (ported from the original's `pre_parsing_state`).

use super::line::{LineIndent, ParsedLine};
use super::parser::{Parser, PpSnapshot};
use super::token::{tokenize, Token};
use super::{FormatConfig, FormatWarning};

pub struct PreState {
    comment_open: bool,
    /// Leading whitespace and indent delta recorded from the line that
    /// opened the still-open comment, so a continuation line reindents by
    /// the same amount (§4.9 Comment policy: "the leading whitespace of a
    /// continuing comment is adjusted by the same delta as the first line").
    comment_indent_ws: Option<Vec<u8>>,
    comment_indent_adjustment: i32,
    if_stack: Vec<(u64, PpSnapshot)>,
}

impl PreState {
    pub fn new() -> PreState {
        PreState { comment_open: false, comment_indent_ws: None, comment_indent_adjustment: 0, if_stack: Vec::new() }
    }

    /// Reserved for state that needs to be gathered before `finalize_group`
    /// commits indent decisions; currently all work happens in one pass.
    pub fn parse_group(&mut self, _group: &[ParsedLine], _parser: &mut Parser) {}

    pub fn finalize_group(
        &mut self,
        group: &mut [ParsedLine],
        parser: &mut Parser,
        config: &FormatConfig,
        line_num: u64,
        warnings: &mut Vec<FormatWarning>,
    ) {
        if group.is_empty() {
            return;
        }

        let first_rest = group[0].content().to_vec();
        let first_token_at = first_rest.iter().position(|&b| b != b' ' && b != b'\t');

        if !self.comment_open {
            if let Some(start) = first_token_at {
                if first_rest[start] == b'#' {
                    self.handle_directive(&first_rest[start..], parser, line_num, warnings);
                    return;
                }
            }
        }

        let starts_with_open_comment = self.comment_open;
        let (clean, ends_with_open_comment) = self.strip_comments(&join_all(group));
        let ws_width = group[0].whitespace_width(config.tab_size);

        if starts_with_open_comment {
            group[0].indent = self.continuing_comment_indent(parser, &group[0], ws_width);
            self.comment_open = ends_with_open_comment;
            return;
        }

        if clean.is_empty() {
            // Whitespace-only or fully-commented line: nothing to reindent.
            self.comment_open = ends_with_open_comment;
            return;
        }

        let is_case_or_default = starts_with_case_or_default(&clean);
        let leading_close_braces = count_leading_close_braces(&clean);

        parser.init_new_line();
        let (toks, _) = tokenize(&clean);
        for tok in &toks {
            parser.feed(&tok.kind, tok.column);
        }

        let level = parser.get_line_indent(is_case_or_default, leading_close_braces, false);

        if parser.expr_depth() > 0 && !is_case_or_default && leading_close_braces == 0 {
            if let Some(w) = parser.continuation_indent(ws_width) {
                group[0].indent = LineIndent::Width(w);
                self.comment_open = ends_with_open_comment;
                return;
            }
        }

        group[0].indent = LineIndent::Level(level);
        if ends_with_open_comment {
            let rendered_width = if config.tabs { level.max(0) as u32 * config.tab_size } else { level.max(0) as u32 * config.indent_size };
            self.comment_indent_ws = Some(group[0].leading_whitespace().to_vec());
            self.comment_indent_adjustment = ws_width as i32 - rendered_width as i32;
        }
        self.comment_open = ends_with_open_comment;
    }

    /// Mirrors `pre_parsing_state.get_line_indent`'s `starts_with_open_comment`
    /// branch: a continuation line of a still-open comment keeps its own
    /// indentation unless it shares the opening line's whitespace prefix, in
    /// which case it's shifted by the same delta the opening line was.
    fn continuing_comment_indent(&self, parser: &Parser, line: &ParsedLine, ws_width: u32) -> LineIndent {
        if parser.open_braces() == 0 || ws_width == 0 {
            return LineIndent::KeepCurrent;
        }
        let Some(prefix) = &self.comment_indent_ws else {
            return LineIndent::KeepCurrent;
        };
        if !line.leading_whitespace().starts_with(prefix.as_slice()) {
            return LineIndent::KeepCurrent;
        }
        let shifted = ws_width as i32 - self.comment_indent_adjustment;
        LineIndent::Width(shifted.max(0) as u32)
    }

    fn handle_directive(&mut self, rest: &[u8], parser: &mut Parser, line_num: u64, warnings: &mut Vec<FormatWarning>) {
        let after_hash = &rest[1..];
        let ws = after_hash.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
        let kw = &after_hash[ws..];

        if starts_with_keyword(kw, b"ifdef") || starts_with_keyword(kw, b"ifndef") || starts_with_keyword(kw, b"if") {
            let snap = parser.save_state(rest, None);
            self.if_stack.push((line_num, snap));
        } else if starts_with_keyword(kw, b"elif") || starts_with_keyword(kw, b"else") {
            if let Some((started_at, prev)) = self.if_stack.pop() {
                let snap = parser.save_state(rest, Some(&prev));
                parser.restore_state(&prev);
                self.if_stack.push((started_at, snap));
            }
        } else if starts_with_keyword(kw, b"endif") {
            match self.if_stack.pop() {
                Some((_, prev)) => {
                    let mismatched = (prev.restore_c_state.is_truthy() && prev.open_parens != parser.open_parens())
                        || (!prev.ignore_nesting_change && prev.open_braces != parser.open_braces());
                    if mismatched {
                        warnings.push(FormatWarning {
                            line: line_num,
                            message: format!("a preprocessor conditional construct in line {line_num} makes mismatched nesting level"),
                        });
                    }
                    parser.restore_state(&prev);
                }
                None => warnings.push(FormatWarning { line: line_num, message: "#endif with no matching #if".to_string() }),
            }
        }
    }

    /// Strips `//` and `/* */` comments from `content`, honouring a comment
    /// already open from a previous line; returns the cleaned bytes (with
    /// string/char literals left intact, since the tokenizer itself skips
    /// over them) and whether a block comment is still open at the end.
    fn strip_comments(&mut self, content: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::with_capacity(content.len());
        let mut i = 0;
        let mut comment_open = self.comment_open;
        let mut in_string: Option<u8> = None;

        while i < content.len() {
            if comment_open {
                match find(content, i, b"*/") {
                    Some(pos) => {
                        i = pos + 2;
                        comment_open = false;
                    }
                    None => return (out, true),
                }
                continue;
            }

            let b = content[i];

            if let Some(q) = in_string {
                out.push(b);
                if b == b'\\' {
                    if let Some(&next) = content.get(i + 1) {
                        out.push(next);
                    }
                    i += 2;
                    continue;
                }
                if b == q {
                    in_string = None;
                }
                i += 1;
                continue;
            }

            if b == b'/' && content.get(i + 1) == Some(&b'*') {
                comment_open = true;
                i += 2;
                continue;
            }
            if b == b'/' && content.get(i + 1) == Some(&b'/') {
                break;
            }
            if b == b'"' || b == b'\'' {
                in_string = Some(b);
            }
            out.push(b);
            i += 1;
        }

        (out, comment_open)
    }
}

fn join_all(group: &[ParsedLine]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in group {
        out.extend_from_slice(line.content());
    }
    out
}

fn find(content: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= content.len() || needle.is_empty() {
        return None;
    }
    content[from..].windows(needle.len()).position(|w| w == needle).map(|p| p + from)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn starts_with_keyword(rest: &[u8], kw: &[u8]) -> bool {
    if rest.len() < kw.len() || &rest[..kw.len()] != kw {
        return false;
    }
    match rest.get(kw.len()) {
        None => true,
        Some(&b) => !is_ident_byte(b),
    }
}

fn starts_with_case_or_default(content: &[u8]) -> bool {
    let start = content.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(content.len());
    let rest = &content[start..];
    starts_with_keyword(rest, b"case") || starts_with_keyword(rest, b"default")
}

fn count_leading_close_braces(content: &[u8]) -> u32 {
    let mut i = content.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(content.len());
    let mut count = 0;
    loop {
        match content.get(i) {
            Some(b'}') => {
                count += 1;
                i += 1;
            }
            Some(b' ') | Some(b'\t') => i += 1,
            _ => break,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_keyword_rejects_longer_identifier() {
        assert!(!starts_with_keyword(b"ifdef FOO", b"if"));
        assert!(starts_with_keyword(b"ifdef FOO", b"ifdef"));
    }

    #[test]
    fn test_starts_with_case_or_default() {
        assert!(starts_with_case_or_default(b"case 1:"));
        assert!(starts_with_case_or_default(b"default:"));
        assert!(!starts_with_case_or_default(b"careful();"));
    }

    #[test]
    fn test_count_leading_close_braces() {
        assert_eq!(count_leading_close_braces(b"}} foo"), 2);
        assert_eq!(count_leading_close_braces(b"foo()"), 0);
    }

    #[test]
    fn test_strip_comments_keeps_open_across_lines() {
        let mut s = PreState::new();
        let (clean, open) = s.strip_comments(b"int x; /* start");
        assert_eq!(clean, b"int x; ");
        assert!(open);
        s.comment_open = true;
        let (clean2, open2) = s.strip_comments(b"still comment */ int y;");
        assert_eq!(clean2, b" int y;");
        assert!(!open2);
    }

    #[test]
    fn test_strip_comments_leaves_string_contents_untouched() {
        let mut s = PreState::new();
        let (clean, open) = s.strip_comments(br#"char *s = "// not a comment";"#);
        assert_eq!(clean, br#"char *s = "// not a comment";"#);
        assert!(!open);
    }
}
