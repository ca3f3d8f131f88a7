//! One physical line split into leading whitespace, content, and EOL, with
//! enough state to re-render it at a freshly computed indent level or leave
//! it exactly as authored (ported from the original's `parse_line`/`make_line`).

use super::FormatConfig;

/// How a line's leading whitespace should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineIndent {
    /// Leave this line's original leading whitespace untouched.
    KeepCurrent,
    /// Leave this line untouched and don't even apply trailing-whitespace
    /// trimming to it (used for continuation lines of a logical line whose
    /// first physical line alone carries the computed indent).
    KeepCurrentNoRetab,
    /// A nesting-level count; rendered as `level` tabs or `level *
    /// indent_size` spaces.
    Level(i32),
    /// An exact column width, bypassing `indent_size` — used by the
    /// `smart`/`extend` continuation-indent policies, which align to a
    /// specific opening-token column rather than a nesting level (§4.9).
    Width(u32),
}

pub struct ParsedLine {
    leading_ws: Vec<u8>,
    rest: Vec<u8>,
    eol: Vec<u8>,
    pub indent: LineIndent,
}

impl ParsedLine {
    pub const KEEP_CURRENT: LineIndent = LineIndent::KeepCurrent;
    pub const KEEP_CURRENT_NO_RETAB: LineIndent = LineIndent::KeepCurrentNoRetab;

    pub fn parse(raw: &[u8], _tab_size: u32) -> ParsedLine {
        let (content, eol) = split_eol(raw);
        let ws_len = content.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
        ParsedLine {
            leading_ws: content[..ws_len].to_vec(),
            rest: content[ws_len..].to_vec(),
            eol: eol.to_vec(),
            indent: LineIndent::KeepCurrentNoRetab,
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.rest
    }

    pub fn leading_whitespace(&self) -> &[u8] {
        &self.leading_ws
    }

    pub fn whitespace_width(&self, tab_size: u32) -> u32 {
        let mut width = 0u32;
        for &b in &self.leading_ws {
            if b == b' ' {
                width += 1;
            } else if b == b'\t' {
                width += tab_size - width % tab_size;
            }
        }
        width
    }

    pub fn render(&self, config: &FormatConfig, indent: LineIndent) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leading_ws.len() + self.rest.len() + self.eol.len());

        if self.rest.is_empty() {
            if !config.trim_trailing_whitespace {
                out.extend_from_slice(&self.leading_ws);
            }
            out.extend_from_slice(&self.eol);
            return out;
        }

        let rest: &[u8] = if config.trim_trailing_whitespace && !ends_with_continuation(&self.rest) {
            trim_trailing_ws(&self.rest)
        } else {
            &self.rest
        };

        match indent {
            LineIndent::KeepCurrent | LineIndent::KeepCurrentNoRetab => out.extend_from_slice(&self.leading_ws),
            LineIndent::Level(level) => out.extend_from_slice(&make_indent(level.max(0) as u32, config)),
            LineIndent::Width(width) => out.extend_from_slice(&vec![b' '; width as usize]),
        }
        out.extend_from_slice(rest);
        out.extend_from_slice(&self.eol);
        out
    }
}

fn split_eol(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
    }
    (&raw[..end], &raw[end..])
}

fn ends_with_continuation(rest: &[u8]) -> bool {
    rest.last() == Some(&b'\\')
}

fn trim_trailing_ws(rest: &[u8]) -> &[u8] {
    let mut end = rest.len();
    while end > 0 && (rest[end - 1] == b' ' || rest[end - 1] == b'\t') {
        end -= 1;
    }
    &rest[..end]
}

fn make_indent(level: u32, config: &FormatConfig) -> Vec<u8> {
    if config.tabs {
        vec![b'\t'; level as usize]
    } else {
        vec![b' '; (level * config.indent_size) as usize]
    }
}
