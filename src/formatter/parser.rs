//! Pushdown parser state machine driving indent decisions (§4.9 Parser
//! state machine / Expression stack / Block stack / Continuation indent
//! policy). Ported from the original's `c_parser_state.get_line_indent`
//! arithmetic, generalised so the "what construct are we inside" question
//! is answered by an explicit named-state stack and per-frame expression/
//! block records instead of the original's flat brace/paren counters alone.

use super::token::Token;

/// One of the grammar contexts the parser can be inside. Transitions follow
/// C/C++ far enough to choose an indent and a continuation column, not to
/// type-check or fully parse the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Initial,
    Expression,
    Assignment,
    Declaration,
    EnumDeclaration,
    Function,
    PostArguments,
    MembersInitList,
    Arguments,
    Label,
    If,
    Else,
    While,
    For,
    Switch,
    PostSwitch,
    SwitchBody,
    PostCase,
    DefaultLabel,
    PendingWhile,
    DoWhile,
    Try,
    Catch,
    PostTry,
    MsvcTry,
    MsvcExcept,
    MsvcFinally,
    Namespace,
    Template,
    TemplateArgs,
    Asm,
    AsmStatement,
    AsmBlock,
}

/// §4.9 "three selectable continuation-indent policies".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationPolicy {
    /// Preserve the line's authored indentation verbatim.
    None,
    /// Align to the opening token's column when that fits within
    /// `max_to_parenthesis`; otherwise fall back to one indent step.
    Smart,
    /// Round up to at least the current whitespace width.
    Extend,
}

/// A frame pushed by `(`, `[`, a template `<`, or a brace-initializer `{`:
/// the column continuation lines may align to, how much this frame adds to
/// the reported indent level, and the statement-open flag the opener saw
/// (restored when the frame closes, matching the original's "close_statement
/// resets open_parens" behaviour scoped to one frame at a time).
#[derive(Debug, Clone)]
pub struct ExpressionFrame {
    pub opener: Token,
    pub column: u32,
    pub indent_increment: i32,
    pub pre_statement_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A brace that only groups statements (a bare `{ }`, an initializer).
    Plain,
    /// A brace that is the body of a composite statement; `state` is what
    /// was on top of the state stack when the brace opened (so `pop_block`
    /// can tell whether the body ran on the same line as its header).
    Composite(ParserState),
}

#[derive(Debug, Clone)]
pub struct BlockFrame {
    pub kind: BlockKind,
    pub nesting_adjustment: i32,
    pub open_braces: i32,
}

/// Mirrors the original's `restore_c_state` tri-state: an ordinary
/// `#if`/`#ifdef`/`#ifndef` (condition unknown to the tool) restores
/// unconditionally at every following `#elif`/`#else`/`#endif` (`All`); a
/// condition the tool DOES know the truth of (`#if 0`, `#if 1`, the
/// `__cplusplus` family) restores only on the branch side recorded by `Yes`,
/// and `#else` flips `Yes`/`No` since exactly one side is ever "real".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreCState {
    All,
    Yes,
    No,
}

impl RestoreCState {
    pub fn is_truthy(self) -> bool {
        !matches!(self, RestoreCState::No)
    }
}

/// Snapshot of everything a `#if`/`#ifdef`/`#ifndef` conditional must be
/// able to restore at `#else`/`#elif`/`#endif` (§4.9 Preprocessor handling).
#[derive(Debug, Clone)]
pub struct PpSnapshot {
    pub ignore_nesting_change: bool,
    pub restore_c_state: RestoreCState,
    pub open_braces: i32,
    pub open_parens: i32,
    pub statement_open: bool,
    pub prev_statement_open: bool,
    pub ternary_open: i32,
    pub next_level_adjustment: i32,
    pub nesting_adjustment: i32,
    pub last_non_ws: Option<Token>,
    pub prev_last_non_ws: Option<Token>,
    pub prev_case_line: bool,
    pub block_stack: Vec<BlockFrame>,
    pub state_stack: Vec<ParserState>,
    pub expr_stack: Vec<ExpressionFrame>,
}

/// Per-line scratch captured at `init_new_line`, read back by
/// `get_line_indent` once the line's tokens have been walked.
#[derive(Default)]
struct LineScratch {
    initial_indent_level: i32,
    initial_open_braces: i32,
    initial_open_parens: i32,
    prev_statement_open: bool,
    prev_last_non_ws: Option<Token>,
    opening_braces: i32,
    closing_braces: i32,
}

pub struct Parser {
    pub indent_size: u32,
    pub continuation: ContinuationPolicy,
    pub max_to_parenthesis: u32,

    state_stack: Vec<ParserState>,
    expr_stack: Vec<ExpressionFrame>,
    block_stack: Vec<BlockFrame>,

    open_braces: i32,
    open_parens: i32,
    statement_open: bool,
    ternary_open: i32,
    next_level_adjustment: i32,
    nesting_adjustment: i32,
    last_non_ws: Option<Token>,
    prev_case_line: bool,

    scratch: LineScratch,
}

impl Parser {
    pub fn new(indent_size: u32, continuation: ContinuationPolicy, max_to_parenthesis: u32) -> Parser {
        Parser {
            indent_size,
            continuation,
            max_to_parenthesis,
            state_stack: vec![ParserState::Initial],
            expr_stack: Vec::new(),
            block_stack: Vec::new(),
            open_braces: 0,
            open_parens: 0,
            statement_open: false,
            ternary_open: 0,
            next_level_adjustment: 0,
            nesting_adjustment: 0,
            last_non_ws: None,
            prev_case_line: false,
            scratch: LineScratch::default(),
        }
    }

    pub fn state(&self) -> ParserState {
        *self.state_stack.last().unwrap_or(&ParserState::Initial)
    }

    fn push_state(&mut self, s: ParserState) {
        self.state_stack.push(s);
    }

    fn pop_state(&mut self) -> ParserState {
        if self.state_stack.len() > 1 {
            self.state_stack.pop().unwrap()
        } else {
            ParserState::Initial
        }
    }

    /// Called once per logical line before its tokens are walked (ported
    /// from the original's `init_new_line`).
    pub fn init_new_line(&mut self) {
        self.scratch = LineScratch {
            initial_indent_level: self.open_braces + self.open_parens + self.nesting_adjustment,
            initial_open_braces: self.open_braces,
            initial_open_parens: self.open_parens,
            prev_statement_open: self.statement_open,
            prev_last_non_ws: self.last_non_ws.clone(),
            opening_braces: 0,
            closing_braces: 0,
        };
    }

    fn close_statement(&mut self) {
        self.statement_open = false;
        self.open_parens = 0;
        self.ternary_open = 0;
    }

    fn push_block(&mut self, kind: BlockKind) {
        self.block_stack.push(BlockFrame { kind, nesting_adjustment: self.nesting_adjustment, open_braces: self.open_braces });
    }

    /// Pops every block frame whose recorded `open_braces` now exceeds the
    /// current depth, restoring `nesting_adjustment` to match; returns the
    /// net adjustment accumulated along the way (ported from the original's
    /// `pop_block`).
    fn pop_block(&mut self) -> i32 {
        let mut adjustment = 0;
        while let Some(top) = self.block_stack.last() {
            if self.open_braces >= top.open_braces {
                break;
            }
            let frame = self.block_stack.pop().unwrap();
            if frame.nesting_adjustment < self.nesting_adjustment {
                adjustment += frame.nesting_adjustment - self.nesting_adjustment;
            }
            self.nesting_adjustment = frame.nesting_adjustment;
        }
        adjustment
    }

    /// Feeds one token, updating brace/paren counters, the expression and
    /// block stacks, and the named-state stack. Call in order for every
    /// token on the (comment-and-literal-stripped) logical line.
    pub fn feed(&mut self, tok: &Token, column: u32) {
        match tok {
            Token::BraceOpen => {
                self.scratch.opening_braces += 1;
                let composite = matches!(
                    self.state(),
                    ParserState::If
                        | ParserState::Else
                        | ParserState::While
                        | ParserState::For
                        | ParserState::DoWhile
                        | ParserState::Switch
                        | ParserState::Try
                        | ParserState::Catch
                        | ParserState::Namespace
                        | ParserState::MsvcTry
                        | ParserState::MsvcExcept
                        | ParserState::MsvcFinally
                        | ParserState::Function
                        | ParserState::PostArguments
                );
                self.close_statement();
                self.open_braces += 1;
                if composite {
                    let owner = self.pop_state();
                    self.push_block(BlockKind::Composite(owner));
                    if owner == ParserState::Switch {
                        self.push_state(ParserState::SwitchBody);
                    }
                } else {
                    self.push_block(BlockKind::Plain);
                }
                self.last_non_ws = Some(Token::BraceOpen);
            }
            Token::BraceClose => {
                self.scratch.closing_braces += 1;
                self.open_braces -= 1;
                if self.open_braces < 0 {
                    self.open_braces = 0;
                }
                self.open_parens = 0;
                self.statement_open = false;
                if matches!(self.state(), ParserState::SwitchBody) {
                    self.pop_state();
                }
                self.last_non_ws = Some(Token::BraceClose);
            }
            Token::ParenOpen => {
                self.expr_stack.push(ExpressionFrame {
                    opener: Token::ParenOpen,
                    column,
                    indent_increment: 1,
                    pre_statement_open: self.statement_open,
                });
                self.open_parens += 1;
                self.statement_open = true;
                if matches!(self.state(), ParserState::If | ParserState::While | ParserState::Switch | ParserState::For | ParserState::Catch) {
                    self.push_state(ParserState::Expression);
                } else if self.state() == ParserState::Function {
                    self.push_state(ParserState::Arguments);
                }
            }
            Token::ParenClose => {
                if let Some(frame) = self.expr_stack.pop() {
                    if frame.opener == Token::ParenOpen {
                        self.open_parens = (self.open_parens - 1).max(0);
                    }
                }
                if matches!(self.state(), ParserState::Expression) {
                    self.pop_state();
                    match self.state() {
                        ParserState::If => {
                            self.pop_state();
                            self.push_state(ParserState::If);
                        }
                        _ => {}
                    }
                } else if matches!(self.state(), ParserState::Arguments) {
                    self.pop_state();
                    self.push_state(ParserState::PostArguments);
                }
            }
            Token::BracketOpen => {
                self.expr_stack.push(ExpressionFrame {
                    opener: Token::BracketOpen,
                    column,
                    indent_increment: 1,
                    pre_statement_open: self.statement_open,
                });
                self.statement_open = true;
            }
            Token::BracketClose => {
                self.expr_stack.pop();
            }
            Token::Semicolon => {
                self.statement_open = false;
                if self.open_parens == 0 {
                    self.ternary_open = 0;
                }
                if matches!(
                    self.state(),
                    ParserState::Declaration
                        | ParserState::Assignment
                        | ParserState::Label
                        | ParserState::EnumDeclaration
                        | ParserState::MembersInitList
                        | ParserState::PostArguments
                        | ParserState::Function
                        | ParserState::AsmStatement
                ) {
                    self.pop_state();
                }
            }
            Token::Question => {
                self.ternary_open += 1;
            }
            Token::Colon => {
                if self.ternary_open > 0 {
                    self.ternary_open -= 1;
                } else if self.state() == ParserState::PostArguments {
                    self.pop_state();
                    self.push_state(ParserState::MembersInitList);
                } else if matches!(self.state(), ParserState::Label | ParserState::PostCase | ParserState::DefaultLabel) {
                    self.pop_state();
                    self.statement_open = false;
                } else {
                    self.statement_open = false;
                }
            }
            Token::If => {
                self.push_state(ParserState::If);
            }
            Token::Else => {
                if self.state() == ParserState::If {
                    self.pop_state();
                }
                self.push_state(ParserState::Else);
            }
            Token::While => {
                if self.state() == ParserState::PendingWhile {
                    self.pop_state();
                } else {
                    self.push_state(ParserState::While);
                }
            }
            Token::For => {
                self.push_state(ParserState::For);
            }
            Token::Do => {
                self.push_state(ParserState::DoWhile);
                self.push_state(ParserState::PendingWhile);
            }
            Token::Switch => {
                self.push_state(ParserState::Switch);
            }
            Token::Case => {
                self.prev_case_line = true;
                self.push_state(ParserState::PostCase);
            }
            Token::Default => {
                self.prev_case_line = true;
                self.push_state(ParserState::DefaultLabel);
            }
            Token::Try => {
                self.push_state(ParserState::Try);
            }
            Token::Catch => {
                if self.state() == ParserState::Try || self.state() == ParserState::PostTry {
                    self.pop_state();
                }
                self.push_state(ParserState::Catch);
            }
            Token::MsvcTry => {
                self.push_state(ParserState::MsvcTry);
            }
            Token::MsvcExcept => {
                if self.state() == ParserState::MsvcTry {
                    self.pop_state();
                }
                self.push_state(ParserState::MsvcExcept);
            }
            Token::MsvcFinally => {
                if self.state() == ParserState::MsvcTry {
                    self.pop_state();
                }
                self.push_state(ParserState::MsvcFinally);
            }
            Token::Namespace => {
                self.push_state(ParserState::Namespace);
            }
            Token::Template => {
                self.push_state(ParserState::Template);
            }
            Token::Less if self.state() == ParserState::Template => {
                self.pop_state();
                self.push_state(ParserState::TemplateArgs);
                self.expr_stack.push(ExpressionFrame {
                    opener: Token::Less,
                    column,
                    indent_increment: 1,
                    pre_statement_open: self.statement_open,
                });
            }
            Token::Greater if self.state() == ParserState::TemplateArgs => {
                self.pop_state();
                if matches!(self.expr_stack.last().map(|f| &f.opener), Some(Token::Less)) {
                    self.expr_stack.pop();
                }
            }
            Token::Struct | Token::Class | Token::Union | Token::Enum => {
                self.push_state(ParserState::EnumDeclaration);
                self.statement_open = true;
            }
            Token::Asm => {
                self.push_state(ParserState::Asm);
            }
            Token::Alphanum(_) => {
                self.statement_open = true;
                if self.state() == ParserState::Asm {
                    self.pop_state();
                    self.push_state(ParserState::AsmBlock);
                } else if self.state() == ParserState::AsmBlock {
                    self.push_state(ParserState::AsmStatement);
                } else if self.state() == ParserState::Initial && self.last_non_ws.is_none() {
                    self.push_state(ParserState::Declaration);
                }
            }
            Token::Op(op) if op.as_slice() == b"=" => {
                if matches!(self.state(), ParserState::Initial | ParserState::Declaration) {
                    self.push_state(ParserState::Assignment);
                }
                self.statement_open = true;
            }
            _ => {
                self.statement_open = true;
            }
        }

        if !matches!(tok, Token::BraceOpen | Token::BraceClose) {
            self.last_non_ws = Some(tok.clone());
        }
    }

    pub fn expr_depth(&self) -> usize {
        self.expr_stack.len()
    }

    pub fn open_braces(&self) -> i32 {
        self.open_braces
    }

    pub fn open_parens(&self) -> i32 {
        self.open_parens
    }

    /// The column continuation lines inside the innermost open expression
    /// frame should align to, per the active `ContinuationPolicy`, or `None`
    /// when the policy says to leave the line's own indentation alone.
    pub fn continuation_indent(&self, current_whitespace_width: u32) -> Option<u32> {
        let frame = self.expr_stack.last()?;
        match self.continuation {
            ContinuationPolicy::None => None,
            ContinuationPolicy::Smart => {
                if frame.column + 1 <= self.max_to_parenthesis {
                    Some(frame.column + 1)
                } else {
                    Some(self.indent_size * (self.open_braces + self.open_parens).max(0) as u32 + self.indent_size)
                }
            }
            ContinuationPolicy::Extend => Some(current_whitespace_width.max(self.indent_size * (self.open_braces.max(0) as u32 + 1))),
        }
    }

    /// Computes this line's indent level (ported from the original's
    /// `c_parser_state.get_line_indent`, generalised to read the named
    /// state stack instead of only brace/paren counters). `is_case_or_default`
    /// and `leading_close_braces` describe what the line started with,
    /// determined by the caller from the line's own (not-yet-fed) tokens.
    pub fn get_line_indent(&mut self, is_case_or_default: bool, leading_close_braces: u32, line_is_empty: bool) -> i32 {
        let current_level = self.scratch.initial_indent_level + self.pop_block();

        let mut level_adjustment = self.next_level_adjustment;
        if self.open_parens == 0 {
            self.next_level_adjustment = 0;
        }

        let case_line = is_case_or_default;
        if case_line {
            level_adjustment = -1;
        } else if leading_close_braces > 0 {
            level_adjustment = if self.open_braces <= 0 { -current_level } else { -(leading_close_braces as i32) };
        } else if self.scratch.opening_braces > 0 {
            if self.prev_case_line && self.scratch.closing_braces == 0 {
                level_adjustment = -1;
            } else {
                level_adjustment = 0;
            }
        } else if matches!(self.last_non_ws, Some(Token::BraceOpen) | Some(Token::BraceClose)) {
            // indent unchanged
        } else if !self.scratch.prev_statement_open {
            if matches!(self.state(), ParserState::Label | ParserState::PostCase | ParserState::DefaultLabel) {
                return 0;
            } else if self.scratch.initial_open_parens == 0 && self.scratch.prev_last_non_ws == Some(Token::ParenClose) {
                self.next_level_adjustment = 1;
            } else if self.statement_open {
                self.next_level_adjustment = 1;
            } else if line_is_empty {
                self.next_level_adjustment = level_adjustment;
            }
        } else if !self.statement_open {
            if self.scratch.prev_last_non_ws == Some(Token::Comma) {
                level_adjustment = 0;
            }
        } else if self.scratch.prev_last_non_ws == Some(Token::Comma) || self.last_non_ws == Some(Token::Comma) {
            level_adjustment = 0;
        } else if self.scratch.initial_open_parens == 0
            && (self.scratch.prev_last_non_ws == Some(Token::ParenClose) || self.last_non_ws == Some(Token::ParenClose))
        {
            level_adjustment = 0;
            self.next_level_adjustment = 1;
        } else if line_is_empty {
            self.next_level_adjustment = level_adjustment;
        }

        if self.open_braces < 0 {
            self.open_braces = 0;
            self.open_parens = 0;
        }
        self.prev_case_line = case_line;
        if matches!(self.last_non_ws, Some(Token::BraceOpen) | Some(Token::BraceClose)) {
            self.open_parens = 0;
        }

        let level = current_level + level_adjustment;
        if level <= 0 {
            0
        } else {
            level
        }
    }

    pub fn save_state(&self, directive: &[u8], prev: Option<&PpSnapshot>) -> PpSnapshot {
        let (restore_c_state, ignore_nesting_change) = classify_directive(directive, prev);
        PpSnapshot {
            ignore_nesting_change,
            restore_c_state,
            open_braces: self.open_braces,
            open_parens: self.open_parens,
            statement_open: self.statement_open,
            prev_statement_open: self.scratch.prev_statement_open,
            ternary_open: self.ternary_open,
            next_level_adjustment: self.next_level_adjustment,
            nesting_adjustment: self.nesting_adjustment,
            last_non_ws: self.last_non_ws.clone(),
            prev_last_non_ws: self.scratch.prev_last_non_ws.clone(),
            prev_case_line: self.prev_case_line,
            block_stack: self.block_stack.clone(),
            state_stack: self.state_stack.clone(),
            expr_stack: self.expr_stack.clone(),
        }
    }

    pub fn restore_state(&mut self, snap: &PpSnapshot) {
        if !snap.restore_c_state.is_truthy() {
            return;
        }
        self.open_braces = snap.open_braces;
        self.open_parens = snap.open_parens;
        self.statement_open = snap.statement_open;
        self.ternary_open = snap.ternary_open;
        self.next_level_adjustment = snap.next_level_adjustment;
        self.nesting_adjustment = snap.nesting_adjustment;
        self.last_non_ws = snap.last_non_ws.clone();
        self.prev_case_line = snap.prev_case_line;
        self.block_stack = snap.block_stack.clone();
        self.state_stack = snap.state_stack.clone();
        self.expr_stack = snap.expr_stack.clone();
    }
}

/// Matches the original's `save_state` keyword dispatch: `#if __cplusplus`
/// family and `#if 0`/`#if 1` get special "ignore nesting change" handling
/// with a restore decision that's known in advance; an ordinary
/// `#if`/`#ifdef`/`#ifndef` restores unconditionally on every following
/// branch (`All`); `#else` flips `Yes`/`No` but leaves `All` as `All`.
fn classify_directive(directive: &[u8], prev: Option<&PpSnapshot>) -> (RestoreCState, bool) {
    let text = String::from_utf8_lossy(directive);
    let trimmed = text.trim_start();

    if trimmed.starts_with("#else") {
        if let Some(p) = prev {
            return match p.restore_c_state {
                RestoreCState::All => (RestoreCState::All, p.ignore_nesting_change),
                RestoreCState::Yes => (RestoreCState::No, !p.ignore_nesting_change),
                RestoreCState::No => (RestoreCState::Yes, !p.ignore_nesting_change),
            };
        }
        return (RestoreCState::All, false);
    }
    if trimmed.starts_with("#ifdef __cplusplus")
        || trimmed.starts_with("#ifdef  __cplusplus")
        || trimmed.contains("defined(__cplusplus)")
        || trimmed.contains("defined __cplusplus")
    {
        return (RestoreCState::Yes, true);
    }
    if is_constant_condition(trimmed, false) {
        return (RestoreCState::Yes, true);
    }
    if is_constant_condition(trimmed, true) {
        return (RestoreCState::No, true);
    }
    (RestoreCState::All, false)
}

fn is_constant_condition(trimmed: &str, truthy: bool) -> bool {
    let rest = trimmed.trim_start_matches("#elif").trim_start_matches("#if").trim_start();
    if truthy {
        rest == "1" || rest == "(1)" || rest == "TRUE"
    } else {
        rest == "0" || rest == "(0)" || rest == "FALSE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut Parser, toks: &[Token]) {
        parser.init_new_line();
        for (col, t) in toks.iter().enumerate() {
            parser.feed(t, col as u32);
        }
    }

    #[test]
    fn test_brace_nesting_tracked_through_composite_state() {
        let mut p = Parser::new(4, ContinuationPolicy::None, 40);
        feed_all(&mut p, &[Token::If, Token::ParenOpen, Token::ParenClose, Token::BraceOpen]);
        assert_eq!(p.open_braces, 1);
        feed_all(&mut p, &[Token::BraceClose]);
        assert_eq!(p.open_braces, 0);
        assert_eq!(p.state(), ParserState::Initial);
    }

    #[test]
    fn test_switch_case_pushes_and_pops_switch_body() {
        let mut p = Parser::new(4, ContinuationPolicy::None, 40);
        feed_all(&mut p, &[Token::Switch, Token::ParenOpen, Token::ParenClose, Token::BraceOpen]);
        assert_eq!(p.state(), ParserState::SwitchBody);
        feed_all(&mut p, &[Token::Case, Token::Alphanum(b"1".to_vec()), Token::Colon]);
        assert_eq!(p.state(), ParserState::SwitchBody);
        feed_all(&mut p, &[Token::BraceClose]);
        assert_eq!(p.state(), ParserState::Initial);
    }

    #[test]
    fn test_paren_frame_records_opening_column() {
        let mut p = Parser::new(4, ContinuationPolicy::Smart, 40);
        p.init_new_line();
        p.feed(&Token::Alphanum(b"foo".to_vec()), 0);
        p.feed(&Token::ParenOpen, 3);
        assert_eq!(p.continuation_indent(0), Some(4));
    }

    #[test]
    fn test_pp_else_flips_restore_decision() {
        let p = Parser::new(4, ContinuationPolicy::None, 40);
        let first = p.save_state(b"#if FOO", None);
        assert_eq!(first.restore_c_state, RestoreCState::All);
        let second = p.save_state(b"#else", Some(&first));
        assert_eq!(second.restore_c_state, RestoreCState::All);
    }

    #[test]
    fn test_pp_else_flips_known_constant_branch() {
        let p = Parser::new(4, ContinuationPolicy::None, 40);
        let first = p.save_state(b"#if 0", None);
        assert_eq!(first.restore_c_state, RestoreCState::Yes);
        let second = p.save_state(b"#else", Some(&first));
        assert_eq!(second.restore_c_state, RestoreCState::No);
    }
}
