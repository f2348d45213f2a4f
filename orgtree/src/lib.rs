//! Org-style outline markup front end.
//!
//! Input text goes through two stages: a line-aware [`lexer`] that classifies
//! each physical line into a [`token::Token`], and a single-pass [`parser`]
//! that rebuilds the hierarchy (headline nesting, list nesting, delimited
//! bodies, inline markup) into a [`crate::core::Document`]. The tree is owned
//! top-down and never mutated after the parse returns.

pub use config::{CancelFlag, Limits, ParseOptions};
pub use crate::core::{Document, Node};
pub use diagnostics::{Diagnostic, LogSink, NullSink, TraceEvent, TraceSink};
pub use format::format_document;
pub use parser::{Parsed, Parser, parse_document, parse_document_with};

pub mod token {
    //! Line-level tokens. One token per physical line, plus the newline that
    //! ends it; headlines are the exception (marker run, then the title text).

    /// Classification tag of a token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum TokenKind {
        Eof,
        Newline,
        /// Run of `*` at line start followed by a space.
        Heading,
        /// `#+KEY: value`
        Keyword,
        /// `#+BEGIN_KIND ...`
        BlockBegin,
        /// `#+END_KIND`
        BlockEnd,
        /// `:NAME:`
        DrawerBegin,
        /// `:END:`
        DrawerEnd,
        /// `- x`, `+ x`, `1. x`, `1) x`, possibly indented.
        ListItem,
        /// `| a | b |`
        TableRow,
        /// `|---+---|`
        TableSeparator,
        /// `# text`
        Comment,
        Text,
        /// A line that opens with a control character other than tab or CR.
        Invalid,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Token<'a> {
        pub kind: TokenKind,
        /// Slice of the input covered by this token.
        pub literal: &'a str,
        /// 1-based.
        pub line: usize,
        /// 1-based, counted in characters.
        pub column: usize,
    }

    impl<'a> Token<'a> {
        pub fn eof(line: usize, column: usize) -> Self {
            Self {
                kind: TokenKind::Eof,
                literal: "",
                line,
                column,
            }
        }

        pub fn is(&self, kind: TokenKind) -> bool {
            self.kind == kind
        }
    }
}

pub mod config {
    //! Host-supplied knobs, fixed when a parse run is created.

    use crate::diagnostics::{LogSink, TraceSink};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    pub const DEFAULT_MAX_INPUT_SIZE: usize = 10 * 1024 * 1024;
    pub const DEFAULT_MAX_LINE_LENGTH: usize = 10_000;

    /// Input limits. Exceeding either one is terminal for the run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Limits {
        /// Maximum total input size in bytes.
        #[serde(default = "Limits::default_max_input_size")]
        pub max_input_size: usize,
        /// Maximum length of one line, in characters.
        #[serde(default = "Limits::default_max_line_length")]
        pub max_line_length: usize,
    }

    impl Default for Limits {
        fn default() -> Self {
            Self {
                max_input_size: Self::default_max_input_size(),
                max_line_length: Self::default_max_line_length(),
            }
        }
    }

    impl Limits {
        fn default_max_input_size() -> usize {
            DEFAULT_MAX_INPUT_SIZE
        }

        fn default_max_line_length() -> usize {
            DEFAULT_MAX_LINE_LENGTH
        }
    }

    /// Cooperative cancellation handle. Clones share the same flag.
    #[derive(Debug, Clone, Default)]
    pub struct CancelFlag(Arc<AtomicBool>);

    impl CancelFlag {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }

        pub fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Everything a parse run needs from its host.
    #[derive(Clone)]
    pub struct ParseOptions {
        pub limits: Limits,
        pub cancel: Option<CancelFlag>,
        /// Receives step tracing; never influences the result.
        pub sink: Arc<dyn TraceSink>,
    }

    impl Default for ParseOptions {
        fn default() -> Self {
            Self {
                limits: Limits::default(),
                cancel: None,
                sink: Arc::new(LogSink),
            }
        }
    }

    impl fmt::Debug for ParseOptions {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ParseOptions")
                .field("limits", &self.limits)
                .field("cancel", &self.cancel)
                .finish_non_exhaustive()
        }
    }

    impl ParseOptions {
        pub fn with_limits(mut self, limits: Limits) -> Self {
            self.limits = limits;
            self
        }

        pub fn with_max_input_size(mut self, bytes: usize) -> Self {
            self.limits.max_input_size = bytes;
            self
        }

        pub fn with_max_line_length(mut self, chars: usize) -> Self {
            self.limits.max_line_length = chars;
            self
        }

        pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
            self.cancel = Some(cancel);
            self
        }

        pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
            self.sink = sink;
            self
        }
    }

}

pub mod diagnostics {
    //! Diagnostics returned to the host, and the tracing sink the lexer and
    //! parser report their steps to.

    use crate::lexer::LexError;
    use crate::token::Token;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /// One recorded problem. Displays as `line <n>: <message>`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Diagnostic {
        pub line: usize,
        pub message: String,
    }

    impl Diagnostic {
        pub fn new(line: usize, message: impl Into<String>) -> Self {
            Self {
                line,
                message: message.into(),
            }
        }
    }

    impl fmt::Display for Diagnostic {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "line {}: {}", self.line, self.message)
        }
    }

    /// A single observable step of a parse run.
    #[derive(Debug)]
    pub enum TraceEvent<'a> {
        Token(&'a Token<'a>),
        Node { kind: &'static str, line: usize },
        Diagnostic(&'a Diagnostic),
        Limit(&'a LexError),
        Finished { nodes: usize, diagnostics: usize },
    }

    pub trait TraceSink: Send + Sync {
        fn trace(&self, event: &TraceEvent<'_>);
    }

    /// Forwards events to the `log` facade.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LogSink;

    impl TraceSink for LogSink {
        fn trace(&self, event: &TraceEvent<'_>) {
            match event {
                TraceEvent::Token(token) => log::trace!(
                    target: "orgtree::lexer",
                    "{}:{} {:?} {:?}",
                    token.line,
                    token.column,
                    token.kind,
                    token.literal
                ),
                TraceEvent::Node { kind, line } => {
                    log::debug!(target: "orgtree::parser", "parsed {kind} at line {line}")
                }
                TraceEvent::Diagnostic(diagnostic) => {
                    log::warn!(target: "orgtree::parser", "{diagnostic}")
                }
                TraceEvent::Limit(err) => log::error!(target: "orgtree::lexer", "{err}"),
                TraceEvent::Finished { nodes, diagnostics } => log::debug!(
                    target: "orgtree::parser",
                    "document parse complete: {nodes} top-level nodes, {diagnostics} diagnostics"
                ),
            }
        }
    }

    /// Discards every event.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NullSink;

    impl TraceSink for NullSink {
        fn trace(&self, _event: &TraceEvent<'_>) {}
    }
}

pub mod lexer {
    //! Line classifier.
    //!
    //! A single character cursor walks the input. A line's leading character is
    //! only inspected at line start (offset 0 or right after `\n`), and each
    //! candidate construct is decided with at most one character of lookahead.
    //! Anything that fails to match falls through to plain text; the lexer never
    //! returns an error. Terminal conditions (input too large, line too long,
    //! cancellation) are recorded once and turn the stream into `Eof` forever.

    use crate::config::{CancelFlag, ParseOptions};
    use crate::diagnostics::{TraceEvent, TraceSink};
    use crate::token::{Token, TokenKind};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum LexError {
        #[error("input exceeds maximum allowed size ({size} bytes > {max} bytes)")]
        InputTooLarge { size: usize, max: usize },
        #[error("line exceeds maximum allowed length ({max} characters)")]
        LineTooLong { line: usize, max: usize },
        #[error("parsing cancelled")]
        Cancelled,
    }

    pub struct Lexer<'a> {
        input: &'a str,
        /// Byte offset of `ch`.
        pos: usize,
        ch: Option<char>,
        prev: Option<char>,
        line: usize,
        column: usize,
        max_line_length: usize,
        cancel: Option<CancelFlag>,
        sink: Arc<dyn TraceSink>,
        error: Option<LexError>,
    }

    impl<'a> Lexer<'a> {
        pub fn with_options(input: &'a str, options: &ParseOptions) -> Self {
            let mut lexer = Self {
                input,
                pos: 0,
                ch: input.chars().next(),
                prev: None,
                line: 1,
                column: 1,
                max_line_length: options.limits.max_line_length,
                cancel: options.cancel.clone(),
                sink: Arc::clone(&options.sink),
                error: None,
            };
            if input.len() > options.limits.max_input_size {
                lexer.fail(LexError::InputTooLarge {
                    size: input.len(),
                    max: options.limits.max_input_size,
                });
            }
            lexer
        }

        /// The terminal condition hit so far, if any.
        pub fn error(&self) -> Option<&LexError> {
            self.error.as_ref()
        }

        /// Polls the cancellation flag, recording `Cancelled` once it is set.
        pub fn check_cancelled(&mut self) -> bool {
            if matches!(self.error, Some(LexError::Cancelled)) {
                return true;
            }
            let cancelled = self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled);
            if cancelled {
                self.fail(LexError::Cancelled);
            }
            cancelled
        }

        pub fn next_token(&mut self) -> Token<'a> {
            if self.error.is_some() || self.check_cancelled() {
                return Token::eof(self.line, self.column);
            }
            let Some(ch) = self.ch else {
                return Token::eof(self.line, self.column);
            };

            let (start, line, column) = (self.pos, self.line, self.column);
            let at_line_start = self.pos == 0 || self.prev == Some('\n');

            // Order matters: the first arm whose guard holds decides the line.
            let kind = match ch {
                '\n' => {
                    self.line += 1;
                    self.read_char();
                    TokenKind::Newline
                }
                '*' if at_line_start => self.lex_stars(),
                '#' if at_line_start => self.lex_hash(start),
                ':' if at_line_start => self.lex_drawer_marker(start),
                '-' if at_line_start => self.lex_dashes(),
                '+' if at_line_start && self.peek_char() == Some(' ') => {
                    self.read_to_eol();
                    TokenKind::ListItem
                }
                '|' if at_line_start => self.lex_table_row(start),
                ' ' | '\t' if at_line_start => self.lex_indented(),
                '0'..='9' if at_line_start => self.lex_ordered_item(),
                c if at_line_start && c.is_control() && c != '\t' && c != '\r' => {
                    self.read_to_eol();
                    TokenKind::Invalid
                }
                _ => {
                    self.read_to_eol();
                    TokenKind::Text
                }
            };

            let token = Token {
                kind,
                literal: &self.input[start..self.pos],
                line,
                column,
            };
            self.sink.trace(&TraceEvent::Token(&token));
            token
        }

        /* ------------------------------ Cursor ------------------------------ */

        fn read_char(&mut self) {
            if let Some(c) = self.ch {
                self.pos += c.len_utf8();
                self.column = if c == '\n' { 1 } else { self.column + 1 };
            }
            self.prev = self.ch;
            self.ch = self.input[self.pos..].chars().next();
        }

        fn peek_char(&self) -> Option<char> {
            let c = self.ch?;
            self.input[self.pos + c.len_utf8()..].chars().next()
        }

        /// Advances while `pred` holds, stopping at the line length limit.
        fn eat_while(&mut self, pred: impl Fn(char) -> bool) {
            while let Some(c) = self.ch {
                if !pred(c) {
                    break;
                }
                if self.column > self.max_line_length {
                    let (line, max) = (self.line, self.max_line_length);
                    self.fail(LexError::LineTooLong { line, max });
                    break;
                }
                self.read_char();
            }
        }

        fn read_to_eol(&mut self) {
            self.eat_while(|c| c != '\n');
        }

        fn fail(&mut self, err: LexError) {
            if self.error.is_none() {
                self.sink.trace(&TraceEvent::Limit(&err));
                self.error = Some(err);
            }
        }

        fn at_ordered_delimiter(&self) -> bool {
            matches!(self.ch, Some('.' | ')')) && self.peek_char() == Some(' ')
        }

        /* ---------------------------- Line rules ---------------------------- */

        fn lex_stars(&mut self) -> TokenKind {
            self.eat_while(|c| c == '*');
            if self.ch == Some(' ') {
                return TokenKind::Heading;
            }
            self.read_to_eol();
            TokenKind::Text
        }

        fn lex_hash(&mut self, start: usize) -> TokenKind {
            match self.peek_char() {
                Some('+') => {
                    self.read_to_eol();
                    let literal = &self.input[start..self.pos];
                    if starts_with_ignore_case(literal, "#+BEGIN_") {
                        TokenKind::BlockBegin
                    } else if starts_with_ignore_case(literal, "#+END_") {
                        TokenKind::BlockEnd
                    } else {
                        TokenKind::Keyword
                    }
                }
                None | Some(' ' | '\n') => {
                    self.read_to_eol();
                    TokenKind::Comment
                }
                Some(_) => {
                    self.read_to_eol();
                    TokenKind::Text
                }
            }
        }

        fn lex_drawer_marker(&mut self, start: usize) -> TokenKind {
            self.read_to_eol();
            let trimmed = self.input[start..self.pos].trim();
            if trimmed.eq_ignore_ascii_case(":END:") {
                TokenKind::DrawerEnd
            } else if is_drawer_name(trimmed) {
                TokenKind::DrawerBegin
            } else {
                // Property lines such as `:ID: 42` stay text; the drawer builder reads them.
                TokenKind::Text
            }
        }

        fn lex_dashes(&mut self) -> TokenKind {
            let start = self.pos;
            self.eat_while(|c| c == '-');
            let dashes = self.pos - start;
            if dashes >= 5 && matches!(self.ch, None | Some('\n')) {
                // horizontal rule; the parser recognizes it from the text
                return TokenKind::Text;
            }
            let bullet = dashes == 1 && self.ch == Some(' ');
            self.read_to_eol();
            if bullet {
                TokenKind::ListItem
            } else {
                TokenKind::Text
            }
        }

        fn lex_table_row(&mut self, start: usize) -> TokenKind {
            self.read_to_eol();
            if is_table_separator(&self.input[start..self.pos]) {
                TokenKind::TableSeparator
            } else {
                TokenKind::TableRow
            }
        }

        fn lex_indented(&mut self) -> TokenKind {
            self.eat_while(|c| c == ' ' || c == '\t');
            let item = match self.ch {
                Some('-' | '+') => self.peek_char() == Some(' '),
                Some(c) if c.is_ascii_digit() => {
                    self.eat_while(|c| c.is_ascii_digit());
                    self.at_ordered_delimiter()
                }
                _ => false,
            };
            self.read_to_eol();
            if item {
                TokenKind::ListItem
            } else {
                TokenKind::Text
            }
        }

        fn lex_ordered_item(&mut self) -> TokenKind {
            self.eat_while(|c| c.is_ascii_digit());
            let item = self.at_ordered_delimiter();
            self.read_to_eol();
            if item {
                TokenKind::ListItem
            } else {
                TokenKind::Text
            }
        }
    }

    pub(crate) fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
        s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    }

    /// `:NAME:` with exactly two colons and a non-empty name.
    fn is_drawer_name(trimmed: &str) -> bool {
        trimmed.len() > 2
            && trimmed.starts_with(':')
            && trimmed.ends_with(':')
            && trimmed.matches(':').count() == 2
    }

    /// `|---+---|`: pipes on both ends, at least one dash, nothing alphanumeric.
    pub(crate) fn is_table_separator(line: &str) -> bool {
        let trimmed = line.trim();
        if !(trimmed.starts_with('|') && trimmed.ends_with('|')) {
            return false;
        }
        let interior = trimmed.trim_matches('|');
        interior.contains('-') && !interior.chars().any(|c| c.is_ascii_alphanumeric())
    }

}

pub mod core {
    //! Document tree. Every node exclusively owns its children; there are no
    //! back references and nothing is mutated after construction.

    use chrono::{NaiveDate, NaiveTime};
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};

    /* ------------------------------ Document ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Document {
        #[serde(default)]
        pub children: Vec<Node>,
    }

    impl Document {
        /// Value of the first top-level `#+KEY:` line with this key, ignoring case.
        pub fn keyword(&self, key: &str) -> Option<&str> {
            self.children.iter().find_map(|node| match node {
                Node::Keyword(k) if k.key.eq_ignore_ascii_case(key) => Some(k.value.as_str()),
                _ => None,
            })
        }

        pub fn title(&self) -> Option<&str> {
            self.keyword("TITLE")
        }

        /// Pre-order traversal. Headline children and list-item children are
        /// visited one level deeper than their container.
        pub fn walk<'a, F>(&'a self, mut visit: F)
        where
            F: FnMut(&'a Node, usize),
        {
            for node in &self.children {
                node.walk_at(0, &mut visit);
            }
        }

        pub fn headlines(&self) -> Vec<&Headline> {
            let mut out = Vec::new();
            self.walk(|node, _| {
                if let Node::Headline(h) = node {
                    out.push(h);
                }
            });
            out
        }
    }

    /* -------------------------------- Nodes -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Node {
        Headline(Headline),
        Paragraph(Paragraph),
        Keyword(Keyword),
        Block(Block),
        Drawer(Drawer),
        List(List),
        Table(Table),
        Comment(Comment),
        HorizontalRule,
    }

    impl Node {
        pub fn kind_name(&self) -> &'static str {
            match self {
                Node::Headline(_) => "headline",
                Node::Paragraph(_) => "paragraph",
                Node::Keyword(_) => "keyword",
                Node::Block(_) => "block",
                Node::Drawer(_) => "drawer",
                Node::List(_) => "list",
                Node::Table(_) => "table",
                Node::Comment(_) => "comment",
                Node::HorizontalRule => "horizontal_rule",
            }
        }

        fn walk_at<'a, F>(&'a self, depth: usize, visit: &mut F)
        where
            F: FnMut(&'a Node, usize),
        {
            visit(self, depth);
            match self {
                Node::Headline(h) => {
                    for child in &h.children {
                        child.walk_at(depth + 1, visit);
                    }
                }
                Node::List(list) => {
                    for child in list.items.iter().flat_map(|item| &item.children) {
                        child.walk_at(depth + 1, visit);
                    }
                }
                _ => {}
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum TodoKeyword {
        Todo,
        Done,
    }

    impl TodoKeyword {
        pub fn as_str(self) -> &'static str {
            match self {
                TodoKeyword::Todo => "TODO",
                TodoKeyword::Done => "DONE",
            }
        }
    }

    /// Priority cookie letter, `[#A]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Priority(pub char);

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Headline {
        /// Number of leading `*`, at least 1.
        pub level: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub keyword: Option<TodoKeyword>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub priority: Option<Priority>,
        pub title: String,
        #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
        pub tags: IndexSet<String>,
        #[serde(default)]
        pub children: Vec<Node>,
    }

    impl Headline {
        pub fn new(level: usize) -> Self {
            Self {
                level,
                keyword: None,
                priority: None,
                title: String::new(),
                tags: IndexSet::new(),
                children: Vec::new(),
            }
        }
    }

    /// One text line; paragraphs are never merged across lines.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Paragraph {
        pub raw: String,
        pub inline: Vec<Inline>,
    }

    impl Paragraph {
        pub fn plain_text(&self) -> String {
            plain_text(&self.inline)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Keyword {
        /// Uppercased.
        pub key: String,
        pub value: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Block {
        /// Uppercased, e.g. `SRC`, `QUOTE`.
        pub kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub language: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub params: Option<String>,
        pub content: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Drawer {
        pub name: String,
        pub body: DrawerBody,
    }

    impl Drawer {
        pub fn property(&self, key: &str) -> Option<&str> {
            match &self.body {
                DrawerBody::Properties(props) => props.get(key).map(String::as_str),
                DrawerBody::Raw(_) => None,
            }
        }
    }

    /// `PROPERTIES` drawers keep key/value pairs in source order; other drawers keep raw text.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DrawerBody {
        Properties(IndexMap<String, String>),
        Raw(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct List {
        pub ordered: bool,
        pub items: Vec<ListItem>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListItem {
        /// Leading whitespace width; a tab counts as 2.
        pub indent: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub checkbox: Option<Checkbox>,
        pub content: String,
        /// At most one nested `List`.
        #[serde(default)]
        pub children: Vec<Node>,
    }

    impl ListItem {
        pub fn nested(&self) -> Option<&List> {
            self.children.iter().find_map(|node| match node {
                Node::List(list) => Some(list),
                _ => None,
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Checkbox {
        Unchecked,
        Checked,
        Partial,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Table {
        pub rows: Vec<TableRow>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TableRow {
        /// Empty for separator rows.
        pub cells: Vec<String>,
        pub separator: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Comment {
        pub content: String,
    }

    /* ------------------------------- Inline ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Inline {
        Text { value: String },
        Emphasis { kind: Emphasis, children: Vec<Inline> },
        Code { value: String },
        Verbatim { value: String },
        Link(Link),
    }

    impl Inline {
        pub fn text(value: impl Into<String>) -> Self {
            Inline::Text {
                value: value.into(),
            }
        }

        pub fn plain_text(&self) -> String {
            match self {
                Inline::Text { value } | Inline::Code { value } | Inline::Verbatim { value } => {
                    value.clone()
                }
                Inline::Emphasis { children, .. } => plain_text(children),
                Inline::Link(link) if link.description.is_empty() => link.url.clone(),
                Inline::Link(link) => plain_text(&link.description),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Emphasis {
        Bold,
        Italic,
        Strikethrough,
        Underline,
    }

    impl Emphasis {
        pub fn marker(self) -> char {
            match self {
                Emphasis::Bold => '*',
                Emphasis::Italic => '/',
                Emphasis::Strikethrough => '+',
                Emphasis::Underline => '_',
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Link {
        pub url: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub description: Vec<Inline>,
    }

    /// Concatenated text of an inline sequence with all markup dropped.
    pub fn plain_text(inlines: &[Inline]) -> String {
        inlines.iter().map(Inline::plain_text).collect()
    }

    /* ----------------------------- Timestamps ----------------------------- */

    /// `<2024-01-15 Mon 10:00 +1w -2d>` or `[2024-01-15]`, optionally a range.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        pub active: bool,
        pub date: NaiveDate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub time: Option<NaiveTime>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub repeater: Option<Repeater>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub warning: Option<Interval>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub end: Option<TimestampEnd>,
    }

    /// Range end. `date` is `None` for same-day time ranges (`10:00-11:30`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimestampEnd {
        pub date: Option<NaiveDate>,
        pub time: Option<NaiveTime>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Repeater {
        pub kind: RepeaterKind,
        pub interval: Interval,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RepeaterKind {
        /// `+`
        FromLast,
        /// `++`
        FromBase,
        /// `.+`
        FromNow,
    }

    impl RepeaterKind {
        pub fn symbol(self) -> &'static str {
            match self {
                RepeaterKind::FromLast => "+",
                RepeaterKind::FromBase => "++",
                RepeaterKind::FromNow => ".+",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Interval {
        pub value: u32,
        pub unit: IntervalUnit,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum IntervalUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    impl IntervalUnit {
        pub fn from_char(c: char) -> Option<Self> {
            Some(match c {
                'h' => IntervalUnit::Hour,
                'd' => IntervalUnit::Day,
                'w' => IntervalUnit::Week,
                'm' => IntervalUnit::Month,
                'y' => IntervalUnit::Year,
                _ => return None,
            })
        }

        pub fn as_char(self) -> char {
            match self {
                IntervalUnit::Hour => 'h',
                IntervalUnit::Day => 'd',
                IntervalUnit::Week => 'w',
                IntervalUnit::Month => 'm',
                IntervalUnit::Year => 'y',
            }
        }
    }

}

pub mod inline {
    //! Recursive descent over one paragraph line.
    //!
    //! Leftmost constructs win. A delimited span closes at the nearest
    //! following occurrence of its own marker, so `*a *b* c*` pairs the first
    //! two stars. Unmatched markers come out as single-character text
    //! elements; adjacent text is not merged.

    use crate::core::{Emphasis, Inline, Link};
    use nom::{
        IResult,
        bytes::complete::{is_not, tag},
        character::complete::char,
        combinator::opt,
        sequence::delimited,
    };

    /// Nesting deeper than this is kept as opaque text.
    pub const MAX_INLINE_DEPTH: usize = 10;

    #[derive(Debug, Clone, Copy)]
    enum Span {
        Emphasis(Emphasis),
        Code,
        Verbatim,
    }

    fn span_for(marker: u8) -> Option<Span> {
        Some(match marker {
            b'*' => Span::Emphasis(Emphasis::Bold),
            b'/' => Span::Emphasis(Emphasis::Italic),
            b'+' => Span::Emphasis(Emphasis::Strikethrough),
            b'_' => Span::Emphasis(Emphasis::Underline),
            b'~' => Span::Code,
            b'=' => Span::Verbatim,
            _ => return None,
        })
    }

    pub fn parse_inline(text: &str) -> Vec<Inline> {
        parse_at_depth(text, 0)
    }

    fn parse_at_depth(text: &str, depth: usize) -> Vec<Inline> {
        if depth > MAX_INLINE_DEPTH {
            log::debug!("inline nesting limit reached, keeping {} bytes as text", text.len());
            return opaque(text);
        }

        let mut out = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            if rest.len() > 2 && rest.starts_with("[[") {
                if let Ok((after, (url, description))) = bracket_link(rest) {
                    out.push(Inline::Link(Link {
                        url: url.to_string(),
                        description: description
                            .map(|d| parse_at_depth(d, depth + 1))
                            .unwrap_or_default(),
                    }));
                    rest = after;
                    continue;
                }
            }

            if let Some((element, after)) = delimited_span(rest, depth) {
                out.push(element);
                rest = after;
                continue;
            }

            match next_candidate(rest) {
                None => {
                    out.push(Inline::text(rest));
                    break;
                }
                Some(0) => {
                    let width = rest.chars().next().map_or(1, char::len_utf8);
                    out.push(Inline::text(&rest[..width]));
                    rest = &rest[width..];
                }
                Some(n) => {
                    out.push(Inline::text(&rest[..n]));
                    rest = &rest[n..];
                }
            }
        }
        out
    }

    fn opaque(text: &str) -> Vec<Inline> {
        if text.is_empty() {
            Vec::new()
        } else {
            vec![Inline::text(text)]
        }
    }

    /// `[[url]]` or `[[url][description]]`; neither part may contain `]`.
    fn bracket_link(i: &str) -> IResult<&str, (&str, Option<&str>)> {
        let (i, _) = tag("[[")(i)?;
        let (i, url) = is_not("]")(i)?;
        let (i, _) = char(']')(i)?;
        let (i, description) = opt(delimited(char('['), is_not("]"), char(']')))(i)?;
        let (i, _) = char(']')(i)?;
        Ok((i, (url, description)))
    }

    /// A marker, a non-empty body, and the nearest matching closer.
    fn delimited_span(rest: &str, depth: usize) -> Option<(Inline, &str)> {
        let marker = *rest.as_bytes().first()?;
        let span = span_for(marker)?;
        if rest.len() <= 2 {
            return None;
        }
        let end = rest[1..].find(char::from(marker))?;
        if end == 0 {
            return None;
        }
        let body = &rest[1..=end];
        let element = match span {
            Span::Emphasis(kind) => Inline::Emphasis {
                kind,
                children: parse_at_depth(body, depth + 1),
            },
            Span::Code => Inline::Code {
                value: body.to_string(),
            },
            Span::Verbatim => Inline::Verbatim {
                value: body.to_string(),
            },
        };
        Some((element, &rest[end + 2..]))
    }

    /// Byte offset of the next marker character or `[[`.
    fn next_candidate(text: &str) -> Option<usize> {
        let bytes = text.as_bytes();
        (0..bytes.len()).find(|&i| {
            span_for(bytes[i]).is_some() || (bytes[i] == b'[' && bytes.get(i + 1) == Some(&b'['))
        })
    }

}

pub mod parser {
    //! Single-pass tree builder over the token stream.
    //!
    //! The builder keeps one token of lookahead. Open headlines live on an
    //! explicit stack; a headline closes when one of the same or a shallower
    //! level arrives, and closed headlines attach to the next open one (or to
    //! the document). Block and drawer bodies are rebuilt line by line from the
    //! tokens until the matching end marker. Nothing here fails: problems are
    //! recorded as diagnostics next to a best-effort tree.

    use crate::config::ParseOptions;
    use crate::core::*;
    use crate::diagnostics::{Diagnostic, TraceEvent, TraceSink};
    use crate::inline::parse_inline;
    use crate::lexer::Lexer;
    use crate::token::{Token, TokenKind};
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::{IndexMap, IndexSet};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{is_not, tag, take_while1, take_while_m_n},
        character::complete::{anychar, char, digit1, multispace0, one_of, satisfy, space0, space1},
        combinator::{map, map_opt, map_res, opt, rest, value},
        sequence::{delimited, pair, preceded, terminated, tuple},
    };
    use serde::Serialize;
    use std::sync::Arc;

    type PResult<'a, T> = IResult<&'a str, T>;

    /// Outcome of a parse run. The document is always present, possibly partial.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Parsed {
        pub document: Document,
        pub diagnostics: Vec<Diagnostic>,
    }

    impl Parsed {
        /// Diagnostics rendered as `line <n>: <message>`.
        pub fn messages(&self) -> Vec<String> {
            self.diagnostics.iter().map(ToString::to_string).collect()
        }

        pub fn is_clean(&self) -> bool {
            self.diagnostics.is_empty()
        }
    }

    pub fn parse_document(input: &str) -> Parsed {
        parse_document_with(input, &ParseOptions::default())
    }

    pub fn parse_document_with(input: &str, options: &ParseOptions) -> Parsed {
        Parser::new(input, options).parse()
    }

    pub struct Parser<'a> {
        lexer: Lexer<'a>,
        cur: Token<'a>,
        peek: Token<'a>,
        diagnostics: Vec<Diagnostic>,
        sink: Arc<dyn TraceSink>,
    }

    impl<'a> Parser<'a> {
        pub fn new(input: &'a str, options: &ParseOptions) -> Self {
            let mut lexer = Lexer::with_options(input, options);
            let cur = lexer.next_token();
            let peek = lexer.next_token();
            Self {
                lexer,
                cur,
                peek,
                diagnostics: Vec::new(),
                sink: Arc::clone(&options.sink),
            }
        }

        pub fn parse(mut self) -> Parsed {
            let mut document = Document::default();
            let mut open: Vec<Headline> = Vec::new();

            while !self.cur.is(TokenKind::Eof) {
                if self.lexer.check_cancelled() {
                    break;
                }
                match self.parse_node() {
                    Some(Node::Headline(headline)) => {
                        while open.last().is_some_and(|top| top.level >= headline.level) {
                            close_headline(&mut open, &mut document);
                        }
                        open.push(headline);
                    }
                    Some(node) => match open.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => document.children.push(node),
                    },
                    None => {}
                }
                self.next_token();
            }
            while !open.is_empty() {
                close_headline(&mut open, &mut document);
            }

            if let Some(err) = self.lexer.error() {
                let message = err.to_string();
                self.error(message);
            }
            self.sink.trace(&TraceEvent::Finished {
                nodes: document.children.len(),
                diagnostics: self.diagnostics.len(),
            });
            Parsed {
                document,
                diagnostics: self.diagnostics,
            }
        }

        fn next_token(&mut self) {
            self.cur = self.peek;
            self.peek = self.lexer.next_token();
        }

        fn error(&mut self, message: impl Into<String>) {
            let diagnostic = Diagnostic::new(self.cur.line, message);
            self.sink.trace(&TraceEvent::Diagnostic(&diagnostic));
            self.diagnostics.push(diagnostic);
        }

        /// Builds the construct starting at `cur`, leaving `cur` on its last token.
        fn parse_node(&mut self) -> Option<Node> {
            let line = self.cur.line;
            let node = match self.cur.kind {
                TokenKind::Heading => Some(Node::Headline(self.parse_headline())),
                TokenKind::Keyword => self.parse_keyword().map(Node::Keyword),
                TokenKind::BlockBegin => Some(Node::Block(self.parse_block())),
                TokenKind::DrawerBegin => Some(Node::Drawer(self.parse_drawer())),
                TokenKind::ListItem => Some(Node::List(self.parse_list())),
                TokenKind::TableRow | TokenKind::TableSeparator => {
                    Some(Node::Table(self.parse_table()))
                }
                TokenKind::Comment => Some(Node::Comment(comment(self.cur.literal))),
                TokenKind::Text => text_line(self.cur.literal),
                TokenKind::BlockEnd => {
                    let marker = self.cur.literal.trim().to_string();
                    self.error(format!("{marker:?} has no matching block begin"));
                    None
                }
                TokenKind::DrawerEnd => {
                    self.error(":END: outside of a drawer");
                    None
                }
                TokenKind::Invalid => {
                    let literal = self.cur.literal.to_string();
                    self.error(format!("invalid token {literal:?}"));
                    None
                }
                TokenKind::Newline | TokenKind::Eof => None,
            };
            if let Some(node) = &node {
                self.sink.trace(&TraceEvent::Node {
                    kind: node.kind_name(),
                    line,
                });
            }
            node
        }

        /* ------------------------------ Headline ------------------------------ */

        fn parse_headline(&mut self) -> Headline {
            let mut headline = Headline::new(self.cur.literal.len());
            if !self.peek.is(TokenKind::Text) {
                return headline;
            }
            self.next_token();

            let (text, tags) = split_tags(self.cur.literal.trim());
            let (text, keyword) = split_todo_keyword(text);
            let (text, priority) = split_priority(text);
            headline.keyword = keyword;
            headline.priority = priority;
            headline.title = text.trim().to_string();
            headline.tags = tags;
            headline
        }

        /* ------------------------------ Keyword ------------------------------- */

        fn parse_keyword(&mut self) -> Option<Keyword> {
            let literal = self.cur.literal;
            let body = literal.get(2..).unwrap_or_default();
            let (key, value) = body.split_once(':').unwrap_or((body, ""));
            let key = key.trim();
            if key.is_empty() {
                self.error(format!("empty keyword key in {:?}", literal.trim_end()));
                return None;
            }
            if key.contains(char::is_whitespace) {
                self.error(format!(
                    "invalid keyword format: expected #+KEY: VALUE, got {:?}",
                    literal.trim_end()
                ));
                return None;
            }
            Some(Keyword {
                key: key.to_ascii_uppercase(),
                value: value.trim().to_string(),
            })
        }

        /* --------------------------- Block / drawer --------------------------- */

        fn parse_block(&mut self) -> Block {
            let header = self.cur.literal.get("#+BEGIN_".len()..).unwrap_or_default();
            let mut fields = header.split_whitespace();
            let kind = fields.next().map(str::to_ascii_uppercase).unwrap_or_default();
            let language = fields.next().map(str::to_string);
            let params = fields.collect::<Vec<_>>().join(" ");

            let lines = self.read_body(|token| {
                token.is(TokenKind::BlockEnd) && end_marker_kind(token.literal).eq_ignore_ascii_case(&kind)
            });
            if self.cur.is(TokenKind::Eof) {
                log::debug!("block {kind} runs to end of input");
            }
            Block {
                kind,
                language,
                params: (!params.is_empty()).then_some(params),
                content: lines.join("\n"),
            }
        }

        fn parse_drawer(&mut self) -> Drawer {
            let name = self.cur.literal.trim().trim_matches(':').to_string();
            let lines = self.read_body(|token| token.is(TokenKind::DrawerEnd));
            let body = if name == "PROPERTIES" {
                let properties: IndexMap<String, String> = lines
                    .iter()
                    .filter_map(|line| property_line(line.trim()).ok())
                    .map(|(_, (key, value))| (key.to_string(), value.to_string()))
                    .collect();
                DrawerBody::Properties(properties)
            } else {
                DrawerBody::Raw(lines.join("\n"))
            };
            Drawer { name, body }
        }

        /// Reassembles the physical lines following the begin marker until a
        /// line starting with a token accepted by `is_end`. Leaves `cur` on the
        /// end marker, or on `Eof` when the body is unterminated.
        fn read_body(&mut self, is_end: impl Fn(&Token<'_>) -> bool) -> Vec<String> {
            self.next_token();
            if self.cur.is(TokenKind::Newline) {
                self.next_token();
            }

            let mut lines = Vec::new();
            let mut line = String::new();
            while !self.cur.is(TokenKind::Eof) {
                if self.cur.is(TokenKind::Newline) {
                    lines.push(std::mem::take(&mut line));
                } else if line.is_empty() && is_end(&self.cur) {
                    return lines;
                } else {
                    line.push_str(self.cur.literal);
                }
                self.next_token();
            }
            if !line.is_empty() {
                lines.push(line);
            }
            lines
        }

        /* -------------------------------- List -------------------------------- */

        fn parse_list(&mut self) -> List {
            let ordered = starts_ordered(self.cur.literal.trim_start());
            let mut flat = Vec::new();
            loop {
                flat.push(list_item(self.cur.literal));
                if self.peek.is(TokenKind::Newline) {
                    self.next_token();
                }
                // a single blank line may separate items
                if self.peek.is(TokenKind::Newline) {
                    self.next_token();
                } else if self.peek.is(TokenKind::Text) && self.peek.literal.trim().is_empty() {
                    self.next_token();
                    if self.peek.is(TokenKind::Newline) {
                        self.next_token();
                    }
                }
                if !self.peek.is(TokenKind::ListItem) {
                    break;
                }
                self.next_token();
            }
            List {
                ordered,
                items: nest_items(flat),
            }
        }

        /* -------------------------------- Table ------------------------------- */

        fn parse_table(&mut self) -> Table {
            let mut rows = vec![table_row(&self.cur)];
            loop {
                if self.peek.is(TokenKind::Newline) {
                    self.next_token();
                }
                if !matches!(
                    self.peek.kind,
                    TokenKind::TableRow | TokenKind::TableSeparator
                ) {
                    break;
                }
                self.next_token();
                rows.push(table_row(&self.cur));
            }
            Table { rows }
        }
    }

    fn close_headline(open: &mut Vec<Headline>, document: &mut Document) {
        let Some(done) = open.pop() else {
            return;
        };
        match open.last_mut() {
            Some(parent) => parent.children.push(Node::Headline(done)),
            None => document.children.push(Node::Headline(done)),
        }
    }

    /* ---------------------------- Line helpers ---------------------------- */

    fn is_tag_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '#' | '%' | ':')
    }

    /// Splits a trailing `:tag1:tag2:` group off a headline title.
    fn split_tags(text: &str) -> (&str, IndexSet<String>) {
        let Some(start) = text
            .char_indices()
            .rev()
            .take_while(|&(_, c)| is_tag_char(c))
            .last()
            .map(|(i, _)| i)
        else {
            return (text, IndexSet::new());
        };
        let (before, group) = text.split_at(start);
        let well_formed = group.len() >= 3
            && group.starts_with(':')
            && group.ends_with(':')
            && before.ends_with(char::is_whitespace);
        if !well_formed {
            return (text, IndexSet::new());
        }
        let tags = group
            .split(':')
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        (before.trim_end(), tags)
    }

    fn split_todo_keyword(text: &str) -> (&str, Option<TodoKeyword>) {
        for keyword in [TodoKeyword::Todo, TodoKeyword::Done] {
            let word = keyword.as_str();
            if text == word {
                return ("", Some(keyword));
            }
            if let Some(rest) = text.strip_prefix(word).and_then(|r| r.strip_prefix(' ')) {
                return (rest.trim(), Some(keyword));
            }
        }
        (text, None)
    }

    fn priority_cookie(i: &str) -> PResult<'_, Priority> {
        map(
            terminated(
                delimited(tag("[#"), satisfy(|c| c.is_ascii_uppercase()), char(']')),
                multispace0,
            ),
            Priority,
        )(i)
    }

    fn split_priority(text: &str) -> (&str, Option<Priority>) {
        match priority_cookie(text) {
            Ok((rest, priority)) => (rest, Some(priority)),
            Err(_) => (text, None),
        }
    }

    fn end_marker_kind(literal: &str) -> &str {
        literal
            .get("#+END_".len()..)
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or_default()
    }

    /// `:KEY: value` inside a properties drawer.
    fn property_line(i: &str) -> PResult<'_, (&str, &str)> {
        map(
            tuple((char(':'), is_not(":"), char(':'), space0, rest)),
            |(_, key, _, _, value)| (key, value),
        )(i)
    }

    fn comment(literal: &str) -> Comment {
        let content = literal
            .strip_prefix("# ")
            .or_else(|| literal.strip_prefix('#'))
            .unwrap_or(literal);
        Comment {
            content: content.to_string(),
        }
    }

    /// Plain lines: blank ones vanish, five or more dashes form a rule.
    fn text_line(literal: &str) -> Option<Node> {
        let trimmed = literal.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.len() >= 5 && trimmed.bytes().all(|b| b == b'-') {
            return Some(Node::HorizontalRule);
        }
        Some(Node::Paragraph(Paragraph {
            raw: literal.to_string(),
            inline: parse_inline(literal),
        }))
    }

    fn table_row(token: &Token<'_>) -> TableRow {
        if token.is(TokenKind::TableSeparator) {
            return TableRow {
                cells: Vec::new(),
                separator: true,
            };
        }
        let cells = token
            .literal
            .trim()
            .trim_matches('|')
            .split('|')
            .map(|cell| cell.trim().to_string())
            .collect();
        TableRow {
            cells,
            separator: false,
        }
    }

    /* ------------------------------- Lists -------------------------------- */

    /// A list item before nesting, with the ordering of its own marker.
    struct FlatItem {
        item: ListItem,
        ordered: bool,
    }

    fn starts_ordered(text: &str) -> bool {
        text.starts_with(|c: char| c.is_ascii_digit())
    }

    fn indentation(line: &str) -> usize {
        line.chars()
            .map_while(|c| match c {
                ' ' => Some(1),
                '\t' => Some(2),
                _ => None,
            })
            .sum()
    }

    /// Strips `- `, `+ `, `N. ` or `N) `. `None` when the marker is malformed.
    fn strip_list_marker(line: &str) -> Option<&str> {
        if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("+ ")) {
            return Some(rest);
        }
        if line == "-" || line == "+" {
            return Some("");
        }
        let digits = line.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let after = &line[digits..];
        let after = after.strip_prefix('.').or_else(|| after.strip_prefix(')'))?;
        if after.is_empty() {
            Some("")
        } else {
            after.strip_prefix(' ')
        }
    }

    fn checkbox(i: &str) -> PResult<'_, Checkbox> {
        delimited(
            pair(space0, char('[')),
            map(one_of(" xX-"), |mark| match mark {
                ' ' => Checkbox::Unchecked,
                '-' => Checkbox::Partial,
                _ => Checkbox::Checked,
            }),
            pair(char(']'), space0),
        )(i)
    }

    fn list_item(literal: &str) -> FlatItem {
        let trimmed = literal.trim();
        let content = strip_list_marker(trimmed).unwrap_or(trimmed);
        let (content, checkbox) = match checkbox(content) {
            Ok((rest, mark)) => (rest, Some(mark)),
            Err(_) => (content, None),
        };
        FlatItem {
            ordered: starts_ordered(trimmed),
            item: ListItem {
                indent: indentation(literal),
                checkbox,
                content: content.trim().to_string(),
                children: Vec::new(),
            },
        }
    }

    /// Regroups a flat run of items by indentation. An item closes when a
    /// later item is indented the same or less; closed items go into the
    /// trailing nested list of the item below them on the stack.
    fn nest_items(flat: Vec<FlatItem>) -> Vec<ListItem> {
        let mut top = Vec::new();
        let mut open: Vec<FlatItem> = Vec::new();
        for next in flat {
            while open
                .last()
                .is_some_and(|item| item.item.indent >= next.item.indent)
            {
                close_item(&mut open, &mut top);
            }
            open.push(next);
        }
        while !open.is_empty() {
            close_item(&mut open, &mut top);
        }
        top
    }

    fn close_item(open: &mut Vec<FlatItem>, top: &mut Vec<ListItem>) {
        let Some(done) = open.pop() else {
            return;
        };
        let Some(parent) = open.last_mut() else {
            top.push(done.item);
            return;
        };
        if let Some(Node::List(list)) = parent.item.children.last_mut() {
            list.items.push(done.item);
            return;
        }
        parent.item.children.push(Node::List(List {
            ordered: done.ordered,
            items: vec![done.item],
        }));
    }

    /* ----------------------------- Timestamps ----------------------------- */

    /// First timestamp (or range) found anywhere in `text`.
    pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
        scan_timestamps(text).next()
    }

    /// Every timestamp in `text`, left to right.
    pub fn find_timestamps(text: &str) -> Vec<Timestamp> {
        scan_timestamps(text).collect()
    }

    fn scan_timestamps(text: &str) -> impl Iterator<Item = Timestamp> + '_ {
        let mut rest = text;
        std::iter::from_fn(move || {
            while let Some(pos) = rest.find(['<', '[']) {
                match timestamp_range(&rest[pos..]) {
                    Ok((after, ts)) => {
                        rest = after;
                        return Some(ts);
                    }
                    Err(_) => rest = &rest[pos + 1..],
                }
            }
            rest = "";
            None
        })
    }

    fn timestamp_range(i: &str) -> PResult<'_, Timestamp> {
        let (i, mut start) = timestamp(i)?;
        match preceded(tag("--"), timestamp)(i) {
            Ok((after, end)) if end.active == start.active && start.end.is_none() => {
                start.end = Some(TimestampEnd {
                    date: Some(end.date),
                    time: end.time,
                });
                Ok((after, start))
            }
            _ => Ok((i, start)),
        }
    }

    fn timestamp(i: &str) -> PResult<'_, Timestamp> {
        let (i, open) = one_of("<[")(i)?;
        let close = if open == '<' { '>' } else { ']' };
        let (i, date) = date(i)?;
        let (i, _) = opt(preceded(space1, take_while1(char::is_alphabetic)))(i)?;
        let (i, time) = opt(preceded(space1, clock_time))(i)?;
        let (i, end_time) = match time {
            Some(_) => opt(preceded(char('-'), clock_time))(i)?,
            None => (i, None),
        };
        let (i, repeater) = opt(preceded(space1, repeater))(i)?;
        let (i, warning) = opt(preceded(space1, warning))(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char(close)(i)?;
        Ok((
            i,
            Timestamp {
                active: open == '<',
                date,
                time,
                repeater,
                warning,
                end: end_time.map(|t| TimestampEnd {
                    date: None,
                    time: Some(t),
                }),
            },
        ))
    }

    fn number(min: usize, max: usize) -> impl Fn(&str) -> PResult<'_, u32> {
        move |i: &str| {
            map_res(
                take_while_m_n(min, max, |c: char| c.is_ascii_digit()),
                str::parse::<u32>,
            )(i)
        }
    }

    fn date(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((number(4, 4), char('-'), number(2, 2), char('-'), number(2, 2))),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(i32::try_from(y).ok()?, m, d),
        )(i)
    }

    fn clock_time(i: &str) -> PResult<'_, NaiveTime> {
        map_opt(
            tuple((number(1, 2), char(':'), number(2, 2))),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0),
        )(i)
    }

    fn interval(i: &str) -> PResult<'_, Interval> {
        let (i, count) = map_res(digit1, str::parse::<u32>)(i)?;
        let (i, unit) = map_opt(anychar, IntervalUnit::from_char)(i)?;
        Ok((i, Interval { value: count, unit }))
    }

    fn repeater(i: &str) -> PResult<'_, Repeater> {
        let (i, kind) = alt((
            value(RepeaterKind::FromBase, tag("++")),
            value(RepeaterKind::FromNow, tag(".+")),
            value(RepeaterKind::FromLast, tag("+")),
        ))(i)?;
        let (i, interval) = interval(i)?;
        Ok((i, Repeater { kind, interval }))
    }

    fn warning(i: &str) -> PResult<'_, Interval> {
        preceded(char('-'), interval)(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::{CancelFlag, Limits};
        use crate::diagnostics::NullSink;
        use pretty_assertions::assert_eq;
        use proptest::prelude::*;
        use std::sync::Mutex;

        fn parse(input: &str) -> Parsed {
            parse_document_with(input, &ParseOptions::default().with_sink(Arc::new(NullSink)))
        }

        fn doc(input: &str) -> Document {
            let parsed = parse(input);
            assert!(parsed.is_clean(), "unexpected diagnostics: {:?}", parsed.messages());
            parsed.document
        }

        fn headline(node: &Node) -> &Headline {
            match node {
                Node::Headline(h) => h,
                other => panic!("expected headline, got {other:?}"),
            }
        }

        fn list(node: &Node) -> &List {
            match node {
                Node::List(l) => l,
                other => panic!("expected list, got {other:?}"),
            }
        }

        #[test]
        fn headlines_nest_by_level() {
            let d = doc("* A\n** B\n* C\n");
            assert_eq!(d.children.len(), 2);
            let a = headline(&d.children[0]);
            assert_eq!((a.level, a.title.as_str()), (1, "A"));
            assert_eq!(a.children.len(), 1);
            assert_eq!(headline(&a.children[0]).title, "B");
            let c = headline(&d.children[1]);
            assert_eq!(c.title, "C");
            assert!(c.children.is_empty());
        }

        #[test]
        fn skipped_levels_still_nest_under_nearest_shallower() {
            let d = doc("* A\n*** deep\n** mid\n");
            let a = headline(&d.children[0]);
            assert_eq!(a.children.len(), 2);
            assert_eq!(headline(&a.children[0]).level, 3);
            assert_eq!(headline(&a.children[1]).level, 2);
        }

        #[test]
        fn content_attaches_to_innermost_open_headline() {
            let d = doc("intro\n* A\nbody\n** B\nmore\n");
            assert!(matches!(d.children[0], Node::Paragraph(_)));
            let a = headline(&d.children[1]);
            assert!(matches!(a.children[0], Node::Paragraph(ref p) if p.raw == "body"));
            let b = headline(&a.children[1]);
            assert!(matches!(b.children[0], Node::Paragraph(ref p) if p.raw == "more"));
        }

        #[test]
        fn headline_todo_priority_and_tags() {
            let d = doc("* TODO [#A] Important task :work:urgent:\n");
            let h = headline(&d.children[0]);
            assert_eq!(h.keyword, Some(TodoKeyword::Todo));
            assert_eq!(h.priority, Some(Priority('A')));
            assert_eq!(h.title, "Important task");
            assert_eq!(
                h.tags.iter().map(String::as_str).collect::<Vec<_>>(),
                vec!["work", "urgent"]
            );
        }

        #[test]
        fn headline_edge_cases() {
            let d = doc("* DONE\n* TODOS are not keywords\n* ratio 1:2:\n* [#a] lowercase\n");
            let titles: Vec<_> = d.children.iter().map(headline).collect();
            assert_eq!(titles[0].keyword, Some(TodoKeyword::Done));
            assert_eq!(titles[0].title, "");
            assert_eq!(titles[1].keyword, None);
            assert_eq!(titles[1].title, "TODOS are not keywords");
            assert!(titles[2].tags.is_empty());
            assert_eq!(titles[2].title, "ratio 1:2:");
            assert_eq!(titles[3].priority, None);
            assert_eq!(titles[3].title, "[#a] lowercase");
        }

        #[test]
        fn utf8_headline_and_paragraph() {
            let d = doc("* 日本語のヘッドライン\nÜnïcödé text\n");
            let h = headline(&d.children[0]);
            assert_eq!(h.title, "日本語のヘッドライン");
            assert!(matches!(h.children[0], Node::Paragraph(ref p) if p.raw == "Ünïcödé text"));
        }

        #[test]
        fn keywords_are_uppercased_and_trimmed() {
            let d = doc("#+title:  My Doc \n#+AUTHOR: Someone\n#+EMPTY:\n");
            assert_eq!(d.title(), Some("My Doc"));
            assert_eq!(d.keyword("author"), Some("Someone"));
            assert_eq!(d.keyword("EMPTY"), Some(""));
        }

        #[test]
        fn malformed_keywords_report_and_continue() {
            let parsed = parse("#+: nothing\n#+two words: x\nafter\n");
            assert_eq!(
                parsed.messages(),
                vec![
                    r##"line 1: empty keyword key in "#+: nothing""##.to_string(),
                    r##"line 2: invalid keyword format: expected #+KEY: VALUE, got "#+two words: x""##
                        .to_string(),
                ]
            );
            assert_eq!(parsed.document.children.len(), 1);
        }

        #[test]
        fn src_block_with_language() {
            let d = doc("#+BEGIN_SRC go\nfmt.Println(1)\n#+END_SRC\n");
            assert_eq!(
                d.children,
                vec![Node::Block(Block {
                    kind: "SRC".into(),
                    language: Some("go".into()),
                    params: None,
                    content: "fmt.Println(1)".into(),
                })]
            );
        }

        #[test]
        fn block_keeps_inner_lines_verbatim() {
            let d = doc("#+begin_example -n :tangle x\n* not a headline\n\n- not a list\n#+END_SRC\n#+end_example\nafter\n");
            let Node::Block(block) = &d.children[0] else {
                panic!("expected block");
            };
            assert_eq!(block.kind, "EXAMPLE");
            assert_eq!(block.language.as_deref(), Some("-n"));
            assert_eq!(block.params.as_deref(), Some(":tangle x"));
            assert_eq!(block.content, "* not a headline\n\n- not a list\n#+END_SRC");
            assert!(matches!(d.children[1], Node::Paragraph(ref p) if p.raw == "after"));
        }

        #[test]
        fn unterminated_block_runs_to_end() {
            let d = doc("#+BEGIN_QUOTE\nline one\nline two");
            let Node::Block(block) = &d.children[0] else {
                panic!("expected block");
            };
            assert_eq!(block.content, "line one\nline two");
            assert_eq!(d.children.len(), 1);
        }

        #[test]
        fn properties_drawer() {
            let d = doc("* Heading\n:PROPERTIES:\n:ID: 12345\n:CREATED: [2024-01-15]\nnot a property\n:END:\n");
            let h = headline(&d.children[0]);
            let Node::Drawer(drawer) = &h.children[0] else {
                panic!("expected drawer");
            };
            assert_eq!(drawer.name, "PROPERTIES");
            assert_eq!(drawer.property("ID"), Some("12345"));
            assert_eq!(drawer.property("CREATED"), Some("[2024-01-15]"));
            let DrawerBody::Properties(props) = &drawer.body else {
                panic!("expected properties");
            };
            assert_eq!(props.keys().collect::<Vec<_>>(), vec!["ID", "CREATED"]);
        }

        #[test]
        fn other_drawers_keep_raw_text() {
            let d = doc(":LOGBOOK:\n- State \"DONE\"\nCLOCK: x\n:END:\n");
            assert_eq!(
                d.children,
                vec![Node::Drawer(Drawer {
                    name: "LOGBOOK".into(),
                    body: DrawerBody::Raw("- State \"DONE\"\nCLOCK: x".into()),
                })]
            );
        }

        #[test]
        fn stray_end_markers_are_reported() {
            let parsed = parse("#+END_SRC\ntext\n:END:\n");
            assert_eq!(
                parsed.messages(),
                vec![
                    r##"line 1: "#+END_SRC" has no matching block begin"##.to_string(),
                    "line 3: :END: outside of a drawer".to_string(),
                ]
            );
            assert_eq!(parsed.document.children.len(), 1);
        }

        #[test]
        fn control_character_lines_are_reported() {
            let parsed = parse("* H\n\u{0}junk\nafter\n");
            assert_eq!(
                parsed.messages(),
                vec![r#"line 2: invalid token "\0junk""#.to_string()]
            );
            let Node::Headline(h) = &parsed.document.children[0] else {
                panic!("expected headline");
            };
            assert_eq!(h.children.len(), 1);
            assert!(matches!(&h.children[0], Node::Paragraph(p) if p.raw == "after"));
        }

        #[test]
        fn nested_lists_by_indentation() {
            let d = doc("- a\n  - b\n  - c\n- d\n");
            let outer = list(&d.children[0]);
            assert!(!outer.ordered);
            assert_eq!(outer.items.len(), 2);
            assert_eq!(outer.items[0].content, "a");
            assert_eq!(outer.items[1].content, "d");
            let inner = outer.items[0].nested().expect("nested list");
            assert_eq!(
                inner.items.iter().map(|i| i.content.as_str()).collect::<Vec<_>>(),
                vec!["b", "c"]
            );
            assert_eq!(outer.items[0].children.len(), 1);
        }

        #[test]
        fn deeper_then_shallower_items_share_one_nested_list() {
            let d = doc("- a\n    - b\n  - c\n- d\n");
            let outer = list(&d.children[0]);
            assert_eq!(outer.items.len(), 2);
            let inner = outer.items[0].nested().expect("nested list");
            assert_eq!(inner.items.len(), 2);
            assert_eq!(outer.items[0].children.len(), 1);
        }

        #[test]
        fn checkboxes() {
            let d = doc("- [ ] x\n- [X] y\n- [-] z\n- [x] lower\n- plain\n");
            let items = &list(&d.children[0]).items;
            let got: Vec<_> = items
                .iter()
                .map(|i| (i.checkbox, i.content.as_str()))
                .collect();
            assert_eq!(
                got,
                vec![
                    (Some(Checkbox::Unchecked), "x"),
                    (Some(Checkbox::Checked), "y"),
                    (Some(Checkbox::Partial), "z"),
                    (Some(Checkbox::Checked), "lower"),
                    (None, "plain"),
                ]
            );
        }

        #[test]
        fn ordered_marker_is_stripped_before_checkbox() {
            let d = doc("1. [X] y\n2) [ ] z\n10. [-] ten\n");
            let outer = list(&d.children[0]);
            assert!(outer.ordered);
            let got: Vec<_> = outer
                .items
                .iter()
                .map(|i| (i.checkbox, i.content.as_str()))
                .collect();
            assert_eq!(
                got,
                vec![
                    (Some(Checkbox::Checked), "y"),
                    (Some(Checkbox::Unchecked), "z"),
                    (Some(Checkbox::Partial), "ten"),
                ]
            );
        }

        #[test]
        fn ordered_list_and_mixed_nesting() {
            let d = doc("1. First\n2) Second\n   - sub\n");
            let outer = list(&d.children[0]);
            assert!(outer.ordered);
            assert_eq!(outer.items[0].content, "First");
            assert_eq!(outer.items[1].content, "Second");
            assert!(!outer.items[1].nested().expect("nested").ordered);
        }

        #[test]
        fn blank_line_separation_in_lists() {
            let d = doc("- a\n\n- b\n\n\n- c\n");
            assert_eq!(d.children.len(), 2);
            assert_eq!(list(&d.children[0]).items.len(), 2);
            assert_eq!(list(&d.children[1]).items.len(), 1);
        }

        #[test]
        fn whitespace_only_line_counts_as_blank_in_lists() {
            let d = doc("- a\n   \n- b\n");
            assert_eq!(d.children.len(), 1);
            let contents: Vec<_> = list(&d.children[0])
                .items
                .iter()
                .map(|i| i.content.as_str())
                .collect();
            assert_eq!(contents, vec!["a", "b"]);

            let d = doc("- a\n \t\n\n- b\n");
            assert_eq!(d.children.len(), 2);
        }

        #[test]
        fn tables_with_separator() {
            let d = doc("| Name | Age |\n|------+-----|\n| Bob  |  42 |\n\n| other |\n");
            let Node::Table(table) = &d.children[0] else {
                panic!("expected table");
            };
            assert_eq!(table.rows.len(), 3);
            assert_eq!(table.rows[0].cells, vec!["Name", "Age"]);
            assert!(table.rows[1].separator);
            assert!(table.rows[1].cells.is_empty());
            assert_eq!(table.rows[2].cells, vec!["Bob", "42"]);
            assert!(matches!(d.children[1], Node::Table(ref t) if t.rows.len() == 1));
        }

        #[test]
        fn comments_rules_and_blank_lines() {
            let d = doc("# note\n#\n\n   \n-----\n");
            assert_eq!(
                d.children,
                vec![
                    Node::Comment(Comment {
                        content: "note".into()
                    }),
                    Node::Comment(Comment {
                        content: String::new()
                    }),
                    Node::HorizontalRule,
                ]
            );
        }

        #[test]
        fn complex_document() {
            let input = "#+TITLE: Project\n\n* TODO Plan :work:\n:PROPERTIES:\n:OWNER: sam\n:END:\nSome *bold* text.\n- [ ] step one\n- [X] step two\n** Details\n#+BEGIN_SRC sh\necho hi\n#+END_SRC\n| a | b |\n* DONE Ship\n";
            let d = doc(input);
            assert_eq!(d.title(), Some("Project"));
            let headlines = d.headlines();
            assert_eq!(
                headlines.iter().map(|h| h.title.as_str()).collect::<Vec<_>>(),
                vec!["Plan", "Details", "Ship"]
            );
            let plan = headlines[0];
            let kinds: Vec<_> = plan.children.iter().map(Node::kind_name).collect();
            assert_eq!(kinds, vec!["drawer", "paragraph", "list", "headline"]);
            let details = headline(&plan.children[3]);
            let kinds: Vec<_> = details.children.iter().map(Node::kind_name).collect();
            assert_eq!(kinds, vec!["block", "table"]);
        }

        #[test]
        fn paragraph_inline_markup() {
            let d = doc("See [[https://orgmode.org][Org]] for ~details~.\n");
            let Node::Paragraph(p) = &d.children[0] else {
                panic!("expected paragraph");
            };
            assert_eq!(p.plain_text(), "See Org for details.");
        }

        #[test]
        fn size_limit_yields_empty_document() {
            let input = "* headline\n".repeat(1000);
            let options = ParseOptions::default()
                .with_sink(Arc::new(NullSink))
                .with_limits(Limits {
                    max_input_size: 100,
                    ..Limits::default()
                });
            let parsed = parse_document_with(&input, &options);
            assert!(parsed.document.children.is_empty());
            assert_eq!(
                parsed.messages(),
                vec!["line 1: input exceeds maximum allowed size (11000 bytes > 100 bytes)".to_string()]
            );
        }

        #[test]
        fn long_line_truncates_and_stops() {
            let options = ParseOptions::default()
                .with_sink(Arc::new(NullSink))
                .with_max_line_length(10);
            let parsed = parse_document_with("short\nthis line is far too long\n* never\n", &options);
            let raws: Vec<_> = parsed
                .document
                .children
                .iter()
                .map(|n| match n {
                    Node::Paragraph(p) => p.raw.as_str(),
                    _ => "",
                })
                .collect();
            assert_eq!(raws, vec!["short", "this line "]);
            assert_eq!(
                parsed.messages(),
                vec!["line 2: line exceeds maximum allowed length (10 characters)".to_string()]
            );
        }

        #[test]
        fn pre_cancelled_run_is_empty() {
            let cancel = CancelFlag::new();
            cancel.cancel();
            let options = ParseOptions::default()
                .with_sink(Arc::new(NullSink))
                .with_cancel(cancel);
            let parsed = parse_document_with("* a\n* b\n", &options);
            assert!(parsed.document.children.is_empty());
            assert_eq!(parsed.messages(), vec!["line 1: parsing cancelled".to_string()]);
        }

        /// Cancels the run as soon as the first node is built.
        struct CancelOnFirstNode(CancelFlag);

        impl TraceSink for CancelOnFirstNode {
            fn trace(&self, event: &TraceEvent<'_>) {
                if matches!(event, TraceEvent::Node { .. }) {
                    self.0.cancel();
                }
            }
        }

        #[test]
        fn cancellation_mid_run_keeps_partial_tree() {
            let cancel = CancelFlag::new();
            let options = ParseOptions::default()
                .with_cancel(cancel.clone())
                .with_sink(Arc::new(CancelOnFirstNode(cancel)));
            let parsed = parse_document_with("* a\n* b\n* c\n", &options);
            assert_eq!(parsed.document.children.len(), 1);
            assert_eq!(headline(&parsed.document.children[0]).title, "a");
            assert_eq!(parsed.messages(), vec!["line 1: parsing cancelled".to_string()]);
        }

        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);

        impl TraceSink for Recorder {
            fn trace(&self, event: &TraceEvent<'_>) {
                let entry = match event {
                    TraceEvent::Token(t) => format!("token {:?}", t.kind),
                    TraceEvent::Node { kind, line } => format!("node {kind}@{line}"),
                    TraceEvent::Diagnostic(d) => format!("diag {d}"),
                    TraceEvent::Limit(e) => format!("limit {e}"),
                    TraceEvent::Finished { nodes, .. } => format!("done {nodes}"),
                };
                if let Ok(mut events) = self.0.lock() {
                    events.push(entry);
                }
            }
        }

        #[test]
        fn sink_observes_steps_without_changing_result() {
            let recorder = Arc::new(Recorder::default());
            let input = "* A\ntext\n";
            let traced = parse_document_with(input, &ParseOptions::default().with_sink(recorder.clone()));
            assert_eq!(traced, parse(input));

            let events = recorder.0.lock().map(|e| e.clone()).unwrap_or_default();
            assert!(events.contains(&"token Heading".to_string()));
            assert!(events.contains(&"node headline@1".to_string()));
            assert!(events.contains(&"node paragraph@2".to_string()));
            assert_eq!(events.last().map(String::as_str), Some("done 1"));
        }

        #[test]
        fn adversarial_inputs_terminate() {
            let stars = "*".repeat(5000);
            let brackets = "[[".repeat(1000);
            let markers = "*/+_~=".repeat(2000);
            for input in [stars.as_str(), brackets.as_str(), markers.as_str(), "\n\n\n", ""] {
                let _ = parse(input);
            }
            let deep = format!("{} x\n", "*".repeat(3000));
            assert_eq!(headline(&parse(&deep).document.children[0]).level, 3000);
        }

        #[test]
        fn timestamps() {
            let ts = parse_timestamp("<2024-01-15 Mon>").expect("active date");
            assert!(ts.active);
            assert_eq!(ts.date, NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"));
            assert_eq!(ts.time, None);

            let ts = parse_timestamp("[2024-01-15 Mon 10:30]").expect("inactive with time");
            assert!(!ts.active);
            assert_eq!(ts.time, NaiveTime::from_hms_opt(10, 30, 0));

            let ts = parse_timestamp("DEADLINE: <2024-01-15 Mon +1w -2d>").expect("repeater");
            assert_eq!(
                ts.repeater,
                Some(Repeater {
                    kind: RepeaterKind::FromLast,
                    interval: Interval {
                        value: 1,
                        unit: IntervalUnit::Week
                    },
                })
            );
            assert_eq!(
                ts.warning,
                Some(Interval {
                    value: 2,
                    unit: IntervalUnit::Day
                })
            );

            let ts = parse_timestamp("<2024-01-15 Mon .+1d>").expect("restart repeater");
            assert_eq!(ts.repeater.map(|r| r.kind), Some(RepeaterKind::FromNow));
            let ts = parse_timestamp("<2024-01-15 ++2m>").expect("catch-up repeater");
            assert_eq!(ts.repeater.map(|r| r.kind), Some(RepeaterKind::FromBase));
        }

        #[test]
        fn timestamp_ranges() {
            let ts = parse_timestamp("<2024-01-15 Mon>--<2024-01-17 Wed>").expect("range");
            let end = ts.end.expect("range end");
            assert_eq!(end.date, NaiveDate::from_ymd_opt(2024, 1, 17));

            let ts = parse_timestamp("<2024-01-15 Mon 10:00-11:30>").expect("time range");
            let end = ts.end.expect("time range end");
            assert_eq!(end.date, None);
            assert_eq!(end.time, NaiveTime::from_hms_opt(11, 30, 0));

            let ts = parse_timestamp("<2024-01-15>--[2024-01-17]").expect("start only");
            assert_eq!(ts.end, None);
        }

        #[test]
        fn invalid_timestamps_are_skipped() {
            assert_eq!(parse_timestamp("<2024-13-45>"), None);
            assert_eq!(parse_timestamp("<2024-01-15]"), None);
            assert_eq!(parse_timestamp("no dates here"), None);
            let found = find_timestamps("[x] then <2024-02-30> then [2024-02-29] and <2025-03-01 Sat>");
            assert_eq!(
                found.iter().map(|t| t.date.to_string()).collect::<Vec<_>>(),
                vec!["2024-02-29", "2025-03-01"]
            );
        }

        proptest! {
            #[test]
            fn any_input_parses(input in "\\PC{0,300}") {
                let _ = parse(&input);
            }

            #[test]
            fn line_soup_parses(lines in prop::collection::vec(
                "[*#:|+ 0-9a-z\\-\\[\\]]{0,12}", 0..30)) {
                let input = lines.join("\n");
                let parsed = parse(&input);
                for d in &parsed.diagnostics {
                    prop_assert!(d.line >= 1);
                }
            }
        }
    }
}

pub mod format {
    //! Renders a tree back to markup. Output re-parses to a tree of the same
    //! shape; whitespace and marker spelling are normalized.

    use crate::core::*;
    use crate::lexer::is_table_separator;

    pub fn format_document(document: &Document) -> String {
        let mut out = String::new();
        render_nodes(&mut out, &document.children);
        out
    }

    pub fn render_node(node: &Node) -> String {
        let mut out = String::new();
        render_node_into(&mut out, node, 0);
        out
    }

    /// Siblings that would merge when placed back to back get blank lines
    /// between them: two for lists, one for tables.
    fn render_nodes(out: &mut String, nodes: &[Node]) {
        let mut prev: Option<&Node> = None;
        for node in nodes {
            match (prev, node) {
                (Some(Node::List(_)), Node::List(_)) => out.push_str("\n\n"),
                (Some(Node::Table(_)), Node::Table(_)) => out.push('\n'),
                _ => {}
            }
            render_node_into(out, node, 0);
            prev = Some(node);
        }
    }

    fn render_node_into(out: &mut String, node: &Node, depth: usize) {
        match node {
            Node::Headline(h) => render_headline(out, h),
            Node::Paragraph(p) => {
                out.push_str(&p.raw);
                out.push('\n');
            }
            Node::Keyword(k) => {
                out.push_str("#+");
                out.push_str(&k.key);
                out.push(':');
                if !k.value.is_empty() {
                    out.push(' ');
                    out.push_str(&k.value);
                }
                out.push('\n');
            }
            Node::Block(b) => render_block(out, b),
            Node::Drawer(d) => render_drawer(out, d),
            Node::List(l) => render_list(out, l, depth),
            Node::Table(t) => render_table(out, t),
            Node::Comment(c) if c.content.is_empty() => out.push_str("#\n"),
            Node::Comment(c) => {
                out.push_str("# ");
                out.push_str(&c.content);
                out.push('\n');
            }
            Node::HorizontalRule => out.push_str("-----\n"),
        }
    }

    fn render_headline(out: &mut String, h: &Headline) {
        out.push_str(&"*".repeat(h.level.max(1)));
        let mut parts: Vec<String> = Vec::new();
        if let Some(keyword) = h.keyword {
            parts.push(keyword.as_str().to_string());
        }
        if let Some(Priority(p)) = h.priority {
            parts.push(format!("[#{p}]"));
        }
        if !h.title.is_empty() {
            parts.push(h.title.clone());
        }
        out.push(' ');
        out.push_str(&parts.join(" "));
        if !h.tags.is_empty() {
            let tags: Vec<&str> = h.tags.iter().map(String::as_str).collect();
            out.push_str(&format!(" :{}:", tags.join(":")));
        }
        out.push('\n');
        render_nodes(out, &h.children);
    }

    fn render_block(out: &mut String, b: &Block) {
        out.push_str("#+BEGIN_");
        out.push_str(&b.kind);
        for extra in [&b.language, &b.params].into_iter().flatten() {
            out.push(' ');
            out.push_str(extra);
        }
        out.push('\n');
        if !b.content.is_empty() {
            out.push_str(&b.content);
            out.push('\n');
        }
        out.push_str(&format!("#+END_{}\n", b.kind));
    }

    fn render_drawer(out: &mut String, d: &Drawer) {
        out.push_str(&format!(":{}:\n", d.name));
        match &d.body {
            DrawerBody::Properties(props) => {
                for (key, value) in props {
                    if value.is_empty() {
                        out.push_str(&format!(":{key}:\n"));
                    } else {
                        out.push_str(&format!(":{key}: {value}\n"));
                    }
                }
            }
            DrawerBody::Raw(text) if text.is_empty() => {}
            DrawerBody::Raw(text) => {
                out.push_str(text);
                out.push('\n');
            }
        }
        out.push_str(":END:\n");
    }

    fn render_list(out: &mut String, list: &List, depth: usize) {
        let indent = "  ".repeat(depth);
        for (idx, item) in list.items.iter().enumerate() {
            out.push_str(&indent);
            if list.ordered {
                out.push_str(&format!("{}. ", idx + 1));
            } else {
                out.push_str("- ");
            }
            match item.checkbox {
                Some(Checkbox::Unchecked) => out.push_str("[ ] "),
                Some(Checkbox::Checked) => out.push_str("[X] "),
                Some(Checkbox::Partial) => out.push_str("[-] "),
                None => {}
            }
            out.push_str(&item.content);
            out.push('\n');
            for child in &item.children {
                match child {
                    Node::List(nested) => render_list(out, nested, depth + 1),
                    other => {
                        let child_indent = "  ".repeat(depth + 1);
                        for line in render_node(other).lines() {
                            out.push_str(&child_indent);
                            out.push_str(line);
                            out.push('\n');
                        }
                    }
                }
            }
        }
    }

    fn render_table(out: &mut String, t: &Table) {
        let columns = t.rows.iter().map(|r| r.cells.len()).max().unwrap_or(0).max(1);
        for row in &t.rows {
            if row.separator {
                out.push('|');
                out.push_str(&vec!["---"; columns].join("+"));
                out.push_str("|\n");
            } else {
                out.push_str(&render_row(&row.cells));
                out.push('\n');
            }
        }
    }

    /// Dash-only data rows are left open on the right; with a closing pipe
    /// they would read back as separators.
    fn render_row(cells: &[String]) -> String {
        let closed = format!("| {} |", cells.join(" | "));
        if !is_table_separator(&closed) {
            return closed;
        }
        let end = cells.iter().rposition(|c| !c.is_empty()).map_or(0, |i| i + 1);
        format!("| {}", cells[..end].join(" | "))
    }

    pub fn render_inlines(inlines: &[Inline]) -> String {
        let mut out = String::new();
        for inline in inlines {
            match inline {
                Inline::Text { value } => out.push_str(value),
                Inline::Emphasis { kind, children } => {
                    let marker = kind.marker();
                    out.push(marker);
                    out.push_str(&render_inlines(children));
                    out.push(marker);
                }
                Inline::Code { value } => {
                    out.push('~');
                    out.push_str(value);
                    out.push('~');
                }
                Inline::Verbatim { value } => {
                    out.push('=');
                    out.push_str(value);
                    out.push('=');
                }
                Inline::Link(link) if link.description.is_empty() => {
                    out.push_str(&format!("[[{}]]", link.url));
                }
                Inline::Link(link) => {
                    out.push_str(&format!("[[{}][{}]]", link.url, render_inlines(&link.description)));
                }
            }
        }
        out
    }

    pub fn render_timestamp(ts: &Timestamp) -> String {
        let (open, close) = if ts.active { ('<', '>') } else { ('[', ']') };
        let mut s = String::new();
        s.push(open);
        s.push_str(&ts.date.format("%Y-%m-%d %a").to_string());
        if let Some(t) = ts.time {
            s.push(' ');
            s.push_str(&t.format("%H:%M").to_string());
            if let Some(TimestampEnd {
                date: None,
                time: Some(end),
            }) = ts.end
            {
                s.push('-');
                s.push_str(&end.format("%H:%M").to_string());
            }
        }
        if let Some(r) = ts.repeater {
            s.push_str(&format!(
                " {}{}{}",
                r.kind.symbol(),
                r.interval.value,
                r.interval.unit.as_char()
            ));
        }
        if let Some(w) = ts.warning {
            s.push_str(&format!(" -{}{}", w.value, w.unit.as_char()));
        }
        s.push(close);

        if let Some(TimestampEnd {
            date: Some(end_date),
            time,
        }) = ts.end
        {
            let end = Timestamp {
                active: ts.active,
                date: end_date,
                time,
                repeater: None,
                warning: None,
                end: None,
            };
            s.push_str("--");
            s.push_str(&render_timestamp(&end));
        }
        s
    }

}
