//! A small PostgreSQL lexer.
//!
//! Only enough of the lexical grammar is understood to find keywords reliably:
//! comments, string literals, quoted identifiers and dollar quotes are
//! consumed as units so that a `;` or a keyword inside them is never mistaken
//! for statement structure.

/// A lexical token. Slices borrow from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// Unquoted identifier or keyword.
    Word(&'a str),
    /// Double-quoted identifier, without the surrounding quotes.
    QuotedIdent(&'a str),
    /// String literal as written, including quotes and any `E` prefix.
    /// Dollar-quoted bodies are reported here as well.
    Str(&'a str),
    Number(&'a str),
    /// Positional parameter (`$1`).
    Param(&'a str),
    Punct(char),
}

impl<'a> Token<'a> {
    /// Case-insensitive keyword comparison. Quoted identifiers never match.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    pub fn is_punct(&self, c: char) -> bool {
        matches!(self, Token::Punct(p) if *p == c)
    }

    /// Identifier value with PostgreSQL folding rules applied.
    pub fn ident(&self) -> Option<String> {
        match self {
            Token::Word(w) => Some(w.to_lowercase()),
            Token::QuotedIdent(q) => Some(q.replace("\"\"", "\"")),
            _ => None,
        }
    }

    /// Literal value of a setting argument: words, numbers and strings.
    pub fn setting_value(&self) -> Option<String> {
        match self {
            Token::Word(w) | Token::Number(w) => Some(w.to_lowercase()),
            Token::Str(s) => Some(string_value(s).to_lowercase()),
            _ => None,
        }
    }
}

/// A token with its byte range in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spanned<'a> {
    pub token: Token<'a>,
    pub start: usize,
    pub end: usize,
}

/// Iterator over the tokens of a SQL string. Whitespace and comments are
/// skipped. Unterminated literals and comments run to the end of the input.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match (self.peek(), self.peek_nth(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('-'), Some('-')) => match self.rest().find('\n') {
                    Some(i) => self.pos += i + 1,
                    None => self.pos = self.src.len(),
                },
                (Some('/'), Some('*')) => self.block_comment(),
                _ => return,
            }
        }
    }

    // Block comments nest in PostgreSQL.
    fn block_comment(&mut self) {
        self.pos += 2;
        let mut depth = 1usize;
        while depth > 0 {
            match self.bump() {
                None => return,
                Some('/') if self.peek() == Some('*') => {
                    self.bump();
                    depth += 1;
                }
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    /// Consume a quoted run starting at the opening quote. A doubled quote is
    /// an escaped quote; with `backslash` a backslash escapes the next char.
    /// Returns whether the closing quote was found.
    fn quoted(&mut self, quote: char, backslash: bool) -> bool {
        self.bump();
        loop {
            match self.bump() {
                None => return false,
                Some('\\') if backslash => {
                    self.bump();
                }
                Some(c) if c == quote => {
                    if self.peek() == Some(quote) {
                        self.bump();
                    } else {
                        return true;
                    }
                }
                _ => {}
            }
        }
    }

    /// Length of a `$tag$` opener at the current position, if there is one.
    fn dollar_tag_len(&self) -> Option<usize> {
        let rest = self.rest();
        let mut chars = rest.char_indices().skip(1);
        match chars.next() {
            Some((i, '$')) => return Some(i + 1),
            Some((_, c)) if c.is_alphabetic() || c == '_' => {}
            _ => return None,
        }
        for (i, c) in chars {
            if c == '$' {
                return Some(i + 1);
            }
            if !(c.is_alphanumeric() || c == '_') {
                return None;
            }
        }
        None
    }

    fn dollar_quoted(&mut self, tag_len: usize) {
        let tag = &self.src[self.pos..self.pos + tag_len];
        self.pos += tag_len;
        match self.rest().find(tag) {
            Some(i) => self.pos += i + tag_len,
            None => self.pos = self.src.len(),
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.bump();
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || !c.is_ascii()
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Spanned<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_trivia();
        let start = self.pos;
        let c = self.peek()?;

        let token = match c {
            '\'' => {
                self.quoted('\'', false);
                Token::Str(&self.src[start..self.pos])
            }
            'e' | 'E' if self.peek_nth(1) == Some('\'') => {
                self.bump();
                self.quoted('\'', true);
                Token::Str(&self.src[start..self.pos])
            }
            '"' => {
                let end = if self.quoted('"', false) {
                    self.pos - 1
                } else {
                    self.pos
                };
                Token::QuotedIdent(&self.src[start + 1..end])
            }
            '$' => {
                if self.peek_nth(1).is_some_and(|d| d.is_ascii_digit()) {
                    self.bump();
                    self.take_while(|d| d.is_ascii_digit());
                    Token::Param(&self.src[start..self.pos])
                } else if let Some(tag_len) = self.dollar_tag_len() {
                    self.dollar_quoted(tag_len);
                    Token::Str(&self.src[start..self.pos])
                } else {
                    self.bump();
                    Token::Punct('$')
                }
            }
            c if c.is_ascii_digit()
                || (c == '.' && self.peek_nth(1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                self.take_while(|d| d.is_ascii_alphanumeric() || d == '.' || d == '_');
                Token::Number(&self.src[start..self.pos])
            }
            c if is_ident_start(c) => {
                self.take_while(is_ident_continue);
                Token::Word(&self.src[start..self.pos])
            }
            c => {
                self.bump();
                Token::Punct(c)
            }
        };

        Some(Spanned {
            token,
            start,
            end: self.pos,
        })
    }
}

/// Value of a quoted string literal as written in SQL (`'it''s'`, `E'a\'b'`,
/// `$$x$$`). Escape sequences other than quote escapes are left as is.
pub fn string_value(raw: &str) -> String {
    if raw.starts_with('$') {
        let Some(tag_end) = raw[1..].find('$') else {
            return String::new();
        };
        let tag_len = tag_end + 2;
        let body_end = raw.len().saturating_sub(tag_len).max(tag_len);
        return raw[tag_len..body_end].to_string();
    }

    let (body, backslash) = match raw.strip_prefix(['e', 'E']) {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    let body = body.strip_prefix('\'').unwrap_or(body);
    let body = body.strip_suffix('\'').unwrap_or(body);

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            '\\' if backslash => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Split a SQL string on top-level semicolons.
///
/// Each returned slice starts at the statement's first token, so leading
/// comments are dropped. Empty statements are skipped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for spanned in Lexer::new(sql) {
        if spanned.token.is_punct(';') {
            if let Some((start, end)) = current.take() {
                statements.push(&sql[start..end]);
            }
            continue;
        }
        current = Some(match current {
            Some((start, _)) => (start, spanned.end),
            None => (spanned.start, spanned.end),
        });
    }

    if let Some((start, end)) = current {
        statements.push(&sql[start..end]);
    }
    statements
}
