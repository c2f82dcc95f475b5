//! Keyword-based statement classification.

use serde::Serialize;

use crate::lexer::{split_statements, Lexer, Spanned, Token};

/// Data direction of a `COPY` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyDirection {
    /// `COPY ... FROM`: loads data into a table.
    From,
    /// `COPY ... TO` or `COPY (query) TO`: exports data.
    To,
}

/// What a SQL text does, as far as its leading keywords tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// Modifies data or schema.
    pub is_write: bool,
    /// Schema change (`CREATE`, `ALTER`, `DROP`, `TRUNCATE`, ...).
    pub is_ddl: bool,
    /// `COPY` in either direction.
    pub is_copy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_direction: Option<CopyDirection>,
    /// Attempts to switch the session or transaction to read-write.
    pub is_read_only_bypass: bool,
}

impl Classification {
    fn merge(self, other: Classification) -> Classification {
        Classification {
            is_write: self.is_write || other.is_write,
            is_ddl: self.is_ddl || other.is_ddl,
            is_copy: self.is_copy || other.is_copy,
            copy_direction: self.copy_direction.or(other.copy_direction),
            is_read_only_bypass: self.is_read_only_bypass || other.is_read_only_bypass,
        }
    }
}

/// Classify a SQL text that may hold several `;`-separated statements.
/// The result is the union over all statements.
pub fn classify(sql: &str) -> Classification {
    split_statements(sql)
        .into_iter()
        .map(classify_statement)
        .fold(Classification::default(), Classification::merge)
}

const WRITE_KEYWORDS: &[&str] = &["insert", "update", "delete", "merge"];

const DDL_KEYWORDS: &[&str] = &[
    "create", "alter", "drop", "truncate", "grant", "revoke", "comment",
];

const READ_ONLY_SETTINGS: &[&str] = &["default_transaction_read_only", "transaction_read_only"];

/// Classify a single statement.
pub fn classify_statement(sql: &str) -> Classification {
    let spanned: Vec<Spanned<'_>> = Lexer::new(sql).collect();
    let tokens: Vec<Token<'_>> = spanned.iter().map(|s| s.token).collect();
    let skip = tokens.iter().take_while(|t| t.is_punct('(')).count();
    let body = &tokens[skip..];

    let mut class = Classification::default();
    let Some(Token::Word(first)) = body.first() else {
        return class;
    };
    let first = first.to_ascii_lowercase();

    // `PREPARE name [(types)] AS statement` is judged by its statement, so a
    // later `EXECUTE name` needs no check of its own.
    if first == "prepare" {
        if let Some(as_index) = top_level_keyword(body, "as") {
            let inner = &sql[spanned[skip + as_index].end..];
            class = classify_statement(inner);
        }
    }

    if WRITE_KEYWORDS.contains(&first.as_str()) {
        class.is_write = true;
    } else if DDL_KEYWORDS.contains(&first.as_str()) {
        class.is_write = true;
        class.is_ddl = true;
    } else if first == "copy" {
        class.is_copy = true;
        class.copy_direction = copy_direction(&body[1..]);
        if class.copy_direction == Some(CopyDirection::From) {
            class.is_write = true;
        }
    }

    class.is_read_only_bypass |= match first.as_str() {
        "set" => set_disables_read_only(&body[1..]),
        "begin" | "start" => requests_read_write(&body[1..]),
        _ => false,
    } || calls_set_config_read_write(&tokens);

    class
}

/// Index of the first `keyword` outside parentheses.
fn top_level_keyword(tokens: &[Token<'_>], keyword: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => depth = depth.saturating_sub(1),
            t if depth == 0 && t.is_keyword(keyword) => return Some(i),
            _ => {}
        }
    }
    None
}

/// Direction from the first top-level `FROM` or `TO` after `COPY`.
fn copy_direction(after_copy: &[Token<'_>]) -> Option<CopyDirection> {
    let from = top_level_keyword(after_copy, "from");
    let to = top_level_keyword(after_copy, "to");
    match (from, to) {
        (Some(f), Some(t)) if t < f => Some(CopyDirection::To),
        (Some(_), _) => Some(CopyDirection::From),
        (None, Some(_)) => Some(CopyDirection::To),
        (None, None) => None,
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "on" | "true" | "yes" | "1" | "t" | "y")
}

/// `SET [SESSION | LOCAL] <read-only setting> {TO | =} <value>` with a value
/// other than true, and `SET SESSION CHARACTERISTICS / SET TRANSACTION`
/// requesting `READ WRITE`.
fn set_disables_read_only(after_set: &[Token<'_>]) -> bool {
    let mut rest = after_set;
    if rest
        .first()
        .is_some_and(|t| t.is_keyword("session") || t.is_keyword("local"))
    {
        rest = &rest[1..];
    }

    let Some(name) = rest.first().and_then(Token::ident) else {
        return false;
    };
    if name == "characteristics" || name == "transaction" {
        return requests_read_write(rest);
    }
    if !READ_ONLY_SETTINGS.contains(&name.as_str()) {
        return false;
    }

    let value = rest
        .iter()
        .skip(1)
        .skip_while(|t| t.is_keyword("to") || t.is_punct('='))
        .find_map(Token::setting_value);
    match value {
        Some(v) => v == "default" || !is_truthy(&v),
        None => false,
    }
}

fn requests_read_write(tokens: &[Token<'_>]) -> bool {
    tokens
        .windows(2)
        .any(|w| w[0].is_keyword("read") && w[1].is_keyword("write"))
}

/// `set_config('default_transaction_read_only', <not true>, ...)` anywhere in
/// the statement.
fn calls_set_config_read_write(tokens: &[Token<'_>]) -> bool {
    tokens.windows(6).any(|w| {
        let [func, open, name, comma, value, _] = w else {
            return false;
        };
        if !func.is_keyword("set_config") || !open.is_punct('(') || !comma.is_punct(',') {
            return false;
        }
        let Some(name) = name.setting_value() else {
            return false;
        };
        if !READ_ONLY_SETTINGS.contains(&name.as_str()) {
            return false;
        }
        match value.setting_value() {
            Some(v) => !is_truthy(&v),
            // A parameter or expression could be anything.
            None => true,
        }
    })
}
