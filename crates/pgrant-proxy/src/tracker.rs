//! Prepared statements and portals of one client session.
//!
//! Owned by the request direction alone, so no locking. The tables only
//! mirror what the client asked for; the upstream server stays the authority
//! on whether a name exists.

use std::collections::HashMap;

use pgrant_policy::{split_statements, Lexer, Token};

#[derive(Debug, Default)]
pub struct StatementTracker {
    /// Statement name (empty for unnamed) to SQL text.
    statements: HashMap<String, String>,
    /// Portal name (empty for unnamed) to source statement name.
    portals: HashMap<String, String>,
}

impl StatementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `Parse`. Replaces an earlier statement of the same name.
    pub fn parse(&mut self, name: &str, sql: &str) {
        self.statements.insert(name.to_string(), sql.to_string());
    }

    /// Record a `Bind`. Returns whether the source statement is known.
    pub fn bind(&mut self, portal: &str, statement: &str) -> bool {
        self.portals.insert(portal.to_string(), statement.to_string());
        self.statements.contains_key(statement)
    }

    pub fn statement(&self, name: &str) -> Option<&str> {
        self.statements.get(name).map(String::as_str)
    }

    /// SQL behind a portal, through the statement it was bound from.
    pub fn portal_sql(&self, portal: &str) -> Option<&str> {
        self.portals
            .get(portal)
            .and_then(|statement| self.statement(statement))
    }

    pub fn close_statement(&mut self, name: &str) {
        self.statements.remove(name);
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }

    /// Apply `DEALLOCATE` / `DISCARD ALL` statements found in a simple query.
    pub fn apply_simple_query(&mut self, sql: &str) {
        for statement in split_statements(sql) {
            match deallocation(statement) {
                Some(Deallocation::Statement(name)) => self.close_statement(&name),
                Some(Deallocation::All) => self.statements.clear(),
                Some(Deallocation::Everything) => {
                    self.statements.clear();
                    self.portals.clear();
                }
                None => {}
            }
        }
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn portal_count(&self) -> usize {
        self.portals.len()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Deallocation {
    /// `DEALLOCATE [PREPARE] name`
    Statement(String),
    /// `DEALLOCATE [PREPARE] ALL`
    All,
    /// `DISCARD ALL`
    Everything,
}

fn deallocation(statement: &str) -> Option<Deallocation> {
    let tokens: Vec<Token<'_>> = Lexer::new(statement).map(|s| s.token).collect();
    match tokens.as_slice() {
        [first, second, ..] if first.is_keyword("discard") && second.is_keyword("all") => {
            Some(Deallocation::Everything)
        }
        [first, rest @ ..] if first.is_keyword("deallocate") => {
            let rest = match rest {
                [prepare, tail @ ..] if prepare.is_keyword("prepare") && !tail.is_empty() => tail,
                _ => rest,
            };
            let target = rest.first()?;
            if target.is_keyword("all") {
                Some(Deallocation::All)
            } else {
                target.ident().map(Deallocation::Statement)
            }
        }
        _ => None,
    }
}
