//! Helpers shared by the SQL drivers: statement splitting with source
//! positions, the no-transaction marker, and error excerpts.

use sqlparser::dialect::Dialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use tracing::warn;

use super::DriverCapabilities;
use crate::file::{line_column_from_offset, lines_around};

/// First-line marker that makes a file run outside of a transaction
pub const NO_TRANSACTION_MARKER: &str = "-- elif:no-transaction";

/// Lines of context shown above and below a failing line
const CONTEXT_LINES: usize = 5;

/// One statement of a migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based position of the statement within the file
    pub index: usize,
    /// Byte offset of the statement's first character
    pub offset: usize,
    /// 1-based line of the statement's first character
    pub line: usize,
    /// 1-based column of the statement's first character
    pub column: usize,
    /// Statement text, including the terminating semicolon if present
    pub sql: String,
}

/// Whether the file asks to run outside of a transaction
pub fn wants_transaction(content: &str) -> bool {
    content
        .lines()
        .next()
        .map(|first| !first.trim().eq_ignore_ascii_case(NO_TRANSACTION_MARKER))
        .unwrap_or(true)
}

/// Whether a driver with `capabilities` should wrap `content` in a
/// transaction. The marker only matters on transactional drivers.
pub fn runs_in_transaction(capabilities: DriverCapabilities, content: &str) -> bool {
    capabilities.transactional && wants_transaction(content)
}

/// Split a possibly schema-qualified table name into schema and table
pub fn split_qualified(table: &str) -> (Option<&str>, &str) {
    match table.rsplit_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

/// Split `sql` into statements, keeping each statement's exact source text.
///
/// Semicolons inside `BEGIN ... END` and `CASE ... END` blocks do not end a
/// statement, so trigger bodies and `BEGIN ATOMIC` functions stay whole. A
/// `BEGIN` that opens a statement is a transaction command, not a block.
/// Comment-only and empty statements are dropped. If the tokenizer rejects
/// the input, the whole text is returned as a single statement.
pub fn split_statements(dialect: &dyn Dialect, sql: &str) -> Vec<Statement> {
    let tokens = match Tokenizer::new(dialect, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("SQL tokenizing failed, running file as a single statement: {}", e);
            return whole_file(sql);
        }
    };

    let line_starts = line_starts(sql);
    let mut statements = Vec::new();
    let mut start: Option<usize> = None;
    let mut depth = 0usize;

    for token in &tokens {
        let offset = byte_offset(sql, &line_starts, token.location.line, token.location.column);
        match &token.token {
            Token::Whitespace(_) => {}
            Token::SemiColon if depth == 0 => {
                if let Some(begin) = start.take() {
                    push_statement(&mut statements, sql, begin, offset + 1);
                }
            }
            Token::EOF => break,
            token => {
                match block_keyword(token) {
                    Some(Keyword::BEGIN) if start.is_some() => depth += 1,
                    Some(Keyword::CASE) => depth += 1,
                    Some(Keyword::END) => depth = depth.saturating_sub(1),
                    _ => {}
                }
                if start.is_none() {
                    start = Some(offset);
                }
            }
        }
    }

    if let Some(begin) = start {
        push_statement(&mut statements, sql, begin, sql.len());
    }

    statements
}

/// Unquoted keywords that open or close a compound block
fn block_keyword(token: &Token) -> Option<Keyword> {
    match token {
        Token::Word(Word {
            keyword: keyword @ (Keyword::BEGIN | Keyword::CASE | Keyword::END),
            quote_style: None,
            ..
        }) => Some(*keyword),
        _ => None,
    }
}

fn whole_file(sql: &str) -> Vec<Statement> {
    if sql.trim().is_empty() {
        return Vec::new();
    }
    vec![Statement {
        index: 1,
        offset: 0,
        line: 1,
        column: 1,
        sql: sql.to_string(),
    }]
}

fn push_statement(statements: &mut Vec<Statement>, sql: &str, begin: usize, end: usize) {
    let end = end.min(sql.len());
    let (line, column) = line_column_from_offset(sql.as_bytes(), begin);
    statements.push(Statement {
        index: statements.len() + 1,
        offset: begin,
        line,
        column,
        sql: sql[begin..end].trim_end().to_string(),
    });
}

/// Byte offsets at which each line starts
fn line_starts(sql: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Convert a tokenizer location (1-based line, 1-based char column) into a
/// byte offset
fn byte_offset(sql: &str, line_starts: &[usize], line: u64, column: u64) -> usize {
    let line_index = usize::try_from(line.saturating_sub(1)).unwrap_or(usize::MAX);
    let Some(&line_start) = line_starts.get(line_index) else {
        return sql.len();
    };
    let chars_in = usize::try_from(column.saturating_sub(1)).unwrap_or(usize::MAX);
    sql[line_start..]
        .char_indices()
        .nth(chars_in)
        .map(|(i, _)| line_start + i)
        .unwrap_or(sql.len())
}

/// Describe a failure of `statement`. `position` is the backend's 1-based
/// character position inside the statement, when it reports one.
pub fn describe_failure(
    content: &str,
    statement: &Statement,
    position: Option<usize>,
    message: &str,
) -> String {
    let offset = position
        .and_then(|pos| {
            statement
                .sql
                .char_indices()
                .nth(pos.saturating_sub(1))
                .map(|(i, _)| statement.offset + i)
        })
        .unwrap_or(statement.offset);
    let (line, column) = line_column_from_offset(content.as_bytes(), offset);
    let excerpt = lines_around(content.as_bytes(), line, CONTEXT_LINES, CONTEXT_LINES, true);

    format!(
        "{} in statement {} at line {}, column {}:\n\n{}",
        message, statement.index, line, column, excerpt
    )
}
