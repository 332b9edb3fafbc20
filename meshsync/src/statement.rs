//! SQL statement classification for DDL interception.
//!
//! Schema-changing statements must hold the global DDL lock before they
//! execute. The classifier is deliberately simple: look at the first keyword
//! of the statement, case-insensitively.

/// Kind of a SQL statement, as far as lock interception cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
    Create,
    Alter,
    Drop,
    Other,
}

impl StatementKind {
    /// Whether statements of this kind require the global DDL lock.
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            StatementKind::Create | StatementKind::Alter | StatementKind::Drop
        )
    }
}

/// Classify a statement by its first keyword.
pub fn classify_statement(sql: &str) -> StatementKind {
    let first_word = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();

    match first_word.as_str() {
        "insert" => StatementKind::Insert,
        "update" => StatementKind::Update,
        "delete" => StatementKind::Delete,
        "select" => StatementKind::Select,
        "create" => StatementKind::Create,
        "alter" => StatementKind::Alter,
        "drop" => StatementKind::Drop,
        _ => StatementKind::Other,
    }
}
