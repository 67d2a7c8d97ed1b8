//! A small ALTER TABLE clause interpreter
//!
//! Understands the clauses migrations in tests need:
//! `ADD [COLUMN] name [type] [NOT NULL] [DEFAULT v]`, `DROP [COLUMN] name`,
//! `ADD UNIQUE [KEY|INDEX] name (cols)`, `ADD PRIMARY KEY (cols)`,
//! `DROP PRIMARY KEY`, `DROP KEY|INDEX name` and `ENGINE=name`, separated by
//! commas.

use crate::table::Table;
use osc_core::{ColumnList, UniqueKey, Value};

/// Reasons an alter clause is rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlterError {
    /// Clause is not understood
    #[error("unsupported alter clause: {0}")]
    Unsupported(String),
    /// Column already present
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    /// Column not present
    #[error("unknown column {0}")]
    UnknownColumn(String),
    /// Key not present
    #[error("unknown key {0}")]
    UnknownKey(String),
    /// Dropping would leave no columns
    #[error("cannot drop the last column")]
    LastColumn,
}

/// Apply every clause of `alter` to a copy of `table`
///
/// # Errors
/// The first clause that cannot be applied; `table` is left untouched.
pub fn apply_alter(table: &Table, alter: &str) -> Result<Table, AlterError> {
    let mut altered = table.clone();
    for clause in split_clauses(alter) {
        apply_clause(&mut altered, &clause)?;
    }
    Ok(altered)
}

fn split_clauses(alter: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in alter.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                clauses.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    clauses.push(current);
    clauses
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn keyword(token: Option<&&str>, expected: &str) -> bool {
    token.is_some_and(|t| t.eq_ignore_ascii_case(expected))
}

fn unquote(name: &str) -> String {
    name.trim_matches('`').to_string()
}

fn column_list(clause: &str) -> Result<ColumnList, AlterError> {
    let open = clause
        .find('(')
        .ok_or_else(|| AlterError::Unsupported(clause.to_string()))?;
    let close = clause
        .rfind(')')
        .ok_or_else(|| AlterError::Unsupported(clause.to_string()))?;
    let names: Vec<String> = clause[open + 1..close]
        .split(',')
        .map(|c| unquote(c.trim()))
        .filter(|c| !c.is_empty())
        .collect();
    if names.is_empty() {
        return Err(AlterError::Unsupported(clause.to_string()));
    }
    Ok(ColumnList::new(names))
}

fn literal(token: &str) -> Value {
    if token.eq_ignore_ascii_case("NULL") {
        return Value::Null;
    }
    token.parse::<i64>().map_or_else(
        |_| Value::Text(token.trim_matches(|c| c == '\'' || c == '"').to_string()),
        Value::Int,
    )
}

fn check_columns(table: &Table, columns: &ColumnList) -> Result<(), AlterError> {
    match columns.names().iter().find(|c| !table.columns().contains(c)) {
        Some(missing) => Err(AlterError::UnknownColumn(missing.clone())),
        None => Ok(()),
    }
}

fn apply_clause(table: &mut Table, clause: &str) -> Result<(), AlterError> {
    let tokens: Vec<&str> = clause.split_whitespace().collect();
    let unsupported = || AlterError::Unsupported(clause.to_string());

    let verb = tokens.first().ok_or_else(unsupported)?;
    if verb.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("ENGINE=")) {
        table.set_engine(&verb[7..]);
        return Ok(());
    }

    if verb.eq_ignore_ascii_case("ADD") {
        if keyword(tokens.get(1), "PRIMARY") {
            let columns = column_list(clause)?;
            check_columns(table, &columns)?;
            table.drop_unique_key("PRIMARY");
            table.add_unique_key(UniqueKey::primary(columns));
            return Ok(());
        }
        if keyword(tokens.get(1), "UNIQUE") {
            let mut at = 2;
            if keyword(tokens.get(at), "KEY") || keyword(tokens.get(at), "INDEX") {
                at += 1;
            }
            let name = tokens
                .get(at)
                .map(|t| unquote(t.split('(').next().unwrap_or(t)))
                .filter(|n| !n.is_empty())
                .ok_or_else(unsupported)?;
            let columns = column_list(clause)?;
            check_columns(table, &columns)?;
            table.add_unique_key(UniqueKey::new(name, columns));
            return Ok(());
        }
        let at = if keyword(tokens.get(1), "COLUMN") { 2 } else { 1 };
        let name = tokens.get(at).map(|t| unquote(t)).ok_or_else(unsupported)?;
        if table.columns().contains(&name) {
            return Err(AlterError::DuplicateColumn(name));
        }
        let rest = &tokens[at + 1..];
        let not_null = rest
            .windows(2)
            .any(|w| w[0].eq_ignore_ascii_case("NOT") && w[1].eq_ignore_ascii_case("NULL"));
        let default = rest
            .iter()
            .position(|t| t.eq_ignore_ascii_case("DEFAULT"))
            .and_then(|i| rest.get(i + 1))
            .map(|t| literal(t));
        table.add_column(&name, !not_null, default);
        return Ok(());
    }

    if verb.eq_ignore_ascii_case("DROP") {
        if keyword(tokens.get(1), "PRIMARY") {
            return if table.drop_unique_key("PRIMARY") {
                Ok(())
            } else {
                Err(AlterError::UnknownKey("PRIMARY".to_string()))
            };
        }
        if keyword(tokens.get(1), "KEY") || keyword(tokens.get(1), "INDEX") {
            let name = tokens.get(2).map(|t| unquote(t)).ok_or_else(unsupported)?;
            return if table.drop_unique_key(&name) {
                Ok(())
            } else {
                Err(AlterError::UnknownKey(name))
            };
        }
        let at = if keyword(tokens.get(1), "COLUMN") { 2 } else { 1 };
        let name = tokens.get(at).map(|t| unquote(t)).ok_or_else(unsupported)?;
        let position = table
            .columns()
            .position(&name)
            .ok_or_else(|| AlterError::UnknownColumn(name.clone()))?;
        if table.columns().len() == 1 {
            return Err(AlterError::LastColumn);
        }
        table.drop_column(position);
        return Ok(());
    }

    Err(unsupported())
}
