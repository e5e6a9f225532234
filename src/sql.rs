use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// One row of `INSERT INTO windows`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRow {
    pub id: Ulid,
    pub owner_id: String,
    pub start: Ms,
    pub end: Ms,
}

/// Owner and local month for the calendar tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthQuery {
    pub owner_id: String,
    pub year: i32,
    pub month: u32,
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Participant {
    Student(String),
    Tutor(String),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertWindows {
        windows: Vec<WindowRow>,
    },
    DeleteWindow {
        id: Ulid,
    },
    Claim {
        window_id: Ulid,
        student_id: String,
        returning: bool,
    },
    SelectWindows {
        owner_id: String,
        held: Option<bool>,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectOpenWindows {
        query: MonthQuery,
    },
    SelectOpenDays {
        query: MonthQuery,
    },
    SelectBookings {
        participant: Participant,
    },
}

fn statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| SqlError::Parse(e.to_string()))
}

/// Parse the first statement of `sql` into a [`Command`].
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let parsed = statements(sql)?;
    let Some(statement) = parsed.first() else {
        return Err(SqlError::Empty);
    };
    match statement {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Kind of rows a statement returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Windows,
    Bookings,
    OpenDays,
}

/// Row shape decided from statement structure alone, so it also works on
/// prepared statements whose `$n` parameters are not bound yet. `None` for
/// statements that return no rows.
pub fn row_shape(sql: &str) -> Option<RowShape> {
    match statements(sql).ok()?.first()? {
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            match relation_name(&select.from).ok()?.as_str() {
                "windows" | "open_windows" => Some(RowShape::Windows),
                "bookings" => Some(RowShape::Bookings),
                "open_days" => Some(RowShape::OpenDays),
                _ => None,
            }
        }
        Statement::Insert(insert) => {
            let table = insert_target(insert).ok()?;
            (insert.returning.is_some() && table == "bookings").then_some(RowShape::Bookings)
        }
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_target(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    let rows = values_rows(insert)?;

    match table.as_str() {
        "windows" => {
            let mut windows = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                windows.push(WindowRow {
                    id: ulid(column(row, &columns, "id", 0)?).map_err(at_row)?,
                    owner_id: text(column(row, &columns, "owner_id", 1)?).map_err(at_row)?,
                    start: int(column(row, &columns, "start", 2)?).map_err(at_row)?,
                    end: int(column(row, &columns, "end", 3)?).map_err(at_row)?,
                });
            }
            Ok(Command::InsertWindows { windows })
        }
        "bookings" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported(
                    "one booking per INSERT; each claim is its own transaction".into(),
                ));
            }
            let row = &rows[0];
            Ok(Command::Claim {
                window_id: ulid(column(row, &columns, "window_id", 0)?)?,
                student_id: text(column(row, &columns, "student_id", 1)?)?,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) = &delete.from;
    let table = relation_name(from)?;
    if table == "bookings" {
        return Err(SqlError::Unsupported("bookings are immutable".into()));
    }
    if table != "windows" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut filters = Filters::default();
    if let Some(selection) = &delete.selection {
        filters.collect(selection)?;
    }
    Ok(Command::DeleteWindow {
        id: ulid(filters.required_eq("id")?)?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let table = relation_name(&select.from)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "windows" => Ok(Command::SelectWindows {
            owner_id: text(filters.required_eq("owner_id")?)?,
            held: filters.eq.get("held").map(boolean).transpose()?,
            start: filters.gt_eq.get("start").map(int).transpose()?,
            end: filters.lt_eq.get("end").map(int).transpose()?,
        }),
        "open_windows" => Ok(Command::SelectOpenWindows {
            query: month_query(&filters)?,
        }),
        "open_days" => Ok(Command::SelectOpenDays {
            query: month_query(&filters)?,
        }),
        "bookings" => {
            let student = filters.eq.get("student_id").map(text).transpose()?;
            let tutor = filters.eq.get("tutor_id").map(text).transpose()?;
            let participant = match (student, tutor) {
                (Some(s), None) => Participant::Student(s),
                (None, Some(t)) => Participant::Tutor(t),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported(
                        "filter bookings by student_id or tutor_id, not both".into(),
                    ));
                }
                (None, None) => return Err(SqlError::MissingFilter("student_id or tutor_id")),
            };
            Ok(Command::SelectBookings { participant })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn month_query(filters: &Filters) -> Result<MonthQuery, SqlError> {
    let year = int(filters.required_eq("year")?)?;
    let month = int(filters.required_eq("month")?)?;
    let offset = filters.eq.get("utc_offset").map(int).transpose()?.unwrap_or(0);
    Ok(MonthQuery {
        owner_id: text(filters.required_eq("owner_id")?)?,
        year: i32::try_from(year).map_err(|_| SqlError::Parse(format!("year {year} out of range")))?,
        month: u32::try_from(month)
            .map_err(|_| SqlError::Parse(format!("month {month} out of range")))?,
        utc_offset_minutes: i32::try_from(offset)
            .map_err(|_| SqlError::Parse(format!("utc_offset {offset} out of range")))?,
    })
}

/// Column comparisons from a WHERE clause of `AND`-ed predicates.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    gt_eq: HashMap<String, Expr>,
    lt_eq: HashMap<String, Expr>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let target = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.gt_eq,
                    ast::BinaryOperator::LtEq => &mut self.lt_eq,
                    other => {
                        return Err(SqlError::Unsupported(format!("operator {other} in WHERE")));
                    }
                };
                let col = column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                if target.contains_key(&col) {
                    return Err(SqlError::Unsupported(format!(
                        "more than one {op} condition on {col}"
                    )));
                }
                target.insert(col, (**right).clone());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
        }
    }

    fn required_eq(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.eq.get(col).ok_or(SqlError::MissingFilter(col))
    }
}

// ── AST access ────────────────────────────────────────────────

/// Value for `name`: by the INSERT column list when one is given, else by
/// position.
fn column<'a>(
    row: &'a [Expr],
    columns: &[String],
    name: &'static str,
    position: usize,
) -> Result<&'a Expr, SqlError> {
    let idx = if columns.is_empty() {
        Some(position)
    } else {
        columns.iter().position(|c| c == name)
    };
    idx.and_then(|i| row.get(i))
        .ok_or(SqlError::MissingColumn(name))
}

fn ident_name(name: &ast::ObjectName) -> Result<String, SqlError> {
    match name.0.last() {
        Some(ObjectNamePart::Identifier(ident)) => Ok(ident.value.to_lowercase()),
        _ => Err(SqlError::Parse(format!("unusable table name {name}"))),
    }
}

/// The single plain table a statement reads from or deletes from.
fn relation_name(from: &[ast::TableWithJoins]) -> Result<String, SqlError> {
    match from {
        [] => Err(SqlError::Parse("statement names no table".into())),
        [only] if only.joins.is_empty() => match &only.relation {
            TableFactor::Table { name, .. } => ident_name(name),
            other => Err(SqlError::Unsupported(format!("table expression {other}"))),
        },
        _ => Err(SqlError::Unsupported("joins and multi-table FROM".into())),
    }
}

fn insert_target(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => ident_name(name),
        _ => Err(SqlError::Unsupported("INSERT into a table function".into())),
    }
}

fn values_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let Some(source) = insert.source.as_deref() else {
        return Err(SqlError::Parse("INSERT without VALUES".into()));
    };
    match source.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("VALUES has no rows".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Unsupported("INSERT ... SELECT".into())),
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    let ident = match expr {
        Expr::Identifier(ident) => ident,
        Expr::CompoundIdentifier(parts) => parts.last()?,
        _ => return None,
    };
    Some(ident.value.to_lowercase())
}

/// A constant operand after sign folding.
enum Literal<'a> {
    Text(&'a str),
    Int(i64),
    Bool(bool),
}

fn literal(expr: &Expr) -> Result<Literal<'_>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::SingleQuotedString(s) => Ok(Literal::Text(s)),
            Value::Number(n, _) => n
                .parse()
                .map(Literal::Int)
                .map_err(|e| SqlError::Parse(format!("bad integer {n:?}: {e}"))),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr: inner } => match literal(inner)? {
            Literal::Int(n) => Ok(Literal::Int(-n)),
            _ => Err(SqlError::Parse(format!("cannot negate {inner}"))),
        },
        Expr::Nested(inner) => literal(inner),
        other => Err(SqlError::Parse(format!("expected a constant, got {other}"))),
    }
}

fn text(expr: &Expr) -> Result<String, SqlError> {
    match literal(expr)? {
        Literal::Text(s) => Ok(s.to_string()),
        _ => Err(SqlError::Parse(format!("expected a quoted string, got {expr}"))),
    }
}

/// Integers may arrive quoted once `$n` parameters are bound as text.
fn int(expr: &Expr) -> Result<i64, SqlError> {
    match literal(expr)? {
        Literal::Int(n) => Ok(n),
        Literal::Text(s) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Literal::Bool(_) => Err(SqlError::Parse(format!("expected an integer, got {expr}"))),
    }
}

fn ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("{s:?} is not a ULID: {e}")))
}

fn boolean(expr: &Expr) -> Result<bool, SqlError> {
    match literal(expr)? {
        Literal::Bool(b) => Ok(b),
        Literal::Int(n) => Ok(n != 0),
        Literal::Text(s) => match s.to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => Ok(true),
            "f" | "false" | "n" | "no" | "off" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("{s:?} is not a boolean"))),
        },
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
