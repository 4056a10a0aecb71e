use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::time::parse_instant;

const USER_COLUMNS: [&str; 2] = ["name", "email"];
const MEETING_COLUMNS: [&str; 5] = ["user_id", "title", "description", "start_time", "end_time"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        name: String,
        email: String,
        returning: bool,
    },
    SelectUsers {
        id: Option<Ulid>,
    },
    InsertMeeting {
        user_id: Ulid,
        title: String,
        description: Option<String>,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    SelectMeetings {
        id: Option<Ulid>,
        filter: MeetingFilter,
    },
    UpdateMeeting {
        id: Ulid,
        patch: MeetingPatch,
        returning: bool,
    },
    DeleteMeeting {
        id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(&table.relation, assignments, selection, returning.is_some()),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();
    let row = extract_insert_row(insert)?;

    match table.as_str() {
        "users" => {
            let cols = bind_columns(&insert.columns, &row, &USER_COLUMNS)?;
            Ok(Command::InsertUser {
                name: parse_string(required(&cols, "name")?)?,
                email: parse_string(required(&cols, "email")?)?,
                returning,
            })
        }
        "meetings" => {
            let cols = bind_columns(&insert.columns, &row, &MEETING_COLUMNS)?;
            let description = match column(&cols, "description") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertMeeting {
                user_id: parse_ulid_expr(required(&cols, "user_id")?)?,
                title: parse_string(required(&cols, "title")?)?,
                description,
                start: parse_instant_expr(required(&cols, "start_time")?)?,
                end: parse_instant_expr(required(&cols, "end_time")?)?,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "meetings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = MeetingPatch::default();
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()))
            }
        };
        let value = &assignment.value;
        match col.as_str() {
            "title" => patch.title = Some(parse_string(value)?),
            "description" => patch.description = Some(parse_string_or_null(value)?),
            "start_time" => patch.start = Some(parse_instant_expr(value)?),
            "end_time" => patch.end = Some(parse_instant_expr(value)?),
            "id" | "user_id" | "created_at" | "updated_at" => {
                return Err(SqlError::ReadOnlyColumn(col))
            }
            _ => return Err(SqlError::UnknownColumn(col)),
        }
    }
    Ok(Command::UpdateMeeting { id, patch, returning })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "meetings" => Ok(Command::DeleteMeeting { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "users" => Ok(Command::SelectUsers { id: filters.id }),
        "meetings" => Ok(Command::SelectMeetings {
            id: filters.id,
            filter: MeetingFilter {
                user_id: filters.user_id,
                start_date: filters.start,
                end_date: filters.end,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    user_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left);
            match (op, col.as_deref()) {
                (ast::BinaryOperator::And, _) => {
                    extract_filters(left, filters)?;
                    extract_filters(right, filters)
                }
                (ast::BinaryOperator::Eq, Some("id")) => {
                    filters.id = Some(parse_ulid_expr(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("user_id")) => {
                    filters.user_id = Some(parse_ulid_expr(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::GtEq, Some("start_time")) => {
                    filters.start = Some(parse_instant_expr(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::LtEq, Some("end_time")) => {
                    filters.end = Some(parse_instant_expr(right)?);
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
            }
        }
        _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row of an INSERT.
fn extract_insert_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Pair each value with its column: by the explicit column list when given,
/// otherwise positionally against `known`.
fn bind_columns(
    columns: &[ast::Ident],
    row: &[Expr],
    known: &[&'static str],
) -> Result<Vec<(&'static str, Expr)>, SqlError> {
    if columns.is_empty() {
        if row.len() > known.len() {
            return Err(SqlError::WrongArity(known.len(), row.len()));
        }
        return Ok(known.iter().copied().zip(row.iter().cloned()).collect());
    }
    if columns.len() != row.len() {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    columns
        .iter()
        .zip(row)
        .map(|(ident, expr)| {
            let name = ident.value.to_lowercase();
            known
                .iter()
                .find(|k| **k == name)
                .map(|k| (*k, expr.clone()))
                .ok_or(SqlError::UnknownColumn(name))
        })
        .collect()
}

fn column<'a>(cols: &'a [(&'static str, Expr)], name: &str) -> Option<&'a Expr> {
    cols.iter().find(|(c, _)| *c == name).map(|(_, e)| e)
}

fn required<'a>(cols: &'a [(&'static str, Expr)], name: &'static str) -> Result<&'a Expr, SqlError> {
    column(cols, name).ok_or(SqlError::MissingColumn(name))
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// The literal behind an expression, looking through casts like `'...'::timestamptz`.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

/// An ISO 8601 string, or a bare number of Unix milliseconds.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            parse_instant(s).map_err(|e| SqlError::InvalidDate(e.to_string()))
        }
        Some(Value::Number(n, _)) => n
            .parse()
            .map_err(|_| SqlError::InvalidDate(format!("bad millisecond timestamp: {n}"))),
        Some(value) => Err(SqlError::InvalidDate(format!("expected timestamp, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    ReadOnlyColumn(String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
    InvalidDate(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column cannot be updated: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing value for column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidDate(s) => write!(f, "invalid date: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
