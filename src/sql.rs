use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `INSERT INTO doctors (name, specialization, contact_email, slot_minutes) VALUES (...)`
    InsertDoctor {
        name: String,
        specialization: String,
        contact_email: String,
        slot_minutes: u32,
    },
    SelectDoctors {
        specialization: Option<String>,
    },
    SelectDoctor {
        id: Ulid,
    },
    /// `INSERT INTO appointments (doctor_id, patient_name, start_time) VALUES (...)`
    InsertAppointment {
        doctor_id: Ulid,
        patient_name: String,
        start: Ms,
    },
    /// Cancels; the row stays, with status CANCELLED.
    DeleteAppointment {
        id: Ulid,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectAvailability {
        doctor_id: Ulid,
        day: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The kind of row a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Doctor,
    Appointment,
    Availability,
}

impl Command {
    pub fn row_shape(&self) -> RowShape {
        match self {
            Command::InsertDoctor { .. } | Command::SelectDoctors { .. } | Command::SelectDoctor { .. } => {
                RowShape::Doctor
            }
            Command::InsertAppointment { .. }
            | Command::DeleteAppointment { .. }
            | Command::SelectAppointment { .. } => RowShape::Appointment,
            Command::SelectAvailability { .. } => RowShape::Availability,
        }
    }
}

/// Row shape from the statement's kind and table alone, so `$n` placeholders
/// may still be unbound. `None` for anything the server would reject.
pub fn row_shape(sql: &str) -> Option<RowShape> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let table = match stmts.first()? {
        Statement::Insert(insert) => insert_table_name(insert).ok()?,
        Statement::Delete(delete) => delete_table_name(delete).ok()?,
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        _ => return None,
    };
    match table.as_str() {
        "doctors" => Some(RowShape::Doctor),
        "appointments" => Some(RowShape::Appointment),
        "availability" => Some(RowShape::Availability),
        _ => None,
    }
}

/// Request checks made before a command reaches the engine.
pub fn validate(cmd: &Command, now: Ms) -> Result<(), SqlError> {
    if let Command::InsertAppointment {
        patient_name,
        start,
        ..
    } = cmd
    {
        if patient_name.trim().is_empty() {
            return Err(SqlError::Invalid("patient_name must not be blank".into()));
        }
        if patient_name.len() > MAX_NAME_LEN {
            return Err(SqlError::Invalid(format!(
                "patient_name longer than {MAX_NAME_LEN} bytes"
            )));
        }
        if *start <= now {
            return Err(SqlError::Invalid("start_time must be in the future".into()));
        }
    }
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "doctors" => {
            if values.len() != 4 {
                return Err(SqlError::WrongArity("doctors", 4, values.len()));
            }
            Ok(Command::InsertDoctor {
                name: parse_string(&values[0])?,
                specialization: parse_string(&values[1])?,
                contact_email: parse_string(&values[2])?,
                slot_minutes: parse_u32(&values[3])?,
            })
        }
        "appointments" => {
            if values.len() != 3 {
                return Err(SqlError::WrongArity("appointments", 3, values.len()));
            }
            Ok(Command::InsertAppointment {
                doctor_id: parse_ulid(&values[0])?,
                patient_name: parse_string(&values[1])?,
                start: parse_timestamp(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "appointments" => Ok(Command::DeleteAppointment {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| {
        filters
            .iter()
            .find(|(name, _)| name == col)
            .map(|(_, expr)| *expr)
    };

    match table.as_str() {
        "doctors" => {
            if let Some(id) = filter("id") {
                return Ok(Command::SelectDoctor { id: parse_ulid(id)? });
            }
            Ok(Command::SelectDoctors {
                specialization: filter("specialization").map(parse_string).transpose()?,
            })
        }
        "appointments" => Ok(Command::SelectAppointment {
            id: parse_ulid(filter("id").ok_or(SqlError::MissingFilter("id"))?)?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            doctor_id: parse_ulid(filter("doctor_id").ok_or(SqlError::MissingFilter("doctor_id"))?)?,
            day: parse_day(filter("day").ok_or(SqlError::MissingFilter("day"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left) {
            Some(col) => {
                out.push((col, right.as_ref()));
                Ok(())
            }
            None => Err(SqlError::Unsupported(format!("filter on {left}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// ISO local date-time string, or integer Unix milliseconds.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => time::parse_datetime(s)
            .or_else(|| s.trim().parse().ok())
            .ok_or_else(|| SqlError::Parse(format!("bad start_time {s:?}"))),
        _ => parse_i64(expr),
    }
}

fn parse_day(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    time::parse_date(&s).ok_or_else(|| SqlError::Invalid(format!("bad day {s:?}, expected YYYY-MM-DD")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid request: {0}")]
    Invalid(String),
}
