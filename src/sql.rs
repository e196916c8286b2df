use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTrip {
        id: Ulid,
        name: Option<String>,
        total_seats: u32,
    },
    DeleteTrip {
        id: Ulid,
    },
    SelectTrips {
        id: Option<Ulid>,
    },
    InsertHold {
        trip_id: Ulid,
        seats: u32,
        holder_token: String,
        ttl_seconds: Option<i64>,
    },
    UpdateHold {
        id: Ulid,
        holder_token: String,
        seats: Option<u32>,
        ttl_seconds: Option<i64>,
    },
    DeleteHold {
        id: Ulid,
        holder_token: String,
    },
    SelectHold {
        id: Ulid,
    },
    SelectHolds {
        trip_id: Ulid,
    },
    InsertBooking {
        hold_id: Ulid,
        holder_token: String,
        payload: Option<String>,
    },
    SelectBookings {
        trip_id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
        holder_token: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const TRIP_COLUMNS: &[&str] = &["id", "total_seats", "name"];
const HOLD_COLUMNS: &[&str] = &["trip_id", "seats", "holder_token", "ttl_seconds"];
const BOOKING_COLUMNS: &[&str] = &["hold_id", "holder_token", "payload"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = match table.as_str() {
        "trips" => TRIP_COLUMNS,
        "holds" => HOLD_COLUMNS,
        "bookings" => BOOKING_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, defaults)?;

    match table.as_str() {
        "trips" => Ok(Command::InsertTrip {
            id: parse_ulid_expr(required(&row, "id")?)?,
            name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
            total_seats: parse_u32(required(&row, "total_seats")?)?,
        }),
        "holds" => Ok(Command::InsertHold {
            trip_id: parse_ulid_expr(required(&row, "trip_id")?)?,
            seats: parse_u32(required(&row, "seats")?)?,
            holder_token: parse_string_expr(required(&row, "holder_token")?)?,
            ttl_seconds: row.get("ttl_seconds").map(parse_i64_or_null).transpose()?.flatten(),
        }),
        _ => Ok(Command::InsertBooking {
            hold_id: parse_ulid_expr(required(&row, "hold_id")?)?,
            holder_token: parse_string_expr(required(&row, "holder_token")?)?,
            payload: row.get("payload").map(parse_string_or_null).transpose()?.flatten(),
        }),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table_name = table_factor_name(&table.relation)?;
    if table_name != "holds" {
        return Err(SqlError::Unsupported(format!("UPDATE {table_name}")));
    }

    let (mut seats, mut ttl_seconds) = (None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("seats") => seats = Some(parse_u32(&assignment.value)?),
            Some("ttl_seconds") => ttl_seconds = Some(parse_i64_expr(&assignment.value)?),
            Some(other) => return Err(SqlError::Unsupported(format!("SET {other}"))),
            None => return Err(SqlError::Unsupported("SET target".into())),
        }
    }

    let filters = where_filters(selection);
    Ok(Command::UpdateHold {
        id: parse_ulid_expr(required(&filters, "id")?)?,
        holder_token: parse_string_expr(required(&filters, "holder_token")?)?,
        seats,
        ttl_seconds,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection);
    let id = parse_ulid_expr(required(&filters, "id")?)?;

    match table.as_str() {
        "trips" => Ok(Command::DeleteTrip { id }),
        "holds" => Ok(Command::DeleteHold {
            id,
            holder_token: parse_string_expr(required(&filters, "holder_token")?)?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id,
            holder_token: parse_string_expr(required(&filters, "holder_token")?)?,
        }),
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
    let filters = where_filters(&select.selection);

    match table.as_str() {
        "trips" => Ok(Command::SelectTrips {
            id: filters.get("id").map(parse_ulid_expr).transpose()?,
        }),
        "holds" => {
            if let Some(id) = filters.get("id") {
                Ok(Command::SelectHold { id: parse_ulid_expr(id)? })
            } else {
                let trip_id = filters.get("trip_id").ok_or(SqlError::MissingFilter("id or trip_id"))?;
                Ok(Command::SelectHolds { trip_id: parse_ulid_expr(trip_id)? })
            }
        }
        "bookings" => Ok(Command::SelectBookings {
            trip_id: parse_ulid_expr(required(&filters, "trip_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Column → value for the first VALUES row. Without an explicit column list,
/// values are taken positionally against `defaults`.
fn insert_row(insert: &ast::Insert, defaults: &[&str]) -> Result<HashMap<String, Expr>, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::WrongArity("VALUES", columns.len(), values.len()));
    }
    for column in &columns {
        if !defaults.contains(&column.as_str()) {
            return Err(SqlError::Unsupported(format!("column {column}")));
        }
    }
    Ok(columns.into_iter().zip(values).collect())
}

/// Every `column = value` term of a WHERE clause built from ANDs.
fn where_filters(selection: &Option<Expr>) -> HashMap<String, Expr> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut filters);
    }
    filters
}

fn collect_eq_filters(expr: &Expr, out: &mut HashMap<String, Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.insert(col, right.as_ref().clone());
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
    }
}

fn required<'a>(row: &'a HashMap<String, Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(column).ok_or(SqlError::MissingFilter(column))
}

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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64_expr(expr)?)),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(s.clone())
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_string_expr(expr)?)),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing value for {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
