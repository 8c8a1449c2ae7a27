use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertLocation {
        location: Location,
        actor_id: Ulid,
    },
    RenameLocation {
        id: Ulid,
        actor_id: Ulid,
        name: String,
    },
    DeleteLocation {
        id: Ulid,
        actor_id: Ulid,
    },
    InsertRoom {
        room: Room,
        actor_id: Ulid,
    },
    UpdateRoom {
        id: Ulid,
        actor_id: Ulid,
        changes: RoomChanges,
    },
    DeleteRoom {
        id: Ulid,
        actor_id: Ulid,
    },
    /// Without `actor_id` and with the default role and status this is a
    /// self-registration; anything else is provisioning.
    InsertUser {
        user: User,
        actor_id: Option<Ulid>,
    },
    ReviewUser {
        id: Ulid,
        actor_id: Ulid,
        status: AccountStatus,
    },
    InsertReservation {
        id: Ulid,
        room_id: Ulid,
        requester_id: Ulid,
        date: NaiveDate,
        start: Minutes,
        description: Option<String>,
    },
    /// `CONFIRMED` confirms, `CANCELLED` cancels.
    SetReservationStatus {
        id: Ulid,
        actor_id: Ulid,
        status: ReservationStatus,
    },
    RescheduleReservation {
        id: Ulid,
        actor_id: Ulid,
        date: NaiveDate,
        start: Minutes,
    },
    /// Soft delete: cancels and keeps the row.
    DeleteReservation {
        id: Ulid,
        actor_id: Ulid,
    },
    SelectSlots,
    SelectAvailability {
        room_id: Ulid,
        date: NaiveDate,
    },
    SelectRooms,
    SelectLocations,
    SelectUsers {
        status: Option<AccountStatus>,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectReservationDetail {
        id: Ulid,
        actor_id: Ulid,
    },
    SelectNextReservation {
        requester_id: Ulid,
    },
    SelectDashboard,
}

/// Table names a SELECT can return rows from.
pub const QUERY_TABLES: &[&str] = &[
    "slots",
    "availability",
    "rooms",
    "locations",
    "users",
    "reservations",
    "reservation_detail",
    "next_reservation",
    "dashboard",
];

const LOCATION_COLUMNS: &[&str] = &["id", "name", "actor_id"];
const ROOM_COLUMNS: &[&str] = &["id", "name", "description", "location", "available", "actor_id"];
const USER_COLUMNS: &[&str] = &["id", "name", "email", "role", "status", "actor_id"];
const RESERVATION_COLUMNS: &[&str] = &["id", "room_id", "requester_id", "date", "start", "description"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let statement = parse_statement(sql)?;
    match &statement {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without evaluating its filters. Lets the
/// extended protocol describe a statement that still holds `$n` placeholders.
pub fn select_table(sql: &str) -> Option<String> {
    let Ok(Statement::Query(query)) = parse_statement(sql) else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let table = table_factor_name(&select.from.first()?.relation).ok()?;
    QUERY_TABLES.contains(&table.as_str()).then_some(table)
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }
    Ok(stmts.remove(0))
}

// ── INSERT ────────────────────────────────────────────────────

/// Column/value pairs of a single-row INSERT. Without a column list the
/// values bind to `defaults` in order.
struct Row {
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, table: &'static str, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(table, col))
    }
}

fn insert_row(insert: &ast::Insert, defaults: &[&str]) -> Result<Row, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    let [row] = values.rows.as_slice() else {
        return Err(SqlError::Unsupported("INSERT must have exactly one row".into()));
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    Ok(Row {
        cells: columns.into_iter().zip(row.iter().cloned()).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "locations" => {
            let row = insert_row(insert, LOCATION_COLUMNS)?;
            let location = Location {
                id: parse_ulid(row.required("locations", "id")?)?,
                name: parse_string(row.required("locations", "name")?)?,
            };
            let actor_id = parse_ulid(row.required("locations", "actor_id")?)?;
            Ok(Command::InsertLocation { location, actor_id })
        }
        "rooms" => {
            let row = insert_row(insert, ROOM_COLUMNS)?;
            let room = Room {
                id: parse_ulid(row.required("rooms", "id")?)?,
                name: parse_string(row.required("rooms", "name")?)?,
                description: row.get("description").map(parse_string_or_null).transpose()?.flatten().unwrap_or_default(),
                location: parse_string(row.required("rooms", "location")?)?,
                available: row.get("available").map(parse_bool).transpose()?.unwrap_or(true),
            };
            let actor_id = parse_ulid(row.required("rooms", "actor_id")?)?;
            Ok(Command::InsertRoom { room, actor_id })
        }
        "users" => {
            let row = insert_row(insert, USER_COLUMNS)?;
            let user = User {
                id: parse_ulid(row.required("users", "id")?)?,
                name: parse_string(row.required("users", "name")?)?,
                email: parse_string(row.required("users", "email")?)?,
                role: row
                    .get("role")
                    .map(parse_role)
                    .transpose()?
                    .unwrap_or(Role::Member),
                status: row
                    .get("status")
                    .map(parse_account_status)
                    .transpose()?
                    .unwrap_or(AccountStatus::Pending),
            };
            let actor_id = row.get("actor_id").map(parse_ulid).transpose()?;
            Ok(Command::InsertUser { user, actor_id })
        }
        "reservations" => {
            let row = insert_row(insert, RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                id: parse_ulid(row.required("reservations", "id")?)?,
                room_id: parse_ulid(row.required("reservations", "room_id")?)?,
                requester_id: parse_ulid(row.required("reservations", "requester_id")?)?,
                date: parse_date(row.required("reservations", "date")?)?,
                start: parse_minutes(row.required("reservations", "start")?)?,
                description: row
                    .get("description")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let conds = conditions(selection)?;
    let id = parse_ulid(required_eq(&conds, "id")?)?;
    let actor_id = parse_ulid(required_eq(&conds, "actor_id")?)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let AssignmentTarget::ColumnName(name) = &a.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let col = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column".into()))?;
        sets.push((col, &a.value));
    }
    let set = |col: &str| sets.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "locations" => {
            let [(col, value)] = sets.as_slice() else {
                return Err(SqlError::Unsupported("locations: SET name only".into()));
            };
            if col != "name" {
                return Err(SqlError::ReadOnlyColumn("locations", col.clone()));
            }
            let name = parse_string(value)?;
            Ok(Command::RenameLocation { id, actor_id, name })
        }
        "rooms" => {
            let mut changes = RoomChanges::default();
            for (col, value) in &sets {
                match col.as_str() {
                    "name" => changes.name = Some(parse_string(value)?),
                    "description" => changes.description = Some(parse_string_or_null(value)?.unwrap_or_default()),
                    "location" => changes.location = Some(parse_string(value)?),
                    "available" => changes.available = Some(parse_bool(value)?),
                    other => return Err(SqlError::ReadOnlyColumn("rooms", other.to_string())),
                }
            }
            Ok(Command::UpdateRoom { id, actor_id, changes })
        }
        "users" => {
            let [(col, value)] = sets.as_slice() else {
                return Err(SqlError::Unsupported("users: SET status only".into()));
            };
            if col != "status" {
                return Err(SqlError::ReadOnlyColumn("users", col.clone()));
            }
            let status = parse_account_status(value)?;
            Ok(Command::ReviewUser { id, actor_id, status })
        }
        "reservations" => {
            if let Some(value) = set("status") {
                if sets.len() != 1 {
                    return Err(SqlError::Unsupported("reservations: SET status alone".into()));
                }
                let status = parse_reservation_status(value)?;
                if status == ReservationStatus::Pending {
                    return Err(SqlError::Unsupported("cannot set status back to PENDING".into()));
                }
                return Ok(Command::SetReservationStatus { id, actor_id, status });
            }
            let date = set("date").ok_or(SqlError::MissingColumn("reservations", "date"))?;
            let start = set("start").ok_or(SqlError::MissingColumn("reservations", "start"))?;
            if let Some((col, _)) = sets.iter().find(|(c, _)| c != "date" && c != "start") {
                return Err(SqlError::ReadOnlyColumn("reservations", col.clone()));
            }
            Ok(Command::RescheduleReservation {
                id,
                actor_id,
                date: parse_date(date)?,
                start: parse_minutes(start)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let conds = conditions(delete.selection.as_ref())?;
    let id = parse_ulid(required_eq(&conds, "id")?)?;
    let actor_id = parse_ulid(required_eq(&conds, "actor_id")?)?;

    match table.as_str() {
        "locations" => Ok(Command::DeleteLocation { id, actor_id }),
        "rooms" => Ok(Command::DeleteRoom { id, actor_id }),
        "reservations" => Ok(Command::DeleteReservation { id, actor_id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let conds = conditions(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots),
        "rooms" => Ok(Command::SelectRooms),
        "locations" => Ok(Command::SelectLocations),
        "dashboard" => Ok(Command::SelectDashboard),
        "availability" => Ok(Command::SelectAvailability {
            room_id: parse_ulid(required_eq(&conds, "room_id")?)?,
            date: parse_date(required_eq(&conds, "date")?)?,
        }),
        "users" => Ok(Command::SelectUsers {
            status: eq(&conds, "status").map(parse_account_status).transpose()?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            filter: reservation_filter(&conds)?,
        }),
        "reservation_detail" => Ok(Command::SelectReservationDetail {
            id: parse_ulid(required_eq(&conds, "id")?)?,
            actor_id: parse_ulid(required_eq(&conds, "actor_id")?)?,
        }),
        "next_reservation" => Ok(Command::SelectNextReservation {
            requester_id: parse_ulid(required_eq(&conds, "requester_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn reservation_filter(conds: &[Condition<'_>]) -> Result<ReservationFilter, SqlError> {
    let mut filter = ReservationFilter::default();
    for c in conds {
        match (c.column.as_str(), c.op) {
            ("room_id", Cmp::Eq) => filter.room_id = Some(parse_ulid(c.value)?),
            ("requester_id", Cmp::Eq) => filter.requester_id = Some(parse_ulid(c.value)?),
            ("location", Cmp::Eq) => filter.location = Some(parse_string(c.value)?),
            ("status", Cmp::Eq) => filter.status = Some(parse_reservation_status(c.value)?),
            ("date", Cmp::Eq) => {
                let d = parse_date(c.value)?;
                filter.from = Some(d);
                filter.until = Some(d);
            }
            ("date", Cmp::GtEq) => filter.from = Some(parse_date(c.value)?),
            ("date", Cmp::LtEq) => filter.until = Some(parse_date(c.value)?),
            (col, _) => return Err(SqlError::UnsupportedFilter(col.to_string())),
        }
    }
    Ok(filter)
}

// ── WHERE ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

struct Condition<'a> {
    column: String,
    op: Cmp,
    value: &'a Expr,
}

/// Flatten a conjunction of `column <op> value` comparisons.
fn conditions(selection: Option<&Expr>) -> Result<Vec<Condition<'_>>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_conditions(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_conditions<'a>(expr: &'a Expr, out: &mut Vec<Condition<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conditions(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_conditions(left, out)?;
                    return collect_conditions(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Condition {
                column,
                op,
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("condition {other}"))),
    }
}

fn eq<'a>(conds: &'a [Condition<'a>], col: &str) -> Option<&'a Expr> {
    conds
        .iter()
        .find(|c| c.column == col && c.op == Cmp::Eq)
        .map(|c| c.value)
}

fn required_eq<'a>(conds: &'a [Condition<'a>], col: &'static str) -> Result<&'a Expr, SqlError> {
    eq(conds, col).ok_or(SqlError::MissingFilter(col))
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(-parse_i64(expr)?),
        _ => match extract_value(expr) {
            Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
            None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

/// Minutes since midnight, as a number (`510`) or a `'HH:MM'` string.
fn parse_minutes(expr: &Expr) -> Result<Minutes, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && let Some((h, m)) = s.split_once(':')
    {
        let h: Minutes = h.parse().map_err(|_| SqlError::Parse(format!("bad time {s:?}")))?;
        let m: Minutes = m.parse().map_err(|_| SqlError::Parse(format!("bad time {s:?}")))?;
        if h >= 24 || m >= 60 {
            return Err(SqlError::Parse(format!("bad time {s:?}")));
        }
        return Ok(h * 60 + m);
    }
    let v = parse_i64(expr)?;
    Minutes::try_from(v)
        .ok()
        .filter(|m| *m < MINUTES_PER_DAY)
        .ok_or_else(|| SqlError::Parse(format!("{v} is not a minute of the day")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string(expr)?;
    Role::parse(&s).ok_or(SqlError::BadEnum("role", s))
}

fn parse_account_status(expr: &Expr) -> Result<AccountStatus, SqlError> {
    let s = parse_string(expr)?;
    AccountStatus::parse(&s).ok_or(SqlError::BadEnum("account status", s))
}

fn parse_reservation_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let s = parse_string(expr)?;
    ReservationStatus::parse(&s).ok_or(SqlError::BadEnum("reservation status", s))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str, &'static str),
    ReadOnlyColumn(&'static str, String),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
    BadEnum(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::ReadOnlyColumn(t, c) => write!(f, "{t}: column {c} cannot be set"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(col) => write!(f, "unsupported filter on {col}"),
            SqlError::BadEnum(kind, v) => write!(f, "unknown {kind}: {v}"),
        }
    }
}

impl std::error::Error for SqlError {}
