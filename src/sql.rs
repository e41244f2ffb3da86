use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar;
use crate::engine::{AppointmentPatch, BookingRequest, ServicePatch};
use crate::model::*;

/// Parsed command from SQL input. The business is the connection's database,
/// so no command names it.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailability {
        service_id: Ulid,
        date: String,
    },
    /// `bookings` (public page) and `appointments` (dashboard) both admit
    /// through the same path; only the source differs.
    InsertBooking {
        request: BookingRequest,
        returning: bool,
    },
    ConfigureBusiness(BusinessProfile),
    SetWorkingHours(WorkingHours),
    InsertService(Service),
    UpdateService {
        id: Ulid,
        patch: ServicePatch,
    },
    DeleteService {
        id: Ulid,
    },
    UpdateAppointment {
        id: Ulid,
        patch: AppointmentPatch,
    },
    DeleteAppointment {
        id: Ulid,
    },
    InsertTimeBlock(TimeBlock),
    DeleteTimeBlock {
        id: Ulid,
    },
    InsertClient(Client),
    DeleteClient {
        id: Ulid,
    },
    SelectBusiness,
    SelectWorkingHours,
    SelectServices,
    SelectClients,
    SelectAppointments {
        start: Ms,
        end: Ms,
    },
    SelectTimeBlocks {
        start: Ms,
        end: Ms,
    },
}

impl Command {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Command::SelectAvailability { .. } => "select_availability",
            Command::InsertBooking { request, .. } => match request.source {
                BookingSource::Online => "insert_booking",
                BookingSource::Manual => "insert_appointment",
            },
            Command::ConfigureBusiness(_) => "insert_business",
            Command::SetWorkingHours(_) => "insert_working_hours",
            Command::InsertService(_) => "insert_service",
            Command::UpdateService { .. } => "update_service",
            Command::DeleteService { .. } => "delete_service",
            Command::UpdateAppointment { .. } => "update_appointment",
            Command::DeleteAppointment { .. } => "delete_appointment",
            Command::InsertTimeBlock(_) => "insert_time_block",
            Command::DeleteTimeBlock { .. } => "delete_time_block",
            Command::InsertClient(_) => "insert_client",
            Command::DeleteClient { .. } => "delete_client",
            Command::SelectBusiness => "select_business",
            Command::SelectWorkingHours => "select_working_hours",
            Command::SelectServices => "select_services",
            Command::SelectClients => "select_clients",
            Command::SelectAppointments { .. } => "select_appointments",
            Command::SelectTimeBlocks { .. } => "select_time_blocks",
        }
    }

    /// Only `INSERT INTO business` may bring a new business into existence.
    pub fn creates_business(&self) -> bool {
        matches!(self, Command::ConfigureBusiness(_))
    }
}

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "bookings" => &[
            "service_id",
            "slot_date",
            "slot_time",
            "client_name",
            "client_phone",
            "notes",
            "spots",
            "id",
        ],
        "appointments" => &[
            "service_id",
            "slot_date",
            "slot_time",
            "client_name",
            "client_phone",
            "notes",
            "spots",
            "id",
            "client_id",
        ],
        "business" => &["name", "timezone", "phone", "address"],
        "working_hours" => &["day_of_week", "start_time", "end_time", "active"],
        "services" => &[
            "id",
            "name",
            "duration_minutes",
            "capacity",
            "price_cents",
            "requires_payment",
            "active",
        ],
        "time_blocks" => &["id", "title", "start_time", "end_time"],
        "clients" => &["id", "name", "phone", "email", "notes"],
        _ => return None,
    })
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
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. SQL `NULL` reads as absent.
struct Row<'a> {
    table: String,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .get(column)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or_else(|| SqlError::MissingColumn(self.table.clone(), column))
    }

    fn string(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string(self.required(column)?)
    }

    fn opt_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string).transpose()
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.required(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid).transpose()
    }

    fn i64(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64(self.required(column)?)
    }

    fn opt_i64(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.get(column).map(parse_i64).transpose()
    }

    fn u32(&self, column: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.required(column)?)
    }

    fn opt_u32(&self, column: &str) -> Result<Option<u32>, SqlError> {
        self.get(column).map(parse_u32).transpose()
    }

    fn opt_bool(&self, column: &str) -> Result<Option<bool>, SqlError> {
        self.get(column).map(parse_bool).transpose()
    }

    fn time(&self, column: &'static str) -> Result<chrono::NaiveTime, SqlError> {
        let s = self.string(column)?;
        calendar::parse_time(&s).map_err(|e| SqlError::InvalidValue(format!("{column}: {e}")))
    }
}

fn insert_row<'a>(insert: &'a ast::Insert, table: &str) -> Result<Row<'a>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let first = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table)
            .ok_or_else(|| SqlError::UnknownTable(table.to_string()))?
            .iter()
            .map(|c| c.to_string())
            .collect()
    } else {
        insert
            .columns
            .iter()
            .map(|ident| ident.value.to_lowercase())
            .collect()
    };
    if first.len() > columns.len() {
        return Err(SqlError::WrongArity(table.to_string(), columns.len(), first.len()));
    }
    if !insert.columns.is_empty() && first.len() != columns.len() {
        return Err(SqlError::WrongArity(table.to_string(), columns.len(), first.len()));
    }

    Ok(Row {
        table: table.to_string(),
        values: columns.into_iter().zip(first.iter()).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert, &table)?;

    match table.as_str() {
        "bookings" | "appointments" => {
            let source = if table == "bookings" {
                BookingSource::Online
            } else {
                BookingSource::Manual
            };
            let client_id = if source == BookingSource::Manual {
                row.opt_ulid("client_id")?
            } else {
                None
            };
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    id: row.opt_ulid("id")?,
                    service_id: row.ulid("service_id")?,
                    date: row.string("slot_date")?,
                    time: row.string("slot_time")?,
                    spots: row.opt_u32("spots")?.unwrap_or(1),
                    client_name: row.opt_string("client_name")?.unwrap_or_default(),
                    client_phone: row.opt_string("client_phone")?,
                    client_id,
                    notes: row.opt_string("notes")?,
                    source,
                },
                returning: insert.returning.is_some(),
            })
        }
        "business" => Ok(Command::ConfigureBusiness(BusinessProfile {
            name: row.string("name")?,
            timezone: row.string("timezone")?,
            phone: row.opt_string("phone")?,
            address: row.opt_string("address")?,
        })),
        "working_hours" => {
            let day = row.u32("day_of_week")?;
            Ok(Command::SetWorkingHours(WorkingHours {
                day_of_week: u8::try_from(day)
                    .map_err(|_| SqlError::InvalidValue(format!("{day} out of day_of_week range")))?,
                start: row.time("start_time")?,
                end: row.time("end_time")?,
                active: row.opt_bool("active")?.unwrap_or(true),
            }))
        }
        "services" => Ok(Command::InsertService(Service {
            id: row.ulid("id")?,
            name: row.string("name")?,
            duration_minutes: row.u32("duration_minutes")?,
            capacity: row.opt_u32("capacity")?.unwrap_or(1),
            price_cents: row.opt_i64("price_cents")?,
            requires_payment: row.opt_bool("requires_payment")?.unwrap_or(false),
            active: row.opt_bool("active")?.unwrap_or(true),
        })),
        "time_blocks" => {
            let start = row.i64("start_time")?;
            let end = row.i64("end_time")?;
            // Inverted spans are rejected by the engine with a domain error.
            let span = Span::try_new(start, end).unwrap_or(Span { start, end });
            Ok(Command::InsertTimeBlock(TimeBlock {
                id: row.ulid("id")?,
                title: row.opt_string("title")?.unwrap_or_default(),
                span,
            }))
        }
        "clients" => Ok(Command::InsertClient(Client {
            id: row.ulid("id")?,
            name: row.string("name")?,
            phone: row.opt_string("phone")?,
            email: row.opt_string("email")?,
            notes: row.opt_string("notes")?,
        })),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set: HashMap<String, &Expr> = HashMap::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(column, &assignment.value);
    }
    let row = Row {
        table: table.clone(),
        values: set,
    };
    let has = |column: &str| row.values.contains_key(column);

    let command = match table.as_str() {
        "services" => Command::UpdateService {
            id,
            patch: ServicePatch {
                name: row.opt_string("name")?,
                duration_minutes: row.opt_u32("duration_minutes")?,
                capacity: row.opt_u32("capacity")?,
                price_cents: if has("price_cents") {
                    Some(row.opt_i64("price_cents")?)
                } else {
                    None
                },
                requires_payment: row.opt_bool("requires_payment")?,
                active: row.opt_bool("active")?,
            },
        },
        "appointments" => {
            let status = row
                .opt_string("status")?
                .map(|s| AppointmentStatus::parse(&s).ok_or(SqlError::BadStatus(s)))
                .transpose()?;
            Command::UpdateAppointment {
                id,
                patch: AppointmentPatch {
                    status,
                    notes: if has("notes") {
                        Some(row.opt_string("notes")?)
                    } else {
                        None
                    },
                },
            }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    if row.values.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    Ok(command)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "appointments" | "bookings" => Ok(Command::DeleteAppointment { id }),
        "time_blocks" => Ok(Command::DeleteTimeBlock { id }),
        "clients" => Ok(Command::DeleteClient { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let find = |column: &str, op: BinaryOperator| {
        filters
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| *e)
    };

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            service_id: parse_ulid(
                find("service_id", BinaryOperator::Eq)
                    .ok_or(SqlError::MissingFilter("service_id"))?,
            )?,
            date: parse_string(
                find("slot_date", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("slot_date"))?,
            )?,
        }),
        "appointments" | "time_blocks" => {
            let start = parse_i64(
                find("start_time", BinaryOperator::GtEq)
                    .ok_or(SqlError::MissingFilter("start_time >="))?,
            )?;
            let end = parse_i64(
                find("start_time", BinaryOperator::Lt)
                    .ok_or(SqlError::MissingFilter("start_time <"))?,
            )?;
            if table == "appointments" {
                Ok(Command::SelectAppointments { start, end })
            } else {
                Ok(Command::SelectTimeBlocks { start, end })
            }
        }
        "business" => Ok(Command::SelectBusiness),
        "working_hours" => Ok(Command::SelectWorkingHours),
        "services" => Ok(Command::SelectServices),
        "clients" => Ok(Command::SelectClients),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten a conjunction of `column <op> value` comparisons.
fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((column, op.clone(), right.as_ref()));
            Ok(())
        }
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
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
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
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad ULID '{s}': {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_string(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::InvalidValue(format!("bad integer '{s}': {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
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
    WrongArity(String, usize, usize),
    MissingColumn(String, &'static str),
    MissingFilter(&'static str),
    BadStatus(String),
    /// Well-formed SQL carrying a value the column cannot hold.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadStatus(s) => write!(f, "unknown appointment status: {s}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE service_id = '{ID}' AND slot_date = '2026-10-20'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                service_id: id(),
                date: "2026-10-20".into()
            }
        );
    }

    #[test]
    fn availability_requires_both_filters() {
        let sql = format!("SELECT * FROM availability WHERE service_id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("slot_date"))
        ));
    }

    #[test]
    fn parse_public_booking_with_columns() {
        let sql = format!(
            "INSERT INTO bookings (service_id, slot_date, slot_time, client_name, client_phone) \
             VALUES ('{ID}', '2026-10-20', '09:30', 'Ana Lima', '11999990000') RETURNING id"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request, returning } => {
                assert!(returning);
                assert_eq!(request.service_id, id());
                assert_eq!(request.date, "2026-10-20");
                assert_eq!(request.time, "09:30");
                assert_eq!(request.spots, 1);
                assert_eq!(request.client_name, "Ana Lima");
                assert_eq!(request.client_phone.as_deref(), Some("11999990000"));
                assert_eq!(request.source, BookingSource::Online);
                assert_eq!(request.id, None);
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_positional_booking_with_spots() {
        let sql = format!(
            "INSERT INTO bookings VALUES ('{ID}', '2026-10-20', '10:00', 'Grupo', NULL, 'aniversário', 4)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request, returning } => {
                assert!(!returning);
                assert_eq!(request.spots, 4);
                assert_eq!(request.client_phone, None);
                assert_eq!(request.notes.as_deref(), Some("aniversário"));
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn booking_without_name_still_parses() {
        // Name validation belongs to admission.
        let sql = format!(
            "INSERT INTO bookings (service_id, slot_date, slot_time) VALUES ('{ID}', '2026-10-20', '10:00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request, .. } => assert!(request.client_name.is_empty()),
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_manual_appointment_with_client() {
        let sql = format!(
            "INSERT INTO appointments (service_id, slot_date, slot_time, client_name, client_id) \
             VALUES ('{ID}', '2026-10-20', '19:00', 'Bia', '{ID}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request, .. } => {
                assert_eq!(request.source, BookingSource::Manual);
                assert_eq!(request.client_id, Some(id()));
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_business_and_hours() {
        let cmd = parse_sql(
            "INSERT INTO business (name, timezone) VALUES ('Studio Bela', 'America/Sao_Paulo')",
        )
        .unwrap();
        assert!(cmd.creates_business());
        assert_eq!(
            cmd,
            Command::ConfigureBusiness(BusinessProfile {
                name: "Studio Bela".into(),
                timezone: "America/Sao_Paulo".into(),
                phone: None,
                address: None,
            })
        );

        match parse_sql("INSERT INTO working_hours VALUES (1, '09:00', '18:00', true)").unwrap() {
            Command::SetWorkingHours(h) => {
                assert_eq!(h.day_of_week, 1);
                assert_eq!(h.start.to_string(), "09:00:00");
                assert_eq!(h.end.to_string(), "18:00:00");
                assert!(h.active);
            }
            other => panic!("expected SetWorkingHours, got {other:?}"),
        }
        assert!(matches!(
            parse_sql("INSERT INTO working_hours VALUES (1, '9h', '18:00', true)"),
            Err(SqlError::InvalidValue(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO working_hours VALUES (300, '09:00', '18:00', true)"),
            Err(SqlError::InvalidValue(_))
        ));
    }

    #[test]
    fn parse_service_defaults() {
        let sql = format!(
            "INSERT INTO services (id, name, duration_minutes) VALUES ('{ID}', 'Corte', 30)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertService(s) => {
                assert_eq!(s.capacity, 1);
                assert_eq!(s.price_cents, None);
                assert!(!s.requires_payment);
                assert!(s.active);
            }
            other => panic!("expected InsertService, got {other:?}"),
        }
    }

    #[test]
    fn parse_update_service() {
        let sql = format!("UPDATE services SET capacity = 6, price_cents = NULL WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateService {
                id: id(),
                patch: ServicePatch {
                    capacity: Some(6),
                    price_cents: Some(None),
                    ..Default::default()
                }
            }
        );
    }

    #[test]
    fn parse_update_appointment_status() {
        let sql = format!("UPDATE appointments SET status = 'no_show' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateAppointment {
                id: id(),
                patch: AppointmentPatch {
                    status: Some(AppointmentStatus::NoShow),
                    notes: None,
                }
            }
        );
        let bad = format!("UPDATE appointments SET status = 'maybe' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&bad), Err(SqlError::BadStatus(_))));
    }

    #[test]
    fn parse_time_block_and_listing() {
        let sql = format!(
            "INSERT INTO time_blocks (id, title, start_time, end_time) VALUES ('{ID}', 'Almoço', 1000, 2000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertTimeBlock(b) => assert_eq!(b.span, Span::new(1000, 2000)),
            other => panic!("expected InsertTimeBlock, got {other:?}"),
        }
        assert_eq!(
            parse_sql("SELECT * FROM time_blocks WHERE start_time >= 0 AND start_time < 5000").unwrap(),
            Command::SelectTimeBlocks { start: 0, end: 5000 }
        );
        assert!(parse_sql("SELECT * FROM appointments").is_err());
    }

    #[test]
    fn parse_deletes() {
        for (table, expected) in [
            ("services", Command::DeleteService { id: id() }),
            ("appointments", Command::DeleteAppointment { id: id() }),
            ("time_blocks", Command::DeleteTimeBlock { id: id() }),
            ("clients", Command::DeleteClient { id: id() }),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{ID}'");
            assert_eq!(parse_sql(&sql).unwrap(), expected);
        }
    }

    #[test]
    fn parse_plain_listings() {
        assert_eq!(parse_sql("SELECT * FROM services").unwrap(), Command::SelectServices);
        assert_eq!(parse_sql("SELECT * FROM business").unwrap(), Command::SelectBusiness);
        assert_eq!(
            parse_sql("SELECT * FROM working_hours").unwrap(),
            Command::SelectWorkingHours
        );
        assert_eq!(parse_sql("SELECT * FROM clients").unwrap(), Command::SelectClients);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO resources VALUES ('{ID}')")),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql(&format!("DELETE FROM services WHERE name = '{ID}'")),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO business (name) VALUES ('Sem fuso')"),
            Err(SqlError::MissingColumn(_, "timezone"))
        ));
    }
}
