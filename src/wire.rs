use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotdAuthSource;
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::{TenantError, TenantManager};

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    /// The business is the connection's database name. Only onboarding may
    /// create one; everything else needs it to exist already.
    fn resolve_engine<C: ClientInfo>(&self, client: &C, create: bool) -> PgWireResult<Arc<Engine>> {
        let metadata = client.metadata();
        let slug = metadata.get("database").cloned().unwrap_or_default();
        let result = if create {
            self.tenant_manager.get_or_create(&slug)
        } else {
            self.tenant_manager.open_existing(&slug)
        };
        result.map_err(tenant_err)
    }

    async fn run<C: ClientInfo + Sync>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = cmd.label();
        let started = Instant::now();

        let result = match self.resolve_engine(client, cmd.creates_business()) {
            Ok(engine) => self.execute_command(&engine, cmd).await,
            Err(e) => Err(e),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SelectAvailability { service_id, date } => {
                let slots = engine
                    .availability(service_id, &date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(availability_schema(), slots, |enc, slot| {
                    enc.encode_field(&slot.time)?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&count(slot.spots_left))
                })])
            }
            Command::InsertBooking { request, returning } => {
                let public = request.source == BookingSource::Online;
                let receipt = admit_with_retry(engine, request).await.map_err(|e| {
                    if public {
                        public_engine_err(e)
                    } else {
                        engine_err(e)
                    }
                })?;
                if returning {
                    Ok(vec![rows(receipt_schema(), vec![receipt], |enc, r| {
                        enc.encode_field(&r.appointment_id.to_string())?;
                        enc.encode_field(&r.status.as_str())?;
                        enc.encode_field(&r.payment_required)
                    })])
                } else {
                    Ok(vec![inserted()])
                }
            }
            Command::ConfigureBusiness(profile) => {
                engine.configure_business(profile).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SetWorkingHours(hours) => {
                engine.set_working_hours(hours).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertService(service) => {
                engine.create_service(service).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::UpdateService { id, patch } => {
                engine.update_service(id, patch).await.map_err(engine_err)?;
                Ok(vec![updated()])
            }
            Command::DeleteService { id } => {
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::UpdateAppointment { id, patch } => {
                engine
                    .update_appointment(id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![updated()])
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertTimeBlock(block) => {
                engine.add_time_block(block).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteTimeBlock { id } => {
                engine.remove_time_block(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertClient(client) => {
                engine.create_client(client).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteClient { id } => {
                engine.delete_client(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::SelectBusiness => {
                let profile = engine.business_profile().await;
                Ok(vec![rows(business_schema(), profile.into_iter().collect(), |enc, p| {
                    enc.encode_field(&p.name)?;
                    enc.encode_field(&p.timezone)?;
                    enc.encode_field(&p.phone)?;
                    enc.encode_field(&p.address)
                })])
            }
            Command::SelectWorkingHours => {
                let hours = engine.working_hours().await;
                Ok(vec![rows(working_hours_schema(), hours, |enc, h| {
                    enc.encode_field(&i32::from(h.day_of_week))?;
                    enc.encode_field(&h.start.format("%H:%M").to_string())?;
                    enc.encode_field(&h.end.format("%H:%M").to_string())?;
                    enc.encode_field(&h.active)
                })])
            }
            Command::SelectServices => {
                let services = engine.list_services().await;
                Ok(vec![rows(services_schema(), services, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&count(s.duration_minutes))?;
                    enc.encode_field(&count(s.capacity))?;
                    enc.encode_field(&s.price_cents)?;
                    enc.encode_field(&s.requires_payment)?;
                    enc.encode_field(&s.active)
                })])
            }
            Command::SelectClients => {
                let clients = engine.list_clients();
                Ok(vec![rows(clients_schema(), clients, |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.name)?;
                    enc.encode_field(&c.phone)?;
                    enc.encode_field(&c.email)?;
                    enc.encode_field(&c.notes)
                })])
            }
            Command::SelectAppointments { start, end } => {
                let appointments = engine
                    .list_appointments(start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(appointments_schema(), appointments, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.service_id.to_string())?;
                    enc.encode_field(&a.client_id.map(|id| id.to_string()))?;
                    enc.encode_field(&a.client_name)?;
                    enc.encode_field(&a.client_phone)?;
                    enc.encode_field(&a.span.start)?;
                    enc.encode_field(&a.span.end)?;
                    enc.encode_field(&a.status.as_str())?;
                    enc.encode_field(&count(a.spots))?;
                    enc.encode_field(&a.source.as_str())?;
                    enc.encode_field(&a.notes)
                })])
            }
            Command::SelectTimeBlocks { start, end } => {
                let blocks = engine
                    .list_time_blocks(start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(time_blocks_schema(), blocks, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.title)?;
                    enc.encode_field(&b.span.start)?;
                    enc.encode_field(&b.span.end)
                })])
            }
        }
    }
}

/// A lock timeout means nothing was written, so the whole admission is
/// attempted once more before the caller sees it.
async fn admit_with_retry(engine: &Engine, request: BookingRequest) -> Result<BookingReceipt, EngineError> {
    match engine.admit(request.clone()).await {
        Err(e) if e.is_retryable() => {
            tracing::warn!("admission conflict on service {}, retrying: {e}", request.service_id);
            metrics::counter!(observability::ADMISSION_RETRIES_TOTAL).increment(1);
            engine.admit(request).await
        }
        other => other,
    }
}

fn count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("slot_time", Type::VARCHAR),
        field("start", Type::INT8),
        field("spots_left", Type::INT4),
    ]
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("payment_required", Type::BOOL),
    ]
}

fn business_schema() -> Vec<FieldInfo> {
    vec![
        field("name", Type::VARCHAR),
        field("timezone", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("address", Type::VARCHAR),
    ]
}

fn working_hours_schema() -> Vec<FieldInfo> {
    vec![
        field("day_of_week", Type::INT4),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
        field("capacity", Type::INT4),
        field("price_cents", Type::INT8),
        field("requires_payment", Type::BOOL),
        field("active", Type::BOOL),
    ]
}

fn clients_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("notes", Type::VARCHAR),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("client_name", Type::VARCHAR),
        field("client_phone", Type::VARCHAR),
        field("start_time", Type::INT8),
        field("end_time", Type::INT8),
        field("status", Type::VARCHAR),
        field("spots", Type::INT4),
        field("source", Type::VARCHAR),
        field("notes", Type::VARCHAR),
    ]
}

fn time_blocks_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("start_time", Type::INT8),
        field("end_time", Type::INT8),
    ]
}

/// Row shape of a statement that has not been executed yet (describe).
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("RETURNING") {
        return receipt_schema();
    }
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    let table = upper
        .split_once(" FROM ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == '"' || c == ';').to_lowercase());
    match table.as_deref() {
        Some("availability") => availability_schema(),
        Some("business") => business_schema(),
        Some("working_hours") => working_hours_schema(),
        Some("services") => services_schema(),
        Some("clients") => clients_schema(),
        Some("appointments") => appointments_schema(),
        Some("time_blocks") => time_blocks_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(&*client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&*client, &sql).await?;
        responses
            .pop()
            .ok_or_else(|| sql_err(sql::SqlError::Empty))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidArgument(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::CapacityExceeded { .. } => "23P01",
        EngineError::Conflict(_) => "40001",
        EngineError::StoreUnavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

/// Same codes, but the text shown on the public booking page.
fn public_engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.public_message())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match &e {
        sql::SqlError::InvalidValue(_) | sql::SqlError::BadStatus(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

fn tenant_err(e: TenantError) -> PgWireError {
    let code = match &e {
        TenantError::UnknownBusiness(_) => "P0002",
        TenantError::InvalidName(_) => "3D000",
        TenantError::TooManyTenants => "53300",
        TenantError::Io(_) => "58030",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::NaiveTime;
    use ulid::Ulid;

    use crate::calendar;
    use crate::clock::FixedClock;
    use crate::engine::SLOT_TAKEN_MESSAGE;

    /// A UTC business open Tuesdays 09:00-18:00 with one single-spot service,
    /// clock on the Monday before.
    async fn single_spot_business(name: &str, lock_timeout: Duration) -> (Arc<Engine>, Ulid) {
        let dir = std::env::temp_dir().join("slotd_test_wire");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);

        let now = calendar::to_instant(
            calendar::parse_date("2026-10-19").unwrap(),
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            calendar::parse_timezone("UTC").unwrap(),
        )
        .unwrap();
        let engine = Arc::new(
            Engine::new(path, Arc::new(FixedClock::new(now)))
                .unwrap()
                .with_lock_timeout(lock_timeout),
        );
        engine
            .configure_business(BusinessProfile {
                name: "Studio".into(),
                timezone: "UTC".into(),
                phone: None,
                address: None,
            })
            .await
            .unwrap();
        engine
            .set_working_hours(WorkingHours {
                day_of_week: 2,
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                active: true,
            })
            .await
            .unwrap();
        let service = engine
            .create_service(Service {
                id: Ulid::new(),
                name: "Corte".into(),
                duration_minutes: 30,
                capacity: 1,
                price_cents: None,
                requires_payment: false,
                active: true,
            })
            .await
            .unwrap();
        (engine, service.id)
    }

    fn request(service_id: Ulid) -> BookingRequest {
        BookingRequest::online(service_id, "2026-10-20", "09:00", "Ana")
    }

    #[tokio::test]
    async fn conflict_is_retried_once_then_shown_as_taken() {
        let timeout = Duration::from_millis(50);
        let (engine, sid) = single_spot_business("retry_exhausted.wal", timeout).await;
        let ledger = engine.get_ledger(&sid).unwrap();
        let held = ledger.write().await;

        let started = Instant::now();
        let err = admit_with_retry(&engine, request(sid)).await.unwrap_err();
        // Two full lock waits: the first attempt and exactly one retry.
        let elapsed = started.elapsed();
        assert!(elapsed >= 2 * timeout, "{elapsed:?}");
        assert!(elapsed < 3 * timeout + Duration::from_millis(500), "{elapsed:?}");
        drop(held);

        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(sqlstate(&err), "40001");
        assert_eq!(err.public_message(), SLOT_TAKEN_MESSAGE);
        assert_eq!(
            EngineError::CapacityExceeded { remaining: 0 }.public_message(),
            err.public_message()
        );
        match public_engine_err(err) {
            PgWireError::UserError(info) => {
                assert_eq!(info.code, "40001");
                assert_eq!(info.message, SLOT_TAKEN_MESSAGE);
            }
            other => panic!("expected a user error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_admits_once_the_lock_frees() {
        let timeout = Duration::from_millis(200);
        let (engine, sid) = single_spot_business("retry_succeeds.wal", timeout).await;
        let held = engine.get_ledger(&sid).unwrap().write_owned().await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(held);
        });

        let receipt = admit_with_retry(&engine, request(sid)).await.unwrap();
        assert_eq!(receipt.status, AppointmentStatus::Confirmed);
        assert!(matches!(
            engine.admit(request(sid)).await,
            Err(EngineError::CapacityExceeded { remaining: 0 })
        ));
    }

    fn names(schema: &[FieldInfo]) -> Vec<&str> {
        schema.iter().map(|f| f.name()).collect()
    }

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM services"), 0);
        assert_eq!(
            count_params("SELECT * FROM availability WHERE service_id = $1 AND slot_date = $2"),
            2
        );
        assert_eq!(count_params("INSERT INTO bookings VALUES ($10, $2)"), 10);
    }

    #[test]
    fn describe_picks_schema_by_table() {
        assert_eq!(
            names(&result_schema(
                "select * from availability where service_id = $1 and slot_date = $2"
            )),
            vec!["slot_time", "start", "spots_left"]
        );
        assert_eq!(
            names(&result_schema(
                "INSERT INTO bookings (service_id, slot_date, slot_time, client_name) VALUES ($1, $2, $3, $4) RETURNING *"
            )),
            vec!["id", "status", "payment_required"]
        );
        assert_eq!(result_schema("SELECT * FROM services;").len(), 7);
        assert!(result_schema("DELETE FROM services WHERE id = $1").is_empty());
    }

    #[test]
    fn errors_map_to_sqlstates() {
        assert_eq!(sqlstate(&EngineError::CapacityExceeded { remaining: 0 }), "23P01");
        assert_eq!(sqlstate(&EngineError::Conflict("lock".into())), "40001");
        assert_eq!(sqlstate(&EngineError::invalid("bad")), "22023");
        assert_eq!(sqlstate(&EngineError::NotFound("service".into())), "P0002");
        assert_eq!(sqlstate(&EngineError::StoreUnavailable("disk".into())), "58030");
    }

    fn sql_code(query: &str) -> String {
        match sql::parse_sql(query).map_err(sql_err) {
            Err(PgWireError::UserError(info)) => info.code.clone(),
            other => panic!("expected a user error, got {other:?}"),
        }
    }

    #[test]
    fn bad_values_are_invalid_arguments_not_syntax_errors() {
        assert_eq!(
            sql_code("INSERT INTO working_hours VALUES (1, '25:99', '18:00', true)"),
            "22023"
        );
        assert_eq!(
            sql_code("DELETE FROM services WHERE id = 'not-a-ulid'"),
            "22023"
        );
        assert_eq!(sql_code("SELEKT nothing"), "42601");
        assert_eq!(sql_code("SELECT * FROM nowhere"), "42601");
    }
}
