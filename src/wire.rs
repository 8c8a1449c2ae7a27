use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::auth::SharedPasswordAuth;
use crate::engine::{Engine, EngineError, SlotState, SlotView};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::OrgManager;

pub struct RoomGridHandler {
    orgs: Arc<OrgManager>,
    query_parser: Arc<RoomGridQueryParser>,
}

impl RoomGridHandler {
    pub fn new(orgs: Arc<OrgManager>) -> Self {
        Self {
            orgs,
            query_parser: Arc::new(RoomGridQueryParser),
        }
    }

    /// The engine of the organization named by the connection's database.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.orgs
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("organization error: {e}")))
    }

    /// Parse, execute and record metrics for one statement. Result columns
    /// use `format`.
    async fn run(&self, engine: &Engine, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertLocation { location, actor_id } => {
                engine
                    .create_location(actor_id, location)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RenameLocation { id, actor_id, name } => {
                engine
                    .rename_location(actor_id, id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteLocation { id, actor_id } => {
                engine.delete_location(actor_id, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertRoom { room, actor_id } => {
                engine.create_room(actor_id, room).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateRoom {
                id,
                actor_id,
                changes,
            } => {
                engine
                    .update_room(actor_id, id, changes)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteRoom { id, actor_id } => {
                engine.delete_room(actor_id, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertUser { user, actor_id } => {
                let self_registration = actor_id.is_none()
                    && user.role == Role::Member
                    && user.status == AccountStatus::Pending;
                let created = if self_registration {
                    engine.register_user(user).await
                } else {
                    engine.provision_user(actor_id, user).await
                };
                created.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ReviewUser {
                id,
                actor_id,
                status,
            } => {
                engine
                    .review_account(actor_id, id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                room_id,
                requester_id,
                date,
                start,
                description,
            } => {
                engine
                    .create_reservation(id, room_id, requester_id, date, start, description)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetReservationStatus {
                id,
                actor_id,
                status,
            } => {
                let updated = match status {
                    ReservationStatus::Confirmed => engine.confirm_reservation(id, actor_id).await,
                    _ => engine.cancel_reservation(id, actor_id).await,
                };
                updated.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::RescheduleReservation {
                id,
                actor_id,
                date,
                start,
            } => {
                engine
                    .reschedule_reservation(id, actor_id, date, start)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteReservation { id, actor_id } => {
                engine
                    .cancel_reservation(id, actor_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSlots => Ok(query_response(
                fields(format, SLOT_COLUMNS),
                engine.list_slots().iter(),
                |enc, slot| {
                    enc.encode_field(&hhmm(slot.start_offset()))?;
                    enc.encode_field(&hhmm(slot.end_offset()))?;
                    enc.encode_field(&(slot.duration_minutes as i32))?;
                    enc.encode_field(&slot.bookable)
                },
            )),
            Command::SelectAvailability { room_id, date } => {
                let grid = engine.day_grid(room_id, date).await.map_err(engine_err)?;
                let rid = room_id.to_string();
                Ok(query_response(fields(format, AVAILABILITY_COLUMNS), grid, |enc, view| {
                    encode_slot_view(enc, &rid, &view)
                }))
            }
            Command::SelectRooms => Ok(query_response(
                fields(format, ROOM_COLUMNS),
                engine.list_rooms().await,
                |enc, room| encode_room(enc, &room),
            )),
            Command::SelectLocations => Ok(query_response(
                fields(format, LOCATION_COLUMNS),
                engine.list_locations(),
                |enc, location| {
                    enc.encode_field(&location.id.to_string())?;
                    enc.encode_field(&location.name)
                },
            )),
            Command::SelectUsers { status } => Ok(query_response(
                fields(format, USER_COLUMNS),
                engine.list_users(status),
                |enc, user| encode_user(enc, &user),
            )),
            Command::SelectReservations { filter } => Ok(query_response(
                fields(format, RESERVATION_COLUMNS),
                engine.list_reservations(&filter).await,
                |enc, r| encode_reservation(enc, &r),
            )),
            Command::SelectReservationDetail { id, actor_id } => {
                let detail = engine
                    .reservation_detail(id, actor_id)
                    .await
                    .map_err(engine_err)?;
                Ok(query_response(
                    fields(format, RESERVATION_DETAIL_COLUMNS),
                    [detail],
                    |enc, d| {
                        encode_reservation(enc, &d.reservation)?;
                        enc.encode_field(&d.room.name)?;
                        enc.encode_field(&d.room.location)?;
                        enc.encode_field(&d.requester.name)?;
                        enc.encode_field(&d.requester.email)
                    },
                ))
            }
            Command::SelectNextReservation { requester_id } => {
                let next = engine.next_reservation(requester_id, local_now()).await;
                Ok(query_response(fields(format, RESERVATION_COLUMNS), next, |enc, r| {
                    encode_reservation(enc, &r)
                }))
            }
            Command::SelectDashboard => {
                let stats = engine.dashboard(local_now()).await;
                Ok(query_response(fields(format, DASHBOARD_COLUMNS), [stats], |enc, s| {
                    for count in [
                        s.pending_reservations,
                        s.pending_accounts,
                        s.total_rooms,
                        s.blocked_rooms,
                        s.occupied_rooms,
                        s.available_rooms,
                        s.bookings_today,
                        s.bookings_this_week,
                        s.bookings_previous_week,
                    ] {
                        enc.encode_field(&(count as i64))?;
                    }
                    enc.encode_field(&s.percentage_change)
                }))
            }
        }
    }
}

fn local_now() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn hhmm(m: Minutes) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

// ── Result sets ──────────────────────────────────────────────────

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_room(enc: &mut DataRowEncoder, room: &Room) -> PgWireResult<()> {
    enc.encode_field(&room.id.to_string())?;
    enc.encode_field(&room.name)?;
    enc.encode_field(&room.description)?;
    enc.encode_field(&room.location)?;
    enc.encode_field(&room.available)
}

fn encode_user(enc: &mut DataRowEncoder, user: &User) -> PgWireResult<()> {
    enc.encode_field(&user.id.to_string())?;
    enc.encode_field(&user.name)?;
    enc.encode_field(&user.email)?;
    enc.encode_field(&user.role.as_str())?;
    enc.encode_field(&user.status.as_str())
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.room_id.to_string())?;
    enc.encode_field(&r.requester_id.to_string())?;
    enc.encode_field(&r.date.to_string())?;
    enc.encode_field(&hhmm(r.span.start))?;
    enc.encode_field(&hhmm(r.span.end))?;
    enc.encode_field(&r.description)?;
    enc.encode_field(&r.status.as_str())
}

fn encode_slot_view(enc: &mut DataRowEncoder, room_id: &str, view: &SlotView) -> PgWireResult<()> {
    let (state, reservation_id) = match view.state {
        SlotState::Free => ("FREE", None),
        SlotState::Taken(id) => ("TAKEN", Some(id.to_string())),
        SlotState::Break => ("BREAK", None),
        SlotState::RoomDisabled => ("ROOM_DISABLED", None),
    };
    enc.encode_field(&room_id)?;
    enc.encode_field(&hhmm(view.slot.start_offset()))?;
    enc.encode_field(&hhmm(view.slot.end_offset()))?;
    enc.encode_field(&state)?;
    enc.encode_field(&reservation_id)
}

/// Column list with each column's wire format taken from `format`.
fn fields(format: &Format, columns: &[(&str, Type)]) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

const SLOT_COLUMNS: &[(&str, Type)] = &[
    ("start", Type::VARCHAR),
    ("end", Type::VARCHAR),
    ("duration_minutes", Type::INT4),
    ("bookable", Type::BOOL),
];

const AVAILABILITY_COLUMNS: &[(&str, Type)] = &[
    ("room_id", Type::VARCHAR),
    ("start", Type::VARCHAR),
    ("end", Type::VARCHAR),
    ("state", Type::VARCHAR),
    ("reservation_id", Type::VARCHAR),
];

const ROOM_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("location", Type::VARCHAR),
    ("available", Type::BOOL),
];

const LOCATION_COLUMNS: &[(&str, Type)] = &[("id", Type::VARCHAR), ("name", Type::VARCHAR)];

const USER_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("email", Type::VARCHAR),
    ("role", Type::VARCHAR),
    ("status", Type::VARCHAR),
];

const RESERVATION_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("room_id", Type::VARCHAR),
    ("requester_id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("start", Type::VARCHAR),
    ("end", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("status", Type::VARCHAR),
];

const RESERVATION_DETAIL_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("room_id", Type::VARCHAR),
    ("requester_id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("start", Type::VARCHAR),
    ("end", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("room_name", Type::VARCHAR),
    ("location", Type::VARCHAR),
    ("requester_name", Type::VARCHAR),
    ("requester_email", Type::VARCHAR),
];

const DASHBOARD_COLUMNS: &[(&str, Type)] = &[
    ("pending_reservations", Type::INT8),
    ("pending_accounts", Type::INT8),
    ("total_rooms", Type::INT8),
    ("blocked_rooms", Type::INT8),
    ("occupied_rooms", Type::INT8),
    ("available_rooms", Type::INT8),
    ("bookings_today", Type::INT8),
    ("bookings_this_week", Type::INT8),
    ("bookings_previous_week", Type::INT8),
    ("percentage_change", Type::FLOAT8),
];

/// Columns a known SELECT table returns.
fn table_columns(table: &str) -> &'static [(&'static str, Type)] {
    match table {
        "slots" => SLOT_COLUMNS,
        "availability" => AVAILABILITY_COLUMNS,
        "rooms" => ROOM_COLUMNS,
        "locations" => LOCATION_COLUMNS,
        "users" => USER_COLUMNS,
        "reservations" | "next_reservation" => RESERVATION_COLUMNS,
        "reservation_detail" => RESERVATION_DETAIL_COLUMNS,
        "dashboard" => DASHBOARD_COLUMNS,
        _ => &[],
    }
}

/// Row description for a statement; empty for anything but a known SELECT.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::select_table(sql) {
        Some(table) => fields(format, table_columns(&table)),
        None => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomGridHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomGridQueryParser;

#[async_trait]
impl QueryParser for RoomGridQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomGridHandler {
    type Statement = String;
    type QueryParser = RoomGridQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(&engine, &sql, &portal.result_column_format).await
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// `$N` placeholders outside quoted literals, with their byte ranges.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_literal = !in_literal,
            b'$' if !in_literal => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                    found.push((i..end, n));
                }
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace `$N` placeholders with quoted text values in one left-to-right
/// pass. Bound values are never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|k| params.get(k)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomGridFactory {
    handler: Arc<RoomGridHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPasswordAuth, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomGridFactory {
    pub fn new(orgs: Arc<OrgManager>, password: String) -> Self {
        Self {
            handler: Arc::new(RoomGridHandler::new(orgs)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuth::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomGridFactory {
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
    orgs: Arc<OrgManager>,
    password: String,
) -> io::Result<()> {
    let factory = RoomGridFactory::new(orgs, password);
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotUnavailable(_) => "23P01",
        EngineError::RequesterNotEligible(_) | EngineError::Forbidden(_) => "42501",
        EngineError::InvalidTransition { .. } | EngineError::InvalidAccountTransition { .. } => {
            "55000"
        }
        EngineError::HasActiveReservations(_) => "55006",
        EngineError::UnknownLocation(_) | EngineError::LocationInUse(_) => "23503",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
