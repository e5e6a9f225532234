use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tokio::net::TcpStream;

use crate::engine::{EngineError, ReservationEngine};
use crate::limits::*;
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::schedule::{OpenDay, SchedulingService};
use crate::sql::{self, Command, Participant, RowShape, SqlError};

pub struct TutorSlotHandler {
    engine: ReservationEngine,
    schedule: SchedulingService,
    query_parser: Arc<TutorSlotQueryParser>,
}

impl TutorSlotHandler {
    pub fn new(engine: ReservationEngine) -> Self {
        Self {
            schedule: SchedulingService::new(engine.clone()),
            engine,
            query_parser: Arc::new(TutorSlotQueryParser),
        }
    }

    async fn run_sql(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertWindows { windows } => {
                if windows.len() > MAX_BATCH_SIZE {
                    return Err(engine_err(EngineError::LimitExceeded("too many rows in one INSERT")));
                }
                // Row by row: rows before a failing one stay published.
                let count = windows.len();
                for row in windows {
                    self.engine
                        .publish_window(row.id, &row.owner_id, row.start, row.end)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteWindow { id } => {
                self.engine.withdraw_window(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Claim {
                window_id,
                student_id,
                returning,
            } => {
                let booking = self
                    .engine
                    .claim(window_id, &student_id)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    bookings_response(vec![booking])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectWindows {
                owner_id,
                held,
                start,
                end,
            } => {
                let windows = match (held, start, end) {
                    (Some(false), None, None) => self.engine.open_windows(&owner_id).await,
                    _ => self
                        .engine
                        .windows_in_range(
                            &owner_id,
                            start.unwrap_or(MIN_VALID_TIMESTAMP_MS),
                            end.unwrap_or(MAX_VALID_TIMESTAMP_MS),
                        )
                        .await
                        .map(|mut ws| {
                            if let Some(held) = held {
                                ws.retain(|w| w.held == held);
                            }
                            ws
                        }),
                }
                .map_err(engine_err)?;
                windows_response(windows)
            }
            Command::SelectOpenWindows { query } => {
                let windows = self
                    .schedule
                    .open_windows_in_month(&query.owner_id, query.year, query.month, query.utc_offset_minutes)
                    .await
                    .map_err(engine_err)?;
                windows_response(windows)
            }
            Command::SelectOpenDays { query } => {
                let days = self
                    .schedule
                    .open_days(&query.owner_id, query.year, query.month, query.utc_offset_minutes)
                    .await
                    .map_err(engine_err)?;
                open_days_response(days)
            }
            Command::SelectBookings { participant } => {
                let bookings = match participant {
                    Participant::Student(id) => self.engine.bookings_for_student(&id).await,
                    Participant::Tutor(id) => self.engine.bookings_for_tutor(&id).await,
                }
                .map_err(engine_err)?;
                bookings_response(bookings)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn windows_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("owner_id"),
        int8("start"),
        int8("end"),
        FieldInfo::new("held".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("window_id"),
        varchar("student_id"),
        varchar("tutor_id"),
        int8("start"),
        int8("end"),
        int8("booked_at"),
    ]
}

fn open_days_schema() -> Vec<FieldInfo> {
    vec![varchar("date"), int8("open_windows")]
}

fn schema_for(shape: Option<RowShape>) -> Vec<FieldInfo> {
    match shape {
        Some(RowShape::Windows) => windows_schema(),
        Some(RowShape::Bookings) => bookings_schema(),
        Some(RowShape::OpenDays) => open_days_schema(),
        None => vec![],
    }
}

fn windows_response(windows: Vec<AvailabilityWindow>) -> PgWireResult<Response> {
    let schema = Arc::new(windows_schema());
    let rows: Vec<PgWireResult<_>> = windows
        .into_iter()
        .map(|w| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&w.id.to_string())?;
            encoder.encode_field(&w.owner_id)?;
            encoder.encode_field(&w.span.start)?;
            encoder.encode_field(&w.span.end)?;
            encoder.encode_field(&w.held)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn bookings_response(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.window_id.to_string())?;
            encoder.encode_field(&b.student_id)?;
            encoder.encode_field(&b.tutor_id)?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.booked_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn open_days_response(days: Vec<OpenDay>) -> PgWireResult<Response> {
    let schema = Arc::new(open_days_schema());
    let rows: Vec<PgWireResult<_>> = days
        .into_iter()
        .map(|d| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&d.date.to_string())?;
            encoder.encode_field(&(d.open_windows as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for TutorSlotHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run_sql(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TutorSlotQueryParser;

#[async_trait]
impl QueryParser for TutorSlotQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(sql::row_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TutorSlotHandler {
    type Statement = String;
    type QueryParser = TutorSlotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run_sql(&sql).await
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
            schema_for(sql::row_shape(&target.statement)),
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
        Ok(DescribePortalResponse::new(schema_for(sql::row_shape(
            &target.statement.statement,
        ))))
    }
}

/// Byte range and 1-based index of every `$n` placeholder outside quoted
/// literals.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((at, c)) = chars.next() {
        match c {
            '\'' => in_literal = !in_literal,
            '$' if !in_literal => {
                let mut end = at + 1;
                while let Some(&(i, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = i + 1;
                    chars.next();
                }
                if let Ok(n) = sql[at + 1..end].parse::<usize>() {
                    found.push((at..end, n));
                }
            }
            _ => {}
        }
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound text-format parameters as quoted literals. Unbound or
/// NULL parameters become `NULL`.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (span, n) in placeholders(sql) {
        out.push_str(&sql[copied..span.start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes).replace('\'', "''"));
                out.push('\'');
            }
            _ => out.push_str("NULL"),
        }
        copied = span.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every login.
#[derive(Debug)]
pub struct SharedPasswordSource {
    password: String,
}

#[async_trait]
impl AuthSource for SharedPasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TutorSlotFactory {
    handler: Arc<TutorSlotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TutorSlotFactory {
    pub fn new(engine: ReservationEngine, password: String) -> Self {
        let auth_source = SharedPasswordSource { password };
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TutorSlotHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TutorSlotFactory {
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
    factory: Arc<TutorSlotFactory>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine outcome.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyBooked(_) => "23505",
        EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::PersistenceFailure { .. } => "58030",
        EngineError::Storage(_) => "08006",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_domain() {
        tracing::error!("engine fault: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
