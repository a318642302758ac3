use std::fmt::Debug;
use std::io;
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

use crate::allocator::{AllocationError, AllocationPolicy, SlotAllocator};
use crate::auth::SlotlineAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct SlotlineHandler {
    engine: Arc<Engine>,
    allocator: SlotAllocator<Engine>,
    default_slot_minutes: u32,
    query_parser: Arc<SlotlineQueryParser>,
}

impl SlotlineHandler {
    pub fn new(allocator: SlotAllocator<Engine>, default_slot_minutes: u32) -> Self {
        Self {
            engine: allocator.store().clone(),
            allocator,
            default_slot_minutes,
            query_parser: Arc::new(SlotlineQueryParser),
        }
    }

    /// Parse, execute and record query metrics. Result columns are encoded
    /// in `format`.
    async fn run(&self, query: &str, format: &Format) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertScope {
                id,
                kind,
                capacity,
                starts_at,
                slot_minutes,
                name,
            } => {
                let slot_minutes = slot_minutes.unwrap_or(self.default_slot_minutes);
                engine
                    .create_scope(id, kind, name, capacity, starts_at, slot_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteScope { id } => {
                engine.delete_scope(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBreak { id, scope_id, start, end } => {
                if start >= end {
                    return Err(engine_err(EngineError::Invalid(
                        "break must end after it starts".into(),
                    )));
                }
                engine
                    .add_break(id, scope_id, Span::new(start, end))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBreak { id } => {
                engine.remove_break(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                scope_id,
                details,
                policy,
            } => {
                let scope = engine.scope(scope_id).await.map_err(engine_err)?;
                let policy = policy.unwrap_or_else(|| AllocationPolicy::default_for(scope.kind));
                let booking = self
                    .allocator
                    .allocate(&scope, details, policy)
                    .await
                    .map_err(allocation_err)?;
                booking_rows(vec![booking], format)
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::UpdatePayment { booking_id, status } => {
                engine
                    .set_payment_status(booking_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectScopes { id } => {
                let scopes = match id {
                    Some(id) => vec![engine.scope(id).await.map_err(engine_err)?],
                    None => engine.list_scopes().await,
                };
                scope_rows(scopes, format)
            }
            Command::SelectBookings { scope_id, device_id } => {
                let bookings = engine
                    .list_bookings(scope_id, device_id.as_deref())
                    .await
                    .map_err(engine_err)?;
                booking_rows(bookings, format)
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                booking_rows(vec![booking], format)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

const SCOPE_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("kind", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("capacity", Type::INT8),
    ("filled", Type::INT8),
    ("starts_at", Type::INT8),
    ("slot_minutes", Type::INT8),
    ("breaks", Type::INT8),
];

const BOOKING_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("scope_id", Type::VARCHAR),
    ("slot_number", Type::INT8),
    ("approximate_time", Type::INT8),
    ("performer_name", Type::VARCHAR),
    ("performance_type", Type::VARCHAR),
    ("payment_method", Type::VARCHAR),
    ("payment_status", Type::VARCHAR),
    ("device_id", Type::VARCHAR),
    ("song_info", Type::VARCHAR),
    ("wants_video", Type::BOOL),
    ("created_at", Type::INT8),
];

/// Extended-protocol clients may ask for binary columns; the encoder
/// follows each field's declared format.
fn schema(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn scope_rows(scopes: Vec<Scope>, format: &Format) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(schema(SCOPE_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = scopes
        .into_iter()
        .map(|sc| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&sc.id.to_string())?;
            encoder.encode_field(&sc.kind.to_string())?;
            encoder.encode_field(&sc.name)?;
            encoder.encode_field(&i64::from(sc.capacity))?;
            encoder.encode_field(&i64::from(sc.filled))?;
            encoder.encode_field(&sc.starts_at)?;
            encoder.encode_field(&i64::from(sc.slot_minutes))?;
            encoder.encode_field(&(sc.breaks.len() as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

fn booking_rows(bookings: Vec<Booking>, format: &Format) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(schema(BOOKING_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.scope_id.to_string())?;
            encoder.encode_field(&i64::from(b.slot_number))?;
            encoder.encode_field(&b.approximate_time)?;
            encoder.encode_field(&b.details.performer_name)?;
            encoder.encode_field(&b.details.performance_type.to_string())?;
            encoder.encode_field(&b.details.payment_method.to_string())?;
            encoder.encode_field(&b.details.payment_status.to_string())?;
            encoder.encode_field(&b.details.device_id)?;
            encoder.encode_field(&b.details.song_info)?;
            encoder.encode_field(&b.details.wants_video)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

/// Row shape of a statement, guessed from its text before it runs.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") && upper.contains("SCOPES") {
        schema(SCOPE_COLUMNS, format)
    } else if (upper.starts_with("SELECT") || upper.starts_with("INSERT")) && upper.contains("BOOKINGS") {
        schema(BOOKING_COLUMNS, format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotlineHandler {
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
        self.run(query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotlineQueryParser;

#[async_trait]
impl QueryParser for SlotlineQueryParser {
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
impl ExtendedQueryHandler for SlotlineHandler {
    type Statement = String;
    type QueryParser = SlotlineQueryParser;

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
        let sql = inline_params(&portal.statement.statement, &portal.parameters);
        let mut responses = self.run(&sql, &portal.result_column_format).await?;
        Ok(responses.remove(0))
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

/// Highest `$N` placeholder in the SQL string.
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
                && let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
        } else {
            i += 1;
        }
    }
    max
}

/// Replace each `$N` with parameter N as a quoted literal, in a single
/// left-to-right pass. Inserted text is never rescanned, so a value
/// containing `$1` or quotes stays inside its literal. Out-of-range
/// placeholders are left as written.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let dollar = i;
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let param = sql[start..i]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        let Some(param) = param else { continue };
        out.push_str(&sql[copied..dollar]);
        match param {
            Some(value) => {
                let raw: &[u8] = value.as_ref();
                let text = String::from_utf8_lossy(raw);
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = i;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotlineFactory {
    handler: Arc<SlotlineHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotlineAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotlineFactory {
    pub fn new(allocator: SlotAllocator<Engine>, default_slot_minutes: u32, password: String) -> Self {
        let auth_source = SlotlineAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotlineHandler::new(allocator, default_slot_minutes)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotlineFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<SlotlineFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each allocation outcome a client must tell apart.
pub fn allocation_sqlstate(e: &AllocationError) -> &'static str {
    match e {
        AllocationError::ScopeFull { .. } => "53400",
        AllocationError::Contention { .. } => "40001",
        AllocationError::Storage(_) => "58000",
    }
}

fn allocation_err(e: AllocationError) -> PgWireError {
    user_error(allocation_sqlstate(&e), format!("{e}. {}", e.user_message()))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error("P0001", e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
