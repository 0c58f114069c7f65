use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, RowShape, SqlError};
use crate::time;

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Parse, validate and run one statement, recording query metrics.
    async fn run(&self, sql: &str, format: Option<&Format>) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        sql::validate(&cmd, time::now_ms()).map_err(sql_err)?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command, format: Option<&Format>) -> PgWireResult<Response> {
        let schema = Arc::new(schema_for(cmd.row_shape(), format));
        let engine = &self.engine;

        let rows: Vec<PgWireResult<DataRow>> = match cmd {
            Command::InsertDoctor {
                name,
                specialization,
                contact_email,
                slot_minutes,
            } => {
                let doctor = engine
                    .create_doctor(name, specialization, contact_email, slot_minutes)
                    .await
                    .map_err(engine_err)?;
                vec![encode_doctor(&schema, &doctor)]
            }
            Command::SelectDoctors { specialization } => engine
                .list_doctors(specialization.as_deref())
                .await
                .map_err(engine_err)?
                .iter()
                .map(|d| encode_doctor(&schema, d))
                .collect(),
            Command::SelectDoctor { id } => {
                let doctor = engine.get_doctor(id).await.map_err(engine_err)?;
                vec![encode_doctor(&schema, &doctor)]
            }
            Command::InsertAppointment {
                doctor_id,
                patient_name,
                start,
            } => {
                let appointment = engine
                    .book(doctor_id, patient_name, start)
                    .await
                    .map_err(engine_err)?;
                vec![encode_appointment(&schema, &appointment)]
            }
            Command::DeleteAppointment { id } => {
                let appointment = engine.cancel(id).await.map_err(engine_err)?;
                vec![encode_appointment(&schema, &appointment)]
            }
            Command::SelectAppointment { id } => {
                let appointment = engine.get_appointment(id).await.map_err(engine_err)?;
                vec![encode_appointment(&schema, &appointment)]
            }
            Command::SelectAvailability { doctor_id, day } => {
                let slots = engine
                    .availability_spans(doctor_id, day)
                    .await
                    .map_err(engine_err)?;
                let did_str = doctor_id.to_string();
                slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&did_str)?;
                        encoder.encode_field(&time::format_ms(slot.start))?;
                        encoder.encode_field(&time::format_ms(slot.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect()
            }
        };

        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn column(name: &str, ty: Type, idx: usize, format: Option<&Format>) -> FieldInfo {
    let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(idx));
    FieldInfo::new(name.into(), None, None, ty, field_format)
}

fn schema_for(shape: RowShape, format: Option<&Format>) -> Vec<FieldInfo> {
    let columns: Vec<(&str, Type)> = match shape {
        RowShape::Doctor => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("specialization", Type::VARCHAR),
            ("contact_email", Type::VARCHAR),
            ("slot_minutes", Type::INT8),
        ],
        RowShape::Appointment => vec![
            ("id", Type::VARCHAR),
            ("doctor_id", Type::VARCHAR),
            ("patient_name", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("version", Type::INT8),
        ],
        RowShape::Availability => vec![
            ("doctor_id", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
        ],
    };
    columns
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| column(name, ty, idx, format))
        .collect()
}

fn encode_doctor(schema: &Arc<Vec<FieldInfo>>, d: &Doctor) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&d.id.to_string())?;
    encoder.encode_field(&d.name)?;
    encoder.encode_field(&d.specialization)?;
    encoder.encode_field(&d.contact_email)?;
    encoder.encode_field(&i64::from(d.slot_minutes))?;
    Ok(encoder.take_row())
}

fn encode_appointment(schema: &Arc<Vec<FieldInfo>>, a: &Appointment) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.doctor_id.to_string())?;
    encoder.encode_field(&a.patient_name)?;
    encoder.encode_field(&time::format_ms(a.span.start))?;
    encoder.encode_field(&time::format_ms(a.span.end))?;
    encoder.encode_field(&a.status.to_string())?;
    encoder.encode_field(&i64::try_from(a.version).unwrap_or(i64::MAX))?;
    Ok(encoder.take_row())
}

/// Result columns for a statement that may still carry `$n` placeholders.
fn describe_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    sql::row_shape(sql).map_or_else(Vec::new, |shape| schema_for(shape, format))
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        Ok(vec![self.run(query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        Ok(describe_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let sql = substitute_params(portal);
        self.run(&sql, Some(&portal.result_column_format)).await
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
            describe_schema(&target.statement, None),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// `$N` placeholders outside quoted literals, as `(byte range, N)`.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            // A doubled quote is an escaped quote, so the second one reopens.
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => {
                quote = Some(b);
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_values(&portal.statement.statement, &values)
}

/// One pass over the statement text; substituted values are never rescanned.
/// A placeholder with no bound value is left as written.
fn substitute_values(sql: &str, values: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(value) = n.checked_sub(1).and_then(|idx| values.get(idx)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match value {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    /// Every startup is accepted without a password.
    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(engine));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Conflict(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Invalid(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::Store(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Store(inner) = &e {
        tracing::error!("store failure: {inner}");
    } else {
        debug!("request rejected: {e}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Invalid(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
