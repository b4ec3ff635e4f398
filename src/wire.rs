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
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tokio::net::TcpStream;

use crate::auth::SharedPasswordSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;
use crate::working_plan;

pub struct EasySlotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<EasySlotQueryParser>,
}

impl EasySlotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(EasySlotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Execute one command and record its latency and outcome.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertProvider { id, name } => {
                engine.create_provider(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteProvider { id } => {
                engine.delete_provider(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SetWorkingPlan { provider_id, plan_json } => {
                engine
                    .set_working_plan_json(provider_id, &plan_json)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpsertOverrides { overrides } => {
                let count = overrides.len();
                engine.upsert_overrides(overrides).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteOverride { provider_id, date } => {
                let removed = engine.remove_override(provider_id, date).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(usize::from(removed))))
            }
            Command::InsertAppointments { mut appointments } => {
                let count = appointments.len();
                if count == 1 {
                    let appointment = appointments.remove(0);
                    engine.record_appointment(appointment).await.map_err(engine_err)?;
                } else {
                    engine.record_appointments(appointments).await.map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteAppointment { id } => {
                engine.cancel_appointment(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectProviders => {
                let providers = engine.list_providers().await;
                let schema = Arc::new(providers_schema());
                let rows: Vec<PgWireResult<_>> = providers
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.name)?;
                        encoder.encode_field(&(p.override_count as i64))?;
                        encoder.encode_field(&(p.appointment_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectWorkingPlan { provider_id } => {
                let plan = engine.get_working_plan(provider_id).await.map_err(engine_err)?;
                let schema = Arc::new(working_plan_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&provider_id.to_string())?;
                encoder.encode_field(&working_plan::to_json(&plan))?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectOverrides { provider_id } => {
                let overrides = engine.list_overrides(provider_id).await;
                let schema = Arc::new(overrides_schema());
                let rows: Vec<PgWireResult<_>> = overrides
                    .into_iter()
                    .map(|o| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&o.provider_id.to_string())?;
                        encoder.encode_field(&o.date.to_string())?;
                        encoder.encode_field(&format_clock(o.start))?;
                        encoder.encode_field(&format_clock(o.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAppointments { provider_id } => {
                let appointments = engine.list_appointments(provider_id).await;
                let schema = Arc::new(appointments_schema());
                let rows: Vec<PgWireResult<_>> = appointments
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.appointment_id.to_string())?;
                        encoder.encode_field(&a.provider_id.to_string())?;
                        encoder.encode_field(&format_datetime(&a.start))?;
                        encoder.encode_field(&format_datetime(&a.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSlots {
                provider_id,
                date,
                duration,
                granularity,
                buffer_before,
                buffer_after,
            } => {
                let defaults_only =
                    granularity.is_none() && buffer_before.is_none() && buffer_after.is_none();
                let config = if defaults_only {
                    None
                } else {
                    let base = engine.slot_config();
                    Some(SlotConfig {
                        granularity: granularity.unwrap_or(base.granularity),
                        buffer_before: buffer_before.unwrap_or(base.buffer_before),
                        buffer_after: buffer_after.unwrap_or(base.buffer_after),
                    })
                };
                let slots = engine
                    .compute_slots(provider_id, date, duration, config)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let pid = provider_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&pid)?;
                        encoder.encode_field(&format_datetime(&slot.start))?;
                        encoder.encode_field(&format_datetime(&slot.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailableDates {
                provider_id,
                from,
                to,
                duration,
            } => {
                let dates = engine
                    .available_dates(provider_id, from, to, duration)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(available_dates_schema());
                let pid = provider_id.to_string();
                let rows: Vec<PgWireResult<_>> = dates
                    .into_iter()
                    .map(|date| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&pid)?;
                        encoder.encode_field(&date.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result schemas ──────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn providers_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int_field("override_count"),
        int_field("appointment_count"),
    ]
}

fn working_plan_schema() -> Vec<FieldInfo> {
    vec![text_field("provider_id"), text_field("plan")]
}

fn overrides_schema() -> Vec<FieldInfo> {
    vec![
        text_field("provider_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("provider_id"),
        text_field("start"),
        text_field("end"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("provider_id"), text_field("start"), text_field("end")]
}

fn available_dates_schema() -> Vec<FieldInfo> {
    vec![text_field("provider_id"), text_field("date")]
}

/// Columns a statement returns; empty for anything but a known SELECT.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let Ok(stmts) = Parser::parse_sql(&PostgreSqlDialect {}, sql) else {
        return vec![];
    };
    let Some(Statement::Query(query)) = stmts.first() else {
        return vec![];
    };
    match sql::select_table(query).as_deref() {
        Ok("providers") => providers_schema(),
        Ok("working_plans") => working_plan_schema(),
        Ok("overrides") => overrides_schema(),
        Ok("appointments") => appointments_schema(),
        Ok("slots") => slots_schema(),
        Ok("available_dates") => available_dates_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for EasySlotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct EasySlotQueryParser;

#[async_trait]
impl QueryParser for EasySlotQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for EasySlotHandler {
    type Statement = String;
    type QueryParser = EasySlotQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder outside string literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    scan_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Replace `$N` placeholders with the bound text parameters as quoted
/// literals. Placeholders without a bound value are left as written.
fn substitute_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    scan_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
}

/// Single pass over `sql`, offering each `$N` to `replace`. Text inside
/// single quotes is copied untouched.
fn scan_placeholders(sql: &str, mut replace: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek()
            && d.is_ascii_digit()
        {
            end = j + 1;
            chars.next();
        }
        let written = &sql[i..end];
        match sql[start..end].parse::<usize>().ok().and_then(&mut replace) {
            Some(value) => out.push_str(&value),
            None => out.push_str(written),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

type AuthHandler =
    CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>;

pub struct EasySlotFactory {
    handler: Arc<EasySlotHandler>,
    auth_handler: Arc<AuthHandler>,
    noop: Arc<NoopHandler>,
}

impl EasySlotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(EasySlotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for EasySlotFactory {
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
    let factory = EasySlotFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), "P0001".into(), e.to_string())))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), "42601".into(), e.to_string())))
}
