use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::noop::NoopStartupHandler;
use pgwire::api::auth::StartupHandler;
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
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::time::format_ms;

/// Serve one client connection until it disconnects.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, None, MeetdFactory::new(engine)).await
}

pub struct MeetdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<MeetdQueryParser>,
}

impl MeetdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(MeetdQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.dispatch(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser {
                name,
                email,
                returning,
            } => {
                let user = engine.create_user(&name, &email).await.map_err(engine_err)?;
                if returning {
                    user_rows(vec![user])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectUsers { id: Some(id) } => {
                let user = engine.get_user(id).await.map_err(engine_err)?;
                user_rows(vec![user])
            }
            Command::SelectUsers { id: None } => user_rows(engine.list_users().await),
            Command::InsertMeeting {
                user_id,
                title,
                description,
                start,
                end,
                returning,
            } => {
                let record = engine
                    .create_meeting(user_id, &title, description, start, end)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    meeting_rows(vec![record])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectMeetings { id: Some(id), filter } => {
                let record = engine.get_meeting(id).await.map_err(engine_err)?;
                let rows = if matches_filter(&record, &filter) {
                    vec![record]
                } else {
                    vec![]
                };
                meeting_rows(rows)
            }
            Command::SelectMeetings { id: None, filter } => {
                meeting_rows(engine.list_meetings(filter).await)
            }
            Command::UpdateMeeting {
                id,
                patch,
                returning,
            } => {
                let record = engine.update_meeting(id, patch).await.map_err(engine_err)?;
                if returning {
                    meeting_rows(vec![record])
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
                }
            }
            Command::DeleteMeeting { id } => {
                engine.delete_meeting(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

fn matches_filter(record: &MeetingRecord, filter: &MeetingFilter) -> bool {
    filter.user_id.is_none_or(|u| u == record.user_id)
        && filter.start_date.is_none_or(|s| record.start >= s)
        && filter.end_date.is_none_or(|e| record.end <= e)
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn users_schema() -> Vec<FieldInfo> {
    ["id", "name", "email", "created_at"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn meetings_schema() -> Vec<FieldInfo> {
    [
        "id",
        "user_id",
        "title",
        "description",
        "start_time",
        "end_time",
        "user_name",
        "user_email",
        "created_at",
        "updated_at",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn user_rows(users: Vec<User>) -> PgWireResult<Response> {
    let schema = Arc::new(users_schema());
    let rows: Vec<PgWireResult<_>> = users
        .into_iter()
        .map(|user| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&user.id.to_string())?;
            encoder.encode_field(&user.name)?;
            encoder.encode_field(&user.email)?;
            encoder.encode_field(&format_ms(user.created_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn meeting_rows(records: Vec<MeetingRecord>) -> PgWireResult<Response> {
    let schema = Arc::new(meetings_schema());
    let rows: Vec<PgWireResult<_>> = records
        .into_iter()
        .map(|m| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&m.id.to_string())?;
            encoder.encode_field(&m.user_id.to_string())?;
            encoder.encode_field(&m.title)?;
            encoder.encode_field(&m.description)?;
            encoder.encode_field(&format_ms(m.start))?;
            encoder.encode_field(&format_ms(m.end))?;
            encoder.encode_field(&m.user.name)?;
            encoder.encode_field(&m.user.email)?;
            encoder.encode_field(&format_ms(m.created_at))?;
            encoder.encode_field(&format_ms(m.updated_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Row schema a statement will produce, judged from its text alone since
/// Describe arrives before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == '(' || c == ',' || c == ';')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    let returns_rows = words.first().is_some_and(|w| w == "select")
        || words.iter().any(|w| w == "returning");
    if !returns_rows {
        return vec![];
    }
    let table = words
        .windows(2)
        .find(|pair| matches!(pair[0].as_str(), "from" | "into" | "update"))
        .map(|pair| pair[1].trim_matches('"'));
    match table {
        Some("users") => users_schema(),
        Some("meetings") => meetings_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for MeetdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        debug!(query, "simple query");
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(cmd).await?])
    }
}

#[async_trait]
impl NoopStartupHandler for MeetdHandler {}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MeetdQueryParser;

#[async_trait]
impl QueryParser for MeetdQueryParser {
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
impl ExtendedQueryHandler for MeetdHandler {
    type Statement = String;
    type QueryParser = MeetdQueryParser;

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
        debug!(query = %sql, "extended query");
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(cmd).await
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

/// `$N` placeholders outside single-quoted literals, as byte range and N.
/// A doubled `''` inside a literal closes and reopens it, so it needs no
/// special case.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    found.push((i..end, n));
                }
                i = end;
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

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    bind_params(&portal.statement.statement, &params)
}

/// Replace placeholders with bound values (text format) in one left-to-right
/// pass. Bound text is never rescanned, so a `$1` inside a value stays
/// literal. Placeholders with no bound value are left as written.
fn bind_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
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

pub struct MeetdFactory {
    handler: Arc<MeetdHandler>,
    noop: Arc<NoopHandler>,
}

impl MeetdFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(MeetdHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MeetdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInterval { .. } => "22023",
        EngineError::InvalidDate(_) => "22007",
        EngineError::Validation(_) => "23514",
        EngineError::UserNotFound(_) | EngineError::MeetingNotFound(_) => "P0002",
        EngineError::SlotConflict(_) => "23P01",
        EngineError::DuplicateUser(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    debug!(kind = e.kind(), "query rejected: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    if let SqlError::InvalidDate(msg) = e {
        return engine_err(EngineError::InvalidDate(msg));
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
