use std::fmt::Debug;
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

use crate::auth::SeatdAuthSource;
use crate::engine::{Engine, EngineError, now_ms};
use crate::model::*;
use crate::observability as obs;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct SeatdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SeatdQueryParser>,
}

impl SeatdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SeatdQueryParser),
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

    /// Parse, run and record metrics for one statement.
    async fn run_sql(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = obs::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(obs::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(obs::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertTrip { id, name, total_seats } => {
                engine
                    .create_trip(id, name, total_seats)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteTrip { id } => {
                engine.delete_trip(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectTrips { id } => {
                let trips = match id {
                    Some(id) => vec![engine.trip_info(id).await.map_err(engine_err)?],
                    None => engine.list_trips().await,
                };
                trip_rows(&trips)
            }
            Command::InsertHold {
                trip_id,
                seats,
                holder_token,
                ttl_seconds,
            } => {
                let hold = engine
                    .acquire(trip_id, seats, holder_token, ttl_ms(ttl_seconds)?)
                    .await
                    .map_err(engine_err)?;
                hold_rows(&[HoldStatus::observe(&hold, now_ms())])
            }
            Command::UpdateHold {
                id,
                holder_token,
                seats,
                ttl_seconds,
            } => {
                let hold = engine
                    .extend(id, &holder_token, seats, ttl_ms(ttl_seconds)?)
                    .await
                    .map_err(engine_err)?;
                hold_rows(&[HoldStatus::observe(&hold, now_ms())])
            }
            Command::DeleteHold { id, holder_token } => {
                engine.release(id, &holder_token).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectHold { id } => {
                let status = engine.peek(id).await.map_err(engine_err)?;
                hold_rows(&[status])
            }
            Command::SelectHolds { trip_id } => {
                let holds = engine.get_holds(trip_id).await.map_err(engine_err)?;
                hold_rows(&holds)
            }
            Command::InsertBooking {
                hold_id,
                holder_token,
                payload,
            } => {
                let outcome = engine
                    .finalize(hold_id, &holder_token, payload)
                    .await
                    .map_err(engine_err)?;
                booking_rows(&[outcome.booking], Some(outcome.replayed))
            }
            Command::SelectBookings { trip_id } => {
                let bookings = engine.get_bookings(trip_id).await.map_err(engine_err)?;
                booking_rows(&bookings, None)
            }
            Command::DeleteBooking { id, holder_token } => {
                engine.cancel_booking(id, &holder_token).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

fn ttl_ms(ttl_seconds: Option<i64>) -> PgWireResult<Option<Ms>> {
    ttl_seconds
        .map(|s| {
            s.checked_mul(1000)
                .ok_or_else(|| engine_err(EngineError::LimitExceeded("ttl too long")))
        })
        .transpose()
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn trip_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("total_seats", Type::INT8),
        text_field("available_seats", Type::INT8),
        text_field("held_seats", Type::INT8),
        text_field("booked_seats", Type::INT8),
    ]
}

fn hold_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("trip_id", Type::VARCHAR),
        text_field("seats", Type::INT8),
        text_field("state", Type::VARCHAR),
        text_field("expires_at", Type::INT8),
        text_field("seconds_remaining", Type::INT8),
    ]
}

fn booking_schema(with_replayed: bool) -> Vec<FieldInfo> {
    let mut fields = vec![
        text_field("id", Type::VARCHAR),
        text_field("trip_id", Type::VARCHAR),
        text_field("hold_id", Type::VARCHAR),
        text_field("seats", Type::INT8),
        text_field("created_at", Type::INT8),
        text_field("payload", Type::VARCHAR),
    ];
    if with_replayed {
        fields.push(text_field("replayed", Type::BOOL));
    }
    fields
}

fn trip_rows(trips: &[TripInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(trip_schema());
    let rows: Vec<PgWireResult<_>> = trips
        .iter()
        .map(|t| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&t.id.to_string())?;
            encoder.encode_field(&t.name)?;
            encoder.encode_field(&(t.total_seats as i64))?;
            encoder.encode_field(&(t.available_seats as i64))?;
            encoder.encode_field(&(t.held_seats as i64))?;
            encoder.encode_field(&(t.booked_seats as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn hold_rows(holds: &[HoldStatus]) -> PgWireResult<Response> {
    let schema = Arc::new(hold_schema());
    let rows: Vec<PgWireResult<_>> = holds
        .iter()
        .map(|h| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&h.id.to_string())?;
            encoder.encode_field(&h.trip_id.to_string())?;
            encoder.encode_field(&(h.seats as i64))?;
            encoder.encode_field(&h.state.to_string())?;
            encoder.encode_field(&h.expires_at)?;
            encoder.encode_field(&h.seconds_remaining)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: &[Booking], replayed: Option<bool>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema(replayed.is_some()));
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.trip_id.to_string())?;
            encoder.encode_field(&b.hold_id.to_string())?;
            encoder.encode_field(&(b.seats as i64))?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.payload)?;
            if let Some(replayed) = replayed {
                encoder.encode_field(&replayed)?;
            }
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns a statement will produce, worked out from its text alone
/// since bound parameters are not known at describe time.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if normalized.starts_with("SELECT") {
        if normalized.contains("FROM TRIPS") {
            trip_schema()
        } else if normalized.contains("FROM HOLDS") {
            hold_schema()
        } else if normalized.contains("FROM BOOKINGS") {
            booking_schema(false)
        } else {
            vec![]
        }
    } else if normalized.starts_with("INSERT INTO HOLDS") || normalized.starts_with("UPDATE HOLDS") {
        hold_schema()
    } else if normalized.starts_with("INSERT INTO BOOKINGS") {
        booking_schema(true)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SeatdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run_sql(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SeatdQueryParser;

#[async_trait]
impl QueryParser for SeatdQueryParser {
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
impl ExtendedQueryHandler for SeatdHandler {
    type Statement = String;
    type QueryParser = SeatdQueryParser;

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
        let sql = substitute_params(portal);
        self.run_sql(&engine, &sql).await
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
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 never clobbers the prefix of $10.
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

pub struct SeatdFactory {
    handler: Arc<SeatdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SeatdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SeatdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SeatdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SeatdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SeatdFactory {
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
) -> std::io::Result<()> {
    let factory = Arc::new(SeatdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for each engine failure. Clients branch on these codes.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InsufficientInventory { .. } => "53400",
        // A foreign holder learns nothing beyond "not found".
        EngineError::HoldNotFound(_) | EngineError::HoldForbidden(_) => "02000",
        EngineError::HoldExpired(_) => "55000",
        EngineError::HoldAlreadyConsumed(_) => "23505",
        EngineError::Conflict(_) => "40001",
        EngineError::TripNotFound(_) | EngineError::BookingNotFound(_) => "02000",
        EngineError::TripExists(_) => "23505",
        EngineError::TripInUse(_) => "55006",
        EngineError::LimitExceeded(_) | EngineError::InvalidArgument(_) => "22023",
        EngineError::InvalidPayload(_) => "22P02",
        EngineError::WalError(_) => "58030",
    }
}

fn error_message(e: &EngineError) -> String {
    match e {
        EngineError::HoldForbidden(id) => EngineError::HoldNotFound(*id).to_string(),
        other => other.to_string(),
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        error_message(&e),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn forbidden_reads_as_not_found() {
        let id = Ulid::new();
        let forbidden = sqlstate(&EngineError::HoldForbidden(id));
        let missing = sqlstate(&EngineError::HoldNotFound(id));
        assert_eq!(forbidden, missing);
        assert_eq!(
            error_message(&EngineError::HoldForbidden(id)),
            error_message(&EngineError::HoldNotFound(id))
        );
    }

    #[test]
    fn distinct_states_for_client_branching() {
        let id = Ulid::new();
        assert_eq!(
            sqlstate(&EngineError::InsufficientInventory { requested: 2, available: 1 }),
            "53400"
        );
        assert_eq!(sqlstate(&EngineError::HoldExpired(id)), "55000");
        assert_eq!(sqlstate(&EngineError::HoldAlreadyConsumed(id)), "23505");
        assert_eq!(sqlstate(&EngineError::Conflict(id)), "40001");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM holds WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO holds (trip_id, seats, holder_token) VALUES ($1, $3, $2)"),
            3
        );
        assert_eq!(count_params("SELECT * FROM trips"), 0);
    }

    #[test]
    fn schema_follows_statement() {
        assert_eq!(result_schema("select *\n  from trips").len(), 6);
        assert_eq!(result_schema("SELECT * FROM holds WHERE trip_id = $1").len(), 6);
        assert_eq!(result_schema("INSERT INTO bookings (hold_id, holder_token) VALUES ($1, $2)").len(), 7);
        assert_eq!(result_schema("UPDATE holds SET ttl_seconds = 60 WHERE id = $1 AND holder_token = $2").len(), 6);
        assert!(result_schema("DELETE FROM holds WHERE id = $1 AND holder_token = $2").is_empty());
    }

    #[test]
    fn ttl_seconds_scaled() {
        assert_eq!(ttl_ms(None).unwrap(), None);
        assert_eq!(ttl_ms(Some(90)).unwrap(), Some(90_000));
        assert!(ttl_ms(Some(i64::MAX)).is_err());
    }
}
