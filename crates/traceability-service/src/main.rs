use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use traceability_api::{
    MigrateResult, SchemaStatus, TraceabilityApi, TraceabilityConfig, API_CONTRACT_VERSION,
};
use traceability_core::{
    CustodyEntry, CustodyReport, IntakeCommand, InventoryReport, LabTestCommand, LabTestRecord,
    Lot, LotFilter, LotId, MassBalance, ProcessCommand, Receipt, ShipCommand, SubdivideCommand,
    TraceError,
};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: TraceabilityApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MigrateRequest {
    dry_run: bool,
}

/// Lab test body; the lot comes from the path.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LabTestRequest {
    test_type: String,
    lab_name: String,
    #[serde(default)]
    certificate_number: Option<String>,
    passed: bool,
    #[serde(default)]
    results: BTreeMap<String, String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    occurred_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "traceability-service")]
#[command(about = "Local HTTP service for the lot traceability ledger")]
struct Args {
    /// Overrides `database` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Config file; without it `./traceability.yaml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, error_kind: &'static str, error: String) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error_kind, error }
    }

    fn from_api(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<TraceError>() {
            Some(trace) => Self::new(status_for(trace), trace.kind(), format!("{err:#}")),
            None => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{err:#}")),
        }
    }

    fn rejected(rejection: &JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid_request", rejection.body_text())
    }
}

fn status_for(err: &TraceError) -> StatusCode {
    match err {
        TraceError::LotNotFound { .. }
        | TraceError::UnknownParent { .. }
        | TraceError::UnknownInput { .. } => StatusCode::NOT_FOUND,
        TraceError::DuplicateId { .. }
        | TraceError::InsufficientQuantity { .. }
        | TraceError::OverAllocation { .. } => StatusCode::CONFLICT,
        TraceError::InvalidQuantity { .. }
        | TraceError::InvalidUnit { .. }
        | TraceError::InvalidCategory { .. }
        | TraceError::InvalidCommand(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TraceError::CorruptSnapshot(_) | TraceError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type ApiResponse<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

/// Run one blocking API call off the async workers.
async fn call_api<T, F>(state: ServiceState, call: F) -> ApiResponse<T>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&TraceabilityApi) -> Result<T> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || call(&state.api)).await.map_err(|err| {
        ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("api task failed: {err}"),
        )
    })?;
    match outcome {
        Ok(data) => Ok(Json(envelope(data))),
        Err(err) => {
            let error = ServiceError::from_api(&err);
            if error.status.is_server_error() {
                tracing::error!(error = %error.error, "request failed");
            } else {
                tracing::debug!(error_kind = error.error_kind, "request rejected");
            }
            Err(error)
        }
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload.map(|Json(value)| value).map_err(|rejection| ServiceError::rejected(&rejection))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/lots/intake", post(lots_intake))
        .route("/v1/lots/subdivide", post(lots_subdivide))
        .route("/v1/lots/process", post(lots_process))
        .route("/v1/lots/ship", post(lots_ship))
        .route("/v1/lots/list", post(lots_list))
        .route("/v1/lots/:lot_id", get(lot_show))
        .route("/v1/lots/:lot_id/history", get(lot_history))
        .route("/v1/lots/:lot_id/chain", get(lot_chain))
        .route("/v1/lots/:lot_id/ancestors", get(lot_ancestors))
        .route("/v1/lots/:lot_id/descendants", get(lot_descendants))
        .route("/v1/lots/:lot_id/balance", get(lot_balance))
        .route("/v1/lots/:lot_id/lab-tests", get(lot_lab_tests).post(lot_record_lab_test))
        .route("/v1/reports/inventory", get(reports_inventory))
        .route("/v1/reports/custody", get(reports_custody))
        .with_state(state)
}

fn init_tracing(config_filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = TraceabilityConfig::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.database = db;
    }
    init_tracing(config.log_filter.as_deref());

    let api = TraceabilityApi::from_config(&config);
    let migrated = api.migrate(false)?;
    tracing::info!(
        database = %config.database.display(),
        schema_version = ?migrated.after_version,
        "ledger ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "traceability service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(State(state): State<ServiceState>) -> ApiResponse<SchemaStatus> {
    call_api(state, TraceabilityApi::schema_status).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> ApiResponse<MigrateResult> {
    let request = body(payload)?;
    call_api(state, move |api| api.migrate(request.dry_run)).await
}

async fn lots_intake(
    State(state): State<ServiceState>,
    payload: Result<Json<IntakeCommand>, JsonRejection>,
) -> ApiResponse<Receipt> {
    let command = body(payload)?;
    call_api(state, move |api| api.intake(&command)).await
}

async fn lots_subdivide(
    State(state): State<ServiceState>,
    payload: Result<Json<SubdivideCommand>, JsonRejection>,
) -> ApiResponse<Receipt> {
    let command = body(payload)?;
    call_api(state, move |api| api.subdivide(&command)).await
}

async fn lots_process(
    State(state): State<ServiceState>,
    payload: Result<Json<ProcessCommand>, JsonRejection>,
) -> ApiResponse<Receipt> {
    let command = body(payload)?;
    call_api(state, move |api| api.process(&command)).await
}

async fn lots_ship(
    State(state): State<ServiceState>,
    payload: Result<Json<ShipCommand>, JsonRejection>,
) -> ApiResponse<Receipt> {
    let command = body(payload)?;
    call_api(state, move |api| api.ship(&command)).await
}

async fn lots_list(
    State(state): State<ServiceState>,
    payload: Result<Json<LotFilter>, JsonRejection>,
) -> ApiResponse<Vec<Lot>> {
    let filter = body(payload)?;
    call_api(state, move |api| api.list_lots(&filter)).await
}

async fn lot_show(
    State(state): State<ServiceState>,
    Path(lot_id): Path<String>,
) -> ApiResponse<Lot> {
    call_api(state, move |api| api.get_lot(&LotId::parse(&lot_id)?)).await
}

async fn lot_history(
    State(state): State<ServiceState>,
    Path(lot_id): Path<String>,
) -> ApiResponse<Vec<CustodyEntry>> {
    call_api(state, move |api| api.history_of(&LotId::parse(&lot_id)?)).await
}

async fn lot_chain(
    State(state): State<ServiceState>,
    Path(lot_id): Path<String>,
) -> ApiResponse<Vec<CustodyEntry>> {
    call_api(state, move |api| api.chain_of_custody(&LotId::parse(&lot_id)?)).await
}

async fn lot_ancestors(
    State(state): State<ServiceState>,
    Path(lot_id): Path<String>,
) -> ApiResponse<Vec<Lot>> {
    call_api(state, move |api| api.ancestors_of(&LotId::parse(&lot_id)?)).await
}

async fn lot_descendants(
    State(state): State<ServiceState>,
    Path(lot_id): Path<String>,
) -> ApiResponse<Vec<Lot>> {
    call_api(state, move |api| api.descendants_of(&LotId::parse(&lot_id)?)).await
}

async fn lot_balance(
    State(state): State<ServiceState>,
    Path(lot_id): Path<String>,
) -> ApiResponse<MassBalance> {
    call_api(state, move |api| api.mass_balance(&LotId::parse(&lot_id)?)).await
}

async fn lot_lab_tests(
    State(state): State<ServiceState>,
    Path(lot_id): Path<String>,
) -> ApiResponse<Vec<LabTestRecord>> {
    call_api(state, move |api| api.lab_tests_of(&LotId::parse(&lot_id)?)).await
}

async fn lot_record_lab_test(
    State(state): State<ServiceState>,
    Path(lot_id): Path<String>,
    payload: Result<Json<LabTestRequest>, JsonRejection>,
) -> ApiResponse<LabTestRecord> {
    let request = body(payload)?;
    call_api(state, move |api| {
        api.record_lab_test(&LabTestCommand {
            lot_id: LotId::parse(&lot_id)?,
            test_type: request.test_type,
            lab_name: request.lab_name,
            certificate_number: request.certificate_number,
            passed: request.passed,
            results: request.results,
            notes: request.notes,
            occurred_at: request.occurred_at,
        })
    })
    .await
}

async fn reports_inventory(State(state): State<ServiceState>) -> ApiResponse<InventoryReport> {
    call_api(state, TraceabilityApi::inventory_report).await
}

async fn reports_custody(State(state): State<ServiceState>) -> ApiResponse<CustodyReport> {
    call_api(state, TraceabilityApi::custody_report).await
}
