// Mercato Core - REST API server
// One route per core operation; typed errors map onto HTTP statuses.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;

use mercato_core::{
    justifications, ledger, notifications, sessions, transgressions, watchlist, CoreError,
    CoreResult, InfractionRegistry, RawPresenceRow, ReviewDecision, TriggerPriority,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    catalog: Arc<InfractionRegistry>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

fn status_for(error: &CoreError) -> StatusCode {
    match error {
        CoreError::Conflict { .. } => StatusCode::CONFLICT,
        CoreError::InvalidState { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
        CoreError::Storage(_) | CoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: CoreResult<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(error = %e, "internal error");
            }
            (status, Json(ApiResponse::<T>::err(e.to_string()))).into_response()
        }
    }
}

fn parse_iso_date(value: &str) -> CoreResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| CoreError::validation(format!("invalid date '{value}', expected YYYY-MM-DD")))
}

// ============================================================================
// Concession ledger handlers
// ============================================================================

#[derive(Deserialize)]
struct CreateConcessionRequest {
    stall_id: String,
    holder_id: String,
    valid_from: String,
    kind: String,
}

/// POST /api/concessions
async fn create_concession(
    State(state): State<AppState>,
    Json(request): Json<CreateConcessionRequest>,
) -> Response {
    let mut conn = state.db.lock().unwrap();
    respond(parse_iso_date(&request.valid_from).and_then(|valid_from| {
        ledger::create(
            &mut conn,
            &request.stall_id,
            &request.holder_id,
            valid_from,
            &request.kind,
        )
    }))
}

#[derive(Deserialize)]
struct RenewRequest {
    valid_to: String,
}

/// POST /api/concessions/:id/renew
async fn renew_concession(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenewRequest>,
) -> Response {
    let mut conn = state.db.lock().unwrap();
    respond(
        parse_iso_date(&request.valid_to)
            .and_then(|valid_to| ledger::renew(&mut conn, &id, valid_to)),
    )
}

#[derive(Deserialize)]
struct TransferRequest {
    subentrante_id: String,
    scia_number: Option<String>,
    scia_date: Option<String>,
    balance_transferred: f64,
}

/// POST /api/concessions/:id/transfer
async fn transfer_concession(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TransferRequest>,
) -> Response {
    let mut conn = state.db.lock().unwrap();
    let scia_date = match request.scia_date.as_deref().map(parse_iso_date).transpose() {
        Ok(date) => date,
        Err(e) => return respond::<()>(Err(e)),
    };
    respond(ledger::transfer(
        &mut conn,
        &id,
        &request.subentrante_id,
        ledger::DocumentRefs {
            scia_number: request.scia_number,
            scia_date,
        },
        request.balance_transferred,
    ))
}

#[derive(Deserialize)]
struct TerminateRequest {
    reason: String,
}

/// POST /api/concessions/:id/terminate
async fn terminate_concession(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TerminateRequest>,
) -> Response {
    let mut conn = state.db.lock().unwrap();
    respond(ledger::terminate(&mut conn, &id, &request.reason))
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

/// GET /api/history/stall/:id
async fn stall_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let conn = state.db.lock().unwrap();
    respond(ledger::history(
        &conn,
        ledger::HistoryScope::Stall(&id),
        params.limit.unwrap_or(50),
    ))
}

/// GET /api/history/market/:id
async fn market_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let conn = state.db.lock().unwrap();
    respond(ledger::history(
        &conn,
        ledger::HistoryScope::Market(&id),
        params.limit.unwrap_or(50),
    ))
}

// ============================================================================
// Transgression pipeline handlers
// ============================================================================

#[derive(Deserialize)]
struct DetectRequest {
    stall_id: String,
    business_id: String,
    market_date: String,
    kind: String,
    details: Option<String>,
    entry_time: Option<String>,
}

/// POST /api/transgressions/detect
async fn detect_transgression(
    State(state): State<AppState>,
    Json(request): Json<DetectRequest>,
) -> Response {
    let conn = state.db.lock().unwrap();
    respond(parse_iso_date(&request.market_date).and_then(|market_date| {
        transgressions::detect(
            &conn,
            &request.stall_id,
            &request.business_id,
            market_date,
            &request.kind,
            request.details.as_deref(),
            request.entry_time.as_deref(),
        )
    }))
}

#[derive(Deserialize)]
struct SanctionRequest {
    amount: Option<f64>,
}

/// POST /api/transgressions/:id/sanction
async fn sanction_transgression(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SanctionRequest>,
) -> Response {
    let mut conn = state.db.lock().unwrap();
    respond(transgressions::sanction(
        &mut conn,
        state.catalog.as_ref(),
        &id,
        request.amount,
    ))
}

#[derive(Deserialize)]
struct ArchiveRequest {
    notes: String,
}

/// POST /api/transgressions/:id/archive
async fn archive_transgression(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ArchiveRequest>,
) -> Response {
    let mut conn = state.db.lock().unwrap();
    respond(transgressions::archive(&mut conn, &id, &request.notes))
}

#[derive(Deserialize)]
struct BucketParams {
    bucket: String,
}

/// GET /api/transgressions?bucket=active|controlled|archived
async fn list_transgressions(
    State(state): State<AppState>,
    Query(params): Query<BucketParams>,
) -> Response {
    let conn = state.db.lock().unwrap();
    let bucket = match transgressions::DisplayBucket::from_str(&params.bucket) {
        Some(bucket) => bucket,
        None => {
            return respond::<()>(Err(CoreError::validation(format!(
                "unknown bucket '{}'",
                params.bucket
            ))))
        }
    };
    respond(transgressions::list_by_bucket(&conn, bucket))
}

// ============================================================================
// Session aggregation handlers
// ============================================================================

#[derive(Deserialize)]
struct CloseSessionRequest {
    market_id: String,
    date: String,
    rows: Vec<RawPresenceRow>,
}

/// POST /api/sessions/close
async fn close_session(
    State(state): State<AppState>,
    Json(request): Json<CloseSessionRequest>,
) -> Response {
    let mut conn = state.db.lock().unwrap();
    respond(parse_iso_date(&request.date).and_then(|date| {
        sessions::close_session(&mut conn, &request.market_id, date, &request.rows)
    }))
}

// ============================================================================
// Justification review handlers
// ============================================================================

#[derive(Deserialize)]
struct SubmitJustificationRequest {
    business_id: String,
    market_id: String,
    market_date: String,
    kind: String,
    reason: String,
    file_ref: Option<String>,
    transgression_id: Option<String>,
}

/// POST /api/justifications
async fn submit_justification(
    State(state): State<AppState>,
    Json(request): Json<SubmitJustificationRequest>,
) -> Response {
    let conn = state.db.lock().unwrap();
    respond(parse_iso_date(&request.market_date).and_then(|market_date| {
        justifications::submit(
            &conn,
            &request.business_id,
            &request.market_id,
            market_date,
            &request.kind,
            &request.reason,
            request.file_ref.as_deref(),
            request.transgression_id.as_deref(),
        )
    }))
}

#[derive(Deserialize)]
struct ReviewRequest {
    decision: String,
    notes: Option<String>,
}

/// POST /api/justifications/:id/review
async fn review_justification(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReviewRequest>,
) -> Response {
    let mut conn = state.db.lock().unwrap();
    let decision = match request.decision.as_str() {
        "accept" => ReviewDecision::Accept,
        "reject" => ReviewDecision::Reject,
        other => {
            return respond::<()>(Err(CoreError::validation(format!(
                "unknown decision '{other}', expected 'accept' or 'reject'"
            ))))
        }
    };
    respond(justifications::review(
        &mut conn,
        &id,
        decision,
        request.notes.as_deref(),
    ))
}

/// GET /api/justifications/pending
async fn pending_justifications(State(state): State<AppState>) -> Response {
    let conn = state.db.lock().unwrap();
    respond(justifications::list_pending(&conn))
}

// ============================================================================
// Watchlist handlers
// ============================================================================

#[derive(Deserialize)]
struct RaiseTriggerRequest {
    business_id: String,
    trigger_kind: String,
    description: String,
    priority: String,
}

/// POST /api/watchlist
async fn raise_trigger(
    State(state): State<AppState>,
    Json(request): Json<RaiseTriggerRequest>,
) -> Response {
    let conn = state.db.lock().unwrap();
    respond(watchlist::raise(
        &conn,
        &request.business_id,
        &request.trigger_kind,
        &request.description,
        TriggerPriority::from_str(&request.priority),
    ))
}

/// POST /api/watchlist/:id/resolve
async fn resolve_trigger(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let mut conn = state.db.lock().unwrap();
    respond(watchlist::resolve(&mut conn, &id))
}

/// GET /api/watchlist
async fn open_triggers(State(state): State<AppState>) -> Response {
    let conn = state.db.lock().unwrap();
    respond(watchlist::list_open(&conn))
}

// ============================================================================
// Outbox handler + health
// ============================================================================

/// POST /api/outbox/dispatch - reconcile the digest and drain pending records
async fn dispatch_outbox(State(state): State<AppState>) -> Response {
    let conn = state.db.lock().unwrap();
    let since = chrono::Utc::now().date_naive() - chrono::Duration::days(30);
    respond(notifications::reconcile_digest(&conn, since).and_then(|materialized| {
        let summary =
            notifications::dispatch_pending(&conn, &mercato_core::TracingDispatcher, 5)?;
        Ok(serde_json::json!({
            "materialized": materialized,
            "sent": summary.sent,
            "retried": summary.retried,
            "exhausted": summary.exhausted,
        }))
    }))
}

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let db_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "mercato.db".to_string());
    let conn = mercato_core::open_database(std::path::Path::new(&db_path))?;
    mercato_core::setup_database(&conn)?;

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        catalog: Arc::new(InfractionRegistry::with_standard_table()),
    };

    let app = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/concessions", post(create_concession))
        .route("/api/concessions/:id/renew", post(renew_concession))
        .route("/api/concessions/:id/transfer", post(transfer_concession))
        .route("/api/concessions/:id/terminate", post(terminate_concession))
        .route("/api/history/stall/:id", get(stall_history))
        .route("/api/history/market/:id", get(market_history))
        .route("/api/transgressions", get(list_transgressions))
        .route("/api/transgressions/detect", post(detect_transgression))
        .route("/api/transgressions/:id/sanction", post(sanction_transgression))
        .route("/api/transgressions/:id/archive", post(archive_transgression))
        .route("/api/sessions/close", post(close_session))
        .route("/api/justifications", post(submit_justification))
        .route("/api/justifications/pending", get(pending_justifications))
        .route("/api/justifications/:id/review", post(review_justification))
        .route("/api/watchlist", get(open_triggers).post(raise_trigger))
        .route("/api/watchlist/:id/resolve", post(resolve_trigger))
        .route("/api/outbox/dispatch", post(dispatch_outbox))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    tracing::info!(%addr, db = %db_path, "mercato server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
