// Migration Tracker - Web Server
// Read-only JSON API over the query engine

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use migration_tracker::{
    AgentProfile, DiagnosticSummary, Dimension, EngineConfig, EngineError, EngineResult, Period,
    PeriodRange, ProfileFilter, QueryEngine, QueryOutcome, SnapshotFilter,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<QueryEngine>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<DiagnosticSummary>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(outcome: QueryOutcome<T>) -> Self {
        Self {
            success: true,
            data: Some(outcome.data),
            diagnostics: Some(outcome.diagnostics.summary()),
            cancelled: outcome.cancelled,
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            data: None,
            diagnostics: None,
            cancelled: false,
            error: Some(message),
        }
    }
}

/// Query-string filters shared by the list and aggregate endpoints
#[derive(Debug, Default, Deserialize)]
struct FilterParams {
    uf: Option<String>,
    city: Option<String>,
    activity: Option<String>,
    size: Option<String>,
    submarket: Option<String>,
    profile: Option<String>,
    from: Option<Period>,
    to: Option<Period>,
    n: Option<usize>,
}

impl FilterParams {
    fn periods(&self) -> PeriodRange {
        PeriodRange::new(self.from, self.to)
    }

    fn snapshot_filter(&self) -> SnapshotFilter {
        SnapshotFilter {
            state_uf: self.uf.clone(),
            city: self.city.clone(),
            activity_code: self.activity.clone(),
            size_tier: self.size.clone(),
            submarket: self.submarket.clone(),
            agent_profile: self.profile.as_deref().and_then(AgentProfile::parse),
            periods: self.periods(),
        }
    }

    fn profile_filter(&self) -> ProfileFilter {
        ProfileFilter {
            state_uf: self.uf.clone(),
            city: self.city.clone(),
            activity_code: self.activity.clone(),
            size_tier: self.size.clone(),
            submarket: self.submarket.clone(),
            periods: self.periods(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    reference: Option<Period>,
    years: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProgressParams {
    expected: u64,
}

fn status_of(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        EngineError::SourceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(status: StatusCode, message: String) -> Response {
    (status, Json(ApiResponse::<()>::failed(message))).into_response()
}

/// Queries read SQLite and fan out on rayon, so they run off the async workers
async fn run_query<T, F>(state: AppState, query: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&QueryEngine) -> EngineResult<QueryOutcome<T>> + Send + 'static,
{
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || query(engine.as_ref())).await {
        Ok(Ok(outcome)) => (StatusCode::OK, Json(ApiResponse::ok(outcome))).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "Query failed");
            failure(status_of(&e), e.to_string())
        }
        Err(e) => {
            error!(error = %e, "Query task panicked");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "query task failed".to_string())
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "success": true, "data": "OK", "version": migration_tracker::VERSION }))
}

/// POST /api/cancel - Cancel the queries running now; later queries are unaffected
async fn cancel_queries(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.cancellation().cancel_all();
    info!("Running queries cancelled");
    Json(serde_json::json!({ "success": true }))
}

/// GET /api/companies - Profiles filtered by location, activity, size, submarket and period
async fn list_companies(
    State(state): State<AppState>,
    Query(params): Query<FilterParams>,
) -> Response {
    let filter = params.profile_filter();
    run_query(state, move |engine| engine.profiles_by_filter(&filter)).await
}

/// GET /api/companies/:cnpj - Unified profile of one company
async fn get_company(State(state): State<AppState>, Path(cnpj): Path<String>) -> Response {
    run_query(state, move |engine| engine.profile_by_root(&cnpj)).await
}

/// GET /api/companies/:cnpj/events - Migration history of one company
async fn get_company_events(State(state): State<AppState>, Path(cnpj): Path<String>) -> Response {
    run_query(state, move |engine| engine.events_for_root(&cnpj)).await
}

/// GET /api/events - Migration events in a period range
async fn list_events(State(state): State<AppState>, Query(params): Query<FilterParams>) -> Response {
    let range = params.periods();
    run_query(state, move |engine| engine.events_in_range(range)).await
}

/// GET /api/breakdown/:dimension - Counts and shares per group
async fn get_breakdown(
    State(state): State<AppState>,
    Path(dimension): Path<String>,
    Query(params): Query<FilterParams>,
) -> Response {
    let dimension: Dimension = match dimension.parse() {
        Ok(d) => d,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e),
    };
    let filter = params.snapshot_filter();
    run_query(state, move |engine| engine.breakdown(dimension, &filter)).await
}

/// GET /api/periods - Consumption and migrations per period
async fn get_period_totals(
    State(state): State<AppState>,
    Query(params): Query<FilterParams>,
) -> Response {
    let filter = params.snapshot_filter();
    run_query(state, move |engine| engine.period_totals(&filter)).await
}

/// GET /api/top - Top consumers
async fn get_top_consumers(
    State(state): State<AppState>,
    Query(params): Query<FilterParams>,
) -> Response {
    let filter = params.snapshot_filter();
    let n = params.n;
    run_query(state, move |engine| engine.top_consumers(&filter, n)).await
}

/// GET /api/window - Migrations in the trailing window
async fn get_migration_window(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> Response {
    run_query(state, move |engine| {
        engine.migration_window(params.reference, params.years)
    })
    .await
}

/// GET /api/progress/:table?expected=N - Load progress of a source table
async fn get_progress(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(params): Query<ProgressParams>,
) -> Response {
    run_query(state, move |engine| {
        engine.progress(&table, params.expected).map(|p| QueryOutcome {
            data: p,
            diagnostics: Default::default(),
            cancelled: false,
        })
    })
    .await
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🌐 Migration Tracker - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;

    if !config.database_path.exists() {
        eprintln!("❌ Database not found at {:?}", config.database_path);
        eprintln!("   Run: migration-tracker import <dir>");
        eprintln!("   to load the source extracts first.");
        std::process::exit(1);
    }
    println!("✓ Database: {:?}", config.database_path);

    let addr = config.server_addr.clone();
    let state = AppState {
        engine: Arc::new(QueryEngine::open(config)),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/cancel", post(cancel_queries))
        .route("/companies", get(list_companies))
        .route("/companies/:cnpj", get(get_company))
        .route("/companies/:cnpj/events", get(get_company_events))
        .route("/events", get(list_events))
        .route("/breakdown/:dimension", get(get_breakdown))
        .route("/periods", get(get_period_totals))
        .route("/top", get(get_top_consumers))
        .route("/window", get(get_migration_window))
        .route("/progress/:table", get(get_progress))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Server listening");

    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/companies", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
