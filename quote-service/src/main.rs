use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::Json,
    routing::{get, post, put},
};
use dashmap::DashMap;
use quote_flow::{
    Coverages, DriverInput, Flow, FlowSession, GuardContext, GuardDecision, InProcessQuoteService,
    NewQuoteRequest, PaymentCard, PricingSync, PricingView, QuoteAggregate, QuoteCache,
    QuoteService, QuoteSessionClient, RouteGuard, SyncPhase, VehicleInput, WizardStep,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

struct WizardSession {
    flow_session: FlowSession,
    step: WizardStep,
    quote_number: Option<String>,
    pricing: Option<PricingSync>,
}

#[derive(Clone)]
struct AppState {
    sessions: Arc<DashMap<Uuid, WizardSession>>,
    service: Arc<dyn QuoteService>,
    cache: QuoteCache,
    client: QuoteSessionClient,
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    flow: Flow,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: Uuid,
    flow: Option<Flow>,
    step: WizardStep,
}

#[derive(Debug, Serialize)]
struct StepResponse {
    step: WizardStep,
    quote: Option<QuoteAggregate>,
}

/// Guard denial payload: a replacing redirect plus the reason for the
/// landing screen to display.
#[derive(Debug, Serialize)]
struct RedirectResponse {
    redirect: String,
    replace: bool,
    reason: GuardContext,
}

#[derive(Debug, Serialize)]
struct BindResponse {
    policy_number: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
    fields: Option<quote_flow::validation::ValidationErrors>,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn map_flow_error(e: quote_flow::FlowError) -> ApiError {
    use quote_flow::FlowError;
    let (status, fields) = match &e {
        FlowError::Validation(errors) => (StatusCode::UNPROCESSABLE_ENTITY, Some(errors.clone())),
        FlowError::Service(_) => (StatusCode::BAD_GATEWAY, None),
        FlowError::QuoteNotFound(_) | FlowError::SessionNotFound(_) => (StatusCode::NOT_FOUND, None),
        FlowError::InvalidTransition(_) => (StatusCode::CONFLICT, None),
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
            retryable: e.is_retryable(),
            fields,
        }),
    )
}

fn session_not_found(id: Uuid) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("wizard session not found: {id}"),
            retryable: false,
            fields: None,
        }),
    )
}

/// Initialize structured JSON tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "quote_service=debug,quote_flow=debug,tower_http=debug".into());

    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    request.headers_mut().insert(
        "x-correlation-id",
        HeaderValue::from_str(&correlation_id).unwrap(),
    );

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

#[tokio::main]
async fn main() {
    init_tracing();

    let service: Arc<dyn QuoteService> = Arc::new(InProcessQuoteService::new());
    let cache = QuoteCache::new();
    let client = QuoteSessionClient::new(service.clone(), cache.clone());

    let app_state = AppState {
        sessions: Arc::new(DashMap::new()),
        service,
        cache,
        client,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}/exit", post(exit_session))
        .route("/sessions/{id}/steps/{flow}/{step}", get(render_step))
        .route("/sessions/{id}/quote", post(start_quote))
        .route("/sessions/{id}/drivers", put(update_drivers))
        .route("/sessions/{id}/vehicles", put(update_vehicles))
        .route("/sessions/{id}/coverage", put(update_coverage))
        .route("/sessions/{id}/coverage/edits", post(coverage_edit))
        .route("/sessions/{id}/premium", get(current_premium))
        .route("/sessions/{id}/bind", post(bind_quote))
        .layer(from_fn(correlation_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();

    info!("Server running on http://{bind_addr}");

    axum::serve(listener, app).await.unwrap();
}

async fn health_check() -> &'static str {
    "OK"
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<SessionResponse> {
    let session_id = Uuid::new_v4();
    let flow_session = FlowSession::in_memory();
    flow_session.set_active_flow(request.flow);

    info!(session_id = %session_id, flow = %request.flow, "wizard session created");

    state.sessions.insert(
        session_id,
        WizardSession {
            flow_session,
            step: WizardStep::PrimaryDriver,
            quote_number: None,
            pricing: None,
        },
    );

    Ok(Json(SessionResponse {
        session_id,
        flow: Some(request.flow),
        step: WizardStep::PrimaryDriver,
    }))
}

async fn exit_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionResponse> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| session_not_found(session_id))?;
    session.flow_session.clear_active_flow();
    info!(session_id = %session_id, "flow exited");
    Ok(Json(SessionResponse {
        session_id,
        flow: None,
        step: session.step,
    }))
}

/// Guard-evaluated step render: the guarded content (the step data) is
/// only produced for an allowed evaluation.
async fn render_step(
    State(state): State<AppState>,
    Path((session_id, flow, step_slug)): Path<(Uuid, Flow, String)>,
) -> Result<Json<StepResponse>, (StatusCode, Json<RedirectResponse>)> {
    let session = state.sessions.get(&session_id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(RedirectResponse {
                redirect: "/".to_string(),
                replace: true,
                reason: GuardContext {
                    attempted_path: format!("/{flow}/{step_slug}"),
                    expected_flow: flow,
                    actual_flow: None,
                    fallback_path: "/".to_string(),
                },
            }),
        )
    })?;

    let guard = RouteGuard::new(session.flow_session.clone(), flow, "/");
    let attempted = format!("/{flow}/{step_slug}");
    match guard.evaluate(&attempted) {
        GuardDecision::Allowed => {
            let quote = session
                .quote_number
                .as_deref()
                .and_then(|n| state.cache.read(n).into_aggregate());
            Ok(Json(StepResponse {
                step: session.step,
                quote,
            }))
        }
        GuardDecision::Denied(reason) => Err((
            StatusCode::CONFLICT,
            Json(RedirectResponse {
                redirect: reason.fallback_path.clone(),
                replace: true,
                reason,
            }),
        )),
    }
}

async fn start_quote(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<NewQuoteRequest>,
) -> ApiResult<QuoteAggregate> {
    if !state.sessions.contains_key(&session_id) {
        return Err(session_not_found(session_id));
    }

    let aggregate = state
        .client
        .start_quote(request)
        .await
        .map_err(map_flow_error)?;

    if let Some(mut session) = state.sessions.get_mut(&session_id) {
        session.quote_number = Some(aggregate.quote_number.clone());
        if let Some(next) = session.step.next() {
            session.step = next;
        }
    }
    Ok(Json(aggregate))
}

async fn update_drivers(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(drivers): Json<Vec<DriverInput>>,
) -> ApiResult<QuoteAggregate> {
    let quote_number = quote_number_for(&state, session_id)?;
    let aggregate = state
        .client
        .submit_drivers(&quote_number, drivers)
        .await
        .map_err(map_flow_error)?;
    advance_step(&state, session_id);
    Ok(Json(aggregate))
}

async fn update_vehicles(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(vehicles): Json<Vec<VehicleInput>>,
) -> ApiResult<QuoteAggregate> {
    let quote_number = quote_number_for(&state, session_id)?;
    let aggregate = state
        .client
        .submit_vehicles(&quote_number, vehicles)
        .await
        .map_err(map_flow_error)?;
    advance_step(&state, session_id);
    Ok(Json(aggregate))
}

async fn update_coverage(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(coverages): Json<Coverages>,
) -> ApiResult<QuoteAggregate> {
    let quote_number = quote_number_for(&state, session_id)?;
    let aggregate = state
        .client
        .submit_coverage(&quote_number, coverages)
        .await
        .map_err(map_flow_error)?;
    advance_step(&state, session_id);
    Ok(Json(aggregate))
}

/// Raw coverage edit from the slider/toggle controls. Feeds the debounced
/// synchronizer; the recalculation fires only after the quiet interval.
async fn coverage_edit(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(coverages): Json<Coverages>,
) -> ApiResult<PricingView> {
    let quote_number = quote_number_for(&state, session_id)?;

    // First edit for this session: spawn the synchronizer primed from the
    // current aggregate, so the initial populate never issues a call.
    let needs_sync = state
        .sessions
        .get(&session_id)
        .map(|s| s.pricing.is_none())
        .unwrap_or(false);
    if needs_sync {
        let aggregate = state
            .client
            .load(&quote_number)
            .await
            .map_err(map_flow_error)?;
        let sync = PricingSync::spawn(state.service.clone(), state.cache.clone(), &quote_number);
        sync.prime(&aggregate);
        if let Some(mut session) = state.sessions.get_mut(&session_id) {
            session.pricing.get_or_insert(sync);
        }
    }

    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| session_not_found(session_id))?;
    let pricing = session
        .pricing
        .as_ref()
        .ok_or_else(|| session_not_found(session_id))?;
    pricing.edit(coverages);
    let view = pricing.view().borrow().clone();
    Ok(Json(view))
}

async fn current_premium(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<PricingView> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| session_not_found(session_id))?;

    if let Some(pricing) = &session.pricing {
        return Ok(Json(pricing.view().borrow().clone()));
    }

    // No edits yet: the cached aggregate's premium is current by definition.
    let premium = session
        .quote_number
        .as_deref()
        .and_then(|n| state.cache.read(n).into_aggregate())
        .map(|a| a.premium);
    Ok(Json(PricingView {
        premium,
        phase: SyncPhase::Idle,
    }))
}

async fn bind_quote(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(card): Json<PaymentCard>,
) -> ApiResult<BindResponse> {
    let quote_number = quote_number_for(&state, session_id)?;
    let policy_number = state
        .client
        .bind(&quote_number, card)
        .await
        .map_err(map_flow_error)?;

    // Flow complete: clear the active-flow flag.
    if let Some(session) = state.sessions.get(&session_id) {
        session.flow_session.clear_active_flow();
    }
    Ok(Json(BindResponse { policy_number }))
}

fn quote_number_for(state: &AppState, session_id: Uuid) -> Result<String, ApiError> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| session_not_found(session_id))?;
    session.quote_number.clone().ok_or_else(|| {
        error!(session_id = %session_id, "step driven before quote creation");
        map_flow_error(quote_flow::FlowError::InvalidTransition(
            "no quote exists for this session yet".to_string(),
        ))
    })
}

fn advance_step(state: &AppState, session_id: Uuid) {
    if let Some(mut session) = state.sessions.get_mut(&session_id) {
        if let Some(next) = session.step.next() {
            session.step = next;
        }
    }
}
