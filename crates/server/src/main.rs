use std::{any::Any, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    async_trait,
    body::Bytes,
    error_handling::HandleErrorLayer,
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Json, Router,
};
use maps_integration::{GoogleMapsClient, SpreadsheetManifestParser};
use serde::de::DeserializeOwned;
use server_api::{token::SessionKeys, ApiContext};
use shared::{
    domain::{Delivery, User},
    error::{ApiError, ErrorCode},
    protocol::{
        ApproveDeliveriesRequest, ApproveDeliveriesResponse, DataResponse, FilterRequest,
        InsertedDelivery, ListResponse, ManifestUpload, OptimizedDeliveryRoute, ParsedManifest,
        SessionInfo, UpdateDeliveryStatusRequest, UpdateDeliveryStatusResponse,
        UpdateUserRoleRequest, UploadDeliveryRequest, UploadDeliveryResponse, UserRoleResponse,
    },
};
use storage::Storage;
use tower::{timeout::error::Elapsed, ServiceBuilder};
use tower_http::{catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod session;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use session::CurrentSession;

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    if settings.uses_dev_session_secret() {
        warn!("SESSION_SECRET is not set; using the development secret");
    }
    let maps_api_key = settings.google_maps_api_key.clone().unwrap_or_else(|| {
        warn!("GOOGLE_MAPS_API_KEY is not set; route optimization will fail upstream");
        String::new()
    });
    let maps = Arc::new(GoogleMapsClient::new(maps_api_key)?);

    let api = ApiContext {
        storage,
        geocoder: maps.clone(),
        route_optimizer: maps,
        manifest_parser: Arc::new(SpreadsheetManifestParser),
        depot_address: settings.depot_address.clone(),
    };
    let state = AppState {
        api,
        sessions: SessionKeys::new(&settings.session_secret, settings.session_ttl_seconds),
        request_timeout: Duration::from_secs(settings.request_timeout_seconds),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        return;
    }
    info!("shutting down");
}

fn build_router(state: Arc<AppState>) -> Router {
    let request_timeout = state.request_timeout;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/upload-data", post(upload_data))
        .route("/get-all-data", get(get_all_data).post(filter_data))
        .route("/update-delivery-status", post(update_delivery_status))
        .route("/approve-deliveries", post(approve_deliveries))
        .route("/deliveries/pending", get(pending_deliveries))
        .route("/deliveries/pending-approval", get(pending_approvals))
        .route("/deliveries/history", get(delivery_history))
        .route("/route/optimize", post(optimize_route))
        .route("/upload-csv", post(upload_manifest))
        .route("/users", get(list_users).put(update_user_role))
        .route("/session", get(session_info))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(middleware_failure))
                .timeout(request_timeout),
        )
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

async fn middleware_failure(err: BoxError) -> (StatusCode, Json<ApiError>) {
    if err.is::<Elapsed>() {
        warn!("request timed out");
        return reject(ApiError::new(ErrorCode::Timeout, "Request timed out"));
    }
    error!(error = %err, "request failed before reaching a handler");
    reject(ApiError::new(ErrorCode::Unknown, "An unexpected error occurred").with_cause(err))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let cause = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "handler panicked".to_string()
    };
    error!(%cause, "request handler panicked");
    reject(ApiError::new(ErrorCode::Unknown, "An unexpected error occurred").with_cause(cause))
        .into_response()
}

/// Maps an [`ApiError`] onto its HTTP status.
pub(crate) fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::Upstream => StatusCode::BAD_GATEWAY,
        ErrorCode::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorCode::Storage | ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

/// JSON body extractor whose rejections use the API error envelope.
struct ApiJson<T>(T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                let (status, body) = reject(
                    ApiError::validation("Invalid request body").with_cause(rejection.body_text()),
                );
                if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    return Err((StatusCode::PAYLOAD_TOO_LARGE, body));
                }
                Err((status, body))
            }
        }
    }
}

fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|error| {
        reject(ApiError::validation("Invalid request body").with_cause(error))
    })
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state.api.storage.health_check().await.map_err(|error| {
        error!(%error, "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Storage, "storage unavailable").with_cause(error)),
        )
    })?;
    Ok("ok")
}

async fn upload_data(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<UploadDeliveryRequest>,
) -> ApiResult<(StatusCode, Json<UploadDeliveryResponse>)> {
    let inserted_id = server_api::upload_delivery(&state.api, request)
        .await
        .map_err(reject)?;
    Ok((
        StatusCode::CREATED,
        Json(UploadDeliveryResponse {
            success: true,
            message: "Data uploaded successfully".into(),
            data: InsertedDelivery { inserted_id },
        }),
    ))
}

async fn get_all_data(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListResponse<Delivery>>> {
    let data = server_api::list_deliveries(&state.api, &Default::default())
        .await
        .map_err(reject)?;
    Ok(Json(ListResponse::new(data)))
}

async fn filter_data(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<ListResponse<Delivery>>> {
    let request: FilterRequest = parse_optional_body(&body)?;
    let data = server_api::list_deliveries(&state.api, &request.filter)
        .await
        .map_err(reject)?;
    Ok(Json(ListResponse::new(data)))
}

async fn update_delivery_status(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<UpdateDeliveryStatusRequest>,
) -> ApiResult<Json<UpdateDeliveryStatusResponse>> {
    let result = server_api::update_delivery_status(&state.api, request)
        .await
        .map_err(reject)?;
    Ok(Json(UpdateDeliveryStatusResponse {
        success: true,
        message: "Delivery status updated successfully".into(),
        result,
    }))
}

async fn approve_deliveries(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<ApproveDeliveriesRequest>,
) -> ApiResult<Json<ApproveDeliveriesResponse>> {
    let modified_count = server_api::approve_deliveries(&state.api, request)
        .await
        .map_err(reject)?;
    Ok(Json(ApproveDeliveriesResponse {
        success: true,
        message: format!("{modified_count} deliveries approved successfully"),
        modified_count,
    }))
}

async fn pending_deliveries(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListResponse<Delivery>>> {
    let data = server_api::pending_deliveries(&state.api)
        .await
        .map_err(reject)?;
    Ok(Json(ListResponse::new(data)))
}

async fn pending_approvals(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListResponse<Delivery>>> {
    let data = server_api::pending_approvals(&state.api)
        .await
        .map_err(reject)?;
    Ok(Json(ListResponse::new(data)))
}

async fn delivery_history(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListResponse<Delivery>>> {
    let data = server_api::delivery_history(&state.api)
        .await
        .map_err(reject)?;
    Ok(Json(ListResponse::new(data)))
}

async fn optimize_route(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<DataResponse<OptimizedDeliveryRoute>>> {
    let route = server_api::optimize_pending_route(&state.api)
        .await
        .map_err(reject)?;
    Ok(Json(DataResponse::new(route)))
}

async fn upload_manifest(
    State(state): State<Arc<AppState>>,
    ApiJson(upload): ApiJson<ManifestUpload>,
) -> ApiResult<Json<DataResponse<ParsedManifest>>> {
    let parsed = server_api::parse_manifest(&state.api, upload)
        .await
        .map_err(reject)?;
    Ok(Json(DataResponse::new(parsed)))
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    CurrentSession(session): CurrentSession,
) -> ApiResult<Json<ListResponse<User>>> {
    let users = server_api::list_users(&state.api, session.as_ref())
        .await
        .map_err(reject)?;
    Ok(Json(ListResponse::new(users)))
}

async fn update_user_role(
    State(state): State<Arc<AppState>>,
    CurrentSession(session): CurrentSession,
    ApiJson(request): ApiJson<UpdateUserRoleRequest>,
) -> ApiResult<Json<UserRoleResponse>> {
    let user = server_api::update_user_role(&state.api, session.as_ref(), request)
        .await
        .map_err(reject)?;
    Ok(Json(UserRoleResponse {
        success: true,
        user,
    }))
}

async fn session_info(CurrentSession(session): CurrentSession) -> Json<SessionInfo> {
    Json(server_api::session_info(session.as_ref()))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
