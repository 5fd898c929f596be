use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use server_api::{authenticate, flush_outgoing, list_messages, login, send_message, ApiContext};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{
        InboxResponse, LoginRequest, LoginResponse, SendMessageRequest, SendMessageResponse,
        USER_ID_HEADER,
    },
};
use storage::Storage;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

type HttpError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        loopback_service: UserId::new(&settings.loopback_service),
    };

    let delivery = spawn_delivery_worker(api.clone(), settings.delivery_interval());
    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, loopback = %settings.loopback_service, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "relay: failed to listen for ctrl-c");
            }
        })
        .await?;

    delivery.abort();
    info!("relay stopped");
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/login", post(http_login))
        .route("/api/send", post(http_send_message))
        .route("/api/messages", get(http_list_messages))
        .with_state(state)
}

/// Runs a delivery pass every `period` until aborted.
fn spawn_delivery_worker(api: ApiContext, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = flush_outgoing(&api).await {
                warn!(error = %err, "relay: delivery pass failed");
            }
        }
    })
}

fn http_error(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn caller(state: &AppState, headers: &HeaderMap) -> Result<UserId, HttpError> {
    let header = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok());
    authenticate(&state.api, header).await.map_err(http_error)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    match state.api.storage.health_check().await {
        Ok(()) => Ok("ok"),
        Err(err) => {
            warn!(error = %err, "relay: health check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    login(&state.api, &req.user_id)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, HttpError> {
    let sender = caller(&state, &headers).await?;
    send_message(&state.api, &sender, &req.recipient, &req.message)
        .await
        .map_err(http_error)?;
    Ok(Json(SendMessageResponse {
        status: "queued".into(),
    }))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<InboxResponse>, HttpError> {
    let user_id = caller(&state, &headers).await?;
    let messages = list_messages(&state.api, &user_id)
        .await
        .map_err(http_error)?;
    Ok(Json(InboxResponse { messages }))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
