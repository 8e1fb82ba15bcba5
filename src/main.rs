use palaver::db::{init_db, ChatStore};
use palaver::ingress::{ChatRequest, CreateSessionRequest, RenameSessionRequest};
use palaver::logging::request_id_middleware;
use palaver::redaction::RedactingMakeWriter;
use palaver::streaming::StreamHandler;
use palaver::*;

use axum::response::sse::KeepAlive;
use axum::{
    extract::{Path, State},
    http as ax_http, middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

// --- CHAT ---

#[tracing::instrument(
    name = "chat.request",
    skip_all,
    fields(
        session_id = tracing::field::Empty,
        model.target = tracing::field::Empty,
        chat.stream = tracing::field::Empty,
    )
)]
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let span = tracing::Span::current();

    let request: ChatRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("[🖱️  -> ⚙️ ] Payload deserialization failed: {}", e);
            return (
                ax_http::StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("Payload deserialization failed: {}", e),
                    "code": "VALIDATION_ERROR",
                })),
            )
                .into_response();
        }
    };

    if let Err(e) = request.validate() {
        tracing::warn!("[🖱️  -> ⚙️ ] Validation failed: {}", e.inner);
        return e.into_response();
    }

    span.record(
        "session_id",
        palaver::str_utils::prefix_chars(&request.session_id, 8),
    );
    span.record("model.target", request.parameters.model.as_str());
    span.record("chat.stream", request.stream);

    let session = match state.store.session(&request.session_id).await {
        Ok(Some(s)) => s,
        Ok(None) => {
            return ObservedError::from(PalaverError::NotFound("Session not found".into()))
                .into_response();
        }
        Err(e) => return e.into_response(),
    };

    if let Err(e) = state
        .store
        .append_message(&session.id, Role::User, &request.message, None, None, None)
        .await
    {
        return e.into_response();
    }

    let history = match state.store.session_messages(&session.id).await {
        Ok(messages) => messages,
        Err(e) => return e.into_response(),
    };
    let turns: Vec<ConversationTurn> = history
        .iter()
        .map(|m| ConversationTurn {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();

    let assistant = state.assistants.lookup(&request.assistant_id);
    if assistant.is_none() {
        tracing::warn!(
            "Unknown assistant id '{}'; proceeding without system message or retrieval",
            request.assistant_id
        );
    }

    let outgoing = projections::project_request(&turns, assistant, &request.parameters);
    tracing::info!(
        "[🖱️  -> ⚙️ ] Chat turn [history: {}, model: {}, stream: {}]",
        turns.len(),
        outgoing.model,
        request.stream
    );

    if request.stream {
        stream_chat(state, session.id, outgoing, request.parameters).await
    } else {
        buffered_chat(state, session.id, outgoing, request.parameters).await
    }
}

async fn stream_chat(
    state: Arc<AppState>,
    session_id: String,
    outgoing: projections::ResponsesRequest,
    parameters: GenerationParameters,
) -> Response {
    let (tx, rx) = mpsc::channel(constants::STREAM_CHANNEL_CAPACITY);
    let delivery = delivery::Delivery::new(tx);
    let request_id = uuid::Uuid::new_v4().to_string();

    let stream_span = tracing::info_span!(
        "stream",
        rid = %palaver::str_utils::prefix_chars(&request_id, 8),
        sid = %palaver::str_utils::prefix_chars(&session_id, 8),
        model = %outgoing.model,
    );

    tokio::spawn(
        StreamHandler::run_exchange(
            state.upstream.clone(),
            state.store.clone(),
            session_id,
            request_id,
            outgoing,
            parameters,
            delivery,
        )
        .instrument(stream_span),
    );

    let events = ReceiverStream::new(rx).map(delivery::DeliveryEvent::into_sse);
    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text(": keepalive"),
        )
        .into_response()
}

async fn buffered_chat(
    state: Arc<AppState>,
    session_id: String,
    outgoing: projections::ResponsesRequest,
    parameters: GenerationParameters,
) -> Response {
    match state.upstream.call_buffered(&outgoing).await {
        Ok(reply) => {
            match state
                .store
                .append_message(
                    &session_id,
                    Role::Assistant,
                    &reply.content,
                    reply.reasoning.as_deref(),
                    reply.citations.as_deref(),
                    Some(&parameters),
                )
                .await
            {
                Ok(stored) => Json(stored).into_response(),
                Err(e) => e.into_response(),
            }
        }
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Buffered call error: {}", e);
            match state
                .store
                .append_message(
                    &session_id,
                    Role::Assistant,
                    constants::APOLOGY_MESSAGE,
                    None,
                    None,
                    None,
                )
                .await
            {
                Ok(stored) => {
                    (ax_http::StatusCode::INTERNAL_SERVER_ERROR, Json(stored)).into_response()
                }
                Err(store_err) => store_err.into_response(),
            }
        }
    }
}

// --- SESSIONS ---

async fn list_sessions(State(state): State<Arc<AppState>>) -> Response {
    match state.store.sessions().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let request: CreateSessionRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return ObservedError::from(PalaverError::Validation(format!(
                "Payload deserialization failed: {}",
                e
            )))
            .into_response();
        }
    };
    if let Err(e) = request.validate() {
        return e.into_response();
    }

    match state
        .store
        .create_session(request.name.trim(), &request.assistant_id)
        .await
    {
        Ok(session) => (ax_http::StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let request: RenameSessionRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return ObservedError::from(PalaverError::Validation(format!(
                "Payload deserialization failed: {}",
                e
            )))
            .into_response();
        }
    };
    if let Err(e) = request.validate() {
        return e.into_response();
    }

    match state.store.session(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return ObservedError::from(PalaverError::NotFound("Session not found".into()))
                .into_response();
        }
        Err(e) => return e.into_response(),
    }

    if let Err(e) = state.store.rename_session(&id, request.name.trim()).await {
        return e.into_response();
    }
    match state.store.session(&id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => ObservedError::from(PalaverError::NotFound("Session not found".into()))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.session(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return ObservedError::from(PalaverError::NotFound("Session not found".into()))
                .into_response();
        }
        Err(e) => return e.into_response(),
    }

    match state.store.delete_session(&id).await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn session_messages(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.session(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return ObservedError::from(PalaverError::NotFound("Session not found".into()))
                .into_response();
        }
        Err(e) => return e.into_response(),
    }

    match state.store.session_messages(&id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => e.into_response(),
    }
}

// --- CONFIG LISTINGS ---

async fn list_assistants(State(state): State<Arc<AppState>>) -> Response {
    Json(state.assistants.options()).into_response()
}

async fn list_models() -> Response {
    Json(constants::AVAILABLE_MODELS).into_response()
}

// --- STARTUP ---

fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/:id",
            axum::routing::patch(rename_session).delete(delete_session),
        )
        .route("/api/sessions/:id/messages", get(session_messages))
        .route("/api/assistants", get(list_assistants))
        .route("/api/models", get(list_models))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .merge(protected)
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(axum::extract::DefaultBodyLimit::max(state.args.max_body_size))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "palaver=debug".into(),
    };

    let _ = std::fs::create_dir_all("logs");
    let file_appender = tracing_appender::rolling::daily("logs", "palaver.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(RedactingMakeWriter::new(non_blocking))
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    palaver::logging::setup_panic_hook();

    let args = Arc::new(Args::parse());

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let api_key = match std::env::var("OPENAI_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: OPENAI_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        upstream: upstream::ResponsesClient::new(client, api_key, args.upstream_url.clone()),
        store: ChatStore::new(db),
        assistants: assistants::AssistantRegistry::from_env(),
        auth: auth::AuthGate::from_env(),
        args: args.clone(),
    });

    let app = build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Palaver listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
