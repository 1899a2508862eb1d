// Scripted Gateway - HTTP Router
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// axum front for the gateway services.
//
// Routes:
//   GET            /{token}/{file?}              editor bootstrap
//   GET/PUT/DELETE /files/{token}/{file}         file resources
//   GET            /commands/{token}             command list
//   POST           /commands/{token}/{command}   streamed execution
//   GET (WS/SSE)   /events/{token}               event channel
//   anything else                                static client assets
//
// Token resolution runs first, path confinement second. Both failures
// render the same bare 403.

use crate::analysis::SourceAnalyzer;
use crate::commands::{CommandRunner, CommandService, ProcessRunner};
use crate::config::GatewayConfig;
use crate::confine;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventHub, Session};
use crate::files::{Expect, FileService, Representation};
use crate::negotiate::{Accept, MEDIA_COMMANDS, MEDIA_CONSOLE};
use crate::paths;
use crate::projects_db::ProjectsDb;
use crate::registry::{is_token_shaped, TokenRegistry};
use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeDir;

// ============================================================================
// STATE
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TokenRegistry>,
    pub files: Arc<FileService>,
    pub commands: Arc<CommandService>,
    pub events: Arc<EventHub>,
    assets: ServeDir,
}

impl AppState {
    pub fn new(config: &GatewayConfig, registry: Arc<TokenRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            registry,
            files: Arc::new(FileService::new(Arc::new(SourceAnalyzer))),
            commands: Arc::new(CommandService::new(
                runner,
                config.commands_file.clone(),
                config.console_buffer,
                config.command_timeout(),
            )),
            events: Arc::new(EventHub::new(config.event_buffer)),
            assets: ServeDir::new(&config.client_dir),
        }
    }

    /// Token first, then path. Either failure is the same 403.
    async fn confine(&self, token: &str, relative: String) -> GatewayResult<confine::ConfinedPath> {
        let root = self.registry.resolve(token)?;
        confine::resolve_async(root, relative).await
    }
}

// ============================================================================
// ERROR RENDERING
// ============================================================================

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if self.is_forbidden() {
            log::debug!("Request refused");
            return StatusCode::FORBIDDEN.into_response();
        }
        let status = match &self {
            GatewayError::NotFound | GatewayError::CommandUndefined(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict => StatusCode::CONFLICT,
            GatewayError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            GatewayError::Io(e) => {
                log::error!("I/O failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Internal(msg) => {
                log::error!("Internal failure: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::UntrustedToken | GatewayError::PathEscape => StatusCode::FORBIDDEN,
        };
        // Status only: no body, no content type
        status.into_response()
    }
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    let assets = state.assets.clone();
    Router::new()
        .route("/files/:token", get(read_root))
        .route("/files/:token/*path", get(read_file).put(save_file).delete(delete_file))
        .route("/commands/:token", get(list_commands))
        .route("/commands/:token/:command", post(run_command))
        .route("/events/:token", get(events))
        .route("/:token", get(bootstrap_root))
        .route("/:token/*path", get(bootstrap_file))
        .fallback_service(assets)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Open the project store, load the registry and serve until Ctrl-C.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let db_path = paths::projects_db_path(&config.data_dir);
    let db = Arc::new(
        ProjectsDb::open(&db_path).with_context(|| format!("Failed to open project store at {:?}", db_path))?,
    );
    let registry = Arc::new(TokenRegistry::load(&db)?);

    if let Some(every) = config.registry_refresh() {
        tokio::spawn(refresh_registry(Arc::clone(&registry), db, every));
    }

    let state = AppState::new(&config, registry, Arc::new(ProcessRunner));
    let app = router(state, config.max_body_bytes);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    log::info!("Scripted gateway listening on http://{}", addr);
    log::info!("Client assets: {:?}", config.client_dir);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutting down");
        })
        .await?;
    Ok(())
}

async fn refresh_registry(registry: Arc<TokenRegistry>, db: Arc<ProjectsDb>, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let registry = Arc::clone(&registry);
        let db = Arc::clone(&db);
        match tokio::task::spawn_blocking(move || registry.refresh(&db)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Registry refresh failed: {}", e),
            Err(e) => log::warn!("Registry refresh task failed: {}", e),
        }
    }
}

// ============================================================================
// FILE RESOURCES
// ============================================================================

async fn read_root(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    read(&state, &token, String::new(), &headers).await
}

async fn read_file(
    State(state): State<AppState>,
    Path((token, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    read(&state, &token, path, &headers).await
}

async fn read(state: &AppState, token: &str, path: String, headers: &HeaderMap) -> Result<Response, GatewayError> {
    let confined = state.confine(token, path).await?;
    let accept = Accept::parse(header_str(headers, header::ACCEPT));

    let representation = state.files.read(&confined, &accept).await?;
    let content_type = representation.kind().media_type();
    let response = match representation {
        Representation::Raw { bytes, version } => (
            [(header::CONTENT_TYPE, content_type.to_string()), (header::ETAG, version.to_etag())],
            bytes,
        )
            .into_response(),
        Representation::Directory(entries) => ([(header::CONTENT_TYPE, content_type)], Json(entries)).into_response(),
        Representation::Lint(value) | Representation::Dependencies(value) => {
            ([(header::CONTENT_TYPE, content_type)], Json(value)).into_response()
        }
    };
    Ok(response)
}

async fn save_file(
    State(state): State<AppState>,
    Path((token, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let confined = state.confine(&token, path).await?;
    let expect = Expect::from_if_match(header_str(&headers, header::IF_MATCH));

    let version = state.files.save(&confined, body.to_vec(), &expect).await?;
    state.events.file_changed(&token, &confined.display_relative(), "saved");

    Ok((StatusCode::CREATED, [(header::ETAG, version.to_etag())]).into_response())
}

async fn delete_file(
    State(state): State<AppState>,
    Path((token, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, GatewayError> {
    let confined = state.confine(&token, path).await?;
    let expect = Expect::from_if_match(header_str(&headers, header::IF_MATCH));

    state.files.delete(&confined, &expect).await?;
    state.events.file_changed(&token, &confined.display_relative(), "deleted");

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// COMMANDS
// ============================================================================

async fn list_commands(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, GatewayError> {
    let root = state.registry.resolve(&token)?;
    let commands = state.commands.list(&root).await?;
    Ok(([(header::CONTENT_TYPE, MEDIA_COMMANDS)], Json(commands)).into_response())
}

async fn run_command(
    State(state): State<AppState>,
    Path((token, command)): Path<(String, String)>,
) -> Result<Response, GatewayError> {
    let root = state.registry.resolve(&token)?;
    let execution = state.commands.start(&root, &command).await?;

    // Client disconnect drops the body, which drops the execution
    let frames = execution.into_stream().map(|event| Ok::<_, Infallible>(event.to_frame()));
    Ok((
        [(header::CONTENT_TYPE, MEDIA_CONSOLE), (header::CACHE_CONTROL, "no-cache")],
        Body::from_stream(frames),
    )
        .into_response())
}

// ============================================================================
// EVENT CHANNEL
// ============================================================================

async fn events(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, GatewayError> {
    state.registry.resolve(&token)?;
    let session = state.events.subscribe(&token);

    Ok(match ws {
        Some(ws) => ws.on_upgrade(move |socket| relay_socket(socket, session)).into_response(),
        None => {
            let stream = session.into_stream().map(|event| {
                SseEvent::default().event(event.kind.as_str()).json_data(&event)
            });
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
    })
}

/// Hub events out, client messages in, until either side closes.
async fn relay_socket(socket: WebSocket, mut session: Session) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        let incoming = tokio::select! {
            event = session.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Dropping unserializable event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
                continue;
            }
            incoming = receiver.next() => incoming,
        };

        match incoming {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(body) => {
                    session.send_message(body);
                }
                Err(e) => log::debug!("Ignoring malformed client message: {}", e),
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }
    log::debug!("Event socket for session {} closed", session.id());
}

// ============================================================================
// BOOTSTRAP + STATIC ASSETS
// ============================================================================

async fn bootstrap_root(State(state): State<AppState>, Path(token): Path<String>, request: Request) -> Response {
    bootstrap(state, token, String::new(), request).await
}

async fn bootstrap_file(
    State(state): State<AppState>,
    Path((token, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    bootstrap(state, token, path, request).await
}

/// Token-shaped first segments get the editor page. Everything else is
/// a static asset request.
async fn bootstrap(state: AppState, token: String, path: String, request: Request) -> Response {
    if !is_token_shaped(&token) {
        return match state.assets.clone().oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        };
    }

    match state.confine(&token, path).await {
        Ok(confined) => Html(bootstrap_page(&token, &confined.display_relative())).into_response(),
        Err(e) => e.into_response(),
    }
}

fn bootstrap_page(token: &str, file: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Scripted - /{file}</title>
<link rel="stylesheet" href="/resources/app/scripted.css">
</head>
<body data-token="{token}" data-file="/{file}">
<div id="editor"></div>
<script src="/resources/app/main.js"></script>
</body>
</html>
"#,
        token = escape_html(token),
        file = escape_html(file),
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ============================================================================
// TESTS
// ============================================================================
