use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ws::WebSocket, Request, State, WebSocketUpgrade},
    http::Uri,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use reqwest::{header::CONTENT_TYPE, Method};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info};

use crate::error::GatewayError;
use crate::security::{
    validate_inbound_path, validate_outbound_url, validate_websocket_path, ValidationError,
};
use crate::service::app_state::AppState;
use crate::service::transform::{
    build_payload, process_buffered, stream::StreamTransformer, BackendProtocol,
};

use super::core::{bounded_byte_stream, bounded_fetch, read_bounded_body, FetchPolicy};
use super::util::{parse_request_body, serialize_headers};

const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

/// The gateway request path: validate, resolve protocol, build the backend
/// payload, run the bounded fetch, and re-emit the backend output as a
/// uniform text stream. Any validation or build failure short-circuits
/// before a backend call is attempted.
pub async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let request_id = uuid::Uuid::new_v4();

    // 1. Validate the inbound path against the proxy prefix and allowlist.
    let path = request.uri().path().to_string();
    let backend_path = validate_inbound_path(&path, &state.config)?;

    // 2. Resolve the backend protocol; the table is closed, so an
    //    allowlisted-but-unknown path is still a rejection.
    let protocol = BackendProtocol::from_backend_path(backend_path)
        .ok_or(ValidationError::PathNotAllowed)?;

    debug!(
        %request_id,
        %protocol,
        headers = serialize_headers(request.headers()).unwrap_or_default(),
        "proxying request"
    );

    // 3. Parse the client body (size-capped).
    let gateway_request = parse_request_body(request, state.config.max_request_bytes).await?;

    // 4. Build the protocol payload. The RAG builder may issue its one-time
    //    /init call here.
    let payload = build_payload(protocol, &gateway_request, &state).await?;

    // 5. Bounded fetch against the configured backend.
    let url = format!(
        "{}{}",
        state.config.backend_url.trim_end_matches('/'),
        protocol.backend_path()
    );
    let policy = FetchPolicy::from_config(&state.config);
    let response = bounded_fetch(
        &state.client,
        Method::POST,
        &url,
        Some(payload.to_string()),
        &state.config,
        &policy,
    )
    .await?;

    // 6. Process the response. Backend errors are forwarded with their
    //    status and raw (bounded) body; the router never retries.
    let status = response.status();
    if !status.is_success() {
        let body = read_bounded_body(response, &policy).await?;
        error!(%url, %status, "backend returned error status");
        return Ok(text_response(status, Body::from(body)));
    }

    if protocol.is_streaming() {
        Ok(streaming_response(
            protocol,
            gateway_request.show_intermediate_steps,
            response,
            &policy,
        ))
    } else {
        let body = read_bounded_body(response, &policy).await?;
        let text = process_buffered(protocol, &String::from_utf8_lossy(&body));
        info!(%request_id, %protocol, "request completed");
        Ok(text_response(status, Body::from(text)))
    }
}

/// Pipes a streaming backend body through the protocol transformer and out
/// to the client as chunked text. Chunks are forwarded in backend order.
/// Dropping the client connection drops this stream, which drops the
/// upstream response and cancels the backend read.
fn streaming_response(
    protocol: BackendProtocol,
    show_intermediate_steps: bool,
    response: reqwest::Response,
    policy: &FetchPolicy,
) -> Response<Body> {
    let status = response.status();
    let url = response.url().to_string();
    let bounded = bounded_byte_stream(
        response.bytes_stream(),
        url.clone(),
        policy.max_response_bytes,
    );

    let out = async_stream::stream! {
        let mut transformer = StreamTransformer::new(protocol, show_intermediate_steps);
        let mut bounded = std::pin::pin!(bounded);
        while let Some(chunk_result) = bounded.next().await {
            match chunk_result {
                Ok(chunk) => {
                    for output in transformer.push_chunk(&chunk) {
                        yield Ok::<_, std::io::Error>(Bytes::from(output));
                    }
                    if transformer.is_done() {
                        break;
                    }
                }
                Err(e) => {
                    // End the client stream cleanly; no partial corrupt
                    // frame is emitted.
                    error!(target_url = %url, "stream aborted: {e}");
                    break;
                }
            }
        }
        for output in transformer.finish() {
            yield Ok::<_, std::io::Error>(Bytes::from(output));
        }
        info!(%protocol, "stream completed");
    };

    text_response(status, Body::from_stream(out))
}

fn text_response(status: reqwest::StatusCode, body: Body) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, TEXT_PLAIN_UTF8)
        .body(body)
        .unwrap()
}

/// WebSocket upgrades are accepted on exactly one configured path, then
/// proxied bidirectionally to the backend's websocket endpoint.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    validate_websocket_path(uri.path(), &state.config)?;

    // The websocket leg goes through the same outbound validation as HTTP
    // fetches; the ws/wss scheme swap happens only after it passes.
    let http_url = format!(
        "{}{}",
        state.config.backend_url.trim_end_matches('/'),
        state.config.websocket_path
    );
    let validated = validate_outbound_url(&http_url, &state.config)?;
    let mut backend_ws = validated;
    let scheme = if backend_ws.scheme() == "https" { "wss" } else { "ws" };
    backend_ws
        .set_scheme(scheme)
        .map_err(|_| GatewayError::Internal("websocket scheme rewrite failed".to_string()))?;

    info!(target = %backend_ws, "websocket upgrade validated");
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = proxy_websocket(socket, backend_ws.as_str()).await {
            error!("websocket proxy error: {e:#}");
        }
    }))
}

async fn proxy_websocket(
    client_socket: WebSocket,
    backend_url: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use axum::extract::ws::Message as ClientMessage;
    use tokio_tungstenite::tungstenite::Message as BackendMessage;

    let (backend_socket, _) = connect_async(backend_url).await?;

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut backend_tx, mut backend_rx) = backend_socket.split();

    let client_to_backend = async {
        while let Some(msg) = client_rx.next().await {
            let msg = msg?;
            let forward = match msg {
                ClientMessage::Text(text) => BackendMessage::Text(text.to_string().into()),
                ClientMessage::Binary(data) => BackendMessage::Binary(data),
                ClientMessage::Ping(data) => BackendMessage::Ping(data),
                ClientMessage::Pong(data) => BackendMessage::Pong(data),
                ClientMessage::Close(_) => BackendMessage::Close(None),
            };
            backend_tx.send(forward).await?;
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    let backend_to_client = async {
        while let Some(msg) = backend_rx.next().await {
            let msg = msg?;
            let forward = match msg {
                BackendMessage::Text(text) => ClientMessage::Text(text.to_string().into()),
                BackendMessage::Binary(data) => ClientMessage::Binary(data),
                BackendMessage::Ping(data) => ClientMessage::Ping(data),
                BackendMessage::Pong(data) => ClientMessage::Pong(data),
                BackendMessage::Close(_) => ClientMessage::Close(None),
                BackendMessage::Frame(_) => continue,
            };
            client_tx.send(forward).await?;
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    // Either side closing tears down both legs.
    tokio::select! {
        result = client_to_backend => result?,
        result = backend_to_client => result?,
    }

    Ok(())
}
