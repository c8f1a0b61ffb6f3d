//! WebSocket front-end: routes upgraded connections to a trace session or
//! to the latency echo channel.

pub mod connection;
pub mod echo;

pub use connection::WsTraceConnection;
pub use echo::{EchoMessage, serve_echo};

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TraceError;
use crate::export::JsonLineLog;
use crate::state::TraceResult;
use crate::trace::TraceEngine;

/// Slow or silent clients are dropped after this long in the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Trace(Uuid),
    Echo,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no such endpoint: {0}")]
    NotFound(String),

    #[error("bad query: {0}")]
    BadQuery(String),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::NotFound(_) => StatusCode::NOT_FOUND,
            RouteError::BadQuery(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Map a request path and query onto an endpoint
///
/// `/trace` takes exactly one query parameter, `uuid`, which must parse.
pub fn parse_route(path: &str, query: Option<&str>) -> Result<Route, RouteError> {
    match path {
        "/trace" => {
            let query = query.unwrap_or_default();
            let mut uuid = None;
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if key != "uuid" {
                    return Err(RouteError::BadQuery(format!("unexpected parameter '{}'", key)));
                }
                if uuid.is_some() {
                    return Err(RouteError::BadQuery("uuid given more than once".into()));
                }
                let parsed = Uuid::parse_str(value)
                    .map_err(|e| RouteError::BadQuery(format!("invalid uuid: {}", e)))?;
                uuid = Some(parsed);
            }
            uuid.map(Route::Trace)
                .ok_or_else(|| RouteError::BadQuery("missing uuid".into()))
        }
        "/echo" => Ok(Route::Echo),
        other => Err(RouteError::NotFound(other.to_string())),
    }
}

/// What a traced client receives before the connection is closed
#[derive(Debug, Serialize)]
pub struct TraceReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a TraceResult>,
}

impl<'a> TraceReport<'a> {
    pub fn new(outcome: &'a Result<TraceResult, TraceError>) -> Self {
        match outcome {
            Ok(result) => Self {
                error: None,
                result: Some(result),
            },
            Err(e) => Self {
                error: Some(e.to_string()),
                result: e.partial(),
            },
        }
    }
}

/// Shared by every client task
#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<TraceEngine>,
    pub log: Arc<JsonLineLog>,
}

/// Accept clients until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually EMFILE or a reset before accept; keep serving
                    tracing::warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        tokio::spawn(handle_client(stream, peer, state.clone()));
    }

    tracing::info!("server stopped");
    Ok(())
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, state: ServerState) {
    let mut route = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match parse_route(req.uri().path(), req.uri().query()) {
            Ok(r) => {
                route = Some(r);
                Ok(resp)
            }
            Err(e) => {
                tracing::info!(%peer, "refusing upgrade: {}", e);
                let mut refusal = ErrorResponse::new(Some(e.to_string()));
                *refusal.status_mut() = e.status();
                Err(refusal)
            }
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async(stream, callback);
    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            tracing::debug!(%peer, "handshake failed: {}", e);
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, "handshake timed out");
            return;
        }
    };

    match route {
        Some(Route::Echo) => serve_echo(ws, peer.ip(), state.log.as_ref()).await,
        Some(Route::Trace(uuid)) => {
            if let Err(e) = trace_client(ws, uuid, &state.engine).await {
                tracing::debug!(%peer, session = %uuid, "trace connection error: {}", e);
            }
        }
        None => {}
    }
}

async fn trace_client(
    ws: WebSocketStream<TcpStream>,
    uuid: Uuid,
    engine: &TraceEngine,
) -> Result<(), TraceError> {
    let mut conn = WsTraceConnection::new(ws)?;
    let outcome = engine.run_trace(&mut conn, &uuid.to_string()).await;

    // A closed connection has nobody left to tell
    if matches!(outcome, Err(TraceError::ConnectionClosed { .. })) {
        return Ok(());
    }

    let report = serde_json::to_string(&TraceReport::new(&outcome))
        .map_err(|e| TraceError::Io(e.into()))?;
    conn.send_text(&report).await?;
    conn.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::export::TraceSink;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::{self, Message};

    const ID: &str = "6f1c2b1e-8f2a-4c55-9d1e-3a0f6b7c8d9e";

    #[test]
    fn test_trace_route() {
        let route = parse_route("/trace", Some(&format!("uuid={}", ID))).unwrap();
        assert_eq!(route, Route::Trace(Uuid::parse_str(ID).unwrap()));
    }

    #[test]
    fn test_echo_route() {
        assert_eq!(parse_route("/echo", None), Ok(Route::Echo));
    }

    #[test]
    fn test_trace_route_rejects_bad_queries() {
        for query in [
            None,
            Some(""),
            Some("uuid=not-a-uuid"),
            Some("uuid"),
            Some("id=6f1c2b1e-8f2a-4c55-9d1e-3a0f6b7c8d9e"),
        ] {
            let err = parse_route("/trace", query).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{:?}", query);
        }

        let extra = format!("uuid={}&debug=1", ID);
        assert!(matches!(
            parse_route("/trace", Some(&extra)),
            Err(RouteError::BadQuery(_))
        ));
        let twice = format!("uuid={}&uuid={}", ID, ID);
        assert!(matches!(
            parse_route("/trace", Some(&twice)),
            Err(RouteError::BadQuery(_))
        ));
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let err = parse_route("/", None).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(parse_route("/trace/extra", None).is_err());
    }

    #[test]
    fn test_report_carries_partial_hops() {
        let result = TraceResult {
            session_id: ID.into(),
            target: "198.51.100.7".parse().unwrap(),
            hops: vec![crate::state::HopResult::timeout(1)],
            completed: false,
            reached: false,
            started_at: chrono::Utc::now(),
            ended_at: chrono::Utc::now(),
        };
        let outcome = Err(TraceError::Cancelled {
            partial: Box::new(result),
        });
        let json = serde_json::to_value(TraceReport::new(&outcome)).unwrap();
        assert_eq!(json["error"], "trace cancelled after 1 hops");
        assert_eq!(json["result"]["hops"].as_array().unwrap().len(), 1);

        let outcome = Err(TraceError::Config("no capture".into()));
        let json = serde_json::to_value(TraceReport::new(&outcome)).unwrap();
        assert!(json.get("result").is_none());
    }

    async fn start_server() -> (SocketAddr, CancellationToken, Arc<TraceEngine>) {
        let log = Arc::new(JsonLineLog::open(std::env::temp_dir().join(format!(
            "zerotrace-server-{}.jsonl",
            Uuid::new_v4()
        )))
        .unwrap());
        let sink: Arc<dyn TraceSink> = log.clone();
        let engine = Arc::new(TraceEngine::detached(Config::default(), sink));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let state = ServerState {
            engine: engine.clone(),
            log,
        };
        tokio::spawn(serve(listener, state, cancel.clone()));
        (addr, cancel, engine)
    }

    #[tokio::test]
    async fn test_unknown_endpoint_refused_with_404() {
        let (addr, cancel, _engine) = start_server().await;
        let url = format!("ws://{}/nothing-here", addr);
        match tokio_tungstenite::connect_async(url).await {
            Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), StatusCode::NOT_FOUND),
            other => panic!("expected HTTP refusal, got {:?}", other.map(|_| ())),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_echo_endpoint_round_trip() {
        let (addr, cancel, _engine) = start_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/echo", addr))
            .await
            .unwrap();

        let sample = r#"{"type":"ws-latency","seq":7,"sent_at":12.5}"#;
        ws.send(Message::Text(sample.into())).await.unwrap();
        assert_eq!(ws.next().await.unwrap().unwrap(), Message::Text(sample.into()));
        ws.close(None).await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_trace_endpoint_reaches_loopback_client() {
        let (addr, cancel, engine) = start_server().await;
        let url = format!("ws://{}/trace?uuid={}", addr, ID);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        // tungstenite answers the probe Pings while we wait for the report
        let report = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended without a report: {:?}", other),
            }
        };

        let json: serde_json::Value = serde_json::from_str(&report).unwrap();
        assert!(json.get("error").is_none(), "{}", report);
        assert_eq!(json["result"]["session_id"], ID);
        assert_eq!(json["result"]["reached"], true);
        assert_eq!(json["result"]["hops"][0]["responder"], "127.0.0.1");
        assert!(engine.registry().is_empty());
        cancel.cancel();
    }
}
