mod hub;
mod registry;
mod sessions;

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use gamehub_core::protocol::{now_rfc3339, ClientCommand, ServerEvent};
use hub::RealtimeHub;
use serde::Deserialize;
use serde_json::Value;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    stale_seconds: u64,
    ping_interval: Duration,
    write_timeout: Duration,
    queue_capacity: usize,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "gamehub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value = "")]
    log_dir: String,
}

struct AppState {
    hub: RealtimeHub,
    started_at: Instant,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let state = Arc::new(AppState {
        hub: RealtimeHub::new(),
        started_at: Instant::now(),
    });
    start_stale_reaper(state.clone(), &config);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/debug/health", get(health_handler))
        .route("/api/debug/websocket", get(debug_websocket_handler))
        .route("/api/sessions/:session_id/events", post(session_events_handler))
        .with_state((state.clone(), Arc::new(config.clone())));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(event = "gamehub_start", addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "serve_error", error = %err);
    }
    info!(event = "gamehub_stop");
}

type HandlerState = (Arc<AppState>, Arc<Config>);

async fn ws_handler(
    ws: WebSocketUpgrade,
    State((state, config)): State<HandlerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(state, config, socket).await;
    })
}

/// Per-connection event stream: register, read commands until the
/// transport closes, then tear down registry and membership state.
async fn handle_socket(state: Arc<AppState>, config: Arc<Config>, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(config.queue_capacity);

    let write_timeout = config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                // Timed out or the socket is gone; dropping the receiver
                // makes every later send fail fast.
                _ => return,
            }
        }
    });

    let conn_id = state.hub.accept(tx.clone()).await;
    let ping_task = start_ping(state.clone(), config.ping_interval, conn_id.clone(), tx.clone());

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
        };
        state.hub.touch(&conn_id).await;
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if data.len() > MAX_MESSAGE_BYTES {
            warn!(event = "message_too_large", conn_id = %conn_id, size = data.len());
            continue;
        }
        if config.debug {
            debug!(event = "message_received", conn_id = %conn_id, raw = %String::from_utf8_lossy(&data));
        }
        let command: ClientCommand = match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(err) => {
                // Protocol error: log, keep the connection untouched.
                warn!(event = "message_invalid", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        state.hub.handle_command(&conn_id, command).await;
    }

    state.hub.disconnect(&conn_id, "disconnect").await;
    // The ping task holds its own sender clone; abort it so the writer
    // sees the channel close now instead of on the next tick.
    if let Some(ping) = ping_task {
        ping.abort();
    }
    drop(tx);
    let _ = write_task.await;
}

/// Periodic ping for liveness. A failed ping means the writer is gone,
/// which tears the connection down through the normal disconnect path.
fn start_ping(
    state: Arc<AppState>,
    interval: Duration,
    conn_id: String,
    sender: mpsc::Sender<Message>,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !state.hub.connection_exists(&conn_id).await {
                return;
            }
            match sender.try_send(Message::Ping(Vec::new())) {
                Ok(()) => {}
                // A full queue is backpressure, not death; try again later.
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(event = "ping_failed", conn_id = %conn_id);
                    state.hub.disconnect(&conn_id, "ping_failed").await;
                    return;
                }
            }
        }
    }))
}

/// Closes connections that have not produced a frame within the stale
/// window. Browsers answer the server pings with pongs, so a live but
/// quiet tab never trips this.
fn start_stale_reaper(state: Arc<AppState>, config: &Config) {
    if config.stale_seconds == 0 {
        return;
    }
    let stale_after = Duration::from_secs(config.stale_seconds);
    let interval = stale_after / 2;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for entry in state.hub.connections().await {
                if entry.last_seen().elapsed() > stale_after {
                    warn!(event = "stale_close", conn_id = %entry.id);
                    entry.close("stale");
                    state.hub.disconnect(&entry.id, "stale").await;
                }
            }
        }
    });
}

async fn health_handler(State((state, _)): State<HandlerState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "websocket": {
            "connections": state.hub.connection_count().await,
            "sessions": state.hub.session_count().await,
        },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn debug_websocket_handler(State((state, _)): State<HandlerState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "success": true,
        "data": state.hub.debug_info().await,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Pass-through events the CRUD layer pushes when a server-side action
/// completes. Only these two kinds may enter from outside; game events
/// must originate from live connections.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventIngress {
    #[serde(rename_all = "camelCase")]
    PlayerAnswerReceived {
        player_id: String,
        player_name: String,
    },
    #[serde(rename_all = "camelCase")]
    RoundResultsReady {
        #[serde(default)]
        round_data: Value,
    },
}

async fn session_events_handler(
    Path(session_id): Path<String>,
    State((state, _)): State<HandlerState>,
    Json(body): Json<EventIngress>,
) -> impl IntoResponse {
    if session_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "session id is required"})),
        );
    }
    let event = match body {
        EventIngress::PlayerAnswerReceived {
            player_id,
            player_name,
        } => ServerEvent::PlayerAnswerReceived {
            session_id: session_id.clone(),
            player_id,
            player_name,
            timestamp: now_rfc3339(),
        },
        EventIngress::RoundResultsReady { round_data } => ServerEvent::RoundResultsReady {
            session_id: session_id.clone(),
            round_data,
            timestamp: now_rfc3339(),
        },
    };
    let delivered = state
        .hub
        .broadcast_to_session(&session_id, &event, None)
        .await;
    info!(
        event = "event_ingress",
        session_id = %session_id,
        kind = event.kind(),
        delivered
    );
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "delivered": delivered,
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr, std::env::var("GAMEHUB_ADDR").ok()),
        debug: args.debug || env_true(std::env::var("GAMEHUB_DEBUG").ok()),
        stale_seconds: args.stale_seconds,
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: args.queue_capacity.max(1),
        log_dir: resolve_log_dir(&args.log_dir, std::env::var("GAMEHUB_LOG_DIR").ok()),
    }
}

fn resolve_addr(addr_flag: &str, env_value: Option<String>) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Some(value) = env_value {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:3000".to_string()
}

fn resolve_log_dir(log_dir_flag: &str, env_value: Option<String>) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value.unwrap_or_default()
}

fn env_true(value: Option<String>) -> bool {
    match value {
        Some(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("GAMEHUB_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join("gamehub.log");
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_flag_wins_over_env_and_default() {
        assert_eq!(
            resolve_addr("0.0.0.0:9000", Some("127.0.0.1:4000".to_string())),
            "0.0.0.0:9000"
        );
        assert_eq!(
            resolve_addr("", Some("127.0.0.1:4000".to_string())),
            "127.0.0.1:4000"
        );
        assert_eq!(resolve_addr("", None), "127.0.0.1:3000");
        assert_eq!(resolve_addr("  ", Some("  ".to_string())), "127.0.0.1:3000");
    }

    #[test]
    fn env_true_accepts_common_truthy_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(env_true(Some(value.to_string())), "{value}");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!env_true(Some(value.to_string())), "{value}");
        }
        assert!(!env_true(None));
    }

    #[test]
    fn log_dir_empty_means_disabled() {
        assert_eq!(resolve_log_dir("", None), "");
        assert_eq!(resolve_log_dir("", Some("/var/log".to_string())), "/var/log");
        assert_eq!(resolve_log_dir("./logs", None), "./logs");
    }

    #[tokio::test]
    async fn aborted_ping_task_releases_its_sender() {
        let state = Arc::new(AppState {
            hub: RealtimeHub::new(),
            started_at: Instant::now(),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let conn_id = state.hub.accept(tx.clone()).await;
        let ping = start_ping(
            state.clone(),
            Duration::from_secs(60),
            conn_id.clone(),
            tx.clone(),
        )
        .expect("ping task");

        state.hub.disconnect(&conn_id, "socket_closed").await;
        ping.abort();
        drop(tx);

        // With every sender clone released, the channel drains to a
        // close instead of staying open until the next ping tick.
        while rx.recv().await.is_some() {}
    }

    #[test]
    fn zero_interval_disables_the_ping_task() {
        let state = Arc::new(AppState {
            hub: RealtimeHub::new(),
            started_at: Instant::now(),
        });
        let (tx, _rx) = mpsc::channel(1);
        assert!(start_ping(state, Duration::ZERO, "client-x".to_string(), tx).is_none());
    }

    #[test]
    fn ingress_accepts_only_pass_through_kinds() {
        let answer: EventIngress = serde_json::from_str(
            r#"{"type": "player_answer_received", "playerId": "p-1", "playerName": "Ada"}"#,
        )
        .expect("parse player_answer_received");
        assert_eq!(
            answer,
            EventIngress::PlayerAnswerReceived {
                player_id: "p-1".to_string(),
                player_name: "Ada".to_string(),
            }
        );

        let results: EventIngress =
            serde_json::from_str(r#"{"type": "round_results_ready", "roundData": {"round": 2}}"#)
                .expect("parse round_results_ready");
        match results {
            EventIngress::RoundResultsReady { round_data } => {
                assert_eq!(round_data["round"], 2);
            }
            other => panic!("unexpected ingress: {other:?}"),
        }

        let rejected: Result<EventIngress, _> =
            serde_json::from_str(r#"{"type": "player_action", "action": "cheat"}"#);
        assert!(rejected.is_err());
    }
}
