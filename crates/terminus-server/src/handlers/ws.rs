//! WebSocket terminal broker
//!
//! Terminates one client stream per connection: authenticates it, binds it
//! to the session's live PTY through the registry, and multiplexes typed
//! frames in both directions. Long operations run as independent tasks so
//! heartbeats stay fast; teardown always releases the registry reference.

use crate::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use terminus_core::store::SessionStore;
use terminus_core::{Error, ExecutionJob, LiveSession, PtyRead, PtyReader};
use terminus_types::{
    close, error_code, ChangeSet, ClientFrame, ExecutionResult, ExecutionStatus, FileChangeKind,
    ServerFrame,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long the outbound queue may stay full before the connection is
/// closed with BACKPRESSURE.
const BACKPRESSURE_LIMIT: Duration = Duration::from_secs(1);

/// Outbound flush budget during detach.
const DETACH_FLUSH: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

/// Handle WebSocket upgrade for `/api/terminal/ws/:session_id?token=...`.
pub async fn handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<i64>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, query.token))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: i64, token: String) {
    let connection_id = uuid::Uuid::new_v4();

    // AUTH: token first, then session existence, then ownership.
    let user = match state.auth_service.validate_token(&token) {
        Ok(user) => user,
        Err(e) => {
            warn!(session_id, %connection_id, %e, "ws auth failed");
            close_with(socket, close::AUTH_FAILED, "authentication failed").await;
            return;
        }
    };

    let session = match state.db.fetch_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            close_with(socket, close::SESSION_NOT_FOUND, "session not found").await;
            return;
        }
        Err(e) => {
            warn!(session_id, %e, "session lookup failed");
            close_with(socket, close::INTERNAL_ERROR, "internal error").await;
            return;
        }
    };

    if !user.can_access_session(session.user_id) {
        warn!(
            session_id,
            user_id = user.user_id,
            owner = session.user_id,
            "ws ownership rejected"
        );
        close_with(socket, close::AUTH_FAILED, "not authorized for this session").await;
        return;
    }

    // ATTACH: acquire (or create) the live session.
    let live = match state.registry.acquire(session_id).await {
        Ok(live) => live,
        Err(e) => {
            warn!(session_id, %e, "attach failed");
            close_with(socket, close::INTERNAL_ERROR, "failed to attach session").await;
            return;
        }
    };
    if let Err(e) = state.db.touch_session(session_id).await {
        debug!(session_id, %e, "touch_session failed");
    }

    info!(session_id, %connection_id, user_id = user.user_id, "terminal attached");
    run_connection(socket, state.clone(), live).await;

    // DETACH.
    state.registry.release(session_id).await;
    info!(session_id, %connection_id, "terminal detached");
}

/// Per-connection mutable state shared between frame handlers.
struct ConnectionContext {
    state: AppState,
    live: Arc<LiveSession>,
    outbound: mpsc::Sender<ServerFrame>,
    closer: Closer,
    /// Staged stdin for the next `execute_code`.
    staged_stdin: Arc<Mutex<Option<String>>>,
    /// Set once the first ping arrives; the watchdog only runs after that.
    last_ping: Arc<Mutex<Option<Instant>>>,
}

async fn run_connection(socket: WebSocket, state: AppState, live: Arc<LiveSession>) {
    let config = state.config.clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerFrame>(config.outbound_queue_frames);
    let closer = Closer::new();
    let cancel = closer.token.clone();

    // Writer: drains the outbound queue onto the socket; on a close request
    // it flushes briefly, then sends the close frame.
    let mut close_rx = closer.take_receiver();
    let writer = tokio::spawn(async move {
        let close_request;
        loop {
            tokio::select! {
                biased;
                requested = close_rx.recv() => {
                    close_request = requested;
                    break;
                }
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if send_json(&mut ws_sender, &frame).await.is_err() {
                                close_request = None;
                                break;
                            }
                        }
                        None => {
                            close_request = None;
                            break;
                        }
                    }
                }
            }
        }

        if let Some((code, reason)) = close_request {
            // Flush what we can inside the detach budget.
            let deadline = Instant::now() + DETACH_FLUSH;
            while let Ok(Some(frame)) =
                tokio::time::timeout_at(deadline, outbound_rx.recv()).await
            {
                if send_json(&mut ws_sender, &frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: Cow::Owned(reason),
                })))
                .await;
        }
        let _ = ws_sender.flush().await;
    });

    let ctx = ConnectionContext {
        state: state.clone(),
        live: live.clone(),
        outbound: outbound_tx.clone(),
        closer: closer.clone(),
        staged_stdin: Arc::new(Mutex::new(None)),
        last_ping: Arc::new(Mutex::new(None)),
    };

    // ATTACH acknowledgment. Queued before the output pump starts so it is
    // always the first frame a client sees.
    if !ctx.send(ServerFrame::ShellConnected).await {
        return;
    }

    // PTY output pump with batching and coalescing backpressure.
    let pump = tokio::spawn(output_pump(
        live.pty.subscribe(),
        outbound_tx.clone(),
        closer.clone(),
        config.output_batch_window,
        config.output_batch_bytes,
        cancel.clone(),
    ));

    // Session-scoped events (file-change broadcasts from any connection).
    let events = tokio::spawn(event_pump(
        live.subscribe_events(),
        outbound_tx.clone(),
        closer.clone(),
        cancel.clone(),
    ));

    // Heartbeat watchdog: armed by the first ping.
    let watchdog = tokio::spawn(heartbeat_watchdog(
        ctx.last_ping.clone(),
        closer.clone(),
        config.ping_interval,
        cancel.clone(),
    ));

    // Long-running frame handlers; aborted wholesale on disconnect, which
    // also kills their subprocesses (kill_on_drop).
    let mut jobs = JoinSet::new();

    // RUN: the receive loop services client frames sequentially.
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = ws_receiver.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        if !dispatch(&ctx, &mut jobs, frame).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%e, "bad frame");
                        let frame = ServerFrame::Error {
                            code: error_code::BAD_FRAME.to_string(),
                            message: "unrecognized frame".to_string(),
                        };
                        if !ctx.send(frame).await {
                            break;
                        }
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // binary/ping/pong handled by axum
            Some(Err(e)) => {
                debug!(%e, "ws receive error");
                break;
            }
        }
    }

    // Teardown on every exit path: stop producers first, then let the
    // writer drain within the flush budget.
    cancel.cancel();
    jobs.shutdown().await;
    pump.abort();
    events.abort();
    watchdog.abort();
    let _ = pump.await;
    let _ = events.await;
    let _ = watchdog.await;
    drop(ctx);
    drop(outbound_tx);
    let _ = tokio::time::timeout(DETACH_FLUSH + Duration::from_millis(100), writer).await;
}

impl ConnectionContext {
    /// Queue a non-output frame. Blocks up to the backpressure limit, then
    /// closes the connection. Returns false once the connection is closing.
    async fn send(&self, frame: ServerFrame) -> bool {
        match tokio::time::timeout(BACKPRESSURE_LIMIT, self.outbound.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                self.closer
                    .request(close::BACKPRESSURE, "client too slow");
                false
            }
        }
    }
}

/// Handle one client frame. Returns false to end the connection.
async fn dispatch(ctx: &ConnectionContext, jobs: &mut JoinSet<()>, frame: ClientFrame) -> bool {
    match frame {
        ClientFrame::ShellInput { data } => {
            if let Err(e) = ctx.live.pty.write(data.into_bytes()).await {
                warn!(session_id = ctx.live.session_id, %e, "shell input failed");
                return ctx
                    .send(ServerFrame::ShellError {
                        error: "shell unavailable".to_string(),
                    })
                    .await;
            }
            true
        }
        ClientFrame::ShellResize { cols, rows } => {
            if let Err(e) = ctx.live.pty.resize(cols, rows).await {
                debug!(session_id = ctx.live.session_id, %e, "resize failed");
            }
            true
        }
        ClientFrame::ExecuteCode {
            code,
            input_data,
            language,
        } => {
            let stdin = match input_data {
                Some(data) => Some(data),
                None => ctx.staged_stdin.lock().await.take(),
            };
            let job = ExecutionJob {
                language: language.unwrap_or_else(|| "python".to_string()),
                code,
                stdin,
                cwd: ctx.live.workspace_path.clone(),
                deadline: None,
            };
            let engine = ctx.state.engine.clone();
            let outbound = ctx.outbound.clone();
            jobs.spawn(async move {
                let frame = execution_frame(engine.execute(job).await);
                let _ = outbound.send(frame).await;
            });
            true
        }
        ClientFrame::InputData { content } => {
            *ctx.staged_stdin.lock().await = Some(content);
            ctx.send(ServerFrame::InputDataReceived).await
        }
        ClientFrame::FileChange => {
            let workspace = ctx.state.workspace.clone();
            let live = ctx.live.clone();
            let outbound = ctx.outbound.clone();
            jobs.spawn(async move {
                match workspace.sync_from_disk(live.session_id).await {
                    Ok(changes) => {
                        let _ = outbound
                            .send(ServerFrame::FileSyncComplete {
                                message: sync_message(&changes),
                            })
                            .await;
                        for frame in change_frames(&changes) {
                            live.broadcast(frame);
                        }
                    }
                    Err(e) => {
                        warn!(session_id = live.session_id, %e, "file sync failed");
                        let _ = outbound
                            .send(ServerFrame::Error {
                                code: e.wire_code().to_string(),
                                message: "file sync failed".to_string(),
                            })
                            .await;
                    }
                }
            });
            true
        }
        ClientFrame::Ping { timestamp } => {
            *ctx.last_ping.lock().await = Some(Instant::now());
            ctx.send(ServerFrame::Pong { timestamp }).await
        }
    }
}

/// Copy PTY output into `shell_output` frames, aggregated in at most
/// `window` / `max_bytes` batches. A full queue coalesces batches by
/// concatenation; a queue full past the limit closes the connection.
async fn output_pump(
    mut reader: PtyReader,
    outbound: mpsc::Sender<ServerFrame>,
    closer: Closer,
    window: Duration,
    max_bytes: usize,
    cancel: CancellationToken,
) {
    let mut batch = String::new();
    let mut full_since: Option<Instant> = None;

    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }

        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(Duration::from_millis(250)) => read,
        };
        let mut eof = false;
        match first {
            PtyRead::Data(bytes) => {
                batch.push_str(&String::from_utf8_lossy(&bytes));
                // Fill the rest of the aggregation window.
                let opened = Instant::now();
                while batch.len() < max_bytes {
                    let remaining = window.saturating_sub(opened.elapsed());
                    if remaining.is_zero() {
                        break;
                    }
                    match reader.read(remaining).await {
                        PtyRead::Data(more) => batch.push_str(&String::from_utf8_lossy(&more)),
                        PtyRead::Empty => break,
                        PtyRead::Eof => {
                            eof = true;
                            break;
                        }
                    }
                }
            }
            PtyRead::Empty => {}
            PtyRead::Eof => eof = true,
        }

        while !batch.is_empty() {
            match outbound.try_send(ServerFrame::ShellOutput {
                data: batch.clone(),
            }) {
                Ok(()) => {
                    batch.clear();
                    full_since = None;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let since = *full_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= BACKPRESSURE_LIMIT {
                        closer.request(close::BACKPRESSURE, "client too slow");
                        break 'outer;
                    }
                    // Keep the batch; further output coalesces into it.
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break 'outer,
            }
        }

        if eof {
            closer.request(close::INTERNAL_ERROR, "shell terminated");
            break;
        }
    }
}

/// Forward session-scoped broadcasts (file-change frames) to this client.
async fn event_pump(
    mut events: tokio::sync::broadcast::Receiver<ServerFrame>,
    outbound: mpsc::Sender<ServerFrame>,
    closer: Closer,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(frame) => {
                match tokio::time::timeout(BACKPRESSURE_LIMIT, outbound.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        closer.request(close::BACKPRESSURE, "client too slow");
                        break;
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event subscriber lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Close the connection once pings stop arriving for 2x the interval.
/// Clients that never ping are never timed out.
async fn heartbeat_watchdog(
    last_ping: Arc<Mutex<Option<Instant>>>,
    closer: Closer,
    ping_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let last = *last_ping.lock().await;
                if heartbeat_expired(last, ping_interval) {
                    closer.request(close::IDLE_TIMEOUT, "heartbeat lost");
                    break;
                }
            }
        }
    }
}

fn heartbeat_expired(last_ping: Option<Instant>, ping_interval: Duration) -> bool {
    match last_ping {
        Some(last) => last.elapsed() > ping_interval * 2,
        None => false,
    }
}

/// Map an execution outcome onto the result frame. Engine failures never
/// escalate to a connection close.
fn execution_frame(result: terminus_core::Result<ExecutionResult>) -> ServerFrame {
    match result {
        Ok(result) => {
            let status = if result.timed_out {
                ExecutionStatus::Timeout
            } else if result.exit_status == 0 {
                ExecutionStatus::Ok
            } else {
                ExecutionStatus::Error
            };
            ServerFrame::CodeExecutionResult {
                status,
                output: result.stdout,
                error: result.stderr,
                exit_status: result.exit_status,
                duration_ms: result.duration_ms,
                timed_out: result.timed_out,
            }
        }
        Err(e) => ServerFrame::CodeExecutionResult {
            status: ExecutionStatus::Error,
            output: String::new(),
            error: match e {
                Error::Execution(message) => message,
                other => other.to_string(),
            },
            exit_status: -1,
            duration_ms: 0,
            timed_out: false,
        },
    }
}

fn sync_message(changes: &ChangeSet) -> String {
    if changes.is_empty() {
        "workspace already in sync".to_string()
    } else {
        format!(
            "synced {} change(s): {} created, {} updated, {} deleted",
            changes.len(),
            changes.created.len(),
            changes.updated.len(),
            changes.deleted.len()
        )
    }
}

fn change_frames(changes: &ChangeSet) -> Vec<ServerFrame> {
    let mut frames = Vec::with_capacity(changes.len());
    for path in &changes.created {
        frames.push(ServerFrame::FileChange {
            file_path: path.clone(),
            kind: FileChangeKind::Created,
        });
    }
    for path in &changes.updated {
        frames.push(ServerFrame::FileChange {
            file_path: path.clone(),
            kind: FileChangeKind::Updated,
        });
    }
    for path in &changes.deleted {
        frames.push(ServerFrame::FileChange {
            file_path: path.clone(),
            kind: FileChangeKind::Deleted,
        });
    }
    frames
}

async fn send_json(
    sender: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            warn!(%e, "frame serialization failed");
            Ok(())
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        })))
        .await;
}

/// One-shot close request shared between the connection's tasks; the first
/// requester wins and everything else unwinds through the token.
#[derive(Clone)]
struct Closer {
    tx: mpsc::Sender<(u16, String)>,
    rx: Arc<std::sync::Mutex<Option<mpsc::Receiver<(u16, String)>>>>,
    token: CancellationToken,
}

impl Closer {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(std::sync::Mutex::new(Some(rx))),
            token: CancellationToken::new(),
        }
    }

    fn request(&self, code: u16, reason: &str) {
        let _ = self.tx.try_send((code, reason.to_string()));
    }

    /// Hand the receive side to the writer task. Panics if called twice;
    /// there is exactly one writer per connection.
    fn take_receiver(&self) -> mpsc::Receiver<(u16, String)> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .expect("close receiver already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_frame_maps_outcomes() {
        let ok = execution_frame(Ok(ExecutionResult {
            stdout: "3\n".to_string(),
            stderr: String::new(),
            exit_status: 0,
            timed_out: false,
            duration_ms: 12,
        }));
        assert!(matches!(
            ok,
            ServerFrame::CodeExecutionResult {
                status: ExecutionStatus::Ok,
                ..
            }
        ));

        let failed = execution_frame(Ok(ExecutionResult {
            stdout: String::new(),
            stderr: "Traceback".to_string(),
            exit_status: 1,
            timed_out: false,
            duration_ms: 5,
        }));
        assert!(matches!(
            failed,
            ServerFrame::CodeExecutionResult {
                status: ExecutionStatus::Error,
                exit_status: 1,
                ..
            }
        ));

        let timed = execution_frame(Ok(ExecutionResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_status: 143,
            timed_out: true,
            duration_ms: 10_050,
        }));
        assert!(matches!(
            timed,
            ServerFrame::CodeExecutionResult {
                status: ExecutionStatus::Timeout,
                timed_out: true,
                ..
            }
        ));

        let spawn_error = execution_frame(Err(Error::Execution("spawn python3: ...".to_string())));
        match spawn_error {
            ServerFrame::CodeExecutionResult {
                status,
                error,
                exit_status,
                ..
            } => {
                assert_eq!(status, ExecutionStatus::Error);
                assert!(!error.is_empty());
                assert_ne!(exit_status, 0);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn change_frames_cover_every_kind() {
        let changes = ChangeSet {
            created: vec!["/new.py".to_string()],
            updated: vec!["/edit.py".to_string()],
            deleted: vec!["/old.py".to_string()],
        };
        let frames = change_frames(&changes);
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            &frames[0],
            ServerFrame::FileChange {
                kind: FileChangeKind::Created,
                ..
            }
        ));
        assert!(matches!(
            &frames[2],
            ServerFrame::FileChange {
                kind: FileChangeKind::Deleted,
                ..
            }
        ));
    }

    #[test]
    fn heartbeat_only_arms_after_first_ping() {
        assert!(!heartbeat_expired(None, Duration::from_secs(30)));

        let fresh = Instant::now();
        assert!(!heartbeat_expired(Some(fresh), Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_expires_past_twice_the_interval() {
        let last = Instant::now();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(heartbeat_expired(Some(last), Duration::from_secs(30)));

        let last = Instant::now();
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(!heartbeat_expired(Some(last), Duration::from_secs(30)));
    }

    #[test]
    fn sync_messages_summarize_changes() {
        assert_eq!(sync_message(&ChangeSet::default()), "workspace already in sync");
        let changes = ChangeSet {
            created: vec!["/a".to_string()],
            updated: vec![],
            deleted: vec!["/b".to_string(), "/c".to_string()],
        };
        assert_eq!(
            sync_message(&changes),
            "synced 3 change(s): 1 created, 0 updated, 2 deleted"
        );
    }

    #[tokio::test]
    async fn closer_delivers_first_request_only() {
        let closer = Closer::new();
        closer.request(close::BACKPRESSURE, "client too slow");
        closer.request(close::IDLE_TIMEOUT, "heartbeat lost");

        let mut rx = closer.take_receiver();
        let (code, reason) = rx.recv().await.unwrap();
        assert_eq!(code, close::BACKPRESSURE);
        assert_eq!(reason, "client too slow");
    }

    /// Wire-format tests: a real WebSocket client driven through the
    /// production router, exercising ACCEPT -> AUTH -> ATTACH -> RUN.
    #[cfg(unix)]
    mod wire {
        use crate::test_support::{app_state, mint_token, router, serve};
        use crate::AppState;
        use futures::{SinkExt, StreamExt};
        use std::net::SocketAddr;
        use std::time::Duration;
        use terminus_types::close;
        use tokio_tungstenite::tungstenite::Message as TMessage;

        type Client = tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >;

        async fn connect(addr: SocketAddr, session_id: i64, token: &str) -> Client {
            let url = format!("ws://{}/api/terminal/ws/{}?token={}", addr, session_id, token);
            let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            ws
        }

        async fn send(ws: &mut Client, frame: &str) {
            ws.send(TMessage::Text(frame.to_string())).await.unwrap();
        }

        /// Next JSON frame; None once the stream closes.
        async fn next_frame(ws: &mut Client) -> Option<serde_json::Value> {
            loop {
                let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
                    .await
                    .expect("timed out waiting for frame")?;
                match message.ok()? {
                    TMessage::Text(text) => return serde_json::from_str(&text).ok(),
                    TMessage::Close(_) => return None,
                    _ => continue,
                }
            }
        }

        /// Skip interleaved frames (shell output, file events) until the
        /// wanted type arrives.
        async fn await_frame(ws: &mut Client, wanted: &str) -> serde_json::Value {
            for _ in 0..200 {
                match next_frame(ws).await {
                    Some(frame) if frame["type"] == wanted => return frame,
                    Some(_) => continue,
                    None => break,
                }
            }
            panic!("frame '{}' never arrived", wanted);
        }

        async fn expect_close(ws: &mut Client, code: u16) {
            for _ in 0..200 {
                let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
                    .await
                    .expect("timed out waiting for close");
                match message {
                    Some(Ok(TMessage::Close(Some(frame)))) => {
                        assert_eq!(u16::from(frame.code), code);
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => panic!("connection ended without a close frame"),
                }
            }
            panic!("no close frame with code {}", code);
        }

        async fn fixture(temp: &tempfile::TempDir, owner: i64) -> (AppState, SocketAddr, i64) {
            let state = app_state(temp).await;
            let session = state.db.create_session(owner, "wire", None).await.unwrap();
            let addr = serve(router(state.clone())).await;
            (state, addr, session.id)
        }

        #[tokio::test]
        async fn attach_sends_shell_connected_then_echoes_input() {
            let temp = tempfile::tempdir().unwrap();
            let (state, addr, session_id) = fixture(&temp, 1).await;
            let mut ws = connect(addr, session_id, &mint_token(1, "user")).await;

            let first = next_frame(&mut ws).await.unwrap();
            assert_eq!(first["type"], "shell_connected");

            send(&mut ws, r#"{"type":"ping","timestamp":7}"#).await;
            let pong = await_frame(&mut ws, "pong").await;
            assert_eq!(pong["timestamp"], 7);

            send(&mut ws, r#"{"type":"shell_input","data":"echo abc\n"}"#).await;
            let mut seen = String::new();
            for _ in 0..200 {
                let frame = next_frame(&mut ws).await.expect("stream ended early");
                if frame["type"] == "shell_output" {
                    seen.push_str(frame["data"].as_str().unwrap_or(""));
                    if seen.contains("abc") {
                        break;
                    }
                }
            }
            assert!(seen.contains("abc"), "echo never came back: {:?}", seen);

            // Unknown type gets an error frame, not a close.
            send(&mut ws, r#"{"type":"connected"}"#).await;
            let error = await_frame(&mut ws, "error").await;
            assert_eq!(error["code"], "BAD_FRAME");

            drop(ws);
            state.registry.destroy(session_id).await.unwrap();
        }

        #[tokio::test]
        async fn execute_code_round_trips_with_staged_stdin() {
            let temp = tempfile::tempdir().unwrap();
            let (state, addr, session_id) = fixture(&temp, 1).await;
            let mut ws = connect(addr, session_id, &mint_token(1, "user")).await;
            await_frame(&mut ws, "shell_connected").await;

            send(
                &mut ws,
                r#"{"type":"execute_code","code":"print(1+2)","language":"python"}"#,
            )
            .await;
            let result = await_frame(&mut ws, "code_execution_result").await;
            assert_eq!(result["status"], "ok");
            assert_eq!(result["output"], "3\n");
            assert_eq!(result["exit_status"], 0);
            assert_eq!(result["timed_out"], false);

            send(&mut ws, r#"{"type":"input_data","content":"Alice\n"}"#).await;
            await_frame(&mut ws, "input_data_received").await;
            send(
                &mut ws,
                r#"{"type":"execute_code","code":"print('hi', input())"}"#,
            )
            .await;
            let result = await_frame(&mut ws, "code_execution_result").await;
            assert_eq!(result["output"], "hi Alice\n");

            drop(ws);
            state.registry.destroy(session_id).await.unwrap();
        }

        #[tokio::test]
        async fn invalid_token_closes_with_auth_failed() {
            let temp = tempfile::tempdir().unwrap();
            let (_state, addr, session_id) = fixture(&temp, 1).await;
            let mut ws = connect(addr, session_id, "not-a-jwt").await;
            expect_close(&mut ws, close::AUTH_FAILED).await;
        }

        #[tokio::test]
        async fn unknown_session_closes_with_session_not_found() {
            let temp = tempfile::tempdir().unwrap();
            let (_state, addr, _session_id) = fixture(&temp, 1).await;
            let mut ws = connect(addr, 9999, &mint_token(1, "user")).await;
            expect_close(&mut ws, close::SESSION_NOT_FOUND).await;
        }

        #[tokio::test]
        async fn foreign_session_is_rejected_for_plain_users() {
            let temp = tempfile::tempdir().unwrap();
            let (_state, addr, session_id) = fixture(&temp, 2).await;
            let mut ws = connect(addr, session_id, &mint_token(1, "user")).await;
            expect_close(&mut ws, close::AUTH_FAILED).await;
        }

        #[tokio::test]
        async fn moderators_may_attach_to_foreign_sessions() {
            let temp = tempfile::tempdir().unwrap();
            let (state, addr, session_id) = fixture(&temp, 2).await;
            let mut ws = connect(addr, session_id, &mint_token(1, "moderator")).await;

            let first = next_frame(&mut ws).await.unwrap();
            assert_eq!(first["type"], "shell_connected");

            drop(ws);
            state.registry.destroy(session_id).await.unwrap();
        }
    }
}
