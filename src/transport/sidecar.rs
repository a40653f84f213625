//! # Sidecar Transport
//!
//! Drives a platform helper process over JSON lines. One process is spawned
//! per identity; every line on its stdin/stdout is a single JSON object
//! tagged by `type`:
//!
//! ```text
//! -> {"type":"request","id":1,"op":"authenticate","params":{"identity":"user","session":"/app/x.session"}}
//! <- {"type":"response","id":1,"ok":true,"result":{"id":"42","is_bot":false}}
//! <- {"type":"event","event":{"kind":"call_confirmed","call_ref":"@someone","call_id":"c1"}}
//! <> {"type":"audio","call_id":"c1","data":"<base64 pcm>"}
//! ```
//!
//! Requests are matched to responses by id. Audio lines flow in both
//! directions and never wait on a response. When the process exits, pending
//! requests fail with a transport error and the event stream closes, which the
//! identity supervisor treats as a lost connection.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    AccountInfo, CallAudio, CallRef, Connected, Credentials, PlatformConnection, PlatformEvent,
    PlatformTransport,
};
use crate::config::TransportConfig;
use crate::error::CallError;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SidecarOutbound<'a> {
    Request { id: u64, op: &'a str, params: Value },
    Audio { call_id: &'a str, data: String },
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SidecarInbound {
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<WireError>,
    },
    Event {
        event: PlatformEvent,
    },
    Audio {
        call_id: String,
        data: String,
    },
}

fn map_wire_error(error: Option<WireError>) -> CallError {
    let Some(error) = error else {
        return CallError::Transport("request failed without an error body".to_string());
    };
    match error.code.as_str() {
        "auth" | "auth_error" => CallError::Auth(error.message),
        "not_in_call" => CallError::NotInCall,
        "timeout" => CallError::Timeout(error.message),
        _ => CallError::Transport(format!("{}: {}", error.code, error.message)),
    }
}

/// Spawns one helper process per identity.
pub struct SidecarTransport {
    command: String,
    args: Vec<String>,
    request_timeout: Duration,
}

impl SidecarTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

#[async_trait]
impl PlatformTransport for SidecarTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Connected, CallError> {
        let session = credentials.session_path.to_string_lossy().into_owned();
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("CALLBRIDGE_IDENTITY", credentials.kind.as_str())
            .env("CALLBRIDGE_SESSION", &session)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CallError::Transport(format!("failed to spawn '{}': {}", self.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CallError::Transport("sidecar stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallError::Transport("sidecar stdout unavailable".to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(64);
        let connection = Arc::new(SidecarConnection::start(
            child,
            stdin,
            stdout,
            events_tx,
            self.request_timeout,
        ));

        let result = connection
            .request(
                "authenticate",
                json!({ "identity": credentials.kind.as_str(), "session": session }),
            )
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };
        let account: AccountInfo = serde_json::from_value(result).map_err(|e| {
            CallError::Transport(format!("malformed authenticate response: {}", e))
        })?;

        info!(
            identity = credentials.kind.as_str(),
            account = %account.id,
            "Sidecar authenticated"
        );

        Ok(Connected {
            connection,
            events: events_rx,
            account,
        })
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, CallError>>>;

#[derive(Default)]
struct Shared {
    pending: PendingMap,
    audio_routes: HashMap<String, mpsc::Sender<Vec<u8>>>,
    closed: bool,
}

struct SidecarConnection {
    next_id: AtomicU64,
    lines: mpsc::UnboundedSender<String>,
    shared: Arc<Mutex<Shared>>,
    child: tokio::sync::Mutex<Option<Child>>,
    request_timeout: Duration,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SidecarConnection {
    fn start(
        child: Child,
        mut stdin: ChildStdin,
        stdout: ChildStdout,
        events: mpsc::Sender<PlatformEvent>,
        request_timeout: Duration,
    ) -> Self {
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Mutex::new(Shared::default()));

        tokio::spawn(async move {
            while let Some(mut line) = lines_rx.recv().await {
                line.push('\n');
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!("Sidecar stdin closed: {}", e);
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<SidecarInbound>(&line) {
                            Ok(message) => route(&reader_shared, &events, message).await,
                            Err(e) => warn!("Ignoring malformed sidecar line: {}", e),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Sidecar stdout read failed: {}", e);
                        break;
                    }
                }
            }

            debug!("Sidecar output closed");
            let pending = {
                let mut shared = lock(&reader_shared);
                shared.closed = true;
                shared.audio_routes.clear();
                std::mem::take(&mut shared.pending)
            };
            for (_, reply) in pending {
                let _ = reply.send(Err(CallError::Transport("sidecar exited".to_string())));
            }
            // Dropping `events` here closes the identity's event stream
        });

        Self {
            next_id: AtomicU64::new(1),
            lines: lines_tx,
            shared,
            child: tokio::sync::Mutex::new(Some(child)),
            request_timeout,
        }
    }

    fn send_line(&self, message: &SidecarOutbound<'_>) -> Result<(), CallError> {
        let line = serde_json::to_string(message)
            .map_err(|e| CallError::Transport(format!("encode failed: {}", e)))?;
        self.lines
            .send(line)
            .map_err(|_| CallError::Transport("sidecar is not running".to_string()))
    }

    async fn request(&self, op: &str, params: Value) -> Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return Err(CallError::Transport("sidecar exited".to_string()));
            }
            shared.pending.insert(id, tx);
        }

        if let Err(e) = self.send_line(&SidecarOutbound::Request { id, op, params }) {
            lock(&self.shared).pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Transport("sidecar dropped the request".to_string())),
            Err(_) => {
                lock(&self.shared).pending.remove(&id);
                Err(CallError::Timeout(format!("sidecar request '{}'", op)))
            }
        }
    }
}

async fn route(shared: &Mutex<Shared>, events: &mpsc::Sender<PlatformEvent>, message: SidecarInbound) {
    match message {
        SidecarInbound::Response {
            id,
            ok,
            result,
            error,
        } => {
            let reply = lock(shared).pending.remove(&id);
            match reply {
                Some(reply) => {
                    let outcome = if ok { Ok(result) } else { Err(map_wire_error(error)) };
                    let _ = reply.send(outcome);
                }
                None => debug!(id, "Response for unknown or expired request"),
            }
        }
        SidecarInbound::Event { event } => {
            if events.send(event).await.is_err() {
                debug!("Event receiver dropped");
            }
        }
        SidecarInbound::Audio { call_id, data } => {
            let frame = match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(call_id = %call_id, "Dropping undecodable audio frame: {}", e);
                    return;
                }
            };
            let route = lock(shared).audio_routes.get(&call_id).cloned();
            if let Some(route) = route {
                // A slow consumer loses frames rather than stalling control traffic
                if route.try_send(frame).is_err() {
                    debug!(call_id = %call_id, "Inbound audio frame dropped");
                }
            }
        }
    }
}

#[async_trait]
impl PlatformConnection for SidecarConnection {
    async fn join_call(&self, call_ref: &CallRef) -> Result<(), CallError> {
        self.request(
            "join_call",
            json!({ "call_ref": call_ref.as_str(), "kind": call_ref.kind() }),
        )
            .await
            .map(|_| ())
    }

    async fn leave_call(&self, call_ref: &CallRef) -> Result<(), CallError> {
        self.request("leave_call", json!({ "call_ref": call_ref.as_str() }))
            .await
            .map(|_| ())
    }

    async fn verify_membership(&self, call_ref: &CallRef) -> Result<bool, CallError> {
        let result = self
            .request("verify_membership", json!({ "call_ref": call_ref.as_str() }))
            .await?;
        Ok(result
            .get("member")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn open_audio(&self, call_id: &str) -> Result<CallAudio, CallError> {
        let (in_tx, in_rx) = mpsc::channel(256);
        lock(&self.shared)
            .audio_routes
            .insert(call_id.to_string(), in_tx);

        if let Err(e) = self.request("open_audio", json!({ "call_id": call_id })).await {
            lock(&self.shared).audio_routes.remove(call_id);
            return Err(e);
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let lines = self.lines.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = SidecarOutbound::Audio {
                    call_id: &call_id,
                    data: base64::engine::general_purpose::STANDARD.encode(&frame),
                };
                let Ok(line) = serde_json::to_string(&message) else {
                    continue;
                };
                if lines.send(line).is_err() {
                    break;
                }
            }
            debug!(call_id = %call_id, "Outbound audio stream closed");
        });

        Ok(CallAudio {
            inbound: in_rx,
            outbound: out_tx,
        })
    }

    async fn send_message(&self, chat: &str, text: &str) -> Result<(), CallError> {
        self.request("send_message", json!({ "chat": chat, "text": text }))
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        let _ = self.send_line(&SidecarOutbound::Request {
            id: 0,
            op: "shutdown",
            params: Value::Null,
        });
        if let Some(mut child) = self.child.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(2), child.wait())
                .await
                .is_err()
            {
                let _ = child.kill().await;
            }
        }
    }
}
