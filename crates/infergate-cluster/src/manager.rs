use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use infergate_common::{ClusterConfig, ModelFamily, OutputChunk, StreamChannel};

use crate::protocol::{
    self, decode_frame, encode_frame, Disconnect, ForwardResponse, Handshake, Heartbeat,
    MessageType, RegisterModel, PROBE_WORKER_ID,
};

/// How long a dispatched forward may stay unanswered before the reaper
/// synthesises a failure into its channel.
const FORWARD_DEADLINE: Duration = Duration::from_secs(300);

const INTERNAL_PORT_SCAN: std::ops::Range<u16> = 18080..18180;

type RegisteredCallback = Arc<dyn Fn(String, ModelFamily) + Send + Sync>;
type UnregisteredCallback = Arc<dyn Fn(String) + Send + Sync>;
type ConflictCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A worker accepted via handshake, addressed by the host/port it
/// reported for its forward endpoint.
pub struct WorkerConnection {
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub last_heartbeat: Instant,
    pub models: HashSet<String>,
}

struct PendingForward {
    channel: Arc<StreamChannel>,
    family: ModelFamily,
    started_at: Instant,
}

#[derive(Default)]
struct ManagerState {
    workers: HashMap<String, WorkerConnection>,
    model_to_worker: HashMap<String, String>,
    pending: HashMap<String, PendingForward>,
}

/// Master-side cluster control plane: accepts workers, owns the
/// model-to-worker map, forwards inference calls and reaps the dead.
pub struct WorkerManager {
    config: ClusterConfig,
    state: Mutex<ManagerState>,
    http: reqwest::Client,
    port: AtomicU16,
    on_registered: Mutex<Option<RegisteredCallback>>,
    on_unregistered: Mutex<Option<UnregisteredCallback>>,
    conflict_check: Mutex<Option<ConflictCheck>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerManager {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(FORWARD_DEADLINE)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Arc::new(Self {
            config,
            state: Mutex::new(ManagerState::default()),
            http,
            port: AtomicU16::new(0),
            on_registered: Mutex::new(None),
            on_unregistered: Mutex::new(None),
            conflict_check: Mutex::new(None),
            shutdown,
        })
    }

    /// Fired after a REGISTER-ACK carrying `success=true` went out.
    pub fn set_model_registered_callback(
        &self,
        cb: impl Fn(String, ModelFamily) + Send + Sync + 'static,
    ) {
        *self.on_registered.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_model_unregistered_callback(&self, cb: impl Fn(String) + Send + Sync + 'static) {
        *self.on_unregistered.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Extra name-conflict predicate, used to also reject names already
    /// claimed by the master's local models.
    pub fn set_conflict_check(&self, cb: impl Fn(&str) -> bool + Send + Sync + 'static) {
        *self.conflict_check.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Bind the internal endpoint server (scanning 18080..18179 when
    /// `port` is 0), and start the serve and reaper tasks.
    pub async fn start(self: Arc<Self>, port: u16) -> anyhow::Result<u16> {
        let listener = if port != 0 {
            tokio::net::TcpListener::bind(("0.0.0.0", port)).await?
        } else {
            let mut bound = None;
            for p in INTERNAL_PORT_SCAN {
                if let Ok(l) = tokio::net::TcpListener::bind(("0.0.0.0", p)).await {
                    bound = Some(l);
                    break;
                }
            }
            bound.ok_or_else(|| anyhow::anyhow!("no free internal port in 18080..18180"))?
        };
        let actual = listener.local_addr()?.port();
        self.port.store(actual, Ordering::SeqCst);
        info!(port = actual, "cluster manager listening");

        let app = Router::new()
            .route("/internal/handshake", post(handle_handshake))
            .route("/internal/register", post(handle_register))
            .route("/internal/heartbeat", post(handle_heartbeat))
            .route("/internal/response", post(handle_response))
            .route("/internal/disconnect", post(handle_disconnect))
            .with_state(self.clone());

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = serve.await {
                warn!(error = %err, "cluster manager server failed");
            }
        });

        let manager = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(manager.config.heartbeat_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.reap(),
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(actual)
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Record a worker after an accepted handshake, or refresh the
    /// address of one already known.
    pub fn register_worker(&self, worker_id: &str, host: &str, port: u16) {
        let mut state = self.state.lock().unwrap();
        let conn = state
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerConnection {
                worker_id: worker_id.to_string(),
                host: host.to_string(),
                port,
                last_heartbeat: Instant::now(),
                models: HashSet::new(),
            });
        if !host.is_empty() {
            conn.host = host.to_string();
        }
        if port > 0 {
            conn.port = port;
        }
        conn.last_heartbeat = Instant::now();
    }

    /// Evict a worker and drop every model it owns.
    pub fn unregister_worker(&self, worker_id: &str) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let Some(conn) = state.workers.remove(worker_id) else {
                return;
            };
            for model in &conn.models {
                state.model_to_worker.remove(model);
            }
            conn.models
        };
        let cb = self.on_unregistered.lock().unwrap().clone();
        if let Some(cb) = cb {
            for model in removed {
                cb(model);
            }
        }
    }

    /// Claim a model name for a worker. The name must be free across
    /// the whole fleet, local models included.
    pub fn register_model(
        &self,
        worker_id: &str,
        family: ModelFamily,
        model_name: &str,
    ) -> Result<(), String> {
        let conflict = self.conflict_check.lock().unwrap().clone();
        if let Some(check) = conflict {
            if check(model_name) {
                return Err(format!("Model name already exists: {model_name}"));
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.model_to_worker.contains_key(model_name) {
                return Err(format!("Model name already exists: {model_name}"));
            }
            let Some(conn) = state.workers.get_mut(worker_id) else {
                return Err(format!("Unknown worker: {worker_id}"));
            };
            conn.models.insert(model_name.to_string());
            state
                .model_to_worker
                .insert(model_name.to_string(), worker_id.to_string());
        }

        info!(model = model_name, worker = worker_id, family = %family, "worker model registered");
        let cb = self.on_registered.lock().unwrap().clone();
        if let Some(cb) = cb {
            let name = model_name.to_string();
            tokio::spawn(async move { cb(name, family) });
        }
        Ok(())
    }

    pub fn has_model(&self, model_name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .model_to_worker
            .contains_key(model_name)
    }

    pub fn worker_for_model(&self, model_name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .model_to_worker
            .get(model_name)
            .cloned()
    }

    pub fn list_models(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut models: Vec<String> = state.model_to_worker.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().unwrap().workers.len()
    }

    /// Dispatch an inference call to the worker owning `model_name`.
    ///
    /// Returns false without touching the channel when no worker owns
    /// the name; pushes a terminal `worker_not_found` when the owning
    /// worker vanished. The POST itself runs on a detached task, and a
    /// transport failure is injected as a synthetic error response.
    pub fn forward_request(
        self: Arc<Self>,
        model_name: &str,
        family: ModelFamily,
        request: Value,
        channel: Arc<StreamChannel>,
    ) -> bool {
        let (host, port) = {
            let state = self.state.lock().unwrap();
            let Some(worker_id) = state.model_to_worker.get(model_name) else {
                return false;
            };
            let Some(conn) = state.workers.get(worker_id) else {
                drop(state);
                channel.push(OutputChunk::error("worker_not_found", "Worker not found"));
                channel.end();
                return false;
            };
            (conn.host.clone(), conn.port)
        };

        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        self.state.lock().unwrap().pending.insert(
            request_id.clone(),
            PendingForward {
                channel,
                family,
                started_at: Instant::now(),
            },
        );

        debug!(model = model_name, %request_id, worker = %format!("{host}:{port}"), "forwarding request");
        let payload = protocol::make_forward_request(&request_id, family, request);
        let frame = encode_frame(MessageType::ForwardRequest, &payload);
        let manager = self.clone();
        tokio::spawn(async move {
            let url = format!("http://{host}:{port}/internal/forward");
            let sent = manager
                .http
                .post(&url)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(frame)
                .send()
                .await;
            let ok = matches!(&sent, Ok(resp) if resp.status().is_success());
            if !ok {
                manager.handle_worker_response(
                    &request_id,
                    protocol::make_error(
                        "forward_failed",
                        &format!("Failed to forward request to {host}:{port}"),
                    ),
                    true,
                );
            }
        });
        true
    }

    /// Translate a FORWARD-RESPONSE into events on the stored channel.
    pub fn handle_worker_response(&self, request_id: &str, response: Value, is_error: bool) {
        let pending = self.state.lock().unwrap().pending.remove(request_id);
        let Some(pending) = pending else {
            debug!(%request_id, "response for unknown request");
            return;
        };
        let channel = pending.channel;

        if is_error {
            let code = response
                .get("error_code")
                .and_then(Value::as_str)
                .unwrap_or("worker_error");
            let message = response
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown worker error");
            channel.push(OutputChunk::error(code, message));
            channel.end();
            return;
        }

        if let Some(chunks) = response.get("chunks").and_then(Value::as_array) {
            for chunk in chunks {
                channel.push(text_chunk(chunk));
            }
        } else if let Some(embeds) = response.get("embeddings").and_then(Value::as_array) {
            let vectors = embeds
                .iter()
                .map(|e| {
                    e.as_array()
                        .map(|v| {
                            v.iter()
                                .filter_map(Value::as_f64)
                                .map(|f| f as f32)
                                .collect()
                        })
                        .unwrap_or_default()
                })
                .collect();
            channel.push(OutputChunk::embeddings(vectors, ""));
        } else if let Some(b64) = response.get("bytes_b64").and_then(Value::as_str) {
            let bytes = general_purpose::STANDARD.decode(b64).unwrap_or_default();
            let mime = response
                .get("mime_type")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream");
            let chunk = match pending.family {
                ModelFamily::Image => OutputChunk::image(bytes, mime, ""),
                _ => OutputChunk::audio(bytes, mime, ""),
            };
            channel.push(chunk);
        } else {
            let text = response.get("text").and_then(Value::as_str).unwrap_or("");
            channel.push(OutputChunk::final_text(text, ""));
        }
        channel.end();
    }

    /// Evict workers past the heartbeat timeout and fail forwards past
    /// the forward deadline. Runs on every reaper tick.
    fn reap(&self) {
        let worker_timeout = self.config.worker_timeout();
        let mut dead_models = Vec::new();
        let mut stale_channels = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let dead: Vec<String> = state
                .workers
                .iter()
                .filter(|(_, c)| c.last_heartbeat.elapsed() > worker_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in dead {
                if let Some(conn) = state.workers.remove(&id) {
                    warn!(worker_id = %id, "reaping silent worker");
                    for model in conn.models {
                        state.model_to_worker.remove(&model);
                        dead_models.push(model);
                    }
                }
            }

            let expired: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, p)| p.started_at.elapsed() > FORWARD_DEADLINE)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(p) = state.pending.remove(&id) {
                    warn!(request_id = %id, "reaping unanswered forward");
                    stale_channels.push(p.channel);
                }
            }
        }

        let cb = self.on_unregistered.lock().unwrap().clone();
        if let Some(cb) = cb {
            for model in dead_models {
                cb(model);
            }
        }
        for channel in stale_channels {
            channel.push(OutputChunk::error(
                "forward_failed",
                "No response from worker",
            ));
            channel.end();
        }
    }

    fn touch_worker(&self, worker_id: &str, host: &str, port: u16) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.workers.get_mut(worker_id) {
            conn.last_heartbeat = Instant::now();
            if !host.is_empty() {
                conn.host = host.to_string();
            }
            if port > 0 {
                conn.port = port;
            }
        }
    }
}

fn text_chunk(value: &Value) -> OutputChunk {
    let text = value
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let finish_reason = value
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let created = chrono::Utc::now().timestamp();
    if value.get("is_delta").and_then(Value::as_bool).unwrap_or(true) {
        OutputChunk::TextDelta {
            text,
            model: String::new(),
            finish_reason,
            created,
        }
    } else {
        OutputChunk::FinalText {
            text,
            model: String::new(),
            finish_reason,
            created,
        }
    }
}

// ---- internal endpoint handlers ----

fn frame_response(ty: MessageType, payload: Value) -> Response {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        encode_frame(ty, &payload),
    )
        .into_response()
}

fn ok_response() -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], "OK").into_response()
}

fn bad_frame() -> Response {
    StatusCode::BAD_REQUEST.into_response()
}

async fn handle_handshake(
    State(manager): State<Arc<WorkerManager>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let Ok((MessageType::Handshake, payload)) = decode_frame(&body) else {
        return bad_frame();
    };
    let Ok(hs) = serde_json::from_value::<Handshake>(payload) else {
        return bad_frame();
    };
    if hs.worker_id.is_empty() {
        return bad_frame();
    }

    // Probes only want to know whether a cluster lives here.
    if hs.worker_id != PROBE_WORKER_ID {
        let host = if hs.worker_host.is_empty() {
            addr.ip().to_string()
        } else {
            hs.worker_host.clone()
        };
        manager.register_worker(&hs.worker_id, &host, hs.worker_port);
        info!(worker_id = %hs.worker_id, host = %host, "worker connected");
    }

    frame_response(
        MessageType::HandshakeAck,
        protocol::make_handshake_ack(true, "Welcome", "", manager.port()),
    )
}

async fn handle_register(State(manager): State<Arc<WorkerManager>>, body: Bytes) -> Response {
    let Ok((MessageType::RegisterModel, payload)) = decode_frame(&body) else {
        return bad_frame();
    };
    let Ok(reg) = serde_json::from_value::<RegisterModel>(payload) else {
        return bad_frame();
    };
    if reg.worker_id.is_empty() || reg.model_name.is_empty() {
        return bad_frame();
    }
    let Some(family) = ModelFamily::from_u32(reg.model_type) else {
        return bad_frame();
    };

    manager.touch_worker(&reg.worker_id, &reg.worker_host, reg.worker_port);

    let ack = match manager.register_model(&reg.worker_id, family, &reg.model_name) {
        Ok(()) => protocol::make_register_ack(true, ""),
        Err(message) => protocol::make_register_ack(false, &message),
    };
    frame_response(MessageType::RegisterAck, ack)
}

async fn handle_heartbeat(State(manager): State<Arc<WorkerManager>>, body: Bytes) -> Response {
    let Ok((MessageType::Heartbeat, payload)) = decode_frame(&body) else {
        return bad_frame();
    };
    let Ok(hb) = serde_json::from_value::<Heartbeat>(payload) else {
        return bad_frame();
    };
    manager.touch_worker(&hb.worker_id, &hb.worker_host, hb.worker_port);
    frame_response(MessageType::HeartbeatAck, protocol::make_heartbeat_ack())
}

async fn handle_response(State(manager): State<Arc<WorkerManager>>, body: Bytes) -> Response {
    let Ok((MessageType::ForwardResponse, payload)) = decode_frame(&body) else {
        return bad_frame();
    };
    let Ok(resp) = serde_json::from_value::<ForwardResponse>(payload) else {
        return bad_frame();
    };
    manager.handle_worker_response(&resp.request_id, resp.response, resp.is_error);
    ok_response()
}

async fn handle_disconnect(State(manager): State<Arc<WorkerManager>>, body: Bytes) -> Response {
    let Ok((MessageType::Disconnect, payload)) = decode_frame(&body) else {
        return bad_frame();
    };
    let Ok(msg) = serde_json::from_value::<Disconnect>(payload) else {
        return bad_frame();
    };
    if !msg.worker_id.is_empty() {
        info!(worker_id = %msg.worker_id, "worker disconnected");
        manager.unregister_worker(&msg.worker_id);
    }
    ok_response()
}
