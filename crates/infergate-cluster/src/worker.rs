use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use infergate_common::{
    AsrRequest, ChatRequest, ClusterConfig, EmbeddingRequest, ImageGenRequest, ModelFamily,
    OutputChunk, StreamChannel, TtsRequest,
};
use infergate_router::ModelRouter;

use crate::protocol::{
    self, decode_frame, encode_frame, ForwardRequest, HandshakeAck, MessageType, RegisterAck,
    PROBE_WORKER_ID,
};

const WORKER_PORT_SCAN: std::ops::Range<u16> = 28080..28180;

/// Worker side of the cluster: connects to a master, publishes the
/// locally-registered models, hosts a small endpoint for forwarded
/// requests and keeps the master fed with heartbeats.
pub struct WorkerClient {
    worker_id: String,
    heartbeat_interval: Duration,
    listen: Mutex<(String, u16)>,
    actual_port: AtomicU16,
    connected: AtomicBool,
    master: Mutex<Option<(String, u16)>>,
    router: Arc<ModelRouter>,
    http: reqwest::Client,
    registered: Mutex<HashSet<String>>,
    active: DashMap<String, Arc<StreamChannel>>,
    shutdown: watch::Sender<bool>,
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &hex[..8])
}

/// First non-loopback IPv4 of an up interface, falling back to
/// loopback. Used when the worker listens on all interfaces but must
/// report a reachable address to the master.
fn resolve_local_ipv4() -> String {
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) if !ip.is_loopback() => ip.to_string(),
        _ => "127.0.0.1".to_string(),
    }
}

impl WorkerClient {
    pub fn new(router: Arc<ModelRouter>, config: &ClusterConfig) -> Arc<Self> {
        let worker_id = if config.worker_id.is_empty() {
            default_worker_id()
        } else {
            config.worker_id.clone()
        };
        let (shutdown, _) = watch::channel(false);
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Arc::new(Self {
            worker_id,
            heartbeat_interval: config.heartbeat_interval(),
            listen: Mutex::new(("0.0.0.0".to_string(), 0)),
            actual_port: AtomicU16::new(0),
            connected: AtomicBool::new(false),
            master: Mutex::new(None),
            router,
            http,
            registered: Mutex::new(HashSet::new()),
            active: DashMap::new(),
            shutdown,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Where the forward endpoint should bind. Port 0 scans
    /// 28080..28179 at connect time.
    pub fn set_listen_address(&self, host: &str, port: u16) {
        *self.listen.lock().unwrap() = (host.to_string(), port);
    }

    /// The address reported to the master. A 0.0.0.0 bind is replaced
    /// by the first non-loopback IPv4 so other hosts can reach us.
    pub fn listen_address(&self) -> String {
        let host = self.listen.lock().unwrap().0.clone();
        if host == "0.0.0.0" {
            resolve_local_ipv4()
        } else {
            host
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.actual_port.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Handshake with the master, start the local forward endpoint and
    /// the heartbeat loop.
    pub async fn connect(self: Arc<Self>, host: &str, port: u16) -> anyhow::Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        *self.master.lock().unwrap() = Some((host.to_string(), port));

        let configured_port = self.listen.lock().unwrap().1;
        let payload = protocol::make_handshake(&self.worker_id, &self.listen_address(), configured_port);
        let (ty, ack) = self
            .post_frame("handshake", MessageType::Handshake, payload)
            .await
            .with_context(|| format!("failed to reach master at {host}:{port}"))?;
        anyhow::ensure!(
            ty == MessageType::HandshakeAck,
            "unexpected handshake reply type"
        );
        let ack: HandshakeAck = serde_json::from_value(ack)?;
        anyhow::ensure!(ack.accepted, "master refused handshake: {}", ack.message);

        self.clone().start_forward_endpoint().await?;
        self.connected.store(true, Ordering::SeqCst);

        let client = self.clone();
        tokio::spawn(async move { client.heartbeat_loop().await });

        info!(
            worker_id = %self.worker_id,
            master = %format!("{host}:{port}"),
            listen = %format!("{}:{}", self.listen_address(), self.listen_port()),
            "connected to master"
        );
        Ok(())
    }

    async fn start_forward_endpoint(self: Arc<Self>) -> anyhow::Result<()> {
        let (listen_host, want_port) = self.listen.lock().unwrap().clone();
        let listener = if want_port > 0 {
            tokio::net::TcpListener::bind((listen_host.as_str(), want_port))
                .await
                .with_context(|| format!("failed to bind {listen_host}:{want_port}"))?
        } else {
            let mut bound = None;
            for p in WORKER_PORT_SCAN {
                if let Ok(l) = tokio::net::TcpListener::bind((listen_host.as_str(), p)).await {
                    bound = Some(l);
                    break;
                }
            }
            bound.ok_or_else(|| anyhow::anyhow!("no free worker port in 28080..28180"))?
        };
        self.actual_port
            .store(listener.local_addr()?.port(), Ordering::SeqCst);

        let app = Router::new()
            .route("/internal/forward", post(handle_forward))
            .with_state(self.clone());
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = serve.await {
                warn!(error = %err, "worker forward endpoint failed");
            }
        });
        Ok(())
    }

    /// Publish one model to the master. Rejections (usually a name
    /// conflict) surface as errors carrying the master's message.
    pub async fn register_model(&self, family: ModelFamily, name: &str) -> anyhow::Result<()> {
        anyhow::ensure!(self.is_connected(), "not connected to a master");
        if self.registered.lock().unwrap().contains(name) {
            return Ok(());
        }
        let payload = protocol::make_register_model(
            &self.worker_id,
            &self.listen_address(),
            self.listen_port(),
            family,
            name,
        );
        let (ty, ack) = self
            .post_frame("register", MessageType::RegisterModel, payload)
            .await?;
        anyhow::ensure!(ty == MessageType::RegisterAck, "unexpected register reply type");
        let ack: RegisterAck = serde_json::from_value(ack)?;
        anyhow::ensure!(ack.success, "model registration rejected: {}", ack.message);
        self.registered.lock().unwrap().insert(name.to_string());
        info!(model = name, "model registered with master");
        Ok(())
    }

    /// Replay every locally-registered model to the master. A rejected
    /// name is reported and skipped, the rest still registers.
    pub async fn register_local_models(&self) {
        for (family, name) in self.router.registered_models() {
            if let Err(err) = self.register_model(family, &name).await {
                error!(model = %name, error = %err, "failed to register model with master");
            }
        }
    }

    pub async fn send_response(
        &self,
        request_id: &str,
        response: Value,
        is_error: bool,
    ) -> anyhow::Result<()> {
        let payload = protocol::make_forward_response(request_id, response, is_error);
        self.post_fire_and_forget("response", MessageType::ForwardResponse, payload)
            .await
    }

    /// Tell the master we are leaving, then stop the endpoint and the
    /// heartbeat loop.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let payload = protocol::make_disconnect(&self.worker_id);
            if let Err(err) = self
                .post_fire_and_forget("disconnect", MessageType::Disconnect, payload)
                .await
            {
                debug!(error = %err, "disconnect notification failed");
            }
        }
        let _ = self.shutdown.send(true);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if !self.is_connected() {
                break;
            }
            let payload = protocol::make_heartbeat(
                &self.worker_id,
                &self.listen_address(),
                self.listen_port(),
            );
            match self
                .post_frame("heartbeat", MessageType::Heartbeat, payload)
                .await
            {
                Ok((MessageType::HeartbeatAck, _)) => {}
                Ok((ty, _)) => {
                    warn!(?ty, "unexpected heartbeat reply, marking disconnected");
                    self.connected.store(false, Ordering::SeqCst);
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "heartbeat failed, marking disconnected");
                    self.connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    /// Route a forwarded request into a fresh channel and hand the
    /// drain off to a detached collector.
    fn serve_forward(self: Arc<Self>, fwd: ForwardRequest) {
        let channel = Arc::new(StreamChannel::default());
        self.active.insert(fwd.request_id.clone(), channel.clone());

        let routed = match ModelFamily::from_u32(fwd.model_type) {
            Some(ModelFamily::Chat) => ChatRequest::from_value(&fwd.request)
                .map(|r| self.router.route_chat(r, channel.clone()))
                .unwrap_or(false),
            Some(ModelFamily::Embedding) => EmbeddingRequest::from_value(&fwd.request)
                .map(|r| self.router.route_embedding(r, channel.clone()))
                .unwrap_or(false),
            Some(ModelFamily::Asr) => AsrRequest::from_value(&fwd.request)
                .map(|r| self.router.route_asr(r, channel.clone()))
                .unwrap_or(false),
            Some(ModelFamily::Tts) => TtsRequest::from_value(&fwd.request)
                .map(|r| self.router.route_tts(r, channel.clone()))
                .unwrap_or(false),
            Some(ModelFamily::Image) => ImageGenRequest::from_value(&fwd.request)
                .map(|r| self.router.route_image(r, channel.clone()))
                .unwrap_or(false),
            None => false,
        };
        if !routed {
            channel.push(OutputChunk::error(
                "model_not_found",
                "Model is not registered on worker",
            ));
            channel.end();
        }

        let client = self.clone();
        tokio::spawn(async move {
            client.collect_and_respond(fwd.request_id, channel).await;
        });
    }

    /// Drain the channel, serialise the chunks and post the
    /// FORWARD-RESPONSE back to the master.
    async fn collect_and_respond(&self, request_id: String, channel: Arc<StreamChannel>) {
        let mut chunks: Vec<Value> = Vec::new();
        loop {
            match channel.wait_pop_for(Duration::from_millis(100)).await {
                None => {
                    if channel.is_ended() {
                        break;
                    }
                }
                Some(OutputChunk::End) => break,
                Some(OutputChunk::Error { code, message }) => {
                    if let Err(err) = self
                        .send_response(&request_id, protocol::make_error(&code, &message), true)
                        .await
                    {
                        warn!(error = %err, %request_id, "failed to report error to master");
                    }
                    self.active.remove(&request_id);
                    return;
                }
                Some(chunk) => {
                    if let Some((value, is_stop)) = chunk_to_json(&chunk) {
                        chunks.push(value);
                        if is_stop {
                            break;
                        }
                    }
                }
            }
        }

        let response = if chunks.len() == 1 {
            chunks.remove(0)
        } else {
            json!({ "chunks": chunks })
        };
        if let Err(err) = self.send_response(&request_id, response, false).await {
            warn!(error = %err, %request_id, "failed to post forward response");
        }
        self.active.remove(&request_id);
    }

    async fn post_frame(
        &self,
        endpoint: &str,
        ty: MessageType,
        payload: Value,
    ) -> anyhow::Result<(MessageType, Value)> {
        let response = self.post_raw(endpoint, ty, payload).await?;
        let body = response.bytes().await?;
        Ok(decode_frame(&body)?)
    }

    async fn post_fire_and_forget(
        &self,
        endpoint: &str,
        ty: MessageType,
        payload: Value,
    ) -> anyhow::Result<()> {
        self.post_raw(endpoint, ty, payload).await?;
        Ok(())
    }

    async fn post_raw(
        &self,
        endpoint: &str,
        ty: MessageType,
        payload: Value,
    ) -> anyhow::Result<reqwest::Response> {
        let (host, port) = self
            .master
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("not connected"))?;
        let url = format!("http://{host}:{port}/internal/{endpoint}");
        let response = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(encode_frame(ty, &payload))
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "master returned {}",
            response.status()
        );
        Ok(response)
    }
}

/// Per-chunk JSON of the forward response. The bool marks a chunk
/// carrying `finish_reason == "stop"`, after which collection stops.
fn chunk_to_json(chunk: &OutputChunk) -> Option<(Value, bool)> {
    match chunk {
        OutputChunk::TextDelta {
            text,
            finish_reason,
            ..
        }
        | OutputChunk::FinalText {
            text,
            finish_reason,
            ..
        } => {
            let mut v = json!({
                "text": text,
                "is_delta": matches!(chunk, OutputChunk::TextDelta { .. }),
            });
            let mut stop = false;
            if let Some(reason) = finish_reason {
                v["finish_reason"] = json!(reason);
                stop = reason == "stop";
            }
            Some((v, stop))
        }
        OutputChunk::Embedding { vector, .. } => {
            Some((json!({"embeddings": [vector]}), false))
        }
        OutputChunk::Embeddings { vectors, .. } => {
            Some((json!({"embeddings": vectors}), false))
        }
        OutputChunk::AudioBytes { bytes, mime, .. }
        | OutputChunk::ImageBytes { bytes, mime, .. } => Some((
            json!({
                "bytes_b64": general_purpose::STANDARD.encode(bytes),
                "mime_type": mime,
            }),
            false,
        )),
        OutputChunk::JsonObject { .. } | OutputChunk::Error { .. } | OutputChunk::End => None,
    }
}

async fn handle_forward(State(client): State<Arc<WorkerClient>>, body: Bytes) -> Response {
    let Ok((MessageType::ForwardRequest, payload)) = decode_frame(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Ok(fwd) = serde_json::from_value::<ForwardRequest>(payload) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    client.serve_forward(fwd);
    ([(header::CONTENT_TYPE, "text/plain")], "OK").into_response()
}

/// Probe `host:port` with a handshake carrying the probe worker id.
/// True only when the peer answers with a valid HANDSHAKE-ACK frame,
/// which tells a sibling cluster service apart from a foreign process.
pub async fn probe_cluster(host: &str, port: u16) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };
    let frame = encode_frame(
        MessageType::Handshake,
        &protocol::make_handshake(PROBE_WORKER_ID, "", 0),
    );
    let Ok(response) = client
        .post(format!("http://{host}:{port}/internal/handshake"))
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(frame)
        .send()
        .await
    else {
        return false;
    };
    if !response.status().is_success() {
        return false;
    }
    let Ok(body) = response.bytes().await else {
        return false;
    };
    matches!(decode_frame(&body), Ok((MessageType::HandshakeAck, _)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_chunk_serialisation() {
        let (v, stop) = chunk_to_json(&OutputChunk::text_delta("hi", "m")).unwrap();
        assert_eq!(v["text"], "hi");
        assert_eq!(v["is_delta"], true);
        assert!(!stop);

        let chunk = OutputChunk::FinalText {
            text: "done".to_string(),
            model: "m".to_string(),
            finish_reason: Some("stop".to_string()),
            created: 0,
        };
        let (v, stop) = chunk_to_json(&chunk).unwrap();
        assert_eq!(v["is_delta"], false);
        assert_eq!(v["finish_reason"], "stop");
        assert!(stop);
    }

    #[test]
    fn binary_chunk_serialisation() {
        let (v, _) = chunk_to_json(&OutputChunk::audio(vec![1, 2], "audio/wav", "m")).unwrap();
        assert_eq!(v["mime_type"], "audio/wav");
        assert_eq!(
            general_purpose::STANDARD
                .decode(v["bytes_b64"].as_str().unwrap())
                .unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn embedding_chunk_serialisation() {
        let (v, _) =
            chunk_to_json(&OutputChunk::embeddings(vec![vec![1.0], vec![2.0]], "m")).unwrap();
        assert_eq!(v["embeddings"].as_array().unwrap().len(), 2);
        let (v, _) = chunk_to_json(&OutputChunk::embedding(vec![3.0], "m", 0)).unwrap();
        assert_eq!(v["embeddings"][0][0], 3.0);
    }

    #[test]
    fn control_chunks_are_skipped() {
        assert!(chunk_to_json(&OutputChunk::end()).is_none());
        assert!(chunk_to_json(&OutputChunk::error("x", "y")).is_none());
    }

    #[test]
    fn default_worker_ids_are_unique() {
        let a = default_worker_id();
        let b = default_worker_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }
}
