use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info};

use infergate_common::{
    AsrRequest, ChatRequest, EmbeddingRequest, ImageGenRequest, ModelFamily, NodeConfig,
    OutputChunk, StreamChannel, TtsRequest,
};
use infergate_gateway::{api, GatewayState};
use infergate_router::{
    AsrHandler, ChatHandler, EmbeddingHandler, ImageHandler, ModelRouter, TtsHandler,
};

use crate::manager::WorkerManager;
use crate::worker::{probe_cluster, WorkerClient};

/// The role a node committed to at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    Standalone,
    Master,
    Worker,
}

/// The internal control port sits a fixed distance above the public one.
pub const INTERNAL_PORT_OFFSET: u16 = 1000;

/// Orchestrates startup of one node.
///
/// Models registered before `run` land in the local router, which
/// doubles as the pre-commitment buffer: at mode commitment they are
/// served directly (master/standalone) or replayed to the master as
/// REGISTER-MODEL messages (worker).
pub struct ClusterServer {
    config: NodeConfig,
    router: Arc<ModelRouter>,
    mode: Mutex<ClusterMode>,
    manager: Mutex<Option<Arc<WorkerManager>>>,
    worker: Mutex<Option<Arc<WorkerClient>>>,
    worker_listen: Mutex<(String, u16)>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ClusterServer {
    pub fn new(config: NodeConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            router: Arc::new(ModelRouter::new()),
            mode: Mutex::new(ClusterMode::Standalone),
            manager: Mutex::new(None),
            worker: Mutex::new(None),
            worker_listen: Mutex::new(("0.0.0.0".to_string(), 0)),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn router(&self) -> Arc<ModelRouter> {
        self.router.clone()
    }

    pub fn mode(&self) -> ClusterMode {
        *self.mode.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Where the worker-side forward endpoint should listen; relevant
    /// for cross-machine deployments.
    pub fn set_worker_listen_address(&self, host: &str, port: u16) {
        *self.worker_listen.lock().unwrap() = (host.to_string(), port);
    }

    // ---- host-facing registration ----

    pub fn register_chat(&self, name: &str, handler: impl ChatHandler) {
        self.router.register_chat(name, handler);
    }

    pub fn register_embedding(&self, name: &str, handler: impl EmbeddingHandler) {
        self.router.register_embedding(name, handler);
    }

    pub fn register_asr(&self, name: &str, handler: impl AsrHandler) {
        self.router.register_asr(name, handler);
    }

    pub fn register_tts(&self, name: &str, handler: impl TtsHandler) {
        self.router.register_tts(name, handler);
    }

    pub fn register_image(&self, name: &str, handler: impl ImageHandler) {
        self.router.register_image(name, handler);
    }

    pub fn list_models(&self) -> Vec<String> {
        self.router.list_all_models()
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.router.has_model(name)
    }

    pub fn unregister_model(&self, name: &str) {
        self.router.unregister_model(name);
    }

    // ---- startup ----

    /// Auto-detect the mode for `port`: claim it as master when free,
    /// join as worker when a sibling cluster answers on the internal
    /// port, fail when a foreign process occupies it.
    pub async fn run(&self, port: u16) -> anyhow::Result<ClusterMode> {
        if !self.config.cluster.enable_cluster {
            self.run_standalone(port).await?;
            return Ok(ClusterMode::Standalone);
        }

        if port_is_free(&self.config.gateway.host, port) {
            self.run_as_master(port).await?;
            return Ok(ClusterMode::Master);
        }

        let internal_port = port + INTERNAL_PORT_OFFSET;
        if probe_cluster("127.0.0.1", internal_port).await {
            self.run_as_worker("127.0.0.1", internal_port).await?;
            return Ok(ClusterMode::Worker);
        }

        anyhow::bail!("port {port} is occupied by a non-cluster process")
    }

    /// Serve the public API without any cluster plumbing.
    pub async fn run_standalone(&self, port: u16) -> anyhow::Result<()> {
        *self.mode.lock().unwrap() = ClusterMode::Standalone;
        self.start_gateway(port).await?;
        self.running.store(true, Ordering::SeqCst);
        info!(port, "running standalone");
        Ok(())
    }

    /// Serve the public API on `port` and the cluster control plane on
    /// `port + 1000`. Worker models become local router entries whose
    /// handlers forward through the manager.
    pub async fn run_as_master(&self, port: u16) -> anyhow::Result<()> {
        *self.mode.lock().unwrap() = ClusterMode::Master;

        let manager = WorkerManager::new(self.config.cluster.clone());
        {
            let router = Arc::downgrade(&self.router);
            manager.set_conflict_check(move |name: &str| {
                router.upgrade().map(|r| r.has_model(name)).unwrap_or(false)
            });
        }
        {
            let router = self.router.clone();
            let weak = Arc::downgrade(&manager);
            manager.set_model_registered_callback(move |name, family| {
                let Some(manager) = weak.upgrade() else { return };
                install_forwarder(&router, &manager, &name, family);
            });
        }
        {
            let router = self.router.clone();
            manager.set_model_unregistered_callback(move |name| {
                info!(model = %name, "removing departed worker model");
                router.unregister_model(&name);
            });
        }

        manager
            .clone()
            .start(port + INTERNAL_PORT_OFFSET)
            .await
            .context("failed to start cluster manager")?;
        *self.manager.lock().unwrap() = Some(manager);

        self.start_gateway(port).await?;
        self.running.store(true, Ordering::SeqCst);
        info!(
            port,
            internal_port = port + INTERNAL_PORT_OFFSET,
            "running as master"
        );
        Ok(())
    }

    /// Join the master at `master_host:master_internal_port`, replaying
    /// every locally-registered model.
    pub async fn run_as_worker(
        &self,
        master_host: &str,
        master_internal_port: u16,
    ) -> anyhow::Result<()> {
        *self.mode.lock().unwrap() = ClusterMode::Worker;

        let client = WorkerClient::new(self.router.clone(), &self.config.cluster);
        let (listen_host, listen_port) = self.worker_listen.lock().unwrap().clone();
        client.set_listen_address(&listen_host, listen_port);

        client
            .clone()
            .connect(master_host, master_internal_port)
            .await?;
        client.register_local_models().await;
        *self.worker.lock().unwrap() = Some(client);

        self.running.store(true, Ordering::SeqCst);
        info!(
            master = %format!("{master_host}:{master_internal_port}"),
            "running as worker"
        );
        Ok(())
    }

    async fn start_gateway(&self, port: u16) -> anyhow::Result<()> {
        let mut gateway_config = self.config.gateway.clone();
        gateway_config.port = port;
        let listener =
            tokio::net::TcpListener::bind((gateway_config.host.as_str(), port))
                .await
                .with_context(|| {
                    format!("failed to bind {}:{port}", gateway_config.host)
                })?;
        let state = GatewayState::new(self.router.clone(), gateway_config);
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(err) = api::serve(listener, state, shutdown_rx).await {
                error!(error = %err, "gateway server failed");
            }
        });
        Ok(())
    }

    /// Stop whatever role this node runs in.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        if let Some(manager) = self.manager.lock().unwrap().as_ref() {
            manager.stop();
        }
        if let Some(worker) = self.worker.lock().unwrap().clone() {
            tokio::spawn(async move { worker.disconnect().await });
        }
    }

    /// Block until the node stops, or until a worker-mode node loses
    /// its connection to the master.
    pub async fn wait(&self) {
        loop {
            if !self.is_running() {
                return;
            }
            let worker = self.worker.lock().unwrap().clone();
            if let Some(worker) = worker {
                if !worker.is_connected() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Claim check for master startup: a raw bind that is immediately
/// released again.
fn port_is_free(host: &str, port: u16) -> bool {
    std::net::TcpListener::bind((host, port)).is_ok()
}

fn forward_or_fail(
    manager: &Arc<WorkerManager>,
    model: &str,
    family: ModelFamily,
    payload: Value,
    out: Arc<StreamChannel>,
) {
    if !manager
        .clone()
        .forward_request(model, family, payload, out.clone())
    {
        out.push(OutputChunk::error(
            "model_not_found",
            format!("No worker owns model '{model}'"),
        ));
        out.end();
    }
}

/// Install a router handler that forwards to the owning worker, so the
/// HTTP surface cannot tell a remote model from a local one.
fn install_forwarder(
    router: &Arc<ModelRouter>,
    manager: &Arc<WorkerManager>,
    name: &str,
    family: ModelFamily,
) {
    info!(model = name, family = %family, "publishing worker model");
    match family {
        ModelFamily::Chat => {
            let manager = manager.clone();
            router.register_chat(name, move |req: ChatRequest, out: Arc<StreamChannel>| {
                let manager = manager.clone();
                async move {
                    forward_or_fail(
                        &manager,
                        &req.model,
                        ModelFamily::Chat,
                        req.forward_payload(),
                        out,
                    );
                    Ok(())
                }
            });
        }
        ModelFamily::Embedding => {
            let manager = manager.clone();
            router.register_embedding(
                name,
                move |req: EmbeddingRequest, out: Arc<StreamChannel>| {
                    let manager = manager.clone();
                    async move {
                        forward_or_fail(
                            &manager,
                            &req.model,
                            ModelFamily::Embedding,
                            req.forward_payload(),
                            out,
                        );
                        Ok(())
                    }
                },
            );
        }
        ModelFamily::Asr => {
            let manager = manager.clone();
            router.register_asr(name, move |req: AsrRequest, out: Arc<StreamChannel>| {
                let manager = manager.clone();
                async move {
                    forward_or_fail(
                        &manager,
                        &req.model,
                        ModelFamily::Asr,
                        req.forward_payload(),
                        out,
                    );
                    Ok(())
                }
            });
        }
        ModelFamily::Tts => {
            let manager = manager.clone();
            router.register_tts(name, move |req: TtsRequest, out: Arc<StreamChannel>| {
                let manager = manager.clone();
                async move {
                    forward_or_fail(
                        &manager,
                        &req.model,
                        ModelFamily::Tts,
                        req.forward_payload(),
                        out,
                    );
                    Ok(())
                }
            });
        }
        ModelFamily::Image => {
            let manager = manager.clone();
            router.register_image(
                name,
                move |req: ImageGenRequest, out: Arc<StreamChannel>| {
                    let manager = manager.clone();
                    async move {
                        forward_or_fail(
                            &manager,
                            &req.model,
                            ModelFamily::Image,
                            req.forward_payload(),
                            out,
                        );
                        Ok(())
                    }
                },
            );
        }
    }
}
