use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use infergate_common::{
    AsrRequest, ChatRequest, EmbeddingRequest, ImageGenRequest, ModelFamily, OutputChunk,
    StreamChannel, TtsRequest,
};

/// Handler for the chat family. Implementations must terminate the
/// channel exactly once, either by calling `end` or by returning an
/// error that the router converts into a terminal `model_error` event.
///
/// Plain async closures implement this through the blanket impl, so a
/// host can register `|req, out| async move { ... }` directly.
#[async_trait]
pub trait ChatHandler: Send + Sync + 'static {
    async fn handle(&self, req: ChatRequest, out: Arc<StreamChannel>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> ChatHandler for F
where
    F: Fn(ChatRequest, Arc<StreamChannel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, req: ChatRequest, out: Arc<StreamChannel>) -> Result<()> {
        (self)(req, out).await
    }
}

#[async_trait]
pub trait EmbeddingHandler: Send + Sync + 'static {
    async fn handle(&self, req: EmbeddingRequest, out: Arc<StreamChannel>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EmbeddingHandler for F
where
    F: Fn(EmbeddingRequest, Arc<StreamChannel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, req: EmbeddingRequest, out: Arc<StreamChannel>) -> Result<()> {
        (self)(req, out).await
    }
}

#[async_trait]
pub trait AsrHandler: Send + Sync + 'static {
    async fn handle(&self, req: AsrRequest, out: Arc<StreamChannel>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> AsrHandler for F
where
    F: Fn(AsrRequest, Arc<StreamChannel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, req: AsrRequest, out: Arc<StreamChannel>) -> Result<()> {
        (self)(req, out).await
    }
}

#[async_trait]
pub trait TtsHandler: Send + Sync + 'static {
    async fn handle(&self, req: TtsRequest, out: Arc<StreamChannel>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> TtsHandler for F
where
    F: Fn(TtsRequest, Arc<StreamChannel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, req: TtsRequest, out: Arc<StreamChannel>) -> Result<()> {
        (self)(req, out).await
    }
}

#[async_trait]
pub trait ImageHandler: Send + Sync + 'static {
    async fn handle(&self, req: ImageGenRequest, out: Arc<StreamChannel>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> ImageHandler for F
where
    F: Fn(ImageGenRequest, Arc<StreamChannel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, req: ImageGenRequest, out: Arc<StreamChannel>) -> Result<()> {
        (self)(req, out).await
    }
}

/// One name-indexed handler map. Lookups vastly outnumber
/// registrations, hence the reader-writer lock.
struct Registry<H: ?Sized> {
    map: RwLock<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> Registry<H> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, name: &str, handler: Arc<H>) {
        self.map
            .write()
            .unwrap()
            .insert(name.to_string(), handler);
    }

    fn get(&self, name: &str) -> Option<Arc<H>> {
        self.map.read().unwrap().get(name).cloned()
    }

    fn remove(&self, name: &str) {
        self.map.write().unwrap().remove(name);
    }

    fn contains(&self, name: &str) -> bool {
        self.map.read().unwrap().contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Typed dispatch from model name to handler, one registry per family.
///
/// `route_*` returns false when the name is unknown; otherwise the
/// handler runs on a fresh task and the call returns immediately.
pub struct ModelRouter {
    chat: Registry<dyn ChatHandler>,
    embedding: Registry<dyn EmbeddingHandler>,
    asr: Registry<dyn AsrHandler>,
    tts: Registry<dyn TtsHandler>,
    image: Registry<dyn ImageHandler>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self {
            chat: Registry::new(),
            embedding: Registry::new(),
            asr: Registry::new(),
            tts: Registry::new(),
            image: Registry::new(),
        }
    }

    pub fn register_chat(&self, name: &str, handler: impl ChatHandler) {
        self.chat.insert(name, Arc::new(handler));
    }

    pub fn register_embedding(&self, name: &str, handler: impl EmbeddingHandler) {
        self.embedding.insert(name, Arc::new(handler));
    }

    pub fn register_asr(&self, name: &str, handler: impl AsrHandler) {
        self.asr.insert(name, Arc::new(handler));
    }

    pub fn register_tts(&self, name: &str, handler: impl TtsHandler) {
        self.tts.insert(name, Arc::new(handler));
    }

    pub fn register_image(&self, name: &str, handler: impl ImageHandler) {
        self.image.insert(name, Arc::new(handler));
    }

    pub fn route_chat(&self, req: ChatRequest, out: Arc<StreamChannel>) -> bool {
        let Some(handler) = self.chat.get(&req.model) else {
            return false;
        };
        let handler_out = out.clone();
        dispatch(req.model.clone(), out, async move {
            handler.handle(req, handler_out).await
        });
        true
    }

    pub fn route_embedding(&self, req: EmbeddingRequest, out: Arc<StreamChannel>) -> bool {
        let Some(handler) = self.embedding.get(&req.model) else {
            return false;
        };
        let handler_out = out.clone();
        dispatch(req.model.clone(), out, async move {
            handler.handle(req, handler_out).await
        });
        true
    }

    pub fn route_asr(&self, req: AsrRequest, out: Arc<StreamChannel>) -> bool {
        let Some(handler) = self.asr.get(&req.model) else {
            return false;
        };
        let handler_out = out.clone();
        dispatch(req.model.clone(), out, async move {
            handler.handle(req, handler_out).await
        });
        true
    }

    pub fn route_tts(&self, req: TtsRequest, out: Arc<StreamChannel>) -> bool {
        let Some(handler) = self.tts.get(&req.model) else {
            return false;
        };
        let handler_out = out.clone();
        dispatch(req.model.clone(), out, async move {
            handler.handle(req, handler_out).await
        });
        true
    }

    pub fn route_image(&self, req: ImageGenRequest, out: Arc<StreamChannel>) -> bool {
        let Some(handler) = self.image.get(&req.model) else {
            return false;
        };
        let handler_out = out.clone();
        dispatch(req.model.clone(), out, async move {
            handler.handle(req, handler_out).await
        });
        true
    }

    pub fn has_chat_model(&self, name: &str) -> bool {
        self.chat.contains(name)
    }

    pub fn has_embedding_model(&self, name: &str) -> bool {
        self.embedding.contains(name)
    }

    pub fn has_asr_model(&self, name: &str) -> bool {
        self.asr.contains(name)
    }

    pub fn has_tts_model(&self, name: &str) -> bool {
        self.tts.contains(name)
    }

    pub fn has_image_model(&self, name: &str) -> bool {
        self.image.contains(name)
    }

    /// True when the name is registered in any family.
    pub fn has_model(&self, name: &str) -> bool {
        self.family_of(name).is_some()
    }

    pub fn family_of(&self, name: &str) -> Option<ModelFamily> {
        if self.chat.contains(name) {
            Some(ModelFamily::Chat)
        } else if self.embedding.contains(name) {
            Some(ModelFamily::Embedding)
        } else if self.asr.contains(name) {
            Some(ModelFamily::Asr)
        } else if self.tts.contains(name) {
            Some(ModelFamily::Tts)
        } else if self.image.contains(name) {
            Some(ModelFamily::Image)
        } else {
            None
        }
    }

    pub fn list_chat_models(&self) -> Vec<String> {
        self.chat.names()
    }

    pub fn list_embedding_models(&self) -> Vec<String> {
        self.embedding.names()
    }

    pub fn list_asr_models(&self) -> Vec<String> {
        self.asr.names()
    }

    pub fn list_tts_models(&self) -> Vec<String> {
        self.tts.names()
    }

    pub fn list_image_models(&self) -> Vec<String> {
        self.image.names()
    }

    /// Union of every family, deduplicated and sorted.
    pub fn list_all_models(&self) -> Vec<String> {
        let mut all = self.chat.names();
        all.extend(self.embedding.names());
        all.extend(self.asr.names());
        all.extend(self.tts.names());
        all.extend(self.image.names());
        all.sort();
        all.dedup();
        all
    }

    /// Every registration as (family, name), used when replaying local
    /// models to a master at worker startup.
    pub fn registered_models(&self) -> Vec<(ModelFamily, String)> {
        let mut out = Vec::new();
        out.extend(self.chat.names().into_iter().map(|n| (ModelFamily::Chat, n)));
        out.extend(
            self.embedding
                .names()
                .into_iter()
                .map(|n| (ModelFamily::Embedding, n)),
        );
        out.extend(self.asr.names().into_iter().map(|n| (ModelFamily::Asr, n)));
        out.extend(self.tts.names().into_iter().map(|n| (ModelFamily::Tts, n)));
        out.extend(self.image.names().into_iter().map(|n| (ModelFamily::Image, n)));
        out
    }

    pub fn unregister_chat(&self, name: &str) {
        self.chat.remove(name);
    }

    pub fn unregister_embedding(&self, name: &str) {
        self.embedding.remove(name);
    }

    pub fn unregister_asr(&self, name: &str) {
        self.asr.remove(name);
    }

    pub fn unregister_tts(&self, name: &str) {
        self.tts.remove(name);
    }

    pub fn unregister_image(&self, name: &str) {
        self.image.remove(name);
    }

    /// Remove a name from every family.
    pub fn unregister_model(&self, name: &str) {
        self.chat.remove(name);
        self.embedding.remove(name);
        self.asr.remove(name);
        self.tts.remove(name);
        self.image.remove(name);
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a handler future on a fresh task. A failing handler is trapped
/// here and converted into a terminal `model_error` event so the
/// consumer always observes a terminated channel.
fn dispatch<Fut>(model: String, out: Arc<StreamChannel>, fut: Fut)
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = fut.await {
            warn!(model = %model, error = %err, "model handler failed");
            out.push(OutputChunk::error("model_error", err.to_string()));
            out.end();
        }
    });
}
