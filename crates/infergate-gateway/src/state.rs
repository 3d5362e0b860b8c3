use std::sync::Arc;
use std::time::Duration;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use infergate_common::{ApiError, GatewayConfig, StreamChannel};
use infergate_router::ModelRouter;

/// Bounded admission: at most `max` requests hold a slot at once.
/// Acquire waits up to the configured timeout for a permit; the owned
/// permit releases the slot on drop, on every exit path.
pub struct ConcurrencySlots {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencySlots {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub async fn acquire(&self, wait: Duration) -> Option<OwnedSemaphorePermit> {
        tokio::time::timeout(wait, self.semaphore.clone().acquire_owned())
            .await
            .ok()
            .and_then(Result::ok)
    }

    pub fn in_use(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Shared state behind every public endpoint.
pub struct GatewayState {
    pub router: Arc<ModelRouter>,
    pub config: GatewayConfig,
    pub slots: ConcurrencySlots,
}

impl GatewayState {
    pub fn new(router: Arc<ModelRouter>, config: GatewayConfig) -> Arc<Self> {
        let slots = ConcurrencySlots::new(config.max_concurrency);
        Arc::new(Self {
            router,
            config,
            slots,
        })
    }

    /// Accepts `Authorization: Bearer <key>` or the bare key. Open when
    /// no key is configured.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if self.config.api_key.is_empty() {
            return Ok(());
        }
        let header = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let provided = header.strip_prefix("Bearer ").unwrap_or(header);
        if provided == self.config.api_key {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    /// Fresh per-request stream channel with the configured timeout.
    pub fn new_channel(&self) -> Arc<StreamChannel> {
        Arc::new(StreamChannel::new(self.config.default_timeout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn state_with_key(key: &str) -> Arc<GatewayState> {
        let config = GatewayConfig {
            api_key: key.to_string(),
            ..GatewayConfig::default()
        };
        GatewayState::new(Arc::new(ModelRouter::new()), config)
    }

    #[tokio::test]
    async fn slots_block_when_saturated() {
        let slots = ConcurrencySlots::new(1);
        let held = slots.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(slots.in_use(), 1);
        assert!(slots.acquire(Duration::from_millis(50)).await.is_none());
        drop(held);
        assert!(slots.acquire(Duration::from_millis(10)).await.is_some());
    }

    #[test]
    fn authorize_accepts_bearer_and_bare() {
        let state = state_with_key("sk-123");
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-123"));
        assert!(state.authorize(&headers).is_ok());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("sk-123"));
        assert!(state.authorize(&headers).is_ok());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(state.authorize(&headers).is_err());

        headers.remove(AUTHORIZATION);
        assert!(state.authorize(&headers).is_err());
    }

    #[test]
    fn authorize_open_without_key() {
        let state = state_with_key("");
        assert!(state.authorize(&HeaderMap::new()).is_ok());
    }
}
