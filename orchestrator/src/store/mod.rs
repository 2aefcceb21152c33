//! Shared coordination store: locked key/value memory plus context handoff
//! between agents.

mod backend;

pub use backend::InMemoryBackend;
pub use backend::SharedEntry;
pub use backend::StoreBackend;

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::ContextPackage;
use switchyard_protocol::ContextTier;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::StoreConfig;
use crate::error::OrchestratorErr;
use crate::error::Result;
use crate::events::EventEmitter;
use crate::signal::CONTEXT_SHARED;
use crate::signal::SignalProtocol;
use crate::truncation::ContextCompressor;

const CONTEXT_PREFIX: &str = "context/";

/// Options for [`SharedStore::share_context`].
#[derive(Debug, Clone, Default)]
pub struct ShareOptions {
    pub compress: bool,
    /// Tiers to keep; `None` keeps everything.
    pub filter: Option<Vec<ContextTier>>,
    /// Lifetime of the shared package; the store default when `None`.
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    pub id: String,
    pub source: String,
    pub target: String,
    pub package: ContextPackage,
    pub shared_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct SharedStore {
    backend: Arc<dyn StoreBackend>,
    signals: Arc<SignalProtocol>,
    events: EventEmitter,
    config: StoreConfig,
    expiry: TaskTracker,
    closed: CancellationToken,
}

impl SharedStore {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        signals: Arc<SignalProtocol>,
        events: EventEmitter,
        config: StoreConfig,
    ) -> Self {
        Self {
            backend,
            signals,
            events,
            config,
            expiry: TaskTracker::new(),
            closed: CancellationToken::new(),
        }
    }

    pub async fn read(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.backend.read(key).await?.map(|entry| entry.value))
    }

    /// Fails with `LockConflict` when another holder has the key locked.
    pub async fn write(&self, key: &str, value: serde_json::Value, token: Option<&str>) -> Result<()> {
        self.backend.write(key, value, token, None).await
    }

    pub async fn delete(&self, key: &str, token: Option<&str>) -> Result<bool> {
        self.backend.delete(key, token).await
    }

    pub async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        self.backend.list(pattern).await
    }

    /// Locks `key` for the configured lease.
    pub async fn lock(&self, key: &str) -> Result<String> {
        self.lock_for(key, self.config.lock_lease()).await
    }

    pub async fn lock_for(&self, key: &str, lease: Duration) -> Result<String> {
        let token = self.backend.lock(key, lease).await?;
        tracing::debug!(key, lease_ms = lease.as_millis() as u64, "lock acquired");
        Ok(token)
    }

    pub async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        self.backend.unlock(key, token).await
    }

    /// Stores `package` for `target`, schedules its removal after the TTL and
    /// signals the target. Returns the context id.
    pub async fn share_context(
        &self,
        source: &str,
        target: &str,
        package: ContextPackage,
        options: ShareOptions,
    ) -> Result<String> {
        let mut package = package;
        if let Some(keep) = options.filter.as_deref() {
            package.retain_tiers(keep);
        }
        if options.compress {
            let compressed = ContextCompressor::new(self.config.compress_budget_bytes).compress(&package);
            if compressed.changed() {
                tracing::debug!(
                    dropped_episodes = compressed.dropped_episodes,
                    truncated_fields = compressed.truncated_fields,
                    size_bytes = compressed.size_bytes,
                    "compressed shared context"
                );
            }
            package = compressed.package;
        }

        let ttl = options.ttl.unwrap_or_else(|| self.config.default_context_ttl());
        let shared_at = Utc::now();
        let expires_at = shared_at
            + chrono::Duration::from_std(ttl)
                .map_err(|err| OrchestratorErr::Validation(format!("context ttl out of range: {err}")))?;
        let id = uuid::Uuid::new_v4().to_string();
        let key = context_key(&id);
        let shared = SharedContext {
            id: id.clone(),
            source: source.to_string(),
            target: target.to_string(),
            package,
            shared_at,
            expires_at,
        };
        self.backend
            .write(&key, serde_json::to_value(&shared)?, None, Some(expires_at))
            .await?;
        self.schedule_expiry(key.clone(), ttl);

        self.signals
            .send(
                source,
                target,
                CONTEXT_SHARED,
                serde_json::json!({ "context_id": id, "key": key }),
            )
            .await;
        self.events.context_shared(&id, source, target);
        tracing::info!(context_id = %id, %source, %target, ttl_ms = ttl.as_millis() as u64, "context shared");
        Ok(id)
    }

    /// The shared package, or `None` once it has expired or was removed.
    pub async fn retrieve_context(&self, id: &str) -> Result<Option<ContextPackage>> {
        let Some(entry) = self.backend.read(&context_key(id)).await? else {
            return Ok(None);
        };
        let shared: SharedContext = serde_json::from_value(entry.value)?;
        if shared.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(shared.package))
    }

    /// Stops pending expiry timers. Entries already written stay readable
    /// until their own expiry.
    pub async fn close(&self) {
        self.closed.cancel();
        self.expiry.close();
        self.expiry.wait().await;
    }

    fn schedule_expiry(&self, key: String, ttl: Duration) {
        let backend = Arc::clone(&self.backend);
        let closed = self.closed.clone();
        self.expiry.spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {
                    if let Err(err) = backend.delete(&key, None).await {
                        tracing::debug!(%key, error = %err, "expired context left in place");
                    }
                }
            }
        });
    }
}

fn context_key(id: &str) -> String {
    format!("{CONTEXT_PREFIX}{id}")
}
