//! Persistence seam for the shared store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use wildmatch::WildMatch;

use crate::error::OrchestratorErr;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedEntry {
    pub key: String,
    pub value: serde_json::Value,
    /// Token of the current lock holder, if the key is locked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Key/value storage with advisory locks. Each call is atomic; a backend must
/// refuse `write`/`delete` from anyone but the live lock holder.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<SharedEntry>>;

    async fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Returns whether a value was removed.
    async fn delete(&self, key: &str, token: Option<&str>) -> Result<bool>;

    /// Keys matching a shell-style glob, sorted.
    async fn list(&self, pattern: &str) -> Result<Vec<String>>;

    /// Takes the lock on `key` for `lease` and returns its token.
    async fn lock(&self, key: &str, lease: Duration) -> Result<String>;

    async fn unlock(&self, key: &str, token: &str) -> Result<()>;
}

struct Stored {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

struct Lease {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    values: HashMap<String, Stored>,
    locks: HashMap<String, Lease>,
}

impl Tables {
    /// Live lock token on `key`, dropping an expired lease on the way.
    fn holder(&mut self, key: &str, now: DateTime<Utc>) -> Option<&str> {
        if self
            .locks
            .get(key)
            .is_some_and(|lease| lease.expires_at <= now)
        {
            tracing::debug!(key, "lock lease expired");
            self.locks.remove(key);
        }
        self.locks.get(key).map(|lease| lease.token.as_str())
    }

    fn check_holder(&mut self, key: &str, token: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        match self.holder(key, now) {
            Some(holder) if Some(holder) != token => Err(OrchestratorErr::LockConflict {
                key: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn live_value(&mut self, key: &str, now: DateTime<Utc>) -> Option<&Stored> {
        if self
            .values
            .get(key)
            .is_some_and(|stored| stored.expires_at.is_some_and(|at| at <= now))
        {
            self.values.remove(key);
        }
        self.values.get(key)
    }
}

/// Process-local backend.
#[derive(Default)]
pub struct InMemoryBackend {
    tables: Mutex<Tables>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for InMemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<SharedEntry>> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let lock_token = tables.holder(key, now).map(str::to_string);
        Ok(tables.live_value(key, now).map(|stored| SharedEntry {
            key: key.to_string(),
            value: stored.value.clone(),
            lock_token,
            expires_at: stored.expires_at,
        }))
    }

    async fn write(
        &self,
        key: &str,
        value: serde_json::Value,
        token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        tables.check_holder(key, token, now)?;
        tables
            .values
            .insert(key.to_string(), Stored { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str, token: Option<&str>) -> Result<bool> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        tables.check_holder(key, token, now)?;
        let existed = tables.live_value(key, now).is_some();
        tables.values.remove(key);
        Ok(existed)
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let pattern = WildMatch::new(pattern);
        let tables = self.tables.lock().await;
        let mut keys: Vec<String> = tables
            .values
            .iter()
            .filter(|(_, stored)| stored.expires_at.is_none_or(|at| at > now))
            .map(|(key, _)| key)
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn lock(&self, key: &str, lease: Duration) -> Result<String> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|err| OrchestratorErr::Validation(format!("lock lease out of range: {err}")))?;
        let mut tables = self.tables.lock().await;
        if tables.holder(key, now).is_some() {
            return Err(OrchestratorErr::LockConflict {
                key: key.to_string(),
            });
        }
        let token = uuid::Uuid::new_v4().to_string();
        tables.locks.insert(
            key.to_string(),
            Lease {
                token: token.clone(),
                expires_at: now + lease,
            },
        );
        Ok(token)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        if tables.holder(key, now) != Some(token) {
            return Err(OrchestratorErr::LockConflict {
                key: key.to_string(),
            });
        }
        tables.locks.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn non_holder_cannot_mutate_locked_key() {
        let backend = InMemoryBackend::new();
        backend.write("plan", json!(1), None, None).await.unwrap();
        let token = backend.lock("plan", LEASE).await.unwrap();

        let err = backend.write("plan", json!(2), None, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorErr::LockConflict { .. }));
        let err = backend.delete("plan", Some("forged")).await.unwrap_err();
        assert!(matches!(err, OrchestratorErr::LockConflict { .. }));

        backend
            .write("plan", json!(3), Some(token.as_str()), None)
            .await
            .unwrap();
        let entry = backend.read("plan").await.unwrap().unwrap();
        assert_eq!(entry.value, json!(3));
        assert_eq!(entry.lock_token.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn unlock_requires_matching_token() {
        let backend = InMemoryBackend::new();
        let token = backend.lock("k", LEASE).await.unwrap();
        assert!(backend.lock("k", LEASE).await.is_err());
        assert!(backend.unlock("k", "wrong").await.is_err());

        backend.unlock("k", &token).await.unwrap();
        assert!(backend.lock("k", LEASE).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lease_frees_the_key() {
        let backend = InMemoryBackend::new();
        backend
            .lock("k", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        backend.write("k", json!("free"), None, None).await.unwrap();
        assert!(backend.lock("k", LEASE).await.is_ok());
    }

    #[tokio::test]
    async fn list_filters_by_glob_and_expiry() {
        let backend = InMemoryBackend::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        backend.write("context/a", json!(1), None, None).await.unwrap();
        backend.write("context/b", json!(2), None, Some(past)).await.unwrap();
        backend.write("lock/plan", json!(3), None, None).await.unwrap();

        assert_eq!(backend.list("context/*").await.unwrap(), vec!["context/a"]);
        assert_eq!(backend.list("*").await.unwrap().len(), 2);
        assert_eq!(backend.read("context/b").await.unwrap(), None);
    }
}
