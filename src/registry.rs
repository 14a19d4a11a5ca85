//! Pooled connections keyed by resolved connection identity.
//!
//! The registry is an explicit object shared by every adapter that should
//! reuse connections. Equal identities always get the same [`RemotePool`].

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::config::{ConnectionIdentity, redact};
use crate::error::{AdapterError, AdapterResult};
use crate::transpiler::Dialect;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Registry of remote pools.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use extpg::config::ConnectionIdentity;
/// use extpg::registry::ConnectionRegistry;
///
/// # tokio_test_block(async {
/// let registry = ConnectionRegistry::new().with_max_connections(1);
/// let a = registry.acquire(&ConnectionIdentity::url("sqlite::memory:")).await.unwrap();
/// let b = registry.acquire(&ConnectionIdentity::url("sqlite::memory:")).await.unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct ConnectionRegistry {
    pools: DashMap<String, Arc<RemotePool>>,
    max_connections: u32,
    env: EnvLookup,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            env: Arc::new(|key: &str| std::env::var(key).ok()),
        }
    }

    /// Pool size for pools created from now on.
    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }

    /// Replace the environment lookup used for password fallback.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Resolve `identity` to its connection string.
    pub fn resolve(&self, identity: &ConnectionIdentity) -> AdapterResult<String> {
        identity.resolve(&*self.env)
    }

    /// Get the pool for `identity`, creating it on first use.
    ///
    /// The pool connects lazily, so an unreachable server shows up as a
    /// connection error on the first statement. Malformed identities fail
    /// here and leave nothing cached.
    pub async fn acquire(&self, identity: &ConnectionIdentity) -> AdapterResult<Arc<RemotePool>> {
        let url = self.resolve(identity)?;
        let entry = self
            .pools
            .entry(url.clone())
            .or_try_insert_with(|| RemotePool::connect(&url, self.max_connections).map(Arc::new))?;
        Ok(Arc::clone(entry.value()))
    }

    /// Number of distinct pools created so far.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("pools", &self.pools.len())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// One pooled connection to a remote database.
pub struct RemotePool {
    key: String,
    dialect: Dialect,
    pool: AnyPool,
    locks: EntityLocks,
}

impl RemotePool {
    fn connect(url: &str, max_connections: u32) -> AdapterResult<Self> {
        let dialect = Dialect::from_url(url).ok_or_else(|| {
            AdapterError::config(format!(
                "unsupported connection scheme in '{}'; expected postgresql:// or sqlite:",
                redact(url)
            ))
        })?;
        sqlx::any::install_default_drivers();

        let mut options = AnyPoolOptions::new().max_connections(max_connections);
        if dialect == Dialect::Sqlite {
            // An in-memory database lives as long as its connection.
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options
            .connect_lazy(url)
            .map_err(|e| AdapterError::config(format!("{}: {}", redact(url), e)))?;

        info!(url = %redact(url), max_connections, ?dialect, "created connection pool");
        Ok(Self {
            key: url.to_string(),
            dialect,
            pool,
            locks: EntityLocks::default(),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// Redacted connection string this pool was created for.
    pub fn display_key(&self) -> String {
        redact(&self.key)
    }
}

impl fmt::Debug for RemotePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePool")
            .field("key", &self.display_key())
            .field("dialect", &self.dialect)
            .finish()
    }
}

type LockKey = (String, String);

/// Async mutexes serializing writes to one entity of one table.
///
/// An entry lives only while some task holds or waits for it.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    /// Wait for exclusive access to `key` in `table`.
    pub async fn lock(&self, table: &str, key: &str) -> EntityGuard {
        let key = (table.to_string(), key.to_string());
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        EntityGuard {
            guard: Some(guard),
            key,
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of entities currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one entity, released on drop.
pub struct EntityGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: LockKey,
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the mutex, so only an idle entry is removed.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl fmt::Debug for EntityGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityGuard").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_identity_same_pool() {
        let registry = ConnectionRegistry::new().with_max_connections(1);
        let a = registry.acquire(&ConnectionIdentity::url("sqlite::memory:")).await.unwrap();
        let b = registry.acquire(&ConnectionIdentity::url("sqlite::memory:")).await.unwrap();
        let c = registry
            .acquire(&ConnectionIdentity::url("sqlite::memory:?cache=private"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_structured_identity_normalizes_to_same_key() {
        let registry = ConnectionRegistry::new().with_env(|key| {
            (key == "SC_EXTPG_PASS_mydb").then(|| "secret".to_string())
        });
        let explicit = ConnectionIdentity::url("postgresql://u:secret@h:5432/mydb");
        let params = ConnectionIdentity::params("h", "u", "mydb");
        assert!(registry.resolve(&params).unwrap().contains("secret"));
        let a = registry.acquire(&explicit).await.unwrap();
        let b = registry.acquire(&params).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.dialect(), Dialect::Postgres);
        assert!(!format!("{:?}", a).contains("secret"));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_not_cached() {
        let registry = ConnectionRegistry::new();
        let err = registry
            .acquire(&ConnectionIdentity::url("mysql://u@h/db"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_entity_locks_serialize() {
        let locks = Arc::new(EntityLocks::default());
        let guard = locks.lock("t", "1").await;
        let other = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = other.lock("t", "1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        let _unrelated = locks.lock("t", "2").await;
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_entity_locks_released_entries_removed() {
        let locks = Arc::new(EntityLocks::default());
        for key in 0..100 {
            let _g = locks.lock("t", &key.to_string()).await;
        }
        assert!(locks.is_empty());

        let guard = locks.lock("t", "1").await;
        let other = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = other.lock("t", "1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        // Kept for the waiter, which has not run yet.
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
