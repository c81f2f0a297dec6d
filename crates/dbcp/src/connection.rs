//! Connections with a per-connection statement cache.

use std::sync::Arc;

use crate::cache::StatementCache;
use crate::error::Result;
use crate::key::{StatementKey, StatementMethod};
use crate::pool::PoolConfig;
use crate::proxy::{ProxySettings, StatementProxy, prepare_cached};
use crate::statement::Connection;

/// A raw connection whose statements are handed out as proxies.
///
/// With a statement cache, closing a proxy keeps the raw statement for the
/// next caller preparing the same key. Without one, every statement is
/// really closed on close.
pub struct CachingConnection<C: Connection> {
    connection: C,
    cache: Option<Arc<StatementCache<C::Statement>>>,
    settings: ProxySettings,
}

impl<C: Connection> CachingConnection<C> {
    /// Wrap `connection` using the pool's statement cache and logging settings.
    pub fn new(connection: C, config: &PoolConfig) -> Self {
        let cache = config
            .statement_caching()
            .then(|| Arc::new(StatementCache::new(config.statement_cache_max_size)));
        Self {
            connection,
            cache,
            settings: ProxySettings::from_config(config),
        }
    }

    /// Wrap `connection` with explicit settings; a zero capacity disables caching.
    pub fn with_settings(connection: C, cache_capacity: usize, settings: ProxySettings) -> Self {
        Self {
            connection,
            cache: (cache_capacity > 0).then(|| Arc::new(StatementCache::new(cache_capacity))),
            settings,
        }
    }

    /// Obtain a statement for `key`.
    pub async fn prepare(&self, key: StatementKey) -> Result<StatementProxy<C::Statement>> {
        prepare_cached(&self.connection, self.cache.as_ref(), key, &self.settings).await
    }

    /// Obtain a prepared statement for `sql`.
    pub async fn prepare_statement(
        &self,
        sql: impl Into<String>,
    ) -> Result<StatementProxy<C::Statement>> {
        self.prepare(StatementKey::prepared(sql)).await
    }

    /// Obtain a plain statement for `sql`.
    pub async fn create_statement(
        &self,
        sql: impl Into<String>,
    ) -> Result<StatementProxy<C::Statement>> {
        self.prepare(StatementKey::new(sql, StatementMethod::Create, Vec::new()))
            .await
    }

    /// Obtain a stored procedure call for `sql`.
    pub async fn prepare_call(
        &self,
        sql: impl Into<String>,
    ) -> Result<StatementProxy<C::Statement>> {
        self.prepare(StatementKey::new(sql, StatementMethod::PrepareCall, Vec::new()))
            .await
    }

    /// Drop every cached statement, closing those not in use.
    ///
    /// Statements in use are closed when their proxy is closed.
    pub async fn close_statements(&self) {
        if let Some(cache) = &self.cache {
            let cached = cache.len();
            cache.close_all().await;
            tracing::debug!(cached, "Closed cached statements");
        }
    }

    /// The raw connection.
    pub fn raw(&self) -> &C {
        &self.connection
    }

    /// The statement cache, when caching is enabled.
    pub fn cache(&self) -> Option<&Arc<StatementCache<C::Statement>>> {
        self.cache.as_ref()
    }

    /// Settings shared by this connection's proxies.
    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }
}

impl<C: Connection> std::fmt::Debug for CachingConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingConnection")
            .field("cache", &self.cache)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::Statement;
    use crate::testing::MockConnection;

    fn config(cache: usize) -> PoolConfig {
        PoolConfig {
            statement_cache_max_size: cache,
            log_query_execution_longer_than_ms: -1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cache_follows_config() {
        let cached = CachingConnection::new(MockConnection::new(), &config(4));
        assert_eq!(cached.cache().map(|c| c.capacity()), Some(4));
        let uncached = CachingConnection::new(MockConnection::new(), &config(0));
        assert!(uncached.cache().is_none());
    }

    #[tokio::test]
    async fn methods_are_cached_separately() {
        let conn = CachingConnection::new(MockConnection::new(), &config(4));
        conn.prepare_statement("SELECT 1").await.unwrap().close().await.unwrap();
        conn.create_statement("SELECT 1").await.unwrap().close().await.unwrap();
        conn.prepare_call("SELECT 1").await.unwrap().close().await.unwrap();
        assert_eq!(conn.raw().prepare_calls(), 3);
        assert_eq!(conn.cache().map(|c| c.len()), Some(3));

        conn.prepare_statement("SELECT 1").await.unwrap().close().await.unwrap();
        assert_eq!(conn.raw().prepare_calls(), 3);
    }

    #[tokio::test]
    async fn close_statements_closes_idle_ones() {
        let conn = CachingConnection::new(MockConnection::new(), &config(4));
        let idle = conn.prepare_statement("SELECT 1").await.unwrap();
        let idle_target = Arc::clone(idle.target());
        idle.close().await.unwrap();
        let busy = conn.prepare_statement("SELECT 2").await.unwrap();

        conn.close_statements().await;
        assert_eq!(idle_target.close_calls(), 1);
        assert_eq!(busy.target().close_calls(), 0);
        assert_eq!(conn.cache().map(|c| c.len()), Some(0));

        busy.close().await.unwrap();
        assert_eq!(busy.target().close_calls(), 1);
    }
}
