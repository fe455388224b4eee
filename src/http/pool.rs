//! Per-origin connection pooling
//!
//! One lazily-created reqwest client per `scheme://host[:port]` origin,
//! shared by every call to that origin in the process. reqwest bounds idle
//! keep-alive connections; total in-flight requests per origin are bounded
//! by a semaphore. The pool also owns the service-name -> circuit-breaker
//! map so workflows hitting the same service share one health signal.

use crate::error::{FlowError, Result};
use crate::http::breaker::{CircuitBreaker, CircuitBreakerConfig};
use reqwest::{Client, Method, RequestBuilder, Response};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Connection pool limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum in-flight connections per origin
    pub max_connections: usize,
    /// Maximum idle keep-alive connections per origin
    pub max_keepalive_connections: usize,
    /// How long idle connections are kept alive
    pub keepalive_expiry: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_keepalive_connections: 20,
            keepalive_expiry: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct PooledClient {
    client: Client,
    permits: Arc<tokio::sync::Semaphore>,
}

/// Shared pool of per-origin HTTP clients and per-service circuit breakers.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    breaker_config: CircuitBreakerConfig,
    clients: Mutex<HashMap<String, PooledClient>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default(), CircuitBreakerConfig::default())
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breaker_config,
            clients: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Origin key (`scheme://host[:port]`) for a URL.
    pub fn origin_of(url: &str) -> Result<String> {
        let parsed = Url::parse(url)
            .map_err(|e| FlowError::Transport(format!("invalid URL '{url}': {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FlowError::Transport(format!("URL '{url}' has no host")))?;
        Ok(match parsed.port() {
            Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
            None => format!("{}://{host}", parsed.scheme()),
        })
    }

    fn client_for(&self, url: &str) -> Result<PooledClient> {
        let origin = Self::origin_of(url)?;
        let mut clients = self.clients.lock().expect("pool lock poisoned");
        if let Some(existing) = clients.get(&origin) {
            return Ok(existing.clone());
        }

        let client = Client::builder()
            .user_agent(format!("apiflow/{}", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(self.config.max_keepalive_connections)
            .pool_idle_timeout(self.config.keepalive_expiry)
            .build()
            .map_err(|e| FlowError::Transport(format!("failed to build HTTP client: {e}")))?;
        let pooled = PooledClient {
            client,
            permits: Arc::new(tokio::sync::Semaphore::new(self.config.max_connections)),
        };
        debug!(origin = %origin, "created pooled HTTP client");
        clients.insert(origin, pooled.clone());
        Ok(pooled)
    }

    /// Get or create the circuit breaker for a service name.
    pub fn breaker_for(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("pool lock poisoned");
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service = %service, "created circuit breaker");
                Arc::new(CircuitBreaker::new(service, self.breaker_config.clone()))
            })
            .clone()
    }

    /// Execute a request against a pooled client.
    ///
    /// `configure` customizes the builder (headers, body, timeout). When a
    /// `service` name is given the send is wrapped in that service's circuit
    /// breaker.
    pub async fn request<F>(
        &self,
        method: Method,
        url: &str,
        service: Option<&str>,
        configure: F,
    ) -> Result<Response>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let pooled = self.client_for(url)?;
        let _permit = pooled
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FlowError::Execution("connection pool closed".to_string()))?;

        let builder = configure(pooled.client.request(method, url));
        let request = builder
            .build()
            .map_err(|e| FlowError::Transport(format!("failed to build request: {e}")))?;
        let client = pooled.client.clone();

        match service {
            Some(name) => {
                let breaker = self.breaker_for(name);
                breaker
                    .call(|| async { send(&client, request).await })
                    .await
            }
            None => send(&client, request).await,
        }
    }

    /// Close the pool: drop every client and breaker.
    pub fn close(&self) {
        self.clients.lock().expect("pool lock poisoned").clear();
        self.breakers.lock().expect("pool lock poisoned").clear();
        debug!("connection pool closed");
    }
}

/// Send a request, converting transport failures and 5xx responses into
/// typed errors. Server errors are classified here, inside the breaker
/// wrapper, so a failing service counts against its circuit; 4xx responses
/// pass through (the service is healthy, the request is wrong).
async fn send(client: &Client, request: reqwest::Request) -> Result<Response> {
    let response = client.execute(request).await.map_err(map_send_error)?;
    let status = response.status();
    if status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        let body = if body.trim().is_empty() {
            "no response body".to_string()
        } else {
            body
        };
        return Err(FlowError::Server {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Map a reqwest transport error to the typed taxonomy.
pub(crate) fn map_send_error(e: reqwest::Error) -> FlowError {
    if e.is_timeout() {
        FlowError::Timeout(format!("request timed out: {e}"))
    } else {
        FlowError::Transport(format!("{e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of() {
        assert_eq!(
            ConnectionPool::origin_of("https://api.example.com/v1/run").unwrap(),
            "https://api.example.com"
        );
        assert_eq!(
            ConnectionPool::origin_of("http://localhost:8080/jobs/1").unwrap(),
            "http://localhost:8080"
        );
        assert!(ConnectionPool::origin_of("not a url").is_err());
    }

    #[test]
    fn test_client_reuse_per_origin() {
        let pool = ConnectionPool::default();
        let a = pool.client_for("https://api.example.com/a").unwrap();
        let b = pool.client_for("https://api.example.com/b").unwrap();
        // Same origin shares one semaphore
        assert!(Arc::ptr_eq(&a.permits, &b.permits));

        let c = pool.client_for("https://other.example.com/a").unwrap();
        assert!(!Arc::ptr_eq(&a.permits, &c.permits));
    }

    #[test]
    fn test_breaker_shared_per_service() {
        let pool = ConnectionPool::default();
        let a = pool.breaker_for("replicate");
        let b = pool.breaker_for("replicate");
        assert!(Arc::ptr_eq(&a, &b));

        let c = pool.breaker_for("openai");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_close_clears_state() {
        let pool = ConnectionPool::default();
        pool.client_for("https://api.example.com/a").unwrap();
        pool.breaker_for("svc");
        pool.close();
        assert!(pool.clients.lock().unwrap().is_empty());
        assert!(pool.breakers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_limits() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_keepalive_connections, 20);
        assert_eq!(config.keepalive_expiry, Duration::from_secs(5));
    }
}
