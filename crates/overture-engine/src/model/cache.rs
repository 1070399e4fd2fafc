//! Fingerprint-keyed model-client cache.
//!
//! Client construction can be expensive (connection pools, warm TLS), so
//! configured clients are reused across requests for as long as their
//! configuration is unchanged.  The key is a short SHA-256 fingerprint over
//! the resolved connection settings plus the streaming flag.  Configuration
//! changes invalidate the whole cache; there is no per-field invalidation
//! because configuration is not addressed per-field.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ring::digest;

use crate::error::Result;
use crate::model::{ClientFactory, ModelClient, ModelConfig};

/// Resolves a scenario name (e.g. `"llm"`) to connection configuration.
pub trait ModelResolver: Send + Sync {
    /// Resolve the configuration for `scenario`.
    fn resolve(&self, scenario: &str) -> Result<ModelConfig>;
}

/// The only resource shared across concurrent requests: a read-mostly map of
/// configured clients with insert-if-absent semantics.
pub struct ModelCache {
    resolver: Arc<dyn ModelResolver>,
    factory: Arc<dyn ClientFactory>,
    clients: Mutex<HashMap<String, Arc<dyn ModelClient>>>,
}

impl ModelCache {
    /// Create an empty cache.
    pub fn new(resolver: Arc<dyn ModelResolver>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            resolver,
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Get the cached client for `scenario`, building one on fingerprint miss.
    pub fn get_instance(&self, scenario: &str, streaming: bool) -> Result<Arc<dyn ModelClient>> {
        let config = self.resolver.resolve(scenario)?;
        let key = fingerprint(&config, streaming);

        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            tracing::debug!(scenario, fingerprint = %key, "model client reused");
            return Ok(Arc::clone(client));
        }

        let client = self.factory.build(&config, streaming)?;
        tracing::info!(
            scenario,
            model = %config.model,
            streaming,
            fingerprint = %key,
            "model client created"
        );
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Drop every cached client.  Call after any configuration change.
    pub fn invalidate_all(&self) {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        tracing::info!("model client cache cleared");
    }

    /// Number of cached clients (for diagnostics and tests).
    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Short hash over the connection settings that identify a client.
fn fingerprint(config: &ModelConfig, streaming: bool) -> String {
    let raw = format!(
        "{}|{}|{}|{}|{}|{}",
        config.api_base, config.api_key, config.model, config.temperature, config.max_tokens,
        streaming
    );
    let hash = digest::digest(&digest::SHA256, raw.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
