//! Resolver Service: fan out a single request across the registry
//! in name order, honor the provider filter and each plugin's pattern,
//! and return the first successful envelope.
//!
//! The core loop is written once in its list-valued form (see
//! `DESIGN.md`'s Open Question decision): it walks every matching
//! candidate and stops at the first success, which is exactly what a
//! single-envelope `get_secret` needs — [`ResolverService::get_secret`]
//! *is* that adapter, not a second implementation.

use std::time::{SystemTime, UNIX_EPOCH};

use secrets_id::{Identifier, Pattern};
use secrets_proto::{EngineError, Secret};
use secrets_registry::Registry;
use secrets_runtime::PluginRuntime;

/// A client's request for one secret, optionally pinned to a specific
/// provider.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Identifier,
    pub provider: Option<String>,
}

impl Request {
    pub fn new(id: Identifier) -> Self {
        Request { id, provider: None }
    }

    pub fn for_provider(id: Identifier, provider: impl Into<String>) -> Self {
        Request {
            id,
            provider: Some(provider.into()),
        }
    }
}

#[derive(Clone)]
pub struct ResolverService {
    registry: Registry,
}

impl ResolverService {
    pub fn new(registry: Registry) -> Self {
        ResolverService { registry }
    }

    /// Resolve one request. Iterates the registry in its (name-ordered)
    /// iteration order; for each candidate:
    /// - a `provider` filter that doesn't match the plugin's name skips it;
    /// - a plugin pattern that doesn't match the request id skips it;
    /// - any other error is recorded and fan-out continues;
    /// - the first success wins: `provider` is stamped with the
    ///   resolving plugin's name (overriding whatever it set) and
    ///   `resolved_at` is filled with wall-clock UTC if the plugin left
    ///   it zero.
    ///
    /// Returns `NotFound` if no plugin ever matched or every match
    /// itself reported "not found"; otherwise the joined errors from
    /// every plugin that was tried and failed some other way.
    pub async fn get_secret(&self, request: Request) -> Result<Secret, EngineError> {
        let mut errors = Vec::new();

        for runtime in self.registry.iter() {
            let metadata = runtime.metadata();

            if let Some(provider) = &request.provider {
                if metadata.name() != provider.as_str() {
                    continue;
                }
            }

            let plugin_pattern = match Pattern::new(metadata.pattern()) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(format!("{}: malformed pattern: {e}", metadata.name()));
                    continue;
                }
            };
            if !plugin_pattern.matches(&request.id) {
                continue;
            }

            match runtime.get_secrets(std::slice::from_ref(&request.id)).await {
                Ok(mut secrets) => {
                    if let Some(mut secret) = secrets.pop() {
                        secret.set_provider(metadata.name().to_string());
                        if secret.resolved_at_unix_ms() == 0 {
                            secret.set_resolved_at_unix_ms(now_unix_ms());
                        }
                        return Ok(secret);
                    }
                    errors.push(format!("{}: returned no secret for {}", metadata.name(), request.id));
                }
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => {
                    log::warn!("{}: {} while resolving {}", metadata.name(), e, request.id);
                    errors.push(format!("{}: {e}", metadata.name()));
                }
            }
        }

        if errors.is_empty() {
            Err(EngineError::NotFound(format!("secret not found: {}", request.id)))
        } else {
            Err(EngineError::Internal(errors.join("; ")))
        }
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
