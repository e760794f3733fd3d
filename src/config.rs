//! # Cache Configuration
//!
//! Everything decided at startup: per-action cache policies, the registry
//! mapping `(controller, action)` pairs to those policies, local L1 caching
//! settings, and invalidation rules. All of it is validated while the
//! application is wiring itself up; a mistake here is a deployment problem
//! and is surfaced immediately rather than at request time.

use crate::key_generator::CacheKeyGenerator;
use crate::types::{CacheHeaders, ParameterDescriptor};
use crate::{OutputCacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Client and server expirations computed for one pass through the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTime {
    /// How long clients may reuse the response (`max-age`).
    pub client_ttl: Duration,

    /// Absolute point in time at which the server-side entry expires.
    pub absolute_expiration: DateTime<Utc>,
}

/// Caching behavior for a single registered action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    /// How long the response is cached on the server side.
    pub server_ttl: Duration,

    /// Corresponds to the Cache-Control max-age header.
    pub client_ttl: Duration,

    /// Corresponds to the Cache-Control no-cache header.
    pub no_cache: bool,

    /// Response may be cached by the browser but not by intermediaries.
    pub private: bool,

    /// Stale entries must be revalidated with the origin before reuse.
    pub must_revalidate: bool,

    /// Cache only when the caller is not authenticated.
    pub anonymous_only: bool,

    /// Suppress caching for this action entirely.
    pub suppress: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            server_ttl: Duration::from_secs(3600),
            client_ttl: Duration::ZERO,
            no_cache: false,
            private: false,
            must_revalidate: false,
            anonymous_only: false,
            suppress: false,
        }
    }
}

impl CachePolicy {
    pub fn new(server_ttl: Duration, client_ttl: Duration) -> Self {
        Self {
            server_ttl,
            client_ttl,
            ..Self::default()
        }
    }

    /// A policy that opts the action out of caching.
    pub fn suppressed() -> Self {
        Self {
            suppress: true,
            ..Self::default()
        }
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn with_must_revalidate(mut self, must_revalidate: bool) -> Self {
        self.must_revalidate = must_revalidate;
        self
    }

    pub fn with_anonymous_only(mut self, anonymous_only: bool) -> Self {
        self.anonymous_only = anonymous_only;
        self
    }

    /// Compute the expirations for a request passing through now.
    pub fn cache_time(&self, now: DateTime<Utc>) -> CacheTime {
        CacheTime {
            client_ttl: self.client_ttl,
            absolute_expiration: now + chrono::Duration::seconds(self.server_ttl.as_secs() as i64),
        }
    }

    /// Render the cache headers for an outgoing response.
    ///
    /// Applied on every response the cache touches, hit or miss.
    pub fn response_headers(&self, time: &CacheTime) -> CacheHeaders {
        if time.client_ttl > Duration::ZERO || self.must_revalidate || self.private {
            let mut directives = vec![format!("max-age={}", time.client_ttl.as_secs())];
            if self.must_revalidate {
                directives.push("must-revalidate".to_string());
            }
            if self.private {
                directives.push("private".to_string());
            }

            CacheHeaders {
                cache_control: Some(directives.join(", ")),
                pragma_no_cache: false,
            }
        } else if self.no_cache {
            CacheHeaders {
                cache_control: Some("no-cache".to_string()),
                pragma_no_cache: true,
            }
        } else {
            CacheHeaders::default()
        }
    }
}

/// Local L1 version caching settings.
///
/// Enabling L1 caching requires a pub/sub channel prefix so invalidation
/// notifications from this application cannot collide with unrelated
/// applications sharing the same Redis instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalCachingConfig {
    pub enabled: bool,
    pub channel_prefix: String,
}

impl LocalCachingConfig {
    /// Enable local caching with the given channel prefix.
    pub fn enabled(channel_prefix: impl Into<String>) -> Self {
        Self {
            enabled: true,
            channel_prefix: channel_prefix.into(),
        }
    }

    /// The full pub/sub channel name for local-cache invalidation messages.
    pub fn channel(&self) -> Result<String> {
        if self.channel_prefix.trim().is_empty() {
            return Err(OutputCacheError::configuration(
                "L1 local caching is enabled, but no pub/sub channel prefix was provided. \
                 The prefix is required to prevent collisions with other applications.",
            ));
        }

        Ok(format!("{}-output-cache-invalidate-l1", self.channel_prefix))
    }
}

/// Top-level output cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputCacheConfig {
    /// Media type used when content negotiation produced nothing usable.
    pub default_media_type: String,

    /// Local L1 version caching and its notification channel.
    pub local_caching: LocalCachingConfig,
}

impl Default for OutputCacheConfig {
    fn default() -> Self {
        Self {
            default_media_type: crate::key_generator::DEFAULT_MEDIA_TYPE.to_string(),
            local_caching: LocalCachingConfig::default(),
        }
    }
}

impl OutputCacheConfig {
    /// Validate the configuration, returning the notification channel name
    /// when L1 caching is enabled.
    pub fn notification_channel(&self) -> Result<Option<String>> {
        if !self.local_caching.enabled {
            return Ok(None);
        }

        self.local_caching.channel().map(Some)
    }
}

/// A cached action as registered at startup.
pub struct RegisteredAction {
    pub policy: CachePolicy,
    pub parameters: Vec<ParameterDescriptor>,
    /// Per-action key generator override.
    pub key_generator: Option<Arc<dyn CacheKeyGenerator>>,
}

/// Startup-built table mapping `(controller, action)` pairs to cache policies
/// and parameter declarations.
///
/// Lookup keys are lowercased once at registration; request-time lookups are
/// expected to pass lowercased names.
#[derive(Default)]
pub struct PolicyRegistry {
    actions: HashMap<(String, String), RegisteredAction>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cacheable action with its declared parameters and policy.
    pub fn register(
        &mut self,
        controller: &str,
        action: &str,
        parameters: Vec<ParameterDescriptor>,
        policy: CachePolicy,
    ) {
        self.actions.insert(
            (controller.to_lowercase(), action.to_lowercase()),
            RegisteredAction {
                policy,
                parameters,
                key_generator: None,
            },
        );
    }

    /// Register a cacheable action with a custom key generator.
    pub fn register_with_generator(
        &mut self,
        controller: &str,
        action: &str,
        parameters: Vec<ParameterDescriptor>,
        policy: CachePolicy,
        key_generator: Arc<dyn CacheKeyGenerator>,
    ) {
        self.actions.insert(
            (controller.to_lowercase(), action.to_lowercase()),
            RegisteredAction {
                policy,
                parameters,
                key_generator: Some(key_generator),
            },
        );
    }

    /// Look up a registered action by lowercased controller and action names.
    pub fn lookup(&self, controller_lowered: &str, action_lowered: &str) -> Option<&RegisteredAction> {
        self.actions
            .get(&(controller_lowered.to_string(), action_lowered.to_string()))
    }

    /// Lowercased parameter names of a registered action, or `None` if the
    /// action is unknown.
    pub fn parameter_names_lowered(
        &self,
        controller_lowered: &str,
        action_lowered: &str,
    ) -> Option<Vec<String>> {
        self.lookup(controller_lowered, action_lowered).map(|entry| {
            entry
                .parameters
                .iter()
                .map(|p| p.name.to_lowercase())
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// A declarative invalidation target, resolved and validated at startup.
///
/// Attached to a write endpoint, it names the read action whose cached output
/// it invalidates, optionally narrowed to a single parameter so that only
/// entries keyed with that parameter's current value are invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRule {
    controller_lowered: String,
    action_lowered: String,
    invalidate_by_lowered: Option<String>,
}

impl InvalidationRule {
    /// Build a rule targeting `controller`/`action`, validating it against
    /// the registry.
    ///
    /// With an `invalidate_by` parameter the target action must declare that
    /// parameter; a mismatch is a wiring mistake and fails here, at startup.
    pub fn new(
        registry: &PolicyRegistry,
        controller: &str,
        action: &str,
        invalidate_by: Option<&str>,
    ) -> Result<Self> {
        let controller_lowered = controller.to_lowercase();
        let action_lowered = action.trim().to_lowercase();

        if action_lowered.is_empty() {
            return Err(OutputCacheError::invalidation_target(
                "target action name cannot be empty",
            ));
        }

        let Some(param_names) = registry.parameter_names_lowered(&controller_lowered, &action_lowered)
        else {
            return Err(OutputCacheError::invalidation_target(format!(
                "unable to find registered action '{}.{}'",
                controller_lowered, action_lowered
            )));
        };

        let invalidate_by_lowered = invalidate_by
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty());

        if let Some(param) = &invalidate_by_lowered {
            if param_names.is_empty() {
                return Err(OutputCacheError::invalidation_target(format!(
                    "an invalidate-by parameter '{}' was provided, but the target action \
                     '{}.{}' has no parameters",
                    param, controller_lowered, action_lowered
                )));
            }

            if !param_names.contains(param) {
                return Err(OutputCacheError::invalidation_target(format!(
                    "cannot invalidate '{}.{}' by parameter '{}'; it is not among the target \
                     action's parameters '{}'",
                    controller_lowered,
                    action_lowered,
                    param,
                    param_names.join(", ")
                )));
            }
        }

        Ok(Self {
            controller_lowered,
            action_lowered,
            invalidate_by_lowered,
        })
    }

    pub fn controller(&self) -> &str {
        &self.controller_lowered
    }

    pub fn action(&self) -> &str {
        &self.action_lowered
    }

    pub fn invalidate_by(&self) -> Option<&str> {
        self.invalidate_by_lowered.as_deref()
    }
}
