//! # Output Cache Manager
//!
//! The request-time state machine. Before a handler runs, the manager tries
//! to serve the response from the shared store, short-circuiting with a 304
//! when the client's entity tag still matches. After a miss executes the real
//! handler, the manager stores the rendered response. Write endpoints
//! invalidate cached output through version bumps, either for a whole action
//! or for one argument value.

use crate::config::{CachePolicy, InvalidationRule, OutputCacheConfig, PolicyRegistry};
use crate::key_generator::{
    argument_version_key, controller_action_version_key, media_type_from_key, CacheKeyGenerator,
    CatchallKeyGenerator, CONTENT_TYPE_SUFFIX, ETAG_SUFFIX,
};
use crate::store::OutputCacheStore;
use crate::types::{
    ArgumentValue, CacheLookup, CachedResponse, HandlerResponse, ParameterDescriptor,
    PendingCacheEntry, RequestDescriptor, StoreOutcome,
};
use crate::version::{RedisEvictionListener, VersionLocalCache, VersionTracker};
use crate::Result;
use bytes::Bytes;
use chrono::Utc;
use http::{Method, StatusCode};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Builder for [`OutputCacheManager`].
///
/// Collects the store, configuration, per-action policies, and the optional
/// Redis client for the eviction listener, then validates everything in
/// [`build`](Self::build). Registration mistakes fail there, at startup.
pub struct OutputCacheManagerBuilder {
    store: Arc<dyn OutputCacheStore>,
    config: OutputCacheConfig,
    registry: PolicyRegistry,
    key_generator: Arc<dyn CacheKeyGenerator>,
    local_cache: Arc<VersionLocalCache>,
    redis_client: Option<redis::Client>,
}

impl OutputCacheManagerBuilder {
    fn new(store: Arc<dyn OutputCacheStore>) -> Self {
        Self {
            store,
            config: OutputCacheConfig::default(),
            registry: PolicyRegistry::new(),
            key_generator: Arc::new(CatchallKeyGenerator::new()),
            local_cache: Arc::new(VersionLocalCache::new()),
            redis_client: None,
        }
    }

    pub fn with_config(mut self, config: OutputCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default key generator.
    pub fn with_key_generator(mut self, key_generator: Arc<dyn CacheKeyGenerator>) -> Self {
        self.key_generator = key_generator;
        self
    }

    /// Register a cacheable action with its declared parameters and policy.
    pub fn register_action(
        mut self,
        controller: &str,
        action: &str,
        parameters: Vec<ParameterDescriptor>,
        policy: CachePolicy,
    ) -> Self {
        self.registry.register(controller, action, parameters, policy);
        self
    }

    /// Register a cacheable action that uses its own key generator.
    pub fn register_action_with_generator(
        mut self,
        controller: &str,
        action: &str,
        parameters: Vec<ParameterDescriptor>,
        policy: CachePolicy,
        key_generator: Arc<dyn CacheKeyGenerator>,
    ) -> Self {
        self.registry
            .register_with_generator(controller, action, parameters, policy, key_generator);
        self
    }

    /// Cache version lookups in process memory and subscribe to eviction
    /// notifications from other nodes of this application.
    ///
    /// `channel_prefix` namespaces the pub/sub channel so unrelated
    /// applications sharing the Redis instance never see each other's
    /// notifications. It is validated in [`build`](Self::build).
    pub fn enable_local_caching(mut self, channel_prefix: &str, client: redis::Client) -> Self {
        self.config.local_caching.enabled = true;
        self.config.local_caching.channel_prefix = channel_prefix.to_string();
        self.redis_client = Some(client);
        self
    }

    /// Validate the configuration and assemble the manager.
    pub fn build(self) -> Result<OutputCacheManager> {
        let notification_channel = self.config.notification_channel()?;

        let listener = match (&notification_channel, self.redis_client) {
            (Some(channel), Some(client)) => {
                info!("Starting eviction listener on channel {}", channel);
                Some(RedisEvictionListener::spawn(
                    client,
                    channel.clone(),
                    self.local_cache.clone(),
                ))
            }
            _ => None,
        };

        let versions = VersionTracker::new(
            self.store.clone(),
            self.local_cache,
            notification_channel,
        );

        Ok(OutputCacheManager {
            store: self.store,
            versions,
            registry: self.registry,
            key_generator: self.key_generator,
            config: self.config,
            listener,
        })
    }
}

/// The output cache orchestrator.
pub struct OutputCacheManager {
    store: Arc<dyn OutputCacheStore>,
    versions: VersionTracker,
    registry: PolicyRegistry,
    key_generator: Arc<dyn CacheKeyGenerator>,
    config: OutputCacheConfig,
    listener: Option<RedisEvictionListener>,
}

impl OutputCacheManager {
    pub fn builder(store: Arc<dyn OutputCacheStore>) -> OutputCacheManagerBuilder {
        OutputCacheManagerBuilder::new(store)
    }

    /// The version tracker backing this manager.
    pub fn versions(&self) -> &VersionTracker {
        &self.versions
    }

    /// The startup-built policy registry.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Build an invalidation rule validated against the registered actions.
    pub fn invalidation_rule(
        &self,
        target_controller: &str,
        target_action: &str,
        invalidate_by: Option<&str>,
    ) -> Result<InvalidationRule> {
        InvalidationRule::new(&self.registry, target_controller, target_action, invalidate_by)
    }

    /// Stop the eviction listener. Call during application shutdown.
    pub async fn shutdown(self) {
        if let Some(listener) = self.listener {
            listener.shutdown().await;
        }
    }

    /// Pre-execution phase: try to answer the request from the cache.
    ///
    /// Returns [`CacheLookup::Bypass`] when caching does not apply at all,
    /// a `Miss` carrying the computed key when the handler must run, or a
    /// ready-to-send 304 / full response.
    pub async fn try_serve_from_cache(&self, request: &RequestDescriptor) -> CacheLookup {
        let controller_lowered = request.controller.to_lowercase();
        let action_lowered = request.action.to_lowercase();

        let Some(registered) = self.registry.lookup(&controller_lowered, &action_lowered) else {
            return CacheLookup::Bypass;
        };

        let policy = &registered.policy;
        if policy.suppress
            || request.method != Method::GET
            || (policy.anonymous_only && request.authenticated)
        {
            return CacheLookup::Bypass;
        }

        let media_type = request
            .media_type
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_media_type.clone());

        let generator = registered.key_generator.as_ref().unwrap_or(&self.key_generator);
        let full_key = generator
            .make_cache_key(
                &self.versions,
                request,
                &registered.parameters,
                &media_type,
                &controller_lowered,
                &action_lowered,
            )
            .await;

        let cache_time = policy.cache_time(Utc::now());
        let headers = policy.response_headers(&cache_time);
        let pending = PendingCacheEntry {
            full_key,
            media_type,
            policy: policy.clone(),
        };

        if !self.store.exists(pending.full_key()).await {
            debug!("Cache miss for key {}", pending.full_key());
            return CacheLookup::Miss(pending);
        }

        // If the client already holds the current representation, send a 304
        // instead of the payload.
        if !request.if_none_match.is_empty() {
            let etag_key = format!("{}{}", pending.full_key(), ETAG_SUFFIX);
            if let Some(stored_etag) = self.get_string(&etag_key).await {
                if request
                    .if_none_match
                    .iter()
                    .any(|tag| etags_match(tag, &stored_etag))
                {
                    debug!("ETag match for key {}; returning 304", pending.full_key());
                    return CacheLookup::NotModified { headers };
                }
            }
        }

        // A concurrent partial write can leave metadata without a payload;
        // that counts as a miss.
        let Some(body) = self.store.get(pending.full_key()).await else {
            debug!("Payload missing for key {}", pending.full_key());
            return CacheLookup::Miss(pending);
        };

        let content_type_key = format!("{}{}", pending.full_key(), CONTENT_TYPE_SUFFIX);
        let content_type = match self.get_string(&content_type_key).await {
            Some(content_type) => content_type,
            // The metadata entry is gone; the key itself still names the media type.
            None => media_type_from_key(pending.full_key())
                .unwrap_or_else(|| pending.media_type().to_string()),
        };

        let etag_key = format!("{}{}", pending.full_key(), ETAG_SUFFIX);
        let etag = self.get_string(&etag_key).await;

        debug!("Cache hit for key {}", pending.full_key());
        CacheLookup::Hit(CachedResponse {
            body: Bytes::from(body),
            content_type,
            etag,
            headers,
        })
    }

    /// Post-execution phase: store the handler's response if it is eligible.
    ///
    /// Stores only success responses, only while the expiration window is
    /// open, and only when no entry appeared under the key in the meantime,
    /// so concurrent misses inside one TTL window do not write twice. The
    /// returned headers apply to the outgoing response either way.
    pub async fn store_if_eligible(
        &self,
        pending: &PendingCacheEntry,
        response: &HandlerResponse,
    ) -> StoreOutcome {
        let now = Utc::now();
        let cache_time = pending.policy.cache_time(now);
        let headers = pending.policy.response_headers(&cache_time);

        if !response.status.is_success() {
            return StoreOutcome::Skipped { headers };
        }

        if response.body.is_empty() {
            debug!("Nothing to cache for key {}; empty body", pending.full_key());
            return StoreOutcome::Skipped { headers };
        }

        let Some(ttl) = (cache_time.absolute_expiration - now).to_std().ok().filter(|t| !t.is_zero())
        else {
            return StoreOutcome::Skipped { headers };
        };

        if self.store.exists(pending.full_key()).await {
            debug!("Key {} was cached by a concurrent request", pending.full_key());
            return StoreOutcome::Skipped { headers };
        }

        let etag = Uuid::new_v4().to_string();
        let content_type = if response.content_type.trim().is_empty() {
            pending.media_type().to_string()
        } else {
            response.content_type.clone()
        };

        // Three entries sharing one TTL. There is no cross-entry atomicity; a
        // reader that catches a partial write treats it as a miss.
        self.store.set(pending.full_key(), &response.body, ttl).await;
        self.store
            .set(
                &format!("{}{}", pending.full_key(), CONTENT_TYPE_SUFFIX),
                content_type.as_bytes(),
                ttl,
            )
            .await;
        self.store
            .set(
                &format!("{}{}", pending.full_key(), ETAG_SUFFIX),
                etag.as_bytes(),
                ttl,
            )
            .await;

        debug!("Cached response under key {}", pending.full_key());
        StoreOutcome::Stored { etag, headers }
    }

    /// Apply a declarative invalidation rule after a write endpoint finished.
    ///
    /// Runs only for success responses. Without an invalidate-by parameter
    /// the whole target action is invalidated; with one, only entries keyed
    /// with the resolved parameter value are. A parameter whose value cannot
    /// be resolved from `arguments` is logged and skipped; the write request
    /// itself is unaffected.
    pub async fn invalidate(
        &self,
        rule: &InvalidationRule,
        arguments: &[(String, ArgumentValue)],
        status: StatusCode,
    ) {
        if !status.is_success() {
            return;
        }

        match rule.invalidate_by() {
            None => {
                let new_version = self
                    .invalidate_action(rule.controller(), rule.action())
                    .await;
                debug!(
                    "Invalidated all output for {}.{} (version {})",
                    rule.controller(),
                    rule.action(),
                    new_version
                );
            }
            Some(parameter) => match resolve_invalidation_value(parameter, arguments) {
                Some(value) => {
                    let new_version = self
                        .invalidate_by_value(rule.controller(), rule.action(), parameter, &value)
                        .await;
                    debug!(
                        "Invalidated output for {}.{} where {}={} (version {})",
                        rule.controller(),
                        rule.action(),
                        parameter,
                        value,
                        new_version
                    );
                }
                None => {
                    error!(
                        "Unable to resolve a value for invalidation parameter '{}' on {}.{}; \
                         skipping invalidation",
                        parameter,
                        rule.controller(),
                        rule.action()
                    );
                }
            },
        }
    }

    /// Invalidate every cached argument combination of an action at once.
    pub async fn invalidate_action(&self, controller: &str, action: &str) -> i64 {
        let key = controller_action_version_key(&controller.to_lowercase(), &action.to_lowercase());
        self.versions.bump(&key).await
    }

    /// Invalidate only the entries keyed with one specific argument value.
    pub async fn invalidate_by_value(
        &self,
        controller: &str,
        action: &str,
        parameter: &str,
        value: &str,
    ) -> i64 {
        let key = argument_version_key(
            &controller.to_lowercase(),
            &action.to_lowercase(),
            &parameter.to_lowercase(),
            value,
        );
        self.versions.bump(&key).await
    }

    async fn get_string(&self, key: &str) -> Option<String> {
        self.store
            .get(key)
            .await
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|value| !value.is_empty())
    }
}

/// Compare entity tags ignoring surrounding quotes, since clients echo the
/// quoted header form while the store holds the bare token.
fn etags_match(client_tag: &str, stored_tag: &str) -> bool {
    client_tag.trim().trim_matches('"') == stored_tag.trim().trim_matches('"')
}

/// Resolve the value of an invalidate-by parameter from the write request's
/// own arguments: a direct name match first, then the fields of any bound
/// model argument.
fn resolve_invalidation_value(
    parameter: &str,
    arguments: &[(String, ArgumentValue)],
) -> Option<String> {
    for (name, value) in arguments {
        if name.eq_ignore_ascii_case(parameter) {
            return match value {
                ArgumentValue::Null => Some(String::new()),
                ArgumentValue::Model(model) => find_field_value(parameter, model.as_ref()),
                other => other.render(),
            };
        }
    }

    for (_, value) in arguments {
        if let ArgumentValue::Model(model) = value {
            if let Some(resolved) = find_field_value(parameter, model.as_ref()) {
                return Some(resolved);
            }
        }
    }

    None
}

fn find_field_value(parameter: &str, model: &dyn crate::types::KeyFieldSource) -> Option<String> {
    model
        .key_fields()
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(parameter))
        .map(|(_, value)| value.render().unwrap_or_default())
}
