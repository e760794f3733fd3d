//! # Cache Key Generator
//!
//! Derives the full versioned cache key for a request. The key folds in the
//! lowercased controller and action names, a version counter for the
//! controller/action pair, one independently versioned `name=value` token per
//! participating action argument, and the negotiated response media type.
//! Because every token carries its own version counter, bumping a single
//! counter re-routes future lookups to new keys without touching the store's
//! existing entries.

use crate::types::{ArgumentValue, ParameterDescriptor, ParameterKind, RequestDescriptor};
use crate::version::VersionTracker;
use async_trait::async_trait;
use tracing::warn;

/// Separates the media type from the rest of the cache key.
///
/// A plain `:` is fragile because media types carry `;charset=` parameters
/// and can themselves contain colons, so a long literal that cannot occur in
/// a legitimate media type is used instead.
pub const MEDIA_TYPE_SEPARATOR: &str = "-^-mediatype-^-";

/// Suffix of the store entry holding a cached response's content type.
pub const CONTENT_TYPE_SUFFIX: &str = ":response-ct";

/// Suffix of the store entry holding a cached response's entity tag.
pub const ETAG_SUFFIX: &str = ":response-etag";

/// Media type used when content negotiation produced nothing usable.
pub const DEFAULT_MEDIA_TYPE: &str = "application/json; charset=utf-8";

/// JSONP callback query parameter, excluded from all key derivation so the
/// cache never fragments across callback names.
pub const JSONP_CALLBACK_PARAM: &str = "callback";

/// Version key for a controller/action pair, e.g. `orders-getbyid-version`.
pub fn controller_action_version_key(controller_lowered: &str, action_lowered: &str) -> String {
    format!("{}-{}-version", controller_lowered, action_lowered)
}

/// Version key for one argument name/value within an action, e.g.
/// `orders-getbyid-id=42-version`.
pub fn argument_version_key(
    controller_lowered: &str,
    action_lowered: &str,
    argument_name_lowered: &str,
    argument_value: &str,
) -> String {
    format!(
        "{}-{}-{}={}-version",
        controller_lowered, action_lowered, argument_name_lowered, argument_value
    )
}

/// A rendered argument token carrying its version, e.g. `id=42_v1`.
pub fn versioned_argument(argument_name_lowered: &str, argument_value: &str, version: i64) -> String {
    format!("{}={}_v{}", argument_name_lowered, argument_value, version)
}

/// Recover the base media type from a full cache key, for when the stored
/// content-type entry is missing.
pub fn media_type_from_key(full_key: &str) -> Option<String> {
    full_key
        .split_once(MEDIA_TYPE_SEPARATOR)
        .map(|(_, media_type)| {
            media_type
                .split(';')
                .next()
                .unwrap_or(media_type)
                .trim()
                .to_string()
        })
        .filter(|media_type| !media_type.is_empty())
}

/// Strategy for deriving the full cache key of a request.
#[async_trait]
pub trait CacheKeyGenerator: Send + Sync {
    /// Derive the full cache key. `controller_lowered` and `action_lowered`
    /// are the already-lowercased identifiers the manager resolved the policy
    /// with.
    async fn make_cache_key(
        &self,
        versions: &VersionTracker,
        request: &RequestDescriptor,
        parameters: &[ParameterDescriptor],
        media_type: &str,
        controller_lowered: &str,
        action_lowered: &str,
    ) -> String;
}

/// The default key generator.
///
/// Builds name/value pairs from every URI-bound action argument: simple
/// scalars directly, enumerables flattened with `;` under the parameter's own
/// name, and view models expanded into one pair per field. Pairs are sorted
/// by name before versioning, so two requests with the same arguments in
/// different declaration order produce the same key. Query parameters that do
/// not map to an action parameter or model field are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatchallKeyGenerator;

impl CatchallKeyGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Collect the `(name, value)` pairs participating in the key, in
    /// declaration order. Body-bound parameters never participate.
    fn gather_argument_pairs(
        request: &RequestDescriptor,
        parameters: &[ParameterDescriptor],
    ) -> Vec<(String, Option<String>)> {
        let mut pairs = Vec::new();

        for parameter in parameters {
            match &parameter.kind {
                ParameterKind::Body => continue,

                ParameterKind::Simple | ParameterKind::UriSequence => {
                    let value = match find_argument(request, &parameter.name) {
                        Some(value) => value.render(),
                        None => {
                            warn!(
                                "No bound argument named {}; keying it as empty",
                                parameter.name
                            );
                            None
                        }
                    };
                    pairs.push((parameter.name.clone(), value));
                }

                ParameterKind::UriModel { default } => match find_argument(request, &parameter.name)
                {
                    Some(ArgumentValue::Model(model)) => {
                        for (name, value) in model.key_fields() {
                            pairs.push((name, value.render()));
                        }
                    }
                    Some(ArgumentValue::Null) | None => {
                        // The model was omitted, but its type's fields still
                        // shape the key. A same-named query parameter wins;
                        // otherwise the default instance supplies the value.
                        for (name, fallback) in default.key_fields() {
                            let from_query = request
                                .query
                                .iter()
                                .filter(|(k, _)| !k.eq_ignore_ascii_case(JSONP_CALLBACK_PARAM))
                                .find(|(k, _)| k.eq_ignore_ascii_case(&name))
                                .map(|(_, v)| v.clone());
                            pairs.push((name, from_query.or_else(|| fallback.render())));
                        }
                    }
                    Some(other) => {
                        warn!(
                            "Argument {} was bound as a plain value but declared as a model",
                            parameter.name
                        );
                        pairs.push((parameter.name.clone(), other.render()));
                    }
                },
            }
        }

        pairs
    }
}

fn find_argument<'a>(request: &'a RequestDescriptor, name: &str) -> Option<&'a ArgumentValue> {
    request
        .arguments
        .iter()
        .find(|(argument_name, _)| argument_name == name)
        .map(|(_, value)| value)
}

#[async_trait]
impl CacheKeyGenerator for CatchallKeyGenerator {
    async fn make_cache_key(
        &self,
        versions: &VersionTracker,
        request: &RequestDescriptor,
        parameters: &[ParameterDescriptor],
        media_type: &str,
        controller_lowered: &str,
        action_lowered: &str,
    ) -> String {
        let mut pairs = Self::gather_argument_pairs(request, parameters);

        // Byte-order sort, so the key is independent of declaration order.
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let base_version = versions
            .current(&controller_action_version_key(controller_lowered, action_lowered))
            .await;

        let mut tokens = Vec::with_capacity(pairs.len());
        for (name, value) in &pairs {
            let name_lowered = name.to_lowercase();
            let value = value.clone().unwrap_or_default();

            // The version counter is scoped to controller/action, so equal
            // argument names on different actions stay independent.
            let version = versions
                .current(&argument_version_key(
                    controller_lowered,
                    action_lowered,
                    &name_lowered,
                    &value,
                ))
                .await;

            tokens.push(versioned_argument(&name_lowered, value.trim(), version));
        }

        let parameters_section = if tokens.is_empty() {
            String::new()
        } else {
            format!("-{}", tokens.join("&"))
        };

        format!(
            "{}-{}_v{}{}{}{}",
            controller_lowered,
            action_lowered,
            base_version,
            parameters_section,
            MEDIA_TYPE_SEPARATOR,
            media_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, OutputCacheStore};
    use crate::types::{FieldValue, KeyFieldSource};
    use crate::version::VersionLocalCache;
    use std::sync::Arc;

    fn tracker() -> (Arc<InMemoryStore>, VersionTracker) {
        let store = Arc::new(InMemoryStore::new());
        let tracker = VersionTracker::new(store.clone(), Arc::new(VersionLocalCache::new()), None);
        (store, tracker)
    }

    async fn make_key(
        tracker: &VersionTracker,
        request: &RequestDescriptor,
        parameters: &[ParameterDescriptor],
    ) -> String {
        CatchallKeyGenerator::new()
            .make_cache_key(
                tracker,
                request,
                parameters,
                DEFAULT_MEDIA_TYPE,
                &request.controller.to_lowercase(),
                &request.action.to_lowercase(),
            )
            .await
    }

    #[derive(Default)]
    struct OrderFilter {
        status: Option<String>,
        tags: Vec<String>,
    }

    impl KeyFieldSource for OrderFilter {
        fn key_fields(&self) -> Vec<(String, FieldValue)> {
            vec![
                (
                    "Status".to_string(),
                    match &self.status {
                        Some(status) => FieldValue::Text(status.clone()),
                        None => FieldValue::Null,
                    },
                ),
                ("Tags".to_string(), FieldValue::Seq(self.tags.clone())),
            ]
        }
    }

    #[tokio::test]
    async fn test_simple_argument_produces_versioned_token() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "GetById").with_argument("id", "42".into());
        let parameters = [ParameterDescriptor::simple("id")];

        let key = make_key(&tracker, &request, &parameters).await;
        assert_eq!(
            key,
            format!(
                "orders-getbyid_v1-id=42_v1{}{}",
                MEDIA_TYPE_SEPARATOR, DEFAULT_MEDIA_TYPE
            )
        );
    }

    #[tokio::test]
    async fn test_key_is_independent_of_declaration_order() {
        let (_, tracker) = tracker();

        let forward = RequestDescriptor::get("Orders", "Search")
            .with_argument("customerId", "7".into())
            .with_argument("page", "2".into());
        let backward = RequestDescriptor::get("Orders", "Search")
            .with_argument("page", "2".into())
            .with_argument("customerId", "7".into());

        let declared_forward = [
            ParameterDescriptor::simple("customerId"),
            ParameterDescriptor::simple("page"),
        ];
        let declared_backward = [
            ParameterDescriptor::simple("page"),
            ParameterDescriptor::simple("customerId"),
        ];

        let key_a = make_key(&tracker, &forward, &declared_forward).await;
        let key_b = make_key(&tracker, &backward, &declared_backward).await;
        assert_eq!(key_a, key_b);
    }

    #[tokio::test]
    async fn test_sort_order_is_case_sensitive_byte_order() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "Search")
            .with_argument("alpha", "1".into())
            .with_argument("Zeta", "2".into());
        let parameters = [
            ParameterDescriptor::simple("alpha"),
            ParameterDescriptor::simple("Zeta"),
        ];

        let key = make_key(&tracker, &request, &parameters).await;

        // Uppercase sorts before lowercase in byte order.
        let zeta = key.find("zeta=2").unwrap();
        let alpha = key.find("alpha=1").unwrap();
        assert!(zeta < alpha, "expected zeta token before alpha token in {}", key);
    }

    #[tokio::test]
    async fn test_sequences_flatten_with_semicolons() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "Search").with_argument(
            "tags",
            vec!["red".to_string(), "blue".to_string()].into(),
        );
        let parameters = [ParameterDescriptor::uri_sequence("tags")];

        let key = make_key(&tracker, &request, &parameters).await;
        assert!(key.contains("tags=red;blue_v1"), "key was {}", key);
    }

    #[tokio::test]
    async fn test_body_parameters_are_excluded() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "Search")
            .with_argument("id", "42".into())
            .with_argument("payload", "secret".into());
        let parameters = [
            ParameterDescriptor::simple("id"),
            ParameterDescriptor::body("payload"),
        ];

        let key = make_key(&tracker, &request, &parameters).await;
        assert!(!key.contains("payload"), "key was {}", key);
        assert!(!key.contains("secret"), "key was {}", key);
    }

    #[tokio::test]
    async fn test_empty_parameter_section_is_omitted() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "GetAll");

        let key = make_key(&tracker, &request, &[]).await;
        assert_eq!(
            key,
            format!(
                "orders-getall_v1{}{}",
                MEDIA_TYPE_SEPARATOR, DEFAULT_MEDIA_TYPE
            )
        );
    }

    #[tokio::test]
    async fn test_bound_model_contributes_one_pair_per_field() {
        let (_, tracker) = tracker();
        let filter = OrderFilter {
            status: Some("open".to_string()),
            tags: vec!["a".to_string(), "b".to_string()],
        };
        let request = RequestDescriptor::get("Orders", "Search")
            .with_argument("filter", ArgumentValue::model(Arc::new(filter)));
        let parameters = [ParameterDescriptor::uri_model(
            "filter",
            Arc::new(OrderFilter::default()),
        )];

        let key = make_key(&tracker, &request, &parameters).await;
        assert!(key.contains("status=open_v1"), "key was {}", key);
        assert!(key.contains("tags=a;b_v1"), "key was {}", key);
        assert!(!key.contains("filter="), "key was {}", key);
    }

    #[tokio::test]
    async fn test_omitted_model_resolves_fields_from_query_or_defaults() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "Search")
            .with_argument("filter", ArgumentValue::Null)
            .with_query("STATUS", "closed")
            .with_query("status", "ignored-second-match");
        let parameters = [ParameterDescriptor::uri_model(
            "filter",
            Arc::new(OrderFilter::default()),
        )];

        let key = make_key(&tracker, &request, &parameters).await;

        // Case-insensitive match against the query, first match wins.
        assert!(key.contains("status=closed_v1"), "key was {}", key);

        // No query value for Tags; the default instance's empty list renders empty.
        assert!(key.contains("tags=_v1"), "key was {}", key);
    }

    #[tokio::test]
    async fn test_jsonp_callback_parameter_never_reaches_the_key() {
        let (_, tracker) = tracker();

        let with_callback = RequestDescriptor::get("Orders", "Search")
            .with_argument("filter", ArgumentValue::Null)
            .with_query("callback", "jsonp_12345");
        let without_callback =
            RequestDescriptor::get("Orders", "Search").with_argument("filter", ArgumentValue::Null);
        let parameters = [ParameterDescriptor::uri_model(
            "filter",
            Arc::new(OrderFilter::default()),
        )];

        let key_a = make_key(&tracker, &with_callback, &parameters).await;
        let key_b = make_key(&tracker, &without_callback, &parameters).await;
        assert_eq!(key_a, key_b);
        assert!(!key_a.contains("jsonp_12345"));
    }

    #[tokio::test]
    async fn test_unbound_query_parameters_are_ignored() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "GetById")
            .with_argument("id", "42".into())
            .with_query("utm_source", "newsletter");
        let parameters = [ParameterDescriptor::simple("id")];

        let key = make_key(&tracker, &request, &parameters).await;
        assert!(!key.contains("utm_source"), "key was {}", key);
    }

    #[tokio::test]
    async fn test_token_values_are_trimmed() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "GetById").with_argument("id", " 42 ".into());
        let parameters = [ParameterDescriptor::simple("id")];

        let key = make_key(&tracker, &request, &parameters).await;
        assert!(key.contains("id=42_v1"), "key was {}", key);
    }

    #[tokio::test]
    async fn test_bumping_an_argument_version_changes_only_that_key() {
        let (store, tracker) = tracker();
        let parameters = [ParameterDescriptor::simple("id")];

        let request_42 = RequestDescriptor::get("Orders", "GetById").with_argument("id", "42".into());
        let request_43 = RequestDescriptor::get("Orders", "GetById").with_argument("id", "43".into());

        let key_42_before = make_key(&tracker, &request_42, &parameters).await;
        let key_43_before = make_key(&tracker, &request_43, &parameters).await;
        assert!(key_42_before.contains("id=42_v1"));

        store.incr("orders-getbyid-id=42-version").await;

        let key_42_after = make_key(&tracker, &request_42, &parameters).await;
        let key_43_after = make_key(&tracker, &request_43, &parameters).await;

        assert!(key_42_after.contains("id=42_v2"), "key was {}", key_42_after);
        assert_ne!(key_42_before, key_42_after);
        assert_eq!(key_43_before, key_43_after);
    }

    #[tokio::test]
    async fn test_bumping_the_base_version_changes_every_key() {
        let (store, tracker) = tracker();
        let parameters = [ParameterDescriptor::simple("id")];
        let request = RequestDescriptor::get("Orders", "GetById").with_argument("id", "42".into());

        let before = make_key(&tracker, &request, &parameters).await;
        store.incr("orders-getbyid-version").await;
        let after = make_key(&tracker, &request, &parameters).await;

        assert!(before.contains("_v1-"));
        assert!(after.contains("_v2-"), "key was {}", after);
    }

    #[tokio::test]
    async fn test_media_type_recovery_survives_charset_parameters() {
        let (_, tracker) = tracker();
        let request = RequestDescriptor::get("Orders", "GetAll");

        let key = CatchallKeyGenerator::new()
            .make_cache_key(
                &tracker,
                &request,
                &[],
                "application/xml; charset=utf-8",
                "orders",
                "getall",
            )
            .await;

        assert_eq!(media_type_from_key(&key).as_deref(), Some("application/xml"));
    }

    #[test]
    fn test_media_type_recovery_rejects_keys_without_separator() {
        assert_eq!(media_type_from_key("orders-getall_v1"), None);
    }
}
