//! # Request and Response Types
//!
//! The descriptor types the framework glue hands to the cache core: which
//! action is executing, how its parameters bind, and what values arrived with
//! the current request. Binding classification is declared explicitly at
//! registration time instead of discovered through runtime reflection, and
//! view models enumerate their own cache-relevant fields through
//! [`KeyFieldSource`] instead of being reflected over.

use crate::config::CachePolicy;
use bytes::Bytes;
use http::{Method, StatusCode};
use std::fmt;
use std::sync::Arc;

/// Joins multiple values into a single cache-key component.
///
/// Applied uniformly wherever enumerable values appear in a key.
pub(crate) fn flatten_values(values: &[String]) -> String {
    values.join(";")
}

/// A value contributed to the cache key by a view-model field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// A single scalar value, already rendered as a string.
    Text(String),

    /// Multiple values, flattened with `;` when rendered.
    Seq(Vec<String>),

    /// No value. Renders as an empty component.
    Null,
}

impl FieldValue {
    /// Render the field value as a cache-key component, or `None` when null.
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Text(value) => Some(value.clone()),
            FieldValue::Seq(values) => Some(flatten_values(values)),
            FieldValue::Null => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(values: Vec<String>) -> Self {
        FieldValue::Seq(values)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// A request model that contributes its fields to the cache key.
///
/// Filterable view models implement this to enumerate their cache-relevant
/// fields as name/value pairs. The same enumeration drives key generation and
/// invalidation-by-parameter resolution, so the names returned here must
/// match the query-string parameter names the model binds from.
pub trait KeyFieldSource: Send + Sync {
    /// The model's cache-relevant fields, in declaration order.
    fn key_fields(&self) -> Vec<(String, FieldValue)>;
}

/// A bound action argument value, as provided by the framework glue.
#[derive(Clone)]
pub enum ArgumentValue {
    /// A scalar value rendered as a string.
    Text(String),

    /// An enumerable of values, flattened with `;` when rendered.
    Seq(Vec<String>),

    /// A bound view model that enumerates its own key fields.
    Model(Arc<dyn KeyFieldSource>),

    /// The argument was not supplied (an omitted optional parameter).
    Null,
}

impl ArgumentValue {
    /// Construct a model argument.
    pub fn model(model: Arc<dyn KeyFieldSource>) -> Self {
        ArgumentValue::Model(model)
    }

    /// Render the argument as a single string value.
    ///
    /// Models do not render to a single value; their fields are enumerated
    /// individually instead.
    pub fn render(&self) -> Option<String> {
        match self {
            ArgumentValue::Text(value) => Some(value.clone()),
            ArgumentValue::Seq(values) => Some(flatten_values(values)),
            ArgumentValue::Model(_) | ArgumentValue::Null => None,
        }
    }
}

impl fmt::Debug for ArgumentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentValue::Text(value) => f.debug_tuple("Text").field(value).finish(),
            ArgumentValue::Seq(values) => f.debug_tuple("Seq").field(values).finish(),
            ArgumentValue::Model(_) => f.write_str("Model(..)"),
            ArgumentValue::Null => f.write_str("Null"),
        }
    }
}

impl From<&str> for ArgumentValue {
    fn from(value: &str) -> Self {
        ArgumentValue::Text(value.to_string())
    }
}

impl From<String> for ArgumentValue {
    fn from(value: String) -> Self {
        ArgumentValue::Text(value)
    }
}

impl From<Vec<String>> for ArgumentValue {
    fn from(values: Vec<String>) -> Self {
        ArgumentValue::Seq(values)
    }
}

impl From<i64> for ArgumentValue {
    fn from(value: i64) -> Self {
        ArgumentValue::Text(value.to_string())
    }
}

impl From<bool> for ArgumentValue {
    fn from(value: bool) -> Self {
        ArgumentValue::Text(value.to_string())
    }
}

/// How an action parameter binds, which decides its role in the cache key.
#[derive(Clone)]
pub enum ParameterKind {
    /// A scalar the framework binds from the URI by default (numbers,
    /// strings, GUIDs, dates, decimals, and their optional forms).
    Simple,

    /// An enumerable explicitly bound from the URI. Flattened into a single
    /// `;`-joined component under the parameter's own name.
    UriSequence,

    /// A view model explicitly bound from the URI. Its fields are enumerated
    /// individually. The default instance supplies field names and fallback
    /// values when the argument itself was omitted.
    UriModel { default: Arc<dyn KeyFieldSource> },

    /// Bound from the request body. Excluded from the cache key entirely;
    /// body content is not an idempotent cache dimension.
    Body,
}

impl fmt::Debug for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::Simple => f.write_str("Simple"),
            ParameterKind::UriSequence => f.write_str("UriSequence"),
            ParameterKind::UriModel { .. } => f.write_str("UriModel"),
            ParameterKind::Body => f.write_str("Body"),
        }
    }
}

/// A declared action parameter with its binding classification.
#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: ParameterKind,
}

impl ParameterDescriptor {
    /// A default URI-bindable scalar parameter.
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Simple,
        }
    }

    /// An explicitly URI-bound enumerable parameter.
    pub fn uri_sequence(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::UriSequence,
        }
    }

    /// An explicitly URI-bound view-model parameter. `default` supplies the
    /// type's field names and default values for requests that omit the
    /// argument.
    pub fn uri_model(name: impl Into<String>, default: Arc<dyn KeyFieldSource>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::UriModel { default },
        }
    }

    /// A body-bound parameter, excluded from the cache key.
    pub fn body(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Body,
        }
    }
}

/// Everything the cache core needs to know about the current request.
///
/// Built by the framework glue from its own request context: controller and
/// action identity, bound argument values, raw query pairs, the negotiated
/// response media type, and the client's If-None-Match tags.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub controller: String,
    pub action: String,
    pub method: Method,
    pub arguments: Vec<(String, ArgumentValue)>,
    pub query: Vec<(String, String)>,
    /// Negotiated response media type. `None` falls back to the configured default.
    pub media_type: Option<String>,
    /// Client-presented entity tags, with or without surrounding quotes.
    pub if_none_match: Vec<String>,
    pub authenticated: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, controller: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            action: action.into(),
            method,
            arguments: Vec::new(),
            query: Vec::new(),
            media_type: None,
            if_none_match: Vec::new(),
            authenticated: false,
        }
    }

    /// A GET request descriptor, the only cacheable method.
    pub fn get(controller: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(Method::GET, controller, action)
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: ArgumentValue) -> Self {
        self.arguments.push((name.into(), value));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_if_none_match(mut self, tag: impl Into<String>) -> Self {
        self.if_none_match.push(tag.into());
        self
    }

    pub fn with_authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }
}

/// The completed handler response, as seen by the post-execution phase.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: String,
}

impl HandlerResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: content_type.into(),
        }
    }
}

/// Cache headers to apply to the outgoing response, hit or miss.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHeaders {
    /// Rendered `Cache-Control` header value, if any should be set.
    pub cache_control: Option<String>,

    /// Whether a `Pragma: no-cache` header should accompany the response.
    pub pragma_no_cache: bool,
}

/// A response synthesized from the cache, ready to return without invoking
/// the real handler.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Bytes,
    pub content_type: String,
    /// Opaque entity tag for the cached payload, without surrounding quotes.
    pub etag: Option<String>,
    pub headers: CacheHeaders,
}

/// The key computed during the pre-execution phase, carried through to the
/// post-execution phase so it is never derived twice for one request.
#[derive(Debug, Clone)]
pub struct PendingCacheEntry {
    pub(crate) full_key: String,
    pub(crate) media_type: String,
    pub(crate) policy: CachePolicy,
}

impl PendingCacheEntry {
    /// The full versioned cache key computed for this request.
    pub fn full_key(&self) -> &str {
        &self.full_key
    }

    /// The negotiated media type the key was derived with.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }
}

/// Outcome of the pre-execution cache lookup.
#[derive(Debug)]
pub enum CacheLookup {
    /// Caching does not apply to this request; run the handler and skip the
    /// post-execution phase.
    Bypass,

    /// Nothing cached under the computed key. Run the handler, then offer the
    /// response to [`crate::OutputCacheManager::store_if_eligible`] with this entry.
    Miss(PendingCacheEntry),

    /// The client already holds the current representation. Short-circuit
    /// with a 304 and these headers; the payload is not re-transmitted.
    NotModified { headers: CacheHeaders },

    /// A cached response was found. Return it without invoking the handler.
    Hit(CachedResponse),
}

/// Outcome of the post-execution store attempt.
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    /// The response was cached. Set the returned ETag (quoted) on the
    /// response, apply the headers, and strip the `Content-Length` header so
    /// the framework recomputes it on serialization.
    Stored { etag: String, headers: CacheHeaders },

    /// The response was not cached (failed status, expired window, or an
    /// entry already present). The headers still apply to the response.
    Skipped { headers: CacheHeaders },
}

impl StoreOutcome {
    /// The cache headers to apply regardless of outcome.
    pub fn headers(&self) -> &CacheHeaders {
        match self {
            StoreOutcome::Stored { headers, .. } => headers,
            StoreOutcome::Skipped { headers } => headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OrderFilter;

    impl KeyFieldSource for OrderFilter {
        fn key_fields(&self) -> Vec<(String, FieldValue)> {
            vec![
                ("Status".to_string(), FieldValue::Text("open".to_string())),
                ("Tags".to_string(), FieldValue::Seq(vec!["a".into(), "b".into()])),
                ("Region".to_string(), FieldValue::Null),
            ]
        }
    }

    #[test]
    fn test_field_values_render_flattened() {
        assert_eq!(FieldValue::Text("x".into()).render(), Some("x".to_string()));
        assert_eq!(
            FieldValue::Seq(vec!["1".into(), "2".into(), "3".into()]).render(),
            Some("1;2;3".to_string())
        );
        assert_eq!(FieldValue::Null.render(), None);
    }

    #[test]
    fn test_argument_values_render_flattened() {
        assert_eq!(
            ArgumentValue::Seq(vec!["red".into(), "blue".into()]).render(),
            Some("red;blue".to_string())
        );
        assert_eq!(ArgumentValue::Null.render(), None);
        assert_eq!(ArgumentValue::model(Arc::new(OrderFilter)).render(), None);
    }

    #[test]
    fn test_model_enumerates_fields_in_declaration_order() {
        let fields = OrderFilter.key_fields();
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Status", "Tags", "Region"]);
    }

    #[test]
    fn test_request_descriptor_builder_collects_parts() {
        let request = RequestDescriptor::get("Orders", "GetById")
            .with_argument("id", "42".into())
            .with_query("callback", "jsonp123")
            .with_media_type("application/xml")
            .with_if_none_match("abc")
            .with_authenticated(true);

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.arguments.len(), 1);
        assert_eq!(request.query.len(), 1);
        assert_eq!(request.media_type.as_deref(), Some("application/xml"));
        assert_eq!(request.if_none_match, vec!["abc".to_string()]);
        assert!(request.authenticated);
    }
}
