//! Request specification builder.
//!
//! [`HttpRequestBuilder`] accumulates everything about one outgoing call and
//! resolves it into an immutable [`HttpRequest`] with [`build`]. Setters
//! consume and return the builder; setters that validate their arguments
//! return [`Result`] and name the rejected parameter.
//!
//! # Example
//!
//! ```ignore
//! use horizon_lattice_remote::HttpRequestBuilder;
//!
//! let request = HttpRequestBuilder::get("http://localhost/{id}/{name}?v=1")
//!     .with_path_parameter("id", 10)?
//!     .with_path_parameter("name", "furion")?
//!     .with_query_parameter("id", 10)?
//!     .with_query_parameter("name", "furion")?;
//! ```
//!
//! [`build`]: HttpRequestBuilder::build

mod placeholder;
mod status;

pub use status::StatusCodeMatcher;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use serde::Serialize;
use url::Url;

use self::placeholder::{
    flatten_parameters, replace_configuration_placeholders, replace_path_placeholders,
};
use crate::dispatch::HttpRequestEventHandler;
use crate::error::{ErrorKind, RemoteError, Result};
use crate::http::{
    APPLICATION_JSON, APPLICATION_XML, BodyStream, ClientHandle, ClientProvider, ContentValue,
    FORM_URL_ENCODED, HttpContent, HttpMethod, HttpRequest, HttpResponse, MediaType,
    RequestMetadata, TEXT_HTML, TEXT_PLAIN,
};
use crate::multipart::{MultipartForm, MultipartFormBuilder};
use crate::options::HttpRemoteOptions;
use crate::processors::{ContentProcessorChain, object_pairs};

/// Cleanup action run once after dispatch.
pub type Disposable = Box<dyn FnOnce() + Send>;
/// Runs on the resolved request before it is sent; errors abort the call.
pub type PreSendHook = Arc<dyn Fn(&mut HttpRequest) -> Result<()> + Send + Sync>;
/// Runs on a successful response before it is returned.
pub type PostReceiveHook = Arc<dyn Fn(&HttpResponse) -> Result<()> + Send + Sync>;
/// Runs when the call fails.
pub type FailureHook = Arc<dyn Fn(&RemoteError) + Send + Sync>;
/// Runs on the materialized body right before it is attached.
pub type PreSetContentHook = Arc<dyn Fn(&mut HttpContent) + Send + Sync>;
/// Handles responses whose status matches a [`StatusCodeMatcher`].
pub type StatusCodeHandler = Arc<dyn Fn(&HttpResponse) -> Result<()> + Send + Sync>;
/// Invoked once when the request-level timeout expires.
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

fn require(name: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RemoteError::invalid_argument(name, "must not be empty"));
    }
    Ok(())
}

fn escape_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn join_relative(base: &Url, relative: &str) -> Result<Url> {
    if relative.is_empty() || relative.starts_with(['/', '?', '#']) {
        return Ok(base.join(relative)?);
    }
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(relative)?)
}

#[derive(Clone, Debug)]
pub(crate) struct QueryValue {
    value: String,
    raw: bool,
}

/// Everything a request builder has accumulated.
#[derive(Clone)]
pub(crate) struct RequestSpec {
    pub(crate) method: HttpMethod,
    pub(crate) uri: Option<String>,
    pub(crate) base_address: Option<String>,
    pub(crate) path_segments: Vec<String>,
    pub(crate) removed_path_segments: HashSet<String>,
    pub(crate) path_parameters: HashMap<String, String>,
    pub(crate) query: Vec<(String, Vec<QueryValue>)>,
    pub(crate) removed_query: HashSet<String>,
    pub(crate) fragment: Option<String>,
    pub(crate) headers: Vec<(String, Vec<String>)>,
    pub(crate) removed_headers: HashSet<String>,
    pub(crate) cookies: Vec<(String, String)>,
    pub(crate) removed_cookies: HashSet<String>,
    pub(crate) content: Option<ContentValue>,
    pub(crate) content_type: Option<String>,
    pub(crate) content_encoding: Option<String>,
    pub(crate) multipart: Option<MultipartForm>,
    pub(crate) authorization: Option<String>,
    pub(crate) trace_identifier: Option<String>,
    pub(crate) referer: Option<String>,
    pub(crate) http_version: Option<http::Version>,
    pub(crate) client_name: Option<String>,
    pub(crate) client_provider: Option<ClientProvider>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) timeout_callback: Option<TimeoutCallback>,
    pub(crate) ensure_success: bool,
    pub(crate) suppressed: Vec<ErrorKind>,
    pub(crate) client_pooling: bool,
    pub(crate) disable_cache: bool,
    pub(crate) auto_host: bool,
    pub(crate) performance_optimization: bool,
    pub(crate) disable_profiling: bool,
    pub(crate) always_use_object_converter: bool,
    pub(crate) status_handlers: Vec<(StatusCodeMatcher, StatusCodeHandler)>,
    pub(crate) event_handler: Option<Arc<dyn HttpRequestEventHandler>>,
    pub(crate) pre_send: Option<PreSendHook>,
    pub(crate) post_receive: Option<PostReceiveHook>,
    pub(crate) on_failure: Option<FailureHook>,
    pub(crate) pre_set_content: Option<PreSetContentHook>,
}

impl RequestSpec {
    fn new(method: HttpMethod, uri: Option<String>) -> Self {
        Self {
            method,
            uri,
            base_address: None,
            path_segments: Vec::new(),
            removed_path_segments: HashSet::new(),
            path_parameters: HashMap::new(),
            query: Vec::new(),
            removed_query: HashSet::new(),
            fragment: None,
            headers: Vec::new(),
            removed_headers: HashSet::new(),
            cookies: Vec::new(),
            removed_cookies: HashSet::new(),
            content: None,
            content_type: None,
            content_encoding: None,
            multipart: None,
            authorization: None,
            trace_identifier: None,
            referer: None,
            http_version: None,
            client_name: None,
            client_provider: None,
            timeout: None,
            timeout_callback: None,
            ensure_success: false,
            suppressed: Vec::new(),
            client_pooling: false,
            disable_cache: false,
            auto_host: false,
            performance_optimization: false,
            disable_profiling: false,
            always_use_object_converter: false,
            status_handlers: Vec::new(),
            event_handler: None,
            pre_send: None,
            post_receive: None,
            on_failure: None,
            pre_set_content: None,
        }
    }
}

/// Builder describing one outgoing HTTP call.
///
/// The builder is consumed by the dispatcher through a shared reference, so
/// one builder can be dispatched many times (load generation does). Cleanup
/// actions registered with [`add_disposable`](Self::add_disposable) run after
/// every dispatch, whether or not it succeeded.
pub struct HttpRequestBuilder {
    pub(crate) spec: RequestSpec,
    disposables: Mutex<Vec<Disposable>>,
}

impl HttpRequestBuilder {
    /// Create a builder for `method` and `uri`.
    ///
    /// The URI may be relative and may contain `{name}` and `[[key]]`
    /// placeholders.
    pub fn create(method: HttpMethod, uri: impl Into<String>) -> Self {
        Self {
            spec: RequestSpec::new(method, Some(uri.into())),
            disposables: Mutex::new(Vec::new()),
        }
    }

    /// Create a GET builder.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::create(HttpMethod::Get, uri)
    }

    /// Create a POST builder.
    pub fn post(uri: impl Into<String>) -> Self {
        Self::create(HttpMethod::Post, uri)
    }

    /// Create a PUT builder.
    pub fn put(uri: impl Into<String>) -> Self {
        Self::create(HttpMethod::Put, uri)
    }

    /// Create a DELETE builder.
    pub fn delete(uri: impl Into<String>) -> Self {
        Self::create(HttpMethod::Delete, uri)
    }

    /// Create a PATCH builder.
    pub fn patch(uri: impl Into<String>) -> Self {
        Self::create(HttpMethod::Patch, uri)
    }

    /// Create a HEAD builder.
    pub fn head(uri: impl Into<String>) -> Self {
        Self::create(HttpMethod::Head, uri)
    }

    /// Create an OPTIONS builder.
    pub fn options(uri: impl Into<String>) -> Self {
        Self::create(HttpMethod::Options, uri)
    }

    /// The request method.
    pub fn method(&self) -> HttpMethod {
        self.spec.method
    }

    /// The request URI template.
    pub fn uri(&self) -> Option<&str> {
        self.spec.uri.as_deref()
    }

    /// The request-level timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.spec.timeout
    }

    /// Set the base address relative URIs resolve against.
    ///
    /// Takes precedence over the client's and the fallback base address.
    pub fn with_base_address(mut self, address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        require("address", &address)?;
        self.spec.base_address = Some(address);
        Ok(self)
    }

    // Path

    /// Append a path segment.
    pub fn with_path_segment(mut self, segment: impl Into<String>) -> Self {
        self.spec.path_segments.push(segment.into());
        self
    }

    /// Append several path segments.
    pub fn with_path_segments<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec
            .path_segments
            .extend(segments.into_iter().map(Into::into));
        self
    }

    /// Drop appended path segments equal to any of `segments`.
    pub fn remove_path_segments<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.removed_path_segments.extend(
            segments
                .into_iter()
                .map(|s| s.into().trim_matches('/').to_string()),
        );
        self
    }

    /// Set the value of a `{name}` placeholder.
    pub fn with_path_parameter(mut self, name: impl Into<String>, value: impl ToString) -> Result<Self> {
        let name = name.into();
        require("name", &name)?;
        self.spec.path_parameters.insert(name, value.to_string());
        Ok(self)
    }

    /// Set several placeholder values.
    pub fn with_path_parameters<I, K, V>(mut self, parameters: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (name, value) in parameters {
            self = self.with_path_parameter(name, value)?;
        }
        Ok(self)
    }

    /// Set placeholder values from the properties of an object.
    ///
    /// With a `prefix` the properties fill `{prefix.property}` placeholders;
    /// nested objects extend the dotted path.
    pub fn with_path_parameters_object<T: Serialize + ?Sized>(
        mut self,
        prefix: Option<&str>,
        value: &T,
    ) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        if !value.is_object() {
            return Err(RemoteError::invalid_argument(
                "value",
                "path parameters must come from an object with named properties",
            ));
        }
        flatten_parameters(prefix, &value, &mut self.spec.path_parameters);
        Ok(self)
    }

    // Query

    fn push_query(&mut self, key: String, value: String, raw: bool) {
        let value = QueryValue { value, raw };
        match self.spec.query.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.spec.query.push((key, vec![value])),
        }
    }

    /// Add a query parameter; repeated keys keep every value in order.
    pub fn with_query_parameter(mut self, key: impl Into<String>, value: impl ToString) -> Result<Self> {
        let key = key.into();
        require("key", &key)?;
        self.push_query(key, value.to_string(), false);
        Ok(self)
    }

    /// Add several query parameters.
    pub fn with_query_parameters<I, K, V>(mut self, parameters: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (key, value) in parameters {
            self = self.with_query_parameter(key, value)?;
        }
        Ok(self)
    }

    /// Add the properties of an object as query parameters.
    ///
    /// Array properties repeat their key.
    pub fn with_query_parameters_object<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let pairs = object_pairs(&serde_json::to_value(value)?)
            .map_err(|e| RemoteError::invalid_argument("value", e.to_string()))?;
        for (key, value) in pairs {
            self.push_query(key, value, false);
        }
        Ok(self)
    }

    /// Add a query parameter whose value is sent without escaping.
    pub fn with_raw_query_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self> {
        let key = key.into();
        require("key", &key)?;
        self.push_query(key, value.into(), true);
        Ok(self)
    }

    /// Drop query parameters by key, including ones already in the URI.
    pub fn remove_query_parameters<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.removed_query.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Set the fragment; a leading `#` is accepted.
    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.spec.fragment = Some(fragment.into());
        self
    }

    // Headers and cookies

    /// Add a header value; repeated names keep every value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl ToString) -> Result<Self> {
        let name = name.into();
        require("name", &name)?;
        let value = value.to_string();
        match self
            .spec
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some((_, values)) => values.push(value),
            None => self.spec.headers.push((name, vec![value])),
        }
        Ok(self)
    }

    /// Add several headers.
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (name, value) in headers {
            self = self.with_header(name, value)?;
        }
        Ok(self)
    }

    /// Drop headers by name (case-insensitive).
    pub fn remove_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.spec
            .removed_headers
            .extend(names.into_iter().map(|n| n.as_ref().to_ascii_lowercase()));
        self
    }

    /// Set a cookie.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl ToString) -> Result<Self> {
        let name = name.into();
        require("name", &name)?;
        let value = value.to_string();
        match self.spec.cookies.iter_mut().find(|(n, _)| *n == name) {
            Some(cookie) => cookie.1 = value,
            None => self.spec.cookies.push((name, value)),
        }
        Ok(self)
    }

    /// Set several cookies.
    pub fn with_cookies<I, K, V>(mut self, cookies: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (name, value) in cookies {
            self = self.with_cookie(name, value)?;
        }
        Ok(self)
    }

    /// Drop cookies by name.
    pub fn remove_cookies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.removed_cookies.extend(names.into_iter().map(Into::into));
        self
    }

    // Content

    /// Set the raw content value.
    ///
    /// The media type is inferred from the value unless set explicitly.
    pub fn with_content(mut self, value: impl Into<ContentValue>) -> Self {
        self.spec.content = Some(value.into());
        self
    }

    /// Set a plain-text body.
    pub fn with_text_content(mut self, text: impl Into<String>) -> Self {
        self.spec.content = Some(ContentValue::Text(text.into()));
        self.spec.content_type = Some(TEXT_PLAIN.to_string());
        self
    }

    /// Set a JSON body.
    pub fn with_json_content<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.spec.content = Some(ContentValue::object(value)?);
        self.spec.content_type = Some(APPLICATION_JSON.to_string());
        Ok(self)
    }

    /// Set an HTML body.
    pub fn with_html_content(mut self, html: impl Into<String>) -> Self {
        self.spec.content = Some(ContentValue::Text(html.into()));
        self.spec.content_type = Some(TEXT_HTML.to_string());
        self
    }

    /// Set an XML body.
    pub fn with_xml_content(mut self, xml: impl Into<String>) -> Self {
        self.spec.content = Some(ContentValue::Text(xml.into()));
        self.spec.content_type = Some(APPLICATION_XML.to_string());
        self
    }

    /// Set a URL-encoded form body from an object's properties.
    pub fn with_form_url_encoded_content<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.spec.content = Some(ContentValue::object(value)?);
        self.spec.content_type = Some(FORM_URL_ENCODED.to_string());
        Ok(self)
    }

    /// Set a binary body.
    pub fn with_bytes_content(mut self, bytes: impl Into<bytes::Bytes>) -> Self {
        self.spec.content = Some(ContentValue::Bytes(bytes.into()));
        self
    }

    /// Set a streamed body; the stream is closed after dispatch.
    pub fn with_stream_content(mut self, stream: BodyStream) -> Self {
        let handle = stream.clone();
        self.disposables.get_mut().push(Box::new(move || handle.close()));
        self.spec.content = Some(ContentValue::Stream(stream));
        self
    }

    /// Set the media type of the content; may carry a `charset` parameter.
    ///
    /// Multipart types are rejected; use
    /// [`with_multipart_content`](Self::with_multipart_content).
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Result<Self> {
        let content_type = content_type.into();
        require("content_type", &content_type)?;
        let media_type = MediaType::parse(&content_type)?;
        if media_type.is_multipart() {
            return Err(RemoteError::UnsupportedOperation(
                "multipart content must be set with with_multipart_content".to_string(),
            ));
        }
        self.spec.content_type = Some(content_type);
        Ok(self)
    }

    /// Set the text encoding, overriding any charset in the media type.
    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Result<Self> {
        let encoding = encoding.into();
        require("encoding", &encoding)?;
        self.spec.content_encoding = Some(encoding);
        Ok(self)
    }

    /// Send a multipart form; it takes precedence over scalar content.
    ///
    /// The form's disposables move onto this builder.
    pub fn with_multipart_content(mut self, form: MultipartFormBuilder) -> Self {
        let (form, disposables) = form.into_parts();
        self.disposables.get_mut().extend(disposables);
        self.spec.multipart = Some(form);
        self
    }

    // Authentication and identity

    /// Set `Authorization: <scheme> <parameter>`.
    pub fn with_authentication(
        mut self,
        scheme: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Result<Self> {
        let scheme = scheme.into();
        require("scheme", &scheme)?;
        let parameter = parameter.into();
        self.spec.authorization = Some(if parameter.is_empty() {
            scheme
        } else {
            format!("{scheme} {parameter}")
        });
        Ok(self)
    }

    /// Set bearer token authentication.
    pub fn with_bearer_token(self, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        require("token", &token)?;
        self.with_authentication("Bearer", token)
    }

    /// Set basic authentication.
    pub fn with_basic_authentication(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let username = username.into();
        require("username", &username)?;
        let credentials = BASE64.encode(format!("{username}:{}", password.into()));
        self.with_authentication("Basic", credentials)
    }

    /// Send a trace identifier in the configured trace header.
    pub fn with_trace_identifier(mut self, identifier: impl Into<String>) -> Result<Self> {
        let identifier = identifier.into();
        require("identifier", &identifier)?;
        self.spec.trace_identifier = Some(identifier);
        Ok(self)
    }

    /// Set the `Referer`; `{BASE_ADDRESS}` expands to the resolved base address.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Result<Self> {
        let referer = referer.into();
        require("referer", &referer)?;
        self.spec.referer = Some(referer);
        Ok(self)
    }

    /// Force a protocol version.
    pub fn with_http_version(mut self, version: http::Version) -> Self {
        self.spec.http_version = Some(version);
        self
    }

    // Transport

    /// Dispatch through the named pooled client.
    pub fn with_http_client_name(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        require("name", &name)?;
        self.spec.client_name = Some(name);
        Ok(self)
    }

    /// Dispatch through a client supplied by `provider`.
    ///
    /// The provider returning `None` fails the dispatch; the handle's release
    /// action runs once after the call.
    pub fn with_http_client_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<ClientHandle> + Send + Sync + 'static,
    {
        self.spec.client_provider = Some(Arc::new(provider));
        self
    }

    /// Set the request-level timeout; zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    /// Invoke `callback` when the request-level timeout expires.
    pub fn with_timeout_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.spec.timeout_callback = Some(Arc::new(callback));
        self
    }

    /// Register a cleanup action run after every dispatch.
    pub fn add_disposable<F>(mut self, dispose: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.disposables.get_mut().push(Box::new(dispose));
        self
    }

    // Flags

    /// Fail on non-2xx statuses.
    pub fn ensure_success_status_code(mut self) -> Self {
        self.spec.ensure_success = true;
        self
    }

    /// Degrade failures covered by `kinds` to an empty result.
    pub fn suppress_exceptions(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.spec.suppressed.extend(kinds);
        self
    }

    /// Degrade every suppressible failure to an empty result.
    pub fn suppress_all_exceptions(self) -> Self {
        self.suppress_exceptions([ErrorKind::Any])
    }

    /// Reuse the pooled client instead of building one per call.
    pub fn with_client_pooling(mut self) -> Self {
        self.spec.client_pooling = true;
        self
    }

    /// Send `Cache-Control: no-cache` and `Pragma: no-cache`.
    pub fn disable_cache(mut self) -> Self {
        self.spec.disable_cache = true;
        self
    }

    /// Send a `Host` header derived from the resolved URI.
    pub fn auto_set_host_header(mut self) -> Self {
        self.spec.auto_host = true;
        self
    }

    /// Skip response buffering and profiling.
    pub fn performance_optimization(mut self) -> Self {
        self.spec.performance_optimization = true;
        self
    }

    /// Skip profiling output for this request.
    pub fn disable_profiling(mut self) -> Self {
        self.spec.disable_profiling = true;
        self
    }

    /// Read every typed result through the structured-object converter.
    pub fn always_use_object_converter(mut self) -> Self {
        self.spec.always_use_object_converter = true;
        self
    }

    // Hooks

    /// Run `handler` for every response whose status `matcher` accepts.
    pub fn with_status_code_handler<F>(mut self, matcher: impl Into<StatusCodeMatcher>, handler: F) -> Self
    where
        F: Fn(&HttpResponse) -> Result<()> + Send + Sync + 'static,
    {
        self.spec
            .status_handlers
            .push((matcher.into(), Arc::new(handler)));
        self
    }

    /// Attach an event handler invoked alongside the inline hooks.
    pub fn with_event_handler(mut self, handler: impl HttpRequestEventHandler + 'static) -> Self {
        self.spec.event_handler = Some(Arc::new(handler));
        self
    }

    /// Run `hook` on the resolved request before it is sent.
    pub fn on_pre_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut HttpRequest) -> Result<()> + Send + Sync + 'static,
    {
        self.spec.pre_send = Some(Arc::new(hook));
        self
    }

    /// Run `hook` on a successful response.
    pub fn on_post_receive<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpResponse) -> Result<()> + Send + Sync + 'static,
    {
        self.spec.post_receive = Some(Arc::new(hook));
        self
    }

    /// Run `hook` when the call fails.
    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RemoteError) + Send + Sync + 'static,
    {
        self.spec.on_failure = Some(Arc::new(hook));
        self
    }

    /// Run `hook` on the body right before it is attached.
    pub fn on_pre_set_content<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut HttpContent) + Send + Sync + 'static,
    {
        self.spec.pre_set_content = Some(Arc::new(hook));
        self
    }

    // Terminal operations

    /// Resolve the builder into a wire request.
    ///
    /// Relative URIs resolve against, in order, this builder's base address,
    /// `base_address`, then the options' fallback.
    pub fn build(
        &self,
        options: &HttpRemoteOptions,
        processors: &ContentProcessorChain,
        base_address: Option<&Url>,
    ) -> Result<HttpRequest> {
        let (url, base) = self.resolve_url(options, base_address)?;
        let headers = self.build_headers(options, &url, base.as_ref())?;
        let content = self.build_content(processors)?;

        Ok(HttpRequest {
            method: self.spec.method,
            url,
            version: self.spec.http_version,
            headers,
            content,
            metadata: RequestMetadata {
                client_name: self.spec.client_name.clone(),
                disable_profiling: self.spec.disable_profiling,
                performance_optimization: self.spec.performance_optimization,
                always_use_object_converter: self.spec.always_use_object_converter,
            },
        })
    }

    /// Run and clear every registered disposable.
    pub fn release_resources(&self) {
        let disposables = std::mem::take(&mut *self.disposables.lock());
        for dispose in disposables {
            dispose();
        }
    }

    /// Number of pending disposables.
    pub fn disposable_count(&self) -> usize {
        self.disposables.lock().len()
    }

    /// Derive the builder for following a redirect to `location`.
    ///
    /// 301, 302 and 303 turn methods other than GET and HEAD into a GET
    /// without content; 307 and 308 keep method and content. A relative
    /// location resolves against this request's URI. Authorization is
    /// dropped when the target host differs.
    pub fn redirect_to(&self, location: &str, status: u16) -> Result<Self> {
        if !matches!(status, 301 | 302 | 303 | 307 | 308) {
            return Err(RemoteError::invalid_argument(
                "status",
                format!("{status} is not a redirect status"),
            ));
        }
        require("location", location)?;

        let previous = self
            .resolve_url(&HttpRemoteOptions::default(), None)
            .ok()
            .map(|(url, _)| url);
        let target = match Url::parse(location) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let previous = previous.as_ref().ok_or_else(|| {
                    RemoteError::Configuration(format!(
                        "cannot resolve relative redirect '{location}' without an absolute request URI"
                    ))
                })?;
                previous.join(location)?
            }
            Err(e) => return Err(RemoteError::invalid_argument("location", e.to_string())),
        };

        let mut spec = self.spec.clone();
        spec.uri = Some(target.to_string());
        spec.base_address = None;
        spec.path_segments.clear();
        spec.query.clear();
        if target.fragment().is_some() {
            spec.fragment = None;
        }

        if matches!(status, 301..=303) && !spec.method.is_get_or_head() {
            spec.method = HttpMethod::Get;
            spec.content = None;
            spec.content_type = None;
            spec.content_encoding = None;
            spec.multipart = None;
        }

        let same_origin = previous.as_ref().is_some_and(|previous| {
            previous.host_str() == target.host_str()
                && previous.port_or_known_default() == target.port_or_known_default()
        });
        if !same_origin {
            spec.authorization = None;
            spec.headers
                .retain(|(name, _)| !name.eq_ignore_ascii_case(header::AUTHORIZATION.as_str()));
        }

        Ok(Self {
            spec,
            disposables: Mutex::new(Vec::new()),
        })
    }

    fn resolve_url(
        &self,
        options: &HttpRemoteOptions,
        caller_base: Option<&Url>,
    ) -> Result<(Url, Option<Url>)> {
        let spec = &self.spec;
        let lookup = options.configuration.as_ref();
        let expand = |text: &str| {
            replace_path_placeholders(
                &replace_configuration_placeholders(text, lookup),
                &spec.path_parameters,
            )
        };

        let spec_base = match &spec.base_address {
            Some(address) => Some(Url::parse(&expand(address)).map_err(|e| {
                RemoteError::Configuration(format!("invalid base address '{address}': {e}"))
            })?),
            None => None,
        };
        let base = spec_base
            .or_else(|| caller_base.cloned())
            .or_else(|| options.fallback_base_address.clone());

        let template = expand(spec.uri.as_deref().unwrap_or_default());
        let mut url = match Url::parse(&template) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => match &base {
                Some(base) => join_relative(base, &template)?,
                None => {
                    return Err(RemoteError::Configuration(format!(
                        "request URI '{template}' is relative and no base address is configured"
                    )));
                }
            },
            Err(e) => {
                return Err(RemoteError::Configuration(format!(
                    "invalid request URI '{template}': {e}"
                )));
            }
        };

        let segments: Vec<&str> = spec
            .path_segments
            .iter()
            .flat_map(|segment| segment.split('/'))
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .filter(|segment| !spec.removed_path_segments.contains(*segment))
            .collect();
        if !segments.is_empty() {
            url.path_segments_mut()
                .map_err(|()| {
                    RemoteError::Configuration("request URI cannot take path segments".to_string())
                })?
                .pop_if_empty()
                .extend(segments);
        }

        let mut query: Vec<String> = Vec::new();
        if let Some(existing) = url.query() {
            for pair in existing.split('&').filter(|pair| !pair.is_empty()) {
                let removed = url::form_urlencoded::parse(pair.as_bytes())
                    .next()
                    .is_some_and(|(key, _)| spec.removed_query.contains(&*key));
                if !removed {
                    query.push(pair.to_string());
                }
            }
        }
        for (key, values) in &spec.query {
            if spec.removed_query.contains(key) {
                continue;
            }
            let key = escape_component(key);
            for value in values {
                let value = if value.raw {
                    value.value.clone()
                } else {
                    escape_component(&value.value)
                };
                query.push(format!("{key}={value}"));
            }
        }
        if query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&query.join("&")));
        }

        if let Some(fragment) = &spec.fragment {
            url.set_fragment(Some(fragment.strip_prefix('#').unwrap_or(fragment)));
        }

        Ok((url, base))
    }

    fn build_headers(
        &self,
        options: &HttpRemoteOptions,
        url: &Url,
        base: Option<&Url>,
    ) -> Result<HeaderMap> {
        let spec = &self.spec;
        let mut headers = HeaderMap::new();

        for (name, values) in &spec.headers {
            if spec.removed_headers.contains(&name.to_ascii_lowercase()) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())?;
            for value in values {
                headers.append(name.clone(), HeaderValue::from_str(value)?);
            }
        }

        let cookie = spec
            .cookies
            .iter()
            .filter(|(name, _)| !spec.removed_cookies.contains(name))
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        if !cookie.is_empty() {
            headers.insert(header::COOKIE, HeaderValue::from_str(&cookie)?);
        }

        if let Some(identifier) = &spec.trace_identifier {
            headers.insert(
                HeaderName::from_bytes(options.trace_identifier_header.as_bytes())?,
                HeaderValue::from_str(identifier)?,
            );
        }
        if let Some(authorization) = &spec.authorization {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(authorization)?);
        }
        if spec.disable_cache {
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        }
        if spec.auto_host
            && let Some(host) = url.host_str()
        {
            let host = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            headers.insert(header::HOST, HeaderValue::from_str(&host)?);
        }
        if let Some(referer) = &spec.referer {
            let base = match base {
                Some(base) => base.as_str().trim_end_matches('/').to_string(),
                None => url.origin().ascii_serialization(),
            };
            headers.insert(
                header::REFERER,
                HeaderValue::from_str(&referer.replace("{BASE_ADDRESS}", &base))?,
            );
        }

        Ok(headers)
    }

    fn build_content(&self, processors: &ContentProcessorChain) -> Result<Option<HttpContent>> {
        let spec = &self.spec;
        let content = match (&spec.multipart, &spec.content) {
            (Some(form), _) => form.build(processors)?,
            (None, Some(value)) => processors.process(
                value,
                spec.content_type.as_deref(),
                spec.content_encoding.as_deref(),
            )?,
            (None, None) => None,
        };

        let Some(mut content) = content else {
            return Ok(None);
        };
        if let Some(hook) = &spec.pre_set_content {
            hook(&mut content);
        }
        Ok(Some(content))
    }
}

impl std::fmt::Debug for HttpRequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequestBuilder")
            .field("method", &self.spec.method)
            .field("uri", &self.spec.uri)
            .field("base_address", &self.spec.base_address)
            .field("client_name", &self.spec.client_name)
            .field("timeout", &self.spec.timeout)
            .field("has_multipart", &self.spec.multipart.is_some())
            .field("disposables", &self.disposable_count())
            .finish()
    }
}
