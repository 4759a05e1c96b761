//! Request content: raw values, wire bodies and media types.

use std::any::{Any, TypeId};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{RemoteError, Result};

/// Media type of `application/json` bodies.
pub const APPLICATION_JSON: &str = "application/json";
/// Media type of URL-encoded form bodies.
pub const FORM_URL_ENCODED: &str = "application/x-www-form-urlencoded";
/// Media type of binary bodies.
pub const OCTET_STREAM: &str = "application/octet-stream";
/// Media type of multipart form bodies.
pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";
/// Media type of plain text bodies.
pub const TEXT_PLAIN: &str = "text/plain";
/// Media type of HTML bodies.
pub const TEXT_HTML: &str = "text/html";
/// Media type of XML bodies.
pub const APPLICATION_XML: &str = "application/xml";
/// Media type of server-sent event streams.
pub const TEXT_EVENT_STREAM: &str = "text/event-stream";

/// A parsed `type/subtype; key=value` media type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaType {
    essence: String,
    params: Vec<(String, String)>,
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

impl MediaType {
    /// Parse a media type string.
    pub fn parse(input: &str) -> Result<Self> {
        let mut pieces = input.split(';');
        let essence = pieces.next().unwrap_or_default().trim();
        let (kind, subtype) = essence
            .split_once('/')
            .ok_or_else(|| RemoteError::Format(format!("'{input}' is not a valid media type")))?;
        if !is_token(kind) || !is_token(subtype) {
            return Err(RemoteError::Format(format!("'{input}' is not a valid media type")));
        }

        let mut params = Vec::new();
        for piece in pieces {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let (key, value) = piece.split_once('=').ok_or_else(|| {
                RemoteError::Format(format!("invalid media type parameter '{piece}'"))
            })?;
            let key = key.trim();
            if !is_token(key) {
                return Err(RemoteError::Format(format!("invalid media type parameter '{piece}'")));
            }
            let value = value.trim().trim_matches('"').to_string();
            params.push((key.to_ascii_lowercase(), value));
        }

        Ok(Self {
            essence: essence.to_ascii_lowercase(),
            params,
        })
    }

    /// The `type/subtype` part, lowercased.
    pub fn essence(&self) -> &str {
        &self.essence
    }

    /// Look up a parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace a parameter.
    pub fn set_param(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.params.push((name.to_ascii_lowercase(), value)),
        }
    }

    /// The normalized charset parameter, if any.
    pub fn charset(&self) -> Option<String> {
        self.param("charset").map(normalize_charset)
    }

    /// Whether this is a JSON media type (`application/json`, `*+json`).
    pub fn is_json(&self) -> bool {
        self.essence == APPLICATION_JSON || self.essence.ends_with("+json")
    }

    /// Whether this is any `multipart/*` type.
    pub fn is_multipart(&self) -> bool {
        self.essence.starts_with("multipart/")
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.essence)?;
        for (key, value) in &self.params {
            if is_token(value) {
                write!(f, "; {key}={value}")?;
            } else {
                write!(f, "; {key}=\"{value}\"")?;
            }
        }
        Ok(())
    }
}

/// Normalize a charset label (`UTF8` becomes `utf-8`).
pub fn normalize_charset(label: &str) -> String {
    let label = label.trim().trim_matches('"').to_ascii_lowercase();
    match label.as_str() {
        "utf8" => "utf-8".to_string(),
        "latin1" | "latin-1" => "iso-8859-1".to_string(),
        "ascii" => "us-ascii".to_string(),
        _ => label,
    }
}

/// Encode text with one of the supported charsets.
pub(crate) fn encode_text(text: &str, charset: &str) -> Result<Bytes> {
    match normalize_charset(charset).as_str() {
        "utf-8" => Ok(Bytes::copy_from_slice(text.as_bytes())),
        "us-ascii" => {
            if text.is_ascii() {
                Ok(Bytes::copy_from_slice(text.as_bytes()))
            } else {
                Err(RemoteError::Content("text is not representable as us-ascii".to_string()))
            }
        }
        "iso-8859-1" => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect::<Option<Vec<u8>>>()
            .map(Bytes::from)
            .ok_or_else(|| {
                RemoteError::Content("text is not representable as iso-8859-1".to_string())
            }),
        other => Err(RemoteError::Format(format!("unsupported charset '{other}'"))),
    }
}

/// Decode text with one of the supported charsets.
pub(crate) fn decode_text(bytes: &[u8], charset: Option<&str>) -> Result<String> {
    match charset.map(normalize_charset).as_deref() {
        None | Some("utf-8") | Some("us-ascii") => String::from_utf8(bytes.to_vec())
            .map_err(|e| RemoteError::Content(format!("invalid utf-8 body: {e}"))),
        Some("iso-8859-1") => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        Some(other) => Err(RemoteError::Format(format!("unsupported charset '{other}'"))),
    }
}

/// A boxed stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// A one-shot body stream.
///
/// Clones share the same underlying stream; the first [`take`](Self::take)
/// wins and [`close`](Self::close) drops it (closing any file handle or
/// connection it owns).
#[derive(Clone)]
pub struct BodyStream {
    inner: Arc<Mutex<Option<ByteStream>>>,
}

impl BodyStream {
    /// Wrap a stream of chunks.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::pin(stream)))),
        }
    }

    /// Take the stream out, leaving the handle consumed.
    pub fn take(&self) -> Option<ByteStream> {
        self.inner.lock().take()
    }

    /// Drop the stream if it has not been consumed yet.
    pub fn close(&self) {
        self.inner.lock().take();
    }

    /// Whether the stream was already taken or closed.
    pub fn is_consumed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Bytes of a wire body.
#[derive(Clone, Debug)]
pub enum ContentBody {
    /// A fully buffered body.
    Bytes(Bytes),
    /// A streamed body.
    Stream(BodyStream),
}

/// A materialized wire body with its media type.
#[derive(Clone, Debug)]
pub struct HttpContent {
    body: ContentBody,
    media_type: Option<MediaType>,
    headers: Vec<(String, String)>,
}

impl HttpContent {
    /// Create a buffered body.
    pub fn from_bytes(bytes: impl Into<Bytes>, media_type: Option<MediaType>) -> Self {
        Self {
            body: ContentBody::Bytes(bytes.into()),
            media_type,
            headers: Vec::new(),
        }
    }

    /// Create a streamed body.
    pub fn from_stream(stream: BodyStream, media_type: Option<MediaType>) -> Self {
        Self {
            body: ContentBody::Stream(stream),
            media_type,
            headers: Vec::new(),
        }
    }

    /// The body.
    pub fn body(&self) -> &ContentBody {
        &self.body
    }

    /// The buffered bytes, if the body is not streamed.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.body {
            ContentBody::Bytes(bytes) => Some(bytes),
            ContentBody::Stream(_) => None,
        }
    }

    /// Length of a buffered body.
    pub fn len(&self) -> Option<u64> {
        self.bytes().map(|b| b.len() as u64)
    }

    /// Whether the body is buffered and empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// The media type.
    pub fn media_type(&self) -> Option<&MediaType> {
        self.media_type.as_ref()
    }

    /// Replace the media type.
    pub fn set_media_type(&mut self, media_type: Option<MediaType>) {
        self.media_type = media_type;
    }

    /// Extra content headers (used by multipart parts).
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Add an extra content header.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Convert into a transport body.
    pub(crate) fn into_reqwest_body(self) -> Result<reqwest::Body> {
        match self.body {
            ContentBody::Bytes(bytes) => Ok(reqwest::Body::from(bytes)),
            ContentBody::Stream(stream) => stream
                .take()
                .map(reqwest::Body::wrap_stream)
                .ok_or_else(|| RemoteError::Content("body stream was already consumed".to_string())),
        }
    }
}

/// The raw value of request content before serialization.
///
/// Processors select on the runtime type of the value, reported by
/// [`type_key`](Self::type_key).
#[derive(Clone, Default)]
pub enum ContentValue {
    /// No content.
    #[default]
    Empty,
    /// Text.
    Text(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// A one-shot stream.
    Stream(BodyStream),
    /// Ordered key/value pairs.
    Form(Vec<(String, String)>),
    /// A structured value.
    Object(serde_json::Value),
    /// A body that was already materialized.
    Prebuilt(HttpContent),
    /// Any other type; needs a registered processor.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl ContentValue {
    /// Capture a serializable value.
    pub fn object<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Object(serde_json::to_value(value)?))
    }

    /// Capture a value of a custom type.
    pub fn custom<T: Any + Send + Sync>(value: T) -> Self {
        Self::Custom(Arc::new(value))
    }

    /// The runtime type of the raw value.
    pub fn type_key(&self) -> TypeId {
        match self {
            Self::Empty => TypeId::of::<()>(),
            Self::Text(_) => TypeId::of::<String>(),
            Self::Bytes(_) => TypeId::of::<Bytes>(),
            Self::Stream(_) => TypeId::of::<BodyStream>(),
            Self::Form(_) => TypeId::of::<Vec<(String, String)>>(),
            Self::Object(_) => TypeId::of::<serde_json::Value>(),
            Self::Prebuilt(_) => TypeId::of::<HttpContent>(),
            Self::Custom(value) => Any::type_id(value.as_ref()),
        }
    }

    /// Borrow a custom value as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Custom(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Whether there is no value.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty) || matches!(self, Self::Object(serde_json::Value::Null))
    }

    /// Media type inferred from the shape of the value.
    pub fn inferred_media_type(&self, default_text: &str) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Text(_) => Some(default_text.to_string()),
            Self::Bytes(_) | Self::Stream(_) | Self::Custom(_) => Some(OCTET_STREAM.to_string()),
            Self::Form(_) => Some(FORM_URL_ENCODED.to_string()),
            Self::Object(serde_json::Value::Null) => None,
            Self::Object(_) => Some(APPLICATION_JSON.to_string()),
            Self::Prebuilt(content) => content.media_type().map(ToString::to_string),
        }
    }
}

impl fmt::Debug for ContentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
            Self::Form(pairs) => f.debug_tuple("Form").field(pairs).finish(),
            Self::Object(value) => f.debug_tuple("Object").field(value).finish(),
            Self::Prebuilt(content) => f.debug_tuple("Prebuilt").field(content).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl From<String> for ContentValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ContentValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Bytes> for ContentValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for ContentValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<BodyStream> for ContentValue {
    fn from(value: BodyStream) -> Self {
        Self::Stream(value)
    }
}

impl From<HttpContent> for ContentValue {
    fn from(value: HttpContent) -> Self {
        Self::Prebuilt(value)
    }
}

impl From<serde_json::Value> for ContentValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Object(value)
    }
}
