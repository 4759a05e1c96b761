//! Content processors: serialize raw values into wire bodies.
//!
//! A [`ContentProcessorChain`] holds user processors followed by the
//! built-ins. The first processor whose [`can_process`] accepts the value's
//! runtime type (optionally narrowed by media type) serializes it.
//!
//! [`can_process`]: ContentProcessor::can_process

use std::sync::Arc;

use crate::error::{RemoteError, Result};
use crate::http::{
    ContentValue, FORM_URL_ENCODED, HttpContent, MediaType, encode_text, normalize_charset,
};

/// Settings processors may consult.
#[derive(Clone, Debug)]
pub struct ProcessOptions {
    /// Pretty-print JSON bodies.
    pub json_pretty: bool,
    /// Charset for text when none is requested.
    pub default_encoding: String,
    /// Media type inferred for text values.
    pub default_content_type: String,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            json_pretty: false,
            default_encoding: "utf-8".to_string(),
            default_content_type: crate::http::TEXT_PLAIN.to_string(),
        }
    }
}

/// Serializes a raw value into a wire body.
pub trait ContentProcessor: Send + Sync {
    /// Whether this processor handles `value` for `media_type`.
    fn can_process(&self, value: &ContentValue, media_type: &MediaType) -> bool;

    /// Serialize `value`; `None` means no body.
    fn process(
        &self,
        value: &ContentValue,
        media_type: &MediaType,
        options: &ProcessOptions,
    ) -> Result<Option<HttpContent>>;
}

fn charset_of(media_type: &MediaType, options: &ProcessOptions) -> String {
    media_type
        .charset()
        .unwrap_or_else(|| normalize_charset(&options.default_encoding))
}

fn with_charset(media_type: &MediaType, charset: &str) -> MediaType {
    let mut media_type = media_type.clone();
    media_type.set_param("charset", charset);
    media_type
}

/// Keeps pre-built bodies as they are.
#[derive(Debug, Default)]
pub struct HttpContentProcessor;

impl ContentProcessor for HttpContentProcessor {
    fn can_process(&self, value: &ContentValue, _media_type: &MediaType) -> bool {
        matches!(value, ContentValue::Prebuilt(_))
    }

    fn process(
        &self,
        value: &ContentValue,
        media_type: &MediaType,
        _options: &ProcessOptions,
    ) -> Result<Option<HttpContent>> {
        let ContentValue::Prebuilt(content) = value else {
            return Ok(None);
        };
        let mut content = content.clone();
        if content.media_type().is_none() {
            content.set_media_type(Some(media_type.clone()));
        }
        Ok(Some(content))
    }
}

/// Encodes text with the requested charset.
#[derive(Debug, Default)]
pub struct StringContentProcessor;

impl ContentProcessor for StringContentProcessor {
    fn can_process(&self, value: &ContentValue, _media_type: &MediaType) -> bool {
        matches!(value, ContentValue::Text(_))
    }

    fn process(
        &self,
        value: &ContentValue,
        media_type: &MediaType,
        options: &ProcessOptions,
    ) -> Result<Option<HttpContent>> {
        let ContentValue::Text(text) = value else {
            return Ok(None);
        };
        let charset = charset_of(media_type, options);
        let bytes = encode_text(text, &charset)?;
        Ok(Some(HttpContent::from_bytes(
            bytes,
            Some(with_charset(media_type, &charset)),
        )))
    }
}

/// Sends raw bytes.
#[derive(Debug, Default)]
pub struct ByteArrayContentProcessor;

impl ContentProcessor for ByteArrayContentProcessor {
    fn can_process(&self, value: &ContentValue, _media_type: &MediaType) -> bool {
        matches!(value, ContentValue::Bytes(_))
    }

    fn process(
        &self,
        value: &ContentValue,
        media_type: &MediaType,
        _options: &ProcessOptions,
    ) -> Result<Option<HttpContent>> {
        let ContentValue::Bytes(bytes) = value else {
            return Ok(None);
        };
        Ok(Some(HttpContent::from_bytes(bytes.clone(), Some(media_type.clone()))))
    }
}

/// Streams a one-shot body.
#[derive(Debug, Default)]
pub struct StreamContentProcessor;

impl ContentProcessor for StreamContentProcessor {
    fn can_process(&self, value: &ContentValue, _media_type: &MediaType) -> bool {
        matches!(value, ContentValue::Stream(_))
    }

    fn process(
        &self,
        value: &ContentValue,
        media_type: &MediaType,
        _options: &ProcessOptions,
    ) -> Result<Option<HttpContent>> {
        let ContentValue::Stream(stream) = value else {
            return Ok(None);
        };
        Ok(Some(HttpContent::from_stream(stream.clone(), Some(media_type.clone()))))
    }
}

/// Encodes key/value pairs (or a flat object) as a URL-encoded form.
#[derive(Debug, Default)]
pub struct FormUrlEncodedContentProcessor;

impl ContentProcessor for FormUrlEncodedContentProcessor {
    fn can_process(&self, value: &ContentValue, media_type: &MediaType) -> bool {
        match value {
            ContentValue::Form(_) => true,
            ContentValue::Object(_) => media_type.essence() == FORM_URL_ENCODED,
            _ => false,
        }
    }

    fn process(
        &self,
        value: &ContentValue,
        media_type: &MediaType,
        _options: &ProcessOptions,
    ) -> Result<Option<HttpContent>> {
        let pairs = match value {
            ContentValue::Form(pairs) => pairs.clone(),
            ContentValue::Object(object) => object_pairs(object)?,
            _ => return Ok(None),
        };
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        Ok(Some(HttpContent::from_bytes(encoded, Some(media_type.clone()))))
    }
}

/// Serializes structured values as JSON.
#[derive(Debug, Default)]
pub struct ObjectContentProcessor;

impl ContentProcessor for ObjectContentProcessor {
    fn can_process(&self, value: &ContentValue, _media_type: &MediaType) -> bool {
        matches!(value, ContentValue::Object(_))
    }

    fn process(
        &self,
        value: &ContentValue,
        media_type: &MediaType,
        options: &ProcessOptions,
    ) -> Result<Option<HttpContent>> {
        let ContentValue::Object(object) = value else {
            return Ok(None);
        };
        let json = if options.json_pretty {
            serde_json::to_string_pretty(object)?
        } else {
            serde_json::to_string(object)?
        };
        let charset = charset_of(media_type, options);
        let bytes = encode_text(&json, &charset)?;
        Ok(Some(HttpContent::from_bytes(
            bytes,
            Some(with_charset(media_type, &charset)),
        )))
    }
}

/// Render a JSON scalar the way it appears in a query string or form field.
pub(crate) fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Flatten the top level of an object into ordered pairs.
///
/// Arrays repeat their key; nested objects are written as JSON text.
pub(crate) fn object_pairs(value: &serde_json::Value) -> Result<Vec<(String, String)>> {
    let serde_json::Value::Object(map) = value else {
        return Err(RemoteError::Content(format!(
            "expected an object with named properties, found {value}"
        )));
    };
    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        match value {
            serde_json::Value::Array(items) => {
                pairs.extend(items.iter().map(|item| (key.clone(), scalar_to_string(item))));
            }
            other => pairs.push((key.clone(), scalar_to_string(other))),
        }
    }
    Ok(pairs)
}

/// Ordered processors: user registrations first, then the built-ins.
#[derive(Clone)]
pub struct ContentProcessorChain {
    processors: Vec<Arc<dyn ContentProcessor>>,
    options: ProcessOptions,
}

impl Default for ContentProcessorChain {
    fn default() -> Self {
        Self::new(Vec::new(), ProcessOptions::default())
    }
}

impl ContentProcessorChain {
    /// Create a chain with `user` processors ahead of the built-ins.
    pub fn new(user: Vec<Arc<dyn ContentProcessor>>, options: ProcessOptions) -> Self {
        let mut processors = user;
        processors.push(Arc::new(HttpContentProcessor));
        processors.push(Arc::new(StringContentProcessor));
        processors.push(Arc::new(ByteArrayContentProcessor));
        processors.push(Arc::new(StreamContentProcessor));
        processors.push(Arc::new(FormUrlEncodedContentProcessor));
        processors.push(Arc::new(ObjectContentProcessor));
        Self {
            processors,
            options,
        }
    }

    /// Settings passed to every processor.
    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    /// The first processor accepting `value` for `media_type`.
    pub fn select(
        &self,
        value: &ContentValue,
        media_type: &MediaType,
    ) -> Option<&Arc<dyn ContentProcessor>> {
        self.processors
            .iter()
            .find(|processor| processor.can_process(value, media_type))
    }

    /// Materialize `value` as a wire body.
    ///
    /// The media type is inferred from the value when not given; an explicit
    /// `encoding` overrides any charset carried by the media type.
    pub fn process(
        &self,
        value: &ContentValue,
        media_type: Option<&str>,
        encoding: Option<&str>,
    ) -> Result<Option<HttpContent>> {
        if value.is_empty() {
            return Ok(None);
        }

        let media_type = match media_type {
            Some(media_type) => Some(media_type.to_string()),
            None => value.inferred_media_type(&self.options.default_content_type),
        };
        let Some(media_type) = media_type else {
            return Ok(None);
        };
        let mut media_type = MediaType::parse(&media_type)?;
        if let Some(encoding) = encoding {
            media_type.set_param("charset", normalize_charset(encoding));
        }

        let processor = self.select(value, &media_type).ok_or_else(|| {
            RemoteError::Content(format!(
                "no content processor accepts {value:?} as '{}'",
                media_type.essence()
            ))
        })?;
        processor.process(value, &media_type, &self.options)
    }
}

impl std::fmt::Debug for ContentProcessorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentProcessorChain")
            .field("processors", &self.processors.len())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_uses_default_charset() {
        let chain = ContentProcessorChain::default();
        let content = chain
            .process(&ContentValue::from("hello"), None, None)
            .unwrap()
            .unwrap();
        assert_eq!(content.bytes().unwrap().as_ref(), b"hello");
        assert_eq!(
            content.media_type().unwrap().to_string(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_charset_from_media_type_string() {
        let chain = ContentProcessorChain::default();
        let content = chain
            .process(&ContentValue::from("é"), Some("text/plain;charset=latin1"), None)
            .unwrap()
            .unwrap();
        assert_eq!(content.bytes().unwrap().as_ref(), b"\xe9");
        assert_eq!(content.media_type().unwrap().charset().as_deref(), Some("iso-8859-1"));
    }

    #[test]
    fn test_bytes_infer_octet_stream() {
        let chain = ContentProcessorChain::default();
        let content = chain
            .process(&ContentValue::from(vec![1u8, 2, 3]), None, None)
            .unwrap()
            .unwrap();
        assert_eq!(content.media_type().unwrap().essence(), "application/octet-stream");
    }

    #[test]
    fn test_object_as_json_and_form() {
        let chain = ContentProcessorChain::default();
        let value = ContentValue::from(json!({"id": 10, "name": "furion", "tags": ["a", "b"]}));

        let content = chain.process(&value, None, None).unwrap().unwrap();
        assert_eq!(content.media_type().unwrap().essence(), "application/json");
        let parsed: serde_json::Value = serde_json::from_slice(content.bytes().unwrap()).unwrap();
        assert_eq!(parsed["name"], "furion");

        let content = chain.process(&value, Some(FORM_URL_ENCODED), None).unwrap().unwrap();
        assert_eq!(content.bytes().unwrap().as_ref(), b"id=10&name=furion&tags=a&tags=b");
    }

    #[test]
    fn test_form_keeps_declaration_order() {
        #[derive(serde::Serialize)]
        struct Login {
            user: &'static str,
            password: &'static str,
            remember: bool,
        }

        let value = ContentValue::Object(
            serde_json::to_value(Login {
                user: "furion",
                password: "secret",
                remember: true,
            })
            .unwrap(),
        );
        let content = ContentProcessorChain::default()
            .process(&value, Some(FORM_URL_ENCODED), None)
            .unwrap()
            .unwrap();
        assert_eq!(
            content.bytes().unwrap().as_ref(),
            b"user=furion&password=secret&remember=true"
        );
    }

    #[test]
    fn test_empty_value_has_no_body() {
        let chain = ContentProcessorChain::default();
        assert!(chain.process(&ContentValue::Empty, Some("text/plain"), None).unwrap().is_none());
    }

    #[test]
    fn test_invalid_media_type() {
        let chain = ContentProcessorChain::default();
        assert!(matches!(
            chain.process(&ContentValue::from("x"), Some("plain"), None),
            Err(RemoteError::Format(_))
        ));
    }

    #[test]
    fn test_custom_value_needs_processor() {
        struct Point(i32, i32);
        struct PointProcessor;
        impl ContentProcessor for PointProcessor {
            fn can_process(&self, value: &ContentValue, _media_type: &MediaType) -> bool {
                value.downcast_ref::<Point>().is_some()
            }
            fn process(
                &self,
                value: &ContentValue,
                media_type: &MediaType,
                _options: &ProcessOptions,
            ) -> Result<Option<HttpContent>> {
                let point = value.downcast_ref::<Point>().unwrap();
                Ok(Some(HttpContent::from_bytes(
                    format!("{},{}", point.0, point.1),
                    Some(media_type.clone()),
                )))
            }
        }

        let value = ContentValue::custom(Point(1, 2));
        assert!(ContentProcessorChain::default().process(&value, None, None).is_err());

        let chain = ContentProcessorChain::new(vec![Arc::new(PointProcessor)], ProcessOptions::default());
        let content = chain.process(&value, None, None).unwrap().unwrap();
        assert_eq!(content.bytes().unwrap().as_ref(), b"1,2");
    }

    #[test]
    fn test_user_processor_wins_over_builtin() {
        struct Shout;
        impl ContentProcessor for Shout {
            fn can_process(&self, value: &ContentValue, _media_type: &MediaType) -> bool {
                matches!(value, ContentValue::Text(_))
            }
            fn process(
                &self,
                value: &ContentValue,
                media_type: &MediaType,
                _options: &ProcessOptions,
            ) -> Result<Option<HttpContent>> {
                let ContentValue::Text(text) = value else { unreachable!() };
                Ok(Some(HttpContent::from_bytes(text.to_uppercase(), Some(media_type.clone()))))
            }
        }

        let chain = ContentProcessorChain::new(vec![Arc::new(Shout)], ProcessOptions::default());
        let content = chain.process(&ContentValue::from("hi"), None, None).unwrap().unwrap();
        assert_eq!(content.bytes().unwrap().as_ref(), b"HI");
    }
}
