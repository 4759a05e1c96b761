//! Content converters: read response bodies into typed values.
//!
//! Converters are selected by the requested result type, the response media
//! type and the request's "always use the object converter" flag. Selection
//! prefers a converter reporting [`TypeMatch::Exact`] over one reporting
//! [`TypeMatch::Family`]; within the same strength the first registered wins,
//! and user registrations sit ahead of the built-ins.

use std::any::{Any, TypeId};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::cancellation::{CancellationToken, wait_cancelled};
use crate::error::{RemoteError, Result};
use crate::http::{HttpResponse, MediaType, NoContent, ResponseStream};

/// Deserializes a body into a boxed value of the target type.
pub type DeserializeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>>;

fn deserialize_json<T: DeserializeOwned + Send + 'static>(bytes: &[u8]) -> Result<Box<dyn Any + Send>> {
    let value: T = serde_json::from_slice(bytes)?;
    Ok(Box::new(value))
}

/// Description of the type a response should be read into.
#[derive(Clone, Copy, Debug)]
pub struct TargetType {
    type_id: TypeId,
    type_name: &'static str,
    deserialize: Option<DeserializeFn>,
}

impl TargetType {
    /// A target with no structured deserializer.
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            deserialize: None,
        }
    }

    /// A target the structured-object converter can produce.
    pub fn deserializable<T: DeserializeOwned + Send + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            deserialize: Some(deserialize_json::<T>),
        }
    }

    /// Whether the target is exactly `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// The target's type id.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The target's type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Deserialize `bytes` into the target, if it supports it.
    pub fn deserialize(&self, bytes: &[u8]) -> Option<Result<Box<dyn Any + Send>>> {
        self.deserialize.map(|deserialize| deserialize(bytes))
    }
}

/// How well a converter fits a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeMatch {
    /// Not applicable.
    No,
    /// Applicable to a whole family of types.
    Family,
    /// Built for exactly this type.
    Exact,
}

/// What a converter may inspect when deciding applicability.
#[derive(Clone, Copy, Debug)]
pub struct ConversionContext<'a> {
    /// Media type of the response body.
    pub media_type: Option<&'a MediaType>,
    /// Force the structured-object converter.
    pub always_use_object_converter: bool,
}

/// Reads a response into a value of a target type.
pub trait ContentConverter: Send + Sync {
    /// How well this converter fits `target` in `context`.
    fn can_convert(&self, target: &TargetType, context: &ConversionContext<'_>) -> TypeMatch;

    /// Read `response` into a boxed value of `target`.
    fn read<'a>(
        &'a self,
        response: HttpResponse,
        target: &'a TargetType,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>>>;
}

/// Passes the response object through.
#[derive(Debug, Default)]
pub struct HttpResponseConverter;

impl ContentConverter for HttpResponseConverter {
    fn can_convert(&self, target: &TargetType, _context: &ConversionContext<'_>) -> TypeMatch {
        if target.is::<HttpResponse>() {
            TypeMatch::Exact
        } else {
            TypeMatch::No
        }
    }

    fn read<'a>(
        &'a self,
        response: HttpResponse,
        _target: &'a TargetType,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>>> {
        async move { Ok(Box::new(response) as Box<dyn Any + Send>) }.boxed()
    }
}

/// Reads the body as text.
#[derive(Debug, Default)]
pub struct StringContentConverter;

impl ContentConverter for StringContentConverter {
    fn can_convert(&self, target: &TargetType, context: &ConversionContext<'_>) -> TypeMatch {
        if target.is::<String>() && !context.always_use_object_converter {
            TypeMatch::Exact
        } else {
            TypeMatch::No
        }
    }

    fn read<'a>(
        &'a self,
        response: HttpResponse,
        _target: &'a TargetType,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>>> {
        async move { Ok(Box::new(response.text().await?) as Box<dyn Any + Send>) }.boxed()
    }
}

/// Reads the body as raw bytes.
#[derive(Debug, Default)]
pub struct ByteArrayContentConverter;

impl ContentConverter for ByteArrayContentConverter {
    fn can_convert(&self, target: &TargetType, _context: &ConversionContext<'_>) -> TypeMatch {
        if target.is::<Vec<u8>>() || target.is::<Bytes>() {
            TypeMatch::Exact
        } else {
            TypeMatch::No
        }
    }

    fn read<'a>(
        &'a self,
        response: HttpResponse,
        target: &'a TargetType,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>>> {
        async move {
            let bytes = response.bytes().await?;
            if target.is::<Bytes>() {
                Ok(Box::new(bytes) as Box<dyn Any + Send>)
            } else {
                Ok(Box::new(bytes.to_vec()) as Box<dyn Any + Send>)
            }
        }
        .boxed()
    }
}

/// Hands out the body as a stream.
#[derive(Debug, Default)]
pub struct StreamContentConverter;

impl ContentConverter for StreamContentConverter {
    fn can_convert(&self, target: &TargetType, _context: &ConversionContext<'_>) -> TypeMatch {
        if target.is::<ResponseStream>() {
            TypeMatch::Exact
        } else {
            TypeMatch::No
        }
    }

    fn read<'a>(
        &'a self,
        response: HttpResponse,
        _target: &'a TargetType,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>>> {
        async move { Ok(Box::new(response.bytes_stream()) as Box<dyn Any + Send>) }.boxed()
    }
}

/// Discards the body.
#[derive(Debug, Default)]
pub struct VoidContentConverter;

impl ContentConverter for VoidContentConverter {
    fn can_convert(&self, target: &TargetType, _context: &ConversionContext<'_>) -> TypeMatch {
        if target.is::<NoContent>() {
            TypeMatch::Exact
        } else {
            TypeMatch::No
        }
    }

    fn read<'a>(
        &'a self,
        _response: HttpResponse,
        _target: &'a TargetType,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>>> {
        async move { Ok(Box::new(NoContent) as Box<dyn Any + Send>) }.boxed()
    }
}

/// Deserializes any structured type from JSON.
#[derive(Debug, Default)]
pub struct ObjectContentConverter;

impl ContentConverter for ObjectContentConverter {
    fn can_convert(&self, target: &TargetType, _context: &ConversionContext<'_>) -> TypeMatch {
        if target.deserialize.is_some() {
            TypeMatch::Family
        } else {
            TypeMatch::No
        }
    }

    fn read<'a>(
        &'a self,
        response: HttpResponse,
        target: &'a TargetType,
    ) -> BoxFuture<'a, Result<Box<dyn Any + Send>>> {
        async move {
            let bytes = response.bytes().await?;
            target.deserialize(&bytes).unwrap_or_else(|| {
                Err(RemoteError::Content(format!(
                    "{} cannot be deserialized",
                    target.type_name()
                )))
            })
        }
        .boxed()
    }
}

/// Ordered converters: user registrations first, then the built-ins.
#[derive(Clone)]
pub struct ContentConverterChain {
    converters: Vec<Arc<dyn ContentConverter>>,
}

impl Default for ContentConverterChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ContentConverterChain {
    /// Create a chain with `user` converters ahead of the built-ins.
    pub fn new(user: Vec<Arc<dyn ContentConverter>>) -> Self {
        let mut converters = user;
        converters.push(Arc::new(HttpResponseConverter));
        converters.push(Arc::new(StringContentConverter));
        converters.push(Arc::new(ByteArrayContentConverter));
        converters.push(Arc::new(StreamContentConverter));
        converters.push(Arc::new(VoidContentConverter));
        converters.push(Arc::new(ObjectContentConverter));
        Self { converters }
    }

    /// The converter to use for `target` in `context`.
    pub fn select(
        &self,
        target: &TargetType,
        context: &ConversionContext<'_>,
    ) -> Option<&Arc<dyn ContentConverter>> {
        let mut family = None;
        for converter in &self.converters {
            match converter.can_convert(target, context) {
                TypeMatch::Exact => return Some(converter),
                TypeMatch::Family if family.is_none() => family = Some(converter),
                _ => {}
            }
        }
        family
    }

    /// Read `response` into `T`, honouring `cancel`.
    ///
    /// Converter failures are logged and returned unchanged.
    pub async fn read<T: Any + Send>(
        &self,
        response: HttpResponse,
        target: TargetType,
        cancel: Option<&CancellationToken>,
    ) -> Result<T> {
        let media_type = response.content_type();
        let context = ConversionContext {
            media_type: media_type.as_ref(),
            always_use_object_converter: response.metadata().always_use_object_converter,
        };
        let converter = self.select(&target, &context).ok_or_else(|| {
            RemoteError::Content(format!("no content converter produces {}", target.type_name()))
        })?;

        let url = response.url().clone();
        let value = tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => return Err(RemoteError::Cancelled),
            value = converter.read(response, &target) => value,
        };

        let value = value.inspect_err(|err| {
            tracing::error!(
                target: "horizon_lattice_remote::content",
                url = %url,
                result_type = target.type_name(),
                error = %err,
                "Failed to read response content"
            );
        })?;

        value.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
            RemoteError::Content(format!(
                "converter did not produce a {}",
                target.type_name()
            ))
        })
    }
}

impl std::fmt::Debug for ContentConverterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentConverterChain")
            .field("converters", &self.converters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use url::Url;

    fn json_response(body: &'static str) -> HttpResponse {
        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        HttpResponse::from_parts(200, headers, body, Url::parse("http://localhost/").unwrap())
            .unwrap()
    }

    fn json_context(always: bool) -> (MediaType, bool) {
        (MediaType::parse("application/json").unwrap(), always)
    }

    #[test]
    fn test_string_target_uses_text_converter_for_json() {
        let chain = ContentConverterChain::default();
        let (media, always) = json_context(false);
        let context = ConversionContext {
            media_type: Some(&media),
            always_use_object_converter: always,
        };
        let target = TargetType::deserializable::<String>();
        let converter = chain.select(&target, &context).unwrap();
        assert_eq!(converter.can_convert(&target, &context), TypeMatch::Exact);
    }

    #[test]
    fn test_always_flag_selects_object_converter() {
        let chain = ContentConverterChain::default();
        let (media, always) = json_context(true);
        let context = ConversionContext {
            media_type: Some(&media),
            always_use_object_converter: always,
        };
        let target = TargetType::deserializable::<String>();
        let converter = chain.select(&target, &context).unwrap();
        assert_eq!(converter.can_convert(&target, &context), TypeMatch::Family);
    }

    #[tokio::test]
    async fn test_read_struct() {
        #[derive(Deserialize)]
        struct User {
            id: u32,
            name: String,
        }

        let chain = ContentConverterChain::default();
        let user: User = chain
            .read(
                json_response(r#"{"id": 10, "name": "furion"}"#),
                TargetType::deserializable::<User>(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(user.id, 10);
        assert_eq!(user.name, "furion");
    }

    #[tokio::test]
    async fn test_read_string_keeps_json_text() {
        let chain = ContentConverterChain::default();
        let text: String = chain
            .read(json_response(r#""quoted""#), TargetType::deserializable::<String>(), None)
            .await
            .unwrap();
        assert_eq!(text, r#""quoted""#);
    }

    #[tokio::test]
    async fn test_read_failure_is_returned_unchanged() {
        let chain = ContentConverterChain::default();
        let result: Result<Vec<u32>> = chain
            .read(json_response("not json"), TargetType::deserializable::<Vec<u32>>(), None)
            .await;
        assert!(matches!(result, Err(RemoteError::Json(_))));
    }

    #[tokio::test]
    async fn test_read_cancelled() {
        let chain = ContentConverterChain::default();
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<String> = chain
            .read(json_response("{}"), TargetType::deserializable::<String>(), Some(&token))
            .await;
        assert!(matches!(result, Err(RemoteError::Cancelled)));
    }

    #[tokio::test]
    async fn test_no_content_and_passthrough() {
        let chain = ContentConverterChain::default();
        let _: NoContent = chain
            .read(json_response("{}"), TargetType::of::<NoContent>(), None)
            .await
            .unwrap();
        let response: HttpResponse = chain
            .read(json_response("{}"), TargetType::of::<HttpResponse>(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_user_converter_wins_over_builtin() {
        struct Upper;
        impl ContentConverter for Upper {
            fn can_convert(&self, target: &TargetType, _context: &ConversionContext<'_>) -> TypeMatch {
                if target.is::<String>() {
                    TypeMatch::Exact
                } else {
                    TypeMatch::No
                }
            }
            fn read<'a>(
                &'a self,
                response: HttpResponse,
                _target: &'a TargetType,
            ) -> BoxFuture<'a, Result<Box<dyn Any + Send>>> {
                async move {
                    let text = response.text().await?;
                    Ok(Box::new(text.to_uppercase()) as Box<dyn Any + Send>)
                }
                .boxed()
            }
        }

        let chain = ContentConverterChain::new(vec![Arc::new(Upper)]);
        let text: String = chain
            .read(json_response("abc"), TargetType::deserializable::<String>(), None)
            .await
            .unwrap();
        assert_eq!(text, "ABC");
    }
}
