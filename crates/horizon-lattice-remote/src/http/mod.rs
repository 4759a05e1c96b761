//! HTTP primitives shared by the builder and the dispatcher.
//!
//! These are the wire-level types: the transport client and its pool, the
//! materialized request body, the resolved request and the response.

mod client;
mod content;
mod pool;
mod request;
mod response;

pub use client::{HttpClient, HttpClientBuilder, HttpClientConfig};
pub use content::{
    APPLICATION_JSON, APPLICATION_XML, BodyStream, ByteStream, ContentBody, ContentValue,
    FORM_URL_ENCODED, HttpContent, MULTIPART_FORM_DATA, MediaType, OCTET_STREAM,
    TEXT_EVENT_STREAM, TEXT_HTML, TEXT_PLAIN, normalize_charset,
};
pub(crate) use content::encode_text;
pub use pool::{ClientHandle, ClientProvider, DEFAULT_CLIENT_NAME, HttpClientPool};
pub use request::{HttpMethod, HttpRequest, RequestMetadata};
pub use response::{HttpResponse, NoContent, ResponseStream};
