//! HTTP response types.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use url::Url;

use super::content::{MediaType, decode_text};
use super::request::RequestMetadata;
use crate::error::{RemoteError, Result};

enum ResponseBodyState {
    Live(reqwest::Response),
    Buffered(Bytes),
}

/// An HTTP response from a dispatched request.
pub struct HttpResponse {
    status: http::StatusCode,
    version: http::Version,
    headers: http::HeaderMap,
    url: Url,
    metadata: RequestMetadata,
    body: ResponseBodyState,
}

impl HttpResponse {
    /// Create from a reqwest response.
    pub(crate) fn from_reqwest(response: reqwest::Response, metadata: RequestMetadata) -> Self {
        Self {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
            url: response.url().clone(),
            metadata,
            body: ResponseBodyState::Live(response),
        }
    }

    /// Create a buffered response from its parts.
    ///
    /// Useful for custom client providers and for testing converters.
    pub fn from_parts(
        status: u16,
        headers: http::HeaderMap,
        body: impl Into<Bytes>,
        url: Url,
    ) -> Result<Self> {
        let status = http::StatusCode::from_u16(status)
            .map_err(|e| RemoteError::invalid_argument("status", e.to_string()))?;
        Ok(Self {
            status,
            version: http::Version::HTTP_11,
            headers,
            url,
            metadata: RequestMetadata::default(),
            body: ResponseBodyState::Buffered(body.into()),
        })
    }

    /// Attach request metadata.
    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Get the HTTP status code.
    pub fn status(&self) -> u16 {
        self.status.as_u16()
    }

    /// Check if the response indicates success (2xx status).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response is a redirection (3xx status).
    pub fn is_redirection(&self) -> bool {
        self.status.is_redirection()
    }

    /// Check if the response is a client error (4xx status).
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Check if the response is a server error (5xx status).
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Get the protocol version.
    pub fn version(&self) -> http::Version {
        self.version
    }

    /// Get the response headers.
    pub fn headers(&self) -> &http::HeaderMap {
        &self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers.get(name.as_ref()).and_then(|v| v.to_str().ok())
    }

    /// Get the parsed Content-Type header.
    pub fn content_type(&self) -> Option<MediaType> {
        self.header("content-type")
            .and_then(|value| MediaType::parse(value).ok())
    }

    /// Get the Content-Length header value.
    pub fn content_length(&self) -> Option<u64> {
        match &self.body {
            ResponseBodyState::Buffered(bytes) => Some(bytes.len() as u64),
            ResponseBodyState::Live(response) => response.content_length(),
        }
    }

    /// Get the final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Metadata of the request that produced this response.
    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    /// The `Location` header resolved against the response URL.
    pub fn location(&self) -> Option<Url> {
        self.header("location")
            .and_then(|location| self.url.join(location).ok())
    }

    /// Whether the body is held in memory.
    pub fn is_buffered(&self) -> bool {
        matches!(self.body, ResponseBodyState::Buffered(_))
    }

    /// The body, if it is held in memory.
    pub fn content(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBodyState::Buffered(bytes) => Some(bytes),
            ResponseBodyState::Live(_) => None,
        }
    }

    /// Read the next chunk of a live body.
    ///
    /// A buffered body is returned as a single chunk.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.body {
            ResponseBodyState::Live(response) => Ok(response.chunk().await?),
            ResponseBodyState::Buffered(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
        }
    }

    /// Buffer the whole body in memory, failing past `limit` bytes.
    pub async fn buffer_content(&mut self, limit: Option<u64>) -> Result<()> {
        if let ResponseBodyState::Buffered(bytes) = &self.body {
            return match limit {
                Some(limit) if bytes.len() as u64 > limit => {
                    Err(RemoteError::ContentTooLarge { limit })
                }
                _ => Ok(()),
            };
        }

        if let (Some(limit), Some(length)) = (limit, self.content_length())
            && length > limit
        {
            return Err(RemoteError::ContentTooLarge { limit });
        }

        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buffer.extend_from_slice(&chunk);
            if let Some(limit) = limit
                && buffer.len() as u64 > limit
            {
                return Err(RemoteError::ContentTooLarge { limit });
            }
        }
        self.body = ResponseBodyState::Buffered(buffer.freeze());
        Ok(())
    }

    /// Get the response body as raw bytes.
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBodyState::Live(response) => Ok(response.bytes().await?),
            ResponseBodyState::Buffered(bytes) => Ok(bytes),
        }
    }

    /// Get the response body as text, honouring the declared charset.
    pub async fn text(self) -> Result<String> {
        let charset = self.content_type().and_then(|media| media.charset());
        let bytes = self.bytes().await?;
        decode_text(&bytes, charset.as_deref())
    }

    /// Parse the response body as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Get a streaming response body for large downloads.
    pub fn bytes_stream(self) -> ResponseStream {
        let total_size = self.content_length();
        ResponseStream {
            response: self,
            total_size,
            bytes_received: 0,
        }
    }

    /// Check if the status code indicates success, returning an error if not.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RemoteError::HttpStatus {
                status: self.status(),
                message: self.status.canonical_reason().map(str::to_string),
            })
        }
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status())
            .field("url", &self.url.as_str())
            .field("buffered", &self.is_buffered())
            .finish()
    }
}

/// A streaming response body with progress tracking.
pub struct ResponseStream {
    response: HttpResponse,
    total_size: Option<u64>,
    bytes_received: u64,
}

impl ResponseStream {
    /// Get the total size of the response, if known.
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Get the number of bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Status code of the underlying response.
    pub fn status(&self) -> u16 {
        self.response.status()
    }

    /// Read the next chunk of data.
    ///
    /// Returns `None` when the stream is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.response.chunk().await? {
            Some(chunk) => {
                self.bytes_received += chunk.len() as u64;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Collect all remaining chunks into a single buffer.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Download to a writer (e.g., a file) with a progress callback.
    pub async fn download_to<W, F>(mut self, mut writer: W, mut on_progress: F) -> Result<u64>
    where
        W: std::io::Write,
        F: FnMut(u64, Option<u64>),
    {
        let mut total = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            writer.write_all(&chunk)?;
            total += chunk.len() as u64;
            on_progress(total, self.total_size);
        }
        writer.flush()?;
        Ok(total)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("status", &self.status())
            .field("bytes_received", &self.bytes_received)
            .finish()
    }
}

/// Marker result for responses whose body is ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoContent;
