//! Resolved wire requests.

use std::str::FromStr;

use url::Url;

use super::content::HttpContent;
use crate::error::{RemoteError, Result};

/// HTTP request methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// HTTP GET method.
    Get,
    /// HTTP POST method.
    Post,
    /// HTTP PUT method.
    Put,
    /// HTTP DELETE method.
    Delete,
    /// HTTP PATCH method.
    Patch,
    /// HTTP HEAD method.
    Head,
    /// HTTP OPTIONS method.
    Options,
    /// HTTP TRACE method.
    Trace,
    /// HTTP CONNECT method.
    Connect,
}

impl HttpMethod {
    /// Convert to reqwest method.
    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
            Self::Head => reqwest::Method::HEAD,
            Self::Options => reqwest::Method::OPTIONS,
            Self::Trace => reqwest::Method::TRACE,
            Self::Connect => reqwest::Method::CONNECT,
        }
    }

    /// Whether this is GET or HEAD.
    pub fn is_get_or_head(self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl FromStr for HttpMethod {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "TRACE" => Ok(Self::Trace),
            "CONNECT" => Ok(Self::Connect),
            _ => Err(RemoteError::Configuration(format!(
                "'{s}' is not a supported HTTP method"
            ))),
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_reqwest().as_str())
    }
}

/// Per-request values the dispatcher reads without going back to the builder.
#[derive(Clone, Debug, Default)]
pub struct RequestMetadata {
    /// Name of the client that should carry the request.
    pub client_name: Option<String>,
    /// Skip profiling output for this request.
    pub disable_profiling: bool,
    /// Skip buffering and profiling work.
    pub performance_optimization: bool,
    /// Read every result through the structured-object converter.
    pub always_use_object_converter: bool,
}

/// A fully resolved request ready for the transport.
#[derive(Debug)]
pub struct HttpRequest {
    /// The HTTP method.
    pub method: HttpMethod,
    /// The absolute request URL.
    pub url: Url,
    /// Explicit protocol version.
    pub version: Option<http::Version>,
    /// Request headers.
    pub headers: http::HeaderMap,
    /// Request body.
    pub content: Option<HttpContent>,
    /// Values for the dispatcher.
    pub metadata: RequestMetadata,
}

impl HttpRequest {
    /// Build the transport request on `client`.
    pub(crate) fn into_reqwest(self, client: &reqwest::Client) -> Result<reqwest::RequestBuilder> {
        let mut builder = client
            .request(self.method.to_reqwest(), self.url)
            .headers(self.headers.clone());

        if let Some(version) = self.version {
            builder = builder.version(version);
        }

        if let Some(content) = self.content {
            if !self.headers.contains_key(http::header::CONTENT_TYPE)
                && let Some(media_type) = content.media_type()
            {
                builder = builder.header(http::header::CONTENT_TYPE, media_type.to_string());
            }
            for (name, value) in content.headers() {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder = builder.body(content.into_reqwest_body()?);
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_from_str() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!(" Patch ".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!(matches!(
            "FETCH".parse::<HttpMethod>(),
            Err(RemoteError::Configuration(_))
        ));
    }

    #[test]
    fn test_method_display() {
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
        assert!(HttpMethod::Head.is_get_or_head());
        assert!(!HttpMethod::Post.is_get_or_head());
    }
}
