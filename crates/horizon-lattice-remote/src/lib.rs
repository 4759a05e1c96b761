//! Declarative HTTP remote requests for Horizon Lattice.
//!
//! This crate builds and dispatches outgoing HTTP calls:
//!
//! - **Request builder**: accumulate URI, query, headers, cookies, content
//!   and per-call policy on an [`HttpRequestBuilder`], then resolve it into a
//!   wire request
//! - **Content negotiation**: ordered, overridable processor and converter
//!   chains turn values into bodies and bodies back into values
//! - **Multipart**: RFC 7578 `multipart/form-data` assembly, including
//!   streamed file parts and nested forms
//! - **Dispatch**: [`HttpRemote`] owns client pooling, timeouts,
//!   cancellation, status-code routing and hook invocation
//! - **Extensions**: load generation, server-sent events and long polling
//!
//! # Sending a request
//!
//! ```ignore
//! use horizon_lattice_remote::{HttpRemote, HttpRemoteOptions, HttpRequestBuilder};
//!
//! let remote = HttpRemote::new(HttpRemoteOptions::new());
//!
//! let builder = HttpRequestBuilder::get("https://api.example.com/users/{id}")
//!     .with_path_parameter("id", 10)?
//!     .with_query_parameter("expand", "roles")?
//!     .with_bearer_token("secret")?
//!     .ensure_success_status_code();
//!
//! let user: Option<User> = remote.send_as(&builder, None).await?;
//! ```
//!
//! # Multipart
//!
//! ```ignore
//! use horizon_lattice_remote::{HttpRequestBuilder, MultipartFormBuilder};
//!
//! let form = MultipartFormBuilder::new()
//!     .add_text("name", "furion")?
//!     .add_file_from_path("avatar.png", "avatar", None, None)?;
//!
//! let builder = HttpRequestBuilder::post("/upload").with_multipart_content(form);
//! remote.send(&builder, None).await?;
//! ```
//!
//! # Failure policy
//!
//! ```ignore
//! use horizon_lattice_remote::ErrorKind;
//!
//! let builder = HttpRequestBuilder::get("/flaky")
//!     .with_timeout(Duration::from_secs(2))
//!     .with_timeout_callback(|| tracing::warn!("slow endpoint"))
//!     .suppress_exceptions([ErrorKind::Transport])
//!     .with_status_code_handler("500-599", |response| {
//!         tracing::error!(status = response.status(), "server error");
//!         Ok(())
//!     });
//!
//! // `None` when the failure was suppressed.
//! let result = remote.send(&builder, None).await?;
//! ```

pub mod builder;
mod cancellation;
pub mod converters;
pub mod dispatch;
mod error;
pub mod http;
pub mod multipart;
mod options;
pub mod processors;
pub mod streaming;

pub use error::{ErrorKind, RemoteError, Result};

// Re-export commonly used types at the crate root
pub use builder::{HttpRequestBuilder, StatusCodeMatcher};
pub use cancellation::CancellationToken;
pub use converters::{ContentConverter, ContentConverterChain, TargetType, TypeMatch};
pub use dispatch::{
    DispatchResult, HttpRemote, HttpRequestEventHandler, StressTestOptions, StressTestResult,
};
pub use http::{
    ClientHandle, ContentValue, HttpClient, HttpClientBuilder, HttpClientPool, HttpContent,
    HttpMethod, HttpRequest, HttpResponse, MediaType, NoContent, ResponseStream,
};
pub use multipart::{MultipartFormBuilder, PartContent};
pub use options::{ConfigurationLookup, EmptyConfiguration, HttpRemoteOptions};
pub use processors::{ContentProcessor, ContentProcessorChain};
pub use streaming::{LongPollingBuilder, ServerSentEvent, ServerSentEventsBuilder};
