//! Readers for long-lived responses.
//!
//! Both readers acquire their transport client the same way a normal
//! dispatch does and release it, together with the builder's disposables,
//! when they finish. Caller cancellation ends a reader with `Ok(())`.

pub mod long_polling;
pub mod sse;

pub use long_polling::LongPollingBuilder;
pub use sse::{EventStreamParser, ServerSentEvent, ServerSentEventsBuilder};

use std::time::Duration;

use http::HeaderMap;

use crate::builder::HttpRequestBuilder;
use crate::cancellation::{CancellationToken, wait_cancelled};
use crate::dispatch::{HttpRemote, transmit};
use crate::error::{RemoteError, Result};
use crate::http::{HttpClient, HttpResponse};

/// Callback receiving reader failures.
pub type StreamErrorHandler = std::sync::Arc<dyn Fn(&RemoteError) + Send + Sync>;

impl HttpRemote {
    /// Build and send `builder` on `client` with `extra` headers.
    ///
    /// Returns `None` when the caller cancelled; non-2xx statuses are errors.
    pub(crate) async fn open_stream(
        &self,
        builder: &HttpRequestBuilder,
        client: &HttpClient,
        extra: HeaderMap,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<HttpResponse>> {
        let mut request = builder.build(self.options(), self.processors(), client.base_address())?;
        request.headers.extend(extra);
        tracing::debug!(
            target: "horizon_lattice_remote::streaming",
            method = %request.method,
            url = %request.url,
            "Opening stream"
        );

        let response = tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => return Ok(None),
            response = transmit(client, request) => response?,
        };
        response.error_for_status().map(Some)
    }
}

/// Sleep for `delay`; returns `false` when the caller cancelled first.
pub(crate) async fn pause(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    tokio::select! {
        biased;
        _ = wait_cancelled(cancel) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
