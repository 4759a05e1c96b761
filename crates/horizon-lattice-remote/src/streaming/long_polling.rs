//! Long polling.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use super::{StreamErrorHandler, pause};
use crate::builder::HttpRequestBuilder;
use crate::cancellation::CancellationToken;
use crate::dispatch::{HttpRemote, ReleaseGuard};
use crate::error::{RemoteError, Result};
use crate::http::{HttpClient, HttpResponse};

/// Response header whose value `1` ends the polling loop.
pub const END_OF_STREAM_HEADER: &str = "X-End-Of-Stream";

type DataHandler = Arc<dyn Fn(&HttpResponse) -> Result<()> + Send + Sync>;
type EndHandler = Arc<dyn Fn() + Send + Sync>;

/// Configuration for a long-polling reader.
pub struct LongPollingBuilder {
    request: HttpRequestBuilder,
    on_data_received: Option<DataHandler>,
    on_error: Option<StreamErrorHandler>,
    on_end_of_stream: Option<EndHandler>,
    retry_interval: Duration,
    max_retries: usize,
}

impl LongPollingBuilder {
    /// Poll the endpoint described by `request`.
    pub fn new(request: HttpRequestBuilder) -> Self {
        Self {
            request,
            on_data_received: None,
            on_error: None,
            on_end_of_stream: None,
            retry_interval: Duration::from_secs(2),
            max_retries: 3,
        }
    }

    /// Called with every buffered data response; an error counts as a failed poll.
    pub fn on_data_received<F>(mut self, handler: F) -> Self
    where
        F: Fn(&HttpResponse) -> Result<()> + Send + Sync + 'static,
    {
        self.on_data_received = Some(Arc::new(handler));
        self
    }

    /// Called for every failed poll.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RemoteError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Called once when the server signals the end of the stream.
    pub fn on_end_of_stream<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_end_of_stream = Some(Arc::new(handler));
        self
    }

    /// Delay before polling again after a failure.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Consecutive failures tolerated before the error is returned.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }
}

impl std::fmt::Debug for LongPollingBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongPollingBuilder")
            .field("retry_interval", &self.retry_interval)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

fn is_end_of_stream(response: &HttpResponse) -> bool {
    response.status() == 204
        || response
            .header(END_OF_STREAM_HEADER)
            .is_some_and(|value| value.trim() == "1")
}

enum Poll {
    Data,
    End,
    Cancelled,
}

impl HttpRemote {
    /// Poll until the server signals the end of the stream, the caller
    /// cancels or consecutive failures exceed the retry limit.
    pub async fn long_polling(
        &self,
        lp: &LongPollingBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let mut guard = ReleaseGuard::new(&lp.request);
        let client = guard.hold(self.acquire_client(&lp.request.spec)?);
        self.run_long_polling(lp, &client, cancel).await
    }

    async fn run_long_polling(
        &self,
        lp: &LongPollingBuilder,
        client: &HttpClient,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let mut failures = 0;
        loop {
            match self.poll_once(lp, client, cancel).await {
                Ok(Poll::Data) => failures = 0,
                Ok(Poll::Cancelled) => return Ok(()),
                Ok(Poll::End) => {
                    tracing::debug!(
                        target: "horizon_lattice_remote::streaming",
                        "Long polling reached end of stream"
                    );
                    if let Some(handler) = &lp.on_end_of_stream {
                        handler();
                    }
                    return Ok(());
                }
                Err(err) => {
                    if let Some(handler) = &lp.on_error {
                        handler(&err);
                    }
                    failures += 1;
                    if failures > lp.max_retries {
                        return Err(err);
                    }
                    tracing::warn!(
                        target: "horizon_lattice_remote::streaming",
                        error = %err,
                        attempt = failures,
                        "Long poll failed; retrying"
                    );
                    if !pause(lp.retry_interval, cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn poll_once(
        &self,
        lp: &LongPollingBuilder,
        client: &HttpClient,
        cancel: Option<&CancellationToken>,
    ) -> Result<Poll> {
        let Some(mut response) = self
            .open_stream(&lp.request, client, HeaderMap::new(), cancel)
            .await?
        else {
            return Ok(Poll::Cancelled);
        };
        if is_end_of_stream(&response) {
            return Ok(Poll::End);
        }

        let limit = client
            .config()
            .max_response_content_buffer_size
            .or(self.options().max_response_content_buffer_size);
        response.buffer_content(limit).await?;
        if let Some(handler) = &lp.on_data_received {
            handler(&response)?;
        }
        Ok(Poll::Data)
    }
}
