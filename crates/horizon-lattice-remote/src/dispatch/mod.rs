//! Dispatch engine.
//!
//! [`HttpRemote`] owns the global options, the transport-client pool and the
//! content chains, and runs the single-call lifecycle for a
//! [`HttpRequestBuilder`]:
//!
//! 1. acquire a client (explicit provider or pool);
//! 2. validate the request timeout against the client's ceiling;
//! 3. build the wire request;
//! 4. run the pre-send hook, then the event handler;
//! 5. send under the caller's cancellation and the request timeout;
//! 6. route failures through on-failure and the suppression set, or
//!    successes through ensure-success, status handlers, post-receive and
//!    the buffer limit;
//! 7. release the client handle and the builder's disposables.

pub mod runtime;
mod stress;

pub use stress::{StressTestOptions, StressTestResult};

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use url::Url;

use crate::builder::{HttpRequestBuilder, RequestSpec};
use crate::cancellation::{CancellationToken, wait_cancelled};
use crate::converters::{ContentConverterChain, TargetType};
use crate::error::{RemoteError, Result};
use crate::http::{
    ClientHandle, HttpClient, HttpClientBuilder, HttpClientPool, HttpRequest, HttpResponse,
    ResponseStream,
};
use crate::options::HttpRemoteOptions;
use crate::processors::{ContentProcessorChain, ProcessOptions};

/// Externally registered callbacks invoked alongside a request's inline hooks.
///
/// Errors returned from these methods are logged and otherwise ignored.
pub trait HttpRequestEventHandler: Send + Sync {
    /// Called after the request is built, before it is sent.
    fn on_pre_send(&self, _request: &HttpRequest) -> Result<()> {
        Ok(())
    }

    /// Called after a successful response.
    fn on_post_receive(&self, _response: &HttpResponse) -> Result<()> {
        Ok(())
    }

    /// Called when the call fails (never for caller cancellation).
    fn on_failure(&self, _error: &RemoteError) -> Result<()> {
        Ok(())
    }
}

/// Outcome of one dispatch.
#[derive(Debug)]
pub struct DispatchResult {
    /// The response; `None` when the failure was suppressed.
    pub response: Option<HttpResponse>,
    /// Wall-clock time of the whole dispatch.
    pub elapsed_ms: u64,
}

impl DispatchResult {
    /// Whether a response with a 2xx status was received.
    pub fn is_success(&self) -> bool {
        self.response.as_ref().is_some_and(HttpResponse::is_success)
    }

    /// Take the response.
    pub fn into_response(self) -> Option<HttpResponse> {
        self.response
    }
}

fn isolate(stage: &'static str, result: Result<()>) {
    if let Err(err) = result {
        tracing::error!(
            target: "horizon_lattice_remote::dispatch",
            stage,
            error = %err,
            "Request event handler failed"
        );
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Send a built request on `client`.
pub(crate) async fn transmit(client: &HttpClient, request: HttpRequest) -> Result<HttpResponse> {
    let metadata = request.metadata.clone();
    let response = request.into_reqwest(client.reqwest_client())?.send().await?;
    Ok(HttpResponse::from_reqwest(response, metadata))
}

/// Releases the client handle and the builder's disposables when dropped,
/// including when the dispatch future itself is dropped.
pub(crate) struct ReleaseGuard<'a> {
    builder: &'a HttpRequestBuilder,
    handle: Option<ClientHandle>,
}

impl<'a> ReleaseGuard<'a> {
    pub(crate) fn new(builder: &'a HttpRequestBuilder) -> Self {
        Self {
            builder,
            handle: None,
        }
    }

    /// Take ownership of an acquired handle and return its client.
    pub(crate) fn hold(&mut self, handle: ClientHandle) -> HttpClient {
        let client = handle.client().clone();
        self.handle = Some(handle);
        client
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
        self.builder.release_resources();
    }
}

/// The dispatch engine.
///
/// Cheap to clone; clones share the client pool.
#[derive(Clone)]
pub struct HttpRemote {
    options: Arc<HttpRemoteOptions>,
    pool: Arc<HttpClientPool>,
    processors: ContentProcessorChain,
    converters: ContentConverterChain,
}

impl Default for HttpRemote {
    fn default() -> Self {
        Self::new(HttpRemoteOptions::default())
    }
}

impl HttpRemote {
    /// Create an engine from `options`.
    pub fn new(options: HttpRemoteOptions) -> Self {
        let processors = ContentProcessorChain::new(
            options.processors.clone(),
            ProcessOptions {
                json_pretty: options.json_pretty,
                default_encoding: options.default_encoding.clone(),
                default_content_type: options.default_content_type.clone(),
            },
        );
        let converters = ContentConverterChain::new(options.converters.clone());
        let pool = Arc::new(HttpClientPool::new(options.user_agent.clone()));
        Self {
            options: Arc::new(options),
            pool,
            processors,
            converters,
        }
    }

    /// The global options.
    pub fn options(&self) -> &HttpRemoteOptions {
        &self.options
    }

    /// The transport-client pool.
    pub fn pool(&self) -> &HttpClientPool {
        &self.pool
    }

    /// The content processor chain.
    pub fn processors(&self) -> &ContentProcessorChain {
        &self.processors
    }

    /// The content converter chain.
    pub fn converters(&self) -> &ContentConverterChain {
        &self.converters
    }

    /// Register the builder for a named client.
    pub fn register_client(&self, name: impl Into<String>, builder: HttpClientBuilder) {
        self.pool.register(name, builder);
    }

    /// Register the builder for the default client.
    pub fn register_default_client(&self, builder: HttpClientBuilder) {
        self.pool.register_default(builder);
    }

    /// Dispatch `builder`.
    pub async fn send(
        &self,
        builder: &HttpRequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<DispatchResult> {
        self.dispatch(builder, None, cancel).await
    }

    /// Dispatch `builder`, resolving relative URIs against `base_address`
    /// instead of the client's base address.
    pub async fn send_with_base_address(
        &self,
        builder: &HttpRequestBuilder,
        base_address: &Url,
        cancel: Option<&CancellationToken>,
    ) -> Result<DispatchResult> {
        self.dispatch(builder, Some(base_address), cancel).await
    }

    /// Dispatch `builder` on the global runtime, blocking the thread.
    pub fn send_blocking(&self, builder: &HttpRequestBuilder) -> Result<DispatchResult> {
        runtime::block_on(self.send(builder, None))
    }

    /// Dispatch and read the body into `T`.
    ///
    /// Returns `None` when the failure was suppressed.
    pub async fn send_as<T>(
        &self,
        builder: &HttpRequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.send_as_target(builder, TargetType::deserializable::<T>(), cancel)
            .await
    }

    /// Dispatch and read the body as text.
    pub async fn send_as_string(
        &self,
        builder: &HttpRequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<String>> {
        self.send_as::<String>(builder, cancel).await
    }

    /// Dispatch and read the body as bytes.
    pub async fn send_as_bytes(
        &self,
        builder: &HttpRequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Bytes>> {
        self.send_as_target(builder, TargetType::of::<Bytes>(), cancel)
            .await
    }

    /// Dispatch and hand out the body as a stream.
    pub async fn send_as_stream(
        &self,
        builder: &HttpRequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<ResponseStream>> {
        self.send_as_target(builder, TargetType::of::<ResponseStream>(), cancel)
            .await
    }

    /// Dispatch and return the response through the converter chain.
    pub async fn send_as_response(
        &self,
        builder: &HttpRequestBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<HttpResponse>> {
        self.send_as_target(builder, TargetType::of::<HttpResponse>(), cancel)
            .await
    }

    /// Blocking form of [`send_as`](Self::send_as).
    pub fn send_as_blocking<T>(&self, builder: &HttpRequestBuilder) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        runtime::block_on(self.send_as::<T>(builder, None))
    }

    /// Blocking form of [`send_as_string`](Self::send_as_string).
    pub fn send_as_string_blocking(&self, builder: &HttpRequestBuilder) -> Result<Option<String>> {
        runtime::block_on(self.send_as_string(builder, None))
    }

    /// Read an already received response into `T`.
    pub async fn read_as<T>(
        &self,
        response: HttpResponse,
        cancel: Option<&CancellationToken>,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.converters
            .read(response, TargetType::deserializable::<T>(), cancel)
            .await
    }

    /// Blocking form of [`read_as`](Self::read_as); selects the same converter.
    pub fn read_as_blocking<T>(&self, response: HttpResponse) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        runtime::block_on(self.read_as::<T>(response, None))
    }

    async fn send_as_target<T: Any + Send>(
        &self,
        builder: &HttpRequestBuilder,
        target: TargetType,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<T>> {
        let Some(response) = self.send(builder, cancel).await?.response else {
            return Ok(None);
        };
        self.converters.read(response, target, cancel).await.map(Some)
    }

    pub(crate) fn acquire_client(&self, spec: &RequestSpec) -> Result<ClientHandle> {
        if let Some(provider) = &spec.client_provider {
            return provider().ok_or_else(|| {
                RemoteError::Configuration("the HTTP client provider returned no client".to_string())
            });
        }
        let client = self
            .pool
            .get_or_create(spec.client_name.as_deref(), spec.client_pooling)?;
        Ok(ClientHandle::new(client))
    }

    async fn dispatch(
        &self,
        builder: &HttpRequestBuilder,
        base_address: Option<&Url>,
        cancel: Option<&CancellationToken>,
    ) -> Result<DispatchResult> {
        let started = Instant::now();
        let mut guard = ReleaseGuard::new(builder);
        let client = guard.hold(self.acquire_client(&builder.spec)?);

        let response = self
            .execute(builder, &client, base_address, cancel, started)
            .await;
        drop(guard);

        Ok(DispatchResult {
            response: response?,
            elapsed_ms: elapsed_ms(started),
        })
    }

    async fn execute(
        &self,
        builder: &HttpRequestBuilder,
        client: &HttpClient,
        base_address: Option<&Url>,
        cancel: Option<&CancellationToken>,
        started: Instant,
    ) -> Result<Option<HttpResponse>> {
        let spec = &builder.spec;

        if let (Some(timeout), Some(ceiling)) = (spec.timeout, client.config().timeout)
            && timeout > ceiling
        {
            return Err(RemoteError::Configuration(format!(
                "request timeout {timeout:?} exceeds the client timeout {ceiling:?}"
            )));
        }

        let base = base_address.or(client.base_address());
        let mut request = builder.build(&self.options, &self.processors, base)?;

        if let Some(hook) = &spec.pre_send {
            hook(&mut request)?;
        }
        if let Some(handler) = &spec.event_handler {
            isolate("pre_send", handler.on_pre_send(&request));
        }

        let method = request.method;
        let url = request.url.clone();
        let metadata = request.metadata.clone();
        tracing::debug!(
            target: "horizon_lattice_remote::dispatch",
            %method,
            %url,
            "Sending request"
        );

        let response = match self.round_trip(client, request, spec, cancel, started).await {
            Ok(response) => response,
            Err(err) => return self.fail(spec, err),
        };
        let status = response.status();
        tracing::debug!(
            target: "horizon_lattice_remote::dispatch",
            %method,
            %url,
            status,
            elapsed_ms = elapsed_ms(started),
            "Received response"
        );

        let mut response = if spec.ensure_success {
            match response.error_for_status() {
                Ok(response) => response,
                Err(err) => return self.fail(spec, err),
            }
        } else {
            response
        };

        for (matcher, handler) in &spec.status_handlers {
            if matcher.matches(status)
                && let Err(err) = handler(&response)
            {
                tracing::error!(
                    target: "horizon_lattice_remote::dispatch",
                    matcher = %matcher,
                    status,
                    error = %err,
                    "Status code handler failed"
                );
            }
        }

        if let Some(hook) = &spec.post_receive {
            hook(&response)?;
        }
        if let Some(handler) = &spec.event_handler {
            isolate("post_receive", handler.on_post_receive(&response));
        }

        if !metadata.performance_optimization
            && let Some(limit) = client
                .config()
                .max_response_content_buffer_size
                .or(self.options.max_response_content_buffer_size)
        {
            let buffered = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => Err(RemoteError::Cancelled),
                result = response.buffer_content(Some(limit)) => result,
            };
            if let Err(err) = buffered {
                return self.fail(spec, err);
            }
        }

        if self.options.profiling_enabled
            && !metadata.disable_profiling
            && !metadata.performance_optimization
        {
            tracing::info!(
                target: "horizon_lattice_remote::dispatch",
                %method,
                %url,
                status,
                elapsed_ms = elapsed_ms(started),
                "Request profile"
            );
        }

        Ok(Some(response))
    }

    async fn round_trip(
        &self,
        client: &HttpClient,
        request: HttpRequest,
        spec: &RequestSpec,
        cancel: Option<&CancellationToken>,
        started: Instant,
    ) -> Result<HttpResponse> {
        let send = transmit(client, request);

        let timeout = spec.timeout.filter(|timeout| !timeout.is_zero());
        let timer = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => Err(RemoteError::Cancelled),
            _ = timer => {
                if let Some(callback) = &spec.timeout_callback {
                    callback();
                }
                let elapsed_ms = elapsed_ms(started);
                tracing::warn!(
                    target: "horizon_lattice_remote::dispatch",
                    timeout = ?timeout,
                    elapsed_ms,
                    "Request timed out"
                );
                Err(RemoteError::Timeout { elapsed_ms })
            }
            result = send => result,
        }
    }

    fn fail(&self, spec: &RequestSpec, err: RemoteError) -> Result<Option<HttpResponse>> {
        if err.is_cancelled() {
            return Err(err);
        }
        if let Some(hook) = &spec.on_failure {
            hook(&err);
        }
        if let Some(handler) = &spec.event_handler {
            isolate("on_failure", handler.on_failure(&err));
        }
        if err.is_suppressed_by(&spec.suppressed) {
            tracing::warn!(
                target: "horizon_lattice_remote::dispatch",
                error = %err,
                "Suppressed request failure"
            );
            return Ok(None);
        }
        Err(err)
    }
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("options", &self.options)
            .field("pool", &self.pool)
            .finish()
    }
}
