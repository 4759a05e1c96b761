//! Server-sent events.
//!
//! [`EventStreamParser`] turns `text/event-stream` bytes into
//! [`ServerSentEvent`]s; [`HttpRemote::server_sent_events`] drives it over a
//! live connection and reconnects after transport failures.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use http::header::{ACCEPT, CACHE_CONTROL, HeaderName, HeaderValue};

use super::{StreamErrorHandler, pause};
use crate::builder::HttpRequestBuilder;
use crate::cancellation::{CancellationToken, wait_cancelled};
use crate::dispatch::{HttpRemote, ReleaseGuard};
use crate::error::{RemoteError, Result};
use crate::http::{HttpClient, HttpResponse, TEXT_EVENT_STREAM};

const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// Default upper bound for one event.
pub const DEFAULT_MAX_EVENT_SIZE: usize = 1024 * 1024;

/// One dispatched event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSentEvent {
    /// Last event id seen on the stream, if any.
    pub id: Option<String>,
    /// Event type; `message` when the stream did not name one.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Reconnect interval in effect when the event was dispatched.
    pub retry: Option<Duration>,
}

/// Incremental `text/event-stream` parser.
///
/// Lines end with LF or CRLF. Comment lines are skipped; `retry` values that
/// are not plain digits are ignored.
#[derive(Debug)]
pub struct EventStreamParser {
    max_event_size: usize,
    line: Vec<u8>,
    event_size: usize,
    event: Option<String>,
    data: Option<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
    discarding: bool,
    discard_line_has_content: bool,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENT_SIZE)
    }
}

impl EventStreamParser {
    /// Create a parser rejecting events larger than `max_event_size` bytes.
    pub fn new(max_event_size: usize) -> Self {
        Self {
            max_event_size,
            line: Vec::new(),
            event_size: 0,
            event: None,
            data: None,
            last_event_id: None,
            retry: None,
            discarding: false,
            discard_line_has_content: false,
        }
    }

    /// Last event id received.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnect interval requested by the server.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Feed bytes and collect every event they complete.
    ///
    /// An event exceeding the size limit yields one
    /// [`RemoteError::ContentTooLarge`] and is skipped up to the next blank
    /// line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ServerSentEvent>> {
        let mut out = Vec::new();
        for &byte in bytes {
            if self.discarding {
                if byte == b'\n' {
                    if !self.discard_line_has_content {
                        self.discarding = false;
                    }
                    self.discard_line_has_content = false;
                } else if byte != b'\r' {
                    self.discard_line_has_content = true;
                }
                continue;
            }

            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.process_line(&line, &mut out);
                continue;
            }

            self.line.push(byte);
            if self.event_size + self.line.len() > self.max_event_size {
                self.overflow(&mut out);
            }
        }
        out
    }

    fn overflow(&mut self, out: &mut Vec<Result<ServerSentEvent>>) {
        tracing::warn!(
            target: "horizon_lattice_remote::streaming",
            limit = self.max_event_size,
            "Discarding oversized server-sent event"
        );
        out.push(Err(RemoteError::ContentTooLarge {
            limit: self.max_event_size as u64,
        }));
        self.reset_event();
        self.line.clear();
        self.discarding = true;
        self.discard_line_has_content = true;
    }

    fn reset_event(&mut self) {
        self.event = None;
        self.data = None;
        self.event_size = 0;
    }

    fn process_line(&mut self, line: &[u8], out: &mut Vec<Result<ServerSentEvent>>) {
        if line.is_empty() {
            if let Some(data) = self.data.take() {
                out.push(Ok(ServerSentEvent {
                    id: self.last_event_id.clone(),
                    event: self.event.take().unwrap_or_else(|| "message".to_string()),
                    data,
                    retry: self.retry,
                }));
            }
            self.reset_event();
            return;
        }
        if line[0] == b':' {
            return;
        }
        self.event_size += line.len() + 1;

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            _ => {}
        }
    }
}

type OpenHandler = Arc<dyn Fn(&HttpResponse) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(&ServerSentEvent) -> Result<()> + Send + Sync>;

/// Configuration for a server-sent events reader.
pub struct ServerSentEventsBuilder {
    request: HttpRequestBuilder,
    on_open: Option<OpenHandler>,
    on_message: Option<MessageHandler>,
    on_error: Option<StreamErrorHandler>,
    retry_interval: Duration,
    max_retries: usize,
    max_event_size: usize,
}

impl ServerSentEventsBuilder {
    /// Read events from the endpoint described by `request`.
    pub fn new(request: HttpRequestBuilder) -> Self {
        Self {
            request,
            on_open: None,
            on_message: None,
            on_error: None,
            retry_interval: Duration::from_secs(2),
            max_retries: 3,
            max_event_size: DEFAULT_MAX_EVENT_SIZE,
        }
    }

    /// Called on every successful connection.
    pub fn on_open<F>(mut self, handler: F) -> Self
    where
        F: Fn(&HttpResponse) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(handler));
        self
    }

    /// Called for every event; an error is reported through `on_error`.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ServerSentEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(handler));
        self
    }

    /// Called for transport failures, handler failures and oversized events.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RemoteError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Initial reconnect interval; a server `retry` field overrides it.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Reconnect attempts allowed after consecutive failures.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Upper bound for one event in bytes.
    pub fn max_event_size(mut self, size: usize) -> Self {
        self.max_event_size = size;
        self
    }

    fn report(&self, err: &RemoteError) {
        if let Some(handler) = &self.on_error {
            handler(err);
        }
    }
}

impl std::fmt::Debug for ServerSentEventsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSentEventsBuilder")
            .field("retry_interval", &self.retry_interval)
            .field("max_retries", &self.max_retries)
            .field("max_event_size", &self.max_event_size)
            .finish_non_exhaustive()
    }
}

enum Connection {
    Closed,
    Cancelled,
}

impl HttpRemote {
    /// Read server-sent events until the server closes the stream, the caller
    /// cancels or reconnect attempts run out.
    pub async fn server_sent_events(
        &self,
        sse: &ServerSentEventsBuilder,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let mut guard = ReleaseGuard::new(&sse.request);
        let client = guard.hold(self.acquire_client(&sse.request.spec)?);
        self.run_event_stream(sse, &client, cancel).await
    }

    async fn run_event_stream(
        &self,
        sse: &ServerSentEventsBuilder,
        client: &HttpClient,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let mut parser = EventStreamParser::new(sse.max_event_size);
        let mut failures = 0;
        loop {
            match self.read_event_stream(sse, client, &mut parser, &mut failures, cancel).await {
                Ok(Connection::Closed | Connection::Cancelled) => return Ok(()),
                Err(err) => {
                    sse.report(&err);
                    failures += 1;
                    if failures > sse.max_retries {
                        return Err(err);
                    }
                    let delay = parser.retry().unwrap_or(sse.retry_interval);
                    tracing::warn!(
                        target: "horizon_lattice_remote::streaming",
                        error = %err,
                        attempt = failures,
                        delay = ?delay,
                        "Event stream failed; reconnecting"
                    );
                    if !pause(delay, cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn read_event_stream(
        &self,
        sse: &ServerSentEventsBuilder,
        client: &HttpClient,
        parser: &mut EventStreamParser,
        failures: &mut usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<Connection> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(TEXT_EVENT_STREAM));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(id) = parser.last_event_id() {
            headers.insert(LAST_EVENT_ID, HeaderValue::from_str(id)?);
        }

        let Some(response) = self.open_stream(&sse.request, client, headers, cancel).await? else {
            return Ok(Connection::Cancelled);
        };
        *failures = 0;
        if let Some(handler) = &sse.on_open {
            handler(&response);
        }

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => return Ok(Connection::Cancelled),
                chunk = stream.next_chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                return Ok(Connection::Closed);
            };
            for event in parser.feed(&chunk) {
                let outcome = match event {
                    Ok(event) => match &sse.on_message {
                        Some(handler) => handler(&event),
                        None => Ok(()),
                    },
                    Err(err) => Err(err),
                };
                if let Err(err) = outcome {
                    sse.report(&err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(parser: &mut EventStreamParser, input: &str) -> Vec<ServerSentEvent> {
        parser
            .feed(input.as_bytes())
            .into_iter()
            .map(|event| event.unwrap())
            .collect()
    }

    #[test]
    fn test_parse_basic_events() {
        let mut parser = EventStreamParser::default();
        let parsed = events(
            &mut parser,
            ": comment\ndata: first\n\nevent: update\nid: 7\ndata: a\ndata: b\n\n",
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].event, "message");
        assert_eq!(parsed[0].data, "first");
        assert_eq!(parsed[0].id, None);
        assert_eq!(parsed[1].event, "update");
        assert_eq!(parsed[1].data, "a\nb");
        assert_eq!(parsed[1].id.as_deref(), Some("7"));
        assert_eq!(parser.last_event_id(), Some("7"));
    }

    #[test]
    fn test_parse_across_chunks_and_crlf() {
        let mut parser = EventStreamParser::default();
        assert!(events(&mut parser, "data: hel").is_empty());
        assert!(events(&mut parser, "lo\r\n").is_empty());
        let parsed = events(&mut parser, "\r\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].data, "hello");
    }

    #[test]
    fn test_retry_field() {
        let mut parser = EventStreamParser::default();
        events(&mut parser, "retry: 1500\n\nretry: soon\n\n");
        assert_eq!(parser.retry(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_event_without_data_is_not_dispatched() {
        let mut parser = EventStreamParser::default();
        assert!(events(&mut parser, "event: ping\n\n").is_empty());
        let parsed = events(&mut parser, "data\n\n");
        assert_eq!(parsed[0].event, "message");
        assert_eq!(parsed[0].data, "");
    }

    #[test]
    fn test_oversized_event_is_discarded() {
        let mut parser = EventStreamParser::new(16);
        let results = parser.feed(b"data: this line is far too long\ndata: more\n\ndata: ok\n\n");
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(RemoteError::ContentTooLarge { limit: 16 })
        ));
        assert_eq!(results[1].as_ref().unwrap().data, "ok");
    }
}
