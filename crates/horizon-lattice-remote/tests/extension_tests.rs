//! Load generation and streaming reader tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use horizon_lattice_remote::{
    CancellationToken, ClientHandle, HttpClient, HttpRemote, HttpRequestBuilder,
    LongPollingBuilder, RemoteError, ServerSentEvent, ServerSentEventsBuilder, StressTestOptions,
};

/// A request whose disposable and client release action both flip flags.
fn tracked_request(uri: String) -> (HttpRequestBuilder, Arc<AtomicBool>, Arc<AtomicBool>) {
    let disposed = Arc::new(AtomicBool::new(false));
    let released = Arc::new(AtomicBool::new(false));
    let dispose_flag = disposed.clone();
    let release_flag = released.clone();
    let builder = HttpRequestBuilder::get(uri)
        .with_http_client_provider(move || {
            let flag = release_flag.clone();
            let client = HttpClient::builder().build().ok()?;
            Some(ClientHandle::with_release(client, move || {
                flag.store(true, Ordering::SeqCst)
            }))
        })
        .add_disposable(move || dispose_flag.store(true, Ordering::SeqCst));
    (builder, disposed, released)
}

async fn stalled_server() -> MockServer {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;
    mock_server
}

#[tokio::test]
async fn test_stress_test_counts_requests() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
        .expect(10)
        .mount(&mock_server)
        .await;

    let remote = HttpRemote::default();
    let builder = HttpRequestBuilder::get(mock_server.uri());
    let result = remote.stress_test(&builder, 10).await.unwrap();

    assert_eq!(result.total_requests, 10);
    assert_eq!(result.successful_requests, 10);
    assert_eq!(result.failed_requests, 0);
    assert!(result.min_response_time_ms >= 50);
    assert!(result.max_response_time_ms >= result.p50_response_time_ms);
    assert!(result.queries_per_second > 0.0);
}

#[tokio::test]
async fn test_stress_test_rounds_and_failures() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let remote = HttpRemote::default();
    let builder = HttpRequestBuilder::get(mock_server.uri());
    let options = StressTestOptions {
        requests: 4,
        parallelism: 2,
        rounds: 3,
    };
    let result = remote.stress_test_with(&builder, options, None).await.unwrap();
    assert_eq!(result.total_requests, 12);
    assert_eq!(result.failed_requests, 12);
}

#[tokio::test]
async fn test_server_sent_events() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/events"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(": keep-alive\ndata: one\n\nevent: update\nid: 2\ndata: two\n\n"),
        )
        .mount(&mock_server)
        .await;

    let opened = Arc::new(AtomicU32::new(0));
    let open_counter = opened.clone();
    let events = Arc::new(Mutex::new(Vec::<ServerSentEvent>::new()));
    let sink = events.clone();

    let sse = ServerSentEventsBuilder::new(HttpRequestBuilder::get(format!(
        "{}/events",
        mock_server.uri()
    )))
    .on_open(move |_| {
        open_counter.fetch_add(1, Ordering::SeqCst);
    })
    .on_message(move |event| {
        sink.lock().push(event.clone());
        Ok(())
    });

    let remote = HttpRemote::default();
    timeout(Duration::from_secs(5), remote.server_sent_events(&sse, None))
        .await
        .expect("event stream did not finish")
        .unwrap();

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event, "message");
    assert_eq!(events[0].data, "one");
    assert_eq!(events[1].event, "update");
    assert_eq!(events[1].id.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_server_sent_events_gives_up_after_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let errors = Arc::new(AtomicU32::new(0));
    let counter = errors.clone();
    let sse = ServerSentEventsBuilder::new(HttpRequestBuilder::get(mock_server.uri()))
        .retry_interval(Duration::from_millis(10))
        .max_retries(2)
        .on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let err = HttpRemote::default()
        .server_sent_events(&sse, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::HttpStatus { status: 503, .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_long_polling_until_end_of_stream() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(ResponseTemplate::new(200).set_body_string("update"))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(ResponseTemplate::new(200).insert_header("X-End-Of-Stream", "1"))
        .mount(&mock_server)
        .await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let ended = Arc::new(AtomicU32::new(0));
    let end_counter = ended.clone();

    let lp = LongPollingBuilder::new(HttpRequestBuilder::get(format!("{}/poll", mock_server.uri())))
        .on_data_received(move |response| {
            let body = response.content().cloned().unwrap_or_default();
            sink.lock().push(String::from_utf8_lossy(&body).into_owned());
            Ok(())
        })
        .on_end_of_stream(move || {
            end_counter.fetch_add(1, Ordering::SeqCst);
        });

    HttpRemote::default().long_polling(&lp, None).await.unwrap();
    assert_eq!(*received.lock(), vec!["update".to_string(), "update".to_string()]);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_long_polling_stops_on_cancel() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let lp = LongPollingBuilder::new(HttpRequestBuilder::get(mock_server.uri()));
    let result = timeout(
        Duration::from_secs(2),
        HttpRemote::default().long_polling(&lp, Some(&token)),
    )
    .await
    .expect("long polling ignored cancellation");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_streaming_readers_release_when_no_client() {
    let disposed = Arc::new(AtomicBool::new(false));
    let flag = disposed.clone();
    let request = HttpRequestBuilder::get("http://localhost/events")
        .with_http_client_provider(|| None)
        .add_disposable(move || flag.store(true, Ordering::SeqCst));
    let sse = ServerSentEventsBuilder::new(request);
    let err = HttpRemote::default()
        .server_sent_events(&sse, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Configuration(_)));
    assert!(disposed.load(Ordering::SeqCst));

    let disposed = Arc::new(AtomicBool::new(false));
    let flag = disposed.clone();
    let request = HttpRequestBuilder::get("http://localhost/poll")
        .with_http_client_provider(|| None)
        .add_disposable(move || flag.store(true, Ordering::SeqCst));
    let lp = LongPollingBuilder::new(request);
    let err = HttpRemote::default().long_polling(&lp, None).await.unwrap_err();
    assert!(matches!(err, RemoteError::Configuration(_)));
    assert!(disposed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_server_sent_events_release_on_cancel() {
    let mock_server = stalled_server().await;
    let (request, disposed, released) = tracked_request(mock_server.uri());

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let sse = ServerSentEventsBuilder::new(request);
    timeout(
        Duration::from_secs(2),
        HttpRemote::default().server_sent_events(&sse, Some(&token)),
    )
    .await
    .expect("event stream ignored cancellation")
    .unwrap();
    assert!(disposed.load(Ordering::SeqCst));
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_streaming_readers_release_when_dropped() {
    let mock_server = stalled_server().await;
    let remote = HttpRemote::default();

    let (request, disposed, released) = tracked_request(mock_server.uri());
    let lp = LongPollingBuilder::new(request);
    let outcome = timeout(Duration::from_millis(100), remote.long_polling(&lp, None)).await;
    assert!(outcome.is_err());
    assert!(disposed.load(Ordering::SeqCst));
    assert!(released.load(Ordering::SeqCst));

    let (request, disposed, released) = tracked_request(mock_server.uri());
    let sse = ServerSentEventsBuilder::new(request);
    let outcome = timeout(Duration::from_millis(100), remote.server_sent_events(&sse, None)).await;
    assert!(outcome.is_err());
    assert!(disposed.load(Ordering::SeqCst));
    assert!(released.load(Ordering::SeqCst));
}
