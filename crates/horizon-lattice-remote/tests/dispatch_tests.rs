//! Dispatch engine tests against a mock server.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use horizon_lattice_remote::converters::ConversionContext;
use horizon_lattice_remote::{
    CancellationToken, ContentConverter, ErrorKind, HttpClient, HttpRemote, HttpRemoteOptions,
    HttpRequest, HttpRequestBuilder, HttpRequestEventHandler, HttpResponse, RemoteError,
    TargetType, TypeMatch,
};

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: u32,
    name: String,
}

#[tokio::test]
async fn test_get_with_placeholders_query_and_headers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users/10"))
        .and(query_param("expand", "roles"))
        .and(header("authorization", "Bearer secret"))
        .and(header("cookie", "session=abc"))
        .and(header("x-trace-id", "trace-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 10,
            "name": "furion"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let remote = HttpRemote::default();
    remote.register_default_client(
        HttpClient::builder()
            .base_address(mock_server.uri())
            .expect("valid base address"),
    );

    let builder = HttpRequestBuilder::get("users/{id}")
        .with_path_parameter("id", 10)
        .unwrap()
        .with_query_parameter("expand", "roles")
        .unwrap()
        .with_bearer_token("secret")
        .unwrap()
        .with_cookie("session", "abc")
        .unwrap()
        .with_trace_identifier("trace-1")
        .unwrap();

    let user: Option<User> = remote.send_as(&builder, None).await.expect("Request failed");
    assert_eq!(
        user,
        Some(User {
            id: 10,
            name: "furion".to_string()
        })
    );
}

#[tokio::test]
async fn test_post_json_content() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .and(body_json(serde_json::json!({"name": "John"})))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let remote = HttpRemote::default();
    let builder = HttpRequestBuilder::post(format!("{}/api/users", mock_server.uri()))
        .with_json_content(&serde_json::json!({"name": "John"}))
        .unwrap();

    let result = remote.send(&builder, None).await.expect("Request failed");
    assert!(result.is_success());
    let response = result.into_response().unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "created");

    let requests = mock_server.received_requests().await.unwrap();
    let content_type = requests[0].headers.get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().starts_with("application/json"));
}

#[derive(Serialize)]
struct UserQuery {
    name: &'static str,
    id: u32,
}

#[tokio::test]
async fn test_object_query_keeps_field_order() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let builder = HttpRequestBuilder::get(format!("{}/users", mock_server.uri()))
        .with_query_parameters_object(&UserQuery {
            name: "furion",
            id: 10,
        })
        .unwrap();
    HttpRemote::default().send(&builder, None).await.unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests[0].url.query(), Some("name=furion&id=10"));
}

#[tokio::test]
async fn test_ensure_success_and_suppression() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
        .mount(&mock_server)
        .await;

    let remote = HttpRemote::default();
    let url = format!("{}/missing", mock_server.uri());

    // Without ensure-success a 404 is an ordinary response.
    let result = remote
        .send(&HttpRequestBuilder::get(url.clone()), None)
        .await
        .unwrap();
    assert_eq!(result.response.as_ref().map(HttpResponse::status), Some(404));
    assert!(!result.is_success());

    let failures = Arc::new(AtomicU32::new(0));
    let counter = failures.clone();
    let builder = HttpRequestBuilder::get(url.clone())
        .ensure_success_status_code()
        .on_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let err = remote.send(&builder, None).await.unwrap_err();
    assert!(matches!(err, RemoteError::HttpStatus { status: 404, .. }));
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    let builder = HttpRequestBuilder::get(url)
        .ensure_success_status_code()
        .suppress_exceptions([ErrorKind::Transport]);
    let result = remote.send(&builder, None).await.unwrap();
    assert!(result.response.is_none());
}

#[tokio::test]
async fn test_connection_failure_is_suppressed() {
    let remote = HttpRemote::default();
    let builder = HttpRequestBuilder::get("http://127.0.0.1:9/unreachable").suppress_all_exceptions();
    let result = remote.send(&builder, None).await.unwrap();
    assert!(result.response.is_none());
}

#[tokio::test]
async fn test_status_code_handlers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let exact = seen.clone();
    let range = seen.clone();
    let other = seen.clone();

    let builder = HttpRequestBuilder::get(mock_server.uri())
        .with_status_code_handler(404u16, move |_| {
            exact.lock().push("404");
            Err(RemoteError::Content("handler failure is isolated".to_string()))
        })
        .with_status_code_handler("400-499", move |_| {
            range.lock().push("4xx");
            Ok(())
        })
        .with_status_code_handler(">=500", move |_| {
            other.lock().push("5xx");
            Ok(())
        });

    let result = HttpRemote::default().send(&builder, None).await.unwrap();
    assert_eq!(result.response.map(|r| r.status()), Some(404));
    assert_eq!(*seen.lock(), vec!["404", "4xx"]);
}

#[derive(Clone, Default)]
struct RecordingHandler {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl HttpRequestEventHandler for RecordingHandler {
    fn on_pre_send(&self, _request: &HttpRequest) -> horizon_lattice_remote::Result<()> {
        self.events.lock().push("pre_send");
        Err(RemoteError::Content("ignored".to_string()))
    }

    fn on_post_receive(&self, _response: &HttpResponse) -> horizon_lattice_remote::Result<()> {
        self.events.lock().push("post_receive");
        Ok(())
    }
}

#[tokio::test]
async fn test_hooks_run_in_order() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(header("x-from-hook", "1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let handler = RecordingHandler::default();
    let order = Arc::new(Mutex::new(Vec::new()));
    let pre = order.clone();
    let post = order.clone();

    let builder = HttpRequestBuilder::get(mock_server.uri())
        .with_event_handler(handler.clone())
        .on_pre_send(move |request| {
            pre.lock().push("pre_send");
            request
                .headers
                .insert("x-from-hook", http::HeaderValue::from_static("1"));
            Ok(())
        })
        .on_post_receive(move |response| {
            post.lock().push("post_receive");
            assert_eq!(response.status(), 200);
            Ok(())
        });

    let result = HttpRemote::default().send(&builder, None).await.unwrap();
    assert!(result.is_success());
    assert_eq!(*order.lock(), vec!["pre_send", "post_receive"]);
    assert_eq!(*handler.events.lock(), vec!["pre_send", "post_receive"]);
}

#[tokio::test]
async fn test_timeout_invokes_callback_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&mock_server)
        .await;

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let builder = HttpRequestBuilder::get(mock_server.uri())
        .with_timeout(Duration::from_millis(100))
        .with_timeout_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let err = HttpRemote::default().send(&builder, None).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zero_timeout_never_fires() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&mock_server)
        .await;

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let builder = HttpRequestBuilder::get(mock_server.uri())
        .with_timeout(Duration::ZERO)
        .with_timeout_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let result = HttpRemote::default().send(&builder, None).await.unwrap();
    assert!(result.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_propagates_and_releases() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&mock_server)
        .await;

    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let failed = Arc::new(AtomicBool::new(false));
    let failure_flag = failed.clone();
    let builder = HttpRequestBuilder::get(mock_server.uri())
        .with_timeout(Duration::from_secs(5))
        .suppress_all_exceptions()
        .on_failure(move |_| failure_flag.store(true, Ordering::SeqCst))
        .add_disposable(move || flag.store(true, Ordering::SeqCst));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = HttpRemote::default()
        .send(&builder, Some(&token))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(released.load(Ordering::SeqCst));
    assert!(!failed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_buffer_limit() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
        .mount(&mock_server)
        .await;

    let remote = HttpRemote::new(HttpRemoteOptions::new().max_response_content_buffer_size(1024));
    let builder = HttpRequestBuilder::get(mock_server.uri());
    let err = remote.send(&builder, None).await.unwrap_err();
    assert!(matches!(err, RemoteError::ContentTooLarge { limit: 1024 }));

    let builder = HttpRequestBuilder::get(mock_server.uri()).performance_optimization();
    let bytes = remote.send_as_bytes(&builder, None).await.unwrap().unwrap();
    assert_eq!(bytes.len(), 4096);
}

#[tokio::test]
async fn test_cancellation_while_buffering() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let _ = socket.read(&mut request).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let builder = HttpRequestBuilder::get(format!("http://{address}/slow-body"))
        .add_disposable(move || flag.store(true, Ordering::SeqCst));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let remote = HttpRemote::new(HttpRemoteOptions::new().max_response_content_buffer_size(4096));
    let err = tokio::time::timeout(Duration::from_secs(2), remote.send(&builder, Some(&token)))
        .await
        .expect("buffering ignored cancellation")
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(released.load(Ordering::SeqCst));
}

struct ShoutingConverter;

impl ContentConverter for ShoutingConverter {
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
    ) -> BoxFuture<'a, horizon_lattice_remote::Result<Box<dyn Any + Send>>> {
        async move {
            let text = response.text().await?;
            Ok(Box::new(text.to_uppercase()) as Box<dyn Any + Send>)
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_user_converter_takes_precedence() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&mock_server)
        .await;

    let builder = HttpRequestBuilder::get(mock_server.uri());

    let plain = HttpRemote::default();
    assert_eq!(
        plain.send_as_string(&builder, None).await.unwrap().as_deref(),
        Some("hello")
    );

    let remote = HttpRemote::new(HttpRemoteOptions::new().add_converter(ShoutingConverter));
    assert_eq!(
        remote.send_as_string(&builder, None).await.unwrap().as_deref(),
        Some("HELLO")
    );
}

#[tokio::test]
async fn test_redirect_carry_over() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(303).insert_header("location", "/new"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let remote = HttpRemote::default();
    remote.register_default_client(HttpClient::builder().no_redirects());

    let builder = HttpRequestBuilder::post(format!("{}/old", mock_server.uri()))
        .with_text_content("payload");
    let response = remote
        .send(&builder, None)
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(response.status(), 303);

    let location = response.header("location").unwrap().to_string();
    let redirected = builder.redirect_to(&location, response.status()).unwrap();
    let text = remote.send_as_string(&redirected, None).await.unwrap();
    assert_eq!(text.as_deref(), Some("moved"));
}

#[tokio::test]
async fn test_blocking_send() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("blocking"))
        .mount(&mock_server)
        .await;

    let url = mock_server.uri();
    let text = tokio::task::spawn_blocking(move || {
        let remote = HttpRemote::default();
        remote.send_as_string_blocking(&HttpRequestBuilder::get(url))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(text.as_deref(), Some("blocking"));
}
