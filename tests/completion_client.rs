//! Completion client behaviour against a mock OpenAI-compatible server.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use discovery_forge::llm::{CompletionProvider, CompletionRequest, LmStudioClient, RetryConfig};
use discovery_forge::LlmError;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::default()
        .with_max_attempts(max_attempts)
        .with_uniform_backoff(Duration::from_millis(1))
}

fn client(server: &MockServer, retry: RetryConfig) -> LmStudioClient {
    LmStudioClient::new(format!("{}/v1/", server.uri()), "test-key", retry).unwrap()
}

fn request() -> CompletionRequest {
    CompletionRequest::new("test-model", "You are a physicist.", "Is it possible?")
}

fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let frame = json!({ "choices": [{ "delta": { "content": fragment } }] });
        body.push_str(&format!("data: {}\n\n", frame));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn test_streams_and_accumulates_fragments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "test-model", "stream": true })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body(&["{\"chain_status\"", ": \"VALID\"", "}"]))
                .insert_header("content-type", "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let text = client(&server, fast_retry(3))
        .complete(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "{\"chain_status\": \"VALID\"}");
}

#[tokio::test]
async fn test_delivers_fragments_in_arrival_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body(&["The ", "lattice ", "holds."]))
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let received = Mutex::new(Vec::new());
    let text = client(&server, fast_retry(1))
        .complete_streaming(&request(), &CancellationToken::new(), &|fragment: &str| {
            received.lock().unwrap().push(fragment.to_string());
        })
        .await
        .unwrap();

    assert_eq!(text, "The lattice holds.");
    assert_eq!(
        received.into_inner().unwrap(),
        vec!["The ", "lattice ", "holds."]
    );
}

#[tokio::test]
async fn test_ignores_frames_without_content() {
    let server = MockServer::start().await;
    let body = concat!(
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data:{\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\r\n\r\n",
        "data: not json\n\n",
        "data: [DONE]\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"after done\"}}]}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let text = client(&server, fast_retry(1))
        .complete(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "hello");
}

#[tokio::test]
async fn test_retries_status_errors_up_to_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .expect(4)
        .mount(&server)
        .await;

    let err = client(&server, fast_retry(4))
        .complete(&request(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        LlmError::RetriesExhausted { attempts, last_error } => {
            assert_eq!(attempts, 4);
            assert!(last_error.contains("500"));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&["ok"])))
        .expect(1)
        .mount(&server)
        .await;

    let text = client(&server, fast_retry(5))
        .complete(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, "ok");
}

#[tokio::test]
async fn test_cancelled_before_first_byte_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&["unused"])))
        .expect(0)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client(&server, fast_retry(10))
        .complete(&request(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_cancel_interrupts_in_flight_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body(&["too late"]))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = client(&server, fast_retry(10)).complete(&request(), &cancel).await;

    assert!(matches!(result, Err(LlmError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_interrupts_slow_error_body() {
    // Sends an error status, then stalls before the promised body.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = vec![0u8; 16 * 1024];
        let _ = socket.read(&mut head).await;
        socket
            .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 1000\r\n\r\npartial")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let client = LmStudioClient::new(format!("http://{}/v1", addr), "k", fast_retry(3)).unwrap();
    let started = Instant::now();
    let result = client.complete(&request(), &cancel).await;

    assert!(matches!(result, Err(LlmError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_timeouts_retry_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body(&["slow"]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let retry = fast_retry(2).with_request_timeout(Duration::from_millis(200));
    let err = client(&server, retry)
        .complete(&request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::RetriesExhausted { attempts: 2, .. }));
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn test_connection_refused_exhausts_retries() {
    let client = LmStudioClient::new("http://127.0.0.1:1/v1", "k", fast_retry(2)).unwrap();
    let err = client
        .complete(&request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::RetriesExhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn test_lists_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": "gpt-oss-20b" }, { "id": "meta-llama-3.1-8b-instruct" }]
        })))
        .mount(&server)
        .await;

    let client = client(&server, fast_retry(1));
    let models = client.list_models().await.unwrap();
    assert_eq!(models, vec!["gpt-oss-20b", "meta-llama-3.1-8b-instruct"]);
    assert_eq!(client.loaded_model().await.as_deref(), Some("gpt-oss-20b"));
}

#[tokio::test]
async fn test_list_models_reports_unreachable_service() {
    let client = LmStudioClient::new("http://127.0.0.1:1/v1", "k", fast_retry(1)).unwrap();
    assert!(client.list_models().await.is_err());
    assert!(client.loaded_model().await.is_none());
}
