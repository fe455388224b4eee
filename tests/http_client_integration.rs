//! Integration tests for the workflow HTTP client against a mock server

use apiflow::error::FlowError;
use apiflow::http::{
    CircuitBreakerConfig, ConnectionPool, PollConfig, PoolConfig, RequestSpec, WorkflowHttpClient,
};
use apiflow::models::{AuthConfig, BackoffStrategy, HttpMethod, RetryConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> WorkflowHttpClient {
    WorkflowHttpClient::new(server.uri(), Arc::new(ConnectionPool::default()))
}

fn post_spec(endpoint: &str) -> RequestSpec {
    RequestSpec {
        endpoint: endpoint.to_string(),
        method: HttpMethod::Post,
        headers: HashMap::new(),
        payload: None,
        timeout: None,
        download_response: false,
        upload_files: None,
        poll: None,
        retry: None,
    }
}

fn retry(limit: u32, delay: &str) -> RetryConfig {
    RetryConfig {
        limit,
        delay: delay.to_string(),
        backoff: BackoffStrategy::Constant,
        timeout: None,
    }
}

#[tokio::test]
async fn test_json_response_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"n": 7})))
        .mount(&server)
        .await;

    let outcome = client_for(&server)
        .execute(&post_spec("/run"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.value, serde_json::json!({"n": 7}));
    assert_eq!(outcome.retry_count, 0);
}

#[tokio::test]
async fn test_text_response_passthrough() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/plain"))
        .respond_with(ResponseTemplate::new(200).set_body_string("just text"))
        .mount(&server)
        .await;

    let outcome = client_for(&server)
        .execute(&post_spec("/plain"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.value, serde_json::json!("just text"));
}

#[tokio::test]
async fn test_401_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/secure"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let result = client_for(&server)
        .execute(&post_spec("/secure"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(FlowError::Authentication { .. })));
}

#[tokio::test]
async fn test_4xx_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
        .expect(1)
        .mount(&server)
        .await;

    let mut spec = post_spec("/missing");
    spec.retry = Some(retry(3, "0.1s"));

    let result = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(FlowError::Client { status: 404, .. })
    ));
}

#[tokio::test]
async fn test_5xx_retries_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(500).set_body_string("api_key=abcdefghij1234567890"))
        .expect(3)
        .mount(&server)
        .await;

    let mut spec = post_spec("/down");
    spec.retry = Some(retry(2, "0.1s"));

    let result = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await;
    match result {
        Err(FlowError::RetryExhausted {
            retries,
            last_error,
        }) => {
            assert_eq!(retries, 2);
            // Secrets in upstream error bodies never survive
            assert!(last_error.contains("***MASKED***"), "got: {last_error}");
            assert!(!last_error.contains("abcdefghij1234567890"));
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transport_error_classification() {
    // Nothing listens on this port
    let pool = Arc::new(ConnectionPool::default());
    let client = WorkflowHttpClient::new("http://127.0.0.1:1", pool);
    let result = client
        .execute(&post_spec("/run"), &CancellationToken::new())
        .await;
    match result {
        Err(e) => assert!(e.is_retriable(), "transport errors must be retriable: {e}"),
        Ok(_) => panic!("expected a transport error"),
    }
}

#[tokio::test]
async fn test_download_response_writes_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/artifact"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(b"binary artifact content".to_vec(), "application/octet-stream"),
        )
        .mount(&server)
        .await;

    let mut spec = post_spec("/artifact");
    spec.method = HttpMethod::Get;
    spec.download_response = true;

    let outcome = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await
        .unwrap();
    let path_str = outcome.value.as_str().unwrap().to_string();
    let content = std::fs::read(&path_str).unwrap();
    assert_eq!(content, b"binary artifact content");
    std::fs::remove_file(&path_str).ok();
}

#[tokio::test]
async fn test_download_follows_url_body() {
    let server = MockServer::start().await;
    let file_url = format!("{}/file.bin", server.uri());
    Mock::given(method("GET"))
        .and(path("/link"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(file_url.into_bytes(), "text/plain"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(b"DATA".to_vec(), "application/octet-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut spec = post_spec("/link");
    spec.method = HttpMethod::Get;
    spec.download_response = true;

    let outcome = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await
        .unwrap();
    let path_str = outcome.value.as_str().unwrap().to_string();
    assert_eq!(std::fs::read(&path_str).unwrap(), b"DATA");
    std::fs::remove_file(&path_str).ok();
}

#[tokio::test]
async fn test_multipart_upload_carries_payload_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let mut upload = tempfile::NamedTempFile::new().unwrap();
    use std::io::Write;
    upload.write_all(b"file payload").unwrap();

    let mut spec = post_spec("/upload");
    spec.upload_files = Some(HashMap::from([(
        "document".to_string(),
        upload.path().to_string_lossy().into_owned(),
    )]));
    spec.payload = Some(serde_json::json!({"note": "attached", "count": 2}));

    let outcome = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.value, serde_json::json!({"ok": true}));

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let content_type = request
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("multipart/form-data"));
    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("file payload"));
    assert!(body.contains("attached"));
    assert!(body.contains("name=\"count\""));
}

#[tokio::test]
async fn test_poll_uses_default_jobs_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "j2"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/j2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "succeeded",
            "result": 11
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut spec = post_spec("/submit");
    spec.poll = Some(PollConfig {
        interval: Duration::from_secs(1),
        timeout: Duration::from_secs(30),
        completion_field: "status".to_string(),
        completion_values: vec!["succeeded".to_string()],
        result_field: Some("result".to_string()),
        poll_url_template: None,
    });

    let outcome = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.value, serde_json::json!(11));
}

#[tokio::test]
async fn test_poll_failure_status_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "j3"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/j3"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "failed"})),
        )
        .mount(&server)
        .await;

    let mut spec = post_spec("/submit");
    spec.poll = Some(PollConfig {
        interval: Duration::from_secs(1),
        timeout: Duration::from_secs(30),
        completion_field: "status".to_string(),
        completion_values: vec!["succeeded".to_string()],
        result_field: None,
        poll_url_template: None,
    });

    let result = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(FlowError::Execution(msg)) if msg.contains("failed")
    ));
}

#[tokio::test]
async fn test_poll_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "j4"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/j4"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "processing"})),
        )
        .mount(&server)
        .await;

    let mut spec = post_spec("/submit");
    spec.poll = Some(PollConfig {
        interval: Duration::from_secs(1),
        timeout: Duration::from_secs(1),
        completion_field: "status".to_string(),
        completion_values: vec!["succeeded".to_string()],
        result_field: None,
        poll_url_template: None,
    });

    let result = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(FlowError::Timeout(_))));
}

#[tokio::test]
async fn test_header_merge_with_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .and(header("Authorization", "Bearer secret-token"))
        .and(header("X-Request-Source", "pipeline"))
        .and(header("Content-Type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let mut client = client_for(&server);
    client.set_auth(AuthConfig::Bearer {
        token: "secret-token".to_string(),
    });

    let mut spec = post_spec("/run");
    spec.headers
        .insert("X-Request-Source".to_string(), "pipeline".to_string());
    spec.payload = Some(serde_json::json!({"q": 1}));

    let outcome = client.execute(&spec, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.value, serde_json::json!({"ok": true}));
}

#[tokio::test]
async fn test_step_timeout_produces_timeout_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"ok": true}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let mut spec = post_spec("/slow");
    spec.timeout = Some(Duration::from_millis(200));

    let start = Instant::now();
    let result = client_for(&server)
        .execute(&spec, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(FlowError::Timeout(_))));
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_cancellation_interrupts_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"ok": true}))
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

    let start = Instant::now();
    let result = client_for(&server).execute(&post_spec("/slow"), &cancel).await;
    assert!(matches!(
        result,
        Err(FlowError::Execution(msg)) if msg.contains("cancelled")
    ));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_circuit_breaker_opens_through_pool() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/unhealthy"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let pool = Arc::new(ConnectionPool::new(
        PoolConfig::default(),
        CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
            request_timeout: Duration::from_secs(5),
        },
    ));
    let mut client = WorkflowHttpClient::new(server.uri(), pool);
    client.set_service_name("unhealthy-service");

    let cancel = CancellationToken::new();
    for _ in 0..2 {
        let result = client.execute(&post_spec("/unhealthy"), &cancel).await;
        assert!(matches!(result, Err(FlowError::Server { .. })));
    }
    // Third call is rejected without reaching the server
    let result = client.execute(&post_spec("/unhealthy"), &cancel).await;
    assert!(matches!(result, Err(FlowError::CircuitOpen { .. })));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
