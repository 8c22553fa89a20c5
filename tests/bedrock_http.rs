//! Tests for the Bedrock HTTP client against a local mock server.

use batchwise::{BatchConfig, BatchError};
use batchwise::service::bedrock::BedrockJobService;
use batchwise::service::{
    CreateJobRequest, InputDataConfig, JobService, OutputDataConfig, S3InputDataConfig,
    S3OutputDataConfig, Tag,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const JOB_ARN: &str = "arn:aws:bedrock:us-east-1:123456789012:model-invocation-job/abc123xyz";
const ENCODED_ARN: &str = "arn:aws:bedrock:us-east-1:123456789012:model-invocation-job%2Fabc123xyz";

/// Helper: bind a TCP listener on localhost and return (listener, port).
async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Helper: read one full HTTP request (headers plus Content-Length body).
async fn read_request(socket: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text[..head_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8(data).unwrap()
}

fn json_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Serve exactly one request with `response`, handing back what was received.
fn serve_once(listener: TcpListener, response: String) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        socket.write_all(response.as_bytes()).await.unwrap();
        request
    })
}

fn service(port: u16) -> BedrockJobService {
    BedrockJobService::with_base_url(&format!("http://127.0.0.1:{port}"), "test-api-key").unwrap()
}

fn create_request() -> CreateJobRequest {
    CreateJobRequest {
        job_name: "nightly-batch".into(),
        role_arn: "arn:aws:iam::123456789012:role/BatchInferenceRole".into(),
        client_request_token: "nightly-batch".into(),
        model_id: "anthropic.claude-3-haiku-20240307-v1:0".into(),
        input_data_config: InputDataConfig {
            s3_input_data_config: S3InputDataConfig {
                s3_input_format: "JSONL".into(),
                s3_uri: "s3://test-bucket/input/nightly-batch.jsonl".into(),
            },
        },
        output_data_config: OutputDataConfig {
            s3_output_data_config: S3OutputDataConfig {
                s3_uri: "s3://test-bucket/output/".into(),
            },
        },
        timeout_duration_in_hours: 24,
        tags: vec![Tag {
            key: "bedrock_batch_inference".into(),
            value: "nightly-batch".into(),
        }],
    }
}

fn request_body(request: &str) -> Value {
    let (_, body) = request.split_once("\r\n\r\n").unwrap();
    serde_json::from_str(body).unwrap()
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_posts_job_with_bearer_auth() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(listener, json_response("200 OK", &format!(r#"{{"jobArn":"{JOB_ARN}"}}"#)));

    let response = service(port).create_job(&create_request()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.job_arn.as_deref(), Some(JOB_ARN));

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /model-invocation-job HTTP/1.1"), "{request}");
    assert!(request.to_ascii_lowercase().contains("authorization: bearer test-api-key"));

    let body = request_body(&request);
    assert_eq!(body["jobName"], "nightly-batch");
    assert_eq!(body["clientRequestToken"], "nightly-batch");
    assert_eq!(body["timeoutDurationInHours"], 24);
    assert_eq!(body["inputDataConfig"]["s3InputDataConfig"]["s3InputFormat"], "JSONL");
    assert_eq!(body["outputDataConfig"]["s3OutputDataConfig"]["s3Uri"], "s3://test-bucket/output/");
    assert_eq!(body["tags"][0]["key"], "bedrock_batch_inference");
}

#[tokio::test]
async fn rejected_create_reports_status_without_arn() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(
        listener,
        json_response("400 Bad Request", r#"{"message":"minimum 100 records"}"#),
    );

    let response = service(port).create_job(&create_request()).await.unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(response.job_arn, None);
    assert_eq!(response.message.as_deref(), Some("minimum 100 records"));

    server.await.unwrap();
}

#[tokio::test]
async fn rejected_create_keeps_plain_text_reason() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(
        listener,
        "HTTP/1.1 429 Too Many Requests\r\nContent-Type: text/plain\r\nContent-Length: 14\r\nConnection: close\r\n\r\nslow down now\n"
            .to_string(),
    );

    let response = service(port).create_job(&create_request()).await.unwrap();
    assert_eq!(response.status, 429);
    assert_eq!(response.message.as_deref(), Some("slow down now"));

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Get
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_job_encodes_arn_and_parses_description() {
    let (listener, port) = mock_listener().await;
    let body = serde_json::json!({
        "jobArn": JOB_ARN,
        "jobName": "nightly-batch",
        "modelId": "anthropic.claude-3-haiku-20240307-v1:0",
        "roleArn": "arn:aws:iam::123456789012:role/BatchInferenceRole",
        "status": "InProgress",
        "submitTime": "2024-06-01T12:00:00Z",
        "inputDataConfig": {"s3InputDataConfig": {"s3Uri": "s3://test-bucket/input/nightly-batch.jsonl"}},
        "outputDataConfig": {"s3OutputDataConfig": {"s3Uri": "s3://test-bucket/output/"}},
        "timeoutDurationInHours": 72
    });
    let server = serve_once(listener, json_response("200 OK", &body.to_string()));

    let description = service(port).get_job(JOB_ARN).await.unwrap();
    assert_eq!(description.status, "InProgress");
    assert_eq!(description.job_name, "nightly-batch");
    assert_eq!(description.timeout_duration_in_hours, Some(72));
    assert_eq!(description.bucket().unwrap(), "test-bucket");
    // Missing format falls back to JSONL
    assert_eq!(description.input_data_config.s3_input_data_config.s3_input_format, "JSONL");

    let request = server.await.unwrap();
    let expected = format!("GET /model-invocation-job/{ENCODED_ARN} HTTP/1.1");
    assert!(request.starts_with(&expected), "{request}");
}

#[tokio::test]
async fn get_unknown_job_is_not_found() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(listener, json_response("404 Not Found", r#"{"message":"no such job"}"#));

    let err = service(port).get_job(JOB_ARN).await.unwrap_err();
    assert!(matches!(err, BatchError::NotFound(ref arn) if arn == JOB_ARN), "{err:?}");

    server.await.unwrap();
}

async fn get_job_error(status: &str) -> BatchError {
    let (listener, port) = mock_listener().await;
    let server = serve_once(listener, json_response(status, "{}"));
    let err = service(port).get_job(JOB_ARN).await.unwrap_err();
    server.await.unwrap();
    err
}

#[tokio::test]
async fn not_found_wins_over_oversized_body() {
    let (listener, port) = mock_listener().await;
    let body = "x".repeat(2 * 1024 * 1024);
    let server = serve_once(listener, json_response("404 Not Found", &body));

    let err = service(port).get_job(JOB_ARN).await.unwrap_err();
    assert!(matches!(err, BatchError::NotFound(_)), "{err:?}");

    server.abort();
}

#[tokio::test]
async fn get_job_maps_throttling_and_auth() {
    let throttled = get_job_error("429 Too Many Requests").await;
    assert!(matches!(throttled, BatchError::RateLimited { .. }), "{throttled:?}");
    assert!(throttled.is_retryable());

    let forbidden = get_job_error("403 Forbidden").await;
    assert!(matches!(forbidden, BatchError::AuthFailed { .. }), "{forbidden:?}");
    assert!(!forbidden.is_retryable());

    let server_error = get_job_error("500 Internal Server Error").await;
    assert!(matches!(server_error, BatchError::Upstream { status: Some(500), .. }), "{server_error:?}");
    assert!(server_error.is_retryable());
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_posts_to_stop_endpoint() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(listener, json_response("200 OK", "{}"));

    let response = service(port).stop_job(JOB_ARN).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.message, None);

    let request = server.await.unwrap();
    let expected = format!("POST /model-invocation-job/{ENCODED_ARN}/stop HTTP/1.1");
    assert!(request.starts_with(&expected), "{request}");
}

#[tokio::test]
async fn rejected_stop_reports_status() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(listener, json_response("409 Conflict", r#"{"message":"already stopped"}"#));

    let response = service(port).stop_job(JOB_ARN).await.unwrap();
    assert_eq!(response.status, 409);
    assert_eq!(response.message.as_deref(), Some("already stopped"));
    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

#[test]
fn debug_output_redacts_api_key() {
    let service = BedrockJobService::new("us-west-2", "super-secret-key").unwrap();
    let debug = format!("{service:?}");
    assert!(debug.contains("bedrock.us-west-2.amazonaws.com"));
    assert!(!debug.contains("super-secret-key"));
    assert!(debug.contains("[REDACTED]"));
}

#[test]
fn client_for_config_uses_configured_region() {
    let config = BatchConfig::new(
        "anthropic.claude-3-haiku-20240307-v1:0",
        "test-bucket",
        "eu-central-1",
        "nightly-batch",
        "arn:aws:iam::123456789012:role/BatchInferenceRole",
    );
    let service = BedrockJobService::for_config(&config, "k").unwrap();
    assert!(format!("{service:?}").contains("bedrock.eu-central-1.amazonaws.com"));
}

#[test]
fn invalid_base_url_is_config_error() {
    let err = BedrockJobService::with_base_url("not a url", "k").unwrap_err();
    assert!(matches!(err, BatchError::Config(_)));
}
