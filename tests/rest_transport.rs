//! REST round trips against a one-shot HTTP server on localhost.

use std::time::Duration;

use hello_gateway::config::BotConfig;
use hello_gateway::http::{ApiResponse, NoContent};
use hello_gateway::{BotError, Client};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Serve exactly one response; the raw request comes back on the channel.
async fn serve_once(
    status: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let mut response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
        tx.send(request).ok();
    });

    (base, rx)
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn client(base: String, token: Option<&str>) -> Client {
    Client::new(BotConfig {
        api_url: base,
        token: token.map(str::to_string),
        ..BotConfig::default()
    })
    .unwrap()
}

// -- login --

#[tokio::test]
async fn login_stores_token_and_identity() {
    let (base, request) = serve_once(
        "200 OK",
        &[],
        r#"{"token":"tok-1","user":{"id":"42","username":"hello"}}"#,
    )
    .await;
    let client = client(base, None);

    let login = client.login("bot", "hunter2").await.unwrap();
    assert_eq!(login.token, "tok-1");
    assert_eq!(client.http().token().as_deref(), Some("tok-1"));
    assert_eq!(client.user().map(|u| u.id), Some("42".to_string()));
    assert_eq!(client.framework().identity().as_deref(), Some("42"));

    let request = request.await.unwrap();
    assert!(request.starts_with("POST /auth/login "), "{request}");
    assert!(request.contains(r#""username":"bot""#));
}

#[tokio::test]
async fn login_rejected_with_401() {
    let (base, _request) =
        serve_once("401 Unauthorized", &[], r#"{"message":"bad credentials"}"#).await;
    let client = client(base, None);

    let err = client.login("bot", "wrong").await.unwrap_err();
    assert!(matches!(err, BotError::Authentication(ref m) if m == "bad credentials"), "{err:?}");
    assert!(client.http().token().is_none());
}

// -- requests --

#[tokio::test]
async fn requests_carry_the_bot_token() {
    let (base, request) = serve_once("204 No Content", &[], "").await;
    let client = client(base, Some("abc"));

    let resp: ApiResponse<NoContent> = client.http().delete("channels/7/messages/9").await.unwrap();
    assert!(resp.success);

    let request = request.await.unwrap().to_ascii_lowercase();
    assert!(request.starts_with("delete /channels/7/messages/9 "));
    assert!(request.contains("authorization: bot abc"));
}

#[tokio::test]
async fn too_many_requests_blocks_the_bucket() {
    let (base, _request) = serve_once(
        "429 Too Many Requests",
        &[("retry-after", "2"), ("x-ratelimit-remaining", "0")],
        r#"{"message":"slow down","retry_after":2}"#,
    )
    .await;
    let client = client(base, Some("abc"));
    let route = "GET /channels/1/messages";

    let err = client
        .http()
        .get::<Value>("channels/1/messages")
        .await
        .unwrap_err();
    match err {
        BotError::RateLimited {
            retry_after, global, ..
        } => {
            assert_eq!(retry_after, Duration::from_secs(2));
            assert!(!global);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }

    let bucket = client.limiter().bucket(route).expect("bucket recorded");
    assert_eq!(bucket.remaining, 0);
    assert!(!client.limiter().can_admit(route));
}

#[tokio::test]
async fn not_found_is_a_failed_envelope() {
    let (base, _request) = serve_once(
        "404 Not Found",
        &[],
        r#"{"message":"Unknown Channel","code":10003}"#,
    )
    .await;
    let client = client(base, Some("abc"));

    let resp: ApiResponse<Value> = client.http().get("channels/404").await.unwrap();
    assert!(!resp.success);
    assert_eq!(resp.error.as_deref(), Some("Unknown Channel"));
    assert_eq!(resp.code, Some(10003));
}

#[tokio::test]
async fn server_errors_are_raised() {
    let (base, _request) = serve_once("503 Service Unavailable", &[], "upstream down").await;
    let client = client(base, Some("abc"));

    let err = client.http().get::<Value>("servers/1").await.unwrap_err();
    assert!(matches!(err, BotError::Server { status: 503, ref message } if message == "upstream down"));
}
