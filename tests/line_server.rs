//! End-to-end tests for the line transport on an ephemeral port.

use murloc::rpc::{LineClient, Response, ServerError, ServerHandle, WireFormat};
use murloc::{Method, MethodRegistry, Server, ServerConfig};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn registry() -> MethodRegistry {
    MethodRegistry::new()
        .route("hello", Method::no_params(|| Ok("hello, world!")))
        .and_then(|r| r.route("echo", Method::with_params(Ok)))
        .and_then(|r| {
            r.route(
                "myfunc",
                Method::optional_params(|p: Option<Value>| {
                    Ok(format!("args={}", p.unwrap_or(Value::Null)))
                }),
            )
        })
        .and_then(|r| {
            r.route(
                "sleep",
                Method::no_params(|| {
                    std::thread::sleep(Duration::from_secs(2));
                    Ok("awake")
                }),
            )
        })
        .unwrap()
}

fn config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..ServerConfig::default()
    }
}

async fn start(
    config: ServerConfig,
) -> (SocketAddr, ServerHandle, JoinHandle<Result<(), ServerError>>) {
    let server = Server::bind(config, registry()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let task = tokio::spawn(server.run_until(std::future::pending::<()>()));
    (addr, handle, task)
}

#[tokio::test]
async fn test_echo_tokens() {
    let (addr, _handle, _task) = start(config()).await;
    let mut client = LineClient::connect(addr).await.unwrap();

    let response = client.call("echo", &["hello", "world"]).await.unwrap();
    assert_eq!(response, Response::success(json!(["hello", "world"])));
}

#[tokio::test]
async fn test_raw_response_is_one_line() {
    let (addr, _handle, _task) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"echo hello world\n").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut raw = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut raw))
        .await
        .expect("timeout waiting for response")
        .unwrap();
    assert_eq!(raw, "{\"error\":0,\"data\":[\"hello\",\"world\"]}\n");
}

#[tokio::test]
async fn test_errors_keep_connection_open() {
    let (addr, _handle, _task) = start(config()).await;
    let mut client = LineClient::connect(addr).await.unwrap();

    let response = client.call("nope", &["x"]).await.unwrap();
    assert_eq!(response, Response::error("method not defined"));

    let response = client.call("echo", &[]).await.unwrap();
    assert_eq!(response, Response::error("method expected params"));

    let response = client.send_line("").await.unwrap();
    assert_eq!(response, Response::error("empty request"));

    let response = client.call("hello", &["ignored"]).await.unwrap();
    assert_eq!(response, Response::success(json!("hello, world!")));

    let response = client.call("myfunc", &[]).await.unwrap();
    assert_eq!(response, Response::success(json!("args=null")));
}

#[tokio::test]
async fn test_silent_connection_gets_no_response() {
    let (addr, _handle, _task) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.shutdown().await.unwrap();

    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
        .await
        .expect("server did not close the connection")
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let (addr, _handle, _task) = start(ServerConfig {
        idle_timeout_secs: 1,
        ..config()
    })
    .await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("idle connection was not closed")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_same_request_same_response() {
    let (addr, _handle, _task) = start(config()).await;

    let mut first = LineClient::connect(addr).await.unwrap();
    let mut second = LineClient::connect(addr).await.unwrap();

    let a = first.call("echo", &["same"]).await.unwrap();
    let b = second.call("echo", &["same"]).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_concurrent_connections_are_isolated() {
    let (addr, _handle, _task) = start(config()).await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        tasks.push(tokio::spawn(async move {
            let mut client = LineClient::connect(addr).await.unwrap();
            let token = format!("client-{}", i);
            for _ in 0..5 {
                let response = client.call("echo", &[token.as_str()]).await.unwrap();
                assert_eq!(response, Response::success(json!([token])));
            }
        }));
    }

    for task in tasks {
        timeout(Duration::from_secs(5), task)
            .await
            .expect("timeout")
            .unwrap();
    }
}

#[tokio::test]
async fn test_blocking_handler_does_not_stall_others() {
    let (addr, _handle, _task) = start(config()).await;

    let slow = tokio::spawn(async move {
        let mut client = LineClient::connect(addr).await.unwrap();
        client.call("sleep", &[]).await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = LineClient::connect(addr).await.unwrap();
    let response = timeout(Duration::from_secs(1), client.call("hello", &[]))
        .await
        .expect("fast request waited on slow handler")
        .unwrap();
    assert!(response.is_success());

    assert_eq!(slow.await.unwrap(), Response::success(json!("awake")));
}

#[tokio::test]
async fn test_json_line_format() {
    let (addr, _handle, _task) = start(ServerConfig {
        line_format: WireFormat::Json,
        ..config()
    })
    .await;
    let mut client = LineClient::connect(addr).await.unwrap();

    let response = client.call_json("echo", Some(json!({"k": [1, 2]}))).await.unwrap();
    assert_eq!(response, Response::success(json!({"k": [1, 2]})));

    let response = client.send_line("{not json").await.unwrap();
    assert_eq!(response, Response::error("invalid json request"));
}

#[tokio::test]
async fn test_active_connections_are_reaped() {
    let (addr, handle, _task) = start(config()).await;

    let mut client = LineClient::connect(addr).await.unwrap();
    client.call("hello", &[]).await.unwrap();
    assert_eq!(handle.active_connections(), 1);

    client.close().await.unwrap();
    timeout(Duration::from_secs(2), async {
        while handle.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("finished worker was not reaped");
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let (addr, handle, task) = start(config()).await;

    let mut client = LineClient::connect(addr).await.unwrap();
    assert!(client.call("hello", &[]).await.unwrap().is_success());

    handle.shutdown();
    let result = timeout(Duration::from_secs(2), task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());

    assert!(TcpStream::connect(addr).await.is_err());
}

#[test]
fn test_teardown_does_not_wait_for_blocked_handler() {
    let started = Instant::now();

    murloc::rpc::block_on_abandoning(async {
        let (addr, handle, task) = start(config()).await;
        let _slow = tokio::spawn(async move {
            let mut client = LineClient::connect(addr).await.unwrap();
            client.call("sleep", &[]).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        handle.shutdown();
        task.await.unwrap().unwrap();
    })
    .unwrap();

    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "runtime teardown waited {:?} for a blocked handler",
        started.elapsed()
    );
}
