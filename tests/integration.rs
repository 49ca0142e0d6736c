//! End-to-end tests running a real server and client over loopback.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use relink::{codes, Client, RpcError, Server};

async fn plus_server() -> (Server, u16) {
    let mut server = Server::new(0);
    server
        .register("plus", |xs: Vec<i64>| async move {
            Ok::<_, RpcError>(xs.iter().sum::<i64>())
        })
        .await;
    let addr = server.start().await.unwrap();
    (server, addr.port())
}

/// Reserve a port that is currently free, for tests that start the server
/// after the client.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn call_returns_handler_result() {
    let (_server, port) = plus_server().await;
    let client = Client::builder(port).build();

    let out = client.call("plus", json!([1, 2, 3])).await;
    assert_eq!(out, Ok(json!(6)));
    client.close();
}

#[tokio::test]
async fn unknown_method_returns_method_not_found() {
    let (_server, port) = plus_server().await;
    let client = Client::builder(port).build();

    let err = client.call("minus", json!([1])).await.unwrap_err();
    assert_eq!(err.code, codes::METHOD_NOT_FOUND);
    client.close();
}

#[tokio::test]
async fn bad_params_return_internal_error() {
    let (_server, port) = plus_server().await;
    let client = Client::builder(port).build();

    let err = client.call("plus", json!("not an array")).await.unwrap_err();
    assert_eq!(err.code, codes::INTERNAL_ERROR);
    assert!(err.data.unwrap()["exc"]["msg"].is_string());
    client.close();
}

#[tokio::test]
async fn connect_failure_without_retry_is_transport_error() {
    let port = free_port();
    let client = Client::builder(port).retry(false).build();

    let err = client.call("plus", json!([1])).await.unwrap_err();
    assert_eq!(err, RpcError::new(codes::TRANSPORT_FAILURE, "connect failed"));
    client.close();
}

#[tokio::test]
async fn requests_buffer_until_server_appears() {
    let port = free_port();
    let client = Client::builder(port)
        .retry_delay(Duration::from_millis(20))
        .build();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("plus", json!([2, 3])).await })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    let mut server = Server::new(port).host("127.0.0.1");
    server
        .register("plus", |xs: Vec<i64>| async move {
            Ok::<_, RpcError>(xs.iter().sum::<i64>())
        })
        .await;
    server.start().await.unwrap();

    assert_eq!(pending.await.unwrap(), Ok(json!(5)));
    client.close();
}

#[tokio::test]
async fn overflow_evicts_oldest_buffered_requests() {
    let port = free_port();
    let client = Client::builder(port)
        .connect_immediately(true)
        .max_buffered(2)
        .retry_delay(Duration::from_millis(20))
        .build();

    let mut calls = Vec::new();
    for i in 0..4 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.call("plus", json!([i, 1])).await
        }));
        // Let the task buffer each request in order.
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let mut server = Server::new(port).host("127.0.0.1");
    server
        .register("plus", |xs: Vec<i64>| async move {
            Ok::<_, RpcError>(xs.iter().sum::<i64>())
        })
        .await;
    server.start().await.unwrap();

    let mut outcomes = Vec::new();
    for call in calls {
        outcomes.push(call.await.unwrap());
    }
    assert_eq!(outcomes[0], Err(RpcError::overflow()));
    assert_eq!(outcomes[1], Err(RpcError::overflow()));
    assert_eq!(outcomes[2], Ok(json!(3)));
    assert_eq!(outcomes[3], Ok(json!(4)));
    client.close();
}

#[tokio::test]
async fn notifications_are_delivered() {
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let mut server = Server::new(0);
    {
        let seen = Arc::clone(&seen);
        server
            .register("log", move |entry: Value| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().await.push(entry);
                    Ok::<_, RpcError>(())
                }
            })
            .await;
    }
    let port = server.start().await.unwrap().port();

    let client = Client::builder(port).build();
    client.notify("log", json!("first")).unwrap();
    client.notify("log", json!("second")).unwrap();

    // Handlers run concurrently, so wait for both rather than assuming
    // completion order.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if seen.lock().await.len() == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "notifications not delivered"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let seen = seen.lock().await;
    assert!(seen.contains(&json!("first")));
    assert!(seen.contains(&json!("second")));
    client.close();
}

#[tokio::test]
async fn slow_handler_does_not_block_later_requests() {
    let mut server = Server::new(0);
    server
        .register("slow", |_: Option<Value>| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, RpcError>("slow")
        })
        .await;
    server
        .register("fast", |_: Option<Value>| async move {
            Ok::<_, RpcError>("fast")
        })
        .await;
    let port = server.start().await.unwrap().port();

    let client = Client::builder(port).build();
    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.call("slow", ()).await })
    };
    // Make sure the slow request hits the wire first.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    assert_eq!(client.call("fast", ()).await, Ok(json!("fast")));
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "fast reply waited on the slow handler"
    );

    assert_eq!(slow.await.unwrap(), Ok(json!("slow")));
    client.close();
}

#[tokio::test]
async fn register_after_start_is_visible() {
    let mut server = Server::new(0);
    let port = server.start().await.unwrap().port();
    let client = Client::builder(port).build();

    let err = client.call("late", ()).await.unwrap_err();
    assert_eq!(err.code, codes::METHOD_NOT_FOUND);

    server
        .register("late", |_: Option<Value>| async move {
            Ok::<_, RpcError>("here")
        })
        .await;
    assert_eq!(client.call("late", ()).await, Ok(json!("here")));
    client.close();
}

#[tokio::test]
async fn client_reconnects_after_server_restart() {
    let (mut server, port) = plus_server().await;
    let client = Client::builder(port)
        .retry_delay(Duration::from_millis(20))
        .build();

    assert_eq!(client.call("plus", json!([1, 1])).await, Ok(json!(2)));

    server.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("plus", json!([2, 2])).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut server = Server::new(port).host("127.0.0.1");
    server
        .register("plus", |xs: Vec<i64>| async move {
            Ok::<_, RpcError>(xs.iter().sum::<i64>())
        })
        .await;
    server.start().await.unwrap();

    assert_eq!(pending.await.unwrap(), Ok(json!(4)));
    client.close();
}

#[tokio::test]
async fn server_restarts_with_handlers_intact() {
    let (mut server, _) = plus_server().await;
    server.close().await;
    let port = server.start().await.unwrap().port();

    let client = Client::builder(port).build();
    assert_eq!(client.call("plus", json!([4, 5])).await, Ok(json!(9)));
    client.close();
    server.close().await;
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (mut server, _) = plus_server().await;
    assert!(server.start().await.is_err());
    server.close().await;
}

#[tokio::test]
async fn calls_after_close_fail_fast() {
    let (_server, port) = plus_server().await;
    let client = Client::builder(port).build();
    client.close();
    client.close(); // idempotent

    let err = client.call("plus", json!([1])).await.unwrap_err();
    assert_eq!(err.code, codes::TRANSPORT_FAILURE);
}

#[tokio::test]
async fn handler_panic_reaches_caller_as_internal_error() {
    let mut server = Server::new(0);
    server
        .register("boom", |_: Option<Value>| async move {
            panic!("kaboom");
            #[allow(unreachable_code)]
            Ok::<_, RpcError>(())
        })
        .await;
    let port = server.start().await.unwrap().port();

    let client = Client::builder(port).build();
    let err = client.call("boom", ()).await.unwrap_err();
    assert_eq!(err.code, codes::INTERNAL_ERROR);
    assert_eq!(err.data.unwrap()["exc"]["msg"], json!("kaboom"));
    client.close();
}
