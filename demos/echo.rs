//! Minimal echo round-trip: start a server, call it, print the reply.
//!
//! Run with: `cargo run --example echo`

use serde_json::{json, Value};
use relink::{Client, RpcError, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut server = Server::new(0);
    server
        .register("echo", |v: Value| async move { Ok::<_, RpcError>(v) })
        .await;
    server
        .register("plus", |xs: Vec<i64>| async move {
            Ok::<_, RpcError>(xs.iter().sum::<i64>())
        })
        .await;
    let addr = server.start().await?;

    let client = Client::builder(addr.port()).build();
    println!("echo -> {:?}", client.call("echo", json!({"hello": "world"})).await);
    println!("plus -> {:?}", client.call("plus", json!([1, 2, 3])).await);

    client.close();
    server.close().await;
    Ok(())
}
