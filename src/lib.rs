//! # relink
//!
//! Reconnecting line-delimited JSON-RPC client and server over TCP.
//!
//! The client keeps a bounded buffer of outbound messages. When the
//! connection drops it reconnects (with a configurable retry delay) and
//! replays, in order, every message that has not yet been answered. When the
//! buffer overflows, the oldest buffered message is evicted and its caller
//! receives an `Overflow` error. Backpressure from the socket pauses the
//! replay loop until the kernel buffer drains.
//!
//! ## Example
//!
//! ```ignore
//! use relink::{Client, RpcError, Server};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> relink::Result<()> {
//!     let mut server = Server::new(0);
//!     server.register("plus", |xs: Vec<i64>| async move {
//!         Ok::<_, RpcError>(xs[0] + xs[1])
//!     }).await;
//!     let addr = server.start().await?;
//!
//!     let client = Client::builder(addr.port()).build();
//!     let sum = client.call("plus", json!([1, 2, 3])).await;
//!     assert_eq!(sum, Ok(json!(3)));
//!
//!     client.close();
//!     server.close().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod protocol;
pub mod queue;

mod client;
mod handler;
mod server;
mod transport;

pub use client::{Client, ClientBuilder};
pub use error::{RelinkError, Result};
pub use protocol::{codes, default_encoder, Encoder, RpcError};
pub use server::Server;
