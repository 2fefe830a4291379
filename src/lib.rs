// Copyright 2020 Joyent, Inc.

//! Fast peer: bidirectional JSON RPC over a single byte stream
//!
//! Two endpoints joined by one ordered, reliable byte stream (a TCP or TLS
//! socket, a pipe, an in-memory duplex) can each call named methods on the
//! other. Both directions' traffic is interleaved on the same stream. From
//! the caller's point of view a call completes once its Answer arrives, its
//! deadline passes, or the connection goes away.
//!
//! Protocol definition
//!
//! Every frame starts with a one byte discriminator. Integers are
//! big-endian.
//!
//! * Query `'Q'`
//!
//!     * REQID      8-byte unsigned integer, allocated sequentially per
//!                  connection starting at 1 and never reused
//!
//!     * NAMELEN    1-byte unsigned integer, length of the method name
//!
//!     * NAME       method name, UTF-8
//!
//!     * DLEN       4-byte unsigned integer, length of the payload
//!
//!     * DATA       JSON-encoded argument
//!
//! * Answer `'A'`
//!
//!     * REQID      the request id of the Query being answered
//!
//!     * STATUS     1-byte execution status:
//!
//!         * 2  executed, DATA holds the result
//!
//!         * 3  dropped, the remote worker queue was full
//!
//!         * 4  method not found (or its handler failed)
//!
//!         * 5  executed, but the result was too large to send
//!
//!     * DLEN, DATA as for a Query. An empty payload means JSON `null`.
//!
//! * Ping `'P'`: no body, keeps idle connections alive.
//!
//! * Shutdown `0x00`: no body, asks the receiver to close the connection.
//!
//! Any other discriminator, or a payload longer than the receiver's
//! maximum message size, is fatal to the connection.
//!
//! Usage
//!
//! ```no_run
//! use fast_rpc_peer::{Engine, FastRpcConfig};
//! use serde_json::json;
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> std::io::Result<()> {
//! let engine = Engine::new(FastRpcConfig::default(), None);
//! engine.add_method("echo", |_caller, payload| payload);
//! // Idle connections are dropped after the socket timeout unless pinged.
//! engine.start_keepalive();
//!
//! let stream = TcpStream::connect("127.0.0.1:2030").await?;
//! let serving = engine.clone();
//! tokio::spawn(async move { serving.process_connection(stream, "SERVER").await });
//!
//! let result = engine.call("SERVER", "echo", &json!({"x": 1})).await;
//! assert!(result.succeeded);
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod hooks;
mod keepalive;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod table;

pub use client::{CallErrorCode, CallResult};
pub use config::FastRpcConfig;
pub use engine::Engine;
pub use hooks::{EngineHooks, NoopHooks};
pub use server::ConnectionExit;
