// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use serde_json::{json, Value};
use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::block_on;

use fast_rpc_peer::{CallErrorCode, Engine, FastRpcConfig};

fn root_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn client_config() -> FastRpcConfig {
    FastRpcConfig {
        disconnected_retry_interval_ms: 10,
        remote_execution_disconnected_tries: 500,
        ..FastRpcConfig::default()
    }
}

/// Serves every accepted socket as the connection "CLIENT". The server
/// calls back into the client from its "callback" method, so both
/// directions are exercised on one socket.
#[tokio::main]
async fn run_server(addr_tx: mpsc::Sender<SocketAddr>) {
    let log = root_log();
    let engine = Engine::new(FastRpcConfig::default(), Some(&log));

    let echo_log = log.clone();
    engine.add_method("echo", move |caller, payload| {
        debug!(echo_log, "handling echo function request"; "caller" => caller);
        payload
    });

    let callback_engine = engine.clone();
    engine.add_method("callback", move |caller, payload| {
        let engine = callback_engine.clone();
        let caller = caller.to_string();
        tokio::runtime::Handle::current().block_on(async move {
            let result = engine.call(&caller, "double", &payload).await;
            json!({ "doubled": result.payload, "code": result.error_code.code() })
        })
    });

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");
    info!(log, "listening for fast requests"; "address" => %addr);
    addr_tx.send(addr).expect("test receiver gone");

    while let Ok((stream, _)) = listener.accept().await {
        let engine = engine.clone();
        tokio::spawn(async move {
            let _ = engine.process_connection(stream, "CLIENT").await;
        });
    }
}

async fn run_client(addr: SocketAddr) -> Result<(), Box<dyn StdError>> {
    let engine = Engine::new(client_config(), Some(&root_log()));
    engine.add_method("double", |_, payload| {
        json!(payload.as_i64().unwrap_or(0) * 2)
    });

    let stream = TcpStream::connect(&addr).await?;
    let serving = engine.clone();
    let connection =
        tokio::spawn(async move { serving.process_connection(stream, "SERVER").await });

    for i in 1..100 {
        let data_size = i * 1000;
        let args = json!(["a".repeat(data_size)]);
        let result = engine.call("SERVER", "echo", &args).await;
        assert!(result.succeeded, "echo failed: {:?}", result);

        let data: Vec<String> = serde_json::from_value(result.payload)?;
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].len(), data_size);
    }

    let result = engine.call("SERVER", "callback", &json!(21)).await;
    assert_eq!(result.error_code, CallErrorCode::Success);
    assert_eq!(result.payload["doubled"], Value::from(42));
    assert_eq!(result.payload["code"], Value::from(0));

    assert!(engine.close_remote("SERVER").await);
    connection.await??;
    assert!(!engine.is_connected("SERVER"));

    Ok(())
}

#[test]
fn client_server_comms() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let _h_server = thread::spawn(move || run_server(addr_tx));

    let addr = addr_rx.recv().expect("server failed to start");
    let outcome = block_on(run_client(addr));
    assert!(outcome.is_ok(), "client failed: {:?}", outcome.err());
}
