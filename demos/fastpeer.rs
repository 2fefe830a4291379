// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::prelude::*;
use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::{TcpListener, TcpStream};

use fast_rpc_peer::{Engine, FastRpcConfig};

static APP: &'static str = "fastpeer";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: u64,
    iso8601: DateTime<Utc>,
}

impl DatePayload {
    fn new() -> DatePayload {
        let now = Utc::now();
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        DatePayload {
            timestamp: millis,
            iso8601: now,
        }
    }
}

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Fast RPC peer: serves echo and date, optionally calls the other side")
        .version(crate_version!())
        .arg(
            Arg::with_name("listen")
                .help("Accept connections instead of connecting")
                .long("listen")
                .short("l")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address to connect to or listen on")
                .long("host")
                .short("h")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("key")
                .help("Name this peer knows the other side by (Default: PEER)")
                .long("key")
                .short("k")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON-encoded engine configuration")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method to call once connected")
                .long("method")
                .short("m")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded argument for the RPC method call")
                .long("args")
                .takes_value(true),
        )
        .get_matches()
}

fn register_methods(engine: &Engine, log: &Logger) {
    let echo_log = log.clone();
    engine.add_method("echo", move |caller, payload| {
        debug!(echo_log, "handling echo function request"; "caller" => caller);
        payload
    });

    let date_log = log.clone();
    engine.add_method("date", move |caller, _payload| {
        debug!(date_log, "handling date function request"; "caller" => caller);
        serde_json::to_value(DatePayload::new()).unwrap_or(Value::Null)
    });
}

async fn listen(engine: Engine, addr: SocketAddr, key: String, log: Logger) {
    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", addr, e);
        process::exit(1)
    });
    info!(log, "listening for fast requests"; "address" => addr);

    loop {
        let (socket, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(log, "failed to accept socket"; "err" => %e);
                continue;
            }
        };
        let engine = engine.clone();
        let key = key.clone();
        let conn_log = log.new(o!("remote" => remote.to_string()));
        tokio::spawn(async move {
            match engine.process_connection(socket, &key).await {
                Ok(exit) => info!(conn_log, "connection finished"; "exit" => ?exit),
                Err(e) => error!(conn_log, "connection refused"; "err" => %e),
            }
        });
    }
}

async fn connect(
    engine: Engine,
    addr: SocketAddr,
    key: String,
    call: Option<(String, Value)>,
    log: Logger,
) {
    let stream = TcpStream::connect(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });

    let serving = engine.clone();
    let serve_key = key.clone();
    let connection =
        tokio::spawn(async move { serving.process_connection(stream, &serve_key).await });

    let (method, args) = match call {
        Some(call) => call,
        None => {
            // Serve until the other side hangs up.
            match connection.await {
                Ok(Ok(exit)) => info!(log, "connection finished"; "exit" => ?exit),
                Ok(Err(e)) => error!(log, "connection refused"; "err" => %e),
                Err(e) => error!(log, "connection task failed"; "err" => %e),
            }
            return;
        }
    };

    let result = engine.call(&key, &method, &args).await;
    if result.succeeded {
        println!("{}", result.payload);
    } else {
        eprintln!(
            "Error {}: {}",
            result.error_code.code(),
            result.error_message
        );
    }

    engine.close_remote(&key).await;
    engine.stop();
    if let Ok(Ok(exit)) = connection.await {
        debug!(log, "connection finished"; "exit" => ?exit);
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let key = String::from(matches.value_of("key").unwrap_or("PEER"));

    let config = match matches.value_of("config") {
        Some(json) => FastRpcConfig::from_json(json).unwrap_or_else(|e| {
            eprintln!("Invalid configuration: {}", e);
            process::exit(1)
        }),
        None => FastRpcConfig::default(),
    };

    let call = match matches.value_of("method") {
        Some(method) => {
            let args = if matches.is_present("args") {
                value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit())
            } else {
                Value::Null
            };
            Some((method.to_string(), args))
        }
        None => None,
    };

    let engine = Engine::new(config, Some(&root_log));
    register_methods(&engine, &root_log);
    engine.start_keepalive();

    if matches.is_present("listen") {
        listen(engine, addr, key, root_log).await;
    } else {
        connect(engine, addr, key, call, root_log).await;
    }
}
