//! Calculator over rpclink.
//!
//! Run a server, then call it:
//!   cargo run -p rpclink-demo-calculator -- serve --port 8001
//!   cargo run -p rpclink-demo-calculator -- call add 2 3

use anyhow::Context;
use clap::{Parser, Subcommand};
use rpclink::{Client, EndpointOptions, Function, RpcError, Server, Service, Value};
use rpclink_ws::{serve, WebSocketConnector};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "calculator")]
#[command(about = "Serve or call a calculator over rpclink")]
struct Cli {
    /// Endpoint options as TOML.
    #[arg(short, long, value_name = "FILE", env = "RPCLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish the calculator and wait for clients.
    Serve {
        #[arg(short, long, default_value_t = 8001)]
        port: u16,
        #[arg(short, long, default_value = "calculator")]
        name: String,
    },
    /// Connect and run one operation.
    Call {
        #[arg(short, long, default_value = "ws://127.0.0.1:8001")]
        address: String,
        #[arg(short, long, default_value = "cli")]
        name: String,
        /// add, subtract, multiply, divide or count
        method: String,
        a: i64,
        #[arg(default_value_t = 0)]
        b: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let options = load_options(cli.config)?;
    match cli.command {
        Command::Serve { port, name } => run_server(port, name, options).await,
        Command::Call {
            address,
            name,
            method,
            a,
            b,
        } => run_call(address, name, options, &method, a, b).await,
    }
}

fn load_options(path: Option<PathBuf>) -> anyhow::Result<EndpointOptions> {
    let Some(path) = path else {
        return Ok(EndpointOptions::default());
    };
    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(EndpointOptions::from_toml_str(&source)?)
}

/// Apply `op` to the two integer arguments, failing instead of wrapping.
fn arithmetic(
    args: &[Value],
    name: &str,
    op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, RpcError> {
    let (a, b) = (Value::int_arg(args, 0)?, Value::int_arg(args, 1)?);
    op(a, b)
        .map(Value::from)
        .ok_or_else(|| RpcError::new(format!("{name} overflows: {a}, {b}")))
}

fn calculator() -> Service {
    Service::new()
        .method("add", |args| async move { arithmetic(&args, "add", i64::checked_add) })
        .method("subtract", |args| async move {
            arithmetic(&args, "subtract", i64::checked_sub)
        })
        .method("multiply", |args| async move {
            arithmetic(&args, "multiply", i64::checked_mul)
        })
        .method("divide", |args| async move {
            if Value::int_arg(&args, 1)? == 0 {
                return Err(RpcError::new("division by zero"));
            }
            arithmetic(&args, "divide", i64::checked_div)
        })
        // count(n, callback) calls back once per step and returns the sum
        .method("count", |args| async move {
            let n = Value::int_arg(&args, 0)?;
            let callback = args
                .get(1)
                .and_then(Value::as_proxy)
                .cloned()
                .ok_or_else(|| RpcError::new("count expects a callback"))?;
            let mut total: i64 = 0;
            for step in 1..=n {
                let reply = callback.call(vec![Value::from(step)]).await?;
                total = total
                    .checked_add(reply.as_i64().unwrap_or_default())
                    .ok_or_else(|| RpcError::new("count overflows"))?;
            }
            Ok(Value::from(total))
        })
}

async fn run_server(port: u16, name: String, options: EndpointOptions) -> anyhow::Result<()> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let server = Server::new(name, format!("ws://{addr}"), options);
    server.publish("service", calculator().into_value())?;
    server.open(1, Duration::from_secs(1)).await?;

    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "server event");
        }
    });

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on ws://{}", addr);
    tokio::select! {
        result = serve(listener, server.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "accept loop failed");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    server.close().await;
    Ok(())
}

async fn run_call(
    address: String,
    name: String,
    options: EndpointOptions,
    method: &str,
    a: i64,
    b: i64,
) -> anyhow::Result<()> {
    let client = Client::new(name, address, WebSocketConnector, options);
    client.open(3, Duration::from_secs(1)).await?;
    let protocol = client.protocol().context("no session after open")?;
    let service = protocol
        .get("service")
        .await?
        .into_proxy()
        .context("service is not an object")?;

    let args = if method == "count" {
        let square = Function::new(|args| async move {
            let step = Value::int_arg(&args, 0)?;
            info!(step, "callback");
            step.checked_mul(step)
                .map(Value::from)
                .ok_or_else(|| RpcError::new("square overflows"))
        });
        vec![Value::from(a), square.into_value()]
    } else {
        vec![Value::from(a), Value::from(b)]
    };
    let result = service.invoke(method, args).await;
    client.close().await;

    match result {
        Ok(value) => {
            println!("{value:?}");
            Ok(())
        }
        Err(err) => {
            error!(trace = %err.stack_trace(), "remote call failed");
            Err(err.into())
        }
    }
}
