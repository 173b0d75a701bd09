//! Entry point for the `request-queue` demo.
//!
//! Runs either a **server** that performs text requests from one or more
//! client nodes, or a **client** that sends a batch of numbered text
//! requests and waits for all of them to be acknowledged.  All protocol work
//! lives in the library; `main.rs` owns only process setup.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use request_queue::{
    wire, ClientConfig, QueueError, Request, RequestFailure, RequestHandler, RequestQueueClient,
    RequestQueueListener, RequestQueueServer, RetryConfig, ServerRegistry, TcpSocketFactory,
};

/// Ordered, exactly-once request delivery between nodes.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    retry: RetryArgs,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct RetryArgs {
    /// How long connectivity faults may continue before they are reported.
    #[arg(long, default_value_t = 1000, global = true)]
    max_retry_ms: u64,

    /// Pause between reconnection attempts.
    #[arg(long, default_value_t = 100, global = true)]
    retry_wait_ms: u64,
}

impl RetryArgs {
    fn config(&self) -> RetryConfig {
        RetryConfig::new(
            Duration::from_millis(self.max_retry_ms),
            Duration::from_millis(self.retry_wait_ms),
        )
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Accept requests from the given client nodes and log each one.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: String,

        /// Client node ids to accept requests from.
        #[arg(short, long = "node", required = true)]
        nodes: Vec<i64>,
    },
    /// Send numbered text requests to a server.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: String,

        /// This client's node id.
        #[arg(short, long)]
        node: i64,

        /// Number of requests to send.
        #[arg(short, long, default_value_t = 10)]
        count: u32,

        /// Requests that may be outstanding at once.
        #[arg(long, default_value_t = 100)]
        queue_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let retry = cli.retry.config();

    match cli.mode {
        Mode::Server { bind, nodes } => run_server(&bind, nodes, retry).await,
        Mode::Client {
            server,
            node,
            count,
            queue_size,
        } => {
            let config = ClientConfig { retry, queue_size };
            run_client(&server, node, count, config).await
        }
    }
}

// ---------------------------------------------------------------------------
// Server mode
// ---------------------------------------------------------------------------

/// Performs text requests by logging them.
struct LogHandler {
    node_id: i64,
}

impl RequestHandler for LogHandler {
    type Request = String;

    async fn read_request(&self, input: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<String> {
        wire::read_utf(input).await
    }

    fn perform_request(&self, request: String) -> Result<(), RequestFailure> {
        log::info!("node {}: {request}", self.node_id);
        Ok(())
    }
}

async fn run_server(bind: &str, nodes: Vec<i64>, retry: RetryConfig) -> Result<()> {
    let registry = Arc::new(ServerRegistry::new());
    for node_id in nodes {
        let server = RequestQueueServer::new(node_id, LogHandler { node_id })?;
        registry.register(Arc::new(server));
    }

    let socket = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Listening on {} for {} node(s)", socket.local_addr()?, registry.len());

    let listener = RequestQueueListener::new(
        socket,
        registry.clone(),
        Arc::new(|e: QueueError| log::error!("listener failed: {e}")),
        retry,
    )?;

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    listener.shutdown().await;
    registry.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Client mode
// ---------------------------------------------------------------------------

/// A text request that reports its outcome on a channel.
struct TextRequest {
    text: String,
    done: mpsc::UnboundedSender<bool>,
}

impl Request for TextRequest {
    fn write_request(&self, out: &mut Vec<u8>) -> io::Result<()> {
        wire::encode_utf(out, &self.text);
        Ok(())
    }

    fn completed(&self) {
        let _ = self.done.send(true);
    }

    fn abandoned(&self) {
        let _ = self.done.send(false);
    }
}

async fn run_client(server: &str, node: i64, count: u32, config: ClientConfig) -> Result<()> {
    let (host, port) = server
        .rsplit_once(':')
        .context("server address must be HOST:PORT")?;
    let port: u16 = port.parse().context("invalid port")?;
    let factory = TcpSocketFactory::new(host, port);
    log::info!("Sending {count} request(s) to {factory} as node {node}");

    let client = RequestQueueClient::new(
        node,
        factory,
        Arc::new(|e: QueueError| log::error!("client failed: {e}")),
        config,
    )?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    for i in 0..count {
        let request = TextRequest {
            text: format!("request {i} from node {node}"),
            done: done_tx.clone(),
        };
        client.add_request(Arc::new(request)).await?;
    }
    drop(done_tx);

    let mut completed = 0;
    while let Some(ok) = done_rx.recv().await {
        if !ok {
            break;
        }
        completed += 1;
        if completed == count {
            break;
        }
    }
    client.shutdown().await;

    if completed < count {
        bail!("only {completed} of {count} request(s) completed");
    }
    log::info!("All {count} request(s) completed");
    Ok(())
}
