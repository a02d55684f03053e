//! Minimal client for a Galileo storage node: store blocks and run feature
//! queries, printing responses as they arrive.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::Instant;

use galileo_store::dataset::{Block, Feature, Metadata};
use galileo_store::events::{Event, EventContainer, QueryRequest, StorageRequest};
use galileo_store::message::{NetworkDestination, RouterEvent};
use galileo_store::router::{ClientMessageRouter, RouterConfig};
use galileo_store::wire::Decode;

#[derive(Parser)]
#[command(name = "galileoctl")]
#[command(about = "Client for a Galileo storage node", long_about = None)]
struct Args {
    /// Target node (host:port).
    #[arg(long, default_value = "127.0.0.1:5555")]
    target: NetworkDestination,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a file as a block, routed to its partition by the target node.
    Store {
        /// File whose contents become the block payload.
        file: PathBuf,

        /// Block name; defaults to the file stem.
        #[arg(long)]
        name: Option<String>,

        /// Feature attached to the block, as `name=value`. Repeatable.
        #[arg(long = "feature", value_parser = parse_feature)]
        features: Vec<Feature>,
    },
    /// Run a feature query across the overlay.
    Query {
        /// Predicate such as `temperature<300`.
        expression: String,

        /// Seconds to wait for responses.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

fn parse_feature(raw: &str) -> Result<Feature, String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    if name.trim().is_empty() {
        return Err(format!("empty feature name in {raw:?}"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid feature value in {raw:?}"))?;
    Ok(Feature::new(name.trim(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Store {
            file,
            name,
            features,
        } => store(&args.target, file, name, features).await,
        Command::Query {
            expression,
            timeout_secs,
        } => query(&args.target, expression, timeout_secs).await,
    }
}

async fn store(
    target: &NetworkDestination,
    file: PathBuf,
    name: Option<String>,
    features: Vec<Feature>,
) -> anyhow::Result<()> {
    let data = std::fs::read(&file).with_context(|| format!("read {}", file.display()))?;
    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    });
    let metadata = Metadata {
        name,
        features,
    };
    let block = Block::new(metadata, data);

    let router = ClientMessageRouter::new(RouterConfig::default());
    let frame = Event::StorageRequest(StorageRequest { block }).to_frame();
    router.send_message(target, frame).await?;
    // Graceful shutdown drains the write queue before we exit.
    router.shutdown().await?;

    println!("block submitted to {target}; the protocol has no storage ack, verify via query");
    Ok(())
}

async fn query(
    target: &NetworkDestination,
    expression: String,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let router = ClientMessageRouter::new(RouterConfig::default());
    let mut events = router.subscribe();

    let frame = Event::QueryRequest(QueryRequest {
        query: expression.clone(),
    })
    .to_frame();
    router.send_message(target, frame).await?;

    let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(1));
    let mut expected: Option<usize> = None;
    let mut received = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            eprintln!("timed out with {received} responses");
            break;
        }
        let event = match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => {
                eprintln!("timed out with {received} responses");
                break;
            }
        };

        match event {
            RouterEvent::Message(message) => {
                let container = EventContainer::from_bytes(message.payload)?;
                match Event::decode(&container)? {
                    Event::QueryPreamble(preamble) => {
                        println!(
                            "query {} dispatched to {} node(s)",
                            preamble.query_id,
                            preamble.nodes.len()
                        );
                        for node in &preamble.nodes {
                            println!("  -> {node}");
                        }
                        expected = Some(preamble.nodes.len());
                    }
                    Event::QueryResponse(response) => {
                        received += 1;
                        println!(
                            "response {received}: {} result(s)",
                            response.results.len()
                        );
                        for metadata in &response.results {
                            let features: Vec<String> = metadata
                                .features
                                .iter()
                                .map(|f| format!("{}={}", f.name, f.value))
                                .collect();
                            println!("  {} [{}]", metadata.name, features.join(", "));
                        }
                    }
                    other => {
                        eprintln!("unexpected event: {:?}", other.kind());
                    }
                }
                if expected == Some(received) {
                    break;
                }
            }
            RouterEvent::Disconnected { .. } => {
                eprintln!("connection to {target} lost");
                break;
            }
        }
    }

    router.force_shutdown().await
}
