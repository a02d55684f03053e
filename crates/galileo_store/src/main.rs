// Galileo storage node binary entry point.

use clap::{Parser, Subcommand};

use galileo_store::node::{run_node_with_shutdown, NodeArgs};

#[derive(Parser)]
#[command(name = "galileo-node")]
#[command(about = "Galileo distributed storage node", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a storage node.
    Node(NodeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(node_args) => {
            run_node_with_shutdown(node_args, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
        }
    }
}
