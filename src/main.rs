//! LISHnet - chunked dataset distribution over private libp2p networks

use lishnet_core::{make_lish, make_net, run_node, Command};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let command = Command::from_cli()?;

    init_logging(command.log_level());

    match command {
        Command::Start(config) => {
            tracing::info!("Starting LISHnet node...");
            run_node(config).await?;
        }
        Command::MakeLish(cmd) => {
            let (manifest, path) = make_lish(&cmd)?;
            println!("{} {}", manifest.id, path.display());
        }
        Command::MakeNet(cmd) => {
            let definition = make_net(&cmd)?;
            if cmd.output.is_none() {
                println!("{}", definition.to_json()?);
            }
        }
    }

    Ok(())
}

// Logs go to stderr so make-net and make-lish keep stdout for their output.
fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
