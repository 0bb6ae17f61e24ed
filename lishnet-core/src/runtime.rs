//! Entry points for the binary's subcommands
//!
//! `run_node` opens the node, re-enables persisted networks and serves the
//! control API until Ctrl+C. The other two commands work offline.

use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{debug, info};

use crate::api::create_router;
use crate::builder::{BuildProgress, ManifestBuilder};
use crate::config::{Config, MakeLishCommand, MakeNetCommand};
use crate::manifest::{ExportOptions, Manifest};
use crate::netconfig::NetworkDefinition;
use crate::node::{LishNode, NodeError};

/// Run the LISHnet node with the given configuration
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    let node = LishNode::open(&config).await?;
    node.start().await;

    let app = create_router(node.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Node started with peer ID: {}", node.peer_id());
    info!("Control API on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        })
        .await?;

    node.shutdown().await;
    info!("Node stopped");
    Ok(())
}

fn default_output(input: &std::path::Path, compress: bool) -> PathBuf {
    let stem = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    let ext = if compress { "lish.zst" } else { "lish" };
    PathBuf::from(format!("{}.{}", stem, ext))
}

/// Build a manifest and write it out; returns the manifest and its path
pub fn make_lish(cmd: &MakeLishCommand) -> Result<(Manifest, PathBuf), NodeError> {
    let mut builder =
        ManifestBuilder::new(cmd.chunk_size, &cmd.algorithm)?.concurrency(cmd.workers);
    if let Some(id) = &cmd.id {
        builder = builder.id(id.clone());
    }
    if let Some(name) = &cmd.name {
        builder = builder.name(name.clone());
    }
    if let Some(description) = &cmd.description {
        builder = builder.description(description.clone());
    }

    let manifest = builder.build_with_progress(&cmd.input, &|event| match event {
        BuildProgress::FileList(files) => info!("Hashing {} files", files.len()),
        BuildProgress::FileStart { path, size, chunks } => {
            debug!("{} ({} bytes, {} chunks)", path, size, chunks)
        }
        BuildProgress::FileDone { path } => debug!("{} done", path),
        BuildProgress::Chunk { .. } => {}
    })?;

    let output = cmd
        .output
        .clone()
        .unwrap_or_else(|| default_output(&cmd.input, cmd.compress));
    manifest.save(
        &output,
        ExportOptions {
            minify: cmd.minify,
            compress: cmd.compress,
        },
    )?;
    info!(
        "Wrote manifest {} ({} files, {} chunks) to {}",
        manifest.id,
        manifest.files.len(),
        manifest.chunk_count(),
        output.display()
    );
    Ok((manifest, output))
}

/// Generate a network definition; written to the output file when given
pub fn make_net(cmd: &MakeNetCommand) -> Result<NetworkDefinition, NodeError> {
    let definition = NetworkDefinition::generate(
        &cmd.name,
        cmd.description.clone(),
        cmd.bootstrap.clone(),
    );
    definition.validate()?;
    if let Some(path) = &cmd.output {
        std::fs::write(path, definition.to_json()?)?;
        info!(
            "Wrote network {} ({}) to {}",
            definition.name,
            definition.network_id,
            path.display()
        );
    }
    Ok(definition)
}
