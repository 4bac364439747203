/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use fedgraph_core::config::{default_data_dir, ServerConfig};
use fedgraph_core::runtime::{self, Node};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

struct Args {
    config: Option<PathBuf>,
    drain: bool,
}

fn parse_args() -> Result<Args> {
    let mut out = Args {
        config: None,
        drain: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                out.config = Some(PathBuf::from(path));
            }
            "--drain" => out.drain = true,
            other => return Err(anyhow::anyhow!("unknown argument: {other}")),
        }
    }
    if out.config.is_none() {
        if let Ok(path) = std::env::var("FEDGRAPH_CONFIG") {
            if !path.trim().is_empty() {
                out.config = Some(PathBuf::from(path));
            }
        }
    }
    Ok(out)
}

fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig> {
    match path {
        Some(p) => ServerConfig::load(p),
        None => {
            let p = default_data_dir()?.join("config.json");
            if p.exists() {
                ServerConfig::load(&p)
            } else {
                Ok(ServerConfig::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();
    let args = parse_args()?;
    let cfg = load_config(args.config.as_ref())?;
    let node = Node::open(cfg).context("open node")?;
    info!("fedgraph worker {} starting", fedgraph_core::version());

    if args.drain {
        let ran = node.run_until_idle().await?;
        let stats = node.queue().stats().await?;
        info!(ran, pending = stats.pending, leased = stats.leased, "queue drained");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = node.start_worker(shutdown_rx);
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    // Let an in-flight job finish and commit.
    worker.await.context("join job worker")?;
    Ok(())
}
