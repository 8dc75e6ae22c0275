#![warn(missing_debug_implementations, rust_2018_idioms)]

//! The `dagula` command line tool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dagula::{
    Config, DagScope, Dagula, Order, PathOptions, UnixFsEntry, car::write_car, p2p::from_network,
    path::parse_path,
};
use libp2p::Multiaddr;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, stdout};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};
use wnfs_common::Cid;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Multiaddr of the peer to fetch from, ending in `/p2p/<peer id>`
    #[arg(long, env = "DAGULA_PEER", value_name = "MULTIADDR")]
    peer: Multiaddr,

    /// How long to wait for each block
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a whole DAG and write it to stdout as a CAR file
    Get {
        /// The root CID
        cid: Cid,
    },
    /// Resolve a path and write the traversed blocks to stdout as a CAR file
    GetPath {
        /// `<cid>[/segment...]`, optionally prefixed with `/ipfs/`
        path: String,
        /// How much of the DAG below the target to fetch: all, entity or block
        #[arg(long, default_value_t = DagScope::All)]
        scope: DagScope,
        /// Block order within files: unk or dfs
        #[arg(long, default_value_t = Order::Unknown)]
        order: Order,
    },
    /// Fetch a single block and write its bytes to stdout
    Block {
        /// The block's CID
        cid: Cid,
    },
    /// Write a UnixFS file's content to stdout, list a directory, or print structured data as dag-json
    Cat {
        /// `<cid>[/segment...]`, optionally prefixed with `/ipfs/`
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config {
        request_timeout: Duration::from_secs(cli.timeout_secs),
        ..Config::default()
    };

    info!(peer = %cli.peer, "connecting");
    let dagula = from_network(cli.peer.clone(), config)
        .await
        .with_context(|| format!("couldn't connect to {}", cli.peer))?;

    let result = run(&dagula, cli.cmd).await;
    dagula.destroy().await;
    result
}

async fn run<B: wnfs_common::BlockStore>(dagula: &Dagula<B>, cmd: Command) -> Result<()> {
    let mut out = stdout();
    match cmd {
        Command::Get { cid } => {
            let (_, count) = write_car(vec![cid], dagula.get(cid), &mut out).await?;
            debug!(blocks = count, "done");
        }
        Command::GetPath { path, scope, order } => {
            let (root, _) = parse_path(&path)?;
            let blocks = dagula.get_path(&path, PathOptions { scope, order });
            let (_, count) = write_car(vec![root], blocks, &mut out).await?;
            debug!(blocks = count, "done");
        }
        Command::Block { cid } => {
            let block = dagula.get_block(&cid).await?;
            out.write_all(&block.bytes).await?;
        }
        Command::Cat { path } => match dagula.get_unixfs(&path).await? {
            UnixFsEntry::File(file) => {
                let reader = file.into_content_reader(dagula.store(), None)?;
                tokio::pin!(reader);
                tokio::io::copy(&mut reader, &mut out).await?;
            }
            UnixFsEntry::Directory { entries, .. } => {
                for (name, cid) in entries {
                    out.write_all(format!("{cid}\t{name}\n").as_bytes()).await?;
                }
            }
            UnixFsEntry::Raw(block) => out.write_all(&block.bytes).await?,
            UnixFsEntry::Object { value, .. } => {
                let mut json = serde_ipld_dagjson::to_vec(&value)?;
                json.push(b'\n');
                out.write_all(&json).await?;
            }
        },
    }
    out.flush().await?;
    Ok(())
}
