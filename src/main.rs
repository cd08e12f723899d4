use std::env::current_dir;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use std::{fmt, fs};

use anyhow::{Context, Result};
use clap::Parser;

use client::Client;
use metadata::metainfo::Metainfo;
use persistence::file_storage::FileStorage;
use persistence::memory_storage::MemoryStorage;
use persistence::storage::Storage;

mod bencoding;
mod bitfield;
mod client;
mod manager;
mod metadata;
mod persistence;
mod torrent_protocol;
mod tracker;
mod util;
mod worker;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the .torrent file
    #[arg(short, long, env)]
    torrent_file: String,

    /// Optional base path where files are downloaded (directory will be created if it does not exist)
    #[arg(short, long, env, default_value_t = default_base_path())]
    base_path: String,

    /// Optional listening port
    #[arg(short, long, env, default_value_t = 6881)]
    port: u16,

    /// Keep the content in memory instead of writing it to disk
    #[arg(short, long, env)]
    in_memory: bool,

    /// Optional log level
    #[arg(short, long, env, default_value_t = LogLevels::Info)]
    log_level: LogLevels,
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum LogLevels {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

fn default_base_path() -> String {
    current_dir()
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| ".".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // init logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", args.log_level.to_string()),
    );
    log::info!(
        "peerwire {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT")
    );

    let contents = match fs::read(&args.torrent_file) {
        Ok(c) => c,
        Err(e) => {
            log::error!("could not read .torrent file {}: {e}", args.torrent_file);
            exit(1);
        }
    };
    let metainfo = match Metainfo::new(&contents) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            log::error!("The .torrent file is invalid: could not parse metainfo: {e:#}");
            exit(1);
        }
    };
    log::info!("torrent file metainfo:\n{metainfo}");
    if metainfo.announce_list.is_empty() {
        log::warn!("The .torrent file does not contain valid announces (\"announce-list\" or \"announce\" fields)");
    }

    let storage: Arc<dyn Storage> = if args.in_memory {
        Arc::new(MemoryStorage::new(metainfo.clone()))
    } else {
        Arc::new(FileStorage::new(Path::new(&args.base_path), metainfo.clone())?)
    };

    let mut client = Client::start(args.port).await?;
    client.add_torrent(metainfo, storage).await?;

    tokio::signal::ctrl_c()
        .await
        .context("could not listen for ctrl-c")?;
    client.halt().await;
    Ok(())
}
