use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::pager::DEFAULT_PAGE_SIZE;

#[derive(Parser, Debug)]
#[command(name = "eventlog-api", version, about = "Event log API with paginated history and histograms")]
pub struct Args {
    /// Listen address.
    #[arg(long, env = "EVENTLOG_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// SQLite database path.
    #[arg(long, env = "EVENTLOG_DB", default_value = "./data/eventlog.db")]
    pub db: PathBuf,

    /// Records per page of recent events.
    #[arg(long, env = "EVENTLOG_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub db_path: PathBuf,
    pub page_size: u64,
}

impl Config {
    pub fn from_args() -> Result<Self> {
        Self::from_parsed(Args::parse())
    }

    pub fn from_parsed(args: Args) -> Result<Self> {
        if args.page_size == 0 {
            bail!("--page-size must be greater than zero");
        }

        Ok(Self {
            listen: args.listen,
            db_path: args.db,
            page_size: args.page_size,
        })
    }
}
