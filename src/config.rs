use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;

pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_TICK_MS: u64 = 500;
pub const DEFAULT_IDLE_TICKS: u32 = 5;
pub const DEFAULT_BUFFER_LIMIT: usize = 1_000_000;
pub const DEFAULT_DETAIL_LIMIT: usize = 100;
pub const DEFAULT_STATS_SECS: u64 = 30;

#[derive(Debug, Clone, Parser)]
#[command(name = "flowgraph", version, about = "Live host/flow graph over captured traffic")]
pub struct Config {
    /// Address the viewer endpoint listens on
    #[arg(long, env = "FLOWGRAPH_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Capture binary spawned for live interfaces
    #[arg(long, env = "FLOWGRAPH_TSHARK", default_value = "tshark")]
    pub tshark: String,

    /// Prefix the capture command with sudo
    #[arg(long)]
    pub sudo: bool,

    /// Interface used when a viewer asks for capture without naming one
    #[arg(long, default_value = "any")]
    pub default_interface: String,

    /// Synthetic traffic tick in milliseconds
    #[arg(long, default_value_t = DEFAULT_TICK_MS)]
    pub tick_ms: u64,

    /// Consecutive viewer-less ticks tolerated before the generator pauses
    #[arg(long, default_value_t = DEFAULT_IDLE_TICKS)]
    pub idle_ticks: u32,

    /// Pending capture output, in bytes, before the parser resynchronises
    #[arg(long, default_value_t = DEFAULT_BUFFER_LIMIT)]
    pub buffer_limit: usize,

    /// Directory recordings are replayed from (`replay:<file>`)
    #[arg(long, env = "FLOWGRAPH_REPLAY_DIR")]
    pub replay_dir: Option<PathBuf>,

    /// Replay recordings at their original pace
    #[arg(long)]
    pub replay_pacing: bool,

    /// Detailed packets retained per flow
    #[arg(long, default_value_t = DEFAULT_DETAIL_LIMIT)]
    pub detail_limit: usize,

    /// Seconds between ingest statistics log lines
    #[arg(long, default_value_t = DEFAULT_STATS_SECS)]
    pub stats_secs: u64,

    /// Seed for synthetic traffic; defaults to the clock
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log filter, e.g. `flowgraph=debug`
    #[arg(long, env = "FLOWGRAPH_LOG")]
    pub log: Option<String>,
}

impl Config {
    /// Reads `.env` first so its values feed the `env` fallbacks.
    pub fn load() -> Self {
        dotenv().ok();
        Config::parse()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            tshark: "tshark".into(),
            sudo: false,
            default_interface: "any".into(),
            tick_ms: DEFAULT_TICK_MS,
            idle_ticks: DEFAULT_IDLE_TICKS,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            replay_dir: None,
            replay_pacing: false,
            detail_limit: DEFAULT_DETAIL_LIMIT,
            stats_secs: DEFAULT_STATS_SECS,
            seed: None,
            log: None,
        }
    }
}
