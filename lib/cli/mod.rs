use crate::build_info;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    about = "Adaptive crawler for post-game activity reports",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[clap(long, default_value_t = 25)]
    /// Worker count for the first cycle
    pub workers: usize,

    #[clap(long)]
    /// Ids to step back from the starting point (default 10000, or 100 with --dev)
    pub buffer: Option<i64>,

    #[clap(long)]
    /// Start from this instance id instead of the latest stored one
    pub target: Option<i64>,

    #[clap(long)]
    /// Upper bound on workers (default 250, or 8 with --dev)
    pub max_workers: Option<usize>,

    #[clap(long)]
    /// Reduced-throughput development mode
    pub dev: bool,

    #[clap(long)]
    /// Crawl every nth id in development mode (default 3)
    pub dev_skip: Option<i64>,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
