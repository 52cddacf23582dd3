use anyhow::Result;
use clap::Parser;
use quarry_core::Store;
use quarry_crawler::{Crawler, HttpFetcher};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "quarry-crawler")]
#[command(about = "Breadth-first crawl from a seed URL into the index store")]
struct Cli {
    /// Seed URL to start the crawl from
    seed: String,
    /// Index store directory
    #[arg(long, default_value = "./quarry-data")]
    store: String,
    /// Maximum number of pages to fetch
    #[arg(long, default_value_t = 100_000)]
    max_docs: usize,
    /// Request timeout seconds
    #[arg(long, default_value_t = 12)]
    timeout_secs: u64,
    /// User-Agent string for requests
    #[arg(long, default_value = "quarry-bot/0.1 (+https://example.com/bot)")]
    user_agent: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Cli::parse();

    let store = Store::open(&args.store)?;
    let fetcher = HttpFetcher::new(Duration::from_secs(args.timeout_secs), &args.user_agent)?;
    let crawler = Crawler::with_limit(store, fetcher, args.max_docs);
    crawler.crawl(&args.seed).await?;
    Ok(())
}
