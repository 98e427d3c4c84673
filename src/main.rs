use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use showtime_fetch::{
    proxy::{
        source::{gather_from, merge_candidates},
        FileSource, HttpSource, ProxyParser, ProxyScheme, ProxySource, ProxyValidator,
    },
    task::load_tasks,
    Config, FileSink, HttpListingFetcher, Orchestrator, ProxyRefresher,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fetch show listings for many locations through rotating proxies
#[derive(Parser)]
#[command(name = "showtime-fetch")]
#[command(about = "Fetch show listings for many locations through rotating proxies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for this crate
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch listings for every location in a task file
    Run(RunArgs),
    /// Gather candidate proxies from sources
    Crawl {
        /// Output file for gathered proxies
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Proxy list files to read instead of the built-in sources
        #[arg(short = 'f', long)]
        file: Vec<PathBuf>,
        /// Timeout in seconds for source requests
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// Validate proxies from a file and save results
    Check {
        /// Input file containing proxies
        input: PathBuf,
        /// Output file for good proxies
        #[arg(short, long)]
        good: Option<PathBuf>,
        /// Output file for bad proxies
        #[arg(short, long)]
        bad: Option<PathBuf>,
        /// Proxy scheme for lines without one (http, https, socks4, socks5)
        #[arg(short = 't', long, default_value = "http")]
        scheme: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON array of location records
    tasks: PathBuf,
    /// Listing API URL template, e.g. `https://host/api?region={region_code}`
    #[arg(short, long)]
    url: Option<String>,
    /// Record field holding the location key
    #[arg(long)]
    key_field: Option<String>,
    /// Fetch workers running at once
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,
    /// Attempts per location
    #[arg(long)]
    retries: Option<u32>,
    /// Exponential backoff base
    #[arg(long)]
    backoff_base: Option<f64>,
    /// Seconds between proxy pool refreshes
    #[arg(long)]
    refresh_interval: Option<u64>,
    /// Seconds to wait for the first usable proxy pool
    #[arg(long)]
    startup_timeout: Option<u64>,
    /// Base output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Proxy list files to use instead of the built-in sources
    #[arg(short = 'f', long)]
    proxy_file: Vec<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.url {
            config.url_template = url.clone();
        }
        if let Some(key_field) = &self.key_field {
            config.key_field = key_field.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(base) = self.backoff_base {
            config.backoff_base = base;
        }
        if let Some(interval) = self.refresh_interval {
            config.refresh_interval_secs = interval;
        }
        if let Some(timeout) = self.startup_timeout {
            config.startup_timeout_secs = timeout;
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if !self.proxy_file.is_empty() {
            config.proxy_files = self.proxy_file.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Run(args) => {
            args.apply(&mut config);
            run(&args.tasks, config).await?;
        }
        Commands::Crawl {
            output,
            file,
            timeout,
        } => {
            let sources = build_sources(&file, Duration::from_secs(timeout))?;
            let results = gather_from(&sources).await;
            for result in &results {
                match &result.error {
                    None => println!("Found {} proxies from {}", result.proxies.len(), result.source),
                    Some(error) => eprintln!("Error crawling {}: {}", result.source, error),
                }
            }

            let proxies = merge_candidates(results);
            println!("\nTotal unique proxies: {}", proxies.len());

            if let Some(output_path) = output {
                ProxyParser::save_to_file(&proxies, &output_path)?;
                println!("Saved proxies to {:?}", output_path);
            } else {
                for proxy in &proxies {
                    println!("{}", proxy.to_line());
                }
            }
        }
        Commands::Check {
            input,
            good,
            bad,
            scheme,
        } => {
            let scheme = parse_scheme(&scheme)?;
            let proxies = ProxyParser::parse_file(&input, scheme)?;
            println!("Loaded {} proxies from {:?}", proxies.len(), input);
            println!("Test URL: {}", config.probe_url);

            let validator = ProxyValidator::with_config(config.validator_config());
            let good_proxies = validator.validate_all(proxies.clone()).await;
            let bad_proxies: Vec<_> = proxies
                .into_iter()
                .filter(|proxy| !good_proxies.contains(proxy))
                .collect();

            println!(
                "Results: {} good, {} bad",
                good_proxies.len(),
                bad_proxies.len()
            );

            if let Some(good_path) = good {
                ProxyParser::save_to_file(&good_proxies, &good_path)?;
                println!("Saved {} good proxies to {:?}", good_proxies.len(), good_path);
            }
            if let Some(bad_path) = bad {
                ProxyParser::save_to_file(&bad_proxies, &bad_path)?;
                println!("Saved {} bad proxies to {:?}", bad_proxies.len(), bad_path);
            }
        }
    }

    Ok(())
}

async fn run(tasks_path: &Path, config: Config) -> Result<()> {
    if config.url_template.is_empty() {
        return Err(anyhow!(
            "no listing URL configured; pass --url or set url_template in the config file"
        ));
    }

    let tasks = load_tasks(tasks_path, &config.key_field)?;
    println!("Loaded {} locations from {:?}", tasks.len(), tasks_path);

    let sources = build_sources(&config.proxy_files, Duration::from_secs(30))?;
    let refresher = ProxyRefresher::new(sources, ProxyValidator::with_config(config.validator_config()))
        .with_interval(config.refresh_interval());
    let fetcher = Arc::new(HttpListingFetcher::new(config.request_template()));
    let sink = Arc::new(FileSink::timestamped(&config.output_dir)?);

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if watch_interrupts(tokio::signal::ctrl_c, stop).await {
                std::process::exit(130);
            }
        }
    });

    let orchestrator = Orchestrator::new(config.orchestrator_config(), refresher, fetcher, sink)
        .with_stop_signal(stop);
    let stats = orchestrator.run(tasks).await?;

    println!("Data fetching completed: {}", stats);
    if !stats.failed_keys.is_empty() {
        println!("Failed locations: {}", stats.failed_keys.join(", "));
    }
    info!(summary = %stats, "done");
    Ok(())
}

/// First interrupt stops new attempts. Returns `true` on the second one so
/// the caller can exit without waiting for backoffs or a refresh.
async fn watch_interrupts<F, Fut>(mut next_interrupt: F, stop: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let mut presses = 0u32;
    while next_interrupt().await.is_ok() {
        presses += 1;
        if presses == 1 {
            warn!("stop requested, finishing in-flight attempts; interrupt again to exit now");
            stop.cancel();
        } else {
            warn!("second interrupt, exiting");
            return true;
        }
    }
    false
}

fn build_sources(files: &[PathBuf], timeout: Duration) -> Result<Vec<Arc<dyn ProxySource>>> {
    if files.is_empty() {
        return Ok(HttpSource::common(timeout)?
            .into_iter()
            .map(|source| Arc::new(source) as Arc<dyn ProxySource>)
            .collect());
    }

    Ok(files
        .iter()
        .map(|path| Arc::new(FileSource::new(path, ProxyScheme::Http)) as Arc<dyn ProxySource>)
        .collect())
}

fn parse_scheme(s: &str) -> Result<ProxyScheme> {
    ProxyScheme::parse(s)
        .ok_or_else(|| anyhow!("Invalid proxy scheme: {}. Use: http, https, socks4, socks5", s))
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "info,showtime_fetch=debug"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
