//! mailmine-scrape CLI - run the scrape pipeline from the command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use mailmine_scrape::{
    proxy::{parse_proxy_list, FileProxySource},
    stages::{http_stages, ApiKey, HttpProxyChecker, SearchApiCaller},
    BroadcastSink, DomainFilter, NewSearchQuery, Orchestrator, PipelineConfig, ProxyPool,
    ProxyRecord, RunState,
};

const DEFAULT_API_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// mailmine-scrape - scrape pipeline with a health-aware proxy pool
#[derive(Parser)]
#[command(name = "mailmine-scrape")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for one search sentence
    Run(RunArgs),

    /// Parse a proxy list file and print the proxies
    Proxies(ProxiesArgs),

    /// Check URLs against the domain blocklist
    Check(CheckArgs),

    /// Print the default configuration as JSON
    Config,
}

#[derive(Parser)]
struct RunArgs {
    /// Search sentence
    sentence: String,

    /// Number of distinct links to collect
    #[arg(short, long, default_value = "10")]
    target: u32,

    /// Proxy list file, one share link per line
    #[arg(short, long)]
    proxies: Option<PathBuf>,

    /// Seconds between reloads of the proxy list file (0 disables)
    #[arg(long, default_value = "300")]
    proxy_refresh_secs: u64,

    /// Pipeline configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Search API endpoint
    #[arg(long, default_value = DEFAULT_API_ENDPOINT)]
    api_endpoint: String,

    /// Search API key; repeat to rotate between several keys
    #[arg(long)]
    api_key: Vec<String>,

    /// Search engine id
    #[arg(long, default_value = "")]
    engine_id: String,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,
}

#[derive(Parser)]
struct ProxiesArgs {
    /// Proxy list file
    file: PathBuf,

    /// Send a check request through every proxy
    #[arg(long)]
    check: bool,

    /// URL fetched by the check
    #[arg(long, default_value = "https://httpbin.org/ip")]
    check_url: String,

    /// Check timeout in seconds
    #[arg(long, default_value = "10")]
    check_timeout: u64,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,
}

#[derive(Parser)]
struct CheckArgs {
    /// URLs to check
    #[arg(required = true)]
    urls: Vec<String>,

    /// Pipeline configuration file (JSON) holding the blocklist
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => run_pipeline(args).await,
        Commands::Proxies(args) => list_proxies(args).await,
        Commands::Check(args) => check_urls(args),
        Commands::Config => print_config(),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    Ok(match path {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    })
}

async fn run_pipeline(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;

    let mut pool = ProxyPool::new(config.health.clone());
    if let Some(path) = &args.proxies {
        let source = FileProxySource::new(path)
            .with_interval(Duration::from_secs(args.proxy_refresh_secs));
        pool = pool.with_source(source);
        pool.refresh().await?;
    }
    if pool.is_empty().await && config.use_proxy {
        eprintln!("No proxies given, connecting directly");
        config.use_proxy = false;
    }
    let pool = Arc::new(pool);

    let keys = if args.api_key.is_empty() {
        vec![ApiKey::new("", &args.engine_id)]
    } else {
        args.api_key
            .iter()
            .map(|key| ApiKey::new(key, &args.engine_id))
            .collect()
    };
    let api = SearchApiCaller::with_keys(&args.api_endpoint, keys)?.with_random_start();
    let sink = Arc::new(BroadcastSink::default());
    let mut events = sink.subscribe();
    let orchestrator = Orchestrator::new(http_stages(api, &config), Arc::clone(&pool))
        .with_config(config)
        .with_sink(sink);

    let run_id = orchestrator
        .submit(NewSearchQuery::new(&args.sentence, args.target))
        .await?;

    if matches!(args.format, OutputFormat::Text) {
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                eprintln!(
                    "[{}] {} (attempt {})",
                    event.state, event.stage, event.attempt_count
                );
                if event.state.is_finished() {
                    break;
                }
            }
        });
    }

    let waiting = orchestrator.wait(run_id);
    tokio::pin!(waiting);
    let outcome = tokio::select! {
        outcome = &mut waiting => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling run");
            orchestrator.cancel(run_id).await.ok();
            waiting.await?
        }
    };

    match args.format {
        OutputFormat::Text => {
            println!("\n{}\n", outcome.description);
            for (i, link) in outcome.links.iter().enumerate() {
                println!("{}. {}", i + 1, link);
            }
            println!(
                "\nRounds: {} | Pages: {} | Blocked: {} | Failed attempts: {} | {}ms",
                outcome.stats.rounds,
                outcome.stats.pages_scraped,
                outcome.stats.blocked_urls,
                outcome.stats.failed_attempts,
                outcome.stats.duration_ms
            );
            if !pool.is_empty().await {
                println!("\nProxy health:");
                for health in pool.snapshot().await {
                    println!(
                        "  {} {:?} ok={} failed={} avg={}ms",
                        health.id,
                        health.status,
                        health.success_count,
                        health.failure_count,
                        health
                            .avg_response_time_ms
                            .map(|ms| ms.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    if outcome.final_state != RunState::Completed {
        std::process::exit(1);
    }
    Ok(())
}

async fn list_proxies(args: ProxiesArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.file)?;
    let proxies = parse_proxy_list(&text);

    if args.check {
        return check_proxies(proxies, &args).await;
    }

    match args.format {
        OutputFormat::Text => {
            println!("{} proxies in {}:\n", proxies.len(), args.file.display());
            for proxy in &proxies {
                let egress = proxy
                    .egress_url()
                    .map(|_| "ready")
                    .unwrap_or("needs local tunnel port");
                println!("  {:<40} {}", proxy.display_name(), egress);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&proxies)?);
        }
    }
    Ok(())
}

async fn check_proxies(proxies: Vec<ProxyRecord>, args: &ProxiesArgs) -> Result<()> {
    let pool = ProxyPool::with_proxies(proxies, Default::default());
    let checker = HttpProxyChecker::new(&args.check_url);
    let checks = pool
        .test_untested(&checker, Duration::from_secs(args.check_timeout))
        .await;

    match args.format {
        OutputFormat::Text => {
            let usable = checks.iter().filter(|c| c.is_usable()).count();
            println!("{} of {} proxies usable:\n", usable, checks.len());
            for check in &checks {
                let name = pool
                    .get(check.id)
                    .await
                    .map(|p| p.display_name())
                    .unwrap_or_default();
                let verdict = match &check.error {
                    None if check.slow => "slow".to_string(),
                    None => "ok".to_string(),
                    Some(error) => error.clone(),
                };
                println!("  {:<40} {:>6}ms  {}", name, check.latency_ms, verdict);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&checks)?);
        }
    }
    Ok(())
}

fn check_urls(args: CheckArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let filter = DomainFilter::new(&config.blocked_domains);
    for url in &args.urls {
        let verdict = if filter.is_blocked(url) {
            "blocked"
        } else {
            "allowed"
        };
        println!("{}\t{}", verdict, url);
    }
    Ok(())
}

fn print_config() -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&PipelineConfig::default())?
    );
    Ok(())
}
