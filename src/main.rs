use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, TurnstileConfig};
use turnstile::ratelimit::{LimitExceeded, RateLimiter, Request, RuleSet};

/// Evaluate newline-delimited JSON requests read from stdin.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Settings file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Rules file; overrides `rules_path` from settings
    #[arg(short, long)]
    rules: Option<String>,

    /// Range of the statistics snapshot printed on exit
    #[arg(long, default_value = "1h")]
    stats_range: String,

    /// Log output format; overrides settings
    #[arg(long, value_parser = ["text", "json"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;

    let format = match cli.log_format.as_deref() {
        Some("json") => LogFormat::Json,
        Some(_) => LogFormat::Text,
        None => config.logging.format,
    };
    init_tracing(&config.logging.level, format);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rate_limiter = Arc::new(RateLimiter::with_config(config.engine.clone()));

    if let Some(path) = cli.rules.as_deref().or(config.rules_path.as_deref()) {
        let rule_set = RuleSet::from_file(path)?;
        let count = rule_set.rules.len();
        for rule in rule_set.rules {
            rate_limiter.add_rule(rule);
        }
        info!(path = %path, rules = count, "Rules loaded");
    }

    rate_limiter.on(|event: &LimitExceeded| {
        warn!(
            rule = %event.rule,
            identifier = %event.identifier,
            endpoint = %event.endpoint,
            retry_after_ms = event.retry_after_ms,
            "Rate limit exceeded"
        );
    });

    tokio::select! {
        result = process_stdin(rate_limiter.clone()) => result?,
        _ = shutdown_signal() => {}
    }

    let snapshot = rate_limiter.statistics(&cli.stats_range);
    println!("{}", serde_json::to_string(&snapshot)?);

    rate_limiter.flush_events(Duration::from_secs(1)).await;
    rate_limiter.destroy();
    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Answer each request line with a result line until stdin closes.
async fn process_stdin(rate_limiter: Arc<RateLimiter>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request line");
                continue;
            }
        };

        let result = rate_limiter.check_limit(&request);
        let mut out = serde_json::to_vec(&result)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
