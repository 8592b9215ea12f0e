use anyhow::Result;
use engine_bench::{BenchmarkRunner, Cli, Config};
use log::{LevelFilter, Metadata, Record, debug, info, warn};
use ringlog::{Drain, File, LogBuilder, MultiLogBuilder, Output, Stderr};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum log file size before rotation (10MB)
const LOG_FILE_MAX_SIZE: u64 = 1024 * 1024 * 10;

/// Parse log filter strings like "hyper=info" into a map of module prefix to level filter
fn parse_log_filters(filters: &[String]) -> HashMap<String, LevelFilter> {
    let mut map = HashMap::new();
    for filter in filters {
        if let Some((module, level)) = filter.split_once('=') {
            let level_filter = match level.to_lowercase().as_str() {
                "error" => LevelFilter::Error,
                "warn" => LevelFilter::Warn,
                "info" => LevelFilter::Info,
                "debug" => LevelFilter::Debug,
                "trace" => LevelFilter::Trace,
                "off" => LevelFilter::Off,
                _ => continue,
            };
            map.insert(module.to_string(), level_filter);
        }
    }
    map
}

/// Check if a log record should be filtered based on per-module filters
fn should_log(metadata: &Metadata, filters: &HashMap<String, LevelFilter>) -> bool {
    let target = metadata.target();

    // Longest matching prefix wins
    let matched = filters
        .iter()
        .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len());

    match matched {
        Some((_, level_filter)) => metadata.level() <= *level_filter,
        // Unmatched targets fall through to the global level filter
        None => true,
    }
}

/// Custom logger with per-module filtering that wraps ringlog
struct FilteredLogger {
    output: Mutex<Box<dyn Output>>,
    max_level: LevelFilter,
    filters: HashMap<String, LevelFilter>,
}

impl log::Log for FilteredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && should_log(metadata, &self.filters)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata())
            && let Ok(mut output) = self.output.lock()
        {
            let message = format!(
                "{} {} [{}] {}\n",
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false),
                record.level(),
                record.target(),
                record.args()
            );
            let _ = output.write_all(message.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let log_level = config.log.level.to_level_filter();

    // Configure output destination
    let output: Box<dyn Output> = if let Some(ref log_file) = config.output.trace_log {
        // Log to file with rotation
        let backup_file = log_file.with_extension("old");
        Box::new(File::new(log_file.clone(), backup_file, LOG_FILE_MAX_SIZE)?)
    } else {
        Box::new(Stderr::new())
    };

    let filters = parse_log_filters(&config.log.filter);

    if filters.is_empty() {
        // No filters - use ringlog directly
        let base_log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to initialize logger: {:?}", e))?;

        let mut drain = MultiLogBuilder::new()
            .level_filter(log_level)
            .default(base_log)
            .build()
            .start();

        // ringlog buffers records until the drain is flushed
        std::thread::spawn(move || {
            loop {
                let _ = drain.flush();
                std::thread::sleep(Duration::from_millis(100));
            }
        });
    } else {
        let logger = FilteredLogger {
            output: Mutex::new(output),
            max_level: log_level,
            filters,
        };

        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(log_level);
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = Config::load(&cli.config)?;

    init_logging(&config)?;

    // Print clean startup message
    if !config.output.quiet {
        println!("Engine Benchmark");
        println!("   Config: {}", cli.config.display());
        for engine in &config.engines {
            println!("   Engine: {} ({}) {}", engine.name, engine.kind, engine.base_url);
        }

        match config.load.qps {
            Some(qps) => println!(
                "   Mode: Rate limited ({:.1} req/s per engine, {} workers)",
                qps, config.load.concurrency
            ),
            None => println!("   Mode: Concurrent ({} workers)", config.load.concurrency),
        }

        if let Some(total) = config.load.total_requests {
            println!("   Requests: {} per engine", total);
        } else if let Some(duration) = config.load.duration_seconds {
            println!("   Duration: {}s", duration);
        }
        println!();
    }

    // Build custom tokio runtime with specified worker threads
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async { run_benchmark(config, cli.check).await })
}

async fn run_benchmark(config: Config, check_only: bool) -> Result<()> {
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding requests");
            on_signal.cancel();
        }
    });

    debug!("Initializing benchmark runner");
    let runner = BenchmarkRunner::with_cancellation(config, cancel).await?;

    if check_only {
        let statuses = runner.health().await;
        for status in &statuses {
            println!(
                "{}: {} ({:.1}ms){}",
                status.engine,
                if status.healthy { "healthy" } else { "unhealthy" },
                status.latency.as_secs_f64() * 1000.0,
                status
                    .detail
                    .as_deref()
                    .map(|d| format!(" {}", d))
                    .unwrap_or_default()
            );
        }
        if statuses.iter().any(|s| !s.healthy) {
            anyhow::bail!("one or more engines are unhealthy");
        }
        return Ok(());
    }

    info!("Starting benchmark run");
    let report = runner.run().await?;
    match &report.winner {
        Some(winner) => info!("Benchmark completed, winner: {}", winner),
        None => info!("Benchmark completed without a winner"),
    }
    Ok(())
}
