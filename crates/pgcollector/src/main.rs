//! pgcollector - PostgreSQL statistics collector.
//!
//! Connects to one database, collects query statistics, schema, server
//! statistics and optionally OS metrics, and posts them to the collection
//! endpoint. Meant to run from cron.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

use pgcollector_core::collector::{QueryExecutor, ServerStat};
use pgcollector_core::config::{self, Config};
use pgcollector_core::db::PgConnection;
use pgcollector_core::pipeline;
use pgcollector_core::submit::{HttpTransport, SubmitError, Submitter, ThreadSleeper};
use pgcollector_core::system::SystemCollector;

/// PostgreSQL statistics collector.
#[derive(Parser)]
#[command(name = "pgcollector", about = "PostgreSQL statistics collector", version)]
struct Args {
    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors. Suitable for cron.
    #[arg(short, long, alias = "cron")]
    quiet: bool,

    /// Print the data that would be submitted instead of posting it.
    #[arg(short, long)]
    dry_run: bool,

    /// Config file to use. May be repeated; the first usable file wins.
    /// Defaults to ~/.pgcollector.toml, then /etc/pgcollector.toml.
    #[arg(long = "config", value_name = "PATH")]
    config: Vec<PathBuf>,

    /// Write a sample config file and exit.
    #[arg(long)]
    generate_config: bool,

    /// API key written into the generated config file.
    #[arg(long, requires = "generate_config")]
    api_key: Option<String>,

    /// Don't send example queries with literals or client addresses.
    #[arg(long)]
    no_query_parameters: bool,

    /// Don't collect OS metrics.
    #[arg(long)]
    no_system_information: bool,

    /// Skip table and index bloat estimation.
    #[arg(long)]
    no_bloat: bool,

    /// Skip view definitions.
    #[arg(long)]
    no_views: bool,

    /// Server statistics to skip, comma separated (e.g. "locks,functions").
    #[arg(long, value_delimiter = ',', value_name = "STATS")]
    skip_stats: Vec<ServerStat>,

    /// Compress the payload with zstd.
    #[arg(long)]
    compress: bool,

    /// Reset query statistics after a successful submission.
    #[arg(long)]
    reset: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgcollector", "pgcollector_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Folds command line switches into the loaded configuration.
fn apply_args(config: &mut Config, args: &Args) {
    let options = &mut config.options;
    if args.no_query_parameters {
        options.query_parameters = false;
    }
    if args.no_system_information {
        options.system_information = false;
    }
    if args.no_bloat {
        options.bloat = false;
    }
    if args.no_views {
        options.views = false;
    }
    for stat in &args.skip_stats {
        if !options.skip_stats.contains(stat) {
            options.skip_stats.push(*stat);
        }
    }
    options.compress |= args.compress;
    options.reset |= args.reset;
}

fn config_paths(args: &Args) -> Vec<PathBuf> {
    if args.config.is_empty() {
        config::default_config_paths()
    } else {
        args.config.clone()
    }
}

fn generate_config(args: &Args) -> anyhow::Result<()> {
    let paths = config_paths(args);
    let Some(path) = paths.first() else {
        bail!("no config file location available, pass --config");
    };
    config::generate_config(path, args.api_key.as_deref())?;
    info!(
        "Wrote standard configuration to {}, please edit it and then run again",
        path.display()
    );
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<()> {
    if args.generate_config {
        return generate_config(args);
    }

    let mut config = Config::load(&config_paths(args), |key| std::env::var(key).ok())?;
    apply_args(&mut config, args);
    debug!(connection = ?config.connection, options = ?config.options, "configuration loaded");

    let conn = PgConnection::connect(&config.connection)?;
    let mut exec = QueryExecutor::new(conn);
    let system = SystemCollector::real();

    let collection = pipeline::collect(&mut exec, &config, Some(&system))?;

    if args.dry_run {
        info!("Dumping data that would get posted");
        let pretty = collection
            .snapshot
            .to_pretty_json(config.options.compress)
            .context("failed to render snapshot")?;
        println!("{}", pretty);
        info!("Exiting.");
        return Ok(());
    }

    let submitter = Submitter::new(
        HttpTransport::new()?,
        ThreadSleeper,
        config.api_url.as_str(),
        config.options.retry,
    )
    .with_compression(config.options.compress);

    match submitter.submit(&collection.snapshot) {
        Ok(response) => {
            info!("Submitted successfully");
            debug!(attempts = response.attempts, body = %response.body, "server response");
            pipeline::reset_if_requested(&mut exec, &config, collection.source)?;
            Ok(())
        }
        Err(SubmitError::Rejected { body, .. }) => bail!("Rejected by server: {}", body),
        Err(e) => Err(e.into()),
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(&args) {
        for line in format!("{:#}", e).lines() {
            error!("{}", line);
        }
        std::process::exit(1);
    }
}
