use clap::{Parser, Subcommand, ValueEnum};
use ipx_core::{ExporterConfig, SourceConfig};
use ipx_save::{Dialect, Reconciler, SaveSource};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iptables-exporter")]
#[command(version, about = "Prometheus exporter for iptables counters", long_about = None)]
struct Cli {
    /// Exporter config file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve metrics over HTTP
    Serve {
        /// Address on which to expose metrics and web interface
        #[arg(long = "web.listen-address")]
        listen_address: Option<String>,
        /// Path under which to expose metrics
        #[arg(long = "web.telemetry-path")]
        telemetry_path: Option<String>,
        /// Comma-separated chains to export (default: all)
        #[arg(long = "chain.enable", value_delimiter = ',')]
        chains: Vec<String>,
    },
    /// Parse a ruleset and print it
    Show {
        /// Read a dump file instead of the configured live source
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// The file has no counters
        #[arg(long)]
        plain: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Summary)]
        format: OutputFormat,
    },
    /// Compare the live ruleset with the reference ruleset
    Diff {
        /// Counted dump to use as the live ruleset
        #[arg(long)]
        live: Option<PathBuf>,
        /// Plain rule file to compare against
        #[arg(long)]
        reference: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Summary,
    Json,
    Yaml,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ExporterConfig::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            listen_address,
            telemetry_path,
            chains,
        } => {
            let mut config = config;
            if let Some(addr) = listen_address {
                config.listen_address = addr;
            }
            if let Some(path) = telemetry_path {
                config.telemetry_path = path;
            }
            if !chains.is_empty() {
                config.enabled_chains = chains;
            }
            tokio::runtime::Runtime::new()?.block_on(async { serve(config).await })?;
        }
        Commands::Show { file, plain, format } => {
            tokio::runtime::Runtime::new()?
                .block_on(async { show(&config, file, plain, format).await })?;
        }
        Commands::Diff { live, reference } => {
            let matches = tokio::runtime::Runtime::new()?
                .block_on(async { diff(&config, live, reference).await })?;
            if !matches {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn serve(config: ExporterConfig) -> anyhow::Result<()> {
    use ipx_metrics::{MetricsCollector, MetricsServer, Scraper};

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        live = %SaveSource::from_config(&config.live, Dialect::Counters).name(),
        "Starting iptables-exporter"
    );

    let collector = MetricsCollector::new()?;
    let scraper = Scraper::new(collector, config.clone());
    let server = MetricsServer::new(scraper, &config)?;
    server.serve().await
}

async fn show(
    config: &ExporterConfig,
    file: Option<PathBuf>,
    plain: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let dialect = if plain {
        Dialect::Plain
    } else {
        Dialect::Counters
    };
    let source = match file {
        Some(path) => SaveSource::file(path, dialect),
        None => SaveSource::from_config(&config.live, dialect),
    };

    let ruleset = Reconciler::new(source).load().await?;

    match format {
        OutputFormat::Summary => ruleset.display(),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ruleset)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&ruleset)?),
    }

    Ok(())
}

async fn diff(
    config: &ExporterConfig,
    live: Option<PathBuf>,
    reference: Option<PathBuf>,
) -> anyhow::Result<bool> {
    let mut config = config.clone();
    if let Some(path) = live {
        config.live = SourceConfig::File { path };
    }
    if let Some(path) = reference {
        config.reference = Some(SourceConfig::File { path });
    }
    if config.reference.is_none() {
        anyhow::bail!("No reference ruleset configured. Pass --reference or set `reference` in the config file.");
    }

    let reconciliation = Reconciler::from_config(&config).reconcile().await?;
    let Some(drift) = reconciliation.drift else {
        anyhow::bail!("Reference ruleset could not be parsed");
    };

    if drift.matches {
        println!("✅ Live ruleset matches {}", drift.reference);
        return Ok(true);
    }

    println!("⚠️  Live ruleset differs from {}\n", drift.reference);
    if let Some(text) = &drift.diff {
        print!("{}", text);
    }
    Ok(false)
}
