use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use ratevault::core::ProviderKind;
use ratevault::core::log::init_logging;
use ratevault::service::RateFilter;
use ratevault::store::HistoryFilter;
use ratevault::updater::Scope;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Fetch fresh rates now
    Update {
        /// Which pairs to refresh: all, crypto or fiat
        #[arg(long, default_value = "all")]
        scope: Scope,
    },
    /// List cached rates
    Rates {
        /// Only pairs involving this currency
        #[arg(long)]
        currency: Option<String>,
        /// Only crypto or fiat pairs
        #[arg(long)]
        kind: Option<ProviderKind>,
        /// Show the N highest rates
        #[arg(long)]
        top: Option<usize>,
    },
    /// Show the current rate for a pair
    Rate {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Show recorded rate history
    History {
        #[arg(long, requires = "to")]
        from: Option<String>,
        #[arg(long, requires = "from")]
        to: Option<String>,
        /// RFC 3339 timestamp, inclusive
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 timestamp, inclusive
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        /// Show only the most recent N records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show cache and scheduler status
    Status,
    /// Refresh on an interval until Ctrl-C
    Watch {
        /// Seconds between refreshes; defaults to the configured interval
        #[arg(long)]
        interval: Option<u64>,
    },
}

impl TryFrom<Commands> for ratevault::AppCommand {
    type Error = anyhow::Error;

    fn try_from(cmd: Commands) -> Result<ratevault::AppCommand> {
        Ok(match cmd {
            Commands::Update { scope } => ratevault::AppCommand::Update { scope },
            Commands::Rates {
                currency,
                kind,
                top,
            } => ratevault::AppCommand::Rates(RateFilter {
                currency,
                kind,
                top,
            }),
            Commands::Rate { from, to } => ratevault::AppCommand::Rate { from, to },
            Commands::History {
                from,
                to,
                since,
                until,
                limit,
            } => {
                let pair = match (from, to) {
                    (Some(from), Some(to)) => Some(ratevault::core::CurrencyPair::new(&from, &to)?),
                    _ => None,
                };
                ratevault::AppCommand::History {
                    filter: HistoryFilter { pair, since, until },
                    limit,
                }
            }
            Commands::Status => ratevault::AppCommand::Status,
            Commands::Watch { interval } => ratevault::AppCommand::Watch {
                interval_secs: interval,
            },
            Commands::Setup => anyhow::bail!("Setup command should be handled separately"),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => match cli.config_path.as_deref() {
            Some(path) => ratevault::cli::setup::setup_at_path(path),
            None => ratevault::cli::setup::setup(),
        },
        Some(cmd) => match ratevault::AppCommand::try_from(cmd) {
            Ok(command) => ratevault::run_command(command, cli.config_path.as_deref()).await,
            Err(e) => Err(e),
        },
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
