pub mod cli;
pub mod core;
pub mod providers;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod updater;

#[cfg(test)]
mod test_support;

pub use crate::core::config;

use anyhow::Result;
use tracing::{debug, info};

use crate::service::{RateFilter, RateService};
use crate::store::HistoryFilter;
use crate::updater::Scope;

pub enum AppCommand {
    Update {
        scope: Scope,
    },
    Rates(RateFilter),
    Rate {
        from: String,
        to: String,
    },
    History {
        filter: HistoryFilter,
        limit: Option<usize>,
    },
    Status,
    /// `None` uses the configured refresh interval.
    Watch {
        interval_secs: Option<u64>,
    },
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("ratevault starting...");

    let config = match config_path {
        Some(path) => config::AppConfig::load_from_path(path)?,
        None => config::AppConfig::load()?,
    };
    debug!(
        base = %config.base_currency,
        fiat = ?config.fiat_currencies,
        crypto = ?config.crypto_currencies,
        ttl_secs = config.ttl_secs,
        "Loaded config"
    );

    let service = RateService::open(&config)?;

    match command {
        AppCommand::Update { scope } => cli::commands::update(&service, scope).await,
        AppCommand::Rates(filter) => cli::commands::rates(&service, &filter).await,
        AppCommand::Rate { from, to } => cli::commands::rate(&service, &from, &to).await,
        AppCommand::History { filter, limit } => cli::commands::history(&service, &filter, limit),
        AppCommand::Status => cli::commands::status(&service).await,
        AppCommand::Watch { interval_secs } => {
            let interval = interval_secs.unwrap_or(config.refresh_interval_secs);
            cli::commands::watch(&service, interval).await
        }
    }
}
