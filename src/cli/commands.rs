use anyhow::Result;
use chrono::Utc;
use comfy_table::Cell;
use std::collections::HashMap;

use super::ui;
use crate::core::{CurrencyPair, LookupError};
use crate::scheduler::TriggerOutcome;
use crate::service::{Derivation, RateFilter, RateService};
use crate::store::{CacheEntry, HistoryFilter};
use crate::updater::{CycleResult, Scope};

pub async fn update(service: &RateService, scope: Scope) -> Result<()> {
    let pb = ui::new_spinner(&format!("Refreshing {scope} rates"));
    let outcome = service.refresh_now(scope).await;
    pb.finish_and_clear();

    match outcome {
        TriggerOutcome::Completed(result) => {
            print_cycle(&result);
            if result.accepted.is_empty() && !result.is_success() {
                anyhow::bail!("Refresh failed: no rates were accepted");
            }
        }
        TriggerOutcome::AlreadyRunning => {
            println!(
                "{}",
                ui::style_text("A refresh is already running", ui::StyleType::Warning)
            );
        }
    }
    Ok(())
}

pub fn print_cycle(result: &CycleResult) {
    let elapsed = (result.finished_at - result.started_at).num_milliseconds();
    let headline = format!(
        "Refresh ({}) accepted {} and failed {} pairs in {}ms",
        result.scope,
        result.accepted.len(),
        result.failed.len(),
        elapsed
    );
    let style = if result.is_success() {
        ui::StyleType::Good
    } else if result.is_partial() {
        ui::StyleType::Warning
    } else {
        ui::StyleType::Error
    };
    println!("{}", ui::style_text(&headline, style));

    if !result.accepted.is_empty() {
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Pair"),
            ui::header_cell("Rate"),
            ui::header_cell("Source"),
        ]);
        for record in &result.accepted {
            table.add_row(vec![
                Cell::new(record.pair()),
                ui::rate_cell(record.rate()),
                ui::source_cell(record.source()),
            ]);
        }
        println!("{table}");
    }

    if !result.failed.is_empty() {
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Pair"),
            ui::header_cell("Kind"),
            ui::header_cell("Error"),
        ]);
        for failure in &result.failed {
            table.add_row(vec![
                Cell::new(&failure.pair),
                Cell::new(format!("{:?}", failure.kind())),
                Cell::new(&failure.error),
            ]);
        }
        println!("{table}");
    }

    for storage in &result.storage_errors {
        println!(
            "{}",
            ui::style_text(
                &format!("Failed to write {}: {}", storage.store, storage.message),
                ui::StyleType::Error
            )
        );
    }
    if let Some(fault) = &result.fault {
        println!("{}", ui::style_text(fault, ui::StyleType::Error));
    }
}

pub async fn rates(service: &RateService, filter: &RateFilter) -> Result<()> {
    let entries = service.list_rates(filter).await;
    if entries.is_empty() {
        println!("No cached rates. Run `ratevault update` first.");
        return Ok(());
    }
    println!("{}", rates_table(&entries));
    Ok(())
}

fn rates_table(entries: &[CacheEntry]) -> comfy_table::Table {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Pair"),
        ui::header_cell("Rate"),
        ui::header_cell("Source"),
        ui::header_cell("Fetched"),
        ui::header_cell("Status"),
    ]);
    for entry in entries {
        table.add_row(vec![
            Cell::new(entry.record.pair()),
            ui::rate_cell(entry.record.rate()),
            ui::source_cell(entry.record.source()),
            ui::timestamp_cell(entry.record.fetched_at()),
            ui::freshness_cell(entry.stale),
        ]);
    }
    table
}

pub async fn rate(service: &RateService, from: &str, to: &str) -> Result<()> {
    let quote = match service.current_rate(from, to).await {
        Ok(quote) => quote,
        Err(LookupError::NotFound(pair)) => {
            anyhow::bail!("No rate known for {pair}. Run `ratevault update` first.")
        }
        Err(e) => return Err(e.into()),
    };

    let how = match &quote.derivation {
        Derivation::Direct => String::new(),
        Derivation::Inverse => " (inverse)".to_string(),
        Derivation::Cross { via } => format!(" (via {via})"),
    };
    println!(
        "{} = {}{}",
        ui::style_text(&quote.pair.to_string(), ui::StyleType::Label),
        ui::style_text(&ui::format_rate(quote.rate), ui::StyleType::Good),
        ui::style_text(&how, ui::StyleType::Subtle)
    );
    let age = quote.age_at(Utc::now()).num_seconds();
    let freshness = if quote.stale {
        ui::style_text(
            &format!("stale, fetched {age}s ago (ttl {}s)", service.ttl().num_seconds()),
            ui::StyleType::Warning,
        )
    } else {
        ui::style_text(&format!("fetched {age}s ago"), ui::StyleType::Subtle)
    };
    println!("{freshness}");
    for leg in quote.legs.iter().filter(|leg| leg.source().is_degraded()) {
        println!(
            "{}",
            ui::style_text(
                &format!("{} comes from offline fallback data", leg.pair()),
                ui::StyleType::Warning
            )
        );
    }
    Ok(())
}

pub fn history(service: &RateService, filter: &HistoryFilter, limit: Option<usize>) -> Result<()> {
    let records: Vec<_> = match limit {
        Some(limit) => service.recent_history(filter, limit),
        None => service.historical_rates(filter).collect(),
    };
    if records.is_empty() {
        println!("No history recorded yet.");
        return Ok(());
    }

    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Fetched"),
        ui::header_cell("Pair"),
        ui::header_cell("Rate"),
        ui::header_cell("Change"),
        ui::header_cell("Source"),
    ]);
    let mut previous: HashMap<CurrencyPair, f64> = HashMap::new();
    for record in &records {
        let change = previous
            .insert(record.pair().clone(), record.rate())
            .map(|prev| (record.rate() - prev) / prev * 100.0);
        table.add_row(vec![
            ui::timestamp_cell(record.fetched_at()),
            Cell::new(record.pair()),
            ui::rate_cell(record.rate()),
            change.map_or_else(|| ui::format_optional_cell(None::<f64>, |_| String::new()), ui::change_cell),
            ui::source_cell(record.source()),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn status(service: &RateService) -> Result<()> {
    let status = service.status().await?;
    let scheduler = &status.scheduler;

    println!("{}", ui::style_text("Rate cache", ui::StyleType::Title));
    let mut table = ui::new_styled_table();
    table.add_row(vec![Cell::new("Pairs cached"), Cell::new(status.cache_total)]);
    table.add_row(vec![Cell::new("Fresh"), Cell::new(status.cache_fresh)]);
    table.add_row(vec![Cell::new("Stale"), Cell::new(status.cache_stale)]);
    table.add_row(vec![Cell::new("TTL (s)"), Cell::new(status.ttl_secs)]);
    table.add_row(vec![
        Cell::new("Last refresh"),
        status
            .last_refresh
            .map_or_else(|| Cell::new("never"), ui::timestamp_cell),
    ]);
    table.add_row(vec![Cell::new("History records"), Cell::new(status.history_len)]);
    println!("{table}");

    println!("\n{}", ui::style_text("Scheduler", ui::StyleType::Title));
    let mut table = ui::new_styled_table();
    table.add_row(vec![
        Cell::new("Running"),
        Cell::new(if scheduler.running { "yes" } else { "no" }),
    ]);
    table.add_row(vec![
        Cell::new("Interval (s)"),
        ui::format_optional_cell(scheduler.interval_secs, |s| s.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Next run"),
        scheduler
            .next_run_at
            .map_or_else(|| Cell::new("-"), ui::timestamp_cell),
    ]);
    table.add_row(vec![
        Cell::new("Cycles completed"),
        Cell::new(scheduler.cycles_completed),
    ]);
    table.add_row(vec![
        Cell::new("Last cycle"),
        Cell::new(
            scheduler
                .last_cycle
                .as_ref()
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
        ),
    ]);
    println!("{table}");
    Ok(())
}

/// Runs the scheduler until Ctrl-C, printing each finished cycle.
pub async fn watch(service: &RateService, interval_secs: u64) -> Result<()> {
    service.start_auto_refresh(interval_secs).await?;
    println!(
        "Refreshing every {interval_secs}s. {}",
        ui::style_text("Press Ctrl-C to stop.", ui::StyleType::Subtle)
    );

    let mut reported = 0;
    let mut poll = tokio::time::interval(std::time::Duration::from_millis(500));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            _ = poll.tick() => {
                let status = service.status().await?;
                let scheduler = status.scheduler;
                if scheduler.cycles_completed > reported {
                    reported = scheduler.cycles_completed;
                    if let Some(last) = scheduler.last_cycle {
                        ui::print_separator();
                        println!("{} {last}", ui::style_text(&format!("#{reported}"), ui::StyleType::Label));
                        if let Some(next) = scheduler.next_run_at {
                            println!("{}", ui::style_text(&format!("next run at {next}"), ui::StyleType::Subtle));
                        }
                    }
                }
            }
        }
    }

    service.stop_auto_refresh().await;
    service.wait_idle().await;
    println!("Stopped.");
    Ok(())
}
