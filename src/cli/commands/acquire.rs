//! Acquisition commands.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::ProgressBar;
use tokio::sync::mpsc;

use crate::cli::helpers::{format_number, governor, spinner_style};
use crate::config::{Config, Settings};
use crate::rate_limit::RequestPacer;
use crate::scrapers::{
    load_cursor_record, load_partitions, AcquisitionCursor, ArchiveClient, CursorError, CursorEvent,
    CursorPhase, CursorStart, PageLocator,
};
use crate::services::DownloadSink;

use super::AcquireArgs;

/// Walk the search results from the saved cursor (or the given start).
pub async fn cmd_acquire(settings: &Settings, config: &Config, args: AcquireArgs) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let store = settings.checkpoint_store()?;
    let artifacts = settings.artifact_store();

    let mut cursor_config = config.acquisition.cursor_config();
    if let Some(last) = args.last_partition {
        cursor_config.last_partition = Some(last);
    }
    if let Some(policy) = args.on_partition_error {
        cursor_config.on_partition_error = policy;
    }
    let start = match (args.partition, args.url) {
        (Some(partition), _) => CursorStart::Partition(partition),
        (None, Some(url)) => CursorStart::Locator(PageLocator::from_url(&url)?),
        (None, None) => CursorStart::Resume,
    };
    let max_pages = args.max_pages.or(config.acquisition.max_pages);

    let pacer = RequestPacer::new(config.acquisition.pacer_config(settings));
    let client = Arc::new(ArchiveClient::new(
        config.acquisition.client_config(settings),
        pacer,
    )?);
    let governor = governor(config);
    let sink = Arc::new(DownloadSink::new(artifacts, client.clone(), governor.clone()));

    if args.retry_failed {
        let mut cursor = AcquisitionCursor::open(store, client, sink, governor, cursor_config, start)?;
        return retry_failed(&mut cursor, args.doc.as_deref()).await;
    }

    let (event_tx, mut event_rx) = mpsc::channel::<CursorEvent>(100);
    let mut cursor = AcquisitionCursor::open(store, client, sink, governor, cursor_config, start)?
        .with_events(event_tx);

    println!(
        "{} Acquiring from partition {} page {}",
        style("→").cyan(),
        cursor.state().partition_key,
        cursor.state().page_index
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(spinner_style());
    spinner.enable_steady_tick(Duration::from_millis(120));
    let ui = spinner.clone();
    let event_handler = tokio::spawn(async move {
        let mut references = 0usize;
        while let Some(event) = event_rx.recv().await {
            match event {
                CursorEvent::PageCommitted {
                    partition,
                    page,
                    new_references,
                } => {
                    references += new_references;
                    ui.set_message(format!(
                        "{} page {} ({} new references this run)",
                        partition,
                        page,
                        format_number(references)
                    ));
                }
                CursorEvent::PageSkipped { partition, page } => {
                    ui.suspend(|| {
                        eprintln!(
                            "  {} {} page {} unavailable, skipped",
                            style("!").yellow(),
                            partition,
                            page
                        );
                    });
                }
                CursorEvent::PartitionExhausted {
                    partition,
                    pages,
                    skipped,
                } => {
                    ui.suspend(|| {
                        if skipped {
                            println!(
                                "  {} Partition {} skipped after errors at page {}",
                                style("!").yellow(),
                                partition,
                                pages
                            );
                        } else {
                            println!(
                                "  {} Partition {} exhausted after {} pages",
                                style("✓").green(),
                                partition,
                                pages
                            );
                        }
                    });
                }
                CursorEvent::PartitionAdvanced { from, to } => {
                    ui.set_message(format!("advancing {} → {}", from, to));
                }
            }
        }
    });

    let result = cursor.run(max_pages).await;
    drop(cursor);
    let _ = event_handler.await;
    spinner.finish_and_clear();

    let summary = match result {
        Ok(summary) => summary,
        Err(CursorError::Throttled { locator, reason }) => {
            println!(
                "{} Rate limited at {} ({}). Progress is saved; run again later.",
                style("!").yellow(),
                locator,
                reason
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{} Fetched {} pages, {} new references",
        style("✓").green(),
        summary.pages_fetched,
        format_number(summary.new_references)
    );
    println!("  {:<20} {}", "Stored:", format_number(summary.stored));
    println!("  {:<20} {}", "Already present:", format_number(summary.already_present));
    if summary.unavailable > 0 {
        println!("  {:<20} {}", "Unavailable:", format_number(summary.unavailable));
    }
    if summary.failed > 0 {
        println!("  {:<20} {}", "Failed:", style(format_number(summary.failed)).red());
    }

    let position = format!("{} page {}", summary.partition, summary.page_index);
    match summary.final_phase {
        CursorPhase::Done => println!("{} Final partition complete ({})", style("✓").green(), position),
        CursorPhase::Idle => println!(
            "{} Caught up with the archive at {}; run again when new documents appear",
            style("→").dim(),
            position
        ),
        _ => println!("{} Stopped at {}", style("→").dim(), position),
    }
    Ok(())
}

async fn retry_failed(cursor: &mut AcquisitionCursor, only: Option<&str>) -> anyhow::Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(spinner_style());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(match only {
        Some(id) => format!("retrying {}", id),
        None => "retrying failed documents".to_string(),
    });
    let result = cursor.retry_failed(only).await;
    spinner.finish_and_clear();

    let summary = match result {
        Ok(summary) => summary,
        Err(CursorError::Throttled { locator, reason }) => {
            println!(
                "{} Rate limited at {} ({}). Progress is saved; run again later.",
                style("!").yellow(),
                locator,
                reason
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if summary.attempted == 0 {
        println!("{} No failed documents to retry", style("!").yellow());
        return Ok(());
    }
    println!(
        "{} Retried {} failed documents",
        style("✓").green(),
        format_number(summary.attempted)
    );
    println!("  {:<20} {}", "Stored:", format_number(summary.stored));
    if summary.unavailable > 0 {
        println!("  {:<20} {}", "Unavailable:", format_number(summary.unavailable));
    }
    if summary.still_failed > 0 {
        println!(
            "  {:<20} {}",
            "Still failing:",
            style(format_number(summary.still_failed)).red()
        );
    }
    Ok(())
}

/// Show saved acquisition progress.
pub async fn cmd_acquire_status(settings: &Settings) -> anyhow::Result<()> {
    let store = settings.checkpoint_store()?;
    let partitions = load_partitions(&store)?;

    println!("\n{}", style("Acquisition Status").bold());
    println!("{}", "-".repeat(60));

    match load_cursor_record(&store)? {
        Some(cursor) => {
            let state = if cursor.done {
                style("Complete").green().to_string()
            } else {
                style("In progress").yellow().to_string()
            };
            println!("{:<20} {}", "Cursor:", cursor.partition);
            println!("{:<20} {}", "Status:", state);
        }
        None => {
            println!("{} Acquisition has not started", style("!").yellow());
            return Ok(());
        }
    }
    println!();

    println!(
        "{:<10} {:>8} {:>12} {:>12} {:>8}  {}",
        style("PARTITION").cyan().bold(),
        "Pages",
        "References",
        "Unavailable",
        "Failed",
        "State"
    );
    let mut unavailable = Vec::new();
    let mut failed = Vec::new();
    for (partition, progress) in &partitions {
        let state = if progress.skipped {
            style("skipped").red().to_string()
        } else if progress.exhausted {
            style("exhausted").green().to_string()
        } else {
            style("open").yellow().to_string()
        };
        println!(
            "{:<10} {:>8} {:>12} {:>12} {:>8}  {}",
            partition,
            progress.page_index,
            format_number(progress.references.len()),
            format_number(progress.unavailable.len()),
            format_number(progress.failed.len()),
            state
        );
        unavailable.extend(progress.unavailable.iter().map(|id| (*partition, id.clone())));
        failed.extend(progress.failed.iter().map(|(id, f)| (*partition, id.clone(), f.clone())));
    }

    if !unavailable.is_empty() {
        println!();
        println!("{}", style("UNAVAILABLE DOCUMENTS").cyan().bold());
        for (partition, id) in unavailable {
            println!("  {} {}", style(partition).dim(), id);
        }
    }

    if !failed.is_empty() {
        println!();
        println!("{}", style("FAILED DOCUMENTS").cyan().bold());
        for (partition, id, entry) in failed {
            println!(
                "  {} {} {} ({} attempts, last {})",
                style(partition).dim(),
                id,
                style(&entry.reason).red(),
                entry.attempts,
                entry.failed_at.format("%Y-%m-%d %H:%M")
            );
        }
        println!(
            "\n  Retry with: readingroom acquire --retry-failed [--doc ID]"
        );
    }
    Ok(())
}
