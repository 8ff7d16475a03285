//! Status commands for showing pipeline state.

use chrono::Local;
use console::style;

use crate::cli::helpers::format_number;
use crate::config::Settings;
use crate::models::{ArtifactKind, Stage};
use crate::scrapers::{load_cursor_record, load_partitions};
use crate::work_queue::ItemTracker;

/// Show overall pipeline status.
pub async fn cmd_status(settings: &Settings) -> anyhow::Result<()> {
    let store = settings.checkpoint_store()?;
    let artifacts = settings.artifact_store();
    let tracker = ItemTracker::new(store.clone(), artifacts.clone());

    let separator = "─".repeat(70);
    println!();
    println!(
        "{:<50} Last updated: {}",
        style("readingroom status").bold(),
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    println!("{}", separator);
    println!("Data Dir:    {}", settings.data_dir.display());
    println!(
        "Checkpoints: {} ({})",
        settings.state_dir.display(),
        store.backend_name()
    );
    println!();

    println!("{}", style("ACQUISITION").cyan().bold());
    match load_cursor_record(&store)? {
        Some(cursor) => {
            let partitions = load_partitions(&store)?;
            let references: usize = partitions.values().map(|p| p.references.len()).sum();
            let unavailable: usize = partitions.values().map(|p| p.unavailable.len()).sum();
            let page = partitions
                .get(&cursor.partition)
                .map(|p| p.page_index)
                .unwrap_or(0);
            println!(
                "  {:<20} {} page {}{}",
                "Cursor:",
                cursor.partition,
                page,
                if cursor.done { " (complete)" } else { "" }
            );
            println!("  {:<20} {:>10}", "References:", format_number(references));
            println!("  {:<20} {:>10}", "Unavailable:", format_number(unavailable));
        }
        None => println!("  {}", style("not started").dim()),
    }
    println!();

    println!("{}", style("ARTIFACTS").cyan().bold());
    for kind in [
        ArtifactKind::Raw,
        ArtifactKind::Text,
        ArtifactKind::Record,
        ArtifactKind::Metadata,
    ] {
        println!(
            "  {:<20} {:>10}",
            format!("{}:", kind.as_str()),
            format_number(artifacts.list(kind)?.len())
        );
    }
    println!();

    println!(
        "{:<26} {:>10} {:>10} {:>10} {:>10}",
        style("STAGES").cyan().bold(),
        "Total",
        "Done",
        "Failed",
        "Pending"
    );
    for stage in [Stage::Ocr, Stage::Correction] {
        let summary = tracker.progress_summary(stage)?;
        println!(
            "  {:<24} {:>10} {:>10} {:>10} {:>10}",
            stage.as_str(),
            format_number(summary.total),
            format_number(summary.done),
            format_number(summary.failed),
            format_number(summary.pending)
        );
    }
    println!("{}", separator);

    Ok(())
}

/// List failed documents for a stage with their last error.
pub async fn cmd_failed(settings: &Settings, stage: Stage) -> anyhow::Result<()> {
    let tracker = ItemTracker::new(settings.checkpoint_store()?, settings.artifact_store());
    let failed = tracker.failed_records(stage)?;

    if failed.is_empty() {
        println!("{} No failed {} documents", style("✓").green(), stage);
        return Ok(());
    }

    println!(
        "{} {} failed {} documents (retry with `readingroom {} --mode retry`)",
        style("!").yellow(),
        format_number(failed.len()),
        stage,
        match stage {
            Stage::Ocr => "ocr",
            Stage::Correction => "correct",
        }
    );
    for record in failed {
        println!(
            "  {} {} {}",
            style(&record.document_id).bold(),
            style(format!("attempt {}", record.attempt_count)).dim(),
            record.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
