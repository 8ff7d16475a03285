//! OCR and correction stage commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use console::style;
use indicatif::ProgressBar;
use tokio::sync::mpsc;

use crate::cli::helpers::{bar_style, format_number, governor};
use crate::config::{Config, Settings};
use crate::llm::LlmClient;
use crate::models::{ProgressSummary, Stage};
use crate::ocr::TextExtractor;
use crate::services::{CorrectionStage, OcrStage};
use crate::work_queue::{
    ItemTracker, RunMode, StageEvent, StageProcessor, StageRunReport, StageRunner,
};

use super::StageArgs;

/// Run a stage in the requested mode.
pub async fn cmd_stage(settings: &Settings, config: &Config, stage: Stage, args: StageArgs) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let tracker = ItemTracker::new(settings.checkpoint_store()?, settings.artifact_store());

    if args.mode == RunMode::Progress {
        match args.doc {
            Some(ref id) => match tracker.record(stage, id)? {
                Some(record) => println!(
                    "{} {} {}: {} (attempt {}){}",
                    style("→").cyan(),
                    stage,
                    id,
                    record.status.as_str(),
                    record.attempt_count,
                    record
                        .last_error
                        .map(|e| format!(" - {}", e))
                        .unwrap_or_default()
                ),
                None => println!("{} {} {}: pending (no record)", style("→").cyan(), stage, id),
            },
            None => print_summary(stage, &tracker.progress_summary(stage)?),
        }
        return Ok(());
    }

    let processor = build_processor(settings, config, stage).await?;

    let (event_tx, event_rx) = mpsc::channel::<StageEvent>(100);
    let runner = StageRunner::new(tracker)
        .with_batch_size(config.runner.batch_size)
        .with_item_delay(Duration::from_millis(config.runner.item_delay_ms))
        .with_limit(args.limit)
        .with_events(event_tx);
    let event_handler = tokio::spawn(show_events(event_rx));

    let result = match args.doc {
        Some(ref id) => runner.run_one(processor.as_ref(), id, args.force).await,
        None => runner.run(processor.as_ref(), args.mode).await,
    };
    drop(runner);
    let _ = event_handler.await;

    let report = result?;
    print_report(stage, &report);
    Ok(())
}

async fn build_processor(
    settings: &Settings,
    config: &Config,
    stage: Stage,
) -> anyhow::Result<Box<dyn StageProcessor>> {
    let artifacts = settings.artifact_store();
    let governor = governor(config);

    match stage {
        Stage::Ocr => {
            let missing = TextExtractor::missing_tools();
            if !missing.is_empty() {
                bail!(
                    "missing OCR tools: {} (run `readingroom check` for details)",
                    missing.join(", ")
                );
            }
            let engine = Arc::new(config.ocr.extractor());
            Ok(Box::new(OcrStage::new(artifacts, engine, governor)))
        }
        Stage::Correction => {
            let client = LlmClient::new(
                config.llm.clone(),
                Duration::from_secs(config.retry.call_timeout_secs),
            )?;
            match client.has_model().await {
                Ok(true) => {}
                Ok(false) => bail!(
                    "model {} is not available at {}",
                    config.llm.model,
                    config.llm.endpoint
                ),
                Err(e) => {
                    eprintln!(
                        "{} Could not list models at {}: {}",
                        style("!").yellow(),
                        config.llm.endpoint,
                        e
                    );
                }
            }
            let corrector = Arc::new(client);
            Ok(Box::new(CorrectionStage::new(
                artifacts,
                corrector,
                governor,
                config.correction.clone(),
            )?))
        }
    }
}

async fn show_events(mut event_rx: mpsc::Receiver<StageEvent>) {
    let mut bar: Option<ProgressBar> = None;

    while let Some(event) = event_rx.recv().await {
        match event {
            StageEvent::StageStarted { stage, total_items } => {
                if total_items == 0 {
                    continue;
                }
                println!(
                    "{} {}: {} documents to process",
                    style("→").cyan(),
                    stage,
                    format_number(total_items)
                );
                let progress = ProgressBar::new(total_items as u64);
                progress.set_style(bar_style());
                bar = Some(progress);
            }
            StageEvent::ItemStarted { document_id, .. } => {
                if let Some(ref progress) = bar {
                    progress.set_message(document_id);
                }
            }
            StageEvent::ItemCompleted { .. } => {
                if let Some(ref progress) = bar {
                    progress.inc(1);
                }
            }
            StageEvent::ItemFailed {
                document_id, error, ..
            } => {
                let line = format!("  {} {} failed: {}", style("✗").red(), document_id, error);
                match bar {
                    Some(ref progress) => {
                        progress.suspend(|| eprintln!("{}", line));
                        progress.inc(1);
                    }
                    None => eprintln!("{}", line),
                }
            }
            StageEvent::Stopped { reason, .. } => {
                let line = format!("  {} Stopping: {}", style("!").yellow(), reason);
                match bar {
                    Some(ref progress) => progress.suspend(|| eprintln!("{}", line)),
                    None => eprintln!("{}", line),
                }
            }
            StageEvent::StageCompleted { .. } => {
                if let Some(progress) = bar.take() {
                    progress.finish_and_clear();
                }
            }
        }
    }
    if let Some(progress) = bar.take() {
        progress.finish_and_clear();
    }
}

fn print_summary(stage: Stage, summary: &ProgressSummary) {
    println!(
        "{} {}: {} total, {} done, {} failed, {} pending ({:.1}% done)",
        style("→").cyan(),
        stage,
        format_number(summary.total),
        style(format_number(summary.done)).green(),
        style(format_number(summary.failed)).red(),
        format_number(summary.pending),
        summary.percent_done()
    );
}

fn print_report(stage: Stage, report: &StageRunReport) {
    if report.backpropagated > 0 {
        println!(
            "{} Marked {} documents done from existing output",
            style("✓").green(),
            format_number(report.backpropagated)
        );
    }
    if report.requeued > 0 {
        println!(
            "{} Requeued {} failed documents",
            style("→").dim(),
            format_number(report.requeued)
        );
    }
    if report.processed == 0 && report.throttled.is_none() {
        println!("{} No {} work pending", style("!").yellow(), stage);
    } else {
        let mut msg = format!(
            "{} Processed {} documents: {} succeeded",
            style("✓").green(),
            format_number(report.processed),
            format_number(report.succeeded)
        );
        if report.failed > 0 {
            msg.push_str(&format!(", {} failed", format_number(report.failed)));
        }
        println!("{}", msg);
    }
    if let Some(ref reason) = report.throttled {
        println!(
            "{} Stopped early because of rate limiting ({}); pending documents keep their place",
            style("!").yellow(),
            reason
        );
    }
    print_summary(stage, &report.summary);
}
