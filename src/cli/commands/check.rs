//! Collaborator availability check.

use std::time::Duration;

use console::style;
use indicatif::ProgressBar;

use crate::cli::helpers::spinner_style;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::ocr::TextExtractor;

/// Pulls can take a long time on a slow link.
const PULL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Check OCR tools and the correction model, pulling it when asked.
pub async fn cmd_check(config: &Config, pull: bool) -> anyhow::Result<()> {
    println!("\n{}", style("OCR Tool Status").bold());
    println!("{}", "-".repeat(50));

    let mut all_found = true;
    for (tool, available) in TextExtractor::check_tools() {
        let status = if available {
            style("✓ found").green()
        } else {
            all_found = false;
            style("✗ not found").red()
        };
        println!("  {:<15} {}", tool, status);
    }
    if !all_found {
        println!(
            "  {}",
            style("Install poppler-utils and tesseract-ocr to run the OCR stage").dim()
        );
    }

    println!("\n{}", style("Correction Model").bold());
    println!("{}", "-".repeat(50));
    println!("  {:<15} {:?}", "Provider:", config.llm.provider);
    println!("  {:<15} {}", "Endpoint:", config.llm.endpoint);
    println!("  {:<15} {}", "Model:", config.llm.model);

    let client = LlmClient::new(config.llm.clone(), Duration::from_secs(10))?;
    match client.list_models().await {
        Ok(models) => {
            let installed = client.has_model().await.unwrap_or(false);
            let status = if installed {
                style("✓ installed").green()
            } else {
                style("✗ not installed").red()
            };
            println!("  {:<15} {}", "Status:", status);
            if !models.is_empty() {
                println!("\n  {}", style("Available models:").cyan());
                for model in models {
                    println!("    {}", model);
                }
            }
            if !installed && pull {
                pull_model(config).await?;
            } else if !installed {
                println!(
                    "\n  {}",
                    style(format!("Pull it with: readingroom check --pull (or ollama pull {})", config.llm.model)).dim()
                );
            }
        }
        Err(e) => {
            println!("  {:<15} {} ({})", "Status:", style("✗ unreachable").red(), e);
        }
    }

    Ok(())
}

async fn pull_model(config: &Config) -> anyhow::Result<()> {
    let client = LlmClient::new(config.llm.clone(), PULL_TIMEOUT)?;
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(spinner_style());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(format!("pulling {}", config.llm.model));
    let result = client.pull_model().await;
    spinner.finish_and_clear();

    match result {
        Ok(()) => {
            println!("  {} Installed {}", style("✓").green(), config.llm.model);
            Ok(())
        }
        Err(e) => {
            println!("  {} Could not pull {}: {}", style("✗").red(), config.llm.model, e);
            Err(e.into())
        }
    }
}
