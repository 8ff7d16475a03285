//! Initialize command.

use console::style;

use crate::config::{Config, Settings};

const CONFIG_FILENAME: &str = "readingroom.toml";

/// Create the data directory layout and a starter config.
pub async fn cmd_init(settings: &Settings, config: &Config) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let store = settings.checkpoint_store()?;

    println!(
        "{} Initialized readingroom in {}",
        style("✓").green(),
        settings.data_dir.display()
    );
    println!(
        "  {:<14} {} ({})",
        "Checkpoints:",
        settings.state_dir.display(),
        store.backend_name()
    );

    match config.source_path {
        Some(ref path) => println!("  {:<14} {}", "Config:", path.display()),
        None => {
            let path = settings.data_dir.join(CONFIG_FILENAME);
            if path.exists() {
                println!("  {:<14} {}", "Config:", path.display());
            } else {
                std::fs::write(&path, toml::to_string_pretty(config)?)?;
                println!(
                    "  {} Wrote default config to {}",
                    style("✓").green(),
                    path.display()
                );
            }
        }
    }

    Ok(())
}
