//! Bot Launcher - Main Entry Point
//!
//! Starts the Telegram bot in the background, waits for it to come up, runs
//! the main script, and stops the bot when the script is done.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use bot_launcher::config::{DEFAULT_CONFIG_PATH, LaunchConfig, LauncherSettings};
use bot_launcher::launcher::Launcher;

/// Launch a background bot alongside a foreground script.
#[derive(Parser, Debug)]
#[command(name = "bot_launcher")]
#[command(about = "Run the bot in the background while the main script runs")]
#[command(version)]
struct Args {
    /// Path to the launch JSON configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seconds to wait between starting the bot and the main script.
    #[arg(short, long)]
    delay: Option<u64>,

    /// Do not create the virtual environment or install dependencies.
    #[arg(long)]
    skip_bootstrap: bool,

    /// Generate an example configuration file and exit.
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level);

    // Handle example config generation
    if args.generate_config {
        generate_example_config()?;
        return Ok(ExitCode::SUCCESS);
    }

    // Load environment variables; children inherit them
    if let Err(e) = dotenvy::from_filename(&args.env_file) {
        debug!("Could not load .env file ({}): {}", args.env_file, e);
    }

    // Load configuration: file, then environment, then flags
    let mut config = LaunchConfig::load_or_default(&args.config)
        .context("Failed to load launch configuration")?;
    config.apply_settings(&LauncherSettings::from_env_with_defaults());

    if let Some(delay) = args.delay {
        config.startup_delay_secs = delay;
    }
    if args.skip_bootstrap {
        config.bootstrap.enabled = false;
    }

    config
        .validate()
        .context("Launch configuration validation failed")?;

    info!(
        "Launching '{}' ({}) then '{}' ({}) after {}s",
        config.background.name,
        config.background.command_line(),
        config.foreground.name,
        config.foreground.command_line(),
        config.startup_delay_secs
    );

    let report = Launcher::new(config)
        .run()
        .await
        .context("Launch failed")?;

    let code = report.exit_code();
    info!("Done (exit code {})", code);
    Ok(ExitCode::from(code))
}

/// Initializes the logging subsystem.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Generates an example configuration file.
fn generate_example_config() -> Result<()> {
    let example = LaunchConfig::example();
    example.save_to_file("launcher.example.json")?;

    println!("✓ Example configuration written to: launcher.example.json");
    println!("\nTo use the launcher:");
    println!("1. Copy launcher.example.json to {DEFAULT_CONFIG_PATH}");
    println!("2. Point 'background' and 'foreground' at your bot and script");
    println!("3. Put the bot's secrets (e.g. LOG_BOT_TOKEN) in a .env file");
    println!("4. Run: bot_launcher");

    Ok(())
}
