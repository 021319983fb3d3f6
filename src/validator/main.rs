//! Standalone checker for launch configuration files.
//!
//! Loads a launch configuration the same way the launcher does and reports
//! every problem found, without starting anything.

use std::process::ExitCode;

use clap::Parser;

use bot_launcher::config::{DEFAULT_CONFIG_PATH, LaunchConfig, ProcessSpec};

/// Launch configuration checker.
#[derive(Parser, Debug)]
#[command(name = "check_launch_config")]
#[command(about = "Validates launch configuration files for the bot launcher")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file to validate.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    file: String,

    /// Generate an example configuration file at the specified path.
    #[arg(long)]
    generate_example: Option<String>,

    /// Show the resolved configuration.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(output_path) = args.generate_example {
        return generate_example(&output_path);
    }

    validate_config(&args.file, args.verbose)
}

fn generate_example(output_path: &str) -> ExitCode {
    match LaunchConfig::example().save_to_file(output_path) {
        Ok(()) => {
            println!("✓ Example configuration written to: {output_path}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Failed to write example file: {e}");
            ExitCode::FAILURE
        }
    }
}

fn validate_config(path: &str, verbose: bool) -> ExitCode {
    println!("Validating: {path}\n");

    let config = match LaunchConfig::load_from_file(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("✗ Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if verbose {
        describe("Background", &config.background);
        describe("Foreground", &config.foreground);
        println!("Startup delay:     {}s", config.startup_delay_secs);
        println!("Termination grace: {}s", config.termination_grace_secs);
        println!("State file:        {}", config.state_path.display());
        if config.bootstrap.enabled {
            println!(
                "Bootstrap:         {} -m venv {} (requirements: {}{})",
                config.bootstrap.python,
                config.bootstrap.venv_dir.display(),
                config.bootstrap.requirements.display(),
                if config.bootstrap.strict { ", strict" } else { "" }
            );
        } else {
            println!("Bootstrap:         disabled");
        }
        println!();
    }

    let problems = config.validate_all();
    if problems.is_empty() {
        println!("✓ Configuration is valid!");
        return ExitCode::SUCCESS;
    }

    for problem in &problems {
        println!("  ✗ {problem}");
    }
    println!("\n✗ Validation failed: {} problem(s)", problems.len());
    ExitCode::FAILURE
}

fn describe(label: &str, spec: &ProcessSpec) {
    println!("{label}: [{}] {}", spec.name, spec.command_line());
    if let Some(ref dir) = spec.working_dir {
        println!("  working dir: {}", dir.display());
    }
    for (key, value) in &spec.env {
        println!("  {key}={value}");
    }
}
