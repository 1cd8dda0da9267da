mod config;
mod console;
mod run_cmd;
mod show_cmd;
mod validate_cmd;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use config::{CliOverrides, ConfigFile, HeronConfig};
use run_cmd::RunOptions;

#[derive(Parser)]
#[command(name = "heron", about = "Plan-driven orchestration of LLM subtasks", version)]
struct Cli {
    /// Config file path (defaults to ~/.config/heron/config.toml)
    #[arg(long, global = true, env = "HERON_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Validate a plan file without running it
    Validate {
        /// Path to the plan JSON
        plan: PathBuf,
    },
    /// Execute a plan and print the final answer
    Run {
        /// Path to the plan JSON
        plan: PathBuf,
        /// The goal the plan was made for
        #[arg(long)]
        goal: String,
        /// Where to persist plan state (defaults to <plan>.state.json)
        #[arg(long)]
        state: Option<PathBuf>,
        /// Retries per backend after the first failure
        #[arg(long)]
        retry_attempts: Option<u32>,
        /// Maximum concurrent subtasks within a group
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Run even when the plan raises warnings
        #[arg(long)]
        allow_warnings: bool,
        /// Do not echo streamed output
        #[arg(long, short)]
        quiet: bool,
    },
    /// Show the status table of a persisted plan
    Show {
        /// Path to the state JSON written by `heron run`
        state: PathBuf,
    },
    /// Print shell completions
    Completions {
        shell: Shell,
    },
}

/// Execute the `heron init` command: write config file.
fn cmd_init(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = ConfigFile::starter();
    config::save_config(path, &cfg)?;

    println!("Config written to {}", path.display());
    let agents: Vec<&str> = cfg.agents.iter().map(|a| a.key.as_str()).collect();
    println!("  agents: {}", agents.join(", "));
    println!("  backends: {}", cfg.backends.len());
    println!();
    println!("Next: edit [[backends]] to point at your model runners, then `heron run`.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::config_path);

    match cli.command {
        Commands::Init { force } => {
            cmd_init(&config_path, force)?;
        }
        Commands::Validate { plan } => {
            let resolved = HeronConfig::resolve(&config_path, &CliOverrides::default())?;
            if let Err(e) = validate_cmd::run_validate(&resolved, &plan) {
                eprintln!("{e:#}");
                std::process::exit(1);
            }
        }
        Commands::Run {
            plan,
            goal,
            state,
            retry_attempts,
            max_parallel,
            allow_warnings,
            quiet,
        } => {
            let overrides = CliOverrides {
                retry_attempts,
                max_parallel,
            };
            let resolved = HeronConfig::resolve(&config_path, &overrides)?;
            let options = RunOptions {
                plan,
                goal,
                state,
                allow_warnings,
                quiet,
            };
            match run_cmd::run_plan(&resolved, options).await {
                Ok(status) => {
                    let code = status.exit_code();
                    if code != 0 {
                        std::process::exit(code);
                    }
                }
                Err(e) => {
                    eprintln!("{e:#}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Show { state } => {
            show_cmd::run_show(&state).await?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "heron", &mut std::io::stdout());
        }
    }

    Ok(())
}
