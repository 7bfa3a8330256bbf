use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use reconflow::cmd;
use reconflow::config::{Config, Overrides};

#[derive(Parser)]
#[command(name = "reconflow")]
#[command(version, about = "Phased recon pipeline with a live terminal dashboard")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline against a target domain
    Run {
        /// Target domain (e.g. example.com)
        #[arg(short, long)]
        target: String,

        /// Output directory for reports and tool artifacts
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Print status lines instead of the dashboard
        #[arg(long)]
        plain: bool,

        /// Keep going past failed steps (default)
        #[arg(long, overrides_with = "no_continue_on_error")]
        continue_on_error: bool,

        /// Abort the run on the first failed step
        #[arg(long)]
        no_continue_on_error: bool,

        /// Default per-step timeout in seconds
        #[arg(long)]
        step_timeout: Option<u64>,

        /// Custom plan file (defaults to <output>/plan.json when present)
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Show live tool output in plain mode and log at debug level
        #[arg(short, long)]
        verbose: bool,
    },
    /// Write the built-in plan to a file for editing
    Plan {
        /// Target domain, recorded for reference
        #[arg(short, long, default_value = "example.com")]
        target: String,

        /// Where to write the plan
        #[arg(short, long, default_value = "plan.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            target,
            output,
            plain,
            continue_on_error,
            no_continue_on_error,
            step_timeout,
            plan,
            verbose,
        } => {
            let continue_on_error = if no_continue_on_error {
                Some(false)
            } else if continue_on_error {
                Some(true)
            } else {
                None
            };
            let config = Config::resolve(
                &target,
                output,
                Overrides {
                    plain,
                    continue_on_error,
                    step_timeout_secs: step_timeout,
                    plan_file: plan,
                    verbose,
                },
            )?;
            let code = cmd::cmd_run(config).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Plan { target, output } => {
            cmd::cmd_plan(&target, &output)?;
        }
    }

    Ok(())
}
