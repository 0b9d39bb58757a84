//! CTCP run orchestrator CLI.
//!
//! Creates runs, reports their gate state, and advances them step by step.
//! All run state lives in a run directory outside the target repository; the
//! repository itself is only ever touched through the patch guard.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use ctcp::core::types::FindMode;
use ctcp::io::run_store::WebFindPolicy;
use ctcp::orchestrate::{self, DEFAULT_MAX_STEPS, NewRunOptions};
use ctcp::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "ctcp",
    version,
    about = "Artifact-driven orchestrator for a multi-role coding team"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new run directory for a repository and goal.
    NewRun {
        /// Target git repository.
        #[arg(long)]
        repo_root: PathBuf,
        /// What this run should achieve.
        #[arg(long)]
        goal: String,
        /// Run id (default: timestamped).
        #[arg(long)]
        run_id: Option<String>,
        /// Explicit run directory (default: under the runs root).
        #[arg(long)]
        run_dir: Option<PathBuf>,
        /// resolver_only or resolver_plus_web.
        #[arg(long, default_value = "resolver_only")]
        find_mode: String,
        /// Allowed domain for web research (repeatable).
        #[arg(long = "web-allow-domain")]
        web_allow_domains: Vec<String>,
        #[arg(long, default_value_t = 3)]
        web_max_queries: u32,
        #[arg(long, default_value_t = 5)]
        web_max_results: u32,
    },
    /// Print the run status and current gate.
    Status {
        /// Run directory (default: the repo's LAST_RUN pointer).
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
    /// Advance the run until it blocks or finishes.
    Advance {
        /// Run directory (default: the repo's LAST_RUN pointer).
        #[arg(long)]
        run_dir: Option<PathBuf>,
        /// Maximum gate evaluations in one invocation.
        #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
        max_steps: u32,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::NewRun {
            repo_root,
            goal,
            run_id,
            run_dir,
            find_mode,
            web_allow_domains,
            web_max_queries,
            web_max_results,
        } => {
            let Some(find_mode) = FindMode::parse(&find_mode) else {
                bail!("unknown find mode '{find_mode}' (resolver_only, resolver_plus_web)");
            };
            orchestrate::ensure_repo_root(&repo_root)?;
            let run_paths = orchestrate::new_run(&NewRunOptions {
                repo_root,
                goal,
                run_id,
                run_dir,
                find_mode,
                web_find_policy: WebFindPolicy {
                    allow_domains: web_allow_domains,
                    max_queries: web_max_queries,
                    max_results: web_max_results,
                },
            })?;
            println!("{}", run_paths.run_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Status { run_dir } => {
            orchestrate::status(&orchestrate::resolve_run_dir(run_dir)?)
        }
        Command::Advance { run_dir, max_steps } => {
            orchestrate::advance(&orchestrate::resolve_run_dir(run_dir)?, max_steps)
        }
    }
}
