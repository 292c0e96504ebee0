//! CLI command definitions and handlers.

use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};

use crate::config::{ActionMode, BenchConfig, ReasoningMode, RunMode};
use crate::dataset;
use crate::eval::EvalEngine;
use crate::ledger::{ResultLedger, EXIT_CODE_MEANINGS};
use crate::orchestrator::{run_session, RunOptions};

/// Benchmark mobile GUI agents on Android devices and judge their traces.
#[derive(Debug, Parser)]
#[command(name = "droid-bench", version)]
pub struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute agents and/or evaluate their traces for one session.
    Run(RunArgs),
    /// Evaluate a single (task, agent) pair. This is the entry point the
    /// evaluator pool spawns as a subprocess.
    Evaluate(EvaluateArgs),
    /// Print the per-agent exit-code histogram for a session.
    Summary(SummaryArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Session config file.
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Comma-separated agent names; defaults to every configured agent.
    #[arg(long)]
    pub agents: Option<String>,

    /// Which half of the pipeline to run: full, exec or eval.
    #[arg(long, default_value = "full")]
    pub mode: String,

    /// Overrides the session id from the config.
    #[arg(long)]
    pub session_id: Option<String>,

    /// Restrict the run to one task.
    #[arg(long)]
    pub task_id: Option<String>,

    /// Evaluate inline and serially instead of in subprocess slots.
    #[arg(long)]
    pub no_concurrent: bool,

    /// Launch (and tear down) the configured emulator fleet.
    #[arg(long)]
    pub setup_emulator: bool,

    /// Skip the coarse OCR gate.
    #[arg(long)]
    pub skip_key_components: bool,

    /// result_only or direct.
    #[arg(long, default_value = "direct")]
    pub reasoning_mode: String,

    /// no_action, with_action or text_action.
    #[arg(long, default_value = "with_action")]
    pub action_mode: String,

    /// Re-evaluate cells that already hold a verdict.
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Session directory holding results.csv and the trace artifacts.
    #[arg(long)]
    pub session_dir: PathBuf,

    #[arg(long)]
    pub task_id: String,

    /// Agent whose trace is evaluated; empty for bare sessions.
    #[arg(long, default_value = "")]
    pub agent: String,

    #[arg(long, default_value = "direct")]
    pub reasoning_mode: String,

    #[arg(long, default_value = "with_action")]
    pub action_mode: String,

    #[arg(long)]
    pub skip_key_components: bool,
}

#[derive(Debug, Args)]
pub struct SummaryArgs {
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    #[arg(long)]
    pub session_id: Option<String>,

    /// Comma-separated agent names; defaults to every configured agent.
    #[arg(long)]
    pub agents: Option<String>,
}

/// Parses the process arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Evaluate(args) => evaluate_command(args).await,
        Commands::Summary(args) => summary_command(args).await,
    }
}

fn split_agents(raw: Option<String>) -> Vec<String> {
    raw.map(|agents| {
        agents
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = BenchConfig::load(&args.config)?;
    if let Some(session_id) = args.session_id {
        config.session_id = session_id;
    }

    let options = RunOptions {
        mode: args.mode.parse::<RunMode>().map_err(|e| anyhow!(e))?,
        agents: split_agents(args.agents),
        task_filter: args.task_id,
        reasoning_mode: args
            .reasoning_mode
            .parse::<ReasoningMode>()
            .map_err(|e| anyhow!(e))?,
        action_mode: args.action_mode.parse::<ActionMode>().map_err(|e| anyhow!(e))?,
        skip_key_components: args.skip_key_components,
        overwrite: args.overwrite,
        inline_eval: args.no_concurrent,
        setup_emulator: args.setup_emulator,
        config_path: args.config,
    };

    run_session(config, options).await?;
    Ok(())
}

async fn evaluate_command(args: EvaluateArgs) -> anyhow::Result<()> {
    let config = BenchConfig::load(&args.config)?;
    let reasoning_mode = args
        .reasoning_mode
        .parse::<ReasoningMode>()
        .map_err(|e| anyhow!(e))?;
    let action_mode = args.action_mode.parse::<ActionMode>().map_err(|e| anyhow!(e))?;

    let engine = EvalEngine::from_config(
        &config,
        args.session_dir.clone(),
        reasoning_mode,
        action_mode,
        args.skip_key_components,
    )?;

    let ledger = ResultLedger::open(&args.session_dir);
    let tasks = dataset::load_tasks(ledger.csv_path())?;
    let task = tasks
        .into_iter()
        .find(|t| t.task_identifier == args.task_id)
        .ok_or_else(|| anyhow!("task '{}' not in results table", args.task_id))?;

    engine.run(&task, &args.agent).await?;
    Ok(())
}

async fn summary_command(args: SummaryArgs) -> anyhow::Result<()> {
    let mut config = BenchConfig::load(&args.config)?;
    if let Some(session_id) = args.session_id {
        config.session_id = session_id;
    }

    let agents = {
        let requested = split_agents(args.agents);
        if requested.is_empty() {
            config.agents.iter().map(|a| a.name.clone()).collect()
        } else {
            requested
        }
    };

    let ledger = ResultLedger::open(config.session_dir());
    for summary in ledger.execution_summary(&agents)? {
        println!("For <{}>:", summary.agent);
        for (code, (count, meaning)) in summary
            .exit_code_counts
            .iter()
            .zip(EXIT_CODE_MEANINGS)
            .enumerate()
        {
            println!(
                "# of tasks finished with exit code <{} {}>: {}",
                code, meaning, count
            );
        }
        if !summary.unexpected_errors.is_empty() {
            println!(
                "There's unexpected error for the following task(s). Decide whether to re-run by resetting `{}_completion` in results.csv",
                summary.agent
            );
            for (task, error) in &summary.unexpected_errors {
                println!("Error message for <{}>: {}", task, error);
            }
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_agents() {
        assert_eq!(
            split_agents(Some("AppAgent, MobileAgent,".to_string())),
            vec!["AppAgent", "MobileAgent"]
        );
        assert!(split_agents(None).is_empty());
    }

    #[test]
    fn test_cli_parses_run_defaults() {
        let cli = Cli::try_parse_from(["droid-bench", "run", "--agents", "AppAgent"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.mode, "full");
                assert_eq!(args.reasoning_mode, "direct");
                assert_eq!(args.action_mode, "with_action");
                assert_eq!(args.agents.as_deref(), Some("AppAgent"));
                assert!(!args.overwrite);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_cli_parses_evaluate() {
        let cli = Cli::try_parse_from([
            "droid-bench",
            "evaluate",
            "--session-dir",
            "/tmp/session-1",
            "--task-id",
            "clock_0",
            "--agent",
            "AppAgent",
            "--reasoning-mode",
            "result_only",
            "--action-mode",
            "no_action",
        ])
        .unwrap();
        match cli.command {
            Commands::Evaluate(args) => {
                assert_eq!(args.task_id, "clock_0");
                assert_eq!(args.agent, "AppAgent");
                assert_eq!(args.reasoning_mode, "result_only");
            }
            _ => panic!("expected evaluate command"),
        }
    }
}
