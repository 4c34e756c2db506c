//! Havoc CLI entrypoint.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use havoc::{
    Config, EngineClock, HavocDuration, HavocError, HostRemote, RemediationStrategy,
    RemoteBackend, RemoteExecutor, RunMode, RunOptions, RunStatus, RunSummary, ScenarioDefinition,
    ScenarioPath, ScriptedRemote,
};

#[derive(Debug, Parser)]
#[command(name = "havoc")]
#[command(about = "chaos scenario orchestration against a cluster + relational-store target")]
struct Cli {
    /// Path to config file. Missing configs are treated as defaults.
    #[arg(long, global = true, default_value = "havoc.toml")]
    config: PathBuf,

    /// Working directory for execution.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    /// Machine-readable output to stdout (JSON).
    #[arg(long, global = true)]
    json: bool,

    /// Disable color output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialize a havoc project (config + example scenario)
    Init {
        #[arg(long)]
        force: bool,
    },

    /// Deploy the scenario's fault condition and monitor for its signature
    Run {
        scenario: PathBuf,

        /// Explicit target id (trusted verbatim; disables discovery).
        #[arg(long)]
        target: Option<String>,

        /// Label selector; first match in listing order wins.
        #[arg(long, conflicts_with = "target")]
        selector: Option<String>,

        /// Experiment duration (overrides scenario).
        #[arg(long)]
        duration: Option<HavocDuration>,

        /// Sampling interval (overrides scenario).
        #[arg(long)]
        interval: Option<HavocDuration>,
    },

    /// Observe an already-degraded target without injecting anything
    Monitor {
        scenario: PathBuf,

        #[arg(long)]
        target: Option<String>,

        #[arg(long, conflicts_with = "target")]
        selector: Option<String>,

        #[arg(long)]
        duration: Option<HavocDuration>,

        #[arg(long)]
        interval: Option<HavocDuration>,
    },

    /// Reverse the injected condition and re-verify once
    Remediate {
        scenario: PathBuf,

        #[arg(long)]
        strategy: RemediationStrategy,

        #[arg(long)]
        target: Option<String>,

        /// Skip the interactive confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Remove anything a previous run left behind (idempotent)
    Cleanup {
        scenario: PathBuf,

        #[arg(long)]
        target: Option<String>,
    },

    /// Print version and build info
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_global_args(std::env::args()));

    if let Err(err) = init_tracing(&cli.log, cli.no_color) {
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    if let Some(cwd) = &cli.cwd
        && let Err(err) = std::env::set_current_dir(cwd)
    {
        eprintln!("failed to set cwd to {}: {err}", cwd.display());
        return ExitCode::from(2);
    }

    let config = Config::load_optional(&cli.config);

    match run_command(&cli, &config) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(&cli, err),
    }
}

fn normalize_global_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let all: Vec<String> = args.into_iter().collect();
    if all.is_empty() {
        return all;
    }

    let mut globals = Vec::new();
    let mut rest = Vec::new();

    let mut i = 1usize;
    while i < all.len() {
        let arg = &all[i];
        match arg.as_str() {
            "--json" | "--no-color" => {
                globals.push(arg.clone());
                i += 1;
            }
            "--config" | "--cwd" | "--log" => {
                globals.push(arg.clone());
                if i + 1 < all.len() {
                    globals.push(all[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ if arg.starts_with("--config=") || arg.starts_with("--cwd=") || arg.starts_with("--log=") => {
                globals.push(arg.clone());
                i += 1;
            }
            _ => {
                rest.push(arg.clone());
                i += 1;
            }
        }
    }

    let mut normalized = Vec::with_capacity(all.len());
    normalized.push(all[0].clone());
    normalized.extend(globals);
    normalized.extend(rest);
    normalized
}

fn init_tracing(level: &str, no_color: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(!no_color)
        .init();
    Ok(())
}

fn build_remote(
    config: &Config,
    clock: &Arc<EngineClock>,
    scenario: &ScenarioDefinition,
) -> Box<dyn RemoteExecutor> {
    match config.remote_backend {
        RemoteBackend::Scripted => {
            Box::new(ScriptedRemote::rehearsal(Arc::clone(clock), scenario))
        }
        RemoteBackend::Host => Box::new(HostRemote::new(config, &scenario.system)),
    }
}

fn execute(
    cli: &Cli,
    config: &Config,
    scenario_path: &PathBuf,
    opt: RunOptions,
) -> Result<ExitCode, HavocError> {
    let scenario = ScenarioDefinition::load(&ScenarioPath::new(scenario_path.clone()), config)?;
    let clock = Arc::new(EngineClock::new(config.clock));
    let remote = build_remote(config, &clock, &scenario);
    let run = havoc::run_scenario(config, &scenario, remote.as_ref(), clock, &opt)?;
    print_run_summary(cli, &run.summary)?;
    Ok(exit_code_for(&run.summary))
}

fn run_command(cli: &Cli, config: &Config) -> Result<ExitCode, HavocError> {
    match &cli.command {
        Command::Init { force } => {
            havoc::init_project(config, *force)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Run {
            scenario,
            target,
            selector,
            duration,
            interval,
        } => execute(
            cli,
            config,
            scenario,
            RunOptions {
                mode: RunMode::DeployAndMonitor,
                target: target.clone(),
                selector: selector.clone(),
                duration: duration.map(|d| d.0),
                sample_interval: interval.map(|d| d.0),
                strategy: None,
                unattended: config.unattended,
            },
        ),

        Command::Monitor {
            scenario,
            target,
            selector,
            duration,
            interval,
        } => execute(
            cli,
            config,
            scenario,
            RunOptions {
                mode: RunMode::MonitorOnly,
                target: target.clone(),
                selector: selector.clone(),
                duration: duration.map(|d| d.0),
                sample_interval: interval.map(|d| d.0),
                strategy: None,
                unattended: config.unattended,
            },
        ),

        Command::Remediate {
            scenario,
            strategy,
            target,
            yes,
        } => execute(
            cli,
            config,
            scenario,
            RunOptions {
                mode: RunMode::Remediate,
                target: target.clone(),
                selector: None,
                duration: None,
                sample_interval: None,
                strategy: Some(*strategy),
                unattended: *yes || config.unattended,
            },
        ),

        Command::Cleanup { scenario, target } => execute(
            cli,
            config,
            scenario,
            RunOptions {
                mode: RunMode::Cleanup,
                target: target.clone(),
                selector: None,
                duration: None,
                sample_interval: None,
                strategy: None,
                unattended: true,
            },
        ),

        Command::Version => {
            let info = serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            });
            if cli.json {
                println!("{info}");
            } else {
                println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_run_summary(cli: &Cli, summary: &RunSummary) -> Result<(), HavocError> {
    if cli.json {
        println!("{}", serde_json::to_string(summary)?);
    } else {
        println!("{}", summary.pretty());
    }
    Ok(())
}

fn exit_code_for(summary: &RunSummary) -> ExitCode {
    match summary.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Aborted => ExitCode::from(1),
    }
}

fn print_error_and_exit(cli: &Cli, err: HavocError) -> ExitCode {
    let code: u8 = match &err {
        HavocError::Prerequisite(_) => 1,
        HavocError::NotFound(_) => 3,
        HavocError::InvalidArgument(_) | HavocError::Scenario(_) | HavocError::Config(_) => 2,
        _ => 1,
    };
    if cli.json {
        let out = serde_json::json!({
            "status": "error",
            "code": code,
            "message": err.to_string(),
        });
        println!("{out}");
    } else {
        eprintln!("{err}");
    }
    ExitCode::from(code)
}
