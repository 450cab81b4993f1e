// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.


//! Trialhub CLI
//!
//! Command-line interface for experiments, trials and trial logs.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Level};
use trialhub_core::{
    ErrorKind, ExperimentConfig, ExperimentId, ExperimentState, LogRecord, ModelContext, TrialId,
    TrialhubConfig, TrialhubError,
};
use trialhub_experiments::{
    CreateOutcome, CreateRequest, DefinitionRegistry, ExperimentView, Orchestrator,
};
use trialhub_query::LogSelection;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "trialhub")]
#[command(about = "Trialhub - experiment lifecycle and trial log aggregation", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory, overrides the configuration file
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Experiment operations
    #[command(alias = "e")]
    Experiment {
        #[command(subcommand)]
        command: ExperimentCommands,
    },

    /// Trial operations
    #[command(alias = "t")]
    Trial {
        #[command(subcommand)]
        command: TrialCommands,
    },
}

#[derive(Subcommand)]
enum ExperimentCommands {
    /// Create an experiment from a configuration file and a context directory
    Create {
        /// Experiment configuration (JSON, or TOML by extension)
        config: PathBuf,

        /// Directory uploaded as the model context
        context: Option<PathBuf>,

        /// Only check that the trial definition constructs; create nothing
        #[arg(long)]
        test_mode: bool,

        /// Create in the paused state without starting trials
        #[arg(long)]
        paused: bool,

        /// How long to wait for an active experiment to finish
        #[arg(long, default_value = "3600")]
        wait_secs: u64,
    },

    /// Describe an experiment
    Describe {
        id: ExperimentId,

        /// Print a JSON array holding the experiment
        #[arg(long)]
        json: bool,
    },

    /// List experiments
    List {
        #[arg(long)]
        json: bool,
    },

    /// Delete an experiment with its trials and logs (administrative)
    Delete {
        id: ExperimentId,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    Archive {
        id: ExperimentId,
    },

    Unarchive {
        id: ExperimentId,
    },

    Cancel {
        id: ExperimentId,
    },

    Pause {
        id: ExperimentId,
    },

    /// Activate a paused experiment, starting its trials on first activation
    Activate {
        id: ExperimentId,

        #[arg(long, default_value = "3600")]
        wait_secs: u64,
    },

    /// Add or remove labels
    Label {
        #[command(subcommand)]
        command: LabelCommands,
    },

    /// List the trials of an experiment
    Trials {
        id: ExperimentId,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum LabelCommands {
    Add { id: ExperimentId, label: String },
    Remove { id: ExperimentId, label: String },
}

#[derive(Subcommand)]
enum TrialCommands {
    /// Print a trial's logs
    Logs {
        trial_id: TrialId,

        #[command(flatten)]
        selection: SelectionArgs,
    },
}

#[derive(Args)]
struct SelectionArgs {
    /// First N records
    #[arg(long, conflicts_with_all = ["tail", "follow"])]
    head: Option<usize>,

    /// Last N records
    #[arg(long, conflicts_with = "follow")]
    tail: Option<usize>,

    /// Keep printing new records until the trial ends
    #[arg(short, long)]
    follow: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output and raw log bytes.
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {:#}", err);
        std::process::exit(exit_code(&err));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => TrialhubConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => TrialhubConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }

    let registry = Arc::new(DefinitionRegistry::with_builtins());
    let orchestrator = Orchestrator::open(config, registry)
        .await
        .context("Failed to open data directory")?;

    match cli.command {
        Commands::Experiment { command } => experiment_command(&orchestrator, command).await,
        Commands::Trial { command } => trial_command(&orchestrator, command).await,
    }
}

async fn experiment_command(orch: &Orchestrator, command: ExperimentCommands) -> Result<()> {
    match command {
        ExperimentCommands::Create {
            config,
            context,
            test_mode,
            paused,
            wait_secs,
        } => {
            let mut request = CreateRequest::new(read_experiment_config(&config)?);
            if let Some(dir) = context {
                request.context = read_context_dir(&dir)?;
            }
            request.owner = std::env::var("USER").unwrap_or_else(|_| "trialhub".to_string());
            request.paused = paused;
            request.test_mode = test_mode;

            match orch.create_experiment(request).await? {
                CreateOutcome::Validated(message) => println!("{}", message),
                CreateOutcome::Created(record) => {
                    println!("Created experiment {}", record.id);
                    if record.state == ExperimentState::Active {
                        wait_for_experiment(orch, record.id, wait_secs).await?;
                    }
                }
            }
        }

        ExperimentCommands::Describe { id, json } => {
            let view = orch.describe(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&[&view])?);
            } else {
                print_view(&view);
            }
        }

        ExperimentCommands::List { json } => {
            let views = orch.list_experiments();
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                println!("{:>6}  {:<10}  {:<8}  {:>6}  labels", "id", "state", "archived", "trials");
                for view in &views {
                    println!(
                        "{:>6}  {:<10}  {:<8}  {:>6}  {}",
                        view.id,
                        view.state,
                        view.archived,
                        view.trials.len(),
                        join_labels(view)
                    );
                }
            }
        }

        ExperimentCommands::Delete { id, yes } => {
            if !yes {
                bail!("refusing to delete experiment {} without --yes", id);
            }
            let admin = orch.config().admin_from_env();
            let stats = orch.delete(id, admin).await?;
            info!(
                experiment_id = %id,
                trials = stats.trials_deleted,
                records = stats.log_records_deleted,
                "deleted experiment"
            );
            println!("Deleted experiment {}", id);
        }

        ExperimentCommands::Archive { id } => {
            orch.archive(id)?;
            println!("Archived experiment {}", id);
        }

        ExperimentCommands::Unarchive { id } => {
            orch.unarchive(id)?;
            println!("Unarchived experiment {}", id);
        }

        ExperimentCommands::Cancel { id } => {
            let record = orch.cancel(id).await?;
            println!("Experiment {} is {}", id, record.state);
        }

        ExperimentCommands::Pause { id } => {
            let record = orch.pause(id)?;
            println!("Experiment {} is {}", id, record.state);
        }

        ExperimentCommands::Activate { id, wait_secs } => {
            let record = orch.activate(id).await?;
            println!("Experiment {} is {}", id, record.state);
            if record.state == ExperimentState::Active {
                wait_for_experiment(orch, id, wait_secs).await?;
            }
        }

        ExperimentCommands::Label { command } => match command {
            LabelCommands::Add { id, label } => {
                let record = orch.add_label(id, &label)?;
                debug!(experiment_id = %id, revision = record.revision, "label added");
            }
            LabelCommands::Remove { id, label } => {
                let record = orch.remove_label(id, &label)?;
                debug!(experiment_id = %id, revision = record.revision, "label removed");
            }
        },

        ExperimentCommands::Trials { id, json } => {
            let trials = orch.list_trials(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&trials)?);
            } else {
                println!("{:>6}  {:<10}  {:>5}", "id", "state", "ranks");
                for trial in &trials {
                    println!("{:>6}  {:<10}  {:>5}", trial.id, trial.state, trial.rank_count);
                }
            }
        }
    }
    Ok(())
}

async fn trial_command(orch: &Orchestrator, command: TrialCommands) -> Result<()> {
    match command {
        TrialCommands::Logs {
            trial_id,
            selection,
        } => {
            if selection.follow {
                return follow_logs(orch, trial_id).await;
            }
            let selection = match (selection.head, selection.tail) {
                (Some(n), _) => LogSelection::Head(n),
                (None, Some(n)) => LogSelection::Tail(n),
                (None, None) => LogSelection::Full,
            };
            let records = orch.trial_logs(trial_id, selection)?;
            let mut out = std::io::stdout().lock();
            for record in &records {
                write_record(&mut out, record)?;
            }
            out.flush()?;
        }
    }
    Ok(())
}

async fn follow_logs(orch: &Orchestrator, trial_id: TrialId) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut follower = orch.follow_logs(trial_id, cancel)?;
    while let Some(record) = follower.next().await {
        let mut out = std::io::stdout().lock();
        write_record(&mut out, &record)?;
        out.flush()?;
    }
    Ok(())
}

/// Raw payload bytes followed by a newline; nothing is re-encoded.
fn write_record(out: &mut impl Write, record: &LogRecord) -> std::io::Result<()> {
    out.write_all(&record.payload)?;
    out.write_all(b"\n")
}

async fn wait_for_experiment(orch: &Orchestrator, id: ExperimentId, wait_secs: u64) -> Result<()> {
    let record = orch
        .wait_for_terminal(id, Duration::from_secs(wait_secs))
        .await
        .with_context(|| format!("Experiment {} did not finish", id))?;
    println!("Experiment {} finished: {}", id, record.state);
    if record.state == ExperimentState::Errored {
        bail!("experiment {} errored", id);
    }
    Ok(())
}

fn read_experiment_config(path: &Path) -> Result<ExperimentConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str(&raw).with_context(|| format!("Invalid TOML in {}", path.display()))?
    } else {
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))?
    };
    Ok(ExperimentConfig::new(value)?)
}

fn read_context_dir(dir: &Path) -> Result<ModelContext> {
    let mut context = ModelContext::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} is outside {}", entry.path().display(), dir.display()))?;
        let contents = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        context.insert(relative.to_string_lossy().replace('\\', "/"), contents);
    }
    debug!(files = context.len(), bytes = context.total_bytes(), "read model context");
    Ok(context)
}

fn print_view(view: &ExperimentView) {
    println!("Experiment {}", view.id);
    println!("  state:      {}", view.state);
    println!("  archived:   {}", view.archived);
    println!("  owner:      {}", view.owner);
    println!("  created:    {}", view.created_at.to_rfc3339());
    println!("  revision:   {}", view.revision);
    println!("  entrypoint: {}", view.config.entrypoint());
    println!("  labels:     {}", join_labels(view));
    println!("  trials:");
    for trial in &view.trials {
        let end = trial
            .end_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "    {:>6}  {:<10}  ranks={}  end={}",
            trial.id, trial.state, trial.rank_count, end
        );
    }
}

fn join_labels(view: &ExperimentView) -> String {
    view.labels.iter().cloned().collect::<Vec<_>>().join(",")
}

fn exit_code(err: &anyhow::Error) -> i32 {
    let kind = err
        .chain()
        .find_map(|e| e.downcast_ref::<TrialhubError>())
        .map(|e| e.kind());
    match kind {
        Some(ErrorKind::Validation) => 2,
        Some(ErrorKind::InvalidState) => 3,
        Some(ErrorKind::NotFound) => 4,
        Some(ErrorKind::Timeout) => 5,
        _ => 1,
    }
}
