//! Edge Training Harness CLI
//!
//! Creates, starts, stops, edits and inspects runs of a project, and shows
//! which accelerator devices are in use.

use std::{fs::File, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use edge_harness::{
    config::HarnessConfig,
    lifecycle::{CreateRun, EditRun, ProjectKey, RunController, StopOutcome},
};
use fs2::FileExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "edge-harness", about = "Training run harness")]
struct Cli {
    /// Path to harness.toml config file
    #[arg(short, long, global = true, default_value = "harness.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ProjectArgs {
    /// Owner of the project
    #[arg(long)]
    owner: String,

    /// Project name
    #[arg(long)]
    project: String,
}

impl ProjectArgs {
    fn key(&self) -> ProjectKey {
        ProjectKey::new(&self.owner, &self.project)
    }
}

#[derive(Args)]
struct RunDefinition {
    /// Model artifact name (directory under the project's `models/`)
    #[arg(long)]
    model: String,

    /// Dataset artifact name (directory under the project's `datasets/`)
    #[arg(long)]
    dataset: String,

    /// Optimization artifact name (directory under the project's `optimizations/`)
    #[arg(long, default_value = "")]
    optimization: String,

    /// Number of devices the run needs
    #[arg(long, default_value_t = 1)]
    devices: u32,

    /// File whose content becomes the run's entry script
    #[arg(long)]
    entry_script: PathBuf,

    /// File whose content becomes the run's configuration document
    #[arg(long)]
    run_config: Option<PathBuf>,

    /// Auxiliary metadata as a JSON document
    #[arg(long)]
    misc: Option<String>,
}

type BoxError = Box<dyn std::error::Error>;

/// Entry script, configuration document and metadata of a run definition.
type RunContent = (String, Option<String>, Option<serde_json::Value>);

impl RunDefinition {
    fn read(&self) -> Result<RunContent, BoxError> {
        let entry_script = std::fs::read_to_string(&self.entry_script)
            .map_err(|e| format!("failed to read {}: {e}", self.entry_script.display()))?;
        let config = self
            .run_config
            .as_ref()
            .map(|path| {
                std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read {}: {e}", path.display()))
            })
            .transpose()?;
        let misc = self
            .misc
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| format!("--misc is not valid JSON: {e}"))?;
        Ok((entry_script, config, misc))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run workspace and record
    Create {
        #[command(flatten)]
        project: ProjectArgs,

        /// Run name
        name: String,

        #[command(flatten)]
        definition: RunDefinition,
    },

    /// Allocate devices and launch a run
    Start {
        #[command(flatten)]
        project: ProjectArgs,

        /// Run name
        name: String,
    },

    /// Kill a run and release its devices
    Stop {
        #[command(flatten)]
        project: ProjectArgs,

        /// Run name
        name: String,
    },

    /// Delete a run, killing it first if needed
    Delete {
        #[command(flatten)]
        project: ProjectArgs,

        /// Run name
        name: String,
    },

    /// Rewrite a run's definition, optionally renaming it
    Edit {
        #[command(flatten)]
        project: ProjectArgs,

        /// Current run name
        name: String,

        /// New run name
        #[arg(long)]
        rename: Option<String>,

        #[command(flatten)]
        definition: RunDefinition,
    },

    /// List runs of a project
    List {
        #[command(flatten)]
        project: ProjectArgs,
    },

    /// Print a run's log
    Logs {
        #[command(flatten)]
        project: ProjectArgs,

        /// Run name
        name: String,
    },

    /// Print a run's entry script or configuration document
    ShowFile {
        #[command(flatten)]
        project: ProjectArgs,

        /// Run name
        name: String,

        /// File name (entry script or configuration document)
        file: String,
    },

    /// Show device usage
    Devices,

    /// Reconcile records with live processes and report the result
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = HarnessConfig::load(&cli.config)?;

    // Serialize invocations on this host; the pool is rebuilt by each one.
    std::fs::create_dir_all(&config.harness.workspace_root)?;
    let host_lock = File::create(config.host_lock_path())?;
    host_lock.lock_exclusive()?;

    let controller = RunController::open(&config).await?;

    match cli.command {
        Commands::Create {
            project,
            name,
            definition,
        } => {
            let (entry_script, run_config, misc) = definition.read()?;
            let record = controller
                .create(
                    &project.key(),
                    CreateRun {
                        name,
                        model: definition.model,
                        dataset: definition.dataset,
                        optimization: definition.optimization,
                        device_count: definition.devices,
                        entry_script,
                        config: run_config,
                        misc,
                    },
                )
                .await?;
            println!("Created: {} ({})", record.name, record.created);
        }

        Commands::Start { project, name } => {
            let started = controller.start(&project.key(), &name).await?;
            println!(
                "Started: {name} (PID: {}, devices: {:?})",
                started.pid, started.devices
            );
        }

        Commands::Stop { project, name } => {
            match controller.stop(&project.key(), &name).await? {
                StopOutcome::Stopped { released } => {
                    println!("Stopped: {name} (released devices: {released:?})");
                }
                StopOutcome::AlreadyStopped => println!("Not running: {name}"),
            }
        }

        Commands::Delete { project, name } => {
            controller.delete(&project.key(), &name).await?;
            println!("Deleted: {name}");
        }

        Commands::Edit {
            project,
            name,
            rename,
            definition,
        } => {
            let (entry_script, run_config, misc) = definition.read()?;
            let record = controller
                .edit(
                    &project.key(),
                    EditRun {
                        name: rename.unwrap_or_else(|| name.clone()),
                        original_name: name,
                        model: definition.model,
                        dataset: definition.dataset,
                        optimization: definition.optimization,
                        device_count: definition.devices,
                        entry_script,
                        config: run_config,
                        misc,
                    },
                )
                .await?;
            println!("Updated: {} [{}]", record.name, record.status);
        }

        Commands::List { project } => {
            let runs = controller.list(&project.key()).await?;
            if runs.is_empty() {
                println!("No runs in {}.", project.key());
                return Ok(());
            }

            println!("=== Runs of {} ===", project.key());
            println!();
            for run in &runs {
                print!(
                    "{}: {} [model: {}, dataset: {}",
                    run.name, run.status, run.model, run.dataset
                );
                if !run.optimization.is_empty() {
                    print!(", optimization: {}", run.optimization);
                }
                print!(", devices needed: {}]", run.device_count);
                if let Some(pid) = run.pid {
                    print!(" (PID: {pid}, devices: {:?})", run.devices);
                }
                println!();
            }
        }

        Commands::Logs { project, name } => {
            for line in controller.logs(&project.key(), &name).await? {
                println!("{line}");
            }
        }

        Commands::ShowFile {
            project,
            name,
            file,
        } => {
            print!("{}", controller.read_file(&project.key(), &name, &file).await?);
        }

        Commands::Devices => {
            let snapshot = controller.devices();
            println!("=== Devices ({} free of {}) ===", snapshot.free, snapshot.total);
            for device in &snapshot.devices {
                println!(
                    "  {}: {}",
                    device.id,
                    if device.busy { "busy" } else { "free" }
                );
            }
        }

        Commands::Reconcile => {
            // `open` already reconciled against a fresh pool; report its outcome.
            let report = controller.startup_report();
            for (key, run) in &report.reclaimed {
                println!("Reclaimed: {key}/{run}");
            }
            for (key, run) in &report.demoted {
                println!("Stopped (process gone): {key}/{run}");
            }
            for (key, run, ids) in &report.conflicts {
                println!("Conflict: {key}/{run} claims unavailable devices {ids:?}");
            }
            let snapshot = controller.devices();
            println!(
                "{} of {} device(s) in use by live runs",
                snapshot.total - snapshot.free,
                snapshot.total
            );
        }
    }

    Ok(())
}
