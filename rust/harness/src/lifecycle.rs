//! Run lifecycle state machine.
//!
//! Every operation holds its project's lock from manifest load to persist, so
//! operations on the same project are serialized while different projects
//! proceed concurrently. Device accounting goes through the shared
//! [`AcceleratorPool`].
//!
//! Termination is fire-and-forget: devices of a killed run return to the pool
//! without waiting for the process to exit, so a dying process may briefly
//! overlap with the next run that receives its devices.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use crate::{
    config::{HarnessConfig, HarnessSettings},
    error::HarnessError,
    pool::{AcceleratorPool, PoolSnapshot, detect_device_count},
    runner::{Supervisor, Termination, is_process_alive},
    state::{MANIFEST_FILE, ManifestStore, RunRecord, RunStatus, now_timestamp},
    workspace::{ArtifactRefs, WorkspaceBuilder},
};

type Result<T> = std::result::Result<T, HarnessError>;

/// Identifies a project directory `<workspace_root>/<owner>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectKey {
    pub owner: String,
    pub name: String,
}

impl ProjectKey {
    #[must_use]
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Request to create a run.
#[derive(Debug, Clone)]
pub struct CreateRun {
    pub name: String,
    pub model: String,
    pub dataset: String,
    /// Empty for no optimization.
    pub optimization: String,
    pub device_count: u32,
    pub entry_script: String,
    pub config: Option<String>,
    pub misc: Option<Value>,
}

/// Request to edit (and possibly rename) a run.
#[derive(Debug, Clone)]
pub struct EditRun {
    pub original_name: String,
    pub name: String,
    pub model: String,
    pub dataset: String,
    pub optimization: String,
    pub device_count: u32,
    pub entry_script: String,
    /// Replaces the configuration when present and non-blank.
    pub config: Option<String>,
    /// Replaces the auxiliary metadata when present.
    pub misc: Option<Value>,
}

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedRun {
    pub pid: u32,
    pub devices: Vec<u32>,
}

/// Result of a stop request. Both variants are successes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was signalled (or found gone) and its devices released.
    Stopped { released: Vec<u32> },
    /// The run had no active process.
    AlreadyStopped,
}

/// What the startup reconciliation pass did.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Runs whose process is alive; their devices were re-marked busy.
    pub reclaimed: Vec<(ProjectKey, String)>,
    /// Runs whose process is gone; demoted to `Stopped`.
    pub demoted: Vec<(ProjectKey, String)>,
    /// Device ids a live run claims that were unknown or already claimed.
    pub conflicts: Vec<(ProjectKey, String, Vec<u32>)>,
}

/// Per-project async locks, created on first use.
#[derive(Debug, Default)]
struct ProjectLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectLocks {
    async fn acquire(&self, project_dir: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(project_dir.to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Resolved handles for one project.
struct Project {
    key: ProjectKey,
    dir: PathBuf,
    store: ManifestStore,
    builder: WorkspaceBuilder,
}

/// Sequences workspace, pool, supervisor and manifest for every lifecycle operation.
pub struct RunController {
    settings: HarnessSettings,
    pool: Arc<AcceleratorPool>,
    supervisor: Supervisor,
    locks: ProjectLocks,
    startup: ReconcileReport,
}

impl RunController {
    /// Build a controller around an existing pool without reconciling.
    #[must_use]
    pub fn with_pool(config: &HarnessConfig, pool: Arc<AcceleratorPool>) -> Self {
        Self {
            settings: config.harness.clone(),
            pool,
            supervisor: Supervisor::from_settings(&config.harness),
            locks: ProjectLocks::default(),
            startup: ReconcileReport::default(),
        }
    }

    /// Build the pool from the configured (or detected) device count and run
    /// the reconciliation pass before returning.
    pub async fn open(config: &HarnessConfig) -> Result<Self> {
        let total = config
            .harness
            .device_count
            .unwrap_or_else(detect_device_count);
        let mut controller = Self::with_pool(config, Arc::new(AcceleratorPool::new(total)));

        let report = controller.reconcile().await?;
        tracing::info!(
            "Pool ready: {} device(s), {} free ({} run(s) reclaimed, {} demoted)",
            controller.pool.total(),
            controller.pool.free_count(),
            report.reclaimed.len(),
            report.demoted.len()
        );
        controller.startup = report;
        Ok(controller)
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<AcceleratorPool> {
        &self.pool
    }

    /// What the reconciliation pass of [`open`](Self::open) did.
    #[must_use]
    pub fn startup_report(&self) -> &ReconcileReport {
        &self.startup
    }

    #[must_use]
    pub fn devices(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    fn project(&self, key: &ProjectKey) -> Result<Project> {
        validate_component("owner", &key.owner)?;
        validate_component("project", &key.name)?;
        let dir = self
            .settings
            .workspace_root
            .join(&key.owner)
            .join(&key.name);
        if !dir.is_dir() {
            return Err(HarnessError::NotFound(format!("project {key}")));
        }
        Ok(Project {
            key: key.clone(),
            store: ManifestStore::for_project(&dir),
            builder: WorkspaceBuilder::new(&dir, &self.settings),
            dir,
        })
    }

    /// Create a run's workspace and append a `NotRunning` record.
    pub async fn create(&self, key: &ProjectKey, req: CreateRun) -> Result<RunRecord> {
        validate_component("run", &req.name)?;
        validate_artifacts(&req.model, &req.dataset, &req.optimization)?;
        validate_launch_fields(req.device_count, &req.entry_script)?;

        let project = self.project(key)?;
        let _guard = self.locks.acquire(&project.dir).await;

        let mut workspace_created = false;
        let result = project.store.update(|manifest| {
            if manifest.contains(&req.name) || project.builder.exists(&req.name) {
                return Err(HarnessError::AlreadyExists(format!("run {}", req.name)));
            }

            let refs = ArtifactRefs {
                model: req.model.clone(),
                dataset: req.dataset.clone(),
                optimization: req.optimization.clone(),
            };
            project
                .builder
                .create(&req.name, &refs, &req.entry_script, req.config.as_deref())?;
            workspace_created = true;

            let mut record = RunRecord::new(
                &req.name,
                &req.model,
                &req.dataset,
                &req.optimization,
                req.device_count,
            );
            if let Some(misc) = &req.misc {
                record.misc = misc.clone();
            }
            record.entry_path = absolute_display(&project.builder.entry_script_path(&req.name));
            manifest.runs.push(record.clone());
            Ok(record)
        });

        if result.is_err()
            && workspace_created
            && let Err(e) = project.builder.destroy(&req.name)
        {
            tracing::error!("Failed to remove workspace of unrecorded run {}: {e}", req.name);
        }

        let record = result?;
        tracing::info!("Created run {} in {}", record.name, project.key);
        Ok(record)
    }

    /// Allocate devices and launch the run's entry script.
    ///
    /// Devices are released again on every failure after allocation.
    pub async fn start(&self, key: &ProjectKey, run: &str) -> Result<StartedRun> {
        let project = self.project(key)?;
        let _guard = self.locks.acquire(&project.dir).await;

        let mut launched: Option<StartedRun> = None;
        let result = project.store.update(|manifest| {
            let record = manifest
                .find_mut(run)
                .ok_or_else(|| HarnessError::NotFound(format!("run {run}")))?;
            if !record.status.is_idle() {
                return Err(HarnessError::AlreadyRunning(run.to_string()));
            }
            if !project.builder.entry_script_exists(run) {
                return Err(HarnessError::InvalidRequest(format!(
                    "{} not found for run {run}",
                    project.builder.entry_script_name()
                )));
            }

            let devices = self.pool.allocate(record.device_count)?;
            let pid = match self.launch(&project.builder, run, &devices) {
                Ok(pid) => pid,
                Err(e) => {
                    self.pool.release(&devices);
                    return Err(e);
                }
            };

            record.mark_running(pid, devices.clone());
            let started = StartedRun { pid, devices };
            launched = Some(started.clone());
            Ok(started)
        });

        match result {
            Ok(started) => {
                tracing::info!(
                    "Started {run} in {} (PID {}, devices {:?})",
                    project.key,
                    started.pid,
                    started.devices
                );
                Ok(started)
            }
            Err(e) => {
                // Launched but not recorded: undo so nothing runs untracked.
                if let Some(started) = launched {
                    if let Err(kill_err) = self.supervisor.terminate(started.pid) {
                        tracing::error!("Failed to kill unrecorded run {run}: {kill_err}");
                    }
                    self.pool.release(&started.devices);
                }
                Err(e)
            }
        }
    }

    fn launch(&self, builder: &WorkspaceBuilder, run: &str, devices: &[u32]) -> Result<u32> {
        builder.inject_device_count(run, devices.len())?;
        builder.append_log(
            run,
            &format!(
                "\n--- {} starting with devices: {} ---\n",
                now_timestamp(),
                join_ids(devices)
            ),
        )?;
        let log = builder.open_log(run)?;
        self.supervisor
            .launch(&builder.run_dir(run), builder.entry_script_name(), devices, log)
            .map_err(|source| HarnessError::LaunchFailed {
                run: run.to_string(),
                source,
            })
    }

    /// Kill the run's process and return its devices to the pool.
    ///
    /// Stopping an idle run succeeds with [`StopOutcome::AlreadyStopped`].
    /// A failed kill is logged and bookkeeping proceeds regardless. Devices
    /// return to the pool only once the `Stopped` record is persisted.
    pub async fn stop(&self, key: &ProjectKey, run: &str) -> Result<StopOutcome> {
        let project = self.project(key)?;
        let _guard = self.locks.acquire(&project.dir).await;

        let outcome = project.store.update(|manifest| -> Result<StopOutcome> {
            let record = manifest
                .find_mut(run)
                .ok_or_else(|| HarnessError::NotFound(format!("run {run}")))?;
            let Some(pid) = record.pid.filter(|_| record.is_active()) else {
                return Ok(StopOutcome::AlreadyStopped);
            };

            match self.supervisor.terminate(pid) {
                Ok(Termination::Killed) => {}
                Ok(Termination::AlreadyGone) => {
                    tracing::info!("Process {pid} of {run} had already exited");
                }
                Err(e) => tracing::warn!("Could not kill {run}: {e}"),
            }

            Ok(StopOutcome::Stopped {
                released: record.mark_stopped(),
            })
        })?;

        match &outcome {
            StopOutcome::Stopped { released } => {
                self.pool.release(released);
                tracing::info!("Stopped {run} in {} (released {released:?})", project.key);
            }
            StopOutcome::AlreadyStopped => {
                tracing::info!("Run {run} in {} is not currently running", project.key);
            }
        }
        Ok(outcome)
    }

    /// Remove a run's record and workspace, killing it first if it is running.
    ///
    /// A hard kill failure aborts the delete with everything left in place.
    /// The run is persisted as stopped before its workspace is removed, so a
    /// failed removal leaves a stopped run behind.
    pub async fn delete(&self, key: &ProjectKey, run: &str) -> Result<()> {
        let project = self.project(key)?;
        let _guard = self.locks.acquire(&project.dir).await;

        let released = project.store.update(|manifest| -> Result<Vec<u32>> {
            let record = manifest
                .find_mut(run)
                .ok_or_else(|| HarnessError::NotFound(format!("run {run}")))?;
            if let Some(pid) = record.pid {
                self.terminate_hard(run, pid)?;
            }
            Ok(record.mark_stopped())
        })?;
        self.pool.release(&released);

        project.builder.destroy(run)?;
        project.store.update(|manifest| -> Result<()> {
            manifest.remove(run);
            Ok(())
        })?;

        tracing::info!("Deleted run {run} from {} (released {released:?})", project.key);
        Ok(())
    }

    /// Rewrite a run's entry script, configuration and references, renaming
    /// it when `req.name` differs from `req.original_name`.
    ///
    /// A running run is killed and persisted as stopped before anything is
    /// rewritten. A failed rewrite leaves it stopped under its original name.
    pub async fn edit(&self, key: &ProjectKey, req: EditRun) -> Result<RunRecord> {
        validate_component("run", &req.original_name)?;
        validate_component("run", &req.name)?;
        validate_artifacts(&req.model, &req.dataset, &req.optimization)?;
        validate_launch_fields(req.device_count, &req.entry_script)?;

        let project = self.project(key)?;
        let _guard = self.locks.acquire(&project.dir).await;
        let original = req.original_name.as_str();
        let renaming = req.name != original;

        let stopped = project.store.update(|manifest| -> Result<Option<Vec<u32>>> {
            if !manifest.contains(original) || !project.builder.exists(original) {
                return Err(HarnessError::NotFound(format!("run {original}")));
            }
            if renaming && (manifest.contains(&req.name) || project.builder.exists(&req.name)) {
                return Err(HarnessError::Conflict(req.name.clone()));
            }
            let record = manifest
                .find_mut(original)
                .ok_or_else(|| HarnessError::NotFound(format!("run {original}")))?;
            if record.status != RunStatus::Running {
                return Ok(None);
            }
            if let Some(pid) = record.pid {
                self.terminate_hard(original, pid)?;
            }
            Ok(Some(record.mark_stopped()))
        })?;
        if let Some(released) = stopped {
            self.pool.release(&released);
            tracing::info!("Stopped {original} before editing (released {released:?})");
        }

        let mut renamed = false;
        let result = project.store.update(|manifest| -> Result<RunRecord> {
            let record = manifest
                .find_mut(original)
                .ok_or_else(|| HarnessError::NotFound(format!("run {original}")))?;

            if renaming {
                project.builder.rename(original, &req.name)?;
                renamed = true;
                record.name.clone_from(&req.name);
                record.entry_path = absolute_display(&project.builder.entry_script_path(&req.name));
                record.reset();
            }

            record.model.clone_from(&req.model);
            record.dataset.clone_from(&req.dataset);
            record.optimization.clone_from(&req.optimization);
            record.device_count = req.device_count;
            if let Some(misc) = &req.misc {
                record.misc = misc.clone();
            }

            project
                .builder
                .write_entry_script(&record.name, &req.entry_script)?;
            if let Some(config) = req.config.as_deref().filter(|c| !c.trim().is_empty()) {
                project.builder.write_config(&record.name, config)?;
            }
            Ok(record.clone())
        });

        // The manifest still names the original run; move the workspace back.
        if result.is_err()
            && renamed
            && let Err(e) = project.builder.rename(&req.name, original)
        {
            tracing::error!("Failed to restore workspace of {original} after failed edit: {e}");
        }

        let record = result?;
        tracing::info!("Updated run {} in {}", record.name, project.key);
        Ok(record)
    }

    fn terminate_hard(&self, run: &str, pid: u32) -> Result<Termination> {
        self.supervisor
            .terminate(pid)
            .map_err(|source| HarnessError::TerminationFailed {
                run: run.to_string(),
                source,
            })
    }

    /// All run records of a project, in manifest order.
    pub async fn list(&self, key: &ProjectKey) -> Result<Vec<RunRecord>> {
        let project = self.project(key)?;
        let _guard = self.locks.acquire(&project.dir).await;
        Ok(project.store.load()?.runs)
    }

    /// Log lines of a run.
    pub async fn logs(&self, key: &ProjectKey, run: &str) -> Result<Vec<String>> {
        let project = self.project(key)?;
        let _guard = self.locks.acquire(&project.dir).await;
        Self::require_run(&project, run)?;
        Ok(project.builder.read_log(run)?)
    }

    /// Content of the entry script or configuration of a run.
    pub async fn read_file(&self, key: &ProjectKey, run: &str, filename: &str) -> Result<String> {
        let project = self.project(key)?;
        let _guard = self.locks.acquire(&project.dir).await;
        Self::require_run(&project, run)?;
        Ok(project.builder.read_restricted_file(run, filename)?)
    }

    fn require_run(project: &Project, run: &str) -> Result<()> {
        if project.store.load()?.contains(run) {
            Ok(())
        } else {
            Err(HarnessError::NotFound(format!("run {run}")))
        }
    }

    /// Re-derive pool state from persisted `Running` records.
    ///
    /// Live processes get their devices re-marked busy; dead ones are demoted
    /// to `Stopped`. Intended for a freshly created pool, before any request
    /// is served.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for key in self.discover_projects()? {
            let project = self.project(&key)?;
            let _guard = self.locks.acquire(&project.dir).await;

            if !project.store.load()?.runs.iter().any(|r| r.status == RunStatus::Running) {
                continue;
            }

            project.store.update(|manifest| {
                for record in &mut manifest.runs {
                    if record.status != RunStatus::Running {
                        continue;
                    }
                    if record.pid.is_some_and(is_process_alive) {
                        let conflicts = self.pool.claim(&record.devices);
                        if !conflicts.is_empty() {
                            tracing::warn!(
                                "Run {} in {key} claims devices {conflicts:?} that are unknown or taken",
                                record.name
                            );
                            report
                                .conflicts
                                .push((key.clone(), record.name.clone(), conflicts));
                        }
                        tracing::info!(
                            "Reclaimed devices {:?} for live run {} in {key}",
                            record.devices,
                            record.name
                        );
                        report.reclaimed.push((key.clone(), record.name.clone()));
                    } else {
                        tracing::info!(
                            "Run {} in {key} is no longer alive, marking stopped",
                            record.name
                        );
                        record.mark_stopped();
                        report.demoted.push((key.clone(), record.name.clone()));
                    }
                }
                Ok::<_, HarnessError>(())
            })?;
        }

        Ok(report)
    }

    /// Every `<owner>/<project>` under the workspace root holding a manifest.
    fn discover_projects(&self) -> Result<Vec<ProjectKey>> {
        let root = &self.settings.workspace_root;
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for owner in subdirectories(root)? {
            for name in subdirectories(&root.join(&owner))? {
                if root.join(&owner).join(&name).join(MANIFEST_FILE).is_file() {
                    keys.push(ProjectKey::new(owner.clone(), name));
                }
            }
        }
        keys.sort_by(|a, b| (&a.owner, &a.name).cmp(&(&b.owner, &b.name)));
        Ok(keys)
    }
}

/// Names of visible subdirectories that are valid path components.
fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| HarnessError::Scan(dir.to_path_buf(), e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| HarnessError::Scan(dir.to_path_buf(), e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with('.') && validate_component("directory", &name).is_ok() {
            names.push(name);
        }
    }
    Ok(names)
}

/// A name must be usable as exactly one path component.
fn validate_component(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HarnessError::InvalidRequest(format!("{what} name is required")));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(HarnessError::InvalidRequest(format!(
            "{what} name {name:?} is not a plain name"
        )));
    }
    Ok(())
}

fn validate_artifacts(model: &str, dataset: &str, optimization: &str) -> Result<()> {
    validate_component("model", model)?;
    validate_component("dataset", dataset)?;
    if !optimization.is_empty() {
        validate_component("optimization", optimization)?;
    }
    Ok(())
}

fn validate_launch_fields(device_count: u32, entry_script: &str) -> Result<()> {
    if device_count == 0 {
        return Err(HarnessError::InvalidRequest(
            "device count must be at least 1".into(),
        ));
    }
    if entry_script.trim().is_empty() {
        return Err(HarnessError::InvalidRequest("entry script is required".into()));
    }
    Ok(())
}

fn absolute_display(path: &Path) -> Option<String> {
    std::path::absolute(path)
        .ok()
        .map(|p| p.display().to_string())
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
