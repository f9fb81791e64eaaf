//! Project manifest persistence.
//!
//! Each project keeps its run records in `project.json`. The whole document is
//! the read-modify-write unit; [`ManifestStore::update`] holds an exclusive
//! file lock from load to persist so concurrent writers never lose updates.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// File name of the manifest inside a project directory.
pub const MANIFEST_FILE: &str = "project.json";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Created or renamed, never started since.
    #[serde(rename = "Not Running")]
    NotRunning,
    /// A process is executing the entry script.
    Running,
    /// The process was terminated on request.
    Stopped,
}

impl RunStatus {
    /// Idle runs may be started.
    #[must_use]
    pub fn is_idle(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotRunning => "NOT RUNNING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        })
    }
}

/// Persisted descriptor of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(rename = "run_name")]
    pub name: String,
    #[serde(rename = "created_date")]
    pub created: String,
    #[serde(rename = "model_name")]
    pub model: String,
    #[serde(rename = "dataset_name")]
    pub dataset: String,
    /// Empty when the run uses no optimization.
    #[serde(rename = "optimization_name", default)]
    pub optimization: String,
    pub status: RunStatus,
    /// Assigned device ids; empty unless running.
    #[serde(rename = "gpu_ids", default)]
    pub devices: Vec<u32>,
    /// Process id; `None` unless running.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Requested number of devices.
    #[serde(rename = "num_gpus", default = "default_device_count")]
    pub device_count: u32,
    #[serde(default = "empty_object")]
    pub misc: Value,
    /// Absolute path of the entry script.
    #[serde(rename = "engine_path", default, skip_serializing_if = "Option::is_none")]
    pub entry_path: Option<String>,
    /// Keys written by other tools, preserved on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_device_count() -> u32 {
    1
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl RunRecord {
    /// Create a record in the `NotRunning` state.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        dataset: impl Into<String>,
        optimization: impl Into<String>,
        device_count: u32,
    ) -> Self {
        Self {
            name: name.into(),
            created: now_timestamp(),
            model: model.into(),
            dataset: dataset.into(),
            optimization: optimization.into(),
            status: RunStatus::NotRunning,
            devices: Vec::new(),
            pid: None,
            device_count,
            misc: empty_object(),
            entry_path: None,
            extra: Map::new(),
        }
    }

    /// Whether the record points at a process that may still be executing.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Running && self.pid.is_some()
    }

    /// Record a successful launch.
    pub fn mark_running(&mut self, pid: u32, devices: Vec<u32>) {
        self.status = RunStatus::Running;
        self.pid = Some(pid);
        self.devices = devices;
    }

    /// Clear process and devices, returning the devices that were assigned.
    pub fn mark_stopped(&mut self) -> Vec<u32> {
        self.status = RunStatus::Stopped;
        self.pid = None;
        std::mem::take(&mut self.devices)
    }

    /// Back to a never-started state, returning the devices that were assigned.
    pub fn reset(&mut self) -> Vec<u32> {
        self.status = RunStatus::NotRunning;
        self.pid = None;
        std::mem::take(&mut self.devices)
    }
}

/// Aggregate document of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectManifest {
    #[serde(default)]
    pub runs: Vec<RunRecord>,
    /// Sibling lists (datasets, models, optimizations) owned by other tools.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectManifest {
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&RunRecord> {
        self.runs.iter().find(|r| r.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut RunRecord> {
        self.runs.iter_mut().find(|r| r.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Remove a run by name, returning it if present.
    pub fn remove(&mut self, name: &str) -> Option<RunRecord> {
        let idx = self.runs.iter().position(|r| r.name == name)?;
        Some(self.runs.remove(idx))
    }
}

/// Manages manifest persistence with file locking.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    /// Path to the manifest file.
    pub path: PathBuf,
}

impl ManifestStore {
    /// Create a store for the given manifest path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store for the manifest inside a project directory.
    #[must_use]
    pub fn for_project(project_dir: impl AsRef<Path>) -> Self {
        Self::new(project_dir.as_ref().join(MANIFEST_FILE))
    }

    /// Load the manifest, or an empty one if the file doesn't exist.
    pub fn load(&self) -> Result<ProjectManifest, StateError> {
        if !self.path.exists() {
            return Ok(ProjectManifest::default());
        }

        let file = File::open(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let result = Self::read(&file, &self.path);

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        result
    }

    /// Save the manifest with an exclusive lock.
    pub fn save(&self, manifest: &ProjectManifest) -> Result<(), StateError> {
        self.update(|m| {
            m.clone_from(manifest);
            Ok::<_, StateError>(())
        })
    }

    /// Read, mutate and persist the manifest while holding an exclusive lock.
    ///
    /// The file is rewritten only if `f` returns `Ok`; an `Err` from `f` leaves
    /// the document untouched on disk.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut ProjectManifest) -> Result<T, E>,
        E: From<StateError>,
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        // Hold exclusive lock for entire operation; released when `file` drops.
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let mut manifest = Self::read(&file, &self.path)?;
        let value = f(&mut manifest)?;
        Self::write(&file, &self.path, &manifest)?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(value)
    }

    fn read(file: &File, path: &Path) -> Result<ProjectManifest, StateError> {
        let len = file
            .metadata()
            .map_err(|e| StateError::Io(path.to_path_buf(), e))?
            .len();
        if len == 0 {
            return Ok(ProjectManifest::default());
        }
        (&*file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StateError::Io(path.to_path_buf(), e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StateError::Parse(path.to_path_buf(), e.to_string()))
    }

    fn write(file: &File, path: &Path, manifest: &ProjectManifest) -> Result<(), StateError> {
        file.set_len(0)
            .map_err(|e| StateError::Io(path.to_path_buf(), e))?;
        (&*file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StateError::Io(path.to_path_buf(), e))?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, manifest)
            .map_err(|e| StateError::Write(path.to_path_buf(), e.to_string()))?;
        writer
            .flush()
            .map_err(|e| StateError::Write(path.to_path_buf(), e.to_string()))?;
        file.sync_data()
            .map_err(|e| StateError::Io(path.to_path_buf(), e))
    }
}

/// Get current UTC time in the manifest's timestamp format.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Errors that can occur with manifest persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read/write manifest {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock manifest {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse manifest {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write manifest {0}: {1}")]
    Write(PathBuf, String),
}
