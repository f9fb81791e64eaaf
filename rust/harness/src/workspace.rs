//! Run workspace materialization.
//!
//! A run lives in `<project>/runs/<run>/` and holds copies of the model,
//! dataset and optimization trees it references, the entry script, an
//! optional configuration document and `logs/run.log`.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::config::HarnessSettings;

/// Subdirectory of a project holding run workspaces.
pub const RUNS_DIR: &str = "runs";
/// Subdirectory of a run holding its log.
pub const LOGS_DIR: &str = "logs";
/// Log file name inside [`LOGS_DIR`].
pub const LOG_FILE: &str = "run.log";

/// Artifact trees a run is built from.
#[derive(Debug, Clone, Default)]
pub struct ArtifactRefs {
    pub model: String,
    pub dataset: String,
    /// Empty when the run uses no optimization.
    pub optimization: String,
}

impl ArtifactRefs {
    /// `(source category, destination category, name)` for each reference.
    fn sources(&self) -> [(&'static str, &'static str, &str); 3] {
        [
            ("models", "model", self.model.as_str()),
            ("datasets", "dataset", self.dataset.as_str()),
            ("optimizations", "optimization", self.optimization.as_str()),
        ]
    }
}

/// Builds and maintains run workspaces inside one project directory.
#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    project_dir: PathBuf,
    entry_script: String,
    config_file: String,
    package_marker: String,
}

impl WorkspaceBuilder {
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, settings: &HarnessSettings) -> Self {
        Self {
            project_dir: project_dir.into(),
            entry_script: settings.entry_script.clone(),
            config_file: settings.config_file.clone(),
            package_marker: settings.package_marker.clone(),
        }
    }

    #[must_use]
    pub fn entry_script_name(&self) -> &str {
        &self.entry_script
    }

    #[must_use]
    pub fn run_dir(&self, run: &str) -> PathBuf {
        self.project_dir.join(RUNS_DIR).join(run)
    }

    #[must_use]
    pub fn entry_script_path(&self, run: &str) -> PathBuf {
        self.run_dir(run).join(&self.entry_script)
    }

    #[must_use]
    pub fn config_path(&self, run: &str) -> PathBuf {
        self.run_dir(run).join(&self.config_file)
    }

    #[must_use]
    pub fn log_path(&self, run: &str) -> PathBuf {
        self.run_dir(run).join(LOGS_DIR).join(LOG_FILE)
    }

    #[must_use]
    pub fn exists(&self, run: &str) -> bool {
        self.run_dir(run).exists()
    }

    #[must_use]
    pub fn entry_script_exists(&self, run: &str) -> bool {
        self.entry_script_path(run).is_file()
    }

    /// Create the workspace for a new run.
    ///
    /// On failure the partially built directory is removed.
    pub fn create(
        &self,
        run: &str,
        refs: &ArtifactRefs,
        entry_script: &str,
        config: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError> {
        let run_dir = self.run_dir(run);
        if run_dir.exists() {
            return Err(WorkspaceError::AlreadyExists(run.to_string()));
        }

        let result = self.populate(&run_dir, refs, entry_script, config);
        if result.is_err()
            && let Err(e) = fs::remove_dir_all(&run_dir)
        {
            tracing::error!("Failed to clean up partial workspace {}: {e}", run_dir.display());
        }
        result.map(|()| run_dir)
    }

    fn populate(
        &self,
        run_dir: &Path,
        refs: &ArtifactRefs,
        entry_script: &str,
        config: Option<&str>,
    ) -> Result<(), WorkspaceError> {
        create_dir_all(&run_dir.join(LOGS_DIR))?;

        for (source_category, dest_category, name) in refs.sources() {
            if name.is_empty() {
                continue;
            }
            let src = self.project_dir.join(source_category).join(name);
            if !src.is_dir() {
                tracing::debug!("Skipping missing artifact {}", src.display());
                continue;
            }
            let dest_parent = run_dir.join(dest_category);
            copy_tree(&src, &dest_parent.join(name))?;
            if !self.package_marker.is_empty() {
                write_file(&dest_parent.join(&self.package_marker), "")?;
            }
        }

        write_file(&run_dir.join(&self.entry_script), entry_script)?;
        if let Some(config) = config.filter(|c| !c.trim().is_empty()) {
            write_file(&run_dir.join(&self.config_file), config)?;
        }
        Ok(())
    }

    /// Rename a workspace in place.
    pub fn rename(&self, run: &str, new_name: &str) -> Result<PathBuf, WorkspaceError> {
        let from = self.run_dir(run);
        let to = self.run_dir(new_name);
        if to.exists() {
            return Err(WorkspaceError::AlreadyExists(new_name.to_string()));
        }
        if !from.is_dir() {
            return Err(WorkspaceError::NotFound(run.to_string()));
        }
        fs::rename(&from, &to).map_err(|e| WorkspaceError::Io(from, e))?;
        Ok(to)
    }

    /// Remove a workspace. Absent workspaces are a no-op.
    pub fn destroy(&self, run: &str) -> Result<(), WorkspaceError> {
        let dir = self.run_dir(run);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::Io(dir, e)),
        }
    }

    pub fn write_entry_script(&self, run: &str, content: &str) -> Result<(), WorkspaceError> {
        write_file(&self.entry_script_path(run), content)
    }

    pub fn write_config(&self, run: &str, content: &str) -> Result<(), WorkspaceError> {
        write_file(&self.config_path(run), content)
    }

    /// Read the entry script or the configuration document.
    ///
    /// Any other file name is rejected so callers cannot reach arbitrary
    /// paths through the run directory.
    pub fn read_restricted_file(&self, run: &str, filename: &str) -> Result<String, WorkspaceError> {
        if filename != self.entry_script && filename != self.config_file {
            return Err(WorkspaceError::NotAllowed(filename.to_string()));
        }
        let path = self.run_dir(run).join(filename);
        match fs::read(&path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkspaceError::NotFound(
                format!("{filename} for run {run}"),
            )),
            Err(e) => Err(WorkspaceError::Io(path, e)),
        }
    }

    /// Log content as lines, malformed UTF-8 replaced.
    pub fn read_log(&self, run: &str) -> Result<Vec<String>, WorkspaceError> {
        let path = self.log_path(run);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(format!("log for run {run}")));
            }
            Err(e) => return Err(WorkspaceError::Io(path, e)),
        };
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .map(|line| line.trim_end().to_string())
            .collect())
    }

    /// Open the run log for appending, creating it if needed.
    pub fn open_log(&self, run: &str) -> Result<File, WorkspaceError> {
        let path = self.log_path(run);
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| WorkspaceError::Io(path, e))
    }

    pub fn append_log(&self, run: &str, text: &str) -> Result<(), WorkspaceError> {
        let mut file = self.open_log(run)?;
        file.write_all(text.as_bytes())
            .map_err(|e| WorkspaceError::Io(self.log_path(run), e))
    }

    /// Set `training.num_gpus` in the run's configuration document.
    ///
    /// Returns `Ok(false)` when there is no configuration or it is not a YAML
    /// mapping; such documents are left untouched.
    pub fn inject_device_count(&self, run: &str, count: usize) -> Result<bool, WorkspaceError> {
        let path = self.config_path(run);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(WorkspaceError::Io(path, e)),
        };

        let mut doc = match serde_yaml::from_str::<serde_yaml::Value>(&content) {
            Ok(serde_yaml::Value::Mapping(map)) => map,
            Ok(serde_yaml::Value::Null) => serde_yaml::Mapping::new(),
            Ok(_) => {
                tracing::warn!("{} is not a mapping, device count not injected", path.display());
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!("{} is not valid YAML ({e}), device count not injected", path.display());
                return Ok(false);
            }
        };

        let training = doc
            .entry("training".into())
            .or_insert(serde_yaml::Value::Null);
        if training.is_null() {
            *training = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        let serde_yaml::Value::Mapping(training) = training else {
            tracing::warn!(
                "`training` in {} is not a mapping, device count not injected",
                path.display()
            );
            return Ok(false);
        };
        training.insert("num_gpus".into(), serde_yaml::Value::from(count as u64));

        let rendered = serde_yaml::to_string(&doc)
            .map_err(|e| WorkspaceError::Config(path.clone(), e.to_string()))?;
        write_file(&path, &rendered)?;
        Ok(true)
    }
}

fn create_dir_all(path: &Path) -> Result<(), WorkspaceError> {
    fs::create_dir_all(path).map_err(|e| WorkspaceError::Io(path.to_path_buf(), e))
}

fn write_file(path: &Path, content: &str) -> Result<(), WorkspaceError> {
    fs::write(path, content).map_err(|e| WorkspaceError::Io(path.to_path_buf(), e))
}

/// Recursively copy `src` into `dst`, following symlinks to their targets.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            WorkspaceError::Io(path, e.into())
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .unwrap_or_else(|_| entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|e| WorkspaceError::Io(entry.path().to_path_buf(), e))?;
        }
    }
    Ok(())
}

/// Errors that can occur while manipulating workspaces.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace for run {0} already exists")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("file {0} is not readable through the harness")]
    NotAllowed(String),
    #[error("failed to update configuration {0}: {1}")]
    Config(PathBuf, String),
    #[error("filesystem error at {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
