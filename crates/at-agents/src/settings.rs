//! Agent settings guard.
//!
//! Before an agent starts, the project's agent settings file is snapshotted
//! and rewritten with hooks that append JSONL heartbeat/progress lines to the
//! session's progress file. When the last session using the file ends the
//! snapshot is put back exactly, or the file is removed if it did not exist
//! before.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode settings for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SettingsError + '_ {
    move |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read the settings file. `None` when it does not exist.
pub fn snapshot_settings(settings_path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(settings_path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(settings_path)(e)),
    }
}

/// Write `original` merged with hooks for every file in `progress_files`.
pub fn write_hooks(
    settings_path: &Path,
    original: Option<&str>,
    progress_files: &[PathBuf],
) -> Result<()> {
    let merged = merge_hooks(original, progress_files);

    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let encoded = serde_json::to_string_pretty(&merged).map_err(|source| SettingsError::Encode {
        path: settings_path.to_path_buf(),
        source,
    })?;
    std::fs::write(settings_path, encoded).map_err(io_err(settings_path))
}

/// Put the settings file back to a snapshot taken by [`snapshot_settings`].
pub fn restore_settings(settings_path: &Path, original: Option<&str>) -> Result<()> {
    match original {
        Some(content) => std::fs::write(settings_path, content).map_err(io_err(settings_path)),
        None => match std::fs::remove_file(settings_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(settings_path)(e)),
        },
    }
}

/// Existing settings with progress hooks appended for each file.
///
/// Hooks already present are kept. Content that is not a JSON object is
/// replaced while hooks are installed; the raw snapshot still restores it.
pub fn merge_hooks(original: Option<&str>, progress_files: &[PathBuf]) -> Value {
    let mut root = match original.map(serde_json::from_str::<Value>) {
        Some(Ok(Value::Object(map))) => map,
        Some(_) => {
            warn!("agent settings are not a JSON object, overriding for this session");
            Map::new()
        }
        None => Map::new(),
    };

    let hooks = root
        .entry("hooks")
        .or_insert_with(|| Value::Object(Map::new()));
    if !hooks.is_object() {
        *hooks = Value::Object(Map::new());
    }
    if let Value::Object(hooks) = hooks {
        for progress_file in progress_files {
            let heartbeat = append_line_command(progress_file, &json!({"type": "heartbeat"}));
            let stopped = append_line_command(
                progress_file,
                &json!({"type": "progress", "message": "agent turn finished"}),
            );
            push_hook(hooks, "PostToolUse", heartbeat);
            push_hook(hooks, "Stop", stopped);
        }
    }

    Value::Object(root)
}

fn push_hook(hooks: &mut Map<String, Value>, event: &str, command: String) {
    let entry = json!({
        "matcher": "*",
        "hooks": [{ "type": "command", "command": command }],
    });
    match hooks.get_mut(event) {
        Some(Value::Array(list)) => list.push(entry),
        _ => {
            hooks.insert(event.to_string(), Value::Array(vec![entry]));
        }
    }
}

/// `printf` one JSON line onto the end of `file`.
fn append_line_command(file: &Path, line: &Value) -> String {
    format!(
        "printf '%s\\n' {} >> {}",
        shell_quote(&line.to_string()),
        shell_quote(&file.to_string_lossy())
    )
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// HookRegistry
// ---------------------------------------------------------------------------

struct SharedSettings {
    /// Content before the first session installed hooks.
    original: Option<String>,
    progress_files: Vec<PathBuf>,
}

/// Settings files currently carrying session hooks.
///
/// Overlapping sessions in one project share a settings file. The file is
/// snapshotted when the first session installs its hooks and restored only
/// when the last one releases them; in between it carries hooks for every
/// live session.
#[derive(Default)]
pub struct HookRegistry {
    files: Mutex<HashMap<PathBuf, SharedSettings>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, HashMap<PathBuf, SharedSettings>> {
        self.files.lock().unwrap_or_else(|e| {
            warn!("hook registry lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Add hooks reporting to `progress_file`.
    ///
    /// Returns the content the file had before any session touched it.
    pub fn install(&self, settings_path: &Path, progress_file: &Path) -> Result<Option<String>> {
        let mut files = self.files();
        let (original, mut progress_files) = match files.get(settings_path) {
            Some(shared) => (shared.original.clone(), shared.progress_files.clone()),
            None => (snapshot_settings(settings_path)?, Vec::new()),
        };
        progress_files.push(progress_file.to_path_buf());
        write_hooks(settings_path, original.as_deref(), &progress_files)?;

        debug!(
            path = %settings_path.display(),
            had_original = original.is_some(),
            sessions = progress_files.len(),
            "progress hooks installed"
        );
        files.insert(
            settings_path.to_path_buf(),
            SharedSettings {
                original: original.clone(),
                progress_files,
            },
        );
        Ok(original)
    }

    /// Drop the hooks for `progress_file`, restoring the snapshot once no
    /// session is left. Unknown paths are ignored.
    pub fn release(&self, settings_path: &Path, progress_file: &Path) -> Result<()> {
        let mut files = self.files();
        let Some(shared) = files.get_mut(settings_path) else {
            return Ok(());
        };
        shared.progress_files.retain(|p| p != progress_file);
        if !shared.progress_files.is_empty() {
            return write_hooks(
                settings_path,
                shared.original.as_deref(),
                &shared.progress_files,
            );
        }

        let original = shared.original.take();
        files.remove(settings_path);
        debug!(path = %settings_path.display(), "agent settings restored");
        restore_settings(settings_path, original.as_deref())
    }

    /// Number of sessions holding hooks in `settings_path`.
    pub fn holders(&self, settings_path: &Path) -> usize {
        self.files()
            .get(settings_path)
            .map_or(0, |s| s.progress_files.len())
    }
}
