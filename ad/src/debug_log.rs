//! Process-labelled append-only debug log
//!
//! One log file per day under `$HOME/.adaf/debug/`; every line carries the
//! writer's label and pid so interleaved daemon/agent/client output stays
//! attributable. Children inherit the path via `ADAF_DEBUG_LOG` and
//! re-attach in append mode.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

/// Env var carrying the inherited log path
pub const DEBUG_LOG_ENV: &str = "ADAF_DEBUG_LOG";

/// A shared handle to the debug log
#[derive(Debug)]
pub struct DebugLog {
    label: String,
    path: PathBuf,
    file: Mutex<Option<fs::File>>,
}

impl DebugLog {
    /// Open (append mode) a debug log at an explicit path
    pub fn open(label: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = open_append(&path);
        Self {
            label: label.to_string(),
            path,
            file: Mutex::new(file),
        }
    }

    /// Resolve the log path: inherited env var, else today's file under `root/debug/`
    pub fn for_process(label: &str, global_root: &Path) -> Self {
        let path = std::env::var(DEBUG_LOG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                global_root
                    .join("debug")
                    .join(format!("{}.log", chrono::Utc::now().format("%Y-%m-%d")))
            });
        Self::open(label, path)
    }

    /// The path children should inherit
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; errors are swallowed after a warning
    pub fn log(&self, message: &str) {
        let line = format!(
            "{} [{} pid={}] {}\n",
            chrono::Utc::now().to_rfc3339(),
            self.label,
            std::process::id(),
            message
        );
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = open_append(&self.path);
        }
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(error = %e, "debug log write failed");
                *guard = None;
            }
        }
    }
}

fn open_append(path: &Path) -> Option<fs::File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!(error = %e, "cannot create debug log dir");
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "cannot open debug log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_lines_carry_label_and_pid() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("debug.log");
        let log = DebugLog::open("daemon-3", &path);

        log.log("loop started");
        log.log("loop finished");

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[daemon-3 pid="));
        assert!(lines[0].ends_with("loop started"));
    }

    #[test]
    fn test_reattach_appends() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("debug.log");

        DebugLog::open("first", &path).log("one");
        DebugLog::open("second", &path).log("two");

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    #[serial]
    fn test_env_var_inherits_path() {
        let temp = TempDir::new().unwrap();
        let inherited = temp.path().join("parent.log");
        unsafe { std::env::set_var(DEBUG_LOG_ENV, &inherited) };

        let log = DebugLog::for_process("child", temp.path());
        assert_eq!(log.path(), inherited.as_path());

        unsafe { std::env::remove_var(DEBUG_LOG_ENV) };
    }

    #[test]
    #[serial]
    fn test_default_path_is_dated() {
        unsafe { std::env::remove_var(DEBUG_LOG_ENV) };
        let temp = TempDir::new().unwrap();
        let log = DebugLog::for_process("cli", temp.path());
        let name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".log"));
        assert!(log.path().parent().unwrap().ends_with("debug"));
    }
}
