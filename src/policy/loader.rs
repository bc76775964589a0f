//! Policy module and data loading.
//!
//! Reads every `*.rego` file from the configured modules directory (test
//! modules excluded) plus a JSON data document, and installs both into the
//! engine. Data goes in first so modules compile against it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{Engine, PolicyError};

/// Loads rule modules and data from disk.
#[derive(Debug, Clone)]
pub struct Loader {
    modules_dir: PathBuf,
    data_file: PathBuf,
}

impl Loader {
    pub fn new(modules_dir: impl Into<PathBuf>, data_file: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            data_file: data_file.into(),
        }
    }

    /// Reads all non-test `*.rego` modules. Errors when the directory holds
    /// none: an enabled engine with zero modules would deny everything
    /// with `no_result`, which is never an intended deployment.
    pub fn load_modules(&self) -> Result<BTreeMap<String, String>, PolicyError> {
        let entries = std::fs::read_dir(&self.modules_dir).map_err(|e| PolicyError::Load {
            details: format!("{}: {e}", self.modules_dir.display()),
        })?;

        let mut modules = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| PolicyError::Load {
                details: e.to_string(),
            })?;
            let path = entry.path();
            if !is_policy_module(&path) {
                continue;
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content = std::fs::read_to_string(&path).map_err(|e| PolicyError::Load {
                details: format!("{}: {e}", path.display()),
            })?;

            debug!(file = %name, bytes = content.len(), "loaded policy module");
            modules.insert(name, content);
        }

        if modules.is_empty() {
            return Err(PolicyError::Load {
                details: format!("no .rego files found in {}", self.modules_dir.display()),
            });
        }

        info!(count = modules.len(), dir = %self.modules_dir.display(), "loaded policy modules");
        Ok(modules)
    }

    /// Reads the JSON data document.
    pub fn load_data(&self) -> Result<serde_json::Value, PolicyError> {
        let content = std::fs::read_to_string(&self.data_file).map_err(|e| PolicyError::Load {
            details: format!("{}: {e}", self.data_file.display()),
        })?;
        let data: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| PolicyError::Data {
                details: format!("{}: {e}", self.data_file.display()),
            })?;
        info!(file = %self.data_file.display(), "loaded policy data");
        Ok(data)
    }

    /// Loads data then modules into the engine.
    pub fn load_and_initialize(&self, engine: &Engine) -> Result<(), PolicyError> {
        let data = self.load_data()?;
        engine.replace_data(data)?;
        engine.load_modules(self.load_modules()?)?;
        Ok(())
    }
}

fn is_policy_module(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "rego")
        && !path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().ends_with("_test.rego"))
}
