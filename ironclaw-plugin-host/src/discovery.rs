//! Plugin discovery and directory scanning
//!
//! Plugins live at `<root>/<name>/<entry file>`, one module per directory.

use crate::loader::{LoaderError, PluginLoader};
use crate::wasm::WasmPlugin;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during plugin discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Failed to read directory: {0}")]
    ReadDirectory(#[source] std::io::Error),

    #[error("No plugin entry file in {0}")]
    MissingEntry(PathBuf),

    #[error("Multiple plugin entry files in {dir}: {found:?}")]
    AmbiguousEntry { dir: PathBuf, found: Vec<String> },

    #[error("Failed to load plugin {path}: {source}")]
    LoadPlugin {
        path: PathBuf,
        #[source]
        source: LoaderError,
    },

    #[error("Plugin at {path} declares name {declared:?}, expected {expected:?}")]
    NameMismatch {
        path: PathBuf,
        expected: String,
        declared: String,
    },
}

/// Result of plugin discovery
pub struct DiscoveryResult {
    /// Successfully loaded plugins
    pub plugins: Vec<WasmPlugin>,

    /// Plugin directories that failed to load (with errors)
    pub failures: Vec<(PathBuf, DiscoveryError)>,
}

impl DiscoveryResult {
    /// Returns true if all plugins loaded successfully
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of plugin directories found
    pub fn total_found(&self) -> usize {
        self.plugins.len() + self.failures.len()
    }
}

/// Plugin directory scanner
pub struct PluginScanner {
    loader: Arc<PluginLoader>,
    entry_files: Vec<String>,
}

impl PluginScanner {
    /// Create a scanner accepting the given entry file names
    pub fn new(loader: Arc<PluginLoader>, entry_files: Vec<String>) -> Self {
        Self {
            loader,
            entry_files,
        }
    }

    pub fn entry_files(&self) -> &[String] {
        &self.entry_files
    }

    /// Whether `file_name` is one of the accepted entry file names
    pub fn is_entry_file(&self, file_name: &str) -> bool {
        self.entry_files.iter().any(|entry| entry == file_name)
    }

    /// Locate the single entry file inside a plugin directory
    pub fn entry_path(&self, plugin_dir: &Path) -> Result<PathBuf, DiscoveryError> {
        let found: Vec<&String> = self
            .entry_files
            .iter()
            .filter(|entry| plugin_dir.join(entry).is_file())
            .collect();

        match found.as_slice() {
            [] => Err(DiscoveryError::MissingEntry(plugin_dir.to_path_buf())),
            [entry] => Ok(plugin_dir.join(entry)),
            _ => Err(DiscoveryError::AmbiguousEntry {
                dir: plugin_dir.to_path_buf(),
                found: found.into_iter().cloned().collect(),
            }),
        }
    }

    /// Scan a root directory; every subdirectory is a plugin candidate
    pub fn scan_directory(&self, dir: impl AsRef<Path>) -> Result<DiscoveryResult, DiscoveryError> {
        let dir = dir.as_ref();

        if !dir.is_dir() {
            return Err(DiscoveryError::DirectoryNotFound(dir.to_path_buf()));
        }

        let entries = std::fs::read_dir(dir).map_err(DiscoveryError::ReadDirectory)?;

        let mut candidates = Vec::new();
        let mut failures = Vec::new();

        for entry in entries {
            match entry {
                Ok(e) if e.path().is_dir() => candidates.push(e.path()),
                Ok(_) => {}
                Err(e) => failures.push((dir.to_path_buf(), DiscoveryError::ReadDirectory(e))),
            }
        }
        candidates.sort();

        let mut plugins = Vec::new();
        for plugin_dir in candidates {
            let Some(name) = plugin_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.load_plugin(name, &plugin_dir) {
                Ok(plugin) => plugins.push(plugin),
                // Directories without an entry file are not plugins.
                Err(DiscoveryError::MissingEntry(_)) => {}
                Err(e) => failures.push((plugin_dir.clone(), e)),
            }
        }

        Ok(DiscoveryResult { plugins, failures })
    }

    /// Load the plugin `name` from its directory
    pub fn load_plugin(&self, name: &str, plugin_dir: &Path) -> Result<WasmPlugin, DiscoveryError> {
        let path = self.entry_path(plugin_dir)?;

        let plugin =
            WasmPlugin::from_file(&self.loader, &path).map_err(|e| DiscoveryError::LoadPlugin {
                path: path.clone(),
                source: e,
            })?;

        let declared = crate::plugin::Plugin::name(&plugin);
        if declared != name {
            return Err(DiscoveryError::NameMismatch {
                path,
                expected: name.to_string(),
                declared: declared.to_string(),
            });
        }

        Ok(plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoaderConfig;
    use crate::testing::WatPlugin;
    use ironclaw_plugin_api::PluginDescriptor;
    use std::fs;
    use tempfile::TempDir;

    fn scanner() -> PluginScanner {
        let loader = Arc::new(PluginLoader::new(LoaderConfig::default()).unwrap());
        PluginScanner::new(
            loader,
            vec!["plugin.wasm".to_string(), "plugin.wat".to_string()],
        )
    }

    fn write_plugin(root: &Path, dir: &str, declared: &str) {
        let descriptor = PluginDescriptor::builder(declared, "1.0.0").build().unwrap();
        fs::create_dir_all(root.join(dir)).unwrap();
        fs::write(
            root.join(dir).join("plugin.wat"),
            WatPlugin::new(descriptor).render(),
        )
        .unwrap();
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp = TempDir::new().unwrap();
        let result = scanner().scan_directory(temp.path()).unwrap();
        assert!(result.plugins.is_empty());
        assert!(result.is_success());
    }

    #[test]
    fn test_scan_nonexistent_directory() {
        let result = scanner().scan_directory("/nonexistent/path/to/plugins");
        assert!(matches!(result, Err(DiscoveryError::DirectoryNotFound(_))));
    }

    #[test]
    fn test_scan_loads_plugins_and_isolates_failures() {
        let temp = TempDir::new().unwrap();
        write_plugin(temp.path(), "alpha", "alpha");
        write_plugin(temp.path(), "beta", "beta");
        fs::create_dir_all(temp.path().join("broken")).unwrap();
        fs::write(temp.path().join("broken/plugin.wat"), "(module").unwrap();
        fs::create_dir_all(temp.path().join("assets")).unwrap();
        fs::write(temp.path().join("readme.txt"), "not a plugin").unwrap();

        let result = scanner().scan_directory(temp.path()).unwrap();

        let names: Vec<&str> = result
            .plugins
            .iter()
            .map(|p| crate::plugin::Plugin::name(p))
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].0.ends_with("broken"));
        assert_eq!(result.total_found(), 3);
    }

    #[test]
    fn test_ambiguous_entry_files() {
        let temp = TempDir::new().unwrap();
        write_plugin(temp.path(), "twin", "twin");
        fs::copy(
            temp.path().join("twin/plugin.wat"),
            temp.path().join("twin/plugin.wasm"),
        )
        .unwrap();

        let err = scanner()
            .load_plugin("twin", &temp.path().join("twin"))
            .err()
            .unwrap();
        assert!(matches!(err, DiscoveryError::AmbiguousEntry { found, .. } if found.len() == 2));
    }

    #[test]
    fn test_name_must_match_directory() {
        let temp = TempDir::new().unwrap();
        write_plugin(temp.path(), "alias", "original");

        let err = scanner()
            .load_plugin("alias", &temp.path().join("alias"))
            .err()
            .unwrap();
        assert!(matches!(err, DiscoveryError::NameMismatch { declared, .. } if declared == "original"));
    }
}
