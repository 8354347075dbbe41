//! Plugin tree discovery and the activation state file
//!
//! Plugins live in a two-tier tree:
//!
//! ```text
//! <root>/<project>/manifest.json
//! <root>/<project>/nodes/<plugin>.js          simple plugin
//! <root>/<project>/nodes/<plugin>/index.js    complex plugin
//! <root>/<project>/nodes/<plugin>/manifest.json   optional overrides
//! ```
//!
//! The plugin id is `"<project>/<plugin>"`. A project manifest supplies
//! defaults; a complex plugin's own manifest shallow-overrides them.
//!
//! `plugins_state.json` at the root records non-default states as
//! `plugin_id -> "inactive"`; a missing entry means active. Writes are
//! write-then-rename atomic, and a corrupt file is treated as empty.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// Name of the state file kept at the plugin tree root
pub const STATE_FILE: &str = "plugins_state.json";

/// The only non-default state value
pub const STATE_INACTIVE: &str = "inactive";

const PROJECT_MANIFEST: &str = "manifest.json";
const ENTRY_MODULE: &str = "index.js";

/// A plugin found on disk, before its module is evaluated
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// `"<project>/<plugin>"`
    pub id: String,
    pub project: String,
    pub name: String,
    /// The file or directory that constitutes the plugin
    pub path: PathBuf,
    /// The module to evaluate
    pub entry: PathBuf,
    /// Project manifest with plugin-level overrides applied
    pub manifest: Map<String, Value>,
}

impl DiscoveredPlugin {
    /// Whether the plugin is a directory with an entry module
    pub fn is_complex(&self) -> bool {
        self.path.is_dir()
    }
}

/// A project or plugin that could not be read during discovery
#[derive(Debug, Clone)]
pub struct ScanFailure {
    /// Plugin id, or the project name for project-level failures
    pub id: String,
    pub message: String,
}

/// Result of scanning the plugin tree
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub plugins: Vec<DiscoveredPlugin>,
    pub failures: Vec<ScanFailure>,
}

/// Scan the plugin tree. A missing root yields an empty outcome; a broken
/// project or plugin is recorded as a failure and never aborts the scan.
pub fn scan(root: &Path) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    let Ok(entries) = fs::read_dir(root) else {
        return outcome;
    };

    let mut projects: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    projects.sort();

    for project_dir in projects {
        let manifest_path = project_dir.join(PROJECT_MANIFEST);
        if !manifest_path.exists() {
            continue;
        }
        let project = dir_name(&project_dir);
        let manifest = match read_manifest(&manifest_path) {
            Ok(m) => m,
            Err(message) => {
                outcome.failures.push(ScanFailure {
                    id: project,
                    message,
                });
                continue;
            }
        };
        scan_project(&project_dir, &project, &manifest, &mut outcome);
    }
    outcome
}

fn scan_project(
    project_dir: &Path,
    project: &str,
    manifest: &Map<String, Value>,
    outcome: &mut ScanOutcome,
) {
    let nodes_dir = project_dir.join("nodes");
    let Ok(entries) = fs::read_dir(&nodes_dir) else {
        return;
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    for path in paths {
        match discover_at(&path, project, manifest) {
            Ok(Some(plugin)) => outcome.plugins.push(plugin),
            Ok(None) => {}
            Err((id, message)) => outcome.failures.push(ScanFailure { id, message }),
        }
    }
}

/// Interpret one entry of a project's `nodes/` directory
fn discover_at(
    path: &Path,
    project: &str,
    project_manifest: &Map<String, Value>,
) -> Result<Option<DiscoveredPlugin>, (String, String)> {
    if path.is_file() {
        if path.extension().and_then(|e| e.to_str()) != Some("js") {
            return Ok(None);
        }
        let name = stem_name(path);
        if name.starts_with('_') || name == "hooks" {
            return Ok(None);
        }
        return Ok(Some(DiscoveredPlugin {
            id: format!("{project}/{name}"),
            project: project.to_string(),
            name,
            path: path.to_path_buf(),
            entry: path.to_path_buf(),
            manifest: project_manifest.clone(),
        }));
    }

    if path.is_dir() {
        let entry = path.join(ENTRY_MODULE);
        if !entry.exists() {
            return Ok(None);
        }
        let name = dir_name(path);
        let id = format!("{project}/{name}");

        let mut manifest = project_manifest.clone();
        let override_path = path.join(PROJECT_MANIFEST);
        if override_path.exists() {
            let overrides =
                read_manifest(&override_path).map_err(|message| (id.clone(), message))?;
            manifest.extend(overrides);
        }

        return Ok(Some(DiscoveredPlugin {
            id,
            project: project.to_string(),
            name,
            path: path.to_path_buf(),
            entry,
            manifest,
        }));
    }

    Ok(None)
}

/// Resolve a single plugin id against the tree without a full scan
pub fn resolve(root: &Path, plugin_id: &str) -> Option<DiscoveredPlugin> {
    let (project, name) = plugin_id.split_once('/')?;
    let project_dir = root.join(project);
    let manifest = read_manifest(&project_dir.join(PROJECT_MANIFEST)).unwrap_or_default();

    let file = project_dir.join("nodes").join(format!("{name}.js"));
    if file.is_file() {
        return discover_at(&file, project, &manifest).ok().flatten();
    }
    let dir = project_dir.join("nodes").join(name);
    if dir.is_dir() {
        return discover_at(&dir, project, &manifest).ok().flatten();
    }
    None
}

fn read_manifest(path: &Path) -> Result<Map<String, Value>, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| format!("malformed manifest at {}: {e}", path.display()))?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| format!("manifest at {} is not an object", path.display()))
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn stem_name(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Read the state file. Absent or corrupt files are treated as empty;
/// corruption is logged.
pub fn read_state(root: &Path) -> BTreeMap<String, String> {
    let path = root.join(STATE_FILE);
    let Ok(raw) = fs::read_to_string(&path) else {
        return BTreeMap::new();
    };
    match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(e) => {
            log::warn!("corrupt state file {}: {e}; treating as empty", path.display());
            BTreeMap::new()
        }
    }
}

/// Write the state file atomically (write to a sibling, then rename)
pub fn write_state(root: &Path, state: &BTreeMap<String, String>) -> std::io::Result<()> {
    let path = root.join(STATE_FILE);
    let tmp = root.join(format!("{STATE_FILE}.tmp"));
    let body = serde_json::to_vec_pretty(state).expect("string map always serializes");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_project(root: &Path, project: &str, manifest: Value) {
        let dir = root.join(project);
        fs::create_dir_all(dir.join("nodes")).unwrap();
        fs::write(dir.join(PROJECT_MANIFEST), manifest.to_string()).unwrap();
    }

    fn write_simple_plugin(root: &Path, project: &str, name: &str, source: &str) {
        fs::write(
            root.join(project).join("nodes").join(format!("{name}.js")),
            source,
        )
        .unwrap();
    }

    #[test]
    fn test_scan_two_tier_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        write_project(root, "sorting", json!({"name": "sorting", "version": "1.0.0"}));
        write_simple_plugin(root, "sorting", "bubble_pass", "// node");
        write_simple_plugin(root, "sorting", "generate_array", "// node");

        // Complex plugin with its own manifest
        let complex = root.join("sorting").join("nodes").join("two_opt");
        fs::create_dir_all(&complex).unwrap();
        fs::write(complex.join(ENTRY_MODULE), "// entry").unwrap();
        fs::write(
            complex.join(PROJECT_MANIFEST),
            json!({"version": "2.0.0"}).to_string(),
        )
        .unwrap();

        let outcome = scan(root);
        assert!(outcome.failures.is_empty());

        let ids: Vec<&str> = outcome.plugins.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "sorting/bubble_pass",
                "sorting/generate_array",
                "sorting/two_opt"
            ]
        );

        let two_opt = &outcome.plugins[2];
        assert!(two_opt.is_complex());
        assert_eq!(two_opt.manifest["version"], "2.0.0");
        assert_eq!(two_opt.manifest["name"], "sorting");

        let simple = &outcome.plugins[0];
        assert!(!simple.is_complex());
        assert_eq!(simple.manifest["version"], "1.0.0");
    }

    #[test]
    fn test_scan_skips_underscore_and_hooks_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_project(root, "p", json!({"name": "p"}));
        write_simple_plugin(root, "p", "_helpers", "// not a plugin");
        write_simple_plugin(root, "p", "hooks", "// shared hooks");
        write_simple_plugin(root, "p", "real", "// node");

        let outcome = scan(root);
        let ids: Vec<&str> = outcome.plugins.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p/real"]);
    }

    #[test]
    fn test_scan_records_manifest_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let dir = root.join("broken");
        fs::create_dir_all(dir.join("nodes")).unwrap();
        fs::write(dir.join(PROJECT_MANIFEST), "{not json").unwrap();

        write_project(root, "good", json!({"name": "good"}));
        write_simple_plugin(root, "good", "node_a", "// node");

        let outcome = scan(root);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].id, "broken");
        assert_eq!(outcome.plugins.len(), 1);
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let outcome = scan(Path::new("/definitely/not/here"));
        assert!(outcome.plugins.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn test_resolve_single_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_project(root, "tsp", json!({"name": "tsp"}));
        write_simple_plugin(root, "tsp", "greedy", "// node");

        let plugin = resolve(root, "tsp/greedy").unwrap();
        assert_eq!(plugin.id, "tsp/greedy");
        assert!(resolve(root, "tsp/missing").is_none());
        assert!(resolve(root, "not-an-id").is_none());
    }

    #[test]
    fn test_state_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        assert!(read_state(root).is_empty());

        let mut state = BTreeMap::new();
        state.insert("sorting/bubble_pass".to_string(), STATE_INACTIVE.to_string());
        write_state(root, &state).unwrap();

        let read_back = read_state(root);
        assert_eq!(read_back.get("sorting/bubble_pass").unwrap(), STATE_INACTIVE);

        // No leftover temp file from the atomic write
        assert!(!root.join(format!("{STATE_FILE}.tmp")).exists());
    }

    #[test]
    fn test_corrupt_state_file_treated_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join(STATE_FILE), "{{{{").unwrap();
        assert!(read_state(root).is_empty());
    }
}
