//! Node type registry with plugin lifecycle
//!
//! The registry owns the authoritative mapping from node type to
//! (spec, executor). Entries come from three places:
//!
//! 1. Built-in loop construct specs, installed at construction and never
//!    removed (they are spec-only; the executor drives them directly)
//! 2. Plugin modules discovered from the two-tier tree on disk
//! 3. Native registrations from the embedding host
//!
//! All public operations serialize on a single mutex, so a `snapshot()`
//! observes either the pre- or post-state of any transition, never a torn
//! one. Executions hold the snapshot they started with; later registry
//! mutations cannot perturb an in-flight run.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use patchflow_core::events::LogLevel;
use patchflow_core::spec::{NodeSpec, PortSpec};
use patchflow_core::value::PortValues;
use serde_json::{Map, Value};

use crate::error::{NodeRunError, RegistryError};
use crate::hooks;
use crate::loader::{self, DiscoveredPlugin};
use crate::script::ScriptModule;

pub const LOOP_GROUP: &str = "loop_group";
pub const LOOP_START: &str = "loop_start";
pub const LOOP_END: &str = "loop_end";
pub const LOOP_NODE: &str = "loop_node";

/// The loop construct types the executor drives itself
pub const LOOP_TYPES: [&str; 4] = [LOOP_GROUP, LOOP_START, LOOP_END, LOOP_NODE];

pub fn is_loop_type(node_type: &str) -> bool {
    LOOP_TYPES.contains(&node_type)
}

/// A log line captured from a node executor, surfaced as a `log` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

/// Per-node-type executor: the uniform `(params, inputs) -> outputs`
/// contract every node implementation is adapted to.
///
/// Executors are synchronous and treated as atomic; the engine never
/// interrupts one mid-run.
pub trait NodeExecutor: Send + Sync {
    fn execute(
        &self,
        params: &Map<String, Value>,
        inputs: &PortValues,
        logs: &mut Vec<LogLine>,
    ) -> Result<PortValues, NodeRunError>;
}

/// Executor backed by a plugin's script module
pub struct ScriptNodeExecutor {
    module: ScriptModule,
    spec: Arc<NodeSpec>,
}

impl ScriptNodeExecutor {
    pub fn new(module: ScriptModule, spec: Arc<NodeSpec>) -> Self {
        Self { module, spec }
    }
}

impl NodeExecutor for ScriptNodeExecutor {
    fn execute(
        &self,
        params: &Map<String, Value>,
        inputs: &PortValues,
        logs: &mut Vec<LogLine>,
    ) -> Result<PortValues, NodeRunError> {
        let mut raw_logs = Vec::new();
        let result = self.module.invoke(&self.spec, params, inputs, &mut raw_logs);
        logs.extend(
            raw_logs
                .into_iter()
                .map(|(level, message)| LogLine { level, message }),
        );
        result.map_err(NodeRunError::from)
    }
}

/// Executor wrapping a host-side closure, for embedders and tests
pub struct CallbackNodeExecutor {
    #[allow(clippy::type_complexity)]
    callback: Box<
        dyn Fn(&Map<String, Value>, &PortValues) -> Result<PortValues, NodeRunError>
            + Send
            + Sync,
    >,
}

impl CallbackNodeExecutor {
    pub fn new(
        callback: impl Fn(&Map<String, Value>, &PortValues) -> Result<PortValues, NodeRunError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl NodeExecutor for CallbackNodeExecutor {
    fn execute(
        &self,
        params: &Map<String, Value>,
        inputs: &PortValues,
        _logs: &mut Vec<LogLine>,
    ) -> Result<PortValues, NodeRunError> {
        (self.callback)(params, inputs)
    }
}

/// Lifecycle state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Loaded; its node types are in the registry
    Ok,
    /// Present on disk but failed to load
    Error,
    /// Present on disk but deactivated; module not loaded
    Inactive,
}

/// What the registry knows about one plugin, for the plugin manager UI
#[derive(Debug, Clone, serde::Serialize)]
pub struct PluginRecord {
    pub id: String,
    pub project: String,
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub manifest: Map<String, Value>,
    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub node_types: Vec<String>,
}

struct RegistryEntry {
    spec: Arc<NodeSpec>,
    executor: Option<Arc<dyn NodeExecutor>>,
    /// Owning plugin id; `None` for built-ins and native registrations
    owner: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, RegistryEntry>,
    plugins: BTreeMap<String, PluginRecord>,
    /// Node types removed by deactivation, keyed to their owning plugin.
    /// Lets the executor tell "inactive" apart from "unknown".
    inactive_types: HashMap<String, String>,
}

/// Immutable view of the registry, taken at execution start
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    specs: HashMap<String, Arc<NodeSpec>>,
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
    inactive_types: HashMap<String, String>,
}

impl RegistrySnapshot {
    pub fn spec(&self, node_type: &str) -> Option<&Arc<NodeSpec>> {
        self.specs.get(node_type)
    }

    pub fn executor(&self, node_type: &str) -> Option<&Arc<dyn NodeExecutor>> {
        self.executors.get(node_type)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.specs.contains_key(node_type)
    }

    /// The plugin that owned this node type before being deactivated
    pub fn inactive_owner(&self, node_type: &str) -> Option<&str> {
        self.inactive_types.get(node_type).map(String::as_str)
    }

    pub fn node_types(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }
}

/// The registry. Cheap to share behind an `Arc`; all operations take
/// `&self`.
pub struct PluginRegistry {
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl PluginRegistry {
    /// Create a registry rooted at the given plugin tree. Built-in loop
    /// specs are installed; call [`reload`](Self::reload) to discover
    /// plugins from disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut inner = Inner::default();
        install_builtins(&mut inner);
        Self {
            root: root.into(),
            inner: Mutex::new(inner),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drop all plugin-sourced entries and re-run discovery. Built-ins
    /// and native registrations survive.
    pub fn reload(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|_, e| e.owner.is_none());
        inner.plugins.clear();
        self.load_all(&mut inner);
    }

    /// Atomic read of the current (type -> spec, type -> executor) maps
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().unwrap();
        RegistrySnapshot {
            specs: inner
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.spec.clone()))
                .collect(),
            executors: inner
                .entries
                .iter()
                .filter_map(|(k, e)| e.executor.clone().map(|ex| (k.clone(), ex)))
                .collect(),
            inactive_types: inner.inactive_types.clone(),
        }
    }

    /// Register a host-compiled node implementation
    pub fn register_native(&self, spec: NodeSpec, executor: Arc<dyn NodeExecutor>) {
        let mut inner = self.inner.lock().unwrap();
        let node_type = spec.node_type.clone();
        if inner.entries.contains_key(&node_type) {
            log::warn!("duplicate node type '{node_type}' - overwriting previous registration");
        }
        inner.entries.insert(
            node_type,
            RegistryEntry {
                spec: Arc::new(spec),
                executor: Some(executor),
                owner: None,
            },
        );
    }

    /// Register a spec without an executor (container-only or
    /// palette-only types)
    pub fn register_spec(&self, spec: NodeSpec) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            spec.node_type.clone(),
            RegistryEntry {
                spec: Arc::new(spec),
                executor: None,
                owner: None,
            },
        );
    }

    /// Remove the inactive marker, load the plugin's module and run its
    /// `on_activate` hook. Idempotent on an already-active plugin. Fails
    /// if the plugin does not exist on disk.
    pub fn activate(&self, plugin_id: &str) -> Result<(), RegistryError> {
        check_id(plugin_id)?;
        let plugin = loader::resolve(&self.root, plugin_id)
            .ok_or_else(|| RegistryError::PluginNotFound(plugin_id.to_string()))?;

        let mut inner = self.inner.lock().unwrap();
        let mut state = loader::read_state(&self.root);
        if state.remove(plugin_id).is_some() {
            loader::write_state(&self.root, &state)?;
        }

        let record = self.load_plugin(&mut inner, &plugin);
        let failed = record.error.clone();
        inner.plugins.insert(plugin.id.clone(), record);
        if let Some(message) = failed {
            return Err(RegistryError::Script(crate::error::ScriptError::Eval(
                message,
            )));
        }

        hooks::run_hook(&hooks::hooks_path(&plugin), hooks::ON_ACTIVATE);
        Ok(())
    }

    /// Mark the plugin inactive, remove its node types from the registry
    /// and run its `on_deactivate` hook. Idempotent on an
    /// already-inactive plugin.
    pub fn deactivate(&self, plugin_id: &str) -> Result<(), RegistryError> {
        check_id(plugin_id)?;
        let plugin = loader::resolve(&self.root, plugin_id)
            .ok_or_else(|| RegistryError::PluginNotFound(plugin_id.to_string()))?;

        let mut inner = self.inner.lock().unwrap();
        let mut state = loader::read_state(&self.root);
        state.insert(plugin_id.to_string(), loader::STATE_INACTIVE.to_string());
        loader::write_state(&self.root, &state)?;

        let removed = remove_owned(&mut inner, plugin_id);
        for node_type in &removed {
            inner
                .inactive_types
                .insert(node_type.clone(), plugin_id.to_string());
        }

        let node_types = owned_inactive_types(&inner, plugin_id);
        inner.plugins.insert(
            plugin.id.clone(),
            PluginRecord {
                id: plugin.id.clone(),
                project: plugin.project.clone(),
                name: plugin.name.clone(),
                path: plugin.path.clone(),
                manifest: plugin.manifest.clone(),
                status: PluginStatus::Inactive,
                error: None,
                node_types,
            },
        );

        hooks::run_hook(&hooks::hooks_path(&plugin), hooks::ON_DEACTIVATE);
        Ok(())
    }

    /// Run `on_uninstall`, remove the plugin's files and purge its state
    /// entry. Requires the plugin to be inactive.
    pub fn delete(&self, plugin_id: &str) -> Result<(), RegistryError> {
        check_id(plugin_id)?;
        let plugin = loader::resolve(&self.root, plugin_id)
            .ok_or_else(|| RegistryError::PluginNotFound(plugin_id.to_string()))?;

        let mut inner = self.inner.lock().unwrap();
        let mut state = loader::read_state(&self.root);
        if state.get(plugin_id).map(String::as_str) != Some(loader::STATE_INACTIVE) {
            return Err(RegistryError::PluginActive(plugin_id.to_string()));
        }

        hooks::run_hook(&hooks::hooks_path(&plugin), hooks::ON_UNINSTALL);

        if plugin.is_complex() {
            std::fs::remove_dir_all(&plugin.path)?;
        } else {
            std::fs::remove_file(&plugin.path)?;
        }

        state.remove(plugin_id);
        loader::write_state(&self.root, &state)?;

        inner.plugins.remove(plugin_id);
        inner.inactive_types.retain(|_, owner| owner != plugin_id);
        Ok(())
    }

    /// Activate every plugin of a project
    pub fn activate_project(&self, project: &str) -> Result<(), RegistryError> {
        for id in self.project_plugin_ids(project)? {
            self.activate(&id)?;
        }
        Ok(())
    }

    /// Deactivate every plugin of a project
    pub fn deactivate_project(&self, project: &str) -> Result<(), RegistryError> {
        for id in self.project_plugin_ids(project)? {
            self.deactivate(&id)?;
        }
        Ok(())
    }

    /// Per-plugin records, for the plugin manager listing
    pub fn plugins(&self) -> Vec<PluginRecord> {
        self.inner.lock().unwrap().plugins.values().cloned().collect()
    }

    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(node_type)
    }

    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.lock().unwrap().entries.keys().cloned().collect();
        types.sort();
        types
    }

    fn project_plugin_ids(&self, project: &str) -> Result<Vec<String>, RegistryError> {
        let ids: Vec<String> = loader::scan(&self.root)
            .plugins
            .into_iter()
            .filter(|p| p.project == project)
            .map(|p| p.id)
            .collect();
        if ids.is_empty() {
            return Err(RegistryError::ProjectNotFound(project.to_string()));
        }
        Ok(ids)
    }

    fn load_all(&self, inner: &mut Inner) {
        let outcome = loader::scan(&self.root);
        let state = loader::read_state(&self.root);

        for failure in outcome.failures {
            log::warn!("plugin scan failure for '{}': {}", failure.id, failure.message);
            let (project, name) = failure
                .id
                .split_once('/')
                .unwrap_or((failure.id.as_str(), ""));
            inner.plugins.insert(
                failure.id.clone(),
                PluginRecord {
                    id: failure.id.clone(),
                    project: project.to_string(),
                    name: name.to_string(),
                    path: self.root.join(&failure.id),
                    manifest: Map::new(),
                    status: PluginStatus::Error,
                    error: Some(failure.message),
                    node_types: Vec::new(),
                },
            );
        }

        for plugin in outcome.plugins {
            if state.get(&plugin.id).map(String::as_str) == Some(loader::STATE_INACTIVE) {
                let node_types = owned_inactive_types(inner, &plugin.id);
                inner.plugins.insert(
                    plugin.id.clone(),
                    PluginRecord {
                        id: plugin.id.clone(),
                        project: plugin.project.clone(),
                        name: plugin.name.clone(),
                        path: plugin.path.clone(),
                        manifest: plugin.manifest.clone(),
                        status: PluginStatus::Inactive,
                        error: None,
                        node_types,
                    },
                );
                continue;
            }
            let record = self.load_plugin(inner, &plugin);
            inner.plugins.insert(plugin.id.clone(), record);
        }
    }

    /// Evaluate one plugin module and install its declaration. Failures
    /// are captured on the returned record, never propagated, so sibling
    /// plugins keep loading.
    fn load_plugin(&self, inner: &mut Inner, plugin: &DiscoveredPlugin) -> PluginRecord {
        let mut record = PluginRecord {
            id: plugin.id.clone(),
            project: plugin.project.clone(),
            name: plugin.name.clone(),
            path: plugin.path.clone(),
            manifest: plugin.manifest.clone(),
            status: PluginStatus::Ok,
            error: None,
            node_types: Vec::new(),
        };

        let source = match std::fs::read_to_string(&plugin.entry) {
            Ok(source) => source,
            Err(e) => {
                record.status = PluginStatus::Error;
                record.error = Some(e.to_string());
                return record;
            }
        };

        let module = ScriptModule::new(source);
        let (spec, has_run) = match module.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                log::warn!("plugin '{}' failed to load: {e}", plugin.id);
                record.status = PluginStatus::Error;
                record.error = Some(e.to_string());
                return record;
            }
        };

        let node_type = spec.node_type.clone();
        if inner.entries.contains_key(&node_type) {
            log::warn!("duplicate node type '{node_type}' - overwriting previous registration");
        }

        let spec = Arc::new(spec);
        let executor: Option<Arc<dyn NodeExecutor>> = has_run
            .then(|| Arc::new(ScriptNodeExecutor::new(module, spec.clone())) as Arc<dyn NodeExecutor>);

        inner.entries.insert(
            node_type.clone(),
            RegistryEntry {
                spec,
                executor,
                owner: Some(plugin.id.clone()),
            },
        );
        inner.inactive_types.remove(&node_type);
        record.node_types.push(node_type);
        record
    }
}

fn check_id(plugin_id: &str) -> Result<(), RegistryError> {
    if plugin_id.split('/').count() == 2 && !plugin_id.starts_with('/') && !plugin_id.ends_with('/')
    {
        Ok(())
    } else {
        Err(RegistryError::MalformedId(plugin_id.to_string()))
    }
}

fn remove_owned(inner: &mut Inner, plugin_id: &str) -> Vec<String> {
    let removed: Vec<String> = inner
        .entries
        .iter()
        .filter(|(_, e)| e.owner.as_deref() == Some(plugin_id))
        .map(|(k, _)| k.clone())
        .collect();
    for node_type in &removed {
        inner.entries.remove(node_type);
    }
    removed
}

fn owned_inactive_types(inner: &Inner, plugin_id: &str) -> Vec<String> {
    let mut types: Vec<String> = inner
        .inactive_types
        .iter()
        .filter(|(_, owner)| owner.as_str() == plugin_id)
        .map(|(t, _)| t.clone())
        .collect();
    types.sort();
    types
}

/// Specs for the loop construct types. They carry no executor; the
/// scheduler recognizes them by type name and drives the iteration
/// itself. Ports beyond the declared banks follow naming conventions, so
/// the validator skips port-existence checks for these types.
fn install_builtins(inner: &mut Inner) {
    let loop_group = NodeSpec::new(LOOP_GROUP, "Loop Group", "CONTROL")
        .with_input(PortSpec::optional("slot_1", "ARRAY"))
        .with_input(PortSpec::optional("slot_2", "ARRAY"))
        .with_input(PortSpec::optional("slot_3", "ARRAY"))
        .with_input(PortSpec::optional("slot_4", "NUMBER"))
        .with_input(PortSpec::optional("iterations", "NUMBER").with_default(10))
        .with_output(PortSpec::optional("slot_1", "ARRAY"))
        .with_output(PortSpec::optional("slot_2", "ARRAY"))
        .with_output(PortSpec::optional("slot_3", "ARRAY"))
        .with_output(PortSpec::optional("slot_4", "NUMBER"));

    let loop_start = NodeSpec::new(LOOP_START, "Loop Start", "CONTROL")
        .with_input(PortSpec::required("in_1", "ARRAY"))
        .with_input(PortSpec::optional("in_2", "ARRAY"))
        .with_input(PortSpec::optional("in_3", "ARRAY"))
        .with_input(PortSpec::optional("iterations", "NUMBER").with_default(10))
        .with_output(PortSpec::optional("out_1", "ARRAY"))
        .with_output(PortSpec::optional("out_2", "ARRAY"))
        .with_output(PortSpec::optional("out_3", "ARRAY"));

    let loop_end = NodeSpec::new(LOOP_END, "Loop End", "CONTROL")
        .with_input(PortSpec::optional("in_1", "ARRAY"))
        .with_input(PortSpec::optional("in_2", "ARRAY"))
        .with_input(PortSpec::optional("in_3", "ARRAY"))
        .with_output(PortSpec::optional("out_1", "ARRAY"))
        .with_output(PortSpec::optional("out_2", "ARRAY"))
        .with_output(PortSpec::optional("out_3", "ARRAY"));

    let loop_node = NodeSpec::new(LOOP_NODE, "Loop", "CONTROL")
        .with_input(PortSpec::required("init_1", "ARRAY"))
        .with_input(PortSpec::optional("init_2", "ARRAY"))
        .with_input(PortSpec::optional("init_3", "ARRAY"))
        .with_input(PortSpec::optional("feedback_1", "ARRAY"))
        .with_input(PortSpec::optional("feedback_2", "ARRAY"))
        .with_input(PortSpec::optional("feedback_3", "ARRAY"))
        .with_input(PortSpec::optional("iterations", "NUMBER").with_default(10))
        .with_output(PortSpec::optional("loop_1", "ARRAY"))
        .with_output(PortSpec::optional("loop_2", "ARRAY"))
        .with_output(PortSpec::optional("loop_3", "ARRAY"))
        .with_output(PortSpec::optional("done_1", "ARRAY"))
        .with_output(PortSpec::optional("done_2", "ARRAY"))
        .with_output(PortSpec::optional("done_3", "ARRAY"));

    for spec in [loop_group, loop_start, loop_end, loop_node] {
        inner.entries.insert(
            spec.node_type.clone(),
            RegistryEntry {
                spec: Arc::new(spec),
                executor: None,
                owner: None,
            },
        );
    }
}
