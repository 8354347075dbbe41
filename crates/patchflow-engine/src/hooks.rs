//! Plugin lifecycle hooks
//!
//! A plugin may ship a `hooks.js` next to its entry module (complex
//! plugins) or shared in the project's `nodes/` directory (simple
//! plugins), with optional top-level `on_activate`, `on_deactivate` and
//! `on_uninstall` functions. Hooks are best-effort: a hook that raises is
//! logged and suppressed, and the lifecycle transition still takes effect.

use std::path::{Path, PathBuf};

use crate::loader::DiscoveredPlugin;
use crate::script;

pub const ON_ACTIVATE: &str = "on_activate";
pub const ON_DEACTIVATE: &str = "on_deactivate";
pub const ON_UNINSTALL: &str = "on_uninstall";

const HOOKS_MODULE: &str = "hooks.js";

/// Where a plugin's hooks module would live
pub fn hooks_path(plugin: &DiscoveredPlugin) -> PathBuf {
    if plugin.is_complex() {
        plugin.path.join(HOOKS_MODULE)
    } else {
        plugin
            .path
            .parent()
            .map(|dir| dir.join(HOOKS_MODULE))
            .unwrap_or_else(|| PathBuf::from(HOOKS_MODULE))
    }
}

/// Run a named hook if the plugin ships one. Missing files, missing
/// functions and raising hooks are all non-fatal.
pub fn run_hook(path: &Path, hook: &str) {
    if !path.exists() {
        return;
    }
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            log::warn!("cannot read hooks module {}: {e}", path.display());
            return;
        }
    };
    match script::call_hook(&source, hook) {
        Ok(true) => log::debug!("hook '{hook}' ran for {}", path.display()),
        Ok(false) => {}
        Err(e) => log::warn!("hook '{hook}' in {} failed: {e}", path.display()),
    }
}
