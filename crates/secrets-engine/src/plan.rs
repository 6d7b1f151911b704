//! Builds the Launch Plan the Supervisor drives: one entry per configured
//! builtin, plus one entry per executable discovered in the plugin
//! directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrets_proto::PluginMetadata;
use secrets_runtime::launched::EngineParams;
use secrets_runtime::{BuiltinRuntime, EngineLaunchedRuntime, Plugin, PluginRuntime};
use secrets_supervisor::LaunchPlanItem;

/// A provider compiled straight into the engine binary.
pub struct BuiltinSpec {
    pub metadata: PluginMetadata,
    pub plugin: Arc<dyn Plugin>,
    pub shutdown_timeout: Duration,
}

/// Parameters shared by every engine-launched factory the plan builds.
#[derive(Clone)]
pub struct LaunchParams {
    pub registration_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub engine_name: String,
    pub engine_version: String,
    pub request_timeout: Duration,
}

pub fn builtin_plan_item(spec: BuiltinSpec) -> LaunchPlanItem {
    let name = spec.metadata.name().to_string();
    LaunchPlanItem::new(name, move || {
        let metadata = spec.metadata.clone();
        let plugin = spec.plugin.clone();
        let shutdown_timeout = spec.shutdown_timeout;
        async move {
            let runtime: Arc<dyn PluginRuntime> = Arc::new(BuiltinRuntime::new(metadata, plugin, shutdown_timeout));
            Ok(runtime)
        }
    })
}

/// Scan `dir` for plugin executables (regular files with an executable
/// bit on POSIX, or a `.exe` extension on Windows; sub-directories and
/// non-executables are ignored) and return one Launch Plan item per
/// entry found. A missing directory is logged and treated as empty.
pub fn scan_plugin_directory(dir: &Path, params: &LaunchParams) -> Vec<LaunchPlanItem> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("plugin directory {} is not readable: {e}", dir.display());
            return Vec::new();
        }
    };

    let mut items = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_plugin_executable(&path) {
            continue;
        }
        let Some(name) = plugin_name(&path) else {
            continue;
        };
        items.push(engine_launched_plan_item(name, path, params.clone()));
    }
    items
}

#[cfg(unix)]
fn is_plugin_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(windows)]
fn is_plugin_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("exe"))
            .unwrap_or(false),
        _ => false,
    }
}

fn plugin_name(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string())
}

pub fn engine_launched_plan_item(name: String, path: PathBuf, params: LaunchParams) -> LaunchPlanItem {
    LaunchPlanItem::new(name.clone(), move || {
        let path = path.clone();
        let name = name.clone();
        let params = params.clone();
        async move {
            let engine_params = EngineParams {
                engine_name: params.engine_name,
                engine_version: params.engine_version,
                request_timeout: params.request_timeout,
                expected_name: None,
            };
            let runtime = EngineLaunchedRuntime::spawn(
                path.to_str().ok_or("plugin path is not valid UTF-8")?,
                &[],
                &name,
                params.registration_timeout,
                params.shutdown_timeout,
                engine_params,
            )
            .await
            .map_err(|e| e.to_string())?;
            Ok(Arc::new(runtime) as Arc<dyn PluginRuntime>)
        }
    })
}
