//! Configuration loading and validation for devdash services
//!
//! The services file is TOML. Loading is a sequence of passes over the raw
//! `toml::Value` before anything is deserialized:
//!
//! 1. `${name}` references in string values are replaced from `[variables]`
//!    and the environment.
//! 2. An entry named `defaults` (or `default`) is a template: its keys are
//!    copied into every other entry that does not set them, and it is then
//!    dropped from the list.
//! 3. The result is deserialized into [`ServicesConfig`] and validated with
//!    field-path error messages.
//! 4. Members of a group inherit the group's restart command.

use crate::utilities::{natural_cmp, replace_variables};
use crate::{CoreError, Result};
use regex::Regex;
use schema::{ServiceSpec, ServicesConfig};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;
use tracing::debug;

static DEFAULTS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^defaults?$").expect("defaults name pattern"));

/// A loaded and validated services file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
    /// Dashboard port
    pub port: u16,
    /// Base directory for relative paths in service definitions
    pub root: PathBuf,
    /// Variables after substitution
    pub variables: BTreeMap<String, String>,
    /// Service definitions in file order, without the defaults template
    pub services: Vec<ServiceSpec>,
}

/// Load services from a TOML file path; relative roots resolve against the
/// file's directory
pub fn load_services_from_toml_path(path: impl AsRef<Path>) -> Result<LoadedConfig> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path, e))
    })?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    load_services_from_toml_str(&data, &base)
}

/// Load services from a TOML string
pub fn load_services_from_toml_str(input: &str, base_dir: &Path) -> Result<LoadedConfig> {
    let mut value: toml::Value = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;

    let variables = read_variables(&value)?;
    substitute(&mut value, &variables);
    apply_defaults(&mut value)?;

    let config: ServicesConfig = value
        .try_into()
        .map_err(|e| CoreError::ConfigurationError(format!("Invalid services file: {}", e)))?;
    validate(&config)?;

    let root = match config.root.as_deref() {
        Some(root) if Path::new(root).is_absolute() => PathBuf::from(root),
        Some(root) => base_dir.join(root),
        None => base_dir.to_path_buf(),
    };
    let mut services = config.services;
    propagate_group_settings(&mut services);
    debug!("Loaded {} service definitions", services.len());

    Ok(LoadedConfig {
        port: config.port,
        root,
        variables: config.variables,
        services,
    })
}

fn read_variables(value: &toml::Value) -> Result<BTreeMap<String, String>> {
    let Some(vars) = value.get("variables") else {
        return Ok(BTreeMap::new());
    };
    let table = vars.as_table().ok_or_else(|| {
        CoreError::ConfigurationError("variables: must be a table".to_string())
    })?;
    Ok(table
        .iter()
        .map(|(k, v)| {
            let text = match v {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect())
}

fn substitute(value: &mut toml::Value, variables: &BTreeMap<String, String>) {
    match value {
        toml::Value::String(s) => *s = replace_variables(s, variables),
        toml::Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, variables)),
        toml::Value::Table(table) => table
            .iter_mut()
            .for_each(|(_, v)| substitute(v, variables)),
        _ => {}
    }
}

fn entry_name(entry: &toml::Value) -> Option<&str> {
    entry.get("name").and_then(toml::Value::as_str)
}

fn apply_defaults(value: &mut toml::Value) -> Result<()> {
    let Some(services) = value.get_mut("services") else {
        return Ok(());
    };
    let entries = services.as_array_mut().ok_or_else(|| {
        CoreError::ConfigurationError("services: must be an array of tables".to_string())
    })?;

    let mut defaults = toml::map::Map::new();
    entries.retain(|entry| match entry_name(entry) {
        Some(name) if DEFAULTS_NAME.is_match(name) => {
            if let Some(table) = entry.as_table() {
                defaults.extend(table.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            false
        }
        _ => true,
    });
    defaults.remove("name");
    if defaults.is_empty() {
        return Ok(());
    }

    for (i, entry) in entries.iter_mut().enumerate() {
        let table = entry.as_table_mut().ok_or_else(|| {
            CoreError::ConfigurationError(format!("services[{}]: must be a table", i))
        })?;
        for (key, default) in &defaults {
            table.entry(key.clone()).or_insert_with(|| default.clone());
        }
    }
    Ok(())
}

/// Validate service definitions, reporting the first problem with its field path
pub fn validate(config: &ServicesConfig) -> Result<()> {
    if config.port == 0 {
        return Err(CoreError::ValidationError(
            "port: must be 1..=65535".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for (i, svc) in config.services.iter().enumerate() {
        if svc.name.trim().is_empty() {
            return Err(CoreError::ValidationError(format!(
                "services[{}].name: cannot be empty",
                i
            )));
        }
        if !seen.insert(svc.name.as_str()) {
            return Err(CoreError::ValidationError(format!(
                "services[{}].name: duplicate name '{}'",
                i, svc.name
            )));
        }
        if svc.depends_on.iter().any(|d| d == &svc.name) {
            return Err(CoreError::ValidationError(format!(
                "services[{}].dependsOn: '{}' cannot depend on itself",
                i, svc.name
            )));
        }
        if svc.port == Some(0) {
            return Err(CoreError::ValidationError(format!(
                "services[{}].port: must be 1..=65535",
                i
            )));
        }
        if svc.group.as_deref().is_some_and(|g| g.trim().is_empty()) {
            return Err(CoreError::ValidationError(format!(
                "services[{}].group: cannot be empty",
                i
            )));
        }
        for (job, cmd) in &svc.jobs {
            if cmd.trim().is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "services[{}].jobs.{}: command cannot be empty",
                    i, job
                )));
            }
        }
    }
    Ok(())
}

/// Copy `restartCmd`/`restartDir` from the first group member that defines
/// them to the members that do not
pub fn propagate_group_settings(services: &mut [ServiceSpec]) {
    let mut shared: HashMap<String, (Option<String>, Option<String>)> = HashMap::new();
    for svc in services.iter() {
        if let Some(group) = &svc.group {
            let entry = shared.entry(group.clone()).or_default();
            if entry.0.is_none() {
                entry.0 = svc.restart_cmd.clone();
            }
            if entry.1.is_none() {
                entry.1 = svc.restart_dir.clone();
            }
        }
    }
    for svc in services.iter_mut() {
        let Some((cmd, dir)) = svc.group.as_ref().and_then(|g| shared.get(g)) else {
            continue;
        };
        if svc.restart_cmd.is_none() {
            svc.restart_cmd = cmd.clone();
        }
        if svc.restart_dir.is_none() {
            svc.restart_dir = dir.clone();
        }
    }
}

/// Resolve a jar location that may contain `*` in its file name.
///
/// Without a wildcard the path is returned when it exists. With one, the
/// last match in natural order (so `app-1.10.jar` beats `app-1.9.jar`) is
/// returned.
pub fn resolve_jar_location(location: &Path) -> Option<PathBuf> {
    let file_name = location.file_name()?.to_string_lossy();
    if !file_name.contains('*') {
        return location.is_file().then(|| location.to_path_buf());
    }
    let pattern = file_name
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let matcher = Regex::new(&format!("^{pattern}$")).ok()?;
    let dir = location
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| matcher.is_match(name))
        .max_by(|a, b| natural_cmp(a, b))
        .map(|name| dir.join(name))
}

/// Detects changes of the services file by modification time and length
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    last: Option<(SystemTime, u64)>,
}

impl ConfigWatcher {
    /// Watch `path`, taking its current state as the baseline
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last = Self::stamp(&path);
        Self { path, last }
    }

    /// Watched path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stamp(path: &Path) -> Option<(SystemTime, u64)> {
        let meta = fs::metadata(path).ok()?;
        Some((meta.modified().ok()?, meta.len()))
    }

    /// Whether the file changed since the previous call
    pub fn changed(&mut self) -> bool {
        let current = Self::stamp(&self.path);
        if current != self.last {
            self.last = current;
            true
        } else {
            false
        }
    }
}
