use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DATABASE_ENV: &str = "CALLMERGE_DATABASE";
pub const LOCK_ENV: &str = "CALLMERGE_LOCK";
pub const CALLGRAPH_ENV: &str = "CALLMERGE_CALLGRAPH";
pub const ROOT_ENV: &str = "CALLMERGE_ROOT";

const CONFIG_DIR: &str = ".callmerge";
const PROJECT_CONFIG_FILE: &str = ".callmerge.project.yml";
const DEFAULT_DATABASE: &str = "facts.sqlite";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub database: PathBuf,
    pub lock: PathBuf,
    pub callgraph: bool,
    pub root: Option<PathBuf>,
}

/// Flags given on the command line; they win over every other layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub database: Option<PathBuf>,
    pub lock: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub no_callgraph: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config `{}`: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("`{name}` must be a boolean, got `{value}`")]
    InvalidFlag { name: String, value: String },

    #[error("lock path `{}` must differ from the database path", .0.display())]
    LockIsStore(PathBuf),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    lock: Option<String>,
    #[serde(default)]
    callgraph: Option<bool>,
    #[serde(default)]
    root: Option<String>,
}

/// One layer with paths already made absolute.
#[derive(Debug, Default)]
struct ConfigLayer {
    database: Option<PathBuf>,
    lock: Option<PathBuf>,
    callgraph: Option<bool>,
    root: Option<PathBuf>,
}

pub fn load_effective_config(
    cwd: &Path,
    home: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
    overrides: &ConfigOverrides,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = ConfigLayer::default();

    if let Some(home) = home {
        let user_config = user_config_path(home);
        if user_config.is_file() {
            merge_layer(&mut merged, load_config_layer(&user_config, Some(home))?);
        }
    }

    if let Some(path) = find_nearest_project_config(cwd) {
        merge_layer(&mut merged, load_config_layer(&path, home)?);
    }

    let repo_config = repo_config_path(cwd);
    if repo_config.is_file() {
        merge_layer(&mut merged, load_config_layer(&repo_config, home)?);
    }

    merge_layer(&mut merged, env_layer(cwd, home, &env)?);
    merge_layer(
        &mut merged,
        ConfigLayer {
            database: overrides.database.as_ref().map(|p| cwd.join(p)),
            lock: overrides.lock.as_ref().map(|p| cwd.join(p)),
            callgraph: overrides.no_callgraph.then_some(false),
            root: overrides.root.as_ref().map(|p| cwd.join(p)),
        },
    );

    let database = merged
        .database
        .unwrap_or_else(|| cwd.join(CONFIG_DIR).join(DEFAULT_DATABASE));
    let lock = merged.lock.unwrap_or_else(|| default_lock_path(&database));
    if lock == database {
        return Err(ConfigError::LockIsStore(lock));
    }

    Ok(EffectiveConfig {
        database,
        lock,
        callgraph: merged.callgraph.unwrap_or(true),
        root: merged.root,
    })
}

pub fn repo_config_path(cwd: &Path) -> PathBuf {
    cwd.join(CONFIG_DIR).join("config.yml")
}

pub fn user_config_path(home: &Path) -> PathBuf {
    home.join(CONFIG_DIR).join("config.yml")
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let candidate = dir.join(PROJECT_CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

pub fn default_lock_path(database: &Path) -> PathBuf {
    let mut name = database.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn merge_layer(merged: &mut ConfigLayer, layer: ConfigLayer) {
    if layer.database.is_some() {
        merged.database = layer.database;
    }
    if layer.lock.is_some() {
        merged.lock = layer.lock;
    }
    if layer.callgraph.is_some() {
        merged.callgraph = layer.callgraph;
    }
    if layer.root.is_some() {
        merged.root = layer.root;
    }
}

fn load_config_layer(path: &Path, home: Option<&Path>) -> Result<ConfigLayer, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawConfig = if content.trim().is_empty() {
        RawConfig::default()
    } else {
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };
    let base = layer_base_dir(path);
    Ok(ConfigLayer {
        database: raw.database.map(|p| resolve_path(&p, &base, home)),
        lock: raw.lock.map(|p| resolve_path(&p, &base, home)),
        callgraph: raw.callgraph,
        root: raw.root.map(|p| resolve_path(&p, &base, home)),
    })
}

fn env_layer(
    cwd: &Path,
    home: Option<&Path>,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<ConfigLayer, ConfigError> {
    let path_var = |name: &str| {
        env(name)
            .filter(|value| !value.trim().is_empty())
            .map(|value| resolve_path(value.trim(), cwd, home))
    };
    let callgraph = match env(CALLGRAPH_ENV) {
        Some(value) if !value.trim().is_empty() => Some(parse_flag(CALLGRAPH_ENV, &value)?),
        _ => None,
    };
    Ok(ConfigLayer {
        database: path_var(DATABASE_ENV),
        lock: path_var(LOCK_ENV),
        callgraph,
        root: path_var(ROOT_ENV),
    })
}

/// Relative paths in `<dir>/.callmerge/config.yml` are relative to `<dir>`;
/// in any other file, relative to the file's own directory.
fn layer_base_dir(config_path: &Path) -> PathBuf {
    let parent = config_path.parent().unwrap_or(Path::new(""));
    if parent.file_name().is_some_and(|name| name == CONFIG_DIR) {
        parent.parent().unwrap_or(parent).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

fn resolve_path(raw: &str, base: &Path, home: Option<&Path>) -> PathBuf {
    let expanded = match home {
        Some(home) => expand_tilde(raw, home),
        None => PathBuf::from(raw),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name: name.to_string(),
            value: raw.to_string(),
        }),
    }
}

pub fn default_repo_config_yaml() -> String {
    r#"# Paths are relative to the directory holding .callmerge/.
database: .callmerge/facts.sqlite
lock: .callmerge/facts.sqlite.lock
callgraph: true
"#
    .to_string()
}
