use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::cli::Options;

/// Per-project directory holding `settings.yml` and one build context per distro.
pub const DEV_ENV_DIR: &str = ".dev-env";
pub const SETTINGS_FILE: &str = "settings.yml";
/// Launcher script kept in the project root, relative path.
pub const DEFAULT_LAUNCHER: &str = "dev-env";
pub const DEFAULT_UPSTREAM_REPO: &str = "dev-env/dev-env";
pub const DEFAULT_SHELL: &str = "/bin/sh";
/// Mount point of the project inside the container; the folder name is appended.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// `.dev-env/settings.yml`. Every key is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub default_distro: Option<String>,
    pub project_name: Option<String>,
    pub shell: Option<String>,
    pub upstream_repo: Option<String>,
    pub launcher: Option<PathBuf>,
}

#[derive(Debug)]
pub struct LauncherConfig {
    pub project_root: PathBuf,    // DEV_ENV_PROJECT_ROOT, or nearest ancestor with .dev-env/
    pub dev_env_dir: PathBuf,     // project_root/.dev-env
    pub settings: Settings,
    pub launcher_path: PathBuf,   // project_root/dev-env unless settings.launcher
    pub project_name: String,
    pub folder_name: String,      // --folder-name or project dir name
    pub shell: String,
    pub docker_bin: String,       // DEV_ENV_DOCKER
    pub merge_tool: Option<String>, // DEV_ENV_MERGE_TOOL
    pub upstream_repo: String,    // DEV_ENV_UPSTREAM_REPO > settings > default
    pub api_url: String,          // DEV_ENV_API_URL
    pub raw_url: String,          // DEV_ENV_RAW_URL
}

impl LauncherConfig {
    /// In-container working directory, e.g. `/workspace/my-project`.
    pub fn workdir(&self) -> String {
        format!("{}/{}", CONTAINER_WORKSPACE, self.folder_name)
    }

    /// Command to run when none was given after `--`.
    pub fn login_shell(&self) -> Vec<String> {
        vec![self.shell.clone(), "-l".to_string()]
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine working directory: {0}")]
    NoWorkingDir(#[source] std::io::Error),
    #[error("could not read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings file {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no distro available: add a build context directory under {}", .0.display())]
    NoDistro(PathBuf),
}

pub fn launcher_config(opts: &Options) -> Result<LauncherConfig, ConfigError> {
    let project_root = match std::env::var_os("DEV_ENV_PROJECT_ROOT") {
        Some(root) => PathBuf::from(root),
        None => {
            let cwd = std::env::current_dir().map_err(ConfigError::NoWorkingDir)?;
            discover_project_root(&cwd)
        }
    };
    load_config(project_root, opts)
}

/// Nearest ancestor of `start` containing `.dev-env/`, falling back to `start`.
pub fn discover_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(DEV_ENV_DIR).is_dir())
        .unwrap_or(start)
        .to_path_buf()
}

pub fn load_config(project_root: PathBuf, opts: &Options) -> Result<LauncherConfig, ConfigError> {
    let dev_env_dir = project_root.join(DEV_ENV_DIR);
    let settings = read_settings(&dev_env_dir.join(SETTINGS_FILE))?;

    let dir_name = project_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    let launcher_path = project_root.join(
        settings
            .launcher
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LAUNCHER)),
    );
    let project_name = settings.project_name.clone().unwrap_or_else(|| dir_name.clone());
    let folder_name = opts.folder_name.clone().unwrap_or(dir_name);
    let shell = settings
        .shell
        .clone()
        .unwrap_or_else(|| DEFAULT_SHELL.to_string());

    let upstream_repo = env_nonempty("DEV_ENV_UPSTREAM_REPO")
        .or_else(|| settings.upstream_repo.clone())
        .unwrap_or_else(|| DEFAULT_UPSTREAM_REPO.to_string());

    Ok(LauncherConfig {
        project_root,
        dev_env_dir,
        launcher_path,
        project_name,
        folder_name,
        shell,
        docker_bin: env_nonempty("DEV_ENV_DOCKER").unwrap_or_else(|| "docker".to_string()),
        merge_tool: env_nonempty("DEV_ENV_MERGE_TOOL"),
        upstream_repo,
        api_url: url_root("DEV_ENV_API_URL", "https://api.github.com"),
        raw_url: url_root("DEV_ENV_RAW_URL", "https://raw.githubusercontent.com"),
        settings,
    })
}

/// Missing file means defaults; an unparsable one is an error.
pub fn read_settings(path: &Path) -> Result<Settings, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(source) => {
            return Err(ConfigError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let blank = text.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#')
    });
    if blank {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn url_root(key: &str, default: &str) -> String {
    env_nonempty(key)
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}
