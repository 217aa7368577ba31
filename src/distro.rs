use std::path::{Path, PathBuf};

use crate::config::{ConfigError, Settings};

/// Build recipe expected inside every distro directory.
pub const BUILD_RECIPE: &str = "Dockerfile";
const IMAGE_SUFFIX: &str = "dev-env";

/// Directory names under `.dev-env/`, sorted. Hidden entries and files are skipped.
pub fn available_distros(dev_env_dir: &Path) -> Result<Vec<String>, ConfigError> {
    let entries = match std::fs::read_dir(dev_env_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ConfigError::Unreadable {
                path: dev_env_dir.to_path_buf(),
                source,
            })
        }
    };
    let mut names = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// `--distro`, then the settings default, then the lexicographically largest directory.
pub fn select_distro(
    requested: Option<&str>,
    settings: &Settings,
    dev_env_dir: &Path,
) -> Result<String, ConfigError> {
    if let Some(name) = requested.or(settings.default_distro.as_deref()) {
        return Ok(name.to_string());
    }
    available_distros(dev_env_dir)?
        .pop()
        .ok_or_else(|| ConfigError::NoDistro(dev_env_dir.to_path_buf()))
}

pub fn build_context(dev_env_dir: &Path, distro: &str) -> PathBuf {
    dev_env_dir.join(distro)
}

/// `{project}-{distro}-dev-env`, with the project name reduced to what an image
/// repository name accepts.
pub fn image_tag(project_name: &str, distro: &str) -> String {
    format!("{}-{}-{}", sanitize(project_name), sanitize(distro), IMAGE_SUFFIX)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}
