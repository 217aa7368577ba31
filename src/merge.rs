use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

/// Used when neither `DEV_ENV_MERGE_TOOL` nor `git config merge.tool` names one.
pub const FALLBACK_TOOL: &str = "diff3";

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("unsupported merge tool `{0}` (supported: {})", supported_tools())]
    UnknownTool(String),
    #[error("failed to run merge tool `{tool}`: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error(
        "merge tool `{tool}` reported conflicts (exit code {code}); \
         its output was saved to {} and the launcher was left unchanged",
        .output.display()
    )]
    Conflict {
        tool: String,
        code: i32,
        output: PathBuf,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How a tool receives its inputs and returns the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// `PROGRAM ARGS.. BASE CURRENT UPSTREAM FLAG OUT`
    OutputFlag(&'static str),
    /// `PROGRAM ARGS.. CURRENT BASE UPSTREAM FLAG OUT`
    CurrentFirstOutputFlag(&'static str),
    /// `PROGRAM ARGS.. CURRENT BASE UPSTREAM`, result on stdout
    Stdout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub program: &'static str,
    pub args: &'static [&'static str],
    pub invocation: Invocation,
}

const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "diff3",
        program: "diff3",
        args: &["-m"],
        invocation: Invocation::Stdout,
    },
    ToolSpec {
        name: "git-merge-file",
        program: "git",
        args: &["merge-file", "-p"],
        invocation: Invocation::Stdout,
    },
    ToolSpec {
        name: "merge",
        program: "merge",
        args: &["-p"],
        invocation: Invocation::Stdout,
    },
    ToolSpec {
        name: "kdiff3",
        program: "kdiff3",
        args: &[],
        invocation: Invocation::OutputFlag("-o"),
    },
    // Same convention git mergetool uses for meld.
    ToolSpec {
        name: "meld",
        program: "meld",
        args: &["--auto-merge"],
        invocation: Invocation::CurrentFirstOutputFlag("--output"),
    },
];

fn supported_tools() -> String {
    TOOLS.iter().map(|t| t.name).collect::<Vec<_>>().join(", ")
}

pub fn lookup(name: &str) -> Result<&'static ToolSpec, MergeError> {
    TOOLS
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| MergeError::UnknownTool(name.to_string()))
}

/// The tool git would pick: `git config --get merge.tool`, else `diff3`.
pub fn git_merge_tool() -> String {
    let configured = Command::new("git")
        .args(["config", "--get", "merge.tool"])
        .stderr(Stdio::null())
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|name| !name.is_empty());
    configured.unwrap_or_else(|| FALLBACK_TOOL.to_string())
}

/// Combine `base`, `current` and `upstream` and replace `target` with the result.
pub trait ThreeWayMerge {
    fn reconcile(
        &self,
        base: &str,
        current: &str,
        upstream: &str,
        target: &Path,
    ) -> Result<(), MergeError>;
}

/// Delegates to an external merge tool.
pub struct ExternalMerge {
    tool: Option<String>,
    program: Option<PathBuf>,
}

impl ExternalMerge {
    /// `tool` overrides the git preference; it is resolved lazily on first merge.
    pub fn new(tool: Option<String>) -> Self {
        Self {
            tool,
            program: None,
        }
    }

    /// Run `program` with the calling convention of the named tool.
    #[cfg(test)]
    pub fn with_program(tool: &str, program: PathBuf) -> Self {
        Self {
            tool: Some(tool.to_string()),
            program: Some(program),
        }
    }
}

/// Where a conflicted result is left for the user: `<target>.merge`.
pub fn conflict_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".merge");
    target.with_file_name(name)
}

impl ThreeWayMerge for ExternalMerge {
    fn reconcile(
        &self,
        base: &str,
        current: &str,
        upstream: &str,
        target: &Path,
    ) -> Result<(), MergeError> {
        let name = self.tool.clone().unwrap_or_else(git_merge_tool);
        let spec = lookup(&name)?;

        let stage = tempfile::tempdir()?;
        let base_path = stage.path().join("base");
        let current_path = stage.path().join("current");
        let upstream_path = stage.path().join("upstream");
        fs::write(&base_path, base)?;
        fs::write(&current_path, current)?;
        fs::write(&upstream_path, upstream)?;

        // Same directory as the target so the final rename stays on one filesystem.
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let merged = tempfile::Builder::new()
            .prefix(".dev-env-merge")
            .tempfile_in(dir)?;

        let mut cmd = Command::new(self.program.as_deref().unwrap_or(Path::new(spec.program)));
        cmd.args(spec.args);
        match spec.invocation {
            Invocation::Stdout => {
                cmd.arg(&current_path)
                    .arg(&base_path)
                    .arg(&upstream_path)
                    .stdout(Stdio::from(merged.reopen()?));
            }
            Invocation::OutputFlag(flag) => {
                cmd.arg(&base_path)
                    .arg(&current_path)
                    .arg(&upstream_path)
                    .arg(flag)
                    .arg(merged.path());
            }
            Invocation::CurrentFirstOutputFlag(flag) => {
                cmd.arg(&current_path)
                    .arg(&base_path)
                    .arg(&upstream_path)
                    .arg(flag)
                    .arg(merged.path());
            }
        }
        log::debug!("running merge tool: {cmd:?}");
        let status = cmd.status().map_err(|source| MergeError::Spawn {
            tool: name.clone(),
            source,
        })?;

        if !status.success() {
            let output = conflict_path(target);
            merged.persist(&output).map_err(|e| e.error)?;
            return Err(MergeError::Conflict {
                tool: name,
                code: status.code().unwrap_or(1),
                output,
            });
        }

        if let Ok(meta) = fs::metadata(target) {
            fs::set_permissions(merged.path(), meta.permissions())?;
        }
        merged.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}
