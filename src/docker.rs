use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::distro::BUILD_RECIPE;
use crate::exec::{wait_or_interrupt, ChildExit, Interrupt};
use crate::identity::{map_identity, HostIdentity};

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("no build recipe at {}", .0.display())]
    BuildContext(PathBuf),
    #[error("image build failed (exit code {code}) for {}", .context.display())]
    Build { context: PathBuf, code: i32 },
    #[error("{0}")]
    Runtime(String),
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Access to the container engine CLI.
pub trait DockerRunner {
    /// Run with stdout/stderr captured.
    fn output(&self, args: &[String]) -> io::Result<CommandOutput>;
    /// Run attached to the launcher's stdio until exit or interruption.
    fn attached(&self, args: &[String], interrupt: &Interrupt) -> io::Result<ChildExit>;
}

pub struct RealDockerRunner {
    program: String,
}

impl RealDockerRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl DockerRunner for RealDockerRunner {
    fn output(&self, args: &[String]) -> io::Result<CommandOutput> {
        log::debug!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program).args(args).output()?;
        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn attached(&self, args: &[String], interrupt: &Interrupt) -> io::Result<ChildExit> {
        log::debug!("{} {}", self.program, args.join(" "));
        let mut child = Command::new(&self.program).args(args).spawn()?;
        wait_or_interrupt(&mut child, interrupt)
    }
}

fn render(args: &[String]) -> String {
    format!("docker {}", args.join(" "))
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Everything `launch` needs, resolved up front.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub image: String,
    /// Set when the image should be (re)built from this directory.
    pub build_context: Option<PathBuf>,
    pub run: bool,
    pub keep: bool,
    pub tty: bool,
    pub project_root: PathBuf,
    pub workdir: String,
    pub identity: Option<HostIdentity>,
    pub command: Vec<String>,
}

/// `docker build -t IMAGE CONTEXT`, after checking the recipe exists.
pub fn build_image<R: DockerRunner>(
    runner: &R,
    context: &Path,
    image: &str,
    interrupt: &Interrupt,
) -> Result<ChildExit, DockerError> {
    let recipe = context.join(BUILD_RECIPE);
    if !recipe.is_file() {
        return Err(DockerError::BuildContext(recipe));
    }
    let args = strings(["build", "-t", image, context.display().to_string().as_str()]);
    let exit = runner
        .attached(&args, interrupt)
        .map_err(|source| DockerError::Spawn {
            command: render(&args),
            source,
        })?;
    match exit {
        ChildExit::Code(0) | ChildExit::Interrupted => Ok(exit),
        ChildExit::Code(code) => Err(DockerError::Build {
            context: context.to_path_buf(),
            code,
        }),
    }
}

/// Owns a running container and stops it when dropped.
pub struct ContainerGuard<'r, R: DockerRunner> {
    runner: &'r R,
    id: String,
}

impl<'r, R: DockerRunner> ContainerGuard<'r, R> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `docker exec [-u USER] ID ARGS...` with output captured.
    pub fn exec_output(&self, user: Option<&str>, args: &[&str]) -> Result<CommandOutput, DockerError> {
        let mut full = strings(["exec"]);
        if let Some(user) = user {
            full.extend(strings(["-u", user]));
        }
        full.push(self.id.clone());
        full.extend(strings(args.iter().copied()));
        self.runner.output(&full).map_err(|source| DockerError::Spawn {
            command: render(&full),
            source,
        })
    }

    /// Like `exec_output` as root, failing on a non-zero exit.
    pub fn exec_root(&self, args: &[&str]) -> Result<CommandOutput, DockerError> {
        let output = self.exec_output(Some("0"), args)?;
        if !output.success() {
            return Err(DockerError::Runtime(format!(
                "`{}` failed in container (exit code {}): {}",
                args.join(" "),
                output.status_code,
                output.stderr_text()
            )));
        }
        Ok(output)
    }
}

impl<R: DockerRunner> Drop for ContainerGuard<'_, R> {
    fn drop(&mut self) {
        let args = strings(["stop", "-t", "1", self.id.as_str()]);
        match self.runner.output(&args) {
            Ok(out) if out.success() => log::debug!("stopped container {}", self.id),
            Ok(out) => log::warn!("could not stop container {}: {}", self.id, out.stderr_text()),
            Err(e) => log::warn!("could not stop container {}: {}", self.id, e),
        }
    }
}

/// Start a detached container idling on `tail -f /dev/null` with the project mounted.
pub fn start_container<'r, R: DockerRunner>(
    runner: &'r R,
    plan: &RunPlan,
) -> Result<ContainerGuard<'r, R>, DockerError> {
    let mut args = strings(["run", "-d"]);
    if !plan.keep {
        args.push("--rm".to_string());
    }
    args.extend([
        "-v".to_string(),
        format!("{}:{}", plan.project_root.display(), plan.workdir),
        "-w".to_string(),
        plan.workdir.clone(),
        plan.image.clone(),
    ]);
    args.extend(strings(["tail", "-f", "/dev/null"]));

    let output = runner.output(&args).map_err(|source| DockerError::Spawn {
        command: render(&args),
        source,
    })?;
    if !output.success() {
        return Err(DockerError::Runtime(format!(
            "could not start container from {} (exit code {}): {}",
            plan.image,
            output.status_code,
            output.stderr_text()
        )));
    }
    let id = output.stdout_text();
    if id.is_empty() {
        return Err(DockerError::Runtime(
            "container engine did not report a container id".to_string(),
        ));
    }
    log::info!("started container {id} from {}", plan.image);
    Ok(ContainerGuard { runner, id })
}

/// Build, start, map identity and run the command. The container is stopped
/// before this returns, whatever the outcome.
pub fn launch<R: DockerRunner>(
    runner: &R,
    plan: &RunPlan,
    interrupt: &Interrupt,
) -> Result<ChildExit, DockerError> {
    if let Some(context) = &plan.build_context {
        eprintln!("[dev-env] building {} from {}", plan.image, context.display());
        if build_image(runner, context, &plan.image, interrupt)? == ChildExit::Interrupted {
            return Ok(ChildExit::Interrupted);
        }
    }
    if !plan.run {
        return Ok(ChildExit::Code(0));
    }
    if interrupt.is_set() {
        return Ok(ChildExit::Interrupted);
    }

    let container = start_container(runner, plan)?;

    let mut args = strings(["exec", "-i"]);
    if plan.tty {
        args.push("-t".to_string());
    }
    if let Some(host) = &plan.identity {
        let user = map_identity(&container, host)?;
        args.extend([
            "-u".to_string(),
            format!("{}:{}", host.uid, host.gid),
            "-e".to_string(),
            format!("HOME={}", user.home),
            "-e".to_string(),
            format!("USER={}", user.name),
        ]);
    }
    args.extend(["-w".to_string(), plan.workdir.clone(), container.id().to_string()]);
    args.extend(plan.command.iter().cloned());

    let exit = runner
        .attached(&args, interrupt)
        .map_err(|source| DockerError::Spawn {
            command: render(&args),
            source,
        })?;
    drop(container);
    Ok(exit)
}
