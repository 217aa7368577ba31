// main.rs — arg parsing and orchestration only.
// Engine, network and merge-tool access lives in the modules below.
mod cli;
mod config;
mod distro;
mod docker;
mod exec;
mod identity;
mod merge;
mod update;

use cli::{Options, Upgrade};
use config::{launcher_config, LauncherConfig};
use docker::{launch, RealDockerRunner, RunPlan};
use exec::{ChildExit, Interrupt};
use identity::HostIdentity;
use merge::ExternalMerge;
use update::{upgrade_launcher, GitHubUpstream, UpgradeOutcome};

/// Exit status after SIGINT, as a shell would report it.
const INTERRUPTED_EXIT: i32 = 130;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("DEV_ENV_LOG", "warn"))
        .format_timestamp(None)
        .init();
}

fn main() {
    init_logging();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("[dev-env] error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Everything after logging setup; returns the process exit status.
fn run() -> anyhow::Result<i32> {
    let opts = match cli::parse_args(std::env::args().skip(1)) {
        Ok(opts) => opts,
        Err(e) => {
            for problem in &e.0 {
                eprintln!("[dev-env] {problem}");
            }
            eprintln!("[dev-env] run with --help for usage");
            return Ok(1);
        }
    };
    if opts.help {
        eprint!("{}", cli::USAGE);
        return Ok(1);
    }

    let config = launcher_config(&opts)?;
    log::debug!("{config:?}");

    if let Some(upgrade) = &opts.upgrade {
        self_upgrade(&config, upgrade)?;
        return Ok(0);
    }

    let code = match run_environment(&config, &opts)? {
        ChildExit::Code(code) => code,
        ChildExit::Interrupted => {
            eprintln!("[dev-env] interrupted");
            INTERRUPTED_EXIT
        }
    };
    Ok(code)
}

fn self_upgrade(config: &LauncherConfig, upgrade: &Upgrade) -> anyhow::Result<()> {
    let requested = match upgrade {
        Upgrade::Latest => None,
        Upgrade::To(tag) => Some(tag.as_str()),
    };
    let upstream = GitHubUpstream::new(config)?;
    let merger = ExternalMerge::new(config.merge_tool.clone());
    match upgrade_launcher(&config.launcher_path, requested, &upstream, &merger)? {
        UpgradeOutcome::UpToDate(tag) => {
            eprintln!("[dev-env] already up to date ({tag})");
        }
        UpgradeOutcome::Upgraded { from, to } => {
            eprintln!(
                "[dev-env] merged upstream {from} \u{2192} {to} into {}",
                config.launcher_path.display()
            );
        }
    }
    Ok(())
}

fn run_environment(config: &LauncherConfig, opts: &Options) -> anyhow::Result<ChildExit> {
    if !opts.build && !opts.run {
        log::info!("--no-build --no-run: nothing to do");
        return Ok(ChildExit::Code(0));
    }

    // An explicit --image only needs a distro when it is also being built.
    let select = || {
        distro::select_distro(opts.distro.as_deref(), &config.settings, &config.dev_env_dir)
    };
    let (image, build_context) = match &opts.image {
        Some(image) if !opts.build => (image.clone(), None),
        Some(image) => {
            let distro = select()?;
            (image.clone(), Some(distro::build_context(&config.dev_env_dir, &distro)))
        }
        None => {
            let distro = select()?;
            let context = opts
                .build
                .then(|| distro::build_context(&config.dev_env_dir, &distro));
            (distro::image_tag(&config.project_name, &distro), context)
        }
    };
    log::info!("using image {image}");

    let identity = if opts.run {
        match opts.map_user {
            Some(false) => None,
            Some(true) => Some(HostIdentity::current()?),
            None => Some(HostIdentity::current()?).filter(|host| !host.is_privileged()),
        }
    } else {
        None
    };

    let command = if opts.command.is_empty() {
        config.login_shell()
    } else {
        opts.command.clone()
    };

    let plan = RunPlan {
        image,
        build_context,
        run: opts.run,
        keep: opts.keep,
        tty: opts.tty,
        project_root: config.project_root.clone(),
        workdir: config.workdir(),
        identity,
        command,
    };
    log::debug!("{plan:?}");

    let interrupt = Interrupt::register()?;
    let runner = RealDockerRunner::new(config.docker_bin.clone());
    Ok(launch(&runner, &plan, &interrupt)?)
}
