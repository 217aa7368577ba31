use thiserror::Error;

pub const USAGE: &str = "\
Usage: dev-env [OPTIONS] [-- COMMAND...]

Build and enter the project's containerized development environment.

Options:
  --distro NAME                 platform target (a directory under .dev-env/)
  --build / --no-build          build the image first (default: on)
  --folder-name NAME            mount path segment under /workspace (default: project dir name)
  --image NAME                  use this image instead of the computed tag
  --keep / --no-keep            keep the container after exit (default: off)
  --map-user / --no-map-user    recreate the host user inside the container
                                (default: on unless running as root)
  --run / --no-run              start the container and run the command (default: on)
  --tty / --no-tty              allocate a pseudo-terminal (default: on)
  --upgrade-dev-env             merge the latest upstream launcher into ./dev-env
  --upgrade-dev-env-to VERSION  merge a specific upstream version
  -h, --help                    print this help

Everything after `--` is run inside the container verbatim
(default: a login shell).
";

/// Which upstream version `--upgrade-dev-env*` asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upgrade {
    Latest,
    To(String),
}

/// Options exactly as given on the command line; defaults that depend on the
/// project or the host are resolved later in `config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub distro: Option<String>,
    pub build: bool,
    pub folder_name: Option<String>,
    pub image: Option<String>,
    pub keep: bool,
    /// `None` until `--map-user`/`--no-map-user` is seen.
    pub map_user: Option<bool>,
    pub run: bool,
    pub tty: bool,
    pub upgrade: Option<Upgrade>,
    pub command: Vec<String>,
    pub help: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            distro: None,
            build: true,
            folder_name: None,
            image: None,
            keep: false,
            map_user: None,
            run: true,
            tty: true,
            upgrade: None,
            command: Vec::new(),
            help: false,
        }
    }
}

/// Every problem found in one pass over the arguments.
#[derive(Debug, Error)]
#[error("{}", .0.join("\n"))]
pub struct UsageError(pub Vec<String>);

#[derive(Clone, Copy)]
enum Switch {
    Build,
    Keep,
    MapUser,
    Run,
    Tty,
}

fn switch(name: &str) -> Option<(Switch, bool)> {
    let (name, value) = match name.strip_prefix("no-") {
        Some(rest) => (rest, false),
        None => (name, true),
    };
    let switch = match name {
        "build" => Switch::Build,
        "keep" => Switch::Keep,
        "map-user" => Switch::MapUser,
        "run" => Switch::Run,
        "tty" => Switch::Tty,
        _ => return None,
    };
    Some((switch, value))
}

/// Parse launcher arguments (without the program name) left to right.
///
/// Unknown flags do not stop the parse: every error is collected and returned
/// together so the user can fix them in one go.
pub fn parse_args<I, S>(args: I) -> Result<Options, UsageError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut opts = Options::default();
    let mut errors = Vec::new();
    let mut args = args.into_iter().map(Into::into);

    while let Some(arg) = args.next() {
        if arg == "--" {
            opts.command = args.by_ref().collect();
            break;
        }
        if arg == "-h" || arg == "--help" {
            opts.help = true;
            continue;
        }
        let Some(flag) = arg.strip_prefix("--") else {
            errors.push(format!("unexpected argument '{arg}' (use `--` before a command)"));
            continue;
        };
        let (name, inline) = match flag.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (flag, None),
        };

        if let Some((switch, value)) = switch(name) {
            if inline.is_some() {
                errors.push(format!("--{name} does not take a value"));
                continue;
            }
            match switch {
                Switch::Build => opts.build = value,
                Switch::Keep => opts.keep = value,
                Switch::MapUser => opts.map_user = Some(value),
                Switch::Run => opts.run = value,
                Switch::Tty => opts.tty = value,
            }
            continue;
        }

        match name {
            "upgrade-dev-env" => {
                if inline.is_some() {
                    errors.push("--upgrade-dev-env does not take a value".to_string());
                } else {
                    opts.upgrade = Some(Upgrade::Latest);
                }
            }
            "distro" | "folder-name" | "image" | "upgrade-dev-env-to" => {
                let value = match inline {
                    Some(v) => Some(v),
                    None => args.next(),
                };
                match value.filter(|v| !v.is_empty()) {
                    Some(v) => match name {
                        "distro" => opts.distro = Some(v),
                        "folder-name" => opts.folder_name = Some(v),
                        "image" => opts.image = Some(v),
                        _ => opts.upgrade = Some(Upgrade::To(v)),
                    },
                    None => errors.push(format!("--{name} requires a value")),
                }
            }
            _ => errors.push(format!("unknown option '--{name}'")),
        }
    }

    if errors.is_empty() {
        Ok(opts)
    } else {
        Err(UsageError(errors))
    }
}
