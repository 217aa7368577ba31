use std::process::Command;

use crate::docker::{ContainerGuard, DockerError, DockerRunner};

/// Upper bound on `name_`, `name__`, ... attempts when a name is taken.
const MAX_NAME_ATTEMPTS: usize = 64;
const SUDOERS_FILE: &str = "/etc/sudoers.d/dev-env";

/// The invoking host user, as reported by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
}

impl HostIdentity {
    pub fn current() -> anyhow::Result<Self> {
        Ok(Self {
            uid: id(&["-u"])?.parse()?,
            gid: id(&["-g"])?.parse()?,
            user: id(&["-un"])?,
            group: id(&["-gn"])?,
        })
    }

    pub fn is_privileged(&self) -> bool {
        self.uid == 0
    }
}

fn id(args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("id").args(args).output()?;
    if !output.status.success() {
        anyhow::bail!("`id {}` failed", args.join(" "));
    }
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

/// The account the command will run as inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedUser {
    pub name: String,
    pub home: String,
}

/// Account tooling available in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountTools {
    /// shadow-utils `groupadd`/`useradd` (Debian, Fedora, ...)
    Shadow,
    /// busybox `addgroup`/`adduser` (Alpine)
    Busybox,
}

/// Make the host uid/gid exist in the container's user database, grant it
/// passwordless sudo and give it a home directory it owns.
///
/// Entries that already exist for the numeric ids are reused as they are.
pub fn map_identity<R: DockerRunner>(
    container: &ContainerGuard<'_, R>,
    host: &HostIdentity,
) -> Result<MappedUser, DockerError> {
    let tools = if container
        .exec_output(Some("0"), &["sh", "-c", "command -v useradd"])?
        .success()
    {
        AccountTools::Shadow
    } else {
        AccountTools::Busybox
    };

    let gid = host.gid.to_string();
    let group = match getent(container, "group", &gid)? {
        Some(entry) => field(&entry, 0),
        None => {
            let name = free_name(container, "group", &host.group)?;
            match tools {
                AccountTools::Shadow => container.exec_root(&["groupadd", "-g", &gid, &name])?,
                AccountTools::Busybox => container.exec_root(&["addgroup", "-g", &gid, &name])?,
            };
            log::info!("created group {name} ({gid}) in container");
            name
        }
    };

    let uid = host.uid.to_string();
    let user = match getent(container, "passwd", &uid)? {
        Some(entry) => MappedUser {
            name: field(&entry, 0),
            home: field(&entry, 5),
        },
        None => {
            let name = free_name(container, "passwd", &host.user)?;
            let home = format!("/home/{name}");
            match tools {
                AccountTools::Shadow => container.exec_root(&[
                    "useradd", "-u", &uid, "-g", &gid, "-M", "-d", &home, "-s", "/bin/sh", &name,
                ])?,
                AccountTools::Busybox => container.exec_root(&[
                    "adduser", "-D", "-H", "-u", &uid, "-G", &group, "-h", &home, "-s", "/bin/sh",
                    &name,
                ])?,
            };
            log::info!("created user {name} ({uid}) in container");
            MappedUser { name, home }
        }
    };

    container.exec_root(&[
        "sh",
        "-c",
        "mkdir -p /etc/sudoers.d && printf '%s ALL=(ALL) NOPASSWD:ALL\\n' \"$1\" > \"$2\" && chmod 0440 \"$2\"",
        "sh",
        &user.name,
        SUDOERS_FILE,
    ])?;

    let home = if user.home.is_empty() {
        format!("/home/{}", user.name)
    } else {
        user.home
    };
    container.exec_root(&["mkdir", "-p", &home])?;
    container.exec_root(&["chown", &format!("{uid}:{gid}"), &home])?;

    Ok(MappedUser {
        name: user.name,
        home,
    })
}

/// `getent DB KEY`; a non-zero exit means no such entry.
fn getent<R: DockerRunner>(
    container: &ContainerGuard<'_, R>,
    db: &str,
    key: &str,
) -> Result<Option<String>, DockerError> {
    let output = container.exec_output(Some("0"), &["getent", db, key])?;
    let entry = output.stdout_text();
    Ok((output.success() && !entry.is_empty()).then_some(entry))
}

fn field(entry: &str, index: usize) -> String {
    entry.split(':').nth(index).unwrap_or_default().to_string()
}

/// First of `base`, `base_`, `base__`, ... not present in `db`.
fn free_name<R: DockerRunner>(
    container: &ContainerGuard<'_, R>,
    db: &str,
    base: &str,
) -> Result<String, DockerError> {
    let mut name = base.to_string();
    for _ in 0..MAX_NAME_ATTEMPTS {
        if getent(container, db, &name)?.is_none() {
            return Ok(name);
        }
        log::debug!("{db} name {name} is taken in container");
        name.push('_');
    }
    Err(DockerError::Runtime(format!(
        "no free {db} name derived from {base} after {MAX_NAME_ATTEMPTS} attempts"
    )))
}
