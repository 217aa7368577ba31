use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;

use semver::Prerelease;
use serde::Deserialize;
use thiserror::Error;

use crate::config::LauncherConfig;
use crate::merge::{MergeError, ThreeWayMerge};

/// Marker line in the launcher recording the version it was installed from.
const VERSION_MARKER: &str = "DEV_ENV_VERSION=";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("could not resolve the latest upstream version: {0}")]
    Resolution(String),
    #[error("could not fetch launcher at {tag}: {reason}")]
    Fetch { tag: String, reason: String },
    #[error("{} has no DEV_ENV_VERSION= line; cannot tell which version it was based on", .0.display())]
    MissingBaseVersion(std::path::PathBuf),
    #[error("could not read {}: {source}", .path.display())]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not set up the HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Remote source of launcher versions.
pub trait Upstream: Sync {
    fn list_tags(&self) -> Result<Vec<String>, UpdateError>;
    fn fetch(&self, tag: &str) -> Result<String, UpdateError>;
}

#[derive(Deserialize)]
struct GitHubTag {
    name: String,
}

/// Tags from the GitHub REST API, files from the raw content host.
pub struct GitHubUpstream {
    client: reqwest::blocking::Client,
    api_url: String,
    raw_url: String,
    repo: String,
    file_name: String,
}

impl GitHubUpstream {
    pub fn new(config: &LauncherConfig) -> Result<Self, UpdateError> {
        let file_name = config
            .launcher_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| crate::config::DEFAULT_LAUNCHER.to_string());
        Self::with_endpoints(
            config.api_url.clone(),
            config.raw_url.clone(),
            config.upstream_repo.clone(),
            file_name,
        )
    }

    fn with_endpoints(
        api_url: String,
        raw_url: String,
        repo: String,
        file_name: String,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("dev-env/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url,
            raw_url,
            repo,
            file_name,
        })
    }
}

/// Target of the `rel="next"` entry in an RFC 8288 `Link` header.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|param| matches!(param.trim(), "rel=\"next\"" | "rel=next"));
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        is_next.then(|| target.to_string())
    })
}

impl Upstream for GitHubUpstream {
    /// Every page of the tag listing, following `Link: rel="next"`.
    fn list_tags(&self) -> Result<Vec<String>, UpdateError> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(format!("{}/repos/{}/tags?per_page=100", self.api_url, self.repo));

        while let Some(url) = next.take() {
            if !seen.insert(url.clone()) {
                log::warn!("tag listing links back to {url}; stopping");
                break;
            }
            log::debug!("listing tags: {url}");
            let response = self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github+json")
                .send()
                .map_err(|e| UpdateError::Resolution(format!("{url}: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(UpdateError::Resolution(format!("{url}: HTTP {status}")));
            }
            next = response
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_link);
            let tags: Vec<GitHubTag> = response
                .json()
                .map_err(|e| UpdateError::Resolution(format!("{url}: {e}")))?;
            names.extend(tags.into_iter().map(|t| t.name));
        }
        Ok(names)
    }

    fn fetch(&self, tag: &str) -> Result<String, UpdateError> {
        let url = format!("{}/{}/{}/{}", self.raw_url, self.repo, tag, self.file_name);
        log::debug!("fetching {url}");
        let failed = |reason: String| UpdateError::Fetch {
            tag: tag.to_string(),
            reason,
        };
        let response = self.client.get(&url).send().map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }
        response.text().map_err(|e| failed(e.to_string()))
    }
}

/// Dotted release numbers of a tag (leading `v` ignored) and whatever
/// follows them (`-rc.1`, `+build`). `None` if the tag is not numeric.
fn parse_version_key(tag: &str) -> Option<(Vec<u64>, &str)> {
    let tag = tag.trim_start_matches('v');
    let end = tag.find(|c: char| c == '-' || c == '+').unwrap_or(tag.len());
    let (core, suffix) = tag.split_at(end);
    let numbers = core
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    Some((numbers, suffix))
}

/// Missing components count as 0, so `2.0` and `2.0.0` tie.
fn compare_release(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let left = a.get(i).copied().unwrap_or(0);
            let right = b.get(i).copied().unwrap_or(0);
            left.cmp(&right)
        })
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Pre-release part of a suffix; empty for a plain release or build metadata.
fn prerelease(suffix: &str) -> Option<Prerelease> {
    let Some(pre) = suffix.strip_prefix('-') else {
        return Some(Prerelease::EMPTY);
    };
    let pre = pre.split('+').next().unwrap_or_default();
    Prerelease::new(pre).ok()
}

/// Version-aware ordering of tags.
///
/// Numeric tags compare by release numbers, then by semver pre-release
/// precedence (`2.0.0-rc.1 < 2.0`). The raw string breaks any remaining
/// tie. Non-numeric tags sort below all numeric ones.
pub fn compare_version_tags(a: &str, b: &str) -> Ordering {
    match (parse_version_key(a), parse_version_key(b)) {
        (Some((left, left_suffix)), Some((right, right_suffix))) => {
            compare_release(&left, &right)
                .then_with(|| match (prerelease(left_suffix), prerelease(right_suffix)) {
                    (Some(l), Some(r)) => l.cmp(&r),
                    _ => Ordering::Equal,
                })
                .then_with(|| a.cmp(b))
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// The requested tag as given, or the highest tag upstream.
pub fn resolve_target(upstream: &dyn Upstream, requested: Option<&str>) -> Result<String, UpdateError> {
    if let Some(tag) = requested {
        return Ok(tag.to_string());
    }
    upstream
        .list_tags()?
        .into_iter()
        .max_by(|a, b| compare_version_tags(a, b))
        .ok_or_else(|| UpdateError::Resolution("no tags published upstream".to_string()))
}

/// Value of the `DEV_ENV_VERSION=` line, if any.
pub fn recorded_version(launcher: &str) -> Option<String> {
    launcher.lines().find_map(|line| {
        let line = line.trim_start();
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let value = line.strip_prefix(VERSION_MARKER)?.trim();
        let value = value.trim_matches(|c: char| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    UpToDate(String),
    Upgraded { from: String, to: String },
}

/// Merge upstream changes between the recorded version and the target into
/// the launcher at `launcher_path`.
pub fn upgrade_launcher(
    launcher_path: &Path,
    requested: Option<&str>,
    upstream: &dyn Upstream,
    merger: &dyn ThreeWayMerge,
) -> Result<UpgradeOutcome, UpdateError> {
    let current = std::fs::read_to_string(launcher_path).map_err(|source| UpdateError::Read {
        path: launcher_path.to_path_buf(),
        source,
    })?;
    let base_tag = recorded_version(&current)
        .ok_or_else(|| UpdateError::MissingBaseVersion(launcher_path.to_path_buf()))?;
    let target_tag = resolve_target(upstream, requested)?;

    if target_tag == base_tag {
        return Ok(UpgradeOutcome::UpToDate(base_tag));
    }

    let (base, target) = std::thread::scope(|s| {
        let base = s.spawn(|| upstream.fetch(&base_tag));
        let target = upstream.fetch(&target_tag);
        let base = base
            .join()
            .unwrap_or_else(|_| Err(UpdateError::Resolution("fetch thread panicked".to_string())));
        (base, target)
    });
    let (base, target) = (base?, target?);

    merger.reconcile(&base, &current, &target, launcher_path)?;
    Ok(UpgradeOutcome::Upgraded {
        from: base_tag,
        to: target_tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeUpstream {
        tags: Vec<&'static str>,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeUpstream {
        fn new(tags: &[&'static str]) -> Self {
            Self {
                tags: tags.to_vec(),
                fetched: Mutex::new(Vec::new()),
            }
        }

        fn fetched(&self) -> Vec<String> {
            let mut f = self.fetched.lock().unwrap().clone();
            f.sort();
            f
        }
    }

    impl Upstream for FakeUpstream {
        fn list_tags(&self) -> Result<Vec<String>, UpdateError> {
            Ok(self.tags.iter().map(|t| t.to_string()).collect())
        }

        fn fetch(&self, tag: &str) -> Result<String, UpdateError> {
            self.fetched.lock().unwrap().push(tag.to_string());
            if !self.tags.iter().any(|t| *t == tag) {
                return Err(UpdateError::Fetch {
                    tag: tag.to_string(),
                    reason: "HTTP 404 Not Found".to_string(),
                });
            }
            Ok(format!("DEV_ENV_VERSION={tag}\necho upstream {tag}\n"))
        }
    }

    #[derive(Default)]
    struct RecordingMerge {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl ThreeWayMerge for RecordingMerge {
        fn reconcile(
            &self,
            base: &str,
            current: &str,
            upstream: &str,
            target: &Path,
        ) -> Result<(), MergeError> {
            self.calls
                .lock()
                .unwrap()
                .push((base.to_string(), current.to_string(), upstream.to_string()));
            std::fs::write(target, upstream)?;
            Ok(())
        }
    }

    fn launcher(dir: &Path, version: &str) -> std::path::PathBuf {
        let path = dir.join("dev-env");
        std::fs::write(
            &path,
            format!("#!/bin/sh\nDEV_ENV_VERSION=\"{version}\"\necho local tweak\n"),
        )
        .unwrap();
        path
    }

    #[test]
    fn version_ordering_is_numeric() {
        let mut tags = vec!["v1.10.0", "v1.2.0", "v1.9.3", "0.9", "nightly", "v2.0.0-rc.1"];
        tags.sort_by(|a, b| compare_version_tags(a, b));
        assert_eq!(tags, vec!["nightly", "0.9", "v1.2.0", "v1.9.3", "v1.10.0", "v2.0.0-rc.1"]);
        assert_eq!(compare_version_tags("1.2", "1.10"), Ordering::Less);
    }

    #[test]
    fn short_tags_pad_with_zeros() {
        let upstream = FakeUpstream::new(&["v1.0.0", "v1.5", "v2.0"]);
        assert_eq!(resolve_target(&upstream, None).unwrap(), "v2.0");

        assert_eq!(compare_version_tags("v2.0", "v1.0.0"), Ordering::Greater);
        assert_eq!(compare_version_tags("v1.5", "v1.4.9"), Ordering::Greater);
        assert_eq!(compare_version_tags("v2", "v2.0.0-rc.1"), Ordering::Greater);
        assert_eq!(compare_version_tags("v2.0.0+build.7", "v2.0.0-rc.1"), Ordering::Greater);
        // Equal releases fall back to the raw tag so the order stays total.
        assert_eq!(compare_version_tags("v1.0", "v1.0.0"), Ordering::Less);
    }

    #[test]
    fn github_tag_listing_shape() {
        let body = r#"[{"name":"v1.1.0","commit":{"sha":"abc"}},{"name":"v1.0.0","commit":{"sha":"def"}}]"#;
        let tags: Vec<GitHubTag> = serde_json::from_str(body).unwrap();
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["v1.1.0", "v1.0.0"]);
    }

    #[test]
    fn next_link_is_found_among_relations() {
        let header = "<https://api.github.com/repositories/1/tags?page=1>; rel=\"prev\", \
                      <https://api.github.com/repositories/1/tags?page=3>; rel=\"next\", \
                      <https://api.github.com/repositories/1/tags?page=9>; rel=\"last\"";
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://api.github.com/repositories/1/tags?page=3")
        );
        assert_eq!(next_link("<https://x/tags?page=1>; rel=\"first\""), None);
        assert_eq!(next_link(""), None);
    }

    fn github(url: String) -> GitHubUpstream {
        GitHubUpstream::with_endpoints(
            url.clone(),
            url,
            "acme/dev-env".to_string(),
            "dev-env".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn tag_listing_follows_every_page() {
        let mut server = mockito::Server::new();
        let link = format!(
            "<{url}/repositories/42/tags?per_page=100&page=2>; rel=\"next\", \
             <{url}/repositories/42/tags?per_page=100&page=2>; rel=\"last\"",
            url = server.url()
        );
        let first = server
            .mock("GET", "/repos/acme/dev-env/tags")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("link", &link)
            .with_body(r#"[{"name":"v1.0.0"},{"name":"v1.5"}]"#)
            .expect(2)
            .create();
        let second = server
            .mock("GET", "/repositories/42/tags")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"name":"v2.0"}]"#)
            .expect(2)
            .create();
        let upstream = github(server.url());

        assert_eq!(upstream.list_tags().unwrap(), vec!["v1.0.0", "v1.5", "v2.0"]);
        assert_eq!(resolve_target(&upstream, None).unwrap(), "v2.0");
        first.assert();
        second.assert();
    }

    #[test]
    fn failed_tag_listing_is_a_resolution_error() {
        let mut server = mockito::Server::new();
        let _listing = server
            .mock("GET", "/repos/acme/dev-env/tags")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create();
        let err = resolve_target(&github(server.url()), None).unwrap_err();
        assert!(matches!(&err, UpdateError::Resolution(msg) if msg.contains("500")), "{err}");
    }

    #[test]
    fn raw_file_is_fetched_by_tag() {
        let mut server = mockito::Server::new();
        let _file = server
            .mock("GET", "/acme/dev-env/v1.5/dev-env")
            .with_status(200)
            .with_body("DEV_ENV_VERSION=v1.5\n")
            .create();
        assert_eq!(github(server.url()).fetch("v1.5").unwrap(), "DEV_ENV_VERSION=v1.5\n");
    }

    #[test]
    fn missing_raw_file_is_a_fetch_error() {
        let mut server = mockito::Server::new();
        let _missing = server
            .mock("GET", "/acme/dev-env/v9.9.9/dev-env")
            .with_status(404)
            .create();
        match github(server.url()).fetch("v9.9.9").unwrap_err() {
            UpdateError::Fetch { tag, reason } => {
                assert_eq!(tag, "v9.9.9");
                assert!(reason.contains("404"), "{reason}");
            }
            other => panic!("expected a fetch error, got {other:?}"),
        }
    }

    #[test]
    fn unreachable_host_is_a_fetch_error() {
        // Bind then release a port so nothing is listening on it.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let upstream = github(format!("http://127.0.0.1:{port}"));
        let err = upstream.fetch("v1.0.0").unwrap_err();
        assert!(matches!(&err, UpdateError::Fetch { tag, .. } if tag == "v1.0.0"), "{err}");
    }

    #[test]
    fn latest_tag_is_resolved() {
        let upstream = FakeUpstream::new(&["v1.2.0", "v1.10.0", "v1.9.0"]);
        assert_eq!(resolve_target(&upstream, None).unwrap(), "v1.10.0");
        assert_eq!(resolve_target(&upstream, Some("v0.1.0")).unwrap(), "v0.1.0");
    }

    #[test]
    fn no_tags_is_a_resolution_error() {
        let upstream = FakeUpstream::new(&[]);
        assert!(matches!(
            resolve_target(&upstream, None),
            Err(UpdateError::Resolution(_))
        ));
    }

    #[test]
    fn recorded_version_forms() {
        assert_eq!(recorded_version("DEV_ENV_VERSION=1.2.0").as_deref(), Some("1.2.0"));
        assert_eq!(
            recorded_version("#!/bin/bash\n  export DEV_ENV_VERSION='v3.0.1'\n").as_deref(),
            Some("v3.0.1")
        );
        assert_eq!(recorded_version("DEV_ENV_VERSION=\"\"\n"), None);
        assert_eq!(recorded_version("echo hi\n"), None);
    }

    #[test]
    fn same_version_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = launcher(dir.path(), "v1.2.0");
        let before = std::fs::read_to_string(&path).unwrap();
        let upstream = FakeUpstream::new(&["v1.2.0"]);
        let merger = RecordingMerge::default();

        let outcome = upgrade_launcher(&path, Some("v1.2.0"), &upstream, &merger).unwrap();

        assert_eq!(outcome, UpgradeOutcome::UpToDate("v1.2.0".to_string()));
        assert!(upstream.fetched().is_empty());
        assert!(merger.calls.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn upgrade_fetches_twice_and_merges_once() {
        let dir = tempdir().unwrap();
        let path = launcher(dir.path(), "v1.2.0");
        let current = std::fs::read_to_string(&path).unwrap();
        let upstream = FakeUpstream::new(&["v1.2.0", "v1.3.0"]);
        let merger = RecordingMerge::default();

        let outcome = upgrade_launcher(&path, Some("v1.3.0"), &upstream, &merger).unwrap();

        assert_eq!(
            outcome,
            UpgradeOutcome::Upgraded {
                from: "v1.2.0".to_string(),
                to: "v1.3.0".to_string()
            }
        );
        assert_eq!(upstream.fetched(), vec!["v1.2.0", "v1.3.0"]);
        let calls = merger.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("upstream v1.2.0"));
        assert_eq!(calls[0].1, current);
        assert!(calls[0].2.contains("upstream v1.3.0"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("upstream v1.3.0"));
    }

    #[test]
    fn unknown_target_fails_without_merging() {
        let dir = tempdir().unwrap();
        let path = launcher(dir.path(), "v1.2.0");
        let upstream = FakeUpstream::new(&["v1.2.0"]);
        let merger = RecordingMerge::default();

        let err = upgrade_launcher(&path, Some("v9.9.9"), &upstream, &merger).unwrap_err();

        assert!(
            matches!(&err, UpdateError::Fetch { reason, .. } if reason.contains("404")),
            "{err}"
        );
        assert!(merger.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn launcher_without_marker_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev-env");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        let upstream = FakeUpstream::new(&["v1.0.0"]);
        let err = upgrade_launcher(&path, None, &upstream, &RecordingMerge::default()).unwrap_err();
        assert!(matches!(err, UpdateError::MissingBaseVersion(_)));
        assert!(upstream.fetched().is_empty());
    }
}
