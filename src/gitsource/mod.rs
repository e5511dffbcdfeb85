// Module: GitSource
// Script repositories the actions execute out of. Each repository is cloned
// once under a digest-named directory, refreshed in the background, and
// guarded by a read/write lock: script runs hold read, pulls hold write, so
// a pull never rewrites files underneath an executing script.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{CertificateCheckStatus, Cred, CredentialType, FetchOptions, RemoteCallbacks, Repository};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GitOptions;
use crate::errors::GitError;
use crate::metrics::{names, RecorderHandle};

/// Cadence of the background refresher. Individual repos still honor their
/// own minimum pull interval.
pub const REFRESH_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
struct GitAuth {
    private_key_path: Option<PathBuf>,
    passphrase: Option<String>,
}

/// One managed checkout. Lives for the whole process.
pub struct GitRepo {
    pub url: String,
    pub branch: String,
    pub local_path: PathBuf,
    auth: GitAuth,
    min_pull_interval: Duration,
    lock: Arc<RwLock<()>>,
    last_pulled: std::sync::Mutex<Option<Instant>>,
}

impl GitRepo {
    /// Resolve a path inside this checkout, refusing any relative path that
    /// escapes the repository root.
    pub fn script_path(&self, relpath: &str) -> Result<PathBuf, GitError> {
        let root = normalize_path(&self.local_path);
        let joined = normalize_path(&root.join(relpath));
        if !joined.starts_with(&root) {
            return Err(GitError::PathEscape {
                path: joined.display().to_string(),
                root: root.display().to_string(),
            });
        }
        Ok(joined)
    }

    fn due_for_pull(&self) -> bool {
        let last = self.last_pulled.lock().expect("pull timestamp lock");
        match *last {
            Some(at) => at.elapsed() >= self.min_pull_interval,
            None => true,
        }
    }

    fn mark_pulled(&self) {
        *self.last_pulled.lock().expect("pull timestamp lock") = Some(Instant::now());
    }
}

/// Owner of every cloned repository, keyed by URL.
pub struct GitSourceManager {
    base_dir: PathBuf,
    repos: Mutex<HashMap<String, Arc<GitRepo>>>,
    recorder: RecorderHandle,
}

impl GitSourceManager {
    pub fn new(base_dir: impl Into<PathBuf>, recorder: RecorderHandle) -> Self {
        Self {
            base_dir: base_dir.into(),
            repos: Mutex::new(HashMap::new()),
            recorder,
        }
    }

    /// Idempotent download: clones on first sight of a URL, reuses the
    /// checkout afterwards. A directory that exists but does not open as a
    /// repository is treated as a torn clone, removed and cloned again.
    pub async fn download(&self, options: &GitOptions) -> Result<Arc<GitRepo>, GitError> {
        let mut repos = self.repos.lock().await;
        if let Some(existing) = repos.get(&options.url) {
            return Ok(existing.clone());
        }

        let local_path = self.base_dir.join(repo_dir_name(&options.url));
        let auth = GitAuth {
            private_key_path: options.private_key_path.clone(),
            passphrase: options.key_passphrase.clone(),
        };

        let url = options.url.clone();
        let branch = options.branch.clone();
        let path = local_path.clone();
        let clone_auth = auth.clone();
        tokio::task::spawn_blocking(move || blocking_clone_or_open(&url, &branch, &path, &clone_auth))
            .await
            .map_err(|e| GitError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        info!(url = %options.url, path = %local_path.display(), branch = %options.branch, "repository ready");

        let repo = Arc::new(GitRepo {
            url: options.url.clone(),
            branch: options.branch.clone(),
            local_path,
            auth,
            min_pull_interval: Duration::from_secs(options.poll_interval_sec),
            lock: Arc::new(RwLock::new(())),
            last_pulled: std::sync::Mutex::new(Some(Instant::now())),
        });
        repos.insert(options.url.clone(), repo.clone());
        Ok(repo)
    }

    /// Pull the configured branch under the repo's write lock. Skipped when
    /// the minimum interval since the last pull has not elapsed. Returns
    /// whether the checkout moved.
    pub async fn pull(&self, repo: &Arc<GitRepo>) -> Result<bool, GitError> {
        if !repo.due_for_pull() {
            debug!(url = %repo.url, "pull skipped; interval not elapsed");
            return Ok(false);
        }

        let _write = repo.lock.write().await;
        let started = Instant::now();

        let path = repo.local_path.clone();
        let branch = repo.branch.clone();
        let auth = repo.auth.clone();
        let shallow = wants_shallow(&repo.url);
        let moved =
            tokio::task::spawn_blocking(move || blocking_pull(&path, &branch, &auth, shallow))
                .await
                .map_err(|e| GitError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        repo.mark_pulled();
        self.recorder.histogram(
            names::GIT_PULL_DURATION,
            &[("repo", &repo_dir_name(&repo.url))],
            started.elapsed(),
        );
        if moved {
            info!(url = %repo.url, branch = %repo.branch, "checkout updated");
        } else {
            debug!(url = %repo.url, "already up to date");
        }
        Ok(moved)
    }

    /// Read lock held for the duration of a script run. Fails when the URL
    /// was never downloaded.
    pub async fn read_lock(&self, url: &str) -> Result<OwnedRwLockReadGuard<()>, GitError> {
        let repo = self.get(url).await?;
        Ok(repo.lock.clone().read_owned().await)
    }

    /// Resolve a script path inside the checkout for `url`.
    pub async fn script_path(&self, url: &str, relpath: &str) -> Result<PathBuf, GitError> {
        self.get(url).await?.script_path(relpath)
    }

    async fn get(&self, url: &str) -> Result<Arc<GitRepo>, GitError> {
        self.repos
            .lock()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| GitError::UnknownRepo {
                url: url.to_string(),
            })
    }

    /// Pull every known repository once; failures are logged, not fatal.
    pub async fn refresh_all(&self) {
        let repos: Vec<Arc<GitRepo>> = self.repos.lock().await.values().cloned().collect();
        for repo in repos {
            if let Err(err) = self.pull(&repo).await {
                warn!(url = %repo.url, error = %err, "background pull failed");
            }
        }
    }

    /// Background loop: every tick, refresh every repository.
    pub async fn run_refresher(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("git refresher stopping");
                    return;
                }
                _ = tokio::time::sleep(REFRESH_TICK) => {
                    self.refresh_all().await;
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn register_local(&self, url: &str, local_path: PathBuf) -> Arc<GitRepo> {
        let repo = Arc::new(GitRepo {
            url: url.to_string(),
            branch: "main".to_string(),
            local_path,
            auth: GitAuth::default(),
            min_pull_interval: Duration::from_secs(0),
            lock: Arc::new(RwLock::new(())),
            last_pulled: std::sync::Mutex::new(None),
        });
        self.repos
            .lock()
            .await
            .insert(url.to_string(), repo.clone());
        repo
    }
}

/// Deterministic, collision-free directory name for a URL: a sanitized tail
/// for operators plus a digest prefix for uniqueness.
pub fn repo_dir_name(url: &str) -> String {
    let tail = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git");
    let tail: String = tail
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let tail = if tail.is_empty() { "repo" } else { &tail };

    let digest = Sha256::digest(url.as_bytes());
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{tail}-{hex}")
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem, so containment checks hold for paths that don't exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Shallow clones only make sense for remote transports; local-path clones
/// (tests, mirrored checkouts) fetch everything.
fn wants_shallow(url: &str) -> bool {
    !(url.starts_with('/') || url.starts_with("./") || url.starts_with("file://"))
}

fn make_callbacks(auth: &GitAuth) -> RemoteCallbacks<'static> {
    let key = auth.private_key_path.clone();
    let passphrase = auth.passphrase.clone();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        if allowed.contains(CredentialType::SSH_KEY) {
            if let Some(key) = &key {
                let user = username_from_url.unwrap_or("git");
                return Cred::ssh_key(user, None, key, passphrase.as_deref());
            }
        }
        Cred::default()
    });
    // Host keys are accepted without verification. Deliberate: edge installs
    // pin repositories by URL and deploy key, and frequently sit behind NAT
    // with no way to pre-seed known_hosts.
    callbacks.certificate_check(|_cert, _host| Ok(CertificateCheckStatus::CertificateOk));
    callbacks
}

fn blocking_clone_or_open(
    url: &str,
    branch: &str,
    path: &Path,
    auth: &GitAuth,
) -> Result<(), GitError> {
    if path.exists() {
        match Repository::open(path) {
            Ok(_) => return Ok(()),
            Err(err) => {
                // Torn clone from an earlier crash; start over.
                warn!(path = %path.display(), error = %err, "removing unusable checkout");
                std::fs::remove_dir_all(path)?;
            }
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(make_callbacks(auth));
    if wants_shallow(url) {
        fetch.depth(1);
    }
    RepoBuilder::new()
        .branch(branch)
        .fetch_options(fetch)
        .clone(url, path)?;
    Ok(())
}

fn blocking_pull(path: &Path, branch: &str, auth: &GitAuth, shallow: bool) -> Result<bool, GitError> {
    let repo = Repository::open(path)?;
    let mut remote = repo.find_remote("origin")?;

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(make_callbacks(auth));
    if shallow {
        fetch.depth(1);
    }
    remote.fetch(&[branch], Some(&mut fetch), None)?;

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let target = fetch_head
        .target()
        .ok_or_else(|| git2::Error::from_str("FETCH_HEAD has no target"))?;
    if repo.head().ok().and_then(|h| h.target()) == Some(target) {
        return Ok(false);
    }

    let refname = format!("refs/heads/{branch}");
    match repo.find_reference(&refname) {
        Ok(mut reference) => {
            reference.set_target(target, "fast-forward pull")?;
        }
        Err(_) => {
            repo.reference(&refname, target, true, "fast-forward pull")?;
        }
    }
    repo.set_head(&refname)?;
    repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
    Ok(true)
}
