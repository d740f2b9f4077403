//! In-memory collaborators for testing the orchestrator without a real
//! agent, service manager, or release server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use semver::Version;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, UpdateError};
use crate::layout::HostLayout;
use crate::traits::{
    AgentHealth, AgentProbe, ArchiveExtractor, PackageFetcher, ServiceController, ServiceState, VersionSource,
};
use crate::version::{parse_version, AgentVersion, PackageLocator};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Release server fake: publishes versions and serves their packages.
///
/// A package is a JSON map of relative path to file contents, which
/// [`MockExtractor`] knows how to unpack.
#[derive(Default)]
pub struct MockPackageStore {
    releases: Mutex<Vec<AgentVersion>>,
    packages: Mutex<HashMap<PackageLocator, Vec<u8>>>,
    unreachable: AtomicBool,
    fail_fetch: AtomicBool,
    fetches: AtomicUsize,
    after_fetch: Mutex<Option<FetchHook>>,
}

type FetchHook = Box<dyn FnOnce() + Send>;

impl MockPackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` once, right after the next package download lands.
    pub fn after_next_fetch(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.after_fetch) = Some(Box::new(hook));
    }

    /// Store publishing each of `versions` with a single `bin/agent` file.
    pub fn with_versions(versions: &[&str]) -> Self {
        let store = Self::new();
        for v in versions {
            let body = format!("agent-{}", v);
            store.publish(v, [("bin/agent", body.as_str())]);
        }
        store
    }

    /// Publish `version` with the given files and return its metadata.
    pub fn publish<I, P, C>(&self, version: &str, files: I) -> AgentVersion
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<Vec<u8>>,
    {
        let number = Version::parse(version).unwrap_or_else(|_| Version::new(0, 0, 0));
        let locator = PackageLocator::new(format!("mock://agent/{}/agent-{}.pkg", number, number));
        let files: BTreeMap<String, Vec<u8>> = files.into_iter().map(|(p, c)| (p.into(), c.into())).collect();
        let payload = serde_json::to_vec(&files).unwrap_or_default();

        lock(&self.packages).insert(locator.clone(), payload);
        let release = AgentVersion::new(number, locator);
        self.add(release.clone());
        release
    }

    /// Like [`MockPackageStore::publish`] but with size and checksum
    /// metadata attached.
    pub fn publish_verified<I, P, C>(&self, version: &str, files: I) -> AgentVersion
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<Vec<u8>>,
    {
        let release = self.publish(version, files);
        let payload = lock(&self.packages).get(&release.package).cloned().unwrap_or_default();
        let release = release
            .with_sha256(hex::encode(Sha256::digest(&payload)))
            .with_size(payload.len() as u64);
        self.add(release.clone());
        release
    }

    /// Publish or replace a release entry without touching packages.
    pub fn add(&self, release: AgentVersion) {
        let mut releases = lock(&self.releases);
        releases.retain(|r| r.number != release.number);
        releases.push(release);
    }

    /// Replace a package body with bytes no extractor will accept.
    pub fn corrupt(&self, locator: &PackageLocator) {
        lock(&self.packages).insert(locator.clone(), b"not a package".to_vec());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(UpdateError::Resolution("version source unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VersionSource for MockPackageStore {
    async fn latest(&self, channel: &str) -> Result<AgentVersion> {
        self.check_reachable()?;
        lock(&self.releases)
            .iter()
            .max()
            .cloned()
            .ok_or_else(|| UpdateError::Resolution(format!("no releases published on channel '{}'", channel)))
    }

    async fn release(&self, channel: &str, version: &Version) -> Result<AgentVersion> {
        self.check_reachable()?;
        lock(&self.releases)
            .iter()
            .find(|r| r.number == *version)
            .cloned()
            .ok_or_else(|| UpdateError::Resolution(format!("version {} not published on channel '{}'", version, channel)))
    }
}

#[async_trait]
impl PackageFetcher for MockPackageStore {
    async fn fetch(&self, package: &PackageLocator, dest: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(UpdateError::Download(format!("{}: connection reset", package)));
        }

        let payload = lock(&self.packages)
            .get(package)
            .cloned()
            .ok_or_else(|| UpdateError::Download(format!("{}: 404 Not Found", package)))?;

        fs::write(dest, &payload)
            .await
            .map_err(|e| UpdateError::Download(format!("failed to write {}: {}", dest.display(), e)))?;
        debug!(package = %package, bytes = payload.len(), "Mock package fetched");
        let hook = lock(&self.after_fetch).take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }
}

/// Unpacks packages produced by [`MockPackageStore`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MockExtractor;

#[async_trait]
impl ArchiveExtractor for MockExtractor {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let raw = fs::read(archive)
            .await
            .map_err(|e| UpdateError::Extraction(format!("failed to read archive: {}", e)))?;
        let files: BTreeMap<String, Vec<u8>> = serde_json::from_slice(&raw)
            .map_err(|e| UpdateError::Extraction(format!("unrecognized archive format: {}", e)))?;

        for (rel, contents) in files {
            let path = dest.join(&rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| UpdateError::Extraction(format!("{}: {}", rel, e)))?;
            }
            fs::write(&path, contents)
                .await
                .map_err(|e| UpdateError::Extraction(format!("{}: {}", rel, e)))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AgentState {
    running: bool,
    running_version: Option<Version>,
    busy: bool,
    unhealthy: HashSet<Version>,
    ignore_stop: bool,
    fail_start: bool,
    starts: usize,
    stops: usize,
    kills: usize,
}

/// Fake agent process plus its service manager.
///
/// When bound to a layout, `start` reads the installed version file, so the
/// "running" version follows whatever the installer put on disk.
pub struct MockAgent {
    version_file: Option<PathBuf>,
    state: Mutex<AgentState>,
}

impl MockAgent {
    /// Running agent reporting `version`, not bound to any directory.
    pub fn running(version: &str) -> Self {
        Self {
            version_file: None,
            state: Mutex::new(AgentState {
                running: true,
                running_version: parse_version(version).ok(),
                ..Default::default()
            }),
        }
    }

    /// Running agent whose version is read from the layout's version file.
    pub fn for_layout(layout: &HostLayout) -> Self {
        let version_file = layout.version_file_path();
        let running_version = read_version(&version_file);
        Self {
            version_file: Some(version_file),
            state: Mutex::new(AgentState {
                running: true,
                running_version,
                ..Default::default()
            }),
        }
    }

    pub fn set_busy(&self, busy: bool) {
        lock(&self.state).busy = busy;
    }

    /// Make the agent report unhealthy whenever it runs `version`.
    pub fn set_unhealthy_version(&self, version: &str) {
        if let Ok(v) = parse_version(version) {
            lock(&self.state).unhealthy.insert(v);
        }
    }

    /// Ignore graceful stop requests; only `kill` ends the process.
    pub fn set_ignore_stop(&self, ignore: bool) {
        lock(&self.state).ignore_stop = ignore;
    }

    pub fn set_fail_start(&self, fail: bool) {
        lock(&self.state).fail_start = fail;
    }

    /// Simulate the process dying outside the orchestrator's control.
    pub fn crash(&self) {
        lock(&self.state).running = false;
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn running_version(&self) -> Option<Version> {
        let state = lock(&self.state);
        state.running.then(|| state.running_version.clone()).flatten()
    }

    pub fn start_count(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }

    pub fn kill_count(&self) -> usize {
        lock(&self.state).kills
    }
}

fn read_version(path: &Path) -> Option<Version> {
    std::fs::read_to_string(path).ok().and_then(|v| parse_version(&v).ok())
}

#[async_trait]
impl ServiceController for MockAgent {
    fn name(&self) -> &str {
        "mock-agent"
    }

    async fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.starts += 1;
        if state.fail_start {
            return Err(UpdateError::ServiceControl("mock-agent: start refused".to_string()));
        }
        if let Some(path) = &self.version_file {
            state.running_version = read_version(path);
        }
        state.running = true;
        info!(version = ?state.running_version, "Mock agent started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.stops += 1;
        if !state.ignore_stop {
            state.running = false;
            state.busy = false;
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.kills += 1;
        state.running = false;
        state.busy = false;
        Ok(())
    }

    async fn status(&self) -> Result<ServiceState> {
        Ok(if lock(&self.state).running {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        })
    }
}

#[async_trait]
impl AgentProbe for MockAgent {
    async fn is_busy(&self) -> Result<bool> {
        let state = lock(&self.state);
        Ok(state.running && state.busy)
    }

    async fn health(&self) -> Result<AgentHealth> {
        let state = lock(&self.state);
        if !state.running {
            return Ok(AgentHealth {
                healthy: false,
                version: None,
            });
        }
        let healthy = state
            .running_version
            .as_ref()
            .map(|v| !state.unhealthy.contains(v))
            .unwrap_or(true);
        Ok(AgentHealth {
            healthy,
            version: state.running_version.clone(),
        })
    }
}
