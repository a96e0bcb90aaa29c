// crates/core/src/registry.rs
//
// Scan the hashtab directory, group device hashtabs by OS version, and
// detect on-disk changes by comparing modification times.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::RegistryError;
use crate::hashtab::Hashtab;

/// Default minimum spacing between two on-disk change scans.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One OS version and the devices that have a hashtab for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    /// Sorted ascending.
    pub devices: Vec<String>,
    pub device_count: usize,
}

/// In-memory index of every hashtab under the registry root.
pub struct SourceRegistry {
    dir: PathBuf,
    reload_interval: Duration,
    state: RwLock<RegistryState>,
    /// Held for the whole of `check_and_reload`, so concurrent checks
    /// serialize and share one rate-limit window.
    last_reload_check: Mutex<Option<Instant>>,
}

#[derive(Default)]
struct RegistryState {
    hashtabs: Vec<Arc<Hashtab>>,
    path_by_name: HashMap<String, PathBuf>,
    /// Each list is sorted by device, then file name.
    by_version: HashMap<String, Vec<Arc<Hashtab>>>,
    /// Every regular file seen by the last scan, parseable or not.
    mod_times: HashMap<PathBuf, SystemTime>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("SourceRegistry")
            .field("dir", &self.dir)
            .field("hashtab_count", &state.hashtabs.len())
            .field("version_count", &state.by_version.len())
            .finish()
    }
}

impl SourceRegistry {
    /// Open the registry rooted at `dir` and load everything under it.
    ///
    /// A missing directory is created and yields an empty registry. Failing
    /// to walk an existing directory is fatal.
    pub fn open(dir: impl Into<PathBuf>, reload_interval: Duration) -> Result<Self, RegistryError> {
        let dir = dir.into();
        let registry = Self {
            dir,
            reload_interval,
            state: RwLock::new(RegistryState::default()),
            last_reload_check: Mutex::new(None),
        };

        if !registry.dir.exists() {
            warn!(dir = %registry.dir.display(), "Hashtab directory does not exist");
            std::fs::create_dir_all(&registry.dir).map_err(|source| RegistryError::CreateDir {
                path: registry.dir.clone(),
                source,
            })?;
            info!(dir = %registry.dir.display(), "Created hashtab directory");
            return Ok(registry);
        }

        registry.load()?;
        Ok(registry)
    }

    /// Rebuild the whole index from disk.
    ///
    /// Unparseable files are logged and skipped; duplicates by base name
    /// keep the first file in walk order.
    pub fn load(&self) -> Result<usize, RegistryError> {
        let fresh = build_state(&self.dir)?;
        let count = fresh.hashtabs.len();
        *self.write_state() = fresh;
        Ok(count)
    }

    /// Reload if anything under the root was added, removed or touched.
    ///
    /// Runs at most once per reload interval; calls inside the window
    /// return `false` without touching the disk. Walk errors are logged and
    /// reported as "no change".
    pub fn check_and_reload(&self) -> bool {
        let mut last_check = self.lock_last_check();
        if let Some(at) = *last_check {
            if at.elapsed() < self.reload_interval {
                return false;
            }
        }
        *last_check = Some(Instant::now());

        let current = match scan_mod_times(&self.dir) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Hashtab change scan failed; keeping current index");
                return false;
            }
        };

        if current == self.read_state().mod_times {
            debug!(files = current.len(), "No hashtab changes");
            return false;
        }

        info!(dir = %self.dir.display(), "Detected hashtab changes, reloading");
        match self.load() {
            Ok(count) => {
                info!(hashtabs = count, "Reload complete");
                true
            }
            Err(e) => {
                warn!(error = %e, "Hashtab reload failed; keeping current index");
                false
            }
        }
    }

    /// [`check_and_reload`](Self::check_and_reload) on the blocking pool.
    ///
    /// The scan walks and stats the whole root, and a reload parses every
    /// file, so async callers go through here.
    pub async fn refresh(self: &Arc<Self>) -> bool {
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || registry.check_and_reload())
            .await
            .unwrap_or_default()
    }

    /// All versions, newest first by plain string comparison.
    pub fn versions(&self) -> Vec<VersionInfo> {
        let state = self.read_state();
        let mut versions: Vec<VersionInfo> = state
            .by_version
            .iter()
            .map(|(version, hts)| {
                let mut devices: Vec<String> = hts.iter().map(|ht| ht.device.clone()).collect();
                devices.sort();
                VersionInfo {
                    version: version.clone(),
                    device_count: devices.len(),
                    devices,
                }
            })
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        versions
    }

    /// Hashtabs for `version` in stable device order; empty if unknown.
    pub fn hashtabs_for_version(&self, version: &str) -> Vec<Arc<Hashtab>> {
        self.read_state()
            .by_version
            .get(version)
            .cloned()
            .unwrap_or_default()
    }

    /// Every loaded hashtab, in walk order.
    pub fn hashtabs(&self) -> Vec<Arc<Hashtab>> {
        self.read_state().hashtabs.clone()
    }

    /// Look up a hashtab by base file name.
    pub fn hashtab(&self, name: &str) -> Option<Arc<Hashtab>> {
        let state = self.read_state();
        let path = state.path_by_name.get(name)?;
        state.hashtabs.iter().find(|ht| &ht.path == path).cloned()
    }

    /// Copy of the path → mtime map from the last load.
    pub fn mod_times(&self) -> HashMap<PathBuf, SystemTime> {
        self.read_state().mod_times.clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| {
            error!("RwLock poisoned reading hashtab registry: {e}");
            e.into_inner()
        })
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| {
            error!("RwLock poisoned writing hashtab registry: {e}");
            e.into_inner()
        })
    }

    fn lock_last_check(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_reload_check.lock().unwrap_or_else(|e| {
            error!("Mutex poisoned in hashtab reload check: {e}");
            e.into_inner()
        })
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Regular, non-hidden files under `dir` in deterministic order.
fn walk_files(dir: &Path) -> impl Iterator<Item = Result<DirEntry, RegistryError>> + '_ {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(move |res| match res {
            Ok(entry) if entry.file_type().is_file() => Some(Ok(entry)),
            Ok(_) => None,
            Err(source) => Some(Err(RegistryError::Walk {
                path: dir.to_path_buf(),
                source,
            })),
        })
}

fn scan_mod_times(dir: &Path) -> Result<HashMap<PathBuf, SystemTime>, RegistryError> {
    let mut mod_times = HashMap::new();
    for entry in walk_files(dir) {
        let entry = entry?;
        // Files that vanish between readdir and stat are simply absent.
        if let Ok(modified) = entry.metadata().map_err(std::io::Error::from).and_then(|m| m.modified()) {
            mod_times.insert(entry.into_path(), modified);
        }
    }
    Ok(mod_times)
}

fn build_state(dir: &Path) -> Result<RegistryState, RegistryError> {
    let mut state = RegistryState::default();

    for entry in walk_files(dir) {
        let entry = entry?;
        let path = entry.path();

        if let Ok(modified) = entry.metadata().map_err(std::io::Error::from).and_then(|m| m.modified()) {
            state.mod_times.insert(path.to_path_buf(), modified);
        }

        let filename = entry.file_name().to_string_lossy().into_owned();
        if let Some(existing) = state.path_by_name.get(&filename) {
            warn!(
                path = %path.display(),
                existing = %existing.display(),
                "Skipping duplicate hashtab file"
            );
            continue;
        }

        let ht = match Hashtab::load(path) {
            Ok(ht) => ht,
            Err(e) => {
                error!(file = %filename, error = %e, "Failed to load hashtab");
                continue;
            }
        };

        info!(
            file = %filename,
            format = %ht.format,
            entries = ht.entry_count,
            version = %ht.version,
            device = %ht.device,
            "Loaded hashtab"
        );

        let ht = Arc::new(ht);
        state.path_by_name.insert(filename, ht.path.clone());
        state
            .by_version
            .entry(ht.version.clone())
            .or_default()
            .push(Arc::clone(&ht));
        state.hashtabs.push(ht);
    }

    for hts in state.by_version.values_mut() {
        hts.sort_by(|a, b| a.device.cmp(&b.device).then_with(|| a.name.cmp(&b.name)));
    }

    Ok(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashtab::HashtabFormat;
    use pretty_assertions::assert_eq;
    use std::fs::{self, File, FileTimes};

    fn write_hashtab(dir: &Path, name: &str, version: &str, device: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let bytes = Hashtab::encode(HashtabFormat::Hashtab, version, device, &[(1, "Item"), (2, "anchors")]).unwrap();
        fs::write(&path, bytes).unwrap();
        path
    }

    fn set_mtime(path: &Path, t: SystemTime) {
        let f = File::options().write(true).open(path).unwrap();
        f.set_times(FileTimes::new().set_modified(t)).unwrap();
    }

    #[test]
    fn open_creates_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("hashtables");
        let reg = SourceRegistry::open(&dir, Duration::ZERO).unwrap();
        assert!(dir.is_dir());
        assert!(reg.versions().is_empty());
        assert!(reg.hashtabs().is_empty());
    }

    #[test]
    fn groups_by_version_and_sorts_devices() {
        let tmp = tempfile::tempdir().unwrap();
        for dev in ["rmppm", "rm1", "rmpp", "rm2"] {
            write_hashtab(tmp.path(), &format!("3.25.0.140-{dev}"), "3.25.0.140", dev);
        }
        write_hashtab(tmp.path(), "nested/3.22.0.64-rm2", "3.22.0.64", "rm2");

        let reg = SourceRegistry::open(tmp.path(), Duration::ZERO).unwrap();
        let versions = reg.versions();

        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, "3.25.0.140");
        assert_eq!(versions[0].device_count, 4);
        assert_eq!(versions[0].devices, vec!["rm1", "rm2", "rmpp", "rmppm"]);
        assert_eq!(versions[1].version, "3.22.0.64");

        let devices: Vec<String> = reg
            .hashtabs_for_version("3.25.0.140")
            .iter()
            .map(|ht| ht.device.clone())
            .collect();
        assert_eq!(devices, vec!["rm1", "rm2", "rmpp", "rmppm"]);
        assert!(reg.hashtabs_for_version("9.9.9").is_empty());
    }

    #[test]
    fn bad_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_hashtab(tmp.path(), "good", "3.25.0.140", "rm2");
        fs::write(tmp.path().join("garbage"), b"not a hashtab").unwrap();
        fs::write(tmp.path().join(".DS_Store"), b"junk").unwrap();

        let reg = SourceRegistry::open(tmp.path(), Duration::ZERO).unwrap();
        assert_eq!(reg.hashtabs().len(), 1);
        assert!(reg.hashtab("good").is_some());
        assert!(reg.hashtab("garbage").is_none());
        // Unparseable files are still tracked so they don't trigger reloads forever.
        assert_eq!(reg.mod_times().len(), 2);
        assert!(!reg.check_and_reload());
    }

    #[test]
    fn duplicate_basename_first_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let first = write_hashtab(tmp.path(), "a/3.25-rm2", "3.25.0.140", "rm2");
        write_hashtab(tmp.path(), "b/3.25-rm2", "3.25.0.999", "rm2");

        let reg = SourceRegistry::open(tmp.path(), Duration::ZERO).unwrap();
        assert_eq!(reg.hashtabs().len(), 1);
        let ht = reg.hashtab("3.25-rm2").unwrap();
        assert_eq!(ht.path, first);
        assert_eq!(ht.version, "3.25.0.140");
    }

    #[test]
    fn check_and_reload_detects_add_touch_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let rm1 = write_hashtab(tmp.path(), "3.25-rm1", "3.25.0.140", "rm1");
        let reg = SourceRegistry::open(tmp.path(), Duration::ZERO).unwrap();

        assert!(!reg.check_and_reload());

        write_hashtab(tmp.path(), "3.25-rm2", "3.25.0.140", "rm2");
        assert!(reg.check_and_reload());
        assert_eq!(reg.versions()[0].device_count, 2);

        set_mtime(&rm1, SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000));
        assert!(reg.check_and_reload());
        assert!(!reg.check_and_reload());

        fs::remove_file(&rm1).unwrap();
        assert!(reg.check_and_reload());
        assert_eq!(reg.versions()[0].devices, vec!["rm2"]);
    }

    #[test]
    fn check_and_reload_is_rate_limited() {
        let tmp = tempfile::tempdir().unwrap();
        write_hashtab(tmp.path(), "3.25-rm1", "3.25.0.140", "rm1");
        let reg = SourceRegistry::open(tmp.path(), Duration::from_secs(3600)).unwrap();

        // First check always scans.
        assert!(!reg.check_and_reload());

        write_hashtab(tmp.path(), "3.25-rm2", "3.25.0.140", "rm2");
        assert!(!reg.check_and_reload());
        assert_eq!(reg.versions()[0].device_count, 1);
    }

    #[tokio::test]
    async fn refresh_runs_scan_off_the_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        write_hashtab(tmp.path(), "3.25-rm1", "3.25.0.140", "rm1");
        let reg = Arc::new(SourceRegistry::open(tmp.path(), Duration::ZERO).unwrap());

        assert!(!reg.refresh().await);
        write_hashtab(tmp.path(), "3.25-rm2", "3.25.0.140", "rm2");
        assert!(reg.refresh().await);
        assert_eq!(reg.versions()[0].devices, vec!["rm1", "rm2"]);
    }

    #[test]
    fn scan_error_is_no_change() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("hashtables");
        write_hashtab(&dir, "3.25-rm1", "3.25.0.140", "rm1");
        let reg = SourceRegistry::open(&dir, Duration::ZERO).unwrap();

        fs::remove_dir_all(&dir).unwrap();
        assert!(!reg.check_and_reload());
        assert_eq!(reg.hashtabs().len(), 1);
    }

    #[test]
    fn version_info_serializes_camel_case() {
        let info = VersionInfo {
            version: "3.25.0.140".into(),
            devices: vec!["rm1".into()],
            device_count: 1,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"deviceCount\":1"));
    }
}
