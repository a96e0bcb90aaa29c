// crates/core/src/gcd.rs
//! GCD hashtab cache.
//!
//! For each OS version the cache keeps one merged ("greatest common
//! denominator") hashtab built from every device hashtab of that version.
//! Entries are created lazily and replaced wholesale once any source file
//! is added, removed or touched.
//!
//! Concurrent requests for the same version are coalesced: callers queue on
//! a per-version async mutex and, once inside, re-validate before doing any
//! work, so only the first caller runs the merge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::engine::HashEngine;
use crate::error::CacheError;
use crate::registry::{SourceRegistry, VersionInfo};

/// File extension of merged hashtabs under the cache root.
const GCD_EXT: &str = "gcd";

/// A resolved GCD hashtab and the source state it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcdHashtab {
    pub version: String,
    pub path: PathBuf,
    pub device_count: usize,
    /// mtime of every source hashtab at derivation time.
    pub source_mod_times: HashMap<PathBuf, SystemTime>,
    pub generated_at: SystemTime,
}

pub struct GcdCache {
    gcd_dir: PathBuf,
    registry: Arc<SourceRegistry>,
    engine: Arc<dyn HashEngine>,
    entries: RwLock<HashMap<String, Arc<GcdHashtab>>>,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for GcdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcdCache")
            .field("gcd_dir", &self.gcd_dir)
            .field("engine", &self.engine.name())
            .field("entries", &self.read_entries().len())
            .finish()
    }
}

impl GcdCache {
    /// Create the cache, making sure `gcd_dir` exists.
    pub fn new(
        gcd_dir: impl Into<PathBuf>,
        registry: Arc<SourceRegistry>,
        engine: Arc<dyn HashEngine>,
    ) -> Result<Self, CacheError> {
        let gcd_dir = gcd_dir.into();
        std::fs::create_dir_all(&gcd_dir).map_err(|source| CacheError::CreateDir {
            path: gcd_dir.clone(),
            source,
        })?;
        Ok(Self {
            gcd_dir,
            registry,
            engine,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        })
    }

    /// Derive every version the registry knows about.
    ///
    /// Failures are logged per version and do not stop the others. Returns
    /// the number of versions that succeeded.
    pub async fn generate_all(&self) -> usize {
        let versions = self.registry.versions();
        info!(versions = versions.len(), "Generating GCD hashtabs");

        let mut ok = 0;
        for v in versions {
            match self.generate(&v.version).await {
                Ok(_) => ok += 1,
                Err(e) => error!(version = %v.version, error = %e, "Failed to generate GCD hashtab"),
            }
        }
        ok
    }

    /// Unconditionally (re)derive the GCD hashtab for `version`.
    pub async fn generate(&self, version: &str) -> Result<Arc<GcdHashtab>, CacheError> {
        let _flight = self.enter(version).await;
        self.generate_locked(version).await
    }

    /// Path of an up-to-date GCD hashtab for `version`, deriving it if the
    /// cached one is missing or stale.
    pub async fn get_or_refresh(&self, version: &str) -> Result<PathBuf, CacheError> {
        let _flight = self.enter(version).await;

        if self.registry.refresh().await {
            return Ok(self.generate_locked(version).await?.path.clone());
        }

        match self.valid_entry(version).await {
            Some(entry) => {
                debug!(version, path = %entry.path.display(), "GCD hashtab cache hit");
                Ok(entry.path.clone())
            }
            None => Ok(self.generate_locked(version).await?.path.clone()),
        }
    }

    /// Current cache entry for `version`, without validation.
    pub fn get(&self, version: &str) -> Option<Arc<GcdHashtab>> {
        self.read_entries().get(version).cloned()
    }

    pub fn versions(&self) -> Vec<VersionInfo> {
        self.registry.versions()
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Where the merged hashtab for `version` is written.
    pub fn gcd_path(&self, version: &str) -> PathBuf {
        let file = version.replace(['/', '\\'], "_");
        self.gcd_dir.join(format!("{file}.{GCD_EXT}"))
    }

    // -- Derivation -----------------------------------------------------------

    async fn generate_locked(&self, version: &str) -> Result<Arc<GcdHashtab>, CacheError> {
        let hashtabs = self.registry.hashtabs_for_version(version);
        if hashtabs.is_empty() {
            self.write_entries().remove(version);
            return Err(CacheError::NotFound {
                version: version.to_string(),
            });
        }

        let source_mod_times = mod_times(hashtabs.iter().map(|ht| ht.path.clone()).collect()).await;

        let path = if let [only] = hashtabs.as_slice() {
            info!(version, path = %only.path.display(), "Only one device hashtab, using it directly");
            only.path.clone()
        } else {
            let output = self.gcd_path(version);
            let inputs: Vec<PathBuf> = hashtabs.iter().map(|ht| ht.path.clone()).collect();
            info!(version, devices = inputs.len(), engine = self.engine.name(), "Generating GCD hashtab");

            if let Err(e) = self.engine.merge_hashtabs(&output, &inputs).await {
                self.write_entries().remove(version);
                discard(&output).await;
                return Err(e.into());
            }
            info!(version, path = %output.display(), "Generated GCD hashtab");
            output
        };

        let entry = Arc::new(GcdHashtab {
            version: version.to_string(),
            path,
            device_count: hashtabs.len(),
            source_mod_times,
            generated_at: SystemTime::now(),
        });
        self.write_entries()
            .insert(version.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// The cached entry, if it still matches the registry's current sources.
    async fn valid_entry(&self, version: &str) -> Option<Arc<GcdHashtab>> {
        let entry = self.get(version)?;
        let hashtabs = self.registry.hashtabs_for_version(version);

        if hashtabs.len() != entry.device_count {
            debug!(version, cached = entry.device_count, current = hashtabs.len(), "Device count changed");
            return None;
        }

        let current = mod_times(hashtabs.iter().map(|ht| ht.path.clone()).collect()).await;
        for ht in &hashtabs {
            // An unreadable source is left for the next registry reload to drop.
            let Some(current) = current.get(&ht.path) else {
                continue;
            };
            if entry.source_mod_times.get(&ht.path) != Some(current) {
                debug!(version, path = %ht.path.display(), "Source hashtab modified");
                return None;
            }
        }

        Some(entry)
    }

    // -- Single-flight --------------------------------------------------------

    async fn enter(&self, version: &str) -> Flight<'_> {
        let lock = Arc::clone(self.lock_flights().entry(version.to_string()).or_default());
        let guard = lock.lock_owned().await;
        Flight {
            cache: self,
            version: version.to_string(),
            guard: Some(guard),
        }
    }

    // -- Locks ----------------------------------------------------------------

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<GcdHashtab>>> {
        self.entries.read().unwrap_or_else(|e| {
            error!("RwLock poisoned reading GCD cache: {e}");
            e.into_inner()
        })
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<GcdHashtab>>> {
        self.entries.write().unwrap_or_else(|e| {
            error!("RwLock poisoned writing GCD cache: {e}");
            e.into_inner()
        })
    }

    fn lock_flights(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.flights.lock().unwrap_or_else(|e| {
            error!("Mutex poisoned in GCD flight map: {e}");
            e.into_inner()
        })
    }
}

/// Exclusive right to derive one version. Dropping it wakes the next
/// waiter, or forgets the version's lock if nobody is waiting.
struct Flight<'a> {
    cache: &'a GcdCache,
    version: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut flights = self.cache.lock_flights();
        if flights
            .get(&self.version)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            flights.remove(&self.version);
        }
    }
}

/// mtime of each readable path, stat'ed on the blocking pool.
async fn mod_times(paths: Vec<PathBuf>) -> HashMap<PathBuf, SystemTime> {
    tokio::task::spawn_blocking(move || {
        paths
            .into_iter()
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((path, modified))
            })
            .collect()
    })
    .await
    .unwrap_or_default()
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial GCD hashtab");
        }
    }
}
