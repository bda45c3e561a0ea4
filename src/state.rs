//! Persisted per-user state.
//!
//! Three files live under the XDG state directory: the displays cache
//! (last-known tuning values per EDID identity), the DSA statistics
//! (rolling counters and final multiplier), and the capabilities cache
//! (raw capabilities string per EDID identity). Files are rewritten
//! atomically: serialized to a temporary sibling, then renamed over the
//! target.

use {
    crate::{
        error::{DdcResult, Error, Status},
        sleep::SleepSnapshot,
    },
    log::{debug, warn},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::{collections::BTreeMap, fs, path::PathBuf},
};

const DISPLAYS_FILE: &str = "displays.json";
const DSA_FILE: &str = "dsa.json";
const CAPABILITIES_FILE: &str = "capabilities.json";

const CACHE_VERSION: u32 = 1;

/// Last-known tuning values for one display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayTuning {
    /// The sleep multiplier in effect when the display was last seen.
    pub sleep_multiplier: f64,
}

/// The displays cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplaysCache {
    /// Format version.
    pub version: u32,
    /// Tuning values keyed by EDID identity.
    pub displays: BTreeMap<String, DisplayTuning>,
}

/// The DSA statistics file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DsaStats {
    /// Format version.
    pub version: u32,
    /// Counters keyed by EDID identity.
    pub displays: BTreeMap<String, SleepSnapshot>,
}

/// The capabilities cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesCache {
    /// Format version.
    pub version: u32,
    /// Raw capabilities strings keyed by EDID identity.
    pub capabilities: BTreeMap<String, String>,
}

/// Handle on the per-user state directory.
///
/// A store without a directory (no resolvable home, or caching disabled)
/// loads defaults and discards writes.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: Option<PathBuf>,
}

impl StateStore {
    /// Resolve the default per-user state directory.
    pub fn new() -> Self {
        let dir = directories::BaseDirs::new().map(|base| {
            base.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| base.data_local_dir().to_path_buf())
                .join("ddcci")
        });
        if dir.is_none() {
            warn!("no home directory; persisted state disabled");
        }
        StateStore { dir }
    }

    /// A store rooted at an explicit directory.
    pub fn with_dir(dir: PathBuf) -> Self {
        StateStore { dir: Some(dir) }
    }

    /// A store that never touches disk.
    pub fn disabled() -> Self {
        StateStore { dir: None }
    }

    fn load<T: DeserializeOwned + Default>(&self, name: &str) -> DdcResult<T> {
        let Some(dir) = &self.dir else {
            return Ok(T::default());
        };
        let path = dir.join(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(Error::new(
                    Status::BadConfiguration,
                    "state::load",
                    format!("read {}: {}", path.display(), e),
                ))
            },
        };
        serde_json::from_str(&text).map_err(|e| {
            Error::new(
                Status::BadConfiguration,
                "state::load",
                format!("parse {}: {}", path.display(), e),
            )
        })
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> DdcResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let site = "state::save";
        let io_err = |what: String, e: std::io::Error| {
            Error::new(Status::CommunicationFailed, site, format!("{}: {}", what, e))
        };
        fs::create_dir_all(dir).map_err(|e| io_err(format!("create {}", dir.display()), e))?;
        let path = dir.join(name);
        let tmp = dir.join(format!("{}.tmp.{}", name, std::process::id()));
        let text = serde_json::to_string_pretty(value).map_err(|e| {
            Error::new(Status::InvalidArgument, site, format!("serialize {}: {}", name, e))
        })?;
        fs::write(&tmp, text).map_err(|e| io_err(format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err(format!("rename to {}", path.display()), e))?;
        debug!("saved {}", path.display());
        Ok(())
    }

    /// Load the displays cache.
    pub fn load_displays(&self) -> DdcResult<DisplaysCache> {
        self.load(DISPLAYS_FILE)
    }

    /// Save the displays cache.
    pub fn save_displays(&self, cache: &DisplaysCache) -> DdcResult<()> {
        let mut cache = cache.clone();
        cache.version = CACHE_VERSION;
        self.save(DISPLAYS_FILE, &cache)
    }

    /// Load the DSA statistics.
    pub fn load_dsa(&self) -> DdcResult<DsaStats> {
        self.load(DSA_FILE)
    }

    /// Save the DSA statistics.
    pub fn save_dsa(&self, stats: &DsaStats) -> DdcResult<()> {
        let mut stats = stats.clone();
        stats.version = CACHE_VERSION;
        self.save(DSA_FILE, &stats)
    }

    /// Load the capabilities cache.
    pub fn load_capabilities(&self) -> DdcResult<CapabilitiesCache> {
        self.load(CAPABILITIES_FILE)
    }

    /// Save the capabilities cache.
    pub fn save_capabilities(&self, cache: &CapabilitiesCache) -> DdcResult<()> {
        let mut cache = cache.clone();
        cache.version = CACHE_VERSION;
        self.save(CAPABILITIES_FILE, &cache)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_store() -> StateStore {
        let dir = std::env::temp_dir().join(format!(
            "ddcci-state-test-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        StateStore::with_dir(dir)
    }

    #[test]
    fn missing_files_load_default() {
        let store = temp_store();
        assert!(store.load_displays().unwrap().displays.is_empty());
        assert!(store.load_dsa().unwrap().displays.is_empty());
        assert!(store.load_capabilities().unwrap().capabilities.is_empty());
    }

    #[test]
    fn round_trip() {
        let store = temp_store();
        let mut cache = DisplaysCache::default();
        cache.displays.insert(
            "ACM/M1/SN001".into(),
            DisplayTuning {
                sleep_multiplier: 2.25,
            },
        );
        store.save_displays(&cache).unwrap();

        let loaded = store.load_displays().unwrap();
        assert_eq!(loaded.version, CACHE_VERSION);
        assert_eq!(loaded.displays["ACM/M1/SN001"].sleep_multiplier, 2.25);
    }

    #[test]
    fn corrupt_file_is_bad_configuration() {
        let store = temp_store();
        store.save_capabilities(&CapabilitiesCache::default()).unwrap();
        let dir = store.dir.clone().unwrap();
        fs::write(dir.join(CAPABILITIES_FILE), "{ not json").unwrap();
        assert_eq!(
            store.load_capabilities().unwrap_err().status,
            Status::BadConfiguration
        );
    }

    #[test]
    fn disabled_store_is_inert() {
        let store = StateStore::disabled();
        store
            .save_dsa(&DsaStats::default())
            .unwrap();
        assert!(store.load_dsa().unwrap().displays.is_empty());
    }
}
